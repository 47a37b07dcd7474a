use num_traits::Float as NumFloat;

/// Scalar type stored on a tape (`f32` or `f64`).
///
/// The tapes ask little of their scalar: zero and one for seeds and unit
/// partials, `is_finite` for the invalid-jacobian filter, and the plain
/// arithmetic and comparisons of the multiply-accumulate sweep — all of
/// which [`num_traits::Float`] carries. The `'static` bound is required so
/// external-function records can mention the scalar inside their boxed
/// callbacks.
pub trait Float: NumFloat + 'static {}

impl Float for f32 {}
impl Float for f64 {}
