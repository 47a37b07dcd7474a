//! Chunked-tape core for reverse-mode automatic differentiation.
//!
//! During a forward execution every assignment to a tracked variable is
//! appended to a persistent trace together with its local partial
//! derivatives. A later reverse sweep walks the trace backward, seeding
//! output sensitivities into an adjoint vector and accumulating input
//! sensitivities in a single linear pass.
//!
//! Two tapes are offered, differing only in how variable indices are
//! assigned:
//!
//! - [`LinearTape`]: every statement gets a fresh, monotonically
//!   increasing index. Fastest recording; the adjoint vector grows with
//!   the statement count.
//! - [`ReuseTape`]: indices of dead variables are recycled through a free
//!   list, bounding the adjoint vector by the live working set.
//!
//! Both store their trace in nested chunked logs
//! ([`chunk_vector::ChunkVector`]) with O(1) append, O(1) position
//! snapshots, and O(1) rewind, and both can interleave user callbacks
//! ([`external::ExternalFunction`]) with the recorded statements.
//!
//! Expression front ends drive the tapes through the [`Expression`] and
//! [`JacobiSink`] traits; this crate deliberately contains no operator
//! overloading of its own.

pub mod adjoints;
pub mod chunk;
pub mod chunk_vector;
pub mod expr;
pub mod external;
pub mod float;
pub mod index;
pub mod linear_tape;
pub mod reuse_tape;

pub use adjoints::AdjointVector;
pub use chunk_vector::{ChunkPosition, ChunkVector};
pub use expr::{Expression, JacobiSink};
pub use external::ExternalFunction;
pub use float::Float;
pub use index::{ArgCount, Index};
pub use linear_tape::LinearTape;
pub use reuse_tape::ReuseTape;

/// Default capacity, in records, of jacobian and statement chunks.
pub const DEFAULT_CHUNK_SIZE: usize = 1 << 22;

/// Default capacity, in records, of external-function chunks.
pub const DEFAULT_EXTERNAL_FUNCTION_CHUNK_SIZE: usize = 1000;

/// Type alias for the linear-index tape over `f64`.
pub type LinearTape64 = LinearTape<f64>;
/// Type alias for the linear-index tape over `f32`.
pub type LinearTape32 = LinearTape<f32>;
/// Type alias for the index-reuse tape over `f64`.
pub type ReuseTape64 = ReuseTape<f64>;
/// Type alias for the index-reuse tape over `f32`.
pub type ReuseTape32 = ReuseTape<f32>;
