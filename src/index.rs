//! Variable-index policies.
//!
//! Every tracked variable is named by a nonzero [`Index`] into the adjoint
//! vector; index 0 is the permanent "inactive" sentinel. [`ExpressionCounter`]
//! issues fresh monotonically increasing indices (one per recorded statement)
//! and doubles as the innermost log terminator of [`crate::LinearTape`].
//! [`IndexPool`] recycles released indices through a LIFO free list, bounding
//! the adjoint vector of [`crate::ReuseTape`] by the live working set.

/// Identifier of a tracked variable's adjoint slot. 0 means "inactive".
pub type Index = u32;

/// Number of jacobian entries belonging to one statement.
pub type ArgCount = u8;

/// Monotonic statement counter; the linear tape's index policy and the
/// terminator of its log nesting.
///
/// Its "position" is simply the current count, which makes the count
/// rewindable together with the chunk logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExpressionCounter {
    count: Index,
}

impl ExpressionCounter {
    /// Current statement count. Equals the largest index issued so far.
    #[inline]
    pub fn count(&self) -> Index {
        self.count
    }

    /// The terminator position: the count itself.
    #[inline]
    pub fn position(&self) -> Index {
        self.count
    }

    /// Rewind the count to a previously observed position.
    #[inline]
    pub fn reset(&mut self, pos: Index) {
        self.count = pos;
    }

    /// Issue the next index.
    #[inline]
    pub fn next(&mut self) -> Index {
        self.count += 1;
        self.count
    }
}

/// Free-list index policy for the reuse tape.
///
/// Indices released by dying variables are recycled LIFO, so the maximum
/// issued index tracks the peak number of simultaneously live variables
/// rather than the number of recorded statements.
#[derive(Clone, Debug, Default)]
pub struct IndexPool {
    max_index: Index,
    free_indices: Vec<Index>,
}

impl IndexPool {
    /// Largest index ever issued. The adjoint vector must hold
    /// `max_index() + 1` slots to cover every live variable.
    #[inline]
    pub fn max_index(&self) -> Index {
        self.max_index
    }

    /// Ensure `index` names a live slot: an inactive (zero) index is
    /// assigned from the free list, or a fresh one if the list is empty.
    /// A nonzero index is kept as is.
    #[inline]
    pub fn check_index(&mut self, index: &mut Index) {
        if *index == 0 {
            *index = match self.free_indices.pop() {
                Some(recycled) => recycled,
                None => {
                    self.max_index += 1;
                    self.max_index
                }
            };
        }
    }

    /// Release `index` back to the free list and mark it inactive.
    /// Releasing an already inactive index does nothing.
    #[inline]
    pub fn free_index(&mut self, index: &mut Index) {
        if *index != 0 {
            self.free_indices.push(*index);
            *index = 0;
        }
    }

    /// Forget all issued indices and empty the free list.
    pub fn reset(&mut self) {
        self.max_index = 0;
        self.free_indices.clear();
    }
}
