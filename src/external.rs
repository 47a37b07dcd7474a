//! User callbacks interleaved with the recorded statements.
//!
//! An external function is invoked by the reverse sweep at exactly the
//! point where it was registered: every statement recorded after it has
//! already been propagated when the callback runs. The tape owns the
//! callback and whatever state it captures; discarding the record — by
//! rewind or by dropping the tape — releases that state exactly once
//! through the closure's `Drop`.

use crate::adjoints::AdjointVector;
use crate::chunk::Chunk2;
use crate::chunk_vector::{ChunkPosition, ChunkVector};
use crate::float::Float;

/// One registered callback.
///
/// The closure receives the adjoint vector read-only; re-entering the tape
/// in any other way from inside a callback is not supported.
pub struct ExternalFunction<F: Float> {
    call: Box<dyn FnMut(&AdjointVector<F>)>,
}

impl<F: Float> ExternalFunction<F> {
    pub fn new(call: impl FnMut(&AdjointVector<F>) + 'static) -> Self {
        ExternalFunction {
            call: Box::new(call),
        }
    }

    /// Wrap a plain function and the state it operates on. The tape takes
    /// ownership of `data`; its `Drop` runs when the record is discarded.
    pub fn with_data<D: 'static>(call: fn(&mut D, &AdjointVector<F>), mut data: D) -> Self {
        ExternalFunction {
            call: Box::new(move |adjoints| call(&mut data, adjoints)),
        }
    }

    #[inline]
    pub(crate) fn invoke(&mut self, adjoints: &AdjointVector<F>) {
        (self.call)(adjoints);
    }
}

/// Append log of external functions.
///
/// Each record carries the statement-log position observed at push time —
/// the boundary up to which the reverse sweep must replay statements
/// before handing control to the callback. `P` is that position type.
pub struct ExternalFunctionLog<F: Float, P> {
    log: ChunkVector<Chunk2<ExternalFunction<F>, P>, P>,
}

impl<F: Float, P: Copy + Default> ExternalFunctionLog<F, P> {
    pub fn new(chunk_size: usize) -> Self {
        ExternalFunctionLog {
            log: ChunkVector::new(chunk_size),
        }
    }

    pub fn set_chunk_size(&mut self, chunk_size: usize) {
        self.log.set_chunk_size(chunk_size);
    }

    /// Append a callback together with the current statement boundary.
    pub fn push(&mut self, function: ExternalFunction<F>, boundary: P) {
        self.log.reserve_items(1, boundary);
        self.log.push((function, boundary));
    }

    #[inline]
    pub fn position(&self, inner: P) -> ChunkPosition<P> {
        self.log.position(inner)
    }

    /// Rewind to `pos`. Records above it are dropped, which runs each
    /// callback's release hook exactly once.
    pub fn reset(&mut self, pos: &ChunkPosition<P>) {
        self.log.reset(pos);
    }

    pub fn len(&self) -> usize {
        self.log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    /// Visit the records between `end` (exclusive) and `start` (inclusive
    /// of the record just below the head) in descending position order.
    pub fn for_each_reverse(
        &mut self,
        start: &ChunkPosition<P>,
        end: &ChunkPosition<P>,
        mut visit: impl FnMut(&mut ExternalFunction<F>, &P),
    ) {
        let mut chunk = start.chunk;
        loop {
            let hi = if chunk == start.chunk {
                start.data
            } else {
                self.log.chunk_used(chunk)
            };
            let lo = if chunk == end.chunk { end.data } else { 0 };
            for offset in (lo..hi).rev() {
                let (function, boundary) = self.log.chunk_mut(chunk).entry_mut(offset);
                visit(function, boundary);
            }
            if chunk == end.chunk {
                break;
            }
            chunk -= 1;
        }
    }
}
