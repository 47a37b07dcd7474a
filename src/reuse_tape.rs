//! Tape that recycles variable indices through a free list.
//!
//! Statements store their left-hand-side index explicitly, and indices of
//! dead variables return to an [`IndexPool`] for reassignment. The adjoint
//! vector is therefore bounded by the peak number of simultaneously live
//! variables instead of the statement count — the right trade for long
//! iterative computations over a small working set.
//!
//! Because an index may be reassigned by an earlier statement, the reverse
//! sweep zeroes each statement's output adjoint immediately after reading
//! it; with fresh indices this is unnecessary, which is why the sweep here
//! differs from [`crate::LinearTape`]'s.

use crate::adjoints::AdjointVector;
use crate::chunk::Chunk2;
use crate::chunk_vector::{ChunkPosition, ChunkVector};
use crate::expr::{Expression, JacobiSink};
use crate::external::{ExternalFunction, ExternalFunctionLog};
use crate::float::Float;
use crate::index::{ArgCount, Index, IndexPool};
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_EXTERNAL_FUNCTION_CHUNK_SIZE};

/// Position in the jacobian log; this nesting terminates here.
pub type DataPosition = ChunkPosition<()>;
/// Position in the statement log.
pub type StatementPosition = ChunkPosition<DataPosition>;
/// Position of the whole tape.
pub type Position = ChunkPosition<StatementPosition>;

type DataLog<F> = ChunkVector<Chunk2<F, Index>, ()>;
type StatementLog = ChunkVector<Chunk2<ArgCount, Index>, DataPosition>;
type ExtLog<F> = ExternalFunctionLog<F, StatementPosition>;

/// Reverse-mode tape with free-list index reuse.
pub struct ReuseTape<F: Float> {
    index_pool: IndexPool,
    data: DataLog<F>,
    statements: StatementLog,
    external_functions: ExtLog<F>,
    adjoints: AdjointVector<F>,
    active: bool,
    ignore_invalid_jacobians: bool,
    skip_zero_jacobians: bool,
    skip_zero_adjoints: bool,
}

impl<F: Float> ReuseTape<F> {
    /// Create a passive tape with the default chunk sizes.
    pub fn new() -> Self {
        Self::with_chunk_sizes(
            DEFAULT_CHUNK_SIZE,
            DEFAULT_CHUNK_SIZE,
            DEFAULT_EXTERNAL_FUNCTION_CHUNK_SIZE,
        )
    }

    /// Create a passive tape with explicit chunk sizes for the jacobian,
    /// statement, and external-function logs.
    pub fn with_chunk_sizes(data: usize, statements: usize, external_functions: usize) -> Self {
        ReuseTape {
            index_pool: IndexPool::default(),
            data: ChunkVector::new(data),
            statements: ChunkVector::new(statements),
            external_functions: ExternalFunctionLog::new(external_functions),
            adjoints: AdjointVector::new(),
            active: false,
            ignore_invalid_jacobians: false,
            skip_zero_jacobians: true,
            skip_zero_adjoints: true,
        }
    }

    // ── Recording state ──

    /// Start recording statements.
    #[inline]
    pub fn set_active(&mut self) {
        self.active = true;
    }

    /// Stop recording; `store` degenerates to primal assignment and
    /// releases left-hand-side indices.
    #[inline]
    pub fn set_passive(&mut self) {
        self.active = false;
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Drop non-finite partials instead of recording them. Off by default.
    pub fn set_ignore_invalid_jacobians(&mut self, on: bool) {
        self.ignore_invalid_jacobians = on;
    }

    /// Drop exactly-zero partials. On by default.
    pub fn set_skip_zero_jacobians(&mut self, on: bool) {
        self.skip_zero_jacobians = on;
    }

    /// Skip the propagation of statements whose output adjoint is exactly
    /// zero. On by default.
    pub fn set_skip_zero_adjoints(&mut self, on: bool) {
        self.skip_zero_adjoints = on;
    }

    // ── Sizing ──

    /// Chunk size for jacobian data allocated from now on.
    pub fn set_data_chunk_size(&mut self, size: usize) {
        self.data.set_chunk_size(size);
    }

    /// Chunk size for statements allocated from now on.
    pub fn set_statement_chunk_size(&mut self, size: usize) {
        self.statements.set_chunk_size(size);
    }

    /// Chunk size for external-function records allocated from now on.
    pub fn set_external_function_chunk_size(&mut self, size: usize) {
        self.external_functions.set_chunk_size(size);
    }

    /// Pre-allocate chunks for `data_size` jacobian entries and
    /// `statement_size` statements.
    pub fn resize(&mut self, data_size: usize, statement_size: usize) {
        self.data.resize(data_size);
        self.statements.resize(statement_size);
    }

    /// Resize the adjoint vector explicitly.
    pub fn set_adjoints_size(&mut self, size: usize) {
        self.adjoints.resize(size);
    }

    /// Grow the adjoint vector to fit every index issued so far.
    pub fn allocate_adjoints(&mut self) {
        self.adjoints.resize(self.index_pool.max_index() as usize + 1);
    }

    // ── Introspection ──

    /// Number of recorded statements.
    pub fn num_statements(&self) -> usize {
        self.statements.len()
    }

    /// Number of recorded `(partial, index)` pairs.
    pub fn num_data_entries(&self) -> usize {
        self.data.len()
    }

    /// Adjoint slots needed to cover every issued index.
    pub fn adjoints_size(&self) -> usize {
        self.index_pool.max_index() as usize + 1
    }

    // ── Recording ──

    /// Register `index` as an input variable: an inactive index is issued
    /// a live one, an already live index is kept.
    pub fn register_input(&mut self, index: &mut Index) {
        self.index_pool.check_index(index);
    }

    /// Outputs need no bookkeeping on this tape.
    pub fn register_output(&mut self, _index: &mut Index) {}

    /// Record the assignment `lhs = rhs` for a general expression.
    ///
    /// An expression with no active leaves — and any store on a passive
    /// tape — releases the left-hand-side index instead of recording a
    /// statement. The primal value is assigned regardless.
    pub fn store<E: Expression<F>>(&mut self, lhs_value: &mut F, lhs_index: &mut Index, rhs: &E) {
        if self.active {
            self.data.reserve_items(E::MAX_ACTIVE_VARIABLES, ());
            let data_pos = self.data.position(());
            // the statement reserve must precede the jacobian pushes so no
            // chunk seal can separate the start count from the final count
            self.statements.reserve_items(1, data_pos);
            let start = self.data.chunk_position();
            rhs.calc_gradient(F::one(), self);
            let active_vars = self.data.chunk_position() - start;
            debug_assert!(active_vars <= ArgCount::MAX as usize);
            if active_vars == 0 {
                self.index_pool.free_index(lhs_index);
            } else {
                self.index_pool.check_index(lhs_index);
                self.statements.push((active_vars as ArgCount, *lhs_index));
            }
        } else {
            self.index_pool.free_index(lhs_index);
        }
        *lhs_value = rhs.value();
    }

    /// Record the copy `lhs = rhs` of a tracked variable as a
    /// unit-jacobian statement. Indices cannot be aliased on this tape —
    /// the right-hand side may die and release its index while the copy
    /// lives on.
    pub fn store_copy(&mut self, lhs_value: &mut F, lhs_index: &mut Index, rhs_value: F, rhs_index: Index) {
        if self.active && rhs_index != 0 {
            self.index_pool.check_index(lhs_index);
            self.data.reserve_items(1, ());
            let data_pos = self.data.position(());
            self.statements.reserve_items(1, data_pos);
            self.data.push((F::one(), rhs_index));
            self.statements.push((1, *lhs_index));
        } else {
            self.index_pool.free_index(lhs_index);
        }
        *lhs_value = rhs_value;
    }

    /// Record the assignment of a passive literal; releases the left-hand
    /// side's index whether or not the tape is active.
    pub fn store_passive(&mut self, lhs_value: &mut F, lhs_index: &mut Index, rhs: F) {
        self.index_pool.free_index(lhs_index);
        *lhs_value = rhs;
    }

    /// Release the index of a dying variable back to the pool.
    pub fn destroy_index(&mut self, index: &mut Index) {
        self.index_pool.free_index(index);
    }

    // ── Gradients ──

    /// Set the adjoint of `index`; the inactive sentinel is ignored.
    pub fn set_gradient(&mut self, index: Index, gradient: F) {
        if index != 0 {
            *self.gradient(index) = gradient;
        }
    }

    /// Adjoint of `index`, or zero for slots not yet allocated.
    #[inline]
    pub fn get_gradient(&self, index: Index) -> F {
        self.adjoints.get(index)
    }

    /// Mutable adjoint slot of `index`, growing on demand. Panics on
    /// index 0.
    #[inline]
    pub fn gradient(&mut self, index: Index) -> &mut F {
        self.adjoints.entry(index)
    }

    /// Zero every adjoint.
    pub fn clear_adjoints(&mut self) {
        self.adjoints.clear();
    }

    /// Zero the adjoints recorded between the two positions. Recycled
    /// indices carry no positional meaning, so the whole vector is
    /// cleared.
    pub fn clear_adjoints_between(&mut self, _start: &Position, _end: &Position) {
        self.adjoints.clear();
    }

    // ── Positions ──

    /// Snapshot the head of all logs.
    pub fn position(&self) -> Position {
        self.external_functions.position(self.statement_position())
    }

    /// Rewind to `pos`: all adjoints are zeroed, external-function records
    /// above `pos` release their data, the logs truncate outside-in, and
    /// the index pool starts over.
    pub fn reset_to(&mut self, pos: &Position) {
        self.adjoints.clear();
        self.external_functions.reset(pos);
        self.statements.reset(&pos.inner);
        self.data.reset(&pos.inner.inner);
        self.index_pool.reset();
    }

    /// Rewind to the empty tape.
    pub fn reset(&mut self) {
        self.reset_to(&Position::default());
    }

    // ── External functions ──

    /// Register a callback to be invoked by the reverse sweep at the
    /// current position. The tape owns the closure and everything it
    /// captures.
    pub fn push_external_function_handle(&mut self, call: impl FnMut(&AdjointVector<F>) + 'static) {
        self.push_external_function_record(ExternalFunction::new(call));
    }

    /// Typed variant: the tape takes ownership of `data` and passes it to
    /// `call` on every invocation; its `Drop` runs when the record is
    /// discarded.
    pub fn push_external_function<D: 'static>(&mut self, call: fn(&mut D, &AdjointVector<F>), data: D) {
        self.push_external_function_record(ExternalFunction::with_data(call, data));
    }

    fn push_external_function_record(&mut self, function: ExternalFunction<F>) {
        let boundary = self.statement_position();
        self.external_functions.push(function, boundary);
    }

    // ── Evaluation ──

    /// Propagate adjoints backward over the whole tape.
    pub fn evaluate(&mut self) {
        let start = self.position();
        self.evaluate_between(&start, &Position::default());
    }

    /// Propagate adjoints backward from `start` down to `end`.
    pub fn evaluate_between(&mut self, start: &Position, end: &Position) {
        assert!(start >= end, "evaluation runs backward: start must not precede end");
        if self.adjoints.len() <= self.index_pool.max_index() as usize {
            self.adjoints.resize(self.index_pool.max_index() as usize + 1);
        }
        let ReuseTape {
            data,
            statements,
            external_functions,
            adjoints,
            skip_zero_adjoints,
            ..
        } = self;
        evaluate_ext_func(
            external_functions,
            statements,
            data,
            adjoints,
            *skip_zero_adjoints,
            start,
            end,
        );
    }

    fn statement_position(&self) -> StatementPosition {
        self.statements.position(self.data.position(()))
    }
}

impl<F: Float> Default for ReuseTape<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Float> JacobiSink<F> for ReuseTape<F> {
    #[inline]
    fn push_jacobi(&mut self, jacobi: F, index: Index) {
        if index != 0 {
            if self.ignore_invalid_jacobians && !jacobi.is_finite() {
                return;
            }
            if self.skip_zero_jacobians && jacobi == F::zero() {
                return;
            }
            self.data.push((jacobi, index));
        }
    }

    #[inline]
    fn push_unit_jacobi(&mut self, index: Index) {
        if index != 0 {
            self.data.push((F::one(), index));
        }
    }
}

/// Outer level of the reverse sweep: walk the external-function records
/// descending, replaying the statement segment above each boundary before
/// invoking the callback.
fn evaluate_ext_func<F: Float>(
    external_functions: &mut ExtLog<F>,
    statements: &StatementLog,
    data: &DataLog<F>,
    adjoints: &mut AdjointVector<F>,
    skip_zero_adjoints: bool,
    start: &Position,
    end: &Position,
) {
    let mut cur_stmt_pos = start.inner;
    external_functions.for_each_reverse(start, end, |function, boundary| {
        evaluate_stmt(statements, data, adjoints, skip_zero_adjoints, &cur_stmt_pos, boundary);
        function.invoke(adjoints);
        cur_stmt_pos = *boundary;
    });
    // the remainder also covers the case of no external functions at all
    evaluate_stmt(statements, data, adjoints, skip_zero_adjoints, &cur_stmt_pos, &end.inner);
}

/// Middle level: walk the statement chunks descending. Each chunk's cached
/// jacobian-log position bounds the inner walk for that chunk.
fn evaluate_stmt<F: Float>(
    statements: &StatementLog,
    data: &DataLog<F>,
    adjoints: &mut AdjointVector<F>,
    skip_zero_adjoints: bool,
    start: &StatementPosition,
    end: &StatementPosition,
) {
    let mut stmt_offset = start.data;
    let mut cur_inner = start.inner;
    let mut chunk = start.chunk;
    while chunk > end.chunk {
        let (arg_counts, lhs_indices) = statements.chunk(chunk).columns();
        let end_inner = statements.inner_start(chunk);
        evaluate_data(
            data,
            adjoints,
            skip_zero_adjoints,
            &cur_inner,
            &end_inner,
            &mut stmt_offset,
            0,
            arg_counts,
            lhs_indices,
        );
        cur_inner = end_inner;
        stmt_offset = statements.chunk_used(chunk - 1);
        chunk -= 1;
    }
    let (arg_counts, lhs_indices) = statements.chunk(end.chunk).columns();
    evaluate_data(
        data,
        adjoints,
        skip_zero_adjoints,
        &cur_inner,
        &end.inner,
        &mut stmt_offset,
        end.data,
        arg_counts,
        lhs_indices,
    );
}

/// Inner level: walk the jacobian chunks descending. The innermost loop
/// stops at each chunk's valid extent and resumes in the chunk below, so
/// a statement range may span any number of jacobian chunks.
#[allow(clippy::too_many_arguments)]
fn evaluate_data<F: Float>(
    data: &DataLog<F>,
    adjoints: &mut AdjointVector<F>,
    skip_zero_adjoints: bool,
    start: &DataPosition,
    end: &DataPosition,
    stmt_offset: &mut usize,
    stmt_end: usize,
    arg_counts: &[ArgCount],
    lhs_indices: &[Index],
) {
    let mut data_offset = start.data;
    let mut chunk = start.chunk;
    while chunk > end.chunk {
        let (jacobians, indices) = data.chunk(chunk).columns();
        evaluate_expressions(
            adjoints,
            skip_zero_adjoints,
            stmt_offset,
            stmt_end,
            arg_counts,
            lhs_indices,
            &mut data_offset,
            0,
            jacobians,
            indices,
        );
        data_offset = data.chunk_used(chunk - 1);
        chunk -= 1;
    }
    let (jacobians, indices) = data.chunk(end.chunk).columns();
    evaluate_expressions(
        adjoints,
        skip_zero_adjoints,
        stmt_offset,
        stmt_end,
        arg_counts,
        lhs_indices,
        &mut data_offset,
        end.data,
        jacobians,
        indices,
    );
}

/// The multiply-accumulate loop. Each statement's output adjoint is
/// zeroed right after it is read — its index may be reassigned by an
/// earlier statement. Every statement carries at least one jacobian and a
/// statement's jacobians never straddle a chunk, so stopping at the data
/// bound always stops between statements.
#[allow(clippy::too_many_arguments)]
fn evaluate_expressions<F: Float>(
    adjoints: &mut AdjointVector<F>,
    skip_zero_adjoints: bool,
    stmt_offset: &mut usize,
    stmt_end: usize,
    arg_counts: &[ArgCount],
    lhs_indices: &[Index],
    data_offset: &mut usize,
    data_end: usize,
    jacobians: &[F],
    indices: &[Index],
) {
    let adj = adjoints.as_mut_slice();
    while *stmt_offset > stmt_end && *data_offset > data_end {
        *stmt_offset -= 1;
        let lhs = lhs_indices[*stmt_offset] as usize;
        let lhs_adj = adj[lhs];
        adj[lhs] = F::zero();
        let args = arg_counts[*stmt_offset] as usize;
        if !skip_zero_adjoints || lhs_adj != F::zero() {
            for _ in 0..args {
                *data_offset -= 1;
                let rhs = indices[*data_offset] as usize;
                adj[rhs] = adj[rhs] + lhs_adj * jacobians[*data_offset];
            }
        } else {
            *data_offset -= args;
        }
    }
}
