//! Tape with a fresh index per recorded statement.
//!
//! Every assignment to a tracked variable receives the next value of a
//! monotonic counter, so a statement's left-hand-side index is implicit in
//! its position: statement number `k` (1-based) owns adjoint slot `k`.
//! The reverse sweep exploits this by running an index cursor alongside
//! the statement walk instead of storing indices.
//!
//! Storage is three nested chunk logs, outermost first:
//!
//! external functions → statements → jacobian data → statement counter
//!
//! Each log snapshots its inner neighbor's position at every chunk
//! boundary, which is what lets [`evaluate_between`](LinearTape::evaluate_between)
//! replay exact sub-ranges of the inner logs while walking an outer one
//! backward.

use crate::adjoints::AdjointVector;
use crate::chunk::{Chunk1, Chunk2};
use crate::chunk_vector::{ChunkPosition, ChunkVector};
use crate::expr::{Expression, JacobiSink};
use crate::external::{ExternalFunction, ExternalFunctionLog};
use crate::float::Float;
use crate::index::{ArgCount, ExpressionCounter, Index};
use crate::{DEFAULT_CHUNK_SIZE, DEFAULT_EXTERNAL_FUNCTION_CHUNK_SIZE};

/// Position in the jacobian log; the inner part is the statement count.
pub type DataPosition = ChunkPosition<Index>;
/// Position in the statement log.
pub type StatementPosition = ChunkPosition<DataPosition>;
/// Position of the whole tape.
pub type Position = ChunkPosition<StatementPosition>;

type DataLog<F> = ChunkVector<Chunk2<F, Index>, Index>;
type StatementLog = ChunkVector<Chunk1<ArgCount>, DataPosition>;
type ExtLog<F> = ExternalFunctionLog<F, StatementPosition>;

/// Reverse-mode tape with linearly increasing variable indices.
///
/// The adjoint vector grows with the number of recorded statements; use
/// [`crate::ReuseTape`] when the live working set is much smaller than the
/// statement count.
pub struct LinearTape<F: Float> {
    counter: ExpressionCounter,
    data: DataLog<F>,
    statements: StatementLog,
    external_functions: ExtLog<F>,
    adjoints: AdjointVector<F>,
    active: bool,
    ignore_invalid_jacobians: bool,
    skip_zero_jacobians: bool,
    skip_zero_adjoints: bool,
}

impl<F: Float> LinearTape<F> {
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
        LinearTape {
            counter: ExpressionCounter::default(),
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

    /// Stop recording; `store` degenerates to primal assignment.
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
        self.adjoints.resize(self.counter.count() as usize + 1);
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
        self.counter.count() as usize + 1
    }

    // ── Recording ──

    /// Register `index` as an input variable.
    ///
    /// Pushes a zero-argument statement so the fresh index has a place in
    /// the statement order; the reverse sweep passes over it without
    /// touching its adjoint, which is what lets input adjoints survive a
    /// full evaluation.
    pub fn register_input(&mut self, index: &mut Index) {
        let data_pos = self.data_position();
        self.statements.reserve_items(1, data_pos);
        self.statements.push(0);
        *index = self.counter.next();
    }

    /// Outputs need no bookkeeping on this tape.
    pub fn register_output(&mut self, _index: &mut Index) {}

    /// Record the assignment `lhs = rhs` for a general expression.
    ///
    /// Reserves jacobian and statement space up front, lets the expression
    /// push its partials, and only then decides: an expression with no
    /// active leaves deactivates the left-hand side instead of recording a
    /// statement. The primal value is assigned regardless of activity.
    pub fn store<E: Expression<F>>(&mut self, lhs_value: &mut F, lhs_index: &mut Index, rhs: &E) {
        if self.active {
            let counter_pos = self.counter.position();
            self.data.reserve_items(E::MAX_ACTIVE_VARIABLES, counter_pos);
            let data_pos = self.data_position();
            // the statement reserve must precede the jacobian pushes so no
            // chunk seal can separate the start count from the final count
            self.statements.reserve_items(1, data_pos);
            let start = self.data.chunk_position();
            rhs.calc_gradient(F::one(), self);
            let active_vars = self.data.chunk_position() - start;
            debug_assert!(active_vars <= ArgCount::MAX as usize);
            if active_vars == 0 {
                *lhs_index = 0;
            } else {
                self.statements.push(active_vars as ArgCount);
                *lhs_index = self.counter.next();
            }
        }
        *lhs_value = rhs.value();
    }

    /// Record the copy `lhs = rhs` of a tracked variable. The index is
    /// aliased instead of recording a statement.
    ///
    /// When the tape is passive the left-hand index is left untouched, so
    /// a variable that was never registered keeps whatever index it had.
    pub fn store_copy(&mut self, lhs_value: &mut F, lhs_index: &mut Index, rhs_value: F, rhs_index: Index) {
        if self.active {
            *lhs_index = rhs_index;
        }
        *lhs_value = rhs_value;
    }

    /// Record the assignment of a passive literal; deactivates the
    /// left-hand side.
    pub fn store_passive(&mut self, lhs_value: &mut F, lhs_index: &mut Index, rhs: F) {
        if self.active {
            *lhs_index = 0;
        }
        *lhs_value = rhs;
    }

    /// Indices on this tape are never recycled, so there is nothing to do
    /// when a variable dies.
    pub fn destroy_index(&mut self, _index: &mut Index) {}

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

    /// Zero the adjoints of the statements recorded between the two
    /// positions; the statement-counter sub-positions give the index range.
    pub fn clear_adjoints_between(&mut self, start: &Position, end: &Position) {
        self.adjoints
            .clear_range(start.inner.inner.inner, end.inner.inner.inner);
    }

    // ── Positions ──

    /// Snapshot the head of all logs.
    pub fn position(&self) -> Position {
        self.external_functions.position(self.statement_position())
    }

    /// Rewind to `pos`: adjoints of discarded statements are zeroed,
    /// external-function records above `pos` release their data, and all
    /// logs truncate outside-in.
    pub fn reset_to(&mut self, pos: &Position) {
        self.adjoints
            .clear_range(pos.inner.inner.inner, self.counter.count());
        self.external_functions.reset(pos);
        self.statements.reset(&pos.inner);
        self.data.reset(&pos.inner.inner);
        self.counter.reset(pos.inner.inner.inner);
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
    ///
    /// Statements are visited in strictly descending position order and
    /// every external function registered in the range is invoked at its
    /// boundary. `start == end` is a no-op.
    pub fn evaluate_between(&mut self, start: &Position, end: &Position) {
        assert!(start >= end, "evaluation runs backward: start must not precede end");
        if self.adjoints.len() <= self.counter.count() as usize {
            self.adjoints.resize(self.counter.count() as usize + 1);
        }
        let LinearTape {
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

    fn data_position(&self) -> DataPosition {
        self.data.position(self.counter.position())
    }

    fn statement_position(&self) -> StatementPosition {
        self.statements.position(self.data_position())
    }
}

impl<F: Float> Default for LinearTape<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F: Float> JacobiSink<F> for LinearTape<F> {
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
        let arg_counts = statements.chunk(chunk).data();
        let end_inner = statements.inner_start(chunk);
        evaluate_data(
            data,
            adjoints,
            skip_zero_adjoints,
            &cur_inner,
            &end_inner,
            &mut stmt_offset,
            arg_counts,
        );
        cur_inner = end_inner;
        stmt_offset = statements.chunk_used(chunk - 1);
        chunk -= 1;
    }
    let arg_counts = statements.chunk(end.chunk).data();
    evaluate_data(
        data,
        adjoints,
        skip_zero_adjoints,
        &cur_inner,
        &end.inner,
        &mut stmt_offset,
        arg_counts,
    );
}

/// Inner level: walk the jacobian chunks descending. The statement-counter
/// snapshot cached at each chunk start clips how many statements the
/// innermost loop may consume from this chunk.
fn evaluate_data<F: Float>(
    data: &DataLog<F>,
    adjoints: &mut AdjointVector<F>,
    skip_zero_adjoints: bool,
    start: &DataPosition,
    end: &DataPosition,
    stmt_offset: &mut usize,
    arg_counts: &[ArgCount],
) {
    let mut data_offset = start.data;
    let mut cur_inner = start.inner;
    let mut chunk = start.chunk;
    while chunk > end.chunk {
        let (jacobians, indices) = data.chunk(chunk).columns();
        let end_inner = data.inner_start(chunk);
        evaluate_expressions(
            adjoints,
            skip_zero_adjoints,
            cur_inner,
            end_inner,
            stmt_offset,
            arg_counts,
            &mut data_offset,
            jacobians,
            indices,
        );
        cur_inner = end_inner;
        data_offset = data.chunk_used(chunk - 1);
        chunk -= 1;
    }
    let (jacobians, indices) = data.chunk(end.chunk).columns();
    evaluate_expressions(
        adjoints,
        skip_zero_adjoints,
        cur_inner,
        end.inner,
        stmt_offset,
        arg_counts,
        &mut data_offset,
        jacobians,
        indices,
    );
}

/// The multiply-accumulate loop. The adjoint cursor doubles as the
/// implicit left-hand-side index: statement `k` owns adjoint slot `k`.
/// Input registrations appear as zero-argument statements and pass
/// through without touching any adjoint.
#[allow(clippy::too_many_arguments)]
fn evaluate_expressions<F: Float>(
    adjoints: &mut AdjointVector<F>,
    skip_zero_adjoints: bool,
    start_adj: Index,
    end_adj: Index,
    stmt_offset: &mut usize,
    arg_counts: &[ArgCount],
    data_offset: &mut usize,
    jacobians: &[F],
    indices: &[Index],
) {
    let adj = adjoints.as_mut_slice();
    let mut adj_pos = start_adj as usize;
    let end_adj = end_adj as usize;
    while adj_pos > end_adj {
        let lhs_adj = adj[adj_pos];
        adj_pos -= 1;
        *stmt_offset -= 1;
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
