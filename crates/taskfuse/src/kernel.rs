//! The node contract.
//!
//! A node is a kernel behind one of two trait interfaces:
//! ```text
//! NodeOp
//! ├── Stream(Box<dyn Kernel>)        one call per task
//! └── Matrix(Box<dyn MatrixKernel>)  row driver: setup, one call per
//!                                    element, end-of-row compaction
//! ```
//! The variant is resolved once at registration and never probed again.
//! Kernels see the rest of the engine through [`ChainView`], which hides
//! whether an argument is streamed by the same chain or materialized in a
//! value store, and routes derivative products to the right index space.

use crate::error::EngineError;
use crate::graph::{Graph, NodeId};
use crate::layout::{ArgMode, StreamLayout};
use crate::scratch::TaskScratch;
use crate::value::{Value, ValueSpec};

/// What a kernel sees at registration: its label and resolved arguments.
pub struct BuildContext<'a> {
    pub label: &'a str,
    pub args: Vec<&'a Value>,
}

impl<'a> BuildContext<'a> {
    #[inline]
    pub fn n_args(&self) -> usize {
        self.args.len()
    }

    #[inline]
    pub fn arg(&self, i: usize) -> &Value {
        self.args[i]
    }

    pub fn require_args(&self, min: usize) -> Result<(), EngineError> {
        if self.args.len() < min {
            return Err(EngineError::MissingArguments {
                label: self.label.to_string(),
            });
        }
        Ok(())
    }

    /// Common length of the rank-1 arguments; scalars are allowed alongside.
    pub fn vector_length(&self) -> Result<usize, EngineError> {
        let mut len = None;
        for v in &self.args {
            match v.rank() {
                0 => {}
                1 => match len {
                    None => len = Some(v.len()),
                    Some(n) if n == v.len() => {}
                    Some(n) => {
                        return Err(EngineError::ArgumentLength {
                            label: self.label.to_string(),
                            arg: v.name().to_string(),
                            expected: n,
                            found: v.len(),
                        });
                    }
                },
                r => {
                    return Err(EngineError::ArgumentRank {
                        label: self.label.to_string(),
                        arg: v.name().to_string(),
                        expected: 1,
                        found: r,
                    });
                }
            }
        }
        len.ok_or_else(|| EngineError::MissingArguments {
            label: self.label.to_string(),
        })
    }

    /// Shared periodic domain of the arguments, if they agree.
    pub fn common_periodic(&self) -> Result<Option<(f64, f64)>, EngineError> {
        let mut dom = None;
        for (i, v) in self.args.iter().enumerate() {
            if i == 0 {
                dom = v.periodic();
            } else if dom != v.periodic() {
                return Err(EngineError::PeriodicityMismatch {
                    label: self.label.to_string(),
                });
            }
        }
        Ok(dom)
    }
}

/// A streamed computational unit: one `perform_task` call per task index.
pub trait Kernel: Send + Sync {
    /// Declare output components from the resolved arguments.
    fn build(&self, ctx: &BuildContext) -> Result<Vec<ValueSpec>, EngineError>;

    /// Compute this node's component values (and derivatives, unless the
    /// view says they are off) for the task in `scratch`.
    fn perform_task(&self, view: &ChainView, scratch: &mut TaskScratch);

    /// Post-gather hook on the finished components.
    fn transform_final(&self, _n_tasks: usize, _comps: &mut [Value]) {}

    /// Whether this node should try to join a chain.
    fn wants_chain(&self) -> bool {
        true
    }

    /// Width of the differentiation source block when this node is a leaf.
    ///
    /// `None` means one slot per element of the non-constant components;
    /// kernels with extra force channels (a cell block, say) widen it.
    fn source_width(&self) -> Option<usize> {
        None
    }
}

/// A matrix-producing unit, driven row by row.
///
/// For task `row` the driver asks the segment head for the active columns,
/// then for every column calls `element_task` down the whole matrix segment
/// before stashing and clearing the rank-2 element state, and finally calls
/// `end_of_row` so each kernel can compact the row's derivative indices
/// into the shared bookkeeping arrays.
pub trait MatrixKernel: Send + Sync {
    fn build(&self, ctx: &BuildContext) -> Result<Vec<ValueSpec>, EngineError>;

    /// Active column list for one row. Only the segment head is asked.
    fn setup_row(&self, row: usize, view: &ChainView, cols: &mut Vec<usize>);

    /// Compute one element. The column is also in `scratch.second_index()`.
    fn element_task(&self, row: usize, col: usize, view: &ChainView, scratch: &mut TaskScratch);

    /// Compact the finished row's derivative indices.
    fn end_of_row(&self, row: usize, cols: &[usize], view: &ChainView, scratch: &mut TaskScratch);

    fn transform_final(&self, _n_tasks: usize, _comps: &mut [Value]) {}

    fn wants_chain(&self) -> bool {
        true
    }

    fn source_width(&self) -> Option<usize> {
        None
    }
}

/// Tagged kernel registry, fixed at registration.
pub enum NodeOp {
    Stream(Box<dyn Kernel>),
    Matrix(Box<dyn MatrixKernel>),
}

impl NodeOp {
    pub(crate) fn build(&self, ctx: &BuildContext) -> Result<Vec<ValueSpec>, EngineError> {
        match self {
            NodeOp::Stream(k) => k.build(ctx),
            NodeOp::Matrix(k) => k.build(ctx),
        }
    }

    pub(crate) fn wants_chain(&self) -> bool {
        match self {
            NodeOp::Stream(k) => k.wants_chain(),
            NodeOp::Matrix(k) => k.wants_chain(),
        }
    }

    pub(crate) fn transform_final(&self, n_tasks: usize, comps: &mut [Value]) {
        match self {
            NodeOp::Stream(k) => k.transform_final(n_tasks, comps),
            NodeOp::Matrix(k) => k.transform_final(n_tasks, comps),
        }
    }

    pub(crate) fn source_width(&self) -> Option<usize> {
        match self {
            NodeOp::Stream(k) => k.source_width(),
            NodeOp::Matrix(k) => k.source_width(),
        }
    }

    #[inline]
    pub(crate) fn is_matrix(&self) -> bool {
        matches!(self, NodeOp::Matrix(_))
    }
}

/// Per-node window onto the running chain.
///
/// All argument access goes through here: a chained argument reads the
/// producer's live stream slot, a stored one reads the materialized value,
/// and the derivative helpers place products at global stream indices
/// either by chain rule over the producer's active set or directly into the
/// argument's derivative block.
pub struct ChainView<'a> {
    graph: &'a Graph,
    layout: &'a StreamLayout,
    node: NodeId,
}

impl<'a> ChainView<'a> {
    pub(crate) fn new(graph: &'a Graph, layout: &'a StreamLayout, node: NodeId) -> Self {
        ChainView { graph, layout, node }
    }

    #[inline]
    pub fn n_args(&self) -> usize {
        self.graph.arguments(self.node).len()
    }

    #[inline]
    pub fn arg_value(&self, j: usize) -> &Value {
        self.graph.value(self.graph.arguments(self.node)[j])
    }

    /// Whether derivatives are being streamed on this pass.
    #[inline]
    pub fn with_derivatives(&self) -> bool {
        self.layout.with_derivatives()
    }

    /// The current element of argument `j`.
    ///
    /// Rank-1 arguments are indexed by the task, rank-2 by (task, second
    /// index); chained arguments read the live stream slot instead.
    pub fn arg(&self, j: usize, scratch: &TaskScratch) -> f64 {
        match self.layout.arg_mode(self.node, j) {
            ArgMode::Chained => scratch.get(self.layout.arg_slot(self.node, j)),
            ArgMode::Stored { .. } | ArgMode::Constant => {
                let v = self.arg_value(j);
                match v.rank() {
                    0 => v.get(0),
                    1 => v.get(scratch.task_index()),
                    _ => v.get(scratch.task_index() * v.shape()[1] + scratch.second_index()),
                }
            }
        }
    }

    /// Element `i` of this node's own component `c` (leaf sources).
    #[inline]
    pub fn own_value(&self, c: usize, i: usize) -> f64 {
        self.graph
            .value(crate::value::ValueId { node: self.node, comp: c })
            .get(i)
    }

    /// Add to component `c`'s stream value for the current task.
    #[inline]
    pub fn add_value(&self, c: usize, v: f64, scratch: &mut TaskScratch) {
        scratch.add_value(self.layout.comp_slot(self.node, c), v);
    }

    /// Stream value of own component `c` for the current task.
    #[inline]
    pub fn value(&self, c: usize, scratch: &TaskScratch) -> f64 {
        scratch.get(self.layout.comp_slot(self.node, c))
    }

    /// Derivative of component `c` on this node's own source block.
    pub fn add_self_derivative(&self, c: usize, elem: usize, d: f64, scratch: &mut TaskScratch) {
        if !self.layout.with_derivatives() {
            return;
        }
        let q = self.layout.comp_slot(self.node, c);
        let k = self.layout.self_start(self.node) + elem;
        scratch.add_derivative(q, k, d);
        scratch.update_index(q, k);
    }

    /// Per-point partial of grid component `c` along grid axis `dim`.
    ///
    /// Grid chains keep one derivative lane per axis instead of the full
    /// source index space; the lane still registers as active so the
    /// scratch resets it before the next task.
    pub fn add_grid_derivative(&self, c: usize, dim: usize, d: f64, scratch: &mut TaskScratch) {
        let q = self.layout.comp_slot(self.node, c);
        scratch.add_derivative(q, dim, d);
        scratch.update_index(q, dim);
    }

    /// Chain-rule product `df * d(arg_j)/d(k)` onto component `c`.
    pub fn add_arg_derivative(&self, j: usize, c: usize, df: f64, scratch: &mut TaskScratch) {
        self.arg_derivative_impl(j, c, df, true, scratch);
    }

    /// Like [`Self::add_arg_derivative`] but without touching the active
    /// index lists; callers merge indices once per row instead.
    pub fn accumulate_arg_derivative(&self, j: usize, c: usize, df: f64, scratch: &mut TaskScratch) {
        self.arg_derivative_impl(j, c, df, false, scratch);
    }

    fn arg_derivative_impl(
        &self,
        j: usize,
        c: usize,
        df: f64,
        index: bool,
        scratch: &mut TaskScratch,
    ) {
        if !self.layout.with_derivatives() {
            return;
        }
        let q = self.layout.comp_slot(self.node, c);
        match self.layout.arg_mode(self.node, j) {
            ArgMode::Chained => {
                let aq = self.layout.arg_slot(self.node, j);
                for i in 0..scratch.n_active(aq) {
                    let k = scratch.active_index(aq, i);
                    let d = scratch.get_derivative(aq, k);
                    scratch.add_derivative(q, k, df * d);
                    if index {
                        scratch.update_index(q, k);
                    }
                }
            }
            ArgMode::Stored { deriv_start } => {
                let k = deriv_start + self.stored_offset(j, scratch);
                scratch.add_derivative(q, k, df);
                if index {
                    scratch.update_index(q, k);
                }
            }
            ArgMode::Constant => {}
        }
    }

    fn stored_offset(&self, j: usize, scratch: &TaskScratch) -> usize {
        let v = self.arg_value(j);
        match v.rank() {
            0 => 0,
            1 => scratch.task_index(),
            _ => scratch.task_index() * v.shape()[1] + scratch.second_index(),
        }
    }

    /// Merge argument `j`'s derivative indices for this row into the row
    /// bookkeeping of own matrix component `c`. Arguments sharing a
    /// producing node with an earlier argument are skipped.
    pub fn merge_arg_into_row(
        &self,
        j: usize,
        c: usize,
        cols: &[usize],
        scratch: &mut TaskScratch,
    ) {
        if !self.layout.with_derivatives() || !self.layout.arg_primary(self.node, j) {
            return;
        }
        let Some(mat) = self.layout.mat_slot(self.node, c) else {
            return;
        };
        self.for_arg_indices(j, cols, scratch, |s, k| s.push_row_index(mat, k));
    }

    /// Merge argument `j`'s row indices into the active list of own rank-0
    /// component `c`, with the same origin deduplication.
    pub fn merge_arg_into_actives(
        &self,
        j: usize,
        c: usize,
        cols: &[usize],
        scratch: &mut TaskScratch,
    ) {
        if !self.layout.with_derivatives() || !self.layout.arg_primary(self.node, j) {
            return;
        }
        let q = self.layout.comp_slot(self.node, c);
        self.for_arg_indices(j, cols, scratch, |s, k| s.update_index(q, k));
    }

    fn for_arg_indices(
        &self,
        j: usize,
        cols: &[usize],
        scratch: &mut TaskScratch,
        mut push: impl FnMut(&mut TaskScratch, usize),
    ) {
        match self.layout.arg_mode(self.node, j) {
            ArgMode::Chained => {
                if let Some(amat) = self.layout.arg_mat_slot(self.node, j) {
                    for i in 0..scratch.n_row_indices(amat) {
                        let k = scratch.row_index(amat, i);
                        push(scratch, k);
                    }
                } else {
                    let aq = self.layout.arg_slot(self.node, j);
                    for i in 0..scratch.n_active(aq) {
                        let k = scratch.active_index(aq, i);
                        push(scratch, k);
                    }
                }
            }
            ArgMode::Stored { deriv_start } => {
                let v = self.arg_value(j);
                match v.rank() {
                    0 => push(scratch, deriv_start),
                    1 => push(scratch, deriv_start + scratch.task_index()),
                    _ => {
                        let row = scratch.task_index() * v.shape()[1];
                        for &col in cols {
                            push(scratch, deriv_start + row + col);
                        }
                    }
                }
            }
            ArgMode::Constant => {}
        }
    }
}
