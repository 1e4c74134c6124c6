//! Stream layout: the immutable index tables of one chain.
//!
//! Built once per chain configuration, before any task runs:
//! - one stream slot per argument and per component, in chain order;
//!   arguments produced inside the chain resolve to the producer's slot,
//! - one derivative block per distinct stored value consumed by the chain,
//!   plus one self block per leaf member (this is the global derivative
//!   index space the scratch and the force vector are addressed by),
//! - one buffer region per accumulated component,
//! - one stash slot per matrix component.
//!
//! A grid component anywhere in the chain switches streamed derivatives
//! off; the derivative lanes then only span the grid rank.

use crate::chain;
use crate::error::EngineError;
use crate::graph::{Graph, NodeId};
use crate::value::ValueId;

/// How a consumer reaches one of its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArgMode {
    /// Produced inside the chain; read the live stream slot, derivatives
    /// already carry global indices.
    Chained,
    /// Materialized outside the chain; elements come from the value store
    /// and derivatives go into the block at `deriv_start`.
    Stored { deriv_start: usize },
    /// Fixed data; no derivatives exist behind it.
    Constant,
}

pub(crate) struct StreamLayout {
    members: Vec<NodeId>,
    tasks: usize,
    n_quantities: usize,
    n_derivatives: usize,
    n_columns: usize,
    n_matrices: usize,
    buffer_size: usize,
    with_derivatives: bool,
    // per-node tables indexed by NodeId, empty for non-members
    arg_slots: Vec<Vec<usize>>,
    arg_modes: Vec<Vec<ArgMode>>,
    arg_primary: Vec<Vec<bool>>,
    arg_mat_slots: Vec<Vec<Option<usize>>>,
    comp_slots: Vec<Vec<usize>>,
    mat_slots: Vec<Vec<Option<usize>>>,
    buffer_starts: Vec<Vec<Option<usize>>>,
    self_starts: Vec<Option<usize>>,
    // chain-wide blocks, in walk order
    stored_blocks: Vec<(ValueId, usize, usize)>,
    matrix_span: Option<(usize, usize)>,
}

impl StreamLayout {
    pub(crate) fn build(graph: &Graph, members: &[NodeId]) -> Result<Self, EngineError> {
        let tasks = chain::task_count(graph, members)?;
        let n = graph.len();
        let mut layout = StreamLayout {
            members: members.to_vec(),
            tasks,
            n_quantities: 0,
            n_derivatives: 0,
            n_columns: 0,
            n_matrices: 0,
            buffer_size: 0,
            with_derivatives: true,
            arg_slots: vec![Vec::new(); n],
            arg_modes: vec![Vec::new(); n],
            arg_primary: vec![Vec::new(); n],
            arg_mat_slots: vec![Vec::new(); n],
            comp_slots: vec![Vec::new(); n],
            mat_slots: vec![Vec::new(); n],
            buffer_starts: vec![Vec::new(); n],
            self_starts: vec![None; n],
            stored_blocks: Vec::new(),
            matrix_span: None,
        };

        let grid_rank = members
            .iter()
            .flat_map(|&m| graph.components(m))
            .filter(|c| c.is_grid())
            .map(|c| c.rank())
            .max();
        layout.with_derivatives = grid_rank.is_none();

        layout.assign_stream_slots(graph, members);
        if layout.with_derivatives {
            layout.assign_derivative_blocks(graph, members);
        } else {
            layout.n_derivatives = grid_rank.unwrap_or(0);
        }
        layout.assign_buffer_regions(graph, members);

        let mats: Vec<usize> = members
            .iter()
            .enumerate()
            .filter(|&(_, &m)| graph.op(m).is_matrix())
            .map(|(i, _)| i)
            .collect();
        if let (Some(&first), Some(&last)) = (mats.first(), mats.last()) {
            layout.matrix_span = Some((first, last));
        }
        Ok(layout)
    }

    fn assign_stream_slots(&mut self, graph: &Graph, members: &[NodeId]) {
        let mut nq = 0;
        for &m in members {
            let args = graph.arguments(m);
            for (j, &a) in args.iter().enumerate() {
                // every argument reserves a slot; chained ones then alias
                // the producer's component slot
                let reserved = nq;
                nq += 1;
                let v = graph.value(a);
                let in_chain = members.contains(&a.node);
                let (slot, mode) = if in_chain && !v.is_grid() {
                    (self.comp_slots[a.node.index()][a.comp], ArgMode::Chained)
                } else if v.is_constant() {
                    (reserved, ArgMode::Constant)
                } else {
                    // deriv_start patched in by assign_derivative_blocks
                    (reserved, ArgMode::Stored { deriv_start: 0 })
                };
                self.arg_slots[m.index()].push(slot);
                self.arg_modes[m.index()].push(mode);
                let primary = !args[..j].contains(&a);
                self.arg_primary[m.index()].push(primary);
                let amat = if mode == ArgMode::Chained && v.rank() == 2 {
                    self.mat_slots[a.node.index()][a.comp]
                } else {
                    None
                };
                self.arg_mat_slots[m.index()].push(amat);
            }
            for c in graph.components(m) {
                self.comp_slots[m.index()].push(nq);
                nq += 1;
                let mat = if c.rank() == 2 && !c.is_grid() {
                    let s = self.n_matrices;
                    self.n_matrices += 1;
                    self.n_columns = self.n_columns.max(c.shape()[1]);
                    Some(s)
                } else {
                    None
                };
                self.mat_slots[m.index()].push(mat);
            }
        }
        self.n_quantities = nq;
    }

    fn assign_derivative_blocks(&mut self, graph: &Graph, members: &[NodeId]) {
        let mut nder = 0;
        for &m in members {
            if graph.node(m).is_leaf() {
                let len = graph.source_forces(m).len();
                if len > 0 {
                    self.self_starts[m.index()] = Some(nder);
                    nder += len;
                }
                continue;
            }
            let args = graph.arguments(m).to_vec();
            for (j, &a) in args.iter().enumerate() {
                if !matches!(self.arg_modes[m.index()][j], ArgMode::Stored { .. }) {
                    continue;
                }
                let start = match self.stored_blocks.iter().find(|(id, _, _)| *id == a) {
                    Some(&(_, s, _)) => s,
                    None => {
                        let len = graph.value(a).len();
                        self.stored_blocks.push((a, nder, len));
                        let s = nder;
                        nder += len;
                        s
                    }
                };
                self.arg_modes[m.index()][j] = ArgMode::Stored { deriv_start: start };
            }
        }
        self.n_derivatives = nder;
    }

    fn assign_buffer_regions(&mut self, graph: &Graph, members: &[NodeId]) {
        let mut size = 0;
        for &m in members {
            let leaf = graph.node(m).is_leaf();
            for c in graph.components(m) {
                let start = if leaf || c.is_constant() || !c.is_stored() {
                    None
                } else if c.rank() == 0 {
                    let s = size;
                    size += 1 + if self.with_derivatives { self.n_derivatives } else { 0 };
                    Some(s)
                } else if c.is_grid() {
                    let s = size;
                    size += c.len() * (1 + c.rank());
                    Some(s)
                } else {
                    let s = size;
                    size += c.len();
                    Some(s)
                };
                self.buffer_starts[m.index()].push(start);
            }
        }
        self.buffer_size = size;
    }

    #[inline]
    pub(crate) fn members(&self) -> &[NodeId] {
        &self.members
    }

    #[inline]
    pub(crate) fn tasks(&self) -> usize {
        self.tasks
    }

    #[inline]
    pub(crate) fn n_quantities(&self) -> usize {
        self.n_quantities
    }

    #[inline]
    pub(crate) fn n_derivatives(&self) -> usize {
        self.n_derivatives
    }

    #[inline]
    pub(crate) fn n_columns(&self) -> usize {
        self.n_columns
    }

    #[inline]
    pub(crate) fn n_matrices(&self) -> usize {
        self.n_matrices
    }

    #[inline]
    pub(crate) fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline]
    pub(crate) fn with_derivatives(&self) -> bool {
        self.with_derivatives
    }

    #[inline]
    pub(crate) fn arg_slot(&self, n: NodeId, j: usize) -> usize {
        self.arg_slots[n.index()][j]
    }

    #[inline]
    pub(crate) fn arg_mode(&self, n: NodeId, j: usize) -> ArgMode {
        self.arg_modes[n.index()][j]
    }

    #[inline]
    pub(crate) fn arg_primary(&self, n: NodeId, j: usize) -> bool {
        self.arg_primary[n.index()][j]
    }

    #[inline]
    pub(crate) fn arg_mat_slot(&self, n: NodeId, j: usize) -> Option<usize> {
        self.arg_mat_slots[n.index()][j]
    }

    #[inline]
    pub(crate) fn comp_slot(&self, n: NodeId, c: usize) -> usize {
        self.comp_slots[n.index()][c]
    }

    #[inline]
    pub(crate) fn mat_slot(&self, n: NodeId, c: usize) -> Option<usize> {
        self.mat_slots[n.index()][c]
    }

    #[inline]
    pub(crate) fn buffer_start(&self, n: NodeId, c: usize) -> Option<usize> {
        self.buffer_starts[n.index()][c]
    }

    /// Start of a leaf's self block.
    #[inline]
    pub(crate) fn self_start(&self, n: NodeId) -> usize {
        debug_assert!(self.self_starts[n.index()].is_some());
        self.self_starts[n.index()].unwrap_or(0)
    }

    #[inline]
    pub(crate) fn self_block(&self, n: NodeId) -> Option<usize> {
        self.self_starts[n.index()]
    }

    /// Derivative blocks of stored values, in walk order.
    #[inline]
    pub(crate) fn stored_blocks(&self) -> &[(ValueId, usize, usize)] {
        &self.stored_blocks
    }

    /// Inclusive member positions of the matrix segment, if any.
    #[inline]
    pub(crate) fn matrix_span(&self) -> Option<(usize, usize)> {
        self.matrix_span
    }
}
