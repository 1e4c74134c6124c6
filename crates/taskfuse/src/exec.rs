//! Forward task executor.
//!
//! One pass evaluates every chain over its task domain:
//! ```text
//! tasks [0, N)  --stride-->  this rank's tasks  --fold-->  thread buffers
//!                                                             |
//!      component stores  <--finalize--  buffer  <--sum across ranks
//! ```
//! Each task streams through the chain in member order with its own
//! scratch, then `gather_accumulators` folds the results into a flat
//! buffer. Matrix members are driven row by row as one block. Thread
//! buffers merge by summation and the total is allreduced before
//! finalization copies the regions back into the values.

use rayon::prelude::*;

use crate::buffer::Buffer;
use crate::comm::{Communicator, SerialComm};
use crate::error::EngineError;
use crate::graph::{Graph, NodeId};
use crate::kernel::{ChainView, NodeOp};
use crate::layout::StreamLayout;
use crate::scratch::TaskScratch;

static SERIAL: SerialComm = SerialComm;

/// Where and how a pass runs: the rank group and the thread budget.
#[derive(Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub comm: &'a dyn Communicator,
    /// Desired thread team size; trimmed so every thread keeps at least
    /// ten tasks.
    pub threads: usize,
    /// Ignore the rank group and run everything on this process.
    pub serial: bool,
}

impl<'a> ExecutionContext<'a> {
    /// Single-threaded, single-rank execution.
    pub fn serial() -> ExecutionContext<'static> {
        ExecutionContext {
            comm: &SERIAL,
            threads: 1,
            serial: true,
        }
    }

    /// Threaded execution on one process.
    pub fn threaded(threads: usize) -> ExecutionContext<'static> {
        ExecutionContext {
            comm: &SERIAL,
            threads,
            serial: false,
        }
    }

    /// Threads on top of a rank group.
    pub fn new(comm: &'a dyn Communicator, threads: usize) -> Self {
        ExecutionContext {
            comm,
            threads,
            serial: false,
        }
    }
}

pub(crate) struct ChainPlan {
    pub(crate) members: Vec<NodeId>,
    pub(crate) layout: StreamLayout,
    pub(crate) buffer: Buffer,
    // reused by the serial paths; thread teams fold over their own copies
    pub(crate) scratch: TaskScratch,
    pub(crate) forces: Vec<f64>,
    // a chain of nothing but leaves has no work
    pub(crate) active: bool,
}

/// Frozen execution state: one layout and one reusable buffer per chain.
///
/// Built after the graph is assembled; using it on a graph that changed
/// afterwards is an error, rebuild it instead.
pub struct Runner {
    version: u64,
    pub(crate) chains: Vec<ChainPlan>,
    pub(crate) pool: Option<(usize, rayon::ThreadPool)>,
}

impl Runner {
    /// Freeze task counts, stream layouts and buffers for every chain.
    ///
    /// # Errors
    ///
    /// Task-count disagreement inside any chain surfaces here as
    /// [`EngineError::TaskCountMismatch`].
    pub fn new(graph: &Graph) -> Result<Self, EngineError> {
        let mut chains = Vec::with_capacity(graph.chains().len());
        for members in graph.chains() {
            let layout = StreamLayout::build(graph, members)?;
            let buffer = Buffer::zeros(layout.buffer_size());
            let scratch = TaskScratch::new(
                layout.n_quantities(),
                layout.n_derivatives(),
                layout.n_columns(),
                layout.n_matrices(),
            );
            let active = members.iter().any(|&m| !graph.node(m).is_leaf());
            chains.push(ChainPlan {
                members: members.clone(),
                layout,
                buffer,
                scratch,
                forces: Vec::new(),
                active,
            });
        }
        Ok(Runner {
            version: graph.version(),
            chains,
            pool: None,
        })
    }

    /// One forward pass over every chain, in registration order.
    pub fn run(&mut self, graph: &mut Graph, ctx: &ExecutionContext) -> Result<(), EngineError> {
        if graph.version() != self.version {
            return Err(EngineError::StaleLayout);
        }
        let Runner { chains, pool, .. } = self;
        for plan in chains.iter_mut() {
            if !plan.active {
                continue;
            }
            run_chain(graph, plan, pool, ctx)?;
        }
        Ok(())
    }

    #[inline]
    pub fn n_chains(&self) -> usize {
        self.chains.len()
    }

    /// Accumulation buffer length of one chain.
    #[inline]
    pub fn buffer_size(&self, chain: usize) -> usize {
        self.chains[chain].layout.buffer_size()
    }

    /// Width of one chain's derivative index space.
    #[inline]
    pub fn n_derivatives(&self, chain: usize) -> usize {
        self.chains[chain].layout.n_derivatives()
    }

    /// Stream slots of one chain: one per argument and per component.
    #[inline]
    pub fn n_quantities(&self, chain: usize) -> usize {
        self.chains[chain].layout.n_quantities()
    }

    /// Shared task count of one chain.
    #[inline]
    pub fn task_count(&self, chain: usize) -> usize {
        self.chains[chain].layout.tasks()
    }

    pub(crate) fn check_version(&self, graph: &Graph) -> Result<(), EngineError> {
        if graph.version() != self.version {
            return Err(EngineError::StaleLayout);
        }
        Ok(())
    }
}

/// Team size for one chain: `min(desired, ntasks/stride/10)`, at least 1.
pub(crate) fn thread_count(desired: usize, ntasks: usize, stride: usize) -> usize {
    let mut nt = desired.max(1);
    if nt * stride * 10 > ntasks {
        nt = ntasks / stride / 10;
    }
    if nt == 0 {
        nt = 1;
    }
    nt
}

pub(crate) fn ensure_pool(
    pool: &mut Option<(usize, rayon::ThreadPool)>,
    nt: usize,
) -> Result<&rayon::ThreadPool, EngineError> {
    let rebuild = match pool {
        Some((n, _)) => *n != nt,
        None => true,
    };
    if rebuild {
        let p = rayon::ThreadPoolBuilder::new()
            .num_threads(nt)
            .build()
            .map_err(|e| EngineError::ThreadPool {
                message: e.to_string(),
            })?;
        *pool = Some((nt, p));
    }
    match pool {
        Some((_, p)) => Ok(p),
        None => unreachable!("pool built above"),
    }
}

fn run_chain(
    graph: &mut Graph,
    plan: &mut ChainPlan,
    pool: &mut Option<(usize, rayon::ThreadPool)>,
    ctx: &ExecutionContext,
) -> Result<(), EngineError> {
    let ntasks = plan.layout.tasks();
    let (stride, rank) = if ctx.serial {
        (1, 0)
    } else {
        (ctx.comm.size(), ctx.comm.rank())
    };
    let nt = thread_count(ctx.threads, ntasks, stride);
    plan.buffer.reset();
    {
        let g: &Graph = graph;
        let layout = &plan.layout;
        if nt <= 1 {
            let scratch = &mut plan.scratch;
            let mut cols = Vec::new();
            let mut t = rank;
            while t < ntasks {
                run_task(g, layout, t, scratch, &mut cols, None);
                gather_accumulators(g, layout, t, scratch, &cols, &mut plan.buffer);
                scratch.clear();
                t += stride;
            }
        } else {
            let dims = (
                layout.n_quantities(),
                layout.n_derivatives(),
                layout.n_columns(),
                layout.n_matrices(),
            );
            let tasks: Vec<usize> = (rank..ntasks).step_by(stride).collect();
            let len = plan.buffer.len();
            let pool = ensure_pool(pool, nt)?;
            let merged = pool.install(|| {
                tasks
                    .par_iter()
                    .with_min_len(10)
                    .fold(
                        || (TaskScratch::new(dims.0, dims.1, dims.2, dims.3), Vec::new(), Buffer::zeros(len)),
                        |(mut s, mut c, mut b), &t| {
                            run_task(g, layout, t, &mut s, &mut c, None);
                            gather_accumulators(g, layout, t, &s, &c, &mut b);
                            s.clear();
                            (s, c, b)
                        },
                    )
                    .map(|(_, _, b)| b)
                    .reduce(
                        || Buffer::zeros(len),
                        |mut a, b| {
                            a.merge(&b);
                            a
                        },
                    )
            });
            plan.buffer.merge(&merged);
        }
    }
    if !ctx.serial && ctx.comm.size() > 1 && !plan.buffer.is_empty() {
        ctx.comm.sum(plan.buffer.as_mut_slice());
    }
    finalize(graph, &plan.layout, &plan.buffer);
    Ok(())
}

/// Stream one task through the chain. `forces` switches the matrix driver
/// into adjoint projection while element derivatives are live.
pub(crate) fn run_task(
    g: &Graph,
    layout: &StreamLayout,
    t: usize,
    scratch: &mut TaskScratch,
    cols: &mut Vec<usize>,
    mut forces: Option<&mut [f64]>,
) {
    scratch.set_task(t);
    let members = layout.members();
    let span = layout.matrix_span();
    for (pos, &m) in members.iter().enumerate() {
        if let Some((first, last)) = span {
            if pos == first {
                drive_matrix_rows(g, layout, t, first, last, scratch, cols, forces.as_deref_mut());
                continue;
            }
            if pos > first && pos <= last {
                continue;
            }
        }
        if let NodeOp::Stream(k) = g.op(m) {
            let view = ChainView::new(g, layout, m);
            k.perform_task(&view, scratch);
        }
    }
}

fn drive_matrix_rows(
    g: &Graph,
    layout: &StreamLayout,
    row: usize,
    first: usize,
    last: usize,
    scratch: &mut TaskScratch,
    cols: &mut Vec<usize>,
    mut forces: Option<&mut [f64]>,
) {
    let members = layout.members();
    cols.clear();
    let head = members[first];
    if let NodeOp::Matrix(hk) = g.op(head) {
        let view = ChainView::new(g, layout, head);
        hk.setup_row(row, &view, cols);
    }
    for ci in 0..cols.len() {
        let col = cols[ci];
        scratch.set_second(col);
        for pos in first..=last {
            let m = members[pos];
            if let NodeOp::Matrix(k) = g.op(m) {
                let view = ChainView::new(g, layout, m);
                k.element_task(row, col, &view, scratch);
            }
        }
        // stash and reset rank-2 element state; stream and rank-0 slots
        // keep accumulating across the row
        for pos in first..=last {
            let m = members[pos];
            for (c, comp) in g.components(m).iter().enumerate() {
                let Some(mat) = layout.mat_slot(m, c) else {
                    continue;
                };
                let q = layout.comp_slot(m, c);
                let v = scratch.get(q);
                scratch.stash_element(mat, col, v);
                if let Some(f) = forces.as_deref_mut() {
                    if comp.forces_added() {
                        let fe = comp.force(row * comp.shape()[1] + col);
                        if fe != 0.0 {
                            for i in 0..scratch.n_active(q) {
                                let k = scratch.active_index(q, i);
                                f[k] += fe * scratch.get_derivative(q, k);
                            }
                        }
                    }
                }
                scratch.clear_quantity(q);
            }
        }
    }
    for pos in first..=last {
        let m = members[pos];
        if let NodeOp::Matrix(k) = g.op(m) {
            let view = ChainView::new(g, layout, m);
            k.end_of_row(row, cols, &view, scratch);
        }
    }
}

/// Fold one finished task into the buffer.
fn gather_accumulators(
    g: &Graph,
    layout: &StreamLayout,
    t: usize,
    scratch: &TaskScratch,
    cols: &[usize],
    buffer: &mut Buffer,
) {
    for &m in layout.members() {
        for (c, comp) in g.components(m).iter().enumerate() {
            let Some(start) = layout.buffer_start(m, c) else {
                continue;
            };
            let q = layout.comp_slot(m, c);
            if comp.rank() == 0 {
                buffer.add(start, scratch.get(q));
                if layout.with_derivatives() {
                    for i in 0..scratch.n_active(q) {
                        let k = scratch.active_index(q, i);
                        buffer.add(start + 1 + k, scratch.get_derivative(q, k));
                    }
                }
            } else if comp.is_grid() {
                let base = start + t * (1 + comp.rank());
                buffer.add(base, scratch.get(q));
                for d in 0..comp.rank() {
                    buffer.add(base + 1 + d, scratch.get_derivative(q, d));
                }
            } else if comp.rank() == 1 {
                buffer.add(start + t, scratch.get(q));
            } else if let Some(mat) = layout.mat_slot(m, c) {
                let sh1 = comp.shape()[1];
                for &col in cols {
                    buffer.add(start + t * sh1 + col, scratch.stashed(mat, col));
                }
            }
        }
    }
}

/// Copy buffer regions into the component stores and run the post hooks.
fn finalize(graph: &mut Graph, layout: &StreamLayout, buffer: &Buffer) {
    let tasks = layout.tasks();
    let n_der = layout.n_derivatives();
    let with_der = layout.with_derivatives();
    for &m in layout.members() {
        let ncomp = graph.components(m).len();
        for c in 0..ncomp {
            let Some(start) = layout.buffer_start(m, c) else {
                continue;
            };
            let comp = &graph.components(m)[c];
            let (rank, len, grid) = (comp.rank(), comp.len(), comp.is_grid());
            let v = &mut graph.components_mut(m)[c];
            if rank == 0 {
                let data = buffer.get(start);
                v.data_mut()[0] = data;
                if with_der {
                    v.resize_derivatives(n_der);
                    let dst = v.derivatives_mut();
                    for j in 0..n_der {
                        dst[j] = buffer.get(start + 1 + j);
                    }
                }
            } else if grid {
                let span = len * (1 + rank);
                v.data_mut()
                    .copy_from_slice(&buffer.as_slice()[start..start + span]);
            } else {
                for i in 0..len {
                    v.data_mut()[i] = buffer.get(start + i);
                }
            }
        }
        graph.node_mut(m).run_transform(tasks);
    }
}
