//! Adjoint force propagation.
//!
//! Forces seeded on output values are pulled back to the differentiation
//! sources by sweeping the chains in reverse registration order: a chain
//! projects the forces on its components through its task derivatives,
//! deposits the result on its stored argument values and on the source
//! blocks of its leaf members, and the chains producing those stored
//! values pick the deposits up when their own turn comes.
//!
//! A chain whose forced components are all rank 0 keeps its full
//! derivative table from the forward pass, so the projection is a plain
//! dot product and the task loop is skipped.

use rayon::prelude::*;

use crate::error::EngineError;
use crate::exec::{ensure_pool, run_task, thread_count, ChainPlan, ExecutionContext, Runner};
use crate::graph::Graph;
use crate::layout::StreamLayout;
use crate::scratch::TaskScratch;
use crate::value::ValueId;

impl Runner {
    /// Pull the forces on every forced value back to the sources.
    ///
    /// Leaf contributions accumulate in [`Graph::source_forces`]; forces on
    /// stored intermediate values are consumed by the producing chain
    /// within the same sweep. Seeds stay on the values until
    /// [`Graph::clear_forces`] resets them for the next step.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::GridForce`] if a force was seeded on a grid
    /// value, and [`EngineError::StaleLayout`] if the graph changed since
    /// this runner was built.
    pub fn apply_forces(
        &mut self,
        graph: &mut Graph,
        ctx: &ExecutionContext,
    ) -> Result<(), EngineError> {
        self.check_version(graph)?;
        let Runner { chains, pool, .. } = self;
        for plan in chains.iter_mut().rev() {
            if !plan.active {
                continue;
            }
            apply_chain(graph, plan, pool, ctx)?;
        }
        Ok(())
    }
}

fn apply_chain(
    graph: &mut Graph,
    plan: &mut ChainPlan,
    pool: &mut Option<(usize, rayon::ThreadPool)>,
    ctx: &ExecutionContext,
) -> Result<(), EngineError> {
    let n_der = plan.layout.n_derivatives();
    let mut any = false;
    let mut shortcut = plan.layout.with_derivatives();
    for &m in plan.layout.members() {
        for comp in graph.components(m) {
            if !comp.forces_added() {
                continue;
            }
            if comp.is_grid() {
                return Err(EngineError::GridForce {
                    label: comp.name().to_string(),
                });
            }
            any = true;
            if comp.rank() != 0 || comp.derivatives().len() != n_der {
                shortcut = false;
            }
        }
    }
    if !any {
        return Ok(());
    }
    plan.forces.clear();
    plan.forces.resize(n_der, 0.0);
    if shortcut {
        for &m in plan.layout.members() {
            for comp in graph.components(m) {
                if !comp.forces_added() {
                    continue;
                }
                let f = comp.force(0);
                if f == 0.0 {
                    continue;
                }
                for (k, d) in comp.derivatives().iter().enumerate() {
                    plan.forces[k] += f * d;
                }
            }
        }
    } else {
        force_task_loop(graph, plan, pool, ctx)?;
        if !ctx.serial && ctx.comm.size() > 1 && !plan.forces.is_empty() {
            ctx.comm.sum(&mut plan.forces);
        }
    }
    distribute(graph, &plan.layout, &plan.forces);
    Ok(())
}

/// Re-run the chain's tasks, projecting forces through the live
/// derivatives instead of accumulating values.
fn force_task_loop(
    graph: &Graph,
    plan: &mut ChainPlan,
    pool: &mut Option<(usize, rayon::ThreadPool)>,
    ctx: &ExecutionContext,
) -> Result<(), EngineError> {
    let layout = &plan.layout;
    let n_der = layout.n_derivatives();
    let ntasks = layout.tasks();
    let (stride, rank) = if ctx.serial {
        (1, 0)
    } else {
        (ctx.comm.size(), ctx.comm.rank())
    };
    let nt = thread_count(ctx.threads, ntasks, stride);
    if nt <= 1 {
        let scratch = &mut plan.scratch;
        let mut cols = Vec::new();
        let mut t = rank;
        while t < ntasks {
            run_task(graph, layout, t, scratch, &mut cols, Some(plan.forces.as_mut_slice()));
            gather_forces(graph, layout, t, scratch, &mut plan.forces);
            scratch.clear();
            t += stride;
        }
    } else {
        let dims = (
            layout.n_quantities(),
            n_der,
            layout.n_columns(),
            layout.n_matrices(),
        );
        let tasks: Vec<usize> = (rank..ntasks).step_by(stride).collect();
        let pool = ensure_pool(pool, nt)?;
        let merged = pool.install(|| {
            tasks
                .par_iter()
                .with_min_len(10)
                .fold(
                    || (TaskScratch::new(dims.0, dims.1, dims.2, dims.3), Vec::new(), vec![0.0; n_der]),
                    |(mut s, mut c, mut f), &t| {
                        run_task(graph, layout, t, &mut s, &mut c, Some(f.as_mut_slice()));
                        gather_forces(graph, layout, t, &s, &mut f);
                        s.clear();
                        (s, c, f)
                    },
                )
                .map(|(_, _, f)| f)
                .reduce(
                    || vec![0.0; n_der],
                    |mut a, b| {
                        for (x, y) in a.iter_mut().zip(&b) {
                            *x += y;
                        }
                        a
                    },
                )
        });
        for (x, y) in plan.forces.iter_mut().zip(&merged) {
            *x += y;
        }
    }
    Ok(())
}

/// Fold one task's force contributions into the chain force vector.
///
/// Rank-2 components are projected inside the row driver while their
/// element derivatives are live; grids were rejected upfront.
fn gather_forces(
    g: &Graph,
    layout: &StreamLayout,
    t: usize,
    scratch: &TaskScratch,
    forces: &mut [f64],
) {
    for &m in layout.members() {
        for (c, comp) in g.components(m).iter().enumerate() {
            if !comp.forces_added() || comp.rank() > 1 || comp.is_grid() {
                continue;
            }
            let f = if comp.rank() == 0 {
                comp.force(0)
            } else {
                comp.force(t)
            };
            if f == 0.0 {
                continue;
            }
            let q = layout.comp_slot(m, c);
            for i in 0..scratch.n_active(q) {
                let k = scratch.active_index(q, i);
                forces[k] += f * scratch.get_derivative(q, k);
            }
        }
    }
}

/// Deposit a chain's accumulated forces on its inputs: stored argument
/// blocks first, then the source blocks of leaf members.
fn distribute(graph: &mut Graph, layout: &StreamLayout, forces: &[f64]) {
    for &(vid, start, len) in layout.stored_blocks() {
        if graph.node(vid.node).is_leaf() {
            let base = source_offset(graph, vid);
            for i in 0..len {
                let f = forces[start + i];
                if f != 0.0 {
                    graph.add_source_force(vid.node, base + i, f);
                }
            }
        } else {
            for i in 0..len {
                let f = forces[start + i];
                if f != 0.0 {
                    graph.value_mut(vid).add_force(i, f);
                }
            }
        }
    }
    for &m in layout.members() {
        if let Some(start) = layout.self_block(m) {
            let n = graph.source_forces(m).len();
            for e in 0..n {
                let f = forces[start + e];
                if f != 0.0 {
                    graph.add_source_force(m, e, f);
                }
            }
        }
    }
}

/// Flat offset of `id`'s first element within its node's source block.
fn source_offset(graph: &Graph, id: ValueId) -> usize {
    graph.components(id.node)[..id.comp]
        .iter()
        .filter(|v| !v.is_constant())
        .map(|v| v.len())
        .sum()
}
