//! Chain assembly.
//!
//! A chain is the unit of streaming: its members share one task-index
//! domain and one pass over it. Fusion happens when a node is registered.
//! Rank>0 arguments that are neither stored nor constant must stream, so
//! their producers' chains are merged and the new node is appended at the
//! tail. If the merge is impossible the node falls back to standalone
//! evaluation and its arguments are materialized instead; only an
//! inconsistent ordering is a hard error, because a chain can never stream
//! backwards.

use petgraph::graph::DiGraph;
use petgraph::visit::EdgeRef;
use std::collections::HashMap;

use crate::error::EngineError;
use crate::graph::{Graph, NodeId};

/// Fold a freshly registered node into the chain structure.
pub(crate) fn integrate(graph: &mut Graph, id: NodeId) -> Result<(), EngineError> {
    if !graph.op(id).wants_chain() {
        fallback(graph, id);
        return Ok(());
    }
    let args = graph.arguments(id).to_vec();
    let mut heads: Vec<usize> = Vec::new();
    for &a in &args {
        let v = graph.value(a);
        if v.rank() == 0 || v.is_constant() {
            continue;
        }
        if v.is_grid() {
            // per-point derivatives cannot ride the stream
            fallback(graph, id);
            return Ok(());
        }
        if v.is_stored() {
            continue;
        }
        if v.rank() == 2 && !graph.op(id).is_matrix() {
            // matrix elements live only inside the row driver
            fallback(graph, id);
            return Ok(());
        }
        if let Some(c) = graph.chain_of(a.node) {
            if !heads.contains(&c) {
                heads.push(c);
            }
        }
    }
    if heads.is_empty() {
        push_singleton(graph, id);
        return Ok(());
    }

    let mut members: Vec<NodeId> = Vec::new();
    for &h in &heads {
        members.extend(graph.chains[h].iter().copied());
    }
    members.push(id);

    if !compatible(graph, &members) {
        fallback(graph, id);
        return Ok(());
    }
    verify_order(graph, &members)?;

    heads.sort_unstable();
    for h in heads.into_iter().rev() {
        graph.chains.remove(h);
    }
    graph.chains.push(members);
    for (ci, ch) in graph.chains.iter().enumerate() {
        for &n in ch {
            graph.chain_of[n.index()] = Some(ci);
        }
    }
    Ok(())
}

/// Standalone evaluation: materialize the rank>0 arguments, own chain.
fn fallback(graph: &mut Graph, id: NodeId) {
    let args = graph.arguments(id).to_vec();
    for a in args {
        let v = graph.value(a);
        if v.rank() > 0 && !v.is_constant() && !v.is_stored() {
            graph.mark_stored(a);
        }
    }
    push_singleton(graph, id);
}

fn push_singleton(graph: &mut Graph, id: NodeId) {
    graph.chains.push(vec![id]);
    graph.chain_of[id.index()] = Some(graph.chains.len() - 1);
}

/// Structural rules a merged chain must satisfy. Failing them is not an
/// error, it just sends the newcomer down the fallback path.
fn compatible(graph: &Graph, members: &[NodeId]) -> bool {
    // a chain holding grid components accepts no newcomers
    if members[..members.len() - 1]
        .iter()
        .any(|&n| has_grid(graph, n))
    {
        return false;
    }
    // the matrix segment is driven row by row as one block, so matrix
    // nodes must stay consecutive and agree on the column count
    let mats: Vec<usize> = members
        .iter()
        .enumerate()
        .filter(|&(_, &n)| graph.op(n).is_matrix())
        .map(|(i, _)| i)
        .collect();
    if let (Some(&first), Some(&last)) = (mats.first(), mats.last()) {
        if last - first + 1 != mats.len() {
            return false;
        }
        let mut ncols = None;
        for &i in &mats {
            if let Some(c) = matrix_columns(graph, members[i]) {
                match ncols {
                    None => ncols = Some(c),
                    Some(n) if n == c => {}
                    Some(_) => return false,
                }
            }
        }
    }
    true
}

/// Every dependency must sit at a lower position than its consumer.
fn verify_order(graph: &Graph, members: &[NodeId]) -> Result<(), EngineError> {
    let mut dg: DiGraph<NodeId, ()> = DiGraph::new();
    let mut index = HashMap::new();
    let mut position = HashMap::new();
    for (pos, &m) in members.iter().enumerate() {
        index.insert(m, dg.add_node(m));
        position.insert(m, pos);
    }
    for &m in members {
        for &a in graph.arguments(m) {
            if let Some(&pi) = index.get(&a.node) {
                dg.update_edge(pi, index[&m], ());
            }
        }
    }
    for e in dg.edge_references() {
        let before = dg[e.source()];
        let after = dg[e.target()];
        if position[&before] > position[&after] {
            return Err(EngineError::ChainOrder {
                before: graph.label(before).to_string(),
                after: graph.label(after).to_string(),
            });
        }
    }
    Ok(())
}

fn has_grid(graph: &Graph, n: NodeId) -> bool {
    graph.components(n).iter().any(|c| c.is_grid())
}

fn matrix_columns(graph: &Graph, n: NodeId) -> Option<usize> {
    graph
        .components(n)
        .iter()
        .find(|c| c.rank() == 2 && !c.is_grid())
        .map(|c| c.shape()[1])
}

/// Task-index cardinality of one node's domain.
///
/// Matrices run one task per row; everything else runs one per element of
/// the first rank>0 component, falling back to the first rank>0 argument
/// for scalar reductions. Pure scalar nodes get a single task.
pub fn node_task_count(graph: &Graph, id: NodeId) -> usize {
    for c in graph.components(id) {
        if c.is_constant() {
            continue;
        }
        if c.rank() == 2 && !c.is_grid() {
            return c.shape()[0];
        }
        if c.rank() > 0 {
            return c.len();
        }
    }
    for &a in graph.arguments(id) {
        let v = graph.value(a);
        if v.is_constant() {
            continue;
        }
        if v.rank() == 2 && !v.is_grid() {
            return v.shape()[0];
        }
        if v.rank() > 0 {
            return v.len();
        }
    }
    1
}

/// Shared task count of a chain.
///
/// # Errors
///
/// All members must agree; the first node that disagrees with the head is
/// reported.
pub fn task_count(graph: &Graph, members: &[NodeId]) -> Result<usize, EngineError> {
    let mut tasks = None;
    for &m in members {
        let n = node_task_count(graph, m);
        match tasks {
            None => tasks = Some(n),
            Some(t) if t == n => {}
            Some(_) => {
                return Err(EngineError::TaskCountMismatch {
                    label: graph.label(m).to_string(),
                });
            }
        }
    }
    Ok(tasks.unwrap_or(1))
}
