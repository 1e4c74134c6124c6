//! Node arena and registration.
//!
//! Nodes live in a flat arena addressed by stable [`NodeId`]s; chains are
//! index sequences over the arena rather than intrusive links. Fusion runs
//! at registration time, so the order in which nodes are added decides what
//! can stream together.

use crate::chain;
use crate::error::EngineError;
use crate::kernel::{BuildContext, NodeOp};
use crate::value::{Value, ValueId, ValueSpec};

/// Unique identifier for a node in the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// Get the internal index.
    #[inline]
    pub fn index(&self) -> usize {
        self.0
    }

    /// Id of this node's only (or first) component.
    #[inline]
    pub fn value(&self) -> ValueId {
        ValueId::of(*self)
    }

    /// Id of this node's component `c`.
    #[inline]
    pub fn component(&self, c: usize) -> ValueId {
        ValueId {
            node: *self,
            comp: c,
        }
    }
}

/// One registered node: a kernel, its arguments and its components.
pub struct Node {
    label: String,
    op: NodeOp,
    args: Vec<ValueId>,
    comps: Vec<Value>,
    // adjoints landing on this node's own inputs; sized for leaves only
    source_forces: Vec<f64>,
}

impl Node {
    #[inline]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[inline]
    pub fn arguments(&self) -> &[ValueId] {
        &self.args
    }

    #[inline]
    pub fn components(&self) -> &[Value] {
        &self.comps
    }

    /// A leaf has no arguments and acts as a differentiation source.
    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.args.is_empty()
    }

    pub(crate) fn run_transform(&mut self, n_tasks: usize) {
        self.op.transform_final(n_tasks, &mut self.comps);
    }
}

/// The computation graph: an arena of nodes plus the chains over it.
pub struct Graph {
    pub(crate) nodes: Vec<Node>,
    pub(crate) chains: Vec<Vec<NodeId>>,
    pub(crate) chain_of: Vec<Option<usize>>,
    version: u64,
}

impl Graph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Graph {
            nodes: Vec::new(),
            chains: Vec::new(),
            chain_of: Vec::new(),
            version: 0,
        }
    }

    /// Register a node and fuse it into a chain where possible.
    ///
    /// The kernel declares its components from the resolved arguments, then
    /// the chain builder either appends the node to a compatible chain or
    /// falls back to standalone evaluation, materializing the rank>0
    /// arguments it needs.
    ///
    /// # Errors
    ///
    /// Duplicate labels, invalid argument ids, kernel-specific argument
    /// validation and chain ordering violations all fail registration.
    pub fn add_node(&mut self, label: &str, op: NodeOp, args: &[ValueId]) -> Result<NodeId, EngineError> {
        if self.find(label).is_some() {
            return Err(EngineError::DuplicateLabel {
                label: label.to_string(),
            });
        }
        for &a in args {
            self.check_value(label, a)?;
        }
        let ctx = BuildContext {
            label,
            args: args.iter().map(|&a| self.value(a)).collect(),
        };
        let specs = op.build(&ctx)?;
        let comps: Vec<Value> = specs
            .into_iter()
            .map(|spec| {
                let name = match &spec.name {
                    Some(s) => format!("{label}.{s}"),
                    None => label.to_string(),
                };
                Value::new(name, spec)
            })
            .collect();
        let source_forces = if args.is_empty() {
            let n = op.source_width().unwrap_or_else(|| {
                comps
                    .iter()
                    .filter(|c| !c.is_constant())
                    .map(|c| c.len())
                    .sum()
            });
            vec![0.0; n]
        } else {
            Vec::new()
        };
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            label: label.to_string(),
            op,
            args: args.to_vec(),
            comps,
            source_forces,
        });
        self.chain_of.push(None);
        if let Err(e) = chain::integrate(self, id) {
            self.nodes.pop();
            self.chain_of.pop();
            return Err(e);
        }
        self.version += 1;
        Ok(id)
    }

    fn check_value(&self, label: &str, id: ValueId) -> Result<(), EngineError> {
        let ok = self
            .nodes
            .get(id.node.index())
            .is_some_and(|n| id.comp < n.comps.len());
        if !ok {
            return Err(EngineError::UnknownValue {
                label: label.to_string(),
                node: id.node.index(),
                comp: id.comp,
            });
        }
        Ok(())
    }

    /// Look a node up by label.
    pub fn find(&self, label: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.label == label)
            .map(NodeId)
    }

    #[inline]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    #[inline]
    pub fn label(&self, id: NodeId) -> &str {
        &self.nodes[id.index()].label
    }

    #[inline]
    pub fn arguments(&self, id: NodeId) -> &[ValueId] {
        &self.nodes[id.index()].args
    }

    #[inline]
    pub fn components(&self, id: NodeId) -> &[Value] {
        &self.nodes[id.index()].comps
    }

    #[inline]
    pub fn value(&self, id: ValueId) -> &Value {
        &self.nodes[id.node.index()].comps[id.comp]
    }

    /// Mutable component access, e.g. to push external forces.
    #[inline]
    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.nodes[id.node.index()].comps[id.comp]
    }

    pub(crate) fn op(&self, id: NodeId) -> &NodeOp {
        &self.nodes[id.index()].op
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub(crate) fn components_mut(&mut self, id: NodeId) -> &mut [Value] {
        &mut self.nodes[id.index()].comps
    }

    /// Push external data into a leaf value.
    ///
    /// The slice must match the raw storage length, which for grid values
    /// means point values interleaved with their per-axis derivatives.
    pub fn set_data(&mut self, id: ValueId, data: &[f64]) -> Result<(), EngineError> {
        let node = &self.nodes[id.node.index()];
        if !node.is_leaf() {
            return Err(EngineError::NotSettable {
                label: node.label.clone(),
            });
        }
        let v = &mut self.nodes[id.node.index()].comps[id.comp];
        if data.len() != v.data().len() {
            return Err(EngineError::DataLength {
                label: v.name().to_string(),
                expected: v.data().len(),
                found: data.len(),
            });
        }
        v.data_mut().copy_from_slice(data);
        Ok(())
    }

    /// Materialize a component so standalone consumers can read it.
    pub fn mark_stored(&mut self, id: ValueId) {
        self.nodes[id.node.index()].comps[id.comp].set_stored();
        self.version += 1;
    }

    /// The chains assembled so far, in registration order.
    #[inline]
    pub fn chains(&self) -> &[Vec<NodeId>] {
        &self.chains
    }

    /// Which chain a node belongs to.
    #[inline]
    pub fn chain_of(&self, id: NodeId) -> Option<usize> {
        self.chain_of[id.index()]
    }

    /// Labels of every node in one chain, in execution order.
    pub fn chain_labels(&self, chain: usize) -> Vec<String> {
        self.chains[chain]
            .iter()
            .map(|&n| self.nodes[n.index()].label.clone())
            .collect()
    }

    /// Adjoints accumulated on a leaf's own inputs (e.g. atom forces).
    #[inline]
    pub fn source_forces(&self, id: NodeId) -> &[f64] {
        &self.nodes[id.index()].source_forces
    }

    pub(crate) fn add_source_force(&mut self, id: NodeId, i: usize, f: f64) {
        self.nodes[id.index()].source_forces[i] += f;
    }

    /// Zero every accumulated force, typically at a step boundary.
    pub fn clear_forces(&mut self) {
        for node in &mut self.nodes {
            for v in &mut node.comps {
                v.clear_force();
            }
            node.source_forces.iter_mut().for_each(|f| *f = 0.0);
        }
    }

    /// Bumped on any structural change; runners pin the version they saw.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("num_nodes", &self.nodes.len())
            .field("num_chains", &self.chains.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{ChainView, Kernel};
    use crate::scratch::TaskScratch;

    struct TestSource {
        n: usize,
    }

    impl Kernel for TestSource {
        fn build(&self, _ctx: &BuildContext) -> Result<Vec<ValueSpec>, EngineError> {
            Ok(vec![ValueSpec::vector(self.n).stored()])
        }

        fn perform_task(&self, _view: &ChainView, _scratch: &mut TaskScratch) {}
    }

    struct TestMap;

    impl Kernel for TestMap {
        fn build(&self, ctx: &BuildContext) -> Result<Vec<ValueSpec>, EngineError> {
            Ok(vec![ValueSpec::vector(ctx.vector_length()?)])
        }

        fn perform_task(&self, _view: &ChainView, _scratch: &mut TaskScratch) {}
    }

    #[test]
    fn test_register_and_find() {
        let mut g = Graph::new();
        let src = g
            .add_node("src", NodeOp::Stream(Box::new(TestSource { n: 4 })), &[])
            .unwrap();
        assert_eq!(src.index(), 0);
        assert_eq!(g.find("src"), Some(src));
        assert_eq!(g.find("missing"), None);
        assert_eq!(g.value(src.value()).len(), 4);
        assert!(g.node(src).is_leaf());
    }

    #[test]
    fn test_duplicate_label_rejected() {
        let mut g = Graph::new();
        g.add_node("a", NodeOp::Stream(Box::new(TestSource { n: 2 })), &[])
            .unwrap();
        let err = g
            .add_node("a", NodeOp::Stream(Box::new(TestSource { n: 2 })), &[])
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateLabel { .. }));
    }

    #[test]
    fn test_unknown_argument_rejected() {
        let mut g = Graph::new();
        let bogus = ValueId {
            node: NodeId(7),
            comp: 0,
        };
        let err = g
            .add_node("f", NodeOp::Stream(Box::new(TestMap)), &[bogus])
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownValue { .. }));
    }

    #[test]
    fn test_leaf_source_forces_sized() {
        let mut g = Graph::new();
        let src = g
            .add_node("src", NodeOp::Stream(Box::new(TestSource { n: 6 })), &[])
            .unwrap();
        assert_eq!(g.source_forces(src).len(), 6);
    }

    #[test]
    fn test_set_data_checks_length_and_target() {
        let mut g = Graph::new();
        let src = g
            .add_node("src", NodeOp::Stream(Box::new(TestSource { n: 3 })), &[])
            .unwrap();
        let f = g
            .add_node("f", NodeOp::Stream(Box::new(TestMap)), &[src.value()])
            .unwrap();
        g.set_data(src.value(), &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(g.value(src.value()).get(1), 2.0);
        assert!(matches!(
            g.set_data(src.value(), &[1.0]),
            Err(EngineError::DataLength { .. })
        ));
        assert!(matches!(
            g.set_data(f.value(), &[0.0; 3]),
            Err(EngineError::NotSettable { .. })
        ));
    }

    #[test]
    fn test_version_bumps_on_changes() {
        let mut g = Graph::new();
        let v0 = g.version();
        let src = g
            .add_node("src", NodeOp::Stream(Box::new(TestSource { n: 3 })), &[])
            .unwrap();
        assert!(g.version() > v0);
        let v1 = g.version();
        g.mark_stored(src.value());
        assert!(g.version() > v1);
    }
}
