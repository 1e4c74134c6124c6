//! Integration tests for chain fusion.
//!
//! Fusion is decided at registration time, so these tests only build
//! graphs and inspect the resulting chain structure and errors.

use taskfuse::ops::{Combine, Map, MatSum, Reduce, Scale, Square, VStack, VectorSource};
use taskfuse::{EngineError, Graph, NodeId, NodeOp, ValueId};

fn vector(g: &mut Graph, label: &str, data: &[f64]) -> NodeId {
    let id = g
        .add_node(
            label,
            NodeOp::Stream(Box::new(VectorSource::new(data.len()))),
            &[],
        )
        .unwrap();
    g.set_data(id.value(), data).unwrap();
    id
}

fn square(g: &mut Graph, label: &str, arg: ValueId) -> NodeId {
    g.add_node(label, NodeOp::Stream(Box::new(Map::new(Square))), &[arg])
        .unwrap()
}

#[test]
fn test_pipeline_fuses_into_one_chain() {
    let mut g = Graph::new();
    let x = vector(&mut g, "x", &[1.0, 2.0, 3.0]);
    let sq = square(&mut g, "sq", x.value());
    let sum = g
        .add_node("sum", NodeOp::Stream(Box::new(Reduce::Sum)), &[sq.value()])
        .unwrap();

    assert_eq!(g.chains().len(), 1);
    assert_eq!(g.chain_labels(0), vec!["x", "sq", "sum"]);
    assert_eq!(g.chain_of(x), g.chain_of(sum));
}

#[test]
fn test_stored_value_splits_the_stream() {
    let mut g = Graph::new();
    let x = vector(&mut g, "x", &[1.0, 2.0, 3.0]);
    let sq = square(&mut g, "sq", x.value());
    g.mark_stored(sq.value());
    let sum = g
        .add_node("sum", NodeOp::Stream(Box::new(Reduce::Sum)), &[sq.value()])
        .unwrap();

    // the consumer reads the store instead of joining the producer chain
    assert_eq!(g.chains().len(), 2);
    assert_ne!(g.chain_of(sq), g.chain_of(sum));
    assert_eq!(g.chain_labels(0), vec!["x", "sq"]);
    assert_eq!(g.chain_labels(1), vec!["sum"]);
}

#[test]
fn test_diamond_shares_one_pass() {
    let mut g = Graph::new();
    let x = vector(&mut g, "x", &[0.5, 1.5, 2.5, 3.5]);
    let a = square(&mut g, "a", x.value());
    let b = g
        .add_node(
            "b",
            NodeOp::Stream(Box::new(Map::new(Scale { k: 2.0 }))),
            &[x.value()],
        )
        .unwrap();
    let c = g
        .add_node(
            "c",
            NodeOp::Stream(Box::new(Map::new(Combine {
                coefficients: vec![1.0, 1.0],
            }))),
            &[a.value(), b.value()],
        )
        .unwrap();

    assert_eq!(g.chains().len(), 1);
    assert_eq!(g.chains()[0].len(), 4);
    assert_eq!(g.chain_of(x), g.chain_of(c));
}

#[test]
fn test_matrix_after_stream_breaks_the_segment() {
    let mut g = Graph::new();
    let x = vector(&mut g, "x", &[1.0, 2.0, 3.0]);
    let stack = g
        .add_node("stack", NodeOp::Matrix(Box::new(VStack)), &[x.value()])
        .unwrap();
    // a stream node on x still joins behind the matrix segment
    let sq = square(&mut g, "sq", x.value());
    assert_eq!(g.chain_of(stack), g.chain_of(sq));

    // but a second matrix node would now split the segment, so it falls
    // back and materializes its argument
    let stack2 = g
        .add_node("stack2", NodeOp::Matrix(Box::new(VStack)), &[sq.value()])
        .unwrap();
    assert_ne!(g.chain_of(stack2), g.chain_of(stack));
    assert!(g.value(sq.value()).is_stored());
}

#[test]
fn test_matrix_value_streams_only_into_matrix_kernels() {
    let mut g = Graph::new();
    let x = vector(&mut g, "x", &[1.0, 2.0]);
    let stack = g
        .add_node("stack", NodeOp::Matrix(Box::new(VStack)), &[x.value()])
        .unwrap();
    // a matrix consumer rides the row driver
    let total = g
        .add_node("total", NodeOp::Matrix(Box::new(MatSum)), &[stack.value()])
        .unwrap();
    assert_eq!(g.chain_of(stack), g.chain_of(total));
    assert!(!g.value(stack.value()).is_stored());
}

#[test]
fn test_duplicate_label_rejected() {
    let mut g = Graph::new();
    vector(&mut g, "x", &[1.0]);
    let err = g
        .add_node("x", NodeOp::Stream(Box::new(VectorSource::new(1))), &[])
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateLabel { label } if label == "x"));
}

#[test]
fn test_unknown_component_rejected() {
    let mut g = Graph::new();
    let x = vector(&mut g, "x", &[1.0, 2.0]);
    let err = g
        .add_node(
            "sq",
            NodeOp::Stream(Box::new(Map::new(Square))),
            &[x.component(3)],
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::UnknownValue { .. }));
}

#[test]
fn test_inconsistent_ordering_is_fatal() {
    let mut g = Graph::new();
    let a1 = vector(&mut g, "a1", &[1.0; 8]);
    let a2 = square(&mut g, "a2", a1.value());
    g.mark_stored(a2.value());
    let b1 = vector(&mut g, "b1", &[2.0; 8]);
    // b2 reads a2 through the store, so it stays in b1's chain
    let b2 = g
        .add_node(
            "b2",
            NodeOp::Stream(Box::new(Map::new(Combine {
                coefficients: vec![1.0, 1.0],
            }))),
            &[b1.value(), a2.value()],
        )
        .unwrap();
    assert_ne!(g.chain_of(a2), g.chain_of(b2));

    // merging b2's chain in front of a2's would run b2 before the value
    // it consumes is computed
    let err = g
        .add_node(
            "c",
            NodeOp::Stream(Box::new(Map::new(Combine {
                coefficients: vec![1.0, 1.0],
            }))),
            &[b2.value(), a1.value()],
        )
        .unwrap_err();
    match err {
        EngineError::ChainOrder { before, after } => {
            assert_eq!(before, "a2");
            assert_eq!(after, "b2");
        }
        other => panic!("expected ChainOrder, got {other:?}"),
    }
    // the failed node leaves no trace
    assert!(g.find("c").is_none());

    // the same arguments in the other order fuse fine
    let c = g
        .add_node(
            "c",
            NodeOp::Stream(Box::new(Map::new(Combine {
                coefficients: vec![1.0, 1.0],
            }))),
            &[a1.value(), b2.value()],
        )
        .unwrap();
    assert_eq!(g.chains().len(), 1);
    assert_eq!(*g.chains()[0].last().unwrap(), c);
}

#[test]
fn test_mismatched_lengths_rejected_at_build() {
    let mut g = Graph::new();
    let a = vector(&mut g, "a", &[1.0, 2.0, 3.0]);
    let b = vector(&mut g, "b", &[1.0, 2.0]);
    let err = g
        .add_node(
            "c",
            NodeOp::Stream(Box::new(Map::new(Combine {
                coefficients: vec![1.0, 1.0],
            }))),
            &[a.value(), b.value()],
        )
        .unwrap_err();
    assert!(matches!(err, EngineError::ArgumentLength { .. }));
    assert!(g.find("c").is_none());
}
