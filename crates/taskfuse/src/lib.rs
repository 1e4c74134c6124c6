//! taskfuse - chain-fused streaming evaluation of task graphs
//!
//! Nodes registered on a [`Graph`] fuse into chains: runs of nodes that
//! share one task-index domain and evaluate in a single streaming pass,
//! so intermediate vectors never have to be materialized. A [`Runner`]
//! drives the pass over threads and an optional rank group, merging
//! per-thread buffers and summing across ranks, and
//! [`Runner::apply_forces`] pulls adjoints seeded on output values back
//! to the leaf sources through the same task machinery.
//!
//! # Architecture
//!
//! ```text
//! Graph                               Runner (one per configuration)
//!   add_node → fusion at registration   StreamLayout  frozen index tables
//!   Kernel / MatrixKernel objects       TaskScratch   per-task values,
//!   Value components (+ forces)                       derivatives, actives
//!                                       Buffer        thread-merged sums
//!                                       apply_forces  reverse chain sweep
//! ```
//!
//! # Example
//!
//! ```
//! use taskfuse::ops::{Map, Reduce, Square, VectorSource};
//! use taskfuse::{ExecutionContext, Graph, NodeOp, Runner};
//!
//! let mut g = Graph::new();
//! let x = g.add_node("x", NodeOp::Stream(Box::new(VectorSource::new(4))), &[])?;
//! g.set_data(x.value(), &[1.0, 2.0, 3.0, 4.0])?;
//! let sq = g.add_node("sq", NodeOp::Stream(Box::new(Map::new(Square))), &[x.value()])?;
//! let sum = g.add_node("sum", NodeOp::Stream(Box::new(Reduce::Sum)), &[sq.value()])?;
//!
//! // everything fused into one chain, evaluated in one pass
//! assert_eq!(g.chains().len(), 1);
//! let mut runner = Runner::new(&g)?;
//! runner.run(&mut g, &ExecutionContext::serial())?;
//! assert_eq!(g.value(sum.value()).get(0), 30.0);
//! # Ok::<(), taskfuse::EngineError>(())
//! ```

pub mod buffer;
pub mod chain;
pub mod comm;
pub mod error;
pub mod exec;
mod forces;
pub mod graph;
pub mod kernel;
mod layout;
pub mod ops;
pub mod scratch;
pub mod value;

pub use buffer::Buffer;
pub use comm::{Communicator, LocalComm, SerialComm};
pub use error::EngineError;
pub use exec::{ExecutionContext, Runner};
pub use graph::{Graph, Node, NodeId};
pub use kernel::{BuildContext, ChainView, Kernel, MatrixKernel, NodeOp};
pub use scratch::TaskScratch;
pub use value::{StoragePolicy, Value, ValueId, ValueSpec};
