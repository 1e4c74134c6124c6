//! Bundled kernels.
//!
//! Enough to assemble useful pipelines out of the box: leaf sources,
//! elementwise maps, reductions and the matrix kernels. They double as
//! worked examples of the [`Kernel`](crate::Kernel) and
//! [`MatrixKernel`](crate::MatrixKernel) contracts.

mod map;
mod matmap;
mod reduce;
mod source;
mod stack;

pub use map::{Combine, ElementFn, Map, Scale, SinCos, Square};
pub use matmap::{MatMap, MatSum};
pub use reduce::Reduce;
pub use source::{PositionSource, VectorSource};
pub use stack::VStack;
