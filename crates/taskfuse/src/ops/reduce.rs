//! Scalar reductions over streamed vectors.

use crate::error::EngineError;
use crate::kernel::{BuildContext, ChainView, Kernel};
use crate::scratch::TaskScratch;
use crate::value::{Value, ValueSpec};

/// Reduce the elements of the argument vectors to one scalar.
///
/// Every argument contributes every element. The scalar keeps a full
/// derivative table, so a force on it propagates without re-running the
/// chain.
pub enum Reduce {
    /// Total of the elements.
    Sum,
    /// Total divided by the task count, applied after gathering.
    Mean,
}

impl Kernel for Reduce {
    fn build(&self, ctx: &BuildContext) -> Result<Vec<ValueSpec>, EngineError> {
        ctx.require_args(1)?;
        ctx.vector_length()?;
        Ok(vec![ValueSpec::scalar()])
    }

    fn perform_task(&self, view: &ChainView, scratch: &mut TaskScratch) {
        for j in 0..view.n_args() {
            view.add_value(0, view.arg(j, scratch), scratch);
            view.add_arg_derivative(j, 0, 1.0, scratch);
        }
    }

    fn transform_final(&self, n_tasks: usize, comps: &mut [Value]) {
        if let Reduce::Mean = self {
            let inv = 1.0 / n_tasks as f64;
            for v in comps.iter_mut() {
                v.data_mut()[0] *= inv;
                for d in v.derivatives_mut() {
                    *d *= inv;
                }
            }
        }
    }
}
