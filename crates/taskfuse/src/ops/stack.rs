//! Stacking vectors into a matrix.

use crate::error::EngineError;
use crate::kernel::{BuildContext, ChainView, MatrixKernel};
use crate::scratch::TaskScratch;
use crate::value::ValueSpec;

/// Stack rank-1 arguments as the columns of one matrix.
///
/// Row `r` holds element `r` of every argument, one column per argument
/// in registration order. Rank-0 arguments broadcast down their column.
/// The arguments must agree on length and periodicity, since the elements
/// end up side by side in a single value.
pub struct VStack;

impl MatrixKernel for VStack {
    fn build(&self, ctx: &BuildContext) -> Result<Vec<ValueSpec>, EngineError> {
        ctx.require_args(1)?;
        let n = ctx.vector_length()?;
        let dom = ctx.common_periodic()?;
        let mut spec = ValueSpec::matrix(n, ctx.n_args());
        if let Some((min, max)) = dom {
            spec = spec.periodic(min, max);
        }
        Ok(vec![spec])
    }

    fn setup_row(&self, _row: usize, view: &ChainView, cols: &mut Vec<usize>) {
        cols.extend(0..view.n_args());
    }

    fn element_task(&self, _row: usize, col: usize, view: &ChainView, scratch: &mut TaskScratch) {
        view.add_value(0, view.arg(col, scratch), scratch);
        view.add_arg_derivative(col, 0, 1.0, scratch);
    }

    fn end_of_row(&self, _row: usize, cols: &[usize], view: &ChainView, scratch: &mut TaskScratch) {
        for j in 0..view.n_args() {
            view.merge_arg_into_row(j, 0, cols, scratch);
        }
    }
}
