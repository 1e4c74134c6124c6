//! Matrix-element kernels.

use smallvec::{smallvec, SmallVec};

use crate::error::EngineError;
use crate::kernel::{BuildContext, ChainView, MatrixKernel};
use crate::ops::ElementFn;
use crate::scratch::TaskScratch;
use crate::value::ValueSpec;

fn matrix_shape(ctx: &BuildContext) -> Result<(usize, usize), EngineError> {
    let mut shape = None;
    for i in 0..ctx.n_args() {
        let v = ctx.arg(i);
        match v.rank() {
            0 => {}
            2 => {
                let s = (v.shape()[0], v.shape()[1]);
                match shape {
                    None => shape = Some(s),
                    Some(p) if p == s => {}
                    Some(p) => {
                        return Err(EngineError::ArgumentLength {
                            label: ctx.label.to_string(),
                            arg: v.name().to_string(),
                            expected: p.0 * p.1,
                            found: s.0 * s.1,
                        });
                    }
                }
            }
            r => {
                return Err(EngineError::ArgumentRank {
                    label: ctx.label.to_string(),
                    arg: v.name().to_string(),
                    expected: 2,
                    found: r,
                });
            }
        }
    }
    shape.ok_or_else(|| EngineError::MissingArguments {
        label: ctx.label.to_string(),
    })
}

fn all_columns(view: &ChainView, cols: &mut Vec<usize>) {
    for j in 0..view.n_args() {
        let v = view.arg_value(j);
        if v.rank() == 2 {
            cols.extend(0..v.shape()[1]);
            return;
        }
    }
}

/// Apply an [`ElementFn`] to every element of the matrix arguments.
///
/// The rank-2 arguments must share a shape, which becomes the output
/// shape; rank-0 arguments broadcast.
pub struct MatMap<F> {
    f: F,
    n_out: usize,
}

impl<F: ElementFn> MatMap<F> {
    pub fn new(f: F) -> Self {
        let n_out = f.outputs().len().max(1);
        MatMap { f, n_out }
    }
}

impl<F: ElementFn> MatrixKernel for MatMap<F> {
    fn build(&self, ctx: &BuildContext) -> Result<Vec<ValueSpec>, EngineError> {
        ctx.require_args(1)?;
        let (rows, cols) = matrix_shape(ctx)?;
        let names = self.f.outputs();
        let dom = self.f.periodic();
        let mut specs = Vec::with_capacity(self.n_out);
        if names.is_empty() {
            specs.push(ValueSpec::matrix(rows, cols));
        } else {
            for name in &names {
                specs.push(ValueSpec::matrix(rows, cols).named(name));
            }
        }
        if let Some((min, max)) = dom {
            specs = specs.into_iter().map(|s| s.periodic(min, max)).collect();
        }
        Ok(specs)
    }

    fn setup_row(&self, _row: usize, view: &ChainView, cols: &mut Vec<usize>) {
        all_columns(view, cols);
    }

    fn element_task(&self, _row: usize, _col: usize, view: &ChainView, scratch: &mut TaskScratch) {
        let n_args = view.n_args();
        let mut args: SmallVec<[f64; 4]> = smallvec![0.0; n_args];
        for (j, a) in args.iter_mut().enumerate() {
            *a = view.arg(j, scratch);
        }
        let mut vals: SmallVec<[f64; 2]> = smallvec![0.0; self.n_out];
        let mut partials: SmallVec<[f64; 8]> = smallvec![0.0; self.n_out * n_args];
        self.f.eval(&args, &mut vals, &mut partials);
        for c in 0..self.n_out {
            view.add_value(c, vals[c], scratch);
            for j in 0..n_args {
                let d = partials[c * n_args + j];
                if d != 0.0 {
                    view.add_arg_derivative(j, c, d, scratch);
                }
            }
        }
    }

    fn end_of_row(&self, _row: usize, cols: &[usize], view: &ChainView, scratch: &mut TaskScratch) {
        for c in 0..self.n_out {
            for j in 0..view.n_args() {
                view.merge_arg_into_row(j, c, cols, scratch);
            }
        }
    }
}

/// Total of every element of the matrix arguments, as one scalar.
///
/// Riding a matrix chain this consumes each element while it is live, so
/// the matrix itself never needs to be materialized.
pub struct MatSum;

impl MatrixKernel for MatSum {
    fn build(&self, ctx: &BuildContext) -> Result<Vec<ValueSpec>, EngineError> {
        ctx.require_args(1)?;
        matrix_shape(ctx)?;
        Ok(vec![ValueSpec::scalar()])
    }

    fn setup_row(&self, _row: usize, view: &ChainView, cols: &mut Vec<usize>) {
        all_columns(view, cols);
    }

    fn element_task(&self, _row: usize, _col: usize, view: &ChainView, scratch: &mut TaskScratch) {
        for j in 0..view.n_args() {
            view.add_value(0, view.arg(j, scratch), scratch);
            // indices are merged once per row, not per element
            view.accumulate_arg_derivative(j, 0, 1.0, scratch);
        }
    }

    fn end_of_row(&self, _row: usize, cols: &[usize], view: &ChainView, scratch: &mut TaskScratch) {
        for j in 0..view.n_args() {
            view.merge_arg_into_actives(j, 0, cols, scratch);
        }
    }
}
