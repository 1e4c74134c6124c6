//! Elementwise functions over streamed vectors.

use smallvec::{smallvec, SmallVec};

use crate::error::EngineError;
use crate::kernel::{BuildContext, ChainView, Kernel};
use crate::scratch::TaskScratch;
use crate::value::ValueSpec;

/// A pointwise function of the task's argument elements.
///
/// Implementations fill `vals` with one number per output and `partials`
/// with the row-major `outputs x args` Jacobian; both come in zeroed.
pub trait ElementFn: Send + Sync {
    /// Output component suffixes. Empty means a single unnamed output.
    fn outputs(&self) -> Vec<String> {
        Vec::new()
    }

    fn eval(&self, args: &[f64], vals: &mut [f64], partials: &mut [f64]);

    /// Periodic domain of the outputs.
    fn periodic(&self) -> Option<(f64, f64)> {
        None
    }
}

/// Apply an [`ElementFn`] to every task of the argument vectors.
///
/// Rank-0 arguments broadcast; the rank-1 arguments must share a length,
/// which becomes the output length.
pub struct Map<F> {
    f: F,
    n_out: usize,
}

impl<F: ElementFn> Map<F> {
    pub fn new(f: F) -> Self {
        let n_out = f.outputs().len().max(1);
        Map { f, n_out }
    }
}

impl<F: ElementFn> Kernel for Map<F> {
    fn build(&self, ctx: &BuildContext) -> Result<Vec<ValueSpec>, EngineError> {
        ctx.require_args(1)?;
        let n = ctx.vector_length()?;
        let names = self.f.outputs();
        let dom = self.f.periodic();
        let mut specs = Vec::with_capacity(self.n_out);
        if names.is_empty() {
            specs.push(ValueSpec::vector(n));
        } else {
            for name in &names {
                specs.push(ValueSpec::vector(n).named(name));
            }
        }
        if let Some((min, max)) = dom {
            specs = specs.into_iter().map(|s| s.periodic(min, max)).collect();
        }
        Ok(specs)
    }

    fn perform_task(&self, view: &ChainView, scratch: &mut TaskScratch) {
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
}

/// `x^2` of the first argument.
pub struct Square;

impl ElementFn for Square {
    fn eval(&self, args: &[f64], vals: &mut [f64], partials: &mut [f64]) {
        vals[0] = args[0] * args[0];
        partials[0] = 2.0 * args[0];
    }
}

/// `k * x` of the first argument.
pub struct Scale {
    pub k: f64,
}

impl ElementFn for Scale {
    fn eval(&self, args: &[f64], vals: &mut [f64], partials: &mut [f64]) {
        vals[0] = self.k * args[0];
        partials[0] = self.k;
    }
}

/// Linear combination of the arguments with fixed coefficients.
pub struct Combine {
    pub coefficients: Vec<f64>,
}

impl ElementFn for Combine {
    fn eval(&self, args: &[f64], vals: &mut [f64], partials: &mut [f64]) {
        let mut acc = 0.0;
        for (j, (&x, &c)) in args.iter().zip(&self.coefficients).enumerate() {
            acc += c * x;
            partials[j] = c;
        }
        vals[0] = acc;
    }
}

/// Sine and cosine of the first argument as two components.
pub struct SinCos;

impl ElementFn for SinCos {
    fn outputs(&self) -> Vec<String> {
        vec!["sin".to_string(), "cos".to_string()]
    }

    fn eval(&self, args: &[f64], vals: &mut [f64], partials: &mut [f64]) {
        let (s, c) = args[0].sin_cos();
        vals[0] = s;
        vals[1] = c;
        partials[0] = c;
        partials[args.len()] = -s;
    }
}
