//! Leaf sources: externally provided data entering the stream.

use crate::error::EngineError;
use crate::kernel::{BuildContext, ChainView, Kernel};
use crate::scratch::TaskScratch;
use crate::value::ValueSpec;

/// A caller-filled vector of `n` elements, one task per element.
///
/// Elements are pushed in through [`crate::Graph::set_data`] before a pass
/// and streamed with an identity derivative on the leaf's source block, so
/// adjoints around the chain land back on the matching element of
/// [`crate::Graph::source_forces`].
///
/// # Examples
///
/// ```
/// use taskfuse::{Graph, NodeOp};
/// use taskfuse::ops::VectorSource;
///
/// let mut g = Graph::new();
/// let x = g.add_node("x", NodeOp::Stream(Box::new(VectorSource::new(3))), &[])?;
/// g.set_data(x.value(), &[0.5, 1.5, 2.5])?;
/// # Ok::<(), taskfuse::EngineError>(())
/// ```
pub struct VectorSource {
    n: usize,
    periodic: Option<(f64, f64)>,
    constant: bool,
}

impl VectorSource {
    pub fn new(n: usize) -> Self {
        VectorSource {
            n,
            periodic: None,
            constant: false,
        }
    }

    /// Fixed data: consumers read plain numbers and no derivatives or
    /// forces ever flow through the value.
    pub fn constant(n: usize) -> Self {
        VectorSource {
            n,
            periodic: None,
            constant: true,
        }
    }

    /// Declare the elements to live on a periodic domain.
    pub fn periodic(mut self, min: f64, max: f64) -> Self {
        self.periodic = Some((min, max));
        self
    }
}

impl Kernel for VectorSource {
    fn build(&self, _ctx: &BuildContext) -> Result<Vec<ValueSpec>, EngineError> {
        let mut spec = ValueSpec::vector(self.n);
        if let Some((min, max)) = self.periodic {
            spec = spec.periodic(min, max);
        }
        if self.constant {
            spec = spec.constant();
        }
        Ok(vec![spec])
    }

    fn perform_task(&self, view: &ChainView, scratch: &mut TaskScratch) {
        let t = scratch.task_index();
        view.add_value(0, view.own_value(0, t), scratch);
        view.add_self_derivative(0, t, 1.0, scratch);
    }
}

/// Cartesian positions of `n` particles plus a constant 3x3 cell.
///
/// Components `x`, `y` and `z` stream one particle per task. The source
/// block is `3n + 9` wide: three slots per particle followed by nine cell
/// slots, so kernels that differentiate with respect to the cell have a
/// place to put those contributions and the matching forces come back out
/// of the same tail.
pub struct PositionSource {
    n: usize,
}

impl PositionSource {
    pub fn new(n: usize) -> Self {
        PositionSource { n }
    }

    /// Particle count.
    #[inline]
    pub fn len(&self) -> usize {
        self.n
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n == 0
    }
}

impl Kernel for PositionSource {
    fn build(&self, _ctx: &BuildContext) -> Result<Vec<ValueSpec>, EngineError> {
        Ok(vec![
            ValueSpec::vector(self.n).named("x"),
            ValueSpec::vector(self.n).named("y"),
            ValueSpec::vector(self.n).named("z"),
            ValueSpec::vector(9).named("box").constant(),
        ])
    }

    fn perform_task(&self, view: &ChainView, scratch: &mut TaskScratch) {
        let t = scratch.task_index();
        for c in 0..3 {
            view.add_value(c, view.own_value(c, t), scratch);
            view.add_self_derivative(c, c * self.n + t, 1.0, scratch);
        }
    }

    fn source_width(&self) -> Option<usize> {
        Some(3 * self.n + 9)
    }
}
