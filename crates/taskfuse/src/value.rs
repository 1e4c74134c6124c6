//! Named output slots of graph nodes.
//!
//! Every node owns one `Value` per component. A value carries its shape and
//! periodicity metadata, the flat data written back after a pass, the scalar
//! derivative table for rank-0 components, and the external forces that
//! consumers (or the caller) push onto it between passes.

use crate::graph::NodeId;

/// Addresses one component of one node, graph-wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ValueId {
    pub node: NodeId,
    pub comp: usize,
}

impl ValueId {
    /// First (often only) component of a node.
    #[inline]
    pub fn of(node: NodeId) -> Self {
        ValueId { node, comp: 0 }
    }
}

/// Whether a component's elements are kept after the pass or live only in
/// per-task scratch while a chain streams through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoragePolicy {
    /// Elements exist only inside the stream; downstream nodes in the same
    /// chain read them from scratch.
    Streamed,
    /// Elements are accumulated into the buffer and copied into `data`.
    Stored,
}

/// Declaration of one component, produced by a kernel at registration.
#[derive(Debug, Clone)]
pub struct ValueSpec {
    pub name: Option<String>,
    pub shape: Vec<usize>,
    pub has_derivatives: bool,
    pub periodic: Option<(f64, f64)>,
    pub policy: StoragePolicy,
    pub constant: bool,
}

impl ValueSpec {
    /// A rank-0 component. Scalars always carry a derivative table.
    pub fn scalar() -> Self {
        ValueSpec {
            name: None,
            shape: Vec::new(),
            has_derivatives: true,
            periodic: None,
            policy: StoragePolicy::Stored,
            constant: false,
        }
    }

    /// A rank-1 component with `n` elements.
    ///
    /// # Examples
    ///
    /// ```
    /// use taskfuse::ValueSpec;
    ///
    /// let spec = ValueSpec::vector(8).periodic(-0.5, 0.5);
    /// assert_eq!(spec.shape, vec![8]);
    /// assert!(!spec.has_derivatives);
    /// ```
    pub fn vector(n: usize) -> Self {
        ValueSpec {
            name: None,
            shape: vec![n],
            has_derivatives: false,
            periodic: None,
            policy: StoragePolicy::Streamed,
            constant: false,
        }
    }

    /// A rank-2 component with `rows * cols` elements.
    pub fn matrix(rows: usize, cols: usize) -> Self {
        ValueSpec {
            name: None,
            shape: vec![rows, cols],
            has_derivatives: false,
            periodic: None,
            policy: StoragePolicy::Streamed,
            constant: false,
        }
    }

    /// A function on a grid: rank > 0 with derivatives stored per point.
    pub fn grid(shape: &[usize]) -> Self {
        ValueSpec {
            name: None,
            shape: shape.to_vec(),
            has_derivatives: true,
            periodic: None,
            policy: StoragePolicy::Stored,
            constant: false,
        }
    }

    /// Component name suffix; the full value name becomes `label.name`.
    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Declare a periodic codomain `[min, max)`.
    pub fn periodic(mut self, min: f64, max: f64) -> Self {
        self.periodic = Some((min, max));
        self
    }

    /// Keep the elements after the pass.
    pub fn stored(mut self) -> Self {
        self.policy = StoragePolicy::Stored;
        self
    }

    /// Mark the component as fixed data with no derivatives behind it.
    pub fn constant(mut self) -> Self {
        self.constant = true;
        self.policy = StoragePolicy::Stored;
        self
    }

    fn element_count(&self) -> usize {
        self.shape.iter().product::<usize>().max(1)
    }
}

/// One named output slot.
///
/// Grid values interleave each point's value with its `rank` derivatives, so
/// `data` holds `len() * (1 + rank())` numbers; everything else stores one
/// number per element.
#[derive(Debug, Clone)]
pub struct Value {
    name: String,
    shape: Vec<usize>,
    has_derivatives: bool,
    periodic: Option<(f64, f64)>,
    policy: StoragePolicy,
    constant: bool,
    data: Vec<f64>,
    derivatives: Vec<f64>,
    forces: Vec<f64>,
    forces_added: bool,
}

impl Value {
    pub(crate) fn new(name: String, spec: ValueSpec) -> Self {
        let len = spec.element_count();
        let data_len = if spec.has_derivatives && !spec.shape.is_empty() {
            len * (1 + spec.shape.len())
        } else {
            len
        };
        Value {
            name,
            shape: spec.shape,
            has_derivatives: spec.has_derivatives,
            periodic: spec.periodic,
            policy: spec.policy,
            constant: spec.constant,
            data: vec![0.0; data_len],
            derivatives: Vec::new(),
            forces: vec![0.0; len],
            forces_added: false,
        }
    }

    /// Full name, `label` or `label.component`.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of dimensions: 0 scalar, 1 vector, 2 matrix.
    #[inline]
    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements (scalars have one).
    #[inline]
    pub fn len(&self) -> usize {
        self.shape.iter().product::<usize>().max(1)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rank > 0 with per-point derivatives.
    #[inline]
    pub fn is_grid(&self) -> bool {
        self.has_derivatives && !self.shape.is_empty()
    }

    #[inline]
    pub fn has_derivatives(&self) -> bool {
        self.has_derivatives
    }

    #[inline]
    pub fn periodic(&self) -> Option<(f64, f64)> {
        self.periodic
    }

    #[inline]
    pub fn policy(&self) -> StoragePolicy {
        self.policy
    }

    #[inline]
    pub fn is_stored(&self) -> bool {
        self.policy == StoragePolicy::Stored
    }

    #[inline]
    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub(crate) fn set_stored(&mut self) {
        self.policy = StoragePolicy::Stored;
    }

    /// Element `i` (the point value for grids).
    #[inline]
    pub fn get(&self, i: usize) -> f64 {
        if self.is_grid() {
            self.data[i * (1 + self.rank())]
        } else {
            self.data[i]
        }
    }

    #[inline]
    pub fn set(&mut self, i: usize, v: f64) {
        debug_assert!(!self.is_grid());
        self.data[i] = v;
    }

    /// Derivative of grid point `i` along grid dimension `dim`.
    #[inline]
    pub fn grid_derivative(&self, i: usize, dim: usize) -> f64 {
        debug_assert!(self.is_grid() && dim < self.rank());
        self.data[i * (1 + self.rank()) + 1 + dim]
    }

    /// Raw storage, interleaved for grids.
    #[inline]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Scalar derivative with respect to stream derivative index `j`.
    ///
    /// Populated for rank-0 components after a pass; the index space is the
    /// owning chain's derivative layout.
    #[inline]
    pub fn get_derivative(&self, j: usize) -> f64 {
        self.derivatives.get(j).copied().unwrap_or(0.0)
    }

    #[inline]
    pub fn derivatives(&self) -> &[f64] {
        &self.derivatives
    }

    pub(crate) fn resize_derivatives(&mut self, n: usize) {
        self.derivatives.clear();
        self.derivatives.resize(n, 0.0);
    }

    pub(crate) fn derivatives_mut(&mut self) -> &mut [f64] {
        &mut self.derivatives
    }

    /// Add an external adjoint on element `i`.
    pub fn add_force(&mut self, i: usize, f: f64) {
        debug_assert!(!self.constant, "forces cannot act on constant values");
        self.forces[i] += f;
        self.forces_added = true;
    }

    #[inline]
    pub fn force(&self, i: usize) -> f64 {
        self.forces[i]
    }

    #[inline]
    pub fn forces_added(&self) -> bool {
        self.forces_added
    }

    /// Zero the accumulated forces, typically at a step boundary.
    pub fn clear_force(&mut self) {
        if self.forces_added {
            self.forces.iter_mut().for_each(|f| *f = 0.0);
            self.forces_added = false;
        }
    }
}
