//! Per-task scratch space.
//!
//! One `TaskScratch` holds everything a single task streams through a
//! chain: a value per stream slot, a dense `(slot, derivative)` table with
//! explicit active-index lists so clearing and gathering touch only the
//! entries a task actually wrote, and the matrix row state (stashed row
//! values plus the row's derivative-index bookkeeping).
//!
//! Scratches are reused between tasks; `clear` walks the active lists
//! instead of zeroing the whole table.

/// Scratch sized for one chain: `(quantities, derivatives, columns,
/// matrices)` come from the stream layout.
#[derive(Debug)]
pub struct TaskScratch {
    n_quantities: usize,
    n_derivatives: usize,
    n_columns: usize,
    n_matrices: usize,
    task: usize,
    second: usize,
    values: Vec<f64>,
    derivs: Vec<f64>,
    active: Vec<usize>,
    n_active: Vec<usize>,
    stash: Vec<f64>,
    row_indices: Vec<usize>,
    n_row: Vec<usize>,
}

impl TaskScratch {
    pub fn new(
        n_quantities: usize,
        n_derivatives: usize,
        n_columns: usize,
        n_matrices: usize,
    ) -> Self {
        TaskScratch {
            n_quantities,
            n_derivatives,
            n_columns,
            n_matrices,
            task: 0,
            second: 0,
            values: vec![0.0; n_quantities],
            derivs: vec![0.0; n_quantities * n_derivatives],
            active: vec![0; n_quantities * n_derivatives],
            n_active: vec![0; n_quantities],
            stash: vec![0.0; n_matrices * n_columns],
            row_indices: vec![0; n_matrices * n_derivatives],
            n_row: vec![0; n_matrices],
        }
    }

    /// Task index currently streaming through this scratch.
    #[inline]
    pub fn task_index(&self) -> usize {
        self.task
    }

    pub(crate) fn set_task(&mut self, t: usize) {
        self.task = t;
    }

    /// Secondary index, the column while a matrix row is driven.
    #[inline]
    pub fn second_index(&self) -> usize {
        self.second
    }

    pub(crate) fn set_second(&mut self, s: usize) {
        self.second = s;
    }

    #[inline]
    pub fn n_quantities(&self) -> usize {
        self.n_quantities
    }

    #[inline]
    pub fn n_derivatives(&self) -> usize {
        self.n_derivatives
    }

    #[inline]
    pub fn get(&self, q: usize) -> f64 {
        self.values[q]
    }

    #[inline]
    pub fn add_value(&mut self, q: usize, v: f64) {
        self.values[q] += v;
    }

    #[inline]
    pub fn get_derivative(&self, q: usize, k: usize) -> f64 {
        self.derivs[q * self.n_derivatives + k]
    }

    #[inline]
    pub fn add_derivative(&mut self, q: usize, k: usize, d: f64) {
        debug_assert!(k < self.n_derivatives);
        self.derivs[q * self.n_derivatives + k] += d;
    }

    /// Record `k` as active for quantity `q` unless it already is.
    pub fn update_index(&mut self, q: usize, k: usize) {
        debug_assert!(k < self.n_derivatives);
        let base = q * self.n_derivatives;
        let n = self.n_active[q];
        if !self.active[base..base + n].contains(&k) {
            debug_assert!(n < self.n_derivatives, "active indices exceed derivative width");
            self.active[base + n] = k;
            self.n_active[q] += 1;
        }
    }

    #[inline]
    pub fn n_active(&self, q: usize) -> usize {
        self.n_active[q]
    }

    #[inline]
    pub fn active_index(&self, q: usize, i: usize) -> usize {
        self.active[q * self.n_derivatives + i]
    }

    /// Reset one quantity, zeroing only the derivatives it touched.
    pub fn clear_quantity(&mut self, q: usize) {
        self.values[q] = 0.0;
        let base = q * self.n_derivatives;
        for i in 0..self.n_active[q] {
            let k = self.active[base + i];
            self.derivs[base + k] = 0.0;
        }
        self.n_active[q] = 0;
    }

    /// Reset everything for the next task.
    pub fn clear(&mut self) {
        for q in 0..self.n_quantities {
            self.clear_quantity(q);
        }
        self.stash.iter_mut().for_each(|v| *v = 0.0);
        self.n_row.iter_mut().for_each(|n| *n = 0);
    }

    /// Stash a finished matrix element until the row is gathered.
    #[inline]
    pub(crate) fn stash_element(&mut self, mat: usize, col: usize, v: f64) {
        debug_assert!(col < self.n_columns);
        self.stash[mat * self.n_columns + col] = v;
    }

    #[inline]
    pub fn stashed(&self, mat: usize, col: usize) -> f64 {
        self.stash[mat * self.n_columns + col]
    }

    /// Record a derivative index in a matrix row's bookkeeping.
    pub fn push_row_index(&mut self, mat: usize, k: usize) {
        let base = mat * self.n_derivatives;
        let n = self.n_row[mat];
        if !self.row_indices[base..base + n].contains(&k) {
            debug_assert!(n < self.n_derivatives, "row indices exceed derivative width");
            self.row_indices[base + n] = k;
            self.n_row[mat] += 1;
        }
    }

    #[inline]
    pub fn n_row_indices(&self, mat: usize) -> usize {
        self.n_row[mat]
    }

    #[inline]
    pub fn row_index(&self, mat: usize, i: usize) -> usize {
        self.row_indices[mat * self.n_derivatives + i]
    }
}
