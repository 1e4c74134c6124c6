//! Flat accumulation buffer.
//!
//! One buffer per chain, addressed by the layout's buffer starts. It is
//! zeroed at the start of a pass, filled per task, merged across threads
//! and summed across processes before finalization drains it into the
//! component stores.

/// Reduction buffer backed by `Vec<f64>`.
#[derive(Debug, Clone, PartialEq)]
pub struct Buffer {
    data: Vec<f64>,
}

impl Buffer {
    /// Create a buffer with `len` slots, zero-initialized.
    #[inline]
    pub fn zeros(len: usize) -> Self {
        Buffer {
            data: vec![0.0; len],
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Zero every slot in place, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.iter_mut().for_each(|v| *v = 0.0);
    }

    #[inline]
    pub fn add(&mut self, i: usize, v: f64) {
        self.data[i] += v;
    }

    #[inline]
    pub fn get(&self, i: usize) -> f64 {
        self.data[i]
    }

    /// Elementwise sum of another buffer into this one.
    pub fn merge(&mut self, other: &Buffer) {
        debug_assert_eq!(self.data.len(), other.data.len());
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a += *b;
        }
    }

    #[inline]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

impl std::ops::Index<usize> for Buffer {
    type Output = f64;

    #[inline]
    fn index(&self, i: usize) -> &f64 {
        &self.data[i]
    }
}

impl std::ops::IndexMut<usize> for Buffer {
    #[inline]
    fn index_mut(&mut self, i: usize) -> &mut f64 {
        &mut self.data[i]
    }
}
