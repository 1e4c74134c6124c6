//! Process-group abstraction for the distributed half of a pass.
//!
//! The executor splits tasks across ranks by stride and sums buffers with
//! a single collective. That collective is the whole surface here, so the
//! engine can run under a real launcher or entirely in process.

use std::sync::{Arc, Barrier, Mutex};

/// A group of ranks that can sum flat buffers collectively.
pub trait Communicator: Send + Sync {
    /// This member's rank, in `0..size`.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Allreduce: elementwise sum of `data` across the group, result
    /// visible on every rank.
    fn sum(&self, data: &mut [f64]);
}

/// The one-rank group; `sum` has nothing to do.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    #[inline]
    fn rank(&self) -> usize {
        0
    }

    #[inline]
    fn size(&self) -> usize {
        1
    }

    fn sum(&self, _data: &mut [f64]) {}
}

struct LocalShared {
    size: usize,
    barrier: Barrier,
    acc: Mutex<Vec<f64>>,
}

/// An in-process rank group synchronized with barriers.
///
/// Each member is handed to its own thread; `sum` behaves like an MPI
/// allreduce over the group. Mainly a test vehicle for rank invariance,
/// but any transport implementing [`Communicator`] slots in the same way.
pub struct LocalComm {
    rank: usize,
    shared: Arc<LocalShared>,
}

impl LocalComm {
    /// Create a group of `n` members, one per rank.
    pub fn group(n: usize) -> Vec<LocalComm> {
        let shared = Arc::new(LocalShared {
            size: n,
            barrier: Barrier::new(n),
            acc: Mutex::new(Vec::new()),
        });
        (0..n)
            .map(|rank| LocalComm {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }
}

impl Communicator for LocalComm {
    #[inline]
    fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    fn size(&self) -> usize {
        self.shared.size
    }

    fn sum(&self, data: &mut [f64]) {
        if self.shared.size == 1 {
            return;
        }
        // entry barrier doubles as the exit guard of the previous call
        self.shared.barrier.wait();
        if self.rank == 0 {
            let mut acc = self.shared.acc.lock().unwrap_or_else(|e| e.into_inner());
            acc.clear();
            acc.resize(data.len(), 0.0);
        }
        self.shared.barrier.wait();
        {
            let mut acc = self.shared.acc.lock().unwrap_or_else(|e| e.into_inner());
            debug_assert_eq!(acc.len(), data.len());
            for (a, d) in acc.iter_mut().zip(data.iter()) {
                *a += *d;
            }
        }
        self.shared.barrier.wait();
        {
            let acc = self.shared.acc.lock().unwrap_or_else(|e| e.into_inner());
            data.copy_from_slice(&acc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_comm_is_identity() {
        let c = SerialComm;
        let mut data = vec![1.0, 2.0];
        c.sum(&mut data);
        assert_eq!(data, vec![1.0, 2.0]);
        assert_eq!(c.size(), 1);
        assert_eq!(c.rank(), 0);
    }

    #[test]
    fn test_local_group_allreduce() {
        let comms = LocalComm::group(4);
        std::thread::scope(|scope| {
            for comm in &comms {
                scope.spawn(move || {
                    let r = comm.rank() as f64;
                    let mut data = vec![r, 2.0 * r];
                    comm.sum(&mut data);
                    // 0+1+2+3 and twice that, on every rank
                    assert_eq!(data, vec![6.0, 12.0]);
                });
            }
        });
    }

    #[test]
    fn test_local_group_is_reusable() {
        let comms = LocalComm::group(2);
        std::thread::scope(|scope| {
            for comm in &comms {
                scope.spawn(move || {
                    let mut a = vec![1.0];
                    comm.sum(&mut a);
                    assert_eq!(a, vec![2.0]);
                    let mut b = vec![comm.rank() as f64; 3];
                    comm.sum(&mut b);
                    assert_eq!(b, vec![1.0, 1.0, 1.0]);
                });
            }
        });
    }
}
