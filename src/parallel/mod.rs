//! Communicators used for the global reductions of the solvers.
//!
//! Every norm and inner product that feeds a convergence decision is summed through
//! [`Comm::all_reduce`], so cooperating processes see the same value and take the same branch.

use std::sync::Arc;

pub trait Comm {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
    fn barrier(&self);
    /// Sum of `x` over all processes.
    fn all_reduce(&self, x: f64) -> f64;
    /// Element-wise sum over all processes, in place.
    fn all_reduce_slice(&self, xs: &mut [f64]) {
        xs.iter_mut().for_each(|x| *x = self.all_reduce(*x));
    }
}

/// Single process communicator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialComm;

impl Comm for SerialComm {
    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn barrier(&self) {}
    fn all_reduce(&self, x: f64) -> f64 {
        x
    }
    fn all_reduce_slice(&self, _xs: &mut [f64]) {}
}

#[cfg(feature = "mpi")]
pub mod mpi_comm;
#[cfg(feature = "mpi")]
pub use mpi_comm::MpiComm;

#[cfg(feature = "rayon")]
pub mod rayon_comm;
#[cfg(feature = "rayon")]
pub use rayon_comm::RayonComm;

/// Communicator used when none is given: rayon's shared-memory one when enabled.
pub fn default_comm() -> Arc<dyn Comm> {
    #[cfg(feature = "rayon")]
    {
        Arc::new(RayonComm::new())
    }
    #[cfg(not(feature = "rayon"))]
    {
        Arc::new(SerialComm)
    }
}
