//! MPI communicator for distributed solves.
//!
//! Each process owns a slab of every field; the solvers only need the reductions, which go
//! through `MPI_Allreduce` on the world communicator.
//!
//! # References
//! - [MPI Standard](https://www.mpi-forum.org/)

use mpi::collective::SystemOperation;
use mpi::environment::Universe;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;

use crate::error::KError;

pub struct MpiComm {
    /// The MPI world communicator (all processes in the job).
    pub world: SimpleCommunicator,
    pub rank: usize,
    pub size: usize,
    // finalizes MPI when dropped, so it must outlive `world`
    _universe: Universe,
}

impl MpiComm {
    /// Initializes MPI; fails when it was initialized before.
    pub fn new() -> Result<Self, KError> {
        let universe = mpi::initialize()
            .ok_or_else(|| KError::Config("MPI was already initialized".into()))?;
        let world = universe.world();
        let rank = world.rank() as usize;
        let size = world.size() as usize;
        Ok(MpiComm {
            world,
            rank,
            size,
            _universe: universe,
        })
    }
}

impl super::Comm for MpiComm {
    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
    fn barrier(&self) {
        self.world.barrier();
    }
    fn all_reduce(&self, x: f64) -> f64 {
        let mut y = x;
        self.world.all_reduce_into(&x, &mut y, &SystemOperation::sum());
        y
    }
    fn all_reduce_slice(&self, xs: &mut [f64]) {
        let send = xs.to_vec();
        self.world
            .all_reduce_into(&send[..], xs, &SystemOperation::sum());
    }
}
