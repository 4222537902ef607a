//! latsolve: Krylov, deflated and multigrid solvers for lattice operators
//!
//! The crate solves `A x = b` for operators acting on fields over a four dimensional lattice
//! in checkerboard order. Every solver implements [`Solver`] and is created from a
//! [`SolverParam`] through a [`SolverContext`], which also carries the timing profile and the
//! communicator for global reductions. Adaptive multigrid ([`Mg`]) is a [`Solver`] too and is
//! normally handed to GCR as its preconditioner.

pub mod parallel;

pub mod config;
pub mod context;
pub mod core;
pub mod error;
pub mod lattice;
pub mod multigrid;
pub mod solver;
pub mod utils;

// Re-exports for convenience
pub use config::*;
pub use context::*;
pub use self::core::*;
pub use error::*;
pub use lattice::*;
pub use multigrid::{
    CoarseOp, CoarsePcOp, MemoryNullSpace, Mg, MgState, NullSpaceSource, Transfer, free_field_vectors,
};
pub use solver::*;
pub use utils::*;

// Re-export SolveStats at the crate root for convenience
pub use utils::convergence::SolveStats;
