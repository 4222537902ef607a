//! Lattice geometry and the discretized operators built on it.

pub mod geometry;
pub mod laplace;
pub mod staggered;

pub use geometry::{FieldLayout, Lattice};
pub use laplace::LaplaceOp;
pub use staggered::{StaggeredOp, StaggeredPcOp};
