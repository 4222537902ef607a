pub mod coloring;
pub mod convergence;
pub mod profile;

pub use convergence::SolveStats;
pub use profile::TimeProfile;
