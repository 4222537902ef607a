//! Multigrid hierarchy configuration.
//!
//! Every per-level setting is an array indexed by level, level 0 being the finest grid. Entries
//! past `n_level` are ignored.

use super::param::{InverterType, Precision, SchwarzType, SolutionType, SolveType, Verbosity};
use crate::error::KError;

/// Deepest hierarchy supported.
pub const MAX_MG_LEVEL: usize = 5;

/// Lattice dimensions.
pub const NDIM: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CycleType {
    /// Each level is visited once per descent.
    #[default]
    VCycle,
    /// Each level is a bottom Krylov solver preconditioned by the next level.
    Recursive,
    WCycle,
}

/// Where a level gets its near-null-space vectors from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NullSpace {
    /// Relaxed solves from random seeds.
    #[default]
    Compute,
    /// A [`NullSpaceSource`](crate::multigrid::NullSpaceSource) keyed by level.
    Load,
    /// Analytically known free-field vectors.
    Free,
}

#[derive(Debug, Clone)]
pub struct MgParam {
    pub n_level: usize,
    pub geo_block_size: [[usize; NDIM]; MAX_MG_LEVEL],
    /// 0 aggregates parity into the coarse spin.
    pub spin_block_size: [usize; MAX_MG_LEVEL],
    pub n_vec: [usize; MAX_MG_LEVEL],
    pub nu_pre: [usize; MAX_MG_LEVEL],
    pub nu_post: [usize; MAX_MG_LEVEL],

    pub smoother: [InverterType; MAX_MG_LEVEL],
    pub smoother_tol: [f64; MAX_MG_LEVEL],
    pub smoother_solve_type: [SolveType; MAX_MG_LEVEL],
    pub smoother_precision: [Precision; MAX_MG_LEVEL],
    pub smoother_schwarz_type: [SchwarzType; MAX_MG_LEVEL],
    pub omega: [f64; MAX_MG_LEVEL],

    pub coarse_grid_solution_type: [SolutionType; MAX_MG_LEVEL],
    pub coarse_solver: [InverterType; MAX_MG_LEVEL],
    pub coarse_solver_tol: [f64; MAX_MG_LEVEL],
    pub coarse_solver_maxiter: [usize; MAX_MG_LEVEL],
    pub cycle_type: [CycleType; MAX_MG_LEVEL],

    pub null_space: [NullSpace; MAX_MG_LEVEL],
    pub setup_inv_type: [InverterType; MAX_MG_LEVEL],
    pub setup_tol: [f64; MAX_MG_LEVEL],
    pub setup_maxiter: [usize; MAX_MG_LEVEL],
    pub setup_maxiter_refresh: [usize; MAX_MG_LEVEL],
    /// Setup passes; more than one refines the vectors with the partially built hierarchy.
    pub num_setup_iter: [usize; MAX_MG_LEVEL],
    pub precision_null: [Precision; MAX_MG_LEVEL],
    /// Generate vectors on every level instead of restricting the finer set.
    pub generate_all_levels: bool,
    pub pre_orthonormalize: bool,
    pub post_orthonormalize: bool,
    pub seed: u64,

    pub precision: Precision,
    pub run_verify: bool,
    pub verbosity: [Verbosity; MAX_MG_LEVEL],
}

impl Default for MgParam {
    fn default() -> Self {
        Self {
            n_level: 2,
            geo_block_size: [[2; NDIM]; MAX_MG_LEVEL],
            spin_block_size: [1; MAX_MG_LEVEL],
            n_vec: [4; MAX_MG_LEVEL],
            nu_pre: [2; MAX_MG_LEVEL],
            nu_post: [2; MAX_MG_LEVEL],
            smoother: [InverterType::Mr; MAX_MG_LEVEL],
            smoother_tol: [0.25; MAX_MG_LEVEL],
            smoother_solve_type: [SolveType::Direct; MAX_MG_LEVEL],
            smoother_precision: [Precision::Double; MAX_MG_LEVEL],
            smoother_schwarz_type: [SchwarzType::None; MAX_MG_LEVEL],
            omega: [0.85; MAX_MG_LEVEL],
            coarse_grid_solution_type: [SolutionType::Mat; MAX_MG_LEVEL],
            coarse_solver: [InverterType::Gcr; MAX_MG_LEVEL],
            coarse_solver_tol: [0.25; MAX_MG_LEVEL],
            coarse_solver_maxiter: [100; MAX_MG_LEVEL],
            cycle_type: [CycleType::VCycle; MAX_MG_LEVEL],
            null_space: [NullSpace::Compute; MAX_MG_LEVEL],
            setup_inv_type: [InverterType::Mr; MAX_MG_LEVEL],
            setup_tol: [5e-6; MAX_MG_LEVEL],
            setup_maxiter: [20; MAX_MG_LEVEL],
            setup_maxiter_refresh: [10; MAX_MG_LEVEL],
            num_setup_iter: [1; MAX_MG_LEVEL],
            precision_null: [Precision::Double; MAX_MG_LEVEL],
            generate_all_levels: false,
            pre_orthonormalize: false,
            post_orthonormalize: true,
            seed: 1234,
            precision: Precision::Double,
            run_verify: true,
            verbosity: [Verbosity::Silent; MAX_MG_LEVEL],
        }
    }
}

impl MgParam {
    pub fn new(n_level: usize) -> Self {
        Self {
            n_level,
            ..Default::default()
        }
    }

    pub fn with_block(mut self, level: usize, block: [usize; NDIM], spin_block_size: usize) -> Self {
        self.geo_block_size[level] = block;
        self.spin_block_size[level] = spin_block_size;
        self
    }

    pub fn with_n_vec(mut self, level: usize, n_vec: usize) -> Self {
        self.n_vec[level] = n_vec;
        self
    }

    pub fn with_smoothing(mut self, level: usize, smoother: InverterType, nu_pre: usize, nu_post: usize) -> Self {
        self.smoother[level] = smoother;
        self.nu_pre[level] = nu_pre;
        self.nu_post[level] = nu_post;
        self
    }

    pub fn with_null_space(mut self, level: usize, source: NullSpace) -> Self {
        self.null_space[level] = source;
        self
    }

    pub fn with_verify(mut self, run_verify: bool) -> Self {
        self.run_verify = run_verify;
        self
    }

    /// Checks the settings that do not depend on the operators.
    pub fn validate(&self) -> Result<(), KError> {
        if self.n_level == 0 || self.n_level > MAX_MG_LEVEL {
            return Err(KError::Config(format!(
                "number of levels {} outside 1..={}",
                self.n_level, MAX_MG_LEVEL
            )));
        }
        for l in 0..self.n_level.saturating_sub(1) {
            if self.n_vec[l] == 0 {
                return Err(KError::Config(format!("level {l} has no null-space vectors")));
            }
            if self.geo_block_size[l].iter().any(|&b| b == 0) {
                return Err(KError::Config(format!("level {l} has a zero block size")));
            }
            if !matches!(self.cycle_type[l], CycleType::VCycle | CycleType::Recursive) {
                return Err(KError::Config(format!(
                    "multigrid cycle type {:?} not supported",
                    self.cycle_type[l]
                )));
            }
        }
        for l in 0..self.n_level {
            if self.coarse_grid_solution_type[l] == SolutionType::MatPc
                && self.smoother_solve_type[l] != SolveType::DirectPc
            {
                return Err(KError::Config(format!(
                    "level {l}: a parity preconditioned coarse-grid solution requires a preconditioned smoother"
                )));
            }
        }
        Ok(())
    }
}
