//! Solver parameters shared by every algorithm.
//!
//! `InvertParam` is the caller-facing configuration of one inversion. A solver copies it into a
//! [`SolverParam`], mutates that copy while it iterates, and the caller folds the results back
//! with [`SolverParam::update_invert_param`].

use crate::error::KError;
use bitflags::bitflags;
use tracing::warn;

/// Maximum number of shifts handled by a multi-shift solve.
pub const MAX_SHIFTS: usize = 32;

/// Tile size the incremental eigCG search space is rounded up to.
pub const SEARCH_SPACE_TILE: usize = 16;

/// Which linear solver to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InverterType {
    #[default]
    Cg,
    BiCgStab,
    Gcr,
    Mr,
    MultiShiftCg,
    IncEigCg,
    AlphaSa,
    Mg,
    /// No solver; used to switch preconditioning off.
    Invalid,
}

impl InverterType {
    pub fn name(self) -> &'static str {
        match self {
            InverterType::Cg => "CG",
            InverterType::BiCgStab => "BiCGstab",
            InverterType::Gcr => "GCR",
            InverterType::Mr => "MR",
            InverterType::MultiShiftCg => "MultiShiftCG",
            InverterType::IncEigCg => "IncEigCG",
            InverterType::AlphaSa => "alphaSA",
            InverterType::Mg => "MG",
            InverterType::Invalid => "invalid",
        }
    }
}

bitflags! {
    /// Residual norms that must be satisfied for convergence. Both flags set requires both.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ResidualType: u8 {
        const L2_RELATIVE = 0b01;
        const HEAVY_QUARK = 0b10;
    }
}

impl Default for ResidualType {
    fn default() -> Self {
        ResidualType::L2_RELATIVE
    }
}

/// Floating point tier a piece of arithmetic is carried out in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Precision {
    Half,
    Single,
    #[default]
    Double,
}

impl Precision {
    /// Rounds a double to the nearest value representable in this tier.
    ///
    /// Half keeps the f32 exponent range with a 10-bit mantissa.
    #[inline]
    pub fn round(self, x: f64) -> f64 {
        match self {
            Precision::Double => x,
            Precision::Single => x as f32 as f64,
            Precision::Half => {
                let bits = (x as f32).to_bits();
                // round to nearest on the 13 dropped mantissa bits
                let rounded = bits.wrapping_add(0x0000_1000) & 0xFFFF_E000;
                f32::from_bits(rounded) as f64
            }
        }
    }

    pub fn round_slice(self, v: &mut [f64]) {
        if self != Precision::Double {
            v.iter_mut().for_each(|x| *x = self.round(*x));
        }
    }

    /// Unit roundoff of the tier.
    pub fn epsilon(self) -> f64 {
        match self {
            Precision::Half => 9.77e-4,
            Precision::Single => f32::EPSILON as f64,
            Precision::Double => f64::EPSILON,
        }
    }

    /// Storage bytes per real number.
    pub fn bytes(self) -> usize {
        match self {
            Precision::Half => 2,
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }
}

/// Solution the caller wants back: the full system or the parity reduced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolutionType {
    #[default]
    Mat,
    MatPc,
}

/// How a smoother attacks its system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SolveType {
    #[default]
    Direct,
    DirectPc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchwarzType {
    #[default]
    None,
    Additive,
    Multiplicative,
}

/// Reporting level, ordered from quietest to noisiest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Verbosity {
    Silent,
    #[default]
    Summarize,
    Verbose,
    Debug,
}

/// Caller-side description of an inversion, including the results written back after it.
#[derive(Debug, Clone)]
pub struct InvertParam {
    pub inv_type: InverterType,
    pub inv_type_precondition: InverterType,
    pub residual_type: ResidualType,
    pub use_init_guess: bool,
    pub reliable_delta: f64,
    pub pipeline: usize,
    pub tol: f64,
    pub tol_hq: f64,
    pub maxiter: usize,
    pub precision: Precision,
    pub precision_sloppy: Precision,
    pub precision_precondition: Precision,
    pub preserve_source: bool,
    pub num_offset: usize,
    pub offset: Vec<f64>,
    pub tol_offset: Vec<f64>,
    pub tol_hq_offset: Vec<f64>,
    pub gcr_nkrylov: usize,
    pub precondition_cycle: usize,
    pub tol_precondition: f64,
    pub maxiter_precondition: usize,
    pub omega: f64,
    pub schwarz_type: SchwarzType,
    pub nev: usize,
    pub max_search_dim: usize,
    pub deflation_grid: usize,
    pub rhs_idx: usize,
    pub verbosity: Verbosity,
    pub verbosity_precondition: Verbosity,

    // results
    pub true_res: f64,
    pub true_res_hq: f64,
    pub iter: usize,
    pub secs: f64,
    pub gflops: f64,
    pub true_res_offset: Vec<f64>,
    pub true_res_hq_offset: Vec<f64>,
}

impl Default for InvertParam {
    fn default() -> Self {
        Self {
            inv_type: InverterType::Cg,
            inv_type_precondition: InverterType::Invalid,
            residual_type: ResidualType::L2_RELATIVE,
            use_init_guess: false,
            reliable_delta: 0.1,
            pipeline: 0,
            tol: 1e-10,
            tol_hq: 0.0,
            maxiter: 1000,
            precision: Precision::Double,
            precision_sloppy: Precision::Double,
            precision_precondition: Precision::Double,
            preserve_source: true,
            num_offset: 0,
            offset: Vec::new(),
            tol_offset: Vec::new(),
            tol_hq_offset: Vec::new(),
            gcr_nkrylov: 10,
            precondition_cycle: 1,
            tol_precondition: 1e-1,
            maxiter_precondition: 10,
            omega: 1.0,
            schwarz_type: SchwarzType::None,
            nev: 0,
            max_search_dim: 0,
            deflation_grid: 0,
            rhs_idx: 0,
            verbosity: Verbosity::Silent,
            verbosity_precondition: Verbosity::Silent,
            true_res: 0.0,
            true_res_hq: 0.0,
            iter: 0,
            secs: 0.0,
            gflops: 0.0,
            true_res_offset: Vec::new(),
            true_res_hq_offset: Vec::new(),
        }
    }
}

impl InvertParam {
    pub fn with_inv_type(mut self, inv_type: InverterType) -> Self {
        self.inv_type = inv_type;
        self
    }

    pub fn with_tol(mut self, tol: f64) -> Self {
        self.tol = tol;
        self
    }

    pub fn with_maxiter(mut self, maxiter: usize) -> Self {
        self.maxiter = maxiter;
        self
    }

    /// Sets the multi-shift offsets, using `tol` for each of them.
    pub fn with_offsets(mut self, offsets: &[f64], tol: f64) -> Self {
        self.num_offset = offsets.len();
        self.offset = offsets.to_vec();
        self.tol_offset = vec![tol; offsets.len()];
        self.tol_hq_offset = vec![0.0; offsets.len()];
        self
    }

    pub fn with_deflation(mut self, nev: usize, max_search_dim: usize, deflation_grid: usize) -> Self {
        self.nev = nev;
        self.max_search_dim = max_search_dim;
        self.deflation_grid = deflation_grid;
        self
    }
}

/// Per-solve parameters and results.
#[derive(Debug, Clone)]
pub struct SolverParam {
    pub inv_type: InverterType,
    /// Inner solver used as preconditioner; `Invalid` disables it.
    pub inv_type_precondition: InverterType,
    pub residual_type: ResidualType,
    pub use_init_guess: bool,
    /// Reliable update tolerance.
    pub delta: f64,
    pub pipeline: usize,
    pub tol: f64,
    pub tol_hq: f64,
    pub true_res: f64,
    pub true_res_hq: f64,
    pub maxiter: usize,
    pub iter: usize,
    pub precision: Precision,
    pub precision_sloppy: Precision,
    pub precision_precondition: Precision,
    pub preserve_source: bool,

    pub num_offset: usize,
    pub offset: [f64; MAX_SHIFTS],
    pub tol_offset: [f64; MAX_SHIFTS],
    pub tol_hq_offset: [f64; MAX_SHIFTS],
    pub true_res_offset: [f64; MAX_SHIFTS],
    pub true_res_hq_offset: [f64; MAX_SHIFTS],

    /// Maximum size of the Krylov space before a restart.
    pub nkrylov: usize,
    /// Preconditioner applications per outer iteration.
    pub precondition_cycle: usize,
    pub tol_precondition: f64,
    pub maxiter_precondition: usize,
    /// Relaxation parameter.
    pub omega: f64,
    pub schwarz_type: SchwarzType,
    pub secs: f64,
    pub gflops: f64,

    /// Recompute the residual from scratch at the end of a solve.
    pub compute_true_res: bool,
    /// Accept convergence of the iterated residual without a true residual check.
    pub sloppy_converge: bool,
    /// Reduce norms across the communicator.
    pub global_reduction: bool,
    pub is_preconditioner: bool,
    pub verbosity: Verbosity,
    pub verbosity_precondition: Verbosity,

    // incremental eigCG
    pub nev: usize,
    /// Search space dimension.
    pub m: usize,
    pub deflation_grid: usize,
    pub rhs_idx: usize,
}

impl Default for SolverParam {
    fn default() -> Self {
        Self {
            inv_type: InverterType::Cg,
            inv_type_precondition: InverterType::Invalid,
            residual_type: ResidualType::L2_RELATIVE,
            use_init_guess: false,
            delta: 0.1,
            pipeline: 0,
            tol: 1e-10,
            tol_hq: 0.0,
            true_res: 0.0,
            true_res_hq: 0.0,
            maxiter: 1000,
            iter: 0,
            precision: Precision::Double,
            precision_sloppy: Precision::Double,
            precision_precondition: Precision::Double,
            preserve_source: true,
            num_offset: 0,
            offset: [0.0; MAX_SHIFTS],
            tol_offset: [0.0; MAX_SHIFTS],
            tol_hq_offset: [0.0; MAX_SHIFTS],
            true_res_offset: [0.0; MAX_SHIFTS],
            true_res_hq_offset: [0.0; MAX_SHIFTS],
            nkrylov: 10,
            precondition_cycle: 1,
            tol_precondition: 1e-1,
            maxiter_precondition: 10,
            omega: 1.0,
            schwarz_type: SchwarzType::None,
            secs: 0.0,
            gflops: 0.0,
            compute_true_res: true,
            sloppy_converge: false,
            global_reduction: true,
            is_preconditioner: false,
            verbosity: Verbosity::Silent,
            verbosity_precondition: Verbosity::Silent,
            nev: 0,
            m: 0,
            deflation_grid: 0,
            rhs_idx: 0,
        }
    }
}

impl SolverParam {
    pub fn new(inv_type: InverterType, tol: f64, maxiter: usize) -> Self {
        Self {
            inv_type,
            tol,
            maxiter,
            ..Default::default()
        }
    }

    /// Copies the configuration of an inversion.
    ///
    /// Fails when more shifts are requested than a multi-shift solve can hold, or when an
    /// incremental eigCG solve is configured with an empty search space or deflation grid.
    pub fn from_invert_param(param: &InvertParam) -> Result<Self, KError> {
        if param.num_offset > MAX_SHIFTS {
            return Err(KError::Config(format!(
                "num_offset {} exceeds MAX_SHIFTS {}",
                param.num_offset, MAX_SHIFTS
            )));
        }
        for (name, v) in [
            ("offset", &param.offset),
            ("tol_offset", &param.tol_offset),
        ] {
            if v.len() < param.num_offset {
                return Err(KError::Config(format!(
                    "{name} holds {} entries but num_offset is {}",
                    v.len(),
                    param.num_offset
                )));
            }
        }

        let mut out = SolverParam {
            inv_type: param.inv_type,
            inv_type_precondition: param.inv_type_precondition,
            residual_type: param.residual_type,
            use_init_guess: param.use_init_guess,
            delta: param.reliable_delta,
            pipeline: param.pipeline,
            tol: param.tol,
            tol_hq: param.tol_hq,
            true_res: param.true_res,
            true_res_hq: param.true_res_hq,
            maxiter: param.maxiter,
            iter: param.iter,
            precision: param.precision,
            precision_sloppy: param.precision_sloppy,
            precision_precondition: param.precision_precondition,
            preserve_source: param.preserve_source,
            num_offset: param.num_offset,
            nkrylov: param.gcr_nkrylov,
            precondition_cycle: param.precondition_cycle,
            tol_precondition: param.tol_precondition,
            maxiter_precondition: param.maxiter_precondition,
            omega: param.omega,
            schwarz_type: param.schwarz_type,
            secs: param.secs,
            gflops: param.gflops,
            verbosity: param.verbosity,
            verbosity_precondition: param.verbosity_precondition,
            nev: param.nev,
            m: param.max_search_dim,
            deflation_grid: param.deflation_grid,
            rhs_idx: 0,
            ..Default::default()
        };
        for i in 0..param.num_offset {
            out.offset[i] = param.offset[i];
            out.tol_offset[i] = param.tol_offset[i];
            out.tol_hq_offset[i] = param.tol_hq_offset.get(i).copied().unwrap_or(0.0);
        }

        if param.inv_type == InverterType::IncEigCg {
            if out.nev == 0 || out.m == 0 || out.deflation_grid == 0 {
                return Err(KError::Config(format!(
                    "incorrect deflation space parameters: nev {}, search dim {}, deflation grid {}",
                    out.nev, out.m, out.deflation_grid
                )));
            }
            if out.m % SEARCH_SPACE_TILE != 0 {
                out.m = (out.m / SEARCH_SPACE_TILE + 1) * SEARCH_SPACE_TILE;
                warn!(search_dim = out.m, "switched eigenvector search dimension");
            }
            out.rhs_idx = param.rhs_idx;
        }
        Ok(out)
    }

    /// Folds the results of this solve into the caller's configuration.
    ///
    /// Iteration counts and times accumulate, residuals overwrite, and the flop rate becomes
    /// the time weighted average of the old and new rates.
    pub fn update_invert_param(&self, param: &mut InvertParam) {
        param.true_res = self.true_res;
        param.true_res_hq = self.true_res_hq;
        param.iter += self.iter;
        let total = param.secs + self.secs;
        param.gflops = if total > 0.0 {
            (param.gflops * param.secs + self.gflops * self.secs) / total
        } else {
            self.gflops
        };
        param.secs = total;
        if param.true_res_offset.len() < self.num_offset {
            param.true_res_offset.resize(self.num_offset, 0.0);
        }
        if param.true_res_hq_offset.len() < self.num_offset {
            param.true_res_hq_offset.resize(self.num_offset, 0.0);
        }
        for i in 0..self.num_offset {
            param.true_res_offset[i] = self.true_res_offset[i];
            param.true_res_hq_offset[i] = self.true_res_hq_offset[i];
        }
        param.rhs_idx = self.rhs_idx;
    }

    /// Parameters for an inner solver acting as this solver's preconditioner.
    pub fn preconditioner_param(&self) -> SolverParam {
        SolverParam {
            inv_type: self.inv_type_precondition,
            inv_type_precondition: InverterType::Invalid,
            tol: self.tol_precondition,
            maxiter: self.maxiter_precondition,
            precision: self.precision_precondition,
            precision_sloppy: self.precision_precondition,
            precision_precondition: self.precision_precondition,
            use_init_guess: false,
            is_preconditioner: true,
            global_reduction: self.schwarz_type == SchwarzType::None,
            compute_true_res: false,
            sloppy_converge: true,
            verbosity: self.verbosity_precondition,
            verbosity_precondition: self.verbosity_precondition,
            omega: self.omega,
            nkrylov: self.nkrylov,
            residual_type: if self.inv_type_precondition == InverterType::Mr {
                ResidualType::empty()
            } else {
                ResidualType::L2_RELATIVE
            },
            ..Default::default()
        }
    }

    /// Active shift offsets.
    pub fn offsets(&self) -> &[f64] {
        &self.offset[..self.num_offset]
    }
}
