//! Adaptive aggregation multigrid.
//!
//! A hierarchy is a chain of [`Mg`] levels, each owning the next coarser one. A level holds
//! near-null vectors of its operator, the [`Transfer`] built from them, pre- and post-smoothers
//! and the Galerkin coarse operator `R A P`. Used as a [`Solver`], a level applies one cycle and
//! is meant to precondition an outer flexible Krylov method such as GCR.
//!
//! The [`SolverContext`] of a level carries the residual operator in `mat` (always the full
//! lattice), and the smoother operator and its sloppy version in `mat_sloppy` and
//! `mat_precon`. With `DirectPc` smoothing the latter two are even-odd preconditioned.
//!
//! # References
//! - Brannick, J. et al. (2008). Adaptive multigrid algorithm for lattice QCD.
//! - Babich, R. et al. (2010). Adaptive multigrid algorithm for the lattice Wilson-Dirac operator.

pub mod coarse_op;
pub mod null_space;
pub mod transfer;
pub mod verify;

pub use coarse_op::{CoarseOp, CoarsePcOp};
pub use null_space::{MemoryNullSpace, NullSpaceSource, free_field_vectors};
pub use transfer::Transfer;

use crate::config::{
    CycleType, InverterType, MAX_MG_LEVEL, MgParam, NullSpace, ResidualType, SchwarzType, SolutionType,
    SolveType, SolverParam,
};
use crate::context::SolverContext;
use crate::core::blas;
use crate::core::traits::{LinearOperator, OperatorRef, SiteSubset};
use crate::core::wrappers::Rounded;
use crate::error::{KError, check_len};
use crate::lattice::FieldLayout;
use crate::solver::{AlphaSa, Gcr, SolveTimer, Solver};
use crate::utils::convergence::SolveStats;
use null_space::random_vectors;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::Arc;
use tracing::{debug, info};

/// Life cycle of a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgState {
    Uninitialized,
    /// Being built or reset; cycles are refused.
    Setup,
    Ready,
}

/// How a level solves its coarse-grid problem.
enum CoarseSolver {
    /// One cycle of the coarse level.
    Nested,
    /// GCR on the coarse operator, optionally preconditioned by the coarse level and run on
    /// the even-odd reduced coarse system.
    Bottom {
        solver: Gcr,
        precondition: bool,
        pc_op: Option<OperatorRef>,
    },
}

pub struct Mg {
    param: Arc<MgParam>,
    level: usize,
    state: MgState,
    solver_param: SolverParam,
    ctx: SolverContext,
    source: Option<Arc<dyn NullSpaceSource>>,
    null_vectors: Vec<Vec<f64>>,
    transfer: Option<Transfer>,
    coarse_op: Option<Arc<CoarseOp>>,
    presmoother: Option<Box<dyn Solver>>,
    postsmoother: Option<Box<dyn Solver>>,
    coarse: Option<Box<Mg>>,
    coarse_solver: Option<CoarseSolver>,
    r: Vec<f64>,
    r_pc: Vec<f64>,
    b_tilde: Vec<f64>,
    correction: Vec<f64>,
    r_coarse: Vec<f64>,
    x_coarse: Vec<f64>,
}

impl Mg {
    /// Builds the whole hierarchy below the finest level described by `ctx`.
    pub fn new(param: MgParam, ctx: SolverContext) -> Result<Self, KError> {
        Self::build(Arc::new(param), 0, ctx, None, None)
    }

    /// Like [`Mg::new`], with `source` supplying the levels whose null space is `Load`.
    pub fn with_source(
        param: MgParam,
        ctx: SolverContext,
        source: Arc<dyn NullSpaceSource>,
    ) -> Result<Self, KError> {
        Self::build(Arc::new(param), 0, ctx, Some(source), None)
    }

    fn build(
        param: Arc<MgParam>,
        level: usize,
        ctx: SolverContext,
        source: Option<Arc<dyn NullSpaceSource>>,
        inherited: Option<Vec<Vec<f64>>>,
    ) -> Result<Self, KError> {
        if level >= MAX_MG_LEVEL || level >= param.n_level {
            return Err(KError::Config(format!(
                "level {level} outside a hierarchy of {} levels",
                param.n_level
            )));
        }
        if level == 0 {
            param.validate()?;
        }
        let expected = match param.smoother_solve_type[level] {
            SolveType::DirectPc => SiteSubset::Parity,
            SolveType::Direct => SiteSubset::Full,
        };
        if ctx.mat_sloppy.site_subset() != expected || ctx.mat_precon.site_subset() != expected {
            return Err(KError::Config(format!(
                "level {level}: smoother operator acts on {:?} sites but the smoother solve type is {:?}",
                ctx.mat_sloppy.site_subset(),
                param.smoother_solve_type[level]
            )));
        }
        if ctx.mat.site_subset() != SiteSubset::Full {
            return Err(KError::Config(format!(
                "level {level}: the residual operator must act on the full lattice"
            )));
        }

        let mut solver_param = SolverParam::new(InverterType::Mg, 0.0, 1);
        solver_param.is_preconditioner = true;
        solver_param.precision = param.precision;
        solver_param.verbosity = param.verbosity[level];

        let mut mg = Self {
            param,
            level,
            state: MgState::Uninitialized,
            solver_param,
            ctx,
            source,
            null_vectors: Vec::new(),
            transfer: None,
            coarse_op: None,
            presmoother: None,
            postsmoother: None,
            coarse: None,
            coarse_solver: None,
            r: Vec::new(),
            r_pc: Vec::new(),
            b_tilde: Vec::new(),
            correction: Vec::new(),
            r_coarse: Vec::new(),
            x_coarse: Vec::new(),
        };
        if !mg.is_coarsest() {
            mg.init_null_space(inherited)?;
        }
        mg.reset(false)?;
        Ok(mg)
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn state(&self) -> MgState {
        self.state
    }

    pub fn is_coarsest(&self) -> bool {
        self.level + 1 == self.param.n_level
    }

    pub fn mg_param(&self) -> &MgParam {
        &self.param
    }

    pub fn null_vectors(&self) -> &[Vec<f64>] {
        &self.null_vectors
    }

    pub fn transfer(&self) -> Option<&Transfer> {
        self.transfer.as_ref()
    }

    pub fn coarse_operator(&self) -> Option<&Arc<CoarseOp>> {
        self.coarse_op.as_ref()
    }

    /// The next coarser level.
    pub fn coarse(&self) -> Option<&Mg> {
        self.coarse.as_deref()
    }

    fn layout(&self) -> Result<FieldLayout, KError> {
        self.ctx.mat.layout().cloned().ok_or_else(|| {
            KError::Config(format!(
                "level {}: multigrid needs an operator with a lattice layout",
                self.level
            ))
        })
    }

    fn init_null_space(&mut self, inherited: Option<Vec<Vec<f64>>>) -> Result<(), KError> {
        let l = self.level;
        let n_vec = self.param.n_vec[l];
        let layout = self.layout()?;
        let len = layout.len();
        let mut rng = StdRng::seed_from_u64(self.param.seed + l as u64);

        if let Some(mut vectors) = inherited {
            for v in &vectors {
                check_len(len, v.len())?;
            }
            vectors.truncate(n_vec);
            let missing = n_vec - vectors.len();
            vectors.extend(random_vectors(&mut rng, missing, len));
            self.null_vectors = vectors;
            debug!(level = l, restricted = n_vec - missing, missing, "null space from the finer level");
            return if missing > 0 { self.generate_null_vectors() } else { Ok(()) };
        }

        match self.param.null_space[l] {
            NullSpace::Compute => {
                self.null_vectors = random_vectors(&mut rng, n_vec, len);
                self.generate_null_vectors()?;
            }
            NullSpace::Load => {
                let source = self.source.as_ref().ok_or_else(|| {
                    KError::Config(format!("level {l} loads its null space but no source was given"))
                })?;
                self.null_vectors = source.load(l, n_vec, len)?;
            }
            NullSpace::Free => {
                self.null_vectors = free_field_vectors(&layout, n_vec, self.param.spin_block_size[l])?;
            }
        }
        info!(level = l, n_vec, source = ?self.param.null_space[l], "null space ready");
        Ok(())
    }

    /// Relaxes the null vectors towards the kernel of the level operator, then improves them
    /// with cycles of the hierarchy built from them when `num_setup_iter > 1`.
    fn generate_null_vectors(&mut self) -> Result<(), KError> {
        let l = self.level;
        let _scope = self.ctx.profile.scope("mg_null_space");
        if self.param.pre_orthonormalize {
            self.orthonormalize_null_vectors()?;
        }
        self.relax_null_vectors(self.param.setup_maxiter[l])?;
        if self.param.post_orthonormalize {
            self.orthonormalize_null_vectors()?;
        }
        for iter in 1..self.param.num_setup_iter[l] {
            self.reset(false)?;
            self.refine_null_vectors()?;
            debug!(level = l, iter, "null space refined");
        }
        Ok(())
    }

    /// Context in which every operator role is the residual operator of the level.
    fn setup_context(&self) -> SolverContext {
        SolverContext {
            mat: self.ctx.mat.clone(),
            mat_sloppy: self.ctx.mat.clone(),
            mat_precon: self.ctx.mat.clone(),
            profile: self.ctx.profile.clone(),
            comm: self.ctx.comm.clone(),
        }
    }

    /// Solves `A v = 0` from every null vector with the setup solver, or relaxes the set with
    /// MR sweeps when the setup inverter is alphaSA.
    fn relax_null_vectors(&mut self, maxiter: usize) -> Result<(), KError> {
        let l = self.level;
        let inv_type = self.param.setup_inv_type[l];
        if inv_type == InverterType::AlphaSa {
            let mut p = SolverParam::new(InverterType::AlphaSa, 0.0, maxiter);
            p.omega = self.param.omega[l];
            p.verbosity = self.param.verbosity[l];
            return AlphaSa::new(p, self.setup_context()).generate(&mut self.null_vectors);
        }
        if !matches!(inv_type, InverterType::Mr | InverterType::Cg | InverterType::BiCgStab) {
            return Err(KError::Config(format!(
                "{} cannot generate null vectors",
                inv_type.name()
            )));
        }
        let mut p = SolverParam::new(inv_type, self.param.setup_tol[l], maxiter);
        p.use_init_guess = true;
        p.compute_true_res = false;
        p.verbosity = self.param.verbosity[l];
        let mut solver = self.setup_context().create(p)?;
        let zero = vec![0.0; self.ctx.mat.len()];
        for (i, v) in self.null_vectors.iter_mut().enumerate() {
            let stats = solver.solve(v, &zero)?;
            debug!(level = l, vector = i, iter = stats.iterations, "null vector relaxed");
            if !(blas::norm2(v) > 0.0) {
                return Err(KError::Setup(format!(
                    "level {l}: null vector {i} vanished during relaxation"
                )));
            }
        }
        Ok(())
    }

    /// One GCR solve of `A v = 0` per null vector, preconditioned by this level.
    fn refine_null_vectors(&mut self) -> Result<(), KError> {
        let l = self.level;
        let mut p = SolverParam::new(InverterType::Gcr, self.param.setup_tol[l], self.param.setup_maxiter[l]);
        p.use_init_guess = true;
        p.compute_true_res = false;
        p.verbosity = self.param.verbosity[l];
        let mut gcr = Gcr::new(p, self.setup_context(), None);
        let zero = vec![0.0; self.ctx.mat.len()];

        let mut vectors = std::mem::take(&mut self.null_vectors);
        let mut outcome = Ok(());
        for v in vectors.iter_mut() {
            if let Err(e) = gcr.solve_with(v, &zero, Some(&mut *self as &mut dyn Solver)) {
                outcome = Err(e);
                break;
            }
        }
        self.null_vectors = vectors;
        outcome?;
        if self.param.post_orthonormalize {
            self.orthonormalize_null_vectors()?;
        }
        Ok(())
    }

    fn orthonormalize_null_vectors(&mut self) -> Result<(), KError> {
        let norms = blas::mgs(&mut self.null_vectors);
        if let Some(i) = norms.iter().position(|&n| !(n > 0.0)) {
            return Err(KError::Setup(format!(
                "level {}: null vector {i} is linearly dependent",
                self.level
            )));
        }
        Ok(())
    }

    /// Rebuilds the level from its current operators; with `refresh` the null vectors are
    /// relaxed further first.
    pub fn reset(&mut self, refresh: bool) -> Result<(), KError> {
        self.state = MgState::Setup;
        let l = self.level;
        let scope = self.ctx.profile.scope("mg_setup");
        self.create_smoothers()?;

        if !self.is_coarsest() {
            if refresh {
                self.relax_null_vectors(self.param.setup_maxiter_refresh[l])?;
                if self.param.post_orthonormalize {
                    self.orthonormalize_null_vectors()?;
                }
            }
            let layout = self.layout()?;
            let transfer = Transfer::new(
                &layout,
                &self.null_vectors,
                self.param.geo_block_size[l],
                self.param.spin_block_size[l],
                self.param.precision_null[l],
            )?;
            let coarse_op = Arc::new(CoarseOp::galerkin(&self.ctx.mat, &transfer)?);
            let (coarse_ctx, coarse_pc) = self.coarse_context(&coarse_op)?;

            // the next level reuses our vectors unless it generates its own
            let coarse_len = transfer.coarse_layout().len();
            let inherited = if !self.param.generate_all_levels && l + 2 < self.param.n_level {
                let mut restricted = Vec::with_capacity(self.null_vectors.len());
                for v in &self.null_vectors {
                    let mut c = vec![0.0; coarse_len];
                    transfer.restrict(&mut c, v)?;
                    restricted.push(c);
                }
                Some(restricted)
            } else {
                None
            };

            match self.coarse.as_mut() {
                Some(coarse) => coarse.rebind(coarse_ctx.clone(), inherited, refresh)?,
                None => {
                    self.coarse = Some(Box::new(Mg::build(
                        self.param.clone(),
                        l + 1,
                        coarse_ctx.clone(),
                        self.source.clone(),
                        inherited,
                    )?));
                }
            }
            self.coarse_solver = Some(self.create_coarse_solver(&coarse_ctx, coarse_pc)?);

            let n = self.ctx.mat.len();
            self.r.resize(n, 0.0);
            self.correction.resize(n, 0.0);
            self.r_coarse.resize(coarse_len, 0.0);
            self.x_coarse.resize(coarse_len, 0.0);
            self.transfer = Some(transfer);
            self.coarse_op = Some(coarse_op);
        }
        let n_smooth = self.ctx.mat_sloppy.len();
        self.b_tilde.resize(n_smooth, 0.0);
        self.r_pc.resize(n_smooth, 0.0);
        self.state = MgState::Ready;
        let secs = scope.close();
        info!(level = l, refresh, secs, "multigrid level ready");

        if self.param.run_verify && !self.is_coarsest() {
            self.verify()?;
        }
        Ok(())
    }

    /// Points the level at new operators (after the finer level rebuilt them) and resets it.
    fn rebind(
        &mut self,
        ctx: SolverContext,
        inherited: Option<Vec<Vec<f64>>>,
        refresh: bool,
    ) -> Result<(), KError> {
        self.ctx = ctx;
        if inherited.is_some() {
            self.init_null_space(inherited)?;
        }
        self.reset(refresh)
    }

    fn smoother_param(&self, maxiter: usize, use_init_guess: bool) -> SolverParam {
        let l = self.level;
        let p = &self.param;
        let schwarz = p.smoother_schwarz_type[l] != SchwarzType::None;
        let mut s = SolverParam::new(p.smoother[l], p.smoother_tol[l], maxiter);
        s.residual_type = if p.smoother[l] == InverterType::Mr {
            ResidualType::empty()
        } else {
            ResidualType::L2_RELATIVE
        };
        s.use_init_guess = use_init_guess;
        s.omega = p.omega[l];
        s.schwarz_type = p.smoother_schwarz_type[l];
        s.global_reduction = !schwarz;
        s.compute_true_res = schwarz;
        s.sloppy_converge = true;
        s.is_preconditioner = true;
        s.precision = p.smoother_precision[l];
        s.precision_sloppy = p.smoother_precision[l];
        s.verbosity = p.verbosity[l];
        s
    }

    fn create_smoothers(&mut self) -> Result<(), KError> {
        let l = self.level;
        let ctx = SolverContext {
            mat: self.ctx.mat_sloppy.clone(),
            mat_sloppy: self.ctx.mat_precon.clone(),
            mat_precon: self.ctx.mat_precon.clone(),
            profile: self.ctx.profile.clone(),
            comm: self.ctx.comm.clone(),
        };
        let (nu_pre, nu_post) = if self.is_coarsest() {
            (self.param.nu_pre[l] + self.param.nu_post[l], 0)
        } else {
            (self.param.nu_pre[l], self.param.nu_post[l])
        };
        self.presmoother = match nu_pre {
            0 => None,
            n => Some(ctx.create(self.smoother_param(n, false))?),
        };
        self.postsmoother = match nu_post {
            0 => None,
            n => Some(ctx.create(self.smoother_param(n, true))?),
        };
        Ok(())
    }

    /// Operator triple of the next level, plus its even-odd reduction when that level smooths
    /// the reduced system.
    fn coarse_context(
        &self,
        coarse: &Arc<CoarseOp>,
    ) -> Result<(SolverContext, Option<OperatorRef>), KError> {
        let next = self.level + 1;
        let full: OperatorRef = coarse.clone();
        let pc: Option<OperatorRef> = match self.param.smoother_solve_type[next] {
            SolveType::DirectPc => Some(Arc::new(CoarsePcOp::new(coarse.clone())?)),
            SolveType::Direct => None,
        };
        let smoother = Rounded::wrap(
            pc.clone().unwrap_or_else(|| full.clone()),
            self.param.smoother_precision[next],
        );
        let ctx = SolverContext {
            mat: Rounded::wrap(full, self.param.precision),
            mat_sloppy: smoother.clone(),
            mat_precon: smoother,
            profile: self.ctx.profile.clone(),
            comm: self.ctx.comm.clone(),
        };
        Ok((ctx, pc))
    }

    fn create_coarse_solver(
        &self,
        coarse_ctx: &SolverContext,
        pc: Option<OperatorRef>,
    ) -> Result<CoarseSolver, KError> {
        let next = self.level + 1;
        let p = &self.param;
        let bottom = match p.cycle_type[self.level] {
            CycleType::VCycle => next + 1 == p.n_level,
            CycleType::Recursive => true,
            other => {
                return Err(KError::Config(format!(
                    "multigrid cycle type {other:?} not supported"
                )));
            }
        };
        if !bottom {
            return Ok(CoarseSolver::Nested);
        }
        if p.coarse_solver[next] != InverterType::Gcr {
            return Err(KError::Config(format!(
                "{} cannot be the bottom solver, only GCR",
                p.coarse_solver[next].name()
            )));
        }

        let mut s = SolverParam::new(InverterType::Gcr, p.coarse_solver_tol[next], p.coarse_solver_maxiter[next]);
        s.nkrylov = 20;
        s.delta = 1e-8;
        s.sloppy_converge = true;
        s.compute_true_res = false;
        s.is_preconditioner = true;
        s.precision = p.precision;
        s.precision_sloppy = p.smoother_precision[next];
        s.verbosity = p.verbosity[next];
        let precondition = next + 1 < p.n_level || p.nu_pre[next] + p.nu_post[next] > 0;

        let (ctx, pc_op) = if p.coarse_grid_solution_type[next] == SolutionType::MatPc {
            let pc = pc.ok_or_else(|| {
                KError::Config(format!(
                    "level {next}: a parity preconditioned coarse solution requires a preconditioned smoother"
                ))
            })?;
            let ctx = SolverContext {
                mat: pc.clone(),
                mat_sloppy: coarse_ctx.mat_sloppy.clone(),
                mat_precon: coarse_ctx.mat_precon.clone(),
                profile: coarse_ctx.profile.clone(),
                comm: coarse_ctx.comm.clone(),
            };
            (ctx, Some(pc))
        } else {
            let ctx = SolverContext {
                mat: coarse_ctx.mat.clone(),
                mat_sloppy: coarse_ctx.mat.clone(),
                mat_precon: coarse_ctx.mat_sloppy.clone(),
                profile: coarse_ctx.profile.clone(),
                comm: coarse_ctx.comm.clone(),
            };
            (ctx, None)
        };
        Ok(CoarseSolver::Bottom {
            solver: Gcr::new(s, ctx, None),
            precondition,
            pc_op,
        })
    }

    /// Checks the transfer and coarse operator of this level and, recursively, of the
    /// coarser ones.
    pub fn verify(&self) -> Result<(), KError> {
        if self.is_coarsest() {
            return Ok(());
        }
        let (transfer, coarse_op) = match (&self.transfer, &self.coarse_op) {
            (Some(t), Some(c)) => (t, c),
            _ => {
                return Err(KError::Setup(format!(
                    "level {} has no transfer to verify",
                    self.level
                )));
            }
        };
        let _scope = self.ctx.profile.scope("mg_verify");
        verify::verify_level(
            self.level,
            transfer,
            &self.null_vectors,
            &self.ctx.mat,
            coarse_op.as_ref(),
            self.param.precision,
            self.param.seed + self.level as u64,
        )
    }

    fn coarse_solve(&mut self) -> Result<(), KError> {
        match self.coarse_solver.as_mut() {
            Some(CoarseSolver::Nested) => {
                let coarse = self
                    .coarse
                    .as_deref_mut()
                    .ok_or_else(|| KError::Setup("nested cycle without a coarse level".into()))?;
                coarse.solve(&mut self.x_coarse, &self.r_coarse)?;
            }
            Some(CoarseSolver::Bottom {
                solver,
                precondition,
                pc_op,
            }) => {
                let k = if *precondition {
                    self.coarse.as_deref_mut().map(|m| m as &mut dyn Solver)
                } else {
                    None
                };
                match pc_op {
                    Some(pc) => {
                        let prepared = pc.prepare(&mut self.x_coarse, &self.r_coarse, SolutionType::Mat)?;
                        solver.solve_with(prepared.sol, prepared.src, k)?;
                        pc.reconstruct(&mut self.x_coarse, &self.r_coarse, SolutionType::Mat)?;
                    }
                    None => {
                        solver.solve_with(&mut self.x_coarse, &self.r_coarse, k)?;
                    }
                }
            }
            None => {
                return Err(KError::Setup(format!(
                    "level {} has no coarse solver",
                    self.level
                )));
            }
        }
        Ok(())
    }
}

impl Solver for Mg {
    /// One cycle `x ≈ M⁻¹ b` from a zero guess.
    ///
    /// `b` is either a full-lattice vector or, with `DirectPc` smoothing, an even-parity one.
    /// The returned residual is that of the pre-smoothed iterate on non-coarsest levels.
    fn solve(&mut self, x: &mut [f64], b: &[f64]) -> Result<SolveStats<f64>, KError> {
        let l = self.level;
        if self.state != MgState::Ready {
            return Err(KError::Setup(format!(
                "multigrid level {l} used in state {:?}",
                self.state
            )));
        }
        let full = self.ctx.mat.len();
        let outer = if b.len() == full {
            SolutionType::Mat
        } else if 2 * b.len() == full {
            SolutionType::MatPc
        } else {
            return Err(KError::DimensionMismatch {
                expected: full,
                got: b.len(),
            });
        };
        check_len(b.len(), x.len())?;
        let inner = match self.param.smoother_solve_type[l] {
            SolveType::DirectPc => SolutionType::MatPc,
            SolveType::Direct => SolutionType::Mat,
        };
        if outer == SolutionType::MatPc && inner == SolutionType::Mat {
            return Err(KError::Config(format!(
                "level {l}: a parity preconditioned solve needs a preconditioned smoother"
            )));
        }
        let timer = SolveTimer::start(&self.ctx, "mg_cycle");
        let smoother_op = self.ctx.mat_sloppy.clone();

        // pre-smooth from a zero guess
        blas::zero(x);
        {
            let prepared = smoother_op.prepare(x, b, outer)?;
            self.b_tilde.copy_from_slice(prepared.src);
            if let Some(pre) = self.presmoother.as_mut() {
                pre.solve(prepared.sol, prepared.src)?;
            }
        }
        smoother_op.reconstruct(x, b, outer)?;

        if self.is_coarsest() {
            self.solver_param.iter = 1;
            timer.finish(&self.ctx, &mut self.solver_param);
            return Ok(SolveStats::new(1, 0.0, true));
        }

        // full residual
        match outer {
            SolutionType::Mat => {
                self.ctx.mat.apply(&mut self.r, x);
                blas::xmy(b, &mut self.r);
            }
            SolutionType::MatPc => {
                smoother_op.apply(&mut self.r_pc, x);
                blas::xmy(b, &mut self.r_pc);
                smoother_op.expand_residual(&self.r_pc, &mut self.r)?;
            }
        }
        let r2 = self.ctx.norm2(self.solver_param.global_reduction, &self.r);

        {
            let transfer = self.transfer.as_ref().ok_or_else(|| KError::Setup("missing transfer".into()))?;
            transfer.restrict(&mut self.r_coarse, &self.r)?;
        }
        blas::zero(&mut self.x_coarse);
        self.coarse_solve()?;
        {
            let transfer = self.transfer.as_ref().ok_or_else(|| KError::Setup("missing transfer".into()))?;
            transfer.prolong(&mut self.correction, &self.x_coarse)?;
        }
        match (inner, outer) {
            (SolutionType::Mat, _) => blas::xpy(&self.correction, x),
            (SolutionType::MatPc, SolutionType::Mat) => {
                blas::xpy(blas::even(&self.correction), blas::even_mut(x))
            }
            (SolutionType::MatPc, SolutionType::MatPc) => blas::xpy(blas::even(&self.correction), x),
        }

        if let Some(post) = self.postsmoother.as_mut() {
            match inner {
                SolutionType::MatPc => {
                    let xe = if outer == SolutionType::Mat { blas::even_mut(x) } else { &mut *x };
                    post.solve(xe, &self.b_tilde)?;
                }
                SolutionType::Mat => {
                    post.solve(x, b)?;
                }
            }
        }
        if inner == SolutionType::MatPc && outer == SolutionType::Mat {
            smoother_op.reconstruct(x, b, SolutionType::Mat)?;
        }

        self.solver_param.iter = 1;
        timer.finish(&self.ctx, &mut self.solver_param);
        Ok(SolveStats::new(1, r2.sqrt(), true))
    }

    fn param(&self) -> &SolverParam {
        &self.solver_param
    }

    fn param_mut(&mut self) -> &mut SolverParam {
        &mut self.solver_param
    }

    fn name(&self) -> &'static str {
        "mg"
    }

    fn flops(&self) -> u64 {
        self.transfer.as_ref().map_or(0, |t| t.flops())
            + self.presmoother.as_ref().map_or(0, |s| s.flops())
            + self.postsmoother.as_ref().map_or(0, |s| s.flops())
            + self.coarse_op.as_ref().map_or(0, |op| op.flops())
            + self.coarse.as_ref().map_or(0, |c| c.flops())
    }
}
