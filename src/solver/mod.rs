//! Krylov and deflated solver interfaces.
//!
//! Every algorithm implements [`Solver`]: it owns its [`SolverParam`], shares the timing
//! profile and operators of a [`SolverContext`], and updates the achieved residual, iteration
//! count, time and flop rate of its parameters on every `solve`.
//!
//! Outcomes are split in two. Failing to reach the tolerance within `maxiter` is a soft
//! outcome: `solve` returns `Ok` with `converged == false` and the caller inspects
//! `param().true_res`. Configuration errors and numerical breakdowns abort with `Err`.

use crate::config::{ResidualType, SolverParam, Verbosity};
use crate::context::SolverContext;
use crate::core::traits::OperatorRef;
use crate::error::KError;
use crate::utils::convergence::{SolveStats, converged};
use crate::utils::profile::ProfileScope;
use tracing::{debug, info, warn};

pub mod alpha_sa;
pub mod bicgstab;
pub mod cg;
pub mod gcr;
pub mod inc_eigcg;
pub mod minres_ext;
pub mod mr;
pub mod multishift_cg;
pub mod projection;

pub use alpha_sa::AlphaSa;
pub use bicgstab::BiCgStab;
pub use cg::Cg;
pub use gcr::Gcr;
pub use inc_eigcg::IncEigCg;
pub use minres_ext::MinResExt;
pub use mr::Mr;
pub use multishift_cg::MultiShiftCg;
pub use projection::ProjectionMatrix;

/// Relative size below which a recurrence denominator counts as vanished.
pub(crate) const BREAKDOWN_TOL: f64 = 1e-30;

/// Common interface of every linear solver.
pub trait Solver {
    /// Solve `A · out = inp`.
    fn solve(&mut self, out: &mut [f64], inp: &[f64]) -> Result<SolveStats<f64>, KError>;

    fn param(&self) -> &SolverParam;

    fn param_mut(&mut self) -> &mut SolverParam;

    fn name(&self) -> &'static str;

    /// Operator flops spent by this solver and any solver nested in it.
    fn flops(&self) -> u64 {
        0
    }

    /// True iff each residual norm requested in `residual_type` meets its threshold.
    fn convergence(&self, r2: f64, hq2: f64, r2_tol: f64, hq_tol: f64) -> bool {
        converged(self.param().residual_type, r2, hq2, r2_tol, hq_tol)
    }

    /// Per-iteration statistics, emitted at verbose verbosity.
    fn print_stats(&self, k: usize, r2: f64, b2: f64, hq2: f64) {
        let p = self.param();
        if p.verbosity < Verbosity::Verbose {
            return;
        }
        let rel = if b2 > 0.0 { (r2 / b2).sqrt() } else { 0.0 };
        if p.residual_type.contains(ResidualType::HEAVY_QUARK) {
            debug!(solver = self.name(), iter = k, r2, rel, hq = hq2, "iteration");
        } else {
            debug!(solver = self.name(), iter = k, r2, rel, "iteration");
        }
    }

    /// Convergence summary; assumes `true_res` and `true_res_hq` have been set.
    fn print_summary(&self, k: usize, r2: f64, b2: f64) {
        let p = self.param();
        if p.verbosity < Verbosity::Summarize {
            return;
        }
        let iterated = if b2 > 0.0 { (r2 / b2).sqrt() } else { 0.0 };
        let met = self.convergence(
            p.true_res * p.true_res,
            p.true_res_hq,
            p.tol * p.tol,
            p.tol_hq,
        );
        if met {
            info!(
                solver = self.name(),
                iter = k,
                iterated,
                true_res = p.true_res,
                true_res_hq = p.true_res_hq,
                secs = p.secs,
                gflops = p.gflops,
                "converged"
            );
        } else {
            warn!(
                solver = self.name(),
                iter = k,
                maxiter = p.maxiter,
                iterated,
                true_res = p.true_res,
                tol = p.tol,
                "did not converge"
            );
        }
    }
}

impl<S: Solver + ?Sized> Solver for Box<S> {
    fn solve(&mut self, out: &mut [f64], inp: &[f64]) -> Result<SolveStats<f64>, KError> {
        (**self).solve(out, inp)
    }
    fn param(&self) -> &SolverParam {
        (**self).param()
    }
    fn param_mut(&mut self) -> &mut SolverParam {
        (**self).param_mut()
    }
    fn name(&self) -> &'static str {
        (**self).name()
    }
    fn flops(&self) -> u64 {
        (**self).flops()
    }
}

/// Flops of a set of operators, counting shared operators once.
pub(crate) fn operator_flops(ops: &[&OperatorRef]) -> u64 {
    let mut seen: Vec<*const ()> = Vec::with_capacity(ops.len());
    let mut total = 0;
    for op in ops {
        let ptr = std::sync::Arc::as_ptr(op) as *const ();
        if !seen.contains(&ptr) {
            seen.push(ptr);
            total += op.flops();
        }
    }
    total
}

/// Times one solve and converts operator flops into a rate.
pub(crate) struct SolveTimer {
    scope: ProfileScope,
    flops0: u64,
}

impl SolveTimer {
    pub fn start(ctx: &SolverContext, region: &'static str) -> Self {
        Self {
            scope: ctx.profile.scope(region),
            flops0: ctx.operator_flops(),
        }
    }

    /// Closes the region and writes `secs` and `gflops`, returning the flops spent.
    pub fn finish(self, ctx: &SolverContext, param: &mut SolverParam) -> u64 {
        let flops = ctx.operator_flops().saturating_sub(self.flops0);
        let secs = self.scope.close();
        param.secs = secs;
        param.gflops = if secs > 0.0 { flops as f64 * 1e-9 / secs } else { 0.0 };
        flops
    }
}
