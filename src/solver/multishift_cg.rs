//! Multi-shift Conjugate Gradient (Jegerlehner, hep-lat/9612014).
//!
//! Solves `(A + σ_i) x_i = b` for every shift with the Krylov space of the smallest shift.
//! Residuals of the shifted systems stay collinear with the base residual, `r_i = ζ_i r`, so each
//! shift only needs its own ζ, α and β recurrences and its own search direction. A shift whose
//! scaled residual meets its tolerance is frozen and receives no further updates.

use crate::config::{MAX_SHIFTS, SolverParam};
use crate::context::SolverContext;
use crate::core::blas;
use crate::error::{KError, check_len};
use crate::solver::{BREAKDOWN_TOL, Solver, SolveTimer};
use crate::utils::convergence::SolveStats;
use tracing::{debug, info, warn};

pub struct MultiShiftCg {
    param: SolverParam,
    ctx: SolverContext,
    r: Vec<f64>,
    ap: Vec<f64>,
    p: Vec<Vec<f64>>,
}

fn check_offsets(param: &SolverParam) -> Result<(), KError> {
    if param.num_offset == 0 || param.num_offset > MAX_SHIFTS {
        return Err(KError::Config(format!(
            "multi-shift CG needs between 1 and {MAX_SHIFTS} offsets, got {}",
            param.num_offset
        )));
    }
    if param.offsets().windows(2).any(|w| w[1] < w[0]) {
        return Err(KError::Config(format!(
            "offsets must be non-decreasing, got {:?}",
            param.offsets()
        )));
    }
    Ok(())
}

/// Per-shift CG coefficients.
#[derive(Clone, Copy, Debug)]
struct Shift {
    sigma: f64,
    zeta: f64,
    zeta_old: f64,
    active: bool,
}

impl MultiShiftCg {
    /// Fails unless `1 ≤ num_offset ≤ MAX_SHIFTS` and the offsets are non-decreasing.
    pub fn new(param: SolverParam, ctx: SolverContext) -> Result<Self, KError> {
        check_offsets(&param)?;
        Ok(Self {
            param,
            ctx,
            r: Vec::new(),
            ap: Vec::new(),
            p: Vec::new(),
        })
    }

    pub fn param(&self) -> &SolverParam {
        &self.param
    }

    pub fn param_mut(&mut self) -> &mut SolverParam {
        &mut self.param
    }

    /// Solves all shifted systems; `x[i]` receives the solution for `offset[i]`.
    ///
    /// Converged iff every shift met its tolerance before `maxiter`.
    pub fn solve(&mut self, x: &mut [Vec<f64>], b: &[f64]) -> Result<SolveStats<f64>, KError> {
        check_offsets(&self.param)?;
        let n = self.ctx.len();
        let nshift = self.param.num_offset;
        check_len(nshift, x.len())?;
        check_len(n, b.len())?;
        for xi in x.iter() {
            check_len(n, xi.len())?;
        }
        self.r.resize(n, 0.0);
        self.ap.resize(n, 0.0);
        if self.p.len() != nshift || self.p.first().is_some_and(|v| v.len() != n) {
            self.p = vec![vec![0.0; n]; nshift];
        }
        let timer = SolveTimer::start(&self.ctx, "multishift_cg");
        let global = self.param.global_reduction;

        for xi in x.iter_mut() {
            blas::zero(xi);
        }
        let b2 = self.ctx.norm2(global, b);
        if b2 == 0.0 {
            for i in 0..nshift {
                self.param.true_res_offset[i] = 0.0;
                self.param.true_res_hq_offset[i] = 0.0;
            }
            self.param.true_res = 0.0;
            self.param.iter = 0;
            timer.finish(&self.ctx, &mut self.param);
            return Ok(SolveStats::new(0, 0.0, true));
        }

        let sigma0 = self.param.offset[0];
        let mut shifts: Vec<Shift> = (0..nshift)
            .map(|i| Shift {
                sigma: self.param.offset[i] - sigma0,
                zeta: 1.0,
                zeta_old: 1.0,
                active: true,
            })
            .collect();
        blas::copy(&mut self.r, b);
        for p in self.p.iter_mut() {
            blas::copy(p, b);
        }
        let mut r2 = b2;
        let (mut alpha_old, mut beta_old) = (1.0, 0.0);
        let mut k = 0;

        while shifts.iter().any(|s| s.active) && k < self.param.maxiter {
            // Ap = (A + σ_0) p_0
            self.ctx.mat_sloppy.apply(&mut self.ap, &self.p[0]);
            blas::axpy(sigma0, &self.p[0], &mut self.ap);
            let pap = self.ctx.dot(global, &self.p[0], &self.ap);
            if !(pap > 0.0) {
                return Err(KError::breakdown("multishift_cg", k, format!("p·Ap = {pap:e}")));
            }
            let alpha = r2 / pap;

            let mut zeta_new = vec![1.0; nshift];
            let mut alpha_s = vec![alpha; nshift];
            for (j, s) in shifts.iter().enumerate().skip(1) {
                if !s.active {
                    continue;
                }
                let den = alpha * beta_old * (s.zeta_old - s.zeta)
                    + s.zeta_old * alpha_old * (1.0 + s.sigma * alpha);
                if !den.is_finite() || den.abs() < BREAKDOWN_TOL {
                    return Err(KError::breakdown(
                        "multishift_cg",
                        k,
                        format!("shift {j}: zeta denominator {den:e}"),
                    ));
                }
                zeta_new[j] = s.zeta * s.zeta_old * alpha_old / den;
                alpha_s[j] = alpha * zeta_new[j] / s.zeta;
            }
            for (j, s) in shifts.iter().enumerate() {
                if s.active {
                    blas::axpy(alpha_s[j], &self.p[j], &mut x[j]);
                }
            }

            blas::axpy(-alpha, &self.ap, &mut self.r);
            let r2_new = self.ctx.norm2(global, &self.r);
            let beta = r2_new / r2;
            k += 1;

            blas::xpay(&self.r, beta, &mut self.p[0]);
            for (j, s) in shifts.iter_mut().enumerate().skip(1) {
                if !s.active {
                    continue;
                }
                let ratio = zeta_new[j] / s.zeta;
                let beta_s = beta * ratio * ratio;
                // p_j = ζ_j r + β_j p_j
                blas::axpby(zeta_new[j], &self.r, beta_s, &mut self.p[j]);
                s.zeta_old = s.zeta;
                s.zeta = zeta_new[j];
            }
            alpha_old = alpha;
            beta_old = beta;
            r2 = r2_new;

            for (j, s) in shifts.iter_mut().enumerate() {
                let tol = self.param.tol_offset[j];
                if s.active && s.zeta * s.zeta * r2 <= tol * tol * b2 {
                    s.active = false;
                    debug!(shift = j, iter = k, "multishift_cg: shift converged");
                }
            }
            if self.param.verbosity >= crate::config::Verbosity::Verbose {
                debug!(iter = k, r2, rel = (r2 / b2).sqrt(), "multishift_cg iteration");
            }
            if r2 == 0.0 {
                shifts.iter_mut().for_each(|s| s.active = false);
            }
        }

        let converged = shifts.iter().all(|s| !s.active);
        let site_len = self.ctx.mat.layout().map(|l| l.ncomp()).unwrap_or(1);
        for (j, xj) in x.iter().enumerate() {
            // true residual of (A + σ_j) x_j = b
            self.ctx.mat.apply(&mut self.ap, xj);
            blas::axpy(self.param.offset[j], xj, &mut self.ap);
            blas::xmy(b, &mut self.ap);
            let rj2 = self.ctx.norm2(global, &self.ap);
            self.param.true_res_offset[j] = (rj2 / b2).sqrt();
            self.param.true_res_hq_offset[j] = blas::heavy_quark_residual(xj, &self.ap, site_len);
        }
        self.param.true_res = self.param.true_res_offset[0];
        self.param.true_res_hq = self.param.true_res_hq_offset[0];
        self.param.iter = k;
        timer.finish(&self.ctx, &mut self.param);

        if self.param.verbosity >= crate::config::Verbosity::Summarize {
            for j in 0..nshift {
                if converged {
                    info!(
                        shift = j,
                        offset = self.param.offset[j],
                        iter = k,
                        true_res = self.param.true_res_offset[j],
                        "multishift_cg converged"
                    );
                } else {
                    warn!(
                        shift = j,
                        offset = self.param.offset[j],
                        iter = k,
                        true_res = self.param.true_res_offset[j],
                        "multishift_cg did not converge"
                    );
                }
            }
        }
        Ok(SolveStats::new(k, r2.sqrt(), converged))
    }

    pub fn flops(&self) -> u64 {
        self.ctx.operator_flops()
    }

    pub fn name(&self) -> &'static str {
        "multishift_cg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InverterType;
    use crate::core::DenseOp;
    use faer::Mat;
    use std::sync::Arc;

    fn param(offsets: &[f64], tol: f64) -> SolverParam {
        let mut p = SolverParam::new(InverterType::MultiShiftCg, tol, 500);
        p.num_offset = offsets.len();
        p.offset[..offsets.len()].copy_from_slice(offsets);
        p.tol_offset[..offsets.len()].fill(tol);
        p
    }

    #[test]
    fn decreasing_offsets_are_rejected() {
        let a = Mat::from_fn(2, 2, |i, j| if i == j { 1.0 } else { 0.0 });
        let ctx = SolverContext::single(Arc::new(DenseOp::new(a)));
        assert!(MultiShiftCg::new(param(&[1.0, 0.5], 1e-8), ctx.clone()).is_err());
        assert!(MultiShiftCg::new(param(&[], 1e-8), ctx).is_err());
    }

    #[test]
    fn too_many_offsets_are_rejected() {
        let a = Mat::from_fn(2, 2, |i, j| if i == j { 1.0 } else { 0.0 });
        let ctx = SolverContext::single(Arc::new(DenseOp::new(a)));
        let mut p = SolverParam::new(InverterType::MultiShiftCg, 1e-8, 100);
        p.num_offset = MAX_SHIFTS + 1;
        assert!(matches!(ctx.create_multishift(p), Err(KError::Config(_))));

        let offsets: Vec<f64> = (0..MAX_SHIFTS).map(|i| i as f64).collect();
        let mut ms = ctx.create_multishift(param(&offsets, 1e-8)).unwrap();
        ms.param_mut().num_offset = MAX_SHIFTS + 1;
        let mut x = vec![vec![0.0; 2]; MAX_SHIFTS + 1];
        assert!(matches!(ms.solve(&mut x, &[1.0, 0.0]), Err(KError::Config(_))));
    }

    #[test]
    fn degenerate_shift_is_a_breakdown() {
        let a = Mat::from_fn(2, 2, |i, j| if i == j { 1.0 } else { 0.0 });
        let ctx = SolverContext::single(Arc::new(DenseOp::new(a)));
        let mut ms = MultiShiftCg::new(param(&[0.0, f64::INFINITY], 1e-8), ctx).unwrap();
        let mut x = vec![vec![0.0; 2]; 2];
        let err = ms.solve(&mut x, &[1.0, 0.5]).unwrap_err();
        assert!(matches!(err, KError::Breakdown { solver: "multishift_cg", iteration: 0, .. }));
    }

    #[test]
    fn single_shift_matches_shifted_solution() {
        let a = Mat::from_fn(3, 3, |i, j| if i == j { 2.0 } else { 0.5 });
        let ctx = SolverContext::single(Arc::new(DenseOp::new(a)));
        let mut ms = MultiShiftCg::new(param(&[1.0], 1e-12), ctx).unwrap();
        let b = [1.0, 0.0, 0.0];
        let mut x = vec![vec![0.0; 3]];
        let stats = ms.solve(&mut x, &b).unwrap();
        assert!(stats.converged);
        assert!(ms.param().true_res_offset[0] < 1e-10);
    }
}
