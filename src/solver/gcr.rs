//! Restarted, flexibly preconditioned Generalized Conjugate Residual.
//!
//! Each iteration turns the current residual into a search direction through the inner solver
//! `K` (or takes the residual itself), orthonormalises `A p` against the earlier directions of
//! the cycle with modified Gram-Schmidt and minimises the residual along it. After `nkrylov`
//! directions the cycle restarts from a recomputed true residual.

use crate::config::{ResidualType, SolverParam};
use crate::context::SolverContext;
use crate::core::blas;
use crate::error::{KError, check_len};
use crate::solver::{BREAKDOWN_TOL, Solver, SolveTimer};
use crate::utils::convergence::{ReliableUpdate, SolveStats, stopping};

pub struct Gcr {
    param: SolverParam,
    ctx: SolverContext,
    k: Option<Box<dyn Solver>>,
    residual_history: Vec<f64>,
    p: Vec<Vec<f64>>,
    ap: Vec<Vec<f64>>,
    r: Vec<f64>,
    tmp: Vec<f64>,
    corr: Vec<f64>,
}

impl Gcr {
    pub fn new(param: SolverParam, ctx: SolverContext, k: Option<Box<dyn Solver>>) -> Self {
        Self {
            param,
            ctx,
            k,
            residual_history: Vec::new(),
            p: Vec::new(),
            ap: Vec::new(),
            r: Vec::new(),
            tmp: Vec::new(),
            corr: Vec::new(),
        }
    }

    pub fn preconditioner(&self) -> Option<&dyn Solver> {
        self.k.as_deref()
    }

    pub fn residual_history(&self) -> &[f64] {
        &self.residual_history
    }

    fn nkrylov(&self) -> usize {
        self.param.nkrylov.max(1)
    }

    /// `K` applied `precondition_cycle` times to `r`, as defect corrections, into `p`.
    fn precondition(
        &mut self,
        j: usize,
        k: &mut Option<&mut dyn Solver>,
    ) -> Result<(), KError> {
        let Some(k) = k.as_deref_mut() else {
            blas::copy(&mut self.p[j], &self.r);
            return Ok(());
        };
        blas::zero(&mut self.p[j]);
        k.solve(&mut self.p[j], &self.r)?;
        for _ in 1..self.param.precondition_cycle.max(1) {
            self.ctx.mat_sloppy.apply(&mut self.tmp, &self.p[j]);
            blas::xmy(&self.r, &mut self.tmp);
            blas::zero(&mut self.corr);
            k.solve(&mut self.corr, &self.tmp)?;
            blas::xpy(&self.corr, &mut self.p[j]);
        }
        Ok(())
    }

    /// Solves `A x = b`, using `k` as the preconditioner for this call instead of the owned one.
    ///
    /// With `k == None` every direction is the residual itself.
    pub fn solve_with(
        &mut self,
        x: &mut [f64],
        b: &[f64],
        mut k: Option<&mut dyn Solver>,
    ) -> Result<SolveStats<f64>, KError> {
        let n = self.ctx.len();
        check_len(n, x.len())?;
        check_len(n, b.len())?;
        let nk = self.nkrylov();
        if self.p.len() != nk || self.p.first().is_some_and(|v| v.len() != n) {
            self.p = vec![vec![0.0; n]; nk];
            self.ap = vec![vec![0.0; n]; nk];
        }
        for v in [&mut self.r, &mut self.tmp, &mut self.corr] {
            v.resize(n, 0.0);
        }
        let timer = SolveTimer::start(&self.ctx, "gcr");
        let global = self.param.global_reduction;
        let site_len = self.ctx.mat.layout().map(|l| l.ncomp()).unwrap_or(1);
        let hq_check = self.param.residual_type.contains(ResidualType::HEAVY_QUARK);
        self.residual_history.clear();

        let mut b2 = self.ctx.norm2(global, b);
        if self.param.use_init_guess {
            self.ctx.mat.apply(&mut self.r, x);
            blas::xmy(b, &mut self.r);
        } else {
            blas::zero(x);
            blas::copy(&mut self.r, b);
        }
        let mut r2 = self.ctx.norm2(global, &self.r);
        if r2 == 0.0 {
            self.param.true_res = 0.0;
            self.param.true_res_hq = 0.0;
            self.param.iter = 0;
            self.residual_history.push(0.0);
            timer.finish(&self.ctx, &mut self.param);
            return Ok(SolveStats::new(0, 0.0, true));
        }
        if b2 == 0.0 {
            b2 = r2;
        }
        let stop = stopping(self.param.tol, b2, self.param.residual_type);
        let mut hq = if hq_check {
            blas::heavy_quark_residual(x, &self.r, site_len)
        } else {
            0.0
        };
        self.residual_history.push(r2.sqrt());
        let mut ru = ReliableUpdate::new(self.param.delta, r2.sqrt());

        let mut total = 0;
        let mut done = self.convergence(r2, hq, stop, self.param.tol_hq);
        while !done && total < self.param.maxiter {
            let mut j = 0;
            while j < nk && !done && total < self.param.maxiter {
                self.precondition(j, &mut k)?;
                self.ctx.mat_sloppy.apply(&mut self.ap[j], &self.p[j]);

                let (done_dirs, rest) = self.ap.split_at_mut(j);
                let (p_done, p_rest) = self.p.split_at_mut(j);
                for (api, pi) in done_dirs.iter().zip(p_done.iter()) {
                    let beta = self.ctx.dot(global, api, &rest[0]);
                    blas::axpy(-beta, api, &mut rest[0]);
                    blas::axpy(-beta, pi, &mut p_rest[0]);
                }
                let gamma2 = self.ctx.norm2(global, &rest[0]);
                if !(gamma2 > BREAKDOWN_TOL * r2) {
                    return Err(KError::breakdown(
                        "gcr",
                        total,
                        format!("|Ap| vanished after orthogonalisation ({gamma2:e})"),
                    ));
                }
                let inv = 1.0 / gamma2.sqrt();
                blas::scale(inv, &mut rest[0]);
                blas::scale(inv, &mut p_rest[0]);

                let alpha = self.ctx.dot(global, &rest[0], &self.r);
                blas::axpy(alpha, &p_rest[0], x);
                blas::axpy(-alpha, &rest[0], &mut self.r);
                r2 = self.ctx.norm2(global, &self.r);
                if hq_check {
                    hq = blas::heavy_quark_residual(x, &self.r, site_len);
                }
                j += 1;
                total += 1;
                self.residual_history.push(r2.sqrt());
                done = self.convergence(r2, hq, stop, self.param.tol_hq);
                self.print_stats(total, r2, b2, hq);
                if ru.due(r2.sqrt()) {
                    break;
                }
            }

            let sloppy_done = done;
            let restart = !done || !self.param.sloppy_converge;
            if restart {
                // true residual at every restart
                self.ctx.mat.apply(&mut self.r, x);
                blas::xmy(b, &mut self.r);
                r2 = self.ctx.norm2(global, &self.r);
                if hq_check {
                    hq = blas::heavy_quark_residual(x, &self.r, site_len);
                }
                ru.reset(r2.sqrt());
                done = self.convergence(r2, hq, stop, self.param.tol_hq);
                if sloppy_done && !done {
                    tracing::debug!(iter = total, "gcr: iterated residual converged but true residual did not");
                }
            }
        }

        if self.param.compute_true_res {
            self.ctx.mat.apply(&mut self.tmp, x);
            blas::xmy(b, &mut self.tmp);
            let true_r2 = self.ctx.norm2(global, &self.tmp);
            self.param.true_res = (true_r2 / b2).sqrt();
            self.param.true_res_hq = blas::heavy_quark_residual(x, &self.tmp, site_len);
        } else {
            self.param.true_res = (r2 / b2).sqrt();
            self.param.true_res_hq = hq;
        }
        self.param.iter = total;
        timer.finish(&self.ctx, &mut self.param);
        self.print_summary(total, r2, b2);
        Ok(SolveStats::new(total, r2.sqrt(), done))
    }
}

impl Solver for Gcr {
    fn solve(&mut self, x: &mut [f64], b: &[f64]) -> Result<SolveStats<f64>, KError> {
        let mut k = self.k.take();
        let res = self.solve_with(x, b, k.as_deref_mut().map(|k| k as &mut dyn Solver));
        self.k = k;
        res
    }

    fn param(&self) -> &SolverParam {
        &self.param
    }

    fn param_mut(&mut self) -> &mut SolverParam {
        &mut self.param
    }

    fn name(&self) -> &'static str {
        "gcr"
    }

    fn flops(&self) -> u64 {
        self.k.as_ref().map_or(0, |k| k.flops())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InverterType;
    use crate::core::DenseOp;
    use faer::Mat;
    use std::sync::Arc;

    fn tridiag(n: usize) -> SolverContext {
        let a = Mat::from_fn(n, n, |i, j| {
            if i == j {
                3.0
            } else if j == i + 1 {
                -1.0
            } else if i == j + 1 {
                -0.5
            } else {
                0.0
            }
        });
        SolverContext::single(Arc::new(DenseOp::new(a)))
    }

    #[test]
    fn gcr_converges_with_restarts() {
        let ctx = tridiag(20);
        let mut p = SolverParam::new(InverterType::Gcr, 1e-10, 200);
        p.nkrylov = 4;
        let mut gcr = Gcr::new(p, ctx, None);
        let b: Vec<f64> = (0..20).map(|i| 1.0 + i as f64 * 0.1).collect();
        let mut x = vec![0.0; 20];
        let stats = gcr.solve(&mut x, &b).unwrap();
        assert!(stats.converged);
        assert!(gcr.param().true_res < 1e-10);
        assert!(gcr
            .residual_history()
            .windows(2)
            .all(|w| w[1] <= w[0] * (1.0 + 1e-6)));
    }

    #[test]
    fn mr_preconditioned_gcr_converges() {
        let ctx = tridiag(20);
        let mut p = SolverParam::new(InverterType::Gcr, 1e-10, 200);
        p.inv_type_precondition = InverterType::Mr;
        p.maxiter_precondition = 3;
        p.nkrylov = 8;
        let mut gcr = ctx.create(p).unwrap();
        let b = vec![1.0; 20];
        let mut x = vec![0.0; 20];
        assert!(gcr.solve(&mut x, &b).unwrap().converged);
        assert!(gcr.param().true_res < 1e-10);
    }
}
