//! BiCGStab solver (Saad §7.4.2) for non-Hermitian operators.
//!
//! Iterates on `mat_sloppy`; the true residual at the end is computed with `mat`.

use crate::config::{ResidualType, SolverParam};
use crate::context::SolverContext;
use crate::core::blas;
use crate::error::{KError, check_len};
use crate::solver::{BREAKDOWN_TOL, Solver, SolveTimer};
use crate::utils::convergence::{SolveStats, stopping};

pub struct BiCgStab {
    param: SolverParam,
    ctx: SolverContext,
    r: Vec<f64>,
    r_hat: Vec<f64>,
    p: Vec<f64>,
    v: Vec<f64>,
    t: Vec<f64>,
}

impl BiCgStab {
    pub fn new(param: SolverParam, ctx: SolverContext) -> Self {
        Self {
            param,
            ctx,
            r: Vec::new(),
            r_hat: Vec::new(),
            p: Vec::new(),
            v: Vec::new(),
            t: Vec::new(),
        }
    }
}

impl Solver for BiCgStab {
    fn solve(&mut self, x: &mut [f64], b: &[f64]) -> Result<SolveStats<f64>, KError> {
        let n = self.ctx.len();
        check_len(n, x.len())?;
        check_len(n, b.len())?;
        for v in [&mut self.r, &mut self.r_hat, &mut self.p, &mut self.v, &mut self.t] {
            v.resize(n, 0.0);
        }
        let timer = SolveTimer::start(&self.ctx, "bicgstab");
        let global = self.param.global_reduction;
        let site_len = self.ctx.mat.layout().map(|l| l.ncomp()).unwrap_or(1);
        let hq_check = self.param.residual_type.contains(ResidualType::HEAVY_QUARK);

        let mut b2 = self.ctx.norm2(global, b);

        // r0 = b - A x0
        if self.param.use_init_guess {
            self.ctx.mat.apply(&mut self.r, x);
            blas::xmy(b, &mut self.r);
        } else {
            blas::zero(x);
            blas::copy(&mut self.r, b);
        }
        let r2_init = self.ctx.norm2(global, &self.r);
        if r2_init == 0.0 {
            self.param.true_res = 0.0;
            self.param.true_res_hq = 0.0;
            self.param.iter = 0;
            timer.finish(&self.ctx, &mut self.param);
            return Ok(SolveStats::new(0, 0.0, true));
        }
        if b2 == 0.0 {
            b2 = r2_init;
        }
        let tiny = BREAKDOWN_TOL * b2;
        blas::copy(&mut self.r_hat, &self.r);
        blas::zero(&mut self.v);
        blas::zero(&mut self.p);

        let stop = stopping(self.param.tol, b2, self.param.residual_type);
        let mut r2 = r2_init;
        let mut hq = if hq_check {
            blas::heavy_quark_residual(x, &self.r, site_len)
        } else {
            0.0
        };
        let (mut rho_prev, mut alpha, mut omega) = (1.0, 1.0, 1.0);
        let mut k = 0;
        let mut done = self.convergence(r2, hq, stop, self.param.tol_hq);

        while !done && k < self.param.maxiter {
            let rho = self.ctx.dot(global, &self.r_hat, &self.r);
            if !(rho.abs() > tiny) {
                return Err(KError::breakdown("bicgstab", k, format!("rho = {rho:e}")));
            }
            if k == 0 {
                blas::copy(&mut self.p, &self.r);
            } else {
                // p = r + beta (p - omega v)
                let beta = (rho / rho_prev) * (alpha / omega);
                blas::axpy(-omega, &self.v, &mut self.p);
                blas::xpay(&self.r, beta, &mut self.p);
            }
            self.ctx.mat_sloppy.apply(&mut self.v, &self.p);
            let r0v = self.ctx.dot(global, &self.r_hat, &self.v);
            if !(r0v.abs() > tiny) {
                return Err(KError::breakdown("bicgstab", k, format!("<r0, v> = {r0v:e}")));
            }
            alpha = rho / r0v;
            // s = r - alpha v, kept in r
            blas::axpy(-alpha, &self.v, &mut self.r);
            k += 1;

            let s2 = self.ctx.norm2(global, &self.r);
            if !hq_check && self.convergence(s2, 0.0, stop, self.param.tol_hq) {
                blas::axpy(alpha, &self.p, x);
                r2 = s2;
                done = true;
                self.print_stats(k, r2, b2, hq);
                break;
            }

            self.ctx.mat_sloppy.apply(&mut self.t, &self.r);
            let tt = self.ctx.norm2(global, &self.t);
            if !(tt > 0.0) {
                return Err(KError::breakdown("bicgstab", k, "<t, t> vanished"));
            }
            omega = self.ctx.dot(global, &self.t, &self.r) / tt;
            if omega == 0.0 || !omega.is_finite() {
                return Err(KError::breakdown("bicgstab", k, format!("omega = {omega:e}")));
            }
            // x += alpha p + omega s; r = s - omega t
            blas::axpy(alpha, &self.p, x);
            blas::axpy(omega, &self.r, x);
            blas::axpy(-omega, &self.t, &mut self.r);
            rho_prev = rho;

            r2 = self.ctx.norm2(global, &self.r);
            if hq_check {
                hq = blas::heavy_quark_residual(x, &self.r, site_len);
            }
            done = self.convergence(r2, hq, stop, self.param.tol_hq);
            self.print_stats(k, r2, b2, hq);
        }

        if self.param.compute_true_res {
            self.ctx.mat.apply(&mut self.t, x);
            blas::xmy(b, &mut self.t);
            let true_r2 = self.ctx.norm2(global, &self.t);
            self.param.true_res = (true_r2 / b2).sqrt();
            self.param.true_res_hq = blas::heavy_quark_residual(x, &self.t, site_len);
        } else {
            self.param.true_res = (r2 / b2).sqrt();
            self.param.true_res_hq = hq;
        }
        self.param.iter = k;
        timer.finish(&self.ctx, &mut self.param);
        self.print_summary(k, r2, b2);
        Ok(SolveStats::new(k, r2.sqrt(), done))
    }

    fn param(&self) -> &SolverParam {
        &self.param
    }

    fn param_mut(&mut self) -> &mut SolverParam {
        &mut self.param
    }

    fn name(&self) -> &'static str {
        "bicgstab"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InverterType;
    use crate::core::DenseOp;
    use faer::Mat;
    use std::sync::Arc;

    #[test]
    fn bicgstab_solves_nonsymmetric() {
        // diagonally dominant, non-symmetric
        let a = Mat::from_fn(4, 4, |i, j| {
            if i == j {
                4.0
            } else if j == i + 1 {
                1.0
            } else if i == j + 1 {
                -0.5
            } else {
                0.0
            }
        });
        let ctx = SolverContext::single(Arc::new(DenseOp::new(a.clone())));
        let x_true = [1.0, -1.0, 2.0, 0.5];
        let b: Vec<f64> = (0..4).map(|i| (0..4).map(|j| a[(i, j)] * x_true[j]).sum()).collect();
        let mut x = vec![0.0; 4];
        let mut s = BiCgStab::new(SolverParam::new(InverterType::BiCgStab, 1e-12, 100), ctx);
        let stats = s.solve(&mut x, &b).unwrap();
        assert!(stats.converged);
        for (xi, ei) in x.iter().zip(x_true) {
            assert!((xi - ei).abs() < 1e-9, "xi = {xi}, expected = {ei}");
        }
        assert!(s.param().true_res < 1e-10);
    }

    #[test]
    fn rotation_breaks_down() {
        // the shadow residual stays orthogonal to A r for a 90 degree rotation
        let a = Mat::from_fn(2, 2, |i, j| match (i, j) {
            (0, 1) => -1.0,
            (1, 0) => 1.0,
            _ => 0.0,
        });
        let ctx = SolverContext::single(Arc::new(DenseOp::new(a)));
        let mut s = BiCgStab::new(SolverParam::new(InverterType::BiCgStab, 1e-12, 10), ctx);
        let mut x = vec![0.0; 2];
        assert!(matches!(
            s.solve(&mut x, &[1.0, 0.0]),
            Err(KError::Breakdown { solver: "bicgstab", .. })
        ));
    }
}
