//! Minimal residual iteration with over/under-relaxation.
//!
//! Each step moves along the residual by `omega · <Ar, r> / <Ar, Ar>`. With an empty
//! `residual_type` the solver is a smoother: it runs exactly `maxiter` steps and never asks for
//! the residual norm.

use crate::config::SolverParam;
use crate::context::SolverContext;
use crate::core::blas;
use crate::error::{KError, check_len};
use crate::solver::{Solver, SolveTimer};
use crate::utils::convergence::{SolveStats, stopping};

pub struct Mr {
    param: SolverParam,
    ctx: SolverContext,
    r: Vec<f64>,
    ar: Vec<f64>,
}

impl Mr {
    pub fn new(param: SolverParam, ctx: SolverContext) -> Self {
        Self {
            param,
            ctx,
            r: Vec::new(),
            ar: Vec::new(),
        }
    }
}

impl Solver for Mr {
    fn solve(&mut self, x: &mut [f64], b: &[f64]) -> Result<SolveStats<f64>, KError> {
        let n = self.ctx.len();
        check_len(n, x.len())?;
        check_len(n, b.len())?;
        self.r.resize(n, 0.0);
        self.ar.resize(n, 0.0);
        let timer = SolveTimer::start(&self.ctx, "mr");
        let global = self.param.global_reduction;
        let smoother = self.param.residual_type.is_empty();

        if self.param.use_init_guess {
            self.ctx.mat.apply(&mut self.r, x);
            blas::xmy(b, &mut self.r);
        } else {
            blas::zero(x);
            blas::copy(&mut self.r, b);
        }
        let mut r2 = if smoother { 0.0 } else { self.ctx.norm2(global, &self.r) };
        let b2 = if smoother {
            0.0
        } else {
            // a zero source converges relative to the initial residual
            let b2 = self.ctx.norm2(global, b);
            if b2 == 0.0 { r2 } else { b2 }
        };
        let stop = stopping(self.param.tol, b2, self.param.residual_type);

        let mut k = 0;
        let mut done = !smoother && self.convergence(r2, 0.0, stop, self.param.tol_hq);
        while !done && k < self.param.maxiter {
            self.ctx.mat.apply(&mut self.ar, &self.r);
            let ar2 = self.ctx.norm2(global, &self.ar);
            if ar2 == 0.0 {
                if self.ctx.norm2(global, &self.r) == 0.0 {
                    break;
                }
                return Err(KError::breakdown("mr", k, "A r vanished for a non-zero residual"));
            }
            let alpha = self.param.omega * self.ctx.dot(global, &self.ar, &self.r) / ar2;
            blas::axpy(alpha, &self.r, x);
            blas::axpy(-alpha, &self.ar, &mut self.r);
            k += 1;
            if !smoother {
                r2 = self.ctx.norm2(global, &self.r);
                done = self.convergence(r2, 0.0, stop, self.param.tol_hq);
                self.print_stats(k, r2, b2, 0.0);
            }
        }

        if self.param.compute_true_res {
            let b2 = if smoother { self.ctx.norm2(global, b) } else { b2 };
            self.ctx.mat.apply(&mut self.r, x);
            blas::xmy(b, &mut self.r);
            r2 = self.ctx.norm2(global, &self.r);
            self.param.true_res = if b2 > 0.0 { (r2 / b2).sqrt() } else { r2.sqrt() };
        } else if !smoother {
            self.param.true_res = if b2 > 0.0 { (r2 / b2).sqrt() } else { 0.0 };
        }
        self.param.iter = k;
        timer.finish(&self.ctx, &mut self.param);
        if !smoother {
            self.print_summary(k, r2, b2);
        }
        Ok(SolveStats::new(k, r2.sqrt(), smoother || done))
    }

    fn param(&self) -> &SolverParam {
        &self.param
    }

    fn param_mut(&mut self) -> &mut SolverParam {
        &mut self.param
    }

    fn name(&self) -> &'static str {
        "mr"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{InverterType, ResidualType};
    use crate::core::DenseOp;
    use faer::Mat;
    use std::sync::Arc;

    fn ctx() -> SolverContext {
        let a = Mat::from_fn(3, 3, |i, j| if i == j { 2.0 + i as f64 } else { 0.3 });
        SolverContext::single(Arc::new(DenseOp::new(a)))
    }

    #[test]
    fn smoother_mode_runs_exactly_maxiter() {
        let mut p = SolverParam::new(InverterType::Mr, 0.0, 5);
        p.residual_type = ResidualType::empty();
        p.compute_true_res = false;
        p.omega = 0.8;
        let mut mr = Mr::new(p, ctx());
        let mut x = vec![0.0; 3];
        let stats = mr.solve(&mut x, &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(stats.iterations, 5);
        assert!(x.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn mr_converges_on_positive_definite() {
        let mut mr = Mr::new(SolverParam::new(InverterType::Mr, 1e-10, 500), ctx());
        let mut x = vec![0.0; 3];
        let stats = mr.solve(&mut x, &[1.0, 2.0, 3.0]).unwrap();
        assert!(stats.converged);
        assert!(mr.param().true_res < 1e-9);
    }
}
