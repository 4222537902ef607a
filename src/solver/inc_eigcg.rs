//! Incremental eigCG (Stathopoulos & Orginos, arXiv:0707.0131).
//!
//! Solves a sequence of right-hand sides against one Hermitian positive definite operator.
//! For the first `deflation_grid` systems, CG runs while harvesting Ritz vectors of the lowest
//! eigenmodes from its Lanczos tridiagonal matrix, inside a search space of width `m` that is
//! restarted to `2 nev` vectors when full. Harvested vectors are orthonormalised against the
//! deflation space, which then grows together with its projection matrix `Uᵀ A U`. Every solve
//! starts from the Galerkin initial guess `U (Uᵀ A U)⁻¹ Uᵀ b`, removing the slow modes.

use crate::config::{ResidualType, SolverParam};
use crate::context::SolverContext;
use crate::core::blas;
use crate::error::{KError, check_len};
use crate::solver::{ProjectionMatrix, Solver, SolveTimer};
use crate::utils::convergence::{SolveStats, stopping};
use faer::Mat;
use faer::linalg::solvers::{FullPivLu, PartialPivLu, SolveCore};
use tracing::{debug, warn};

/// Largest projection dimension solved with full pivoting.
const FULL_PIVOT_MAX_DIM: usize = 128;

pub struct IncEigCg {
    param: SolverParam,
    ctx: SolverContext,
    proj: ProjectionMatrix,
    u: Vec<Vec<f64>>,
    search: Vec<Vec<f64>>,
    r: Vec<f64>,
    p: Vec<f64>,
    ap: Vec<f64>,
    w: Vec<f64>,
}

impl IncEigCg {
    /// Fails when the deflation space is empty or the search space cannot hold `2 nev + 1`
    /// vectors.
    pub fn new(param: SolverParam, ctx: SolverContext) -> Result<Self, KError> {
        let proj = ProjectionMatrix::new(param.nev, param.deflation_grid)?;
        if param.m <= 2 * param.nev {
            return Err(KError::Config(format!(
                "eigCG search space {} must exceed twice nev {}",
                param.m, param.nev
            )));
        }
        Ok(Self {
            param,
            ctx,
            proj,
            u: Vec::new(),
            search: Vec::new(),
            r: Vec::new(),
            p: Vec::new(),
            ap: Vec::new(),
            w: Vec::new(),
        })
    }

    pub fn projection(&self) -> &ProjectionMatrix {
        &self.proj
    }

    /// Orthonormal deflation vectors accumulated so far.
    pub fn deflation_space(&self) -> &[Vec<f64>] {
        &self.u
    }

    /// Overwrites the projection storage only; the active dimension and the deflation vectors
    /// are left as they are. See [`IncEigCg::restore_deflation_space`].
    pub fn load_projection_matrix(&mut self, bytes: &[u8]) -> Result<(), KError> {
        self.proj.load(bytes)
    }

    /// Restores a saved deflation space: the projection storage from `bytes` and the vectors
    /// `u` it was built from, which set the active dimension.
    pub fn restore_deflation_space(&mut self, bytes: &[u8], u: Vec<Vec<f64>>) -> Result<(), KError> {
        if u.len() > self.proj.tot_dim() {
            return Err(KError::Config(format!(
                "{} deflation vectors exceed capacity {}",
                u.len(),
                self.proj.tot_dim()
            )));
        }
        for v in &u {
            check_len(self.ctx.len(), v.len())?;
        }
        self.proj.load(bytes)?;
        self.proj.reset_curr_dim(u.len())?;
        self.u = u;
        Ok(())
    }

    pub fn save_projection_matrix(&self, count: usize) -> Result<Vec<u8>, KError> {
        self.proj.save(count)
    }

    /// `out = U H⁻¹ Uᵀ inp` with `H = Uᵀ A U`; zero while the deflation space is empty.
    pub fn deflate_spinor(&self, out: &mut [f64], inp: &[f64]) -> Result<(), KError> {
        check_len(self.ctx.len(), out.len())?;
        check_len(self.ctx.len(), inp.len())?;
        blas::zero(out);
        let k = self.proj.curr_dim();
        if k == 0 {
            return Ok(());
        }
        let global = self.param.global_reduction;
        let mut c: Vec<f64> = self.u[..k].iter().map(|u| blas::dot(u, inp)).collect();
        self.ctx.reduce_slice(global, &mut c);
        let h = self.proj.active();
        let rhs = faer::MatMut::from_column_major_slice_mut(&mut c, k, 1);
        if k <= FULL_PIVOT_MAX_DIM {
            FullPivLu::new(h.as_ref()).solve_in_place_with_conj(faer::Conj::No, rhs);
        } else {
            PartialPivLu::new(h.as_ref()).solve_in_place_with_conj(faer::Conj::No, rhs);
        }
        if c.iter().any(|v| !v.is_finite()) {
            return Err(KError::SolveError("projection matrix is singular".into()));
        }
        for (ci, u) in c.iter().zip(&self.u) {
            blas::axpy(*ci, u, out);
        }
        Ok(())
    }

    /// Orthonormalises `new` against the deflation space and against each other, dropping
    /// numerically dependent vectors.
    pub fn mgs(&self, new: Vec<Vec<f64>>) -> Vec<Vec<f64>> {
        let global = self.param.global_reduction;
        let mut admitted: Vec<Vec<f64>> = Vec::with_capacity(new.len());
        for mut v in new {
            let before = self.ctx.norm2(global, &v).sqrt();
            for u in self.u.iter().chain(admitted.iter()) {
                let c = self.ctx.dot(global, u, &v);
                blas::axpy(-c, u, &mut v);
            }
            let nrm = self.ctx.norm2(global, &v).sqrt();
            if nrm > 1e-8 * before {
                blas::scale(1.0 / nrm, &mut v);
                admitted.push(v);
            } else {
                debug!("inc_eigcg: dropping dependent Ritz vector");
            }
        }
        admitted
    }

    /// Appends orthonormal vectors to the deflation space and extends the projection matrix.
    ///
    /// Only `A u` of the new vectors is computed; the old block is never touched.
    pub fn construct_projection_mat(&mut self, mut new: Vec<Vec<f64>>) -> Result<(), KError> {
        let room = self.proj.tot_dim() - self.proj.curr_dim();
        if new.len() > room {
            warn!(harvested = new.len(), room, "inc_eigcg: deflation space full, truncating");
            new.truncate(room);
        }
        if new.is_empty() {
            return Ok(());
        }
        let old = self.proj.curr_dim();
        self.proj.extend(new.len())?;
        self.u.truncate(old);
        self.u.extend(new);
        let curr = self.proj.curr_dim();
        self.w.resize(self.ctx.len(), 0.0);
        let global = self.param.global_reduction;
        let mut col = vec![0.0; curr];
        for c in old..curr {
            self.ctx.mat.apply(&mut self.w, &self.u[c]);
            for (h, u) in col.iter_mut().zip(&self.u) {
                *h = blas::dot(u, &self.w);
            }
            self.ctx.reduce_slice(global, &mut col);
            for (j, &h) in col.iter().enumerate() {
                self.proj.set(j, c, h);
                if j < old {
                    self.proj.set(c, j, h);
                }
            }
        }
        debug!(prev = old, curr, "inc_eigcg: projection matrix extended");
        Ok(())
    }

    /// CG from the current `x`, harvesting the lowest `nev` Ritz vectors when `harvest` is set.
    fn eigcg(
        &mut self,
        x: &mut [f64],
        b: &[f64],
        b2: f64,
        harvest: bool,
    ) -> Result<(SolveStats<f64>, Vec<Vec<f64>>), KError> {
        let n = self.ctx.len();
        let (m, nev) = (self.param.m, self.param.nev);
        let global = self.param.global_reduction;
        if harvest && (self.search.len() != m || self.search.first().is_some_and(|v| v.len() != n)) {
            self.search = vec![vec![0.0; n]; m];
        }
        let mut t = Mat::<f64>::zeros(m, m);
        let mut vind = 0;
        let mut restarted = false;

        self.ctx.mat.apply(&mut self.r, x);
        blas::xmy(b, &mut self.r);
        let mut r2 = self.ctx.norm2(global, &self.r);
        blas::copy(&mut self.p, &self.r);
        let stop = stopping(self.param.tol, b2, self.param.residual_type);
        let (mut alpha_old, mut beta_old) = (1.0, 0.0);
        let mut k = 0;
        let mut done = self.convergence(r2, 0.0, stop, self.param.tol_hq);

        while !done && k < self.param.maxiter {
            self.ctx.mat_sloppy.apply(&mut self.ap, &self.p);
            let pap = self.ctx.dot(global, &self.p, &self.ap);
            if pap.is_nan() {
                return Err(KError::breakdown("inc_eigcg", k, "p·Ap is not a number"));
            }
            if pap <= 0.0 {
                return Err(KError::IndefiniteMatrix);
            }
            let alpha = r2 / pap;

            if harvest {
                if vind == m {
                    vind = restart(&mut self.search, &mut t, nev)?;
                    restarted = true;
                }
                let v = &mut self.search[vind];
                blas::copy(v, &self.r);
                blas::scale(1.0 / r2.sqrt(), v);
                t[(vind, vind)] = 1.0 / alpha + beta_old / alpha_old;
                if restarted {
                    // couple the new Lanczos vector to the kept Ritz vectors explicitly
                    self.ctx.mat_sloppy.apply(&mut self.w, &self.search[vind]);
                    for i in 0..vind {
                        let c = self.ctx.dot(global, &self.search[i], &self.w);
                        t[(i, vind)] = c;
                        t[(vind, i)] = c;
                    }
                    restarted = false;
                } else if vind > 0 {
                    let c = -beta_old.sqrt() / alpha_old;
                    t[(vind, vind - 1)] = c;
                    t[(vind - 1, vind)] = c;
                }
                vind += 1;
            }

            blas::axpy(alpha, &self.p, x);
            blas::axpy(-alpha, &self.ap, &mut self.r);
            let r2_new = self.ctx.norm2(global, &self.r);
            let beta = r2_new / r2;
            r2 = r2_new;
            blas::xpay(&self.r, beta, &mut self.p);
            alpha_old = alpha;
            beta_old = beta;
            k += 1;
            done = r2 == 0.0 || self.convergence(r2, 0.0, stop, self.param.tol_hq);
            self.print_stats(k, r2, b2, 0.0);
        }

        let mut ritz = Vec::new();
        if harvest && vind >= nev {
            let (vals, y) = lowest_eigenpairs(&t, vind, nev)?;
            debug!(?vals, "inc_eigcg: harvested Ritz values");
            for c in 0..nev {
                let mut v = vec![0.0; n];
                for i in 0..vind {
                    blas::axpy(y[(i, c)], &self.search[i], &mut v);
                }
                ritz.push(v);
            }
        }
        Ok((SolveStats::new(k, r2.sqrt(), done), ritz))
    }
}

/// Lowest `count` eigenpairs of the leading `dim × dim` block of a symmetric matrix.
fn lowest_eigenpairs(t: &Mat<f64>, dim: usize, count: usize) -> Result<(Vec<f64>, Mat<f64>), KError> {
    let sub = Mat::from_fn(dim, dim, |i, j| t[(i, j)]);
    let eig = sub
        .self_adjoint_eigen(faer::Side::Lower)
        .map_err(|e| KError::FactorError(format!("eigensolver failed: {e:?}")))?;
    let count = count.min(dim);
    let vals = (0..count).map(|i| eig.S().column_vector()[i]).collect();
    let vecs = Mat::from_fn(dim, count, |i, j| eig.U()[(i, j)]);
    Ok((vals, vecs))
}

/// Thick restart of a full search space: keeps the Rayleigh-Ritz vectors of the span of the
/// lowest `nev` eigenvectors of `T_m` and `T_{m-1}`, returning how many were kept.
fn restart(space: &mut [Vec<f64>], t: &mut Mat<f64>, nev: usize) -> Result<usize, KError> {
    let m = space.len();
    let (_, y) = lowest_eigenpairs(t, m, nev)?;
    let (_, y_prev) = lowest_eigenpairs(t, m - 1, nev)?;
    let mut cols: Vec<Vec<f64>> = (0..y.ncols())
        .map(|c| (0..m).map(|i| y[(i, c)]).collect())
        .chain((0..y_prev.ncols()).map(|c| {
            (0..m).map(|i| if i < m - 1 { y_prev[(i, c)] } else { 0.0 }).collect()
        }))
        .collect();
    let norms = blas::mgs(&mut cols);
    let q: Vec<Vec<f64>> = cols
        .into_iter()
        .zip(norms)
        .filter(|(_, nrm)| *nrm > 1e-10)
        .map(|(c, _)| c)
        .collect();
    let kept = q.len();

    // H = Qᵀ T Q
    let tq: Vec<Vec<f64>> = q
        .iter()
        .map(|col| (0..m).map(|i| (0..m).map(|j| t[(i, j)] * col[j]).sum()).collect())
        .collect();
    let h = Mat::from_fn(kept, kept, |a, c| blas::dot(&q[a], &tq[c]));
    let (lambda, z) = lowest_eigenpairs(&h, kept, kept)?;

    let n = space[0].len();
    let mut fresh = vec![vec![0.0; n]; kept];
    for (c, f) in fresh.iter_mut().enumerate() {
        for i in 0..m {
            let coef: f64 = (0..kept).map(|a| q[a][i] * z[(a, c)]).sum();
            if coef != 0.0 {
                blas::axpy(coef, &space[i], f);
            }
        }
    }
    for (dst, src) in space.iter_mut().zip(fresh) {
        *dst = src;
    }
    *t = Mat::zeros(m, m);
    for (c, l) in lambda.iter().enumerate() {
        t[(c, c)] = *l;
    }
    Ok(kept)
}

impl Solver for IncEigCg {
    fn solve(&mut self, x: &mut [f64], b: &[f64]) -> Result<SolveStats<f64>, KError> {
        let n = self.ctx.len();
        check_len(n, x.len())?;
        check_len(n, b.len())?;
        for v in [&mut self.r, &mut self.p, &mut self.ap, &mut self.w] {
            v.resize(n, 0.0);
        }
        let timer = SolveTimer::start(&self.ctx, "inc_eigcg");
        let global = self.param.global_reduction;
        let site_len = self.ctx.mat.layout().map(|l| l.ncomp()).unwrap_or(1);

        let b2 = self.ctx.norm2(global, b);
        if b2 == 0.0 {
            blas::zero(x);
            self.param.true_res = 0.0;
            self.param.true_res_hq = 0.0;
            self.param.iter = 0;
            timer.finish(&self.ctx, &mut self.param);
            return Ok(SolveStats::new(0, 0.0, true));
        }

        self.deflate_spinor(x, b)?;
        let harvest = self.param.rhs_idx < self.param.deflation_grid;
        let (stats, ritz) = self.eigcg(x, b, b2, harvest)?;
        if harvest {
            let admitted = self.mgs(ritz);
            self.construct_projection_mat(admitted)?;
            self.param.rhs_idx += 1;
        }

        self.ctx.mat.apply(&mut self.r, x);
        blas::xmy(b, &mut self.r);
        let true_r2 = self.ctx.norm2(global, &self.r);
        self.param.true_res = (true_r2 / b2).sqrt();
        self.param.true_res_hq = if self.param.residual_type.contains(ResidualType::HEAVY_QUARK) {
            blas::heavy_quark_residual(x, &self.r, site_len)
        } else {
            0.0
        };
        self.param.iter = stats.iterations;
        timer.finish(&self.ctx, &mut self.param);
        self.print_summary(stats.iterations, stats.final_residual.powi(2), b2);
        Ok(stats)
    }

    fn param(&self) -> &SolverParam {
        &self.param
    }

    fn param_mut(&mut self) -> &mut SolverParam {
        &mut self.param
    }

    fn name(&self) -> &'static str {
        "inc_eigcg"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InverterType;
    use crate::core::DenseOp;
    use std::sync::Arc;

    fn param() -> SolverParam {
        let mut p = SolverParam::new(InverterType::IncEigCg, 1e-10, 500);
        p.nev = 2;
        p.m = 16;
        p.deflation_grid = 2;
        p
    }

    #[test]
    fn rejects_small_search_space() {
        let a = Mat::from_fn(4, 4, |i, j| if i == j { 1.0 } else { 0.0 });
        let ctx = SolverContext::single(Arc::new(DenseOp::new(a)));
        let mut p = param();
        p.m = 4;
        assert!(matches!(IncEigCg::new(p, ctx), Err(KError::Config(_))));
    }

    #[test]
    fn deflation_space_solves_its_own_modes_exactly() {
        let n = 40;
        let a = Mat::from_fn(n, n, |i, j| if i == j { 0.01 * (i + 1) as f64 } else { 0.0 });
        let ctx = SolverContext::single(Arc::new(DenseOp::new(a)));
        let mut s = IncEigCg::new(param(), ctx).unwrap();
        let e = |k: usize| (0..n).map(|i| if i == k { 1.0 } else { 0.0 }).collect::<Vec<f64>>();
        s.construct_projection_mat(s.mgs(vec![e(0), e(1)])).unwrap();
        assert_eq!(s.projection().curr_dim(), 2);
        assert!((s.projection().get(1, 1) - 0.02).abs() < 1e-15);

        let mut b = e(0);
        b[1] = 2.0;
        let mut x = vec![0.0; n];
        s.deflate_spinor(&mut x, &b).unwrap();
        assert!((x[0] - 100.0).abs() < 1e-9);
        assert!((x[1] - 100.0).abs() < 1e-9);
    }
}
