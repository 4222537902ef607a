//! Minimum-residual extrapolation of an initial guess from earlier solutions.
//!
//! Given basis vectors `p_i` and their images `q_i = A p_i`, finds the combination
//! `x = Σ a_i p_i` minimising `|b − A x|`. The basis is first orthonormalised with modified
//! Gram-Schmidt (the same transformation applied to `q` keeps `q_i = A p_i`), then the small
//! dense normal equations `G a = c`, `G_ij = <q_i, q_j>`, `c_i = <q_i, b>` are solved once.

use crate::context::SolverContext;
use crate::core::blas;
use crate::error::{KError, check_len};
use crate::utils::profile::TimeProfile;
use faer::Mat;
use faer::linalg::solvers::{FullPivLu, SolveCore};
use std::sync::Arc;

pub struct MinResExt {
    ctx: SolverContext,
}

impl MinResExt {
    pub fn new(ctx: SolverContext) -> Self {
        Self { ctx }
    }

    pub fn profile(&self) -> &Arc<TimeProfile> {
        &self.ctx.profile
    }

    /// Writes the extrapolated guess into `x` and returns `|b − A x|`.
    ///
    /// `p` and `q` are overwritten with their orthonormalised versions. Dependent basis vectors
    /// are dropped; an empty basis gives `x = 0`.
    pub fn solve(
        &self,
        x: &mut [f64],
        b: &[f64],
        p: &mut [Vec<f64>],
        q: &mut [Vec<f64>],
    ) -> Result<f64, KError> {
        let n = self.ctx.len();
        check_len(n, x.len())?;
        check_len(n, b.len())?;
        check_len(p.len(), q.len())?;
        let _scope = self.ctx.profile.scope("minres_ext");
        blas::zero(x);

        // orthonormalise p, carrying q along
        let mut keep = Vec::with_capacity(p.len());
        for i in 0..p.len() {
            check_len(n, p[i].len())?;
            check_len(n, q[i].len())?;
            let before = self.ctx.norm2(true, &p[i]).sqrt();
            for &j in &keep {
                let (pj, pi) = pair(p, j, i);
                let (qj, qi) = pair(q, j, i);
                let c = self.ctx.dot(true, pj, pi);
                blas::axpy(-c, pj, pi);
                blas::axpy(-c, qj, qi);
            }
            let nrm = self.ctx.norm2(true, &p[i]).sqrt();
            if !(nrm > 1e-12 * before) {
                tracing::debug!(vector = i, "minres_ext: dropping dependent basis vector");
                continue;
            }
            blas::scale(1.0 / nrm, &mut p[i]);
            blas::scale(1.0 / nrm, &mut q[i]);
            keep.push(i);
        }

        let m = keep.len();
        if m == 0 {
            return Ok(self.ctx.norm2(true, b).sqrt());
        }
        let g = Mat::from_fn(m, m, |i, j| self.ctx.dot(true, &q[keep[i]], &q[keep[j]]));
        let mut a: Vec<f64> = keep.iter().map(|&i| self.ctx.dot(true, &q[i], b)).collect();
        let lu = FullPivLu::new(g.as_ref());
        lu.solve_in_place_with_conj(
            faer::Conj::No,
            faer::MatMut::from_column_major_slice_mut(&mut a, m, 1),
        );
        if a.iter().any(|v| !v.is_finite()) {
            return Err(KError::SolveError("minres_ext normal equations are singular".into()));
        }

        let mut r = b.to_vec();
        for (ai, &i) in a.iter().zip(&keep) {
            blas::axpy(*ai, &p[i], x);
            blas::axpy(-*ai, &q[i], &mut r);
        }
        Ok(self.ctx.norm2(true, &r).sqrt())
    }
}

/// Shared and exclusive borrows of two distinct entries, `j < i`.
fn pair(v: &mut [Vec<f64>], j: usize, i: usize) -> (&Vec<f64>, &mut Vec<f64>) {
    let (lo, hi) = v.split_at_mut(i);
    (&lo[j], &mut hi[0])
}
