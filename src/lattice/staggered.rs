//! Free staggered operator and its even-odd preconditioned form.
//!
//! `M = 2m + D` with the antisymmetric hopping term
//! `(D x)(s) = ½ Σ_μ η_μ(s) [x(s+μ) − x(s−μ)]`, `η_μ(s) = (−1)^(x_0 + … + x_{μ−1})`.
//!
//! In checkerboard blocks `M = [[2m, D_eo], [D_oe, 2m]]` and the even-parity Schur
//! complement is `M_pc = 4m² − D_eo D_oe`, symmetric positive definite since
//! `D_oe = −D_eoᵀ`.
//!
//! # References
//! - Kogut, J. & Susskind, L. (1975). Hamiltonian formulation of Wilson's lattice gauge theories.

use crate::config::{NDIM, SolutionType};
use crate::core::blas;
use crate::core::traits::{LinearOperator, Prepared, SiteSubset};
use crate::error::{KError, check_len};
use crate::lattice::FieldLayout;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

pub struct StaggeredOp {
    layout: FieldLayout,
    mass: f64,
    // η_μ(s) at cb * NDIM + mu
    phases: Vec<f64>,
    flops: AtomicU64,
}

impl StaggeredOp {
    pub fn new(layout: FieldLayout, mass: f64) -> Result<Self, KError> {
        if layout.nspin != 1 {
            return Err(KError::Config(format!(
                "staggered fields carry one spin, got {}",
                layout.nspin
            )));
        }
        if !layout.lattice.is_parity_split() {
            return Err(KError::Config(
                "staggered operator requires even lattice extents".into(),
            ));
        }
        let lat = &layout.lattice;
        let mut phases = vec![1.0; lat.volume() * NDIM];
        for cb in 0..lat.volume() {
            let c = lat.coords(cb);
            let mut sum = 0;
            for mu in 0..NDIM {
                phases[cb * NDIM + mu] = if sum % 2 == 0 { 1.0 } else { -1.0 };
                sum += c[mu];
            }
        }
        Ok(Self {
            layout,
            mass,
            phases,
            flops: AtomicU64::new(0),
        })
    }

    /// `out = D_{p, 1−p} inp` for the sites of parity `parity`; both vectors are single
    /// parity fields.
    pub fn dslash(&self, out: &mut [f64], inp: &[f64], parity: usize) {
        let lat = &self.layout.lattice;
        let nc = self.layout.ncomp();
        let vcb = lat.volume_cb();
        let other = (1 - parity) * vcb;
        let site = |k: usize, o: &mut [f64]| {
            let cb = parity * vcb + k;
            o.fill(0.0);
            for mu in 0..NDIM {
                let eta = 0.5 * self.phases[cb * NDIM + mu];
                let f = lat.forward(cb, mu) - other;
                let b = lat.backward(cb, mu) - other;
                for c in 0..nc {
                    o[c] += eta * (inp[f * nc + c] - inp[b * nc + c]);
                }
            }
        };
        #[cfg(feature = "rayon")]
        out.par_chunks_mut(nc).enumerate().for_each(|(k, o)| site(k, o));
        #[cfg(not(feature = "rayon"))]
        out.chunks_mut(nc).enumerate().for_each(|(k, o)| site(k, o));
        self.flops
            .fetch_add((out.len() * 4 * NDIM) as u64, Ordering::Relaxed);
    }

    fn apply_signed(&self, out: &mut [f64], inp: &[f64], sign: f64) {
        assert_eq!(inp.len(), self.len(), "Input vector has incorrect length");
        assert_eq!(out.len(), self.len(), "Output vector has incorrect length");
        let (oe, oo) = blas::split_parity_mut(out);
        self.dslash(oe, blas::odd(inp), 0);
        self.dslash(oo, blas::even(inp), 1);
        blas::axpby(2.0 * self.mass, inp, sign, out);
    }
}

impl LinearOperator for StaggeredOp {
    fn len(&self) -> usize {
        self.layout.len()
    }

    fn apply(&self, out: &mut [f64], inp: &[f64]) {
        self.apply_signed(out, inp, 1.0);
    }

    fn apply_dagger(&self, out: &mut [f64], inp: &[f64]) {
        self.apply_signed(out, inp, -1.0);
    }

    fn mass(&self) -> f64 {
        self.mass
    }

    fn kappa(&self) -> f64 {
        1.0 / (2.0 * self.mass)
    }

    fn flops(&self) -> u64 {
        self.flops.load(Ordering::Relaxed)
    }

    fn layout(&self) -> Option<&FieldLayout> {
        Some(&self.layout)
    }

    fn name(&self) -> &'static str {
        "staggered"
    }
}

/// Even-parity Schur complement `4m² − D_eo D_oe` of a [`StaggeredOp`].
pub struct StaggeredPcOp {
    op: Arc<StaggeredOp>,
}

impl StaggeredPcOp {
    pub fn new(op: Arc<StaggeredOp>) -> Self {
        Self { op }
    }
}

impl LinearOperator for StaggeredPcOp {
    fn len(&self) -> usize {
        self.op.layout.parity_len()
    }

    fn apply(&self, out: &mut [f64], inp: &[f64]) {
        assert_eq!(inp.len(), self.len(), "Input vector has incorrect length");
        let mut tmp = vec![0.0; self.len()];
        self.op.dslash(&mut tmp, inp, 1);
        self.op.dslash(out, &tmp, 0);
        let m2 = 4.0 * self.op.mass * self.op.mass;
        blas::axpby(m2, inp, -1.0, out);
    }

    fn apply_dagger(&self, out: &mut [f64], inp: &[f64]) {
        self.apply(out, inp);
    }

    /// The normal operator of the preconditioned staggered system is not defined; the
    /// preconditioned operator is already Hermitian positive definite and `apply` must be
    /// used instead.
    fn apply_normal(&self, _out: &mut [f64], _inp: &[f64]) -> Result<(), KError> {
        Err(KError::Unsupported(
            "normal operator of the preconditioned staggered operator is not defined, use apply",
        ))
    }

    fn site_subset(&self) -> SiteSubset {
        SiteSubset::Parity
    }

    fn mass(&self) -> f64 {
        self.op.mass
    }

    fn kappa(&self) -> f64 {
        self.op.kappa()
    }

    fn flops(&self) -> u64 {
        self.op.flops()
    }

    fn layout(&self) -> Option<&FieldLayout> {
        Some(&self.op.layout)
    }

    fn name(&self) -> &'static str {
        "staggered-pc"
    }

    /// For a full solution the prepared source `2m b_e − D_eo b_o` is written into the odd
    /// half of `x`, and the even half of `x` is the solution of the reduced system.
    fn prepare<'a>(
        &self,
        x: &'a mut [f64],
        b: &'a [f64],
        sol_type: SolutionType,
    ) -> Result<Prepared<'a>, KError> {
        match sol_type {
            SolutionType::MatPc => {
                check_len(self.len(), x.len())?;
                check_len(self.len(), b.len())?;
                Ok(Prepared { src: b, sol: x })
            }
            SolutionType::Mat => {
                check_len(self.full_len(), x.len())?;
                check_len(self.full_len(), b.len())?;
                let (xe, xo) = blas::split_parity_mut(x);
                self.op.dslash(xo, blas::odd(b), 0);
                blas::axpby(2.0 * self.op.mass, blas::even(b), -1.0, xo);
                Ok(Prepared { src: &*xo, sol: xe })
            }
        }
    }

    /// `x_o = (b_o − D_oe x_e) / 2m`
    fn reconstruct(&self, x: &mut [f64], b: &[f64], sol_type: SolutionType) -> Result<(), KError> {
        if sol_type == SolutionType::MatPc {
            return Ok(());
        }
        check_len(self.full_len(), x.len())?;
        check_len(self.full_len(), b.len())?;
        let (xe, xo) = blas::split_parity_mut(x);
        self.op.dslash(xo, xe, 1);
        blas::axpby(1.0 / (2.0 * self.op.mass), blas::odd(b), -1.0 / (2.0 * self.op.mass), xo);
        Ok(())
    }

    fn expand_residual(&self, r_pc: &[f64], r_full: &mut [f64]) -> Result<(), KError> {
        check_len(self.len(), r_pc.len())?;
        check_len(self.full_len(), r_full.len())?;
        let (re, ro) = blas::split_parity_mut(r_full);
        re.copy_from_slice(r_pc);
        blas::scale(1.0 / (2.0 * self.op.mass), re);
        blas::zero(ro);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::Lattice;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn setup() -> (Arc<StaggeredOp>, StdRng) {
        let lat = Arc::new(Lattice::new([4, 4, 2, 2]).unwrap());
        let op = StaggeredOp::new(FieldLayout::new(lat, 1, 3), 0.1).unwrap();
        (Arc::new(op), StdRng::seed_from_u64(11))
    }

    #[test]
    fn hopping_term_is_antisymmetric() {
        let (op, mut rng) = setup();
        let n = op.len();
        let x: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>() - 0.5).collect();
        let y: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>() - 0.5).collect();
        let (mut mx, mut mdy) = (vec![0.0; n], vec![0.0; n]);
        op.apply(&mut mx, &x);
        op.apply_dagger(&mut mdy, &y);
        assert_abs_diff_eq!(blas::dot(&y, &mx), blas::dot(&mdy, &x), epsilon = 1e-12);
    }

    #[test]
    fn prepare_solve_reconstruct_recovers_full_solution() {
        let (op, mut rng) = setup();
        let pc = StaggeredPcOp::new(op.clone());
        let n = op.len();
        let x_true: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>() - 0.5).collect();
        let mut b = vec![0.0; n];
        op.apply(&mut b, &x_true);

        // the prepared source must equal M_pc x_e for the true solution
        let mut x = vec![0.0; n];
        let prep = pc.prepare(&mut x, &b, SolutionType::Mat).unwrap();
        let mut mx = vec![0.0; pc.len()];
        pc.apply(&mut mx, blas::even(&x_true));
        for (a, e) in prep.src.iter().zip(&mx) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-12);
        }

        x[..n / 2].copy_from_slice(blas::even(&x_true));
        pc.reconstruct(&mut x, &b, SolutionType::Mat).unwrap();
        for (a, e) in x.iter().zip(&x_true) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-12);
        }
    }

    #[test]
    fn expanded_residual_prepares_back() {
        let (op, mut rng) = setup();
        let pc = StaggeredPcOp::new(op.clone());
        let r: Vec<f64> = (0..pc.len()).map(|_| rng.r#gen::<f64>()).collect();
        let mut full = vec![0.0; op.len()];
        pc.expand_residual(&r, &mut full).unwrap();
        let mut x = vec![0.0; op.len()];
        let prep = pc.prepare(&mut x, &full, SolutionType::Mat).unwrap();
        for (a, e) in prep.src.iter().zip(&r) {
            assert_abs_diff_eq!(a, e, epsilon = 1e-12);
        }
    }

    #[test]
    fn normal_operator_is_unsupported() {
        let (op, _) = setup();
        let pc = StaggeredPcOp::new(op);
        let x = vec![1.0; pc.len()];
        let mut y = vec![0.0; pc.len()];
        assert!(matches!(pc.apply_normal(&mut y, &x), Err(KError::Unsupported(_))));
    }
}
