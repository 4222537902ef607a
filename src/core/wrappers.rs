//! Operator wrappers.
//!
//! - [`DenseOp`] exposes a `faer::Mat` as a [`LinearOperator`], which is convenient for small
//!   test systems and for checking lattice operators against an explicit matrix.
//! - [`Shifted`] adds a constant diagonal shift, `A + σ I`.
//! - [`Rounded`] emulates a lower precision tier by rounding every output of the wrapped
//!   operator; it is how the sloppy and preconditioning operators of a solve are derived from
//!   the full precision one.
//!
//! # References
//! - [faer crate documentation](https://docs.rs/faer)

use crate::config::{Precision, SolutionType};
use crate::core::traits::{LinearOperator, OperatorRef, Prepared, SiteSubset};
use crate::error::KError;
use crate::lattice::FieldLayout;
use faer::Mat;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Dense matrix operator.
pub struct DenseOp {
    a: Mat<f64>,
    flops: AtomicU64,
}

impl DenseOp {
    pub fn new(a: Mat<f64>) -> Self {
        assert_eq!(a.nrows(), a.ncols(), "DenseOp requires a square matrix");
        Self {
            a,
            flops: AtomicU64::new(0),
        }
    }

    pub fn matrix(&self) -> &Mat<f64> {
        &self.a
    }
}

impl LinearOperator for DenseOp {
    fn len(&self) -> usize {
        self.a.nrows()
    }

    fn apply(&self, out: &mut [f64], inp: &[f64]) {
        assert_eq!(self.a.ncols(), inp.len(), "Input vector has incorrect length");
        assert_eq!(self.a.nrows(), out.len(), "Output vector has incorrect length");
        for (i, oi) in out.iter_mut().enumerate() {
            *oi = (0..self.a.ncols()).map(|j| self.a[(i, j)] * inp[j]).sum();
        }
        let n = self.a.nrows() as u64;
        self.flops.fetch_add(2 * n * n, Ordering::Relaxed);
    }

    fn apply_dagger(&self, out: &mut [f64], inp: &[f64]) {
        assert_eq!(self.a.nrows(), inp.len(), "Input vector has incorrect length");
        assert_eq!(self.a.ncols(), out.len(), "Output vector has incorrect length");
        for (j, oj) in out.iter_mut().enumerate() {
            *oj = (0..self.a.nrows()).map(|i| self.a[(i, j)] * inp[i]).sum();
        }
        let n = self.a.nrows() as u64;
        self.flops.fetch_add(2 * n * n, Ordering::Relaxed);
    }

    fn flops(&self) -> u64 {
        self.flops.load(Ordering::Relaxed)
    }

    fn name(&self) -> &'static str {
        "dense"
    }
}

/// `A + σ I`
pub struct Shifted {
    op: OperatorRef,
    sigma: f64,
}

impl Shifted {
    pub fn new(op: OperatorRef, sigma: f64) -> Self {
        Self { op, sigma }
    }
}

impl LinearOperator for Shifted {
    fn len(&self) -> usize {
        self.op.len()
    }

    fn apply(&self, out: &mut [f64], inp: &[f64]) {
        self.op.apply(out, inp);
        crate::core::blas::axpy(self.sigma, inp, out);
    }

    fn apply_dagger(&self, out: &mut [f64], inp: &[f64]) {
        self.op.apply_dagger(out, inp);
        crate::core::blas::axpy(self.sigma, inp, out);
    }

    fn site_subset(&self) -> SiteSubset {
        self.op.site_subset()
    }

    fn mass(&self) -> f64 {
        self.op.mass()
    }

    fn flops(&self) -> u64 {
        self.op.flops()
    }

    fn layout(&self) -> Option<&FieldLayout> {
        self.op.layout()
    }

    fn name(&self) -> &'static str {
        "shifted"
    }
}

/// Operator whose results are rounded to a lower precision tier.
pub struct Rounded {
    op: OperatorRef,
    precision: Precision,
}

impl Rounded {
    /// Wraps `op`, returning it unchanged when `precision` is double.
    pub fn wrap(op: OperatorRef, precision: Precision) -> OperatorRef {
        match precision {
            Precision::Double => op,
            _ => Arc::new(Self { op, precision }),
        }
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }
}

impl LinearOperator for Rounded {
    fn len(&self) -> usize {
        self.op.len()
    }

    fn apply(&self, out: &mut [f64], inp: &[f64]) {
        self.op.apply(out, inp);
        self.precision.round_slice(out);
    }

    fn apply_dagger(&self, out: &mut [f64], inp: &[f64]) {
        self.op.apply_dagger(out, inp);
        self.precision.round_slice(out);
    }

    fn apply_normal(&self, out: &mut [f64], inp: &[f64]) -> Result<(), KError> {
        self.op.apply_normal(out, inp)?;
        self.precision.round_slice(out);
        Ok(())
    }

    fn site_subset(&self) -> SiteSubset {
        self.op.site_subset()
    }

    fn full_len(&self) -> usize {
        self.op.full_len()
    }

    fn mass(&self) -> f64 {
        self.op.mass()
    }

    fn kappa(&self) -> f64 {
        self.op.kappa()
    }

    fn flops(&self) -> u64 {
        self.op.flops()
    }

    fn layout(&self) -> Option<&FieldLayout> {
        self.op.layout()
    }

    fn name(&self) -> &'static str {
        self.op.name()
    }

    fn prepare<'a>(
        &self,
        x: &'a mut [f64],
        b: &'a [f64],
        sol_type: SolutionType,
    ) -> Result<Prepared<'a>, KError> {
        self.op.prepare(x, b, sol_type)
    }

    fn reconstruct(&self, x: &mut [f64], b: &[f64], sol_type: SolutionType) -> Result<(), KError> {
        self.op.reconstruct(x, b, sol_type)
    }

    fn expand_residual(&self, r_pc: &[f64], r_full: &mut [f64]) -> Result<(), KError> {
        self.op.expand_residual(r_pc, r_full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tridiag(n: usize) -> Mat<f64> {
        Mat::from_fn(n, n, |i, j| {
            if i == j {
                4.0
            } else if i.abs_diff(j) == 1 {
                -1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn shifted_adds_diagonal() {
        let op: OperatorRef = Arc::new(DenseOp::new(tridiag(3)));
        let s = Shifted::new(op, 2.0);
        let mut y = vec![0.0; 3];
        s.apply(&mut y, &[1.0, 0.0, 0.0]);
        assert_eq!(y, vec![6.0, -1.0, 0.0]);
    }

    #[test]
    fn rounded_matches_single_precision() {
        let op: OperatorRef = Arc::new(DenseOp::new(tridiag(3)));
        let r = Rounded::wrap(op.clone(), Precision::Single);
        let x = [1.0 / 3.0, 0.1, 0.7];
        let (mut a, mut b) = (vec![0.0; 3], vec![0.0; 3]);
        op.apply(&mut a, &x);
        r.apply(&mut b, &x);
        for (u, v) in a.iter().zip(&b) {
            assert_eq!(*v, *u as f32 as f64);
        }
    }
}
