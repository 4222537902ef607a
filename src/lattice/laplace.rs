//! Gauge-free lattice Laplacian with a mass term.
//!
//! `(A x)(s) = m² x(s) + Σ_μ [ w_μ(s) (x(s) − x(s+μ)) + w_μ(s−μ) (x(s) − x(s−μ)) ]`
//!
//! acting identically on every component. With positive link weights `w` the operator is
//! symmetric positive definite, with spectrum in `[m², m² + 4 Σ_μ max w]`.

use crate::config::NDIM;
use crate::core::traits::LinearOperator;
use crate::error::KError;
use crate::lattice::FieldLayout;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(feature = "rayon")]
use rayon::prelude::*;

pub struct LaplaceOp {
    layout: FieldLayout,
    mass: f64,
    // w_mu(s) at cb * NDIM + mu
    links: Vec<f64>,
    flops: AtomicU64,
}

impl LaplaceOp {
    pub fn new(layout: FieldLayout, mass: f64) -> Self {
        let links = vec![1.0; layout.lattice.volume() * NDIM];
        Self {
            layout,
            mass,
            links,
            flops: AtomicU64::new(0),
        }
    }

    /// Draws every link weight uniformly from `[1 − spread, 1 + spread]`.
    pub fn with_random_links<R: Rng>(mut self, rng: &mut R, spread: f64) -> Result<Self, KError> {
        if !(0.0..1.0).contains(&spread) {
            return Err(KError::Config(format!("link spread {spread} must lie in [0, 1)")));
        }
        for w in self.links.iter_mut() {
            *w = 1.0 + spread * (2.0 * rng.r#gen::<f64>() - 1.0);
        }
        Ok(self)
    }

    fn site(&self, out: &mut [f64], inp: &[f64], cb: usize) {
        let lat = &self.layout.lattice;
        let nc = self.layout.ncomp();
        let x = &inp[cb * nc..(cb + 1) * nc];
        let mut diag = self.mass * self.mass;
        out.fill(0.0);
        for mu in 0..NDIM {
            let f = lat.forward(cb, mu);
            let b = lat.backward(cb, mu);
            let wf = self.links[cb * NDIM + mu];
            let wb = self.links[b * NDIM + mu];
            diag += wf + wb;
            for c in 0..nc {
                out[c] -= wf * inp[f * nc + c] + wb * inp[b * nc + c];
            }
        }
        for c in 0..nc {
            out[c] += diag * x[c];
        }
    }
}

impl LinearOperator for LaplaceOp {
    fn len(&self) -> usize {
        self.layout.len()
    }

    fn apply(&self, out: &mut [f64], inp: &[f64]) {
        assert_eq!(inp.len(), self.len(), "Input vector has incorrect length");
        assert_eq!(out.len(), self.len(), "Output vector has incorrect length");
        let nc = self.layout.ncomp();
        #[cfg(feature = "rayon")]
        out.par_chunks_mut(nc)
            .enumerate()
            .for_each(|(cb, o)| self.site(o, inp, cb));
        #[cfg(not(feature = "rayon"))]
        out.chunks_mut(nc)
            .enumerate()
            .for_each(|(cb, o)| self.site(o, inp, cb));
        self.flops
            .fetch_add((self.len() * (4 * NDIM + 2)) as u64, Ordering::Relaxed);
    }

    fn apply_dagger(&self, out: &mut [f64], inp: &[f64]) {
        self.apply(out, inp);
    }

    fn mass(&self) -> f64 {
        self.mass
    }

    fn flops(&self) -> u64 {
        self.flops.load(Ordering::Relaxed)
    }

    fn layout(&self) -> Option<&FieldLayout> {
        Some(&self.layout)
    }

    fn name(&self) -> &'static str {
        "laplace"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::blas;
    use crate::lattice::Lattice;
    use approx::assert_abs_diff_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::sync::Arc;

    #[test]
    fn constant_field_sees_only_mass() {
        let lat = Arc::new(Lattice::new([4, 4, 2, 2]).unwrap());
        let op = LaplaceOp::new(FieldLayout::new(lat, 1, 2), 0.5);
        let x = vec![1.0; op.len()];
        let mut y = vec![0.0; op.len()];
        op.apply(&mut y, &x);
        for v in y {
            assert_abs_diff_eq!(v, 0.25, epsilon = 1e-14);
        }
    }

    #[test]
    fn random_links_keep_symmetry() {
        let mut rng = StdRng::seed_from_u64(7);
        let lat = Arc::new(Lattice::new([4, 2, 2, 2]).unwrap());
        let op = LaplaceOp::new(FieldLayout::new(lat, 1, 1), 0.1)
            .with_random_links(&mut rng, 0.5)
            .unwrap();
        let n = op.len();
        let x: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>()).collect();
        let y: Vec<f64> = (0..n).map(|_| rng.r#gen::<f64>()).collect();
        let (mut ax, mut ay) = (vec![0.0; n], vec![0.0; n]);
        op.apply(&mut ax, &x);
        op.apply(&mut ay, &y);
        assert_abs_diff_eq!(blas::dot(&y, &ax), blas::dot(&x, &ay), epsilon = 1e-12);
        assert!(blas::dot(&x, &ax) > 0.0);
    }
}
