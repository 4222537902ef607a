//! Consistency checks of one multigrid level.

use crate::config::Precision;
use crate::core::blas;
use crate::core::traits::{LinearOperator, OperatorRef};
use crate::error::KError;
use crate::multigrid::null_space::random_vectors;
use crate::multigrid::transfer::Transfer;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{debug, info};

/// Acceptance threshold for checks carried out in `precision`.
pub fn tolerance(precision: Precision) -> f64 {
    match precision {
        Precision::Half => 5e-3,
        Precision::Single => 1e-4,
        Precision::Double => 1e-10,
    }
}

fn check(level: usize, name: &'static str, deviation: f64, tol: f64) -> Result<(), KError> {
    debug!(level, check = name, deviation, tol, "mg verify");
    if deviation < tol {
        Ok(())
    } else {
        Err(KError::VerificationFailed {
            level,
            check: name,
            deviation,
            tol,
        })
    }
}

/// Runs the level checks:
///
/// 1. every null vector `v` satisfies `‖v − P R v‖ < tol ‖v‖`;
/// 2. `‖η − R P η‖ < tol ‖η‖` for a random coarse vector;
/// 3. the coarse operator agrees with `R M P`;
/// 4. the coarse operator and its adjoint are consistent.
pub fn verify_level(
    level: usize,
    transfer: &Transfer,
    null_vectors: &[Vec<f64>],
    fine_op: &OperatorRef,
    coarse_op: &dyn LinearOperator,
    op_precision: Precision,
    seed: u64,
) -> Result<(), KError> {
    // the lower of the basis and operator precisions
    let tol = tolerance(transfer.precision().min(op_precision));
    let fine_len = transfer.fine_layout().len();
    let coarse_len = transfer.coarse_layout().len();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut f = vec![0.0; fine_len];
    let mut c = vec![0.0; coarse_len];

    for v in null_vectors.iter().take(transfer.n_vec()) {
        transfer.restrict(&mut c, v)?;
        transfer.prolong(&mut f, &c)?;
        let dev = blas::xmy_norm(v, &mut f).sqrt() / blas::norm2(v).sqrt();
        check(level, "null vectors preserved by P R", dev, tol)?;
    }

    let eta = random_vectors(&mut rng, 1, coarse_len).remove(0);
    let eta_norm = blas::norm2(&eta).sqrt();
    transfer.prolong(&mut f, &eta)?;
    transfer.restrict(&mut c, &f)?;
    let dev = blas::xmy_norm(&eta, &mut c).sqrt() / eta_norm;
    check(level, "R P is the identity", dev, tol)?;

    let mut mf = vec![0.0; fine_len];
    let mut rmp = vec![0.0; coarse_len];
    fine_op.apply(&mut mf, &f);
    transfer.restrict(&mut rmp, &mf)?;
    let mut mc = vec![0.0; coarse_len];
    coarse_op.apply(&mut mc, &eta);
    let mc_norm = blas::norm2(&mc).sqrt();
    let dev = blas::xmy_norm(&mc, &mut rmp).sqrt() / mc_norm;
    check(level, "coarse operator equals R M P", dev, tol)?;

    let y = random_vectors(&mut rng, 1, coarse_len).remove(0);
    let mut mdy = vec![0.0; coarse_len];
    coarse_op.apply_dagger(&mut mdy, &y);
    let lhs = blas::dot(&y, &mc);
    let rhs = blas::dot(&mdy, &eta);
    let dev = (lhs - rhs).abs() / (blas::norm2(&y).sqrt() * mc_norm);
    check(level, "coarse operator adjoint", dev, tol)?;

    info!(level, tol, "multigrid level verified");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{FieldLayout, Lattice, LaplaceOp};
    use crate::multigrid::coarse_op::CoarseOp;
    use std::sync::Arc;

    fn setup() -> (OperatorRef, FieldLayout, Vec<Vec<f64>>) {
        let lat = Arc::new(Lattice::new([4, 4, 2, 2]).unwrap());
        let layout = FieldLayout::new(lat, 1, 2);
        let op: OperatorRef = Arc::new(LaplaceOp::new(layout.clone(), 0.3));
        let mut rng = StdRng::seed_from_u64(4);
        let vecs = random_vectors(&mut rng, 2, layout.len());
        (op, layout, vecs)
    }

    #[test]
    fn consistent_level_passes() {
        let (op, layout, vecs) = setup();
        let t = Transfer::new(&layout, &vecs, [2, 2, 2, 2], 1, Precision::Double).unwrap();
        let coarse = CoarseOp::galerkin(&op, &t).unwrap();
        verify_level(0, &t, &vecs, &op, &coarse, Precision::Double, 1).unwrap();
    }

    #[test]
    fn foreign_null_vectors_fail() {
        let (op, layout, vecs) = setup();
        let t = Transfer::new(&layout, &vecs, [2, 2, 2, 2], 1, Precision::Double).unwrap();
        let coarse = CoarseOp::galerkin(&op, &t).unwrap();
        let mut rng = StdRng::seed_from_u64(99);
        let other = random_vectors(&mut rng, 2, layout.len());
        let err = verify_level(0, &t, &other, &op, &coarse, Precision::Double, 1).unwrap_err();
        assert!(matches!(
            err,
            KError::VerificationFailed { level: 0, check: "null vectors preserved by P R", .. }
        ));
    }
}
