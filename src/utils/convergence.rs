//! Convergence tracking & tolerance checks for iterative solvers.

use crate::config::ResidualType;

#[derive(Clone, Debug)]
pub struct SolveStats<T> {
    pub iterations: usize,
    pub final_residual: T,
    pub converged: bool,
}

impl<T: Copy + num_traits::Float> SolveStats<T> {
    pub fn new(iterations: usize, final_residual: T, converged: bool) -> Self {
        Self {
            iterations,
            final_residual,
            converged,
        }
    }
}

/// Squared L2 stopping threshold for a source of squared norm `b2`.
///
/// Without the L2 flag only the heavy-quark residual decides, so the threshold is zero.
pub fn stopping(tol: f64, b2: f64, residual_type: ResidualType) -> f64 {
    if residual_type.contains(ResidualType::L2_RELATIVE) {
        tol * tol * b2
    } else {
        0.0
    }
}

/// True iff every requested residual norm meets its threshold; unrequested ones are ignored.
pub fn converged(residual_type: ResidualType, r2: f64, hq2: f64, r2_tol: f64, hq_tol: f64) -> bool {
    if residual_type.contains(ResidualType::HEAVY_QUARK) && hq2 > hq_tol {
        return false;
    }
    if residual_type.contains(ResidualType::L2_RELATIVE) && r2 > r2_tol {
        return false;
    }
    true
}

/// Reliable update trigger: fires once the iterated residual dropped by `delta` relative to
/// the largest residual seen since the last update.
#[derive(Clone, Debug)]
pub struct ReliableUpdate {
    delta: f64,
    max_r: f64,
    pub updates: usize,
}

impl ReliableUpdate {
    pub fn new(delta: f64, r0: f64) -> Self {
        Self {
            delta,
            max_r: r0,
            updates: 0,
        }
    }

    pub fn due(&mut self, r: f64) -> bool {
        self.max_r = self.max_r.max(r);
        r < self.delta * self.max_r
    }

    /// Records a true residual recomputation.
    pub fn reset(&mut self, r: f64) {
        self.max_r = r;
        self.updates += 1;
    }
}
