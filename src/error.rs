use thiserror::Error;

// Unified error type for latsolve

#[derive(Error, Debug)]
pub enum KError {
    #[error("factorization error: {0}")]
    FactorError(String),
    #[error("solve error: {0}")]
    SolveError(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("{solver} breakdown at iteration {iteration}: {detail}")]
    Breakdown {
        solver: &'static str,
        iteration: usize,
        detail: String,
    },
    #[error("indefinite matrix detected (p^T A p <= 0)")]
    IndefiniteMatrix,
    #[error("multigrid verification failed on level {level} ({check}): deviation {deviation:e} exceeds tolerance {tol:e}")]
    VerificationFailed {
        level: usize,
        check: &'static str,
        deviation: f64,
        tol: f64,
    },
    #[error("setup error: {0}")]
    Setup(String),
    #[error("dimension mismatch: expected length {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}

impl KError {
    pub(crate) fn breakdown(solver: &'static str, iteration: usize, detail: impl Into<String>) -> Self {
        KError::Breakdown {
            solver,
            iteration,
            detail: detail.into(),
        }
    }
}

/// Checks that a vector has the length an operator expects.
pub(crate) fn check_len(expected: usize, got: usize) -> Result<(), KError> {
    if expected != got {
        return Err(KError::DimensionMismatch { expected, got });
    }
    Ok(())
}
