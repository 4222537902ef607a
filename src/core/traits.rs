//! Core operator traits for latsolve.

use crate::config::SolutionType;
use crate::error::{KError, check_len};
use crate::lattice::FieldLayout;
use std::sync::Arc;

/// Shared handle to an operator; the residual, sloppy and preconditioning operators of a solve
/// are usually three views of one physical operator.
pub type OperatorRef = Arc<dyn LinearOperator>;

/// Sites a field lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteSubset {
    Full,
    /// Even sites only.
    Parity,
}

/// Source and solution of the sub-problem an operator actually solves.
///
/// Both borrow existing storage: `sol` is the caller's solution (or its even half) and `src`
/// is either the caller's source or the odd half of the solution vector used as scratch.
pub struct Prepared<'a> {
    pub src: &'a [f64],
    pub sol: &'a mut [f64],
}

/// Linear operator `A` acting on real lattice fields.
pub trait LinearOperator: Send + Sync {
    /// Length of the vectors the operator acts on.
    fn len(&self) -> usize;

    /// Compute `out = A · inp`.
    fn apply(&self, out: &mut [f64], inp: &[f64]);

    /// Compute `out = A† · inp`.
    fn apply_dagger(&self, out: &mut [f64], inp: &[f64]);

    /// Compute `out = A† A · inp`.
    fn apply_normal(&self, out: &mut [f64], inp: &[f64]) -> Result<(), KError> {
        check_len(self.len(), inp.len())?;
        let mut tmp = vec![0.0; self.len()];
        self.apply(&mut tmp, inp);
        self.apply_dagger(out, &tmp);
        Ok(())
    }

    fn site_subset(&self) -> SiteSubset {
        SiteSubset::Full
    }

    /// Length of a full-lattice vector of the underlying field.
    fn full_len(&self) -> usize {
        match self.site_subset() {
            SiteSubset::Full => self.len(),
            SiteSubset::Parity => 2 * self.len(),
        }
    }

    fn mass(&self) -> f64 {
        0.0
    }

    fn kappa(&self) -> f64 {
        1.0 / (2.0 * (4.0 + self.mass()))
    }

    /// Floating point operations performed so far.
    fn flops(&self) -> u64;

    /// Lattice and field shape, when the operator lives on a lattice.
    fn layout(&self) -> Option<&FieldLayout> {
        None
    }

    fn name(&self) -> &'static str;

    /// Maps the problem `M x = b` of solution type `sol_type` onto the system this operator
    /// solves.
    fn prepare<'a>(
        &self,
        x: &'a mut [f64],
        b: &'a [f64],
        sol_type: SolutionType,
    ) -> Result<Prepared<'a>, KError> {
        if sol_type == SolutionType::MatPc && self.site_subset() == SiteSubset::Full {
            return Err(KError::Unsupported(
                "a parity solution requires a parity preconditioned operator",
            ));
        }
        check_len(self.len(), x.len())?;
        check_len(self.len(), b.len())?;
        Ok(Prepared { src: b, sol: x })
    }

    /// Rebuilds the solution of solution type `sol_type` after the prepared system was solved.
    fn reconstruct(&self, _x: &mut [f64], _b: &[f64], _sol_type: SolutionType) -> Result<(), KError> {
        Ok(())
    }

    /// Lifts a residual of the prepared parity system to a full-lattice residual whose prepared
    /// source is that residual.
    fn expand_residual(&self, _r_pc: &[f64], _r_full: &mut [f64]) -> Result<(), KError> {
        Err(KError::Unsupported("operator has no parity reduction"))
    }
}
