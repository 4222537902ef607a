//! Factory and shared state for the solvers of one linear system.
//!
//! A [`SolverContext`] bundles the three views of the system operator a solver works with:
//! `mat` for true residuals, `mat_sloppy` for the Krylov iterations and `mat_precon` for an
//! inner preconditioning solver, together with the timing profile and the communicator that
//! carries global reductions.
//!
//! [`SolverContext::create`] maps [`SolverParam::inv_type`] to a boxed solver. Multi-shift and
//! deflated solves have their own constructors since their interfaces differ from `Solver`.

use crate::config::{InverterType, SolverParam};
use crate::core::blas;
use crate::core::traits::OperatorRef;
use crate::error::KError;
use crate::parallel::{Comm, default_comm};
use crate::solver::{self, BiCgStab, Cg, Gcr, IncEigCg, Mr, MultiShiftCg, Solver};
use crate::utils::profile::TimeProfile;
use std::sync::Arc;

#[derive(Clone)]
pub struct SolverContext {
    /// Operator used for true residuals.
    pub mat: OperatorRef,
    /// Operator used inside the iteration.
    pub mat_sloppy: OperatorRef,
    /// Operator handed to an inner preconditioning solver.
    pub mat_precon: OperatorRef,
    pub profile: Arc<TimeProfile>,
    pub comm: Arc<dyn Comm>,
}

impl SolverContext {
    pub fn new(
        mat: OperatorRef,
        mat_sloppy: OperatorRef,
        mat_precon: OperatorRef,
        profile: Arc<TimeProfile>,
    ) -> Self {
        Self {
            mat,
            mat_sloppy,
            mat_precon,
            profile,
            comm: default_comm(),
        }
    }

    /// Context in which all three operator roles are played by `mat`.
    pub fn single(mat: OperatorRef) -> Self {
        Self::new(mat.clone(), mat.clone(), mat, TimeProfile::new("solve"))
    }

    pub fn with_comm(mut self, comm: Arc<dyn Comm>) -> Self {
        self.comm = comm;
        self
    }

    pub fn with_profile(mut self, profile: Arc<TimeProfile>) -> Self {
        self.profile = profile;
        self
    }

    /// Length of the vectors of the system.
    pub fn len(&self) -> usize {
        self.mat.len()
    }

    /// Sums `x` over processes when `global` is set.
    pub fn reduce(&self, global: bool, x: f64) -> f64 {
        if global { self.comm.all_reduce(x) } else { x }
    }

    /// Element-wise [`SolverContext::reduce`] of a batch, in one collective.
    pub fn reduce_slice(&self, global: bool, xs: &mut [f64]) {
        if global {
            self.comm.all_reduce_slice(xs);
        }
    }

    pub fn dot(&self, global: bool, x: &[f64], y: &[f64]) -> f64 {
        self.reduce(global, blas::dot(x, y))
    }

    pub fn norm2(&self, global: bool, x: &[f64]) -> f64 {
        self.reduce(global, blas::norm2(x))
    }

    /// Flops of the context operators, counting shared operators once.
    pub fn operator_flops(&self) -> u64 {
        solver::operator_flops(&[&self.mat, &self.mat_sloppy, &self.mat_precon])
    }

    /// Builds the solver selected by `param.inv_type`.
    ///
    /// A GCR solver gets an inner solver built from the precondition fields when
    /// `inv_type_precondition` names a Krylov method.
    pub fn create(&self, param: SolverParam) -> Result<Box<dyn Solver>, KError> {
        match param.inv_type {
            InverterType::Cg => Ok(Box::new(Cg::new(param, self.clone()))),
            InverterType::BiCgStab => Ok(Box::new(BiCgStab::new(param, self.clone()))),
            InverterType::Mr => Ok(Box::new(Mr::new(param, self.clone()))),
            InverterType::IncEigCg => Ok(Box::new(self.create_deflated(param)?)),
            InverterType::Gcr => {
                let k = match param.inv_type_precondition {
                    InverterType::Invalid => None,
                    InverterType::Cg | InverterType::BiCgStab | InverterType::Mr | InverterType::Gcr => {
                        let inner = SolverContext {
                            mat: self.mat_precon.clone(),
                            mat_sloppy: self.mat_precon.clone(),
                            mat_precon: self.mat_precon.clone(),
                            profile: self.profile.clone(),
                            comm: self.comm.clone(),
                        };
                        Some(inner.create(param.preconditioner_param())?)
                    }
                    InverterType::Mg => {
                        return Err(KError::Config(
                            "a multigrid preconditioner must be supplied with create_with_preconditioner".into(),
                        ));
                    }
                    other => {
                        return Err(KError::Config(format!(
                            "{} is not supported as a GCR preconditioner",
                            other.name()
                        )));
                    }
                };
                Ok(Box::new(Gcr::new(param, self.clone(), k)))
            }
            InverterType::MultiShiftCg => Err(KError::Config(
                "multi-shift CG solves several systems; use create_multishift".into(),
            )),
            other => Err(KError::Config(format!(
                "solver type {} is not available through the factory",
                other.name()
            ))),
        }
    }

    /// Builds a solver that is preconditioned by an externally constructed `k`.
    pub fn create_with_preconditioner(
        &self,
        param: SolverParam,
        k: Box<dyn Solver>,
    ) -> Result<Box<dyn Solver>, KError> {
        match param.inv_type {
            InverterType::Gcr => Ok(Box::new(Gcr::new(param, self.clone(), Some(k)))),
            other => Err(KError::Config(format!(
                "{} does not accept a preconditioner",
                other.name()
            ))),
        }
    }

    pub fn create_multishift(&self, param: SolverParam) -> Result<MultiShiftCg, KError> {
        if param.inv_type != InverterType::MultiShiftCg {
            return Err(KError::Config(format!(
                "create_multishift called with {}",
                param.inv_type.name()
            )));
        }
        MultiShiftCg::new(param, self.clone())
    }

    pub fn create_deflated(&self, param: SolverParam) -> Result<IncEigCg, KError> {
        if param.inv_type != InverterType::IncEigCg {
            return Err(KError::Config(format!(
                "create_deflated called with {}",
                param.inv_type.name()
            )));
        }
        IncEigCg::new(param, self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DenseOp;
    use faer::Mat;

    fn ctx() -> SolverContext {
        let a = Mat::from_fn(3, 3, |i, j| if i == j { 2.0 } else { 0.0 });
        SolverContext::single(Arc::new(DenseOp::new(a)))
    }

    /// Two identical ranks: every sum doubles.
    #[derive(Default)]
    struct Doubling {
        batches: std::sync::atomic::AtomicUsize,
    }

    impl Comm for Doubling {
        fn rank(&self) -> usize {
            0
        }
        fn size(&self) -> usize {
            2
        }
        fn barrier(&self) {}
        fn all_reduce(&self, x: f64) -> f64 {
            2.0 * x
        }
        fn all_reduce_slice(&self, xs: &mut [f64]) {
            self.batches.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            xs.iter_mut().for_each(|x| *x *= 2.0);
        }
    }

    #[test]
    fn batched_reduction_is_one_collective() {
        let comm = Arc::new(Doubling::default());
        let ctx = ctx().with_comm(comm.clone());
        let mut xs = [1.0, -3.0];
        ctx.reduce_slice(false, &mut xs);
        assert_eq!(xs, [1.0, -3.0]);
        ctx.reduce_slice(true, &mut xs);
        assert_eq!(xs, [2.0, -6.0]);
        assert_eq!(comm.batches.load(std::sync::atomic::Ordering::Relaxed), 1);
        assert_eq!(ctx.dot(true, &[1.0, 2.0, 0.0], &[3.0, 1.0, 5.0]), 10.0);
    }

    #[test]
    fn factory_selects_by_type() {
        let ctx = ctx();
        for (t, name) in [
            (InverterType::Cg, "cg"),
            (InverterType::BiCgStab, "bicgstab"),
            (InverterType::Gcr, "gcr"),
            (InverterType::Mr, "mr"),
        ] {
            let s = ctx.create(SolverParam::new(t, 1e-8, 10)).unwrap();
            assert_eq!(s.name(), name);
        }
    }

    #[test]
    fn factory_rejects_unsupported_combinations() {
        let ctx = ctx();
        for t in [InverterType::Mg, InverterType::MultiShiftCg, InverterType::AlphaSa, InverterType::Invalid] {
            assert!(matches!(
                ctx.create(SolverParam::new(t, 1e-8, 10)),
                Err(KError::Config(_))
            ));
        }
        let mut p = SolverParam::new(InverterType::Gcr, 1e-8, 10);
        p.inv_type_precondition = InverterType::Mg;
        assert!(matches!(ctx.create(p), Err(KError::Config(_))));
        let k = ctx.create(SolverParam::new(InverterType::Mr, 0.0, 2)).unwrap();
        assert!(ctx
            .create_with_preconditioner(SolverParam::new(InverterType::Cg, 1e-8, 10), k)
            .is_err());
    }
}
