//! Context and factory types tying operators, profiling and reductions to solvers.
//!
//! Import [`SolverContext`], hand it the operators of the system and call
//! [`SolverContext::create`] with a [`SolverParam`](crate::config::SolverParam).
//!
//! # Example
//! ```rust,ignore
//! use latsolve::context::SolverContext;
//! let ctx = SolverContext::single(op);
//! let mut cg = ctx.create(SolverParam::new(InverterType::Cg, 1e-10, 500))?;
//! cg.solve(&mut x, &b)?;
//! ```

pub mod solver_context;
pub use solver_context::SolverContext;
