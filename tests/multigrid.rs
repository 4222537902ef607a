//! Adaptive multigrid as the preconditioner of an outer GCR solve.

use latsolve::{
    Cg, FieldLayout, Gcr, InverterType, LaplaceOp, Lattice, LinearOperator, MemoryNullSpace, Mg,
    MgParam, MgState, NullSpace, OperatorRef, SolveType, Solver, SolverContext, SolverParam,
    StaggeredOp, StaggeredPcOp, TimeProfile, blas,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

fn laplace(dims: [usize; 4], mass: f64) -> OperatorRef {
    let lattice = Arc::new(Lattice::new(dims).unwrap());
    Arc::new(LaplaceOp::new(FieldLayout::new(lattice, 1, 1), mass))
}

fn random_source(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.r#gen::<f64>() - 0.5).collect()
}

fn relative_residual(op: &dyn LinearOperator, x: &[f64], b: &[f64]) -> f64 {
    let mut r = vec![0.0; b.len()];
    op.apply(&mut r, x);
    (blas::xmy_norm(b, &mut r) / blas::norm2(b)).sqrt()
}

fn outer_gcr(ctx: &SolverContext, mg: Mg) -> Box<dyn Solver> {
    let mut p = SolverParam::new(InverterType::Gcr, 1e-8, 300);
    p.inv_type_precondition = InverterType::Mg;
    p.nkrylov = 16;
    ctx.create_with_preconditioner(p, Box::new(mg)).unwrap()
}

/// A constant source is an eigenvector of the Laplacian and lies in the span of the coarse
/// space, so one cycle solves the system.
#[test]
fn constant_mode_is_solved_by_the_coarse_grid() {
    let op = laplace([8, 4, 4, 4], 1.0);
    let ctx = SolverContext::single(op.clone());
    let param = MgParam::new(2)
        .with_n_vec(0, 1)
        .with_null_space(0, NullSpace::Free);
    let mg = Mg::new(param, ctx.clone()).unwrap();
    let mut gcr = outer_gcr(&ctx, mg);
    gcr.param_mut().tol = 1e-10;

    let b = vec![1.0; op.len()];
    let mut x = vec![0.0; op.len()];
    let stats = gcr.solve(&mut x, &b).unwrap();
    assert!(stats.converged);
    assert!(stats.iterations <= 2, "{} cycles", stats.iterations);
    // m² = 1: the solution is the source
    for v in &x {
        assert!((v - 1.0).abs() < 1e-8);
    }
}

/// Two-level multigrid with the free-field null space beats plain CG on a light Laplacian.
#[test]
fn two_level_laplace_beats_cg() {
    let op = laplace([16, 8, 8, 8], 0.05);
    let ctx = SolverContext::single(op.clone());
    let b = random_source(op.len(), 7);

    let mut cg = Cg::new(SolverParam::new(InverterType::Cg, 1e-8, 2000), ctx.clone());
    let mut x_cg = vec![0.0; op.len()];
    let cg_stats = cg.solve(&mut x_cg, &b).unwrap();
    assert!(cg_stats.converged);

    let param = MgParam::new(2)
        .with_n_vec(0, 1)
        .with_null_space(0, NullSpace::Free);
    let mg = Mg::new(param, ctx.clone()).unwrap();
    assert_eq!(mg.state(), MgState::Ready);
    let mut gcr = outer_gcr(&ctx, mg);
    let mut x = vec![0.0; op.len()];
    let stats = gcr.solve(&mut x, &b).unwrap();
    assert!(stats.converged);
    assert!(relative_residual(op.as_ref(), &x, &b) < 1e-7);
    assert!(
        stats.iterations < cg_stats.iterations,
        "mg {} cg {}",
        stats.iterations,
        cg_stats.iterations
    );
}

/// Three levels: the middle level inherits the restricted null vectors and generates the
/// missing ones itself.
#[test]
fn three_level_hierarchy() {
    let op = laplace([8, 8, 8, 8], 0.1);
    let ctx = SolverContext::single(op.clone());
    let param = MgParam::new(3)
        .with_n_vec(0, 1)
        .with_null_space(0, NullSpace::Free)
        .with_n_vec(1, 2);
    let mg = Mg::new(param, ctx.clone()).unwrap();

    let middle = mg.coarse().unwrap();
    assert_eq!(middle.level(), 1);
    assert_eq!(middle.null_vectors().len(), 2);
    assert_eq!(middle.transfer().unwrap().coarse_layout().lattice.dims(), [2, 2, 2, 2]);
    let bottom = middle.coarse().unwrap();
    assert!(bottom.is_coarsest());
    mg.verify().unwrap();

    let b = random_source(op.len(), 8);
    let mut gcr = outer_gcr(&ctx, mg);
    let mut x = vec![0.0; op.len()];
    assert!(gcr.solve(&mut x, &b).unwrap().converged);
    assert!(relative_residual(op.as_ref(), &x, &b) < 1e-7);
}

/// Even-odd smoothing of the staggered operator, with the outer solve on the reduced system
/// and the bottom solve on the reduced coarse system.
#[test]
fn staggered_parity_preconditioned_hierarchy() {
    let lattice = Arc::new(Lattice::new([8, 8, 4, 4]).unwrap());
    let full = Arc::new(StaggeredOp::new(FieldLayout::new(lattice, 1, 1), 0.05).unwrap());
    let pc: OperatorRef = Arc::new(StaggeredPcOp::new(full.clone()));
    let ctx = SolverContext::new(full, pc.clone(), pc.clone(), TimeProfile::new("staggered"));

    let mut param = MgParam::new(2)
        .with_n_vec(0, 2)
        .with_block(0, [2, 2, 2, 2], 1)
        .with_null_space(0, NullSpace::Free);
    param.smoother_solve_type[0] = SolveType::DirectPc;
    param.smoother_solve_type[1] = SolveType::DirectPc;
    param.coarse_grid_solution_type[1] = latsolve::SolutionType::MatPc;
    let mg = Mg::new(param, ctx.clone()).unwrap();

    let outer_ctx = SolverContext::single(pc.clone());
    let b = random_source(pc.len(), 9);
    let mut gcr = outer_gcr(&outer_ctx, mg);
    let mut x = vec![0.0; pc.len()];
    let stats = gcr.solve(&mut x, &b).unwrap();
    assert!(stats.converged);
    assert!(relative_residual(pc.as_ref(), &x, &b) < 1e-7);
}

/// Null vectors saved from one hierarchy rebuild an equivalent one.
#[test]
fn loaded_null_space_reproduces_the_setup() {
    let op = laplace([8, 4, 4, 4], 0.2);
    let ctx = SolverContext::single(op.clone());
    let computed = Mg::new(MgParam::new(2).with_n_vec(0, 2), ctx.clone()).unwrap();
    let source = MemoryNullSpace::new().with_level(0, computed.null_vectors().to_vec());

    let param = MgParam::new(2)
        .with_n_vec(0, 2)
        .with_null_space(0, NullSpace::Load);
    let loaded = Mg::with_source(param, ctx, Arc::new(source)).unwrap();
    assert_eq!(loaded.null_vectors(), computed.null_vectors());
}

/// A refresh relaxes the existing vectors further and leaves a usable hierarchy.
#[test]
fn refreshed_hierarchy_still_converges() {
    let op = laplace([8, 4, 4, 4], 0.1);
    let ctx = SolverContext::single(op.clone());
    let mut mg = Mg::new(MgParam::new(2).with_n_vec(0, 2), ctx.clone()).unwrap();
    mg.reset(true).unwrap();
    assert_eq!(mg.state(), MgState::Ready);

    let b = random_source(op.len(), 10);
    let mut gcr = Gcr::new(SolverParam::new(InverterType::Gcr, 1e-8, 300), ctx, None);
    let mut x = vec![0.0; op.len()];
    assert!(gcr.solve_with(&mut x, &b, Some(&mut mg as &mut dyn Solver)).unwrap().converged);
    assert!(relative_residual(op.as_ref(), &x, &b) < 1e-7);
    assert!(mg.flops() > 0);
}

#[test]
fn invalid_hierarchies_are_rejected() {
    let ctx = SolverContext::single(laplace([4, 4, 4, 4], 0.3));
    assert!(Mg::new(MgParam::new(0), ctx.clone()).is_err());
    assert!(Mg::new(MgParam::new(2).with_block(0, [3, 2, 2, 2], 1), ctx.clone()).is_err());
    let mut param = MgParam::new(2);
    param.cycle_type[0] = latsolve::CycleType::WCycle;
    assert!(Mg::new(param, ctx).is_err());
}
