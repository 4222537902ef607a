//! Incremental eigCG: Ritz vectors harvested from the first solves deflate the later ones.

use faer::Mat;
use latsolve::{
    DenseOp, InverterType, MinResExt, OperatorRef, Solver, SolverContext, SolverParam, blas,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Diagonal operator with four isolated small eigenvalues below a bulk in `[1, 2]`.
fn spectrum_op(n: usize) -> OperatorRef {
    let diag: Vec<f64> = (0..n)
        .map(|i| {
            if i < 4 {
                0.001 * (i + 1) as f64
            } else {
                1.0 + (i - 4) as f64 / (n - 5) as f64
            }
        })
        .collect();
    Arc::new(DenseOp::new(Mat::from_fn(n, n, |i, j| if i == j { diag[i] } else { 0.0 })))
}

fn random_source(n: usize, rng: &mut StdRng) -> Vec<f64> {
    (0..n).map(|_| rng.r#gen::<f64>() - 0.5).collect()
}

#[test]
fn deflated_solves_need_fewer_iterations() {
    let n = 200;
    let op = spectrum_op(n);
    let ctx = SolverContext::single(op.clone());
    let mut p = SolverParam::new(InverterType::IncEigCg, 1e-10, 1000);
    p.nev = 4;
    p.m = 16;
    p.deflation_grid = 2;
    let mut solver = ctx.create_deflated(p).unwrap();
    let mut rng = StdRng::seed_from_u64(21);

    let sources: Vec<Vec<f64>> = (0..3).map(|_| random_source(n, &mut rng)).collect();

    let mut iterations = Vec::new();
    for b in &sources {
        let mut x = vec![0.0; n];
        let stats = solver.solve(&mut x, b).unwrap();
        assert!(stats.converged);
        assert!(solver.param().true_res < 1e-9);
        iterations.push(stats.iterations);
    }
    assert_eq!(solver.param().rhs_idx, 2);
    assert!(solver.projection().curr_dim() > 0);
    assert!(solver.projection().curr_dim() <= 8);
    assert!(
        iterations[2] < iterations[0],
        "first {} deflated {}",
        iterations[0],
        iterations[2]
    );

    // the same source from scratch with plain CG
    let mut cold = ctx.create(SolverParam::new(InverterType::Cg, 1e-10, 1000)).unwrap();
    let mut x = vec![0.0; n];
    let cold_stats = cold.solve(&mut x, &sources[2]).unwrap();
    assert!(
        iterations[2] < cold_stats.iterations,
        "cold {} deflated {}",
        cold_stats.iterations,
        iterations[2]
    );
}

/// One harvest is enough: a rescaled copy of the first source, solved second, beats a cold CG
/// solve of the same system.
#[test]
fn second_solve_of_a_dependent_source_is_deflated() {
    let n = 200;
    let ctx = SolverContext::single(spectrum_op(n));
    let mut p = SolverParam::new(InverterType::IncEigCg, 1e-10, 1000);
    p.nev = 4;
    p.m = 16;
    p.deflation_grid = 2;
    let mut solver = ctx.create_deflated(p).unwrap();
    let mut rng = StdRng::seed_from_u64(3);
    let b1 = random_source(n, &mut rng);
    let b2: Vec<f64> = b1.iter().map(|v| 2.5 * v).collect();

    let mut x = vec![0.0; n];
    assert!(solver.solve(&mut x, &b1).unwrap().converged);
    assert_eq!(solver.param().rhs_idx, 1);
    assert_eq!(solver.projection().curr_dim(), 4);

    let mut x = vec![0.0; n];
    let deflated = solver.solve(&mut x, &b2).unwrap();
    assert!(deflated.converged);
    assert!(solver.param().true_res < 1e-9);

    let mut cold = ctx.create(SolverParam::new(InverterType::Cg, 1e-10, 1000)).unwrap();
    let mut x = vec![0.0; n];
    let cold_stats = cold.solve(&mut x, &b2).unwrap();
    assert!(
        deflated.iterations < cold_stats.iterations,
        "cold {} deflated {}",
        cold_stats.iterations,
        deflated.iterations
    );
}

#[test]
fn projection_matrix_survives_a_round_trip() {
    let n = 60;
    let ctx = SolverContext::single(spectrum_op(n));
    let mut p = SolverParam::new(InverterType::IncEigCg, 1e-10, 500);
    p.nev = 2;
    p.m = 8;
    p.deflation_grid = 2;
    let mut first = ctx.create_deflated(p.clone()).unwrap();
    let b: Vec<f64> = (0..n).map(|i| 1.0 / (1.0 + i as f64)).collect();
    let mut x = vec![0.0; n];
    first.solve(&mut x, &b).unwrap();
    let k = first.projection().curr_dim();
    assert!(k > 0);

    let bytes = first.save_projection_matrix(first.projection().bytes()).unwrap();
    let mut second = ctx.create_deflated(p.clone()).unwrap();
    second.load_projection_matrix(&bytes).unwrap();
    assert_eq!(second.projection().curr_dim(), 0);
    for i in 0..k {
        for j in 0..k {
            assert_eq!(second.projection().get(i, j), first.projection().get(i, j));
        }
    }

    let mut restored = ctx.create_deflated(p).unwrap();
    restored
        .restore_deflation_space(&bytes, first.deflation_space().to_vec())
        .unwrap();
    assert_eq!(restored.projection().curr_dim(), k);
    let mut guess_first = vec![0.0; n];
    let mut guess_restored = vec![0.0; n];
    first.deflate_spinor(&mut guess_first, &b).unwrap();
    restored.deflate_spinor(&mut guess_restored, &b).unwrap();
    assert_eq!(guess_first, guess_restored);
    assert!(blas::norm2(&guess_restored) > 0.0);

    let too_many = vec![vec![0.0; n]; restored.projection().tot_dim() + 1];
    assert!(restored.restore_deflation_space(&bytes, too_many).is_err());
    assert!(restored.restore_deflation_space(&bytes, vec![vec![0.0; n - 1]]).is_err());
}

/// Extrapolating from solutions of nearby systems gives a better guess than zero.
#[test]
fn minres_extrapolation_improves_the_guess() {
    let n = 50;
    let op = spectrum_op(n);
    let ctx = SolverContext::single(op.clone());
    let mut rng = StdRng::seed_from_u64(5);
    let b = random_source(n, &mut rng);

    // earlier solutions for slightly perturbed sources
    let mut p = Vec::new();
    let mut q = Vec::new();
    for _ in 0..3 {
        let mut bi = b.clone();
        for v in bi.iter_mut() {
            *v += 0.01 * (rng.r#gen::<f64>() - 0.5);
        }
        let mut xi = vec![0.0; n];
        let mut cg = ctx.create(SolverParam::new(InverterType::Cg, 1e-12, 1000)).unwrap();
        cg.solve(&mut xi, &bi).unwrap();
        let mut ai = vec![0.0; n];
        op.apply(&mut ai, &xi);
        p.push(xi);
        q.push(ai);
    }

    let mut x = vec![0.0; n];
    let res = MinResExt::new(ctx).solve(&mut x, &b, &mut p, &mut q).unwrap();
    assert!(res < 0.05 * blas::norm2(&b).sqrt());
}
