use criterion::{black_box, Criterion, criterion_group, criterion_main};
use latsolve::{
    Cg, FieldLayout, InverterType, LaplaceOp, Lattice, Mg, MgParam, NullSpace, OperatorRef, Solver,
    SolverContext, SolverParam,
};
use std::sync::Arc;

fn bench_mg_vs_cg(c: &mut Criterion) {
    let lattice = Arc::new(Lattice::new([8, 8, 8, 8]).unwrap());
    let op: OperatorRef = Arc::new(LaplaceOp::new(FieldLayout::new(lattice, 1, 1), 0.05));
    let ctx = SolverContext::single(op.clone());
    let n = op.len();
    let b: Vec<f64> = (0..n).map(|i| (i as f64).sin()).collect();
    let mut x = vec![0.0; n];

    c.bench_function("latsolve CG", |ben| {
        let mut cg = Cg::new(SolverParam::new(InverterType::Cg, 1e-8, 2000), ctx.clone());
        ben.iter(|| {
            let _stats = cg.solve(black_box(&mut x), black_box(&b)).unwrap();
        })
    });

    c.bench_function("latsolve GCR + MG", |ben| {
        let param = MgParam::new(2)
            .with_n_vec(0, 1)
            .with_null_space(0, NullSpace::Free)
            .with_verify(false);
        let mg = Mg::new(param, ctx.clone()).unwrap();
        let mut gp = SolverParam::new(InverterType::Gcr, 1e-8, 500);
        gp.inv_type_precondition = InverterType::Mg;
        let mut gcr = ctx.create_with_preconditioner(gp, Box::new(mg)).unwrap();
        ben.iter(|| {
            let _stats = gcr.solve(black_box(&mut x), black_box(&b)).unwrap();
        })
    });

    c.bench_function("latsolve MG setup", |ben| {
        ben.iter(|| {
            let param = MgParam::new(2).with_n_vec(0, 2).with_verify(false);
            Mg::new(black_box(param), ctx.clone()).unwrap()
        })
    });
}

criterion_group!(benches, bench_mg_vs_cg);
criterion_main!(benches);
