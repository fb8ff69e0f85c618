use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};

use parmesh::algs::meshgen::cube_mesh;
use parmesh::algs::split::split_with;
use parmesh::partitioning::balance::plan_moves;
use parmesh::partitioning::{GraphGrowing, Partitioner, Rcb};

fn bench_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition");

    for &n in &[6usize, 10, 14] {
        let mesh = cube_mesh(n, n, n);
        let tets = mesh.n_tetra();
        group.bench_with_input(BenchmarkId::new("graph_growing", tets), &mesh, |b, m| {
            let p = GraphGrowing::new(42);
            b.iter(|| p.partition(m, 8).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("rcb", tets), &mesh, |b, m| {
            b.iter(|| Rcb.partition(m, 8).unwrap());
        });
        group.bench_with_input(BenchmarkId::new("split", tets), &mesh, |b, m| {
            b.iter(|| split_with(m, 8, &Rcb).unwrap());
        });
    }
    group.finish();
}

fn bench_plan(c: &mut Criterion) {
    // 64 ranks, everything on the first 8
    let weights: Vec<Vec<u64>> = (0..64)
        .map(|r| if r < 8 { (1..=32).collect() } else { Vec::new() })
        .collect();
    c.bench_function("plan_moves 64 ranks", |b| {
        b.iter(|| plan_moves(&weights, 0.1));
    });
}

criterion_group!(benches, bench_partition, bench_plan);
criterion_main!(benches);
