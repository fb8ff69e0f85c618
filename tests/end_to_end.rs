mod util;
use util::*;

use parmesh::algs::meshgen::cube_mesh;
use parmesh::algs::split::split_with;
use parmesh::prelude::*;

#[test]
fn identity_run_on_four_ranks() {
    let out = run_local_world(4, |c| {
        let input = on_root(c.rank(), || cube_mesh(5, 5, 7));
        let kernel = IdentityKernel;
        let mut d = Driver::new(c, ParMeshConfig::default(), &kernel);
        let outcome = d.run(input);
        let report = d.report().clone();
        (outcome, report, d.into_mesh())
    });
    for (outcome, report, _) in &out {
        assert_eq!(*outcome, Outcome::Success);
        assert_eq!(report.comm_check_failures, 0);
        assert!(report.error.is_none());
    }
    let (_, report, mesh) = &out[0];
    let mesh = mesh.as_ref().expect("rank 0 holds the merged mesh");
    assert_eq!(mesh.n_tetra(), 1050);
    assert!(report.n_tetra_final.unwrap() >= 1000);
    assert!((mesh.volume() - 1.0).abs() < 1e-9);
    assert_eq!(mesh.interface_points().count(), 0);
    assert_unique_gids(mesh);
    assert!(out[1..].iter().all(|(_, _, m)| m.is_none()));
}

#[test]
fn refinement_run_on_three_ranks() {
    let out = run_local_world(3, |c| {
        let input = on_root(c.rank(), || {
            let g = cube_mesh(3, 3, 3);
            let np = g.n_points();
            g.with_metric(Metric::constant(np, 0.2))
        });
        let kernel = CentroidSplitKernel;
        let cfg = ParMeshConfig { niter: 4, ..Default::default() };
        let mut d = Driver::new(c, cfg, &kernel);
        let outcome = d.run(input);
        (outcome, d.into_mesh())
    });
    assert!(out.iter().all(|(o, _)| *o == Outcome::Success));
    let mesh = out[0].1.as_ref().unwrap();
    assert!(mesh.n_tetra() > 162);
    assert!((mesh.volume() - 1.0).abs() < 1e-9);
    assert_eq!(mesh.quality().n_inverted, 0);
    assert_unique_gids(mesh);
}

#[test]
fn metric_cost_weighting_runs() {
    let out = run_local_world(2, |c| {
        let input = on_root(c.rank(), || {
            let g = cube_mesh(4, 2, 2);
            let np = g.n_points();
            g.with_metric(Metric::constant(np, 0.3))
        });
        let kernel = CentroidSplitKernel;
        let cfg = ParMeshConfig {
            weight: WeightPolicy::MetricCost,
            partition: PartitionPolicy::Rcb,
            ..Default::default()
        };
        let mut d = Driver::new(c, cfg, &kernel);
        d.run(input)
    });
    assert_eq!(out, vec![Outcome::Success; 2]);
}

#[test]
fn relaxed_interface_is_resynchronized() {
    let out = run_local_world(3, |c| {
        let input = on_root(c.rank(), || cube_mesh(3, 3, 2));
        let cfg = ParMeshConfig {
            interface_motion: true,
            niter: 2,
            ..Default::default()
        };
        let kernel = Jitter;
        let mut d = Driver::new(c, cfg, &kernel);
        (d.run(input), d.report().comm_check_failures)
    });
    assert_eq!(out, vec![(Outcome::Success, 0); 3]);
}

#[test]
fn distributed_input_is_merged_back() {
    let mesh = cube_mesh(4, 3, 2);
    let total = mesh.n_tetra();
    let out = run_local_world(3, |c| {
        let mut pieces = split_with(&mesh, 3, &Rcb).unwrap();
        let mut mine = pieces.swap_remove(c.rank());
        mine.clear_interface();
        let cfg = ParMeshConfig { mode: InputMode::Distributed, ..Default::default() };
        let kernel = IdentityKernel;
        let mut d = Driver::new(c, cfg, &kernel);
        (d.run(vec![mine]), d.into_mesh().map(|m| m.n_tetra()))
    });
    assert!(out.iter().all(|(o, _)| *o == Outcome::Success));
    assert_eq!(out[0].1, Some(total));
}

#[test]
fn distributed_input_needs_global_ids() {
    let out = run_local_world(2, |c| {
        let rank = c.rank();
        let mut g = cube_mesh(1, 1, 1);
        g.points_mut()[0].gid = 0;
        let cfg = ParMeshConfig { mode: InputMode::Distributed, ..Default::default() };
        let kernel = IdentityKernel;
        let mut d = Driver::new(c, cfg, &kernel);
        d.run(if rank == 0 { vec![g] } else { Vec::new() })
    });
    assert_eq!(out, vec![Outcome::LowFailure; 2]);
}
