mod util;
use util::*;

use parmesh::algs::meshgen::cube_mesh;
use parmesh::prelude::*;

#[test]
fn one_failing_kernel_fails_every_rank() {
    let out = run_local_world(4, |c| {
        let input = on_root(c.rank(), || cube_mesh(4, 4, 4));
        let kernel = FailOnRank(2);
        let mut d = Driver::new(c, ParMeshConfig::default(), &kernel);
        let outcome = d.run(input);
        let last = d.report().phases.last().map(|r| r.phase);
        (outcome, last, d.parmesh().n_groups(), d.mesh().is_none())
    });
    for (outcome, last, groups, no_mesh) in out {
        assert_eq!(outcome, Outcome::StrongFailure);
        assert_eq!(last, Some(Phase::RemeshLocal));
        assert_eq!(groups, 0, "groups must be released on failure");
        assert!(no_mesh);
    }
}

#[test]
fn fixed_interface_motion_is_a_strong_failure() {
    let out = run_local_world(2, |c| {
        let input = on_root(c.rank(), || cube_mesh(3, 2, 2));
        let kernel = Jitter;
        let mut d = Driver::new(c, ParMeshConfig::default(), &kernel);
        d.run(input)
    });
    assert_eq!(out, vec![Outcome::StrongFailure; 2]);
}

#[test]
fn invalid_options_are_a_low_failure_everywhere() {
    let out = run_local_world(3, |c| {
        let input = on_root(c.rank(), || cube_mesh(2, 2, 2));
        let mut cfg = ParMeshConfig::default();
        cfg.remesh.lagrangian = Some(1);
        let kernel = IdentityKernel;
        let mut d = Driver::new(c, cfg, &kernel);
        (d.run(input), d.report().phases.len())
    });
    assert_eq!(out, vec![(Outcome::LowFailure, 1); 3]);
}

#[test]
fn memory_ceiling_is_enforced() {
    let out = run_local_world(2, |c| {
        let input = on_root(c.rank(), || cube_mesh(4, 4, 4));
        let cfg = ParMeshConfig { mem_glo_max: Some(1024), ..Default::default() };
        let kernel = IdentityKernel;
        let mut d = Driver::new(c, cfg, &kernel);
        d.run(input)
    });
    assert_eq!(out, vec![Outcome::StrongFailure; 2]);
}

#[test]
fn a_low_failure_on_one_rank_downgrades_every_rank() {
    let out = run_local_world(3, |c| {
        let input = on_root(c.rank(), || cube_mesh(3, 3, 3));
        let kernel = LowOnRank(1);
        let mut d = Driver::new(c, ParMeshConfig::default(), &kernel);
        let outcome = d.run(input);
        (outcome, d.report().n_tetra_final, d.report().outcome)
    });
    assert_eq!(out[0], (Outcome::LowFailure, Some(162), Outcome::LowFailure));
    for rank in &out[1..] {
        assert_eq!(*rank, (Outcome::LowFailure, None, Outcome::LowFailure));
    }
}

#[test]
fn a_root_mesh_above_the_ceiling_fails_before_splitting() {
    let whole = cube_mesh(3, 3, 3).footprint();
    let out = run_local_world(4, |c| {
        let input = on_root(c.rank(), || cube_mesh(3, 3, 3));
        let cfg = ParMeshConfig { mem_glo_max: Some(whole * 3 / 4), ..Default::default() };
        let kernel = IdentityKernel;
        let mut d = Driver::new(c, cfg, &kernel);
        let outcome = d.run(input);
        let last = d.report().phases.last().map(|r| r.phase);
        (outcome, last, d.report().error.clone(), d.parmesh().memory().current())
    });
    for (outcome, last, _, used) in &out {
        assert_eq!(*outcome, Outcome::StrongFailure);
        assert_eq!(*last, Some(Phase::Distribute));
        assert_eq!(*used, 0);
    }
    let root_error = out[0].2.as_deref().unwrap_or_default();
    assert!(root_error.starts_with("distribute: exceeded max memory"), "{root_error}");
}
