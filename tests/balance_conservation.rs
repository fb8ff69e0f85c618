use parmesh::algs::meshgen::cube_mesh;
use parmesh::algs::split::split_with;
use parmesh::partitioning::balance::rebalance;
use parmesh::prelude::*;

#[test]
fn rebalancing_conserves_tetra() {
    let total = cube_mesh(5, 4, 3).n_tetra();
    let out = run_local_world(4, |c| {
        let mut pm = ParMesh::new(c, MemoryBudget::unlimited());
        // ranks 0 and 1 start with everything, 2 and 3 with nothing
        let halves = split_with(&cube_mesh(5, 4, 3), 2, &Rcb).unwrap();
        if let Some(g) = halves.into_iter().nth(pm.rank()) {
            pm.push_group(g).unwrap();
        }
        let cfg = ParMeshConfig::default();
        let report = rebalance(&mut pm, &cfg).unwrap();
        (pm.n_tetra(), report)
    });
    assert_eq!(out.iter().map(|(n, _)| n).sum::<usize>(), total);
    let (_, report) = &out[0];
    assert!(!report.skipped);
    assert!(report.moves > 0);
    assert!(report.imbalance_after <= ParMeshConfig::default().balance.imbalance_threshold + 0.3);
    assert!(out.iter().all(|(n, _)| *n > 0));
}

#[test]
fn balanced_ranks_are_left_alone() {
    let out = run_local_world(2, |c| {
        let mut pm = ParMesh::new(c, MemoryBudget::unlimited());
        let halves = split_with(&cube_mesh(2, 2, 2), 2, &Rcb).unwrap();
        let mine = halves.into_iter().nth(pm.rank()).unwrap();
        let before = mine.clone();
        pm.push_group(mine).unwrap();
        let report = rebalance(&mut pm, &ParMeshConfig::default()).unwrap();
        (report.skipped, pm.groups()[0] == before)
    });
    assert_eq!(out, vec![(true, true); 2]);
}

#[test]
fn disabled_balance_skips() {
    let out = run_local_world(2, |c| {
        let mut pm = ParMesh::new(c, MemoryBudget::unlimited());
        if pm.rank() == 0 {
            pm.push_group(cube_mesh(2, 2, 2)).unwrap();
        }
        let mut cfg = ParMeshConfig::default();
        cfg.balance.enabled = false;
        rebalance(&mut pm, &cfg).unwrap().skipped
    });
    assert_eq!(out, vec![true, true]);
}
