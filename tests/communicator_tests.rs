use parmesh::algs::distribute::distribute_centralized;
use parmesh::algs::meshgen::cube_mesh;
use parmesh::interface::{build_communicators, check_communicators};
use parmesh::prelude::*;

fn distributed(c: &LocalComm) -> Group {
    let mesh = (c.rank() == 0).then(|| cube_mesh(4, 3, 3));
    distribute_centralized(c, &mut MemoryBudget::unlimited(), mesh, &GraphGrowing::new(1)).unwrap()
}

#[test]
fn external_communicators_are_symmetric() {
    let out = run_local_world(4, |c| {
        let groups = vec![distributed(&c)];
        let comms = build_communicators(&c, &groups).unwrap();
        check_communicators(&c, &groups, &comms, 1e-12).unwrap();
        let faces: Vec<(usize, Vec<[GlobalId; 3]>)> = comms
            .ext_face
            .iter()
            .map(|e| (e.peer, e.positions.iter().map(|&p| comms.face_keys[p]).collect()))
            .collect();
        let nodes: Vec<(usize, Vec<GlobalId>)> = comms
            .ext_node
            .iter()
            .map(|e| (e.peer, e.positions.iter().map(|&p| comms.node_gids[p]).collect()))
            .collect();
        (c.rank(), faces, nodes)
    });
    for (me, faces, nodes) in &out {
        for (peer, keys) in faces {
            let theirs = &out[*peer].1;
            let back = theirs.iter().find(|(q, _)| q == me).unwrap();
            assert_eq!(&back.1, keys, "face lists of {me} and {peer} differ");
        }
        for (peer, gids) in nodes {
            let back = out[*peer].2.iter().find(|(q, _)| q == me).unwrap();
            assert_eq!(&back.1, gids, "node lists of {me} and {peer} differ");
        }
    }
    assert!(out.iter().any(|(_, faces, _)| !faces.is_empty()));
}

#[test]
fn rebuild_is_idempotent() {
    let out = run_local_world(3, |c| {
        let mut pm = ParMesh::new(c, MemoryBudget::unlimited());
        let g = distributed(pm.comm());
        pm.push_group(g).unwrap();
        pm.rebuild_communicators(1e-12).unwrap();
        let first = pm.communicators("test").unwrap().clone();
        pm.rebuild_communicators(1e-12).unwrap();
        let second = pm.communicators("test").unwrap().clone();
        first == second
    });
    assert!(out.into_iter().all(|same| same));
}

#[test]
fn stale_communicators_are_refused() {
    let mut pm = ParMesh::new(NoComm, MemoryBudget::unlimited());
    pm.push_group(cube_mesh(1, 1, 1)).unwrap();
    pm.rebuild_communicators(1e-12).unwrap();
    assert!(pm.communicators("test").is_ok());
    pm.groups_mut()[0].points_mut()[0].coords[0] += 1.0;
    assert!(matches!(
        pm.communicators("test"),
        Err(ParMeshError::StaleCommunicators("test"))
    ));
}

#[test]
fn moved_copy_fails_the_check_everywhere() {
    let out = run_local_world(2, |c| {
        let mut groups = vec![distributed(&c)];
        let comms = build_communicators(&c, &groups).unwrap();
        if c.rank() == 1 {
            let i = groups[0].interface_points().next().unwrap();
            groups[0].points_mut()[i].coords[1] += 0.25;
        }
        check_communicators(&c, &groups, &comms, 1e-9)
            .err()
            .map(|e| e.outcome())
    });
    assert_eq!(out, vec![Some(Outcome::StrongFailure); 2]);
}
