//! Communicator consistency checks.
//!
//! Local checks: every index is in bounds, no index repeats inside one
//! communicator, and the items reported by the communicators are exactly the
//! items flagged interface. The collective check then compares each external
//! communicator with its counterpart on the peer: same length, same global
//! ids and coincident coordinates position by position.

use super::{Communicators, ExternalComm, InternalComm};
use crate::algs::collective::{agree, all_to_all};
use crate::algs::transport::{CommTag, Transport};
use crate::algs::wire::{KIND_NODES, WireFaceKey, WireNode, WireReader, WireWriter};
use crate::mesh_error::{CommKind, ParMeshError};
use crate::topology::entity::{face_index, split_face_index};
use crate::topology::group::Group;

fn fail(kind: CommKind, reason: String) -> ParMeshError {
    ParMeshError::comm_check(kind, reason)
}

fn check_internal(
    kind: CommKind,
    int: &InternalComm,
    n_groups: usize,
    bound: impl Fn(usize) -> usize,
    flagged: impl Fn(usize) -> Vec<usize>,
) -> Result<(), ParMeshError> {
    if int.n_groups() != n_groups {
        return Err(fail(
            kind,
            format!("built for {} groups, {} present", int.n_groups(), n_groups),
        ));
    }
    let mut referenced = vec![false; int.nitem()];
    for g in 0..n_groups {
        let slots = int.slots(g);
        let limit = bound(g);
        for s in slots {
            if s.local >= limit {
                return Err(fail(
                    kind,
                    format!("group {g}: local index {} out of bounds ({limit})", s.local),
                ));
            }
            if s.position >= int.nitem() {
                return Err(fail(
                    kind,
                    format!("group {g}: position {} out of bounds ({})", s.position, int.nitem()),
                ));
            }
            referenced[s.position] = true;
        }
        if slots.windows(2).any(|w| w[0].local == w[1].local) {
            return Err(fail(kind, format!("group {g}: local index listed twice")));
        }
        let mut positions: Vec<usize> = slots.iter().map(|s| s.position).collect();
        positions.sort_unstable();
        if positions.windows(2).any(|w| w[0] == w[1]) {
            return Err(fail(kind, format!("group {g}: position listed twice")));
        }
        let listed: Vec<usize> = slots.iter().map(|s| s.local).collect();
        let expected = flagged(g);
        if listed != expected {
            return Err(fail(
                kind,
                format!(
                    "group {g}: {} items in the communicator, {} flagged interface",
                    listed.len(),
                    expected.len()
                ),
            ));
        }
    }
    if let Some(p) = referenced.iter().position(|r| !r) {
        return Err(fail(kind, format!("position {p} is used by no group")));
    }
    Ok(())
}

fn check_external(kind: CommKind, ext: &[ExternalComm], nitem: usize) -> Result<(), ParMeshError> {
    for (i, c) in ext.iter().enumerate() {
        if i > 0 && ext[i - 1].peer >= c.peer {
            return Err(fail(kind, format!("peer {} listed out of order", c.peer)));
        }
        if let Some(&p) = c.positions.iter().find(|&&p| p >= nitem) {
            return Err(fail(
                kind,
                format!("rank {}: position {p} out of bounds ({nitem})", c.peer),
            ));
        }
        let mut sorted = c.positions.clone();
        sorted.sort_unstable();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(fail(kind, format!("rank {}: position listed twice", c.peer)));
        }
    }
    Ok(())
}

/// An interface item held by a single local slot must be shared with some
/// other rank; otherwise nothing is on the other side of it.
fn check_orphans(
    kind: CommKind,
    int: &InternalComm,
    ext: &[ExternalComm],
    n_groups: usize,
) -> Result<(), ParMeshError> {
    let mut copies = vec![0usize; int.nitem()];
    for g in 0..n_groups {
        for s in int.slots(g) {
            copies[s.position] += 1;
        }
    }
    let mut remote = vec![false; int.nitem()];
    for c in ext {
        for &p in &c.positions {
            remote[p] = true;
        }
    }
    match (0..int.nitem()).find(|&p| copies[p] < 2 && !remote[p]) {
        Some(p) => Err(fail(
            kind,
            format!("position {p} is flagged interface but shared with no other group or rank"),
        )),
        None => Ok(()),
    }
}

/// Checks that need no communication.
pub fn check_local(groups: &[Group], comms: &Communicators) -> Result<(), ParMeshError> {
    if comms.node_gids.len() != comms.int_node.nitem() {
        return Err(fail(CommKind::InternalNode, "global id table size mismatch".into()));
    }
    if comms.face_keys.len() != comms.int_face.nitem() {
        return Err(fail(CommKind::InternalFace, "face key table size mismatch".into()));
    }
    check_internal(
        CommKind::InternalNode,
        &comms.int_node,
        groups.len(),
        |g| groups[g].n_points(),
        |g| groups[g].interface_points().collect(),
    )?;
    check_internal(
        CommKind::InternalFace,
        &comms.int_face,
        groups.len(),
        |g| 4 * groups[g].n_tetra(),
        |g| {
            groups[g]
                .interface_faces()
                .map(|(k, i)| face_index(k, i))
                .filter(|f| comms.superseded_faces.binary_search(&(g, *f)).is_err())
                .collect()
        },
    )?;

    let mut coords: Vec<Option<[f64; 3]>> = vec![None; comms.int_node.nitem()];
    for (g, group) in groups.iter().enumerate() {
        for s in comms.int_node.slots(g) {
            let p = &group.points()[s.local];
            if p.gid != comms.node_gids[s.position] {
                return Err(fail(
                    CommKind::InternalNode,
                    format!(
                        "group {g}: point {} has gid {}, position {} expects {}",
                        s.local, p.gid, s.position, comms.node_gids[s.position]
                    ),
                ));
            }
            match coords[s.position] {
                None => coords[s.position] = Some(p.coords),
                Some(c) if c != p.coords => {
                    return Err(fail(
                        CommKind::InternalNode,
                        format!("copies of gid {} are not coincident", p.gid),
                    ));
                }
                Some(_) => {}
            }
        }
        for s in comms.int_face.slots(g) {
            let (k, i) = split_face_index(s.local);
            if group.face_gids(k, i) != comms.face_keys[s.position] {
                return Err(fail(
                    CommKind::InternalFace,
                    format!("group {g}: face {} does not match its position", s.local),
                ));
            }
        }
    }
    check_external(CommKind::ExternalNode, &comms.ext_node, comms.int_node.nitem())?;
    check_external(CommKind::ExternalFace, &comms.ext_face, comms.int_face.nitem())?;
    check_orphans(CommKind::InternalNode, &comms.int_node, &comms.ext_node, groups.len())?;
    check_orphans(CommKind::InternalFace, &comms.int_face, &comms.ext_face, groups.len())
}

/// Coordinates of every internal node position.
fn position_coords(groups: &[Group], comms: &Communicators) -> Vec<[f64; 3]> {
    let mut coords = vec![[0.0; 3]; comms.int_node.nitem()];
    for (g, group) in groups.iter().enumerate() {
        for s in comms.int_node.slots(g) {
            coords[s.position] = group.points()[s.local].coords;
        }
    }
    coords
}

/// Full check, local and across peers. Collective.
pub fn check_communicators<C: Transport>(
    comm: &C,
    groups: &[Group],
    comms: &Communicators,
    tolerance: f64,
) -> Result<(), ParMeshError> {
    agree(comm, check_local(groups, comms))?;
    let (me, n) = (comm.rank(), comm.size());
    let coords = position_coords(groups, comms);

    let nodes_for = |peer: usize| -> Vec<WireNode> {
        comms.ext_node_with(peer).map_or_else(Vec::new, |c| {
            c.positions
                .iter()
                .map(|&p| WireNode::new(comms.node_gids[p], coords[p]))
                .collect()
        })
    };
    let faces_for = |peer: usize| -> Vec<WireFaceKey> {
        comms.ext_face_with(peer).map_or_else(Vec::new, |c| {
            c.positions
                .iter()
                .map(|&p| WireFaceKey::of(comms.face_keys[p]))
                .collect()
        })
    };

    let outgoing: Vec<Vec<u8>> = (0..n)
        .map(|q| {
            if q == me {
                return Vec::new();
            }
            let mut w = WireWriter::new(KIND_NODES);
            w.section(&nodes_for(q)).section(&faces_for(q));
            w.finish()
        })
        .collect();
    let incoming = all_to_all(comm, CommTag::CHECK, outgoing)?;

    // errors past the exchange are local to this rank; agree before leaving
    let compare = || -> Result<(), ParMeshError> {
        let tol2 = tolerance * tolerance;
        for (q, bytes) in incoming.iter().enumerate() {
            if q == me {
                continue;
            }
            let mut r = WireReader::open(bytes, KIND_NODES)?;
            let theirs_nodes = r.section::<WireNode>()?;
            let theirs_faces = r.section::<WireFaceKey>()?;
            r.finish()?;

            let mine_nodes = nodes_for(q);
            if mine_nodes.len() != theirs_nodes.len() {
                return Err(fail(
                    CommKind::ExternalNode,
                    format!(
                        "rank {q}: {} shared points here, {} there",
                        mine_nodes.len(),
                        theirs_nodes.len()
                    ),
                ));
            }
            for (pos, (a, b)) in mine_nodes.iter().zip(&theirs_nodes).enumerate() {
                let (ca, cb) = (a.coords(), b.coords());
                let d2: f64 = (0..3).map(|d| (ca[d] - cb[d]).powi(2)).sum();
                if a.gid() != b.gid() || d2 > tol2 {
                    return Err(fail(
                        CommKind::ExternalNode,
                        format!(
                            "rank {q}, position {pos}: gid {} at {ca:?} here, gid {} at {cb:?} there",
                            a.gid(),
                            b.gid()
                        ),
                    ));
                }
            }
            let mine_faces = faces_for(q);
            if mine_faces != theirs_faces {
                return Err(fail(
                    CommKind::ExternalFace,
                    format!(
                        "rank {q}: {} shared faces here, {} there, or keys misaligned",
                        mine_faces.len(),
                        theirs_faces.len()
                    ),
                ));
            }
        }
        Ok(())
    };
    agree(comm, compare())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::cube_mesh;
    use crate::algs::split::split_with;
    use crate::algs::transport::NoComm;
    use crate::interface::build_communicators;
    use crate::partitioning::Rcb;
    use crate::topology::entity::{FaceFlags, PointFlags};

    #[test]
    fn freshly_built_communicators_pass() {
        let groups = split_with(&cube_mesh(3, 2, 2), 4, &Rcb).unwrap();
        let comms = build_communicators(&NoComm, &groups).unwrap();
        check_communicators(&NoComm, &groups, &comms, 1e-12).unwrap();
    }

    #[test]
    fn unflagged_point_is_detected() {
        let mut groups = split_with(&cube_mesh(2, 2, 2), 2, &Rcb).unwrap();
        let comms = build_communicators(&NoComm, &groups).unwrap();
        let i = groups[1].interface_points().next().unwrap();
        groups[1].points_mut()[i].flags.remove(PointFlags::INTERFACE);
        assert!(matches!(
            check_local(&groups, &comms),
            Err(ParMeshError::CommCheck {
                kind: CommKind::InternalNode,
                ..
            })
        ));
    }

    #[test]
    fn orphan_interface_point_is_rejected() {
        let mut groups = vec![cube_mesh(2, 2, 2)];
        let centre = groups[0]
            .points()
            .iter()
            .position(|p| p.coords == [0.5, 0.5, 0.5])
            .unwrap();
        groups[0].points_mut()[centre].flags.insert(PointFlags::INTERFACE);
        let comms = build_communicators(&NoComm, &groups).unwrap();
        assert!(matches!(
            check_communicators(&NoComm, &groups, &comms, 1e-12),
            Err(ParMeshError::CommCheck {
                kind: CommKind::InternalNode,
                ..
            })
        ));
    }

    #[test]
    fn orphan_interface_face_is_rejected() {
        let mut groups = vec![cube_mesh(1, 1, 1)];
        groups[0].tetras_mut()[0].faces[0].insert(FaceFlags::INTERFACE);
        for v in groups[0].tetras()[0].face_vertices(0) {
            groups[0].points_mut()[v].flags.insert(PointFlags::INTERFACE);
        }
        let res = build_communicators(&NoComm, &groups)
            .and_then(|comms| check_communicators(&NoComm, &groups, &comms, 1e-12));
        assert!(matches!(res, Err(ParMeshError::CommCheck { .. })));
    }

    #[test]
    fn out_of_bounds_external_position() {
        let groups = split_with(&cube_mesh(2, 2, 2), 2, &Rcb).unwrap();
        let mut comms = build_communicators(&NoComm, &groups).unwrap();
        comms.ext_node.push(ExternalComm {
            peer: 3,
            positions: vec![comms.int_node.nitem()],
        });
        assert!(matches!(
            check_local(&groups, &comms),
            Err(ParMeshError::CommCheck {
                kind: CommKind::ExternalNode,
                ..
            })
        ));
    }
}
