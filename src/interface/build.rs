//! Communicator construction.
//!
//! 1. Interface points of all local groups are numbered by global id; the
//!    internal node communicator maps each group's points to that numbering.
//! 2. Interface faces are keyed by their sorted vertex global ids. Two local
//!    faces with the same key are an internal pair sharing one position; a
//!    face seen once lies on the process boundary. Among coincident
//!    candidates the smallest `(key, group, face)` wins and the others are
//!    recorded as superseded.
//! 3. Unpaired face keys and interface point ids are gathered from every
//!    rank. The sorted intersection with each peer is the external
//!    communicator, so both sides produce the same order without further
//!    negotiation.

use super::{Communicators, ExternalComm, InternalComm, Slot};
use crate::algs::collective::{agree, all_gather};
use crate::algs::transport::{CommTag, Transport};
use crate::algs::wire::{KIND_FACE_KEYS, WireFaceKey, WireId, WireReader, WireWriter};
use crate::mesh_error::{CommKind, ParMeshError};
use crate::topology::entity::{GlobalId, UNASSIGNED_GID, face_index};
use crate::topology::group::Group;
use itertools::Itertools;
use log::{debug, warn};
use std::cmp::Ordering;

/// Local half of the build: internal numbering plus the boundary faces.
struct LocalIndex {
    int_node: InternalComm,
    int_face: InternalComm,
    node_gids: Vec<GlobalId>,
    face_keys: Vec<[GlobalId; 3]>,
    /// Positions of faces without a local twin, sorted by key.
    unpaired: Vec<usize>,
    superseded: Vec<(usize, usize)>,
}

fn index_nodes(groups: &[Group]) -> Result<(InternalComm, Vec<GlobalId>), ParMeshError> {
    let mut entries: Vec<(GlobalId, usize, usize)> = Vec::new();
    for (g, group) in groups.iter().enumerate() {
        for i in group.interface_points() {
            let gid = group.points()[i].gid;
            if gid == UNASSIGNED_GID {
                return Err(ParMeshError::comm_check(
                    CommKind::InternalNode,
                    format!("interface point {i} of group {g} has no global id"),
                ));
            }
            entries.push((gid, g, i));
        }
    }
    entries.sort_unstable();

    let mut gids: Vec<GlobalId> = Vec::new();
    let mut slots = vec![Vec::new(); groups.len()];
    for (gid, chunk) in &entries.iter().chunk_by(|e| e.0) {
        let position = gids.len();
        gids.push(gid);
        let mut last_group = None;
        for &(_, g, i) in chunk {
            if last_group == Some(g) {
                return Err(ParMeshError::comm_check(
                    CommKind::InternalNode,
                    format!("global id {gid} appears twice in group {g}"),
                ));
            }
            last_group = Some(g);
            slots[g].push(Slot { local: i, position });
        }
    }
    slots.iter_mut().for_each(|s| s.sort_unstable());
    Ok((InternalComm::new(gids.len(), slots), gids))
}

/// Face index of the local groups: the internal face communicator, its keys,
/// the positions without a local twin and the superseded duplicates.
struct FaceIndex {
    int_face: InternalComm,
    keys: Vec<[GlobalId; 3]>,
    unpaired: Vec<usize>,
    superseded: Vec<(usize, usize)>,
}

fn index_faces(groups: &[Group]) -> Result<FaceIndex, ParMeshError> {
    let mut entries: Vec<([GlobalId; 3], usize, usize)> = Vec::new();
    for (g, group) in groups.iter().enumerate() {
        for (k, i) in group.interface_faces() {
            let key = group.face_gids(k, i);
            if key.contains(&UNASSIGNED_GID) {
                return Err(ParMeshError::comm_check(
                    CommKind::InternalFace,
                    format!("interface face {i} of tetra {k} in group {g} has an unnumbered vertex"),
                ));
            }
            entries.push((key, g, face_index(k, i)));
        }
    }
    entries.sort_unstable();

    let mut keys = Vec::new();
    let mut unpaired = Vec::new();
    let mut superseded = Vec::new();
    let mut slots = vec![Vec::new(); groups.len()];
    for (key, chunk) in &entries.iter().chunk_by(|e| e.0) {
        let chunk: Vec<_> = chunk.collect();
        let position = keys.len();
        keys.push(key);
        // coincident candidates: the smallest (group, face) wins, paired with
        // the smallest candidate from another group
        let &(_, g0, f0) = chunk[0];
        slots[g0].push(Slot { local: f0, position });
        let twin = chunk[1..].iter().position(|e| e.1 != g0).map(|j| j + 1);
        match twin {
            Some(j) => {
                let &(_, g1, f1) = chunk[j];
                slots[g1].push(Slot { local: f1, position });
            }
            None => unpaired.push(position),
        }
        for (j, &&(_, g, f)) in chunk.iter().enumerate().skip(1) {
            if Some(j) != twin {
                warn!("face {key:?}: candidate {f} of group {g} superseded by face {f0} of group {g0}");
                superseded.push((g, f));
            }
        }
    }
    slots.iter_mut().for_each(|s| s.sort_unstable());
    superseded.sort_unstable();
    Ok(FaceIndex {
        int_face: InternalComm::new(keys.len(), slots),
        keys,
        unpaired,
        superseded,
    })
}

fn index_local(groups: &[Group]) -> Result<LocalIndex, ParMeshError> {
    let (int_node, node_gids) = index_nodes(groups)?;
    let faces = index_faces(groups)?;
    Ok(LocalIndex {
        int_node,
        int_face: faces.int_face,
        node_gids,
        face_keys: faces.keys,
        unpaired: faces.unpaired,
        superseded: faces.superseded,
    })
}

/// Positions (from `mine`, sorted by key) whose key also appears in `theirs`
/// (sorted). Output is in key order.
fn intersect_sorted<K: Ord + Copy>(
    mine: impl Iterator<Item = (K, usize)>,
    theirs: &[K],
) -> Vec<usize> {
    let mut out = Vec::new();
    let mut j = 0;
    for (key, position) in mine {
        while j < theirs.len() && theirs[j] < key {
            j += 1;
        }
        if j == theirs.len() {
            break;
        }
        if theirs[j].cmp(&key) == Ordering::Equal {
            out.push(position);
        }
    }
    out
}

fn decode_peer(
    peer: usize,
    bytes: &[u8],
) -> Result<(Vec<[GlobalId; 3]>, Vec<GlobalId>), ParMeshError> {
    let wrap = |e: ParMeshError| ParMeshError::CommError {
        neighbor: peer,
        reason: e.to_string(),
    };
    let mut r = WireReader::open(bytes, KIND_FACE_KEYS).map_err(wrap)?;
    let faces: Vec<_> = r
        .section::<WireFaceKey>()
        .map_err(wrap)?
        .iter()
        .map(WireFaceKey::get)
        .collect();
    let nodes: Vec<_> = r
        .section::<WireId>()
        .map_err(wrap)?
        .into_iter()
        .map(WireId::get)
        .collect();
    r.finish().map_err(wrap)?;
    Ok((faces, nodes))
}

/// Build all communicators of this process. Collective: every rank must call
/// it at the same point.
pub fn build_communicators<C: Transport>(
    comm: &C,
    groups: &[Group],
) -> Result<Communicators, ParMeshError> {
    let local = agree(comm, index_local(groups))?;
    let me = comm.rank();

    let unpaired_keys: Vec<WireFaceKey> = local
        .unpaired
        .iter()
        .map(|&p| WireFaceKey::of(local.face_keys[p]))
        .collect();
    let ids: Vec<WireId> = local.node_gids.iter().copied().map(WireId::of).collect();
    let mut w = WireWriter::new(KIND_FACE_KEYS);
    w.section(&unpaired_keys).section(&ids);
    let gathered = all_gather(comm, CommTag::FACE_MATCH, &w.finish())?;

    let assemble = move || -> Result<Communicators, ParMeshError> {
        let mut twins = vec![0usize; local.face_keys.len()];
        let mut ext_node = Vec::new();
        let mut ext_face = Vec::new();
        for (peer, bytes) in gathered.iter().enumerate() {
            if peer == me {
                continue;
            }
            let (faces, nodes) = decode_peer(peer, bytes)?;
            let face_positions = intersect_sorted(
                local.unpaired.iter().map(|&p| (local.face_keys[p], p)),
                &faces,
            );
            let node_positions = intersect_sorted(
                local.node_gids.iter().copied().zip(0..),
                &nodes,
            );
            face_positions.iter().for_each(|&p| twins[p] += 1);
            if !face_positions.is_empty() {
                ext_face.push(ExternalComm {
                    peer,
                    positions: face_positions,
                });
            }
            if !node_positions.is_empty() {
                ext_node.push(ExternalComm {
                    peer,
                    positions: node_positions,
                });
            }
        }

        for &p in &local.unpaired {
            match twins[p] {
                1 => {}
                0 => {
                    return Err(ParMeshError::comm_check(
                        CommKind::ExternalFace,
                        format!("interface face {:?} has no twin on any process", local.face_keys[p]),
                    ));
                }
                n => {
                    return Err(ParMeshError::comm_check(
                        CommKind::ExternalFace,
                        format!("interface face {:?} found on {n} other processes", local.face_keys[p]),
                    ));
                }
            }
        }

        debug!(
            "rank {me}: {} interface nodes, {} interface faces, {} neighbours",
            local.node_gids.len(),
            local.face_keys.len(),
            ext_node.len()
        );
        Ok(Communicators {
            int_node: local.int_node,
            int_face: local.int_face,
            ext_node,
            ext_face,
            node_gids: local.node_gids,
            face_keys: local.face_keys,
            superseded_faces: local.superseded,
        })
    };
    agree(comm, assemble())
}
