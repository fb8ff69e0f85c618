//! Interface detection for pre-partitioned input.
//!
//! When every process brings its own groups, the interface is not flagged
//! yet. A free face (no opposite tetrahedron in its group) is an interface
//! face when its key appears in another group, local or remote; a point on a
//! free face is an interface point when its global id appears on the free
//! surface of another group. Stale interface flags are cleared.

use crate::algs::collective::{agree, all_gather};
use crate::algs::transport::{CommTag, Transport};
use crate::algs::wire::{KIND_FACE_KEYS, WireFaceKey, WireId, WireReader, WireWriter};
use crate::mesh_error::ParMeshError;
use crate::topology::entity::{FaceFlags, GlobalId, PointFlags, UNASSIGNED_GID};
use crate::topology::group::Group;
use hashbrown::{HashMap, HashSet};
use log::debug;

struct FreeSurface {
    /// `(group, tetra, face, key)` of every free face.
    faces: Vec<(usize, usize, usize, [GlobalId; 3])>,
    /// `(group, point)` of every point on a free face.
    points: Vec<(usize, usize)>,
}

fn free_surface(groups: &[Group]) -> Result<FreeSurface, ParMeshError> {
    let mut faces = Vec::new();
    let mut points = Vec::new();
    for (g, group) in groups.iter().enumerate() {
        let adj = group.adjacency(g)?;
        let mut on_surface = vec![false; group.n_points()];
        for (k, i) in adj.free_faces() {
            let key = group.face_gids(k, i);
            if key.contains(&UNASSIGNED_GID) {
                return Err(ParMeshError::InvalidConfig(format!(
                    "group {g}: free face {i} of tetra {k} has a point without a global id"
                )));
            }
            faces.push((g, k, i, key));
            for v in group.tetras()[k].face_vertices(i) {
                on_surface[v] = true;
            }
        }
        points.extend(
            on_surface
                .iter()
                .enumerate()
                .filter(|(_, s)| **s)
                .map(|(i, _)| (g, i)),
        );
    }
    Ok(FreeSurface { faces, points })
}

/// Flag the interface of pre-partitioned groups. Returns the number of
/// interface faces on this process. Collective.
pub fn flag_interface<C: Transport>(
    comm: &C,
    groups: &mut [Group],
) -> Result<usize, ParMeshError> {
    let surface = agree(comm, free_surface(groups))?;
    let me = comm.rank();

    let mut face_groups: HashMap<[GlobalId; 3], usize> = HashMap::new();
    for &(_, _, _, key) in &surface.faces {
        *face_groups.entry(key).or_default() += 1;
    }
    let mut point_groups: HashMap<GlobalId, usize> = HashMap::new();
    for &(g, i) in &surface.points {
        *point_groups.entry(groups[g].points()[i].gid).or_default() += 1;
    }

    let mut keys: Vec<[GlobalId; 3]> = face_groups.keys().copied().collect();
    keys.sort_unstable();
    let mut gids: Vec<GlobalId> = point_groups.keys().copied().collect();
    gids.sort_unstable();
    let key_recs: Vec<WireFaceKey> = keys.iter().copied().map(WireFaceKey::of).collect();
    let gid_recs: Vec<WireId> = gids.iter().copied().map(WireId::of).collect();
    let mut w = WireWriter::new(KIND_FACE_KEYS);
    w.section(&key_recs).section(&gid_recs);
    let gathered = all_gather(comm, CommTag::NODE_MATCH, &w.finish())?;

    let collect_remote = || -> Result<(HashSet<[GlobalId; 3]>, HashSet<GlobalId>), ParMeshError> {
        let mut remote_faces = HashSet::new();
        let mut remote_points = HashSet::new();
        for (peer, bytes) in gathered.iter().enumerate().filter(|(q, _)| *q != me) {
            let wrap = |e: ParMeshError| ParMeshError::CommError {
                neighbor: peer,
                reason: e.to_string(),
            };
            let mut r = WireReader::open(bytes, KIND_FACE_KEYS).map_err(wrap)?;
            let their_keys = r.section::<WireFaceKey>().map_err(wrap)?;
            let their_gids = r.section::<WireId>().map_err(wrap)?;
            r.finish().map_err(wrap)?;
            remote_faces.extend(
                their_keys
                    .iter()
                    .map(WireFaceKey::get)
                    .filter(|k| face_groups.contains_key(k)),
            );
            remote_points.extend(
                their_gids
                    .iter()
                    .map(|id| id.get())
                    .filter(|g| point_groups.contains_key(g)),
            );
        }
        Ok((remote_faces, remote_points))
    };
    let (remote_faces, remote_points) = agree(comm, collect_remote())?;

    for group in groups.iter_mut() {
        group.clear_interface();
    }
    let mut n_faces = 0;
    for &(g, k, i, key) in &surface.faces {
        if face_groups[&key] > 1 || remote_faces.contains(&key) {
            groups[g].tetras_mut()[k].faces[i].insert(FaceFlags::INTERFACE);
            n_faces += 1;
        }
    }
    for &(g, i) in &surface.points {
        let gid = groups[g].points()[i].gid;
        if point_groups[&gid] > 1 || remote_points.contains(&gid) {
            groups[g].points_mut()[i].flags.insert(PointFlags::INTERFACE);
        }
    }
    debug!("rank {me}: flagged {n_faces} interface faces");
    Ok(n_faces)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::cube_mesh;
    use crate::algs::split::split_group;
    use crate::algs::transport::{NoComm, run_local_world};
    use crate::interface::{build_communicators, check_communicators};

    fn two_halves() -> Vec<Group> {
        let g = cube_mesh(2, 1, 1);
        let parts: Vec<usize> = (0..g.n_tetra()).map(|t| t / 6).collect();
        split_group(&g, &parts, 2).unwrap()
    }

    #[test]
    fn recovers_the_split_interface_locally() {
        let expected = two_halves();
        let mut groups = expected.clone();
        groups.iter_mut().for_each(Group::clear_interface);
        assert_eq!(flag_interface(&NoComm, &mut groups).unwrap(), 4);
        assert_eq!(groups, expected);
    }

    #[test]
    fn recovers_the_interface_across_ranks() {
        let out = run_local_world(2, |c| {
            let mut mine = vec![two_halves().swap_remove(c.rank())];
            mine[0].clear_interface();
            let n = flag_interface(&c, &mut mine).unwrap();
            let comms = build_communicators(&c, &mine).unwrap();
            check_communicators(&c, &mine, &comms, 1e-12).unwrap();
            (n, comms.ext_face.len())
        });
        assert_eq!(out, vec![(2, 1), (2, 1)]);
    }
}
