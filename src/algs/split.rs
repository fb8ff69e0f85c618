//! Split one group into several along a tetra-to-part assignment.
//!
//! Every tetrahedron lands in exactly one subgroup. Points used by more than
//! one part are duplicated into each of them and flagged interface, faces
//! whose neighbour went to another part are flagged interface, and existing
//! interface flags are preserved. Coordinates, global ids and metric values
//! are copied unchanged.

use crate::mesh_error::ParMeshError;
use crate::partitioning::{PartId, Partitioner};
use crate::topology::entity::{FaceFlags, PointFlags};
use crate::topology::group::Group;
use log::debug;

pub fn split_group(
    group: &Group,
    parts: &[PartId],
    nparts: usize,
) -> Result<Vec<Group>, ParMeshError> {
    if parts.len() != group.n_tetra() {
        return Err(ParMeshError::Partition(format!(
            "assignment has {} entries for {} tetrahedra",
            parts.len(),
            group.n_tetra()
        )));
    }
    if let Some((t, &p)) = parts.iter().enumerate().find(|&(_, &p)| p >= nparts) {
        return Err(ParMeshError::Partition(format!(
            "tetra {t} assigned to part {p} of {nparts}"
        )));
    }
    let adj = group.adjacency(0)?;
    let np = group.n_points();

    let mut owner: Vec<Option<PartId>> = vec![None; np];
    let mut shared = vec![false; np];
    let mut tets_of: Vec<Vec<usize>> = vec![Vec::new(); nparts];
    for (k, t) in group.tetras().iter().enumerate() {
        let p = parts[k];
        tets_of[p].push(k);
        for &v in &t.v {
            match owner[v] {
                None => owner[v] = Some(p),
                Some(q) if q != p => shared[v] = true,
                Some(_) => {}
            }
        }
    }

    let mut local = vec![usize::MAX; np];
    let mut out = Vec::with_capacity(nparts);
    for (p, tets) in tets_of.iter().enumerate() {
        let mut used: Vec<usize> = tets
            .iter()
            .flat_map(|&k| group.tetras()[k].v)
            .collect();
        used.sort_unstable();
        used.dedup();
        for (i, &v) in used.iter().enumerate() {
            local[v] = i;
        }

        let points = used
            .iter()
            .map(|&v| {
                let mut pt = group.points()[v];
                if shared[v] {
                    pt.flags.insert(PointFlags::INTERFACE);
                }
                pt
            })
            .collect();
        let metric = group.metric().gather(&used);
        let tetras = tets
            .iter()
            .map(|&k| {
                let mut t = group.tetras()[k];
                for i in 0..4 {
                    if let Some((kn, _)) = adj.neighbor(k, i) {
                        if parts[kn] != p {
                            t.faces[i].insert(FaceFlags::INTERFACE);
                        }
                    }
                }
                t.v = t.v.map(|v| local[v]);
                t
            })
            .collect();
        debug!("split: part {p} has {} tetra, {} points", tets.len(), used.len());
        out.push(Group::new(points, tetras, metric));
    }
    Ok(out)
}

/// Partition `group` into `nparts` with `partitioner`, then split it.
pub fn split_with(
    group: &Group,
    nparts: usize,
    partitioner: &dyn Partitioner,
) -> Result<Vec<Group>, ParMeshError> {
    let parts = partitioner.partition(group, nparts)?;
    split_group(group, &parts, nparts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::cube_mesh;
    use crate::debug_invariants::DebugInvariants;
    use crate::geometry::metric::Metric;
    use crate::partitioning::Rcb;

    #[test]
    fn every_tetra_lands_once() {
        let g = cube_mesh(3, 2, 2);
        let pieces = split_with(&g, 4, &Rcb).unwrap();
        assert_eq!(pieces.len(), 4);
        let total: usize = pieces.iter().map(Group::n_tetra).sum();
        assert_eq!(total, g.n_tetra());
        let vol: f64 = pieces.iter().map(Group::volume).sum();
        assert!((vol - g.volume()).abs() < 1e-12);
        for p in &pieces {
            p.validate_invariants().unwrap();
        }
    }

    #[test]
    fn cut_points_and_faces_are_flagged() {
        let mut g = cube_mesh(2, 1, 1);
        *g.metric_mut() = Metric::isotropic((1..=g.n_points()).map(|i| i as f64).collect());
        let parts: Vec<usize> = (0..g.n_tetra()).map(|t| t / 6).collect();
        let pieces = split_group(&g, &parts, 2).unwrap();
        for piece in &pieces {
            let iface: Vec<_> = piece.interface_points().collect();
            assert_eq!(iface.len(), 4);
            for &i in &iface {
                assert!((piece.points()[i].coords[0] - 0.5).abs() < 1e-12);
            }
            assert_eq!(piece.interface_faces().count(), 2);
            for (i, p) in piece.points().iter().enumerate() {
                assert_eq!(piece.metric().at(i)[0], p.gid as f64);
            }
        }
    }

    #[test]
    fn bad_assignment_is_rejected() {
        let g = cube_mesh(1, 1, 1);
        assert!(split_group(&g, &[0; 3], 2).is_err());
        assert!(split_group(&g, &[0, 0, 0, 0, 0, 5], 2).is_err());
    }
}
