//! Merge several groups into one, locally or across processes.
//!
//! Points are unified by global id, first seen wins; the coordinates of
//! every later copy must agree within the geometric tolerance. Tetrahedra
//! are remapped and appended; a tetrahedron present in two inputs is a
//! conservation error. Interface faces that found their twin become interior
//! faces; the [`InterfacePolicy`] decides what happens to the rest.

use crate::algs::collective::agree;
use crate::algs::transport::{CommTag, Transport, Wait};
use crate::algs::wire::{decode_group, encode_group, group_payload_footprint};
use crate::geometry::metric::{Metric, MetricKind};
use crate::memory::MemoryBudget;
use crate::mesh_error::ParMeshError;
use crate::topology::entity::{FaceFlags, GlobalId, Point, PointFlags, UNASSIGNED_GID};
use crate::topology::group::{Group, footprint_of};
use hashbrown::{HashMap, HashSet};
use log::debug;

/// What to do with interface flags that survive a merge.
#[derive(Clone, Copy, Debug)]
pub enum InterfacePolicy<'a> {
    /// The result is the whole mesh: no interface remains.
    ClearAll,
    /// Keep every surviving flag (intermediate merges).
    KeepAll,
    /// Keep only entities still shared with other processes.
    KeepOnly {
        nodes: &'a HashSet<GlobalId>,
        faces: &'a HashSet<[GlobalId; 3]>,
    },
}

fn metric_kind_of(groups: &[Group]) -> Result<(MetricKind, bool), ParMeshError> {
    let mut with_metric = groups.iter().filter(|g| !g.is_empty() && !g.metric().is_empty());
    let first = with_metric.next();
    let kind = first.map_or_else(
        || groups.first().map_or(MetricKind::Isotropic, |g| g.metric().kind()),
        |g| g.metric().kind(),
    );
    if with_metric.any(|g| g.metric().kind() != kind) {
        return Err(ParMeshError::InvalidMetric(
            "cannot merge isotropic and anisotropic metrics".into(),
        ));
    }
    let present = first.is_some();
    if present
        && groups
            .iter()
            .any(|g| !g.is_empty() && g.metric().len() != g.n_points())
    {
        return Err(ParMeshError::InvalidMetric(
            "cannot merge groups with and without a metric".into(),
        ));
    }
    Ok((kind, present))
}

/// Merge `groups` into one group.
pub fn merge_groups(
    groups: Vec<Group>,
    policy: InterfacePolicy<'_>,
    tolerance: f64,
) -> Result<Group, ParMeshError> {
    let (kind, with_metric) = metric_kind_of(&groups)?;
    let expected: usize = groups.iter().map(Group::n_tetra).sum();
    let tol2 = tolerance * tolerance;

    let mut points: Vec<Point> = Vec::with_capacity(groups.iter().map(Group::n_points).sum());
    let mut tetras = Vec::with_capacity(expected);
    let mut metric = Metric::empty(kind);
    let mut by_gid: HashMap<GlobalId, usize> = HashMap::new();
    let mut seen_tetra: HashSet<[usize; 4]> = HashSet::with_capacity(expected);

    for group in groups.iter().filter(|g| !g.is_empty()) {
        let mut remap = Vec::with_capacity(group.n_points());
        for (i, p) in group.points().iter().enumerate() {
            let existing = (p.gid != UNASSIGNED_GID)
                .then(|| by_gid.get(&p.gid).copied())
                .flatten();
            match existing {
                Some(j) => {
                    let kept = &mut points[j];
                    if kept.dist2(p) > tol2 {
                        return Err(ParMeshError::MergeMismatch {
                            gid: p.gid,
                            reason: format!(
                                "copies at {:?} and {:?} differ",
                                kept.coords, p.coords
                            ),
                        });
                    }
                    if p.flags.contains(PointFlags::BOUNDARY) {
                        kept.flags.insert(PointFlags::BOUNDARY);
                    }
                    remap.push(j);
                }
                None => {
                    let j = points.len();
                    if p.gid != UNASSIGNED_GID {
                        by_gid.insert(p.gid, j);
                    }
                    points.push(*p);
                    if with_metric {
                        metric.push(group.metric().at(i));
                    }
                    remap.push(j);
                }
            }
        }
        for t in group.tetras() {
            let mut nt = *t;
            nt.v = t.v.map(|v| remap[v]);
            let mut key = nt.v;
            key.sort_unstable();
            if !seen_tetra.insert(key) {
                return Err(ParMeshError::MergeConservation {
                    expected,
                    found: tetras.len(),
                });
            }
            tetras.push(nt);
        }
    }

    let mut merged = Group::new(points, tetras, metric);
    resolve_interface(&mut merged, policy)?;
    if merged.n_tetra() != expected {
        return Err(ParMeshError::MergeConservation {
            expected,
            found: merged.n_tetra(),
        });
    }
    debug!(
        "merge: {} groups -> {} tetra, {} points",
        groups.len(),
        merged.n_tetra(),
        merged.n_points()
    );
    Ok(merged)
}

/// Drop interface flags of faces that found their twin, then apply `policy`
/// to the remaining ones and recompute the point flags.
fn resolve_interface(group: &mut Group, policy: InterfacePolicy<'_>) -> Result<(), ParMeshError> {
    let adj = group.adjacency(0)?;
    let mut on_face = vec![false; group.n_points()];
    let face_gids: Vec<[[GlobalId; 3]; 4]> = (0..group.n_tetra())
        .map(|k| [0, 1, 2, 3].map(|i| group.face_gids(k, i)))
        .collect();
    for (k, t) in group.tetras_mut().iter_mut().enumerate() {
        for i in 0..4 {
            if !t.faces[i].contains(FaceFlags::INTERFACE) {
                continue;
            }
            let keep = adj.is_free(k, i)
                && match policy {
                    InterfacePolicy::ClearAll => false,
                    InterfacePolicy::KeepAll => true,
                    InterfacePolicy::KeepOnly { faces, .. } => faces.contains(&face_gids[k][i]),
                };
            t.faces[i].set(FaceFlags::INTERFACE, keep);
            if keep {
                t.face_vertices(i).iter().for_each(|&v| on_face[v] = true);
            }
        }
    }
    for (v, p) in group.points_mut().iter_mut().enumerate() {
        let keep = match policy {
            InterfacePolicy::ClearAll => false,
            InterfacePolicy::KeepAll => p.is_interface() || on_face[v],
            InterfacePolicy::KeepOnly { nodes, .. } => {
                on_face[v] || (p.gid != UNASSIGNED_GID && nodes.contains(&p.gid))
            }
        };
        p.flags.set(PointFlags::INTERFACE, keep);
    }
    Ok(())
}

/// Merge groups that are charged against `budget`, reserving the merged
/// group's upper bound before building it. The inputs' charges are released;
/// on success the result is charged at its footprint.
pub fn merge_within(
    budget: &mut MemoryBudget,
    groups: Vec<Group>,
    policy: InterfacePolicy<'_>,
    tolerance: f64,
) -> Result<Group, ParMeshError> {
    let held: usize = groups.iter().map(Group::footprint).sum();
    let bound = footprint_of(
        groups.iter().map(Group::n_points).sum(),
        groups.iter().map(Group::n_tetra).sum(),
        groups.iter().map(|g| g.metric().values().len()).sum(),
    );
    let merged = budget.reserve(bound, "merge_groups").and_then(|()| {
        let merged = merge_groups(groups, policy, tolerance);
        budget.release(bound);
        merged
    });
    budget.release(held);
    let merged = merged?;
    budget.reserve(merged.footprint(), "merge_groups")?;
    Ok(merged)
}

/// Decode a group payload after reserving its footprint.
pub fn decode_within(budget: &mut MemoryBudget, bytes: &[u8]) -> Result<Group, ParMeshError> {
    let bytes_needed = group_payload_footprint(bytes)?;
    budget.reserve(bytes_needed, "decode_group")?;
    decode_group(bytes).map_err(|e| {
        budget.release(bytes_needed);
        e
    })
}

/// Merge every group of every rank into a single group on rank 0.
///
/// Ranks pair up along a binary tree: at stride `s`, rank `r` with
/// `r % 2s == s` sends its merged group to `r - s`. Each level ends with an
/// agreement so a failure on any rank stops all of them. Returns the whole
/// mesh on rank 0 and `None` elsewhere.
///
/// Groups in flight are charged against `budget` and every merge or decode
/// reserves its memory first. The returned mesh stays charged at its
/// footprint; nothing else remains charged on any rank.
pub fn merge_to_root<C: Transport>(
    comm: &C,
    budget: &mut MemoryBudget,
    groups: Vec<Group>,
    tolerance: f64,
) -> Result<Option<Group>, ParMeshError> {
    let (me, n) = (comm.rank(), comm.size());
    let held: usize = groups.iter().map(Group::footprint).sum();
    let local = budget
        .reserve(held, "merge_to_root")
        .and_then(|()| merge_within(budget, groups, InterfacePolicy::KeepAll, tolerance))
        .map(Some);
    let mut mine = settle(comm, budget, local)?;
    let mut stride = 1;
    while stride < n {
        let step = if me % (2 * stride) == stride {
            if let Some(g) = mine.take() {
                let payload = encode_group(&g);
                budget.release(g.footprint());
                drop(g);
                let _ = comm.isend(me - stride, CommTag::MERGE, &payload).wait();
            } else {
                let _ = comm.isend(me - stride, CommTag::MERGE, &[]).wait();
            }
            Ok(None)
        } else if me % (2 * stride) == 0 && me + stride < n {
            let donor = comm
                .irecv(me + stride, CommTag::MERGE)
                .wait()
                .ok_or_else(|| ParMeshError::CommError {
                    neighbor: me + stride,
                    reason: "no group received during merge".into(),
                })
                .and_then(|bytes| decode_within(budget, &bytes));
            match (mine.take(), donor) {
                (Some(own), Ok(donor)) => {
                    merge_within(budget, vec![own, donor], InterfacePolicy::KeepAll, tolerance)
                        .map(Some)
                }
                (own, Err(e)) => {
                    budget.release(own.map_or(0, |g| g.footprint()));
                    Err(e)
                }
                (None, Ok(donor)) => {
                    budget.release(donor.footprint());
                    Err(ParMeshError::MergeConservation {
                        expected: 1,
                        found: 0,
                    })
                }
            }
        } else {
            Ok(mine.take())
        };
        mine = settle(comm, budget, step)?;
        stride *= 2;
    }
    let root = match mine {
        Some(g) if me == 0 => {
            merge_within(budget, vec![g], InterfacePolicy::ClearAll, tolerance).map(Some)
        }
        Some(g) => {
            budget.release(g.footprint());
            Ok(None)
        }
        None => Ok(None),
    };
    settle(comm, budget, root)
}

/// Agree on a merge step; a group dropped because another rank failed gives
/// its charge back.
fn settle<C: Transport>(
    comm: &C,
    budget: &mut MemoryBudget,
    step: Result<Option<Group>, ParMeshError>,
) -> Result<Option<Group>, ParMeshError> {
    let held = match &step {
        Ok(Some(g)) => g.footprint(),
        _ => 0,
    };
    agree(comm, step).map_err(|e| {
        budget.release(held);
        e
    })
}
