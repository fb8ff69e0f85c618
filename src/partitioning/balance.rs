//! Load balancing of groups across processes.
//!
//! Every rank publishes the weight of each of its groups. Groups heavier than
//! one grain are split first, so that no single group is too large to move.
//! The plan is then computed identically on every rank from the gathered
//! weights: repeatedly move one group from the most loaded rank to the least
//! loaded one, picking the group that brings the pair closest to an even
//! split. Arriving groups are sent whole and optionally merged with the groups
//! already on the destination.

use crate::algs::collective::{agree, all_gather};
use crate::algs::merge::{InterfacePolicy, decode_within, merge_within};
use crate::algs::split::split_with;
use crate::algs::transport::{CommTag, Transport, Wait};
use crate::algs::wire::{decode_ids, encode_group, encode_ids};
use crate::config::{ParMeshConfig, WeightPolicy};
use crate::geometry::quality::{mean_metric_size, regular_volume, tetra_volume};
use crate::memory::MemoryBudget;
use crate::mesh_error::ParMeshError;
use crate::partitioning::partitioner_for;
use crate::topology::entity::GlobalId;
use crate::topology::group::Group;
use crate::topology::parmesh::ParMesh;
use hashbrown::HashSet;
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// One planned migration: group `group` of rank `from` goes to rank `to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Move {
    pub from: usize,
    pub group: usize,
    pub to: usize,
    pub weight: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BalanceReport {
    pub skipped: bool,
    pub imbalance_before: f64,
    pub imbalance_after: f64,
    pub moves: usize,
    /// Groups created by splitting oversized groups before the moves.
    pub splits: usize,
}

/// Work estimate for one group.
///
/// With [`WeightPolicy::MetricCost`], each tetrahedron counts for the number
/// of regular tetrahedra of the target size it will roughly become, and at
/// least one.
pub fn group_weight(group: &Group, policy: WeightPolicy) -> u64 {
    match policy {
        WeightPolicy::TetraCount => group.n_tetra() as u64,
        WeightPolicy::MetricCost if group.metric().is_empty() => group.n_tetra() as u64,
        WeightPolicy::MetricCost => group
            .tetras()
            .iter()
            .map(|t| {
                let expected = mean_metric_size(group.metric(), t)
                    .map(|h| tetra_volume(group.points(), t) / regular_volume(h))
                    .unwrap_or(1.0);
                expected.max(1.0).round() as u64
            })
            .sum(),
    }
}

/// `max / mean - 1` over the loads; zero when there is no load at all.
pub fn imbalance(loads: &[u64]) -> f64 {
    let total: u64 = loads.iter().sum();
    if total == 0 || loads.is_empty() {
        return 0.0;
    }
    let max = loads.iter().copied().max().unwrap_or(0);
    max as f64 * loads.len() as f64 / total as f64 - 1.0
}

fn argmax(loads: &[u64]) -> usize {
    let mut best = 0;
    for (r, &l) in loads.iter().enumerate() {
        if l > loads[best] {
            best = r;
        }
    }
    best
}

fn argmin(loads: &[u64]) -> usize {
    let mut best = 0;
    for (r, &l) in loads.iter().enumerate() {
        if l < loads[best] {
            best = r;
        }
    }
    best
}

/// Plan migrations from the group weights of every rank.
///
/// Deterministic: every rank computes the same list from the same input.
/// Each group moves at most once, and a move is only made when it strictly
/// narrows the gap between the two ranks involved.
pub fn plan_moves(weights: &[Vec<u64>], threshold: f64) -> Vec<Move> {
    let mut loads: Vec<u64> = weights.iter().map(|w| w.iter().sum()).collect();
    let mut moved: Vec<Vec<bool>> = weights.iter().map(|w| vec![false; w.len()]).collect();
    let mut moves = Vec::new();
    let budget: usize = weights.iter().map(Vec::len).sum();

    while moves.len() < budget && imbalance(&loads) > threshold {
        let (src, dst) = (argmax(&loads), argmin(&loads));
        let gap = loads[src] - loads[dst];
        // closest to half the gap; ties go to the larger group, then the lower index
        let pick = weights[src]
            .iter()
            .enumerate()
            .filter(|&(g, &w)| !moved[src][g] && w > 0 && w < gap)
            .min_by_key(|&(g, &w)| (gap.abs_diff(2 * w), std::cmp::Reverse(w), g));
        let Some((g, &w)) = pick else {
            break;
        };
        moved[src][g] = true;
        loads[src] -= w;
        loads[dst] += w;
        moves.push(Move {
            from: src,
            group: g,
            to: dst,
            weight: w,
        });
    }
    moves
}

/// Send and receive whole groups along `moves`. Returns the groups this rank
/// kept, in their original order, followed by its arrivals in plan order.
///
/// Kept groups are charged against `budget` and every arrival is reserved
/// from its payload header before it is decoded; the returned groups stay
/// charged at their footprints. Every planned payload is still received when
/// a reservation fails, so no peer is left waiting.
pub fn execute_moves<C: Transport>(
    comm: &C,
    budget: &mut MemoryBudget,
    groups: Vec<Group>,
    moves: &[Move],
) -> Result<Vec<Group>, ParMeshError> {
    let me = comm.rank();
    let leaving: HashSet<usize> = moves
        .iter()
        .filter(|m| m.from == me)
        .map(|m| m.group)
        .collect();
    let sends: Vec<_> = moves
        .iter()
        .filter(|m| m.from == me)
        .map(|m| {
            groups
                .get(m.group)
                .map(|g| comm.isend(m.to, CommTag::MIGRATE, &encode_group(g)))
                .ok_or_else(|| {
                    ParMeshError::Partition(format!("planned move of missing group {}", m.group))
                })
        })
        .collect::<Result<_, _>>()?;

    let mut out: Vec<Group> = groups
        .into_iter()
        .enumerate()
        .filter(|(g, _)| !leaving.contains(g))
        .map(|(_, g)| g)
        .collect();
    let mut failure = budget
        .reserve(out.iter().map(Group::footprint).sum(), "execute_moves")
        .err();
    let charged_kept = failure.is_none();
    for m in moves.iter().filter(|m| m.to == me) {
        let bytes = comm.irecv(m.from, CommTag::MIGRATE).wait();
        if failure.is_some() {
            continue;
        }
        let arrival = bytes
            .ok_or_else(|| ParMeshError::CommError {
                neighbor: m.from,
                reason: format!("group {} never arrived", m.group),
            })
            .and_then(|bytes| decode_within(budget, &bytes));
        match arrival {
            Ok(g) => out.push(g),
            Err(e) => failure = Some(e),
        }
    }
    for s in sends {
        let _ = s.wait();
    }
    match failure {
        None => Ok(out),
        Some(e) => {
            if charged_kept {
                budget.release(out.iter().map(Group::footprint).sum());
            }
            Err(e)
        }
    }
}

fn gather_weights<C: Transport>(
    comm: &C,
    groups: &[Group],
    policy: WeightPolicy,
) -> Result<Vec<Vec<u64>>, ParMeshError> {
    let mine: Vec<GlobalId> = groups.iter().map(|g| group_weight(g, policy)).collect();
    all_gather(comm, CommTag::WEIGHTS, &encode_ids(&mine))?
        .iter()
        .map(|b| decode_ids(b))
        .collect()
}

/// Split every group heavier than `grain` into roughly grain-sized pieces.
fn split_oversized(
    groups: Vec<Group>,
    grain: u64,
    cfg: &ParMeshConfig,
) -> Result<(Vec<Group>, usize), ParMeshError> {
    let partitioner = partitioner_for(&cfg.partition);
    let mut out = Vec::with_capacity(groups.len());
    let mut splits = 0;
    for group in groups {
        let w = group_weight(&group, cfg.weight);
        let nparts = w.div_ceil(grain.max(1)).min(group.n_tetra() as u64) as usize;
        if nparts <= 1 {
            out.push(group);
            continue;
        }
        let pieces = split_with(&group, nparts, partitioner.as_ref())?;
        splits += pieces.len() - 1;
        out.extend(pieces.into_iter().filter(|g| !g.is_empty()));
    }
    Ok((out, splits))
}

/// Merge the groups of this rank into one, keeping the interface only where
/// it is still shared with another process.
fn merge_local<C: Transport>(pm: &mut ParMesh<C>, tolerance: f64) -> Result<(), ParMeshError> {
    if pm.n_groups() < 2 {
        return Ok(());
    }
    let comms = pm.communicators("merge_local")?;
    let nodes: HashSet<GlobalId> = comms.shared_node_gids().collect();
    let faces: HashSet<[GlobalId; 3]> = comms.shared_face_keys().collect();
    let groups = pm.take_groups();
    let held: usize = groups.iter().map(Group::footprint).sum();
    let keep = InterfacePolicy::KeepOnly {
        nodes: &nodes,
        faces: &faces,
    };
    let memory = pm.memory_mut();
    memory.reserve(held, "merge_local")?;
    let merged = merge_within(memory, groups, keep, tolerance)?;
    let reserved = merged.footprint();
    pm.push_reserved(merged, reserved).map(|_| ())
}

/// Rebalance the groups of `pm` across processes. Collective.
///
/// Leaves `pm` with fresh, checked communicators whether or not anything
/// moved.
pub fn rebalance<C: Transport>(
    pm: &mut ParMesh<C>,
    cfg: &ParMeshConfig,
) -> Result<BalanceReport, ParMeshError> {
    let policy = &cfg.balance;
    let weights = agree(pm.comm(), gather_weights(pm.comm(), pm.groups(), cfg.weight))?;
    let loads: Vec<u64> = weights.iter().map(|w| w.iter().sum()).collect();
    let before = imbalance(&loads);
    if !policy.enabled || pm.nprocs() < 2 || before <= policy.imbalance_threshold {
        debug!("rank {}: balance skipped, imbalance {before:.3}", pm.rank());
        pm.rebuild_communicators(cfg.geometric_tolerance)?;
        return Ok(BalanceReport {
            skipped: true,
            imbalance_before: before,
            imbalance_after: before,
            ..Default::default()
        });
    }

    let total: u64 = loads.iter().sum();
    let grain = total.div_ceil((pm.nprocs() * policy.grains_per_proc) as u64);
    let groups = pm.take_groups();
    let (groups, splits) = agree(pm.comm(), split_oversized(groups, grain, cfg))?;
    let weights = agree(pm.comm(), gather_weights(pm.comm(), &groups, cfg.weight))?;
    let moves = plan_moves(&weights, policy.imbalance_threshold);

    let mut after: Vec<u64> = weights.iter().map(|w| w.iter().sum()).collect();
    for m in &moves {
        after[m.from] -= m.weight;
        after[m.to] += m.weight;
    }
    let (comm, memory) = pm.comm_and_memory_mut();
    let moved = execute_moves(comm, memory, groups, &moves);
    let held: usize = moved.as_ref().map_or(0, |g| g.iter().map(Group::footprint).sum());
    let groups = agree(pm.comm(), moved).map_err(|e| {
        pm.memory_mut().release(held);
        e
    })?;
    let kept = groups.into_iter().try_for_each(|g| {
        let bytes = g.footprint();
        pm.push_reserved(g, bytes).map(|_| ())
    });
    agree(pm.comm(), kept)?;
    pm.rebuild_communicators(cfg.geometric_tolerance)?;

    if policy.merge_arrivals {
        let merged = merge_local(pm, cfg.geometric_tolerance);
        agree(pm.comm(), merged)?;
        pm.rebuild_communicators(cfg.geometric_tolerance)?;
    }

    let report = BalanceReport {
        skipped: false,
        imbalance_before: before,
        imbalance_after: imbalance(&after),
        moves: moves.len(),
        splits,
    };
    info!(
        "rank {}: balance moved {} groups ({} splits), imbalance {:.3} -> {:.3}",
        pm.rank(),
        report.moves,
        report.splits,
        report.imbalance_before,
        report.imbalance_after
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::cube_mesh;
    use crate::algs::transport::{NoComm, run_local_world};
    use crate::geometry::metric::Metric;

    #[test]
    fn imbalance_of_loads() {
        assert_eq!(imbalance(&[]), 0.0);
        assert_eq!(imbalance(&[0, 0]), 0.0);
        assert_eq!(imbalance(&[5, 5]), 0.0);
        assert!((imbalance(&[30, 10]) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn plan_evens_out_two_ranks() {
        let weights = vec![vec![10, 10, 10, 10], vec![]];
        let moves = plan_moves(&weights, 0.0);
        assert_eq!(moves.len(), 2);
        assert!(moves.iter().all(|m| m.from == 0 && m.to == 1));
        assert_eq!(moves[0].group, 0);
        assert_eq!(moves[1].group, 1);
    }

    #[test]
    fn plan_prefers_the_group_closest_to_half_the_gap() {
        let weights = vec![vec![3, 20, 11, 9], vec![5]];
        let moves = plan_moves(&weights, 0.1);
        // gap 38: 20 is closest to 19
        assert_eq!(moves[0], Move { from: 0, group: 1, to: 1, weight: 20 });
    }

    #[test]
    fn a_lone_heavy_group_stays_put() {
        assert!(plan_moves(&[vec![100], vec![1], vec![1]], 0.0).is_empty());
        assert!(plan_moves(&[vec![7], vec![]], 0.0).is_empty());
    }

    #[test]
    fn three_ranks_share_three_groups() {
        let moves = plan_moves(&[vec![5, 5, 5], vec![], vec![]], 0.0);
        assert_eq!(
            moves,
            vec![
                Move { from: 0, group: 0, to: 1, weight: 5 },
                Move { from: 0, group: 1, to: 2, weight: 5 },
            ]
        );
    }

    #[test]
    fn balanced_input_plans_nothing() {
        assert!(plan_moves(&[vec![4, 4], vec![8]], 0.2).is_empty());
    }

    #[test]
    fn metric_cost_counts_expected_refinement() {
        let g = cube_mesh(1, 1, 1);
        assert_eq!(group_weight(&g, WeightPolicy::TetraCount), 6);
        assert_eq!(group_weight(&g, WeightPolicy::MetricCost), 6);
        let fine = g.clone().with_metric(Metric::constant(8, 0.1));
        assert!(group_weight(&fine, WeightPolicy::MetricCost) > 6 * 100);
    }

    #[test]
    fn single_process_skips() {
        let mut pm = ParMesh::new(NoComm, MemoryBudget::unlimited());
        pm.push_group(cube_mesh(2, 2, 2)).unwrap();
        let report = rebalance(&mut pm, &ParMeshConfig::default()).unwrap();
        assert!(report.skipped);
        assert!(pm.has_communicators());
    }

    #[test]
    fn arrivals_are_reserved_before_decoding() {
        let g = cube_mesh(2, 2, 2);
        let bytes = g.footprint();
        let moves = [
            Move { from: 0, group: 0, to: 1, weight: 48 },
            Move { from: 0, group: 1, to: 1, weight: 48 },
        ];
        let out = run_local_world(2, |c| {
            let (groups, mut budget) = if c.rank() == 0 {
                (vec![g.clone(), g.clone()], MemoryBudget::unlimited())
            } else {
                (Vec::new(), MemoryBudget::new(bytes + bytes / 2))
            };
            let res = execute_moves(&c, &mut budget, groups, &moves);
            (res.map(|kept| kept.len()), budget.current())
        });
        assert!(matches!(out[0], (Ok(0), 0)));
        assert!(matches!(
            out[1].0,
            Err(ParMeshError::OutOfMemory { context: "decode_group", .. })
        ));
        assert_eq!(out[1].1, 0);
    }

    #[test]
    fn everything_on_one_rank_gets_spread() {
        let total = cube_mesh(4, 2, 2).n_tetra();
        let out = run_local_world(3, |c| {
            let mut pm = ParMesh::new(c, MemoryBudget::unlimited());
            if pm.rank() == 0 {
                pm.push_group(cube_mesh(4, 2, 2)).unwrap();
            }
            let report = rebalance(&mut pm, &ParMeshConfig::default()).unwrap();
            (report, pm.n_tetra(), pm.n_groups())
        });
        assert_eq!(out.iter().map(|o| o.1).sum::<usize>(), total);
        for (report, n, groups) in &out {
            assert!(!report.skipped);
            assert!(report.imbalance_after < report.imbalance_before);
            assert!(*n > 0);
            assert_eq!(*groups, 1);
        }
    }
}
