//! Re-synchronization of interface points after the kernel was allowed to
//! move them.
//!
//! Every shared point has one canonical copy: the one on the lowest rank
//! holding it and, on that rank, in the lowest group. Its coordinates and
//! metric are copied over every other copy. Points are matched by global id,
//! so the communicators of the previous build stay usable as long as the
//! kernel kept the interface point set itself.

use super::Communicators;
use crate::algs::collective::{agree, all_to_all};
use crate::algs::transport::{CommTag, Transport};
use crate::algs::wire::{KIND_NODES, WireF64, WireNode, WireReader, WireWriter};
use crate::mesh_error::ParMeshError;
use crate::topology::entity::GlobalId;
use crate::topology::group::Group;
use hashbrown::HashMap;
use log::debug;

#[derive(Clone, Debug, PartialEq)]
struct NodeState {
    coords: [f64; 3],
    metric: Vec<f64>,
}

/// Local copies of every interface point, keyed by position.
fn locate(
    groups: &[Group],
    comms: &Communicators,
) -> Result<Vec<Vec<(usize, usize)>>, ParMeshError> {
    let mut by_gid: HashMap<GlobalId, Vec<(usize, usize)>> = HashMap::new();
    for (g, group) in groups.iter().enumerate() {
        for i in group.interface_points() {
            by_gid.entry(group.points()[i].gid).or_default().push((g, i));
        }
    }
    comms
        .node_gids
        .iter()
        .map(|&gid| {
            by_gid
                .remove(&gid)
                .ok_or(ParMeshError::InterfaceMoved { gid })
        })
        .collect()
}

fn state_of(group: &Group, i: usize) -> NodeState {
    NodeState {
        coords: group.points()[i].coords,
        metric: if group.metric().is_empty() {
            Vec::new()
        } else {
            group.metric().at(i).to_vec()
        },
    }
}

/// Copy canonical coordinates and metric over every copy of each interface
/// point. Returns how many local copies changed. Collective.
pub fn resync_interface<C: Transport>(
    comm: &C,
    groups: &mut [Group],
    comms: &Communicators,
) -> Result<usize, ParMeshError> {
    let copies = agree(comm, locate(groups, comms))?;
    let (me, n) = (comm.rank(), comm.size());

    // copies are pushed in group order, so the first one is the canonical local copy
    let mut canonical: Vec<NodeState> = copies
        .iter()
        .map(|c| {
            let (g, i) = c[0];
            state_of(&groups[g], i)
        })
        .collect();

    let mut owner = vec![me; comms.node_gids.len()];
    for c in &comms.ext_node {
        for &p in &c.positions {
            owner[p] = owner[p].min(c.peer);
        }
    }

    let outgoing: Vec<Vec<u8>> = (0..n)
        .map(|q| {
            let Some(c) = comms.ext_node_with(q).filter(|_| q != me) else {
                return Vec::new();
            };
            let nodes: Vec<WireNode> = c
                .positions
                .iter()
                .map(|&p| WireNode::new(comms.node_gids[p], canonical[p].coords))
                .collect();
            let metric: Vec<WireF64> = c
                .positions
                .iter()
                .flat_map(|&p| canonical[p].metric.iter().copied().map(WireF64::of))
                .collect();
            let mut w = WireWriter::new(KIND_NODES);
            w.section(&nodes).section(&metric);
            w.finish()
        })
        .collect();
    let incoming = all_to_all(comm, CommTag::SYNC, outgoing)?;

    let adopt = |canonical: &mut Vec<NodeState>| -> Result<(), ParMeshError> {
        for c in comms.ext_node.iter().filter(|c| c.peer < me) {
            let mut r = WireReader::open(&incoming[c.peer], KIND_NODES)?;
            let nodes = r.section::<WireNode>()?;
            let metric = r.section::<WireF64>()?;
            r.finish()?;
            if nodes.len() != c.positions.len() {
                return Err(ParMeshError::CommError {
                    neighbor: c.peer,
                    reason: format!(
                        "resync: {} points received, {} expected",
                        nodes.len(),
                        c.positions.len()
                    ),
                });
            }
            let stride = if nodes.is_empty() { 0 } else { metric.len() / nodes.len() };
            for (j, (&p, node)) in c.positions.iter().zip(&nodes).enumerate() {
                if owner[p] != c.peer {
                    continue;
                }
                if node.gid() != comms.node_gids[p] {
                    return Err(ParMeshError::MergeMismatch {
                        gid: comms.node_gids[p],
                        reason: format!("rank {} sent gid {} at this position", c.peer, node.gid()),
                    });
                }
                canonical[p] = NodeState {
                    coords: node.coords(),
                    metric: metric[j * stride..(j + 1) * stride]
                        .iter()
                        .map(|m| m.get())
                        .collect(),
                };
            }
        }
        Ok(())
    };
    let adopted = adopt(&mut canonical);
    agree(comm, adopted)?;

    let mut changed = 0;
    for (p, local) in copies.iter().enumerate() {
        for &(g, i) in local {
            let state = &canonical[p];
            if state_of(&groups[g], i) == *state {
                continue;
            }
            groups[g].points_mut()[i].coords = state.coords;
            let metric = groups[g].metric_mut();
            if !metric.is_empty() && metric.size() == state.metric.len() {
                metric.at_mut(i).copy_from_slice(&state.metric);
            }
            changed += 1;
        }
    }
    debug!("rank {me}: resynchronized {changed} interface point copies");
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::cube_mesh;
    use crate::algs::split::split_group;
    use crate::algs::transport::NoComm;
    use crate::interface::build_communicators;

    #[test]
    fn lowest_group_wins_locally() {
        let g = cube_mesh(2, 1, 1);
        let parts: Vec<usize> = (0..g.n_tetra()).map(|t| t / 6).collect();
        let mut groups = split_group(&g, &parts, 2).unwrap();
        let comms = build_communicators(&NoComm, &groups).unwrap();
        let i0 = groups[0].interface_points().next().unwrap();
        let gid = groups[0].points()[i0].gid;
        groups[0].points_mut()[i0].coords[2] += 0.01;
        let target = groups[0].points()[i0].coords;

        assert_eq!(resync_interface(&NoComm, &mut groups, &comms).unwrap(), 1);
        let i1 = groups[1].points().iter().position(|p| p.gid == gid).unwrap();
        assert_eq!(groups[1].points()[i1].coords, target);
    }

    #[test]
    fn vanished_point_is_reported() {
        let g = cube_mesh(2, 1, 1);
        let parts: Vec<usize> = (0..g.n_tetra()).map(|t| t / 6).collect();
        let mut groups = split_group(&g, &parts, 2).unwrap();
        let comms = build_communicators(&NoComm, &groups).unwrap();
        for gr in groups.iter_mut() {
            gr.clear_interface();
        }
        assert!(matches!(
            resync_interface(&NoComm, &mut groups, &comms),
            Err(ParMeshError::InterfaceMoved { .. })
        ));
    }
}
