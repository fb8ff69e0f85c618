//! Initial distribution of a centralized mesh.

use crate::algs::collective::{ReduceOp, agree, all_reduce_u64, broadcast};
use crate::algs::split::split_with;
use crate::algs::transport::{CommTag, Transport, Wait};
use crate::algs::merge::decode_within;
use crate::algs::wire::encode_group;
use crate::memory::MemoryBudget;
use crate::mesh_error::ParMeshError;
use crate::partitioning::Partitioner;
use crate::topology::group::Group;
use log::{debug, warn};

/// Give every unnumbered point a global id above the largest one in use.
pub fn ensure_gids(group: &mut Group) -> usize {
    let base = group.max_gid() + 1;
    group.assign_fresh_gids(base, 0, 1)
}

/// Rank 0 partitions `mesh` into one group per rank and sends each rank its
/// group; every rank returns the group it now owns. Collective.
///
/// The root mesh and its pieces are charged against `budget` while rank 0
/// holds them, and a received group is reserved before it is decoded. The
/// returned group stays charged at its footprint.
pub fn distribute_centralized<C: Transport>(
    comm: &C,
    budget: &mut MemoryBudget,
    mesh: Option<Group>,
    partitioner: &dyn Partitioner,
) -> Result<Group, ParMeshError> {
    let (me, n) = (comm.rank(), comm.size());
    let root_tetra = mesh.as_ref().map_or(0, Group::n_tetra);
    let pieces = if me == 0 {
        mesh.ok_or_else(|| {
            ParMeshError::InvalidConfig("centralized input requires a mesh on rank 0".into())
        })
        .and_then(|g| split_root(budget, g, n, partitioner))
    } else {
        if mesh.is_some() {
            warn!("rank {me}: centralized input ignores the mesh given on this rank");
        }
        Ok(Vec::new())
    };
    let held: usize = pieces.as_ref().map_or(0, |p| p.iter().map(Group::footprint).sum());
    let mut pieces = agree(comm, pieces).map_err(|e| {
        budget.release(held);
        e
    })?;

    let mine = if me == 0 {
        let sends: Vec<_> = pieces
            .iter()
            .enumerate()
            .skip(1)
            .map(|(q, g)| comm.isend(q, CommTag::DISTRIBUTE, &encode_group(g)))
            .collect();
        for s in sends {
            let _ = s.wait();
        }
        for sent in pieces.drain(1..) {
            budget.release(sent.footprint());
        }
        pieces.pop().ok_or_else(|| ParMeshError::Partition("no part for rank 0".into()))
    } else {
        comm.irecv(0, CommTag::DISTRIBUTE)
            .wait()
            .ok_or_else(|| ParMeshError::CommError {
                neighbor: 0,
                reason: "no group received during distribution".into(),
            })
            .and_then(|bytes| decode_within(budget, &bytes))
    };
    let held = mine.as_ref().map_or(0, Group::footprint);
    let mine = agree(comm, mine).map_err(|e| {
        budget.release(held);
        e
    })?;
    match conserved_tetra(comm, root_tetra, mine.n_tetra()) {
        Ok(()) => Ok(mine),
        Err(e) => {
            budget.release(mine.footprint());
            Err(e)
        }
    }
}

/// Every tetra of the root mesh landed on exactly one rank.
fn conserved_tetra<C: Transport>(
    comm: &C,
    root_tetra: usize,
    mine: usize,
) -> Result<(), ParMeshError> {
    let bytes = broadcast(comm, 0, &(root_tetra as u64).to_le_bytes())?;
    let expected = <[u8; 8]>::try_from(bytes.as_slice())
        .map(u64::from_le_bytes)
        .map_err(|_| ParMeshError::CommError {
            neighbor: 0,
            reason: format!("expected 8 bytes for the tetra count, got {}", bytes.len()),
        })?;
    let found = all_reduce_u64(comm, mine as u64, ReduceOp::Sum)?;
    if found != expected {
        return Err(ParMeshError::MergeConservation {
            expected: expected as usize,
            found: found as usize,
        });
    }
    Ok(())
}

/// Number and split the root mesh, keeping it and then its pieces charged.
fn split_root(
    budget: &mut MemoryBudget,
    mut mesh: Group,
    n: usize,
    partitioner: &dyn Partitioner,
) -> Result<Vec<Group>, ParMeshError> {
    let root = mesh.footprint();
    budget.reserve(root, "distribute")?;
    let numbered = ensure_gids(&mut mesh);
    if numbered > 0 {
        debug!("numbered {numbered} points without a global id");
    }
    let pieces = split_with(&mesh, n, partitioner).and_then(|pieces| {
        let bytes: usize = pieces.iter().map(Group::footprint).sum();
        budget.reserve(bytes, "distribute").map(|()| pieces)
    });
    budget.release(root);
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::cube_mesh;
    use crate::algs::transport::{NoComm, run_local_world};
    use crate::partitioning::Rcb;
    use crate::topology::entity::UNASSIGNED_GID;

    #[test]
    fn four_ranks_receive_their_share() {
        let total = cube_mesh(4, 2, 2).n_tetra();
        let counts = run_local_world(4, |c| {
            let mesh = (c.rank() == 0).then(|| cube_mesh(4, 2, 2));
            let mut budget = MemoryBudget::unlimited();
            let mine = distribute_centralized(&c, &mut budget, mesh, &Rcb).unwrap();
            assert_eq!(budget.current(), mine.footprint());
            mine.n_tetra()
        });
        assert_eq!(counts.iter().sum::<usize>(), total);
        assert!(counts.iter().all(|&n| n == total / 4));
    }

    #[test]
    fn missing_root_mesh_fails_everyone() {
        let out = run_local_world(2, |c| {
            distribute_centralized(&c, &mut MemoryBudget::unlimited(), None, &Rcb).map(|g| g.n_tetra())
        });
        assert!(out.iter().all(Result::is_err));
    }

    #[test]
    fn unnumbered_points_get_fresh_ids() {
        let mut g = cube_mesh(1, 1, 1);
        g.points_mut()[2].gid = UNASSIGNED_GID;
        assert_eq!(ensure_gids(&mut g), 1);
        assert_eq!(g.points()[2].gid, 9);
        let single =
            distribute_centralized(&NoComm, &mut MemoryBudget::unlimited(), Some(g.clone()), &Rcb)
                .unwrap();
        assert_eq!(single.n_tetra(), g.n_tetra());
    }

    #[test]
    fn root_mesh_is_charged_before_splitting() {
        let whole = cube_mesh(2, 2, 2).footprint();
        let out = run_local_world(2, |c| {
            let mesh = (c.rank() == 0).then(|| cube_mesh(2, 2, 2));
            let mut budget = MemoryBudget::new(whole + whole / 2);
            let res = distribute_centralized(&c, &mut budget, mesh, &Rcb);
            (res.err(), budget.current())
        });
        assert!(matches!(
            out[0].0,
            Some(ParMeshError::OutOfMemory { context: "distribute", .. })
        ));
        assert!(matches!(out[1].0, Some(ParMeshError::PeerFailure { .. })));
        assert!(out.iter().all(|&(_, used)| used == 0));
    }
}
