#![allow(dead_code)]
use parmesh::prelude::*;
use parmesh::algs::boundary::reconstruct_boundary;
use parmesh::algs::boundary::BoundaryStats;
use std::collections::HashSet;

/// Centralized input: the mesh on rank 0, nothing elsewhere.
pub fn on_root(rank: usize, mesh: impl FnOnce() -> Group) -> Vec<Group> {
    if rank == 0 { vec![mesh()] } else { Vec::new() }
}

/// Fails with `STRONG_FAILURE` on one rank, succeeds everywhere else.
pub struct FailOnRank(pub usize);

impl RemeshKernel for FailOnRank {
    fn name(&self) -> &str {
        "fail-on-rank"
    }

    fn remesh(&self, _group: &mut Group, ctx: &KernelContext<'_>) -> Outcome {
        if ctx.rank == self.0 { Outcome::StrongFailure } else { Outcome::Success }
    }
}

/// Reports `LOW_FAILURE` on one rank, succeeds everywhere else.
pub struct LowOnRank(pub usize);

impl RemeshKernel for LowOnRank {
    fn name(&self) -> &str {
        "low-on-rank"
    }

    fn remesh(&self, _group: &mut Group, ctx: &KernelContext<'_>) -> Outcome {
        if ctx.rank == self.0 { Outcome::LowFailure } else { Outcome::Success }
    }
}

/// Leaves one free face flagged interface, so the surface cannot be rebuilt.
pub struct LeakyBoundary;

impl RemeshKernel for LeakyBoundary {
    fn name(&self) -> &str {
        "leaky-boundary"
    }

    fn remesh(&self, _group: &mut Group, _ctx: &KernelContext<'_>) -> Outcome {
        Outcome::Success
    }

    fn build_boundary(
        &self,
        group: &mut Group,
        scratch: &mut MemoryBudget,
    ) -> Result<BoundaryStats, ParMeshError> {
        let adj = group.adjacency(0)?;
        if let Some((k, i)) = adj.free_faces().next() {
            group.tetras_mut()[k].faces[i].insert(FaceFlags::INTERFACE);
        }
        reconstruct_boundary(group, scratch)
    }
}

/// Shifts every interface point by an amount that depends on the rank.
pub struct Jitter;

impl RemeshKernel for Jitter {
    fn name(&self) -> &str {
        "jitter"
    }

    fn remesh(&self, group: &mut Group, ctx: &KernelContext<'_>) -> Outcome {
        let shift = 1e-4 * (ctx.rank + 1) as f64;
        for i in group.interface_points().collect::<Vec<_>>() {
            group.points_mut()[i].coords[0] += shift;
        }
        Outcome::Success
    }
}

/// No two points of `mesh` share a global id, and none is unassigned.
pub fn assert_unique_gids(mesh: &Group) {
    let mut seen = HashSet::new();
    for p in mesh.points() {
        assert_ne!(p.gid, 0, "unassigned global id");
        assert!(seen.insert(p.gid), "global id {} used twice", p.gid);
    }
}
