//! The parallel remeshing driver.
//!
//! A run walks a fixed state machine, identical on every process:
//!
//! ```text
//! DISTRIBUTE -> BALANCE -> REMESH_LOCAL -> REBUILD_COMM -> CHECK_CONVERGED
//!                  ^                                            |
//!                  +------------------ not converged -----------+
//!                                                               | converged
//!                  MERGE_TO_ROOT <------------------------------+
//!                        |
//!                  RECONSTRUCT_BOUNDARY -> DONE
//! ```
//!
//! Any phase may end in `FAILED`, which is absorbing. Every phase ends with a
//! reduction of its outcome over all processes, so either all processes move
//! on or all of them fail together. A low failure downgrades the run and lets
//! it continue; a strong failure releases every group and communicator and
//! stops the run on every process.

use crate::algs::collective::{ReduceOp, agree, all_reduce_u64, reduce_outcome};
use crate::algs::distribute::distribute_centralized;
use crate::algs::merge::{InterfacePolicy, merge_groups, merge_to_root};
use crate::algs::preprocess::{check_input, preprocess_all};
use crate::algs::transport::Transport;
use crate::config::{InputMode, ParMeshConfig};
use crate::debug_invariants::DebugInvariants;
use crate::geometry::quality::QualitySummary;
use crate::interface::{flag_interface, resync_interface};
use crate::kernel::{KernelContext, RemeshKernel};
use crate::memory::MemoryBudget;
use crate::mesh_error::{Outcome, ParMeshError, outcome_of};
use crate::partitioning::balance::{BalanceReport, rebalance};
use crate::partitioning::partitioner_for;
use crate::topology::entity::{GlobalId, UNASSIGNED_GID};
use crate::topology::group::Group;
use crate::topology::parmesh::ParMesh;
use hashbrown::{HashMap, HashSet};
use log::{Level, debug, log, warn};
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Distribute,
    Balance,
    RemeshLocal,
    RebuildComm,
    CheckConverged,
    MergeToRoot,
    ReconstructBoundary,
    Done,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }

    /// The phase after a successful `self`. `converged` is only read after
    /// `Distribute` (an empty iteration budget skips the loop) and
    /// `CheckConverged`.
    pub fn successor(self, converged: bool) -> Phase {
        match self {
            Phase::Distribute | Phase::CheckConverged if converged => Phase::MergeToRoot,
            Phase::Distribute | Phase::CheckConverged => Phase::Balance,
            Phase::Balance => Phase::RemeshLocal,
            Phase::RemeshLocal => Phase::RebuildComm,
            Phase::RebuildComm => Phase::CheckConverged,
            Phase::MergeToRoot => Phase::ReconstructBoundary,
            Phase::ReconstructBoundary | Phase::Done => Phase::Done,
            Phase::Failed => Phase::Failed,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Distribute => "DISTRIBUTE",
            Phase::Balance => "BALANCE",
            Phase::RemeshLocal => "REMESH_LOCAL",
            Phase::RebuildComm => "REBUILD_COMM",
            Phase::CheckConverged => "CHECK_CONVERGED",
            Phase::MergeToRoot => "MERGE_TO_ROOT",
            Phase::ReconstructBoundary => "RECONSTRUCT_BOUNDARY",
            Phase::Done => "DONE",
            Phase::Failed => "FAILED",
        };
        f.pad(s)
    }
}

/// One line of the phase trace.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub iteration: usize,
    pub outcome: Outcome,
    pub elapsed: Duration,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub outcome: Outcome,
    /// Completed remesh iterations.
    pub iterations: usize,
    pub phases: Vec<PhaseRecord>,
    pub balance: Vec<BalanceReport>,
    /// Tetra count of the merged mesh, on rank 0.
    pub n_tetra_final: Option<usize>,
    pub comm_check_failures: usize,
    /// Quality of the merged mesh, on rank 0.
    pub quality: Option<QualitySummary>,
    /// Spare bytes handed to boundary reconstruction once the communicators
    /// are gone.
    pub boundary_memory: usize,
    /// The error that stopped the run, as seen by this process.
    pub error: Option<String>,
}

/// Releases every group and communicator of the context unless disarmed.
struct ReleaseGuard<'a, C: Transport> {
    pm: &'a mut ParMesh<C>,
    armed: bool,
}

impl<'a, C: Transport> ReleaseGuard<'a, C> {
    fn new(pm: &'a mut ParMesh<C>) -> Self {
        Self { pm, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<C: Transport> Deref for ReleaseGuard<'_, C> {
    type Target = ParMesh<C>;
    fn deref(&self) -> &ParMesh<C> {
        self.pm
    }
}

impl<C: Transport> DerefMut for ReleaseGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut ParMesh<C> {
        self.pm
    }
}

impl<C: Transport> Drop for ReleaseGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.pm.release_all();
        }
    }
}

/// Everything a run carries besides the context itself.
struct RunState<'k> {
    config: ParMeshConfig,
    kernel: &'k dyn RemeshKernel,
    iteration: usize,
    converged: bool,
    /// Worst non-fatal outcome so far.
    outcome: Outcome,
    report: RunReport,
    /// Spare memory handed over to boundary reconstruction.
    scratch: MemoryBudget,
}

pub struct Driver<'k, C: Transport> {
    pm: ParMesh<C>,
    state: RunState<'k>,
}

impl<'k, C: Transport> Driver<'k, C> {
    /// The kernel is chosen once, here, and used for every group of the run.
    pub fn new(comm: C, config: ParMeshConfig, kernel: &'k dyn RemeshKernel) -> Self {
        let memory = config
            .mem_glo_max
            .map_or_else(MemoryBudget::unlimited, MemoryBudget::new);
        Self {
            pm: ParMesh::new(comm, memory),
            state: RunState {
                config,
                kernel,
                iteration: 0,
                converged: false,
                outcome: Outcome::Success,
                report: RunReport::default(),
                scratch: MemoryBudget::new(0),
            },
        }
    }

    pub fn config(&self) -> &ParMeshConfig {
        &self.state.config
    }

    pub fn parmesh(&self) -> &ParMesh<C> {
        &self.pm
    }

    pub fn report(&self) -> &RunReport {
        &self.state.report
    }

    /// The merged mesh, on rank 0 after a run that reached `DONE`.
    pub fn mesh(&self) -> Option<&Group> {
        let last = self.state.report.phases.last()?;
        (last.phase == Phase::ReconstructBoundary && self.state.report.error.is_none())
            .then(|| self.pm.group(0))
            .flatten()
    }

    /// Take the merged mesh out of the driver.
    pub fn into_mesh(mut self) -> Option<Group> {
        self.mesh()?;
        self.pm.take_groups().pop()
    }

    /// Run the whole state machine. Collective: every process calls `run`
    /// with its input. In centralized mode rank 0 passes the mesh and the
    /// other ranks pass nothing; in distributed mode every rank passes its
    /// own groups.
    pub fn run(&mut self, input: Vec<Group>) -> Outcome {
        let Driver { pm, state } = self;
        let mut pm = ReleaseGuard::new(pm);
        let mut input = Some(input);
        state.converged = state.config.niter == 0;
        let mut phase = Phase::Distribute;
        let mut failure = None;

        while !phase.is_terminal() {
            let start = Instant::now();
            let res = state.step(phase, &mut *pm, &mut input);
            let outcome = match &res {
                Ok(o) => *o,
                Err(e) => e.outcome(),
            };
            let elapsed = start.elapsed();
            state.trace(phase, outcome, elapsed);
            phase = match res {
                Ok(_) => phase.successor(state.converged),
                Err(e) => {
                    if matches!(e, ParMeshError::CommCheck { .. }) {
                        state.report.comm_check_failures += 1;
                    }
                    warn!("rank {}: {phase} failed: {e}", pm.rank());
                    failure = Some(e);
                    Phase::Failed
                }
            };
        }

        let outcome = match &failure {
            Some(e) => e.outcome().worst(Outcome::LowFailure),
            None => {
                pm.disarm();
                state.outcome
            }
        };
        state.report.outcome = outcome;
        state.report.iterations = state.iteration;
        state.report.error = failure.map(|e| e.to_string());
        log!(
            state.level(),
            "rank {}: run finished with {outcome} after {} iterations",
            pm.rank(),
            state.iteration
        );
        outcome
    }
}

impl RunState<'_> {
    fn level(&self) -> Level {
        if self.config.verbose { Level::Info } else { Level::Debug }
    }

    fn trace(&mut self, phase: Phase, outcome: Outcome, elapsed: Duration) {
        log!(
            self.level(),
            "  {phase:<22} iter {:>2}  {outcome:<14} {elapsed:.2?}",
            self.iteration
        );
        self.report.phases.push(PhaseRecord {
            phase,
            iteration: self.iteration,
            outcome,
            elapsed,
        });
    }

    /// Run one phase. `Ok` carries the reduced outcome of a phase that may
    /// continue; `Err` sends the run to `FAILED`.
    fn step<C: Transport>(
        &mut self,
        phase: Phase,
        pm: &mut ParMesh<C>,
        input: &mut Option<Vec<Group>>,
    ) -> Result<Outcome, ParMeshError> {
        match phase {
            Phase::Distribute => self.distribute(pm, input.take().unwrap_or_default()),
            Phase::Balance => {
                let report = rebalance(pm, &self.config)?;
                self.report.balance.push(report);
                Ok(Outcome::Success)
            }
            Phase::RemeshLocal => self.remesh_local(pm),
            Phase::RebuildComm => {
                pm.rebuild_communicators(self.config.geometric_tolerance)?;
                pm.debug_assert_invariants();
                agree(pm.comm(), pm.check_memory())?;
                Ok(Outcome::Success)
            }
            Phase::CheckConverged => self.check_converged(pm),
            Phase::MergeToRoot => self.merge_to_root(pm),
            Phase::ReconstructBoundary => self.reconstruct_boundary(pm),
            Phase::Done | Phase::Failed => Ok(self.outcome),
        }
    }

    fn distribute<C: Transport>(
        &mut self,
        pm: &mut ParMesh<C>,
        mut groups: Vec<Group>,
    ) -> Result<Outcome, ParMeshError> {
        let cfg = &self.config;
        agree(pm.comm(), cfg.validate())?;
        check_input(pm.comm(), &mut groups, &cfg.remesh)?;
        agree(pm.comm(), preprocess_all(&mut groups, &cfg.remesh))?;

        match cfg.mode {
            InputMode::Centralized => {
                let mesh = agree(pm.comm(), root_mesh(pm.rank(), groups, cfg.geometric_tolerance))?;
                let partitioner = partitioner_for(&cfg.partition);
                let (comm, memory) = pm.comm_and_memory_mut();
                let mine = distribute_centralized(comm, memory, mesh, partitioner.as_ref())?;
                let reserved = mine.footprint();
                let kept = pm.push_reserved(mine, reserved).map(|_| ());
                agree(pm.comm(), kept)?;
            }
            InputMode::Distributed => {
                agree(pm.comm(), require_gids(&groups))?;
                flag_interface(pm.comm(), &mut groups)?;
                let kept = pm.set_groups(groups);
                agree(pm.comm(), kept)?;
            }
        }
        pm.rebuild_communicators(cfg.geometric_tolerance)?;
        agree(pm.comm(), pm.check_memory())?;
        debug!("rank {}: {} tetra after distribution", pm.rank(), pm.n_tetra());
        Ok(Outcome::Success)
    }

    fn remesh_local<C: Transport>(&mut self, pm: &mut ParMesh<C>) -> Result<Outcome, ParMeshError> {
        let previous = pm.communicators("remesh_local").cloned();
        let local = previous.and_then(|prev| {
            remesh_groups(pm, self.kernel, &self.config).map(|o| (o, prev))
        });
        let (local, previous) = agree(pm.comm(), local)?;
        let outcome = reduce_outcome(pm.comm(), local)?;
        self.outcome = self.outcome.worst(outcome);

        if self.config.interface_motion {
            let (comm, groups) = pm.comm_and_groups_mut();
            resync_interface(comm, groups, &previous)?;
        }
        number_new_points(pm)?;
        let charged = pm.recharge();
        agree(pm.comm(), charged)?;
        Ok(outcome)
    }

    fn check_converged<C: Transport>(&mut self, pm: &mut ParMesh<C>) -> Result<Outcome, ParMeshError> {
        self.iteration += 1;
        let kernel = self.kernel;
        let pending = pm
            .groups()
            .iter()
            .filter(|g| kernel.needs_adaptation(g, &self.config.remesh))
            .count();
        let pending = all_reduce_u64(pm.comm(), pending as u64, ReduceOp::Sum)?;
        let n_tetra = all_reduce_u64(pm.comm(), pm.n_tetra() as u64, ReduceOp::Sum)?;
        let quality = pm
            .groups()
            .iter()
            .map(|g| kernel.quality(g))
            .fold(QualitySummary::default(), QualitySummary::combine);
        log!(
            self.level(),
            "rank {}: iteration {}: {n_tetra} tetra overall, {pending} groups to adapt, local quality min {:.4} mean {:.4}",
            pm.rank(),
            self.iteration,
            quality.min,
            quality.mean
        );
        self.converged = pending == 0 || self.iteration >= self.config.niter;
        Ok(Outcome::Success)
    }

    fn merge_to_root<C: Transport>(&mut self, pm: &mut ParMesh<C>) -> Result<Outcome, ParMeshError> {
        let groups = pm.take_groups();
        let (comm, memory) = pm.comm_and_memory_mut();
        let merged = merge_to_root(comm, memory, groups, self.config.geometric_tolerance)?;
        let kept = match merged {
            Some(mesh) => {
                let reserved = mesh.footprint();
                pm.push_reserved(mesh, reserved).map(|_| ())
            }
            None => Ok(()),
        };
        agree(pm.comm(), kept)?;
        pm.invalidate_communicators();
        let scratch = pm.memory_mut().devote_remaining();
        self.report.boundary_memory = scratch.max();
        self.scratch = scratch;
        debug!(
            "rank {}: {} bytes devoted to boundary reconstruction",
            pm.rank(),
            self.report.boundary_memory
        );
        Ok(Outcome::Success)
    }

    fn reconstruct_boundary<C: Transport>(
        &mut self,
        pm: &mut ParMesh<C>,
    ) -> Result<Outcome, ParMeshError> {
        let kernel = self.kernel;
        let res = match pm.group_mut(0) {
            Some(mesh) => kernel.build_boundary(mesh, &mut self.scratch).map(|_| ()),
            None => Ok(()),
        };
        if let Err(e) = &res {
            warn!("rank {}: {e}; the interior mesh is kept", pm.rank());
        }
        let outcome = reduce_outcome(pm.comm(), outcome_of(&res))?;
        if let Some(mesh) = pm.group(0) {
            self.report.n_tetra_final = Some(mesh.n_tetra());
            self.report.quality = Some(kernel.quality(mesh));
        }
        match outcome {
            Outcome::StrongFailure => Err(res.err().unwrap_or(ParMeshError::PeerFailure { outcome })),
            _ => {
                self.outcome = self.outcome.worst(outcome);
                Ok(outcome)
            }
        }
    }
}

/// The single mesh rank 0 distributes; several input groups are merged.
fn root_mesh(rank: usize, groups: Vec<Group>, tolerance: f64) -> Result<Option<Group>, ParMeshError> {
    if rank != 0 {
        if !groups.is_empty() {
            warn!("rank {rank}: centralized input ignores the groups given on this rank");
        }
        return Ok(None);
    }
    match groups.len() {
        0 => Err(ParMeshError::InvalidConfig(
            "centralized input requires a mesh on rank 0".into(),
        )),
        1 => Ok(groups.into_iter().next()),
        _ => merge_groups(groups, InterfacePolicy::ClearAll, tolerance).map(Some),
    }
}

fn require_gids(groups: &[Group]) -> Result<(), ParMeshError> {
    for (g, group) in groups.iter().enumerate() {
        if let Some(i) = group.points().iter().position(|p| p.gid == UNASSIGNED_GID) {
            return Err(ParMeshError::InvalidConfig(format!(
                "distributed input: point {i} of group {g} has no global id"
            )));
        }
    }
    Ok(())
}

/// Run the kernel on every group. Fixed interface points are checked against
/// their snapshot and restored bit for bit, so scaling round-off never
/// reaches the communicators.
fn remesh_groups<C: Transport>(
    pm: &mut ParMesh<C>,
    kernel: &dyn RemeshKernel,
    cfg: &ParMeshConfig,
) -> Result<Outcome, ParMeshError> {
    let rank = pm.rank();
    let fixed = !cfg.interface_motion;
    let tol2 = cfg.geometric_tolerance * cfg.geometric_tolerance;
    let mut worst = Outcome::Success;
    for (g, group) in pm.groups_mut().iter_mut().enumerate() {
        let snapshot = fixed.then(|| group.interface_snapshot());
        let ctx = KernelContext {
            rank,
            group: g,
            options: &cfg.remesh,
            interface_fixed: fixed,
        };
        let info = kernel.scale(group);
        let outcome = kernel.remesh(group, &ctx);
        kernel.unscale(group, &info);
        debug!("rank {rank} group {g}: {} returned {outcome}", kernel.name());
        if outcome == Outcome::StrongFailure {
            return Err(ParMeshError::Kernel { group: g, outcome });
        }
        worst = worst.worst(outcome);
        if let Some(before) = snapshot {
            restore_interface(group, &before, tol2)?;
        }
    }
    Ok(worst)
}

fn restore_interface(
    group: &mut Group,
    before: &[(GlobalId, [f64; 3])],
    tol2: f64,
) -> Result<(), ParMeshError> {
    let after: HashSet<GlobalId> = group.interface_points().map(|i| group.points()[i].gid).collect();
    if let Some(&(gid, _)) = before.iter().find(|(gid, _)| !after.contains(gid)) {
        return Err(ParMeshError::InterfaceMoved { gid });
    }
    let by_gid: HashMap<GlobalId, [f64; 3]> = before.iter().copied().collect();
    for p in group.points_mut().iter_mut().filter(|p| p.is_interface()) {
        let Some(&c) = by_gid.get(&p.gid) else {
            return Err(ParMeshError::InterfaceMoved { gid: p.gid });
        };
        let d2: f64 = (0..3).map(|d| (p.coords[d] - c[d]).powi(2)).sum();
        if d2 > tol2 {
            return Err(ParMeshError::InterfaceMoved { gid: p.gid });
        }
        p.coords = c;
    }
    Ok(())
}

/// Give the points created by the kernel global ids unique across all
/// processes: above the global maximum, strided by rank. Collective.
fn number_new_points<C: Transport>(pm: &mut ParMesh<C>) -> Result<(), ParMeshError> {
    let local_max = pm.groups().iter().map(Group::max_gid).max().unwrap_or(0);
    let base = all_reduce_u64(pm.comm(), local_max, ReduceOp::Max)? + 1;
    let (rank, size) = (pm.rank() as u64, pm.nprocs() as u64);
    let mut assigned = 0u64;
    for group in pm.groups_mut() {
        assigned += group.assign_fresh_gids(base + assigned * size, rank, size) as u64;
    }
    if assigned > 0 {
        debug!("rank {rank}: numbered {assigned} new points from {base}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::cube_mesh;
    use crate::algs::transport::NoComm;
    use crate::kernel::{CentroidSplitKernel, IdentityKernel};
    use crate::geometry::metric::Metric;

    #[test]
    fn state_machine_transitions() {
        assert_eq!(Phase::Distribute.successor(false), Phase::Balance);
        assert_eq!(Phase::Distribute.successor(true), Phase::MergeToRoot);
        assert_eq!(Phase::CheckConverged.successor(false), Phase::Balance);
        assert_eq!(Phase::CheckConverged.successor(true), Phase::MergeToRoot);
        assert_eq!(Phase::ReconstructBoundary.successor(false), Phase::Done);
        assert_eq!(Phase::Failed.successor(true), Phase::Failed);
        assert!(Phase::Done.is_terminal() && Phase::Failed.is_terminal());
    }

    #[test]
    fn serial_identity_run() {
        let mesh = cube_mesh(2, 2, 2);
        let kernel = IdentityKernel;
        let mut d = Driver::new(NoComm, ParMeshConfig::default(), &kernel);
        assert_eq!(d.run(vec![mesh.clone()]), Outcome::Success);
        let out = d.mesh().unwrap();
        assert_eq!(out.n_tetra(), mesh.n_tetra());
        assert_eq!(out.interface_points().count(), 0);
        // converged after the first pass
        assert_eq!(d.report().iterations, 1);
        assert_eq!(d.report().phases.last().unwrap().phase, Phase::ReconstructBoundary);
    }

    #[test]
    fn serial_refinement_converges() {
        let mesh = cube_mesh(1, 1, 1).with_metric(Metric::constant(8, 0.35));
        let kernel = CentroidSplitKernel;
        let cfg = ParMeshConfig { niter: 10, ..Default::default() };
        let mut d = Driver::new(NoComm, cfg, &kernel);
        assert_eq!(d.run(vec![mesh]), Outcome::Success);
        let report = d.report().clone();
        assert!(report.iterations < 10);
        let out = d.into_mesh().unwrap();
        assert!(out.n_tetra() > 6);
        assert!(out.points().iter().all(|p| p.gid != UNASSIGNED_GID));
        assert!((out.volume() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn invalid_options_never_start_the_loop() {
        let kernel = IdentityKernel;
        let mut cfg = ParMeshConfig::default();
        cfg.remesh.iso = true;
        let mut d = Driver::new(NoComm, cfg, &kernel);
        assert_eq!(d.run(vec![cube_mesh(1, 1, 1)]), Outcome::LowFailure);
        assert_eq!(d.report().phases.len(), 1);
        assert!(d.mesh().is_none());
        assert_eq!(d.parmesh().n_groups(), 0);
    }

    #[test]
    fn empty_budget_skips_the_loop() {
        let kernel = IdentityKernel;
        let cfg = ParMeshConfig { niter: 0, ..Default::default() };
        let mut d = Driver::new(NoComm, cfg, &kernel);
        assert_eq!(d.run(vec![cube_mesh(1, 1, 1)]), Outcome::Success);
        let phases: Vec<Phase> = d.report().phases.iter().map(|r| r.phase).collect();
        assert_eq!(
            phases,
            vec![Phase::Distribute, Phase::MergeToRoot, Phase::ReconstructBoundary]
        );
    }

    #[test]
    fn report_serializes() {
        let kernel = IdentityKernel;
        let mut d = Driver::new(NoComm, ParMeshConfig::default(), &kernel);
        d.run(vec![cube_mesh(1, 1, 1)]);
        let json = serde_json::to_string(d.report()).unwrap();
        assert!(json.contains("\"outcome\":\"Success\""));
    }
}
