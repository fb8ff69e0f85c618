//! The per-process context of a parallel remeshing run.
//!
//! A [`ParMesh`] owns the transport handle, the groups this process holds,
//! their communicators and the memory budget every footprint is charged to.
//! Any change to the group list or to a group's arrays marks the
//! communicators stale; reading stale communicators is an error until they
//! are rebuilt.

use crate::algs::collective::agree;
use crate::algs::transport::Transport;
use crate::debug_invariants::DebugInvariants;
use crate::interface::Communicators;
use crate::memory::MemoryBudget;
use crate::mesh_error::ParMeshError;
use crate::topology::group::Group;
use log::debug;

pub struct ParMesh<C: Transport> {
    comm: C,
    groups: Vec<Group>,
    /// Footprint charged for each group, same order as `groups`.
    charged: Vec<usize>,
    comms: Option<Communicators>,
    comms_charged: usize,
    memory: MemoryBudget,
}

impl<C: Transport> std::fmt::Debug for ParMesh<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParMesh")
            .field("rank", &self.comm.rank())
            .field("nprocs", &self.comm.size())
            .field("groups", &self.groups.len())
            .field("communicators", &self.comms.is_some())
            .field("memory", &self.memory)
            .finish()
    }
}

impl<C: Transport> ParMesh<C> {
    pub fn new(comm: C, memory: MemoryBudget) -> Self {
        Self {
            comm,
            groups: Vec::new(),
            charged: Vec::new(),
            comms: None,
            comms_charged: 0,
            memory,
        }
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn nprocs(&self) -> usize {
        self.comm.size()
    }

    pub fn memory(&self) -> &MemoryBudget {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemoryBudget {
        &mut self.memory
    }

    /// The transport together with the budget, for collectives that reserve
    /// memory before they allocate.
    pub fn comm_and_memory_mut(&mut self) -> (&C, &mut MemoryBudget) {
        (&self.comm, &mut self.memory)
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    pub fn n_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn group(&self, g: usize) -> Option<&Group> {
        self.groups.get(g)
    }

    /// Mutable access to one group. Communicators become stale and the
    /// footprint must be settled with [`ParMesh::recharge`].
    pub fn group_mut(&mut self, g: usize) -> Option<&mut Group> {
        self.invalidate_communicators();
        self.groups.get_mut(g)
    }

    /// All groups, mutably; same contract as [`ParMesh::group_mut`].
    pub fn groups_mut(&mut self) -> &mut [Group] {
        self.invalidate_communicators();
        &mut self.groups
    }

    /// The transport together with the groups, for collectives that edit
    /// groups in place; same contract as [`ParMesh::group_mut`].
    pub fn comm_and_groups_mut(&mut self) -> (&C, &mut [Group]) {
        self.invalidate_communicators();
        (&self.comm, &mut self.groups)
    }

    pub fn n_tetra(&self) -> usize {
        self.groups.iter().map(Group::n_tetra).sum()
    }

    /// Add a group, charging its footprint.
    pub fn push_group(&mut self, group: Group) -> Result<usize, ParMeshError> {
        let bytes = group.footprint();
        self.memory.reserve(bytes, "push_group")?;
        self.invalidate_communicators();
        self.groups.push(group);
        self.charged.push(bytes);
        Ok(self.groups.len() - 1)
    }

    /// Add a group whose memory was reserved up front as `reserved` bytes; the
    /// reservation is settled to the group's footprint.
    pub fn push_reserved(&mut self, group: Group, reserved: usize) -> Result<usize, ParMeshError> {
        let bytes = group.footprint();
        self.memory.resize(reserved, bytes, "push_group")?;
        self.invalidate_communicators();
        self.groups.push(group);
        self.charged.push(bytes);
        Ok(self.groups.len() - 1)
    }

    /// Replace the group list. On failure nothing is kept.
    pub fn set_groups(&mut self, groups: Vec<Group>) -> Result<(), ParMeshError> {
        drop(self.take_groups());
        for g in groups {
            if let Err(e) = self.push_group(g) {
                drop(self.take_groups());
                return Err(e);
            }
        }
        Ok(())
    }

    /// Remove every group, releasing its footprint.
    pub fn take_groups(&mut self) -> Vec<Group> {
        self.invalidate_communicators();
        for bytes in self.charged.drain(..) {
            self.memory.release(bytes);
        }
        std::mem::take(&mut self.groups)
    }

    /// Settle the charged footprints after in-place changes.
    pub fn recharge(&mut self) -> Result<(), ParMeshError> {
        for (g, charged) in self.groups.iter().zip(self.charged.iter_mut()) {
            let now = g.footprint();
            self.memory.resize(*charged, now, "recharge")?;
            *charged = now;
        }
        Ok(())
    }

    /// Current communicators, or an error when they are stale.
    pub fn communicators(&self, reader: &'static str) -> Result<&Communicators, ParMeshError> {
        self.comms
            .as_ref()
            .ok_or(ParMeshError::StaleCommunicators(reader))
    }

    pub fn has_communicators(&self) -> bool {
        self.comms.is_some()
    }

    pub fn set_communicators(&mut self, comms: Communicators) -> Result<(), ParMeshError> {
        self.invalidate_communicators();
        let bytes = comms.footprint();
        self.memory.reserve(bytes, "communicators")?;
        self.comms = Some(comms);
        self.comms_charged = bytes;
        Ok(())
    }

    pub fn invalidate_communicators(&mut self) {
        if self.comms.take().is_some() {
            self.memory.release(self.comms_charged);
            self.comms_charged = 0;
        }
    }

    /// Rebuild and check the communicators of the current groups. Collective.
    pub fn rebuild_communicators(&mut self, tolerance: f64) -> Result<(), ParMeshError> {
        self.invalidate_communicators();
        let comms = crate::interface::build_communicators(&self.comm, &self.groups)?;
        crate::interface::check_communicators(&self.comm, &self.groups, &comms, tolerance)?;
        let kept = self.set_communicators(comms);
        agree(&self.comm, kept)
    }

    /// The usage of the context and of its groups must fit the process ceiling.
    pub fn check_memory(&self) -> Result<(), ParMeshError> {
        let tracked: usize = self.charged.iter().sum::<usize>() + self.comms_charged;
        if tracked > self.memory.current() {
            return Err(ParMeshError::OutOfMemory {
                context: "check_memory",
                requested: tracked,
                current: self.memory.current(),
                max: self.memory.max(),
            });
        }
        self.memory.check_cur_and_max(std::iter::empty(), "check_memory")
    }

    /// Free every group and communicator.
    pub fn release_all(&mut self) {
        let n = self.groups.len();
        drop(self.take_groups());
        debug!("rank {}: released {n} groups", self.rank());
    }
}

impl<C: Transport> DebugInvariants for ParMesh<C> {
    fn validate_invariants(&self) -> Result<(), ParMeshError> {
        for (g, group) in self.groups.iter().enumerate() {
            group.validate_invariants().map_err(|e| match e {
                ParMeshError::InvalidTetra { tetra, reason, .. } => ParMeshError::InvalidTetra {
                    group: g,
                    tetra,
                    reason,
                },
                other => other,
            })?;
        }
        if let Some(comms) = &self.comms {
            crate::interface::check_local(&self.groups, comms)?;
        }
        self.check_memory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::meshgen::cube_mesh;
    use crate::algs::transport::NoComm;

    #[test]
    fn footprints_are_charged_and_released() {
        let mut pm = ParMesh::new(NoComm, MemoryBudget::unlimited());
        let g = cube_mesh(2, 2, 2);
        let bytes = g.footprint();
        pm.push_group(g.clone()).unwrap();
        pm.push_group(g).unwrap();
        assert_eq!(pm.memory().current(), 2 * bytes);
        pm.release_all();
        assert_eq!(pm.memory().current(), 0);
        assert_eq!(pm.n_groups(), 0);
    }

    #[test]
    fn reserved_groups_settle_to_their_footprint() {
        let g = cube_mesh(2, 2, 2);
        let bytes = g.footprint();
        let mut pm = ParMesh::new(NoComm, MemoryBudget::new(2 * bytes));
        let (_, memory) = pm.comm_and_memory_mut();
        memory.reserve(2 * bytes, "upper bound").unwrap();
        pm.push_reserved(g, 2 * bytes).unwrap();
        assert_eq!(pm.memory().current(), bytes);
        pm.release_all();
        assert_eq!(pm.memory().current(), 0);
    }

    #[test]
    fn hard_cap_refuses_groups() {
        let g = cube_mesh(2, 2, 2);
        let mut pm = ParMesh::new(NoComm, MemoryBudget::new(g.footprint() + 10));
        pm.push_group(g.clone()).unwrap();
        assert!(matches!(
            pm.push_group(g),
            Err(ParMeshError::OutOfMemory { .. })
        ));
        assert_eq!(pm.n_groups(), 1);
    }

    #[test]
    fn stale_communicators_are_never_read() {
        let mut pm = ParMesh::new(NoComm, MemoryBudget::unlimited());
        pm.push_group(cube_mesh(1, 1, 1)).unwrap();
        pm.rebuild_communicators(1e-12).unwrap();
        assert!(pm.communicators("test").is_ok());
        pm.group_mut(0).unwrap().points_mut()[0].coords[0] = 0.1;
        assert!(matches!(
            pm.communicators("test"),
            Err(ParMeshError::StaleCommunicators("test"))
        ));
    }
}
