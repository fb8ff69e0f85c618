//! Node and face communicators.
//!
//! Interface entities of a process are numbered once in a process-wide
//! *internal* numbering. Each group maps its local interface points (faces)
//! to positions of the internal node (face) communicator. An *external*
//! communicator with a neighbouring rank is a list of internal positions; the
//! lists on both sides have the same length and are aligned entry by entry.
//!
//! Communicators are rebuilt from scratch after every topology change with
//! [`build_communicators`] and validated with [`check_communicators`].

pub mod build;
pub mod check;
pub mod detect;
pub mod sync;

pub use build::build_communicators;
pub use check::{check_communicators, check_local};
pub use detect::flag_interface;
pub use sync::resync_interface;

use crate::topology::entity::GlobalId;
use serde::Serialize;

/// One local item (point index, or face index `4 * tetra + face`) and its
/// position in the internal communicator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Slot {
    pub local: usize,
    pub position: usize,
}

/// Process-wide numbering of the interface items of all local groups.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct InternalComm {
    nitem: usize,
    per_group: Vec<Vec<Slot>>,
}

impl InternalComm {
    pub fn new(nitem: usize, per_group: Vec<Vec<Slot>>) -> Self {
        Self { nitem, per_group }
    }

    /// Number of positions.
    pub fn nitem(&self) -> usize {
        self.nitem
    }

    pub fn n_groups(&self) -> usize {
        self.per_group.len()
    }

    /// Slots of group `g`, sorted by local index.
    pub fn slots(&self, g: usize) -> &[Slot] {
        self.per_group.get(g).map(Vec::as_slice).unwrap_or(&[])
    }

    pub(crate) fn footprint(&self) -> usize {
        self.per_group
            .iter()
            .map(|s| s.len() * std::mem::size_of::<Slot>())
            .sum()
    }
}

/// Aligned list of internal positions shared with one neighbouring rank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExternalComm {
    pub peer: usize,
    pub positions: Vec<usize>,
}

impl ExternalComm {
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// The four communicators of one process.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Communicators {
    pub int_node: InternalComm,
    pub int_face: InternalComm,
    /// One per neighbouring rank, ordered by rank.
    pub ext_node: Vec<ExternalComm>,
    pub ext_face: Vec<ExternalComm>,
    /// Global id of every internal node position.
    pub node_gids: Vec<GlobalId>,
    /// Sorted global ids of every internal face position.
    pub face_keys: Vec<[GlobalId; 3]>,
    /// `(group, face index)` of interface faces that lost to a coincident
    /// candidate and are in no communicator.
    pub superseded_faces: Vec<(usize, usize)>,
}

impl Communicators {
    pub fn ext_node_with(&self, peer: usize) -> Option<&ExternalComm> {
        self.ext_node.iter().find(|c| c.peer == peer)
    }

    pub fn ext_face_with(&self, peer: usize) -> Option<&ExternalComm> {
        self.ext_face.iter().find(|c| c.peer == peer)
    }

    /// Global ids of the points shared with other ranks.
    pub fn shared_node_gids(&self) -> impl Iterator<Item = GlobalId> + '_ {
        self.ext_node
            .iter()
            .flat_map(|c| c.positions.iter().map(|&p| self.node_gids[p]))
    }

    /// Face keys of the faces shared with other ranks.
    pub fn shared_face_keys(&self) -> impl Iterator<Item = [GlobalId; 3]> + '_ {
        self.ext_face
            .iter()
            .flat_map(|c| c.positions.iter().map(|&p| self.face_keys[p]))
    }

    /// Bytes these communicators charge against the memory budget.
    pub fn footprint(&self) -> usize {
        let ext: usize = self
            .ext_node
            .iter()
            .chain(&self.ext_face)
            .map(|c| c.len() * std::mem::size_of::<usize>())
            .sum();
        self.int_node.footprint()
            + self.int_face.footprint()
            + ext
            + self.node_gids.len() * std::mem::size_of::<GlobalId>()
            + self.face_keys.len() * std::mem::size_of::<[GlobalId; 3]>()
            + self.superseded_faces.len() * std::mem::size_of::<(usize, usize)>()
    }
}
