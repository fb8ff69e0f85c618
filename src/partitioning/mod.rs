//! Mesh partitioning and load balancing.
//!
//! A [`Partitioner`] assigns every tetrahedron of a group to a part; the
//! splitter in [`crate::algs::split`] turns that assignment into groups. The
//! [`balance`] module decides which groups move between processes.

pub mod balance;
pub mod graph_growing;
pub mod rcb;

use crate::config::PartitionPolicy;
use crate::mesh_error::ParMeshError;
use crate::topology::group::Group;

pub use graph_growing::GraphGrowing;
pub use rcb::Rcb;

pub type PartId = usize;

/// Computes a tetra-to-part assignment for one group.
pub trait Partitioner {
    /// Returns one part id in `0..nparts` per tetrahedron. Parts may be empty
    /// when the group has fewer tetrahedra than parts.
    fn partition(&self, group: &Group, nparts: usize) -> Result<Vec<PartId>, ParMeshError>;
}

/// Partitioner selected by the configuration.
pub fn partitioner_for(policy: &PartitionPolicy) -> Box<dyn Partitioner> {
    match policy {
        PartitionPolicy::GraphGrowing { seed } => Box::new(GraphGrowing::new(*seed)),
        PartitionPolicy::Rcb => Box::new(Rcb),
    }
}

/// Number of tetrahedra per part.
pub fn part_loads(parts: &[PartId], nparts: usize) -> Vec<usize> {
    let mut loads = vec![0; nparts];
    for &p in parts {
        if let Some(l) = loads.get_mut(p) {
            *l += 1;
        }
    }
    loads
}
