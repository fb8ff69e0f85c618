//! Mesh topology: entities, groups and the per-process context.
//!
//! - [`entity`]: points, tetrahedra, their flags and the local face tables
//! - [`adjacency`]: tetra-to-tetra face adjacency of one group
//! - [`group`]: a self-contained sub-mesh with its metric
//! - [`parmesh`]: the groups, communicators and memory budget of one process

pub mod adjacency;
pub mod entity;
pub mod group;
pub mod parmesh;

pub use entity::{FaceFlags, GlobalId, Point, PointFlags, Tetra, UNASSIGNED_GID};
pub use group::Group;
pub use parmesh::ParMesh;
