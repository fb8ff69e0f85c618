#![cfg_attr(docsrs, feature(doc_cfg))]
//! # parmesh
//!
//! parmesh drives parallel tetrahedral remeshing over a fixed set of
//! processes. Each process owns one or more *groups* (self-contained
//! sub-meshes with an optional sizing metric); neighbouring groups agree on
//! their shared *interface* through node and face communicators. The driver
//! distributes the input, balances the load, lets a pluggable local kernel
//! remesh every group, rebuilds and checks the communicators, and finally
//! merges everything back into one mesh on rank 0.
//!
//! ## Features
//! - Group model with global point ids, interface and boundary flags
//! - Internal and external node/face communicators with symmetric ordering
//! - Split and merge of groups, locally and across processes
//! - Graph-growing and coordinate-bisection partitioners, greedy load balancer
//! - Pluggable transport backends: single process, in-process threads
//!   (`LocalComm`, used to simulate several ranks) and MPI
//! - Fail-together outcome reduction after every phase
//!
//! ## Determinism
//!
//! Randomized decisions use `SmallRng` seeds drawn from configuration so runs
//! are reproducible. Communicator order is derived from sorted global ids, so
//! both sides of an interface agree without negotiation.
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! parmesh = "0.1"
//! # features = ["mpi-support"]
//! ```
//!
//! ```no_run
//! use parmesh::prelude::*;
//!
//! let outcomes = run_local_world(4, |comm| {
//!     let input = if comm.rank() == 0 { vec![cube_mesh(5, 5, 7)] } else { Vec::new() };
//!     let kernel = IdentityKernel;
//!     let mut driver = Driver::new(comm, ParMeshConfig::default(), &kernel);
//!     driver.run(input)
//! });
//! assert!(outcomes.iter().all(|o| *o == Outcome::Success));
//! ```

pub mod algs;
pub mod config;
pub mod debug_invariants;
pub mod driver;
pub mod geometry;
pub mod interface;
pub mod kernel;
pub mod memory;
pub mod mesh_error;
pub mod partitioning;
pub mod topology;

pub use debug_invariants::DebugInvariants;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::meshgen::{box_mesh, cube_mesh};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::transport::MpiComm;
    pub use crate::algs::transport::{LocalComm, NoComm, Transport, run_local_world};
    pub use crate::config::{
        BalancePolicy, InputMode, ParMeshConfig, PartitionPolicy, RemeshOptions, WeightPolicy,
    };
    pub use crate::debug_invariants::DebugInvariants;
    pub use crate::driver::{Driver, Phase, RunReport};
    pub use crate::geometry::{Metric, MetricKind, QualitySummary};
    pub use crate::interface::Communicators;
    pub use crate::kernel::{CentroidSplitKernel, IdentityKernel, KernelContext, RemeshKernel};
    pub use crate::memory::MemoryBudget;
    pub use crate::mesh_error::{Outcome, ParMeshError};
    pub use crate::partitioning::{GraphGrowing, Partitioner, Rcb};
    pub use crate::topology::entity::{FaceFlags, GlobalId, Point, PointFlags, Tetra};
    pub use crate::topology::group::Group;
    pub use crate::topology::parmesh::ParMesh;
}
