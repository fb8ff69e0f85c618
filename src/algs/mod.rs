//! Parallel algorithms: transport and collectives, wire format, split and
//! merge, distribution, input preprocessing and boundary reconstruction.

pub mod boundary;
pub mod collective;
pub mod distribute;
pub mod merge;
pub mod meshgen;
pub mod preprocess;
pub mod split;
pub mod transport;
pub mod wire;

pub use collective::{agree, reduce_outcome};
pub use merge::{InterfacePolicy, merge_groups, merge_to_root};
pub use split::{split_group, split_with};
pub use transport::{CommTag, LocalComm, NoComm, Transport, Wait, run_local_world};
