//! ParMeshError: unified error type for the parallel remeshing subsystem
//!
//! Every public operation returns `Result<_, ParMeshError>`. Each variant knows
//! which process-level [`Outcome`] it maps to, so the driver can reduce local
//! failures across the process set without inspecting error details.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Process-level outcome code, ordered from best to worst.
///
/// The numeric values are what travels through the all-reduce of a phase
/// boundary, so `MAX` over the process set yields the worst outcome.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(i32)]
pub enum Outcome {
    /// Full convergence, valid result.
    #[default]
    Success = 0,
    /// Recoverable: the caller still receives a usable (possibly un-adapted) mesh.
    LowFailure = 1,
    /// Unrecoverable: the mesh, if any, must not be trusted.
    StrongFailure = 2,
}

impl Outcome {
    /// Code used on the wire.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Inverse of [`Outcome::code`]. Unknown codes are treated as the worst case.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Outcome::Success,
            1 => Outcome::LowFailure,
            _ => Outcome::StrongFailure,
        }
    }

    /// The worse of two outcomes.
    pub fn worst(self, other: Outcome) -> Outcome {
        self.max(other)
    }

    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Success => "SUCCESS",
            Outcome::LowFailure => "LOW_FAILURE",
            Outcome::StrongFailure => "STRONG_FAILURE",
        };
        f.pad(s)
    }
}

/// Which communicator a check failure was detected on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommKind {
    InternalNode,
    InternalFace,
    ExternalNode,
    ExternalFace,
}

impl std::fmt::Display for CommKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommKind::InternalNode => "internal node",
            CommKind::InternalFace => "internal face",
            CommKind::ExternalNode => "external node",
            CommKind::ExternalFace => "external face",
        };
        f.pad(s)
    }
}

/// Unified error type for parallel remeshing operations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParMeshError {
    /// Unsupported or contradictory remeshing options.
    #[error("invalid options: {0}")]
    InvalidOptions(String),
    /// The metric cannot be used with this mesh.
    #[error("invalid metric: {0}")]
    InvalidMetric(String),
    /// Driver configuration rejected before the loop started.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// An allocation would exceed the memory ceiling.
    #[error("{context}: exceeded max memory allowed ({requested} bytes requested, {current}/{max} in use)")]
    OutOfMemory {
        context: &'static str,
        requested: usize,
        current: usize,
        max: usize,
    },
    /// A tetrahedron references a point outside its group, or is degenerate.
    #[error("invalid tetra {tetra} in group {group}: {reason}")]
    InvalidTetra {
        group: usize,
        tetra: usize,
        reason: String,
    },
    /// A communicator failed one of its consistency checks.
    #[error("{kind} communicator check failed: {reason}")]
    CommCheck { kind: CommKind, reason: String },
    /// Communicators were read after a topology change without a rebuild.
    #[error("communicators are stale; rebuild required before `{0}`")]
    StaleCommunicators(&'static str),
    /// Two copies of an interface point disagree.
    #[error("merge mismatch on point gid {gid}: {reason}")]
    MergeMismatch { gid: u64, reason: String },
    /// Entity conservation broken by a merge or split.
    #[error("conservation violated: expected {expected} tetra, found {found}")]
    MergeConservation { expected: usize, found: usize },
    /// A fixed interface point moved or disappeared during local remeshing.
    #[error("interface point gid {gid} was modified by the local kernel")]
    InterfaceMoved { gid: u64 },
    /// Partitioning could not produce the requested parts.
    #[error("partitioning failed: {0}")]
    Partition(String),
    /// Transport-level failure talking to a neighbor.
    #[error("communication error with rank {neighbor}: {reason}")]
    CommError {
        neighbor: usize,
        reason: String,
    },
    /// Malformed wire payload.
    #[error("wire format error: {0}")]
    Wire(String),
    /// Preprocessing of a group failed; the group was restored to its input state.
    #[error("preprocessing of group {group} failed: {reason}")]
    Preprocess { group: usize, reason: String },
    /// Local remesh kernel failure, surfaced verbatim.
    #[error("local remesh kernel reported {outcome} on group {group}")]
    Kernel { group: usize, outcome: Outcome },
    /// Boundary surface could not be rebuilt on the merged mesh.
    #[error("boundary reconstruction failed: {0}")]
    Boundary(String),
    /// Another process failed; this process aborts with it.
    #[error("a peer process reported {outcome}")]
    PeerFailure { outcome: Outcome },
}

impl ParMeshError {
    /// Classification of this error into a process outcome.
    pub fn outcome(&self) -> Outcome {
        match self {
            ParMeshError::InvalidOptions(_)
            | ParMeshError::InvalidMetric(_)
            | ParMeshError::InvalidConfig(_)
            | ParMeshError::Preprocess { .. }
            | ParMeshError::Boundary(_) => Outcome::LowFailure,
            ParMeshError::Kernel { outcome, .. } | ParMeshError::PeerFailure { outcome } => {
                *outcome
            }
            ParMeshError::OutOfMemory { .. }
            | ParMeshError::InvalidTetra { .. }
            | ParMeshError::CommCheck { .. }
            | ParMeshError::StaleCommunicators(_)
            | ParMeshError::MergeMismatch { .. }
            | ParMeshError::MergeConservation { .. }
            | ParMeshError::InterfaceMoved { .. }
            | ParMeshError::Partition(_)
            | ParMeshError::CommError { .. }
            | ParMeshError::Wire(_) => Outcome::StrongFailure,
        }
    }

    pub(crate) fn comm_check(kind: CommKind, reason: impl Into<String>) -> Self {
        ParMeshError::CommCheck {
            kind,
            reason: reason.into(),
        }
    }
}

/// Outcome of a local result, `Success` when `Ok`.
pub fn outcome_of<T>(res: &Result<T, ParMeshError>) -> Outcome {
    match res {
        Ok(_) => Outcome::Success,
        Err(e) => e.outcome(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_codes_order_by_severity() {
        assert!(Outcome::Success < Outcome::LowFailure);
        assert!(Outcome::LowFailure < Outcome::StrongFailure);
        for o in [Outcome::Success, Outcome::LowFailure, Outcome::StrongFailure] {
            assert_eq!(Outcome::from_code(o.code()), o);
        }
        assert_eq!(Outcome::from_code(17), Outcome::StrongFailure);
    }

    #[test]
    fn error_classification() {
        assert_eq!(
            ParMeshError::InvalidOptions("x".into()).outcome(),
            Outcome::LowFailure
        );
        assert_eq!(
            ParMeshError::comm_check(CommKind::ExternalNode, "len").outcome(),
            Outcome::StrongFailure
        );
        let oom = ParMeshError::OutOfMemory {
            context: "split",
            requested: 10,
            current: 5,
            max: 8,
        };
        assert_eq!(oom.outcome(), Outcome::StrongFailure);
        assert_eq!(
            ParMeshError::Kernel {
                group: 0,
                outcome: Outcome::LowFailure
            }
            .outcome(),
            Outcome::LowFailure
        );
        assert_eq!(
            ParMeshError::Boundary("open".into()).outcome(),
            Outcome::LowFailure
        );
    }

    #[test]
    fn comm_error_names_the_neighbor() {
        let e = ParMeshError::CommError {
            neighbor: 3,
            reason: "no group received during merge".into(),
        };
        assert_eq!(
            e.to_string(),
            "communication error with rank 3: no group received during merge"
        );
        assert_eq!(e.outcome(), Outcome::StrongFailure);
    }
}
