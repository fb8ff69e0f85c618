//! Collective operations over a [`Transport`], built on point-to-point
//! messages.
//!
//! Every rank must call the same collectives in the same order with the same
//! tag. All functions post every receive and send before waiting, and drain
//! every handle even after an error, returning the first error seen.
//! With a single rank they return immediately without touching the transport.

use crate::algs::transport::{CommTag, Transport, Wait};
use crate::mesh_error::{Outcome, ParMeshError};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Min,
    Max,
    Sum,
}

fn missing(neighbor: usize, what: &str) -> ParMeshError {
    ParMeshError::CommError {
        neighbor,
        reason: format!("failed to receive {what} from rank {neighbor}"),
    }
}

/// Send `outgoing[q]` to every rank `q` and return what each rank sent to us.
/// `outgoing[rank]` is returned in place without a copy on the wire.
pub fn all_to_all<C: Transport>(
    comm: &C,
    tag: CommTag,
    mut outgoing: Vec<Vec<u8>>,
) -> Result<Vec<Vec<u8>>, ParMeshError> {
    let (me, n) = (comm.rank(), comm.size());
    if outgoing.len() != n {
        return Err(ParMeshError::CommError {
            neighbor: me,
            reason: format!("all_to_all needs {n} buffers, got {}", outgoing.len()),
        });
    }
    let mut incoming = vec![Vec::new(); n];
    incoming[me] = std::mem::take(&mut outgoing[me]);
    if n == 1 {
        return Ok(incoming);
    }
    let recvs: Vec<_> = (0..n)
        .filter(|&q| q != me)
        .map(|q| (q, comm.irecv(q, tag)))
        .collect();
    let sends: Vec<_> = (0..n)
        .filter(|&q| q != me)
        .map(|q| comm.isend(q, tag, &outgoing[q]))
        .collect();

    let mut maybe_err = None;
    for (q, h) in recvs {
        match h.wait() {
            Some(data) => incoming[q] = data,
            None if maybe_err.is_none() => maybe_err = Some(missing(q, "all-to-all block")),
            None => {}
        }
    }
    for s in sends {
        let _ = s.wait();
    }
    maybe_err.map_or(Ok(incoming), Err)
}

/// Every rank contributes `mine`; everyone receives all contributions in rank order.
pub fn all_gather<C: Transport>(
    comm: &C,
    tag: CommTag,
    mine: &[u8],
) -> Result<Vec<Vec<u8>>, ParMeshError> {
    all_to_all(comm, tag, vec![mine.to_vec(); comm.size()])
}

/// Broadcast `data` from `root`. Non-root ranks ignore their own `data`.
pub fn broadcast<C: Transport>(
    comm: &C,
    root: usize,
    data: &[u8],
) -> Result<Vec<u8>, ParMeshError> {
    let (me, n) = (comm.rank(), comm.size());
    if n == 1 {
        return Ok(data.to_vec());
    }
    if me == root {
        let sends: Vec<_> = (0..n)
            .filter(|&q| q != me)
            .map(|q| comm.isend(q, CommTag::BROADCAST, data))
            .collect();
        for s in sends {
            let _ = s.wait();
        }
        Ok(data.to_vec())
    } else {
        comm.irecv(root, CommTag::BROADCAST)
            .wait()
            .ok_or_else(|| missing(root, "broadcast"))
    }
}

fn decode_i64(neighbor: usize, bytes: &[u8]) -> Result<i64, ParMeshError> {
    let raw: [u8; 8] = bytes.try_into().map_err(|_| ParMeshError::CommError {
        neighbor,
        reason: format!("expected 8 bytes for reduction, got {}", bytes.len()),
    })?;
    Ok(i64::from_le_bytes(raw))
}

/// All-reduce of one signed integer.
pub fn all_reduce_i64<C: Transport>(
    comm: &C,
    value: i64,
    op: ReduceOp,
) -> Result<i64, ParMeshError> {
    let all = all_gather(comm, CommTag::REDUCE, &value.to_le_bytes())?;
    let mut acc: Option<i64> = None;
    for (q, bytes) in all.iter().enumerate() {
        let v = decode_i64(q, bytes)?;
        acc = Some(match (acc, op) {
            (None, _) => v,
            (Some(a), ReduceOp::Min) => a.min(v),
            (Some(a), ReduceOp::Max) => a.max(v),
            (Some(a), ReduceOp::Sum) => a.saturating_add(v),
        });
    }
    Ok(acc.unwrap_or(value))
}

/// All-reduce of one unsigned integer (counts, global ids).
pub fn all_reduce_u64<C: Transport>(
    comm: &C,
    value: u64,
    op: ReduceOp,
) -> Result<u64, ParMeshError> {
    let all = all_gather(comm, CommTag::REDUCE.offset(1), &value.to_le_bytes())?;
    let mut values = Vec::with_capacity(all.len());
    for (q, bytes) in all.iter().enumerate() {
        values.push(decode_i64(q, bytes)? as u64);
    }
    Ok(match op {
        ReduceOp::Min => values.into_iter().min().unwrap_or(value),
        ReduceOp::Max => values.into_iter().max().unwrap_or(value),
        ReduceOp::Sum => values.into_iter().fold(0u64, u64::saturating_add),
    })
}

/// Worst outcome over all ranks (MAX reduction of the outcome codes).
pub fn reduce_outcome<C: Transport>(comm: &C, local: Outcome) -> Result<Outcome, ParMeshError> {
    let worst = all_reduce_i64(comm, i64::from(local.code()), ReduceOp::Max)?;
    Ok(Outcome::from_code(worst as i32))
}

/// Phase barrier: every rank learns whether any rank failed.
///
/// A local error is returned unchanged. A local success becomes
/// [`ParMeshError::PeerFailure`] when another rank failed, so every process
/// leaves the phase together.
pub fn agree<C: Transport, T>(
    comm: &C,
    local: Result<T, ParMeshError>,
) -> Result<T, ParMeshError> {
    let mine = match &local {
        Ok(_) => Outcome::Success,
        Err(e) => e.outcome().worst(Outcome::LowFailure),
    };
    let global = match reduce_outcome(comm, mine) {
        Ok(o) => o,
        Err(e) => return local.and(Err(e)),
    };
    match local {
        Ok(v) if global.is_success() => Ok(v),
        Ok(_) => Err(ParMeshError::PeerFailure { outcome: global }),
        Err(e) => Err(e),
    }
}
