//! Thin façade over intra-process (threads) or inter-process (MPI) message passing.
//!
//! Messages are *contiguous byte slices* of any length. Sends never block;
//! receives complete in [`Wait::wait`]. Messages between one pair of ranks
//! with one tag arrive in the order they were sent.
//!
//! Backends:
//! - [`NoComm`]: a single process, for serial runs. Every collective
//!   short-circuits before touching the transport.
//! - [`LocalComm`]: `n` ranks simulated by threads of one process, sharing a
//!   mailbox. [`run_local_world`] spawns one thread per rank.
//! - `MpiComm` (feature `mpi-support`): one rank per MPI process.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Typed message tag. Each protocol uses its own tag so concurrent exchanges
/// between the same ranks never mix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CommTag(pub u16);

impl CommTag {
    pub const REDUCE: CommTag = CommTag(0x0100);
    pub const BROADCAST: CommTag = CommTag(0x0300);
    pub const ALL_TO_ALL: CommTag = CommTag(0x0400);
    pub const DISTRIBUTE: CommTag = CommTag(0x1000);
    pub const FACE_MATCH: CommTag = CommTag(0x2000);
    pub const NODE_MATCH: CommTag = CommTag(0x2100);
    pub const CHECK: CommTag = CommTag(0x2200);
    pub const SYNC: CommTag = CommTag(0x2300);
    pub const MIGRATE: CommTag = CommTag(0x3000);
    pub const WEIGHTS: CommTag = CommTag(0x3100);
    pub const MERGE: CommTag = CommTag(0x4000);

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Sub-tag for a stage of a multi-stage protocol.
    #[inline]
    pub const fn offset(self, k: u16) -> CommTag {
        CommTag(self.0.wrapping_add(k))
    }
}

/// Anything that can be waited on.
pub trait Wait {
    /// Wait for completion and return the received data (if any).
    fn wait(self) -> Option<Vec<u8>>;
}

/// Point-to-point transport between the ranks of a fixed process group.
pub trait Transport {
    /// Handle returned by `isend`.
    type SendHandle: Wait;
    /// Handle returned by `irecv`.
    type RecvHandle: Wait;

    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> Self::SendHandle;
    fn irecv(&self, peer: usize, tag: CommTag) -> Self::RecvHandle;

    fn is_root(&self) -> bool {
        self.rank() == 0
    }
}

impl Wait for () {
    fn wait(self) -> Option<Vec<u8>> {
        None
    }
}

/// Single-process transport.
#[derive(Clone, Debug, Default)]
pub struct NoComm;

impl Transport for NoComm {
    type SendHandle = ();
    type RecvHandle = ();

    fn rank(&self) -> usize {
        0
    }
    fn size(&self) -> usize {
        1
    }
    fn isend(&self, _peer: usize, _tag: CommTag, _buf: &[u8]) {}
    fn irecv(&self, _peer: usize, _tag: CommTag) {}
}

// --- LocalComm: ranks simulated by threads ---
type Key = (usize, usize, u16); // (src, dst, tag)

#[derive(Default)]
struct Mailbox {
    slots: DashMap<Key, VecDeque<Bytes>>,
    poisoned: AtomicBool,
}

/// Thread-backed transport; all ranks of one world share a mailbox.
#[derive(Clone)]
pub struct LocalComm {
    rank: usize,
    size: usize,
    mailbox: Arc<Mailbox>,
}

impl std::fmt::Debug for LocalComm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalComm")
            .field("rank", &self.rank)
            .field("size", &self.size)
            .finish()
    }
}

impl LocalComm {
    /// Create the `size` rank handles of a fresh world.
    pub fn world(size: usize) -> Vec<LocalComm> {
        let mailbox = Arc::new(Mailbox::default());
        (0..size)
            .map(|rank| LocalComm {
                rank,
                size,
                mailbox: Arc::clone(&mailbox),
            })
            .collect()
    }

    /// Make every pending and future receive of this world fail instead of
    /// blocking. Used when a rank dies.
    pub fn poison(&self) {
        self.mailbox.poisoned.store(true, Ordering::Release);
    }
}

pub struct LocalRecv {
    key: Key,
    mailbox: Arc<Mailbox>,
}

impl Wait for LocalRecv {
    fn wait(self) -> Option<Vec<u8>> {
        loop {
            if let Some(mut queue) = self.mailbox.slots.get_mut(&self.key) {
                if let Some(bytes) = queue.pop_front() {
                    return Some(bytes.to_vec());
                }
            }
            if self.mailbox.poisoned.load(Ordering::Acquire) {
                return None;
            }
            std::thread::yield_now();
        }
    }
}

impl Transport for LocalComm {
    type SendHandle = ();
    type RecvHandle = LocalRecv;

    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) {
        let key = (self.rank, peer, tag.as_u16());
        self.mailbox
            .slots
            .entry(key)
            .or_default()
            .push_back(Bytes::copy_from_slice(buf));
    }

    fn irecv(&self, peer: usize, tag: CommTag) -> LocalRecv {
        LocalRecv {
            key: (peer, self.rank, tag.as_u16()),
            mailbox: Arc::clone(&self.mailbox),
        }
    }
}

/// Run `f` once per rank of a fresh `size`-rank [`LocalComm`] world, each on
/// its own thread, and return the per-rank results in rank order.
///
/// A panicking rank poisons the world so its peers stop waiting, then the
/// panic is propagated to the caller.
pub fn run_local_world<R, F>(size: usize, f: F) -> Vec<R>
where
    R: Send,
    F: Fn(LocalComm) -> R + Sync,
{
    let world = LocalComm::world(size);
    std::thread::scope(|scope| {
        let handles: Vec<_> = world
            .into_iter()
            .map(|comm| {
                let f = &f;
                scope.spawn(move || {
                    let guard = comm.clone();
                    let res = std::panic::catch_unwind(AssertUnwindSafe(|| f(comm)));
                    if res.is_err() {
                        guard.poison();
                    }
                    res
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(Ok(r)) => r,
                Ok(Err(panic)) | Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

// --- MPI backend (feature = "mpi-support") ---
#[cfg(feature = "mpi-support")]
mod mpi_backend {
    use super::*;
    use mpi::environment::Universe;
    use mpi::topology::SimpleCommunicator;
    use mpi::traits::*;
    use std::rc::Rc;

    /// One rank per MPI process over `MPI_COMM_WORLD`.
    pub struct MpiComm {
        world: Rc<SimpleCommunicator>,
        rank: usize,
        size: usize,
        _universe: Universe,
    }

    impl MpiComm {
        /// Initialize MPI. Returns `None` if it was already initialized.
        pub fn new() -> Option<Self> {
            let universe = mpi::initialize()?;
            let world = Rc::new(universe.world());
            let rank = world.rank() as usize;
            let size = world.size() as usize;
            Some(Self {
                world,
                rank,
                size,
                _universe: universe,
            })
        }
    }

    /// Pending non-blocking send; the buffer is owned until completion.
    pub struct MpiSend {
        complete: Option<Box<dyn FnOnce()>>,
    }

    impl Wait for MpiSend {
        fn wait(mut self) -> Option<Vec<u8>> {
            if let Some(complete) = self.complete.take() {
                complete();
            }
            None
        }
    }

    impl Drop for MpiSend {
        fn drop(&mut self) {
            if let Some(complete) = self.complete.take() {
                complete();
            }
        }
    }

    pub struct MpiRecv {
        world: Rc<SimpleCommunicator>,
        peer: i32,
        tag: i32,
    }

    impl Wait for MpiRecv {
        fn wait(self) -> Option<Vec<u8>> {
            let (data, _status) = self
                .world
                .process_at_rank(self.peer)
                .receive_vec_with_tag::<u8>(self.tag);
            Some(data)
        }
    }

    impl Transport for MpiComm {
        type SendHandle = MpiSend;
        type RecvHandle = MpiRecv;

        fn rank(&self) -> usize {
            self.rank
        }

        fn size(&self) -> usize {
            self.size
        }

        fn isend(&self, peer: usize, tag: CommTag, buf: &[u8]) -> MpiSend {
            let owned: &'static mut [u8] = Box::leak(buf.to_vec().into_boxed_slice());
            let raw: *mut [u8] = owned;
            let request = self.world.process_at_rank(peer as i32).immediate_send_with_tag(
                mpi::request::StaticScope,
                &*owned,
                tag.as_u16() as i32,
            );
            MpiSend {
                complete: Some(Box::new(move || {
                    request.wait();
                    // SAFETY: the request is complete, MPI no longer reads the buffer.
                    drop(unsafe { Box::from_raw(raw) });
                })),
            }
        }

        fn irecv(&self, peer: usize, tag: CommTag) -> MpiRecv {
            MpiRecv {
                world: Rc::clone(&self.world),
                peer: peer as i32,
                tag: tag.as_u16() as i32,
            }
        }
    }
}

#[cfg(feature = "mpi-support")]
pub use mpi_backend::MpiComm;
