//! Worker-local communicator endpoint of one session.
//!
//! Every rank owns one inbox fed by all peers. Messages carry the sender's
//! rank and a tag; a receive for `(src, tag)` parks any other message it sees
//! in a pending table until its own receive asks for it. Per-sender FIFO
//! order of the underlying channel makes repeated exchanges on the same tag
//! arrive in send order.
//!
//! A handle may also carry auxiliary streams: a private Rayon pool on which
//! the rank's local compute runs instead of the global pool.

use crate::core::constants::{BARRIER_TAG, COMM_POLL_INTERVAL_MS};
use crate::core::error::{KnnError, Result};
use crate::core::types::{Rank, SessionId};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use rayon::{ThreadPool, ThreadPoolBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Message tag
pub type Tag = u64;

struct Envelope {
    src: Rank,
    tag: Tag,
    payload: Vec<u8>,
}

/// Shared wiring of one session: a sender per rank plus the abort flag.
pub(crate) struct Fabric {
    session_id: SessionId,
    peers: Vec<Sender<Envelope>>,
    aborted: AtomicBool,
    aborted_by: Mutex<Option<Rank>>,
    timeout: Duration,
}

impl Fabric {
    /// Wire `size` ranks together and return one handle per rank, each with
    /// `streams` auxiliary compute threads (none when zero)
    pub(crate) fn build(
        session_id: SessionId,
        size: usize,
        timeout: Duration,
        streams: usize,
    ) -> Result<(Arc<Fabric>, Vec<CommHandle>)> {
        let (peers, inboxes): (Vec<_>, Vec<_>) =
            (0..size).map(|_| crossbeam_channel::unbounded()).unzip();
        let fabric = Arc::new(Fabric {
            session_id,
            peers,
            aborted: AtomicBool::new(false),
            aborted_by: Mutex::new(None),
            timeout,
        });

        let handles = inboxes
            .into_iter()
            .enumerate()
            .map(|(rank, inbox)| {
                Ok(CommHandle {
                    rank,
                    size,
                    fabric: Arc::clone(&fabric),
                    mailbox: Mutex::new(Mailbox {
                        inbox,
                        pending: HashMap::new(),
                    }),
                    streams: stream_pool(session_id, rank, streams)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((fabric, handles))
    }

    /// Mark the session aborted; the first caller is remembered
    pub(crate) fn abort(&self, by: Option<Rank>) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            *self.aborted_by.lock().unwrap_or_else(PoisonError::into_inner) = by;
            match by {
                Some(rank) => log::debug!("Session {} aborted by rank {}", self.session_id, rank),
                None => log::debug!("Session {} aborted by the driver", self.session_id),
            }
        }
    }

    pub(crate) fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

fn stream_pool(session_id: SessionId, rank: Rank, streams: usize) -> Result<Option<ThreadPool>> {
    if streams == 0 {
        return Ok(None);
    }
    ThreadPoolBuilder::new()
        .num_threads(streams)
        .thread_name(move |i| format!("dknn-{}-r{}-s{}", session_id, rank, i))
        .build()
        .map(Some)
        .map_err(|e| {
            KnnError::session(
                session_id,
                format!("could not start {} streams: {}", streams, e),
            )
        })
}

struct Mailbox {
    inbox: Receiver<Envelope>,
    pending: HashMap<(Rank, Tag), VecDeque<Vec<u8>>>,
}

/// A worker's endpoint in one communicator session.
pub struct CommHandle {
    rank: Rank,
    size: usize,
    fabric: Arc<Fabric>,
    mailbox: Mutex<Mailbox>,
    streams: Option<ThreadPool>,
}

impl std::fmt::Debug for CommHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommHandle")
            .field("session_id", &self.fabric.session_id)
            .field("rank", &self.rank)
            .field("size", &self.size)
            .field("streams", &self.streams())
            .finish()
    }
}

impl CommHandle {
    /// Rank of this endpoint
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the session
    pub fn size(&self) -> usize {
        self.size
    }

    /// Session this endpoint belongs to
    pub fn session_id(&self) -> SessionId {
        self.fabric.session_id
    }

    /// Number of auxiliary streams of this endpoint
    pub fn streams(&self) -> usize {
        self.streams.as_ref().map_or(0, ThreadPool::current_num_threads)
    }

    /// Run `work` on the handle's streams, or on the global pool without any
    pub fn on_streams<R, F>(&self, work: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        match &self.streams {
            Some(pool) => pool.install(work),
            None => work(),
        }
    }

    /// Whether any participant aborted the session
    pub fn is_aborted(&self) -> bool {
        self.fabric.is_aborted()
    }

    fn aborted_error(&self) -> KnnError {
        KnnError::SessionAborted {
            session_id: self.fabric.session_id,
            rank: self.rank,
        }
    }

    /// Send `value` to rank `dest` under `tag`
    pub fn send<T: Serialize + ?Sized>(&self, dest: Rank, tag: Tag, value: &T) -> Result<()> {
        if self.is_aborted() {
            return Err(self.aborted_error());
        }
        let peer = self.fabric.peers.get(dest).ok_or_else(|| {
            KnnError::session(
                self.fabric.session_id,
                format!("rank {} out of range for {} ranks", dest, self.size),
            )
        })?;

        let payload = bincode::serialize(value)?;
        peer.send(Envelope {
            src: self.rank,
            tag,
            payload,
        })
        .map_err(|_| KnnError::session(self.fabric.session_id, format!("rank {} is gone", dest)))
    }

    /// Receive the next value sent by `src` under `tag`.
    ///
    /// Fails with [`KnnError::SessionAborted`] once any participant aborted,
    /// and with [`KnnError::Timeout`] when nothing arrives within the
    /// session's timeout.
    pub fn recv<T: DeserializeOwned>(&self, src: Rank, tag: Tag) -> Result<T> {
        let payload = self.recv_bytes(src, tag)?;
        Ok(bincode::deserialize(&payload)?)
    }

    fn recv_bytes(&self, src: Rank, tag: Tag) -> Result<Vec<u8>> {
        let mut mailbox = self.mailbox.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(payload) = mailbox.pending.get_mut(&(src, tag)).and_then(VecDeque::pop_front) {
            return Ok(payload);
        }

        let deadline = Instant::now() + self.fabric.timeout;
        let poll = Duration::from_millis(COMM_POLL_INTERVAL_MS);
        loop {
            if self.is_aborted() {
                return Err(self.aborted_error());
            }
            match mailbox.inbox.recv_timeout(poll) {
                Ok(envelope) if envelope.src == src && envelope.tag == tag => {
                    return Ok(envelope.payload)
                }
                Ok(envelope) => mailbox
                    .pending
                    .entry((envelope.src, envelope.tag))
                    .or_default()
                    .push_back(envelope.payload),
                Err(RecvTimeoutError::Timeout) => {
                    if Instant::now() >= deadline {
                        return Err(KnnError::timeout(
                            format!("rank {} waiting on rank {} tag {}", self.rank, src, tag),
                            self.fabric.timeout.as_millis() as u64,
                        ));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(KnnError::session(self.fabric.session_id, "fabric disconnected"))
                }
            }
        }
    }

    /// Block until every rank reached the barrier
    pub fn barrier(&self) -> Result<()> {
        for peer in (0..self.size).filter(|&peer| peer != self.rank) {
            self.send(peer, BARRIER_TAG, &())?;
        }
        for peer in (0..self.size).filter(|&peer| peer != self.rank) {
            self.recv::<()>(peer, BARRIER_TAG)?;
        }
        Ok(())
    }

    /// Abort the session: every blocked or future receive of every rank fails
    pub fn abort(&self) {
        self.fabric.abort(Some(self.rank));
    }

    /// Run `work`, aborting the session if it fails or panics so that peers
    /// waiting on this rank fail fast.
    pub fn guard<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                if !err.is_session_echo() {
                    log::warn!("Rank {} failed: {}", self.rank, err);
                }
                self.abort();
                Err(err)
            }
            Err(payload) => {
                self.abort();
                panic::resume_unwind(payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn handles(size: usize, timeout_ms: u64) -> Vec<CommHandle> {
        Fabric::build(SessionId::generate(), size, Duration::from_millis(timeout_ms), 0)
            .unwrap()
            .1
    }

    #[test]
    fn test_tag_matching() {
        let mut handles = handles(2, 1_000);
        let b = handles.pop().unwrap();
        let a = handles.pop().unwrap();

        a.send(1, 7, &"second").unwrap();
        a.send(1, 3, &"first").unwrap();
        a.send(1, 7, &"third").unwrap();

        assert_eq!(b.recv::<String>(0, 3).unwrap(), "first");
        assert_eq!(b.recv::<String>(0, 7).unwrap(), "second");
        assert_eq!(b.recv::<String>(0, 7).unwrap(), "third");
    }

    #[test]
    fn test_barrier_across_threads() {
        let threads: Vec<_> = handles(4, 5_000)
            .into_iter()
            .map(|handle| thread::spawn(move || handle.barrier()))
            .collect();
        for t in threads {
            assert!(t.join().unwrap().is_ok());
        }
    }

    #[test]
    fn test_recv_timeout() {
        let handles = handles(2, 30);
        let err = handles[0].recv::<u32>(1, 0).unwrap_err();
        assert!(matches!(err, KnnError::Timeout { .. }));
    }

    #[test]
    fn test_abort_wakes_waiting_peer() {
        let mut handles = handles(2, 10_000);
        let b = handles.pop().unwrap();
        let a = handles.pop().unwrap();

        let waiter = thread::spawn(move || b.recv::<u32>(0, 1));
        let failed: Result<()> = a.guard(|| Err(KnnError::dataset("missing partition")));
        assert!(failed.is_err());

        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, KnnError::SessionAborted { rank: 1, .. }));
        assert!(a.send(1, 0, &1u32).is_err());
    }

    #[test]
    fn test_streams_run_work_on_private_pool() {
        let (_, pooled) =
            Fabric::build(SessionId::generate(), 2, Duration::from_secs(1), 3).unwrap();
        for handle in &pooled {
            assert_eq!(handle.streams(), 3);
            let name = handle.on_streams(|| thread::current().name().map(str::to_string));
            assert!(name.unwrap().contains(&format!("-r{}-s", handle.rank())));
            assert_eq!(handle.on_streams(rayon::current_num_threads), 3);
        }

        let plain = handles(1, 1_000).remove(0);
        assert_eq!(plain.streams(), 0);
        assert_eq!(plain.on_streams(|| 21 * 2), 42);
    }
}
