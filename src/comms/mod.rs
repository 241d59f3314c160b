//! Communicator sessions.
//!
//! A [`CommunicatorSession`] is a short-lived group-communication context
//! over a fixed set of workers. Opening it assigns every worker a rank and
//! installs a [`CommHandle`] on each of them; destroying it removes the
//! handles together with every remote object registered against the session.
//! Sessions are never shared between calls.

pub mod handle;

pub use handle::{CommHandle, Tag};

use crate::config::{KnnConfig, RankOrder};
use crate::core::error::{KnnError, Result};
use crate::core::types::{Rank, SessionId, TaskKey, WaveKeys, WorkerAddress};
use crate::runtime::{Client, Wave};
use handle::Fabric;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Session metadata of one participating worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Rank of the worker in the session
    pub rank: Rank,
    /// Session the rank belongs to
    pub session_id: SessionId,
    /// When the session was opened
    pub opened_at: DateTime<Utc>,
}

/// Assign ranks `0..n` to `workers` according to `order`.
///
/// The input is deduplicated and sorted first, so the result depends only on
/// the worker set and the policy.
pub fn assign_ranks(workers: &[WorkerAddress], order: RankOrder) -> Vec<WorkerAddress> {
    let mut ranked: Vec<WorkerAddress> = workers
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if let RankOrder::Shuffled { seed } = order {
        ranked.shuffle(&mut StdRng::seed_from_u64(seed));
    }
    ranked
}

/// Driver-side view of an open communicator session.
pub struct CommunicatorSession {
    client: Client,
    session_id: SessionId,
    ranked: Vec<WorkerAddress>,
    opened_at: DateTime<Utc>,
    fabric: Arc<Fabric>,
    registered: Mutex<BTreeMap<WorkerAddress, Vec<TaskKey>>>,
    destroyed: AtomicBool,
    progress: log::Level,
}

impl std::fmt::Debug for CommunicatorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicatorSession")
            .field("session_id", &self.session_id)
            .field("workers", &self.ranked)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl CommunicatorSession {
    /// Open a session over `workers`.
    ///
    /// Blocks until every worker installed its handle and passed a barrier
    /// with all peers. If any worker fails, the handles already installed are
    /// removed and the call fails as a whole.
    pub fn open(client: &Client, workers: &[WorkerAddress], config: &KnnConfig) -> Result<Self> {
        let ranked = assign_ranks(workers, config.rank_order);
        let session_id = SessionId::generate();
        if ranked.is_empty() {
            return Err(KnnError::session(session_id, "no workers to open a session on"));
        }

        let timeout = Duration::from_millis(config.comm_timeout_ms);
        let (fabric, handles) =
            Fabric::build(session_id, ranked.len(), timeout, config.streams_per_handle)?;
        let session = CommunicatorSession {
            client: client.clone(),
            session_id,
            opened_at: Utc::now(),
            fabric,
            registered: Mutex::new(BTreeMap::new()),
            destroyed: AtomicBool::new(false),
            progress: config.progress_level(),
            ranked,
        };

        let keys = WaveKeys::new();
        let mut wave = Wave::new(format!("open session {}", session_id));
        let mut submitted = Ok(());
        for (rank, handle) in handles.into_iter().enumerate() {
            let handle = Arc::new(handle);
            let future = client.submit(&session.ranked[rank], keys.key(rank), move |ctx| {
                handle.guard(|| {
                    ctx.install_session(Arc::clone(&handle))?;
                    handle.barrier()
                })
            });
            match future {
                Ok(future) => wave.push(future),
                Err(err) => {
                    submitted = Err(err);
                    break;
                }
            }
        }
        if submitted.is_err() {
            // Peers already waiting in the barrier must not wait for the timeout.
            session.fabric.abort(None);
        }

        if let Err(err) = submitted.and(wave.join().map(|_| ())) {
            session.fabric.abort(None);
            if let Err(teardown) = session.destroy() {
                log::warn!("Cleanup of partial session {} failed: {}", session_id, teardown);
            }
            return Err(KnnError::session(
                session_id,
                format!("could not be established: {}", err),
            ));
        }

        log::log!(
            session.progress,
            "Opened session {} over {} workers",
            session_id,
            session.size()
        );
        Ok(session)
    }

    /// Identifier of the session
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Number of ranks
    pub fn size(&self) -> usize {
        self.ranked.len()
    }

    /// Participating workers in rank order
    pub fn worker_addresses(&self) -> &[WorkerAddress] {
        &self.ranked
    }

    /// Rank of `worker`, if it participates
    pub fn rank_of(&self, worker: &WorkerAddress) -> Option<Rank> {
        self.ranked.iter().position(|w| w == worker)
    }

    /// Session metadata of the participating workers among `addresses`.
    ///
    /// Addresses outside the session are left out of the table.
    pub fn worker_info(&self, addresses: &[WorkerAddress]) -> BTreeMap<WorkerAddress, WorkerInfo> {
        addresses
            .iter()
            .filter_map(|address| {
                self.rank_of(address).map(|rank| {
                    (
                        address.clone(),
                        WorkerInfo {
                            rank,
                            session_id: self.session_id,
                            opened_at: self.opened_at,
                        },
                    )
                })
            })
            .collect()
    }

    /// Log level of per-call progress messages
    pub fn progress_level(&self) -> log::Level {
        self.progress
    }

    /// Tie a remote object's lifetime to the session
    pub fn register_remote(&self, worker: &WorkerAddress, key: TaskKey) {
        self.registered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(worker.clone())
            .or_default()
            .push(key);
    }

    /// Abort the session so that every rank blocked on a peer fails fast
    pub fn abort(&self) {
        self.fabric.abort(None);
    }

    /// Whether [`destroy`](Self::destroy) already ran
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Release every session-scoped resource on the workers.
    ///
    /// Idempotent; only the first call does any work. Retired workers are
    /// skipped since their state went away with them.
    pub fn destroy(&self) -> Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut registered = std::mem::take(
            &mut *self.registered.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let live: BTreeSet<WorkerAddress> = self.client.workers().into_iter().collect();
        let keys = WaveKeys::new();
        let mut wave = Wave::new(format!("destroy session {}", self.session_id));
        let mut submit_error = None;

        for (rank, worker) in self.ranked.iter().enumerate() {
            let objects = registered.remove(worker).unwrap_or_default();
            if !live.contains(worker) {
                log::warn!(
                    "Worker {} left before session {} was destroyed",
                    worker,
                    self.session_id
                );
                continue;
            }
            let session_id = self.session_id;
            let submitted = self.client.submit(worker, keys.key(rank), move |ctx| {
                ctx.remove_session(session_id);
                Ok(objects.iter().filter(|key| ctx.remove(key)).count())
            });
            match submitted {
                Ok(future) => wave.push(future),
                Err(err) => submit_error = submit_error.or(Some(err)),
            }
        }

        let removed: usize = wave.join()?.into_iter().map(|(_, n)| n).sum();
        if let Some(err) = submit_error {
            return Err(err);
        }

        log::log!(
            self.progress,
            "Destroyed session {} ({} remote objects released)",
            self.session_id,
            removed
        );
        Ok(())
    }
}

impl Drop for CommunicatorSession {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            log::warn!("Session {} teardown failed: {}", self.session_id, err);
        }
    }
}
