//! Worker processes of the in-process cluster.
//!
//! A worker owns an object store of remote-held values, a registry of the
//! communicator handles it participates in, and a job loop. Every accepted
//! job runs on its own task thread, so tasks of concurrent waves can block on
//! peers without starving each other.

use crate::comms::CommHandle;
use crate::config::WorkerCapabilities;
use crate::core::error::{KnnError, Result};
use crate::core::types::{SessionId, TaskKey, WorkerAddress};

use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

type StoredObject = Arc<dyn Any + Send + Sync>;

/// A unit of work placed on one worker.
pub(crate) type Job = Box<dyn FnOnce(Arc<WorkerContext>) + Send + 'static>;

/// State of one worker, visible to every task that runs on it.
pub struct WorkerContext {
    address: WorkerAddress,
    capabilities: WorkerCapabilities,
    store: RwLock<HashMap<TaskKey, StoredObject>>,
    sessions: RwLock<HashMap<SessionId, Arc<CommHandle>>>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("address", &self.address)
            .field("capabilities", &self.capabilities)
            .field("objects", &self.num_objects())
            .field("sessions", &self.num_sessions())
            .finish()
    }
}

impl WorkerContext {
    pub(crate) fn new(address: WorkerAddress, capabilities: WorkerCapabilities) -> Self {
        WorkerContext {
            address,
            capabilities,
            store: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Address of this worker
    pub fn address(&self) -> &WorkerAddress {
        &self.address
    }

    /// Capabilities declared by this worker
    pub fn capabilities(&self) -> WorkerCapabilities {
        self.capabilities
    }

    /// Store a value under `key`, replacing any previous value
    pub fn put<T: Any + Send + Sync>(&self, key: &TaskKey, value: T) -> Arc<T> {
        let value = Arc::new(value);
        self.put_shared(key, Arc::clone(&value));
        value
    }

    /// Store an already shared value under `key`
    pub fn put_shared<T: Any + Send + Sync>(&self, key: &TaskKey, value: Arc<T>) {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone(), value);
    }

    /// Look up a stored value of type `T`
    pub fn get<T: Any + Send + Sync>(&self, key: &TaskKey) -> Result<Arc<T>> {
        let object = self
            .store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| KnnError::object_not_found(self.address.clone(), key.as_str()))?;

        object.downcast::<T>().map_err(|_| {
            KnnError::internal(format!(
                "object {} on worker {} is not a {}",
                key,
                self.address,
                std::any::type_name::<T>()
            ))
        })
    }

    /// Remove a stored value; returns whether it existed
    pub fn remove(&self, key: &TaskKey) -> bool {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .is_some()
    }

    /// Whether a value is stored under `key`
    pub fn contains(&self, key: &TaskKey) -> bool {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    /// Number of stored values
    pub fn num_objects(&self) -> usize {
        self.store.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Register the local communicator handle of a session
    pub fn install_session(&self, handle: Arc<CommHandle>) -> Result<()> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let session_id = handle.session_id();
        if sessions.contains_key(&session_id) {
            return Err(KnnError::session(
                session_id,
                format!("already installed on worker {}", self.address),
            ));
        }
        sessions.insert(session_id, handle);
        Ok(())
    }

    /// Local communicator handle of a session
    pub fn session(&self, session_id: SessionId) -> Result<Arc<CommHandle>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&session_id)
            .cloned()
            .ok_or_else(|| {
                KnnError::session(
                    session_id,
                    format!("no communicator on worker {}", self.address),
                )
            })
    }

    /// Drop the local communicator handle of a session
    pub fn remove_session(&self, session_id: SessionId) -> Option<Arc<CommHandle>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id)
    }

    /// Number of sessions this worker currently participates in
    pub fn num_sessions(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle on a running worker thread.
pub(crate) struct WorkerProcess {
    context: Arc<WorkerContext>,
    jobs: Mutex<Option<Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerProcess {
    /// Start a worker thread
    pub(crate) fn spawn(address: WorkerAddress, capabilities: WorkerCapabilities) -> Result<Self> {
        let (jobs, inbox) = crossbeam_channel::unbounded::<Job>();
        let context = Arc::new(WorkerContext::new(address.clone(), capabilities));
        let loop_context = Arc::clone(&context);

        let thread = thread::Builder::new()
            .name(format!("dknn-{}", address))
            .spawn(move || worker_loop(loop_context, inbox))?;

        log::debug!("Started worker {}", address);
        Ok(WorkerProcess {
            context,
            jobs: Mutex::new(Some(jobs)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn context(&self) -> &Arc<WorkerContext> {
        &self.context
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Hand a job to the worker loop
    pub(crate) fn send(&self, job: Job) -> Result<()> {
        let jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = jobs.as_ref().ok_or_else(|| {
            KnnError::config(format!("worker {} has been retired", self.context.address()))
        })?;
        sender.send(job).map_err(|_| {
            KnnError::internal(format!("worker {} stopped accepting jobs", self.context.address()))
        })
    }

    /// Stop accepting jobs and wait for running tasks to finish
    pub(crate) fn shutdown(&self) {
        // Dropping the sender ends the job loop once the queue drains.
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::warn!("Worker {} loop panicked", self.context.address());
            }
            log::debug!("Stopped worker {}", self.context.address());
        }
    }
}

fn worker_loop(context: Arc<WorkerContext>, inbox: Receiver<Job>) {
    let mut running: Vec<JoinHandle<()>> = Vec::new();

    for job in inbox.iter() {
        let task_context = Arc::clone(&context);
        let spawned = thread::Builder::new()
            .name(format!("dknn-{}-task", context.address()))
            .spawn(move || job(task_context));
        match spawned {
            Ok(handle) => running.push(handle),
            // The job is dropped with its result channel; the submitter sees
            // a disconnected future.
            Err(e) => log::error!("Worker {} could not start a task: {}", context.address(), e),
        }
        running.retain(|handle| !handle.is_finished());
    }

    for handle in running {
        let _ = handle.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> WorkerContext {
        WorkerContext::new(WorkerAddress::new("w-0"), WorkerCapabilities::default())
    }

    #[test]
    fn test_store_roundtrip() {
        let ctx = context();
        let key = TaskKey::new("part-0");
        ctx.put(&key, vec![1u8, 2, 3]);

        assert!(ctx.contains(&key));
        assert_eq!(*ctx.get::<Vec<u8>>(&key).unwrap(), vec![1, 2, 3]);
        assert_eq!(ctx.num_objects(), 1);
        assert!(ctx.remove(&key));
        assert!(!ctx.remove(&key));
    }

    #[test]
    fn test_store_type_mismatch_and_missing() {
        let ctx = context();
        let key = TaskKey::new("part-0");
        ctx.put(&key, 7u32);

        assert!(matches!(
            ctx.get::<String>(&key).unwrap_err(),
            KnnError::Internal { .. }
        ));
        assert!(matches!(
            ctx.get::<u32>(&TaskKey::new("other")).unwrap_err(),
            KnnError::ObjectNotFound { .. }
        ));
    }

    #[test]
    fn test_missing_session() {
        let ctx = context();
        assert!(matches!(
            ctx.session(SessionId::generate()).unwrap_err(),
            KnnError::Session { .. }
        ));
        assert_eq!(ctx.num_sessions(), 0);
    }

    #[test]
    fn test_worker_process_runs_jobs_and_retires() {
        let process = WorkerProcess::spawn(WorkerAddress::new("w-1"), WorkerCapabilities::default())
            .unwrap();
        let (tx, rx) = crossbeam_channel::bounded(1);
        process
            .send(Box::new(move |ctx| {
                let _ = tx.send(ctx.address().to_string());
            }))
            .unwrap();
        assert_eq!(rx.recv().unwrap(), "w-1");

        process.shutdown();
        assert!(!process.is_alive());
        assert!(process.send(Box::new(|_| {})).is_err());
    }
}
