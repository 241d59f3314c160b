//! Task-scheduling runtime.
//!
//! An in-process cluster of worker threads that provides what the
//! distributed classifier needs from a scheduler: submission with explicit
//! worker placement, unique task keys, blocking joint completion of a wave,
//! and re-raising a remote failure in the caller's context.
//!
//! ```rust
//! use distributed_knn::config::ClusterConfig;
//! use distributed_knn::core::types::TaskKey;
//! use distributed_knn::runtime::LocalCluster;
//!
//! # fn main() -> distributed_knn::Result<()> {
//! let cluster = LocalCluster::new(ClusterConfig::with_workers(2))?;
//! let client = cluster.client();
//! let worker = client.workers()[0].clone();
//!
//! let future = client.submit(&worker, TaskKey::new("answer-0"), |_ctx| Ok(42))?;
//! assert_eq!(future.wait()?, 42);
//! # Ok(())
//! # }
//! ```

pub mod task;
pub mod worker;

pub use task::{TaskFuture, Wave};
pub use worker::WorkerContext;

use crate::config::ClusterConfig;
use crate::core::error::{KnnError, Result};
use crate::core::types::{TaskKey, WorkerAddress};
use task::InFlightKeys;
use worker::{Job, WorkerProcess};

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError};

struct ClusterInner {
    workers: BTreeMap<WorkerAddress, WorkerProcess>,
    in_flight: InFlightKeys,
}

impl ClusterInner {
    fn process(&self, worker: &WorkerAddress) -> Result<&WorkerProcess> {
        self.workers
            .get(worker)
            .ok_or_else(|| KnnError::config(format!("unknown worker {}", worker)))
    }

    fn reserve_key(&self, key: &TaskKey) -> Result<()> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(key.clone()) {
            return Err(KnnError::KeyCollision { key: key.clone() });
        }
        Ok(())
    }

    fn release_key(&self, key: &TaskKey) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    fn shutdown(&self) {
        for process in self.workers.values() {
            process.shutdown();
        }
    }
}

/// An in-process cluster of worker threads.
///
/// Dropping the cluster retires every worker after its running tasks finish.
pub struct LocalCluster {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("workers", &self.inner.workers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl LocalCluster {
    /// Start the workers described by `config`
    pub fn new(config: ClusterConfig) -> Result<Self> {
        config.validate()?;

        let mut workers = BTreeMap::new();
        for index in 0..config.n_workers {
            let address = config.address(index);
            let process = WorkerProcess::spawn(address.clone(), config.capabilities(index))?;
            workers.insert(address, process);
        }

        log::info!("Local cluster started with {} workers", workers.len());
        Ok(LocalCluster {
            inner: Arc::new(ClusterInner {
                workers,
                in_flight: InFlightKeys::default(),
            }),
        })
    }

    /// A client submitting to this cluster
    pub fn client(&self) -> Client {
        Client {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Addresses of the live workers, sorted
    pub fn workers(&self) -> Vec<WorkerAddress> {
        self.client().workers()
    }

    /// State of a worker, for inspection
    pub fn context(&self, worker: &WorkerAddress) -> Option<Arc<WorkerContext>> {
        self.inner
            .workers
            .get(worker)
            .map(|process| Arc::clone(process.context()))
    }

    /// Stop a worker: it finishes running tasks and accepts no new ones.
    pub fn retire_worker(&self, worker: &WorkerAddress) -> Result<()> {
        let process = self.inner.process(worker)?;
        process.shutdown();
        log::info!("Retired worker {}", worker);
        Ok(())
    }
}

impl Drop for LocalCluster {
    fn drop(&mut self) {
        self.inner.shutdown();
    }
}

/// Driver-side handle used to place tasks on workers.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("workers", &self.inner.workers.len())
            .finish()
    }
}

impl Client {
    /// Addresses of the live workers, sorted
    pub fn workers(&self) -> Vec<WorkerAddress> {
        self.inner
            .workers
            .iter()
            .filter(|(_, process)| process.is_alive())
            .map(|(address, _)| address.clone())
            .collect()
    }

    /// Place `task` on `worker` under `key`.
    ///
    /// Fails immediately if the worker is unknown or retired, or if `key` is
    /// still in flight. A panic inside the task is reported as a task
    /// failure.
    pub fn submit<T, F>(
        &self,
        worker: &WorkerAddress,
        key: TaskKey,
        task: F,
    ) -> Result<TaskFuture<T>>
    where
        T: Send + 'static,
        F: FnOnce(&WorkerContext) -> Result<T> + Send + 'static,
    {
        let process = self.inner.process(worker)?;
        self.inner.reserve_key(&key)?;

        let (tx, rx) = crossbeam_channel::bounded(1);
        let job_key = key.clone();
        let job: Job = Box::new(move |context: Arc<WorkerContext>| {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| task(&context)))
                .unwrap_or_else(|payload| {
                    Err(KnnError::internal(format!(
                        "task {} panicked: {}",
                        job_key,
                        panic_message(payload.as_ref())
                    )))
                });
            // The submitter may have stopped waiting; nothing to report then.
            let _ = tx.send(outcome);
        });

        if let Err(err) = process.send(job) {
            self.inner.release_key(&key);
            return Err(err);
        }

        log::trace!("Submitted task {} to {}", key, worker);
        Ok(TaskFuture::new(
            key,
            worker.clone(),
            rx,
            Arc::clone(&self.inner.in_flight),
        ))
    }

    /// Store `value` on `worker` under `key`
    pub fn put<T: Any + Send + Sync>(
        &self,
        worker: &WorkerAddress,
        key: TaskKey,
        value: T,
    ) -> Result<TaskFuture<()>> {
        let store_key = key.clone();
        self.submit(worker, key, move |ctx| {
            ctx.put(&store_key, value);
            Ok(())
        })
    }

    /// Copy the value stored under `object` on `worker` back to the driver
    pub fn fetch<T: Any + Send + Sync + Clone>(
        &self,
        worker: &WorkerAddress,
        key: TaskKey,
        object: TaskKey,
    ) -> Result<TaskFuture<T>> {
        self.submit(worker, key, move |ctx| {
            let value = ctx.get::<T>(&object)?;
            Ok(T::clone(&value))
        })
    }

    /// Remove the values stored under `objects` on `worker`
    pub fn release(
        &self,
        worker: &WorkerAddress,
        key: TaskKey,
        objects: Vec<TaskKey>,
    ) -> Result<TaskFuture<usize>> {
        self.submit(worker, key, move |ctx| {
            Ok(objects.iter().filter(|object| ctx.remove(object)).count())
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
