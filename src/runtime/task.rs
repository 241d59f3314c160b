//! Futures of placed tasks and waves of futures awaited jointly.

use crate::core::error::{KnnError, Result};
use crate::core::types::{TaskKey, WorkerAddress};

use crossbeam_channel::Receiver;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Keys of all tasks submitted but not yet awaited.
pub(crate) type InFlightKeys = Arc<Mutex<HashSet<TaskKey>>>;

/// Pending result of one task placed on one worker.
///
/// The task key stays reserved on the scheduler until the future is awaited
/// or dropped.
#[derive(Debug)]
pub struct TaskFuture<T> {
    key: TaskKey,
    worker: WorkerAddress,
    outcome: Receiver<Result<T>>,
    in_flight: InFlightKeys,
}

impl<T> TaskFuture<T> {
    pub(crate) fn new(
        key: TaskKey,
        worker: WorkerAddress,
        outcome: Receiver<Result<T>>,
        in_flight: InFlightKeys,
    ) -> Self {
        TaskFuture {
            key,
            worker,
            outcome,
            in_flight,
        }
    }

    /// Key of the task
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Worker the task was placed on
    pub fn worker(&self) -> &WorkerAddress {
        &self.worker
    }

    /// Block until the task finishes.
    ///
    /// Worker-side failures come back as [`KnnError::RemoteTask`] naming the
    /// worker and key, except [`KnnError::CapabilityMissing`], which is
    /// returned unwrapped so callers can tell it apart from task failures.
    pub fn wait(self) -> Result<T> {
        match self.outcome.recv() {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err @ KnnError::CapabilityMissing { .. })) => Err(err),
            Ok(Err(err)) => Err(KnnError::remote(
                self.worker.clone(),
                self.key.clone(),
                err,
            )),
            Err(_) => Err(KnnError::remote(
                self.worker.clone(),
                self.key.clone(),
                KnnError::internal("worker dropped the task before it completed"),
            )),
        }
    }
}

impl<T> Drop for TaskFuture<T> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// The set of per-worker tasks submitted together for one logical
/// operation.
#[derive(Debug)]
pub struct Wave<T> {
    name: String,
    futures: Vec<TaskFuture<T>>,
}

impl<T> Wave<T> {
    /// Start an empty wave
    pub fn new<S: Into<String>>(name: S) -> Self {
        Wave {
            name: name.into(),
            futures: Vec::new(),
        }
    }

    /// Name used in log messages
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a submitted task to the wave
    pub fn push(&mut self, future: TaskFuture<T>) {
        self.futures.push(future);
    }

    /// Number of tasks in the wave
    pub fn len(&self) -> usize {
        self.futures.len()
    }

    /// Whether the wave has no tasks
    pub fn is_empty(&self) -> bool {
        self.futures.is_empty()
    }

    /// Wait for every task of the wave, then return the results in
    /// submission order.
    ///
    /// Never returns before the whole wave has completed. On failure the
    /// originating error is returned: failures that merely observed a peer
    /// aborting the session are only reported when nothing else failed.
    pub fn join(self) -> Result<Vec<(WorkerAddress, T)>> {
        let started = Instant::now();
        let total = self.futures.len();
        let mut results = Vec::with_capacity(total);
        let mut failures = Vec::new();

        for future in self.futures {
            let worker = future.worker().clone();
            match future.wait() {
                Ok(value) => results.push((worker, value)),
                Err(err) => failures.push(err),
            }
        }

        if failures.is_empty() {
            log::debug!(
                "Wave '{}' completed {} tasks in {:?}",
                self.name,
                total,
                started.elapsed()
            );
            return Ok(results);
        }

        log::warn!(
            "Wave '{}' failed on {}/{} tasks",
            self.name,
            failures.len(),
            total
        );
        let origin = failures
            .iter()
            .position(|err| !err.is_session_echo())
            .unwrap_or(0);
        Err(failures.swap_remove(origin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::SessionId;

    fn ready<T>(key: &str, outcome: Result<T>, in_flight: &InFlightKeys) -> TaskFuture<T> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        tx.send(outcome).unwrap();
        let key = TaskKey::new(key);
        in_flight.lock().unwrap().insert(key.clone());
        TaskFuture::new(key, WorkerAddress::new(format!("w-{}", 0)), rx, Arc::clone(in_flight))
    }

    #[test]
    fn test_future_releases_key() {
        let in_flight = InFlightKeys::default();
        let future = ready("k-0", Ok(5), &in_flight);
        assert_eq!(in_flight.lock().unwrap().len(), 1);
        assert_eq!(future.wait().unwrap(), 5);
        assert!(in_flight.lock().unwrap().is_empty());
    }

    #[test]
    fn test_future_wraps_remote_errors() {
        let in_flight = InFlightKeys::default();
        let err = ready::<()>("k-0", Err(KnnError::internal("boom")), &in_flight)
            .wait()
            .unwrap_err();
        assert!(matches!(err, KnnError::RemoteTask { .. }));

        let err = ready::<()>(
            "k-1",
            Err(KnnError::capability_missing(WorkerAddress::new("w-0"))),
            &in_flight,
        )
        .wait()
        .unwrap_err();
        assert!(matches!(err, KnnError::CapabilityMissing { .. }));
    }

    #[test]
    fn test_disconnected_future() {
        let in_flight = InFlightKeys::default();
        let (tx, rx) = crossbeam_channel::bounded::<Result<u8>>(1);
        drop(tx);
        let future = TaskFuture::new(TaskKey::new("k"), WorkerAddress::new("w"), rx, in_flight);
        assert!(future.wait().is_err());
    }

    #[test]
    fn test_wave_prefers_root_cause() {
        let in_flight = InFlightKeys::default();
        let session_id = SessionId::generate();
        let mut wave = Wave::new("test");
        wave.push(ready::<u8>(
            "k-0",
            Err(KnnError::SessionAborted {
                session_id,
                rank: 0,
            }),
            &in_flight,
        ));
        wave.push(ready("k-1", Ok(1), &in_flight));
        wave.push(ready::<u8>("k-2", Err(KnnError::dataset("bad partition")), &in_flight));
        assert_eq!(wave.len(), 3);

        let err = wave.join().unwrap_err();
        assert!(matches!(err.root(), KnnError::Dataset { .. }));
        assert!(in_flight.lock().unwrap().is_empty());
    }

    #[test]
    fn test_wave_results_in_submission_order() {
        let in_flight = InFlightKeys::default();
        let mut wave = Wave::new("ordered");
        for i in 0..4 {
            wave.push(ready(&format!("k-{}", i), Ok(i), &in_flight));
        }
        let values: Vec<_> = wave.join().unwrap().into_iter().map(|(_, v)| v).collect();
        assert_eq!(values, vec![0, 1, 2, 3]);
    }
}
