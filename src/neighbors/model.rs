//! Worker-local models and their construction wave.

use super::kernel::{BruteForceKernel, KernelJob, LocalKnnKernel, PartitionOutput};
use crate::comms::{CommHandle, CommunicatorSession};
use crate::config::KnnConfig;
use crate::core::error::{KnnError, Result};
use crate::core::types::{SessionId, TaskKey, WaveKeys, WorkerAddress};
use crate::ensure;
use crate::runtime::{Client, Wave, WorkerContext};

use std::collections::BTreeMap;
use std::sync::Arc;

/// The model one worker holds for one session.
///
/// Bound to the worker's communicator handle of that session; discarded when
/// the session is destroyed.
pub struct KnnClassifierMg {
    handle: Arc<CommHandle>,
    config: KnnConfig,
    kernel: Arc<dyn LocalKnnKernel>,
}

impl std::fmt::Debug for KnnClassifierMg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnnClassifierMg")
            .field("handle", &self.handle)
            .field("n_neighbors", &self.config.n_neighbors)
            .finish()
    }
}

impl KnnClassifierMg {
    /// Communicator handle the model is bound to
    pub fn handle(&self) -> &Arc<CommHandle> {
        &self.handle
    }

    /// Hyperparameters the model was built with
    pub fn config(&self) -> &KnnConfig {
        &self.config
    }

    /// Run the local kernel for one query wave
    pub fn run(&self, job: &KernelJob<'_>) -> Result<Vec<PartitionOutput>> {
        self.kernel.run(&self.handle, job)
    }
}

/// Keys of the models of one session, per worker.
#[derive(Debug, Clone, Default)]
pub struct ModelHandles {
    keys: BTreeMap<WorkerAddress, TaskKey>,
}

impl ModelHandles {
    /// Object-store key of the model on `worker`
    pub fn key(&self, worker: &WorkerAddress) -> Option<&TaskKey> {
        self.keys.get(worker)
    }

    /// Number of models
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no model was created
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Builds worker-local models.
pub struct WorkerModelFactory;

impl WorkerModelFactory {
    /// Build the model of `ctx` for `session_id`.
    ///
    /// Fails with [`KnnError::CapabilityMissing`] when the worker does not
    /// provide the multi-worker KNN capability.
    pub fn create_model(
        ctx: &WorkerContext,
        session_id: SessionId,
        config: &KnnConfig,
    ) -> Result<KnnClassifierMg> {
        ensure!(
            ctx.capabilities().multi_gpu_knn,
            KnnError::capability_missing(ctx.address().clone())
        );
        let handle = ctx.session(session_id)?;
        log::debug!(
            "Building model on {} (rank {}) with {:?}",
            ctx.address(),
            handle.rank(),
            config.as_parameter_map()
        );
        Ok(KnnClassifierMg {
            handle,
            config: config.clone(),
            kernel: Arc::new(BruteForceKernel::new(config)),
        })
    }

    /// Create one model on every worker of `session` and store it under a
    /// fresh per-call key.
    ///
    /// The keys are registered with the session before the wave is awaited,
    /// so destroying the session releases whatever was created even when
    /// construction failed on some worker.
    pub fn create_models(
        client: &Client,
        session: &CommunicatorSession,
        config: &KnnConfig,
    ) -> Result<ModelHandles> {
        let keys = WaveKeys::new();
        let mut handles = ModelHandles::default();
        let mut wave = Wave::new(format!("create models {}", session.session_id()));

        for (rank, worker) in session.worker_addresses().iter().enumerate() {
            let key = keys.key(rank);
            let session_id = session.session_id();
            let model_config = config.clone();
            let store_key = key.clone();

            session.register_remote(worker, key.clone());
            let submitted = client.submit(worker, key.clone(), move |ctx| {
                let model = WorkerModelFactory::create_model(ctx, session_id, &model_config)?;
                ctx.put(&store_key, model);
                Ok(())
            });
            match submitted {
                Ok(future) => wave.push(future),
                Err(err) => {
                    // Models already being built must be stored before the
                    // session can release them.
                    session.abort();
                    let _ = wave.join();
                    return Err(err);
                }
            }
            handles.keys.insert(worker.clone(), key);
        }

        wave.join()?;
        log::log!(
            session.progress_level(),
            "Created {} worker models for session {}",
            handles.len(),
            session.session_id()
        );
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterConfig, WorkerCapabilities};
    use crate::runtime::LocalCluster;

    #[test]
    fn test_models_live_for_the_session() {
        let cluster = LocalCluster::new(ClusterConfig::with_workers(2)).unwrap();
        let client = cluster.client();
        let config = KnnConfig::default();
        let session = CommunicatorSession::open(&client, &client.workers(), &config).unwrap();

        let models = WorkerModelFactory::create_models(&client, &session, &config).unwrap();
        assert_eq!(models.len(), 2);
        for worker in client.workers() {
            let ctx = cluster.context(&worker).unwrap();
            let model = ctx.get::<KnnClassifierMg>(models.key(&worker).unwrap()).unwrap();
            assert_eq!(model.handle().rank(), session.rank_of(&worker).unwrap());
        }

        session.destroy().unwrap();
        for worker in client.workers() {
            assert_eq!(cluster.context(&worker).unwrap().num_objects(), 0);
        }
    }

    #[test]
    fn test_missing_capability_is_distinct() {
        let cluster = LocalCluster::new(ClusterConfig::with_workers(2).worker_capabilities(
            1,
            WorkerCapabilities {
                multi_gpu_knn: false,
            },
        ))
        .unwrap();
        let client = cluster.client();
        let config = KnnConfig::default();
        let session = CommunicatorSession::open(&client, &client.workers(), &config).unwrap();

        let err = WorkerModelFactory::create_models(&client, &session, &config).unwrap_err();
        assert!(matches!(err, KnnError::CapabilityMissing { .. }));

        drop(session);
        for worker in client.workers() {
            let ctx = cluster.context(&worker).unwrap();
            assert_eq!(ctx.num_objects(), 0);
            assert_eq!(ctx.num_sessions(), 0);
        }
    }

    #[test]
    fn test_failed_submission_joins_models_already_placed() {
        let cluster = LocalCluster::new(ClusterConfig::with_workers(2)).unwrap();
        let client = cluster.client();
        let workers = client.workers();
        let config = KnnConfig::default();
        let session = CommunicatorSession::open(&client, &workers, &config).unwrap();

        cluster.retire_worker(&workers[1]).unwrap();
        let err = WorkerModelFactory::create_models(&client, &session, &config).unwrap_err();
        assert_eq!(err.category(), "config");

        let ctx = cluster.context(&workers[0]).unwrap();
        assert_eq!(ctx.num_objects(), 1);
        session.destroy().unwrap();
        assert_eq!(ctx.num_objects(), 0);
        assert_eq!(ctx.num_sessions(), 0);
    }
}
