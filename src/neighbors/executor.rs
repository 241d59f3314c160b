//! Two-phase execution of a query wave.
//!
//! [`QueryPlan::build`] validates and assembles every per-worker task on the
//! driver without touching the cluster. [`DistributedQueryExecutor::execute`]
//! then submits the whole plan as one wave and blocks until every task
//! finished.

use super::kernel::{IndexPartition, KernelJob, PartitionOutput};
use super::labels::UniqueLabelSet;
use super::model::{KnnClassifierMg, ModelHandles};
use crate::comms::CommunicatorSession;
use crate::core::error::{KnnError, Result};
use crate::core::types::{
    DType, FeatureElement, QueryMode, Rank, SessionId, TaskKey, WaveKeys, WorkerAddress,
};
use crate::dataset::{DataHandler, PartitionHandle, PartsToRanks};
use crate::runtime::{Client, Wave};

use ndarray::Array2;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Per-rank results, each in that rank's dataset-order of query partitions.
pub type RankResults = BTreeMap<Rank, Vec<PartitionOutput>>;

/// The task one worker runs in a query wave.
#[derive(Debug, Clone)]
pub struct WorkerTask {
    /// Worker the task is placed on
    pub worker: WorkerAddress,
    /// Rank of that worker
    pub rank: Rank,
    /// Store key of the worker's model
    pub model_key: TaskKey,
    /// `(features, labels)` handles of the worker's index partitions
    pub index_parts: Vec<(PartitionHandle, PartitionHandle)>,
    /// First global row of each index partition
    pub index_offsets: Vec<usize>,
    /// Handles of the worker's query partitions
    pub query_parts: Vec<PartitionHandle>,
}

/// Inputs of [`QueryPlan::build`].
#[derive(Debug)]
pub struct QueryRequest<'a> {
    /// Session the wave runs under
    pub session: &'a CommunicatorSession,
    /// Model of every session worker
    pub models: &'a ModelHandles,
    /// Co-partitioned `[features, labels]` of the fitted index
    pub data: &'a DataHandler,
    pub data_layout: PartsToRanks,
    /// Query features
    pub query: &'a DataHandler,
    pub query_layout: PartsToRanks,
    pub unique_labels: Arc<UniqueLabelSet>,
    /// Feature count seen at fit time
    pub n_features: usize,
    pub n_neighbors: usize,
    /// Convert non-float32 queries on the workers instead of rejecting them
    pub convert_dtype: bool,
    pub mode: QueryMode,
}

/// A validated query wave, ready to submit.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    session_id: SessionId,
    mode: QueryMode,
    convert_dtype: bool,
    query_dtype: DType,
    n_features: usize,
    unique_labels: Arc<UniqueLabelSet>,
    data_layout: Arc<PartsToRanks>,
    query_layout: Arc<PartsToRanks>,
    tasks: Vec<WorkerTask>,
}

impl QueryPlan {
    /// Validate the request and lay out one task per session rank.
    pub fn build(request: QueryRequest<'_>) -> Result<Self> {
        let query_dtype = request
            .query
            .dtype(0)
            .ok_or_else(|| KnnError::internal("query handler holds no array"))?;
        if query_dtype == DType::Int64 {
            return Err(KnnError::config("query features must be floating point"));
        }
        if query_dtype != DType::Float32 && !request.convert_dtype {
            return Err(KnnError::config(format!(
                "query features are {} but the index is float32; enable convert_dtype",
                query_dtype
            )));
        }
        if request.query.n_cols() != request.n_features {
            return Err(KnnError::dimension_mismatch(
                format!("{} features", request.n_features),
                format!("{} features", request.query.n_cols()),
            ));
        }
        if request.data.num_arrays() != 2 {
            return Err(KnnError::internal("index handler must hold features and labels"));
        }
        if request.n_neighbors > request.data_layout.total_rows() {
            return Err(KnnError::config(format!(
                "n_neighbors ({}) exceeds the {} index rows",
                request.n_neighbors,
                request.data_layout.total_rows()
            )));
        }

        let offsets = request.data_layout.row_offsets();
        let mut tasks = Vec::with_capacity(request.session.size());
        for (rank, worker) in request.session.worker_addresses().iter().enumerate() {
            let model_key = request
                .models
                .key(worker)
                .cloned()
                .ok_or_else(|| KnnError::internal(format!("no model was created on {}", worker)))?;

            let own = request.data.worker_to_parts().get(worker);
            let index_parts = own
                .map(|indices| {
                    indices
                        .iter()
                        .map(|&i| {
                            let handles = request.data.parts()[i].handles();
                            (handles[0].clone(), handles[1].clone())
                        })
                        .collect()
                })
                .unwrap_or_default();
            let index_offsets = own
                .map(|indices| indices.iter().map(|&i| offsets[i]).collect())
                .unwrap_or_default();
            let query_parts = request
                .query
                .parts_of(worker)
                .into_iter()
                .map(|group| group.handles()[0].clone())
                .collect();

            tasks.push(WorkerTask {
                worker: worker.clone(),
                rank,
                model_key,
                index_parts,
                index_offsets,
                query_parts,
            });
        }

        Ok(QueryPlan {
            session_id: request.session.session_id(),
            mode: request.mode,
            convert_dtype: request.convert_dtype,
            query_dtype,
            n_features: request.n_features,
            unique_labels: request.unique_labels,
            data_layout: Arc::new(request.data_layout),
            query_layout: Arc::new(request.query_layout),
            tasks,
        })
    }

    /// Per-worker tasks in rank order
    pub fn tasks(&self) -> &[WorkerTask] {
        &self.tasks
    }

    /// Query layout the results follow
    pub fn query_layout(&self) -> &PartsToRanks {
        &self.query_layout
    }

    /// Element type of the query features
    pub fn query_dtype(&self) -> DType {
        self.query_dtype
    }

    /// Kernel mode of the wave
    pub fn mode(&self) -> QueryMode {
        self.mode
    }

    /// Whether non-float32 queries are converted on the workers
    pub fn convert_dtype(&self) -> bool {
        self.convert_dtype
    }
}

/// Submits query waves.
pub struct DistributedQueryExecutor;

impl DistributedQueryExecutor {
    /// Run `plan` on the cluster with query features of type `T`.
    ///
    /// Blocks until every task of the wave finished. If any task failed, the
    /// originating worker's error is returned and no partial result is.
    pub fn execute<T: FeatureElement>(
        client: &Client,
        session: &CommunicatorSession,
        plan: &QueryPlan,
    ) -> Result<RankResults> {
        if session.session_id() != plan.session_id {
            return Err(KnnError::internal("plan was built for another session"));
        }
        if T::DTYPE != plan.query_dtype {
            return Err(KnnError::internal(format!(
                "plan expects {} queries, got {}",
                plan.query_dtype,
                T::DTYPE
            )));
        }

        let keys = WaveKeys::new();
        let mut wave = Wave::new(format!("{} wave {}", plan.mode, plan.session_id));
        for task in &plan.tasks {
            let task_key = keys.key(task.rank);
            let assigned = task.clone();
            let plan = plan.clone();
            let submitted = client.submit(&task.worker, task_key, move |ctx| {
                let comm = ctx.session(plan.session_id)?;
                comm.guard(|| {
                    let model = ctx.get::<KnnClassifierMg>(&assigned.model_key)?;
                    let index = assigned
                        .index_parts
                        .iter()
                        .zip(&assigned.index_offsets)
                        .map(|((features, labels), &offset)| {
                            Ok(IndexPartition {
                                features: ctx.get::<Array2<f32>>(features.key())?,
                                labels: ctx.get::<Array2<i64>>(labels.key())?,
                                offset,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    let queries = assigned
                        .query_parts
                        .iter()
                        .map(|handle| {
                            let part = ctx.get::<Array2<T>>(handle.key())?;
                            Ok(part.mapv(|value| value.as_()))
                        })
                        .collect::<Result<Vec<Array2<f32>>>>()?;

                    let outputs = model.run(&KernelJob {
                        mode: plan.mode,
                        index: &index,
                        data_layout: &plan.data_layout,
                        queries: &queries,
                        query_layout: &plan.query_layout,
                        unique_labels: &plan.unique_labels,
                        n_features: plan.n_features,
                    })?;
                    Ok((assigned.rank, outputs))
                })
            });
            match submitted {
                Ok(future) => wave.push(future),
                Err(err) => {
                    // Tasks already placed would wait on the missing rank.
                    session.abort();
                    let _ = wave.join();
                    return Err(err);
                }
            }
        }

        let results: RankResults = wave.join()?.into_iter().map(|(_, result)| result).collect();
        log::debug!(
            "Query wave of session {} returned {} partitions",
            plan.session_id,
            results.values().map(Vec::len).sum::<usize>()
        );
        Ok(results)
    }
}
