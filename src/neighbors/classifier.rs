//! Multi-worker K-nearest-neighbors classifier.

use super::aggregate::{ResultAggregator, ResultChannel};
use super::executor::{DistributedQueryExecutor, QueryPlan, QueryRequest, RankResults};
use super::labels::UniqueLabelSet;
use super::model::WorkerModelFactory;
use crate::comms::CommunicatorSession;
use crate::config::KnnConfig;
use crate::core::error::{KnnError, Result};
use crate::core::types::{ClassLabel, Distance, FeatureElement, QueryMode, WorkerAddress};
use crate::dataset::{
    DataHandler, DistributedArray, PartitionDirectory, PartitionedArray, PartsToRanks,
};
use crate::runtime::Client;

use ndarray::{Array2, Zip};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Output of [`KNeighborsClassifier::predict`], in query row order.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Predicted label of every target, `(n_queries, n_targets)`
    pub labels: Array2<ClassLabel>,
    /// Global index rows of the neighbors, `(n_queries, n_neighbors)`
    pub indices: Array2<i64>,
    /// Distances to the neighbors, `(n_queries, n_neighbors)`
    pub distances: Array2<Distance>,
}

#[derive(Debug, Clone)]
struct FittedState {
    data: DataHandler,
    unique_labels: Arc<UniqueLabelSet>,
    n_features: usize,
}

/// K-nearest-neighbors classifier over distributed arrays.
///
/// `fit` only records where the index lives and which labels exist. Every
/// `predict`, `predict_proba` and `score` call opens its own communicator
/// session, creates one model per participating worker, runs one query wave
/// and destroys the session before returning, on success and on failure.
#[derive(Debug, Clone)]
pub struct KNeighborsClassifier {
    client: Client,
    config: KnnConfig,
    fitted: Option<FittedState>,
}

impl KNeighborsClassifier {
    /// Create an unfitted classifier
    pub fn new(client: &Client, config: KnnConfig) -> Result<Self> {
        config.validate()?;
        Ok(KNeighborsClassifier {
            client: client.clone(),
            config,
            fitted: None,
        })
    }

    /// Hyperparameters
    pub fn config(&self) -> &KnnConfig {
        &self.config
    }

    /// Whether `fit` succeeded
    pub fn is_fitted(&self) -> bool {
        self.fitted.is_some()
    }

    /// Distinct labels of every target seen during `fit`
    pub fn unique_labels(&self) -> Option<&UniqueLabelSet> {
        self.fitted.as_ref().map(|state| state.unique_labels.as_ref())
    }

    /// Number of features seen during `fit`
    pub fn n_features(&self) -> Option<usize> {
        self.fitted.as_ref().map(|state| state.n_features)
    }

    /// Fit on features `x` and labels `y`.
    ///
    /// `y` holds one column per target and must be partitioned exactly like
    /// `x`. Its distinct values are computed here, on the driver, so the
    /// whole label array is gathered once.
    pub fn fit(
        &mut self,
        x: &DistributedArray<f32>,
        y: &DistributedArray<ClassLabel>,
    ) -> Result<&mut Self> {
        if y.ncols() == 0 {
            return Err(KnnError::dataset("labels need at least one target column"));
        }
        let data =
            DataHandler::create_co_partitioned(&[x as &dyn PartitionedArray, y], &self.client)?;
        if self.config.n_neighbors > data.total_rows() {
            return Err(KnnError::config(format!(
                "n_neighbors ({}) exceeds the {} index rows",
                self.config.n_neighbors,
                data.total_rows()
            )));
        }

        let labels = y.collect()?;
        let unique_labels = UniqueLabelSet::from_labels(labels.view());
        log::log!(
            self.config.progress_level(),
            "Fitted on {} rows x {} features across {} workers; label cardinalities {:?}",
            data.total_rows(),
            x.ncols(),
            data.workers().len(),
            unique_labels.cardinalities()
        );

        self.fitted = Some(FittedState {
            data,
            unique_labels: Arc::new(unique_labels),
            n_features: x.ncols(),
        });
        Ok(self)
    }

    /// Predict labels of `x`, with neighbor indices and distances.
    ///
    /// With `convert_dtype` set, non-float32 features are converted on the
    /// workers; otherwise they are rejected.
    pub fn predict<T: FeatureElement>(
        &self,
        x: &DistributedArray<T>,
        convert_dtype: bool,
    ) -> Result<Prediction> {
        let (layout, results) = self.query(x, convert_dtype, QueryMode::Classify)?;
        let blocks = |channel| ResultAggregator::flatten(&layout, &results, channel);
        Ok(Prediction {
            labels: ResultAggregator::concat_int(blocks(ResultChannel::Labels)?)?,
            indices: ResultAggregator::concat_int(blocks(ResultChannel::NeighborIndices)?)?,
            distances: ResultAggregator::concat_float(blocks(ResultChannel::NeighborDistances)?)?,
        })
    }

    /// Class probabilities of `x`: one `(n_queries, cardinality)` matrix per
    /// target, columns in ascending label order.
    pub fn predict_proba<T: FeatureElement>(
        &self,
        x: &DistributedArray<T>,
        convert_dtype: bool,
    ) -> Result<Vec<Array2<f32>>> {
        let (layout, results) = self.query(x, convert_dtype, QueryMode::Probability)?;
        let n_targets = self.fitted_state("predict_proba")?.unique_labels.n_targets();
        (0..n_targets)
            .map(|target| {
                ResultAggregator::concat_float(ResultAggregator::flatten(
                    &layout,
                    &results,
                    ResultChannel::ProbabilityForTarget(target),
                )?)
            })
            .collect()
    }

    /// Mean agreement of the predicted labels with `y`, over every target
    pub fn score<T: FeatureElement>(
        &self,
        x: &DistributedArray<T>,
        y: &DistributedArray<ClassLabel>,
    ) -> Result<f64> {
        let state = self.fitted_state("score")?;
        if y.nrows() != x.nrows() || y.ncols() != state.unique_labels.n_targets() {
            return Err(KnnError::dimension_mismatch(
                format!("{}x{} labels", x.nrows(), state.unique_labels.n_targets()),
                format!("{}x{}", y.nrows(), y.ncols()),
            ));
        }

        let predicted = self.predict(x, true)?.labels;
        let expected = y.collect()?;
        let mut matches = 0usize;
        Zip::from(&predicted).and(&expected).for_each(|p, e| {
            if p == e {
                matches += 1;
            }
        });
        Ok(matches as f64 / predicted.len().max(1) as f64)
    }

    fn fitted_state(&self, operation: &str) -> Result<&FittedState> {
        self.fitted.as_ref().ok_or_else(|| KnnError::not_fitted(operation))
    }

    fn query<T: FeatureElement>(
        &self,
        x: &DistributedArray<T>,
        convert_dtype: bool,
        mode: QueryMode,
    ) -> Result<(PartsToRanks, RankResults)> {
        let state = self.fitted_state(match mode {
            QueryMode::Classify => "predict",
            QueryMode::Probability => "predict_proba",
        })?;
        if x.ncols() != state.n_features {
            return Err(KnnError::dimension_mismatch(
                format!("{} features", state.n_features),
                format!("{} features", x.ncols()),
            ));
        }
        let query = DataHandler::create(x, &self.client)?;

        let workers: Vec<WorkerAddress> = state
            .data
            .workers()
            .into_iter()
            .chain(query.workers())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let session = CommunicatorSession::open(&self.client, &workers, &self.config)?;

        let outcome = self.run_wave::<T>(&session, &workers, state, &query, convert_dtype, mode);
        let teardown = session.destroy();
        match outcome {
            Ok(results) => {
                teardown?;
                Ok(results)
            }
            Err(err) => {
                if let Err(teardown) = teardown {
                    log::warn!(
                        "Session teardown after a failed {} also failed: {}",
                        mode,
                        teardown
                    );
                }
                Err(err)
            }
        }
    }

    fn run_wave<T: FeatureElement>(
        &self,
        session: &CommunicatorSession,
        workers: &[WorkerAddress],
        state: &FittedState,
        query: &DataHandler,
        convert_dtype: bool,
        mode: QueryMode,
    ) -> Result<(PartsToRanks, RankResults)> {
        let worker_info = session.worker_info(workers);
        let data_layout = PartitionDirectory::layout(&state.data, &worker_info)?;
        let query_layout = PartitionDirectory::layout(query, &worker_info)?;

        let models = WorkerModelFactory::create_models(&self.client, session, &self.config)?;
        let plan = QueryPlan::build(QueryRequest {
            session,
            models: &models,
            data: &state.data,
            data_layout,
            query,
            query_layout: query_layout.clone(),
            unique_labels: Arc::clone(&state.unique_labels),
            n_features: state.n_features,
            n_neighbors: self.config.n_neighbors,
            convert_dtype,
            mode,
        })?;

        let results = DistributedQueryExecutor::execute::<T>(&self.client, session, &plan)?;
        log::log!(
            session.progress_level(),
            "{} of {} query rows finished in session {}",
            mode,
            query_layout.total_rows(),
            session.session_id()
        );
        Ok((query_layout, results))
    }
}
