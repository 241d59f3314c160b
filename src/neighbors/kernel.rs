//! Local KNN kernel.
//!
//! The kernel runs on every rank of a session at once. Query partitions are
//! visited in dataset order; for each one the owning rank ships the query
//! rows to every peer, every rank searches its own index partitions, and the
//! owner merges the candidate lists into the global top-k. All ranks walk the
//! same sequence of partitions, so the exchange cannot deadlock.

use super::labels::UniqueLabelSet;
use crate::comms::{CommHandle, Tag};
use crate::config::{DistanceMetric, KnnConfig};
use crate::core::error::{KnnError, Result};
use crate::core::types::{ClassLabel, Distance, QueryMode};
use crate::dataset::PartsToRanks;

use ndarray::{Array2, Array3, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

const QUERY_KIND: u64 = 0;
const CANDIDATE_KIND: u64 = 1;

fn tag(partition: usize, kind: u64) -> Tag {
    ((partition as u64) << 1) | kind
}

/// One index partition resident on this rank.
#[derive(Debug, Clone)]
pub struct IndexPartition {
    /// Feature rows
    pub features: Arc<Array2<f32>>,
    /// Label rows, one column per target
    pub labels: Arc<Array2<ClassLabel>>,
    /// Global row index of the first row
    pub offset: usize,
}

/// Everything one rank needs for one query wave.
#[derive(Debug)]
pub struct KernelJob<'a> {
    /// What the owners produce
    pub mode: QueryMode,
    /// This rank's index partitions, in dataset order
    pub index: &'a [IndexPartition],
    /// Rank and row count of every index partition
    pub data_layout: &'a PartsToRanks,
    /// This rank's query partitions, in dataset order
    pub queries: &'a [Array2<f32>],
    /// Rank and row count of every query partition
    pub query_layout: &'a PartsToRanks,
    pub unique_labels: &'a UniqueLabelSet,
    pub n_features: usize,
}

/// Result of one query partition, produced by its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionOutput {
    /// Predicted labels `(n, targets)`, neighbor indices and distances `(n, k)`
    Classified {
        labels: Array2<ClassLabel>,
        indices: Array2<i64>,
        distances: Array2<Distance>,
    },
    /// One `(n, cardinality)` probability matrix per target
    Probabilities(Vec<Array2<f32>>),
}

impl PartitionOutput {
    /// Number of query rows covered
    pub fn nrows(&self) -> usize {
        match self {
            PartitionOutput::Classified { labels, .. } => labels.nrows(),
            PartitionOutput::Probabilities(matrices) => matrices.first().map_or(0, Array2::nrows),
        }
    }
}

/// Search capability installed in every worker-local model.
pub trait LocalKnnKernel: Send + Sync {
    /// Answer every query partition owned by `comm.rank()`, in dataset order
    fn run(&self, comm: &CommHandle, job: &KernelJob<'_>) -> Result<Vec<PartitionOutput>>;
}

#[derive(Debug, Clone, Copy)]
struct Neighbor {
    distance: Distance,
    index: i64,
    part: usize,
    row: usize,
}

fn by_distance_then_index(a: &(Distance, i64), b: &(Distance, i64)) -> Ordering {
    a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
}

/// Candidate neighbors of a block of query rows found on one rank.
#[derive(Debug, Serialize, Deserialize)]
struct Candidates {
    distances: Array2<Distance>,
    indices: Array2<i64>,
    labels: Array3<ClassLabel>,
}

/// Exact search over every index row.
#[derive(Debug, Clone)]
pub struct BruteForceKernel {
    n_neighbors: usize,
    metric: DistanceMetric,
    batch_size: usize,
}

impl BruteForceKernel {
    /// Kernel with the neighbor count, metric and batch size of `config`
    pub fn new(config: &KnnConfig) -> Self {
        BruteForceKernel {
            n_neighbors: config.n_neighbors,
            metric: config.metric,
            batch_size: config.batch_size.max(1),
        }
    }

    fn distance(&self, a: ArrayView1<'_, f32>, b: ArrayView1<'_, f32>) -> Distance {
        let pairs = a.iter().zip(b.iter());
        match self.metric {
            DistanceMetric::Euclidean => pairs.map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt(),
            DistanceMetric::SquaredEuclidean => pairs.map(|(x, y)| (x - y) * (x - y)).sum(),
            DistanceMetric::Manhattan => pairs.map(|(x, y)| (x - y).abs()).sum(),
        }
    }

    fn nearest(
        &self,
        query: ArrayView1<'_, f32>,
        index: &[IndexPartition],
        k: usize,
    ) -> Vec<Neighbor> {
        let mut all: Vec<Neighbor> = index
            .iter()
            .enumerate()
            .flat_map(|(part, partition)| {
                partition
                    .features
                    .rows()
                    .into_iter()
                    .enumerate()
                    .map(move |(row, features)| (part, partition.offset, row, features))
            })
            .map(|(part, offset, row, features)| Neighbor {
                distance: self.distance(query, features),
                index: (offset + row) as i64,
                part,
                row,
            })
            .collect();

        let cmp = |a: &Neighbor, b: &Neighbor| {
            by_distance_then_index(&(a.distance, a.index), &(b.distance, b.index))
        };
        if k < all.len() {
            all.select_nth_unstable_by(k, cmp);
            all.truncate(k);
        }
        all.sort_unstable_by(cmp);
        all
    }

    fn local_candidates(
        &self,
        query: &Array2<f32>,
        index: &[IndexPartition],
        n_targets: usize,
    ) -> Candidates {
        let local_rows: usize = index.iter().map(|p| p.features.nrows()).sum();
        let k = self.n_neighbors.min(local_rows);
        let n = query.nrows();

        let mut found: Vec<Vec<Neighbor>> = Vec::with_capacity(n);
        for start in (0..n).step_by(self.batch_size) {
            let end = (start + self.batch_size).min(n);
            let batch: Vec<Vec<Neighbor>> = (start..end)
                .into_par_iter()
                .map(|i| self.nearest(query.row(i), index, k))
                .collect();
            found.extend(batch);
        }

        let mut candidates = Candidates {
            distances: Array2::zeros((n, k)),
            indices: Array2::zeros((n, k)),
            labels: Array3::zeros((n, k, n_targets)),
        };
        for (i, neighbors) in found.iter().enumerate() {
            for (j, neighbor) in neighbors.iter().enumerate() {
                candidates.distances[[i, j]] = neighbor.distance;
                candidates.indices[[i, j]] = neighbor.index;
                let labels = &index[neighbor.part].labels;
                for t in 0..n_targets {
                    candidates.labels[[i, j, t]] = labels[[neighbor.row, t]];
                }
            }
        }
        candidates
    }

    fn merge(&self, blocks: &[Candidates], nrows: usize, n_targets: usize) -> Result<Candidates> {
        let k = self.n_neighbors;
        let mut merged = Candidates {
            distances: Array2::zeros((nrows, k)),
            indices: Array2::zeros((nrows, k)),
            labels: Array3::zeros((nrows, k, n_targets)),
        };

        for i in 0..nrows {
            let mut pool: Vec<(Distance, i64, usize, usize)> = blocks
                .iter()
                .enumerate()
                .flat_map(|(b, block)| {
                    (0..block.indices.ncols())
                        .map(move |j| (block.distances[[i, j]], block.indices[[i, j]], b, j))
                })
                .collect();
            if pool.len() < k {
                return Err(KnnError::internal(format!(
                    "only {} neighbor candidates for query row {}, need {}",
                    pool.len(),
                    i,
                    k
                )));
            }
            pool.sort_unstable_by(|a, b| by_distance_then_index(&(a.0, a.1), &(b.0, b.1)));

            for (j, &(distance, index, b, src)) in pool.iter().take(k).enumerate() {
                merged.distances[[i, j]] = distance;
                merged.indices[[i, j]] = index;
                for t in 0..n_targets {
                    merged.labels[[i, j, t]] = blocks[b].labels[[i, src, t]];
                }
            }
        }
        Ok(merged)
    }

    fn classify(&self, merged: Candidates, n_targets: usize) -> PartitionOutput {
        let (nrows, k, _) = merged.labels.dim();
        let labels = Array2::from_shape_fn((nrows, n_targets), |(i, t)| {
            let mut votes: BTreeMap<ClassLabel, usize> = BTreeMap::new();
            for j in 0..k {
                *votes.entry(merged.labels[[i, j, t]]).or_insert(0) += 1;
            }
            // Ascending iteration with a strict comparison keeps the smallest
            // label among ties.
            let mut winner = (0, 0);
            for (label, count) in votes {
                if count > winner.1 {
                    winner = (label, count);
                }
            }
            winner.0
        });

        PartitionOutput::Classified {
            labels,
            indices: merged.indices,
            distances: merged.distances,
        }
    }

    fn probabilities(
        &self,
        merged: &Candidates,
        unique_labels: &UniqueLabelSet,
    ) -> Result<PartitionOutput> {
        let (nrows, k, n_targets) = merged.labels.dim();
        let cardinalities = unique_labels.cardinalities();
        let mut matrices = Vec::with_capacity(n_targets);

        for (t, &cardinality) in cardinalities.iter().enumerate() {
            let mut proba = Array2::<f32>::zeros((nrows, cardinality));
            for i in 0..nrows {
                for j in 0..k {
                    let label = merged.labels[[i, j, t]];
                    let column = unique_labels.position(t, label).ok_or_else(|| {
                        KnnError::internal(format!(
                            "label {} of target {} was not seen during fit",
                            label, t
                        ))
                    })?;
                    proba[[i, column]] += 1.0;
                }
            }
            proba.mapv_inplace(|count| count / k as f32);
            matrices.push(proba);
        }
        Ok(PartitionOutput::Probabilities(matrices))
    }

    fn validate(&self, comm: &CommHandle, job: &KernelJob<'_>) -> Result<()> {
        if job.data_layout.total_rows() < self.n_neighbors {
            return Err(KnnError::config(format!(
                "n_neighbors ({}) exceeds the {} index rows",
                self.n_neighbors,
                job.data_layout.total_rows()
            )));
        }
        let owned = job.query_layout.owned_by(comm.rank());
        if owned.len() != job.queries.len() {
            return Err(KnnError::internal(format!(
                "rank {} owns {} query partitions but received {}",
                comm.rank(),
                owned.len(),
                job.queries.len()
            )));
        }
        for (&(idx, _), query) in owned.iter().zip(job.queries) {
            let expected = job.query_layout.entries()[idx].nrows;
            if query.nrows() != expected || query.ncols() != job.n_features {
                return Err(KnnError::dimension_mismatch(
                    format!("query partition {} of {}x{}", idx, expected, job.n_features),
                    format!("{}x{}", query.nrows(), query.ncols()),
                ));
            }
        }
        if let Some(part) = job.index.iter().find(|p| p.features.ncols() != job.n_features) {
            return Err(KnnError::dimension_mismatch(
                format!("{} index features", job.n_features),
                format!("{}", part.features.ncols()),
            ));
        }
        let n_targets = job.unique_labels.n_targets();
        if let Some(part) = job.index.iter().find(|p| p.labels.ncols() != n_targets) {
            return Err(KnnError::dimension_mismatch(
                format!("{} label targets", n_targets),
                format!("{}", part.labels.ncols()),
            ));
        }
        Ok(())
    }
}

impl LocalKnnKernel for BruteForceKernel {
    fn run(&self, comm: &CommHandle, job: &KernelJob<'_>) -> Result<Vec<PartitionOutput>> {
        self.validate(comm, job)?;

        let rank = comm.rank();
        let peers: Vec<usize> = (0..comm.size()).filter(|&peer| peer != rank).collect();
        let n_targets = job.unique_labels.n_targets();
        let mut own_queries = job.queries.iter();
        let mut outputs = Vec::with_capacity(job.queries.len());

        for (idx, entry) in job.query_layout.entries().iter().enumerate() {
            let received: Array2<f32>;
            let query = if entry.rank == rank {
                let query = own_queries
                    .next()
                    .ok_or_else(|| {
                        KnnError::internal(format!("query partition {} is missing", idx))
                    })?;
                for &peer in &peers {
                    comm.send(peer, tag(idx, QUERY_KIND), query)?;
                }
                query
            } else {
                received = comm.recv(entry.rank, tag(idx, QUERY_KIND))?;
                &received
            };

            let local = comm.on_streams(|| self.local_candidates(query, job.index, n_targets));
            if entry.rank != rank {
                comm.send(entry.rank, tag(idx, CANDIDATE_KIND), &local)?;
                continue;
            }

            let mut blocks = Vec::with_capacity(comm.size());
            blocks.push(local);
            for &peer in &peers {
                blocks.push(comm.recv(peer, tag(idx, CANDIDATE_KIND))?);
            }
            let merged = self.merge(&blocks, query.nrows(), n_targets)?;

            outputs.push(match job.mode {
                QueryMode::Classify => self.classify(merged, n_targets),
                QueryMode::Probability => self.probabilities(&merged, job.unique_labels)?,
            });
        }

        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::handle::Fabric;
    use crate::core::types::SessionId;
    use crate::dataset::PartRank;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::time::Duration;

    fn single_rank() -> CommHandle {
        let (_, mut handles) =
            Fabric::build(SessionId::generate(), 1, Duration::from_secs(1), 0).unwrap();
        handles.remove(0)
    }

    fn kernel(k: usize) -> BruteForceKernel {
        BruteForceKernel::new(&KnnConfig {
            n_neighbors: k,
            batch_size: 2,
            ..KnnConfig::default()
        })
    }

    fn partition(features: Array2<f32>, labels: Array2<i64>, offset: usize) -> IndexPartition {
        IndexPartition {
            features: Arc::new(features),
            labels: Arc::new(labels),
            offset,
        }
    }

    #[test]
    fn test_nearest_orders_by_distance_then_index() {
        let index = vec![
            partition(array![[0.0f32], [2.0]], array![[0i64], [1]], 0),
            partition(array![[1.0f32], [-1.0]], array![[1i64], [0]], 2),
        ];
        let found = kernel(3).nearest(array![0.0f32].view(), &index, 3);
        let order: Vec<i64> = found.iter().map(|n| n.index).collect();
        // Rows 2 and 3 are equidistant; the lower global index wins.
        assert_eq!(order, vec![0, 2, 3]);
    }

    #[test]
    fn test_single_rank_classify_and_probability() {
        let comm = single_rank();

        let index = vec![partition(
            array![[0.0f32, 0.0], [0.1, 0.0], [5.0, 5.0], [5.1, 5.0]],
            array![[7i64], [7], [9], [9]],
            0,
        )];
        let data_layout = PartsToRanks::new(vec![PartRank { rank: 0, nrows: 4 }]);
        let queries = vec![array![[0.0f32, 0.1], [5.0, 5.1]]];
        let query_layout = PartsToRanks::new(vec![PartRank { rank: 0, nrows: 2 }]);
        let unique = UniqueLabelSet::from_labels(array![[7i64], [9]].view());

        let mut job = KernelJob {
            mode: QueryMode::Classify,
            index: &index,
            data_layout: &data_layout,
            queries: &queries,
            query_layout: &query_layout,
            unique_labels: &unique,
            n_features: 2,
        };
        let outputs = kernel(2).run(&comm, &job).unwrap();
        match &outputs[0] {
            PartitionOutput::Classified { labels, indices, .. } => {
                assert_eq!(labels, &array![[7i64], [9]]);
                assert_eq!(indices.row(1).to_vec(), vec![2, 3]);
            }
            other => panic!("unexpected output {:?}", other),
        }

        job.mode = QueryMode::Probability;
        let outputs = kernel(3).run(&comm, &job).unwrap();
        match &outputs[0] {
            PartitionOutput::Probabilities(matrices) => {
                assert_eq!(matrices.len(), 1);
                assert_abs_diff_eq!(matrices[0][[0, 0]], 2.0 / 3.0, epsilon = 1e-6);
                assert_abs_diff_eq!(matrices[0].row(1).sum(), 1.0, epsilon = 1e-6);
            }
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_vote_ties_go_to_smallest_label() {
        let merged = Candidates {
            distances: Array2::zeros((1, 2)),
            indices: array![[0i64, 1]],
            labels: Array3::from_shape_vec((1, 2, 1), vec![4, 2]).unwrap(),
        };
        match kernel(2).classify(merged, 1) {
            PartitionOutput::Classified { labels, .. } => assert_eq!(labels[[0, 0]], 2),
            other => panic!("unexpected output {:?}", other),
        }
    }

    #[test]
    fn test_too_few_index_rows_is_config_error() {
        let comm = single_rank();
        let index = vec![partition(array![[0.0f32]], array![[1i64]], 0)];
        let data_layout = PartsToRanks::new(vec![PartRank { rank: 0, nrows: 1 }]);
        let query_layout = PartsToRanks::new(vec![]);
        let unique = UniqueLabelSet::from_labels(array![[1i64]].view());
        let job = KernelJob {
            mode: QueryMode::Classify,
            index: &index,
            data_layout: &data_layout,
            queries: &[],
            query_layout: &query_layout,
            unique_labels: &unique,
            n_features: 1,
        };
        assert!(matches!(kernel(2).run(&comm, &job).unwrap_err(), KnnError::Config { .. }));
    }
}
