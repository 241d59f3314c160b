//! Reassembly of per-rank results into dataset row order.
//!
//! Each rank returns the outputs of the query partitions it owns in its own
//! order. Walking the query parts-to-ranks table in dataset order while
//! keeping one cursor per rank puts every partition back where it came from.

use super::executor::RankResults;
use super::kernel::PartitionOutput;
use crate::core::error::{KnnError, Result};
use crate::core::types::{ClassLabel, Distance, Rank};
use crate::dataset::PartsToRanks;

use ndarray::{Array2, ArrayView2, Axis};
use std::collections::BTreeMap;

/// One logical output of a query wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultChannel {
    /// Predicted labels, one column per target
    Labels,
    /// Global row indices of the neighbors
    NeighborIndices,
    /// Distances to the neighbors
    NeighborDistances,
    /// Class probabilities of one target
    ProbabilityForTarget(usize),
}

/// The block of one channel for one query partition.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelBlock {
    /// Labels or neighbor indices
    Int(Array2<i64>),
    /// Distances or probabilities
    Float(Array2<f32>),
}

impl ChannelBlock {
    /// Rows in the block
    pub fn nrows(&self) -> usize {
        match self {
            ChannelBlock::Int(block) => block.nrows(),
            ChannelBlock::Float(block) => block.nrows(),
        }
    }
}

fn extract(output: &PartitionOutput, channel: ResultChannel) -> Result<ChannelBlock> {
    match (output, channel) {
        (PartitionOutput::Classified { labels, .. }, ResultChannel::Labels) => {
            Ok(ChannelBlock::Int(labels.clone()))
        }
        (PartitionOutput::Classified { indices, .. }, ResultChannel::NeighborIndices) => {
            Ok(ChannelBlock::Int(indices.clone()))
        }
        (PartitionOutput::Classified { distances, .. }, ResultChannel::NeighborDistances) => {
            Ok(ChannelBlock::Float(distances.clone()))
        }
        (PartitionOutput::Probabilities(matrices), ResultChannel::ProbabilityForTarget(target)) => {
            matrices
                .get(target)
                .cloned()
                .map(ChannelBlock::Float)
                .ok_or_else(|| {
                    KnnError::internal(format!("no probability matrix for target {}", target))
                })
        }
        (_, channel) => Err(KnnError::internal(format!(
            "channel {:?} is not produced by this query mode",
            channel
        ))),
    }
}

/// Regroups per-rank results.
pub struct ResultAggregator;

impl ResultAggregator {
    /// Blocks of `channel` for every query partition, in dataset order.
    ///
    /// Fails if a rank returned more or fewer partitions than the layout
    /// assigns it, or a block's row count disagrees with its partition.
    pub fn flatten(
        query_layout: &PartsToRanks,
        results: &RankResults,
        channel: ResultChannel,
    ) -> Result<Vec<ChannelBlock>> {
        let mut cursors: BTreeMap<Rank, usize> = BTreeMap::new();
        let mut blocks = Vec::with_capacity(query_layout.len());

        for (idx, entry) in query_layout.entries().iter().enumerate() {
            let cursor = cursors.entry(entry.rank).or_insert(0);
            let output = results
                .get(&entry.rank)
                .and_then(|outputs| outputs.get(*cursor))
                .ok_or_else(|| {
                    KnnError::internal(format!(
                        "rank {} returned no result for query partition {}",
                        entry.rank, idx
                    ))
                })?;
            *cursor += 1;

            let block = extract(output, channel)?;
            if block.nrows() != entry.nrows {
                return Err(KnnError::dimension_mismatch(
                    format!("{} rows in query partition {}", entry.nrows, idx),
                    format!("{} rows", block.nrows()),
                ));
            }
            blocks.push(block);
        }

        for (rank, outputs) in results {
            let consumed = cursors.get(rank).copied().unwrap_or(0);
            if consumed != outputs.len() {
                return Err(KnnError::internal(format!(
                    "rank {} returned {} partitions, layout assigns {}",
                    rank,
                    outputs.len(),
                    consumed
                )));
            }
        }
        Ok(blocks)
    }

    /// Stack integer blocks into one array
    pub fn concat_int(blocks: Vec<ChannelBlock>) -> Result<Array2<ClassLabel>> {
        let arrays = blocks
            .into_iter()
            .map(|block| match block {
                ChannelBlock::Int(array) => Ok(array),
                ChannelBlock::Float(_) => Err(KnnError::internal("expected an integer channel")),
            })
            .collect::<Result<Vec<_>>>()?;
        stack(&arrays)
    }

    /// Stack float blocks into one array
    pub fn concat_float(blocks: Vec<ChannelBlock>) -> Result<Array2<Distance>> {
        let arrays = blocks
            .into_iter()
            .map(|block| match block {
                ChannelBlock::Float(array) => Ok(array),
                ChannelBlock::Int(_) => Err(KnnError::internal("expected a float channel")),
            })
            .collect::<Result<Vec<_>>>()?;
        stack(&arrays)
    }
}

fn stack<T: Clone>(arrays: &[Array2<T>]) -> Result<Array2<T>> {
    if arrays.is_empty() {
        return Err(KnnError::internal("no partitions to stack"));
    }
    let views: Vec<ArrayView2<'_, T>> = arrays.iter().map(Array2::view).collect();
    ndarray::concatenate(Axis(0), &views)
        .map_err(|e| KnnError::internal(format!("cannot stack results: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::PartRank;
    use ndarray::array;

    fn classified(first: i64, rows: usize) -> PartitionOutput {
        let labels = Array2::from_shape_fn((rows, 1), |(i, _)| first + i as i64);
        PartitionOutput::Classified {
            indices: labels.clone(),
            distances: labels.mapv(|v| v as f32),
            labels,
        }
    }

    #[test]
    fn test_flatten_restores_dataset_order() {
        // Partitions 0 and 2 live on rank 1, partition 1 on rank 0.
        let layout = PartsToRanks::new(vec![
            PartRank { rank: 1, nrows: 2 },
            PartRank { rank: 0, nrows: 1 },
            PartRank { rank: 1, nrows: 2 },
        ]);
        let mut results = RankResults::new();
        results.insert(0, vec![classified(2, 1)]);
        results.insert(1, vec![classified(0, 2), classified(3, 2)]);

        let blocks = ResultAggregator::flatten(&layout, &results, ResultChannel::Labels).unwrap();
        let labels = ResultAggregator::concat_int(blocks).unwrap();
        assert_eq!(labels, array![[0i64], [1], [2], [3], [4]]);

        let distances = ResultAggregator::concat_float(
            ResultAggregator::flatten(&layout, &results, ResultChannel::NeighborDistances).unwrap(),
        )
        .unwrap();
        assert_eq!(distances.column(0).to_vec(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_flatten_rejects_inconsistent_results() {
        let layout = PartsToRanks::new(vec![PartRank { rank: 0, nrows: 2 }]);

        let mut extra = RankResults::new();
        extra.insert(0, vec![classified(0, 2), classified(2, 2)]);
        assert!(ResultAggregator::flatten(&layout, &extra, ResultChannel::Labels).is_err());

        let mut short = RankResults::new();
        short.insert(0, vec![classified(0, 3)]);
        assert!(matches!(
            ResultAggregator::flatten(&layout, &short, ResultChannel::Labels).unwrap_err(),
            KnnError::DimensionMismatch { .. }
        ));

        let channel = ResultChannel::ProbabilityForTarget(0);
        assert!(ResultAggregator::flatten(&layout, &extra, channel).is_err());
    }
}
