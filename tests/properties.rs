//! Property tests of rank assignment and result reassembly.

use distributed_knn::comms::assign_ranks;
use distributed_knn::dataset::{PartRank, PartitionDirectory, PartsToRanks};
use distributed_knn::neighbors::{PartitionOutput, RankResults, ResultAggregator, ResultChannel};
use distributed_knn::{
    ClusterConfig, CommunicatorSession, DataHandler, DistributedArray, KnnConfig, LocalCluster,
    Placement, RankOrder, WorkerAddress,
};
use ndarray::Array2;
use proptest::prelude::*;
use std::collections::BTreeSet;

fn addresses(ids: &[u8]) -> Vec<WorkerAddress> {
    ids.iter().map(|id| WorkerAddress::new(format!("w-{:03}", id))).collect()
}

fn layout_strategy() -> impl Strategy<Value = (usize, Vec<(usize, usize)>)> {
    (1usize..6).prop_flat_map(|n_ranks| {
        (
            Just(n_ranks),
            prop::collection::vec((0..n_ranks, 1usize..8), 1..12),
        )
    })
}

proptest! {
    #[test]
    fn prop_rank_assignment_is_a_bijection(
        ids in prop::collection::vec(any::<u8>(), 1..20),
        seed in any::<u64>(),
    ) {
        let workers = addresses(&ids);
        let distinct: BTreeSet<WorkerAddress> = workers.iter().cloned().collect();

        for order in [RankOrder::Sorted, RankOrder::Shuffled { seed }] {
            let ranked = assign_ranks(&workers, order);
            prop_assert_eq!(ranked.len(), distinct.len());
            let seen: BTreeSet<WorkerAddress> = ranked.iter().cloned().collect();
            prop_assert_eq!(&seen, &distinct);
        }

        let sorted = assign_ranks(&workers, RankOrder::Sorted);
        prop_assert!(sorted.windows(2).all(|pair| pair[0] < pair[1]));
        prop_assert_eq!(
            assign_ranks(&workers, RankOrder::Shuffled { seed }),
            assign_ranks(&workers, RankOrder::Shuffled { seed })
        );
    }

    #[test]
    fn prop_layout_conserves_rows((n_ranks, parts) in layout_strategy()) {
        let layout = PartsToRanks::new(
            parts.iter().map(|&(rank, nrows)| PartRank { rank, nrows }).collect(),
        );
        let expected: usize = parts.iter().map(|&(_, nrows)| nrows).sum();
        prop_assert_eq!(layout.total_rows(), expected);

        let offsets = layout.row_offsets();
        for (idx, &(_, nrows)) in parts.iter().enumerate() {
            let end = offsets.get(idx + 1).copied().unwrap_or(expected);
            prop_assert_eq!(end - offsets[idx], nrows);
        }

        let mut owned: Vec<usize> = (0..n_ranks)
            .flat_map(|rank| layout.owned_by(rank).into_iter().map(|(idx, _)| idx))
            .collect();
        owned.sort_unstable();
        prop_assert_eq!(owned, (0..parts.len()).collect::<Vec<_>>());
    }

    #[test]
    fn prop_flatten_restores_row_order((n_ranks, parts) in layout_strategy()) {
        let layout = PartsToRanks::new(
            parts.iter().map(|&(rank, nrows)| PartRank { rank, nrows }).collect(),
        );

        // Each rank returns its partitions in dataset order, tagged with
        // their global row numbers.
        let mut results = RankResults::new();
        for rank in 0..n_ranks {
            let outputs: Vec<PartitionOutput> = layout
                .owned_by(rank)
                .into_iter()
                .map(|(idx, offset)| {
                    let labels =
                        Array2::from_shape_fn((parts[idx].1, 1), |(i, _)| (offset + i) as i64);
                    PartitionOutput::Classified {
                        indices: labels.clone(),
                        distances: labels.mapv(|v| v as f32),
                        labels,
                    }
                })
                .collect();
            if !outputs.is_empty() {
                results.insert(rank, outputs);
            }
        }

        let blocks = ResultAggregator::flatten(&layout, &results, ResultChannel::Labels).unwrap();
        let labels = ResultAggregator::concat_int(blocks).unwrap();
        let expected: Vec<i64> = (0..layout.total_rows() as i64).collect();
        prop_assert_eq!(labels.column(0).to_vec(), expected);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_directory_layout_conserves_rows(
        n_workers in 1usize..4,
        n_rows in 1usize..60,
        chunk_rows in 1usize..16,
        seed in any::<u64>(),
    ) {
        let cluster = LocalCluster::new(ClusterConfig::with_workers(n_workers)).unwrap();
        let client = cluster.client();
        let workers = client.workers();
        let config = KnnConfig {
            rank_order: RankOrder::Shuffled { seed },
            ..KnnConfig::default()
        };
        let session = CommunicatorSession::open(&client, &workers, &config).unwrap();

        let x = DistributedArray::from_array(
            &client,
            "x",
            Array2::<f32>::zeros((n_rows, 3)).view(),
            chunk_rows,
            Placement::RoundRobin,
        )
        .unwrap();
        let handler = DataHandler::create(&x, &client).unwrap();
        let layout = PartitionDirectory::layout(&handler, &session.worker_info(&workers)).unwrap();

        prop_assert_eq!(layout.total_rows(), n_rows);
        prop_assert_eq!(layout.len(), n_rows.div_ceil(chunk_rows));
        let per_rank: usize = (0..session.size())
            .flat_map(|rank| layout.owned_by(rank))
            .map(|(idx, _)| layout.entries()[idx].nrows)
            .sum();
        prop_assert_eq!(per_rank, n_rows);

        session.destroy().unwrap();
    }
}
