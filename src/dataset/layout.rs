//! Partition-to-rank tables of a dataset under one communicator session.

use super::handler::DataHandler;
use crate::comms::WorkerInfo;
use crate::core::error::{KnnError, Result};
use crate::core::types::{Rank, WorkerAddress};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Row count and owning rank of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRank {
    /// Rank of the worker holding the partition
    pub rank: Rank,
    /// Rows in the partition
    pub nrows: usize,
}

/// Parts-to-ranks table: one entry per partition, in dataset order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartsToRanks {
    entries: Vec<PartRank>,
    total_rows: usize,
}

impl PartsToRanks {
    /// Build a table from entries in dataset order
    pub fn new(entries: Vec<PartRank>) -> Self {
        let total_rows = entries.iter().map(|e| e.nrows).sum();
        PartsToRanks {
            entries,
            total_rows,
        }
    }

    /// Entries in dataset order
    pub fn entries(&self) -> &[PartRank] {
        &self.entries
    }

    /// Number of partitions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no partitions
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all partition row counts
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    /// Global row index of the first row of every partition
    pub fn row_offsets(&self) -> Vec<usize> {
        self.entries
            .iter()
            .scan(0, |offset, entry| {
                let start = *offset;
                *offset += entry.nrows;
                Some(start)
            })
            .collect()
    }

    /// `(partition index, first global row)` of each partition held by
    /// `rank`, in dataset order
    pub fn owned_by(&self, rank: Rank) -> Vec<(usize, usize)> {
        self.row_offsets()
            .into_iter()
            .zip(&self.entries)
            .enumerate()
            .filter(|(_, (_, entry))| entry.rank == rank)
            .map(|(idx, (offset, _))| (idx, offset))
            .collect()
    }
}

/// Computes the layout of a dataset under a session's rank assignment.
pub struct PartitionDirectory;

impl PartitionDirectory {
    /// Map every partition of `handler` to the rank of its worker.
    ///
    /// Ranks differ between sessions, so the table must be rebuilt for each
    /// one. A partition held by a worker outside the session is a
    /// configuration error.
    pub fn layout(
        handler: &DataHandler,
        worker_info: &BTreeMap<WorkerAddress, WorkerInfo>,
    ) -> Result<PartsToRanks> {
        let entries = handler
            .parts()
            .iter()
            .enumerate()
            .map(|(idx, part)| {
                let info = worker_info.get(part.worker()).ok_or_else(|| {
                    KnnError::config(format!(
                        "partition {} of '{}' is held by {}, which is not part of the communicator",
                        idx,
                        handler.name(),
                        part.worker()
                    ))
                })?;
                Ok(PartRank {
                    rank: info.rank,
                    nrows: part.nrows(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let table = PartsToRanks::new(entries);
        log::debug!(
            "Layout of '{}': {} partitions, {} rows",
            handler.name(),
            table.len(),
            table.total_rows()
        );
        Ok(table)
    }
}
