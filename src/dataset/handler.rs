//! Worker-grouped view of one or more co-partitioned distributed arrays.

use super::distributed::{PartitionHandle, PartitionedArray};
use crate::core::error::{KnnError, Result};
use crate::core::types::{DType, WorkerAddress};
use crate::runtime::Client;

use std::collections::{BTreeMap, BTreeSet};

/// The `i`-th partition of every array held by a handler.
#[derive(Debug, Clone)]
pub struct PartGroup {
    worker: WorkerAddress,
    handles: Vec<PartitionHandle>,
    nrows: usize,
}

impl PartGroup {
    /// Worker holding the group
    pub fn worker(&self) -> &WorkerAddress {
        &self.worker
    }

    /// One handle per array, in array order
    pub fn handles(&self) -> &[PartitionHandle] {
        &self.handles
    }

    /// Row count shared by every handle of the group
    pub fn nrows(&self) -> usize {
        self.nrows
    }
}

/// Partitions of one dataset grouped by the worker that holds them.
#[derive(Debug, Clone)]
pub struct DataHandler {
    name: String,
    parts: Vec<PartGroup>,
    worker_to_parts: BTreeMap<WorkerAddress, Vec<usize>>,
    total_rows: usize,
    n_cols: Vec<usize>,
    dtypes: Vec<DType>,
}

impl DataHandler {
    /// Handler over a single array
    pub fn create<A: PartitionedArray>(array: &A, client: &Client) -> Result<Self> {
        Self::create_co_partitioned(&[array as &dyn PartitionedArray], client)
    }

    /// Handler over arrays that must share partition count, owners and row
    /// counts, such as features and labels of one training set.
    pub fn create_co_partitioned(
        arrays: &[&dyn PartitionedArray],
        client: &Client,
    ) -> Result<Self> {
        let first = arrays
            .first()
            .ok_or_else(|| KnnError::config("a data handler needs at least one array"))?;

        for other in &arrays[1..] {
            if other.partitions().len() != first.partitions().len() {
                return Err(KnnError::dataset(format!(
                    "'{}' has {} partitions but '{}' has {}",
                    other.name(),
                    other.partitions().len(),
                    first.name(),
                    first.partitions().len()
                )));
            }
        }

        let live: BTreeSet<WorkerAddress> = client.workers().into_iter().collect();
        let mut parts = Vec::with_capacity(first.partitions().len());
        let mut worker_to_parts: BTreeMap<WorkerAddress, Vec<usize>> = BTreeMap::new();

        for (idx, lead) in first.partitions().iter().enumerate() {
            if !live.contains(lead.worker()) {
                return Err(KnnError::config(format!(
                    "partition {} of '{}' is held by unknown worker {}",
                    idx,
                    first.name(),
                    lead.worker()
                )));
            }

            let mut handles = Vec::with_capacity(arrays.len());
            for array in arrays {
                let handle = &array.partitions()[idx];
                if handle.worker() != lead.worker() || handle.nrows() != lead.nrows() {
                    return Err(KnnError::dataset(format!(
                        "partition {} of '{}' ({} rows on {}) does not match '{}' ({} rows on {})",
                        idx,
                        array.name(),
                        handle.nrows(),
                        handle.worker(),
                        first.name(),
                        lead.nrows(),
                        lead.worker()
                    )));
                }
                handles.push(handle.clone());
            }

            worker_to_parts
                .entry(lead.worker().clone())
                .or_default()
                .push(idx);
            parts.push(PartGroup {
                worker: lead.worker().clone(),
                handles,
                nrows: lead.nrows(),
            });
        }

        Ok(DataHandler {
            name: first.name().to_string(),
            total_rows: parts.iter().map(PartGroup::nrows).sum(),
            parts,
            worker_to_parts,
            n_cols: arrays.iter().map(|a| a.ncols()).collect(),
            dtypes: arrays.iter().map(|a| a.dtype()).collect(),
        })
    }

    /// Name of the leading array
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Partition groups in row order
    pub fn parts(&self) -> &[PartGroup] {
        &self.parts
    }

    /// Indices into [`parts`](Self::parts) held by each worker, in row order
    pub fn worker_to_parts(&self) -> &BTreeMap<WorkerAddress, Vec<usize>> {
        &self.worker_to_parts
    }

    /// Workers holding at least one partition, sorted
    pub fn workers(&self) -> Vec<WorkerAddress> {
        self.worker_to_parts.keys().cloned().collect()
    }

    /// Partition groups held by `worker`, in row order
    pub fn parts_of(&self, worker: &WorkerAddress) -> Vec<&PartGroup> {
        self.worker_to_parts
            .get(worker)
            .map(|indices| indices.iter().map(|&i| &self.parts[i]).collect())
            .unwrap_or_default()
    }

    /// Total row count
    pub fn total_rows(&self) -> usize {
        self.total_rows
    }

    /// Column count of the leading array
    pub fn n_cols(&self) -> usize {
        self.n_cols[0]
    }

    /// Column count of array `array`
    pub fn n_cols_of(&self, array: usize) -> Option<usize> {
        self.n_cols.get(array).copied()
    }

    /// Element type of array `array`
    pub fn dtype(&self, array: usize) -> Option<DType> {
        self.dtypes.get(array).copied()
    }

    /// Number of arrays held
    pub fn num_arrays(&self) -> usize {
        self.n_cols.len()
    }
}
