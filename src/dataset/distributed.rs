//! Row-partitioned arrays whose partitions live in worker object stores.

use crate::core::error::{KnnError, Result};
use crate::core::types::{DType, Element, TaskKey, WaveKeys, WorkerAddress};
use crate::runtime::{Client, Wave};

use ndarray::{s, Array1, Array2, ArrayView2, Axis};
use std::collections::BTreeMap;
use std::marker::PhantomData;

/// Handle on one partition: which worker holds it and under which key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionHandle {
    key: TaskKey,
    worker: WorkerAddress,
    nrows: usize,
    ncols: usize,
}

impl PartitionHandle {
    /// Object-store key of the partition
    pub fn key(&self) -> &TaskKey {
        &self.key
    }

    /// Worker holding the partition
    pub fn worker(&self) -> &WorkerAddress {
        &self.worker
    }

    /// Row count of the partition
    pub fn nrows(&self) -> usize {
        self.nrows
    }

    /// Column count of the partition
    pub fn ncols(&self) -> usize {
        self.ncols
    }
}

/// Worker placement of the row chunks produced by [`DistributedArray::from_array`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Chunk `i` goes to live worker `i % n_workers`, workers in address order
    RoundRobin,
    /// Chunk `i` goes to `workers[i % workers.len()]`
    Workers(Vec<WorkerAddress>),
}

/// Type-erased view of a distributed array, enough to compute its layout.
pub trait PartitionedArray {
    /// Name of the array
    fn name(&self) -> &str;

    /// Partitions in row order
    fn partitions(&self) -> &[PartitionHandle];

    /// Column count
    fn ncols(&self) -> usize;

    /// Element type
    fn dtype(&self) -> DType;

    /// Total row count
    fn nrows(&self) -> usize {
        self.partitions().iter().map(PartitionHandle::nrows).sum()
    }
}

/// A named, ordered sequence of row chunks, each held by exactly one worker.
///
/// Partition order is fixed at construction and defines the row order of the
/// array. Cloning the array clones the handles, not the data.
#[derive(Debug, Clone)]
pub struct DistributedArray<T: Element> {
    name: String,
    client: Client,
    partitions: Vec<PartitionHandle>,
    ncols: usize,
    _element: PhantomData<T>,
}

impl<T: Element> DistributedArray<T> {
    /// Split `array` into chunks of `chunk_rows` rows and place them on workers.
    pub fn from_array(
        client: &Client,
        name: &str,
        array: ArrayView2<'_, T>,
        chunk_rows: usize,
        placement: Placement,
    ) -> Result<Self> {
        if chunk_rows == 0 {
            return Err(KnnError::invalid_parameter(
                "chunk_rows",
                "0",
                "must be at least 1",
            ));
        }
        if array.nrows() == 0 {
            return Err(KnnError::dataset(format!("array '{}' has no rows", name)));
        }

        let targets = match placement {
            Placement::RoundRobin => client.workers(),
            Placement::Workers(workers) => workers,
        };
        if targets.is_empty() {
            return Err(KnnError::config("no workers to place partitions on"));
        }

        let chunks = (0..array.nrows())
            .step_by(chunk_rows)
            .enumerate()
            .map(|(i, start)| {
                let end = (start + chunk_rows).min(array.nrows());
                (
                    targets[i % targets.len()].clone(),
                    array.slice(s![start..end, ..]).to_owned(),
                )
            })
            .collect();
        Self::from_partitions(client, name, chunks)
    }

    /// Place explicit `(worker, chunk)` pairs, in row order.
    pub fn from_partitions(
        client: &Client,
        name: &str,
        chunks: Vec<(WorkerAddress, Array2<T>)>,
    ) -> Result<Self> {
        let ncols = match chunks.first() {
            Some((_, chunk)) => chunk.ncols(),
            None => {
                return Err(KnnError::dataset(format!(
                    "array '{}' needs at least one partition",
                    name
                )))
            }
        };
        if let Some((_, chunk)) = chunks.iter().find(|(_, chunk)| chunk.ncols() != ncols) {
            return Err(KnnError::dimension_mismatch(
                format!("{} columns", ncols),
                format!("{} columns", chunk.ncols()),
            ));
        }

        let keys = WaveKeys::new();
        let mut partitions = Vec::with_capacity(chunks.len());
        let mut wave = Wave::new(format!("scatter {}", name));
        for (idx, (worker, chunk)) in chunks.into_iter().enumerate() {
            let key = TaskKey::new(format!("{}-{}", name, keys.key(idx)));
            partitions.push(PartitionHandle {
                key: key.clone(),
                worker: worker.clone(),
                nrows: chunk.nrows(),
                ncols,
            });
            wave.push(client.put(&worker, key, chunk)?);
        }
        wave.join()?;

        log::debug!(
            "Scattered '{}' ({}) as {} partitions",
            name,
            T::DTYPE,
            partitions.len()
        );
        Ok(DistributedArray {
            name: name.to_string(),
            client: client.clone(),
            partitions,
            ncols,
            _element: PhantomData,
        })
    }

    /// Split `array` along the partition boundaries and workers of `like`.
    pub fn from_array_like<A: PartitionedArray>(
        client: &Client,
        name: &str,
        array: ArrayView2<'_, T>,
        like: &A,
    ) -> Result<Self> {
        if array.nrows() != like.nrows() {
            return Err(KnnError::dimension_mismatch(
                format!("{} rows", like.nrows()),
                format!("{} rows", array.nrows()),
            ));
        }

        let mut start = 0;
        let chunks = like
            .partitions()
            .iter()
            .map(|handle| {
                let end = start + handle.nrows();
                let chunk = array.slice(s![start..end, ..]).to_owned();
                start = end;
                (handle.worker().clone(), chunk)
            })
            .collect();
        Self::from_partitions(client, name, chunks)
    }

    /// Bring every partition back to the driver and stack them in row order
    pub fn collect(&self) -> Result<Array2<T>> {
        let keys = WaveKeys::new();
        let mut wave = Wave::new(format!("gather {}", self.name));
        for (idx, handle) in self.partitions.iter().enumerate() {
            wave.push(self.client.fetch::<Array2<T>>(
                &handle.worker,
                keys.key(idx),
                handle.key.clone(),
            )?);
        }
        let parts: Vec<Array2<T>> = wave.join()?.into_iter().map(|(_, part)| part).collect();
        let views: Vec<ArrayView2<'_, T>> = parts.iter().map(|part| part.view()).collect();
        ndarray::concatenate(Axis(0), &views)
            .map_err(|e| KnnError::internal(format!("cannot stack '{}': {}", self.name, e)))
    }

    /// Remove every partition from its worker's store
    pub fn release(self) -> Result<()> {
        let mut by_worker: BTreeMap<WorkerAddress, Vec<TaskKey>> = BTreeMap::new();
        for handle in &self.partitions {
            by_worker
                .entry(handle.worker.clone())
                .or_default()
                .push(handle.key.clone());
        }

        let keys = WaveKeys::new();
        let mut wave = Wave::new(format!("release {}", self.name));
        for (idx, (worker, objects)) in by_worker.into_iter().enumerate() {
            wave.push(self.client.release(&worker, keys.key(idx), objects)?);
        }
        let removed: usize = wave.join()?.into_iter().map(|(_, n)| n).sum();
        log::debug!("Released {} partitions of '{}'", removed, self.name);
        Ok(())
    }

    /// Number of partitions
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Workers holding at least one partition, sorted
    pub fn workers(&self) -> Vec<WorkerAddress> {
        let mut workers: Vec<WorkerAddress> =
            self.partitions.iter().map(|h| h.worker.clone()).collect();
        workers.sort();
        workers.dedup();
        workers
    }

    /// Client the array was scattered with
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl DistributedArray<i64> {
    /// Scatter a single label column as an `(n, 1)` array.
    pub fn from_labels(
        client: &Client,
        name: &str,
        labels: &Array1<i64>,
        chunk_rows: usize,
        placement: Placement,
    ) -> Result<Self> {
        let column = labels.view().insert_axis(Axis(1));
        Self::from_array(client, name, column, chunk_rows, placement)
    }
}

impl<T: Element> PartitionedArray for DistributedArray<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn partitions(&self) -> &[PartitionHandle] {
        &self.partitions
    }

    fn ncols(&self) -> usize {
        self.ncols
    }

    fn dtype(&self) -> DType {
        T::DTYPE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterConfig;
    use crate::runtime::LocalCluster;
    use ndarray::array;

    #[test]
    fn test_round_robin_chunks() {
        let cluster = LocalCluster::new(ClusterConfig::with_workers(2)).unwrap();
        let client = cluster.client();
        let data = Array2::from_shape_fn((7, 3), |(i, j)| (i * 3 + j) as f32);

        let array =
            DistributedArray::from_array(&client, "x", data.view(), 3, Placement::RoundRobin)
                .unwrap();
        assert_eq!(array.num_partitions(), 3);
        assert_eq!(array.nrows(), 7);
        assert_eq!(array.ncols(), 3);
        let rows: Vec<usize> = array.partitions().iter().map(|h| h.nrows()).collect();
        assert_eq!(rows, vec![3, 3, 1]);
        assert_eq!(array.partitions()[0].worker(), array.partitions()[2].worker());
        assert_eq!(array.collect().unwrap(), data);
    }

    #[test]
    fn test_explicit_partitions_and_release() {
        let cluster = LocalCluster::new(ClusterConfig::with_workers(2)).unwrap();
        let client = cluster.client();
        let workers = client.workers();

        let array = DistributedArray::from_partitions(
            &client,
            "y",
            vec![
                (workers[1].clone(), array![[1i64], [2]]),
                (workers[0].clone(), array![[3i64]]),
            ],
        )
        .unwrap();
        assert_eq!(array.dtype(), DType::Int64);
        assert_eq!(array.collect().unwrap(), array![[1i64], [2], [3]]);

        array.release().unwrap();
        for worker in &workers {
            assert_eq!(cluster.context(worker).unwrap().num_objects(), 0);
        }
    }

    #[test]
    fn test_ragged_partitions_rejected() {
        let cluster = LocalCluster::new(ClusterConfig::with_workers(1)).unwrap();
        let client = cluster.client();
        let worker = client.workers()[0].clone();
        let err = DistributedArray::from_partitions(
            &client,
            "bad",
            vec![
                (worker.clone(), Array2::<f32>::zeros((2, 3))),
                (worker, Array2::<f32>::zeros((2, 4))),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, KnnError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_labels_follow_feature_layout() {
        let cluster = LocalCluster::new(ClusterConfig::with_workers(3)).unwrap();
        let client = cluster.client();
        let x = DistributedArray::from_array(
            &client,
            "x",
            Array2::<f64>::zeros((10, 2)).view(),
            4,
            Placement::RoundRobin,
        )
        .unwrap();
        let labels = Array2::from_shape_fn((10, 2), |(i, j)| (i + j) as i64);
        let y = DistributedArray::from_array_like(&client, "y", labels.view(), &x).unwrap();

        for (a, b) in x.partitions().iter().zip(y.partitions()) {
            assert_eq!(a.worker(), b.worker());
            assert_eq!(a.nrows(), b.nrows());
        }

        let labels = array![4i64, 5, 6];
        let single =
            DistributedArray::from_labels(&client, "l", &labels, 2, Placement::RoundRobin).unwrap();
        assert_eq!(single.ncols(), 1);
        assert_eq!(single.collect().unwrap(), array![[4i64], [5], [6]]);
    }
}
