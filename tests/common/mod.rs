//! Common test utilities for distributed KNN integration tests.

#![allow(dead_code)]

use distributed_knn::datagen::{make_classification, ClassificationSpec};
use distributed_knn::*;
use ndarray::{Array1, Array2};

/// Cluster of `n_workers` fully capable workers
pub fn create_cluster(n_workers: usize) -> LocalCluster {
    LocalCluster::new(ClusterConfig::with_workers(n_workers)).unwrap()
}

/// Cluster whose worker `index` cannot construct the KNN model
pub fn create_cluster_without_knn(n_workers: usize, index: usize) -> LocalCluster {
    let config = ClusterConfig::with_workers(n_workers)
        .worker_capabilities(index, WorkerCapabilities { multi_gpu_knn: false });
    LocalCluster::new(config).unwrap()
}

/// Well-separated classification problem as float32 features
pub fn create_classification_data(
    n_samples: usize,
    n_features: usize,
    n_classes: usize,
) -> (Array2<f32>, Array1<i64>) {
    let spec = ClassificationSpec {
        n_samples,
        n_features,
        n_informative: n_features.min(8),
        n_classes,
        class_sep: 3.0,
        seed: 42,
        ..ClassificationSpec::default()
    };
    let (x, y) = make_classification(&spec).unwrap();
    (x.mapv(|v| v as f32), y)
}

/// Scatter features in chunks of `chunk_rows` rows, round-robin
pub fn scatter_features<T: Element>(
    client: &Client,
    name: &str,
    x: &Array2<T>,
    chunk_rows: usize,
) -> DistributedArray<T> {
    DistributedArray::from_array(client, name, x.view(), chunk_rows, Placement::RoundRobin).unwrap()
}

/// Scatter labels exactly like [`scatter_features`]
pub fn scatter_labels(
    client: &Client,
    name: &str,
    y: &Array1<i64>,
    chunk_rows: usize,
) -> DistributedArray<i64> {
    DistributedArray::from_labels(client, name, y, chunk_rows, Placement::RoundRobin).unwrap()
}

/// Classifier fitted on `(x, y)`
pub fn fit_classifier(
    client: &Client,
    n_neighbors: usize,
    x: &DistributedArray<f32>,
    y: &DistributedArray<i64>,
) -> KNeighborsClassifier {
    let config = KnnConfigBuilder::new().n_neighbors(n_neighbors).build().unwrap();
    let mut knn = KNeighborsClassifier::new(client, config).unwrap();
    knn.fit(x, y).unwrap();
    knn
}

/// Sessions still installed anywhere in the cluster
pub fn open_sessions(cluster: &LocalCluster) -> usize {
    cluster
        .workers()
        .iter()
        .filter_map(|worker| cluster.context(worker))
        .map(|ctx| ctx.num_sessions())
        .sum()
}

/// Objects stored anywhere in the cluster
pub fn stored_objects(cluster: &LocalCluster) -> usize {
    cluster
        .workers()
        .iter()
        .filter_map(|worker| cluster.context(worker))
        .map(|ctx| ctx.num_objects())
        .sum()
}
