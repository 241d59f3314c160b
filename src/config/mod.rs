//! Configuration management for distributed KNN.
//!
//! [`KnnConfig`] holds the classifier hyperparameters that travel to every
//! worker; [`ClusterConfig`] shapes the in-process worker cluster.

pub mod cluster;
pub mod core;

pub use cluster::{ClusterConfig, WorkerCapabilities};
pub use self::core::{DistanceMetric, KnnConfig, KnnConfigBuilder, RankOrder};

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "distributed-knn.toml";
