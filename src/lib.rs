//! # Distributed KNN
//!
//! A multi-worker K-nearest-neighbors classifier. The index and the queries
//! are row-partitioned arrays living on the workers of a cluster; every
//! prediction runs as one wave of tasks that talk to each other through a
//! per-call communicator session.
//!
//! ## Features
//!
//! - **Distributed Data**: Row-partitioned arrays placed on workers explicitly
//!   or round-robin, with co-partitioning checks between features and labels.
//! - **Session Isolation**: Each predict call opens its own communicator,
//!   places one model per worker and tears everything down before returning,
//!   whether the call succeeded or not.
//! - **Order Preservation**: Results are reassembled in dataset row order no
//!   matter which rank owned which partition.
//! - **Multi-Output**: Any number of label columns, each with its own class set
//!   and its own probability matrix.
//! - **Parallel Processing**: Distance computation within a worker is spread
//!   over the Rayon thread pool.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use distributed_knn::{
//!     ClusterConfig, DistributedArray, KNeighborsClassifier, KnnConfigBuilder, LocalCluster,
//!     Placement,
//! };
//! use ndarray::{array, Array1};
//!
//! # fn main() -> distributed_knn::Result<()> {
//! distributed_knn::init()?;
//!
//! let cluster = LocalCluster::new(ClusterConfig::with_workers(2))?;
//! let client = cluster.client();
//!
//! let features = array![[0.0f32, 0.0], [0.1, 0.0], [5.0, 5.0], [5.1, 5.0]];
//! let labels = Array1::from(vec![0i64, 0, 1, 1]);
//! let x = DistributedArray::from_array(&client, "x", features.view(), 2, Placement::RoundRobin)?;
//! let y = DistributedArray::from_labels(&client, "y", &labels, 2, Placement::RoundRobin)?;
//!
//! let config = KnnConfigBuilder::new().n_neighbors(2).build()?;
//! let mut knn = KNeighborsClassifier::new(&client, config)?;
//! knn.fit(&x, &y)?;
//!
//! let prediction = knn.predict(&x, true)?;
//! println!("Labels: {:?}", prediction.labels);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`core`]: Fundamental types, constants and error handling
//! - [`config`]: Classifier hyperparameters and cluster shape
//! - [`runtime`]: In-process worker cluster and task submission
//! - [`dataset`]: Distributed arrays, partition grouping and rank layouts
//! - [`comms`]: Communicator sessions and point-to-point handles
//! - [`neighbors`]: The classifier, its per-worker models and the query wave
//! - [`datagen`]: Synthetic data and conversions for tests and benchmarks

#![doc(html_root_url = "https://docs.rs/distributed-knn/")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]

// Core infrastructure module - always available
pub mod core;

// Configuration management module
pub mod config;

// Worker cluster and task submission
pub mod runtime;

// Distributed array management module
pub mod dataset;

// Communicator sessions
pub mod comms;

// Nearest-neighbor classification
pub mod neighbors;

// Test-fixture data generation
pub mod datagen;

// Re-export core functionality for convenience
pub use self::core::{
    error::{KnnError, Result},
    types::*,
};

// Re-export configuration functionality
pub use config::{
    ClusterConfig, DistanceMetric, KnnConfig, KnnConfigBuilder, RankOrder, WorkerCapabilities,
};

// Re-export runtime functionality
pub use runtime::{Client, LocalCluster, TaskFuture, Wave, WorkerContext};

// Re-export dataset functionality
pub use dataset::{DataHandler, DistributedArray, PartitionedArray, Placement};

// Re-export communicator functionality
pub use comms::{CommHandle, CommunicatorSession, WorkerInfo};

// Re-export classification functionality
pub use neighbors::{KNeighborsClassifier, Prediction, UniqueLabelSet};

// Version information
pub use self::core::constants::DISTRIBUTED_KNN_VERSION as VERSION;

/// Initialize the library.
///
/// Installs the `env_logger` backend (unless the host already installed a
/// logger) and detects capabilities. Calling it more than once is harmless.
///
/// # Examples
///
/// ```rust
/// fn main() -> distributed_knn::Result<()> {
///     distributed_knn::init()?;
///     assert!(distributed_knn::is_initialized());
///     Ok(())
/// }
/// ```
pub fn init() -> Result<()> {
    core::initialize_core()
}

/// Check if the library has been initialized.
pub fn is_initialized() -> bool {
    core::is_core_initialized()
}

/// Get library capabilities and feature information.
///
/// ```rust
/// let caps = distributed_knn::capabilities();
/// println!("{}", caps.summary());
/// ```
pub fn capabilities() -> core::CoreCapabilities {
    core::core_capabilities()
}
