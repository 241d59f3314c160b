//! Distributed K-nearest-neighbors classification.
//!
//! A predict call runs as:
//!
//! 1. [`PartitionDirectory`](crate::dataset::PartitionDirectory) lays out
//!    index and query partitions under a fresh
//!    [`CommunicatorSession`](crate::comms::CommunicatorSession);
//! 2. [`WorkerModelFactory`] places one [`KnnClassifierMg`] on every worker;
//! 3. [`QueryPlan`] assembles one task per rank and
//!    [`DistributedQueryExecutor`] runs them as a single wave;
//! 4. [`ResultAggregator`] restores dataset row order per [`ResultChannel`];
//! 5. the session is destroyed.

pub mod aggregate;
pub mod classifier;
pub mod executor;
pub mod kernel;
pub mod labels;
pub mod model;

pub use aggregate::{ChannelBlock, ResultAggregator, ResultChannel};
pub use classifier::{KNeighborsClassifier, Prediction};
pub use executor::{DistributedQueryExecutor, QueryPlan, QueryRequest, RankResults, WorkerTask};
pub use kernel::{BruteForceKernel, IndexPartition, KernelJob, LocalKnnKernel, PartitionOutput};
pub use labels::UniqueLabelSet;
pub use model::{KnnClassifierMg, ModelHandles, WorkerModelFactory};
