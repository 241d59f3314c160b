//! System constants and configuration defaults for distributed KNN.

/// Library version string.
pub const DISTRIBUTED_KNN_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default number of neighbors queried per row.
pub const DEFAULT_N_NEIGHBORS: usize = 5;

/// Default number of query rows handled per distance batch on a worker.
pub const DEFAULT_BATCH_SIZE: usize = 1024;

/// Default number of auxiliary streams attached to each worker handle.
pub const DEFAULT_STREAMS_PER_HANDLE: usize = 0;

/// Default bound on any blocking communicator receive, in milliseconds.
pub const DEFAULT_COMM_TIMEOUT_MS: u64 = 60_000;

/// Interval at which a blocked receive re-checks the session abort flag.
pub const COMM_POLL_INTERVAL_MS: u64 = 5;

/// Default number of workers in a local cluster.
pub const DEFAULT_NUM_WORKERS: usize = 2;

/// Default prefix of local worker addresses.
pub const DEFAULT_ADDRESS_PREFIX: &str = "inproc://worker";

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "DKNN_";

/// Tag space reserved for communicator bookkeeping (barriers).
pub const BARRIER_TAG: u64 = u64::MAX;
