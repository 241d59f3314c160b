//! Error handling and error types for distributed KNN.
//!
//! Every fallible operation in the crate returns [`Result`]. Errors abort the
//! whole in-flight call: there is no partial-success mode and no operation is
//! retried automatically, so [`KnnError::is_recoverable`] is informational and
//! tells a caller whether issuing the same call again could succeed.

use crate::core::types::{Rank, SessionId, TaskKey, WorkerAddress};
use std::io;
use thiserror::Error;

/// Main error type for the distributed KNN library.
#[derive(Error, Debug)]
pub enum KnnError {
    /// Configuration and validation errors, including datasets that reference
    /// workers outside the current communicator
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Dataset-related errors
    #[error("Dataset error: {message}")]
    Dataset { message: String },

    /// Invalid input parameters
    #[error("Invalid parameter: {parameter} = {value}, {reason}")]
    InvalidParameter {
        parameter: String,
        value: String,
        reason: String,
    },

    /// Dimension mismatch errors
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: String, actual: String },

    /// An operation that needs a fitted model was called before `fit`
    #[error("Model not fitted: call fit before {operation}")]
    NotFitted { operation: String },

    /// The communicator session could not be established or looked up
    #[error("Communicator session {session_id} error: {message}")]
    Session {
        session_id: SessionId,
        message: String,
    },

    /// A peer aborted the communicator session while this rank was waiting
    #[error("Communicator session {session_id} aborted (observed by rank {rank})")]
    SessionAborted { session_id: SessionId, rank: Rank },

    /// The distributed KNN capability is not available on a worker
    #[error("Multi-worker KNN capability missing on worker {worker}")]
    CapabilityMissing { worker: WorkerAddress },

    /// A task placed on a worker failed; the worker's own error is the source
    #[error("Remote task {key} failed on worker {worker}: {source}")]
    RemoteTask {
        worker: WorkerAddress,
        key: TaskKey,
        #[source]
        source: Box<KnnError>,
    },

    /// A task key is already in flight on the scheduler
    #[error("Task key collision: {key}")]
    KeyCollision { key: TaskKey },

    /// A remote object was not found in a worker's store
    #[error("Object {key} not found on worker {worker}")]
    ObjectNotFound { worker: WorkerAddress, key: String },

    /// A blocking communicator operation exceeded its deadline
    #[error("Timed out after {millis} ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    /// File I/O errors
    #[error("I/O error: {source}")]
    IO {
        #[from]
        source: io::Error,
    },

    /// JSON serialization errors
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    /// TOML deserialization errors
    #[error("TOML error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },

    /// Wire encoding errors on the communicator
    #[error("Bincode error: {source}")]
    Bincode {
        #[from]
        source: bincode::Error,
    },

    /// Internal library errors (should not occur in normal usage)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Type alias for Results using KnnError
pub type Result<T> = std::result::Result<T, KnnError>;

impl KnnError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        KnnError::Config {
            message: message.into(),
        }
    }

    /// Create a dataset error
    pub fn dataset<S: Into<String>>(message: S) -> Self {
        KnnError::Dataset {
            message: message.into(),
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter<P, V, R>(parameter: P, value: V, reason: R) -> Self
    where
        P: Into<String>,
        V: Into<String>,
        R: Into<String>,
    {
        KnnError::InvalidParameter {
            parameter: parameter.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// Create a dimension mismatch error
    pub fn dimension_mismatch<E, A>(expected: E, actual: A) -> Self
    where
        E: Into<String>,
        A: Into<String>,
    {
        KnnError::DimensionMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a not-fitted error for the named operation
    pub fn not_fitted<S: Into<String>>(operation: S) -> Self {
        KnnError::NotFitted {
            operation: operation.into(),
        }
    }

    /// Create a session error
    pub fn session<S: Into<String>>(session_id: SessionId, message: S) -> Self {
        KnnError::Session {
            session_id,
            message: message.into(),
        }
    }

    /// Create a capability-missing error
    pub fn capability_missing(worker: WorkerAddress) -> Self {
        KnnError::CapabilityMissing { worker }
    }

    /// Wrap a worker-side error with the worker and task it came from
    pub fn remote(worker: WorkerAddress, key: TaskKey, source: KnnError) -> Self {
        KnnError::RemoteTask {
            worker,
            key,
            source: Box::new(source),
        }
    }

    /// Create an object-not-found error
    pub fn object_not_found<S: Into<String>>(worker: WorkerAddress, key: S) -> Self {
        KnnError::ObjectNotFound {
            worker,
            key: key.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, millis: u64) -> Self {
        KnnError::Timeout {
            operation: operation.into(),
            millis,
        }
    }

    /// Create an internal error (should be used sparingly)
    pub fn internal<S: Into<String>>(message: S) -> Self {
        KnnError::Internal {
            message: message.into(),
        }
    }

    /// The worker-side error behind any number of `RemoteTask` wrappers.
    pub fn root(&self) -> &KnnError {
        match self {
            KnnError::RemoteTask { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether this error only echoes a failure that happened elsewhere in
    /// the same session.
    pub fn is_session_echo(&self) -> bool {
        matches!(self.root(), KnnError::SessionAborted { .. })
    }

    /// Check if issuing the same call again could succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            KnnError::Config { .. } => false,
            KnnError::Dataset { .. } => false,
            KnnError::InvalidParameter { .. } => false,
            KnnError::DimensionMismatch { .. } => false,
            KnnError::NotFitted { .. } => false,
            KnnError::Session { .. } => true,
            KnnError::SessionAborted { .. } => true,
            KnnError::CapabilityMissing { .. } => false,
            KnnError::RemoteTask { source, .. } => source.is_recoverable(),
            KnnError::KeyCollision { .. } => true,
            KnnError::ObjectNotFound { .. } => false,
            KnnError::Timeout { .. } => true,
            KnnError::IO { .. } => false,
            KnnError::Json { .. } => false,
            KnnError::Toml { .. } => false,
            KnnError::Bincode { .. } => false,
            KnnError::Internal { .. } => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            KnnError::Config { .. } => "config",
            KnnError::Dataset { .. } => "dataset",
            KnnError::InvalidParameter { .. } => "invalid_parameter",
            KnnError::DimensionMismatch { .. } => "dimension_mismatch",
            KnnError::NotFitted { .. } => "not_fitted",
            KnnError::Session { .. } => "session",
            KnnError::SessionAborted { .. } => "session_aborted",
            KnnError::CapabilityMissing { .. } => "capability_missing",
            KnnError::RemoteTask { .. } => "remote_task",
            KnnError::KeyCollision { .. } => "key_collision",
            KnnError::ObjectNotFound { .. } => "object_not_found",
            KnnError::Timeout { .. } => "timeout",
            KnnError::IO { .. } => "io",
            KnnError::Json { .. } => "json",
            KnnError::Toml { .. } => "toml",
            KnnError::Bincode { .. } => "bincode",
            KnnError::Internal { .. } => "internal",
        }
    }
}

/// Convenience macros for error creation
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::core::error::KnnError::config($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::error::KnnError::config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! dataset_error {
    ($msg:expr) => {
        $crate::core::error::KnnError::dataset($msg)
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::core::error::KnnError::dataset(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! ensure {
    ($cond:expr, $err:expr) => {
        if !($cond) {
            return Err($err.into());
        }
    };
}
