//! Fundamental types shared across the driver, the workers and the
//! communicator.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Session-scoped integer identity of a worker.
pub type Rank = usize;

/// Class label value. Labels are discrete, totally ordered and hashable.
pub type ClassLabel = i64;

/// Distance value produced by the kernel.
pub type Distance = f32;

/// Address of a worker process, unique within a cluster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerAddress(String);

impl WorkerAddress {
    /// Create an address from any string-like value
    pub fn new<S: Into<String>>(address: S) -> Self {
        WorkerAddress(address.into())
    }

    /// The address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerAddress {
    fn from(value: &str) -> Self {
        WorkerAddress::new(value)
    }
}

/// Identifier of one communicator session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh session identifier
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key under which a task (and the object it produced) is known to the
/// scheduler and to the worker's object store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskKey(String);

impl TaskKey {
    /// Wrap an explicit key
    pub fn new<S: Into<String>>(key: S) -> Self {
        TaskKey(key.into())
    }

    /// The key as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Generates the keys of one submission wave: `"{uuid}-{idx}"`.
///
/// A fresh prefix is drawn per wave so that repeated calls never collide on
/// the scheduler.
#[derive(Debug, Clone)]
pub struct WaveKeys {
    prefix: Uuid,
}

impl WaveKeys {
    /// Draw a new wave prefix
    pub fn new() -> Self {
        WaveKeys {
            prefix: Uuid::new_v4(),
        }
    }

    /// Key of the `idx`-th task of the wave
    pub fn key(&self, idx: usize) -> TaskKey {
        TaskKey(format!("{}-{}", self.prefix, idx))
    }
}

impl Default for WaveKeys {
    fn default() -> Self {
        Self::new()
    }
}

/// Element type of a distributed array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 32-bit float
    Float32,
    /// 64-bit float
    Float64,
    /// 64-bit signed integer
    Int64,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DType::Float32 => "float32",
            DType::Float64 => "float64",
            DType::Int64 => "int64",
        };
        f.write_str(name)
    }
}

/// Selects the behavior of the local kernel for one query wave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryMode {
    /// Predicted labels plus neighbor indices and distances
    Classify,
    /// One class-probability matrix per target
    Probability,
}

impl fmt::Display for QueryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryMode::Classify => f.write_str("classify"),
            QueryMode::Probability => f.write_str("probability"),
        }
    }
}

/// Element types that can be stored in a distributed array.
pub trait Element: Clone + Copy + fmt::Debug + Send + Sync + 'static {
    /// Runtime tag of the element type
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::Float32;
}

impl Element for f64 {
    const DTYPE: DType = DType::Float64;
}

impl Element for i64 {
    const DTYPE: DType = DType::Int64;
}

/// Floating-point feature element types accepted as query data.
pub trait FeatureElement: Element + num_traits::Float + num_traits::AsPrimitive<f32> {}

impl FeatureElement for f32 {}

impl FeatureElement for f64 {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wave_keys_are_unique_per_wave() {
        let a = WaveKeys::new();
        let b = WaveKeys::new();
        assert_ne!(a.key(0), b.key(0));
        assert_ne!(a.key(0), a.key(1));
        assert!(a.key(3).as_str().ends_with("-3"));
    }

    #[test]
    fn test_dtype_tags() {
        assert_eq!(<f32 as Element>::DTYPE, DType::Float32);
        assert_eq!(<f64 as Element>::DTYPE, DType::Float64);
        assert_eq!(<i64 as Element>::DTYPE, DType::Int64);
        assert_eq!(DType::Float64.to_string(), "float64");
    }

    #[test]
    fn test_worker_address_ordering() {
        let mut addrs = vec![WorkerAddress::new("w-2"), WorkerAddress::new("w-0")];
        addrs.sort();
        assert_eq!(addrs[0].as_str(), "w-0");
    }

    #[test]
    fn test_session_id_serializes_as_uuid() {
        let id = SessionId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: SessionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);

        let bytes = bincode::serialize(&id).unwrap();
        assert_eq!(bincode::deserialize::<SessionId>(&bytes).unwrap(), id);
    }
}
