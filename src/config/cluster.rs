//! Configuration of the in-process worker cluster.

use crate::core::constants::*;
use crate::core::error::{KnnError, Result};
use crate::core::types::WorkerAddress;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Capabilities a worker declares when it starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    /// The worker can construct the multi-worker KNN model
    pub multi_gpu_knn: bool,
}

impl Default for WorkerCapabilities {
    fn default() -> Self {
        WorkerCapabilities {
            multi_gpu_knn: true,
        }
    }
}

/// Configuration of a [`LocalCluster`](crate::runtime::LocalCluster).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Number of worker processes
    pub n_workers: usize,
    /// Address prefix; worker `i` is reachable at `{prefix}-{i}`
    pub address_prefix: String,
    /// Capabilities of every worker unless overridden
    pub default_capabilities: WorkerCapabilities,
    /// Per-worker capability overrides, keyed by worker index
    pub capability_overrides: BTreeMap<usize, WorkerCapabilities>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            n_workers: DEFAULT_NUM_WORKERS,
            address_prefix: DEFAULT_ADDRESS_PREFIX.to_string(),
            default_capabilities: WorkerCapabilities::default(),
            capability_overrides: BTreeMap::new(),
        }
    }
}

impl ClusterConfig {
    /// Cluster of `n_workers` fully capable workers
    pub fn with_workers(n_workers: usize) -> Self {
        ClusterConfig {
            n_workers,
            ..Self::default()
        }
    }

    /// Override the capabilities of worker `index`
    pub fn worker_capabilities(mut self, index: usize, caps: WorkerCapabilities) -> Self {
        self.capability_overrides.insert(index, caps);
        self
    }

    /// Validate the cluster shape
    pub fn validate(&self) -> Result<()> {
        if self.n_workers == 0 {
            return Err(KnnError::invalid_parameter(
                "n_workers",
                "0",
                "a cluster needs at least one worker",
            ));
        }
        if self.address_prefix.is_empty() {
            return Err(KnnError::invalid_parameter(
                "address_prefix",
                "",
                "must not be empty",
            ));
        }
        if let Some(&index) = self
            .capability_overrides
            .keys()
            .find(|&&index| index >= self.n_workers)
        {
            return Err(KnnError::invalid_parameter(
                "capability_overrides",
                index.to_string(),
                format!("worker index out of range for {} workers", self.n_workers),
            ));
        }
        Ok(())
    }

    /// Address of worker `index`
    pub fn address(&self, index: usize) -> WorkerAddress {
        WorkerAddress::new(format!("{}-{}", self.address_prefix, index))
    }

    /// Capabilities of worker `index`
    pub fn capabilities(&self, index: usize) -> WorkerCapabilities {
        self.capability_overrides
            .get(&index)
            .copied()
            .unwrap_or(self.default_capabilities)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.n_workers, DEFAULT_NUM_WORKERS);
        assert!(config.validate().is_ok());
        assert_eq!(config.address(1).as_str(), "inproc://worker-1");
    }

    #[test]
    fn test_capability_overrides() {
        let config = ClusterConfig::with_workers(3).worker_capabilities(
            2,
            WorkerCapabilities {
                multi_gpu_knn: false,
            },
        );
        assert!(config.capabilities(0).multi_gpu_knn);
        assert!(!config.capabilities(2).multi_gpu_knn);
        assert!(config.validate().is_ok());

        let bad =
            ClusterConfig::with_workers(2).worker_capabilities(5, WorkerCapabilities::default());
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(ClusterConfig::with_workers(0).validate().is_err());
    }
}
