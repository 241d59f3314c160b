//! Hyperparameters of the distributed KNN classifier.
//!
//! [`KnnConfig`] is the explicit, validated configuration that is passed by
//! value to every worker when its local model is constructed.

use crate::core::constants::*;
use crate::core::error::{KnnError, Result};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

/// Distance metric used by the local kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// L2 distance
    Euclidean,
    /// Squared L2 distance
    SquaredEuclidean,
    /// L1 distance
    Manhattan,
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::SquaredEuclidean => "sqeuclidean",
            DistanceMetric::Manhattan => "manhattan",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for DistanceMetric {
    type Err = KnnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            "sqeuclidean" | "squared_euclidean" => Ok(DistanceMetric::SquaredEuclidean),
            "manhattan" | "l1" | "cityblock" => Ok(DistanceMetric::Manhattan),
            other => Err(KnnError::invalid_parameter(
                "metric",
                other,
                "expected euclidean, sqeuclidean or manhattan",
            )),
        }
    }
}

/// How ranks are assigned to workers when a communicator session opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankOrder {
    /// Ranks follow the sorted worker addresses
    Sorted,
    /// Ranks are a seeded random permutation of the sorted addresses
    Shuffled { seed: u64 },
}

/// Configuration of the distributed KNN classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KnnConfig {
    /// Number of neighbors used for each query row
    pub n_neighbors: usize,
    /// Distance metric
    pub metric: DistanceMetric,
    /// Query rows per distance batch on a worker
    pub batch_size: usize,
    /// Auxiliary streams attached to each worker handle
    pub streams_per_handle: usize,
    /// Log per-call progress at info level instead of debug
    pub verbose: bool,
    /// Bound on any blocking communicator receive, in milliseconds
    pub comm_timeout_ms: u64,
    /// Rank assignment policy of each communicator session
    pub rank_order: RankOrder,
}

impl Default for KnnConfig {
    fn default() -> Self {
        KnnConfig {
            n_neighbors: DEFAULT_N_NEIGHBORS,
            metric: DistanceMetric::Euclidean,
            batch_size: DEFAULT_BATCH_SIZE,
            streams_per_handle: DEFAULT_STREAMS_PER_HANDLE,
            verbose: false,
            comm_timeout_ms: DEFAULT_COMM_TIMEOUT_MS,
            rank_order: RankOrder::Sorted,
        }
    }
}

impl KnnConfig {
    /// Create a default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate all parameters
    pub fn validate(&self) -> Result<()> {
        if self.n_neighbors == 0 {
            return Err(KnnError::invalid_parameter(
                "n_neighbors",
                "0",
                "must be at least 1",
            ));
        }

        if self.batch_size == 0 {
            return Err(KnnError::invalid_parameter(
                "batch_size",
                "0",
                "must be at least 1",
            ));
        }

        if self.comm_timeout_ms == 0 {
            return Err(KnnError::invalid_parameter(
                "comm_timeout_ms",
                "0",
                "must be positive",
            ));
        }

        if self.streams_per_handle > 64 {
            log::warn!(
                "streams_per_handle ({}) is unusually large",
                self.streams_per_handle
            );
        }

        Ok(())
    }

    /// Load configuration from a `.json` or `.toml` file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| KnnError::config(format!("Failed to read config file: {}", e)))?;

        let config: KnnConfig = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            _ => {
                return Err(KnnError::config(
                    "Unsupported config file format. Use .json or .toml",
                ))
            }
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a `.json` or `.toml` file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string_pretty(self)
                .map_err(|e| KnnError::config(format!("Failed to serialize to TOML: {}", e)))?,
            _ => {
                return Err(KnnError::config(
                    "Unsupported config file format. Use .json or .toml",
                ))
            }
        };

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from `DKNN_*` environment variables
    pub fn load_from_environment() -> Result<Self> {
        let mut config = KnnConfig::default();
        config.apply_variables(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DKNN_*` environment variable overrides to this configuration
    pub fn apply_environment_overrides(&mut self) -> Result<()> {
        self.apply_variables(|name| std::env::var(format!("{}{}", ENV_PREFIX, name)).ok())?;
        self.validate()
    }

    fn apply_variables<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("N_NEIGHBORS") {
            self.n_neighbors = val
                .parse()
                .map_err(|_| KnnError::config("Invalid DKNN_N_NEIGHBORS"))?;
        }

        if let Some(val) = lookup("BATCH_SIZE") {
            self.batch_size = val
                .parse()
                .map_err(|_| KnnError::config("Invalid DKNN_BATCH_SIZE"))?;
        }

        if let Some(val) = lookup("METRIC") {
            self.metric = val.parse()?;
        }

        if let Some(val) = lookup("COMM_TIMEOUT_MS") {
            self.comm_timeout_ms = val
                .parse()
                .map_err(|_| KnnError::config("Invalid DKNN_COMM_TIMEOUT_MS"))?;
        }

        if let Some(val) = lookup("VERBOSE") {
            self.verbose = matches!(val.as_str(), "1" | "true" | "TRUE" | "yes");
        }

        Ok(())
    }

    /// Flat parameter view, used when logging model construction
    pub fn as_parameter_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("n_neighbors".to_string(), self.n_neighbors.to_string());
        map.insert("metric".to_string(), self.metric.to_string());
        map.insert("batch_size".to_string(), self.batch_size.to_string());
        map.insert(
            "streams_per_handle".to_string(),
            self.streams_per_handle.to_string(),
        );
        map.insert("verbose".to_string(), self.verbose.to_string());
        map.insert(
            "comm_timeout_ms".to_string(),
            self.comm_timeout_ms.to_string(),
        );
        map
    }

    /// Log level used for per-call progress messages
    pub fn progress_level(&self) -> log::Level {
        if self.verbose {
            log::Level::Info
        } else {
            log::Level::Debug
        }
    }
}

/// Configuration builder for fluent configuration creation
#[derive(Debug, Clone)]
pub struct KnnConfigBuilder {
    config: KnnConfig,
    validation_errors: Vec<String>,
}

impl KnnConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        KnnConfigBuilder {
            config: KnnConfig::default(),
            validation_errors: Vec::new(),
        }
    }

    /// Set the number of neighbors
    pub fn n_neighbors(mut self, n_neighbors: usize) -> Self {
        if n_neighbors == 0 {
            self.validation_errors
                .push("n_neighbors must be at least 1".to_string());
        }
        self.config.n_neighbors = n_neighbors;
        self
    }

    /// Set the distance metric
    pub fn metric(mut self, metric: DistanceMetric) -> Self {
        self.config.metric = metric;
        self
    }

    /// Set the query batch size
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        if batch_size == 0 {
            self.validation_errors
                .push("batch_size must be at least 1".to_string());
        }
        self.config.batch_size = batch_size;
        self
    }

    /// Set the number of streams per worker handle
    pub fn streams_per_handle(mut self, streams: usize) -> Self {
        self.config.streams_per_handle = streams;
        self
    }

    /// Set verbosity
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.config.verbose = verbose;
        self
    }

    /// Set the communicator receive timeout
    pub fn comm_timeout_ms(mut self, millis: u64) -> Self {
        if millis == 0 {
            self.validation_errors
                .push("comm_timeout_ms must be positive".to_string());
        }
        self.config.comm_timeout_ms = millis;
        self
    }

    /// Set the rank assignment policy
    pub fn rank_order(mut self, order: RankOrder) -> Self {
        self.config.rank_order = order;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<KnnConfig> {
        if !self.validation_errors.is_empty() {
            return Err(KnnError::config(format!(
                "Configuration validation failed: {}",
                self.validation_errors.join(", ")
            )));
        }

        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for KnnConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = KnnConfig::default();
        assert_eq!(config.n_neighbors, DEFAULT_N_NEIGHBORS);
        assert_eq!(config.metric, DistanceMetric::Euclidean);
        assert_eq!(config.rank_order, RankOrder::Sorted);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = KnnConfig::default();
        config.n_neighbors = 0;
        assert!(config.validate().is_err());

        config.n_neighbors = 3;
        config.batch_size = 0;
        assert!(config.validate().is_err());

        config.batch_size = 16;
        config.comm_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = KnnConfigBuilder::new()
            .n_neighbors(7)
            .metric(DistanceMetric::Manhattan)
            .batch_size(64)
            .rank_order(RankOrder::Shuffled { seed: 9 })
            .build()
            .unwrap();

        assert_eq!(config.n_neighbors, 7);
        assert_eq!(config.metric, DistanceMetric::Manhattan);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.rank_order, RankOrder::Shuffled { seed: 9 });
    }

    #[test]
    fn test_config_builder_validation() {
        let result = KnnConfigBuilder::new()
            .n_neighbors(0)
            .batch_size(0)
            .build();
        let message = result.unwrap_err().to_string();
        assert!(message.contains("n_neighbors"));
        assert!(message.contains("batch_size"));
    }

    #[test]
    fn test_metric_parsing() {
        assert_eq!(
            "L2".parse::<DistanceMetric>().unwrap(),
            DistanceMetric::Euclidean
        );
        assert_eq!(
            "cityblock".parse::<DistanceMetric>().unwrap(),
            DistanceMetric::Manhattan
        );
        assert!("cosine".parse::<DistanceMetric>().is_err());
    }

    #[test]
    fn test_variable_overrides() {
        let mut config = KnnConfig::default();
        config
            .apply_variables(|name| match name {
                "N_NEIGHBORS" => Some("11".to_string()),
                "METRIC" => Some("sqeuclidean".to_string()),
                "VERBOSE" => Some("true".to_string()),
                _ => None,
            })
            .unwrap();

        assert_eq!(config.n_neighbors, 11);
        assert_eq!(config.metric, DistanceMetric::SquaredEuclidean);
        assert!(config.verbose);
        assert_eq!(config.progress_level(), log::Level::Info);

        let bad = config.apply_variables(|name| {
            (name == "BATCH_SIZE").then(|| "many".to_string())
        });
        assert!(bad.is_err());
    }

    #[test]
    fn test_parameter_map() {
        let map = KnnConfig::default().as_parameter_map();
        assert_eq!(map.get("metric").unwrap(), "euclidean");
        assert_eq!(map.get("n_neighbors").unwrap(), "5");
    }
}
