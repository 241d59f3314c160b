//! Core infrastructure module for distributed KNN.
//!
//! This module provides the foundational components shared by every other
//! module: fundamental types, constants and error handling.
//!
//! - [`types`]: worker addresses, ranks, session ids, task keys, element types
//! - [`constants`]: configuration defaults
//! - [`error`]: the error taxonomy

pub mod constants;
pub mod error;
pub mod types;

pub use constants::*;
pub use error::{KnnError, Result};
pub use types::*;

use std::sync::OnceLock;

/// Core module features and capabilities
#[derive(Debug, Clone)]
pub struct CoreCapabilities {
    /// Local multi-worker KNN kernel compiled in
    pub multi_worker_knn: bool,
    /// Number of logical CPUs available to worker task threads
    pub logical_cpus: usize,
    /// DataFrame conversions available in the test-fixture utility
    pub dataframe_support: bool,
}

impl CoreCapabilities {
    /// Get current core capabilities
    pub fn current() -> Self {
        CoreCapabilities {
            multi_worker_knn: cfg!(feature = "cpu"),
            logical_cpus: num_cpus::get(),
            dataframe_support: cfg!(feature = "polars"),
        }
    }

    /// Get a summary of available capabilities
    pub fn summary(&self) -> String {
        let mut features = Vec::new();
        if self.multi_worker_knn {
            features.push("Multi-worker KNN".to_string());
        }
        if self.dataframe_support {
            features.push("DataFrames".to_string());
        }
        features.push(format!("{} CPUs", self.logical_cpus));

        format!("Core capabilities: {}", features.join(", "))
    }
}

impl Default for CoreCapabilities {
    fn default() -> Self {
        Self::current()
    }
}

static CORE_CAPABILITIES: OnceLock<CoreCapabilities> = OnceLock::new();

/// Initialize logging and capability detection. Safe to call repeatedly.
pub fn initialize_core() -> Result<()> {
    CORE_CAPABILITIES.get_or_init(|| {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", "info");
        }
        // Another logger may already be installed by the host application.
        let _ = env_logger::try_init();

        let caps = CoreCapabilities::current();
        log::info!("Core module initialized successfully");
        log::debug!("{}", caps.summary());
        caps
    });
    Ok(())
}

/// Check if the core module is initialized
pub fn is_core_initialized() -> bool {
    CORE_CAPABILITIES.get().is_some()
}

/// Get current core capabilities
pub fn core_capabilities() -> CoreCapabilities {
    CORE_CAPABILITIES
        .get()
        .cloned()
        .unwrap_or_else(CoreCapabilities::current)
}
