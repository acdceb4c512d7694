//! Engine settings.
//!
//! A single plain-data struct, loadable from JSON. Everything has a
//! default so embedders can start with `Settings::default()` and override
//! only what they care about.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Tunables for the feature computation engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Worker threads for the parallel engine. `None` means
    /// `std::thread::available_parallelism()`.
    pub num_threads: Option<usize>,

    /// Maximum number of update-log states retained. Older states are
    /// evicted, forcing full recomputation for features whose basis
    /// is lost.
    pub update_log_capacity: usize,

    /// Divisor applied to the minimal ellipsoid radius to obtain the
    /// Gaussian kernel sigma for intensity sampling.
    pub sigma_factor: f64,

    /// Kernel support half-width, in sigmas.
    pub kernel_cutoff_sigmas: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_threads: None,
            update_log_capacity: 10,
            sigma_factor: 2.0,
            kernel_cutoff_sigmas: 3.0,
        }
    }
}

impl Settings {
    /// Parse settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::ConfigError(e.to_string()))
    }

    /// Effective worker-pool size.
    pub fn effective_threads(&self) -> usize {
        self.num_threads.unwrap_or_else(|| {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.update_log_capacity, 10);
        assert_eq!(s.sigma_factor, 2.0);
        assert!(s.effective_threads() >= 1);
    }

    #[test]
    fn test_from_json_partial() {
        let s = Settings::from_json(r#"{"update_log_capacity": 3}"#).unwrap();
        assert_eq!(s.update_log_capacity, 3);
        assert_eq!(s.sigma_factor, 2.0);
    }

    #[test]
    fn test_from_json_bad() {
        assert!(Settings::from_json("not json").is_err());
    }
}
