//src/config.rs

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::estimate::EstimatorSettings;
use crate::verdict::VerdictPolicy;

/// Default run seed ("HALALSEQ" in ASCII).
pub const DEFAULT_SEED: u64 = 0x4841_4c41_4c53_4551;

/// Every tunable of an analysis run. Missing JSON fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Minimum fraction of confirmed k-mers for a read to be assigned.
    pub acceptance_threshold: f64,
    /// Reservoir-sample samples larger than `subsample_cap` reads.
    pub subsample: bool,
    pub subsample_cap: usize,
    /// Reads classified per parallel batch.
    pub batch_size: usize,
    pub ram_budget_mb: u64,
    /// Seeds subsampling and bootstrap draws.
    pub seed: u64,
    /// Record a sample's read failure and move on instead of stopping the run.
    pub continue_on_file_error: bool,
    pub estimator: EstimatorSettings,
    pub verdict: VerdictPolicy,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            acceptance_threshold: 0.5,
            subsample: false,
            subsample_cap: 500_000,
            batch_size: 10_000,
            ram_budget_mb: 1024,
            seed: DEFAULT_SEED,
            continue_on_file_error: false,
            estimator: EstimatorSettings::default(),
            verdict: VerdictPolicy::default(),
        }
    }
}

fn out_of_range(field: &'static str, reason: impl Into<String>) -> Result<(), ConfigError> {
    Err(ConfigError::OutOfRange {
        field,
        reason: reason.into(),
    })
}

impl AnalysisConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: AnalysisConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.acceptance_threshold > 0.0 && self.acceptance_threshold <= 1.0) {
            return out_of_range("acceptance_threshold", "must be in (0, 1]");
        }
        if self.subsample_cap == 0 {
            return out_of_range("subsample_cap", "must be at least 1");
        }
        if self.batch_size == 0 {
            return out_of_range("batch_size", "must be at least 1");
        }
        let est = &self.estimator;
        if !(est.confidence_level > 0.0 && est.confidence_level < 1.0) {
            return out_of_range("estimator.confidence_level", "must be in (0, 1)");
        }
        if !(est.epsilon > 0.0) {
            return out_of_range("estimator.epsilon", "must be positive");
        }
        if est.max_iterations == 0 {
            return out_of_range("estimator.max_iterations", "must be at least 1");
        }
        let policy = &self.verdict;
        if !(0.0..=100.0).contains(&policy.haram_threshold_pct) {
            return out_of_range("verdict.haram_threshold_pct", "must be in [0, 100]");
        }
        if !(0.0..=100.0).contains(&policy.max_unmatched_pct) {
            return out_of_range("verdict.max_unmatched_pct", "must be in [0, 100]");
        }
        if !(0.0..=1.0).contains(&policy.min_agreement) {
            return out_of_range("verdict.min_agreement", "must be in [0, 1]");
        }
        Ok(())
    }

    /// Independent seed for one sample; `stream` separates uses within it.
    pub fn sample_seed(&self, sample_index: usize, stream: u64) -> u64 {
        let mut x = self.seed
            ^ (sample_index as u64).wrapping_mul(0x9E3779B97F4A7C15)
            ^ stream.wrapping_mul(0xC2B2AE3D27D4EB4F);
        x = (x ^ (x >> 33)).wrapping_mul(0xFF51AFD7ED558CCD);
        x = (x ^ (x >> 33)).wrapping_mul(0xC4CEB9FE1A85EC53);
        x ^ (x >> 33)
    }
}
