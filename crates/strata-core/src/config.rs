//! Strata configuration
//!
//! Loaded once per process from TOML; every field has a default so an empty
//! file is a valid configuration. [`StrataConfig::rollup_levels`] validates
//! the level table and returns the immutable [`RollupLevels`].

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_store::MAX_ROLLUP_LEVELS;

use crate::error::{Result, RollupError};

const MILLIS_PER_HOUR: i64 = 3_600_000;

/// Interval and view threshold of one configured level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelSpec {
    pub interval_millis: i64,
    /// Ranges shorter than this are served from the previous (finer) level.
    #[serde(default)]
    pub view_threshold_millis: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrataConfig {
    #[serde(default = "default_rollup_levels")]
    pub rollup_levels: Vec<LevelSpec>,

    /// Retention per level, in hours.
    #[serde(default = "default_rollup_expiration_hours")]
    pub rollup_expiration_hours: Vec<i64>,

    /// Buckets whose boundary is newer than `now - delay` are not rolled up yet.
    #[serde(default = "default_rollup_delay_millis")]
    pub rollup_delay_millis: i64,

    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,

    /// Bound on in-flight storage operations.
    #[serde(default = "default_max_concurrent_storage_ops")]
    pub max_concurrent_storage_ops: usize,

    #[serde(default = "default_ingest_timeout_millis")]
    pub ingest_timeout_millis: u64,

    #[serde(default = "default_rollup_timeout_millis")]
    pub rollup_timeout_millis: u64,

    #[serde(default = "default_interactive_timeout_millis")]
    pub interactive_timeout_millis: u64,

    #[serde(default = "default_rollup_schedule_secs")]
    pub rollup_schedule_secs: u64,

    /// Capacity of the in-process blob store.
    #[serde(default = "default_blob_capacity_bytes")]
    pub blob_capacity_bytes: usize,
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            rollup_levels: default_rollup_levels(),
            rollup_expiration_hours: default_rollup_expiration_hours(),
            rollup_delay_millis: default_rollup_delay_millis(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            max_concurrent_storage_ops: default_max_concurrent_storage_ops(),
            ingest_timeout_millis: default_ingest_timeout_millis(),
            rollup_timeout_millis: default_rollup_timeout_millis(),
            interactive_timeout_millis: default_interactive_timeout_millis(),
            rollup_schedule_secs: default_rollup_schedule_secs(),
            blob_capacity_bytes: default_blob_capacity_bytes(),
        }
    }
}

// Default values
fn default_rollup_levels() -> Vec<LevelSpec> {
    [
        (60_000, 0),
        (300_000, 3_600_000),
        (1_800_000, 28_800_000),
        (14_400_000, 259_200_000),
    ]
    .into_iter()
    .map(|(interval_millis, view_threshold_millis)| LevelSpec {
        interval_millis,
        view_threshold_millis,
    })
    .collect()
}

fn default_rollup_expiration_hours() -> Vec<i64> {
    vec![48, 336, 2160, 17520]
}

fn default_rollup_delay_millis() -> i64 {
    15_000
}

fn default_rate_limit_window_secs() -> u64 {
    86_400
}

fn default_max_concurrent_storage_ops() -> usize {
    64
}

fn default_ingest_timeout_millis() -> u64 {
    30_000
}

fn default_rollup_timeout_millis() -> u64 {
    120_000
}

fn default_interactive_timeout_millis() -> u64 {
    20_000
}

fn default_rollup_schedule_secs() -> u64 {
    60
}

fn default_blob_capacity_bytes() -> usize {
    256 * 1024 * 1024
}

impl StrataConfig {
    /// Load and parse a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| RollupError::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| RollupError::Config(e.to_string()))
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn rollup_schedule(&self) -> Duration {
        Duration::from_secs(self.rollup_schedule_secs)
    }

    /// Validate the level table.
    ///
    /// Requires at least two levels, at most `MAX_ROLLUP_LEVELS`, strictly
    /// increasing intervals that each divide the next, and one expiration
    /// entry per level.
    pub fn rollup_levels(&self) -> Result<RollupLevels> {
        let specs = &self.rollup_levels;
        if specs.len() < 2 {
            return Err(RollupError::Config(
                "at least two rollup levels are required".to_string(),
            ));
        }
        if specs.len() > MAX_ROLLUP_LEVELS {
            return Err(RollupError::Config(format!(
                "{} rollup levels configured, at most {MAX_ROLLUP_LEVELS} supported",
                specs.len()
            )));
        }
        if self.rollup_expiration_hours.len() != specs.len() {
            return Err(RollupError::Config(format!(
                "{} expiration entries for {} rollup levels",
                self.rollup_expiration_hours.len(),
                specs.len()
            )));
        }
        if specs[0].interval_millis <= 0 {
            return Err(RollupError::Config(
                "rollup intervals must be positive".to_string(),
            ));
        }
        for pair in specs.windows(2) {
            let (finer, coarser) = (pair[0].interval_millis, pair[1].interval_millis);
            if coarser <= finer {
                return Err(RollupError::Config(format!(
                    "rollup intervals must increase strictly: {finer} then {coarser}"
                )));
            }
            if coarser % finer != 0 {
                return Err(RollupError::Config(format!(
                    "rollup interval {coarser} is not a multiple of {finer}"
                )));
            }
        }

        let levels = specs
            .iter()
            .zip(&self.rollup_expiration_hours)
            .enumerate()
            .map(|(level, (spec, hours))| RollupLevel {
                level,
                interval_millis: spec.interval_millis,
                view_threshold_millis: spec.view_threshold_millis,
                expiration_hours: *hours,
            })
            .collect();
        Ok(RollupLevels { levels })
    }
}

/// One rollup level. Level 0 holds agent-written rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollupLevel {
    pub level: usize,
    pub interval_millis: i64,
    pub view_threshold_millis: i64,
    pub expiration_hours: i64,
}

impl RollupLevel {
    pub fn expiration_millis(&self) -> i64 {
        self.expiration_hours.saturating_mul(MILLIS_PER_HOUR)
    }

    /// Bucket boundary that holds `capture_time`.
    pub fn boundary_for(&self, capture_time: i64) -> i64 {
        ceil_to(capture_time, self.interval_millis)
    }
}

/// Validated, immutable level table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupLevels {
    levels: Vec<RollupLevel>,
}

impl RollupLevels {
    pub fn len(&self) -> usize {
        self.levels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }

    pub fn get(&self, level: usize) -> Option<&RollupLevel> {
        self.levels.get(level)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RollupLevel> {
        self.levels.iter()
    }

    /// Levels above 0, finest first.
    pub fn rolled_up(&self) -> impl Iterator<Item = &RollupLevel> {
        self.levels.iter().skip(1)
    }

    pub fn finest(&self) -> &RollupLevel {
        &self.levels[0]
    }
}

/// Round `t` up to the next multiple of `interval` (identity on multiples).
pub fn ceil_to(t: i64, interval: i64) -> i64 {
    let rem = t.rem_euclid(interval);
    if rem == 0 {
        t
    } else {
        t - rem + interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config = StrataConfig::from_toml("").unwrap();
        let levels = config.rollup_levels().unwrap();
        assert_eq!(levels.len(), 4);
        assert_eq!(levels.get(1).unwrap().interval_millis, 300_000);
        assert_eq!(levels.get(3).unwrap().expiration_hours, 17_520);
        assert_eq!(config.rollup_delay_millis, 15_000);
        assert_eq!(config.blob_capacity_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn toml_overrides_levels() {
        let config = StrataConfig::from_toml(
            r#"
            rollup_expiration_hours = [1, 2]
            rollup_schedule_secs = 5

            [[rollup_levels]]
            interval_millis = 1000

            [[rollup_levels]]
            interval_millis = 10000
            view_threshold_millis = 60000
            "#,
        )
        .unwrap();
        let levels = config.rollup_levels().unwrap();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels.get(1).unwrap().view_threshold_millis, 60_000);
        assert_eq!(config.rollup_schedule(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_non_multiple_intervals() {
        let config = StrataConfig {
            rollup_levels: vec![
                LevelSpec {
                    interval_millis: 60_000,
                    view_threshold_millis: 0,
                },
                LevelSpec {
                    interval_millis: 90_000,
                    view_threshold_millis: 0,
                },
            ],
            rollup_expiration_hours: vec![1, 1],
            ..Default::default()
        };
        let err = config.rollup_levels().unwrap_err();
        assert!(err.to_string().contains("not a multiple"));
    }

    #[test]
    fn rejects_mismatched_expirations_and_single_level() {
        let config = StrataConfig {
            rollup_expiration_hours: vec![48],
            ..Default::default()
        };
        assert!(config.rollup_levels().is_err());

        let config = StrataConfig {
            rollup_levels: vec![LevelSpec {
                interval_millis: 60_000,
                view_threshold_millis: 0,
            }],
            rollup_expiration_hours: vec![48],
            ..Default::default()
        };
        assert!(config.rollup_levels().is_err());
    }

    #[test]
    fn rounding_helpers() {
        assert_eq!(ceil_to(60_000, 300_000), 300_000);
        assert_eq!(ceil_to(300_000, 300_000), 300_000);
        assert_eq!(ceil_to(300_001, 300_000), 600_000);
        assert_eq!(ceil_to(0, 60_000), 0);
    }
}
