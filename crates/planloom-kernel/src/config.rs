//! Outline runtime configuration.
//!
//! Every field has a default, so an empty TOML document is a valid config:
//!
//! ```toml
//! position_gap = 1000.0
//! retention_days = 30
//! max_entries = 10000
//! boundary_threshold_ms = 300000
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use planloom_tree::{DEFAULT_GAP, MAX_DEPTH, PositionAllocator, TreeMutator};

const DAY_MS: u64 = 24 * 60 * 60 * 1000;

/// Errors from loading or validating an [`OutlineConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse outline config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid outline config: {0}")]
    Invalid(String),
}

/// Tunables for the outline runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutlineConfig {
    /// Spacing between sibling positions.
    pub position_gap: f64,
    /// Parent-chain hop bound.
    pub max_depth: usize,
    /// Change-log retention window.
    pub retention_days: u64,
    /// Change-log hard cap.
    pub max_entries: usize,
    /// Duplicate `create` records inside this window are dropped.
    pub create_dedup_window_ms: u64,
    /// Idle gap after which editing resumes with a boundary marker.
    pub boundary_threshold_ms: u64,
    /// Content edits are flushed this long after the last keystroke.
    pub autosave_debounce_ms: u64,
    /// Capacity of the node event broadcast channel.
    pub event_capacity: usize,
}

impl Default for OutlineConfig {
    fn default() -> Self {
        Self {
            position_gap: DEFAULT_GAP,
            max_depth: MAX_DEPTH,
            retention_days: 30,
            max_entries: 10_000,
            create_dedup_window_ms: 3_000,
            boundary_threshold_ms: 5 * 60 * 1000,
            autosave_debounce_ms: 750,
            event_capacity: 1024,
        }
    }
}

impl OutlineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.position_gap.is_finite() || self.position_gap <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "position_gap must be a positive finite number, got {}",
                self.position_gap
            )));
        }
        if self.max_entries == 0 {
            return Err(ConfigError::Invalid("max_entries must be at least 1".into()));
        }
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid("max_depth must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be at least 1".into()));
        }
        Ok(())
    }

    /// Set the position gap.
    pub fn with_position_gap(mut self, gap: f64) -> Self {
        self.position_gap = gap;
        self
    }

    /// Set the change-log retention window and hard cap.
    pub fn with_retention(mut self, days: u64, max_entries: usize) -> Self {
        self.retention_days = days;
        self.max_entries = max_entries;
        self
    }

    /// Set the boundary marker threshold.
    pub fn with_boundary_threshold(mut self, threshold: Duration) -> Self {
        self.boundary_threshold_ms = threshold.as_millis() as u64;
        self
    }

    /// Set the autosave debounce.
    pub fn with_autosave_debounce(mut self, debounce: Duration) -> Self {
        self.autosave_debounce_ms = debounce.as_millis() as u64;
        self
    }

    pub fn retention_ms(&self) -> u64 {
        self.retention_days.saturating_mul(DAY_MS)
    }

    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }

    pub fn mutator(&self) -> TreeMutator {
        TreeMutator::new(PositionAllocator::new(self.position_gap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(OutlineConfig::from_toml_str("").unwrap(), OutlineConfig::default());
    }

    #[test]
    fn test_partial_document_overrides() {
        let config = OutlineConfig::from_toml_str(
            r#"
            position_gap = 64.0
            max_entries = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.position_gap, 64.0);
        assert_eq!(config.max_entries, 500);
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.boundary_threshold_ms, 300_000);
    }

    #[test]
    fn test_rejects_bad_gap_and_zero_cap() {
        assert!(matches!(
            OutlineConfig::from_toml_str("position_gap = -1.0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            OutlineConfig::from_toml_str("max_entries = 0"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            OutlineConfig::from_toml_str("position_gap = \"wide\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_retention_in_millis() {
        let config = OutlineConfig::default().with_retention(2, 10);
        assert_eq!(config.retention_ms(), 2 * DAY_MS);
    }
}
