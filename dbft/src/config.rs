//! dBFT consensus configuration.
//!
//! Defines block timing, timestamp spacing and the anti-MEV activation height.

use std::time::Duration;

/// Configuration for the dBFT consensus engine.
#[derive(Debug, Clone)]
pub struct DbftConfig {
    /// Target block interval. Every view timeout is a multiple of it.
    /// Default: 15 seconds.
    pub time_per_block: Duration,

    /// Upper bound for the dynamic block time. When set, a primary with an
    /// empty pool waits for transactions until this much time has passed
    /// since the last block instead of proposing an empty block.
    /// Default: disabled.
    pub max_time_per_block: Option<Duration>,

    /// Minimal difference in milliseconds between consecutive block timestamps.
    /// Default: 1.
    pub timestamp_increment_ms: u64,

    /// First height at which the pre-commit phase runs. Negative disables it.
    /// Default: -1.
    pub anti_mev_extension_enabling_height: i64,

    /// Number of samples kept by the round-trip-time estimator.
    /// Default: 70.
    pub rtt_capacity: usize,
}

impl Default for DbftConfig {
    fn default() -> Self {
        Self {
            time_per_block: Duration::from_secs(15),
            max_time_per_block: None,
            timestamp_increment_ms: 1,
            anti_mev_extension_enabling_height: -1,
            rtt_capacity: 7 * 10,
        }
    }
}

impl DbftConfig {
    /// Whether the pre-commit phase runs for blocks at `height`.
    pub fn anti_mev_enabled_at(&self, height: u32) -> bool {
        self.anti_mev_extension_enabling_height >= 0
            && self.anti_mev_extension_enabling_height <= i64::from(height)
    }

    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.time_per_block.is_zero() {
            return Err(ConfigError::InvalidTimePerBlock);
        }
        if let Some(max) = self.max_time_per_block {
            if max < self.time_per_block {
                return Err(ConfigError::InvalidMaxTimePerBlock {
                    max,
                    time_per_block: self.time_per_block,
                });
            }
        }
        if self.rtt_capacity == 0 {
            return Err(ConfigError::InvalidRttCapacity);
        }
        Ok(())
    }
}

/// Errors in dBFT configuration, reported before an engine is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("time_per_block must be > 0")]
    InvalidTimePerBlock,
    #[error("max_time_per_block ({max:?}) must not be below time_per_block ({time_per_block:?})")]
    InvalidMaxTimePerBlock {
        max: Duration,
        time_per_block: Duration,
    },
    #[error("rtt_capacity must be > 0")]
    InvalidRttCapacity,
    #[error("pre-block hooks are set but the anti-MEV extension is disabled")]
    UnexpectedPreBlockHooks,
    #[error("anti-MEV extension enabled at height {0} without pre-block hooks")]
    MissingPreBlockHooks(i64),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DbftConfig::default();
        assert_eq!(config.time_per_block, Duration::from_secs(15));
        assert_eq!(config.max_time_per_block, None);
        assert_eq!(config.timestamp_increment_ms, 1);
        assert_eq!(config.anti_mev_extension_enabling_height, -1);
        assert_eq!(config.rtt_capacity, 70);
    }

    #[test]
    fn test_valid_config() {
        let config = DbftConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_time_per_block() {
        let config = DbftConfig {
            time_per_block: Duration::ZERO,
            ..DbftConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimePerBlock)
        ));
    }

    #[test]
    fn test_max_time_per_block_below_time_per_block() {
        let config = DbftConfig {
            max_time_per_block: Some(Duration::from_secs(5)),
            ..DbftConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMaxTimePerBlock { .. })
        ));
    }

    #[test]
    fn test_invalid_rtt_capacity() {
        let config = DbftConfig {
            rtt_capacity: 0,
            ..DbftConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRttCapacity)
        ));
    }

    #[test]
    fn test_anti_mev_activation() {
        let mut config = DbftConfig::default();
        assert!(!config.anti_mev_enabled_at(0));
        assert!(!config.anti_mev_enabled_at(u32::MAX));

        config.anti_mev_extension_enabling_height = 10;
        assert!(!config.anti_mev_enabled_at(9));
        assert!(config.anti_mev_enabled_at(10));
        assert!(config.anti_mev_enabled_at(11));

        config.anti_mev_extension_enabling_height = 0;
        assert!(config.anti_mev_enabled_at(1));
    }
}
