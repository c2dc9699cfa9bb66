//! Configuration constants and the per-run upgrade configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{DfuError, DfuResult};

// ============================================================================
// Serial Communication
// ============================================================================

/// Baud rate for serial links to the DFU bridge.
pub const DFU_BAUD_RATE: u32 = 115_200;

/// Serial read timeout for individual read operations.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(1000);

/// Number of attempts when a serial port open fails transiently.
pub const MAX_OPEN_RETRIES: u32 = 10;

/// Delay between serial port open attempts.
pub const OPEN_RETRY_DELAY: Duration = Duration::from_millis(200);

// ============================================================================
// DFU Protocol Timeouts
// ============================================================================

/// Default time to wait for a chunk acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Time to wait for the response to a device command (test, confirm, reset).
pub const COMMAND_TIMEOUT: Duration = Duration::from_millis(5000);

/// Default time the device is given to swap images and come back.
pub const DEFAULT_ESTIMATED_SWAP_TIME: Duration = Duration::from_secs(10);

/// Interval between reconnect attempts while waiting in `Reset`.
pub const RECONNECT_POLL_INTERVAL: Duration = Duration::from_millis(500);

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retries allowed per chunk on Timeout/LinkLost before the upload fails.
pub const MAX_CHUNK_RETRIES: u8 = 1;

// ============================================================================
// Chunk Configuration
// ============================================================================

/// Default chunk payload size (fits a 512-byte ATT MTU bridge).
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Largest chunk payload a frame can carry.
pub const MAX_CHUNK_SIZE: usize = 2048;

/// Default number of chunks in flight.
pub const DEFAULT_PIPELINE_DEPTH: usize = 1;

/// Upper bound on the pipeline window.
pub const MAX_PIPELINE_DEPTH: usize = 32;

// ============================================================================
// SLIP Protocol Constants
// ============================================================================

/// SLIP frame delimiter (END byte).
pub const SLIP_END: u8 = 0xC0;

/// SLIP escape byte.
pub const SLIP_ESC: u8 = 0xDB;

/// SLIP escaped END (0xC0 encoded as 0xDB 0xDC).
pub const SLIP_ESC_END: u8 = 0xDC;

/// SLIP escaped ESC (0xDB encoded as 0xDB 0xDD).
pub const SLIP_ESC_ESC: u8 = 0xDD;

// ============================================================================
// Upgrade Configuration
// ============================================================================

/// Settings for one upgrade run.
///
/// Immutable once handed to `UpgradeManager::start`. Durations are carried in
/// milliseconds on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpgradeConfiguration {
    /// How long to wait in `Reset` for the device to reconnect.
    #[serde(rename = "estimatedSwapTimeMs", with = "millis")]
    pub estimated_swap_time: Duration,

    /// Ask the device to erase application settings before reset.
    pub erase_app_settings: bool,

    /// Maximum number of chunks in flight.
    pub pipeline_depth: usize,

    /// Chunk payload size in bytes.
    pub chunk_size: usize,

    #[serde(rename = "ackTimeoutMs", with = "millis")]
    pub ack_timeout: Duration,

    /// Retries per chunk for Timeout/LinkLost.
    pub max_chunk_retries: u8,

    #[serde(rename = "reconnectPollIntervalMs", with = "millis")]
    pub reconnect_poll_interval: Duration,
}

impl Default for UpgradeConfiguration {
    fn default() -> Self {
        Self {
            estimated_swap_time: DEFAULT_ESTIMATED_SWAP_TIME,
            erase_app_settings: false,
            pipeline_depth: DEFAULT_PIPELINE_DEPTH,
            chunk_size: DEFAULT_CHUNK_SIZE,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_chunk_retries: MAX_CHUNK_RETRIES,
            reconnect_poll_interval: RECONNECT_POLL_INTERVAL,
        }
    }
}

impl UpgradeConfiguration {
    /// Parse a configuration from JSON, filling unset fields with defaults.
    pub fn from_json(json: &str) -> DfuResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject out-of-range values before an upgrade starts.
    pub fn validate(&self) -> DfuResult<()> {
        if self.estimated_swap_time.is_zero() {
            return Err(invalid("estimatedSwapTime must be greater than zero"));
        }
        if self.pipeline_depth == 0 || self.pipeline_depth > MAX_PIPELINE_DEPTH {
            return Err(invalid(format!(
                "pipelineDepth must be between 1 and {}, got {}",
                MAX_PIPELINE_DEPTH, self.pipeline_depth
            )));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(invalid(format!(
                "chunkSize must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, self.chunk_size
            )));
        }
        if self.ack_timeout.is_zero() {
            return Err(invalid("ackTimeout must be greater than zero"));
        }
        if self.reconnect_poll_interval.is_zero() {
            return Err(invalid("reconnectPollInterval must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(reason: impl Into<String>) -> DfuError {
    DfuError::InvalidConfiguration {
        reason: reason.into(),
    }
}

/// Serde adapter storing a `Duration` as whole milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configuration_is_valid() {
        let config = UpgradeConfiguration::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.chunk_size, 512);
        assert_eq!(config.max_chunk_retries, 1);
        assert_eq!(config.ack_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_swap_time_rejected() {
        let config = UpgradeConfiguration {
            estimated_swap_time: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(DfuError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_pipeline_depth_bounds() {
        let zero = UpgradeConfiguration {
            pipeline_depth: 0,
            ..Default::default()
        };
        assert!(zero.validate().is_err());

        let too_deep = UpgradeConfiguration {
            pipeline_depth: MAX_PIPELINE_DEPTH + 1,
            ..Default::default()
        };
        assert!(too_deep.validate().is_err());

        let ok = UpgradeConfiguration {
            pipeline_depth: 4,
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_chunk_size_bounds() {
        let too_big = UpgradeConfiguration {
            chunk_size: MAX_CHUNK_SIZE + 1,
            ..Default::default()
        };
        assert!(too_big.validate().is_err());
    }

    #[test]
    fn test_from_json_partial() {
        let config = UpgradeConfiguration::from_json(
            r#"{ "estimatedSwapTimeMs": 20000, "eraseAppSettings": true, "pipelineDepth": 3 }"#,
        )
        .unwrap();

        assert_eq!(config.estimated_swap_time, Duration::from_secs(20));
        assert!(config.erase_app_settings);
        assert_eq!(config.pipeline_depth, 3);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_from_json_rejects_out_of_range() {
        let result = UpgradeConfiguration::from_json(r#"{ "pipelineDepth": 0 }"#);
        assert!(matches!(
            result,
            Err(DfuError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn test_serialize_uses_millis() {
        let json = serde_json::to_value(UpgradeConfiguration::default()).unwrap();
        assert_eq!(json["estimatedSwapTimeMs"], 10_000);
        assert_eq!(json["ackTimeoutMs"], 30_000);
        assert_eq!(json["eraseAppSettings"], false);
    }
}
