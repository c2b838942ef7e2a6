use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub decode: DecodeConfig,

    #[serde(default)]
    pub layout: LayoutConfig,
}

impl EngineConfig {
    pub fn throttle(&self) -> Duration {
        Duration::from_millis(self.coordinator.throttle_ms)
    }

    pub fn one_shot_timeout(&self) -> Duration {
        Duration::from_secs(self.decode.one_shot_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    /// Minimum interval between range dispatches in milliseconds (default: 200)
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
}

fn default_throttle_ms() -> u64 {
    200
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            throttle_ms: default_throttle_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Entries outside `[start - k*span, end + k*span]` are released (default: 3.0)
    #[serde(default = "default_span_multiplier")]
    pub span_multiplier: f64,
}

fn default_span_multiplier() -> f64 {
    3.0
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            span_multiplier: default_span_multiplier(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DecodeConfig {
    /// Ceiling for save-frame, boundary-preview and segment-batch requests (default: 15)
    #[serde(default = "default_one_shot_timeout")]
    pub one_shot_timeout_secs: u64,

    /// Capacity of the command channel into the decode worker (default: 64)
    #[serde(default = "default_command_capacity")]
    pub command_capacity: usize,
}

fn default_one_shot_timeout() -> u64 {
    15
}
fn default_command_capacity() -> usize {
    64
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            one_shot_timeout_secs: default_one_shot_timeout(),
            command_capacity: default_command_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LayoutConfig {
    /// Thumbnail width in pixels; wider segments switch to dense mode (default: 160)
    #[serde(default = "default_thumbnail_width")]
    pub thumbnail_width: u32,
}

fn default_thumbnail_width() -> u32 {
    160
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            thumbnail_width: default_thumbnail_width(),
        }
    }
}
