//! Configuration for AOI engines.
//!
//! Engines are configured from plain structs, typically deserialized from a
//! TOML file. Validation happens once at construction time; an engine never
//! re-checks its configuration afterwards.

use crate::error::{AoiError, AoiResult, ConfigResult};
use crate::types::{LayerIndex, Position};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default interval between two shard merge passes
fn default_rebalance_interval_ms() -> u64 {
    3000
}

/// How internal consistency anomalies are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvariantMode {
    /// Log a warning and keep going.
    #[default]
    Tolerant,
    /// Fail the triggering operation with [`AoiError::InvariantViolation`].
    Strict,
}

/// Backing storage of a tower shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GridBacking {
    /// Pre-allocated 2D array covering the whole map.
    #[default]
    Dense,
    /// Towers created lazily on first use.
    Sparse,
}

/// Settings of one tower grid: map corners, tower size and anomaly policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AoiConfig {
    /// Lower-left map corner (inclusive)
    pub min: Position,
    /// Upper-right map corner (inclusive)
    pub max: Position,
    /// Edge length of one square tower
    pub cell_size: f64,
    #[serde(default)]
    pub invariant_mode: InvariantMode,
    /// Backing of the primary shard
    #[serde(default)]
    pub backing: GridBacking,
}

impl AoiConfig {
    /// Creates a tolerant, densely backed configuration.
    pub fn new(min: Position, max: Position, cell_size: f64) -> Self {
        Self {
            min,
            max,
            cell_size,
            invariant_mode: InvariantMode::default(),
            backing: GridBacking::default(),
        }
    }

    pub fn with_invariant_mode(mut self, mode: InvariantMode) -> Self {
        self.invariant_mode = mode;
        self
    }

    pub fn with_backing(mut self, backing: GridBacking) -> Self {
        self.backing = backing;
        self
    }

    /// Checks bounds and tower size.
    pub fn validate(&self) -> AoiResult<()> {
        if !self.min.is_finite() || !self.max.is_finite() {
            return Err(AoiError::InvalidConfiguration(
                "map bounds must be finite".to_string(),
            ));
        }
        if self.min.x > self.max.x || self.min.y > self.max.y {
            return Err(AoiError::InvalidConfiguration(format!(
                "map min corner {} exceeds max corner {}",
                self.min, self.max
            )));
        }
        if !self.cell_size.is_finite() || self.cell_size <= 0.0 {
            return Err(AoiError::InvalidConfiguration(format!(
                "cell size must be a positive number, got {}",
                self.cell_size
            )));
        }
        Ok(())
    }
}

impl Default for AoiConfig {
    fn default() -> Self {
        Self::new(Position::new(-1000.0, -1000.0), Position::new(1000.0, 1000.0), 50.0)
    }
}

/// Settings of one interest channel in a layered engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSettings {
    /// Bit index of this channel (0..=63)
    pub index: LayerIndex,
    pub grid: AoiConfig,
    /// Residents per shard before a new shard is allocated; `None` disables sharding
    #[serde(default)]
    pub shard_capacity: Option<usize>,
    /// Minimum time between two shard merge passes
    #[serde(default = "default_rebalance_interval_ms")]
    pub rebalance_interval_ms: u64,
}

impl LayerSettings {
    /// Unsharded channel over the given grid.
    pub fn new(index: LayerIndex, grid: AoiConfig) -> Self {
        Self {
            index,
            grid,
            shard_capacity: None,
            rebalance_interval_ms: default_rebalance_interval_ms(),
        }
    }

    pub fn with_shard_capacity(mut self, capacity: usize) -> Self {
        self.shard_capacity = Some(capacity);
        self
    }

    pub fn with_rebalance_interval(mut self, interval: Duration) -> Self {
        self.rebalance_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_millis(self.rebalance_interval_ms)
    }

    pub fn validate(&self) -> AoiResult<()> {
        if self.index >= 64 {
            return Err(AoiError::InvalidConfiguration(format!(
                "layer index {} does not fit a 64-bit mask",
                self.index
            )));
        }
        if self.shard_capacity == Some(0) {
            return Err(AoiError::InvalidConfiguration(format!(
                "layer {} shard capacity must be positive",
                self.index
            )));
        }
        self.grid.validate()
    }
}

/// Configuration of a layered (multi-channel) engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerAoiConfig {
    pub layers: Vec<LayerSettings>,
}

impl Default for LayerAoiConfig {
    fn default() -> Self {
        Self {
            layers: vec![LayerSettings::new(0, AoiConfig::default()).with_shard_capacity(512)],
        }
    }
}

impl LayerAoiConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: LayerAoiConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, writes the default configuration there and
    /// returns it.
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::from_toml_str(&content)
        } else {
            let default_config = LayerAoiConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            std::fs::write(path, toml_content)?;
            info!("Created default AOI configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Validates every layer and rejects duplicate indices.
    pub fn validate(&self) -> AoiResult<()> {
        let mut seen = HashSet::new();
        for layer in &self.layers {
            layer.validate()?;
            if !seen.insert(layer.index) {
                return Err(AoiError::InvalidConfiguration(format!(
                    "layer {} configured twice",
                    layer.index
                )));
            }
        }
        Ok(())
    }
}
