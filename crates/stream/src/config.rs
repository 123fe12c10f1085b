//! Spatial hash configuration: grid definitions plus hash-wide settings.
//!
//! Loaded from YAML or JSON. Every field has a default, so a config file only
//! needs to name what it changes.

use glam::DVec2;
use serde::{Deserialize, Serialize};
use spatialhash_common::LinearColor;
use std::collections::BTreeSet;
use std::path::Path;

use crate::error::ConfigError;

const PROJECT_DEFAULT_USE_ALIGNED_GRID_LEVELS: bool = true;
const PROJECT_DEFAULT_SNAP_NON_ALIGNED_GRID_LEVELS: bool = true;

/// Tri-state switch that can defer to the project-wide default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProjectDefaultOverride {
    #[default]
    ProjectDefault,
    Disabled,
    Enabled,
}

impl ProjectDefaultOverride {
    pub fn resolve(self, project_default: bool) -> bool {
        match self {
            Self::ProjectDefault => project_default,
            Self::Disabled => false,
            Self::Enabled => true,
        }
    }
}

/// Editor-time definition of one streaming grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeGridDefinition {
    pub name: String,
    /// Level 0 cell size in world units.
    pub cell_size: i64,
    /// Distance from a source within which cells are activated.
    pub loading_range: f64,
    /// Extra distance beyond `loading_range` within which cells are only loaded.
    pub load_margin: f64,
    /// Whether streaming should block when cells aren't loaded fast enough.
    pub block_on_slow_streaming: bool,
    pub origin: DVec2,
    /// Lower sorts first when grids are iterated.
    pub priority: i32,
    /// Derived from the name when absent.
    pub debug_color: Option<LinearColor>,
    pub client_only_visible: bool,
    /// HLOD layer this grid was generated for, by name.
    pub hlod_layer: Option<String>,
}

impl Default for RuntimeGridDefinition {
    fn default() -> Self {
        Self {
            name: "MainGrid".into(),
            cell_size: 12_800,
            loading_range: 25_600.0,
            load_margin: 0.0,
            block_on_slow_streaming: false,
            origin: DVec2::ZERO,
            priority: 0,
            debug_color: None,
            client_only_visible: false,
            hlod_layer: None,
        }
    }
}

impl RuntimeGridDefinition {
    pub fn new(name: impl Into<String>, cell_size: i64, loading_range: f64) -> Self {
        Self {
            name: name.into(),
            cell_size,
            loading_range,
            ..Self::default()
        }
    }

    pub fn debug_color(&self) -> LinearColor {
        self.debug_color
            .unwrap_or_else(|| LinearColor::from_name(&self.name))
    }
}

/// Hash-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialHashConfig {
    pub grids: Vec<RuntimeGridDefinition>,
    /// Filter cells by vertical overlap with source shapes.
    pub enable_z_culling: bool,
    /// Disable to break the pattern of coarse cells always aligned on child cells.
    pub use_aligned_grid_levels: ProjectDefaultOverride,
    /// Disable to stop snapping non-aligned levels to level 0 edges.
    pub snap_non_aligned_grid_levels_to_lower_levels: ProjectDefaultOverride,
    /// Distance/loading-range ratio under which a blocking grid is critical.
    pub block_on_slow_streaming_ratio: f64,
    /// Multiplier on the ratio under which a blocking grid is slow.
    pub block_on_slow_streaming_warning_factor: f64,
}

impl Default for SpatialHashConfig {
    fn default() -> Self {
        Self {
            grids: vec![RuntimeGridDefinition::default()],
            enable_z_culling: false,
            use_aligned_grid_levels: ProjectDefaultOverride::ProjectDefault,
            snap_non_aligned_grid_levels_to_lower_levels: ProjectDefaultOverride::ProjectDefault,
            block_on_slow_streaming_ratio: 0.25,
            block_on_slow_streaming_warning_factor: 2.0,
        }
    }
}

impl SpatialHashConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` file, or YAML for any other extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = BTreeSet::new();
        for grid in &self.grids {
            if grid.name.is_empty() {
                return Err(ConfigError::Invalid("grid with empty name".into()));
            }
            if !names.insert(grid.name.as_str()) {
                return Err(ConfigError::Invalid(format!("duplicate grid {}", grid.name)));
            }
            if grid.cell_size <= 0 {
                return Err(ConfigError::Invalid(format!(
                    "grid {}: cell_size must be positive, got {}",
                    grid.name, grid.cell_size
                )));
            }
            if grid.loading_range.is_nan() || grid.loading_range <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "grid {}: loading_range must be positive, got {}",
                    grid.name, grid.loading_range
                )));
            }
            if grid.load_margin.is_nan() || grid.load_margin < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "grid {}: load_margin must not be negative, got {}",
                    grid.name, grid.load_margin
                )));
            }
        }
        if self.block_on_slow_streaming_ratio.is_nan() || self.block_on_slow_streaming_ratio <= 0.0 {
            return Err(ConfigError::Invalid(
                "block_on_slow_streaming_ratio must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Grid-shape settings resolved from the config and stamped on every grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpatialHashSettings {
    pub use_aligned_grid_levels: bool,
    pub snap_non_aligned_grid_levels_to_lower_levels: bool,
}

impl Default for SpatialHashSettings {
    fn default() -> Self {
        Self {
            use_aligned_grid_levels: PROJECT_DEFAULT_USE_ALIGNED_GRID_LEVELS,
            snap_non_aligned_grid_levels_to_lower_levels:
                PROJECT_DEFAULT_SNAP_NON_ALIGNED_GRID_LEVELS,
        }
    }
}

impl SpatialHashSettings {
    pub fn update_settings(&mut self, config: &SpatialHashConfig) {
        self.use_aligned_grid_levels = config
            .use_aligned_grid_levels
            .resolve(PROJECT_DEFAULT_USE_ALIGNED_GRID_LEVELS);
        self.snap_non_aligned_grid_levels_to_lower_levels = config
            .snap_non_aligned_grid_levels_to_lower_levels
            .resolve(PROJECT_DEFAULT_SNAP_NON_ALIGNED_GRID_LEVELS);
    }

    pub fn from_config(config: &SpatialHashConfig) -> Self {
        let mut settings = Self::default();
        settings.update_settings(config);
        settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SpatialHashConfig::default();
        assert_eq!(config.grids.len(), 1);
        assert_eq!(config.grids[0].name, "MainGrid");
        assert_eq!(config.grids[0].cell_size, 12_800);
        assert_eq!(config.grids[0].loading_range, 25_600.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn yaml_only_needs_changed_fields() {
        let yaml = r#"
enable_z_culling: true
use_aligned_grid_levels: Disabled
grids:
  - name: Default
    cell_size: 100
    loading_range: 500
    load_margin: 100
  - name: HLOD0
    hlod_layer: HLOD0
"#;
        let config = SpatialHashConfig::from_yaml_str(yaml).unwrap();
        assert!(config.enable_z_culling);
        assert_eq!(config.grids[0].load_margin, 100.0);
        assert_eq!(config.grids[1].cell_size, 12_800);
        assert_eq!(config.grids[1].hlod_layer.as_deref(), Some("HLOD0"));

        let settings = SpatialHashSettings::from_config(&config);
        assert!(!settings.use_aligned_grid_levels);
        assert!(settings.snap_non_aligned_grid_levels_to_lower_levels);
    }

    #[test]
    fn json_round_trip() {
        let config = SpatialHashConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(SpatialHashConfig::from_json_str(&json).unwrap(), config);
    }

    #[test]
    fn rejects_duplicates_and_bad_sizes() {
        let mut config = SpatialHashConfig::default();
        config.grids.push(RuntimeGridDefinition::default());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = SpatialHashConfig {
            grids: vec![RuntimeGridDefinition::new("G", 0, 100.0)],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SpatialHashConfig {
            grids: vec![RuntimeGridDefinition::new("G", 100, -1.0)],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_nan_ranges() {
        let config = SpatialHashConfig {
            grids: vec![RuntimeGridDefinition::new("G", 100, f64::NAN)],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = SpatialHashConfig {
            grids: vec![RuntimeGridDefinition {
                load_margin: f64::NAN,
                ..RuntimeGridDefinition::new("G", 100, 100.0)
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SpatialHashConfig {
            block_on_slow_streaming_ratio: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn debug_color_falls_back_to_name() {
        let grid = RuntimeGridDefinition::new("HLOD0", 100, 100.0);
        assert_eq!(grid.debug_color(), LinearColor::from_name("HLOD0"));
    }
}
