use anyhow::{Context, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::bounds::{BoundsConfig, LayerMask};
use crate::frustum::FitConfig;
use crate::occlusion::ShadowTuning;
use crate::renderer::{DEFAULT_SHADOW_RESOLUTION, MIN_SHADOW_RESOLUTION};
use crate::shadow_space::ProjectionConvention;

pub const MAX_CONFIG_RESOLUTION: u32 = 8192;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowMapConfig {
    #[serde(default = "ShadowMapConfig::default_resolution")]
    pub resolution: u32,
    #[serde(default)]
    pub caster_layers: LayerMask,
    #[serde(default)]
    pub convention: ProjectionConvention,
    /// WGSL file replacing the built-in moment program.
    #[serde(default)]
    pub moment_shader: Option<PathBuf>,
    /// WGSL file replacing the built-in receiver include.
    #[serde(default)]
    pub receiver_shader: Option<PathBuf>,
}

impl ShadowMapConfig {
    const fn default_resolution() -> u32 {
        DEFAULT_SHADOW_RESOLUTION
    }
}

impl Default for ShadowMapConfig {
    fn default() -> Self {
        Self {
            resolution: Self::default_resolution(),
            caster_layers: LayerMask::default(),
            convention: ProjectionConvention::default(),
            moment_shader: None,
            receiver_shader: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VsmConfig {
    #[serde(default)]
    pub shadow_map: ShadowMapConfig,
    #[serde(default)]
    pub tuning: ShadowTuning,
    #[serde(default)]
    pub fit: FitConfig,
    #[serde(default)]
    pub bounds: BoundsConfig,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VsmConfigOverrides {
    pub resolution: Option<u32>,
    pub shadow_strength: Option<f32>,
    pub min_variance: Option<f32>,
    pub light_bleeding_reduction: Option<f32>,
    pub depth_bias: Option<f32>,
}

impl VsmConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Config load error: {err:?}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &VsmConfigOverrides) {
        if let Some(resolution) = overrides.resolution {
            self.shadow_map.resolution = resolution;
        }
        if let Some(strength) = overrides.shadow_strength {
            self.tuning.shadow_strength = strength;
        }
        if let Some(min_variance) = overrides.min_variance {
            self.tuning.min_variance = min_variance;
        }
        if let Some(amount) = overrides.light_bleeding_reduction {
            self.tuning.light_bleeding_reduction = amount;
        }
        if let Some(bias) = overrides.depth_bias {
            self.tuning.depth_bias = bias;
        }
    }

    /// Copy with every tunable clamped into its supported range.
    pub fn sanitized(&self) -> Self {
        let mut cfg = self.clone();
        cfg.shadow_map.resolution =
            cfg.shadow_map.resolution.clamp(MIN_SHADOW_RESOLUTION, MAX_CONFIG_RESOLUTION);
        cfg.tuning = cfg.tuning.sanitized();
        cfg.fit = cfg.fit.sanitized();
        cfg.bounds = cfg.bounds.sanitized();
        cfg
    }
}

impl VsmConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.applied_fields().is_empty()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.resolution.is_some() {
            fields.push("resolution");
        }
        if self.shadow_strength.is_some() {
            fields.push("shadow_strength");
        }
        if self.min_variance.is_some() {
            fields.push("min_variance");
        }
        if self.light_bleeding_reduction.is_some() {
            fields.push("light_bleeding_reduction");
        }
        if self.depth_bias.is_some() {
            fields.push("depth_bias");
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = NamedTempFile::new().expect("temp file");
        let json = r#"{
            "shadow_map": { "resolution": 2048, "convention": "web_gpu" },
            "tuning": { "shadow_strength": 0.5 }
        }"#;
        write!(file, "{json}").expect("write config");
        let cfg = VsmConfig::load(file.path()).expect("load config");
        assert_eq!(cfg.shadow_map.resolution, 2048);
        assert_eq!(cfg.shadow_map.convention, ProjectionConvention::WebGpu);
        assert_eq!(cfg.shadow_map.caster_layers, LayerMask::ALL);
        assert_eq!(cfg.tuning.shadow_strength, 0.5);
        assert_eq!(cfg.tuning.min_variance, ShadowTuning::default().min_variance);
        assert_eq!(cfg.fit, FitConfig::default());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let cfg = VsmConfig::load_or_default(dir.path().join("absent.json"));
        assert_eq!(cfg, VsmConfig::default());
    }

    #[test]
    fn overrides_then_sanitize_clamps() {
        let mut cfg = VsmConfig::default();
        let overrides = VsmConfigOverrides {
            resolution: Some(4),
            shadow_strength: Some(3.0),
            depth_bias: Some(0.02),
            ..VsmConfigOverrides::default()
        };
        assert_eq!(overrides.applied_fields(), vec!["resolution", "shadow_strength", "depth_bias"]);
        cfg.apply_overrides(&overrides);
        let cfg = cfg.sanitized();
        assert_eq!(cfg.shadow_map.resolution, MIN_SHADOW_RESOLUTION);
        assert_eq!(cfg.tuning.shadow_strength, 1.0);
        assert_eq!(cfg.tuning.depth_bias, 0.02);
        assert!(VsmConfigOverrides::default().is_empty());
    }
}
