//! Chebyshev-based occlusion estimate for variance shadow maps.
//!
//! The receiver shader in `assets/shaders/vsm_receiver.wgsl` evaluates the same steps on the GPU;
//! the functions here are the reference used by tests, tooling and CPU-side shading.

use glam::{Mat4, Vec2, Vec3};
use serde::{Deserialize, Serialize};

use crate::shadow_space::project_to_shadow_space;

pub const MIN_VARIANCE_FLOOR: f32 = 1e-7;
pub const MAX_MIN_VARIANCE: f32 = 0.01;
pub const MAX_DEPTH_BIAS: f32 = 0.1;

/// Runtime-adjustable receiver tunables.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShadowTuning {
    #[serde(default = "ShadowTuning::default_shadow_strength")]
    pub shadow_strength: f32,
    #[serde(default = "ShadowTuning::default_min_variance")]
    pub min_variance: f32,
    #[serde(default = "ShadowTuning::default_light_bleeding_reduction")]
    pub light_bleeding_reduction: f32,
    #[serde(default = "ShadowTuning::default_depth_bias")]
    pub depth_bias: f32,
}

impl ShadowTuning {
    const fn default_shadow_strength() -> f32 {
        0.7
    }

    const fn default_min_variance() -> f32 {
        0.00001
    }

    const fn default_light_bleeding_reduction() -> f32 {
        0.2
    }

    const fn default_depth_bias() -> f32 {
        0.01
    }

    /// Clamps into the documented ranges; non-finite values fall back to defaults.
    pub fn sanitized(self) -> Self {
        let pick = |value: f32, fallback: f32| if value.is_finite() { value } else { fallback };
        Self {
            shadow_strength: pick(self.shadow_strength, Self::default_shadow_strength()).clamp(0.0, 1.0),
            min_variance: pick(self.min_variance, Self::default_min_variance())
                .clamp(MIN_VARIANCE_FLOOR, MAX_MIN_VARIANCE),
            light_bleeding_reduction: pick(
                self.light_bleeding_reduction,
                Self::default_light_bleeding_reduction(),
            )
            .clamp(0.0, 1.0),
            depth_bias: pick(self.depth_bias, Self::default_depth_bias()).clamp(0.0, MAX_DEPTH_BIAS),
        }
    }
}

impl Default for ShadowTuning {
    fn default() -> Self {
        Self {
            shadow_strength: Self::default_shadow_strength(),
            min_variance: Self::default_min_variance(),
            light_bleeding_reduction: Self::default_light_bleeding_reduction(),
            depth_bias: Self::default_depth_bias(),
        }
    }
}

/// First and second depth moments read from the shadow map.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Moments {
    pub mean: f32,
    pub mean_sq: f32,
}

impl Moments {
    /// Value the shadow map is cleared to; reads as unoccluded.
    pub const CLEAR: Moments = Moments { mean: 1.0, mean_sq: 1.0 };

    pub fn from_depth(depth: f32) -> Self {
        Self { mean: depth, mean_sq: depth * depth }
    }

    pub fn variance(&self, min_variance: f32) -> f32 {
        (self.mean_sq - self.mean * self.mean).max(min_variance)
    }
}

pub fn chebyshev_upper_bound(variance: f32, mean: f32, depth: f32) -> f32 {
    let delta = depth - mean;
    variance / (variance + delta * delta)
}

/// Remaps `[amount, 1]` onto `[0, 1]`, cutting the low tail where light bleeding lives.
pub fn reduce_light_bleeding(p_max: f32, amount: f32) -> f32 {
    let amount = amount.clamp(0.0, 1.0);
    if amount >= 1.0 {
        return if p_max >= 1.0 { 1.0 } else { 0.0 };
    }
    ((p_max - amount) / (1.0 - amount)).clamp(0.0, 1.0)
}

/// Occlusion in [0, 1] for a fragment at shadow-space `depth`.
pub fn estimate_occlusion(moments: Moments, depth: f32, tuning: &ShadowTuning) -> f32 {
    if !moments.mean.is_finite() || !moments.mean_sq.is_finite() || !depth.is_finite() {
        return 0.0;
    }
    let min_variance = tuning.min_variance.max(MIN_VARIANCE_FLOOR);
    let variance = moments.variance(min_variance);
    if depth <= moments.mean + tuning.depth_bias.max(0.0) {
        return 0.0;
    }
    let p_max = chebyshev_upper_bound(variance, moments.mean, depth);
    reduce_light_bleeding(p_max, tuning.light_bleeding_reduction)
}

/// Lighting multiplier: 1 is fully lit.
pub fn shadow_factor(occlusion: f32, shadow_strength: f32) -> f32 {
    1.0 - shadow_strength.clamp(0.0, 1.0) * occlusion.clamp(0.0, 1.0)
}

/// Source of filtered moments at a shadow-map UV.
pub trait MomentSampler {
    /// `None` when nothing can be read at `uv` (outside the map or no data).
    fn sample(&self, uv: Vec2) -> Option<Moments>;
}

/// Shadow factor for a fragment already projected to shadow space (uv + depth).
pub fn shade_shadow_coord(sampler: &dyn MomentSampler, coord: Vec3, tuning: &ShadowTuning) -> f32 {
    if !coord.is_finite() || coord.cmplt(Vec3::ZERO).any() || coord.cmpgt(Vec3::ONE).any() {
        return 1.0;
    }
    match sampler.sample(coord.truncate()) {
        Some(moments) => {
            shadow_factor(estimate_occlusion(moments, coord.z, tuning), tuning.shadow_strength)
        }
        None => 1.0,
    }
}

/// Projects `world` with the shadow-space matrix and shades it.
pub fn shade_world_point(
    sampler: &dyn MomentSampler,
    shadow_space_matrix: &Mat4,
    world: Vec3,
    tuning: &ShadowTuning,
) -> f32 {
    match project_to_shadow_space(shadow_space_matrix, world) {
        Some(coord) => shade_shadow_coord(sampler, coord, tuning),
        None => 1.0,
    }
}
