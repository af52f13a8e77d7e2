use glam::{Mat3, Mat4, Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::bounds::SceneBounds;
use crate::error::{VsmError, VsmResult};
use crate::light::LightTransform;

const DEGENERATE_EPS: f32 = 1e-6;

/// Knobs for fitting the light frustum around the scene bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    #[serde(default = "FitConfig::default_fit_factor")]
    pub fit_factor: f32,
    #[serde(default = "FitConfig::default_margin")]
    pub margin: f32,
    #[serde(default = "FitConfig::default_far_margin")]
    pub far_margin: f32,
    #[serde(default = "FitConfig::default_near")]
    pub near: f32,
    #[serde(default = "FitConfig::default_min_ortho_half_size")]
    pub min_ortho_half_size: f32,
}

impl FitConfig {
    const fn default_fit_factor() -> f32 {
        0.7
    }

    const fn default_margin() -> f32 {
        10.0
    }

    const fn default_far_margin() -> f32 {
        5.0
    }

    const fn default_near() -> f32 {
        0.1
    }

    const fn default_min_ortho_half_size() -> f32 {
        10.0
    }

    /// Clamps every field into a range that keeps `0 < near < far`.
    pub fn sanitized(self) -> Self {
        let near =
            if self.near.is_finite() { self.near.clamp(1e-4, 10.0) } else { Self::default_near() };
        Self {
            fit_factor: finite_or(self.fit_factor, Self::default_fit_factor()).max(0.0),
            margin: finite_or(self.margin, Self::default_margin()).max(near + 1e-3),
            far_margin: finite_or(self.far_margin, Self::default_far_margin()).max(0.0),
            near,
            min_ortho_half_size: finite_or(
                self.min_ortho_half_size,
                Self::default_min_ortho_half_size(),
            )
            .max(1e-3),
        }
    }
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            fit_factor: Self::default_fit_factor(),
            margin: Self::default_margin(),
            far_margin: Self::default_far_margin(),
            near: Self::default_near(),
            min_ortho_half_size: Self::default_min_ortho_half_size(),
        }
    }
}

fn finite_or(value: f32, fallback: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        fallback
    }
}

/// Orthographic light camera fitted for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightFrustum {
    pub position: Vec3,
    pub rotation: Quat,
    pub ortho_half_size: f32,
    pub near: f32,
    pub far: f32,
}

impl LightFrustum {
    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::NEG_Z
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward(), self.up())
    }

    /// Logical projection; clip z spans [-1, 1] between near and far.
    pub fn projection_matrix(&self) -> Mat4 {
        let h = self.ortho_half_size;
        Mat4::orthographic_rh_gl(-h, h, -h, h, self.near, self.far)
    }

    /// Distance of `point` in front of the light along the view axis.
    pub fn view_depth(&self, point: Vec3) -> f32 {
        (point - self.position).dot(self.forward())
    }

    pub fn contains(&self, point: Vec3) -> bool {
        let local = point - self.position;
        let depth = local.dot(self.forward());
        let h = self.ortho_half_size;
        local.dot(self.right()).abs() <= h
            && local.dot(self.up()).abs() <= h
            && depth >= self.near
            && depth <= self.far
    }

    /// Near plane corners followed by far plane corners, in world space.
    pub fn corners(&self) -> [Vec3; 8] {
        let (right, up, forward) = (self.right(), self.up(), self.forward());
        let h = self.ortho_half_size;
        let mut corners = [Vec3::ZERO; 8];
        for (plane, depth) in [self.near, self.far].into_iter().enumerate() {
            let base = self.position + forward * depth;
            let quad = [(-h, -h), (h, -h), (h, h), (-h, h)];
            for (idx, (x, y)) in quad.into_iter().enumerate() {
                corners[plane * 4 + idx] = base + right * x + up * y;
            }
        }
        corners
    }
}

/// Rotation whose local -Z points along `forward`, keeping `up_hint` as close to +Y as possible.
pub fn look_rotation(forward: Vec3, up_hint: Vec3) -> Option<Quat> {
    let forward = normalized_direction(forward)?;
    let candidates = [up_hint, Vec3::Y, Vec3::X];
    let up = candidates.into_iter().find(|up| {
        up.is_finite()
            && up.length_squared() > DEGENERATE_EPS
            && forward.cross(*up).length_squared() > 1e-6
    })?;
    let right = forward.cross(up).normalize();
    let up = right.cross(forward);
    Some(Quat::from_mat3(&Mat3::from_cols(right, up, -forward)).normalize())
}

fn normalized_direction(direction: Vec3) -> Option<Vec3> {
    if !direction.is_finite() || direction.length_squared() < DEGENERATE_EPS {
        return None;
    }
    Some(direction.normalize())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LightFrustumFitter {
    pub config: FitConfig,
}

impl LightFrustumFitter {
    pub fn new(config: FitConfig) -> Self {
        Self { config: config.sanitized() }
    }

    pub fn fit_light(
        &self,
        bounds: &SceneBounds,
        light: &dyn LightTransform,
    ) -> VsmResult<LightFrustum> {
        self.fit(bounds, light.forward(), light.up())
    }

    pub fn fit(&self, bounds: &SceneBounds, forward: Vec3, up_hint: Vec3) -> VsmResult<LightFrustum> {
        let forward = normalized_direction(forward).ok_or(VsmError::InvalidLightOrientation)?;
        let rotation = look_rotation(forward, up_hint).ok_or(VsmError::InvalidLightOrientation)?;
        let cfg = &self.config;
        let size = bounds.size();
        let diagonal = size.length();
        let distance = diagonal + cfg.margin;
        let position = bounds.center - forward * distance;
        let ortho_half_size = (size.x.max(size.z) * cfg.fit_factor).max(cfg.min_ortho_half_size);
        let far = distance + diagonal + cfg.far_margin;
        Ok(LightFrustum { position, rotation, ortho_half_size, near: cfg.near, far })
    }
}
