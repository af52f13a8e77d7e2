use glam::{Mat4, Vec3};

use crate::bounds::LayerMask;
use crate::frustum::LightFrustum;
use crate::shadow_space::{ProjectionConvention, ShadowSpaceTransform};

/// Logical orthographic camera the shadow map is rendered from. Reused across frames and
/// re-aimed every frame from the freshly fitted frustum.
#[derive(Debug, Clone)]
pub struct ShadowCamera {
    frustum: Option<LightFrustum>,
    pub caster_mask: LayerMask,
    pub convention: ProjectionConvention,
}

impl ShadowCamera {
    pub fn new(caster_mask: LayerMask, convention: ProjectionConvention) -> Self {
        Self { frustum: None, caster_mask, convention }
    }

    pub fn apply(&mut self, frustum: LightFrustum) {
        self.frustum = Some(frustum);
    }

    pub fn frustum(&self) -> Option<&LightFrustum> {
        self.frustum.as_ref()
    }

    pub fn position(&self) -> Vec3 {
        self.frustum.map(|f| f.position).unwrap_or(Vec3::ZERO)
    }

    pub fn view_matrix(&self) -> Mat4 {
        self.frustum.map(|f| f.view_matrix()).unwrap_or(Mat4::IDENTITY)
    }

    pub fn projection_matrix(&self) -> Mat4 {
        self.frustum.map(|f| f.projection_matrix()).unwrap_or(Mat4::IDENTITY)
    }

    /// Projection adjusted to the backend's clip conventions, for rasterization only.
    pub fn gpu_projection_matrix(&self) -> Mat4 {
        self.convention.gpu_projection(self.projection_matrix())
    }

    pub fn gpu_view_projection(&self) -> Mat4 {
        self.gpu_projection_matrix() * self.view_matrix()
    }

    pub fn shadow_space_matrix(&self) -> Mat4 {
        ShadowSpaceTransform::new(self.convention)
            .shadow_space_matrix(self.view_matrix(), self.projection_matrix())
    }
}

impl Default for ShadowCamera {
    fn default() -> Self {
        Self::new(LayerMask::ALL, ProjectionConvention::default())
    }
}
