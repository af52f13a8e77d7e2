use glam::{Mat4, Vec3, Vec4};
use serde::{Deserialize, Serialize};

/// Clip/texture conventions of the backend that rasterizes and samples the shadow map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionConvention {
    /// Clip z in [-1, 1], texture origin bottom-left.
    #[default]
    OpenGl,
    /// Clip z in [0, 1], texture origin top-left.
    WebGpu,
}

impl ProjectionConvention {
    /// Maps clip space [-1, 1] onto texture space [0, 1] on x, y and z.
    pub fn texture_bias(self) -> Mat4 {
        let v_scale = match self {
            ProjectionConvention::OpenGl => 0.5,
            ProjectionConvention::WebGpu => -0.5,
        };
        Mat4::from_cols(
            Vec4::new(0.5, 0.0, 0.0, 0.0),
            Vec4::new(0.0, v_scale, 0.0, 0.0),
            Vec4::new(0.0, 0.0, 0.5, 0.0),
            Vec4::new(0.5, 0.5, 0.5, 1.0),
        )
    }

    /// Converts a logical (z in [-1, 1]) projection into the one the rasterizer expects.
    pub fn gpu_projection(self, projection: Mat4) -> Mat4 {
        match self {
            ProjectionConvention::OpenGl => projection,
            ProjectionConvention::WebGpu => {
                let remap_z = Mat4::from_cols(
                    Vec4::X,
                    Vec4::Y,
                    Vec4::new(0.0, 0.0, 0.5, 0.0),
                    Vec4::new(0.0, 0.0, 0.5, 1.0),
                );
                remap_z * projection
            }
        }
    }
}

/// Builds the matrix taking world positions to shadow-map UV plus depth, all in [0, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowSpaceTransform {
    pub convention: ProjectionConvention,
}

impl ShadowSpaceTransform {
    pub fn new(convention: ProjectionConvention) -> Self {
        Self { convention }
    }

    pub fn world_to_shadow_clip(view: Mat4, projection: Mat4) -> Mat4 {
        projection * view
    }

    pub fn shadow_space_matrix(&self, view: Mat4, projection: Mat4) -> Mat4 {
        self.convention.texture_bias() * Self::world_to_shadow_clip(view, projection)
    }
}

/// Applies the shadow-space matrix with a homogeneous divide. Returns `None` when `w` vanishes.
pub fn project_to_shadow_space(matrix: &Mat4, world: Vec3) -> Option<Vec3> {
    let clip = *matrix * world.extend(1.0);
    if !clip.w.is_finite() || clip.w.abs() < f32::EPSILON {
        return None;
    }
    Some(clip.truncate() / clip.w)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::{Aabb, SceneBoundsEstimator};
    use crate::frustum::LightFrustumFitter;

    #[test]
    fn texture_bias_maps_clip_cube_to_unit_cube() {
        let bias = ProjectionConvention::OpenGl.texture_bias();
        assert_eq!(bias.transform_point3(Vec3::splat(-1.0)), Vec3::ZERO);
        assert_eq!(bias.transform_point3(Vec3::ONE), Vec3::ONE);
        assert_eq!(bias.transform_point3(Vec3::ZERO), Vec3::splat(0.5));

        let flipped = ProjectionConvention::WebGpu.texture_bias();
        assert_eq!(flipped.transform_point3(Vec3::new(-1.0, 1.0, -1.0)), Vec3::ZERO);
    }

    #[test]
    fn identical_camera_state_gives_identical_bits() {
        let bounds = SceneBoundsEstimator::default()
            .estimate_from([Aabb::new(Vec3::new(-1.0, 0.0, -1.0), Vec3::new(1.0, 2.0, 1.0))]);
        let forward = Vec3::new(0.4, -0.8, 0.35);
        let frustum = LightFrustumFitter::default().fit(&bounds, forward, Vec3::Y).expect("fit");
        let transform = ShadowSpaceTransform::default();
        let a = transform.shadow_space_matrix(frustum.view_matrix(), frustum.projection_matrix());
        let b = transform.shadow_space_matrix(frustum.view_matrix(), frustum.projection_matrix());
        let bits = |m: Mat4| m.to_cols_array().map(f32::to_bits);
        assert_eq!(bits(a), bits(b));
    }

    #[test]
    fn points_inside_frustum_land_in_unit_cube() {
        let bounds = SceneBoundsEstimator::default().estimate_from([
            Aabb::new(Vec3::new(-3.0, 0.0, -3.0), Vec3::new(3.0, 5.0, 3.0)),
            Aabb::new(Vec3::new(12.0, -1.0, 4.0), Vec3::new(14.0, 2.0, 9.0)),
        ]);
        let fitter = LightFrustumFitter::default();
        for convention in [ProjectionConvention::OpenGl, ProjectionConvention::WebGpu] {
            let transform = ShadowSpaceTransform::new(convention);
            for dir in [Vec3::new(0.3, -1.0, 0.1), Vec3::new(-1.0, -0.5, 0.2), Vec3::NEG_Y] {
                let frustum = fitter.fit(&bounds, dir, Vec3::Y).expect("fit");
                let matrix =
                    transform.shadow_space_matrix(frustum.view_matrix(), frustum.projection_matrix());
                let interior = frustum.position + frustum.forward() * (frustum.far * 0.5);
                for corner in frustum.corners() {
                    let point = corner + (interior - corner) * 0.01;
                    let uvz = project_to_shadow_space(&matrix, point).expect("finite");
                    assert!(uvz.cmpge(Vec3::ZERO).all() && uvz.cmple(Vec3::ONE).all(), "{uvz:?}");
                }
            }
        }
    }

    #[test]
    fn gpu_projection_remaps_depth_to_zero_one() {
        let proj = Mat4::orthographic_rh_gl(-1.0, 1.0, -1.0, 1.0, 1.0, 3.0);
        let gpu = ProjectionConvention::WebGpu.gpu_projection(proj);
        assert!(gpu.transform_point3(Vec3::new(0.0, 0.0, -1.0)).z.abs() < 1e-6);
        assert!((gpu.transform_point3(Vec3::new(0.0, 0.0, -3.0)).z - 1.0).abs() < 1e-6);
        assert_eq!(ProjectionConvention::OpenGl.gpu_projection(proj), proj);
    }
}
