use glam::{Vec2, Vec3, Vec4};
use image::{GrayImage, Luma};

use super::{MomentPass, ShadowBackend, ShadowMapDescriptor};
use crate::bounds::Aabb;
use crate::error::{VsmError, VsmResult};
use crate::occlusion::{MomentSampler, Moments};
use crate::shadow_space::ProjectionConvention;

const DEFAULT_MAX_RESOLUTION: u32 = 4096;

/// CPU moment map. Texel `(x, y)` covers `u` in `[x, x + 1) / res` and `v` in `[y, y + 1) / res`.
#[derive(Debug, Clone)]
pub struct SoftwareShadowMap {
    resolution: u32,
    texels: Vec<[f32; 2]>,
}

impl SoftwareShadowMap {
    fn new(resolution: u32) -> Self {
        let len = resolution as usize * resolution as usize;
        Self { resolution, texels: vec![[Moments::CLEAR.mean, Moments::CLEAR.mean_sq]; len] }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// `None` outside the map.
    pub fn texel(&self, x: u32, y: u32) -> Option<Moments> {
        if x >= self.resolution || y >= self.resolution {
            return None;
        }
        Some(self.moments_at(x, y))
    }

    fn moments_at(&self, x: u32, y: u32) -> Moments {
        let [mean, mean_sq] = self.texels[self.index(x, y)];
        Moments { mean, mean_sq }
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.resolution as usize + x as usize
    }

    fn write_nearest(&mut self, x: u32, y: u32, depth: f32) {
        let idx = self.index(x, y);
        if depth < self.texels[idx][0] {
            self.texels[idx] = [depth, depth * depth];
        }
    }

    fn fill(&mut self, value: Moments) {
        self.texels.fill([value.mean, value.mean_sq]);
    }

    /// First moment as 8-bit grayscale, oriented so the light's up axis points up in the image
    /// for either convention.
    pub fn depth_image(&self, convention: ProjectionConvention) -> GrayImage {
        let res = self.resolution;
        GrayImage::from_fn(res, res, |x, y| {
            let row = match convention {
                ProjectionConvention::OpenGl => res - 1 - y,
                ProjectionConvention::WebGpu => y,
            };
            let depth = self.moments_at(x, row).mean.clamp(0.0, 1.0);
            Luma([(depth * 255.0).round() as u8])
        })
    }
}

impl MomentSampler for SoftwareShadowMap {
    /// Bilinear fetch with clamp-to-edge addressing.
    fn sample(&self, uv: Vec2) -> Option<Moments> {
        if !uv.is_finite() || uv.cmplt(Vec2::ZERO).any() || uv.cmpgt(Vec2::ONE).any() {
            return None;
        }
        let res = self.resolution as f32;
        let max_index = self.resolution.saturating_sub(1) as f32;
        let pos = uv * res - Vec2::splat(0.5);
        let base = pos.floor();
        let frac = pos - base;
        let fetch = |dx: f32, dy: f32| {
            let x = (base.x + dx).clamp(0.0, max_index) as u32;
            let y = (base.y + dy).clamp(0.0, max_index) as u32;
            let m = self.moments_at(x, y);
            Vec2::new(m.mean, m.mean_sq)
        };
        let top = fetch(0.0, 0.0).lerp(fetch(1.0, 0.0), frac.x);
        let bottom = fetch(0.0, 1.0).lerp(fetch(1.0, 1.0), frac.x);
        let value = top.lerp(bottom, frac.y);
        Some(Moments { mean: value.x, mean_sq: value.y })
    }
}

/// Reference backend that ray-casts each caster's bounding box per texel. Used for headless
/// tooling and tests; exact for box-shaped casters.
#[derive(Debug, Clone)]
pub struct SoftwareShadowBackend {
    max_resolution: u32,
    pub passes_rendered: u64,
}

impl SoftwareShadowBackend {
    pub fn new() -> Self {
        Self { max_resolution: DEFAULT_MAX_RESOLUTION, passes_rendered: 0 }
    }

    pub fn with_max_resolution(mut self, max_resolution: u32) -> Self {
        self.max_resolution = max_resolution;
        self
    }
}

impl Default for SoftwareShadowBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ShadowBackend for SoftwareShadowBackend {
    type Target = SoftwareShadowMap;
    type Mesh = ();

    fn prepare_program(&mut self) -> VsmResult<()> {
        Ok(())
    }

    fn max_resolution(&self) -> u32 {
        self.max_resolution
    }

    fn create_target(&mut self, desc: &ShadowMapDescriptor) -> VsmResult<SoftwareShadowMap> {
        if desc.resolution == 0 || desc.resolution > self.max_resolution {
            let detail = format!("unsupported resolution {}", desc.resolution);
            return Err(VsmError::ShadowMapUnavailable(detail));
        }
        Ok(SoftwareShadowMap::new(desc.resolution))
    }

    fn release_target(&mut self, target: SoftwareShadowMap) {
        drop(target);
    }

    fn clear_target(&mut self, target: &mut SoftwareShadowMap, value: Moments) {
        target.fill(value);
    }

    fn render_moments(
        &mut self,
        target: &mut SoftwareShadowMap,
        pass: &MomentPass<'_, ()>,
    ) -> VsmResult<()> {
        let to_world = pass.shadow_space_matrix.inverse();
        if !to_world.is_finite() {
            return Err(VsmError::ShadowMapUnavailable("shadow camera is not invertible".to_string()));
        }
        let res = target.resolution;
        for draw in &pass.casters {
            let Some((x_range, y_range)) =
                footprint(&pass.shadow_space_matrix, &draw.caster.bounds, res)
            else {
                continue;
            };
            for y in y_range {
                for x in x_range.clone() {
                    let uv = Vec2::new((x as f32 + 0.5) / res as f32, (y as f32 + 0.5) / res as f32);
                    let near = unproject(&to_world, uv.extend(0.0));
                    let far = unproject(&to_world, uv.extend(1.0));
                    if let Some(depth) = ray_box_entry(near, far - near, &draw.caster.bounds) {
                        target.write_nearest(x, y, depth);
                    }
                }
            }
        }
        self.passes_rendered += 1;
        Ok(())
    }
}

fn unproject(to_world: &glam::Mat4, coord: Vec3) -> Vec3 {
    let world: Vec4 = *to_world * coord.extend(1.0);
    world.truncate() / world.w
}

/// Texel ranges covered by the projected box, or `None` if it misses the map.
fn footprint(
    matrix: &glam::Mat4,
    bounds: &Aabb,
    res: u32,
) -> Option<(std::ops::Range<u32>, std::ops::Range<u32>)> {
    let mut lo = Vec2::splat(f32::MAX);
    let mut hi = Vec2::splat(f32::MIN);
    for corner in bounds.corners() {
        let uv = matrix.project_point3(corner).truncate();
        lo = lo.min(uv);
        hi = hi.max(uv);
    }
    if !lo.is_finite() || !hi.is_finite() || hi.x < 0.0 || hi.y < 0.0 || lo.x > 1.0 || lo.y > 1.0 {
        return None;
    }
    let res_f = res as f32;
    let to_texel = |value: f32| (value * res_f).floor().clamp(0.0, res_f - 1.0) as u32;
    let (x0, x1) = (to_texel(lo.x), to_texel(hi.x));
    let (y0, y1) = (to_texel(lo.y), to_texel(hi.y));
    Some((x0..x1 + 1, y0..y1 + 1))
}

/// Parametric entry point in `[0, 1]` of the segment `origin + dir * t` into `bounds`.
fn ray_box_entry(origin: Vec3, dir: Vec3, bounds: &Aabb) -> Option<f32> {
    let mut t_min = 0.0f32;
    let mut t_max = 1.0f32;
    for axis in 0..3 {
        let o = origin[axis];
        let d = dir[axis];
        let (lo, hi) = (bounds.min[axis], bounds.max[axis]);
        if d.abs() < 1e-9 {
            if o < lo || o > hi {
                return None;
            }
            continue;
        }
        let inv = 1.0 / d;
        let mut t0 = (lo - o) * inv;
        let mut t1 = (hi - o) * inv;
        if t0 > t1 {
            std::mem::swap(&mut t0, &mut t1);
        }
        t_min = t_min.max(t0);
        t_max = t_max.min(t1);
        if t_min > t_max {
            return None;
        }
    }
    Some(t_min)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::{LayerMask, SceneBoundsEstimator, ShadowCaster, ShadowCasterRegistry};
    use crate::camera::ShadowCamera;
    use crate::frustum::LightFrustumFitter;
    use crate::renderer::VarianceShadowRenderer;

    type Rendered = (VarianceShadowRenderer<SoftwareShadowBackend>, ShadowCamera);

    fn render_single_box() -> Rendered {
        render_single_box_with(ProjectionConvention::OpenGl)
    }

    fn render_single_box_with(convention: ProjectionConvention) -> Rendered {
        let mut registry = ShadowCasterRegistry::new();
        let block = Aabb::new(Vec3::new(-1.0, 0.0, -1.0), Vec3::new(3.0, 2.0, 1.0));
        registry.register(ShadowCaster::new(block, ()));
        let bounds = SceneBoundsEstimator::default().estimate(&registry);
        let forward = Vec3::new(0.3, -1.0, 0.2);
        let frustum = LightFrustumFitter::default().fit(&bounds, forward, Vec3::Z).expect("fit");
        let mut camera = ShadowCamera::new(LayerMask::ALL, convention);
        camera.apply(frustum);
        let mut renderer = VarianceShadowRenderer::new(SoftwareShadowBackend::new(), 64);
        renderer.activate().expect("activate");
        renderer.render(&camera, &registry).expect("render");
        (renderer, camera)
    }

    #[test]
    fn box_top_is_written_and_background_stays_clear() {
        let (renderer, camera) = render_single_box();
        let map = renderer.target().expect("target");
        let matrix = camera.shadow_space_matrix();
        let top = matrix.project_point3(Vec3::new(0.0, 2.0, 0.0));
        let sampled = map.sample(top.truncate()).expect("inside map");
        assert!((sampled.mean - top.z).abs() < 1e-3, "sampled {} expected {}", sampled.mean, top.z);
        assert_eq!(map.texel(0, 0), Some(Moments::CLEAR));
        assert_eq!(map.texel(63, 63), Some(Moments::CLEAR));
        assert_eq!(map.texel(64, 0), None);
        assert_eq!(map.texel(0, 64), None);
    }

    #[test]
    fn sampling_outside_unit_square_returns_none() {
        let (renderer, _) = render_single_box();
        let map = renderer.target().expect("target");
        assert!(map.sample(Vec2::new(-0.1, 0.5)).is_none());
        assert!(map.sample(Vec2::new(0.5, 1.5)).is_none());
    }

    #[test]
    fn ray_entry_hits_and_misses() {
        let bounds = Aabb::new(Vec3::splat(-1.0), Vec3::ONE);
        let hit = ray_box_entry(Vec3::new(0.0, 5.0, 0.0), Vec3::new(0.0, -10.0, 0.0), &bounds);
        assert!((hit.expect("hit") - 0.4).abs() < 1e-6);
        assert!(ray_box_entry(Vec3::new(3.0, 5.0, 0.0), Vec3::new(0.0, -10.0, 0.0), &bounds).is_none());
    }

    #[test]
    fn depth_image_orientation_does_not_depend_on_convention() {
        let (gl, _) = render_single_box_with(ProjectionConvention::OpenGl);
        let (webgpu, _) = render_single_box_with(ProjectionConvention::WebGpu);
        let gl = gl.target().expect("target").depth_image(ProjectionConvention::OpenGl);
        let webgpu = webgpu.target().expect("target").depth_image(ProjectionConvention::WebGpu);
        assert_eq!(gl.dimensions(), (64, 64));
        assert_eq!(webgpu.dimensions(), gl.dimensions());
        for (a, b) in gl.pixels().zip(webgpu.pixels()) {
            assert!(a.0[0].abs_diff(b.0[0]) <= 1);
        }
        let covered = gl.pixels().filter(|p| p.0[0] < 255).count();
        assert!(covered > 0 && covered < 64 * 64);
    }
}
