use std::sync::atomic::{AtomicU64, Ordering};

use glam::Mat4;
use log::{info, warn};

use crate::bounds::{ShadowCaster, ShadowCasterRegistry};
use crate::camera::ShadowCamera;
use crate::error::{VsmError, VsmResult};
use crate::occlusion::Moments;
use crate::shadow_space::ProjectionConvention;

pub mod software;
#[cfg(feature = "gpu")]
pub mod wgpu_backend;

pub use software::{SoftwareShadowBackend, SoftwareShadowMap};
#[cfg(feature = "gpu")]
pub use wgpu_backend::{
    GpuCasterMesh, ProgramSource, ShaderPrograms, WgpuShadowBackend, WgpuShadowTarget,
};

pub const MIN_SHADOW_RESOLUTION: u32 = 16;
pub const DEFAULT_SHADOW_RESOLUTION: u32 = 1024;

static NEXT_MAP_ID: AtomicU64 = AtomicU64::new(1);

/// Non-owning reference to the current shadow map. The id changes whenever the map is recreated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShadowMapHandle {
    pub id: u64,
    pub resolution: u32,
}

impl ShadowMapHandle {
    fn allocate(resolution: u32) -> Self {
        Self { id: NEXT_MAP_ID.fetch_add(1, Ordering::Relaxed), resolution }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadowMapDescriptor {
    pub resolution: u32,
}

/// One caster as handed to a backend for the moment pass.
pub struct CasterDraw<'a, M> {
    pub caster: &'a ShadowCaster<M>,
}

/// Per-pass data shared by all casters.
pub struct MomentPass<'a, M> {
    pub camera: &'a ShadowCamera,
    /// World to rasterizer clip space.
    pub gpu_view_projection: Mat4,
    /// World to (u, v, depth); backends store `depth` and `depth²` from this mapping.
    pub shadow_space_matrix: Mat4,
    pub casters: Vec<CasterDraw<'a, M>>,
}

/// Host rendering seam: owns programs and render targets for the moment pass.
pub trait ShadowBackend {
    type Target;
    type Mesh;

    /// Loads or compiles the moment program.
    fn prepare_program(&mut self) -> VsmResult<()>;

    fn max_resolution(&self) -> u32;

    /// Convention the backend's rasterizer and sampler impose, if any.
    fn required_convention(&self) -> Option<ProjectionConvention> {
        None
    }

    fn create_target(&mut self, desc: &ShadowMapDescriptor) -> VsmResult<Self::Target>;

    fn release_target(&mut self, target: Self::Target);

    fn clear_target(&mut self, target: &mut Self::Target, value: Moments);

    fn render_moments(
        &mut self,
        target: &mut Self::Target,
        pass: &MomentPass<'_, Self::Mesh>,
    ) -> VsmResult<()>;
}

struct ActiveTarget<T> {
    target: T,
    handle: ShadowMapHandle,
}

/// Renders depth moments of the registered casters into a backend-owned target.
pub struct VarianceShadowRenderer<B: ShadowBackend> {
    backend: B,
    target: Option<ActiveTarget<B::Target>>,
    resolution: u32,
    active: bool,
}

impl<B: ShadowBackend> VarianceShadowRenderer<B> {
    pub fn new(backend: B, resolution: u32) -> Self {
        Self { backend, target: None, resolution: resolution.max(MIN_SHADOW_RESOLUTION), active: false }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Takes effect on the next render, which recreates the target.
    pub fn set_resolution(&mut self, resolution: u32) {
        self.resolution = resolution.max(MIN_SHADOW_RESOLUTION);
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn handle(&self) -> Option<ShadowMapHandle> {
        self.target.as_ref().map(|t| t.handle)
    }

    pub fn target(&self) -> Option<&B::Target> {
        self.target.as_ref().map(|t| &t.target)
    }

    /// Prepares the program and tries to create the target. A failed creation is not fatal;
    /// the next render retries it.
    pub fn activate(&mut self) -> VsmResult<()> {
        self.backend.prepare_program()?;
        self.active = true;
        if let Err(err) = self.ensure_target() {
            warn!("shadow map creation deferred: {err}");
        }
        Ok(())
    }

    pub fn deactivate(&mut self) {
        self.active = false;
        self.release();
    }

    fn release(&mut self) {
        if let Some(active) = self.target.take() {
            info!("releasing shadow map {} ({}px)", active.handle.id, active.handle.resolution);
            self.backend.release_target(active.target);
        }
    }

    fn ensure_target(&mut self) -> VsmResult<ShadowMapHandle> {
        if let Some(active) = &self.target {
            if active.handle.resolution == self.resolution {
                return Ok(active.handle);
            }
            self.release();
        }
        let max = self.backend.max_resolution();
        if self.resolution > max {
            return Err(VsmError::ShadowMapUnavailable(format!(
                "resolution {} exceeds backend limit {max}",
                self.resolution
            )));
        }
        let target = self.backend.create_target(&ShadowMapDescriptor { resolution: self.resolution })?;
        let handle = ShadowMapHandle::allocate(self.resolution);
        info!("shadow map {} created ({}x{})", handle.id, self.resolution, self.resolution);
        self.target = Some(ActiveTarget { target, handle });
        Ok(handle)
    }

    /// Clears the target to the unoccluded sentinel and draws the casters seen by `camera`.
    pub fn render(
        &mut self,
        camera: &ShadowCamera,
        registry: &ShadowCasterRegistry<B::Mesh>,
    ) -> VsmResult<ShadowMapHandle> {
        if !self.active {
            return Err(VsmError::ShadowMapUnavailable("renderer is not active".to_string()));
        }
        let handle = self.ensure_target().inspect_err(|err| warn!("skipping shadow render: {err}"))?;
        let pass = MomentPass {
            camera,
            gpu_view_projection: camera.gpu_view_projection(),
            shadow_space_matrix: camera.shadow_space_matrix(),
            casters: registry.casters(camera.caster_mask).map(|caster| CasterDraw { caster }).collect(),
        };
        let active = self
            .target
            .as_mut()
            .ok_or_else(|| VsmError::ShadowMapUnavailable("target vanished".to_string()))?;
        self.backend.clear_target(&mut active.target, Moments::CLEAR);
        self.backend.render_moments(&mut active.target, &pass)?;
        Ok(handle)
    }
}

impl<B: ShadowBackend> Drop for VarianceShadowRenderer<B> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::Aabb;
    use glam::Vec3;

    #[derive(Default)]
    struct Flaky {
        failures_left: u32,
        created: u32,
        released: u32,
        clears: u32,
        drawn: usize,
    }

    impl ShadowBackend for Flaky {
        type Target = u32;
        type Mesh = ();

        fn prepare_program(&mut self) -> VsmResult<()> {
            Ok(())
        }

        fn max_resolution(&self) -> u32 {
            4096
        }

        fn create_target(&mut self, desc: &ShadowMapDescriptor) -> VsmResult<u32> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(VsmError::ShadowMapUnavailable("out of memory".to_string()));
            }
            self.created += 1;
            Ok(desc.resolution)
        }

        fn release_target(&mut self, _target: u32) {
            self.released += 1;
        }

        fn clear_target(&mut self, _target: &mut u32, value: Moments) {
            assert_eq!(value, Moments::CLEAR);
            self.clears += 1;
        }

        fn render_moments(&mut self, _target: &mut u32, pass: &MomentPass<'_, ()>) -> VsmResult<()> {
            self.drawn += pass.casters.len();
            Ok(())
        }
    }

    fn registry() -> ShadowCasterRegistry {
        let mut registry = ShadowCasterRegistry::new();
        registry.register(ShadowCaster::new(Aabb::new(Vec3::ZERO, Vec3::ONE), ()));
        registry
    }

    #[test]
    fn creation_failure_reports_unavailable_then_retries() {
        let backend = Flaky { failures_left: 2, ..Flaky::default() };
        let mut renderer = VarianceShadowRenderer::new(backend, 256);
        renderer.activate().expect("activation tolerates creation failure");
        assert!(renderer.handle().is_none());
        let camera = ShadowCamera::default();
        let err = renderer.render(&camera, &registry()).unwrap_err();
        assert!(matches!(err, VsmError::ShadowMapUnavailable(_)));
        let handle = renderer.render(&camera, &registry()).expect("retry succeeds");
        assert_eq!(handle.resolution, 256);
        assert_eq!(renderer.backend().created, 1);
        assert_eq!(renderer.backend().clears, 1);
        assert_eq!(renderer.backend().drawn, 1);
    }

    #[test]
    fn resolution_change_recreates_target() {
        let mut renderer = VarianceShadowRenderer::new(Flaky::default(), 512);
        renderer.activate().expect("activate");
        let first = renderer.handle().expect("created on activation");
        renderer.set_resolution(1024);
        let second = renderer.render(&ShadowCamera::default(), &registry()).expect("render");
        assert_ne!(first.id, second.id);
        assert_eq!(second.resolution, 1024);
        assert_eq!(renderer.backend().released, 1);
    }

    #[test]
    fn deactivate_releases_and_blocks_rendering() {
        let mut renderer = VarianceShadowRenderer::new(Flaky::default(), 256);
        renderer.activate().expect("activate");
        renderer.deactivate();
        assert_eq!(renderer.backend().created, renderer.backend().released);
        assert!(renderer.render(&ShadowCamera::default(), &registry()).is_err());
    }

    #[test]
    fn oversized_resolution_is_unavailable() {
        let mut renderer = VarianceShadowRenderer::new(Flaky::default(), 8192);
        renderer.activate().expect("activate");
        let err = renderer.render(&ShadowCamera::default(), &registry()).unwrap_err();
        assert!(matches!(err, VsmError::ShadowMapUnavailable(_)));
        assert_eq!(renderer.backend().created, 0);
    }
}
