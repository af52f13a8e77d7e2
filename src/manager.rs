use glam::Mat4;
use log::{debug, error, info, warn};
use serde::Serialize;

use crate::bounds::{BoundsConfig, LayerMask, SceneBounds, SceneBoundsEstimator, ShadowCasterRegistry};
use crate::camera::ShadowCamera;
use crate::config::VsmConfig;
use crate::error::{VsmError, VsmResult};
use crate::frustum::{FitConfig, LightFrustum, LightFrustumFitter};
use crate::light::LightTransform;
use crate::occlusion::ShadowTuning;
use crate::receiver::{ReceiverParameterSet, ReceiverSet};
use crate::renderer::{ShadowBackend, ShadowMapHandle, VarianceShadowRenderer};

const SUMMARY_INTERVAL: u64 = 60;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameStatus {
    Rendered { shadow_map_id: u64, resolution: u32 },
    /// Manager inactive; receivers were left fully lit.
    Disabled,
    Failed { error: String, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct FrustumReport {
    pub position: [f32; 3],
    pub forward: [f32; 3],
    pub ortho_half_size: f32,
    pub near: f32,
    pub far: f32,
}

impl From<&LightFrustum> for FrustumReport {
    fn from(frustum: &LightFrustum) -> Self {
        Self {
            position: frustum.position.to_array(),
            forward: frustum.forward().to_array(),
            ortho_half_size: frustum.ortho_half_size,
            near: frustum.near,
            far: frustum.far,
        }
    }
}

/// Summary of one `update`.
#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    pub frame: u64,
    pub bounds_center: Option<[f32; 3]>,
    pub bounds_extents: Option<[f32; 3]>,
    pub frustum: Option<FrustumReport>,
    /// Column-major.
    pub shadow_space_matrix: Option<[f32; 16]>,
    pub receivers_updated: usize,
    pub status: FrameStatus,
}

impl FrameReport {
    pub fn is_rendered(&self) -> bool {
        matches!(self.status, FrameStatus::Rendered { .. })
    }
}

#[derive(Default)]
struct FrameStages {
    bounds: Option<SceneBounds>,
    frustum: Option<LightFrustum>,
    matrix: Option<Mat4>,
}

/// Drives the per-frame pipeline: bounds, fit, moment render, shadow-space matrix, then the
/// receiver parameter push. Any failure leaves receivers fully lit for that frame.
pub struct VsmShadowManager<B: ShadowBackend> {
    renderer: VarianceShadowRenderer<B>,
    camera: ShadowCamera,
    estimator: SceneBoundsEstimator,
    fitter: LightFrustumFitter,
    tuning: ShadowTuning,
    enabled: bool,
    frame: u64,
}

impl<B: ShadowBackend> VsmShadowManager<B> {
    pub fn new(backend: B, config: &VsmConfig) -> Self {
        let config = config.sanitized();
        let mut convention = config.shadow_map.convention;
        if let Some(required) = backend.required_convention() {
            if required != convention {
                warn!(
                    "backend requires the {required:?} convention; ignoring configured {convention:?}"
                );
                convention = required;
            }
        }
        Self {
            renderer: VarianceShadowRenderer::new(backend, config.shadow_map.resolution),
            camera: ShadowCamera::new(config.shadow_map.caster_layers, convention),
            estimator: SceneBoundsEstimator::new(config.bounds),
            fitter: LightFrustumFitter::new(config.fit),
            tuning: config.tuning,
            enabled: false,
            frame: 0,
        }
    }

    /// Prepares the moment program and shadow map. A missing program leaves the manager disabled.
    pub fn activate(&mut self) -> VsmResult<()> {
        match self.renderer.activate() {
            Ok(()) => {
                self.enabled = true;
                info!("variance shadows enabled ({}px)", self.renderer.resolution());
                Ok(())
            }
            Err(err) => {
                self.enabled = false;
                error!("variance shadows disabled: {err}");
                Err(err)
            }
        }
    }

    pub fn deactivate(&mut self) {
        self.enabled = false;
        self.renderer.deactivate();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn tuning(&self) -> &ShadowTuning {
        &self.tuning
    }

    /// Values are clamped into their supported ranges on the next update.
    pub fn tuning_mut(&mut self) -> &mut ShadowTuning {
        &mut self.tuning
    }

    pub fn fit_config(&self) -> &FitConfig {
        &self.fitter.config
    }

    /// Takes effect on the next update, after clamping.
    pub fn fit_config_mut(&mut self) -> &mut FitConfig {
        &mut self.fitter.config
    }

    pub fn bounds_config_mut(&mut self) -> &mut BoundsConfig {
        &mut self.estimator.config
    }

    pub fn set_caster_mask(&mut self, mask: LayerMask) {
        self.camera.caster_mask = mask;
    }

    pub fn set_resolution(&mut self, resolution: u32) {
        self.renderer.set_resolution(resolution);
    }

    pub fn camera(&self) -> &ShadowCamera {
        &self.camera
    }

    pub fn renderer(&self) -> &VarianceShadowRenderer<B> {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut VarianceShadowRenderer<B> {
        &mut self.renderer
    }

    pub fn shadow_map(&self) -> Option<&B::Target> {
        self.renderer.target()
    }

    pub fn update(
        &mut self,
        light: &dyn LightTransform,
        registry: &ShadowCasterRegistry<B::Mesh>,
        receivers: &mut ReceiverSet,
    ) -> FrameReport {
        self.frame += 1;
        self.tuning = self.tuning.sanitized();
        self.fitter.config = self.fitter.config.sanitized();
        self.estimator.config = self.estimator.config.sanitized();
        let mut stages = FrameStages::default();

        let status = if !self.enabled {
            receivers.disable_all(self.tuning);
            FrameStatus::Disabled
        } else {
            match self.run_frame(light, registry, &mut stages) {
                Ok(handle) => {
                    let params = ReceiverParameterSet {
                        shadow_map: Some(handle),
                        shadow_space_matrix: stages.matrix.unwrap_or(Mat4::IDENTITY),
                        tuning: self.tuning,
                    };
                    receivers.push(params);
                    FrameStatus::Rendered { shadow_map_id: handle.id, resolution: handle.resolution }
                }
                Err(err) => {
                    warn!("frame {}: shadows skipped ({}): {err}", self.frame, err.label());
                    receivers.disable_all(self.tuning);
                    FrameStatus::Failed {
                        error: err.label().to_string(),
                        message: err.to_string(),
                    }
                }
            }
        };

        let report = FrameReport {
            frame: self.frame,
            bounds_center: stages.bounds.map(|b| b.center.to_array()),
            bounds_extents: stages.bounds.map(|b| b.extents.to_array()),
            frustum: stages.frustum.as_ref().map(FrustumReport::from),
            shadow_space_matrix: stages.matrix.map(|m| m.to_cols_array()),
            receivers_updated: receivers.len(),
            status,
        };
        if self.frame % SUMMARY_INTERVAL == 0 {
            debug!(
                "vsm frame {}: casters={} receivers={} status={:?} half_size={:?}",
                report.frame,
                registry.len(),
                report.receivers_updated,
                report.status,
                report.frustum.as_ref().map(|f| f.ortho_half_size)
            );
        }
        report
    }

    fn run_frame(
        &mut self,
        light: &dyn LightTransform,
        registry: &ShadowCasterRegistry<B::Mesh>,
        stages: &mut FrameStages,
    ) -> Result<ShadowMapHandle, VsmError> {
        let bounds = self.estimator.estimate(registry);
        stages.bounds = Some(bounds);
        let frustum = self.fitter.fit_light(&bounds, light)?;
        stages.frustum = Some(frustum);
        self.camera.apply(frustum);
        let handle = self.renderer.render(&self.camera, registry)?;
        stages.matrix = Some(self.camera.shadow_space_matrix());
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounds::{Aabb, ShadowCaster};
    use crate::light::{DirectionalLight, LightDirection};
    use crate::occlusion::{MomentSampler, Moments};
    use crate::renderer::SoftwareShadowBackend;
    use glam::Vec3;

    fn scene() -> (ShadowCasterRegistry, ReceiverSet) {
        let mut registry = ShadowCasterRegistry::new();
        let cube = Aabb::new(Vec3::new(-0.5, 0.5, -0.5), Vec3::new(0.5, 1.5, 0.5));
        registry.register(ShadowCaster::new(cube, ()));
        let mut receivers = ReceiverSet::new();
        receivers.add("ground");
        (registry, receivers)
    }

    fn manager() -> VsmShadowManager<SoftwareShadowBackend> {
        let mut config = VsmConfig::default();
        config.shadow_map.resolution = 128;
        VsmShadowManager::new(SoftwareShadowBackend::new(), &config)
    }

    #[test]
    fn update_before_activation_leaves_receivers_lit() {
        let mut manager = manager();
        let (registry, mut receivers) = scene();
        let report = manager.update(&DirectionalLight::default(), &registry, &mut receivers);
        assert_eq!(report.status, FrameStatus::Disabled);
        assert!(receivers.iter().all(|(_, r)| !r.params.is_enabled()));
    }

    #[test]
    fn rendered_frame_pushes_matrix_and_handle() {
        let mut manager = manager();
        manager.activate().expect("activate");
        let (registry, mut receivers) = scene();
        let report = manager.update(&DirectionalLight::default(), &registry, &mut receivers);
        assert!(report.is_rendered());
        let (_, ground) = receivers.iter().next().expect("receiver");
        assert_eq!(ground.params.shadow_map, manager.renderer().handle());
        assert_eq!(ground.params.shadow_space_matrix, manager.camera().shadow_space_matrix());
        let expected = manager.camera().shadow_space_matrix().to_cols_array();
        assert_eq!(report.shadow_space_matrix, Some(expected));
    }

    #[test]
    fn degenerate_light_disables_receivers_for_the_frame() {
        let mut manager = manager();
        manager.activate().expect("activate");
        let (registry, mut receivers) = scene();
        manager.update(&DirectionalLight::default(), &registry, &mut receivers);
        let report = manager.update(&LightDirection(Vec3::ZERO), &registry, &mut receivers);
        match &report.status {
            FrameStatus::Failed { error, .. } => assert_eq!(error, "invalid_light_orientation"),
            other => panic!("unexpected status {other:?}"),
        }
        assert!(report.frustum.is_none());
        assert!(receivers
            .iter()
            .all(|(_, r)| !r.params.is_enabled() && r.params.effective_strength() == 0.0));
    }

    #[test]
    fn tuning_changes_are_sanitized_and_pushed() {
        let mut manager = manager();
        manager.activate().expect("activate");
        manager.tuning_mut().shadow_strength = 4.0;
        manager.tuning_mut().depth_bias = 0.03;
        let (registry, mut receivers) = scene();
        manager.update(&DirectionalLight::default(), &registry, &mut receivers);
        let (_, ground) = receivers.iter().next().expect("receiver");
        assert_eq!(ground.params.tuning.shadow_strength, 1.0);
        assert_eq!(ground.params.tuning.depth_bias, 0.03);
    }

    #[test]
    fn fit_and_bounds_changes_apply_on_the_next_update() {
        let mut manager = manager();
        manager.activate().expect("activate");
        let (registry, mut receivers) = scene();
        let light = DirectionalLight::default();
        manager.bounds_config_mut().ground_half_extent = 20.0;
        let before = manager.update(&light, &registry, &mut receivers);
        let half = before.frustum.as_ref().expect("frustum").ortho_half_size;
        assert!((half - 40.0 * 0.7).abs() < 1e-4, "half size {half}");

        manager.fit_config_mut().fit_factor = 1.0;
        manager.fit_config_mut().far_margin = f32::NAN;
        let after = manager.update(&light, &registry, &mut receivers);
        let frustum = after.frustum.expect("frustum");
        assert!((frustum.ortho_half_size - 40.0).abs() < 1e-4);
        assert_eq!(manager.fit_config().far_margin, FitConfig::default().far_margin);
        assert_eq!(manager.renderer().backend().passes_rendered, 2);
    }

    #[test]
    fn caster_mask_change_clears_the_map() {
        let mut manager = manager();
        manager.activate().expect("activate");
        let (registry, mut receivers) = scene();
        let light = DirectionalLight::default();
        manager.update(&light, &registry, &mut receivers);
        manager.set_caster_mask(LayerMask::layer(7));
        manager.update(&light, &registry, &mut receivers);
        let (_, ground) = receivers.iter().next().expect("receiver");
        let top = ground.params.shadow_space_matrix.project_point3(Vec3::new(0.0, 1.5, 0.0));
        let map = manager.shadow_map().expect("map");
        assert_eq!(map.sample(top.truncate()), Some(Moments::CLEAR));
    }
}
