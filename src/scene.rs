use anyhow::{Context, Result};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::bounds::{Aabb, LayerMask, ShadowCaster, ShadowCasterRegistry};
use crate::light::{DirectionalLight, LightTransform};
use crate::occlusion::MomentSampler;
use crate::receiver::{ReceiverParameterSet, ReceiverSet};
use crate::shadow_space::project_to_shadow_space;

/// Primitive shapes with unit-scale half extents matching the usual engine primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Cube,
    Sphere,
    Cylinder,
    /// 10 x 10 horizontal quad.
    Plane,
}

impl ShapeKind {
    pub fn unit_half_extents(self) -> Vec3 {
        match self {
            ShapeKind::Cube | ShapeKind::Sphere => Vec3::splat(0.5),
            ShapeKind::Cylinder => Vec3::new(0.5, 1.0, 0.5),
            ShapeKind::Plane => Vec3::new(5.0, 0.0, 5.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneObject {
    pub name: String,
    pub shape: ShapeKind,
    pub position: [f32; 3],
    #[serde(default = "SceneObject::default_scale")]
    pub scale: [f32; 3],
    #[serde(default = "SceneObject::default_true")]
    pub casts_shadows: bool,
    #[serde(default = "SceneObject::default_true")]
    pub receives_shadows: bool,
    #[serde(default = "SceneObject::default_layers")]
    pub layers: LayerMask,
    #[serde(default = "SceneObject::default_true")]
    pub active: bool,
}

impl SceneObject {
    fn default_scale() -> [f32; 3] {
        [1.0, 1.0, 1.0]
    }

    const fn default_true() -> bool {
        true
    }

    const fn default_layers() -> LayerMask {
        LayerMask::DEFAULT
    }

    pub fn new(name: impl Into<String>, shape: ShapeKind, position: Vec3) -> Self {
        Self {
            name: name.into(),
            shape,
            position: position.to_array(),
            scale: Self::default_scale(),
            casts_shadows: true,
            receives_shadows: true,
            layers: LayerMask::DEFAULT,
            active: true,
        }
    }

    pub fn with_scale(mut self, scale: Vec3) -> Self {
        self.scale = scale.to_array();
        self
    }

    /// Axis-aligned world bounds of the scaled primitive.
    pub fn bounds(&self) -> Aabb {
        let half = self.shape.unit_half_extents() * Vec3::from_array(self.scale).abs();
        Aabb::from_center_extents(Vec3::from_array(self.position), half)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LightDescription {
    pub pitch: f32,
    pub yaw: f32,
    #[serde(default)]
    pub roll: f32,
}

impl Default for LightDescription {
    fn default() -> Self {
        Self { pitch: 50.0, yaw: -30.0, roll: 0.0 }
    }
}

/// World point whose shadow factor gets reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbePoint {
    pub name: String,
    pub position: [f32; 3],
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeSample {
    pub name: String,
    pub position: [f32; 3],
    /// `(u, v, depth)`; absent when the point does not project.
    pub shadow_coord: Option<[f32; 3]>,
    pub shadow_factor: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneDescription {
    #[serde(default)]
    pub light: LightDescription,
    #[serde(default)]
    pub objects: Vec<SceneObject>,
    #[serde(default)]
    pub probes: Vec<ProbePoint>,
}

impl SceneDescription {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes =
            fs::read(path).with_context(|| format!("Reading scene file {}", path.display()))?;
        serde_json::from_slice::<SceneDescription>(&bytes)
            .with_context(|| format!("Parsing scene file {}", path.display()))
    }

    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Creating scene directory {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json.as_bytes())
            .with_context(|| format!("Writing scene file {}", path.display()))?;
        Ok(())
    }

    /// Ground plane, two cubes, a sphere and a cylinder under an oblique light.
    pub fn demo() -> Self {
        let light = LightDescription::default();
        let objects = vec![
            SceneObject::new("ground", ShapeKind::Plane, Vec3::ZERO)
                .with_scale(Vec3::new(5.0, 1.0, 5.0)),
            SceneObject::new("cube1", ShapeKind::Cube, Vec3::new(0.0, 1.0, 0.0)),
            SceneObject::new("cube2", ShapeKind::Cube, Vec3::new(2.0, 1.5, 2.0))
                .with_scale(Vec3::new(1.0, 2.0, 1.0)),
            SceneObject::new("sphere", ShapeKind::Sphere, Vec3::new(-2.0, 1.0, 2.0)),
            SceneObject::new("cylinder", ShapeKind::Cylinder, Vec3::new(2.0, 1.0, -2.0)),
        ];
        // Ground point hit by the beam through cube1's center.
        let forward =
            DirectionalLight::from_euler_degrees(light.pitch, light.yaw, light.roll).forward();
        let cube_center = Vec3::new(0.0, 1.0, 0.0);
        let under_cube = cube_center + forward * (cube_center.y / -forward.y);
        let probes = vec![
            ProbePoint { name: "ground_under_cube1".to_string(), position: under_cube.to_array() },
            ProbePoint { name: "open_ground".to_string(), position: [-6.0, 0.0, -6.0] },
            ProbePoint { name: "cube2_top".to_string(), position: [2.0, 2.5, 2.0] },
        ];
        Self { light, objects, probes }
    }

    pub fn directional_light(&self) -> DirectionalLight {
        DirectionalLight::from_euler_degrees(self.light.pitch, self.light.yaw, self.light.roll)
    }

    pub fn build_registry(&self) -> ShadowCasterRegistry {
        self.build_registry_with(|_, _| ())
    }

    /// Registers every object, creating its backend mesh payload with `make_mesh`.
    pub fn build_registry_with<M>(
        &self,
        mut make_mesh: impl FnMut(&SceneObject, &Aabb) -> M,
    ) -> ShadowCasterRegistry<M> {
        let mut registry = ShadowCasterRegistry::new();
        for object in &self.objects {
            let bounds = object.bounds();
            let mut caster =
                ShadowCaster::new(bounds, make_mesh(object, &bounds)).with_layers(object.layers);
            caster.casts_shadows = object.casts_shadows;
            caster.receives_shadows = object.receives_shadows;
            caster.active = object.active;
            registry.register(caster);
        }
        registry
    }

    pub fn build_receivers(&self) -> ReceiverSet {
        let mut receivers = ReceiverSet::new();
        for object in self.objects.iter().filter(|o| o.receives_shadows) {
            receivers.add(object.name.clone());
        }
        receivers
    }

    pub fn shade_probes(
        &self,
        params: &ReceiverParameterSet,
        sampler: Option<&dyn MomentSampler>,
    ) -> Vec<ProbeSample> {
        self.probes
            .iter()
            .map(|probe| {
                let world = Vec3::from_array(probe.position);
                let shadow_coord = if params.is_enabled() {
                    project_to_shadow_space(&params.shadow_space_matrix, world).map(|c| c.to_array())
                } else {
                    None
                };
                ProbeSample {
                    name: probe.name.clone(),
                    position: probe.position,
                    shadow_coord,
                    shadow_factor: params.shade(sampler, world),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_bounds_cover_the_ground_plane() {
        let scene = SceneDescription::demo();
        let ground = scene.objects[0].bounds();
        assert_eq!(ground.min, Vec3::new(-25.0, 0.0, -25.0));
        assert_eq!(ground.max, Vec3::new(25.0, 0.0, 25.0));
        let cube2 = scene.objects[2].bounds();
        assert_eq!(cube2.min, Vec3::new(1.5, 0.5, 1.5));
        assert_eq!(cube2.max, Vec3::new(2.5, 2.5, 2.5));
    }

    #[test]
    fn demo_probe_sits_on_the_ground() {
        let scene = SceneDescription::demo();
        let probe = Vec3::from_array(scene.probes[0].position);
        assert!(probe.y.abs() < 1e-5);
        let beam = scene.directional_light().forward();
        let back_to_cube = (Vec3::new(0.0, 1.0, 0.0) - probe).normalize();
        assert!(back_to_cube.dot(-beam) > 0.9999);
    }

    #[test]
    fn save_and_load_preserve_objects() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("scene.json");
        let scene = SceneDescription::demo();
        scene.save_to_path(&path).expect("save scene");
        let loaded = SceneDescription::load_from_path(&path).expect("load scene");
        assert_eq!(loaded, scene);
    }

    #[test]
    fn registry_respects_object_flags() {
        let mut scene = SceneDescription::demo();
        scene.objects[0].casts_shadows = false;
        scene.objects[3].active = false;
        let registry = scene.build_registry();
        assert_eq!(registry.len(), 5);
        assert_eq!(registry.active().count(), 4);
        assert_eq!(registry.casters(LayerMask::ALL).count(), 3);
        assert_eq!(scene.build_receivers().len(), 5);
    }

    #[test]
    fn minimal_json_uses_defaults() {
        let json = r#"{ "objects": [ { "name": "box", "shape": "cube", "position": [0, 1, 0] } ] }"#;
        let scene: SceneDescription = serde_json::from_str(json).expect("parse");
        assert_eq!(scene.light, LightDescription::default());
        assert_eq!(scene.objects[0].scale, [1.0, 1.0, 1.0]);
        assert!(scene.objects[0].casts_shadows);
        assert!(scene.probes.is_empty());
    }
}
