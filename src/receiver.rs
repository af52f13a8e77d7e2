use std::collections::BTreeMap;

use glam::{Mat4, Vec3};

use crate::occlusion::{shade_world_point, MomentSampler, ShadowTuning};
use crate::renderer::ShadowMapHandle;

/// Uniform block consumed by `vsm_receiver.wgsl`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct ReceiverUniform {
    pub shadow_space: [[f32; 4]; 4],
    /// strength, min variance, light bleeding reduction, depth bias
    pub params: [f32; 4],
    /// enabled, 1 / resolution, unused, unused
    pub flags: [f32; 4],
}

/// Shading inputs for one receiving surface, rewritten every frame by the manager.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReceiverParameterSet {
    pub shadow_map: Option<ShadowMapHandle>,
    pub shadow_space_matrix: Mat4,
    pub tuning: ShadowTuning,
}

impl Default for ReceiverParameterSet {
    fn default() -> Self {
        Self { shadow_map: None, shadow_space_matrix: Mat4::IDENTITY, tuning: ShadowTuning::default() }
    }
}

impl ReceiverParameterSet {
    pub fn is_enabled(&self) -> bool {
        self.shadow_map.is_some()
    }

    /// Strength actually applied: zero while no shadow map is bound.
    pub fn effective_strength(&self) -> f32 {
        if self.is_enabled() {
            self.tuning.shadow_strength
        } else {
            0.0
        }
    }

    pub fn uniform(&self) -> ReceiverUniform {
        let tuning = &self.tuning;
        let texel = self.shadow_map.map(|map| 1.0 / map.resolution.max(1) as f32).unwrap_or(0.0);
        ReceiverUniform {
            shadow_space: self.shadow_space_matrix.to_cols_array_2d(),
            params: [
                self.effective_strength(),
                tuning.min_variance,
                tuning.light_bleeding_reduction,
                tuning.depth_bias,
            ],
            flags: [if self.is_enabled() { 1.0 } else { 0.0 }, texel, 0.0, 0.0],
        }
    }

    /// CPU evaluation of the receiver shading stage. Fully lit without a shadow map.
    pub fn shade(&self, sampler: Option<&dyn MomentSampler>, world: Vec3) -> f32 {
        match (self.shadow_map, sampler) {
            (Some(_), Some(sampler)) => {
                shade_world_point(sampler, &self.shadow_space_matrix, world, &self.tuning)
            }
            _ => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReceiverId(u64);

#[derive(Debug, Clone)]
pub struct Receiver {
    pub label: String,
    pub params: ReceiverParameterSet,
}

/// Receivers that get their parameters pushed every frame.
#[derive(Debug, Default)]
pub struct ReceiverSet {
    entries: BTreeMap<ReceiverId, Receiver>,
    next_id: u64,
}

impl ReceiverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, label: impl Into<String>) -> ReceiverId {
        self.next_id += 1;
        let id = ReceiverId(self.next_id);
        let receiver = Receiver { label: label.into(), params: ReceiverParameterSet::default() };
        self.entries.insert(id, receiver);
        id
    }

    pub fn remove(&mut self, id: ReceiverId) -> Option<Receiver> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: ReceiverId) -> Option<&Receiver> {
        self.entries.get(&id)
    }

    pub fn params(&self, id: ReceiverId) -> Option<&ReceiverParameterSet> {
        self.entries.get(&id).map(|r| &r.params)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ReceiverId, &Receiver)> {
        self.entries.iter().map(|(id, r)| (*id, r))
    }

    /// Writes the same frame parameters into every receiver; returns how many were updated.
    pub fn push(&mut self, params: ReceiverParameterSet) -> usize {
        for receiver in self.entries.values_mut() {
            receiver.params = params;
        }
        self.entries.len()
    }

    /// Drops the shadow map reference from every receiver so they shade fully lit.
    pub fn disable_all(&mut self, tuning: ShadowTuning) -> usize {
        self.push(ReceiverParameterSet { shadow_map: None, shadow_space_matrix: Mat4::IDENTITY, tuning })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::occlusion::Moments;
    use glam::Vec2;

    struct Occluded;

    impl MomentSampler for Occluded {
        fn sample(&self, _uv: Vec2) -> Option<Moments> {
            Some(Moments::from_depth(0.1))
        }
    }

    #[test]
    fn uniform_layout_is_std140_friendly() {
        assert_eq!(std::mem::size_of::<ReceiverUniform>(), 96);
        assert_eq!(std::mem::size_of::<ReceiverUniform>() % 16, 0);
    }

    #[test]
    fn disabled_receiver_is_fully_lit() {
        let params = ReceiverParameterSet::default();
        assert!(!params.is_enabled());
        assert_eq!(params.shade(Some(&Occluded), Vec3::ZERO), 1.0);
        assert_eq!(params.uniform().params[0], 0.0);
        assert_eq!(params.uniform().flags[0], 0.0);
    }

    #[test]
    fn push_and_remove_receivers() {
        let mut set = ReceiverSet::new();
        let ground = set.add("ground");
        let cube = set.add("cube");
        let handle = ShadowMapHandle { id: 7, resolution: 512 };
        let params =
            ReceiverParameterSet { shadow_map: Some(handle), ..ReceiverParameterSet::default() };
        assert_eq!(set.push(params), 2);
        assert!(set.params(ground).expect("ground").is_enabled());
        assert!(set.remove(cube).is_some());
        assert!(set.params(cube).is_none());
        assert_eq!(set.disable_all(ShadowTuning::default()), 1);
        assert!(!set.params(ground).expect("ground").is_enabled());
        let uniform = params.uniform();
        assert!((uniform.flags[1] - 1.0 / 512.0).abs() < f32::EPSILON);
    }
}
