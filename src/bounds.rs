use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// World-space axis-aligned box stored as min/max corners.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min: min.min(max), max: min.max(max) }
    }

    pub fn from_center_extents(center: Vec3, extents: Vec3) -> Self {
        let extents = extents.abs();
        Self { min: center - extents, max: center + extents }
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn extents(&self) -> Vec3 {
        (self.max - self.min) * 0.5
    }

    pub fn encapsulate_point(&mut self, point: Vec3) {
        self.min = self.min.min(point);
        self.max = self.max.max(point);
    }

    pub fn encapsulate(&mut self, other: &Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn contains_aabb(&self, other: &Aabb) -> bool {
        self.min.cmple(other.min).all() && self.max.cmpge(other.max).all()
    }

    pub fn contains_point(&self, point: Vec3) -> bool {
        self.min.cmple(point).all() && self.max.cmpge(point).all()
    }

    pub fn corners(&self) -> [Vec3; 8] {
        let (lo, hi) = (self.min, self.max);
        [
            Vec3::new(lo.x, lo.y, lo.z),
            Vec3::new(hi.x, lo.y, lo.z),
            Vec3::new(lo.x, hi.y, lo.z),
            Vec3::new(hi.x, hi.y, lo.z),
            Vec3::new(lo.x, lo.y, hi.z),
            Vec3::new(hi.x, lo.y, hi.z),
            Vec3::new(lo.x, hi.y, hi.z),
            Vec3::new(hi.x, hi.y, hi.z),
        ]
    }

    fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }
}

/// Bounding volume the light frustum is fitted to. Extents are half sizes and never negative.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneBounds {
    pub center: Vec3,
    pub extents: Vec3,
}

impl SceneBounds {
    /// Unit box at the origin, used when nothing active is registered.
    pub const FALLBACK: SceneBounds = SceneBounds { center: Vec3::ZERO, extents: Vec3::splat(0.5) };

    pub fn size(&self) -> Vec3 {
        self.extents * 2.0
    }

    pub fn min(&self) -> Vec3 {
        self.center - self.extents
    }

    pub fn max(&self) -> Vec3 {
        self.center + self.extents
    }

    pub fn as_aabb(&self) -> Aabb {
        Aabb::from_center_extents(self.center, self.extents)
    }

    pub fn contains(&self, aabb: &Aabb) -> bool {
        self.as_aabb().contains_aabb(aabb)
    }
}

impl From<Aabb> for SceneBounds {
    fn from(aabb: Aabb) -> Self {
        Self { center: aabb.center(), extents: aabb.extents().max(Vec3::ZERO) }
    }
}

/// 32-slot layer filter, equivalent to a culling mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerMask(pub u32);

impl LayerMask {
    pub const ALL: LayerMask = LayerMask(u32::MAX);
    pub const NONE: LayerMask = LayerMask(0);
    pub const DEFAULT: LayerMask = LayerMask(1);

    pub fn layer(index: u32) -> Self {
        LayerMask(1u32.checked_shl(index).unwrap_or(0))
    }

    pub fn intersects(self, other: LayerMask) -> bool {
        self.0 & other.0 != 0
    }
}

impl Default for LayerMask {
    fn default() -> Self {
        LayerMask::ALL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShadowCasterId(u64);

impl ShadowCasterId {
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Registration data for one shadow-relevant object.
#[derive(Debug, Clone)]
pub struct ShadowCaster<M = ()> {
    pub bounds: Aabb,
    pub layers: LayerMask,
    pub casts_shadows: bool,
    pub receives_shadows: bool,
    pub active: bool,
    pub mesh: M,
}

impl<M> ShadowCaster<M> {
    pub fn new(bounds: Aabb, mesh: M) -> Self {
        Self {
            bounds,
            layers: LayerMask::DEFAULT,
            casts_shadows: true,
            receives_shadows: true,
            active: true,
            mesh,
        }
    }

    pub fn with_layers(mut self, layers: LayerMask) -> Self {
        self.layers = layers;
        self
    }

    pub fn receiver_only(mut self) -> Self {
        self.casts_shadows = false;
        self
    }
}

/// Explicit registry of shadow casters and receivers, maintained incrementally by the host.
#[derive(Debug)]
pub struct ShadowCasterRegistry<M = ()> {
    entries: BTreeMap<ShadowCasterId, ShadowCaster<M>>,
    next_id: u64,
}

impl<M> Default for ShadowCasterRegistry<M> {
    fn default() -> Self {
        Self { entries: BTreeMap::new(), next_id: 1 }
    }
}

impl<M> ShadowCasterRegistry<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, caster: ShadowCaster<M>) -> ShadowCasterId {
        let id = ShadowCasterId(self.next_id);
        self.next_id += 1;
        self.entries.insert(id, caster);
        id
    }

    pub fn unregister(&mut self, id: ShadowCasterId) -> Option<ShadowCaster<M>> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: ShadowCasterId) -> Option<&ShadowCaster<M>> {
        self.entries.get(&id)
    }

    pub fn get_mut(&mut self, id: ShadowCasterId) -> Option<&mut ShadowCaster<M>> {
        self.entries.get_mut(&id)
    }

    /// Returns false when the id is unknown.
    pub fn set_bounds(&mut self, id: ShadowCasterId, bounds: Aabb) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.bounds = bounds;
                true
            }
            None => false,
        }
    }

    pub fn set_active(&mut self, id: ShadowCasterId, active: bool) -> bool {
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.active = active;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShadowCasterId, &ShadowCaster<M>)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    pub fn active(&self) -> impl Iterator<Item = &ShadowCaster<M>> {
        self.entries.values().filter(|entry| entry.active && entry.bounds.is_finite())
    }

    /// Active entries that cast shadows on one of the given layers.
    pub fn casters(&self, mask: LayerMask) -> impl Iterator<Item = &ShadowCaster<M>> {
        self.active().filter(move |entry| entry.casts_shadows && entry.layers.intersects(mask))
    }
}

/// Minimum horizontal area the bounds always cover, so sparse scenes keep a usable frustum.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundsConfig {
    #[serde(default = "BoundsConfig::default_ground_half_extent")]
    pub ground_half_extent: f32,
    #[serde(default)]
    pub ground_height: f32,
}

impl BoundsConfig {
    const fn default_ground_half_extent() -> f32 {
        10.0
    }

    /// Non-finite values fall back to the defaults.
    pub fn sanitized(self) -> Self {
        if self.ground_half_extent.is_finite() && self.ground_height.is_finite() {
            self
        } else {
            Self::default()
        }
    }

    pub fn ground_corners(&self) -> [Vec3; 2] {
        let h = self.ground_half_extent.abs();
        [Vec3::new(-h, self.ground_height, -h), Vec3::new(h, self.ground_height, h)]
    }
}

impl Default for BoundsConfig {
    fn default() -> Self {
        Self { ground_half_extent: Self::default_ground_half_extent(), ground_height: 0.0 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SceneBoundsEstimator {
    pub config: BoundsConfig,
}

impl SceneBoundsEstimator {
    pub fn new(config: BoundsConfig) -> Self {
        Self { config }
    }

    pub fn estimate<M>(&self, registry: &ShadowCasterRegistry<M>) -> SceneBounds {
        self.estimate_from(registry.active().map(|entry| entry.bounds))
    }

    pub fn estimate_from(&self, boxes: impl IntoIterator<Item = Aabb>) -> SceneBounds {
        let mut union: Option<Aabb> = None;
        for aabb in boxes {
            match union.as_mut() {
                Some(acc) => acc.encapsulate(&aabb),
                None => union = Some(aabb),
            }
        }
        let mut aabb = union.unwrap_or_else(|| SceneBounds::FALLBACK.as_aabb());
        for corner in self.config.ground_corners() {
            aabb.encapsulate_point(corner);
        }
        SceneBounds::from(aabb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_at(center: Vec3) -> Aabb {
        Aabb::from_center_extents(center, Vec3::splat(0.5))
    }

    #[test]
    fn empty_registry_falls_back_to_unit_box_plus_ground() {
        let registry: ShadowCasterRegistry = ShadowCasterRegistry::new();
        let bounds = SceneBoundsEstimator::default().estimate(&registry);
        assert_eq!(bounds.center, Vec3::ZERO);
        assert_eq!(bounds.extents, Vec3::new(10.0, 0.5, 10.0));
    }

    #[test]
    fn bounds_enclose_every_active_entry_and_ground() {
        let mut registry = ShadowCasterRegistry::new();
        let far = unit_at(Vec3::new(30.0, 4.0, -2.0));
        let low = unit_at(Vec3::new(-1.0, -3.0, 1.0));
        registry.register(ShadowCaster::new(far, ()));
        registry.register(ShadowCaster::new(low, ()));
        let estimator = SceneBoundsEstimator::default();
        let bounds = estimator.estimate(&registry);
        assert!(bounds.contains(&far));
        assert!(bounds.contains(&low));
        for corner in estimator.config.ground_corners() {
            assert!(bounds.as_aabb().contains_point(corner));
        }
        assert!(bounds.extents.cmpge(Vec3::ZERO).all());
    }

    #[test]
    fn inactive_and_unregistered_entries_are_ignored() {
        let mut registry = ShadowCasterRegistry::new();
        let hidden = registry.register(ShadowCaster::new(unit_at(Vec3::splat(100.0)), ()));
        let removed = registry.register(ShadowCaster::new(unit_at(Vec3::splat(-100.0)), ()));
        registry.set_active(hidden, false);
        assert!(registry.unregister(removed).is_some());
        let bounds = SceneBoundsEstimator::default().estimate(&registry);
        assert!(bounds.max().x < 50.0);
        assert!(bounds.min().x > -50.0);
    }

    #[test]
    fn caster_filter_respects_layers_and_flags() {
        let mut registry = ShadowCasterRegistry::new();
        registry.register(ShadowCaster::new(unit_at(Vec3::ZERO), ()).with_layers(LayerMask::layer(3)));
        registry.register(ShadowCaster::new(unit_at(Vec3::X), ()).receiver_only());
        registry.register(ShadowCaster::new(unit_at(Vec3::Y), ()));
        assert_eq!(registry.casters(LayerMask::ALL).count(), 2);
        assert_eq!(registry.casters(LayerMask::layer(3)).count(), 1);
        assert_eq!(registry.casters(LayerMask::NONE).count(), 0);
        assert_eq!(registry.active().count(), 3);
    }

    #[test]
    fn layer_index_out_of_range_is_empty() {
        assert_eq!(LayerMask::layer(40), LayerMask::NONE);
        assert!(LayerMask::layer(0).intersects(LayerMask::DEFAULT));
    }
}
