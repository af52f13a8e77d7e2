use glam::{EulerRot, Quat, Vec3};

/// Orientation of the host's directional light. Cameras and lights look down their local -Z.
pub trait LightTransform {
    fn rotation(&self) -> Quat;

    fn forward(&self) -> Vec3 {
        self.rotation() * Vec3::NEG_Z
    }

    fn up(&self) -> Vec3 {
        self.rotation() * Vec3::Y
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DirectionalLight {
    pub rotation: Quat,
}

impl DirectionalLight {
    pub fn new(rotation: Quat) -> Self {
        Self { rotation }
    }

    /// Pitch rotates about +X (positive pitches the beam downward), yaw about +Y, roll about the
    /// beam. Angles are in degrees.
    pub fn from_euler_degrees(pitch: f32, yaw: f32, roll: f32) -> Self {
        let rotation = Quat::from_euler(
            EulerRot::YXZ,
            yaw.to_radians(),
            -pitch.to_radians(),
            roll.to_radians(),
        );
        Self { rotation }
    }

    /// Light whose beam travels along `direction`. Returns `None` for a degenerate direction.
    pub fn looking_along(direction: Vec3) -> Option<Self> {
        crate::frustum::look_rotation(direction, Vec3::Y).map(Self::new)
    }
}

impl Default for DirectionalLight {
    fn default() -> Self {
        Self::from_euler_degrees(50.0, -30.0, 0.0)
    }
}

impl LightTransform for DirectionalLight {
    fn rotation(&self) -> Quat {
        self.rotation
    }
}

/// Light described only by a beam direction, as some hosts expose it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightDirection(pub Vec3);

impl LightTransform for LightDirection {
    fn rotation(&self) -> Quat {
        crate::frustum::look_rotation(self.0, Vec3::Y).unwrap_or(Quat::IDENTITY)
    }

    fn forward(&self) -> Vec3 {
        self.0
    }

    fn up(&self) -> Vec3 {
        Vec3::Y
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_pitch_points_the_beam_down() {
        let light = DirectionalLight::from_euler_degrees(50.0, 0.0, 0.0);
        let forward = light.forward();
        assert!(forward.y < -0.7, "forward {forward:?} should point downward");
        assert!((forward.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn looking_along_matches_requested_direction() {
        let dir = Vec3::new(0.3, -1.0, 0.2).normalize();
        let light = DirectionalLight::looking_along(dir).expect("valid direction");
        assert!(light.forward().distance(dir) < 1e-5);
        assert!(DirectionalLight::looking_along(Vec3::ZERO).is_none());
    }
}
