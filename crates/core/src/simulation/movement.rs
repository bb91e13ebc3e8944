use glam::Vec3;

use crate::net::Transform;

/// Input payload carried by a prediction.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MovementInput {
    pub direction: Vec3,
}

impl MovementInput {
    pub fn new(direction: Vec3) -> Self {
        Self { direction }
    }

    pub fn to_network(&self) -> [f32; 3] {
        self.direction.into()
    }

    /// Non-finite components are treated as no movement.
    pub fn from_network(direction: [f32; 3]) -> Self {
        let direction = Vec3::from(direction);
        if direction.is_finite() {
            Self { direction }
        } else {
            Self::default()
        }
    }
}

/// Deterministic movement step shared by the authoritative side and the
/// predicting client, so replaying the same inputs gives the same result.
pub trait MovementModel {
    fn apply(&self, transform: &mut Transform, input: &MovementInput, dt: f32);
}

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LinearMovement {
    pub speed: f32,
}

impl Default for LinearMovement {
    fn default() -> Self {
        Self { speed: 5.0 }
    }
}

impl MovementModel for LinearMovement {
    fn apply(&self, transform: &mut Transform, input: &MovementInput, dt: f32) {
        let direction = input.direction;
        if direction.length_squared() > 0.001 {
            transform.position += direction.normalize() * self.speed * dt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moves_along_normalized_direction() {
        let model = LinearMovement { speed: 10.0 };
        let mut transform = Transform::IDENTITY;

        model.apply(
            &mut transform,
            &MovementInput::new(Vec3::new(3.0, 0.0, 0.0)),
            0.5,
        );

        assert!((transform.position - Vec3::new(5.0, 0.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn tiny_input_is_ignored() {
        let model = LinearMovement::default();
        let mut transform = Transform::IDENTITY;

        model.apply(
            &mut transform,
            &MovementInput::new(Vec3::splat(0.01)),
            1.0,
        );

        assert_eq!(transform, Transform::IDENTITY);
    }

    #[test]
    fn non_finite_network_input_is_zeroed() {
        let input = MovementInput::from_network([f32::NAN, 1.0, 0.0]);
        assert_eq!(input.direction, Vec3::ZERO);
    }
}
