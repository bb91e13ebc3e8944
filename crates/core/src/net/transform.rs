use glam::{Quat, Vec3};
use rkyv::{Archive, Deserialize, Serialize};

/// Position, rotation and scale of a replicated entity.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Transform {
    pub const IDENTITY: Self = Self {
        position: Vec3::ZERO,
        rotation: Quat::IDENTITY,
        scale: Vec3::ONE,
    };

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Self::IDENTITY
        }
    }

    pub fn lerp(&self, other: &Self, t: f32) -> Self {
        // Take the short way round when the quaternions sit in opposite hemispheres.
        let target = if self.rotation.dot(other.rotation) < 0.0 {
            -other.rotation
        } else {
            other.rotation
        };

        Self {
            position: self.position.lerp(other.position, t),
            rotation: self.rotation.slerp(target, t).normalize(),
            scale: self.scale.lerp(other.scale, t),
        }
    }

    pub fn distance(&self, other: &Self) -> f32 {
        self.position.distance(other.position)
    }

    pub fn to_network(&self) -> NetworkTransform {
        NetworkTransform {
            position: self.position.into(),
            rotation: [
                self.rotation.x,
                self.rotation.y,
                self.rotation.z,
                self.rotation.w,
            ],
            scale: self.scale.into(),
        }
    }

    pub fn from_network(network: &NetworkTransform) -> Self {
        let [x, y, z, w] = network.rotation;
        let rotation = Quat::from_xyzw(x, y, z, w);
        Self {
            position: Vec3::from(network.position),
            rotation: if rotation.length_squared() > 0.0 {
                rotation.normalize()
            } else {
                Quat::IDENTITY
            },
            scale: Vec3::from(network.scale),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct NetworkTransform {
    pub position: [f32; 3],
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
}

impl Default for NetworkTransform {
    fn default() -> Self {
        Transform::IDENTITY.to_network()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lerp_midpoint() {
        let from = Transform::from_position(Vec3::ZERO);
        let to = Transform {
            position: Vec3::new(10.0, 20.0, 30.0),
            rotation: Quat::from_rotation_y(std::f32::consts::FRAC_PI_2),
            scale: Vec3::splat(3.0),
        };

        let mid = from.lerp(&to, 0.5);

        assert!((mid.position - Vec3::new(5.0, 10.0, 15.0)).length() < 0.001);
        assert!((mid.scale - Vec3::splat(2.0)).length() < 0.001);
        let expected = Quat::from_rotation_y(std::f32::consts::FRAC_PI_4);
        assert!(mid.rotation.dot(expected).abs() > 0.999);
    }

    #[test]
    fn lerp_takes_shortest_arc() {
        let from = Transform::IDENTITY;
        let to = Transform {
            rotation: -Quat::from_rotation_y(0.2),
            ..Transform::IDENTITY
        };

        let mid = from.lerp(&to, 0.5);
        let expected = Quat::from_rotation_y(0.1);
        assert!(mid.rotation.dot(expected).abs() > 0.999);
    }

    #[test]
    fn degenerate_network_rotation_falls_back_to_identity() {
        let network = NetworkTransform {
            position: [1.0, 2.0, 3.0],
            rotation: [0.0; 4],
            scale: [1.0; 3],
        };

        let transform = Transform::from_network(&network);
        assert_eq!(transform.rotation, Quat::IDENTITY);
        assert_eq!(transform.position, Vec3::new(1.0, 2.0, 3.0));
    }
}
