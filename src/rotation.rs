//! Sensor and board mounting rotations
//!
//! A backend may be mounted rotated relative to the board, and the board
//! rotated relative to the vehicle. Samples are rotated into the body frame
//! before anything else touches them.
//!
//! # Example
//! ```
//! use nalgebra::Vector3;
//! use fusion_ins::Rotation;
//!
//! // Sensor X axis points along body Y
//! let body = Rotation::Yaw90.rotate(Vector3::new(1.0, 0.0, 0.0));
//! assert!((body - Vector3::new(0.0, 1.0, 0.0)).norm() < 1e-6);
//! ```

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

const HALF_SQRT_2: f32 = core::f32::consts::FRAC_1_SQRT_2;

/// Mounting rotation of a sensor relative to the body frame
///
/// Yaw rotations are about +Z, roll about +X and pitch about +Y. Compound
/// variants apply the roll first, then the yaw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rotation {
    /// No rotation
    #[default]
    None,
    Yaw45,
    Yaw90,
    Yaw135,
    Yaw180,
    Yaw225,
    Yaw270,
    Yaw315,
    Roll180,
    Roll180Yaw90,
    Roll180Yaw270,
    Pitch180,
    Roll90,
    Roll270,
    Pitch90,
    Pitch270,
}

impl Rotation {
    /// Rotate a sensor-frame vector into the body frame
    #[inline]
    pub fn rotate(self, v: Vector3<f32>) -> Vector3<f32> {
        let (x, y, z) = (v.x, v.y, v.z);
        match self {
            Rotation::None => v,
            Rotation::Yaw45 => Vector3::new(HALF_SQRT_2 * (x - y), HALF_SQRT_2 * (x + y), z),
            Rotation::Yaw90 => Vector3::new(-y, x, z),
            Rotation::Yaw135 => Vector3::new(-HALF_SQRT_2 * (x + y), HALF_SQRT_2 * (x - y), z),
            Rotation::Yaw180 => Vector3::new(-x, -y, z),
            Rotation::Yaw225 => Vector3::new(HALF_SQRT_2 * (y - x), -HALF_SQRT_2 * (x + y), z),
            Rotation::Yaw270 => Vector3::new(y, -x, z),
            Rotation::Yaw315 => Vector3::new(HALF_SQRT_2 * (x + y), HALF_SQRT_2 * (y - x), z),
            Rotation::Roll180 => Vector3::new(x, -y, -z),
            Rotation::Roll180Yaw90 => Vector3::new(y, x, -z),
            Rotation::Roll180Yaw270 => Vector3::new(-y, -x, -z),
            Rotation::Pitch180 => Vector3::new(-x, y, -z),
            Rotation::Roll90 => Vector3::new(x, -z, y),
            Rotation::Roll270 => Vector3::new(x, z, -y),
            Rotation::Pitch90 => Vector3::new(z, y, -x),
            Rotation::Pitch270 => Vector3::new(-z, y, x),
        }
    }

    /// Value of this rotation in `AHRS_ORIENTATION`
    ///
    /// Follows the flight-stack rotation numbering, which has gaps for the
    /// compound rotations not modelled here.
    pub fn to_param(self) -> i32 {
        match self {
            Rotation::None => 0,
            Rotation::Yaw45 => 1,
            Rotation::Yaw90 => 2,
            Rotation::Yaw135 => 3,
            Rotation::Yaw180 => 4,
            Rotation::Yaw225 => 5,
            Rotation::Yaw270 => 6,
            Rotation::Yaw315 => 7,
            Rotation::Roll180 => 8,
            Rotation::Roll180Yaw90 => 10,
            Rotation::Pitch180 => 12,
            Rotation::Roll180Yaw270 => 14,
            Rotation::Roll90 => 16,
            Rotation::Roll270 => 20,
            Rotation::Pitch90 => 24,
            Rotation::Pitch270 => 25,
        }
    }

    /// Rotation for an `AHRS_ORIENTATION` value, `None` when unsupported
    pub fn from_param(value: i32) -> Option<Self> {
        ALL.into_iter().find(|rotation| rotation.to_param() == value)
    }
}

const ALL: [Rotation; 16] = [
    Rotation::None,
    Rotation::Yaw45,
    Rotation::Yaw90,
    Rotation::Yaw135,
    Rotation::Yaw180,
    Rotation::Yaw225,
    Rotation::Yaw270,
    Rotation::Yaw315,
    Rotation::Roll180,
    Rotation::Roll180Yaw90,
    Rotation::Roll180Yaw270,
    Rotation::Pitch180,
    Rotation::Roll90,
    Rotation::Roll270,
    Rotation::Pitch90,
    Rotation::Pitch270,
];

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::{Rotation3, Vector3};

    #[test]
    fn test_rotations_preserve_length() {
        let v = Vector3::new(1.0, -2.0, 3.0);
        for rotation in ALL {
            let rotated = rotation.rotate(v);
            assert!(
                (rotated.norm() - v.norm()).abs() < 1e-5,
                "{:?} changed the vector length",
                rotation
            );
        }
    }

    #[test]
    fn test_yaw_matches_axis_angle() {
        let v = Vector3::new(0.3, -1.2, 0.7);
        let cases = [
            (Rotation::Yaw45, 45.0f32),
            (Rotation::Yaw90, 90.0),
            (Rotation::Yaw135, 135.0),
            (Rotation::Yaw180, 180.0),
            (Rotation::Yaw225, 225.0),
            (Rotation::Yaw270, 270.0),
            (Rotation::Yaw315, 315.0),
        ];
        for (rotation, degrees) in cases {
            let expected = Rotation3::from_axis_angle(&Vector3::z_axis(), degrees.to_radians()) * v;
            assert!(
                (rotation.rotate(v) - expected).norm() < 1e-5,
                "{:?} disagrees with a {} degree yaw",
                rotation,
                degrees
            );
        }
    }

    #[test]
    fn test_roll_and_pitch_match_axis_angle() {
        let v = Vector3::new(0.3, -1.2, 0.7);
        let roll = |deg: f32| Rotation3::from_axis_angle(&Vector3::x_axis(), deg.to_radians()) * v;
        let pitch = |deg: f32| Rotation3::from_axis_angle(&Vector3::y_axis(), deg.to_radians()) * v;

        assert!((Rotation::Roll90.rotate(v) - roll(90.0)).norm() < 1e-5);
        assert!((Rotation::Roll180.rotate(v) - roll(180.0)).norm() < 1e-5);
        assert!((Rotation::Roll270.rotate(v) - roll(270.0)).norm() < 1e-5);
        assert!((Rotation::Pitch90.rotate(v) - pitch(90.0)).norm() < 1e-5);
        assert!((Rotation::Pitch180.rotate(v) - pitch(180.0)).norm() < 1e-5);
        assert!((Rotation::Pitch270.rotate(v) - pitch(270.0)).norm() < 1e-5);
    }

    #[test]
    fn test_param_encoding() {
        for rotation in ALL {
            assert_eq!(Rotation::from_param(rotation.to_param()), Some(rotation));
        }
        assert_eq!(Rotation::from_param(2), Some(Rotation::Yaw90));
        assert_eq!(Rotation::from_param(10), Some(Rotation::Roll180Yaw90));
        assert_eq!(Rotation::from_param(14), Some(Rotation::Roll180Yaw270));
        assert_eq!(Rotation::from_param(25), Some(Rotation::Pitch270));
        // Roll 180 yaw 45 is not modelled
        assert_eq!(Rotation::from_param(9), None);
        assert_eq!(Rotation::from_param(-1), None);
        assert_eq!(Rotation::from_param(99), None);
    }
}
