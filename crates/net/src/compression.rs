//! Delta compression for character position and rotation.
//!
//! All functions are pure. Position deltas are a lossy transmission filter:
//! an axis whose change is below the threshold is sent as zero, so repeated
//! sub-threshold movement is never transmitted until an absolute keyframe
//! re-baselines the receiver.
//!
//! Wire forms (postcard):
//! - position: tag `0 = Absolute | 1 = Delta` followed by three `f32`
//! - rotation: tag `0 = Absolute | 1 = Delta | 2 = NoChange`, four `f32` unless `NoChange`

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

/// Tag byte written in front of every compressed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DeltaTag {
    /// Full value follows.
    Absolute = 0,
    /// Difference from the receiver's base follows.
    Delta = 1,
    /// Nothing follows; keep the base.
    NoChange = 2,
}

/// Compressed position as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PositionDelta {
    /// Absolute world position.
    Absolute(Vec3),
    /// Per-axis offset from the previous position.
    Delta(Vec3),
}

impl PositionDelta {
    /// Reconstruct a position against the receiver's base.
    pub fn apply(&self, base: Vec3) -> Vec3 {
        match *self {
            PositionDelta::Absolute(position) => position,
            PositionDelta::Delta(delta) => base + delta,
        }
    }

    /// Tag written for this value.
    pub fn tag(&self) -> DeltaTag {
        match self {
            PositionDelta::Absolute(_) => DeltaTag::Absolute,
            PositionDelta::Delta(_) => DeltaTag::Delta,
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        1 + 3 * 4
    }
}

/// Compressed rotation as sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RotationDelta {
    /// Absolute rotation.
    Absolute(Quat),
    /// Reserved tag; never produced, decoded like `Absolute`.
    Delta(Quat),
    /// Rotation unchanged, reuse the base.
    NoChange,
}

impl RotationDelta {
    /// Reconstruct a rotation against the receiver's base.
    pub fn apply(&self, base: Quat) -> Quat {
        match *self {
            RotationDelta::Absolute(rotation) | RotationDelta::Delta(rotation) => rotation,
            RotationDelta::NoChange => base,
        }
    }

    /// Tag written for this value.
    pub fn tag(&self) -> DeltaTag {
        match self {
            RotationDelta::Absolute(_) => DeltaTag::Absolute,
            RotationDelta::Delta(_) => DeltaTag::Delta,
            RotationDelta::NoChange => DeltaTag::NoChange,
        }
    }

    /// Encoded size in bytes.
    pub fn encoded_len(&self) -> usize {
        match self {
            RotationDelta::NoChange => 1,
            _ => 1 + 4 * 4,
        }
    }
}

/// Per-axis delta between `current` and `previous`, zeroing axes below `threshold`.
pub fn compress_position(current: Vec3, previous: Vec3, threshold: f32) -> Vec3 {
    let delta = current - previous;
    Vec3::new(
        zero_below(delta.x, threshold),
        zero_below(delta.y, threshold),
        zero_below(delta.z, threshold),
    )
}

fn zero_below(value: f32, threshold: f32) -> f32 {
    if value.abs() < threshold {
        0.0
    } else {
        value
    }
}

/// Angle between two rotations in degrees (`q` and `-q` are the same rotation).
pub fn rotation_angle_degrees(a: Quat, b: Quat) -> f32 {
    a.angle_between(b).to_degrees()
}

/// `NoChange` when the rotations differ by less than `threshold_degrees`,
/// otherwise the absolute current rotation.
pub fn compress_rotation(current: Quat, previous: Quat, threshold_degrees: f32) -> RotationDelta {
    if rotation_angle_degrees(current, previous) < threshold_degrees {
        RotationDelta::NoChange
    } else {
        RotationDelta::Absolute(current)
    }
}

/// Encode a position: delta against `previous` when known, absolute otherwise.
pub fn encode_position(current: Vec3, previous: Option<Vec3>, threshold: f32) -> PositionDelta {
    match previous {
        Some(previous) => PositionDelta::Delta(compress_position(current, previous, threshold)),
        None => PositionDelta::Absolute(current),
    }
}

/// Encode a rotation: no-change filtered against `previous` when known, absolute otherwise.
pub fn encode_rotation(
    current: Quat,
    previous: Option<Quat>,
    threshold_degrees: f32,
) -> RotationDelta {
    match previous {
        Some(previous) => compress_rotation(current, previous, threshold_degrees),
        None => RotationDelta::Absolute(current),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON: f32 = 1e-4;

    fn assert_vec_close(a: Vec3, b: Vec3) {
        assert!((a - b).abs().max_element() < EPSILON, "{a:?} != {b:?}");
    }

    #[test]
    fn small_movement_is_zeroed() {
        let delta = compress_position(Vec3::new(1.0, 0.0, 0.0), Vec3::new(1.005, 0.0, 0.0), 0.01);
        assert_eq!(delta, Vec3::ZERO);
    }

    #[test]
    fn large_movement_is_kept() {
        let delta = compress_position(Vec3::new(1.05, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0), 0.01);
        assert_vec_close(delta, Vec3::new(0.05, 0.0, 0.0));
    }

    #[test]
    fn axes_are_filtered_independently() {
        let delta = compress_position(Vec3::new(2.0, 0.004, -3.0), Vec3::ZERO, 0.01);
        assert_vec_close(delta, Vec3::new(2.0, 0.0, -3.0));
    }

    #[test]
    fn delta_position_roundtrip() {
        let previous = Vec3::new(10.0, 2.0, -4.0);
        let current = Vec3::new(10.5, 2.25, -3.0);
        let encoded = encode_position(current, Some(previous), 0.001);
        assert_eq!(encoded.tag(), DeltaTag::Delta);

        let bytes = postcard::to_allocvec(&encoded).unwrap();
        assert_eq!(bytes.len(), encoded.encoded_len());
        assert_eq!(bytes[0], DeltaTag::Delta as u8);

        let decoded: PositionDelta = postcard::from_bytes(&bytes).unwrap();
        assert_vec_close(decoded.apply(previous), current);
    }

    #[test]
    fn absolute_position_ignores_base() {
        let current = Vec3::new(-7.0, 1.5, 99.0);
        let encoded = encode_position(current, None, 0.01);
        let bytes = postcard::to_allocvec(&encoded).unwrap();
        assert_eq!(bytes[0], DeltaTag::Absolute as u8);

        let decoded: PositionDelta = postcard::from_bytes(&bytes).unwrap();
        assert_vec_close(decoded.apply(Vec3::new(1000.0, 0.0, 0.0)), current);
    }

    #[test]
    fn small_rotation_is_no_change() {
        let previous = Quat::from_rotation_y(0.5);
        let current = Quat::from_rotation_y(0.5 + 0.5_f32.to_radians());
        let encoded = compress_rotation(current, previous, 1.0);
        assert_eq!(encoded, RotationDelta::NoChange);

        let bytes = postcard::to_allocvec(&encoded).unwrap();
        assert_eq!(bytes, vec![DeltaTag::NoChange as u8]);

        let decoded: RotationDelta = postcard::from_bytes(&bytes).unwrap();
        let base = Quat::from_rotation_x(1.2);
        assert_eq!(decoded.apply(base), base);
    }

    #[test]
    fn large_rotation_is_absolute() {
        let previous = Quat::IDENTITY;
        let current = Quat::from_rotation_y(90_f32.to_radians());
        let encoded = compress_rotation(current, previous, 5.0);
        assert_eq!(encoded.tag(), DeltaTag::Absolute);

        let bytes = postcard::to_allocvec(&encoded).unwrap();
        assert_eq!(bytes.len(), encoded.encoded_len());
        let decoded: RotationDelta = postcard::from_bytes(&bytes).unwrap();
        assert!(decoded.apply(Quat::IDENTITY).abs_diff_eq(current, EPSILON));
    }

    #[test]
    fn reserved_rotation_delta_tag_decodes_as_absolute() {
        let rotation = Quat::from_rotation_z(0.3);
        assert_eq!(RotationDelta::Delta(rotation).apply(Quat::IDENTITY), rotation);
    }

    #[test]
    fn angle_treats_negated_quaternion_as_equal() {
        let q = Quat::from_rotation_y(1.0);
        assert!(rotation_angle_degrees(q, -q) < 0.1);
        let quarter = rotation_angle_degrees(Quat::IDENTITY, Quat::from_rotation_x(90_f32.to_radians()));
        assert!((quarter - 90.0).abs() < 0.1);
    }
}
