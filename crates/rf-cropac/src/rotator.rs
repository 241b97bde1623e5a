//! Sound-field rotation for first-order ambisonics
//!
//! The 3×3 rotation acts on the dipole channels (ACN 1..3 = Y, Z, X);
//! W is rotation invariant.

use nalgebra::{Matrix3, Matrix4, Vector4};
use num_complex::Complex32;
use serde::{Deserialize, Serialize};

use crate::format::NUM_SH_SIGNALS;
use crate::transform::TfFrame;

/// ACN channel of the Cartesian axes x, y, z
const AXIS_TO_ACN: [usize; 3] = [3, 1, 2];

/// Order in which the elementary rotations are composed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RotationOrder {
    /// `R = Rz(yaw) · Ry(pitch) · Rx(roll)`
    #[default]
    YawPitchRoll,
    /// `R = Rx(roll) · Ry(pitch) · Rz(yaw)`
    RollPitchYaw,
}

/// User-facing rotation settings (degrees)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RotationParams {
    pub enabled: bool,
    pub yaw_deg: f32,
    pub pitch_deg: f32,
    pub roll_deg: f32,
    pub flip_yaw: bool,
    pub flip_pitch: bool,
    pub flip_roll: bool,
    pub order: RotationOrder,
}

impl RotationParams {
    /// Enabled rotation with the given angles, yaw-pitch-roll order
    pub fn new(yaw_deg: f32, pitch_deg: f32, roll_deg: f32) -> Self {
        Self {
            enabled: true,
            yaw_deg,
            pitch_deg,
            roll_deg,
            ..Self::default()
        }
    }

    /// Angles after sign flips, in radians `(yaw, pitch, roll)`
    pub fn effective_angles(&self) -> (f32, f32, f32) {
        let sign = |flip: bool| if flip { -1.0 } else { 1.0 };
        (
            sign(self.flip_yaw) * self.yaw_deg.to_radians(),
            sign(self.flip_pitch) * self.pitch_deg.to_radians(),
            sign(self.flip_roll) * self.roll_deg.to_radians(),
        )
    }

    /// True when applying the rotation would not change the signal
    pub fn is_identity(&self) -> bool {
        !self.enabled || (self.yaw_deg == 0.0 && self.pitch_deg == 0.0 && self.roll_deg == 0.0)
    }

    /// Rotation undoing this one
    pub fn inverse(&self) -> Self {
        Self {
            yaw_deg: -self.yaw_deg,
            pitch_deg: -self.pitch_deg,
            roll_deg: -self.roll_deg,
            order: match self.order {
                RotationOrder::YawPitchRoll => RotationOrder::RollPitchYaw,
                RotationOrder::RollPitchYaw => RotationOrder::YawPitchRoll,
            },
            ..*self
        }
    }

    /// Cartesian rotation matrix (x front, y left, z up)
    pub fn rotation_matrix(&self) -> Matrix3<f32> {
        let (yaw, pitch, roll) = self.effective_angles();
        let (sy, cy) = yaw.sin_cos();
        let (sp, cp) = pitch.sin_cos();
        let (sr, cr) = roll.sin_cos();

        let rz = Matrix3::new(cy, -sy, 0.0, sy, cy, 0.0, 0.0, 0.0, 1.0);
        let ry = Matrix3::new(cp, 0.0, sp, 0.0, 1.0, 0.0, -sp, 0.0, cp);
        let rx = Matrix3::new(1.0, 0.0, 0.0, 0.0, cr, -sr, 0.0, sr, cr);

        match self.order {
            RotationOrder::YawPitchRoll => rz * ry * rx,
            RotationOrder::RollPitchYaw => rx * ry * rz,
        }
    }

    /// Real 4×4 SH-domain rotation (ACN)
    pub fn sh_matrix(&self) -> Matrix4<f32> {
        let r = self.rotation_matrix();
        let mut m = Matrix4::identity();
        for (i, &row) in AXIS_TO_ACN.iter().enumerate() {
            for (j, &col) in AXIS_TO_ACN.iter().enumerate() {
                m[(row, col)] = r[(i, j)];
            }
        }
        m
    }
}

/// Applies a cached SH rotation to TF frames or time-domain blocks
#[derive(Debug, Clone)]
pub struct Rotator {
    params: RotationParams,
    matrix: Matrix4<f32>,
    bypass: bool,
}

impl Default for Rotator {
    fn default() -> Self {
        Self::new()
    }
}

impl Rotator {
    pub fn new() -> Self {
        Self {
            params: RotationParams::default(),
            matrix: Matrix4::identity(),
            bypass: true,
        }
    }

    /// Recompute the matrix if the settings changed
    pub fn update(&mut self, params: &RotationParams) {
        if *params == self.params {
            return;
        }
        self.params = *params;
        self.bypass = params.is_identity();
        self.matrix = if self.bypass {
            Matrix4::identity()
        } else {
            params.sh_matrix()
        };
    }

    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    pub fn matrix(&self) -> &Matrix4<f32> {
        &self.matrix
    }

    /// Rotate the first four channels of every band and slot
    pub fn rotate_tf(&self, frame: &mut TfFrame) {
        if self.bypass {
            return;
        }
        let slots = frame.time_slots();
        for band in 0..frame.num_bands() {
            let data = frame.band_mut(band);
            for slot in 0..slots {
                let v = Vector4::from_fn(|ch, _| data[ch * slots + slot]);
                for ch in 0..NUM_SH_SIGNALS {
                    let mut acc = Complex32::new(0.0, 0.0);
                    for k in 0..NUM_SH_SIGNALS {
                        acc += v[k] * self.matrix[(ch, k)];
                    }
                    data[ch * slots + slot] = acc;
                }
            }
        }
    }

    /// Rotate a time-domain block (one slice per ACN channel)
    pub fn rotate_block(&self, channels: &mut [&mut [f32]]) {
        if self.bypass || channels.len() < NUM_SH_SIGNALS {
            return;
        }
        let len = channels.iter().map(|c| c.len()).min().unwrap_or(0);
        for s in 0..len {
            let v = Vector4::from_fn(|ch, _| channels[ch][s]);
            let out = self.matrix * v;
            for ch in 0..NUM_SH_SIGNALS {
                channels[ch][s] = out[ch];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sh::{real_sh_n3d, unit_vector};
    use approx::assert_relative_eq;

    fn rotate(params: &RotationParams, v: [f32; 4]) -> Vector4<f32> {
        params.sh_matrix() * Vector4::from(v)
    }

    #[test]
    fn test_yaw_moves_front_to_left() {
        let out = rotate(&RotationParams::new(90.0, 0.0, 0.0), real_sh_n3d(unit_vector(0.0, 0.0)));
        let left = Vector4::from(real_sh_n3d(unit_vector(90.0, 0.0)));
        assert_relative_eq!(out, left, epsilon = 1e-5);
    }

    #[test]
    fn test_w_is_invariant() {
        let m = RotationParams::new(30.0, -20.0, 70.0).sh_matrix();
        assert_relative_eq!(m[(0, 0)], 1.0);
        for k in 1..4 {
            assert_eq!(m[(0, k)], 0.0);
            assert_eq!(m[(k, 0)], 0.0);
        }
    }

    #[test]
    fn test_round_trips() {
        let input = [0.7, -0.2, 0.4, 1.1];
        for (y, p, r) in [(0.0, 0.0, 0.0), (90.0, 0.0, 0.0), (0.0, 45.0, 0.0), (30.0, 30.0, 30.0)] {
            let fwd = RotationParams::new(y, p, r);
            let there = rotate(&fwd, input);
            let back = fwd.inverse().sh_matrix() * there;
            assert_relative_eq!(back, Vector4::from(input), epsilon = 1e-5);
        }
    }

    #[test]
    fn test_sign_flip_matches_negated_angle() {
        let flipped = RotationParams {
            flip_yaw: true,
            ..RotationParams::new(40.0, 0.0, 0.0)
        };
        let negated = RotationParams::new(-40.0, 0.0, 0.0);
        assert_relative_eq!(flipped.sh_matrix(), negated.sh_matrix(), epsilon = 1e-6);
    }

    #[test]
    fn test_orders_differ_for_compound_rotation() {
        let ypr = RotationParams::new(30.0, 30.0, 30.0);
        let rpy = RotationParams {
            order: RotationOrder::RollPitchYaw,
            ..ypr
        };
        assert!((ypr.sh_matrix() - rpy.sh_matrix()).norm() > 1e-2);
    }

    #[test]
    fn test_disabled_rotation_bypasses() {
        let mut rotator = Rotator::new();
        rotator.update(&RotationParams {
            enabled: false,
            ..RotationParams::new(90.0, 0.0, 0.0)
        });
        assert!(rotator.is_bypassed());

        rotator.update(&RotationParams::new(90.0, 0.0, 0.0));
        assert!(!rotator.is_bypassed());
    }

    #[test]
    fn test_rotate_tf_matches_block() {
        let mut rotator = Rotator::new();
        rotator.update(&RotationParams::new(30.0, 10.0, -20.0));

        let sh = real_sh_n3d(unit_vector(15.0, 5.0));
        let mut frame = TfFrame::new(3, 4, 2);
        for band in 0..3 {
            for ch in 0..4 {
                for slot in 0..2 {
                    frame.set(band, ch, slot, Complex32::new(sh[ch], -sh[ch]));
                }
            }
        }
        rotator.rotate_tf(&mut frame);

        let mut block: Vec<Vec<f32>> = sh.iter().map(|&v| vec![v; 4]).collect();
        let mut views: Vec<&mut [f32]> = block.iter_mut().map(|c| c.as_mut_slice()).collect();
        rotator.rotate_block(&mut views);

        for ch in 0..4 {
            let expected = block[ch][0];
            let got = frame.get(2, ch, 1);
            assert!((got.re - expected).abs() < 1e-5);
            assert!((got.im + expected).abs() < 1e-5);
        }
    }
}
