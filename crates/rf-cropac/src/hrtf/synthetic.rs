//! Bundled default HRIR set (simple spherical-head model)

use super::{HrirPair, HrirSet};
use crate::sh::unit_vector;

/// Head radius in meters
const HEAD_RADIUS: f32 = 0.0875;

/// Speed of sound in m/s
const SPEED_OF_SOUND: f32 = 343.0;

/// Impulse response length
const FILTER_LENGTH: usize = 128;

/// Onset of the direct sound (samples) for a frontal source
const ONSET_SAMPLES: f32 = 24.0;

/// Grid resolution in degrees
const GRID_STEP_DEG: usize = 10;

/// Generate the default set on a 10° grid (-40° to 90° elevation)
pub(super) fn spherical_head_set(sample_rate: u32) -> HrirSet {
    let mut directions_deg = Vec::new();
    let mut hrirs = Vec::new();

    for el in (-40..90).step_by(GRID_STEP_DEG) {
        for az in (-180..180).step_by(GRID_STEP_DEG) {
            directions_deg.push([az as f32, el as f32]);
            hrirs.push(spherical_head_hrir(az as f32, el as f32, sample_rate));
        }
    }
    directions_deg.push([0.0, 90.0]);
    hrirs.push(spherical_head_hrir(0.0, 90.0, sample_rate));

    HrirSet {
        name: "spherical-head".into(),
        sample_rate,
        directions_deg,
        hrirs,
    }
}

/// Single synthetic HRIR pair
fn spherical_head_hrir(azimuth: f32, elevation: f32, sample_rate: u32) -> HrirPair {
    let dir = unit_vector(azimuth, elevation);
    let fs = sample_rate as f32;

    // Positive towards the left ear
    let lateral = dir[1].clamp(-1.0, 1.0);
    let lateral_angle = lateral.asin();

    // Woodworth ITD, left ear leads for positive lateral angles
    let itd_samples = (HEAD_RADIUS / SPEED_OF_SOUND) * (lateral_angle + lateral_angle.sin()) * fs;
    let left_delay = ONSET_SAMPLES - 0.5 * itd_samples;
    let right_delay = ONSET_SAMPLES + 0.5 * itd_samples;

    // Broadband ILD plus a mild rear attenuation
    let rear = (-dir[0]).max(0.0);
    let left_gain = (1.0 + 0.5 * lateral) * (1.0 - 0.15 * rear);
    let right_gain = (1.0 - 0.5 * lateral) * (1.0 - 0.15 * rear);

    // Pinna reflection, later for lower sources
    let pinna_delay = 6.0 + 4.0 * (1.0 - dir[2]);
    let pinna_gain = 0.25 * (1.0 - elevation.abs() / 90.0);

    let mut left = pulse(left_delay, left_gain, FILTER_LENGTH);
    let mut right = pulse(right_delay, right_gain, FILTER_LENGTH);
    add_pulse(&mut left, left_delay + pinna_delay, left_gain * pinna_gain);
    add_pulse(&mut right, right_delay + pinna_delay, right_gain * pinna_gain);

    // Head shadow: lowpass the far ear
    let shadow = lateral.abs();
    let coeff = 1.0 - 0.6 * shadow;
    if lateral > 0.0 {
        one_pole_lowpass(&mut right, coeff);
    } else if lateral < 0.0 {
        one_pole_lowpass(&mut left, coeff);
    }

    HrirPair::new(left, right)
}

/// Gaussian-windowed impulse (fractional delay)
fn pulse(delay: f32, gain: f32, length: usize) -> Vec<f32> {
    let mut ir = vec![0.0f32; length];
    add_pulse(&mut ir, delay, gain);
    ir
}

fn add_pulse(ir: &mut [f32], delay: f32, gain: f32) {
    let sigma = 0.8f32;
    for (i, s) in ir.iter_mut().enumerate() {
        let d = i as f32 - delay;
        *s += gain * (-d * d / (2.0 * sigma * sigma)).exp();
    }
}

fn one_pole_lowpass(ir: &mut [f32], coeff: f32) {
    let mut state = 0.0f32;
    for s in ir.iter_mut() {
        state += coeff * (*s - state);
        *s = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn energy(x: &[f32]) -> f32 {
        x.iter().map(|s| s * s).sum()
    }

    #[test]
    fn test_front_is_symmetric() {
        let hrir = spherical_head_hrir(0.0, 0.0, 48000);
        for (l, r) in hrir.left.iter().zip(&hrir.right) {
            assert!((l - r).abs() < 1e-6);
        }
    }

    #[test]
    fn test_left_source_louder_left() {
        let hrir = spherical_head_hrir(90.0, 0.0, 48000);
        assert!(energy(&hrir.left) > 2.0 * energy(&hrir.right));

        let mirrored = spherical_head_hrir(-90.0, 0.0, 48000);
        assert!((energy(&hrir.left) - energy(&mirrored.right)).abs() < 1e-3);
    }

    #[test]
    fn test_grid() {
        let set = spherical_head_set(48000);
        assert_eq!(set.len(), 36 * 13 + 1);
        assert!(set.hrirs.iter().all(|h| h.length() == FILTER_LENGTH));
    }
}
