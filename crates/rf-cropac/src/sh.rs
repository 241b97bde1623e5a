//! Real spherical harmonics at first order (ACN, N3D)
//!
//! Conventions: azimuth is counter-clockwise from the front (positive to
//! the left), elevation positive upwards, Cartesian `x` front, `y` left,
//! `z` up.

use std::f32::consts::PI;

use crate::format::{NUM_SH_SIGNALS, Normalization, SH_ORDER};

/// Lower edge of the basic → max-rE transition
pub const RE_TRANSITION_LOW_HZ: f32 = 500.0;

/// Upper edge of the basic → max-rE transition
pub const RE_TRANSITION_HIGH_HZ: f32 = 1000.0;

/// Unit vector for a direction given in degrees
pub fn unit_vector(azimuth_deg: f32, elevation_deg: f32) -> [f32; 3] {
    let az = azimuth_deg.to_radians();
    let el = elevation_deg.to_radians();
    [el.cos() * az.cos(), el.cos() * az.sin(), el.sin()]
}

/// Azimuth/elevation in degrees for a (not necessarily unit) vector
pub fn direction_degrees(v: [f32; 3]) -> (f32, f32) {
    let azimuth = v[1].atan2(v[0]).to_degrees();
    let horizontal = (v[0] * v[0] + v[1] * v[1]).sqrt();
    let elevation = v[2].atan2(horizontal).to_degrees();
    (azimuth, elevation)
}

/// Great-circle distance in radians between two unit vectors
pub fn angular_distance(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dot = a[0] * b[0] + a[1] * b[1] + a[2] * b[2];
    dot.clamp(-1.0, 1.0).acos()
}

/// First-order real SH basis (N3D) evaluated at a unit vector
pub fn real_sh_n3d(dir: [f32; 3]) -> [f32; NUM_SH_SIGNALS] {
    let g = 3.0_f32.sqrt();
    // ACN: W, Y, Z, X
    [1.0, g * dir[1], g * dir[2], g * dir[0]]
}

/// Plane-wave encoding gains for a direction, in the requested normalization
pub fn encode_direction(
    azimuth_deg: f32,
    elevation_deg: f32,
    normalization: Normalization,
) -> [f32; NUM_SH_SIGNALS] {
    let mut y = real_sh_n3d(unit_vector(azimuth_deg, elevation_deg));
    if !normalization.is_n3d() {
        let to_n3d = normalization.to_n3d_gains();
        for (c, g) in y.iter_mut().zip(to_n3d) {
            *c /= g;
        }
    }
    y
}

/// Quasi-uniform covering of the sphere (Fibonacci spiral)
pub fn covering_set(n: usize) -> Vec<[f32; 3]> {
    let golden_ratio = (1.0 + 5.0_f32.sqrt()) / 2.0;
    (0..n)
        .map(|i| {
            let theta = 2.0 * PI * i as f32 / golden_ratio;
            let phi = (1.0 - 2.0 * (i as f32 + 0.5) / n as f32).acos();
            [phi.sin() * theta.cos(), phi.sin() * theta.sin(), phi.cos()]
        })
        .collect()
}

/// max-rE weight for order-1 components of an order-`order` decoder
pub fn max_re_weight(order: usize) -> f32 {
    // P1(cos(137.9° / (N + 1.51)))
    (137.9_f32.to_radians() / (order as f32 + 1.51)).cos()
}

/// Per-order weights `[a0, a1]` for a band centred at `freq_hz`
///
/// Basic decoding (unit weights) below [`RE_TRANSITION_LOW_HZ`], energy
/// normalized max-rE above [`RE_TRANSITION_HIGH_HZ`], raised-cosine blend
/// in between.
pub fn order_weights(freq_hz: f32, max_re: bool) -> [f32; SH_ORDER + 1] {
    if !max_re {
        return [1.0; SH_ORDER + 1];
    }

    let a1 = max_re_weight(SH_ORDER);
    // Keep the diffuse-field energy sum_n (2n+1) a_n^2 equal to basic decoding
    let norm = (4.0 / (1.0 + 3.0 * a1 * a1)).sqrt();
    let re = [norm, norm * a1];

    let t = if freq_hz <= RE_TRANSITION_LOW_HZ {
        0.0
    } else if freq_hz >= RE_TRANSITION_HIGH_HZ {
        1.0
    } else {
        let x = (freq_hz - RE_TRANSITION_LOW_HZ) / (RE_TRANSITION_HIGH_HZ - RE_TRANSITION_LOW_HZ);
        0.5 - 0.5 * (PI * x).cos()
    };

    [1.0 + t * (re[0] - 1.0), 1.0 + t * (re[1] - 1.0)]
}

/// SH order of an ACN channel index
pub fn acn_order(acn: usize) -> usize {
    (acn as f32).sqrt().floor() as usize
}
