//! HRIR → per-band filterbank coefficients, ITDs and directional lookup

use std::f64::consts::PI;

use nalgebra::{Matrix3, Vector3};
use num_complex::Complex32;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::HrirSet;
use crate::error::{CropacError, CropacResult};
use crate::format::NUM_EARS;
use crate::sh::{angular_distance, unit_vector};

/// Maximum |ITD| searched for, in seconds
const MAX_ITD_S: f32 = 0.001;

/// Tolerance for slightly negative barycentric gains
const TRIANGLE_TOLERANCE: f32 = 1e-3;

/// How an HRTF is obtained for a direction that was not measured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HrtfInterpolation {
    /// Nearest measured direction
    #[default]
    Nearest,
    /// Three nearest directions, barycentric magnitude + ITD phase
    Triangular,
}

/// Complex HRTF gains per (band, direction, ear)
#[derive(Debug, Clone)]
pub struct HrtfFilterbank {
    /// Band centre frequencies in Hz
    freqs: Vec<f32>,
    /// Measurement directions as unit vectors
    dirs: Vec<[f32; 3]>,
    /// Coefficients, indexed `[band][dir][ear]`
    coeffs: Vec<Complex32>,
    /// Interaural time differences in seconds (positive: left ear leads)
    itds_s: Vec<f32>,
    /// Data set name
    name: String,
}

impl HrtfFilterbank {
    /// Convert an HRIR set for the given band centre frequencies
    pub fn from_hrirs(set: &HrirSet, freqs: &[f32]) -> CropacResult<Self> {
        set.validate()?;
        if freqs.is_empty() {
            return Err(CropacError::config("band frequency list is empty"));
        }

        let fs = set.sample_rate as f32;
        let nyquist = 0.5 * fs;
        let num_bands = freqs.len();
        let num_dirs = set.len();

        // [dir][band][ear]
        let per_dir: Vec<Vec<[Complex32; NUM_EARS]>> = set
            .hrirs
            .par_iter()
            .map(|hrir| {
                freqs
                    .iter()
                    .map(|&f| {
                        let f = f.clamp(0.0, nyquist);
                        [dft_at(&hrir.left, f, fs), dft_at(&hrir.right, f, fs)]
                    })
                    .collect()
            })
            .collect();

        let mut coeffs = vec![Complex32::new(0.0, 0.0); num_bands * num_dirs * NUM_EARS];
        for (dir, bands) in per_dir.iter().enumerate() {
            for (band, ears) in bands.iter().enumerate() {
                let base = (band * num_dirs + dir) * NUM_EARS;
                coeffs[base..base + NUM_EARS].copy_from_slice(ears);
            }
        }

        let max_lag = (MAX_ITD_S * fs).ceil() as isize;
        let itds_s = set
            .hrirs
            .iter()
            .map(|h| estimate_itd_samples(&h.left, &h.right, max_lag) / fs)
            .collect();

        let dirs = set
            .directions_deg
            .iter()
            .map(|d| unit_vector(d[0], d[1]))
            .collect();

        log::debug!(
            "HRTF filterbank '{}': {} directions x {} bands",
            set.name,
            num_dirs,
            num_bands
        );

        Ok(Self {
            freqs: freqs.to_vec(),
            dirs,
            coeffs,
            itds_s,
            name: set.name.clone(),
        })
    }

    /// Number of bands
    pub fn num_bands(&self) -> usize {
        self.freqs.len()
    }

    /// Number of measurement directions
    pub fn num_directions(&self) -> usize {
        self.dirs.len()
    }

    /// Band centre frequencies
    pub fn frequencies(&self) -> &[f32] {
        &self.freqs
    }

    /// Data set name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Complex gain for (band, direction, ear)
    #[inline]
    pub fn coefficient(&self, band: usize, dir: usize, ear: usize) -> Complex32 {
        self.coeffs[(band * self.dirs.len() + dir) * NUM_EARS + ear]
    }

    /// ITD of a measurement direction in seconds
    pub fn itd(&self, dir: usize) -> f32 {
        self.itds_s[dir]
    }

    /// Index of the measured direction closest to `target`
    ///
    /// Ties resolve to the lowest index.
    pub fn nearest_direction(&self, target: [f32; 3]) -> usize {
        let mut best = 0;
        let mut best_dist = f32::MAX;
        for (i, d) in self.dirs.iter().enumerate() {
            let dist = angular_distance(*d, target);
            if dist < best_dist {
                best_dist = dist;
                best = i;
            }
        }
        best
    }

    /// Interpolation gains over the three nearest measured directions
    ///
    /// Barycentric (VBAP) gains when `target` lies inside their triangle,
    /// inverse-distance weights otherwise. Gains sum to one.
    pub fn interpolation_weights(&self, target: [f32; 3]) -> [(usize, f32); 3] {
        let mut nearest = [(0usize, f32::MAX); 3];
        for (i, d) in self.dirs.iter().enumerate() {
            let dist = angular_distance(*d, target);
            if dist < nearest[2].1 {
                nearest[2] = (i, dist);
                nearest.sort_by(|a, b| a.1.total_cmp(&b.1));
            }
        }

        let count = self.dirs.len().min(3);
        if count < 3 {
            let mut weights = [(0usize, 0.0f32); 3];
            for (slot, &(idx, _)) in nearest.iter().take(count).enumerate() {
                weights[slot] = (idx, 1.0 / count as f32);
            }
            return weights;
        }

        let basis = Matrix3::from_columns(&[
            Vector3::from(self.dirs[nearest[0].0]),
            Vector3::from(self.dirs[nearest[1].0]),
            Vector3::from(self.dirs[nearest[2].0]),
        ]);

        let barycentric = basis
            .try_inverse()
            .map(|inv| inv * Vector3::from(target))
            .filter(|g| g.iter().all(|&x| x.is_finite() && x >= -TRIANGLE_TOLERANCE));

        let raw: [f32; 3] = match barycentric {
            Some(g) => [g[0].max(0.0), g[1].max(0.0), g[2].max(0.0)],
            None => [
                1.0 / (nearest[0].1 + 1e-3),
                1.0 / (nearest[1].1 + 1e-3),
                1.0 / (nearest[2].1 + 1e-3),
            ],
        };

        let sum: f32 = raw.iter().sum();
        let norm = if sum > 0.0 { 1.0 / sum } else { 1.0 / 3.0 };
        [
            (nearest[0].0, raw[0] * norm),
            (nearest[1].0, raw[1] * norm),
            (nearest[2].0, raw[2] * norm),
        ]
    }

    /// Interpolated ear gains for a band
    ///
    /// Magnitudes are blended linearly; the phase is rebuilt from the
    /// blended ITD, split symmetrically between the ears.
    pub fn interpolate(&self, band: usize, weights: &[(usize, f32); 3]) -> [Complex32; NUM_EARS] {
        let mut mags = [0.0f32; NUM_EARS];
        let mut itd = 0.0f32;
        for &(dir, w) in weights {
            for (ear, mag) in mags.iter_mut().enumerate() {
                *mag += w * self.coefficient(band, dir, ear).norm();
            }
            itd += w * self.itds_s[dir];
        }

        let omega = 2.0 * std::f32::consts::PI * self.freqs[band];
        let half_phase = 0.5 * omega * itd;
        [
            Complex32::from_polar(mags[0], half_phase),
            Complex32::from_polar(mags[1], -half_phase),
        ]
    }
}

/// DFT of an impulse response evaluated at a single frequency
fn dft_at(ir: &[f32], freq: f32, fs: f32) -> Complex32 {
    let step = freq as f64 / fs as f64;
    let mut acc_re = 0.0f64;
    let mut acc_im = 0.0f64;
    for (n, &h) in ir.iter().enumerate() {
        let phase = -2.0 * PI * (step * n as f64).fract();
        acc_re += h as f64 * phase.cos();
        acc_im += h as f64 * phase.sin();
    }
    Complex32::new(acc_re as f32, acc_im as f32)
}

/// Lag (in samples) by which the right response trails the left one
fn estimate_itd_samples(left: &[f32], right: &[f32], max_lag: isize) -> f32 {
    let len = left.len().min(right.len()) as isize;
    let xcorr = |lag: isize| -> f32 {
        let mut sum = 0.0f32;
        for n in 0..len {
            let m = n + lag;
            if m >= 0 && m < len {
                sum += left[n as usize] * right[m as usize];
            }
        }
        sum
    };

    let mut best_lag = 0isize;
    let mut best = f32::MIN;
    for lag in -max_lag..=max_lag {
        let value = xcorr(lag);
        if value > best {
            best = value;
            best_lag = lag;
        }
    }

    // Parabolic refinement around the peak
    if best_lag > -max_lag && best_lag < max_lag {
        let prev = xcorr(best_lag - 1);
        let next = xcorr(best_lag + 1);
        let denom = prev - 2.0 * best + next;
        if denom.abs() > f32::EPSILON {
            let offset = 0.5 * (prev - next) / denom;
            return best_lag as f32 + offset.clamp(-0.5, 0.5);
        }
    }
    best_lag as f32
}
