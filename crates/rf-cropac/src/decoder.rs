//! Decoding-weight builder
//!
//! Turns an HRTF filterbank into one complex 2×4 ambisonic → binaural
//! matrix per band. The HRTFs are sampled on a quasi-uniform covering set
//! and projected onto the first-order SH basis by least squares; with
//! max-rE enabled the order-1 weights are tapered above 500 Hz.

use nalgebra::{Matrix4, SMatrix, Vector4};
use num_complex::Complex32;
use rayon::prelude::*;

use crate::error::{CropacError, CropacResult};
use crate::format::{NUM_EARS, NUM_SH_SIGNALS};
use crate::hrtf::{HrtfFilterbank, HrtfInterpolation};
use crate::sh::{acn_order, covering_set, order_weights, real_sh_n3d};

/// Default size of the covering set
pub const DEFAULT_COVERING_POINTS: usize = 240;

/// Ambisonic (ACN/N3D) → binaural matrix for one band
pub type DecodeMatrix = SMatrix<Complex32, NUM_EARS, NUM_SH_SIGNALS>;

/// Complete per-band decode set, published as one unit
#[derive(Debug, Clone)]
pub struct DecodeMatrices {
    matrices: Vec<DecodeMatrix>,
    freqs: Vec<f32>,
    hrtf_name: String,
    max_re: bool,
    interpolation: HrtfInterpolation,
}

impl DecodeMatrices {
    pub fn num_bands(&self) -> usize {
        self.matrices.len()
    }

    #[inline]
    pub fn matrix(&self, band: usize) -> &DecodeMatrix {
        &self.matrices[band]
    }

    pub fn matrices(&self) -> &[DecodeMatrix] {
        &self.matrices
    }

    pub fn frequencies(&self) -> &[f32] {
        &self.freqs
    }

    /// Name of the HRIR set the matrices were built from
    pub fn hrtf_name(&self) -> &str {
        &self.hrtf_name
    }

    pub fn max_re(&self) -> bool {
        self.max_re
    }

    pub fn interpolation(&self) -> HrtfInterpolation {
        self.interpolation
    }
}

/// Builder for [`DecodeMatrices`]
#[derive(Debug, Clone)]
pub struct DecoderBuilder {
    covering_points: usize,
    max_re: bool,
    interpolation: HrtfInterpolation,
}

impl Default for DecoderBuilder {
    fn default() -> Self {
        Self {
            covering_points: DEFAULT_COVERING_POINTS,
            max_re: true,
            interpolation: HrtfInterpolation::Nearest,
        }
    }
}

impl DecoderBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn covering_points(mut self, points: usize) -> Self {
        self.covering_points = points;
        self
    }

    /// Enable the frequency-dependent max-rE weighting
    pub fn max_re(mut self, enabled: bool) -> Self {
        self.max_re = enabled;
        self
    }

    pub fn interpolation(mut self, mode: HrtfInterpolation) -> Self {
        self.interpolation = mode;
        self
    }

    /// Build one decode matrix per band of `filterbank`
    pub fn build(&self, filterbank: &HrtfFilterbank) -> CropacResult<DecodeMatrices> {
        if filterbank.num_bands() == 0 {
            return Err(CropacError::config("HRTF filterbank has no bands"));
        }
        if filterbank.num_directions() == 0 {
            return Err(CropacError::config("HRTF filterbank has no directions"));
        }

        let dirs = covering_set(self.covering_points);
        let weights = pseudo_inverse_rows(&dirs)?;

        // HRTF lookup per covering direction
        let lookups: Vec<[(usize, f32); 3]> = dirs
            .iter()
            .map(|&d| match self.interpolation {
                HrtfInterpolation::Nearest => [(filterbank.nearest_direction(d), 1.0), (0, 0.0), (0, 0.0)],
                HrtfInterpolation::Triangular => filterbank.interpolation_weights(d),
            })
            .collect();

        let matrices: Vec<DecodeMatrix> = filterbank
            .frequencies()
            .par_iter()
            .enumerate()
            .map(|(band, &freq)| {
                let order_gain = order_weights(freq, self.max_re);
                let mut m = DecodeMatrix::zeros();
                for (lookup, w) in lookups.iter().zip(&weights) {
                    let h = self.hrtf(filterbank, band, lookup);
                    for ch in 0..NUM_SH_SIGNALS {
                        let g = order_gain[acn_order(ch)] * w[ch];
                        for (ear, &h_ear) in h.iter().enumerate() {
                            m[(ear, ch)] += h_ear * g;
                        }
                    }
                }
                m
            })
            .collect();

        log::debug!(
            "Decoder built: {} bands, {} covering points, max-rE {}, {:?}",
            matrices.len(),
            dirs.len(),
            self.max_re,
            self.interpolation
        );

        Ok(DecodeMatrices {
            matrices,
            freqs: filterbank.frequencies().to_vec(),
            hrtf_name: filterbank.name().to_string(),
            max_re: self.max_re,
            interpolation: self.interpolation,
        })
    }

    fn hrtf(
        &self,
        filterbank: &HrtfFilterbank,
        band: usize,
        lookup: &[(usize, f32); 3],
    ) -> [Complex32; NUM_EARS] {
        match self.interpolation {
            HrtfInterpolation::Nearest => [
                filterbank.coefficient(band, lookup[0].0, 0),
                filterbank.coefficient(band, lookup[0].0, 1),
            ],
            HrtfInterpolation::Triangular => filterbank.interpolate(band, lookup),
        }
    }
}

/// Rows of `Yᵀ(YYᵀ)⁻¹` for the SH matrix `Y` of a direction set
fn pseudo_inverse_rows(dirs: &[[f32; 3]]) -> CropacResult<Vec<[f32; NUM_SH_SIGNALS]>> {
    let sh: Vec<Vector4<f64>> = dirs
        .iter()
        .map(|&d| Vector4::from(real_sh_n3d(d).map(f64::from)))
        .collect();

    let gram: Matrix4<f64> = sh.iter().map(|y| y * y.transpose()).sum();
    let gram_inv = gram.try_inverse().ok_or_else(|| {
        CropacError::config(format!(
            "SH covering set of {} points is rank deficient",
            dirs.len()
        ))
    })?;

    Ok(sh
        .iter()
        .map(|y| {
            let w = gram_inv * y;
            [w[0] as f32, w[1] as f32, w[2] as f32, w[3] as f32]
        })
        .collect())
}
