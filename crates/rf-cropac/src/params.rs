//! User parameters (host-automatable state)
//!
//! Only user intent lives here; decode matrices and other derived data are
//! rebuilt from it and never persisted.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::analyzer::{AnalysisParams, MAX_AVG_COEFF};
use crate::error::CropacResult;
use crate::format::AmbisonicFormat;
use crate::hrtf::{HrtfInterpolation, HrtfSource};
use crate::rotator::RotationParams;

/// Default covariance averaging coefficient
pub const DEFAULT_COV_AVG_COEFF: f32 = 0.86;

/// Complete user parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropacParams {
    /// Linear EQ gain per band
    pub eq: Vec<f32>,
    /// Direct/diffuse balance per band (0 = diffuse, 1 = neutral, 2 = direct)
    pub balance: Vec<f32>,
    /// Linear/parametric balance per band (0 = linear, 1 = parametric)
    pub dec_balance: Vec<f32>,
    /// Max-rE weighting in the decoder
    pub max_re: bool,
    pub hrtf_source: HrtfSource,
    pub hrtf_interpolation: HrtfInterpolation,
    /// Input normalization and ordering
    pub format: AmbisonicFormat,
    /// Covariance averaging coefficient in [0, 1)
    pub cov_avg_coeff: f32,
    pub rotation: RotationParams,
}

impl Default for CropacParams {
    fn default() -> Self {
        Self {
            eq: Vec::new(),
            balance: Vec::new(),
            dec_balance: Vec::new(),
            max_re: true,
            hrtf_source: HrtfSource::Default,
            hrtf_interpolation: HrtfInterpolation::Nearest,
            format: AmbisonicFormat::ambix(),
            cov_avg_coeff: DEFAULT_COV_AVG_COEFF,
            rotation: RotationParams::default(),
        }
    }
}

/// Value of a per-band vector; bands without an entry are neutral
#[inline]
fn band_value(values: &[f32], band: usize) -> f32 {
    values.get(band).copied().unwrap_or(1.0)
}

/// Write `value` at `band`, padding with the neutral value
fn set_band_value(values: &mut Vec<f32>, band: usize, value: f32) {
    if values.len() <= band {
        values.resize(band + 1, 1.0);
    }
    values[band] = value;
}

impl CropacParams {
    /// Defaults with per-band vectors sized for `num_bands`
    pub fn with_bands(num_bands: usize) -> Self {
        Self {
            eq: vec![1.0; num_bands],
            balance: vec![1.0; num_bands],
            dec_balance: vec![1.0; num_bands],
            ..Self::default()
        }
    }

    #[inline]
    pub fn band_eq(&self, band: usize) -> f32 {
        band_value(&self.eq, band)
    }

    #[inline]
    pub fn band_balance(&self, band: usize) -> f32 {
        band_value(&self.balance, band)
    }

    #[inline]
    pub fn band_dec_balance(&self, band: usize) -> f32 {
        band_value(&self.dec_balance, band)
    }

    pub fn set_band_eq(&mut self, band: usize, gain: f32) {
        set_band_value(&mut self.eq, band, gain.max(0.0));
    }

    pub fn set_band_balance(&mut self, band: usize, balance: f32) {
        set_band_value(&mut self.balance, band, balance.clamp(0.0, 2.0));
    }

    pub fn set_band_dec_balance(&mut self, band: usize, dec_balance: f32) {
        set_band_value(&mut self.dec_balance, band, dec_balance.clamp(0.0, 1.0));
    }

    /// Analysis controls for one band
    #[inline]
    pub fn analysis(&self, band: usize) -> AnalysisParams {
        AnalysisParams {
            balance: self.band_balance(band),
            dec_balance: self.band_dec_balance(band),
            avg_coeff: self.cov_avg_coeff.clamp(0.0, MAX_AVG_COEFF),
        }
    }

    /// True when `other` needs a different decode set
    pub fn decoder_changed(&self, other: &CropacParams) -> bool {
        self.max_re != other.max_re
            || self.hrtf_source != other.hrtf_source
            || self.hrtf_interpolation != other.hrtf_interpolation
    }

    pub fn to_json(&self) -> CropacResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> CropacResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> CropacResult<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> CropacResult<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        Ok(serde_json::from_reader(reader)?)
    }
}
