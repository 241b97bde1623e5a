//! Engine configuration (fixed for the lifetime of a processor)

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::decoder::DEFAULT_COVERING_POINTS;
use crate::error::{CropacError, CropacResult};
use crate::mixer::{DEFAULT_MAX_GAIN_DB, DEFAULT_REGULARIZATION, MixerConfig};
use crate::transform::{DEFAULT_HOP_SIZE, DEFAULT_TIME_SLOTS};

/// Output gain applied after mixing, in dB
pub const DEFAULT_POST_GAIN_DB: f32 = -9.0;

/// Default sample rate
pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CropacConfig {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// STFT hop size (power of two)
    pub hop_size: usize,
    /// Time slots per processed frame
    pub time_slots: usize,
    /// Mixer singular value floor, relative
    pub regularization: f32,
    /// Mixer gain cap in dB
    pub max_gain_db: f32,
    /// Output gain in dB
    pub post_gain_db: f32,
    /// Size of the decoder's covering set
    pub covering_points: usize,
    /// Process bands on the rayon pool
    ///
    /// The calling thread waits for the pool to finish each block, so this
    /// is meant for offline rendering. Leave it off on a real-time audio
    /// thread.
    pub parallel_bands: bool,
}

impl Default for CropacConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            hop_size: DEFAULT_HOP_SIZE,
            time_slots: DEFAULT_TIME_SLOTS,
            regularization: DEFAULT_REGULARIZATION,
            max_gain_db: DEFAULT_MAX_GAIN_DB,
            post_gain_db: DEFAULT_POST_GAIN_DB,
            covering_points: DEFAULT_COVERING_POINTS,
            parallel_bands: false,
        }
    }
}

impl CropacConfig {
    pub fn with_sample_rate(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Self::default()
        }
    }

    /// Samples per processed frame
    pub fn frame_size(&self) -> usize {
        self.hop_size * self.time_slots
    }

    pub fn mixer(&self) -> MixerConfig {
        MixerConfig::new(self.regularization, self.max_gain_db)
    }

    pub fn post_gain(&self) -> f32 {
        crate::mixer::db_to_linear(self.post_gain_db)
    }

    pub fn validate(&self) -> CropacResult<()> {
        if !(8000..=384_000).contains(&self.sample_rate) {
            return Err(CropacError::config(format!(
                "sample rate {} Hz out of range",
                self.sample_rate
            )));
        }
        if self.hop_size < 16 || !self.hop_size.is_power_of_two() {
            return Err(CropacError::config(format!(
                "hop size {} must be a power of two >= 16",
                self.hop_size
            )));
        }
        if self.time_slots == 0 {
            return Err(CropacError::config("time slots must be at least 1"));
        }
        if !(self.regularization > 0.0 && self.regularization <= 1.0) {
            return Err(CropacError::config(format!(
                "regularization {} outside (0, 1]",
                self.regularization
            )));
        }
        if !(0.0..=40.0).contains(&self.max_gain_db) {
            return Err(CropacError::config(format!(
                "gain cap {} dB outside [0, 40]",
                self.max_gain_db
            )));
        }
        if !self.post_gain_db.is_finite() {
            return Err(CropacError::config("post gain is not finite"));
        }
        if self.covering_points < 4 {
            return Err(CropacError::config(format!(
                "covering set needs at least 4 points, got {}",
                self.covering_points
            )));
        }
        Ok(())
    }

    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> CropacResult<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let config: CropacConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }
}
