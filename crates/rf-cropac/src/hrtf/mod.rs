//! HRIR data sets and their conversion to filterbank coefficients
//!
//! - `HrirSet`: measured (or synthetic) head-related impulse responses
//! - `HrirProvider`: where the decoder gets its HRIRs from
//! - `HrtfFilterbank`: per-band complex gains + ITDs used by the decoder build

mod filterbank;
mod synthetic;

pub use filterbank::{HrtfFilterbank, HrtfInterpolation};

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CropacError, CropacResult};

/// Default sample rate of the bundled HRIR set
pub const DEFAULT_HRIR_SAMPLE_RATE: u32 = 48000;

/// HRIR (Head-Related Impulse Response) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HrirPair {
    /// Left ear impulse response
    pub left: Vec<f32>,
    /// Right ear impulse response
    pub right: Vec<f32>,
}

impl HrirPair {
    /// Create new HRIR pair
    pub fn new(left: Vec<f32>, right: Vec<f32>) -> Self {
        Self { left, right }
    }

    /// Get filter length
    pub fn length(&self) -> usize {
        self.left.len().max(self.right.len())
    }

    /// Ear response by index (0 = left, 1 = right)
    pub fn ear(&self, ear: usize) -> &[f32] {
        if ear == 0 { &self.left } else { &self.right }
    }
}

/// A set of HRIRs with their measurement directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HrirSet {
    /// Subject / data set name
    pub name: String,
    /// Sample rate of the impulse responses
    pub sample_rate: u32,
    /// Measurement directions in degrees, `[azimuth, elevation]`
    pub directions_deg: Vec<[f32; 2]>,
    /// One HRIR pair per direction
    pub hrirs: Vec<HrirPair>,
}

impl HrirSet {
    /// Bundled default set (spherical-head model)
    pub fn default_set() -> Self {
        synthetic::spherical_head_set(DEFAULT_HRIR_SAMPLE_RATE)
    }

    /// Number of measurement directions
    pub fn len(&self) -> usize {
        self.directions_deg.len()
    }

    /// True when the set holds no directions
    pub fn is_empty(&self) -> bool {
        self.directions_deg.is_empty()
    }

    /// Length of the impulse responses
    pub fn hrir_len(&self) -> usize {
        self.hrirs.iter().map(HrirPair::length).max().unwrap_or(0)
    }

    /// Check that the set can be turned into a decoder
    pub fn validate(&self) -> CropacResult<()> {
        if self.directions_deg.is_empty() || self.hrirs.is_empty() {
            return Err(CropacError::config(format!(
                "HRIR set '{}' holds zero directions",
                self.name
            )));
        }
        if self.directions_deg.len() != self.hrirs.len() {
            return Err(CropacError::config(format!(
                "HRIR set '{}' has {} directions but {} impulse responses",
                self.name,
                self.directions_deg.len(),
                self.hrirs.len()
            )));
        }
        if self.sample_rate == 0 {
            return Err(CropacError::config("HRIR sample rate is zero"));
        }
        let len = self.hrirs[0].left.len();
        if len == 0 {
            return Err(CropacError::config("HRIRs are empty"));
        }
        if let Some(idx) = self
            .hrirs
            .iter()
            .position(|h| h.left.len() != len || h.right.len() != len)
        {
            return Err(CropacError::config(format!(
                "HRIR {} length differs from the set length {}",
                idx, len
            )));
        }
        if self
            .directions_deg
            .iter()
            .flatten()
            .chain(self.hrirs.iter().flat_map(|h| h.left.iter().chain(&h.right)))
            .any(|v| !v.is_finite())
        {
            return Err(CropacError::config("HRIR set contains non-finite values"));
        }
        Ok(())
    }

    /// Load a set from a JSON file
    pub fn load_json(path: impl AsRef<Path>) -> CropacResult<Self> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        let set: HrirSet = serde_json::from_reader(reader)?;
        set.validate()?;
        Ok(set)
    }

    /// Store the set as JSON
    pub fn save_json(&self, path: impl AsRef<Path>) -> CropacResult<()> {
        let writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer(writer, self)?;
        Ok(())
    }
}

/// Active HRIR source selection
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HrtfSource {
    /// Bundled default set
    #[default]
    Default,
    /// User-supplied HRIR set file
    File(PathBuf),
}

impl HrtfSource {
    /// Short label for logging
    pub fn label(&self) -> String {
        match self {
            HrtfSource::Default => "default".into(),
            HrtfSource::File(path) => path.display().to_string(),
        }
    }
}

/// Supplies HRIR sets to the decoder build
pub trait HrirProvider: Send + Sync {
    /// Load the set for a source
    fn load(&self, source: &HrtfSource) -> CropacResult<HrirSet>;
}

/// Serves the bundled set and JSON files from disk
#[derive(Debug, Clone, Default)]
pub struct FileHrirProvider;

impl HrirProvider for FileHrirProvider {
    fn load(&self, source: &HrtfSource) -> CropacResult<HrirSet> {
        match source {
            HrtfSource::Default => Ok(HrirSet::default_set()),
            HrtfSource::File(path) => HrirSet::load_json(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_set() -> HrirSet {
        HrirSet {
            name: "tiny".into(),
            sample_rate: 48000,
            directions_deg: vec![[0.0, 0.0], [90.0, 0.0]],
            hrirs: vec![
                HrirPair::new(vec![1.0, 0.0], vec![1.0, 0.0]),
                HrirPair::new(vec![1.0, 0.0], vec![0.5, 0.0]),
            ],
        }
    }

    #[test]
    fn test_default_set_is_valid() {
        let set = HrirSet::default_set();
        assert!(set.validate().is_ok());
        assert!(set.len() > 100);
    }

    #[test]
    fn test_empty_set_rejected() {
        let mut set = tiny_set();
        set.directions_deg.clear();
        set.hrirs.clear();
        assert!(matches!(set.validate(), Err(CropacError::Configuration(_))));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut set = tiny_set();
        set.hrirs[1].right.push(0.0);
        assert!(set.validate().is_err());

        let mut set = tiny_set();
        set.directions_deg.push([180.0, 0.0]);
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("set.json");
        let set = tiny_set();
        set.save_json(&path).unwrap();

        let loaded = FileHrirProvider
            .load(&HrtfSource::File(path.clone()))
            .unwrap();
        assert_eq!(loaded, set);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = FileHrirProvider.load(&HrtfSource::File("/nonexistent/hrirs.json".into()));
        assert!(matches!(result, Err(CropacError::Io(_))));
    }
}
