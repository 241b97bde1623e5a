//! ReelForge Parametric Binaural Decoder (CroPaC)
//!
//! First-order ambisonics to headphones:
//!
//! ## Decoding
//! - HRTF filterbank from measured or bundled HRIRs
//! - Least-squares SH decode over a spherical covering set
//! - Frequency-dependent max-rE weighting
//! - Nearest or triangular HRTF interpolation
//!
//! ## Parametric Enhancement
//! - Cross-pattern coherence direct/diffuse analysis per tile
//! - Per-band direct/diffuse and linear/parametric balance
//! - Covariance-domain optimal mixing with decorrelated residual
//!
//! ## Realtime
//! - Yaw/pitch/roll sound-field rotation
//! - Lock-free parameter snapshots and decode set hand-over
//! - Optional parallel band processing
//!
//! ```no_run
//! use rf_cropac::{CropacConfig, CropacEngine};
//!
//! let mut engine = CropacEngine::new(CropacConfig::default())?;
//! engine.controller_mut().set_balance_all(1.5);
//!
//! let n = engine.frame_size();
//! let ambi = vec![vec![0.0f32; n]; 4];
//! let mut ears = vec![vec![0.0f32; n]; 2];
//! let input: Vec<&[f32]> = ambi.iter().map(|c| c.as_slice()).collect();
//! let mut output: Vec<&mut [f32]> = ears.iter_mut().map(|c| c.as_mut_slice()).collect();
//! engine.process(&input, &mut output)?;
//! # Ok::<(), rf_cropac::CropacError>(())
//! ```

#![allow(missing_docs)]

pub mod analyzer;
pub mod config;
pub mod decoder;
pub mod decorrelator;
pub mod engine;
pub mod format;
pub mod hrtf;
pub mod mixer;
pub mod params;
pub mod rotator;
pub mod sh;
pub mod state;
pub mod transform;

mod error;

pub use config::CropacConfig;
pub use decoder::{DecodeMatrices, DecodeMatrix, DecoderBuilder};
pub use engine::{
    CropacController, CropacEngine, CropacProcessor, Diagnostics, EngineState, EngineStatus,
};
pub use error::{CropacError, CropacResult};
pub use format::{AmbisonicFormat, ChannelOrdering, NUM_EARS, NUM_SH_SIGNALS, Normalization};
pub use hrtf::{FileHrirProvider, HrirPair, HrirProvider, HrirSet, HrtfFilterbank, HrtfInterpolation, HrtfSource};
pub use mixer::{CovarianceMixer, MixerConfig, MixingMatrices};
pub use params::CropacParams;
pub use rotator::{RotationOrder, RotationParams, Rotator};
pub use transform::{StftFilterbank, TfFrame, TimeFrequencyTransform};
