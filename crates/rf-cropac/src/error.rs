//! Error types for the parametric binaural decoder

use thiserror::Error;

use crate::format::ChannelOrdering;

/// Decoder error types
#[derive(Error, Debug)]
pub enum CropacError {
    /// Malformed or empty HRIR set, invalid configuration value
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Only ACN ordering is processed
    #[error("Unsupported channel ordering: {0:?}")]
    UnsupportedOrdering(ChannelOrdering),

    /// Decode set and transform disagree on the band layout
    #[error("Transform mismatch: decoder built for {decoder_bands} bands, transform provides {transform_bands}")]
    TransformMismatch {
        decoder_bands: usize,
        transform_bands: usize,
    },

    /// Invalid channel count
    #[error("Invalid channel count: expected {expected}, got {got}")]
    InvalidChannelCount { expected: usize, got: usize },

    /// Buffer size mismatch
    #[error("Buffer size mismatch: expected {expected}, got {got}")]
    BufferSizeMismatch { expected: usize, got: usize },

    /// FFT buffer or input rejected by realfft
    #[error("FFT error: {0}")]
    Fft(#[from] realfft::FftError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CropacError {
    /// Shorthand for configuration errors
    pub fn config(msg: impl Into<String>) -> Self {
        CropacError::Configuration(msg.into())
    }
}

/// Result type for decoder operations
pub type CropacResult<T> = Result<T, CropacError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fft_error_converts() {
        let err: CropacError = realfft::FftError::InputValues(true, false).into();
        assert!(matches!(err, CropacError::Fft(_)));
        assert!(err.to_string().starts_with("FFT error"));
    }

    #[test]
    fn test_mismatch_message() {
        let err = CropacError::TransformMismatch {
            decoder_bands: 65,
            transform_bands: 129,
        };
        assert_eq!(
            err.to_string(),
            "Transform mismatch: decoder built for 65 bands, transform provides 129"
        );
    }
}
