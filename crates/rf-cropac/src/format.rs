//! Ambisonic input format - normalization and channel ordering
//!
//! Every weight inside the decoder (SH basis, decode matrices, analysis
//! pickups) is defined for ACN/N3D. Input in SN3D is converted once per
//! block, before rotation.

use serde::{Deserialize, Serialize};

use crate::error::{CropacError, CropacResult};

/// Spherical harmonic order processed by the decoder
pub const SH_ORDER: usize = 1;

/// Number of ambisonic channels at first order
pub const NUM_SH_SIGNALS: usize = (SH_ORDER + 1) * (SH_ORDER + 1);

/// Number of output ears
pub const NUM_EARS: usize = 2;

/// Normalization scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Normalization {
    /// Fully normalized
    N3D,
    /// Schmidt semi-normalized (AmbiX)
    #[default]
    SN3D,
}

impl Normalization {
    /// Per-channel gains converting this normalization to N3D (ACN order)
    pub fn to_n3d_gains(self) -> [f32; NUM_SH_SIGNALS] {
        match self {
            Normalization::N3D => [1.0; NUM_SH_SIGNALS],
            Normalization::SN3D => {
                let g = 3.0_f32.sqrt();
                [1.0, g, g, g]
            }
        }
    }

    /// True when no conversion is required
    pub fn is_n3d(self) -> bool {
        self == Normalization::N3D
    }
}

/// Channel ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelOrdering {
    /// Ambisonic Channel Number (W, Y, Z, X)
    #[default]
    ACN,
    /// Furse-Malham (W, X, Y, Z) - not processed
    FuMa,
}

/// Complete input format specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AmbisonicFormat {
    /// Normalization scheme
    pub normalization: Normalization,
    /// Channel ordering
    pub ordering: ChannelOrdering,
}

impl AmbisonicFormat {
    /// AmbiX (ACN + SN3D)
    pub fn ambix() -> Self {
        Self {
            normalization: Normalization::SN3D,
            ordering: ChannelOrdering::ACN,
        }
    }

    /// ACN + N3D
    pub fn n3d_acn() -> Self {
        Self {
            normalization: Normalization::N3D,
            ordering: ChannelOrdering::ACN,
        }
    }

    /// Reject formats the decoder cannot process
    pub fn validate(&self) -> CropacResult<()> {
        match self.ordering {
            ChannelOrdering::ACN => Ok(()),
            other => Err(CropacError::UnsupportedOrdering(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sn3d_to_n3d_gains() {
        let g = Normalization::SN3D.to_n3d_gains();
        assert_eq!(g[0], 1.0);
        for &gain in &g[1..] {
            assert!((gain - 1.732_050_8).abs() < 1e-5);
        }
        assert_eq!(Normalization::N3D.to_n3d_gains(), [1.0; 4]);
    }

    #[test]
    fn test_fuma_rejected() {
        let format = AmbisonicFormat {
            normalization: Normalization::SN3D,
            ordering: ChannelOrdering::FuMa,
        };
        assert!(matches!(
            format.validate(),
            Err(CropacError::UnsupportedOrdering(ChannelOrdering::FuMa))
        ));
        assert!(AmbisonicFormat::ambix().validate().is_ok());
    }
}
