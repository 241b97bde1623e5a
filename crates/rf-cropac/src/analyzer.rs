//! Direct/diffuse analysis by cross-pattern coherence
//!
//! Two coincident virtual pickups (omni and front hypercardioid) are
//! formed from the smoothed SH covariance. A single plane wave makes them
//! fully coherent; an ideal diffuse field leaves only their baseline
//! coherence. The resulting diffuseness steers a 2×2 binaural target
//! covariance between a fully coherent and a fully incoherent image.

use nalgebra::{Matrix2, Matrix4, Vector4};
use num_complex::Complex32;

use crate::decoder::DecodeMatrix;
use crate::format::NUM_SH_SIGNALS;

/// Omnidirectional pickup (N3D, ACN)
pub const OMNI_PICKUP: [f32; NUM_SH_SIGNALS] = [1.0, 0.0, 0.0, 0.0];

/// Front-facing hypercardioid `0.25 + 0.75·cos θ` (N3D, ACN)
pub const HYPERCARDIOID_PICKUP: [f32; NUM_SH_SIGNALS] = [0.25, 0.0, 0.0, 0.433_012_7];

/// Magnitude-squared coherence of the two pickups in an ideal diffuse field
pub const DIFFUSE_PICKUP_COHERENCE: f32 = 0.25;

/// Mean tile power below which a tile counts as silent
pub const SILENCE_FLOOR: f32 = 1e-9;

/// Pickup energy (relative to the omni) below which the coherence is not trusted
const PICKUP_ENERGY_FLOOR: f32 = 1e-4;

/// Largest usable averaging coefficient
pub const MAX_AVG_COEFF: f32 = 0.999;

/// Per-band user controls, already resolved for the band
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisParams {
    /// 0 = only diffuse, 1 = neutral, 2 = only directional
    pub balance: f32,
    /// 0 = only linear decode, 1 = only parametric target
    pub dec_balance: f32,
    /// Covariance smoothing coefficient in [0, 1)
    pub avg_coeff: f32,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            balance: 1.0,
            dec_balance: 1.0,
            avg_coeff: 0.86,
        }
    }
}

/// Analysis state owned by one band
#[derive(Debug, Clone)]
pub struct BandAnalysisState {
    cov: Matrix4<Complex32>,
    diffuseness: f32,
}

impl Default for BandAnalysisState {
    fn default() -> Self {
        Self {
            cov: Matrix4::zeros(),
            diffuseness: 1.0,
        }
    }
}

impl BandAnalysisState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Smoothed 4×4 SH covariance
    pub fn covariance(&self) -> &Matrix4<Complex32> {
        &self.cov
    }

    /// Last diffuseness estimate
    pub fn diffuseness(&self) -> f32 {
        self.diffuseness
    }
}

/// Result of analysing one tile
#[derive(Debug, Clone, Copy)]
pub struct TileAnalysis {
    /// Covariance the mixer should produce
    pub target: Matrix2<Complex32>,
    /// Covariance of the linear binaural decode
    pub linear_cov: Matrix2<Complex32>,
    /// Diffuseness in [0, 1]
    pub diffuseness: f32,
    pub direct_energy: f32,
    pub diffuse_energy: f32,
    /// Tile below [`SILENCE_FLOOR`], mixing is a no-op
    pub silent: bool,
}

/// Analyse one tile
///
/// `sh` holds the rotated N3D signals laid out `[channel][slot]`.
pub fn analyze_tile(
    sh: &[Complex32],
    time_slots: usize,
    decoder: &DecodeMatrix,
    params: &AnalysisParams,
    state: &mut BandAnalysisState,
) -> TileAnalysis {
    let inst = instantaneous_covariance(sh, time_slots);
    let mean_power = inst.trace().re / NUM_SH_SIGNALS as f32;

    if !(mean_power >= SILENCE_FLOOR) {
        let linear_cov = decoder * state.cov * decoder.adjoint();
        return TileAnalysis {
            target: linear_cov,
            linear_cov,
            diffuseness: state.diffuseness,
            direct_energy: 0.0,
            diffuse_energy: 0.0,
            silent: true,
        };
    }

    let avg = params.avg_coeff.clamp(0.0, MAX_AVG_COEFF);
    state.cov = state.cov * Complex32::new(avg, 0.0) + inst * Complex32::new(1.0 - avg, 0.0);

    if let Some(psi) = diffuseness(&state.cov) {
        state.diffuseness = psi;
    }

    let linear_cov = decoder * state.cov * decoder.adjoint();
    let (target, direct_energy, diffuse_energy) =
        target_covariance(&linear_cov, state.diffuseness, params.balance, params.dec_balance);

    TileAnalysis {
        target,
        linear_cov,
        diffuseness: state.diffuseness,
        direct_energy,
        diffuse_energy,
        silent: false,
    }
}

/// Time average of `x xᴴ` over the slots of a tile
fn instantaneous_covariance(sh: &[Complex32], time_slots: usize) -> Matrix4<Complex32> {
    let mut cov = Matrix4::<Complex32>::zeros();
    if time_slots == 0 {
        return cov;
    }
    for slot in 0..time_slots {
        let x = Vector4::from_fn(|ch, _| sh[ch * time_slots + slot]);
        cov += x * x.adjoint();
    }
    cov * Complex32::new(1.0 / time_slots as f32, 0.0)
}

/// Diffuseness from pickup coherence, `None` when a pickup is (nearly) silent
pub fn diffuseness(cov: &Matrix4<Complex32>) -> Option<f32> {
    let omni = pickup_vector(&OMNI_PICKUP);
    let hyper = pickup_vector(&HYPERCARDIOID_PICKUP);

    let c11 = (omni.adjoint() * cov * omni)[(0, 0)].re;
    let c22 = (hyper.adjoint() * cov * hyper)[(0, 0)].re;
    let c12 = (omni.adjoint() * cov * hyper)[(0, 0)];

    if !(c11 > f32::MIN_POSITIVE) || c22 < PICKUP_ENERGY_FLOOR * c11 {
        return None;
    }

    let msc = (c12.norm_sqr() / (c11 * c22)).min(1.0);
    Some(((1.0 - msc) / (1.0 - DIFFUSE_PICKUP_COHERENCE)).clamp(0.0, 1.0))
}

fn pickup_vector(weights: &[f32; NUM_SH_SIGNALS]) -> Vector4<Complex32> {
    Vector4::from_fn(|ch, _| Complex32::new(weights[ch], 0.0))
}

/// Map a balance value in [0, 2] onto the direct-stream weight
pub fn balanced_direct_weight(diffuseness: f32, balance: f32) -> f32 {
    let w = 1.0 - diffuseness.clamp(0.0, 1.0);
    let b = balance.clamp(0.0, 2.0);
    if b <= 1.0 {
        b * w
    } else {
        w + (b - 1.0) * (1.0 - w)
    }
}

/// Target covariance and (direct, diffuse) energies for one tile
pub fn target_covariance(
    linear_cov: &Matrix2<Complex32>,
    diffuseness: f32,
    balance: f32,
    dec_balance: f32,
) -> (Matrix2<Complex32>, f32, f32) {
    let e_l = linear_cov[(0, 0)].re.max(0.0);
    let e_r = linear_cov[(1, 1)].re.max(0.0);
    let total = e_l + e_r;

    // Fully coherent reference with the linear decode's inter-ear phase
    let coherent = (e_l * e_r).sqrt();
    let cross = linear_cov[(0, 1)];
    let cross = if cross.norm() > f32::MIN_POSITIVE {
        cross * (coherent / cross.norm())
    } else {
        Complex32::new(coherent, 0.0)
    };
    let direct = Matrix2::new(
        Complex32::new(e_l, 0.0),
        cross,
        cross.conj(),
        Complex32::new(e_r, 0.0),
    );

    let mean = 0.5 * total;
    let diffuse = Matrix2::new(
        Complex32::new(mean, 0.0),
        Complex32::new(0.0, 0.0),
        Complex32::new(0.0, 0.0),
        Complex32::new(mean, 0.0),
    );

    let w = balanced_direct_weight(diffuseness, balance);
    let parametric = direct * Complex32::new(w, 0.0) + diffuse * Complex32::new(1.0 - w, 0.0);

    let beta = dec_balance.clamp(0.0, 1.0);
    let target = parametric * Complex32::new(beta, 0.0) + linear_cov * Complex32::new(1.0 - beta, 0.0);

    (target, w * total, (1.0 - w) * total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sh::{real_sh_n3d, unit_vector};
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    const SLOTS: usize = 4;

    fn gaussian(rng: &mut ChaCha8Rng) -> Complex32 {
        // Box-Muller
        let u1: f32 = rng.random::<f32>().max(1e-12);
        let u2: f32 = rng.random::<f32>();
        let r = (-2.0 * u1.ln()).sqrt() * std::f32::consts::FRAC_1_SQRT_2;
        Complex32::from_polar(r, 2.0 * std::f32::consts::PI * u2)
    }

    fn plane_wave_tile(rng: &mut ChaCha8Rng, az: f32, el: f32) -> Vec<Complex32> {
        let y = real_sh_n3d(unit_vector(az, el));
        let s: Vec<Complex32> = (0..SLOTS).map(|_| gaussian(rng)).collect();
        let mut tile = vec![Complex32::new(0.0, 0.0); NUM_SH_SIGNALS * SLOTS];
        for ch in 0..NUM_SH_SIGNALS {
            for t in 0..SLOTS {
                tile[ch * SLOTS + t] = s[t] * y[ch];
            }
        }
        tile
    }

    fn diffuse_tile(rng: &mut ChaCha8Rng) -> Vec<Complex32> {
        (0..NUM_SH_SIGNALS * SLOTS).map(|_| gaussian(rng)).collect()
    }

    fn omni_decoder() -> DecodeMatrix {
        let mut d = DecodeMatrix::zeros();
        d[(0, 0)] = Complex32::new(1.0, 0.0);
        d[(1, 0)] = Complex32::new(1.0, 0.0);
        d[(0, 1)] = Complex32::new(0.5, 0.0);
        d[(1, 1)] = Complex32::new(-0.5, 0.0);
        d
    }

    #[test]
    fn test_plane_wave_is_not_diffuse() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut state = BandAnalysisState::default();
        let params = AnalysisParams::default();
        for az in [0.0, 90.0, -60.0] {
            state.reset();
            let mut last = None;
            for _ in 0..50 {
                let tile = plane_wave_tile(&mut rng, az, 10.0);
                last = Some(analyze_tile(&tile, SLOTS, &omni_decoder(), &params, &mut state));
            }
            let analysis = last.unwrap();
            assert!(analysis.diffuseness < 0.01, "az {}: psi {}", az, analysis.diffuseness);
        }
    }

    #[test]
    fn test_diffuse_field_converges_to_one() {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        let mut state = BandAnalysisState::default();
        let params = AnalysisParams {
            avg_coeff: 0.95,
            ..AnalysisParams::default()
        };
        let mut acc = 0.0;
        for i in 0..600 {
            let tile = diffuse_tile(&mut rng);
            let analysis = analyze_tile(&tile, SLOTS, &omni_decoder(), &params, &mut state);
            if i >= 400 {
                acc += analysis.diffuseness;
            }
        }
        let mean = acc / 200.0;
        assert!(mean > 0.85, "mean diffuseness {}", mean);
    }

    #[test]
    fn test_ideal_diffuse_covariance() {
        let cov = Matrix4::<Complex32>::identity();
        let psi = diffuseness(&cov).unwrap();
        assert!((psi - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_hypercardioid_null_holds_previous_value() {
        // Source in the rear null of the hypercardioid (cos θ = -1/3)
        let theta = (-1.0f32 / 3.0).acos().to_degrees();
        let y = real_sh_n3d(unit_vector(theta, 0.0));
        let v = Vector4::from_fn(|ch, _| Complex32::new(y[ch], 0.0));
        let cov = v * v.adjoint();
        assert!(diffuseness(&cov).is_none());
    }

    #[test]
    fn test_silent_tile_holds_state() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut state = BandAnalysisState::default();
        let params = AnalysisParams::default();
        for _ in 0..20 {
            let tile = plane_wave_tile(&mut rng, 0.0, 0.0);
            analyze_tile(&tile, SLOTS, &omni_decoder(), &params, &mut state);
        }
        let cov_before = *state.covariance();
        let psi_before = state.diffuseness();

        let silence = vec![Complex32::new(0.0, 0.0); NUM_SH_SIGNALS * SLOTS];
        let analysis = analyze_tile(&silence, SLOTS, &omni_decoder(), &params, &mut state);

        assert!(analysis.silent);
        assert_eq!(*state.covariance(), cov_before);
        assert_eq!(state.diffuseness(), psi_before);
        assert_eq!(analysis.target, analysis.linear_cov);
    }

    #[test]
    fn test_balance_mapping() {
        assert_eq!(balanced_direct_weight(0.3, 0.0), 0.0);
        assert!((balanced_direct_weight(0.3, 1.0) - 0.7).abs() < 1e-6);
        assert_eq!(balanced_direct_weight(0.3, 2.0), 1.0);
        assert!((balanced_direct_weight(0.3, 0.5) - 0.35).abs() < 1e-6);
        assert!((balanced_direct_weight(0.3, 1.5) - 0.85).abs() < 1e-6);
    }

    #[test]
    fn test_target_extremes() {
        let cy = Matrix2::new(
            Complex32::new(2.0, 0.0),
            Complex32::new(0.3, 0.4),
            Complex32::new(0.3, -0.4),
            Complex32::new(1.0, 0.0),
        );

        // Only directional: fully coherent, same phase and diagonal
        let (t, direct, diffuse) = target_covariance(&cy, 0.5, 2.0, 1.0);
        assert!((t[(0, 1)].norm() - 2.0f32.sqrt()).abs() < 1e-5);
        assert!((t[(0, 1)].arg() - cy[(0, 1)].arg()).abs() < 1e-5);
        assert!((t[(0, 0)].re - 2.0).abs() < 1e-6);
        assert!((direct - 3.0).abs() < 1e-5 && diffuse.abs() < 1e-6);

        // Only diffuse: equal ears, no cross term
        let (t, direct, diffuse) = target_covariance(&cy, 0.5, 0.0, 1.0);
        assert!(t[(0, 1)].norm() < 1e-6);
        assert!((t[(0, 0)].re - 1.5).abs() < 1e-6);
        assert!((t[(1, 1)].re - 1.5).abs() < 1e-6);
        assert!(direct.abs() < 1e-6 && (diffuse - 3.0).abs() < 1e-5);

        // Only linear
        let (t, _, _) = target_covariance(&cy, 0.5, 0.0, 0.0);
        assert!((t - cy).norm() < 1e-6);
    }
}
