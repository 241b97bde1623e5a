//! Covariance-domain optimal mixing (2 → 2)
//!
//! Finds the mixing matrix `M` that maps the linear decode onto the target
//! covariance while staying as close as possible to the linear decode
//! itself. Whatever `M` cannot produce (e.g. decorrelation from a rank-1
//! input) is left to a residual matrix applied to a decorrelated copy.

use nalgebra::Matrix2;
use num_complex::Complex32;

use crate::format::NUM_EARS;

/// Default singular value floor relative to the largest one
pub const DEFAULT_REGULARIZATION: f32 = 0.2;

/// Default cap on the mixing gain in dB
pub const DEFAULT_MAX_GAIN_DB: f32 = 12.0;

/// Covariance trace below which mixing is skipped
const ENERGY_EPSILON: f32 = 1e-12;

/// Residual energy (relative to the target) treated as zero
const RESIDUAL_EPSILON: f32 = 1e-5;

type Mat2 = Matrix2<Complex32>;

#[inline]
fn c(re: f32) -> Complex32 {
    Complex32::new(re, 0.0)
}

/// Mixer tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixerConfig {
    /// Singular value floor of `Kx` relative to its largest singular value
    pub regularization: f32,
    /// Maximum singular value of the mixing matrices (linear)
    pub max_gain: f32,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            regularization: DEFAULT_REGULARIZATION,
            max_gain: db_to_linear(DEFAULT_MAX_GAIN_DB),
        }
    }
}

impl MixerConfig {
    pub fn new(regularization: f32, max_gain_db: f32) -> Self {
        Self {
            regularization,
            max_gain: db_to_linear(max_gain_db),
        }
    }
}

#[inline]
pub fn db_to_linear(db: f32) -> f32 {
    10.0_f32.powf(db / 20.0)
}

/// Main and residual mixing matrices for one tile
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixingMatrices {
    pub main: Mat2,
    pub residual: Mat2,
    /// Regularization floor or gain cap engagements
    pub guard_events: u32,
}

impl MixingMatrices {
    /// Pass-through, no residual
    pub fn identity() -> Self {
        Self {
            main: Mat2::identity(),
            residual: Mat2::zeros(),
            guard_events: 0,
        }
    }

    pub fn has_residual(&self) -> bool {
        self.residual != Mat2::zeros()
    }

    /// `main · y + residual · decorrelated`
    #[inline]
    pub fn apply(
        &self,
        y: [Complex32; NUM_EARS],
        decorrelated: [Complex32; NUM_EARS],
    ) -> [Complex32; NUM_EARS] {
        let m = &self.main;
        let r = &self.residual;
        [
            m[(0, 0)] * y[0] + m[(0, 1)] * y[1] + r[(0, 0)] * decorrelated[0] + r[(0, 1)] * decorrelated[1],
            m[(1, 0)] * y[0] + m[(1, 1)] * y[1] + r[(1, 0)] * decorrelated[0] + r[(1, 1)] * decorrelated[1],
        ]
    }
}

/// Computes mixing matrices from covariance pairs
#[derive(Debug, Clone, Copy, Default)]
pub struct CovarianceMixer {
    config: MixerConfig,
}

impl CovarianceMixer {
    pub fn new(config: MixerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MixerConfig {
        &self.config
    }

    /// Mixing matrices taking `cy` (linear decode) towards `target`
    pub fn compute(&self, cy: &Mat2, target: &Mat2) -> MixingMatrices {
        let cy = hermitian_part(cy);
        let target = hermitian_part(target);
        if cy.trace().re < ENERGY_EPSILON {
            return MixingMatrices::identity();
        }

        let mut guard_events = 0;
        let kx = sqrtm_psd(&cy);
        let ky = sqrtm_psd(&target);

        // Regularized inverse of Kx
        let svd = kx.svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            return MixingMatrices::identity();
        };
        let s = svd.singular_values;
        let s_max = s[0].max(s[1]);
        let floor = (self.config.regularization * s_max).max(f32::MIN_POSITIVE);
        let mut s_inv = Mat2::zeros();
        for i in 0..2 {
            if s[i] < floor {
                guard_events += 1;
            }
            s_inv[(i, i)] = c(1.0 / s[i].max(floor));
        }
        let kx_inv = v_t.adjoint() * s_inv * u.adjoint();

        // Per-ear energy normalization of the prototype
        let mut g = Mat2::zeros();
        for i in 0..2 {
            let ratio = target[(i, i)].re.max(0.0) / cy[(i, i)].re.max(ENERGY_EPSILON);
            g[(i, i)] = c(ratio.sqrt());
        }

        // Closest unitary to Kxᴴ Gᴴ Ky
        let a = kx.adjoint() * g.adjoint() * ky;
        let svd_a = a.svd(true, true);
        let (Some(ua), Some(va_t)) = (svd_a.u, svd_a.v_t) else {
            return MixingMatrices::identity();
        };
        let p = va_t.adjoint() * ua.adjoint();

        let mut main = ky * p * kx_inv;
        if cap_gain(&mut main, self.config.max_gain) {
            guard_events += 1;
        }

        // What M cannot deliver goes to the decorrelated stream
        let produced = main * cy * main.adjoint();
        let missing = psd_projection(&(target - produced));
        let mut residual = Mat2::zeros();
        if missing.trace().re > RESIDUAL_EPSILON * target.trace().re.max(ENERGY_EPSILON) {
            let mut norm = Mat2::zeros();
            for i in 0..2 {
                norm[(i, i)] = c(1.0 / cy[(i, i)].re.max(ENERGY_EPSILON).sqrt());
            }
            residual = sqrtm_psd(&missing) * norm;
        }

        // Both paths share the cap: the stacked [M | Mr] operator and the
        // expected output energy are bounded together
        let scale = joint_gain_scale(&main, &residual, &cy, self.config.max_gain);
        if scale < 1.0 {
            main *= c(scale);
            residual *= c(scale);
            guard_events += 1;
        }

        MixingMatrices {
            main,
            residual,
            guard_events,
        }
    }
}

fn hermitian_part(m: &Mat2) -> Mat2 {
    (m + m.adjoint()) * c(0.5)
}

/// Scale `m` down so that its largest singular value is at most `cap`
fn cap_gain(m: &mut Mat2, cap: f32) -> bool {
    let sigma = max_singular_value(m);
    if sigma > cap {
        *m *= c(cap / sigma);
        true
    } else {
        false
    }
}

/// Factor (≤ 1) that keeps `[main | residual]` within `cap`
///
/// Bounds the largest singular value of the stacked 2×4 operator and the
/// ratio of expected output energy `tr(M Cy Mᴴ + Mr diag(Cy) Mrᴴ)` to `tr(Cy)`.
fn joint_gain_scale(main: &Mat2, residual: &Mat2, cy: &Mat2, cap: f32) -> f32 {
    let cap2 = cap * cap;

    let gram = main * main.adjoint() + residual * residual.adjoint();
    let sigma2 = hermitian_max_eigenvalue(&gram);

    let mut diag_cy = Mat2::zeros();
    for i in 0..2 {
        diag_cy[(i, i)] = c(cy[(i, i)].re.max(0.0));
    }
    let out = main * cy * main.adjoint() + residual * diag_cy * residual.adjoint();
    let ratio = out.trace().re / cy.trace().re.max(ENERGY_EPSILON);

    let worst = sigma2.max(ratio);
    if worst > cap2 { (cap2 / worst).sqrt() } else { 1.0 }
}

/// Largest eigenvalue of a Hermitian 2×2 matrix (closed form)
pub fn hermitian_max_eigenvalue(a: &Mat2) -> f32 {
    let h = hermitian_part(a);
    let p = h[(0, 0)].re;
    let q = h[(1, 1)].re;
    0.5 * (p + q) + (0.25 * (p - q) * (p - q) + h[(0, 1)].norm_sqr()).sqrt()
}

/// Square root of a 2×2 Hermitian PSD matrix (closed form)
///
/// `sqrt(A) = (A + sI) / t` with `s = sqrt(det A)`, `t = sqrt(tr A + 2s)`.
pub fn sqrtm_psd(a: &Mat2) -> Mat2 {
    let det = (a[(0, 0)] * a[(1, 1)] - a[(0, 1)] * a[(1, 0)]).re.max(0.0);
    let s = det.sqrt();
    let t2 = a.trace().re + 2.0 * s;
    if t2 <= ENERGY_EPSILON {
        return Mat2::zeros();
    }
    let t = t2.sqrt();
    (a + Mat2::identity() * c(s)) * c(1.0 / t)
}

/// Nearest PSD matrix: negative eigenvalues of a Hermitian 2×2 set to zero
pub fn psd_projection(a: &Mat2) -> Mat2 {
    let h = hermitian_part(a);
    let p = h[(0, 0)].re;
    let q = h[(1, 1)].re;
    let b = h[(0, 1)];

    let mean = 0.5 * (p + q);
    let radius = (0.25 * (p - q) * (p - q) + b.norm_sqr()).sqrt();
    let lambda_max = mean + radius;
    let lambda_min = mean - radius;

    if lambda_min >= 0.0 {
        return h;
    }
    if lambda_max <= 0.0 {
        return Mat2::zeros();
    }

    // Eigenvector of lambda_max
    let mut v0 = b;
    let mut v1 = c(lambda_max - p);
    let norm = (v0.norm_sqr() + v1.norm_sqr()).sqrt();
    if norm <= f32::MIN_POSITIVE {
        if p >= q {
            v0 = c(1.0);
            v1 = c(0.0);
        } else {
            v0 = c(0.0);
            v1 = c(1.0);
        }
    } else {
        v0 /= norm;
        v1 /= norm;
    }

    Mat2::new(
        v0 * v0.conj(),
        v0 * v1.conj(),
        v1 * v0.conj(),
        v1 * v1.conj(),
    ) * c(lambda_max)
}

/// Largest singular value of a 2×2 matrix (closed form)
pub fn max_singular_value(m: &Mat2) -> f32 {
    let frob = m.iter().map(|x| x.norm_sqr()).sum::<f32>();
    let det = (m[(0, 0)] * m[(1, 1)] - m[(0, 1)] * m[(1, 0)]).norm();
    let disc = (frob * frob - 4.0 * det * det).max(0.0);
    (0.5 * (frob + disc.sqrt())).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cov(a: f32, b: Complex32, d: f32) -> Mat2 {
        Mat2::new(c(a), b, b.conj(), c(d))
    }

    fn close(a: &Mat2, b: &Mat2, tol: f32) -> bool {
        (a - b).norm() <= tol * b.norm().max(1.0)
    }

    #[test]
    fn test_sqrtm_psd() {
        let a = cov(2.0, Complex32::new(0.3, 0.2), 1.5);
        let s = sqrtm_psd(&a);
        assert!(close(&(s * s), &a, 1e-5));
        assert!(close(&s, &s.adjoint(), 1e-6));

        // Rank one
        let v = nalgebra::Vector2::new(c(1.0), Complex32::new(0.0, 2.0));
        let r1 = v * v.adjoint();
        let s = sqrtm_psd(&r1);
        assert!(close(&(s * s), &r1, 1e-5));
    }

    #[test]
    fn test_psd_projection() {
        let a = cov(1.0, c(0.0), -0.5);
        let p = psd_projection(&a);
        assert!(close(&p, &cov(1.0, c(0.0), 0.0), 1e-6));

        let psd = cov(2.0, Complex32::new(0.1, 0.5), 1.0);
        assert!(close(&psd_projection(&psd), &psd, 1e-6));

        let neg = cov(-1.0, c(0.0), -2.0);
        assert_eq!(psd_projection(&neg), Mat2::zeros());
    }

    #[test]
    fn test_max_singular_value() {
        let m = Mat2::new(c(3.0), c(0.0), c(0.0), c(-1.0));
        assert!((max_singular_value(&m) - 3.0).abs() < 1e-5);

        let m = Mat2::new(Complex32::new(1.0, 1.0), c(2.0), c(0.5), Complex32::new(0.0, -1.0));
        let svd = m.svd(false, false);
        let expected = svd.singular_values[0].max(svd.singular_values[1]);
        assert!((max_singular_value(&m) - expected).abs() < 1e-4);
    }

    #[test]
    fn test_identity_when_target_equals_input() {
        let mixer = CovarianceMixer::default();
        let cy = cov(2.0, Complex32::new(0.3, 0.2), 1.5);
        let m = mixer.compute(&cy, &cy);
        assert!(close(&m.main, &Mat2::identity(), 1e-3), "{}", m.main);
        assert!(!m.has_residual());
        assert_eq!(m.guard_events, 0);
    }

    #[test]
    fn test_reaches_target_covariance() {
        let mixer = CovarianceMixer::default();
        let cy = cov(1.0, Complex32::new(0.2, -0.1), 1.2);
        let target = cov(1.5, Complex32::new(0.6, 0.3), 0.8);
        let m = mixer.compute(&cy, &target);
        let produced = m.main * cy * m.main.adjoint();
        assert!(close(&produced, &target, 1e-3));
        assert_eq!(m.guard_events, 0);
    }

    #[test]
    fn test_residual_fills_decorrelated_target() {
        // Fully coherent input, fully incoherent target
        let v = nalgebra::Vector2::new(c(1.0), c(1.0));
        let cy = v * v.adjoint();
        let target = cov(1.0, c(0.0), 1.0);
        let m = CovarianceMixer::default().compute(&cy, &target);

        // Decorrelated stream has the per-ear energies of y and no cross term
        let cd = cov(1.0, c(0.0), 1.0);
        let total = m.main * cy * m.main.adjoint() + m.residual * cd * m.residual.adjoint();
        assert!(m.has_residual());
        assert!(close(&total, &target, 1e-2), "{}", total);
    }

    #[test]
    fn test_gain_is_capped() {
        let mixer = CovarianceMixer::new(MixerConfig::new(0.2, 12.0));
        let cy = cov(1e-3, c(0.0), 1e-3);
        let target = cov(10.0, c(0.0), 10.0);
        let m = mixer.compute(&cy, &target);
        let cap = db_to_linear(12.0);
        assert!(max_singular_value(&m.main) <= cap * 1.0001);
        assert!(max_singular_value(&m.residual) <= cap * 1.0001);
        assert!(m.guard_events > 0);
    }

    #[test]
    fn test_joint_cap_bounds_total_energy() {
        let cap = db_to_linear(12.0);
        let mixer = CovarianceMixer::new(MixerConfig::new(0.2, 12.0));
        let cy = cov(1.0, c(0.0), 1.0);
        let target = cov(100.0, c(0.0), 100.0);
        let m = mixer.compute(&cy, &target);

        // Decorrelated stream carries the per-ear energies of y
        let total = m.main * cy * m.main.adjoint() + m.residual * cy * m.residual.adjoint();
        assert!(total.trace().re <= cap * cap * cy.trace().re * 1.001, "{}", total);

        let gram = m.main * m.main.adjoint() + m.residual * m.residual.adjoint();
        assert!(hermitian_max_eigenvalue(&gram) <= cap * cap * 1.001);
        assert!(m.guard_events > 0);
    }

    #[test]
    fn test_joint_cap_with_residual() {
        // Coherent input pushed towards a much louder incoherent target
        let cap = db_to_linear(12.0);
        let v = nalgebra::Vector2::new(c(1.0), c(1.0));
        let cy = v * v.adjoint();
        let target = cov(40.0, c(0.0), 40.0);
        let m = CovarianceMixer::default().compute(&cy, &target);

        let cd = cov(1.0, c(0.0), 1.0);
        let total = m.main * cy * m.main.adjoint() + m.residual * cd * m.residual.adjoint();
        assert!(m.has_residual());
        assert!(total.trace().re <= cap * cap * cy.trace().re * 1.001, "{}", total);
    }

    #[test]
    fn test_hermitian_max_eigenvalue() {
        let a = cov(2.0, Complex32::new(0.0, 1.0), 2.0);
        assert!((hermitian_max_eigenvalue(&a) - 3.0).abs() < 1e-5);
    }

    #[test]
    fn test_silence_is_identity() {
        let m = CovarianceMixer::default().compute(&Mat2::zeros(), &Mat2::zeros());
        assert_eq!(m, MixingMatrices::identity());
    }

    #[test]
    fn test_apply() {
        let m = MixingMatrices {
            main: Mat2::new(c(1.0), c(2.0), c(0.0), c(1.0)),
            residual: Mat2::new(c(0.0), c(0.0), c(1.0), c(0.0)),
            guard_events: 0,
        };
        let out = m.apply([c(1.0), c(1.0)], [c(3.0), c(0.0)]);
        assert_eq!(out, [c(3.0), c(4.0)]);
    }
}
