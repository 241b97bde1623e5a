//! Per-band decorrelator for the residual stream
//!
//! Each ear gets a different integer slot delay plus a fixed phase
//! rotation, so the two outputs are mutually incoherent and incoherent with
//! the undelayed input while keeping its energy.

use num_complex::Complex32;

use crate::format::NUM_EARS;

/// Ring length in slots (longest delay + 1)
const RING_SLOTS: usize = 12;

/// Shortest delay in slots
const MIN_DELAY: usize = 2;

/// Golden-ratio increments used to spread the phase rotations over bands
const PHASE_STEP_LEFT: f32 = 0.618_034;
const PHASE_STEP_RIGHT: f32 = 0.381_966;

/// Decorrelation filter state for one band
#[derive(Debug, Clone)]
pub struct BandDecorrelator {
    ring: [[Complex32; RING_SLOTS]; NUM_EARS],
    pos: usize,
    delays: [usize; NUM_EARS],
    rotations: [Complex32; NUM_EARS],
}

impl BandDecorrelator {
    pub fn new(band: usize) -> Self {
        let left = MIN_DELAY + (3 * band) % 5;
        let right = left + 2 + band % 3;

        let phase = |step: f32, offset: f32| {
            let x = band as f32 * step + offset;
            std::f32::consts::PI * (x - x.floor())
        };

        Self {
            ring: [[Complex32::new(0.0, 0.0); RING_SLOTS]; NUM_EARS],
            pos: 0,
            delays: [left, right],
            rotations: [
                Complex32::from_polar(1.0, phase(PHASE_STEP_LEFT, 0.25)),
                Complex32::from_polar(1.0, -phase(PHASE_STEP_RIGHT, 0.5)),
            ],
        }
    }

    /// Delays in slots, `[left, right]`
    pub fn delays(&self) -> [usize; NUM_EARS] {
        self.delays
    }

    /// Push one slot, get the decorrelated slot back
    #[inline]
    pub fn process(&mut self, input: [Complex32; NUM_EARS]) -> [Complex32; NUM_EARS] {
        let mut out = [Complex32::new(0.0, 0.0); NUM_EARS];
        for ear in 0..NUM_EARS {
            self.ring[ear][self.pos] = input[ear];
            let read = (self.pos + RING_SLOTS - self.delays[ear]) % RING_SLOTS;
            out[ear] = self.ring[ear][read] * self.rotations[ear];
        }
        self.pos = (self.pos + 1) % RING_SLOTS;
        out
    }

    pub fn reset(&mut self) {
        for ring in &mut self.ring {
            ring.fill(Complex32::new(0.0, 0.0));
        }
        self.pos = 0;
    }
}
