//! Time-frequency transform seam and the reference STFT filterbank
//!
//! The engine only sees [`TfFrame`]s. Any transform with a fixed band
//! layout can be plugged in through [`TimeFrequencyTransform`].

use std::f32::consts::PI;
use std::sync::Arc;

use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::error::{CropacError, CropacResult};

/// Default hop size in samples
pub const DEFAULT_HOP_SIZE: usize = 128;

/// Default number of time slots per frame
pub const DEFAULT_TIME_SLOTS: usize = 4;

// ═══════════════════════════════════════════════════════════════════════════════
// TF FRAME
// ═══════════════════════════════════════════════════════════════════════════════

/// Dense `[band][channel][slot]` array of complex samples
#[derive(Debug, Clone)]
pub struct TfFrame {
    num_bands: usize,
    num_channels: usize,
    time_slots: usize,
    data: Vec<Complex32>,
}

impl TfFrame {
    /// Zero-filled frame
    pub fn new(num_bands: usize, num_channels: usize, time_slots: usize) -> Self {
        Self {
            num_bands,
            num_channels,
            time_slots,
            data: vec![Complex32::new(0.0, 0.0); num_bands * num_channels * time_slots],
        }
    }

    pub fn num_bands(&self) -> usize {
        self.num_bands
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn time_slots(&self) -> usize {
        self.time_slots
    }

    #[inline]
    fn index(&self, band: usize, channel: usize, slot: usize) -> usize {
        (band * self.num_channels + channel) * self.time_slots + slot
    }

    #[inline]
    pub fn get(&self, band: usize, channel: usize, slot: usize) -> Complex32 {
        self.data[self.index(band, channel, slot)]
    }

    #[inline]
    pub fn set(&mut self, band: usize, channel: usize, slot: usize, value: Complex32) {
        let idx = self.index(band, channel, slot);
        self.data[idx] = value;
    }

    /// All channels of one band, laid out `[channel][slot]`
    pub fn band(&self, band: usize) -> &[Complex32] {
        let len = self.band_len();
        &self.data[band * len..(band + 1) * len]
    }

    /// Mutable view of one band
    pub fn band_mut(&mut self, band: usize) -> &mut [Complex32] {
        let len = self.band_len();
        &mut self.data[band * len..(band + 1) * len]
    }

    /// Samples per band (`channels * slots`)
    pub fn band_len(&self) -> usize {
        self.num_channels * self.time_slots
    }

    /// Raw storage, band-major
    pub fn as_slice(&self) -> &[Complex32] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [Complex32] {
        &mut self.data
    }

    /// Zero all samples
    pub fn clear(&mut self) {
        self.data.fill(Complex32::new(0.0, 0.0));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TRANSFORM TRAIT
// ═══════════════════════════════════════════════════════════════════════════════

/// Analysis/synthesis filterbank used by the processor
pub trait TimeFrequencyTransform: Send {
    /// Number of frequency bands
    fn num_bands(&self) -> usize;

    /// Samples per time slot
    fn hop_size(&self) -> usize;

    /// Time slots per frame
    fn time_slots(&self) -> usize;

    /// Samples per frame
    fn frame_size(&self) -> usize {
        self.hop_size() * self.time_slots()
    }

    /// Band centre frequencies in Hz
    fn band_frequencies(&self) -> &[f32];

    /// Analysis + synthesis delay in samples
    fn processing_delay(&self) -> usize;

    /// Time domain → TF. `input` holds one slice per channel.
    fn forward(&mut self, input: &[&[f32]], output: &mut TfFrame) -> CropacResult<()>;

    /// TF → time domain
    fn inverse(&mut self, input: &TfFrame, output: &mut [&mut [f32]]) -> CropacResult<()>;

    /// Clear analysis and overlap-add state
    fn reset(&mut self);

    /// Follow a host sample rate change (band count stays the same)
    fn set_sample_rate(&mut self, _sample_rate: u32) {}
}

// ═══════════════════════════════════════════════════════════════════════════════
// STFT FILTERBANK
// ═══════════════════════════════════════════════════════════════════════════════

/// Uniform STFT: FFT of twice the hop, sqrt-Hann windows, 50 % overlap
///
/// Analysis and synthesis windows multiply to a periodic Hann, so the
/// overlap-add reconstructs the input delayed by one hop.
pub struct StftFilterbank {
    hop_size: usize,
    time_slots: usize,
    num_inputs: usize,
    num_outputs: usize,
    freqs: Vec<f32>,
    window: Vec<f32>,
    fft_forward: Arc<dyn RealToComplex<f32>>,
    fft_inverse: Arc<dyn ComplexToReal<f32>>,
    /// Last `2 * hop` input samples per channel
    history: Vec<Vec<f32>>,
    /// Overlap-add accumulators per output channel
    overlap: Vec<Vec<f32>>,
    time_buf: Vec<f32>,
    spectrum_buf: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl StftFilterbank {
    pub fn new(
        sample_rate: u32,
        hop_size: usize,
        time_slots: usize,
        num_inputs: usize,
        num_outputs: usize,
    ) -> CropacResult<Self> {
        if hop_size < 2 || !hop_size.is_power_of_two() {
            return Err(CropacError::config(format!(
                "hop size must be a power of two >= 2, got {}",
                hop_size
            )));
        }
        if time_slots == 0 {
            return Err(CropacError::config("time slots must be at least 1"));
        }
        if sample_rate == 0 {
            return Err(CropacError::config("sample rate is zero"));
        }

        let fft_size = 2 * hop_size;
        let mut planner = RealFftPlanner::<f32>::new();
        let fft_forward = planner.plan_fft_forward(fft_size);
        let fft_inverse = planner.plan_fft_inverse(fft_size);

        // Periodic sqrt-Hann
        let window = (0..fft_size)
            .map(|i| (0.5 * (1.0 - (2.0 * PI * i as f32 / fft_size as f32).cos())).sqrt())
            .collect();

        let bin_width = sample_rate as f32 / fft_size as f32;
        let freqs = (0..=hop_size).map(|k| k as f32 * bin_width).collect();

        let scratch_len = fft_forward
            .get_scratch_len()
            .max(fft_inverse.get_scratch_len());

        Ok(Self {
            hop_size,
            time_slots,
            num_inputs,
            num_outputs,
            freqs,
            window,
            time_buf: fft_forward.make_input_vec(),
            spectrum_buf: fft_forward.make_output_vec(),
            scratch: vec![Complex32::new(0.0, 0.0); scratch_len],
            fft_forward,
            fft_inverse,
            history: vec![vec![0.0; fft_size]; num_inputs],
            overlap: vec![vec![0.0; fft_size]; num_outputs],
        })
    }

    fn fft_size(&self) -> usize {
        2 * self.hop_size
    }

    fn check_frame(&self, frame: &TfFrame, channels: usize) -> CropacResult<()> {
        if frame.num_bands() != self.num_bands() {
            return Err(CropacError::TransformMismatch {
                decoder_bands: frame.num_bands(),
                transform_bands: self.num_bands(),
            });
        }
        if frame.num_channels() != channels {
            return Err(CropacError::InvalidChannelCount {
                expected: channels,
                got: frame.num_channels(),
            });
        }
        if frame.time_slots() != self.time_slots {
            return Err(CropacError::BufferSizeMismatch {
                expected: self.time_slots,
                got: frame.time_slots(),
            });
        }
        Ok(())
    }
}

impl TimeFrequencyTransform for StftFilterbank {
    fn num_bands(&self) -> usize {
        self.hop_size + 1
    }

    fn hop_size(&self) -> usize {
        self.hop_size
    }

    fn time_slots(&self) -> usize {
        self.time_slots
    }

    fn band_frequencies(&self) -> &[f32] {
        &self.freqs
    }

    fn processing_delay(&self) -> usize {
        self.hop_size
    }

    fn forward(&mut self, input: &[&[f32]], output: &mut TfFrame) -> CropacResult<()> {
        if input.len() != self.num_inputs {
            return Err(CropacError::InvalidChannelCount {
                expected: self.num_inputs,
                got: input.len(),
            });
        }
        let frame_size = self.frame_size();
        if let Some(bad) = input.iter().find(|ch| ch.len() != frame_size) {
            return Err(CropacError::BufferSizeMismatch {
                expected: frame_size,
                got: bad.len(),
            });
        }
        self.check_frame(output, self.num_inputs)?;

        let hop = self.hop_size;
        for (ch, samples) in input.iter().enumerate() {
            for slot in 0..self.time_slots {
                let history = &mut self.history[ch];
                history.copy_within(hop.., 0);
                history[hop..].copy_from_slice(&samples[slot * hop..(slot + 1) * hop]);

                for ((t, &h), &w) in self.time_buf.iter_mut().zip(history.iter()).zip(&self.window) {
                    *t = h * w;
                }
                self.fft_forward.process_with_scratch(
                    &mut self.time_buf,
                    &mut self.spectrum_buf,
                    &mut self.scratch,
                )?;

                for (band, &bin) in self.spectrum_buf.iter().enumerate() {
                    output.set(band, ch, slot, bin);
                }
            }
        }
        Ok(())
    }

    fn inverse(&mut self, input: &TfFrame, output: &mut [&mut [f32]]) -> CropacResult<()> {
        if output.len() != self.num_outputs {
            return Err(CropacError::InvalidChannelCount {
                expected: self.num_outputs,
                got: output.len(),
            });
        }
        let frame_size = self.frame_size();
        if let Some(bad) = output.iter().find(|ch| ch.len() != frame_size) {
            return Err(CropacError::BufferSizeMismatch {
                expected: frame_size,
                got: bad.len(),
            });
        }
        self.check_frame(input, self.num_outputs)?;

        let hop = self.hop_size;
        let last = self.hop_size;
        let norm = 1.0 / self.fft_size() as f32;
        for (ch, samples) in output.iter_mut().enumerate() {
            for slot in 0..self.time_slots {
                for (band, bin) in self.spectrum_buf.iter_mut().enumerate() {
                    *bin = input.get(band, ch, slot);
                }
                // A real signal has real DC and Nyquist bins
                self.spectrum_buf[0].im = 0.0;
                self.spectrum_buf[last].im = 0.0;

                self.fft_inverse.process_with_scratch(
                    &mut self.spectrum_buf,
                    &mut self.time_buf,
                    &mut self.scratch,
                )?;

                let overlap = &mut self.overlap[ch];
                for ((acc, &t), &w) in overlap.iter_mut().zip(&self.time_buf).zip(&self.window) {
                    *acc += t * w * norm;
                }
                samples[slot * hop..(slot + 1) * hop].copy_from_slice(&overlap[..hop]);
                overlap.copy_within(hop.., 0);
                overlap[hop..].fill(0.0);
            }
        }
        Ok(())
    }

    fn set_sample_rate(&mut self, sample_rate: u32) {
        let bin_width = sample_rate as f32 / self.fft_size() as f32;
        for (k, f) in self.freqs.iter_mut().enumerate() {
            *f = k as f32 * bin_width;
        }
    }

    fn reset(&mut self) {
        for h in &mut self.history {
            h.fill(0.0);
        }
        for o in &mut self.overlap {
            o.fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, fs: f32, len: usize, offset: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * (i + offset) as f32 / fs).sin())
            .collect()
    }

    #[test]
    fn test_band_layout() {
        let stft = StftFilterbank::new(48000, 128, 4, 4, 2).unwrap();
        assert_eq!(stft.num_bands(), 129);
        assert_eq!(stft.frame_size(), 512);
        assert_eq!(stft.processing_delay(), 128);
        assert_eq!(stft.band_frequencies()[0], 0.0);
        assert!((stft.band_frequencies()[128] - 24000.0).abs() < 1e-3);
    }

    #[test]
    fn test_invalid_hop_rejected() {
        assert!(StftFilterbank::new(48000, 100, 4, 1, 1).is_err());
        assert!(StftFilterbank::new(48000, 128, 0, 1, 1).is_err());
    }

    #[test]
    fn test_perfect_reconstruction() {
        let hop = 64;
        let slots = 4;
        let frame = hop * slots;
        let mut stft = StftFilterbank::new(48000, hop, slots, 1, 1).unwrap();
        let mut tf = TfFrame::new(stft.num_bands(), 1, slots);
        let mut out = vec![0.0f32; frame];

        let blocks = 8;
        let mut input_all = Vec::new();
        let mut output_all = Vec::new();
        for b in 0..blocks {
            let block = sine(1000.0, 48000.0, frame, b * frame);
            stft.forward(&[block.as_slice()], &mut tf).unwrap();
            stft.inverse(&tf, &mut [out.as_mut_slice()]).unwrap();
            input_all.extend_from_slice(&block);
            output_all.extend_from_slice(&out);
        }

        let delay = stft.processing_delay();
        for i in frame..input_all.len() {
            assert!(
                (output_all[i] - input_all[i - delay]).abs() < 1e-4,
                "sample {}: {} vs {}",
                i,
                output_all[i],
                input_all[i - delay]
            );
        }
    }

    #[test]
    fn test_sine_lands_in_its_band() {
        let hop = 128;
        let mut stft = StftFilterbank::new(48000, hop, 4, 1, 1).unwrap();
        let mut tf = TfFrame::new(stft.num_bands(), 1, 4);
        // Bin 16 at 187.5 Hz spacing
        let block = sine(3000.0, 48000.0, 512, 0);
        stft.forward(&[block.as_slice()], &mut tf).unwrap();
        stft.forward(&[block.as_slice()], &mut tf).unwrap();

        let peak = (0..stft.num_bands())
            .max_by(|&a, &b| tf.get(a, 0, 3).norm().total_cmp(&tf.get(b, 0, 3).norm()))
            .unwrap();
        assert_eq!(peak, 16);
    }

    #[test]
    fn test_shape_errors() {
        let mut stft = StftFilterbank::new(48000, 128, 4, 4, 2).unwrap();
        let mut tf = TfFrame::new(129, 4, 4);
        let short = vec![0.0f32; 100];
        let full = vec![0.0f32; 512];

        assert!(matches!(
            stft.forward(&[&full[..], &full[..]], &mut tf),
            Err(CropacError::InvalidChannelCount { expected: 4, got: 2 })
        ));
        assert!(matches!(
            stft.forward(&[&full[..], &full[..], &full[..], &short[..]], &mut tf),
            Err(CropacError::BufferSizeMismatch { expected: 512, got: 100 })
        ));
    }

    #[test]
    fn test_inverse_accepts_complex_edge_bins() {
        // Mixing rotates DC and Nyquist off the real axis; realfft rejects that
        let mut stft = StftFilterbank::new(48000, 64, 2, 1, 1).unwrap();
        let mut tf = TfFrame::new(stft.num_bands(), 1, 2);
        let last = stft.num_bands() - 1;
        for slot in 0..2 {
            tf.set(0, 0, slot, Complex32::new(0.5, 0.25));
            tf.set(last, 0, slot, Complex32::new(-0.5, 0.75));
        }
        let mut out = vec![0.0f32; 128];
        assert!(stft.inverse(&tf, &mut [out.as_mut_slice()]).is_ok());
        assert!(out.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn test_reset_clears_tail() {
        let mut stft = StftFilterbank::new(48000, 64, 2, 1, 1).unwrap();
        let mut tf = TfFrame::new(stft.num_bands(), 1, 2);
        let mut out = vec![0.0f32; 128];
        let block = vec![1.0f32; 128];

        stft.forward(&[block.as_slice()], &mut tf).unwrap();
        stft.inverse(&tf, &mut [out.as_mut_slice()]).unwrap();
        stft.reset();

        let silence = vec![0.0f32; 128];
        stft.forward(&[silence.as_slice()], &mut tf).unwrap();
        stft.inverse(&tf, &mut [out.as_mut_slice()]).unwrap();
        assert!(out.iter().all(|s| s.abs() < 1e-6));
    }
}
