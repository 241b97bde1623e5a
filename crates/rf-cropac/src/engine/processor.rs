//! Real-time half of the engine
//!
//! Per block: validate → adopt new decode set → snapshot parameters →
//! forward transform → N3D conversion → rotation → per-band decode,
//! analysis and mixing → inverse transform.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use nalgebra::Vector4;
use num_complex::Complex32;
use rayon::prelude::*;
use rtrb::{Consumer, Producer, PushError};

use super::{Codec, Diagnostics, EngineStatus};
use crate::analyzer::{BandAnalysisState, analyze_tile};
use crate::config::CropacConfig;
use crate::decoder::DecodeMatrices;
use crate::decorrelator::BandDecorrelator;
use crate::error::{CropacError, CropacResult};
use crate::format::{NUM_EARS, NUM_SH_SIGNALS};
use crate::mixer::{CovarianceMixer, MixingMatrices};
use crate::params::CropacParams;
use crate::rotator::Rotator;
use crate::state::ParamReader;
use crate::transform::{TfFrame, TimeFrequencyTransform};

/// Signal state exclusively owned by one band
#[derive(Debug, Clone)]
struct BandState {
    analysis: BandAnalysisState,
    decorrelator: BandDecorrelator,
}

impl BandState {
    fn new(band: usize) -> Self {
        Self {
            analysis: BandAnalysisState::default(),
            decorrelator: BandDecorrelator::new(band),
        }
    }

    fn reset(&mut self) {
        self.analysis.reset();
        self.decorrelator.reset();
    }
}

/// Read-only inputs shared by all bands of a block
struct BandContext<'a> {
    decoder: &'a DecodeMatrices,
    params: &'a CropacParams,
    mixer: &'a CovarianceMixer,
    post_gain: f32,
    time_slots: usize,
}

impl BandContext<'_> {
    /// Decode, analyse and mix one band; returns the guard event count
    fn process_band(
        &self,
        band: usize,
        sh: &[Complex32],
        out: &mut [Complex32],
        state: &mut BandState,
    ) -> u32 {
        let slots = self.time_slots;
        let decoder = self.decoder.matrix(band);
        let analysis = analyze_tile(
            sh,
            slots,
            decoder,
            &self.params.analysis(band),
            &mut state.analysis,
        );

        let mixing = if analysis.silent {
            MixingMatrices::identity()
        } else {
            self.mixer.compute(&analysis.linear_cov, &analysis.target)
        };

        let gain = self.params.band_eq(band) * self.post_gain;
        for slot in 0..slots {
            let x = Vector4::from_fn(|ch, _| sh[ch * slots + slot]);
            let y = decoder * x;
            let linear = [y[0], y[1]];
            let decorrelated = state.decorrelator.process(linear);
            let mixed = mixing.apply(linear, decorrelated);
            for ear in 0..NUM_EARS {
                out[ear * slots + slot] = mixed[ear] * gain;
            }
        }
        mixing.guard_events
    }
}

/// Audio-thread processor
pub struct CropacProcessor {
    transform: Box<dyn TimeFrequencyTransform>,
    params: ParamReader<CropacParams>,
    status: Arc<EngineStatus>,
    codec_rx: Consumer<Box<Codec>>,
    retired_tx: Producer<Box<Codec>>,
    codec: Option<Box<Codec>>,
    /// Replaced decode set the return ring had no room for
    retiring: Option<Box<Codec>>,
    rotator: Rotator,
    mixer: CovarianceMixer,
    post_gain: f32,
    parallel_bands: bool,
    bands: Vec<BandState>,
    sh_frame: TfFrame,
    ear_frame: TfFrame,
}

impl CropacProcessor {
    pub(crate) fn new(
        config: &CropacConfig,
        transform: Box<dyn TimeFrequencyTransform>,
        params: ParamReader<CropacParams>,
        status: Arc<EngineStatus>,
        codec_rx: Consumer<Box<Codec>>,
        retired_tx: Producer<Box<Codec>>,
    ) -> Self {
        let num_bands = transform.num_bands();
        let slots = transform.time_slots();
        Self {
            params,
            status,
            codec_rx,
            retired_tx,
            codec: None,
            retiring: None,
            rotator: Rotator::new(),
            mixer: CovarianceMixer::new(config.mixer()),
            post_gain: config.post_gain(),
            parallel_bands: config.parallel_bands,
            bands: (0..num_bands).map(BandState::new).collect(),
            sh_frame: TfFrame::new(num_bands, NUM_SH_SIGNALS, slots),
            ear_frame: TfFrame::new(num_bands, NUM_EARS, slots),
            transform,
        }
    }

    /// Render one block of `frame_size` samples
    ///
    /// `input` holds the four ambisonic channels (ACN), `output` the left
    /// and right ear. On a band-layout mismatch the block is silent and
    /// re-initialization is requested.
    pub fn process(&mut self, input: &[&[f32]], output: &mut [&mut [f32]]) -> CropacResult<()> {
        if input.len() != NUM_SH_SIGNALS {
            return Err(CropacError::InvalidChannelCount {
                expected: NUM_SH_SIGNALS,
                got: input.len(),
            });
        }
        if output.len() != NUM_EARS {
            return Err(CropacError::InvalidChannelCount {
                expected: NUM_EARS,
                got: output.len(),
            });
        }
        let frame_size = self.frame_size();
        if let Some(bad) = input
            .iter()
            .map(|c| c.len())
            .chain(output.iter().map(|c| c.len()))
            .find(|&len| len != frame_size)
        {
            return Err(CropacError::BufferSizeMismatch {
                expected: frame_size,
                got: bad,
            });
        }

        self.transform.forward(input, &mut self.sh_frame)?;
        if let Err(e) = self.render() {
            for channel in output.iter_mut() {
                channel.fill(0.0);
            }
            self.transform.reset();
            return Err(e);
        }
        self.transform.inverse(&self.ear_frame, output)
    }

    /// Render one frame already in the TF domain
    ///
    /// `input` must have the transform's band/slot layout with four
    /// channels, `output` two channels.
    pub fn process_tf(&mut self, input: &TfFrame, output: &mut TfFrame) -> CropacResult<()> {
        for (frame, channels) in [(input, NUM_SH_SIGNALS), (&*output, NUM_EARS)] {
            if frame.num_channels() != channels {
                return Err(CropacError::InvalidChannelCount {
                    expected: channels,
                    got: frame.num_channels(),
                });
            }
            if frame.time_slots() != self.sh_frame.time_slots() {
                return Err(CropacError::BufferSizeMismatch {
                    expected: self.sh_frame.time_slots(),
                    got: frame.time_slots(),
                });
            }
            if frame.num_bands() != self.sh_frame.num_bands() {
                return Err(CropacError::TransformMismatch {
                    decoder_bands: frame.num_bands(),
                    transform_bands: self.sh_frame.num_bands(),
                });
            }
        }

        self.sh_frame.as_mut_slice().copy_from_slice(input.as_slice());
        let result = self.render();
        if result.is_err() {
            output.clear();
            return result;
        }
        output.as_mut_slice().copy_from_slice(self.ear_frame.as_slice());
        Ok(())
    }

    /// Core: `sh_frame` → `ear_frame`
    fn render(&mut self) -> CropacResult<()> {
        self.adopt_codecs();
        self.status.blocks_processed.fetch_add(1, Ordering::Relaxed);

        let Self {
            params,
            status,
            codec,
            rotator,
            mixer,
            post_gain,
            parallel_bands,
            bands,
            sh_frame,
            ear_frame,
            ..
        } = self;
        let params = params.read();

        let Some(codec) = codec.as_deref() else {
            omni_passthrough(sh_frame, ear_frame);
            status.passthrough_blocks.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        };

        let decoder = &codec.decoder;
        if decoder.num_bands() != sh_frame.num_bands() {
            ear_frame.clear();
            status.transform_mismatches.fetch_add(1, Ordering::Relaxed);
            status.request_reinit();
            return Err(CropacError::TransformMismatch {
                decoder_bands: decoder.num_bands(),
                transform_bands: sh_frame.num_bands(),
            });
        }

        if !params.format.normalization.is_n3d() {
            to_n3d(sh_frame, params.format.normalization.to_n3d_gains());
        }

        rotator.update(&params.rotation);
        rotator.rotate_tf(sh_frame);

        let time_slots = sh_frame.time_slots();
        let ctx = BandContext {
            decoder,
            params,
            mixer,
            post_gain: *post_gain,
            time_slots,
        };

        let sh_len = sh_frame.band_len();
        let ear_len = ear_frame.band_len();
        let guard_events: u32 = if *parallel_bands {
            ear_frame
                .as_mut_slice()
                .par_chunks_mut(ear_len)
                .zip(sh_frame.as_slice().par_chunks(sh_len))
                .zip(bands.par_iter_mut())
                .enumerate()
                .map(|(band, ((out, sh), state))| ctx.process_band(band, sh, out, state))
                .sum()
        } else {
            ear_frame
                .as_mut_slice()
                .chunks_mut(ear_len)
                .zip(sh_frame.as_slice().chunks(sh_len))
                .zip(bands.iter_mut())
                .enumerate()
                .map(|(band, ((out, sh), state))| ctx.process_band(band, sh, out, state))
                .sum()
        };

        if guard_events > 0 {
            status
                .guard_events
                .fetch_add(u64::from(guard_events), Ordering::Relaxed);
        }
        Ok(())
    }

    /// Swap in the newest decode set, hand the old one back
    ///
    /// Decode sets are never dropped here. While a replaced set is waiting
    /// for room in the return ring, no newer set is adopted.
    fn adopt_codecs(&mut self) {
        if let Some(old) = self.retiring.take() {
            if let Err(PushError::Full(old)) = self.retired_tx.push(old) {
                self.retiring = Some(old);
                return;
            }
        }
        while let Ok(next) = self.codec_rx.pop() {
            self.status
                .codec_generation
                .store(next.generation, Ordering::Relaxed);
            if let Some(old) = self.codec.replace(next) {
                if let Err(PushError::Full(old)) = self.retired_tx.push(old) {
                    self.retiring = Some(old);
                    return;
                }
            }
        }
    }

    /// Host flush: clear covariances, decorrelators and transform state
    pub fn reset(&mut self) {
        for band in &mut self.bands {
            band.reset();
        }
        self.transform.reset();
        self.sh_frame.clear();
        self.ear_frame.clear();
        self.status.request_reinit();
    }

    /// Follow a sample rate change (signal state is cleared)
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.transform.set_sample_rate(sample_rate);
        self.reset();
    }

    pub fn frame_size(&self) -> usize {
        self.transform.frame_size()
    }

    pub fn processing_delay(&self) -> usize {
        self.transform.processing_delay()
    }

    pub fn num_bands(&self) -> usize {
        self.transform.num_bands()
    }

    pub fn band_frequencies(&self) -> &[f32] {
        self.transform.band_frequencies()
    }

    /// Current diffuseness estimate of a band
    pub fn band_diffuseness(&self, band: usize) -> Option<f32> {
        self.bands.get(band).map(|b| b.analysis.diffuseness())
    }

    /// True once a decode set has been adopted
    pub fn has_decoder(&self) -> bool {
        self.codec.is_some()
    }

    pub fn status(&self) -> &Arc<EngineStatus> {
        &self.status
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.status.snapshot()
    }
}

/// W to both ears
fn omni_passthrough(sh: &TfFrame, ears: &mut TfFrame) {
    let slots = sh.time_slots();
    for band in 0..sh.num_bands() {
        let w = &sh.band(band)[..slots];
        let out = ears.band_mut(band);
        for ear in 0..NUM_EARS {
            out[ear * slots..(ear + 1) * slots].copy_from_slice(w);
        }
    }
}

fn to_n3d(frame: &mut TfFrame, gains: [f32; NUM_SH_SIGNALS]) {
    let slots = frame.time_slots();
    for band in 0..frame.num_bands() {
        let data = frame.band_mut(band);
        for (ch, &g) in gains.iter().enumerate() {
            if g != 1.0 {
                for s in &mut data[ch * slots..(ch + 1) * slots] {
                    *s *= g;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtrb::RingBuffer;

    use crate::hrtf::{HrirSet, HrtfFilterbank};
    use crate::state::triple_buffer;
    use crate::transform::StftFilterbank;

    fn codec(decoder: &DecodeMatrices, generation: u64) -> Box<Codec> {
        Box::new(Codec {
            decoder: decoder.clone(),
            generation,
        })
    }

    #[test]
    fn test_full_return_ring_holds_replaced_set() {
        let config = CropacConfig::default();
        let transform = StftFilterbank::new(48000, 128, 4, NUM_SH_SIGNALS, NUM_EARS).unwrap();
        let filterbank =
            HrtfFilterbank::from_hrirs(&HrirSet::default_set(), transform.band_frequencies())
                .unwrap();
        let decoder = crate::decoder::DecoderBuilder::new().build(&filterbank).unwrap();

        let (_writer, reader) = triple_buffer(CropacParams::with_bands(transform.num_bands()));
        let status = Arc::new(EngineStatus::new());
        let (mut codec_tx, codec_rx) = RingBuffer::new(4);
        let (retired_tx, mut retired_rx) = RingBuffer::new(1);
        let mut processor = CropacProcessor::new(
            &config,
            Box::new(transform),
            reader,
            Arc::clone(&status),
            codec_rx,
            retired_tx,
        );

        let input = TfFrame::new(processor.num_bands(), NUM_SH_SIGNALS, 4);
        let mut output = TfFrame::new(processor.num_bands(), NUM_EARS, 4);

        for generation in 1..=3 {
            assert!(codec_tx.push(codec(&decoder, generation)).is_ok());
        }
        processor.process_tf(&input, &mut output).unwrap();
        // #1 went back, #2 waits for room, #3 runs
        assert_eq!(status.snapshot().codec_generation, 3);
        assert!(processor.retiring.is_some());

        // No newer set while #2 is still held
        assert!(codec_tx.push(codec(&decoder, 4)).is_ok());
        processor.process_tf(&input, &mut output).unwrap();
        assert_eq!(status.snapshot().codec_generation, 3);

        assert_eq!(retired_rx.pop().map(|c| c.generation).ok(), Some(1));
        processor.process_tf(&input, &mut output).unwrap();
        assert_eq!(status.snapshot().codec_generation, 4);
        assert_eq!(retired_rx.pop().map(|c| c.generation).ok(), Some(2));
        // #3 now waits in turn
        assert_eq!(processor.retiring.as_ref().map(|c| c.generation), Some(3));
    }
}
