//! Non-real-time half of the engine: parameters and decode set builds

use std::path::Path;
use std::sync::Arc;

use rtrb::{Consumer, Producer, PushError};

use super::{Codec, Diagnostics, EngineState, EngineStatus};
use crate::config::CropacConfig;
use crate::decoder::DecoderBuilder;
use crate::error::{CropacError, CropacResult};
use crate::format::{AmbisonicFormat, Normalization};
use crate::hrtf::{HrirProvider, HrtfFilterbank, HrtfInterpolation, HrtfSource};
use crate::params::CropacParams;
use crate::rotator::RotationParams;
use crate::state::ParamWriter;

/// Parameter surface and decode set builder
pub struct CropacController {
    config: CropacConfig,
    params: CropacParams,
    writer: ParamWriter<CropacParams>,
    provider: Box<dyn HrirProvider>,
    status: Arc<EngineStatus>,
    codec_tx: Producer<Box<Codec>>,
    retired_rx: Consumer<Box<Codec>>,
    /// Built but not yet accepted by the processor
    pending: Option<Box<Codec>>,
    band_freqs: Vec<f32>,
    /// Band count of the processor's transform (fixed for its lifetime)
    transform_bands: usize,
    /// Last converted HRTF set, reused while source and band layout hold
    filterbank: Option<(HrtfSource, HrtfFilterbank)>,
    generation: u64,
}

impl CropacController {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: CropacConfig,
        params: CropacParams,
        writer: ParamWriter<CropacParams>,
        provider: Box<dyn HrirProvider>,
        status: Arc<EngineStatus>,
        codec_tx: Producer<Box<Codec>>,
        retired_rx: Consumer<Box<Codec>>,
        band_freqs: Vec<f32>,
    ) -> Self {
        Self {
            config,
            params,
            writer,
            provider,
            status,
            codec_tx,
            retired_rx,
            pending: None,
            transform_bands: band_freqs.len(),
            band_freqs,
            filterbank: None,
            generation: 0,
        }
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SERVICE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Run pending (re)initialization; returns true when a new decode set
    /// was published
    ///
    /// Call between blocks. A failed build is logged and the processor
    /// keeps its previous decode set.
    pub fn service(&mut self) -> bool {
        self.drain_retired();
        self.flush_pending();

        match self.status.state() {
            EngineState::Uninitialized | EngineState::ReinitPending => {}
            EngineState::Ready | EngineState::Reinitializing => return false,
        }

        self.status.set_state(EngineState::Reinitializing);
        let published = match self.build_codec() {
            Ok(codec) => {
                log::info!(
                    "Publishing decode set #{}: {} bands, HRTF '{}', max-rE {}, {:?}",
                    codec.generation,
                    codec.decoder.num_bands(),
                    codec.decoder.hrtf_name(),
                    codec.decoder.max_re(),
                    codec.decoder.interpolation()
                );
                self.pending = Some(codec);
                self.flush_pending();
                true
            }
            Err(e) => {
                log::error!(
                    "Decoder build for HRTF '{}' failed, keeping the previous decode set: {}",
                    self.params.hrtf_source.label(),
                    e
                );
                false
            }
        };
        self.status.finish_reinit();
        published
    }

    fn build_codec(&mut self) -> CropacResult<Box<Codec>> {
        let source = self.params.hrtf_source.clone();

        let filterbank = match self.filterbank.take() {
            Some((cached, fb)) if cached == source && fb.frequencies() == self.band_freqs.as_slice() => fb,
            _ => {
                let set = self.provider.load(&source)?;
                log::debug!(
                    "Loaded HRIR set '{}' from {}: {} directions, {} taps at {} Hz",
                    set.name,
                    source.label(),
                    set.len(),
                    set.hrir_len(),
                    set.sample_rate
                );
                if set.sample_rate != self.config.sample_rate {
                    log::warn!(
                        "HRIR set '{}' is sampled at {} Hz, engine runs at {} Hz",
                        set.name,
                        set.sample_rate,
                        self.config.sample_rate
                    );
                }
                HrtfFilterbank::from_hrirs(&set, &self.band_freqs)?
            }
        };

        let built = DecoderBuilder::new()
            .covering_points(self.config.covering_points)
            .max_re(self.params.max_re)
            .interpolation(self.params.hrtf_interpolation)
            .build(&filterbank);
        self.filterbank = Some((source, filterbank));
        let decoder = built?;

        self.generation += 1;
        Ok(Box::new(Codec {
            decoder,
            generation: self.generation,
        }))
    }

    fn flush_pending(&mut self) {
        if let Some(codec) = self.pending.take() {
            match self.codec_tx.push(codec) {
                Ok(()) => {}
                Err(PushError::Full(codec)) => {
                    log::warn!("Decode set #{} waiting: processor queue full", codec.generation);
                    self.pending = Some(codec);
                }
            }
        }
    }

    fn drain_retired(&mut self) {
        while let Ok(old) = self.retired_rx.pop() {
            log::debug!("Dropping retired decode set #{}", old.generation);
        }
    }

    fn publish(&mut self) {
        self.writer.publish(&self.params);
    }

    fn publish_and_rebuild(&mut self) {
        self.publish();
        self.status.request_reinit();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // PARAMETERS
    // ═══════════════════════════════════════════════════════════════════════════

    pub fn params(&self) -> &CropacParams {
        &self.params
    }

    pub fn config(&self) -> &CropacConfig {
        &self.config
    }

    pub fn num_bands(&self) -> usize {
        self.band_freqs.len()
    }

    pub fn band_frequencies(&self) -> &[f32] {
        &self.band_freqs
    }

    /// Generation of the most recently built decode set
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.status.snapshot()
    }

    pub fn set_eq(&mut self, band: usize, gain: f32) {
        self.params.set_band_eq(band, gain);
        self.publish();
    }

    pub fn set_eq_all(&mut self, gain: f32) {
        for band in 0..self.num_bands() {
            self.params.set_band_eq(band, gain);
        }
        self.publish();
    }

    pub fn set_balance(&mut self, band: usize, balance: f32) {
        self.params.set_band_balance(band, balance);
        self.publish();
    }

    pub fn set_balance_all(&mut self, balance: f32) {
        for band in 0..self.num_bands() {
            self.params.set_band_balance(band, balance);
        }
        self.publish();
    }

    pub fn set_dec_balance(&mut self, band: usize, dec_balance: f32) {
        self.params.set_band_dec_balance(band, dec_balance);
        self.publish();
    }

    pub fn set_dec_balance_all(&mut self, dec_balance: f32) {
        for band in 0..self.num_bands() {
            self.params.set_band_dec_balance(band, dec_balance);
        }
        self.publish();
    }

    pub fn set_cov_avg_coeff(&mut self, coeff: f32) {
        self.params.cov_avg_coeff = coeff.clamp(0.0, crate::analyzer::MAX_AVG_COEFF);
        self.publish();
    }

    pub fn set_rotation(&mut self, rotation: RotationParams) {
        self.params.rotation = rotation;
        self.publish();
    }

    pub fn set_rotation_enabled(&mut self, enabled: bool) {
        self.params.rotation.enabled = enabled;
        self.publish();
    }

    /// Reject orderings the processor cannot handle
    pub fn set_format(&mut self, format: AmbisonicFormat) -> CropacResult<()> {
        format.validate()?;
        self.params.format = format;
        self.publish();
        Ok(())
    }

    pub fn set_normalization(&mut self, normalization: Normalization) {
        self.params.format.normalization = normalization;
        self.publish();
    }

    pub fn set_max_re(&mut self, enabled: bool) {
        if self.params.max_re != enabled {
            self.params.max_re = enabled;
            self.publish_and_rebuild();
        }
    }

    pub fn set_hrtf_source(&mut self, source: HrtfSource) {
        if self.params.hrtf_source != source {
            log::info!("HRTF source: {}", source.label());
            self.params.hrtf_source = source;
            self.publish_and_rebuild();
        }
    }

    pub fn set_hrtf_interpolation(&mut self, mode: HrtfInterpolation) {
        if self.params.hrtf_interpolation != mode {
            self.params.hrtf_interpolation = mode;
            self.publish_and_rebuild();
        }
    }

    /// Replace the whole parameter set
    pub fn set_params(&mut self, params: CropacParams) -> CropacResult<()> {
        params.format.validate()?;
        let rebuild = self.params.decoder_changed(&params);
        self.params = params;
        if rebuild {
            self.publish_and_rebuild();
        } else {
            self.publish();
        }
        Ok(())
    }

    /// Change the sample rate; band frequencies scale with it
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> CropacResult<()> {
        let mut config = self.config.clone();
        config.sample_rate = sample_rate;
        config.validate()?;

        let scale = sample_rate as f32 / self.config.sample_rate as f32;
        for f in &mut self.band_freqs {
            *f *= scale;
        }
        self.config = config;
        self.filterbank = None;
        log::info!("Sample rate: {} Hz", sample_rate);
        self.status.request_reinit();
        Ok(())
    }

    /// Adopt new band centre frequencies from the host's transform
    ///
    /// The band count must match the transform the processor runs;
    /// otherwise every decode set built from it would be rejected per block.
    pub fn set_band_layout(&mut self, band_freqs: Vec<f32>) -> CropacResult<()> {
        if band_freqs.is_empty() {
            return Err(CropacError::config("band layout is empty"));
        }
        if band_freqs.len() != self.transform_bands {
            return Err(CropacError::TransformMismatch {
                decoder_bands: band_freqs.len(),
                transform_bands: self.transform_bands,
            });
        }
        self.band_freqs = band_freqs;
        self.filterbank = None;
        self.status.request_reinit();
        Ok(())
    }

    /// Force a rebuild at the next service
    pub fn request_reinit(&mut self) {
        self.status.request_reinit();
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // STATE
    // ═══════════════════════════════════════════════════════════════════════════

    /// Persist the user parameters as JSON
    pub fn save_state(&self, path: impl AsRef<Path>) -> CropacResult<()> {
        self.params.save(path)
    }

    /// Restore user parameters saved by [`save_state`](Self::save_state)
    pub fn load_state(&mut self, path: impl AsRef<Path>) -> CropacResult<()> {
        let params = CropacParams::load(path)?;
        self.set_params(params)
    }
}
