//! Frame orchestration and the re-initialization state machine
//!
//! ```text
//! Uninitialized ──► Ready ──► ReinitPending ──► Reinitializing ──► Ready
//! ```
//!
//! [`CropacController`] lives on a non-real-time thread: it owns the user
//! parameters, builds decode sets and hands them over through a lock-free
//! ring. [`CropacProcessor`] runs on the audio thread and never blocks,
//! allocates or performs I/O. [`CropacEngine`] bundles both for offline
//! use and tests.

mod controller;
mod processor;

pub use controller::CropacController;
pub use processor::CropacProcessor;

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use rtrb::RingBuffer;

use crate::config::CropacConfig;
use crate::decoder::DecodeMatrices;
use crate::error::CropacResult;
use crate::format::{NUM_EARS, NUM_SH_SIGNALS};
use crate::hrtf::{FileHrirProvider, HrirProvider};
use crate::params::CropacParams;
use crate::state::triple_buffer;
use crate::transform::{StftFilterbank, TfFrame, TimeFrequencyTransform};

/// Decode sets in flight between controller and processor
const CODEC_QUEUE_CAPACITY: usize = 4;

// ═══════════════════════════════════════════════════════════════════════════════
// STATE + DIAGNOSTICS
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    /// No decode set built yet
    Uninitialized = 0,
    Ready = 1,
    /// A setting affecting the decode set changed
    ReinitPending = 2,
    /// Controller is building a new decode set
    Reinitializing = 3,
}

impl From<u8> for EngineState {
    fn from(value: u8) -> Self {
        match value {
            1 => EngineState::Ready,
            2 => EngineState::ReinitPending,
            3 => EngineState::Reinitializing,
            _ => EngineState::Uninitialized,
        }
    }
}

/// Shared state word and counters (controller ↔ processor)
#[derive(Debug)]
pub struct EngineStatus {
    state: AtomicU8,
    blocks_processed: AtomicU64,
    guard_events: AtomicU64,
    transform_mismatches: AtomicU64,
    passthrough_blocks: AtomicU64,
    /// Generation of the decode set the processor runs with
    codec_generation: AtomicU64,
}

impl Default for EngineStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStatus {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EngineState::Uninitialized as u8),
            blocks_processed: AtomicU64::new(0),
            guard_events: AtomicU64::new(0),
            transform_mismatches: AtomicU64::new(0),
            passthrough_blocks: AtomicU64::new(0),
            codec_generation: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn state(&self) -> EngineState {
        EngineState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Schedule a rebuild (no-op before the first build)
    pub fn request_reinit(&self) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                match EngineState::from(current) {
                    EngineState::Uninitialized => None,
                    _ => Some(EngineState::ReinitPending as u8),
                }
            });
    }

    /// Leave `Reinitializing` unless a new request arrived meanwhile
    fn finish_reinit(&self) {
        let _ = self.state.compare_exchange(
            EngineState::Reinitializing as u8,
            EngineState::Ready as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn snapshot(&self) -> Diagnostics {
        Diagnostics {
            state: self.state(),
            blocks_processed: self.blocks_processed.load(Ordering::Relaxed),
            guard_events: self.guard_events.load(Ordering::Relaxed),
            transform_mismatches: self.transform_mismatches.load(Ordering::Relaxed),
            passthrough_blocks: self.passthrough_blocks.load(Ordering::Relaxed),
            codec_generation: self.codec_generation.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`EngineStatus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Diagnostics {
    pub state: EngineState,
    pub blocks_processed: u64,
    /// Regularization floor / gain cap engagements
    pub guard_events: u64,
    pub transform_mismatches: u64,
    /// Blocks rendered as omni passthrough (no decode set yet)
    pub passthrough_blocks: u64,
    pub codec_generation: u64,
}

/// A complete decode set as handed to the audio thread
#[derive(Debug)]
pub(crate) struct Codec {
    pub decoder: DecodeMatrices,
    pub generation: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ENGINE
// ═══════════════════════════════════════════════════════════════════════════════

/// Controller + processor in one object
///
/// `process` services pending (re)initialization before every block, so
/// the first block already runs with a decode set.
pub struct CropacEngine {
    controller: CropacController,
    processor: CropacProcessor,
}

impl CropacEngine {
    /// Engine with the bundled HRIR provider and the reference STFT
    pub fn new(config: CropacConfig) -> CropacResult<Self> {
        Self::with_provider(config, Box::new(FileHrirProvider))
    }

    pub fn with_provider(
        config: CropacConfig,
        provider: Box<dyn HrirProvider>,
    ) -> CropacResult<Self> {
        config.validate()?;
        let transform = StftFilterbank::new(
            config.sample_rate,
            config.hop_size,
            config.time_slots,
            NUM_SH_SIGNALS,
            NUM_EARS,
        )?;
        Self::with_transform(config, provider, Box::new(transform))
    }

    pub fn with_transform(
        config: CropacConfig,
        provider: Box<dyn HrirProvider>,
        transform: Box<dyn TimeFrequencyTransform>,
    ) -> CropacResult<Self> {
        config.validate()?;

        let status = Arc::new(EngineStatus::new());
        let params = CropacParams::with_bands(transform.num_bands());
        let (writer, reader) = triple_buffer(params.clone());
        let (codec_tx, codec_rx) = RingBuffer::new(CODEC_QUEUE_CAPACITY);
        let (retired_tx, retired_rx) = RingBuffer::new(CODEC_QUEUE_CAPACITY);

        log::info!(
            "CroPaC engine: {} Hz, {} bands, frame {} samples, delay {} samples",
            config.sample_rate,
            transform.num_bands(),
            transform.frame_size(),
            transform.processing_delay()
        );

        let controller = CropacController::new(
            config.clone(),
            params,
            writer,
            provider,
            Arc::clone(&status),
            codec_tx,
            retired_rx,
            transform.band_frequencies().to_vec(),
        );
        let processor =
            CropacProcessor::new(&config, transform, reader, status, codec_rx, retired_tx);

        Ok(Self {
            controller,
            processor,
        })
    }

    /// Service the controller, then render one block
    pub fn process(&mut self, input: &[&[f32]], output: &mut [&mut [f32]]) -> CropacResult<()> {
        self.controller.service();
        self.processor.process(input, output)
    }

    /// Same as [`process`](Self::process) on TF frames
    pub fn process_tf(&mut self, input: &TfFrame, output: &mut TfFrame) -> CropacResult<()> {
        self.controller.service();
        self.processor.process_tf(input, output)
    }

    pub fn controller(&self) -> &CropacController {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut CropacController {
        &mut self.controller
    }

    pub fn processor(&self) -> &CropacProcessor {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut CropacProcessor {
        &mut self.processor
    }

    /// Separate the halves for use on different threads
    pub fn split(self) -> (CropacController, CropacProcessor) {
        (self.controller, self.processor)
    }

    /// Host flush: clear all signal state and rebuild
    pub fn reset(&mut self) {
        self.processor.reset();
    }

    /// Change the sample rate (rebuilds the decode set)
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> CropacResult<()> {
        self.controller.set_sample_rate(sample_rate)?;
        self.processor.set_sample_rate(sample_rate);
        Ok(())
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.processor.diagnostics()
    }

    pub fn frame_size(&self) -> usize {
        self.processor.frame_size()
    }

    pub fn processing_delay(&self) -> usize {
        self.processor.processing_delay()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_u8() {
        for state in [
            EngineState::Uninitialized,
            EngineState::Ready,
            EngineState::ReinitPending,
            EngineState::Reinitializing,
        ] {
            assert_eq!(EngineState::from(state as u8), state);
        }
        assert_eq!(EngineState::from(42), EngineState::Uninitialized);
    }

    #[test]
    fn test_reinit_request_before_first_build_is_ignored() {
        let status = EngineStatus::new();
        status.request_reinit();
        assert_eq!(status.state(), EngineState::Uninitialized);

        status.set_state(EngineState::Ready);
        status.request_reinit();
        assert_eq!(status.state(), EngineState::ReinitPending);
    }

    #[test]
    fn test_request_during_rebuild_survives() {
        let status = EngineStatus::new();
        status.set_state(EngineState::Reinitializing);
        status.request_reinit();
        status.finish_reinit();
        assert_eq!(status.state(), EngineState::ReinitPending);

        status.set_state(EngineState::Reinitializing);
        status.finish_reinit();
        assert_eq!(status.state(), EngineState::Ready);
    }
}
