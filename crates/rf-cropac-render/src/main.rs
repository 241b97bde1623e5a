//! ReelForge CroPaC Renderer
//!
//! Renders a first-order ambisonic WAV file (ACN) to binaural stereo.
//!
//! Usage:
//!   rf-cropac-render scene.wav scene_binaural.wav
//!   rf-cropac-render scene.wav out.wav --balance 1.5 --yaw 30
//!   rf-cropac-render scene.wav out.wav --hrir subject_003.json --state session.json

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};

use rf_cropac::{
    CropacConfig, CropacEngine, HrtfInterpolation, HrtfSource, NUM_EARS, NUM_SH_SIGNALS,
    Normalization, RotationParams,
};

#[derive(Parser)]
#[command(name = "rf-cropac-render", about = "Ambisonics to binaural (CroPaC)")]
struct Cli {
    /// First-order ambisonic input (4 channels, ACN)
    input: PathBuf,

    /// Binaural output
    output: PathBuf,

    /// Engine configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Parameter state saved by a previous session (JSON)
    #[arg(long)]
    state: Option<PathBuf>,

    /// Write the final parameter state here
    #[arg(long)]
    save_state: Option<PathBuf>,

    /// HRIR set (JSON) instead of the bundled one
    #[arg(long)]
    hrir: Option<PathBuf>,

    /// Input normalization
    #[arg(long, value_enum)]
    normalization: Option<NormalizationArg>,

    /// HRTF interpolation between measured directions
    #[arg(long, value_enum)]
    interpolation: Option<InterpolationArg>,

    /// Disable max-rE weighting
    #[arg(long)]
    no_max_re: bool,

    /// Direct/diffuse balance on all bands (0 = diffuse, 2 = direct)
    #[arg(long)]
    balance: Option<f32>,

    /// Linear/parametric balance on all bands (0 = linear, 1 = parametric)
    #[arg(long)]
    dec_balance: Option<f32>,

    /// Rotation in degrees
    #[arg(long, allow_negative_numbers = true)]
    yaw: Option<f32>,

    #[arg(long, allow_negative_numbers = true)]
    pitch: Option<f32>,

    #[arg(long, allow_negative_numbers = true)]
    roll: Option<f32>,

    /// Use all cores for band processing
    #[arg(long)]
    parallel: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum NormalizationArg {
    Sn3d,
    N3d,
}

#[derive(Clone, Copy, ValueEnum)]
enum InterpolationArg {
    Nearest,
    Triangular,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let (channels, sample_rate) = read_ambisonics(&cli.input)?;
    let num_samples = channels[0].len();
    log::info!(
        "Loaded {}: {} samples at {} Hz",
        cli.input.display(),
        num_samples,
        sample_rate
    );

    let mut config = match &cli.config {
        Some(path) => CropacConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => CropacConfig::default(),
    };
    config.sample_rate = sample_rate;
    config.parallel_bands |= cli.parallel;

    let mut engine = CropacEngine::new(config).context("Failed to create engine")?;
    apply_params(&mut engine, &cli)?;

    let ears = render(&mut engine, &channels)?;
    write_binaural(&cli.output, &ears, sample_rate)?;

    if let Some(path) = &cli.save_state {
        engine
            .controller()
            .save_state(path)
            .with_context(|| format!("Failed to save state {}", path.display()))?;
    }

    let diag = engine.diagnostics();
    log::info!(
        "Rendered {} blocks (decode set #{}, {} guard events, {} passthrough)",
        diag.blocks_processed,
        diag.codec_generation,
        diag.guard_events,
        diag.passthrough_blocks
    );
    Ok(())
}

/// State file first, then individual flags on top
fn apply_params(engine: &mut CropacEngine, cli: &Cli) -> Result<()> {
    let controller = engine.controller_mut();

    if let Some(path) = &cli.state {
        controller
            .load_state(path)
            .with_context(|| format!("Failed to load state {}", path.display()))?;
    }
    if let Some(path) = &cli.hrir {
        controller.set_hrtf_source(HrtfSource::File(path.clone()));
    }
    if let Some(norm) = cli.normalization {
        controller.set_normalization(match norm {
            NormalizationArg::Sn3d => Normalization::SN3D,
            NormalizationArg::N3d => Normalization::N3D,
        });
    }
    if let Some(mode) = cli.interpolation {
        controller.set_hrtf_interpolation(match mode {
            InterpolationArg::Nearest => HrtfInterpolation::Nearest,
            InterpolationArg::Triangular => HrtfInterpolation::Triangular,
        });
    }
    if cli.no_max_re {
        controller.set_max_re(false);
    }
    if let Some(balance) = cli.balance {
        controller.set_balance_all(balance);
    }
    if let Some(dec_balance) = cli.dec_balance {
        controller.set_dec_balance_all(dec_balance);
    }
    if cli.yaw.is_some() || cli.pitch.is_some() || cli.roll.is_some() {
        let current = controller.params().rotation;
        controller.set_rotation(RotationParams {
            enabled: true,
            yaw_deg: cli.yaw.unwrap_or(current.yaw_deg),
            pitch_deg: cli.pitch.unwrap_or(current.pitch_deg),
            roll_deg: cli.roll.unwrap_or(current.roll_deg),
            ..current
        });
    }

    // Surface HRIR and format errors before processing starts
    if !controller.service() && controller.generation() == 0 {
        bail!("Decoder initialization failed (see log)");
    }
    Ok(())
}

/// Block-wise render with latency compensation
fn render(engine: &mut CropacEngine, channels: &[Vec<f32>]) -> Result<Vec<Vec<f32>>> {
    let frame = engine.frame_size();
    let delay = engine.processing_delay();
    let num_samples = channels[0].len();
    let padded = (num_samples + delay).div_ceil(frame) * frame;

    let mut input = vec![vec![0.0f32; frame]; NUM_SH_SIGNALS];
    let mut block_out = vec![vec![0.0f32; frame]; NUM_EARS];
    let mut ears = vec![Vec::with_capacity(padded); NUM_EARS];

    for start in (0..padded).step_by(frame) {
        for (dst, src) in input.iter_mut().zip(channels) {
            dst.fill(0.0);
            if start < num_samples {
                let end = (start + frame).min(num_samples);
                dst[..end - start].copy_from_slice(&src[start..end]);
            }
        }

        let ins: Vec<&[f32]> = input.iter().map(|c| c.as_slice()).collect();
        let mut outs: Vec<&mut [f32]> = block_out.iter_mut().map(|c| c.as_mut_slice()).collect();
        engine
            .process(&ins, &mut outs)
            .with_context(|| format!("Processing failed at sample {}", start))?;

        for (dst, src) in ears.iter_mut().zip(&block_out) {
            dst.extend_from_slice(src);
        }
    }

    Ok(ears
        .into_iter()
        .map(|ear| ear[delay..delay + num_samples].to_vec())
        .collect())
}

fn read_ambisonics(path: &Path) -> Result<(Vec<Vec<f32>>, u32)> {
    let reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();
    if spec.channels as usize != NUM_SH_SIGNALS {
        bail!(
            "{}: expected {} ambisonic channels, found {}",
            path.display(),
            NUM_SH_SIGNALS,
            spec.channels
        );
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<std::result::Result<_, _>>()?
        }
    };

    // Deinterleave
    let num_samples = samples.len() / NUM_SH_SIGNALS;
    let mut channels = vec![Vec::with_capacity(num_samples); NUM_SH_SIGNALS];
    for (i, sample) in samples.into_iter().enumerate() {
        channels[i % NUM_SH_SIGNALS].push(sample);
    }
    if num_samples == 0 {
        bail!("{}: no audio", path.display());
    }
    Ok((channels, spec.sample_rate))
}

fn write_binaural(path: &Path, ears: &[Vec<f32>], sample_rate: u32) -> Result<()> {
    let spec = hound::WavSpec {
        channels: NUM_EARS as u16,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut writer = hound::WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for i in 0..ears[0].len() {
        for ear in ears {
            writer.write_sample(ear[i])?;
        }
    }
    writer.finalize()?;
    log::info!("Wrote {} ({} samples)", path.display(), ears[0].len());
    Ok(())
}
