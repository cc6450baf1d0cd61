use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use genie_voice::daemon::{Levels, measure};
use genie_voice::engine::{FRAME_LEN, FRAME_MS, Script};
use genie_voice::voice::{
    AudioSource, FrameSource, MicSource, SAMPLE_RATE, TracingOutputs, WavSource, write_wav,
};
use genie_voice::{Config, FrameNormalizer, Pipeline, RecognitionSession, ScriptedEngine, StopReason};

/// Genie - trigger phrase and voice command pipeline
#[derive(Parser)]
#[command(name = "genie", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/genie/config.toml)
    #[arg(short, long, env = "GENIE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen on the microphone and act on recognized commands
    Run {
        /// Replay this WAV file instead of the microphone
        #[arg(long)]
        audio: Option<PathBuf>,

        /// Recognition script driving the engine
        #[arg(short, long, env = "GENIE_SCRIPT")]
        script: PathBuf,
    },
    /// Replay a WAV file through the pipeline
    Simulate {
        /// 16kHz WAV file
        #[arg(long)]
        audio: PathBuf,

        /// Recognition script driving the engine
        #[arg(short, long, env = "GENIE_SCRIPT")]
        script: PathBuf,

        /// Replay speed multiplier
        #[arg(long, default_value = "1.0")]
        speed: f32,
    },
    /// Measure input levels and suggest a DC offset
    Calibrate {
        /// Seconds to measure
        #[arg(short, long, default_value = "5")]
        seconds: u64,

        /// Measure this WAV file instead of the microphone
        #[arg(long)]
        audio: Option<PathBuf>,

        /// Save the normalized frames as a WAV file
        #[arg(long)]
        record: Option<PathBuf>,
    },
    /// Show engine version, configuration and memory requirements
    Info {
        /// Recognition script driving the engine
        #[arg(short, long, env = "GENIE_SCRIPT")]
        script: Option<PathBuf>,
    },
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,genie_voice=info",
        1 => "info,genie_voice=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run { audio, script } => run_pipeline(config, &script, audio, 1.0).await,
        Command::Simulate {
            audio,
            script,
            speed,
        } => run_pipeline(config, &script, Some(audio), speed).await,
        Command::Calibrate {
            seconds,
            audio,
            record,
        } => {
            tokio::task::spawn_blocking(move || {
                calibrate(&config, seconds, audio.as_deref(), record.as_deref())
            })
            .await?
        }
        Command::Info { script } => info(&config, script.as_deref()),
        Command::TestMic { duration } => {
            tokio::task::spawn_blocking(move || test_mic(&config, duration)).await?
        }
    }
}

/// Open the WAV file when given, the microphone otherwise
fn open_source(
    config: &Config,
    audio: Option<&Path>,
    speed: f32,
) -> genie_voice::Result<Box<dyn AudioSource>> {
    Ok(match audio {
        Some(path) => Box::new(WavSource::open(path, speed)?),
        None => {
            let channels = config.audio.stride.and_then(|s| u16::try_from(s).ok());
            Box::new(MicSource::new(channels)?)
        }
    })
}

/// Run the recognition pipeline until the audio ends or Ctrl-C
async fn run_pipeline(
    config: Config,
    script: &Path,
    audio: Option<PathBuf>,
    speed: f32,
) -> anyhow::Result<()> {
    let bindings = config.load_bindings()?;
    let engine = ScriptedEngine::new(Script::load(script)?);
    let (handle_tx, handle_rx) = tokio::sync::oneshot::channel();

    // cpal streams are not Send; everything audio lives on this thread
    let mut task = tokio::task::spawn_blocking(move || -> genie_voice::Result<StopReason> {
        let mut source = open_source(&config, audio.as_deref(), speed)?;
        let (mut pipeline, producer) =
            Pipeline::assemble(&config, bindings, engine, TracingOutputs, source.channels())?;
        let _ = handle_tx.send(pipeline.shutdown_handle());

        pipeline.start()?;
        source.start(producer)?;
        tracing::info!("genie ready - say the trigger phrase");
        pipeline.run(source.as_mut())
    });

    let Ok(shutdown) = handle_rx.await else {
        return report_stop(task.await?);
    };

    tokio::select! {
        joined = &mut task => return report_stop(joined?),
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("interrupt received, stopping");
            shutdown.shutdown();
        }
    }

    report_stop(task.await?)
}

fn report_stop(outcome: genie_voice::Result<StopReason>) -> anyhow::Result<()> {
    match outcome? {
        StopReason::SourceClosed => tracing::info!("audio source ended"),
        StopReason::Shutdown => tracing::info!("stopped"),
    }
    Ok(())
}

/// Frames needed to cover `seconds`
fn frames_for(seconds: u64) -> u64 {
    seconds * 1000 / u64::from(FRAME_MS)
}

/// Measure levels over a few seconds of audio
fn calibrate(
    config: &Config,
    seconds: u64,
    audio: Option<&Path>,
    record: Option<&Path>,
) -> anyhow::Result<()> {
    let mut source = open_source(config, audio, 1.0)?;
    let normalizer_config = config.normalizer(source.channels());
    let block_len = FrameNormalizer::block_len_for(normalizer_config.stride);
    let (mut frames, producer) = FrameSource::new(config.audio.slots, block_len)?;
    let normalizer = FrameNormalizer::new(normalizer_config, block_len)?;

    println!("Measuring {} for {seconds} seconds...", source.describe());
    println!("Stay quiet for a DC reading, speak for a level reading.\n");

    source.start(producer)?;
    let mut recorded = Vec::new();
    let levels = measure(&mut frames, &normalizer, frames_for(seconds), |frame, _| {
        if record.is_some() {
            recorded.extend_from_slice(frame.samples());
        }
    });
    source.stop();
    let levels = levels?;

    print_levels(&levels, config.audio.dc_offset);

    if let Some(path) = record {
        write_wav(path, &recorded, SAMPLE_RATE)?;
        println!("Recorded {} samples to {}", recorded.len(), path.display());
    }
    Ok(())
}

fn print_levels(levels: &Levels, dc_offset: i32) {
    println!("---");
    println!("Frames:        {}", levels.frames);
    println!("Mean:          {}", levels.mean);
    println!("Mean square:   {}", levels.mean_square);
    println!("Peak:          {}", levels.peak);
    println!("DC offset:     {dc_offset} (current)");
    println!(
        "Suggested:     {} (set GENIE_MIC_DC_OFFSET or [audio] dc_offset)",
        levels.suggested_dc_offset(dc_offset)
    );
}

/// Print engine version, resolved config and memory needs
fn info(config: &Config, script: Option<&Path>) -> anyhow::Result<()> {
    let script = script.map(Script::load).transpose()?.unwrap_or_default();
    let mut session = RecognitionSession::new(ScriptedEngine::new(script), config.recognizer.clone());

    println!("Engine version:   {}", session.info().version_string());
    println!("Frame:            {FRAME_LEN} samples / {FRAME_MS} ms");
    println!(
        "Audio:            attenuation {} | dc offset {} | channel {} | slots {}",
        config.audio.attenuation, config.audio.dc_offset, config.audio.channel, config.audio.slots
    );
    println!("Command window:   {} frames", config.countdown_frames());
    println!(
        "Sensitivity:      trigger {} | command {}",
        config.trigger.sensitivity, config.command.sensitivity
    );
    for binding in &config.commands {
        println!(
            "Command {:>3}:      {} -> {}",
            binding.word_id, binding.phrase, binding.output
        );
    }

    match config.load_bindings() {
        Ok((trigger, command)) => {
            for binding in [&trigger, &command] {
                match session.allocate(binding) {
                    Ok(size) => println!("Memory ({:<8}) {size} bytes", binding.label()),
                    Err(e) => println!("Memory ({:<8}) rejected: {e}", binding.label()),
                }
            }
        }
        Err(e) => println!("Models:           not loaded ({e})"),
    }

    Ok(())
}

/// Test microphone input
fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut source = open_source(config, None, 1.0)?;
    let normalizer_config = config.normalizer(source.channels());
    let block_len = FrameNormalizer::block_len_for(normalizer_config.stride);
    let (mut frames, producer) = FrameSource::new(config.audio.slots, block_len)?;
    let normalizer = FrameNormalizer::new(normalizer_config, block_len)?;

    println!("Sample rate: {SAMPLE_RATE} Hz, {} channel(s)", source.channels());
    println!("---");

    source.start(producer)?;
    let per_second = frames_for(1);
    let mut count = 0u64;
    let mut second_peak = 0u16;
    let result = measure(&mut frames, &normalizer, frames_for(duration), |_, stats| {
        count += 1;
        second_peak = second_peak.max(stats.peak);
        if count.is_multiple_of(per_second) {
            // Visual meter
            let meter_len = usize::from(second_peak / 656).min(50);
            let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);
            println!(
                "[{:2}s] Mean: {:6} | Peak: {:5} | [{}]",
                count / per_second,
                stats.mean,
                second_peak,
                meter
            );
            second_peak = 0;
        }
    });
    source.stop();
    let levels = result?;

    println!("\n---");
    println!("Overall peak {} over {} frames", levels.peak, levels.frames);
    println!("If you saw movement in the meter, your mic is working!");
    println!("If the peak stayed near the DC offset, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}
