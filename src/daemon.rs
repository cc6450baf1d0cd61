//! Daemon - the voice command pipeline
//!
//! Owns the ring, normalizer, recognition session, mode controller and
//! dispatcher, and runs them one block at a time on the calling thread.

use std::time::Duration;

use crate::engine::{Binding, FRAME_MS, RecognitionEngine, RecognitionSession};
use crate::voice::{
    ActionDispatcher, AudioSource, BlockProducer, FrameNormalizer, FrameReport, FrameSource,
    FrameStats, ModeController, ModeEvent, OutputDevice, ShutdownHandle,
};
use crate::{Config, Error, Result};

/// Source restarts allowed after peripheral faults
const MAX_RESTARTS: u32 = 1;

/// A push slower than one frame period cannot keep up with the audio
#[allow(clippy::cast_lossless)]
const FRAME_BUDGET: Duration = Duration::from_millis(FRAME_MS as u64);

/// Why [`Pipeline::run`] returned normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The audio source ended
    SourceClosed,
    /// Shutdown was requested
    Shutdown,
}

/// Counters collected while running
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Frames pushed to the engine
    pub frames: u64,
    /// Trigger phrases heard
    pub triggers: u64,
    /// Command phrases heard
    pub commands: u64,
    /// Engine speech timeouts
    pub timeouts: u64,
    /// Command windows that ran out
    pub expiries: u64,
    /// Grammar swaps the engine rejected
    pub retained: u64,
    /// Blocks lost to overruns
    pub overruns: u64,
    /// Peripheral faults
    pub faults: u64,
    /// Total time spent in engine pushes
    pub push_total: Duration,
    /// Slowest engine push
    pub push_max: Duration,
    /// Pushes slower than a frame period
    pub over_budget: u64,
}

impl PipelineStats {
    fn record(&mut self, report: &FrameReport) {
        self.frames += 1;
        self.push_total += report.push_time;
        self.push_max = self.push_max.max(report.push_time);
        if report.push_time > FRAME_BUDGET {
            self.over_budget += 1;
        }
        if report.expired {
            self.expiries += 1;
        }
        match report.event {
            ModeEvent::Pending => {}
            ModeEvent::Trigger { .. } => self.triggers += 1,
            ModeEvent::Command { .. } => self.commands += 1,
            ModeEvent::Timeout => self.timeouts += 1,
            ModeEvent::Retained { .. } => self.retained += 1,
        }
    }

    /// Average engine push time
    #[must_use]
    pub fn mean_push(&self) -> Duration {
        u32::try_from(self.frames)
            .ok()
            .filter(|&n| n > 0)
            .map_or(Duration::ZERO, |n| self.push_total / n)
    }
}

/// The running pipeline
pub struct Pipeline<E, O> {
    frames: FrameSource,
    normalizer: FrameNormalizer,
    session: RecognitionSession<E>,
    controller: ModeController,
    dispatcher: ActionDispatcher<O>,
    stats: PipelineStats,
    restarts: u32,
}

impl<E: RecognitionEngine, O: OutputDevice> Pipeline<E, O> {
    /// Wire up a pipeline for a source delivering `channels` channels
    ///
    /// Returns the pipeline and the producer to hand to the source.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the ring, normalizer, controller or
    /// command table cannot be built from `config`
    pub fn assemble(
        config: &Config,
        (trigger, command): (Binding, Binding),
        engine: E,
        outputs: O,
        channels: u16,
    ) -> Result<(Self, BlockProducer)> {
        let normalizer_config = config.normalizer(channels);
        let block_len = FrameNormalizer::block_len_for(normalizer_config.stride);
        let (frames, producer) = FrameSource::new(config.audio.slots, block_len)?;
        let normalizer = FrameNormalizer::new(normalizer_config, block_len)?;

        let session = RecognitionSession::new(engine, config.recognizer.clone())
            .with_nnpq_override(config.nnpq_threshold);
        let controller = ModeController::new(trigger, command, config.countdown_frames())?;
        let dispatcher =
            ActionDispatcher::new(config.commands.clone(), config.indicator.clone(), outputs)?;

        tracing::debug!(
            slots = frames.slots(),
            block_len,
            stride = normalizer_config.stride,
            channel = normalizer_config.channel,
            "pipeline assembled"
        );

        Ok((
            Self {
                frames,
                normalizer,
                session,
                controller,
                dispatcher,
                stats: PipelineStats::default(),
                restarts: 0,
            },
            producer,
        ))
    }

    /// Drive outputs off, size engine memory and bind the trigger grammar
    ///
    /// # Errors
    ///
    /// Returns error if the engine rejects either grammar or an output line
    /// cannot be driven
    pub fn start(&mut self) -> Result<()> {
        self.dispatcher.reset()?;
        let memory = self.controller.start(&mut self.session, &mut self.dispatcher)?;
        tracing::info!(
            engine = %self.session.info().version_string(),
            memory,
            "pipeline started"
        );
        Ok(())
    }

    /// Process exactly one block
    ///
    /// # Errors
    ///
    /// Returns the ring's overrun, fault, closed and shutdown conditions
    /// unchanged, plus any normalizer, engine or output error
    pub fn step(&mut self) -> Result<FrameReport> {
        let frame = {
            let block = self.frames.next_block()?;
            self.normalizer.normalize(&block)?
        };

        let report = self
            .controller
            .on_frame(&mut self.session, &mut self.dispatcher, &frame)?;
        self.stats.record(&report);
        if report.push_time > FRAME_BUDGET {
            tracing::warn!(
                push_ms = report.push_time.as_millis(),
                "engine push exceeded frame period"
            );
        }
        Ok(report)
    }

    /// Run until the source closes, shutdown is requested, or a fatal error
    ///
    /// Overruns are counted and skipped. A peripheral fault restarts the
    /// source once; a second fault is fatal. The source is stopped on every
    /// exit path.
    ///
    /// # Errors
    ///
    /// Returns the fatal error that stopped the pipeline
    pub fn run(&mut self, source: &mut dyn AudioSource) -> Result<StopReason> {
        tracing::info!(source = %source.describe(), "pipeline running");

        let outcome = loop {
            match self.step() {
                Ok(_) => {}
                Err(e) if e.is_recoverable() => {
                    tracing::warn!(error = %e, total = self.frames.overruns(), "audio overrun");
                }
                Err(Error::AudioFault(reason)) => {
                    self.stats.faults += 1;
                    if self.restarts >= MAX_RESTARTS {
                        break Err(Error::AudioFault(reason));
                    }
                    self.restarts += 1;
                    tracing::warn!(%reason, attempt = self.restarts, "audio fault, restarting source");
                    if let Err(e) = source.restart(&mut self.frames) {
                        break Err(e);
                    }
                }
                Err(Error::SourceClosed) => break Ok(StopReason::SourceClosed),
                Err(Error::Shutdown) => break Ok(StopReason::Shutdown),
                Err(e) => break Err(e),
            }
        };

        source.stop();
        let stats = self.stats();
        tracing::info!(
            frames = stats.frames,
            triggers = stats.triggers,
            commands = stats.commands,
            timeouts = stats.timeouts,
            expiries = stats.expiries,
            overruns = stats.overruns,
            faults = stats.faults,
            mean_push_us = stats.mean_push().as_micros(),
            max_push_us = stats.push_max.as_micros(),
            "pipeline stopped"
        );
        if let Err(e) = &outcome {
            tracing::error!(error = %e, "pipeline halted");
        }
        outcome
    }

    /// Handle that stops a running [`run`](Self::run)
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.frames.shutdown_handle()
    }

    /// Counters so far
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            overruns: self.frames.overruns(),
            ..self.stats
        }
    }

    /// The recognition session
    #[must_use]
    pub const fn session(&self) -> &RecognitionSession<E> {
        &self.session
    }

    /// The mode controller
    #[must_use]
    pub const fn controller(&self) -> &ModeController {
        &self.controller
    }

    /// The dispatcher
    #[must_use]
    pub const fn dispatcher(&self) -> &ActionDispatcher<O> {
        &self.dispatcher
    }
}

/// Level summary over a run of frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Levels {
    /// Frames measured
    pub frames: u64,
    /// Average sample value
    pub mean: i32,
    /// Average of the per-frame mean squares
    pub mean_square: u32,
    /// Largest absolute sample
    pub peak: u16,
}

impl Levels {
    /// DC offset that would center the signal at zero
    #[must_use]
    pub const fn suggested_dc_offset(&self, current: i32) -> i32 {
        current.saturating_sub(self.mean)
    }
}

/// Normalize up to `max_frames` blocks and summarize their levels
///
/// Each frame is passed to `on_frame` as well, for meters and recording.
/// Stops early when the source closes. Overruns are skipped.
///
/// # Errors
///
/// Returns a fault, shutdown or normalizer error
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
pub fn measure<F>(
    frames: &mut FrameSource,
    normalizer: &FrameNormalizer,
    max_frames: u64,
    mut on_frame: F,
) -> Result<Levels>
where
    F: FnMut(&crate::engine::Frame, &FrameStats),
{
    let mut count = 0u64;
    let mut mean_sum = 0i64;
    let mut square_sum = 0u64;
    let mut peak = 0u16;

    while count < max_frames {
        let frame = match frames.next_block() {
            Ok(block) => normalizer.normalize(&block)?,
            Err(e) if e.is_recoverable() => {
                tracing::warn!(error = %e, "audio overrun while measuring");
                continue;
            }
            Err(Error::SourceClosed) => break,
            Err(e) => return Err(e),
        };

        let stats = FrameStats::of(&frame);
        on_frame(&frame, &stats);
        count += 1;
        mean_sum += i64::from(stats.mean);
        square_sum += u64::from(stats.mean_square);
        peak = peak.max(stats.peak);
    }

    if count == 0 {
        return Ok(Levels::default());
    }
    Ok(Levels {
        frames: count,
        mean: (mean_sum / count as i64) as i32,
        mean_square: (square_sum / count) as u32,
        peak,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{FRAME_LEN, ModelBlob, ModelPair, Script, ScriptStep, ScriptedEngine};
    use crate::voice::{MemoryOutputs, Mode, NormalizerConfig};

    fn binding(label: &str) -> Binding {
        Binding {
            pair: ModelPair::new(
                ModelBlob::new(label, vec![0u8; 64]),
                ModelBlob::new(format!("{label}-net"), vec![0u8; 64]),
            ),
            param_a_offset: 0,
            timeout_secs: 0,
        }
    }

    fn pipeline(
        steps: Vec<ScriptStep>,
    ) -> (Pipeline<ScriptedEngine, MemoryOutputs>, BlockProducer) {
        pipeline_with(ScriptedEngine::from_steps(steps))
    }

    fn pipeline_with(
        engine: ScriptedEngine,
    ) -> (Pipeline<ScriptedEngine, MemoryOutputs>, BlockProducer) {
        let mut config = Config::default();
        config.audio.stride = Some(1);
        Pipeline::assemble(
            &config,
            (binding("trigger"), binding("command")),
            engine,
            MemoryOutputs::default(),
            1,
        )
        .unwrap()
    }

    #[test]
    fn test_step_before_start_is_not_ready() {
        let (mut p, mut producer) = pipeline(Vec::new());
        producer.write(&[0; FRAME_LEN]);
        assert!(matches!(p.step(), Err(Error::SessionNotReady)));
    }

    #[test]
    fn test_stats_follow_events() {
        let (mut p, mut producer) = pipeline(vec![
            ScriptStep::recognize("trigger", 2, 1),
            ScriptStep::recognize("command", 3, 2),
        ]);
        p.start().unwrap();

        for _ in 0..5 {
            producer.write(&[0; FRAME_LEN]);
            p.step().unwrap();
        }

        let stats = p.stats();
        assert_eq!(stats.frames, 5);
        assert_eq!(stats.triggers, 1);
        assert_eq!(stats.commands, 1);
        assert_eq!(p.controller().mode(), Mode::TriggerWait);
        assert_eq!(p.dispatcher().state("red"), Some(true));
    }

    #[test]
    fn test_rejected_swap_is_counted() {
        let (mut p, mut producer) = pipeline_with(ScriptedEngine::new(Script {
            fail_inits: vec![2],
            steps: vec![ScriptStep::recognize("trigger", 1, 1)],
            ..Script::default()
        }));
        p.start().unwrap();

        producer.write(&[0; FRAME_LEN]);
        let report = p.step().unwrap();
        assert!(matches!(report.event, ModeEvent::Retained { .. }));

        let stats = p.stats();
        assert_eq!(stats.retained, 1);
        assert_eq!(stats.triggers, 0);
        assert_eq!(p.controller().mode(), Mode::TriggerWait);
    }

    #[test]
    fn test_levels() {
        let (mut frames, mut producer) = FrameSource::new(3, FRAME_LEN).unwrap();
        let normalizer = FrameNormalizer::new(
            NormalizerConfig {
                stride: 1,
                channel: 0,
                attenuation: 0,
                dc_offset: 0,
            },
            FRAME_LEN,
        )
        .unwrap();

        producer.write(&[-40; FRAME_LEN]);
        producer.write(&[-60; FRAME_LEN]);
        drop(producer);

        let mut seen = 0;
        let levels = measure(&mut frames, &normalizer, 10, |_, _| seen += 1).unwrap();
        assert_eq!(seen, 2);
        assert_eq!(levels.frames, 2);
        assert_eq!(levels.mean, -50);
        assert_eq!(levels.peak, 60);
        assert_eq!(levels.suggested_dc_offset(0), 50);
    }
}
