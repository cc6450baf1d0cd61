//! Voice pipeline integration tests
//!
//! Drives the whole pipeline without audio hardware: blocks go in through
//! the ring producer, the scripted engine stands in for the recognizer and
//! outputs land in memory.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use genie_voice::engine::{FRAME_LEN, ScriptStep, StatusCode};
use genie_voice::voice::{
    AudioSource, BlockProducer, COMMAND_COUNTDOWN, FrameNormalizer, FrameSource, MemoryOutputs,
    ModeEvent, NormalizerConfig, WavSource, write_wav,
};
use genie_voice::{Config, Error, Mode, Pipeline, ScriptedEngine, StopReason};

mod common;

use common::{binding, block, mono_config, started_pipeline};

/// Feeds scripted blocks from a thread, optionally ending each run with a fault
struct ScriptedSource {
    blocks_per_start: usize,
    fault_every_start: bool,
    starts: usize,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ScriptedSource {
    fn new(blocks_per_start: usize, fault_every_start: bool) -> Self {
        Self {
            blocks_per_start,
            fault_every_start,
            starts: 0,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }
}

impl AudioSource for ScriptedSource {
    fn channels(&self) -> u16 {
        1
    }

    fn start(&mut self, mut producer: BlockProducer) -> genie_voice::Result<()> {
        self.starts += 1;
        self.stop.store(false, Ordering::Release);
        let stop = Arc::clone(&self.stop);
        let blocks = self.blocks_per_start;
        let fault = self.fault_every_start;
        self.worker = Some(std::thread::spawn(move || {
            for _ in 0..blocks {
                if stop.load(Ordering::Acquire) {
                    return;
                }
                producer.write(&block(0));
            }
            if fault {
                producer.fault_reporter().report("dma overflow");
            }
        }));
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            worker.join().unwrap();
        }
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}

/// Source that never delivers; keeps the producer alive
#[derive(Default)]
struct SilentSource {
    producer: Option<BlockProducer>,
}

impl AudioSource for SilentSource {
    fn channels(&self) -> u16 {
        1
    }

    fn start(&mut self, producer: BlockProducer) -> genie_voice::Result<()> {
        self.producer = Some(producer);
        Ok(())
    }

    fn stop(&mut self) {
        self.producer = None;
    }

    fn describe(&self) -> String {
        "silent".to_string()
    }
}

fn feed(
    pipeline: &mut Pipeline<ScriptedEngine, MemoryOutputs>,
    producer: &mut BlockProducer,
) -> genie_voice::Result<genie_voice::voice::FrameReport> {
    producer.write(&block(0));
    pipeline.step()
}

#[test]
fn test_pending_results_keep_trigger_mode() {
    let (mut pipeline, mut producer) = started_pipeline(Vec::new());

    for _ in 0..10 {
        let report = feed(&mut pipeline, &mut producer).unwrap();
        assert_eq!(report.event, ModeEvent::Pending);
        assert_eq!(report.mode, Mode::TriggerWait);
        assert!(!report.expired);
    }

    assert_eq!(pipeline.session().engine().pushes(), 10);
    assert_eq!(pipeline.dispatcher().state("green"), Some(false));
    assert_eq!(pipeline.dispatcher().state("red"), Some(false));
    assert_eq!(pipeline.stats().commands, 0);
}

#[test]
fn test_trigger_binds_command_grammar() {
    let (mut pipeline, mut producer) =
        started_pipeline(vec![ScriptStep::recognize("trigger", 1, 1)]);

    let report = feed(&mut pipeline, &mut producer).unwrap();
    assert_eq!(report.event, ModeEvent::Trigger { word_id: 1, score: 0 });
    assert_eq!(report.mode, Mode::CommandWait);
    assert_eq!(pipeline.controller().countdown(), COMMAND_COUNTDOWN);
    assert_eq!(pipeline.session().engine().bound(), Some("command"));

    // listening indicator on while waiting for a command
    assert_eq!(pipeline.dispatcher().outputs().level("red"), Some(true));
    assert_eq!(pipeline.dispatcher().state("red"), Some(false));
}

#[test]
fn test_command_window_is_bounded() {
    let (mut pipeline, mut producer) =
        started_pipeline(vec![ScriptStep::recognize("trigger", 1, 1)]);
    feed(&mut pipeline, &mut producer).unwrap();

    for _ in 1..COMMAND_COUNTDOWN {
        let report = feed(&mut pipeline, &mut producer).unwrap();
        assert!(!report.expired);
        assert_eq!(report.mode, Mode::CommandWait);
    }
    assert_eq!(pipeline.session().engine().bound(), Some("command"));

    // the window runs out before this frame is pushed
    let report = feed(&mut pipeline, &mut producer).unwrap();
    assert!(report.expired);
    assert_eq!(report.event, ModeEvent::Pending);
    assert_eq!(report.mode, Mode::TriggerWait);
    assert_eq!(pipeline.session().engine().bound(), Some("trigger"));
    assert_eq!(pipeline.controller().countdown(), COMMAND_COUNTDOWN);

    assert_eq!(pipeline.dispatcher().state("green"), Some(false));
    assert_eq!(pipeline.dispatcher().outputs().level("red"), Some(false));
    let stats = pipeline.stats();
    assert_eq!(stats.expiries, 1);
    assert_eq!(stats.commands, 0);
    assert_eq!(stats.frames, u64::from(COMMAND_COUNTDOWN) + 1);
}

#[test]
fn test_command_toggles_output() {
    let (mut pipeline, mut producer) = started_pipeline(vec![
        ScriptStep::recognize("trigger", 1, 1),
        ScriptStep::recognize("command", 2, 1),
        ScriptStep::recognize("trigger", 1, 1),
        ScriptStep::recognize("command", 1, 1),
    ]);

    feed(&mut pipeline, &mut producer).unwrap();
    assert_eq!(feed(&mut pipeline, &mut producer).unwrap().event, ModeEvent::Pending);
    assert_eq!(pipeline.controller().countdown(), COMMAND_COUNTDOWN - 1);

    let report = feed(&mut pipeline, &mut producer).unwrap();
    let ModeEvent::Command { word_id, applied } = report.event.clone() else {
        panic!("expected a command, got {:?}", report.event);
    };
    assert_eq!(word_id, 1);
    let applied = applied.unwrap();
    assert_eq!(applied.output, "green");
    assert!(applied.state);
    assert_eq!(report.mode, Mode::TriggerWait);
    assert_eq!(pipeline.controller().countdown(), COMMAND_COUNTDOWN);
    assert_eq!(pipeline.dispatcher().outputs().level("green"), Some(true));

    // same word again toggles back
    feed(&mut pipeline, &mut producer).unwrap();
    let report = feed(&mut pipeline, &mut producer).unwrap();
    assert!(matches!(report.event, ModeEvent::Command { word_id: 1, .. }));
    assert_eq!(pipeline.dispatcher().state("green"), Some(false));
    assert_eq!(pipeline.dispatcher().outputs().level("green"), Some(false));
    assert_eq!(pipeline.stats().commands, 2);
}

#[test]
fn test_fatal_status_stops_pushing() {
    let (mut pipeline, mut producer) = started_pipeline(vec![ScriptStep::status(
        "trigger",
        3,
        StatusCode::LICENSE,
    )]);

    feed(&mut pipeline, &mut producer).unwrap();
    feed(&mut pipeline, &mut producer).unwrap();
    let err = feed(&mut pipeline, &mut producer).unwrap_err();
    assert!(matches!(
        err,
        Error::Engine {
            status: StatusCode::LICENSE,
            ..
        }
    ));
    assert_eq!(pipeline.controller().mode(), Mode::Idle);

    assert!(feed(&mut pipeline, &mut producer).is_err());
    assert_eq!(pipeline.session().engine().pushes(), 3);
}

fn scripted_pipeline(
    config: &Config,
    steps: Vec<ScriptStep>,
    source: &dyn AudioSource,
) -> (Pipeline<ScriptedEngine, MemoryOutputs>, BlockProducer) {
    let (mut pipeline, producer) = Pipeline::assemble(
        config,
        (binding("trigger", 0), binding("command", 0)),
        ScriptedEngine::from_steps(steps),
        MemoryOutputs::default(),
        source.channels(),
    )
    .unwrap();
    pipeline.start().unwrap();
    (pipeline, producer)
}

#[test]
fn test_run_halts_on_fatal_status() {
    let mut source = ScriptedSource::new(2, false);
    let (mut pipeline, producer) = scripted_pipeline(
        &mono_config(),
        vec![ScriptStep::status("trigger", 2, StatusCode::LICENSE)],
        &source,
    );

    source.start(producer).unwrap();
    let err = pipeline.run(&mut source).unwrap_err();

    assert!(matches!(
        err,
        Error::Engine {
            status: StatusCode::LICENSE,
            ..
        }
    ));
    assert_eq!(pipeline.session().engine().pushes(), 2);
    assert_eq!(pipeline.stats().frames, 1);
    assert!(source.worker.is_none());
}

#[test]
fn test_run_restarts_source_once_after_fault() {
    let mut source = ScriptedSource::new(2, true);
    let (mut pipeline, producer) = scripted_pipeline(&mono_config(), Vec::new(), &source);

    source.start(producer).unwrap();
    let err = pipeline.run(&mut source).unwrap_err();

    assert!(matches!(err, Error::AudioFault(_)));
    assert_eq!(source.starts, 2);
    let stats = pipeline.stats();
    assert_eq!(stats.faults, 2);
    assert_eq!(stats.frames, 4);
}

#[test]
fn test_run_recovers_from_single_fault() {
    let mut source = ScriptedSource::new(2, true);
    let (mut pipeline, producer) = scripted_pipeline(&mono_config(), Vec::new(), &source);

    source.start(producer).unwrap();
    // second run of the source ends cleanly
    source.fault_every_start = false;
    let reason = pipeline.run(&mut source).unwrap();

    assert_eq!(reason, StopReason::SourceClosed);
    assert_eq!(source.starts, 2);
    assert_eq!(pipeline.stats().faults, 1);
    assert_eq!(pipeline.stats().frames, 4);
}

#[test]
fn test_run_stops_on_shutdown() {
    let mut source = SilentSource::default();
    let (mut pipeline, producer) = scripted_pipeline(&mono_config(), Vec::new(), &source);
    source.start(producer).unwrap();

    let handle = pipeline.shutdown_handle();
    let stopper = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        handle.shutdown();
    });

    assert_eq!(pipeline.run(&mut source).unwrap(), StopReason::Shutdown);
    stopper.join().unwrap();
    assert!(source.producer.is_none());
    assert_eq!(pipeline.stats().frames, 0);
}

#[test]
fn test_blocks_become_frames_in_order() {
    let (mut frames, mut producer) = FrameSource::new(3, FRAME_LEN).unwrap();
    let normalizer = FrameNormalizer::new(NormalizerConfig {
            stride: 1,
            channel: 0,
            attenuation: 14,
            dc_offset: 1650,
        }, FRAME_LEN).unwrap();

    for v in 1..=3 {
        producer.write(&block(v << 14));
    }

    for (expected_seq, v) in (0u64..).zip(1..=3i16) {
        let block = frames.next_block().unwrap();
        assert_eq!(block.seq(), expected_seq);
        let frame = normalizer.normalize(&block).unwrap();
        assert!(frame.samples().iter().all(|&s| s == v + 1650));
    }
    assert_eq!(frames.delivered(), 3);
    assert_eq!(frames.overruns(), 0);
}

#[test]
fn test_interleaved_normalization_is_deterministic() {
    let config = NormalizerConfig {
        stride: 3,
        channel: 0,
        attenuation: 14,
        dc_offset: 1650,
    };
    let block_len = FrameNormalizer::block_len_for(3);
    let normalizer = FrameNormalizer::new(config, block_len).unwrap();

    let raw: Vec<i32> = (0..block_len)
        .map(|i| {
            let i = i32::try_from(i).unwrap();
            if i % 3 == 0 { (i / 3) << 16 } else { -1 << 30 }
        })
        .collect();

    let first = normalizer.normalize(&raw).unwrap();
    let second = normalizer.normalize(&raw).unwrap();
    assert_eq!(first, second);
    for (i, &sample) in (0i16..).zip(first.samples().iter()) {
        assert_eq!(sample, i * 4 + 1650);
    }
}

#[test]
fn test_config_file_drives_command_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("genie.toml");
    std::fs::write(
        &path,
        r#"
[audio]
stride = 1

[outputs]
indicator = "status"

[[commands]]
word_id = 4
phrase = "lights_on"
output = "lamp"
"#,
    )
    .unwrap();

    let config = Config::load(Some(path.as_path())).unwrap();
    assert_eq!(config.commands.len(), 1);
    assert_eq!(config.countdown_frames(), COMMAND_COUNTDOWN);

    let source = SilentSource::default();
    let (mut pipeline, mut producer) = scripted_pipeline(
        &config,
        vec![
            ScriptStep::recognize("trigger", 1, 1),
            ScriptStep::recognize("command", 1, 4),
        ],
        &source,
    );

    feed(&mut pipeline, &mut producer).unwrap();
    assert_eq!(pipeline.dispatcher().outputs().level("status"), Some(true));
    let report = feed(&mut pipeline, &mut producer).unwrap();
    assert!(matches!(report.event, ModeEvent::Command { word_id: 4, .. }));
    assert_eq!(pipeline.dispatcher().outputs().level("lamp"), Some(true));
    assert_eq!(pipeline.dispatcher().outputs().level("status"), Some(false));
}

#[test]
fn test_unbound_command_word_is_ignored() {
    let (mut pipeline, mut producer) = started_pipeline(vec![
        ScriptStep::recognize("trigger", 1, 1),
        ScriptStep::recognize("command", 1, 9),
    ]);

    feed(&mut pipeline, &mut producer).unwrap();
    let report = feed(&mut pipeline, &mut producer).unwrap();
    assert_eq!(
        report.event,
        ModeEvent::Command {
            word_id: 9,
            applied: None
        }
    );
    assert_eq!(report.mode, Mode::TriggerWait);
    assert_eq!(pipeline.dispatcher().state("green"), Some(false));
}

#[test]
fn test_wav_replay_runs_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("speech.wav");
    // ten full blocks and a partial one
    let samples: Vec<i16> = (0..FRAME_LEN * 10 + 100)
        .map(|i| i16::try_from(i % 200).unwrap())
        .collect();
    write_wav(&path, &samples, 16_000).unwrap();

    let mut source = WavSource::open(&path, 20.0).unwrap();
    let (mut pipeline, producer) = scripted_pipeline(&Config::default(), Vec::new(), &source);
    source.start(producer).unwrap();

    assert_eq!(pipeline.run(&mut source).unwrap(), StopReason::SourceClosed);
    let stats = pipeline.stats();
    assert_eq!(stats.frames + stats.overruns, 11);
    assert_eq!(stats.faults, 0);
    assert!(!source.is_running());
}
