//! Shared test utilities

#![allow(dead_code)]

use genie_voice::engine::{Binding, FRAME_LEN, ModelBlob, ModelPair, ScriptStep};
use genie_voice::voice::{BlockProducer, MemoryOutputs};
use genie_voice::{Config, Pipeline, ScriptedEngine};

/// Binding with well-formed blobs under `label`
#[must_use]
pub fn binding(label: &str, timeout_secs: u16) -> Binding {
    Binding {
        pair: ModelPair::new(
            ModelBlob::new(label, vec![0u8; 64]),
            ModelBlob::new(format!("{label}-net"), vec![0u8; 128]),
        ),
        param_a_offset: 0,
        timeout_secs,
    }
}

/// Mono config with the reference defaults otherwise
#[must_use]
pub fn mono_config() -> Config {
    let mut config = Config::default();
    config.audio.stride = Some(1);
    config
}

/// Started pipeline over a scripted engine and in-memory outputs
#[must_use]
pub fn started_pipeline(
    steps: Vec<ScriptStep>,
) -> (Pipeline<ScriptedEngine, MemoryOutputs>, BlockProducer) {
    let (mut pipeline, producer) = Pipeline::assemble(
        &mono_config(),
        (binding("trigger", 0), binding("command", 0)),
        ScriptedEngine::from_steps(steps),
        MemoryOutputs::default(),
        1,
    )
    .expect("failed to assemble pipeline");
    pipeline.start().expect("failed to start pipeline");
    (pipeline, producer)
}

/// One block of a constant raw sample
#[must_use]
pub fn block(value: i32) -> [i32; FRAME_LEN] {
    [value; FRAME_LEN]
}
