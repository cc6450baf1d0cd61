//! Deterministic stand-in for the recognizer
//!
//! Replays a script of recognition events instead of listening. Each step
//! waits until its grammar is bound and a number of frames have been pushed
//! since the last initialize, then reports its outcome. The engine enforces
//! the same setup rules the real recognizer documents (header version,
//! channel limits, blob presence and alignment, memory size), a recognition
//! licence limit, and a per-session speech timeout. Chosen initialize calls
//! can be made to fail, so grammar swaps that the engine rejects can be
//! driven without hardware too.

use std::collections::VecDeque;
use std::path::Path;

use serde::Deserialize;

use super::{
    EngineInfo, EngineSetup, FRAME_LEN, FRAME_MS, Frame, HEADER_VERSION, N_WAY_MAX,
    RecoResult, RecognitionEngine, StatusCode,
};
use crate::Result;

const BASE_BYTES: usize = 4096;
const TOKEN_BYTES: usize = 32;
const RESULT_BYTES: usize = 16;
const CANARY: [u8; 4] = *b"GNIE";

/// What a step reports when it fires
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ScriptOutcome {
    /// A phrase from the bound grammar
    Recognized {
        /// Phrase index
        word_id: u16,
        /// Search score
        #[serde(default)]
        score: u16,
        /// Post-qualifier score
        #[serde(default)]
        nnpq_score: i32,
        /// Post-qualifier threshold
        #[serde(default)]
        nnpq_threshold: u16,
        /// When false the engine defers the result as not finished
        #[serde(default = "default_true")]
        nnpq_pass: bool,
    },
    /// No speech before the timeout
    Timeout,
    /// Any raw status
    Status {
        /// Status value
        code: u16,
    },
}

const fn default_true() -> bool {
    true
}

/// One scripted event
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ScriptStep {
    /// Grammar label that must be bound; any grammar when absent
    #[serde(default)]
    pub grammar: Option<String>,
    /// Frames since the last initialize before the step fires
    #[serde(default)]
    pub after_frames: u64,
    /// Reported outcome
    #[serde(flatten)]
    pub outcome: ScriptOutcome,
}

impl ScriptStep {
    /// Recognize `word_id` once `grammar` has seen `after_frames` frames
    #[must_use]
    pub fn recognize(grammar: &str, after_frames: u64, word_id: u16) -> Self {
        Self {
            grammar: Some(grammar.to_string()),
            after_frames,
            outcome: ScriptOutcome::Recognized {
                word_id,
                score: 0,
                nnpq_score: 0,
                nnpq_threshold: 0,
                nnpq_pass: true,
            },
        }
    }

    /// Report a speech timeout
    #[must_use]
    pub fn timeout(grammar: &str, after_frames: u64) -> Self {
        Self {
            grammar: Some(grammar.to_string()),
            after_frames,
            outcome: ScriptOutcome::Timeout,
        }
    }

    /// Report a raw status
    #[must_use]
    pub fn status(grammar: &str, after_frames: u64, code: StatusCode) -> Self {
        Self {
            grammar: Some(grammar.to_string()),
            after_frames,
            outcome: ScriptOutcome::Status { code: code.0 },
        }
    }

    fn matches(&self, bound: &str, frames: u64) -> bool {
        self.grammar.as_deref().is_none_or(|g| g == bound) && frames >= self.after_frames
    }
}

/// Script file schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Script {
    /// Recognitions allowed before the engine reports a licence error
    #[serde(default)]
    pub license_limit: Option<u32>,
    /// Grammar labels rejected as an unsupported version
    #[serde(default)]
    pub reject: Vec<String>,
    /// Initialize calls, counted from 1, that fail with a grammar/net mismatch
    #[serde(default)]
    pub fail_inits: Vec<u32>,
    /// Events in firing order
    #[serde(default)]
    pub steps: Vec<ScriptStep>,
}

impl Script {
    /// Parse a TOML script
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let script: Self = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), steps = script.steps.len(), "loaded engine script");
        Ok(script)
    }
}

/// Record of one successful initialize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRecord {
    /// Grammar label bound
    pub grammar: String,
    /// Sensitivity offset in force
    pub param_a_offset: i16,
    /// Speech timeout in force
    pub timeout_secs: u16,
}

/// Recognizer driven by a [`Script`]
#[derive(Debug)]
pub struct ScriptedEngine {
    version: u32,
    steps: VecDeque<ScriptStep>,
    license_limit: Option<u32>,
    reject: Vec<String>,
    fail_inits: Vec<u32>,
    init_calls: u32,
    bound: Option<String>,
    timeout_frames: u64,
    frames_since_init: u64,
    frame_count: u64,
    recognitions: u32,
    pushes: u64,
    inits: Vec<InitRecord>,
}

impl ScriptedEngine {
    /// Engine replaying `script`
    #[must_use]
    pub fn new(script: Script) -> Self {
        Self {
            version: HEADER_VERSION,
            steps: script.steps.into(),
            license_limit: script.license_limit,
            reject: script.reject,
            fail_inits: script.fail_inits,
            init_calls: 0,
            bound: None,
            timeout_frames: 0,
            frames_since_init: 0,
            frame_count: 0,
            recognitions: 0,
            pushes: 0,
            inits: Vec::new(),
        }
    }

    /// Engine with only steps
    #[must_use]
    pub fn from_steps(steps: Vec<ScriptStep>) -> Self {
        Self::new(Script {
            steps,
            ..Script::default()
        })
    }

    /// Pretend to be a different engine build
    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Successful initializations, oldest first
    #[must_use]
    pub fn inits(&self) -> &[InitRecord] {
        &self.inits
    }

    /// Total frames pushed
    #[must_use]
    pub const fn pushes(&self) -> u64 {
        self.pushes
    }

    /// Currently bound grammar label
    #[must_use]
    pub fn bound(&self) -> Option<&str> {
        self.bound.as_deref()
    }

    /// Steps not yet fired
    #[must_use]
    pub fn remaining_steps(&self) -> usize {
        self.steps.len()
    }

    fn required_memory(&self, setup: &EngineSetup<'_>) -> std::result::Result<usize, StatusCode> {
        if setup.header_version != self.version {
            return Err(StatusCode::HEADER_VERSION);
        }

        let settings = setup.settings;
        let ways = settings.channels.saturating_mul(settings.depth);
        if ways == 0 || ways > N_WAY_MAX {
            return Err(StatusCode::N_WAY_LIMIT);
        }
        if settings.max_results == 0 || settings.max_tokens == 0 {
            return Err(StatusCode::SETUP_NOT_SUPPORTED);
        }
        if settings.audio_buffer_len as usize % FRAME_LEN != 0 {
            return Err(StatusCode::AUDIOBUFFER_BAD_SIZE);
        }

        let grammar = setup.pair.grammar.bytes();
        let net = setup.pair.net.bytes();
        if grammar.is_empty() || net.is_empty() {
            return Err(StatusCode::BAD_SETUP);
        }
        if grammar.len() % 4 != 0 {
            return Err(StatusCode::GRAMMAR_UNALIGNED);
        }
        if net.len() % 4 != 0 {
            return Err(StatusCode::DNN_UNALIGNED);
        }
        if self.reject.iter().any(|r| r == setup.pair.label()) {
            return Err(StatusCode::BAD_VERSION);
        }

        let audio = settings.audio_buffer_len as usize * 2 * usize::from(settings.channels);
        Ok(BASE_BYTES
            + usize::from(settings.max_tokens) * TOKEN_BYTES
            + usize::from(settings.max_results) * RESULT_BYTES
            + audio)
    }

    fn fire(&mut self, outcome: ScriptOutcome) -> RecoResult {
        match outcome {
            ScriptOutcome::Recognized {
                word_id,
                score,
                nnpq_score,
                nnpq_threshold,
                nnpq_pass,
            } => {
                if self
                    .license_limit
                    .is_some_and(|limit| self.recognitions >= limit)
                {
                    return RecoResult::with_status(StatusCode::LICENSE, self.frame_count);
                }
                let status = if nnpq_pass {
                    self.recognitions += 1;
                    StatusCode::OK
                } else {
                    StatusCode::NOT_FINISHED
                };
                #[allow(clippy::cast_possible_truncation)]
                let duration = self.frames_since_init.min(u64::from(u16::MAX)) as u16;
                RecoResult {
                    status,
                    word_id,
                    duration,
                    final_score: score,
                    nnpq_score,
                    nnpq_threshold,
                    nnpq_pass,
                    frame_count: self.frame_count,
                }
            }
            ScriptOutcome::Timeout => {
                RecoResult::with_status(StatusCode::DATACOL_TIMEOUT, self.frame_count)
            }
            ScriptOutcome::Status { code } => {
                RecoResult::with_status(StatusCode(code), self.frame_count)
            }
        }
    }
}

impl RecognitionEngine for ScriptedEngine {
    fn info(&self) -> EngineInfo {
        EngineInfo {
            version: self.version,
        }
    }

    fn query_required_memory(
        &mut self,
        setup: &EngineSetup<'_>,
    ) -> std::result::Result<usize, StatusCode> {
        self.required_memory(setup)
    }

    fn initialize(
        &mut self,
        setup: &EngineSetup<'_>,
        memory: &mut [u8],
    ) -> std::result::Result<(), StatusCode> {
        self.init_calls += 1;
        if self.fail_inits.contains(&self.init_calls) {
            return Err(StatusCode::NN_MISMATCH);
        }
        if memory.is_empty() {
            return Err(StatusCode::PSTORE);
        }
        let required = self.required_memory(setup)?;
        if memory.len() < required {
            return Err(StatusCode::PSTORE);
        }

        memory.fill(0);
        memory[..CANARY.len()].copy_from_slice(&CANARY);

        let label = setup.pair.label().to_string();
        self.timeout_frames = u64::from(setup.timeout_secs) * 1000 / u64::from(FRAME_MS);
        self.frames_since_init = 0;
        self.inits.push(InitRecord {
            grammar: label.clone(),
            param_a_offset: setup.param_a_offset,
            timeout_secs: setup.timeout_secs,
        });
        self.bound = Some(label);
        Ok(())
    }

    fn push_frame(&mut self, memory: &mut [u8], _frame: &Frame) -> RecoResult {
        self.pushes += 1;

        if self.bound.is_none() {
            return RecoResult::with_status(StatusCode::NULL_POINTER, self.frame_count);
        }
        if !memory.starts_with(&CANARY) {
            return RecoResult::with_status(StatusCode::MEMORY_CORRUPT, self.frame_count);
        }

        self.frame_count += 1;
        self.frames_since_init += 1;

        let fires = match (self.bound.as_deref(), self.steps.front()) {
            (Some(bound), Some(step)) => step.matches(bound, self.frames_since_init),
            _ => false,
        };
        if fires && let Some(step) = self.steps.pop_front() {
            return self.fire(step.outcome);
        }

        if self.timeout_frames > 0 && self.frames_since_init >= self.timeout_frames {
            return RecoResult::with_status(StatusCode::DATACOL_TIMEOUT, self.frame_count);
        }

        RecoResult::pending(self.frame_count)
    }
}
