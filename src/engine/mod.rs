//! Recognition engine contract
//!
//! The recognizer itself is an external black box. This module describes the
//! narrow contract the pipeline consumes: size the scratch memory, initialize
//! against a grammar/model pair, then push one frame at a time and read back
//! a result. [`RecognitionSession`] wraps an engine with the hot-swap and
//! halt rules the mode controller relies on.

mod scripted;
mod session;
mod status;

use std::path::Path;
use std::sync::Arc;

pub use scripted::{InitRecord, Script, ScriptOutcome, ScriptStep, ScriptedEngine};
pub use session::{Binding, Reinit, RecognitionSession, SessionState};
pub use status::{StatusClass, StatusCode};

use crate::Result;

/// Samples per frame fed to the engine (15 ms at 16 kHz)
pub const FRAME_LEN: usize = 240;

/// Frame duration in milliseconds
pub const FRAME_MS: u32 = 15;

/// Default cap on search tokens
pub const MAX_TOKENS: u16 = 300;

/// Default cap on returned results
pub const MAX_RESULTS: u16 = 6;

/// Upper bound on `channels * depth` the engine was built for
pub const N_WAY_MAX: u16 = 12;

/// Engine interface version this crate was written against (8.3.2)
pub const HEADER_VERSION: u32 = encode_version(8, 3, 2);

/// Pack a version triple the way the engine reports it
#[must_use]
pub const fn encode_version(major: u32, minor: u32, point: u32) -> u32 {
    (major << 20) + (minor << 12) + point
}

/// One frame of normalized single-channel audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    samples: [i16; FRAME_LEN],
}

impl Frame {
    /// Frame of digital silence
    #[must_use]
    pub const fn silence() -> Self {
        Self {
            samples: [0; FRAME_LEN],
        }
    }

    /// Wrap already-normalized samples
    #[must_use]
    pub const fn from_samples(samples: [i16; FRAME_LEN]) -> Self {
        Self { samples }
    }

    /// Sample view
    #[must_use]
    pub const fn samples(&self) -> &[i16; FRAME_LEN] {
        &self.samples
    }

    pub(crate) const fn samples_mut(&mut self) -> &mut [i16; FRAME_LEN] {
        &mut self.samples
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::silence()
    }
}

/// Speech detector run in front of the recognizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detector {
    /// Recognize continuously
    #[default]
    None,
    /// Low power sound detect
    Lpsd,
    /// Speech detection driven by the grammar
    UseGrammar,
    /// Sound detect performed outside the engine
    ExternalLpsd,
}

impl Detector {
    /// Engine wire value
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Lpsd => 2,
            Self::UseGrammar => 3,
            Self::ExternalLpsd => 4,
        }
    }
}

/// Opaque grammar or acoustic model data
///
/// The byte layout belongs to the engine; the pipeline only carries the
/// bytes around under a label used for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelBlob {
    label: String,
    bytes: Arc<[u8]>,
}

impl ModelBlob {
    /// Wrap bytes under a label
    #[must_use]
    pub fn new(label: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            label: label.into(),
            bytes: bytes.into(),
        }
    }

    /// Read a blob from disk
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read
    pub fn load(label: impl Into<String>, path: &Path) -> Result<Self> {
        let label = label.into();
        let bytes = std::fs::read(path)?;
        tracing::debug!(label, path = %path.display(), size = bytes.len(), "loaded model blob");
        Ok(Self::new(label, bytes))
    }

    /// Label given at load time
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Raw bytes
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Grammar plus the matching network, always swapped together
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelPair {
    /// Search grammar (phrase table)
    pub grammar: ModelBlob,
    /// Acoustic network weights
    pub net: ModelBlob,
}

impl ModelPair {
    /// Pair a grammar with its network
    #[must_use]
    pub const fn new(grammar: ModelBlob, net: ModelBlob) -> Self {
        Self { grammar, net }
    }

    /// Grammar label, used to name the pair in logs
    #[must_use]
    pub fn label(&self) -> &str {
        self.grammar.label()
    }
}

/// Recognizer settings that stay fixed across mode switches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognizerSettings {
    /// Search token cap
    pub max_tokens: u16,
    /// Result cap
    pub max_results: u16,
    /// Speech detector type
    pub detector: Detector,
    /// Channels handled by one handle
    pub channels: u16,
    /// Frames handled per channel per push
    pub depth: u16,
    /// Length of the engine's audio history in samples
    pub audio_buffer_len: u32,
}

impl Default for RecognizerSettings {
    #[allow(clippy::cast_possible_truncation)]
    fn default() -> Self {
        Self {
            max_tokens: MAX_TOKENS,
            max_results: MAX_RESULTS,
            detector: Detector::None,
            channels: 1,
            depth: 1,
            // 600 ms of history
            audio_buffer_len: (600 / FRAME_MS) * FRAME_LEN as u32,
        }
    }
}

/// Everything the engine reads when sizing or initializing a handle
#[derive(Debug, Clone, Copy)]
pub struct EngineSetup<'a> {
    /// Interface version the caller was built against
    pub header_version: u32,
    /// Active grammar/model pair
    pub pair: &'a ModelPair,
    /// Fixed recognizer settings
    pub settings: &'a RecognizerSettings,
    /// Seconds to wait for speech before reporting a timeout (0 = forever)
    pub timeout_secs: u16,
    /// Detection sensitivity offset, centered on 0
    pub param_a_offset: i16,
}

/// Static engine information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineInfo {
    /// Packed version, see [`encode_version`]
    pub version: u32,
}

impl EngineInfo {
    /// `major.minor.point`
    #[must_use]
    pub fn version_string(&self) -> String {
        format!(
            "{}.{}.{}",
            (self.version >> 20) & 0x0fff,
            (self.version >> 12) & 0x00ff,
            self.version & 0x0fff
        )
    }
}

/// Outcome of one push
///
/// Plain value: copy out what you need, the next push replaces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoResult {
    /// Engine status
    pub status: StatusCode,
    /// Phrase index into the active grammar, 0 when nothing was recognized
    pub word_id: u16,
    /// Utterance length in frames
    pub duration: u16,
    /// Search score
    pub final_score: u16,
    /// Neural post-qualifier score
    pub nnpq_score: i32,
    /// Post-qualifier threshold from the model
    pub nnpq_threshold: u16,
    /// Whether the post-qualifier passed
    pub nnpq_pass: bool,
    /// Frames consumed since the handle was initialized
    pub frame_count: u64,
}

impl RecoResult {
    /// Result for a frame that produced nothing yet
    #[must_use]
    pub const fn pending(frame_count: u64) -> Self {
        Self::with_status(StatusCode::NOT_FINISHED, frame_count)
    }

    /// Result carrying only a status
    #[must_use]
    pub const fn with_status(status: StatusCode, frame_count: u64) -> Self {
        Self {
            status,
            word_id: 0,
            duration: 0,
            final_score: 0,
            nnpq_score: 0,
            nnpq_threshold: 0,
            nnpq_pass: false,
            frame_count,
        }
    }

    /// Word id if the engine named one
    #[must_use]
    pub const fn word(&self) -> Option<u16> {
        if self.word_id == 0 {
            None
        } else {
            Some(self.word_id)
        }
    }
}

/// The external recognizer
///
/// Implementations own no scratch memory: the session allocates the block
/// once and lends it on every call.
pub trait RecognitionEngine {
    /// Version and build information
    fn info(&self) -> EngineInfo;

    /// Bytes of scratch memory needed for `setup`
    ///
    /// # Errors
    ///
    /// Returns the engine status when the pair or settings are unsupported
    fn query_required_memory(&mut self, setup: &EngineSetup<'_>) -> std::result::Result<usize, StatusCode>;

    /// Prepare `memory` for recognition with `setup`
    ///
    /// # Errors
    ///
    /// Returns the engine status when the memory or the pair is invalid
    fn initialize(
        &mut self,
        setup: &EngineSetup<'_>,
        memory: &mut [u8],
    ) -> std::result::Result<(), StatusCode>;

    /// Feed one frame
    fn push_frame(&mut self, memory: &mut [u8], frame: &Frame) -> RecoResult;
}
