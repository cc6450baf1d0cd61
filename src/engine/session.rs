//! Persistent recognition session
//!
//! One engine handle for the life of the pipeline. Scratch memory is sized
//! once at startup; mode switches only rebind the grammar/model pair and
//! re-run initialize on the same memory.

use std::time::{Duration, Instant};

use super::{
    EngineInfo, EngineSetup, HEADER_VERSION, ModelPair, RecoResult, RecognitionEngine,
    RecognizerSettings, StatusClass, StatusCode,
};
use crate::{Error, Result};

/// A grammar/model pair plus the per-mode knobs applied with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Grammar and network
    pub pair: ModelPair,
    /// Detection sensitivity offset (negative: fewer false accepts)
    pub param_a_offset: i16,
    /// Seconds to wait for speech before a timeout (0 = forever)
    pub timeout_secs: u16,
}

impl Binding {
    /// Label of the bound grammar
    #[must_use]
    pub fn label(&self) -> &str {
        self.pair.label()
    }
}

/// Caller-visible session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No successful initialize yet
    Uninitialized,
    /// Accepting frames
    Ready,
    /// A fatal status was seen; only a full allocate + initialize revives it
    Halted,
}

/// Outcome of a hot swap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reinit {
    /// The new binding is active
    Swapped,
    /// The new binding was rejected and the previous one restored
    Retained(StatusCode),
}

/// Owns the engine, its scratch memory and the active binding
pub struct RecognitionSession<E> {
    engine: E,
    settings: RecognizerSettings,
    memory: Vec<u8>,
    active: Option<Binding>,
    allocated: Option<Binding>,
    state: SessionState,
    nnpq_override: Option<u16>,
    last_push: Duration,
}

fn setup<'a>(settings: &'a RecognizerSettings, binding: &'a Binding) -> EngineSetup<'a> {
    EngineSetup {
        header_version: HEADER_VERSION,
        pair: &binding.pair,
        settings,
        timeout_secs: binding.timeout_secs,
        param_a_offset: binding.param_a_offset,
    }
}

impl<E: RecognitionEngine> RecognitionSession<E> {
    /// Wrap an engine; nothing is allocated yet
    #[must_use]
    pub const fn new(engine: E, settings: RecognizerSettings) -> Self {
        Self {
            engine,
            settings,
            memory: Vec::new(),
            active: None,
            allocated: None,
            state: SessionState::Uninitialized,
            nnpq_override: None,
            last_push: Duration::ZERO,
        }
    }

    /// Promote deferred results whose post-qualifier score reaches `threshold`
    #[must_use]
    pub fn with_nnpq_override(mut self, threshold: Option<u16>) -> Self {
        self.nnpq_override = threshold;
        self
    }

    /// Engine version information
    #[must_use]
    pub fn info(&self) -> EngineInfo {
        self.engine.info()
    }

    /// Scratch memory needed for `binding`
    ///
    /// Remembers `binding` as the target of the next [`initialize`](Self::initialize).
    ///
    /// # Errors
    ///
    /// Returns an engine error when the pair or settings are unsupported
    pub fn allocate(&mut self, binding: &Binding) -> Result<usize> {
        let size = self
            .engine
            .query_required_memory(&setup(&self.settings, binding))
            .map_err(|status| {
                tracing::error!(grammar = binding.label(), %status, "allocate failed");
                Error::engine(status, "allocate")
            })?;

        tracing::debug!(grammar = binding.label(), size, "engine memory sized");
        self.allocated = Some(binding.clone());
        Ok(size)
    }

    /// Bind `memory` and initialize with the last allocated binding
    ///
    /// Also the restart path after a halt.
    ///
    /// # Errors
    ///
    /// Returns an engine error if nothing was allocated, the memory is empty
    /// or the engine rejects the binding
    pub fn initialize(&mut self, memory: Vec<u8>) -> Result<()> {
        let Some(binding) = self.allocated.clone() else {
            return Err(Error::engine(StatusCode::BAD_SETUP, "initialize"));
        };
        if memory.is_empty() {
            return Err(Error::engine(StatusCode::PSTORE, "initialize"));
        }

        self.memory = memory;
        self.state = SessionState::Uninitialized;
        self.engine
            .initialize(&setup(&self.settings, &binding), &mut self.memory)
            .map_err(|status| Error::engine(status, "initialize"))?;

        tracing::info!(
            grammar = binding.label(),
            memory = self.memory.len(),
            detector = self.settings.detector.code(),
            "recognizer initialized"
        );
        self.active = Some(binding);
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Swap to `binding` on the existing memory
    ///
    /// On a setup error the previous binding is re-initialized so the
    /// session stays usable and [`Reinit::Retained`] is returned.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not ready, the engine reports a fatal
    /// status, or restoring the previous binding also fails
    pub fn reinitialize(&mut self, binding: &Binding) -> Result<Reinit> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Uninitialized => return Err(Error::SessionNotReady),
            SessionState::Halted => return Err(Error::SessionHalted),
        }

        let status = match self
            .engine
            .initialize(&setup(&self.settings, binding), &mut self.memory)
        {
            Ok(()) => {
                tracing::debug!(
                    grammar = binding.label(),
                    offset = binding.param_a_offset,
                    "recognizer rebound"
                );
                self.active = Some(binding.clone());
                return Ok(Reinit::Swapped);
            }
            Err(status) => status,
        };

        if status.class() != StatusClass::Setup {
            self.state = SessionState::Halted;
            return Err(Error::engine(status, "reinitialize"));
        }

        tracing::warn!(grammar = binding.label(), %status, "rebind rejected, restoring previous grammar");
        let Some(previous) = self.active.as_ref() else {
            self.state = SessionState::Halted;
            return Err(Error::engine(status, "reinitialize"));
        };
        if let Err(restore) = self
            .engine
            .initialize(&setup(&self.settings, previous), &mut self.memory)
        {
            self.state = SessionState::Halted;
            return Err(Error::engine(restore, "restore"));
        }

        Ok(Reinit::Retained(status))
    }

    /// Feed one frame
    ///
    /// Fatal statuses are returned as results and halt the session; the
    /// caller decides how to report them.
    ///
    /// # Errors
    ///
    /// Returns error if the session is not initialized or already halted
    pub fn push(&mut self, frame: &super::Frame) -> Result<RecoResult> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Uninitialized => return Err(Error::SessionNotReady),
            SessionState::Halted => return Err(Error::SessionHalted),
        }

        let started = Instant::now();
        let mut result = self.engine.push_frame(&mut self.memory, frame);
        self.last_push = started.elapsed();

        if let Some(threshold) = self.nnpq_override {
            apply_nnpq_override(&mut result, threshold);
        }

        if matches!(result.status.class(), StatusClass::Fatal | StatusClass::Setup) {
            self.state = SessionState::Halted;
        }
        Ok(result)
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Active binding
    #[must_use]
    pub const fn binding(&self) -> Option<&Binding> {
        self.active.as_ref()
    }

    /// Size of the scratch memory block
    #[must_use]
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    /// Wall time of the last push
    #[must_use]
    pub const fn last_push_elapsed(&self) -> Duration {
        self.last_push
    }

    /// The wrapped engine
    #[must_use]
    pub const fn engine(&self) -> &E {
        &self.engine
    }
}

/// Re-judge a deferred result against a local post-qualifier threshold
fn apply_nnpq_override(result: &mut RecoResult, threshold: u16) {
    if result.word_id == 0 || result.nnpq_score <= 0 {
        return;
    }
    result.nnpq_threshold = threshold;
    if !result.nnpq_pass && result.nnpq_score >= i32::from(threshold) {
        result.status = StatusCode::OK;
        result.nnpq_pass = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Frame, ModelBlob, ScriptOutcome, ScriptStep, ScriptedEngine};

    fn binding(label: &str, len: usize) -> Binding {
        Binding {
            pair: ModelPair::new(
                ModelBlob::new(label, vec![1u8; len]),
                ModelBlob::new(format!("{label}-net"), vec![2u8; 64]),
            ),
            param_a_offset: 0,
            timeout_secs: 0,
        }
    }

    fn ready(steps: Vec<ScriptStep>) -> RecognitionSession<ScriptedEngine> {
        let mut session =
            RecognitionSession::new(ScriptedEngine::from_steps(steps), RecognizerSettings::default());
        let size = session.allocate(&binding("trigger", 64)).unwrap();
        session.initialize(vec![0; size]).unwrap();
        session
    }

    #[test]
    fn test_push_before_initialize() {
        let mut session =
            RecognitionSession::new(ScriptedEngine::from_steps(Vec::new()), RecognizerSettings::default());
        assert!(matches!(
            session.push(&Frame::silence()),
            Err(Error::SessionNotReady)
        ));
    }

    #[test]
    fn test_initialize_without_allocate() {
        let mut session =
            RecognitionSession::new(ScriptedEngine::from_steps(Vec::new()), RecognizerSettings::default());
        let err = session.initialize(vec![0; 1024]).unwrap_err();
        assert!(matches!(
            err,
            Error::Engine { status: StatusCode::BAD_SETUP, .. }
        ));
    }

    #[test]
    fn test_initialize_with_empty_memory() {
        let mut session =
            RecognitionSession::new(ScriptedEngine::from_steps(Vec::new()), RecognizerSettings::default());
        session.allocate(&binding("trigger", 64)).unwrap();
        let err = session.initialize(Vec::new()).unwrap_err();
        assert!(matches!(err, Error::Engine { status: StatusCode::PSTORE, .. }));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_reinitialize_keeps_memory() {
        let mut session = ready(Vec::new());
        let before = session.memory_len();

        let swapped = session.reinitialize(&binding("command", 32)).unwrap();
        assert_eq!(swapped, Reinit::Swapped);
        assert_eq!(session.memory_len(), before);
        assert_eq!(session.binding().map(Binding::label), Some("command"));
        assert_eq!(session.engine().bound(), Some("command"));
    }

    #[test]
    fn test_rejected_rebind_restores_previous() {
        let mut session = ready(Vec::new());

        let outcome = session.reinitialize(&binding("broken", 30)).unwrap();
        assert_eq!(outcome, Reinit::Retained(StatusCode::GRAMMAR_UNALIGNED));
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.binding().map(Binding::label), Some("trigger"));
        assert_eq!(session.engine().bound(), Some("trigger"));
    }

    #[test]
    fn test_fatal_push_halts() {
        let mut session = ready(vec![ScriptStep::status("trigger", 1, StatusCode::LICENSE)]);

        let result = session.push(&Frame::silence()).unwrap();
        assert_eq!(result.status, StatusCode::LICENSE);
        assert_eq!(session.state(), SessionState::Halted);
        assert!(matches!(
            session.push(&Frame::silence()),
            Err(Error::SessionHalted)
        ));
        assert!(matches!(
            session.reinitialize(&binding("trigger", 64)),
            Err(Error::SessionHalted)
        ));
        assert_eq!(session.engine().pushes(), 1);
    }

    #[test]
    fn test_restart_after_halt() {
        let mut session = ready(vec![ScriptStep::status("trigger", 1, StatusCode::LICENSE)]);
        session.push(&Frame::silence()).unwrap();
        assert_eq!(session.state(), SessionState::Halted);

        let size = session.allocate(&binding("trigger", 64)).unwrap();
        session.initialize(vec![0; size]).unwrap();
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_nnpq_override_promotes_deferred_result() {
        let step = ScriptStep {
            grammar: Some("trigger".to_string()),
            after_frames: 1,
            outcome: ScriptOutcome::Recognized {
                word_id: 1,
                score: 700,
                nnpq_score: 27_000,
                nnpq_threshold: 30_000,
                nnpq_pass: false,
            },
        };

        let mut plain = ready(vec![step.clone()]);
        let result = plain.push(&Frame::silence()).unwrap();
        assert_eq!(result.status, StatusCode::NOT_FINISHED);

        let mut tuned = ready(vec![step]).with_nnpq_override(Some(25_000));
        let result = tuned.push(&Frame::silence()).unwrap();
        assert_eq!(result.status, StatusCode::OK);
        assert!(result.nnpq_pass);
        assert_eq!(result.nnpq_threshold, 25_000);
    }
}
