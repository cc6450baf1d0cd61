//! Two-stage recognition mode controller
//!
//! The pipeline listens for a trigger phrase with one grammar, then swaps
//! to the command grammar for a bounded window. A recognized command, a
//! speech timeout or the window running out all swap back to the trigger.
//! The countdown is checked before each push, so the window is never longer
//! than its configured frame count.

use std::time::Duration;

use crate::engine::{
    Binding, FRAME_MS, Frame, RecoResult, RecognitionEngine, RecognitionSession, Reinit,
    StatusClass, StatusCode,
};
use crate::voice::dispatch::{ActionDispatcher, Applied, OutputDevice};
use crate::{Error, Result};

/// Seconds the pipeline waits for a command after the trigger
pub const COMMAND_WINDOW_SECS: u32 = 3;

/// Command window in frames (3 s of 15 ms frames)
pub const COMMAND_COUNTDOWN: u32 = COMMAND_WINDOW_SECS * 1000 / FRAME_MS;

/// Which grammar the controller is listening with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Not started, or stopped after a fatal status
    Idle,
    /// Trigger grammar bound
    TriggerWait,
    /// Command grammar bound, countdown running
    CommandWait,
}

/// What happened on one frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeEvent {
    /// Nothing recognized yet
    Pending,
    /// Trigger phrase heard; now waiting for a command
    Trigger {
        /// Trigger phrase index
        word_id: u16,
        /// Search score
        score: u16,
    },
    /// Command phrase heard and dispatched
    Command {
        /// Command phrase index
        word_id: u16,
        /// Action taken, `None` for an unbound word
        applied: Option<Applied>,
    },
    /// The engine saw no speech before its timeout
    Timeout,
    /// A grammar swap was rejected; the previous grammar stays bound
    Retained {
        /// Status that rejected the swap
        status: StatusCode,
    },
}

/// Result of [`ModeController::on_frame`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReport {
    /// The command window ran out before this frame was pushed
    pub expired: bool,
    /// Outcome of the push
    pub event: ModeEvent,
    /// Raw engine result
    pub result: RecoResult,
    /// Mode after the frame
    pub mode: Mode,
    /// Wall time spent in the engine push
    pub push_time: Duration,
}

/// Drives a [`RecognitionSession`] through trigger and command modes
#[derive(Debug)]
pub struct ModeController {
    mode: Mode,
    countdown: u32,
    window: u32,
    trigger: Binding,
    command: Binding,
}

impl ModeController {
    /// Controller swapping between `trigger` and `command`
    ///
    /// `window` is the command countdown in frames.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty window
    pub fn new(trigger: Binding, command: Binding, window: u32) -> Result<Self> {
        if window == 0 {
            return Err(Error::Config("command window must be at least one frame".to_string()));
        }
        Ok(Self {
            mode: Mode::Idle,
            countdown: window,
            window,
            trigger,
            command,
        })
    }

    /// Size the scratch memory for both grammars and bind the trigger
    ///
    /// Also the restart path after a fatal status.
    ///
    /// # Errors
    ///
    /// Returns error if either grammar is rejected or the indicator cannot
    /// be driven
    pub fn start<E, O>(
        &mut self,
        session: &mut RecognitionSession<E>,
        dispatcher: &mut ActionDispatcher<O>,
    ) -> Result<usize>
    where
        E: RecognitionEngine,
        O: OutputDevice,
    {
        self.mode = Mode::Idle;
        let command_size = session.allocate(&self.command)?;
        // allocated last so initialize binds it
        let trigger_size = session.allocate(&self.trigger)?;
        let size = command_size.max(trigger_size);
        session.initialize(vec![0; size])?;

        self.mode = Mode::TriggerWait;
        self.countdown = self.window;
        dispatcher.set_listening(false)?;

        tracing::info!(
            trigger = self.trigger.label(),
            command = self.command.label(),
            memory = size,
            window = self.window,
            "listening for trigger"
        );
        Ok(size)
    }

    /// Handle one frame
    ///
    /// # Errors
    ///
    /// Returns error if the controller is not started, the engine reports a
    /// fatal or setup status, a grammar swap cannot be recovered, or an output
    /// line cannot be driven. The controller is idle afterwards for every
    /// engine failure.
    pub fn on_frame<E, O>(
        &mut self,
        session: &mut RecognitionSession<E>,
        dispatcher: &mut ActionDispatcher<O>,
        frame: &Frame,
    ) -> Result<FrameReport>
    where
        E: RecognitionEngine,
        O: OutputDevice,
    {
        if self.mode == Mode::Idle {
            return Err(Error::SessionNotReady);
        }

        let mut expired = false;
        if self.mode == Mode::CommandWait {
            self.countdown = self.countdown.saturating_sub(1);
            if self.countdown == 0 {
                expired = true;
                tracing::info!("no command heard");
                self.switch(session, dispatcher, Mode::TriggerWait)?;
            }
        }

        let result = session.push(frame).inspect_err(|_| self.mode = Mode::Idle)?;

        let event = match result.status.class() {
            StatusClass::Pending => ModeEvent::Pending,
            StatusClass::Recognized => self.on_recognized(session, dispatcher, &result)?,
            StatusClass::Timeout => {
                tracing::info!(mode = ?self.mode, "speech timeout");
                match self.switch(session, dispatcher, Mode::TriggerWait)? {
                    Reinit::Swapped => ModeEvent::Timeout,
                    Reinit::Retained(status) => ModeEvent::Retained { status },
                }
            }
            StatusClass::Setup | StatusClass::Fatal => {
                self.mode = Mode::Idle;
                tracing::error!(status = %result.status, "recognizer stopped");
                return Err(Error::engine(result.status, "push"));
            }
        };

        Ok(FrameReport {
            expired,
            event,
            result,
            mode: self.mode,
            push_time: session.last_push_elapsed(),
        })
    }

    fn on_recognized<E, O>(
        &mut self,
        session: &mut RecognitionSession<E>,
        dispatcher: &mut ActionDispatcher<O>,
        result: &RecoResult,
    ) -> Result<ModeEvent>
    where
        E: RecognitionEngine,
        O: OutputDevice,
    {
        match self.mode {
            Mode::TriggerWait => {
                tracing::info!(
                    word_id = result.word_id,
                    score = result.final_score,
                    nnpq = result.nnpq_score,
                    "trigger heard"
                );
                Ok(match self.switch(session, dispatcher, Mode::CommandWait)? {
                    Reinit::Swapped => ModeEvent::Trigger {
                        word_id: result.word_id,
                        score: result.final_score,
                    },
                    Reinit::Retained(status) => ModeEvent::Retained { status },
                })
            }
            Mode::CommandWait => {
                tracing::info!(
                    word_id = result.word_id,
                    phrase = dispatcher.phrase(result.word_id).unwrap_or("?"),
                    score = result.final_score,
                    "command heard"
                );
                let applied = dispatcher.dispatch(result.word_id)?;
                self.switch(session, dispatcher, Mode::TriggerWait)?;
                Ok(ModeEvent::Command {
                    word_id: result.word_id,
                    applied,
                })
            }
            Mode::Idle => Err(Error::SessionNotReady),
        }
    }

    /// Rebind for `target` and restart the countdown
    fn switch<E, O>(
        &mut self,
        session: &mut RecognitionSession<E>,
        dispatcher: &mut ActionDispatcher<O>,
        target: Mode,
    ) -> Result<Reinit>
    where
        E: RecognitionEngine,
        O: OutputDevice,
    {
        let binding = match target {
            Mode::TriggerWait => &self.trigger,
            Mode::CommandWait => &self.command,
            Mode::Idle => return Err(Error::SessionNotReady),
        };
        self.countdown = self.window;

        match session.reinitialize(binding) {
            Ok(Reinit::Swapped) => {
                self.mode = target;
                dispatcher.set_listening(target == Mode::CommandWait)?;
                tracing::debug!(mode = ?target, "mode switched");
                Ok(Reinit::Swapped)
            }
            Ok(Reinit::Retained(status)) => {
                tracing::warn!(mode = ?self.mode, target = ?target, %status, "mode switch rejected");
                Ok(Reinit::Retained(status))
            }
            Err(e) => {
                self.mode = Mode::Idle;
                Err(e)
            }
        }
    }

    /// Current mode
    #[must_use]
    pub const fn mode(&self) -> Mode {
        self.mode
    }

    /// Frames left in the command window
    #[must_use]
    pub const fn countdown(&self) -> u32 {
        self.countdown
    }
}
