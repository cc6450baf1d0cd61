//! Genie Voice - trigger phrase and voice command pipeline
//!
//! This library streams microphone audio through a small ring of blocks,
//! feeds fixed-size frames to a black-box speech recognizer and toggles
//! output lines when command words are recognized:
//! - Audio acquisition (block ring, microphone and WAV sources, normalizer)
//! - Recognition session around the external engine
//! - Trigger / command mode controller with a bounded command window
//! - Table-driven command dispatch
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   blocks   ┌──────────────┐  frames  ┌────────────────────┐
//! │ AudioSource  ├───────────►│ FrameSource  ├─────────►│  FrameNormalizer   │
//! │ (mic / wav)  │  (ring)    └──────────────┘          └─────────┬──────────┘
//! └──────────────┘                                                │
//!                 ┌──────────────────┐   push   ┌─────────────────▼──────────┐
//!                 │ RecognitionEngine│◄─────────┤ RecognitionSession         │
//!                 └──────────────────┘          │   ▲ reinitialize           │
//!                                               │ ModeController ──► Action- │
//!                                               │                 Dispatcher │
//!                                               └────────────────────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod engine;
pub mod error;
pub mod voice;

pub use config::Config;
pub use daemon::{Pipeline, PipelineStats, StopReason};
pub use engine::{
    Binding, Frame, RecoResult, RecognitionEngine, RecognitionSession, ScriptedEngine, StatusCode,
};
pub use error::{Error, Result};
pub use voice::{ActionDispatcher, FrameNormalizer, FrameSource, Mode, ModeController};
