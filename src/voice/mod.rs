//! Voice processing module
//!
//! Audio acquisition (ring, sources, normalizer), the recognition mode
//! controller and the command dispatcher.

mod capture;
mod dispatch;
mod mode;
mod normalize;
mod ring;
mod wav;

pub use capture::{AudioSource, MicSource, SAMPLE_RATE};
pub use dispatch::{
    ActionDispatcher, Applied, CommandBinding, MemoryOutputs, OutputDevice, TracingOutputs,
    default_commands,
};
pub use mode::{COMMAND_COUNTDOWN, COMMAND_WINDOW_SECS, FrameReport, Mode, ModeController, ModeEvent};
pub use normalize::{
    FrameNormalizer, FrameStats, MIC_ATTENUATION, MIC_DC_OFFSET, MIC_STRIDE, NormalizerConfig,
};
pub use ring::{BlockGuard, BlockProducer, DEFAULT_SLOTS, FaultReporter, FrameSource, ShutdownHandle};
pub use wav::{WavSource, write_wav};
