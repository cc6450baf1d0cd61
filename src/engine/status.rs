//! Engine status codes

use std::fmt;

/// Raw status reported by the engine
///
/// The set is open: engines may return codes this crate has no name for,
/// and those classify as fatal.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub u16);

/// How the pipeline reacts to a status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// A phrase was recognized
    Recognized,
    /// Need more audio, keep pushing
    Pending,
    /// No speech within the configured timeout; reinitialize and continue
    Timeout,
    /// Grammar, model or settings rejected at allocate/initialize time
    Setup,
    /// Further engine calls are unsafe
    Fatal,
}

impl StatusCode {
    pub const OK: Self = Self(0x00);
    pub const NOT_OK: Self = Self(0x01);
    pub const DATACOL_TIMEOUT: Self = Self(0x11);
    pub const DATACOL_TOO_SHORT: Self = Self(0x13);
    pub const DATACOL_TOO_SOFT: Self = Self(0x14);
    pub const RECOG_FAIL: Self = Self(0x31);
    pub const RECOG_LOW_CONF: Self = Self(0x32);
    pub const RECOG_MID_CONF: Self = Self(0x33);
    pub const PSTORE: Self = Self(0x50);
    pub const BAD_VERSION: Self = Self(0x51);
    pub const NN_BAD_VERSION: Self = Self(0x52);
    pub const BAD_SETUP: Self = Self(0x53);
    pub const TRIG_NOTA: Self = Self(0x54);
    pub const NN_MISMATCH: Self = Self(0x55);
    pub const TOO_MANY_RESULTS: Self = Self(0x56);
    pub const GRAMMAR_UNALIGNED: Self = Self(0x5B);
    pub const DNN_BAD_VERSION: Self = Self(0x60);
    pub const DNN_BAD_FORMAT: Self = Self(0x62);
    pub const DNN_UNALIGNED: Self = Self(0x64);
    pub const HEADER_VERSION: Self = Self(0xF0);
    pub const N_WAY_LIMIT: Self = Self(0xF1);
    pub const SETUP_NOT_SUPPORTED: Self = Self(0xF2);
    pub const AUDIOBUFFER_BAD_SIZE: Self = Self(0xF9);
    pub const SEARCH_PRUNED: Self = Self(0xFA);
    pub const MEMORY_CORRUPT: Self = Self(0xFB);
    pub const NULL_POINTER: Self = Self(0xFC);
    pub const NOT_FINISHED: Self = Self(0xFD);
    pub const NO_FREE_TOKENS: Self = Self(0xFE);
    pub const LICENSE: Self = Self(0xFF);

    /// Classify for the pipeline's recovery policy
    #[must_use]
    pub const fn class(self) -> StatusClass {
        match self.0 {
            0x00 => StatusClass::Recognized,
            // search pruned and trigger NOTA are warnings, recognition continues
            0xFD | 0xFA | 0x54 => StatusClass::Pending,
            0x11 => StatusClass::Timeout,
            0x50..=0x53 | 0x55..=0x65 | 0xF0..=0xF2 | 0xF9 => StatusClass::Setup,
            _ => StatusClass::Fatal,
        }
    }

    /// Short name for logs
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self.0 {
            0x00 => "ok",
            0x01 => "not ok",
            0x11 => "no speech before timeout",
            0x13 => "utterance too short",
            0x14 => "utterance too soft",
            0x31 => "recognition failed",
            0x32 => "low confidence",
            0x33 => "mid confidence",
            0x50 => "null persistent storage",
            0x51 => "grammar version not supported",
            0x52 => "net version not supported",
            0x53 => "grammar or net not specified",
            0x54 => "trigger none-of-the-above",
            0x55 => "grammar/net mismatch",
            0x56 => "too many results",
            0x5B => "grammar unaligned",
            0x60 => "dnn version not supported",
            0x62 => "dnn bad format",
            0x64 => "dnn unaligned",
            0xF0 => "header version mismatch",
            0xF1 => "channel/depth out of range",
            0xF2 => "setup not supported",
            0xF9 => "audio buffer bad size",
            0xFA => "search pruned",
            0xFB => "memory corrupt",
            0xFC => "null pointer",
            0xFD => "not finished",
            0xFE => "no free tokens",
            0xFF => "license limit reached",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StatusCode({:#04x} {})", self.0, self.name())
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x} ({})", self.0, self.name())
    }
}
