//! TOML configuration file loading
//!
//! Supports `~/.config/genie/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::engine::Detector;
use crate::voice::CommandBinding;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct GenieConfigFile {
    /// Audio acquisition
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Recognizer settings shared by both modes
    #[serde(default)]
    pub recognizer: RecognizerFileConfig,

    /// Trigger mode grammar and knobs
    #[serde(default)]
    pub trigger: ModeFileConfig,

    /// Command mode grammar and knobs
    #[serde(default)]
    pub command: ModeFileConfig,

    /// Output lines
    #[serde(default)]
    pub outputs: OutputsFileConfig,

    /// Command table; replaces the built-in table when present
    #[serde(default)]
    pub commands: Option<Vec<CommandBinding>>,
}

/// Audio acquisition configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Ring depth in blocks
    pub slots: Option<usize>,

    /// Interleave stride; the source's channel count when absent
    pub stride: Option<usize>,

    /// Channel carrying the microphone
    pub channel: Option<usize>,

    /// Right shift applied to raw samples
    pub attenuation: Option<u32>,

    /// Offset added after the shift
    pub dc_offset: Option<i32>,
}

/// Recognizer configuration
#[derive(Debug, Default, Deserialize)]
pub struct RecognizerFileConfig {
    /// Search token cap
    pub max_tokens: Option<u16>,

    /// Result cap
    pub max_results: Option<u16>,

    /// Speech detector
    pub detector: Option<Detector>,

    /// Engine audio history in milliseconds
    pub audio_buffer_ms: Option<u32>,

    /// Seconds to wait for a command after the trigger
    pub command_window_secs: Option<u32>,

    /// Local post-qualifier threshold
    pub nnpq_threshold: Option<u16>,
}

/// Per-mode configuration
#[derive(Debug, Default, Deserialize)]
pub struct ModeFileConfig {
    /// Grammar blob path
    pub grammar: Option<PathBuf>,

    /// Network blob path
    pub net: Option<PathBuf>,

    /// Sensitivity offset
    pub sensitivity: Option<i16>,

    /// Speech timeout in seconds (0 = none)
    pub timeout_secs: Option<u16>,
}

/// Output configuration
#[derive(Debug, Default, Deserialize)]
pub struct OutputsFileConfig {
    /// Line used as the listening indicator
    pub indicator: Option<String>,
}

/// Load the TOML config file
///
/// Uses `path` when given, the standard path otherwise. Returns
/// `GenieConfigFile::default()` if the file doesn't exist or can't be parsed.
#[must_use]
pub fn load_config_file(path: Option<&Path>) -> GenieConfigFile {
    let Some(path) = path.map(Path::to_path_buf).or_else(config_file_path) else {
        return GenieConfigFile::default();
    };

    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file");
        return GenieConfigFile::default();
    }

    match std::fs::read_to_string(&path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                GenieConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            GenieConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/genie/config.toml`
#[must_use]
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("genie").join("config.toml"))
}
