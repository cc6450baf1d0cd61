//! Configuration management for the genie pipeline
//!
//! Built-in defaults are the reference board's constants. The TOML file
//! overlays them, and a few calibration knobs can be overridden from the
//! environment.

pub mod file;

use std::path::{Path, PathBuf};

use crate::engine::{Binding, FRAME_LEN, FRAME_MS, ModelBlob, ModelPair, RecognizerSettings};
use crate::voice::{
    COMMAND_WINDOW_SECS, CommandBinding, DEFAULT_SLOTS, MIC_ATTENUATION, MIC_DC_OFFSET,
    NormalizerConfig, default_commands,
};
use crate::{Error, Result};

use file::GenieConfigFile;

/// Engine audio history used when the file does not say
const DEFAULT_AUDIO_BUFFER_MS: u32 = 600;

/// Seconds the command grammar waits for speech
const DEFAULT_COMMAND_TIMEOUT_SECS: u16 = 3;

/// Genie pipeline configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Audio acquisition
    pub audio: AudioConfig,

    /// Recognizer settings shared by both modes
    pub recognizer: RecognizerSettings,

    /// Trigger mode
    pub trigger: ModeConfig,

    /// Command mode
    pub command: ModeConfig,

    /// Seconds to wait for a command after the trigger
    pub command_window_secs: u32,

    /// Local post-qualifier threshold
    pub nnpq_threshold: Option<u16>,

    /// Command table
    pub commands: Vec<CommandBinding>,

    /// Listening indicator line
    pub indicator: Option<String>,
}

/// Audio acquisition configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioConfig {
    /// Ring depth in blocks
    pub slots: usize,

    /// Interleave stride; `None` follows the source's channel count
    pub stride: Option<usize>,

    /// Channel carrying the microphone
    pub channel: usize,

    /// Right shift applied to raw samples
    pub attenuation: u32,

    /// Offset added after the shift
    ///
    /// Defaults to the board's mic bias; host microphones and WAV files
    /// usually want 0, which `genie calibrate` suggests.
    pub dc_offset: i32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            slots: DEFAULT_SLOTS,
            stride: None,
            channel: 0,
            attenuation: MIC_ATTENUATION,
            dc_offset: MIC_DC_OFFSET,
        }
    }
}

/// One recognition mode's grammar and knobs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeConfig {
    /// Grammar blob
    pub grammar: PathBuf,

    /// Network blob
    pub net: PathBuf,

    /// Sensitivity offset
    pub sensitivity: i16,

    /// Speech timeout in seconds (0 = none)
    pub timeout_secs: u16,
}

impl ModeConfig {
    fn with_defaults(name: &str, timeout_secs: u16) -> Self {
        let dir = models_dir();
        Self {
            grammar: dir.join(format!("{name}-grammar.bin")),
            net: dir.join(format!("{name}-net.bin")),
            sensitivity: 0,
            timeout_secs,
        }
    }

    fn overlay(mut self, file: file::ModeFileConfig) -> Self {
        if let Some(grammar) = file.grammar {
            self.grammar = grammar;
        }
        if let Some(net) = file.net {
            self.net = net;
        }
        self.sensitivity = file.sensitivity.unwrap_or(self.sensitivity);
        self.timeout_secs = file.timeout_secs.unwrap_or(self.timeout_secs);
        self
    }

    /// Read both blobs and bind them under `label`
    ///
    /// # Errors
    ///
    /// Returns error if either blob cannot be read
    pub fn load_binding(&self, label: &str) -> Result<Binding> {
        let grammar = ModelBlob::load(label, &self.grammar).map_err(|e| {
            Error::Config(format!("{label} grammar {}: {e}", self.grammar.display()))
        })?;
        let net = ModelBlob::load(format!("{label}-net"), &self.net)
            .map_err(|e| Error::Config(format!("{label} net {}: {e}", self.net.display())))?;

        Ok(Binding {
            pair: ModelPair::new(grammar, net),
            param_a_offset: self.sensitivity,
            timeout_secs: self.timeout_secs,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            recognizer: RecognizerSettings::default(),
            trigger: ModeConfig::with_defaults("trigger", 0),
            command: ModeConfig::with_defaults("command", DEFAULT_COMMAND_TIMEOUT_SECS),
            command_window_secs: COMMAND_WINDOW_SECS,
            nnpq_threshold: None,
            commands: default_commands(),
            indicator: Some("red".to_string()),
        }
    }
}

/// Default model directory: `~/.local/share/genie/models`
#[must_use]
pub fn models_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("models"),
        |d| d.data_dir().join("genie").join("models"),
    )
}

impl Config {
    /// Load configuration from defaults, the config file and the environment
    ///
    /// # Errors
    ///
    /// Returns error if an environment override is malformed or the result
    /// fails validation
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_file(file::load_config_file(path))?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;

        tracing::debug!(
            attenuation = config.audio.attenuation,
            dc_offset = config.audio.dc_offset,
            trigger_sensitivity = config.trigger.sensitivity,
            command_sensitivity = config.command.sensitivity,
            commands = config.commands.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Overlay a parsed config file on the defaults
    ///
    /// # Errors
    ///
    /// Returns error if the audio history length is shorter than one frame
    pub fn from_file(fc: GenieConfigFile) -> Result<Self> {
        let default = Self::default();

        let audio = AudioConfig {
            slots: fc.audio.slots.unwrap_or(default.audio.slots),
            stride: fc.audio.stride.or(default.audio.stride),
            channel: fc.audio.channel.unwrap_or(default.audio.channel),
            attenuation: fc.audio.attenuation.unwrap_or(default.audio.attenuation),
            dc_offset: fc.audio.dc_offset.unwrap_or(default.audio.dc_offset),
        };

        let audio_buffer_ms = fc
            .recognizer
            .audio_buffer_ms
            .unwrap_or(DEFAULT_AUDIO_BUFFER_MS);
        let audio_frames = audio_buffer_ms / FRAME_MS;
        if audio_frames == 0 {
            return Err(Error::Config(format!(
                "audio_buffer_ms {audio_buffer_ms} is shorter than one {FRAME_MS} ms frame"
            )));
        }
        #[allow(clippy::cast_possible_truncation)]
        let audio_buffer_len = audio_frames.saturating_mul(FRAME_LEN as u32);

        let recognizer = RecognizerSettings {
            max_tokens: fc
                .recognizer
                .max_tokens
                .unwrap_or(default.recognizer.max_tokens),
            max_results: fc
                .recognizer
                .max_results
                .unwrap_or(default.recognizer.max_results),
            detector: fc.recognizer.detector.unwrap_or(default.recognizer.detector),
            audio_buffer_len,
            ..default.recognizer
        };

        Ok(Self {
            audio,
            recognizer,
            trigger: default.trigger.overlay(fc.trigger),
            command: default.command.overlay(fc.command),
            command_window_secs: fc
                .recognizer
                .command_window_secs
                .unwrap_or(default.command_window_secs),
            nnpq_threshold: fc.recognizer.nnpq_threshold.or(default.nnpq_threshold),
            commands: fc.commands.unwrap_or(default.commands),
            indicator: fc.outputs.indicator.or(default.indicator),
        })
    }

    /// Apply calibration overrides
    ///
    /// Reads `GENIE_MIC_ATTENUATION`, `GENIE_MIC_DC_OFFSET`,
    /// `GENIE_TRIGGER_SENSITIVITY` and `GENIE_COMMAND_SENSITIVITY` through
    /// `lookup`.
    ///
    /// # Errors
    ///
    /// Returns error if a set variable does not parse
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env(&lookup, "GENIE_MIC_ATTENUATION")? {
            self.audio.attenuation = v;
        }
        if let Some(v) = parse_env(&lookup, "GENIE_MIC_DC_OFFSET")? {
            self.audio.dc_offset = v;
        }
        if let Some(v) = parse_env(&lookup, "GENIE_TRIGGER_SENSITIVITY")? {
            self.trigger.sensitivity = v;
        }
        if let Some(v) = parse_env(&lookup, "GENIE_COMMAND_SENSITIVITY")? {
            self.command.sensitivity = v;
        }
        Ok(())
    }

    /// Reject inconsistent values
    ///
    /// # Errors
    ///
    /// Returns a configuration error describing the first problem found
    pub fn validate(&self) -> Result<()> {
        if self.audio.slots < 2 {
            return Err(Error::Config(format!(
                "audio.slots must be at least 2, got {}",
                self.audio.slots
            )));
        }
        if let Some(stride) = self.audio.stride
            && (stride == 0 || self.audio.channel >= stride)
        {
            return Err(Error::Config(format!(
                "audio.channel {} outside stride {stride}",
                self.audio.channel
            )));
        }
        if self.audio.attenuation >= 32 {
            return Err(Error::Config(format!(
                "audio.attenuation must be below 32, got {}",
                self.audio.attenuation
            )));
        }
        if self.command_window_secs == 0 {
            return Err(Error::Config("command_window_secs must be positive".to_string()));
        }

        let mut seen = std::collections::BTreeSet::new();
        for binding in &self.commands {
            if binding.word_id == 0 || !seen.insert(binding.word_id) {
                return Err(Error::Config(format!(
                    "command '{}' has a zero or duplicate word id {}",
                    binding.phrase, binding.word_id
                )));
            }
        }
        if self.commands.is_empty() {
            tracing::warn!("command table is empty, commands will be ignored");
        }

        Ok(())
    }

    /// Command window in frames
    #[must_use]
    pub const fn countdown_frames(&self) -> u32 {
        self.command_window_secs.saturating_mul(1000) / FRAME_MS
    }

    /// Normalizer parameters for a source delivering `channels` channels
    #[must_use]
    pub fn normalizer(&self, channels: u16) -> NormalizerConfig {
        NormalizerConfig {
            stride: self.audio.stride.unwrap_or(usize::from(channels)),
            channel: self.audio.channel,
            attenuation: self.audio.attenuation,
            dc_offset: self.audio.dc_offset,
        }
    }

    /// Load the trigger and command bindings from disk
    ///
    /// # Errors
    ///
    /// Returns error if any model blob cannot be read
    pub fn load_bindings(&self) -> Result<(Binding, Binding)> {
        Ok((
            self.trigger.load_binding("trigger")?,
            self.command.load_binding("command")?,
        ))
    }
}

fn parse_env<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{key}={raw}: {e}")))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_reference_board() {
        let config = Config::default();
        assert_eq!(config.audio.attenuation, 14);
        assert_eq!(config.audio.dc_offset, 1650);
        assert_eq!(config.audio.slots, 3);
        assert_eq!(config.countdown_frames(), 200);
        assert_eq!(config.trigger.timeout_secs, 0);
        assert_eq!(config.command.timeout_secs, 3);
        assert_eq!(config.commands.len(), 2);
        config.validate().unwrap();
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("GENIE_MIC_ATTENUATION", "16"),
                ("GENIE_MIC_DC_OFFSET", "-20"),
                ("GENIE_COMMAND_SENSITIVITY", " -4 "),
            ]))
            .unwrap();

        assert_eq!(config.audio.attenuation, 16);
        assert_eq!(config.audio.dc_offset, -20);
        assert_eq!(config.command.sensitivity, -4);
        assert_eq!(config.trigger.sensitivity, 0);
    }

    #[test]
    fn test_malformed_env_is_an_error() {
        let mut config = Config::default();
        let err = config
            .apply_env(env(&[("GENIE_TRIGGER_SENSITIVITY", "loud")]))
            .unwrap_err();
        assert!(err.to_string().contains("GENIE_TRIGGER_SENSITIVITY"));
    }

    #[test]
    fn test_validate_rejects() {
        let mut config = Config::default();
        config.audio.slots = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.audio.stride = Some(2);
        config.audio.channel = 2;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.commands.push(CommandBinding::new(1, "again", "blue"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_overlay() {
        let fc: GenieConfigFile = toml::from_str(
            r#"
[audio]
stride = 3
channel = 1

[recognizer]
audio_buffer_ms = 300
command_window_secs = 5
nnpq_threshold = 25000

[trigger]
grammar = "/opt/models/wake.bin"
sensitivity = 2

[outputs]
indicator = "amber"
"#,
        )
        .unwrap();
        let config = Config::from_file(fc).unwrap();

        assert_eq!(config.normalizer(2).stride, 3);
        assert_eq!(config.normalizer(2).channel, 1);
        assert_eq!(config.recognizer.audio_buffer_len, 20 * 240);
        assert_eq!(config.countdown_frames(), 333);
        assert_eq!(config.nnpq_threshold, Some(25_000));
        assert_eq!(config.trigger.grammar, PathBuf::from("/opt/models/wake.bin"));
        assert_eq!(config.trigger.sensitivity, 2);
        assert_eq!(config.command.timeout_secs, 3);
        assert_eq!(config.indicator.as_deref(), Some("amber"));
    }

    #[test]
    fn test_stride_follows_source() {
        let config = Config::default();
        assert_eq!(config.normalizer(2).stride, 2);
    }

    #[test]
    fn test_load_bindings_reads_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        for (mode, name) in [(&mut config.trigger, "t"), (&mut config.command, "c")] {
            mode.grammar = dir.path().join(format!("{name}.grm"));
            mode.net = dir.path().join(format!("{name}.net"));
            std::fs::write(&mode.grammar, [0u8; 8]).unwrap();
            std::fs::write(&mode.net, [0u8; 16]).unwrap();
        }
        config.command.sensitivity = -1;

        let (trigger, command) = config.load_bindings().unwrap();
        assert_eq!(trigger.label(), "trigger");
        assert_eq!(command.label(), "command");
        assert_eq!(command.param_a_offset, -1);
        assert_eq!(command.timeout_secs, 3);
        assert_eq!(trigger.pair.net.bytes().len(), 16);
    }

    #[test]
    fn test_missing_blob_names_path() {
        let mut config = Config::default();
        config.trigger.grammar = PathBuf::from("/nonexistent/trigger.bin");
        let err = config.load_bindings().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/trigger.bin"));
    }
}
