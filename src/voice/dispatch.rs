//! Command word to output action mapping
//!
//! Each recognized command toggles one named output line. One line may also
//! serve as the listening indicator: it is driven on while the pipeline
//! waits for a command and shows its own toggle state otherwise.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;

use crate::{Error, Result};

/// One entry of the command table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandBinding {
    /// Phrase index in the command grammar
    pub word_id: u16,
    /// Phrase text, for logs
    pub phrase: String,
    /// Output line toggled by the phrase
    pub output: String,
}

impl CommandBinding {
    /// Bind `word_id` to toggle `output`
    #[must_use]
    pub fn new(word_id: u16, phrase: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            word_id,
            phrase: phrase.into(),
            output: output.into(),
        }
    }
}

/// Built-in table for the two-LED board
#[must_use]
pub fn default_commands() -> Vec<CommandBinding> {
    vec![
        CommandBinding::new(1, "toggle_green_led", "green"),
        CommandBinding::new(2, "toggle_red_led", "red"),
    ]
}

/// A driver for named on/off lines
pub trait OutputDevice {
    /// Drive `line` to `on`
    ///
    /// # Errors
    ///
    /// Returns error if the line cannot be driven
    fn set(&mut self, line: &str, on: bool) -> Result<()>;
}

/// Output device that only logs
#[derive(Debug, Default)]
pub struct TracingOutputs;

impl OutputDevice for TracingOutputs {
    fn set(&mut self, line: &str, on: bool) -> Result<()> {
        tracing::info!(line, state = if on { "on" } else { "off" }, "output");
        Ok(())
    }
}

/// Output device that remembers every write
#[derive(Debug, Default)]
pub struct MemoryOutputs {
    levels: BTreeMap<String, bool>,
    writes: Vec<(String, bool)>,
    stuck: BTreeSet<String>,
}

impl MemoryOutputs {
    /// Make every write to `line` fail
    #[must_use]
    pub fn with_stuck_line(mut self, line: impl Into<String>) -> Self {
        self.stuck.insert(line.into());
        self
    }

    /// Current level of `line`, `None` if never written
    #[must_use]
    pub fn level(&self, line: &str) -> Option<bool> {
        self.levels.get(line).copied()
    }

    /// Every write in order
    #[must_use]
    pub fn writes(&self) -> &[(String, bool)] {
        &self.writes
    }
}

impl OutputDevice for MemoryOutputs {
    fn set(&mut self, line: &str, on: bool) -> Result<()> {
        if self.stuck.contains(line) {
            return Err(Error::Output {
                line: line.to_string(),
                reason: "line stuck".to_string(),
            });
        }
        self.levels.insert(line.to_string(), on);
        self.writes.push((line.to_string(), on));
        Ok(())
    }
}

/// What a dispatched command did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Recognized word
    pub word_id: u16,
    /// Phrase from the table
    pub phrase: String,
    /// Line that was toggled
    pub output: String,
    /// New toggle state of the line
    pub state: bool,
}

/// Applies command words to output lines
#[derive(Debug)]
pub struct ActionDispatcher<O> {
    bindings: Vec<CommandBinding>,
    toggles: BTreeMap<String, bool>,
    indicator: Option<String>,
    outputs: O,
}

impl<O: OutputDevice> ActionDispatcher<O> {
    /// Dispatcher over `bindings`
    ///
    /// # Errors
    ///
    /// Returns a configuration error if a word id is 0 or bound twice
    pub fn new(bindings: Vec<CommandBinding>, indicator: Option<String>, outputs: O) -> Result<Self> {
        let mut seen = std::collections::BTreeSet::new();
        for binding in &bindings {
            if binding.word_id == 0 {
                return Err(Error::Config(format!(
                    "command '{}' uses word id 0",
                    binding.phrase
                )));
            }
            if !seen.insert(binding.word_id) {
                return Err(Error::Config(format!(
                    "word id {} bound more than once",
                    binding.word_id
                )));
            }
        }

        let toggles = bindings
            .iter()
            .map(|b| (b.output.clone(), false))
            .chain(indicator.iter().map(|line| (line.clone(), false)))
            .collect();

        Ok(Self {
            bindings,
            toggles,
            indicator,
            outputs,
        })
    }

    /// Drive every known line off
    ///
    /// # Errors
    ///
    /// Returns error if a line cannot be driven
    pub fn reset(&mut self) -> Result<()> {
        for (line, state) in &mut self.toggles {
            *state = false;
            self.outputs.set(line, false)?;
        }
        Ok(())
    }

    /// Apply a recognized command word
    ///
    /// Unknown words are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns error if the output line cannot be driven; the toggle state
    /// is left unchanged
    pub fn dispatch(&mut self, word_id: u16) -> Result<Option<Applied>> {
        let Some(binding) = self.bindings.iter().find(|b| b.word_id == word_id) else {
            tracing::warn!(word_id, "no action bound to command word");
            return Ok(None);
        };

        let state = !self.toggles.get(&binding.output).copied().unwrap_or(false);
        self.outputs.set(&binding.output, state)?;
        self.toggles.insert(binding.output.clone(), state);

        tracing::info!(
            word_id,
            phrase = %binding.phrase,
            line = %binding.output,
            state,
            "command applied"
        );

        Ok(Some(Applied {
            word_id,
            phrase: binding.phrase.clone(),
            output: binding.output.clone(),
            state,
        }))
    }

    /// Show or clear the listening indicator
    ///
    /// Clearing restores the line's own toggle state.
    ///
    /// # Errors
    ///
    /// Returns error if the indicator line cannot be driven
    pub fn set_listening(&mut self, listening: bool) -> Result<()> {
        let Some(line) = &self.indicator else {
            return Ok(());
        };
        let level = listening || self.toggles.get(line).copied().unwrap_or(false);
        self.outputs.set(line, level)
    }

    /// Toggle state of `line`
    #[must_use]
    pub fn state(&self, line: &str) -> Option<bool> {
        self.toggles.get(line).copied()
    }

    /// Phrase bound to `word_id`
    #[must_use]
    pub fn phrase(&self, word_id: u16) -> Option<&str> {
        self.bindings
            .iter()
            .find(|b| b.word_id == word_id)
            .map(|b| b.phrase.as_str())
    }

    /// The command table
    #[must_use]
    pub fn bindings(&self) -> &[CommandBinding] {
        &self.bindings
    }

    /// The output device
    #[must_use]
    pub const fn outputs(&self) -> &O {
        &self.outputs
    }
}
