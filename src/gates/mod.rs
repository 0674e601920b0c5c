//! Operator interaction behind a pluggable [`Chooser`].
//!
//! Production reads the terminal through `dialoguer`; tests script answers
//! with [`ScriptedChooser`]. A cancelled prompt is an answer, not an error.

use anyhow::{Context, Result};
use dialoguer::{Input, Select, theme::ColorfulTheme};
use std::collections::VecDeque;

use crate::phase::Phase;

/// Asks the operator to pick an option or type a value.
pub trait Chooser: Send {
    /// Index of the chosen option, or `None` if the operator cancelled.
    fn select(&mut self, prompt: &str, options: &[String]) -> Result<Option<usize>>;

    /// Typed text, or `None` if the operator cancelled or entered nothing.
    fn free_text(&mut self, prompt: &str) -> Result<Option<String>>;
}

/// Interactive terminal prompts.
#[derive(Default)]
pub struct TerminalChooser {
    theme: ColorfulTheme,
}

impl TerminalChooser {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Chooser for TerminalChooser {
    fn select(&mut self, prompt: &str, options: &[String]) -> Result<Option<usize>> {
        Select::with_theme(&self.theme)
            .with_prompt(prompt)
            .items(options)
            .default(0)
            .interact_opt()
            .context("Failed to read selection from terminal")
    }

    fn free_text(&mut self, prompt: &str) -> Result<Option<String>> {
        let text: String = Input::with_theme(&self.theme)
            .with_prompt(prompt)
            .allow_empty(true)
            .interact_text()
            .context("Failed to read input from terminal")?;
        let text = text.trim();
        Ok((!text.is_empty()).then(|| text.to_string()))
    }
}

/// One pre-recorded operator answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedAnswer {
    Select(usize),
    Text(String),
    Cancel,
}

/// Replays answers in order; cancels once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedChooser {
    answers: VecDeque<ScriptedAnswer>,
    prompts: Vec<String>,
}

impl ScriptedChooser {
    pub fn new(answers: impl IntoIterator<Item = ScriptedAnswer>) -> Self {
        Self {
            answers: answers.into_iter().collect(),
            prompts: Vec::new(),
        }
    }

    /// Every prompt shown so far, in order.
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn remaining(&self) -> usize {
        self.answers.len()
    }
}

impl Chooser for ScriptedChooser {
    fn select(&mut self, prompt: &str, options: &[String]) -> Result<Option<usize>> {
        self.prompts.push(prompt.to_string());
        match self.answers.pop_front() {
            Some(ScriptedAnswer::Select(i)) if i < options.len() => Ok(Some(i)),
            Some(ScriptedAnswer::Select(i)) => {
                anyhow::bail!("scripted selection {} out of range for '{}'", i, prompt)
            }
            Some(ScriptedAnswer::Text(t)) => {
                anyhow::bail!("scripted text '{}' given to selection '{}'", t, prompt)
            }
            Some(ScriptedAnswer::Cancel) | None => Ok(None),
        }
    }

    fn free_text(&mut self, prompt: &str) -> Result<Option<String>> {
        self.prompts.push(prompt.to_string());
        match self.answers.pop_front() {
            Some(ScriptedAnswer::Text(t)) => Ok(Some(t)),
            Some(ScriptedAnswer::Select(i)) => {
                anyhow::bail!("scripted selection {} given to text prompt '{}'", i, prompt)
            }
            Some(ScriptedAnswer::Cancel) | None => Ok(None),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseDecision {
    Continue,
    Stop,
}

/// Ask whether to go on after `completed`. Cancelling the prompt stops.
pub fn pause_gate(chooser: &mut dyn Chooser, completed: Phase, next: Phase) -> Result<PauseDecision> {
    let options = vec![
        format!("Continue with {}", next.display_name()),
        "Stop here and resume later".to_string(),
    ];
    let prompt = format!("{} finished. Continue?", completed.display_name());
    Ok(match chooser.select(&prompt, &options)? {
        Some(0) => PauseDecision::Continue,
        _ => PauseDecision::Stop,
    })
}
