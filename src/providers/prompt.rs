//! Prompts shown to the user and the choices they return.

use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::traits::PromptSurface;

/// Labeled actions a prompt may carry besides the implicit dismiss.
pub const MAX_PROMPT_ACTIONS: usize = 2;

/// Auto-dismiss delay for ordinary prompts.
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_secs(4);

/// Why a prompt is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptReason {
    /// A new-tab navigation was blocked.
    BlockedNewTab,
    /// A popup with window features was blocked.
    BlockedPopup,
    /// A location change was blocked.
    BlockedRedirect,
    /// A form submission was blocked.
    BlockedFormSubmit,
    /// A click was suppressed as deceptive.
    BlockedClick,
    /// An unauthorized committed navigation was reversed.
    RolledBack,
    /// An admitted navigation failed in the platform.
    CouldNotOpen,
}

impl fmt::Display for PromptReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PromptReason::BlockedNewTab => "Blocked new tab",
            PromptReason::BlockedPopup => "Blocked popup",
            PromptReason::BlockedRedirect => "Blocked redirect",
            PromptReason::BlockedFormSubmit => "Blocked form submit",
            PromptReason::BlockedClick => "Blocked click",
            PromptReason::RolledBack => "NavSentinel rolled back a redirect",
            PromptReason::CouldNotOpen => "Could not open the page",
        };
        f.write_str(text)
    }
}

/// Choice the user made, routed back to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "choice", rename_all = "snake_case")]
pub enum UserChoice {
    /// Let this one action through.
    AllowOnce {
        /// Ledger id, when the prompt came from a block report.
        action_id: Option<String>,
        /// Resolved destination.
        url: String,
    },
    /// Trust the destination host for this site, then allow once.
    AlwaysAllow {
        /// Ledger id, when the prompt came from a block report.
        action_id: Option<String>,
        /// Resolved destination.
        url: String,
        /// Destination host to trust.
        host: String,
    },
    /// Re-navigate to a rolled-back destination.
    Proceed {
        /// Destination.
        url: String,
    },
    /// Close the prompt.
    Dismiss,
}

/// A labeled prompt button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptAction {
    /// Button text.
    pub label: String,
    /// Choice reported when pressed.
    pub choice: UserChoice,
}

/// A prompt with up to two actions and an optional auto-dismiss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Prompt {
    /// Why the prompt is shown.
    pub reason: PromptReason,
    /// Headline text.
    pub message: String,
    /// Destination or other detail line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Labeled actions.
    pub actions: Vec<PromptAction>,
    /// Auto-dismiss delay; zero keeps the prompt until dismissed.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Prompt {
    /// Prompt for `reason` with the default timeout and no actions.
    pub fn new(reason: PromptReason) -> Self {
        Self {
            reason,
            message: reason.to_string(),
            detail: None,
            actions: Vec::new(),
            timeout: DEFAULT_PROMPT_TIMEOUT,
        }
    }

    /// Set the detail line.
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        if !detail.is_empty() {
            self.detail = Some(detail);
        }
        self
    }

    /// Add an action. Actions beyond the limit are dropped.
    pub fn with_action(mut self, label: impl Into<String>, choice: UserChoice) -> Self {
        if self.actions.len() >= MAX_PROMPT_ACTIONS {
            tracing::warn!(reason = ?self.reason, "prompt action limit reached, action dropped");
            return self;
        }
        self.actions.push(PromptAction {
            label: label.into(),
            choice,
        });
        self
    }

    /// Set the auto-dismiss delay.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the prompt stays until dismissed.
    pub fn is_sticky(&self) -> bool {
        self.timeout.is_zero()
    }

    /// Choice bound to the button labeled `label`.
    pub fn choice(&self, label: &str) -> Option<&UserChoice> {
        self.actions
            .iter()
            .find(|a| a.label == label)
            .map(|a| &a.choice)
    }
}

/// Prompt surface that keeps every prompt shown.
#[derive(Debug, Default)]
pub struct RecordingPrompts {
    shown: Mutex<Vec<Prompt>>,
}

impl RecordingPrompts {
    /// Empty surface.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every prompt shown so far.
    pub fn shown(&self) -> Vec<Prompt> {
        self.shown.lock().clone()
    }

    /// Most recent prompt.
    pub fn last(&self) -> Option<Prompt> {
        self.shown.lock().last().cloned()
    }
}

impl PromptSurface for RecordingPrompts {
    fn show(&self, prompt: Prompt) {
        tracing::debug!(message = %prompt.message, actions = prompt.actions.len(), "prompt shown");
        self.shown.lock().push(prompt);
    }
}
