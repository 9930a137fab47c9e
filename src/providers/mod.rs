//! Collaborators: settings, allowlist, prompt surface and network rules.

pub mod allowlist;
pub mod prompt;
pub mod settings;
mod traits;

pub use allowlist::{Allowlist, MemoryAllowlist};
pub use prompt::{
    Prompt, PromptAction, PromptReason, RecordingPrompts, UserChoice, DEFAULT_PROMPT_TIMEOUT,
    MAX_PROMPT_ACTIONS,
};
pub use settings::{MemorySettings, Settings};
pub use traits::{AllowlistProvider, NetworkRuleToggle, PromptSurface, SettingsProvider};
