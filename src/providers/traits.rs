//! Collaborator traits: the pieces the engine consults but does not own.

use async_trait::async_trait;
use tokio::sync::watch;

use crate::error::Result;

use super::allowlist::Allowlist;
use super::prompt::Prompt;
use super::settings::Settings;

/// Source of user settings, with change notification.
pub trait SettingsProvider: Send + Sync {
    /// Current settings, merged over defaults.
    fn settings(&self) -> Settings;

    /// Receiver that observes every settings change.
    fn subscribe(&self) -> watch::Receiver<Settings>;
}

/// Per-site allow rules keyed by destination host.
pub trait AllowlistProvider: Send + Sync {
    /// Whether navigations from `site` to `host` are trusted.
    fn is_allowlisted(&self, site: &str, host: &str) -> bool;

    /// Trust `host` for `site`. Adding an existing rule is a no-op.
    fn add(&self, site: &str, host: &str) -> Result<()>;

    /// Drop the rule for (`site`, `host`).
    fn remove(&self, site: &str, host: &str) -> Result<()>;

    /// Current rules.
    fn snapshot(&self) -> Allowlist;

    /// Receiver that observes every allowlist change.
    fn subscribe(&self) -> watch::Receiver<Allowlist>;
}

/// Where prompts are shown to the user.
pub trait PromptSurface: Send + Sync {
    /// Show a prompt, replacing any prompt already on screen.
    fn show(&self, prompt: Prompt);
}

/// Declarative network-rule engine of the host browser.
#[async_trait]
pub trait NetworkRuleToggle: Send + Sync {
    /// Enable or disable the baseline ruleset.
    async fn set_baseline_enabled(&self, enabled: bool) -> Result<()>;
}
