//! User settings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::Mode;

use super::traits::SettingsProvider;

/// Persisted user settings. Missing fields take their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Operating mode.
    #[serde(alias = "defaultMode")]
    pub mode: Mode,
    /// Emit per-click diagnostic records.
    pub debug: bool,
    /// Whether the baseline network ruleset should be active.
    #[serde(alias = "dnrEnabled", alias = "networkRules")]
    pub network_rules: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: Mode::Permissive,
            debug: false,
            network_rules: true,
        }
    }
}

impl Settings {
    /// Whether the baseline network ruleset should be enabled under these settings.
    pub fn baseline_rules_enabled(&self) -> bool {
        self.network_rules && self.mode != Mode::Disabled
    }
}

/// In-memory settings store. Clones share state.
#[derive(Debug, Clone)]
pub struct MemorySettings {
    tx: Arc<watch::Sender<Settings>>,
}

impl MemorySettings {
    /// Store holding `settings`.
    pub fn new(settings: Settings) -> Self {
        let (tx, _rx) = watch::channel(settings);
        Self { tx: Arc::new(tx) }
    }

    /// Replace the settings and notify subscribers.
    pub fn set(&self, settings: Settings) {
        tracing::info!(mode = %settings.mode, debug = settings.debug, "settings changed");
        self.tx.send_replace(settings);
    }

    /// Change only the mode.
    pub fn set_mode(&self, mode: Mode) {
        let mut next = self.settings();
        next.mode = mode;
        self.set(next);
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}

impl SettingsProvider for MemorySettings {
    fn settings(&self) -> Settings {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Settings> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_settings_merge_over_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"debug":true}"#).unwrap();
        assert_eq!(settings.mode, Mode::Permissive);
        assert!(settings.debug);
        assert!(settings.network_rules);
    }

    #[test]
    fn test_legacy_keys() {
        let settings: Settings =
            serde_json::from_str(r#"{"defaultMode":"off","dnrEnabled":false}"#).unwrap();
        assert_eq!(settings.mode, Mode::Disabled);
        assert!(!settings.network_rules);
    }

    #[test]
    fn test_serializes_current_keys() {
        let value = serde_json::to_value(Settings::default()).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("mode"));
        assert!(object.contains_key("network_rules"));
        assert!(object.contains_key("debug"));
        assert!(!object.contains_key("networkRules"));
        assert!(!object.contains_key("defaultMode"));

        let back: Settings = serde_json::from_value(value).unwrap();
        assert_eq!(back, Settings::default());
    }

    #[test]
    fn test_baseline_rules_follow_mode() {
        let mut settings = Settings::default();
        assert!(settings.baseline_rules_enabled());
        settings.mode = Mode::Disabled;
        assert!(!settings.baseline_rules_enabled());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let store = MemorySettings::default();
        let mut rx = store.subscribe();
        store.set_mode(Mode::Strict);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().mode, Mode::Strict);
        assert_eq!(store.settings().mode, Mode::Strict);
    }
}
