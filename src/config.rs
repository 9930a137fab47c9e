//! Configuration for the navigation guard, decision relay and coordinator.
//!
//! All timing windows are policy, not protocol: they are tunable here and
//! serialize as humantime strings (`"800ms"`, `"6s"`).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::scoring::ReasonCode;

/// Operating mode selected in settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// No blocking; every gesture grants full allowance.
    #[serde(alias = "off")]
    Disabled,
    /// Blocks only high-confidence deception (lenient threshold).
    #[default]
    #[serde(alias = "smart")]
    Permissive,
    /// Blocks at the strict threshold.
    Strict,
}

impl Mode {
    /// Score at or above which a click is blocked, if the mode blocks at all.
    pub fn block_threshold(&self, relay: &RelayConfig) -> Option<u32> {
        match self {
            Mode::Disabled => None,
            Mode::Permissive => Some(relay.lenient_threshold),
            Mode::Strict => Some(relay.strict_threshold),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Disabled => write!(f, "disabled"),
            Mode::Permissive => write!(f, "permissive"),
            Mode::Strict => write!(f, "strict"),
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "disabled" | "off" => Ok(Mode::Disabled),
            "permissive" | "smart" => Ok(Mode::Permissive),
            "strict" => Ok(Mode::Strict),
            other => Err(Error::Config(format!("unknown mode '{}'", other))),
        }
    }
}

/// Main configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// In-page navigation guard.
    pub guard: GuardConfig,
    /// In-page decision relay.
    pub relay: RelayConfig,
    /// Background rollback/forward coordinator.
    pub coordinator: CoordinatorConfig,
}

impl Config {
    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        self.guard.validate()?;
        self.relay.validate()?;
        self.coordinator.validate()
    }
}

/// Allowance windows and ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Open window granted directly by a pointer-down or Enter/Space keydown.
    #[serde(with = "humantime_serde")]
    pub gesture_ttl: Duration,
    /// Window-open calls admitted per open window.
    pub open_budget: u32,
    /// Location/form calls admitted per redirect window.
    pub redirect_budget: u32,
    /// Lifetime of a blocked action before it can no longer be replayed.
    #[serde(with = "humantime_serde")]
    pub ledger_ttl: Duration,
    /// Lifetime of a gesture token.
    #[serde(with = "humantime_serde")]
    pub token_ttl: Duration,
    /// Number of recent decisions kept in the audit ring.
    pub audit_capacity: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            gesture_ttl: Duration::from_millis(800),
            open_budget: 1,
            redirect_budget: 2,
            ledger_ttl: Duration::from_secs(5),
            token_ttl: Duration::from_millis(800),
            audit_capacity: 64,
        }
    }
}

impl GuardConfig {
    /// Reject zero budgets and TTLs.
    pub fn validate(&self) -> Result<()> {
        if self.open_budget == 0 || self.redirect_budget == 0 {
            return Err(Error::Config("allowance budgets must be at least 1".into()));
        }
        if self.gesture_ttl.is_zero() || self.ledger_ttl.is_zero() || self.token_ttl.is_zero() {
            return Err(Error::Config("guard TTLs must be non-zero".into()));
        }
        Ok(())
    }
}

/// Click policy and prompt settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Block threshold used by permissive mode.
    pub lenient_threshold: u32,
    /// Block threshold used by strict mode.
    pub strict_threshold: u32,
    /// Reasons that disqualify a blank-target anchor from the legitimacy escape hatch.
    pub risky_reasons: Vec<ReasonCode>,
    /// Allowance granted for navigation following an allowed click.
    #[serde(with = "humantime_serde")]
    pub click_allowance_ttl: Duration,
    /// Allowance granted by an explicit user decision.
    #[serde(with = "humantime_serde")]
    pub decision_ttl: Duration,
    /// Lifetime of an allow-once credit.
    #[serde(with = "humantime_serde")]
    pub allow_once_ttl: Duration,
    /// Allow-nav window forwarded to the background coordinator.
    #[serde(with = "humantime_serde")]
    pub nav_allowance_ttl: Duration,
    /// Auto-dismiss timeout for block prompts (zero keeps them open).
    #[serde(with = "humantime_serde")]
    pub prompt_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            lenient_threshold: 70,
            strict_threshold: 50,
            risky_reasons: ReasonCode::default_risky().to_vec(),
            click_allowance_ttl: Duration::from_millis(1500),
            decision_ttl: Duration::from_millis(1500),
            allow_once_ttl: Duration::from_millis(1500),
            nav_allowance_ttl: Duration::from_secs(3),
            prompt_timeout: Duration::from_secs(4),
        }
    }
}

impl RelayConfig {
    /// Reject zero TTLs and inverted thresholds.
    pub fn validate(&self) -> Result<()> {
        if self.strict_threshold > self.lenient_threshold {
            return Err(Error::Config(format!(
                "strict threshold {} exceeds lenient threshold {}",
                self.strict_threshold, self.lenient_threshold
            )));
        }
        if self.click_allowance_ttl.is_zero()
            || self.decision_ttl.is_zero()
            || self.allow_once_ttl.is_zero()
            || self.nav_allowance_ttl.is_zero()
        {
            return Err(Error::Config("relay TTLs must be non-zero".into()));
        }
        Ok(())
    }
}

/// Background coordinator timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Cooldown during which further rollbacks for the same tab are suppressed.
    #[serde(with = "humantime_serde")]
    pub suppression_window: Duration,
    /// How long a rolled-back destination stays on offer.
    #[serde(with = "humantime_serde")]
    pub forward_offer_ttl: Duration,
    /// Capacity of the coordinator's event channel.
    pub channel_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            suppression_window: Duration::from_secs(6),
            forward_offer_ttl: Duration::from_secs(60),
            channel_capacity: 64,
        }
    }
}

impl CoordinatorConfig {
    /// Reject zero windows and an empty event channel.
    pub fn validate(&self) -> Result<()> {
        if self.suppression_window.is_zero() || self.forward_offer_ttl.is_zero() {
            return Err(Error::Config(
                "suppression window and forward offer TTL must be non-zero".into(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config("channel capacity must be at least 1".into()));
        }
        Ok(())
    }
}
