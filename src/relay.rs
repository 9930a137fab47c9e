//! Decision relay: click verdicts, block prompts and user choices.
//!
//! The relay never runs a primitive itself. It talks to the guard through
//! [`GuardCommand`]s and to the background coordinator through
//! [`PageMessage`]s; both channels are best effort and a closed channel is
//! logged and ignored.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::clock::duration_ms;
use crate::config::{Mode, RelayConfig};
use crate::protocol::{ActionKind, BlockReport, GuardCommand, PageMessage};
use crate::providers::{
    AllowlistProvider, Prompt, PromptReason, PromptSurface, SettingsProvider, UserChoice,
};
use crate::scoring::{self, ClickContext, ReasonCode, ScoreResult};
use crate::signals::{resolve_destination, AnchorTarget};

/// Label of the single-action approval button.
pub const ALLOW_ONCE_LABEL: &str = "Allow once";
/// Label of the persistent approval button.
pub const ALWAYS_ALLOW_LABEL: &str = "Always allow";
/// Label of the re-navigate button on rollback prompts.
pub const PROCEED_LABEL: &str = "Proceed";

/// Why a click was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowReason {
    /// Mode is disabled.
    Disabled,
    /// Destination host is trusted for this site.
    Allowlisted,
    /// Middle click or ctrl/meta modifier.
    ExplicitNewTab,
    /// Blank-target anchor that looks like an ordinary link.
    LegitAnchor,
    /// Score below the mode's threshold.
    BelowThreshold,
}

/// Verdict for one click.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ClickDecision {
    /// Default action proceeds and navigation allowance is granted.
    Allowed {
        /// Escape hatch or policy that admitted the click.
        reason: AllowReason,
        /// Whether the open window was granted as well as redirect.
        allow_open: bool,
    },
    /// Default action and propagation are stopped; a prompt is raised.
    Blocked,
}

impl ClickDecision {
    /// Whether the click was suppressed.
    pub fn is_blocked(&self) -> bool {
        matches!(self, ClickDecision::Blocked)
    }
}

/// Outcome of [`DecisionRelay::on_click`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClickVerdict {
    /// What happens to the click.
    pub decision: ClickDecision,
    /// Score of the click context.
    pub score: ScoreResult,
}

/// Per-click diagnostic record emitted when the debug flag is set.
#[derive(Debug, Serialize)]
pub struct ClickDebugRecord<'a> {
    /// Mode in effect.
    pub mode: Mode,
    /// Verdict.
    pub decision: ClickDecision,
    /// Score.
    pub cds: u32,
    /// Reasons.
    pub reasons: &'a [ReasonCode],
    /// Destination of the anchor, if any.
    pub href: Option<&'a str>,
    /// Top element tag.
    pub top: &'a str,
    /// Underlying interactive element tag.
    pub underlying: Option<&'a str>,
    /// Whether pointer-down and click hit different elements.
    pub retargeted: bool,
}

/// In-page relay between the guard, the user and the background coordinator.
pub struct DecisionRelay {
    config: RelayConfig,
    site_key: String,
    settings: Arc<dyn SettingsProvider>,
    allowlist: Arc<dyn AllowlistProvider>,
    prompts: Arc<dyn PromptSurface>,
    guard_tx: mpsc::UnboundedSender<GuardCommand>,
    background_tx: mpsc::UnboundedSender<PageMessage>,
}

impl std::fmt::Debug for DecisionRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionRelay")
            .field("site_key", &self.site_key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DecisionRelay {
    /// Create a relay for pages of `site_key`.
    pub fn new(
        config: RelayConfig,
        site_key: impl Into<String>,
        settings: Arc<dyn SettingsProvider>,
        allowlist: Arc<dyn AllowlistProvider>,
        prompts: Arc<dyn PromptSurface>,
        guard_tx: mpsc::UnboundedSender<GuardCommand>,
        background_tx: mpsc::UnboundedSender<PageMessage>,
    ) -> Self {
        Self {
            config,
            site_key: site_key.into(),
            settings,
            allowlist,
            prompts,
            guard_tx,
            background_tx,
        }
    }

    /// Site this relay decides for.
    pub fn site_key(&self) -> &str {
        &self.site_key
    }

    /// Current mode.
    pub fn mode(&self) -> Mode {
        self.settings.settings().mode
    }

    /// Decide a click before its default action runs.
    ///
    /// Escape hatches, in order: disabled mode, allowlisted destination,
    /// explicit new-tab intent, and (permissive only) a legitimate blank-target
    /// anchor. An allowlisted destination wins regardless of score.
    pub fn on_click(&self, ctx: &ClickContext, anchor: Option<&AnchorTarget>) -> ClickVerdict {
        let settings = self.settings.settings();
        let mode = settings.mode;
        let score = scoring::score(ctx);
        let new_tab_anchor = anchor.is_some_and(AnchorTarget::opens_new_tab);

        let escape = if mode == Mode::Disabled {
            Some(AllowReason::Disabled)
        } else if anchor
            .and_then(|a| a.destination.host.as_deref())
            .is_some_and(|host| self.allowlist.is_allowlisted(&self.site_key, host))
        {
            Some(AllowReason::Allowlisted)
        } else if ctx.explicit_new_tab_intent {
            Some(AllowReason::ExplicitNewTab)
        } else if mode == Mode::Permissive
            && new_tab_anchor
            && anchor.is_some_and(|a| scoring::is_legit_blank_anchor(&a.hint, ctx, &score, &self.config))
        {
            Some(AllowReason::LegitAnchor)
        } else {
            None
        };

        let decision = match escape {
            Some(reason) => self.allow_click(reason, new_tab_anchor || mode == Mode::Disabled),
            None if new_tab_anchor
                || scoring::meets_threshold(&score, mode.block_threshold(&self.config)) =>
            {
                self.block_click(&score, anchor, new_tab_anchor);
                ClickDecision::Blocked
            }
            None => self.allow_click(AllowReason::BelowThreshold, false),
        };

        if settings.debug {
            let record = ClickDebugRecord {
                mode,
                decision,
                cds: score.cds,
                reasons: &score.reason_codes,
                href: anchor.map(|a| a.destination.href.as_str()),
                top: &ctx.top.tag,
                underlying: ctx.underlying.as_ref().map(|u| u.tag.as_str()),
                retargeted: ctx.retargeted,
            };
            tracing::info!(target: "navsentinel::debug", record = ?record, "click decision");
        }

        ClickVerdict { decision, score }
    }

    fn allow_click(&self, reason: AllowReason, allow_open: bool) -> ClickDecision {
        tracing::debug!(?reason, allow_open, "click allowed");
        let command = match reason {
            AllowReason::Disabled | AllowReason::Allowlisted => GuardCommand::Allow {
                allow_open,
                allow_redirect: true,
                ttl_ms: duration_ms(self.config.decision_ttl),
            },
            _ => GuardCommand::GestureAllow {
                allow_open,
                allow_redirect: true,
                ttl_ms: duration_ms(self.config.click_allowance_ttl),
            },
        };
        self.send_guard(command);
        self.send_background(PageMessage::AllowNav {
            ttl_ms: duration_ms(self.config.nav_allowance_ttl),
        });
        ClickDecision::Allowed { reason, allow_open }
    }

    fn block_click(&self, score: &ScoreResult, anchor: Option<&AnchorTarget>, new_tab_anchor: bool) {
        tracing::warn!(
            site = %self.site_key,
            cds = score.cds,
            reasons = ?score.reason_codes,
            new_tab_anchor,
            "click blocked"
        );
        let reason = if new_tab_anchor {
            PromptReason::BlockedNewTab
        } else {
            PromptReason::BlockedClick
        };
        let prompt = match anchor.filter(|a| !a.destination.is_empty()) {
            Some(a) => self.approval_prompt(
                reason,
                None,
                &a.destination.href,
                a.destination.host.as_deref(),
            ),
            None => Prompt::new(reason).with_timeout(self.config.prompt_timeout),
        };
        self.prompts.show(prompt);
    }

    /// Handle a block report from the guard.
    pub fn on_block_report(&self, report: BlockReport) {
        let host = resolve_destination(None, &report.url).host;
        let mode = self.mode();

        if let Some(id) = report.id.as_deref() {
            let trusted = host
                .as_deref()
                .is_some_and(|h| self.allowlist.is_allowlisted(&self.site_key, h));
            if trusted || mode == Mode::Disabled {
                tracing::debug!(kind = %report.kind, url = %report.url, trusted, "replaying without prompt");
                self.send_guard(GuardCommand::AllowAction { id: id.to_string() });
                self.send_background(PageMessage::AllowNav {
                    ttl_ms: duration_ms(self.config.nav_allowance_ttl),
                });
                return;
            }
        }

        let reason = match report.kind {
            ActionKind::WindowOpen if report.features.as_deref().is_some_and(|f| !f.is_empty()) => {
                PromptReason::BlockedPopup
            }
            ActionKind::WindowOpen => PromptReason::BlockedNewTab,
            ActionKind::LocationAssign | ActionKind::LocationReplace => PromptReason::BlockedRedirect,
            ActionKind::FormSubmit | ActionKind::FormRequestSubmit => PromptReason::BlockedFormSubmit,
        };
        let prompt = self.approval_prompt(reason, report.id, &report.url, host.as_deref());
        self.prompts.show(prompt);
    }

    fn approval_prompt(
        &self,
        reason: PromptReason,
        action_id: Option<String>,
        url: &str,
        host: Option<&str>,
    ) -> Prompt {
        let mut prompt = Prompt::new(reason)
            .with_detail(url)
            .with_timeout(self.config.prompt_timeout);
        if action_id.is_none() && url.is_empty() {
            return prompt;
        }
        prompt = prompt.with_action(
            ALLOW_ONCE_LABEL,
            UserChoice::AllowOnce {
                action_id: action_id.clone(),
                url: url.to_string(),
            },
        );
        if let Some(host) = host {
            prompt = prompt.with_action(
                ALWAYS_ALLOW_LABEL,
                UserChoice::AlwaysAllow {
                    action_id,
                    url: url.to_string(),
                    host: host.to_string(),
                },
            );
        }
        prompt
    }

    /// Route a user's prompt choice.
    pub fn on_choice(&self, choice: UserChoice) {
        match choice {
            UserChoice::AllowOnce { action_id, url } => self.allow_once(action_id, url),
            UserChoice::AlwaysAllow {
                action_id,
                url,
                host,
            } => {
                if let Err(e) = self.allowlist.add(&self.site_key, &host) {
                    tracing::warn!(site = %self.site_key, host = %host, error = %e, "allow rule not saved");
                }
                self.allow_once(action_id, url);
            }
            UserChoice::Proceed { url } => {
                tracing::debug!(url = %url, "proceeding to rolled-back destination");
                self.send_background(PageMessage::AllowNav {
                    ttl_ms: duration_ms(self.config.nav_allowance_ttl),
                });
                self.send_guard(GuardCommand::NavigateOnce {
                    url,
                    ttl_ms: duration_ms(self.config.allow_once_ttl),
                });
            }
            UserChoice::Dismiss => {}
        }
    }

    fn allow_once(&self, action_id: Option<String>, url: String) {
        self.send_background(PageMessage::AllowNav {
            ttl_ms: duration_ms(self.config.nav_allowance_ttl),
        });
        match action_id {
            Some(id) => self.send_guard(GuardCommand::AllowAction { id }),
            None if !url.is_empty() => self.send_guard(GuardCommand::OpenOnce {
                url,
                ttl_ms: duration_ms(self.config.allow_once_ttl),
            }),
            None => {}
        }
    }

    /// Show the rollback prompt for a destination the page could not step back from.
    pub fn prompt_rollback(&self, url: &str) {
        self.prompts.show(self.proceed_prompt(url));
    }

    /// Offer a previously rolled-back destination.
    pub fn prompt_forward_offer(&self, url: &str) {
        tracing::debug!(url, "presenting forward offer");
        self.prompts.show(self.proceed_prompt(url));
    }

    fn proceed_prompt(&self, url: &str) -> Prompt {
        Prompt::new(PromptReason::RolledBack)
            .with_detail(url)
            .with_action(PROCEED_LABEL, UserChoice::Proceed { url: url.to_string() })
            .with_timeout(Duration::ZERO)
    }

    /// Tell the user an admitted navigation failed in the platform.
    pub fn prompt_could_not_open(&self, url: &str) {
        self.prompts.show(
            Prompt::new(PromptReason::CouldNotOpen)
                .with_detail(url)
                .with_timeout(self.config.prompt_timeout),
        );
    }

    /// Send a message to the background coordinator, ignoring a closed channel.
    pub fn send_background(&self, message: PageMessage) {
        if self.background_tx.send(message).is_err() {
            tracing::debug!("background unreachable, message dropped");
        }
    }

    fn send_guard(&self, command: GuardCommand) {
        if self.guard_tx.send(command).is_err() {
            tracing::debug!("guard channel closed, command dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MemoryAllowlist, MemorySettings, RecordingPrompts, Settings};
    use crate::scoring::{ElementHint, Rect};
    use crate::signals::Destination;

    struct Fixture {
        relay: DecisionRelay,
        settings: MemorySettings,
        allowlist: MemoryAllowlist,
        prompts: Arc<RecordingPrompts>,
        guard_rx: mpsc::UnboundedReceiver<GuardCommand>,
        background_rx: mpsc::UnboundedReceiver<PageMessage>,
    }

    fn fixture(mode: Mode) -> Fixture {
        let settings = MemorySettings::new(Settings {
            mode,
            ..Settings::default()
        });
        let allowlist = MemoryAllowlist::default();
        let prompts = Arc::new(RecordingPrompts::new());
        let (guard_tx, guard_rx) = mpsc::unbounded_channel();
        let (background_tx, background_rx) = mpsc::unbounded_channel();
        let relay = DecisionRelay::new(
            RelayConfig::default(),
            "news.example",
            Arc::new(settings.clone()),
            Arc::new(allowlist.clone()),
            prompts.clone(),
            guard_tx,
            background_tx,
        );
        Fixture {
            relay,
            settings,
            allowlist,
            prompts,
            guard_rx,
            background_rx,
        }
    }

    fn link_context() -> ClickContext {
        ClickContext {
            viewport: Rect::new(1000.0, 800.0),
            top: ElementHint {
                text_length: 12,
                rect: Some(Rect::new(100.0, 20.0)),
                ..ElementHint::new("a")
            },
            ..Default::default()
        }
    }

    fn blank_anchor(href: &str, host: &str) -> AnchorTarget {
        AnchorTarget {
            hint: ElementHint {
                text_length: 12,
                target_blank: true,
                rect: Some(Rect::new(100.0, 20.0)),
                ..ElementHint::new("a")
            },
            destination: Destination {
                href: href.into(),
                host: Some(host.into()),
            },
        }
    }

    fn overlay_context() -> ClickContext {
        ClickContext {
            viewport: Rect::new(1000.0, 800.0),
            top: ElementHint {
                rect: Some(Rect::new(1000.0, 800.0)),
                opacity: Some(0.0),
                ..ElementHint::new("div")
            },
            underlying: Some(ElementHint {
                text_length: 10,
                ..ElementHint::new("a")
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_plain_link_grants_redirect_only() {
        let mut f = fixture(Mode::Strict);
        let verdict = f.relay.on_click(&link_context(), None);
        assert_eq!(
            verdict.decision,
            ClickDecision::Allowed {
                reason: AllowReason::BelowThreshold,
                allow_open: false
            }
        );
        assert_eq!(
            f.guard_rx.try_recv().unwrap(),
            GuardCommand::GestureAllow {
                allow_open: false,
                allow_redirect: true,
                ttl_ms: 1_500
            }
        );
        assert!(matches!(
            f.background_rx.try_recv().unwrap(),
            PageMessage::AllowNav { ttl_ms: 3_000 }
        ));
    }

    #[test]
    fn test_strict_blocks_transparent_overlay() {
        let mut f = fixture(Mode::Strict);
        let verdict = f.relay.on_click(&overlay_context(), None);
        assert!(verdict.decision.is_blocked());
        assert!(verdict.score.cds >= 50);
        assert!(f.guard_rx.try_recv().is_err());
        assert_eq!(f.prompts.last().unwrap().reason, PromptReason::BlockedClick);
    }

    #[test]
    fn test_disabled_mode_allows_everything() {
        let mut f = fixture(Mode::Disabled);
        let verdict = f.relay.on_click(&overlay_context(), None);
        assert_eq!(
            verdict.decision,
            ClickDecision::Allowed {
                reason: AllowReason::Disabled,
                allow_open: true
            }
        );
        assert!(matches!(
            f.guard_rx.try_recv().unwrap(),
            GuardCommand::Allow { allow_open: true, .. }
        ));
    }

    #[test]
    fn test_permissive_legit_blank_anchor() {
        let f = fixture(Mode::Permissive);
        let anchor = blank_anchor("https://docs.example/", "docs.example");
        let verdict = f.relay.on_click(&link_context(), Some(&anchor));
        assert_eq!(
            verdict.decision,
            ClickDecision::Allowed {
                reason: AllowReason::LegitAnchor,
                allow_open: true
            }
        );
    }

    #[test]
    fn test_strict_blocks_unapproved_blank_anchor() {
        let f = fixture(Mode::Strict);
        let anchor = blank_anchor("https://docs.example/", "docs.example");
        let verdict = f.relay.on_click(&link_context(), Some(&anchor));
        assert!(verdict.decision.is_blocked());
        let prompt = f.prompts.last().unwrap();
        assert_eq!(prompt.message, "Blocked new tab");
        assert_eq!(
            prompt.choice(ALLOW_ONCE_LABEL),
            Some(&UserChoice::AllowOnce {
                action_id: None,
                url: "https://docs.example/".into()
            })
        );
        assert!(prompt.choice(ALWAYS_ALLOW_LABEL).is_some());
    }

    #[test]
    fn test_policy_escape_uses_decision_ttl() {
        let settings = MemorySettings::new(Settings {
            mode: Mode::Strict,
            ..Settings::default()
        });
        let allowlist = MemoryAllowlist::default();
        allowlist.add("news.example", "docs.example").unwrap();
        let (guard_tx, mut guard_rx) = mpsc::unbounded_channel();
        let (background_tx, _background_rx) = mpsc::unbounded_channel();
        let relay = DecisionRelay::new(
            RelayConfig {
                decision_ttl: Duration::from_millis(900),
                ..RelayConfig::default()
            },
            "news.example",
            Arc::new(settings),
            Arc::new(allowlist),
            Arc::new(RecordingPrompts::new()),
            guard_tx,
            background_tx,
        );
        let anchor = blank_anchor("https://docs.example/", "docs.example");
        relay.on_click(&link_context(), Some(&anchor));
        assert_eq!(
            guard_rx.try_recv().unwrap(),
            GuardCommand::Allow {
                allow_open: true,
                allow_redirect: true,
                ttl_ms: 900
            }
        );
    }

    #[test]
    fn test_allowlisted_host_wins_over_score() {
        let f = fixture(Mode::Strict);
        f.allowlist.add("news.example", "docs.example").unwrap();
        let anchor = blank_anchor("https://docs.example/", "docs.example");
        let verdict = f.relay.on_click(&overlay_context(), Some(&anchor));
        assert!(matches!(
            verdict.decision,
            ClickDecision::Allowed {
                reason: AllowReason::Allowlisted,
                ..
            }
        ));
    }

    #[test]
    fn test_explicit_new_tab_intent_escapes() {
        let f = fixture(Mode::Strict);
        let ctx = ClickContext {
            explicit_new_tab_intent: true,
            ..overlay_context()
        };
        let verdict = f.relay.on_click(&ctx, None);
        assert!(matches!(
            verdict.decision,
            ClickDecision::Allowed {
                reason: AllowReason::ExplicitNewTab,
                ..
            }
        ));
    }

    fn report(kind: ActionKind, url: &str, features: Option<&str>) -> BlockReport {
        BlockReport {
            id: Some("id-1".into()),
            kind,
            url: url.into(),
            target: None,
            features: features.map(str::to_string),
            ts: 0,
        }
    }

    #[test]
    fn test_block_report_prompts_by_kind() {
        let f = fixture(Mode::Permissive);
        f.relay.on_block_report(report(
            ActionKind::WindowOpen,
            "https://ads.example/",
            Some("width=300"),
        ));
        f.relay
            .on_block_report(report(ActionKind::WindowOpen, "https://ads.example/", None));
        f.relay
            .on_block_report(report(ActionKind::LocationReplace, "https://ads.example/", None));
        f.relay
            .on_block_report(report(ActionKind::FormRequestSubmit, "https://ads.example/", None));
        let reasons: Vec<_> = f.prompts.shown().iter().map(|p| p.reason).collect();
        assert_eq!(
            reasons,
            vec![
                PromptReason::BlockedPopup,
                PromptReason::BlockedNewTab,
                PromptReason::BlockedRedirect,
                PromptReason::BlockedFormSubmit,
            ]
        );
    }

    #[test]
    fn test_allowlisted_block_replays_without_prompt() {
        let mut f = fixture(Mode::Strict);
        f.allowlist.add("news.example", "shop.example").unwrap();
        f.relay
            .on_block_report(report(ActionKind::LocationAssign, "https://shop.example/cart", None));
        assert!(f.prompts.shown().is_empty());
        assert_eq!(
            f.guard_rx.try_recv().unwrap(),
            GuardCommand::AllowAction { id: "id-1".into() }
        );
    }

    #[test]
    fn test_always_allow_persists_and_replays() {
        let mut f = fixture(Mode::Strict);
        f.relay.on_choice(UserChoice::AlwaysAllow {
            action_id: Some("id-9".into()),
            url: "https://shop.example/".into(),
            host: "shop.example".into(),
        });
        assert!(f.allowlist.is_allowlisted("news.example", "shop.example"));
        assert_eq!(
            f.guard_rx.try_recv().unwrap(),
            GuardCommand::AllowAction { id: "id-9".into() }
        );
        assert!(matches!(
            f.background_rx.try_recv().unwrap(),
            PageMessage::AllowNav { .. }
        ));
    }

    #[test]
    fn test_allow_once_without_id_opens_url() {
        let mut f = fixture(Mode::Strict);
        f.relay.on_choice(UserChoice::AllowOnce {
            action_id: None,
            url: "https://docs.example/".into(),
        });
        assert_eq!(
            f.guard_rx.try_recv().unwrap(),
            GuardCommand::OpenOnce {
                url: "https://docs.example/".into(),
                ttl_ms: 1_500
            }
        );
    }

    #[test]
    fn test_dismiss_sends_nothing() {
        let mut f = fixture(Mode::Strict);
        f.relay.on_choice(UserChoice::Dismiss);
        assert!(f.guard_rx.try_recv().is_err());
        assert!(f.background_rx.try_recv().is_err());
    }

    #[test]
    fn test_rollback_prompt_is_sticky() {
        let f = fixture(Mode::Permissive);
        f.relay.prompt_rollback("https://ads.example/");
        let prompt = f.prompts.last().unwrap();
        assert_eq!(prompt.message, "NavSentinel rolled back a redirect");
        assert!(prompt.is_sticky());
        assert_eq!(
            prompt.choice(PROCEED_LABEL),
            Some(&UserChoice::Proceed {
                url: "https://ads.example/".into()
            })
        );
    }

    #[test]
    fn test_closed_channels_are_ignored() {
        let f = fixture(Mode::Permissive);
        drop(f.guard_rx);
        drop(f.background_rx);
        f.relay.on_click(&link_context(), None);
        f.settings.set_mode(Mode::Strict);
        assert_eq!(f.relay.mode(), Mode::Strict);
    }
}
