//! Background rollback/forward coordinator.
//!
//! Watches committed top-level navigations per tab and reverses the ones that
//! happened without an allowance window. A reversed destination is kept as a
//! forward offer so the user can still reach it deliberately.
//!
//! Per tab:
//!
//! ```text
//! idle --(unauthorized redirect/link commit)--> forward_pending
//! forward_pending --(proceed, arrival at the destination)--> idle
//! forward_pending --(offer expires)--> idle
//! ```
//!
//! [`Coordinator`] is the synchronous core; [`CoordinatorActor`] drives it from
//! a channel of [`CoordinatorEvent`]s and delivers the resulting messages
//! through a [`TabDriver`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::clock::{deadline, duration_ms, Clock};
use crate::config::CoordinatorConfig;
use crate::error::{Error, ErrorContext, Result};
use crate::protocol::{BackgroundMessage, PageMessage, TransitionQualifier, TransitionType};
use crate::providers::{NetworkRuleToggle, Settings, SettingsProvider};

/// Browser tab identifier.
pub type TabId = u32;

/// Frame id of the top-level frame.
pub const TOP_FRAME: u32 = 0;

/// A committed navigation as reported by the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NavigationCommit {
    /// Committed URL.
    pub url: String,
    /// Transition type.
    pub transition_type: TransitionType,
    /// Transition qualifiers.
    pub qualifiers: Vec<TransitionQualifier>,
    /// Frame id; [`TOP_FRAME`] for the top-level frame.
    pub frame_id: u32,
}

impl NavigationCommit {
    /// Top-level commit without qualifiers.
    pub fn top(url: impl Into<String>, transition_type: TransitionType) -> Self {
        Self {
            url: url.into(),
            transition_type,
            qualifiers: Vec::new(),
            frame_id: TOP_FRAME,
        }
    }

    /// Add a qualifier.
    pub fn with_qualifier(mut self, qualifier: TransitionQualifier) -> Self {
        self.qualifiers.push(qualifier);
        self
    }
}

/// How a commit is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitClass {
    /// User-driven (typed, bookmark, address bar, history traversal).
    Trusted,
    /// Client or server redirect.
    Redirect,
    /// Link or script navigation.
    Link,
    /// Anything else (reload, form submit, start page...).
    Other,
}

impl CommitClass {
    /// Whether commits of this class may be rolled back.
    pub fn is_rollback_candidate(&self) -> bool {
        matches!(self, CommitClass::Redirect | CommitClass::Link)
    }
}

/// Classify a commit.
pub fn classify(commit: &NavigationCommit) -> CommitClass {
    let has = |q: TransitionQualifier| commit.qualifiers.contains(&q);
    if has(TransitionQualifier::ForwardBack)
        || has(TransitionQualifier::FromAddressBar)
        || matches!(
            commit.transition_type,
            TransitionType::Typed | TransitionType::AutoBookmark
        )
    {
        return CommitClass::Trusted;
    }
    if has(TransitionQualifier::ClientRedirect) || has(TransitionQualifier::ServerRedirect) {
        return CommitClass::Redirect;
    }
    if commit.transition_type == TransitionType::Link {
        return CommitClass::Link;
    }
    CommitClass::Other
}

/// Last committed navigation of a tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabNavigationRecord {
    /// Committed URL.
    pub url: String,
    /// Transition type.
    pub transition_type: TransitionType,
    /// Transition qualifiers.
    pub qualifiers: Vec<TransitionQualifier>,
    /// Commit time.
    pub committed_at: u64,
    /// Whether an allow-nav window was open at commit.
    pub authorized: bool,
}

/// Destination kept after a rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardOffer {
    /// Destination.
    pub url: String,
    /// Time after which the offer is dropped.
    pub expires_at: u64,
}

/// Per-tab background state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabState {
    /// Most recent top-level commit.
    pub last: Option<TabNavigationRecord>,
    /// The current page announced readiness.
    pub ready: bool,
    /// End of the allow-nav window.
    pub allow_nav_until: Option<u64>,
    /// End of the rollback cooldown.
    pub suppressed_until: Option<u64>,
    /// Pending forward offer.
    pub forward: Option<ForwardOffer>,
    /// Rollback waiting for the page to become ready.
    pub queued_rollback: Option<BackgroundMessage>,
}

impl TabState {
    fn allow_nav_open(&self, now_ms: u64) -> bool {
        self.allow_nav_until.is_some_and(|until| now_ms <= until)
    }

    fn suppressed(&self, now_ms: u64) -> bool {
        self.suppressed_until.is_some_and(|until| now_ms <= until)
    }

    fn live_offer(&self, now_ms: u64) -> Option<&ForwardOffer> {
        self.forward.as_ref().filter(|o| now_ms <= o.expires_at)
    }

    /// Nothing pending and no page listening; the last commit is older than `stale_ms`.
    fn inert(&self, now_ms: u64, stale_ms: u64) -> bool {
        !self.ready
            && self.queued_rollback.is_none()
            && self.forward.is_none()
            && self.allow_nav_until.is_none()
            && self.suppressed_until.is_none()
            && self
                .last
                .as_ref()
                .map_or(true, |r| now_ms.saturating_sub(r.committed_at) > stale_ms)
    }
}

/// Observable phase of a tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TabPhase {
    /// Nothing pending.
    Idle,
    /// A rolled-back destination is on offer.
    ForwardPending,
}

/// Result of handling a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Not a top-level commit.
    Subframe,
    /// User-driven navigation.
    Trusted,
    /// Made while an allow-nav window was open.
    Authorized,
    /// Neither trusted nor a rollback candidate.
    Untracked,
    /// The tab was already closed.
    Closed,
    /// Unauthorized, but the tab is in its cooldown.
    Suppressed,
    /// Unauthorized; rollback requested. `deliver` is `None` when queued.
    Rollback {
        /// Message to send now, if the page is ready.
        deliver: Option<BackgroundMessage>,
    },
}

/// Synchronous coordinator core: an arena of per-tab state.
#[derive(Debug)]
pub struct Coordinator {
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    tabs: HashMap<TabId, TabState>,
    closed: HashSet<TabId>,
}

impl Coordinator {
    /// Empty coordinator.
    pub fn new(config: CoordinatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            tabs: HashMap::new(),
            closed: HashSet::new(),
        }
    }

    /// Start tracking a tab.
    pub fn on_tab_open(&mut self, tab: TabId) {
        self.closed.remove(&tab);
        self.tabs.entry(tab).or_default();
        tracing::debug!(tab, "tab tracked");
    }

    /// Purge all state of a tab. Events that arrive for it afterwards are dropped.
    pub fn on_tab_close(&mut self, tab: TabId) {
        self.closed.insert(tab);
        if self.tabs.remove(&tab).is_some() {
            tracing::debug!(tab, "tab state purged");
        }
    }

    /// State of an open tab, created on first sight. Tabs that predate the
    /// background context are never announced as opened.
    fn live_tab(&mut self, tab: TabId) -> Option<&mut TabState> {
        if self.closed.contains(&tab) {
            tracing::debug!(tab, "event for closed tab dropped");
            return None;
        }
        Some(self.tabs.entry(tab).or_default())
    }

    /// Handle a committed navigation.
    pub fn on_commit(&mut self, tab: TabId, commit: NavigationCommit) -> CommitOutcome {
        if commit.frame_id != TOP_FRAME {
            return CommitOutcome::Subframe;
        }
        let now = self.clock.now_ms();
        let class = classify(&commit);
        let forward_ttl = self.config.forward_offer_ttl;
        let suppression = self.config.suppression_window;
        let Some(state) = self.live_tab(tab) else {
            return CommitOutcome::Closed;
        };

        let authorized = state.allow_nav_open(now);
        let prev_url = state.last.as_ref().map(|r| r.url.clone());
        state.last = Some(TabNavigationRecord {
            url: commit.url.clone(),
            transition_type: commit.transition_type,
            qualifiers: commit.qualifiers.clone(),
            committed_at: now,
            authorized,
        });

        if state.forward.as_ref().is_some_and(|o| o.url == commit.url) {
            state.forward = None;
        }

        if class == CommitClass::Trusted {
            return CommitOutcome::Trusted;
        }
        if authorized {
            tracing::debug!(tab, url = %commit.url, "authorized navigation committed");
            return CommitOutcome::Authorized;
        }
        if !class.is_rollback_candidate() {
            return CommitOutcome::Untracked;
        }
        if state.suppressed(now) {
            tracing::debug!(tab, url = %commit.url, "rollback suppressed during cooldown");
            return CommitOutcome::Suppressed;
        }

        state.forward = Some(ForwardOffer {
            url: commit.url.clone(),
            expires_at: deadline(now, forward_ttl),
        });
        state.suppressed_until = Some(deadline(now, suppression));

        let message = BackgroundMessage::Rollback {
            url: commit.url.clone(),
            prev_url,
            qualifiers: commit.qualifiers,
        };
        tracing::warn!(tab, url = %commit.url, ?class, ready = state.ready, "unauthorized navigation, rolling back");

        if state.ready {
            CommitOutcome::Rollback {
                deliver: Some(message),
            }
        } else {
            state.queued_rollback = Some(message);
            CommitOutcome::Rollback { deliver: None }
        }
    }

    /// Handle a message from a page. Returns a reply for that page, if any.
    pub fn on_page_message(&mut self, tab: TabId, message: PageMessage) -> Option<BackgroundMessage> {
        let now = self.clock.now_ms();
        let forward_ttl = self.config.forward_offer_ttl;
        let state = self.live_tab(tab)?;
        match message {
            PageMessage::Ready => {
                state.ready = true;
                state.queued_rollback.take()
            }
            PageMessage::CheckRollback => state.queued_rollback.take(),
            PageMessage::AllowNav { ttl_ms } => {
                state.allow_nav_until = Some(deadline(now, Duration::from_millis(ttl_ms)));
                tracing::debug!(tab, ttl_ms, "allow-nav window opened");
                None
            }
            PageMessage::CheckForward { current_url } => {
                // Only offered from a different page; a commit to the offer clears it.
                let offer = state.live_offer(now)?.url.clone();
                if offer == current_url {
                    return None;
                }
                Some(BackgroundMessage::ForwardOffer { url: offer })
            }
            PageMessage::StoreForward { url } => {
                state.forward = Some(ForwardOffer {
                    url,
                    expires_at: deadline(now, forward_ttl),
                });
                None
            }
        }
    }

    /// A message could not be delivered: the page is not listening yet.
    pub fn on_delivery_failed(&mut self, tab: TabId, message: BackgroundMessage) {
        let Some(state) = self.tabs.get_mut(&tab) else {
            return;
        };
        state.ready = false;
        if matches!(message, BackgroundMessage::Rollback { .. }) {
            state.queued_rollback = Some(message);
        }
    }

    /// Drop expired offers and windows, then forget tabs left with nothing to track.
    pub fn sweep(&mut self) {
        let now = self.clock.now_ms();
        let stale_ms = duration_ms(self.config.forward_offer_ttl);
        for state in self.tabs.values_mut() {
            if state.forward.as_ref().is_some_and(|o| now > o.expires_at) {
                state.forward = None;
            }
            if state.allow_nav_until.is_some_and(|until| now > until) {
                state.allow_nav_until = None;
            }
            if state.suppressed_until.is_some_and(|until| now > until) {
                state.suppressed_until = None;
            }
        }
        let before = self.tabs.len();
        self.tabs.retain(|_, state| !state.inert(now, stale_ms));
        if self.tabs.len() < before {
            tracing::debug!(evicted = before - self.tabs.len(), "idle tab state evicted");
        }
    }

    /// Phase of a tab.
    pub fn phase(&self, tab: TabId) -> Result<TabPhase> {
        let now = self.clock.now_ms();
        let state = self.tab(tab)?;
        Ok(if state.live_offer(now).is_some() {
            TabPhase::ForwardPending
        } else {
            TabPhase::Idle
        })
    }

    /// State of a tab.
    pub fn tab(&self, tab: TabId) -> Result<&TabState> {
        self.tabs.get(&tab).ok_or(Error::UnknownTab(tab))
    }

    /// Number of tracked tabs.
    pub fn tab_count(&self) -> usize {
        self.tabs.len()
    }

    /// Export the arena as JSON.
    pub fn snapshot(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.tabs)?)
    }

    /// Rebuild a coordinator from a snapshot taken before suspension.
    ///
    /// Fails when `config` does not validate or the snapshot does not parse.
    pub fn restore(config: CoordinatorConfig, clock: Arc<dyn Clock>, snapshot: &str) -> Result<Self> {
        config.validate()?;
        let tabs: HashMap<TabId, TabState> = serde_json::from_str(snapshot)?;
        tracing::info!(tabs = tabs.len(), "coordinator state restored");
        Ok(Self {
            config,
            clock,
            tabs,
            closed: HashSet::new(),
        })
    }
}

/// Delivers messages to the page in a tab.
#[async_trait]
pub trait TabDriver: Send + Sync {
    /// Send a message to the content layer of `tab`.
    async fn send_to_page(&self, tab: TabId, message: BackgroundMessage) -> Result<()>;
}

/// Input to the coordinator actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// Background context started.
    Startup,
    /// A tab was created.
    TabOpened(TabId),
    /// A tab was closed.
    TabClosed(TabId),
    /// A navigation committed.
    Committed {
        /// Tab.
        tab: TabId,
        /// Commit details.
        commit: NavigationCommit,
    },
    /// A page sent a message.
    FromPage {
        /// Sending tab.
        tab: TabId,
        /// Message.
        message: PageMessage,
    },
}

/// Sender side of the actor's channel.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    /// Queue an event.
    pub async fn send(&self, event: CoordinatorEvent) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| Error::ChannelClosed("coordinator".into()))
    }

    /// Report a commit.
    pub async fn committed(&self, tab: TabId, commit: NavigationCommit) -> Result<()> {
        self.send(CoordinatorEvent::Committed { tab, commit }).await
    }

    /// Forward a page message.
    pub async fn from_page(&self, tab: TabId, message: PageMessage) -> Result<()> {
        self.send(CoordinatorEvent::FromPage { tab, message }).await
    }
}

/// Actor that owns a [`Coordinator`] and processes events one at a time.
pub struct CoordinatorActor {
    coordinator: Coordinator,
    driver: Arc<dyn TabDriver>,
    rules: Option<Arc<dyn NetworkRuleToggle>>,
    settings: watch::Receiver<Settings>,
    rx: mpsc::Receiver<CoordinatorEvent>,
}

impl CoordinatorActor {
    /// Create the actor and its handle.
    ///
    /// Fails with [`Error::Config`] when the coordinator's config does not validate.
    pub fn new(
        coordinator: Coordinator,
        driver: Arc<dyn TabDriver>,
        settings: &dyn SettingsProvider,
        rules: Option<Arc<dyn NetworkRuleToggle>>,
    ) -> Result<(Self, CoordinatorHandle)> {
        coordinator.config.validate()?;
        let (tx, rx) = mpsc::channel(coordinator.config.channel_capacity);
        let actor = Self {
            coordinator,
            driver,
            rules,
            settings: settings.subscribe(),
            rx,
        };
        Ok((actor, CoordinatorHandle { tx }))
    }

    /// Process events until every handle is dropped. Returns the final state.
    pub async fn run(mut self) -> Coordinator {
        tracing::info!("coordinator started");
        let mut watching_settings = true;
        loop {
            tokio::select! {
                biased;
                changed = self.settings.changed(), if watching_settings => {
                    if changed.is_err() {
                        watching_settings = false;
                        continue;
                    }
                    let settings = self.settings.borrow_and_update().clone();
                    self.sync_network_rules(&settings).await;
                }
                event = self.rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle(event).await;
                }
            }
        }
        tracing::info!(tabs = self.coordinator.tab_count(), "coordinator stopped");
        self.coordinator
    }

    async fn handle(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Startup => {
                let settings = self.settings.borrow().clone();
                self.sync_network_rules(&settings).await;
            }
            CoordinatorEvent::TabOpened(tab) => self.coordinator.on_tab_open(tab),
            CoordinatorEvent::TabClosed(tab) => self.coordinator.on_tab_close(tab),
            CoordinatorEvent::Committed { tab, commit } => {
                self.coordinator.sweep();
                if let CommitOutcome::Rollback {
                    deliver: Some(message),
                } = self.coordinator.on_commit(tab, commit)
                {
                    self.deliver(tab, message).await;
                }
            }
            CoordinatorEvent::FromPage { tab, message } => {
                if let Some(reply) = self.coordinator.on_page_message(tab, message) {
                    self.deliver(tab, reply).await;
                }
            }
        }
    }

    async fn deliver(&mut self, tab: TabId, message: BackgroundMessage) {
        if let Err(e) = self.driver.send_to_page(tab, message.clone()).await {
            let ctx = ErrorContext {
                operation: "send_to_page".into(),
                tab: Some(tab),
                url: match &message {
                    BackgroundMessage::Rollback { url, .. }
                    | BackgroundMessage::ForwardOffer { url } => Some(url.clone()),
                },
                details: None,
            };
            if e.is_transient() {
                tracing::debug!(error = %e, context = %ctx, "page not reachable, requeueing");
            } else {
                tracing::warn!(error = %e, context = %ctx, "delivery failed, requeueing");
            }
            self.coordinator.on_delivery_failed(tab, message);
        }
    }

    async fn sync_network_rules(&mut self, settings: &Settings) {
        let Some(rules) = &self.rules else {
            return;
        };
        let enabled = settings.baseline_rules_enabled();
        match rules.set_baseline_enabled(enabled).await {
            Ok(()) => tracing::info!(enabled, "baseline network rules synced"),
            Err(e) => tracing::warn!(error = %e, "failed to sync baseline network rules"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Mode;
    use crate::providers::MemorySettings;
    use parking_lot::Mutex;

    fn coordinator() -> (Coordinator, ManualClock) {
        let clock = ManualClock::new(100_000);
        let c = Coordinator::new(CoordinatorConfig::default(), Arc::new(clock.clone()));
        (c, clock)
    }

    fn redirect(url: &str) -> NavigationCommit {
        NavigationCommit::top(url, TransitionType::Link)
            .with_qualifier(TransitionQualifier::ClientRedirect)
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&NavigationCommit::top("https://a/", TransitionType::Typed)),
            CommitClass::Trusted
        );
        assert_eq!(
            classify(
                &NavigationCommit::top("https://a/", TransitionType::Link)
                    .with_qualifier(TransitionQualifier::ForwardBack)
            ),
            CommitClass::Trusted
        );
        assert_eq!(classify(&redirect("https://a/")), CommitClass::Redirect);
        assert_eq!(
            classify(&NavigationCommit::top("https://a/", TransitionType::Link)),
            CommitClass::Link
        );
        assert_eq!(
            classify(&NavigationCommit::top("https://a/", TransitionType::Reload)),
            CommitClass::Other
        );
    }

    #[test]
    fn test_unauthorized_redirect_is_queued_until_ready() {
        let (mut c, _clock) = coordinator();
        c.on_tab_open(1);
        c.on_commit(1, NavigationCommit::top("https://news.example/", TransitionType::Typed));
        let outcome = c.on_commit(1, redirect("https://ads.example/"));
        assert_eq!(outcome, CommitOutcome::Rollback { deliver: None });
        assert_eq!(c.phase(1).unwrap(), TabPhase::ForwardPending);

        let reply = c.on_page_message(1, PageMessage::Ready).unwrap();
        assert_eq!(
            reply,
            BackgroundMessage::Rollback {
                url: "https://ads.example/".into(),
                prev_url: Some("https://news.example/".into()),
                qualifiers: vec![TransitionQualifier::ClientRedirect],
            }
        );
        assert!(c.on_page_message(1, PageMessage::CheckRollback).is_none());
    }

    #[test]
    fn test_ready_page_gets_rollback_immediately() {
        let (mut c, _clock) = coordinator();
        c.on_page_message(1, PageMessage::Ready);
        assert!(matches!(
            c.on_commit(1, redirect("https://ads.example/")),
            CommitOutcome::Rollback { deliver: Some(_) }
        ));
    }

    #[test]
    fn test_allow_nav_authorizes_commit() {
        let (mut c, clock) = coordinator();
        c.on_page_message(1, PageMessage::AllowNav { ttl_ms: 3_000 });
        clock.advance(Duration::from_millis(2_000));
        assert_eq!(
            c.on_commit(1, NavigationCommit::top("https://shop.example/", TransitionType::Link)),
            CommitOutcome::Authorized
        );
        assert!(c.tab(1).unwrap().last.as_ref().unwrap().authorized);
        clock.advance(Duration::from_millis(1_500));
        assert!(matches!(
            c.on_commit(1, redirect("https://ads.example/")),
            CommitOutcome::Rollback { .. }
        ));
    }

    #[test]
    fn test_two_redirects_within_cooldown_roll_back_once() {
        let (mut c, clock) = coordinator();
        c.on_page_message(1, PageMessage::Ready);
        assert!(matches!(
            c.on_commit(1, redirect("https://ads.example/1")),
            CommitOutcome::Rollback { .. }
        ));
        clock.advance(Duration::from_secs(2));
        assert_eq!(
            c.on_commit(1, redirect("https://ads.example/2")),
            CommitOutcome::Suppressed
        );
        clock.advance(Duration::from_secs(5));
        assert!(matches!(
            c.on_commit(1, redirect("https://ads.example/3")),
            CommitOutcome::Rollback { .. }
        ));
    }

    #[test]
    fn test_forward_offer_lifecycle() {
        let (mut c, clock) = coordinator();
        c.on_commit(1, redirect("https://ads.example/"));
        let offer = c.on_page_message(
            1,
            PageMessage::CheckForward {
                current_url: "https://news.example/".into(),
            },
        );
        assert_eq!(
            offer,
            Some(BackgroundMessage::ForwardOffer {
                url: "https://ads.example/".into()
            })
        );

        c.on_page_message(1, PageMessage::AllowNav { ttl_ms: 3_000 });
        clock.advance(Duration::from_millis(10));
        assert_eq!(
            c.on_commit(1, NavigationCommit::top("https://ads.example/", TransitionType::Link)),
            CommitOutcome::Authorized
        );
        assert_eq!(c.phase(1).unwrap(), TabPhase::Idle);
    }

    #[test]
    fn test_forward_offer_expires() {
        let (mut c, clock) = coordinator();
        c.on_page_message(
            1,
            PageMessage::StoreForward {
                url: "https://docs.example/".into(),
            },
        );
        clock.advance(Duration::from_secs(61));
        c.sweep();
        assert_eq!(c.phase(1).unwrap(), TabPhase::Idle);
        assert!(c
            .on_page_message(
                1,
                PageMessage::CheckForward {
                    current_url: "https://a.example/".into()
                }
            )
            .is_none());
    }

    #[test]
    fn test_subframe_and_untracked_commits() {
        let (mut c, _clock) = coordinator();
        let mut sub = redirect("https://frame.example/");
        sub.frame_id = 7;
        assert_eq!(c.on_commit(1, sub), CommitOutcome::Subframe);
        assert_eq!(
            c.on_commit(1, NavigationCommit::top("https://a.example/", TransitionType::Reload)),
            CommitOutcome::Untracked
        );
    }

    #[test]
    fn test_delivery_failure_requeues() {
        let (mut c, _clock) = coordinator();
        c.on_page_message(1, PageMessage::Ready);
        let CommitOutcome::Rollback {
            deliver: Some(message),
        } = c.on_commit(1, redirect("https://ads.example/"))
        else {
            panic!("expected immediate rollback");
        };
        c.on_delivery_failed(1, message.clone());
        assert!(!c.tab(1).unwrap().ready);
        assert_eq!(c.on_page_message(1, PageMessage::Ready), Some(message));
    }

    #[test]
    fn test_tab_close_purges_and_snapshot_restores() {
        let (mut c, clock) = coordinator();
        c.on_commit(1, redirect("https://ads.example/"));
        c.on_tab_open(2);
        let snapshot = c.snapshot().unwrap();

        c.on_tab_close(1);
        assert!(matches!(c.tab(1), Err(Error::UnknownTab(1))));

        let restored = Coordinator::restore(
            CoordinatorConfig::default(),
            Arc::new(clock.clone()),
            &snapshot,
        )
        .unwrap();
        assert_eq!(restored.tab_count(), 2);
        assert_eq!(restored.phase(1).unwrap(), TabPhase::ForwardPending);
    }

    #[test]
    fn test_late_events_for_closed_tab_are_dropped() {
        let (mut c, _clock) = coordinator();
        c.on_tab_open(7);
        c.on_tab_close(7);

        assert!(c
            .on_page_message(7, PageMessage::AllowNav { ttl_ms: 3_000 })
            .is_none());
        assert_eq!(c.on_commit(7, redirect("https://ads.example/")), CommitOutcome::Closed);
        assert_eq!(c.tab_count(), 0);
        assert!(matches!(c.tab(7), Err(Error::UnknownTab(7))));

        c.on_tab_open(7);
        assert_eq!(c.tab_count(), 1);
    }

    #[test]
    fn test_sweep_evicts_idle_unannounced_tabs() {
        let (mut c, clock) = coordinator();
        c.on_commit(8, NavigationCommit::top("https://a.example/", TransitionType::Reload));
        c.on_page_message(9, PageMessage::Ready);
        c.on_commit(10, redirect("https://ads.example/"));
        c.sweep();
        assert_eq!(c.tab_count(), 3);

        clock.advance(Duration::from_secs(61));
        c.sweep();
        assert!(c.tab(8).is_err());
        assert!(c.tab(9).unwrap().ready);
        // Still waiting for its page to take the queued rollback.
        assert!(c.tab(10).unwrap().queued_rollback.is_some());
        assert_eq!(c.tab_count(), 2);
    }

    #[test]
    fn test_restore_rejects_invalid_config() {
        let (c, clock) = coordinator();
        let snapshot = c.snapshot().unwrap();
        let config = CoordinatorConfig {
            channel_capacity: 0,
            ..CoordinatorConfig::default()
        };
        assert!(matches!(
            Coordinator::restore(config, Arc::new(clock), &snapshot),
            Err(Error::Config(_))
        ));
    }

    #[derive(Default)]
    struct Mailbox {
        sent: Mutex<Vec<(TabId, BackgroundMessage)>>,
        fail: Mutex<bool>,
    }

    #[async_trait]
    impl TabDriver for Mailbox {
        async fn send_to_page(&self, tab: TabId, message: BackgroundMessage) -> Result<()> {
            if *self.fail.lock() {
                return Err(Error::ChannelClosed("content script".into()));
            }
            self.sent.lock().push((tab, message));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Rules {
        calls: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl NetworkRuleToggle for Rules {
        async fn set_baseline_enabled(&self, enabled: bool) -> Result<()> {
            self.calls.lock().push(enabled);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_actor_delivers_and_syncs_rules() {
        let clock = ManualClock::new(0);
        let mailbox = Arc::new(Mailbox::default());
        let rules = Arc::new(Rules::default());
        let settings = MemorySettings::default();
        let (actor, handle) = CoordinatorActor::new(
            Coordinator::new(CoordinatorConfig::default(), Arc::new(clock)),
            mailbox.clone(),
            &settings,
            Some(rules.clone()),
        )
        .unwrap();
        let task = tokio::spawn(actor.run());

        handle.send(CoordinatorEvent::Startup).await.unwrap();
        while rules.calls.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        handle.send(CoordinatorEvent::TabOpened(3)).await.unwrap();
        handle.from_page(3, PageMessage::Ready).await.unwrap();
        handle.committed(3, redirect("https://ads.example/")).await.unwrap();
        settings.set_mode(Mode::Disabled);
        handle.send(CoordinatorEvent::TabClosed(9)).await.unwrap();
        drop(handle);

        let final_state = task.await.unwrap();
        assert_eq!(final_state.tab_count(), 1);
        let sent = mailbox.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0], (3, BackgroundMessage::Rollback { .. })));
        assert_eq!(*rules.calls.lock(), vec![true, false]);
    }

    #[test]
    fn test_actor_rejects_invalid_config() {
        let config = CoordinatorConfig {
            suppression_window: Duration::ZERO,
            ..CoordinatorConfig::default()
        };
        let result = CoordinatorActor::new(
            Coordinator::new(config, Arc::new(ManualClock::new(0))),
            Arc::new(Mailbox::default()),
            &MemorySettings::default(),
            None,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_actor_requeues_on_failed_delivery() {
        let mailbox = Arc::new(Mailbox::default());
        *mailbox.fail.lock() = true;
        let settings = MemorySettings::default();
        let (actor, handle) = CoordinatorActor::new(
            Coordinator::new(CoordinatorConfig::default(), Arc::new(ManualClock::new(0))),
            mailbox.clone(),
            &settings,
            None,
        )
        .unwrap();
        let task = tokio::spawn(actor.run());
        handle.from_page(1, PageMessage::Ready).await.unwrap();
        handle.committed(1, redirect("https://ads.example/")).await.unwrap();
        drop(handle);

        let final_state = task.await.unwrap();
        let tab = final_state.tab(1).unwrap();
        assert!(!tab.ready);
        assert!(tab.queued_rollback.is_some());
    }
}
