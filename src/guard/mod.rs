//! In-page navigation guard.
//!
//! ## Model
//!
//! - **Default deny**: a call to a guarded primitive runs only while an
//!   allowance window of its category has budget left.
//! - **Gesture windows**: pointer-down and Enter/Space keydown open a short
//!   open window directly.
//! - **Decision windows**: relay commands open open/redirect windows or grant a
//!   single-use credit.
//! - **Ledger**: anything else is parked for replay and reported to the relay.
//!   The call itself returns immediately with [`NavOutcome::Suppressed`].

pub mod allowance;
pub mod ledger;
pub mod sink;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use url::Url;

use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::error::Result;
use crate::protocol::{ActionKind, BlockReport, GuardCommand};
use crate::signals::resolve_destination;

pub use allowance::{AllowanceCategory, AllowanceSource, AllowanceWindow, GuardState};
pub use ledger::{BlockedAction, Ledger, ReplayThunk};
pub use sink::{
    dispatch, install_all, DirectAdapter, FormRef, InstallReport, InterceptionAdapter,
    NavOutcome, NavigationCall, NavigationSink, RecordingSink, WindowHandle,
};

/// What the guard did with a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GuardDecision {
    /// Admitted by a category window.
    AllowedByWindow,
    /// Admitted by the allow-once credit.
    AllowedOnce,
    /// Parked in the ledger.
    Blocked {
        /// Ledger id.
        id: String,
    },
    /// Replayed from the ledger.
    Replayed {
        /// Ledger id.
        id: String,
    },
    /// Primitive not intercepted; passed straight through.
    Unguarded,
    /// The platform primitive failed after admission.
    Failed {
        /// Failure text.
        reason: String,
    },
}

/// Audit entry for one guarded call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
    /// Primitive called.
    pub kind: ActionKind,
    /// Resolved destination.
    pub url: String,
    /// Outcome.
    pub decision: GuardDecision,
}

struct Inner {
    state: GuardState,
    ledger: Ledger,
}

/// Per-page guard owning allowance state and the ledger.
pub struct NavigationGuard {
    config: GuardConfig,
    inner: Mutex<Inner>,
    sink: Arc<dyn NavigationSink>,
    clock: Arc<dyn Clock>,
    reports: mpsc::UnboundedSender<BlockReport>,
    base_url: Option<Url>,
    installed: RwLock<InstallReport>,
    audit: RwLock<VecDeque<AuditEntry>>,
}

impl std::fmt::Debug for NavigationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavigationGuard")
            .field("base_url", &self.base_url.as_ref().map(Url::as_str))
            .field("installed", &*self.installed.read())
            .field("pending", &self.inner.lock().ledger.len())
            .finish_non_exhaustive()
    }
}

impl NavigationGuard {
    /// Create a guard; block reports arrive on the returned receiver.
    pub fn new(
        config: GuardConfig,
        sink: Arc<dyn NavigationSink>,
        clock: Arc<dyn Clock>,
        base_url: Option<Url>,
    ) -> (Self, mpsc::UnboundedReceiver<BlockReport>) {
        let (reports, rx) = mpsc::unbounded_channel();
        let guard = Self {
            config,
            inner: Mutex::new(Inner {
                state: GuardState::new(),
                ledger: Ledger::new(),
            }),
            sink,
            clock,
            reports,
            base_url,
            installed: RwLock::new(InstallReport::default()),
            audit: RwLock::new(VecDeque::new()),
        };
        (guard, rx)
    }

    /// Install interception for every primitive through `adapter`.
    pub fn install(&self, adapter: &dyn InterceptionAdapter) -> InstallReport {
        let report = install_all(adapter);
        *self.installed.write() = report.clone();
        report
    }

    /// Which primitives are intercepted.
    pub fn install_report(&self) -> InstallReport {
        self.installed.read().clone()
    }

    /// Pointer-down anywhere in the page opens a gesture window.
    pub fn on_pointer_down(&self) {
        self.grant_gesture();
    }

    /// Enter or Space opens a gesture window. Returns whether `key` qualified.
    pub fn on_key_down(&self, key: &str) -> bool {
        if key == "Enter" || key == " " {
            self.grant_gesture();
            return true;
        }
        false
    }

    fn grant_gesture(&self) {
        let now = self.clock.now_ms();
        self.inner.lock().state.grant(
            AllowanceCategory::Open,
            now,
            self.config.gesture_ttl,
            self.config.open_budget,
        );
    }

    /// Entry point for every call into a guarded primitive.
    ///
    /// Never waits for a decision. Either the primitive runs now, or the call
    /// is parked and [`NavOutcome::Suppressed`] is returned.
    pub fn intercept(&self, call: NavigationCall) -> Result<NavOutcome> {
        let kind = call.kind();
        let url = self.resolve(&call);

        if !self.installed.read().is_patched(kind) {
            self.record_audit(kind, &url, GuardDecision::Unguarded);
            return dispatch(self.sink.as_ref(), &call);
        }

        let now = self.clock.now_ms();
        let admitted = self
            .inner
            .lock()
            .state
            .try_consume(AllowanceCategory::of(kind), now);

        match admitted {
            Some(source) => {
                tracing::debug!(%kind, url = %url, ?source, "navigation admitted");
                let decision = match source {
                    AllowanceSource::Window(_) => GuardDecision::AllowedByWindow,
                    AllowanceSource::AllowOnce => GuardDecision::AllowedOnce,
                };
                self.record_audit(kind, &url, decision);
                self.run(kind, &url, &call)
            }
            None => Ok(self.block(call, url, now)),
        }
    }

    fn block(&self, call: NavigationCall, url: String, now: u64) -> NavOutcome {
        let kind = call.kind();
        let target = call.target().map(str::to_string);
        let features = call.features().map(str::to_string);
        let action = BlockedAction::for_call(call, url.clone(), now, self.config.ledger_ttl);
        let id = self.inner.lock().ledger.record(action);

        tracing::warn!(%kind, url = %url, id = %id, "navigation blocked without allowance");
        self.record_audit(kind, &url, GuardDecision::Blocked { id: id.clone() });

        let report = BlockReport {
            id: Some(id),
            kind,
            url,
            target,
            features,
            ts: now,
        };
        if self.reports.send(report).is_err() {
            tracing::debug!(%kind, "block report dropped, relay is gone");
        }
        NavOutcome::Suppressed
    }

    fn run(&self, kind: ActionKind, url: &str, call: &NavigationCall) -> Result<NavOutcome> {
        dispatch(self.sink.as_ref(), call).map_err(|e| {
            tracing::warn!(%kind, url, error = %e, "navigation primitive failed");
            self.record_audit(
                kind,
                url,
                GuardDecision::Failed {
                    reason: e.to_string(),
                },
            );
            e
        })
    }

    /// Apply a relay command. Returns the outcome when the command ran a primitive.
    pub fn handle(&self, command: GuardCommand) -> Result<Option<NavOutcome>> {
        let now = self.clock.now_ms();
        match command {
            GuardCommand::GestureAllow {
                allow_open,
                allow_redirect,
                ttl_ms,
            }
            | GuardCommand::Allow {
                allow_open,
                allow_redirect,
                ttl_ms,
            } => {
                let ttl = Duration::from_millis(ttl_ms);
                let mut inner = self.inner.lock();
                if allow_open {
                    inner
                        .state
                        .grant(AllowanceCategory::Open, now, ttl, self.config.open_budget);
                }
                if allow_redirect {
                    inner.state.grant(
                        AllowanceCategory::Redirect,
                        now,
                        ttl,
                        self.config.redirect_budget,
                    );
                }
                tracing::debug!(allow_open, allow_redirect, ttl_ms, "allowance granted");
                Ok(None)
            }
            GuardCommand::AllowAction { id } => self.replay(&id, now),
            GuardCommand::OpenOnce { url, ttl_ms } => self
                .intercept_once(
                    NavigationCall::WindowOpen {
                        url: Some(url),
                        target: Some("_blank".into()),
                        features: None,
                    },
                    now,
                    ttl_ms,
                )
                .map(Some),
            GuardCommand::NavigateOnce { url, ttl_ms } => self
                .intercept_once(NavigationCall::LocationAssign { url }, now, ttl_ms)
                .map(Some),
        }
    }

    /// Run `call` on a fresh allow-once credit. The credit never outlives the call.
    fn intercept_once(&self, call: NavigationCall, now: u64, ttl_ms: u64) -> Result<NavOutcome> {
        self.grant_allow_once(now, ttl_ms);
        let result = self.intercept(call);
        self.inner.lock().state.revoke_allow_once();
        result
    }

    fn grant_allow_once(&self, now: u64, ttl_ms: u64) {
        self.inner
            .lock()
            .state
            .grant_allow_once(now, Duration::from_millis(ttl_ms));
        tracing::debug!(ttl_ms, "allow-once credit granted");
    }

    fn replay(&self, id: &str, now: u64) -> Result<Option<NavOutcome>> {
        let claimed = self.inner.lock().ledger.claim(id, now);
        let action = match claimed {
            Ok(action) => action,
            Err(e) => {
                tracing::debug!(error = %e, "allow-action ignored");
                return Ok(None);
            }
        };
        let kind = action.kind;
        let url = action.url.clone();
        tracing::debug!(%kind, url = %url, id, "replaying blocked action");
        self.record_audit(kind, &url, GuardDecision::Replayed { id: id.to_string() });
        match action.replay(self.sink.as_ref()) {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                tracing::warn!(%kind, url = %url, error = %e, "replayed primitive failed");
                self.record_audit(
                    kind,
                    &url,
                    GuardDecision::Failed {
                        reason: e.to_string(),
                    },
                );
                Err(e)
            }
        }
    }

    /// Whether a call of `kind` would run right now.
    pub fn has_allowance(&self, kind: ActionKind) -> bool {
        let now = self.clock.now_ms();
        self.inner
            .lock()
            .state
            .has_allowance(AllowanceCategory::of(kind), now)
    }

    /// Number of ledger entries not yet replayed or purged.
    pub fn pending_actions(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();
        inner.ledger.purge_expired(now);
        inner.ledger.len()
    }

    /// Recent decisions, oldest first.
    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.read().iter().cloned().collect()
    }

    /// Return to default deny and drop the ledger.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state.reset();
        inner.ledger.clear();
    }

    /// Base URL used to resolve destinations.
    pub fn base_url(&self) -> Option<&Url> {
        self.base_url.as_ref()
    }

    fn resolve(&self, call: &NavigationCall) -> String {
        match call.raw_url() {
            Some(raw) => resolve_destination(self.base_url.as_ref(), raw).href,
            None if call.kind().is_form() => self
                .base_url
                .as_ref()
                .map(|u| u.to_string())
                .unwrap_or_default(),
            None => String::new(),
        }
    }

    fn audit_time(&self) -> DateTime<Utc> {
        let ms = i64::try_from(self.clock.now_ms()).unwrap_or(i64::MAX);
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_default()
    }

    fn record_audit(&self, kind: ActionKind, url: &str, decision: GuardDecision) {
        let mut audit = self.audit.write();
        audit.push_back(AuditEntry {
            timestamp: self.audit_time(),
            kind,
            url: url.to_string(),
            decision,
        });
        while audit.len() > self.config.audit_capacity {
            audit.pop_front();
        }
    }
}
