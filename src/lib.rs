//! # navsentinel
//!
//! Detection and arbitration engine against deceptive-UI navigation:
//! clickjacking overlays, pop-unders and delayed redirects.
//!
//! The engine spans two execution contexts that share no memory:
//!
//! - **In-page**: a [`PageController`] per document extracts click signals,
//!   scores them, gates every navigation primitive behind short allowance
//!   windows and parks anything else in a replayable ledger.
//! - **Background**: a [`Coordinator`] per browser session watches committed
//!   navigations per tab and rolls back the ones no allowance covered.
//!
//! They talk over the typed messages in [`protocol`].
//!
//! ## Features
//!
//! - **Deceptiveness scoring**: additive, deterministic heuristics over the
//!   hit-test stack (overlays, invisible targets, retargeting)
//! - **Default-deny navigation guard**: open/redirect windows with budgets and
//!   a single-use allow-once credit
//! - **Blocked-action ledger**: deferred calls replayed at most once, before expiry
//! - **Rollback and forward offers**: unauthorized commits are reversed and the
//!   destination stays on offer
//! - **Per-site allowlist**: trusted destination hosts skip prompting
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use navsentinel::{Config, PageController, PageDeps, DirectAdapter, ClickEvent};
//!
//! let (tx, _background) = tokio::sync::mpsc::unbounded_channel();
//! let page = PageController::new(&Config::default(), url, true, deps, tx)?;
//! page.start(&DirectAdapter);
//!
//! let disposition = page.on_click(ClickEvent::at(120.0, 40.0));
//! if disposition.suppress_default {
//!     // preventDefault + stopImmediatePropagation on the DOM event
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod guard;
pub mod page;
pub mod protocol;
pub mod providers;
pub mod relay;
pub mod scoring;
pub mod signals;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, CoordinatorConfig, GuardConfig, Mode, RelayConfig};
pub use coordinator::{
    classify, CommitClass, CommitOutcome, Coordinator, CoordinatorActor, CoordinatorEvent,
    CoordinatorHandle, NavigationCommit, TabDriver, TabId, TabPhase, TabState,
};
pub use error::{Error, ErrorContext, Result};
pub use guard::{
    AuditEntry, DirectAdapter, FormRef, GuardDecision, InstallReport, InterceptionAdapter,
    NavOutcome, NavigationCall, NavigationGuard, NavigationSink, RecordingSink,
};
pub use page::{ClickDisposition, PageController, PageDeps};
pub use protocol::{ActionKind, BackgroundMessage, BlockReport, GuardCommand, PageMessage};
pub use providers::{
    Allowlist, AllowlistProvider, MemoryAllowlist, MemorySettings, NetworkRuleToggle, Prompt,
    PromptReason, PromptSurface, RecordingPrompts, Settings, SettingsProvider, UserChoice,
};
pub use relay::{AllowReason, ClickDecision, ClickVerdict, DecisionRelay};
pub use scoring::{score, ClickContext, ElementHint, ReasonCode, ScoreResult};
pub use signals::{ClickEvent, DomElement, HitTestSurface, PointerEventData};
pub use token::{GestureToken, GestureTokenStore};
