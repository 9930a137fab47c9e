//! In-page controller.
//!
//! One [`PageController`] exists per document. It owns the guard, the relay
//! and the token store, and is the only thing a host needs to feed DOM events
//! and primitive calls into. Dropping it (navigation away) discards all
//! in-page state.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use url::Url;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::guard::{InstallReport, InterceptionAdapter, NavOutcome, NavigationCall, NavigationGuard, NavigationSink};
use crate::protocol::{BackgroundMessage, BlockReport, GuardCommand, PageMessage};
use crate::providers::{AllowlistProvider, PromptSurface, SettingsProvider, UserChoice};
use crate::relay::{ClickVerdict, DecisionRelay};
use crate::signals::{
    build_click_context, capture_click, capture_pointer_down, resolve_anchor, ClickCapture,
    ClickEvent, DownCapture, HitTestSurface, PointerEventData,
};
use crate::token::{frame_key, site_key, GestureToken, GestureTokenStore, TokenParams};

/// Collaborators a page controller is built from.
#[derive(Clone)]
pub struct PageDeps {
    /// User settings.
    pub settings: Arc<dyn SettingsProvider>,
    /// Allow rules.
    pub allowlist: Arc<dyn AllowlistProvider>,
    /// Prompt UI.
    pub prompts: Arc<dyn PromptSurface>,
    /// Platform navigation primitives.
    pub sink: Arc<dyn NavigationSink>,
    /// Hit testing against the live document.
    pub surface: Arc<dyn HitTestSurface>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// What the host must do with the DOM click event.
#[derive(Debug, Clone, PartialEq)]
pub struct ClickDisposition {
    /// Call `preventDefault`.
    pub suppress_default: bool,
    /// Call `stopImmediatePropagation`.
    pub stop_immediate_propagation: bool,
    /// The relay's verdict.
    pub verdict: ClickVerdict,
}

/// Per-document controller.
pub struct PageController {
    page_url: Url,
    is_top_frame: bool,
    guard: NavigationGuard,
    relay: DecisionRelay,
    reports: Mutex<mpsc::UnboundedReceiver<BlockReport>>,
    commands: Mutex<mpsc::UnboundedReceiver<GuardCommand>>,
    tokens: Mutex<GestureTokenStore>,
    last_down: Mutex<Option<DownCapture>>,
    surface: Arc<dyn HitTestSurface>,
    sink: Arc<dyn NavigationSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for PageController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageController")
            .field("page_url", &self.page_url.as_str())
            .field("is_top_frame", &self.is_top_frame)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

impl PageController {
    /// Build a controller for `page_url`. Messages for the background coordinator
    /// are sent on `background_tx`.
    ///
    /// Fails with [`Error::Config`] when `config` does not validate.
    pub fn new(
        config: &Config,
        page_url: Url,
        is_top_frame: bool,
        deps: PageDeps,
        background_tx: mpsc::UnboundedSender<PageMessage>,
    ) -> Result<Self> {
        config.validate()?;
        let (guard, reports) = NavigationGuard::new(
            config.guard.clone(),
            deps.sink.clone(),
            deps.clock.clone(),
            Some(page_url.clone()),
        );
        let (guard_tx, commands) = mpsc::unbounded_channel();
        let relay = DecisionRelay::new(
            config.relay.clone(),
            site_key(&page_url),
            deps.settings,
            deps.allowlist,
            deps.prompts,
            guard_tx,
            background_tx,
        );
        Ok(Self {
            page_url,
            is_top_frame,
            guard,
            relay,
            reports: Mutex::new(reports),
            commands: Mutex::new(commands),
            tokens: Mutex::new(GestureTokenStore::new(config.guard.token_ttl)),
            last_down: Mutex::new(None),
            surface: deps.surface,
            sink: deps.sink,
            clock: deps.clock,
        })
    }

    /// Install interception and announce the page to the background.
    pub fn start(&self, adapter: &dyn InterceptionAdapter) -> InstallReport {
        let report = self.guard.install(adapter);
        tracing::info!(
            url = %self.page_url,
            patched = report.patched.len(),
            failed = report.failed.len(),
            "page guard started"
        );
        self.relay.send_background(PageMessage::Ready);
        self.relay.send_background(PageMessage::CheckRollback);
        self.relay.send_background(PageMessage::CheckForward {
            current_url: self.page_url.to_string(),
        });
        report
    }

    /// Pointer-down: open the gesture window, record the hit test and issue a token.
    pub fn on_pointer_down(&self, pointer: PointerEventData) {
        self.guard.on_pointer_down();
        let now = self.clock.now_ms();
        let down = capture_pointer_down(self.surface.as_ref(), pointer, now);
        let pressed = ClickCapture {
            ts: now,
            event: ClickEvent { pointer, detail: 1 },
            stack: down.stack.clone(),
        };
        let ctx = build_click_context(self.surface.viewport(), None, &pressed);
        self.issue_token(Some(pointer), crate::scoring::score(&ctx), now);
        *self.last_down.lock() = Some(down);
    }

    /// Keydown: Enter and Space open the gesture window.
    pub fn on_key_down(&self, key: &str) {
        self.guard.on_key_down(key);
    }

    /// Decide a click before its default action runs.
    pub fn on_click(&self, event: ClickEvent) -> ClickDisposition {
        let now = self.clock.now_ms();
        let click = capture_click(self.surface.as_ref(), event, now);
        let down = self.last_down.lock().take();
        let ctx = build_click_context(self.surface.viewport(), down.as_ref(), &click);
        let anchor = resolve_anchor(self.surface.as_ref(), &click);

        let verdict = self.relay.on_click(&ctx, anchor.as_ref());
        let pointer = match event.modality() {
            crate::scoring::InputModality::Pointer => Some(event.pointer),
            crate::scoring::InputModality::Keyboard => None,
        };
        self.issue_token(pointer, verdict.score.clone(), now);
        self.pump();

        let blocked = verdict.decision.is_blocked();
        ClickDisposition {
            suppress_default: blocked,
            stop_immediate_propagation: blocked,
            verdict,
        }
    }

    fn issue_token(&self, pointer: Option<PointerEventData>, score: crate::scoring::ScoreResult, now: u64) {
        let params = TokenParams {
            site_key: site_key(&self.page_url),
            frame_key: frame_key(self.is_top_frame).to_string(),
            mode: self.relay.mode(),
            pointer,
            score,
        };
        self.tokens.lock().issue(params, now);
    }

    /// A page script called a guarded primitive.
    ///
    /// Admitted calls that fail in the platform surface the error and show a
    /// "could not open" notice.
    pub fn navigate(&self, call: NavigationCall) -> Result<NavOutcome> {
        let url = call.raw_url().unwrap_or_default().to_string();
        let result = self.guard.intercept(call);
        if let Err(e) = &result {
            self.notify_failure(e, &url);
        }
        self.pump();
        result
    }

    /// The user picked a prompt action.
    pub fn on_prompt_choice(&self, choice: UserChoice) {
        self.relay.on_choice(choice);
        self.pump();
    }

    /// Handle a message from the background coordinator.
    pub fn on_background_message(&self, message: BackgroundMessage) {
        match message {
            BackgroundMessage::Rollback {
                url, qualifiers, ..
            } => {
                // Restart the offer from the moment the rollback is carried out.
                self.relay
                    .send_background(PageMessage::StoreForward { url: url.clone() });
                if self.sink.history_depth() > 1 {
                    tracing::warn!(url = %url, ?qualifiers, "rolling back unauthorized navigation");
                    if let Err(e) = self.sink.history_back() {
                        tracing::warn!(error = %e, "history back failed, prompting instead");
                        self.relay.prompt_rollback(&url);
                    }
                } else {
                    self.relay.prompt_rollback(&url);
                }
            }
            BackgroundMessage::ForwardOffer { url } => {
                if url != self.page_url.as_str() {
                    self.relay.prompt_forward_offer(&url);
                }
            }
        }
    }

    /// Drain pending block reports and guard commands until both queues are empty.
    ///
    /// Returns the number of messages handled.
    pub fn pump(&self) -> usize {
        let mut handled = 0;
        loop {
            let report = self.reports.lock().try_recv().ok();
            if let Some(report) = report {
                self.relay.on_block_report(report);
                handled += 1;
                continue;
            }
            let command = self.commands.lock().try_recv().ok();
            let Some(command) = command else {
                break;
            };
            let url = match &command {
                GuardCommand::OpenOnce { url, .. } | GuardCommand::NavigateOnce { url, .. } => {
                    url.clone()
                }
                _ => String::new(),
            };
            if let Err(e) = self.guard.handle(command) {
                self.notify_failure(&e, &url);
            }
            handled += 1;
        }
        handled
    }

    fn notify_failure(&self, error: &Error, url: &str) {
        if matches!(error, Error::Primitive { .. }) {
            self.relay.prompt_could_not_open(url);
        }
    }

    /// Most recent unexpired gesture token.
    pub fn active_token(&self) -> Option<GestureToken> {
        let now = self.clock.now_ms();
        self.tokens.lock().active(now).cloned()
    }

    /// Drop all in-page state.
    pub fn unload(&self) {
        self.guard.reset();
        self.tokens.lock().clear();
        *self.last_down.lock() = None;
        tracing::debug!(url = %self.page_url, "page state discarded");
    }

    /// The page's guard.
    pub fn guard(&self) -> &NavigationGuard {
        &self.guard
    }

    /// The page's relay.
    pub fn relay(&self) -> &DecisionRelay {
        &self.relay
    }

    /// URL of the document.
    pub fn page_url(&self) -> &Url {
        &self.page_url
    }
}
