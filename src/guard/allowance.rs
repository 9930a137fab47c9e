//! Time-boxed, budget-limited allowance windows.

use std::time::Duration;

use crate::clock::deadline;
use crate::protocol::ActionKind;

/// Which primitives a window admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllowanceCategory {
    /// Window-open calls.
    Open,
    /// Location and form calls.
    Redirect,
}

impl AllowanceCategory {
    /// Category a primitive draws from.
    pub fn of(kind: ActionKind) -> Self {
        if kind.opens_window() {
            AllowanceCategory::Open
        } else {
            AllowanceCategory::Redirect
        }
    }
}

/// One open window: absolute expiry plus remaining calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllowanceWindow {
    /// Time after which the window is closed.
    pub expires_at: u64,
    /// Calls still admitted.
    pub remaining: u32,
}

impl AllowanceWindow {
    /// Window starting now.
    pub fn new(now_ms: u64, ttl: Duration, budget: u32) -> Self {
        Self {
            expires_at: deadline(now_ms, ttl),
            remaining: budget,
        }
    }

    /// Unexpired with budget left.
    pub fn is_active(&self, now_ms: u64) -> bool {
        now_ms <= self.expires_at && self.remaining > 0
    }

    fn try_consume(&mut self, now_ms: u64) -> bool {
        if !self.is_active(now_ms) {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

/// What admitted a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowanceSource {
    /// A category window.
    Window(AllowanceCategory),
    /// The single-use credit.
    AllowOnce,
}

/// Per-page allowance state. Default-deny: empty state admits nothing.
#[derive(Debug, Clone, Default)]
pub struct GuardState {
    open: Option<AllowanceWindow>,
    redirect: Option<AllowanceWindow>,
    allow_once_until: Option<u64>,
}

impl GuardState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or replace) the window of a category.
    pub fn grant(&mut self, category: AllowanceCategory, now_ms: u64, ttl: Duration, budget: u32) {
        let window = Some(AllowanceWindow::new(now_ms, ttl, budget));
        match category {
            AllowanceCategory::Open => self.open = window,
            AllowanceCategory::Redirect => self.redirect = window,
        }
    }

    /// Grant the single-use credit.
    pub fn grant_allow_once(&mut self, now_ms: u64, ttl: Duration) {
        self.allow_once_until = Some(deadline(now_ms, ttl));
    }

    /// Take one unit for a call of `category`.
    ///
    /// A live allow-once credit is spent first so it always goes to the call
    /// it was granted for; category windows cover everything else.
    pub fn try_consume(&mut self, category: AllowanceCategory, now_ms: u64) -> Option<AllowanceSource> {
        self.expire(now_ms);
        if self.allow_once_until.take().is_some() {
            return Some(AllowanceSource::AllowOnce);
        }
        let window = match category {
            AllowanceCategory::Open => self.open.as_mut(),
            AllowanceCategory::Redirect => self.redirect.as_mut(),
        };
        if window.is_some_and(|w| w.try_consume(now_ms)) {
            return Some(AllowanceSource::Window(category));
        }
        None
    }

    /// Drop an unspent allow-once credit.
    pub fn revoke_allow_once(&mut self) {
        self.allow_once_until = None;
    }

    /// Whether a call of `category` would currently be admitted.
    pub fn has_allowance(&self, category: AllowanceCategory, now_ms: u64) -> bool {
        let window = match category {
            AllowanceCategory::Open => self.open.as_ref(),
            AllowanceCategory::Redirect => self.redirect.as_ref(),
        };
        window.is_some_and(|w| w.is_active(now_ms))
            || self.allow_once_until.is_some_and(|until| now_ms <= until)
    }

    /// Current window of a category, if still active.
    pub fn window(&self, category: AllowanceCategory, now_ms: u64) -> Option<AllowanceWindow> {
        let window = match category {
            AllowanceCategory::Open => self.open,
            AllowanceCategory::Redirect => self.redirect,
        };
        window.filter(|w| w.is_active(now_ms))
    }

    /// Drop everything and return to default deny.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn expire(&mut self, now_ms: u64) {
        if self.open.is_some_and(|w| !w.is_active(now_ms)) {
            self.open = None;
        }
        if self.redirect.is_some_and(|w| !w.is_active(now_ms)) {
            self.redirect = None;
        }
        if self.allow_once_until.is_some_and(|until| now_ms > until) {
            self.allow_once_until = None;
        }
    }
}
