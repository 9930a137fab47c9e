//! Navigation primitives as a capability.
//!
//! The guard never patches anything itself. A host installs an
//! [`InterceptionAdapter`] that routes page calls into the guard, and the guard
//! forwards admitted calls to the platform's own [`NavigationSink`].

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::protocol::ActionKind;

/// Handle to a window opened by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowHandle(pub u64);

/// Form being submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormRef {
    /// Page-local form identity.
    pub id: u64,
    /// Form action attribute.
    pub action: Option<String>,
    /// Form target attribute.
    pub target: Option<String>,
}

/// A call into a navigation primitive, with its exact arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NavigationCall {
    /// `window.open(url, target, features)`.
    WindowOpen {
        /// URL argument.
        url: Option<String>,
        /// Target argument.
        target: Option<String>,
        /// Features argument.
        features: Option<String>,
    },
    /// `location.assign(url)`.
    LocationAssign {
        /// URL argument.
        url: String,
    },
    /// `location.replace(url)`.
    LocationReplace {
        /// URL argument.
        url: String,
    },
    /// `form.submit()`.
    FormSubmit {
        /// Form.
        form: FormRef,
    },
    /// `form.requestSubmit(submitter)`.
    FormRequestSubmit {
        /// Form.
        form: FormRef,
        /// Submitter element, if given.
        submitter: Option<u64>,
    },
}

impl NavigationCall {
    /// Primitive this call targets.
    pub fn kind(&self) -> ActionKind {
        match self {
            NavigationCall::WindowOpen { .. } => ActionKind::WindowOpen,
            NavigationCall::LocationAssign { .. } => ActionKind::LocationAssign,
            NavigationCall::LocationReplace { .. } => ActionKind::LocationReplace,
            NavigationCall::FormSubmit { .. } => ActionKind::FormSubmit,
            NavigationCall::FormRequestSubmit { .. } => ActionKind::FormRequestSubmit,
        }
    }

    /// Destination as passed by the caller, before resolution.
    pub fn raw_url(&self) -> Option<&str> {
        match self {
            NavigationCall::WindowOpen { url, .. } => url.as_deref(),
            NavigationCall::LocationAssign { url } | NavigationCall::LocationReplace { url } => {
                Some(url)
            }
            NavigationCall::FormSubmit { form } | NavigationCall::FormRequestSubmit { form, .. } => {
                form.action.as_deref()
            }
        }
    }

    /// Browsing-context target, if any.
    pub fn target(&self) -> Option<&str> {
        match self {
            NavigationCall::WindowOpen { target, .. } => target.as_deref(),
            NavigationCall::FormSubmit { form } | NavigationCall::FormRequestSubmit { form, .. } => {
                form.target.as_deref()
            }
            _ => None,
        }
    }

    /// Window features, for window-open calls.
    pub fn features(&self) -> Option<&str> {
        match self {
            NavigationCall::WindowOpen { features, .. } => features.as_deref(),
            _ => None,
        }
    }
}

/// Result of a navigation call as seen by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavOutcome {
    /// The window-open primitive ran; `None` if the platform returned no window.
    Opened(Option<WindowHandle>),
    /// A location primitive ran.
    Navigated,
    /// A form was submitted.
    Submitted,
    /// The call was deferred into the ledger (window-open returns null).
    Suppressed,
}

/// The platform-provided navigation primitives.
pub trait NavigationSink: Send + Sync {
    /// Open a window.
    fn open(
        &self,
        url: Option<&str>,
        target: Option<&str>,
        features: Option<&str>,
    ) -> Result<Option<WindowHandle>>;

    /// Navigate the page, adding a history entry.
    fn assign(&self, url: &str) -> Result<()>;

    /// Navigate the page, replacing the history entry.
    fn replace(&self, url: &str) -> Result<()>;

    /// Submit a form without events.
    fn submit(&self, form: &FormRef) -> Result<()>;

    /// Submit a form as if the submitter were activated.
    fn request_submit(&self, form: &FormRef, submitter: Option<u64>) -> Result<()>;

    /// Go back one history entry.
    fn history_back(&self) -> Result<()>;

    /// Number of entries in the session history.
    fn history_depth(&self) -> usize;
}

/// Invoke the platform primitive for a call, unmodified.
pub fn dispatch(sink: &dyn NavigationSink, call: &NavigationCall) -> Result<NavOutcome> {
    match call {
        NavigationCall::WindowOpen {
            url,
            target,
            features,
        } => sink
            .open(url.as_deref(), target.as_deref(), features.as_deref())
            .map(NavOutcome::Opened),
        NavigationCall::LocationAssign { url } => sink.assign(url).map(|_| NavOutcome::Navigated),
        NavigationCall::LocationReplace { url } => {
            sink.replace(url).map(|_| NavOutcome::Navigated)
        }
        NavigationCall::FormSubmit { form } => sink.submit(form).map(|_| NavOutcome::Submitted),
        NavigationCall::FormRequestSubmit { form, submitter } => sink
            .request_submit(form, *submitter)
            .map(|_| NavOutcome::Submitted),
    }
}

/// Installs interception for one primitive at a time.
pub trait InterceptionAdapter {
    /// Route calls to `primitive` through the guard.
    fn install(&self, primitive: ActionKind) -> Result<()>;
}

/// Adapter for hosts whose page calls already go through the guard.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectAdapter;

impl InterceptionAdapter for DirectAdapter {
    fn install(&self, _primitive: ActionKind) -> Result<()> {
        Ok(())
    }
}

/// Which primitives ended up intercepted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Primitives routed through the guard.
    pub patched: BTreeSet<ActionKind>,
    /// Primitives left on the platform path, with the reason.
    pub failed: Vec<(ActionKind, String)>,
}

impl InstallReport {
    /// Whether calls to `kind` go through the guard.
    pub fn is_patched(&self, kind: ActionKind) -> bool {
        self.patched.contains(&kind)
    }
}

/// Install every primitive, continuing past individual failures.
pub fn install_all(adapter: &dyn InterceptionAdapter) -> InstallReport {
    let mut report = InstallReport::default();
    for kind in ActionKind::all() {
        match adapter.install(kind) {
            Ok(()) => {
                report.patched.insert(kind);
            }
            Err(e) => {
                tracing::warn!(primitive = %kind, error = %e, "interception not installed, primitive left unguarded");
                report.failed.push((kind, e.to_string()));
            }
        }
    }
    tracing::debug!(patched = ?report.patched, "navigation interception installed");
    report
}

/// In-memory sink that records every dispatched call.
#[derive(Debug, Default)]
pub struct RecordingSink {
    calls: Mutex<Vec<NavigationCall>>,
    history: Mutex<Vec<String>>,
    fail_opens: Mutex<bool>,
    next_window: Mutex<u64>,
}

impl RecordingSink {
    /// Empty sink with one history entry.
    pub fn new(initial_url: impl Into<String>) -> Self {
        let sink = Self::default();
        sink.history.lock().push(initial_url.into());
        sink
    }

    /// Make subsequent window-open calls fail as a platform popup blocker would.
    pub fn fail_opens(&self, fail: bool) {
        *self.fail_opens.lock() = fail;
    }

    /// Calls that reached the platform.
    pub fn calls(&self) -> Vec<NavigationCall> {
        self.calls.lock().clone()
    }

    /// Current session history.
    pub fn history(&self) -> Vec<String> {
        self.history.lock().clone()
    }
}

impl NavigationSink for RecordingSink {
    fn open(
        &self,
        url: Option<&str>,
        target: Option<&str>,
        features: Option<&str>,
    ) -> Result<Option<WindowHandle>> {
        if *self.fail_opens.lock() {
            return Err(Error::primitive(ActionKind::WindowOpen, "popup blocked by platform"));
        }
        self.calls.lock().push(NavigationCall::WindowOpen {
            url: url.map(str::to_string),
            target: target.map(str::to_string),
            features: features.map(str::to_string),
        });
        let mut next = self.next_window.lock();
        *next += 1;
        Ok(Some(WindowHandle(*next)))
    }

    fn assign(&self, url: &str) -> Result<()> {
        self.calls.lock().push(NavigationCall::LocationAssign {
            url: url.to_string(),
        });
        self.history.lock().push(url.to_string());
        Ok(())
    }

    fn replace(&self, url: &str) -> Result<()> {
        self.calls.lock().push(NavigationCall::LocationReplace {
            url: url.to_string(),
        });
        let mut history = self.history.lock();
        history.pop();
        history.push(url.to_string());
        Ok(())
    }

    fn submit(&self, form: &FormRef) -> Result<()> {
        self.calls
            .lock()
            .push(NavigationCall::FormSubmit { form: form.clone() });
        Ok(())
    }

    fn request_submit(&self, form: &FormRef, submitter: Option<u64>) -> Result<()> {
        self.calls.lock().push(NavigationCall::FormRequestSubmit {
            form: form.clone(),
            submitter,
        });
        Ok(())
    }

    fn history_back(&self) -> Result<()> {
        let mut history = self.history.lock();
        if history.len() > 1 {
            history.pop();
        }
        Ok(())
    }

    fn history_depth(&self) -> usize {
        self.history.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakyAdapter;

    impl InterceptionAdapter for FlakyAdapter {
        fn install(&self, primitive: ActionKind) -> Result<()> {
            if primitive == ActionKind::LocationReplace {
                return Err(Error::Install {
                    primitive: primitive.to_string(),
                    reason: "property is non-configurable".into(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_install_continues_past_failures() {
        let report = install_all(&FlakyAdapter);
        assert!(report.is_patched(ActionKind::WindowOpen));
        assert!(report.is_patched(ActionKind::FormSubmit));
        assert!(!report.is_patched(ActionKind::LocationReplace));
        assert_eq!(report.failed.len(), 1);
    }

    #[test]
    fn test_dispatch_routes_to_primitive() {
        let sink = RecordingSink::new("https://a.example/");
        let call = NavigationCall::LocationAssign {
            url: "https://b.example/".into(),
        };
        assert_eq!(dispatch(&sink, &call).unwrap(), NavOutcome::Navigated);
        assert_eq!(sink.calls(), vec![call]);
        assert_eq!(sink.history_depth(), 2);
    }

    #[test]
    fn test_call_accessors() {
        let form = FormRef {
            id: 3,
            action: Some("/pay".into()),
            target: Some("_blank".into()),
        };
        let call = NavigationCall::FormRequestSubmit {
            form,
            submitter: None,
        };
        assert_eq!(call.kind(), ActionKind::FormRequestSubmit);
        assert_eq!(call.raw_url(), Some("/pay"));
        assert_eq!(call.target(), Some("_blank"));
        assert_eq!(call.features(), None);
    }

    #[test]
    fn test_failing_open_is_reported() {
        let sink = RecordingSink::new("https://a.example/");
        sink.fail_opens(true);
        let call = NavigationCall::WindowOpen {
            url: Some("https://b.example/".into()),
            target: None,
            features: None,
        };
        assert!(matches!(dispatch(&sink, &call), Err(Error::Primitive { .. })));
        assert!(sink.calls().is_empty());
    }
}
