//! Typed messages exchanged between the guard, the relay and the background
//! coordinator, with their JSON wire form.
//!
//! Delivery is best effort: a message reaches its target only if that context
//! is alive when the send resolves. Grants and queries are safe to deliver twice:
//!
//! - `allow-action` replays a ledger entry at most once; the second delivery
//!   finds no entry and does nothing.
//! - `gesture-allow`, `allow`, `allow-nav` and `store-forward` overwrite what
//!   they set rather than stacking budgets.
//! - `open-once` and `navigate-once` act on the call they carry, so the relay
//!   sends each exactly once per user choice.
//! - `ready`, `check-rollback` and `check-forward` are queries; repeating them
//!   re-sends at most the same pending rollback or offer.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Marker carried by page-level envelopes so foreign `postMessage` traffic is ignored.
pub const ENVELOPE_SOURCE: &str = "__navsentinel__";

/// Navigation-producing primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Popup / new window.
    WindowOpen,
    /// `location.assign` or href assignment.
    LocationAssign,
    /// `location.replace`.
    LocationReplace,
    /// Implicit form submission.
    FormSubmit,
    /// `requestSubmit`.
    FormRequestSubmit,
}

impl ActionKind {
    /// All primitives the guard wraps.
    pub fn all() -> [ActionKind; 5] {
        [
            ActionKind::WindowOpen,
            ActionKind::LocationAssign,
            ActionKind::LocationReplace,
            ActionKind::FormSubmit,
            ActionKind::FormRequestSubmit,
        ]
    }

    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::WindowOpen => "window_open",
            ActionKind::LocationAssign => "location_assign",
            ActionKind::LocationReplace => "location_replace",
            ActionKind::FormSubmit => "form_submit",
            ActionKind::FormRequestSubmit => "form_request_submit",
        }
    }

    /// Whether this primitive draws from the open window (otherwise redirect).
    pub fn opens_window(&self) -> bool {
        matches!(self, ActionKind::WindowOpen)
    }

    /// Whether this primitive submits a form.
    pub fn is_form(&self) -> bool {
        matches!(self, ActionKind::FormSubmit | ActionKind::FormRequestSubmit)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// guard → relay: a primitive was suppressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReport {
    /// Ledger id for replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Suppressed primitive.
    pub kind: ActionKind,
    /// Resolved destination (empty when unparsable).
    pub url: String,
    /// Window target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Window features.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub features: Option<String>,
    /// Block time.
    pub ts: u64,
}

/// relay → guard commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GuardCommand {
    /// Open and/or redirect windows following an allowed click.
    GestureAllow {
        /// Grant an open window.
        allow_open: bool,
        /// Grant a redirect window.
        allow_redirect: bool,
        /// Window lifetime.
        ttl_ms: u64,
    },
    /// Windows granted by an explicit policy decision.
    Allow {
        /// Grant an open window.
        allow_open: bool,
        /// Grant a redirect window.
        allow_redirect: bool,
        /// Window lifetime.
        ttl_ms: u64,
    },
    /// Replay one ledger entry.
    AllowAction {
        /// Ledger id.
        id: String,
    },
    /// Open `url` in a new tab on a single-use credit spent by that call.
    OpenOnce {
        /// Destination.
        url: String,
        /// Credit lifetime.
        ttl_ms: u64,
    },
    /// Navigate the page to `url` on a single-use credit spent by that call.
    NavigateOnce {
        /// Destination.
        url: String,
        /// Credit lifetime.
        ttl_ms: u64,
    },
}

/// page → background messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum PageMessage {
    /// The content layer of the current document is initialized.
    Ready,
    /// A navigation is about to be allowed; open an allowance window.
    AllowNav {
        /// Window lifetime.
        ttl_ms: u64,
    },
    /// Deliver any queued rollback.
    CheckRollback,
    /// Deliver a pending forward offer unless the page is already there.
    CheckForward {
        /// URL of the page asking.
        current_url: String,
    },
    /// Record a destination to offer back later. Sent when the page carries
    /// out a rollback, so the offer outlives a rollback that waited in a queue.
    StoreForward {
        /// Destination.
        url: String,
    },
}

/// background → page messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum BackgroundMessage {
    /// An unauthorized navigation committed; go back or prompt.
    Rollback {
        /// Unauthorized destination.
        url: String,
        /// Page before it, if known.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prev_url: Option<String>,
        /// Transition qualifiers of the commit.
        qualifiers: Vec<TransitionQualifier>,
    },
    /// A previously rolled-back destination is still on offer.
    ForwardOffer {
        /// Destination.
        url: String,
    },
}

/// Browser transition type of a committed navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    /// Followed a link (also script-initiated navigations).
    Link,
    /// Typed in the address bar.
    Typed,
    /// Opened from a bookmark.
    AutoBookmark,
    /// Automatic subframe load.
    AutoSubframe,
    /// User-initiated subframe load.
    ManualSubframe,
    /// Suggestion from the address bar.
    Generated,
    /// Start page or command-line.
    StartPage,
    /// Form submission.
    FormSubmit,
    /// Reload.
    Reload,
    /// Keyword search.
    Keyword,
    /// Generated keyword search.
    KeywordGenerated,
}

/// Qualifiers attached to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionQualifier {
    /// Redirect triggered by script or meta refresh.
    ClientRedirect,
    /// HTTP redirect.
    ServerRedirect,
    /// History traversal.
    ForwardBack,
    /// Entered through the address bar.
    FromAddressBar,
}

/// Page-level envelope used on the window message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Always [`ENVELOPE_SOURCE`].
    pub source: String,
    /// Payload.
    #[serde(flatten)]
    pub message: T,
}

impl<T> Envelope<T> {
    /// Wrap a message.
    pub fn new(message: T) -> Self {
        Self {
            source: ENVELOPE_SOURCE.to_string(),
            message,
        }
    }
}

/// Encode a message as JSON.
pub fn encode<T: Serialize>(message: &T) -> Result<String> {
    Ok(serde_json::to_string(message)?)
}

/// Decode a JSON message.
pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T> {
    Ok(serde_json::from_str(raw)?)
}

/// Decode an envelope, returning `None` for traffic from other sources.
pub fn decode_envelope<T: DeserializeOwned>(raw: &str) -> Result<Option<T>> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    if value.get("source").and_then(|s| s.as_str()) != Some(ENVELOPE_SOURCE) {
        return Ok(None);
    }
    let envelope: Envelope<T> = serde_json::from_value(value)?;
    Ok(Some(envelope.message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_command_wire_form() {
        let json = encode(&GuardCommand::AllowAction { id: "abc".into() }).unwrap();
        assert_eq!(json, r#"{"type":"allow-action","id":"abc"}"#);

        let cmd: GuardCommand =
            decode(r#"{"type":"allow","allow_open":true,"allow_redirect":false,"ttl_ms":1500}"#)
                .unwrap();
        assert_eq!(
            cmd,
            GuardCommand::Allow {
                allow_open: true,
                allow_redirect: false,
                ttl_ms: 1500
            }
        );
    }

    #[test]
    fn test_page_message_wire_form() {
        let msg: PageMessage =
            decode(r#"{"type":"check-forward","current_url":"https://a.example/"}"#).unwrap();
        assert_eq!(
            msg,
            PageMessage::CheckForward {
                current_url: "https://a.example/".into()
            }
        );
        assert_eq!(encode(&PageMessage::Ready).unwrap(), r#"{"type":"ready"}"#);
    }

    #[test]
    fn test_rollback_message_omits_missing_prev_url() {
        let json = encode(&BackgroundMessage::Rollback {
            url: "https://ads.example/".into(),
            prev_url: None,
            qualifiers: vec![TransitionQualifier::ClientRedirect],
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"rollback","url":"https://ads.example/","qualifiers":["client_redirect"]}"#
        );
    }

    #[test]
    fn test_block_report_kind_names() {
        let report: BlockReport =
            decode(r#"{"kind":"form_request_submit","url":"","ts":12}"#).unwrap();
        assert_eq!(report.kind, ActionKind::FormRequestSubmit);
        assert!(report.id.is_none());
        assert!(report.kind.is_form());
    }

    #[test]
    fn test_envelope_filters_foreign_sources() {
        let cmd = GuardCommand::OpenOnce {
            url: "https://docs.example/".into(),
            ttl_ms: 10,
        };
        let ours = encode(&Envelope::new(cmd.clone())).unwrap();
        let decoded: Option<GuardCommand> = decode_envelope(&ours).unwrap();
        assert_eq!(decoded, Some(cmd));

        let foreign = r#"{"source":"ad-sdk","type":"open-once","url":"https://x.example/","ttl_ms":10}"#;
        let decoded: Option<GuardCommand> = decode_envelope(foreign).unwrap();
        assert!(decoded.is_none());

        assert!(decode_envelope::<GuardCommand>("not json").is_err());
    }
}
