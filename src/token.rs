//! Gesture tokens: the most recent scored gesture, kept for diagnostics.
//!
//! A token never authorizes navigation. The allowance windows in
//! [`crate::guard`] are the security gate; tokens only let debug tooling and
//! later correlation see what the last gesture looked like.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::deadline;
use crate::config::Mode;
use crate::scoring::{ReasonCode, ScoreResult};
use crate::signals::PointerEventData;

/// How the gesture was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GestureType {
    /// Pointer gesture.
    Pointer,
    /// Keyboard activation.
    Keyboard,
}

/// Record of one scored gesture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GestureToken {
    /// Unique id.
    pub id: String,
    /// Creation time.
    pub created_at: u64,
    /// Time after which the token is absent.
    pub expires_at: u64,
    /// Gesture type.
    #[serde(rename = "type")]
    pub gesture_type: GestureType,
    /// Site the gesture happened on.
    pub site_key: String,
    /// Frame the gesture happened in.
    pub frame_key: String,
    /// Mode in effect.
    pub mode: Mode,
    /// Pointer details for pointer gestures.
    pub pointer: Option<PointerEventData>,
    /// Deceptiveness score.
    pub cds: u32,
    /// Reasons behind the score.
    pub reason_codes: Vec<ReasonCode>,
}

/// Inputs for [`make_token`].
#[derive(Debug, Clone)]
pub struct TokenParams {
    /// Site key.
    pub site_key: String,
    /// Frame key.
    pub frame_key: String,
    /// Mode in effect.
    pub mode: Mode,
    /// Pointer details; `None` marks a keyboard gesture.
    pub pointer: Option<PointerEventData>,
    /// Score of the gesture.
    pub score: ScoreResult,
}

/// Create a token valid for `ttl` from `now_ms`.
pub fn make_token(params: TokenParams, now_ms: u64, ttl: Duration) -> GestureToken {
    GestureToken {
        id: uuid::Uuid::new_v4().to_string(),
        created_at: now_ms,
        expires_at: deadline(now_ms, ttl),
        gesture_type: if params.pointer.is_some() {
            GestureType::Pointer
        } else {
            GestureType::Keyboard
        },
        site_key: params.site_key,
        frame_key: params.frame_key,
        mode: params.mode,
        pointer: params.pointer,
        cds: params.score.cds,
        reason_codes: params.score.reason_codes,
    }
}

/// Holder of the single active token.
#[derive(Debug)]
pub struct GestureTokenStore {
    ttl: Duration,
    active: Option<GestureToken>,
}

impl GestureTokenStore {
    /// Empty store issuing tokens with the given lifetime.
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, active: None }
    }

    /// Create a token and make it the active one, replacing any previous token.
    pub fn issue(&mut self, params: TokenParams, now_ms: u64) -> &GestureToken {
        let token = make_token(params, now_ms, self.ttl);
        tracing::trace!(
            id = %token.id,
            cds = token.cds,
            reasons = ?token.reason_codes,
            "gesture token issued"
        );
        self.active.insert(token)
    }

    /// Active token, dropping it if it has expired.
    pub fn active(&mut self, now_ms: u64) -> Option<&GestureToken> {
        if self.active.as_ref().is_some_and(|t| now_ms > t.expires_at) {
            self.active = None;
        }
        self.active.as_ref()
    }

    /// Forget the active token.
    pub fn clear(&mut self) {
        self.active = None;
    }
}

/// Site key of a page: its lower-case hostname.
pub fn site_key(page_url: &url::Url) -> String {
    page_url.host_str().unwrap_or("").to_lowercase()
}

/// Frame key: `top` for the top-level frame, `frame` otherwise.
pub fn frame_key(is_top_frame: bool) -> &'static str {
    if is_top_frame {
        "top"
    } else {
        "frame"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pointer: Option<PointerEventData>, cds: u32) -> TokenParams {
        TokenParams {
            site_key: "news.example".into(),
            frame_key: "top".into(),
            mode: Mode::Strict,
            pointer,
            score: ScoreResult {
                cds,
                reason_codes: Vec::new(),
            },
        }
    }

    #[test]
    fn test_token_expires() {
        let mut store = GestureTokenStore::new(Duration::from_millis(800));
        store.issue(params(Some(PointerEventData::at(1.0, 2.0)), 10), 1_000);
        assert!(store.active(1_800).is_some());
        assert!(store.active(1_801).is_none());
        assert!(store.active(1_000).is_none());
    }

    #[test]
    fn test_new_token_overwrites() {
        let mut store = GestureTokenStore::new(Duration::from_millis(800));
        let first = store.issue(params(None, 1), 0).id.clone();
        let second = store.issue(params(None, 2), 10).id.clone();
        assert_ne!(first, second);
        let active = store.active(20).unwrap();
        assert_eq!(active.id, second);
        assert_eq!(active.cds, 2);
        assert_eq!(active.gesture_type, GestureType::Keyboard);
    }

    #[test]
    fn test_site_and_frame_keys() {
        let url = url::Url::parse("https://News.Example:8443/a").unwrap();
        assert_eq!(site_key(&url), "news.example");
        assert_eq!(frame_key(true), "top");
        assert_eq!(frame_key(false), "frame");
    }
}
