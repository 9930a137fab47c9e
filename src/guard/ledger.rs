//! Blocked-action ledger.
//!
//! Each suppressed call is parked here with a replay thunk capturing its exact
//! arguments. An entry is replayable at most once and only until it expires;
//! late or repeated `allow-action` messages find nothing.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::clock::deadline;
use crate::error::{Error, Result};
use crate::protocol::ActionKind;

use super::sink::{dispatch, NavOutcome, NavigationCall, NavigationSink};

/// Deferred invocation of the original primitive.
pub type ReplayThunk = Box<dyn FnOnce(&dyn NavigationSink) -> Result<NavOutcome> + Send>;

/// One suppressed navigation call.
pub struct BlockedAction {
    /// Ledger id.
    pub id: String,
    /// Suppressed primitive.
    pub kind: ActionKind,
    /// Resolved destination, empty when unparsable.
    pub url: String,
    /// Block time.
    pub created_at: u64,
    /// Time after which the entry cannot be replayed.
    pub expires_at: u64,
    replay: ReplayThunk,
}

impl BlockedAction {
    /// Entry replaying `call` verbatim.
    pub fn for_call(call: NavigationCall, url: String, now_ms: u64, ttl: Duration) -> Self {
        let kind = call.kind();
        Self::new(
            kind,
            url,
            now_ms,
            ttl,
            Box::new(move |sink: &dyn NavigationSink| dispatch(sink, &call)),
        )
    }

    /// Entry with a custom replay thunk.
    pub fn new(kind: ActionKind, url: String, now_ms: u64, ttl: Duration, replay: ReplayThunk) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            url,
            created_at: now_ms,
            expires_at: deadline(now_ms, ttl),
            replay,
        }
    }

    /// Whether the entry can still be replayed.
    pub fn is_live(&self, now_ms: u64) -> bool {
        now_ms <= self.expires_at
    }

    /// Run the original call.
    pub fn replay(self, sink: &dyn NavigationSink) -> Result<NavOutcome> {
        (self.replay)(sink)
    }
}

impl fmt::Debug for BlockedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockedAction")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("url", &self.url)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Id-keyed store of blocked actions.
#[derive(Debug, Default)]
pub struct Ledger {
    entries: HashMap<String, BlockedAction>,
}

impl Ledger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Park an action, dropping any that already expired. Returns its id.
    pub fn record(&mut self, action: BlockedAction) -> String {
        self.purge_expired(action.created_at);
        let id = action.id.clone();
        self.entries.insert(id.clone(), action);
        id
    }

    /// Remove and return a live entry.
    ///
    /// Unknown ids and expired entries yield [`Error::ActionExpired`]; an
    /// expired entry is dropped in the process.
    pub fn claim(&mut self, id: &str, now_ms: u64) -> Result<BlockedAction> {
        let action = self
            .entries
            .remove(id)
            .ok_or_else(|| Error::ActionExpired(id.to_string()))?;
        if !action.is_live(now_ms) {
            tracing::debug!(id, kind = %action.kind, "ledger entry expired before replay");
            return Err(Error::ActionExpired(id.to_string()));
        }
        Ok(action)
    }

    /// Drop every expired entry.
    pub fn purge_expired(&mut self, now_ms: u64) {
        self.entries.retain(|_, action| action.is_live(now_ms));
    }

    /// Entries currently held, live or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
