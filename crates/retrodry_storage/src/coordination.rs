//! Shared coordination state: sessions, locks, subscriptions, versions and
//! the change log.
//!
//! Every server instance talks to the same [`CoordinationStore`]. The only
//! operation that needs true atomicity across instances is
//! [`CoordinationStore::try_lock`], which must be a single conditional write.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use retrodry_core::DatonKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

/// Default number of change records retained.
pub const DEFAULT_CHANGE_CAPACITY: usize = 4096;

/// Durable per-session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Session id.
    pub id: String,
    /// Authenticated user id.
    pub user: String,
    /// Roles of the user.
    pub roles: Vec<String>,
    /// Language for prompts and messages.
    pub language: String,
    /// Last request time.
    pub last_activity: DateTime<Utc>,
    /// Change-log sequence the session has been served up to.
    pub cursor: u64,
}

/// How a session holds a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubscribeMode {
    /// Receives pushes.
    Watching,
    /// Exclusive editor; also receives nothing while locked.
    Locked,
}

/// Result of a lock attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockOutcome {
    /// The lock was free and now belongs to the caller.
    Acquired,
    /// The caller already held it.
    AlreadyHeld,
    /// Another session holds it.
    HeldBy(String),
}

impl LockOutcome {
    /// Returns true if the caller holds the lock after the attempt.
    pub fn is_held(&self) -> bool {
        matches!(self, LockOutcome::Acquired | LockOutcome::AlreadyHeld)
    }
}

/// A committed event visible to every instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    /// A persiston was written.
    DatonSaved {
        /// Key of the saved daton.
        key: DatonKey,
        /// Version after the save.
        version: String,
        /// Session that saved it.
        origin_session: String,
    },
    /// A session was quit or reaped.
    SessionEnded {
        /// The ended session.
        session_id: String,
    },
}

/// A change with its log sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Sequence number, starting at 1.
    pub seq: u64,
    /// The change.
    pub change: Change,
}

/// Changes read from a cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeBatch {
    /// Records with `seq > cursor`, in order.
    pub records: Vec<ChangeRecord>,
    /// True if records after the cursor were already discarded.
    pub truncated: bool,
}

impl ChangeBatch {
    /// Sequence of the last record, if any.
    pub fn last_seq(&self) -> Option<u64> {
        self.records.last().map(|r| r.seq)
    }
}

/// Shared store backing the coordinator.
pub trait CoordinationStore: Send + Sync {
    /// Registers a new session.
    fn create_session(&self, record: SessionRecord) -> StorageResult<()>;

    /// Reads a session.
    fn session(&self, id: &str) -> StorageResult<Option<SessionRecord>>;

    /// Records activity on a session.
    fn touch_session(&self, id: &str, now: DateTime<Utc>) -> StorageResult<()>;

    /// Advances a session's change-log cursor.
    fn set_cursor(&self, id: &str, cursor: u64) -> StorageResult<()>;

    /// Removes a session and every lock and subscription it holds.
    fn remove_session(&self, id: &str) -> StorageResult<Option<SessionRecord>>;

    /// Ids of sessions whose last activity is before `cutoff`.
    fn idle_sessions(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<String>>;

    /// Locks `key` for `session` if it is unlocked or already held by it.
    ///
    /// Fails with [`StorageError::UnknownSession`] if the session is gone,
    /// checked in the same atomic step as the lock.
    fn try_lock(&self, key: &DatonKey, session: &str) -> StorageResult<LockOutcome>;

    /// Marks `session` as watching `key`, releasing its lock if it held one.
    ///
    /// Fails with [`StorageError::UnknownSession`] if the session is gone.
    fn subscribe(&self, key: &DatonKey, session: &str) -> StorageResult<()>;

    /// Drops any lock or subscription `session` has on `key`.
    fn unsubscribe(&self, key: &DatonKey, session: &str) -> StorageResult<()>;

    /// Current lock holder of `key`.
    fn lock_holder(&self, key: &DatonKey) -> StorageResult<Option<String>>;

    /// How `session` holds `key`, if at all.
    fn mode_of(&self, key: &DatonKey, session: &str) -> StorageResult<Option<SubscribeMode>>;

    /// Every key `session` holds.
    fn subscriptions_of(&self, session: &str) -> StorageResult<Vec<(DatonKey, SubscribeMode)>>;

    /// Drops every lock and subscription of `session`.
    fn release_all(&self, session: &str) -> StorageResult<()>;

    /// Version token of `key`, if one was ever assigned.
    fn version(&self, key: &DatonKey) -> StorageResult<Option<String>>;

    /// Returns the existing token of `key` or stores `candidate` and returns it.
    fn ensure_version(&self, key: &DatonKey, candidate: String) -> StorageResult<String>;

    /// Replaces the token of `key` only if it currently equals `expected`.
    fn set_version(&self, key: &DatonKey, expected: Option<&str>, new: String) -> StorageResult<bool>;

    /// Appends a change and returns its sequence number.
    fn append_change(&self, change: Change) -> StorageResult<u64>;

    /// Reads up to `limit` changes after `cursor`.
    fn changes_since(&self, cursor: u64, limit: usize) -> StorageResult<ChangeBatch>;

    /// Highest assigned sequence, 0 if none.
    fn latest_sequence(&self) -> StorageResult<u64>;
}

#[derive(Debug, Default)]
struct KeyEntry {
    locked_by: Option<String>,
    watchers: BTreeSet<String>,
}

impl KeyEntry {
    fn is_empty(&self) -> bool {
        self.locked_by.is_none() && self.watchers.is_empty()
    }

    fn release(&mut self, session: &str) {
        if self.locked_by.as_deref() == Some(session) {
            self.locked_by = None;
        }
        self.watchers.remove(session);
    }
}

#[derive(Debug)]
struct State {
    sessions: HashMap<String, SessionRecord>,
    keys: BTreeMap<DatonKey, KeyEntry>,
    versions: HashMap<DatonKey, String>,
    changes: VecDeque<ChangeRecord>,
    next_seq: u64,
    capacity: usize,
}

impl State {
    fn session_mut(&mut self, id: &str) -> StorageResult<&mut SessionRecord> {
        self.sessions
            .get_mut(id)
            .ok_or_else(|| StorageError::UnknownSession(id.to_string()))
    }

    fn release_all(&mut self, session: &str) {
        for entry in self.keys.values_mut() {
            entry.release(session);
        }
        self.keys.retain(|_, e| !e.is_empty());
    }

    fn append(&mut self, change: Change) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.changes.push_back(ChangeRecord { seq, change });
        while self.changes.len() > self.capacity {
            self.changes.pop_front();
        }
        seq
    }
}

/// In-memory [`CoordinationStore`] shared between coordinator instances of one
/// process.
///
/// All state sits behind one mutex, so every trait method is atomic.
/// Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryCoordinationStore {
    state: Arc<Mutex<State>>,
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::with_change_capacity(DEFAULT_CHANGE_CAPACITY)
    }
}

impl InMemoryCoordinationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that keeps at most `capacity` change records.
    #[must_use]
    pub fn with_change_capacity(capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                sessions: HashMap::new(),
                keys: BTreeMap::new(),
                versions: HashMap::new(),
                changes: VecDeque::new(),
                next_seq: 1,
                capacity: capacity.max(1),
            })),
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }
}

impl CoordinationStore for InMemoryCoordinationStore {
    fn create_session(&self, record: SessionRecord) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.sessions.contains_key(&record.id) {
            return Err(StorageError::Constraint(format!(
                "session {} already exists",
                record.id
            )));
        }
        state.sessions.insert(record.id.clone(), record);
        Ok(())
    }

    fn session(&self, id: &str) -> StorageResult<Option<SessionRecord>> {
        Ok(self.state.lock().sessions.get(id).cloned())
    }

    fn touch_session(&self, id: &str, now: DateTime<Utc>) -> StorageResult<()> {
        let mut state = self.state.lock();
        let record = state.session_mut(id)?;
        if now > record.last_activity {
            record.last_activity = now;
        }
        Ok(())
    }

    fn set_cursor(&self, id: &str, cursor: u64) -> StorageResult<()> {
        let mut state = self.state.lock();
        let record = state.session_mut(id)?;
        record.cursor = record.cursor.max(cursor);
        Ok(())
    }

    fn remove_session(&self, id: &str) -> StorageResult<Option<SessionRecord>> {
        let mut state = self.state.lock();
        let removed = state.sessions.remove(id);
        state.release_all(id);
        Ok(removed)
    }

    fn idle_sessions(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<String>> {
        let state = self.state.lock();
        let mut idle: Vec<String> = state
            .sessions
            .values()
            .filter(|s| s.last_activity < cutoff)
            .map(|s| s.id.clone())
            .collect();
        idle.sort();
        Ok(idle)
    }

    fn try_lock(&self, key: &DatonKey, session: &str) -> StorageResult<LockOutcome> {
        let mut state = self.state.lock();
        state.session_mut(session)?;
        let entry = state.keys.entry(key.clone()).or_default();
        let outcome = match entry.locked_by.as_deref() {
            Some(holder) if holder == session => LockOutcome::AlreadyHeld,
            Some(holder) => LockOutcome::HeldBy(holder.to_string()),
            None => {
                entry.locked_by = Some(session.to_string());
                entry.watchers.remove(session);
                LockOutcome::Acquired
            }
        };
        if entry.is_empty() {
            state.keys.remove(key);
        }
        Ok(outcome)
    }

    fn subscribe(&self, key: &DatonKey, session: &str) -> StorageResult<()> {
        let mut state = self.state.lock();
        state.session_mut(session)?;
        let entry = state.keys.entry(key.clone()).or_default();
        entry.release(session);
        entry.watchers.insert(session.to_string());
        Ok(())
    }

    fn unsubscribe(&self, key: &DatonKey, session: &str) -> StorageResult<()> {
        let mut state = self.state.lock();
        if let Some(entry) = state.keys.get_mut(key) {
            entry.release(session);
            if entry.is_empty() {
                state.keys.remove(key);
            }
        }
        Ok(())
    }

    fn lock_holder(&self, key: &DatonKey) -> StorageResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .keys
            .get(key)
            .and_then(|e| e.locked_by.clone()))
    }

    fn mode_of(&self, key: &DatonKey, session: &str) -> StorageResult<Option<SubscribeMode>> {
        let state = self.state.lock();
        Ok(state.keys.get(key).and_then(|e| {
            if e.locked_by.as_deref() == Some(session) {
                Some(SubscribeMode::Locked)
            } else if e.watchers.contains(session) {
                Some(SubscribeMode::Watching)
            } else {
                None
            }
        }))
    }

    fn subscriptions_of(&self, session: &str) -> StorageResult<Vec<(DatonKey, SubscribeMode)>> {
        let state = self.state.lock();
        Ok(state
            .keys
            .iter()
            .filter_map(|(key, e)| {
                if e.locked_by.as_deref() == Some(session) {
                    Some((key.clone(), SubscribeMode::Locked))
                } else if e.watchers.contains(session) {
                    Some((key.clone(), SubscribeMode::Watching))
                } else {
                    None
                }
            })
            .collect())
    }

    fn release_all(&self, session: &str) -> StorageResult<()> {
        self.state.lock().release_all(session);
        Ok(())
    }

    fn version(&self, key: &DatonKey) -> StorageResult<Option<String>> {
        Ok(self.state.lock().versions.get(key).cloned())
    }

    fn ensure_version(&self, key: &DatonKey, candidate: String) -> StorageResult<String> {
        Ok(self
            .state
            .lock()
            .versions
            .entry(key.clone())
            .or_insert(candidate)
            .clone())
    }

    fn set_version(&self, key: &DatonKey, expected: Option<&str>, new: String) -> StorageResult<bool> {
        let mut state = self.state.lock();
        if state.versions.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        state.versions.insert(key.clone(), new);
        Ok(true)
    }

    fn append_change(&self, change: Change) -> StorageResult<u64> {
        Ok(self.state.lock().append(change))
    }

    fn changes_since(&self, cursor: u64, limit: usize) -> StorageResult<ChangeBatch> {
        let state = self.state.lock();
        let oldest = state.changes.front().map_or(state.next_seq, |r| r.seq);
        let truncated = cursor + 1 < oldest && cursor < state.next_seq.saturating_sub(1);
        let records = state
            .changes
            .iter()
            .filter(|r| r.seq > cursor)
            .take(limit)
            .cloned()
            .collect();
        Ok(ChangeBatch { records, truncated })
    }

    fn latest_sequence(&self) -> StorageResult<u64> {
        Ok(self.state.lock().next_seq.saturating_sub(1))
    }
}
