//! The coordinator: sessions, locks, permission-filtered reads, saves and
//! long-poll.
//!
//! A coordinator keeps no durable state of its own. Sessions, locks,
//! subscriptions, version tokens and the change log live in the shared
//! [`CoordinationStore`], so any number of coordinator instances over the
//! same store behave as one server. The only per-instance state is the set
//! of long-poll waiters held open on this instance.
//!
//! ## Fan-out
//!
//! A save appends a [`Change::DatonSaved`] record to the shared change log
//! and wakes this instance's waiters at once. Every instance also runs a
//! change pump ([`Coordinator::pump_changes`]) that checks the log every
//! propagation interval and wakes its own waiters when something new
//! arrived. Each woken long-poll reads the log from its session cursor and
//! returns the current content of every key it watches that another
//! session saved.

use crate::auth::{Authenticator, User};
use crate::config::CoordinatorConfig;
use crate::error::{ServerError, ServerResult};
use crate::loader::DatonLoader;
use crate::permissions::{filter_daton, restricted_def, RowFilter};
use crate::sanitize::{ErrorSanitizer, GenericSanitizer};
use chrono::Utc;
use parking_lot::Mutex;
use retrodry_core::wire::{diff_json, peek_key};
use retrodry_core::{
    apply, validator, DataDictionary, Daton, DatonDef, DatonKey, PermissionLevel, PersistonDiff,
    SqlWriter, Value,
};
use retrodry_protocol::{ItemError, SubscribeState};
use retrodry_storage::{
    Change, CoordinationStore, LockOutcome, SessionRecord, SqlDatabase, StorageError, SubscribeMode,
};
use serde_json::Value as Json;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A daton as one user may see it, with the definition to encode it with.
#[derive(Debug, Clone)]
pub struct VisibleDaton {
    /// Definition restricted to the user's roles.
    pub def: DatonDef,
    /// Filtered content.
    pub daton: Daton,
}

/// Outcome of a successful save.
#[derive(Debug, Clone)]
pub struct SavedDaton {
    /// Key the diff addressed.
    pub key: DatonKey,
    /// Permanent key when a new persiston was created.
    pub new_key: Option<DatonKey>,
    /// Canonical content after the save, as the saver may see it.
    pub content: VisibleDaton,
    /// `Table.Column` names whose changes were dropped for lack of permission.
    pub denied: Vec<String>,
}

/// A session as seen by one request.
#[derive(Debug, Clone)]
struct Caller {
    session_id: String,
    user: User,
    language: String,
}

impl From<SessionRecord> for Caller {
    fn from(record: SessionRecord) -> Self {
        Self {
            user: User {
                id: record.user,
                roles: record.roles,
            },
            session_id: record.id,
            language: record.language,
        }
    }
}

enum Pending {
    Updates(Vec<DatonKey>),
    Ended,
}

/// Serves every session-scoped operation.
///
/// # Example
///
/// ```
/// use retrodry_core::DataDictionary;
/// use retrodry_server::{Coordinator, CoordinatorConfig, User};
/// use retrodry_storage::{InMemoryCoordinationStore, InMemoryDatabase};
/// use std::sync::Arc;
///
/// let coordinator = Coordinator::new(
///     CoordinatorConfig::default(),
///     Arc::new(DataDictionary::new()),
///     Arc::new(InMemoryDatabase::new()),
///     Arc::new(InMemoryCoordinationStore::new()),
/// );
/// let session = coordinator.create_session(&User::new("alice"), None).unwrap();
/// assert!(coordinator.session_exists(&session).unwrap());
/// ```
pub struct Coordinator {
    config: CoordinatorConfig,
    dictionary: Arc<DataDictionary>,
    store: Arc<dyn CoordinationStore>,
    database: Arc<dyn SqlDatabase>,
    loader: DatonLoader,
    writer: SqlWriter,
    authenticator: Option<Arc<dyn Authenticator>>,
    sanitizer: Arc<dyn ErrorSanitizer>,
    row_filter: Option<Arc<dyn RowFilter>>,
    waiters: Mutex<HashMap<String, Arc<Notify>>>,
    pumped_seq: AtomicU64,
}

impl Coordinator {
    /// Creates a coordinator over a database and a shared coordination store.
    pub fn new(
        config: CoordinatorConfig,
        dictionary: Arc<DataDictionary>,
        database: Arc<dyn SqlDatabase>,
        store: Arc<dyn CoordinationStore>,
    ) -> Self {
        let pumped_seq = store.latest_sequence().unwrap_or(0);
        Self {
            config,
            dictionary,
            loader: DatonLoader::new(Arc::clone(&database)),
            database,
            store,
            writer: SqlWriter::default(),
            authenticator: None,
            sanitizer: Arc::new(GenericSanitizer::default()),
            row_filter: None,
            waiters: Mutex::new(HashMap::new()),
            pumped_seq: AtomicU64::new(pumped_seq),
        }
    }

    /// Sets the authenticator used by [`Coordinator::start_session`].
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Sets the storage error sanitizer.
    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn ErrorSanitizer>) -> Self {
        self.sanitizer = sanitizer;
        self
    }

    /// Sets a row filter applied to every outgoing daton.
    pub fn with_row_filter(mut self, filter: Arc<dyn RowFilter>) -> Self {
        self.row_filter = Some(filter);
        self
    }

    /// Sets the SQL writer (flavor and value rewriter).
    pub fn with_writer(mut self, writer: SqlWriter) -> Self {
        self.writer = writer;
        self
    }

    /// Configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Full data dictionary.
    pub fn dictionary(&self) -> &Arc<DataDictionary> {
        &self.dictionary
    }

    /// Converts an error for the wire, sanitizing storage failures.
    pub fn item_error(&self, err: &ServerError) -> ItemError {
        if err.is_server_error() {
            warn!(instance = %self.config.instance_name, error = %err, "request failed");
        }
        err.to_item_error(|storage| self.sanitizer.sanitize(storage))
    }

    // ----- sessions -----

    /// Authenticates `credential` and opens a session for the user.
    pub async fn start_session(&self, credential: &str, language: Option<&str>) -> ServerResult<(String, User)> {
        let authenticator = self
            .authenticator
            .as_ref()
            .ok_or_else(|| ServerError::Auth("no authenticator configured".into()))?;
        let user = authenticator.authenticate(credential).await?;
        let session_id = self.create_session(&user, language)?;
        Ok((session_id, user))
    }

    /// Opens a session for an already-authenticated user.
    pub fn create_session(&self, user: &User, language: Option<&str>) -> ServerResult<String> {
        let session_id = Uuid::new_v4().to_string();
        self.store.create_session(SessionRecord {
            id: session_id.clone(),
            user: user.id.clone(),
            roles: user.roles.clone(),
            language: language.unwrap_or(&self.config.default_language).to_string(),
            last_activity: Utc::now(),
            cursor: self.store.latest_sequence()?,
        })?;
        info!(session = %session_id, user = %user.id, instance = %self.config.instance_name, "session started");
        Ok(session_id)
    }

    /// Returns true if the session is live.
    pub fn session_exists(&self, session_id: &str) -> ServerResult<bool> {
        Ok(self.store.session(session_id)?.is_some())
    }

    /// The user of a live session.
    pub fn session_user(&self, session_id: &str) -> ServerResult<User> {
        Ok(self.caller(session_id)?.user)
    }

    fn caller(&self, session_id: &str) -> ServerResult<Caller> {
        let record = self
            .store
            .session(session_id)?
            .ok_or_else(|| ServerError::Auth(format!("unknown session {session_id}")))?;
        self.store
            .touch_session(session_id, Utc::now())
            .map_err(|err| session_error(session_id, err))?;
        Ok(record.into())
    }

    /// Ends a session, releasing its locks and subscriptions.
    ///
    /// Returns false if the session did not exist.
    pub fn quit(&self, session_id: &str) -> ServerResult<bool> {
        let ended = self.end_session(session_id)?;
        if ended {
            info!(session = %session_id, "session quit");
        }
        Ok(ended)
    }

    fn end_session(&self, session_id: &str) -> ServerResult<bool> {
        let removed = self.store.remove_session(session_id)?;
        if removed.is_none() {
            return Ok(false);
        }
        self.store.append_change(Change::SessionEnded {
            session_id: session_id.to_string(),
        })?;
        if let Some(waiter) = self.waiters.lock().remove(session_id) {
            waiter.notify_one();
        }
        Ok(true)
    }

    /// Tears down every session idle past the configured timeout.
    ///
    /// Returns the reaped session ids.
    pub fn reap_idle(&self) -> ServerResult<Vec<String>> {
        let idle = chrono::Duration::from_std(self.config.session_idle_timeout)
            .map_err(|e| ServerError::Internal(e.to_string()))?;
        let mut reaped = Vec::new();
        for session_id in self.store.idle_sessions(Utc::now() - idle)? {
            if self.end_session(&session_id)? {
                info!(session = %session_id, instance = %self.config.instance_name, "idle session reaped");
                reaped.push(session_id);
            }
        }
        Ok(reaped)
    }

    // ----- reads -----

    /// Loads a daton as the session's user may see it.
    pub fn get_daton(&self, key: &DatonKey, session_id: &str) -> ServerResult<VisibleDaton> {
        let caller = self.caller(session_id)?;
        self.load_visible(key, &caller.user)
    }

    fn load_visible(&self, key: &DatonKey, user: &User) -> ServerResult<VisibleDaton> {
        let restricted = restricted_def(&self.dictionary, key, user)?;
        let def = self.dictionary.def_for(key)?;
        let mut daton = self
            .loader
            .load(def, key)?
            .ok_or_else(|| ServerError::NotFound(key.to_string()))?;
        daton.version = Some(if def.kind.is_persiston() {
            self.store.ensure_version(key, new_version())?
        } else {
            new_version()
        });
        let daton = filter_daton(&restricted, &daton, user, self.row_filter.as_ref());
        Ok(VisibleDaton { def: restricted, daton })
    }

    // ----- locks and subscriptions -----

    /// Moves one key of a session to a new subscribe state.
    ///
    /// Locking is a single compare-and-set in the shared store; at most one
    /// session holds a key locked, however many instances serve them.
    pub fn change_lock_state(&self, key: &DatonKey, session_id: &str, state: SubscribeState) -> ServerResult<()> {
        let caller = self.caller(session_id)?;
        match state {
            SubscribeState::None => self.store.unsubscribe(key, session_id)?,
            SubscribeState::Subscribed => {
                restricted_def(&self.dictionary, key, &caller.user)?;
                self.store
                    .subscribe(key, session_id)
                    .map_err(|err| session_error(session_id, err))?;
            }
            SubscribeState::Locked => {
                let restricted = restricted_def(&self.dictionary, key, &caller.user)?;
                if !restricted.kind.is_persiston() {
                    return Err(ServerError::InvalidRequest(format!("viewon {key} cannot be locked")));
                }
                if restricted.main_table.level() < PermissionLevel::Modify {
                    return Err(ServerError::PermissionDenied(format!("{} is read-only", restricted.name)));
                }
                let outcome = self
                    .store
                    .try_lock(key, session_id)
                    .map_err(|err| session_error(session_id, err))?;
                if let LockOutcome::HeldBy(holder) = outcome {
                    debug!(session = %session_id, key = %key, holder = %holder, "lock conflict");
                    return Err(ServerError::LockConflict { key: key.clone() });
                }
                debug!(session = %session_id, key = %key, "locked");
            }
        }
        Ok(())
    }

    /// Locks a key and loads it, for a get that also locks.
    ///
    /// When the lock is refused the session watches the key instead, so the
    /// copy it receives still gets pushes; the refusal comes back beside the
    /// content. When the load fails the key returns to its previous state,
    /// so no lock or subscription outlives a failed get.
    pub fn get_daton_locked(
        &self,
        key: &DatonKey,
        session_id: &str,
    ) -> ServerResult<(VisibleDaton, Option<ServerError>)> {
        let previous = self.store.mode_of(key, session_id)?;
        let lock_error = match self.change_lock_state(key, session_id, SubscribeState::Locked) {
            Ok(()) => None,
            Err(err @ ServerError::Auth(_)) => return Err(err),
            Err(err) => {
                if previous.is_none() {
                    self.change_lock_state(key, session_id, SubscribeState::Subscribed)?;
                }
                Some(err)
            }
        };
        match self.get_daton(key, session_id) {
            Ok(visible) => Ok((visible, lock_error)),
            Err(err) => {
                let restored = match previous {
                    Some(SubscribeMode::Locked) => Ok(()),
                    Some(SubscribeMode::Watching) => self.store.subscribe(key, session_id),
                    None => self.store.unsubscribe(key, session_id),
                };
                if let Err(undo) = restored {
                    warn!(session = %session_id, key = %key, error = %undo, "could not restore subscribe state");
                }
                Err(err)
            }
        }
    }

    // ----- saves -----

    /// Saves one diff JSON document for a session.
    ///
    /// Checks run in order: lock, version, permission, validation. Nothing
    /// is written unless all pass. The write itself is one transaction.
    pub async fn save(&self, diff_json: &Json, session_id: &str) -> ServerResult<SavedDaton> {
        let caller = self.caller(session_id)?;
        let key = peek_key(diff_json)?;
        let def = Arc::clone(self.dictionary.def_for(&key)?);
        if !def.kind.is_persiston() {
            return Err(ServerError::InvalidRequest(format!("viewon {key} cannot be saved")));
        }
        let restricted = def
            .restricted_for(&caller.user.roles)
            .ok_or_else(|| ServerError::PermissionDenied(format!("{} is not visible", def.name)))?;
        let diff = diff_json::diff_from_json(&def, diff_json, self.config.strict_decoding)?;

        let previous = self.store.mode_of(&key, session_id)?;
        let outcome = self
            .store
            .try_lock(&key, session_id)
            .map_err(|err| session_error(session_id, err))?;
        let transient = match outcome {
            LockOutcome::HeldBy(_) => {
                debug!(session = %session_id, key = %key, "save blocked by lock");
                return Err(ServerError::LockConflict { key });
            }
            LockOutcome::Acquired => true,
            LockOutcome::AlreadyHeld => false,
        };
        let result = self.save_locked(&caller, &def, &restricted, diff).await;
        if transient {
            let released = match previous {
                Some(SubscribeMode::Watching) => self.store.subscribe(&key, session_id),
                _ => self.store.unsubscribe(&key, session_id),
            };
            if let Err(err) = released {
                warn!(session = %session_id, key = %key, error = %err, "could not release save lock");
            }
        }
        result
    }

    async fn save_locked(
        &self,
        caller: &Caller,
        def: &DatonDef,
        restricted: &DatonDef,
        mut diff: PersistonDiff,
    ) -> ServerResult<SavedDaton> {
        let key = diff.key.clone();
        let current = if key.is_new() { None } else { self.store.version(&key)? };
        if current.is_some() && current != diff.based_on_version {
            debug!(session = %caller.session_id, key = %key, "version conflict");
            return Err(ServerError::VersionConflict { key });
        }

        let denied = diff.strip_unmodifiable(restricted);
        if diff.is_empty() && !denied.is_empty() {
            return Err(ServerError::PermissionDenied(format!("not modifiable: {}", denied.join(", "))));
        }

        let stored = if key.is_new() {
            Daton::new(key.clone(), Vec::new())
        } else {
            self.loader
                .load(def, &key)?
                .ok_or_else(|| ServerError::NotFound(key.to_string()))?
        };
        let mut modified = stored.clone();
        if let Err(err) = apply(def, &diff, &mut modified) {
            debug!(key = %key, error = %err, "diff does not match stored daton");
            return Err(ServerError::VersionConflict { key });
        }
        let errors = validator::validate(def, &modified, &caller.language).await;
        if !errors.is_empty() {
            return Err(ServerError::Validation(errors));
        }

        if diff.is_empty() {
            let content = self.load_visible(&key, &caller.user)?;
            return Ok(SavedDaton {
                key,
                new_key: None,
                content,
                denied,
            });
        }

        // Claim the next version before writing; a concurrent save of the
        // same key loses here and writes nothing.
        let mut version = new_version();
        if !key.is_new() && !self.store.set_version(&key, current.as_deref(), version.clone())? {
            debug!(session = %caller.session_id, key = %key, "version changed during save");
            return Err(ServerError::VersionConflict { key });
        }
        let main_key = match self.write(def, &diff, &stored) {
            Ok(main_key) => main_key,
            Err(err) => {
                if let Some(previous) = current {
                    if let Err(undo) = self.store.set_version(&key, Some(&version), previous) {
                        warn!(key = %key, error = %undo, "could not restore version token");
                    }
                }
                return Err(err);
            }
        };
        let new_key = match (key.is_new(), main_key) {
            (true, Some(generated)) => Some(DatonKey::row(def.name.clone(), generated.to_key_text())),
            _ => None,
        };
        let saved_key = new_key.clone().unwrap_or_else(|| key.clone());
        if key.is_new() {
            version = self.store.ensure_version(&saved_key, version)?;
        }
        self.store.append_change(Change::DatonSaved {
            key: saved_key.clone(),
            version,
            origin_session: caller.session_id.clone(),
        })?;
        info!(session = %caller.session_id, key = %saved_key, denied = denied.len(), "daton saved");
        self.wake_all();

        let content = self.load_visible(&saved_key, &caller.user)?;
        Ok(SavedDaton {
            key,
            new_key,
            content,
            denied,
        })
    }

    /// Runs the planned writes in one transaction; returns the generated
    /// key of a new main row.
    fn write(&self, def: &DatonDef, diff: &PersistonDiff, stored: &Daton) -> ServerResult<Option<Value>> {
        let steps = self.writer.plan(def, diff, stored)?;
        let mut tx = self.database.begin()?;
        let mut generated: Vec<Option<Value>> = Vec::with_capacity(steps.len());
        let mut main_key = None;
        for mut step in steps {
            step.bind_parent(&generated)?;
            let key = tx.execute(&step.command)?;
            if step.is_main_insert {
                main_key = key.clone();
            }
            generated.push(key);
        }
        tx.commit()?;
        Ok(main_key)
    }

    // ----- long-poll -----

    /// Waits until a watched key is saved by another session, or `timeout`.
    ///
    /// Returns the new content of every such key, or an empty list on
    /// timeout. The wait is capped by the configured long-poll cap.
    pub async fn long_poll(&self, session_id: &str, timeout: Duration) -> ServerResult<Vec<VisibleDaton>> {
        let caller = self.caller(session_id)?;
        let waiter = self.waiter(session_id);
        let deadline = Instant::now() + timeout.min(self.config.long_poll_cap);
        loop {
            match self.pending_updates(&caller)? {
                Pending::Ended => {
                    self.waiters.lock().remove(session_id);
                    return Err(ServerError::Auth(format!("session {session_id} ended")));
                }
                Pending::Updates(keys) if !keys.is_empty() => {
                    let mut updates = Vec::with_capacity(keys.len());
                    for key in keys {
                        match self.load_visible(&key, &caller.user) {
                            Ok(visible) => updates.push(visible),
                            Err(err) => debug!(session = %session_id, key = %key, error = %err, "skipping push"),
                        }
                    }
                    if !updates.is_empty() {
                        debug!(session = %session_id, count = updates.len(), "long-poll delivered");
                        return Ok(updates);
                    }
                }
                Pending::Updates(_) => {}
            }
            if tokio::time::timeout_at(deadline, waiter.notified()).await.is_err() {
                self.release_waiter(session_id, &waiter);
                return Ok(Vec::new());
            }
        }
    }

    // Keeps the entry while another poll for the session still waits on it.
    fn release_waiter(&self, session_id: &str, waiter: &Arc<Notify>) {
        let mut waiters = self.waiters.lock();
        let idle = waiters
            .get(session_id)
            .is_some_and(|held| Arc::ptr_eq(held, waiter) && Arc::strong_count(held) == 2);
        if idle {
            waiters.remove(session_id);
        }
    }

    fn waiter(&self, session_id: &str) -> Arc<Notify> {
        Arc::clone(
            self.waiters
                .lock()
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    /// Reads the change log from the session cursor and advances it.
    fn pending_updates(&self, caller: &Caller) -> ServerResult<Pending> {
        let Some(record) = self.store.session(&caller.session_id)? else {
            return Ok(Pending::Ended);
        };
        let batch = self
            .store
            .changes_since(record.cursor, self.config.max_changes_per_poll)?;
        let Some(last) = batch.last_seq() else {
            return Ok(Pending::Updates(Vec::new()));
        };
        let watched: BTreeSet<DatonKey> = self
            .store
            .subscriptions_of(&caller.session_id)?
            .into_iter()
            .filter(|(_, mode)| *mode == SubscribeMode::Watching)
            .map(|(key, _)| key)
            .collect();
        let mut keys = BTreeSet::new();
        if batch.truncated {
            keys.extend(watched.iter().cloned());
        }
        for record in &batch.records {
            match &record.change {
                Change::SessionEnded { session_id } if *session_id == caller.session_id => {
                    return Ok(Pending::Ended);
                }
                Change::DatonSaved {
                    key,
                    origin_session,
                    ..
                } if *origin_session != caller.session_id && watched.contains(key) => {
                    keys.insert(key.clone());
                }
                _ => {}
            }
        }
        self.store.set_cursor(&caller.session_id, last)?;
        Ok(Pending::Updates(keys.into_iter().collect()))
    }

    fn wake_all(&self) {
        for waiter in self.waiters.lock().values() {
            waiter.notify_one();
        }
    }

    /// Wakes local long-polls if the shared change log moved since the last
    /// call. Run periodically by [`RetroServer`](crate::RetroServer).
    pub fn pump_changes(&self) -> ServerResult<bool> {
        let latest = self.store.latest_sequence()?;
        let seen = self.pumped_seq.fetch_max(latest, Ordering::SeqCst);
        if latest > seen {
            self.wake_all();
            return Ok(true);
        }
        Ok(false)
    }

    /// Number of long-poll waiters registered on this instance.
    pub fn waiter_count(&self) -> usize {
        self.waiters.lock().len()
    }
}

// A session removed by a quit or the reaper on any instance.
fn session_error(session_id: &str, err: StorageError) -> ServerError {
    match err {
        StorageError::UnknownSession(_) => ServerError::Auth(format!("unknown session {session_id}")),
        err => err.into(),
    }
}

fn new_version() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrodry_core::wire::{diff_json::diff_to_json, encode_daton};
    use async_trait::async_trait;
    use retrodry_core::{diff, ColDef, CustomValidator, Encoding, FieldError, Row, TableDef, ValidatorHook, WireType};
    use retrodry_protocol::ErrorCode;
    use retrodry_storage::{InMemoryCoordinationStore, InMemoryDatabase};

    fn dictionary() -> DataDictionary {
        dictionary_with(None)
    }

    fn dictionary_with(validator: Option<ValidatorHook>) -> DataDictionary {
        let mut customer = DatonDef::persiston(
                "Customer",
                TableDef::new("Customer")
                    .sql_table("Customers")
                    .primary_key("CustomerId")
                    .column(ColDef::new("CustomerId", WireType::Int32))
                    .column(ColDef::new("Company", WireType::Text).max_length(20))
                    .column(
                        ColDef::new("CreditLimit", WireType::Decimal)
                            .nullable()
                            .default_permission(PermissionLevel::View)
                            .permission("manager", PermissionLevel::Modify),
                    )
                    .child(
                        TableDef::new("CustomerNote")
                            .sql_table("CustomerNotes")
                            .primary_key("NoteId")
                            .parent_key("CustomerId")
                            .column(ColDef::new("NoteId", WireType::Int32))
                            .column(ColDef::new("CustomerId", WireType::Int32))
                            .column(ColDef::new("Note", WireType::Text)),
                    ),
            );
        if let Some(hook) = validator {
            customer = customer.validator(hook);
        }
        DataDictionary::new().with(customer.build().unwrap())
    }

    struct Fixture {
        db: InMemoryDatabase,
        store: InMemoryCoordinationStore,
        coordinator: Coordinator,
    }

    fn fixture() -> Fixture {
        let db = InMemoryDatabase::new();
        db.create_table("CustomerNotes");
        db.seed(
            "Customers",
            "CustomerId",
            [("Company", Value::from("Acme")), ("CreditLimit", Value::Int(100))],
        );
        let store = InMemoryCoordinationStore::new();
        let coordinator = instance(&db, &store, "a");
        Fixture { db, store, coordinator }
    }

    fn instance(db: &InMemoryDatabase, store: &InMemoryCoordinationStore, name: &str) -> Coordinator {
        Coordinator::new(
            CoordinatorConfig::new(name).with_long_poll_cap(Duration::from_secs(5)),
            Arc::new(dictionary()),
            Arc::new(db.clone()),
            Arc::new(store.clone()),
        )
    }

    fn key() -> DatonKey {
        DatonKey::row("Customer", 1)
    }

    fn edit(coordinator: &Coordinator, session: &str, change: impl FnOnce(&mut Row)) -> Json {
        let visible = coordinator.get_daton(&key(), session).unwrap();
        let mut modified = visible.daton.clone();
        change(modified.main_row_mut().unwrap());
        let delta = diff::diff(&visible.def, &visible.daton, &modified).unwrap();
        diff_to_json(&visible.def, &delta)
    }

    #[test]
    fn get_filters_and_versions() {
        let f = fixture();
        let session = f.coordinator.create_session(&User::new("u"), None).unwrap();
        let first = f.coordinator.get_daton(&key(), &session).unwrap();
        let second = f.coordinator.get_daton(&key(), &session).unwrap();
        assert!(first.daton.version.is_some());
        assert_eq!(first.daton.version, second.daton.version);
        let json = encode_daton(&first.def, &first.daton, Encoding::Verbose);
        assert_eq!(json["Customer"]["Company"], "Acme");

        let err = f.coordinator.get_daton(&DatonKey::row("Customer", 9), &session).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        let err = f.coordinator.get_daton(&key(), "nobody").unwrap_err();
        assert_eq!(err.code(), ErrorCode::AuthError);
    }

    #[test]
    fn locks_are_exclusive_across_instances() {
        let f = fixture();
        let other = instance(&f.db, &f.store, "b");
        let a = f.coordinator.create_session(&User::new("a"), None).unwrap();
        let b = other.create_session(&User::new("b"), None).unwrap();
        f.coordinator.change_lock_state(&key(), &a, SubscribeState::Locked).unwrap();
        let err = other.change_lock_state(&key(), &b, SubscribeState::Locked).unwrap_err();
        assert_eq!(err.code(), ErrorCode::LockConflict);
        other.change_lock_state(&key(), &b, SubscribeState::Subscribed).unwrap();

        f.coordinator.change_lock_state(&key(), &a, SubscribeState::None).unwrap();
        other.change_lock_state(&key(), &b, SubscribeState::Locked).unwrap();
    }

    #[tokio::test]
    async fn save_writes_bumps_version_and_reports_denied_columns() {
        let f = fixture();
        let session = f.coordinator.create_session(&User::new("clerk"), None).unwrap();
        let before = f.coordinator.get_daton(&key(), &session).unwrap().daton.version;
        let json = edit(&f.coordinator, &session, |row| {
            row.set("Company", "Acme Ltd");
            row.set("CreditLimit", 999);
        });
        let saved = f.coordinator.save(&json, &session).await.unwrap();
        assert_eq!(saved.denied, vec!["Customer.CreditLimit".to_string()]);
        let main = saved.content.daton.main_row().unwrap();
        assert_eq!(main.value("Company").as_str(), Some("Acme Ltd"));
        assert_eq!(main.value("CreditLimit"), &Value::Int(100));
        assert_ne!(saved.content.daton.version, before);

        let err = f.coordinator.save(&json, &session).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::VersionConflict);
        assert_eq!(f.store.lock_holder(&key()).unwrap(), None);
    }

    #[tokio::test]
    async fn save_rejects_invalid_and_locked() {
        let f = fixture();
        let a = f.coordinator.create_session(&User::new("a"), None).unwrap();
        let b = f.coordinator.create_session(&User::new("b"), None).unwrap();
        let json = edit(&f.coordinator, &a, |row| row.set("Company", "x".repeat(30)));
        let err = f.coordinator.save(&json, &a).await.unwrap_err();
        assert!(matches!(err, ServerError::Validation(ref errors) if errors.len() == 1));

        f.coordinator.change_lock_state(&key(), &b, SubscribeState::Locked).unwrap();
        let json = edit(&f.coordinator, &a, |row| row.set("Company", "Other"));
        let err = f.coordinator.save(&json, &a).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::LockConflict);
        let rows = f.coordinator.get_daton(&key(), &a).unwrap();
        assert_eq!(rows.daton.main_row().unwrap().value("Company").as_str(), Some("Acme"));
    }

    #[tokio::test]
    async fn new_persistons_get_permanent_keys() {
        let f = fixture();
        let session = f.coordinator.create_session(&User::new("u"), None).unwrap();
        let json = serde_json::json!({
            "Key": "Customer|=-1",
            "Version": null,
            "Customer-new": [{
                "CustomerId": -1,
                "Company": "Newco",
                "CustomerNote-new": [{"Note": "hello"}]
            }]
        });
        let saved = f.coordinator.save(&json, &session).await.unwrap();
        let new_key = saved.new_key.unwrap();
        assert_eq!(new_key, DatonKey::row("Customer", 2));
        let notes = saved.content.daton.main_row().unwrap().child_rows("CustomerNote").to_vec();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].value("CustomerId"), &Value::Int(2));
    }

    #[test]
    fn failed_locking_gets_leave_no_lock() {
        let f = fixture();
        let other = instance(&f.db, &f.store, "b");
        let a = f.coordinator.create_session(&User::new("a"), None).unwrap();
        let b = other.create_session(&User::new("b"), None).unwrap();
        let missing = DatonKey::row("Customer", 999);

        let err = f.coordinator.get_daton_locked(&missing, &a).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(f.store.lock_holder(&missing).unwrap(), None);
        assert_eq!(f.store.mode_of(&missing, &a).unwrap(), None);
        other.change_lock_state(&missing, &b, SubscribeState::Locked).unwrap();

        let missing_after_watch = DatonKey::row("Customer", 998);
        f.coordinator.change_lock_state(&missing_after_watch, &a, SubscribeState::Subscribed).unwrap();
        f.coordinator.get_daton_locked(&missing_after_watch, &a).unwrap_err();
        assert_eq!(f.store.mode_of(&missing_after_watch, &a).unwrap(), Some(SubscribeMode::Watching));
    }

    #[test]
    fn refused_locks_fall_back_to_watching() {
        let f = fixture();
        let a = f.coordinator.create_session(&User::new("a"), None).unwrap();
        let b = f.coordinator.create_session(&User::new("b"), None).unwrap();
        f.coordinator.change_lock_state(&key(), &a, SubscribeState::Locked).unwrap();

        let (visible, lock_error) = f.coordinator.get_daton_locked(&key(), &b).unwrap();
        assert_eq!(visible.daton.main_row().unwrap().value("Company").as_str(), Some("Acme"));
        assert_eq!(lock_error.unwrap().code(), ErrorCode::LockConflict);
        assert_eq!(f.store.mode_of(&key(), &b).unwrap(), Some(SubscribeMode::Watching));
        assert_eq!(f.store.lock_holder(&key()).unwrap(), Some(a.clone()));

        let (_, lock_error) = f.coordinator.get_daton_locked(&key(), &a).unwrap();
        assert!(lock_error.is_none());
    }

    // Moves the version token while the save is validating.
    struct Interloper(InMemoryCoordinationStore);

    #[async_trait]
    impl CustomValidator for Interloper {
        async fn validate(&self, daton: &Daton, _language: &str) -> Vec<FieldError> {
            let current = self.0.version(&daton.key).unwrap();
            assert!(self.0.set_version(&daton.key, current.as_deref(), "elsewhere".into()).unwrap());
            Vec::new()
        }
    }

    #[tokio::test]
    async fn version_moved_mid_save_is_a_conflict() {
        let db = InMemoryDatabase::new();
        db.create_table("CustomerNotes");
        db.seed(
            "Customers",
            "CustomerId",
            [("Company", Value::from("Acme")), ("CreditLimit", Value::Int(100))],
        );
        let store = InMemoryCoordinationStore::new();
        let coordinator = Coordinator::new(
            CoordinatorConfig::new("a"),
            Arc::new(dictionary_with(Some(ValidatorHook::new(Interloper(store.clone()))))),
            Arc::new(db.clone()),
            Arc::new(store.clone()),
        );
        let session = coordinator.create_session(&User::new("u"), None).unwrap();
        coordinator.change_lock_state(&key(), &session, SubscribeState::Locked).unwrap();
        let json = edit(&coordinator, &session, |row| row.set("Company", "Lost"));

        let err = coordinator.save(&json, &session).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::VersionConflict);
        assert_eq!(store.version(&key()).unwrap().as_deref(), Some("elsewhere"));
        let stored = coordinator.get_daton(&key(), &session).unwrap();
        assert_eq!(stored.daton.main_row().unwrap().value("Company").as_str(), Some("Acme"));
    }

    #[tokio::test]
    async fn storage_failures_are_sanitized() {
        let f = fixture();
        let session = f.coordinator.create_session(&User::new("u"), None).unwrap();
        let json = edit(&f.coordinator, &session, |row| row.set("Company", "Boom"));
        f.db.fail_next_commit("deadlock on page 7 of Customers");
        let err = f.coordinator.save(&json, &session).await.unwrap_err();
        let item = f.coordinator.item_error(&err);
        assert_eq!(item.code, ErrorCode::StorageFailure);
        assert!(!item.message.contains("Customers"));

        let retried = f.coordinator.save(&json, &session).await.unwrap();
        assert_eq!(retried.content.daton.main_row().unwrap().value("Company").as_str(), Some("Boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_times_out_empty() {
        let f = fixture();
        let session = f.coordinator.create_session(&User::new("u"), None).unwrap();
        f.coordinator.change_lock_state(&key(), &session, SubscribeState::Subscribed).unwrap();
        let updates = f.coordinator.long_poll(&session, Duration::from_secs(2)).await.unwrap();
        assert!(updates.is_empty());
        assert_eq!(f.coordinator.waiter_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_polls_share_one_waiter() {
        let f = Arc::new(fixture());
        let session = f.coordinator.create_session(&User::new("u"), None).unwrap();
        let long = {
            let f = Arc::clone(&f);
            let session = session.clone();
            tokio::spawn(async move { f.coordinator.long_poll(&session, Duration::from_secs(4)).await })
        };
        tokio::task::yield_now().await;
        let short = f.coordinator.long_poll(&session, Duration::from_secs(1)).await.unwrap();
        assert!(short.is_empty());
        assert_eq!(f.coordinator.waiter_count(), 1);
        assert!(long.await.unwrap().unwrap().is_empty());
        assert_eq!(f.coordinator.waiter_count(), 0);
    }

    #[tokio::test]
    async fn long_poll_delivers_other_sessions_saves() {
        let f = Arc::new(fixture());
        let watcher = f.coordinator.create_session(&User::new("w"), None).unwrap();
        let editor = f.coordinator.create_session(&User::new("e"), None).unwrap();
        f.coordinator.change_lock_state(&key(), &watcher, SubscribeState::Subscribed).unwrap();

        let poll = {
            let f = Arc::clone(&f);
            let watcher = watcher.clone();
            tokio::spawn(async move { f.coordinator.long_poll(&watcher, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        let json = edit(&f.coordinator, &editor, |row| row.set("Company", "Pushed"));
        f.coordinator.save(&json, &editor).await.unwrap();

        let updates = poll.await.unwrap().unwrap();
        assert_eq!(updates.len(), 1);
        let main = updates[0].daton.main_row().unwrap();
        assert_eq!(main.value("Company").as_str(), Some("Pushed"));
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribed_sessions_hear_nothing() {
        let f = fixture();
        let bystander = f.coordinator.create_session(&User::new("b"), None).unwrap();
        let editor = f.coordinator.create_session(&User::new("e"), None).unwrap();
        f.coordinator.get_daton(&key(), &bystander).unwrap();

        let json = edit(&f.coordinator, &editor, |row| row.set("Company", "Quiet"));
        f.coordinator.save(&json, &editor).await.unwrap();
        let updates = f.coordinator.long_poll(&bystander, Duration::from_secs(1)).await.unwrap();
        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn quit_releases_locks_and_ends_long_poll() {
        let f = Arc::new(fixture());
        let session = f.coordinator.create_session(&User::new("u"), None).unwrap();
        f.coordinator.change_lock_state(&key(), &session, SubscribeState::Locked).unwrap();
        let poll = {
            let f = Arc::clone(&f);
            let session = session.clone();
            tokio::spawn(async move { f.coordinator.long_poll(&session, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert!(f.coordinator.quit(&session).unwrap());
        assert!(poll.await.unwrap().is_err());
        assert_eq!(f.store.lock_holder(&key()).unwrap(), None);
        assert!(!f.coordinator.quit(&session).unwrap());
    }

    #[test]
    fn reaper_ends_idle_sessions() {
        let db = InMemoryDatabase::new();
        let store = InMemoryCoordinationStore::new();
        let coordinator = Coordinator::new(
            CoordinatorConfig::default().with_session_idle_timeout(Duration::ZERO),
            Arc::new(dictionary()),
            Arc::new(db),
            Arc::new(store.clone()),
        );
        let session = coordinator.create_session(&User::new("u"), None).unwrap();
        store.try_lock(&key(), &session).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(coordinator.reap_idle().unwrap(), vec![session]);
        assert_eq!(store.lock_holder(&key()).unwrap(), None);
    }

    #[test]
    fn pump_notices_foreign_changes() {
        let f = fixture();
        let other = instance(&f.db, &f.store, "b");
        assert!(!f.coordinator.pump_changes().unwrap());
        let session = other.create_session(&User::new("u"), None).unwrap();
        other.quit(&session).unwrap();
        assert!(f.coordinator.pump_changes().unwrap());
        assert!(!f.coordinator.pump_changes().unwrap());
    }
}
