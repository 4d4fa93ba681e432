//! The session's daton cache.

use retrodry_core::{Daton, DatonKey};
use retrodry_protocol::SubscribeState;
use std::collections::HashMap;

/// One cached daton.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Content as last seen from the server.
    pub pristine: Daton,
    /// This session's subscribe state for the key.
    pub state: SubscribeState,
}

/// Pristine copies of every daton the session knows, by key.
///
/// The cache itself does no locking; the session guards every
/// read-then-write sequence with its [`FifoMutex`](crate::FifoMutex).
#[derive(Debug, Default)]
pub struct DatonCache {
    entries: HashMap<DatonKey, CacheEntry>,
}

impl DatonCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an entry.
    pub fn get(&self, key: &DatonKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    /// Subscribe state of a key; `None` when not cached.
    pub fn state(&self, key: &DatonKey) -> SubscribeState {
        self.entries.get(key).map_or(SubscribeState::None, |e| e.state)
    }

    /// Stores fresh content, keeping the current subscribe state.
    pub fn store(&mut self, daton: Daton) {
        let key = daton.key.clone();
        match self.entries.get_mut(&key) {
            Some(entry) => entry.pristine = daton,
            None => {
                self.entries.insert(
                    key,
                    CacheEntry {
                        pristine: daton,
                        state: SubscribeState::None,
                    },
                );
            }
        }
    }

    /// Sets the subscribe state of a cached key; `None` evicts it.
    ///
    /// Returns false if the key is not cached.
    pub fn set_state(&mut self, key: &DatonKey, state: SubscribeState) -> bool {
        if state == SubscribeState::None {
            return self.entries.remove(key).is_some();
        }
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    /// Replaces the entry stored under `old` with `daton`, filed under its own key.
    ///
    /// Used when a new persiston gets its permanent key.
    pub fn rekey(&mut self, old: &DatonKey, daton: Daton) {
        let state = self.entries.remove(old).map_or(SubscribeState::None, |e| e.state);
        self.entries.insert(
            daton.key.clone(),
            CacheEntry {
                pristine: daton,
                state,
            },
        );
    }

    /// Merges content pushed by the server.
    ///
    /// Only cached entries that this session does not hold locked are
    /// replaced; a locked entry's local edits take precedence. Returns true
    /// if the entry was updated.
    pub fn merge_push(&mut self, daton: Daton) -> bool {
        match self.entries.get_mut(&daton.key) {
            Some(entry) if entry.state != SubscribeState::Locked => {
                entry.pristine = daton;
                true
            }
            _ => false,
        }
    }

    /// Keys currently locked by this session.
    pub fn locked_keys(&self) -> Vec<DatonKey> {
        self.keys_in(SubscribeState::Locked)
    }

    /// Keys in a given state.
    pub fn keys_in(&self, state: SubscribeState) -> Vec<DatonKey> {
        let mut keys: Vec<DatonKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Number of cached datons.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrodry_core::Row;

    fn widget(notes: &str) -> Daton {
        Daton::new(
            DatonKey::row("Widget", 9),
            vec![Row::new().with("WidgetId", 9).with("Notes", notes)],
        )
    }

    #[test]
    fn pushes_skip_locked_entries() {
        let mut cache = DatonCache::new();
        assert!(!cache.merge_push(widget("pushed")));
        cache.store(widget("mine"));
        assert!(cache.set_state(&DatonKey::row("Widget", 9), SubscribeState::Locked));
        assert!(!cache.merge_push(widget("pushed")));
        assert_eq!(cache.locked_keys(), vec![DatonKey::row("Widget", 9)]);

        cache.set_state(&DatonKey::row("Widget", 9), SubscribeState::Subscribed);
        assert!(cache.merge_push(widget("pushed")));
        let entry = cache.get(&DatonKey::row("Widget", 9)).unwrap();
        assert_eq!(entry.pristine.main_row().unwrap().value("Notes").as_str(), Some("pushed"));
    }

    #[test]
    fn none_evicts_and_rekey_keeps_state() {
        let mut cache = DatonCache::new();
        let new_key = DatonKey::row("Widget", -1);
        cache.store(Daton::new(new_key.clone(), vec![]));
        cache.set_state(&new_key, SubscribeState::Subscribed);
        cache.rekey(&new_key, widget("saved"));
        assert!(cache.get(&new_key).is_none());
        assert_eq!(cache.state(&DatonKey::row("Widget", 9)), SubscribeState::Subscribed);

        assert!(cache.set_state(&DatonKey::row("Widget", 9), SubscribeState::None));
        assert!(cache.is_empty());
    }
}
