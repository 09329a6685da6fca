//! Process registry: one CLI process may serve several clients.
//!
//! Entries are keyed by `(working directory, session id)`. Before the init
//! event supplies the real session id, entries live under a tentative
//! `pending-<unix millis>` key and are rekeyed in place. A process dies
//! when its last subscriber leaves; `remove` detaches an entry without
//! killing, which is how a takeover lets the session roam elsewhere.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::{debug, info};

use tgcc_core::types::ClientKey;

use crate::process::CliProcess;

pub type EntryKey = (PathBuf, String);

/// One registered process plus its subscriber set.
///
/// `S` is the per-subscriber renderer slot (accumulator + tracker); the
/// registry itself only manages lifecycle.
pub struct Entry<S> {
    pub process: CliProcess,
    pub owner: ClientKey,
    pub model: Option<String>,
    subscribers: HashMap<ClientKey, S>,
}

impl<S> Entry<S> {
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = (&ClientKey, &S)> {
        self.subscribers.iter()
    }

    pub fn slot_mut(&mut self, client: &ClientKey) -> Option<&mut S> {
        self.subscribers.get_mut(client)
    }
}

pub struct ProcessRegistry<S> {
    entries: DashMap<EntryKey, Entry<S>>,
    by_client: DashMap<ClientKey, EntryKey>,
}

impl<S> Default for ProcessRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ProcessRegistry<S> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            by_client: DashMap::new(),
        }
    }

    /// Tentative key for a process whose init has not arrived yet.
    pub fn pending_key(repo: &PathBuf) -> EntryKey {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        (repo.clone(), format!("pending-{millis}"))
    }

    /// Register a process under `key` with its owning client subscribed.
    pub fn register(
        &self,
        key: EntryKey,
        model: Option<String>,
        process: CliProcess,
        owner: ClientKey,
        owner_slot: S,
    ) {
        let mut subscribers = HashMap::new();
        subscribers.insert(owner.clone(), owner_slot);
        self.by_client.insert(owner.clone(), key.clone());
        info!(repo = %key.0.display(), session = %key.1, owner = %owner, "registering CLI process");
        self.entries.insert(
            key,
            Entry {
                process,
                owner,
                model,
                subscribers,
            },
        );
    }

    /// Add a subscriber to an existing entry. Returns false when the key
    /// is unknown.
    pub fn subscribe(&self, key: &EntryKey, client: ClientKey, slot: S) -> bool {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.subscribers.insert(client.clone(), slot);
        self.by_client.insert(client, key.clone());
        true
    }

    /// Drop a subscriber; destroy the process when it was the last one.
    /// Returns the removed slot and whether the process was destroyed.
    pub fn unsubscribe(&self, client: &ClientKey) -> (Option<S>, bool) {
        let Some((_, key)) = self.by_client.remove(client) else {
            return (None, false);
        };
        let Some(mut entry) = self.entries.get_mut(&key) else {
            return (None, false);
        };
        let slot = entry.subscribers.remove(client);
        let last = entry.subscribers.is_empty();
        drop(entry);

        if last {
            info!(session = %key.1, "last subscriber left, destroying CLI process");
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.process.destroy();
            }
        }
        (slot, last)
    }

    pub fn find_by_client(&self, client: &ClientKey) -> Option<EntryKey> {
        self.by_client.get(client).map(|k| k.clone())
    }

    /// Locate the entry for a live process by its session id.
    pub fn find_by_session(&self, session_id: &str) -> Option<EntryKey> {
        self.entries
            .iter()
            .find(|e| e.key().1 == session_id)
            .map(|e| e.key().clone())
    }

    /// Locate the entry holding exactly this process handle.
    pub fn find_by_process(&self, process: &CliProcess) -> Option<EntryKey> {
        self.entries
            .iter()
            .find(|e| e.process.same_as(process))
            .map(|e| e.key().clone())
    }

    pub fn process(&self, key: &EntryKey) -> Option<CliProcess> {
        self.entries.get(key).map(|e| e.process.clone())
    }

    pub fn with_entry<R>(&self, key: &EntryKey, f: impl FnOnce(&mut Entry<S>) -> R) -> Option<R> {
        self.entries.get_mut(key).map(|mut e| f(&mut e))
    }

    /// Kill the process and drop the entry and every client mapping.
    pub fn destroy(&self, key: &EntryKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            entry.process.destroy();
            for client in entry.subscribers.keys() {
                self.by_client.remove(client);
            }
        }
    }

    /// Drop the entry without terminating the process (takeover path).
    pub fn remove(&self, key: &EntryKey) {
        if let Some((_, entry)) = self.entries.remove(key) {
            debug!(session = %key.1, "detaching CLI process from registry");
            for client in entry.subscribers.keys() {
                self.by_client.remove(client);
            }
        }
    }

    /// Replace a tentative pre-init key with the real session id.
    ///
    /// If the real key already exists the stale entry is dropped (without
    /// killing — the live entry owns the process now).
    pub fn rekey(&self, old: &EntryKey, session_id: &str) {
        let new_key = (old.0.clone(), session_id.to_string());
        if new_key == *old {
            return;
        }
        if self.entries.contains_key(&new_key) {
            debug!(session = session_id, "rekey target already present, dropping stale entry");
            self.remove(old);
            return;
        }
        if let Some((_, entry)) = self.entries.remove(old) {
            for client in entry.subscribers.keys() {
                self.by_client.insert(client.clone(), new_key.clone());
            }
            info!(old = %old.1, new = %new_key.1, "rekeying CLI process");
            self.entries.insert(new_key, entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of every entry key (for shutdown).
    pub fn keys(&self) -> Vec<EntryKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SpawnOptions;
    use tgcc_core::types::AgentId;

    fn client(user: i64) -> ClientKey {
        ClientKey {
            agent_id: AgentId::new("main"),
            user_id: user,
            chat_id: user * 10,
        }
    }

    fn idle_process() -> CliProcess {
        // Never spawned in these tests; kill() on an idle process is a no-op.
        CliProcess::new(SpawnOptions::new("true", "/tmp"))
    }

    fn registry() -> ProcessRegistry<String> {
        ProcessRegistry::new()
    }

    #[test]
    fn register_and_find_by_client() {
        let reg = registry();
        let key = (PathBuf::from("/srv/work"), "sess-1".to_string());
        reg.register(key.clone(), None, idle_process(), client(1), "slot-1".into());

        assert_eq!(reg.find_by_client(&client(1)), Some(key.clone()));
        assert_eq!(reg.find_by_session("sess-1"), Some(key));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn destroy_on_last_unsubscribe_only() {
        let reg = registry();
        let key = (PathBuf::from("/srv/work"), "sess-1".to_string());
        reg.register(key.clone(), None, idle_process(), client(1), "a".into());
        assert!(reg.subscribe(&key, client(2), "b".into()));

        let (slot, destroyed) = reg.unsubscribe(&client(1));
        assert_eq!(slot.as_deref(), Some("a"));
        assert!(!destroyed, "one subscriber remains");
        assert_eq!(reg.len(), 1);

        let (slot, destroyed) = reg.unsubscribe(&client(2));
        assert_eq!(slot.as_deref(), Some("b"));
        assert!(destroyed, "last subscriber removes the entry");
        assert!(reg.is_empty());
        assert_eq!(reg.find_by_client(&client(2)), None);
    }

    #[test]
    fn rekey_replaces_pending_id() {
        let reg = registry();
        let repo = PathBuf::from("/srv/work");
        let pending = ProcessRegistry::<String>::pending_key(&repo);
        assert!(pending.1.starts_with("pending-"));

        reg.register(pending.clone(), None, idle_process(), client(1), "a".into());
        reg.rekey(&pending, "real-session");

        let real = (repo, "real-session".to_string());
        assert_eq!(reg.find_by_session("real-session"), Some(real.clone()));
        assert_eq!(reg.find_by_client(&client(1)), Some(real));
        assert_eq!(reg.find_by_session(&pending.1), None);
    }

    #[test]
    fn rekey_collision_drops_stale_entry() {
        let reg = registry();
        let repo = PathBuf::from("/srv/work");
        let live = (repo.clone(), "sess-x".to_string());
        reg.register(live.clone(), None, idle_process(), client(1), "live".into());

        let stale = (repo, "pending-123".to_string());
        reg.register(stale.clone(), None, idle_process(), client(2), "stale".into());

        reg.rekey(&stale, "sess-x");
        assert_eq!(reg.len(), 1);
        assert_eq!(
            reg.with_entry(&live, |e| e.subscriber_count()),
            Some(1),
            "live entry untouched"
        );
    }

    #[test]
    fn remove_detaches_without_clearing_other_entries() {
        let reg = registry();
        let key = (PathBuf::from("/srv/work"), "sess-1".to_string());
        reg.register(key.clone(), None, idle_process(), client(1), "a".into());

        reg.remove(&key);
        assert!(reg.is_empty());
        assert_eq!(reg.find_by_client(&client(1)), None);
    }
}
