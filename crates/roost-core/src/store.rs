// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Namespace store: the path → entry mapping
//!
//! Entries are created lazily with `exists = false` and deleted logically:
//! content cleared, instance bumped, the map slot retained so the path can
//! be recreated under a fresh instance number. All entry state sits behind
//! one per-entry mutex; the store-level lock covers only the brief
//! "if absent, construct" step.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex};

use serde::{Deserialize, Serialize};

use crate::types::{HandleId, SessionId};

/// Mutable state of one namespace entry, guarded by `Entry::state`
#[derive(Debug)]
pub struct EntryState {
    /// Distinguishes "never created" and "deleted but retained" from live.
    pub exists: bool,
    pub is_directory: bool,
    pub is_ephemeral: bool,
    /// Monotonic generation, bumped on logical delete. A handle whose
    /// captured instance no longer matches is stale.
    pub instance: i64,
    /// Opaque bytes; for directories, a NUL-separated child-name list.
    pub content: Vec<u8>,
    pub content_gen: u64,
    pub lock_owners: HashSet<SessionId>,
    /// Meaningful only while `lock_owners` is non-empty.
    pub exclusive: bool,
    pub lock_gen: u64,
    /// Sessions watching this entry, by the handle they watch through.
    /// Sessions are referenced by id only and pruned lazily at notify time.
    pub subscribers: HashMap<SessionId, HandleId>,
}

impl EntryState {
    fn new() -> Self {
        Self {
            exists: false,
            is_directory: false,
            is_ephemeral: false,
            instance: 0,
            content: Vec::new(),
            content_gen: 0,
            lock_owners: HashSet::new(),
            exclusive: false,
            lock_gen: 0,
            subscribers: HashMap::new(),
        }
    }
}

/// One namespace entry: state plus the condvar lock waiters park on
pub struct Entry {
    pub(crate) state: Mutex<EntryState>,
    pub(crate) lock_cv: Condvar,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: Mutex::new(EntryState::new()),
            lock_cv: Condvar::new(),
        }
    }

    /// Run `f` under the entry lock.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut EntryState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    /// Wake every parked lock waiter. A released exclusive lock may admit
    /// many shared readers at once, so a single wake would starve them.
    pub fn wake_lock_waiters(&self) {
        self.lock_cv.notify_all();
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        self.with_state(|st| EntrySnapshot {
            exists: st.exists,
            is_directory: st.is_directory,
            is_ephemeral: st.is_ephemeral,
            instance: st.instance,
            content: st.content.clone(),
            content_gen: st.content_gen,
            lock_owners: st.lock_owners.iter().map(|s| s.0).collect(),
            exclusive: st.exclusive,
            lock_gen: st.lock_gen,
            subscribers: st.subscribers.iter().map(|(s, h)| (s.0, h.0)).collect(),
        })
    }
}

/// Serialized form of one entry, ordered collections for determinism
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntrySnapshot {
    pub exists: bool,
    pub is_directory: bool,
    pub is_ephemeral: bool,
    pub instance: i64,
    pub content: Vec<u8>,
    pub content_gen: u64,
    pub lock_owners: BTreeSet<u64>,
    pub exclusive: bool,
    pub lock_gen: u64,
    pub subscribers: BTreeMap<u64, u32>,
}

/// The namespace store. Owns every entry; nothing else holds entry
/// references across operations — sessions record only path strings and
/// generation numbers.
pub struct NamespaceStore {
    entries: Mutex<HashMap<String, Arc<Entry>>>,
}

impl Default for NamespaceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceStore {
    /// Create a store with the root directory in place.
    pub fn new() -> Self {
        let root = Arc::new(Entry::new());
        root.with_state(|st| {
            st.exists = true;
            st.is_directory = true;
        });
        let mut entries = HashMap::new();
        entries.insert("/".to_string(), root);
        Self {
            entries: Mutex::new(entries),
        }
    }

    pub fn get(&self, path: &str) -> Option<Arc<Entry>> {
        self.entries.lock().unwrap().get(path).cloned()
    }

    pub fn get_or_create(&self, path: &str) -> Arc<Entry> {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Entry::new()))
            .clone()
    }

    /// Add `name` to the child list of `parent`.
    ///
    /// The parent must exist and be a directory; anything else means the
    /// replicas have diverged (a prior open of the parent did not apply
    /// identically everywhere) and the replica must not continue.
    pub fn link_child(&self, parent: &str, name: &str) {
        let entry = self
            .get(parent)
            .unwrap_or_else(|| panic!("invariant violation: parent {parent} missing"));
        entry.with_state(|st| {
            if !st.exists {
                panic!("invariant violation: parent {parent} does not exist");
            }
            if !st.is_directory {
                panic!("invariant violation: parent {parent} is not a directory");
            }
            st.content.extend_from_slice(&child_token(name));
        });
    }

    /// Remove the first `\0name` token from the parent's child list.
    /// A missing token is a no-op, tolerating double-delete races.
    pub fn unlink_child(&self, parent: &str, name: &str) {
        let Some(entry) = self.get(parent) else {
            return;
        };
        let token = child_token(name);
        entry.with_state(|st| {
            if let Some(pos) = find_token(&st.content, &token) {
                st.content.drain(pos..pos + token.len());
            }
        });
    }

    /// Replace the whole namespace with a snapshot, as part of installing
    /// a consensus snapshot on a lagging replica.
    pub fn restore(&self, snapshot: BTreeMap<String, EntrySnapshot>) {
        let mut entries = self.entries.lock().unwrap();
        entries.clear();
        for (path, snap) in snapshot {
            let entry = Arc::new(Entry::new());
            entry.with_state(|st| {
                st.exists = snap.exists;
                st.is_directory = snap.is_directory;
                st.is_ephemeral = snap.is_ephemeral;
                st.instance = snap.instance;
                st.content = snap.content.clone();
                st.content_gen = snap.content_gen;
                st.lock_owners = snap.lock_owners.iter().map(|s| SessionId(*s)).collect();
                st.exclusive = snap.exclusive;
                st.lock_gen = snap.lock_gen;
                st.subscribers = snap
                    .subscribers
                    .iter()
                    .map(|(s, h)| (SessionId(*s), HandleId(*h)))
                    .collect();
            });
            entries.insert(path, entry);
        }
    }

    /// Serialized namespace, keyed and ordered by path.
    pub fn snapshot(&self) -> BTreeMap<String, EntrySnapshot> {
        let entries = self.entries.lock().unwrap();
        entries
            .iter()
            .map(|(path, entry)| (path.clone(), entry.snapshot()))
            .collect()
    }
}

/// Split an absolute path into (parent, basename); `None` for the root.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    if path == "/" {
        return None;
    }
    let idx = path.rfind('/')?;
    let parent = if idx == 0 { "/" } else { &path[..idx] };
    Some((parent, &path[idx + 1..]))
}

fn child_token(name: &str) -> Vec<u8> {
    let mut token = Vec::with_capacity(name.len() + 1);
    token.push(0);
    token.extend_from_slice(name.as_bytes());
    token
}

fn find_token(content: &[u8], token: &[u8]) -> Option<usize> {
    content
        .windows(token.len())
        .position(|window| window == token)
}
