// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session table and per-session handle bookkeeping

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::channel::WatchChannel;
use crate::config::CoreConfig;
use crate::types::{HandleId, SessionId, TOMBSTONE_INSTANCE};

/// One open-handle slot: the path and the entry instance captured at open
/// time. `instance == TOMBSTONE_INSTANCE` marks a closed handle; the slot
/// is retained so handle indices stay dense and are never reused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleSlot {
    pub path: String,
    pub instance: i64,
}

impl HandleSlot {
    pub fn is_closed(&self) -> bool {
        self.instance == TOMBSTONE_INSTANCE
    }
}

/// One client session: handle table plus its single keepalive channel
pub struct Session {
    pub id: SessionId,
    handles: Mutex<Vec<HandleSlot>>,
    pub channel: Arc<WatchChannel>,
}

impl Session {
    fn new(id: SessionId, config: &CoreConfig) -> Self {
        Self {
            id,
            handles: Mutex::new(Vec::new()),
            channel: Arc::new(WatchChannel::new(config)),
        }
    }

    /// Append a new handle, returning its index.
    pub fn add_handle(&self, path: &str, instance: i64) -> HandleId {
        let mut handles = self.handles.lock().unwrap();
        handles.push(HandleSlot {
            path: path.to_string(),
            instance,
        });
        HandleId((handles.len() - 1) as u32)
    }

    pub fn handle(&self, fh: HandleId) -> Option<HandleSlot> {
        self.handles.lock().unwrap().get(fh.0 as usize).cloned()
    }

    /// Tombstone a handle. Returns the slot as it was when still open;
    /// `None` for an unknown or already-closed handle.
    pub fn close_handle(&self, fh: HandleId) -> Option<HandleSlot> {
        let mut handles = self.handles.lock().unwrap();
        let slot = handles.get_mut(fh.0 as usize)?;
        if slot.is_closed() {
            return None;
        }
        let open = slot.clone();
        slot.instance = TOMBSTONE_INSTANCE;
        Some(open)
    }

    pub fn handle_count(&self) -> u32 {
        self.handles.lock().unwrap().len() as u32
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.0,
            handles: self.handles.lock().unwrap().clone(),
        }
    }
}

/// Serialized form of one session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: u64,
    pub handles: Vec<HandleSlot>,
}

/// Serialized form of the whole table
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTableSnapshot {
    pub next_id: u64,
    pub sessions: BTreeMap<u64, SessionSnapshot>,
}

struct TableState {
    next_id: u64,
    sessions: HashMap<SessionId, Arc<Session>>,
}

/// The session table. One table-level lock serializes create/find/delete
/// against enumeration during leadership handover; the id counter lives
/// under the same lock.
pub struct SessionTable {
    config: CoreConfig,
    inner: Mutex<TableState>,
}

impl SessionTable {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(TableState {
                next_id: 0,
                sessions: HashMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn create(&self) -> Arc<Session> {
        let mut inner = self.inner.lock().unwrap();
        let id = SessionId(inner.next_id);
        inner.next_id += 1;
        let session = Arc::new(Session::new(id, &self.config));
        inner.sessions.insert(id, session.clone());
        session
    }

    /// Absence is a first-class result: sessions can expire between a
    /// client's request and its processing.
    pub fn find(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().sessions.get(&id).cloned()
    }

    pub fn delete(&self, id: SessionId) -> Option<Arc<Session>> {
        self.inner.lock().unwrap().sessions.remove(&id)
    }

    /// Every live session, for leadership handover: a new leader arms the
    /// liveness timer of each session it inherited from the log or a
    /// snapshot.
    pub fn all(&self) -> Vec<Arc<Session>> {
        self.inner.lock().unwrap().sessions.values().cloned().collect()
    }

    /// Replace the whole table with a snapshot. Restored sessions get
    /// fresh, unarmed channels; delivery state is leader-local and is not
    /// part of replicated state.
    pub fn restore(&self, snapshot: SessionTableSnapshot) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id = snapshot.next_id;
        inner.sessions = snapshot
            .sessions
            .into_iter()
            .map(|(id, snap)| {
                let session = Arc::new(Session::new(SessionId(id), &self.config));
                *session.handles.lock().unwrap() = snap.handles;
                (SessionId(id), session)
            })
            .collect();
    }

    pub fn snapshot(&self) -> SessionTableSnapshot {
        let inner = self.inner.lock().unwrap();
        SessionTableSnapshot {
            next_id: inner.next_id,
            sessions: inner
                .sessions
                .iter()
                .map(|(id, session)| (id.0, session.snapshot()))
                .collect(),
        }
    }
}
