// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The replicated state machine
//!
//! `commit` is the single entry point the consensus collaborator drives, in
//! log order, one record at a time. Every handler is deterministic given
//! the current state and the action: no clock reads, no randomness, no
//! blocking. The waits the protocol needs (lock admission, notify/ack
//! barriers) happen in the coordinator after the commit result returns, so
//! the apply loop never stalls and replicas converge.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use roost_proto::{
    codes, Action, CloseResponse, DeleteResponse, EndSessionResponse, OpenResponse, Response,
    StartSessionResponse, StatusResponse,
};

use crate::lock::{self, Acquisition, ReleaseOutcome};
use crate::session::{HandleSlot, Session, SessionTable, SessionTableSnapshot};
use crate::store::{split_path, EntrySnapshot, EntryState, NamespaceStore};
use crate::types::{HandleId, LockMode, SessionId};

/// Full serialized machine state: what the collaborator's snapshotting
/// mechanism captures, and what the determinism tests compare.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub namespace: BTreeMap<String, EntrySnapshot>,
    pub sessions: SessionTableSnapshot,
}

pub struct StateMachine {
    store: Arc<NamespaceStore>,
    sessions: Arc<SessionTable>,
}

impl StateMachine {
    pub fn new(store: Arc<NamespaceStore>, sessions: Arc<SessionTable>) -> Self {
        Self { store, sessions }
    }

    /// Apply one committed record and return the serialized response.
    ///
    /// A record that does not decode can only mean log corruption or a
    /// divergent writer; continuing would corrupt consistency.
    pub fn commit(&self, log_idx: u64, record: &[u8]) -> Vec<u8> {
        let action = Action::decode(record)
            .unwrap_or_else(|err| panic!("malformed log record at index {log_idx}: {err}"));
        if let Err(err) = roost_proto::validate_action(&action) {
            panic!("invalid committed record at index {log_idx}: {err}");
        }
        tracing::debug!(log_idx, "applying committed record");
        self.apply(action).encode()
    }

    pub fn apply(&self, action: Action) -> Response {
        match action {
            Action::StartSession => self.apply_start_session(),
            Action::EndSession(req) => self.apply_end_session(SessionId(req.session_id)),
            Action::Open(req) => self.apply_open(req),
            Action::Close(req) => self.apply_close(SessionId(req.session_id), HandleId(req.fh)),
            Action::SetContent(req) => self.apply_set_content(req),
            Action::Acquire(req) => self.apply_acquire(req),
            Action::Release(req) => self.apply_release(SessionId(req.session_id), HandleId(req.fh)),
            Action::Delete(req) => self.apply_delete(SessionId(req.session_id), HandleId(req.fh)),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            namespace: self.store.snapshot(),
            sessions: self.sessions.snapshot(),
        }
    }

    pub fn snapshot_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.snapshot()).expect("snapshot serialization cannot fail")
    }

    /// Install a snapshot, replacing all current state.
    pub fn restore(&self, snapshot: StateSnapshot) {
        self.store.restore(snapshot.namespace);
        self.sessions.restore(snapshot.sessions);
    }

    pub fn restore_bytes(&self, bytes: &[u8]) -> Result<(), roost_proto::WireError> {
        let snapshot: StateSnapshot = serde_json::from_slice(bytes)?;
        self.restore(snapshot);
        Ok(())
    }

    fn apply_start_session(&self) -> Response {
        let session = self.sessions.create();
        tracing::debug!(session = %session.id, "session started");
        Response::StartSession(StartSessionResponse {
            code: codes::OK,
            message: String::new(),
            session_id: session.id.0,
        })
    }

    fn apply_end_session(&self, id: SessionId) -> Response {
        let Some(session) = self.sessions.find(id) else {
            return Response::EndSession(EndSessionResponse {
                code: codes::NO_SUCH_SESSION,
                message: "no such session".to_string(),
                affected_parents: Vec::new(),
                watchers: Vec::new(),
            });
        };
        let mut parents = std::collections::BTreeSet::new();
        let mut watchers = Vec::new();
        for index in 0..session.handle_count() {
            let fh = HandleId(index);
            if let Some(slot) = session.close_handle(fh) {
                let (parent, w) = self.cleanup_handle(&session, fh, &slot);
                parents.extend(parent);
                watchers.extend(w);
            }
        }
        if let Some(removed) = self.sessions.delete(id) {
            removed.channel.close();
        }
        tracing::debug!(session = %id, "session ended");
        Response::EndSession(EndSessionResponse {
            code: codes::OK,
            message: String::new(),
            affected_parents: parents.into_iter().collect(),
            watchers,
        })
    }

    fn apply_open(&self, req: roost_proto::OpenRequest) -> Response {
        let failed = |code: i32, message: &str| {
            Response::Open(OpenResponse {
                code,
                message: message.to_string(),
                fh: 0,
                affected_parent: None,
            })
        };
        let Some(session) = self.sessions.find(SessionId(req.session_id)) else {
            return failed(codes::NO_SUCH_SESSION, "no such session");
        };
        let entry = self.store.get_or_create(&req.path);
        let materialized = entry.with_state(|st| {
            if st.exists {
                return false;
            }
            st.is_directory = req.directory;
            st.is_ephemeral = req.ephemeral;
            true
        });
        let mut affected_parent = None;
        if materialized {
            if let Some((parent, name)) = split_path(&req.path) {
                // Fatal if the parent is missing or not a directory: a
                // prior open of the parent did not apply identically on
                // every replica.
                self.store.link_child(parent, name);
                affected_parent = Some(parent.to_string());
            }
        }
        let instance = entry.with_state(|st| {
            st.exists = true;
            st.instance
        });
        let fh = session.add_handle(&req.path, instance);
        entry.with_state(|st| {
            st.subscribers.insert(session.id, fh);
        });
        tracing::debug!(session = %session.id, path = %req.path, fh = %fh, "opened");
        Response::Open(OpenResponse {
            code: codes::OK,
            message: String::new(),
            fh: fh.0,
            affected_parent,
        })
    }

    fn apply_close(&self, session_id: SessionId, fh: HandleId) -> Response {
        let failed = |code: i32, message: &str| {
            Response::Close(CloseResponse {
                code,
                message: message.to_string(),
                affected_parent: None,
                watchers: Vec::new(),
            })
        };
        let Some(session) = self.sessions.find(session_id) else {
            return failed(codes::NO_SUCH_SESSION, "no such session");
        };
        match session.handle(fh) {
            None => return failed(codes::BAD_HANDLE, "unknown handle"),
            Some(slot) if slot.is_closed() => {
                // Already closed: a no-op, not an error
                return Response::Close(CloseResponse {
                    code: codes::OK,
                    message: String::new(),
                    affected_parent: None,
                    watchers: Vec::new(),
                });
            }
            Some(_) => {}
        }
        let slot = session.close_handle(fh).expect("handle checked open above");
        let (affected_parent, watchers) = self.cleanup_handle(&session, fh, &slot);
        tracing::debug!(session = %session_id, fh = %fh, "closed");
        Response::Close(CloseResponse {
            code: codes::OK,
            message: String::new(),
            affected_parent,
            watchers,
        })
    }

    fn apply_set_content(&self, req: roost_proto::SetContentRequest) -> Response {
        let Some(session) = self.sessions.find(SessionId(req.session_id)) else {
            return Response::Status(StatusResponse::failed(
                codes::NO_SUCH_SESSION,
                "no such session",
            ));
        };
        let Some(slot) = session.handle(HandleId(req.fh)) else {
            return Response::Status(StatusResponse::failed(codes::BAD_HANDLE, "unknown handle"));
        };
        let Some(entry) = self.store.get(&slot.path) else {
            return Response::Status(StatusResponse::failed(
                codes::NO_SUCH_FILE,
                "file does not exist",
            ));
        };
        let content = req.content;
        entry.with_state(|st| {
            if !st.exists {
                return Response::Status(StatusResponse::failed(
                    codes::NO_SUCH_FILE,
                    "file does not exist",
                ));
            }
            if st.instance != slot.instance {
                return Response::Status(StatusResponse::failed(
                    codes::STALE_HANDLE,
                    "instance number mismatch",
                ));
            }
            st.content = content;
            st.content_gen += 1;
            Response::Status(StatusResponse::ok())
        })
    }

    fn apply_acquire(&self, req: roost_proto::AcquireRequest) -> Response {
        let mode = if req.exclusive {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        let Some(session) = self.sessions.find(SessionId(req.session_id)) else {
            return Response::Status(StatusResponse::failed(
                codes::NO_SUCH_SESSION,
                "no such session",
            ));
        };
        let Some(slot) = session.handle(HandleId(req.fh)) else {
            return Response::Status(StatusResponse::failed(codes::BAD_HANDLE, "unknown handle"));
        };
        if slot.is_closed() {
            return Response::Status(StatusResponse::failed(codes::BAD_HANDLE, "handle closed"));
        }
        let Some(entry) = self.store.get(&slot.path) else {
            return Response::Status(StatusResponse::failed(
                codes::NO_SUCH_FILE,
                "file does not exist",
            ));
        };
        entry.with_state(|st| {
            if !st.exists {
                return Response::Status(StatusResponse::failed(
                    codes::NO_SUCH_FILE,
                    "file does not exist",
                ));
            }
            if st.instance != slot.instance {
                return Response::Status(StatusResponse::failed(
                    codes::STALE_HANDLE,
                    "instance number mismatch",
                ));
            }
            match lock::try_acquire(st, session.id, mode) {
                Acquisition::Granted => {
                    tracing::debug!(session = %session.id, path = %slot.path, exclusive = req.exclusive, "lock acquired");
                    Response::Status(StatusResponse::ok())
                }
                Acquisition::WouldBlock => Response::Status(StatusResponse::failed(
                    codes::WOULD_BLOCK,
                    "failed to acquire",
                )),
                Acquisition::NoSuchFile => Response::Status(StatusResponse::failed(
                    codes::NO_SUCH_FILE,
                    "file does not exist",
                )),
            }
        })
    }

    fn apply_release(&self, session_id: SessionId, fh: HandleId) -> Response {
        let Some(session) = self.sessions.find(session_id) else {
            return Response::Status(StatusResponse::failed(
                codes::NO_SUCH_SESSION,
                "no such session",
            ));
        };
        let Some(slot) = session.handle(fh) else {
            return Response::Status(StatusResponse::failed(codes::BAD_HANDLE, "unknown handle"));
        };
        let Some(entry) = self.store.get(&slot.path) else {
            return Response::Status(StatusResponse::failed(
                codes::NO_SUCH_FILE,
                "file does not exist",
            ));
        };
        match entry.release(session_id) {
            ReleaseOutcome::Released { .. } => {
                tracing::debug!(session = %session_id, path = %slot.path, "lock released");
                Response::Status(StatusResponse::ok())
            }
            ReleaseOutcome::NotHolder => Response::Status(StatusResponse::failed(
                codes::NOT_LOCK_HOLDER,
                "the session does not hold this lock",
            )),
            ReleaseOutcome::NoSuchFile => Response::Status(StatusResponse::failed(
                codes::NO_SUCH_FILE,
                "file does not exist",
            )),
        }
    }

    fn apply_delete(&self, session_id: SessionId, fh: HandleId) -> Response {
        let failed = |code: i32, message: &str| {
            Response::Delete(DeleteResponse {
                code,
                message: message.to_string(),
                affected_parent: None,
                watchers: Vec::new(),
            })
        };
        let Some(session) = self.sessions.find(session_id) else {
            return failed(codes::NO_SUCH_SESSION, "no such session");
        };
        let Some(slot) = session.handle(fh) else {
            return failed(codes::BAD_HANDLE, "unknown handle");
        };
        if slot.is_closed() {
            return failed(codes::BAD_HANDLE, "handle closed");
        }
        let Some(entry) = self.store.get(&slot.path) else {
            return failed(codes::NO_SUCH_FILE, "file does not exist");
        };
        let watchers = match entry.with_state(|st| {
            if !st.exists {
                return Err((codes::NO_SUCH_FILE, "file does not exist"));
            }
            if st.instance != slot.instance {
                return Err((codes::STALE_HANDLE, "instance number mismatch"));
            }
            if st.is_directory && !st.content.is_empty() {
                return Err((codes::DIRECTORY_NOT_EMPTY, "directory is not empty"));
            }
            let watchers = collect_watchers(st);
            delete_in_place(st);
            Ok(watchers)
        }) {
            Ok(watchers) => watchers,
            Err((code, message)) => return failed(code, message),
        };
        // Waiters parked on the lock must re-check existence and fail
        entry.wake_lock_waiters();
        let mut affected_parent = None;
        if let Some((parent, name)) = split_path(&slot.path) {
            self.store.unlink_child(parent, name);
            affected_parent = Some(parent.to_string());
        }
        tracing::debug!(session = %session_id, path = %slot.path, "deleted");
        Response::Delete(DeleteResponse {
            code: codes::OK,
            message: String::new(),
            affected_parent,
            watchers,
        })
    }

    /// Shared teardown for Close and EndSession: unsubscribe, release any
    /// lock held through this path, and logically delete an ephemeral
    /// entry once its last subscriber is gone. Returns the parent whose
    /// child list changed (if any) and the watchers owed a notification.
    fn cleanup_handle(
        &self,
        session: &Session,
        fh: HandleId,
        slot: &HandleSlot,
    ) -> (Option<String>, Vec<roost_proto::messages::Watcher>) {
        let Some(entry) = self.store.get(&slot.path) else {
            return (None, Vec::new());
        };
        let mut deleted = false;
        let mut watchers = Vec::new();
        let freed = entry.with_state(|st| {
            if st.subscribers.get(&session.id) == Some(&fh) {
                st.subscribers.remove(&session.id);
            }
            let freed = matches!(
                lock::release(st, session.id),
                ReleaseOutcome::Released { now_free: true }
            );
            if st.is_ephemeral
                && st.exists
                && st.instance == slot.instance
                && st.subscribers.is_empty()
            {
                watchers = collect_watchers(st);
                delete_in_place(st);
                deleted = true;
            }
            freed
        });
        if freed || deleted {
            entry.wake_lock_waiters();
        }
        if deleted {
            tracing::debug!(path = %slot.path, "ephemeral entry deleted");
            if let Some((parent, name)) = split_path(&slot.path) {
                self.store.unlink_child(parent, name);
                return (Some(parent.to_string()), watchers);
            }
        }
        (None, watchers)
    }
}

/// Watchers owed a delete notification, in deterministic order. Lock
/// owners hold their locks through open handles, so the subscriber map
/// already covers them.
fn collect_watchers(st: &EntryState) -> Vec<roost_proto::messages::Watcher> {
    let mut watchers: Vec<_> = st
        .subscribers
        .iter()
        .map(|(session, fh)| roost_proto::messages::Watcher {
            session_id: session.0,
            fh: fh.0,
        })
        .collect();
    watchers.sort_by_key(|w| (w.session_id, w.fh));
    watchers
}

/// Logical deletion: clear content and locks, bump the generation, keep
/// the map slot for recreation.
fn delete_in_place(st: &mut EntryState) {
    st.content.clear();
    st.exists = false;
    st.instance += 1;
    st.content_gen = 0;
    st.lock_gen = 0;
    st.lock_owners.clear();
    st.exclusive = false;
    st.subscribers.clear();
}
