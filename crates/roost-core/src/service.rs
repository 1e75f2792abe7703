// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Leader-side coordination service
//!
//! The coordinator is the layer an RPC adapter talks to. It validates
//! requests, funnels every mutation through the replicated log, and after
//! the commit result comes back performs the work the deterministic apply
//! step cannot: blocking-lock admission waits and the watch notification
//! barrier (every watcher is notified and must acknowledge before the
//! triggering operation returns).

use std::sync::Arc;

use roost_proto::{
    codes, validate_path, Action, AcquireRequest, CloseRequest, DeleteRequest, EndSessionRequest,
    OpenRequest, ReleaseRequest, Response, SetContentRequest, Watcher,
};

use crate::channel::Reactor;
use crate::config::CoreConfig;
use crate::error::{CoordError, CoordResult};
use crate::log::ReplicatedLog;
use crate::session::{Session, SessionTable};
use crate::store::{split_path, NamespaceStore};
use crate::types::{EventId, HandleId, LockMode, SessionId};

pub struct Coordinator {
    store: Arc<NamespaceStore>,
    sessions: Arc<SessionTable>,
    log: Arc<dyn ReplicatedLog>,
}

impl Coordinator {
    pub fn new(
        store: Arc<NamespaceStore>,
        sessions: Arc<SessionTable>,
        log: Arc<dyn ReplicatedLog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            sessions,
            log,
        })
    }

    pub fn config(&self) -> &CoreConfig {
        self.sessions.config()
    }

    /// Append one action and decode the committed apply result.
    fn submit(&self, action: &Action) -> CoordResult<Response> {
        let outcome = self.log.append(&action.encode());
        if !outcome.accepted {
            return Err(CoordError::NotLeader {
                hint: outcome.leader_hint,
            });
        }
        let bytes = outcome.result.ok_or(CoordError::LogRejected)?;
        Ok(Response::decode(&bytes)?)
    }

    fn check(response: &Response) -> CoordResult<()> {
        match response.code() {
            code if code < 0 => Err(CoordError::from_code(code, response.message())),
            _ => Ok(()),
        }
    }

    pub fn start_session(self: &Arc<Self>) -> CoordResult<SessionId> {
        let response = self.submit(&Action::StartSession)?;
        Self::check(&response)?;
        let Response::StartSession(res) = response else {
            return Err(CoordError::Protocol("unexpected response kind".to_string()));
        };
        let id = SessionId(res.session_id);
        let session = self
            .sessions
            .find(id)
            .ok_or_else(|| CoordError::Protocol("session missing after commit".to_string()))?;
        if self.log.is_leader() {
            self.arm_liveness(&session);
        }
        tracing::info!(session = %id, "session started");
        Ok(id)
    }

    /// Arm liveness timers for every session in the table. Hosts call this
    /// when the replica acquires leadership: sessions built from log replay
    /// or an installed snapshot have inert channels until then. Arming an
    /// already-armed channel is a no-op.
    pub fn on_leadership_acquired(self: &Arc<Self>) {
        for session in self.sessions.all() {
            self.arm_liveness(&session);
        }
    }

    fn arm_liveness(self: &Arc<Self>, session: &Session) {
        let coordinator = Arc::clone(self);
        let id = session.id;
        session.channel.arm(Box::new(move || {
            coordinator.expire_session(id);
        }));
    }

    pub fn end_session(&self, session_id: SessionId) -> CoordResult<()> {
        let response = self.submit(&Action::EndSession(EndSessionRequest {
            session_id: session_id.0,
        }))?;
        Self::check(&response)?;
        let Response::EndSession(res) = response else {
            return Err(CoordError::Protocol("unexpected response kind".to_string()));
        };
        self.notify_watchers(&res.watchers);
        for parent in &res.affected_parents {
            self.notify_subscribers_of(parent);
        }
        tracing::info!(session = %session_id, "session ended");
        Ok(())
    }

    /// Session expiry, invoked by the liveness timer. There is no client
    /// left to report failures to; if the EndSession cannot commit (for
    /// instance leadership was lost) the channel is torn down locally so no
    /// parked poll or barrier waiter hangs on the dead session.
    fn expire_session(&self, session_id: SessionId) {
        tracing::warn!(session = %session_id, "expiring unresponsive session");
        if let Err(err) = self.end_session(session_id) {
            tracing::warn!(session = %session_id, %err, "session expiry failed");
            if let Some(session) = self.sessions.find(session_id) {
                session.channel.close();
            }
        }
    }

    pub fn open(
        &self,
        session_id: SessionId,
        path: &str,
        directory: bool,
        ephemeral: bool,
    ) -> CoordResult<HandleId> {
        validate_path(path)?;
        // Reject a missing or non-directory parent here; by the time the
        // record applies, a violated parent invariant is replica divergence.
        if let Some((parent, _)) = split_path(path) {
            let entry = self.store.get(parent).ok_or(CoordError::NoSuchFile)?;
            entry.with_state(|st| {
                if !st.exists {
                    return Err(CoordError::NoSuchFile);
                }
                if !st.is_directory {
                    return Err(CoordError::NotADirectory);
                }
                Ok(())
            })?;
        }
        let response = self.submit(&Action::Open(OpenRequest {
            session_id: session_id.0,
            path: path.to_string(),
            directory,
            ephemeral,
        }))?;
        Self::check(&response)?;
        let Response::Open(res) = response else {
            return Err(CoordError::Protocol("unexpected response kind".to_string()));
        };
        if let Some(parent) = &res.affected_parent {
            self.notify_subscribers_of(parent);
        }
        Ok(HandleId(res.fh))
    }

    pub fn close(&self, session_id: SessionId, fh: HandleId) -> CoordResult<()> {
        let response = self.submit(&Action::Close(CloseRequest {
            session_id: session_id.0,
            fh: fh.0,
        }))?;
        Self::check(&response)?;
        let Response::Close(res) = response else {
            return Err(CoordError::Protocol("unexpected response kind".to_string()));
        };
        self.notify_watchers(&res.watchers);
        if let Some(parent) = &res.affected_parent {
            self.notify_subscribers_of(parent);
        }
        Ok(())
    }

    pub fn set_content(
        &self,
        session_id: SessionId,
        fh: HandleId,
        content: Vec<u8>,
    ) -> CoordResult<()> {
        let (_, slot) = self.resolve(session_id, fh)?;
        let response = self.submit(&Action::SetContent(SetContentRequest {
            session_id: session_id.0,
            fh: fh.0,
            content,
        }))?;
        Self::check(&response)?;
        self.notify_subscribers_of(&slot.path);
        Ok(())
    }

    /// Read the entry content through an open handle. Reads are served from
    /// the leader's state without a log round trip.
    pub fn get_content(&self, session_id: SessionId, fh: HandleId) -> CoordResult<Vec<u8>> {
        if !self.log.is_leader() {
            return Err(CoordError::NotLeader {
                hint: self.log.leader_hint(),
            });
        }
        let (_, slot) = self.resolve(session_id, fh)?;
        let entry = self.store.get(&slot.path).ok_or(CoordError::NoSuchFile)?;
        entry.with_state(|st| {
            if !st.exists {
                return Err(CoordError::NoSuchFile);
            }
            if st.instance != slot.instance {
                return Err(CoordError::StaleHandle);
            }
            Ok(st.content.clone())
        })
    }

    /// Non-blocking lock acquisition. `Ok(false)` reports contention.
    pub fn try_acquire(
        &self,
        session_id: SessionId,
        fh: HandleId,
        exclusive: bool,
    ) -> CoordResult<bool> {
        let response = self.submit(&Action::Acquire(AcquireRequest {
            session_id: session_id.0,
            fh: fh.0,
            exclusive,
        }))?;
        Self::check(&response)?;
        Ok(response.code() == codes::OK)
    }

    /// Blocking lock acquisition. Parks on the entry until the admission
    /// predicate holds, then commits the admission; a competing admission
    /// may win the race, in which case the caller parks again.
    pub fn acquire(&self, session_id: SessionId, fh: HandleId, exclusive: bool) -> CoordResult<()> {
        let mode = if exclusive {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        loop {
            let (_, slot) = self.resolve(session_id, fh)?;
            let entry = self.store.get(&slot.path).ok_or(CoordError::NoSuchFile)?;
            entry.await_admission(mode, slot.instance)?;
            if self.try_acquire(session_id, fh, exclusive)? {
                return Ok(());
            }
            tracing::debug!(session = %session_id, path = %slot.path, "lost admission race, waiting again");
        }
    }

    pub fn release(&self, session_id: SessionId, fh: HandleId) -> CoordResult<()> {
        let response = self.submit(&Action::Release(ReleaseRequest {
            session_id: session_id.0,
            fh: fh.0,
        }))?;
        Self::check(&response)
    }

    pub fn delete(&self, session_id: SessionId, fh: HandleId) -> CoordResult<()> {
        let response = self.submit(&Action::Delete(DeleteRequest {
            session_id: session_id.0,
            fh: fh.0,
        }))?;
        Self::check(&response)?;
        let Response::Delete(res) = response else {
            return Err(CoordError::Protocol("unexpected response kind".to_string()));
        };
        self.notify_watchers(&res.watchers);
        if let Some(parent) = &res.affected_parent {
            self.notify_subscribers_of(parent);
        }
        Ok(())
    }

    /// Long-poll entry point. The reactor completes with the next watch
    /// event for the session, or with `None` as a bare heartbeat.
    pub fn keep_alive(
        &self,
        session_id: SessionId,
        acked_event: Option<u64>,
        reactor: Reactor,
    ) -> CoordResult<()> {
        if !self.log.is_leader() {
            return Err(CoordError::NotLeader {
                hint: self.log.leader_hint(),
            });
        }
        let session = self
            .sessions
            .find(session_id)
            .ok_or(CoordError::NoSuchSession)?;
        session.channel.keep_alive(acked_event.map(EventId), reactor);
        Ok(())
    }

    fn resolve(
        &self,
        session_id: SessionId,
        fh: HandleId,
    ) -> CoordResult<(Arc<Session>, crate::session::HandleSlot)> {
        let session = self
            .sessions
            .find(session_id)
            .ok_or(CoordError::NoSuchSession)?;
        let slot = session.handle(fh).ok_or(CoordError::BadHandle)?;
        if slot.is_closed() {
            return Err(CoordError::BadHandle);
        }
        Ok((session, slot))
    }

    /// Notify a captured watcher list (deleted entries report theirs in the
    /// apply result because the apply step clears them) and wait for every
    /// acknowledgement.
    fn notify_watchers(&self, watchers: &[Watcher]) {
        let targets: Vec<_> = watchers
            .iter()
            .filter_map(|w| {
                self.sessions
                    .find(SessionId(w.session_id))
                    .map(|session| (session, HandleId(w.fh)))
            })
            .collect();
        Self::barrier(targets);
    }

    /// Notify the live subscribers of `path`, pruning entries whose session
    /// is gone, and wait for every acknowledgement.
    fn notify_subscribers_of(&self, path: &str) {
        let Some(entry) = self.store.get(path) else {
            return;
        };
        let watchers: Vec<(SessionId, HandleId)> =
            entry.with_state(|st| st.subscribers.iter().map(|(s, h)| (*s, *h)).collect());
        let mut targets = Vec::with_capacity(watchers.len());
        let mut stale = Vec::new();
        for (session_id, fh) in watchers {
            match self.sessions.find(session_id) {
                Some(session) => targets.push((session, fh)),
                None => stale.push(session_id),
            }
        }
        if !stale.is_empty() {
            entry.with_state(|st| {
                for session_id in &stale {
                    st.subscribers.remove(session_id);
                }
            });
        }
        Self::barrier(targets);
    }

    /// Enqueue one event per target and suspend until each is acknowledged
    /// (or its channel is torn down). The fan-out runs on scoped threads so
    /// slow watchers delay the caller without serializing behind each other.
    fn barrier(targets: Vec<(Arc<Session>, HandleId)>) {
        std::thread::scope(|scope| {
            for (session, fh) in &targets {
                if let Some(event) = session.channel.enqueue(*fh) {
                    let channel = Arc::clone(&session.channel);
                    scope.spawn(move || channel.block_until_acked(event));
                }
            }
        });
    }
}
