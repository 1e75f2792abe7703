// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-process stand-ins for the consensus engine and the keepalive client,
//! used by scenario tests and by RPC adapter integration tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

use crate::apply::StateMachine;
use crate::log::{AppendOutcome, ReplicatedLog};
use crate::service::Coordinator;
use crate::types::SessionId;

/// Single-replica log: every append commits immediately, applied under one
/// lock so records keep their append order.
pub struct LocalLog {
    machine: StateMachine,
    next_index: Mutex<u64>,
    leader: AtomicBool,
}

impl LocalLog {
    pub fn new(machine: StateMachine) -> Arc<Self> {
        Arc::new(Self {
            machine,
            next_index: Mutex::new(0),
            leader: AtomicBool::new(true),
        })
    }

    /// Simulate losing leadership: appends start bouncing with a hint.
    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

impl ReplicatedLog for LocalLog {
    fn append(&self, record: &[u8]) -> AppendOutcome {
        if !self.leader.load(Ordering::SeqCst) {
            return AppendOutcome::not_leader(self.leader_hint());
        }
        let mut next_index = self.next_index.lock().unwrap();
        let index = *next_index;
        *next_index += 1;
        let result = self.machine.commit(index, record);
        AppendOutcome::committed(result)
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn leader_hint(&self) -> Option<u64> {
        if self.is_leader() {
            None
        } else {
            Some(1)
        }
    }
}

/// A keepalive client loop for one session: polls continuously, records
/// every delivered event, and acknowledges it on the following poll.
pub struct EventPump {
    events: Arc<Mutex<Vec<(u64, u32)>>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl EventPump {
    pub fn start(coordinator: Arc<Coordinator>, session_id: SessionId) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let events = events.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let mut acked = None;
                while !stop.load(Ordering::SeqCst) {
                    let (tx, rx) = mpsc::channel();
                    let reactor = Box::new(move |event| {
                        let _ = tx.send(event);
                    });
                    if coordinator.keep_alive(session_id, acked, reactor).is_err() {
                        return;
                    }
                    match rx.recv() {
                        Ok(Some((event, fh))) => {
                            events.lock().unwrap().push((event.0, fh.0));
                            acked = Some(event.0);
                        }
                        Ok(None) => acked = None,
                        Err(_) => return,
                    }
                }
            })
        };
        Self {
            events,
            stop,
            worker: Some(worker),
        }
    }

    /// Events delivered so far, in delivery order.
    pub fn events(&self) -> Vec<(u64, u32)> {
        self.events.lock().unwrap().clone()
    }

    /// Stop polling. The in-flight poll drains at its heartbeat deadline.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}
