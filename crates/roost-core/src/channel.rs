// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-session keepalive/watch channel
//!
//! The channel is both the session's liveness heartbeat and the transport
//! for watch events. At most one long-poll is outstanding per session; at
//! most one event is in flight. The client acknowledges the delivered
//! event id on its next keepalive, which releases the commit-path barrier
//! waiting in `block_until_acked`.
//!
//! Channel state machine: IDLE (no outstanding long-poll) → PARKED
//! (long-poll waiting, deadline running) → completed on event, deadline, or
//! teardown → IDLE. Each delivered event independently moves UNACKED →
//! ACKED when a later keepalive names it.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::config::CoreConfig;
use crate::types::{EventId, HandleId};

/// Completion for a parked long-poll: one event, or `None` for a heartbeat
/// (deadline reached, session teardown, or a superseded poll).
pub type Reactor = Box<dyn FnOnce(Option<(EventId, HandleId)>) + Send>;

type ExpiryCallback = Box<dyn FnOnce() + Send>;

struct Parked {
    reactor: Reactor,
    deadline: Instant,
}

struct ChannelState {
    queue: VecDeque<(EventId, HandleId)>,
    /// Event ids are scoped per session, start at 1, and are never reused.
    next_event: u64,
    /// Acknowledged but not yet consumed by a barrier waiter.
    acked: HashSet<u64>,
    in_flight: Option<u64>,
    parked: Option<Parked>,
    /// Present only while armed and not yet fired; taken on expiry so the
    /// callback runs at most once.
    expiry: Option<ExpiryCallback>,
    last_contact: Instant,
    closed: bool,
}

/// One session's long-poll channel
pub struct WatchChannel {
    state: Mutex<ChannelState>,
    cv: Condvar,
    poll_interval: Duration,
    liveness_window: Duration,
}

impl WatchChannel {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                queue: VecDeque::new(),
                next_event: 1,
                acked: HashSet::new(),
                in_flight: None,
                parked: None,
                expiry: None,
                last_contact: Instant::now(),
                closed: false,
            }),
            cv: Condvar::new(),
            poll_interval: config.keepalive_poll(),
            liveness_window: config.liveness_window(),
        }
    }

    /// Start the leader-side liveness timer. Followers never arm; their
    /// channels are inert bookkeeping. `on_expiry` fires at most once, when
    /// no keepalive at all arrives within the liveness window.
    pub fn arm(self: &Arc<Self>, on_expiry: ExpiryCallback) {
        {
            let mut st = self.state.lock().unwrap();
            if st.closed || st.expiry.is_some() {
                return;
            }
            st.expiry = Some(on_expiry);
            st.last_contact = Instant::now();
        }
        let channel = Arc::clone(self);
        std::thread::spawn(move || channel.run_timer());
    }

    /// Long-poll entry point. Records the ack, then either completes the
    /// reactor immediately with the oldest queued event or parks it under
    /// the poll deadline. A still-parked earlier poll is superseded and
    /// completed as a heartbeat.
    pub fn keep_alive(&self, acked: Option<EventId>, reactor: Reactor) {
        let mut st = self.state.lock().unwrap();
        if st.closed {
            drop(st);
            reactor(None);
            return;
        }
        st.last_contact = Instant::now();
        // Only the in-flight event can be acknowledged; anything else is a
        // stray id and recording it would grow the set unboundedly.
        if let Some(EventId(id)) = acked {
            if st.in_flight == Some(id) {
                st.in_flight = None;
                st.acked.insert(id);
            }
        }
        let superseded = st.parked.take();
        let mut deliver = None;
        if st.in_flight.is_none() {
            deliver = st.queue.pop_front();
        }
        match deliver {
            Some(event) => {
                st.in_flight = Some(event.0 .0);
                self.cv.notify_all();
                drop(st);
                tracing::debug!(event = event.0 .0, fh = event.1 .0, "keepalive: delivering event");
                if let Some(old) = superseded {
                    (old.reactor)(None);
                }
                reactor(Some(event));
            }
            None => {
                st.parked = Some(Parked {
                    reactor,
                    deadline: Instant::now() + self.poll_interval,
                });
                self.cv.notify_all();
                drop(st);
                if let Some(old) = superseded {
                    (old.reactor)(None);
                }
            }
        }
    }

    /// Queue a watch event for `fh`, completing a parked long-poll at once
    /// when nothing is in flight. Returns the assigned event id, or `None`
    /// on a closed channel.
    pub fn enqueue(&self, fh: HandleId) -> Option<EventId> {
        let mut st = self.state.lock().unwrap();
        if st.closed {
            return None;
        }
        let id = st.next_event;
        st.next_event += 1;
        st.queue.push_back((EventId(id), fh));
        let mut fire = None;
        if st.in_flight.is_none() {
            if let Some(parked) = st.parked.take() {
                let event = st.queue.pop_front().unwrap();
                st.in_flight = Some(event.0 .0);
                fire = Some((parked.reactor, event));
            }
        }
        self.cv.notify_all();
        drop(st);
        if let Some((reactor, event)) = fire {
            tracing::debug!(event = event.0 .0, fh = event.1 .0, "enqueue: completing parked poll");
            reactor(Some(event));
        }
        Some(EventId(id))
    }

    /// Suspend the caller until the client acknowledges `id` or the channel
    /// is torn down. Teardown counts as delivered: no one is left to care.
    pub fn block_until_acked(&self, id: EventId) {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.closed || st.acked.remove(&id.0) {
                return;
            }
            st = self.cv.wait(st).unwrap();
        }
    }

    /// Tear the channel down: complete any parked long-poll, disarm the
    /// timer, and release every barrier waiter.
    pub fn close(&self) {
        let parked = {
            let mut st = self.state.lock().unwrap();
            if st.closed {
                return;
            }
            st.closed = true;
            st.expiry = None;
            st.acked.clear();
            self.cv.notify_all();
            st.parked.take()
        };
        if let Some(parked) = parked {
            (parked.reactor)(None);
        }
    }

    fn run_timer(self: Arc<Self>) {
        let mut st = self.state.lock().unwrap();
        loop {
            if st.closed || st.expiry.is_none() {
                return;
            }
            let now = Instant::now();
            if let Some(parked) = &st.parked {
                if now >= parked.deadline {
                    let parked = st.parked.take().unwrap();
                    drop(st);
                    (parked.reactor)(None);
                    st = self.state.lock().unwrap();
                    continue;
                }
            }
            if st.parked.is_none() && now >= st.last_contact + self.liveness_window {
                let expiry = st.expiry.take().unwrap();
                drop(st);
                tracing::info!("session liveness window elapsed, expiring");
                expiry();
                return;
            }
            let next = match &st.parked {
                Some(parked) => parked.deadline,
                None => st.last_contact + self.liveness_window,
            };
            let timeout = next.saturating_duration_since(Instant::now());
            let (guard, _) = self.cv.wait_timeout(st, timeout).unwrap();
            st = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn test_config() -> CoreConfig {
        CoreConfig {
            keepalive_poll_ms: 50,
            liveness_window_ms: 250,
        }
    }

    fn reactor_into(tx: mpsc::Sender<Option<(EventId, HandleId)>>) -> Reactor {
        Box::new(move |event| {
            let _ = tx.send(event);
        })
    }

    #[test]
    fn test_parked_poll_completed_by_enqueue() {
        let channel = WatchChannel::new(&test_config());
        let (tx, rx) = mpsc::channel();
        channel.keep_alive(None, reactor_into(tx));
        assert_eq!(channel.enqueue(HandleId(3)), Some(EventId(1)));
        assert_eq!(rx.recv().unwrap(), Some((EventId(1), HandleId(3))));
    }

    #[test]
    fn test_one_event_in_flight_until_acked() {
        let channel = WatchChannel::new(&test_config());
        let e1 = channel.enqueue(HandleId(1)).unwrap();
        let e2 = channel.enqueue(HandleId(2)).unwrap();
        assert_eq!((e1, e2), (EventId(1), EventId(2)));

        // First poll takes the oldest event
        let (tx, rx) = mpsc::channel();
        channel.keep_alive(None, reactor_into(tx));
        assert_eq!(rx.recv().unwrap(), Some((EventId(1), HandleId(1))));

        // Un-acked: the next poll must not surface event 2
        let (tx, rx) = mpsc::channel();
        channel.keep_alive(None, reactor_into(tx.clone()));
        assert!(rx.try_recv().is_err());

        // Acking event 1 releases event 2 to the parked poll's successor
        let (tx2, rx2) = mpsc::channel();
        channel.keep_alive(Some(EventId(1)), reactor_into(tx2));
        // The superseded poll resolves as a heartbeat
        assert_eq!(rx.recv().unwrap(), None);
        assert_eq!(rx2.recv().unwrap(), Some((EventId(2), HandleId(2))));
    }

    #[test]
    fn test_block_until_acked_released_by_ack() {
        let channel = Arc::new(WatchChannel::new(&test_config()));
        let id = channel.enqueue(HandleId(1)).unwrap();
        std::thread::scope(|s| {
            let waiter = {
                let channel = channel.clone();
                s.spawn(move || channel.block_until_acked(id))
            };
            let (tx, rx) = mpsc::channel();
            channel.keep_alive(None, reactor_into(tx));
            assert_eq!(rx.recv().unwrap(), Some((id, HandleId(1))));
            let (tx, _rx) = mpsc::channel();
            channel.keep_alive(Some(id), reactor_into(tx));
            waiter.join().unwrap();
        });
    }

    #[test]
    fn test_ack_for_undelivered_event_releases_nothing() {
        let channel = Arc::new(WatchChannel::new(&test_config()));
        let id = channel.enqueue(HandleId(1)).unwrap();
        let (tx, rx) = mpsc::channel();
        channel.keep_alive(None, reactor_into(tx));
        assert_eq!(rx.recv().unwrap(), Some((id, HandleId(1))));

        std::thread::scope(|s| {
            let waiter = {
                let channel = channel.clone();
                s.spawn(move || channel.block_until_acked(id))
            };
            // An ack naming an id that was never in flight is a stray
            let (tx, _rx) = mpsc::channel();
            channel.keep_alive(Some(EventId(99)), reactor_into(tx));
            std::thread::sleep(Duration::from_millis(50));
            assert!(!waiter.is_finished());

            let (tx, _rx) = mpsc::channel();
            channel.keep_alive(Some(id), reactor_into(tx));
            waiter.join().unwrap();
        });
    }

    #[test]
    fn test_block_until_acked_released_by_close() {
        let channel = Arc::new(WatchChannel::new(&test_config()));
        let id = channel.enqueue(HandleId(1)).unwrap();
        std::thread::scope(|s| {
            let waiter = {
                let channel = channel.clone();
                s.spawn(move || channel.block_until_acked(id))
            };
            std::thread::sleep(Duration::from_millis(20));
            channel.close();
            waiter.join().unwrap();
        });
    }

    #[test]
    fn test_parked_poll_heartbeats_on_deadline() {
        let channel = Arc::new(WatchChannel::new(&test_config()));
        channel.arm(Box::new(|| {}));
        let (tx, rx) = mpsc::channel();
        channel.keep_alive(None, reactor_into(tx));
        // No event: completes as a heartbeat around the poll interval
        assert_eq!(rx.recv_timeout(Duration::from_millis(500)).unwrap(), None);
        channel.close();
    }

    #[test]
    fn test_expiry_fires_exactly_once() {
        let channel = Arc::new(WatchChannel::new(&test_config()));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        channel.arm(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        std::thread::sleep(Duration::from_millis(600));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_keepalive_defers_expiry() {
        let channel = Arc::new(WatchChannel::new(&test_config()));
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        channel.arm(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        // Poll repeatedly: parked polls hold off the liveness check
        for _ in 0..6 {
            let (tx, rx) = mpsc::channel();
            channel.keep_alive(None, reactor_into(tx));
            let _ = rx.recv();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        channel.close();
    }

    #[test]
    fn test_closed_channel_rejects_events() {
        let channel = WatchChannel::new(&test_config());
        channel.close();
        assert_eq!(channel.enqueue(HandleId(1)), None);
        let (tx, rx) = mpsc::channel();
        channel.keep_alive(None, reactor_into(tx));
        assert_eq!(rx.recv().unwrap(), None);
    }
}
