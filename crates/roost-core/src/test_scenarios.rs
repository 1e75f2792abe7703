// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end scenarios over a single in-process replica

use std::sync::Arc;
use std::time::Duration;

use roost_proto::Action;

use crate::apply::StateMachine;
use crate::config::CoreConfig;
use crate::error::CoordError;
use crate::service::Coordinator;
use crate::session::SessionTable;
use crate::store::NamespaceStore;
use crate::log::ReplicatedLog;
use crate::testing::{EventPump, LocalLog};
use crate::types::{EventId, HandleId, SessionId};

struct Harness {
    store: Arc<NamespaceStore>,
    sessions: Arc<SessionTable>,
    log: Arc<LocalLog>,
    coordinator: Arc<Coordinator>,
}

fn harness(config: CoreConfig) -> Harness {
    let store = Arc::new(NamespaceStore::new());
    let sessions = Arc::new(SessionTable::new(config));
    let machine = StateMachine::new(store.clone(), sessions.clone());
    let log = LocalLog::new(machine);
    let coordinator = Coordinator::new(store.clone(), sessions.clone(), log.clone());
    Harness {
        store,
        sessions,
        log,
        coordinator,
    }
}

/// Fast polls, liveness effectively disabled.
fn patient_config() -> CoreConfig {
    CoreConfig {
        keepalive_poll_ms: 50,
        liveness_window_ms: 60_000,
    }
}

fn bare_machine() -> StateMachine {
    StateMachine::new(
        Arc::new(NamespaceStore::new()),
        Arc::new(SessionTable::new(patient_config())),
    )
}

#[test]
fn test_missing_parent_rejected_before_commit() {
    let h = harness(patient_config());
    let c = &h.coordinator;
    let sid = c.start_session().unwrap();

    assert_eq!(
        c.open(sid, "/a/b", false, false),
        Err(CoordError::NoSuchFile)
    );

    let pump = EventPump::start(c.clone(), sid);
    c.open(sid, "/a", true, false).unwrap();
    c.open(sid, "/a/b", false, false).unwrap();
    drop(pump);

    // The root gained exactly one child token, despite the failed attempt
    h.store
        .get("/")
        .unwrap()
        .with_state(|st| assert_eq!(st.content, b"\0a"));
    h.store
        .get("/a")
        .unwrap()
        .with_state(|st| assert_eq!(st.content, b"\0b"));
}

#[test]
fn test_file_through_a_non_directory_parent_rejected() {
    let h = harness(patient_config());
    let c = &h.coordinator;
    let sid = c.start_session().unwrap();
    let pump = EventPump::start(c.clone(), sid);
    c.open(sid, "/plain", false, false).unwrap();
    assert_eq!(
        c.open(sid, "/plain/child", false, false),
        Err(CoordError::NotADirectory)
    );
    drop(pump);
}

#[test]
fn test_invalid_paths_rejected() {
    let h = harness(patient_config());
    let c = &h.coordinator;
    let sid = c.start_session().unwrap();
    for path in ["relative", "/trailing/", "//", "/a/../b", "/a\0b"] {
        match c.open(sid, path, false, false) {
            Err(CoordError::InvalidPath(_)) => {}
            other => panic!("expected InvalidPath for {path:?}, got {other:?}"),
        }
    }
}

#[test]
fn test_content_lifecycle_round_trip() {
    let h = harness(patient_config());
    let c = &h.coordinator;
    let sid = c.start_session().unwrap();
    let pump = EventPump::start(c.clone(), sid);

    let fh = c.open(sid, "/f", false, false).unwrap();
    c.set_content(sid, fh, b"hello".to_vec()).unwrap();
    assert_eq!(c.get_content(sid, fh).unwrap(), b"hello");

    let first_instance = h.store.get("/f").unwrap().with_state(|st| st.instance);
    c.delete(sid, fh).unwrap();
    assert_eq!(c.get_content(sid, fh), Err(CoordError::NoSuchFile));

    // Recreation starts from empty content under a strictly newer instance
    let fh2 = c.open(sid, "/f", false, false).unwrap();
    assert_eq!(c.get_content(sid, fh2).unwrap(), b"");
    let second_instance = h.store.get("/f").unwrap().with_state(|st| st.instance);
    assert!(second_instance > first_instance);

    // The pre-delete handle stays dead
    assert_eq!(c.get_content(sid, fh), Err(CoordError::StaleHandle));
    assert_eq!(
        c.set_content(sid, fh, b"x".to_vec()),
        Err(CoordError::StaleHandle)
    );
    drop(pump);
}

#[test]
fn test_watch_events_delivered_in_order_and_acked() {
    let h = harness(patient_config());
    let c = &h.coordinator;
    let watcher = c.start_session().unwrap();
    let writer = c.start_session().unwrap();
    let watcher_pump = EventPump::start(c.clone(), watcher);
    let writer_pump = EventPump::start(c.clone(), writer);

    let watch_fh = c.open(watcher, "/f", false, false).unwrap();
    let write_fh = c.open(writer, "/f", false, false).unwrap();

    // Each mutation returns only after every watcher acked its event, so
    // no sleeps are needed before inspecting the pump.
    c.set_content(writer, write_fh, b"one".to_vec()).unwrap();
    c.set_content(writer, write_fh, b"two".to_vec()).unwrap();

    assert_eq!(
        c.get_content(watcher, watch_fh).unwrap(),
        b"two",
        "acked events imply the watcher can already see the final content"
    );
    // Event ids are per session, starting at 1, delivered oldest first
    assert_eq!(watcher_pump.events(), vec![(1, watch_fh.0), (2, watch_fh.0)]);
    drop(watcher_pump);
    drop(writer_pump);
}

#[test]
fn test_delete_notifies_watchers_and_parent() {
    let h = harness(patient_config());
    let c = &h.coordinator;
    let watcher = c.start_session().unwrap();
    let writer = c.start_session().unwrap();
    let watcher_pump = EventPump::start(c.clone(), watcher);
    let writer_pump = EventPump::start(c.clone(), writer);

    let root_fh = c.open(watcher, "/", true, false).unwrap();
    let watch_fh = c.open(watcher, "/f", false, false).unwrap();
    let write_fh = c.open(writer, "/f", false, false).unwrap();

    c.delete(writer, write_fh).unwrap();

    // Creation of /f touched the root; the delete then notified the entry
    // watcher before the root subscribers
    assert_eq!(
        watcher_pump.events(),
        vec![(1, root_fh.0), (2, watch_fh.0), (3, root_fh.0)]
    );
    drop(watcher_pump);
    drop(writer_pump);
}

#[test]
fn test_blocking_acquire_waits_for_release() {
    let h = harness(patient_config());
    let c = &h.coordinator;
    let s1 = c.start_session().unwrap();
    let s2 = c.start_session().unwrap();
    let fh1 = c.open(s1, "/lock", false, false).unwrap();
    let fh2 = c.open(s2, "/lock", false, false).unwrap();

    assert!(c.try_acquire(s1, fh1, true).unwrap());
    assert!(!c.try_acquire(s2, fh2, true).unwrap());

    std::thread::scope(|scope| {
        let waiter = {
            let c = c.clone();
            scope.spawn(move || c.acquire(s2, fh2, true))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        c.release(s1, fh1).unwrap();
        waiter.join().unwrap().unwrap();
    });

    // s2 holds it now; s1 may not release it
    assert_eq!(c.release(s1, fh1), Err(CoordError::NotLockHolder));
    c.release(s2, fh2).unwrap();
}

#[test]
fn test_shared_holders_block_exclusive_only() {
    let h = harness(patient_config());
    let c = &h.coordinator;
    let s1 = c.start_session().unwrap();
    let s2 = c.start_session().unwrap();
    let fh1 = c.open(s1, "/lock", false, false).unwrap();
    let fh2 = c.open(s2, "/lock", false, false).unwrap();

    assert!(c.try_acquire(s1, fh1, false).unwrap());
    assert!(c.try_acquire(s2, fh2, false).unwrap());
    // Upgrading to exclusive while any holder remains would block
    assert!(!c.try_acquire(s1, fh1, true).unwrap());
    c.release(s1, fh1).unwrap();
    c.release(s2, fh2).unwrap();
    assert!(c.try_acquire(s1, fh1, true).unwrap());
}

#[test]
fn test_end_session_cleans_ephemerals_and_notifies() {
    let h = harness(patient_config());
    let c = &h.coordinator;
    let owner = c.start_session().unwrap();
    let watcher = c.start_session().unwrap();
    let watcher_pump = EventPump::start(c.clone(), watcher);

    let root_fh = c.open(watcher, "/", true, false).unwrap();
    c.open(owner, "/worker-0", false, true).unwrap();

    // The creation already produced one root event for the watcher
    c.end_session(owner).unwrap();

    h.store
        .get("/worker-0")
        .unwrap()
        .with_state(|st| assert!(!st.exists));
    h.store
        .get("/")
        .unwrap()
        .with_state(|st| assert_eq!(st.content, b""));
    let events = watcher_pump.events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|(_, fh)| *fh == root_fh.0));

    assert_eq!(c.end_session(owner), Err(CoordError::NoSuchSession));
    drop(watcher_pump);
}

#[test]
fn test_end_session_releases_held_locks() {
    let h = harness(patient_config());
    let c = &h.coordinator;
    let s1 = c.start_session().unwrap();
    let s2 = c.start_session().unwrap();
    let fh1 = c.open(s1, "/lock", false, false).unwrap();
    let fh2 = c.open(s2, "/lock", false, false).unwrap();
    assert!(c.try_acquire(s1, fh1, true).unwrap());

    std::thread::scope(|scope| {
        let waiter = {
            let c = c.clone();
            scope.spawn(move || c.acquire(s2, fh2, true))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        c.end_session(s1).unwrap();
        waiter.join().unwrap().unwrap();
    });
}

#[test]
fn test_session_expires_without_keepalives() {
    let h = harness(CoreConfig {
        keepalive_poll_ms: 50,
        liveness_window_ms: 200,
    });
    let c = &h.coordinator;
    let sid = c.start_session().unwrap();
    assert!(h.sessions.find(sid).is_some());

    // Never poll: the liveness timer expires the session through the log
    std::thread::sleep(Duration::from_millis(700));
    assert!(h.sessions.find(sid).is_none());
    assert_eq!(
        c.keep_alive(sid, None, Box::new(|_| {})),
        Err(CoordError::NoSuchSession)
    );

    // The replica is healthy; new sessions keep working
    let next = c.start_session().unwrap();
    assert!(next.0 > sid.0);
}

#[test]
fn test_polling_session_stays_alive() {
    let h = harness(CoreConfig {
        keepalive_poll_ms: 50,
        liveness_window_ms: 200,
    });
    let c = &h.coordinator;
    let sid = c.start_session().unwrap();
    let pump = EventPump::start(c.clone(), sid);
    std::thread::sleep(Duration::from_millis(700));
    assert!(h.sessions.find(sid).is_some());
    drop(pump);
}

#[test]
fn test_failed_expiry_still_tears_down_the_channel() {
    let h = harness(CoreConfig {
        keepalive_poll_ms: 50,
        liveness_window_ms: 200,
    });
    let c = &h.coordinator;
    let sid = c.start_session().unwrap();
    let channel = h.sessions.find(sid).unwrap().channel.clone();

    // Leadership is lost before the session goes quiet: the expiry's
    // EndSession bounces and the session stays in the table
    h.log.set_leader(false);
    std::thread::sleep(Duration::from_millis(700));
    assert!(h.sessions.find(sid).is_some());

    // The channel must still be torn down so nothing hangs on it
    assert_eq!(channel.enqueue(HandleId(0)), None);
    let start = std::time::Instant::now();
    channel.block_until_acked(EventId(1));
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_leadership_acquired_arms_inherited_sessions() {
    let h = harness(CoreConfig {
        keepalive_poll_ms: 50,
        liveness_window_ms: 200,
    });
    // Created straight through the log, as during replay on a follower:
    // no timer is armed
    h.log.append(&Action::StartSession.encode());
    let sid = SessionId(0);
    assert!(h.sessions.find(sid).is_some());
    std::thread::sleep(Duration::from_millis(400));
    assert!(h.sessions.find(sid).is_some(), "inert session must not expire");

    // Taking leadership arms the inherited session; silence now expires it
    h.coordinator.on_leadership_acquired();
    std::thread::sleep(Duration::from_millis(700));
    assert!(h.sessions.find(sid).is_none());
}

#[test]
fn test_follower_bounces_writes_with_hint() {
    let h = harness(patient_config());
    let c = &h.coordinator;
    let sid = c.start_session().unwrap();
    h.log.set_leader(false);
    assert_eq!(
        c.open(sid, "/f", false, false),
        Err(CoordError::NotLeader { hint: Some(1) })
    );
    assert_eq!(
        c.get_content(sid, HandleId(0)),
        Err(CoordError::NotLeader { hint: Some(1) })
    );
    h.log.set_leader(true);
    c.open(sid, "/f", false, false).unwrap();
}

#[test]
fn test_replay_is_deterministic() {
    let records: Vec<Vec<u8>> = vec![
        Action::StartSession.encode(),
        Action::Open(roost_proto::OpenRequest {
            session_id: 0,
            path: "/dir".to_string(),
            directory: true,
            ephemeral: false,
        })
        .encode(),
        Action::Open(roost_proto::OpenRequest {
            session_id: 0,
            path: "/dir/f".to_string(),
            directory: false,
            ephemeral: false,
        })
        .encode(),
        Action::SetContent(roost_proto::SetContentRequest {
            session_id: 0,
            fh: 1,
            content: b"payload".to_vec(),
        })
        .encode(),
        Action::Acquire(roost_proto::AcquireRequest {
            session_id: 0,
            fh: 1,
            exclusive: true,
        })
        .encode(),
        Action::StartSession.encode(),
        Action::Release(roost_proto::ReleaseRequest {
            session_id: 0,
            fh: 1,
        })
        .encode(),
        Action::EndSession(roost_proto::EndSessionRequest { session_id: 0 }).encode(),
    ];

    let a = bare_machine();
    let b = bare_machine();
    for (idx, record) in records.iter().enumerate() {
        let ra = a.commit(idx as u64, record);
        let rb = b.commit(idx as u64, record);
        assert_eq!(ra, rb, "apply results diverged at record {idx}");
    }
    assert_eq!(a.snapshot_bytes(), b.snapshot_bytes());
}

#[test]
fn test_snapshot_restore_resumes_identically() {
    let a = bare_machine();
    a.apply(Action::StartSession);
    a.apply(Action::Open(roost_proto::OpenRequest {
        session_id: 0,
        path: "/f".to_string(),
        directory: false,
        ephemeral: false,
    }));
    a.apply(Action::SetContent(roost_proto::SetContentRequest {
        session_id: 0,
        fh: 0,
        content: b"kept".to_vec(),
    }));

    let b = bare_machine();
    b.restore_bytes(&a.snapshot_bytes()).unwrap();
    assert_eq!(a.snapshot(), b.snapshot());

    // Both continue identically, including the session id counter
    let next = Action::StartSession.encode();
    assert_eq!(a.commit(3, &next), b.commit(3, &next));
    assert_eq!(a.snapshot_bytes(), b.snapshot_bytes());
}

#[test]
fn test_restore_rejects_garbage() {
    let machine = bare_machine();
    assert!(machine.restore_bytes(b"not a snapshot").is_err());
}

#[test]
fn test_operations_on_unknown_session_fail_uniformly() {
    let h = harness(patient_config());
    let c = &h.coordinator;
    let ghost = SessionId(777);
    let fh = HandleId(0);
    assert_eq!(
        c.open(ghost, "/f", false, false),
        Err(CoordError::NoSuchSession)
    );
    assert_eq!(c.close(ghost, fh), Err(CoordError::NoSuchSession));
    assert_eq!(
        c.set_content(ghost, fh, vec![]),
        Err(CoordError::NoSuchSession)
    );
    assert_eq!(c.get_content(ghost, fh), Err(CoordError::NoSuchSession));
    assert_eq!(c.release(ghost, fh), Err(CoordError::NoSuchSession));
    assert_eq!(c.delete(ghost, fh), Err(CoordError::NoSuchSession));
    assert_eq!(c.end_session(ghost), Err(CoordError::NoSuchSession));
}
