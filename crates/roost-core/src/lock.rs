// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reader/writer lock bookkeeping for one namespace entry
//!
//! Admission is decided by the replicated state machine (non-blocking
//! try-acquire semantics); blocking callers park on the entry condvar until
//! the admission predicate holds and then submit their admission through
//! the log. Releasing the last owner wakes every waiter: the winner set
//! depends on the waiters' requested modes, which only each waiter's own
//! re-check can resolve.

use crate::error::{CoordError, CoordResult};
use crate::store::{Entry, EntryState};
use crate::types::{LockMode, SessionId};

/// Outcome of a non-blocking acquisition attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquisition {
    Granted,
    /// Lock contention: a first-class result, not an error.
    WouldBlock,
    /// The entry is deleted (`exists = false`).
    NoSuchFile,
}

/// Outcome of a release
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released {
        /// The owner set emptied; waiters have been woken.
        now_free: bool,
    },
    NotHolder,
    NoSuchFile,
}

/// Non-blocking acquisition against already-locked entry state.
///
/// Exclusive admits only an empty owner set; shared admits an empty set or
/// a set of shared owners. The first owner fixes the mode and bumps the
/// lock generation. Failure leaves the state untouched.
pub fn try_acquire(st: &mut EntryState, session: SessionId, mode: LockMode) -> Acquisition {
    if !st.exists {
        return Acquisition::NoSuchFile;
    }
    let admissible = match mode {
        LockMode::Exclusive => st.lock_owners.is_empty(),
        LockMode::Shared => st.lock_owners.is_empty() || !st.exclusive,
    };
    if !admissible {
        return Acquisition::WouldBlock;
    }
    if st.lock_owners.is_empty() {
        st.exclusive = mode.is_exclusive();
        st.lock_gen += 1;
    }
    st.lock_owners.insert(session);
    Acquisition::Granted
}

/// Remove `session` from the owner set against already-locked entry state.
pub fn release(st: &mut EntryState, session: SessionId) -> ReleaseOutcome {
    if !st.exists {
        return ReleaseOutcome::NoSuchFile;
    }
    if !st.lock_owners.remove(&session) {
        return ReleaseOutcome::NotHolder;
    }
    ReleaseOutcome::Released {
        now_free: st.lock_owners.is_empty(),
    }
}

impl Entry {
    /// Non-blocking acquire under the entry lock.
    pub fn try_acquire(&self, session: SessionId, mode: LockMode) -> Acquisition {
        self.with_state(|st| try_acquire(st, session, mode))
    }

    /// Release under the entry lock, waking all waiters if the owner set
    /// emptied.
    pub fn release(&self, session: SessionId) -> ReleaseOutcome {
        let outcome = self.with_state(|st| release(st, session));
        if matches!(outcome, ReleaseOutcome::Released { now_free: true }) {
            self.wake_lock_waiters();
        }
        outcome
    }

    /// Park until the admission predicate for `mode` holds.
    ///
    /// The entry may be deleted (and even recreated) while waiting, so
    /// existence and the caller's captured instance are re-checked after
    /// every wake and fail distinctly. Returning `Ok` does not grant the
    /// lock; admission itself is committed through the log and may still
    /// lose to a competing admission, in which case the caller waits again.
    pub fn await_admission(&self, mode: LockMode, expected_instance: i64) -> CoordResult<()> {
        let mut st = self.state.lock().unwrap();
        loop {
            let admissible = match mode {
                LockMode::Exclusive => st.lock_owners.is_empty(),
                LockMode::Shared => st.lock_owners.is_empty() || !st.exclusive,
            };
            if admissible {
                if !st.exists {
                    return Err(CoordError::NoSuchFile);
                }
                if st.instance != expected_instance {
                    return Err(CoordError::StaleHandle);
                }
                return Ok(());
            }
            st = self.lock_cv.wait(st).unwrap();
        }
    }
}
