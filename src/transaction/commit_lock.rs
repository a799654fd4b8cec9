//! The global commit lock and the commit signal.
//!
//! One readers-writer lock serialises every commit in the process. It is
//! used in three modes:
//!
//! * *shared* — held briefly for each variable read and for validation;
//! * *upgradable* — held by the one transaction that intends to commit
//!   writes (or that is running locked after too many conflicts); shared
//!   readers still proceed;
//! * *exclusive* — the upgradable holder promotes for the final record
//!   swap, excluding everything else.
//!
//! The commit signal is a generation counter: each write-commit bumps it
//! while still holding the lock exclusively and notifies. A retrying
//! transaction validates its reads under a shared lock, then sleeps until
//! the generation moves past the one it observed before validating, so a
//! commit that lands between validation and sleep cannot be missed.

use parking_lot::{
    Condvar, Mutex, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard,
};

use crate::time::TimeArg;

static COMMIT_LOCK: RwLock<()> = RwLock::new(());

pub(crate) type ReadGuard = RwLockReadGuard<'static, ()>;
pub(crate) type UpgradeGuard = RwLockUpgradableReadGuard<'static, ()>;
pub(crate) type WriteGuard = RwLockWriteGuard<'static, ()>;

pub(crate) fn read() -> ReadGuard {
    COMMIT_LOCK.read()
}

pub(crate) fn upgradable() -> UpgradeGuard {
    COMMIT_LOCK.upgradable_read()
}

pub(crate) fn upgrade(guard: UpgradeGuard) -> WriteGuard {
    RwLockUpgradableReadGuard::upgrade(guard)
}

struct Signal {
    generation: Mutex<u64>,
    changed: Condvar,
}

static COMMIT_SIGNAL: Signal = Signal {
    generation: Mutex::new(0),
    changed: Condvar::new(),
};

/// The current commit generation. Sample this *before* validating reads.
pub(crate) fn generation() -> u64 {
    *COMMIT_SIGNAL.generation.lock()
}

/// Announces a successful write-commit. Called while the exclusive lock is
/// still held; woken waiters re-validate under a shared lock and therefore
/// proceed only once the exclusive phase has released.
pub(crate) fn notify_commit() {
    let mut generation = COMMIT_SIGNAL.generation.lock();
    *generation += 1;
    COMMIT_SIGNAL.changed.notify_all();
}

/// Blocks until the commit generation moves past `seen` or `deadline`
/// passes. Returns false only when the deadline passed with the generation
/// unchanged.
pub(crate) fn wait_past(seen: u64, deadline: TimeArg) -> bool {
    let mut generation = COMMIT_SIGNAL.generation.lock();
    while *generation == seen {
        match deadline.deadline() {
            None => COMMIT_SIGNAL.changed.wait(&mut generation),
            Some(instant) => {
                if COMMIT_SIGNAL
                    .changed
                    .wait_until(&mut generation, instant)
                    .timed_out()
                {
                    return *generation != seen;
                }
            }
        }
    }
    true
}
