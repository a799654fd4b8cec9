//! Software transactional memory with versioned variables, plus two
//! messaging primitives built on top of it: a transactional multi-cast
//! channel and a deferred result (promise/future) pair.
//!
//! # Transactions
//!
//! Shared state lives in [`Var`] cells. A body passed to [`atomically`]
//! reads and writes them through a [`Transaction`] handle; the writes
//! become visible to other threads all at once when the body finishes and
//! its reads validate, or not at all. If another thread committed a change
//! to something the body read, the body is run again from scratch.
//!
//! ```
//! use vstm::{atomically, Var};
//!
//! let var = Var::new(1);
//!
//! let seen = atomically(|tx| {
//!     let x = var.read(tx)?;
//!     var.write(tx, x + 3)?;
//!     Ok(x)
//! });
//!
//! assert_eq!(seen, 1);
//! assert_eq!(var.read_atomic(), 4);
//! ```
//!
//! Because bodies re-run, they must not have side effects beyond `Var`
//! access: no I/O, no channels, no locks. Hand side effects to
//! [`Transaction::after`] (runs once, after the commit) or return them as
//! values. Panicking inside a body is safe: the attempt is abandoned and
//! nothing is committed.
//!
//! A body that cannot proceed yet calls [`retry`]: the transaction blocks
//! until another thread commits a change to one of the variables the body
//! had read, then starts over. [`guard`] and [`unwrap_or_retry`] are small
//! conveniences over `retry`. Limits on conflicts, retries and wait times
//! are available through [`atomically_with_opts`].
//!
//! Transactions nest: [`Transaction::atomic`] runs a body as a
//! sub-transaction that merges into its parent on success and rolls back
//! (keeping its reads recorded) on failure. Hooks
//! ([`Transaction::before_commit`], [`Transaction::after`],
//! [`Transaction::on_fail`]) and [`TransactionLocalValue`] round out the
//! engine.
//!
//! # Built on top
//!
//! [`Channel`] is a multi-cast FIFO: every reader created from a channel
//! sees every message written after the reader existed, in commit order.
//! [`DeferredValue`]/[`DeferredResult`] are a promise/future pair with
//! subscriber callbacks and broken-promise detection. Both compose with
//! enclosing transactions like any other `Var`-based code.
//!
//! # Consistency model
//!
//! Reads are snapshots: the first read of a variable in a transaction
//! pins the value the rest of the body sees. Commits are serialised by a
//! single process-wide readers-writer lock, and a commit installs new
//! values only after every snapshot has been re-validated against the
//! current versions. Reads outside any transaction are available through
//! [`inconsistently`], which trades the consistency guarantee for not
//! having to restart.

#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

mod capture;
mod channel;
mod deferred;
mod inconsistent;
mod list;
pub mod profiling;
mod result;
#[cfg(test)]
mod test;
mod time;
mod transaction;
mod tvar;

pub use capture::ExceptionCapture;
pub use channel::{
    Channel, ChannelReader, ChannelWriter, ReadOnlyChannel, ReaderInitFn, SignalConnection,
};
pub use deferred::{
    done_deferred, fail_deferred, DeferredConnection, DeferredResult, DeferredValue, DoneCallback,
};
pub use inconsistent::{inconsistently, Inconsistent};
pub use list::PersistentList;
pub use result::{
    AtomicRunError, BrokenPromiseError, CantContinueError, CapturedError, DeferredError,
    InAtomicError, InvalidChannelError, StmError, StmResult, TransactionClosureResult,
    TransactionError,
};
pub use time::TimeArg;
pub use transaction::{
    atomically, atomically_with_err, atomically_with_opts, atomically_with_opts_and_err,
    in_atomic, AtomicOptions, ConflictResolution, Transaction, TransactionLocalFlag,
    TransactionLocalValue,
};
pub use tvar::Var;

/// Abandons the attempt and blocks until one of the variables the
/// transaction has touched changes, then re-runs the body.
///
/// # Examples
///
/// ```no_run
/// # use vstm::*;
/// # let ready = Var::new(false);
/// let value = atomically(|tx| {
///     if ready.read(tx)? {
///         Ok(42)
///     } else {
///         retry()
///     }
/// });
/// ```
#[inline]
pub fn retry<T>() -> StmResult<T> {
    Err(StmError::Retry(TimeArg::UNLIMITED))
}

/// [`retry`] with a deadline. If the wait reaches the deadline the run
/// fails with [`CantContinueError::RetryTimeout`].
#[inline]
pub fn retry_until<T>(deadline: impl Into<TimeArg>) -> StmResult<T> {
    Err(StmError::Retry(deadline.into()))
}

/// Retries until `cond` is true.
///
/// # Examples
///
/// ```
/// # use vstm::*;
/// let var = Var::new(42);
///
/// let x = atomically(|tx| {
///     let v = var.read(tx)?;
///     guard(v == 42)?;
///     // v is now always 42.
///     Ok(v)
/// });
/// assert_eq!(x, 42);
/// ```
#[inline]
pub fn guard(cond: bool) -> StmResult<()> {
    if cond {
        Ok(())
    } else {
        retry()
    }
}

/// Unwraps an `Option` or retries until it is `Some`.
///
/// # Examples
///
/// ```
/// # use vstm::*;
/// let x = Var::new(Some(42));
///
/// atomically(|tx| {
///     let inner = unwrap_or_retry(x.read(tx)?)?;
///     assert_eq!(inner, 42); // inner is always 42.
///     Ok(inner)
/// });
/// ```
#[inline]
pub fn unwrap_or_retry<T>(option: Option<T>) -> StmResult<T> {
    match option {
        Some(value) => Ok(value),
        None => retry(),
    }
}

#[cfg(test)]
mod test_lib {
    use std::panic::{catch_unwind, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::test::{async_test, terminates};

    #[test]
    fn increment_returns_old_value_and_commits_new() {
        let v = Var::new(1);
        let seen = atomically(|tx| {
            let x = v.read(tx)?;
            v.write(tx, x + 3)?;
            Ok(x)
        });
        assert_eq!(seen, 1);
        assert_eq!(v.read_atomic(), 4);
    }

    /// Both writers read both variables before either commits; exactly one
    /// of them must restart exactly once.
    #[test]
    fn two_writers_conflict_once() {
        let v1 = Var::new(1);
        let v2 = Var::new(1);
        let a_read = Arc::new(AtomicBool::new(false));
        let b_read = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicUsize::new(0));

        let spawn_writer = |mine: Var<i32>,
                            other: Var<i32>,
                            my_flag: Arc<AtomicBool>,
                            other_flag: Arc<AtomicBool>,
                            attempts: Arc<AtomicUsize>| {
            thread::spawn(move || {
                atomically(|tx| {
                    let sum = mine.read(tx)? + other.read(tx)?;
                    attempts.fetch_add(1, Ordering::SeqCst);
                    my_flag.store(true, Ordering::SeqCst);
                    while !other_flag.load(Ordering::SeqCst) {
                        thread::yield_now();
                    }
                    mine.write(tx, sum)
                });
            })
        };

        let a = spawn_writer(
            v1.clone(),
            v2.clone(),
            a_read.clone(),
            b_read.clone(),
            attempts.clone(),
        );
        let b = spawn_writer(
            v2.clone(),
            v1.clone(),
            b_read.clone(),
            a_read.clone(),
            attempts.clone(),
        );
        a.join().unwrap();
        b.join().unwrap();

        let outcome = (v1.read_atomic(), v2.read_atomic());
        assert!(outcome == (2, 3) || outcome == (3, 2), "got {outcome:?}");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_wakes_on_write() {
        let v = Var::new(0);
        let v_reader = v.clone();

        let got = async_test(
            2000,
            move || {
                atomically(|tx| {
                    let x = v_reader.read(tx)?;
                    if x == 0 {
                        retry()
                    } else {
                        Ok(x)
                    }
                })
            },
            move || {
                thread::sleep(Duration::from_millis(30));
                v.write_atomic(10);
            },
        );

        assert_eq!(got, Some(10));
    }

    #[test]
    fn retry_times_out_without_a_write() {
        let v = Var::new(0);
        let options = AtomicOptions::new().max_retry_wait(Duration::from_millis(10));
        let result: Result<i32, _> = atomically_with_opts(&options, |tx| {
            if v.read(tx)? == 0 {
                retry()
            } else {
                v.read(tx)
            }
        });
        assert_eq!(result, Err(CantContinueError::RetryTimeout));
    }

    #[test]
    fn channel_delivers_in_order() {
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);

        channel.write_atomic(1);
        channel.write_atomic(2);
        channel.write_atomic(3);

        assert_eq!(reader.read_all_atomic().unwrap(), [1, 2, 3]);
        assert_eq!(
            reader.read_atomic(TimeArg::within(Duration::ZERO)).unwrap(),
            None
        );
    }

    #[test]
    fn deferred_success_notifies_every_subscriber_once() {
        let value = DeferredValue::new();
        let result = value.result();
        let log = Arc::new(Mutex::new(Vec::new()));

        for name in ["first", "second"] {
            let log = log.clone();
            result
                .on_done_atomic(move || log.lock().unwrap().push(name))
                .unwrap();
        }

        value.done_atomic(42).unwrap();
        assert_eq!(result.get_result_atomic().unwrap(), 42);
        {
            let mut entries = log.lock().unwrap();
            entries.sort_unstable();
            assert_eq!(*entries, ["first", "second"]);
        }

        // A subscriber registered after completion fires immediately.
        let log_late = log.clone();
        result
            .on_done_atomic(move || log_late.lock().unwrap().push("late"))
            .unwrap();
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn panic_aborts_without_committing() {
        let v = Var::new(1);
        let fails = Arc::new(AtomicUsize::new(0));

        let fails_hook = fails.clone();
        let result = catch_unwind(AssertUnwindSafe(|| {
            atomically::<(), _>(|tx| {
                let fails_hook = fails_hook.clone();
                tx.on_fail(move || {
                    fails_hook.fetch_add(1, Ordering::SeqCst);
                });
                v.write(tx, 99)?;
                panic!("boom")
            })
        }));

        assert!(result.is_err());
        assert_eq!(v.read_atomic(), 1);
        assert_eq!(fails.load(Ordering::SeqCst), 1);
        // The engine is healthy afterwards.
        assert_eq!(atomically(|tx| v.read(tx)), 1);
    }

    /// Reading the same variable twice in one transaction returns the same
    /// snapshot even when another thread committed in between; the commit
    /// then restarts the transaction.
    #[test]
    fn reads_are_snapshots_within_a_transaction() {
        let v = Var::new(1);
        let first_read_done = Arc::new(AtomicBool::new(false));
        let external_write_done = Arc::new(AtomicBool::new(false));
        let pairs = Arc::new(Mutex::new(Vec::new()));

        let v_writer = v.clone();
        let first_read_done_w = first_read_done.clone();
        let external_write_done_w = external_write_done.clone();
        let writer = thread::spawn(move || {
            while !first_read_done_w.load(Ordering::SeqCst) {
                thread::yield_now();
            }
            v_writer.write_atomic(2);
            external_write_done_w.store(true, Ordering::SeqCst);
        });

        let final_value = atomically(|tx| {
            let a = v.read(tx)?;
            if !first_read_done.load(Ordering::SeqCst) {
                first_read_done.store(true, Ordering::SeqCst);
                while !external_write_done.load(Ordering::SeqCst) {
                    thread::yield_now();
                }
            }
            let b = v.read(tx)?;
            pairs.lock().unwrap().push((a, b));
            Ok(b)
        });
        writer.join().unwrap();

        let pairs = pairs.lock().unwrap();
        // First attempt saw the pinned snapshot twice, then conflicted.
        assert_eq!(pairs[0], (1, 1));
        assert_eq!(*pairs.last().unwrap(), (2, 2));
        assert_eq!(final_value, 2);
    }

    #[test]
    fn counter_survives_contention() {
        let v = Var::new(0);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let v = v.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        atomically(|tx| v.modify(tx, |x| x + 1));
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }
        assert_eq!(v.read_atomic(), 800);
    }

    /// A transaction whose reads were invalidated mid-flight re-runs and
    /// commits against the fresh state.
    #[test]
    fn read_write_interference_restarts() {
        let v = Var::new(0);
        let v_slow = v.clone();

        let slow = thread::spawn(move || {
            atomically(|tx| {
                let x = v_slow.read(tx)?;
                thread::sleep(Duration::from_millis(300));
                v_slow.write(tx, x + 10)
            });
        });

        thread::sleep(Duration::from_millis(100));
        v.write_atomic(32);

        slow.join().unwrap();
        assert_eq!(v.read_atomic(), 42);
    }

    #[test]
    fn infinite_retry_blocks_forever() {
        let terminated = terminates(300, || {
            let _: i32 = atomically(|_| retry());
        });
        assert!(!terminated);
    }

    #[test]
    fn guard_and_unwrap_helpers() {
        assert_eq!(guard(true), Ok(()));
        assert_eq!(guard(false), retry());
        assert_eq!(unwrap_or_retry(Some(42)), Ok(42));
        assert_eq!(unwrap_or_retry::<i32>(None), retry());
    }

    #[test]
    fn write_only_transactions_do_not_conflict() {
        let v = Var::new(0);
        let threads: Vec<_> = (0..4)
            .map(|i| {
                let v = v.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        atomically(|tx| v.write(tx, i));
                    }
                })
            })
            .collect();
        for handle in threads {
            handle.join().unwrap();
        }
        assert!(v.read_atomic() < 4);
    }
}
