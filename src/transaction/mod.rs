//! The transaction engine: per-thread frames, the driver loop and the
//! commit protocol.

pub(crate) mod commit_lock;
pub(crate) mod frame;
mod local;

pub use local::{TransactionLocalFlag, TransactionLocalValue};

use std::convert::Infallible;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use crate::profiling;
use crate::result::{
    AtomicRunError, CantContinueError, StmError, StmResult, TransactionClosureResult,
    TransactionError,
};
use crate::time::TimeArg;
use crate::tvar::{DynValue, Record, VarCore, VarKey};

/// What the driver does when a run reaches its conflict limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Stop the run with [`CantContinueError::MaxConflicts`].
    Fail,
    /// Acquire the commit lock before the next attempt, locking every other
    /// writer out so the attempt is guaranteed to commit.
    RunLocked,
}

/// Limits for a transaction run.
///
/// `max_retry_wait` is an absolute bound for the whole run: each retry wait
/// blocks until the earlier of the retry's own deadline and this bound.
/// When both are unlimited the wait is unbounded — that is the documented
/// contract, not an oversight.
#[derive(Clone, Copy, Debug)]
pub struct AtomicOptions {
    pub max_conflicts: Option<u32>,
    pub conflict_resolution: ConflictResolution,
    pub max_retries: Option<u32>,
    pub max_retry_wait: TimeArg,
}

impl Default for AtomicOptions {
    fn default() -> Self {
        AtomicOptions {
            max_conflicts: None,
            conflict_resolution: ConflictResolution::Fail,
            max_retries: None,
            max_retry_wait: TimeArg::UNLIMITED,
        }
    }
}

impl AtomicOptions {
    pub fn new() -> AtomicOptions {
        AtomicOptions::default()
    }

    /// Limits the number of conflict restarts before `resolution` kicks in.
    pub fn max_conflicts(mut self, limit: u32, resolution: ConflictResolution) -> Self {
        self.max_conflicts = Some(limit);
        self.conflict_resolution = resolution;
        self
    }

    /// Limits how often the run may call `retry`.
    pub fn max_retries(mut self, limit: u32) -> Self {
        self.max_retries = Some(limit);
        self
    }

    /// Bounds every retry wait of the run.
    pub fn max_retry_wait(mut self, limit: impl Into<TimeArg>) -> Self {
        self.max_retry_wait = limit.into();
        self
    }
}

/// Handle to the transaction running on the current thread. Bodies passed
/// to the `atomically` family receive one of these; every variable access
/// goes through it.
///
/// The handle is deliberately `!Send`: frames live in thread-local storage.
pub struct Transaction {
    _not_send: PhantomData<*mut ()>,
}

impl Transaction {
    fn new() -> Transaction {
        Transaction {
            _not_send: PhantomData,
        }
    }

    /// Re-checks every variable this transaction has read; fails the
    /// attempt immediately if any of them changed. The driver validates at
    /// commit anyway — call this from long bodies to stop wasting work on a
    /// doomed attempt, or after reading a group of variables whose
    /// invariant you are about to rely on.
    pub fn validate(&mut self) -> StmResult<()> {
        let valid = frame::with(|stack| {
            if stack.upgrade_held() {
                stack.top().gots_valid()
            } else {
                stack.read_lock();
                let valid = stack.top().gots_valid();
                stack.read_unlock();
                valid
            }
        });
        if valid {
            Ok(())
        } else {
            Err(StmError::Failure)
        }
    }

    /// Registers a hook to run inside this transaction just before the
    /// root commit starts. The hook gets the transaction handle; reads and
    /// writes it performs are part of the same commit.
    pub fn before_commit<F>(&mut self, f: F)
    where
        F: FnOnce(&mut Transaction) -> StmResult<()> + 'static,
    {
        frame::with(|stack| stack.top_mut().before_commit.push(Box::new(f)));
    }

    /// Registers a hook to run after the root transaction has committed.
    /// After-hooks run outside any transaction, exactly once per successful
    /// commit; they never run for an abandoned attempt.
    pub fn after<F>(&mut self, f: F)
    where
        F: FnOnce() + 'static,
    {
        frame::with(|stack| stack.top_mut().afters.push(Box::new(f)));
    }

    /// Registers a hook to run if the current attempt fails — conflict,
    /// retry, abort or panic. Fires at most once and is dropped afterwards;
    /// a restarted body re-registers its hooks naturally by re-running.
    pub fn on_fail<F>(&mut self, f: F)
    where
        F: FnOnce() + 'static,
    {
        frame::with(|stack| stack.top_mut().on_fails.push(Box::new(f)));
    }

    /// Runs `f` in a sub-transaction. On success the sub-transaction's
    /// reads, writes, locals and hooks merge into this transaction; on
    /// failure its writes are rolled back while its reads stay recorded (so
    /// the root driver can still detect conflicts on them and wait on
    /// them). `Failure` and `Retry` propagate to the root driver through
    /// the returned result — keep passing them up with `?`.
    pub fn atomic<T, F>(&mut self, f: F) -> StmResult<T>
    where
        F: FnOnce(&mut Transaction) -> StmResult<T>,
    {
        match run_child::<T, Infallible, _>(|tx| f(tx).map_err(TransactionError::Stm)) {
            Ok(value) => Ok(value),
            Err(TransactionError::Stm(signal)) => Err(signal),
            Err(TransactionError::Abort(never)) => match never {},
        }
    }

    /// [`Transaction::atomic`] for bodies that can abort with an error. An
    /// abort tears the sub-transaction down (reads stay recorded) and
    /// returns the error to this transaction, which may recover or keep
    /// propagating it.
    pub fn atomic_with_err<T, E, F>(&mut self, f: F) -> TransactionClosureResult<T, E>
    where
        F: FnOnce(&mut Transaction) -> TransactionClosureResult<T, E>,
    {
        run_child(f)
    }

    // Variable access, used by `Var`.

    pub(crate) fn read_var(&mut self, core: &Arc<VarCore>) -> DynValue {
        frame::with(|stack| stack.read_var(core))
    }

    pub(crate) fn write_var(&mut self, core: &Arc<VarCore>, value: DynValue) {
        let displaced = frame::with(|stack| stack.write_var(core, value));
        // Dropped here, outside the stack borrow: this may run a user
        // destructor.
        drop(displaced);
    }

    pub(crate) fn validate_var(&mut self, core: &Arc<VarCore>) -> StmResult<()> {
        let snapshot = frame::with(|stack| stack.lookup_got_version(&VarKey(core.clone())));
        let Some(version) = snapshot else {
            return Ok(());
        };
        let valid = frame::with(|stack| {
            if stack.upgrade_held() {
                core.validate(version)
            } else {
                stack.read_lock();
                let valid = core.validate(version);
                stack.read_unlock();
                valid
            }
        });
        if valid {
            Ok(())
        } else {
            Err(StmError::Failure)
        }
    }

}

/// True while a transaction is running on the current thread.
pub fn in_atomic() -> bool {
    frame::in_atomic()
}

/// Runs `f` atomically: all writes commit together or not at all, and all
/// reads are validated to have been consistent at commit time. The body
/// re-runs on conflict, so it must be free of side effects other than
/// variable access; use [`Transaction::after`] for work that must happen
/// exactly once.
///
/// Called inside a running transaction this nests as a sub-transaction
/// (needed by destructors that use transactions). Compose fallible nested
/// work with [`Transaction::atomic`] instead where you can: a `retry` or
/// conflict signal cannot travel through this function's plain return type,
/// and escaping one panics.
pub fn atomically<T, F>(f: F) -> T
where
    F: Fn(&mut Transaction) -> StmResult<T>,
{
    if frame::in_atomic() {
        return match run_child::<T, Infallible, _>(|tx| f(tx).map_err(TransactionError::Stm)) {
            Ok(value) => value,
            Err(TransactionError::Stm(signal)) => implicit_child_signal(signal),
            Err(TransactionError::Abort(never)) => match never {},
        };
    }
    match run_root::<T, Infallible, _>(&AtomicOptions::default(), |tx| {
        f(tx).map_err(TransactionError::Stm)
    }) {
        Ok(value) => value,
        Err(AtomicRunError::Stopped(stop)) => {
            panic!("transaction could not continue: {stop}; run it with atomically_with_opts to handle limits")
        }
        Err(AtomicRunError::Aborted(never)) => match never {},
    }
}

/// [`atomically`] for bodies that can abort with an error: the first abort
/// ends the run (after the on-fail hooks) and the error is returned.
pub fn atomically_with_err<T, E, F>(f: F) -> Result<T, E>
where
    F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
{
    if frame::in_atomic() {
        return match run_child(f) {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Stm(signal)) => implicit_child_signal(signal),
        };
    }
    match run_root(&AtomicOptions::default(), f) {
        Ok(value) => Ok(value),
        Err(AtomicRunError::Aborted(e)) => Err(e),
        Err(AtomicRunError::Stopped(stop)) => {
            panic!("transaction could not continue: {stop}; run it with atomically_with_opts_and_err to handle limits")
        }
    }
}

/// [`atomically`] with run limits. Limits only apply to a root run; a
/// nested call runs as a plain sub-transaction of the enclosing root.
pub fn atomically_with_opts<T, F>(options: &AtomicOptions, f: F) -> Result<T, CantContinueError>
where
    F: Fn(&mut Transaction) -> StmResult<T>,
{
    if frame::in_atomic() {
        return match run_child::<T, Infallible, _>(|tx| f(tx).map_err(TransactionError::Stm)) {
            Ok(value) => Ok(value),
            Err(TransactionError::Stm(signal)) => implicit_child_signal(signal),
            Err(TransactionError::Abort(never)) => match never {},
        };
    }
    match run_root::<T, Infallible, _>(options, |tx| f(tx).map_err(TransactionError::Stm)) {
        Ok(value) => Ok(value),
        Err(AtomicRunError::Stopped(stop)) => Err(stop),
        Err(AtomicRunError::Aborted(never)) => match never {},
    }
}

/// [`atomically_with_err`] with run limits.
pub fn atomically_with_opts_and_err<T, E, F>(
    options: &AtomicOptions,
    f: F,
) -> Result<T, AtomicRunError<E>>
where
    F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
{
    if frame::in_atomic() {
        return match run_child(f) {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(e)) => Err(AtomicRunError::Aborted(e)),
            Err(TransactionError::Stm(signal)) => implicit_child_signal(signal),
        };
    }
    run_root(options, f)
}

fn implicit_child_signal(signal: StmError) -> ! {
    panic!(
        "control signal ({signal}) escaped a nested atomically call; \
         compose sub-transactions with Transaction::atomic so the signal \
         can reach the root transaction"
    )
}

/// Cleans up the current frame when a run leaves without committing:
/// on-fail hooks, then teardown with the reads folded into the parent (for
/// a child) or the frame popped (for the root). Runs on every exit path,
/// including panics out of the body.
struct FrameGuard {
    armed: bool,
}

impl FrameGuard {
    fn new() -> FrameGuard {
        FrameGuard { armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // A panic after the frame is already gone (an after-hook, or a
        // destructor running while the stack is aside) has nothing left to
        // clean up.
        if frame::with(|stack| stack.depth()) == 0 {
            return;
        }
        run_on_fails();
        frame::with_stack_aside(|stack| {
            if stack.top().level > 1 {
                let grave = stack.abandon_top_into_parent();
                drop(grave);
            } else {
                let grave = stack.pop_root();
                drop(grave);
            }
        });
    }
}

/// Fires the current frame's on-fail hooks with the stack moved aside, so
/// hooks can freely run their own transactions. Releases the thread's
/// upgrade lock first: a hook committing writes would otherwise deadlock
/// against our own lock.
fn run_on_fails() {
    let hooks = frame::with(|stack| {
        stack.release_upgrade();
        stack.take_on_fails()
    });
    if hooks.is_empty() {
        return;
    }
    frame::with_stack_aside(|_| {
        for hook in hooks {
            hook();
        }
    });
}

/// Runs `body` in a child frame of the running transaction.
fn run_child<T, E, F>(body: F) -> TransactionClosureResult<T, E>
where
    F: FnOnce(&mut Transaction) -> TransactionClosureResult<T, E>,
{
    let level = frame::with(|stack| stack.push_frame());
    debug_assert!(level > 1);
    let mut tx = Transaction::new();
    let guard = FrameGuard::new();

    match body(&mut tx) {
        Ok(value) => {
            guard.disarm();
            frame::with_stack_aside(|stack| {
                let grave = stack.merge_top_to_parent();
                drop(grave);
            });
            Ok(value)
        }
        Err(err) => {
            // The guard runs the on-fail hooks and folds the reads into
            // the parent.
            drop(guard);
            Err(err)
        }
    }
}

/// The root driver loop: run the body, commit, and on conflict or retry
/// start over within the configured limits.
fn run_root<T, E, F>(options: &AtomicOptions, body: F) -> Result<T, AtomicRunError<E>>
where
    F: Fn(&mut Transaction) -> TransactionClosureResult<T, E>,
{
    let level = frame::with(|stack| stack.push_frame());
    debug_assert_eq!(level, 1);
    let mut tx = Transaction::new();
    let guard = FrameGuard::new();

    let mut bad_commits: u32 = 0;
    let mut retries: u32 = 0;

    loop {
        if let Some(max) = options.max_conflicts {
            if bad_commits >= max {
                match options.conflict_resolution {
                    ConflictResolution::Fail => {
                        return Err(CantContinueError::MaxConflicts(bad_commits).into());
                    }
                    ConflictResolution::RunLocked => {
                        log::warn!(
                            "transaction hit its conflict limit ({bad_commits}), running locked"
                        );
                        frame::with(|stack| stack.acquire_commit_lock());
                    }
                }
            }
        }

        let signal = match body(&mut tx) {
            Ok(value) => match commit(&mut tx) {
                Ok(true) => {
                    guard.disarm();
                    return Ok(value);
                }
                Ok(false) => StmError::Failure,
                // A before-commit hook raised a signal.
                Err(signal) => signal,
            },
            Err(TransactionError::Abort(e)) => {
                // The guard runs the on-fail hooks and tears the frame
                // down; the error escapes untouched.
                return Err(AtomicRunError::Aborted(e));
            }
            Err(TransactionError::Stm(signal)) => signal,
        };

        match signal {
            StmError::Failure => {
                bad_commits += 1;
                profiling::record_conflict();
                run_on_fails();
                restart_root();
            }
            StmError::Retry(deadline) => {
                retries += 1;
                if let Some(max) = options.max_retries {
                    if retries >= max {
                        return Err(CantContinueError::MaxRetries(retries).into());
                    }
                }
                run_on_fails();
                let limit = std::cmp::min(deadline, options.max_retry_wait);
                if !wait_for_changes(limit) {
                    return Err(CantContinueError::RetryTimeout.into());
                }
                restart_root();
            }
        }
    }
}

fn restart_root() {
    frame::with_stack_aside(|stack| {
        let grave = stack.clear_top_for_restart();
        drop(grave);
    });
}

/// Blocks until one of the variables the transaction touched changes, or
/// the deadline passes. Returns false on timeout.
fn wait_for_changes(deadline: TimeArg) -> bool {
    let watch = frame::with(|stack| {
        stack.release_upgrade();
        stack.watch_list()
    });
    loop {
        let seen = commit_lock::generation();
        {
            let _shared = commit_lock::read();
            if watch
                .iter()
                .any(|(core, version)| !core.validate(*version))
            {
                return true;
            }
        }
        if !commit_lock::wait_past(seen, deadline) {
            return false;
        }
    }
}

/// The root commit protocol. Returns `Ok(true)` on success (the frame is
/// gone and the after-hooks have run), `Ok(false)` on a validation
/// conflict, and `Err` when a before-commit hook raised a signal.
fn commit(tx: &mut Transaction) -> Result<bool, StmError> {
    // Before-commit hooks run inside the transaction, in registration
    // order. Hooks they register themselves do not run in this commit.
    let hooks = frame::with(|stack| mem::take(&mut stack.top_mut().before_commit));
    for hook in hooks {
        hook(tx)?;
    }

    let has_writes = frame::with(|stack| !stack.top().set.is_empty());
    let mut dead: Vec<(VarKey, Arc<Record>)> = Vec::new();

    if has_writes {
        frame::with(|stack| stack.acquire_commit_lock());
        let valid = frame::with(|stack| stack.top().gots_valid());
        if !valid {
            frame::with(|stack| stack.release_upgrade());
            return Ok(false);
        }
        frame::with(|stack| {
            let upgrade = stack.take_upgrade().expect("commit lock must be held");
            let exclusive = commit_lock::upgrade(upgrade);
            let top = stack.top_mut();
            dead.reserve(top.set.len());
            for (key, staged) in top.set.drain() {
                let old = key.0.install(staged.value);
                dead.push((key, old));
            }
            commit_lock::notify_commit();
            drop(exclusive);
        });
        profiling::record_write_commit();
    } else {
        let valid = frame::with(|stack| {
            if stack.upgrade_held() {
                let valid = stack.top().gots_valid();
                stack.release_upgrade();
                valid
            } else {
                stack.read_lock();
                let valid = stack.top().gots_valid();
                stack.read_unlock();
                valid
            }
        });
        if !valid {
            return Ok(false);
        }
        profiling::record_read_commit();
    }

    // Teardown order matters: frame first (after-hooks must see no
    // transaction), then the displaced records (their destructors may run
    // transactions and after-hooks rely on the old values being gone), then
    // the after-hooks.
    let afters = frame::with(|stack| mem::take(&mut stack.top_mut().afters));
    frame::with_stack_aside(|stack| {
        let grave = stack.pop_root();
        drop(grave);
    });
    drop(dead);
    for after in afters {
        after();
    }
    Ok(true)
}
