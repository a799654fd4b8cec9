//! Per-thread transaction frames.
//!
//! Each nesting level of a transaction is a [`Frame`] holding the read set,
//! the write set, the transaction-local values and the hook queues for that
//! level. The frames of a thread form a stack in a thread-local slot; the
//! root frame is level 1.
//!
//! Two disciplines keep user destructors safe here:
//!
//! * Values owned by a frame are never dropped while the thread-local slot
//!   is borrowed. Operations that displace values hand them back to the
//!   caller (or into a [`Graveyard`]) to be dropped after the borrow ends.
//! * A frame is only cleared with the whole stack moved out of the
//!   thread-local slot ([`with_stack_aside`]). A `Drop` impl that starts a
//!   transaction then finds an empty slot and runs as a fresh root instead
//!   of chaining onto the frame that is being torn down.

use std::any::Any;
use std::cell::RefCell;
use std::mem;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::commit_lock::{self, ReadGuard, UpgradeGuard};
use super::Transaction;
use crate::result::StmResult;
use crate::tvar::{DynValue, Record, VarCore, VarKey};

pub(crate) type BeforeCommitFn = Box<dyn FnOnce(&mut Transaction) -> StmResult<()>>;
pub(crate) type AfterFn = Box<dyn FnOnce()>;
pub(crate) type OnFailFn = Box<dyn FnOnce()>;

/// A write staged by a transaction. The version is the snapshot version at
/// the time of the first write plus one; it is what reads inside the same
/// transaction observe. The version actually installed at commit is
/// recomputed under the exclusive lock.
pub(crate) struct StagedRecord {
    pub(crate) version: u64,
    pub(crate) value: DynValue,
}

pub(crate) struct Frame {
    pub(crate) level: usize,
    pub(crate) got: FxHashMap<VarKey, Arc<Record>>,
    pub(crate) set: FxHashMap<VarKey, StagedRecord>,
    pub(crate) locals: FxHashMap<u64, Box<dyn Any>>,
    pub(crate) before_commit: Vec<BeforeCommitFn>,
    pub(crate) afters: Vec<AfterFn>,
    pub(crate) on_fails: Vec<OnFailFn>,
}

impl Frame {
    fn new(level: usize) -> Frame {
        Frame {
            level,
            got: FxHashMap::default(),
            set: FxHashMap::default(),
            locals: FxHashMap::default(),
            before_commit: Vec::new(),
            afters: Vec::new(),
            on_fails: Vec::new(),
        }
    }

    /// Checks every read snapshot against the variable's current version.
    /// The caller holds the global lock in at least shared mode.
    pub(crate) fn gots_valid(&self) -> bool {
        self.got
            .iter()
            .all(|(key, record)| key.0.validate(record.version))
    }
}

/// Holding pen for values displaced from frames. Dropping it is what frees
/// them, so it must only be dropped outside any thread-local borrow and,
/// for frame teardown, inside [`with_stack_aside`].
#[derive(Default)]
pub(crate) struct Graveyard {
    records: Vec<Arc<Record>>,
    staged: Vec<StagedRecord>,
    keys: Vec<VarKey>,
    locals: Vec<Box<dyn Any>>,
    before_commit: Vec<BeforeCommitFn>,
    afters: Vec<AfterFn>,
    on_fails: Vec<OnFailFn>,
}

impl Graveyard {
    pub(crate) fn swallow_frame(&mut self, frame: Frame) {
        for (key, record) in frame.got {
            self.keys.push(key);
            self.records.push(record);
        }
        for (key, staged) in frame.set {
            self.keys.push(key);
            self.staged.push(staged);
        }
        self.locals.extend(frame.locals.into_values());
        self.before_commit.extend(frame.before_commit);
        self.afters.extend(frame.afters);
        self.on_fails.extend(frame.on_fails);
    }
}

/// The per-thread frame stack plus the thread's hold on the global lock.
///
/// The read lock is reference counted so that nested acquisitions share one
/// guard; while the upgrade lock is held the read lock is not needed and
/// read lock requests are no-ops. The upgrade guard belongs to the root
/// transaction.
#[derive(Default)]
pub(crate) struct TxStack {
    frames: Vec<Frame>,
    read_count: usize,
    read_guard: Option<ReadGuard>,
    upgrade_guard: Option<UpgradeGuard>,
}

impl TxStack {
    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Pushes a new frame and returns its level (1 = root).
    pub(crate) fn push_frame(&mut self) -> usize {
        let level = self.frames.len() + 1;
        self.frames.push(Frame::new(level));
        level
    }

    pub(crate) fn top(&self) -> &Frame {
        self.frames.last().expect("no transaction frame on this thread")
    }

    pub(crate) fn top_mut(&mut self) -> &mut Frame {
        self.frames
            .last_mut()
            .expect("no transaction frame on this thread")
    }

    /// The value visible to the current frame: its own pending write, then
    /// its own read snapshot, then the parents', innermost first.
    fn lookup_value(&self, key: &VarKey) -> Option<DynValue> {
        for frame in self.frames.iter().rev() {
            if let Some(staged) = frame.set.get(key) {
                return Some(staged.value.clone());
            }
            if let Some(record) = frame.got.get(key) {
                return Some(record.value.clone());
            }
        }
        None
    }

    /// The version this transaction (or an ancestor) snapshotted the
    /// variable at, if it was read.
    pub(crate) fn lookup_got_version(&self, key: &VarKey) -> Option<u64> {
        for frame in self.frames.iter().rev() {
            if let Some(record) = frame.got.get(key) {
                return Some(record.version);
            }
        }
        None
    }

    pub(crate) fn lookup_local(&self, key: u64) -> Option<&dyn Any> {
        for frame in self.frames.iter().rev() {
            if let Some(value) = frame.locals.get(&key) {
                return Some(value.as_ref());
            }
        }
        None
    }

    /// Stores a transaction-local value in the current frame, returning any
    /// displaced value for the caller to drop outside the borrow.
    pub(crate) fn set_local(&mut self, key: u64, value: Box<dyn Any>) -> Option<Box<dyn Any>> {
        self.top_mut().locals.insert(key, value)
    }

    // Global lock management.

    pub(crate) fn read_lock(&mut self) {
        if self.upgrade_guard.is_some() {
            return;
        }
        if self.read_count == 0 {
            self.read_guard = Some(commit_lock::read());
        }
        self.read_count += 1;
    }

    pub(crate) fn read_unlock(&mut self) {
        if self.upgrade_guard.is_some() {
            return;
        }
        debug_assert!(self.read_count > 0);
        self.read_count -= 1;
        if self.read_count == 0 {
            self.read_guard = None;
        }
    }

    pub(crate) fn upgrade_held(&self) -> bool {
        self.upgrade_guard.is_some()
    }

    /// Takes the upgrade lock for an upcoming commit (or to run locked).
    /// Any read lock is released first: it would deadlock the promotion to
    /// exclusive later.
    pub(crate) fn acquire_commit_lock(&mut self) {
        if self.upgrade_guard.is_some() {
            return;
        }
        self.read_guard = None;
        self.read_count = 0;
        self.upgrade_guard = Some(commit_lock::upgradable());
    }

    pub(crate) fn release_upgrade(&mut self) {
        self.upgrade_guard = None;
    }

    pub(crate) fn take_upgrade(&mut self) -> Option<UpgradeGuard> {
        self.upgrade_guard.take()
    }

    // Variable access for the current frame.

    pub(crate) fn read_var(&mut self, core: &Arc<VarCore>) -> DynValue {
        let key = VarKey(core.clone());
        if let Some(value) = self.lookup_value(&key) {
            return value;
        }
        self.read_lock();
        let record = core.load();
        self.read_unlock();
        let value = record.value.clone();
        self.top_mut().got.insert(key, record);
        value
    }

    /// Stages a write in the current frame, even when a parent frame
    /// already staged one — that is what gives sub-transactions their
    /// rollback behaviour. Returns a displaced value for the caller to drop
    /// outside the borrow.
    pub(crate) fn write_var(&mut self, core: &Arc<VarCore>, value: DynValue) -> Option<DynValue> {
        let key = VarKey(core.clone());
        if let Some(staged) = self.top_mut().set.get_mut(&key) {
            return Some(mem::replace(&mut staged.value, value));
        }
        self.read_lock();
        let version = core.version();
        self.read_unlock();
        self.top_mut().set.insert(
            key,
            StagedRecord {
                version: version + 1,
                value,
            },
        );
        None
    }

    /// The variables a retry must watch: everything read, plus everything
    /// written blindly (watched at the version the write was staged
    /// against).
    pub(crate) fn watch_list(&self) -> Vec<(Arc<VarCore>, u64)> {
        let top = self.top();
        let mut watch = Vec::with_capacity(top.got.len() + top.set.len());
        for (key, record) in &top.got {
            watch.push((key.0.clone(), record.version));
        }
        for (key, staged) in &top.set {
            if !top.got.contains_key(key) {
                watch.push((key.0.clone(), staged.version.saturating_sub(1)));
            }
        }
        watch
    }

    // Frame lifecycle.

    /// Folds a completed child frame into its parent: reads, writes, locals
    /// and hook queues all move up.
    pub(crate) fn merge_top_to_parent(&mut self) -> Graveyard {
        let child = self.frames.pop().expect("merge without a child frame");
        let parent = self
            .frames
            .last_mut()
            .expect("merge without a parent frame");
        let mut grave = Graveyard::default();
        for (key, record) in child.got {
            if let Some(old) = parent.got.insert(key, record) {
                grave.records.push(old);
            }
        }
        for (key, staged) in child.set {
            if let Some(old) = parent.set.insert(key, staged) {
                grave.staged.push(old);
            }
        }
        for (key, value) in child.locals {
            if let Some(old) = parent.locals.insert(key, value) {
                grave.locals.push(old);
            }
        }
        parent.before_commit.extend(child.before_commit);
        parent.afters.extend(child.afters);
        parent.on_fails.extend(child.on_fails);
        grave
    }

    /// Tears down a failed child frame. The reads stay recorded in the
    /// parent so the root driver can still conflict on — and wait on — the
    /// variables the child observed; everything else is discarded.
    pub(crate) fn abandon_top_into_parent(&mut self) -> Graveyard {
        let child = self.frames.pop().expect("abandon without a child frame");
        let parent = self
            .frames
            .last_mut()
            .expect("abandon without a parent frame");
        let mut grave = Graveyard::default();
        for (key, record) in child.got {
            if let Some(old) = parent.got.insert(key, record) {
                grave.records.push(old);
            }
        }
        for (key, staged) in child.set {
            grave.keys.push(key);
            grave.staged.push(staged);
        }
        grave.locals.extend(child.locals.into_values());
        grave.before_commit.extend(child.before_commit);
        grave.afters.extend(child.afters);
        grave.on_fails.extend(child.on_fails);
        grave
    }

    /// Empties the root frame for another attempt, releasing the thread's
    /// hold on the global lock.
    pub(crate) fn clear_top_for_restart(&mut self) -> Graveyard {
        let level = self.top().level;
        let old = mem::replace(self.top_mut(), Frame::new(level));
        self.read_guard = None;
        self.read_count = 0;
        if level == 1 {
            self.upgrade_guard = None;
        }
        let mut grave = Graveyard::default();
        grave.swallow_frame(old);
        grave
    }

    /// Removes the root frame after a commit or a terminal failure.
    pub(crate) fn pop_root(&mut self) -> Graveyard {
        debug_assert_eq!(self.frames.len(), 1);
        let frame = self.frames.pop().expect("pop without a frame");
        self.read_guard = None;
        self.read_count = 0;
        self.upgrade_guard = None;
        let mut grave = Graveyard::default();
        grave.swallow_frame(frame);
        grave
    }

    /// Takes the current frame's on-fail hooks; they fire at most once per
    /// attempt.
    pub(crate) fn take_on_fails(&mut self) -> Vec<OnFailFn> {
        mem::take(&mut self.top_mut().on_fails)
    }
}

thread_local! {
    static TX_STACK: RefCell<TxStack> = RefCell::new(TxStack::default());
}

/// Runs `f` with the thread's stack borrowed. `f` must not drop user-held
/// values or call back into user code.
pub(crate) fn with<R>(f: impl FnOnce(&mut TxStack) -> R) -> R {
    TX_STACK.with(|slot| f(&mut slot.borrow_mut()))
}

/// True while a transaction is running on this thread.
pub(crate) fn in_atomic() -> bool {
    TX_STACK.with(|slot| !slot.borrow().frames.is_empty())
}

/// Runs `f` with the stack moved out of the thread-local slot, restoring it
/// afterwards (also on unwind). Drops performed inside `f` — including the
/// drop of `f`'s return value if it is dropped inside — see an empty slot,
/// so destructors that start transactions get a fresh root.
pub(crate) fn with_stack_aside<R>(f: impl FnOnce(&mut TxStack) -> R) -> R {
    struct Restore {
        stack: Option<TxStack>,
    }

    impl Drop for Restore {
        fn drop(&mut self) {
            if let Some(stack) = self.stack.take() {
                let abandoned = TX_STACK.with(|slot| mem::replace(&mut *slot.borrow_mut(), stack));
                // Anything a nested root left behind is torn down now, with
                // the real stack back in place.
                drop(abandoned);
            }
        }
    }

    let mut restore = Restore {
        stack: Some(TX_STACK.with(|slot| slot.take())),
    };
    f(restore
        .stack
        .as_mut()
        .expect("stack was just moved aside"))
}
