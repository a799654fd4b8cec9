use std::any::Any;
use std::fmt::{self, Debug};
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::inconsistent::Inconsistent;
use crate::result::StmResult;
use crate::transaction::{atomically, Transaction};

/// Type-erased variable payload. Values are shared, never mutated in place.
pub(crate) type DynValue = Arc<dyn Any + Send + Sync>;

/// An immutable snapshot of a variable: the value together with the version
/// of the commit that produced it. Version 0 means the variable has never
/// been written by a committed transaction.
pub(crate) struct Record {
    pub(crate) version: u64,
    pub(crate) value: DynValue,
}

/// The shared, untyped inner of a [`Var`]. Transactions key their read and
/// write sets by the address of this struct; `Var<T>` is the typesafe
/// wrapper around it.
///
/// The record pointer is only replaced while the global commit lock is held
/// exclusively; the per-core lock makes the pointer swap itself safe for
/// the brief reads that run under the shared mode of the global lock.
pub(crate) struct VarCore {
    record: RwLock<Arc<Record>>,
}

impl VarCore {
    pub(crate) fn new(value: DynValue) -> Arc<VarCore> {
        Arc::new(VarCore {
            record: RwLock::new(Arc::new(Record { version: 0, value })),
        })
    }

    /// The current record. Callers hold the global lock in at least shared
    /// mode.
    pub(crate) fn load(&self) -> Arc<Record> {
        self.record.read().clone()
    }

    /// The current version. Callers hold the global lock in at least shared
    /// mode.
    pub(crate) fn version(&self) -> u64 {
        self.record.read().version
    }

    /// True if the current version still matches a snapshot taken earlier.
    pub(crate) fn validate(&self, snapshot_version: u64) -> bool {
        self.record.read().version == snapshot_version
    }

    /// Publishes a new value, bumping the version past the current one, and
    /// returns the displaced record. Callers hold the global lock
    /// exclusively; the displaced record must stay alive until the commit
    /// has finished (see the driver's dead list).
    pub(crate) fn install(&self, value: DynValue) -> Arc<Record> {
        let mut record = self.record.write();
        let next = Arc::new(Record {
            version: record.version + 1,
            value,
        });
        std::mem::replace(&mut *record, next)
    }
}

/// Identity key for a variable: hashes and compares by the address of the
/// core, while keeping the core alive.
#[derive(Clone)]
pub(crate) struct VarKey(pub(crate) Arc<VarCore>);

impl fmt::Debug for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("VarKey")
            .field(&(Arc::as_ptr(&self.0)))
            .finish()
    }
}

impl PartialEq for VarKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for VarKey {}

impl Hash for VarKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state);
    }
}

/// A transactional variable.
///
/// The value can only be accessed through a transaction (or through the
/// inconsistent and read-only conveniences, which run their own locking).
/// The stored type must be cloneable and must not run transactions from its
/// `Clone` impl; a `Drop` impl that runs transactions is fine, the engine
/// arranges for such drops to happen outside the owning transaction.
///
/// `Var` is cheap to clone: clones share the same underlying cell, so the
/// usual way to hand a variable to another thread is to clone it.
pub struct Var<T> {
    core: Arc<VarCore>,
    _marker: PhantomData<T>,
}

impl<T> Clone for Var<T> {
    fn clone(&self) -> Self {
        Var {
            core: self.core.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> Var<T>
where
    T: Any + Send + Sync + Clone,
{
    /// Creates a new variable with version 0.
    pub fn new(value: T) -> Var<T> {
        Var {
            core: VarCore::new(Arc::new(value)),
            _marker: PhantomData,
        }
    }

    /// Reads the value visible to the transaction.
    ///
    /// The first read in a transaction snapshots the current committed
    /// record; later reads return that same snapshot unless the transaction
    /// has written the variable, in which case the pending write is
    /// returned. The snapshot is validated at commit time.
    pub fn read(&self, at: &mut Transaction) -> StmResult<T> {
        Ok(downcast::<T>(&at.read_var(&self.core)))
    }

    /// Stages a write. Not visible to other threads until the transaction
    /// commits; visible to every later read in this transaction.
    ///
    /// A write on its own does not make the variable part of the validated
    /// read set: a write-only transaction never conflicts.
    pub fn write(&self, at: &mut Transaction, value: T) -> StmResult<()> {
        at.write_var(&self.core, Arc::new(value));
        Ok(())
    }

    /// Applies `f` to the current value and writes the result back.
    pub fn modify<F>(&self, at: &mut Transaction, f: F) -> StmResult<()>
    where
        F: FnOnce(T) -> T,
    {
        let old = self.read(at)?;
        self.write(at, f(old))
    }

    /// Writes `value` and returns the previously visible value.
    pub fn replace(&self, at: &mut Transaction, value: T) -> StmResult<T> {
        let old = self.read(at)?;
        self.write(at, value)?;
        Ok(old)
    }

    /// Reads the current committed value without keeping a snapshot.
    /// Repeated reads through the same [`Inconsistent`] handle may observe
    /// different values.
    pub fn read_inconsistent(&self, ins: &mut Inconsistent) -> T {
        let record = ins.with_read(|| self.core.load());
        downcast::<T>(&record.value)
    }

    /// Reads the value in its own transaction. Equivalent to
    /// `atomically(|at| self.read(at))`.
    pub fn read_atomic(&self) -> T {
        atomically(|at| self.read(at))
    }

    /// Writes the value in its own transaction. Slower than [`Var::write`]
    /// if you are already inside one.
    pub fn write_atomic(&self, value: T) {
        atomically(|at| self.write(at, value.clone()));
    }

    /// Re-checks just this variable's snapshot against the current
    /// committed version and fails the transaction if it is stale. Useful
    /// to cut a long transaction short when a full validation at commit
    /// would waste the remaining work; commit-time validation happens
    /// either way.
    pub fn validate(&self, at: &mut Transaction) -> StmResult<()> {
        at.validate_var(&self.core)
    }

    /// True if the two handles refer to the same variable.
    pub fn ref_eq(this: &Var<T>, other: &Var<T>) -> bool {
        Arc::ptr_eq(&this.core, &other.core)
    }

    pub(crate) fn core(&self) -> &Arc<VarCore> {
        &self.core
    }
}

pub(crate) fn downcast<T: Any + Clone>(value: &DynValue) -> T {
    match value.downcast_ref::<T>() {
        Some(v) => v.clone(),
        None => unreachable!("Var<T> holds a value of the wrong type"),
    }
}

/// Note that `fmt` reads the variable in its own transaction; the printed
/// value can be stale by the time it is displayed.
impl<T> Debug for Var<T>
where
    T: Any + Send + Sync + Clone + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        let value = self.read_atomic();
        f.debug_struct("Var").field("value", &value).finish()
    }
}
