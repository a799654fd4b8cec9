//! A transactional promise/future pair.
//!
//! [`DeferredValue`] is the producer end, [`DeferredResult`] the consumer
//! end. The producer moves the pair from pending to done exactly once,
//! either with a result or with a captured failure; consumers poll, block,
//! or subscribe callbacks. Both ends compose with any enclosing
//! transaction: a result set inside a transaction becomes visible — and
//! the subscriber callbacks fire — only when that transaction commits.

use std::any::Any;
use std::error::Error;
use std::sync::{Arc, Weak};

use crate::capture::ExceptionCapture;
use crate::list::PersistentList;
use crate::result::{
    BrokenPromiseError, DeferredError, StmError, StmResult, TransactionClosureResult,
    TransactionError,
};
use crate::time::TimeArg;
use crate::transaction::{
    atomically, atomically_with_err, atomically_with_opts, AtomicOptions, Transaction,
};
use crate::tvar::Var;

/// Subscriber callback registered with [`DeferredResult::on_done`]. Runs
/// outside any transaction, exactly once.
pub type DoneCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: u64,
    callback: DoneCallback,
}

struct DeferredCore<T> {
    done_v: Var<bool>,
    failure: ExceptionCapture,
    result_v: Var<Option<T>>,
    subscribers_v: Var<PersistentList<Subscriber>>,
    subscriber_index_v: Var<u64>,
    reader_count_v: Var<i64>,
}

impl<T> DeferredCore<T>
where
    T: Any + Send + Sync + Clone,
{
    fn new() -> DeferredCore<T> {
        DeferredCore {
            done_v: Var::new(false),
            failure: ExceptionCapture::new(),
            result_v: Var::new(None),
            subscribers_v: Var::new(PersistentList::new()),
            subscriber_index_v: Var::new(0),
            reader_count_v: Var::new(0),
        }
    }

    /// Flips pending → done and schedules the current subscribers to run
    /// after the commit. Done is a one-way transition: a second call
    /// aborts with `AlreadyDone`.
    fn set_done(&self, at: &mut Transaction) -> TransactionClosureResult<(), DeferredError> {
        if self.done_v.read(at)? {
            return Err(TransactionError::Abort(DeferredError::AlreadyDone));
        }
        self.done_v.write(at, true)?;

        let subscribers = self.subscribers_v.read(at)?;
        if !subscribers.is_empty() {
            at.after(move || {
                for subscriber in subscribers.iter() {
                    (subscriber.callback)();
                }
            });
            self.subscribers_v.write(at, PersistentList::new())?;
        }
        Ok(())
    }

    fn done(&self, at: &mut Transaction, result: T) -> TransactionClosureResult<(), DeferredError> {
        self.set_done(at)?;
        self.result_v.write(at, Some(result))?;
        Ok(())
    }

    fn fail<E>(&self, at: &mut Transaction, error: E) -> TransactionClosureResult<(), DeferredError>
    where
        E: Error + Send + Sync + 'static,
    {
        self.set_done(at)?;
        self.failure.capture(at, error)?;
        Ok(())
    }

    /// Broken-promise path for the watch: the caller has already checked
    /// that the value is not done in this same transaction.
    fn fail_broken(&self, at: &mut Transaction) -> StmResult<()> {
        match self.set_done(at) {
            Ok(()) => {}
            Err(TransactionError::Stm(signal)) => return Err(signal),
            Err(TransactionError::Abort(_)) => return Ok(()),
        }
        self.failure.capture(at, BrokenPromiseError)
    }

    fn is_done(&self, at: &mut Transaction) -> StmResult<bool> {
        self.done_v.read(at)
    }

    fn failed(&self, at: &mut Transaction) -> TransactionClosureResult<bool, DeferredError> {
        if !self.done_v.read(at)? {
            return Err(TransactionError::Abort(DeferredError::NotDone));
        }
        Ok(self.failure.has_captured(at)?)
    }

    fn raise_error(&self, at: &mut Transaction) -> TransactionClosureResult<(), DeferredError> {
        if !self.done_v.read(at)? {
            return Err(TransactionError::Abort(DeferredError::NotDone));
        }
        if let Some(error) = self.failure.captured(at)? {
            return Err(TransactionError::Abort(DeferredError::Failed(error)));
        }
        Ok(())
    }

    fn get_result(&self, at: &mut Transaction) -> TransactionClosureResult<T, DeferredError> {
        self.raise_error(at)?;
        match self.result_v.read(at)? {
            Some(result) => Ok(result),
            None => Err(TransactionError::Abort(DeferredError::NotDone)),
        }
    }

    fn retry_if_not_done(&self, at: &mut Transaction, timeout: TimeArg) -> StmResult<()> {
        if !self.done_v.read(at)? {
            return Err(StmError::Retry(timeout));
        }
        Ok(())
    }

    fn subscribe(&self, at: &mut Transaction, callback: DoneCallback) -> StmResult<u64> {
        let id = self.subscriber_index_v.read(at)?;
        self.subscriber_index_v.write(at, id + 1)?;
        let mut subscribers = self.subscribers_v.read(at)?;
        subscribers.push_front(Subscriber { id, callback });
        self.subscribers_v.write(at, subscribers)?;
        Ok(id)
    }

    fn unsubscribe(&self, at: &mut Transaction, id: u64) -> StmResult<()> {
        let mut subscribers = self.subscribers_v.read(at)?;
        if subscribers.remove_first_by(|subscriber| subscriber.id == id) {
            self.subscribers_v.write(at, subscribers)?;
        }
        Ok(())
    }

    fn add_reader(&self, at: &mut Transaction) -> StmResult<()> {
        self.reader_count_v.modify(at, |count| count + 1)
    }

    fn remove_reader(&self, at: &mut Transaction) -> StmResult<()> {
        self.reader_count_v.modify(at, |count| count - 1)
    }

    fn has_readers(&self, at: &mut Transaction) -> StmResult<bool> {
        Ok(self.reader_count_v.read(at)? > 0)
    }
}

/// Fails the value with [`BrokenPromiseError`] when the last producer
/// handle goes away with the result still pending.
struct ValueWatch {
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Drop for ValueWatch {
    fn drop(&mut self) {
        if let Some(fail_broken) = self.on_drop.take() {
            fail_broken();
        }
    }
}

/// The producer end of a deferred result pair.
///
/// Clones share the same state; the broken-promise guarantee tracks the
/// last clone. Use [`DeferredValue::result`] to mint consumer ends.
pub struct DeferredValue<T> {
    core: Arc<DeferredCore<T>>,
    watch: Arc<ValueWatch>,
}

impl<T> DeferredValue<T>
where
    T: Any + Send + Sync + Clone,
{
    /// Creates a value in the pending state.
    pub fn new() -> DeferredValue<T> {
        let core = Arc::new(DeferredCore::new());
        let watch_core = core.clone();
        let watch = ValueWatch {
            on_drop: Some(Box::new(move || {
                atomically(|at| {
                    if watch_core.is_done(at)? {
                        return Ok(());
                    }
                    watch_core.fail_broken(at)
                });
            })),
        };
        DeferredValue {
            core,
            watch: Arc::new(watch),
        }
    }

    /// Completes the pair with `result`. Subscribers run after the commit.
    pub fn done(&self, at: &mut Transaction, result: T) -> TransactionClosureResult<(), DeferredError> {
        self.core.done(at, result)
    }

    /// [`DeferredValue::done`] in its own transaction.
    pub fn done_atomic(&self, result: T) -> Result<(), DeferredError> {
        atomically_with_err(|at| self.core.done(at, result.clone()))
    }

    /// Fails the pair with `error`; consumers see it through
    /// [`DeferredError::Failed`].
    pub fn fail<E>(&self, at: &mut Transaction, error: E) -> TransactionClosureResult<(), DeferredError>
    where
        E: Error + Send + Sync + 'static,
    {
        self.core.fail(at, error)
    }

    /// [`DeferredValue::fail`] in its own transaction.
    pub fn fail_atomic<E>(&self, error: E) -> Result<(), DeferredError>
    where
        E: Error + Send + Sync + Clone + 'static,
    {
        atomically_with_err(|at| self.core.fail(at, error.clone()))
    }

    pub fn is_done(&self, at: &mut Transaction) -> StmResult<bool> {
        self.core.is_done(at)
    }

    pub fn is_done_atomic(&self) -> bool {
        atomically(|at| self.core.is_done(at))
    }

    /// True while any consumer end is attached. Producers can use this to
    /// skip work nobody is waiting for.
    pub fn has_readers(&self, at: &mut Transaction) -> StmResult<bool> {
        self.core.has_readers(at)
    }

    pub fn has_readers_atomic(&self) -> bool {
        atomically(|at| self.core.has_readers(at))
    }

    /// Mints a consumer end attached to this value.
    pub fn result(&self) -> DeferredResult<T> {
        atomically(|at| self.result_in(at))
    }

    pub fn result_in(&self, at: &mut Transaction) -> StmResult<DeferredResult<T>> {
        self.core.add_reader(at)?;
        Ok(DeferredResult {
            core_v: Var::new(Some(self.core.clone())),
        })
    }
}

impl<T> Default for DeferredValue<T>
where
    T: Any + Send + Sync + Clone,
{
    fn default() -> Self {
        DeferredValue::new()
    }
}

impl<T> Clone for DeferredValue<T> {
    fn clone(&self) -> Self {
        DeferredValue {
            core: self.core.clone(),
            watch: self.watch.clone(),
        }
    }
}

/// The consumer end of a deferred result pair.
///
/// An unconnected handle (from [`DeferredResult::new`] or after
/// [`DeferredResult::release`]) fails its operations with
/// [`DeferredError::Invalid`].
pub struct DeferredResult<T>
where
    T: Any + Send + Sync + Clone,
{
    core_v: Var<Option<Arc<DeferredCore<T>>>>,
}

impl<T> DeferredResult<T>
where
    T: Any + Send + Sync + Clone,
{
    /// Creates an unconnected handle; connect it with
    /// [`DeferredResult::init`] or [`DeferredResult::init_from`].
    pub fn new() -> DeferredResult<T> {
        DeferredResult {
            core_v: Var::new(None),
        }
    }

    fn live_core(
        &self,
        at: &mut Transaction,
    ) -> TransactionClosureResult<Arc<DeferredCore<T>>, DeferredError> {
        self.core_v
            .read(at)?
            .ok_or(TransactionError::Abort(DeferredError::Invalid))
    }

    fn update_reader_counts(
        &self,
        at: &mut Transaction,
        new_core: Option<&Arc<DeferredCore<T>>>,
    ) -> StmResult<()> {
        if let Some(old) = self.core_v.read(at)? {
            old.remove_reader(at)?;
        }
        if let Some(new) = new_core {
            new.add_reader(at)?;
        }
        Ok(())
    }

    /// Attaches this handle to `value`, dropping any prior attachment.
    pub fn init(&self, at: &mut Transaction, value: &DeferredValue<T>) -> StmResult<()> {
        self.update_reader_counts(at, Some(&value.core))?;
        self.core_v.write(at, Some(value.core.clone()))
    }

    /// Attaches this handle to whatever `other` is attached to.
    pub fn init_from(&self, at: &mut Transaction, other: &DeferredResult<T>) -> StmResult<()> {
        let core = other.core_v.read(at)?;
        self.update_reader_counts(at, core.as_ref())?;
        self.core_v.write(at, core)
    }

    /// Detaches this handle.
    pub fn release(&self, at: &mut Transaction) -> StmResult<()> {
        self.update_reader_counts(at, None)?;
        self.core_v.write(at, None)
    }

    pub fn release_atomic(&self) {
        atomically(|at| self.release(at));
    }

    pub fn valid(&self, at: &mut Transaction) -> StmResult<bool> {
        Ok(self.core_v.read(at)?.is_some())
    }

    pub fn is_valid(&self) -> bool {
        atomically(|at| self.valid(at))
    }

    pub fn is_done(&self, at: &mut Transaction) -> TransactionClosureResult<bool, DeferredError> {
        let core = self.live_core(at)?;
        Ok(core.is_done(at)?)
    }

    pub fn is_done_atomic(&self) -> Result<bool, DeferredError> {
        atomically_with_err(|at| self.is_done(at))
    }

    /// True when the producer failed. Aborts with `NotDone` while pending.
    pub fn failed(&self, at: &mut Transaction) -> TransactionClosureResult<bool, DeferredError> {
        self.live_core(at)?.failed(at)
    }

    pub fn failed_atomic(&self) -> Result<bool, DeferredError> {
        atomically_with_err(|at| self.failed(at))
    }

    /// The result. Aborts with `NotDone` while pending and with
    /// [`DeferredError::Failed`] when the producer failed.
    pub fn get_result(&self, at: &mut Transaction) -> TransactionClosureResult<T, DeferredError> {
        self.live_core(at)?.get_result(at)
    }

    pub fn get_result_atomic(&self) -> Result<T, DeferredError> {
        atomically_with_err(|at| self.get_result(at))
    }

    /// Re-raises the producer's failure, or does nothing on success.
    /// Aborts with `NotDone` while pending.
    pub fn raise_error(&self, at: &mut Transaction) -> TransactionClosureResult<(), DeferredError> {
        self.live_core(at)?.raise_error(at)
    }

    /// Calls retry with `timeout` while the pair is pending.
    pub fn retry_if_not_done(
        &self,
        at: &mut Transaction,
        timeout: TimeArg,
    ) -> TransactionClosureResult<(), DeferredError> {
        let core = self.live_core(at)?;
        Ok(core.retry_if_not_done(at, timeout)?)
    }

    /// Blocks until the pair is done; false when `timeout` passed first.
    /// Call this outside any transaction; inside one, use
    /// [`DeferredResult::retry_if_not_done`].
    pub fn wait(&self, timeout: TimeArg) -> Result<bool, DeferredError> {
        let core = atomically_with_err(|at| self.live_core(at))?;
        let options = AtomicOptions::new().max_retry_wait(timeout);
        match atomically_with_opts(&options, |at| {
            core.retry_if_not_done(at, TimeArg::UNLIMITED)
        }) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Subscribes `callback` to run when the pair completes. If it already
    /// has, the callback is scheduled as an after-hook of this transaction
    /// and the returned connection is a no-op. Each subscriber runs exactly
    /// once.
    pub fn on_done<F>(
        &self,
        at: &mut Transaction,
        callback: F,
    ) -> TransactionClosureResult<DeferredConnection<T>, DeferredError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_done_shared(at, Arc::new(callback))
    }

    pub fn on_done_atomic<F>(&self, callback: F) -> Result<DeferredConnection<T>, DeferredError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: DoneCallback = Arc::new(callback);
        atomically_with_err(|at| self.on_done_shared(at, callback.clone()))
    }

    fn on_done_shared(
        &self,
        at: &mut Transaction,
        callback: DoneCallback,
    ) -> TransactionClosureResult<DeferredConnection<T>, DeferredError> {
        let core = self.live_core(at)?;
        if core.is_done(at)? {
            at.after(move || callback());
            return Ok(DeferredConnection {
                id: None,
                core: Weak::new(),
            });
        }
        let id = core.subscribe(at, callback)?;
        Ok(DeferredConnection {
            id: Some(id),
            core: Arc::downgrade(&core),
        })
    }
}

impl<T> Default for DeferredResult<T>
where
    T: Any + Send + Sync + Clone,
{
    fn default() -> Self {
        DeferredResult::new()
    }
}

/// Clones track the same producer and count as another reader.
impl<T> Clone for DeferredResult<T>
where
    T: Any + Send + Sync + Clone,
{
    fn clone(&self) -> Self {
        atomically(|at| {
            let core = self.core_v.read(at)?;
            if let Some(core) = &core {
                core.add_reader(at)?;
            }
            Ok(DeferredResult {
                core_v: Var::new(core),
            })
        })
    }
}

impl<T> Drop for DeferredResult<T>
where
    T: Any + Send + Sync + Clone,
{
    fn drop(&mut self) {
        atomically(|at| {
            if let Some(core) = self.core_v.read(at)? {
                core.remove_reader(at)?;
            }
            Ok(())
        });
    }
}

/// Connection handle returned by [`DeferredResult::on_done`]; disconnect
/// it to drop the subscription before it fires.
pub struct DeferredConnection<T> {
    id: Option<u64>,
    core: Weak<DeferredCore<T>>,
}

impl<T> DeferredConnection<T>
where
    T: Any + Send + Sync + Clone,
{
    pub fn is_connected(&self) -> bool {
        self.id.is_some() && self.core.upgrade().is_some()
    }

    pub fn disconnect(&mut self, at: &mut Transaction) -> StmResult<()> {
        if let (Some(id), Some(core)) = (self.id, self.core.upgrade()) {
            core.unsubscribe(at, id)?;
        }
        self.id = None;
        self.core = Weak::new();
        Ok(())
    }

    pub fn disconnect_atomic(&mut self) {
        if let (Some(id), Some(core)) = (self.id, self.core.upgrade()) {
            atomically(|at| core.unsubscribe(at, id));
        }
        self.id = None;
        self.core = Weak::new();
    }
}

/// A consumer end that is already done with `result`.
pub fn done_deferred<T>(result: T) -> DeferredResult<T>
where
    T: Any + Send + Sync + Clone,
{
    let value = DeferredValue::new();
    value
        .done_atomic(result)
        .expect("a freshly created deferred value cannot be done");
    value.result()
}

/// A consumer end that is already failed with `error`.
pub fn fail_deferred<T, E>(error: E) -> DeferredResult<T>
where
    T: Any + Send + Sync + Clone,
    E: Error + Send + Sync + Clone + 'static,
{
    let value = DeferredValue::new();
    value
        .fail_atomic(error)
        .expect("a freshly created deferred value cannot be done");
    value.result()
}
