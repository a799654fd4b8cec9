use std::sync::Arc;

use crate::time::TimeArg;

/// Control signal of a single step of a transaction.
///
/// These are not user-visible failures; the driver consumes them to restart
/// or block the transaction. Propagate them with `?`, never handle them
/// yourself: swallowing a `Failure` commits stale reads, swallowing a
/// `Retry` spins instead of blocking.
#[derive(Eq, PartialEq, Clone, Copy, Debug, thiserror::Error)]
pub enum StmError {
    /// A variable the transaction depends on changed; the attempt must be
    /// abandoned and re-run.
    #[error("transaction validation failed")]
    Failure,

    /// `retry` was called. The driver blocks until a read variable changes
    /// or the carried deadline passes.
    #[error("transaction retry requested")]
    Retry(TimeArg),
}

/// Result of a single step of a transaction.
pub type StmResult<T> = Result<T, StmError>;

/// Error of a transaction step that can also abort with a user error.
#[derive(Eq, PartialEq, Clone, Copy, Debug, thiserror::Error)]
pub enum TransactionError<E> {
    /// Failed due to an [`StmError`]; consumed by the driver.
    #[error(transparent)]
    Stm(#[from] StmError),

    /// The transaction was aborted; the error escapes the driver untouched
    /// after the on-fail hooks have run.
    #[error("transaction aborted")]
    Abort(E),
}

/// Result of a transaction step with abort potential.
pub type TransactionClosureResult<T, E> = Result<T, TransactionError<E>>;

/// A transaction run hit one of its configured limits.
#[derive(Eq, PartialEq, Clone, Copy, Debug, thiserror::Error)]
pub enum CantContinueError {
    /// The run called `retry` more often than `max_retries` allows.
    #[error("hit maximum number of retries ({0})")]
    MaxRetries(u32),

    /// The run conflicted more often than `max_conflicts` allows and the
    /// conflict resolution is [`ConflictResolution::Fail`].
    ///
    /// [`ConflictResolution::Fail`]: crate::ConflictResolution::Fail
    #[error("hit maximum number of conflicts ({0})")]
    MaxConflicts(u32),

    /// A retry wait exceeded its deadline.
    #[error("retry timed out")]
    RetryTimeout,
}

/// Failure of an `atomically_with_opts_and_err` run: either a configured
/// limit was hit or the body aborted.
#[derive(Eq, PartialEq, Clone, Copy, Debug, thiserror::Error)]
pub enum AtomicRunError<E> {
    #[error(transparent)]
    Stopped(#[from] CantContinueError),

    #[error("transaction aborted")]
    Aborted(E),
}

/// The operation is not allowed while a transaction is running on this
/// thread.
#[derive(Eq, PartialEq, Clone, Copy, Debug, thiserror::Error)]
#[error("operation not allowed inside a transaction")]
pub struct InAtomicError;

/// A channel handle no longer refers to a live channel, or was never
/// initialized.
#[derive(Eq, PartialEq, Clone, Copy, Debug, thiserror::Error)]
#[error("channel handle does not refer to a live channel")]
pub struct InvalidChannelError;

/// A captured failure, type-erased so that it can be stored, cloned and
/// re-raised across threads.
pub type CapturedError = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Errors reported by the deferred-result primitives.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DeferredError {
    /// The consumer asked for a result before the producer set one.
    #[error("deferred result is not done yet")]
    NotDone,

    /// The producer tried to set a result twice.
    #[error("deferred value is already done")]
    AlreadyDone,

    /// The result handle is not connected to a deferred value.
    #[error("deferred result is not connected to a deferred value")]
    Invalid,

    /// The producer failed the operation; carries the captured failure.
    #[error("deferred operation failed: {0}")]
    Failed(CapturedError),
}

/// Delivered through a deferred result when the last producer handle is
/// dropped without setting a result.
#[derive(Eq, PartialEq, Clone, Copy, Debug, thiserror::Error)]
#[error("deferred value was dropped before a result was set")]
pub struct BrokenPromiseError;
