use crate::result::InAtomicError;
use crate::transaction::commit_lock::{self, ReadGuard};
use crate::transaction::in_atomic;

/// Handle for unsynchronised snapshot reads, passed to the body of
/// [`inconsistently`].
///
/// Reads through this handle see the committed value at the moment of the
/// read and nothing is snapshotted: two reads of the same variable can
/// disagree. Nothing is ever validated or committed, and retrying is not
/// available. The handle exists for code that wants to dump a set of
/// variables cheaply and can tolerate tearing between them.
///
/// The read lock is reference counted. Hold it across a batch of reads with
/// [`Inconsistent::read_lock`] / [`Inconsistent::read_unlock`] to avoid
/// re-acquiring the global lock per read; do not start a writing
/// transaction on the same thread while holding it, the commit would wait
/// on your own lock.
pub struct Inconsistent {
    guard: Option<ReadGuard>,
    count: usize,
}

impl Inconsistent {
    fn new() -> Inconsistent {
        Inconsistent {
            guard: None,
            count: 0,
        }
    }

    pub fn read_lock(&mut self) {
        if self.count == 0 {
            self.guard = Some(commit_lock::read());
        }
        self.count += 1;
    }

    pub fn is_read_locked(&self) -> bool {
        self.guard.is_some()
    }

    pub fn read_unlock(&mut self) {
        if self.count > 0 {
            self.count -= 1;
            if self.count == 0 {
                self.guard = None;
            }
        }
    }

    pub(crate) fn with_read<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.read_lock();
        let result = f();
        self.read_unlock();
        result
    }
}

/// Runs `f` with an [`Inconsistent`] handle. Fails with [`InAtomicError`]
/// when called inside a transaction: mixing unvalidated reads into a
/// transaction would defeat its consistency check.
pub fn inconsistently<T, F>(f: F) -> Result<T, InAtomicError>
where
    F: FnOnce(&mut Inconsistent) -> T,
{
    if in_atomic() {
        return Err(InAtomicError);
    }
    let mut handle = Inconsistent::new();
    Ok(f(&mut handle))
}
