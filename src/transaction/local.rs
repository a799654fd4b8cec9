use std::any::Any;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use super::frame;
use super::Transaction;

// Each value site gets a key that is never reused. Keying by address would
// break if a site is dropped and a new one lands on the same allocation
// while an old entry for that address is still live in some transaction.
static NEXT_LOCAL_KEY: AtomicU64 = AtomicU64::new(0);

fn next_local_key() -> u64 {
    NEXT_LOCAL_KEY.fetch_add(1, Ordering::Relaxed)
}

/// A value scoped to a transaction, like a thread-local but for
/// transactions. It starts out unset in every transaction, holds whatever
/// the transaction sets it to until the transaction ends, and is gone by
/// the time the after-hooks run (before-commit hooks still see it).
///
/// Sub-transactions see the parent's value, and a value set in a
/// sub-transaction becomes the parent's value when the sub-transaction
/// merges — or disappears with the sub-transaction when it rolls back.
pub struct TransactionLocalValue<T> {
    key: u64,
    _marker: PhantomData<fn(T) -> T>,
}

impl<T: Any + Clone> TransactionLocalValue<T> {
    pub fn new() -> TransactionLocalValue<T> {
        TransactionLocalValue {
            key: next_local_key(),
            _marker: PhantomData,
        }
    }

    /// The value visible to the running transaction, if one was set by it
    /// or an enclosing transaction.
    pub fn get(&self, _at: &mut Transaction) -> Option<T> {
        frame::with(|stack| {
            stack
                .lookup_local(self.key)
                .and_then(|value| value.downcast_ref::<T>())
                .cloned()
        })
    }

    /// Sets the value for the running transaction.
    pub fn set(&self, _at: &mut Transaction, value: T) {
        let displaced = frame::with(|stack| stack.set_local(self.key, Box::new(value)));
        // Dropped outside the stack borrow; this may run a user destructor.
        drop(displaced);
    }
}

impl<T: Any + Clone> Default for TransactionLocalValue<T> {
    fn default() -> Self {
        TransactionLocalValue::new()
    }
}

/// A once-per-transaction latch for operations that must happen at most
/// once however often the body re-runs within one attempt.
pub struct TransactionLocalFlag {
    flag: TransactionLocalValue<bool>,
}

impl TransactionLocalFlag {
    pub fn new() -> TransactionLocalFlag {
        TransactionLocalFlag {
            flag: TransactionLocalValue::new(),
        }
    }

    /// Sets the flag and returns whether it was already set in this
    /// transaction.
    pub fn test_and_set(&self, at: &mut Transaction) -> bool {
        let was_set = self.flag.get(at).unwrap_or(false);
        self.flag.set(at, true);
        was_set
    }
}

impl Default for TransactionLocalFlag {
    fn default() -> Self {
        TransactionLocalFlag::new()
    }
}
