use std::error::Error;
use std::sync::Arc;

use crate::result::{CapturedError, StmResult, TransactionClosureResult, TransactionError};
use crate::transaction::{atomically, Transaction};
use crate::tvar::Var;

/// A shareable cell that stores a failure so it can be re-raised later,
/// possibly on another thread. This is how the deferred-result machinery
/// carries a producer's failure to its consumers.
///
/// The captured error is type-erased; re-raising means returning it as an
/// abort error from [`ExceptionCapture::raise`].
pub struct ExceptionCapture {
    captured_v: Var<Option<CapturedError>>,
}

impl ExceptionCapture {
    /// Creates an empty capture.
    pub fn new() -> ExceptionCapture {
        ExceptionCapture {
            captured_v: Var::new(None),
        }
    }

    /// Captures `error`, replacing anything captured before.
    pub fn capture<E>(&self, at: &mut Transaction, error: E) -> StmResult<()>
    where
        E: Error + Send + Sync + 'static,
    {
        let captured: CapturedError = Arc::new(error);
        self.captured_v.write(at, Some(captured))
    }

    /// Captures an already type-erased error.
    pub fn capture_shared(&self, at: &mut Transaction, error: CapturedError) -> StmResult<()> {
        self.captured_v.write(at, Some(error))
    }

    /// Captures whatever `other` holds; the two captures stay independent
    /// afterwards. Capturing an empty capture empties this one.
    pub fn capture_captured(&self, at: &mut Transaction, other: &ExceptionCapture) -> StmResult<()> {
        let inner = other.captured_v.read(at)?;
        self.captured_v.write(at, inner)
    }

    /// [`ExceptionCapture::capture`] in its own transaction.
    pub fn capture_atomic<E>(&self, error: E)
    where
        E: Error + Send + Sync + Clone + 'static,
    {
        atomically(|at| self.capture(at, error.clone()));
    }

    /// Drops any captured error.
    pub fn reset(&self, at: &mut Transaction) -> StmResult<()> {
        self.captured_v.write(at, None)
    }

    pub fn has_captured(&self, at: &mut Transaction) -> StmResult<bool> {
        Ok(self.captured_v.read(at)?.is_some())
    }

    pub fn has_captured_atomic(&self) -> bool {
        atomically(|at| self.has_captured(at))
    }

    /// The captured error, if any.
    pub fn captured(&self, at: &mut Transaction) -> StmResult<Option<CapturedError>> {
        self.captured_v.read(at)
    }

    /// Re-raises the captured error as an abort, or does nothing when
    /// empty.
    pub fn raise(&self, at: &mut Transaction) -> TransactionClosureResult<(), CapturedError> {
        match self.captured_v.read(at)? {
            Some(error) => Err(TransactionError::Abort(error)),
            None => Ok(()),
        }
    }
}

impl Default for ExceptionCapture {
    fn default() -> Self {
        ExceptionCapture::new()
    }
}

/// Cloning snapshots the currently captured error into a fresh cell; later
/// captures on either cell do not affect the other.
impl Clone for ExceptionCapture {
    fn clone(&self) -> Self {
        ExceptionCapture {
            captured_v: Var::new(self.captured_v.read_atomic()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{atomically, atomically_with_err};

    #[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
    #[error("test trouble {0}")]
    struct Trouble(i32);

    #[test]
    fn empty_capture_raises_nothing() {
        let capture = ExceptionCapture::new();
        assert!(!capture.has_captured_atomic());
        let raised: Result<(), CapturedError> = atomically_with_err(|at| capture.raise(at));
        assert!(raised.is_ok());
    }

    #[test]
    fn captured_error_is_raised() {
        let capture = ExceptionCapture::new();
        capture.capture_atomic(Trouble(3));
        assert!(capture.has_captured_atomic());

        let raised: Result<(), CapturedError> = atomically_with_err(|at| capture.raise(at));
        let error = raised.unwrap_err();
        assert_eq!(error.downcast_ref::<Trouble>(), Some(&Trouble(3)));
    }

    #[test]
    fn capture_replaces_and_reset_clears() {
        let capture = ExceptionCapture::new();
        capture.capture_atomic(Trouble(1));
        capture.capture_atomic(Trouble(2));

        let raised: Result<(), CapturedError> = atomically_with_err(|at| capture.raise(at));
        assert_eq!(
            raised.unwrap_err().downcast_ref::<Trouble>(),
            Some(&Trouble(2))
        );

        atomically(|at| capture.reset(at));
        assert!(!capture.has_captured_atomic());
    }

    #[test]
    fn forwarding_another_capture() {
        let source = ExceptionCapture::new();
        source.capture_atomic(Trouble(9));

        let sink = ExceptionCapture::new();
        atomically(|at| sink.capture_captured(at, &source));

        let raised: Result<(), CapturedError> = atomically_with_err(|at| sink.raise(at));
        assert_eq!(
            raised.unwrap_err().downcast_ref::<Trouble>(),
            Some(&Trouble(9))
        );

        // Forwarding an empty capture empties the sink.
        atomically(|at| source.reset(at));
        atomically(|at| sink.capture_captured(at, &source));
        assert!(!sink.has_captured_atomic());
    }

    #[test]
    fn clone_snapshots_content() {
        let original = ExceptionCapture::new();
        original.capture_atomic(Trouble(1));

        let snapshot = original.clone();
        original.capture_atomic(Trouble(2));

        let raised: Result<(), CapturedError> = atomically_with_err(|at| snapshot.raise(at));
        assert_eq!(
            raised.unwrap_err().downcast_ref::<Trouble>(),
            Some(&Trouble(1))
        );
    }
}
