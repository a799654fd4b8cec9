//! Thread helpers for tests that must observe blocking behaviour.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Runs `f` on its own thread and `g` on another, and waits up to
/// `timeout_ms` for `f` to finish. Returns `f`'s result, or `None` on
/// timeout (in which case the worker thread is abandoned, still blocked).
pub fn async_test<T, F, G>(timeout_ms: u64, f: F, g: G) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
    G: FnOnce() + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    let worker = thread::spawn(move || {
        let _ = sender.send(f());
    });
    let helper = thread::spawn(g);

    let result = receiver.recv_timeout(Duration::from_millis(timeout_ms)).ok();

    let _ = helper.join();
    if result.is_some() {
        let _ = worker.join();
    }
    result
}

/// True if `f` finishes within `timeout_ms`.
pub fn terminates<F>(timeout_ms: u64, f: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    async_test(timeout_ms, f, || {}).is_some()
}

/// True if `f` finishes within `timeout_ms` while `g` runs alongside it.
pub fn terminates_async<F, G>(timeout_ms: u64, f: F, g: G) -> bool
where
    F: FnOnce() + Send + 'static,
    G: FnOnce() + Send + 'static,
{
    async_test(timeout_ms, f, g).is_some()
}
