//! Conflict and commit counters, compiled in with the `profiling` feature.
//!
//! Profiling is global: [`start`] resets the counters, [`checkpoint`] reads
//! them together with the elapsed time. Leave the feature off in normal
//! builds, the counters are a measurable drag on hot transactions.

cfg_if::cfg_if! {
    if #[cfg(feature = "profiling")] {
        use std::fmt;
        use std::sync::atomic::{AtomicU64, Ordering};
        use std::time::{Duration, Instant};

        use parking_lot::Mutex;

        static NUM_CONFLICTS: AtomicU64 = AtomicU64::new(0);
        static NUM_READ_COMMITS: AtomicU64 = AtomicU64::new(0);
        static NUM_WRITE_COMMITS: AtomicU64 = AtomicU64::new(0);
        static RUN_START: Mutex<Option<Instant>> = Mutex::new(None);

        /// Counters collected between [`start`] and [`checkpoint`].
        #[derive(Clone, Copy, Debug)]
        pub struct ProfileData {
            pub elapsed: Duration,
            pub conflicts: u64,
            pub read_commits: u64,
            pub write_commits: u64,
        }

        impl fmt::Display for ProfileData {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let secs = self.elapsed.as_secs_f64().max(f64::EPSILON);
                writeln!(f, "time = {:.3}s", self.elapsed.as_secs_f64())?;
                writeln!(
                    f,
                    "conflicts = {:.1}/sec ({} total)",
                    self.conflicts as f64 / secs,
                    self.conflicts
                )?;
                writeln!(
                    f,
                    "reads = {:.1}/sec ({} total)",
                    self.read_commits as f64 / secs,
                    self.read_commits
                )?;
                write!(
                    f,
                    "writes = {:.1}/sec ({} total)",
                    self.write_commits as f64 / secs,
                    self.write_commits
                )
            }
        }

        /// Starts a profile run, resetting all counters.
        pub fn start() {
            let mut run_start = RUN_START.lock();
            NUM_CONFLICTS.store(0, Ordering::Relaxed);
            NUM_READ_COMMITS.store(0, Ordering::Relaxed);
            NUM_WRITE_COMMITS.store(0, Ordering::Relaxed);
            *run_start = Some(Instant::now());
        }

        /// Reads the counters accumulated since [`start`]. Elapsed time is
        /// zero when `start` was never called.
        pub fn checkpoint() -> ProfileData {
            let run_start = RUN_START.lock();
            ProfileData {
                elapsed: run_start
                    .map(|started| started.elapsed())
                    .unwrap_or(Duration::ZERO),
                conflicts: NUM_CONFLICTS.load(Ordering::Relaxed),
                read_commits: NUM_READ_COMMITS.load(Ordering::Relaxed),
                write_commits: NUM_WRITE_COMMITS.load(Ordering::Relaxed),
            }
        }

        pub(crate) fn record_conflict() {
            NUM_CONFLICTS.fetch_add(1, Ordering::Relaxed);
        }

        pub(crate) fn record_read_commit() {
            NUM_READ_COMMITS.fetch_add(1, Ordering::Relaxed);
        }

        pub(crate) fn record_write_commit() {
            NUM_WRITE_COMMITS.fetch_add(1, Ordering::Relaxed);
        }
    } else {
        #[inline]
        pub(crate) fn record_conflict() {}

        #[inline]
        pub(crate) fn record_read_commit() {}

        #[inline]
        pub(crate) fn record_write_commit() {}
    }
}

#[cfg(all(test, feature = "profiling"))]
mod test {
    use super::*;
    use crate::Var;

    #[test]
    fn counters_track_commits() {
        start();
        let v = Var::new(0);
        v.write_atomic(1);
        let _ = v.read_atomic();
        let data = checkpoint();
        assert!(data.write_commits >= 1);
        assert!(data.read_commits >= 1);
    }
}
