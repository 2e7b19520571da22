//! Scoped Resource Usage
//!
//! RAII measurement of CPU time and maximum RSS around a critical region.
//! The guard snapshots `getrusage` at construction and writes the delta into
//! the caller's measurement slot when dropped; a failed probe at either end
//! resets the slot so no partial measurement leaks out.

use std::time::{Duration, Instant};
use tracing::warn;

/// Which rusage domain to probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RusageScope {
    /// The calling thread only
    Thread,
    /// The whole process
    Process,
}

/// Resource usage delta recorded by a scope
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceUsageMeasurement {
    /// Wall-clock duration of the scope
    pub duration: Duration,
    /// CPU time spent in user mode
    pub user_time: Duration,
    /// CPU time spent in kernel mode
    pub system_time: Duration,
    /// Maximum resident set size in kilobytes
    pub max_rss_kb: i64,
}

impl ResourceUsageMeasurement {
    /// Clear the measurement
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Clone, Copy)]
struct Snapshot {
    tp: Instant,
    user_time: Duration,
    system_time: Duration,
    max_rss_kb: i64,
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    Duration::new(tv.tv_sec as u64, (tv.tv_usec as u32) * 1000)
}

/// Probe current resource usage; `Err` carries errno.
fn snapshot(scope: RusageScope) -> Result<Snapshot, i32> {
    let who = match scope {
        RusageScope::Thread => libc::RUSAGE_THREAD,
        RusageScope::Process => libc::RUSAGE_SELF,
    };
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::getrusage(who, &mut usage) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(-1));
    }
    Ok(Snapshot {
        tp: Instant::now(),
        user_time: timeval_to_duration(usage.ru_utime),
        system_time: timeval_to_duration(usage.ru_stime),
        max_rss_kb: usage.ru_maxrss,
    })
}

/// RAII guard measuring resource usage between construction and drop
pub struct ScopedResourceUsage<'a> {
    meas: &'a mut ResourceUsageMeasurement,
    scope: RusageScope,
    start: Result<Snapshot, i32>,
}

impl<'a> ScopedResourceUsage<'a> {
    /// Start a measurement into the given slot
    pub fn new(meas: &'a mut ResourceUsageMeasurement, scope: RusageScope) -> Self {
        let start = snapshot(scope);
        if let Err(errno) = start {
            warn!("scoped resource usage failed to query current usage, errno={}", errno);
        }
        Self { meas, scope, start }
    }
}

impl Drop for ScopedResourceUsage<'_> {
    fn drop(&mut self) {
        let start = match self.start {
            Ok(s) => s,
            Err(_) => {
                self.meas.reset();
                return;
            }
        };
        let end = match snapshot(self.scope) {
            Ok(s) => s,
            Err(errno) => {
                warn!("scoped resource usage failed to query current usage, errno={}", errno);
                self.meas.reset();
                return;
            }
        };
        self.meas.duration = end.tp.duration_since(start.tp);
        self.meas.user_time = end.user_time.saturating_sub(start.user_time);
        self.meas.system_time = end.system_time.saturating_sub(start.system_time);
        self.meas.max_rss_kb = end.max_rss_kb;
    }
}
