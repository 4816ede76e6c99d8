//! Process and runtime resource collectors.
//!
//! Snapshots are taken on demand (on every `/metrics` scrape and by the
//! diagnostic endpoints) rather than on a background timer.

use serde::Serialize;
use std::sync::Mutex;
use sysinfo::{Pid, System};

/// Resource usage of the current process.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    /// Resident set size in bytes.
    pub resident_memory_bytes: u64,
    pub virtual_memory_bytes: u64,
    /// CPU usage as a percentage of one core since the previous refresh.
    pub cpu_usage_percent: f32,
    /// Process start time in seconds since the Unix epoch.
    pub start_time_seconds: u64,
}

/// Tokio runtime statistics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RuntimeSnapshot {
    pub workers: usize,
    pub alive_tasks: usize,
}

/// Gathers process statistics through `sysinfo`.
///
/// The `System` handle is kept between refreshes so CPU usage is computed
/// as a delta. The lock is only held for the synchronous refresh.
pub struct ProcessCollector {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessCollector {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                tracing::warn!(target: "pipeline.metrics", error = %e, "Process collector disabled: cannot resolve current pid");
                None
            }
        };

        Self {
            pid,
            system: Mutex::new(System::new()),
        }
    }

    /// Refresh and return the current process statistics.
    ///
    /// Returns `None` when the platform does not expose them.
    pub fn process_snapshot(&self) -> Option<ProcessSnapshot> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        if !system.refresh_process(pid) {
            return None;
        }

        let process = system.process(pid)?;
        Some(ProcessSnapshot {
            pid: pid.as_u32(),
            resident_memory_bytes: process.memory(),
            virtual_memory_bytes: process.virtual_memory(),
            cpu_usage_percent: process.cpu_usage(),
            start_time_seconds: process.start_time(),
        })
    }

    /// Statistics of the tokio runtime driving the caller, if any.
    pub fn runtime_snapshot(&self) -> Option<RuntimeSnapshot> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        let metrics = handle.metrics();
        Some(RuntimeSnapshot {
            workers: metrics.num_workers(),
            alive_tasks: metrics.num_alive_tasks(),
        })
    }
}

impl Default for ProcessCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Host name of the machine, captured for health reports.
pub fn host_name() -> String {
    System::host_name()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_process_snapshot_reports_own_pid() {
        let collector = ProcessCollector::new();
        if let Some(snapshot) = collector.process_snapshot() {
            assert_eq!(snapshot.pid, std::process::id());
            assert!(snapshot.start_time_seconds > 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_runtime_snapshot_inside_runtime() {
        let collector = ProcessCollector::new();
        let snapshot = collector.runtime_snapshot().expect("inside a runtime");
        assert_eq!(snapshot.workers, 2);
    }

    #[test]
    fn test_runtime_snapshot_outside_runtime() {
        let collector = ProcessCollector::new();
        assert!(collector.runtime_snapshot().is_none());
    }

    #[test]
    fn test_host_name_is_not_empty() {
        assert!(!host_name().is_empty());
    }
}
