//! Emits the target's modules and thread names when a capture starts.

use log::warn;
use std::fs;
use trawl_common::{
    CaptureEvent, CaptureOptions, ModulesSnapshot, ThreadName, WarningEvent, WarningKind,
};

use super::modules::read_modules;
use crate::clock::monotonic_timestamp_ns;
use crate::domain::{Pid, ProcessError};
use crate::producer::{EventSink, ProducerHooks};

#[derive(Debug, Default)]
pub struct ProcessSnapshotProducer;

impl ProcessSnapshotProducer {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ProducerHooks for ProcessSnapshotProducer {
    fn on_capture_start(&self, options: &CaptureOptions, sink: &EventSink) {
        let pid = Pid(options.pid);
        let timestamp_ns = monotonic_timestamp_ns();

        match read_modules(pid) {
            Ok(modules) => {
                sink.enqueue(CaptureEvent::ModulesSnapshot(ModulesSnapshot {
                    pid: pid.0,
                    timestamp_ns,
                    modules,
                }));
            }
            Err(e) => {
                warn!("Module snapshot of {pid} failed: {e}");
                sink.enqueue(CaptureEvent::WarningEvent(WarningEvent {
                    pid: pid.0,
                    tid: 0,
                    timestamp_ns,
                    kind: WarningKind::Generic,
                    message: format!("Could not read modules: {e}"),
                }));
            }
        }

        match read_thread_names(pid) {
            Ok(threads) => {
                for (tid, name) in threads {
                    sink.enqueue(CaptureEvent::ThreadName(ThreadName {
                        pid: pid.0,
                        tid,
                        timestamp_ns,
                        name,
                    }));
                }
            }
            Err(e) => warn!("Thread names of {pid} unavailable: {e}"),
        }
    }
}

/// `(tid, comm)` for every thread of `pid`, sorted by tid.
///
/// # Errors
/// [`ProcessError::ProcessNotFound`] if the task directory cannot be listed.
pub fn read_thread_names(pid: Pid) -> Result<Vec<(i32, String)>, ProcessError> {
    let tasks = fs::read_dir(format!("/proc/{}/task", pid.0))
        .map_err(|_| ProcessError::ProcessNotFound(pid))?;
    let mut threads: Vec<(i32, String)> = tasks
        .flatten()
        .filter_map(|entry| {
            let tid = entry.file_name().to_string_lossy().parse::<i32>().ok()?;
            let name = fs::read_to_string(entry.path().join("comm")).ok()?;
            Some((tid, name.trim_end().to_string()))
        })
        .collect();
    threads.sort_unstable_by_key(|(tid, _)| *tid);
    Ok(threads)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_own_threads_include_main() {
        let pid = std::process::id() as i32;
        let threads = read_thread_names(Pid(pid)).unwrap();
        assert!(threads.iter().any(|(tid, _)| *tid == pid));
    }

    #[test]
    fn test_missing_process_has_no_threads() {
        assert!(matches!(read_thread_names(Pid(i32::MAX)), Err(ProcessError::ProcessNotFound(_))));
    }
}
