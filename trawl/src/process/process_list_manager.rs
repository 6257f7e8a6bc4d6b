//! Process list kept fresh by a background thread.
//!
//! [`ProcessListManager`] re-reads `/proc` every refresh period on its own
//! thread and serves the latest snapshot. Shutdown wakes the thread from its
//! timed wait, so it exits within one tick.

use log::{debug, warn};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::clock::lock;
use crate::domain::{Pid, ProcessError};

pub const DEFAULT_REFRESH_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: Pid,
    /// Command name from `/proc/<pid>/stat`.
    pub name: String,
    pub full_path: Option<PathBuf>,
    pub command_line: String,
}

/// Read one process from `/proc`.
///
/// # Errors
/// [`ProcessError::ProcessNotFound`] if the process is gone.
pub fn read_process(pid: Pid) -> Result<ProcessInfo, ProcessError> {
    let stat = fs::read_to_string(format!("/proc/{}/stat", pid.0))
        .map_err(|_| ProcessError::ProcessNotFound(pid))?;
    let name = extract_comm(&stat).ok_or(ProcessError::ProcessNotFound(pid))?;
    let full_path = fs::read_link(format!("/proc/{}/exe", pid.0)).ok();
    let command_line = fs::read(format!("/proc/{}/cmdline", pid.0))
        .map(|raw| {
            raw.split(|&b| b == 0)
                .filter(|arg| !arg.is_empty())
                .map(|arg| String::from_utf8_lossy(arg).into_owned())
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default();
    Ok(ProcessInfo { pid, name, full_path, command_line })
}

/// Every process readable in `/proc`, sorted by pid.
///
/// # Errors
/// `/proc` itself cannot be listed.
pub fn list_processes() -> Result<Vec<ProcessInfo>, ProcessError> {
    let mut processes: Vec<ProcessInfo> = fs::read_dir("/proc")?
        .flatten()
        .filter_map(|entry| entry.file_name().to_string_lossy().parse::<i32>().ok())
        .filter_map(|pid| read_process(Pid(pid)).ok())
        .collect();
    processes.sort_by_key(|p| p.pid.0);
    Ok(processes)
}

/// Find the single process whose command name or executable matches `name`.
///
/// # Errors
/// No match, or more than one.
pub fn find_process_by_name(name: &str) -> Result<ProcessInfo, ProcessError> {
    let mut matches: Vec<ProcessInfo> =
        list_processes()?.into_iter().filter(|p| is_match(p, name)).collect();

    match matches.len() {
        0 => Err(ProcessError::NoProcessMatches(name.to_string())),
        1 => Ok(matches.remove(0)),
        _ => {
            let list: Vec<String> =
                matches.iter().map(|m| format!("  {} ({})", m.pid, m.name)).collect();
            Err(ProcessError::AmbiguousProcessName {
                name: name.to_string(),
                candidates: list.join("\n"),
            })
        }
    }
}

/// Command name from a `/proc/<pid>/stat` line: `pid (comm) state ...`.
/// The name may itself contain parentheses.
fn extract_comm(stat_line: &str) -> Option<String> {
    let open = stat_line.find('(')?;
    let close = stat_line.rfind(')')?;
    (open < close).then(|| stat_line[open + 1..close].to_string())
}

fn is_match(process: &ProcessInfo, pattern: &str) -> bool {
    let exe_basename = process
        .full_path
        .as_deref()
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let pattern_basename =
        Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);

    process.name == pattern_basename
        || exe_basename == pattern_basename
        || process.name.contains(pattern)
        || exe_basename.contains(pattern)
}

type ListSource = Box<dyn Fn() -> Result<Vec<ProcessInfo>, ProcessError> + Send>;

struct Shared {
    processes: Mutex<Vec<ProcessInfo>>,
    shutdown: Mutex<bool>,
    wake: Condvar,
}

pub struct ProcessListManager {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessListManager {
    /// Start refreshing from `/proc`.
    ///
    /// # Errors
    /// Thread spawn failure.
    pub fn start(refresh_period: Duration) -> io::Result<Self> {
        Self::start_with_source(refresh_period, Box::new(list_processes))
    }

    /// Start refreshing from a custom source. The first refresh runs before
    /// this returns.
    ///
    /// # Errors
    /// Thread spawn failure.
    pub fn start_with_source(refresh_period: Duration, source: ListSource) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            processes: Mutex::new(Vec::new()),
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
        });
        refresh(&shared, &source);

        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("trawl-proclist".to_string())
                .spawn(move || refresh_loop(&shared, &source, refresh_period))?
        };
        Ok(Self { shared, thread: Mutex::new(Some(thread)) })
    }

    #[must_use]
    pub fn process_list(&self) -> Vec<ProcessInfo> {
        lock(&self.shared.processes).clone()
    }

    #[must_use]
    pub fn process(&self, pid: Pid) -> Option<ProcessInfo> {
        lock(&self.shared.processes).iter().find(|p| p.pid == pid).cloned()
    }

    /// Stop the refresh thread and wait for it. Idempotent.
    pub fn shutdown(&self) {
        *lock(&self.shared.shutdown) = true;
        self.shared.wake.notify_all();
        if let Some(thread) = lock(&self.thread).take() {
            if thread.join().is_err() {
                warn!("Process list refresh thread panicked");
            }
        }
    }
}

impl Drop for ProcessListManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn refresh(shared: &Shared, source: &ListSource) {
    match source() {
        Ok(processes) => {
            debug!("Process list refreshed: {} processes", processes.len());
            *lock(&shared.processes) = processes;
        }
        Err(e) => warn!("Process list refresh failed: {e}"),
    }
}

fn refresh_loop(shared: &Shared, source: &ListSource, period: Duration) {
    loop {
        {
            let stopped = lock(&shared.shutdown);
            let (stopped, _) = shared
                .wake
                .wait_timeout_while(stopped, period, |stopped| !*stopped)
                .unwrap_or_else(PoisonError::into_inner);
            if *stopped {
                return;
            }
        }
        refresh(shared, source);
    }
}
