//! Probe backends.
//!
//! A [`ProbeBackend`] installs one probe per instrumented function and calls
//! the registered [`HitCallback`] once per completed call.
//! [`SoftwareProbeBackend`] is the in-process backend: instrumented code
//! brackets a function body with [`SoftwareProbeBackend::enter`] and the
//! returned [`HitGuard`] reports the call when dropped.

use log::debug;
use std::cell::Cell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::classification::HookKind;
use crate::clock::{current_pid, current_tid, lock, monotonic_timestamp_ns};
use crate::domain::InstrumentationError;

/// One completed call of a probed function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionHit {
    pub pid: i32,
    pub tid: i32,
    pub start_ns: u64,
    pub end_ns: u64,
    /// Probed calls already open on this thread when the call started.
    pub depth: u32,
    pub return_value: u64,
}

pub type HitCallback = Arc<dyn Fn(&FunctionHit) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeHandle(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub file_path: String,
    pub file_offset: u64,
    pub function_name: String,
    pub kind: HookKind,
}

pub trait ProbeBackend: Send + Sync {
    /// # Errors
    /// The backend could not place the probe.
    fn attach(
        &self,
        target: &ProbeTarget,
        on_hit: HitCallback,
    ) -> Result<ProbeHandle, InstrumentationError>;

    fn detach(&self, handle: ProbeHandle);

    fn probe_count(&self) -> usize;
}

struct SoftwareProbe {
    handle: ProbeHandle,
    kind: HookKind,
    on_hit: HitCallback,
}

thread_local! {
    static OPEN_HITS: Cell<u32> = const { Cell::new(0) };
}

/// Probes keyed by `(file_path, function_name)`, fired by the instrumented
/// code itself.
#[derive(Default)]
pub struct SoftwareProbeBackend {
    probes: Mutex<HashMap<(String, String), SoftwareProbe>>,
    next_handle: AtomicU64,
}

impl SoftwareProbeBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a probed call. `None` if no probe is attached to the function.
    #[must_use]
    pub fn enter(&self, file_path: &str, function_name: &str) -> Option<HitGuard> {
        let (kind, on_hit) = {
            let probes = lock(&self.probes);
            let probe = probes.get(&(file_path.to_string(), function_name.to_string()))?;
            (probe.kind, Arc::clone(&probe.on_hit))
        };
        let depth = OPEN_HITS.with(|open| {
            let depth = open.get();
            open.set(depth + 1);
            depth
        });
        Some(HitGuard {
            on_hit,
            kind,
            depth,
            start_ns: monotonic_timestamp_ns(),
            return_value: 0,
            _thread_bound: PhantomData,
        })
    }
}

impl ProbeBackend for SoftwareProbeBackend {
    fn attach(
        &self,
        target: &ProbeTarget,
        on_hit: HitCallback,
    ) -> Result<ProbeHandle, InstrumentationError> {
        if !Path::new(&target.file_path).exists() {
            return Err(InstrumentationError::ModuleNotMapped(target.file_path.clone()));
        }
        let key = (target.file_path.clone(), target.function_name.clone());
        let mut probes = lock(&self.probes);
        if probes.contains_key(&key) {
            return Err(InstrumentationError::ProbeAttachFailed {
                module: target.file_path.clone(),
                function: target.function_name.clone(),
                reason: "already instrumented".to_string(),
            });
        }
        let handle = ProbeHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        probes.insert(key, SoftwareProbe { handle, kind: target.kind, on_hit });
        debug!("Attached {handle:?} to {} in {}", target.function_name, target.file_path);
        Ok(handle)
    }

    fn detach(&self, handle: ProbeHandle) {
        lock(&self.probes).retain(|_, probe| probe.handle != handle);
    }

    fn probe_count(&self) -> usize {
        lock(&self.probes).len()
    }
}

/// Open probed call; reports a [`FunctionHit`] when dropped.
///
/// The guard must be dropped on the thread that entered the call, since it
/// unwinds that thread's nesting depth:
///
/// ```compile_fail
/// fn assert_send<T: Send>() {}
/// assert_send::<trawl::instrumentation::HitGuard>();
/// ```
#[must_use = "the call is reported as soon as the guard is dropped"]
pub struct HitGuard {
    on_hit: HitCallback,
    kind: HookKind,
    depth: u32,
    start_ns: u64,
    return_value: u64,
    _thread_bound: PhantomData<*const ()>,
}

impl HitGuard {
    /// Record the function's return value. Ignored by generic hooks.
    pub fn set_return_value(&mut self, value: u64) {
        if self.kind.records_return_value() {
            self.return_value = value;
        }
    }
}

impl Drop for HitGuard {
    fn drop(&mut self) {
        OPEN_HITS.with(|open| open.set(open.get().saturating_sub(1)));
        (self.on_hit)(&FunctionHit {
            pid: current_pid(),
            tid: current_tid(),
            start_ns: self.start_ns,
            end_ns: monotonic_timestamp_ns(),
            depth: self.depth,
            return_value: self.return_value,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::classification::FileIoOp;

    fn target(file: &Path, name: &str, kind: HookKind) -> ProbeTarget {
        ProbeTarget {
            file_path: file.to_string_lossy().into_owned(),
            file_offset: 0x1000,
            function_name: name.to_string(),
            kind,
        }
    }

    fn recorder() -> (HitCallback, Arc<Mutex<Vec<FunctionHit>>>) {
        let hits = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&hits);
        (Arc::new(move |hit: &FunctionHit| sink.lock().unwrap().push(*hit)), hits)
    }

    #[test]
    fn test_nested_hits_record_depth() {
        let module = tempfile::NamedTempFile::new().unwrap();
        let backend = SoftwareProbeBackend::new();
        let (on_hit, hits) = recorder();
        let outer = target(module.path(), "outer", HookKind::Generic);
        backend.attach(&outer, Arc::clone(&on_hit)).unwrap();
        backend.attach(&target(module.path(), "inner", HookKind::Generic), on_hit).unwrap();

        let path = module.path().to_string_lossy().into_owned();
        {
            let _outer = backend.enter(&path, "outer").unwrap();
            let _inner = backend.enter(&path, "inner").unwrap();
        }

        let hits = hits.lock().unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].depth, 1);
        assert_eq!(hits[1].depth, 0);
        assert!(hits[1].start_ns <= hits[0].start_ns);
        assert!(hits[0].end_ns <= hits[1].end_ns);
    }

    #[test]
    fn test_missing_module_fails_to_attach() {
        let backend = SoftwareProbeBackend::new();
        let (on_hit, _) = recorder();
        let err = backend
            .attach(&target(Path::new("/nonexistent/libfoo.so"), "f", HookKind::Generic), on_hit)
            .unwrap_err();
        assert!(matches!(err, InstrumentationError::ModuleNotMapped(_)));
        assert_eq!(backend.probe_count(), 0);
    }

    #[test]
    fn test_return_value_only_for_file_io() {
        let module = tempfile::NamedTempFile::new().unwrap();
        let backend = SoftwareProbeBackend::new();
        let (on_hit, hits) = recorder();
        let read = target(module.path(), "read", HookKind::FileIo(FileIoOp::Read));
        backend.attach(&read, Arc::clone(&on_hit)).unwrap();
        backend.attach(&target(module.path(), "compute", HookKind::Generic), on_hit).unwrap();

        let path = module.path().to_string_lossy().into_owned();
        backend.enter(&path, "read").unwrap().set_return_value(512);
        backend.enter(&path, "compute").unwrap().set_return_value(7);

        let hits = hits.lock().unwrap();
        assert_eq!(hits[0].return_value, 512);
        assert_eq!(hits[1].return_value, 0);
    }

    #[test]
    fn test_detached_probe_no_longer_fires() {
        let module = tempfile::NamedTempFile::new().unwrap();
        let backend = SoftwareProbeBackend::new();
        let (on_hit, _) = recorder();
        let handle =
            backend.attach(&target(module.path(), "f", HookKind::Generic), on_hit).unwrap();
        backend.detach(handle);
        assert!(backend.enter(&module.path().to_string_lossy(), "f").is_none());
    }
}
