//! Dynamic instrumentation of the functions a capture asks for.
//!
//! For each [`InstrumentedFunction`] the manager classifies the hook, attaches
//! a probe through the configured [`ProbeBackend`] and turns every hit into a
//! `FunctionCall` event on the producer's [`EventSink`]. Functions that cannot
//! be instrumented are collected and reported as a single warning event.

use log::{info, warn};
use std::sync::{Arc, Mutex};
use trawl_common::{
    CaptureEvent, CaptureOptions, ErrorEvent, ErrorKind, FunctionCall, InstrumentedFunction,
    WarningEvent, WarningKind,
};

use super::classification::classify_function;
use super::probe::{FunctionHit, HitCallback, ProbeBackend, ProbeHandle, ProbeTarget};
use crate::clock::{current_pid, current_tid, lock, monotonic_timestamp_ns};
use crate::domain::{InstrumentationError, Pid};
use crate::producer::{EventSink, ProducerHooks};

/// Outcome of [`DynamicInstrumentationManager::start`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstrumentationReport {
    pub instrumented: usize,
    pub file_io_hooks: usize,
    /// `(function_id, reason)` for every function left uninstrumented.
    pub failed: Vec<(u64, String)>,
}

struct Session {
    pid: Pid,
    handles: Vec<ProbeHandle>,
}

pub struct DynamicInstrumentationManager {
    backend: Arc<dyn ProbeBackend>,
    session: Mutex<Option<Session>>,
}

impl DynamicInstrumentationManager {
    #[must_use]
    pub fn new(backend: Arc<dyn ProbeBackend>) -> Self {
        Self { backend, session: Mutex::new(None) }
    }

    /// Instrument every function in `options` and relay hits to `sink`.
    ///
    /// # Errors
    /// [`InstrumentationError::AlreadyRunning`] if a session is active.
    /// Per-function failures do not fail the call; they are returned in the
    /// report and sent as one `WarningEvent`.
    pub fn start(
        &self,
        options: &CaptureOptions,
        sink: &EventSink,
    ) -> Result<InstrumentationReport, InstrumentationError> {
        let mut session = lock(&self.session);
        if let Some(active) = session.as_ref() {
            return Err(InstrumentationError::AlreadyRunning(active.pid));
        }

        let mut report = InstrumentationReport::default();
        let mut handles = Vec::with_capacity(options.instrumented_functions.len());
        for function in &options.instrumented_functions {
            let kind = classify_function(&function.file_path, &function.function_name);
            let target = ProbeTarget {
                file_path: function.file_path.clone(),
                file_offset: function.file_offset,
                function_name: function.function_name.clone(),
                kind,
            };
            match self.backend.attach(&target, relay_hits(function.function_id, sink.clone())) {
                Ok(handle) => {
                    handles.push(handle);
                    report.instrumented += 1;
                    if kind.is_file_io() {
                        report.file_io_hooks += 1;
                    }
                }
                Err(e) => report.failed.push((function.function_id, e.to_string())),
            }
        }

        if !report.failed.is_empty() {
            warn!(
                "{} of {} functions could not be instrumented",
                report.failed.len(),
                options.instrumented_functions.len()
            );
            sink.enqueue(CaptureEvent::WarningEvent(WarningEvent {
                pid: options.pid,
                tid: current_tid(),
                timestamp_ns: monotonic_timestamp_ns(),
                kind: WarningKind::InstrumentingWithUserSpaceInstrumentation,
                message: failure_message(&options.instrumented_functions, &report.failed),
            }));
        }
        info!(
            "Instrumented {} functions in PID:{} ({} file I/O)",
            report.instrumented, options.pid, report.file_io_hooks
        );

        *session = Some(Session { pid: Pid(options.pid), handles });
        Ok(report)
    }

    /// Remove every probe of the active session.
    pub fn stop(&self) {
        if let Some(session) = lock(&self.session).take() {
            for handle in session.handles {
                self.backend.detach(handle);
            }
            info!("Removed instrumentation from {}", session.pid);
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        lock(&self.session).is_some()
    }
}

impl ProducerHooks for DynamicInstrumentationManager {
    fn on_capture_start(&self, options: &CaptureOptions, sink: &EventSink) {
        if options.instrumented_functions.is_empty() {
            return;
        }
        if let Err(e) = self.start(options, sink) {
            warn!("Dynamic instrumentation not started: {e}");
            sink.enqueue(CaptureEvent::ErrorEvent(ErrorEvent {
                pid: current_pid(),
                tid: current_tid(),
                timestamp_ns: monotonic_timestamp_ns(),
                kind: ErrorKind::ErrorEnablingUserSpaceInstrumentation,
                message: e.to_string(),
            }));
        }
    }

    fn on_capture_stop(&self) {
        self.stop();
    }
}

fn relay_hits(function_id: u64, sink: EventSink) -> HitCallback {
    Arc::new(move |hit: &FunctionHit| {
        sink.enqueue(CaptureEvent::FunctionCall(FunctionCall {
            pid: hit.pid,
            tid: hit.tid,
            function_id,
            duration_ns: hit.end_ns.saturating_sub(hit.start_ns),
            end_timestamp_ns: hit.end_ns,
            depth: hit.depth,
            return_value: hit.return_value,
        }));
    })
}

fn failure_message(functions: &[InstrumentedFunction], failed: &[(u64, String)]) -> String {
    let lines: Vec<String> = failed
        .iter()
        .map(|(id, reason)| {
            let name = functions
                .iter()
                .find(|f| f.function_id == *id)
                .map_or("<unknown>", |f| f.function_name.as_str());
            format!("{name}: {reason}")
        })
        .collect();
    format!("Failed to instrument {} function(s):\n{}", failed.len(), lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrumentation::SoftwareProbeBackend;
    use crate::producer::{CaptureEventProducer, ProducerConfig};
    use crate::service::{in_process_channel, BidiStream};
    use std::time::Duration;
    use trawl_common::{ProducerMessage, ServerCommand};

    fn function(id: u64, file_path: &str, name: &str) -> InstrumentedFunction {
        InstrumentedFunction {
            function_id: id,
            file_path: file_path.to_string(),
            file_offset: 0x40,
            function_name: name.to_string(),
        }
    }

    #[test]
    fn test_failures_reported_as_one_warning() {
        let module = tempfile::NamedTempFile::new().unwrap();
        let path = module.path().to_string_lossy().into_owned();
        let backend = Arc::new(SoftwareProbeBackend::new());
        let manager = Arc::new(DynamicInstrumentationManager::new(backend.clone()));

        let (server, producer_end) = in_process_channel::<ServerCommand, ProducerMessage>();
        let config =
            ProducerConfig { max_batch_size: 1024, flush_interval: Duration::from_secs(60) };
        let hooks = vec![manager.clone() as Arc<dyn ProducerHooks>];
        let producer =
            CaptureEventProducer::connect(Arc::new(producer_end), config, hooks).unwrap();

        let options = CaptureOptions {
            pid: 77,
            instrumented_functions: vec![
                function(1, &path, "decode"),
                function(2, "/missing/liba.so", "a"),
                function(3, "/missing/libb.so", "b"),
            ],
            ..CaptureOptions::default()
        };
        assert!(server.write(ServerCommand::StartCapture { capture_options: options }));
        while !manager.is_running() {
            std::thread::yield_now();
        }
        assert_eq!(backend.probe_count(), 1);

        {
            let _hit = backend.enter(&path, "decode").unwrap();
        }
        assert!(server.write(ServerCommand::StopCapture));

        let mut events = Vec::new();
        while let Some(ProducerMessage::BufferedCaptureEvents { events: batch }) = server.read() {
            events.extend(batch);
        }
        let warnings: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::WarningEvent(w) => Some(w),
                _ => None,
            })
            .collect();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].kind, WarningKind::InstrumentingWithUserSpaceInstrumentation);
        assert!(warnings[0].message.contains("a:") && warnings[0].message.contains("b:"));

        let calls: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CaptureEvent::FunctionCall(c) => Some(c),
                _ => None,
            })
            .collect();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].function_id, 1);

        assert_eq!(backend.probe_count(), 0);
        assert!(!manager.is_running());
        drop(producer);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let backend = Arc::new(SoftwareProbeBackend::new());
        let manager = DynamicInstrumentationManager::new(backend);
        let (_server, producer_end) = in_process_channel::<ServerCommand, ProducerMessage>();
        let producer = CaptureEventProducer::connect(
            Arc::new(producer_end),
            ProducerConfig::default(),
            Vec::new(),
        )
        .unwrap();
        let sink = producer.sink();

        let options = CaptureOptions { pid: 5, ..CaptureOptions::default() };
        let report = manager.start(&options, &sink).unwrap();
        assert_eq!(report, InstrumentationReport::default());
        assert!(matches!(
            manager.start(&options, &sink),
            Err(InstrumentationError::AlreadyRunning(Pid(5)))
        ));
        manager.stop();
        assert!(manager.start(&options, &sink).is_ok());
    }
}
