//! # Capture Event Producer
//!
//! Producer end of the service link. Event sources push into an [`EventSink`];
//! the producer batches those events and ships them as
//! `BufferedCaptureEvents` messages.
//!
//! ## Threads
//!
//! - **Command reader**: reads `StartCapture` / `StopCapture` /
//!   `CaptureFinished` and drives the [`ProducerHooks`]
//! - **Flusher**: sends the pending batch every `flush_interval`, or as soon as
//!   it reaches `max_batch_size`
//!
//! ## Stop Sequence
//!
//! On `StopCapture` the hooks' `on_capture_stop` runs first (sources may still
//! enqueue final events), then the sink closes, the last batch is flushed and
//! `AllEventsSent` follows it on the wire. Closing the sink and taking the last
//! batch happen under the same lock as every enqueue, so no event can land in
//! the buffer after `AllEventsSent`.

use log::{debug, info, warn};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use trawl_common::{CaptureEvent, CaptureOptions, ProducerMessage, ServerCommand};

use crate::clock::lock;
use crate::service::BidiStream;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 4096;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub max_batch_size: usize,
    pub flush_interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self { max_batch_size: DEFAULT_MAX_BATCH_SIZE, flush_interval: DEFAULT_FLUSH_INTERVAL }
    }
}

/// Event sources attached to a producer.
///
/// All methods run on the command-reader thread, in registration order.
pub trait ProducerHooks: Send + Sync {
    fn on_capture_start(&self, _options: &CaptureOptions, _sink: &EventSink) {}

    fn on_capture_stop(&self) {}

    fn on_capture_finished(&self) {}
}

pub type ProducerLink = dyn BidiStream<ProducerMessage, ServerCommand>;

#[derive(Default)]
struct Pending {
    capturing: bool,
    events: Vec<CaptureEvent>,
}

struct Shared {
    stream: Arc<ProducerLink>,
    config: ProducerConfig,
    pending: Mutex<Pending>,
    /// Held from taking a batch until it is written.
    send_lock: Mutex<()>,
    shutdown: Mutex<bool>,
    wake: Condvar,
    events_sent: AtomicU64,
    events_rejected: AtomicU64,
}

impl Shared {
    fn flush(&self) -> bool {
        let _send = lock(&self.send_lock);
        self.send_pending()
    }

    fn is_capturing(&self) -> bool {
        lock(&self.pending).capturing
    }

    /// Open the sink for a new capture. False if one is already running.
    fn begin_capture(&self) -> bool {
        let mut pending = lock(&self.pending);
        if pending.capturing {
            return false;
        }
        if !pending.events.is_empty() {
            debug!("Discarding {} events left from an earlier capture", pending.events.len());
            pending.events.clear();
        }
        pending.capturing = true;
        true
    }

    /// Close the sink. True if a capture was running.
    fn close_sink(&self) -> bool {
        std::mem::replace(&mut lock(&self.pending).capturing, false)
    }

    /// Caller holds `send_lock`.
    fn send_pending(&self) -> bool {
        let events = std::mem::take(&mut lock(&self.pending).events);
        self.send_batch(events)
    }

    /// Caller holds `send_lock`.
    fn send_batch(&self, events: Vec<CaptureEvent>) -> bool {
        if events.is_empty() {
            return true;
        }
        let count = events.len() as u64;
        if self.stream.write(ProducerMessage::BufferedCaptureEvents { events }) {
            self.events_sent.fetch_add(count, Ordering::Relaxed);
            true
        } else {
            debug!("Dropped batch of {count} events, stream closed");
            false
        }
    }

    fn finish_capture(&self) {
        let _send = lock(&self.send_lock);
        let last_batch = {
            let mut pending = lock(&self.pending);
            pending.capturing = false;
            std::mem::take(&mut pending.events)
        };
        if !self.send_batch(last_batch) || !self.stream.write(ProducerMessage::AllEventsSent) {
            debug!("Stream closed before AllEventsSent");
        }
    }
}

/// Cloneable handle event sources enqueue into.
#[derive(Clone)]
pub struct EventSink {
    shared: Arc<Shared>,
}

impl EventSink {
    /// Queue `event` for the next batch. Returns false, dropping the event,
    /// when no capture is running.
    pub fn enqueue(&self, event: CaptureEvent) -> bool {
        let full = {
            let mut pending = lock(&self.shared.pending);
            if !pending.capturing {
                drop(pending);
                self.shared.events_rejected.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            pending.events.push(event);
            pending.events.len() >= self.shared.config.max_batch_size
        };
        if full {
            self.shared.wake.notify_one();
        }
        true
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.shared.is_capturing()
    }
}

pub struct CaptureEventProducer {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl CaptureEventProducer {
    /// Attach to `stream` and start the reader and flusher threads.
    ///
    /// # Errors
    /// Thread spawn failures.
    pub fn connect<S>(
        stream: Arc<S>,
        config: ProducerConfig,
        hooks: Vec<Arc<dyn ProducerHooks>>,
    ) -> io::Result<Self>
    where
        S: BidiStream<ProducerMessage, ServerCommand> + 'static,
    {
        let shared = Arc::new(Shared {
            stream,
            config,
            pending: Mutex::new(Pending::default()),
            send_lock: Mutex::new(()),
            shutdown: Mutex::new(false),
            wake: Condvar::new(),
            events_sent: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
        });

        let flusher = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("trawl-flush".to_string())
                .spawn(move || flush_loop(&shared))?
        };
        let reader = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("trawl-commands".to_string())
                .spawn(move || command_loop(&shared, &hooks))
        };
        let reader = match reader {
            Ok(handle) => handle,
            Err(e) => {
                *lock(&shared.shutdown) = true;
                shared.wake.notify_all();
                let _ = flusher.join();
                return Err(e);
            }
        };

        Ok(Self { shared, threads: Mutex::new(vec![reader, flusher]) })
    }

    #[must_use]
    pub fn sink(&self) -> EventSink {
        EventSink { shared: Arc::clone(&self.shared) }
    }

    #[must_use]
    pub fn is_capturing(&self) -> bool {
        self.shared.is_capturing()
    }

    #[must_use]
    pub fn events_sent(&self) -> u64 {
        self.shared.events_sent.load(Ordering::Relaxed)
    }

    /// Events enqueued while no capture was running.
    #[must_use]
    pub fn events_rejected(&self) -> u64 {
        self.shared.events_rejected.load(Ordering::Relaxed)
    }

    /// Cancel the stream and join both threads. Idempotent.
    pub fn shutdown(&self) {
        *lock(&self.shared.shutdown) = true;
        self.shared.wake.notify_all();
        self.shared.stream.try_cancel();

        let threads = std::mem::take(&mut *lock(&self.threads));
        for handle in threads {
            if handle.join().is_err() {
                warn!("Producer thread panicked");
            }
        }
    }
}

impl Drop for CaptureEventProducer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flush_loop(shared: &Shared) {
    let mut stopped = lock(&shared.shutdown);
    while !*stopped {
        stopped = shared
            .wake
            .wait_timeout(stopped, shared.config.flush_interval)
            .unwrap_or_else(PoisonError::into_inner)
            .0;
        if *stopped {
            break;
        }
        drop(stopped);
        shared.flush();
        stopped = lock(&shared.shutdown);
    }
}

fn command_loop(shared: &Arc<Shared>, hooks: &[Arc<dyn ProducerHooks>]) {
    let sink = EventSink { shared: Arc::clone(shared) };

    while let Some(command) = shared.stream.read() {
        match command {
            ServerCommand::StartCapture { capture_options } => {
                if !shared.begin_capture() {
                    debug!("StartCapture while capturing, ignoring");
                    continue;
                }
                info!("Capture of PID:{} started", capture_options.pid);
                for hook in hooks {
                    hook.on_capture_start(&capture_options, &sink);
                }
            }
            ServerCommand::StopCapture => {
                if !shared.is_capturing() {
                    debug!("StopCapture while idle, ignoring");
                    continue;
                }
                for hook in hooks {
                    hook.on_capture_stop();
                }
                shared.finish_capture();
                info!("All events sent ({} total)", shared.events_sent.load(Ordering::Relaxed));
            }
            ServerCommand::CaptureFinished => {
                for hook in hooks {
                    hook.on_capture_finished();
                }
            }
        }
    }

    if shared.close_sink() {
        for hook in hooks {
            hook.on_capture_stop();
        }
    }
    debug!("Command stream ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{in_process_channel, ChannelStream};
    use trawl_common::ThreadName;

    type ServerEnd = ChannelStream<ServerCommand, ProducerMessage>;

    fn thread_name(tid: i32) -> CaptureEvent {
        CaptureEvent::ThreadName(ThreadName {
            pid: 9,
            tid,
            timestamp_ns: 5,
            name: "worker".into(),
        })
    }

    fn start_command() -> ServerCommand {
        ServerCommand::StartCapture {
            capture_options: CaptureOptions { pid: 9, ..CaptureOptions::default() },
        }
    }

    /// Emits one event per tid in `tids` at capture start.
    struct Emitter {
        tids: Vec<i32>,
        stopped: Mutex<u32>,
    }

    impl ProducerHooks for Emitter {
        fn on_capture_start(&self, _options: &CaptureOptions, sink: &EventSink) {
            for &tid in &self.tids {
                assert!(sink.enqueue(thread_name(tid)));
            }
        }

        fn on_capture_stop(&self) {
            *self.stopped.lock().unwrap() += 1;
        }
    }

    fn connect(
        config: ProducerConfig,
        hooks: Vec<Arc<dyn ProducerHooks>>,
    ) -> (CaptureEventProducer, ServerEnd) {
        let (server, producer_end) = in_process_channel::<ServerCommand, ProducerMessage>();
        let producer =
            CaptureEventProducer::connect(Arc::new(producer_end), config, hooks).unwrap();
        (producer, server)
    }

    fn collect_until_all_events_sent(server: &ServerEnd) -> Vec<i32> {
        let mut tids = Vec::new();
        loop {
            match server.read() {
                Some(ProducerMessage::BufferedCaptureEvents { events }) => {
                    tids.extend(events.iter().map(CaptureEvent::tid));
                }
                Some(ProducerMessage::AllEventsSent) => return tids,
                None => panic!("stream ended before AllEventsSent"),
            }
        }
    }

    #[test]
    fn test_enqueue_outside_capture_is_rejected() {
        let (producer, _server) = connect(ProducerConfig::default(), Vec::new());
        assert!(!producer.sink().enqueue(thread_name(1)));
        assert_eq!(producer.events_rejected(), 1);
    }

    #[test]
    fn test_stop_flushes_then_sends_all_events_sent() {
        let emitter = Arc::new(Emitter { tids: (0..10).collect(), stopped: Mutex::new(0) });
        let config = ProducerConfig { max_batch_size: 3, flush_interval: Duration::from_secs(60) };
        let (producer, server) = connect(config, vec![emitter.clone() as Arc<dyn ProducerHooks>]);

        assert!(server.write(start_command()));
        assert!(server.write(ServerCommand::StopCapture));

        assert_eq!(collect_until_all_events_sent(&server), (0..10).collect::<Vec<_>>());
        assert_eq!(*emitter.stopped.lock().unwrap(), 1);
        assert!(!producer.is_capturing());
        assert_eq!(producer.events_sent(), 10);
    }

    #[test]
    fn test_flush_interval_ships_partial_batch() {
        let emitter = Arc::new(Emitter { tids: vec![4], stopped: Mutex::new(0) });
        let config =
            ProducerConfig { max_batch_size: 1000, flush_interval: Duration::from_millis(5) };
        let (_producer, server) = connect(config, vec![emitter as Arc<dyn ProducerHooks>]);

        assert!(server.write(start_command()));
        match server.read() {
            Some(ProducerMessage::BufferedCaptureEvents { events }) => assert_eq!(events.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_start_and_idle_stop_are_ignored() {
        let emitter = Arc::new(Emitter { tids: vec![1], stopped: Mutex::new(0) });
        let hooks = vec![emitter.clone() as Arc<dyn ProducerHooks>];
        let (_producer, server) = connect(ProducerConfig::default(), hooks);

        assert!(server.write(ServerCommand::StopCapture));
        assert!(server.write(start_command()));
        assert!(server.write(start_command()));
        assert!(server.write(ServerCommand::StopCapture));

        assert_eq!(collect_until_all_events_sent(&server), vec![1]);
        assert_eq!(*emitter.stopped.lock().unwrap(), 1);
    }

    #[test]
    fn test_shutdown_stops_running_capture() {
        let emitter = Arc::new(Emitter { tids: Vec::new(), stopped: Mutex::new(0) });
        let hooks = vec![emitter.clone() as Arc<dyn ProducerHooks>];
        let (producer, server) = connect(ProducerConfig::default(), hooks);
        assert!(server.write(start_command()));
        while !producer.is_capturing() {
            std::thread::yield_now();
        }
        producer.shutdown();
        assert_eq!(*emitter.stopped.lock().unwrap(), 1);
    }
}
