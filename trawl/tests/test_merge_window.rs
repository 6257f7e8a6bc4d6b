use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use trawl::api::{scope_to_events, Scope, ScopeGuard, TracingListener};
use trawl::client::{
    CaptureData, CaptureEventProcessor, EventMerger, TimerKind, DEFAULT_MERGE_WINDOW_NS,
};
use trawl::clock::{current_tid, monotonic_timestamp_ns};
use trawl::domain::Pid;
use trawl_common::{CaptureEvent, OutOfOrderEventsDiscardedEvent, ThreadName};

fn tick(tid: i32, timestamp_ns: u64) -> CaptureEvent {
    CaptureEvent::ThreadName(ThreadName { pid: 1, tid, timestamp_ns, name: "tick".into() })
}

/// Merger fed from several threads, releasing into one ordered log.
#[derive(Clone)]
struct SharedMerger {
    merger: Arc<Mutex<EventMerger>>,
    released: Arc<Mutex<Vec<CaptureEvent>>>,
}

impl SharedMerger {
    fn new(window_ns: u64) -> Self {
        Self {
            merger: Arc::new(Mutex::new(EventMerger::new(window_ns))),
            released: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn push(&self, events: impl IntoIterator<Item = CaptureEvent>) {
        let mut merger = self.merger.lock().unwrap();
        for event in events {
            merger.push(event);
        }
        merger.drain_ready(|event| self.released.lock().unwrap().push(event));
    }

    fn finish(&self) -> (Vec<CaptureEvent>, u64) {
        let mut merger = self.merger.lock().unwrap();
        merger.drain_all(|event| self.released.lock().unwrap().push(event));
        (std::mem::take(&mut *self.released.lock().unwrap()), merger.total_discarded())
    }
}

#[test]
fn test_scope_longer_than_merge_window_yields_one_timer() {
    let merger = SharedMerger::new(DEFAULT_MERGE_WINDOW_NS);
    let listener = {
        let merger = merger.clone();
        TracingListener::install(move |scope: &Scope| merger.push(scope_to_events(scope)))
            .unwrap()
    };

    let scope_ns = 2 * DEFAULT_MERGE_WINDOW_NS + DEFAULT_MERGE_WINDOW_NS / 2;
    let worker = thread::spawn(move || {
        let _scope = ScopeGuard::new("load_level");
        thread::sleep(Duration::from_nanos(scope_ns));
        current_tid()
    });

    // Other events keep arriving while the scope is open, moving the
    // release horizon well past the scope's start.
    while !worker.is_finished() {
        merger.push([tick(999, monotonic_timestamp_ns())]);
        thread::sleep(Duration::from_millis(5));
    }
    let worker_tid = worker.join().unwrap();
    listener.flush();
    drop(listener);

    let (events, discarded) = merger.finish();
    assert_eq!(discarded, 0);

    let mut processor = CaptureEventProcessor::new(CaptureData::new(Pid(1), "self"));
    for event in events {
        processor.process_event(event);
    }
    let capture = processor.into_listener();
    let timers = capture.timers_of_thread(worker_tid);
    assert_eq!(timers.len(), 1);
    assert_eq!(timers[0].kind, TimerKind::ApiScope);
    assert_eq!(timers[0].name, "load_level");
    assert_eq!(timers[0].depth, 0);
    assert!(timers[0].end_ns - timers[0].start_ns >= scope_ns);
    assert_eq!(capture.summary().out_of_order_discarded, 0);
}

#[test]
fn test_events_behind_released_horizon_are_reported() {
    let merger = SharedMerger::new(100);
    merger.push([tick(1, 1_000), tick(1, 1_100)]);

    // Equal to the last released timestamp: still placeable.
    merger.push([tick(2, 1_000)]);
    // Older than the last released timestamp: discarded.
    merger.push([tick(3, 999), tick(3, 950)]);

    let (events, discarded) = merger.finish();
    assert_eq!(discarded, 2);

    let order: Vec<(u64, i32)> = events.iter().map(|e| (e.timestamp_ns(), e.tid())).collect();
    assert_eq!(order[..2], [(1_000, 1), (1_000, 2)]);
    assert_eq!(*order.last().unwrap(), (1_100, 1));

    let reports: Vec<&OutOfOrderEventsDiscardedEvent> = events
        .iter()
        .filter_map(|event| match event {
            CaptureEvent::OutOfOrderEventsDiscardedEvent(report) => Some(report),
            _ => None,
        })
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].num_discarded, 2);
    assert_eq!(reports[0].end_timestamp_ns, 999);
    assert_eq!(reports[0].duration_ns, 49);

    let mut processor = CaptureEventProcessor::new(CaptureData::new(Pid(1), "app"));
    for event in events {
        processor.process_event(event);
    }
    assert_eq!(processor.into_listener().summary().out_of_order_discarded, 2);
}
