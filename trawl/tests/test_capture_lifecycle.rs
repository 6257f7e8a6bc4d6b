use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use trawl::client::{CaptureConsumer, CaptureData, DEFAULT_MERGE_WINDOW_NS};
use trawl::domain::{Pid, ProducerId};
use trawl::producer::{CaptureEventProducer, EventSink, ProducerConfig, ProducerHooks};
use trawl::service::{
    in_process_channel, BidiStream, CaptureStatus, ChannelStream, FramedUnixStream,
    ProducerSideService, QueuedItem, QueueingEventProcessor, ServiceConfig,
};
use trawl_common::{CaptureEvent, CaptureOptions, ProducerMessage, ServerCommand, ThreadName};

const TARGET_PID: i32 = 4242;

fn options() -> CaptureOptions {
    CaptureOptions { pid: TARGET_PID, ..CaptureOptions::default() }
}

fn thread_name(tid: i32, timestamp_ns: u64) -> CaptureEvent {
    CaptureEvent::ThreadName(ThreadName {
        pid: TARGET_PID,
        tid,
        timestamp_ns,
        name: format!("worker-{tid}"),
    })
}

fn batch(first_tid: i32) -> ProducerMessage {
    let ts = u64::try_from(first_tid).unwrap();
    ProducerMessage::BufferedCaptureEvents {
        events: vec![thread_name(first_tid, ts), thread_name(first_tid + 1, ts + 1)],
    }
}

fn service() -> Arc<ProducerSideService> {
    Arc::new(ProducerSideService::new(ServiceConfig {
        max_wait_for_all_events_sent: Duration::from_secs(5),
    }))
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached");
}

/// Raw protocol exchange: start, three batches, stop, a late batch, then
/// AllEventsSent. CaptureFinished must only follow the late batch.
#[test]
fn test_start_stop_lifecycle_over_in_process_stream() {
    let service = service();
    let (server_end, producer) = in_process_channel::<ServerCommand, ProducerMessage>();
    let handler = {
        let service = Arc::clone(&service);
        thread::spawn(move || service.receive_commands_and_send_events(Arc::new(server_end)))
    };
    wait_for(|| service.connected_producers() == 1);

    let (queue, rx) = QueueingEventProcessor::new();
    service.on_capture_start_requested(options(), queue).unwrap();

    match producer.read() {
        Some(ServerCommand::StartCapture { capture_options }) => {
            assert_eq!(capture_options.pid, TARGET_PID);
        }
        other => panic!("expected StartCapture, got {other:?}"),
    }

    for first_tid in [1, 3, 5] {
        assert!(producer.write(batch(first_tid)));
    }

    let stopper = {
        let service = Arc::clone(&service);
        thread::spawn(move || service.on_capture_stop_requested())
    };
    assert_eq!(producer.read(), Some(ServerCommand::StopCapture));
    assert_eq!(service.capture_status(), CaptureStatus::Stopping);

    assert!(producer.write(batch(7)));
    assert!(producer.write(ProducerMessage::AllEventsSent));

    assert_eq!(producer.read(), Some(ServerCommand::CaptureFinished));
    assert_eq!(stopper.join().unwrap(), 0);
    assert_eq!(service.capture_status(), CaptureStatus::Finished);

    // Every event of the four batches was delivered before CaptureFinished.
    let tids: Vec<i32> = rx
        .try_iter()
        .map(|item| match item {
            QueuedItem::Event { producer, event: CaptureEvent::ThreadName(name) } => {
                assert_eq!(producer, ProducerId(1));
                name.tid
            }
            other => panic!("unexpected item {other:?}"),
        })
        .collect();
    assert_eq!(tids, (1..=8).collect::<Vec<_>>());

    service.finish_and_disallow_rpc();
    handler.join().unwrap().unwrap();
}

struct ThreadNameSource {
    tids: Vec<i32>,
}

impl ProducerHooks for ThreadNameSource {
    fn on_capture_start(&self, _options: &CaptureOptions, sink: &EventSink) {
        for &tid in &self.tids {
            sink.enqueue(thread_name(tid, 10 + u64::try_from(tid).unwrap()));
        }
    }
}

#[test]
fn test_producer_service_and_consumer_end_to_end() {
    let service = service();
    let (queue, rx) = QueueingEventProcessor::new();
    let data = CaptureData::new(Pid(TARGET_PID), "target");
    let consumer = CaptureConsumer::spawn(rx, data, DEFAULT_MERGE_WINDOW_NS).unwrap();

    let (server_end, producer_end) = in_process_channel();
    let handler = {
        let service = Arc::clone(&service);
        thread::spawn(move || service.receive_commands_and_send_events(Arc::new(server_end)))
    };
    let hooks: Vec<Arc<dyn ProducerHooks>> =
        vec![Arc::new(ThreadNameSource { tids: vec![11, 12, 13] })];
    let producer = CaptureEventProducer::connect(
        Arc::new(producer_end),
        ProducerConfig { max_batch_size: 2, flush_interval: Duration::from_millis(5) },
        hooks,
    )
    .unwrap();
    wait_for(|| service.connected_producers() == 1);

    queue.notify_capture_started(options());
    service.on_capture_start_requested(options(), queue.clone()).unwrap();
    wait_for(|| producer.is_capturing());

    assert_eq!(service.on_capture_stop_requested(), 0);
    queue.notify_end_of_capture();
    let capture = consumer.join();

    assert!(capture.is_finished());
    for tid in [11, 12, 13] {
        assert_eq!(capture.thread_name(tid), Some(format!("worker-{tid}")));
    }
    assert_eq!(producer.events_sent(), 3);

    service.finish_and_disallow_rpc();
    producer.shutdown();
    handler.join().unwrap().unwrap();
}

#[test]
fn test_external_producer_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trawl.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let service = service();
    let handler = {
        let service = Arc::clone(&service);
        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let stream = FramedUnixStream::new(stream).unwrap();
            service.receive_commands_and_send_events(Arc::new(stream))
        })
    };

    let producer: FramedUnixStream<ProducerMessage, ServerCommand> =
        FramedUnixStream::connect(&path).unwrap();
    wait_for(|| service.connected_producers() == 1);

    let (queue, rx) = QueueingEventProcessor::new();
    service.on_capture_start_requested(options(), queue).unwrap();
    assert!(matches!(producer.read(), Some(ServerCommand::StartCapture { .. })));

    assert!(producer.write(batch(21)));
    let stopper = {
        let service = Arc::clone(&service);
        thread::spawn(move || service.on_capture_stop_requested())
    };
    assert_eq!(producer.read(), Some(ServerCommand::StopCapture));
    assert!(producer.write(ProducerMessage::AllEventsSent));
    assert_eq!(stopper.join().unwrap(), 0);
    assert_eq!(producer.read(), Some(ServerCommand::CaptureFinished));
    assert_eq!(rx.try_iter().count(), 2);

    service.finish_and_disallow_rpc();
    handler.join().unwrap().unwrap();
}

/// Enqueues from its own thread, as fast as it can, until the sink closes.
/// Only the first capture gets a writer thread.
#[derive(Default)]
struct BusySource {
    started: AtomicBool,
    writer: Mutex<Option<JoinHandle<u64>>>,
}

impl ProducerHooks for BusySource {
    fn on_capture_start(&self, _options: &CaptureOptions, sink: &EventSink) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let sink = sink.clone();
        let writer = thread::spawn(move || {
            let mut accepted = 0u64;
            while sink.enqueue(thread_name(7, accepted)) {
                accepted += 1;
                thread::yield_now();
            }
            accepted
        });
        *self.writer.lock().unwrap() = Some(writer);
    }
}

fn read_capture(server: &ChannelStream<ServerCommand, ProducerMessage>) -> u64 {
    let mut received = 0;
    loop {
        match server.read() {
            Some(ProducerMessage::BufferedCaptureEvents { events }) => {
                received += events.len() as u64;
            }
            Some(ProducerMessage::AllEventsSent) => return received,
            None => panic!("stream ended before AllEventsSent"),
        }
    }
}

#[test]
fn test_enqueue_racing_stop_never_follows_all_events_sent() {
    let source = Arc::new(BusySource::default());
    let (server, producer_end) = in_process_channel::<ServerCommand, ProducerMessage>();
    let hooks: Vec<Arc<dyn ProducerHooks>> = vec![source.clone()];
    let producer = CaptureEventProducer::connect(
        Arc::new(producer_end),
        ProducerConfig { max_batch_size: 64, flush_interval: Duration::from_millis(1) },
        hooks,
    )
    .unwrap();

    assert!(server.write(ServerCommand::StartCapture { capture_options: options() }));
    wait_for(|| source.writer.lock().unwrap().is_some());
    thread::sleep(Duration::from_millis(20));
    assert!(server.write(ServerCommand::StopCapture));

    let received = read_capture(&server);
    let accepted = source.writer.lock().unwrap().take().unwrap().join().unwrap();
    assert!(accepted > 0);
    assert_eq!(received, accepted);

    // Several flush intervals later, a second capture must start empty.
    thread::sleep(Duration::from_millis(20));
    assert!(server.write(ServerCommand::StartCapture { capture_options: options() }));
    wait_for(|| producer.is_capturing());
    assert!(server.write(ServerCommand::StopCapture));
    assert_eq!(read_capture(&server), 0);
    assert_eq!(producer.events_sent(), accepted);

    producer.shutdown();
}
