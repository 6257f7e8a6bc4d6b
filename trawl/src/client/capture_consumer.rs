//! Client consumer thread: drains the service queue, merges by timestamp and
//! feeds the [`CaptureEventProcessor`].

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info};
use std::io;
use std::thread::JoinHandle;
use std::time::Duration;

use super::capture_event_processor::CaptureEventProcessor;
use super::capture_listener::CaptureListener;
use super::event_merger::EventMerger;
use crate::service::QueuedItem;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct CaptureConsumer<L: CaptureListener + 'static> {
    handle: JoinHandle<CaptureEventProcessor<L>>,
}

impl<L: CaptureListener + 'static> CaptureConsumer<L> {
    /// Start the consumer thread.
    ///
    /// # Errors
    /// Fails if the thread cannot be spawned.
    pub fn spawn(
        receiver: Receiver<QueuedItem>,
        listener: L,
        merge_window_ns: u64,
    ) -> io::Result<Self> {
        let handle = std::thread::Builder::new().name("trawl-consumer".to_string()).spawn(
            move || consume(&receiver, CaptureEventProcessor::new(listener), merge_window_ns),
        )?;
        Ok(Self { handle })
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for end of capture and hand back the listener.
    ///
    /// # Panics
    /// Re-raises a panic from the consumer thread.
    #[must_use]
    pub fn join(self) -> L {
        match self.handle.join() {
            Ok(processor) => processor.into_listener(),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn consume<L: CaptureListener>(
    receiver: &Receiver<QueuedItem>,
    mut processor: CaptureEventProcessor<L>,
    merge_window_ns: u64,
) -> CaptureEventProcessor<L> {
    let mut merger = EventMerger::new(merge_window_ns);
    let mut received: u64 = 0;

    loop {
        match receiver.recv_timeout(POLL_INTERVAL) {
            Ok(QueuedItem::Event { producer, event }) => {
                received += 1;
                processor.note_arrival(producer);
                merger.push(event);
                merger.drain_ready(|e| processor.process_event(e));
            }
            Ok(QueuedItem::CaptureStarted(options)) => {
                debug!("Consumer: capture of PID:{} started", options.pid);
                processor.listener_mut().on_capture_started(&options);
            }
            Ok(QueuedItem::EndOfCapture) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }

    merger.drain_all(|e| processor.process_event(e));
    processor.listener_mut().on_capture_finished();
    info!(
        "Consumer processed {received} events ({} discarded out of order)",
        merger.total_discarded()
    );
    processor
}
