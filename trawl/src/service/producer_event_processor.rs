//! Sink for events received from producers.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;
use std::sync::Arc;
use trawl_common::{CaptureEvent, CaptureOptions};

use crate::domain::ProducerId;

pub trait ProducerEventProcessor: Send + Sync {
    /// Called once per event, in the order each producer sent them.
    fn process_event(&self, producer: ProducerId, event: CaptureEvent);
}

/// Item handed to the client consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum QueuedItem {
    Event { producer: ProducerId, event: CaptureEvent },
    CaptureStarted(CaptureOptions),
    EndOfCapture,
}

/// Forwards everything into an unbounded queue read by
/// [`crate::client::CaptureConsumer`].
pub struct QueueingEventProcessor {
    sender: Sender<QueuedItem>,
}

impl QueueingEventProcessor {
    #[must_use]
    pub fn new() -> (Arc<Self>, Receiver<QueuedItem>) {
        let (sender, receiver) = unbounded();
        (Arc::new(Self { sender }), receiver)
    }

    pub fn notify_capture_started(&self, options: CaptureOptions) {
        self.send(QueuedItem::CaptureStarted(options));
    }

    pub fn notify_end_of_capture(&self) {
        self.send(QueuedItem::EndOfCapture);
    }

    fn send(&self, item: QueuedItem) {
        if self.sender.send(item).is_err() {
            debug!("Capture consumer is gone, dropping item");
        }
    }
}

impl ProducerEventProcessor for QueueingEventProcessor {
    fn process_event(&self, producer: ProducerId, event: CaptureEvent) {
        self.send(QueuedItem::Event { producer, event });
    }
}
