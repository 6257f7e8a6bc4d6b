//! Producer side of the service link.

pub mod capture_event_producer;

pub use capture_event_producer::{
    CaptureEventProducer, EventSink, ProducerConfig, ProducerHooks, ProducerLink,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_BATCH_SIZE,
};
