//! Producer-facing side of the capture service.

pub mod producer_event_processor;
pub mod producer_side_service;
pub mod producer_state;
pub mod stream;

pub use producer_event_processor::{ProducerEventProcessor, QueuedItem, QueueingEventProcessor};
pub use producer_side_service::{
    CaptureStatus, ProducerSideService, ProducerStream, ServiceConfig,
    DEFAULT_MAX_WAIT_FOR_ALL_EVENTS_SENT,
};
pub use producer_state::{ProducerInput, ProducerState, ProtocolViolation, Transition};
pub use stream::{in_process_channel, BidiStream, ChannelStream, FramedUnixStream};
