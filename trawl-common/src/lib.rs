//! # Shared Wire Types (Producer ↔ Service ↔ Client)
//!
//! Defines everything that crosses the producer/service boundary: capture
//! events, the command and message envelopes of the bidirectional stream,
//! capture options, and the length-prefixed frame codec.
//!
//! ## Key Types
//!
//! - [`CaptureEvent`] - Tagged union of every event a producer can emit
//! - [`ServerCommand`] - Service → producer (`StartCapture`, `StopCapture`, `CaptureFinished`)
//! - [`ProducerMessage`] - Producer → service (`BufferedCaptureEvents`, `AllEventsSent`)
//! - [`CaptureOptions`] - What to capture, validated before a capture starts
//!
//! ## Framing
//!
//! Each message is a 4-byte big-endian length followed by a JSON payload. There
//! is no handshake: the first frame on a new connection is a command or a
//! message.

pub mod command;
pub mod event;
pub mod frame;

pub use command::{
    CaptureOptions, InstrumentedFunction, OptionsError, ProducerMessage, ServerCommand,
    UnwindingMethod,
};
pub use event::*;
pub use frame::{FrameReader, FrameWriter, JsonFrameCodec, WireError, DEFAULT_MAX_FRAME_BYTES};

// ============================================================================
// Thread ID Sentinels
// ============================================================================

/// Aggregate over every thread of the target process.
pub const ALL_PROCESS_THREADS_TID: i32 = -1;

/// Aggregate over every thread of every process.
pub const ALL_THREADS_OF_ALL_PROCESSES_TID: i32 = -2;

/// Bucket for events from threads outside the target process.
pub const NOT_TARGET_PROCESS_TID: i32 = -3;
