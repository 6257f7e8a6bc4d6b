//! Domain model for trawl
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

// Re-export common types for convenience
pub use types::{CallstackId, Color, Pid, ProducerId, Tid, TracepointKey};

pub use errors::{
    CallstackDataError, InstrumentationError, ListenerError, ModuleDataError, ProcessDataError,
    ProcessError, ServiceError, ThreadPoolError, TransportError,
};
