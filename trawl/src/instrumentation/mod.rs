//! Dynamic instrumentation: hook classification, probe backends and the
//! manager that relays probe hits as `FunctionCall` events.

pub mod classification;
pub mod manager;
pub mod probe;

pub use classification::{classify_function, FileIoOp, HookKind, FILE_IO_FUNCTIONS};
pub use manager::{DynamicInstrumentationManager, InstrumentationReport};
pub use probe::{
    FunctionHit, HitCallback, HitGuard, ProbeBackend, ProbeHandle, ProbeTarget,
    SoftwareProbeBackend,
};
