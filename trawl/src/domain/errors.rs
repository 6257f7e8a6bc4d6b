//! Structured error types for trawl
//!
//! Using thiserror for automatic Display implementation and error chaining.

use super::types::{CallstackId, Pid};
use thiserror::Error;
use trawl_common::{OptionsError, WireError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ThreadPoolError {
    #[error("Invalid thread pool bounds: min={min}, max={max} (need 1 <= min <= max)")]
    InvalidBounds { min: usize, max: usize },

    #[error("Thread TTL must be at least 1ms")]
    TtlTooShort,

    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(String),
}

#[derive(Error, Debug)]
pub enum ListenerError {
    #[error("A tracing listener is already installed")]
    AlreadyInstalled,

    #[error(transparent)]
    Pool(#[from] ThreadPoolError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallstackDataError {
    #[error("Unknown callstack id {0}")]
    UnknownCallstack(CallstackId),

    #[error("Invalid supermajority threshold {num}/{den} (must be > 1/2 and <= 1)")]
    InvalidSupermajority { num: u32, den: u32 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleDataError {
    #[error("Symbols for module {0} are already loaded")]
    SymbolsAlreadyLoaded(String),

    #[error("Module {0} is not known")]
    UnknownModule(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessDataError {
    #[error("Unable to find module for address {address:#x}: no modules loaded")]
    NoModulesLoaded { address: u64 },

    #[error("Unable to find module for address {address:#x}: No module loaded at this address")]
    NoModuleAtAddress { address: u64 },
}

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid capture options: {0}")]
    InvalidOptions(#[from] OptionsError),

    #[error("Service does not accept new producer connections")]
    RpcDisallowed,

    #[error("A capture is already in progress")]
    CaptureInProgress,
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Stream was cancelled")]
    Cancelled,

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstrumentationError {
    #[error("Module {0} is not mapped in the target")]
    ModuleNotMapped(String),

    #[error("Failed to attach probe to {function} in {module}: {reason}")]
    ProbeAttachFailed { module: String, function: String, reason: String },

    #[error("Instrumentation already running for {0}")]
    AlreadyRunning(Pid),
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Process {0} not found")]
    ProcessNotFound(Pid),

    #[error("Malformed memory maps of {0}")]
    MemoryMapsParseFailed(Pid),

    #[error("No process matching '{0}' found")]
    NoProcessMatches(String),

    #[error("Multiple processes match '{name}':\n{candidates}")]
    AmbiguousProcessName { name: String, candidates: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_data_error_display() {
        let err = ProcessDataError::NoModuleAtAddress { address: 0x1000 };
        assert_eq!(
            err.to_string(),
            "Unable to find module for address 0x1000: No module loaded at this address"
        );
    }

    #[test]
    fn test_probe_attach_error() {
        let err = InstrumentationError::ProbeAttachFailed {
            module: "/usr/lib/libc.so.6".to_string(),
            function: "read".to_string(),
            reason: "symbol not found".to_string(),
        };
        assert!(err.to_string().contains("read"));
        assert!(err.to_string().contains("/usr/lib/libc.so.6"));
    }

    #[test]
    fn test_service_error_wraps_options() {
        let err = ServiceError::from(OptionsError::InvalidPid(0));
        assert_eq!(err.to_string(), "Invalid capture options: Invalid target pid 0");
    }

    #[test]
    fn test_process_not_found_display() {
        let err = ProcessError::ProcessNotFound(Pid(1234));
        assert_eq!(err.to_string(), "Process PID:1234 not found");
    }
}
