//! Messages exchanged on the producer ↔ service stream, and capture options.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

use crate::event::CaptureEvent;

/// How the kernel tracer unwinds sampled stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnwindingMethod {
    #[default]
    FramePointers,
    Dwarf,
}

/// A function the service should hook for the duration of a capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentedFunction {
    pub function_id: u64,
    pub file_path: String,
    pub file_offset: u64,
    pub function_name: String,
}

/// Payload of `StartCapture`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureOptions {
    pub pid: i32,
    pub samples_per_second: f64,
    pub unwinding_method: UnwindingMethod,
    pub trace_thread_state: bool,
    pub enable_vulkan_layer: bool,
    pub collect_memory_info: bool,
    pub memory_sampling_period_ns: u64,
    pub enable_api: bool,
    pub instrumented_functions: Vec<InstrumentedFunction>,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            pid: 0,
            samples_per_second: 1000.0,
            unwinding_method: UnwindingMethod::default(),
            trace_thread_state: false,
            enable_vulkan_layer: false,
            collect_memory_info: false,
            memory_sampling_period_ns: 0,
            enable_api: true,
            instrumented_functions: Vec::new(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptionsError {
    #[error("Invalid target pid {0}")]
    InvalidPid(i32),

    #[error("Invalid sampling rate {0} (must be finite and non-negative)")]
    InvalidSamplingRate(f64),

    #[error("Memory sampling enabled without a sampling period")]
    MissingMemorySamplingPeriod,

    #[error("Function id {0} is instrumented more than once")]
    DuplicateFunctionId(u64),
}

impl CaptureOptions {
    /// Reject options that can never produce a valid capture.
    ///
    /// # Errors
    /// Returns the first [`OptionsError`] found.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.pid <= 0 {
            return Err(OptionsError::InvalidPid(self.pid));
        }
        if !self.samples_per_second.is_finite() || self.samples_per_second < 0.0 {
            return Err(OptionsError::InvalidSamplingRate(self.samples_per_second));
        }
        if self.collect_memory_info && self.memory_sampling_period_ns == 0 {
            return Err(OptionsError::MissingMemorySamplingPeriod);
        }
        let mut seen = HashSet::new();
        for function in &self.instrumented_functions {
            if !seen.insert(function.function_id) {
                return Err(OptionsError::DuplicateFunctionId(function.function_id));
            }
        }
        Ok(())
    }
}

/// Server → producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ServerCommand {
    StartCapture { capture_options: CaptureOptions },
    StopCapture,
    /// Sent once the server no longer expects events for the capture.
    CaptureFinished,
}

/// Producer → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum ProducerMessage {
    BufferedCaptureEvents { events: Vec<CaptureEvent> },
    /// The producer has flushed everything it had for the current capture.
    AllEventsSent,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> CaptureOptions {
        CaptureOptions { pid: 42, ..CaptureOptions::default() }
    }

    #[test]
    fn test_default_options_need_pid() {
        assert_eq!(CaptureOptions::default().validate(), Err(OptionsError::InvalidPid(0)));
        assert!(options().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_sampling_rate() {
        let opts = CaptureOptions { samples_per_second: f64::NAN, ..options() };
        assert!(matches!(opts.validate(), Err(OptionsError::InvalidSamplingRate(_))));
    }

    #[test]
    fn test_rejects_memory_sampling_without_period() {
        let opts = CaptureOptions { collect_memory_info: true, ..options() };
        assert_eq!(opts.validate(), Err(OptionsError::MissingMemorySamplingPeriod));
    }

    #[test]
    fn test_rejects_duplicate_function_ids() {
        let function = InstrumentedFunction {
            function_id: 3,
            file_path: "/lib/libc.so.6".to_string(),
            file_offset: 0x100,
            function_name: "read".to_string(),
        };
        let opts = CaptureOptions {
            instrumented_functions: vec![function.clone(), function],
            ..options()
        };
        assert_eq!(opts.validate(), Err(OptionsError::DuplicateFunctionId(3)));
    }
}
