//! Listener contract between the client-side event processor and the
//! capture model.
//!
//! The processor calls exactly one method per decoded event, in merged
//! timestamp order, from a single consumer thread. Callstacks and tracepoint
//! infos are announced once (`on_unique_*`) before the first event that
//! references them.

use serde::Serialize;
use trawl_common::{
    CaptureOptions, ErrorEvent, LostPerfRecordsEvent, ModuleInfo, OutOfOrderEventsDiscardedEvent,
    PresentEvent, SchedulingSlice, ThreadStateSlice, TrackValue, WarningEvent,
};

use super::callstack_data::{CallstackEvent, CallstackInfo};
use super::tracepoint_data::{TracepointEventInfo, TracepointInfo};
use crate::domain::{CallstackId, Color, TracepointKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    ApiScope,
    ApiScopeAsync,
    FunctionCall,
}

/// A reconstructed interval on a thread's timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimerInfo {
    pub start_ns: u64,
    pub end_ns: u64,
    pub pid: i32,
    pub tid: i32,
    pub depth: u32,
    pub kind: TimerKind,
    pub name: String,
    pub color: Color,
    pub group_id: u64,
    pub async_id: u64,
    pub function_id: u64,
}

impl TimerInfo {
    #[must_use]
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiStringEventInfo {
    pub timestamp_ns: u64,
    pub pid: i32,
    pub tid: i32,
    pub id: u64,
    pub name: String,
    pub color: Color,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiTrackValueInfo {
    pub timestamp_ns: u64,
    pub pid: i32,
    pub tid: i32,
    pub name: String,
    pub value: TrackValue,
}

/// Consumer of a decoded capture.
///
/// Only `on_timer` is mandatory; everything else defaults to a no-op so that
/// tests and narrow consumers implement what they need.
#[allow(unused_variables)]
pub trait CaptureListener: Send {
    fn on_capture_started(&mut self, options: &CaptureOptions) {}
    fn on_capture_finished(&mut self) {}

    fn on_timer(&mut self, timer: TimerInfo);

    fn on_unique_callstack(&mut self, id: CallstackId, callstack: CallstackInfo) {}
    fn on_callstack_event(&mut self, event: CallstackEvent) {}

    fn on_unique_tracepoint_info(&mut self, key: TracepointKey, info: TracepointInfo) {}
    fn on_tracepoint_event(&mut self, event: TracepointEventInfo) {}

    fn on_scheduling_slice(&mut self, slice: SchedulingSlice) {}
    fn on_thread_name(&mut self, pid: i32, tid: i32, name: String) {}
    fn on_thread_state_slice(&mut self, slice: ThreadStateSlice) {}

    fn on_module_update(&mut self, timestamp_ns: u64, module: ModuleInfo) {}
    fn on_modules_snapshot(&mut self, timestamp_ns: u64, modules: Vec<ModuleInfo>) {}

    fn on_api_string_event(&mut self, event: ApiStringEventInfo) {}
    fn on_api_track_value(&mut self, event: ApiTrackValueInfo) {}

    fn on_present_event(&mut self, event: PresentEvent) {}
    fn on_warning_event(&mut self, event: WarningEvent) {}
    fn on_error_event(&mut self, event: ErrorEvent) {}
    fn on_lost_perf_records(&mut self, event: LostPerfRecordsEvent) {}
    fn on_out_of_order_events_discarded(&mut self, event: OutOfOrderEventsDiscardedEvent) {}
}
