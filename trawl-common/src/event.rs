//! Capture events emitted by producers.
//!
//! Every event is a plain value: producers give up ownership once the event is
//! enqueued, the transport moves it, and the client consumes it exactly once.
//! All variants carry a monotonic timestamp (ns), a pid and a tid; events that
//! are not tied to a thread use tid `0`.

use serde::{Deserialize, Serialize};

/// Kind of unwinding result attached to a sampled callstack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallstackType {
    #[default]
    Complete,
    DwarfUnwindingError,
    FramePointerUnwindingError,
    InUprobes,
    StackTopForDwarfUnwindingTooSmall,
    FilteredByMajorityOutermostFrame,
}

/// Linux scheduler state of a thread during a [`ThreadStateSlice`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Running,
    Runnable,
    InterruptibleSleep,
    UninterruptibleSleep,
    Stopped,
    Traced,
    Dead,
    Zombie,
    Parked,
    Idle,
}

/// Loaded module as observed in the target's address space.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub file_path: String,
    pub file_size: u64,
    pub address_start: u64,
    pub address_end: u64,
    pub build_id: String,
    pub load_bias: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingSlice {
    pub pid: i32,
    pub tid: i32,
    pub core: u32,
    pub duration_ns: u64,
    pub out_timestamp_ns: u64,
}

/// A sampled callstack. Frames are innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallstackSample {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub frames: Vec<u64>,
    #[serde(default)]
    pub callstack_type: CallstackType,
}

/// One return from a dynamically instrumented function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub pid: i32,
    pub tid: i32,
    pub function_id: u64,
    pub duration_ns: u64,
    pub end_timestamp_ns: u64,
    pub depth: u32,
    #[serde(default)]
    pub return_value: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiScopeStart {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub name: String,
    pub color_rgba: u32,
    pub group_id: u64,
    pub address_in_function: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiScopeStop {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiScopeStartAsync {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub name: String,
    pub color_rgba: u32,
    pub id: u64,
    pub address_in_function: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiScopeStopAsync {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStringEvent {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub id: u64,
    pub name: String,
    pub color_rgba: u32,
}

/// Value reported on a user-defined track.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackValue {
    Int(i32),
    Int64(i64),
    Uint(u32),
    Uint64(u64),
    Float(f32),
    Double(f64),
}

impl TrackValue {
    /// Lossy conversion used for plotting.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(self) -> f64 {
        match self {
            TrackValue::Int(v) => f64::from(v),
            TrackValue::Int64(v) => v as f64,
            TrackValue::Uint(v) => f64::from(v),
            TrackValue::Uint64(v) => v as f64,
            TrackValue::Float(v) => f64::from(v),
            TrackValue::Double(v) => v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiTrackValue {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub name: String,
    pub value: TrackValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracepointEvent {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub cpu: i32,
    pub category: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleUpdateEvent {
    pub pid: i32,
    pub timestamp_ns: u64,
    pub module: ModuleInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulesSnapshot {
    pub pid: i32,
    pub timestamp_ns: u64,
    pub modules: Vec<ModuleInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadName {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadStateSlice {
    pub pid: i32,
    pub tid: i32,
    pub end_timestamp_ns: u64,
    pub duration_ns: u64,
    pub thread_state: ThreadState,
    /// Thread that made this one runnable, when known.
    #[serde(default)]
    pub wakeup_tid: Option<i32>,
}

/// Graphics API a present came through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresentSource {
    Vulkan,
    Dxgi,
    D3d9,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresentEvent {
    pub pid: i32,
    pub tid: i32,
    pub begin_timestamp_ns: u64,
    pub end_timestamp_ns: u64,
    pub source: PresentSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    Generic,
    InstrumentingWithUprobes,
    InstrumentingWithUserSpaceInstrumentation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningEvent {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub kind: WarningKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Generic,
    ErrorsWithPerfEventOpen,
    ErrorEnablingUserApi,
    ErrorEnablingUserSpaceInstrumentation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub pid: i32,
    pub tid: i32,
    pub timestamp_ns: u64,
    pub kind: ErrorKind,
    pub message: String,
}

/// The kernel ring buffer overflowed; `num_lost` records were dropped in the
/// interval ending at `end_timestamp_ns`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LostPerfRecordsEvent {
    pub pid: i32,
    pub tid: i32,
    pub end_timestamp_ns: u64,
    pub duration_ns: u64,
    pub num_lost: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutOfOrderEventsDiscardedEvent {
    pub pid: i32,
    pub tid: i32,
    pub end_timestamp_ns: u64,
    pub duration_ns: u64,
    pub num_discarded: u64,
}

/// Tagged union of everything a producer can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CaptureEvent {
    SchedulingSlice(SchedulingSlice),
    CallstackSample(CallstackSample),
    FunctionCall(FunctionCall),
    ApiScopeStart(ApiScopeStart),
    ApiScopeStop(ApiScopeStop),
    ApiScopeStartAsync(ApiScopeStartAsync),
    ApiScopeStopAsync(ApiScopeStopAsync),
    ApiStringEvent(ApiStringEvent),
    ApiTrackValue(ApiTrackValue),
    TracepointEvent(TracepointEvent),
    ModuleUpdate(ModuleUpdateEvent),
    ModulesSnapshot(ModulesSnapshot),
    ThreadName(ThreadName),
    ThreadStateSlice(ThreadStateSlice),
    PresentEvent(PresentEvent),
    WarningEvent(WarningEvent),
    ErrorEvent(ErrorEvent),
    LostPerfRecordsEvent(LostPerfRecordsEvent),
    OutOfOrderEventsDiscardedEvent(OutOfOrderEventsDiscardedEvent),
}

impl CaptureEvent {
    /// Timestamp used to order this event. Interval events are ordered by
    /// their end, which is when the producer emits them.
    #[must_use]
    pub fn timestamp_ns(&self) -> u64 {
        match self {
            CaptureEvent::SchedulingSlice(e) => e.out_timestamp_ns,
            CaptureEvent::CallstackSample(e) => e.timestamp_ns,
            CaptureEvent::FunctionCall(e) => e.end_timestamp_ns,
            CaptureEvent::ApiScopeStart(e) => e.timestamp_ns,
            CaptureEvent::ApiScopeStop(e) => e.timestamp_ns,
            CaptureEvent::ApiScopeStartAsync(e) => e.timestamp_ns,
            CaptureEvent::ApiScopeStopAsync(e) => e.timestamp_ns,
            CaptureEvent::ApiStringEvent(e) => e.timestamp_ns,
            CaptureEvent::ApiTrackValue(e) => e.timestamp_ns,
            CaptureEvent::TracepointEvent(e) => e.timestamp_ns,
            CaptureEvent::ModuleUpdate(e) => e.timestamp_ns,
            CaptureEvent::ModulesSnapshot(e) => e.timestamp_ns,
            CaptureEvent::ThreadName(e) => e.timestamp_ns,
            CaptureEvent::ThreadStateSlice(e) => e.end_timestamp_ns,
            CaptureEvent::PresentEvent(e) => e.end_timestamp_ns,
            CaptureEvent::WarningEvent(e) => e.timestamp_ns,
            CaptureEvent::ErrorEvent(e) => e.timestamp_ns,
            CaptureEvent::LostPerfRecordsEvent(e) => e.end_timestamp_ns,
            CaptureEvent::OutOfOrderEventsDiscardedEvent(e) => e.end_timestamp_ns,
        }
    }

    #[must_use]
    pub fn pid(&self) -> i32 {
        match self {
            CaptureEvent::SchedulingSlice(e) => e.pid,
            CaptureEvent::CallstackSample(e) => e.pid,
            CaptureEvent::FunctionCall(e) => e.pid,
            CaptureEvent::ApiScopeStart(e) => e.pid,
            CaptureEvent::ApiScopeStop(e) => e.pid,
            CaptureEvent::ApiScopeStartAsync(e) => e.pid,
            CaptureEvent::ApiScopeStopAsync(e) => e.pid,
            CaptureEvent::ApiStringEvent(e) => e.pid,
            CaptureEvent::ApiTrackValue(e) => e.pid,
            CaptureEvent::TracepointEvent(e) => e.pid,
            CaptureEvent::ModuleUpdate(e) => e.pid,
            CaptureEvent::ModulesSnapshot(e) => e.pid,
            CaptureEvent::ThreadName(e) => e.pid,
            CaptureEvent::ThreadStateSlice(e) => e.pid,
            CaptureEvent::PresentEvent(e) => e.pid,
            CaptureEvent::WarningEvent(e) => e.pid,
            CaptureEvent::ErrorEvent(e) => e.pid,
            CaptureEvent::LostPerfRecordsEvent(e) => e.pid,
            CaptureEvent::OutOfOrderEventsDiscardedEvent(e) => e.pid,
        }
    }

    /// Originating thread, `0` for process-wide events.
    #[must_use]
    pub fn tid(&self) -> i32 {
        match self {
            CaptureEvent::SchedulingSlice(e) => e.tid,
            CaptureEvent::CallstackSample(e) => e.tid,
            CaptureEvent::FunctionCall(e) => e.tid,
            CaptureEvent::ApiScopeStart(e) => e.tid,
            CaptureEvent::ApiScopeStop(e) => e.tid,
            CaptureEvent::ApiScopeStartAsync(e) => e.tid,
            CaptureEvent::ApiScopeStopAsync(e) => e.tid,
            CaptureEvent::ApiStringEvent(e) => e.tid,
            CaptureEvent::ApiTrackValue(e) => e.tid,
            CaptureEvent::TracepointEvent(e) => e.tid,
            CaptureEvent::ThreadName(e) => e.tid,
            CaptureEvent::ThreadStateSlice(e) => e.tid,
            CaptureEvent::PresentEvent(e) => e.tid,
            CaptureEvent::WarningEvent(e) => e.tid,
            CaptureEvent::ErrorEvent(e) => e.tid,
            CaptureEvent::LostPerfRecordsEvent(e) => e.tid,
            CaptureEvent::OutOfOrderEventsDiscardedEvent(e) => e.tid,
            CaptureEvent::ModuleUpdate(_) | CaptureEvent::ModulesSnapshot(_) => 0,
        }
    }

    /// Short variant name for logs and statistics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            CaptureEvent::SchedulingSlice(_) => "scheduling_slice",
            CaptureEvent::CallstackSample(_) => "callstack_sample",
            CaptureEvent::FunctionCall(_) => "function_call",
            CaptureEvent::ApiScopeStart(_) => "api_scope_start",
            CaptureEvent::ApiScopeStop(_) => "api_scope_stop",
            CaptureEvent::ApiScopeStartAsync(_) => "api_scope_start_async",
            CaptureEvent::ApiScopeStopAsync(_) => "api_scope_stop_async",
            CaptureEvent::ApiStringEvent(_) => "api_string_event",
            CaptureEvent::ApiTrackValue(_) => "api_track_value",
            CaptureEvent::TracepointEvent(_) => "tracepoint_event",
            CaptureEvent::ModuleUpdate(_) => "module_update",
            CaptureEvent::ModulesSnapshot(_) => "modules_snapshot",
            CaptureEvent::ThreadName(_) => "thread_name",
            CaptureEvent::ThreadStateSlice(_) => "thread_state_slice",
            CaptureEvent::PresentEvent(_) => "present_event",
            CaptureEvent::WarningEvent(_) => "warning_event",
            CaptureEvent::ErrorEvent(_) => "error_event",
            CaptureEvent::LostPerfRecordsEvent(_) => "lost_perf_records",
            CaptureEvent::OutOfOrderEventsDiscardedEvent(_) => "out_of_order_events_discarded",
        }
    }
}
