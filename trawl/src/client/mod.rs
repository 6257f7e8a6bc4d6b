//! Client side of a capture: decoding, indexing and querying.
//!
//! ```text
//! QueueingEventProcessor ──▶ CaptureConsumer ──▶ EventMerger ──▶ CaptureEventProcessor ──▶ CaptureListener
//!   (service queue)          (thread)            (ts order)      (interning, API scopes)    (CaptureData)
//! ```

pub mod api_event_processor;
pub mod callstack_data;
pub mod capture_consumer;
pub mod capture_data;
pub mod capture_event_processor;
pub mod capture_listener;
pub mod event_merger;
pub mod function_info;
pub mod module_data;
pub mod module_manager;
pub mod process_data;
pub mod tracepoint_data;

pub use api_event_processor::{ApiEventProcessor, ApiOutput};
pub use callstack_data::{
    CallstackData, CallstackEvent, CallstackInfo, MajorityStartFilter, Supermajority,
};
pub use capture_consumer::CaptureConsumer;
pub use capture_data::{CaptureData, CaptureSummary};
pub use capture_event_processor::CaptureEventProcessor;
pub use capture_listener::{
    ApiStringEventInfo, ApiTrackValueInfo, CaptureListener, TimerInfo, TimerKind,
};
pub use event_merger::{EventMerger, DEFAULT_MERGE_WINDOW_NS};
pub use function_info::{FunctionInfo, FunctionKind, SymbolInfo};
pub use module_data::{ModuleData, ModuleUpdate};
pub use module_manager::ModuleManager;
pub use process_data::{ModuleInMemory, ProcessData};
pub use tracepoint_data::{TracepointData, TracepointEventInfo, TracepointInfo};
