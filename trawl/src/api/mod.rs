//! User-space instrumentation API and the listener that relays it.

pub mod api_event_producer;
pub mod scope;
pub mod tracing_listener;

pub use api_event_producer::{scope_to_events, ApiEventProducer};
pub use scope::{
    current_depth, set_thread_self_instrumentation, start, start_async, start_with_group, stop,
    stop_async, string_event, thread_self_instrumentation, track_value, Scope, ScopeGuard,
    ScopeKind,
};
pub use tracing_listener::{ScopeCallback, TracingListener};
