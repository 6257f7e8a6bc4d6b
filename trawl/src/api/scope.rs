//! In-process user API for manual instrumentation.
//!
//! Synchronous scopes are tracked on a per-thread stack. The opening is
//! delivered on [`start`] and the completed scope, with both timestamps set,
//! on [`stop`]. Async scopes, track values and string events are delivered
//! immediately. Delivery goes through the
//! installed [`TracingListener`](super::TracingListener); with no listener
//! installed every call only maintains the thread-local stack.
//!
//! ```no_run
//! use trawl::api::{self, ScopeGuard};
//!
//! fn load_level() {
//!     let _scope = ScopeGuard::new("load_level");
//!     api::track_value("entities", trawl_common::TrackValue::Int(42));
//! }
//! ```

use std::cell::{Cell, RefCell};
use trawl_common::TrackValue;

use super::tracing_listener::TracingListener;
use crate::clock::{current_pid, current_tid, monotonic_timestamp_ns};
use crate::domain::Color;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// An opened synchronous scope (`end_ns` equals `begin_ns`).
    Start,
    /// A completed synchronous scope (`begin_ns` and `end_ns` both set).
    Stop,
    StartAsync,
    StopAsync,
    TrackValue,
    String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scope {
    pub kind: ScopeKind,
    pub name: String,
    /// Group id for synchronous scopes, async id for async scopes, string id
    /// for string events.
    pub data: u64,
    pub color: Color,
    pub begin_ns: u64,
    pub end_ns: u64,
    pub depth: u32,
    pub tid: i32,
    pub pid: i32,
    pub track_value: Option<TrackValue>,
}

impl Scope {
    fn new(kind: ScopeKind, name: &str, data: u64, color: Color) -> Self {
        let now = monotonic_timestamp_ns();
        Self {
            kind,
            name: name.to_string(),
            data,
            color,
            begin_ns: now,
            end_ns: now,
            depth: 0,
            tid: current_tid(),
            pid: current_pid(),
            track_value: None,
        }
    }
}

thread_local! {
    static SCOPE_STACK: RefCell<Vec<Scope>> = const { RefCell::new(Vec::new()) };
    static SELF_INSTRUMENTATION: Cell<bool> = const { Cell::new(true) };
}

/// Allow or forbid user-API calls on the current thread. Threads that deliver
/// scopes must not produce scopes themselves.
pub fn set_thread_self_instrumentation(enabled: bool) {
    SELF_INSTRUMENTATION.with(|flag| flag.set(enabled));
}

#[must_use]
pub fn thread_self_instrumentation() -> bool {
    SELF_INSTRUMENTATION.with(Cell::get)
}

/// Depth of the calling thread's open synchronous scopes.
#[must_use]
pub fn current_depth() -> usize {
    SCOPE_STACK.with(|stack| stack.borrow().len())
}

pub fn start(name: &str, color: Color) {
    start_with_group(name, color, 0);
}

pub fn start_with_group(name: &str, color: Color, group_id: u64) {
    if !thread_self_instrumentation() {
        return;
    }
    let mut scope = Scope::new(ScopeKind::Start, name, group_id, color);
    scope.depth = u32::try_from(current_depth()).unwrap_or(u32::MAX);
    if TracingListener::is_active() {
        TracingListener::defer_scope_processing(scope.clone());
    }
    SCOPE_STACK.with(|stack| stack.borrow_mut().push(scope));
}

/// Close the innermost open scope. A stop with no open scope is ignored.
pub fn stop() {
    if !thread_self_instrumentation() {
        return;
    }
    let completed = SCOPE_STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let mut scope = stack.pop()?;
        scope.kind = ScopeKind::Stop;
        scope.end_ns = monotonic_timestamp_ns();
        scope.depth = u32::try_from(stack.len()).unwrap_or(u32::MAX);
        Some(scope)
    });
    if let Some(scope) = completed {
        TracingListener::defer_scope_processing(scope);
    }
}

pub fn start_async(name: &str, id: u64, color: Color) {
    emit(Scope::new(ScopeKind::StartAsync, name, id, color));
}

pub fn stop_async(id: u64) {
    emit(Scope::new(ScopeKind::StopAsync, "", id, Color::default()));
}

pub fn track_value(name: &str, value: TrackValue) {
    let mut scope = Scope::new(ScopeKind::TrackValue, name, 0, Color::default());
    scope.track_value = Some(value);
    emit(scope);
}

/// Attach a string to the async scope or track identified by `id`.
pub fn string_event(id: u64, name: &str, color: Color) {
    emit(Scope::new(ScopeKind::String, name, id, color));
}

fn emit(scope: Scope) {
    if thread_self_instrumentation() {
        TracingListener::defer_scope_processing(scope);
    }
}

/// Opens a synchronous scope and closes it on drop.
#[must_use = "the scope closes as soon as the guard is dropped"]
pub struct ScopeGuard(());

impl ScopeGuard {
    pub fn new(name: &str) -> Self {
        start(name, Color::default());
        Self(())
    }

    pub fn with_color(name: &str, color: Color) -> Self {
        start(name, color);
        Self(())
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::tracing_listener::test_support::serial;

    #[test]
    fn test_nested_guards_track_depth() {
        let _serial = serial();
        std::thread::spawn(|| {
            assert_eq!(current_depth(), 0);
            let _outer = ScopeGuard::new("outer");
            {
                let _inner = ScopeGuard::new("inner");
                assert_eq!(current_depth(), 2);
            }
            assert_eq!(current_depth(), 1);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_orphan_stop_is_ignored() {
        let _serial = serial();
        std::thread::spawn(|| {
            stop();
            assert_eq!(current_depth(), 0);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn test_disabled_thread_records_nothing() {
        let _serial = serial();
        std::thread::spawn(|| {
            set_thread_self_instrumentation(false);
            start("ignored", Color::default());
            assert_eq!(current_depth(), 0);
        })
        .join()
        .unwrap();
    }
}
