//! Reconstructs timers from user-API start/stop events.
//!
//! | Incoming         | Effect                                                       |
//! |------------------|--------------------------------------------------------------|
//! | ScopeStart       | push on the thread's pending stack                           |
//! | ScopeStop        | pop and emit a timer at depth = stack size after the pop     |
//! | ScopeStartAsync  | remember by id (a repeated id replaces the pending start)    |
//! | ScopeStopAsync   | emit a timer on the stopping thread at depth 0, forget the id|
//! | String/TrackValue| emitted immediately                                          |
//!
//! Stops without a matching start are dropped.

use log::{debug, warn};
use std::collections::HashMap;
use trawl_common::{
    ApiScopeStart, ApiScopeStartAsync, ApiScopeStop, ApiScopeStopAsync, ApiStringEvent,
    ApiTrackValue, CaptureEvent,
};

use super::capture_listener::{ApiStringEventInfo, ApiTrackValueInfo, TimerInfo, TimerKind};
use crate::domain::Color;

/// What one API event turned into.
#[derive(Debug, Clone, PartialEq)]
pub enum ApiOutput {
    Timer(TimerInfo),
    String(ApiStringEventInfo),
    TrackValue(ApiTrackValueInfo),
}

#[derive(Debug, Default)]
pub struct ApiEventProcessor {
    sync_stacks: HashMap<i32, Vec<ApiScopeStart>>,
    pending_async: HashMap<u64, ApiScopeStartAsync>,
    orphan_stops: u64,
}

impl ApiEventProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event. Non-API events return `None`.
    pub fn process(&mut self, event: &CaptureEvent) -> Option<ApiOutput> {
        match event {
            CaptureEvent::ApiScopeStart(start) => {
                self.process_scope_start(start);
                None
            }
            CaptureEvent::ApiScopeStop(stop) => self.process_scope_stop(stop).map(ApiOutput::Timer),
            CaptureEvent::ApiScopeStartAsync(start) => {
                self.process_scope_start_async(start);
                None
            }
            CaptureEvent::ApiScopeStopAsync(stop) => {
                self.process_scope_stop_async(stop).map(ApiOutput::Timer)
            }
            CaptureEvent::ApiStringEvent(string) => {
                Some(ApiOutput::String(Self::process_string_event(string)))
            }
            CaptureEvent::ApiTrackValue(value) => {
                Some(ApiOutput::TrackValue(Self::process_track_value(value)))
            }
            _ => None,
        }
    }

    pub fn process_scope_start(&mut self, start: &ApiScopeStart) {
        self.sync_stacks.entry(start.tid).or_default().push(start.clone());
    }

    pub fn process_scope_stop(&mut self, stop: &ApiScopeStop) -> Option<TimerInfo> {
        let Some(stack) = self.sync_stacks.get_mut(&stop.tid) else {
            self.orphan_stops += 1;
            return None;
        };
        let Some(start) = stack.pop() else {
            self.orphan_stops += 1;
            return None;
        };

        Some(TimerInfo {
            start_ns: start.timestamp_ns,
            end_ns: stop.timestamp_ns,
            pid: stop.pid,
            tid: stop.tid,
            depth: u32::try_from(stack.len()).unwrap_or(u32::MAX),
            kind: TimerKind::ApiScope,
            name: start.name,
            color: Color::from_rgba(start.color_rgba),
            group_id: start.group_id,
            async_id: 0,
            function_id: 0,
        })
    }

    pub fn process_scope_start_async(&mut self, start: &ApiScopeStartAsync) {
        if let Some(previous) = self.pending_async.insert(start.id, start.clone()) {
            warn!(
                "Async scope id {} started again (\"{}\" replaces \"{}\")",
                start.id, start.name, previous.name
            );
        }
    }

    pub fn process_scope_stop_async(&mut self, stop: &ApiScopeStopAsync) -> Option<TimerInfo> {
        let Some(start) = self.pending_async.remove(&stop.id) else {
            self.orphan_stops += 1;
            debug!("Dropping async stop for unknown id {}", stop.id);
            return None;
        };

        Some(TimerInfo {
            start_ns: start.timestamp_ns,
            end_ns: stop.timestamp_ns,
            pid: stop.pid,
            tid: stop.tid,
            depth: 0,
            kind: TimerKind::ApiScopeAsync,
            name: start.name,
            color: Color::from_rgba(start.color_rgba),
            group_id: 0,
            async_id: stop.id,
            function_id: 0,
        })
    }

    #[must_use]
    pub fn process_string_event(event: &ApiStringEvent) -> ApiStringEventInfo {
        ApiStringEventInfo {
            timestamp_ns: event.timestamp_ns,
            pid: event.pid,
            tid: event.tid,
            id: event.id,
            name: event.name.clone(),
            color: Color::from_rgba(event.color_rgba),
        }
    }

    #[must_use]
    pub fn process_track_value(event: &ApiTrackValue) -> ApiTrackValueInfo {
        ApiTrackValueInfo {
            timestamp_ns: event.timestamp_ns,
            pid: event.pid,
            tid: event.tid,
            name: event.name.clone(),
            value: event.value,
        }
    }

    /// Stops dropped for lack of a matching start.
    #[must_use]
    pub fn orphan_stops(&self) -> u64 {
        self.orphan_stops
    }

    /// Open synchronous scopes on `tid`.
    #[must_use]
    pub fn pending_depth(&self, tid: i32) -> usize {
        self.sync_stacks.get(&tid).map_or(0, Vec::len)
    }
}
