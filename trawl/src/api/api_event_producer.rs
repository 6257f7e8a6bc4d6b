//! Relays user-API scopes of this process into a capture.
//!
//! While a capture with `enable_api` runs, a [`TracingListener`] is installed
//! whose callback converts each [`Scope`] into `Api*` capture events. A
//! synchronous scope is relayed as it opens and again as it closes, so its
//! start reaches the capture at about its own timestamp however long the
//! scope runs.

use log::{debug, warn};
use std::sync::Mutex;
use trawl_common::{
    ApiScopeStart, ApiScopeStartAsync, ApiScopeStop, ApiScopeStopAsync, ApiStringEvent,
    ApiTrackValue, CaptureEvent, CaptureOptions, ErrorEvent, ErrorKind,
};

use super::scope::{Scope, ScopeKind};
use super::tracing_listener::TracingListener;
use crate::clock::{current_pid, current_tid, lock, monotonic_timestamp_ns};
use crate::producer::{EventSink, ProducerHooks};

#[derive(Default)]
pub struct ApiEventProducer {
    listener: Mutex<Option<TracingListener>>,
}

impl ApiEventProducer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_listening(&self) -> bool {
        lock(&self.listener).is_some()
    }
}

impl ProducerHooks for ApiEventProducer {
    fn on_capture_start(&self, options: &CaptureOptions, sink: &EventSink) {
        if !options.enable_api {
            debug!("User API disabled for this capture");
            return;
        }
        let relay = sink.clone();
        match TracingListener::install(move |scope: &Scope| {
            for event in scope_to_events(scope) {
                relay.enqueue(event);
            }
        }) {
            Ok(listener) => *lock(&self.listener) = Some(listener),
            Err(e) => {
                warn!("Could not enable user API: {e}");
                sink.enqueue(CaptureEvent::ErrorEvent(ErrorEvent {
                    pid: current_pid(),
                    tid: current_tid(),
                    timestamp_ns: monotonic_timestamp_ns(),
                    kind: ErrorKind::ErrorEnablingUserApi,
                    message: e.to_string(),
                }));
            }
        }
    }

    fn on_capture_stop(&self) {
        if let Some(listener) = lock(&self.listener).take() {
            listener.flush();
        }
    }
}

/// Capture events for one delivered scope.
#[must_use]
pub fn scope_to_events(scope: &Scope) -> Vec<CaptureEvent> {
    let (pid, tid) = (scope.pid, scope.tid);
    let color_rgba = scope.color.to_rgba();
    match scope.kind {
        ScopeKind::Start => vec![CaptureEvent::ApiScopeStart(ApiScopeStart {
            pid,
            tid,
            timestamp_ns: scope.begin_ns,
            name: scope.name.clone(),
            color_rgba,
            group_id: scope.data,
            address_in_function: 0,
        })],
        ScopeKind::Stop => {
            vec![CaptureEvent::ApiScopeStop(ApiScopeStop { pid, tid, timestamp_ns: scope.end_ns })]
        }
        ScopeKind::StartAsync => vec![CaptureEvent::ApiScopeStartAsync(ApiScopeStartAsync {
            pid,
            tid,
            timestamp_ns: scope.begin_ns,
            name: scope.name.clone(),
            color_rgba,
            id: scope.data,
            address_in_function: 0,
        })],
        ScopeKind::StopAsync => vec![CaptureEvent::ApiScopeStopAsync(ApiScopeStopAsync {
            pid,
            tid,
            timestamp_ns: scope.end_ns,
            id: scope.data,
        })],
        ScopeKind::TrackValue => match scope.track_value {
            Some(value) => vec![CaptureEvent::ApiTrackValue(ApiTrackValue {
                pid,
                tid,
                timestamp_ns: scope.begin_ns,
                name: scope.name.clone(),
                value,
            })],
            None => Vec::new(),
        },
        ScopeKind::String => vec![CaptureEvent::ApiStringEvent(ApiStringEvent {
            pid,
            tid,
            timestamp_ns: scope.begin_ns,
            id: scope.data,
            name: scope.name.clone(),
            color_rgba,
        })],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Color;
    use trawl_common::TrackValue;

    fn scope(kind: ScopeKind) -> Scope {
        Scope {
            kind,
            name: "frame".to_string(),
            data: 3,
            color: Color::from_rgba(0xff00_00ff),
            begin_ns: 100,
            end_ns: 250,
            depth: 0,
            tid: 11,
            pid: 10,
            track_value: None,
        }
    }

    #[test]
    fn test_sync_scope_relayed_as_start_then_stop() {
        match scope_to_events(&scope(ScopeKind::Start)).as_slice() {
            [CaptureEvent::ApiScopeStart(start)] => {
                assert_eq!(start.timestamp_ns, 100);
                assert_eq!(start.group_id, 3);
                assert_eq!(start.color_rgba, 0xff00_00ff);
            }
            other => panic!("unexpected {other:?}"),
        }
        match scope_to_events(&scope(ScopeKind::Stop)).as_slice() {
            [CaptureEvent::ApiScopeStop(stop)] => {
                assert_eq!(stop.timestamp_ns, 250);
                assert_eq!(stop.tid, 11);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_track_value_without_value_is_dropped() {
        assert!(scope_to_events(&scope(ScopeKind::TrackValue)).is_empty());

        let mut with_value = scope(ScopeKind::TrackValue);
        with_value.track_value = Some(TrackValue::Double(0.5));
        assert!(matches!(
            scope_to_events(&with_value).as_slice(),
            [CaptureEvent::ApiTrackValue(ApiTrackValue { value: TrackValue::Double(_), .. })]
        ));
    }

    #[test]
    fn test_async_ids_carry_through() {
        match scope_to_events(&scope(ScopeKind::StopAsync)).as_slice() {
            [CaptureEvent::ApiScopeStopAsync(stop)] => {
                assert_eq!(stop.id, 3);
                assert_eq!(stop.timestamp_ns, 250);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
