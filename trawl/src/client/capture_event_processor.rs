//! Client-side decoding of merged capture events.
//!
//! Interns callstacks and tracepoints by content, reconstructs user-API
//! scopes, and forwards everything to a [`CaptureListener`]. A callstack or
//! tracepoint is announced through `on_unique_*` before the first event that
//! references it.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use trawl_common::{CaptureEvent, FunctionCall};

use super::api_event_processor::{ApiEventProcessor, ApiOutput};
use super::callstack_data::{CallstackEvent, CallstackInfo};
use super::capture_listener::{CaptureListener, TimerInfo, TimerKind};
use super::tracepoint_data::{TracepointEventInfo, TracepointInfo};
use crate::domain::{CallstackId, Color, ProducerId, Tid, TracepointKey};

pub struct CaptureEventProcessor<L: CaptureListener> {
    listener: L,
    api: ApiEventProcessor,
    callstack_ids: HashMap<CallstackInfo, CallstackId>,
    used_callstack_ids: HashSet<CallstackId>,
    tracepoint_keys: HashMap<TracepointInfo, TracepointKey>,
    events_by_producer: HashMap<ProducerId, u64>,
}

impl<L: CaptureListener> CaptureEventProcessor<L> {
    pub fn new(listener: L) -> Self {
        Self {
            listener,
            api: ApiEventProcessor::new(),
            callstack_ids: HashMap::new(),
            used_callstack_ids: HashSet::new(),
            tracepoint_keys: HashMap::new(),
            events_by_producer: HashMap::new(),
        }
    }

    pub fn listener(&self) -> &L {
        &self.listener
    }

    pub fn listener_mut(&mut self) -> &mut L {
        &mut self.listener
    }

    pub fn into_listener(self) -> L {
        self.listener
    }

    #[must_use]
    pub fn events_from(&self, producer: ProducerId) -> u64 {
        self.events_by_producer.get(&producer).copied().unwrap_or(0)
    }

    /// Record where an event came from. Merging happens before
    /// [`process_event`](Self::process_event), so provenance is counted on
    /// arrival.
    pub fn note_arrival(&mut self, producer: ProducerId) {
        *self.events_by_producer.entry(producer).or_default() += 1;
    }

    pub fn process_event(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::SchedulingSlice(slice) => self.listener.on_scheduling_slice(slice),
            CaptureEvent::CallstackSample(sample) => {
                let callstack =
                    CallstackInfo { frames: sample.frames, callstack_type: sample.callstack_type };
                let callstack_id = self.intern_callstack(callstack);
                self.listener.on_callstack_event(CallstackEvent {
                    timestamp_ns: sample.timestamp_ns,
                    tid: Tid(sample.tid),
                    callstack_id,
                });
            }
            CaptureEvent::FunctionCall(call) => self.listener.on_timer(function_call_timer(&call)),
            CaptureEvent::ApiScopeStart(_)
            | CaptureEvent::ApiScopeStop(_)
            | CaptureEvent::ApiScopeStartAsync(_)
            | CaptureEvent::ApiScopeStopAsync(_)
            | CaptureEvent::ApiStringEvent(_)
            | CaptureEvent::ApiTrackValue(_) => match self.api.process(&event) {
                Some(ApiOutput::Timer(timer)) => self.listener.on_timer(timer),
                Some(ApiOutput::String(string)) => self.listener.on_api_string_event(string),
                Some(ApiOutput::TrackValue(value)) => self.listener.on_api_track_value(value),
                None => {}
            },
            CaptureEvent::TracepointEvent(tracepoint) => {
                let key = self.intern_tracepoint(TracepointInfo {
                    category: tracepoint.category,
                    name: tracepoint.name,
                });
                self.listener.on_tracepoint_event(TracepointEventInfo {
                    timestamp_ns: tracepoint.timestamp_ns,
                    pid: tracepoint.pid,
                    tid: tracepoint.tid,
                    cpu: tracepoint.cpu,
                    key,
                });
            }
            CaptureEvent::ModuleUpdate(update) => {
                self.listener.on_module_update(update.timestamp_ns, update.module);
            }
            CaptureEvent::ModulesSnapshot(snapshot) => {
                self.listener.on_modules_snapshot(snapshot.timestamp_ns, snapshot.modules);
            }
            CaptureEvent::ThreadName(thread) => {
                self.listener.on_thread_name(thread.pid, thread.tid, thread.name);
            }
            CaptureEvent::ThreadStateSlice(slice) => self.listener.on_thread_state_slice(slice),
            CaptureEvent::PresentEvent(present) => self.listener.on_present_event(present),
            CaptureEvent::WarningEvent(warning) => self.listener.on_warning_event(warning),
            CaptureEvent::ErrorEvent(error) => self.listener.on_error_event(error),
            CaptureEvent::LostPerfRecordsEvent(lost) => self.listener.on_lost_perf_records(lost),
            CaptureEvent::OutOfOrderEventsDiscardedEvent(discarded) => {
                self.listener.on_out_of_order_events_discarded(discarded);
            }
        }
    }

    fn intern_callstack(&mut self, callstack: CallstackInfo) -> CallstackId {
        if let Some(&id) = self.callstack_ids.get(&callstack) {
            return id;
        }

        let mut hasher = DefaultHasher::new();
        callstack.hash(&mut hasher);
        let mut id = CallstackId(hasher.finish());
        // Distinct frame vectors never share an id.
        while self.used_callstack_ids.contains(&id) {
            id = CallstackId(id.0.wrapping_add(1));
        }

        self.used_callstack_ids.insert(id);
        self.callstack_ids.insert(callstack.clone(), id);
        self.listener.on_unique_callstack(id, callstack);
        id
    }

    fn intern_tracepoint(&mut self, info: TracepointInfo) -> TracepointKey {
        if let Some(&key) = self.tracepoint_keys.get(&info) {
            return key;
        }
        let key = TracepointKey(self.tracepoint_keys.len() as u64);
        self.tracepoint_keys.insert(info.clone(), key);
        self.listener.on_unique_tracepoint_info(key, info);
        key
    }
}

fn function_call_timer(call: &FunctionCall) -> TimerInfo {
    TimerInfo {
        start_ns: call.end_timestamp_ns.saturating_sub(call.duration_ns),
        end_ns: call.end_timestamp_ns,
        pid: call.pid,
        tid: call.tid,
        depth: call.depth,
        kind: TimerKind::FunctionCall,
        name: String::new(),
        color: Color::default(),
        group_id: 0,
        async_id: 0,
        function_id: call.function_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trawl_common::{CallstackSample, CallstackType, TracepointEvent};

    #[derive(Default)]
    struct Recorder {
        timers: Vec<TimerInfo>,
        unique_callstacks: Vec<(CallstackId, CallstackInfo)>,
        callstack_events: Vec<CallstackEvent>,
        tracepoint_infos: Vec<(TracepointKey, TracepointInfo)>,
        tracepoint_events: Vec<TracepointEventInfo>,
    }

    impl CaptureListener for Recorder {
        fn on_timer(&mut self, timer: TimerInfo) {
            self.timers.push(timer);
        }
        fn on_unique_callstack(&mut self, id: CallstackId, callstack: CallstackInfo) {
            self.unique_callstacks.push((id, callstack));
        }
        fn on_callstack_event(&mut self, event: CallstackEvent) {
            self.callstack_events.push(event);
        }
        fn on_unique_tracepoint_info(&mut self, key: TracepointKey, info: TracepointInfo) {
            self.tracepoint_infos.push((key, info));
        }
        fn on_tracepoint_event(&mut self, event: TracepointEventInfo) {
            self.tracepoint_events.push(event);
        }
    }

    fn sample(ts: u64, frames: &[u64]) -> CaptureEvent {
        CaptureEvent::CallstackSample(CallstackSample {
            pid: 1,
            tid: 2,
            timestamp_ns: ts,
            frames: frames.to_vec(),
            callstack_type: CallstackType::Complete,
        })
    }

    #[test]
    fn test_identical_callstacks_interned_once() {
        let mut processor = CaptureEventProcessor::new(Recorder::default());
        processor.process_event(sample(1, &[0xa, 0xb]));
        processor.process_event(sample(2, &[0xa, 0xb]));
        processor.process_event(sample(3, &[0xa, 0xc]));

        let recorder = processor.into_listener();
        assert_eq!(recorder.unique_callstacks.len(), 2);
        assert_eq!(recorder.callstack_events.len(), 3);
        let ids: Vec<_> = recorder.callstack_events.iter().map(|e| e.callstack_id).collect();
        assert_eq!(ids[0], ids[1]);
        assert_ne!(ids[0], ids[2]);
    }

    #[test]
    fn test_tracepoints_interned_by_name() {
        let mut processor = CaptureEventProcessor::new(Recorder::default());
        for (ts, name) in [(1, "sched_switch"), (2, "sched_wakeup"), (3, "sched_switch")] {
            processor.process_event(CaptureEvent::TracepointEvent(TracepointEvent {
                pid: 1,
                tid: 1,
                timestamp_ns: ts,
                cpu: 0,
                category: "sched".to_string(),
                name: name.to_string(),
            }));
        }
        let recorder = processor.into_listener();
        assert_eq!(recorder.tracepoint_infos.len(), 2);
        assert_eq!(recorder.tracepoint_events[0].key, recorder.tracepoint_events[2].key);
    }

    #[test]
    fn test_function_call_becomes_timer() {
        let mut processor = CaptureEventProcessor::new(Recorder::default());
        processor.process_event(CaptureEvent::FunctionCall(FunctionCall {
            pid: 1,
            tid: 3,
            function_id: 9,
            duration_ns: 40,
            end_timestamp_ns: 100,
            depth: 2,
            return_value: 0,
        }));
        let timer = &processor.listener().timers[0];
        assert_eq!((timer.start_ns, timer.end_ns, timer.depth), (60, 100, 2));
        assert_eq!((timer.kind, timer.function_id), (TimerKind::FunctionCall, 9));
    }
}
