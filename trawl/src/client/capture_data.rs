//! Indexed model of one capture.
//!
//! [`CaptureData`] is the production [`CaptureListener`]: it files every
//! decoded event into the structure that answers queries about it. Timers are
//! appended per thread into [`BlockChain`]s; readers snapshot the length under
//! the same lock and walk that prefix.

use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use trawl_common::{
    CaptureOptions, ErrorEvent, LostPerfRecordsEvent, ModuleInfo, OutOfOrderEventsDiscardedEvent,
    PresentEvent, SchedulingSlice, ThreadStateSlice, WarningEvent,
};

use super::callstack_data::{CallstackData, CallstackEvent, CallstackInfo, MajorityStartFilter};
use super::capture_listener::{
    ApiStringEventInfo, ApiTrackValueInfo, CaptureListener, TimerInfo, TimerKind,
};
use super::module_manager::ModuleManager;
use super::process_data::ProcessData;
use super::tracepoint_data::{TracepointData, TracepointEventInfo, TracepointInfo};
use crate::clock::lock;
use crate::containers::BlockChain;
use crate::domain::{CallstackId, Pid, Tid, TracepointKey};

/// Aggregate counts written by the service binary's JSON export.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CaptureSummary {
    pub target_pid: i32,
    pub finished: bool,
    pub timers: usize,
    pub timers_by_kind: BTreeMap<String, usize>,
    pub threads_with_timers: usize,
    pub unique_callstacks: usize,
    pub callstack_samples: usize,
    pub tracepoint_events: usize,
    pub scheduling_slices: usize,
    pub thread_state_slices: usize,
    pub present_events: usize,
    pub api_string_events: usize,
    pub api_track_values: usize,
    pub modules: usize,
    pub thread_names: BTreeMap<i32, String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub lost_perf_records: u64,
    pub out_of_order_discarded: u64,
    pub majority_filter_dropped: usize,
}

#[derive(Default)]
struct Counters {
    scheduling_slices: usize,
    thread_state_slices: usize,
    present_events: usize,
    lost_perf_records: u64,
    out_of_order_discarded: u64,
    majority_filter_dropped: usize,
}

pub struct CaptureData {
    target: Pid,
    options: Option<CaptureOptions>,
    finished: bool,
    callstacks: CallstackData,
    tracepoints: TracepointData,
    process: ProcessData,
    module_manager: ModuleManager,
    timers_by_tid: Mutex<HashMap<i32, BlockChain<TimerInfo>>>,
    thread_names: Mutex<BTreeMap<i32, String>>,
    string_events: Mutex<Vec<ApiStringEventInfo>>,
    track_values: Mutex<BTreeMap<String, Vec<(u64, f64)>>>,
    warnings: Mutex<Vec<WarningEvent>>,
    errors: Mutex<Vec<ErrorEvent>>,
    counters: Mutex<Counters>,
}

impl CaptureData {
    #[must_use]
    pub fn new(target: Pid, process_name: impl Into<String>) -> Self {
        Self {
            target,
            options: None,
            finished: false,
            callstacks: CallstackData::new(),
            tracepoints: TracepointData::new(),
            process: ProcessData::new(target, process_name),
            module_manager: ModuleManager::new(),
            timers_by_tid: Mutex::new(HashMap::new()),
            thread_names: Mutex::new(BTreeMap::new()),
            string_events: Mutex::new(Vec::new()),
            track_values: Mutex::new(BTreeMap::new()),
            warnings: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            counters: Mutex::new(Counters::default()),
        }
    }

    #[must_use]
    pub fn target(&self) -> Pid {
        self.target
    }

    #[must_use]
    pub fn options(&self) -> Option<&CaptureOptions> {
        self.options.as_ref()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn callstack_data(&self) -> &CallstackData {
        &self.callstacks
    }

    #[must_use]
    pub fn tracepoint_data(&self) -> &TracepointData {
        &self.tracepoints
    }

    #[must_use]
    pub fn process(&self) -> &ProcessData {
        &self.process
    }

    #[must_use]
    pub fn module_manager(&self) -> &ModuleManager {
        &self.module_manager
    }

    /// Snapshot of the timers recorded on `tid`, in arrival order.
    #[must_use]
    pub fn timers_of_thread(&self, tid: i32) -> Vec<TimerInfo> {
        let timers = lock(&self.timers_by_tid);
        timers
            .get(&tid)
            .map_or_else(Vec::new, |chain| chain.iter_prefix(chain.len()).cloned().collect())
    }

    #[must_use]
    pub fn timer_count(&self) -> usize {
        lock(&self.timers_by_tid).values().map(BlockChain::len).sum()
    }

    #[must_use]
    pub fn thread_name(&self, tid: i32) -> Option<String> {
        lock(&self.thread_names).get(&tid).cloned()
    }

    /// Samples of a track, `(timestamp, value)` in arrival order.
    #[must_use]
    pub fn track_values(&self, name: &str) -> Vec<(u64, f64)> {
        lock(&self.track_values).get(name).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn string_events(&self) -> Vec<ApiStringEventInfo> {
        lock(&self.string_events).clone()
    }

    /// Drop callstack samples that disagree with their thread's majority
    /// start. Returns the number of dropped samples.
    pub fn filter_callstacks_by_majority_start(&self, filter: &MajorityStartFilter) -> usize {
        let dropped = self.callstacks.filter_callstack_events_based_on_majority_start(filter);
        lock(&self.counters).majority_filter_dropped += dropped;
        dropped
    }

    #[must_use]
    pub fn summary(&self) -> CaptureSummary {
        let timers = lock(&self.timers_by_tid);
        let mut timers_by_kind: BTreeMap<String, usize> = BTreeMap::new();
        for timer in timers.values().flat_map(BlockChain::iter) {
            let kind = match timer.kind {
                TimerKind::ApiScope => "api_scope",
                TimerKind::ApiScopeAsync => "api_scope_async",
                TimerKind::FunctionCall => "function_call",
            };
            *timers_by_kind.entry(kind.to_string()).or_default() += 1;
        }
        let timer_total = timers.values().map(BlockChain::len).sum();
        let threads_with_timers = timers.len();
        drop(timers);

        let counters = lock(&self.counters);
        CaptureSummary {
            target_pid: self.target.0,
            finished: self.finished,
            timers: timer_total,
            timers_by_kind,
            threads_with_timers,
            unique_callstacks: self.callstacks.unique_callstacks_count(),
            callstack_samples: self.callstacks.callstack_events_count(),
            tracepoint_events: self
                .tracepoints
                .num_tracepoint_events_for_thread_id(Tid::ALL_THREADS_OF_ALL_PROCESSES),
            scheduling_slices: counters.scheduling_slices,
            thread_state_slices: counters.thread_state_slices,
            present_events: counters.present_events,
            api_string_events: lock(&self.string_events).len(),
            api_track_values: lock(&self.track_values).values().map(Vec::len).sum(),
            modules: self.module_manager.module_count(),
            thread_names: lock(&self.thread_names).clone(),
            warnings: lock(&self.warnings).iter().map(|w| w.message.clone()).collect(),
            errors: lock(&self.errors).iter().map(|e| e.message.clone()).collect(),
            lost_perf_records: counters.lost_perf_records,
            out_of_order_discarded: counters.out_of_order_discarded,
            majority_filter_dropped: counters.majority_filter_dropped,
        }
    }
}

impl CaptureListener for CaptureData {
    fn on_capture_started(&mut self, options: &CaptureOptions) {
        self.options = Some(options.clone());
        self.finished = false;
    }

    fn on_capture_finished(&mut self) {
        self.finished = true;
        info!("Capture of {} finished: {} timers", self.target, self.timer_count());
    }

    fn on_timer(&mut self, timer: TimerInfo) {
        lock(&self.timers_by_tid).entry(timer.tid).or_default().push_back(timer);
    }

    fn on_unique_callstack(&mut self, id: CallstackId, callstack: CallstackInfo) {
        self.callstacks.add_unique_callstack(id, callstack);
    }

    fn on_callstack_event(&mut self, event: CallstackEvent) {
        if let Err(e) = self.callstacks.add_callstack_event(event) {
            warn!("{e}");
        }
    }

    fn on_unique_tracepoint_info(&mut self, key: TracepointKey, info: TracepointInfo) {
        self.tracepoints.add_unique_tracepoint_info(key, info);
    }

    fn on_tracepoint_event(&mut self, event: TracepointEventInfo) {
        let same_pid = event.pid == self.target.0;
        self.tracepoints.emplace_tracepoint_event(event, same_pid);
    }

    fn on_scheduling_slice(&mut self, _slice: SchedulingSlice) {
        lock(&self.counters).scheduling_slices += 1;
    }

    fn on_thread_name(&mut self, _pid: i32, tid: i32, name: String) {
        lock(&self.thread_names).insert(tid, name);
    }

    fn on_thread_state_slice(&mut self, _slice: ThreadStateSlice) {
        lock(&self.counters).thread_state_slices += 1;
    }

    fn on_module_update(&mut self, _timestamp_ns: u64, module: ModuleInfo) {
        self.process.add_or_update_module_info(&module);
        self.module_manager.add_or_update_modules(std::slice::from_ref(&module));
    }

    fn on_modules_snapshot(&mut self, _timestamp_ns: u64, modules: Vec<ModuleInfo>) {
        self.process.update_module_infos(&modules);
        self.module_manager.add_or_update_modules(&modules);
    }

    fn on_api_string_event(&mut self, event: ApiStringEventInfo) {
        lock(&self.string_events).push(event);
    }

    fn on_api_track_value(&mut self, event: ApiTrackValueInfo) {
        lock(&self.track_values)
            .entry(event.name)
            .or_default()
            .push((event.timestamp_ns, event.value.as_f64()));
    }

    fn on_present_event(&mut self, _event: PresentEvent) {
        lock(&self.counters).present_events += 1;
    }

    fn on_warning_event(&mut self, event: WarningEvent) {
        warn!("Producer warning ({:?}): {}", event.kind, event.message);
        lock(&self.warnings).push(event);
    }

    fn on_error_event(&mut self, event: ErrorEvent) {
        warn!("Producer error ({:?}): {}", event.kind, event.message);
        lock(&self.errors).push(event);
    }

    fn on_lost_perf_records(&mut self, event: LostPerfRecordsEvent) {
        lock(&self.counters).lost_perf_records += event.num_lost;
    }

    fn on_out_of_order_events_discarded(&mut self, event: OutOfOrderEventsDiscardedEvent) {
        lock(&self.counters).out_of_order_discarded += event.num_discarded;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Color;
    use trawl_common::{TrackValue, WarningKind};

    fn timer(tid: i32, start: u64, end: u64) -> TimerInfo {
        TimerInfo {
            start_ns: start,
            end_ns: end,
            pid: 7,
            tid,
            depth: 0,
            kind: TimerKind::ApiScope,
            name: "work".to_string(),
            color: Color::default(),
            group_id: 0,
            async_id: 0,
            function_id: 0,
        }
    }

    #[test]
    fn test_timers_indexed_per_thread() {
        let mut data = CaptureData::new(Pid(7), "app");
        data.on_timer(timer(1, 0, 10));
        data.on_timer(timer(2, 5, 6));
        data.on_timer(timer(1, 20, 30));

        assert_eq!(data.timers_of_thread(1).len(), 2);
        assert_eq!(data.timers_of_thread(2)[0].start_ns, 5);
        assert!(data.timers_of_thread(3).is_empty());
        assert_eq!(data.timer_count(), 3);
    }

    #[test]
    fn test_tracepoints_bucketed_by_target_pid() {
        let mut data = CaptureData::new(Pid(7), "app");
        data.on_unique_tracepoint_info(
            TracepointKey(0),
            TracepointInfo { category: "sched".into(), name: "sched_switch".into() },
        );
        for (ts, pid) in [(1, 7), (2, 8)] {
            data.on_tracepoint_event(TracepointEventInfo {
                timestamp_ns: ts,
                pid,
                tid: 3,
                cpu: 0,
                key: TracepointKey(0),
            });
        }
        let tracepoints = data.tracepoint_data();
        assert_eq!(tracepoints.num_tracepoint_events_for_thread_id(Tid(3)), 1);
        assert_eq!(tracepoints.num_tracepoint_events_for_thread_id(Tid::NOT_TARGET_PROCESS), 1);
    }

    #[test]
    fn test_summary_counts() {
        let mut data = CaptureData::new(Pid(7), "app");
        data.on_timer(timer(1, 0, 10));
        data.on_api_track_value(ApiTrackValueInfo {
            timestamp_ns: 3,
            pid: 7,
            tid: 1,
            name: "queue".to_string(),
            value: TrackValue::Uint(4),
        });
        data.on_warning_event(WarningEvent {
            pid: 7,
            tid: 0,
            timestamp_ns: 1,
            kind: WarningKind::InstrumentingWithUserSpaceInstrumentation,
            message: "could not instrument foo".to_string(),
        });
        data.on_thread_name(7, 1, "main".to_string());
        data.on_capture_finished();

        let summary = data.summary();
        assert!(summary.finished);
        assert_eq!(summary.timers, 1);
        assert_eq!(summary.timers_by_kind.get("api_scope"), Some(&1));
        assert_eq!(summary.api_track_values, 1);
        assert_eq!(summary.warnings, vec!["could not instrument foo".to_string()]);
        assert_eq!(summary.thread_names.get(&1).map(String::as_str), Some("main"));
        assert_eq!(data.track_values("queue"), vec![(3, 4.0)]);
    }

    #[test]
    fn test_module_snapshot_populates_process() {
        let mut data = CaptureData::new(Pid(7), "app");
        data.on_modules_snapshot(
            0,
            vec![ModuleInfo {
                name: "app".into(),
                file_path: "/bin/app".into(),
                file_size: 10,
                address_start: 0x1000,
                address_end: 0x2000,
                build_id: "x".into(),
                load_bias: 0,
            }],
        );
        assert!(data.process().is_module_loaded_by_process("/bin/app"));
        assert!(data.module_manager().module_by_path("/bin/app").is_some());
    }
}
