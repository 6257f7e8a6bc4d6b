//! Tracepoint metadata and the per-thread tracepoint event index.
//!
//! Two independently locked parts: the unique `key → (category, name)` table
//! and the per-thread event index. Events from outside the target process
//! share the [`Tid::NOT_TARGET_PROCESS`] bucket.

use log::warn;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::clock::lock;
use crate::domain::{Tid, TracepointKey};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TracepointInfo {
    pub category: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TracepointEventInfo {
    pub timestamp_ns: u64,
    pub pid: i32,
    pub tid: i32,
    pub cpu: i32,
    pub key: TracepointKey,
}

#[derive(Default)]
struct EventIndex {
    by_tid: HashMap<Tid, BTreeMap<u64, TracepointEventInfo>>,
    total: usize,
}

#[derive(Default)]
pub struct TracepointData {
    unique_tracepoints: Mutex<HashMap<TracepointKey, TracepointInfo>>,
    events: Mutex<EventIndex>,
}

impl TracepointData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `info` under `key`. The first registration wins; later ones
    /// return false and leave the stored info unchanged.
    pub fn add_unique_tracepoint_info(&self, key: TracepointKey, info: TracepointInfo) -> bool {
        let mut unique = lock(&self.unique_tracepoints);
        if unique.contains_key(&key) {
            return false;
        }
        unique.insert(key, info);
        true
    }

    #[must_use]
    pub fn tracepoint_info(&self, key: TracepointKey) -> Option<TracepointInfo> {
        lock(&self.unique_tracepoints).get(&key).cloned()
    }

    #[must_use]
    pub fn has_tracepoint_key(&self, key: TracepointKey) -> bool {
        lock(&self.unique_tracepoints).contains_key(&key)
    }

    #[must_use]
    pub fn unique_tracepoints_count(&self) -> usize {
        lock(&self.unique_tracepoints).len()
    }

    /// Index `event` under its thread, or under the not-target bucket when it
    /// comes from another process. A second event at the same bucket and
    /// timestamp is dropped.
    pub fn emplace_tracepoint_event(
        &self,
        event: TracepointEventInfo,
        is_same_pid_as_target: bool,
    ) {
        let bucket = if is_same_pid_as_target { Tid(event.tid) } else { Tid::NOT_TARGET_PROCESS };

        let mut events = lock(&self.events);
        events.total += 1;
        let slot = events.by_tid.entry(bucket).or_default();
        if slot.contains_key(&event.timestamp_ns) {
            warn!(
                "Dropping duplicate tracepoint event for {bucket} at {} ({})",
                event.timestamp_ns, event.key
            );
            return;
        }
        slot.insert(event.timestamp_ns, event);
    }

    /// Number of events recorded for `tid`.
    ///
    /// [`Tid::ALL_THREADS_OF_ALL_PROCESSES`] counts every emplace call;
    /// [`Tid::ALL_PROCESS_THREADS`] excludes the not-target bucket.
    #[must_use]
    pub fn num_tracepoint_events_for_thread_id(&self, tid: Tid) -> usize {
        let events = lock(&self.events);
        let bucket_len = |t: Tid| events.by_tid.get(&t).map_or(0, BTreeMap::len);
        match tid {
            Tid::ALL_THREADS_OF_ALL_PROCESSES => events.total,
            Tid::ALL_PROCESS_THREADS => events.total - bucket_len(Tid::NOT_TARGET_PROCESS),
            tid => bucket_len(tid),
        }
    }

    /// Visit events of `tid` with `t0 <= ts < t1` in timestamp order. Sentinel
    /// tids visit every bucket they aggregate, bucket by bucket.
    pub fn for_each_tracepoint_event_of_thread_in_time_range(
        &self,
        tid: Tid,
        t0: u64,
        t1: u64,
        mut visit: impl FnMut(&TracepointEventInfo),
    ) {
        if t0 >= t1 {
            return;
        }
        let events = lock(&self.events);
        let mut buckets: Vec<(&Tid, &BTreeMap<u64, TracepointEventInfo>)> = match tid {
            Tid::ALL_THREADS_OF_ALL_PROCESSES => events.by_tid.iter().collect(),
            Tid::ALL_PROCESS_THREADS => events
                .by_tid
                .iter()
                .filter(|&(&t, _)| t != Tid::NOT_TARGET_PROCESS)
                .collect(),
            tid => events.by_tid.get_key_value(&tid).into_iter().collect(),
        };
        buckets.sort_by_key(|&(&t, _)| t);
        for (_, bucket) in buckets {
            for event in bucket.range(t0..t1).map(|(_, e)| e) {
                visit(event);
            }
        }
    }
}
