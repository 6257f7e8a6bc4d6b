//! Deduplicated callstacks and the per-thread sample index.
//!
//! ## Majority-start filter
//!
//! Unwinding occasionally produces truncated stacks whose outermost frame is
//! not the thread's real entry point. For each thread, among samples whose
//! callstack is [`CallstackType::Complete`] and whose outermost frame is not an
//! excluded "stop unwinding here" function, the most frequent outermost frame
//! is the thread's majority start if it accounts for at least the
//! supermajority share of those samples. Counted samples with a different
//! outermost frame are then dropped. Samples that were not counted are kept.

use log::{debug, info};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use trawl_common::CallstackType;

use crate::clock::lock;
use crate::domain::{CallstackDataError, CallstackId, Tid};

/// Frames innermost first.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CallstackInfo {
    pub frames: Vec<u64>,
    pub callstack_type: CallstackType,
}

impl CallstackInfo {
    #[must_use]
    pub fn outermost_frame(&self) -> Option<u64> {
        self.frames.last().copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallstackEvent {
    pub timestamp_ns: u64,
    pub tid: Tid,
    pub callstack_id: CallstackId,
}

/// Share `num/den` a majority start must reach. Always strictly above 1/2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Supermajority {
    num: u32,
    den: u32,
}

impl Supermajority {
    /// # Errors
    /// [`CallstackDataError::InvalidSupermajority`] unless `1/2 < num/den <= 1`.
    pub fn new(num: u32, den: u32) -> Result<Self, CallstackDataError> {
        if den == 0 || num > den || u64::from(num) * 2 <= u64::from(den) {
            return Err(CallstackDataError::InvalidSupermajority { num, den });
        }
        Ok(Self { num, den })
    }

    #[must_use]
    pub fn is_reached(self, count: usize, total: usize) -> bool {
        total > 0
            && (count as u128) * u128::from(self.den) >= (total as u128) * u128::from(self.num)
    }
}

impl Default for Supermajority {
    fn default() -> Self {
        Self { num: 2, den: 3 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MajorityStartFilter {
    pub supermajority: Supermajority,
    /// Addresses of functions where unwinding intentionally stops; samples
    /// ending in one of them never vote.
    pub excluded_outermost_frames: HashSet<u64>,
}

#[derive(Default)]
struct Inner {
    unique_callstacks: HashMap<CallstackId, Arc<CallstackInfo>>,
    events_by_tid: HashMap<Tid, BTreeMap<u64, CallstackEvent>>,
}

impl Inner {
    fn buckets_for(&self, tid: Tid) -> Vec<&BTreeMap<u64, CallstackEvent>> {
        match tid {
            Tid::ALL_THREADS_OF_ALL_PROCESSES => self.events_by_tid.values().collect(),
            Tid::ALL_PROCESS_THREADS => self
                .events_by_tid
                .iter()
                .filter(|&(&t, _)| t != Tid::NOT_TARGET_PROCESS)
                .map(|(_, events)| events)
                .collect(),
            tid => self.events_by_tid.get(&tid).into_iter().collect(),
        }
    }
}

#[derive(Default)]
pub struct CallstackData {
    inner: Mutex<Inner>,
}

impl CallstackData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if `id` was already registered; the stored callstack is
    /// left unchanged.
    pub fn add_unique_callstack(&self, id: CallstackId, callstack: CallstackInfo) -> bool {
        let mut inner = lock(&self.inner);
        if inner.unique_callstacks.contains_key(&id) {
            return false;
        }
        inner.unique_callstacks.insert(id, Arc::new(callstack));
        true
    }

    /// # Errors
    /// [`CallstackDataError::UnknownCallstack`] if the event references an
    /// unregistered callstack.
    pub fn add_callstack_event(&self, event: CallstackEvent) -> Result<(), CallstackDataError> {
        let mut inner = lock(&self.inner);
        if !inner.unique_callstacks.contains_key(&event.callstack_id) {
            return Err(CallstackDataError::UnknownCallstack(event.callstack_id));
        }
        inner.events_by_tid.entry(event.tid).or_default().insert(event.timestamp_ns, event);
        Ok(())
    }

    #[must_use]
    pub fn callstack(&self, id: CallstackId) -> Option<Arc<CallstackInfo>> {
        lock(&self.inner).unique_callstacks.get(&id).cloned()
    }

    #[must_use]
    pub fn unique_callstacks_count(&self) -> usize {
        lock(&self.inner).unique_callstacks.len()
    }

    #[must_use]
    pub fn callstack_events_count(&self) -> usize {
        lock(&self.inner).events_by_tid.values().map(BTreeMap::len).sum()
    }

    /// Event count for a concrete tid or a sentinel.
    #[must_use]
    pub fn callstack_events_count_of_tid(&self, tid: Tid) -> usize {
        lock(&self.inner).buckets_for(tid).iter().map(|events| events.len()).sum()
    }

    /// Events of `tid` with `t0 <= ts < t1`, ascending by timestamp. Sentinel
    /// tids merge the buckets they aggregate.
    #[must_use]
    pub fn callstack_events_of_tid_in_time_range(
        &self,
        tid: Tid,
        t0: u64,
        t1: u64,
    ) -> Vec<CallstackEvent> {
        if t0 >= t1 {
            return Vec::new();
        }
        let inner = lock(&self.inner);
        let buckets = inner.buckets_for(tid);
        let mut events: Vec<CallstackEvent> =
            buckets.iter().flat_map(|events| events.range(t0..t1).map(|(_, e)| *e)).collect();
        if buckets.len() > 1 {
            events.sort_by_key(|e| (e.timestamp_ns, e.tid));
        }
        events
    }

    #[must_use]
    pub fn callstack_events_in_time_range(&self, t0: u64, t1: u64) -> Vec<CallstackEvent> {
        self.callstack_events_of_tid_in_time_range(Tid::ALL_THREADS_OF_ALL_PROCESSES, t0, t1)
    }

    /// Concrete tids with at least one event, ascending.
    #[must_use]
    pub fn thread_ids(&self) -> Vec<Tid> {
        let inner = lock(&self.inner);
        let mut tids: Vec<Tid> =
            inner.events_by_tid.iter().filter(|(_, e)| !e.is_empty()).map(|(&t, _)| t).collect();
        tids.sort_unstable();
        tids
    }

    #[must_use]
    pub fn min_time(&self) -> Option<u64> {
        let inner = lock(&self.inner);
        inner.events_by_tid.values().filter_map(|e| e.keys().next().copied()).min()
    }

    #[must_use]
    pub fn max_time(&self) -> Option<u64> {
        let inner = lock(&self.inner);
        inner.events_by_tid.values().filter_map(|e| e.keys().next_back().copied()).max()
    }

    /// Drop samples whose outermost frame disagrees with the thread's
    /// majority start. Returns the number of dropped samples.
    pub fn filter_callstack_events_based_on_majority_start(
        &self,
        filter: &MajorityStartFilter,
    ) -> usize {
        let mut inner = lock(&self.inner);
        let Inner { unique_callstacks, events_by_tid } = &mut *inner;

        let voting_outermost = |event: &CallstackEvent| -> Option<u64> {
            let callstack = unique_callstacks.get(&event.callstack_id)?;
            if callstack.callstack_type != CallstackType::Complete {
                return None;
            }
            callstack
                .outermost_frame()
                .filter(|frame| !filter.excluded_outermost_frames.contains(frame))
        };

        let mut dropped_total = 0;
        for (tid, events) in events_by_tid.iter_mut() {
            if tid.is_sentinel() {
                continue;
            }

            // Ordered map so that ties resolve to the lower address.
            let mut votes: BTreeMap<u64, usize> = BTreeMap::new();
            let mut total = 0;
            for event in events.values() {
                if let Some(frame) = voting_outermost(event) {
                    *votes.entry(frame).or_default() += 1;
                    total += 1;
                }
            }

            let mut majority: Option<(u64, usize)> = None;
            for (&frame, &count) in &votes {
                if majority.map_or(true, |(_, best)| count > best) {
                    majority = Some((frame, count));
                }
            }
            let Some((majority_start, count)) = majority else {
                continue;
            };
            if !filter.supermajority.is_reached(count, total) {
                debug!("{tid}: no majority start ({count}/{total} for {majority_start:#x})");
                continue;
            }

            let before = events.len();
            events.retain(|_, event| {
                voting_outermost(event).map_or(true, |frame| frame == majority_start)
            });
            dropped_total += before - events.len();
        }

        if dropped_total > 0 {
            info!("Majority-start filter dropped {dropped_total} callstack samples");
        }
        dropped_total
    }
}
