//! Timestamp merge across producers.
//!
//! Producers deliver events in their own order and at their own pace. The
//! merger holds events in a min-heap and releases those older than the newest
//! timestamp seen minus a fixed window. An event that arrives older than one
//! already released can no longer be placed and is discarded; discards are
//! reported as one [`OutOfOrderEventsDiscardedEvent`] per drain.

use log::warn;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use trawl_common::{CaptureEvent, OutOfOrderEventsDiscardedEvent};

pub const DEFAULT_MERGE_WINDOW_NS: u64 = 100_000_000;

struct Pending {
    timestamp_ns: u64,
    /// Arrival order, so equal timestamps keep per-producer order.
    seq: u64,
    event: CaptureEvent,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.timestamp_ns, self.seq).cmp(&(other.timestamp_ns, other.seq))
    }
}

#[derive(Default)]
struct DiscardStats {
    count: u64,
    earliest_ns: u64,
    latest_ns: u64,
}

pub struct EventMerger {
    window_ns: u64,
    heap: BinaryHeap<Reverse<Pending>>,
    next_seq: u64,
    max_seen_ns: u64,
    last_released_ns: Option<u64>,
    discards: DiscardStats,
    total_discarded: u64,
}

impl Default for EventMerger {
    fn default() -> Self {
        Self::new(DEFAULT_MERGE_WINDOW_NS)
    }
}

impl EventMerger {
    #[must_use]
    pub fn new(window_ns: u64) -> Self {
        Self {
            window_ns,
            heap: BinaryHeap::new(),
            next_seq: 0,
            max_seen_ns: 0,
            last_released_ns: None,
            discards: DiscardStats::default(),
            total_discarded: 0,
        }
    }

    pub fn push(&mut self, event: CaptureEvent) {
        let timestamp_ns = event.timestamp_ns();
        if self.last_released_ns.is_some_and(|last| timestamp_ns < last) {
            let stats = &mut self.discards;
            if stats.count == 0 {
                stats.earliest_ns = timestamp_ns;
                stats.latest_ns = timestamp_ns;
            }
            stats.count += 1;
            stats.earliest_ns = stats.earliest_ns.min(timestamp_ns);
            stats.latest_ns = stats.latest_ns.max(timestamp_ns);
            self.total_discarded += 1;
            return;
        }

        self.max_seen_ns = self.max_seen_ns.max(timestamp_ns);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Pending { timestamp_ns, seq, event }));
    }

    /// Release every event older than the window, in timestamp order.
    pub fn drain_ready(&mut self, mut emit: impl FnMut(CaptureEvent)) {
        let horizon = self.max_seen_ns.saturating_sub(self.window_ns);
        self.release_while(|ts| ts <= horizon, &mut emit);
        self.report_discards(&mut emit);
    }

    /// Release everything still pending.
    pub fn drain_all(&mut self, mut emit: impl FnMut(CaptureEvent)) {
        self.release_while(|_| true, &mut emit);
        self.report_discards(&mut emit);
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.heap.len()
    }

    #[must_use]
    pub fn total_discarded(&self) -> u64 {
        self.total_discarded
    }

    fn release_while(
        &mut self,
        ready: impl Fn(u64) -> bool,
        emit: &mut impl FnMut(CaptureEvent),
    ) {
        while self.heap.peek().is_some_and(|Reverse(p)| ready(p.timestamp_ns)) {
            if let Some(Reverse(pending)) = self.heap.pop() {
                self.last_released_ns = Some(pending.timestamp_ns);
                emit(pending.event);
            }
        }
    }

    fn report_discards(&mut self, emit: &mut impl FnMut(CaptureEvent)) {
        if self.discards.count == 0 {
            return;
        }
        let stats = std::mem::take(&mut self.discards);
        warn!("Discarded {} out-of-order events", stats.count);
        emit(CaptureEvent::OutOfOrderEventsDiscardedEvent(OutOfOrderEventsDiscardedEvent {
            pid: 0,
            tid: 0,
            end_timestamp_ns: stats.latest_ns,
            duration_ns: stats.latest_ns - stats.earliest_ns,
            num_discarded: stats.count,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trawl_common::ApiScopeStop;

    fn event(ts: u64, tid: i32) -> CaptureEvent {
        CaptureEvent::ApiScopeStop(ApiScopeStop { pid: 1, tid, timestamp_ns: ts })
    }

    fn collect(merger: &mut EventMerger, all: bool) -> Vec<(u64, i32)> {
        let mut out = Vec::new();
        let emit = |e: CaptureEvent| out.push((e.timestamp_ns(), e.tid()));
        if all {
            merger.drain_all(emit);
        } else {
            merger.drain_ready(emit);
        }
        out
    }

    #[test]
    fn test_interleaves_producers_by_timestamp() {
        let mut merger = EventMerger::new(10);
        for ts in [1, 5, 9] {
            merger.push(event(ts, 1));
        }
        for ts in [2, 3, 30] {
            merger.push(event(ts, 2));
        }
        assert_eq!(collect(&mut merger, false), vec![(1, 1), (2, 2), (3, 2), (5, 1), (9, 1)]);
        assert_eq!(merger.pending(), 1);
        assert_eq!(collect(&mut merger, true), vec![(30, 2)]);
    }

    #[test]
    fn test_equal_timestamps_keep_arrival_order() {
        let mut merger = EventMerger::new(0);
        merger.push(event(5, 1));
        merger.push(event(5, 2));
        merger.push(event(5, 3));
        assert_eq!(collect(&mut merger, true), vec![(5, 1), (5, 2), (5, 3)]);
    }

    #[test]
    fn test_late_event_is_discarded_and_reported() {
        let mut merger = EventMerger::new(5);
        merger.push(event(10, 1));
        merger.push(event(20, 1));
        assert_eq!(collect(&mut merger, false), vec![(10, 1)]);

        merger.push(event(4, 2));
        merger.push(event(7, 2));
        let out = collect(&mut merger, true);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], (20, 1));
        assert_eq!(merger.total_discarded(), 2);
    }
}
