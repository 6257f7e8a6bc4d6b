//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep pids, tids and the various interned ids from
//! being mixed up, and make function signatures more expressive.

use serde::Serialize;
use std::fmt;
use trawl_common::{
    ALL_PROCESS_THREADS_TID, ALL_THREADS_OF_ALL_PROCESSES_TID, NOT_TARGET_PROCESS_TID,
};

/// Process ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Pid(pub i32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID:{}", self.0)
    }
}

impl From<i32> for Pid {
    fn from(pid: i32) -> Self {
        Pid(pid)
    }
}

/// Thread ID
///
/// Negative values are aggregation sentinels, never real kernel tids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Tid(pub i32);

impl Tid {
    pub const ALL_PROCESS_THREADS: Tid = Tid(ALL_PROCESS_THREADS_TID);
    pub const ALL_THREADS_OF_ALL_PROCESSES: Tid = Tid(ALL_THREADS_OF_ALL_PROCESSES_TID);
    pub const NOT_TARGET_PROCESS: Tid = Tid(NOT_TARGET_PROCESS_TID);

    /// Returns true for the aggregation sentinels.
    #[must_use]
    pub fn is_sentinel(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Tid::ALL_PROCESS_THREADS => write!(f, "TID:all-process"),
            Tid::ALL_THREADS_OF_ALL_PROCESSES => write!(f, "TID:all"),
            Tid::NOT_TARGET_PROCESS => write!(f, "TID:not-target"),
            Tid(tid) => write!(f, "TID:{tid}"),
        }
    }
}

impl From<i32> for Tid {
    fn from(tid: i32) -> Self {
        Tid(tid)
    }
}

/// Interned callstack id
///
/// Assigned from the content hash of the frame vector, probed forward on
/// collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CallstackId(pub u64);

impl fmt::Display for CallstackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callstack#{:#x}", self.0)
    }
}

/// Opaque tracepoint key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TracepointKey(pub u64);

impl fmt::Display for TracepointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tracepoint#{}", self.0)
    }
}

/// Identifier of a connected producer, assigned by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ProducerId(pub u64);

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Producer#{}", self.0)
    }
}

/// RGBA color decoded from the packed `0xRRGGBBAA` form used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    #[must_use]
    pub fn from_rgba(rgba: u32) -> Self {
        let [r, g, b, a] = rgba.to_be_bytes();
        Self { r, g, b, a }
    }

    #[must_use]
    pub fn to_rgba(self) -> u32 {
        u32::from_be_bytes([self.r, self.g, self.b, self.a])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tid_display() {
        assert_eq!(Tid(7).to_string(), "TID:7");
        assert_eq!(Tid::NOT_TARGET_PROCESS.to_string(), "TID:not-target");
        assert!(Tid::ALL_PROCESS_THREADS.is_sentinel());
        assert!(!Tid(0).is_sentinel());
    }

    #[test]
    fn test_color_unpacks_rgba() {
        let color = Color::from_rgba(0x1122_33ff);
        assert_eq!(color, Color { r: 0x11, g: 0x22, b: 0x33, a: 0xff });
        assert_eq!(color.to_rgba(), 0x1122_33ff);
    }
}
