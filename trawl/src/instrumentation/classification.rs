//! Hook classification for dynamically instrumented functions.
//!
//! A small allow-list of libc file-I/O entry points gets [`HookKind::FileIo`]
//! probes, which keep the function's return value (bytes transferred or the
//! new descriptor). Every other function is instrumented as
//! [`HookKind::Generic`] and reports entry/exit timing only.
//!
//! # Classification Strategy
//!
//! 1. **Module path** - the function must live in libc (`libc.so*`, `libc-*.so`)
//! 2. **Function name** - exact match against [`FILE_IO_FUNCTIONS`]

use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileIoOp {
    Open,
    OpenAt,
    Read,
    Write,
    Close,
    Pread,
    Pwrite,
    Fsync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HookKind {
    FileIo(FileIoOp),
    #[default]
    Generic,
}

impl HookKind {
    #[must_use]
    pub fn is_file_io(&self) -> bool {
        matches!(self, HookKind::FileIo(_))
    }

    /// File-I/O hooks report the function's return value.
    #[must_use]
    pub fn records_return_value(&self) -> bool {
        self.is_file_io()
    }
}

// =============================================================================
// CLASSIFICATION TABLES
// =============================================================================

/// libc symbols instrumented as file I/O.
pub const FILE_IO_FUNCTIONS: &[(&str, FileIoOp)] = &[
    ("open", FileIoOp::Open),
    ("openat", FileIoOp::OpenAt),
    ("read", FileIoOp::Read),
    ("write", FileIoOp::Write),
    ("close", FileIoOp::Close),
    ("pread64", FileIoOp::Pread),
    ("pwrite64", FileIoOp::Pwrite),
    ("fsync", FileIoOp::Fsync),
];

/// File name prefixes of the C library.
const LIBC_FILE_PREFIXES: &[&str] = &["libc.so", "libc-"];

/// Classify `function_name` defined in the module at `file_path`.
///
/// ```ignore
/// classify_function("/usr/lib/x86_64-linux-gnu/libc.so.6", "pread64");
/// // → HookKind::FileIo(FileIoOp::Pread)
///
/// classify_function("/opt/game/bin/game", "read");
/// // → HookKind::Generic (not libc)
/// ```
#[must_use]
pub fn classify_function(file_path: &str, function_name: &str) -> HookKind {
    if !is_libc_path(file_path) {
        return HookKind::Generic;
    }
    FILE_IO_FUNCTIONS
        .iter()
        .find(|(name, _)| *name == function_name)
        .map_or(HookKind::Generic, |&(_, op)| HookKind::FileIo(op))
}

fn is_libc_path(file_path: &str) -> bool {
    Path::new(file_path)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| LIBC_FILE_PREFIXES.iter().any(|prefix| name.starts_with(prefix)))
}
