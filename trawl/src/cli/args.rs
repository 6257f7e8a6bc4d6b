//! CLI argument definitions

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use trawl_common::{InstrumentedFunction, UnwindingMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Unwinding {
    /// Walk frame pointers
    FramePointers,
    /// Unwind from DWARF CFI
    Dwarf,
}

impl From<Unwinding> for UnwindingMethod {
    fn from(value: Unwinding) -> Self {
        match value {
            Unwinding::FramePointers => UnwindingMethod::FramePointers,
            Unwinding::Dwarf => UnwindingMethod::Dwarf,
        }
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "trawl",
    about = "Capture service: collects timestamped events from producers \
             and orders them into one trace",
    after_help = "\
EXAMPLES:
    trawl my-app --duration 10                              Capture by process name for 10s
    trawl --pid 1234 --socket /tmp/trawl.sock               Accept external producers on a socket
    trawl --pid 1234 -i /usr/lib/libc.so.6:read:0x10a0      Instrument libc read
    trawl --pid 1234 --export summary.json --quiet          Write a JSON capture summary"
)]
pub struct Args {
    /// Process name to capture (auto-detects PID)
    #[arg(value_name = "PROCESS")]
    pub process: Option<String>,

    /// Process ID to capture
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// Unix socket to accept external producer connections on
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Stop after N seconds (0 = until Ctrl+C or target exit)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Callstack samples per second
    #[arg(long, default_value = "1000")]
    pub sampling_rate: f64,

    /// Unwinding method for callstack samples
    #[arg(long, value_enum, default_value = "frame-pointers")]
    pub unwinding: Unwinding,

    /// Record thread state slices
    #[arg(long)]
    pub trace_thread_state: bool,

    /// Do not relay user-API scopes
    #[arg(long)]
    pub no_api: bool,

    /// Function to instrument, as MODULE:FUNCTION[:OFFSET] (repeatable)
    #[arg(
        short,
        long = "instrument",
        value_name = "SPEC",
        value_parser = parse_instrumented_function
    )]
    pub instrument: Vec<InstrumentedFunction>,

    /// Milliseconds to wait for producers to flush after stop
    #[arg(long, default_value = "10000")]
    pub max_wait_ms: u64,

    /// Events per producer batch
    #[arg(long, default_value = "4096")]
    pub batch_size: usize,

    /// Producer flush interval in milliseconds
    #[arg(long, default_value = "20")]
    pub flush_interval_ms: u64,

    /// Majority-start filter threshold as NUM/DEN (more than one half)
    #[arg(long, default_value = "2/3", value_parser = parse_fraction)]
    pub supermajority: (u32, u32),

    /// Write the capture summary as JSON
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

/// `MODULE:FUNCTION[:OFFSET]`, offset in hex (`0x` optional) or decimal.
/// Function ids are assigned later, in argument order.
fn parse_instrumented_function(text: &str) -> Result<InstrumentedFunction, String> {
    let mut parts = text.rsplitn(3, ':').collect::<Vec<_>>();
    parts.reverse();

    let (file_path, function_name, file_offset) = match parts.as_slice() {
        [module, function, offset] if parse_offset(offset).is_some() => {
            (module.to_string(), function.to_string(), parse_offset(offset).unwrap_or(0))
        }
        [module_head, module_tail, function] => {
            (format!("{module_head}:{module_tail}"), function.to_string(), 0)
        }
        [module, function] => (module.to_string(), function.to_string(), 0),
        _ => return Err(format!("expected MODULE:FUNCTION[:OFFSET], got '{text}'")),
    };
    if file_path.is_empty() || function_name.is_empty() {
        return Err(format!("expected MODULE:FUNCTION[:OFFSET], got '{text}'"));
    }
    Ok(InstrumentedFunction { function_id: 0, file_path, file_offset, function_name })
}

fn parse_offset(text: &str) -> Option<u64> {
    match text.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_fraction(text: &str) -> Result<(u32, u32), String> {
    let (num, den) = text.split_once('/').ok_or_else(|| format!("expected NUM/DEN, got '{text}'"))?;
    let num = num.trim().parse().map_err(|e| format!("bad numerator: {e}"))?;
    let den = den.trim().parse().map_err(|e| format!("bad denominator: {e}"))?;
    Ok((num, den))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_function_with_offset() {
        let f = parse_instrumented_function("/usr/lib/libc.so.6:read:0x10a0").unwrap();
        assert_eq!(f.file_path, "/usr/lib/libc.so.6");
        assert_eq!(f.function_name, "read");
        assert_eq!(f.file_offset, 0x10a0);
    }

    #[test]
    fn test_parse_function_without_offset() {
        let f = parse_instrumented_function("/opt/game/bin/game:update").unwrap();
        assert_eq!(f.file_path, "/opt/game/bin/game");
        assert_eq!(f.function_name, "update");
        assert_eq!(f.file_offset, 0);
    }

    #[test]
    fn test_parse_function_rejects_missing_name() {
        assert!(parse_instrumented_function("/opt/game/bin/game").is_err());
        assert!(parse_instrumented_function("/opt/game:").is_err());
    }

    #[test]
    fn test_parse_fraction() {
        assert_eq!(parse_fraction("3/4").unwrap(), (3, 4));
        assert!(parse_fraction("3").is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "trawl",
            "--pid",
            "42",
            "-i",
            "/lib/libc.so.6:write",
            "--unwinding",
            "dwarf",
            "--supermajority",
            "3/4",
        ])
        .unwrap();
        assert_eq!(args.pid, Some(42));
        assert_eq!(args.instrument.len(), 1);
        assert_eq!(args.unwinding, Unwinding::Dwarf);
        assert_eq!(args.supermajority, (3, 4));
        assert!(!args.no_api);
    }
}
