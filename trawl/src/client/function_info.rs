//! Post-parse symbol records and user-API stub detection.

use rustc_demangle::try_demangle;
use serde::Serialize;

/// Role of a function in the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionKind {
    Normal,
    TimerStart,
    TimerStop,
    TimerStartAsync,
    TimerStopAsync,
    TrackValue,
}

/// Closed table of user-API entry points, matched on the demangled,
/// namespace-qualified name without its argument list.
const API_STUBS: &[(&str, FunctionKind)] = &[
    ("trawl_api::start", FunctionKind::TimerStart),
    ("trawl_api::stop", FunctionKind::TimerStop),
    ("trawl_api::start_async", FunctionKind::TimerStartAsync),
    ("trawl_api::stop_async", FunctionKind::TimerStopAsync),
    ("trawl_api::track_value", FunctionKind::TrackValue),
];

/// A symbol as delivered by the external symbol parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    /// May be empty; the mangled name is demangled on ingestion then.
    pub demangled_name: String,
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FunctionInfo {
    pub pretty_name: String,
    pub name: String,
    pub address: u64,
    pub size: u64,
    pub module_path: String,
    pub module_build_id: String,
    pub kind: FunctionKind,
}

impl FunctionInfo {
    #[must_use]
    pub fn from_symbol(symbol: SymbolInfo, module_path: &str, module_build_id: &str) -> Self {
        let pretty_name = if symbol.demangled_name.is_empty() {
            demangle(&symbol.name)
        } else {
            symbol.demangled_name
        };
        let kind = detect_kind(&pretty_name);
        Self {
            pretty_name,
            name: symbol.name,
            address: symbol.address,
            size: symbol.size,
            module_path: module_path.to_string(),
            module_build_id: module_build_id.to_string(),
            kind,
        }
    }

    /// Whether `elf_address` falls inside this function (end inclusive).
    #[must_use]
    pub fn contains(&self, elf_address: u64) -> bool {
        self.address <= elf_address && elf_address <= self.address.saturating_add(self.size)
    }

    /// Stable identity of the function across captures.
    #[must_use]
    pub fn hash(&self) -> u64 {
        function_hash(&self.module_path, &self.name)
    }
}

/// FNV-1a over `module_path`, a separator byte, then `mangled_name`.
#[must_use]
pub fn function_hash(module_path: &str, mangled_name: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    module_path
        .bytes()
        .chain(std::iter::once(0))
        .chain(mangled_name.bytes())
        .fold(OFFSET_BASIS, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

/// Demangle a Rust symbol, dropping the trailing hash. Anything that is not a
/// Rust symbol is returned unchanged.
#[must_use]
pub fn demangle(mangled: &str) -> String {
    match try_demangle(mangled) {
        Ok(demangled) => format!("{demangled:#}"),
        Err(_) => mangled.to_string(),
    }
}

#[must_use]
pub fn detect_kind(pretty_name: &str) -> FunctionKind {
    let without_args = pretty_name.split('(').next().unwrap_or(pretty_name).trim();
    API_STUBS
        .iter()
        .find(|(stub, _)| *stub == without_args)
        .map_or(FunctionKind::Normal, |&(_, kind)| kind)
}
