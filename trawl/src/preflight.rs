//! Pre-flight checks for the `trawl` binary
//!
//! Validates the target and the requested instrumentation before a capture
//! starts, with actionable error messages.

use anyhow::{bail, Context, Result};
use object::{Object, ObjectSection};
use std::path::Path;
use trawl_common::InstrumentedFunction;

/// Run all pre-flight checks for a capture of `pid`
///
/// # Errors
/// The first failing check.
pub fn run_preflight_checks(
    pid: i32,
    functions: &[InstrumentedFunction],
    socket: Option<&Path>,
    quiet: bool,
) -> Result<()> {
    check_process_exists(pid)?;
    check_proc_access(pid)?;
    check_instrumentation_reachable(pid, functions, socket)?;
    for function in functions {
        check_module_exists(&function.file_path)?;
        check_module_symbols(&function.file_path, quiet)?;
    }
    if let Some(socket) = socket {
        check_socket_path(socket)?;
    }
    Ok(())
}

/// Check if the target process exists
///
/// # Errors
/// `/proc/<pid>` is missing.
pub fn check_process_exists(pid: i32) -> Result<()> {
    let proc_path = format!("/proc/{pid}");
    if !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {pid}"
        );
    }
    Ok(())
}

/// Check if we can read the process's memory maps
///
/// # Errors
/// `/proc/<pid>/maps` is unreadable.
pub fn check_proc_access(pid: i32) -> Result<()> {
    let maps_path = format!("/proc/{pid}/maps");
    std::fs::read_to_string(&maps_path).with_context(|| {
        format!(
            "Cannot read {maps_path}\n\n\
             This usually means:\n\
             - The process doesn't exist (check: ps -p {pid})\n\
             - Permission denied (run as the target's user or with sudo)\n\
             - /proc is not mounted"
        )
    })?;
    Ok(())
}

/// True if `pid` is this process. The in-process user-API relay and the
/// software probe backend only observe code running in this process.
#[must_use]
pub fn targets_own_process(pid: i32) -> bool {
    i32::try_from(std::process::id()).is_ok_and(|own| own == pid)
}

/// Instrumenting another process needs a producer running inside it, which
/// can only connect over `--socket`.
///
/// # Errors
/// Functions to instrument in a foreign process with no socket to serve them.
pub fn check_instrumentation_reachable(
    pid: i32,
    functions: &[InstrumentedFunction],
    socket: Option<&Path>,
) -> Result<()> {
    if functions.is_empty() || socket.is_some() || targets_own_process(pid) {
        return Ok(());
    }
    bail!(
        "Cannot instrument functions of PID {pid} without a producer inside it.\n\n\
         trawl's own probes only fire in the trawl process. Start with\n  \
         trawl --pid {pid} --socket /tmp/trawl.sock -i ...\n\
         and connect a producer running in the target to that socket."
    );
}

/// Check that a module named by `--instrument` is a file
fn check_module_exists(module_path: &str) -> Result<()> {
    let path = Path::new(module_path);
    if !path.exists() {
        bail!(
            "Module not found: {module_path}\n\n\
             --instrument expects MODULE:FUNCTION[:OFFSET] with MODULE an absolute path."
        );
    }
    if !path.is_file() {
        bail!("Not a file: {module_path}");
    }
    Ok(())
}

/// Warn when a module to instrument has no symbol table
fn check_module_symbols(module_path: &str, quiet: bool) -> Result<()> {
    if quiet {
        return Ok(());
    }

    let file_data = std::fs::read(module_path)
        .with_context(|| format!("Failed to read module: {module_path}"))?;

    let Ok(obj) = object::File::parse(&*file_data) else {
        // Not an object file, the probe backend reports it
        return Ok(());
    };

    let has_symtab = obj.section_by_name(".symtab").is_some_and(|s| s.size() > 0);
    let has_dynsym = obj.section_by_name(".dynsym").is_some_and(|s| s.size() > 0);

    if !has_symtab && !has_dynsym {
        eprintln!(
            "warning: {module_path} has no symbols, function offsets must be given explicitly"
        );
    }
    Ok(())
}

/// Check that the producer socket can be created
fn check_socket_path(socket: &Path) -> Result<()> {
    if socket.exists() {
        bail!(
            "Socket path already exists: {}\n\n\
             Remove the stale socket or choose another --socket path.",
            socket.display()
        );
    }
    match socket.parent() {
        Some(dir) if !dir.as_os_str().is_empty() && !dir.is_dir() => {
            bail!("Socket directory does not exist: {}", dir.display())
        }
        _ => Ok(()),
    }
}
