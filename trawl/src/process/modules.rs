//! Loaded-module discovery from `/proc/<pid>/maps`.
//!
//! Every file with at least one executable mapping becomes a [`ModuleInfo`]
//! spanning all of that file's mappings (minimum start to maximum end). Build
//! id and load bias come from the file's ELF headers; both are left empty when
//! the file cannot be read or is not ELF.

use log::{debug, info};
use object::{Object, ObjectSegment};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use trawl_common::ModuleInfo;

use crate::domain::{Pid, ProcessError};

const PAGE_SIZE: u64 = 4096;

/// One line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub executable: bool,
    pub offset: u64,
    pub path: String,
}

impl MapEntry {
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

/// Parse one maps line: `start-end perms offset dev inode [pathname]`.
#[must_use]
pub fn parse_maps_line(line: &str) -> Option<MapEntry> {
    let mut fields = line.split_whitespace();
    let (start, end) = fields.next()?.split_once('-')?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.collect::<Vec<_>>().join(" ");

    Some(MapEntry {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        executable: perms.as_bytes().get(2) == Some(&b'x'),
        offset: u64::from_str_radix(offset, 16).ok()?,
        path,
    })
}

/// # Errors
/// [`ProcessError::MemoryMapsParseFailed`] on the first malformed line.
pub fn parse_maps(pid: Pid, content: &str) -> Result<Vec<MapEntry>, ProcessError> {
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| parse_maps_line(line).ok_or(ProcessError::MemoryMapsParseFailed(pid)))
        .collect()
}

/// Group file-backed mappings into modules.
#[must_use]
pub fn modules_from_maps(entries: &[MapEntry]) -> Vec<ModuleInfo> {
    struct Span {
        start: u64,
        end: u64,
        executable: bool,
    }

    let mut spans: BTreeMap<&str, Span> = BTreeMap::new();
    for entry in entries {
        // Pseudo mappings ([heap], [vdso], anonymous) and deleted files
        if !entry.path.starts_with('/') || entry.path.ends_with(" (deleted)") {
            continue;
        }
        spans
            .entry(entry.path.as_str())
            .and_modify(|span| {
                span.start = span.start.min(entry.start);
                span.end = span.end.max(entry.end);
                span.executable |= entry.executable;
            })
            .or_insert(Span { start: entry.start, end: entry.end, executable: entry.executable });
    }

    spans
        .into_iter()
        .filter(|(_, span)| span.executable)
        .map(|(path, span)| {
            let (build_id, load_bias) = read_elf_identity(Path::new(path));
            ModuleInfo {
                name: Path::new(path)
                    .file_name()
                    .map_or_else(|| path.to_string(), |n| n.to_string_lossy().into_owned()),
                file_path: path.to_string(),
                file_size: fs::metadata(path).map(|m| m.len()).unwrap_or(0),
                address_start: span.start,
                address_end: span.end,
                build_id,
                load_bias,
            }
        })
        .collect()
}

/// Modules currently mapped by `pid`.
///
/// # Errors
/// [`ProcessError::ProcessNotFound`] if `/proc/<pid>/maps` does not exist,
/// a parse error for malformed content, or any other I/O error.
pub fn read_modules(pid: Pid) -> Result<Vec<ModuleInfo>, ProcessError> {
    let maps_path = format!("/proc/{}/maps", pid.0);
    let content = fs::read_to_string(&maps_path).map_err(|e| match e.kind() {
        ErrorKind::NotFound => ProcessError::ProcessNotFound(pid),
        _ => ProcessError::Io(e),
    })?;
    let modules = modules_from_maps(&parse_maps(pid, &content)?);
    info!("{pid}: {} modules mapped", modules.len());
    Ok(modules)
}

/// `(build_id, load_bias)` of the ELF file at `path`. The load bias is the
/// page-aligned virtual address of the lowest loadable segment.
#[must_use]
pub fn read_elf_identity(path: &Path) -> (String, u64) {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            debug!("Cannot read {}: {e}", path.display());
            return (String::new(), 0);
        }
    };
    let file = match object::File::parse(&*data) {
        Ok(file) => file,
        Err(e) => {
            debug!("{} is not a loadable object: {e}", path.display());
            return (String::new(), 0);
        }
    };

    let build_id = match file.build_id() {
        Ok(Some(id)) => id.iter().map(|b| format!("{b:02x}")).collect(),
        _ => String::new(),
    };
    let load_bias = file
        .segments()
        .map(|segment| segment.address())
        .min()
        .map_or(0, |vaddr| vaddr & !(PAGE_SIZE - 1));
    (build_id, load_bias)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAPS: &str = "\
55d0c0a00000-55d0c0a20000 r--p 00000000 fd:01 1234 /usr/bin/game
55d0c0a20000-55d0c0b00000 r-xp 00020000 fd:01 1234 /usr/bin/game
55d0c0b00000-55d0c0b10000 rw-p 00100000 fd:01 1234 /usr/bin/game
55d0c1000000-55d0c1021000 rw-p 00000000 00:00 0 [heap]
7f1a00000000-7f1a00020000 r--p 00000000 fd:01 99 /usr/share/fonts/font.ttf
7f1a10000000-7f1a10190000 r-xp 00028000 fd:01 77 /usr/lib/libc.so.6
7f1a20000000-7f1a20001000 r-xp 00000000 fd:01 55 /tmp/old.so (deleted)
7ffd4b1f0000-7ffd4b1f2000 r-xp 00000000 00:00 0 [vdso]
";

    #[test]
    fn test_parse_maps_line() {
        let line = "7f1a10000000-7f1a10190000 r-xp 00028000 fd:01 77 /usr/lib/libc.so.6";
        let entry = parse_maps_line(line).unwrap();
        assert_eq!(entry.start, 0x7f1a_1000_0000);
        assert_eq!(entry.end, 0x7f1a_1019_0000);
        assert_eq!(entry.offset, 0x28000);
        assert!(entry.executable);
        assert_eq!(entry.path, "/usr/lib/libc.so.6");
        assert!(entry.contains(0x7f1a_1000_0000));
        assert!(!entry.contains(0x7f1a_1019_0000));
    }

    #[test]
    fn test_anonymous_mapping_has_empty_path() {
        let entry = parse_maps_line("7f1a00000000-7f1a00001000 rw-p 00000000 00:00 0").unwrap();
        assert!(entry.path.is_empty());
        assert!(!entry.executable);
    }

    #[test]
    fn test_malformed_maps_fail() {
        let err = parse_maps(Pid(3), "not a maps line\n").unwrap_err();
        assert!(matches!(err, ProcessError::MemoryMapsParseFailed(Pid(3))));
    }

    #[test]
    fn test_modules_span_all_mappings_of_executable_files() {
        let modules = modules_from_maps(&parse_maps(Pid(1), MAPS).unwrap());
        let paths: Vec<&str> = modules.iter().map(|m| m.file_path.as_str()).collect();
        assert_eq!(paths, vec!["/usr/bin/game", "/usr/lib/libc.so.6"]);

        let game = &modules[0];
        assert_eq!(game.name, "game");
        assert_eq!(game.address_start, 0x55d0_c0a0_0000);
        assert_eq!(game.address_end, 0x55d0_c0b1_0000);
    }

    #[test]
    fn test_non_elf_file_has_no_identity() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"plain text").unwrap();
        assert_eq!(read_elf_identity(file.path()), (String::new(), 0));
    }

    #[test]
    fn test_read_own_modules() {
        let modules = read_modules(Pid(std::process::id() as i32)).unwrap();
        let exe = std::env::current_exe().unwrap();
        let own = modules.iter().find(|m| Path::new(&m.file_path) == exe);
        if let Some(own) = own {
            assert!(own.address_start < own.address_end);
            assert!(own.file_size > 0);
        }
    }
}
