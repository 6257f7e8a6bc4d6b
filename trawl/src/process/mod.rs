//! Target process inspection through `/proc`.

pub mod modules;
pub mod process_list_manager;
pub mod snapshot_producer;

pub use modules::{
    modules_from_maps, parse_maps, parse_maps_line, read_elf_identity, read_modules, MapEntry,
};
pub use process_list_manager::{
    find_process_by_name, list_processes, read_process, ProcessInfo, ProcessListManager,
    DEFAULT_REFRESH_PERIOD,
};
pub use snapshot_producer::{read_thread_names, ProcessSnapshotProducer};
