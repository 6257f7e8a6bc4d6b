//! Address-space view of the target process: which module is mapped where.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use trawl_common::ModuleInfo;

use crate::clock::lock;
use crate::domain::{Pid, ProcessDataError};

/// One mapping of a module, `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModuleInMemory {
    pub start: u64,
    pub end: u64,
    pub file_path: String,
    pub build_id: String,
}

impl ModuleInMemory {
    #[must_use]
    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    fn intersects(&self, start: u64, end: u64) -> bool {
        self.start < end && start < self.end
    }
}

impl From<&ModuleInfo> for ModuleInMemory {
    fn from(info: &ModuleInfo) -> Self {
        Self {
            start: info.address_start,
            end: info.address_end,
            file_path: info.file_path.clone(),
            build_id: info.build_id.clone(),
        }
    }
}

pub struct ProcessData {
    pid: Pid,
    name: String,
    /// Keyed by start address.
    modules: Mutex<BTreeMap<u64, ModuleInMemory>>,
}

impl ProcessData {
    #[must_use]
    pub fn new(pid: Pid, name: impl Into<String>) -> Self {
        Self { pid, name: name.into(), modules: Mutex::new(BTreeMap::new()) }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace every mapping with `infos`.
    pub fn update_module_infos(&self, infos: &[ModuleInfo]) {
        let mut modules = lock(&self.modules);
        modules.clear();
        for info in infos {
            modules.insert(info.address_start, ModuleInMemory::from(info));
        }
    }

    /// Insert one mapping, evicting every mapping it overlaps.
    pub fn add_or_update_module_info(&self, info: &ModuleInfo) {
        let mut modules = lock(&self.modules);
        modules.retain(|_, module| !module.intersects(info.address_start, info.address_end));
        modules.insert(info.address_start, ModuleInMemory::from(info));
    }

    /// # Errors
    /// [`ProcessDataError`] when nothing is loaded or no mapping covers the
    /// address.
    pub fn find_module_by_address(&self, address: u64) -> Result<ModuleInMemory, ProcessDataError> {
        let modules = lock(&self.modules);
        if modules.is_empty() {
            return Err(ProcessDataError::NoModulesLoaded { address });
        }
        modules
            .range(..=address)
            .next_back()
            .map(|(_, module)| module)
            .filter(|module| module.contains(address))
            .cloned()
            .ok_or(ProcessDataError::NoModuleAtAddress { address })
    }

    #[must_use]
    pub fn is_module_loaded_by_process(&self, file_path: &str) -> bool {
        lock(&self.modules).values().any(|module| module.file_path == file_path)
    }

    /// Start addresses of every mapping of `file_path`, ascending.
    #[must_use]
    pub fn module_base_addresses(&self, file_path: &str) -> Vec<u64> {
        lock(&self.modules)
            .values()
            .filter(|module| module.file_path == file_path)
            .map(|module| module.start)
            .collect()
    }

    #[must_use]
    pub fn modules(&self) -> Vec<ModuleInMemory> {
        lock(&self.modules).values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(path: &str, start: u64, end: u64) -> ModuleInfo {
        ModuleInfo {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            file_path: path.to_string(),
            file_size: 0,
            address_start: start,
            address_end: end,
            build_id: String::new(),
            load_bias: 0,
        }
    }

    #[test]
    fn test_find_module_errors() {
        let process = ProcessData::new(Pid(1), "app");
        assert_eq!(
            process.find_module_by_address(0x10),
            Err(ProcessDataError::NoModulesLoaded { address: 0x10 })
        );

        process.update_module_infos(&[info("/bin/app", 0x1000, 0x2000)]);
        assert_eq!(
            process.find_module_by_address(0x2000),
            Err(ProcessDataError::NoModuleAtAddress { address: 0x2000 })
        );
        assert_eq!(
            process.find_module_by_address(0x0fff),
            Err(ProcessDataError::NoModuleAtAddress { address: 0x0fff })
        );
        assert_eq!(process.find_module_by_address(0x1fff).unwrap().file_path, "/bin/app");
    }

    #[test]
    fn test_add_or_update_evicts_overlaps() {
        let process = ProcessData::new(Pid(1), "app");
        process.update_module_infos(&[
            info("/lib/a.so", 0x1000, 0x2000),
            info("/lib/b.so", 0x2000, 0x3000),
            info("/lib/c.so", 0x4000, 0x5000),
        ]);
        process.add_or_update_module_info(&info("/lib/d.so", 0x1800, 0x2800));

        let paths: Vec<String> = process.modules().into_iter().map(|m| m.file_path).collect();
        assert_eq!(paths, vec!["/lib/d.so", "/lib/c.so"]);
        assert!(!process.is_module_loaded_by_process("/lib/a.so"));
    }

    #[test]
    fn test_module_base_addresses() {
        let process = ProcessData::new(Pid(1), "app");
        process.update_module_infos(&[
            info("/lib/a.so", 0x5000, 0x6000),
            info("/lib/a.so", 0x1000, 0x2000),
            info("/lib/b.so", 0x3000, 0x4000),
        ]);
        assert_eq!(process.module_base_addresses("/lib/a.so"), vec![0x1000, 0x5000]);
        assert!(process.is_module_loaded_by_process("/lib/b.so"));
    }
}
