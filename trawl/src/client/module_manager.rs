//! Process-wide repository of [`ModuleData`], keyed by file path.

use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use trawl_common::ModuleInfo;

use super::function_info::FunctionInfo;
use super::module_data::{ModuleData, ModuleUpdate};
use super::process_data::ProcessData;
use crate::clock::lock;

#[derive(Default)]
pub struct ModuleManager {
    modules: Mutex<HashMap<String, Arc<ModuleData>>>,
}

impl ModuleManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update modules. Returns the paths whose symbols were
    /// invalidated by the update.
    pub fn add_or_update_modules(&self, infos: &[ModuleInfo]) -> Vec<String> {
        let mut modules = lock(&self.modules);
        let mut unloaded = Vec::new();
        for info in infos {
            match modules.get(&info.file_path) {
                Some(existing) => {
                    let update = existing.update_if_changed(info.clone());
                    if update == ModuleUpdate::UpdatedAndUnloaded {
                        info!(
                            "Symbols of {} invalidated (build id {})",
                            info.file_path, info.build_id
                        );
                        unloaded.push(info.file_path.clone());
                    }
                }
                None => {
                    debug!("New module {}", info.file_path);
                    modules.insert(info.file_path.clone(), Arc::new(ModuleData::new(info.clone())));
                }
            }
        }
        unloaded
    }

    #[must_use]
    pub fn module_by_path(&self, file_path: &str) -> Option<Arc<ModuleData>> {
        lock(&self.modules).get(file_path).cloned()
    }

    #[must_use]
    pub fn module_count(&self) -> usize {
        lock(&self.modules).len()
    }

    /// Resolve an absolute address in `process` to a function.
    #[must_use]
    pub fn find_function_by_absolute_address(
        &self,
        process: &ProcessData,
        absolute_address: u64,
    ) -> Option<Arc<FunctionInfo>> {
        let mapping = process.find_module_by_address(absolute_address).ok()?;
        let module = self.module_by_path(&mapping.file_path)?;
        let elf_address = absolute_address - mapping.start + module.load_bias();
        module.find_function_by_elf_address(elf_address, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::function_info::SymbolInfo;
    use crate::domain::Pid;

    fn lib(build_id: &str) -> ModuleInfo {
        ModuleInfo {
            name: "libX".to_string(),
            file_path: "/usr/lib/libX.so".to_string(),
            file_size: 1 << 20,
            address_start: 0x7f00_0000,
            address_end: 0x7f10_0000,
            build_id: build_id.to_string(),
            load_bias: 0x1000,
        }
    }

    #[test]
    fn test_rebuilt_module_reported_as_unloaded() {
        let manager = ModuleManager::new();
        assert!(manager.add_or_update_modules(&[lib("A")]).is_empty());
        let module = manager.module_by_path("/usr/lib/libX.so").unwrap();
        module
            .add_symbols(vec![SymbolInfo {
                name: "f".into(),
                demangled_name: "f".into(),
                address: 0x1100,
                size: 0x10,
            }])
            .unwrap();

        assert!(manager.add_or_update_modules(&[lib("A")]).is_empty());
        assert_eq!(manager.add_or_update_modules(&[lib("B")]), vec!["/usr/lib/libX.so"]);
        assert!(!module.is_loaded());
        assert_eq!(manager.module_count(), 1);
    }

    #[test]
    fn test_absolute_address_uses_load_bias() {
        let manager = ModuleManager::new();
        manager.add_or_update_modules(&[lib("A")]);
        manager
            .module_by_path("/usr/lib/libX.so")
            .unwrap()
            .add_symbols(vec![SymbolInfo {
                name: "f".into(),
                demangled_name: "f".into(),
                address: 0x1100,
                size: 0x10,
            }])
            .unwrap();

        let process = ProcessData::new(Pid(5), "app");
        process.update_module_infos(&[lib("A")]);

        let function = manager.find_function_by_absolute_address(&process, 0x7f00_0105).unwrap();
        assert_eq!(function.name, "f");
        assert!(manager.find_function_by_absolute_address(&process, 0x7f00_0200).is_none());
        assert!(manager.find_function_by_absolute_address(&process, 0x10).is_none());
    }
}
