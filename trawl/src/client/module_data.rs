//! Per-module metadata and symbol index.
//!
//! Identity of a module is its file path. When a new [`ModuleInfo`] arrives
//! for the same path:
//!
//! - identical record → nothing changes
//! - same non-empty build id → metadata refreshed, symbols kept
//! - anything else differs → metadata replaced, symbols invalidated
//!
//! Symbols can be loaded once per metadata generation.

use log::warn;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use trawl_common::ModuleInfo;

use super::function_info::{FunctionInfo, SymbolInfo};
use crate::clock::lock;
use crate::domain::ModuleDataError;

/// Outcome of [`ModuleData::update_if_changed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleUpdate {
    Unchanged,
    /// Metadata refreshed; symbols (if any) are still valid.
    Updated,
    /// Metadata replaced and previously loaded symbols dropped.
    UpdatedAndUnloaded,
}

struct Inner {
    info: ModuleInfo,
    is_loaded: bool,
    functions: BTreeMap<u64, Arc<FunctionInfo>>,
    by_hash: HashMap<u64, Arc<FunctionInfo>>,
}

pub struct ModuleData {
    inner: Mutex<Inner>,
}

impl ModuleData {
    #[must_use]
    pub fn new(info: ModuleInfo) -> Self {
        Self {
            inner: Mutex::new(Inner {
                info,
                is_loaded: false,
                functions: BTreeMap::new(),
                by_hash: HashMap::new(),
            }),
        }
    }

    #[must_use]
    pub fn info(&self) -> ModuleInfo {
        lock(&self.inner).info.clone()
    }

    #[must_use]
    pub fn file_path(&self) -> String {
        lock(&self.inner).info.file_path.clone()
    }

    #[must_use]
    pub fn load_bias(&self) -> u64 {
        lock(&self.inner).info.load_bias
    }

    #[must_use]
    pub fn is_loaded(&self) -> bool {
        lock(&self.inner).is_loaded
    }

    #[must_use]
    pub fn symbol_count(&self) -> usize {
        lock(&self.inner).functions.len()
    }

    pub fn update_if_changed(&self, info: ModuleInfo) -> ModuleUpdate {
        let mut inner = lock(&self.inner);
        if inner.info == info {
            return ModuleUpdate::Unchanged;
        }

        if !info.build_id.is_empty() && info.build_id == inner.info.build_id {
            inner.info = info;
            return ModuleUpdate::Updated;
        }

        let was_loaded = inner.is_loaded;
        inner.info = info;
        inner.is_loaded = false;
        inner.functions.clear();
        inner.by_hash.clear();
        if was_loaded {
            ModuleUpdate::UpdatedAndUnloaded
        } else {
            ModuleUpdate::Updated
        }
    }

    /// Ingest the module's symbols. On duplicate addresses the first symbol
    /// wins.
    ///
    /// # Errors
    /// [`ModuleDataError::SymbolsAlreadyLoaded`] on a second call for the same
    /// metadata.
    pub fn add_symbols(&self, symbols: Vec<SymbolInfo>) -> Result<(), ModuleDataError> {
        let mut inner = lock(&self.inner);
        if inner.is_loaded {
            return Err(ModuleDataError::SymbolsAlreadyLoaded(inner.info.file_path.clone()));
        }

        let path = inner.info.file_path.clone();
        let build_id = inner.info.build_id.clone();
        let mut duplicates = 0usize;
        for symbol in symbols {
            let function = Arc::new(FunctionInfo::from_symbol(symbol, &path, &build_id));
            if inner.functions.contains_key(&function.address) {
                duplicates += 1;
                continue;
            }
            inner.by_hash.insert(function.hash(), Arc::clone(&function));
            inner.functions.insert(function.address, function);
        }
        if duplicates > 0 {
            warn!("{duplicates} symbols of {path} share an address with an earlier symbol");
        }
        inner.is_loaded = true;
        Ok(())
    }

    /// Function at `elf_address`. Without `exact`, the closest function
    /// starting at or before the address is returned if the address lies
    /// within it.
    #[must_use]
    pub fn find_function_by_elf_address(
        &self,
        elf_address: u64,
        exact: bool,
    ) -> Option<Arc<FunctionInfo>> {
        let inner = lock(&self.inner);
        if exact {
            return inner.functions.get(&elf_address).cloned();
        }
        let (_, function) = inner.functions.range(..=elf_address).next_back()?;
        function.contains(elf_address).then(|| Arc::clone(function))
    }

    #[must_use]
    pub fn find_function_from_hash(&self, hash: u64) -> Option<Arc<FunctionInfo>> {
        lock(&self.inner).by_hash.get(&hash).cloned()
    }
}
