//! Per-sampler caches of remote data
//!
//! Function descriptors that cannot change (internal functions, immutable op
//! arrays) and permanent strings are cached by remote address for the life
//! of a sampler, so hot frames cost one remote read instead of several.

use stat_shared::StringRef;
use std::collections::HashMap;

/// The parts of a remote function descriptor the sampler uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionInfo {
    pub user: bool,
    pub name: u64,
    pub scope: u64,
    pub opcodes: u64,
    pub filename: u64,
}

/// Remote address caches
pub struct SamplerCache {
    /// Cache of immutable functions: remote address -> descriptor
    functions: HashMap<u64, FunctionInfo>,

    /// Cache of permanent strings: remote address -> interned copy
    strings: HashMap<u64, StringRef>,
}

impl SamplerCache {
    pub fn new() -> Self {
        Self {
            functions: HashMap::with_capacity(32),
            strings: HashMap::with_capacity(32),
        }
    }

    pub fn function(&self, address: u64) -> Option<FunctionInfo> {
        self.functions.get(&address).copied()
    }

    pub fn insert_function(&mut self, address: u64, info: FunctionInfo) {
        self.functions.insert(address, info);
    }

    pub fn string(&self, address: u64) -> Option<StringRef> {
        self.strings.get(&address).copied()
    }

    pub fn insert_string(&mut self, address: u64, string: StringRef) {
        self.strings.insert(address, string);
    }

    /// Number of cached functions and strings
    pub fn cache_size(&self) -> (usize, usize) {
        (self.functions.len(), self.strings.len())
    }
}

impl Default for SamplerCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_cache() {
        let mut cache = SamplerCache::new();
        let info = FunctionInfo {
            user: true,
            name: 0x10,
            scope: 0,
            opcodes: 0x20,
            filename: 0x30,
        };

        assert!(cache.function(0x1000).is_none());
        cache.insert_function(0x1000, info);
        assert_eq!(cache.function(0x1000), Some(info));
        assert_eq!(cache.cache_size(), (1, 0));
    }
}
