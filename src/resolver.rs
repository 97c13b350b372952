//! The resolver owning all loaded modules.

use std::collections::BTreeMap;
use std::path::Path;

use log::{error, info, warn};

use crate::cache::{ModuleCache, NoCache};
use crate::lookup::StackFrame;
use crate::module::{Module, StackFrameInfo};
use crate::serialize;

/// Resolves stack frames against the symbol files loaded into it.
///
/// The resolver is synchronous and single-threaded by contract: loading
/// mutates the module map and must not be interleaved with lookups, which
/// the `&mut self` / `&self` split enforces within a thread. A module is
/// immutable from the moment [`load_module`](Resolver::load_module)
/// returns, so any number of lookups may then read it.
///
/// With a [`ModuleCache`] attached, loads first consult the cache and
/// fall back to parsing the text symbol file, writing the parsed index
/// back into the cache for the next run.
#[derive(Debug)]
pub struct Resolver<C: ModuleCache = NoCache> {
    modules: BTreeMap<String, Module>,
    cache: Option<C>,
}

impl Resolver<NoCache> {
    /// Creates a resolver without a module cache.
    pub fn new() -> Self {
        Resolver {
            modules: BTreeMap::new(),
            cache: None,
        }
    }
}

impl Default for Resolver<NoCache> {
    fn default() -> Self {
        Resolver::new()
    }
}

impl<C: ModuleCache> Resolver<C> {
    /// Creates a resolver that reads and writes serialized modules
    /// through `cache`.
    pub fn with_cache(cache: C) -> Self {
        Resolver {
            modules: BTreeMap::new(),
            cache: Some(cache),
        }
    }

    /// Loads the symbol file at `symbol_file` under `module_name`.
    ///
    /// Returns `false` when a module of that name is already loaded or
    /// when neither the cache nor the text file yields a usable module;
    /// details go to the log.
    pub fn load_module(&mut self, module_name: &str, symbol_file: &Path) -> bool {
        if self.modules.contains_key(module_name) {
            info!("symbols for module {module_name} already loaded");
            return false;
        }
        info!(
            "loading symbols for module {module_name} from {}",
            symbol_file.display()
        );

        if let Some(module) = self.load_from_cache(module_name, symbol_file) {
            self.modules.insert(module_name.to_owned(), module);
            return true;
        }

        let module = match Module::load_map(module_name, symbol_file) {
            Ok(module) => module,
            Err(err) => {
                error!("failed to load {}: {err}", symbol_file.display());
                return false;
            }
        };
        self.store_in_cache(symbol_file, &module);

        self.modules.insert(module_name.to_owned(), module);
        true
    }

    /// Whether symbols for `module_name` are loaded.
    pub fn has_module(&self, module_name: &str) -> bool {
        self.modules.contains_key(module_name)
    }

    /// Annotates `frame` with symbol data from the module identified by
    /// its [`CodeModule`](crate::CodeModule) descriptor.
    ///
    /// Returns the stack frame layout record for the frame's address, if
    /// one is known. Never fails: a frame without a module, or with a
    /// module that is not loaded, is simply left untouched.
    pub fn fill_source_line_info(&self, frame: &mut StackFrame) -> Option<StackFrameInfo> {
        let module = self.modules.get(&frame.module.as_ref()?.code_file)?;
        module.lookup_address(frame)
    }

    fn load_from_cache(&self, module_name: &str, symbol_file: &Path) -> Option<Module> {
        let cache = self.cache.as_ref()?;
        let mut stream = cache.get_module_data(symbol_file)?;
        match serialize::deserialize(&mut stream, module_name) {
            Ok(module) => Some(module),
            Err(err) => {
                // Stale or corrupt entries degrade to a miss; the text
                // file below overwrites them.
                warn!(
                    "discarding cache entry for {}: {err}",
                    symbol_file.display()
                );
                None
            }
        }
    }

    fn store_in_cache(&self, symbol_file: &Path, module: &Module) {
        let cache = match self.cache.as_ref() {
            Some(cache) => cache,
            None => return,
        };
        let mut stream = match cache.begin_set_module_data(symbol_file) {
            Some(stream) => stream,
            None => return,
        };
        match serialize::serialize(module, &mut stream) {
            Ok(()) => {
                if !cache.end_set_module_data(symbol_file, stream) {
                    warn!(
                        "failed to commit cache entry for {}",
                        symbol_file.display()
                    );
                }
            }
            // The uncommitted stream is dropped and leaves no entry.
            Err(err) => warn!(
                "failed to serialize cache entry for {}: {err}",
                symbol_file.display()
            ),
        }
    }
}
