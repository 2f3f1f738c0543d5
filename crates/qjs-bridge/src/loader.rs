//! Module Resolution Bridge
//!
//! The engine asks the host for module names and module contents through
//! one [`ModuleLoader`] per context. Loaders work either with source text
//! or with precompiled bytecode.

use crate::bridge::Bridge;
use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Error, Module, Runtime};
use std::cell::RefCell;
use std::fs;
use std::path::PathBuf;
use std::rc::{Rc, Weak};

/// Host side of ES module loading
pub trait ModuleLoader {
    /// Whether [`module_bytecode`](Self::module_bytecode) is used instead of
    /// [`module_source`](Self::module_source)
    fn is_bytecode_mode(&self) -> bool {
        false
    }

    /// Resolve `name` imported from module `base`; `None` fails the import
    fn normalize(&self, base: &str, name: &str) -> Option<String> {
        Some(normalize_module_name(base, name))
    }

    fn module_source(&self, name: &str) -> Option<String>;

    /// Bytecode produced by [`JsContext::compile`](crate::JsContext::compile)
    /// with the same engine build
    fn module_bytecode(&self, _name: &str) -> Option<Vec<u8>> {
        None
    }
}

/// Join a relative specifier onto the directory of `base`
///
/// Names not starting with `./` or `../` are returned unchanged.
pub fn normalize_module_name(base: &str, name: &str) -> String {
    if !name.starts_with("./") && !name.starts_with("../") {
        return name.to_string();
    }

    let mut parts: Vec<&str> = match base.rfind('/') {
        Some(i) => base[..i].split('/').collect(),
        None => Vec::new(),
    };
    for segment in name.split('/') {
        match segment {
            "." | "" => {}
            ".." => {
                if parts.last().is_some_and(|p| !p.is_empty() && *p != "..") {
                    parts.pop();
                } else {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Loader reading modules from a directory
#[derive(Debug, Clone)]
pub struct FileModuleLoader {
    root: PathBuf,
    bytecode: bool,
}

impl FileModuleLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), bytecode: false }
    }

    /// Read files as compiled bytecode instead of source
    pub fn with_bytecode(mut self, bytecode: bool) -> Self {
        self.bytecode = bytecode;
        self
    }
}

impl ModuleLoader for FileModuleLoader {
    fn is_bytecode_mode(&self) -> bool {
        self.bytecode
    }

    fn module_source(&self, name: &str) -> Option<String> {
        let path = self.root.join(name);
        fs::read_to_string(&path)
            .map_err(|e| tracing::warn!("cannot read module {}: {}", path.display(), e))
            .ok()
    }

    fn module_bytecode(&self, name: &str) -> Option<Vec<u8>> {
        let path = self.root.join(name);
        fs::read(&path)
            .map_err(|e| tracing::warn!("cannot read module {}: {}", path.display(), e))
            .ok()
    }
}

/// Per-context loader slot plus the failures of the current evaluation
#[derive(Default)]
pub(crate) struct LoaderBinding {
    loader: RefCell<Option<Rc<dyn ModuleLoader>>>,
    failures: RefCell<Vec<String>>,
}

impl LoaderBinding {
    pub fn set(&self, loader: Option<Rc<dyn ModuleLoader>>) {
        let previous = self.loader.replace(loader);
        drop(previous);
    }

    pub fn current(&self) -> Option<Rc<dyn ModuleLoader>> {
        self.loader.borrow().clone()
    }

    fn record_failure(&self, name: &str) {
        self.failures.borrow_mut().push(name.to_string());
    }

    /// Failures recorded since the last call
    pub fn take_failures(&self) -> Vec<String> {
        self.failures.take()
    }

    pub fn clear(&self) {
        self.set(None);
        self.failures.borrow_mut().clear();
    }
}

/// Route the engine's module hooks of `runtime` to `bridge`
pub(crate) fn install(runtime: &Runtime, bridge: &Rc<Bridge>) {
    let bridge = Rc::downgrade(bridge);
    runtime.set_loader(
        BridgeResolver { bridge: bridge.clone() },
        BridgeLoader { bridge },
    );
}

/// Live bridge and its loader; a missing loader counts as a load failure
fn loader_of(bridge: &Weak<Bridge>, name: &str) -> Option<(Rc<Bridge>, Rc<dyn ModuleLoader>)> {
    let bridge = bridge.upgrade().filter(|b| b.is_alive())?;
    match bridge.loader.current() {
        Some(loader) => Some((bridge, loader)),
        None => {
            bridge.loader.record_failure(name);
            None
        }
    }
}

struct BridgeResolver {
    bridge: Weak<Bridge>,
}

impl Resolver for BridgeResolver {
    fn resolve<'js>(&mut self, _ctx: &Ctx<'js>, base: &str, name: &str) -> rquickjs::Result<String> {
        let Some((bridge, loader)) = loader_of(&self.bridge, name) else {
            return Err(Error::new_resolving_message(base, name, "no module loader installed"));
        };
        match loader.normalize(base, name) {
            Some(resolved) => {
                tracing::trace!(base, name, %resolved, "module name resolved");
                Ok(resolved)
            }
            None => {
                bridge.loader.record_failure(name);
                Err(Error::new_resolving_message(base, name, "module name normalization failed"))
            }
        }
    }
}

struct BridgeLoader {
    bridge: Weak<Bridge>,
}

impl Loader for BridgeLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let Some((bridge, loader)) = loader_of(&self.bridge, name) else {
            return Err(Error::new_loading_message(name, "no module loader installed"));
        };

        let module = if loader.is_bytecode_mode() {
            // SAFETY: bytecode handed out by a loader must come from
            // `JsContext::compile` on the same engine build
            loader
                .module_bytecode(name)
                .map(|bytes| unsafe { Module::load(ctx.clone(), &bytes) })
        } else {
            loader
                .module_source(name)
                .map(|source| Module::declare(ctx.clone(), name, source))
        };

        match module {
            Some(Ok(module)) => {
                tracing::debug!(name, "module loaded");
                Ok(module)
            }
            Some(Err(err)) => {
                bridge.loader.record_failure(name);
                Err(err)
            }
            None => {
                bridge.loader.record_failure(name);
                Err(Error::new_loading_message(name, "module loader returned nothing"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_relative() {
        assert_eq!(normalize_module_name("main.js", "./util.js"), "util.js");
        assert_eq!(normalize_module_name("lib/main.js", "./util.js"), "lib/util.js");
        assert_eq!(normalize_module_name("lib/deep/main.js", "../util.js"), "lib/util.js");
        assert_eq!(normalize_module_name("main.js", "../util.js"), "../util.js");
    }

    #[test]
    fn test_normalize_bare() {
        assert_eq!(normalize_module_name("lib/main.js", "std"), "std");
        assert_eq!(normalize_module_name("lib/main.js", "pkg/index.js"), "pkg/index.js");
    }

    #[test]
    fn test_binding_failures() {
        let binding = LoaderBinding::default();
        binding.record_failure("a.js");
        binding.record_failure("b.js");
        assert_eq!(binding.take_failures(), vec!["a.js", "b.js"]);
        assert!(binding.take_failures().is_empty());
    }

    #[test]
    fn test_file_loader_missing_file() {
        let loader = FileModuleLoader::new(std::env::temp_dir());
        assert!(loader.module_source("qjs-bridge-no-such-module.js").is_none());
        assert!(!loader.is_bytecode_mode());
        assert!(loader.with_bytecode(true).is_bytecode_mode());
    }
}
