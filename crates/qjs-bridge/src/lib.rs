//! qjs-bridge
//!
//! Bidirectional bridge between Rust host code and an embedded QuickJS engine.
//!
//! Features:
//! - Value marshalling between engine values and host [`JsValue`]s
//! - Handle registry holding exactly one engine reference per exposed object
//! - Host callbacks callable from JavaScript, finalized by the engine's GC
//! - ES module loading through a host [`ModuleLoader`]
//! - Script/module evaluation, bytecode compile and execute, microtask drain

mod bridge;
mod bytecode;
mod callback;
mod config;
mod console;
mod context;
mod convert;
mod exception;
mod loader;
mod memory;
mod registry;
mod rejection;
mod scope;
mod table;
mod value;

pub use callback::{HostCallback, HostFunction};
pub use config::ContextOptions;
pub use console::{Console, ConsoleLevel, TracingConsole};
pub use context::{JsContext, LeakListener, UNKNOWN_FILE};
pub use convert::MapFilter;
pub use exception::JsException;
pub use loader::{FileModuleLoader, ModuleLoader, normalize_module_name};
pub use memory::MemoryReport;
pub use registry::Handle;
pub use scope::Scope;
pub use table::ContextTable;
pub use value::{ContextId, JsArray, JsFunction, JsObject, JsReference, JsValue, MAX_SAFE_INTEGER};

/// Evaluate JavaScript code in a throwaway context
///
/// Object results come back as proxies of a context that no longer exists,
/// so this is only useful for primitive results.
pub fn eval(code: &str) -> Result<JsValue, JsError> {
    let context = JsContext::new()?;
    context.evaluate(code, UNKNOWN_FILE)
}

/// Errors surfaced by the bridge
#[derive(Debug, thiserror::Error)]
pub enum JsError {
    /// A script threw, or the engine reported a resource fault
    #[error("{0}")]
    Exception(JsException),

    /// Promise rejections nobody handled by the end of a job drain
    #[error("UnhandledPromiseRejectionException: {0}")]
    UnhandledRejection(String),

    /// Value kind that has no counterpart on the other side
    #[error("Unsupported type {0}")]
    UnsupportedType(String),

    /// Host-side argument rejected before touching the engine
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Handle no longer held by the context
    #[error("Handle {0} is not alive in this context")]
    StaleHandle(Handle),

    /// Proxy produced by another context
    #[error("Handle {handle} belongs to context {owner}, not {context}")]
    ForeignHandle {
        handle: Handle,
        owner: ContextId,
        context: ContextId,
    },

    /// Module loader could not produce a module; `cause` is the engine error
    #[error("Module load failed: {modules}: {cause}")]
    ModuleLoad { modules: String, cause: Box<JsError> },

    /// Operation on a context that was destroyed
    #[error("Context {0} has been destroyed")]
    ContextDestroyed(ContextId),

    /// Engine error that is not a script exception
    #[error("JavaScript engine error: {0}")]
    Runtime(#[from] rquickjs::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl JsError {
    /// Message of a script exception, if this is one
    pub fn exception(&self) -> Option<&JsException> {
        match self {
            JsError::Exception(exception) => Some(exception),
            _ => None,
        }
    }
}
