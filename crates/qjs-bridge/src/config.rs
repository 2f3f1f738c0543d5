//! Context configuration

use serde::{Deserialize, Serialize};

/// Settings applied when a [`JsContext`](crate::JsContext) is created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextOptions {
    /// Maximum native stack the engine may use, in bytes
    pub max_stack_size: usize,
    /// Heap limit of the runtime, in bytes; 0 disables the limit
    pub memory_limit: usize,
    /// Allocation threshold that triggers a GC cycle
    pub gc_threshold: Option<usize>,
    /// Install the `console` global
    pub install_console: bool,
    /// Report handles still registered when the context is torn down
    pub leak_detection: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_stack_size: 256 * 1024,
            memory_limit: 32 * 1024 * 1024,
            gc_threshold: None,
            install_console: true,
            leak_detection: true,
        }
    }
}

impl ContextOptions {
    /// Parse options from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
