//! Context table
//!
//! Id-based access to contexts for hosts that pass contexts around as
//! plain identifiers. Ids are never reused, so an id that was destroyed
//! keeps failing with [`JsError::ContextDestroyed`].

use crate::config::ContextOptions;
use crate::context::JsContext;
use crate::value::ContextId;
use crate::JsError;
use std::collections::HashMap;

#[derive(Default)]
pub struct ContextTable {
    contexts: HashMap<ContextId, JsContext>,
    options: ContextOptions,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table whose contexts are all created with `options`
    pub fn with_options(options: ContextOptions) -> Self {
        Self {
            contexts: HashMap::new(),
            options,
        }
    }

    pub fn create_context(&mut self) -> Result<ContextId, JsError> {
        let context = JsContext::with_options(self.options.clone())?;
        let id = context.id();
        self.contexts.insert(id, context);
        Ok(id)
    }

    pub fn destroy_context(&mut self, id: ContextId) -> Result<(), JsError> {
        let context = self.contexts.remove(&id).ok_or(JsError::ContextDestroyed(id))?;
        context.destroy();
        Ok(())
    }

    pub fn get(&self, id: ContextId) -> Result<&JsContext, JsError> {
        self.contexts.get(&id).ok_or(JsError::ContextDestroyed(id))
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
