//! Handle Registry
//!
//! Tracks which engine heap values are exposed to the host. Each distinct
//! heap object owns exactly one registry reference, however many times it
//! crosses the boundary.

use rquickjs::{Ctx, Persistent, Value, qjs};
use std::collections::HashMap;
use std::fmt;

/// Opaque identifier of an engine heap value
///
/// The heap pointer's bit pattern, never dereferenced by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Handle of an object-tagged value
pub(crate) fn handle_of(value: &Value<'_>) -> Handle {
    debug_assert!(value.is_object());
    // SAFETY: object-tagged values carry a heap pointer payload; the pointer
    // is only read as an integer key.
    let ptr = unsafe { qjs::JS_VALUE_GET_PTR(value.as_raw()) };
    Handle(ptr as usize as u64)
}

type Retained = Persistent<Value<'static>>;

/// Handle -> retained engine value, one entry per distinct heap object
#[derive(Default)]
pub(crate) struct HandleRegistry {
    entries: HashMap<Handle, Retained>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `value` unless `handle` is already held.
    ///
    /// Returns true when the value was inserted. Otherwise the incoming
    /// reference is redundant and is released.
    pub fn register_if_absent<'js>(&mut self, ctx: &Ctx<'js>, handle: Handle, value: Value<'js>) -> bool {
        match self.contains_and_drop(handle, value) {
            Some(value) => {
                tracing::trace!(%handle, "registering handle");
                self.entries.insert(handle, Persistent::save(ctx, value));
                true
            }
            None => false,
        }
    }

    /// Drop `incoming` if `handle` is already held, else hand it back
    pub fn contains_and_drop<'js>(&self, handle: Handle, incoming: Value<'js>) -> Option<Value<'js>> {
        if self.entries.contains_key(&handle) {
            tracing::trace!(%handle, "handle already registered, releasing duplicate");
            drop(incoming);
            None
        } else {
            Some(incoming)
        }
    }

    /// Remove an entry. The caller drops the returned reference once no
    /// registry borrow is outstanding, since freeing may run finalizers.
    #[must_use]
    pub fn release(&mut self, handle: Handle) -> Option<Retained> {
        let entry = self.entries.remove(&handle);
        if entry.is_some() {
            tracing::trace!(%handle, "releasing handle");
        }
        entry
    }

    /// Another reference to a held value
    pub fn get(&self, handle: Handle) -> Option<Retained> {
        self.entries.get(&handle).cloned()
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn handles(&self) -> Vec<Handle> {
        let mut handles: Vec<Handle> = self.entries.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Take every entry out for teardown
    pub fn drain(&mut self) -> Vec<(Handle, Retained)> {
        self.entries.drain().collect()
    }
}

/// Extra references the host manages itself (dup / free-dup)
///
/// Independent of registry bookkeeping: a held value survives the release
/// of its registry entry.
#[derive(Default)]
pub(crate) struct HoldTable {
    holds: HashMap<Handle, Vec<Retained>>,
}

impl HoldTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dup<'js>(&mut self, ctx: &Ctx<'js>, handle: Handle, value: Value<'js>) {
        self.holds
            .entry(handle)
            .or_default()
            .push(Persistent::save(ctx, value));
    }

    /// Pop one extra reference; the caller drops it outside the borrow
    #[must_use]
    pub fn free_dup(&mut self, handle: Handle) -> Option<Retained> {
        let stack = self.holds.get_mut(&handle)?;
        let held = stack.pop();
        if stack.is_empty() {
            self.holds.remove(&handle);
        }
        held
    }

    pub fn get(&self, handle: Handle) -> Option<Retained> {
        self.holds.get(&handle).and_then(|stack| stack.last().cloned())
    }

    pub fn count(&self, handle: Handle) -> usize {
        self.holds.get(&handle).map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.holds.values().map(Vec::len).sum()
    }

    pub fn drain(&mut self) -> Vec<Retained> {
        self.holds.drain().flat_map(|(_, stack)| stack).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Object, Runtime};

    #[test]
    fn test_register_dedup() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();

        context.with(|ctx| {
            let mut registry = HandleRegistry::new();
            let obj: Value = Object::new(ctx.clone()).unwrap().into_value();
            let handle = handle_of(&obj);

            assert!(registry.register_if_absent(&ctx, handle, obj.clone()));
            assert!(!registry.register_if_absent(&ctx, handle, obj.clone()));
            assert!(!registry.register_if_absent(&ctx, handle, obj));
            assert_eq!(registry.len(), 1);

            drop(registry.release(handle));
            assert!(!registry.contains(handle));
            // releasing twice is a no-op
            assert!(registry.release(handle).is_none());
        });
    }

    #[test]
    fn test_distinct_objects_get_distinct_handles() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();

        context.with(|ctx| {
            let a: Value = Object::new(ctx.clone()).unwrap().into_value();
            let b: Value = Object::new(ctx.clone()).unwrap().into_value();
            assert_ne!(handle_of(&a), handle_of(&b));
            assert_eq!(handle_of(&a), handle_of(&a.clone()));
        });
    }

    #[test]
    fn test_hold_table_is_independent() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();

        context.with(|ctx| {
            let mut registry = HandleRegistry::new();
            let mut holds = HoldTable::new();
            let obj: Value = Object::new(ctx.clone()).unwrap().into_value();
            let handle = handle_of(&obj);

            registry.register_if_absent(&ctx, handle, obj.clone());
            holds.dup(&ctx, handle, obj.clone());
            holds.dup(&ctx, handle, obj);
            assert_eq!(holds.count(handle), 2);

            drop(registry.release(handle));
            assert!(holds.get(handle).is_some());

            drop(holds.free_dup(handle));
            drop(holds.free_dup(handle));
            assert!(holds.free_dup(handle).is_none());
            assert_eq!(holds.len(), 0);
        });
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(Handle::from_raw(255).to_string(), "0xff");
    }
}
