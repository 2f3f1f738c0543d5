//! Callback Bridge
//!
//! Host functions exposed to JavaScript. Each installation gets an id in
//! the context's [`CallbackTable`]; the engine function carries the id plus
//! a weak back-reference to the bridge. When the engine collects the
//! function, the captured [`CallbackGuard`] drops and removes the entry.

use crate::bridge::Bridge;
use crate::exception::IntoJsError;
use crate::scope::Scope;
use crate::value::JsValue;
use crate::JsError;
use rquickjs::function::{Rest, This};
use rquickjs::{Ctx, Exception, Function, Value};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};

/// Host function callable from JavaScript
///
/// Arguments are borrowed for the duration of the call: object proxies
/// among them resolve only inside `call` unless retained through the scope.
pub trait HostFunction {
    fn call<'js>(&self, scope: &Scope<'js>, args: Vec<JsValue>) -> Result<JsValue, JsError>;
}

impl<F> HostFunction for F
where
    F: for<'js> Fn(&Scope<'js>, Vec<JsValue>) -> Result<JsValue, JsError>,
{
    fn call<'js>(&self, scope: &Scope<'js>, args: Vec<JsValue>) -> Result<JsValue, JsError> {
        self(scope, args)
    }
}

/// Shared host callable
#[derive(Clone)]
pub struct HostCallback(Rc<dyn HostFunction>);

impl HostCallback {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'js> Fn(&Scope<'js>, Vec<JsValue>) -> Result<JsValue, JsError> + 'static,
    {
        Self(Rc::new(f))
    }

    pub fn from_function<H: HostFunction + 'static>(function: H) -> Self {
        Self(Rc::new(function))
    }
}

impl fmt::Debug for HostCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostCallback({:p})", Rc::as_ptr(&self.0))
    }
}

impl PartialEq for HostCallback {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::addr_eq(Rc::as_ptr(&self.0), Rc::as_ptr(&other.0))
    }
}

pub(crate) type CallbackId = u32;

/// Installed callbacks of one context
#[derive(Default)]
pub(crate) struct CallbackTable {
    next_id: CallbackId,
    entries: HashMap<CallbackId, HostCallback>,
}

impl CallbackTable {
    pub fn insert(&mut self, callback: HostCallback) -> CallbackId {
        self.next_id = self.next_id.wrapping_add(1);
        while self.entries.contains_key(&self.next_id) {
            self.next_id = self.next_id.wrapping_add(1);
        }
        self.entries.insert(self.next_id, callback);
        self.next_id
    }

    pub fn get(&self, id: CallbackId) -> Option<HostCallback> {
        self.entries.get(&id).cloned()
    }

    pub fn remove(&mut self, id: CallbackId) -> Option<HostCallback> {
        self.entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) -> Vec<HostCallback> {
        self.entries.drain().map(|(_, cb)| cb).collect()
    }
}

/// Finalization observer owned by the engine function
struct CallbackGuard {
    id: CallbackId,
    bridge: Weak<Bridge>,
}

impl Drop for CallbackGuard {
    fn drop(&mut self) {
        // may run during teardown, after the owning bridge stopped
        let Some(bridge) = self.bridge.upgrade() else {
            return;
        };
        if !bridge.is_alive() {
            return;
        }
        let removed = match bridge.callbacks.try_borrow_mut() {
            Ok(mut table) => table.remove(self.id),
            Err(_) => {
                tracing::warn!(id = self.id, "callback table busy during finalization");
                None
            }
        };
        if removed.is_some() {
            tracing::debug!(id = self.id, "host callback finalized");
        }
    }
}

/// Create the engine function for `callback`
pub(crate) fn install<'js>(
    scope: &Scope<'js>,
    callback: &HostCallback,
    name: Option<&str>,
) -> Result<Function<'js>, JsError> {
    let bridge = scope.bridge();
    let id = bridge.callbacks.borrow_mut().insert(callback.clone());
    let guard = CallbackGuard { id, bridge: Rc::downgrade(bridge) };
    tracing::trace!(id, name, "installing host callback");

    let function = Function::new(
        scope.ctx().clone(),
        move |ctx: Ctx<'js>, this: This<Value<'js>>, args: Rest<Value<'js>>| {
            invoke(&ctx, &guard, this.0, args.0)
        },
    )
    .into_js_error(scope.ctx())?;

    // native functions are anonymous unless named explicitly
    match name {
        Some(name) => function.with_name(name).into_js_error(scope.ctx()),
        None => Ok(function),
    }
}

/// Engine -> host call
fn invoke<'js>(
    ctx: &Ctx<'js>,
    guard: &CallbackGuard,
    this: Value<'js>,
    args: Vec<Value<'js>>,
) -> rquickjs::Result<Value<'js>> {
    let Some(bridge) = guard.bridge.upgrade().filter(|b| b.is_alive()) else {
        return Err(Exception::throw_internal(ctx, "host context is gone"));
    };
    let Some(callback) = bridge.callbacks.borrow().get(guard.id) else {
        let message = format!("host callback {} was removed", guard.id);
        return Err(Exception::throw_internal(ctx, &message));
    };

    let scope = Scope::borrowing(ctx.clone(), bridge);
    let result = marshal_args(&scope, &this, args).and_then(|args| callback.0.call(&scope, args));
    let result = result.and_then(|value| scope.to_engine(&value, None));

    match result {
        // the returned reference is owned by the caller; objects resolved
        // from the registry or borrow table already carry their own dup
        Ok(value) => Ok(value),
        Err(err) => Err(scope.throw(err)),
    }
}

fn marshal_args<'js>(
    scope: &Scope<'js>,
    this: &Value<'js>,
    args: Vec<Value<'js>>,
) -> Result<Vec<JsValue>, JsError> {
    args.into_iter()
        .map(|arg| scope.to_host(Some(this), arg))
        .collect()
}
