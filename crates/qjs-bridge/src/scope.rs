//! Operation scope
//!
//! A `Scope` is an entered engine context plus the bridge state. The
//! façade opens a retaining scope for every call; host callbacks receive a
//! borrowing scope so they can work on their arguments without re-entering
//! the context.
//!
//! Retaining scopes register every object that crosses to the host in the
//! handle registry. Borrowing scopes keep callback arguments in a local
//! table that dies with the call.

use crate::bridge::Bridge;
use crate::convert::{self, MapFilter};
use crate::exception::IntoJsError;
use crate::registry::{Handle, handle_of};
use crate::value::{self, ContextId, JsArray, JsFunction, JsObject, JsReference, JsValue};
use crate::JsError;
use rquickjs::function::{Rest, This};
use rquickjs::{Array, Ctx, Exception, Function, Object, Value};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retention {
    Registry,
    Borrowed,
}

/// Entered context handed to façade internals and host callbacks
pub struct Scope<'js> {
    ctx: Ctx<'js>,
    bridge: Rc<Bridge>,
    retention: Retention,
    borrowed: RefCell<HashMap<Handle, Value<'js>>>,
}

impl<'js> Scope<'js> {
    pub(crate) fn retaining(ctx: Ctx<'js>, bridge: Rc<Bridge>) -> Self {
        Self::new(ctx, bridge, Retention::Registry)
    }

    pub(crate) fn borrowing(ctx: Ctx<'js>, bridge: Rc<Bridge>) -> Self {
        Self::new(ctx, bridge, Retention::Borrowed)
    }

    fn new(ctx: Ctx<'js>, bridge: Rc<Bridge>, retention: Retention) -> Self {
        Self {
            ctx,
            bridge,
            retention,
            borrowed: RefCell::new(HashMap::new()),
        }
    }

    pub(crate) fn ctx(&self) -> &Ctx<'js> {
        &self.ctx
    }

    pub(crate) fn bridge(&self) -> &Rc<Bridge> {
        &self.bridge
    }

    /// Context the scope belongs to
    pub fn context_id(&self) -> ContextId {
        self.bridge.id
    }

    // ------------------------------------------------------------------
    // handle bookkeeping
    // ------------------------------------------------------------------

    /// Take ownership of an object-tagged value and return its handle
    pub(crate) fn adopt(&self, value: Value<'js>) -> Handle {
        let handle = handle_of(&value);
        match self.retention {
            Retention::Registry => {
                self.bridge
                    .registry
                    .borrow_mut()
                    .register_if_absent(&self.ctx, handle, value);
            }
            Retention::Borrowed => {
                if !self.bridge.registry.borrow().contains(handle) {
                    self.borrowed.borrow_mut().entry(handle).or_insert(value);
                }
            }
        }
        handle
    }

    /// Handle of the object a function was read from
    ///
    /// Borrowing scopes keep the owner reachable for the call; retaining
    /// scopes do not pin it.
    pub(crate) fn note_owner(&self, owner: &Value<'js>) -> Handle {
        let handle = handle_of(owner);
        if self.retention == Retention::Borrowed && !self.bridge.registry.borrow().contains(handle) {
            self.borrowed
                .borrow_mut()
                .entry(handle)
                .or_insert_with(|| owner.clone());
        }
        handle
    }

    fn check(&self, reference: &impl JsReference) -> Result<(), JsError> {
        if !self.bridge.is_alive() {
            return Err(JsError::ContextDestroyed(self.bridge.id));
        }
        if reference.context_id() != self.bridge.id {
            return Err(JsError::ForeignHandle {
                handle: reference.handle(),
                owner: reference.context_id(),
                context: self.bridge.id,
            });
        }
        Ok(())
    }

    fn lookup(&self, handle: Handle) -> Result<Option<Value<'js>>, JsError> {
        if let Some(value) = self.borrowed.borrow().get(&handle) {
            return Ok(Some(value.clone()));
        }
        let retained = self.bridge.registry.borrow().get(handle);
        let retained = retained.or_else(|| self.bridge.holds.borrow().get(handle));
        match retained {
            Some(retained) => Ok(Some(retained.restore(&self.ctx)?)),
            None => Ok(None),
        }
    }

    /// Fresh engine reference to the value behind a proxy
    pub(crate) fn resolve(&self, reference: &impl JsReference) -> Result<Value<'js>, JsError> {
        self.check(reference)?;
        let handle = reference.handle();
        self.lookup(handle)?.ok_or(JsError::StaleHandle(handle))
    }

    fn resolve_object(&self, reference: &impl JsReference) -> Result<Object<'js>, JsError> {
        let value = self.resolve(reference)?;
        value
            .into_object()
            .ok_or_else(|| JsError::InvalidArgument(format!("handle {} is not an object", reference.handle())))
    }

    fn resolve_function(&self, func: &JsFunction) -> Result<Function<'js>, JsError> {
        let value = self.resolve(func)?;
        value
            .into_function()
            .ok_or_else(|| JsError::InvalidArgument(format!("handle {} is not callable", func.handle)))
    }

    pub(crate) fn to_host(&self, owner: Option<&Value<'js>>, value: Value<'js>) -> Result<JsValue, JsError> {
        value::to_host(self, owner, value)
    }

    pub(crate) fn to_engine(&self, value: &JsValue, name: Option<&str>) -> Result<Value<'js>, JsError> {
        value::to_engine(self, value, name)
    }

    /// Throw `err` into the engine, for returning from a native function
    pub(crate) fn throw(&self, err: JsError) -> rquickjs::Error {
        let message = match err {
            JsError::Exception(exception) => exception.message,
            other => other.to_string(),
        };
        Exception::throw_message(&self.ctx, &message)
    }

    // ------------------------------------------------------------------
    // operations
    // ------------------------------------------------------------------

    pub fn global_object(&self) -> Result<JsObject, JsError> {
        let global = self.ctx.globals();
        Ok(JsObject {
            handle: self.adopt(global.into_value()),
            context: self.bridge.id,
        })
    }

    pub fn get_property(&self, obj: &impl JsReference, name: &str) -> Result<JsValue, JsError> {
        let target = self.resolve_object(obj)?;
        let value: Value = target.get(name).into_js_error(&self.ctx)?;
        self.to_host(Some(target.as_value()), value)
    }

    pub fn set_property(&self, obj: &impl JsReference, name: &str, value: &JsValue) -> Result<(), JsError> {
        let target = self.resolve_object(obj)?;
        let value = self.to_engine(value, Some(name))?;
        target.set(name, value).into_js_error(&self.ctx)
    }

    /// Element by integer index
    pub fn get(&self, obj: &impl JsReference, index: u32) -> Result<JsValue, JsError> {
        let target = self.resolve_object(obj)?;
        let value: Value = target.get(index).into_js_error(&self.ctx)?;
        self.to_host(Some(target.as_value()), value)
    }

    pub fn set(&self, obj: &impl JsReference, index: u32, value: &JsValue) -> Result<(), JsError> {
        let target = self.resolve_object(obj)?;
        let value = self.to_engine(value, None)?;
        target.set(index, value).into_js_error(&self.ctx)
    }

    /// Numeric `length` property
    pub fn length(&self, obj: &impl JsReference) -> Result<usize, JsError> {
        let target = self.resolve_object(obj)?;
        let length: Value = target.get("length").into_js_error(&self.ctx)?;
        let length = length
            .as_int()
            .map(f64::from)
            .or_else(|| length.as_float())
            .ok_or_else(|| JsError::InvalidArgument(format!("handle {} has no numeric length", obj.handle())))?;
        Ok(length.max(0.0) as usize)
    }

    /// Call with the `this` the function was read from
    pub fn call(&self, func: &JsFunction, args: &[JsValue]) -> Result<JsValue, JsError> {
        let (result, this) = self.call_raw(func, None, args)?;
        self.to_host(Some(&this), result)
    }

    /// Call with an explicit `this`
    pub fn call_with_this(&self, func: &JsFunction, this: &JsValue, args: &[JsValue]) -> Result<JsValue, JsError> {
        let (result, this) = self.call_raw(func, Some(this), args)?;
        self.to_host(Some(&this), result)
    }

    /// Call without converting the result; returns the result and `this`
    pub(crate) fn call_raw(
        &self,
        func: &JsFunction,
        this: Option<&JsValue>,
        args: &[JsValue],
    ) -> Result<(Value<'js>, Value<'js>), JsError> {
        let function = self.resolve_function(func)?;
        let this = match this {
            Some(this) => self.to_engine(this, None)?,
            None => self.bound_this(func)?,
        };

        // every converted argument is an owned reference released after
        // the call; objects were resolved with their own duplicate
        let args = args
            .iter()
            .map(|arg| self.to_engine(arg, None))
            .collect::<Result<Vec<_>, _>>()?;

        let result: Value = function
            .call((This(this.clone()), Rest(args)))
            .into_js_error(&self.ctx)?;
        Ok((result, this))
    }

    fn bound_this(&self, func: &JsFunction) -> Result<Value<'js>, JsError> {
        let Some(handle) = func.this else {
            return Ok(Value::new_undefined(self.ctx.clone()));
        };
        match self.lookup(handle)? {
            Some(this) => Ok(this),
            None => {
                tracing::trace!(%handle, "bound this no longer held, calling with undefined");
                Ok(Value::new_undefined(self.ctx.clone()))
            }
        }
    }

    /// `JSON.stringify`; `None` when the value has no JSON form
    pub fn stringify(&self, obj: &impl JsReference) -> Result<Option<String>, JsError> {
        let value = self.resolve(obj)?;
        let json = self.ctx.json_stringify(value).into_js_error(&self.ctx)?;
        json.map(|s| s.to_string().into_js_error(&self.ctx)).transpose()
    }

    pub fn parse_json(&self, json: &str) -> Result<JsValue, JsError> {
        let value = self.ctx.json_parse(json).into_js_error(&self.ctx)?;
        self.to_host(None, value)
    }

    pub fn create_object(&self) -> Result<JsObject, JsError> {
        let object = Object::new(self.ctx.clone()).into_js_error(&self.ctx)?;
        Ok(JsObject {
            handle: self.adopt(object.into_value()),
            context: self.bridge.id,
        })
    }

    pub fn create_array(&self) -> Result<JsArray, JsError> {
        let array = Array::new(self.ctx.clone()).into_js_error(&self.ctx)?;
        Ok(JsArray {
            handle: self.adopt(array.into_value()),
            context: self.bridge.id,
        })
    }

    /// All own string keys, enumerable or not
    pub fn own_property_names(&self, obj: &impl JsReference) -> Result<Vec<String>, JsError> {
        let target = self.resolve_object(obj)?;
        let object: Object = self.ctx.globals().get("Object").into_js_error(&self.ctx)?;
        let names: Function = object.get("getOwnPropertyNames").into_js_error(&self.ctx)?;
        names.call((target,)).into_js_error(&self.ctx)
    }

    /// Deep copy of an object's enumerable data
    pub fn to_map(
        &self,
        obj: &impl JsReference,
        filter: Option<&dyn MapFilter>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, JsError> {
        let target = self.resolve_object(obj)?;
        convert::object_to_map(self, target, filter)
    }

    /// Deep copy of an array's elements
    pub fn to_list(&self, array: &JsArray, filter: Option<&dyn MapFilter>) -> Result<Vec<serde_json::Value>, JsError> {
        let target = self.resolve_object(array)?;
        convert::array_to_list(self, target, filter)
    }

    /// Keep a proxy alive past the current callback
    pub fn retain(&self, value: &JsValue) -> Result<(), JsError> {
        let Some(obj) = value.as_object() else {
            return Ok(());
        };
        let engine = self.resolve(&obj)?;
        self.bridge
            .registry
            .borrow_mut()
            .register_if_absent(&self.ctx, obj.handle, engine);
        Ok(())
    }

    /// Drop the registry reference of a proxy; absent handles are a no-op
    pub fn release(&self, obj: &impl JsReference) -> Result<(), JsError> {
        self.check(obj)?;
        let released = self.bridge.registry.borrow_mut().release(obj.handle());
        drop(released);
        Ok(())
    }

    /// Take an extra engine reference, outside registry bookkeeping
    pub fn dup_value(&self, obj: &impl JsReference) -> Result<(), JsError> {
        let value = self.resolve(obj)?;
        self.bridge.holds.borrow_mut().dup(&self.ctx, obj.handle(), value);
        Ok(())
    }

    /// Give back one reference taken with [`dup_value`](Self::dup_value)
    pub fn free_dup_value(&self, obj: &impl JsReference) -> Result<(), JsError> {
        self.check(obj)?;
        let held = self.bridge.holds.borrow_mut().free_dup(obj.handle());
        match held {
            Some(held) => {
                drop(held);
                Ok(())
            }
            None => Err(JsError::InvalidArgument(format!(
                "no extra reference held for handle {}",
                obj.handle()
            ))),
        }
    }

    pub fn is_live_object(&self, obj: &impl JsReference) -> bool {
        if self.check(obj).is_err() {
            return false;
        }
        let handle = obj.handle();
        self.borrowed.borrow().contains_key(&handle)
            || self.bridge.registry.borrow().contains(handle)
            || self.bridge.holds.borrow().count(handle) > 0
    }
}
