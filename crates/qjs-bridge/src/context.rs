//! Execution Façade
//!
//! One engine runtime plus context, with the bridge state that belongs to
//! it. Every operation that runs script code is followed by a microtask
//! drain and the unhandled-rejection check.

use crate::bridge::Bridge;
use crate::bytecode::{self, EvalMode};
use crate::config::ContextOptions;
use crate::console::{self, Console};
use crate::convert::MapFilter;
use crate::exception::{self, IntoJsError};
use crate::loader::{self, ModuleLoader};
use crate::memory::MemoryReport;
use crate::registry::{Handle, handle_of};
use crate::rejection;
use crate::scope::Scope;
use crate::value::{ContextId, JsArray, JsFunction, JsObject, JsReference, JsValue};
use crate::JsError;
use rquickjs::promise::PromiseState;
use rquickjs::{Context, Ctx, Persistent, Runtime, Value};
use std::path::Path;
use std::rc::Rc;

/// File name used when the caller has none
pub const UNKNOWN_FILE: &str = "unknown.js";

const PREVIEW_LEN: usize = 64;

/// Receives the handles still registered when a context is torn down
pub trait LeakListener {
    fn on_leak(&self, context: ContextId, handle: Handle, preview: &str);
}

/// Value produced by script code, before the job drain
struct Pending<'js> {
    result: Value<'js>,
    this: Option<Value<'js>>,
    module: bool,
}

impl<'js> Pending<'js> {
    fn plain(result: Value<'js>) -> Self {
        Self { result, this: None, module: false }
    }
}

/// JavaScript execution context
///
/// Not `Send`: a context stays on the thread that created it.
pub struct JsContext {
    // dropped before the runtime
    context: Context,
    runtime: Runtime,
    bridge: Rc<Bridge>,
    options: ContextOptions,
}

impl JsContext {
    /// Create a context with default options
    pub fn new() -> Result<Self, JsError> {
        Self::with_options(ContextOptions::default())
    }

    pub fn with_options(options: ContextOptions) -> Result<Self, JsError> {
        let runtime = Runtime::new()?;
        runtime.set_max_stack_size(options.max_stack_size);
        if options.memory_limit > 0 {
            runtime.set_memory_limit(options.memory_limit);
        }
        if let Some(threshold) = options.gc_threshold {
            runtime.set_gc_threshold(threshold);
        }

        let context = Context::full(&runtime)?;
        let bridge = Bridge::new();
        rejection::install_tracker(&runtime, &bridge);
        loader::install(&runtime, &bridge);

        if options.install_console {
            context.with(|ctx| console::install_console(&ctx, &bridge))?;
        }

        tracing::info!(context = %bridge.id, "JavaScript context created");
        Ok(Self {
            context,
            runtime,
            bridge,
            options,
        })
    }

    pub fn id(&self) -> ContextId {
        self.bridge.id
    }

    pub fn options(&self) -> &ContextOptions {
        &self.options
    }

    // ------------------------------------------------------------------
    // evaluation
    // ------------------------------------------------------------------

    /// Evaluate a classic script
    pub fn evaluate(&self, script: &str, file_name: &str) -> Result<JsValue, JsError> {
        self.run(|scope| bytecode::eval(scope.ctx(), script, file_name, EvalMode::Global).map(Pending::plain))
    }

    /// Evaluate an ES module; imports go through the installed [`ModuleLoader`]
    pub fn evaluate_module(&self, script: &str, file_name: &str) -> Result<JsValue, JsError> {
        self.with_module_failures(|| {
            self.run(|scope| {
                let result = bytecode::eval(scope.ctx(), script, file_name, EvalMode::Module)?;
                Ok(Pending { result, this: None, module: true })
            })
        })
    }

    /// Compile to bytecode without running anything
    pub fn compile(&self, source: &str, file_name: &str, is_module: bool) -> Result<Vec<u8>, JsError> {
        let mode = if is_module { EvalMode::Module } else { EvalMode::Global };
        self.scoped(|scope| bytecode::compile(scope.ctx(), source, file_name, mode))
    }

    /// Run bytecode produced by [`compile`](Self::compile)
    pub fn execute(&self, bytecode: &[u8]) -> Result<JsValue, JsError> {
        self.with_module_failures(|| {
            self.run(|scope| {
                let (result, module) = bytecode::execute(scope.ctx(), bytecode)?;
                Ok(Pending { result, this: None, module })
            })
        })
    }

    /// Call `func` with the `this` it was read from
    pub fn call(&self, func: &JsFunction, args: &[JsValue]) -> Result<JsValue, JsError> {
        self.run(|scope| {
            let (result, this) = scope.call_raw(func, None, args)?;
            Ok(Pending { result, this: Some(this), module: false })
        })
    }

    pub fn call_with_this(&self, func: &JsFunction, this: &JsValue, args: &[JsValue]) -> Result<JsValue, JsError> {
        self.run(|scope| {
            let (result, this) = scope.call_raw(func, Some(this), args)?;
            Ok(Pending { result, this: Some(this), module: false })
        })
    }

    /// Drain the microtask queue without evaluating anything
    pub fn run_pending_jobs(&self) -> Result<(), JsError> {
        self.ensure_alive()?;
        self.drain_jobs()?;
        self.context.with(|ctx| rejection::raise_unhandled(&ctx, &self.bridge))
    }

    fn run<F>(&self, start: F) -> Result<JsValue, JsError>
    where
        F: for<'js> FnOnce(&Scope<'js>) -> Result<Pending<'js>, JsError>,
    {
        self.ensure_alive()?;

        let (result, this, module) = self.context.with(|ctx| -> Result<_, JsError> {
            let scope = Scope::retaining(ctx.clone(), self.bridge.clone());
            let pending = start(&scope)?;
            let this = pending.this.map(|this| Persistent::save(&ctx, this));
            Ok((Persistent::save(&ctx, pending.result), this, pending.module))
        })?;

        // jobs run outside `with`: a job may call back into host code
        self.drain_jobs()?;

        self.context.with(|ctx| {
            let result = result.restore(&ctx)?;
            let this = this.map(|this| this.restore(&ctx)).transpose()?;
            let settled = if module {
                settle_module(&ctx, &self.bridge, result)
            } else {
                Ok(result)
            };
            let unhandled = rejection::raise_unhandled(&ctx, &self.bridge);
            let result = settled?;
            unhandled?;

            let scope = Scope::retaining(ctx, self.bridge.clone());
            scope.to_host(this.as_ref(), result)
        })
    }

    fn drain_jobs(&self) -> Result<(), JsError> {
        let mut jobs = 0usize;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => jobs += 1,
                Ok(false) => break,
                Err(_) => {
                    tracing::debug!(jobs, "pending job threw");
                    return Err(self.context.with(|ctx| exception::take_pending(&ctx)));
                }
            }
        }
        if jobs > 0 {
            tracing::trace!(jobs, "pending jobs drained");
        }
        Ok(())
    }

    fn with_module_failures(&self, f: impl FnOnce() -> Result<JsValue, JsError>) -> Result<JsValue, JsError> {
        drop(self.bridge.loader.take_failures());
        let result = f();
        let failures = self.bridge.loader.take_failures();
        match result {
            Err(err) if !failures.is_empty() => {
                let modules = failures.join(", ");
                tracing::warn!(%modules, "module load failed: {}", err);
                Err(JsError::ModuleLoad {
                    modules,
                    cause: Box::new(err),
                })
            }
            other => other,
        }
    }

    fn scoped<R, F>(&self, f: F) -> Result<R, JsError>
    where
        F: for<'js> FnOnce(&Scope<'js>) -> Result<R, JsError>,
    {
        self.ensure_alive()?;
        self.context.with(|ctx| {
            let scope = Scope::retaining(ctx, self.bridge.clone());
            f(&scope)
        })
    }

    fn ensure_alive(&self) -> Result<(), JsError> {
        if self.bridge.is_alive() {
            Ok(())
        } else {
            Err(JsError::ContextDestroyed(self.bridge.id))
        }
    }

    // ------------------------------------------------------------------
    // values
    // ------------------------------------------------------------------

    pub fn global_object(&self) -> Result<JsObject, JsError> {
        self.scoped(|scope| scope.global_object())
    }

    pub fn get_property(&self, obj: &impl JsReference, name: &str) -> Result<JsValue, JsError> {
        self.scoped(|scope| scope.get_property(obj, name))
    }

    pub fn set_property(&self, obj: &impl JsReference, name: &str, value: &JsValue) -> Result<(), JsError> {
        self.scoped(|scope| scope.set_property(obj, name, value))
    }

    pub fn get(&self, obj: &impl JsReference, index: u32) -> Result<JsValue, JsError> {
        self.scoped(|scope| scope.get(obj, index))
    }

    pub fn set(&self, obj: &impl JsReference, index: u32, value: &JsValue) -> Result<(), JsError> {
        self.scoped(|scope| scope.set(obj, index, value))
    }

    pub fn length(&self, obj: &impl JsReference) -> Result<usize, JsError> {
        self.scoped(|scope| scope.length(obj))
    }

    pub fn stringify(&self, obj: &impl JsReference) -> Result<Option<String>, JsError> {
        self.scoped(|scope| scope.stringify(obj))
    }

    pub fn parse_json(&self, json: &str) -> Result<JsValue, JsError> {
        self.scoped(|scope| scope.parse_json(json))
    }

    pub fn create_object(&self) -> Result<JsObject, JsError> {
        self.scoped(|scope| scope.create_object())
    }

    pub fn create_array(&self) -> Result<JsArray, JsError> {
        self.scoped(|scope| scope.create_array())
    }

    pub fn own_property_names(&self, obj: &impl JsReference) -> Result<Vec<String>, JsError> {
        self.scoped(|scope| scope.own_property_names(obj))
    }

    pub fn to_map(
        &self,
        obj: &impl JsReference,
        filter: Option<&dyn MapFilter>,
    ) -> Result<serde_json::Map<String, serde_json::Value>, JsError> {
        self.scoped(|scope| scope.to_map(obj, filter))
    }

    pub fn to_list(&self, array: &JsArray, filter: Option<&dyn MapFilter>) -> Result<Vec<serde_json::Value>, JsError> {
        self.scoped(|scope| scope.to_list(array, filter))
    }

    // ------------------------------------------------------------------
    // reference management
    // ------------------------------------------------------------------

    /// Release the registry reference of a proxy
    ///
    /// Handles are engine heap addresses. Once the object is collected the
    /// address may be reused, and a released proxy can then resolve to the
    /// new object instead of failing with [`JsError::StaleHandle`]. Drop
    /// proxies after releasing them.
    pub fn release(&self, obj: &impl JsReference) -> Result<(), JsError> {
        self.scoped(|scope| scope.release(obj))
    }

    pub fn dup_value(&self, obj: &impl JsReference) -> Result<(), JsError> {
        self.scoped(|scope| scope.dup_value(obj))
    }

    pub fn free_dup_value(&self, obj: &impl JsReference) -> Result<(), JsError> {
        self.scoped(|scope| scope.free_dup_value(obj))
    }

    pub fn is_live_object(&self, obj: &impl JsReference) -> bool {
        self.scoped(|scope| Ok(scope.is_live_object(obj))).unwrap_or(false)
    }

    /// Number of handles in the registry
    pub fn registry_len(&self) -> usize {
        self.bridge.registry.borrow().len()
    }

    /// Number of host callbacks the engine still references
    pub fn callback_count(&self) -> usize {
        self.bridge.callbacks.borrow().len()
    }

    // ------------------------------------------------------------------
    // runtime
    // ------------------------------------------------------------------

    pub fn run_gc(&self) {
        self.runtime.run_gc();
    }

    pub fn set_max_stack_size(&self, bytes: usize) {
        self.runtime.set_max_stack_size(bytes);
    }

    pub fn set_memory_limit(&self, bytes: usize) {
        self.runtime.set_memory_limit(bytes);
    }

    pub fn memory_usage(&self) -> MemoryReport {
        MemoryReport::capture(&self.runtime)
    }

    /// Write the memory report to `path`, or log it
    pub fn dump_memory_usage(&self, path: Option<&Path>) -> Result<(), JsError> {
        MemoryReport::dump(&self.memory_usage().to_string(), path)?;
        Ok(())
    }

    pub fn dump_objects(&self, path: Option<&Path>) -> Result<(), JsError> {
        MemoryReport::dump(&self.memory_usage().objects(), path)?;
        Ok(())
    }

    pub fn set_module_loader(&self, loader: impl ModuleLoader + 'static) {
        self.bridge.loader.set(Some(Rc::new(loader)));
    }

    pub fn clear_module_loader(&self) {
        self.bridge.loader.set(None);
    }

    pub fn set_console(&self, console: impl Console + 'static) {
        *self.bridge.console.borrow_mut() = Some(Rc::new(console));
    }

    pub fn set_leak_listener(&self, listener: impl LeakListener + 'static) {
        *self.bridge.leak_listener.borrow_mut() = Some(Rc::new(listener));
    }

    /// Tear the context down now
    pub fn destroy(self) {
        drop(self);
    }

    fn report_leaks(&self) {
        if !self.options.leak_detection {
            return;
        }
        let handles = self.bridge.registry.borrow().handles();
        if handles.is_empty() {
            return;
        }
        let listener = self.bridge.leak_listener.borrow().clone();

        self.context.with(|ctx| {
            for handle in handles {
                let retained = self.bridge.registry.borrow().get(handle);
                let preview = retained
                    .and_then(|r| r.restore(&ctx).ok())
                    .map(|value| preview(&ctx, value))
                    .unwrap_or_default();
                match &listener {
                    Some(listener) => listener.on_leak(self.bridge.id, handle, &preview),
                    None => tracing::warn!(context = %self.bridge.id, %handle, "leaked handle: {}", preview),
                }
            }
        });
    }
}

impl Drop for JsContext {
    fn drop(&mut self) {
        self.report_leaks();
        self.bridge.shutdown();
        tracing::info!(context = %self.bridge.id, "JavaScript context destroyed");
    }
}

/// Unwrap the promise a module evaluation returns
fn settle_module<'js>(ctx: &Ctx<'js>, bridge: &Bridge, value: Value<'js>) -> Result<Value<'js>, JsError> {
    let Some(promise) = value.as_promise() else {
        return Ok(value);
    };
    match promise.state() {
        PromiseState::Pending => Ok(value.clone()),
        PromiseState::Resolved => match promise.result::<Value>() {
            Some(result) => result.into_js_error(ctx),
            None => Ok(Value::new_undefined(ctx.clone())),
        },
        PromiseState::Rejected => {
            // reported here, not as an unhandled rejection
            let queued = bridge.rejections.borrow_mut().handled(handle_of(&value));
            drop(queued);
            match promise.result::<Value>() {
                Some(Err(err)) => Err(exception::from_engine(ctx, err)),
                Some(Ok(reason)) => Err(JsError::Exception(exception::describe(ctx, &reason))),
                None => Ok(Value::new_undefined(ctx.clone())),
            }
        }
    }
}

fn preview<'js>(ctx: &Ctx<'js>, value: Value<'js>) -> String {
    let text = match ctx.json_stringify(value.clone()) {
        Ok(Some(json)) => json.to_string().unwrap_or_default(),
        _ => {
            drop(ctx.catch());
            format!("[{}]", value.type_name())
        }
    };
    text.chars().take(PREVIEW_LEN).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn test_evaluate_primitives() {
        let context = JsContext::new().unwrap();
        assert_eq!(context.evaluate("40 + 2", UNKNOWN_FILE).unwrap(), JsValue::Int(42));
        assert_eq!(context.evaluate("'a' + 'b'", UNKNOWN_FILE).unwrap(), JsValue::from("ab"));
        assert_eq!(context.evaluate("undefined", UNKNOWN_FILE).unwrap(), JsValue::Undefined);
        assert_eq!(context.evaluate("null", UNKNOWN_FILE).unwrap(), JsValue::Null);
        assert_eq!(context.evaluate("0.5", UNKNOWN_FILE).unwrap(), JsValue::Double(0.5));
    }

    #[test]
    fn test_microtasks_run_before_return() {
        let context = JsContext::new().unwrap();
        context
            .evaluate("var done = false; Promise.resolve().then(() => { done = true })", UNKNOWN_FILE)
            .unwrap();
        assert_eq!(context.evaluate("done", UNKNOWN_FILE).unwrap(), JsValue::Bool(true));
    }

    #[test]
    fn test_job_exception_propagates() {
        let context = JsContext::new().unwrap();
        let err = context
            .evaluate("Promise.resolve().then(() => { throw new Error('in job') }); 1", UNKNOWN_FILE)
            .unwrap_err();
        assert!(err.to_string().contains("in job"));
    }

    #[test]
    fn test_call_keeps_bound_this() {
        let context = JsContext::new().unwrap();
        let counter = context
            .evaluate("({ n: 1, bump() { return ++this.n } })", UNKNOWN_FILE)
            .unwrap()
            .as_object()
            .unwrap();
        let bump = context.get_property(&counter, "bump").unwrap().as_function().unwrap();
        assert_eq!(bump.this_handle(), Some(counter.handle()));
        assert_eq!(context.call(&bump, &[]).unwrap(), JsValue::Int(2));
        assert_eq!(context.call(&bump, &[]).unwrap(), JsValue::Int(3));
    }

    #[test]
    fn test_call_with_explicit_this() {
        let context = JsContext::new().unwrap();
        let get = context
            .evaluate("(function () { return this.v })", UNKNOWN_FILE)
            .unwrap()
            .as_function()
            .unwrap();
        let this = context.parse_json(r#"{"v": "explicit"}"#).unwrap();
        assert_eq!(context.call_with_this(&get, &this, &[]).unwrap(), JsValue::from("explicit"));
    }

    #[test]
    fn test_compile_then_execute() {
        let context = JsContext::new().unwrap();
        let bytes = context.compile("var side = 1; side + 1", "compiled.js", false).unwrap();
        assert_eq!(context.evaluate("typeof side", UNKNOWN_FILE).unwrap(), JsValue::from("undefined"));
        assert_eq!(context.execute(&bytes).unwrap(), JsValue::Int(2));

        let other = JsContext::new().unwrap();
        assert_eq!(other.execute(&bytes).unwrap(), JsValue::Int(2));
    }

    #[test]
    fn test_memory_dump_to_log() {
        let context = JsContext::new().unwrap();
        assert!(context.memory_usage().obj_count > 0);
        context.dump_memory_usage(None).unwrap();
        context.dump_objects(None).unwrap();
    }

    #[derive(Clone, Default)]
    struct Leaks(Rc<RefCell<Vec<(Handle, String)>>>);

    impl LeakListener for Leaks {
        fn on_leak(&self, _context: ContextId, handle: Handle, preview: &str) {
            self.0.borrow_mut().push((handle, preview.to_string()));
        }
    }

    #[test]
    fn test_leaks_reported_at_teardown() {
        let leaks = Leaks::default();
        let context = JsContext::new().unwrap();
        context.set_leak_listener(leaks.clone());

        let kept = context.evaluate("({ kept: true })", UNKNOWN_FILE).unwrap().as_object().unwrap();
        let released = context.create_object().unwrap();
        context.release(&released).unwrap();
        context.destroy();

        let reported = leaks.0.borrow();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].0, kept.handle());
        assert_eq!(reported[0].1, r#"{"kept":true}"#);
    }

    #[test]
    fn test_leak_detection_disabled() {
        let leaks = Leaks::default();
        let options = ContextOptions {
            leak_detection: false,
            ..Default::default()
        };
        let context = JsContext::with_options(options).unwrap();
        context.set_leak_listener(leaks.clone());
        context.create_object().unwrap();
        drop(context);
        assert!(leaks.0.borrow().is_empty());
    }
}
