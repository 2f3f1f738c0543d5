//! Raw evaluation and bytecode serialization
//!
//! Thin wrappers over the engine calls that the safe API does not expose
//! with file names and compile-only flags.

use crate::exception::IntoJsError;
use crate::JsError;
use rquickjs::{Ctx, Error, Value, qjs};
use std::ffi::CString;

/// Evaluation flavour of a source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvalMode {
    Global,
    Module,
}

impl EvalMode {
    fn flags(self) -> i32 {
        match self {
            EvalMode::Global => qjs::JS_EVAL_TYPE_GLOBAL as i32,
            EvalMode::Module => qjs::JS_EVAL_TYPE_MODULE as i32,
        }
    }
}

fn c_string(text: &str, what: &str) -> Result<CString, JsError> {
    CString::new(text).map_err(|_| JsError::InvalidArgument(format!("{what} contains a NUL byte")))
}

/// Take ownership of a returned engine value, mapping the exception tag
///
/// # Safety
/// `raw` must be an owned value created in `ctx`.
unsafe fn owned<'js>(ctx: &Ctx<'js>, raw: qjs::JSValue) -> rquickjs::Result<Value<'js>> {
    if unsafe { qjs::JS_IsException(raw) } {
        return Err(Error::Exception);
    }
    Ok(unsafe { Value::from_raw(ctx.clone(), raw) })
}

fn eval_raw<'js>(ctx: &Ctx<'js>, source: &str, file: &str, flags: i32) -> Result<Value<'js>, JsError> {
    let source = c_string(source, "script")?;
    let file = c_string(file, "file name")?;
    let bytes = source.as_bytes();

    // SAFETY: both strings are NUL terminated and outlive the call
    let raw = unsafe {
        qjs::JS_Eval(
            ctx.as_raw().as_ptr(),
            source.as_ptr(),
            bytes.len() as _,
            file.as_ptr(),
            flags,
        )
    };
    unsafe { owned(ctx, raw) }.into_js_error(ctx)
}

/// Evaluate `source` under `file`
pub(crate) fn eval<'js>(ctx: &Ctx<'js>, source: &str, file: &str, mode: EvalMode) -> Result<Value<'js>, JsError> {
    eval_raw(ctx, source, file, mode.flags())
}

/// Compile without running and serialize the result
pub(crate) fn compile<'js>(ctx: &Ctx<'js>, source: &str, file: &str, mode: EvalMode) -> Result<Vec<u8>, JsError> {
    let flags = mode.flags() | qjs::JS_EVAL_FLAG_COMPILE_ONLY as i32;
    let compiled = eval_raw(ctx, source, file, flags)?;

    // width follows the engine's size_t binding
    let mut size = 0;
    // SAFETY: `compiled` is alive for the call; the buffer is copied out
    // before being freed with the context allocator
    let buffer = unsafe {
        qjs::JS_WriteObject(
            ctx.as_raw().as_ptr(),
            &mut size,
            compiled.as_raw(),
            (qjs::JS_WRITE_OBJ_BYTECODE | qjs::JS_WRITE_OBJ_REFERENCE) as i32,
        )
    };
    if buffer.is_null() {
        return Err(Error::Exception).into_js_error(ctx);
    }
    let bytes = unsafe { std::slice::from_raw_parts(buffer, size as usize) }.to_vec();
    unsafe { qjs::js_free(ctx.as_raw().as_ptr(), buffer.cast()) };
    Ok(bytes)
}

/// Deserialize and run bytecode from [`compile`]
///
/// Returns the result and whether the bytecode was a module.
pub(crate) fn execute<'js>(ctx: &Ctx<'js>, bytecode: &[u8]) -> Result<(Value<'js>, bool), JsError> {
    if bytecode.is_empty() {
        return Err(JsError::InvalidArgument("bytecode is empty".into()));
    }
    let raw_ctx = ctx.as_raw().as_ptr();

    // SAFETY: the buffer outlives the call; the engine validates the format
    let object = unsafe {
        qjs::JS_ReadObject(
            raw_ctx,
            bytecode.as_ptr(),
            bytecode.len() as _,
            (qjs::JS_READ_OBJ_BYTECODE | qjs::JS_READ_OBJ_REFERENCE) as i32,
        )
    };
    if unsafe { qjs::JS_IsException(object) } {
        return Err(Error::Exception).into_js_error(ctx);
    }

    let is_module = unsafe { qjs::JS_VALUE_GET_TAG(object) } == qjs::JS_TAG_MODULE as i32;
    // SAFETY: `object` is owned here; on failure it is freed, on success
    // ownership passes to JS_EvalFunction
    unsafe {
        if qjs::JS_ResolveModule(raw_ctx, object) < 0 {
            qjs::JS_FreeValue(raw_ctx, object);
            return Err(Error::Exception).into_js_error(ctx);
        }
        let result = qjs::JS_EvalFunction(raw_ctx, object);
        owned(ctx, result).into_js_error(ctx).map(|value| (value, is_module))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    #[test]
    fn test_eval_with_file_name() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let value = eval(&ctx, "6 * 7", "answer.js", EvalMode::Global).unwrap();
            assert_eq!(value.as_int(), Some(42));

            let err = eval(&ctx, "throw new Error('where')", "where.js", EvalMode::Global).unwrap_err();
            let stack = err.exception().unwrap().stack.clone().unwrap();
            assert!(stack.contains("where.js"));
        });
    }

    #[test]
    fn test_compile_has_no_side_effects() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let bytes = compile(&ctx, "globalThis.ran = true; 5", "c.js", EvalMode::Global).unwrap();
            assert!(!bytes.is_empty());
            let ran: Value = ctx.globals().get("ran").unwrap();
            assert!(ran.is_undefined());

            let (value, is_module) = execute(&ctx, &bytes).unwrap();
            assert_eq!(value.as_int(), Some(5));
            assert!(!is_module);
            let ran: bool = ctx.globals().get("ran").unwrap();
            assert!(ran);
        });
    }

    #[test]
    fn test_nul_in_source() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            let err = eval(&ctx, "1\0", "nul.js", EvalMode::Global).unwrap_err();
            assert!(matches!(err, JsError::InvalidArgument(_)));
        });
    }

    #[test]
    fn test_execute_rejects_garbage() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        context.with(|ctx| {
            assert!(execute(&ctx, &[]).is_err());
            assert!(execute(&ctx, &[0xff, 0x00, 0x13]).is_err());
        });
    }
}
