//! Exception formatting
//!
//! Error-shaped values become `message` plus `stack`; anything else thrown
//! is stringified as-is.

use crate::JsError;
use rquickjs::{Coerced, Ctx, Value};
use std::fmt;

/// Script-level exception surfaced to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsException {
    pub message: String,
    pub stack: Option<String>,
}

impl fmt::Display for JsException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(stack) = &self.stack {
            write!(f, "\n{stack}")?;
        }
        Ok(())
    }
}

/// Format a thrown value
pub(crate) fn describe<'js>(ctx: &Ctx<'js>, error: &Value<'js>) -> JsException {
    if let Some(exception) = error.as_exception() {
        trigger_on_error(ctx, error);
        let stack = exception.stack().filter(|s| !s.trim().is_empty());
        return JsException {
            message: exception.message().unwrap_or_default(),
            stack,
        };
    }

    let message = match error.get::<Coerced<String>>() {
        Ok(text) => text.0,
        Err(_) => {
            // clear whatever the failed coercion threw
            drop(ctx.catch());
            format!("[{}]", error.type_name())
        }
    };
    JsException { message, stack: None }
}

/// Take the pending exception out of the context
pub(crate) fn take_pending<'js>(ctx: &Ctx<'js>) -> JsError {
    let error = ctx.catch();
    JsError::Exception(describe(ctx, &error))
}

/// Map an engine error, fetching the exception when one is pending
pub(crate) fn from_engine<'js>(ctx: &Ctx<'js>, err: rquickjs::Error) -> JsError {
    if matches!(err, rquickjs::Error::Exception) {
        take_pending(ctx)
    } else {
        JsError::Runtime(err)
    }
}

/// `rquickjs::Result` -> `Result<_, JsError>`, taking any pending exception
pub(crate) trait IntoJsError<T> {
    fn into_js_error(self, ctx: &Ctx<'_>) -> Result<T, JsError>;
}

impl<T> IntoJsError<T> for rquickjs::Result<T> {
    fn into_js_error(self, ctx: &Ctx<'_>) -> Result<T, JsError> {
        self.map_err(|err| from_engine(ctx, err))
    }
}

/// Invoke a global `onError` / `onerror` handler, if the script defined one
fn trigger_on_error<'js>(ctx: &Ctx<'js>, error: &Value<'js>) {
    let globals = ctx.globals();
    let handler = ["onError", "onerror"]
        .into_iter()
        .filter_map(|name| globals.get::<_, Value>(name).ok())
        .find(Value::is_function);
    let Some(handler) = handler.and_then(|h| h.into_function()) else {
        return;
    };

    if handler.call::<_, Value>((error.clone(),)).is_err() {
        let failure = ctx.catch();
        tracing::warn!("onError handler threw: {}", describe_plain(&failure));
    }
}

fn describe_plain(value: &Value<'_>) -> String {
    value
        .get::<Coerced<String>>()
        .map(|s| s.0)
        .unwrap_or_else(|_| format!("[{}]", value.type_name()))
}
