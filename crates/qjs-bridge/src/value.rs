//! Value Representation
//!
//! Host-side values and the conversions between them and engine values.
//! Both directions are a single closed match; kinds without a counterpart
//! are a typed [`JsError::UnsupportedType`], never a silent null.

use crate::callback::{self, HostCallback};
use crate::exception::IntoJsError;
use crate::registry::Handle;
use crate::scope::Scope;
use crate::JsError;
use rquickjs::{BigInt, Type, Value};
use std::fmt;

/// Largest integer a double represents exactly (2^53 - 1)
pub const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

/// Identity of a [`JsContext`](crate::JsContext)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Host value crossing the bridge
///
/// Integral numbers arrive as either `Int` or `Long` depending on how the
/// engine stored them (`JSON.parse` and arithmetic produce doubles), so
/// compare them through [`JsValue::as_i64`].
#[derive(Debug, Clone, PartialEq)]
pub enum JsValue {
    Undefined,
    Null,
    Bool(bool),
    Int(i32),
    /// Integral numbers outside i32, and BigInts that fit in 64 bits
    Long(i64),
    Double(f64),
    String(String),
    Object(JsObject),
    Array(JsArray),
    Function(JsFunction),
    /// Host function to expose to JavaScript
    Callback(HostCallback),
}

impl JsValue {
    /// Wrap a host closure as a callable value
    pub fn callback<F>(f: F) -> Self
    where
        F: for<'js> Fn(&Scope<'js>, Vec<JsValue>) -> Result<JsValue, JsError> + 'static,
    {
        JsValue::Callback(HostCallback::new(f))
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, JsValue::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JsValue::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JsValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            JsValue::Int(i) => Some(*i),
            JsValue::Long(l) => i32::try_from(*l).ok(),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            JsValue::Int(i) => Some(i64::from(*i)),
            JsValue::Long(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JsValue::Int(i) => Some(f64::from(*i)),
            JsValue::Long(l) => Some(*l as f64),
            JsValue::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Any engine object reference, whatever its subtype
    pub fn as_object(&self) -> Option<JsObject> {
        match self {
            JsValue::Object(o) => Some(*o),
            JsValue::Array(a) => Some(a.as_object()),
            JsValue::Function(f) => Some(f.as_object()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<JsArray> {
        match self {
            JsValue::Array(a) => Some(*a),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<JsFunction> {
        match self {
            JsValue::Function(f) => Some(*f),
            _ => None,
        }
    }

    /// Name of the variant, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            JsValue::Undefined => "undefined",
            JsValue::Null => "null",
            JsValue::Bool(_) => "bool",
            JsValue::Int(_) => "int",
            JsValue::Long(_) => "long",
            JsValue::Double(_) => "double",
            JsValue::String(_) => "string",
            JsValue::Object(_) => "object",
            JsValue::Array(_) => "array",
            JsValue::Function(_) => "function",
            JsValue::Callback(_) => "callback",
        }
    }
}

impl From<bool> for JsValue {
    fn from(b: bool) -> Self {
        JsValue::Bool(b)
    }
}

impl From<i32> for JsValue {
    fn from(i: i32) -> Self {
        JsValue::Int(i)
    }
}

impl From<i64> for JsValue {
    fn from(l: i64) -> Self {
        JsValue::Long(l)
    }
}

impl From<f64> for JsValue {
    fn from(d: f64) -> Self {
        JsValue::Double(d)
    }
}

impl From<&str> for JsValue {
    fn from(s: &str) -> Self {
        JsValue::String(s.to_string())
    }
}

impl From<String> for JsValue {
    fn from(s: String) -> Self {
        JsValue::String(s)
    }
}

impl From<JsObject> for JsValue {
    fn from(o: JsObject) -> Self {
        JsValue::Object(o)
    }
}

impl From<JsArray> for JsValue {
    fn from(a: JsArray) -> Self {
        JsValue::Array(a)
    }
}

impl From<JsFunction> for JsValue {
    fn from(f: JsFunction) -> Self {
        JsValue::Function(f)
    }
}

impl From<HostCallback> for JsValue {
    fn from(c: HostCallback) -> Self {
        JsValue::Callback(c)
    }
}

impl<T: Into<JsValue>> From<Option<T>> for JsValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(JsValue::Null, Into::into)
    }
}

/// Host proxy of an engine heap value
pub trait JsReference {
    fn handle(&self) -> Handle;
    fn context_id(&self) -> ContextId;
}

/// Proxy of a plain engine object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JsObject {
    pub(crate) handle: Handle,
    pub(crate) context: ContextId,
}

/// Proxy of an engine array
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JsArray {
    pub(crate) handle: Handle,
    pub(crate) context: ContextId,
}

/// Proxy of an engine function, with the object it was read from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JsFunction {
    pub(crate) handle: Handle,
    pub(crate) this: Option<Handle>,
    pub(crate) context: ContextId,
}

impl JsArray {
    pub fn as_object(&self) -> JsObject {
        JsObject { handle: self.handle, context: self.context }
    }
}

impl JsFunction {
    pub fn as_object(&self) -> JsObject {
        JsObject { handle: self.handle, context: self.context }
    }

    /// Handle of the bound `this`, if the function was read off an object
    pub fn this_handle(&self) -> Option<Handle> {
        self.this
    }
}

macro_rules! impl_reference {
    ($($ty:ty),*) => {
        $(
            impl JsReference for $ty {
                fn handle(&self) -> Handle {
                    self.handle
                }

                fn context_id(&self) -> ContextId {
                    self.context
                }
            }
        )*
    };
}

impl_reference!(JsObject, JsArray, JsFunction);

/// Engine value -> host value
///
/// Strings are copied and the engine string released on return. Objects,
/// arrays and functions become proxies adopted by `scope`.
pub(crate) fn to_host<'js>(
    scope: &Scope<'js>,
    owner: Option<&Value<'js>>,
    value: Value<'js>,
) -> Result<JsValue, JsError> {
    let context = scope.context_id();
    let host = match value.type_of() {
        Type::Uninitialized | Type::Undefined => JsValue::Undefined,
        Type::Null => JsValue::Null,
        Type::Bool => JsValue::Bool(value.as_bool().unwrap_or_default()),
        Type::Int => JsValue::Int(value.as_int().unwrap_or_default()),
        Type::Float => float_to_host(value.as_float().unwrap_or(f64::NAN)),
        Type::BigInt => match value.as_big_int() {
            Some(big) => JsValue::Long(big.clone().to_i64().into_js_error(scope.ctx())?),
            None => return Err(JsError::UnsupportedType("bigint".into())),
        },
        Type::String => match value.as_string() {
            Some(s) => JsValue::String(s.to_string().into_js_error(scope.ctx())?),
            None => return Err(JsError::UnsupportedType("string".into())),
        },
        Type::Function | Type::Constructor => {
            let this = owner.filter(|o| o.is_object()).map(|o| scope.note_owner(o));
            let handle = scope.adopt(value);
            JsValue::Function(JsFunction { handle, this, context })
        }
        Type::Array => JsValue::Array(JsArray { handle: scope.adopt(value), context }),
        Type::Symbol => return Err(JsError::UnsupportedType("symbol".into())),
        _ if value.is_object() => JsValue::Object(JsObject { handle: scope.adopt(value), context }),
        other => return Err(JsError::UnsupportedType(format!("{other:?}"))),
    };
    Ok(host)
}

/// Integral doubles become `Long` so large integers keep their precision
fn float_to_host(d: f64) -> JsValue {
    const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;
    if d.is_finite() && d.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&d) {
        JsValue::Long(d as i64)
    } else {
        JsValue::Double(d)
    }
}

/// Host value -> engine value
///
/// `name` is the property key the value is stored under; host callbacks
/// take it as their function name.
pub(crate) fn to_engine<'js>(
    scope: &Scope<'js>,
    value: &JsValue,
    name: Option<&str>,
) -> Result<Value<'js>, JsError> {
    let ctx = scope.ctx();
    let engine = match value {
        JsValue::Undefined => Value::new_undefined(ctx.clone()),
        JsValue::Null => Value::new_null(ctx.clone()),
        JsValue::Bool(b) => Value::new_bool(ctx.clone(), *b),
        JsValue::Int(i) => Value::new_int(ctx.clone(), *i),
        JsValue::Long(l) => long_to_engine(scope, *l)?,
        JsValue::Double(d) => Value::new_float(ctx.clone(), *d),
        JsValue::String(s) => rquickjs::String::from_str(ctx.clone(), s)
            .into_js_error(ctx)?
            .into_value(),
        JsValue::Object(o) => scope.resolve(o)?,
        JsValue::Array(a) => scope.resolve(a)?,
        JsValue::Function(f) => scope.resolve(f)?,
        JsValue::Callback(cb) => callback::install(scope, cb, name)?.into_value(),
    };
    Ok(engine)
}

fn long_to_engine<'js>(scope: &Scope<'js>, l: i64) -> Result<Value<'js>, JsError> {
    let ctx = scope.ctx();
    if !(-MAX_SAFE_INTEGER..=MAX_SAFE_INTEGER).contains(&l) {
        let big = BigInt::from_i64(ctx.clone(), l).into_js_error(ctx)?;
        return Ok(big.into_value());
    }
    Ok(match i32::try_from(l) {
        Ok(i) => Value::new_int(ctx.clone(), i),
        Err(_) => Value::new_float(ctx.clone(), l as f64),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_classification() {
        assert_eq!(float_to_host(1.5), JsValue::Double(1.5));
        assert_eq!(float_to_host(4.0), JsValue::Long(4));
        assert_eq!(float_to_host(9_007_199_254_740_992.0), JsValue::Long(1 << 53));
        assert!(matches!(float_to_host(f64::NAN), JsValue::Double(d) if d.is_nan()));
        assert_eq!(float_to_host(f64::INFINITY), JsValue::Double(f64::INFINITY));
        assert_eq!(float_to_host(1e300), JsValue::Double(1e300));
    }

    #[test]
    fn test_accessors() {
        assert_eq!(JsValue::Long(7).as_i32(), Some(7));
        assert_eq!(JsValue::Long(1 << 40).as_i32(), None);
        assert_eq!(JsValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(JsValue::from("hi").as_str(), Some("hi"));
        assert_eq!(JsValue::from(None::<i32>), JsValue::Null);
        assert_eq!(JsValue::from(true).kind(), "bool");
    }

    #[test]
    fn test_proxy_views() {
        let array = JsArray { handle: Handle::from_raw(16), context: ContextId(1) };
        let value = JsValue::from(array);
        assert_eq!(value.as_object().unwrap().handle(), Handle::from_raw(16));
        assert_eq!(value.as_array(), Some(array));
        assert!(value.as_function().is_none());
    }
}
