//! Deep conversion of engine objects into `serde_json` trees
//!
//! Functions are skipped and a reference back to an object on the current
//! path is cut, so cyclic graphs terminate. Shared sub-objects that are not
//! cycles are copied once per occurrence.

use crate::exception::IntoJsError;
use crate::registry::{Handle, handle_of};
use crate::scope::Scope;
use crate::value::{self, JsValue};
use crate::JsError;
use rquickjs::{Object, Value};
use serde_json::{Map, Number};
use std::collections::HashSet;

/// Decides which keys a deep conversion leaves out
pub trait MapFilter {
    /// `owner` is the handle of the object the key belongs to
    fn should_skip_key(&self, key: &str, owner: Handle) -> bool;
}

impl<F> MapFilter for F
where
    F: Fn(&str, Handle) -> bool,
{
    fn should_skip_key(&self, key: &str, owner: Handle) -> bool {
        self(key, owner)
    }
}

struct Walk<'a, 'js> {
    scope: &'a Scope<'js>,
    filter: Option<&'a dyn MapFilter>,
    path: HashSet<Handle>,
}

pub(crate) fn object_to_map<'js>(
    scope: &Scope<'js>,
    object: Object<'js>,
    filter: Option<&dyn MapFilter>,
) -> Result<Map<String, serde_json::Value>, JsError> {
    let mut walk = Walk::new(scope, filter);
    walk.path.insert(handle_of(object.as_value()));
    walk.object(&object)
}

pub(crate) fn array_to_list<'js>(
    scope: &Scope<'js>,
    array: Object<'js>,
    filter: Option<&dyn MapFilter>,
) -> Result<Vec<serde_json::Value>, JsError> {
    let mut walk = Walk::new(scope, filter);
    walk.path.insert(handle_of(array.as_value()));
    walk.array(&array)
}

impl<'a, 'js> Walk<'a, 'js> {
    fn new(scope: &'a Scope<'js>, filter: Option<&'a dyn MapFilter>) -> Self {
        Self {
            scope,
            filter,
            path: HashSet::new(),
        }
    }

    fn object(&mut self, object: &Object<'js>) -> Result<Map<String, serde_json::Value>, JsError> {
        let ctx = self.scope.ctx();
        let owner = handle_of(object.as_value());
        let mut map = Map::new();

        for key in object.keys::<String>() {
            let key = key.into_js_error(ctx)?;
            if self.filter.is_some_and(|f| f.should_skip_key(&key, owner)) {
                continue;
            }
            let value: Value = object.get(key.as_str()).into_js_error(ctx)?;
            if let Some(value) = self.value(value)? {
                map.insert(key, value);
            }
        }
        Ok(map)
    }

    fn array(&mut self, array: &Object<'js>) -> Result<Vec<serde_json::Value>, JsError> {
        let ctx = self.scope.ctx();
        let length: u32 = array.get("length").into_js_error(ctx)?;
        let mut list = Vec::with_capacity(length as usize);

        for index in 0..length {
            let value: Value = array.get(index).into_js_error(ctx)?;
            // holes and skipped values keep their slot as null
            list.push(self.value(value)?.unwrap_or(serde_json::Value::Null));
        }
        Ok(list)
    }

    /// `None` for values that are left out entirely
    fn value(&mut self, value: Value<'js>) -> Result<Option<serde_json::Value>, JsError> {
        if value.is_function() || value.is_symbol() {
            return Ok(None);
        }
        if !value.is_object() {
            return primitive(self.scope, value).map(Some);
        }

        let handle = handle_of(&value);
        if !self.path.insert(handle) {
            tracing::trace!(%handle, "cycle cut during conversion");
            return Ok(None);
        }
        let Some(object) = value.into_object() else {
            self.path.remove(&handle);
            return Ok(None);
        };
        let converted = if object.as_value().is_array() {
            self.array(&object).map(serde_json::Value::Array)
        } else {
            self.object(&object).map(serde_json::Value::Object)
        };
        self.path.remove(&handle);
        converted.map(Some)
    }
}

fn primitive<'js>(scope: &Scope<'js>, value: Value<'js>) -> Result<serde_json::Value, JsError> {
    let json = match value::to_host(scope, None, value)? {
        JsValue::Undefined | JsValue::Null => serde_json::Value::Null,
        JsValue::Bool(b) => serde_json::Value::Bool(b),
        JsValue::Int(i) => serde_json::Value::from(i),
        JsValue::Long(l) => serde_json::Value::from(l),
        JsValue::Double(d) => Number::from_f64(d).map_or(serde_json::Value::Null, serde_json::Value::Number),
        JsValue::String(s) => serde_json::Value::String(s),
        other => return Err(JsError::UnsupportedType(other.kind().to_string())),
    };
    Ok(json)
}
