//! JS `Value` <-> [`WireValue`] conversion and error-to-exception mapping
//! shared by every binding module.
//!
//! Grounded in `hyperlight-js-runtime::host_fn::HostFunction` — host
//! functions there take `Rest<Value<'js>>` and convert by hand rather than
//! relying on `rquickjs::function`'s typed-argument macro, since the set of
//! accepted JS shapes (string, number, boolean, null, Uint8Array) doesn't
//! map onto a single Rust type the macro could bind to.

use localflare_common::{LocalflareError, WireValue};
use rquickjs::{Ctx, Exception, Object, String as JsString, Value};

/// Converts one JS argument into a [`WireValue`], the shape every storage
/// backend's parameter list is expressed in.
pub fn to_wire<'js>(ctx: &Ctx<'js>, value: &Value<'js>) -> rquickjs::Result<WireValue> {
    if value.is_null() || value.is_undefined() {
        return Ok(WireValue::Null);
    }
    if let Some(b) = value.as_bool() {
        return Ok(WireValue::Bool(b));
    }
    if let Some(i) = value.as_int() {
        return Ok(WireValue::Integer(i as i64));
    }
    if let Some(f) = value.as_float() {
        return Ok(WireValue::Real(f));
    }
    if let Some(s) = value.as_string() {
        return Ok(WireValue::Text(s.to_string()?));
    }
    if let Some(obj) = value.as_object() {
        if let Some(array) = obj.as_typed_array::<u8>() {
            return Ok(WireValue::Bytes(array.as_bytes().unwrap_or_default().to_vec()));
        }
    }
    Err(Exception::throw_type(ctx, "unsupported binding argument type"))
}

/// Converts a [`WireValue`] back into a JS value for returning from a
/// binding method (e.g. a relational row's column values).
pub fn from_wire<'js>(ctx: &Ctx<'js>, value: &WireValue) -> rquickjs::Result<Value<'js>> {
    use rquickjs::IntoJs;
    match value {
        WireValue::Null => Ok(Value::new_null(ctx.clone())),
        WireValue::Bool(b) => b.into_js(ctx),
        WireValue::Integer(i) => i.into_js(ctx),
        WireValue::Real(r) => r.into_js(ctx),
        WireValue::Text(s) => JsString::from_str(ctx.clone(), s).map(|s| s.into_value()),
        WireValue::Bytes(b) => b.clone().into_js(ctx),
    }
}

/// Converts a slice of JS arguments (`bind(a, b, c)`-style) into the
/// `Vec<WireValue>` every storage `run`/`all`/`batch` call expects.
pub fn args_to_wire<'js>(ctx: &Ctx<'js>, values: &[Value<'js>]) -> rquickjs::Result<Vec<WireValue>> {
    values.iter().map(|v| to_wire(ctx, v)).collect()
}

/// Builds a JS object `{ <column>: <value>, ... }` from a relational row.
pub fn row_to_object<'js>(ctx: &Ctx<'js>, row: &[(String, WireValue)]) -> rquickjs::Result<Object<'js>> {
    let obj = Object::new(ctx.clone())?;
    for (name, value) in row {
        obj.set(name.as_str(), from_wire(ctx, value)?)?;
    }
    Ok(obj)
}

/// Throws `err` as a JS `Error` carrying a `.code` property matching
/// [`LocalflareError::code`], so worker scripts can branch on
/// `err.code === "not-found"` instead of parsing the message.
pub fn throw(ctx: &Ctx<'_>, err: LocalflareError) -> rquickjs::Error {
    let code = err.code();
    let message = err.to_string();
    match Exception::from_message(ctx.clone(), &message) {
        Ok(exception) => {
            let _ = exception.set("code", code);
            ctx.throw(exception.into_value())
        }
        Err(_) => Exception::throw_internal(ctx, &message),
    }
}
