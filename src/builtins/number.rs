// Brio Number Classes

use super::define_common;
use crate::vm::interner::intern;
use crate::vm::value::{Caller, Class, Value};

pub fn create_int_class() -> Class {
    let mut class = Class::new(intern("Int"), None, Vec::new());
    define_common(&mut class);
    class.define_native("abs", 0, int_abs);
    class.define_native("float", 0, int_to_float);
    class
}

pub fn create_float_class() -> Class {
    let mut class = Class::new(intern("Float"), None, Vec::new());
    define_common(&mut class);
    class.define_native("abs", 0, float_abs);
    class.define_native("floor", 0, float_floor);
    class.define_native("ceil", 0, float_ceil);
    class
}

fn expect_int(value: &Value) -> Result<i64, String> {
    value
        .as_int()
        .ok_or_else(|| format!("Expected an Int, not {}", value.type_name()))
}

fn expect_float(value: &Value) -> Result<f64, String> {
    match value {
        Value::Float(n) => Ok(*n),
        other => Err(format!("Expected a Float, not {}", other.type_name())),
    }
}

fn int_abs(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    Ok(Value::Int(expect_int(receiver)?.wrapping_abs()))
}

fn int_to_float(
    receiver: &Value,
    _args: &[Value],
    _caller: &mut dyn Caller,
) -> Result<Value, String> {
    Ok(Value::Float(expect_int(receiver)? as f64))
}

fn float_abs(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    Ok(Value::Float(expect_float(receiver)?.abs()))
}

fn float_floor(
    receiver: &Value,
    _args: &[Value],
    _caller: &mut dyn Caller,
) -> Result<Value, String> {
    Ok(Value::Int(expect_float(receiver)?.floor() as i64))
}

fn float_ceil(
    receiver: &Value,
    _args: &[Value],
    _caller: &mut dyn Caller,
) -> Result<Value, String> {
    Ok(Value::Int(expect_float(receiver)?.ceil() as i64))
}
