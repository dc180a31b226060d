// Brio Str Class

use super::define_common;
use crate::vm::interner::intern;
use crate::vm::value::{Caller, Class, Value};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

pub fn create_string_class() -> Class {
    let mut class = Class::new(intern("Str"), None, Vec::new());
    define_common(&mut class);
    class.define_native("len", 0, str_len);
    class.define_native("get", 1, str_get);
    class.define_native("contains", 1, str_contains);
    class.define_native("split", 1, str_split);
    class.define_native("upper", 0, str_upper);
    class.define_native("lower", 0, str_lower);
    class
}

fn expect_str(value: &Value) -> Result<&Arc<str>, String> {
    match value {
        Value::Str(s) => Ok(s),
        other => Err(format!("Expected a Str, not {}", other.type_name())),
    }
}

fn str_len(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    Ok(Value::Int(expect_str(receiver)?.chars().count() as i64))
}

fn str_get(receiver: &Value, args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    let s = expect_str(receiver)?;
    let index = args[0]
        .as_int()
        .ok_or_else(|| format!("Str index must be an Int, not {}", args[0].type_name()))?;
    let c = (index >= 0)
        .then(|| s.chars().nth(index as usize))
        .flatten()
        .ok_or_else(|| format!("Str index {} out of range", index))?;
    Ok(Value::Str(intern(&c.to_string())))
}

fn str_contains(
    receiver: &Value,
    args: &[Value],
    _caller: &mut dyn Caller,
) -> Result<Value, String> {
    let s = expect_str(receiver)?;
    let needle = expect_str(&args[0])?;
    Ok(Value::Bool(s.contains(needle.as_ref())))
}

fn str_split(receiver: &Value, args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    let s = expect_str(receiver)?;
    let sep = expect_str(&args[0])?;
    let parts: Vec<Value> = s
        .split(sep.as_ref())
        .map(|part| Value::Str(intern(part)))
        .collect();
    Ok(Value::List(Rc::new(RefCell::new(parts))))
}

fn str_upper(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    Ok(Value::Str(intern(&expect_str(receiver)?.to_uppercase())))
}

fn str_lower(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    Ok(Value::Str(intern(&expect_str(receiver)?.to_lowercase())))
}
