// Brio Map Class
// Ordered string-keyed map; iteration walks the keys in ascending order.

use super::define_common;
use super::list::make_list_iter;
use crate::vm::interner::intern;
use crate::vm::value::{Caller, Class, Value};
use crate::ordmap::OrderedMap;
use std::cell::RefCell;
use std::rc::Rc;

pub fn create_map_class() -> Class {
    let mut class = Class::new(intern("Map"), None, Vec::new());
    define_common(&mut class);
    class.define_native("len", 0, map_len);
    class.define_native("get", 1, map_get);
    class.define_native("set", 2, map_set);
    class.define_native("has", 1, map_has);
    class.define_native("keys", 0, map_keys);
    class.define_native("iter", 0, map_iter);
    class
}

fn expect_map(value: &Value) -> Result<Rc<RefCell<OrderedMap<Value>>>, String> {
    match value {
        Value::Map(map) => Ok(map.clone()),
        other => Err(format!("Expected a Map, not {}", other.type_name())),
    }
}

fn expect_key(value: &Value) -> Result<&str, String> {
    value
        .as_str()
        .ok_or_else(|| format!("Map key must be a Str, not {}", value.type_name()))
}

fn map_len(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    Ok(Value::Int(expect_map(receiver)?.borrow().len() as i64))
}

fn map_get(receiver: &Value, args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    let map = expect_map(receiver)?;
    let key = expect_key(&args[0])?;
    let value = map.borrow().get(key).cloned().unwrap_or(Value::Nil);
    Ok(value)
}

fn map_set(receiver: &Value, args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    let map = expect_map(receiver)?;
    let key = expect_key(&args[0])?;
    map.borrow_mut().insert(intern(key), args[1].clone());
    Ok(args[1].clone())
}

fn map_has(receiver: &Value, args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    let map = expect_map(receiver)?;
    let key = expect_key(&args[0])?;
    let has = map.borrow().contains_key(key);
    Ok(Value::Bool(has))
}

fn key_list(receiver: &Value) -> Result<Value, String> {
    let map = expect_map(receiver)?;
    let keys: Vec<Value> = map
        .borrow()
        .keys()
        .map(|key| Value::Str(key.clone()))
        .collect();
    Ok(Value::List(Rc::new(RefCell::new(keys))))
}

fn map_keys(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    key_list(receiver)
}

fn map_iter(receiver: &Value, _args: &[Value], caller: &mut dyn Caller) -> Result<Value, String> {
    make_list_iter(key_list(receiver)?, caller)
}
