// Brio List Class
// Also defines the shared iterator class used by lists, maps (over their
// keys), and anything else that snapshots into a list.

use super::define_common;
use crate::vm::interner::intern;
use crate::vm::value::{Caller, Class, Instance, Value};
use std::cell::RefCell;
use std::rc::Rc;

pub fn create_list_class() -> Class {
    let mut class = Class::new(intern("List"), None, Vec::new());
    define_common(&mut class);
    class.define_native("len", 0, list_len);
    class.define_native("push", 1, list_push);
    class.define_native("pop", 0, list_pop);
    class.define_native("get", 1, list_get);
    class.define_native("set", 2, list_set);
    class.define_native("contains", 1, list_contains);
    class.define_native("join", 1, list_join);
    class.define_native("iter", 0, list_iter);
    class.define_native("each", 1, list_each);
    class.define_native("map", 1, list_map);
    class
}

/// Iterator over a snapshot list: two instance variables, the items and
/// the cursor. `next` returns the absent marker once exhausted.
pub fn create_list_iter_class() -> Class {
    let mut class = Class::new(
        intern("ListIter"),
        None,
        vec![intern("items"), intern("index")],
    );
    define_common(&mut class);
    class.define_native("iter", 0, iter_self);
    class.define_native("next", 0, list_iter_next);
    class
}

/// Build a ListIter instance over an existing list value. The iterator
/// class is fetched from the global table through the caller handle.
pub fn make_list_iter(items: Value, caller: &mut dyn Caller) -> Result<Value, String> {
    let Some(Value::Class(class)) = caller.global("ListIter") else {
        return Err("Global 'ListIter' is missing or not a class".to_string());
    };
    let mut instance = Instance::new(class);
    instance.ivars[0] = items;
    instance.ivars[1] = Value::Int(0);
    Ok(Value::Instance(Rc::new(RefCell::new(instance))))
}

fn expect_list(value: &Value) -> Result<Rc<RefCell<Vec<Value>>>, String> {
    match value {
        Value::List(list) => Ok(list.clone()),
        other => Err(format!("Expected a List, not {}", other.type_name())),
    }
}

fn list_len(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    Ok(Value::Int(expect_list(receiver)?.borrow().len() as i64))
}

fn list_push(receiver: &Value, args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    let list = expect_list(receiver)?;
    list.borrow_mut().push(args[0].clone());
    Ok(receiver.clone())
}

fn list_pop(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    let list = expect_list(receiver)?;
    let popped = list.borrow_mut().pop();
    popped.ok_or_else(|| "Cannot pop from an empty List".to_string())
}

fn index_of(list_len: usize, index: &Value) -> Result<usize, String> {
    let ix = index
        .as_int()
        .ok_or_else(|| format!("List index must be an Int, not {}", index.type_name()))?;
    if ix < 0 || ix as usize >= list_len {
        return Err(format!("List index {} out of range (len {})", ix, list_len));
    }
    Ok(ix as usize)
}

fn list_get(receiver: &Value, args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    let list = expect_list(receiver)?;
    let list = list.borrow();
    let ix = index_of(list.len(), &args[0])?;
    Ok(list[ix].clone())
}

fn list_set(receiver: &Value, args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    let list = expect_list(receiver)?;
    let mut list = list.borrow_mut();
    let ix = index_of(list.len(), &args[0])?;
    list[ix] = args[1].clone();
    Ok(args[1].clone())
}

fn list_contains(
    receiver: &Value,
    args: &[Value],
    _caller: &mut dyn Caller,
) -> Result<Value, String> {
    let list = expect_list(receiver)?;
    let found = list.borrow().iter().any(|item| item == &args[0]);
    Ok(Value::Bool(found))
}

fn list_join(receiver: &Value, args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    let list = expect_list(receiver)?;
    let sep = match &args[0] {
        Value::Str(sep) => sep.to_string(),
        Value::Absent => String::new(),
        other => return Err(format!("Separator must be a Str, not {}", other.type_name())),
    };
    let parts: Vec<String> = list.borrow().iter().map(|v| format!("{}", v)).collect();
    Ok(Value::Str(intern(&parts.join(&sep))))
}

fn list_iter(receiver: &Value, _args: &[Value], caller: &mut dyn Caller) -> Result<Value, String> {
    make_list_iter(receiver.clone(), caller)
}

fn list_each(receiver: &Value, args: &[Value], caller: &mut dyn Caller) -> Result<Value, String> {
    let list = expect_list(receiver)?;
    let snapshot: Vec<Value> = list.borrow().clone();
    for item in snapshot {
        caller
            .invoke(&args[0], "call", &[item])
            .map_err(|err| err.message)?;
    }
    Ok(receiver.clone())
}

fn list_map(receiver: &Value, args: &[Value], caller: &mut dyn Caller) -> Result<Value, String> {
    let list = expect_list(receiver)?;
    let snapshot: Vec<Value> = list.borrow().clone();
    let mut out = Vec::with_capacity(snapshot.len());
    for item in snapshot {
        let mapped = caller
            .invoke(&args[0], "call", &[item])
            .map_err(|err| err.message)?;
        out.push(mapped);
    }
    Ok(Value::List(Rc::new(RefCell::new(out))))
}

fn iter_self(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    Ok(receiver.clone())
}

fn list_iter_next(
    receiver: &Value,
    _args: &[Value],
    _caller: &mut dyn Caller,
) -> Result<Value, String> {
    let Value::Instance(instance) = receiver else {
        return Err(format!("Expected an iterator, not {}", receiver.type_name()));
    };
    let mut instance = instance.borrow_mut();
    let items = match &instance.ivars[0] {
        Value::List(items) => items.clone(),
        other => return Err(format!("Iterator items must be a List, not {}", other.type_name())),
    };
    let index = instance.ivars[1].as_int().unwrap_or(0);
    let items = items.borrow();
    if index < 0 || index as usize >= items.len() {
        return Ok(Value::Absent);
    }
    instance.ivars[1] = Value::Int(index + 1);
    Ok(items[index as usize].clone())
}
