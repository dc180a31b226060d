// Brio Function Class
// Dispatch class for script functions and native free functions. The
// `call` behavior itself lives in the VM.

use super::define_common;
use crate::vm::interner::intern;
use crate::vm::value::{Caller, Class, Value};

pub fn create_function_class() -> Class {
    let mut class = Class::new(intern("Function"), None, Vec::new());
    define_common(&mut class);
    class.define_native("name", 0, function_name);
    class
}

fn function_name(
    receiver: &Value,
    _args: &[Value],
    _caller: &mut dyn Caller,
) -> Result<Value, String> {
    match receiver {
        Value::Function(method) => Ok(Value::Str(method.name.clone())),
        Value::Native(native) => Ok(Value::Str(native.name.clone())),
        other => Err(format!("Expected a Function, not {}", other.type_name())),
    }
}
