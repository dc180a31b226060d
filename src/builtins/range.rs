// Brio Range Class
// range(stop) or range(start, stop): half-open integer range usable
// directly in for-loops. Exercises native init through class call.

use super::define_common;
use crate::vm::interner::intern;
use crate::vm::value::{Caller, Class, Value};

pub fn create_range_class() -> Class {
    let mut class = Class::new(
        intern("range"),
        None,
        vec![intern("current"), intern("stop")],
    );
    define_common(&mut class);
    class.define_native("init", 2, range_init);
    class.define_native("iter", 0, range_iter);
    class.define_native("next", 0, range_next);
    class
}

fn range_init(receiver: &Value, args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    let Value::Instance(instance) = receiver else {
        return Err(format!("Expected a range, not {}", receiver.type_name()));
    };
    let first = args[0]
        .as_int()
        .ok_or_else(|| format!("range bounds must be Ints, not {}", args[0].type_name()))?;
    // One argument counts from zero; the padded second argument is absent
    let (start, stop) = match &args[1] {
        Value::Absent => (0, first),
        bound => {
            let stop = bound
                .as_int()
                .ok_or_else(|| format!("range bounds must be Ints, not {}", bound.type_name()))?;
            (first, stop)
        }
    };
    let mut instance = instance.borrow_mut();
    instance.ivars[0] = Value::Int(start);
    instance.ivars[1] = Value::Int(stop);
    Ok(Value::Nil)
}

fn range_iter(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    Ok(receiver.clone())
}

fn range_next(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    let Value::Instance(instance) = receiver else {
        return Err(format!("Expected a range, not {}", receiver.type_name()));
    };
    let mut instance = instance.borrow_mut();
    let current = instance.ivars[0].as_int().unwrap_or(0);
    let stop = instance.ivars[1].as_int().unwrap_or(0);
    if current >= stop {
        return Ok(Value::Absent);
    }
    instance.ivars[0] = Value::Int(current + 1);
    Ok(Value::Int(current))
}
