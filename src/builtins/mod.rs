// Brio Built-in Module
// The minimal builtin surface: classes backing the primitive value kinds,
// a few native free functions, and the iterator classes the for-loop
// protocol relies on. Installed into the global table before any user
// code runs.

mod boolean;
mod function;
mod list;
mod map;
mod nil;
mod number;
mod range;
mod string;

use crate::vm::interner::intern;
use crate::vm::value::{Caller, Class, Globals, NativeFunction, Value};
use crate::vm::vm::CoreClasses;
use std::rc::Rc;

pub use boolean::create_boolean_class;
pub use function::create_function_class;
pub use list::{create_list_class, create_list_iter_class};
pub use map::create_map_class;
pub use nil::create_nil_class;
pub use number::{create_float_class, create_int_class};
pub use range::create_range_class;
pub use string::create_string_class;

/// Create the builtin classes and globals. Returns the class set the VM
/// dispatches primitive values through.
pub fn install(globals: &mut Globals) -> CoreClasses {
    let core = CoreClasses {
        nil: Rc::new(create_nil_class()),
        boolean: Rc::new(create_boolean_class()),
        int: Rc::new(create_int_class()),
        float: Rc::new(create_float_class()),
        string: Rc::new(create_string_class()),
        list: Rc::new(create_list_class()),
        map: Rc::new(create_map_class()),
        function: Rc::new(create_function_class()),
        class: Rc::new(create_class_class()),
    };

    globals.define("ListIter", Value::Class(Rc::new(create_list_iter_class())));
    globals.define("range", Value::Class(Rc::new(create_range_class())));
    globals.define(
        "print",
        Value::Native(Rc::new(NativeFunction {
            name: intern("print"),
            arity: 1,
            func: native_print,
        })),
    );
    globals.define(
        "str",
        Value::Native(Rc::new(NativeFunction {
            name: intern("str"),
            arity: 1,
            func: native_str,
        })),
    );
    globals.define("absent", Value::Absent);

    core
}

fn create_class_class() -> Class {
    let mut class = Class::new(intern("Class"), None, Vec::new());
    define_common(&mut class);
    class.define_native("name", 0, class_name);
    class
}

fn class_name(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    match receiver {
        Value::Class(class) => Ok(Value::Str(class.name.clone())),
        other => Err(format!("Expected a Class, not {}", other.type_name())),
    }
}

fn native_print(_receiver: &Value, args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    match &args[0] {
        Value::Absent => println!(),
        value => println!("{}", value),
    }
    Ok(Value::Nil)
}

fn native_str(_receiver: &Value, args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    Ok(str_of(&args[0]))
}

pub(crate) fn str_of(value: &Value) -> Value {
    Value::Str(intern(&format!("{}", value)))
}

fn common_str(receiver: &Value, _args: &[Value], _caller: &mut dyn Caller) -> Result<Value, String> {
    Ok(str_of(receiver))
}

fn common_type(
    receiver: &Value,
    _args: &[Value],
    _caller: &mut dyn Caller,
) -> Result<Value, String> {
    Ok(Value::Str(intern(receiver.type_name())))
}

/// Methods every builtin class carries
pub(crate) fn define_common(class: &mut Class) {
    class.define_native("str", 0, common_str);
    class.define_native("type", 0, common_type);
}
