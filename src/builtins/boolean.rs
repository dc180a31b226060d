// Brio Bool Class

use super::define_common;
use crate::vm::interner::intern;
use crate::vm::value::Class;

pub fn create_boolean_class() -> Class {
    let mut class = Class::new(intern("Bool"), None, Vec::new());
    define_common(&mut class);
    class
}
