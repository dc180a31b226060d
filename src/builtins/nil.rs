// Brio Nil Class
// Also the dispatch class for the absent marker.

use super::define_common;
use crate::vm::interner::intern;
use crate::vm::value::Class;

pub fn create_nil_class() -> Class {
    let mut class = Class::new(intern("Nil"), None, Vec::new());
    define_common(&mut class);
    class
}
