pub mod interner;
pub mod value;
#[allow(clippy::module_inception)]
pub mod vm;

pub use value::{Caller, Class, Globals, Instance, MethodEntry, NativeFn, Value};
pub use vm::{CoreClasses, ModuleLoader, Vm};
