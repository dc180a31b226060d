pub mod builder;
pub mod env;
pub mod method;
pub mod opcode;

pub use builder::{compile, MAX_FRAME_SLOTS, MAX_LITERALS, SAVED_SLOTS};
pub use method::Method;
pub use opcode::OpCode;
