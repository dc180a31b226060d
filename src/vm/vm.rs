// Brio Virtual Machine
// Fetch-decode-execute over compiled methods. One fixed-size value stack
// holds every call frame: four reserved slots, then the receiver, the
// arguments, and the frame's locals and temporaries. Dynamic dispatch
// walks the receiver's class chain; upvalue access walks the list of
// live capture frames by capture id.

use crate::compiler::builder::SAVED_SLOTS;
use crate::compiler::method::Method;
use crate::compiler::opcode::OpCode;
use crate::error::{BrioError, BrioResult, ErrorKind, Span, TraceFrame};
use crate::ordmap::OrderedMap;
use crate::parser::Parser;
use crate::vm::value::{
    Caller, Class, Globals, Instance, MethodEntry, NativeFn, Value,
};
use smallvec::SmallVec;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

const STACK_MAX: usize = 16384;
const FRAMES_MAX: usize = 256;

/// Host hook for resolving `import` names to source text. The core does
/// no I/O of its own.
pub trait ModuleLoader {
    /// Returns (source, file name) for a module, or a message when the
    /// module cannot be found.
    fn load(&mut self, name: &str) -> Result<(String, String), String>;
}

/// One active call
struct CallFrame {
    method: Rc<Method>,
    ip: usize,
    /// Absolute stack index of the receiver slot (frame slot 0)
    fp: usize,
    /// Absolute stack index the return value is delivered to
    ret_dst: usize,
    /// For init methods: the instance to return regardless of the
    /// method's own return value
    init_receiver: Option<Value>,
}

/// Live capture record published by calls whose locals are captured by
/// nested functions. Walked by upvalue access, newest first.
struct CaptureFrame {
    id: u32,
    fp: usize,
}

/// Classes backing the primitive value kinds, built by the builtin
/// library at startup
pub struct CoreClasses {
    pub nil: Rc<Class>,
    pub boolean: Rc<Class>,
    pub int: Rc<Class>,
    pub float: Rc<Class>,
    pub string: Rc<Class>,
    pub list: Rc<Class>,
    pub map: Rc<Class>,
    pub function: Rc<Class>,
    pub class: Rc<Class>,
}

/// The Brio virtual machine
pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    captures: Vec<CaptureFrame>,
    globals: Rc<RefCell<Globals>>,
    /// Capture-id allocator shared with every compilation this VM runs
    method_ids: Rc<Cell<u32>>,
    core: CoreClasses,
    /// Loaded modules: name to export map
    modules: OrderedMap<Value>,
    /// Export tables of the modules currently executing, innermost last
    module_exports: Vec<Rc<RefCell<OrderedMap<Value>>>>,
    loader: Option<Box<dyn ModuleLoader>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut globals = Globals::new();
        let core = crate::builtins::install(&mut globals);
        Self {
            stack: vec![Value::Nil; STACK_MAX],
            frames: Vec::with_capacity(FRAMES_MAX),
            captures: Vec::new(),
            globals: Rc::new(RefCell::new(globals)),
            method_ids: Rc::new(Cell::new(0)),
            core,
            modules: OrderedMap::new(),
            module_exports: Vec::new(),
            loader: None,
        }
    }

    /// The global table, shared with compilation for name resolution.
    pub fn globals(&self) -> Rc<RefCell<Globals>> {
        self.globals.clone()
    }

    /// Capture-id allocator, shared with compilation.
    pub fn method_ids(&self) -> Rc<Cell<u32>> {
        self.method_ids.clone()
    }

    /// Install a global binding. Used by hosts to register builtins
    /// before any user code runs.
    pub fn define_global(&self, name: &str, value: Value) {
        self.globals.borrow_mut().define(name, value);
    }

    pub fn set_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.loader = Some(loader);
    }

    /// Lex, parse, compile, and run one source file as a module.
    pub fn run_source(&mut self, source: &str, file: &str) -> BrioResult<Value> {
        let program = Parser::new(source, file)
            .parse()
            .map_err(|err| err.with_source(source))?;
        let method = crate::compiler::compile(program, &self.globals, &self.method_ids, file)
            .map_err(|err| err.with_source(source))?;
        self.run_method(method)
            .map_err(|err| err.with_source(source))
    }

    /// Run an already-compiled module body, discarding its export table.
    pub fn run_method(&mut self, method: Rc<Method>) -> BrioResult<Value> {
        let (result, _exports) = self.run_module_body(method)?;
        Ok(result)
    }

    fn run_module_body(
        &mut self,
        method: Rc<Method>,
    ) -> BrioResult<(Value, Rc<RefCell<OrderedMap<Value>>>)> {
        let base = self.stack_top();
        if base + SAVED_SLOTS + 1 > STACK_MAX {
            return Err(self.error(ErrorKind::Internal, "Value stack overflow"));
        }
        // self is nil in a module's outermost frame
        self.stack[base + SAVED_SLOTS] = Value::Nil;
        let exports = Rc::new(RefCell::new(OrderedMap::new()));
        self.module_exports.push(exports.clone());

        let depth = self.frames.len();
        let outcome = self
            .push_frame(method, base, None)
            .and_then(|_| self.execute_until(depth));
        self.module_exports.pop();
        outcome?;

        Ok((self.stack[base].clone(), exports))
    }

    /// Absolute index of the first free stack slot.
    fn stack_top(&self) -> usize {
        self.frames
            .last()
            .map(|frame| frame.fp + frame.method.max_slots as usize)
            .unwrap_or(0)
    }

    // ==================== frame plumbing ====================

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("active frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("active frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let byte = frame.method.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_operand(&mut self) -> i8 {
        self.read_byte() as i8
    }

    /// Resolve an operand to a value: a frame slot or a literal.
    fn read_value(&self, operand: i8) -> Value {
        let frame = self.frame();
        if operand >= 0 {
            self.stack[frame.fp + operand as usize].clone()
        } else {
            frame.method.literals[(-(operand as i32) - 1) as usize].clone()
        }
    }

    fn dst_slot(&self, operand: i8) -> BrioResult<usize> {
        if operand < 0 {
            return Err(self.error(ErrorKind::Internal, "Corrupt bytecode: literal as store target"));
        }
        Ok(self.frame().fp + operand as usize)
    }

    fn error(&self, kind: ErrorKind, message: impl Into<String>) -> BrioError {
        let (span, file) = match self.frames.last() {
            Some(frame) => (
                Span::line(frame.method.line_at(frame.ip.saturating_sub(1))),
                frame.method.file.to_string(),
            ),
            None => (Span::default(), String::new()),
        };
        let mut err = BrioError::new(kind, message, span, file);
        for frame in self.frames.iter().rev() {
            err.push_frame(TraceFrame {
                method_name: frame.method.name.to_string(),
                file: frame.method.file.to_string(),
                line: frame.method.line_at(frame.ip.saturating_sub(1)),
            });
        }
        err
    }

    fn push_frame(
        &mut self,
        method: Rc<Method>,
        abs_base: usize,
        init_receiver: Option<Value>,
    ) -> BrioResult<()> {
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.error(ErrorKind::Internal, "Call stack overflow"));
        }
        let fp = abs_base + SAVED_SLOTS;
        let end = fp + method.max_slots as usize;
        if end > STACK_MAX {
            return Err(self.error(ErrorKind::Internal, "Value stack overflow"));
        }
        // Locals start out nil; arguments were placed by the caller
        for slot in &mut self.stack[fp + 1 + method.arity as usize..end] {
            *slot = Value::Nil;
        }
        if method.creates_captures {
            self.captures.push(CaptureFrame { id: method.id, fp });
        }
        self.frames.push(CallFrame {
            method,
            ip: 0,
            fp,
            ret_dst: abs_base,
            init_receiver,
        });
        Ok(())
    }

    fn execute_until(&mut self, depth: usize) -> BrioResult<()> {
        while self.frames.len() > depth {
            self.step()?;
        }
        Ok(())
    }

    // ==================== dispatch ====================

    fn class_of(&self, value: &Value) -> Rc<Class> {
        match value {
            Value::Nil | Value::Absent | Value::Proto(_) => self.core.nil.clone(),
            Value::Bool(_) => self.core.boolean.clone(),
            Value::Int(_) => self.core.int.clone(),
            Value::Float(_) => self.core.float.clone(),
            Value::Str(_) => self.core.string.clone(),
            Value::List(_) => self.core.list.clone(),
            Value::Map(_) => self.core.map.clone(),
            Value::Function(_) | Value::Native(_) => self.core.function.clone(),
            Value::Class(_) => self.core.class.clone(),
            Value::Instance(instance) => instance.borrow().class.clone(),
        }
    }

    /// Dispatch `name` on the receiver sitting at abs_base + 4, with argc
    /// arguments following it. The result is delivered to abs_base.
    fn call_named(
        &mut self,
        abs_base: usize,
        name: &str,
        argc: usize,
        is_super: bool,
    ) -> BrioResult<()> {
        let receiver = self.stack[abs_base + SAVED_SLOTS].clone();

        // Callable values: functions enter their method with a nil-self
        // frame, classes construct an instance
        if name == "call" && !is_super {
            match &receiver {
                Value::Function(method) => {
                    let method = method.clone();
                    self.check_arity(&method.name, method.arity, argc)?;
                    self.stack[abs_base + SAVED_SLOTS] = Value::Nil;
                    self.push_frame(method.clone(), abs_base, None)?;
                    self.pad_args(abs_base, argc, method.arity);
                    return Ok(());
                }
                Value::Native(native) => {
                    let native = native.clone();
                    self.check_arity(&native.name, native.arity, argc)?;
                    let args = self.collect_args(abs_base, argc, native.arity);
                    let result = self.run_native(native.func, &receiver, &args)?;
                    self.stack[abs_base] = result;
                    return Ok(());
                }
                Value::Class(class) => {
                    let class = class.clone();
                    return self.construct(class, abs_base, argc);
                }
                _ => {}
            }
        }

        let receiver_class = self.class_of(&receiver);
        let lookup_class = if is_super {
            receiver_class.superclass.clone().ok_or_else(|| {
                self.error(
                    ErrorKind::Dispatch,
                    format!("Class '{}' has no superclass", receiver_class.name),
                )
            })?
        } else {
            receiver_class
        };

        match lookup_class.find_method(name) {
            Some(MethodEntry::Script(method)) => {
                self.check_arity(name, method.arity, argc)?;
                self.push_frame(method.clone(), abs_base, None)?;
                self.pad_args(abs_base, argc, method.arity);
                Ok(())
            }
            Some(MethodEntry::Native { arity, func }) => {
                self.check_arity(name, arity, argc)?;
                let args = self.collect_args(abs_base, argc, arity);
                let result = self.run_native(func, &receiver, &args)?;
                self.stack[abs_base] = result;
                Ok(())
            }
            None => {
                // Zero-argument misses fall back to instance variables
                // (and map entries, which makes module access work)
                if argc == 0 {
                    if let Value::Instance(instance) = &receiver {
                        let instance = instance.borrow();
                        if let Some(ix) = instance.class.ivar_slot(name) {
                            self.stack[abs_base] = instance.ivars[ix].clone();
                            return Ok(());
                        }
                    }
                    if let Value::Map(map) = &receiver {
                        if let Some(value) = map.borrow().get(name) {
                            self.stack[abs_base] = value.clone();
                            return Ok(());
                        }
                    }
                }
                Err(self.error(
                    ErrorKind::Dispatch,
                    format!(
                        "No method '{}' on {}",
                        name,
                        self.class_of(&receiver).name
                    ),
                ))
            }
        }
    }

    fn check_arity(&self, name: &str, arity: u8, argc: usize) -> BrioResult<()> {
        if argc > arity as usize {
            return Err(self.error(
                ErrorKind::Dispatch,
                format!(
                    "Too many arguments for '{}': expected {}, got {}",
                    name, arity, argc
                ),
            ));
        }
        Ok(())
    }

    /// Missing trailing arguments are padded with the absent marker.
    fn pad_args(&mut self, abs_base: usize, argc: usize, arity: u8) {
        for ix in argc..arity as usize {
            self.stack[abs_base + SAVED_SLOTS + 1 + ix] = Value::Absent;
        }
    }

    fn collect_args(&self, abs_base: usize, argc: usize, arity: u8) -> SmallVec<[Value; 8]> {
        let mut args: SmallVec<[Value; 8]> = SmallVec::new();
        for ix in 0..argc {
            args.push(self.stack[abs_base + SAVED_SLOTS + 1 + ix].clone());
        }
        while args.len() < arity as usize {
            args.push(Value::Absent);
        }
        args
    }

    fn run_native(
        &mut self,
        func: NativeFn,
        receiver: &Value,
        args: &[Value],
    ) -> BrioResult<Value> {
        func(receiver, args, self).map_err(|message| self.error(ErrorKind::Type, message))
    }

    fn construct(&mut self, class: Rc<Class>, abs_base: usize, argc: usize) -> BrioResult<()> {
        let instance = Value::Instance(Rc::new(RefCell::new(Instance::new(class.clone()))));
        self.stack[abs_base + SAVED_SLOTS] = instance.clone();
        match class.find_method("init") {
            Some(MethodEntry::Script(method)) => {
                self.check_arity("init", method.arity, argc)?;
                self.push_frame(method.clone(), abs_base, Some(instance))?;
                self.pad_args(abs_base, argc, method.arity);
                Ok(())
            }
            Some(MethodEntry::Native { arity, func }) => {
                self.check_arity("init", arity, argc)?;
                let args = self.collect_args(abs_base, argc, arity);
                self.run_native(func, &instance, &args)?;
                self.stack[abs_base] = instance;
                Ok(())
            }
            None => {
                if argc > 0 {
                    return Err(self.error(
                        ErrorKind::Dispatch,
                        format!("Class '{}' has no init method", class.name),
                    ));
                }
                self.stack[abs_base] = instance;
                Ok(())
            }
        }
    }

    // ==================== execution ====================

    fn step(&mut self) -> BrioResult<()> {
        let op = OpCode::from(self.read_byte());

        if let Some(argc) = op.call_argc() {
            let name_ref = self.read_operand();
            let base_rel = self.read_operand();
            let name = self.method_name(name_ref)?;
            let abs_base = self.frame().fp + base_rel as usize;
            return self.call_named(abs_base, &name, argc, false);
        }

        match op {
            OpCode::Copy => {
                let dst = self.read_operand();
                let src = self.read_operand();
                let value = self.read_value(src);
                let dst = self.dst_slot(dst)?;
                self.stack[dst] = value;
            }

            OpCode::LoadGlobal => {
                let dst = self.read_operand();
                let name_ref = self.read_operand();
                let name = self.method_name(name_ref)?;
                let value = self.globals.borrow().get(&name).ok_or_else(|| {
                    self.error(ErrorKind::Resolve, format!("Undefined name '{}'", name))
                })?;
                let dst = self.dst_slot(dst)?;
                self.stack[dst] = value;
            }

            OpCode::StoreGlobal => {
                let name_ref = self.read_operand();
                let src = self.read_operand();
                let name = self.method_name(name_ref)?;
                let value = self.read_value(src);
                if !self.globals.borrow_mut().set(&name, value) {
                    return Err(
                        self.error(ErrorKind::Resolve, format!("Undefined name '{}'", name))
                    );
                }
            }

            OpCode::GetUpvalue => {
                let dst = self.read_operand();
                let id_ref = self.read_operand();
                let slot = self.read_byte() as usize;
                let id = match self.read_value(id_ref) {
                    Value::Int(id) => id as u32,
                    _ => {
                        return Err(
                            self.error(ErrorKind::Internal, "Corrupt upvalue capture id")
                        )
                    }
                };
                let owner_fp = self.find_capture(id)?;
                let value = self.stack[owner_fp + slot].clone();
                let dst = self.dst_slot(dst)?;
                self.stack[dst] = value;
            }

            OpCode::SetUpvalue => {
                let id_ref = self.read_operand();
                let slot = self.read_byte() as usize;
                let src = self.read_operand();
                let id = match self.read_value(id_ref) {
                    Value::Int(id) => id as u32,
                    _ => {
                        return Err(
                            self.error(ErrorKind::Internal, "Corrupt upvalue capture id")
                        )
                    }
                };
                let value = self.read_value(src);
                let owner_fp = self.find_capture(id)?;
                self.stack[owner_fp + slot] = value;
            }

            OpCode::SetMember => {
                let obj_ref = self.read_operand();
                let name_ref = self.read_operand();
                let src = self.read_operand();
                let object = self.read_value(obj_ref);
                let name = self.method_name(name_ref)?;
                let value = self.read_value(src);
                match &object {
                    Value::Instance(instance) => {
                        let mut instance = instance.borrow_mut();
                        let Some(ix) = instance.class.ivar_slot(&name) else {
                            let class_name = instance.class.name.clone();
                            drop(instance);
                            return Err(self.error(
                                ErrorKind::Dispatch,
                                format!(
                                    "No instance variable '{}' on {}",
                                    name, class_name
                                ),
                            ));
                        };
                        instance.ivars[ix] = value;
                    }
                    Value::Map(map) => {
                        map.borrow_mut().insert(name, value);
                    }
                    other => {
                        return Err(self.error(
                            ErrorKind::Type,
                            format!("Cannot set '{}' on a {}", name, other.type_name()),
                        ));
                    }
                }
            }

            OpCode::BuildList => {
                let dst = self.read_operand();
                let base = self.read_operand();
                let count = self.read_byte() as usize;
                let start = self.frame().fp + base as usize;
                let elements: Vec<Value> = self.stack[start..start + count].to_vec();
                let dst = self.dst_slot(dst)?;
                self.stack[dst] = Value::List(Rc::new(RefCell::new(elements)));
            }

            OpCode::BuildMap => {
                let dst = self.read_operand();
                let base = self.read_operand();
                let pairs = self.read_byte() as usize;
                let start = self.frame().fp + base as usize;
                let mut map = OrderedMap::new();
                for ix in 0..pairs {
                    let key = match &self.stack[start + ix * 2] {
                        Value::Str(key) => key.clone(),
                        _ => {
                            return Err(
                                self.error(ErrorKind::Internal, "Corrupt map literal key")
                            )
                        }
                    };
                    map.insert(key, self.stack[start + ix * 2 + 1].clone());
                }
                let dst = self.dst_slot(dst)?;
                self.stack[dst] = Value::Map(Rc::new(RefCell::new(map)));
            }

            OpCode::MakeClass => {
                let dst = self.read_operand();
                let proto_ref = self.read_operand();
                let super_ref = self.read_operand();
                let proto = match self.read_value(proto_ref) {
                    Value::Proto(proto) => proto,
                    _ => return Err(self.error(ErrorKind::Internal, "Corrupt class proto")),
                };
                let superclass = match self.read_value(super_ref) {
                    Value::Absent => None,
                    Value::Class(class) => Some(class),
                    other => {
                        return Err(self.error(
                            ErrorKind::Resolve,
                            format!(
                                "Superclass of '{}' is not a class (found {})",
                                proto.name,
                                other.type_name()
                            ),
                        ));
                    }
                };
                let mut class = Class::new(proto.name.clone(), superclass, proto.ivars.clone());
                for (name, method) in &proto.methods {
                    class.define_method(name.clone(), method.clone());
                }
                let dst = self.dst_slot(dst)?;
                self.stack[dst] = Value::Class(Rc::new(class));
            }

            OpCode::Import => {
                let dst = self.read_operand();
                let name_ref = self.read_operand();
                let name = self.method_name(name_ref)?;
                let module = self.import_module(&name)?;
                let dst = self.dst_slot(dst)?;
                self.stack[dst] = module;
            }

            OpCode::Export => {
                let name_ref = self.read_operand();
                let src = self.read_operand();
                let name = self.method_name(name_ref)?;
                let value = self.read_value(src);
                let Some(exports) = self.module_exports.last() else {
                    return Err(
                        self.error(ErrorKind::Internal, "Export outside of a module body")
                    );
                };
                exports.borrow_mut().insert(name, value);
            }

            OpCode::Jump => {
                let offset = self.read_operand() as isize;
                let frame = self.frame_mut();
                frame.ip = (frame.ip as isize + offset) as usize;
            }

            OpCode::BranchIfTrue => {
                let cond = self.read_operand();
                let offset = self.read_operand() as isize;
                if self.read_value(cond).is_truthy() {
                    let frame = self.frame_mut();
                    frame.ip = (frame.ip as isize + offset) as usize;
                }
            }

            OpCode::BranchIfFalse => {
                let cond = self.read_operand();
                let offset = self.read_operand() as isize;
                if !self.read_value(cond).is_truthy() {
                    let frame = self.frame_mut();
                    frame.ip = (frame.ip as isize + offset) as usize;
                }
            }

            OpCode::Return => {
                let src = self.read_operand();
                let value = self.read_value(src);
                let frame = self.frames.pop().expect("active frame");
                if frame.method.creates_captures {
                    if let Some(last) = self.captures.last() {
                        if last.fp == frame.fp && last.id == frame.method.id {
                            self.captures.pop();
                        }
                    }
                }
                let result = frame.init_receiver.unwrap_or(value);
                self.stack[frame.ret_dst] = result;
            }

            OpCode::Negate | OpCode::Not | OpCode::BitNot => {
                let dst = self.read_operand();
                let operand = self.read_operand();
                let value = self.read_value(operand);
                let result = unary_op(op, &value)
                    .map_err(|message| self.error(ErrorKind::Type, message))?;
                let dst = self.dst_slot(dst)?;
                self.stack[dst] = result;
            }

            OpCode::SuperCall => {
                let argc = self.read_byte() as usize;
                let name_ref = self.read_operand();
                let base_rel = self.read_operand();
                let name = self.method_name(name_ref)?;
                let abs_base = self.frame().fp + base_rel as usize;
                return self.call_named(abs_base, &name, argc, true);
            }

            _ => {
                // Remaining opcodes are the binary operations
                let dst = self.read_operand();
                let a_ref = self.read_operand();
                let b_ref = self.read_operand();
                let a = self.read_value(a_ref);
                let b = self.read_value(b_ref);
                let result = binary_op(op, &a, &b)
                    .map_err(|message| self.error(ErrorKind::Type, message))?;
                let dst = self.dst_slot(dst)?;
                self.stack[dst] = result;
            }
        }
        Ok(())
    }

    fn method_name(&self, operand: i8) -> BrioResult<Arc<str>> {
        match self.read_value(operand) {
            Value::Str(name) => Ok(name),
            _ => Err(self.error(ErrorKind::Internal, "Corrupt bytecode: name literal")),
        }
    }

    /// Locate the live frame owning a captured local. An upvalue is only
    /// valid while its defining call is still on the stack; a stale
    /// reference fails loudly instead of reading unrelated slots.
    fn find_capture(&self, id: u32) -> BrioResult<usize> {
        self.captures
            .iter()
            .rev()
            .find(|capture| capture.id == id)
            .map(|capture| capture.fp)
            .ok_or_else(|| {
                self.error(
                    ErrorKind::Internal,
                    "Upvalue capture is no longer live: the defining call has returned",
                )
            })
    }

    fn import_module(&mut self, name: &str) -> BrioResult<Value> {
        if let Some(module) = self.modules.get(name) {
            return Ok(module.clone());
        }
        if self.loader.is_none() {
            return Err(self.error(
                ErrorKind::Resolve,
                format!("Cannot import '{}': no module loader installed", name),
            ));
        }
        let loaded = self.loader.as_mut().expect("loader").load(name);
        let (source, file) = match loaded {
            Ok(loaded) => loaded,
            Err(message) => return Err(self.error(ErrorKind::Resolve, message)),
        };
        let program = Parser::new(&source, &file).parse()?;
        let method =
            crate::compiler::compile(program, &self.globals, &self.method_ids, &file)?;
        let (_result, exports) = self.run_module_body(method)?;
        let module = Value::Map(exports);
        self.modules.insert(name, module.clone());
        Ok(module)
    }
}

impl Caller for Vm {
    /// Method-invocation entry point for native code and hosts: places
    /// the receiver and arguments in a fresh frame region above all live
    /// slots and runs to completion.
    fn invoke(&mut self, receiver: &Value, name: &str, args: &[Value]) -> BrioResult<Value> {
        let base = self.stack_top();
        let needed = base + SAVED_SLOTS + 1 + args.len();
        if needed > STACK_MAX {
            return Err(self.error(ErrorKind::Internal, "Value stack overflow"));
        }
        self.stack[base + SAVED_SLOTS] = receiver.clone();
        for (ix, arg) in args.iter().enumerate() {
            self.stack[base + SAVED_SLOTS + 1 + ix] = arg.clone();
        }
        let depth = self.frames.len();
        self.call_named(base, name, args.len(), false)?;
        self.execute_until(depth)?;
        Ok(self.stack[base].clone())
    }

    fn global(&self, name: &str) -> Option<Value> {
        self.globals.borrow().get(name)
    }
}

// ==================== operators ====================

fn unary_op(op: OpCode, value: &Value) -> Result<Value, String> {
    match op {
        OpCode::Negate => match value {
            Value::Int(n) => Ok(Value::Int(n.wrapping_neg())),
            Value::Float(n) => Ok(Value::Float(-n)),
            other => Err(format!("Cannot negate a {}", other.type_name())),
        },
        OpCode::Not => Ok(Value::Bool(!value.is_truthy())),
        OpCode::BitNot => match value {
            Value::Int(n) => Ok(Value::Int(!n)),
            other => Err(format!("Bitwise operand must be an Int, not {}", other.type_name())),
        },
        _ => unreachable!(),
    }
}

fn binary_op(op: OpCode, a: &Value, b: &Value) -> Result<Value, String> {
    use OpCode::*;
    match op {
        Add => add_values(a, b),
        Sub | Mul | Div | Mod => numeric_op(op, a, b),
        Equal => Ok(Value::Bool(a == b)),
        NotEqual => Ok(Value::Bool(a != b)),
        Less | LessEqual | Greater | GreaterEqual => compare_values(op, a, b),
        BitAnd | BitOr | BitXor | Shl | Shr => int_op(op, a, b),
        _ => Err("Corrupt bytecode: unknown binary operation".to_string()),
    }
}

fn add_values(a: &Value, b: &Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(x.wrapping_add(*y))),
        (Value::Str(x), _) => Ok(Value::Str(crate::vm::interner::intern(&format!(
            "{}{}",
            x, b
        )))),
        (_, Value::Str(y)) => Ok(Value::Str(crate::vm::interner::intern(&format!(
            "{}{}",
            a, y
        )))),
        (Value::List(x), Value::List(y)) => {
            let mut out = x.borrow().clone();
            out.extend(y.borrow().iter().cloned());
            Ok(Value::List(Rc::new(RefCell::new(out))))
        }
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => Ok(Value::Float(x + y)),
            _ => Err(format!(
                "Cannot add {} and {}",
                a.type_name(),
                b.type_name()
            )),
        },
    }
}

fn numeric_op(op: OpCode, a: &Value, b: &Value) -> Result<Value, String> {
    use OpCode::*;
    if let (Value::Int(x), Value::Int(y)) = (a, b) {
        return match op {
            Sub => Ok(Value::Int(x.wrapping_sub(*y))),
            Mul => Ok(Value::Int(x.wrapping_mul(*y))),
            Div => x
                .checked_div(*y)
                .map(Value::Int)
                .ok_or_else(|| "Division by zero".to_string()),
            Mod => x
                .checked_rem(*y)
                .map(Value::Int)
                .ok_or_else(|| "Division by zero".to_string()),
            _ => unreachable!(),
        };
    }
    match (a.as_number(), b.as_number()) {
        (Some(x), Some(y)) => Ok(Value::Float(match op {
            Sub => x - y,
            Mul => x * y,
            Div => x / y,
            Mod => x % y,
            _ => unreachable!(),
        })),
        _ => Err(format!(
            "Arithmetic operands must be numbers, not {} and {}",
            a.type_name(),
            b.type_name()
        )),
    }
}

fn compare_values(op: OpCode, a: &Value, b: &Value) -> Result<Value, String> {
    use OpCode::*;
    let ordering = match (a, b) {
        (Value::Str(x), Value::Str(y)) => x.as_bytes().cmp(y.as_bytes()),
        _ => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x
                .partial_cmp(&y)
                .ok_or_else(|| "Cannot order NaN".to_string())?,
            _ => {
                return Err(format!(
                    "Cannot order {} and {}",
                    a.type_name(),
                    b.type_name()
                ))
            }
        },
    };
    let result = match op {
        Less => ordering.is_lt(),
        LessEqual => ordering.is_le(),
        Greater => ordering.is_gt(),
        GreaterEqual => ordering.is_ge(),
        _ => unreachable!(),
    };
    Ok(Value::Bool(result))
}

fn int_op(op: OpCode, a: &Value, b: &Value) -> Result<Value, String> {
    use OpCode::*;
    let (Value::Int(x), Value::Int(y)) = (a, b) else {
        return Err(format!(
            "Bitwise operands must be Ints, not {} and {}",
            a.type_name(),
            b.type_name()
        ));
    };
    match op {
        BitAnd => Ok(Value::Int(x & y)),
        BitOr => Ok(Value::Int(x | y)),
        BitXor => Ok(Value::Int(x ^ y)),
        Shl | Shr => {
            if *y < 0 || *y >= 64 {
                return Err(format!("Shift amount {} out of range", y));
            }
            Ok(Value::Int(if op == Shl { x << y } else { x >> y }))
        }
        _ => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> BrioResult<Value> {
        Vm::new().run_source(source, "<test>")
    }

    fn run_ok(source: &str) -> Value {
        run(source).expect("program should run")
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(run_ok("return 1 + 2 * 3\n"), Value::Int(7));
        assert_eq!(run_ok("return (1 + 2) * 3\n"), Value::Int(9));
        assert_eq!(run_ok("return 7 / 2\n"), Value::Int(3));
        assert_eq!(run_ok("return 7.0 / 2\n"), Value::Float(3.5));
        assert_eq!(run_ok("return 7 % 3\n"), Value::Int(1));
        assert_eq!(run_ok("return 1 << 4 | 2\n"), Value::Int(18));
    }

    #[test]
    fn test_division_by_zero_is_type_error() {
        let err = run("return 1 / 0\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Type);
        assert!(err.message.contains("Division by zero"));
    }

    #[test]
    fn test_autodeclaration_is_function_scoped() {
        // Assigning inside the if body binds at function scope; the read
        // after the block sees the assigned value
        let result = run_ok("fn f()\n  if true\n    x = 5\n  return x\nreturn f()\n");
        assert_eq!(result, Value::Int(5));
    }

    #[test]
    fn test_untaken_branch_leaves_local_nil() {
        let result = run_ok("fn f()\n  if false\n    x = 5\n  return x\nreturn f()\n");
        assert_eq!(result, Value::Nil);
    }

    #[test]
    fn test_upvalue_reads_current_value_at_call_time() {
        let source = "fn outer()\n  v = 1\n  fn get()\n    return v\n  a = get()\n  v = 2\n  b = get()\n  return a * 10 + b\nreturn outer()\n";
        assert_eq!(run_ok(source), Value::Int(12));
    }

    #[test]
    fn test_upvalue_write_mutates_owner_frame() {
        let source = "fn outer()\n  v = 1\n  fn bump()\n    v = v + 1\n  bump()\n  bump()\n  return v\nreturn outer()\n";
        assert_eq!(run_ok(source), Value::Int(3));
    }

    #[test]
    fn test_dead_upvalue_capture_fails_loudly() {
        let source = "fn outer()\n  v = 1\n  fn get()\n    return v\n  return get\ng = outer()\nreturn g()\n";
        let err = run(source).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.message.contains("no longer live"));
    }

    #[test]
    fn test_unknown_method_is_dispatch_error() {
        let err = run("x = 5\nreturn x.frobnicate()\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Dispatch);
        assert!(err.message.contains("frobnicate"));
    }

    #[test]
    fn test_missing_arguments_pad_with_absent() {
        let source = "fn f(a, b)\n  if b == absent\n    return \"missing\"\n  return b\nreturn f(1)\n";
        assert_eq!(run_ok(source), Value::Str(crate::vm::interner::intern("missing")));
    }

    #[test]
    fn test_too_many_arguments_is_dispatch_error() {
        let err = run("fn f(a)\n  return a\nreturn f(1, 2)\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Dispatch);
        assert!(err.message.contains("Too many arguments"));
    }

    #[test]
    fn test_while_loop_with_break_and_continue() {
        let source = "total = 0\nn = 0\nwhile true\n  n = n + 1\n  if n > 10\n    break\n  if n % 2 == 0\n    continue\n  total = total + n\nreturn total\n";
        assert_eq!(run_ok(source), Value::Int(25));
    }

    #[test]
    fn test_for_over_list() {
        let source = "total = 0\nfor x in [1, 2, 3, 4]\n  total = total + x\nreturn total\n";
        assert_eq!(run_ok(source), Value::Int(10));
    }

    #[test]
    fn test_for_over_range() {
        let source = "total = 0\nfor i in range(5)\n  total = total + i\nreturn total\n";
        assert_eq!(run_ok(source), Value::Int(10));
        let source = "total = 0\nfor i in range(2, 5)\n  total = total + i\nreturn total\n";
        assert_eq!(run_ok(source), Value::Int(9));
    }

    #[test]
    fn test_for_over_map_keys_in_order() {
        let source = "m = {b: 1, a: 2, c: 3}\nout = []\nfor k in m\n  out.push(k)\nreturn out.join(\",\")\n";
        assert_eq!(
            run_ok(source),
            Value::Str(crate::vm::interner::intern("a,b,c"))
        );
    }

    #[test]
    fn test_short_circuit_skips_right_side() {
        let source = "count = 0\nfn bump()\n  count = count + 1\n  return true\nf = false\nr = f && bump()\nt = true\ns = t || bump()\nreturn count\n";
        assert_eq!(run_ok(source), Value::Int(0));
    }

    #[test]
    fn test_short_circuit_value_semantics() {
        assert_eq!(run_ok("return 1 && 2\n"), Value::Int(2));
        assert_eq!(run_ok("return nil || 3\n"), Value::Int(3));
        assert_eq!(run_ok("return nil && 2\n"), Value::Nil);
    }

    #[test]
    fn test_string_interpolation() {
        let source = "name = \"world\"\nn = 2\nreturn \"hello {name} {n + 1}!\"\n";
        assert_eq!(
            run_ok(source),
            Value::Str(crate::vm::interner::intern("hello world 3!"))
        );
    }

    #[test]
    fn test_class_init_and_ivars() {
        let source = "class Point\n  var x\n  var y\n  fn init(x, y)\n    self.x = x\n    self.y = y\n  fn sum()\n    return self.x + self.y\np = Point(3, 4)\nreturn p.sum() + p.x\n";
        assert_eq!(run_ok(source), Value::Int(10));
    }

    #[test]
    fn test_ivar_set_from_outside() {
        let source = "class Box\n  var value\nb = Box()\nb.value = 42\nreturn b.value\n";
        assert_eq!(run_ok(source), Value::Int(42));
    }

    #[test]
    fn test_inheritance_and_super_dispatch() {
        let source = "class A\n  fn who()\n    return \"A\"\nclass B extends A\n  fn who()\n    return \"B\" + super.who()\nreturn B().who()\n";
        assert_eq!(run_ok(source), Value::Str(crate::vm::interner::intern("BA")));
    }

    #[test]
    fn test_inherited_ivar_layout() {
        let source = "class A\n  var a\n  fn init(a)\n    self.a = a\nclass B extends A\n  var b\n  fn init(a, b)\n    self.a = a\n    self.b = b\nx = B(1, 2)\nreturn x.a * 10 + x.b\n";
        assert_eq!(run_ok(source), Value::Int(12));
    }

    #[test]
    fn test_forward_declared_superclass_is_resolve_error() {
        let source = "class B extends A\n  var x\nclass A\n  var y\nreturn 0\n";
        let err = run(source).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Resolve);
        assert!(err.message.contains("not a class"));
    }

    #[test]
    fn test_nil_receiver_dispatches_through_nil_class() {
        let source = "x = nil\nreturn x.str()\n";
        assert_eq!(run_ok(source), Value::Str(crate::vm::interner::intern("nil")));
    }

    #[test]
    fn test_index_sugar_on_lists_and_maps() {
        let source = "xs = [1, 2, 3]\nxs[1] = 20\nm = {a: 1}\nm[\"b\"] = 2\nreturn xs[1] + m[\"b\"]\n";
        assert_eq!(run_ok(source), Value::Int(22));
    }

    #[test]
    fn test_native_map_callback_reenters_user_code() {
        let source = "fn double(x)\n  return x * 2\nreturn [1, 2, 3].map(double).join(\",\")\n";
        assert_eq!(
            run_ok(source),
            Value::Str(crate::vm::interner::intern("2,4,6"))
        );
    }

    #[test]
    fn test_recursion_and_call_stack_overflow() {
        let source = "fn fact(n)\n  if n <= 1\n    return 1\n  return n * fact(n - 1)\nreturn fact(10)\n";
        assert_eq!(run_ok(source), Value::Int(3628800));

        let err = run("fn f()\n  return f()\nreturn f()\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(err.message.contains("overflow"));
    }

    #[test]
    fn test_define_global_visible_to_user_code() {
        let mut vm = Vm::new();
        vm.define_global("seven", Value::Int(7));
        let result = vm.run_source("return seven + 1\n", "<test>").unwrap();
        assert_eq!(result, Value::Int(8));
    }

    #[test]
    fn test_host_invoke_entry_point() {
        let mut vm = Vm::new();
        let function = vm
            .run_source("fn inc(x)\n  return x + 1\nreturn inc\n", "<test>")
            .unwrap();
        let result = vm.invoke(&function, "call", &[Value::Int(41)]).unwrap();
        assert_eq!(result, Value::Int(42));
    }

    struct TestLoader;

    impl ModuleLoader for TestLoader {
        fn load(&mut self, name: &str) -> Result<(String, String), String> {
            match name {
                "mathx" => Ok((
                    "tau = 628\nfn double(x)\n  return x * 2\nexport tau\nexport double\n"
                        .to_string(),
                    "mathx.bri".to_string(),
                )),
                _ => Err(format!("unknown module '{}'", name)),
            }
        }
    }

    #[test]
    fn test_import_binds_module_exports() {
        let mut vm = Vm::new();
        vm.set_loader(Box::new(TestLoader));
        let result = vm
            .run_source("import mathx\nreturn mathx.tau + mathx.double(6)\n", "<test>")
            .unwrap();
        assert_eq!(result, Value::Int(640));
    }

    #[test]
    fn test_import_without_loader_is_resolve_error() {
        let err = run("import mathx\nreturn 0\n").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Resolve);
    }

    #[test]
    fn test_callable_instances_via_call_method() {
        let source = "class Adder\n  var n\n  fn init(n)\n    self.n = n\n  fn call(x)\n    return x + self.n\nadd3 = Adder(3)\nreturn add3(7)\n";
        assert_eq!(run_ok(source), Value::Int(10));
    }

    #[test]
    fn test_else_only_if_runtime_behavior() {
        assert_eq!(run_ok("x = true\ny = 0\nif x\nelse\n  y = 1\nreturn y\n"), Value::Int(0));
        assert_eq!(run_ok("x = false\ny = 0\nif x\nelse\n  y = 1\nreturn y\n"), Value::Int(1));
    }

    #[test]
    fn test_module_return_value_is_last_return() {
        assert_eq!(run_ok("x = 1\n"), Value::Nil);
        assert_eq!(run_ok("return 9\n"), Value::Int(9));
    }

    #[test]
    fn test_forward_reference_to_block_function() {
        let source = "fn a()\n  return b() + 1\nfn b()\n  return 1\nreturn a()\n";
        assert_eq!(run_ok(source), Value::Int(2));
    }
}
