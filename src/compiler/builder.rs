// Brio Compiler
// Two passes per block: a resolve pass rewrites every identifier into a
// resolved reference, then an emit pass generates bytecode against the
// in-progress method. Frame slots come from a bump allocator with
// mark/reset rollback; calls reserve their saved-area, receiver, and
// argument slots contiguously below the new frame.

use super::env::{Environment, Scope};
use super::method::Method;
use super::opcode::OpCode;
use crate::ast::*;
use crate::error::{BrioError, BrioResult, Span};
use crate::vm::interner::intern;
use crate::vm::value::{ClassProto, Globals, Value};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;
use thiserror::Error;

/// Slots addressable by one signed operand byte
pub const MAX_FRAME_SLOTS: usize = 128;
/// Literal indices addressable by one negative operand byte
pub const MAX_LITERALS: usize = 128;
/// Reserved slots below each frame: return destination, saved frame
/// pointer, saved instruction pointer, saved literal-pool reference
pub const SAVED_SLOTS: usize = 4;

/// Single-byte encoding limits; surfaced as syntax errors at the site
#[derive(Debug, Error)]
enum LimitError {
    #[error("method frame requires more than {MAX_FRAME_SLOTS} slots")]
    FrameSlots,
    #[error("too many literals in one method (max {MAX_LITERALS})")]
    Literals,
    #[error("branch target out of range")]
    BranchRange,
}

/// Loop bookkeeping: the back-edge target plus pending break patch sites
struct LoopCtx {
    start: usize,
    breaks: Vec<usize>,
}

/// Builder for one method's bytecode, literal pool, and frame layout
pub struct MethodBuilder {
    name: Arc<str>,
    id: u32,
    arity: u8,
    code: Vec<u8>,
    literals: Vec<Value>,
    lines: Vec<u32>,
    /// Watermark below which slots are permanent locals
    base: u8,
    /// Next free slot; rolled back to a mark once an expression's result
    /// has been consumed
    cur: u8,
    /// Peak slot count reached anywhere in the method
    max: u8,
    creates_captures: Rc<Cell<bool>>,
    loops: Vec<LoopCtx>,
    is_method: bool,
    line: u32,
}

impl MethodBuilder {
    fn new(name: Arc<str>, id: u32, arity: u8, is_method: bool) -> Self {
        let floor = 1 + arity; // receiver + arguments
        Self {
            name,
            id,
            arity,
            code: Vec::new(),
            literals: Vec::new(),
            lines: Vec::new(),
            base: floor,
            cur: floor,
            max: floor,
            creates_captures: Rc::new(Cell::new(false)),
            loops: Vec::new(),
            is_method,
            line: 0,
        }
    }

    fn set_line(&mut self, line: usize) {
        self.line = line as u32;
    }

    // ---- frame-slot allocator ----

    fn mark(&self) -> u8 {
        self.cur
    }

    fn reset(&mut self, mark: u8) {
        debug_assert!(mark >= self.base);
        self.cur = mark;
    }

    /// Reserve a contiguous run of temporary slots.
    fn alloc_temp(&mut self, count: usize) -> Result<u8, LimitError> {
        let start = self.cur as usize;
        let end = start + count;
        if end > MAX_FRAME_SLOTS {
            return Err(LimitError::FrameSlots);
        }
        self.cur = end as u8;
        if self.cur > self.max {
            self.max = self.cur;
        }
        Ok(start as u8)
    }

    /// Reserve a permanent local slot. Only legal while no temporaries
    /// are outstanding, which holds during the resolve pass.
    fn alloc_local(&mut self) -> Result<u8, LimitError> {
        debug_assert_eq!(self.cur, self.base);
        let slot = self.alloc_temp(1)?;
        self.base = self.cur;
        Ok(slot)
    }

    // ---- literal pool ----

    /// Append a literal (duplicates are not merged) and return its
    /// negative-biased operand encoding.
    fn add_literal(&mut self, value: Value) -> Result<i8, LimitError> {
        if self.literals.len() >= MAX_LITERALS {
            return Err(LimitError::Literals);
        }
        let index = self.literals.len() as i32;
        self.literals.push(value);
        Ok((-index - 1) as i8)
    }

    // ---- byte emission ----

    fn emit_op(&mut self, op: OpCode) {
        self.code.push(op as u8);
        self.lines.push(self.line);
    }

    fn operand(&mut self, value: i8) {
        self.code.push(value as u8);
        self.lines.push(self.line);
    }

    fn raw(&mut self, value: u8) {
        self.code.push(value);
        self.lines.push(self.line);
    }

    fn copy(&mut self, dst: u8, src: i8) {
        self.emit_op(OpCode::Copy);
        self.operand(dst as i8);
        self.operand(src);
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    /// Emit a conditional branch with a placeholder offset; returns the
    /// patch site.
    fn emit_branch(&mut self, op: OpCode, cond: i8) -> usize {
        self.emit_op(op);
        self.operand(cond);
        let site = self.code.len();
        self.raw(0);
        site
    }

    /// Emit an unconditional forward jump; returns the patch site.
    fn emit_jump(&mut self) -> usize {
        self.emit_op(OpCode::Jump);
        let site = self.code.len();
        self.raw(0);
        site
    }

    /// Patch a forward branch to land at the current position.
    fn patch(&mut self, site: usize) -> Result<(), LimitError> {
        let offset = self.code.len() as isize - (site as isize + 1);
        if offset > i8::MAX as isize {
            return Err(LimitError::BranchRange);
        }
        self.code[site] = (offset as i8) as u8;
        Ok(())
    }

    /// Backward jump to an already-emitted position.
    fn emit_loop_back(&mut self, target: usize) -> Result<(), LimitError> {
        self.emit_op(OpCode::Jump);
        let offset = target as isize - (self.code.len() as isize + 1);
        if offset < i8::MIN as isize {
            return Err(LimitError::BranchRange);
        }
        self.raw((offset as i8) as u8);
        Ok(())
    }

    fn finish(self, file: Arc<str>) -> Method {
        Method {
            name: self.name,
            id: self.id,
            arity: self.arity,
            code: self.code,
            literals: self.literals,
            max_slots: self.max,
            creates_captures: self.creates_captures.get(),
            lines: self.lines,
            file,
        }
    }
}

/// Receiver placement for call emission
enum CallReceiver<'a> {
    Expr(&'a mut Expr),
    Slot(i8),
    SelfSlot,
}

pub struct Compiler {
    builders: Vec<MethodBuilder>,
    env: Environment,
    ids: Rc<Cell<u32>>,
    file: Arc<str>,
}

/// Compile a parsed program into the method for its module body.
///
/// The globals table is consulted (not modified) during resolution; the
/// id counter keeps capture identities unique across every method the
/// owning VM will ever run.
pub fn compile(
    mut program: Program,
    globals: &Rc<RefCell<Globals>>,
    ids: &Rc<Cell<u32>>,
    file: &str,
) -> BrioResult<Rc<Method>> {
    let mut compiler = Compiler {
        builders: Vec::new(),
        env: Environment::new(globals.clone()),
        ids: ids.clone(),
        file: Arc::from(file),
    };

    compiler.begin_method(intern("<module>"), &[], false);
    let module_id = compiler.env.current_method_id();
    compiler.env.push(Scope::Block {
        locals: program.body.locals.clone(),
        method_id: module_id,
        module_level: true,
    });
    compiler.resolve_block_inner(&mut program.body)?;
    compiler.emit_block_inner(&mut program.body)?;
    compiler.env.pop();

    let line = 0;
    let nil = compiler.literal(Value::Nil, line)?;
    let builder = compiler.builder();
    builder.emit_op(OpCode::Return);
    builder.operand(nil);

    Ok(Rc::new(compiler.end_method()))
}

impl Compiler {
    fn builder(&mut self) -> &mut MethodBuilder {
        self.builders.last_mut().expect("builder stack")
    }

    fn begin_method(&mut self, name: Arc<str>, params: &[Arc<str>], is_method: bool) {
        let id = self.ids.get();
        self.ids.set(id + 1);
        let builder = MethodBuilder::new(name, id, params.len() as u8, is_method);
        self.env.push(Scope::Method {
            id,
            creates_captures: builder.creates_captures.clone(),
            params: params
                .iter()
                .enumerate()
                .map(|(i, p)| (p.clone(), (1 + i) as u8))
                .collect(),
        });
        self.builders.push(builder);
    }

    fn end_method(&mut self) -> Method {
        self.env.pop();
        let builder = self.builders.pop().expect("builder stack");
        builder.finish(self.file.clone())
    }

    // ---- error helpers ----

    fn syntax(&self, message: impl Into<String>, line: usize) -> BrioError {
        BrioError::syntax(message, Span::line(line), self.file.as_ref())
    }

    fn resolve_err(&self, message: impl Into<String>, line: usize) -> BrioError {
        BrioError::resolve(message, Span::line(line), self.file.as_ref())
    }

    fn limit(&self, err: LimitError, line: usize) -> BrioError {
        self.syntax(err.to_string(), line)
    }

    fn literal(&mut self, value: Value, line: usize) -> BrioResult<i8> {
        self.builder()
            .add_literal(value)
            .map_err(|e| self.limit(e, line))
    }

    fn name_literal(&mut self, name: &str, line: usize) -> BrioResult<i8> {
        self.literal(Value::Str(intern(name)), line)
    }

    // ==================== Resolve pass ====================

    fn resolve_block(&mut self, block: &mut Block, module_level: bool) -> BrioResult<()> {
        let method_id = self.env.current_method_id();
        self.env.push(Scope::Block {
            locals: block.locals.clone(),
            method_id,
            module_level,
        });
        let result = self.resolve_block_inner(block);
        self.env.pop();
        result
    }

    fn resolve_block_inner(&mut self, block: &mut Block) -> BrioResult<()> {
        // Bind declaration names first so they are forward-referenceable
        // anywhere in the block
        for decl in &block.decls {
            self.find_autodeclaring(decl.name(), decl.line())?;
        }
        for decl in &block.decls {
            if let Decl::Class(def) = decl {
                if let Some(superclass) = &def.superclass {
                    if self.env.find(superclass).is_none() {
                        return Err(self.resolve_err(
                            format!("Undefined superclass '{}'", superclass),
                            def.line,
                        ));
                    }
                }
            }
        }
        for stmt in &mut block.stmts {
            self.resolve_stmt(stmt)?;
        }
        Ok(())
    }

    fn resolve_stmt(&mut self, stmt: &mut Stmt) -> BrioResult<()> {
        match stmt {
            Stmt::Expr { expr, .. } => self.resolve_expr(expr),
            Stmt::If {
                cond,
                then_block,
                else_block,
                ..
            } => {
                self.resolve_expr(cond)?;
                if let Some(block) = then_block {
                    self.resolve_block(block, false)?;
                }
                if let Some(block) = else_block {
                    self.resolve_block(block, false)?;
                }
                Ok(())
            }
            Stmt::While { cond, body, .. } => {
                self.resolve_expr(cond)?;
                if let Some(block) = body {
                    self.resolve_block(block, false)?;
                }
                Ok(())
            }
            Stmt::For {
                var,
                var_slot,
                iterable,
                body,
                line,
            } => {
                self.resolve_expr(iterable)?;
                let line = *line;
                let slot = {
                    let builder = self.builder();
                    builder.alloc_local()
                }
                .map_err(|e| self.limit(e, line))?;
                var_slot.set(slot);
                let method_id = self.env.current_method_id();
                self.env.push(Scope::For {
                    name: var.clone(),
                    slot,
                    method_id,
                });
                let result = match body {
                    Some(block) => self.resolve_block(block, false),
                    None => Ok(()),
                };
                self.env.pop();
                result
            }
            Stmt::Return { value, .. } => {
                if let Some(expr) = value {
                    self.resolve_expr(expr)?;
                }
                Ok(())
            }
            Stmt::Break { .. } | Stmt::Continue { .. } => Ok(()),
            Stmt::Import { name, line } => {
                self.find_autodeclaring(name, *line)?;
                Ok(())
            }
            Stmt::Export { name, line } => match self.env.find(name) {
                Some(NameRef::Local {
                    module_level: true, ..
                }) => Ok(()),
                Some(_) => Err(self.resolve_err(
                    format!("Only module-level bindings can be exported, not '{}'", name),
                    *line,
                )),
                None => Err(self.resolve_err(format!("Undefined name '{}'", name), *line)),
            },
        }
    }

    fn resolve_expr(&mut self, expr: &mut Expr) -> BrioResult<()> {
        match expr {
            Expr::Identifier { name, line } => {
                let line = *line;
                let target = self
                    .env
                    .find(name)
                    .ok_or_else(|| self.resolve_err(format!("Undefined name '{}'", name), line))?;
                *expr = Expr::Resolved { target, line };
                Ok(())
            }
            Expr::SelfExpr { line } => {
                *expr = Expr::Resolved {
                    target: NameRef::RawSlot(0),
                    line: *line,
                };
                Ok(())
            }
            Expr::Assign { target, value, .. } => {
                // The value resolves first: reading a still-unbound name
                // on the right-hand side is an error, not an
                // autodeclaration
                self.resolve_expr(value)?;
                if let Expr::Identifier { name, line } = &**target {
                    let name = name.clone();
                    let line = *line;
                    let resolved = self.find_autodeclaring(&name, line)?;
                    **target = Expr::Resolved {
                        target: resolved,
                        line,
                    };
                    Ok(())
                } else {
                    self.resolve_expr(target)
                }
            }
            Expr::Interp { parts, .. } => {
                for part in parts {
                    if let InterpPart::Expr(inner) = part {
                        self.resolve_expr(inner)?;
                    }
                }
                Ok(())
            }
            Expr::List { elements, .. } => {
                for element in elements {
                    self.resolve_expr(element)?;
                }
                Ok(())
            }
            Expr::MapLit { entries, .. } => {
                for (_, value) in entries {
                    self.resolve_expr(value)?;
                }
                Ok(())
            }
            Expr::Binary { left, right, .. } => {
                self.resolve_expr(left)?;
                self.resolve_expr(right)
            }
            Expr::Unary { operand, .. } => self.resolve_expr(operand),
            Expr::ShortCircuit { left, right, .. } => {
                self.resolve_expr(left)?;
                self.resolve_expr(right)
            }
            Expr::Call { receiver, args, .. } => {
                self.resolve_expr(receiver)?;
                for arg in args {
                    self.resolve_expr(arg)?;
                }
                Ok(())
            }
            Expr::SuperCall { args, line, .. } => {
                if !self.builders.last().map_or(false, |b| b.is_method) {
                    return Err(self.syntax("'super' outside of a method", *line));
                }
                for arg in args {
                    self.resolve_expr(arg)?;
                }
                Ok(())
            }
            Expr::FunctionCall { callee, args, .. } => {
                self.resolve_expr(callee)?;
                for arg in args {
                    self.resolve_expr(arg)?;
                }
                Ok(())
            }
            Expr::Index { object, index, .. } => {
                self.resolve_expr(object)?;
                self.resolve_expr(index)
            }
            Expr::Nil { .. }
            | Expr::Bool { .. }
            | Expr::Int { .. }
            | Expr::Float { .. }
            | Expr::Str { .. }
            | Expr::Resolved { .. } => Ok(()),
        }
    }

    /// Assignment-target lookup: the full outward walk first; only when
    /// the whole chain (globals included) fails is a fresh binding created
    /// in the outermost non-global block of the current method.
    fn find_autodeclaring(&mut self, name: &Arc<str>, line: usize) -> BrioResult<NameRef> {
        if let Some(found) = self.env.find(name) {
            return Ok(found);
        }
        let slot = self
            .builder()
            .alloc_local()
            .map_err(|e| self.limit(e, line))?;
        Ok(self.env.declare_in_outermost_block(name, slot))
    }

    // ==================== Emit pass ====================

    fn emit_block(&mut self, block: &mut Block, module_level: bool) -> BrioResult<()> {
        let method_id = self.env.current_method_id();
        self.env.push(Scope::Block {
            locals: block.locals.clone(),
            method_id,
            module_level,
        });
        let result = self.emit_block_inner(block);
        self.env.pop();
        result
    }

    fn emit_block_inner(&mut self, block: &mut Block) -> BrioResult<()> {
        // Declarations install at block entry, in source order, so
        // statements anywhere in the block can reach them
        for decl in &mut block.decls {
            match decl {
                Decl::Function(def) => {
                    let line = def.line;
                    let name = def.name.clone();
                    let method = self.compile_function(def, false)?;
                    let literal = self.literal(Value::Function(method), line)?;
                    let target = self.env.find(&name).ok_or_else(|| {
                        self.resolve_err(format!("Undefined name '{}'", name), line)
                    })?;
                    self.emit_store_ref(&target, literal, line)?;
                }
                Decl::Class(def) => self.emit_class(def)?,
            }
        }
        for stmt in &mut block.stmts {
            self.emit_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_function(
        &mut self,
        def: &mut FunctionDef,
        is_method: bool,
    ) -> BrioResult<Rc<Method>> {
        self.begin_method(def.name.clone(), &def.params, is_method);
        if let Some(body) = def.body.as_mut() {
            let method_id = self.env.current_method_id();
            self.env.push(Scope::Block {
                locals: body.locals.clone(),
                method_id,
                module_level: false,
            });
            let result = self
                .resolve_block_inner(body)
                .and_then(|_| self.emit_block_inner(body));
            self.env.pop();
            result?;
        }
        let nil = self.literal(Value::Nil, def.line)?;
        let builder = self.builder();
        builder.set_line(def.line);
        builder.emit_op(OpCode::Return);
        builder.operand(nil);
        Ok(Rc::new(self.end_method()))
    }

    fn emit_class(&mut self, def: &mut ClassDef) -> BrioResult<()> {
        let line = def.line;
        let mark = self.builder().mark();

        let super_ref = match def.superclass.clone() {
            Some(name) => {
                let target = self.env.find(&name).ok_or_else(|| {
                    self.resolve_err(format!("Undefined superclass '{}'", name), line)
                })?;
                self.emit_load_ref(&target, line)?
            }
            // The absent marker distinguishes "no superclass" from a
            // binding that is still nil at class-construction time
            None => self.literal(Value::Absent, line)?,
        };

        let mut methods = Vec::new();
        for method_def in &mut def.methods {
            let compiled = self.compile_function(method_def, true)?;
            methods.push((method_def.name.clone(), compiled));
        }

        let proto = Value::Proto(Rc::new(ClassProto {
            name: def.name.clone(),
            ivars: def.ivars.clone(),
            methods,
        }));
        let proto_ref = self.literal(proto, line)?;
        let dst = self
            .builder()
            .alloc_temp(1)
            .map_err(|e| self.limit(e, line))?;

        let builder = self.builder();
        builder.set_line(line);
        builder.emit_op(OpCode::MakeClass);
        builder.operand(dst as i8);
        builder.operand(proto_ref);
        builder.operand(super_ref);

        let target = self
            .env
            .find(&def.name)
            .ok_or_else(|| self.resolve_err(format!("Undefined name '{}'", def.name), line))?;
        self.emit_store_ref(&target, dst as i8, line)?;
        self.builder().reset(mark);
        Ok(())
    }

    fn emit_stmt(&mut self, stmt: &mut Stmt) -> BrioResult<()> {
        let line = stmt.line();
        self.builder().set_line(line);
        let mark = self.builder().mark();
        match stmt {
            Stmt::Expr { expr, .. } => {
                self.emit_expr(expr)?;
            }
            Stmt::If {
                cond,
                then_block,
                else_block,
                ..
            } => {
                let cond_slot = self.emit_expr(cond)?;
                match (then_block.as_mut(), else_block.as_mut()) {
                    (Some(then_block), else_block) => {
                        let skip_then =
                            self.builder().emit_branch(OpCode::BranchIfFalse, cond_slot);
                        self.builder().reset(mark);
                        self.emit_block(then_block, false)?;
                        if let Some(else_block) = else_block {
                            let skip_else = self.builder().emit_jump();
                            self.builder()
                                .patch(skip_then)
                                .map_err(|e| self.limit(e, line))?;
                            self.emit_block(else_block, false)?;
                            self.builder()
                                .patch(skip_else)
                                .map_err(|e| self.limit(e, line))?;
                        } else {
                            self.builder()
                                .patch(skip_then)
                                .map_err(|e| self.limit(e, line))?;
                        }
                    }
                    (None, Some(else_block)) => {
                        // Only an else branch: a single branch-if-true
                        // over the else body
                        let skip_else =
                            self.builder().emit_branch(OpCode::BranchIfTrue, cond_slot);
                        self.builder().reset(mark);
                        self.emit_block(else_block, false)?;
                        self.builder()
                            .patch(skip_else)
                            .map_err(|e| self.limit(e, line))?;
                    }
                    (None, None) => {}
                }
            }
            Stmt::While { cond, body, .. } => {
                let start = self.builder().here();
                let cond_slot = self.emit_expr(cond)?;
                let exit = self.builder().emit_branch(OpCode::BranchIfFalse, cond_slot);
                self.builder().reset(mark);

                self.builder().loops.push(LoopCtx {
                    start,
                    breaks: Vec::new(),
                });
                if let Some(block) = body {
                    self.emit_block(block, false)?;
                }
                self.builder()
                    .emit_loop_back(start)
                    .map_err(|e| self.limit(e, line))?;
                let ctx = self.builder().loops.pop().expect("loop context");
                self.builder().patch(exit).map_err(|e| self.limit(e, line))?;
                for site in ctx.breaks {
                    self.builder().patch(site).map_err(|e| self.limit(e, line))?;
                }
            }
            Stmt::For {
                var_slot,
                iterable,
                body,
                ..
            } => {
                let var_slot = var_slot.get();
                // it = iterable.iter()
                let iterator = self.emit_call(
                    CallReceiver::Expr(iterable),
                    "iter",
                    &mut [],
                    line,
                    false,
                )?;
                let loop_mark = self.builder().mark();

                let start = self.builder().here();
                // next = it.next(); exit once the absent marker comes back
                let next = self.emit_call(
                    CallReceiver::Slot(iterator),
                    "next",
                    &mut [],
                    line,
                    false,
                )?;
                let absent = self.literal(Value::Absent, line)?;
                let cmp = self
                    .builder()
                    .alloc_temp(1)
                    .map_err(|e| self.limit(e, line))?;
                let builder = self.builder();
                builder.emit_op(OpCode::Equal);
                builder.operand(cmp as i8);
                builder.operand(next);
                builder.operand(absent);
                let exit = self.builder().emit_branch(OpCode::BranchIfTrue, cmp as i8);
                self.builder().copy(var_slot, next);
                self.builder().reset(loop_mark);

                self.builder().loops.push(LoopCtx {
                    start,
                    breaks: Vec::new(),
                });
                if let Some(block) = body {
                    self.emit_block(block, false)?;
                }
                self.builder()
                    .emit_loop_back(start)
                    .map_err(|e| self.limit(e, line))?;
                let ctx = self.builder().loops.pop().expect("loop context");
                self.builder().patch(exit).map_err(|e| self.limit(e, line))?;
                for site in ctx.breaks {
                    self.builder().patch(site).map_err(|e| self.limit(e, line))?;
                }
            }
            Stmt::Return { value, .. } => {
                let result = match value {
                    Some(expr) => self.emit_expr(expr)?,
                    None => self.literal(Value::Nil, line)?,
                };
                let builder = self.builder();
                builder.emit_op(OpCode::Return);
                builder.operand(result);
            }
            Stmt::Break { .. } => {
                if self.builder().loops.is_empty() {
                    return Err(self.syntax("'break' outside of a loop", line));
                }
                let site = self.builder().emit_jump();
                self.builder()
                    .loops
                    .last_mut()
                    .expect("loop context")
                    .breaks
                    .push(site);
            }
            Stmt::Continue { .. } => {
                let Some(start) = self.builder().loops.last().map(|ctx| ctx.start) else {
                    return Err(self.syntax("'continue' outside of a loop", line));
                };
                self.builder()
                    .emit_loop_back(start)
                    .map_err(|e| self.limit(e, line))?;
            }
            Stmt::Import { name, .. } => {
                let name = name.clone();
                let name_lit = self.name_literal(&name, line)?;
                let target = self.env.find(&name).ok_or_else(|| {
                    self.resolve_err(format!("Undefined name '{}'", name), line)
                })?;
                match target {
                    NameRef::Local { slot, .. } => {
                        let builder = self.builder();
                        builder.emit_op(OpCode::Import);
                        builder.operand(slot as i8);
                        builder.operand(name_lit);
                    }
                    other => {
                        let dst = self
                            .builder()
                            .alloc_temp(1)
                            .map_err(|e| self.limit(e, line))?;
                        let builder = self.builder();
                        builder.emit_op(OpCode::Import);
                        builder.operand(dst as i8);
                        builder.operand(name_lit);
                        self.emit_store_ref(&other, dst as i8, line)?;
                    }
                }
            }
            Stmt::Export { name, .. } => {
                let name = name.clone();
                let target = self.env.find(&name).ok_or_else(|| {
                    self.resolve_err(format!("Undefined name '{}'", name), line)
                })?;
                let NameRef::Local { slot, .. } = target else {
                    return Err(self.resolve_err(
                        format!("Only module-level bindings can be exported, not '{}'", name),
                        line,
                    ));
                };
                let name_lit = self.name_literal(&name, line)?;
                let builder = self.builder();
                builder.emit_op(OpCode::Export);
                builder.operand(name_lit);
                builder.operand(slot as i8);
            }
        }
        self.builder().reset(mark);
        Ok(())
    }

    // ---- expressions ----

    /// Emit one expression; the returned operand addresses its result
    /// (a frame slot, or a literal for constant expressions).
    fn emit_expr(&mut self, expr: &mut Expr) -> BrioResult<i8> {
        let line = expr.line();
        self.builder().set_line(line);
        match expr {
            Expr::Nil { .. } => self.literal(Value::Nil, line),
            Expr::Bool { value, .. } => {
                let value = *value;
                self.literal(Value::Bool(value), line)
            }
            Expr::Int { value, .. } => {
                let value = *value;
                self.literal(Value::Int(value), line)
            }
            Expr::Float { value, .. } => {
                let value = *value;
                self.literal(Value::Float(value), line)
            }
            Expr::Str { value, .. } => {
                let value = value.clone();
                self.literal(Value::Str(value), line)
            }
            Expr::Interp { .. } => self.emit_interp(expr),
            Expr::List { .. } => self.emit_list(expr),
            Expr::MapLit { .. } => self.emit_map(expr),
            Expr::Resolved { target, .. } => {
                let target = target.clone();
                self.emit_load_ref(&target, line)
            }
            Expr::Identifier { name, .. } => Err(BrioError::internal(
                format!("Unresolved identifier '{}' reached emission", name),
                Span::line(line),
                self.file.as_ref(),
            )),
            Expr::SelfExpr { .. } => Ok(0),
            Expr::Binary {
                op, left, right, ..
            } => {
                let opcode = binary_opcode(*op);
                let left_slot = self.emit_expr(left)?;
                let right_slot = self.emit_expr(right)?;
                let dst = self
                    .builder()
                    .alloc_temp(1)
                    .map_err(|e| self.limit(e, line))?;
                let builder = self.builder();
                builder.emit_op(opcode);
                builder.operand(dst as i8);
                builder.operand(left_slot);
                builder.operand(right_slot);
                Ok(dst as i8)
            }
            Expr::Unary { op, operand, .. } => {
                let opcode = match op {
                    UnaryOp::Negate => OpCode::Negate,
                    UnaryOp::Not => OpCode::Not,
                    UnaryOp::BitNot => OpCode::BitNot,
                };
                let operand_slot = self.emit_expr(operand)?;
                let dst = self
                    .builder()
                    .alloc_temp(1)
                    .map_err(|e| self.limit(e, line))?;
                let builder = self.builder();
                builder.emit_op(opcode);
                builder.operand(dst as i8);
                builder.operand(operand_slot);
                Ok(dst as i8)
            }
            Expr::ShortCircuit {
                op, left, right, ..
            } => {
                let dst = self
                    .builder()
                    .alloc_temp(1)
                    .map_err(|e| self.limit(e, line))?;
                let mark = self.builder().mark();
                let left_slot = self.emit_expr(left)?;
                self.builder().copy(dst, left_slot);
                self.builder().reset(mark);
                let branch = match op {
                    ShortCircuitOp::And => OpCode::BranchIfFalse,
                    ShortCircuitOp::Or => OpCode::BranchIfTrue,
                };
                let site = self.builder().emit_branch(branch, dst as i8);
                let right_slot = self.emit_expr(right)?;
                self.builder().copy(dst, right_slot);
                self.builder().reset(mark);
                self.builder().patch(site).map_err(|e| self.limit(e, line))?;
                Ok(dst as i8)
            }
            Expr::Assign { target, value, .. } => {
                let value_slot = self.emit_expr(value)?;
                self.emit_set(target, value_slot, line)?;
                Ok(value_slot)
            }
            Expr::Call {
                receiver,
                name,
                args,
                ..
            } => {
                let name = name.clone();
                self.emit_call(CallReceiver::Expr(&mut **receiver), &name, args, line, false)
            }
            Expr::SuperCall { name, args, .. } => {
                let name = name.clone();
                self.emit_call(CallReceiver::SelfSlot, &name, args, line, true)
            }
            Expr::FunctionCall { callee, args, .. } => {
                self.emit_call(CallReceiver::Expr(&mut **callee), "call", args, line, false)
            }
            Expr::Index { object, index, .. } => {
                let mut args = [(**index).clone()];
                self.emit_call(CallReceiver::Expr(&mut **object), "get", &mut args, line, false)
            }
        }
    }

    fn emit_interp(&mut self, expr: &mut Expr) -> BrioResult<i8> {
        let Expr::Interp { parts, line } = expr else {
            unreachable!();
        };
        let line = *line;
        let dst = self
            .builder()
            .alloc_temp(1)
            .map_err(|e| self.limit(e, line))?;
        let mark = self.builder().mark();

        // Seed with leading text when present so most strings need one
        // concatenation per segment
        let leading = match parts.first() {
            Some(InterpPart::Text(text)) => Some(text.clone()),
            _ => None,
        };
        let mut rest = parts.iter_mut();
        let seed = match leading {
            Some(text) => {
                rest.next();
                self.literal(Value::Str(text), line)?
            }
            None => self.literal(Value::Str(intern("")), line)?,
        };
        self.builder().copy(dst, seed);

        for part in rest {
            let part_slot = match part {
                InterpPart::Text(text) => {
                    let text = text.clone();
                    self.literal(Value::Str(text), line)?
                }
                InterpPart::Expr(inner) => self.emit_expr(inner)?,
            };
            let builder = self.builder();
            builder.emit_op(OpCode::Add);
            builder.operand(dst as i8);
            builder.operand(dst as i8);
            builder.operand(part_slot);
            builder.reset(mark);
        }
        Ok(dst as i8)
    }

    fn emit_list(&mut self, expr: &mut Expr) -> BrioResult<i8> {
        let Expr::List { elements, line } = expr else {
            unreachable!();
        };
        let line = *line;
        let count = elements.len();
        let base = self
            .builder()
            .alloc_temp(count.max(1))
            .map_err(|e| self.limit(e, line))?;
        let reserved_end = self.builder().mark();
        for (ix, element) in elements.iter_mut().enumerate() {
            let slot = self.emit_expr(element)?;
            self.builder().copy(base + ix as u8, slot);
            self.builder().reset(reserved_end);
        }
        let builder = self.builder();
        builder.emit_op(OpCode::BuildList);
        builder.operand(base as i8);
        builder.operand(base as i8);
        builder.raw(count as u8);
        builder.reset(base + 1);
        Ok(base as i8)
    }

    fn emit_map(&mut self, expr: &mut Expr) -> BrioResult<i8> {
        let Expr::MapLit { entries, line } = expr else {
            unreachable!();
        };
        let line = *line;
        let count = entries.len();
        let base = self
            .builder()
            .alloc_temp((count * 2).max(1))
            .map_err(|e| self.limit(e, line))?;
        let reserved_end = self.builder().mark();
        for (ix, (key, value)) in entries.iter_mut().enumerate() {
            let key = key.clone();
            let key_lit = self.literal(Value::Str(key), line)?;
            self.builder().copy(base + (ix * 2) as u8, key_lit);
            let value_slot = self.emit_expr(value)?;
            self.builder().copy(base + (ix * 2) as u8 + 1, value_slot);
            self.builder().reset(reserved_end);
        }
        let builder = self.builder();
        builder.emit_op(OpCode::BuildMap);
        builder.operand(base as i8);
        builder.operand(base as i8);
        builder.raw(count as u8);
        builder.reset(base + 1);
        Ok(base as i8)
    }

    /// Emit a method call: reserve the saved-area, receiver, and argument
    /// slots contiguously, fill them in order, then issue the call opcode
    /// selected by argument count. The result lands in the base slot.
    fn emit_call(
        &mut self,
        receiver: CallReceiver<'_>,
        name: &str,
        args: &mut [Expr],
        line: usize,
        is_super: bool,
    ) -> BrioResult<i8> {
        let argc = args.len();
        let base = self
            .builder()
            .alloc_temp(SAVED_SLOTS + 1 + argc)
            .map_err(|e| self.limit(e, line))?;
        let reserved_end = self.builder().mark();
        let receiver_slot = base + SAVED_SLOTS as u8;

        match receiver {
            CallReceiver::Expr(expr) => {
                let slot = self.emit_expr(expr)?;
                self.builder().copy(receiver_slot, slot);
            }
            CallReceiver::Slot(slot) => self.builder().copy(receiver_slot, slot),
            CallReceiver::SelfSlot => self.builder().copy(receiver_slot, 0),
        }
        self.builder().reset(reserved_end);

        for (ix, arg) in args.iter_mut().enumerate() {
            let slot = self.emit_expr(arg)?;
            self.builder().copy(receiver_slot + 1 + ix as u8, slot);
            self.builder().reset(reserved_end);
        }

        let name_lit = self.name_literal(name, line)?;
        let builder = self.builder();
        builder.set_line(line);
        if is_super {
            builder.emit_op(OpCode::SuperCall);
            builder.raw(argc as u8);
            builder.operand(name_lit);
            builder.operand(base as i8);
        } else {
            builder.emit_op(OpCode::call_with_argc(argc));
            builder.operand(name_lit);
            builder.operand(base as i8);
        }
        builder.reset(base + 1);
        Ok(base as i8)
    }

    /// Store a value into an assignment target.
    fn emit_set(&mut self, target: &mut Expr, value: i8, line: usize) -> BrioResult<()> {
        match target {
            Expr::Resolved { target, .. } => {
                let target = target.clone();
                self.emit_store_ref(&target, value, line)
            }
            Expr::Call {
                receiver,
                name,
                args,
                ..
            } if args.is_empty() => {
                let name = name.clone();
                let mark = self.builder().mark();
                let object = self.emit_expr(receiver)?;
                let name_lit = self.name_literal(&name, line)?;
                let builder = self.builder();
                builder.emit_op(OpCode::SetMember);
                builder.operand(object);
                builder.operand(name_lit);
                builder.operand(value);
                builder.reset(mark);
                Ok(())
            }
            Expr::Index { object, index, .. } => {
                // Dispatches set(index, value); the value is already in a
                // slot, so the call is laid out by hand
                let mark = self.builder().mark();
                let base = self
                    .builder()
                    .alloc_temp(SAVED_SLOTS + 3)
                    .map_err(|e| self.limit(e, line))?;
                let reserved_end = self.builder().mark();
                let receiver_slot = base + SAVED_SLOTS as u8;
                let object_slot = self.emit_expr(object)?;
                self.builder().copy(receiver_slot, object_slot);
                self.builder().reset(reserved_end);
                let index_slot = self.emit_expr(index)?;
                self.builder().copy(receiver_slot + 1, index_slot);
                self.builder().reset(reserved_end);
                self.builder().copy(receiver_slot + 2, value);
                let name_lit = self.name_literal("set", line)?;
                let builder = self.builder();
                builder.emit_op(OpCode::call_with_argc(2));
                builder.operand(name_lit);
                builder.operand(base as i8);
                builder.reset(mark);
                Ok(())
            }
            _ => Err(BrioError::internal(
                "Assignment target does not support stores",
                Span::line(line),
                self.file.as_ref(),
            )),
        }
    }

    fn emit_load_ref(&mut self, target: &NameRef, line: usize) -> BrioResult<i8> {
        match target {
            NameRef::Local { slot, .. } => Ok(*slot as i8),
            NameRef::RawSlot(slot) => Ok(*slot as i8),
            NameRef::Global(name) => {
                let name_lit = self.name_literal(name, line)?;
                let dst = self
                    .builder()
                    .alloc_temp(1)
                    .map_err(|e| self.limit(e, line))?;
                let builder = self.builder();
                builder.emit_op(OpCode::LoadGlobal);
                builder.operand(dst as i8);
                builder.operand(name_lit);
                Ok(dst as i8)
            }
            NameRef::Upvalue { capture, slot } => {
                let id_lit = self.literal(Value::Int(*capture as i64), line)?;
                let dst = self
                    .builder()
                    .alloc_temp(1)
                    .map_err(|e| self.limit(e, line))?;
                let builder = self.builder();
                builder.emit_op(OpCode::GetUpvalue);
                builder.operand(dst as i8);
                builder.operand(id_lit);
                builder.raw(*slot);
                Ok(dst as i8)
            }
        }
    }

    fn emit_store_ref(&mut self, target: &NameRef, value: i8, line: usize) -> BrioResult<()> {
        match target {
            NameRef::Local { slot, .. } => {
                let slot = *slot;
                self.builder().copy(slot, value);
            }
            NameRef::RawSlot(slot) => {
                let slot = *slot;
                self.builder().copy(slot, value);
            }
            NameRef::Global(name) => {
                let name = name.clone();
                let name_lit = self.name_literal(&name, line)?;
                let builder = self.builder();
                builder.emit_op(OpCode::StoreGlobal);
                builder.operand(name_lit);
                builder.operand(value);
            }
            NameRef::Upvalue { capture, slot } => {
                let capture = *capture;
                let slot = *slot;
                let id_lit = self.literal(Value::Int(capture as i64), line)?;
                let builder = self.builder();
                builder.emit_op(OpCode::SetUpvalue);
                builder.operand(id_lit);
                builder.raw(slot);
                builder.operand(value);
            }
        }
        Ok(())
    }
}

fn binary_opcode(op: BinaryOp) -> OpCode {
    match op {
        BinaryOp::Add => OpCode::Add,
        BinaryOp::Sub => OpCode::Sub,
        BinaryOp::Mul => OpCode::Mul,
        BinaryOp::Div => OpCode::Div,
        BinaryOp::Mod => OpCode::Mod,
        BinaryOp::Equal => OpCode::Equal,
        BinaryOp::NotEqual => OpCode::NotEqual,
        BinaryOp::Less => OpCode::Less,
        BinaryOp::LessEqual => OpCode::LessEqual,
        BinaryOp::Greater => OpCode::Greater,
        BinaryOp::GreaterEqual => OpCode::GreaterEqual,
        BinaryOp::BitAnd => OpCode::BitAnd,
        BinaryOp::BitOr => OpCode::BitOr,
        BinaryOp::BitXor => OpCode::BitXor,
        BinaryOp::Shl => OpCode::Shl,
        BinaryOp::Shr => OpCode::Shr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn compile_source(source: &str) -> BrioResult<Rc<Method>> {
        let program = Parser::new(source, "<test>").parse()?;
        let globals = Rc::new(RefCell::new(Globals::new()));
        globals.borrow_mut().define("print", Value::Nil);
        let ids = Rc::new(Cell::new(0));
        compile(program, &globals, &ids, "<test>")
    }

    /// Decode a method's opcode sequence.
    fn opcodes(method: &Method) -> Vec<OpCode> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < method.code.len() {
            let op = OpCode::from(method.code[offset]);
            out.push(op);
            offset += 1 + op.operand_count();
        }
        out
    }

    fn function_literals(method: &Method) -> Vec<Rc<Method>> {
        method
            .literals
            .iter()
            .filter_map(|value| match value {
                Value::Function(inner) => Some(inner.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_autodeclaration_hoists_to_function_scope() {
        // x assigned only inside the if body must still resolve at the
        // function's top level
        let method = compile_source("fn f()\n  if true\n    x = 5\n  return x\n").unwrap();
        let function = &function_literals(&method)[0];
        assert_eq!(function.name.as_ref(), "f");
    }

    #[test]
    fn test_undefined_name_is_resolve_error() {
        let err = compile_source("y + 1\n").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Resolve);
        assert!(err.message.contains("Undefined name 'y'"));
    }

    #[test]
    fn test_slot_counter_rollback_bounds_peak() {
        let one = compile_source("a = 1\nb = 2\nc = 3\nd = a + b + c\n").unwrap();
        let three = compile_source(
            "a = 1\nb = 2\nc = 3\nd = a + b + c\nd = a + b + c\nd = a + b + c\n",
        )
        .unwrap();
        assert_eq!(one.max_slots, three.max_slots);
    }

    #[test]
    fn test_else_only_if_compiles_to_branch_if_true() {
        let method = compile_source("x = 1\nif x\nelse\n  x = 2\n").unwrap();
        let ops = opcodes(&method);
        assert_eq!(
            ops.iter().filter(|op| **op == OpCode::BranchIfTrue).count(),
            1
        );
        assert!(!ops.contains(&OpCode::BranchIfFalse));
        assert!(!ops.contains(&OpCode::Jump));
    }

    #[test]
    fn test_if_else_branch_shape() {
        let method = compile_source("x = 1\nif x\n  x = 2\nelse\n  x = 3\n").unwrap();
        let ops = opcodes(&method);
        assert!(ops.contains(&OpCode::BranchIfFalse));
        assert!(ops.contains(&OpCode::Jump));
    }

    #[test]
    fn test_upvalue_compilation() {
        let method = compile_source(
            "fn outer()\n  v = 1\n  fn inner()\n    return v\n  return inner\n",
        )
        .unwrap();
        let outer = &function_literals(&method)[0];
        assert!(outer.creates_captures);
        let inner = &function_literals(outer)[0];
        assert!(opcodes(inner).contains(&OpCode::GetUpvalue));
        assert!(!inner.creates_captures);
    }

    #[test]
    fn test_upvalue_write_compiles_set_upvalue() {
        let method = compile_source(
            "fn outer()\n  v = 1\n  fn bump()\n    v = v + 1\n  bump()\n  return v\n",
        )
        .unwrap();
        let outer = &function_literals(&method)[0];
        let inner = &function_literals(outer)[0];
        let ops = opcodes(inner);
        assert!(ops.contains(&OpCode::GetUpvalue));
        assert!(ops.contains(&OpCode::SetUpvalue));
    }

    #[test]
    fn test_call_opcode_carries_argument_count() {
        let method = compile_source("x = 1\nx.blend(1, 2, 3)\n").unwrap();
        let ops = opcodes(&method);
        assert!(ops.contains(&OpCode::Call3));
    }

    #[test]
    fn test_literal_pool_overflow_is_syntax_error() {
        let mut source = String::new();
        for i in 0..130 {
            source.push_str(&format!("x = {}\n", i));
        }
        let err = compile_source(&source).unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Syntax);
        assert!(err.message.contains("literals"));
    }

    #[test]
    fn test_break_outside_loop_is_syntax_error() {
        let err = compile_source("break\n").unwrap_err();
        assert!(err.message.contains("break"));
    }

    #[test]
    fn test_super_outside_method_is_syntax_error() {
        let err = compile_source("fn f()\n  super.go()\n").unwrap_err();
        assert!(err.message.contains("super"));
    }

    #[test]
    fn test_export_requires_module_level_binding() {
        let err = compile_source("fn f()\n  y = 1\n  export y\n").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Resolve);
    }

    #[test]
    fn test_export_of_module_binding_compiles() {
        let method = compile_source("y = 1\nexport y\n").unwrap();
        assert!(opcodes(&method).contains(&OpCode::Export));
    }

    #[test]
    fn test_class_with_undefined_superclass_fails() {
        let err = compile_source("class Dog extends Animal\n  var name\n").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Resolve);
        assert!(err.message.contains("superclass"));
    }

    #[test]
    fn test_class_emits_make_class() {
        let method =
            compile_source("class Point\n  var x\n  fn init(x)\n    self.x = x\n").unwrap();
        assert!(opcodes(&method).contains(&OpCode::MakeClass));
    }

    #[test]
    fn test_for_loop_uses_iteration_protocol() {
        let method = compile_source("total = 0\nfor x in [1, 2, 3]\n  total = total + x\n")
            .unwrap();
        let ops = opcodes(&method);
        // iter() then next() inside the loop
        assert!(ops.iter().filter(|op| **op == OpCode::Call0).count() >= 2);
        assert!(ops.contains(&OpCode::BranchIfTrue));
    }

    #[test]
    fn test_duplicate_literals_not_merged() {
        let method = compile_source("x = 7\ny = 7\n").unwrap();
        let sevens = method
            .literals
            .iter()
            .filter(|value| matches!(value, Value::Int(7)))
            .count();
        assert_eq!(sevens, 2);
    }
}
