// Brio Compiled Method
// One compiled unit: bytecode, literal pool, arity, and the peak frame
// size reached during compilation. Immutable once compilation finishes.

use super::opcode::OpCode;
use crate::vm::value::Value;
use std::fmt;
use std::sync::Arc;

/// A compiled method (also used for free functions and module bodies)
pub struct Method {
    pub name: Arc<str>,
    /// Capture identity: tags the runtime capture-frame list so upvalue
    /// accesses can locate the live frame that owns their slot
    pub id: u32,
    pub arity: u8,
    pub code: Vec<u8>,
    /// Constants, referenced by negative operand bytes
    pub literals: Vec<Value>,
    /// Peak frame-slot count: receiver + arguments + locals + temporaries
    pub max_slots: u8,
    /// Whether nested functions capture this method's locals; when set the
    /// VM publishes a capture frame for the duration of each call
    pub creates_captures: bool,
    /// Source line per code byte, for error reporting
    pub lines: Vec<u32>,
    pub file: Arc<str>,
}

impl Method {
    pub fn line_at(&self, offset: usize) -> usize {
        self.lines.get(offset).copied().unwrap_or(0) as usize
    }

    /// Read an operand byte as a signed slot/literal reference.
    pub fn operand(&self, offset: usize) -> i8 {
        self.code[offset] as i8
    }

    /// Render the method (and nested function literals) for debugging.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        self.disassemble_into(&mut out, 0);
        out
    }

    fn disassemble_into(&self, out: &mut String, indent: usize) {
        use std::fmt::Write;

        let prefix = "  ".repeat(indent);
        let _ = writeln!(
            out,
            "{}--- {} ({} args, {} slots, {} bytes, {} literals) ---",
            prefix,
            self.name,
            self.arity,
            self.max_slots,
            self.code.len(),
            self.literals.len()
        );

        let mut offset = 0;
        while offset < self.code.len() {
            offset = self.disassemble_instruction(out, offset, &prefix);
        }

        for literal in &self.literals {
            if let Value::Function(method) = literal {
                method.disassemble_into(out, indent + 1);
            }
        }
    }

    fn disassemble_instruction(&self, out: &mut String, offset: usize, prefix: &str) -> usize {
        use std::fmt::Write;

        let line = self.line_at(offset);
        if offset > 0 && line == self.line_at(offset - 1) {
            let _ = write!(out, "{}{:04}      ", prefix, offset);
        } else {
            let _ = write!(out, "{}{:04} {:4} ", prefix, offset, line);
        }

        let op = OpCode::from(self.code[offset]);
        let operands: Vec<String> = (0..op.operand_count())
            .map(|i| self.format_operand(op, i, offset + 1 + i))
            .collect();

        let name = if let Some(argc) = op.call_argc() {
            format!("call/{}", argc)
        } else {
            format!("{:?}", op).to_lowercase()
        };
        let _ = writeln!(out, "{:<14} {}", name, operands.join(", "));

        offset + 1 + op.operand_count()
    }

    fn format_operand(&self, op: OpCode, position: usize, offset: usize) -> String {
        use OpCode::*;
        let byte = self.code[offset];

        // Raw immediates: branch offsets, counts, upvalue slots
        let raw = matches!(
            (op, position),
            (Jump, 0)
                | (BranchIfTrue, 1)
                | (BranchIfFalse, 1)
                | (BuildList, 2)
                | (BuildMap, 2)
                | (GetUpvalue, 2)
                | (SetUpvalue, 1)
                | (SuperCall, 0)
        );
        if raw {
            if matches!(op, Jump | BranchIfTrue | BranchIfFalse) {
                let target = (offset as isize + 1) + (byte as i8) as isize;
                return format!("@{}", target);
            }
            return format!("#{}", byte);
        }

        let value = byte as i8;
        if value >= 0 {
            format!("[{}]", value)
        } else {
            let index = (-(value as i32) - 1) as usize;
            match self.literals.get(index) {
                Some(Value::Str(s)) if s.chars().count() > 24 => {
                    let short: String = s.chars().take(21).collect();
                    format!("\"{}...\"", short)
                }
                Some(Value::Str(s)) => format!("\"{}\"", s),
                Some(literal) => format!("{}", literal),
                None => format!("???[{}]", index),
            }
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<fn {}/{}>", self.name, self.arity)
    }
}
