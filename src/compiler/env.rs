// Brio Environment Chain
// Per-scope name resolution feeding the compiler. Exactly one chain is
// live per block being compiled; scopes are pushed before a block's body
// is processed and popped after.

use crate::ast::NameRef;
use crate::ordmap::OrderedMap;
use crate::vm::value::Globals;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

/// One scope in the chain
pub enum Scope {
    /// The global binding table; the outermost scope of every chain
    Global(Rc<RefCell<Globals>>),

    /// Root scope of one compiled method: parameter bindings plus the
    /// capture bookkeeping shared with the method's builder
    Method {
        id: u32,
        creates_captures: Rc<Cell<bool>>,
        params: Vec<(Arc<str>, u8)>,
    },

    /// A block's local-name table, shared with the Block AST node. The
    /// module body block is the same thing with module_level set: names
    /// resolved through it are marked module-level (exportable).
    Block {
        locals: Rc<RefCell<Option<OrderedMap<u8>>>>,
        method_id: u32,
        module_level: bool,
    },

    /// Single synthetic binding for a loop variable
    For {
        name: Arc<str>,
        slot: u8,
        method_id: u32,
    },
}

pub struct Environment {
    /// Outermost first; the chain grows and shrinks at the tail
    scopes: Vec<Scope>,
}

impl Environment {
    pub fn new(globals: Rc<RefCell<Globals>>) -> Self {
        Self {
            scopes: vec![Scope::Global(globals)],
        }
    }

    pub fn push(&mut self, scope: Scope) {
        self.scopes.push(scope);
    }

    pub fn pop(&mut self) {
        self.scopes.pop();
    }

    /// Capture id of the innermost method scope
    pub fn current_method_id(&self) -> u32 {
        for scope in self.scopes.iter().rev() {
            if let Scope::Method { id, .. } = scope {
                return *id;
            }
        }
        0
    }

    /// Plain lookup: walk outward from the innermost scope. A local found
    /// beyond the current method boundary becomes an upvalue reference and
    /// flags the owning method as a capture target.
    pub fn find(&self, name: &str) -> Option<NameRef> {
        let current = self.current_method_id();
        for scope in self.scopes.iter().rev() {
            match scope {
                Scope::Global(globals) => {
                    if globals.borrow().contains(name) {
                        return Some(NameRef::Global(Arc::from(name)));
                    }
                }
                Scope::Method { id, params, .. } => {
                    if let Some((_, slot)) = params.iter().find(|(n, _)| n.as_ref() == name) {
                        return Some(self.local_or_upvalue(*id, *slot, false, current));
                    }
                }
                Scope::Block {
                    locals,
                    method_id,
                    module_level,
                } => {
                    if let Some(map) = locals.borrow().as_ref() {
                        if let Some(&slot) = map.get(name) {
                            return Some(self.local_or_upvalue(
                                *method_id,
                                slot,
                                *module_level,
                                current,
                            ));
                        }
                    }
                }
                Scope::For {
                    name: var,
                    slot,
                    method_id,
                } => {
                    if var.as_ref() == name {
                        return Some(self.local_or_upvalue(*method_id, *slot, false, current));
                    }
                }
            }
        }
        None
    }

    fn local_or_upvalue(
        &self,
        owner_id: u32,
        slot: u8,
        module_level: bool,
        current: u32,
    ) -> NameRef {
        if owner_id == current {
            NameRef::Local { slot, module_level }
        } else {
            self.mark_captures(owner_id);
            NameRef::Upvalue {
                capture: owner_id,
                slot,
            }
        }
    }

    fn mark_captures(&self, owner_id: u32) {
        for scope in self.scopes.iter().rev() {
            if let Scope::Method {
                id,
                creates_captures,
                ..
            } = scope
            {
                if *id == owner_id {
                    creates_captures.set(true);
                    return;
                }
            }
        }
    }

    /// Create a binding for a name the full outward walk failed to find.
    /// The binding lands in the outermost non-global block of the current
    /// method, so fresh names assigned inside nested if/while/for bodies
    /// are function-scoped, not block-scoped.
    pub fn declare_in_outermost_block(&mut self, name: &Arc<str>, slot: u8) -> NameRef {
        let current = self.current_method_id();
        for scope in self.scopes.iter() {
            if let Scope::Block {
                locals,
                method_id,
                module_level,
            } = scope
            {
                if *method_id == current {
                    locals
                        .borrow_mut()
                        .get_or_insert_with(OrderedMap::new)
                        .insert(name.clone(), slot);
                    return NameRef::Local {
                        slot,
                        module_level: *module_level,
                    };
                }
            }
        }
        // A method is always compiled with at least its body block pushed
        unreachable!("no block scope for the current method");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::interner::intern;

    fn globals() -> Rc<RefCell<Globals>> {
        let globals = Globals::new();
        Rc::new(RefCell::new(globals))
    }

    fn block_scope(method_id: u32, module_level: bool) -> Scope {
        Scope::Block {
            locals: Rc::new(RefCell::new(None)),
            method_id,
            module_level,
        }
    }

    #[test]
    fn test_find_walks_to_global() {
        let g = globals();
        g.borrow_mut().define("print", crate::vm::value::Value::Nil);
        let mut env = Environment::new(g);
        env.push(Scope::Method {
            id: 1,
            creates_captures: Rc::new(Cell::new(false)),
            params: Vec::new(),
        });
        env.push(block_scope(1, false));

        assert!(matches!(env.find("print"), Some(NameRef::Global(_))));
        assert!(env.find("missing").is_none());
    }

    #[test]
    fn test_autodeclare_lands_in_outermost_block() {
        let mut env = Environment::new(globals());
        env.push(Scope::Method {
            id: 1,
            creates_captures: Rc::new(Cell::new(false)),
            params: Vec::new(),
        });
        let outer = Rc::new(RefCell::new(None));
        env.push(Scope::Block {
            locals: outer.clone(),
            method_id: 1,
            module_level: false,
        });
        env.push(block_scope(1, false)); // nested if-body block

        let name = intern("x");
        let r = env.declare_in_outermost_block(&name, 3);
        assert_eq!(
            r,
            NameRef::Local {
                slot: 3,
                module_level: false
            }
        );
        // Created in the function body block, not the nested one
        assert!(outer.borrow().as_ref().unwrap().contains_key("x"));
    }

    #[test]
    fn test_cross_method_lookup_is_upvalue() {
        let mut env = Environment::new(globals());
        let captures = Rc::new(Cell::new(false));
        env.push(Scope::Method {
            id: 1,
            creates_captures: captures.clone(),
            params: vec![(intern("v"), 1)],
        });
        env.push(block_scope(1, false));
        env.push(Scope::Method {
            id: 2,
            creates_captures: Rc::new(Cell::new(false)),
            params: Vec::new(),
        });
        env.push(block_scope(2, false));

        let r = env.find("v").unwrap();
        assert_eq!(r, NameRef::Upvalue { capture: 1, slot: 1 });
        assert!(captures.get());
    }

    #[test]
    fn test_for_scope_binds_loop_variable() {
        let mut env = Environment::new(globals());
        env.push(Scope::Method {
            id: 1,
            creates_captures: Rc::new(Cell::new(false)),
            params: Vec::new(),
        });
        env.push(block_scope(1, false));
        env.push(Scope::For {
            name: intern("i"),
            slot: 2,
            method_id: 1,
        });

        assert_eq!(
            env.find("i"),
            Some(NameRef::Local {
                slot: 2,
                module_level: false
            })
        );
        env.pop();
        assert!(env.find("i").is_none());
    }

    #[test]
    fn test_module_level_marking() {
        let mut env = Environment::new(globals());
        env.push(Scope::Method {
            id: 1,
            creates_captures: Rc::new(Cell::new(false)),
            params: Vec::new(),
        });
        env.push(block_scope(1, true));
        let name = intern("m");
        let r = env.declare_in_outermost_block(&name, 1);
        assert_eq!(
            r,
            NameRef::Local {
                slot: 1,
                module_level: true
            }
        );
    }
}
