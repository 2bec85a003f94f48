//! The state threaded through translation.
//!
//! `Env` is the monadic state the spec describes as a tuple — modeled here
//! as a mutable builder instead of an immutable record passed by value,
//! since the external contract (a pure top-level [`crate::assembler::to_module`])
//! is preserved either way. Module-scoped fields (`registry`, `builtins`)
//! survive across procedures; procedure-scoped fields are cleared by
//! [`Env::enter_proc`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::builtins::BuiltinRegistry;
use crate::ir::{Instr, TempId};
use crate::labels::LabelTable;
use crate::loc::Loc;
use crate::registry::{Info, Registry};
use crate::stack::DataStack;

/// Translation state for one module, threaded through every lowering rule.
pub struct Env {
    pub filename: Arc<str>,
    last_loc: Loc,
    pub stack: DataStack,
    pub instr_buf: Vec<Instr>,
    fresh_id_ctr: TempId,
    fresh_label_ctr: u32,
    temp_info: HashMap<TempId, Info>,
    pub labels: LabelTable,
    pub registry: Registry,
    pub builtins: BuiltinRegistry,
    is_toplevel: bool,
    /// The class whose body is currently being lowered, if any. Used to
    /// route a definition found via `STORE_NAME`/`STORE_FAST` to
    /// `register_method` instead of `register_function`, and to recognize
    /// `self.x = v` stores for class field inference.
    pub current_class: Option<String>,
}

impl Env {
    pub fn new(filename: impl Into<Arc<str>>) -> Self {
        let filename = filename.into();
        Self {
            last_loc: Loc::unknown(Arc::clone(&filename)),
            filename,
            stack: DataStack::new(),
            instr_buf: Vec::new(),
            fresh_id_ctr: 0,
            fresh_label_ctr: 0,
            temp_info: HashMap::new(),
            labels: LabelTable::new(),
            registry: Registry::new(),
            builtins: BuiltinRegistry::new(),
            is_toplevel: true,
            current_class: None,
        }
    }

    /// Bind a fresh SSA identifier to `info`, returning its id.
    pub fn mk_fresh_ident(&mut self, info: Info) -> TempId {
        let id = self.fresh_id_ctr;
        self.fresh_id_ctr += 1;
        self.temp_info.insert(id, info);
        id
    }

    /// Mint a fresh block label name, unique within the current procedure.
    pub fn mk_fresh_label(&mut self) -> String {
        let name = format!("b{}", self.fresh_label_ctr);
        self.fresh_label_ctr += 1;
        name
    }

    pub fn get_ident_info(&self, id: TempId) -> Option<&Info> {
        self.temp_info.get(&id)
    }

    pub fn push_instr(&mut self, instr: Instr) {
        self.instr_buf.push(instr);
    }

    pub fn update_last_line(&mut self, line: u32) {
        self.last_loc = Loc::new(Arc::clone(&self.filename), line);
    }

    pub fn loc(&self) -> Loc {
        self.last_loc.clone()
    }

    pub fn is_toplevel(&self) -> bool {
        self.is_toplevel
    }

    /// Reset everything procedure-scoped: the stack, instruction buffer,
    /// local symbols, labels, and both fresh-name counters. Module-scoped
    /// state (`registry`'s globals/functions/classes, `builtins`) is left
    /// untouched.
    pub fn enter_proc(&mut self, is_toplevel: bool) {
        self.stack = DataStack::new();
        self.instr_buf.clear();
        self.fresh_id_ctr = 0;
        self.fresh_label_ctr = 0;
        self.temp_info.clear();
        self.labels = LabelTable::new();
        self.registry.clear_locals();
        self.is_toplevel = is_toplevel;
    }

    /// Reset only the instruction buffer, used when a new block opens.
    pub fn enter_node(&mut self) {
        self.instr_buf.clear();
    }

    /// Drain the live stack, in bottom-to-top order, for use as the SSA
    /// arguments of a closing jump.
    pub fn reset_stack(&mut self) -> Vec<crate::stack::Cell> {
        self.stack.reset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ids_are_sequential_and_typed() {
        let mut env = Env::new("m.py");
        let a = env.mk_fresh_ident(Info::object());
        let b = env.mk_fresh_ident(Info::object());
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(env.get_ident_info(a), Some(&Info::object()));
    }

    #[test]
    fn fresh_labels_are_distinct() {
        let mut env = Env::new("m.py");
        assert_eq!(env.mk_fresh_label(), "b0");
        assert_eq!(env.mk_fresh_label(), "b1");
    }

    #[test]
    fn enter_proc_clears_procedure_state_but_not_module_state() {
        let mut env = Env::new("m.py");
        env.mk_fresh_ident(Info::object());
        env.registry.register_class("C");
        env.enter_proc(false);
        assert_eq!(env.mk_fresh_label(), "b0");
        assert_eq!(env.registry.get_classes(), vec!["C".to_string()]);
    }
}
