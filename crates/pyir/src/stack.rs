//! The compile-time symbolic data stack.
//!
//! Mirrors the runtime evaluation stack the source bytecode assumes, but
//! holds typed cells instead of values. Typing of a `Temp` cell is
//! resolved through `Env::temp_info`, not stored inline here.

use std::sync::Arc;

use crate::ir::TempId;
use crate::input::CodeObject;

/// One entry on the symbolic data stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// Index into the code object's constants pool.
    Const(u32),
    /// Index into the names table (global name reference).
    Name(u32),
    /// Index into the local-variable-names table.
    VarName(u32),
    /// A previously-bound SSA identifier.
    Temp(TempId),
    /// A nested code object pushed by `LOAD_CONST`, not yet materialized.
    Code {
        is_fun_or_class: bool,
        qualified_name: String,
        code: Arc<CodeObject>,
    },
    /// An ordered association, used only for annotation tuples/dicts.
    Map(Vec<(String, Cell)>),
    /// Sentinel pushed by the class-building opcode.
    BuildClassMarker,
}

/// The data stack itself. `pop` on empty returns `None`; callers must treat
/// that as a translation-time invariant violation (malformed or
/// unsupported bytecode), never synthesize a value.
#[derive(Debug, Clone, Default)]
pub struct DataStack {
    cells: Vec<Cell>,
}

impl DataStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, cell: Cell) {
        self.cells.push(cell);
    }

    pub fn pop(&mut self) -> Option<Cell> {
        self.cells.pop()
    }

    pub fn peek(&self) -> Option<&Cell> {
        self.cells.last()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// Discard all cells, returning them in bottom-to-top order. Used when
    /// a block closes: the live cells become the SSA arguments of the
    /// terminating jump.
    pub fn reset(&mut self) -> Vec<Cell> {
        std::mem::take(&mut self.cells)
    }

    /// Replace the stack contents wholesale, in bottom-to-top order. Used
    /// when a new block opens and its SSA parameters are materialized back
    /// onto the stack as `Temp` cells.
    pub fn restore(&mut self, cells: Vec<Cell>) {
        self.cells = cells;
    }

    /// A read-only copy of the current cells, bottom-to-top, without
    /// draining them. Used by the `*_OR_POP` conditional jumps, which must
    /// inspect top-of-stack without committing to whether it is consumed.
    pub fn snapshot(&self) -> Vec<Cell> {
        self.cells.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_lifo() {
        let mut stack = DataStack::new();
        stack.push(Cell::Const(0));
        stack.push(Cell::Temp(1));
        assert_eq!(stack.pop(), Some(Cell::Temp(1)));
        assert_eq!(stack.pop(), Some(Cell::Const(0)));
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn reset_drains_in_order() {
        let mut stack = DataStack::new();
        stack.push(Cell::Const(0));
        stack.push(Cell::Const(1));
        let drained = stack.reset();
        assert_eq!(drained, vec![Cell::Const(0), Cell::Const(1)]);
        assert!(stack.is_empty());
    }
}
