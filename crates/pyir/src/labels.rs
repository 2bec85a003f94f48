//! Label/Block Manager.
//!
//! Maps bytecode offsets to pending labels: the SSA parameter types a
//! block will take, a deferred prelude to apply once it is materialized,
//! and a `processed` flag that guarantees a block body is emitted exactly
//! once even when a back-edge (a `for`-loop's `JUMP_ABSOLUTE`) targets it
//! again later.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::ir::{IrType, TempId};

/// A deferred transformation applied once a label's block is materialized.
/// Encoded as data rather than a closure, per the non-closure prelude
/// representation: the block materializer interprets the tag.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Prelude {
    #[default]
    Identity,
    /// `prune e`, where `e` is the named temporary.
    Prune(TempId),
    /// `prune __sil_lnot(e)`.
    PruneNot(TempId),
}

/// A pending or already-materialized block.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelInfo {
    pub name: String,
    pub ssa_param_types: Vec<IrType>,
    pub prelude: Prelude,
    pub processed: bool,
}

impl LabelInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ssa_param_types: Vec::new(),
            prelude: Prelude::Identity,
            processed: false,
        }
    }

    pub fn with_params(mut self, ssa_param_types: Vec<IrType>) -> Self {
        self.ssa_param_types = ssa_param_types;
        self
    }

    pub fn with_prelude(mut self, prelude: Prelude) -> Self {
        self.prelude = prelude;
        self
    }
}

/// Procedure-scoped table from bytecode offset to the label pending (or
/// already processed) there.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    by_offset: HashMap<u32, LabelInfo>,
}

impl LabelTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `info` at `offset`. If a label is already registered there,
    /// the two are merged: SSA arities must agree, and the non-identity
    /// prelude (if any) wins — the first real prelude registered for an
    /// offset defines it, since a given offset is only ever prune-bearing
    /// from the branch that first discovers it as a jump target.
    pub fn register_label(&mut self, offset: u32, info: LabelInfo) -> Result<()> {
        match self.by_offset.get_mut(&offset) {
            Some(existing) => {
                if existing.ssa_param_types.len() != info.ssa_param_types.len() {
                    return Err(Error::SsaArityMismatch {
                        label: existing.name.clone(),
                        expected: existing.ssa_param_types.len(),
                        found: info.ssa_param_types.len(),
                    });
                }
                if existing.prelude == Prelude::Identity {
                    existing.prelude = info.prelude;
                }
                Ok(())
            }
            None => {
                self.by_offset.insert(offset, info);
                Ok(())
            }
        }
    }

    pub fn label_of_offset(&self, offset: u32) -> Option<&LabelInfo> {
        self.by_offset.get(&offset)
    }

    /// Mark the label at `offset` as materialized so it is never lowered
    /// again.
    pub fn process_label(&mut self, offset: u32) {
        if let Some(info) = self.by_offset.get_mut(&offset) {
            info.processed = true;
        }
    }

    pub fn is_processed(&self, offset: u32) -> bool {
        self.by_offset
            .get(&offset)
            .map(|info| info.processed)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_registration_defines_prelude() {
        let mut table = LabelTable::new();
        table
            .register_label(
                10,
                LabelInfo::new("b1")
                    .with_params(vec![])
                    .with_prelude(Prelude::Prune(5)),
            )
            .unwrap();
        table
            .register_label(10, LabelInfo::new("b1").with_params(vec![]))
            .unwrap();
        assert_eq!(
            table.label_of_offset(10).unwrap().prelude,
            Prelude::Prune(5)
        );
    }

    #[test]
    fn mismatched_arity_is_an_error() {
        let mut table = LabelTable::new();
        table
            .register_label(10, LabelInfo::new("b1").with_params(vec![IrType::Object]))
            .unwrap();
        let err = table
            .register_label(10, LabelInfo::new("b1").with_params(vec![]))
            .unwrap_err();
        assert!(matches!(err, Error::SsaArityMismatch { .. }));
    }

    #[test]
    fn processed_flag_suppresses_relowering() {
        let mut table = LabelTable::new();
        table.register_label(10, LabelInfo::new("b1")).unwrap();
        assert!(!table.is_processed(10));
        table.process_label(10);
        assert!(table.is_processed(10));
    }
}
