//! Source-location tracking.
//!
//! The translator never holds the original source text — only a loaded
//! [`crate::input::CodeObject`] and the optional `starts_line` hint each
//! instruction carries. A [`Loc`] is therefore line-granularity, not a byte
//! span: there is nothing to underline the way a source-text diagnostic
//! would.

use std::fmt;
use std::sync::Arc;

/// A location within a source file, known only to line granularity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Loc {
    pub file: Arc<str>,
    pub line: u32,
}

impl Loc {
    pub fn new(file: Arc<str>, line: u32) -> Self {
        Self { file, line }
    }

    /// A location with no line information yet (before the first
    /// `starts_line` hint has been seen in the current procedure).
    pub fn unknown(file: Arc<str>) -> Self {
        Self { file, line: 0 }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_file_and_line() {
        let loc = Loc::new(Arc::from("mod.py"), 3);
        assert_eq!(loc.to_string(), "mod.py:3");
    }

    #[test]
    fn unknown_has_line_zero() {
        let loc = Loc::unknown(Arc::from("mod.py"));
        assert_eq!(loc.line, 0);
    }
}
