//! Error taxonomy and report formatting.
//!
//! Compile-time problems accumulate in the code generator and surface as a
//! `Vec<CompileError>` from [`crate::Engine::compile`]. Runtime problems are
//! formatted into single lines and handed to the VM's error consumer; most of
//! them are recoverable and the offending opcode substitutes a default value.

use std::fmt;

use strum::Display;

/// Severity of a reported problem.
///
/// The `Display` form is the exact text that appears in formatted report
/// lines, so `Parse` renders as `Parse error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Severity {
    /// Benign: undefined index, division by zero in a non-fatal context.
    Notice,
    /// Recoverable misuse: invalid argument type, missing foreign function,
    /// malformed foreach target.
    Warning,
    /// Fatal for the current run: syntax error, out of memory, recursion
    /// limit reached.
    Error,
    /// Lexer or parser failure.
    #[strum(serialize = "Parse error")]
    Parse,
}

/// A single compile-time diagnostic with its source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// 1-based line in the compiled source.
    pub line: u32,
    /// Human-readable description.
    pub message: String,
}

impl CompileError {
    pub(crate) fn new(line: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.message)
    }
}

/// Soft cap on accumulated compile errors. Once reached the generator stops
/// doing further work and returns what it has.
pub(crate) const COMPILE_ERROR_LIMIT: usize = 15;

/// Formats one runtime report line.
///
/// Layout: `<file> <Severity>: [<function>(): ]<message>\n`. The file prefix
/// is skipped when the compilation unit has no name.
pub(crate) fn format_report(file: &str, severity: Severity, func: Option<&str>, message: &str) -> String {
    let mut line = String::with_capacity(file.len() + message.len() + 24);
    if !file.is_empty() {
        line.push_str(file);
        line.push(' ');
    }
    line.push_str(&severity.to_string());
    line.push_str(": ");
    if let Some(name) = func {
        line.push_str(name);
        line.push_str("(): ");
    }
    line.push_str(message);
    line.push('\n');
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_display() {
        assert_eq!(Severity::Notice.to_string(), "Notice");
        assert_eq!(Severity::Warning.to_string(), "Warning");
        assert_eq!(Severity::Error.to_string(), "Error");
        assert_eq!(Severity::Parse.to_string(), "Parse error");
    }

    #[test]
    fn report_line_with_function() {
        let line = format_report("script.jx9", Severity::Warning, Some("foo"), "bad argument");
        assert_eq!(line, "script.jx9 Warning: foo(): bad argument\n");
    }

    #[test]
    fn report_line_without_file() {
        let line = format_report("", Severity::Error, None, "out of memory");
        assert_eq!(line, "Error: out of memory\n");
    }
}
