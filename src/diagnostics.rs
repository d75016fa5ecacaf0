//! Structured diagnostics collected by the linker and the compiler.

use std::fmt;

use serde::Serialize;

/// Severity of a diagnostic, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    #[default]
    Info,
    Warning,
    Error,
    Fatal,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Fatal => "fatal",
        };
        f.write_str(s)
    }
}

/// One diagnostic: a severity, a stable code and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: &'static str,
    pub params: Vec<String>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.severity, self.code)?;
        if !self.params.is_empty() {
            write!(f, " ({})", self.params.join(", "))?;
        }
        Ok(())
    }
}

// Linker codes.
pub const LNK_NOREPO: &str = "LNK_NOREPO";
pub const LNK_MODULE_LOAD: &str = "LNK_MODULE_LOAD";
pub const LNK_REDEF: &str = "LNK_REDEF";
pub const LNK_MAIN_EXISTS: &str = "LNK_MAIN_EXISTS";
pub const LNK_DEP_MISSING: &str = "LNK_DEP_MISSING";
pub const LNK_EMPTY: &str = "LNK_EMPTY";

// Compiler codes.
pub const JIT_UNRESOLVED_TYPE: &str = "JIT_UNRESOLVED_TYPE";

/// An ordered, bounded list of diagnostics.
///
/// Entries beyond the capacity are dropped, but the highest severity seen is
/// always retained so `has_errors` stays accurate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorList {
    entries: Vec<Diagnostic>,
    max: usize,
    worst: Severity,
    dropped: usize,
}

impl Default for ErrorList {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX)
    }
}

impl ErrorList {
    pub const DEFAULT_MAX: usize = 24;

    pub fn new(max: usize) -> Self {
        Self {
            entries: Vec::new(),
            max,
            worst: Severity::Info,
            dropped: 0,
        }
    }

    /// Record a diagnostic. Returns true if it is at error severity or worse.
    pub fn log(&mut self, severity: Severity, code: &'static str, params: Vec<String>) -> bool {
        match severity {
            Severity::Info => tracing::debug!(code, ?params, "diagnostic"),
            Severity::Warning => tracing::warn!(code, ?params, "diagnostic"),
            Severity::Error | Severity::Fatal => tracing::error!(code, ?params, "diagnostic"),
        }
        self.worst = self.worst.max(severity);
        if self.entries.len() < self.max {
            self.entries.push(Diagnostic {
                severity,
                code,
                params,
            });
        } else {
            self.dropped += 1;
        }
        severity >= Severity::Error
    }

    pub fn warn(&mut self, code: &'static str, params: Vec<String>) {
        self.log(Severity::Warning, code, params);
    }

    pub fn error(&mut self, code: &'static str, params: Vec<String>) {
        self.log(Severity::Error, code, params);
    }

    pub fn has_errors(&self) -> bool {
        self.worst >= Severity::Error
    }

    pub fn severity(&self) -> Severity {
        self.worst
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter()
    }

    pub fn contains(&self, code: &str) -> bool {
        self.entries.iter().any(|d| d.code == code)
    }

    /// Append every entry of another list.
    pub fn extend(&mut self, other: &ErrorList) {
        for d in &other.entries {
            self.log(d.severity, d.code, d.params.clone());
        }
    }

    /// Append the entries of another list that are not already present.
    pub fn merge(&mut self, other: &ErrorList) {
        for d in &other.entries {
            if !self.entries.contains(d) {
                self.log(d.severity, d.code, d.params.clone());
            }
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.entries.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{d}")?;
        }
        if self.dropped > 0 {
            write!(f, " (+{} more)", self.dropped)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_order() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Fatal);
    }

    #[test]
    fn test_warnings_are_not_errors() {
        let mut list = ErrorList::default();
        list.warn(LNK_REDEF, vec!["debug".into()]);
        assert!(!list.has_errors());
        assert_eq!(list.len(), 1);
        list.error(LNK_EMPTY, vec![]);
        assert!(list.has_errors());
        assert!(list.contains(LNK_EMPTY));
    }

    #[test]
    fn test_capacity_keeps_worst_severity() {
        let mut list = ErrorList::new(1);
        list.warn(LNK_REDEF, vec![]);
        list.error(LNK_MODULE_LOAD, vec!["m".into()]);
        assert_eq!(list.len(), 1);
        assert!(list.has_errors());
        assert!(list.to_string().contains("+1 more"));
    }

    #[test]
    fn test_merge_skips_duplicates() {
        let mut a = ErrorList::default();
        a.warn(JIT_UNRESOLVED_TYPE, vec!["f".into(), "$T".into()]);
        let mut b = a.clone();
        b.warn(JIT_UNRESOLVED_TYPE, vec!["f".into(), "$U".into()]);
        a.merge(&b);
        assert_eq!(a.len(), 2);
    }
}
