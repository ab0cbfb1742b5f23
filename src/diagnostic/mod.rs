pub mod ansi;
pub mod json;
pub mod registry;

use crate::ast::Span;
use crate::interpreter::RuntimeError;
use crate::translator::{TranslateError, TranslateErrorKind};
use crate::vm::{ExecutionError, VmError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct Label {
    pub span: Span,
    pub message: String,
    pub is_primary: bool,
}

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: Option<&'static str>,
    pub message: String,
    pub labels: Vec<Label>,
    pub notes: Vec<String>,
    pub suggestion: Option<String>,
    pub source: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Diagnostic {
            severity: Severity::Error,
            code: None,
            message: message.into(),
            labels: Vec::new(),
            notes: Vec::new(),
            suggestion: None,
            source: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Diagnostic { severity: Severity::Warning, ..Diagnostic::error(message) }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: true });
        self
    }

    pub fn with_secondary_span(mut self, span: Span, label: impl Into<String>) -> Self {
        self.labels.push(Label { span, message: label.into(), is_primary: false });
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

// ---- From impls for the pipeline's error types ----

impl From<&TranslateError> for Diagnostic {
    fn from(e: &TranslateError) -> Self {
        let mut d = Diagnostic::error(e.kind.to_string()).with_code(e.code());
        if e.span != Span::UNKNOWN {
            d = d.with_span(e.span, "here");
        }
        match &e.kind {
            TranslateErrorKind::IncompatibleType { .. } => {
                d.with_suggestion("int and double convert into each other and a string converts to int; nothing converts to string")
            }
            TranslateErrorKind::Native(_) => {
                d.with_note("natives are resolved in the running process with dlsym")
            }
            TranslateErrorKind::Label(_) => d.with_note("this is a translator fault, not a problem in the program"),
            _ => d,
        }
    }
}

impl From<&ExecutionError> for Diagnostic {
    fn from(e: &ExecutionError) -> Self {
        let d = Diagnostic::error(e.error.to_string())
            .with_code(e.code())
            .with_note(format!("in function '{}' at bytecode offset {}", e.function, e.offset));
        match &e.error {
            VmError::MissingContext(_) => d.with_suggestion(
                "a nested function touched its enclosing function's variables while no call of it was active",
            ),
            VmError::CallDepthExceeded => d.with_suggestion("check the recursion for a missing base case"),
            err if err.code() == "MVM-R008" || err.code() == "MVM-R007" => {
                d.with_note("malformed bytecode; programs produced by the translator never do this")
            }
            _ => d,
        }
    }
}

impl From<&RuntimeError> for Diagnostic {
    fn from(e: &RuntimeError) -> Self {
        Diagnostic::error(&e.message).with_code(e.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::VarType;

    #[test]
    fn diagnostic_error_builder() {
        let d = Diagnostic::error("something went wrong");
        assert_eq!(d.severity, Severity::Error);
        assert_eq!(d.message, "something went wrong");
        assert!(d.code.is_none());
        assert!(d.labels.is_empty());
        assert!(d.notes.is_empty());
        assert!(d.suggestion.is_none());
    }

    #[test]
    fn diagnostic_with_span() {
        let d = Diagnostic::error("bad operand").with_span(Span { start: 5, end: 8 }, "here");
        assert_eq!(d.labels.len(), 1);
        assert_eq!(d.labels[0].span.start, 5);
        assert_eq!(d.labels[0].span.end, 8);
        assert!(d.labels[0].is_primary);
    }

    #[test]
    fn diagnostic_with_note_and_suggestion() {
        let d = Diagnostic::error("type mismatch")
            .with_note("in function 'foo'")
            .with_suggestion("declare x as double");
        assert_eq!(d.notes, vec!["in function 'foo'"]);
        assert_eq!(d.suggestion.as_deref(), Some("declare x as double"));
    }

    #[test]
    fn from_translate_error() {
        let e = TranslateError::new(TranslateErrorKind::UnresolvedVariable("y".into()), Span::new(11, 12));
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("MVM-T001"));
        assert!(d.message.contains("y"));
        assert_eq!(d.labels[0].span, Span::new(11, 12));
    }

    #[test]
    fn from_translate_error_without_span() {
        let kind = TranslateErrorKind::IncompatibleType {
            context: "assignment",
            expected: VarType::String,
            found: VarType::Int,
        };
        let d = Diagnostic::from(&TranslateError::new(kind, Span::UNKNOWN));
        assert_eq!(d.code, Some("MVM-T004"));
        assert!(d.labels.is_empty());
        assert!(d.suggestion.is_some());
    }

    #[test]
    fn from_execution_error() {
        let e = ExecutionError { error: VmError::DivisionByZero, function: "f".into(), offset: 10 };
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("MVM-R001"));
        assert!(d.message.contains("division by zero"));
        assert!(d.notes.iter().any(|n| n.contains("'f'") && n.contains("10")));
        assert!(d.labels.is_empty());
    }

    #[test]
    fn from_execution_error_missing_context() {
        let e = ExecutionError { error: VmError::MissingContext(1), function: "g".into(), offset: 0 };
        let d = Diagnostic::from(&e);
        assert_eq!(d.code, Some("MVM-R002"));
        assert!(d.suggestion.is_some());
    }

    #[test]
    fn from_runtime_error() {
        let e = RuntimeError { message: "division by zero".to_string(), code: "MVM-R001" };
        let d = Diagnostic::from(&e);
        assert!(d.message.contains("division by zero"));
        assert_eq!(d.code, Some("MVM-R001"));
        assert!(d.labels.is_empty());
    }

    #[test]
    fn every_emitted_code_is_registered() {
        let codes = [
            TranslateError::new(TranslateErrorKind::VoidValue, Span::UNKNOWN).code(),
            VmError::StackUnderflow.code(),
            VmError::UnknownOpcode(0xff).code(),
            VmError::Output(std::io::Error::other("closed")).code(),
            "MVM-R009",
        ];
        for code in codes {
            assert!(registry::lookup(code).is_some(), "{code} missing from registry");
        }
    }
}
