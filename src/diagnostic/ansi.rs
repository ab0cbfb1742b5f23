use std::fmt::Write;

use super::{Diagnostic, Label, Severity};
use crate::ast::SourceMap;

const BOLD: &str = "1";
const BOLD_RED: &str = "1;31";
const BOLD_CYAN: &str = "1;36";
const CYAN: &str = "36";
const DIM: &str = "2";

/// Renders diagnostics for a terminal: header, source snippet with carets, notes.
pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn paint(&self, style: &str, s: &str) -> String {
        if self.use_color { format!("\x1b[{style}m{s}\x1b[0m") } else { s.to_string() }
    }

    pub fn render(&self, d: &Diagnostic) -> String {
        let mut out = String::new();

        // "error[MVM-T001]: message"
        let (severity, style) = match d.severity {
            Severity::Error => ("error", BOLD_RED),
            Severity::Warning => ("warning", BOLD_CYAN),
        };
        let header = match d.code {
            Some(code) => format!("{severity}[{code}]"),
            None => severity.to_string(),
        };
        let _ = writeln!(out, "{}: {}", self.paint(style, &header), self.paint(BOLD, &d.message));

        let map = d.source.as_deref().map(SourceMap::new);
        if let (Some(label), Some(source), Some(map)) =
            (d.labels.iter().find(|l| l.is_primary), d.source.as_deref(), map.as_ref())
        {
            self.snippet(&mut out, label, source, map);
        }

        for label in d.labels.iter().filter(|l| !l.is_primary && !l.message.is_empty()) {
            let at = map.as_ref().map(|m| format!(" ({})", m.location(label.span))).unwrap_or_default();
            let _ = writeln!(out, "  {} {}{at}", self.paint(DIM, "="), label.message);
        }
        for note in &d.notes {
            let _ = writeln!(out, "  {} note: {note}", self.paint(DIM, "="));
        }
        if let Some(suggestion) = &d.suggestion {
            let _ = writeln!(out, "  {} suggestion: {suggestion}", self.paint(DIM, "="));
        }
        out
    }

    /// `--> line:col`, the source line, and carets under the span.
    fn snippet(&self, out: &mut String, label: &Label, source: &str, map: &SourceMap) {
        let (line, col) = map.lookup(label.span.start);
        let text = map.line_text(source, line);
        let gutter = line.to_string().len();
        let pad = " ".repeat(gutter);
        let pipe = self.paint(CYAN, "|");

        let _ = writeln!(out, "  {} {line}:{col}", self.paint(CYAN, "-->"));
        let _ = writeln!(out, "{pad} {pipe}");
        let _ = writeln!(out, "{} {pipe} {text}", self.paint(CYAN, &format!("{line:>gutter$}")));

        let width = label.span.end.saturating_sub(label.span.start).max(1);
        let carets = self.paint(BOLD_RED, &"^".repeat(width));
        let indent = " ".repeat(col.saturating_sub(1));
        if label.message.is_empty() {
            let _ = writeln!(out, "{pad} {pipe} {indent}{carets}");
        } else {
            let _ = writeln!(out, "{pad} {pipe} {indent}{carets} {}", self.paint(BOLD_RED, &label.message));
        }
        let _ = writeln!(out, "{pad} {pipe}");
    }
}
