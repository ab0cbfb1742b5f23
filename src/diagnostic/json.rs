use serde_json::{Value, json};

use super::{Diagnostic, Label, Severity};
use crate::ast::SourceMap;

fn label_json(label: &Label, map: Option<&SourceMap>) -> Value {
    let mut obj = json!({
        "start": label.span.start,
        "end": label.span.end,
        "message": label.message,
        "primary": label.is_primary,
    });
    if let Some(map) = map {
        let (line, col) = map.lookup(label.span.start);
        obj["line"] = Value::from(line);
        obj["col"] = Value::from(col);
    }
    obj
}

/// One diagnostic as a single-line JSON object.
pub fn render(d: &Diagnostic) -> String {
    let severity = match d.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };
    let map = d.source.as_deref().map(SourceMap::new);
    let labels: Vec<Value> = d.labels.iter().map(|l| label_json(l, map.as_ref())).collect();

    let mut obj = json!({
        "severity": severity,
        "message": d.message,
        "labels": labels,
        "notes": d.notes,
    });
    if let Some(code) = d.code {
        obj["code"] = Value::from(code);
    }
    if let Some(s) = &d.suggestion {
        obj["suggestion"] = Value::from(s.as_str());
    }

    serde_json::to_string(&obj)
        .unwrap_or_else(|_| r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Span;

    fn parse_json(s: &str) -> serde_json::Value {
        serde_json::from_str(s).expect("valid JSON")
    }

    #[test]
    fn render_basic_error() {
        let v = parse_json(&render(&Diagnostic::error("division by zero")));
        assert_eq!(v["severity"], "error");
        assert_eq!(v["message"], "division by zero");
        assert!(v["labels"].as_array().unwrap().is_empty());
        assert!(v.get("code").is_none());
        assert!(v.get("suggestion").is_none());
    }

    #[test]
    fn render_code_span_and_source() {
        let d = Diagnostic::error("undefined variable 'y'")
            .with_code("MVM-T001")
            .with_span(Span { start: 11, end: 12 }, "here")
            .with_source("int x;\nx = y + 1;".to_string());
        let v = parse_json(&render(&d));
        assert_eq!(v["code"], "MVM-T001");
        let label = &v["labels"][0];
        assert_eq!(label["start"], 11);
        assert_eq!(label["end"], 12);
        assert_eq!(label["primary"], true);
        assert_eq!(label["line"], 2);
        assert_eq!(label["col"], 5);
    }

    #[test]
    fn render_label_without_source_no_line_col() {
        let d = Diagnostic::error("bad").with_span(Span { start: 5, end: 8 }, "here");
        let v = parse_json(&render(&d));
        let label = &v["labels"][0];
        assert!(label.get("line").is_none());
        assert!(label.get("col").is_none());
    }

    #[test]
    fn render_notes_and_suggestion() {
        let d = Diagnostic::error("bad")
            .with_note("in function 'f' at bytecode offset 10")
            .with_secondary_span(Span { start: 0, end: 1 }, "declared here")
            .with_suggestion("fix it");
        let v = parse_json(&render(&d));
        assert_eq!(v["notes"][0], "in function 'f' at bytecode offset 10");
        assert_eq!(v["labels"][0]["primary"], false);
        assert_eq!(v["suggestion"], "fix it");
    }

    #[test]
    fn render_is_single_line() {
        let d = Diagnostic::warning("multi\nline").with_note("a\nb");
        let out = render(&d);
        assert!(!out.contains('\n'));
        assert_eq!(parse_json(&out)["severity"], "warning");
    }
}
