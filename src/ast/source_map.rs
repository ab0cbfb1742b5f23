use super::Span;

/// Maps byte offsets of the original program text to line/column positions.
///
/// The translator only ever sees spans; turning them into something a human
/// can read happens at the edge (diagnostics, CLI).
pub struct SourceMap {
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.bytes().enumerate().filter(|&(_, b)| b == b'\n').map(|(i, _)| i + 1))
            .collect();
        SourceMap { line_starts }
    }

    /// Returns (line, col), both 1-based.
    pub fn lookup(&self, offset: usize) -> (usize, usize) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let col = offset.saturating_sub(self.line_starts[line]);
        (line + 1, col + 1)
    }

    /// `line:col` of the span start.
    pub fn location(&self, span: Span) -> String {
        let (line, col) = self.lookup(span.start);
        format!("{line}:{col}")
    }

    /// Returns the full text of the given 1-based line number.
    pub fn line_text<'a>(&self, source: &'a str, line: usize) -> &'a str {
        if line == 0 || line > self.line_starts.len() {
            return "";
        }
        let start = self.line_starts[line - 1];
        let end = self.line_starts.get(line).copied().unwrap_or(source.len());
        source[start..end].trim_end_matches('\n').trim_end_matches('\r')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line() {
        let src = "print(f(41));";
        let sm = SourceMap::new(src);
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.lookup(6), (1, 7));
        assert_eq!(sm.lookup(13), (1, 14));
    }

    #[test]
    fn multi_line() {
        let src = "int x;\nx = 1;\nprint(x);";
        let sm = SourceMap::new(src);
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.lookup(6), (1, 7)); // '\n' belongs to line 1
        assert_eq!(sm.lookup(7), (2, 1));
        assert_eq!(sm.lookup(14), (3, 1));
    }

    #[test]
    fn location_formats_span_start() {
        let sm = SourceMap::new("int x;\nx = y;");
        assert_eq!(sm.location(Span::new(11, 12)), "2:5");
    }

    #[test]
    fn line_text_multi() {
        let src = "first\r\nsecond\nthird";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_text(src, 1), "first");
        assert_eq!(sm.line_text(src, 2), "second");
        assert_eq!(sm.line_text(src, 3), "third");
    }

    #[test]
    fn line_text_out_of_bounds() {
        let src = "hello";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_text(src, 0), "");
        assert_eq!(sm.line_text(src, 99), "");
    }

    #[test]
    fn empty_source() {
        let sm = SourceMap::new("");
        assert_eq!(sm.lookup(0), (1, 1));
        assert_eq!(sm.line_text("", 1), "");
    }
}
