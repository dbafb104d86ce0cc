//! User facing specialization diagnostics. The sink is optional;
//! without one every formatting path is skipped entirely.

use crate::typ::Type;
use arcstr::ArcStr;
use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    LogErrors,
    LogWarnings,
    LogAlways,
    LogTrace,
    LogEverything,
}

/// resolved source location
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Position {
    pub uri: ArcStr,
    pub line: u32,
    pub column: u32,
    pub show_line: ArcStr,
}

/// Maps byte offsets in a source buffer to positions. The parser
/// delivers one of these alongside every generic graph.
#[derive(Debug, Clone, Default)]
pub struct PositionTable {
    pub uri: ArcStr,
    /// byte offset of the start of every line
    line_starts: Vec<u32>,
    source: ArcStr,
}

impl PositionTable {
    pub fn new(uri: ArcStr, source: ArcStr) -> Self {
        let mut line_starts = vec![0u32];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i as u32 + 1);
            }
        }
        PositionTable { uri, line_starts, source }
    }

    pub fn resolve(&self, offset: u32) -> Position {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let start = self.line_starts.get(line).copied().unwrap_or(0) as usize;
        let end = self
            .line_starts
            .get(line + 1)
            .map(|e| (*e as usize).saturating_sub(1))
            .unwrap_or(self.source.len());
        let show_line: ArcStr = self.source.get(start..end).unwrap_or("").into();
        Position {
            uri: self.uri.clone(),
            line: line as u32 + 1,
            column: offset.saturating_sub(start as u32) + 1,
            show_line,
        }
    }
}

/// Verbosity gated diagnostic sink. Blocks nest; closing a block that
/// produced no output folds it away.
#[derive(Debug, Default)]
pub struct DiagnosticSink {
    out: Option<DiagnosticOutput>,
}

#[derive(Debug)]
struct DiagnosticOutput {
    level: Verbosity,
    buf: String,
    depth: usize,
}

impl DiagnosticSink {
    /// a sink that drops everything; formatting is bypassed
    pub fn disabled() -> Self {
        DiagnosticSink { out: None }
    }

    pub fn enabled(level: Verbosity) -> Self {
        DiagnosticSink {
            out: Some(DiagnosticOutput { level, buf: String::new(), depth: 0 }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.out.is_some()
    }

    pub fn take_output(&mut self) -> String {
        match &mut self.out {
            Some(o) => std::mem::take(&mut o.buf),
            None => String::new(),
        }
    }

    pub fn diagnostic(&mut self, level: Verbosity, what: &str) {
        if let Some(o) = &mut self.out {
            if level <= o.level {
                for _ in 0..o.depth {
                    o.buf.push_str("  ");
                }
                o.buf.push_str(what);
                o.buf.push('\n');
            }
        }
    }

    pub fn diagnostic_ty(&mut self, level: Verbosity, what: &str, ty: &Type) {
        if let Some(o) = &mut self.out {
            if level <= o.level {
                for _ in 0..o.depth {
                    o.buf.push_str("  ");
                }
                let _ = writeln!(&mut o.buf, "{what} {ty}");
            }
        }
    }

    /// a successful form derivation, logged at trace level
    pub fn success_form(&mut self, label: &str, arg: &Type, result: &Type) {
        if let Some(o) = &mut self.out {
            if Verbosity::LogTrace <= o.level {
                for _ in 0..o.depth {
                    o.buf.push_str("  ");
                }
                let _ = writeln!(&mut o.buf, "[{label}] {arg} -> {result}");
            }
        }
    }

    pub fn open_block(&mut self, level: Verbosity, name: &str) {
        if let Some(o) = &mut self.out {
            if level <= o.level {
                for _ in 0..o.depth {
                    o.buf.push_str("  ");
                }
                let _ = writeln!(&mut o.buf, "({name}");
                o.depth += 1;
            }
        }
    }

    pub fn close_block(&mut self, level: Verbosity) {
        if let Some(o) = &mut self.out {
            if level <= o.level && o.depth > 0 {
                o.depth -= 1;
                for _ in 0..o.depth {
                    o.buf.push_str("  ");
                }
                o.buf.push_str(")\n");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn disabled_sink_formats_nothing() {
        let mut d = DiagnosticSink::disabled();
        d.diagnostic(Verbosity::LogErrors, "boom");
        assert_eq!(d.take_output(), "");
    }

    #[test]
    fn verbosity_gates_output() {
        let mut d = DiagnosticSink::enabled(Verbosity::LogWarnings);
        d.diagnostic(Verbosity::LogErrors, "shown");
        d.diagnostic(Verbosity::LogTrace, "hidden");
        let out = d.take_output();
        assert!(out.contains("shown"));
        assert!(!out.contains("hidden"));
    }

    #[test]
    fn positions_resolve_line_and_column() {
        let t = PositionTable::new(
            arcstr::literal!("main.cza"),
            arcstr::literal!("first line\nsecond line\nthird"),
        );
        let p = t.resolve(11);
        assert_eq!(p.line, 2);
        assert_eq!(p.column, 1);
        assert_eq!(&*p.show_line, "second line");
        let p = t.resolve(18);
        assert_eq!(p.line, 2);
        assert_eq!(p.column, 8);
    }
}
