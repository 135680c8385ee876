//! Terminal output for streamed replies.
//!
//! `Renderer<O, E>` writes answer text to one writer as it grows and
//! keeps thoughts, files and errors on another, so piping stdout captures
//! only the answer.

use std::fmt::Write as FmtWrite;
use std::io::Write;

use dc_protocol::{FileRef, Message, Thought};

/// False when `NO_COLOR` is set.
pub fn color_enabled() -> bool {
    std::env::var_os("NO_COLOR").is_none()
}

/// ANSI codes, or empty strings when color is off.
#[derive(Debug, Clone, Copy)]
pub struct Style {
    enabled: bool,
}

impl Default for Style {
    fn default() -> Self {
        Self {
            enabled: color_enabled(),
        }
    }
}

impl Style {
    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn force_enabled() -> Self {
        Self { enabled: true }
    }

    fn code(&self, code: &'static str) -> &'static str {
        if self.enabled {
            code
        } else {
            ""
        }
    }

    pub fn dim(&self) -> &'static str {
        self.code("\x1b[2m")
    }

    pub fn red(&self) -> &'static str {
        self.code("\x1b[31m")
    }

    pub fn reset(&self) -> &'static str {
        self.code("\x1b[0m")
    }
}

/// One line per thought, in position order: `[n] thought` followed by the
/// tool call and observation when present.
pub fn format_thoughts(thoughts: &[Thought]) -> String {
    let mut ordered: Vec<&Thought> = thoughts.iter().collect();
    ordered.sort_by_key(|t| t.position);

    let mut out = String::new();
    for t in ordered {
        let _ = write!(out, "[{}]", t.position);
        if !t.thought.is_empty() {
            let _ = write!(out, " {}", t.thought);
        }
        if !t.tool.is_empty() {
            let _ = write!(out, " -> {}({})", t.tool, t.tool_input);
        }
        if !t.observation.is_empty() {
            let _ = write!(out, " = {}", t.observation);
        }
        out.push('\n');
    }
    out
}

pub fn format_files(files: &[FileRef]) -> String {
    files
        .iter()
        .map(|f| format!("{} {} {}\n", f.file_type, f.id, f.url))
        .collect()
}

pub struct Renderer<O: Write, E: Write> {
    pub out: O,
    pub err: E,
    style: Style,
    /// Bytes of the current message's content already written.
    printed: usize,
}

impl<O: Write, E: Write> Renderer<O, E> {
    pub fn new(out: O, err: E, style: Style) -> Self {
        Self {
            out,
            err,
            style,
            printed: 0,
        }
    }

    /// Write whatever part of `message.content` hasn't been written yet.
    pub fn emit_progress(&mut self, message: &Message) {
        let content = message.content.as_str();
        // A shrunk or rewritten content can't be patched in place; the
        // printed prefix stays and we resync.
        let Some(rest) = content.get(self.printed..) else {
            self.printed = content.len();
            return;
        };
        if rest.is_empty() {
            return;
        }
        let _ = write!(self.out, "{rest}");
        let _ = self.out.flush();
        self.printed = content.len();
    }

    /// Finish a reply: trailing newline, then the thought and file summary.
    pub fn emit_end(&mut self, message: &Message) {
        self.emit_progress(message);
        if self.printed > 0 {
            let _ = writeln!(self.out);
        }
        self.printed = 0;

        if !message.thoughts.is_empty() {
            let _ = write!(
                self.err,
                "{}{}{}",
                self.style.dim(),
                format_thoughts(&message.thoughts),
                self.style.reset()
            );
        }
        if !message.files.is_empty() {
            let _ = write!(
                self.err,
                "{}{}{}",
                self.style.dim(),
                format_files(&message.files),
                self.style.reset()
            );
        }
        let _ = self.out.flush();
        let _ = self.err.flush();
    }

    /// Print a complete answer at once (blocking mode).
    pub fn emit_answer(&mut self, content: &str) {
        let _ = writeln!(self.out, "{content}");
        let _ = self.out.flush();
    }

    pub fn emit_error(&mut self, reason: &str) {
        let _ = writeln!(
            self.err,
            "{}error: {reason}{}",
            self.style.red(),
            self.style.reset()
        );
        let _ = self.err.flush();
    }
}
