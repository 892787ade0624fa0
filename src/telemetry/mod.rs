//! Human-readable rendering for the stdout sink.

use std::io::IsTerminal;

use crate::event_bus::Event;

const LINE_COLOR: &str = "\x1b[35m";
const RESET_COLOR: &str = "\x1b[0m";

/// Color mode for formatter output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FormatterMode {
    /// Detect TTY capability via `stderr.is_terminal()`.
    #[default]
    Auto,
    /// Always include ANSI color codes.
    Colored,
    /// Never include color codes (logs, files).
    Plain,
}

impl FormatterMode {
    #[must_use]
    pub fn is_colored(self) -> bool {
        match self {
            FormatterMode::Auto => std::io::stderr().is_terminal(),
            FormatterMode::Colored => true,
            FormatterMode::Plain => false,
        }
    }
}

pub trait TelemetryFormatter: Send + Sync {
    fn render_event(&self, event: &Event) -> String;
}

/// Single-line plain text formatter with optional ANSI color.
#[derive(Default)]
pub struct PlainFormatter {
    mode: FormatterMode,
}

impl PlainFormatter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_mode(mode: FormatterMode) -> Self {
        Self { mode }
    }
}

impl TelemetryFormatter for PlainFormatter {
    fn render_event(&self, event: &Event) -> String {
        if self.mode.is_colored() {
            format!("{LINE_COLOR}{event}{RESET_COLOR}")
        } else {
            event.to_string()
        }
    }
}
