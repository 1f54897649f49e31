//! Output abstraction for the `print` native.
//!
//! Embedders pick where script output goes by supplying a [`PrintWriter`]:
//! [`StdPrint`] for stdout, [`CollectStringPrint`] to capture output in
//! tests, [`NoPrint`] to discard it.

use std::io::{self, Write as _};

/// Sink for `print` output.
///
/// `write_text` receives the formatted argument text; the trailing newline
/// arrives separately through `write_end` so writers can treat line
/// boundaries specially.
pub trait PrintWriter {
    /// Writes one formatted argument, without a trailing newline.
    fn write_text(&mut self, text: &str);

    /// Writes the line terminator.
    fn write_end(&mut self);
}

/// Default writer: line-buffered stdout. Write errors are ignored, matching
/// the behavior of printing to a closed pipe.
#[derive(Debug, Default)]
pub struct StdPrint {
    buffer: String,
}

impl PrintWriter for StdPrint {
    fn write_text(&mut self, text: &str) {
        self.buffer.push_str(text);
    }

    fn write_end(&mut self) {
        self.buffer.push('\n');
        let _ = io::stdout().write_all(self.buffer.as_bytes());
        let _ = io::stdout().flush();
        self.buffer.clear();
    }
}

impl Drop for StdPrint {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            let _ = io::stdout().write_all(self.buffer.as_bytes());
            let _ = io::stdout().flush();
        }
    }
}

/// Writer that collects all output into a string, for tests and embedding.
#[derive(Debug, Default)]
pub struct CollectStringPrint(String);

impl CollectStringPrint {
    #[must_use]
    pub fn new() -> Self {
        Self(String::new())
    }

    /// The output collected so far.
    #[must_use]
    pub fn output(&self) -> &str {
        self.0.as_str()
    }

    /// Consumes the writer and returns the collected output.
    #[must_use]
    pub fn into_output(self) -> String {
        self.0
    }
}

impl PrintWriter for CollectStringPrint {
    fn write_text(&mut self, text: &str) {
        self.0.push_str(text);
    }

    fn write_end(&mut self) {
        self.0.push('\n');
    }
}

/// Writer that discards all output.
#[derive(Debug, Default)]
pub struct NoPrint;

impl PrintWriter for NoPrint {
    fn write_text(&mut self, _text: &str) {}

    fn write_end(&mut self) {}
}
