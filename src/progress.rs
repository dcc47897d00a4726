//! Step progress on the terminal
//!
//! Prints `[......] <step>` when a step starts and rewrites the bracket with
//! the result when it ends.

use std::io::Write;

use owo_colors::OwoColorize;

/// Terminal progress reporter
pub struct Progress {
    out: Option<Box<dyn Write + Send>>,
    open: bool,
}

impl Progress {
    /// Report to stdout
    pub fn stdout() -> Self {
        Self {
            out: Some(Box::new(std::io::stdout())),
            open: false,
        }
    }

    /// Report nowhere
    pub fn hidden() -> Self {
        Self {
            out: None,
            open: false,
        }
    }

    /// Report to an arbitrary writer
    pub fn to_writer(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Some(Box::new(out)),
            open: false,
        }
    }

    pub fn start(&mut self, step: &str) {
        if self.open {
            self.finish(&format!("{}", " done ".green()));
        }
        self.emit(format_args!("[......] {}", step));
        self.open = true;
    }

    /// Whether a step line is waiting for its result
    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn done(&mut self) {
        self.finish(&format!("{}", " done ".green()));
    }

    pub fn skipped(&mut self) {
        self.finish(&format!("{}", "skip  ".yellow()));
    }

    pub fn failed(&mut self) {
        self.finish(&format!("{}", "FAILED".red()));
    }

    /// A free-standing line (headers, summaries)
    pub fn line(&mut self, text: &str) {
        self.emit(format_args!("{}\n", text));
    }

    fn finish(&mut self, status: &str) {
        if !self.open {
            return;
        }
        self.open = false;
        self.emit(format_args!("\r[{}]\n", status));
    }

    fn emit(&mut self, args: std::fmt::Arguments<'_>) {
        if let Some(out) = self.out.as_mut() {
            let _ = out.write_fmt(args);
            let _ = out.flush();
        }
    }
}

impl std::fmt::Debug for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Progress")
            .field("enabled", &self.out.is_some())
            .field("open", &self.open)
            .finish()
    }
}
