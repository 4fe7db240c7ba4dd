//! Destinations for the text output of external programs.

use parking_lot::Mutex;
use std::fmt;

/// Receives command echoes and the merged stdout/stderr of external programs.
///
/// Sinks are shared between a workspace, its sub-workspaces and the reader
/// threads of a running program, so writes must be thread safe.
pub trait LogSink: Send + Sync + fmt::Debug {
    /// Writes raw text.
    fn write(&self, text: &str);

    /// Writes one line; a newline is appended.
    fn write_line(&self, line: &str) {
        self.write(&format!("{line}\n"));
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpLogSink;

impl LogSink for NoOpLogSink {
    fn write(&self, _text: &str) {}
}

/// Forwards program output to `tracing` at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn write(&self, text: &str) {
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            tracing::info!(target: "basilflow::workspace", "{}", line);
        }
    }
}

/// Accumulates output in memory.
#[derive(Debug, Default)]
pub struct BufferLogSink {
    buffer: Mutex<String>,
}

impl BufferLogSink {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    #[must_use]
    pub fn contents(&self) -> String {
        self.buffer.lock().clone()
    }

    /// Empties the buffer.
    pub fn clear(&self) {
        self.buffer.lock().clear();
    }
}

impl LogSink for BufferLogSink {
    fn write(&self, text: &str) {
        self.buffer.lock().push_str(text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_sink_collects_lines() {
        let sink = BufferLogSink::new();
        sink.write_line("bet asl asl_bet");
        sink.write("partial");
        sink.write(" line\n");

        assert_eq!(sink.contents(), "bet asl asl_bet\npartial line\n");

        sink.clear();
        assert!(sink.contents().is_empty());
    }

    #[test]
    fn test_other_sinks_accept_text() {
        NoOpLogSink.write_line("ignored");
        TracingLogSink.write("Iteration 3 of 20\n\n");
    }
}
