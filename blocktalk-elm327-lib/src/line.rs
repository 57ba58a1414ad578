//! Turns the raw adapter byte stream into lines.

use crate::response::PROMPT;

/// Accumulates adapter output until a line terminator.
///
/// `\r` ends a line, `\n` is ignored, and the `>` prompt is delivered as a line
/// of its own (after flushing whatever preceded it). Empty lines are dropped.
#[derive(Debug, Default)]
pub struct LineAssembler {
    pending: String,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes, returning every line they complete.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            match byte {
                b'\r' => self.flush_into(&mut lines),
                b'>' => {
                    self.flush_into(&mut lines);
                    lines.push(PROMPT.to_string());
                }
                // Some adapters pad output with NULs
                b'\n' | 0 => {}
                _ => self.pending.push(char::from(byte)),
            }
        }
        lines
    }

    /// Whether a partial line is buffered.
    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    fn flush_into(&mut self, lines: &mut Vec<String>) {
        let line = self.pending.trim_end();
        if !line.is_empty() {
            lines.push(line.to_string());
        }
        self.pending.clear();
    }
}
