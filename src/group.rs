//! Human-readable framing of the wire stream.
//!
//! [`GroupWriter`] sits between the encoder and the real output and lays
//! letters out in fixed-width groups, a few groups per line:
//!
//! ```text
//! ZYZKE YZYZH IZXEF ...
//! ```
//!
//! Separators are not letters, so the decoder drops them and a grouped
//! stream decodes exactly like the bare one.

use std::io::{self, Write};

pub const DEFAULT_GROUP_LEN: usize = 5;
pub const DEFAULT_GROUPS_PER_LINE: usize = 6;
/// Bytes buffered before they are passed to the inner writer.
pub const DEFAULT_BUFFER_LEN: usize = 4096;

/// Writer that inserts a space every `group_len` letters and a newline
/// every `groups_per_line` groups.  Non-letters written to it are dropped.
pub struct GroupWriter<W: Write> {
    inner:           W,
    buf:             Vec<u8>,
    capacity:        usize,
    group_len:       usize,
    groups_per_line: usize,
    /// Letters in the current group.
    in_group:        usize,
    /// Completed groups on the current line.
    on_line:         usize,
    pub letters_written: u64,
}

impl<W: Write> GroupWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_layout(inner, DEFAULT_GROUP_LEN, DEFAULT_GROUPS_PER_LINE)
    }

    /// `group_len` of zero disables grouping; `groups_per_line` of zero
    /// keeps everything on one line.
    pub fn with_layout(inner: W, group_len: usize, groups_per_line: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(DEFAULT_BUFFER_LEN),
            capacity: DEFAULT_BUFFER_LEN,
            group_len,
            groups_per_line,
            in_group: 0,
            on_line: 0,
            letters_written: 0,
        }
    }

    fn push(&mut self, letter: u8) {
        if self.group_len > 0 && self.in_group == self.group_len {
            self.in_group = 0;
            self.on_line += 1;
            if self.groups_per_line > 0 && self.on_line == self.groups_per_line {
                self.on_line = 0;
                self.buf.push(b'\n');
            } else {
                self.buf.push(b' ');
            }
        }
        self.buf.push(letter);
        self.in_group += 1;
        self.letters_written += 1;
    }

    fn flush_if_full(&mut self) -> io::Result<()> {
        if self.buf.len() >= self.capacity {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }

    /// Terminate the last line and flush.  Returns the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        if self.letters_written > 0 {
            self.buf.push(b'\n');
        }
        self.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for GroupWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &b in buf.iter().filter(|b| b.is_ascii_uppercase()) {
            self.push(b);
            self.flush_if_full()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.inner.write_all(&self.buf)?;
            self.buf.clear();
        }
        self.inner.flush()
    }
}
