//! Buffered control-file writer.
//!
//! The kernel's probe parser cannot handle a definition split across two
//! write calls, so complete lines are staged and the stage is pushed out
//! with 512 bytes of headroom left before the 4096-byte buffer would
//! fill. The headroom guarantees the next line, even a long one, still
//! fits whole before the next mandatory flush point.

use std::io::{self, Write};

pub const CTRL_BUF_SIZE: usize = 0x1000;
pub const CTRL_HEADROOM: usize = 0x200;
const FLUSH_AT: usize = CTRL_BUF_SIZE - CTRL_HEADROOM;

pub struct ControlWriter<W: Write> {
    inner: W,
    pending: Vec<u8>,
}

impl<W: Write> ControlWriter<W> {
    pub fn new(inner: W) -> Self {
        ControlWriter {
            inner,
            pending: Vec::with_capacity(CTRL_BUF_SIZE),
        }
    }

    /// Stage one complete control line. If the line would push the
    /// pending bytes past the flush threshold, everything staged so far
    /// is flushed first, so no chunk boundary ever falls inside a line.
    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        debug_assert!(line.ends_with('\n'));
        if !self.pending.is_empty() && self.pending.len() + line.len() > FLUSH_AT {
            self.flush()?;
        }
        self.pending.extend_from_slice(line.as_bytes());
        Ok(())
    }

    /// Push every staged line out in a single write. Staged bytes are
    /// kept on failure; nothing is ever handed to the kernel piecemeal.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.inner.write_all(&self.pending)?;
        self.inner.flush()?;
        self.pending.clear();
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every chunk the writer pushes down, optionally failing
    /// from the nth write onward.
    struct RecordingWriter {
        chunks: Vec<Vec<u8>>,
        fail_from: Option<usize>,
    }

    impl RecordingWriter {
        fn new() -> Self {
            RecordingWriter {
                chunks: Vec::new(),
                fail_from: None,
            }
        }

        fn failing_from(n: usize) -> Self {
            RecordingWriter {
                chunks: Vec::new(),
                fail_from: Some(n),
            }
        }
    }

    impl Write for RecordingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Some(n) = self.fail_from {
                if self.chunks.len() >= n {
                    return Err(io::Error::new(io::ErrorKind::Other, "injected"));
                }
            }
            self.chunks.push(buf.to_vec());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn line(i: usize) -> String {
        // ~100-byte lines, long enough to cross the threshold quickly.
        format!("p:kscope/p1_sym{i:04} sym{i:04}{:_<80}\n", "")
    }

    #[test]
    fn flush_lands_before_the_crossing_line() {
        let mut w = ControlWriter::new(RecordingWriter::new());
        let mut written = Vec::new();
        for i in 0..60 {
            let l = line(i);
            w.write_line(&l).unwrap();
            written.push(l);
        }
        w.flush().unwrap();

        let chunks = &w.get_ref().chunks;
        assert!(chunks.len() > 1, "sequence must cross the threshold");
        for chunk in chunks {
            // A chunk holds whole lines only.
            assert_eq!(*chunk.last().unwrap(), b'\n');
            // And stays below the buffer the kernel parser assumes.
            assert!(chunk.len() <= CTRL_BUF_SIZE - CTRL_HEADROOM);
        }
        let all: Vec<u8> = chunks.concat();
        assert_eq!(all, written.concat().into_bytes());
    }

    #[test]
    fn failing_flush_never_splits_a_line() {
        let mut w = ControlWriter::new(RecordingWriter::failing_from(1));
        let mut err = None;
        for i in 0..120 {
            if let Err(e) = w.write_line(&line(i)) {
                err = Some(e);
                break;
            }
        }
        let err = err.expect("injected failure must surface");
        assert_eq!(err.kind(), io::ErrorKind::Other);

        // Everything that did reach the writer is whole lines.
        for chunk in &w.get_ref().chunks {
            assert_eq!(*chunk.last().unwrap(), b'\n');
        }
    }

    #[test]
    fn small_sequences_flush_once() {
        let mut w = ControlWriter::new(RecordingWriter::new());
        w.write_line("p:kscope/p1_sys_open sys_open\n").unwrap();
        w.write_line("p:kscope/p1_sys_close sys_close\n").unwrap();
        assert!(w.get_ref().chunks.is_empty());
        w.flush().unwrap();
        assert_eq!(w.get_ref().chunks.len(), 1);
    }

    #[test]
    fn flush_on_empty_stage_is_a_no_op() {
        let mut w = ControlWriter::new(RecordingWriter::new());
        w.flush().unwrap();
        assert!(w.get_ref().chunks.is_empty());
    }
}
