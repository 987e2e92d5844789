use indispenso_core::cmd::LogBatch;
use indispenso_core::types::OutputStream;

/// A buffer is flushed once it holds more than this many lines.
pub const FLUSH_THRESHOLD: usize = 10;

/// Output lines of one command waiting to be sent to the server.
#[derive(Debug, Default)]
pub struct LogBuffer {
    output: Vec<String>,
    error: Vec<String>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line. Returns the drained batch once either stream exceeds
    /// [`FLUSH_THRESHOLD`] lines.
    pub fn push(&mut self, stream: OutputStream, line: String) -> Option<LogBatch> {
        match stream {
            OutputStream::Stdout => self.output.push(line),
            OutputStream::Stderr => self.error.push(line),
        }
        if self.output.len() > FLUSH_THRESHOLD || self.error.len() > FLUSH_THRESHOLD {
            Some(self.take())
        } else {
            None
        }
    }

    /// Drain both streams. The buffer is empty afterwards whatever happens
    /// to the returned batch.
    pub fn take(&mut self) -> LogBatch {
        LogBatch {
            output: std::mem::take(&mut self.output),
            error: std::mem::take(&mut self.error),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.output.is_empty() && self.error.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flushes_exactly_once_past_threshold() {
        let mut buf = LogBuffer::new();
        let mut flushes = Vec::new();
        for i in 0..=FLUSH_THRESHOLD {
            if let Some(batch) = buf.push(OutputStream::Stdout, format!("line {i}")) {
                flushes.push(batch);
            }
        }
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].output.len(), FLUSH_THRESHOLD + 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn stderr_counts_separately() {
        let mut buf = LogBuffer::new();
        for _ in 0..FLUSH_THRESHOLD {
            assert!(buf.push(OutputStream::Stdout, "o".into()).is_none());
            assert!(buf.push(OutputStream::Stderr, "e".into()).is_none());
        }
        let batch = buf.push(OutputStream::Stderr, "e".into()).unwrap();
        assert_eq!(batch.output.len(), FLUSH_THRESHOLD);
        assert_eq!(batch.error.len(), FLUSH_THRESHOLD + 1);
    }

    #[test]
    fn take_clears_buffer() {
        let mut buf = LogBuffer::new();
        buf.push(OutputStream::Stdout, "x".into());
        let batch = buf.take();
        assert_eq!(batch.output, vec!["x".to_string()]);
        assert!(buf.is_empty());
        assert!(buf.take().is_empty());
    }
}
