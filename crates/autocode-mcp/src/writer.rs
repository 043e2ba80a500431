use std::io::Write;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::lock_unpoisoned;

/// The single outbound channel shared by the dispatcher and every stream thread.
///
/// A frame is encoded before the lock is taken and written as one
/// `write_all` of the full line, so lines from different threads never mix.
#[derive(Clone)]
pub struct OutboundWriter {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl std::fmt::Debug for OutboundWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundWriter").finish_non_exhaustive()
    }
}

impl OutboundWriter {
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(sink))),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn write_frame(&self, frame: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(frame).context("failed to encode outbound frame")?;
        line.push(b'\n');
        let mut sink = lock_unpoisoned(&self.inner);
        sink.write_all(&line)
            .context("failed to write outbound frame")?;
        sink.flush().context("failed to flush outbound frame")?;
        Ok(())
    }
}

/// In-memory sink for tests: clones share one buffer.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&lock_unpoisoned(&self.bytes)).to_string()
    }

    /// Every non-empty line decoded as JSON; undecodable lines are errors.
    pub fn frames(&self) -> Result<Vec<Value>> {
        self.contents()
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str::<Value>(line)
                    .with_context(|| format!("outbound line is not valid json: {line}"))
            })
            .collect()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        lock_unpoisoned(&self.bytes).extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use serde_json::json;

    use super::{OutboundWriter, SharedBuffer};

    #[test]
    fn functional_concurrent_frames_stay_line_atomic() {
        let buffer = SharedBuffer::new();
        let writer = OutboundWriter::new(buffer.clone());
        let handles = (0..4)
            .map(|worker| {
                let writer = writer.clone();
                thread::spawn(move || {
                    for index in 0..50 {
                        writer
                            .write_frame(&json!({"worker": worker, "index": index, "pad": "x".repeat(512)}))
                            .expect("write");
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().expect("join");
        }

        let frames = buffer.frames().expect("every line parses");
        assert_eq!(frames.len(), 200);
        for worker in 0..4 {
            let indices = frames
                .iter()
                .filter(|frame| frame["worker"] == worker)
                .map(|frame| frame["index"].as_u64().expect("index"))
                .collect::<Vec<_>>();
            assert_eq!(indices, (0..50).collect::<Vec<_>>());
        }
    }
}
