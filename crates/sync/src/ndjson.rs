/// Incremental newline splitter for streamed NDJSON bodies.
///
/// Chunks arrive on arbitrary byte boundaries; only complete lines are
/// released, and whitespace-only lines are dropped.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(line) = non_blank(line) {
                lines.push(line);
            }
        }
        lines
    }

    /// The trailing line when the body does not end with a newline.
    pub fn finish(self) -> Option<Vec<u8>> {
        non_blank(self.buf)
    }
}

fn non_blank(mut line: Vec<u8>) -> Option<Vec<u8>> {
    while line.last().is_some_and(|b| b.is_ascii_whitespace()) {
        line.pop();
    }
    if line.iter().all(|b| b.is_ascii_whitespace()) {
        None
    } else {
        Some(line)
    }
}
