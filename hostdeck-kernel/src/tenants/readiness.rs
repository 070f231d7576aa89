use std::collections::VecDeque;

/// Longest partial line kept before it is flushed as a line of its own
const MAX_PARTIAL_LINE: usize = 8 * 1024;

/// Watches raw worker stdout for one of the readiness markers.
///
/// Output is fed chunk by chunk, newline or not. The last `longest marker - 1`
/// bytes are carried over so a marker split across two reads still matches.
#[derive(Debug, Clone)]
pub struct ReadinessDetector {
    markers: Vec<Vec<u8>>,
    carry: Vec<u8>,
    keep: usize,
    ready: bool,
}

impl ReadinessDetector {
    pub fn new(markers: &[String]) -> Self {
        let markers: Vec<Vec<u8>> = markers
            .iter()
            .filter(|m| !m.is_empty())
            .map(|m| m.as_bytes().to_vec())
            .collect();
        let keep = markers.iter().map(Vec::len).max().unwrap_or(1) - 1;
        Self {
            markers,
            carry: Vec::new(),
            keep,
            ready: false,
        }
    }

    /// Feed one chunk of output; stays true once a marker has been seen
    pub fn observe(&mut self, chunk: &[u8]) -> bool {
        if self.ready || self.markers.is_empty() {
            return self.ready;
        }
        self.carry.extend_from_slice(chunk);
        self.ready = self.markers.iter().any(|m| contains(&self.carry, m));

        let excess = self.carry.len().saturating_sub(self.keep);
        self.carry.drain(..excess);
        self.ready
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Splits raw output into lossily decoded lines
#[derive(Debug, Default)]
pub struct LineSplitter {
    partial: Vec<u8>,
}

impl LineSplitter {
    /// Complete lines found in `chunk`, without their line terminator
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for piece in chunk.split_inclusive(|b| *b == b'\n') {
            self.partial.extend_from_slice(piece);
            if piece.ends_with(b"\n") || self.partial.len() >= MAX_PARTIAL_LINE {
                lines.push(decode(&self.partial));
                self.partial.clear();
            }
        }
        lines
    }

    /// Whatever is left once the stream is closed
    pub fn finish(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            return None;
        }
        let line = decode(&self.partial);
        self.partial.clear();
        Some(line)
    }
}

fn decode(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

/// Last N lines of worker output, kept for error reports
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl OutputTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.min(256)),
            capacity,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn render(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}
