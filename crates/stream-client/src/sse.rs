//! Incremental decoder for `text/event-stream` bodies.

/// Largest incomplete event the decoder holds before giving up on the stream.
pub const MAX_EVENT_BYTES: usize = 1024 * 1024;

/// Buffers raw body chunks and yields the `data` payload of each complete event.
///
/// Chunk boundaries are arbitrary: an event (or a UTF-8 sequence) may be split
/// across any number of chunks. Comment lines (`: keep-alive`) and events
/// without data are skipped. Multiple `data:` lines are joined with `\n`.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    limit: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_EVENT_BYTES)
    }
}

impl SseDecoder {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// True once the unfinished event outgrows the limit. The stream should be dropped.
    pub fn is_overflowing(&self) -> bool {
        self.buffer.len() > self.limit
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(end) = find_blank_line(&self.buffer) {
            let event: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let text = String::from_utf8_lossy(&event[..end]);
            if let Some(data) = event_data(&text) {
                payloads.push(data);
            }
        }
        payloads
    }
}

fn find_blank_line(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}

fn event_data(event: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in event.lines() {
        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let rest = rest.strip_prefix(' ').unwrap_or(rest);
        match data.as_mut() {
            Some(collected) => {
                collected.push('\n');
                collected.push_str(rest);
            }
            None => data = Some(rest.to_string()),
        }
    }
    data
}
