//! Server-sent event framing.
//!
//! [`SseDecoder`] turns arbitrarily split byte chunks into complete frames.
//! It never fails: unknown fields are skipped, comment lines are dropped and
//! payload interpretation is left to [`SseFrame::payload`].

/// One dispatched event block (everything up to a blank line).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub id: Option<String>,
    /// `data` lines joined with `\n`.
    pub data: String,
    pub retry_ms: Option<u64>,
}

/// What a frame's data carries.
#[derive(Debug, Clone, PartialEq)]
pub enum SsePayload {
    /// Empty data; keep-alive frames.
    Heartbeat,
    Json(serde_json::Value),
    /// Data that is not valid JSON, kept verbatim.
    Text(String),
}

impl SseFrame {
    pub fn payload(&self) -> SsePayload {
        let trimmed = self.data.trim();
        if trimmed.is_empty() {
            return SsePayload::Heartbeat;
        }
        match serde_json::from_str(trimmed) {
            Ok(value) => SsePayload::Json(value),
            Err(_) => SsePayload::Text(trimmed.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct FrameBuilder {
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
    retry_ms: Option<u64>,
    touched: bool,
}

impl FrameBuilder {
    fn take(&mut self) -> Option<SseFrame> {
        if !self.touched {
            return None;
        }
        let builder = std::mem::take(self);
        Some(SseFrame {
            event: builder.event,
            id: builder.id,
            data: builder.data.join("\n"),
            retry_ms: builder.retry_ms,
        })
    }
}

/// Incremental frame decoder. Feed chunks with [`push`](Self::push) as they
/// arrive; a trailing block without its blank line is held until more bytes
/// come and is discarded at end of stream.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    current: FrameBuilder,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        let mut start = 0usize;

        while let Some(offset) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let end = start + offset;
            let mut line = &self.buf[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;

            if let Some(frame) = self.feed_line(&line) {
                frames.push(frame);
            }
        }

        self.buf.drain(..start);
        frames
    }

    /// Bytes received but not yet terminated by a newline.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.current.take();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => {
                self.current.data.push(value.to_string());
                self.current.touched = true;
            }
            "event" => {
                self.current.event = Some(value.to_string());
                self.current.touched = true;
            }
            "id" => {
                self.current.id = Some(value.to_string());
                self.current.touched = true;
            }
            "retry" => {
                if let Ok(ms) = value.trim().parse() {
                    self.current.retry_ms = Some(ms);
                    self.current.touched = true;
                }
            }
            _ => {}
        }
        None
    }
}

/// Decodes a complete buffer in one go.
pub fn parse_frames(bytes: &[u8]) -> Vec<SseFrame> {
    SseDecoder::new().push(bytes)
}
