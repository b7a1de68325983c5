use bytes::Bytes;

/// One server-sent event: optional `event:` name plus the joined `data:`
/// payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn is_done(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

/// Incremental SSE decoder. Bytes are pushed as they arrive; complete events
/// are returned once their terminating blank line is seen. A partial line is
/// held in the residual buffer across pushes.
#[derive(Debug, Default)]
pub struct SseDecoder {
    residual: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &Bytes) -> Vec<SseFrame> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.residual.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.residual.find('\n') {
            let mut line = self.residual[..pos].to_string();
            self.residual.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            self.take_line(&line, &mut frames);
        }
        frames
    }

    /// Flush at upstream EOF: a final unterminated line still counts.
    pub fn finish(&mut self) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        if !self.residual.is_empty() {
            let mut line = std::mem::take(&mut self.residual);
            if line.ends_with('\r') {
                line.pop();
            }
            self.take_line(&line, &mut frames);
        }
        self.flush_pending(&mut frames);
        frames
    }

    fn take_line(&mut self, line: &str, frames: &mut Vec<SseFrame>) {
        if line.is_empty() {
            self.flush_pending(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = (!value.is_empty()).then(|| value.to_string());
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        }
        // Unknown fields (id:, retry:, bare names) are ignored.
    }

    fn flush_pending(&mut self, frames: &mut Vec<SseFrame>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        frames.push(SseFrame {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}

/// Encode one SSE frame. Multi-line data gets one `data:` field per line;
/// every frame ends with a blank line.
pub fn encode_frame(event: Option<&str>, data: &str) -> Bytes {
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

pub fn done_frame() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_across_pushes() {
        let mut dec = SseDecoder::new();
        assert!(dec.push_str("data: {\"a\"").is_empty());
        let frames = dec.push_str(":1}\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "{\"a\":1}");
        assert_eq!(frames[0].event, None);
    }

    #[test]
    fn named_event_and_multiline_data() {
        let mut dec = SseDecoder::new();
        let frames = dec.push_str("event: message_delta\ndata: line1\ndata: line2\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message_delta"));
        assert_eq!(frames[0].data, "line1\nline2");
    }

    #[test]
    fn comments_are_skipped() {
        let mut dec = SseDecoder::new();
        let frames = dec.push_str(": keep-alive\n\ndata: x\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "x");
    }

    #[test]
    fn finish_flushes_residual() {
        let mut dec = SseDecoder::new();
        assert!(dec.push_str("data: tail").is_empty());
        let frames = dec.finish();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data, "tail");
    }

    #[test]
    fn done_marker_detected() {
        let mut dec = SseDecoder::new();
        let frames = dec.push_str("data: [DONE]\n\n");
        assert!(frames[0].is_done());
    }

    #[test]
    fn encode_ends_with_blank_line() {
        let bytes = encode_frame(None, "{\"x\":1}");
        assert!(bytes.ends_with(b"\n\n"));
        let bytes = encode_frame(Some("response.completed"), "{}");
        assert_eq!(&bytes[..], b"event: response.completed\ndata: {}\n\n");
    }
}
