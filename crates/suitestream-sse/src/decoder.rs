/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

/// Default cap on a single frame, including its fields.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("SSE frame exceeds {limit} bytes without a terminator ({pending} buffered)")]
pub struct FrameTooLarge {
    pub limit: usize,
    pub pending: usize,
}

/// Incremental `text/event-stream` decoder.
///
/// Chunks may split frames (and lines) anywhere; bytes are buffered until a
/// blank line completes the frame. Each byte is scanned for a terminator once.
#[derive(Debug)]
pub struct SseDecoder {
    buf: Vec<u8>,
    /// Offset in `buf` where the next terminator search starts.
    scanned: usize,
    max_frame_bytes: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            max_frame_bytes,
        }
    }

    /// Appends a chunk and returns the frames it completed, in order.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some((idx, delim_len)) = find_frame_delimiter(&self.buf, self.scanned) {
            let frame_bytes: Vec<u8> = self.buf.drain(..idx + delim_len).take(idx).collect();
            self.scanned = 0;
            if let Some(frame) = parse_sse_frame(&frame_bytes) {
                frames.push(frame);
            }
        }
        // "\r\n\r\n" can straddle the next chunk by up to three bytes.
        self.scanned = self.buf.len().saturating_sub(3);
        frames
    }

    /// Fails once the unterminated frame outgrows the cap; the buffer is
    /// discarded so the decoder can be dropped or reused.
    pub fn check_pending(&mut self) -> Result<(), FrameTooLarge> {
        if self.buf.len() <= self.max_frame_bytes {
            return Ok(());
        }
        let pending = self.buf.len();
        self.buf.clear();
        self.scanned = 0;
        Err(FrameTooLarge {
            limit: self.max_frame_bytes,
            pending,
        })
    }

    /// Bytes of an incomplete frame still waiting for its terminator.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

fn find_frame_delimiter(buf: &[u8], start: usize) -> Option<(usize, usize)> {
    let mut i = start;
    while i + 1 < buf.len() {
        if buf[i] == b'\n' && buf[i + 1] == b'\n' {
            return Some((i, 2));
        }
        if buf[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        i += 1;
    }
    None
}

fn parse_sse_frame(bytes: &[u8]) -> Option<SseFrame> {
    let text = String::from_utf8_lossy(bytes);
    let mut event = None;
    let mut data_lines: Vec<&str> = Vec::new();
    for raw_line in text.split('\n') {
        let line = raw_line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => data_lines.push(value),
            "event" => event = Some(value.to_string()),
            // id and retry carry nothing the run stream uses
            _ => {}
        }
    }
    if data_lines.is_empty() {
        return None;
    }
    Some(SseFrame {
        event,
        data: data_lines.join("\n"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_survive_arbitrary_chunk_boundaries() {
        let body = b"data: {\"type\":\"batchStart\"}\n\ndata: {\"type\":\"done\"}\n\n";
        for split in 0..body.len() {
            let mut decoder = SseDecoder::new();
            let mut frames = decoder.push_chunk(&body[..split]);
            frames.extend(decoder.push_chunk(&body[split..]));
            let data: Vec<&str> = frames.iter().map(|f| f.data.as_str()).collect();
            assert_eq!(
                data,
                vec![r#"{"type":"batchStart"}"#, r#"{"type":"done"}"#],
                "split at {split}"
            );
            assert_eq!(decoder.pending_len(), 0);
        }
    }

    #[test]
    fn crlf_multiline_data_and_event_names() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push_chunk(b"event: run\r\ndata: line1\r\ndata:line2\r\n\r\n");
        assert_eq!(
            frames,
            vec![SseFrame {
                event: Some("run".into()),
                data: "line1\nline2".into(),
            }]
        );
    }

    #[test]
    fn terminator_split_across_many_small_chunks() {
        let mut decoder = SseDecoder::new();
        let mut frames = Vec::new();
        for byte in b"data: a\r\n\r\ndata: b\n\n" {
            frames.extend(decoder.push_chunk(std::slice::from_ref(byte)));
        }
        let data: Vec<&str> = frames.iter().map(|f| f.data.as_str()).collect();
        assert_eq!(data, vec!["a", "b"]);
        assert_eq!(decoder.pending_len(), 0);
    }

    #[test]
    fn unterminated_frame_beyond_cap_is_rejected() {
        let mut decoder = SseDecoder::with_max_frame_bytes(16);
        assert!(decoder.push_chunk(b"data: 0123456").is_empty());
        assert_eq!(decoder.check_pending(), Ok(()));
        assert!(decoder.push_chunk(b"789abcdef").is_empty());
        assert_eq!(
            decoder.check_pending(),
            Err(FrameTooLarge {
                limit: 16,
                pending: 22
            })
        );
        assert_eq!(decoder.pending_len(), 0);

        let frames = decoder.push_chunk(b"data: ok\n\n");
        assert_eq!(frames[0].data, "ok");
    }

    #[test]
    fn comments_and_dataless_frames_are_ignored() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push_chunk(b": keep-alive\n\nevent: ping\nid: 7\n\nretry: 1000\n\n");
        assert!(frames.is_empty());
        let frames = decoder.push_chunk(b"data: x\n");
        assert!(frames.is_empty());
        assert!(decoder.pending_len() > 0);
    }
}
