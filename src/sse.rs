//! Incremental `text/event-stream` decoding.
//!
//! Network reads do not respect event boundaries, so the decoder keeps the
//! unterminated tail of the previous read and only interprets complete lines.

use futures::{Stream, StreamExt};

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data(data: impl Into<String>) -> Self {
        Self { event: None, data: data.into() }
    }

    pub fn is_done(&self) -> bool {
        self.data.trim() == DONE_SENTINEL
    }

    pub fn is_error(&self) -> bool {
        self.event.as_deref() == Some("error")
    }
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(frame) = self.process_line(line) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flushes a trailing frame that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buf.is_empty() {
            let raw = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&raw).trim_end_matches('\r').to_string();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "data" => self.data.push(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event: self.event.take(), data })
    }
}

/// Adapts a stream of byte chunks into a stream of frames. Transport errors are
/// passed through in order; a trailing unterminated frame is flushed at EOF.
pub fn decode_stream<S, B, E>(bytes: S) -> impl Stream<Item = Result<SseFrame, E>>
where
    S: Stream<Item = Result<B, E>>,
    B: AsRef<[u8]>,
{
    bytes
        .map(Some)
        .chain(futures::stream::once(futures::future::ready(None)))
        .scan(SseDecoder::new(), |decoder, chunk| {
            let batch: Vec<Result<SseFrame, E>> = match chunk {
                Some(Ok(bytes)) => decoder.push(bytes.as_ref()).into_iter().map(Ok).collect(),
                Some(Err(e)) => vec![Err(e)],
                None => decoder.finish().into_iter().map(Ok).collect(),
            };
            futures::future::ready(Some(futures::stream::iter(batch)))
        })
        .flatten()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_split_across_reads() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: {\"text\":\"Hel").is_empty());
        let frames = dec.push(b"lo\"}\n\ndata: [DO");
        assert_eq!(frames, vec![SseFrame::data(r#"{"text":"Hello"}"#)]);
        let frames = dec.push(b"NE]\n\n");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_done());
    }

    #[test]
    fn several_frames_in_one_read_with_crlf() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b"data: a\r\n\r\ndata: b\r\n\r\n");
        assert_eq!(frames, vec![SseFrame::data("a"), SseFrame::data("b")]);
    }

    #[test]
    fn comments_events_and_multiline_data() {
        let mut dec = SseDecoder::new();
        let frames = dec.push(b": keep-alive\n\nevent: error\ndata: one\ndata: two\n\n");
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_error());
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn multibyte_text_split_mid_character() {
        let text = "data: héllo\n\n".as_bytes();
        let split = text.iter().position(|b| *b == 0xc3).unwrap() + 1;
        let mut dec = SseDecoder::new();
        assert!(dec.push(&text[..split]).is_empty());
        assert_eq!(dec.push(&text[split..]), vec![SseFrame::data("héllo")]);
    }

    #[test]
    fn finish_flushes_unterminated_frame() {
        let mut dec = SseDecoder::new();
        assert!(dec.push(b"data: tail").is_empty());
        assert_eq!(dec.finish(), Some(SseFrame::data("tail")));
        assert_eq!(dec.finish(), None);
    }

    #[tokio::test]
    async fn decode_stream_passes_errors_through() {
        let chunks: Vec<Result<&[u8], &str>> = vec![
            Ok(&b"data: x\n"[..]),
            Ok(&b"\n"[..]),
            Err("reset"),
            Ok(&b"data: y\n\n"[..]),
        ];
        let out: Vec<_> = decode_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(out, vec![Ok(SseFrame::data("x")), Err("reset"), Ok(SseFrame::data("y"))]);
    }

    #[tokio::test]
    async fn decode_stream_flushes_tail_at_eof() {
        let chunks: Vec<Result<&[u8], &str>> = vec![Ok(&b"data: a\n\ndata: [DONE]"[..])];
        let out: Vec<_> = decode_stream(futures::stream::iter(chunks)).collect().await;
        assert_eq!(out, vec![Ok(SseFrame::data("a")), Ok(SseFrame::data("[DONE]"))]);
    }
}
