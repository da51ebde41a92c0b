//! # Log Stream Transcoder
//!
//! Decodes a container's multiplexed log stream into structured [`LogLine`]s.
//!
//! Each frame is an 8-byte header followed by a payload. Header byte 0 selects the
//! origin stream (1 = stdout, 2 = stderr), bytes 4..8 hold the payload length as a
//! big-endian `u32`, and the remaining header bytes are ignored. Frames may arrive
//! split across or packed into arbitrary chunks.
//!
//! The transcoder is a lazy, non-restartable [`Stream`]. It ends when the upstream
//! ends, or early when the consumer calls [`LogStreamTranscoder::stop`].

use crate::container::{ContainerError, LogByteStream};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::Stream;
use regex::Regex;
use serde::Serialize;
use std::pin::Pin;
use std::sync::OnceLock;
use std::task::{Context, Poll};

pub const STDOUT_STREAM: u8 = 1;
pub const STDERR_STREAM: u8 = 2;
pub const FRAME_HEADER_LEN: usize = 8;
/// Largest payload accepted in one frame before the stream is treated as corrupt
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub message: String,
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Build one multiplexed frame
pub fn encode_frame(stream: u8, payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.put_u8(stream);
    frame.put_bytes(0, 3);
    frame.put_u32(payload.len() as u32);
    frame.put_slice(payload);
    frame.freeze()
}

fn timestamp_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:\d{2}))\s?",
        )
        .expect("timestamp pattern is valid")
    })
}

/// Split a leading RFC3339-style timestamp from the message, if present
pub fn split_timestamp(text: &str) -> (Option<String>, &str) {
    match timestamp_pattern().captures(text) {
        Some(caps) => {
            let whole = caps.get(0).map_or(0, |m| m.end());
            let ts = caps.get(1).map(|m| m.as_str().to_string());
            (ts, &text[whole..])
        }
        None => (None, text),
    }
}

pub struct LogStreamTranscoder {
    upstream: Option<LogByteStream>,
    buffer: BytesMut,
    filter: Option<String>,
    timestamps: bool,
    max_frame_len: usize,
}

impl LogStreamTranscoder {
    pub fn new(upstream: LogByteStream) -> Self {
        Self {
            upstream: Some(upstream),
            buffer: BytesMut::new(),
            filter: None,
            timestamps: false,
            max_frame_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Drop frames whose payload does not contain `filter`
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into()).filter(|f: &String| !f.is_empty());
        self
    }

    /// Recognize and split a leading timestamp on every line
    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    /// Disconnect from the upstream. The stream then ends without an error.
    pub fn stop(&mut self) {
        self.upstream = None;
        self.buffer.clear();
    }

    pub fn is_stopped(&self) -> bool {
        self.upstream.is_none()
    }

    /// Pop complete frames off the buffer until one survives the filter
    fn next_buffered_line(&mut self) -> Option<Result<LogLine, ContainerError>> {
        while self.buffer.len() >= FRAME_HEADER_LEN {
            let stream = self.buffer[0];
            let len = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;
            if len > self.max_frame_len {
                self.stop();
                return Some(Err(ContainerError::InvalidResponse(format!(
                    "log frame of {len} bytes exceeds the {} byte limit",
                    self.max_frame_len
                ))));
            }
            if self.buffer.len() < FRAME_HEADER_LEN + len {
                return None;
            }

            self.buffer.advance(FRAME_HEADER_LEN);
            let payload = self.buffer.split_to(len);
            if let Some(line) = self.decode(stream, &payload) {
                return Some(Ok(line));
            }
        }
        None
    }

    fn decode(&self, stream: u8, payload: &[u8]) -> Option<LogLine> {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim_end_matches(['\n', '\r']);

        if let Some(filter) = &self.filter {
            if !text.contains(filter.as_str()) {
                return None;
            }
        }

        let (timestamp, message) = if self.timestamps {
            split_timestamp(text)
        } else {
            (None, text)
        };

        Some(LogLine {
            message: message.to_string(),
            is_error: stream == STDERR_STREAM,
            timestamp,
        })
    }
}

impl Stream for LogStreamTranscoder {
    type Item = Result<LogLine, ContainerError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            if let Some(item) = this.next_buffered_line() {
                return Poll::Ready(Some(item));
            }

            let Some(upstream) = this.upstream.as_mut() else {
                return Poll::Ready(None);
            };

            match upstream.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => this.buffer.extend_from_slice(&chunk),
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Some(Err(err))),
                Poll::Ready(None) => {
                    // A trailing partial frame is discarded
                    this.upstream = None;
                    this.buffer.clear();
                    return Poll::Ready(None);
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
