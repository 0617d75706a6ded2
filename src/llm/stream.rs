//! Cancellable chunk stream shared by every provider.
//!
//! A producer task decodes the raw body and pushes frames into a bounded
//! channel. Dropping the `ChatStream` aborts that task, which drops the
//! in-flight HTTP response.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::types::{StreamFrame, Usage};
use super::LlmError;

const CHANNEL_CAPACITY: usize = 64;
/// Cached text is replayed in pieces this large so consumers see the same
/// incremental shape as a live call.
const REPLAY_CHUNK_CHARS: usize = 64;

/// Per-provider decoder: one SSE `data:` payload in, zero or more frames out.
pub type EventDecoder = fn(&str) -> Vec<StreamFrame>;

pub struct ChatStream {
    rx: mpsc::Receiver<Result<StreamFrame, LlmError>>,
    task: Option<JoinHandle<()>>,
    cached: bool,
}

impl ChatStream {
    pub fn from_response(
        response: reqwest::Response,
        decode: EventDecoder,
        idle_timeout: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(pump(response, decode, idle_timeout, tx));
        Self {
            rx,
            task: Some(task),
            cached: false,
        }
    }

    /// Replays previously produced text through the same channel shape.
    pub fn replay(text: &str) -> Self {
        let frames = chunk_text(text, REPLAY_CHUNK_CHARS)
            .into_iter()
            .map(StreamFrame::Content)
            .collect();
        let mut stream = Self::from_frames(frames);
        stream.cached = true;
        stream
    }

    pub fn from_frames(frames: Vec<StreamFrame>) -> Self {
        let (tx, rx) = mpsc::channel(frames.len().max(1));
        for frame in frames {
            // Capacity covers every frame.
            let _ = tx.try_send(Ok(frame));
        }
        Self {
            rx,
            task: None,
            cached: false,
        }
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub async fn next_frame(&mut self) -> Option<Result<StreamFrame, LlmError>> {
        self.rx.recv().await
    }

    /// Drains the stream into the full text plus the last reported usage.
    pub async fn collect_text(mut self) -> Result<(String, Option<Usage>), LlmError> {
        let mut text = String::new();
        let mut usage: Option<Usage> = None;
        while let Some(frame) = self.next_frame().await {
            match frame? {
                StreamFrame::Content(c) => text.push_str(&c),
                StreamFrame::Usage(u) => usage = Some(usage.unwrap_or_default().merge(u)),
            }
        }
        Ok((text, usage))
    }
}

impl Stream for ChatStream {
    type Item = Result<StreamFrame, LlmError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn pump(
    mut response: reqwest::Response,
    decode: EventDecoder,
    idle_timeout: Duration,
    tx: mpsc::Sender<Result<StreamFrame, LlmError>>,
) {
    let mut lines = SseLines::default();
    loop {
        let chunk = match tokio::time::timeout(idle_timeout, response.chunk()).await {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                let _ = tx.send(Err(LlmError::Network(e))).await;
                return;
            }
            Err(_) => {
                let _ = tx
                    .send(Err(LlmError::Timeout(format!(
                        "no stream data for {}s",
                        idle_timeout.as_secs()
                    ))))
                    .await;
                return;
            }
        };
        for data in lines.push(&chunk) {
            for frame in decode(&data) {
                if tx.send(Ok(frame)).await.is_err() {
                    debug!("stream consumer went away");
                    return;
                }
            }
        }
    }
    for data in lines.finish() {
        for frame in decode(&data) {
            if tx.send(Ok(frame)).await.is_err() {
                return;
            }
        }
    }
}

/// Splits a byte stream into SSE `data:` payloads. Bytes are buffered until a
/// full line arrives so multi-byte characters split across chunks survive.
#[derive(Default)]
pub struct SseLines {
    buf: Vec<u8>,
}

impl SseLines {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(data) = data_payload(&line) {
                out.push(data);
            }
        }
        out
    }

    pub fn finish(&mut self) -> Vec<String> {
        let rest = std::mem::take(&mut self.buf);
        data_payload(&rest).into_iter().collect()
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    let data = line.strip_prefix("data:")?.trim_start();
    (!data.is_empty()).then(|| data.to_string())
}

fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars
        .chunks(size.max(1))
        .map(|c| c.iter().collect())
        .collect()
}
