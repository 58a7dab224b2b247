use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream::{self, Stream};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use suitestream_core::{
    ConfigError, MessageStream, PushTransport, RunId, TransportError, TransportHandle,
};
use tracing::debug;

use crate::config::SseClientConfig;
use crate::decoder::SseDecoder;

/// [`PushTransport`] over HTTP server-sent events.
pub struct SseTransport {
    client: reqwest::Client,
    config: SseClientConfig,
}

impl SseTransport {
    pub fn new(config: SseClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ConfigError::new(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a transport using `SUITESTREAM_BASE_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(SseClientConfig::from_env()?)
    }

    pub fn config(&self) -> &SseClientConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl PushTransport for SseTransport {
    async fn open(&self, run_id: &RunId) -> Result<TransportHandle, TransportError> {
        let url = self.config.stream_url();
        debug!(run_id = %run_id, url = %url, "opening SSE run stream");
        let response = self
            .client
            .get(&url)
            .query(&[("runId", run_id.as_str())])
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await
            .map_err(|e| TransportError::connect(format!("SSE request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::connect(format!(
                "SSE stream request failed with status {status}"
            )));
        }
        Ok(TransportHandle::new(message_stream(
            response.bytes_stream(),
            self.config.max_frame_bytes,
        )))
    }
}

/// Turns a byte stream into the `data` payloads of its SSE frames.
pub(crate) fn message_stream<S, E>(bytes_stream: S, max_frame_bytes: usize) -> MessageStream
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    struct State<S> {
        bytes_stream: Pin<Box<S>>,
        decoder: SseDecoder,
        pending: VecDeque<String>,
        failure: Option<TransportError>,
        done: bool,
    }

    stream::try_unfold(
        State {
            bytes_stream: Box::pin(bytes_stream),
            decoder: SseDecoder::with_max_frame_bytes(max_frame_bytes),
            pending: VecDeque::new(),
            failure: None,
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(data) = state.pending.pop_front() {
                    return Ok(Some((data, state)));
                }
                if let Some(err) = state.failure.take() {
                    return Err(err);
                }
                if state.done {
                    return Ok(None);
                }
                match state.bytes_stream.next().await {
                    Some(Ok(chunk)) => {
                        let frames = state.decoder.push_chunk(&chunk);
                        state.pending.extend(frames.into_iter().map(|frame| frame.data));
                        if let Err(err) = state.decoder.check_pending() {
                            state.failure = Some(TransportError::stream(err.to_string()));
                        }
                    }
                    Some(Err(e)) => {
                        return Err(TransportError::stream(format!("SSE read failed: {e}")));
                    }
                    None => {
                        if state.decoder.pending_len() > 0 {
                            debug!(
                                bytes = state.decoder.pending_len(),
                                "SSE stream ended inside a frame"
                            );
                        }
                        state.done = true;
                    }
                }
            }
        },
    )
    .boxed()
}
