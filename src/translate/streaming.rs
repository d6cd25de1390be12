//! Relay of an upstream event stream to the caller.
//!
//! A [`RelaySession`] owns everything one streaming request needs: the upstream
//! byte stream, the line buffer, the rewriter and the counters. Nothing is shared
//! between sessions.
//!
//! ```text
//! AwaitingFirstChunk ──chunk──▶ Relaying ──end──▶ Flushing ──▶ Done
//!         │                        │
//!         └──────read error────────┴──────▶ Errored
//! ```
//!
//! Errors seen before the first output byte surface from [`RelaySession::start`]
//! so the caller can still answer with a status code. Later errors end the body
//! without writing anything more.

use super::sse::{EventRewriter, LineDecoder, Rewritten};
use crate::error::{ProxyError, Result};
use crate::logging::{truncate, LogLevel, SharedLogger};

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::convert::Infallible;
use std::fmt::Display;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

/// Body handed to the HTTP layer once the first output bytes are ready.
pub type RelayBody = Pin<Box<dyn Stream<Item = std::result::Result<Bytes, Infallible>> + Send>>;

const MAX_LOGGED_PAYLOAD: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    AwaitingFirstChunk,
    Relaying,
    Flushing,
    Done,
    Errored,
}

impl RelayState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Errored)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub chunks: u64,
    pub events: u64,
    pub dropped: u64,
}

/// Rewrites lines into an output buffer and keeps count of what happened.
struct EventEmitter {
    session: Uuid,
    rewriter: EventRewriter,
    logger: SharedLogger,
    stats: RelayStats,
}

impl EventEmitter {
    fn emit(&mut self, line: &str, out: &mut String) {
        match self.rewriter.rewrite_line(line) {
            Rewritten::Event(event) => {
                self.stats.events += 1;
                out.push_str(&event);
            }
            Rewritten::Blank => {}
            Rewritten::Dropped { payload, error } => {
                self.stats.dropped += 1;
                let payload = truncate(&payload, MAX_LOGGED_PAYLOAD);
                tracing::warn!(
                    session = %self.session,
                    error = %error,
                    payload,
                    "Dropping malformed upstream event"
                );
                self.logger.log_with_context(
                    LogLevel::Warn,
                    "relay",
                    "Dropped malformed upstream event",
                    serde_json::json!({
                        "session": self.session.to_string(),
                        "error": error.to_string(),
                        "payload": payload,
                    }),
                );
            }
        }
    }
}

/// Per-request streaming state.
pub struct RelaySession<S> {
    upstream: Pin<Box<S>>,
    decoder: LineDecoder,
    emitter: EventEmitter,
    state: RelayState,
    idle_timeout: Option<Duration>,
}

impl<S, E> RelaySession<S>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    pub fn new(upstream: S, rewriter: EventRewriter, logger: SharedLogger) -> Self {
        Self {
            upstream: Box::pin(upstream),
            decoder: LineDecoder::new(),
            emitter: EventEmitter {
                session: Uuid::new_v4(),
                rewriter,
                logger,
                stats: RelayStats::default(),
            },
            state: RelayState::AwaitingFirstChunk,
            idle_timeout: None,
        }
    }

    /// Abort the session when no chunk arrives within `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Abort the session when upstream sends a line longer than `limit` bytes.
    pub fn with_max_line_bytes(mut self, limit: Option<usize>) -> Self {
        self.decoder = LineDecoder::new().with_max_line(limit);
        self
    }

    pub fn id(&self) -> Uuid {
        self.emitter.session
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn stats(&self) -> RelayStats {
        self.emitter.stats
    }

    /// Wait for the first output and return the body that relays the rest.
    ///
    /// Fails only if the upstream errors, times out, or ends empty before any
    /// output was produced.
    pub async fn start(mut self) -> Result<RelayBody> {
        let first = match self.next_output().await {
            Ok(first) => first,
            Err(e) => {
                self.report();
                return Err(e);
            }
        };

        let mut session = self;
        let body = async_stream::stream! {
            if let Some(bytes) = first {
                yield Ok::<_, Infallible>(bytes);
            }
            loop {
                match session.next_output().await {
                    Ok(Some(bytes)) => yield Ok::<_, Infallible>(bytes),
                    Ok(None) => break,
                    // Headers are out; ending the body is all that is left.
                    Err(_) => break,
                }
            }
            session.report();
        };

        Ok(Box::pin(body))
    }

    /// Drive the state machine until output is ready or the session ends.
    ///
    /// `Ok(None)` means the session reached `Done`.
    pub async fn next_output(&mut self) -> Result<Option<Bytes>> {
        loop {
            match self.state {
                RelayState::Done | RelayState::Errored => return Ok(None),
                RelayState::Flushing => {
                    let out = self.flush();
                    self.state = RelayState::Done;
                    return Ok(out);
                }
                RelayState::AwaitingFirstChunk | RelayState::Relaying => {}
            }

            let step = match self.read_chunk().await {
                Ok(Some(chunk)) => {
                    self.state = RelayState::Relaying;
                    self.emitter.stats.chunks += 1;
                    self.rewrite_chunk(&chunk)
                }
                Ok(None) if self.state == RelayState::AwaitingFirstChunk => {
                    self.state = RelayState::Errored;
                    return Err(ProxyError::upstream(
                        "Received empty body from upstream for stream.",
                    ));
                }
                Ok(None) => {
                    self.state = RelayState::Flushing;
                    Ok(None)
                }
                Err(e) => Err(e),
            };

            match step {
                Ok(Some(out)) => return Ok(Some(out)),
                Ok(None) => {}
                Err(e) => {
                    self.state = RelayState::Errored;
                    tracing::warn!(session = %self.id(), error = %e, "Upstream stream failed");
                    self.emitter
                        .logger
                        .error("relay", format!("session={} {}", self.id(), e));
                    return Err(e);
                }
            }
        }
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>> {
        let next = self.upstream.next();
        let item = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, next).await.map_err(|_| {
                ProxyError::upstream(format!(
                    "No data received from upstream for {}s.",
                    limit.as_secs_f32()
                ))
            })?,
            None => next.await,
        };

        match item {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(ProxyError::upstream(format!(
                "Error processing stream from upstream: {e}"
            ))),
            None => Ok(None),
        }
    }

    fn rewrite_chunk(&mut self, chunk: &[u8]) -> Result<Option<Bytes>> {
        let lines = self
            .decoder
            .push(chunk)
            .map_err(|e| ProxyError::upstream(e.to_string()))?;
        let mut out = String::new();
        for line in lines {
            self.emitter.emit(&line, &mut out);
        }
        Ok(non_empty(out))
    }

    fn flush(&mut self) -> Option<Bytes> {
        let line = self.decoder.finish()?;
        let mut out = String::new();
        self.emitter.emit(&line, &mut out);
        non_empty(out)
    }

    fn report(&self) {
        let stats = self.emitter.stats;
        tracing::info!(
            session = %self.id(),
            state = ?self.state,
            chunks = stats.chunks,
            events = stats.events,
            dropped = stats.dropped,
            "Stream completed"
        );
        self.emitter.logger.log_with_context(
            LogLevel::Info,
            "relay",
            "Stream completed",
            serde_json::json!({
                "session": self.id().to_string(),
                "state": format!("{:?}", self.state),
                "chunks": stats.chunks,
                "events": stats.events,
                "dropped": stats.dropped,
            }),
        );
    }
}

impl<S> Drop for RelaySession<S> {
    fn drop(&mut self) {
        // The body was dropped mid-stream: the caller went away.
        if !self.state.is_terminal() {
            tracing::info!(session = %self.emitter.session, "Caller disconnected, releasing upstream");
            self.emitter.logger.info(
                "relay",
                format!("session={} caller disconnected", self.emitter.session),
            );
        }
    }
}

fn non_empty(out: String) -> Option<Bytes> {
    if out.is_empty() {
        None
    } else {
        Some(Bytes::from(out))
    }
}
