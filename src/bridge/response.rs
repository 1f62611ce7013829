//! Pull-based response producer for one CGI invocation.
//!
//! [`CgiResponse`] owns the child process, its output multiplexer, and the
//! stdin feeder task. Each call to [`CgiResponse::next_event`] performs at
//! most one wait on the child's output and returns the next
//! [`BridgeEvent`]:
//!
//! ```text
//! StatusLine  HeaderLine*  BodyChunk*  (End | Fault)
//! ```
//!
//! The status and every header are queued together at the moment the header
//! block is finalized, so a consumer that has seen `StatusLine` can drain the
//! queued `HeaderLine`s without touching the child again.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::headers::{HeaderParser, Progress, ResponseHead};
use super::mux::{Chunk, StreamMultiplexer};
use crate::gateway::ErrorSink;
use crate::{AppError, Result};

/// Status sent when the bridge itself fails.
pub const INTERNAL_ERROR_STATUS: &str = "500 Internal Server Error";

/// Body sent with [`INTERNAL_ERROR_STATUS`].
pub const INTERNAL_ERROR_BODY: &str = "500 Internal Server Error\n";

/// One step of the response.
#[derive(Debug)]
pub enum BridgeEvent {
    /// The final status, e.g. `200 OK`. Always the first event.
    StatusLine(String),
    /// One response header, in the order the child sent it.
    HeaderLine(String, String),
    /// Body bytes, in the order the child wrote them.
    BodyChunk(Bytes),
    /// The response is complete. Repeats on further pulls.
    End,
    /// Reading the child's output failed after the head was sent.
    Fault(AppError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Accumulating,
    Streaming,
    Done,
}

/// Lazy response of one CGI invocation.
///
/// Dropping it before [`BridgeEvent::End`] aborts the stdin feeder, closes
/// the pipes and kills the child.
pub struct CgiResponse {
    command: Arc<str>,
    sink: ErrorSink,
    phase: Phase,
    pending: VecDeque<BridgeEvent>,
    parser: Option<HeaderParser>,
    mux: Option<Box<dyn StreamMultiplexer>>,
    feeder: Option<JoinHandle<Result<u64>>>,
    child: Option<Child>,
}

impl CgiResponse {
    /// A response for a running child.
    pub(crate) fn streaming(
        command: Arc<str>,
        sink: ErrorSink,
        child: Child,
        mux: Box<dyn StreamMultiplexer>,
        feeder: Option<JoinHandle<Result<u64>>>,
        max_header_line: usize,
    ) -> Self {
        Self {
            command,
            sink,
            phase: Phase::Accumulating,
            pending: VecDeque::new(),
            parser: Some(HeaderParser::new(max_header_line)),
            mux: Some(mux),
            feeder,
            child: Some(child),
        }
    }

    /// A finished internal-error response; `err` is logged to the sink.
    pub(crate) fn failed(command: Arc<str>, sink: ErrorSink, err: &AppError) -> Self {
        let mut response = Self {
            command,
            sink,
            phase: Phase::Done,
            pending: VecDeque::new(),
            parser: None,
            mux: None,
            feeder: None,
            child: None,
        };
        response.log_failure(err);
        response.queue_internal_error();
        response
    }

    /// Command line this response belongs to.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Pull the next event.
    pub async fn next_event(&mut self) -> BridgeEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            if self.phase == Phase::Done {
                return BridgeEvent::End;
            }
            self.pump().await;
        }
    }

    /// Whether queued header events are still waiting to be pulled.
    #[must_use]
    pub fn has_pending_header(&self) -> bool {
        matches!(self.pending.front(), Some(BridgeEvent::HeaderLine(..)))
    }

    /// Drive the response until its head is known, then split it into the
    /// head and a lazy body stream.
    pub async fn into_parts(mut self) -> (ResponseHead, ResponseBody) {
        let mut status = None;
        let mut headers = Vec::new();
        let mut early = None;

        loop {
            match self.next_event().await {
                BridgeEvent::StatusLine(line) => status = Some(line),
                BridgeEvent::HeaderLine(name, value) => headers.push((name, value)),
                event => {
                    early = Some(event);
                    break;
                }
            }
            if status.is_some() && !self.has_pending_header() {
                break;
            }
        }

        let head = ResponseHead {
            status: status.unwrap_or_else(|| INTERNAL_ERROR_STATUS.to_owned()),
            headers,
        };
        if let Some(event) = early {
            self.pending.push_front(event);
        }
        (head, ResponseBody::new(self))
    }

    async fn pump(&mut self) {
        let Some(mux) = self.mux.as_mut() else {
            self.complete().await;
            return;
        };

        let next = mux.next_chunk().await;
        match next {
            Ok(Some(chunk)) => self.accept(chunk).await,
            Ok(None) => self.exhausted().await,
            Err(err) => self.fault(AppError::Io(format!("failed to read cgi output: {err}"))).await,
        }
    }

    async fn accept(&mut self, chunk: Chunk) {
        if !chunk.stderr.is_empty() {
            self.sink.write_stderr(&self.command, &chunk.stderr);
        }
        if chunk.stdout.is_empty() {
            return;
        }

        match self.phase {
            Phase::Accumulating => {
                let Some(parser) = self.parser.as_mut() else {
                    return;
                };
                let progress = parser.feed(&chunk.stdout);
                self.flush_warnings();
                match progress {
                    Ok(Progress::Pending) => {}
                    Ok(Progress::Finalized { head, body }) => {
                        self.finalize(head);
                        if !body.is_empty() {
                            self.pending.push_back(BridgeEvent::BodyChunk(body));
                        }
                    }
                    Err(err) => self.abort(&err).await,
                }
            }
            Phase::Streaming => self.pending.push_back(BridgeEvent::BodyChunk(chunk.stdout)),
            Phase::Done => {}
        }
    }

    async fn exhausted(&mut self) {
        if let (Phase::Accumulating, Some(parser)) = (self.phase, self.parser.as_mut()) {
            let finished = parser.finish();
            self.flush_warnings();
            match finished {
                Ok(head) => self.finalize(head),
                Err(err) => {
                    self.abort(&err).await;
                    return;
                }
            }
        }
        self.complete().await;
    }

    async fn fault(&mut self, err: AppError) {
        if self.phase == Phase::Accumulating {
            self.abort(&err).await;
            return;
        }
        self.sink.log(&self.command, &err.to_string());
        self.terminate().await;
        self.pending.push_back(BridgeEvent::Fault(err));
        self.phase = Phase::Done;
    }

    /// Queue the head and switch to raw body passthrough.
    fn finalize(&mut self, head: ResponseHead) {
        debug!(command = %self.command, status = %head.status, "cgi response finalized");
        self.pending.push_back(BridgeEvent::StatusLine(head.status));
        self.pending.extend(
            head.headers
                .into_iter()
                .map(|(name, value)| BridgeEvent::HeaderLine(name, value)),
        );
        self.parser = None;
        self.phase = Phase::Streaming;
    }

    /// Fail before finalization: log, kill the child, send a 500.
    async fn abort(&mut self, err: &AppError) {
        self.log_failure(err);
        self.terminate().await;
        self.pending.clear();
        self.queue_internal_error();
        self.parser = None;
        self.phase = Phase::Done;
    }

    /// Normal completion: reap the child, then join the feeder.
    ///
    /// A feeder still running once the child has exited is waiting on a
    /// request body that will never matter, so it is aborted.
    async fn complete(&mut self) {
        self.mux = None;

        if let Some(mut child) = self.child.take() {
            match child.wait().await {
                Ok(status) if status.success() => {
                    debug!(command = %self.command, "cgi process exited");
                }
                Ok(status) => warn!(command = %self.command, %status, "cgi process exited with failure"),
                Err(err) => warn!(command = %self.command, %err, "error waiting for cgi process"),
            }
        }

        if let Some(feeder) = self.feeder.take() {
            if !feeder.is_finished() {
                feeder.abort();
            }
            match feeder.await {
                Ok(Ok(copied)) => debug!(command = %self.command, copied, "cgi stdin closed"),
                Ok(Err(err)) => self.sink.log(&self.command, &err.to_string()),
                Err(err) if err.is_cancelled() => {
                    debug!(command = %self.command, "request body unfinished at cgi exit");
                }
                Err(err) => self
                    .sink
                    .log(&self.command, &format!("stdin task failed: {err}")),
            }
        }

        self.phase = Phase::Done;
    }

    /// Close everything and kill the child without draining its output.
    async fn terminate(&mut self) {
        self.mux = None;
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        if let Some(mut child) = self.child.take() {
            child.kill().await.ok();
        }
    }

    fn log_failure(&self, err: &AppError) {
        let message = match err {
            AppError::MalformedHeader(line) => format!("invalid header: {line}"),
            AppError::Launch(msg) | AppError::Length(msg) | AppError::Io(msg) | AppError::Config(msg) => {
                msg.clone()
            }
        };
        self.sink.log(&self.command, &message);
    }

    fn flush_warnings(&mut self) {
        let Some(parser) = self.parser.as_mut() else {
            return;
        };
        for warning in parser.take_warnings() {
            self.sink.warn(&self.command, &warning);
        }
    }

    fn queue_internal_error(&mut self) {
        self.pending.extend([
            BridgeEvent::StatusLine(INTERNAL_ERROR_STATUS.to_owned()),
            BridgeEvent::HeaderLine("Content-Type".to_owned(), "text/plain".to_owned()),
            BridgeEvent::BodyChunk(Bytes::from_static(INTERNAL_ERROR_BODY.as_bytes())),
            BridgeEvent::End,
        ]);
    }
}

impl Drop for CgiResponse {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
        if let Some(child) = self.child.as_mut() {
            if self.phase != Phase::Done {
                debug!(command = %self.command, "cgi response abandoned; killing process");
            }
            child.start_kill().ok();
        }
    }
}

impl std::fmt::Debug for CgiResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CgiResponse")
            .field("command", &self.command)
            .field("phase", &self.phase)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

/// Lazy response body.
///
/// Yields body chunks until the child's output is exhausted. A read failure
/// after the head was sent surfaces as one `Err` item, then the stream ends.
pub struct ResponseBody {
    inner: BoxStream<'static, io::Result<Bytes>>,
}

impl ResponseBody {
    fn new(response: CgiResponse) -> Self {
        let inner = stream::unfold(Some(response), |state| async move {
            let mut response = state?;
            match response.next_event().await {
                BridgeEvent::BodyChunk(bytes) => Some((Ok(bytes), Some(response))),
                BridgeEvent::Fault(err) => Some((Err(io::Error::other(err)), None)),
                BridgeEvent::End | BridgeEvent::StatusLine(_) | BridgeEvent::HeaderLine(..) => None,
            }
        })
        .boxed();
        Self { inner }
    }

    /// Collect the whole body.
    ///
    /// # Errors
    ///
    /// Returns the first read failure.
    pub async fn read_to_end(mut self) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        while let Some(chunk) = self.inner.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(body)
    }
}

impl Stream for ResponseBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResponseBody")
    }
}
