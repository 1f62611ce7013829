//! Output demultiplexing for the child's stdout and stderr.
//!
//! A [`StreamMultiplexer`] turns the child's output pipes into a sequence of
//! [`Chunk`]s, each carrying whatever stdout and stderr bytes arrived
//! together. Three implementations cover the ways stderr can be wired:
//!
//! | Strategy           | stderr                 | Interleaving      |
//! |--------------------|------------------------|-------------------|
//! | [`ReadinessPoll`]  | piped through bridge   | arrival order     |
//! | [`DirectRead`]     | inherited / file / merged | n/a (stdout only) |
//! | [`BufferedReplay`] | piped through bridge   | none; after exit  |
//!
//! The strategy is picked once per bridge from [`capabilities`]; parsing code
//! never branches on it.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::OnceLock;

use bytes::{Bytes, BytesMut};
use clap::ValueEnum;
use serde::Deserialize;
use tokio::io::AsyncReadExt;

use super::launcher::OutputReader;

/// Stdout and stderr bytes read together. Either side may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Chunk {
    /// Bytes read from the child's stdout.
    pub stdout: Bytes,
    /// Bytes read from the child's stderr.
    pub stderr: Bytes,
}

/// Boxed future returned by [`StreamMultiplexer::next_chunk`].
pub type ChunkFuture<'a> = Pin<Box<dyn Future<Output = io::Result<Option<Chunk>>> + Send + 'a>>;

/// Capability interface over the child's output pipes.
pub trait StreamMultiplexer: Send {
    /// Wait for the next chunk of output.
    ///
    /// Returns `Ok(None)` once every watched stream has reached end-of-stream.
    /// The sequence is not restartable.
    fn next_chunk(&mut self) -> ChunkFuture<'_>;
}

// ── Platform capability ──────────────────────────────────────────────────────

/// I/O capabilities of the running platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// A wait-for-any-ready primitive is available for pipes.
    pub readiness: bool,
}

/// Process-wide capability record, detected on first use.
#[must_use]
pub fn capabilities() -> &'static Capabilities {
    static CAPABILITIES: OnceLock<Capabilities> = OnceLock::new();
    CAPABILITIES.get_or_init(|| Capabilities {
        readiness: cfg!(any(unix, windows)),
    })
}

/// Configured demultiplexing strategy for piped stderr.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiplexerChoice {
    /// Readiness polling when the platform supports it, buffering otherwise.
    #[default]
    Auto,
    /// Always poll both pipes for readiness.
    Readiness,
    /// Collect everything after the child exits.
    Buffered,
}

/// Strategy actually used for an invocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Strategy {
    /// See [`ReadinessPoll`].
    ReadinessPoll,
    /// See [`DirectRead`].
    DirectRead,
    /// See [`BufferedReplay`].
    BufferedReplay,
}

impl MultiplexerChoice {
    /// Resolve the strategy used whenever stderr is piped through the bridge.
    #[must_use]
    pub fn resolve(self, caps: &Capabilities) -> Strategy {
        match self {
            Self::Auto if caps.readiness => Strategy::ReadinessPoll,
            Self::Auto | Self::Buffered => Strategy::BufferedReplay,
            Self::Readiness => Strategy::ReadinessPoll,
        }
    }
}

/// Build the multiplexer for one invocation.
///
/// Without a stderr pipe only stdout needs reading, whatever `piped` says.
#[must_use]
pub fn build(
    piped: Strategy,
    stdout: OutputReader,
    stderr: Option<OutputReader>,
    chunk_size: usize,
) -> Box<dyn StreamMultiplexer> {
    match (piped, stderr) {
        (_, None) | (Strategy::DirectRead, Some(_)) => Box::new(DirectRead::new(stdout, chunk_size)),
        (Strategy::ReadinessPoll, Some(stderr)) => {
            Box::new(ReadinessPoll::new(stdout, stderr, chunk_size))
        }
        (Strategy::BufferedReplay, Some(stderr)) => Box::new(BufferedReplay::new(stdout, stderr)),
    }
}

// ── ReadinessPoll ────────────────────────────────────────────────────────────

/// Waits on both pipes at once and yields from whichever is ready first.
///
/// A zero-length read marks that stream as finished; it is no longer
/// watched. The sequence ends when both are finished.
pub struct ReadinessPoll {
    stdout: Option<OutputReader>,
    stderr: Option<OutputReader>,
    chunk_size: usize,
}

impl ReadinessPoll {
    /// Watch `stdout` and `stderr`.
    #[must_use]
    pub fn new(stdout: OutputReader, stderr: OutputReader, chunk_size: usize) -> Self {
        Self {
            stdout: Some(stdout),
            stderr: Some(stderr),
            chunk_size: chunk_size.max(1),
        }
    }

    async fn poll_next(&mut self) -> io::Result<Option<Chunk>> {
        let Self {
            stdout,
            stderr,
            chunk_size,
        } = self;

        loop {
            if stdout.is_none() && stderr.is_none() {
                return Ok(None);
            }

            let mut out_buf = BytesMut::with_capacity(*chunk_size);
            let mut err_buf = BytesMut::with_capacity(*chunk_size);

            tokio::select! {
                read = read_watched(stdout, &mut out_buf) => {
                    if read? == 0 {
                        *stdout = None;
                        continue;
                    }
                    return Ok(Some(Chunk { stdout: out_buf.freeze(), stderr: Bytes::new() }));
                }
                read = read_watched(stderr, &mut err_buf) => {
                    if read? == 0 {
                        *stderr = None;
                        continue;
                    }
                    return Ok(Some(Chunk { stdout: Bytes::new(), stderr: err_buf.freeze() }));
                }
            }
        }
    }
}

impl StreamMultiplexer for ReadinessPoll {
    fn next_chunk(&mut self) -> ChunkFuture<'_> {
        Box::pin(self.poll_next())
    }
}

/// Read once from a watched stream; never resolves for a finished one.
async fn read_watched(stream: &mut Option<OutputReader>, buf: &mut BytesMut) -> io::Result<usize> {
    match stream {
        Some(reader) => reader.read_buf(buf).await,
        None => std::future::pending().await,
    }
}

// ── DirectRead ───────────────────────────────────────────────────────────────

/// Plain reads on stdout alone; stderr never passes through the bridge.
pub struct DirectRead {
    stdout: Option<OutputReader>,
    chunk_size: usize,
}

impl DirectRead {
    /// Read from `stdout` only.
    #[must_use]
    pub fn new(stdout: OutputReader, chunk_size: usize) -> Self {
        Self {
            stdout: Some(stdout),
            chunk_size: chunk_size.max(1),
        }
    }

    async fn poll_next(&mut self) -> io::Result<Option<Chunk>> {
        let Some(reader) = self.stdout.as_mut() else {
            return Ok(None);
        };

        let mut buf = BytesMut::with_capacity(self.chunk_size);
        if reader.read_buf(&mut buf).await? == 0 {
            self.stdout = None;
            return Ok(None);
        }

        Ok(Some(Chunk {
            stdout: buf.freeze(),
            stderr: Bytes::new(),
        }))
    }
}

impl StreamMultiplexer for DirectRead {
    fn next_chunk(&mut self) -> ChunkFuture<'_> {
        Box::pin(self.poll_next())
    }
}

// ── BufferedReplay ───────────────────────────────────────────────────────────

/// Reads both pipes to completion, then replays them as a single chunk.
///
/// Interleaving is lost and nothing is delivered until the child closes
/// both pipes, so this only suits short-lived children with small output.
pub struct BufferedReplay {
    pipes: Option<(OutputReader, OutputReader)>,
}

impl BufferedReplay {
    /// Collect `stdout` and `stderr`.
    #[must_use]
    pub fn new(stdout: OutputReader, stderr: OutputReader) -> Self {
        Self {
            pipes: Some((stdout, stderr)),
        }
    }

    async fn poll_next(&mut self) -> io::Result<Option<Chunk>> {
        let Some((mut stdout, mut stderr)) = self.pipes.take() else {
            return Ok(None);
        };

        let mut out = Vec::new();
        let mut err = Vec::new();
        let (out_read, err_read) =
            tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
        out_read?;
        err_read?;

        Ok(Some(Chunk {
            stdout: Bytes::from(out),
            stderr: Bytes::from(err),
        }))
    }
}

impl StreamMultiplexer for BufferedReplay {
    fn next_chunk(&mut self) -> ChunkFuture<'_> {
        Box::pin(self.poll_next())
    }
}
