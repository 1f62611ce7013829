//! CGI response header parsing.
//!
//! The child's stdout starts with a header block: an optional
//! `Status: NNN reason` line, any number of `Name: value` lines, and a blank
//! line. [`HeaderParser`] accumulates stdout chunks, frames them into lines
//! with [`HeaderCodec`], and once the blank line arrives hands back the
//! finished [`ResponseHead`] plus whatever body bytes followed it.

use std::sync::OnceLock;

use bytes::{Bytes, BytesMut};
use regex::Regex;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

use crate::{AppError, Result};

/// Status used when the child never sends a `Status:` line.
pub const DEFAULT_STATUS: &str = "200 OK";

const STATUS_PREFIX: &str = "Status: ";

fn status_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^Status: [0-9]{3}").ok())
        .as_ref()
}

/// One classified line of the header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderLine {
    /// `Status: NNN reason`; carries `NNN reason`.
    Status(String),
    /// `Name: value`, both sides trimmed.
    Field(String, String),
    /// The blank line ending the header block.
    Blank,
}

/// Classify a single header line (without its line terminator).
///
/// # Errors
///
/// Returns `AppError::MalformedHeader` carrying the line when it is neither
/// blank, a status line, nor a `Name: value` pair.
pub fn classify_line(raw: &str) -> Result<HeaderLine> {
    let line = raw.trim();
    if line.is_empty() {
        return Ok(HeaderLine::Blank);
    }

    if status_pattern().is_some_and(|pattern| pattern.is_match(line)) {
        return Ok(HeaderLine::Status(line[STATUS_PREFIX.len()..].to_owned()));
    }

    match line.split_once(':') {
        Some((name, value)) => Ok(HeaderLine::Field(
            name.trim().to_owned(),
            value.trim().to_owned(),
        )),
        None => Err(AppError::MalformedHeader(line.to_owned())),
    }
}

/// Line framing for the header block.
///
/// Wraps [`LinesCodec`] with a maximum line length so that a child that
/// never sends a newline cannot grow the buffer without bound. Lines are
/// split on `\n`; a trailing `\r` is removed.
#[derive(Debug)]
pub struct HeaderCodec(LinesCodec);

impl HeaderCodec {
    /// Create a codec accepting lines of up to `max_line` bytes.
    #[must_use]
    pub fn new(max_line: usize) -> Self {
        Self(LinesCodec::new_with_max_length(max_line))
    }
}

impl Decoder for HeaderCodec {
    type Item = HeaderLine;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0
            .decode(src)
            .map_err(map_codec_error)?
            .map(|line| classify_line(&line))
            .transpose()
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        self.0
            .decode_eof(src)
            .map_err(map_codec_error)?
            .map(|line| classify_line(&line))
            .transpose()
    }
}

fn map_codec_error(err: LinesCodecError) -> AppError {
    match err {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::MalformedHeader("header line too long".into())
        }
        LinesCodecError::Io(io_err) => AppError::MalformedHeader(io_err.to_string()),
    }
}

/// Finalized status and headers of a CGI response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status line, e.g. `404 Not Found`.
    pub status: String,
    /// Headers in the order the child sent them, duplicates kept.
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Serialize back into CGI header-block form, blank line included.
    #[must_use]
    pub fn to_cgi_block(&self) -> String {
        let mut block = format!("{STATUS_PREFIX}{}\r\n", self.status);
        for (name, value) in &self.headers {
            block.push_str(name);
            block.push_str(": ");
            block.push_str(value);
            block.push_str("\r\n");
        }
        block.push_str("\r\n");
        block
    }
}

/// Result of feeding stdout bytes to the parser.
#[derive(Debug, PartialEq, Eq)]
pub enum Progress {
    /// No blank line yet.
    Pending,
    /// The header block is complete.
    Finalized {
        /// Status and headers.
        head: ResponseHead,
        /// Bytes after the blank line; the start of the body.
        body: Bytes,
    },
}

/// Incremental header-block parser.
#[derive(Debug)]
pub struct HeaderParser {
    buffer: BytesMut,
    codec: HeaderCodec,
    status: Option<String>,
    headers: Vec<(String, String)>,
    warnings: Vec<String>,
}

impl HeaderParser {
    /// Create a parser accepting header lines of up to `max_line` bytes.
    #[must_use]
    pub fn new(max_line: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            codec: HeaderCodec::new(max_line),
            status: None,
            headers: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Append stdout bytes and consume every complete line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MalformedHeader` on the first line that is not a
    /// valid header line.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Progress> {
        self.buffer.extend_from_slice(chunk);
        while let Some(line) = self.codec.decode(&mut self.buffer)? {
            if self.apply(line) {
                return Ok(Progress::Finalized {
                    head: self.take_head(),
                    body: self.buffer.split().freeze(),
                });
            }
        }
        Ok(Progress::Pending)
    }

    /// Finish at end of output when no blank line was ever seen.
    ///
    /// Leftover unterminated text is parsed as one last header line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::MalformedHeader` if that last line is invalid.
    pub fn finish(&mut self) -> Result<ResponseHead> {
        while let Some(line) = self.codec.decode_eof(&mut self.buffer)? {
            if self.apply(line) {
                break;
            }
        }
        Ok(self.take_head())
    }

    /// Drain the warnings collected so far (duplicated status lines).
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }

    /// Record one line; `true` when it was the terminator.
    fn apply(&mut self, line: HeaderLine) -> bool {
        match line {
            HeaderLine::Blank => true,
            HeaderLine::Status(status) => {
                if self.status.is_some() {
                    self.warnings
                        .push(format!("duplicated Status header: {STATUS_PREFIX}{status}"));
                }
                self.status = Some(status);
                false
            }
            HeaderLine::Field(name, value) => {
                self.headers.push((name, value));
                false
            }
        }
    }

    fn take_head(&mut self) -> ResponseHead {
        ResponseHead {
            status: self
                .status
                .take()
                .unwrap_or_else(|| DEFAULT_STATUS.to_owned()),
            headers: std::mem::take(&mut self.headers),
        }
    }
}
