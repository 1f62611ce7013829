//! Error types shared across the bridge.

use std::fmt::{Display, Formatter};

/// Shared bridge result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Bridge error enumeration covering all failure modes of a CGI invocation.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// The CGI process could not be created (missing binary, bad format,
    /// permission denied). Carries the OS message.
    Launch(String),
    /// The declared `CONTENT_LENGTH` is not a non-negative integer.
    Length(String),
    /// A header line emitted by the CGI process is neither a status line nor
    /// a `Name: value` pair.
    MalformedHeader(String),
    /// Pipe or stream I/O failure.
    Io(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Launch(msg) => write!(f, "launch: {msg}"),
            Self::Length(msg) => write!(f, "content length: {msg}"),
            Self::MalformedHeader(msg) => write!(f, "malformed header: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
