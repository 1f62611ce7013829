//! Gateway request contract consumed by the bridge.
//!
//! A [`GatewayRequest`] is what the outer server hands to the bridge for every
//! request: a flat metadata environment, an optional body reader, and the
//! [`ErrorSink`] that receives diagnostics and the CGI program's stderr.

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::AsyncRead;
use tracing::{error, warn};

/// Request body reader handed to the bridge.
pub type BodyReader = Box<dyn AsyncRead + Send + Unpin>;

/// Destination for bridge diagnostics and the child's stderr.
#[derive(Clone, Default)]
pub enum ErrorSink {
    /// The process-wide diagnostic stream. The child inherits the bridge's
    /// stderr and bridge messages are emitted through `tracing`.
    #[default]
    Diagnostic,
    /// A real file. The child writes its stderr straight into it.
    File(Arc<File>),
    /// An in-process buffer. The child's stderr is piped through the bridge.
    Memory(Arc<Mutex<Vec<u8>>>),
}

impl ErrorSink {
    /// Create an empty in-memory sink.
    #[must_use]
    pub fn memory() -> Self {
        Self::Memory(Arc::new(Mutex::new(Vec::new())))
    }

    /// Wrap an open file.
    #[must_use]
    pub fn file(file: File) -> Self {
        Self::File(Arc::new(file))
    }

    /// Everything written to a memory sink so far, lossily decoded.
    ///
    /// Always empty for the other variants.
    #[must_use]
    pub fn captured(&self) -> String {
        match self {
            Self::Memory(buffer) => {
                let guard = buffer.lock().unwrap_or_else(PoisonError::into_inner);
                String::from_utf8_lossy(&guard).into_owned()
            }
            Self::Diagnostic | Self::File(_) => String::new(),
        }
    }

    /// Forward raw stderr bytes from the child.
    pub fn write_stderr(&self, command: &str, bytes: &[u8]) {
        match self {
            Self::Diagnostic => {
                warn!(command, stderr = %String::from_utf8_lossy(bytes).trim_end(), "cgi stderr");
            }
            Self::File(file) => {
                if let Err(err) = (&**file).write_all(bytes) {
                    error!(command, %err, "failed to write to error sink");
                }
            }
            Self::Memory(buffer) => {
                buffer
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(bytes);
            }
        }
    }

    /// Log one bridge failure as `<command>: <message>`.
    pub fn log(&self, command: &str, message: &str) {
        match self {
            Self::Diagnostic => error!(command, "{message}"),
            Self::File(_) | Self::Memory(_) => self.write_line(command, message),
        }
    }

    /// Log one non-fatal bridge warning as `<command>: <message>`.
    pub fn warn(&self, command: &str, message: &str) {
        match self {
            Self::Diagnostic => warn!(command, "{message}"),
            Self::File(_) | Self::Memory(_) => self.write_line(command, message),
        }
    }

    fn write_line(&self, command: &str, message: &str) {
        self.write_stderr(command, format!("{command}: {message}\n").as_bytes());
    }
}

impl fmt::Debug for ErrorSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Diagnostic => f.write_str("ErrorSink::Diagnostic"),
            Self::File(file) => f.debug_tuple("ErrorSink::File").field(file).finish(),
            Self::Memory(_) => f.write_str("ErrorSink::Memory"),
        }
    }
}

/// One inbound request as seen by the bridge.
pub struct GatewayRequest {
    /// Request metadata: CGI meta-variables and `HTTP_*` header variables.
    pub environ: HashMap<String, String>,
    /// Request body, if any.
    pub body: Option<BodyReader>,
    /// Where diagnostics and child stderr go.
    pub errors: ErrorSink,
}

impl GatewayRequest {
    /// Build a request with no body and the default error sink.
    #[must_use]
    pub fn new(environ: HashMap<String, String>) -> Self {
        Self {
            environ,
            body: None,
            errors: ErrorSink::default(),
        }
    }

    /// Attach a request body.
    #[must_use]
    pub fn with_body(mut self, body: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.body = Some(Box::new(body));
        self
    }

    /// Bind an error sink.
    #[must_use]
    pub fn with_errors(mut self, errors: ErrorSink) -> Self {
        self.errors = errors;
        self
    }
}

impl fmt::Debug for GatewayRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayRequest")
            .field("environ", &self.environ)
            .field("body", &self.body.is_some())
            .field("errors", &self.errors)
            .finish()
    }
}
