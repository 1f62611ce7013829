//! CGI bridge core.
//!
//! [`CgiBridge`] holds the per-program settings and runs one CGI invocation
//! per [`GatewayRequest`]:
//!
//! 1. [`environ`] maps the request metadata into the child environment.
//! 2. [`launcher`] spawns the program with piped stdin/stdout.
//! 3. [`body`] copies the request body into stdin on its own task.
//! 4. [`mux`] reads stdout/stderr concurrently with that copy.
//! 5. [`headers`] parses the header block off stdout.
//! 6. [`response`] exposes the result as a pull-based event sequence.

pub mod body;
pub mod environ;
pub mod headers;
pub mod launcher;
pub mod mux;
pub mod response;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info_span, Instrument};

use crate::config::BridgeConfig;
use crate::gateway::{ErrorSink, GatewayRequest};
use crate::{AppError, Result};

use self::headers::ResponseHead;
use self::launcher::{ChildHandle, OutputReader, StderrRoute};
use self::mux::{capabilities, MultiplexerChoice, Strategy};
use self::response::{CgiResponse, ResponseBody};

/// Runs one CGI program for each gateway request.
#[derive(Debug, Clone)]
pub struct CgiBridge {
    command: Arc<str>,
    program: String,
    args: Vec<String>,
    overrides: HashMap<String, String>,
    merge_stderr: bool,
    strategy: Strategy,
    buffer_size: usize,
    max_header_line: usize,
}

impl CgiBridge {
    /// Create a bridge for `command`, split on whitespace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `command` is blank.
    pub fn new(command: &str) -> Result<Self> {
        let (program, args) = launcher::split_command(command)?;
        let command: Arc<str> = std::iter::once(program.as_str())
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
            .into();

        Ok(Self {
            command,
            program,
            args,
            overrides: HashMap::new(),
            merge_stderr: false,
            strategy: MultiplexerChoice::Auto.resolve(capabilities()),
            buffer_size: 64 * 1024,
            max_header_line: 1_048_576,
        })
    }

    /// Build a bridge from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the command is blank or an `[env]`
    /// value is not a string.
    pub fn from_config(config: &BridgeConfig) -> Result<Self> {
        Ok(Self::new(&config.command)?
            .with_overrides(config.overrides()?)
            .merge_stderr(config.merge_stderr)
            .with_multiplexer(config.multiplexer)
            .with_buffer_size(config.buffer_size)
            .with_max_header_line(config.max_header_line))
    }

    /// Variables exported to the child on top of the request's; they win on
    /// conflict.
    #[must_use]
    pub fn with_overrides(mut self, overrides: HashMap<String, String>) -> Self {
        self.overrides = overrides;
        self
    }

    /// Send the child's stderr into its stdout.
    #[must_use]
    pub fn merge_stderr(mut self, merge: bool) -> Self {
        self.merge_stderr = merge;
        self
    }

    /// Choose how piped stderr is demultiplexed.
    #[must_use]
    pub fn with_multiplexer(mut self, choice: MultiplexerChoice) -> Self {
        self.strategy = choice.resolve(capabilities());
        self
    }

    /// Chunk size for pipe reads and stdin copies.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(1);
        self
    }

    /// Longest accepted header line.
    #[must_use]
    pub fn with_max_header_line(mut self, size: usize) -> Self {
        self.max_header_line = size.max(1);
        self
    }

    /// The normalized command line.
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Strategy used when stderr is piped through the bridge.
    #[must_use]
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Start one CGI invocation.
    ///
    /// Never fails: launch and content-length problems are logged to the
    /// request's error sink and turned into a `500 Internal Server Error`
    /// response.
    pub async fn invoke(&self, request: GatewayRequest) -> CgiResponse {
        let GatewayRequest {
            environ,
            body,
            errors,
        } = request;

        let span = info_span!("cgi", command = %self.command);
        async move {
            let env = environ::map_environment(&environ, &self.overrides);

            let route = match self.stderr_route(&errors) {
                Ok(route) => route,
                Err(err) => return CgiResponse::failed(Arc::clone(&self.command), errors, &err),
            };

            let handle = match launcher::launch(&self.program, &self.args, &env, route) {
                Ok(handle) => handle,
                Err(err) => return CgiResponse::failed(Arc::clone(&self.command), errors, &err),
            };
            let ChildHandle {
                mut child,
                stdin,
                stdout,
                stderr,
            } = handle;

            let length = match body::declared_length(environ.get("CONTENT_LENGTH").map(String::as_str)) {
                Ok(length) => length,
                Err(err) => {
                    drop(stdin);
                    child.kill().await.ok();
                    return CgiResponse::failed(Arc::clone(&self.command), errors, &err);
                }
            };

            let feeder = match (stdin, body) {
                (Some(stdin), Some(input)) if length > 0 => {
                    let chunk = self.buffer_size;
                    Some(tokio::spawn(body::feed_stdin(input, stdin, length, chunk)))
                }
                // Dropping stdin here signals end-of-input to the child.
                _ => None,
            };

            let stderr = stderr.map(|pipe| -> OutputReader { Box::new(pipe) });
            let mux = mux::build(self.strategy, stdout, stderr, self.buffer_size);
            debug!(length, "cgi invocation running");

            CgiResponse::streaming(
                Arc::clone(&self.command),
                errors,
                child,
                mux,
                feeder,
                self.max_header_line,
            )
        }
        .instrument(span)
        .await
    }

    /// Gateway-style entry point: run the request, report the status and
    /// headers through `start_response` exactly once, and return the body.
    pub async fn respond<F>(&self, request: GatewayRequest, start_response: F) -> ResponseBody
    where
        F: FnOnce(&str, &[(String, String)]),
    {
        let (ResponseHead { status, headers }, body) = self.invoke(request).await.into_parts().await;
        start_response(&status, &headers);
        body
    }

    fn stderr_route(&self, errors: &ErrorSink) -> Result<StderrRoute> {
        if self.merge_stderr {
            return Ok(StderrRoute::Merged);
        }
        Ok(match errors {
            ErrorSink::Diagnostic => StderrRoute::Inherit,
            ErrorSink::File(file) => StderrRoute::File(
                file.try_clone()
                    .map_err(|err| AppError::Launch(format!("cannot share error sink: {err}")))?,
            ),
            ErrorSink::Memory(_) => StderrRoute::Piped,
        })
    }
}
