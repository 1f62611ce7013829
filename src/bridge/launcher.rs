//! CGI process launcher.
//!
//! Spawns the CGI program with:
//! - `env_clear()` + the mapped CGI environment, so nothing from the bridge's
//!   own environment leaks into the child.
//! - `kill_on_drop(true)`, so an abandoned invocation never leaves a child
//!   blocked on a full pipe.
//! - piped stdin and stdout, and a stderr routed according to [`StderrRoute`].

use std::collections::HashMap;
use std::fs::File;
use std::process::Stdio;

use tokio::io::AsyncRead;
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tracing::debug;

use crate::{AppError, Result};

/// Reader over the child's standard output.
pub type OutputReader = Box<dyn AsyncRead + Send + Unpin>;

/// Where the child's standard error goes.
#[derive(Debug)]
pub enum StderrRoute {
    /// Piped back to the bridge for demultiplexing.
    Piped,
    /// Inherited from the bridge process.
    Inherit,
    /// Written straight into a file.
    File(File),
    /// Shares the stdout pipe.
    Merged,
}

/// Exclusive handle on one running CGI process and its pipes.
pub struct ChildHandle {
    /// The process itself; killed when dropped.
    pub child: Child,
    /// Write end of the child's stdin.
    pub stdin: Option<ChildStdin>,
    /// Read end of the child's stdout.
    pub stdout: OutputReader,
    /// Read end of the child's stderr, present only for [`StderrRoute::Piped`].
    pub stderr: Option<ChildStderr>,
}

impl std::fmt::Debug for ChildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildHandle")
            .field("child", &self.child)
            .field("stdin", &self.stdin)
            .field("stderr", &self.stderr)
            .finish_non_exhaustive()
    }
}

/// Split a command line on whitespace into program and arguments.
///
/// # Errors
///
/// Returns `AppError::Config` when the command line is blank.
pub fn split_command(command: &str) -> Result<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_owned);
    let program = parts
        .next()
        .ok_or_else(|| AppError::Config("command must not be empty".into()))?;
    Ok((program, parts.collect()))
}

/// Spawn the CGI program.
///
/// # Errors
///
/// Returns `AppError::Launch` carrying the OS message when the program is
/// missing or not executable, or the OS refuses to create the process.
pub fn launch(
    program: &str,
    args: &[String],
    env: &HashMap<String, String>,
    route: StderrRoute,
) -> Result<ChildHandle> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .env_clear()
        .envs(env)
        .stdin(Stdio::piped())
        .kill_on_drop(true);

    let merged = match route {
        StderrRoute::Piped => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
            None
        }
        StderrRoute::Inherit => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::inherit());
            None
        }
        StderrRoute::File(file) => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::from(file));
            None
        }
        StderrRoute::Merged => {
            let (reader, out, err) = merged_pipe()?;
            cmd.stdout(out).stderr(err);
            Some(reader)
        }
    };

    let mut child = cmd
        .spawn()
        .map_err(|err| AppError::Launch(err.to_string()))?;
    // Release the parent's copies of any write ends handed to the child so
    // that stdout reaches end-of-stream when the child exits.
    drop(cmd);

    debug!(program, pid = child.id(), "cgi process started");

    let stdout: OutputReader = match merged {
        Some(reader) => reader,
        None => Box::new(
            child
                .stdout
                .take()
                .ok_or_else(|| AppError::Launch("failed to capture cgi stdout".into()))?,
        ),
    };

    Ok(ChildHandle {
        stdin: child.stdin.take(),
        stderr: child.stderr.take(),
        stdout,
        child,
    })
}

/// One OS pipe whose write end serves as both stdout and stderr.
#[cfg(unix)]
fn merged_pipe() -> Result<(OutputReader, Stdio, Stdio)> {
    use std::os::fd::OwnedFd;
    use tokio::net::unix::pipe;

    let pipe_err = |err: std::io::Error| AppError::Launch(format!("failed to create pipe: {err}"));

    let (reader, writer) = std::io::pipe().map_err(pipe_err)?;
    let writer_copy = writer.try_clone().map_err(pipe_err)?;
    let receiver = pipe::Receiver::from_owned_fd(OwnedFd::from(reader)).map_err(pipe_err)?;

    Ok((
        Box::new(receiver),
        Stdio::from(writer),
        Stdio::from(writer_copy),
    ))
}

#[cfg(not(unix))]
fn merged_pipe() -> Result<(OutputReader, Stdio, Stdio)> {
    Err(AppError::Launch(
        "merging stderr into stdout is only supported on unix".into(),
    ))
}
