//! HTTP host for a single CGI bridge.
//!
//! Mounts a [`CgiBridge`] as the fallback handler of an axum router. Each
//! request is turned into a [`GatewayRequest`] carrying the standard CGI
//! meta-variables and `HTTP_*` header variables, and the bridge's response
//! head and body are streamed back unchanged.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::TryStreamExt;
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use crate::bridge::headers::ResponseHead;
use crate::bridge::response::ResponseBody;
use crate::bridge::CgiBridge;
use crate::config::ServerConfig;
use crate::gateway::GatewayRequest;
use crate::{AppError, Result};

/// Value exported as `SERVER_SOFTWARE`.
pub const SERVER_SOFTWARE: &str = concat!("cgi-bridge/", env!("CARGO_PKG_VERSION"));

struct HostState {
    bridge: CgiBridge,
    server: ServerConfig,
}

/// Router that sends every request through `bridge`.
pub fn router(bridge: CgiBridge, server: ServerConfig) -> Router {
    Router::new()
        .fallback(handle)
        .with_state(Arc::new(HostState { bridge, server }))
}

/// Serve `bridge` on `server.bind` until Ctrl-C or SIGTERM.
///
/// # Errors
///
/// Returns `AppError::Config` if the address cannot be bound, or
/// `AppError::Io` if the server fails while running.
pub async fn serve(bridge: CgiBridge, server: ServerConfig) -> Result<()> {
    let bind = server.bind;
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|err| AppError::Config(format!("failed to bind {bind}: {err}")))?;

    info!(%bind, command = bridge.command(), "serving cgi program");

    axum::serve(
        listener,
        router(bridge, server).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|err| AppError::Io(format!("http server error: {err}")))?;

    info!("http server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

async fn handle(
    State(state): State<Arc<HostState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (parts, body) = request.into_parts();
    if split_script_path(parts.uri.path(), &state.server.script_name).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let environ = cgi_environ(&parts, remote, &state.server);

    let reader = StreamReader::new(Box::pin(body.into_data_stream().map_err(io::Error::other)));
    let gateway = GatewayRequest::new(environ).with_body(reader);

    let (head, body) = state.bridge.invoke(gateway).await.into_parts().await;
    build_response(&head, body)
}

/// Split a request path into `SCRIPT_NAME` and `PATH_INFO`.
///
/// `script_name` only matches whole path segments: `/app` covers `/app` and
/// `/app/x` but not `/application`. Returns `None` for paths outside it.
#[must_use]
pub fn split_script_path<'a>(path: &'a str, script_name: &'a str) -> Option<(&'a str, &'a str)> {
    let script_name = script_name.trim_end_matches('/');
    let rest = path.strip_prefix(script_name)?;
    (rest.is_empty() || rest.starts_with('/')).then_some((script_name, rest))
}

/// CGI meta-variables for one HTTP request.
///
/// `Content-Type` and `Content-Length` become `CONTENT_TYPE` and
/// `CONTENT_LENGTH`; every other header becomes `HTTP_<NAME>`, with repeated
/// headers joined by `", "` (`"; "` for `Cookie`). `Proxy` is dropped so it
/// can never reach the child as `HTTP_PROXY`. Headers whose value is not
/// visible ASCII are skipped.
///
/// A path outside the configured script name is passed whole as
/// `PATH_INFO` with an empty `SCRIPT_NAME`.
#[must_use]
pub fn cgi_environ(parts: &Parts, remote: SocketAddr, server: &ServerConfig) -> HashMap<String, String> {
    let path = parts.uri.path();
    let (script_name, path_info) = split_script_path(path, &server.script_name).unwrap_or(("", path));

    let mut environ: HashMap<String, String> = [
        ("GATEWAY_INTERFACE", "CGI/1.1".to_owned()),
        ("SERVER_SOFTWARE", SERVER_SOFTWARE.to_owned()),
        ("SERVER_NAME", server.server_name.clone()),
        ("SERVER_PORT", server.bind.port().to_string()),
        ("SERVER_PROTOCOL", format!("{:?}", parts.version)),
        ("REQUEST_METHOD", parts.method.as_str().to_owned()),
        ("SCRIPT_NAME", script_name.to_owned()),
        ("PATH_INFO", path_info.to_owned()),
        ("QUERY_STRING", parts.uri.query().unwrap_or_default().to_owned()),
        ("REMOTE_ADDR", remote.ip().to_string()),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_owned(), value))
    .collect();

    for (name, value) in &parts.headers {
        if name.as_str() == "proxy" {
            warn!("dropping proxy request header");
            continue;
        }
        let Ok(value) = value.to_str() else {
            warn!(header = %name, "skipping non-ascii request header");
            continue;
        };
        let key = match name.as_str() {
            "content-type" => "CONTENT_TYPE".to_owned(),
            "content-length" => "CONTENT_LENGTH".to_owned(),
            other => format!("HTTP_{}", other.to_ascii_uppercase().replace('-', "_")),
        };
        let separator = if name.as_str() == "cookie" { "; " } else { ", " };
        environ
            .entry(key)
            .and_modify(|joined| {
                joined.push_str(separator);
                joined.push_str(value);
            })
            .or_insert_with(|| value.to_owned());
    }

    environ
}

/// HTTP status code for a CGI status line such as `404 Not Found`.
///
/// Anything without a valid leading three-digit code maps to 500.
#[must_use]
pub fn status_code(status: &str) -> StatusCode {
    status
        .get(..3)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn build_response(head: &ResponseHead, body: ResponseBody) -> Response {
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status_code(&head.status);

    for (name, value) in &head.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => warn!(header = %name, "dropping cgi header not representable in http"),
        }
    }

    response
}
