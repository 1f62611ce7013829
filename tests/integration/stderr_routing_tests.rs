//! Tests of where the child's stderr ends up.
//!
//! Piped stderr goes to the request's error sink under every multiplexer and
//! never into the body; merged stderr goes into the body; a file sink
//! receives it directly.

use std::io::{Read, Seek, SeekFrom};

use cgi_bridge::bridge::mux::{MultiplexerChoice, Strategy};
use cgi_bridge::{ErrorSink, GatewayRequest};

use super::test_helpers::{environ, get_request, Script};

const NOISY: &str = "printf 'Content-Type: text/plain\\r\\n\\r\\n'\n\
                     echo 'to stderr' 1>&2\n\
                     echo 'to stdout'\n";

async fn body_of(bridge: &cgi_bridge::CgiBridge, request: GatewayRequest) -> Vec<u8> {
    bridge
        .respond(request, |_, _| {})
        .await
        .read_to_end()
        .await
        .expect("body stream")
}

#[tokio::test]
async fn readiness_poll_routes_stderr_to_sink() {
    let script = Script::new(NOISY);
    let bridge = script.bridge_with(MultiplexerChoice::Readiness);
    let sink = ErrorSink::memory();

    assert_eq!(bridge.strategy(), Strategy::ReadinessPoll);
    let body = body_of(&bridge, get_request(&sink)).await;

    assert_eq!(body, b"to stdout\n");
    assert_eq!(sink.captured(), "to stderr\n");
}

#[tokio::test]
async fn buffered_replay_routes_stderr_to_sink() {
    let script = Script::new(NOISY);
    let bridge = script.bridge_with(MultiplexerChoice::Buffered);
    let sink = ErrorSink::memory();

    assert_eq!(bridge.strategy(), Strategy::BufferedReplay);
    let body = body_of(&bridge, get_request(&sink)).await;

    assert_eq!(body, b"to stdout\n");
    assert_eq!(sink.captured(), "to stderr\n");
}

#[tokio::test]
async fn large_interleaved_output_does_not_deadlock() {
    let script = Script::new(
        "printf 'Content-Type: application/octet-stream\\r\\n\\r\\n'\n\
         /bin/dd if=/dev/zero bs=1024 count=256 1>&2 2>/dev/null\n\
         /bin/dd if=/dev/zero bs=1024 count=256 2>/dev/null\n\
         /bin/dd if=/dev/zero bs=1024 count=256 1>&2 2>/dev/null\n",
    );
    let bridge = script.bridge_with(MultiplexerChoice::Readiness);
    let sink = ErrorSink::memory();

    let body = body_of(&bridge, get_request(&sink)).await;

    assert_eq!(body.len(), 256 * 1024);
    assert_eq!(sink.captured().len(), 512 * 1024);
}

#[cfg(unix)]
#[tokio::test]
async fn merged_stderr_lands_in_body() {
    let script = Script::new(NOISY);
    let bridge = script.bridge().merge_stderr(true);
    let sink = ErrorSink::memory();

    let body = body_of(&bridge, get_request(&sink)).await;

    assert_eq!(body, b"to stderr\nto stdout\n");
    assert!(sink.captured().is_empty());
}

#[tokio::test]
async fn file_sink_receives_stderr_directly() {
    let script = Script::new(NOISY);
    let file = tempfile::tempfile().expect("temp file");
    let mut reader = file.try_clone().expect("clone handle");
    let request = GatewayRequest::new(environ(&[("REQUEST_METHOD", "GET")]))
        .with_errors(ErrorSink::file(file));

    let body = body_of(&script.bridge(), request).await;

    assert_eq!(body, b"to stdout\n");
    reader.seek(SeekFrom::Start(0)).expect("rewind");
    let mut logged = String::new();
    reader.read_to_string(&mut logged).expect("read back");
    assert_eq!(logged, "to stderr\n");
}
