//! Unit tests for CGI header-block parsing.
//!
//! Covers:
//! - default status and explicit `Status:` lines
//! - header order and duplicates are preserved
//! - chunk boundaries anywhere in the block
//! - body bytes following the blank line
//! - malformed lines, overlong lines, unterminated blocks
//! - duplicated status lines: last wins, one warning each

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use cgi_bridge::bridge::headers::{HeaderCodec, HeaderLine, HeaderParser, Progress, ResponseHead, DEFAULT_STATUS};
use cgi_bridge::AppError;

const MAX_LINE: usize = 1024;

fn finalized(progress: Progress) -> (ResponseHead, Bytes) {
    match progress {
        Progress::Finalized { head, body } => (head, body),
        Progress::Pending => panic!("header block should be complete"),
    }
}

fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
    list.iter()
        .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
        .collect()
}

// ── Status handling ──────────────────────────────────────────────────────────

#[test]
fn missing_status_defaults_to_200() {
    let mut parser = HeaderParser::new(MAX_LINE);

    let (head, body) = finalized(
        parser
            .feed(b"Content-Type: text/plain\r\n\r\nhello")
            .expect("valid block"),
    );

    assert_eq!(head.status, DEFAULT_STATUS);
    assert_eq!(head.headers, pairs(&[("Content-Type", "text/plain")]));
    assert_eq!(body, Bytes::from_static(b"hello"));
}

#[test]
fn status_line_sets_status_and_is_not_a_header() {
    let mut parser = HeaderParser::new(MAX_LINE);

    let (head, _) = finalized(
        parser
            .feed(b"Status: 404 Not Found\nContent-Type: text/html\n\n")
            .expect("valid block"),
    );

    assert_eq!(head.status, "404 Not Found");
    assert_eq!(head.headers, pairs(&[("Content-Type", "text/html")]));
}

#[test]
fn duplicated_status_keeps_last_and_warns() {
    let mut parser = HeaderParser::new(MAX_LINE);

    let (head, _) = finalized(
        parser
            .feed(b"Status: 302 Found\r\nStatus: 404 Not Found\r\n\r\n")
            .expect("valid block"),
    );
    let warnings = parser.take_warnings();

    assert_eq!(head.status, "404 Not Found", "last status line wins");
    assert_eq!(warnings, vec!["duplicated Status header: Status: 404 Not Found".to_owned()]);
    assert!(parser.take_warnings().is_empty(), "warnings are drained once");
}

// ── Header order and framing ─────────────────────────────────────────────────

#[test]
fn duplicate_headers_keep_their_order() {
    let mut parser = HeaderParser::new(MAX_LINE);

    let (head, _) = finalized(
        parser
            .feed(b"Set-Cookie: a=1\r\nX-Other: y\r\nSet-Cookie: b=2\r\n\r\n")
            .expect("valid block"),
    );

    assert_eq!(
        head.headers,
        pairs(&[("Set-Cookie", "a=1"), ("X-Other", "y"), ("Set-Cookie", "b=2")])
    );
}

#[test]
fn block_split_across_many_chunks() {
    let raw = b"Status: 201 Created\r\nLocation: /items/7\r\n\r\nbody";
    let mut parser = HeaderParser::new(MAX_LINE);

    let mut outcome = None;
    for byte in raw.chunks(1) {
        match parser.feed(byte).expect("valid block") {
            Progress::Pending => {}
            done @ Progress::Finalized { .. } => {
                outcome = Some(done);
                break;
            }
        }
    }

    let (head, body) = finalized(outcome.expect("block must finalize"));
    assert_eq!(head.status, "201 Created");
    assert_eq!(head.headers, pairs(&[("Location", "/items/7")]));
    assert_eq!(body, Bytes::new(), "body bytes arrive after the terminator");
}

#[test]
fn body_bytes_after_blank_line_are_untouched() {
    let mut parser = HeaderParser::new(MAX_LINE);

    let (_, body) = finalized(
        parser
            .feed(b"Content-Type: text/plain\n\nline one\r\nStatus: 500 nope\n\n")
            .expect("valid block"),
    );

    assert_eq!(body, Bytes::from_static(b"line one\r\nStatus: 500 nope\n\n"));
}

#[test]
fn pending_until_blank_line() {
    let mut parser = HeaderParser::new(MAX_LINE);

    assert_eq!(
        parser.feed(b"Content-Type: text/plain\r\n").expect("valid line"),
        Progress::Pending
    );
    let (head, _) = finalized(parser.feed(b"\r\n").expect("terminator"));
    assert_eq!(head.headers, pairs(&[("Content-Type", "text/plain")]));
}

// ── Failures ─────────────────────────────────────────────────────────────────

#[test]
fn line_without_colon_is_malformed() {
    let mut parser = HeaderParser::new(MAX_LINE);

    let err = parser
        .feed(b"Content-Type: text/plain\r\nInvalid-Header value\r\n\r\n")
        .expect_err("line has no colon");

    assert!(
        matches!(&err, AppError::MalformedHeader(line) if line == "Invalid-Header value"),
        "unexpected error: {err}"
    );
}

#[test]
fn overlong_line_is_malformed() {
    let mut parser = HeaderParser::new(16);

    let err = parser
        .feed(b"X-Very-Long-Header: aaaaaaaaaaaaaaaaaaaaaaaaaa\r\n")
        .expect_err("line exceeds limit");

    assert!(matches!(err, AppError::MalformedHeader(_)));
}

#[test]
fn non_utf8_header_line_is_rejected() {
    let mut parser = HeaderParser::new(MAX_LINE);

    assert!(parser.feed(b"X-Bin: \xff\xfe\r\n\r\n").is_err());
}

// ── End of output ────────────────────────────────────────────────────────────

#[test]
fn finish_without_terminator_uses_what_was_seen() {
    let mut parser = HeaderParser::new(MAX_LINE);

    assert_eq!(
        parser.feed(b"Status: 204 No Content\r\nX-Trailing: yes").expect("valid"),
        Progress::Pending
    );
    let head = parser.finish().expect("leftover line is valid");

    assert_eq!(head.status, "204 No Content");
    assert_eq!(head.headers, pairs(&[("X-Trailing", "yes")]));
}

#[test]
fn finish_on_empty_output_is_default_head() {
    let mut parser = HeaderParser::new(MAX_LINE);

    let head = parser.finish().expect("no output at all");

    assert_eq!(
        head,
        ResponseHead {
            status: DEFAULT_STATUS.to_owned(),
            headers: Vec::new(),
        }
    );
}

#[test]
fn finish_with_malformed_leftover_fails() {
    let mut parser = HeaderParser::new(MAX_LINE);
    parser.feed(b"garbage").expect("no complete line yet");

    assert!(matches!(parser.finish(), Err(AppError::MalformedHeader(_))));
}

// ── Codec and serialization ──────────────────────────────────────────────────

#[test]
fn codec_strips_carriage_returns() {
    let mut codec = HeaderCodec::new(MAX_LINE);
    let mut buf = BytesMut::from("Status: 418 I'm a teapot\r\n\r\n");

    assert_eq!(
        codec.decode(&mut buf).expect("first line"),
        Some(HeaderLine::Status("418 I'm a teapot".into()))
    );
    assert_eq!(codec.decode(&mut buf).expect("second line"), Some(HeaderLine::Blank));
    assert_eq!(codec.decode(&mut buf).expect("drained"), None);
}

#[test]
fn rendered_block_parses_back_to_the_same_head() {
    let head = ResponseHead {
        status: "303 See Other".into(),
        headers: pairs(&[("Location", "/login"), ("Set-Cookie", "s=1; Path=/")]),
    };
    let mut parser = HeaderParser::new(MAX_LINE);

    let (parsed, body) = finalized(parser.feed(head.to_cgi_block().as_bytes()).expect("valid"));

    assert_eq!(parsed, head);
    assert!(body.is_empty());
}
