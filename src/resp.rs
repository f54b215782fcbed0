use std::borrow::Cow;
use std::future::Future;
use std::io;
use std::pin::Pin;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::config::{DEFAULT_MAX_RESP_ARGS, DEFAULT_MAX_RESP_BULK_LEN, DEFAULT_MAX_RESP_LINE_LEN};

/// Maximum array nesting the decoder will follow before giving up.
const MAX_ARRAY_DEPTH: usize = 64;

#[derive(Clone, Copy, Debug)]
pub(crate) struct RespLimits {
    pub max_array_len: usize,
    pub max_bulk_len: usize,
    pub max_line_len: usize,
}

impl Default for RespLimits {
    fn default() -> Self {
        Self {
            max_array_len: DEFAULT_MAX_RESP_ARGS,
            max_bulk_len: DEFAULT_MAX_RESP_BULK_LEN,
            max_line_len: DEFAULT_MAX_RESP_LINE_LEN,
        }
    }
}

/// One RESP2 frame.
///
/// Empty and null bulk strings are conflated: `Bulk(vec![])` encodes as
/// `$-1\r\n`, and both `$-1` and `$0` decode to `Bulk(vec![])`. The wire
/// form for "missing" is null, so a stored empty string is not
/// distinguishable from an absent key on the read path.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Frame {
    Simple(String),
    Error(String),
    Int(i64),
    Bulk(Vec<u8>),
    Array(Vec<Frame>),
    NullArray,
}

impl Frame {
    pub(crate) fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Frame::Bulk(data.into())
    }

    /// Flatten a command frame (a non-empty Array of BulkStrings) into its
    /// argument vector. Anything else yields `None`.
    pub(crate) fn into_args(self) -> Option<Vec<Vec<u8>>> {
        let Frame::Array(items) = self else {
            return None;
        };
        if items.is_empty() {
            return None;
        }
        let mut args = Vec::with_capacity(items.len());
        for item in items {
            match item {
                Frame::Bulk(data) => args.push(data),
                _ => return None,
            }
        }
        Some(args)
    }
}

fn invalid_data(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

fn unexpected_eof() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "unexpected EOF")
}

fn parse_i64(bytes: &[u8], err_msg: &'static str) -> io::Result<i64> {
    let s = std::str::from_utf8(bytes).map_err(|_| invalid_data(err_msg))?;
    s.parse::<i64>().map_err(|_| invalid_data(err_msg))
}

/// Read one CRLF-terminated line into `buf`, stripping the terminator.
/// Returns `None` on clean EOF before any byte was read.
async fn read_line<'a, R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &'a mut Vec<u8>,
    max_line_len: usize,
) -> io::Result<Option<&'a [u8]>> {
    buf.clear();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(unexpected_eof());
        }
        if let Some(pos) = chunk.iter().position(|&b| b == b'\n') {
            let take = pos + 1;
            if buf.len().saturating_add(take) > max_line_len.saturating_add(2) {
                return Err(invalid_data("line too long"));
            }
            buf.extend_from_slice(&chunk[..take]);
            reader.consume(take);
            break;
        }
        if buf.len().saturating_add(chunk.len()) > max_line_len.saturating_add(2) {
            return Err(invalid_data("line too long"));
        }
        let take = chunk.len();
        buf.extend_from_slice(chunk);
        reader.consume(take);
    }
    if buf.ends_with(b"\n") {
        buf.pop();
        if buf.ends_with(b"\r") {
            buf.pop();
        }
    }
    Ok(Some(buf.as_slice()))
}

/// Decode one frame from `reader`.
///
/// `Ok(None)` means the stream ended cleanly at a frame boundary. EOF in
/// the middle of a frame surfaces as `ErrorKind::UnexpectedEof`; anything
/// structurally wrong (unknown prefix, non-numeric length, missing CRLF)
/// as `ErrorKind::InvalidData`.
pub(crate) async fn read_value<R: AsyncBufRead + Unpin + Send>(
    reader: &mut R,
    limits: RespLimits,
) -> io::Result<Option<Frame>> {
    let mut line = Vec::new();
    let Some(header) = read_line(reader, &mut line, limits.max_line_len).await? else {
        return Ok(None);
    };
    let header = header.to_vec();
    parse_frame(reader, header, limits, 0).await.map(Some)
}

/// Parse the frame whose header line has already been consumed. Arrays
/// recurse; boxing keeps the recursive future sized.
fn parse_frame<'a, R: AsyncBufRead + Unpin + Send>(
    reader: &'a mut R,
    header: Vec<u8>,
    limits: RespLimits,
    depth: usize,
) -> Pin<Box<dyn Future<Output = io::Result<Frame>> + Send + 'a>> {
    Box::pin(async move {
        if depth > MAX_ARRAY_DEPTH {
            return Err(invalid_data("array nesting too deep"));
        }
        let Some((&prefix, rest)) = header.split_first() else {
            return Err(invalid_data("empty frame"));
        };
        match prefix {
            b'+' => {
                let s = std::str::from_utf8(rest).map_err(|_| invalid_data("bad simple string"))?;
                Ok(Frame::Simple(s.to_owned()))
            }
            b'-' => {
                let s = std::str::from_utf8(rest).map_err(|_| invalid_data("bad error string"))?;
                Ok(Frame::Error(s.to_owned()))
            }
            b':' => Ok(Frame::Int(parse_i64(rest, "bad integer")?)),
            b'$' => {
                let len = parse_i64(rest, "bad bulk length")?;
                if len < 0 {
                    return Ok(Frame::Bulk(Vec::new()));
                }
                let len = usize::try_from(len).map_err(|_| invalid_data("bad bulk length"))?;
                if len > limits.max_bulk_len {
                    return Err(invalid_data("bulk string too large"));
                }
                let mut buf = vec![0u8; len];
                reader.read_exact(&mut buf).await?;
                let mut crlf = [0u8; 2];
                reader.read_exact(&mut crlf).await?;
                if &crlf != b"\r\n" {
                    return Err(invalid_data("bulk string missing trailing CRLF"));
                }
                Ok(Frame::bulk(buf))
            }
            b'*' => {
                let count = parse_i64(rest, "bad array length")?;
                if count < 0 {
                    return Ok(Frame::NullArray);
                }
                let count = usize::try_from(count).map_err(|_| invalid_data("bad array length"))?;
                if count > limits.max_array_len {
                    return Err(invalid_data("array too long"));
                }
                let mut items = Vec::with_capacity(count);
                let mut line = Vec::new();
                for _ in 0..count {
                    let Some(hdr) = read_line(reader, &mut line, limits.max_line_len).await? else {
                        return Err(unexpected_eof());
                    };
                    let hdr = hdr.to_vec();
                    items.push(parse_frame(reader, hdr, limits, depth + 1).await?);
                }
                Ok(Frame::Array(items))
            }
            _ => Err(invalid_data("unknown frame prefix")),
        }
    })
}

// ── Encoder ───────────────────────────────────────────────────────────────────

/// Append one frame to `out`. Empty bulk payloads are written as null.
/// The reply path uses the specialised builders below; this is the
/// general form for arbitrary frames.
#[allow(dead_code)]
pub(crate) fn encode_value(out: &mut Vec<u8>, v: &Frame) {
    match v {
        Frame::Simple(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Frame::Error(s) => {
            out.push(b'-');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Frame::Int(n) => append_int(out, *n),
        Frame::Bulk(data) => append_bulk(out, data),
        Frame::Array(items) => {
            append_array_header(out, items.len());
            for item in items {
                encode_value(out, item);
            }
        }
        Frame::NullArray => out.extend_from_slice(b"*-1\r\n"),
    }
}

/// Encode a command as an Array of BulkStrings, the form the append-only
/// log stores, identical to live client traffic.
pub(crate) fn encode_command(args: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(args.iter().map(|a| a.len() + 16).sum::<usize>() + 16);
    append_array_header(&mut out, args.len());
    for arg in args {
        append_bulk(&mut out, arg);
    }
    out
}

// ── Reply builders ────────────────────────────────────────────────────────────

pub(crate) fn resp_ok() -> Cow<'static, [u8]> {
    Cow::Borrowed(b"+OK\r\n")
}
pub(crate) fn resp_pong() -> Cow<'static, [u8]> {
    Cow::Borrowed(b"+PONG\r\n")
}
pub(crate) fn resp_queued() -> Cow<'static, [u8]> {
    Cow::Borrowed(b"+QUEUED\r\n")
}
pub(crate) fn resp_null() -> Cow<'static, [u8]> {
    Cow::Borrowed(b"$-1\r\n")
}
pub(crate) fn resp_null_array() -> Cow<'static, [u8]> {
    Cow::Borrowed(b"*-1\r\n")
}
pub(crate) fn resp_int(n: i64) -> Cow<'static, [u8]> {
    let mut out = Vec::with_capacity(16);
    append_int(&mut out, n);
    Cow::Owned(out)
}
pub(crate) fn resp_err(msg: &str) -> Cow<'static, [u8]> {
    Cow::Owned(format!("-ERR {msg}\r\n").into_bytes())
}
pub(crate) fn resp_syntax_err() -> Cow<'static, [u8]> {
    Cow::Borrowed(b"-ERR syntax error\r\n")
}
pub(crate) fn resp_not_integer() -> Cow<'static, [u8]> {
    Cow::Borrowed(b"-ERR value is not an integer or out of range\r\n")
}
pub(crate) fn resp_wrongtype() -> Cow<'static, [u8]> {
    Cow::Borrowed(b"-WRONGTYPE Operation against a key holding the wrong kind of value\r\n")
}

pub(crate) fn wrong_args(cmd: &str) -> Cow<'static, [u8]> {
    resp_err(&format!("wrong number of arguments for '{cmd}' command"))
}

pub(crate) fn append_array_header(out: &mut Vec<u8>, len: usize) {
    out.push(b'*');
    out.extend_from_slice(len.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}

pub(crate) fn append_int(out: &mut Vec<u8>, n: i64) {
    out.push(b':');
    out.extend_from_slice(n.to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
}

pub(crate) fn append_null(out: &mut Vec<u8>) {
    out.extend_from_slice(b"$-1\r\n");
}

/// Bulk append with the empty-as-null conflation applied.
pub(crate) fn append_bulk(out: &mut Vec<u8>, data: &[u8]) {
    if data.is_empty() {
        append_null(out);
        return;
    }
    out.push(b'$');
    out.extend_from_slice(data.len().to_string().as_bytes());
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
}

pub(crate) fn resp_bulk(data: &[u8]) -> Cow<'static, [u8]> {
    let mut out = Vec::with_capacity(data.len() + 16);
    append_bulk(&mut out, data);
    Cow::Owned(out)
}

pub(crate) fn resp_array(items: &[Vec<u8>]) -> Cow<'static, [u8]> {
    let mut out = Vec::new();
    append_array_header(&mut out, items.len());
    for item in items {
        append_bulk(&mut out, item);
    }
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn decode(data: &[u8]) -> io::Result<Option<Frame>> {
        let mut r = BufReader::new(data);
        read_value(&mut r, RespLimits::default()).await
    }

    fn args(parts: &[&str]) -> Vec<Vec<u8>> {
        parts.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    // ── Decoding ──────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn decodes_command_array() {
        let v = decode(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            v,
            Frame::Array(vec![
                Frame::bulk("SET"),
                Frame::bulk("foo"),
                Frame::bulk("bar"),
            ])
        );
    }

    #[tokio::test]
    async fn decodes_simple_string() {
        assert_eq!(
            decode(b"+OK\r\n").await.unwrap().unwrap(),
            Frame::Simple("OK".to_owned())
        );
    }

    #[tokio::test]
    async fn decodes_error() {
        assert_eq!(
            decode(b"-ERR boom\r\n").await.unwrap().unwrap(),
            Frame::Error("ERR boom".to_owned())
        );
    }

    #[tokio::test]
    async fn decodes_integers() {
        assert_eq!(decode(b":1000\r\n").await.unwrap().unwrap(), Frame::Int(1000));
        assert_eq!(decode(b":-42\r\n").await.unwrap().unwrap(), Frame::Int(-42));
    }

    #[tokio::test]
    async fn decodes_binary_bulk() {
        assert_eq!(
            decode(b"$5\r\nhe\x00lo\r\n").await.unwrap().unwrap(),
            Frame::Bulk(b"he\x00lo".to_vec())
        );
    }

    #[tokio::test]
    async fn null_and_empty_bulk_conflate() {
        assert_eq!(decode(b"$-1\r\n").await.unwrap().unwrap(), Frame::Bulk(vec![]));
        assert_eq!(decode(b"$0\r\n\r\n").await.unwrap().unwrap(), Frame::Bulk(vec![]));
    }

    #[tokio::test]
    async fn decodes_null_array() {
        assert_eq!(decode(b"*-1\r\n").await.unwrap().unwrap(), Frame::NullArray);
    }

    #[tokio::test]
    async fn decodes_nested_arrays() {
        let v = decode(b"*2\r\n:1\r\n*2\r\n:2\r\n:3\r\n").await.unwrap().unwrap();
        assert_eq!(
            v,
            Frame::Array(vec![
                Frame::Int(1),
                Frame::Array(vec![Frame::Int(2), Frame::Int(3)]),
            ])
        );
    }

    #[tokio::test]
    async fn deep_nesting_within_limit() {
        // Ten levels of single-element arrays around an integer.
        let mut data = Vec::new();
        for _ in 0..10 {
            data.extend_from_slice(b"*1\r\n");
        }
        data.extend_from_slice(b":7\r\n");
        let mut v = decode(&data).await.unwrap().unwrap();
        for _ in 0..10 {
            match v {
                Frame::Array(mut items) => {
                    assert_eq!(items.len(), 1);
                    v = items.pop().unwrap();
                }
                other => panic!("expected array, got {other:?}"),
            }
        }
        assert_eq!(v, Frame::Int(7));
    }

    #[tokio::test]
    async fn clean_eof_returns_none() {
        assert!(decode(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_bulk_is_unexpected_eof() {
        let err = decode(b"$5\r\nhel").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn eof_mid_array_is_unexpected_eof() {
        let err = decode(b"*2\r\n$3\r\nGET\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn unknown_prefix_is_invalid_data() {
        let err = decode(b"@hello\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn non_numeric_length_is_invalid_data() {
        let err = decode(b"$abc\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn bulk_without_trailing_crlf_is_invalid_data() {
        let err = decode(b"$3\r\nfooXX").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rejects_oversized_bulk() {
        let mut r = BufReader::new(&b"$10\r\n0123456789\r\n"[..]);
        let limits = RespLimits {
            max_bulk_len: 4,
            ..RespLimits::default()
        };
        let err = read_value(&mut r, limits).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rejects_oversized_array() {
        let mut r = BufReader::new(&b"*3\r\n:1\r\n:2\r\n:3\r\n"[..]);
        let limits = RespLimits {
            max_array_len: 2,
            ..RespLimits::default()
        };
        let err = read_value(&mut r, limits).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn rejects_excessive_nesting() {
        let mut data = Vec::new();
        for _ in 0..(MAX_ARRAY_DEPTH + 2) {
            data.extend_from_slice(b"*1\r\n");
        }
        data.extend_from_slice(b":1\r\n");
        let err = decode(&data).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn decodes_pipelined_frames_in_sequence() {
        let mut r = BufReader::new(&b"*1\r\n$4\r\nPING\r\n*1\r\n$4\r\nPING\r\n"[..]);
        let limits = RespLimits::default();
        assert!(read_value(&mut r, limits).await.unwrap().is_some());
        assert!(read_value(&mut r, limits).await.unwrap().is_some());
        assert!(read_value(&mut r, limits).await.unwrap().is_none());
    }

    // ── Encoding ──────────────────────────────────────────────────────────────

    #[test]
    fn encodes_each_frame_kind() {
        let mut out = Vec::new();
        encode_value(&mut out, &Frame::Simple("OK".to_owned()));
        assert_eq!(out, b"+OK\r\n");

        out.clear();
        encode_value(&mut out, &Frame::Error("ERR x".to_owned()));
        assert_eq!(out, b"-ERR x\r\n");

        out.clear();
        encode_value(&mut out, &Frame::Int(-5));
        assert_eq!(out, b":-5\r\n");

        out.clear();
        encode_value(&mut out, &Frame::bulk("hi"));
        assert_eq!(out, b"$2\r\nhi\r\n");

        out.clear();
        encode_value(&mut out, &Frame::NullArray);
        assert_eq!(out, b"*-1\r\n");
    }

    #[test]
    fn empty_bulk_encodes_as_null() {
        let mut out = Vec::new();
        encode_value(&mut out, &Frame::Bulk(vec![]));
        assert_eq!(out, b"$-1\r\n");
    }

    #[test]
    fn encode_command_matches_wire_form() {
        assert_eq!(
            encode_command(&args(&["SET", "k", "v"])),
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$1\r\nv\r\n"
        );
    }

    #[tokio::test]
    async fn command_round_trips_through_codec() {
        let frame = encode_command(&args(&["RPUSH", "mylist", "a", "b"]));
        let v = decode(&frame).await.unwrap().unwrap();
        assert_eq!(v.into_args().unwrap(), args(&["RPUSH", "mylist", "a", "b"]));
    }

    #[tokio::test]
    async fn values_round_trip_through_codec() {
        // Values without null arrays or empty bulk payloads survive
        // encode → decode unchanged.
        let cases = vec![
            Frame::Simple("PONG".to_owned()),
            Frame::Error("WRONGTYPE nope".to_owned()),
            Frame::Int(i64::MIN),
            Frame::bulk("payload"),
            Frame::Array(vec![Frame::Int(1), Frame::bulk("x")]),
        ];
        for v in cases {
            let mut wire = Vec::new();
            encode_value(&mut wire, &v);
            assert_eq!(decode(&wire).await.unwrap().unwrap(), v);
        }
    }

    // ── into_args ─────────────────────────────────────────────────────────────

    #[test]
    fn into_args_accepts_bulk_arrays_only() {
        let frame = Frame::Array(vec![Frame::bulk("GET"), Frame::bulk("k")]);
        assert_eq!(frame.into_args().unwrap(), args(&["GET", "k"]));

        assert!(Frame::Array(vec![]).into_args().is_none());
        assert!(Frame::Array(vec![Frame::Int(1)]).into_args().is_none());
        assert!(Frame::Int(1).into_args().is_none());
        assert!(Frame::NullArray.into_args().is_none());
    }

    // ── Builders ──────────────────────────────────────────────────────────────

    #[test]
    fn builders_produce_expected_bytes() {
        assert_eq!(&*resp_ok(), b"+OK\r\n");
        assert_eq!(&*resp_pong(), b"+PONG\r\n");
        assert_eq!(&*resp_queued(), b"+QUEUED\r\n");
        assert_eq!(&*resp_null(), b"$-1\r\n");
        assert_eq!(&*resp_null_array(), b"*-1\r\n");
        assert_eq!(&*resp_int(12), b":12\r\n");
        assert_eq!(&*resp_bulk(b"ab"), b"$2\r\nab\r\n");
        assert_eq!(&*resp_bulk(b""), b"$-1\r\n");
        assert_eq!(&*resp_err("boom"), b"-ERR boom\r\n");
        assert_eq!(
            &*wrong_args("get"),
            b"-ERR wrong number of arguments for 'get' command\r\n"
        );
        assert!(resp_wrongtype().starts_with(b"-WRONGTYPE "));
        assert_eq!(&*resp_syntax_err(), b"-ERR syntax error\r\n");
        assert!(resp_not_integer().starts_with(b"-ERR value is not an integer"));
    }

    #[test]
    fn resp_array_encodes_items_as_bulks() {
        assert_eq!(
            &*resp_array(&args(&["a", "bc"])),
            b"*2\r\n$1\r\na\r\n$2\r\nbc\r\n"
        );
    }
}
