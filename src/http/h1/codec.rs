//! HTTP/1.1 server codec.
//!
//! # Responsibilities
//! - Decode request heads with `httparse`, enforcing line and header limits
//! - Decode `Content-Length` and chunked bodies into bounded data frames
//! - Encode response heads and bodies with the framing chosen by the writer
//!
//! # Design Decisions
//! - Decoding is a state machine over the read buffer: `Head` until a full
//!   head parses, then body states until `End`
//! - Pipelined requests stay in the buffer; each `decode` call yields at
//!   most one frame

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use tokio_util::codec::{Decoder, Encoder};

use crate::http::error::CodecError;
use crate::http::request::RequestHead;
use crate::http::response::ResponseHead;
use crate::pipeline::DecoderSettings;

const MAX_HEADERS: usize = 128;
const MAX_CHUNK_SIZE_LINE: usize = 1024;

/// Decoded unit of an HTTP/1.1 request.
#[derive(Debug)]
pub(crate) enum RequestFrame {
    Head { head: RequestHead, has_body: bool },
    Data(Bytes),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    Length(u64),
    Chunked(ChunkState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataCrlf,
    Trailers,
}

/// Request decoder. `body` is `Some` while a message body is in flight.
#[derive(Debug)]
pub(crate) struct Http1Codec {
    settings: DecoderSettings,
    body: Option<BodyState>,
}

impl Http1Codec {
    pub(crate) fn new(settings: DecoderSettings) -> Self {
        Self { settings, body: None }
    }

    fn decode_head(&mut self, src: &mut BytesMut) -> Result<Option<RequestFrame>, CodecError> {
        // Empty lines before a request line are ignored (RFC 9112 section 2.2).
        while src.first() == Some(&b'\r') || src.first() == Some(&b'\n') {
            src.advance(1);
        }
        if src.is_empty() {
            return Ok(None);
        }

        let line_limit = self.settings.max_initial_line_length;
        let header_limit = self.settings.max_header_size;
        let line_len = match find_crlf(src) {
            Some(n) => n,
            None if src.len() > line_limit => {
                return Err(CodecError::InitialLineTooLong { limit: line_limit })
            }
            None => return Ok(None),
        };
        if line_len > line_limit {
            return Err(CodecError::InitialLineTooLong { limit: line_limit });
        }

        let (mut head, consumed) = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut request = httparse::Request::new(&mut headers);
            let consumed = match request.parse(src) {
                Ok(httparse::Status::Complete(n)) => n,
                Ok(httparse::Status::Partial) => {
                    if src.len() - (line_len + 2) > header_limit {
                        return Err(CodecError::HeaderTooLarge { limit: header_limit });
                    }
                    return Ok(None);
                }
                Err(httparse::Error::TooManyHeaders) => {
                    return Err(CodecError::HeaderTooLarge { limit: header_limit })
                }
                Err(e) => return Err(CodecError::Malformed(e.to_string())),
            };
            if consumed.saturating_sub(line_len + 4) > header_limit {
                return Err(CodecError::HeaderTooLarge { limit: header_limit });
            }

            let method = request
                .method
                .ok_or_else(|| CodecError::Malformed("missing method".into()))
                .and_then(|m| {
                    Method::from_bytes(m.as_bytes()).map_err(|e| CodecError::Malformed(e.to_string()))
                })?;
            let uri = request
                .path
                .ok_or_else(|| CodecError::Malformed("missing request target".into()))
                .and_then(|p| p.parse::<Uri>().map_err(|e| CodecError::Malformed(e.to_string())))?;
            let version = match request.version {
                Some(0) => Version::HTTP_10,
                _ => Version::HTTP_11,
            };

            let mut map = HeaderMap::with_capacity(request.headers.len());
            for header in request.headers.iter() {
                let name = HeaderName::from_bytes(header.name.as_bytes());
                let value = HeaderValue::from_bytes(header.value);
                match (name, value) {
                    (Ok(name), Ok(value)) => {
                        map.append(name, value);
                    }
                    _ if self.settings.validate_headers => {
                        return Err(CodecError::InvalidHeader(header.name.to_string()));
                    }
                    _ => tracing::trace!(header = %header.name, "Dropping invalid header"),
                }
            }
            (RequestHead::new(method, uri, version, map), consumed)
        };
        src.advance(consumed);

        let body = body_state(&mut head)?;
        self.body = body;
        Ok(Some(RequestFrame::Head {
            head,
            has_body: body.is_some(),
        }))
    }

    fn decode_body(&mut self, src: &mut BytesMut) -> Result<Option<RequestFrame>, CodecError> {
        let max_chunk = self.settings.max_chunk_size;
        loop {
            let Some(state) = self.body else {
                return Ok(None);
            };
            match state {
                BodyState::Length(0) => {
                    self.body = None;
                    return Ok(Some(RequestFrame::End));
                }
                BodyState::Length(remaining) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let n = take_len(remaining, src.len(), max_chunk);
                    self.body = Some(BodyState::Length(remaining - n as u64));
                    return Ok(Some(RequestFrame::Data(src.split_to(n).freeze())));
                }
                BodyState::Chunked(ChunkState::Size) => {
                    let Some(end) = find_crlf(src) else {
                        if src.len() > MAX_CHUNK_SIZE_LINE {
                            return Err(CodecError::InvalidChunk);
                        }
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&src[..end])?;
                    src.advance(end + 2);
                    let next = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                    self.body = Some(BodyState::Chunked(next));
                }
                BodyState::Chunked(ChunkState::Data(remaining)) => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let n = take_len(remaining, src.len(), max_chunk);
                    let left = remaining - n as u64;
                    let next = if left == 0 {
                        ChunkState::DataCrlf
                    } else {
                        ChunkState::Data(left)
                    };
                    self.body = Some(BodyState::Chunked(next));
                    return Ok(Some(RequestFrame::Data(src.split_to(n).freeze())));
                }
                BodyState::Chunked(ChunkState::DataCrlf) => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    if &src[..2] != b"\r\n" {
                        return Err(CodecError::InvalidChunk);
                    }
                    src.advance(2);
                    self.body = Some(BodyState::Chunked(ChunkState::Size));
                }
                BodyState::Chunked(ChunkState::Trailers) => {
                    // Trailer fields are read and discarded.
                    let Some(end) = find_crlf(src) else {
                        if src.len() > self.settings.max_header_size {
                            return Err(CodecError::HeaderTooLarge {
                                limit: self.settings.max_header_size,
                            });
                        }
                        return Ok(None);
                    };
                    src.advance(end + 2);
                    if end == 0 {
                        self.body = None;
                        return Ok(Some(RequestFrame::End));
                    }
                }
            }
        }
    }
}

impl Decoder for Http1Codec {
    type Item = RequestFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RequestFrame>, CodecError> {
        if self.body.is_some() {
            self.decode_body(src)
        } else {
            self.decode_head(src)
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<RequestFrame>, CodecError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if self.body.is_none() && src.iter().all(u8::is_ascii_whitespace) => Ok(None),
            None => Err(CodecError::IncompleteMessage),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

fn take_len(remaining: u64, available: usize, max_chunk: usize) -> usize {
    (remaining.min(available as u64) as usize).min(max_chunk)
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, CodecError> {
    let size = line.split(|b| *b == b';').next().unwrap_or_default();
    let size = std::str::from_utf8(size).map_err(|_| CodecError::InvalidChunk)?;
    u64::from_str_radix(size.trim(), 16).map_err(|_| CodecError::InvalidChunk)
}

/// Body framing of a request, normalizing `Content-Length` away when chunked.
fn body_state(head: &mut RequestHead) -> Result<Option<BodyState>, CodecError> {
    if head.headers.contains_key(TRANSFER_ENCODING) {
        let last = head
            .headers
            .get_all(TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .last();
        if !last.is_some_and(|coding| coding.eq_ignore_ascii_case("chunked")) {
            return Err(CodecError::Malformed("unsupported transfer-encoding".into()));
        }
        head.headers.remove(CONTENT_LENGTH);
        return Ok(Some(BodyState::Chunked(ChunkState::Size)));
    }

    let mut length: Option<u64> = None;
    for value in head.headers.get_all(CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| CodecError::Malformed("invalid content-length".into()))?;
        if length.is_some_and(|l| l != parsed) {
            return Err(CodecError::Malformed("conflicting content-length".into()));
        }
        length = Some(parsed);
    }
    Ok(length.filter(|&n| n > 0).map(BodyState::Length))
}

/// How a response body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
    /// `Content-Length` is set on the head.
    Length,
    Chunked,
    /// Body ends when the connection closes (HTTP/1.0, unknown length).
    CloseDelimited,
    /// Head only.
    None,
}

/// Encoded unit of an HTTP/1.1 response.
#[derive(Debug)]
pub(crate) enum ResponseFrame {
    Head {
        head: ResponseHead,
        version: Version,
        framing: Framing,
    },
    Data(Bytes),
    End,
}

#[derive(Debug, Default)]
pub(crate) struct Http1Encoder {
    chunked: bool,
}

impl Encoder<ResponseFrame> for Http1Encoder {
    type Error = io::Error;

    fn encode(&mut self, frame: ResponseFrame, dst: &mut BytesMut) -> io::Result<()> {
        match frame {
            ResponseFrame::Head { head, version, framing } => {
                self.chunked = framing == Framing::Chunked;
                dst.reserve(128 + head.headers.len() * 32);
                dst.extend_from_slice(if version == Version::HTTP_10 {
                    b"HTTP/1.0 "
                } else {
                    b"HTTP/1.1 "
                });
                dst.extend_from_slice(head.status.as_str().as_bytes());
                dst.extend_from_slice(b" ");
                dst.extend_from_slice(head.status.canonical_reason().unwrap_or("").as_bytes());
                dst.extend_from_slice(b"\r\n");
                for (name, value) in head.headers.iter() {
                    dst.extend_from_slice(name.as_str().as_bytes());
                    dst.extend_from_slice(b": ");
                    dst.extend_from_slice(value.as_bytes());
                    dst.extend_from_slice(b"\r\n");
                }
                if self.chunked {
                    dst.extend_from_slice(b"transfer-encoding: chunked\r\n");
                }
                dst.extend_from_slice(b"\r\n");
            }
            ResponseFrame::Data(data) => {
                if data.is_empty() {
                    return Ok(());
                }
                if self.chunked {
                    dst.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
                    dst.extend_from_slice(&data);
                    dst.extend_from_slice(b"\r\n");
                } else {
                    dst.extend_from_slice(&data);
                }
            }
            ResponseFrame::End => {
                if self.chunked {
                    dst.extend_from_slice(b"0\r\n\r\n");
                    self.chunked = false;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    fn codec() -> Http1Codec {
        Http1Codec::new(DecoderSettings::default())
    }

    fn decode_all(codec: &mut Http1Codec, input: &[u8]) -> Vec<RequestFrame> {
        let mut buf = BytesMut::from(input);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn body_of(frames: &[RequestFrame]) -> Vec<u8> {
        frames
            .iter()
            .filter_map(|f| match f {
                RequestFrame::Data(d) => Some(d.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn decodes_simple_get() {
        let mut codec = codec();
        let frames = decode_all(&mut codec, b"GET /index?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(frames.len(), 1);
        let RequestFrame::Head { head, has_body } = &frames[0] else {
            panic!("expected head");
        };
        assert!(!has_body);
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.uri.path(), "/index");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers["host"], "example.com");
    }

    #[test]
    fn partial_head_waits_for_more_input() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: a"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"\r\n\r\n");
        assert!(matches!(codec.decode(&mut buf).unwrap(), Some(RequestFrame::Head { .. })));
    }

    #[test]
    fn content_length_body_is_split_at_max_chunk_size() {
        let mut codec = Http1Codec::new(DecoderSettings {
            max_chunk_size: 4,
            ..DecoderSettings::default()
        });
        let frames = decode_all(&mut codec, b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789");
        assert!(matches!(frames[0], RequestFrame::Head { has_body: true, .. }));
        let sizes: Vec<usize> = frames
            .iter()
            .filter_map(|f| match f {
                RequestFrame::Data(d) => Some(d.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(matches!(frames.last(), Some(RequestFrame::End)));
        assert_eq!(body_of(&frames), b"0123456789");
    }

    #[test]
    fn chunked_body_with_extensions_and_trailers() {
        let mut codec = codec();
        let frames = decode_all(
            &mut codec,
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              5;name=value\r\nhello\r\n6\r\n world\r\n0\r\nX-Checksum: 1\r\n\r\n",
        );
        assert_eq!(body_of(&frames), b"hello world");
        assert!(matches!(frames.last(), Some(RequestFrame::End)));
    }

    #[test]
    fn pipelined_requests_decode_in_order() {
        let mut codec = codec();
        let frames = decode_all(
            &mut codec,
            b"GET /a HTTP/1.1\r\n\r\nPOST /b HTTP/1.1\r\nContent-Length: 2\r\n\r\nokGET /c HTTP/1.1\r\n\r\n",
        );
        let paths: Vec<String> = frames
            .iter()
            .filter_map(|f| match f {
                RequestFrame::Head { head, .. } => Some(head.uri.path().to_string()),
                _ => None,
            })
            .collect();
        assert_eq!(paths, vec!["/a", "/b", "/c"]);
    }

    #[test]
    fn oversized_request_line_is_rejected() {
        let mut codec = Http1Codec::new(DecoderSettings {
            max_initial_line_length: 16,
            ..DecoderSettings::default()
        });
        let mut buf = BytesMut::from(&b"GET /a-very-long-path-indeed HTTP/1.1\r\n\r\n"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::InitialLineTooLong { limit: 16 }));
        assert_eq!(err.status(), StatusCode::URI_TOO_LONG);
    }

    #[test]
    fn oversized_request_line_is_rejected_before_crlf() {
        let mut codec = Http1Codec::new(DecoderSettings {
            max_initial_line_length: 16,
            ..DecoderSettings::default()
        });
        let mut buf = BytesMut::from(&b"GET /still-reading-the-line"[..]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_headers_are_rejected() {
        let mut codec = Http1Codec::new(DecoderSettings {
            max_header_size: 32,
            ..DecoderSettings::default()
        });
        let mut buf = BytesMut::from(
            &b"GET / HTTP/1.1\r\nX-Long: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n\r\n"[..],
        );
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), StatusCode::REQUEST_HEADER_FIELDS_TOO_LARGE);
    }

    #[test]
    fn conflicting_content_length_is_malformed() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 2\r\nContent-Length: 3\r\n\r\n"[..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Malformed(_))));
    }

    #[test]
    fn bad_chunk_size_is_rejected() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::InvalidChunk)));
    }

    #[test]
    fn eof_inside_body_is_incomplete() {
        let mut codec = codec();
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nab"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_some());
        assert!(matches!(codec.decode_eof(&mut buf).unwrap(), Some(RequestFrame::Data(_))));
        assert!(matches!(codec.decode_eof(&mut buf), Err(CodecError::IncompleteMessage)));
    }

    #[test]
    fn http10_version_is_preserved() {
        let mut codec = codec();
        let frames = decode_all(&mut codec, b"GET / HTTP/1.0\r\n\r\n");
        let RequestFrame::Head { head, .. } = &frames[0] else {
            panic!("expected head");
        };
        assert_eq!(head.version, Version::HTTP_10);
    }

    #[test]
    fn encodes_chunked_response() {
        let mut encoder = Http1Encoder::default();
        let mut dst = BytesMut::new();
        let mut head = ResponseHead::new(StatusCode::OK);
        head.headers.insert("x-a", HeaderValue::from_static("1"));
        encoder
            .encode(
                ResponseFrame::Head {
                    head,
                    version: Version::HTTP_11,
                    framing: Framing::Chunked,
                },
                &mut dst,
            )
            .unwrap();
        encoder.encode(ResponseFrame::Data(Bytes::from_static(b"hello")), &mut dst).unwrap();
        encoder.encode(ResponseFrame::End, &mut dst).unwrap();
        assert_eq!(
            &dst[..],
            &b"HTTP/1.1 200 OK\r\nx-a: 1\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"[..]
        );
    }

    #[test]
    fn encodes_length_delimited_response() {
        let mut encoder = Http1Encoder::default();
        let mut dst = BytesMut::new();
        let mut head = ResponseHead::new(StatusCode::NOT_FOUND);
        head.headers.insert(CONTENT_LENGTH, HeaderValue::from(2u64));
        encoder
            .encode(
                ResponseFrame::Head {
                    head,
                    version: Version::HTTP_10,
                    framing: Framing::Length,
                },
                &mut dst,
            )
            .unwrap();
        encoder.encode(ResponseFrame::Data(Bytes::from_static(b"no")), &mut dst).unwrap();
        encoder.encode(ResponseFrame::End, &mut dst).unwrap();
        assert_eq!(&dst[..], &b"HTTP/1.0 404 Not Found\r\ncontent-length: 2\r\n\r\nno"[..]);
    }
}
