//! Response compression policy and encoder.
//!
//! # Responsibilities
//! - Derive the effective per-response compression predicate from the
//!   configured minimum size and an optional user predicate
//! - Negotiate gzip/deflate from `Accept-Encoding`
//! - Encode full and streaming bodies
//!
//! # Policy
//! ```text
//! min_size <= 0, no predicate   → None   (caller decides: 0 = always, <0 = never)
//! min_size <= 0, predicate P    → P
//! min_size  > 0                 → content-length >= min_size  [&& P]
//!                                 missing/unparsable length is eligible
//! ```

use std::io::{self, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use futures_util::StreamExt;
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH, VARY};
use http::{HeaderValue, Method};

use crate::http::error::BoxError;
use crate::http::request::RequestHead;
use crate::http::response::{ResponseBody, ResponseHead};

/// Decides, per response, whether compression applies.
pub type CompressPredicate = Arc<dyn Fn(&RequestHead, &ResponseHead) -> bool + Send + Sync>;

/// Build the effective predicate.
///
/// `None` does not mean "never": with `min_size == 0` the caller installs an
/// unconditional compression stage instead.
pub fn derive(min_size: i64, predicate: Option<CompressPredicate>) -> Option<CompressPredicate> {
    if min_size <= 0 {
        return predicate;
    }

    let length_check = move |_: &RequestHead, response: &ResponseHead| -> bool {
        response
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map_or(true, |length| length >= min_size)
    };

    match predicate {
        None => Some(Arc::new(length_check)),
        Some(user) => Some(Arc::new(move |request: &RequestHead, response: &ResponseHead| {
            let length_ok = length_check(request, response);
            let user_ok = user(request, response);
            length_ok && user_ok
        })),
    }
}

/// Supported content codings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
}

impl ContentCoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentCoding::Gzip => "gzip",
            ContentCoding::Deflate => "deflate",
        }
    }

    /// Pick a coding from an `Accept-Encoding` value, preferring gzip on ties.
    pub fn negotiate(accept_encoding: &str) -> Option<Self> {
        let mut gzip = None;
        let mut deflate = None;
        let mut any = None;

        for item in accept_encoding.split(',') {
            let mut params = item.split(';');
            let coding = params.next().unwrap_or("").trim();
            let quality = params
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);

            if coding.eq_ignore_ascii_case("gzip") || coding.eq_ignore_ascii_case("x-gzip") {
                gzip = Some(quality);
            } else if coding.eq_ignore_ascii_case("deflate") {
                deflate = Some(quality);
            } else if coding == "*" {
                any = Some(quality);
            }
        }

        let gzip = gzip.or(any).unwrap_or(0.0);
        let deflate = deflate.or(any).unwrap_or(0.0);
        if gzip <= 0.0 && deflate <= 0.0 {
            None
        } else if gzip >= deflate {
            Some(ContentCoding::Gzip)
        } else {
            Some(ContentCoding::Deflate)
        }
    }
}

/// Coding to apply to this response, if any.
pub(crate) fn select_coding(
    method: &Method,
    accept_encoding: Option<&HeaderValue>,
    head: &ResponseHead,
    body: &ResponseBody,
) -> Option<ContentCoding> {
    if method == Method::HEAD
        || head.forbids_body()
        || head.headers.contains_key(CONTENT_ENCODING)
        || body.is_empty()
    {
        return None;
    }
    accept_encoding
        .and_then(|v| v.to_str().ok())
        .and_then(ContentCoding::negotiate)
}

/// Rewrite headers and wrap the body in the encoder.
pub(crate) fn encode(coding: ContentCoding, head: &mut ResponseHead, body: ResponseBody) -> ResponseBody {
    head.headers.remove(CONTENT_LENGTH);
    head.headers
        .insert(CONTENT_ENCODING, HeaderValue::from_static(coding.as_str()));
    head.headers
        .append(VARY, HeaderValue::from_static("accept-encoding"));

    match body {
        ResponseBody::Empty => ResponseBody::Empty,
        ResponseBody::Full(bytes) => {
            let mut encoder = StreamEncoder::new(coding);
            let encoded = encoder
                .write_chunk(&bytes)
                .and_then(|mut out| {
                    out.extend_from_slice(&encoder.finish()?);
                    Ok(out)
                });
            match encoded {
                Ok(out) => ResponseBody::Full(out.into()),
                Err(e) => ResponseBody::stream(futures_util::stream::once(async move {
                    Err::<Bytes, BoxError>(e.into())
                })),
            }
        }
        ResponseBody::Stream(stream) => {
            let encoded = futures_util::stream::unfold(
                Some((stream, StreamEncoder::new(coding))),
                |state| async move {
                    let (mut stream, mut encoder) = state?;
                    loop {
                        match stream.next().await {
                            Some(Ok(chunk)) => match encoder.write_chunk(&chunk) {
                                Ok(out) if out.is_empty() => continue,
                                Ok(out) => return Some((Ok(Bytes::from(out)), Some((stream, encoder)))),
                                Err(e) => return Some((Err(e.into()), None)),
                            },
                            Some(Err(e)) => return Some((Err(e), None)),
                            None => {
                                return match encoder.finish() {
                                    Ok(out) => Some((Ok(Bytes::from(out)), None)),
                                    Err(e) => Some((Err(e.into()), None)),
                                }
                            }
                        }
                    }
                },
            );
            ResponseBody::Stream(encoded.boxed())
        }
    }
}

enum StreamEncoder {
    Gzip(GzEncoder<Vec<u8>>),
    Deflate(ZlibEncoder<Vec<u8>>),
}

impl StreamEncoder {
    fn new(coding: ContentCoding) -> Self {
        match coding {
            ContentCoding::Gzip => StreamEncoder::Gzip(GzEncoder::new(Vec::new(), Compression::default())),
            ContentCoding::Deflate => {
                StreamEncoder::Deflate(ZlibEncoder::new(Vec::new(), Compression::default()))
            }
        }
    }

    /// Encode and sync-flush one chunk, returning whatever output is ready.
    fn write_chunk(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            StreamEncoder::Gzip(encoder) => {
                encoder.write_all(data)?;
                encoder.flush()?;
                Ok(std::mem::take(encoder.get_mut()))
            }
            StreamEncoder::Deflate(encoder) => {
                encoder.write_all(data)?;
                encoder.flush()?;
                Ok(std::mem::take(encoder.get_mut()))
            }
        }
    }

    fn finish(self) -> io::Result<Vec<u8>> {
        match self {
            StreamEncoder::Gzip(encoder) => encoder.finish(),
            StreamEncoder::Deflate(encoder) => encoder.finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use http::{HeaderMap, StatusCode, Uri, Version};
    use std::io::Read;

    fn request() -> RequestHead {
        RequestHead::new(Method::GET, Uri::from_static("/"), Version::HTTP_11, HeaderMap::new())
    }

    fn response(length: Option<&'static str>) -> ResponseHead {
        let mut head = ResponseHead::new(StatusCode::OK);
        if let Some(length) = length {
            head.headers.insert(CONTENT_LENGTH, HeaderValue::from_static(length));
        }
        head
    }

    fn always(result: bool) -> CompressPredicate {
        Arc::new(move |_: &RequestHead, _: &ResponseHead| result)
    }

    #[test]
    fn non_positive_threshold_without_predicate_is_absent() {
        assert!(derive(0, None).is_none());
        assert!(derive(-1, None).is_none());
    }

    #[test]
    fn non_positive_threshold_passes_user_predicate_through() {
        let derived = derive(0, Some(always(false))).unwrap();
        assert!(!derived(&request(), &response(Some("100000"))));
        let derived = derive(-1, Some(always(true))).unwrap();
        assert!(derived(&request(), &response(None)));
    }

    #[test]
    fn unknown_length_fails_open() {
        let derived = derive(100, None).unwrap();
        assert!(derived(&request(), &response(None)));
        assert!(derived(&request(), &response(Some("lots"))));
    }

    #[test]
    fn length_compared_against_threshold() {
        let derived = derive(100, None).unwrap();
        assert!(!derived(&request(), &response(Some("99"))));
        assert!(derived(&request(), &response(Some("100"))));
        assert!(derived(&request(), &response(Some("101"))));

        let with_user = derive(100, Some(always(true))).unwrap();
        assert!(!with_user(&request(), &response(Some("99"))));
        assert!(with_user(&request(), &response(Some("100"))));
    }

    #[test]
    fn user_predicate_is_required_in_addition() {
        let derived = derive(10, Some(always(false))).unwrap();
        assert!(!derived(&request(), &response(Some("5000"))));
        assert!(!derived(&request(), &response(None)));
    }

    #[test]
    fn negotiation_honors_quality() {
        assert_eq!(ContentCoding::negotiate("gzip, deflate"), Some(ContentCoding::Gzip));
        assert_eq!(ContentCoding::negotiate("gzip;q=0.2, deflate"), Some(ContentCoding::Deflate));
        assert_eq!(ContentCoding::negotiate("br"), None);
        assert_eq!(ContentCoding::negotiate("*"), Some(ContentCoding::Gzip));
        assert_eq!(ContentCoding::negotiate("gzip;q=0, deflate;q=0"), None);
    }

    #[test]
    fn selection_skips_head_and_encoded_responses() {
        let accept = HeaderValue::from_static("gzip");
        let body = ResponseBody::from("payload");
        let head = response(None);
        assert_eq!(
            select_coding(&Method::GET, Some(&accept), &head, &body),
            Some(ContentCoding::Gzip)
        );
        assert_eq!(select_coding(&Method::HEAD, Some(&accept), &head, &body), None);
        assert_eq!(select_coding(&Method::GET, None, &head, &body), None);

        let mut encoded = response(None);
        encoded.headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        assert_eq!(select_coding(&Method::GET, Some(&accept), &encoded, &body), None);
    }

    #[test]
    fn full_body_round_trips_through_gzip() {
        let mut head = response(Some("11"));
        let body = encode(ContentCoding::Gzip, &mut head, ResponseBody::from("hello world"));
        assert!(head.headers.get(CONTENT_LENGTH).is_none());
        assert_eq!(head.headers[CONTENT_ENCODING], "gzip");

        let ResponseBody::Full(bytes) = body else {
            panic!("expected a full body");
        };
        let mut decoded = String::new();
        GzDecoder::new(&bytes[..]).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "hello world");
    }

    #[tokio::test]
    async fn streamed_body_round_trips_through_gzip() {
        let mut head = response(None);
        let chunks = vec![
            Ok::<_, BoxError>(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"streaming ")),
            Ok(Bytes::from_static(b"world")),
        ];
        let body = encode(
            ContentCoding::Gzip,
            &mut head,
            ResponseBody::stream(futures_util::stream::iter(chunks)),
        );
        let ResponseBody::Stream(mut stream) = body else {
            panic!("expected a streamed body");
        };
        let mut compressed = Vec::new();
        while let Some(chunk) = stream.next().await {
            compressed.extend_from_slice(&chunk.unwrap());
        }
        let mut decoded = String::new();
        GzDecoder::new(&compressed[..]).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded, "hello streaming world");
    }
}
