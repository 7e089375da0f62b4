//! Cleartext HTTP/2 upgrade (h2c, RFC 7540 section 3.2).
//!
//! # Responsibilities
//! - Decode the `HTTP2-Settings` header of an upgrade request
//! - Encode the upgrade request as the HEADERS block of stream 1
//! - After `101 Switching Protocols`, splice both into the client's
//!   connection preface so the HTTP/2 server sees an ordinary connection
//!
//! # Design Decisions
//! - The upgrade settings are prepended to the client's first SETTINGS
//!   frame rather than sent as a frame of their own, so the client only
//!   receives one SETTINGS acknowledgement
//! - The request on stream 1 is half-closed (END_STREAM): upgrades are
//!   only accepted for requests without a body

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use bytes::{BufMut, Bytes, BytesMut};
use http::header::{self, HeaderName};
use http::HeaderValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

use crate::http::error::{HttpError, NegotiationError};
use crate::http::h2::hpack;
use crate::http::h2::rewind::Rewind;
use crate::http::request::RequestHead;

/// Client connection preface (RFC 7540 section 3.5).
pub(crate) const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) const SWITCHING_PROTOCOLS: &[u8] =
    b"HTTP/1.1 101 Switching Protocols\r\nconnection: upgrade\r\nupgrade: h2c\r\n\r\n";

pub(crate) const HTTP2_SETTINGS: &str = "http2-settings";

const FRAME_HEADER_LEN: usize = 9;
const SETTING_LEN: usize = 6;
const DEFAULT_MAX_FRAME_SIZE: usize = 16_384;
const TYPE_HEADERS: u8 = 0x1;
const TYPE_SETTINGS: u8 = 0x4;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_STREAM: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

/// An accepted upgrade request, ready to be replayed as HTTP/2.
#[derive(Debug, Clone)]
pub struct H2cUpgrade {
    settings: Bytes,
    header_block: Bytes,
}

impl H2cUpgrade {
    /// `Ok(None)` when the request cannot be carried in a single HEADERS frame.
    pub(crate) fn from_request(
        head: &RequestHead,
        settings: &HeaderValue,
    ) -> Result<Option<Self>, NegotiationError> {
        let settings = decode_settings(settings)?;
        let header_block = encode_request_headers(head);
        if header_block.len() > DEFAULT_MAX_FRAME_SIZE {
            tracing::debug!(size = header_block.len(), "Upgrade request too large for one HEADERS frame");
            return Ok(None);
        }
        Ok(Some(Self {
            settings,
            header_block,
        }))
    }

    /// Settings payload carried by the `HTTP2-Settings` header.
    pub fn settings(&self) -> &[u8] {
        &self.settings
    }

    /// Read the client preface and first SETTINGS frame from `io`, then
    /// replay them with the upgrade merged in, followed by stream 1.
    pub(crate) async fn prepare_io<IO>(&self, io: IO, leftover: Bytes) -> Result<Rewind<IO>, HttpError>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let mut io = Rewind::new_buffered(io, leftover);

        let mut preface = [0u8; PREFACE.len()];
        io.read_exact(&mut preface).await?;
        if &preface != PREFACE {
            return Err(NegotiationError::InvalidPreface.into());
        }

        let mut frame_header = [0u8; FRAME_HEADER_LEN];
        io.read_exact(&mut frame_header).await?;
        let length = u32::from_be_bytes([0, frame_header[0], frame_header[1], frame_header[2]]) as usize;
        let stream_id = u32::from_be_bytes([
            frame_header[5],
            frame_header[6],
            frame_header[7],
            frame_header[8],
        ]) & 0x7fff_ffff;
        if frame_header[3] != TYPE_SETTINGS
            || frame_header[4] & FLAG_ACK != 0
            || stream_id != 0
            || length % SETTING_LEN != 0
            || length + self.settings.len() > DEFAULT_MAX_FRAME_SIZE
        {
            return Err(NegotiationError::InvalidPreface.into());
        }
        let mut client_settings = vec![0u8; length];
        io.read_exact(&mut client_settings).await?;

        let merged_len = self.settings.len() + length;
        let mut replay = BytesMut::with_capacity(
            PREFACE.len() + 2 * FRAME_HEADER_LEN + merged_len + self.header_block.len(),
        );
        replay.extend_from_slice(PREFACE);
        put_frame_header(&mut replay, merged_len, TYPE_SETTINGS, 0, 0);
        // Later values win, so the client's own SETTINGS frame overrides the header.
        replay.extend_from_slice(&self.settings);
        replay.extend_from_slice(&client_settings);
        put_frame_header(
            &mut replay,
            self.header_block.len(),
            TYPE_HEADERS,
            FLAG_END_STREAM | FLAG_END_HEADERS,
            1,
        );
        replay.extend_from_slice(&self.header_block);

        io.rewind(replay.freeze());
        Ok(io)
    }
}

/// Decode a base64url `HTTP2-Settings` value into a SETTINGS payload.
pub(crate) fn decode_settings(value: &HeaderValue) -> Result<Bytes, NegotiationError> {
    let encoded = value
        .to_str()
        .map_err(|e| NegotiationError::MalformedSettings(e.to_string()))?
        .trim()
        .trim_end_matches('=');
    let payload = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| NegotiationError::MalformedSettings(e.to_string()))?;
    if payload.len() % SETTING_LEN != 0 {
        return Err(NegotiationError::MalformedSettings(format!(
            "payload of {} bytes is not a sequence of settings",
            payload.len()
        )));
    }
    Ok(payload.into())
}

fn put_frame_header(dst: &mut BytesMut, length: usize, kind: u8, flags: u8, stream_id: u32) {
    let length = length as u32;
    dst.put_slice(&length.to_be_bytes()[1..]);
    dst.put_u8(kind);
    dst.put_u8(flags);
    dst.put_u32(stream_id & 0x7fff_ffff);
}

/// Headers that only describe the HTTP/1.1 hop.
fn is_connection_specific(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == header::UPGRADE
        || name == header::HOST
        || name == header::TRANSFER_ENCODING
        || matches!(name.as_str(), HTTP2_SETTINGS | "keep-alive" | "proxy-connection")
}

fn encode_request_headers(head: &RequestHead) -> Bytes {
    let mut block = BytesMut::new();
    hpack::encode_literal(b":method", head.method.as_str().as_bytes(), &mut block);
    hpack::encode_literal(b":scheme", b"http", &mut block);

    let authority = head
        .headers
        .get(header::HOST)
        .map(HeaderValue::as_bytes)
        .or_else(|| head.uri.authority().map(|a| a.as_str().as_bytes()));
    if let Some(authority) = authority {
        hpack::encode_literal(b":authority", authority, &mut block);
    }

    let path = head.uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    hpack::encode_literal(b":path", path.as_bytes(), &mut block);

    for (name, value) in head.headers.iter() {
        if is_connection_specific(name) {
            continue;
        }
        if name == header::TE && *value != "trailers" {
            continue;
        }
        hpack::encode_literal(name.as_str().as_bytes(), value.as_bytes(), &mut block);
    }
    block.freeze()
}
