//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, DuplexStream};

use reactive_http_server::http::error::HttpError;
use reactive_http_server::http::HttpHandler;
use reactive_http_server::net::{ConnectionId, ConnectionInfo, ConnectionObserver, ConnectionState};
use reactive_http_server::pipeline::{AcceptedConnection, PipelineAssembler};
use reactive_http_server::net::TlsSession;
use reactive_http_server::{HttpServerOptions, NegotiatedProtocol};

/// One notification received by a [`RecordingObserver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    State {
        state: ConnectionState,
        stream_id: Option<u32>,
    },
    Error {
        kind: &'static str,
        stream_id: Option<u32>,
    },
}

/// Observer that remembers everything it is told.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<Event>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<&'static str> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Error { kind, .. } => Some(kind),
                _ => None,
            })
            .collect()
    }

    pub fn configured(&self) -> Vec<NegotiatedProtocol> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::State {
                    state: ConnectionState::Configured(protocol),
                    ..
                } => Some(protocol),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: ConnectionState) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::State { state, .. } if *state == wanted))
            .count()
    }
}

impl ConnectionObserver for RecordingObserver {
    fn on_state_change(&self, connection: &ConnectionInfo, state: ConnectionState) {
        self.events.lock().unwrap().push(Event::State {
            state,
            stream_id: connection.stream_id(),
        });
    }

    fn on_error(&self, connection: &ConnectionInfo, error: &HttpError) {
        self.events.lock().unwrap().push(Event::Error {
            kind: error.kind(),
            stream_id: connection.stream_id(),
        });
    }
}

fn info(secure: bool) -> ConnectionInfo {
    let addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();
    let local: SocketAddr = "127.0.0.1:8080".parse().unwrap();
    ConnectionInfo::new(ConnectionId::new(), addr, local, secure)
}

fn assembler<H: HttpHandler>(
    options: HttpServerOptions,
    handler: H,
    observer: Arc<RecordingObserver>,
) -> PipelineAssembler {
    PipelineAssembler::new(Arc::new(options.build().unwrap()), Arc::new(handler), observer)
}

/// Serve a cleartext connection over an in-memory pipe. Returns the client end.
pub fn serve_plain<H: HttpHandler>(
    options: HttpServerOptions,
    handler: H,
    observer: Arc<RecordingObserver>,
) -> (DuplexStream, tokio::task::JoinHandle<()>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let assembler = assembler(options, handler, observer);
    let task = tokio::spawn(async move {
        assembler
            .serve_connection(AcceptedConnection::plain(server, info(false)))
            .await
    });
    (client, task)
}

/// Serve a connection whose TLS handshake selected `alpn`.
pub fn serve_alpn<H: HttpHandler>(
    options: HttpServerOptions,
    handler: H,
    observer: Arc<RecordingObserver>,
    alpn: Option<&[u8]>,
) -> (DuplexStream, tokio::task::JoinHandle<()>) {
    let (client, server) = tokio::io::duplex(64 * 1024);
    let assembler = assembler(options, handler, observer);
    let session = TlsSession::new(alpn);
    let task = tokio::spawn(async move {
        assembler
            .serve_connection(AcceptedConnection::secure(server, info(true), session))
            .await
    });
    (client, task)
}

/// Read until EOF and return the bytes as text.
pub async fn read_all<R: AsyncRead + Unpin>(reader: &mut R) -> String {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

/// Read up to and including the blank line ending a response head.
pub async fn read_head<R: AsyncRead + Unpin>(reader: &mut R) -> String {
    let mut buf = Vec::new();
    while !buf.ends_with(b"\r\n\r\n") {
        let byte = reader.read_u8().await.unwrap();
        buf.push(byte);
    }
    String::from_utf8(buf).unwrap()
}

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_ACK: u8 = 0x1;

/// One raw HTTP/2 frame.
#[derive(Debug)]
pub struct Frame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

pub fn frame(kind: u8, flags: u8, stream_id: u32, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(9 + payload.len());
    let len = payload.len() as u32;
    buf.put_u8((len >> 16) as u8);
    buf.put_u16(len as u16);
    buf.put_u8(kind);
    buf.put_u8(flags);
    buf.put_u32(stream_id & 0x7fff_ffff);
    buf.put_slice(payload);
    buf.freeze()
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Frame {
    let mut header = [0u8; 9];
    reader.read_exact(&mut header).await.unwrap();
    let len = ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await.unwrap();
    Frame {
        kind: header[3],
        flags: header[4],
        stream_id: u32::from_be_bytes([header[5], header[6], header[7], header[8]]) & 0x7fff_ffff,
        payload: Bytes::from(payload),
    }
}

/// HPACK "literal header field without indexing, new name" for short strings.
pub fn literal_header(name: &str, value: &str, dst: &mut BytesMut) {
    assert!(name.len() < 127 && value.len() < 127);
    dst.put_u8(0x00);
    dst.put_u8(name.len() as u8);
    dst.put_slice(name.as_bytes());
    dst.put_u8(value.len() as u8);
    dst.put_slice(value.as_bytes());
}
