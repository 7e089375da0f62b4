//! Forwarded header handling.
//!
//! # Responsibilities
//! - Parse RFC 7239 `Forwarded` (first element only: the hop closest to the client)
//! - Fall back to `X-Forwarded-For`, `X-Forwarded-Host`, `X-Forwarded-Proto`, `X-Forwarded-Port`
//!
//! # Design Decisions
//! - Only consulted when forwarded handling is enabled in the configuration
//! - `Forwarded` wins over the `X-Forwarded-*` family when both are present

use http::HeaderMap;

const FORWARDED: &str = "forwarded";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_PORT: &str = "x-forwarded-port";

/// Client-facing view of a proxied request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ForwardedInfo {
    pub remote: Option<String>,
    pub host: Option<String>,
    pub proto: Option<String>,
}

impl ForwardedInfo {
    fn is_empty(&self) -> bool {
        self.remote.is_none() && self.host.is_none() && self.proto.is_none()
    }
}

/// Resolve forwarding information, `None` if the request carries none.
pub fn parse(headers: &HeaderMap) -> Option<ForwardedInfo> {
    let info = match header_str(headers, FORWARDED) {
        Some(value) => parse_forwarded(value),
        None => parse_x_forwarded(headers),
    };
    (!info.is_empty()).then_some(info)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn parse_forwarded(value: &str) -> ForwardedInfo {
    let first = value.split(',').next().unwrap_or("");
    let mut info = ForwardedInfo::default();
    for pair in first.split(';') {
        let Some((key, val)) = pair.split_once('=') else {
            continue;
        };
        let val = val.trim().trim_matches('"').to_string();
        if val.is_empty() {
            continue;
        }
        match key.trim().to_ascii_lowercase().as_str() {
            "for" => info.remote = Some(val),
            "host" => info.host = Some(val),
            "proto" => info.proto = Some(val.to_ascii_lowercase()),
            _ => {}
        }
    }
    info
}

fn parse_x_forwarded(headers: &HeaderMap) -> ForwardedInfo {
    let first = |name: &str| {
        header_str(headers, name)
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let mut host = first(X_FORWARDED_HOST);
    if let (Some(h), Some(port)) = (host.as_mut(), first(X_FORWARDED_PORT)) {
        if !h.contains(':') {
            h.push(':');
            h.push_str(&port);
        }
    }

    ForwardedInfo {
        remote: first(X_FORWARDED_FOR),
        host,
        proto: first(X_FORWARDED_PROTO).map(|p| p.to_ascii_lowercase()),
    }
}
