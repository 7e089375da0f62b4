//! HPACK encoding of literal header fields (RFC 7541 section 6.2.2).
//!
//! Only what is needed to replay an upgraded HTTP/1.1 request as an
//! HTTP/2 HEADERS frame: no indexing, no Huffman coding.

use bytes::{BufMut, BytesMut};

/// Literal header field without indexing, new name.
pub(crate) fn encode_literal(name: &[u8], value: &[u8], dst: &mut BytesMut) {
    dst.put_u8(0x00);
    encode_string(name, dst);
    encode_string(value, dst);
}

fn encode_string(s: &[u8], dst: &mut BytesMut) {
    encode_integer(s.len(), 7, 0x00, dst);
    dst.extend_from_slice(s);
}

/// Prefixed integer (RFC 7541 section 5.1). `flags` fills the bits above the prefix.
pub(crate) fn encode_integer(mut value: usize, prefix_bits: u8, flags: u8, dst: &mut BytesMut) {
    let max_prefix = (1usize << prefix_bits) - 1;
    if value < max_prefix {
        dst.put_u8(flags | value as u8);
        return;
    }
    dst.put_u8(flags | max_prefix as u8);
    value -= max_prefix;
    while value >= 128 {
        dst.put_u8((value % 128) as u8 | 0x80);
        value /= 128;
    }
    dst.put_u8(value as u8);
}
