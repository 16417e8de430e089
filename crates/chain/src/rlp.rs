//! Minimal RLP encoder used for hashing block primitives.
//!
//! Only encoding is needed: the wire codec belongs to the transport, the
//! engine just has to agree with peers on what a header or body hashes to.

use alloy_primitives::{B256, U256};

/// Encode a byte string.
pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        return data.to_vec();
    }
    let mut out = length_prefix(data.len(), 0x80);
    out.extend_from_slice(data);
    out
}

pub fn encode_b256(hash: &B256) -> Vec<u8> {
    encode_bytes(hash.as_slice())
}

/// Encode an integer as big-endian bytes without leading zeros.
pub fn encode_u64(v: u64) -> Vec<u8> {
    encode_bytes(trim_leading_zeros(&v.to_be_bytes()))
}

pub fn encode_u256(v: &U256) -> Vec<u8> {
    encode_bytes(trim_leading_zeros(&v.to_be_bytes::<32>()))
}

pub fn encode_bool(v: bool) -> Vec<u8> {
    encode_u64(v as u64)
}

/// Wrap already-encoded items into a list.
pub fn encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload_len: usize = items.iter().map(Vec::len).sum();
    let mut out = length_prefix(payload_len, 0xc0);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

/// Encode a list of raw byte strings.
pub fn encode_bytes_list<T: AsRef<[u8]>>(items: &[T]) -> Vec<u8> {
    let encoded: Vec<Vec<u8>> = items.iter().map(|i| encode_bytes(i.as_ref())).collect();
    encode_list(&encoded)
}

fn length_prefix(len: usize, offset: u8) -> Vec<u8> {
    if len < 56 {
        return vec![offset + len as u8];
    }
    let len_bytes = (len as u64).to_be_bytes();
    let len_bytes = trim_leading_zeros(&len_bytes);
    let mut out = Vec::with_capacity(1 + len_bytes.len());
    out.push(offset + 55 + len_bytes.len() as u8);
    out.extend_from_slice(len_bytes);
    out
}

fn trim_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}
