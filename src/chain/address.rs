// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Nostr Custody Agent Developers

//! CashAddr codec.
//!
//! Base32 over `qpzry9x8gf2tvdw0s3jn54khce6mua7l` with a 40-bit BCH
//! polynomial checksum. The payload is a version byte (type and hash-size
//! bits) followed by the 20-byte public-key hash, repacked from 8-bit to
//! 5-bit groups. Round-trips byte-exact for any 20-byte hash.

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";

/// 40-bit generator constants for the checksum polynomial.
const GENERATORS: [u64; 5] = [
    0x98f2bc8e61,
    0x79b76d99e2,
    0xf33e5fb3c4,
    0xae2eabe2a8,
    0x1e4f43e470,
];

/// Default network prefix, assumed when the address carries none.
pub const DEFAULT_PREFIX: &str = "bitcoincash";

/// P2PKH with a 20-byte hash.
pub const VERSION_P2PKH: u8 = 0;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid address format: {0}")]
    InvalidFormat(String),

    #[error("invalid address checksum")]
    InvalidChecksum,
}

/// Checksum polynomial over GF(2), one 5-bit symbol at a time.
fn polymod(values: &[u8]) -> u64 {
    let mut chk: u64 = 1;
    for &v in values {
        let top = chk >> 35;
        chk = ((chk & 0x07ff_ffff_ff) << 5) ^ u64::from(v);
        for (i, generator) in GENERATORS.iter().enumerate() {
            if (top >> i) & 1 == 1 {
                chk ^= generator;
            }
        }
    }
    chk ^ 1
}

/// Lower 5 bits of each prefix character, then a zero separator.
fn expand_prefix(prefix: &str) -> Vec<u8> {
    let mut expanded: Vec<u8> = prefix.bytes().map(|b| b & 0x1f).collect();
    expanded.push(0);
    expanded
}

/// Regroup a bit stream between symbol widths.
fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Result<Vec<u8>, AddressError> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut out = Vec::with_capacity(data.len() * from as usize / to as usize + 1);
    let maxv: u32 = (1 << to) - 1;

    for &value in data {
        if u32::from(value) >> from != 0 {
            return Err(AddressError::InvalidFormat(format!(
                "value {value} exceeds {from} bits"
            )));
        }
        acc = (acc << from) | u32::from(value);
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & maxv) as u8);
        }
    }

    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & maxv) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & maxv) != 0 {
        return Err(AddressError::InvalidFormat("invalid padding".to_string()));
    }

    Ok(out)
}

/// Encode a 20-byte public-key hash as a prefixed CashAddr string.
pub fn encode(prefix: &str, version: u8, hash: &[u8; 20]) -> String {
    let mut payload = Vec::with_capacity(21);
    payload.push(version << 3);
    payload.extend_from_slice(hash);

    // 8→5 repack of a 21-byte payload always fits exactly; pad=true cannot fail.
    let converted = convert_bits(&payload, 8, 5, true).expect("payload bytes fit in 8 bits");

    let mut checksum_input = expand_prefix(prefix);
    checksum_input.extend_from_slice(&converted);
    checksum_input.extend_from_slice(&[0u8; 8]);
    let checksum = polymod(&checksum_input);

    let mut encoded = String::with_capacity(prefix.len() + 1 + converted.len() + 8);
    encoded.push_str(prefix);
    encoded.push(':');
    for &symbol in &converted {
        encoded.push(CHARSET[symbol as usize] as char);
    }
    for i in 0..8 {
        let symbol = ((checksum >> (5 * (7 - i))) & 0x1f) as usize;
        encoded.push(CHARSET[symbol] as char);
    }
    encoded
}

/// Decode a CashAddr string into (prefix, version, 20-byte hash).
///
/// Mixed-case input is rejected outright; an address without a prefix is
/// interpreted against [`DEFAULT_PREFIX`].
pub fn decode(address: &str) -> Result<(String, u8, [u8; 20]), AddressError> {
    if address != address.to_lowercase() && address != address.to_uppercase() {
        return Err(AddressError::InvalidFormat("mixed case".to_string()));
    }
    let address = address.to_lowercase();

    let (prefix, body) = match address.split_once(':') {
        Some((prefix, body)) => (prefix.to_string(), body),
        None => (DEFAULT_PREFIX.to_string(), address.as_str()),
    };
    if body.len() < 8 {
        return Err(AddressError::InvalidFormat("too short".to_string()));
    }

    let mut data = Vec::with_capacity(body.len());
    for c in body.bytes() {
        let symbol = CHARSET
            .iter()
            .position(|&ch| ch == c)
            .ok_or_else(|| AddressError::InvalidFormat(format!("invalid character {:?}", c as char)))?;
        data.push(symbol as u8);
    }

    let mut checksum_input = expand_prefix(&prefix);
    checksum_input.extend_from_slice(&data);
    if polymod(&checksum_input) != 0 {
        return Err(AddressError::InvalidChecksum);
    }

    let payload = convert_bits(&data[..data.len() - 8], 5, 8, false)?;
    if payload.len() != 21 {
        return Err(AddressError::InvalidFormat(format!(
            "payload is {} bytes, expected 21",
            payload.len()
        )));
    }
    let version = payload[0] >> 3;
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload[1..]);
    Ok((prefix, version, hash))
}
