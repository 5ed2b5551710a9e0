// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Byte-primitive helpers shared by every on-disk-structure parser in the
//! workspace: string decoders, the octal/binary numeric encoding tar uses,
//! checksum routines, and streaming-digest wrappers.
//!
//! Endianness-aware integers themselves are not duplicated here — every
//! reader decodes those directly with `zerocopy`'s `little_endian`/
//! `big_endian` wrapper types over `#[repr(C)]` structs, the same way the
//! donor's FAT and exFAT readers do.

use diskit_err::{ctx, Error, Result};

/// Decodes a byte slice as ASCII/Latin-1 up to the first NUL, or the whole
/// slice if there is none.
pub fn decode_nul_terminated(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Decodes a fixed-width ASCII field, trimming trailing spaces (and NULs).
/// Used for tar header fields and FAT 8.3 names.
pub fn decode_fixed_ascii(bytes: &[u8]) -> String {
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != 0)
        .map(|i| i + 1)
        .unwrap_or(0);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Decodes a little-endian UTF-16 code unit sequence, stopping at the first
/// NUL or at the end of the slice, replacing unpaired surrogates with U+FFFD.
pub fn decode_utf16le_nul(units: &[u16]) -> String {
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    char::decode_utf16(units[..end].iter().copied())
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Decodes a big-endian UTF-16 code unit sequence in full (no NUL
/// termination) — used by HFS+ catalog keys and UDF/ISO9660 Unicode names.
pub fn decode_utf16be(bytes: &[u8]) -> String {
    let units = bytes
        .chunks_exact(2)
        .map(|c| u16::from_be_bytes([c[0], c[1]]));
    char::decode_utf16(units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect()
}

/// Parses a tar-style numeric field: either NUL/space-padded ASCII octal, or
/// (the GNU extension) a leading `0x80` byte followed by a big-endian binary
/// integer filling the rest of the field.
pub fn parse_tar_numeric(field: &[u8]) -> Result<u64> {
    if field.first() == Some(&0x80) {
        let mut value: u64 = 0;
        for &b in &field[1..] {
            value = (value << 8) | b as u64;
        }
        return Ok(value);
    }

    let text = decode_fixed_ascii(field);
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if text.is_empty() {
        return Ok(0);
    }
    u64::from_str_radix(text, 8)
        .map_err(|e| Error::CorruptStructure(ctx!("tar", "bad octal field {text:?}: {e}")))
}

/// Encodes `value` as an 11-character NUL-terminated ASCII octal field (the
/// 12th byte of the 12-byte tar numeric fields is always the terminator).
pub fn encode_tar_octal(value: u64, field_len: usize) -> Vec<u8> {
    let digits = format!("{value:0width$o}\0", width = field_len - 1);
    let mut out = digits.into_bytes();
    out.truncate(field_len);
    out
}

/// Plain CRC-32 (IEEE 802.3 polynomial) over one buffer.
pub fn crc32(bytes: &[u8]) -> u32 {
    crc32fast::hash(bytes)
}

/// Incremental CRC-32, used by GPT (header + entry array) and UDF (tag CRC).
#[derive(Default, Clone)]
pub struct Crc32Incremental(crc32fast::Hasher);

impl Crc32Incremental {
    pub fn new() -> Self {
        Self(crc32fast::Hasher::new())
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(self) -> u32 {
        self.0.finalize()
    }
}

/// UDF's 16-byte tag checksum: the 8-bit sum of bytes 0..=3 and 5..=15 of the
/// tag (byte 4, the checksum field itself, is excluded).
pub fn udf_tag_checksum(tag_bytes: &[u8; 16]) -> u8 {
    tag_bytes[0..4]
        .iter()
        .chain(tag_bytes[5..16].iter())
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// A streaming digest, implemented by the SHA-1 and MD5 wrappers below so
/// the hash-observing sparse stream (component B) can be generic over which
/// algorithm it drives.
pub trait StreamingDigest: Send {
    fn update(&mut self, data: &[u8]);
    fn finalize(self: Box<Self>) -> Vec<u8>;
}

#[derive(Default)]
pub struct Sha1Digest(sha1::Sha1);

impl Sha1Digest {
    pub fn new() -> Self {
        use sha1::Digest;
        Self(sha1::Sha1::new())
    }
}

impl StreamingDigest for Sha1Digest {
    fn update(&mut self, data: &[u8]) {
        use sha1::Digest;
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        use sha1::Digest;
        self.0.finalize().to_vec()
    }
}

#[derive(Default)]
pub struct Md5Digest(md5::Md5);

impl Md5Digest {
    pub fn new() -> Self {
        use md5::Digest;
        Self(md5::Md5::new())
    }
}

impl StreamingDigest for Md5Digest {
    fn update(&mut self, data: &[u8]) {
        use md5::Digest;
        self.0.update(data);
    }

    fn finalize(self: Box<Self>) -> Vec<u8> {
        use md5::Digest;
        self.0.finalize().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nul_terminated_stops_at_first_nul() {
        assert_eq!(decode_nul_terminated(b"hello\0garbage"), "hello");
        assert_eq!(decode_nul_terminated(b"no-nul"), "no-nul");
    }

    #[test]
    fn fixed_ascii_trims_trailing_space_and_nul() {
        assert_eq!(decode_fixed_ascii(b"NO NAME    "), "NO NAME");
        assert_eq!(decode_fixed_ascii(b"FOO\0\0\0\0\0"), "FOO");
        assert_eq!(decode_fixed_ascii(b"        "), "");
    }

    #[test]
    fn tar_numeric_octal_roundtrip() {
        let field = encode_tar_octal(83, 12);
        assert_eq!(parse_tar_numeric(&field).unwrap(), 83);
    }

    #[test]
    fn tar_numeric_binary_extension() {
        let mut field = [0u8; 12];
        field[0] = 0x80;
        let value: u64 = 0x1_2345_6789;
        field[4..12].copy_from_slice(&value.to_be_bytes());
        assert_eq!(parse_tar_numeric(&field).unwrap(), value);
    }

    #[test]
    fn udf_checksum_matches_hand_computed() {
        let mut tag = [0u8; 16];
        tag[0] = 1;
        tag[1] = 2;
        tag[2] = 3;
        tag[3] = 4;
        tag[4] = 0xFF; // checksum slot itself, excluded
        tag[5] = 5;
        let expected: u8 = (1u16 + 2 + 3 + 4 + 5) as u8;
        assert_eq!(udf_tag_checksum(&tag), expected);
    }

    #[test]
    fn crc32_is_stable() {
        assert_eq!(crc32(b"123456789"), 0xCBF43926);
    }
}
