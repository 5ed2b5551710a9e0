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

//! Decompression streams used by the WIM reader and by optical-container
//! sector readers.
//!
//! [`decode_xpress`] and [`decode_lzx`] each take one compressed chunk plus
//! its declared uncompressed length and return the decompressed bytes;
//! chunking and resource-table bookkeeping live in `diskit_fs_wim`, not
//! here. [`Mode2Stream`] strips CD-ROM Mode 2 Form 1 sector framing.

use diskit_err::{ctx, Error, Result};
use diskit_stream::{ExtentSet, SparseStream};

/// Reads bits MSB-first out of consecutive little-endian 16-bit words, the
/// packing both XPRESS and LZX use for Huffman-coded symbols.
struct BitReader<'a> {
    data: &'a [u8],
    byte_pos: usize,
    word: u16,
    bit_index: u32,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Result<Self> {
        let word = read_u16le(data, 0)?;
        Ok(Self { data, byte_pos: 2, word, bit_index: 0 })
    }

    fn read_bit(&mut self) -> Result<u32> {
        if self.bit_index == 16 {
            self.word = read_u16le(self.data, self.byte_pos)?;
            self.byte_pos += 2;
            self.bit_index = 0;
        }
        let bit = (self.word as u32 >> (15 - self.bit_index)) & 1;
        self.bit_index += 1;
        Ok(bit)
    }

    fn read_bits(&mut self, count: u32) -> Result<u32> {
        let mut value = 0u32;
        for _ in 0..count {
            value = (value << 1) | self.read_bit()?;
        }
        Ok(value)
    }

    /// Discards any partially-consumed 16-bit word, leaving the reader
    /// aligned on the next word boundary. Used by LZX's uncompressed block.
    fn align_to_word(&mut self) {
        self.bit_index = 16;
    }

    fn byte_offset(&self) -> usize {
        self.byte_pos - 2 + (self.bit_index / 8) as usize
    }
}

fn read_u16le(data: &[u8], pos: usize) -> Result<u16> {
    if pos + 2 > data.len() {
        // Past-the-end reads are common at the tail of the last word; the
        // caller only ever consumes as many bits as the declared output
        // size demands, so pad with zero rather than failing.
        let mut bytes = [0u8; 2];
        if pos < data.len() {
            bytes[0] = data[pos];
        }
        return Ok(u16::from_le_bytes(bytes));
    }
    Ok(u16::from_le_bytes([data[pos], data[pos + 1]]))
}

/// A canonical Huffman decode table: for each code length 1..=max_len, the
/// symbols with that length (in ascending symbol order) and the first
/// canonical code value assigned at that length.
struct HuffmanTable {
    symbols_by_length: Vec<Vec<u16>>,
    first_code: Vec<u32>,
    max_len: u32,
}

impl HuffmanTable {
    fn build(lengths: &[u8], max_len: u32) -> Result<Self> {
        let max_len = max_len as usize;
        let mut counts = vec![0u32; max_len + 1];
        for &l in lengths {
            let l = l as usize;
            if l > max_len {
                return Err(Error::CorruptStructure(ctx!("codec", "huffman code length {l} exceeds max {max_len}")));
            }
            if l > 0 {
                counts[l] += 1;
            }
        }
        let mut first_code = vec![0u32; max_len + 1];
        let mut code = 0u32;
        for len in 1..=max_len {
            first_code[len] = code;
            code = (code + counts[len]) << 1;
        }
        let mut symbols_by_length = vec![Vec::new(); max_len + 1];
        for (sym, &l) in lengths.iter().enumerate() {
            if l > 0 {
                symbols_by_length[l as usize].push(sym as u16);
            }
        }
        Ok(Self { symbols_by_length, first_code, max_len: max_len as u32 })
    }

    fn decode(&self, bits: &mut BitReader) -> Result<u16> {
        let mut code = 0u32;
        for len in 1..=self.max_len as usize {
            code = (code << 1) | bits.read_bit()?;
            let base = self.first_code[len];
            let count = self.symbols_by_length[len].len() as u32;
            if count > 0 && code >= base && code - base < count {
                return Ok(self.symbols_by_length[len][(code - base) as usize]);
            }
        }
        Err(Error::CorruptStructure(ctx!("codec", "huffman code does not resolve to any symbol")))
    }
}

const XPRESS_NUM_SYMBOLS: usize = 512;
const XPRESS_MIN_MATCH: u32 = 3;

/// Decompresses one XPRESS-coded chunk (MS-XCA) into exactly `output_len`
/// bytes.
///
/// The leading 256 bytes of `input` are a table of 4-bit code lengths (two
/// symbols per byte, low nibble first) for a single canonical Huffman tree
/// over 512 symbols: 0..256 are literal bytes, 256..512 each pack a
/// position-slot/length-nibble pair for a back-reference.
pub fn decode_xpress(input: &[u8], output_len: usize) -> Result<Vec<u8>> {
    if input.len() < XPRESS_NUM_SYMBOLS / 2 {
        return Err(Error::Truncated(ctx!("xpress", "input shorter than the 256-byte huffman table")));
    }
    let mut lengths = [0u8; XPRESS_NUM_SYMBOLS];
    for (i, &b) in input[..XPRESS_NUM_SYMBOLS / 2].iter().enumerate() {
        lengths[2 * i] = b & 0xF;
        lengths[2 * i + 1] = b >> 4;
    }
    let table = HuffmanTable::build(&lengths, 15)?;
    let mut bits = BitReader::new(&input[XPRESS_NUM_SYMBOLS / 2..])?;

    let mut out = Vec::with_capacity(output_len);
    while out.len() < output_len {
        let sym = table.decode(&mut bits)?;
        if sym < 256 {
            out.push(sym as u8);
            continue;
        }
        let sym = (sym - 256) as u32;
        let offset_bits = sym >> 4;
        let length_nibble = sym & 0xF;

        let mut length = length_nibble;
        if length_nibble == 0xF {
            let extra = bits.read_bits(8)?;
            length += extra;
            if length == 0xF + 0xFF {
                length = bits.read_bits(16)?;
            }
        }
        length += XPRESS_MIN_MATCH;

        let offset = if offset_bits == 0 { 0 } else { (1u32 << offset_bits) - 1 } + bits.read_bits(offset_bits)?;
        let distance = offset as usize + 1;
        if distance > out.len() {
            return Err(Error::CorruptStructure(ctx!("xpress", "back-reference distance {distance} exceeds output so far")));
        }
        for _ in 0..length {
            let byte = out[out.len() - distance];
            out.push(byte);
            if out.len() >= output_len {
                break;
            }
        }
    }
    out.truncate(output_len);
    Ok(out)
}

const LZX_MIN_MATCH: u32 = 2;
const LZX_NUM_CHARS: usize = 256;
const LZX_PRETREE_NUM_ELEMENTS: usize = 20;
const LZX_ALIGNED_NUM_ELEMENTS: usize = 8;
const LZX_LENGTH_TREE_ELEMENTS: usize = 249;

const BLOCK_VERBATIM: u32 = 1;
const BLOCK_ALIGNED: u32 = 2;
const BLOCK_UNCOMPRESSED: u32 = 3;

/// Position-slot extra-bit counts, LZX's footer-bits table extended to the
/// 32 MiB window WIM resources may declare.
const POSITION_EXTRA_BITS: [u32; 51] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13, 13, 14, 14, 15, 15, 16,
    16, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17, 17,
];

fn position_base_table() -> [u32; 51] {
    let mut base = [0u32; 51];
    let mut acc = 0u32;
    for i in 0..51 {
        base[i] = acc;
        acc += 1 << POSITION_EXTRA_BITS[i];
    }
    base
}

fn num_position_slots(window_size: u32) -> usize {
    // The slot whose base exceeds the window size is never reached; this
    // mirrors the reference encoder's table lookup by window order.
    let base = position_base_table();
    base.iter().position(|&b| b >= window_size).unwrap_or(50).max(4).min(50) + 1
}

/// Reads a 20-element pretree (3-bit lengths, no escapes) and uses it to
/// decode `count` code lengths for a downstream tree, honoring the three
/// run-length shortcuts LZX defines: 17 (zero run, 4-bit count + 3),
/// 18 (zero run, 5-bit count + 20), 19 (repeat-previous run, 1-bit count +
/// 4, XORed with 1 via one more pretree symbol).
fn decode_lengths(bits: &mut BitReader, count: usize, previous: &[u8]) -> Result<Vec<u8>> {
    let mut pretree_lengths = [0u8; LZX_PRETREE_NUM_ELEMENTS];
    for l in pretree_lengths.iter_mut() {
        *l = bits.read_bits(4)? as u8;
    }
    let pretree = HuffmanTable::build(&pretree_lengths, 16)?;

    let mut lengths = vec![0u8; count];
    let mut i = 0usize;
    while i < count {
        let sym = pretree.decode(bits)?;
        match sym {
            17 => {
                let run = bits.read_bits(4)? as usize + 4;
                for j in i..(i + run).min(count) {
                    lengths[j] = 0;
                }
                i += run;
            }
            18 => {
                let run = bits.read_bits(5)? as usize + 20;
                for j in i..(i + run).min(count) {
                    lengths[j] = 0;
                }
                i += run;
            }
            19 => {
                let run = bits.read_bits(1)? as usize + 4;
                let next = pretree.decode(bits)?;
                let delta = 17u8.wrapping_sub(next as u8);
                let prev = previous.get(i).copied().unwrap_or(0);
                let value = delta.wrapping_add(prev) % 17;
                for j in i..(i + run).min(count) {
                    lengths[j] = value;
                }
                i += run;
            }
            _ => {
                let delta = 17u8.wrapping_sub(sym as u8);
                let prev = previous.get(i).copied().unwrap_or(0);
                lengths[i] = delta.wrapping_add(prev) % 17;
                i += 1;
            }
        }
    }
    Ok(lengths)
}

/// Decompresses one LZX-coded chunk into exactly `output_len` bytes.
///
/// Supports the uncompressed, verbatim and aligned-offset block kinds,
/// which cover every block a WIM resource compressor emits in practice;
/// any other block-type code is rejected with [`Error::UnsupportedFeature`]
/// rather than silently mis-decoded.
pub fn decode_lzx(input: &[u8], output_len: usize, window_size: u32) -> Result<Vec<u8>> {
    let num_slots = num_position_slots(window_size);
    let main_tree_size = LZX_NUM_CHARS + num_slots * 8;

    let mut bits = BitReader::new(input)?;
    let mut out = Vec::with_capacity(output_len);
    let mut r = [1u32, 1, 1];
    let mut main_lengths = vec![0u8; main_tree_size];
    let mut length_lengths = vec![0u8; LZX_LENGTH_TREE_ELEMENTS];

    while out.len() < output_len {
        let block_type = bits.read_bits(3)?;
        let block_size = bits.read_bits(24)? as usize;
        let target_len = (out.len() + block_size).min(output_len);

        match block_type {
            BLOCK_UNCOMPRESSED => {
                bits.align_to_word();
                r[0] = read_u32le(input, bits.byte_offset())?;
                r[1] = read_u32le(input, bits.byte_offset() + 4)?;
                r[2] = read_u32le(input, bits.byte_offset() + 8)?;
                let start = bits.byte_offset() + 12;
                let raw_end = start + block_size;
                let end = raw_end.min(input.len());
                out.extend_from_slice(&input[start..end]);
                // Uncompressed block data is padded with one byte when
                // `block_size` is odd, to keep the next block's bitstream
                // 16-bit aligned.
                let next = (raw_end + block_size % 2).min(input.len());
                bits = BitReader::new(&input[next..]).unwrap_or(bits);
            }
            BLOCK_VERBATIM | BLOCK_ALIGNED => {
                let mut aligned_tree = None;
                if block_type == BLOCK_ALIGNED {
                    let mut aligned_lengths = [0u8; LZX_ALIGNED_NUM_ELEMENTS];
                    for l in aligned_lengths.iter_mut() {
                        *l = bits.read_bits(3)? as u8;
                    }
                    aligned_tree = Some(HuffmanTable::build(&aligned_lengths, 7)?);
                }
                let main_block1 = decode_lengths(&mut bits, LZX_NUM_CHARS, &main_lengths[..LZX_NUM_CHARS])?;
                let main_block2 =
                    decode_lengths(&mut bits, main_tree_size - LZX_NUM_CHARS, &main_lengths[LZX_NUM_CHARS..])?;
                main_lengths = [main_block1, main_block2].concat();
                length_lengths = decode_lengths(&mut bits, LZX_LENGTH_TREE_ELEMENTS, &length_lengths)?;
                let main_tree = HuffmanTable::build(&main_lengths, 16)?;
                let length_tree = HuffmanTable::build(&length_lengths, 16)?;

                while out.len() < target_len {
                    let sym = main_tree.decode(&mut bits)? as usize;
                    if sym < LZX_NUM_CHARS {
                        out.push(sym as u8);
                        continue;
                    }
                    let sym = sym - LZX_NUM_CHARS;
                    let slot = sym / 8;
                    let length_header = sym % 8;
                    let mut length = length_header as u32 + LZX_MIN_MATCH;
                    if length_header == 7 {
                        length = length_tree.decode(&mut bits)? as u32 + 7 + LZX_MIN_MATCH;
                    }

                    let offset = match slot {
                        0 => r[0],
                        1 => {
                            let v = r[1];
                            r[1] = r[0];
                            v
                        }
                        2 => {
                            let v = r[2];
                            r[2] = r[0];
                            v
                        }
                        _ => {
                            let extra = POSITION_EXTRA_BITS[slot];
                            let footer = if block_type == BLOCK_ALIGNED && extra >= 3 {
                                let high = bits.read_bits(extra - 3)?;
                                let low = aligned_tree.as_ref().unwrap().decode(&mut bits)? as u32;
                                (high << 3) | low
                            } else {
                                bits.read_bits(extra)?
                            };
                            position_base_table()[slot] + footer - 2
                        }
                    };
                    if slot > 2 {
                        r[2] = r[1];
                        r[1] = r[0];
                        r[0] = offset;
                    }

                    let distance = offset as usize;
                    if distance == 0 || distance > out.len() {
                        return Err(Error::CorruptStructure(ctx!(
                            "lzx",
                            "back-reference distance {distance} invalid at output position {}",
                            out.len()
                        )));
                    }
                    for _ in 0..length {
                        let byte = out[out.len() - distance];
                        out.push(byte);
                        if out.len() >= target_len {
                            break;
                        }
                    }
                }
            }
            other => {
                return Err(Error::UnsupportedFeature(ctx!("lzx", "block type {other} not supported by this core")));
            }
        }
    }
    out.truncate(output_len);
    Ok(out)
}

fn read_u32le(data: &[u8], pos: usize) -> Result<u32> {
    if pos + 4 > data.len() {
        return Err(Error::Truncated(ctx!("lzx", "uncompressed block header short read")));
    }
    Ok(u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()))
}

/// Post-pass LZX applies to WIM resource content whose declared
/// uncompressed size is at most 12 MB: every 5-byte `E8 xx xx xx xx` run
/// (a relative `CALL` instruction) has its 32-bit little-endian operand
/// rewritten from an offset relative to the call site to an absolute file
/// offset, the transform x86 compilers rely on for cross-module calls
/// inside position-independent blobs. Decoding undoes it by reversing the
/// arithmetic at each matching offset.
pub fn e8_decode(data: &mut [u8], file_size: u32) {
    if data.len() < 10 {
        return;
    }
    let mut i = 0usize;
    while i < data.len().saturating_sub(10) {
        if data[i] == 0xE8 {
            let operand = i32::from_le_bytes([data[i + 1], data[i + 2], data[i + 3], data[i + 4]]);
            if operand >= -(i as i32) && (operand as i64) < file_size as i64 {
                let absolute = if operand >= 0 {
                    operand.wrapping_sub(i as i32)
                } else {
                    operand.wrapping_add(file_size as i32)
                };
                data[i + 1..i + 5].copy_from_slice(&absolute.to_le_bytes());
            }
            i += 5;
        } else {
            i += 1;
        }
    }
}

const MODE2_SECTOR_SIZE: u64 = 2352;
const MODE2_HEADER_LEN: u64 = 24;
const MODE2_DATA_LEN: u64 = 2048;
const MODE2_TRAILER_LEN: u64 = 4;

const _: () = assert!(MODE2_HEADER_LEN + MODE2_DATA_LEN + MODE2_TRAILER_LEN + 276 == MODE2_SECTOR_SIZE);

/// Presents a CD-ROM Mode 2 Form 1 track as a plain 2048-byte logical
/// sector stream, stripping the 24-byte sync/header and 4-byte
/// error-detection trailer from every 2352-byte physical sector.
pub struct Mode2Stream<S> {
    base: S,
    logical_len: u64,
}

impl<S: SparseStream> Mode2Stream<S> {
    pub fn new(base: S) -> Self {
        let sectors = base.len() / MODE2_SECTOR_SIZE;
        Self { base, logical_len: sectors * MODE2_DATA_LEN }
    }
}

#[maybe_async::maybe_async]
impl<S: SparseStream> SparseStream for Mode2Stream<S> {
    fn len(&self) -> u64 {
        self.logical_len
    }

    async fn extents(&self) -> Result<ExtentSet> {
        Ok(ExtentSet::single(0, self.logical_len))
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset + buf.len() as u64 > self.logical_len {
            return Err(Error::Truncated(ctx!("mode2", "read past end of logical stream").at(offset)));
        }
        let mut pos = offset;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let sector = pos / MODE2_DATA_LEN;
            let sector_offset = pos % MODE2_DATA_LEN;
            let take = (MODE2_DATA_LEN - sector_offset).min(remaining.len() as u64) as usize;
            let physical_offset = sector * MODE2_SECTOR_SIZE + MODE2_HEADER_LEN + sector_offset;
            self.base.read_at(physical_offset, &mut remaining[..take]).await?;
            pos += take as u64;
            remaining = &mut remaining[take..];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<T>(result: T) -> T {
        result
    }

    struct Mem(Vec<u8>);

    #[maybe_async::maybe_async]
    impl SparseStream for Mem {
        fn len(&self) -> u64 {
            self.0.len() as u64
        }
        async fn extents(&self) -> Result<ExtentSet> {
            Ok(ExtentSet::single(0, self.0.len() as u64))
        }
        async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            buf.copy_from_slice(&self.0[offset as usize..offset as usize + buf.len()]);
            Ok(())
        }
    }

    /// Builds an XPRESS chunk that is all literals: a huffman tree with a
    /// single depth-1 code for symbol 0 (`literal 0x41`) and a sibling
    /// depth-1 code for symbol 1 (`literal 0x42`, never emitted), all other
    /// lengths zero, followed by the bitstream `0 0 0 1` (`A A A B`).
    #[test]
    fn xpress_literal_only_chunk_decodes() {
        let mut input = vec![0u8; 256];
        input[0] = 0x11; // symbol 0 length 1 (low nibble), symbol 1 length 1 (high nibble)
        // bits: 0,0,0,1 then pad with 1s (irrelevant, decoding stops at output_len)
        let bits: u16 = 0b0001_1111_1111_1111;
        input.extend_from_slice(&bits.to_le_bytes());
        let out = run(decode_xpress(&input, 4)).unwrap();
        assert_eq!(out, vec![0x41, 0x41, 0x41, 0x42]);
    }

    #[test]
    fn lzx_uncompressed_block_round_trips() {
        // block header: 3 bits type=3 (uncompressed), 24 bits size=5,
        // packed MSB-first into the first two 16-bit words, then aligned to
        // a word boundary, then R0/R1/R2 (12 bytes), then 5 raw bytes.
        let mut bitstream_bits: Vec<u8> = Vec::new();
        let push_bits = |bits: &mut Vec<u8>, value: u32, count: u32| {
            for i in (0..count).rev() {
                bits.push(((value >> i) & 1) as u8);
            }
        };
        push_bits(&mut bitstream_bits, BLOCK_UNCOMPRESSED, 3);
        push_bits(&mut bitstream_bits, 5, 24);
        while bitstream_bits.len() % 16 != 0 {
            bitstream_bits.push(1);
        }
        let mut bytes = Vec::new();
        for chunk in bitstream_bits.chunks(16) {
            let mut word = 0u16;
            for (i, &b) in chunk.iter().enumerate() {
                word |= (b as u16) << (15 - i);
            }
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.extend_from_slice(b"HELLO");

        let out = run(decode_lzx(&bytes, 5, 32 * 1024)).unwrap();
        assert_eq!(out, b"HELLO");
    }

    #[test]
    fn e8_decode_rewrites_relative_call_operand() {
        let mut data = vec![0u8; 16];
        data[2] = 0xE8;
        // relative operand chosen so absolute = operand - site = wraps to 100
        let site = 2i32;
        let absolute_target = 100i32;
        let relative = absolute_target.wrapping_add(site);
        data[3..7].copy_from_slice(&relative.to_le_bytes());
        e8_decode(&mut data, 1_000_000);
        let decoded = i32::from_le_bytes(data[3..7].try_into().unwrap());
        assert_eq!(decoded, absolute_target);
    }

    #[test]
    fn mode2_stream_strips_header_and_trailer() {
        let mut sector = vec![0u8; MODE2_SECTOR_SIZE as usize];
        sector[MODE2_HEADER_LEN as usize..(MODE2_HEADER_LEN + MODE2_DATA_LEN) as usize].fill(0xAB);
        let base = Mem(sector);
        let stream = Mode2Stream::new(base);
        assert_eq!(stream.len(), MODE2_DATA_LEN);
        let mut buf = [0u8; 16];
        run(stream.read_at(0, &mut buf)).unwrap();
        assert_eq!(buf, [0xABu8; 16]);
    }
}
