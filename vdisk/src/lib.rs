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

//! Virtual-disk container readers.
//!
//! Presents fixed, dynamic (block-allocation-table) and differencing
//! (parent-chain) sparse containers as one logical, sector-addressable
//! [`SparseStream`]. A fourth, BAT-indexed container with an internal
//! metadata region (the newer log-structured format referenced in the spec)
//! is handled by [`logstructured`].

pub mod logstructured;

use std::sync::Arc;

use diskit_bytes::decode_utf16be;
use diskit_err::{ctx, Error, Result};
use diskit_stream::{Extent, ExtentSet, SparseStream};
use log::{error, warn};
use zerocopy::{
    big_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

const SECTOR_SIZE: u64 = 512;
const FOOTER_COOKIE: &[u8; 8] = b"conectix";
const HEADER_COOKIE: &[u8; 8] = b"cxsparse";
const UNALLOCATED: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    Fixed,
    Dynamic,
    Differencing,
}

#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    pub cylinders: u16,
    pub heads: u8,
    pub sectors_per_track: u8,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawFooter {
    cookie: [u8; 8],
    features: U32,
    file_format_version: U32,
    data_offset: U64,
    timestamp: U32,
    creator_application: [u8; 4],
    creator_version: U32,
    creator_host_os: [u8; 4],
    original_size: U64,
    current_size: U64,
    geometry_cylinders: U16,
    geometry_heads: u8,
    geometry_sectors: u8,
    disk_type: U32,
    checksum: U32,
    unique_id: [u8; 16],
    saved_state: u8,
    reserved: [u8; 427],
}

const _: () = assert!(std::mem::size_of::<RawFooter>() == 512);

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawParentLocatorEntry {
    platform_code: [u8; 4],
    platform_data_space: U32,
    platform_data_length: U32,
    reserved: U32,
    platform_data_offset: U64,
}

#[repr(C)]
#[derive(Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawHeader {
    cookie: [u8; 8],
    data_offset: U64,
    table_offset: U64,
    header_version: U32,
    max_table_entries: U32,
    block_size: U32,
    checksum: U32,
    parent_unique_id: [u8; 16],
    parent_timestamp: U32,
    reserved1: U32,
    parent_unicode_name: [u8; 512],
    parent_locator_entries: [RawParentLocatorEntry; 8],
    reserved2: [u8; 256],
}

const _: () = assert!(std::mem::size_of::<RawHeader>() == 1024);

/// One of a differencing disk's up-to-8 parent-locator hints, in on-disk
/// priority order.
#[derive(Debug, Clone)]
pub struct ParentLocator {
    pub platform_code: [u8; 4],
    pub path: String,
}

impl ParentLocator {
    /// `Wi2r`/`W2ru` are relative-path hints, `Wi2k`/`W2ku` absolute.
    pub fn is_absolute(&self) -> bool {
        matches!(&self.platform_code, b"Wi2k" | b"W2ku")
    }
}

fn checksum_over(bytes: &[u8], checksum_field: std::ops::Range<usize>) -> u32 {
    let mut sum: u32 = 0;
    for (i, &b) in bytes.iter().enumerate() {
        if checksum_field.contains(&i) {
            continue;
        }
        sum = sum.wrapping_add(b as u32);
    }
    !sum
}

struct DynamicBody {
    header: RawHeader,
    bat: Vec<u32>,
    block_size: u64,
    sectors_per_block: u64,
    bitmap_bytes: u64,
}

impl DynamicBody {
    fn block_for_sector(&self, sector: u64) -> Result<(u64, bool)> {
        let block = sector / self.sectors_per_block;
        let entry = *self
            .bat
            .get(block as usize)
            .ok_or_else(|| Error::CorruptStructure(ctx!("vhd", "sector {sector} beyond BAT")))?;
        if entry == UNALLOCATED {
            return Ok((0, false));
        }
        Ok((entry as u64, true))
    }

    fn sector_data_offset(&self, bat_entry: u64, sector: u64) -> u64 {
        let sector_in_block = sector % self.sectors_per_block;
        bat_entry * SECTOR_SIZE + self.bitmap_bytes + sector_in_block * SECTOR_SIZE
    }

    fn sector_defined(&self, raw: &dyn SparseStream, bat_entry: u64, sector: u64) -> Result<bool> {
        let sector_in_block = sector % self.sectors_per_block;
        let byte_index = sector_in_block / 8;
        let bit = 7 - (sector_in_block % 8);
        let mut byte = [0u8; 1];
        raw_read(raw, bat_entry * SECTOR_SIZE + byte_index, &mut byte)?;
        Ok(byte[0] & (1 << bit) != 0)
    }
}

/// Reads through a `dyn SparseStream` from plain (non-async) code.
///
/// Under the default `is_sync` feature `read_at` is already a synchronous
/// method, so this is a direct call; it only exists so the block-walking
/// logic below doesn't itself need to be `async fn`.
fn raw_read(raw: &dyn SparseStream, offset: u64, buf: &mut [u8]) -> Result<()> {
    raw.read_at(offset, buf)
}

enum Body {
    Fixed,
    Dynamic(DynamicBody),
    Differencing(DynamicBody, Arc<VirtualDisk>),
}

/// An opened VHD-family container: fixed, dynamic, or differencing (chained
/// to its already-opened parent).
pub struct VirtualDisk {
    raw: Arc<dyn SparseStream>,
    current_size: u64,
    unique_id: [u8; 16],
    geometry: Geometry,
    disk_type: DiskType,
    body: Body,
}

impl VirtualDisk {
    /// Opens a fixed or dynamic disk (no parent chain to resolve).
    pub fn open(raw: Arc<dyn SparseStream>) -> Result<Self> {
        let footer = read_footer(raw.as_ref())?;
        match footer.disk_type.get() {
            2 => Self::open_fixed(raw, footer),
            3 => Self::open_dynamic(raw, footer),
            4 => Err(Error::UnsupportedFeature(ctx!(
                "vhd",
                "differencing disk requires open_with_parent"
            ))),
            other => Err(Error::UnsupportedFeature(ctx!(
                "vhd",
                "unknown disk type {other}"
            ))),
        }
    }

    /// Opens a differencing disk, validating `parent`'s unique id against
    /// the locator recorded in this disk's header.
    pub fn open_with_parent(raw: Arc<dyn SparseStream>, parent: Arc<VirtualDisk>) -> Result<Self> {
        let footer = read_footer(raw.as_ref())?;
        if footer.disk_type.get() != 4 {
            return Err(Error::UnsupportedFeature(ctx!(
                "vhd",
                "open_with_parent called on non-differencing disk_type {}",
                footer.disk_type.get()
            )));
        }
        let (header, bat) = read_header_and_bat(raw.as_ref(), &footer)?;
        if header.parent_unique_id != parent.unique_id {
            error!("differencing disk parent unique id mismatch");
            return Err(Error::ParentMismatch(ctx!(
                "vhd",
                "parent unique id does not match locator"
            )));
        }
        let body = build_dynamic_body(header, bat, &footer)?;
        Ok(Self {
            current_size: footer.current_size.get(),
            unique_id: footer.unique_id,
            geometry: geometry_of(&footer),
            disk_type: DiskType::Differencing,
            body: Body::Differencing(body, parent),
            raw,
        })
    }

    fn open_fixed(raw: Arc<dyn SparseStream>, footer: RawFooter) -> Result<Self> {
        Ok(Self {
            current_size: footer.current_size.get(),
            unique_id: footer.unique_id,
            geometry: geometry_of(&footer),
            disk_type: DiskType::Fixed,
            body: Body::Fixed,
            raw,
        })
    }

    fn open_dynamic(raw: Arc<dyn SparseStream>, footer: RawFooter) -> Result<Self> {
        let (header, bat) = read_header_and_bat(raw.as_ref(), &footer)?;
        let body = build_dynamic_body(header, bat, &footer)?;
        Ok(Self {
            current_size: footer.current_size.get(),
            unique_id: footer.unique_id,
            geometry: geometry_of(&footer),
            disk_type: DiskType::Dynamic,
            body: Body::Dynamic(body),
            raw,
        })
    }

    pub fn disk_type(&self) -> DiskType {
        self.disk_type
    }

    pub fn unique_id(&self) -> uuid::Uuid {
        uuid::Uuid::from_bytes(self.unique_id)
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Parent locator hints, in the priority order callers should try:
    /// absolute path, relative path, then fall back to matching
    /// `parent_unique_id` against candidate files' own unique ids.
    pub fn parent_locators(&self) -> Vec<ParentLocator> {
        let header = match &self.body {
            Body::Differencing(body, _) => &body.header,
            _ => return Vec::new(),
        };
        let mut absolute = Vec::new();
        let mut relative = Vec::new();
        for entry in &header.parent_locator_entries {
            if entry.platform_data_space.get() == 0 {
                continue;
            }
            let len = entry.platform_data_length.get() as usize;
            let mut data = vec![0u8; len];
            if raw_read(self.raw.as_ref(), entry.platform_data_offset.get(), &mut data).is_err() {
                continue;
            }
            let path = data
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]));
            let path: String = char::decode_utf16(path)
                .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect();
            let locator = ParentLocator {
                platform_code: entry.platform_code,
                path,
            };
            if locator.is_absolute() {
                absolute.push(locator);
            } else {
                relative.push(locator);
            }
        }
        absolute.extend(relative);
        absolute
    }

    /// The parent-recorded fallback name, decoded from the header's
    /// `parent_unicode_name` field (used when no locator entry resolves).
    pub fn parent_unicode_name(&self) -> Option<String> {
        match &self.body {
            Body::Differencing(body, _) => {
                Some(decode_utf16be(&body.header.parent_unicode_name))
            }
            _ => None,
        }
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE as usize]) -> Result<()> {
        match &self.body {
            Body::Fixed => raw_read(self.raw.as_ref(), sector * SECTOR_SIZE, buf),
            Body::Dynamic(body) => {
                let (bat_entry, allocated) = body.block_for_sector(sector)?;
                if !allocated {
                    buf.fill(0);
                    return Ok(());
                }
                if !body.sector_defined(self.raw.as_ref(), bat_entry, sector)? {
                    buf.fill(0);
                    return Ok(());
                }
                raw_read(
                    self.raw.as_ref(),
                    body.sector_data_offset(bat_entry, sector),
                    buf,
                )
            }
            Body::Differencing(body, parent) => {
                let (bat_entry, allocated) = body.block_for_sector(sector)?;
                if allocated && body.sector_defined(self.raw.as_ref(), bat_entry, sector)? {
                    return raw_read(
                        self.raw.as_ref(),
                        body.sector_data_offset(bat_entry, sector),
                        buf,
                    );
                }
                parent.read_sector(sector, buf)
            }
        }
    }
}

fn geometry_of(footer: &RawFooter) -> Geometry {
    Geometry {
        cylinders: footer.geometry_cylinders.get(),
        heads: footer.geometry_heads,
        sectors_per_track: footer.geometry_sectors,
    }
}

fn read_footer(raw: &dyn SparseStream) -> Result<RawFooter> {
    let len = raw.len();
    if len < SECTOR_SIZE {
        return Err(Error::Truncated(ctx!("vhd", "stream shorter than one footer")));
    }
    let mut bytes = [0u8; 512];
    raw_read(raw, len - SECTOR_SIZE, &mut bytes)?;
    if let Some(footer) = try_parse_footer(&bytes) {
        return Ok(footer);
    }
    warn!("vhd: tail footer invalid, falling back to mirror footer at offset 0");
    raw_read(raw, 0, &mut bytes)?;
    try_parse_footer(&bytes)
        .ok_or_else(|| Error::BadMagic(ctx!("vhd", "neither tail nor head footer is valid")))
}

fn try_parse_footer(bytes: &[u8; 512]) -> Option<RawFooter> {
    let footer = RawFooter::read_from_bytes(bytes.as_slice()).ok()?;
    if &footer.cookie != FOOTER_COOKIE {
        return None;
    }
    let expected = checksum_over(bytes.as_slice(), 64..68);
    if expected != footer.checksum.get() {
        return None;
    }
    Some(footer)
}

fn read_header_and_bat(raw: &dyn SparseStream, footer: &RawFooter) -> Result<(RawHeader, Vec<u32>)> {
    let header_offset = footer.data_offset.get();
    let mut bytes = [0u8; 1024];
    raw_read(raw, header_offset, &mut bytes)?;
    let header = RawHeader::read_from_bytes(bytes.as_slice())
        .map_err(|_| Error::Truncated(ctx!("vhd", "header buffer wrong size")))?;
    if &header.cookie != HEADER_COOKIE {
        return Err(Error::BadMagic(ctx!("vhd", "dynamic disk header cookie mismatch")));
    }
    let expected = checksum_over(bytes.as_slice(), 36..40);
    if expected != header.checksum.get() {
        return Err(Error::ChecksumMismatch(ctx!("vhd", "dynamic disk header checksum")));
    }

    let max_entries = header.max_table_entries.get() as usize;
    let mut bat = vec![0u32; max_entries];
    let mut raw_bat = vec![0u8; max_entries * 4];
    raw_read(raw, header.table_offset.get(), &mut raw_bat)?;
    for (i, chunk) in raw_bat.chunks_exact(4).enumerate() {
        bat[i] = u32::from_be_bytes(chunk.try_into().unwrap());
    }
    Ok((header, bat))
}

fn build_dynamic_body(header: RawHeader, bat: Vec<u32>, _footer: &RawFooter) -> Result<DynamicBody> {
    let block_size = header.block_size.get() as u64;
    if block_size == 0 || block_size % SECTOR_SIZE != 0 {
        return Err(Error::CorruptStructure(ctx!("vhd", "block size {block_size} not sector-aligned")));
    }
    let sectors_per_block = block_size / SECTOR_SIZE;
    let bitmap_bytes = (sectors_per_block.div_ceil(8)).next_multiple_of(SECTOR_SIZE);
    Ok(DynamicBody {
        header,
        bat,
        block_size,
        sectors_per_block,
        bitmap_bytes,
    })
}

#[maybe_async::maybe_async]
impl SparseStream for VirtualDisk {
    fn len(&self) -> u64 {
        self.current_size
    }

    async fn extents(&self) -> Result<ExtentSet> {
        match &self.disk_type {
            DiskType::Fixed => Ok(ExtentSet::single(0, self.current_size)),
            _ => {
                // Block-granularity approximation: a block counts as defined
                // if any of its sectors do. Good enough for callers deciding
                // what ranges are worth reading; `read_at` is bit-exact.
                let mut extents = Vec::new();
                let body = match &self.body {
                    Body::Dynamic(b) => b,
                    Body::Differencing(b, _) => b,
                    Body::Fixed => unreachable!(),
                };
                for (i, &entry) in body.bat.iter().enumerate() {
                    if entry != UNALLOCATED {
                        let start = i as u64 * body.block_size;
                        let length = body.block_size.min(self.current_size.saturating_sub(start));
                        if length > 0 {
                            extents.push(Extent::new(start, length));
                        }
                    }
                }
                let mut set = ExtentSet::from_extents(extents);
                if let Body::Differencing(_, parent) = &self.body {
                    set = set.union(&parent.extents().await?);
                }
                Ok(set)
            }
        }
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset.checked_add(buf.len() as u64).map_or(true, |e| e > self.current_size) {
            return Err(Error::Truncated(ctx!("vhd", "read past current_size").at(offset)));
        }
        let mut pos = offset;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let sector = pos / SECTOR_SIZE;
            let sector_offset = (pos % SECTOR_SIZE) as usize;
            let mut sector_buf = [0u8; SECTOR_SIZE as usize];
            self.read_sector(sector, &mut sector_buf)?;
            let take = (SECTOR_SIZE as usize - sector_offset).min(remaining.len());
            remaining[..take].copy_from_slice(&sector_buf[sector_offset..sector_offset + take]);
            pos += take as u64;
            remaining = &mut remaining[take..];
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diskit_stream::SparseStream;

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

    fn fixed_footer(current_size: u64) -> Vec<u8> {
        let mut footer = RawFooter {
            cookie: *FOOTER_COOKIE,
            features: U32::new(2),
            file_format_version: U32::new(0x0001_0000),
            data_offset: U64::new(u64::MAX),
            timestamp: U32::new(0),
            creator_application: *b"tst0",
            creator_version: U32::new(0),
            creator_host_os: *b"Wi2k",
            original_size: U64::new(current_size),
            current_size: U64::new(current_size),
            geometry_cylinders: U16::new(0),
            geometry_heads: 0,
            geometry_sectors: 0,
            disk_type: U32::new(2),
            checksum: U32::new(0),
            unique_id: [0u8; 16],
            saved_state: 0,
            reserved: [0u8; 427],
        };
        let bytes = footer.as_bytes().to_vec();
        let checksum = checksum_over(&bytes, 64..68);
        footer.checksum = U32::new(checksum);
        footer.as_bytes().to_vec()
    }

    #[test]
    fn fixed_disk_reads_payload_directly() {
        let mut data = vec![0xABu8; 1024];
        data.extend(fixed_footer(1024));
        let raw: Arc<dyn SparseStream> = Arc::new(Mem(data));
        let disk = VirtualDisk::open(raw).unwrap();
        assert_eq!(disk.disk_type(), DiskType::Fixed);
        assert_eq!(disk.len(), 1024);
        let mut buf = [0u8; 16];
        disk.read_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0xABu8; 16]);
    }

    #[test]
    fn invalid_footer_checksum_rejected() {
        let mut bytes = fixed_footer(512);
        bytes[20] ^= 0xFF; // corrupt a byte inside the checksummed region
        let raw: Arc<dyn SparseStream> = Arc::new(Mem(bytes));
        assert!(VirtualDisk::open(raw).is_err());
    }
}
