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

//! UDF reader.
//!
//! Every descriptor opens with a 16-byte tag that is validated before its
//! body is trusted: tag-id identifies the descriptor, the tag checksum
//! covers the tag itself, and the descriptor CRC covers the body that
//! follows. Only type-1 (physical) partition maps are supported; virtual
//! and sparable maps are rejected with `UnsupportedFeature` rather than
//! silently read through an unresolved indirection table.

use std::sync::Arc;

use diskit_err::{ctx, Error, Result};
use diskit_fs::{split_path, DirEntry, FileAttributes, FileSystemReader, ReaderOptions, Timestamps, UnixInfo};
use diskit_stream::{ConcatStream, Extent, SparseStream, SubStream};

const SECTOR_SIZE: u64 = 2048;
const ANCHOR_SECTOR: u64 = 256;

const TAG_PRIMARY_VOLUME_DESCRIPTOR: u16 = 1;
const TAG_PARTITION_DESCRIPTOR: u16 = 5;
const TAG_LOGICAL_VOLUME_DESCRIPTOR: u16 = 6;
const TAG_TERMINATING_DESCRIPTOR: u16 = 8;
const TAG_FILE_SET_DESCRIPTOR: u16 = 256;
const TAG_FILE_IDENTIFIER_DESCRIPTOR: u16 = 257;
const TAG_FILE_ENTRY: u16 = 261;
const TAG_EXTENDED_FILE_ENTRY: u16 = 266;

const FILE_TYPE_DIRECTORY: u8 = 4;
const FILE_TYPE_REGULAR: u8 = 5;
const FILE_TYPE_SYMLINK: u8 = 12;

const FILE_CHAR_HIDDEN: u8 = 0x01;
const FILE_CHAR_DIRECTORY: u8 = 0x02;
const FILE_CHAR_DELETED: u8 = 0x04;
const FILE_CHAR_PARENT: u8 = 0x08;

const ICB_FLAG_AD_MASK: u16 = 0x0007;
const ICB_AD_SHORT: u16 = 0;
const ICB_AD_LONG: u16 = 1;
const ICB_AD_INLINE: u16 = 3;

struct Tag {
    id: u16,
    location_field: u32,
}

/// Validates and strips the 16-byte descriptor tag, returning the tag plus
/// the body bytes that follow it (through `descriptor_crc_length`).
fn parse_tag(buf: &[u8]) -> Result<(Tag, &[u8])> {
    if buf.len() < 16 {
        return Err(Error::Truncated(ctx!("udf", "descriptor tag short read")));
    }
    let id = u16::from_le_bytes(buf[0..2].try_into().unwrap());
    let stored_checksum = buf[4];
    let crc_length = u16::from_le_bytes(buf[10..12].try_into().unwrap()) as usize;
    let location_field = u32::from_le_bytes(buf[12..16].try_into().unwrap());

    let mut computed: u8 = 0;
    for (i, &b) in buf[0..16].iter().enumerate() {
        if i == 4 {
            continue;
        }
        computed = computed.wrapping_add(b);
    }
    if computed != stored_checksum {
        return Err(Error::ChecksumMismatch(ctx!("udf", "tag checksum mismatch for tag id {id}")));
    }

    if 16 + crc_length > buf.len() {
        return Err(Error::Truncated(ctx!("udf", "descriptor body shorter than declared CRC length")));
    }
    let stored_crc = u16::from_le_bytes(buf[8..10].try_into().unwrap());
    let body = &buf[16..16 + crc_length];
    if crc_length > 0 && crc_itu_t(body) != stored_crc {
        return Err(Error::ChecksumMismatch(ctx!("udf", "descriptor CRC mismatch for tag id {id}")));
    }

    Ok((Tag { id, location_field }, body))
}

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0x0000, no reflect), as specified
/// by ECMA-167 for descriptor CRCs.
fn crc_itu_t(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
        }
    }
    crc
}

struct Partition {
    number: u16,
    starting_block: u32,
}

struct LongAd {
    length: u32,
    block: u32,
    partition_ref: u16,
}

fn parse_long_ad(bytes: &[u8]) -> LongAd {
    LongAd {
        length: u32::from_le_bytes(bytes[0..4].try_into().unwrap()),
        block: u32::from_le_bytes(bytes[4..8].try_into().unwrap()),
        partition_ref: u16::from_le_bytes(bytes[8..10].try_into().unwrap()),
    }
}

struct FileEntry {
    file_type: u8,
    info_length: u64,
    uid: u32,
    gid: u32,
    permissions: u32,
    modified: Option<time::OffsetDateTime>,
    allocation_descriptors: Vec<u8>,
    ad_type: u16,
    inline_data: Option<Vec<u8>>,
}

pub struct Reader {
    stream: Arc<dyn SparseStream>,
    partitions: Vec<Partition>,
    root_icb: (u32, u16),
    options: ReaderOptions,
}

impl Reader {
    #[maybe_async::maybe_async]
    pub async fn detect(stream: &dyn SparseStream) -> bool {
        let mut buf = vec![0u8; 16];
        if stream.read_at(ANCHOR_SECTOR * SECTOR_SIZE, &mut buf).await.is_err() {
            return false;
        }
        parse_tag(&buf).map(|(tag, _)| tag.id == 2).unwrap_or(false)
    }

    #[maybe_async::maybe_async]
    pub async fn mount(stream: Arc<dyn SparseStream>, options: ReaderOptions) -> Result<Self> {
        let mut anchor = vec![0u8; 512];
        stream.read_at(ANCHOR_SECTOR * SECTOR_SIZE, &mut anchor).await?;
        let (tag, body) = parse_tag(&anchor)?;
        if tag.id != 2 {
            return Err(Error::BadMagic(ctx!("udf", "missing anchor volume descriptor pointer")));
        }
        if body.len() < 8 {
            return Err(Error::Truncated(ctx!("udf", "anchor volume descriptor pointer short read")));
        }
        let main_vds_length = u32::from_le_bytes(body[0..4].try_into().unwrap());
        let main_vds_location = u32::from_le_bytes(body[4..8].try_into().unwrap());

        let mut partitions = Vec::new();
        let mut lvd_partition_maps: Vec<(u8, Vec<u8>)> = Vec::new();
        let mut file_set_descriptor_extent: Option<(u32, u32)> = None;

        let mut pos = main_vds_location as u64 * SECTOR_SIZE;
        let end = pos + main_vds_length as u64;
        while pos < end {
            let mut descriptor = vec![0u8; SECTOR_SIZE as usize];
            stream.read_at(pos, &mut descriptor).await?;
            let Ok((tag, body)) = parse_tag(&descriptor) else {
                pos += SECTOR_SIZE;
                continue;
            };
            match tag.id {
                TAG_PARTITION_DESCRIPTOR => {
                    if body.len() >= 184 {
                        let partition_number = u16::from_le_bytes(body[18..20].try_into().unwrap());
                        let starting_block = u32::from_le_bytes(body[180..184].try_into().unwrap());
                        partitions.push(Partition { number: partition_number, starting_block });
                    }
                }
                TAG_LOGICAL_VOLUME_DESCRIPTOR => {
                    if body.len() >= 440 {
                        let map_table_length = u32::from_le_bytes(body[212..216].try_into().unwrap()) as usize;
                        let num_maps = u32::from_le_bytes(body[216..220].try_into().unwrap()) as usize;
                        let fsd_ad = parse_long_ad(&body[248..264]);
                        file_set_descriptor_extent = Some((fsd_ad.block, fsd_ad.partition_ref as u32));

                        let maps_start = 440;
                        let maps_bytes = &body[maps_start..(maps_start + map_table_length).min(body.len())];
                        let mut off = 0usize;
                        for _ in 0..num_maps {
                            if off + 2 > maps_bytes.len() {
                                break;
                            }
                            let map_type = maps_bytes[off];
                            let map_len = maps_bytes[off + 1] as usize;
                            if off + map_len > maps_bytes.len() {
                                break;
                            }
                            lvd_partition_maps.push((map_type, maps_bytes[off..off + map_len].to_vec()));
                            off += map_len;
                        }
                    }
                }
                TAG_TERMINATING_DESCRIPTOR => break,
                _ => {}
            }
            pos += SECTOR_SIZE;
        }

        for (map_type, map_bytes) in &lvd_partition_maps {
            if *map_type != 1 {
                return Err(Error::UnsupportedFeature(ctx!(
                    "udf",
                    "partition map type {map_type} (only physical type-1 maps are supported)"
                )));
            }
            let _ = map_bytes;
        }

        let (fsd_block, fsd_partition_ref) = file_set_descriptor_extent
            .ok_or_else(|| Error::CorruptStructure(ctx!("udf", "logical volume descriptor missing file set descriptor extent")))?;
        let partition = partitions
            .iter()
            .find(|p| p.number as u32 == fsd_partition_ref)
            .ok_or_else(|| Error::CorruptStructure(ctx!("udf", "file set descriptor references unknown partition")))?;
        let fsd_offset = (partition.starting_block as u64 + fsd_block as u64) * SECTOR_SIZE;

        let mut fsd_buf = vec![0u8; SECTOR_SIZE as usize];
        stream.read_at(fsd_offset, &mut fsd_buf).await?;
        let (tag, body) = parse_tag(&fsd_buf)?;
        if tag.id != TAG_FILE_SET_DESCRIPTOR {
            return Err(Error::BadMagic(ctx!("udf", "missing file set descriptor")));
        }
        if body.len() < 400 {
            return Err(Error::Truncated(ctx!("udf", "file set descriptor short read")));
        }
        let root_ad = parse_long_ad(&body[384..400]);

        log::debug!("mounted udf volume, {} partitions", partitions.len());
        Ok(Self {
            stream,
            partitions,
            root_icb: (root_ad.block, root_ad.partition_ref),
            options,
        })
    }

    fn partition_offset(&self, partition_ref: u16) -> Result<u64> {
        self.partitions
            .iter()
            .find(|p| p.number == partition_ref)
            .map(|p| p.starting_block as u64 * SECTOR_SIZE)
            .ok_or_else(|| Error::CorruptStructure(ctx!("udf", "allocation descriptor references unknown partition {partition_ref}")))
    }

    #[maybe_async::maybe_async]
    async fn read_file_entry(&self, block: u32, partition_ref: u16) -> Result<FileEntry> {
        let base = self.partition_offset(partition_ref)?;
        let offset = base + block as u64 * SECTOR_SIZE;
        let mut buf = vec![0u8; SECTOR_SIZE as usize];
        self.stream.read_at(offset, &mut buf).await?;
        let (tag, body) = parse_tag(&buf)?;
        if tag.id != TAG_FILE_ENTRY && tag.id != TAG_EXTENDED_FILE_ENTRY {
            return Err(Error::BadMagic(ctx!("udf", "missing file entry at block {block}")));
        }
        let extended = tag.id == TAG_EXTENDED_FILE_ENTRY;
        if body.len() < 20 {
            return Err(Error::Truncated(ctx!("udf", "file entry short read")));
        }
        let icb_flags = u16::from_le_bytes(body[18..20].try_into().unwrap());
        let file_type = body[11];
        let uid = u32::from_le_bytes(body[20..24].try_into().unwrap());
        let gid = u32::from_le_bytes(body[24..28].try_into().unwrap());
        let permissions = u32::from_le_bytes(body[28..32].try_into().unwrap());
        let info_length = u64::from_le_bytes(body[40..48].try_into().unwrap());

        // FileEntry and ExtendedFileEntry share a common prefix through
        // Information Length (offset 40..48) but diverge after that:
        // ExtendedFileEntry inserts Object Size (8 bytes) right after it and
        // adds a Creation Date/Time (12 bytes) and Stream Directory ICB (16
        // bytes) further down, for a net +40 byte shift to the trailing
        // length fields.
        let (modification_time_offset, length_ea_offset, length_ad_offset) = if extended { (76, 192, 196) } else { (68, 152, 156) };
        if body.len() < length_ad_offset + 4 {
            return Err(Error::Truncated(ctx!("udf", "file entry tail short read")));
        }
        let modified = body.get(modification_time_offset..modification_time_offset + 12).and_then(udf_time);
        let length_extended_attributes = u32::from_le_bytes(body[length_ea_offset..length_ea_offset + 4].try_into().unwrap()) as usize;
        let length_allocation_descriptors = u32::from_le_bytes(body[length_ad_offset..length_ad_offset + 4].try_into().unwrap()) as usize;
        let ad_start = length_ad_offset + 4 + length_extended_attributes;
        if ad_start + length_allocation_descriptors > body.len() {
            return Err(Error::Truncated(ctx!("udf", "allocation descriptors exceed file entry body")));
        }
        let allocation_descriptors = body[ad_start..ad_start + length_allocation_descriptors].to_vec();

        let ad_type = icb_flags & ICB_FLAG_AD_MASK;
        let inline_data = if ad_type == ICB_AD_INLINE { Some(allocation_descriptors.clone()) } else { None };

        Ok(FileEntry { file_type, info_length, uid, gid, permissions, modified, allocation_descriptors, ad_type, inline_data })
    }

    /// Resolves a file entry's allocation descriptors to absolute volume
    /// byte extents (short_ad / long_ad only; inline data has no extents).
    fn entry_extents(&self, entry: &FileEntry) -> Result<Vec<Extent>> {
        let mut extents = Vec::new();
        match entry.ad_type {
            ICB_AD_SHORT => {
                for chunk in entry.allocation_descriptors.chunks_exact(8) {
                    let raw_length = u32::from_le_bytes(chunk[0..4].try_into().unwrap());
                    let length = raw_length & 0x3FFF_FFFF;
                    if length == 0 {
                        continue;
                    }
                    let position = u32::from_le_bytes(chunk[4..8].try_into().unwrap());
                    // short_ad always addresses the ICB's own partition.
                    let base = self.partition_offset(self.root_icb.1)?;
                    extents.push(Extent::new(base + position as u64 * SECTOR_SIZE, length as u64));
                }
            }
            ICB_AD_LONG => {
                for chunk in entry.allocation_descriptors.chunks_exact(16) {
                    let ad = parse_long_ad(chunk);
                    let length = ad.length & 0x3FFF_FFFF;
                    if length == 0 {
                        continue;
                    }
                    let base = self.partition_offset(ad.partition_ref)?;
                    extents.push(Extent::new(base + ad.block as u64 * SECTOR_SIZE, length as u64));
                }
            }
            ICB_AD_INLINE => {}
            other => return Err(Error::UnsupportedFeature(ctx!("udf", "allocation descriptor type {other} (ext_ad) is not supported"))),
        }
        Ok(extents)
    }

    #[maybe_async::maybe_async]
    async fn entry_stream(&self, entry: &FileEntry) -> Result<Arc<dyn SparseStream>> {
        if let Some(inline) = &entry.inline_data {
            return Ok(Arc::new(InlineStream(inline.clone())));
        }
        let extents = self.entry_extents(entry)?;
        let children: Vec<Arc<dyn SparseStream>> = extents
            .into_iter()
            .map(|e| -> Result<Arc<dyn SparseStream>> { Ok(Arc::new(SubStream::new(self.stream.clone(), e.offset, e.length)?)) })
            .collect::<Result<_>>()?;
        let concat = ConcatStream::new(children);
        let total = concat.len();
        Ok(Arc::new(SubStream::new(Arc::new(concat) as Arc<dyn SparseStream>, 0, entry.info_length.min(total))?))
    }

    #[maybe_async::maybe_async]
    async fn list_directory(&self, block: u32, partition_ref: u16) -> Result<Vec<(String, u32, u16, u8)>> {
        let entry = self.read_file_entry(block, partition_ref).await?;
        let stream = self.entry_stream(&entry).await?;
        let mut buf = vec![0u8; entry.info_length as usize];
        stream.read_at(0, &mut buf).await?;

        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos + 16 <= buf.len() {
            let Ok((tag, body)) = parse_tag(&buf[pos..]) else { break };
            if tag.id != TAG_FILE_IDENTIFIER_DESCRIPTOR {
                break;
            }
            if body.len() < 20 {
                break;
            }
            let file_characteristics = body[2];
            let id_length = body[3] as usize;
            let icb = parse_long_ad(&body[4..20]);
            let implementation_use_length = u16::from_le_bytes(body[20..22].try_into().unwrap()) as usize;
            let name_start = 22 + implementation_use_length;
            let name_bytes = body.get(name_start..name_start + id_length).ok_or_else(|| {
                Error::Truncated(ctx!("udf", "file identifier name exceeds descriptor body"))
            })?;
            let name = decode_dstring(name_bytes);

            let record_len = 16 + 20 + implementation_use_length + id_length;
            let padded_len = record_len.div_ceil(4) * 4;

            if file_characteristics & FILE_CHAR_PARENT == 0 && file_characteristics & FILE_CHAR_DELETED == 0 {
                out.push((name, icb.block, icb.partition_ref, file_characteristics));
            }
            pos += padded_len;
        }
        Ok(out)
    }

    #[maybe_async::maybe_async]
    async fn lookup(&self, path: &str) -> Result<(u32, u16, FileEntry)> {
        let components = split_path(path);
        let mut block = self.root_icb.0;
        let mut partition_ref = self.root_icb.1;
        let mut entry = self.read_file_entry(block, partition_ref).await?;
        for (i, component) in components.iter().enumerate() {
            let children = self.list_directory(block, partition_ref).await?;
            let (_, child_block, child_partition_ref, characteristics) = children
                .into_iter()
                .find(|(name, ..)| diskit_fs::names_equal(name, component, false))
                .ok_or_else(|| Error::NotFound(ctx!("udf", "path component {component:?} not found")))?;
            let is_last = i == components.len() - 1;
            if !is_last && characteristics & FILE_CHAR_DIRECTORY == 0 {
                return Err(Error::NotFound(ctx!("udf", "{component:?} is not a directory")));
            }
            block = child_block;
            partition_ref = child_partition_ref;
            entry = self.read_file_entry(block, partition_ref).await?;
        }
        Ok((block, partition_ref, entry))
    }
}

/// Decodes an OSTA CS0 "D-string": a leading compression-code byte (`0x08`
/// = 8-bit Latin-1-ish, `0x10` = 16-bit big-endian) followed by code units.
fn decode_dstring(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }
    match bytes[0] {
        0x10 => {
            let units: Vec<u16> = bytes[1..].chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
            char::decode_utf16(units).map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER)).collect()
        }
        _ => bytes[1..].iter().map(|&b| b as char).collect(),
    }
}

fn udf_time(bytes: &[u8]) -> Option<time::OffsetDateTime> {
    if bytes.len() < 12 {
        return None;
    }
    let year = i16::from_le_bytes(bytes[2..4].try_into().ok()?);
    let month = bytes[4];
    let day = bytes[5];
    let hour = bytes[6];
    let minute = bytes[7];
    let second = bytes[8];
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let date = time::Date::from_calendar_date(year as i32, time::Month::try_from(month).ok()?, day).ok()?;
    let time_of_day = time::Time::from_hms(hour, minute, second).ok()?;
    Some(time::PrimitiveDateTime::new(date, time_of_day).assume_utc())
}

fn attributes_for(file_type: u8) -> FileAttributes {
    let mut bits = 0u32;
    if file_type == FILE_TYPE_DIRECTORY {
        bits |= FileAttributes::DIRECTORY;
    }
    if file_type == FILE_TYPE_SYMLINK {
        bits |= FileAttributes::SYMLINK;
    }
    FileAttributes(bits)
}

struct InlineStream(Vec<u8>);

#[maybe_async::maybe_async]
impl SparseStream for InlineStream {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }

    async fn extents(&self) -> Result<diskit_stream::ExtentSet> {
        Ok(diskit_stream::ExtentSet::single(0, self.0.len() as u64))
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.0.len() {
            return Err(Error::Truncated(ctx!("udf", "inline stream read past end")));
        }
        buf.copy_from_slice(&self.0[start..end]);
        Ok(())
    }
}

#[maybe_async::maybe_async]
impl FileSystemReader for Reader {
    fn case_sensitive(&self) -> bool {
        false
    }

    async fn stat(&self, path: &str) -> Result<DirEntry> {
        let (_, _, entry) = self.lookup(path).await?;
        Ok(DirEntry {
            name: split_path(path).pop().unwrap_or_default(),
            attributes: attributes_for(entry.file_type),
            times: Timestamps { modified: entry.modified, ..Timestamps::default() },
            size: entry.info_length,
            is_directory: entry.file_type == FILE_TYPE_DIRECTORY,
            is_symlink: entry.file_type == FILE_TYPE_SYMLINK,
            stream_count: 1,
        })
    }

    async fn enumerate(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (block, partition_ref, entry) = self.lookup(path).await?;
        if entry.file_type != FILE_TYPE_DIRECTORY {
            return Err(Error::NotFound(ctx!("udf", "{path} is not a directory")));
        }
        let children = self.list_directory(block, partition_ref).await?;
        let mut out = Vec::with_capacity(children.len());
        for (name, child_block, child_partition_ref, characteristics) in children {
            let child_entry = self.read_file_entry(child_block, child_partition_ref).await?;
            out.push(DirEntry {
                name,
                attributes: attributes_for(child_entry.file_type),
                times: Timestamps { modified: child_entry.modified, ..Timestamps::default() },
                size: child_entry.info_length,
                is_directory: characteristics & FILE_CHAR_DIRECTORY != 0,
                is_symlink: child_entry.file_type == FILE_TYPE_SYMLINK,
                stream_count: 1,
            });
        }
        Ok(out)
    }

    async fn open_file(&self, path: &str) -> Result<Arc<dyn SparseStream>> {
        let (_, _, entry) = self.lookup(path).await?;
        if entry.file_type == FILE_TYPE_DIRECTORY {
            return Err(Error::NotFound(ctx!("udf", "{path} is a directory")));
        }
        self.entry_stream(&entry).await
    }

    async fn path_to_extents(&self, path: &str) -> Result<Vec<Extent>> {
        let (_, _, entry) = self.lookup(path).await?;
        self.entry_extents(&entry)
    }

    async fn unix_info(&self, path: &str) -> Result<Option<UnixInfo>> {
        let (_, _, entry) = self.lookup(path).await?;
        Ok(Some(UnixInfo { uid: entry.uid, gid: entry.gid, mode: entry.permissions & 0x0FFF }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_checksum_matches_known_vector() {
        // A minimal all-zero tag except id=1 and a checksum computed to match.
        let mut buf = vec![0u8; 16];
        buf[0] = 1;
        let mut sum: u8 = 0;
        for (i, &b) in buf.iter().enumerate() {
            if i != 4 {
                sum = sum.wrapping_add(b);
            }
        }
        buf[4] = sum;
        let (tag, _) = parse_tag(&buf).unwrap();
        assert_eq!(tag.id, 1);
    }

    #[test]
    fn corrupted_tag_checksum_is_rejected() {
        let mut buf = vec![0u8; 16];
        buf[0] = 1;
        buf[4] = 0xFF; // deliberately wrong
        assert!(parse_tag(&buf).is_err());
    }

    #[test]
    fn dstring_decodes_utf16be_with_compression_code_0x10() {
        let mut bytes = vec![0x10];
        for c in "ab".encode_utf16() {
            bytes.extend_from_slice(&c.to_be_bytes());
        }
        assert_eq!(decode_dstring(&bytes), "ab");
    }

    #[test]
    fn udf_time_rejects_invalid_month() {
        let mut bytes = vec![0u8; 12];
        bytes[4] = 13; // invalid month
        assert!(udf_time(&bytes).is_none());
    }
}
