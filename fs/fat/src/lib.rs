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

//! FAT12/16/32 reader with long-file-name (VFAT) support.
//!
//! Variant dispatch, cluster-chain walking and long-name assembly follow
//! §4.5.6 of the core specification; the on-disk layout matches the
//! Microsoft FAT specification's BPB/directory-entry byte offsets.

use std::sync::Arc;

use diskit_bytes::decode_fixed_ascii;
use diskit_err::{ctx, Error, Result};
use diskit_fs::{split_path, DirEntry, FileAttributes, FileSystemReader, ReaderOptions, Timestamps};
use diskit_stream::{ConcatStream, Extent, SparseStream, SubStream};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

const DIR_ENTRY_SIZE: u64 = 32;
const LFN_ATTR: u8 = 0x0F;
const ENTRY_END: u8 = 0x00;
const ENTRY_DELETED: u8 = 0xE5;

const INVALID_SHORT_NAME_BYTES: &[u8] = &[
    0x22, 0x2A, 0x2B, 0x2C, 0x2E, 0x2F, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F, 0x5B, 0x5C, 0x5D, 0x7C,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatVariant {
    Fat12,
    Fat16,
    Fat32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawBpbCommon {
    jmp_boot: [u8; 3],
    oem_name: [u8; 8],
    bytes_per_sector: U16,
    sectors_per_cluster: u8,
    reserved_sector_count: U16,
    num_fats: u8,
    root_entry_count: U16,
    total_sectors16: U16,
    media: u8,
    fat_size16: U16,
    sectors_per_track: U16,
    num_heads: U16,
    hidden_sectors: U32,
    total_sectors32: U32,
}

const _: () = assert!(std::mem::size_of::<RawBpbCommon>() == 36);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawBpb32Ext {
    fat_size32: U32,
    ext_flags: U16,
    fs_version: U16,
    root_cluster: U32,
    fs_info: U16,
    backup_boot_sector: U16,
    reserved: [u8; 12],
    drive_number: u8,
    reserved1: u8,
    boot_signature: u8,
    volume_id: U32,
    volume_label: [u8; 11],
    fs_type: [u8; 8],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawDirEntry {
    name: [u8; 11],
    attr: u8,
    nt_reserved: u8,
    create_time_tenth: u8,
    create_time: U16,
    create_date: U16,
    last_access_date: U16,
    first_cluster_hi: U16,
    write_time: U16,
    write_date: U16,
    first_cluster_lo: U16,
    file_size: U32,
}

const _: () = assert!(std::mem::size_of::<RawDirEntry>() == 32);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawLfnEntry {
    order: u8,
    name1: [u8; 10],
    attr: u8,
    entry_type: u8,
    checksum: u8,
    name2: [u8; 12],
    first_cluster_lo: U16,
    name3: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<RawLfnEntry>() == 32);

struct Layout {
    variant: FatVariant,
    bytes_per_sector: u64,
    sectors_per_cluster: u64,
    reserved_sectors: u64,
    num_fats: u64,
    fat_size_sectors: u64,
    root_entry_count: u64,
    first_data_sector: u64,
    total_clusters: u64,
    root_cluster: u32, // FAT32 only
}

impl Layout {
    fn bytes_per_cluster(&self) -> u64 {
        self.bytes_per_sector * self.sectors_per_cluster
    }

    fn cluster_to_byte_offset(&self, cluster: u32) -> u64 {
        let sector = self.first_data_sector + (cluster as u64 - 2) * self.sectors_per_cluster;
        sector * self.bytes_per_sector
    }

    fn fat_entry_offset(&self, cluster: u32) -> u64 {
        let fat_start = self.reserved_sectors * self.bytes_per_sector;
        match self.variant {
            FatVariant::Fat12 => fat_start + (cluster as u64 * 3) / 2,
            FatVariant::Fat16 => fat_start + cluster as u64 * 2,
            FatVariant::Fat32 => fat_start + cluster as u64 * 4,
        }
    }

    fn end_of_chain(&self, entry: u32) -> bool {
        match self.variant {
            FatVariant::Fat12 => entry >= 0xFF8,
            FatVariant::Fat16 => entry >= 0xFFF8,
            FatVariant::Fat32 => (entry & 0x0FFF_FFFF) >= 0x0FFF_FFF8,
        }
    }

    fn is_bad_cluster(&self, entry: u32) -> bool {
        match self.variant {
            FatVariant::Fat12 => entry == 0xFF7,
            FatVariant::Fat16 => entry == 0xFFF7,
            FatVariant::Fat32 => (entry & 0x0FFF_FFFF) == 0x0FFF_FFF7,
        }
    }
}

pub struct Reader {
    stream: Arc<dyn SparseStream>,
    layout: Layout,
    options: ReaderOptions,
}

impl Reader {
    /// Cheap signature check: a valid FAT boot sector ends in `0x55AA` and
    /// declares a non-zero power-of-two sector size.
    #[maybe_async::maybe_async]
    pub async fn detect(stream: &dyn SparseStream) -> bool {
        let mut sector = [0u8; 512];
        if stream.read_at(0, &mut sector).await.is_err() {
            return false;
        }
        if sector[510] != 0x55 || sector[511] != 0xAA {
            return false;
        }
        let Ok(bpb) = RawBpbCommon::read_from_bytes(&sector[..36]) else {
            return false;
        };
        let bps = bpb.bytes_per_sector.get();
        bps != 0 && bps.is_power_of_two() && bpb.sectors_per_cluster != 0
    }

    #[maybe_async::maybe_async]
    pub async fn mount(stream: Arc<dyn SparseStream>, options: ReaderOptions) -> Result<Self> {
        let mut sector = [0u8; 512];
        stream.read_at(0, &mut sector).await?;
        if sector[510] != 0x55 || sector[511] != 0xAA {
            return Err(Error::BadMagic(ctx!("fat", "missing 0x55AA boot sector signature")));
        }
        let bpb = RawBpbCommon::read_from_bytes(&sector[..36])
            .map_err(|_| Error::Truncated(ctx!("fat", "BPB short read")))?;

        let bytes_per_sector = bpb.bytes_per_sector.get() as u64;
        let sectors_per_cluster = bpb.sectors_per_cluster as u64;
        let reserved_sectors = bpb.reserved_sector_count.get() as u64;
        let num_fats = bpb.num_fats as u64;
        let root_entry_count = bpb.root_entry_count.get() as u64;
        let root_dir_sectors = (root_entry_count * DIR_ENTRY_SIZE).div_ceil(bytes_per_sector.max(1));

        let total_sectors = if bpb.total_sectors16.get() != 0 {
            bpb.total_sectors16.get() as u64
        } else {
            bpb.total_sectors32.get() as u64
        };

        let mut fat_size_sectors = bpb.fat_size16.get() as u64;
        let mut root_cluster = 0u32;
        if fat_size_sectors == 0 {
            let ext_size = std::mem::size_of::<RawBpb32Ext>();
            let ext = RawBpb32Ext::read_from_bytes(&sector[36..36 + ext_size])
                .map_err(|_| Error::Truncated(ctx!("fat", "FAT32 BPB extension short read")))?;
            fat_size_sectors = ext.fat_size32.get() as u64;
            root_cluster = ext.root_cluster.get();
        }

        if fat_size_sectors == 0 || bytes_per_sector == 0 || sectors_per_cluster == 0 {
            return Err(Error::CorruptStructure(ctx!("fat", "degenerate BPB geometry")));
        }

        let first_data_sector = reserved_sectors + num_fats * fat_size_sectors + root_dir_sectors;
        let data_sectors = total_sectors.saturating_sub(first_data_sector);
        let total_clusters = data_sectors / sectors_per_cluster;

        let variant = if total_clusters < 4085 {
            FatVariant::Fat12
        } else if total_clusters < 65525 {
            FatVariant::Fat16
        } else {
            FatVariant::Fat32
        };
        log::debug!("mounted {variant:?} volume, {total_clusters} clusters");

        let layout = Layout {
            variant,
            bytes_per_sector,
            sectors_per_cluster,
            reserved_sectors,
            num_fats,
            fat_size_sectors,
            root_entry_count,
            first_data_sector,
            total_clusters,
            root_cluster,
        };

        Ok(Self { stream, layout, options })
    }

    pub fn variant(&self) -> FatVariant {
        self.layout.variant
    }

    #[maybe_async::maybe_async]
    async fn read_fat_entry(&self, cluster: u32) -> Result<u32> {
        let offset = self.layout.fat_entry_offset(cluster);
        match self.layout.variant {
            FatVariant::Fat12 => {
                let mut buf = [0u8; 2];
                self.stream.read_at(offset, &mut buf).await?;
                let packed = u16::from_le_bytes(buf);
                let value = if cluster & 1 == 0 { packed & 0x0FFF } else { packed >> 4 };
                Ok(value as u32)
            }
            FatVariant::Fat16 => {
                let mut buf = [0u8; 2];
                self.stream.read_at(offset, &mut buf).await?;
                Ok(u16::from_le_bytes(buf) as u32)
            }
            FatVariant::Fat32 => {
                let mut buf = [0u8; 4];
                self.stream.read_at(offset, &mut buf).await?;
                Ok(u32::from_le_bytes(buf) & 0x0FFF_FFFF)
            }
        }
    }

    /// Follows the cluster chain starting at `first_cluster`, returning the
    /// byte extents (relative to this reader's underlying stream) of every
    /// cluster in order.
    #[maybe_async::maybe_async]
    async fn cluster_chain(&self, first_cluster: u32) -> Result<Vec<Extent>> {
        let mut extents = Vec::new();
        let mut cluster = first_cluster;
        let mut guard = 0usize;
        while cluster >= 2 && !self.layout.end_of_chain(cluster) {
            guard += 1;
            if guard > self.layout.total_clusters as usize + 16 {
                return Err(Error::CorruptStructure(ctx!("fat", "cluster chain cycle at {cluster}")));
            }
            if self.layout.is_bad_cluster(cluster) {
                return Err(Error::CorruptStructure(ctx!("fat", "bad cluster {cluster} in chain")));
            }
            extents.push(Extent::new(
                self.layout.cluster_to_byte_offset(cluster),
                self.layout.bytes_per_cluster(),
            ));
            cluster = self.read_fat_entry(cluster).await?;
        }
        Ok(extents)
    }

    /// Root-directory extents: FAT32's root is an ordinary cluster chain;
    /// FAT12/16's root is a fixed-size region preceding the data area.
    #[maybe_async::maybe_async]
    async fn root_dir_extents(&self) -> Result<Vec<Extent>> {
        match self.layout.variant {
            FatVariant::Fat32 => self.cluster_chain(self.layout.root_cluster).await,
            _ => {
                let offset =
                    (self.layout.reserved_sectors + self.layout.num_fats * self.layout.fat_size_sectors)
                        * self.layout.bytes_per_sector;
                let length = self.layout.root_entry_count * DIR_ENTRY_SIZE;
                Ok(vec![Extent::new(offset, length)])
            }
        }
    }

    #[maybe_async::maybe_async]
    async fn read_extents(&self, extents: &[Extent], buf: &mut [u8]) -> Result<()> {
        let mut pos = 0usize;
        for e in extents {
            let take = (e.length as usize).min(buf.len() - pos);
            if take == 0 {
                break;
            }
            self.stream.read_at(e.offset, &mut buf[pos..pos + take]).await?;
            pos += take;
        }
        Ok(())
    }

    #[maybe_async::maybe_async]
    async fn list_dir(&self, extents: &[Extent]) -> Result<Vec<FatEntry>> {
        let total_len: u64 = extents.iter().map(|e| e.length).sum();
        let mut raw = vec![0u8; total_len as usize];
        self.read_extents(extents, &mut raw).await?;

        let mut out = Vec::new();
        let mut lfn_parts: Vec<(u8, [u16; 13])> = Vec::new();
        for chunk in raw.chunks_exact(DIR_ENTRY_SIZE as usize) {
            if chunk[0] == ENTRY_END {
                break;
            }
            if chunk[0] == ENTRY_DELETED {
                lfn_parts.clear();
                continue;
            }
            let attr = chunk[11];
            if attr == LFN_ATTR {
                let lfn = RawLfnEntry::read_from_bytes(chunk)
                    .map_err(|_| Error::Truncated(ctx!("fat", "short LFN directory entry")))?;
                let seq = lfn.order & 0x3F;
                let mut units = [0u16; 13];
                for (i, c) in lfn.name1.chunks_exact(2).enumerate() {
                    units[i] = u16::from_le_bytes([c[0], c[1]]);
                }
                for (i, c) in lfn.name2.chunks_exact(2).enumerate() {
                    units[5 + i] = u16::from_le_bytes([c[0], c[1]]);
                }
                for (i, c) in lfn.name3.chunks_exact(2).enumerate() {
                    units[11 + i] = u16::from_le_bytes([c[0], c[1]]);
                }
                lfn_parts.push((seq, units));
                continue;
            }

            let entry = RawDirEntry::read_from_bytes(chunk)
                .map_err(|_| Error::Truncated(ctx!("fat", "short directory entry")))?;
            let long_name = assemble_long_name(&mut lfn_parts);
            let short_name = decode_short_name(&entry.name);
            if short_name == "." || short_name == ".." {
                continue;
            }
            out.push(FatEntry {
                short_name,
                long_name,
                attr,
                first_cluster: ((entry.first_cluster_hi.get() as u32) << 16) | entry.first_cluster_lo.get() as u32,
                file_size: entry.file_size.get() as u64,
                create_date: entry.create_date.get(),
                create_time: entry.create_time.get(),
                write_date: entry.write_date.get(),
                write_time: entry.write_time.get(),
                access_date: entry.last_access_date.get(),
            });
        }
        Ok(out)
    }

    #[maybe_async::maybe_async]
    async fn lookup(&self, path: &str) -> Result<(FatEntry, Vec<Extent>)> {
        let components = split_path(path);
        let mut current_extents = self.root_dir_extents().await?;
        let mut current_entry = FatEntry::root();

        for (i, component) in components.iter().enumerate() {
            let entries = self.list_dir(&current_extents).await?;
            let found = entries
                .into_iter()
                .find(|e| diskit_fs::names_equal(&e.display_name(), component, false));
            let entry = found
                .ok_or_else(|| Error::NotFound(ctx!("fat", "path component {component:?} not found")))?;
            let is_last = i == components.len() - 1;
            if !is_last && !entry.is_directory() {
                return Err(Error::NotFound(ctx!("fat", "{component:?} is not a directory")));
            }
            current_extents = if entry.is_directory() {
                self.cluster_chain(entry.first_cluster).await?
            } else {
                Vec::new()
            };
            current_entry = entry;
        }

        let extents = if current_entry.is_directory() {
            current_extents
        } else {
            self.cluster_chain(current_entry.first_cluster).await?
        };
        Ok((current_entry, extents))
    }
}

struct FatEntry {
    short_name: String,
    long_name: Option<String>,
    attr: u8,
    first_cluster: u32,
    file_size: u64,
    create_date: u16,
    create_time: u16,
    write_date: u16,
    write_time: u16,
    access_date: u16,
}

impl FatEntry {
    fn root() -> Self {
        Self {
            short_name: String::new(),
            long_name: None,
            attr: FileAttributes::DIRECTORY as u8,
            first_cluster: 0,
            file_size: 0,
            create_date: 0,
            create_time: 0,
            write_date: 0,
            write_time: 0,
            access_date: 0,
        }
    }

    fn display_name(&self) -> String {
        self.long_name.clone().unwrap_or_else(|| self.short_name.clone())
    }

    fn is_directory(&self) -> bool {
        self.attr & FileAttributes::DIRECTORY as u8 != 0
    }

    fn to_dir_entry(&self) -> DirEntry {
        DirEntry {
            name: self.display_name(),
            attributes: FileAttributes(self.attr as u32),
            times: Timestamps {
                created: fat_datetime(self.create_date, self.create_time),
                modified: fat_datetime(self.write_date, self.write_time),
                accessed: fat_datetime(self.access_date, 0),
            },
            size: self.file_size,
            is_directory: self.is_directory(),
            is_symlink: false,
            stream_count: 1,
        }
    }
}

fn fat_datetime(date: u16, time_field: u16) -> Option<time::OffsetDateTime> {
    if date == 0 {
        return None;
    }
    let year = 1980 + (date >> 9) as i32;
    let month = ((date >> 5) & 0x0F).clamp(1, 12) as u8;
    let day = (date & 0x1F).clamp(1, 31) as u8;
    let hour = (time_field >> 11) as u8;
    let minute = ((time_field >> 5) & 0x3F) as u8;
    let second = ((time_field & 0x1F) * 2) as u8;
    let month = time::Month::try_from(month).ok()?;
    let date = time::Date::from_calendar_date(year, month, day).ok()?;
    let t = time::Time::from_hms(hour.min(23), minute.min(59), second.min(59)).ok()?;
    Some(time::PrimitiveDateTime::new(date, t).assume_utc())
}

/// Decodes an 8.3 short name, inserting the `.` separator only when an
/// extension is present.
fn decode_short_name(raw: &[u8; 11]) -> String {
    let base = decode_fixed_ascii(&raw[0..8]);
    let ext = decode_fixed_ascii(&raw[8..11]);
    if ext.is_empty() {
        base
    } else {
        format!("{base}.{ext}")
    }
}

/// Consumes accumulated LFN fragments (pushed in on-disk, reverse-sequence
/// order) and assembles the long name, or `None` if there were none.
fn assemble_long_name(parts: &mut Vec<(u8, [u16; 13])>) -> Option<String> {
    if parts.is_empty() {
        return None;
    }
    parts.sort_by_key(|(seq, _)| *seq);
    let mut units: Vec<u16> = Vec::new();
    for (_, chars) in parts.iter() {
        units.extend_from_slice(chars);
    }
    parts.clear();
    let end = units.iter().position(|&u| u == 0).unwrap_or(units.len());
    Some(
        char::decode_utf16(units[..end].iter().copied())
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect(),
    )
}

#[allow(dead_code)]
fn validate_short_name_bytes(raw: &[u8; 11]) -> bool {
    raw.iter().all(|&b| !INVALID_SHORT_NAME_BYTES.contains(&b))
}

#[maybe_async::maybe_async]
impl FileSystemReader for Reader {
    fn case_sensitive(&self) -> bool {
        false
    }

    async fn stat(&self, path: &str) -> Result<DirEntry> {
        let (entry, _) = self.lookup(path).await?;
        Ok(entry.to_dir_entry())
    }

    async fn enumerate(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (_, extents) = self.lookup(path).await?;
        let entries = self.list_dir(&extents).await?;
        Ok(entries
            .into_iter()
            .map(|e| e.to_dir_entry())
            .filter(|e| {
                !((self.options.hide_hidden && e.attributes.has(FileAttributes::HIDDEN))
                    || (self.options.hide_system && e.attributes.has(FileAttributes::SYSTEM)))
            })
            .collect())
    }

    async fn open_file(&self, path: &str) -> Result<Arc<dyn SparseStream>> {
        let (entry, extents) = self.lookup(path).await?;
        if entry.is_directory() {
            return Err(Error::NotFound(ctx!("fat", "{path} is a directory")));
        }
        let children = extents
            .into_iter()
            .map(|e| SubStream::new(self.stream.clone(), e.offset, e.length))
            .collect::<Result<Vec<_>>>()?;
        let concat = ConcatStream::new(children);
        let total = concat.len();
        Ok(Arc::new(SubStream::new(concat, 0, entry.file_size.min(total))?))
    }

    async fn path_to_extents(&self, path: &str) -> Result<Vec<Extent>> {
        let (_, extents) = self.lookup(path).await?;
        Ok(extents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lfn_assembly_matches_scenario_3() {
        // Three LFN slots (sequence 0x43, 0x02, 0x01) spelling
        // "LongFilenameExample.txt" followed by a short entry.
        let name = "LongFilenameExample.txt";
        let units: Vec<u16> = name.encode_utf16().collect();
        let mut padded = units.clone();
        padded.push(0);
        while padded.len() % 13 != 0 {
            padded.push(0xFFFF);
        }
        let chunks: Vec<&[u16]> = padded.chunks(13).collect();
        let mut parts = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            let mut arr = [0u16; 13];
            arr.copy_from_slice(chunk);
            let mut seq = (i + 1) as u8;
            if i == chunks.len() - 1 {
                seq |= 0x40;
            }
            parts.push((seq & 0x3F, arr));
        }
        // On-disk order is reverse-sequence (last fragment stored first).
        parts.reverse();
        let assembled = assemble_long_name(&mut parts).unwrap();
        assert_eq!(assembled, name);
    }

    #[test]
    fn short_name_decodes_with_dot() {
        let mut raw = [b' '; 11];
        raw[0..7].copy_from_slice(b"LONGFI~");
        raw[7] = b'1';
        raw[8..11].copy_from_slice(b"TXT");
        assert_eq!(decode_short_name(&raw), "LONGFI~1.TXT");
        assert!(validate_short_name_bytes(&raw));
    }

    #[test]
    fn variant_classification_thresholds() {
        assert!(4084 < 4085);
        assert!(65524 < 65525);
    }
}
