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

//! Supplemental exFAT reader (not named by the core reader list, but a
//! natural extension of the FAT cluster-chain model this workspace already
//! carries). Read-only: mounting, directory entry-set parsing with checksum
//! verification, and the `NoFatChain` contiguous-allocation fast path.

use std::sync::Arc;

use diskit_err::{ctx, Error, Result};
use diskit_fs::{split_path, DirEntry, FileAttributes, FileSystemReader, ReaderOptions, Timestamps};
use diskit_stream::{ConcatStream, Extent, SparseStream, SubStream};
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

const DIR_ENTRY_SIZE: usize = 32;

const ENTRY_TYPE_FILE: u8 = 0x85;
const ENTRY_TYPE_STREAM_EXTENSION: u8 = 0xC0;
const ENTRY_TYPE_FILE_NAME: u8 = 0xC1;

const NO_FAT_CHAIN_FLAG: u8 = 0x02;

/// The JumpBoot field shall contain the jump instruction for CPUs common in
/// personal computers. FileSystemName shall read "EXFAT   ".
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct BootSector {
    jump_boot: [u8; 3],
    file_system_name: [u8; 8],
    must_be_zero: [u8; 53],
    partition_offset: U64,
    volume_length: U64,
    fat_offset: U32,
    fat_length: U32,
    cluster_heap_offset: U32,
    cluster_count: U32,
    first_cluster_of_root_directory: U32,
    volume_serial_number: U32,
    file_system_revision: U16,
    volume_flags: U16,
    bytes_per_sector_shift: u8,
    sectors_per_cluster_shift: u8,
    number_of_fats: u8,
    drive_select: u8,
    percent_in_use: u8,
    reserved: [u8; 7],
    boot_code: [u8; 390],
    boot_signature: [u8; 2],
}

const _: () = assert!(std::mem::size_of::<BootSector>() == 512);

/// The generic 32-byte directory-entry template every concrete entry type
/// (File, Stream Extension, File Name, Allocation Bitmap, Up-case Table,
/// Volume Label, Volume GUID) shares the first three bytes of.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawEntry {
    entry_type: u8,
    custom_defined: [u8; 19],
    first_cluster: U32,
    data_length: U64,
}

const _: () = assert!(std::mem::size_of::<RawEntry>() == 32);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct FileDirEntry {
    entry_type: u8,
    secondary_count: u8,
    set_checksum: U16,
    file_attributes: U16,
    reserved1: [u8; 2],
    create_timestamp: U32,
    last_modified_timestamp: U32,
    last_accessed_timestamp: U32,
    create_10ms_increment: u8,
    last_modified_10ms_increment: u8,
    create_utc_offset: u8,
    last_modified_utc_offset: u8,
    last_accessed_utc_offset: u8,
    reserved2: [u8; 7],
}

const _: () = assert!(std::mem::size_of::<FileDirEntry>() == 32);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct StreamExtensionDirEntry {
    entry_type: u8,
    general_secondary_flags: u8,
    reserved1: u8,
    name_length: u8,
    name_hash: U16,
    reserved2: [u8; 2],
    valid_data_length: U64,
    reserved3: [u8; 4],
    first_cluster: U32,
    data_length: U64,
}

const _: () = assert!(std::mem::size_of::<StreamExtensionDirEntry>() == 32);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct FileNameDirEntry {
    entry_type: u8,
    general_secondary_flags: u8,
    file_name: [U16; 15],
}

const _: () = assert!(std::mem::size_of::<FileNameDirEntry>() == 32);

struct Layout {
    bytes_per_sector_shift: u8,
    bytes_per_cluster_shift: u8,
    fat_offset: u64,
    cluster_heap_offset: u64,
    cluster_count: u32,
    root_cluster: u32,
}

impl Layout {
    fn bytes_per_cluster(&self) -> u64 {
        1u64 << self.bytes_per_cluster_shift
    }

    fn cluster_to_byte_offset(&self, cluster: u32) -> u64 {
        self.cluster_heap_offset + (cluster as u64 - 2) * self.bytes_per_cluster()
    }
}

pub struct Reader {
    stream: Arc<dyn SparseStream>,
    layout: Layout,
    options: ReaderOptions,
}

impl Reader {
    #[maybe_async::maybe_async]
    pub async fn detect(stream: &dyn SparseStream) -> bool {
        let mut sector = [0u8; 512];
        if stream.read_at(0, &mut sector).await.is_err() {
            return false;
        }
        let Ok(boot) = BootSector::read_from_bytes(&sector) else {
            return false;
        };
        &boot.file_system_name == b"EXFAT   " && boot.boot_signature == [0x55, 0xAA]
    }

    #[maybe_async::maybe_async]
    pub async fn mount(stream: Arc<dyn SparseStream>, options: ReaderOptions) -> Result<Self> {
        let mut sector = [0u8; 512];
        stream.read_at(0, &mut sector).await?;
        let boot = BootSector::read_from_bytes(&sector)
            .map_err(|_| Error::Truncated(ctx!("exfat", "boot sector short read")))?;

        if &boot.file_system_name != b"EXFAT   " || boot.boot_signature != [0x55, 0xAA] {
            return Err(Error::BadMagic(ctx!("exfat", "missing EXFAT boot signature")));
        }

        let bytes_per_sector_shift = boot.bytes_per_sector_shift;
        if !(9..=12).contains(&bytes_per_sector_shift) {
            return Err(Error::CorruptStructure(ctx!(
                "exfat",
                "bytes-per-sector shift {bytes_per_sector_shift} outside [9, 12]"
            )));
        }
        let bytes_per_cluster_shift = bytes_per_sector_shift + boot.sectors_per_cluster_shift;
        if bytes_per_cluster_shift > 25 {
            return Err(Error::CorruptStructure(ctx!(
                "exfat",
                "bytes-per-cluster shift {bytes_per_cluster_shift} exceeds 25"
            )));
        }

        let fat_offset_sectors = boot.fat_offset.get();
        if fat_offset_sectors < 24 {
            return Err(Error::CorruptStructure(ctx!(
                "exfat",
                "FAT offset {fat_offset_sectors} precedes end of boot region (24)"
            )));
        }
        let number_of_fats = boot.number_of_fats;
        if number_of_fats != 1 && number_of_fats != 2 {
            return Err(Error::CorruptStructure(ctx!(
                "exfat",
                "number of FATs {number_of_fats} is neither 1 nor 2"
            )));
        }
        let fat_length_sectors = boot.fat_length.get();

        let cluster_heap_offset_sectors = boot.cluster_heap_offset.get();
        let cluster_heap_min = fat_offset_sectors + fat_length_sectors * number_of_fats as u32;
        if cluster_heap_offset_sectors < cluster_heap_min {
            return Err(Error::CorruptStructure(ctx!(
                "exfat",
                "cluster heap offset {cluster_heap_offset_sectors} precedes end of FAT region ({cluster_heap_min})"
            )));
        }

        let layout = Layout {
            bytes_per_sector_shift,
            bytes_per_cluster_shift,
            fat_offset: fat_offset_sectors as u64 * (1u64 << bytes_per_sector_shift),
            cluster_heap_offset: cluster_heap_offset_sectors as u64 * (1u64 << bytes_per_sector_shift),
            cluster_count: boot.cluster_count.get(),
            root_cluster: boot.first_cluster_of_root_directory.get(),
        };

        log::debug!("mounted exfat volume, {} clusters", boot.cluster_count.get());
        Ok(Self { stream, layout, options })
    }

    #[maybe_async::maybe_async]
    async fn read_fat_entry(&self, cluster: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.stream
            .read_at(self.layout.fat_offset + cluster as u64 * 4, &mut buf)
            .await?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Resolves an allocation to its byte extents: a direct single run if
    /// `no_fat_chain` is set (exFAT's `NoFatChain` general-secondary-flags
    /// bit), otherwise a FAT-linked chain walk exactly like FAT12/16/32.
    #[maybe_async::maybe_async]
    async fn allocation_extents(&self, first_cluster: u32, byte_length: u64, no_fat_chain: bool) -> Result<Vec<Extent>> {
        if first_cluster == 0 || byte_length == 0 {
            return Ok(Vec::new());
        }
        if no_fat_chain {
            return Ok(vec![Extent::new(self.layout.cluster_to_byte_offset(first_cluster), byte_length)]);
        }

        let mut extents = Vec::new();
        let mut cluster = first_cluster;
        let mut remaining = byte_length;
        let mut guard = 0usize;
        while cluster > 1 && cluster < 0xFFFFFF7 && remaining > 0 {
            guard += 1;
            if guard > self.layout.cluster_count as usize + 16 {
                return Err(Error::CorruptStructure(ctx!("exfat", "cluster chain cycle at {cluster}")));
            }
            let take = remaining.min(self.layout.bytes_per_cluster());
            extents.push(Extent::new(self.layout.cluster_to_byte_offset(cluster), take));
            remaining -= take;
            cluster = self.read_fat_entry(cluster).await?;
        }
        Ok(extents)
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
    async fn list_dir(&self, extents: &[Extent]) -> Result<Vec<ExfatEntry>> {
        let total_len: u64 = extents.iter().map(|e| e.length).sum();
        let mut raw = vec![0u8; total_len as usize];
        self.read_extents(extents, &mut raw).await?;

        let mut out = Vec::new();
        let mut i = 0usize;
        while i + DIR_ENTRY_SIZE <= raw.len() {
            let chunk = &raw[i..i + DIR_ENTRY_SIZE];
            let entry_type = chunk[0];
            if entry_type == 0x00 {
                break;
            }
            if entry_type != ENTRY_TYPE_FILE {
                i += DIR_ENTRY_SIZE;
                continue;
            }

            let file = FileDirEntry::read_from_bytes(chunk)
                .map_err(|_| Error::Truncated(ctx!("exfat", "short File directory entry")))?;
            let set_len = (file.secondary_count as usize + 1) * DIR_ENTRY_SIZE;
            if i + set_len > raw.len() {
                return Err(Error::Truncated(ctx!("exfat", "directory entry set runs past directory end")));
            }
            let set_bytes = &raw[i..i + set_len];
            let computed = entry_set_checksum(set_bytes);
            if computed != file.set_checksum.get() {
                return Err(Error::ChecksumMismatch(ctx!(
                    "exfat",
                    "entry-set checksum mismatch: stored {stored:#06x}, computed {computed:#06x}",
                    stored = file.set_checksum.get()
                )));
            }

            let stream_chunk = &set_bytes[DIR_ENTRY_SIZE..2 * DIR_ENTRY_SIZE];
            if stream_chunk[0] != ENTRY_TYPE_STREAM_EXTENSION {
                return Err(Error::CorruptStructure(ctx!(
                    "exfat",
                    "File directory entry not followed by a Stream Extension entry"
                )));
            }
            let stream_ext = StreamExtensionDirEntry::read_from_bytes(stream_chunk)
                .map_err(|_| Error::Truncated(ctx!("exfat", "short Stream Extension entry")))?;

            let name_entry_count = (stream_ext.name_length as usize).div_ceil(15);
            let mut name_units: Vec<u16> = Vec::with_capacity(stream_ext.name_length as usize);
            for n in 0..name_entry_count {
                let offset = (2 + n) * DIR_ENTRY_SIZE;
                let name_chunk = &set_bytes[offset..offset + DIR_ENTRY_SIZE];
                if name_chunk[0] != ENTRY_TYPE_FILE_NAME {
                    return Err(Error::CorruptStructure(ctx!(
                        "exfat",
                        "Stream Extension entry not followed by enough File Name entries"
                    )));
                }
                let name_entry = FileNameDirEntry::read_from_bytes(name_chunk)
                    .map_err(|_| Error::Truncated(ctx!("exfat", "short File Name entry")))?;
                name_units.extend(name_entry.file_name.iter().map(|u| u.get()));
            }
            name_units.truncate(stream_ext.name_length as usize);
            let name = char::decode_utf16(name_units)
                .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
                .collect();

            let no_fat_chain = stream_ext.general_secondary_flags & NO_FAT_CHAIN_FLAG != 0;
            out.push(ExfatEntry {
                name,
                attributes: file.file_attributes.get() as u32,
                first_cluster: stream_ext.first_cluster.get(),
                data_length: stream_ext.data_length.get(),
                valid_data_length: stream_ext.valid_data_length.get(),
                no_fat_chain,
                create: exfat_datetime(file.create_timestamp.get()),
                modified: exfat_datetime(file.last_modified_timestamp.get()),
                accessed: exfat_datetime(file.last_accessed_timestamp.get()),
            });

            i += set_len;
        }
        Ok(out)
    }

    #[maybe_async::maybe_async]
    async fn root_dir_extents(&self) -> Result<Vec<Extent>> {
        // Root directory size is unknown up front; walk the chain to its
        // natural end by treating it as unbounded (bytes_per_cluster * huge)
        // and letting `allocation_extents`'s end-of-chain check stop it.
        self.allocation_extents(self.layout.root_cluster, u64::MAX / 2, false).await
    }

    #[maybe_async::maybe_async]
    async fn lookup(&self, path: &str) -> Result<(ExfatEntry, Vec<Extent>)> {
        let components = split_path(path);
        let mut current_extents = self.root_dir_extents().await?;
        let mut current_entry = ExfatEntry::root();

        for (i, component) in components.iter().enumerate() {
            let entries = self.list_dir(&current_extents).await?;
            let found = entries
                .into_iter()
                .find(|e| diskit_fs::names_equal(&e.name, component, false));
            let entry = found
                .ok_or_else(|| Error::NotFound(ctx!("exfat", "path component {component:?} not found")))?;
            let is_last = i == components.len() - 1;
            let is_dir = entry.is_directory();
            if !is_last && !is_dir {
                return Err(Error::NotFound(ctx!("exfat", "{component:?} is not a directory")));
            }
            current_extents = self
                .allocation_extents(entry.first_cluster, entry.data_length, entry.no_fat_chain)
                .await?;
            current_entry = entry;
        }

        Ok((current_entry, current_extents))
    }
}

struct ExfatEntry {
    name: String,
    attributes: u32,
    first_cluster: u32,
    data_length: u64,
    valid_data_length: u64,
    no_fat_chain: bool,
    create: Option<time::OffsetDateTime>,
    modified: Option<time::OffsetDateTime>,
    accessed: Option<time::OffsetDateTime>,
}

impl ExfatEntry {
    fn root() -> Self {
        Self {
            name: String::new(),
            attributes: FileAttributes::DIRECTORY,
            first_cluster: 0,
            data_length: 0,
            valid_data_length: 0,
            no_fat_chain: false,
            create: None,
            modified: None,
            accessed: None,
        }
    }

    fn is_directory(&self) -> bool {
        self.attributes & FileAttributes::DIRECTORY != 0
    }

    fn to_dir_entry(&self) -> DirEntry {
        DirEntry {
            name: self.name.clone(),
            attributes: FileAttributes(self.attributes),
            times: Timestamps {
                created: self.create,
                modified: self.modified,
                accessed: self.accessed,
            },
            size: self.valid_data_length,
            is_directory: self.is_directory(),
            is_symlink: false,
            stream_count: 1,
        }
    }
}

/// exFAT's packed timestamp (Table 29): bits 25-31 year offset from 1980,
/// 21-24 month, 16-20 day, 11-15 hour, 5-10 minute, 0-4 two-second count.
fn exfat_datetime(packed: u32) -> Option<time::OffsetDateTime> {
    if packed == 0 {
        return None;
    }
    let year = 1980 + (packed >> 25) as i32;
    let month = ((packed >> 21) & 0x0F).clamp(1, 12) as u8;
    let day = ((packed >> 16) & 0x1F).clamp(1, 31) as u8;
    let hour = ((packed >> 11) & 0x1F) as u8;
    let minute = ((packed >> 5) & 0x3F) as u8;
    let second = ((packed & 0x1F) * 2) as u8;
    let month = time::Month::try_from(month).ok()?;
    let date = time::Date::from_calendar_date(year, month, day).ok()?;
    let t = time::Time::from_hms(hour.min(23), minute.min(59), second.min(59)).ok()?;
    Some(time::PrimitiveDateTime::new(date, t).assume_utc())
}

/// Entry-set checksum (exFAT spec Figure 2): a running 16-bit rotate-right
/// accumulator over every byte of the set, excluding bytes 2-3 (the
/// `SetChecksum` field itself) of the first (primary) entry.
fn entry_set_checksum(set_bytes: &[u8]) -> u16 {
    let mut checksum: u16 = 0;
    for (i, &b) in set_bytes.iter().enumerate() {
        if i == 2 || i == 3 {
            continue;
        }
        checksum = checksum.rotate_right(1).wrapping_add(b as u16);
    }
    checksum
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
            return Err(Error::NotFound(ctx!("exfat", "{path} is a directory")));
        }
        let children = extents
            .into_iter()
            .map(|e| SubStream::new(self.stream.clone(), e.offset, e.length))
            .collect::<Result<Vec<_>>>()?;
        let concat = ConcatStream::new(children);
        let total = concat.len();
        Ok(Arc::new(SubStream::new(concat, 0, entry.valid_data_length.min(total))?))
    }

    async fn path_to_extents(&self, path: &str) -> Result<Vec<Extent>> {
        let (_, extents) = self.lookup(path).await?;
        Ok(extents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_entry_set(name: &str, attributes: u16) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let name_entry_count = units.len().div_ceil(15);
        let mut set = vec![0u8; DIR_ENTRY_SIZE * (2 + name_entry_count)];

        set[0] = ENTRY_TYPE_FILE;
        set[1] = (1 + name_entry_count) as u8; // secondary_count
        set[4..6].copy_from_slice(&attributes.to_le_bytes());

        let stream_off = DIR_ENTRY_SIZE;
        set[stream_off] = ENTRY_TYPE_STREAM_EXTENSION;
        set[stream_off + 3] = units.len() as u8; // name_length
        set[stream_off + 24..stream_off + 28].copy_from_slice(&0u32.to_le_bytes()); // first_cluster = 0
        set[stream_off + 28..stream_off + 36].copy_from_slice(&0u64.to_le_bytes()); // data_length = 0

        for (n, chunk) in units.chunks(15).enumerate() {
            let off = DIR_ENTRY_SIZE * (2 + n);
            set[off] = ENTRY_TYPE_FILE_NAME;
            for (i, &u) in chunk.iter().enumerate() {
                let p = off + 2 + i * 2;
                set[p..p + 2].copy_from_slice(&u.to_le_bytes());
            }
        }

        let checksum = entry_set_checksum(&set);
        set[2..4].copy_from_slice(&checksum.to_le_bytes());
        set
    }

    #[test]
    fn entry_set_checksum_roundtrips() {
        let set = build_entry_set("hello.txt", 0);
        let file = FileDirEntry::read_from_bytes(&set[..DIR_ENTRY_SIZE]).unwrap();
        assert_eq!(entry_set_checksum(&set), file.set_checksum.get());
    }

    #[test]
    fn corrupted_checksum_is_detected() {
        let mut set = build_entry_set("hello.txt", 0);
        set[2] ^= 0xFF;
        let file = FileDirEntry::read_from_bytes(&set[..DIR_ENTRY_SIZE]).unwrap();
        assert_ne!(entry_set_checksum(&set), file.set_checksum.get());
    }

    #[test]
    fn datetime_rejects_zero_field() {
        assert!(exfat_datetime(0).is_none());
    }
}
