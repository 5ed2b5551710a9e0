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

//! NTFS reader.
//!
//! The Master File Table is addressed through its own `$DATA` attribute
//! (record 0 bootstraps the rest, exactly like every other file), so once
//! `$MFT` is located every other file record is just an offset into that
//! stream. Directory listings walk the `$I30` index: resident root entries
//! plus, for large directories, every `$INDEX_ALLOCATION` record. NTFS
//! index nodes never duplicate a key between an internal separator and a
//! leaf, so a flat scan across root + every index-allocation record yields
//! the complete, duplicate-free entry set without needing to follow subnode
//! VCN pointers for correctness (only for single-key lookup efficiency,
//! which this reader does not attempt).

use std::sync::Arc;

pub mod allocator;

pub use allocator::{AllocatorProbe, ClusterBitmap, ClusterRun};

use diskit_err::{ctx, Error, Result};
use diskit_fs::{split_path, DirEntry, FileAttributes, FileSystemReader, ReaderOptions, Timestamps, UnixInfo};
use diskit_stream::{ConcatStream, Extent, SparseStream, SubStream, ZeroStream};
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

const ATTR_STANDARD_INFORMATION: u32 = 0x10;
const ATTR_FILE_NAME: u32 = 0x30;
const ATTR_DATA: u32 = 0x80;
const ATTR_INDEX_ROOT: u32 = 0x90;
const ATTR_INDEX_ALLOCATION: u32 = 0xA0;
const ATTR_REPARSE_POINT: u32 = 0xC0;
const ATTR_END: u32 = 0xFFFF_FFFF;

const FILE_RECORD_IN_USE: u16 = 0x0001;
const FILE_RECORD_IS_DIRECTORY: u16 = 0x0002;

const INDEX_ENTRY_SUBNODE: u16 = 0x01;
const INDEX_ENTRY_LAST: u16 = 0x02;

/// `$FILE_NAME.flags` carries a copy of the referenced file's attributes
/// plus this bit (not a real Win32 attribute), set only when the entry
/// refers to a directory.
const DUP_DIRECTORY_FLAG: u32 = 0x1000_0000;

const ROOT_RECORD_INDEX: u64 = 5;
const BITMAP_RECORD_INDEX: u64 = 6;

const IO_REPARSE_TAG_SYMLINK: u32 = 0xA000_000C;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct BootSector {
    jump_boot: [u8; 3],
    oem_id: [u8; 8],
    bytes_per_sector: U16,
    sectors_per_cluster: u8,
    reserved_sectors: U16,
    unused1: [u8; 5],
    media_descriptor: u8,
    unused2: U16,
    sectors_per_track: U16,
    number_of_heads: U16,
    hidden_sectors: U32,
    unused3: U32,
    unused4: U32,
    total_sectors: U64,
    mft_lcn: U64,
    mft_mirror_lcn: U64,
    clusters_per_file_record_segment: i8,
    unused5: [u8; 3],
    clusters_per_index_buffer: i8,
    unused6: [u8; 3],
    volume_serial_number: U64,
    checksum: U32,
    bootstrap_code: [u8; 426],
    boot_signature: [u8; 2],
}

const _: () = assert!(std::mem::size_of::<BootSector>() == 512);

/// Common to every file-record and `INDX` block: a 4-byte signature, the
/// offset/length of the update sequence array that protects it against
/// torn multi-sector writes.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct MultiSectorHeader {
    signature: [u8; 4],
    usa_offset: U16,
    usa_count: U16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct FileRecordHeader {
    multi_sector_header: MultiSectorHeader,
    lsn: U64,
    sequence_number: U16,
    hard_link_count: U16,
    first_attribute_offset: U16,
    flags: U16,
    used_size: U32,
    allocated_size: U32,
    base_file_record: U64,
    next_attribute_id: U16,
}

const _: () = assert!(std::mem::size_of::<FileRecordHeader>() == 42);

/// A resolved attribute: its type, optional name (e.g. an alternate data
/// stream name), and either resident bytes or the non-resident run list
/// expressed as absolute volume byte extents.
struct Attribute {
    type_code: u32,
    name: String,
    value: Option<Vec<u8>>,
    runs: Option<Vec<Run>>,
    data_size: u64,
}

impl Attribute {
    fn is_resident(&self) -> bool {
        self.value.is_some()
    }
}

#[derive(Clone)]
enum Run {
    Data(Extent),
    Sparse(u64),
}

struct NtfsEntry {
    name: String,
    namespace: u8,
    mft_reference: u64,
    flags: u32,
    real_size: u64,
    created: Option<time::OffsetDateTime>,
    modified: Option<time::OffsetDateTime>,
    accessed: Option<time::OffsetDateTime>,
}

impl NtfsEntry {
    fn is_directory(&self) -> bool {
        self.flags & DUP_DIRECTORY_FLAG != 0
    }

    fn attributes(&self) -> FileAttributes {
        translate_attributes(self.flags, self.is_directory())
    }
}

fn translate_attributes(flags: u32, is_directory: bool) -> FileAttributes {
    let mut bits = 0u32;
    if flags & 0x0001 != 0 {
        bits |= FileAttributes::READ_ONLY;
    }
    if flags & 0x0002 != 0 {
        bits |= FileAttributes::HIDDEN;
    }
    if flags & 0x0004 != 0 {
        bits |= FileAttributes::SYSTEM;
    }
    if flags & 0x0020 != 0 {
        bits |= FileAttributes::ARCHIVE;
    }
    if flags & 0x0400 != 0 {
        bits |= FileAttributes::REPARSE_POINT;
    }
    if flags & 0x0800 != 0 {
        bits |= FileAttributes::COMPRESSED;
    }
    if flags & 0x4000 != 0 {
        bits |= FileAttributes::ENCRYPTED;
    }
    if is_directory {
        bits |= FileAttributes::DIRECTORY;
    }
    FileAttributes(bits)
}

/// NTFS timestamps are 64-bit counts of 100ns intervals since 1601-01-01 UTC.
fn ntfs_time(ticks: u64) -> Option<time::OffsetDateTime> {
    if ticks == 0 {
        return None;
    }
    let epoch = time::PrimitiveDateTime::new(
        time::Date::from_calendar_date(1601, time::Month::January, 1).ok()?,
        time::Time::MIDNIGHT,
    )
    .assume_utc();
    epoch.checked_add(time::Duration::nanoseconds(ticks as i64 * 100))
}

pub struct Reader {
    stream: Arc<dyn SparseStream>,
    mft_stream: Arc<dyn SparseStream>,
    bytes_per_cluster: u64,
    bytes_per_sector: u64,
    file_record_size: u64,
    index_record_size: u64,
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
        &boot.oem_id == b"NTFS    " && boot.boot_signature == [0x55, 0xAA]
    }

    #[maybe_async::maybe_async]
    pub async fn mount(stream: Arc<dyn SparseStream>, options: ReaderOptions) -> Result<Self> {
        let mut sector = [0u8; 512];
        stream.read_at(0, &mut sector).await?;
        let boot = BootSector::read_from_bytes(&sector)
            .map_err(|_| Error::Truncated(ctx!("ntfs", "boot sector short read")))?;
        if &boot.oem_id != b"NTFS    " || boot.boot_signature != [0x55, 0xAA] {
            return Err(Error::BadMagic(ctx!("ntfs", "missing NTFS boot signature")));
        }

        let bytes_per_sector = boot.bytes_per_sector.get() as u64;
        let sectors_per_cluster = boot.sectors_per_cluster as u64;
        if bytes_per_sector == 0 || sectors_per_cluster == 0 {
            return Err(Error::CorruptStructure(ctx!("ntfs", "degenerate BPB geometry")));
        }
        let bytes_per_cluster = bytes_per_sector * sectors_per_cluster;

        let file_record_size = record_size(boot.clusters_per_file_record_segment, bytes_per_cluster);
        let index_record_size = record_size(boot.clusters_per_index_buffer, bytes_per_cluster);

        let mft_offset = boot.mft_lcn.get() * bytes_per_cluster;
        let mut record0 = vec![0u8; file_record_size as usize];
        stream.read_at(mft_offset, &mut record0).await?;
        apply_fixup(&mut record0, bytes_per_sector)?;

        let header = FileRecordHeader::read_from_bytes(&record0[..std::mem::size_of::<FileRecordHeader>()])
            .map_err(|_| Error::Truncated(ctx!("ntfs", "$MFT record 0 short read")))?;
        if &header.multi_sector_header.signature != b"FILE" {
            return Err(Error::BadMagic(ctx!("ntfs", "$MFT record 0 missing FILE signature")));
        }

        let attrs = parse_attributes(&record0, header.first_attribute_offset.get(), bytes_per_cluster)?;
        let data = attrs
            .iter()
            .find(|a| a.type_code == ATTR_DATA && a.name.is_empty())
            .ok_or_else(|| Error::CorruptStructure(ctx!("ntfs", "$MFT has no unnamed $DATA attribute")))?;
        let runs = data
            .runs
            .clone()
            .ok_or_else(|| Error::CorruptStructure(ctx!("ntfs", "$MFT $DATA attribute is resident")))?;
        let mft_stream = build_runs_stream(&stream, &runs)?;

        log::debug!("mounted ntfs volume, mft at cluster {}", boot.mft_lcn.get());
        Ok(Self {
            stream,
            mft_stream,
            bytes_per_cluster,
            bytes_per_sector,
            file_record_size,
            index_record_size,
            options,
        })
    }

    /// Loads `$Bitmap` (MFT record 6) into an in-memory [`ClusterBitmap`],
    /// for callers that need to validate or extend cluster allocation
    /// (§4.5.2). The reader itself never writes; this is read-only
    /// diagnostic/consumer plumbing.
    #[maybe_async::maybe_async]
    pub async fn cluster_bitmap(&self) -> Result<ClusterBitmap> {
        let (_, attrs) = self.record_attributes(BITMAP_RECORD_INDEX).await?;
        let data = attrs
            .iter()
            .find(|a| a.type_code == ATTR_DATA && a.name.is_empty())
            .ok_or_else(|| Error::CorruptStructure(ctx!("ntfs", "$Bitmap has no unnamed $DATA attribute")))?;
        let total_clusters = self.stream.len() / self.bytes_per_cluster;
        let bytes = if let Some(runs) = &data.runs {
            let stream = build_runs_stream(&self.stream, runs)?;
            let mut buf = vec![0u8; stream.len() as usize];
            stream.read_at(0, &mut buf).await?;
            buf
        } else {
            data.value.clone().unwrap_or_default()
        };
        ClusterBitmap::from_bitmap_bytes(&bytes, total_clusters)
    }

    #[maybe_async::maybe_async]
    async fn read_record(&self, index: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.file_record_size as usize];
        self.mft_stream.read_at(index * self.file_record_size, &mut buf).await?;
        apply_fixup(&mut buf, self.bytes_per_sector)?;
        Ok(buf)
    }

    #[maybe_async::maybe_async]
    async fn record_attributes(&self, index: u64) -> Result<(FileRecordHeader, Vec<Attribute>)> {
        let record = self.read_record(index).await?;
        let header = FileRecordHeader::read_from_bytes(&record[..std::mem::size_of::<FileRecordHeader>()])
            .map_err(|_| Error::Truncated(ctx!("ntfs", "record {index} short read")))?;
        if &header.multi_sector_header.signature != b"FILE" {
            return Err(Error::BadMagic(ctx!("ntfs", "record {index} missing FILE signature")));
        }
        let attrs = parse_attributes(&record, header.first_attribute_offset.get(), self.bytes_per_cluster)?;
        Ok((header, attrs))
    }

    #[maybe_async::maybe_async]
    async fn list_directory(&self, index: u64) -> Result<Vec<NtfsEntry>> {
        let (_, attrs) = self.record_attributes(index).await?;
        let root = attrs
            .iter()
            .find(|a| a.type_code == ATTR_INDEX_ROOT && a.name == "$I30")
            .ok_or_else(|| Error::NotFound(ctx!("ntfs", "record {index} has no $I30 index root")))?;
        let root_value = root
            .value
            .as_ref()
            .ok_or_else(|| Error::CorruptStructure(ctx!("ntfs", "$INDEX_ROOT must be resident")))?;
        if root_value.len() < 16 {
            return Err(Error::Truncated(ctx!("ntfs", "$INDEX_ROOT value too short")));
        }
        let mut entries = parse_index_entries(&root_value[16..])?;

        if let Some(alloc) = attrs.iter().find(|a| a.type_code == ATTR_INDEX_ALLOCATION && a.name == "$I30") {
            let runs = alloc
                .runs
                .clone()
                .ok_or_else(|| Error::CorruptStructure(ctx!("ntfs", "$INDEX_ALLOCATION must be non-resident")))?;
            let stream = build_runs_stream(&self.stream, &runs)?;
            let total = stream.len();
            let mut pos = 0u64;
            while pos + self.index_record_size <= total {
                let mut block = vec![0u8; self.index_record_size as usize];
                stream.read_at(pos, &mut block).await?;
                pos += self.index_record_size;
                if block.len() < 4 || &block[0..4] != b"INDX" {
                    continue; // unallocated index record
                }
                if apply_fixup(&mut block, self.bytes_per_sector).is_err() {
                    continue;
                }
                // MULTI_SECTOR_HEADER(8) + this-VCN(8) + INDEX_HEADER(16) follows.
                if block.len() < 24 {
                    continue;
                }
                entries.extend(parse_index_entries(&block[24..])?);
            }
        }

        entries.retain(|e| e.namespace != 2); // drop DOS-only 8.3 aliases
        Ok(entries)
    }

    #[maybe_async::maybe_async]
    async fn lookup(&self, path: &str) -> Result<(u64, bool, u64, FileAttributes, Timestamps)> {
        let components = split_path(path);
        if components.is_empty() {
            return Ok((ROOT_RECORD_INDEX, true, 0, FileAttributes::default().with(FileAttributes::DIRECTORY), Timestamps::default()));
        }

        let mut current_index = ROOT_RECORD_INDEX;
        let mut found_entry: Option<NtfsEntry> = None;
        for (i, component) in components.iter().enumerate() {
            let entries = self.list_directory(current_index).await?;
            let entry = entries
                .into_iter()
                .find(|e| diskit_fs::names_equal(&e.name, component, false))
                .ok_or_else(|| Error::NotFound(ctx!("ntfs", "path component {component:?} not found")))?;
            let is_last = i == components.len() - 1;
            if !is_last && !entry.is_directory() {
                return Err(Error::NotFound(ctx!("ntfs", "{component:?} is not a directory")));
            }
            current_index = entry.mft_reference;
            found_entry = Some(entry);
        }

        let entry = found_entry.expect("components non-empty");
        let times = Timestamps {
            created: entry.created,
            modified: entry.modified,
            accessed: entry.accessed,
        };
        Ok((current_index, entry.is_directory(), entry.real_size, entry.attributes(), times))
    }

    #[maybe_async::maybe_async]
    async fn open_named_stream(&self, index: u64, name: &str) -> Result<Arc<dyn SparseStream>> {
        let (_, attrs) = self.record_attributes(index).await?;
        let data = attrs
            .iter()
            .find(|a| a.type_code == ATTR_DATA && a.name == name)
            .ok_or_else(|| Error::NotFound(ctx!("ntfs", "no $DATA stream named {name:?}")))?;
        if let Some(runs) = &data.runs {
            let stream = build_runs_stream(&self.stream, runs)?;
            let len = stream.len();
            Ok(Arc::new(SubStream::new(stream, 0, data.data_size.min(len))?))
        } else {
            let value = data.value.clone().unwrap_or_default();
            Ok(Arc::new(InMemoryStream::new(value)))
        }
    }
}

fn record_size(clusters_or_log2: i8, bytes_per_cluster: u64) -> u64 {
    if clusters_or_log2 > 0 {
        clusters_or_log2 as u64 * bytes_per_cluster
    } else {
        1u64 << (-(clusters_or_log2 as i32)) as u64
    }
}

/// Applies the update sequence array in place: every protected sector's
/// last two bytes are checked against the stored USN and replaced with the
/// original bytes, undoing the fixup NTFS applies before each on-disk write.
fn apply_fixup(buf: &mut [u8], bytes_per_sector: u64) -> Result<()> {
    let header = MultiSectorHeader::read_from_bytes(&buf[..8])
        .map_err(|_| Error::Truncated(ctx!("ntfs", "multi-sector header short read")))?;
    let usa_offset = header.usa_offset.get() as usize;
    let usa_count = header.usa_count.get() as usize;
    if usa_count == 0 {
        return Ok(());
    }
    if usa_offset + usa_count * 2 > buf.len() {
        return Err(Error::Truncated(ctx!("ntfs", "update sequence array exceeds buffer")));
    }
    let usn = [buf[usa_offset], buf[usa_offset + 1]];
    for i in 0..usa_count.saturating_sub(1) {
        let sector_end = ((i + 1) * bytes_per_sector as usize).saturating_sub(2);
        if sector_end + 2 > buf.len() {
            break;
        }
        if buf[sector_end] != usn[0] || buf[sector_end + 1] != usn[1] {
            return Err(Error::CorruptStructure(ctx!("ntfs", "update sequence mismatch at sector {i}")));
        }
        let original_offset = usa_offset + 2 + i * 2;
        buf[sector_end] = buf[original_offset];
        buf[sector_end + 1] = buf[original_offset + 1];
    }
    Ok(())
}

fn read_le_unsigned(bytes: &[u8]) -> u64 {
    let mut value = 0u64;
    for (i, &b) in bytes.iter().enumerate() {
        value |= (b as u64) << (8 * i);
    }
    value
}

fn read_le_signed(bytes: &[u8]) -> i64 {
    let mut value = read_le_unsigned(bytes) as i64;
    if let Some(&last) = bytes.last() {
        if last & 0x80 != 0 {
            value -= 1i64 << (8 * bytes.len());
        }
    }
    value
}

/// Decodes an NTFS data-run (mapping pairs) list into absolute volume-byte
/// extents, honoring sparse runs (offset field length 0).
fn decode_run_list(mapping_pairs: &[u8], bytes_per_cluster: u64) -> Result<Vec<Run>> {
    let mut runs = Vec::new();
    let mut pos = 0usize;
    let mut current_lcn: i64 = 0;
    while pos < mapping_pairs.len() {
        let header = mapping_pairs[pos];
        if header == 0 {
            break;
        }
        pos += 1;
        let length_size = (header & 0x0F) as usize;
        let offset_size = (header >> 4) as usize;
        if pos + length_size > mapping_pairs.len() {
            return Err(Error::Truncated(ctx!("ntfs", "truncated run-list length field")));
        }
        let run_length = read_le_unsigned(&mapping_pairs[pos..pos + length_size]);
        pos += length_size;

        if offset_size == 0 {
            runs.push(Run::Sparse(run_length * bytes_per_cluster));
        } else {
            if pos + offset_size > mapping_pairs.len() {
                return Err(Error::Truncated(ctx!("ntfs", "truncated run-list offset field")));
            }
            let delta = read_le_signed(&mapping_pairs[pos..pos + offset_size]);
            pos += offset_size;
            current_lcn += delta;
            if current_lcn < 0 {
                return Err(Error::CorruptStructure(ctx!("ntfs", "run-list LCN went negative")));
            }
            runs.push(Run::Data(Extent::new(current_lcn as u64 * bytes_per_cluster, run_length * bytes_per_cluster)));
        }
    }
    Ok(runs)
}

fn build_runs_stream(base: &Arc<dyn SparseStream>, runs: &[Run]) -> Result<Arc<dyn SparseStream>> {
    let children = runs
        .iter()
        .map(|run| -> Result<Arc<dyn SparseStream>> {
            Ok(match run {
                Run::Data(extent) => Arc::new(SubStream::new(base.clone(), extent.offset, extent.length)?),
                Run::Sparse(length) => Arc::new(ZeroStream::new(*length)),
            })
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Arc::new(ConcatStream::new(children)))
}

/// Walks one file record's attribute list (after fixup), decoding
/// resident values in place and non-resident run lists into absolute
/// volume extents.
fn parse_attributes(record: &[u8], first_attribute_offset: u16, bytes_per_cluster: u64) -> Result<Vec<Attribute>> {
    let mut attrs = Vec::new();
    let mut offset = first_attribute_offset as usize;
    loop {
        if offset + 8 > record.len() {
            break;
        }
        let type_code = u32::from_le_bytes(record[offset..offset + 4].try_into().unwrap());
        if type_code == ATTR_END {
            break;
        }
        let record_length = u32::from_le_bytes(record[offset + 4..offset + 8].try_into().unwrap()) as usize;
        if record_length < 16 || offset + record_length > record.len() {
            return Err(Error::CorruptStructure(ctx!("ntfs", "attribute record length out of bounds")));
        }
        let attr = &record[offset..offset + record_length];
        let form_code = attr[8];
        let name_length = attr[9] as usize;
        let name_offset = u16::from_le_bytes(attr[10..12].try_into().unwrap()) as usize;
        let name = if name_length > 0 && name_offset + name_length * 2 <= attr.len() {
            let units: Vec<u16> = attr[name_offset..name_offset + name_length * 2]
                .chunks_exact(2)
                .map(|c| u16::from_le_bytes([c[0], c[1]]))
                .collect();
            diskit_bytes::decode_utf16le_nul(&units)
        } else {
            String::new()
        };

        if form_code == 0 {
            if attr.len() < 24 {
                return Err(Error::Truncated(ctx!("ntfs", "resident attribute header short read")));
            }
            let value_length = u32::from_le_bytes(attr[16..20].try_into().unwrap()) as usize;
            let value_offset = u16::from_le_bytes(attr[20..22].try_into().unwrap()) as usize;
            if value_offset + value_length > attr.len() {
                return Err(Error::Truncated(ctx!("ntfs", "resident attribute value out of bounds")));
            }
            let value = attr[value_offset..value_offset + value_length].to_vec();
            attrs.push(Attribute {
                type_code,
                name,
                value: Some(value),
                runs: None,
                data_size: value_length as u64,
            });
        } else {
            if attr.len() < 64 {
                return Err(Error::Truncated(ctx!("ntfs", "non-resident attribute header short read")));
            }
            let mapping_pairs_offset = u16::from_le_bytes(attr[32..34].try_into().unwrap()) as usize;
            let file_size = u64::from_le_bytes(attr[48..56].try_into().unwrap());
            if mapping_pairs_offset > attr.len() {
                return Err(Error::Truncated(ctx!("ntfs", "mapping pairs offset out of bounds")));
            }
            let runs = decode_run_list(&attr[mapping_pairs_offset..], bytes_per_cluster)?;
            attrs.push(Attribute {
                type_code,
                name,
                value: None,
                runs: Some(runs),
                data_size: file_size,
            });
        }

        offset += record_length;
    }
    Ok(attrs)
}

/// Parses one `INDEX_HEADER` (16 bytes: entries offset, index length,
/// allocated size, flags) plus the entries that follow it.
fn parse_index_entries(header_and_entries: &[u8]) -> Result<Vec<NtfsEntry>> {
    if header_and_entries.len() < 16 {
        return Err(Error::Truncated(ctx!("ntfs", "INDEX_HEADER short read")));
    }
    let entries_offset = u32::from_le_bytes(header_and_entries[0..4].try_into().unwrap()) as usize;
    let index_length = u32::from_le_bytes(header_and_entries[4..8].try_into().unwrap()) as usize;
    let bound = index_length.min(header_and_entries.len());

    let mut out = Vec::new();
    let mut pos = entries_offset;
    while pos + 16 <= bound {
        let entry = &header_and_entries[pos..];
        let entry_length = u16::from_le_bytes(entry[8..10].try_into().unwrap()) as usize;
        let key_length = u16::from_le_bytes(entry[10..12].try_into().unwrap()) as usize;
        let flags = u16::from_le_bytes(entry[12..14].try_into().unwrap());
        if entry_length < 16 || pos + entry_length > header_and_entries.len() {
            break;
        }
        let is_last = flags & INDEX_ENTRY_LAST != 0;
        if !is_last && key_length >= 66 {
            let mft_ref = u64::from_le_bytes(entry[0..8].try_into().unwrap());
            if let Some(parsed) = parse_file_name_key(&entry[16..16 + key_length], mft_ref) {
                out.push(parsed);
            }
        }
        if is_last {
            break;
        }
        pos += entry_length;
        let _ = flags & INDEX_ENTRY_SUBNODE; // subnode VCN ignored; flat scan covers every leaf.
    }
    Ok(out)
}

/// Parses a `$FILE_NAME` attribute value embedded as an index key.
fn parse_file_name_key(key: &[u8], mft_ref: u64) -> Option<NtfsEntry> {
    if key.len() < 66 {
        return None;
    }
    let created = ntfs_time(u64::from_le_bytes(key[8..16].try_into().ok()?));
    let modified = ntfs_time(u64::from_le_bytes(key[16..24].try_into().ok()?));
    let accessed = ntfs_time(u64::from_le_bytes(key[32..40].try_into().ok()?));
    let real_size = u64::from_le_bytes(key[48..56].try_into().ok()?);
    let flags = u32::from_le_bytes(key[56..60].try_into().ok()?);
    let name_length = key[64] as usize;
    let namespace = key[65];
    let name_bytes_len = name_length * 2;
    if 66 + name_bytes_len > key.len() {
        return None;
    }
    let name_units: Vec<u16> = key[66..66 + name_bytes_len]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let name = char::decode_utf16(name_units)
        .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
        .collect();
    Some(NtfsEntry {
        name,
        namespace,
        mft_reference: mft_ref & 0x0000_FFFF_FFFF_FFFF,
        flags,
        real_size,
        created,
        modified,
        accessed,
    })
}

/// Holds a resident attribute value (e.g. a small `$DATA` stream) as an
/// addressable stream without a round trip through the volume.
struct InMemoryStream(Vec<u8>);

impl InMemoryStream {
    fn new(data: Vec<u8>) -> Self {
        Self(data)
    }
}

#[maybe_async::maybe_async]
impl SparseStream for InMemoryStream {
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
            return Err(Error::Truncated(ctx!("ntfs", "resident stream read past end")));
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
        let (_, is_dir, size, attributes, times) = self.lookup(path).await?;
        Ok(DirEntry {
            name: split_path(path).pop().unwrap_or_default(),
            attributes,
            times,
            size,
            is_directory: is_dir,
            is_symlink: attributes.has(FileAttributes::REPARSE_POINT),
            stream_count: 1,
        })
    }

    async fn enumerate(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (index, ..) = self.lookup(path).await?;
        let entries = self.list_directory(index).await?;
        Ok(entries
            .into_iter()
            .map(|e| DirEntry {
                name: e.name.clone(),
                attributes: e.attributes(),
                times: Timestamps {
                    created: e.created,
                    modified: e.modified,
                    accessed: e.accessed,
                },
                size: e.real_size,
                is_directory: e.is_directory(),
                is_symlink: e.attributes().has(FileAttributes::REPARSE_POINT),
                stream_count: 1,
            })
            .filter(|e| {
                !((self.options.hide_hidden && e.attributes.has(FileAttributes::HIDDEN))
                    || (self.options.hide_system && e.attributes.has(FileAttributes::SYSTEM)))
            })
            .collect())
    }

    async fn open_file(&self, path: &str) -> Result<Arc<dyn SparseStream>> {
        let (index, is_dir, size, ..) = self.lookup(path).await?;
        if is_dir {
            return Err(Error::NotFound(ctx!("ntfs", "{path} is a directory")));
        }
        let (_, attrs) = self.record_attributes(index).await?;
        let data = attrs
            .iter()
            .find(|a| a.type_code == ATTR_DATA && a.name.is_empty())
            .ok_or_else(|| Error::NotFound(ctx!("ntfs", "no unnamed $DATA attribute")))?;
        if let Some(runs) = &data.runs {
            let stream = build_runs_stream(&self.stream, runs)?;
            let len = stream.len();
            Ok(Arc::new(SubStream::new(stream, 0, size.min(len))?))
        } else {
            Ok(Arc::new(InMemoryStream::new(data.value.clone().unwrap_or_default())))
        }
    }

    async fn path_to_extents(&self, path: &str) -> Result<Vec<Extent>> {
        let (index, ..) = self.lookup(path).await?;
        let (_, attrs) = self.record_attributes(index).await?;
        let data = attrs
            .iter()
            .find(|a| a.type_code == ATTR_DATA && a.name.is_empty())
            .ok_or_else(|| Error::NotFound(ctx!("ntfs", "no unnamed $DATA attribute")))?;
        Ok(data
            .runs
            .as_ref()
            .map(|runs| {
                runs.iter()
                    .filter_map(|r| match r {
                        Run::Data(e) => Some(*e),
                        Run::Sparse(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn read_link(&self, path: &str) -> Result<String> {
        let (index, ..) = self.lookup(path).await?;
        let (_, attrs) = self.record_attributes(index).await?;
        let reparse = attrs
            .iter()
            .find(|a| a.type_code == ATTR_REPARSE_POINT)
            .ok_or_else(|| Error::NotFound(ctx!("ntfs", "{path} has no reparse point")))?;
        let value = reparse
            .value
            .as_ref()
            .ok_or_else(|| Error::CorruptStructure(ctx!("ntfs", "$REPARSE_POINT must be resident")))?;
        if value.len() < 20 {
            return Err(Error::Truncated(ctx!("ntfs", "reparse buffer too short")));
        }
        let tag = u32::from_le_bytes(value[0..4].try_into().unwrap());
        if tag != IO_REPARSE_TAG_SYMLINK {
            return Err(Error::UnsupportedFeature(ctx!("ntfs", "reparse tag {tag:#x} is not a symbolic link")));
        }
        let substitute_name_offset = u16::from_le_bytes(value[8..10].try_into().unwrap()) as usize;
        let substitute_name_length = u16::from_le_bytes(value[10..12].try_into().unwrap()) as usize;
        let path_buffer_start = 20;
        let start = path_buffer_start + substitute_name_offset;
        let end = start + substitute_name_length;
        if end > value.len() {
            return Err(Error::Truncated(ctx!("ntfs", "reparse substitute name out of bounds")));
        }
        let units: Vec<u16> = value[start..end].chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        Ok(char::decode_utf16(units).map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER)).collect())
    }

    async fn unix_info(&self, _path: &str) -> Result<Option<UnixInfo>> {
        Ok(None)
    }

    async fn alternate_stream_names(&self, path: &str) -> Result<Vec<String>> {
        let (index, ..) = self.lookup(path).await?;
        let (_, attrs) = self.record_attributes(index).await?;
        Ok(attrs
            .iter()
            .filter(|a| a.type_code == ATTR_DATA && !a.name.is_empty())
            .map(|a| a.name.clone())
            .collect())
    }

    async fn open_alternate_stream(&self, path: &str, name: &str) -> Result<Arc<dyn SparseStream>> {
        let (index, ..) = self.lookup(path).await?;
        self.open_named_stream(index, name).await
    }
}

#[allow(dead_code)]
fn attribute_is_named(attr: &Attribute) -> bool {
    !attr.name.is_empty() && attr.is_resident()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_size_from_positive_cluster_count() {
        assert_eq!(record_size(2, 4096), 8192);
    }

    #[test]
    fn record_size_from_negative_log2() {
        assert_eq!(record_size(-10, 4096), 1024);
    }

    #[test]
    fn ntfs_time_zero_is_none() {
        assert!(ntfs_time(0).is_none());
    }

    #[test]
    fn run_list_decodes_single_data_run() {
        // header 0x21: length field 1 byte, offset field 2 bytes.
        let mapping = [0x21, 0x10, 0x64, 0x00]; // length=0x10 clusters, LCN delta=0x0064
        let runs = decode_run_list(&mapping, 4096).unwrap();
        assert_eq!(runs.len(), 1);
        match &runs[0] {
            Run::Data(e) => {
                assert_eq!(e.offset, 0x64 * 4096);
                assert_eq!(e.length, 0x10 * 4096);
            }
            Run::Sparse(_) => panic!("expected data run"),
        }
    }

    #[test]
    fn run_list_decodes_sparse_run() {
        let mapping = [0x01, 0x08]; // offset field size 0 -> sparse, length=8 clusters
        let runs = decode_run_list(&mapping, 4096).unwrap();
        assert_eq!(runs.len(), 1);
        match &runs[0] {
            Run::Sparse(len) => assert_eq!(*len, 8 * 4096),
            Run::Data(_) => panic!("expected sparse run"),
        }
    }

    #[test]
    fn translate_attributes_maps_reparse_and_directory_bits() {
        let attrs = translate_attributes(0x0400, true);
        assert!(attrs.has(FileAttributes::REPARSE_POINT));
        assert!(attrs.has(FileAttributes::DIRECTORY));
    }
}
