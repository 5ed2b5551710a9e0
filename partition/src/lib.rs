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

//! MBR and GPT partition table readers.
//!
//! [`read_partition_table`] sniffs the boot sector: a GPT protective MBR
//! (a single type-`0xEE` entry spanning the disk) hands off to the GPT
//! header/entry-array reader, anything else is read as a plain MBR,
//! following `0x05`/`0x0F` extended-partition chains. Either path gives back
//! [`PartitionEntry`] records a caller windows into sub-streams with
//! [`diskit_stream::SubStream`].

use diskit_bytes::{crc32, decode_utf16le_nul};
use diskit_err::{ctx, Error, Result};
use diskit_stream::SparseStream;
use uuid::Uuid;
use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

const MBR_SIGNATURE: u16 = 0xAA55;
const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";

const EXTENDED_CHS: u8 = 0x05;
const EXTENDED_LBA: u8 = 0x0F;
const GPT_PROTECTIVE: u8 = 0xEE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionType {
    Mbr(u8),
    Gpt(Uuid),
}

#[derive(Debug, Clone)]
pub struct PartitionEntry {
    pub index: usize,
    pub partition_type: PartitionType,
    pub start_lba: u64,
    pub sector_count: u64,
    pub bootable: bool,
    pub unique_id: Option<Uuid>,
    pub name: Option<String>,
}

impl PartitionEntry {
    pub fn byte_range(&self, sector_size: u64) -> (u64, u64) {
        (self.start_lba * sector_size, self.sector_count * sector_size)
    }
}

#[derive(Debug, Clone)]
pub struct GptInfo {
    pub disk_guid: Uuid,
    pub entries: Vec<PartitionEntry>,
    /// Set when the backup header/entry-array disagrees with the primary
    /// (or is unreadable). The primary always wins; this is surfaced purely
    /// as a diagnostic.
    pub backup_out_of_sync: bool,
}

#[derive(Debug, Clone)]
pub enum PartitionTable {
    Mbr(Vec<PartitionEntry>),
    Gpt(GptInfo),
}

impl PartitionTable {
    pub fn entries(&self) -> &[PartitionEntry] {
        match self {
            PartitionTable::Mbr(entries) => entries,
            PartitionTable::Gpt(info) => &info.entries,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawMbrEntry {
    status: u8,
    chs_first: [u8; 3],
    partition_type: u8,
    chs_last: [u8; 3],
    lba_first: U32,
    sector_count: U32,
}

const _: () = assert!(std::mem::size_of::<RawMbrEntry>() == 16);

fn parse_mbr_entries(bytes: &[u8]) -> Result<Vec<RawMbrEntry>> {
    bytes
        .chunks_exact(16)
        .enumerate()
        .map(|(i, chunk)| {
            RawMbrEntry::read_from_bytes(chunk)
                .map_err(|_| Error::Truncated(ctx!("mbr", "partition entry {i} short read")))
        })
        .collect()
}

/// Reads whichever partition table the first sector describes.
#[maybe_async::maybe_async]
pub async fn read_partition_table(raw: &dyn SparseStream, sector_size: u64) -> Result<PartitionTable> {
    let mut boot_sector = vec![0u8; sector_size.max(512) as usize];
    raw.read_at(0, &mut boot_sector).await?;

    let signature = u16::from_le_bytes([boot_sector[510], boot_sector[511]]);
    if signature != MBR_SIGNATURE {
        return Err(Error::BadMagic(ctx!("partition", "missing 0x55AA boot sector signature")));
    }

    let mbr_entries = parse_mbr_entries(&boot_sector[446..510])?;
    if mbr_entries.iter().any(|e| e.partition_type == GPT_PROTECTIVE) {
        return read_gpt(raw, sector_size).await;
    }

    let mut entries = Vec::new();
    for (i, entry) in mbr_entries.iter().enumerate() {
        if entry.partition_type == 0 {
            continue;
        }
        entries.push(PartitionEntry {
            index: i,
            partition_type: PartitionType::Mbr(entry.partition_type),
            start_lba: entry.lba_first.get() as u64,
            sector_count: entry.sector_count.get() as u64,
            bootable: entry.status & 0x80 != 0,
            unique_id: None,
            name: None,
        });
        if entry.partition_type == EXTENDED_CHS || entry.partition_type == EXTENDED_LBA {
            let chain_base = entry.lba_first.get() as u64;
            let extended = walk_extended_chain(raw, sector_size, chain_base, chain_base).await?;
            entries.extend(extended);
        }
    }
    Ok(PartitionTable::Mbr(entries))
}

/// Walks an extended-partition chain: each EBR's first entry is the logical
/// volume, the second (if present) points at the next EBR, relative to
/// `chain_base` (the first extended partition's start LBA).
#[maybe_async::maybe_async]
async fn walk_extended_chain(
    raw: &dyn SparseStream,
    sector_size: u64,
    chain_base: u64,
    ebr_lba: u64,
) -> Result<Vec<PartitionEntry>> {
    let mut out = Vec::new();
    let mut next_ebr = Some(ebr_lba);
    let mut guard = 0;
    while let Some(lba) = next_ebr {
        guard += 1;
        if guard > 1024 {
            return Err(Error::CorruptStructure(ctx!(
                "mbr",
                "extended partition chain too long, likely cyclic"
            )));
        }
        let mut sector = vec![0u8; sector_size as usize];
        raw.read_at(lba * sector_size, &mut sector).await?;
        if u16::from_le_bytes([sector[510], sector[511]]) != MBR_SIGNATURE {
            return Err(Error::BadMagic(ctx!(
                "mbr",
                "extended boot record missing signature at lba {lba}"
            )));
        }
        let entries = parse_mbr_entries(&sector[446..510])?;
        if entries[0].partition_type != 0 {
            out.push(PartitionEntry {
                index: out.len() + 4,
                partition_type: PartitionType::Mbr(entries[0].partition_type),
                start_lba: lba + entries[0].lba_first.get() as u64,
                sector_count: entries[0].sector_count.get() as u64,
                bootable: entries[0].status & 0x80 != 0,
                unique_id: None,
                name: None,
            });
        }
        next_ebr = if entries[1].partition_type == EXTENDED_CHS || entries[1].partition_type == EXTENDED_LBA {
            Some(chain_base + entries[1].lba_first.get() as u64)
        } else {
            None
        };
    }
    Ok(out)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawGptHeader {
    signature: [u8; 8],
    revision: U32,
    header_size: U32,
    header_crc32: U32,
    reserved: U32,
    my_lba: U64,
    alternate_lba: U64,
    first_usable_lba: U64,
    last_usable_lba: U64,
    disk_guid: [u8; 16],
    partition_entry_lba: U64,
    num_partition_entries: U32,
    size_of_partition_entry: U32,
    partition_entry_array_crc32: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawGptEntry {
    type_guid: [u8; 16],
    unique_guid: [u8; 16],
    starting_lba: U64,
    ending_lba: U64,
    attributes: U64,
    name: [U16; 36],
}

/// GPT GUIDs store the first three fields little-endian and the last two
/// (clock-seq + node) big-endian, the mixed layout `Uuid::from_fields`
/// expects.
fn guid_from_mixed_endian(bytes: [u8; 16]) -> Uuid {
    let d1 = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let d2 = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
    let d3 = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
    let d4: [u8; 8] = bytes[8..16].try_into().unwrap();
    Uuid::from_fields(d1, d2, d3, &d4)
}

#[maybe_async::maybe_async]
async fn read_gpt_header_and_entries(
    raw: &dyn SparseStream,
    sector_size: u64,
    header_lba: u64,
) -> Result<(RawGptHeader, Vec<RawGptEntry>)> {
    let mut header_bytes = vec![0u8; sector_size as usize];
    raw.read_at(header_lba * sector_size, &mut header_bytes).await?;
    let mut header = RawGptHeader::read_from_bytes(&header_bytes[..std::mem::size_of::<RawGptHeader>()])
        .map_err(|_| Error::Truncated(ctx!("gpt", "header short read")))?;
    if &header.signature != GPT_SIGNATURE {
        return Err(Error::BadMagic(ctx!("gpt", "header signature mismatch at lba {header_lba}")));
    }
    let stored_crc = header.header_crc32.get();
    let header_size = header.header_size.get() as usize;
    header.header_crc32 = U32::new(0);
    let mut header_region = header.as_bytes().to_vec();
    header_region.resize(header_size, 0);
    if crc32(&header_region) != stored_crc {
        return Err(Error::ChecksumMismatch(ctx!("gpt", "header crc32 at lba {header_lba}")));
    }
    header.header_crc32 = U32::new(stored_crc);

    let entry_count = header.num_partition_entries.get() as usize;
    let entry_size = header.size_of_partition_entry.get() as usize;
    let mut entry_bytes = vec![0u8; entry_count * entry_size];
    raw.read_at(header.partition_entry_lba.get() * sector_size, &mut entry_bytes)
        .await?;
    if crc32(&entry_bytes) != header.partition_entry_array_crc32.get() {
        return Err(Error::ChecksumMismatch(ctx!("gpt", "partition entry array crc32")));
    }

    let mut entries = Vec::with_capacity(entry_count);
    for chunk in entry_bytes.chunks_exact(entry_size) {
        let entry = RawGptEntry::read_from_bytes(&chunk[..std::mem::size_of::<RawGptEntry>()])
            .map_err(|_| Error::Truncated(ctx!("gpt", "partition entry short read")))?;
        entries.push(entry);
    }
    Ok((header, entries))
}

#[maybe_async::maybe_async]
async fn read_gpt(raw: &dyn SparseStream, sector_size: u64) -> Result<PartitionTable> {
    let primary = read_gpt_header_and_entries(raw, sector_size, 1).await?;

    let total_sectors = raw.len() / sector_size;
    let backup_lba = primary.0.alternate_lba.get().min(total_sectors.saturating_sub(1));
    let backup = read_gpt_header_and_entries(raw, sector_size, backup_lba).await;

    let backup_out_of_sync = match &backup {
        Ok((backup_header, backup_entries)) => {
            backup_header.partition_entry_array_crc32.get() != primary.0.partition_entry_array_crc32.get()
                || backup_entries.len() != primary.1.len()
        }
        Err(e) => {
            log::warn!("gpt backup header unreadable: {e}");
            true
        }
    };

    let disk_guid = guid_from_mixed_endian(primary.0.disk_guid);
    let entries = primary
        .1
        .iter()
        .enumerate()
        .filter(|(_, e)| e.type_guid != [0u8; 16])
        .map(|(i, e)| PartitionEntry {
            index: i,
            partition_type: PartitionType::Gpt(guid_from_mixed_endian(e.type_guid)),
            start_lba: e.starting_lba.get(),
            sector_count: e.ending_lba.get().saturating_sub(e.starting_lba.get()) + 1,
            bootable: false,
            unique_id: Some(guid_from_mixed_endian(e.unique_guid)),
            name: Some(decode_gpt_name(&e.name)),
        })
        .collect();

    Ok(PartitionTable::Gpt(GptInfo {
        disk_guid,
        entries,
        backup_out_of_sync,
    }))
}

fn decode_gpt_name(units: &[U16; 36]) -> String {
    let units: Vec<u16> = units.iter().map(|u| u.get()).collect();
    decode_utf16le_nul(&units)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Mem(Vec<u8>);

    #[maybe_async::maybe_async]
    impl SparseStream for Mem {
        fn len(&self) -> u64 {
            self.0.len() as u64
        }
        async fn extents(&self) -> Result<diskit_stream::ExtentSet> {
            Ok(diskit_stream::ExtentSet::single(0, self.0.len() as u64))
        }
        async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            buf.copy_from_slice(&self.0[offset as usize..offset as usize + buf.len()]);
            Ok(())
        }
    }

    fn run<T>(result: T) -> T {
        result
    }

    #[test]
    fn mbr_single_partition_parses() {
        let mut sector = vec![0u8; 512];
        let entry = RawMbrEntry {
            status: 0x80,
            chs_first: [0, 1, 1],
            partition_type: 0x0C,
            chs_last: [0, 0, 0],
            lba_first: U32::new(2048),
            sector_count: U32::new(204800),
        };
        sector[446..462].copy_from_slice(entry.as_bytes());
        sector[510] = 0x55;
        sector[511] = 0xAA;
        let raw = Mem(sector);
        let table = run(read_partition_table(&raw, 512)).unwrap();
        let entries = table.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].start_lba, 2048);
        assert!(entries[0].bootable);
        assert_eq!(entries[0].partition_type, PartitionType::Mbr(0x0C));
    }

    #[test]
    fn missing_signature_rejected() {
        let sector = vec![0u8; 512];
        let raw = Mem(sector);
        assert!(run(read_partition_table(&raw, 512)).is_err());
    }
}
