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

//! HFS+ / HFSX reader.
//!
//! Every multi-byte field on an HFS+ volume is big-endian. The catalog and
//! extents-overflow files are themselves B-trees addressed through their own
//! fork data in the volume header, so reading either one is: resolve its
//! fork to extents, address the resulting stream in node-size chunks, walk
//! down from the header node's root pointer.

use std::sync::Arc;

use diskit_err::{ctx, Error, Result};
use diskit_fs::{split_path, DirEntry, FileAttributes, FileSystemReader, ReaderOptions, Timestamps, UnixInfo};
use diskit_stream::{ConcatStream, Extent, SparseStream, SubStream};
use zerocopy::{
    big_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

const SIGNATURE_HFSPLUS: u16 = 0x482B;
const SIGNATURE_HFSX: u16 = 0x4858;
const ROOT_FOLDER_ID: u32 = 2;

const NODE_TYPE_LEAF: i8 = -1;
const NODE_TYPE_INDEX: i8 = 0;

const RECORD_TYPE_FOLDER: i16 = 1;
const RECORD_TYPE_FILE: i16 = 2;
const RECORD_TYPE_FOLDER_THREAD: i16 = 3;
const RECORD_TYPE_FILE_THREAD: i16 = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawExtentDescriptor {
    start_block: U32,
    block_count: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawForkData {
    logical_size: U64,
    clump_size: U32,
    total_blocks: U32,
    extents: [RawExtentDescriptor; 8],
}

const _: () = assert!(std::mem::size_of::<RawForkData>() == 80);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawVolumeHeader {
    signature: U16,
    version: U16,
    attributes: U32,
    last_mounted_version: U32,
    journal_info_block: U32,
    create_date: U32,
    modify_date: U32,
    backup_date: U32,
    checked_date: U32,
    file_count: U32,
    folder_count: U32,
    block_size: U32,
    total_blocks: U32,
    free_blocks: U32,
    next_allocation: U32,
    rsrc_clump_size: U32,
    data_clump_size: U32,
    next_catalog_id: U32,
    write_count: U32,
    encodings_bitmap: U64,
    finder_info: [U32; 8],
    allocation_file: RawForkData,
    extents_file: RawForkData,
    catalog_file: RawForkData,
    attributes_file: RawForkData,
    startup_file: RawForkData,
}

const _: () = assert!(std::mem::size_of::<RawVolumeHeader>() == 512);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct BTNodeDescriptor {
    next_node: U32,
    prev_node: U32,
    node_type: i8,
    height: i8,
    num_records: U16,
    reserved: U16,
}

const _: () = assert!(std::mem::size_of::<BTNodeDescriptor>() == 14);

struct CatalogEntry {
    parent_id: u32,
    name: String,
    is_folder: bool,
    cnid: u32,
    file_size: u64,
    create_date: u32,
    content_mod_date: u32,
    access_date: u32,
    permissions_mode: u16,
    permissions_owner: u32,
    permissions_group: u32,
    data_fork: Option<RawForkData>,
}

pub struct Reader {
    stream: Arc<dyn SparseStream>,
    block_size: u64,
    node_size: u64,
    catalog_stream: Arc<dyn SparseStream>,
    extents_overflow_stream: Arc<dyn SparseStream>,
    options: ReaderOptions,
}

impl Reader {
    #[maybe_async::maybe_async]
    pub async fn detect(stream: &dyn SparseStream) -> bool {
        let mut header = [0u8; 2];
        if stream.read_at(1024, &mut header).await.is_err() {
            return false;
        }
        let sig = u16::from_be_bytes(header);
        sig == SIGNATURE_HFSPLUS || sig == SIGNATURE_HFSX
    }

    #[maybe_async::maybe_async]
    pub async fn mount(stream: Arc<dyn SparseStream>, options: ReaderOptions) -> Result<Self> {
        let mut raw = [0u8; 512];
        stream.read_at(1024, &mut raw).await?;
        let header = RawVolumeHeader::read_from_bytes(&raw)
            .map_err(|_| Error::Truncated(ctx!("hfsplus", "volume header short read")))?;
        if header.signature.get() != SIGNATURE_HFSPLUS && header.signature.get() != SIGNATURE_HFSX {
            return Err(Error::BadMagic(ctx!("hfsplus", "missing HFS+/HFSX volume signature")));
        }
        let block_size = header.block_size.get() as u64;
        if block_size == 0 {
            return Err(Error::CorruptStructure(ctx!("hfsplus", "degenerate allocation block size")));
        }

        let catalog_stream = build_fork_stream(&stream, &header.catalog_file, block_size)?;
        let extents_overflow_stream = build_fork_stream(&stream, &header.extents_file, block_size)?;
        let node_size = read_node_size(&catalog_stream).await?;

        log::debug!("mounted hfs+ volume, block size {block_size}, catalog node size {node_size}");
        Ok(Self { stream, block_size, node_size, catalog_stream, extents_overflow_stream, options })
    }

    /// Looks up all extra extent records for `(cnid, is_resource)` beyond
    /// the 8 initial extents stored directly in the fork data.
    #[maybe_async::maybe_async]
    async fn overflow_extents(&self, cnid: u32, start_block: u32) -> Result<Vec<RawExtentDescriptor>> {
        let node_size = read_node_size(&self.extents_overflow_stream).await?;
        let leaves = collect_leaf_records(&self.extents_overflow_stream, node_size).await?;
        let mut out = Vec::new();
        for (key, value) in leaves {
            if key.len() < 10 {
                continue;
            }
            let key_file_id = u32::from_be_bytes(key[2..6].try_into().unwrap());
            let key_start = u32::from_be_bytes(key[6..10].try_into().unwrap());
            if key_file_id == cnid && key_start >= start_block {
                for chunk in value.chunks_exact(8) {
                    let desc = RawExtentDescriptor::read_from_bytes(chunk)
                        .map_err(|_| Error::Truncated(ctx!("hfsplus", "extent descriptor short read")))?;
                    if desc.block_count.get() > 0 {
                        out.push(*desc);
                    }
                }
            }
        }
        Ok(out)
    }

    #[maybe_async::maybe_async]
    async fn fork_to_stream(&self, fork: &RawForkData, cnid: u32) -> Result<Arc<dyn SparseStream>> {
        let mut extents: Vec<(u32, Extent)> = Vec::new();
        let mut logical_block = 0u32;
        for desc in &fork.extents {
            if desc.block_count.get() == 0 {
                continue;
            }
            extents.push((
                logical_block,
                Extent::new(desc.start_block.get() as u64 * self.block_size, desc.block_count.get() as u64 * self.block_size),
            ));
            logical_block += desc.block_count.get();
        }
        let declared_blocks = fork.total_blocks.get();
        if logical_block < declared_blocks {
            for desc in self.overflow_extents(cnid, logical_block).await? {
                extents.push((
                    logical_block,
                    Extent::new(desc.start_block.get() as u64 * self.block_size, desc.block_count.get() as u64 * self.block_size),
                ));
                logical_block += desc.block_count.get();
            }
        }
        let children: Vec<Arc<dyn SparseStream>> = extents
            .into_iter()
            .map(|(_, e)| -> Result<Arc<dyn SparseStream>> { Ok(Arc::new(SubStream::new(self.stream.clone(), e.offset, e.length)?)) })
            .collect::<Result<_>>()?;
        let concat = ConcatStream::new(children);
        let total = concat.len();
        Ok(Arc::new(SubStream::new(Arc::new(concat) as Arc<dyn SparseStream>, 0, fork.logical_size.get().min(total))?))
    }

    #[maybe_async::maybe_async]
    async fn catalog_entries(&self) -> Result<Vec<CatalogEntry>> {
        let leaves = collect_leaf_records(&self.catalog_stream, self.node_size).await?;
        let mut entries = Vec::new();
        for (key, value) in leaves {
            if key.len() < 6 || value.len() < 2 {
                continue;
            }
            let parent_id = u32::from_be_bytes(key[2..6].try_into().unwrap());
            let name_len = u16::from_be_bytes(key[6..8].try_into().unwrap()) as usize;
            let name_units: Vec<u16> = key[8..8 + name_len * 2].chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
            let name: String = char::decode_utf16(name_units).map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER)).collect();

            let record_type = i16::from_be_bytes(value[0..2].try_into().unwrap());
            match record_type {
                RECORD_TYPE_FOLDER if value.len() >= 88 => {
                    let cnid = u32::from_be_bytes(value[8..12].try_into().unwrap());
                    let create_date = u32::from_be_bytes(value[12..16].try_into().unwrap());
                    let content_mod_date = u32::from_be_bytes(value[16..20].try_into().unwrap());
                    let access_date = u32::from_be_bytes(value[20..24].try_into().unwrap());
                    entries.push(CatalogEntry {
                        parent_id,
                        name,
                        is_folder: true,
                        cnid,
                        file_size: 0,
                        create_date,
                        content_mod_date,
                        access_date,
                        permissions_mode: 0,
                        permissions_owner: 0,
                        permissions_group: 0,
                        data_fork: None,
                    });
                }
                RECORD_TYPE_FILE if value.len() >= 248 => {
                    let cnid = u32::from_be_bytes(value[8..12].try_into().unwrap());
                    let create_date = u32::from_be_bytes(value[12..16].try_into().unwrap());
                    let content_mod_date = u32::from_be_bytes(value[16..20].try_into().unwrap());
                    let access_date = u32::from_be_bytes(value[20..24].try_into().unwrap());
                    // BSD info at offset 48: owner(4) group(4) mode-field(4, low 16 bits = perms)
                    let owner = u32::from_be_bytes(value[48..52].try_into().unwrap());
                    let group = u32::from_be_bytes(value[52..56].try_into().unwrap());
                    let mode = u16::from_be_bytes(value[58..60].try_into().unwrap());
                    let data_fork = RawForkData::read_from_bytes(&value[88..168])
                        .copied()
                        .map_err(|_| Error::Truncated(ctx!("hfsplus", "file data fork short read")))?;
                    entries.push(CatalogEntry {
                        parent_id,
                        name,
                        is_folder: false,
                        cnid,
                        file_size: data_fork.logical_size.get(),
                        create_date,
                        content_mod_date,
                        access_date,
                        permissions_mode: mode,
                        permissions_owner: owner,
                        permissions_group: group,
                        data_fork: Some(data_fork),
                    });
                }
                RECORD_TYPE_FOLDER_THREAD | RECORD_TYPE_FILE_THREAD => {} // skip; reconstructed from forward records instead
                _ => {}
            }
        }
        Ok(entries)
    }

    #[maybe_async::maybe_async]
    async fn list_directory(&self, folder_id: u32) -> Result<Vec<CatalogEntry>> {
        let entries = self.catalog_entries().await?;
        Ok(entries.into_iter().filter(|e| e.parent_id == folder_id).collect())
    }

    #[maybe_async::maybe_async]
    async fn lookup(&self, path: &str) -> Result<CatalogEntry> {
        let components = split_path(path);
        if components.is_empty() {
            return Ok(CatalogEntry {
                parent_id: 0,
                name: String::new(),
                is_folder: true,
                cnid: ROOT_FOLDER_ID,
                file_size: 0,
                create_date: 0,
                content_mod_date: 0,
                access_date: 0,
                permissions_mode: 0,
                permissions_owner: 0,
                permissions_group: 0,
                data_fork: None,
            });
        }
        let mut current_id = ROOT_FOLDER_ID;
        let mut found: Option<CatalogEntry> = None;
        for (i, component) in components.iter().enumerate() {
            let entries = self.list_directory(current_id).await?;
            let entry = entries
                .into_iter()
                .find(|e| e.name == *component)
                .ok_or_else(|| Error::NotFound(ctx!("hfsplus", "path component {component:?} not found")))?;
            let is_last = i == components.len() - 1;
            if !is_last && !entry.is_folder {
                return Err(Error::NotFound(ctx!("hfsplus", "{component:?} is not a folder")));
            }
            current_id = entry.cnid;
            found = Some(entry);
        }
        Ok(found.expect("components non-empty"))
    }
}

fn build_fork_stream(base: &Arc<dyn SparseStream>, fork: &RawForkData, block_size: u64) -> Result<Arc<dyn SparseStream>> {
    let children: Vec<Arc<dyn SparseStream>> = fork
        .extents
        .iter()
        .filter(|d| d.block_count.get() > 0)
        .map(|d| -> Result<Arc<dyn SparseStream>> {
            Ok(Arc::new(SubStream::new(
                base.clone(),
                d.start_block.get() as u64 * block_size,
                d.block_count.get() as u64 * block_size,
            )?))
        })
        .collect::<Result<_>>()?;
    let concat = ConcatStream::new(children);
    let total = concat.len();
    Ok(Arc::new(SubStream::new(Arc::new(concat) as Arc<dyn SparseStream>, 0, fork.logical_size.get().min(total))?))
}

#[maybe_async::maybe_async]
async fn read_node_size(btree_stream: &Arc<dyn SparseStream>) -> Result<u64> {
    // Node 0 (the header node): a 14-byte BTNodeDescriptor followed by a
    // BTHeaderRec (treeDepth:u16, rootNode:u32, leafRecords:u32,
    // firstLeafNode:u32, lastLeafNode:u32, nodeSize:u16, ...); nodeSize sits
    // at byte 32.
    let mut buf = [0u8; 36];
    btree_stream.read_at(0, &mut buf).await?;
    let node_size = u16::from_be_bytes(buf[32..34].try_into().unwrap());
    if node_size == 0 {
        return Err(Error::CorruptStructure(ctx!("hfsplus", "B-tree header reports zero node size")));
    }
    Ok(node_size as u64)
}

/// Scans every node in a B-tree, descending from the header node's root
/// pointer, collecting every leaf record as `(key_bytes, value_bytes)`.
#[maybe_async::maybe_async]
async fn collect_leaf_records(btree_stream: &Arc<dyn SparseStream>, node_size: u64) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut header_node = vec![0u8; node_size as usize];
    btree_stream.read_at(0, &mut header_node).await?;
    // BTHeaderRec.root_node is at offset 14 (after the 14-byte node descriptor) + 2 (tree_depth)
    let root_node = u32::from_be_bytes(header_node[16..20].try_into().unwrap());

    let mut records = Vec::new();
    if root_node == 0 {
        return Ok(records); // empty tree
    }
    let mut pending = vec![root_node as u64];
    let mut visited = std::collections::HashSet::new();
    while let Some(node_index) = pending.pop() {
        if !visited.insert(node_index) {
            continue; // cycle guard
        }
        let mut node = vec![0u8; node_size as usize];
        btree_stream.read_at(node_index * node_size, &mut node).await?;
        let descriptor = BTNodeDescriptor::read_from_bytes(&node[..14])
            .map_err(|_| Error::Truncated(ctx!("hfsplus", "B-tree node descriptor short read")))?;
        let num_records = descriptor.num_records.get() as usize;
        if num_records == 0 {
            continue;
        }

        let mut offsets = Vec::with_capacity(num_records + 1);
        for i in 0..=num_records {
            let pos = node.len() - (i + 1) * 2;
            offsets.push(u16::from_be_bytes(node[pos..pos + 2].try_into().unwrap()) as usize);
        }

        for i in 0..num_records {
            let start = offsets[i];
            let end = offsets[i + 1];
            if start >= end || end > node.len() {
                continue;
            }
            let record = &node[start..end];
            if record.len() < 2 {
                continue;
            }
            let key_len = u16::from_be_bytes(record[0..2].try_into().unwrap()) as usize;
            let key_end = 2 + key_len;
            if key_end > record.len() {
                continue;
            }
            let key = record[2..key_end].to_vec();
            // Records are padded to even length; the value begins immediately
            // after the (possibly padded) key.
            let value_start = if key_end % 2 == 0 { key_end } else { key_end + 1 };

            if descriptor.node_type == NODE_TYPE_INDEX && value_start + 4 <= record.len() {
                let child = u32::from_be_bytes(record[value_start..value_start + 4].try_into().unwrap());
                pending.push(child as u64);
            } else if descriptor.node_type == NODE_TYPE_LEAF {
                records.push((key, record[value_start.min(record.len())..].to_vec()));
            }
        }
    }
    Ok(records)
}

fn hfs_time(seconds: u32) -> Option<time::OffsetDateTime> {
    if seconds == 0 {
        return None;
    }
    // HFS+ epoch is 1904-01-01, unlike Unix's 1970-01-01.
    let epoch = time::PrimitiveDateTime::new(
        time::Date::from_calendar_date(1904, time::Month::January, 1).ok()?,
        time::Time::MIDNIGHT,
    )
    .assume_utc();
    epoch.checked_add(time::Duration::seconds(seconds as i64))
}

fn attributes_for(entry: &CatalogEntry) -> FileAttributes {
    let mut bits = 0u32;
    if entry.is_folder {
        bits |= FileAttributes::DIRECTORY;
    }
    if !entry.is_folder && (entry.permissions_mode & 0o170000) == 0o120000 {
        bits |= FileAttributes::SYMLINK;
    }
    FileAttributes(bits)
}

fn to_dir_entry(entry: &CatalogEntry) -> DirEntry {
    DirEntry {
        name: entry.name.clone(),
        attributes: attributes_for(entry),
        times: Timestamps {
            created: hfs_time(entry.create_date),
            modified: hfs_time(entry.content_mod_date),
            accessed: hfs_time(entry.access_date),
        },
        size: entry.file_size,
        is_directory: entry.is_folder,
        is_symlink: attributes_for(entry).has(FileAttributes::SYMLINK),
        stream_count: 1,
    }
}

#[maybe_async::maybe_async]
impl FileSystemReader for Reader {
    fn case_sensitive(&self) -> bool {
        true
    }

    async fn stat(&self, path: &str) -> Result<DirEntry> {
        let entry = self.lookup(path).await?;
        Ok(to_dir_entry(&entry))
    }

    async fn enumerate(&self, path: &str) -> Result<Vec<DirEntry>> {
        let entry = self.lookup(path).await?;
        if !entry.is_folder {
            return Err(Error::NotFound(ctx!("hfsplus", "{path} is not a folder")));
        }
        let children = self.list_directory(entry.cnid).await?;
        Ok(children
            .iter()
            .map(to_dir_entry)
            .filter(|e| !(self.options.hide_hidden && e.name.starts_with('.')))
            .collect())
    }

    async fn open_file(&self, path: &str) -> Result<Arc<dyn SparseStream>> {
        let entry = self.lookup(path).await?;
        let fork = entry
            .data_fork
            .ok_or_else(|| Error::NotFound(ctx!("hfsplus", "{path} is a folder")))?;
        self.fork_to_stream(&fork, entry.cnid).await
    }

    async fn path_to_extents(&self, path: &str) -> Result<Vec<Extent>> {
        let entry = self.lookup(path).await?;
        let fork = entry
            .data_fork
            .ok_or_else(|| Error::NotFound(ctx!("hfsplus", "{path} is a folder")))?;
        Ok(fork
            .extents
            .iter()
            .filter(|d| d.block_count.get() > 0)
            .map(|d| Extent::new(d.start_block.get() as u64 * self.block_size, d.block_count.get() as u64 * self.block_size))
            .collect())
    }

    async fn unix_info(&self, path: &str) -> Result<Option<UnixInfo>> {
        let entry = self.lookup(path).await?;
        Ok(Some(UnixInfo {
            uid: entry.permissions_owner,
            gid: entry.permissions_group,
            mode: entry.permissions_mode as u32 & 0x0FFF,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hfs_epoch_offsets_from_1904() {
        let dt = hfs_time(1).unwrap();
        assert_eq!(dt.year(), 1904);
    }

    #[test]
    fn zero_timestamp_is_none() {
        assert!(hfs_time(0).is_none());
    }

    #[test]
    fn symlink_mode_bits_detected() {
        let entry = CatalogEntry {
            parent_id: 2,
            name: "link".into(),
            is_folder: false,
            cnid: 10,
            file_size: 0,
            create_date: 0,
            content_mod_date: 0,
            access_date: 0,
            permissions_mode: 0o120755,
            permissions_owner: 0,
            permissions_group: 0,
            data_fork: None,
        };
        assert!(attributes_for(&entry).has(FileAttributes::SYMLINK));
    }
}
