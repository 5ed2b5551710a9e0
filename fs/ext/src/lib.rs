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

//! ext2/3/4 reader.
//!
//! Inode content resolves through one of three schemes depending on flags:
//! a fast symlink embedded in the inode body, an extent tree (`EXTENTS_FL`),
//! or the legacy 12-direct plus indirect/double-indirect/triple-indirect
//! block-pointer scheme. Block-group descriptor size switches on the
//! `64bit` incompatible-feature bit.

use std::sync::Arc;

use diskit_err::{ctx, Error, Result};
use diskit_fs::{split_path, DirEntry, FileAttributes, FileSystemReader, ReaderOptions, Timestamps, UnixInfo};
use diskit_stream::{ConcatStream, Extent, SparseStream, SubStream};
use zerocopy::{
    little_endian::{U16, U32},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

const EXT2_MAGIC: u16 = 0xEF53;
const ROOT_INODE: u32 = 2;

const INCOMPAT_FILETYPE: u32 = 0x0002;
const INCOMPAT_NEEDS_RECOVERY: u32 = 0x0004;
const INCOMPAT_EXTENTS: u32 = 0x0040;
const INCOMPAT_64BIT: u32 = 0x0080;
const INCOMPAT_FLEX_BG: u32 = 0x0200;
const SUPPORTED_INCOMPAT: u32 = INCOMPAT_FILETYPE | INCOMPAT_NEEDS_RECOVERY | INCOMPAT_EXTENTS | INCOMPAT_64BIT | INCOMPAT_FLEX_BG;

const INODE_FLAG_EXTENTS: u32 = 0x0008_0000;

const FILETYPE_REGULAR: u8 = 1;
const FILETYPE_DIRECTORY: u8 = 2;
const FILETYPE_SYMLINK: u8 = 7;

const EXTENT_MAGIC: u16 = 0xF30A;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawSuperblock {
    inodes_count: U32,
    blocks_count_lo: U32,
    r_blocks_count_lo: U32,
    free_blocks_count_lo: U32,
    free_inodes_count: U32,
    first_data_block: U32,
    log_block_size: U32,
    log_frag_size: U32,
    blocks_per_group: U32,
    frags_per_group: U32,
    inodes_per_group: U32,
    mtime: U32,
    wtime: U32,
    mnt_count: U16,
    max_mnt_count: U16,
    magic: U16,
    state: U16,
    errors: U16,
    minor_rev_level: U16,
    lastcheck: U32,
    checkinterval: U32,
    creator_os: U32,
    rev_level: U32,
    def_resuid: U16,
    def_resgid: U16,
    first_ino: U32,
    inode_size: U16,
    block_group_nr: U16,
    feature_compat: U32,
    feature_incompat: U32,
    feature_ro_compat: U32,
    uuid: [u8; 16],
    volume_name: [u8; 16],
    last_mounted: [u8; 64],
    algorithm_usage_bitmap: U32,
    prealloc_blocks: u8,
    prealloc_dir_blocks: u8,
    reserved_gdt_blocks: U16,
    journal_uuid: [u8; 16],
    journal_inum: U32,
    journal_dev: U32,
    last_orphan: U32,
    hash_seed: [U32; 4],
    def_hash_version: u8,
    jnl_backup_type: u8,
    desc_size: U16,
    default_mount_opts: U32,
    first_meta_bg: U32,
    mkfs_time: U32,
    jnl_blocks: [U32; 17],
    blocks_count_hi: U32,
    r_blocks_count_hi: U32,
    free_blocks_count_hi: U32,
    padding: [u8; 1024 - 276 - 4 * 3],
}

const _: () = assert!(std::mem::size_of::<RawSuperblock>() == 1024);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawGroupDesc32 {
    block_bitmap_lo: U32,
    inode_bitmap_lo: U32,
    inode_table_lo: U32,
    free_blocks_count_lo: U16,
    free_inodes_count_lo: U16,
    used_dirs_count_lo: U16,
    pad: U16,
    reserved: [u8; 12],
}

const _: () = assert!(std::mem::size_of::<RawGroupDesc32>() == 32);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawGroupDesc64 {
    base: RawGroupDesc32,
    block_bitmap_hi: U32,
    inode_bitmap_hi: U32,
    inode_table_hi: U32,
    free_blocks_count_hi: U16,
    free_inodes_count_hi: U16,
    used_dirs_count_hi: U16,
    itable_unused_hi: U16,
    reserved: [u8; 4],
}

const _: () = assert!(std::mem::size_of::<RawGroupDesc64>() == 64);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct RawInode {
    mode: U16,
    uid: U16,
    size_lo: U32,
    atime: U32,
    ctime: U32,
    mtime: U32,
    dtime: U32,
    gid: U16,
    links_count: U16,
    blocks_lo: U32,
    flags: U32,
    osd1: U32,
    block: [u8; 60],
    generation: U32,
    file_acl_lo: U32,
    size_hi: U32,
    obso_faddr: U32,
    osd2: [u8; 12],
}

const _: () = assert!(std::mem::size_of::<RawInode>() == 128);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct ExtentHeader {
    magic: U16,
    entries: U16,
    max: U16,
    depth: U16,
    generation: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct ExtentLeaf {
    block: U32,
    len: U16,
    start_hi: U16,
    start_lo: U32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
struct ExtentIndex {
    block: U32,
    leaf_lo: U32,
    leaf_hi: U16,
    unused: U16,
}

struct Layout {
    block_size: u64,
    blocks_per_group: u32,
    inodes_per_group: u32,
    inode_size: u16,
    desc_size: usize,
    first_data_block: u64,
    groups: u32,
}

impl Layout {
    fn group_desc_table_offset(&self) -> u64 {
        (self.first_data_block + 1) * self.block_size
    }

    fn inode_location(&self, inode: u32, desc: &GroupDesc) -> u64 {
        let index = (inode - 1) % self.inodes_per_group;
        desc.inode_table * self.block_size + index as u64 * self.inode_size as u64
    }
}

#[derive(Clone, Copy)]
struct GroupDesc {
    inode_table: u64,
}

pub struct Reader {
    stream: Arc<dyn SparseStream>,
    layout: Layout,
    groups: Vec<GroupDesc>,
    options: ReaderOptions,
}

impl Reader {
    #[maybe_async::maybe_async]
    pub async fn detect(stream: &dyn SparseStream) -> bool {
        let mut sb = [0u8; 1024];
        if stream.read_at(1024, &mut sb).await.is_err() {
            return false;
        }
        RawSuperblock::read_from_bytes(&sb)
            .map(|sb| sb.magic.get() == EXT2_MAGIC)
            .unwrap_or(false)
    }

    #[maybe_async::maybe_async]
    pub async fn mount(stream: Arc<dyn SparseStream>, options: ReaderOptions) -> Result<Self> {
        let mut raw = [0u8; 1024];
        stream.read_at(1024, &mut raw).await?;
        let sb = RawSuperblock::read_from_bytes(&raw)
            .map_err(|_| Error::Truncated(ctx!("ext", "superblock short read")))?;
        if sb.magic.get() != EXT2_MAGIC {
            return Err(Error::BadMagic(ctx!("ext", "missing ext2 superblock magic")));
        }
        if sb.rev_level.get() == 0 {
            return Err(Error::UnsupportedVersion(ctx!("ext", "OLD_REVISION superblocks are not supported")));
        }
        let incompat = sb.feature_incompat.get();
        if incompat & !SUPPORTED_INCOMPAT != 0 {
            return Err(Error::UnsupportedFeature(ctx!(
                "ext",
                "incompatible feature bits {:#x} outside supported set",
                incompat & !SUPPORTED_INCOMPAT
            )));
        }
        let is_64bit = incompat & INCOMPAT_64BIT != 0;

        let block_size = 1024u64 << sb.log_block_size.get();
        let blocks_count = sb.blocks_count_lo.get() as u64 | ((sb.blocks_count_hi.get() as u64) << 32);
        let groups = blocks_count.div_ceil(sb.blocks_per_group.get() as u64) as u32;
        let desc_size = if is_64bit { sb.desc_size.get() as usize } else { 32 };
        let desc_size = if desc_size == 0 { 32 } else { desc_size };

        let layout = Layout {
            block_size,
            blocks_per_group: sb.blocks_per_group.get(),
            inodes_per_group: sb.inodes_per_group.get(),
            inode_size: if sb.inode_size.get() == 0 { 128 } else { sb.inode_size.get() },
            desc_size,
            first_data_block: sb.first_data_block.get() as u64,
            groups,
        };

        let table_offset = layout.group_desc_table_offset();
        let mut table = vec![0u8; groups as usize * desc_size];
        stream.read_at(table_offset, &mut table).await?;
        let mut parsed_groups = Vec::with_capacity(groups as usize);
        for chunk in table.chunks_exact(desc_size) {
            let inode_table = if is_64bit {
                let d = RawGroupDesc64::read_from_bytes(chunk)
                    .map_err(|_| Error::Truncated(ctx!("ext", "64-bit group descriptor short read")))?;
                d.base.inode_table_lo.get() as u64 | ((d.inode_table_hi.get() as u64) << 32)
            } else {
                let d = RawGroupDesc32::read_from_bytes(&chunk[..32])
                    .map_err(|_| Error::Truncated(ctx!("ext", "group descriptor short read")))?;
                d.inode_table_lo.get() as u64
            };
            parsed_groups.push(GroupDesc { inode_table });
        }

        if incompat & INCOMPAT_NEEDS_RECOVERY != 0 {
            log::warn!("ext volume has NEEDS_RECOVERY set; journal replay is not performed, content is correct only if cleanly unmounted");
        }

        log::debug!("mounted ext volume, block size {block_size}, {groups} groups");
        Ok(Self { stream, layout, groups: parsed_groups, options })
    }

    #[maybe_async::maybe_async]
    async fn read_inode(&self, inode: u32) -> Result<RawInode> {
        if inode == 0 {
            return Err(Error::NotFound(ctx!("ext", "inode 0 does not exist")));
        }
        let group = (inode - 1) / self.layout.inodes_per_group;
        let desc = self
            .groups
            .get(group as usize)
            .ok_or_else(|| Error::CorruptStructure(ctx!("ext", "inode {inode} references an out-of-range group")))?;
        let offset = self.layout.inode_location(inode, desc);
        let mut buf = vec![0u8; self.layout.inode_size as usize];
        self.stream.read_at(offset, &mut buf).await?;
        RawInode::read_from_bytes(&buf[..std::mem::size_of::<RawInode>()])
            .copied()
            .map_err(|_| Error::Truncated(ctx!("ext", "inode {inode} short read")))
    }

    fn file_size(inode: &RawInode) -> u64 {
        inode.size_lo.get() as u64 | ((inode.size_hi.get() as u64) << 32)
    }

    /// Resolves an inode's content to absolute byte extents, by the fast
    /// symlink / extent-tree / legacy indirect-block scheme in that order.
    #[maybe_async::maybe_async]
    async fn resolve_extents(&self, inode: &RawInode) -> Result<Vec<Extent>> {
        let mode = inode.mode.get();
        let is_symlink = (mode >> 12) as u8 == FILETYPE_SYMLINK;
        if is_symlink && inode.blocks_lo.get() == 0 {
            return Ok(Vec::new()); // fast symlink target lives inline, not as block extents
        }
        if inode.flags.get() & INODE_FLAG_EXTENTS != 0 {
            self.walk_extent_tree(&inode.block).await
        } else {
            self.walk_indirect_blocks(inode).await
        }
    }

    fn fast_symlink_target(inode: &RawInode) -> Option<String> {
        let mode = (inode.mode.get() >> 12) as u8;
        if mode == FILETYPE_SYMLINK && inode.blocks_lo.get() == 0 {
            let bytes = &inode.block[..];
            let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
            Some(String::from_utf8_lossy(&bytes[..len]).into_owned())
        } else {
            None
        }
    }

    /// Walks the extent tree breadth-first with an explicit queue rather
    /// than self-recursion, so the body compiles identically whether
    /// `maybe-async` emits a plain or an `async fn`.
    #[maybe_async::maybe_async]
    async fn walk_extent_tree(&self, root_bytes: &[u8; 60]) -> Result<Vec<Extent>> {
        // Collected as (logical_block, extent) since leaves from different
        // tree branches arrive out of logical order; sorted by logical
        // block before returning so concatenation reconstructs the file.
        let mut leaves: Vec<(u32, Extent)> = Vec::new();
        let mut pending: Vec<Vec<u8>> = vec![root_bytes.to_vec()];
        while let Some(node) = pending.pop() {
            let header = ExtentHeader::read_from_bytes(&node[..12])
                .map_err(|_| Error::Truncated(ctx!("ext", "extent header short read")))?;
            if header.magic.get() != EXTENT_MAGIC {
                return Err(Error::BadMagic(ctx!("ext", "missing extent-tree magic")));
            }
            let count = header.entries.get() as usize;
            if header.depth.get() == 0 {
                for i in 0..count {
                    let off = 12 + i * 12;
                    let leaf = ExtentLeaf::read_from_bytes(&node[off..off + 12])
                        .map_err(|_| Error::Truncated(ctx!("ext", "extent leaf short read")))?;
                    let start = leaf.start_lo.get() as u64 | ((leaf.start_hi.get() as u64) << 32);
                    let len = (leaf.len.get() & 0x7FFF) as u64; // high bit marks an uninitialized (but allocated) extent
                    leaves.push((leaf.block.get(), Extent::new(start * self.layout.block_size, len * self.layout.block_size)));
                }
            } else {
                for i in 0..count {
                    let off = 12 + i * 12;
                    let idx = ExtentIndex::read_from_bytes(&node[off..off + 12])
                        .map_err(|_| Error::Truncated(ctx!("ext", "extent index short read")))?;
                    let child_block = idx.leaf_lo.get() as u64 | ((idx.leaf_hi.get() as u64) << 32);
                    let mut child = vec![0u8; self.layout.block_size as usize];
                    self.stream.read_at(child_block * self.layout.block_size, &mut child).await?;
                    pending.push(child);
                }
            }
        }
        leaves.sort_by_key(|(logical, _)| *logical);
        Ok(leaves.into_iter().map(|(_, extent)| extent).collect())
    }

    #[maybe_async::maybe_async]
    async fn walk_indirect_blocks(&self, inode: &RawInode) -> Result<Vec<Extent>> {
        let pointers: Vec<u32> = inode.block.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect();
        let mut extents = Vec::new();
        for &block in &pointers[0..12] {
            if block != 0 {
                push_block_extent(&mut extents, block as u64, self.layout.block_size);
            }
        }
        if pointers[12] != 0 {
            self.walk_indirect_level(pointers[12] as u64, 1, &mut extents).await?;
        }
        if pointers[13] != 0 {
            self.walk_indirect_level(pointers[13] as u64, 2, &mut extents).await?;
        }
        if pointers[14] != 0 {
            self.walk_indirect_level(pointers[14] as u64, 3, &mut extents).await?;
        }
        Ok(extents)
    }

    /// Walks one indirect/double-indirect/triple-indirect chain with an
    /// explicit `(block, remaining_depth)` worklist instead of recursion.
    #[maybe_async::maybe_async]
    async fn walk_indirect_level(&self, block: u64, depth: u32, extents: &mut Vec<Extent>) -> Result<()> {
        // Logical-block order matters (it becomes read order), so children
        // are pushed in reverse onto this LIFO stack: the next pop is always
        // the earliest not-yet-expanded pointer in on-disk order.
        let mut pending = vec![(block, depth)];
        while let Some((block, depth)) = pending.pop() {
            let mut buf = vec![0u8; self.layout.block_size as usize];
            self.stream.read_at(block * self.layout.block_size, &mut buf).await?;
            let pointers: Vec<u32> = buf.chunks_exact(4).map(|c| u32::from_le_bytes(c.try_into().unwrap())).collect();
            if depth == 1 {
                for ptr in pointers {
                    if ptr != 0 {
                        push_block_extent(extents, ptr as u64, self.layout.block_size);
                    }
                }
            } else {
                for ptr in pointers.into_iter().rev() {
                    if ptr != 0 {
                        pending.push((ptr as u64, depth - 1));
                    }
                }
            }
        }
        Ok(())
    }

    #[maybe_async::maybe_async]
    async fn build_stream(&self, inode: &RawInode) -> Result<Arc<dyn SparseStream>> {
        if let Some(target) = Self::fast_symlink_target(inode) {
            return Ok(Arc::new(InlineStream(target.into_bytes())));
        }
        let extents = self.resolve_extents(inode).await?;
        let children: Vec<Arc<dyn SparseStream>> = extents
            .into_iter()
            .map(|e| -> Result<Arc<dyn SparseStream>> { Ok(Arc::new(SubStream::new(self.stream.clone(), e.offset, e.length)?)) })
            .collect::<Result<_>>()?;
        let concat = ConcatStream::new(children);
        let total = concat.len();
        Ok(Arc::new(SubStream::new(Arc::new(concat) as Arc<dyn SparseStream>, 0, Self::file_size(inode).min(total))?))
    }

    #[maybe_async::maybe_async]
    async fn list_directory(&self, inode_num: u32) -> Result<Vec<(String, u32, u8)>> {
        let inode = self.read_inode(inode_num).await?;
        let stream = self.build_stream(&inode).await?;
        let len = Self::file_size(&inode);
        let mut buf = vec![0u8; len as usize];
        stream.read_at(0, &mut buf).await?;

        let mut entries = Vec::new();
        let mut pos = 0usize;
        while pos + 8 <= buf.len() {
            let ino = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            let rec_len = u16::from_le_bytes(buf[pos + 4..pos + 6].try_into().unwrap()) as usize;
            if rec_len < 8 || pos + rec_len > buf.len() {
                break;
            }
            let name_len = buf[pos + 6] as usize;
            let file_type = buf[pos + 7];
            if ino != 0 && name_len > 0 {
                let name_bytes = &buf[pos + 8..pos + 8 + name_len];
                let name = String::from_utf8_lossy(name_bytes).replace('\\', "/");
                if name != "." && name != ".." {
                    entries.push((name, ino, file_type));
                }
            }
            pos += rec_len;
        }
        Ok(entries)
    }

    #[maybe_async::maybe_async]
    async fn lookup(&self, path: &str) -> Result<(u32, RawInode)> {
        let mut current = ROOT_INODE;
        let components = split_path(path);
        for component in &components {
            let entries = self.list_directory(current).await?;
            let found = entries
                .into_iter()
                .find(|(name, ..)| name == component)
                .ok_or_else(|| Error::NotFound(ctx!("ext", "path component {component:?} not found")))?;
            current = found.1;
        }
        let inode = self.read_inode(current).await?;
        Ok((current, inode))
    }
}

fn push_block_extent(extents: &mut Vec<Extent>, block: u64, block_size: u64) {
    if let Some(last) = extents.last_mut() {
        if last.offset + last.length == block * block_size {
            last.length += block_size;
            return;
        }
    }
    extents.push(Extent::new(block * block_size, block_size));
}

fn ext_time(seconds: u32) -> Option<time::OffsetDateTime> {
    if seconds == 0 {
        None
    } else {
        time::OffsetDateTime::from_unix_timestamp(seconds as i64).ok()
    }
}

fn attributes_for(inode: &RawInode) -> FileAttributes {
    let mode = (inode.mode.get() >> 12) as u8;
    let mut bits = 0u32;
    if mode == FILETYPE_DIRECTORY {
        bits |= FileAttributes::DIRECTORY;
    }
    if mode == FILETYPE_SYMLINK {
        bits |= FileAttributes::SYMLINK;
    }
    FileAttributes(bits)
}

/// A resident byte sequence (a fast symlink target) addressed as a stream
/// without a round trip through the volume.
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
            return Err(Error::Truncated(ctx!("ext", "inline stream read past end")));
        }
        buf.copy_from_slice(&self.0[start..end]);
        Ok(())
    }
}

#[maybe_async::maybe_async]
impl FileSystemReader for Reader {
    fn case_sensitive(&self) -> bool {
        true
    }

    async fn stat(&self, path: &str) -> Result<DirEntry> {
        let (_, inode) = self.lookup(path).await?;
        let mode = (inode.mode.get() >> 12) as u8;
        Ok(DirEntry {
            name: split_path(path).pop().unwrap_or_default(),
            attributes: attributes_for(&inode),
            times: Timestamps {
                created: ext_time(inode.ctime.get()),
                modified: ext_time(inode.mtime.get()),
                accessed: ext_time(inode.atime.get()),
            },
            size: Self::file_size(&inode),
            is_directory: mode == FILETYPE_DIRECTORY,
            is_symlink: mode == FILETYPE_SYMLINK,
            stream_count: 1,
        })
    }

    async fn enumerate(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (inode_num, _) = self.lookup(path).await?;
        let entries = self.list_directory(inode_num).await?;
        let mut out = Vec::with_capacity(entries.len());
        for (name, ino, file_type) in entries {
            let inode = self.read_inode(ino).await?;
            out.push(DirEntry {
                name,
                attributes: attributes_for(&inode),
                times: Timestamps {
                    created: ext_time(inode.ctime.get()),
                    modified: ext_time(inode.mtime.get()),
                    accessed: ext_time(inode.atime.get()),
                },
                size: Self::file_size(&inode),
                is_directory: file_type == FILETYPE_DIRECTORY,
                is_symlink: file_type == FILETYPE_SYMLINK,
                stream_count: 1,
            });
        }
        Ok(out)
    }

    async fn open_file(&self, path: &str) -> Result<Arc<dyn SparseStream>> {
        let (_, inode) = self.lookup(path).await?;
        self.build_stream(&inode).await
    }

    async fn path_to_extents(&self, path: &str) -> Result<Vec<Extent>> {
        let (_, inode) = self.lookup(path).await?;
        self.resolve_extents(&inode).await
    }

    async fn read_link(&self, path: &str) -> Result<String> {
        let (_, inode) = self.lookup(path).await?;
        if let Some(target) = Self::fast_symlink_target(&inode) {
            return Ok(target);
        }
        let stream = self.build_stream(&inode).await?;
        let mut buf = vec![0u8; Self::file_size(&inode) as usize];
        stream.read_at(0, &mut buf).await?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    async fn unix_info(&self, path: &str) -> Result<Option<UnixInfo>> {
        let (_, inode) = self.lookup(path).await?;
        Ok(Some(UnixInfo {
            uid: inode.uid.get() as u32,
            gid: inode.gid.get() as u32,
            mode: inode.mode.get() as u32 & 0x0FFF,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inode_with(mode: u16, blocks_lo: u32, block: [u8; 60]) -> RawInode {
        RawInode {
            mode: mode.into(),
            uid: 0u16.into(),
            size_lo: 0u32.into(),
            atime: 0u32.into(),
            ctime: 0u32.into(),
            mtime: 0u32.into(),
            dtime: 0u32.into(),
            gid: 0u16.into(),
            links_count: 1u16.into(),
            blocks_lo: blocks_lo.into(),
            flags: 0u32.into(),
            osd1: 0u32.into(),
            block,
            generation: 0u32.into(),
            file_acl_lo: 0u32.into(),
            size_hi: 0u32.into(),
            obso_faddr: 0u32.into(),
            osd2: [0; 12],
        }
    }

    #[test]
    fn fast_symlink_target_reads_embedded_bytes() {
        let mut block = [0u8; 60];
        let target = b"/etc/alternatives/x";
        block[..target.len()].copy_from_slice(target);
        let inode = inode_with(0xA1FF, 0, block);
        assert_eq!(Reader::fast_symlink_target(&inode).as_deref(), Some("/etc/alternatives/x"));
    }

    #[test]
    fn non_symlink_inode_has_no_fast_target() {
        let inode = inode_with(0x81A4, 1, [0u8; 60]);
        assert!(Reader::fast_symlink_target(&inode).is_none());
    }

    #[test]
    fn push_block_extent_merges_adjacent_blocks() {
        let mut extents = Vec::new();
        push_block_extent(&mut extents, 10, 4096);
        push_block_extent(&mut extents, 11, 4096);
        assert_eq!(extents.len(), 1);
        assert_eq!(extents[0].length, 8192);
    }

    #[test]
    fn unsupported_incompat_bits_are_rejected() {
        assert_ne!(SUPPORTED_INCOMPAT & 0x0001, 0x0001);
    }
}
