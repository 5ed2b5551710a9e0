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

//! WIM (Windows Imaging Format) reader.
//!
//! A WIM file is a resource container: the header points at a lookup
//! table keyed by SHA-1 hash, and at one metadata resource per stored
//! image. The metadata resource holds a security-descriptor table
//! followed by a tree of directory entries. File content is retrieved by
//! looking up a directory entry's declared hash in the lookup table and
//! decompressing the resource it names; an all-zero hash means an empty
//! file, a hash absent from the table is `ContentMissing`, modeled here
//! as [`Error::NotFound`].

use std::sync::Arc;

use diskit_err::{ctx, Error, Result};
use diskit_fs::{split_path, DirEntry, FileAttributes, FileSystemReader, ReaderOptions, Timestamps, UnixInfo};
use diskit_stream::{Extent, ExtentSet, SparseStream, SubStream};

const MAGIC: [u8; 8] = *b"MSWIM\0\0\0";
const HEADER_MIN_SIZE: u32 = 148;

const HDR_FLAG_COMPRESSION: u32 = 0x0000_0002;
const HDR_FLAG_COMPRESS_XPRESS: u32 = 0x0002_0000;
const HDR_FLAG_COMPRESS_LZX: u32 = 0x0004_0000;

const RESHDR_FLAG_METADATA: u8 = 0x02;
const RESHDR_FLAG_COMPRESSED: u8 = 0x04;

const LZX_E8_MAX_FILE_SIZE: u64 = 12 * 1024 * 1024;

const ATTR_DIRECTORY: u32 = 0x0000_0010;
const ATTR_REPARSE_POINT: u32 = 0x0000_0400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Xpress,
    Lzx,
}

#[derive(Debug, Clone, Copy)]
struct ResourceEntry {
    flags: u8,
    size: u64,
    offset: u64,
    original_size: u64,
}

fn parse_resource_entry(bytes: &[u8]) -> Result<ResourceEntry> {
    if bytes.len() < 24 {
        return Err(Error::Truncated(ctx!("wim", "resource entry short read")));
    }
    let packed = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
    let size = packed & 0x00FF_FFFF_FFFF_FFFF;
    let flags = (packed >> 56) as u8;
    let offset = u64::from_le_bytes(bytes[8..16].try_into().unwrap());
    let original_size = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
    Ok(ResourceEntry { flags, size, offset, original_size })
}

struct LookupEntry {
    resource: ResourceEntry,
    hash: [u8; 20],
}

/// Parses a resource entry's header fields plus a 20-byte SHA-1, the
/// repeated shape every lookup-table entry carries after its part
/// number and reference count.
fn parse_lookup_entry(bytes: &[u8]) -> Result<LookupEntry> {
    if bytes.len() < 50 {
        return Err(Error::Truncated(ctx!("wim", "lookup table entry short read")));
    }
    let resource = parse_resource_entry(&bytes[0..24])?;
    let hash: [u8; 20] = bytes[30..50].try_into().unwrap();
    Ok(LookupEntry { resource, hash })
}

struct Header {
    flags: u32,
    chunk_size: u32,
    lookup_table: ResourceEntry,
    image_count: u32,
}

fn parse_header(buf: &[u8]) -> Result<Header> {
    if buf.len() < HEADER_MIN_SIZE as usize {
        return Err(Error::Truncated(ctx!("wim", "header shorter than the minimum 148 bytes")));
    }
    if buf[0..8] != MAGIC {
        return Err(Error::BadMagic(ctx!("wim", "missing MSWIM signature")));
    }
    let header_size = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    if header_size < HEADER_MIN_SIZE {
        return Err(Error::CorruptStructure(ctx!("wim", "declared header size {header_size} below minimum")));
    }
    let flags = u32::from_le_bytes(buf[16..20].try_into().unwrap());
    let chunk_size = u32::from_le_bytes(buf[20..24].try_into().unwrap());
    let lookup_table = parse_resource_entry(&buf[48..72])?;
    let image_count = u32::from_le_bytes(buf[44..48].try_into().unwrap());
    Ok(Header { flags, chunk_size, lookup_table, image_count })
}

fn compression_of(flags: u32) -> Result<Compression> {
    if flags & HDR_FLAG_COMPRESSION == 0 {
        return Ok(Compression::None);
    }
    match (flags & HDR_FLAG_COMPRESS_XPRESS != 0, flags & HDR_FLAG_COMPRESS_LZX != 0) {
        (true, false) => Ok(Compression::Xpress),
        (false, true) => Ok(Compression::Lzx),
        _ => Err(Error::UnsupportedFeature(ctx!("wim", "header declares compression but no recognized codec flag"))),
    }
}

/// Decompresses one resource's raw on-disk bytes to its declared
/// `original_size`.
///
/// An uncompressed resource (the `COMPRESSED` flag clear on the resource
/// entry) bypasses chunking entirely: the bytes at `offset` are already
/// the file content, the simplifying fast path this reader leans on.
fn decompress_resource(raw: &[u8], resource: &ResourceEntry, chunk_size: u32, compression: Compression) -> Result<Vec<u8>> {
    if resource.flags & RESHDR_FLAG_COMPRESSED == 0 {
        let mut out = raw.to_vec();
        out.resize(resource.original_size as usize, 0);
        return Ok(out);
    }
    if compression == Compression::None {
        return Err(Error::CorruptStructure(ctx!("wim", "resource marked compressed but header declares no codec")));
    }

    let chunk_size = chunk_size as u64;
    let num_chunks = resource.original_size.div_ceil(chunk_size).max(1);

    let mut out = Vec::with_capacity(resource.original_size as usize);
    if num_chunks == 1 {
        let chunk = decompress_chunk(raw, resource.original_size as usize, compression)?;
        out.extend_from_slice(&chunk);
    } else {
        let table_len = (num_chunks - 1) as usize * 4;
        if table_len > raw.len() {
            return Err(Error::Truncated(ctx!("wim", "chunk offset table exceeds resource size")));
        }
        let mut deltas = Vec::with_capacity(num_chunks as usize - 1);
        for i in 0..(num_chunks - 1) as usize {
            deltas.push(u32::from_le_bytes(raw[i * 4..i * 4 + 4].try_into().unwrap()) as u64);
        }
        let data = &raw[table_len..];
        for i in 0..num_chunks {
            let start = if i == 0 { 0 } else { deltas[i as usize - 1] } as usize;
            let end = if i < num_chunks - 1 { deltas[i as usize] as usize } else { data.len() };
            if end > data.len() || start > end {
                return Err(Error::CorruptStructure(ctx!("wim", "chunk {i} offsets out of range")));
            }
            let compressed = &data[start..end];
            let chunk_original_len = if i < num_chunks - 1 {
                chunk_size as usize
            } else {
                (resource.original_size - chunk_size * (num_chunks - 1)) as usize
            };
            let chunk = if compressed.len() as u64 >= chunk_original_len as u64 {
                compressed[..chunk_original_len].to_vec()
            } else {
                decompress_chunk(compressed, chunk_original_len, compression)?
            };
            out.extend_from_slice(&chunk);
        }
    }

    if compression == Compression::Lzx && resource.original_size <= LZX_E8_MAX_FILE_SIZE {
        diskit_codec::e8_decode(&mut out, resource.original_size as u32);
    }

    Ok(out)
}

fn decompress_chunk(compressed: &[u8], original_len: usize, compression: Compression) -> Result<Vec<u8>> {
    match compression {
        Compression::Xpress => diskit_codec::decode_xpress(compressed, original_len),
        Compression::Lzx => diskit_codec::decode_lzx(compressed, original_len, 32 * 1024),
        Compression::None => Err(Error::CorruptStructure(ctx!("wim", "attempted to decompress with no codec selected"))),
    }
}

struct WimDirEntry {
    name: String,
    short_name: String,
    attributes: u32,
    subdir_offset: u64,
    times: Timestamps,
    hash: [u8; 20],
    reparse_tag: u32,
    stream_count: u16,
}

fn wim_filetime(raw: u64) -> Option<time::OffsetDateTime> {
    if raw == 0 {
        return None;
    }
    // FILETIME: 100ns ticks since 1601-01-01, the offset Windows structures use.
    const EPOCH_DELTA_100NS: u64 = 116_444_736_000_000_000;
    let unix_100ns = raw.checked_sub(EPOCH_DELTA_100NS)?;
    time::OffsetDateTime::from_unix_timestamp_nanos((unix_100ns as i128) * 100).ok()
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    char::decode_utf16(units).map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER)).collect()
}

/// Parses one sibling chain of directory entries starting at byte
/// `offset` into `metadata`, stopping at the first zero-length entry.
fn parse_dir_entries(metadata: &[u8], offset: usize) -> Result<Vec<WimDirEntry>> {
    let mut entries = Vec::new();
    let mut pos = offset;
    loop {
        if pos + 8 > metadata.len() {
            return Err(Error::Truncated(ctx!("wim", "directory entry length field exceeds metadata stream")));
        }
        let length = u64::from_le_bytes(metadata[pos..pos + 8].try_into().unwrap());
        if length == 0 {
            break;
        }
        let entry_end = pos + length as usize;
        if entry_end > metadata.len() {
            return Err(Error::Truncated(ctx!("wim", "directory entry body exceeds metadata stream")));
        }
        let body = &metadata[pos..entry_end];
        if body.len() < 106 {
            return Err(Error::Truncated(ctx!("wim", "directory entry shorter than fixed header")));
        }
        let attributes = u32::from_le_bytes(body[8..12].try_into().unwrap());
        let subdir_offset = u64::from_le_bytes(body[16..24].try_into().unwrap());
        let creation = wim_filetime(u64::from_le_bytes(body[40..48].try_into().unwrap()));
        let access = wim_filetime(u64::from_le_bytes(body[48..56].try_into().unwrap()));
        let write = wim_filetime(u64::from_le_bytes(body[56..64].try_into().unwrap()));
        let hash: [u8; 20] = body[64..84].try_into().unwrap();
        let reparse_tag = u32::from_le_bytes(body[88..92].try_into().unwrap());
        let stream_count = u16::from_le_bytes(body[100..102].try_into().unwrap());
        let short_name_length = u16::from_le_bytes(body[102..104].try_into().unwrap()) as usize;
        let filename_length = u16::from_le_bytes(body[104..106].try_into().unwrap()) as usize;

        let name_start = 106;
        let name_end = name_start + filename_length;
        let name = body
            .get(name_start..name_end)
            .map(decode_utf16le)
            .ok_or_else(|| Error::Truncated(ctx!("wim", "directory entry name exceeds entry body")))?;

        let short_name_start = name_end + 2; // skip the name's NUL terminator
        let short_name_end = short_name_start + short_name_length;
        let short_name = if short_name_length > 0 {
            body.get(short_name_start..short_name_end).map(decode_utf16le).unwrap_or_default()
        } else {
            String::new()
        };

        entries.push(WimDirEntry {
            name,
            short_name,
            attributes,
            subdir_offset,
            times: Timestamps { created: creation, modified: write, accessed: access },
            hash,
            reparse_tag,
            stream_count,
        });

        pos = (entry_end + 7) & !7; // 8-byte aligned next sibling
    }
    Ok(entries)
}

fn translate_attributes(flags: u32) -> FileAttributes {
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
    if flags & ATTR_DIRECTORY != 0 {
        bits |= FileAttributes::DIRECTORY;
    }
    if flags & 0x0020 != 0 {
        bits |= FileAttributes::ARCHIVE;
    }
    if flags & ATTR_REPARSE_POINT != 0 {
        bits |= FileAttributes::REPARSE_POINT | FileAttributes::SYMLINK;
    }
    FileAttributes(bits)
}

pub struct Reader {
    stream: Arc<dyn SparseStream>,
    chunk_size: u32,
    compression: Compression,
    lookup_table: Vec<LookupEntry>,
    metadata: Vec<u8>,
    options: ReaderOptions,
}

impl Reader {
    #[maybe_async::maybe_async]
    pub async fn detect(stream: &dyn SparseStream) -> bool {
        let mut buf = [0u8; 8];
        stream.read_at(0, &mut buf).await.is_ok() && buf == MAGIC
    }

    /// Mounts the first image in the archive. Multi-image WIM files
    /// should use [`Reader::mount_image`].
    #[maybe_async::maybe_async]
    pub async fn mount(stream: Arc<dyn SparseStream>, options: ReaderOptions) -> Result<Self> {
        Self::mount_image(stream, options, 1).await
    }

    #[maybe_async::maybe_async]
    pub async fn mount_image(stream: Arc<dyn SparseStream>, options: ReaderOptions, image_index: u32) -> Result<Self> {
        let mut head = vec![0u8; HEADER_MIN_SIZE as usize];
        stream.read_at(0, &mut head).await?;
        let header = parse_header(&head)?;
        let compression = compression_of(header.flags)?;

        if image_index == 0 || image_index > header.image_count {
            return Err(Error::NotFound(ctx!("wim", "image index {image_index} out of range (archive has {})", header.image_count)));
        }

        let mut lt_raw = vec![0u8; header.lookup_table.size as usize];
        stream.read_at(header.lookup_table.offset, &mut lt_raw).await?;
        let lt_raw = decompress_resource(&lt_raw, &header.lookup_table, header.chunk_size, compression)?;

        let mut lookup_table = Vec::new();
        let mut metadata_resources = Vec::new();
        for chunk in lt_raw.chunks_exact(50) {
            let entry = parse_lookup_entry(chunk)?;
            if entry.resource.flags & RESHDR_FLAG_METADATA != 0 {
                metadata_resources.push(entry.resource);
            }
            lookup_table.push(entry);
        }

        let metadata_resource = metadata_resources
            .get(image_index as usize - 1)
            .copied()
            .ok_or_else(|| Error::NotFound(ctx!("wim", "no metadata resource recorded for image {image_index}")))?;

        let mut meta_raw = vec![0u8; metadata_resource.size as usize];
        stream.read_at(metadata_resource.offset, &mut meta_raw).await?;
        let metadata = decompress_resource(&meta_raw, &metadata_resource, header.chunk_size, compression)?;

        log::debug!("mounted wim image {image_index} of {}, {} lookup table entries", header.image_count, lookup_table.len());

        Ok(Self { stream, chunk_size: header.chunk_size, compression, lookup_table, metadata, options })
    }

    fn root_offset(&self) -> Result<usize> {
        if self.metadata.len() < 8 {
            return Err(Error::Truncated(ctx!("wim", "metadata stream shorter than security descriptor header")));
        }
        let total_length = u32::from_le_bytes(self.metadata[0..4].try_into().unwrap()) as usize;
        let count = u32::from_le_bytes(self.metadata[4..8].try_into().unwrap()) as usize;
        let lengths_end = 8 + count * 8;
        if lengths_end > self.metadata.len() || total_length > self.metadata.len() {
            return Err(Error::Truncated(ctx!("wim", "security descriptor table exceeds metadata stream")));
        }
        Ok((total_length + 7) & !7)
    }

    fn lookup_hash(&self, hash: &[u8; 20]) -> Result<Option<&LookupEntry>> {
        if hash.iter().all(|&b| b == 0) {
            return Ok(None);
        }
        self.lookup_table
            .iter()
            .find(|e| &e.hash == hash)
            .map(Some)
            .ok_or_else(|| Error::NotFound(ctx!("wim", "no resource entry for declared content hash")))
    }

    fn content_length(&self, hash: &[u8; 20]) -> Result<u64> {
        Ok(self.lookup_hash(hash)?.map(|e| e.resource.original_size).unwrap_or(0))
    }

    #[maybe_async::maybe_async]
    async fn content_stream(&self, hash: &[u8; 20]) -> Result<Arc<dyn SparseStream>> {
        let Some(entry) = self.lookup_hash(hash)? else {
            return Ok(Arc::new(EmptyStream));
        };
        let resource = entry.resource;
        if resource.flags & RESHDR_FLAG_COMPRESSED == 0 {
            return Ok(Arc::new(SubStream::new(self.stream.clone(), resource.offset, resource.original_size)?));
        }
        let mut raw = vec![0u8; resource.size as usize];
        self.stream.read_at(resource.offset, &mut raw).await?;
        let data = decompress_resource(&raw, &resource, self.chunk_size, self.compression)?;
        Ok(Arc::new(InMemoryStream(data)))
    }

    fn find_entry(&self, dir_offset: usize, component: &str) -> Result<WimDirEntry> {
        let entries = parse_dir_entries(&self.metadata, dir_offset)?;
        entries
            .into_iter()
            .find(|e| diskit_fs::names_equal(&e.name, component, false))
            .ok_or_else(|| Error::NotFound(ctx!("wim", "path component {component:?} not found")))
    }

    fn lookup(&self, path: &str) -> Result<WimDirEntry> {
        let components = split_path(path);
        let mut dir_offset = self.root_offset()?;
        let mut entry = WimDirEntry {
            name: String::new(),
            short_name: String::new(),
            attributes: ATTR_DIRECTORY,
            subdir_offset: dir_offset as u64,
            times: Timestamps::default(),
            hash: [0u8; 20],
            reparse_tag: 0,
            stream_count: 0,
        };
        for (i, component) in components.iter().enumerate() {
            entry = self.find_entry(dir_offset, component)?;
            let is_last = i == components.len() - 1;
            let is_dir = entry.attributes & ATTR_DIRECTORY != 0;
            if !is_last && !is_dir {
                return Err(Error::NotFound(ctx!("wim", "{component:?} is not a directory")));
            }
            dir_offset = entry.subdir_offset as usize;
        }
        Ok(entry)
    }

    fn to_dir_entry(&self, name: String, entry: &WimDirEntry) -> DirEntry {
        let is_directory = entry.attributes & ATTR_DIRECTORY != 0;
        let is_symlink = entry.attributes & ATTR_REPARSE_POINT != 0;
        DirEntry {
            name,
            attributes: translate_attributes(entry.attributes),
            times: entry.times,
            size: 0,
            is_directory,
            is_symlink,
            stream_count: entry.stream_count as u32,
        }
    }
}

struct EmptyStream;

#[maybe_async::maybe_async]
impl SparseStream for EmptyStream {
    fn len(&self) -> u64 {
        0
    }
    async fn extents(&self) -> Result<ExtentSet> {
        Ok(ExtentSet::from_extents(Vec::new()))
    }
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if !buf.is_empty() {
            return Err(Error::Truncated(ctx!("wim", "read past end of empty content stream").at(offset)));
        }
        Ok(())
    }
}

struct InMemoryStream(Vec<u8>);

#[maybe_async::maybe_async]
impl SparseStream for InMemoryStream {
    fn len(&self) -> u64 {
        self.0.len() as u64
    }
    async fn extents(&self) -> Result<ExtentSet> {
        Ok(ExtentSet::single(0, self.0.len() as u64))
    }
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        if end > self.0.len() {
            return Err(Error::Truncated(ctx!("wim", "in-memory content stream read past end")));
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
        let entry = self.lookup(path)?;
        let name = split_path(path).pop().unwrap_or_default();
        let mut dir_entry = self.to_dir_entry(name, &entry);
        if !dir_entry.is_directory {
            dir_entry.size = self.content_length(&entry.hash)?;
        }
        Ok(dir_entry)
    }

    async fn enumerate(&self, path: &str) -> Result<Vec<DirEntry>> {
        let dir_offset = if path.is_empty() || path == "/" {
            self.root_offset()?
        } else {
            let entry = self.lookup(path)?;
            if entry.attributes & ATTR_DIRECTORY == 0 {
                return Err(Error::NotFound(ctx!("wim", "{path} is not a directory")));
            }
            entry.subdir_offset as usize
        };
        let children = parse_dir_entries(&self.metadata, dir_offset)?;
        let mut out = Vec::with_capacity(children.len());
        for child in &children {
            if (self.options.hide_hidden && translate_attributes(child.attributes).has(FileAttributes::HIDDEN))
                || (self.options.hide_system && translate_attributes(child.attributes).has(FileAttributes::SYSTEM))
            {
                continue;
            }
            let mut entry = self.to_dir_entry(child.name.clone(), child);
            if !entry.is_directory {
                entry.size = self.content_length(&child.hash)?;
            }
            out.push(entry);
        }
        Ok(out)
    }

    async fn open_file(&self, path: &str) -> Result<Arc<dyn SparseStream>> {
        let entry = self.lookup(path)?;
        if entry.attributes & ATTR_DIRECTORY != 0 {
            return Err(Error::NotFound(ctx!("wim", "{path} is a directory")));
        }
        self.content_stream(&entry.hash).await
    }

    async fn path_to_extents(&self, path: &str) -> Result<Vec<Extent>> {
        let entry = self.lookup(path)?;
        let Some(lookup) = self.lookup_hash(&entry.hash)? else { return Ok(Vec::new()) };
        if lookup.resource.flags & RESHDR_FLAG_COMPRESSED != 0 {
            return Err(Error::UnsupportedFeature(ctx!("wim", "{path}: content is compressed, no stable backing extent")));
        }
        Ok(vec![Extent::new(lookup.resource.offset, lookup.resource.original_size)])
    }

    async fn read_link(&self, path: &str) -> Result<String> {
        let entry = self.lookup(path)?;
        if entry.attributes & ATTR_REPARSE_POINT == 0 {
            return Err(Error::UnsupportedFeature(ctx!("wim", "{path} is not a reparse point")));
        }
        let _ = entry.reparse_tag;
        Err(Error::Unimplemented(ctx!("wim", "reparse target data is not parsed by this reader")))
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
            let start = offset as usize;
            buf.copy_from_slice(&self.0[start..start + buf.len()]);
            Ok(())
        }
    }

    fn push_resource_entry(buf: &mut Vec<u8>, flags: u8, size: u64, offset: u64, original_size: u64) {
        let packed = (size & 0x00FF_FFFF_FFFF_FFFF) | ((flags as u64) << 56);
        buf.extend_from_slice(&packed.to_le_bytes());
        buf.extend_from_slice(&offset.to_le_bytes());
        buf.extend_from_slice(&original_size.to_le_bytes());
    }

    fn push_dir_entry(buf: &mut Vec<u8>, name: &str, attributes: u32, subdir_offset: u64, hash: [u8; 20], stream_count: u16) {
        let name_units: Vec<u16> = name.encode_utf16().collect();
        let filename_length = name_units.len() * 2;
        let entry_start = buf.len();
        buf.extend_from_slice(&0u64.to_le_bytes()); // length placeholder
        buf.extend_from_slice(&attributes.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes()); // security id
        buf.extend_from_slice(&subdir_offset.to_le_bytes());
        buf.extend_from_slice(&[0u8; 16]); // skipped
        buf.extend_from_slice(&0u64.to_le_bytes()); // creation
        buf.extend_from_slice(&0u64.to_le_bytes()); // access
        buf.extend_from_slice(&0u64.to_le_bytes()); // write
        buf.extend_from_slice(&hash);
        buf.extend_from_slice(&[0u8; 4]); // skipped
        buf.extend_from_slice(&0u32.to_le_bytes()); // reparse tag
        buf.extend_from_slice(&0u64.to_le_bytes()); // hard link id
        buf.extend_from_slice(&stream_count.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // short name length
        buf.extend_from_slice(&(filename_length as u16).to_le_bytes());
        for unit in &name_units {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
        buf.extend_from_slice(&0u16.to_le_bytes()); // name NUL terminator

        let length = (buf.len() - entry_start) as u64;
        buf[entry_start..entry_start + 8].copy_from_slice(&length.to_le_bytes());
        while (buf.len() - entry_start) % 8 != 0 {
            buf.push(0);
        }
    }

    /// Builds a minimal uncompressed single-image archive with one file
    /// ("hello.txt") at the root, its content stored uncompressed.
    fn build_archive() -> (Vec<u8>, [u8; 20]) {
        let content = b"hello wim content";
        let mut hasher = sha1::Sha1::new();
        use sha1::Digest;
        hasher.update(content);
        let hash: [u8; 20] = hasher.finalize().into();

        // Lay out: header (148) | content | lookup table | metadata resource
        let content_offset = 148u64;
        let mut file = vec![0u8; HEADER_MIN_SIZE as usize];
        file[0..8].copy_from_slice(&MAGIC);
        file[8..12].copy_from_slice(&HEADER_MIN_SIZE.to_le_bytes());
        file[16..20].copy_from_slice(&0u32.to_le_bytes()); // flags: no compression
        file[20..24].copy_from_slice(&32768u32.to_le_bytes()); // chunk size
        file[44..48].copy_from_slice(&1u32.to_le_bytes()); // image count

        file.extend_from_slice(content);

        // metadata stream: empty security table (total_length=8, count=0), then root dir entries
        let mut metadata = Vec::new();
        metadata.extend_from_slice(&8u32.to_le_bytes()); // total_length
        metadata.extend_from_slice(&0u32.to_le_bytes()); // count
        push_dir_entry(&mut metadata, "hello.txt", 0, 0, hash, 1);
        metadata.extend_from_slice(&0u64.to_le_bytes()); // end of siblings

        let metadata_offset = file.len() as u64;
        file.extend_from_slice(&metadata);

        let lookup_table_offset = file.len() as u64;
        let mut lt = Vec::new();
        lt.extend_from_slice(&{
            let mut e = Vec::new();
            push_resource_entry(&mut e, 0, content.len() as u64, content_offset, content.len() as u64);
            e
        });
        lt.extend_from_slice(&[0u8; 2]); // part number
        lt.extend_from_slice(&1u32.to_le_bytes()); // reference count
        lt.extend_from_slice(&hash);
        // metadata resource entry, flagged METADATA
        push_resource_entry(&mut lt, RESHDR_FLAG_METADATA, metadata.len() as u64, metadata_offset, metadata.len() as u64);
        lt.extend_from_slice(&[0u8; 2]);
        lt.extend_from_slice(&1u32.to_le_bytes());
        lt.extend_from_slice(&[0u8; 20]); // hash unused for metadata lookup here
        file.extend_from_slice(&lt);

        file[48..72].copy_from_slice(&{
            let mut e = Vec::new();
            push_resource_entry(&mut e, 0, lt.len() as u64, lookup_table_offset, lt.len() as u64);
            e.try_into().unwrap()
        });

        (file, hash)
    }

    #[test]
    fn mounts_and_reads_uncompressed_file_content() {
        let (bytes, hash) = build_archive();
        let stream: Arc<dyn SparseStream> = Arc::new(Mem(bytes));
        let reader = run(Reader::mount(stream, ReaderOptions::default())).unwrap();

        let entries = run(reader.enumerate("/")).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "hello.txt");

        let content_stream = run(reader.open_file("/hello.txt")).unwrap();
        let mut buf = vec![0u8; content_stream.len() as usize];
        run(content_stream.read_at(0, &mut buf)).unwrap();
        assert_eq!(buf, b"hello wim content");

        use sha1::Digest;
        let mut hasher = sha1::Sha1::new();
        hasher.update(&buf);
        let computed: [u8; 20] = hasher.finalize().into();
        assert_eq!(computed, hash);
    }

    #[test]
    fn resource_entry_packs_56_bit_size_and_8_bit_flags() {
        let mut buf = Vec::new();
        push_resource_entry(&mut buf, RESHDR_FLAG_COMPRESSED, 0x1234, 0x5678, 0x9abc);
        let entry = parse_resource_entry(&buf).unwrap();
        assert_eq!(entry.flags, RESHDR_FLAG_COMPRESSED);
        assert_eq!(entry.size, 0x1234);
        assert_eq!(entry.offset, 0x5678);
        assert_eq!(entry.original_size, 0x9abc);
    }
}
