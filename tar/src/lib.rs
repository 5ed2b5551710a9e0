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

//! POSIX ustar archives: a flat sequence of 512-byte headers each followed
//! by its (512-padded) content, plus the GNU `././@LongLink` extension for
//! names the 100-byte name field and 155-byte prefix field can't split.
//!
//! Tar is not a [`diskit_fs::FileSystemReader`]: archives have no directory
//! blocks to seek into and no random-access content offsets independent of
//! the header stream, so [`TarReader`] exposes a flat entry list instead.

use std::sync::Arc;

use diskit_bytes::{decode_fixed_ascii, encode_tar_octal, parse_tar_numeric};
use diskit_err::{ctx, Error, Result};
use diskit_stream::{SparseStream, SubStream};

const BLOCK_SIZE: u64 = 512;
const NAME_LEN: usize = 100;
const PREFIX_LEN: usize = 155;
const MAGIC: &[u8; 6] = b"ustar\0";
const LONGLINK_NAME: &str = "././@LongLink";

const TYPE_REGULAR: u8 = b'0';
const TYPE_DIRECTORY: u8 = b'5';
const TYPE_LONGNAME: u8 = b'L';

fn round_up_block(len: u64) -> u64 {
    (len + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE
}

fn checksum(header: &[u8; 512]) -> u32 {
    let mut sum = 0u32;
    for (i, &b) in header.iter().enumerate() {
        sum += if (148..156).contains(&i) { b' ' as u32 } else { b as u32 };
    }
    sum
}

fn field(header: &[u8; 512], offset: usize, len: usize) -> &[u8] {
    &header[offset..offset + len]
}

/// One entry's metadata plus where its content lives in the archive stream.
#[derive(Debug, Clone)]
pub struct TarEntry {
    pub name: String,
    pub size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: u64,
    pub is_directory: bool,
    pub linkname: String,
    data_offset: u64,
}

/// Reads the flat entry list of a ustar archive in a single forward pass.
pub struct TarReader {
    stream: Arc<dyn SparseStream>,
    entries: Vec<TarEntry>,
}

#[maybe_async::maybe_async]
impl TarReader {
    /// Scans every header block, resolving `././@LongLink` entries into the
    /// full name of the entry that immediately follows them.
    pub async fn open(stream: Arc<dyn SparseStream>) -> Result<Self> {
        let total = stream.len();
        let mut pos = 0u64;
        let mut entries = Vec::new();
        let mut pending_long_name: Option<String> = None;

        while pos + BLOCK_SIZE <= total {
            let mut header = [0u8; 512];
            stream.read_at(pos, &mut header).await?;
            if header.iter().all(|&b| b == 0) {
                // Two consecutive zero blocks terminate the archive; one is
                // also valid at end-of-stream padding.
                break;
            }
            pos += BLOCK_SIZE;

            let size = parse_tar_numeric(field(&header, 124, 12))?;
            let typeflag = header[156];

            if typeflag == TYPE_LONGNAME && decode_fixed_ascii(field(&header, 0, NAME_LEN)) == LONGLINK_NAME {
                let data_len = round_up_block(size);
                if pos + data_len > total {
                    return Err(Error::Truncated(ctx!("tar", "long-link payload exceeds archive length")));
                }
                let mut name_buf = vec![0u8; size as usize];
                stream.read_at(pos, &mut name_buf).await?;
                let name = String::from_utf8(name_buf)
                    .map_err(|e| Error::CorruptStructure(ctx!("tar", "long-link name is not UTF-8: {e}")))?
                    .trim_end_matches('\0')
                    .to_string();
                pending_long_name = Some(name);
                pos += data_len;
                continue;
            }

            let name = pending_long_name.take().unwrap_or_else(|| decode_entry_name(&header));
            let data_offset = pos;
            let data_len = round_up_block(size);
            if pos + data_len > total {
                return Err(Error::Truncated(ctx!("tar", "entry {name:?} content exceeds archive length")));
            }
            pos += data_len;

            entries.push(TarEntry {
                name,
                size,
                mode: parse_tar_numeric(field(&header, 100, 8))? as u32,
                uid: parse_tar_numeric(field(&header, 108, 8))? as u32,
                gid: parse_tar_numeric(field(&header, 116, 8))? as u32,
                mtime: parse_tar_numeric(field(&header, 136, 12))?,
                is_directory: typeflag == TYPE_DIRECTORY,
                linkname: decode_fixed_ascii(field(&header, 157, 100)).trim_end_matches('\0').to_string(),
                data_offset,
            });
        }

        Ok(Self { stream, entries })
    }

    pub fn entries(&self) -> &[TarEntry] {
        &self.entries
    }

    /// Opens the content of the entry whose name matches `name` exactly.
    pub async fn open_file(&self, name: &str) -> Result<SubStream<Arc<dyn SparseStream>>> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| Error::NotFound(ctx!("tar", "{name}: no such entry")))?;
        SubStream::new(self.stream.clone(), entry.data_offset, entry.size)
    }
}

fn decode_entry_name(header: &[u8; 512]) -> String {
    let prefix = decode_fixed_ascii(field(header, 345, PREFIX_LEN));
    let prefix = prefix.trim_end_matches('\0');
    let name = decode_fixed_ascii(field(header, 0, NAME_LEN));
    let name = name.trim_end_matches('\0');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Splits `name` across the ustar `prefix`/`name` fields, if a split point
/// exists that keeps both halves within their field widths.
fn split_name(name: &str) -> Option<(String, String)> {
    if name.len() <= NAME_LEN {
        return Some((String::new(), name.to_string()));
    }
    let bytes = name.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b != b'/' {
            continue;
        }
        let prefix = &name[..i];
        let rest = &name[i + 1..];
        if !rest.is_empty() && rest.len() <= NAME_LEN && prefix.len() <= PREFIX_LEN {
            return Some((prefix.to_string(), rest.to_string()));
        }
    }
    None
}

/// Builds a ustar archive in memory, injecting `././@LongLink` entries for
/// names too long to fit the `prefix`/`name` field split.
pub struct TarWriter {
    buf: Vec<u8>,
}

impl TarWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn add_file(&mut self, name: &str, mode: u32, uid: u32, gid: u32, mtime: u64, content: &[u8]) {
        self.add_entry(name, TYPE_REGULAR, mode, uid, gid, mtime, content.len() as u64, "");
        self.buf.extend_from_slice(content);
        pad_to_block(&mut self.buf);
    }

    pub fn add_directory(&mut self, name: &str, mode: u32, uid: u32, gid: u32, mtime: u64) {
        self.add_entry(name, TYPE_DIRECTORY, mode, uid, gid, mtime, 0, "");
    }

    fn add_entry(&mut self, name: &str, typeflag: u8, mode: u32, uid: u32, gid: u32, mtime: u64, size: u64, linkname: &str) {
        let (prefix, short_name) = match split_name(name) {
            Some(split) => split,
            None => {
                self.write_longlink(name);
                (String::new(), String::new())
            }
        };
        let mut header = [0u8; 512];
        write_field(&mut header, 0, NAME_LEN, short_name.as_bytes());
        write_octal(&mut header, 100, 8, mode as u64);
        write_octal(&mut header, 108, 8, uid as u64);
        write_octal(&mut header, 116, 8, gid as u64);
        write_octal(&mut header, 124, 12, size);
        write_octal(&mut header, 136, 12, mtime);
        header[156] = typeflag;
        write_field(&mut header, 157, 100, linkname.as_bytes());
        header[257..263].copy_from_slice(MAGIC);
        header[263..265].copy_from_slice(b"00");
        write_field(&mut header, 345, PREFIX_LEN, prefix.as_bytes());

        let sum = checksum(&header);
        let sum_field = format!("{sum:06o}\0 ");
        header[148..156].copy_from_slice(sum_field.as_bytes());

        self.buf.extend_from_slice(&header);
    }

    fn write_longlink(&mut self, name: &str) {
        let mut header = [0u8; 512];
        write_field(&mut header, 0, NAME_LEN, LONGLINK_NAME.as_bytes());
        write_octal(&mut header, 100, 8, 0);
        write_octal(&mut header, 108, 8, 0);
        write_octal(&mut header, 116, 8, 0);
        write_octal(&mut header, 124, 12, (name.len() + 1) as u64);
        write_octal(&mut header, 136, 12, 0);
        header[156] = TYPE_LONGNAME;
        header[257..263].copy_from_slice(MAGIC);
        header[263..265].copy_from_slice(b"00");

        let sum = checksum(&header);
        let sum_field = format!("{sum:06o}\0 ");
        header[148..156].copy_from_slice(sum_field.as_bytes());

        self.buf.extend_from_slice(&header);
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);
        pad_to_block(&mut self.buf);
    }

    /// Appends the two trailing zero blocks and returns the finished archive.
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(&[0u8; 512]);
        self.buf.extend_from_slice(&[0u8; 512]);
        self.buf
    }
}

impl Default for TarWriter {
    fn default() -> Self {
        Self::new()
    }
}

fn write_field(header: &mut [u8; 512], offset: usize, len: usize, value: &[u8]) {
    let n = value.len().min(len);
    header[offset..offset + n].copy_from_slice(&value[..n]);
}

fn write_octal(header: &mut [u8; 512], offset: usize, len: usize, value: u64) {
    let encoded = encode_tar_octal(value, len);
    header[offset..offset + len].copy_from_slice(&encoded);
}

fn pad_to_block(buf: &mut Vec<u8>) {
    let rem = buf.len() as u64 % BLOCK_SIZE;
    if rem != 0 {
        buf.extend(std::iter::repeat(0u8).take((BLOCK_SIZE - rem) as usize));
    }
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
            let start = offset as usize;
            buf.copy_from_slice(&self.0[start..start + buf.len()]);
            Ok(())
        }
    }

    fn run<T>(result: T) -> T {
        result
    }

    #[test]
    fn split_name_keeps_short_names_unsplit() {
        assert_eq!(split_name("hello.txt"), Some((String::new(), "hello.txt".to_string())));
    }

    #[test]
    fn split_name_finds_prefix_boundary() {
        let long_dir = "a".repeat(140);
        let name = format!("{long_dir}/file.txt");
        let (prefix, short) = split_name(&name).expect("should split");
        assert_eq!(prefix, long_dir);
        assert_eq!(short, "file.txt");
    }

    #[test]
    fn split_name_fails_when_no_boundary_fits() {
        let name = format!("{}/{}", "a".repeat(200), "b".repeat(150));
        assert!(split_name(&name).is_none());
    }

    #[test]
    fn long_link_name_round_trips_through_writer_and_reader() {
        let long_name = format!("{}/{}", "dir".repeat(60), "file.bin");
        assert!(long_name.len() > 180);

        let mut writer = TarWriter::new();
        writer.add_file(&long_name, 0o644, 1000, 1000, 1700000000, b"payload");
        let archive = writer.finish();

        let stream: Arc<dyn SparseStream> = Arc::new(Mem(archive));
        let reader = run(TarReader::open(stream)).unwrap();

        assert_eq!(reader.entries().len(), 1);
        let entry = &reader.entries()[0];
        assert_eq!(entry.name, long_name);
        assert_eq!(entry.size, 7);

        let content_stream = run(reader.open_file(&long_name)).unwrap();
        let mut buf = vec![0u8; 7];
        run(content_stream.read_at(0, &mut buf)).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn short_name_round_trips_without_longlink() {
        let mut writer = TarWriter::new();
        writer.add_file("short.txt", 0o644, 0, 0, 0, b"hi");
        let archive = writer.finish();

        let stream: Arc<dyn SparseStream> = Arc::new(Mem(archive));
        let reader = run(TarReader::open(stream)).unwrap();
        assert_eq!(reader.entries().len(), 1);
        assert_eq!(reader.entries()[0].name, "short.txt");
    }

    #[test]
    fn directory_entry_has_no_content_block() {
        let mut writer = TarWriter::new();
        writer.add_directory("mydir", 0o755, 0, 0, 0);
        writer.add_file("mydir/file.txt", 0o644, 0, 0, 0, b"x");
        let archive = writer.finish();

        let stream: Arc<dyn SparseStream> = Arc::new(Mem(archive));
        let reader = run(TarReader::open(stream)).unwrap();
        assert_eq!(reader.entries().len(), 2);
        assert!(reader.entries()[0].is_directory);
        assert_eq!(reader.entries()[0].size, 0);
    }
}
