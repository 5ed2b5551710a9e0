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

//! ISO9660 reader.
//!
//! The volume descriptor set starts at sector 16. A supplementary volume
//! descriptor whose escape sequence matches one of the three registered
//! Joliet levels is preferred over the primary descriptor, since Joliet
//! carries Unicode names where the primary carries d-characters only.
//! Rock Ridge system-use entries (`NM`/`PX`/`SL`) are layered on top of
//! whichever descriptor is in use, exactly as `mkisofs`-produced media mix
//! the two extensions.

use std::sync::Arc;

use diskit_err::{ctx, Error, Result};
use diskit_fs::{split_path, DirEntry, FileAttributes, FileSystemReader, ReaderOptions, Timestamps, UnixInfo};
use diskit_stream::{Extent, SparseStream, SubStream};

const SECTOR_SIZE: u64 = 2048;
const SYSTEM_AREA_SECTORS: u64 = 16;

const VD_TYPE_PRIMARY: u8 = 1;
const VD_TYPE_SUPPLEMENTARY: u8 = 2;
const VD_TYPE_TERMINATOR: u8 = 255;
const VD_STANDARD_ID: &[u8; 5] = b"CD001";

const FILE_FLAG_DIRECTORY: u8 = 0x02;

struct RawDirEntry {
    extent_location: u32,
    data_length: u32,
    flags: u8,
    recorded: Option<time::OffsetDateTime>,
    identifier: String,
    rock_ridge: RockRidge,
}

#[derive(Default)]
struct RockRidge {
    name: Option<String>,
    mode: Option<u32>,
    uid: Option<u32>,
    gid: Option<u32>,
    symlink_target: Option<String>,
}

struct Descriptor {
    joliet: bool,
    logical_block_size: u32,
    root: RawDirEntry,
}

pub struct Reader {
    stream: Arc<dyn SparseStream>,
    descriptor: Descriptor,
    options: ReaderOptions,
}

impl Reader {
    #[maybe_async::maybe_async]
    pub async fn detect(stream: &dyn SparseStream) -> bool {
        let mut buf = vec![0u8; 7];
        if stream.read_at(SYSTEM_AREA_SECTORS * SECTOR_SIZE, &mut buf).await.is_err() {
            return false;
        }
        &buf[1..6] == VD_STANDARD_ID
    }

    #[maybe_async::maybe_async]
    pub async fn mount(stream: Arc<dyn SparseStream>, options: ReaderOptions) -> Result<Self> {
        let mut primary: Option<Descriptor> = None;
        let mut joliet: Option<Descriptor> = None;

        let mut sector = SYSTEM_AREA_SECTORS;
        loop {
            let mut buf = vec![0u8; SECTOR_SIZE as usize];
            stream.read_at(sector * SECTOR_SIZE, &mut buf).await?;
            if &buf[1..6] != VD_STANDARD_ID {
                return Err(Error::BadMagic(ctx!("iso9660", "missing CD001 standard identifier at sector {sector}")));
            }
            let vd_type = buf[0];
            if vd_type == VD_TYPE_TERMINATOR {
                break;
            }
            if vd_type == VD_TYPE_PRIMARY || vd_type == VD_TYPE_SUPPLEMENTARY {
                let logical_block_size = u16::from_le_bytes(buf[128..130].try_into().unwrap()) as u32;
                let is_joliet = vd_type == VD_TYPE_SUPPLEMENTARY && is_joliet_escape(&buf[88..120]);
                let name_encoding: &[u8] = if is_joliet { b"joliet" } else { b"" };
                let root = parse_directory_record(&buf[156..190], name_encoding)?;
                let descriptor = Descriptor { joliet: is_joliet, logical_block_size, root };
                if is_joliet {
                    joliet = Some(descriptor);
                } else if vd_type == VD_TYPE_PRIMARY {
                    primary = Some(descriptor);
                }
            }
            sector += 1;
        }

        let descriptor = joliet
            .or(primary)
            .ok_or_else(|| Error::CorruptStructure(ctx!("iso9660", "no primary or supplementary volume descriptor found")))?;

        log::debug!("mounted iso9660 volume, joliet={}", descriptor.joliet);
        Ok(Self { stream, descriptor, options })
    }

    #[maybe_async::maybe_async]
    async fn read_extent(&self, location: u32, length: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length as usize];
        self.stream.read_at(location as u64 * SECTOR_SIZE, &mut buf).await?;
        Ok(buf)
    }

    #[maybe_async::maybe_async]
    async fn list_directory(&self, entry: &RawDirEntry) -> Result<Vec<RawDirEntry>> {
        let bytes = self.read_extent(entry.extent_location, entry.data_length).await?;
        let mut out = Vec::new();
        let mut pos = 0usize;
        while pos < bytes.len() {
            let record_len = bytes[pos] as usize;
            if record_len == 0 {
                // Directory records never cross a logical-block boundary; a
                // zero length byte marks the unused tail of the block.
                let next_block = (pos / self.descriptor.logical_block_size as usize + 1) * self.descriptor.logical_block_size as usize;
                if next_block <= pos || next_block > bytes.len() {
                    break;
                }
                pos = next_block;
                continue;
            }
            if pos + record_len > bytes.len() {
                break;
            }
            let record = match parse_directory_record(&bytes[pos..pos + record_len], self.descriptor_name_encoding()) {
                Ok(r) => r,
                Err(_) => {
                    pos += record_len;
                    continue;
                }
            };
            if record.identifier != "\u{0}" && record.identifier != "\u{1}" {
                out.push(record);
            }
            pos += record_len;
        }
        Ok(out)
    }

    fn descriptor_name_encoding(&self) -> &'static [u8] {
        if self.descriptor.joliet {
            b"joliet"
        } else {
            b""
        }
    }

    fn display_name(&self, entry: &RawDirEntry) -> String {
        if let Some(name) = &entry.rock_ridge.name {
            return name.clone();
        }
        if self.options.hide_versions {
            strip_version(&entry.identifier)
        } else {
            entry.identifier.clone()
        }
    }

    #[maybe_async::maybe_async]
    async fn lookup(&self, path: &str) -> Result<RawDirEntry> {
        let components = split_path(path);
        let mut current = RawDirEntry {
            extent_location: self.descriptor.root.extent_location,
            data_length: self.descriptor.root.data_length,
            flags: self.descriptor.root.flags,
            recorded: self.descriptor.root.recorded,
            identifier: self.descriptor.root.identifier.clone(),
            rock_ridge: RockRidge::default(),
        };
        for (i, component) in components.iter().enumerate() {
            let children = self.list_directory(&current).await?;
            let found = children
                .into_iter()
                .find(|c| diskit_fs::names_equal(&self.display_name(c), component, false))
                .ok_or_else(|| Error::NotFound(ctx!("iso9660", "path component {component:?} not found")))?;
            let is_last = i == components.len() - 1;
            if !is_last && found.flags & FILE_FLAG_DIRECTORY == 0 {
                return Err(Error::NotFound(ctx!("iso9660", "{component:?} is not a directory")));
            }
            current = found;
        }
        Ok(current)
    }
}

/// Matches the three registered ISO-2375 escape sequences (`%/@`, `%/C`,
/// `%/E`) that mark a supplementary volume descriptor as Joliet UCS-2
/// level 1/2/3.
fn is_joliet_escape(bytes: &[u8]) -> bool {
    bytes.windows(3).any(|w| w[0] == 0x25 && w[1] == 0x2F && matches!(w[2], 0x40 | 0x43 | 0x45))
}

fn strip_version(name: &str) -> String {
    match name.rfind(';') {
        Some(idx) => name[..idx].to_string(),
        None => name.to_string(),
    }
}

fn both_endian_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[0..4].try_into().unwrap())
}

fn recorded_date_time(bytes: &[u8]) -> Option<time::OffsetDateTime> {
    if bytes.len() < 7 {
        return None;
    }
    let year = 1900 + bytes[0] as i32;
    let month = bytes[1];
    let day = bytes[2];
    if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    let date = time::Date::from_calendar_date(year, time::Month::try_from(month).ok()?, day).ok()?;
    let t = time::Time::from_hms(bytes[3], bytes[4], bytes[5]).ok()?;
    Some(time::PrimitiveDateTime::new(date, t).assume_utc())
}

fn parse_directory_record(bytes: &[u8], name_encoding: &[u8]) -> Result<RawDirEntry> {
    if bytes.len() < 33 {
        return Err(Error::Truncated(ctx!("iso9660", "directory record short read")));
    }
    let extent_location = both_endian_u32(&bytes[2..10]);
    let data_length = both_endian_u32(&bytes[10..18]);
    let recorded = recorded_date_time(&bytes[18..25]);
    let flags = bytes[25];
    let identifier_length = bytes[32] as usize;
    let identifier_end = 33 + identifier_length;
    if identifier_end > bytes.len() {
        return Err(Error::Truncated(ctx!("iso9660", "directory record name exceeds record length")));
    }
    let identifier_bytes = &bytes[33..identifier_end];
    let identifier = if identifier_bytes == [0u8] {
        "\u{0}".to_string()
    } else if identifier_bytes == [1u8] {
        "\u{1}".to_string()
    } else if name_encoding == b"joliet" {
        let units: Vec<u16> = identifier_bytes.chunks_exact(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
        char::decode_utf16(units).map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER)).collect()
    } else {
        String::from_utf8_lossy(identifier_bytes).into_owned()
    };

    // The system-use area starts on a 2-byte boundary relative to the
    // record; a padding byte follows an odd-length identifier.
    let su_start = if identifier_end % 2 != 0 { identifier_end + 1 } else { identifier_end };
    let rock_ridge = if su_start < bytes.len() { parse_rock_ridge(&bytes[su_start..]) } else { RockRidge::default() };

    Ok(RawDirEntry { extent_location, data_length, flags, recorded, identifier, rock_ridge })
}

/// Scans a directory record's system-use area for Rock Ridge `NM` (name),
/// `PX` (POSIX attributes) and `SL` (symlink target) entries. `CE`
/// continuation areas are not followed: multi-entry continuations are rare
/// in practice and the unextended name/attributes are still usable.
fn parse_rock_ridge(bytes: &[u8]) -> RockRidge {
    let mut rr = RockRidge::default();
    let mut pos = 0usize;
    let mut name = String::new();
    while pos + 4 <= bytes.len() {
        let signature = [bytes[pos], bytes[pos + 1]];
        let length = bytes[pos + 2] as usize;
        if length < 4 || pos + length > bytes.len() {
            break;
        }
        let payload = &bytes[pos + 4..pos + length];
        match &signature {
            b"NM" => {
                if !payload.is_empty() {
                    let flags = payload[0];
                    if flags & 0x06 == 0 {
                        name.push_str(&String::from_utf8_lossy(&payload[1..]));
                    }
                }
            }
            b"PX" => {
                if payload.len() >= 16 {
                    rr.mode = Some(both_endian_u32(&payload[0..8]));
                    rr.uid = Some(both_endian_u32(&payload[8..16]));
                    if payload.len() >= 24 {
                        rr.gid = Some(both_endian_u32(&payload[16..24]));
                    }
                }
            }
            b"SL" => {
                if payload.len() > 1 {
                    rr.symlink_target = Some(parse_symlink_components(&payload[1..]));
                }
            }
            _ => {}
        }
        pos += length;
    }
    if !name.is_empty() {
        rr.name = Some(name);
    }
    rr
}

fn parse_symlink_components(bytes: &[u8]) -> String {
    let mut parts = Vec::new();
    let mut pos = 0usize;
    while pos + 2 <= bytes.len() {
        let flags = bytes[pos];
        let len = bytes[pos + 1] as usize;
        if pos + 2 + len > bytes.len() {
            break;
        }
        let component = &bytes[pos + 2..pos + 2 + len];
        if flags & 0x02 != 0 {
            parts.push(".".to_string());
        } else if flags & 0x04 != 0 {
            parts.push("..".to_string());
        } else if flags & 0x08 != 0 {
            parts.push("".to_string());
        } else {
            parts.push(String::from_utf8_lossy(component).into_owned());
        }
        pos += 2 + len;
    }
    parts.join("/")
}

fn attributes_for(entry: &RawDirEntry) -> FileAttributes {
    let mut bits = 0u32;
    if entry.flags & FILE_FLAG_DIRECTORY != 0 {
        bits |= FileAttributes::DIRECTORY;
    }
    if entry.rock_ridge.symlink_target.is_some() {
        bits |= FileAttributes::SYMLINK;
    }
    FileAttributes(bits)
}

#[maybe_async::maybe_async]
impl FileSystemReader for Reader {
    fn case_sensitive(&self) -> bool {
        false
    }

    async fn stat(&self, path: &str) -> Result<DirEntry> {
        let entry = self.lookup(path).await?;
        Ok(DirEntry {
            name: self.display_name(&entry),
            attributes: attributes_for(&entry),
            times: Timestamps { modified: entry.recorded, ..Timestamps::default() },
            size: entry.data_length as u64,
            is_directory: entry.flags & FILE_FLAG_DIRECTORY != 0,
            is_symlink: entry.rock_ridge.symlink_target.is_some(),
            stream_count: 1,
        })
    }

    async fn enumerate(&self, path: &str) -> Result<Vec<DirEntry>> {
        let entry = self.lookup(path).await?;
        if entry.flags & FILE_FLAG_DIRECTORY == 0 {
            return Err(Error::NotFound(ctx!("iso9660", "{path} is not a directory")));
        }
        let children = self.list_directory(&entry).await?;
        Ok(children
            .iter()
            .map(|c| DirEntry {
                name: self.display_name(c),
                attributes: attributes_for(c),
                times: Timestamps { modified: c.recorded, ..Timestamps::default() },
                size: c.data_length as u64,
                is_directory: c.flags & FILE_FLAG_DIRECTORY != 0,
                is_symlink: c.rock_ridge.symlink_target.is_some(),
                stream_count: 1,
            })
            .collect())
    }

    async fn open_file(&self, path: &str) -> Result<Arc<dyn SparseStream>> {
        let entry = self.lookup(path).await?;
        if entry.flags & FILE_FLAG_DIRECTORY != 0 {
            return Err(Error::NotFound(ctx!("iso9660", "{path} is a directory")));
        }
        Ok(Arc::new(SubStream::new(
            self.stream.clone(),
            entry.extent_location as u64 * SECTOR_SIZE,
            entry.data_length as u64,
        )?))
    }

    async fn path_to_extents(&self, path: &str) -> Result<Vec<Extent>> {
        let entry = self.lookup(path).await?;
        Ok(vec![Extent::new(entry.extent_location as u64 * SECTOR_SIZE, entry.data_length as u64)])
    }

    async fn read_link(&self, path: &str) -> Result<String> {
        let entry = self.lookup(path).await?;
        entry
            .rock_ridge
            .symlink_target
            .ok_or_else(|| Error::NotFound(ctx!("iso9660", "{path} is not a Rock Ridge symlink")))
    }

    async fn unix_info(&self, path: &str) -> Result<Option<UnixInfo>> {
        let entry = self.lookup(path).await?;
        Ok(entry.rock_ridge.mode.map(|mode| UnixInfo {
            uid: entry.rock_ridge.uid.unwrap_or(0),
            gid: entry.rock_ridge.gid.unwrap_or(0),
            mode,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joliet_escape_sequence_level1_is_recognized() {
        let mut bytes = vec![0u8; 32];
        bytes[0] = 0x25;
        bytes[1] = 0x2F;
        bytes[2] = 0x40;
        assert!(is_joliet_escape(&bytes));
    }

    #[test]
    fn non_joliet_escape_sequence_is_rejected() {
        let bytes = vec![0u8; 32];
        assert!(!is_joliet_escape(&bytes));
    }

    #[test]
    fn version_suffix_is_stripped() {
        assert_eq!(strip_version("FOO.TXT;1"), "FOO.TXT");
        assert_eq!(strip_version("NOVERSION"), "NOVERSION");
    }

    #[test]
    fn rock_ridge_nm_overrides_identifier() {
        let mut bytes = Vec::new();
        let payload = b"\0longname.txt";
        bytes.extend_from_slice(b"NM");
        bytes.push((4 + payload.len()) as u8);
        bytes.push(1);
        bytes.extend_from_slice(payload);
        let rr = parse_rock_ridge(&bytes);
        assert_eq!(rr.name.as_deref(), Some("longname.txt"));
    }
}
