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

//! The contract every `diskit_fs_*` reader implements, and nothing else.
//!
//! This crate carries no on-disk structures of its own: it is the shared
//! vocabulary (directory entries, attributes, path normalization, the
//! `FileSystemReader` trait) that lets the VFS façade and the higher-level
//! `diskit_vfs::FileSystem` dispatch enum treat an ext reader and an NTFS
//! reader the same way.

use std::sync::Arc;

use diskit_err::Result;
use diskit_stream::{Extent, SparseStream};

/// Bits recognized across readers; not every reader sets every bit (FAT-family
/// readers use `READ_ONLY`/`HIDDEN`/`SYSTEM`/`ARCHIVE`/`DIRECTORY`; ext/UDF set
/// only `DIRECTORY`/`SYMLINK`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileAttributes(pub u32);

impl FileAttributes {
    pub const READ_ONLY: u32 = 1 << 0;
    pub const HIDDEN: u32 = 1 << 1;
    pub const SYSTEM: u32 = 1 << 2;
    pub const DIRECTORY: u32 = 1 << 4;
    pub const ARCHIVE: u32 = 1 << 5;
    pub const REPARSE_POINT: u32 = 1 << 6;
    pub const SYMLINK: u32 = 1 << 7;
    pub const COMPRESSED: u32 = 1 << 8;
    pub const ENCRYPTED: u32 = 1 << 9;

    pub fn has(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub fn with(mut self, bit: u32) -> Self {
        self.0 |= bit;
        self
    }

    pub fn is_directory(self) -> bool {
        self.has(Self::DIRECTORY)
    }

    pub fn is_symlink(self) -> bool {
        self.has(Self::SYMLINK)
    }
}

/// Reader-reported timestamps. Individual readers leave fields `None` when
/// the on-disk structure does not carry that timestamp (e.g. FAT12/16 has no
/// access time finer than a date).
#[derive(Debug, Clone, Copy, Default)]
pub struct Timestamps {
    pub created: Option<time::OffsetDateTime>,
    pub modified: Option<time::OffsetDateTime>,
    pub accessed: Option<time::OffsetDateTime>,
}

/// Unix ownership/permission bits, for the readers that carry them (ext,
/// UDF, HFS+); `None` from [`FileSystemReader::unix_info`] for readers that
/// don't (FAT, ISO9660, WIM).
#[derive(Debug, Clone, Copy)]
pub struct UnixInfo {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
}

/// One directory listing row. Mirrors §3's `DirEntry` abstraction exactly.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub attributes: FileAttributes,
    pub times: Timestamps,
    pub size: u64,
    pub is_directory: bool,
    pub is_symlink: bool,
    pub stream_count: u32,
}

/// `short_name_creation` recognized values (NTFS-specific; §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShortNameCreation {
    #[default]
    Default,
    Disabled,
    Enabled,
}

/// Per-reader mount options (§6). Every field defaults to the
/// spec-documented default; readers ignore options that don't apply to them.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Non-Unicode codepage for FAT/ISO9660 short names; `None` means
    /// UTF-8/ASCII, the default.
    pub file_name_encoding: Option<&'static encoding_rs::Encoding>,
    /// ISO9660: strip the `;N` version suffix on output.
    pub hide_versions: bool,
    /// NTFS: whether to synthesize 8.3 short names on write (core is
    /// read-only, so this only affects the writer path when enabled).
    pub short_name_creation: ShortNameCreation,
    /// NTFS: prefer the (possibly stale) length cached in the directory
    /// entry over the authoritative file-record length.
    pub file_length_from_directory_entries: bool,
    /// NTFS: omit hidden/system entries from `enumerate`.
    pub hide_hidden: bool,
    pub hide_system: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            file_name_encoding: None,
            hide_versions: false,
            short_name_creation: ShortNameCreation::default(),
            file_length_from_directory_entries: false,
            hide_hidden: false,
            hide_system: false,
        }
    }
}

/// The contract every read-only file-system reader in the workspace
/// satisfies (§4.5). `path` arguments are absolute, `/`-separated (`\\`
/// accepted as an input synonym, see [`split_path`]).
///
/// Every method that can touch the underlying stream is `#[maybe_async]`:
/// under the default `is_sync` feature these are plain synchronous trait
/// methods (a `dyn FileSystemReader` is usable exactly as written below);
/// enabling the `async` feature recompiles the same bodies as `async fn`,
/// matching every reader's own internal suspension points (§5).
#[maybe_async::maybe_async]
pub trait FileSystemReader: Send + Sync {
    /// `true` for ext/HFS+ (case-sensitive lookups), `false` for
    /// NTFS/FAT/ISO9660-Joliet/UDF/WIM (case-insensitive).
    fn case_sensitive(&self) -> bool;

    async fn stat(&self, path: &str) -> Result<DirEntry>;

    async fn enumerate(&self, path: &str) -> Result<Vec<DirEntry>>;

    async fn open_file(&self, path: &str) -> Result<Arc<dyn SparseStream>>;

    async fn path_to_extents(&self, path: &str) -> Result<Vec<Extent>>;

    async fn read_link(&self, _path: &str) -> Result<String> {
        Err(diskit_err::Error::UnsupportedFeature(diskit_err::ctx!(
            "fs",
            "reader does not support symbolic links"
        )))
    }

    async fn unix_info(&self, _path: &str) -> Result<Option<UnixInfo>> {
        Ok(None)
    }

    async fn alternate_stream_names(&self, _path: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn open_alternate_stream(&self, path: &str, _name: &str) -> Result<Arc<dyn SparseStream>> {
        Err(diskit_err::Error::NotFound(diskit_err::ctx!(
            "fs",
            "no alternate streams on {path}"
        )))
    }
}

/// Splits an absolute path into normalized components: `\\` accepted as a
/// separator synonym, empty/`.` components dropped, a single trailing
/// separator ignored.
pub fn split_path(path: &str) -> Vec<String> {
    path.replace('\\', "/")
        .split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .map(str::to_owned)
        .collect()
}

/// Unicode simple case folding, used by every case-insensitive reader
/// (NTFS, FAT, ISO9660-Joliet, UDF, WIM) to compare path components.
pub fn names_equal(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        a.to_lowercase() == b.to_lowercase()
    }
}

/// Glob match for [`crate::vfs`]-style patterns (§4.7): `*` matches any run
/// including `.`, `?` matches any single character except `.`. A pattern
/// without a `.` is treated as if suffixed with `.`; `*` and `*.*` both
/// match everything.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    if pattern == "*" || pattern == "*.*" {
        return true;
    }
    let pattern = if !pattern.contains('.') {
        format!("{pattern}.")
    } else {
        pattern.to_string()
    };
    let name = if !name.contains('.') {
        format!("{name}.")
    } else {
        name.to_string()
    };
    glob_match_chars(pattern.as_bytes(), name.as_bytes())
}

fn glob_match_chars(pattern: &[u8], name: &[u8]) -> bool {
    match (pattern.first(), name.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match_chars(&pattern[1..], name)
                || (!name.is_empty() && glob_match_chars(pattern, &name[1..]))
        }
        (Some(b'?'), Some(&c)) if c != b'.' => glob_match_chars(&pattern[1..], &name[1..]),
        (Some(&p), Some(&c)) if p == c => glob_match_chars(&pattern[1..], &name[1..]),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_accepts_backslash_and_drops_empties() {
        assert_eq!(split_path("\\foo\\bar\\"), vec!["foo", "bar"]);
        assert_eq!(split_path("/a//b/./c"), vec!["a", "b", "c"]);
    }

    #[test]
    fn case_insensitive_names_equal_is_unicode_aware() {
        assert!(names_equal("FOO.TXT", "foo.txt", false));
        assert!(!names_equal("FOO.TXT", "foo.txt", true));
    }

    #[test]
    fn glob_star_matches_everything() {
        assert!(glob_match("*", "anything.ext"));
        assert!(glob_match("*.*", "anything.ext"));
    }

    #[test]
    fn glob_no_dot_suffix_implied() {
        assert!(glob_match("readme", "readme"));
        assert!(!glob_match("readme", "readme.txt"));
    }

    #[test]
    fn glob_question_mark_excludes_dot() {
        assert!(glob_match("fo?.txt", "foo.txt"));
        assert!(!glob_match("fo?.txt", "fo.txt"));
    }
}
