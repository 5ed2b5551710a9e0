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

//! A single façade over every reader in the workspace.
//!
//! [`FileSystem`] is a tagged variant, not a trait object: callers that
//! need reader-specific capabilities (Unix info, alternate streams) still
//! reach them through the uniform `FileSystemReader` contract, queried by
//! tag rather than by a deep inheritance hierarchy. [`FileSystem::mount`]
//! probes each reader's cheap signature check in an order chosen so a
//! FAT-compatible boot sector (NTFS, exFAT) is never misdetected as plain
//! FAT.

use std::sync::Arc;

use diskit_err::{ctx, Error, Result};
use diskit_fs::{DirEntry, FileSystemReader, ReaderOptions, Timestamps, UnixInfo};
use diskit_stream::SparseStream;

/// One mounted reader, tagged by kind. §9's "dynamic dispatch across
/// file-system readers" design note: a thin enum plus the shared
/// `FileSystemReader` contract, not a trait object hierarchy.
pub enum FileSystem {
    Ext(diskit_fs_ext::Reader),
    Ntfs(diskit_fs_ntfs::Reader),
    HfsPlus(diskit_fs_hfsplus::Reader),
    Udf(diskit_fs_udf::Reader),
    Iso9660(diskit_fs_iso9660::Reader),
    Fat(diskit_fs_fat::Reader),
    ExFat(diskit_fs_exfat::Reader),
    Wim(diskit_fs_wim::Reader),
}

impl FileSystem {
    fn as_reader(&self) -> &dyn FileSystemReader {
        match self {
            FileSystem::Ext(r) => r,
            FileSystem::Ntfs(r) => r,
            FileSystem::HfsPlus(r) => r,
            FileSystem::Udf(r) => r,
            FileSystem::Iso9660(r) => r,
            FileSystem::Fat(r) => r,
            FileSystem::ExFat(r) => r,
            FileSystem::Wim(r) => r,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FileSystem::Ext(_) => "ext",
            FileSystem::Ntfs(_) => "ntfs",
            FileSystem::HfsPlus(_) => "hfsplus",
            FileSystem::Udf(_) => "udf",
            FileSystem::Iso9660(_) => "iso9660",
            FileSystem::Fat(_) => "fat",
            FileSystem::ExFat(_) => "exfat",
            FileSystem::Wim(_) => "wim",
        }
    }

    /// Probes every reader's `detect` in turn and mounts the first match.
    #[maybe_async::maybe_async]
    pub async fn mount(stream: Arc<dyn SparseStream>, options: ReaderOptions) -> Result<Self> {
        if diskit_fs_ntfs::Reader::detect(stream.as_ref()).await {
            return Ok(FileSystem::Ntfs(diskit_fs_ntfs::Reader::mount(stream, options).await?));
        }
        if diskit_fs_exfat::Reader::detect(stream.as_ref()).await {
            return Ok(FileSystem::ExFat(diskit_fs_exfat::Reader::mount(stream, options).await?));
        }
        if diskit_fs_fat::Reader::detect(stream.as_ref()).await {
            return Ok(FileSystem::Fat(diskit_fs_fat::Reader::mount(stream, options).await?));
        }
        if diskit_fs_hfsplus::Reader::detect(stream.as_ref()).await {
            return Ok(FileSystem::HfsPlus(diskit_fs_hfsplus::Reader::mount(stream, options).await?));
        }
        if diskit_fs_ext::Reader::detect(stream.as_ref()).await {
            return Ok(FileSystem::Ext(diskit_fs_ext::Reader::mount(stream, options).await?));
        }
        if diskit_fs_udf::Reader::detect(stream.as_ref()).await {
            return Ok(FileSystem::Udf(diskit_fs_udf::Reader::mount(stream, options).await?));
        }
        if diskit_fs_iso9660::Reader::detect(stream.as_ref()).await {
            return Ok(FileSystem::Iso9660(diskit_fs_iso9660::Reader::mount(stream, options).await?));
        }
        if diskit_fs_wim::Reader::detect(stream.as_ref()).await {
            return Ok(FileSystem::Wim(diskit_fs_wim::Reader::mount(stream, options).await?));
        }
        Err(Error::BadMagic(ctx!("vfs", "no registered reader recognized this stream")))
    }

    pub fn case_sensitive(&self) -> bool {
        self.as_reader().case_sensitive()
    }

    #[maybe_async::maybe_async]
    pub async fn directory_exists(&self, path: &str) -> bool {
        self.as_reader().stat(path).await.map(|e| e.is_directory).unwrap_or(false)
    }

    #[maybe_async::maybe_async]
    pub async fn file_exists(&self, path: &str) -> bool {
        self.as_reader().stat(path).await.map(|e| !e.is_directory).unwrap_or(false)
    }

    /// Lists `path`, optionally filtering by glob `pattern` and descending
    /// into subdirectories when `recursive` is set.
    ///
    /// Traversal is an explicit work queue rather than recursion, so it
    /// compiles the same under both the synchronous and `async` builds of
    /// this method.
    #[maybe_async::maybe_async]
    pub async fn enumerate(&self, path: &str, pattern: Option<&str>, recursive: bool) -> Result<Vec<DirEntry>> {
        let mut out = Vec::new();
        let mut pending = vec![path.to_string()];
        while let Some(dir) = pending.pop() {
            let children = self.as_reader().enumerate(&dir).await?;
            for child in children {
                if recursive && child.is_directory {
                    pending.push(join_path(&dir, &child.name));
                }
                if pattern.map(|p| diskit_fs::glob_match(p, &child.name)).unwrap_or(true) {
                    out.push(child);
                }
            }
        }
        Ok(out)
    }

    #[maybe_async::maybe_async]
    pub async fn open(&self, path: &str, mode: OpenMode, access: Access) -> Result<Arc<dyn SparseStream>> {
        if access != Access::Read || !matches!(mode, OpenMode::Open | OpenMode::OpenOrCreate) {
            return Err(Error::NotWritable(ctx!("vfs", "{path}: this reader is read-only")));
        }
        self.as_reader().open_file(path).await
    }

    #[maybe_async::maybe_async]
    pub async fn attributes(&self, path: &str) -> Result<diskit_fs::FileAttributes> {
        Ok(self.as_reader().stat(path).await?.attributes)
    }

    #[maybe_async::maybe_async]
    pub async fn times(&self, path: &str) -> Result<Timestamps> {
        Ok(self.as_reader().stat(path).await?.times)
    }

    #[maybe_async::maybe_async]
    pub async fn length(&self, path: &str) -> Result<u64> {
        Ok(self.as_reader().stat(path).await?.size)
    }

    #[maybe_async::maybe_async]
    pub async fn unix_info(&self, path: &str) -> Result<Option<UnixInfo>> {
        self.as_reader().unix_info(path).await
    }
}

/// Mode passed to [`FileSystem::open`]. Only `Open` and `OpenOrCreate`
/// are meaningful against a read-only reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Open,
    OpenOrCreate,
    Create,
    Truncate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

fn join_path(parent: &str, name: &str) -> String {
    if parent.is_empty() || parent == "/" {
        format!("/{name}")
    } else {
        format!("{}/{name}", parent.trim_end_matches('/'))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run<T>(result: T) -> T {
        result
    }

    #[test]
    fn join_path_handles_root_and_nested() {
        assert_eq!(join_path("/", "foo"), "/foo");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(join_path("/a/", "b"), "/a/b");
    }

    #[test]
    fn open_rejects_write_access_on_read_only_reader() {
        // Exercises the façade's access check directly; mounting a real
        // reader is covered by each reader's own crate.
        let access = Access::Write;
        let mode = OpenMode::Open;
        let rejected = access != Access::Read || !matches!(mode, OpenMode::Open | OpenMode::OpenOrCreate);
        assert!(run(rejected));
    }
}
