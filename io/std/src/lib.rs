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

//! The leaf byte source every container in this workspace opens on top of: a
//! plain `std::fs::File`, treated as fully present for its whole length.

use std::{
    fs::{File, OpenOptions},
    os::unix::fs::FileExt,
    path::Path,
};

use diskit_err::{ctx, Error, Result};
use diskit_stream::{ExtentSet, SparseStream, WritableSparseStream};

pub struct FileStream {
    file: File,
    length: u64,
}

impl FileStream {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| {
            Error::ReadError(ctx!("io-std", "open {:?}: {e}", path.as_ref()))
        })?;
        let length = file
            .metadata()
            .map_err(|e| Error::ReadError(ctx!("io-std", "stat: {e}")))?
            .len();
        Ok(Self { file, length })
    }

    pub fn open_read_write(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| Error::ReadError(ctx!("io-std", "open {:?}: {e}", path.as_ref())))?;
        let length = file
            .metadata()
            .map_err(|e| Error::ReadError(ctx!("io-std", "stat: {e}")))?
            .len();
        Ok(Self { file, length })
    }
}

#[maybe_async::maybe_async]
impl SparseStream for FileStream {
    fn len(&self) -> u64 {
        self.length
    }

    async fn extents(&self) -> Result<ExtentSet> {
        Ok(ExtentSet::single(0, self.length))
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if offset.checked_add(buf.len() as u64).map_or(true, |end| end > self.length) {
            return Err(Error::Truncated(
                ctx!("io-std", "read past end of file").at(offset),
            ));
        }
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::ReadError(ctx!("io-std", "read_at({offset}): {e}").at(offset)))
    }
}

#[maybe_async::maybe_async]
impl WritableSparseStream for FileStream {
    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::ReadError(ctx!("io-std", "write_at({offset}): {e}").at(offset)))
    }

    async fn clear_at(&self, offset: u64, length: u64) -> Result<()> {
        let zeros = vec![0u8; length as usize];
        self.write_at(offset, &zeros).await
    }

    async fn set_len(&self, length: u64) -> Result<()> {
        self.file
            .set_len(length)
            .map_err(|e| Error::ReadError(ctx!("io-std", "set_len: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_back_what_was_written() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"hello, diskit").unwrap();
        tmp.flush().unwrap();

        let stream = FileStream::open(tmp.path()).unwrap();
        assert_eq!(stream.len(), 13);
        let mut buf = [0u8; 5];
        stream.read_at(7, &mut buf).unwrap();
        assert_eq!(&buf, b"diski");
    }

    #[test]
    fn read_past_end_fails() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"short").unwrap();
        tmp.flush().unwrap();
        let stream = FileStream::open(tmp.path()).unwrap();
        let mut buf = [0u8; 10];
        assert!(stream.read_at(0, &mut buf).is_err());
    }
}
