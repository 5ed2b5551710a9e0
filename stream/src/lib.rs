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

//! Sparse stream and extent-set primitives.
//!
//! Every container, partition window, logical volume and file-system content
//! stream in the workspace implements [`SparseStream`]. An extent set tells a
//! caller which byte ranges are backed by real data; everything else reads as
//! zero. [`SubStream`], [`ConcatStream`] and [`ZeroStream`] compose these
//! streams without copying; [`BufferedStream`] adds a one-block read cache;
//! [`HashObservingStream`] drives a streaming digest as a caller reads
//! through it.

use std::sync::{Arc, Mutex};

use diskit_bytes::StreamingDigest;
use diskit_err::{ctx, Error, Result};

/// A contiguous half-open byte range `[offset, offset + length)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    fn adjacent_or_overlapping(&self, other: &Extent) -> bool {
        self.offset <= other.end() && other.offset <= self.end()
    }

    fn intersection(&self, other: &Extent) -> Option<Extent> {
        let start = self.offset.max(other.offset);
        let end = self.end().min(other.end());
        (start < end).then(|| Extent::new(start, end - start))
    }
}

/// An ordered, non-overlapping, non-adjacent set of extents.
///
/// Every public constructor and combinator normalizes its result: sorted by
/// offset, zero-length extents dropped, adjacent extents merged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentSet(Vec<Extent>);

impl ExtentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_extents(mut extents: Vec<Extent>) -> Self {
        extents.retain(|e| !e.is_empty());
        extents.sort_by_key(|e| e.offset);
        Self(normalize(extents))
    }

    pub fn single(offset: u64, length: u64) -> Self {
        Self::from_extents(vec![Extent::new(offset, length)])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Extent> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.0
            .binary_search_by(|e| {
                if offset < e.offset {
                    std::cmp::Ordering::Greater
                } else if offset >= e.end() {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Shifts every extent by `delta`, used when splicing a child stream's
    /// extents into a [`ConcatStream`] or [`SubStream`]'s coordinate space.
    pub fn shifted(&self, delta: u64) -> Self {
        Self(self.0.iter().map(|e| Extent::new(e.offset + delta, e.length)).collect())
    }

    /// Windows the set to `[start, start + length)`, shifting results to be
    /// relative to `start`.
    pub fn windowed(&self, start: u64, length: u64) -> Self {
        let window = Extent::new(start, length);
        let extents = self
            .0
            .iter()
            .filter_map(|e| e.intersection(&window))
            .map(|e| Extent::new(e.offset - start, e.length))
            .collect();
        Self(extents)
    }

    pub fn union(&self, other: &ExtentSet) -> ExtentSet {
        let mut merged: Vec<Extent> = self.0.iter().chain(other.0.iter()).copied().collect();
        merged.sort_by_key(|e| e.offset);
        ExtentSet(normalize(merged))
    }

    pub fn intersect(&self, other: &ExtentSet) -> ExtentSet {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.0.len() && j < other.0.len() {
            if let Some(overlap) = self.0[i].intersection(&other.0[j]) {
                out.push(overlap);
            }
            if self.0[i].end() < other.0[j].end() {
                i += 1;
            } else {
                j += 1;
            }
        }
        ExtentSet(normalize(out))
    }

    pub fn subtract(&self, other: &ExtentSet) -> ExtentSet {
        let mut out = Vec::new();
        for e in &self.0 {
            let mut remaining = vec![*e];
            for o in &other.0 {
                remaining = remaining
                    .into_iter()
                    .flat_map(|r| subtract_one(r, *o))
                    .collect();
            }
            out.extend(remaining);
        }
        out.sort_by_key(|e| e.offset);
        ExtentSet(normalize(out))
    }

    /// The complement of this set within `[0, bounds)`.
    pub fn complement(&self, bounds: u64) -> ExtentSet {
        let full = ExtentSet::single(0, bounds);
        full.subtract(self)
    }
}

fn subtract_one(a: Extent, b: Extent) -> Vec<Extent> {
    match a.intersection(&b) {
        None => vec![a],
        Some(overlap) => {
            let mut out = Vec::new();
            if a.offset < overlap.offset {
                out.push(Extent::new(a.offset, overlap.offset - a.offset));
            }
            if overlap.end() < a.end() {
                out.push(Extent::new(overlap.end(), a.end() - overlap.end()));
            }
            out
        }
    }
}

/// Sorts-then-merges adjacent/overlapping extents. `extents` must already be
/// sorted by offset.
fn normalize(extents: Vec<Extent>) -> Vec<Extent> {
    let mut out: Vec<Extent> = Vec::with_capacity(extents.len());
    for e in extents {
        if e.is_empty() {
            continue;
        }
        match out.last_mut() {
            Some(last) if last.adjacent_or_overlapping(&e) => {
                let end = last.end().max(e.end());
                last.length = end - last.offset;
            }
            _ => out.push(e),
        }
    }
    out
}

/// Common surface every readable region of a virtual disk, partition,
/// logical volume or file's content implements.
///
/// The `async` feature recompiles every method here as an `async fn`
/// suspending at the same points as the synchronous build; the default,
/// synchronous build is what every reader in this workspace exercises.
#[maybe_async::maybe_async]
pub trait SparseStream: Send {
    /// Total addressable length, in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The set of byte ranges backed by real data; everything outside reads
    /// as zero.
    async fn extents(&self) -> Result<ExtentSet>;

    /// Reads `buf.len()` bytes starting at `offset`. Reading past `len()`
    /// fails with [`Error::Truncated`]; reading a range with no extent
    /// coverage yields zeros.
    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// Mutating surface for writable containers (the dynamic/differencing VHD
/// layers, the NTFS writer path).
#[maybe_async::maybe_async]
pub trait WritableSparseStream: SparseStream {
    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    async fn clear_at(&self, offset: u64, length: u64) -> Result<()>;

    async fn set_len(&self, length: u64) -> Result<()>;
}

fn check_bounds(offset: u64, buf_len: u64, total_len: u64, component: &'static str) -> Result<()> {
    if offset.checked_add(buf_len).map_or(true, |end| end > total_len) {
        return Err(Error::Truncated(
            ctx!(component, "read of {buf_len} bytes at {offset} exceeds length {total_len}")
                .at(offset),
        ));
    }
    Ok(())
}

/// Lets `Arc<dyn SparseStream>` (and `Arc` of any concrete stream type) be
/// used directly as the `S` parameter of [`SubStream`]/[`ConcatStream`],
/// which every file-system reader needs to splice fragments of a shared,
/// reference-counted underlying stream together.
#[maybe_async::maybe_async]
impl<T: SparseStream + ?Sized> SparseStream for Arc<T> {
    fn len(&self) -> u64 {
        (**self).len()
    }

    async fn extents(&self) -> Result<ExtentSet> {
        (**self).extents().await
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf).await
    }
}

/// A stream with no defined data at all: every read yields zeros.
pub struct ZeroStream {
    length: u64,
}

impl ZeroStream {
    pub fn new(length: u64) -> Self {
        Self { length }
    }
}

#[maybe_async::maybe_async]
impl SparseStream for ZeroStream {
    fn len(&self) -> u64 {
        self.length
    }

    async fn extents(&self) -> Result<ExtentSet> {
        Ok(ExtentSet::new())
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len() as u64, self.length, "zero-stream")?;
        buf.fill(0);
        Ok(())
    }
}

/// Windows a base stream to `[start, start + length)`, re-based to `0`.
pub struct SubStream<S> {
    base: S,
    start: u64,
    length: u64,
}

impl<S: SparseStream> SubStream<S> {
    pub fn new(base: S, start: u64, length: u64) -> Result<Self> {
        if start.checked_add(length).map_or(true, |end| end > base.len()) {
            return Err(Error::CorruptStructure(ctx!(
                "sub-stream",
                "window [{start}, {end}) exceeds base length {base_len}",
                end = start + length,
                base_len = base.len()
            )));
        }
        Ok(Self { base, start, length })
    }

    pub fn into_base(self) -> S {
        self.base
    }

    pub fn base(&self) -> &S {
        &self.base
    }
}

#[maybe_async::maybe_async]
impl<S: SparseStream> SparseStream for SubStream<S> {
    fn len(&self) -> u64 {
        self.length
    }

    async fn extents(&self) -> Result<ExtentSet> {
        Ok(self.base.extents().await?.windowed(self.start, self.length))
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len() as u64, self.length, "sub-stream")?;
        self.base.read_at(self.start + offset, buf).await
    }
}

#[maybe_async::maybe_async]
impl<S: WritableSparseStream> WritableSparseStream for SubStream<S> {
    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_bounds(offset, buf.len() as u64, self.length, "sub-stream")?;
        self.base.write_at(self.start + offset, buf).await
    }

    async fn clear_at(&self, offset: u64, length: u64) -> Result<()> {
        check_bounds(offset, length, self.length, "sub-stream")?;
        self.base.clear_at(self.start + offset, length).await
    }

    async fn set_len(&self, _length: u64) -> Result<()> {
        Err(Error::NotWritable(ctx!(
            "sub-stream",
            "cannot resize a windowed sub-stream"
        )))
    }
}

/// Concatenates child streams end-to-end into one logical stream. Used to
/// splice stacked-volume segments and multi-fragment file content together.
pub struct ConcatStream<S> {
    children: Vec<S>,
    offsets: Vec<u64>,
    length: u64,
}

impl<S: SparseStream> ConcatStream<S> {
    pub fn new(children: Vec<S>) -> Self {
        let mut offsets = Vec::with_capacity(children.len());
        let mut length = 0u64;
        for child in &children {
            offsets.push(length);
            length += child.len();
        }
        Self { children, offsets, length }
    }

    /// Finds the child index covering `offset`, plus the offset within it.
    fn locate(&self, offset: u64) -> Option<(usize, u64)> {
        if self.children.is_empty() {
            return None;
        }
        let idx = match self.offsets.binary_search(&offset) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        Some((idx, offset - self.offsets[idx]))
    }
}

#[maybe_async::maybe_async]
impl<S: SparseStream> SparseStream for ConcatStream<S> {
    fn len(&self) -> u64 {
        self.length
    }

    async fn extents(&self) -> Result<ExtentSet> {
        let mut all = Vec::new();
        for (child, &base) in self.children.iter().zip(&self.offsets) {
            all.extend(child.extents().await?.shifted(base).iter().copied());
        }
        Ok(ExtentSet::from_extents(all))
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len() as u64, self.length, "concat-stream")?;
        let mut remaining = buf;
        let mut pos = offset;
        while !remaining.is_empty() {
            let (idx, local_offset) = self
                .locate(pos)
                .ok_or_else(|| Error::Truncated(ctx!("concat-stream", "no child at {pos}").at(pos)))?;
            let child = &self.children[idx];
            let avail = (child.len() - local_offset) as usize;
            let take = avail.min(remaining.len());
            child.read_at(local_offset, &mut remaining[..take]).await?;
            pos += take as u64;
            remaining = &mut remaining[take..];
        }
        Ok(())
    }
}

/// A fixed-size, most-recently-used single-block read cache over a base
/// stream. Repeated small reads within one block (BPB/superblock re-reads)
/// issue a single underlying I/O.
pub struct BufferedStream<S> {
    base: S,
    block_size: u64,
    cache: Mutex<Option<(u64, Vec<u8>)>>,
}

impl<S: SparseStream> BufferedStream<S> {
    pub fn new(base: S, block_size: u64) -> Self {
        Self {
            base,
            block_size,
            cache: Mutex::new(None),
        }
    }

    pub fn into_base(self) -> S {
        self.base
    }
}

#[maybe_async::maybe_async]
impl<S: SparseStream> SparseStream for BufferedStream<S> {
    fn len(&self) -> u64 {
        self.base.len()
    }

    async fn extents(&self) -> Result<ExtentSet> {
        self.base.extents().await
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_bounds(offset, buf.len() as u64, self.base.len(), "buffered-stream")?;
        let block = offset / self.block_size;
        let block_start = block * self.block_size;
        let block_len = self.block_size.min(self.base.len() - block_start) as usize;

        // Fast path only when the whole request sits inside one cached block.
        if offset + buf.len() as u64 <= block_start + block_len as u64 {
            let mut guard = self.cache.lock().unwrap();
            if !matches!(&*guard, Some((cached, _)) if *cached == block_start) {
                let mut data = vec![0u8; block_len];
                self.base.read_at(block_start, &mut data).await?;
                *guard = Some((block_start, data));
            }
            let (_, data) = guard.as_ref().unwrap();
            let start = (offset - block_start) as usize;
            buf.copy_from_slice(&data[start..start + buf.len()]);
            return Ok(());
        }

        self.base.read_at(offset, buf).await
    }
}

#[maybe_async::maybe_async]
impl<S: WritableSparseStream> WritableSparseStream for BufferedStream<S> {
    async fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let block_start = (offset / self.block_size) * self.block_size;
        let mut guard = self.cache.lock().unwrap();
        if matches!(&*guard, Some((cached, _)) if *cached == block_start) {
            *guard = None;
        }
        drop(guard);
        self.base.write_at(offset, buf).await
    }

    async fn clear_at(&self, offset: u64, length: u64) -> Result<()> {
        *self.cache.lock().unwrap() = None;
        self.base.clear_at(offset, length).await
    }

    async fn set_len(&self, length: u64) -> Result<()> {
        *self.cache.lock().unwrap() = None;
        self.base.set_len(length).await
    }
}

/// Wraps a read-only stream and drives a [`StreamingDigest`] over reads as
/// they happen, for WIM integrity verification. Reads must be contiguous
/// from the current hash position; any seek backwards before the hash
/// pointer fails.
pub struct HashObservingStream<S> {
    base: S,
    digest: Mutex<Option<Box<dyn StreamingDigest>>>,
    position: Mutex<u64>,
}

impl<S: SparseStream> HashObservingStream<S> {
    pub fn new(base: S, digest: Box<dyn StreamingDigest>) -> Self {
        Self {
            base,
            digest: Mutex::new(Some(digest)),
            position: Mutex::new(0),
        }
    }

    /// Consumes the stream, returning the finalized digest bytes. Fails if
    /// the stream was never read to completion... callers that only need a
    /// partial hash should not use this wrapper.
    pub fn finalize(self) -> Vec<u8> {
        self.digest
            .into_inner()
            .unwrap()
            .expect("finalize called twice")
            .finalize()
    }
}

#[maybe_async::maybe_async]
impl<S: SparseStream> SparseStream for HashObservingStream<S> {
    fn len(&self) -> u64 {
        self.base.len()
    }

    async fn extents(&self) -> Result<ExtentSet> {
        self.base.extents().await
    }

    async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        {
            let pos = self.position.lock().unwrap();
            if offset < *pos {
                return Err(Error::CorruptStructure(ctx!(
                    "hash-observing-stream",
                    "seek to {offset} precedes hash pointer at {pos}"
                )
                .at(offset)));
            }
            if offset > *pos {
                return Err(Error::CorruptStructure(ctx!(
                    "hash-observing-stream",
                    "reads must be contiguous; expected {pos}, got {offset}"
                )
                .at(offset)));
            }
        }
        self.base.read_at(offset, buf).await?;
        let mut digest = self.digest.lock().unwrap();
        if let Some(d) = digest.as_mut() {
            d.update(buf);
        }
        *self.position.lock().unwrap() += buf.len() as u64;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // These tests run under the default (`is_sync`) feature, where
    // `#[maybe_async::maybe_async]` compiles every trait method as a plain
    // synchronous `fn` and strips the `.await`s below at macro-expansion
    // time.
    fn run<T>(result: T) -> T {
        result
    }

    #[test]
    fn union_is_commutative_and_merges_adjacency() {
        let a = ExtentSet::from_extents(vec![Extent::new(0, 10), Extent::new(20, 10)]);
        let b = ExtentSet::from_extents(vec![Extent::new(10, 10)]);
        let u1 = a.union(&b);
        let u2 = b.union(&a);
        assert_eq!(u1, u2);
        // [0,10) + [10,20) + [20,30) merges into one run.
        assert_eq!(u1, ExtentSet::single(0, 30));
    }

    #[test]
    fn intersect_with_union_of_self_is_self() {
        let a = ExtentSet::from_extents(vec![Extent::new(0, 5), Extent::new(100, 5)]);
        let b = ExtentSet::single(3, 50);
        assert_eq!(a.intersect(&a.union(&b)), a);
    }

    #[test]
    fn subtract_self_is_empty() {
        let a = ExtentSet::from_extents(vec![Extent::new(0, 5), Extent::new(50, 5)]);
        assert_eq!(a.subtract(&a), ExtentSet::new());
    }

    #[test]
    fn n_adjacent_unit_extents_normalize_to_one_run() {
        let extents: Vec<Extent> = (0..16).map(|i| Extent::new(i, 1)).collect();
        let set = ExtentSet::from_extents(extents);
        assert_eq!(set.len(), 1);
        assert_eq!(set.iter().next().unwrap(), &Extent::new(0, 16));
    }

    #[test]
    fn complement_within_bounds() {
        let a = ExtentSet::single(10, 10);
        let comp = a.complement(30);
        assert_eq!(comp, ExtentSet::from_extents(vec![Extent::new(0, 10), Extent::new(20, 10)]));
    }

    #[test]
    fn zero_stream_reads_zero() {
        let z = ZeroStream::new(16);
        let mut buf = [0xFFu8; 8];
        run(z.read_at(4, &mut buf)).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn concat_stream_reads_across_children() {
        let children = vec![ZeroStream::new(4), ZeroStream::new(4)];
        let concat = ConcatStream::new(children);
        assert_eq!(concat.len(), 8);
        let mut buf = [0u8; 8];
        run(concat.read_at(0, &mut buf)).unwrap();
        assert_eq!(buf, [0u8; 8]);
    }

    #[test]
    fn hash_observing_stream_rejects_non_contiguous_read() {
        use diskit_bytes::Sha1Digest;
        let base = ZeroStream::new(32);
        let hashing = HashObservingStream::new(base, Box::new(Sha1Digest::new()));
        let mut buf = [0u8; 8];
        run(hashing.read_at(0, &mut buf)).unwrap();
        let err = run(hashing.read_at(16, &mut buf));
        assert!(err.is_err());
    }
}
