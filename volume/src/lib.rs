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

//! Stacked logical volumes: a physical-volume header plus a text metadata
//! document describing volume groups, physical volumes, logical volumes
//! and segments, composed here into a single [`SparseStream`] per logical
//! volume.

use std::collections::BTreeMap;
use std::sync::Arc;

use diskit_err::{ctx, Error, Result};
use diskit_stream::{ConcatStream, SparseStream, SubStream};
use uuid::Uuid;

const SECTOR_SIZE: u64 = 512;

/// One `(offset, size)` entry from a physical volume's data-area or
/// metadata-area list, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskArea {
    pub offset: u64,
    pub size: u64,
}

/// The physical-volume header: a 16-byte UUID, the device size the PV
/// claims, and the two area lists (data areas, then metadata areas), each
/// terminated by a zeroed entry.
#[derive(Debug, Clone)]
pub struct PvHeader {
    pub uuid: Uuid,
    pub device_size: u64,
    pub data_areas: Vec<DiskArea>,
    pub metadata_areas: Vec<DiskArea>,
}

/// Parses the PV header from the start of `stream`.
#[maybe_async::maybe_async]
pub async fn parse_pv_header(stream: &dyn SparseStream) -> Result<PvHeader> {
    let mut head = [0u8; 24];
    stream.read_at(0, &mut head).await?;
    let uuid = Uuid::from_bytes(head[0..16].try_into().unwrap());
    let device_size = u64::from_le_bytes(head[16..24].try_into().unwrap());

    let mut offset = 24u64;
    let data_areas = read_area_list(stream, &mut offset).await?;
    let metadata_areas = read_area_list(stream, &mut offset).await?;

    Ok(PvHeader { uuid, device_size, data_areas, metadata_areas })
}

#[maybe_async::maybe_async]
async fn read_area_list(stream: &dyn SparseStream, offset: &mut u64) -> Result<Vec<DiskArea>> {
    let mut areas = Vec::new();
    loop {
        let mut entry = [0u8; 16];
        stream.read_at(*offset, &mut entry).await?;
        *offset += 16;
        let area_offset = u64::from_le_bytes(entry[0..8].try_into().unwrap());
        let size = u64::from_le_bytes(entry[8..16].try_into().unwrap());
        if area_offset == 0 && size == 0 {
            break;
        }
        areas.push(DiskArea { offset: area_offset, size });
    }
    Ok(areas)
}

/// Reads the text metadata document out of a metadata area, stopping at
/// the first NUL byte (metadata areas are pre-allocated and zero-padded).
#[maybe_async::maybe_async]
pub async fn read_metadata_text(stream: &dyn SparseStream, area: &DiskArea) -> Result<String> {
    let mut buf = vec![0u8; area.size as usize];
    stream.read_at(area.offset, &mut buf).await?;
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec())
        .map_err(|_| Error::CorruptStructure(ctx!("volume", "metadata text is not valid UTF-8").at(area.offset)))
}

/// A parsed node of the LVM-style text configuration: a scalar, a string,
/// a list of scalars/strings, or a `{ ... }`-delimited section.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    Int(i64),
    Str(String),
    List(Vec<ConfigValue>),
    Section(BTreeMap<String, ConfigValue>),
}

impl ConfigValue {
    pub fn as_section(&self) -> Option<&BTreeMap<String, ConfigValue>> {
        match self {
            ConfigValue::Section(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[ConfigValue]> {
        match self {
            ConfigValue::List(items) => Some(items),
            _ => None,
        }
    }

    fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.as_section().and_then(|m| m.get(key))
    }
}

/// A minimal recursive-descent parser for the key/value, `{}`-sectioned
/// text configuration LVM-style metadata uses: identifiers, quoted
/// strings, integers, comma-separated lists and nested sections, with
/// `#` introducing a comment to end of line.
struct ConfigParser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ConfigParser<'a> {
    fn new(text: &'a str) -> Self {
        Self { bytes: text.as_bytes(), pos: 0 }
    }

    fn skip_ws(&mut self) {
        loop {
            while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
                self.pos += 1;
            }
            if self.pos < self.bytes.len() && self.bytes[self.pos] == b'#' {
                while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
                    self.pos += 1;
                }
                continue;
            }
            break;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn parse_ident(&mut self) -> Result<String> {
        let start = self.pos;
        while self.pos < self.bytes.len() {
            let b = self.bytes[self.pos];
            if b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if start == self.pos {
            return Err(Error::CorruptStructure(ctx!("volume", "expected identifier at offset {}", start)));
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn parse_string(&mut self) -> Result<String> {
        if self.peek() != Some(b'"') {
            return Err(Error::CorruptStructure(ctx!("volume", "expected opening quote at offset {}", self.pos)));
        }
        self.pos += 1;
        let start = self.pos;
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'"' {
            self.pos += 1;
        }
        if self.pos >= self.bytes.len() {
            return Err(Error::Truncated(ctx!("volume", "unterminated string literal")));
        }
        let s = String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned();
        self.pos += 1;
        Ok(s)
    }

    fn parse_value(&mut self) -> Result<ConfigValue> {
        self.skip_ws();
        match self.peek() {
            Some(b'"') => Ok(ConfigValue::Str(self.parse_string()?)),
            Some(b'{') => self.parse_section(),
            Some(b'[') => self.parse_list(),
            Some(b) if b.is_ascii_digit() || b == b'-' => self.parse_scalar_or_list(),
            _ => Err(Error::CorruptStructure(ctx!("volume", "unexpected token at offset {}", self.pos))),
        }
    }

    fn parse_list(&mut self) -> Result<ConfigValue> {
        self.pos += 1; // '['
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(b']') {
                self.pos += 1;
                break;
            }
            items.push(self.parse_value()?);
            self.skip_ws();
            if self.peek() == Some(b',') {
                self.pos += 1;
            }
        }
        Ok(ConfigValue::List(items))
    }

    fn parse_scalar_or_list(&mut self) -> Result<ConfigValue> {
        let first = self.parse_int()?;
        self.skip_ws();
        if self.peek() == Some(b',') {
            let mut items = vec![ConfigValue::Int(first)];
            while self.peek() == Some(b',') {
                self.pos += 1;
                self.skip_ws();
                items.push(self.parse_value()?);
                self.skip_ws();
            }
            Ok(ConfigValue::List(items))
        } else {
            Ok(ConfigValue::Int(first))
        }
    }

    fn parse_int(&mut self) -> Result<i64> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_digit() {
            self.pos += 1;
        }
        std::str::from_utf8(&self.bytes[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Error::CorruptStructure(ctx!("volume", "invalid integer at offset {}", start)))
    }

    fn parse_section(&mut self) -> Result<ConfigValue> {
        self.pos += 1; // '{'
        let map = self.parse_bindings(true)?;
        Ok(ConfigValue::Section(map))
    }

    fn parse_bindings(&mut self, nested: bool) -> Result<BTreeMap<String, ConfigValue>> {
        let mut map = BTreeMap::new();
        loop {
            self.skip_ws();
            if nested {
                if self.peek() == Some(b'}') {
                    self.pos += 1;
                    break;
                }
            } else if self.peek().is_none() {
                break;
            }
            let key = self.parse_ident()?;
            self.skip_ws();
            if self.peek() != Some(b'=') {
                return Err(Error::CorruptStructure(ctx!("volume", "expected '=' after key {key}")));
            }
            self.pos += 1;
            let value = self.parse_value()?;
            map.insert(key, value);
        }
        Ok(map)
    }
}

/// Parses a complete text metadata document into a root section mapping
/// top-level identifiers (typically a single volume-group name) to their
/// values.
pub fn parse_config(text: &str) -> Result<ConfigValue> {
    let mut parser = ConfigParser::new(text);
    let map = parser.parse_bindings(false)?;
    Ok(ConfigValue::Section(map))
}

/// One striped segment of a logical volume: the logical extent range it
/// covers and the physical volume + extent offset it is struck from.
#[derive(Debug, Clone)]
pub struct Segment {
    pub start_extent: u64,
    pub extent_count: u64,
    pub stripe_pv: String,
    pub stripe_start_extent: u64,
}

#[derive(Debug, Clone)]
pub struct LogicalVolume {
    pub name: String,
    pub readable: bool,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone)]
pub struct PhysicalVolumeRef {
    pub name: String,
    pub id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub struct VolumeGroup {
    pub name: String,
    pub extent_size: u64,
    pub physical_volumes: Vec<PhysicalVolumeRef>,
    pub logical_volumes: Vec<LogicalVolume>,
}

/// Extracts the volume-group description out of a parsed configuration
/// document. `vg_name` selects which top-level section to read; pass
/// `None` to use the sole top-level section if there is exactly one.
pub fn parse_volume_group(config: &ConfigValue, vg_name: Option<&str>) -> Result<VolumeGroup> {
    let root = config
        .as_section()
        .ok_or_else(|| Error::CorruptStructure(ctx!("volume", "metadata document has no top-level section")))?;

    let (name, vg_section) = match vg_name {
        Some(n) => (
            n.to_string(),
            root.get(n).ok_or_else(|| Error::NotFound(ctx!("volume", "volume group {n} not present in metadata")))?,
        ),
        None => {
            let mut candidates = root.iter().filter(|(_, v)| matches!(v, ConfigValue::Section(_)));
            let (name, value) = candidates
                .next()
                .ok_or_else(|| Error::CorruptStructure(ctx!("volume", "metadata document has no volume group section")))?;
            if candidates.next().is_some() {
                return Err(Error::CorruptStructure(ctx!(
                    "volume",
                    "multiple volume group sections present; vg_name must be specified"
                )));
            }
            (name.clone(), value)
        }
    };

    let extent_size = vg_section
        .get("extent_size")
        .and_then(ConfigValue::as_int)
        .ok_or_else(|| Error::CorruptStructure(ctx!("volume", "volume group {name} missing extent_size")))? as u64;

    let mut physical_volumes = Vec::new();
    if let Some(pvs) = vg_section.get("physical_volumes").and_then(ConfigValue::as_section) {
        for (pv_name, pv_value) in pvs {
            let id = pv_value
                .get("id")
                .and_then(ConfigValue::as_str)
                .and_then(|s| Uuid::parse_str(s).ok());
            physical_volumes.push(PhysicalVolumeRef { name: pv_name.clone(), id });
        }
    }

    let mut logical_volumes = Vec::new();
    if let Some(lvs) = vg_section.get("logical_volumes").and_then(ConfigValue::as_section) {
        for (lv_name, lv_value) in lvs {
            logical_volumes.push(parse_logical_volume(lv_name, lv_value)?);
        }
    }

    Ok(VolumeGroup { name, extent_size, physical_volumes, logical_volumes })
}

fn parse_logical_volume(name: &str, lv_section: &ConfigValue) -> Result<LogicalVolume> {
    let readable = lv_section
        .get("status")
        .and_then(ConfigValue::as_list)
        .map(|items| items.iter().any(|v| v.as_str() == Some("read")))
        .unwrap_or(false);

    let mut segments = Vec::new();
    let mut index = 1;
    loop {
        let key = format!("segment{index}");
        let Some(seg) = lv_section.get(&key) else { break };
        segments.push(parse_segment(name, seg)?);
        index += 1;
    }

    Ok(LogicalVolume { name: name.to_string(), readable, segments })
}

fn parse_segment(lv_name: &str, seg: &ConfigValue) -> Result<Segment> {
    let start_extent = seg
        .get("start_extent")
        .and_then(ConfigValue::as_int)
        .ok_or_else(|| Error::CorruptStructure(ctx!("volume", "{lv_name}: segment missing start_extent")))? as u64;
    let extent_count = seg
        .get("extent_count")
        .and_then(ConfigValue::as_int)
        .ok_or_else(|| Error::CorruptStructure(ctx!("volume", "{lv_name}: segment missing extent_count")))? as u64;
    let seg_type = seg.get("type").and_then(ConfigValue::as_str).unwrap_or("");
    if seg_type != "striped" {
        return Err(Error::UnsupportedFeature(ctx!("volume", "{lv_name}: segment type {seg_type} not supported")));
    }
    let stripe_count = seg.get("stripe_count").and_then(ConfigValue::as_int).unwrap_or(0);
    if stripe_count != 1 {
        return Err(Error::UnsupportedFeature(ctx!(
            "volume",
            "{lv_name}: stripe_count {stripe_count} not supported, only single-stripe segments"
        )));
    }
    let stripes = seg
        .get("stripes")
        .and_then(ConfigValue::as_list)
        .ok_or_else(|| Error::CorruptStructure(ctx!("volume", "{lv_name}: segment missing stripes list")))?;
    if stripes.len() != 2 {
        return Err(Error::CorruptStructure(ctx!("volume", "{lv_name}: stripes list must be a single (pv, extent) pair")));
    }
    let stripe_pv = stripes[0]
        .as_str()
        .ok_or_else(|| Error::CorruptStructure(ctx!("volume", "{lv_name}: stripe pv name is not a string")))?
        .to_string();
    let stripe_start_extent = stripes[1]
        .as_int()
        .ok_or_else(|| Error::CorruptStructure(ctx!("volume", "{lv_name}: stripe start extent is not an integer")))?
        as u64;

    Ok(Segment { start_extent, extent_count, stripe_pv, stripe_start_extent })
}

/// A physical volume resolved to its backing content stream and PV
/// header, keyed by the name used in `stripes` lists.
pub struct ResolvedPv {
    pub content: Arc<dyn SparseStream>,
    pub header: PvHeader,
}

/// Composes a logical volume's segments into a single stream.
///
/// Segments must be sorted by `start_extent` and contiguous (no gaps);
/// a gap is reported as [`Error::NonContiguousVolume`]. Each segment
/// becomes a [`SubStream`] over its physical volume's first data area,
/// and the segments are concatenated end to end.
pub fn open_logical_volume(
    vg: &VolumeGroup,
    lv: &LogicalVolume,
    pvs: &BTreeMap<String, ResolvedPv>,
) -> Result<ConcatStream<Arc<dyn SparseStream>>> {
    if !lv.readable {
        return Err(Error::NotWritable(ctx!("volume", "logical volume {} is not marked readable", lv.name)));
    }

    let mut sorted = lv.segments.clone();
    sorted.sort_by_key(|s| s.start_extent);

    let mut next_extent = 0u64;
    let mut children: Vec<Arc<dyn SparseStream>> = Vec::with_capacity(sorted.len());
    for segment in &sorted {
        if segment.start_extent != next_extent {
            return Err(Error::NonContiguousVolume(ctx!(
                "volume",
                "logical volume {}: gap before extent {} (segment starts at {})",
                lv.name,
                next_extent,
                segment.start_extent
            )));
        }

        let pv = pvs.get(&segment.stripe_pv).ok_or_else(|| {
            Error::NotFound(ctx!("volume", "logical volume {}: physical volume {} not resolved", lv.name, segment.stripe_pv))
        })?;
        let data_area = pv.header.data_areas.first().ok_or_else(|| {
            Error::CorruptStructure(ctx!("volume", "physical volume {} has no data area", segment.stripe_pv))
        })?;

        let start = data_area.offset + segment.stripe_start_extent * vg.extent_size * SECTOR_SIZE;
        let length = segment.extent_count * vg.extent_size * SECTOR_SIZE;
        let sub = SubStream::new(pv.content.clone(), start, length)?;
        children.push(Arc::new(sub));

        next_extent += segment.extent_count;
    }

    Ok(ConcatStream::new(children))
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
        async fn extents(&self) -> Result<diskit_stream::ExtentSet> {
            Ok(diskit_stream::ExtentSet::single(0, self.0.len() as u64))
        }
        async fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
            let start = offset as usize;
            buf.copy_from_slice(&self.0[start..start + buf.len()]);
            Ok(())
        }
    }

    #[test]
    fn pv_header_parses_uuid_size_and_area_lists() {
        let mut bytes = vec![0u8; 24];
        let uuid = Uuid::from_bytes([7u8; 16]);
        bytes[0..16].copy_from_slice(uuid.as_bytes());
        bytes[16..24].copy_from_slice(&1_000_000u64.to_le_bytes());
        // one data area
        bytes.extend_from_slice(&4096u64.to_le_bytes());
        bytes.extend_from_slice(&500_000u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        // one metadata area
        bytes.extend_from_slice(&512u64.to_le_bytes());
        bytes.extend_from_slice(&3584u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());

        let stream = Mem(bytes);
        let header = run(parse_pv_header(&stream)).unwrap();
        assert_eq!(header.uuid, uuid);
        assert_eq!(header.device_size, 1_000_000);
        assert_eq!(header.data_areas, vec![DiskArea { offset: 4096, size: 500_000 }]);
        assert_eq!(header.metadata_areas, vec![DiskArea { offset: 512, size: 3584 }]);
    }

    const SAMPLE_CONFIG: &str = r#"
        vg0 {
            id = "abc"
            extent_size = 8192

            physical_volumes {
                pv0 {
                    id = "pv-abc"
                }
            }

            logical_volumes {
                lv0 {
                    status = ["read", "write", "visible"]

                    segment1 {
                        start_extent = 0
                        extent_count = 4
                        type = "striped"
                        stripe_count = 1
                        stripes = ["pv0", 0]
                    }
                    segment2 {
                        start_extent = 4
                        extent_count = 2
                        type = "striped"
                        stripe_count = 1
                        stripes = ["pv0", 4]
                    }
                }
            }
        }
    "#;

    #[test]
    fn config_parser_reads_nested_sections_and_lists() {
        let parsed = parse_config(SAMPLE_CONFIG).unwrap();
        let vg = parse_volume_group(&parsed, Some("vg0")).unwrap();
        assert_eq!(vg.extent_size, 8192);
        assert_eq!(vg.physical_volumes.len(), 1);
        assert_eq!(vg.logical_volumes.len(), 1);
        let lv = &vg.logical_volumes[0];
        assert!(lv.readable);
        assert_eq!(lv.segments.len(), 2);
        assert_eq!(lv.segments[1].start_extent, 4);
    }

    #[test]
    fn logical_volume_composes_contiguous_segments() {
        let parsed = parse_config(SAMPLE_CONFIG).unwrap();
        let vg = parse_volume_group(&parsed, Some("vg0")).unwrap();
        let lv = &vg.logical_volumes[0];

        let content: Arc<dyn SparseStream> = Arc::new(Mem(vec![0u8; 16 * 1024 * 1024]));
        let header = PvHeader {
            uuid: Uuid::nil(),
            device_size: content.len(),
            data_areas: vec![DiskArea { offset: 1024 * 1024, size: content.len() - 1024 * 1024 }],
            metadata_areas: vec![],
        };
        let mut pvs = BTreeMap::new();
        pvs.insert("pv0".to_string(), ResolvedPv { content, header });

        let stream = open_logical_volume(&vg, lv, &pvs).unwrap();
        assert_eq!(stream.len(), 6 * 8192 * SECTOR_SIZE);
    }

    #[test]
    fn non_contiguous_segments_rejected() {
        let mut lv = LogicalVolume {
            name: "lv0".to_string(),
            readable: true,
            segments: vec![
                Segment { start_extent: 0, extent_count: 4, stripe_pv: "pv0".to_string(), stripe_start_extent: 0 },
                Segment { start_extent: 5, extent_count: 2, stripe_pv: "pv0".to_string(), stripe_start_extent: 4 },
            ],
        };
        lv.segments.sort_by_key(|s| s.start_extent);
        let vg = VolumeGroup { name: "vg0".to_string(), extent_size: 8192, physical_volumes: vec![], logical_volumes: vec![] };

        let content: Arc<dyn SparseStream> = Arc::new(Mem(vec![0u8; 16 * 1024 * 1024]));
        let header =
            PvHeader { uuid: Uuid::nil(), device_size: content.len(), data_areas: vec![DiskArea { offset: 0, size: content.len() }], metadata_areas: vec![] };
        let mut pvs = BTreeMap::new();
        pvs.insert("pv0".to_string(), ResolvedPv { content, header });

        let err = open_logical_volume(&vg, &lv, &pvs).unwrap_err();
        assert!(matches!(err, Error::NonContiguousVolume(_)));
    }
}
