//! MP4 box tree
//!
//! Only the `moov` box is ever held in memory. Container boxes on the path
//! to the iTunes metadata list and the sample tables are parsed into
//! children; every other box is kept as an opaque payload and written back
//! byte for byte.

use crate::error::{DownloadError, DownloadResult};

/// Nesting limit for container parsing
pub const MAX_DEPTH: usize = 16;

/// `©` as it appears in iTunes atom names
const COPYRIGHT: u8 = 0xA9;

pub const NAME: [u8; 4] = [COPYRIGHT, b'n', b'a', b'm'];
pub const ARTIST: [u8; 4] = [COPYRIGHT, b'A', b'R', b'T'];
pub const ALBUM: [u8; 4] = [COPYRIGHT, b'a', b'l', b'b'];
pub const NARRATOR: [u8; 4] = [COPYRIGHT, b'n', b'r', b't'];
pub const COMPOSER: [u8; 4] = [COPYRIGHT, b'w', b'r', b't'];
pub const COVER: [u8; 4] = *b"covr";
pub const FREEFORM: [u8; 4] = *b"----";

/// `data` box type indicators
pub const DATA_UTF8: u32 = 1;
pub const DATA_JPEG: u32 = 13;
pub const DATA_PNG: u32 = 14;

const HEADER_LEN: usize = 8;
const LARGE_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    /// Opaque payload, written back unchanged
    Leaf(Vec<u8>),
    /// `prefix` holds the version/flags of full boxes such as `meta`
    Container { prefix: Vec<u8>, children: Vec<Mp4Box> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mp4Box {
    pub kind: [u8; 4],
    pub body: Body,
}

/// Printable box type for logs and errors
pub fn kind_str(kind: &[u8; 4]) -> String {
    kind.iter()
        .map(|&b| if b == COPYRIGHT { '©' } else { b as char })
        .collect()
}

fn is_container(kind: &[u8; 4], parent: Option<&[u8; 4]>) -> bool {
    if parent == Some(b"ilst") {
        return true;
    }
    matches!(
        kind,
        b"moov" | b"trak" | b"mdia" | b"minf" | b"stbl" | b"dinf" | b"edts" | b"udta" | b"meta" | b"ilst" | b"mvex"
    )
}

/// Split `data` into `(kind, payload)` pairs
fn split_boxes(data: &[u8]) -> DownloadResult<Vec<([u8; 4], &[u8])>> {
    let mut boxes = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        let rest = &data[pos..];
        if rest.len() < HEADER_LEN {
            // QuickTime `udta` may end with a zero terminator
            if rest.iter().all(|&b| b == 0) {
                break;
            }
            return Err(DownloadError::MalformedContainer(format!(
                "truncated box header at offset {}",
                pos
            )));
        }
        let size32 = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let kind = [rest[4], rest[5], rest[6], rest[7]];
        let (size, header) = match size32 {
            0 => (rest.len() as u64, HEADER_LEN),
            1 => {
                if rest.len() < LARGE_HEADER_LEN {
                    return Err(DownloadError::MalformedContainer(format!(
                        "truncated large header for '{}'",
                        kind_str(&kind)
                    )));
                }
                let mut large = [0u8; 8];
                large.copy_from_slice(&rest[8..16]);
                (u64::from_be_bytes(large), LARGE_HEADER_LEN)
            }
            n => (n as u64, HEADER_LEN),
        };
        if size < header as u64 || size > rest.len() as u64 {
            return Err(DownloadError::MalformedContainer(format!(
                "box '{}' declares {} bytes with {} available",
                kind_str(&kind),
                size,
                rest.len()
            )));
        }
        let size = size as usize;
        boxes.push((kind, &rest[header..size]));
        pos += size;
    }
    Ok(boxes)
}

impl Mp4Box {
    pub fn leaf(kind: [u8; 4], payload: Vec<u8>) -> Self {
        Self {
            kind,
            body: Body::Leaf(payload),
        }
    }

    pub fn container(kind: [u8; 4], children: Vec<Mp4Box>) -> Self {
        Self {
            kind,
            body: Body::Container {
                prefix: Vec::new(),
                children,
            },
        }
    }

    /// Parse the payload of a box of type `kind`
    pub fn parse(kind: [u8; 4], payload: &[u8], parent: Option<&[u8; 4]>, depth: usize) -> DownloadResult<Self> {
        if depth > MAX_DEPTH {
            return Err(DownloadError::MalformedContainer(format!(
                "boxes nested deeper than {} levels",
                MAX_DEPTH
            )));
        }
        if !is_container(&kind, parent) {
            return Ok(Self::leaf(kind, payload.to_vec()));
        }

        // ISO `meta` is a full box; QuickTime-style `meta` starts straight
        // with its `hdlr` child.
        let prefix_len = if &kind == b"meta" && !(payload.len() >= 8 && &payload[4..8] == b"hdlr") {
            4.min(payload.len())
        } else {
            0
        };
        let (prefix, rest) = payload.split_at(prefix_len);

        let children = split_boxes(rest)?
            .into_iter()
            .map(|(child_kind, child_payload)| Self::parse(child_kind, child_payload, Some(&kind), depth + 1))
            .collect::<DownloadResult<Vec<_>>>()?;

        Ok(Self {
            kind,
            body: Body::Container {
                prefix: prefix.to_vec(),
                children,
            },
        })
    }

    fn payload_len(&self) -> u64 {
        match &self.body {
            Body::Leaf(payload) => payload.len() as u64,
            Body::Container { prefix, children } => {
                prefix.len() as u64 + children.iter().map(Mp4Box::encoded_len).sum::<u64>()
            }
        }
    }

    /// Size of the box including its header
    pub fn encoded_len(&self) -> u64 {
        let payload = self.payload_len();
        if payload + HEADER_LEN as u64 > u32::MAX as u64 {
            payload + LARGE_HEADER_LEN as u64
        } else {
            payload + HEADER_LEN as u64
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        let total = self.encoded_len();
        if total > u32::MAX as u64 {
            out.extend_from_slice(&1u32.to_be_bytes());
            out.extend_from_slice(&self.kind);
            out.extend_from_slice(&total.to_be_bytes());
        } else {
            out.extend_from_slice(&(total as u32).to_be_bytes());
            out.extend_from_slice(&self.kind);
        }
        match &self.body {
            Body::Leaf(payload) => out.extend_from_slice(payload),
            Body::Container { prefix, children } => {
                out.extend_from_slice(prefix);
                for child in children {
                    child.write_to(out);
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len() as usize);
        self.write_to(&mut out);
        out
    }

    pub fn children(&self) -> &[Mp4Box] {
        match &self.body {
            Body::Container { children, .. } => children,
            Body::Leaf(_) => &[],
        }
    }

    pub fn children_mut(&mut self) -> Option<&mut Vec<Mp4Box>> {
        match &mut self.body {
            Body::Container { children, .. } => Some(children),
            Body::Leaf(_) => None,
        }
    }

    pub fn child(&self, kind: &[u8; 4]) -> Option<&Mp4Box> {
        self.children().iter().find(|c| &c.kind == kind)
    }

    /// Child container of type `kind`, created at the end if missing
    pub fn child_or_insert(&mut self, kind: [u8; 4], make: impl FnOnce() -> Mp4Box) -> DownloadResult<&mut Mp4Box> {
        let parent = kind_str(&self.kind);
        let children = self.children_mut().ok_or_else(|| {
            DownloadError::MalformedContainer(format!("'{}' is not a container", parent))
        })?;
        let index = match children.iter().position(|c| c.kind == kind) {
            Some(index) => index,
            None => {
                children.push(make());
                children.len() - 1
            }
        };
        Ok(&mut children[index])
    }

    pub fn leaf_payload(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Leaf(payload) => Some(payload),
            Body::Container { .. } => None,
        }
    }

    /// Apply `f` to this box and every descendant
    pub fn visit_mut(&mut self, f: &mut dyn FnMut(&mut Mp4Box) -> DownloadResult<()>) -> DownloadResult<()> {
        f(self)?;
        if let Some(children) = self.children_mut() {
            for child in children {
                child.visit_mut(f)?;
            }
        }
        Ok(())
    }
}

/// `meta` handler declaring iTunes metadata
pub fn itunes_handler() -> Mp4Box {
    let mut payload = Vec::with_capacity(25);
    payload.extend_from_slice(&[0; 4]); // version/flags
    payload.extend_from_slice(&[0; 4]); // pre_defined
    payload.extend_from_slice(b"mdir");
    payload.extend_from_slice(b"appl");
    payload.extend_from_slice(&[0; 8]);
    payload.push(0); // empty name
    Mp4Box::leaf(*b"hdlr", payload)
}

/// Empty ISO `meta` box with an iTunes handler
pub fn itunes_meta() -> Mp4Box {
    Mp4Box {
        kind: *b"meta",
        body: Body::Container {
            prefix: vec![0; 4],
            children: vec![itunes_handler()],
        },
    }
}

/// `data` box with type indicator `type_code`
pub fn data_box(type_code: u32, value: &[u8]) -> Mp4Box {
    let mut payload = Vec::with_capacity(8 + value.len());
    payload.extend_from_slice(&type_code.to_be_bytes());
    payload.extend_from_slice(&[0; 4]); // locale
    payload.extend_from_slice(value);
    Mp4Box::leaf(*b"data", payload)
}

/// Metadata item holding a single UTF-8 string
pub fn text_item(kind: [u8; 4], text: &str) -> Mp4Box {
    Mp4Box::container(kind, vec![data_box(DATA_UTF8, text.as_bytes())])
}

fn full_box_string(kind: [u8; 4], text: &str) -> Mp4Box {
    let mut payload = vec![0; 4];
    payload.extend_from_slice(text.as_bytes());
    Mp4Box::leaf(kind, payload)
}

/// `----` item with `mean`/`name`/`data` children
pub fn freeform_item(mean: &str, name: &str, text: &str) -> Mp4Box {
    Mp4Box::container(
        FREEFORM,
        vec![
            full_box_string(*b"mean", mean),
            full_box_string(*b"name", name),
            data_box(DATA_UTF8, text.as_bytes()),
        ],
    )
}

/// Name of a `----` item, if it has one
pub fn freeform_name(item: &Mp4Box) -> Option<String> {
    let payload = item.child(b"name")?.leaf_payload()?;
    payload.get(4..).map(|name| String::from_utf8_lossy(name).into_owned())
}

/// Value bytes of the first `data` child of an item
pub fn item_value(item: &Mp4Box) -> Option<&[u8]> {
    item.child(b"data")?.leaf_payload()?.get(8..)
}

/// Add `delta` to every `stco`/`co64` entry at or beyond `threshold`
///
/// Returns the number of entries moved.
pub fn shift_chunk_offsets(moov: &mut Mp4Box, threshold: u64, delta: i64) -> DownloadResult<usize> {
    let mut shifted = 0usize;
    moov.visit_mut(&mut |b| {
        let wide = match &b.kind {
            b"stco" => false,
            b"co64" => true,
            _ => return Ok(()),
        };
        let kind = kind_str(&b.kind);
        let Body::Leaf(payload) = &mut b.body else {
            return Ok(());
        };
        if payload.len() < 8 {
            return Err(DownloadError::MalformedContainer(format!("truncated '{}'", kind)));
        }
        let count = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;
        let width = if wide { 8 } else { 4 };
        if payload.len() < 8 + count * width {
            return Err(DownloadError::MalformedContainer(format!(
                "'{}' lists {} entries but is {} bytes",
                kind,
                count,
                payload.len()
            )));
        }

        for entry in payload[8..8 + count * width].chunks_exact_mut(width) {
            let offset = if wide {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(entry);
                u64::from_be_bytes(bytes)
            } else {
                u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]) as u64
            };
            if offset < threshold {
                continue;
            }
            let moved = offset as i128 + delta as i128;
            if wide {
                let moved = u64::try_from(moved).map_err(|_| {
                    DownloadError::MalformedContainer(format!("chunk offset {} out of range", moved))
                })?;
                entry.copy_from_slice(&moved.to_be_bytes());
            } else {
                let moved = u32::try_from(moved).map_err(|_| {
                    DownloadError::UnsupportedContainer(format!(
                        "chunk offset {} no longer fits in 'stco'",
                        moved
                    ))
                })?;
                entry.copy_from_slice(&moved.to_be_bytes());
            }
            shifted += 1;
        }
        Ok(())
    })?;
    Ok(shifted)
}

/// Offsets listed by every `stco`/`co64` box, in tree order
pub fn chunk_offsets(moov: &Mp4Box) -> Vec<u64> {
    fn walk(b: &Mp4Box, out: &mut Vec<u64>) {
        if let (Some(payload), true) = (b.leaf_payload(), &b.kind == b"stco" || &b.kind == b"co64") {
            let width = if &b.kind == b"co64" { 8 } else { 4 };
            if payload.len() >= 8 {
                let count = u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]) as usize;
                for entry in payload[8..].chunks_exact(width).take(count) {
                    let offset = if width == 8 {
                        let mut bytes = [0u8; 8];
                        bytes.copy_from_slice(entry);
                        u64::from_be_bytes(bytes)
                    } else {
                        u32::from_be_bytes([entry[0], entry[1], entry[2], entry[3]]) as u64
                    };
                    out.push(offset);
                }
            }
        }
        for child in b.children() {
            walk(child, out);
        }
    }
    let mut out = Vec::new();
    walk(moov, &mut out);
    out
}

/// Chunk offset table payload (`stco` when every offset fits in 32 bits)
pub fn chunk_offset_box(offsets: &[u64], wide: bool) -> Mp4Box {
    let mut payload = vec![0; 4];
    payload.extend_from_slice(&(offsets.len() as u32).to_be_bytes());
    for &offset in offsets {
        if wide {
            payload.extend_from_slice(&offset.to_be_bytes());
        } else {
            payload.extend_from_slice(&(offset as u32).to_be_bytes());
        }
    }
    Mp4Box::leaf(if wide { *b"co64" } else { *b"stco" }, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_moov() -> Mp4Box {
        let stbl = Mp4Box::container(
            *b"stbl",
            vec![
                Mp4Box::leaf(*b"stsd", vec![1, 2, 3, 4]),
                chunk_offset_box(&[100, 5000], false),
            ],
        );
        let trak = Mp4Box::container(
            *b"trak",
            vec![Mp4Box::container(
                *b"mdia",
                vec![Mp4Box::container(*b"minf", vec![stbl])],
            )],
        );
        let ilst = Mp4Box::container(*b"ilst", vec![text_item(NAME, "Title")]);
        let mut meta = itunes_meta();
        meta.children_mut().unwrap().push(ilst);
        let udta = Mp4Box::container(*b"udta", vec![meta]);
        Mp4Box::container(
            *b"moov",
            vec![Mp4Box::leaf(*b"mvhd", vec![0; 100]), trak, udta],
        )
    }

    fn reparse(b: &Mp4Box) -> Mp4Box {
        let bytes = b.to_bytes();
        let (kind, payload) = split_boxes(&bytes).unwrap()[0];
        Mp4Box::parse(kind, payload, None, 0).unwrap()
    }

    #[test]
    fn test_tree_survives_serialization() {
        let moov = sample_moov();
        assert_eq!(reparse(&moov), moov);
        assert_eq!(moov.to_bytes().len() as u64, moov.encoded_len());
    }

    #[test]
    fn test_quicktime_meta_has_no_prefix() {
        let mut payload = Vec::new();
        itunes_handler().write_to(&mut payload);
        Mp4Box::container(*b"ilst", vec![]).write_to(&mut payload);

        let meta = Mp4Box::parse(*b"meta", &payload, Some(b"udta"), 2).unwrap();
        match &meta.body {
            Body::Container { prefix, children } => {
                assert!(prefix.is_empty());
                assert_eq!(children.len(), 2);
            }
            Body::Leaf(_) => panic!("meta parsed as leaf"),
        }
    }

    #[test]
    fn test_shift_chunk_offsets() {
        let mut moov = sample_moov();
        let shifted = shift_chunk_offsets(&mut moov, 1000, 24).unwrap();
        assert_eq!(shifted, 1);
        assert_eq!(chunk_offsets(&moov), vec![100, 5024]);

        let mut wide = Mp4Box::container(*b"stbl", vec![chunk_offset_box(&[u32::MAX as u64 + 10], true)]);
        shift_chunk_offsets(&mut wide, 0, -10).unwrap();
        assert_eq!(chunk_offsets(&wide), vec![u32::MAX as u64]);
    }

    #[test]
    fn test_stco_overflow_is_an_error() {
        let mut stbl = Mp4Box::container(*b"stbl", vec![chunk_offset_box(&[u32::MAX as u64 - 4], false)]);
        let result = shift_chunk_offsets(&mut stbl, 0, 16);
        assert!(matches!(result, Err(DownloadError::UnsupportedContainer(_))));
    }

    #[test]
    fn test_rejects_bad_sizes_and_deep_nesting() {
        // Declares 64 bytes, carries 12
        let bytes = [0, 0, 0, 64, b'f', b'r', b'e', b'e', 0, 0, 0, 0];
        assert!(split_boxes(&bytes).is_err());

        let mut nested = Mp4Box::container(*b"udta", vec![]);
        for _ in 0..MAX_DEPTH + 2 {
            nested = Mp4Box::container(*b"udta", vec![nested]);
        }
        let bytes = nested.to_bytes();
        let (kind, payload) = split_boxes(&bytes).unwrap()[0];
        assert!(matches!(
            Mp4Box::parse(kind, payload, None, 0),
            Err(DownloadError::MalformedContainer(_))
        ));
    }

    #[test]
    fn test_freeform_helpers() {
        let item = freeform_item("com.apple.iTunes", "SUBTITLE", "Part One");
        assert_eq!(freeform_name(&item).as_deref(), Some("SUBTITLE"));
        assert_eq!(item_value(&item), Some(b"Part One".as_slice()));
        assert_eq!(kind_str(&NARRATOR), "©nrt");
    }
}
