//! Test inputs shared by the generator and cache tests

use std::io::{Cursor, Read, Seek, Write};
use std::path::Path;

use chrono::{TimeZone, Utc};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::library::{Author, Book, File, FileType, Narrator, SeriesRef};

use super::m4b::atoms::{self, Mp4Box};

pub const JPEG_COVER: &[u8] = b"\xFF\xD8\xFF\xE0\x00\x10JFIF\x00embedded-cover\xFF\xD9";
pub const PNG_COVER: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\x0DIHDRlibrary-cover";

pub const OPF_V3: &str = r##"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="uid">urn:uuid:7b1f5c1e-9a43-4d8e-b0a1-2f6c1d9e0a11</dc:identifier>
    <dc:title id="t1">Old Title</dc:title>
    <meta refines="#t1" property="title-type">main</meta>
    <dc:creator id="c1">Old Author</dc:creator>
    <meta refines="#c1" property="role" scheme="marc:relators">aut</meta>
    <meta refines="#c1" property="file-as">Author, Old</meta>
    <dc:creator id="ill">Jane Illustrator</dc:creator>
    <meta refines="#ill" property="role" scheme="marc:relators">ill</meta>
    <dc:language>en</dc:language>
    <meta property="belongs-to-collection" id="coll">Old Series</meta>
    <meta refines="#coll" property="collection-type">series</meta>
    <meta name="calibre:series" content="Old Series"/>
    <meta name="calibre:series_index" content="3"/>
    <meta name="cover" content="cover-img"/>
    <meta property="dcterms:modified">2020-01-01T00:00:00Z</meta>
  </metadata>
  <manifest>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="chapter1" href="chapter1.xhtml" media-type="application/xhtml+xml"/>
    <item id="cover-img" href="images/cover.jpg" media-type="image/jpeg" properties="cover-image"/>
  </manifest>
  <spine>
    <itemref idref="chapter1"/>
  </spine>
</package>
"##;

pub const OPF_V2: &str = r##"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="BookId">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
    <dc:title>Old Title</dc:title>
    <dc:creator opf:role="aut" opf:file-as="Author, Old">Old Author</dc:creator>
    <dc:creator opf:role="edt">Some Editor</dc:creator>
    <dc:publisher>Tor</dc:publisher>
    <dc:identifier id="BookId" opf:scheme="ISBN">9780765326355</dc:identifier>
    <meta name="calibre:series" content="Old Series"/>
    <meta name="calibre:series_index" content="3"/>
    <meta name="cover" content="cover"/>
  </metadata>
  <manifest>
    <item id="cover" href="cover.jpg" media-type="image/jpeg"/>
    <item id="chapter1" href="chapter1.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine toc="ncx">
    <itemref idref="chapter1"/>
  </spine>
</package>
"##;

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

const CHAPTER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>One</title></head>
<body><p>Szeth-son-son-Vallano wore white on the day he was to kill a king.</p></body></html>
"#;

pub const COMIC_INFO: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<ComicInfo xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xmlns:xsd="http://www.w3.org/2001/XMLSchema">
  <Title>Watchmen #1</Title>
  <Series>Watchmen</Series>
  <Number>1</Number>
  <Summary>Who watches the watchmen?</Summary>
  <Year>1986</Year>
  <Writer>Alan Moore</Writer>
  <Publisher>DC Comics</Publisher>
  <!-- scanner notes -->
  <CustomField>kept</CustomField>
  <Pages>
    <Page Image="0" ImageSize="1024" Type="FrontCover"/>
    <Page Image="1" ImageSize="2048"/>
  </Pages>
</ComicInfo>
"#;

/// Size of each audio chunk in `m4b_bytes`
pub const M4B_CHUNK_LEN: usize = 16;

pub fn book() -> Book {
    Book {
        id: 1,
        title: "The Way of Kings".to_string(),
        subtitle: Some("Book One".to_string()),
        description: Some("Roshar is a world of stone and storms.".to_string()),
        authors: vec![
            Author {
                name: "Second Author".to_string(),
                role: None,
                sort_order: 1,
            },
            Author {
                name: "Brandon Sanderson".to_string(),
                role: None,
                sort_order: 0,
            },
        ],
        series: vec![SeriesRef {
            name: "The Stormlight Archive".to_string(),
            number: Some(1.0),
            sort_order: 0,
        }],
        updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    }
}

/// A book and one of its files of type `file_type` stored at `path`
pub fn snapshot(file_type: FileType, path: &Path) -> (Book, File) {
    let narrators = if file_type.is_audiobook() {
        vec![
            Narrator {
                name: "Kate Reading".to_string(),
                sort_order: 1,
            },
            Narrator {
                name: "Michael Kramer".to_string(),
                sort_order: 0,
            },
        ]
    } else {
        Vec::new()
    };
    let file = File {
        id: 7,
        book_id: 1,
        path: path.to_path_buf(),
        file_type,
        narrators,
        cover: None,
        cover_page: None,
        updated_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
    };
    (book(), file)
}

pub fn zip_bytes(entries: &[(&str, &[u8], CompressionMethod)]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, bytes, method) in entries {
        writer
            .start_file(*name, SimpleFileOptions::default().compression_method(*method))
            .unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// EPUB with `opf` as `OEBPS/content.opf`
pub fn epub_bytes(opf: &str) -> Vec<u8> {
    zip_bytes(&[
        ("mimetype", b"application/epub+zip".as_slice(), CompressionMethod::Stored),
        ("META-INF/container.xml", CONTAINER_XML.as_bytes(), CompressionMethod::Deflated),
        ("OEBPS/content.opf", opf.as_bytes(), CompressionMethod::Deflated),
        ("OEBPS/chapter1.xhtml", CHAPTER.as_bytes(), CompressionMethod::Deflated),
        ("OEBPS/images/cover.jpg", JPEG_COVER, CompressionMethod::Stored),
    ])
}

/// CBZ with two pages and, optionally, a ComicInfo.xml
pub fn cbz_bytes(comic_info: Option<&str>) -> Vec<u8> {
    let mut entries: Vec<(&str, &[u8], CompressionMethod)> = vec![
        ("001.jpg", JPEG_COVER, CompressionMethod::Stored),
        ("002.jpg", b"\xFF\xD8page-two\xFF\xD9".as_slice(), CompressionMethod::Stored),
    ];
    if let Some(xml) = comic_info {
        entries.push(("ComicInfo.xml", xml.as_bytes(), CompressionMethod::Deflated));
    }
    zip_bytes(&entries)
}

/// Whether entry `name` has the same compressed bytes, CRC and method in
/// both archives
pub fn raw_entries_equal<A: Read + Seek, B: Read + Seek>(
    a: &mut ZipArchive<A>,
    b: &mut ZipArchive<B>,
    name: &str,
) -> bool {
    fn raw<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Option<(u32, CompressionMethod, Vec<u8>)> {
        let index = archive.index_for_name(name)?;
        let mut entry = archive.by_index_raw(index).ok()?;
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).ok()?;
        Some((entry.crc32(), entry.compression(), bytes))
    }
    match (raw(a, name), raw(b, name)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Audio payload of the two chunks in `m4b_bytes`
pub fn m4b_chunks() -> Vec<Vec<u8>> {
    vec![b"chunk-one-audio!".to_vec(), b"chunk-two-audio!".to_vec()]
}

fn m4b_moov(offsets: &[u64], with_udta: bool) -> Mp4Box {
    let stbl = Mp4Box::container(
        *b"stbl",
        vec![
            Mp4Box::leaf(*b"stsd", vec![0, 0, 0, 0, 0, 0, 0, 0]),
            atoms::chunk_offset_box(offsets, false),
        ],
    );
    let trak = Mp4Box::container(
        *b"trak",
        vec![
            Mp4Box::leaf(*b"tkhd", vec![0; 84]),
            Mp4Box::container(*b"mdia", vec![Mp4Box::container(*b"minf", vec![stbl])]),
        ],
    );
    let mut children = vec![Mp4Box::leaf(*b"mvhd", vec![0; 100]), trak];

    if with_udta {
        let ilst = Mp4Box::container(
            *b"ilst",
            vec![
                atoms::text_item(atoms::NAME, "Old Title"),
                atoms::text_item(atoms::ARTIST, "Old Author"),
                atoms::text_item(*b"\xA9day", "2010"),
                Mp4Box::container(atoms::COVER, vec![atoms::data_box(atoms::DATA_JPEG, JPEG_COVER)]),
            ],
        );
        let mut meta = atoms::itunes_meta();
        if let Some(children) = meta.children_mut() {
            children.push(ilst);
        }
        children.push(Mp4Box::container(*b"udta", vec![meta]));
    }
    Mp4Box::container(*b"moov", children)
}

/// Minimal audiobook: `ftyp`, `moov` (optionally with iTunes tags), `mdat`
pub fn m4b_bytes(with_udta: bool) -> Vec<u8> {
    let ftyp = Mp4Box::leaf(*b"ftyp", b"M4B \x00\x00\x02\x00M4B mp42isom".to_vec());
    let chunks = m4b_chunks();
    let placeholder = vec![0u64; chunks.len()];

    let moov_len = m4b_moov(&placeholder, with_udta).encoded_len();
    let data_start = ftyp.encoded_len() + moov_len + 8;
    let offsets: Vec<u64> = (0..chunks.len())
        .map(|i| data_start + (i * M4B_CHUNK_LEN) as u64)
        .collect();

    let mdat = Mp4Box::leaf(*b"mdat", chunks.concat());
    let mut out = Vec::new();
    ftyp.write_to(&mut out);
    m4b_moov(&offsets, with_udta).write_to(&mut out);
    mdat.write_to(&mut out);
    out
}
