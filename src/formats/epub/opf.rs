//! OPF package document rewriting
//!
//! The package document is streamed event by event. Elements that carry
//! tracked metadata (titles, author creators, calibre series metas and
//! anything refining them) are dropped and fresh ones are written just
//! before `</metadata>`. Everything else, including non-author creators and
//! unknown metas, passes through unchanged.

use std::collections::{HashMap, HashSet};

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{DownloadError, DownloadResult};
use crate::library::{format_series_number, Book};

const DC_NAMESPACE: &str = "http://purl.org/dc/elements/1.1/";
const OPF_NAMESPACE: &str = "http://www.idpf.org/2007/opf";

const CALIBRE_SERIES: &str = "calibre:series";
const CALIBRE_SERIES_INDEX: &str = "calibre:series_index";

/// Manifest item referenced as the cover image
#[derive(Debug, Clone, PartialEq)]
pub struct CoverItem {
    pub id: String,
    pub href: String,
}

/// What a first pass over the package document found
#[derive(Debug, Default)]
pub struct PackageInfo {
    pub version: String,
    pub cover: Option<CoverItem>,
    /// `id`s of elements that will be dropped; metas refining them go too
    removed_ids: HashSet<String>,
    /// Every `id` in the document, for collision-free new ids
    ids: HashSet<String>,
    /// `marc:relators` roles assigned through EPUB 3 refinements
    refined_roles: HashMap<String, String>,
    dc_declared: bool,
    opf_prefix: Option<String>,
    has_metadata: bool,
}

impl PackageInfo {
    pub fn is_epub3(&self) -> bool {
        self.version.trim().starts_with('3')
    }

    fn creator_is_author(&self, role: Option<&str>, id: Option<&str>) -> bool {
        let refined = id.and_then(|id| self.refined_roles.get(id)).map(String::as_str);
        match role.or(refined) {
            None => true,
            Some(role) => role.trim().eq_ignore_ascii_case("aut"),
        }
    }
}

/// New `media-type` for the cover manifest item
#[derive(Debug, Clone)]
pub struct CoverUpdate {
    pub id: String,
    pub media_type: String,
}

/// Attributes of one element, keyed by local name
struct Attrs {
    values: Vec<(String, String)>,
}

impl Attrs {
    fn read(e: &BytesStart<'_>) -> DownloadResult<Self> {
        let mut values = Vec::new();
        for attr in e.attributes() {
            let attr = attr?;
            let key = std::str::from_utf8(attr.key.as_ref())?.to_string();
            let value = attr.unescape_value()?.into_owned();
            values.push((key, value));
        }
        Ok(Self { values })
    }

    /// Value of the attribute whose local name is `local` (any prefix)
    fn get(&self, local: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, _)| {
                !key.starts_with("xmlns") && key.rsplit(':').next() == Some(local)
            })
            .map(|(_, value)| value.as_str())
    }

    /// Prefixes declared for `namespace` on this element
    fn prefix_for(&self, namespace: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(key, value)| key.starts_with("xmlns:") && value == namespace)
            .map(|(key, _)| &key["xmlns:".len()..])
    }
}

fn local_name(e: &BytesStart<'_>) -> Vec<u8> {
    e.local_name().as_ref().to_vec()
}

fn strip_bom(xml: &str) -> &str {
    xml.trim_start_matches('\u{feff}')
}

fn refines_target(attrs: &Attrs) -> Option<&str> {
    attrs.get("refines").map(|r| r.trim_start_matches('#'))
}

/// First pass: version, cover item, ids and roles
pub fn scan(xml: &str) -> DownloadResult<PackageInfo> {
    let mut reader = Reader::from_str(strip_bom(xml));
    let mut info = PackageInfo::default();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut manifest: Vec<CoverItem> = Vec::new();
    let mut cover_image_id: Option<String> = None;
    let mut meta_cover_id: Option<String> = None;
    let mut pending_role: Option<(String, String)> = None;
    let mut creators: Vec<(Option<String>, String)> = Vec::new();

    loop {
        let event = reader.read_event()?;
        let (e, is_empty) = match &event {
            Event::Start(e) => (Some(e), false),
            Event::Empty(e) => (Some(e), true),
            Event::Text(t) => {
                if let Some((_, text)) = pending_role.as_mut() {
                    text.push_str(&t.unescape()?);
                }
                continue;
            }
            Event::End(_) => {
                if let Some((id, role)) = pending_role.take() {
                    info.refined_roles.insert(id, role.trim().to_string());
                }
                stack.pop();
                continue;
            }
            Event::Eof => break,
            _ => continue,
        };
        let Some(e) = e else { continue };

        let name = local_name(e);
        let attrs = Attrs::read(e)?;
        if let Some(id) = attrs.get("id") {
            info.ids.insert(id.to_string());
        }
        let parent = stack.last().map(Vec::as_slice);

        match name.as_slice() {
            b"package" => {
                info.version = attrs.get("version").unwrap_or("2.0").to_string();
                info.dc_declared |= attrs.prefix_for(DC_NAMESPACE) == Some("dc");
                if let Some(prefix) = attrs.prefix_for(OPF_NAMESPACE) {
                    info.opf_prefix = Some(prefix.to_string());
                }
            }
            b"metadata" => {
                info.has_metadata = true;
                info.dc_declared |= attrs.prefix_for(DC_NAMESPACE) == Some("dc");
                if let Some(prefix) = attrs.prefix_for(OPF_NAMESPACE) {
                    info.opf_prefix = Some(prefix.to_string());
                }
            }
            b"title" if parent == Some(b"metadata".as_slice()) => {
                if let Some(id) = attrs.get("id") {
                    info.removed_ids.insert(id.to_string());
                }
            }
            b"creator" if parent == Some(b"metadata".as_slice()) => {
                if let Some(id) = attrs.get("id") {
                    creators.push((attrs.get("role").map(str::to_string), id.to_string()));
                }
            }
            b"meta" if parent == Some(b"metadata".as_slice()) => {
                if attrs.get("name") == Some("cover") {
                    meta_cover_id = attrs.get("content").map(str::to_string);
                }
                match attrs.get("property") {
                    Some("belongs-to-collection") => {
                        if let Some(id) = attrs.get("id") {
                            info.removed_ids.insert(id.to_string());
                        }
                    }
                    Some("role") if !is_empty => {
                        if let Some(target) = refines_target(&attrs) {
                            pending_role = Some((target.to_string(), String::new()));
                        }
                    }
                    _ => {}
                }
            }
            b"item" if parent == Some(b"manifest".as_slice()) => {
                if let (Some(id), Some(href)) = (attrs.get("id"), attrs.get("href")) {
                    let item = CoverItem {
                        id: id.to_string(),
                        href: href.to_string(),
                    };
                    let is_cover_image = attrs
                        .get("properties")
                        .map(|p| p.split_whitespace().any(|p| p == "cover-image"))
                        .unwrap_or(false);
                    if is_cover_image && cover_image_id.is_none() {
                        cover_image_id = Some(item.id.clone());
                    }
                    manifest.push(item);
                }
            }
            _ => {}
        }

        if !is_empty {
            stack.push(name);
        }
    }

    if !info.has_metadata {
        return Err(DownloadError::MissingPackageDocument(
            "package document has no <metadata> element".to_string(),
        ));
    }

    // Author creators are only known once every role refinement was seen.
    for (role, id) in creators {
        if info.creator_is_author(role.as_deref(), Some(&id)) {
            info.removed_ids.insert(id);
        }
    }

    let cover_id = cover_image_id.or(meta_cover_id);
    info.cover = cover_id.and_then(|id| manifest.into_iter().find(|item| item.id == id));

    Ok(info)
}

/// Allocate ids that collide with nothing in the document
struct IdAllocator<'a> {
    taken: &'a HashSet<String>,
    issued: HashSet<String>,
}

impl<'a> IdAllocator<'a> {
    fn new(taken: &'a HashSet<String>) -> Self {
        Self {
            taken,
            issued: HashSet::new(),
        }
    }

    fn issue(&mut self, base: &str) -> String {
        let mut candidate = base.to_string();
        let mut n = 2;
        while self.taken.contains(&candidate) || self.issued.contains(&candidate) {
            candidate = format!("{}-{}", base, n);
            n += 1;
        }
        self.issued.insert(candidate.clone());
        candidate
    }
}

type XmlWriter = Writer<Vec<u8>>;

fn write_indent(writer: &mut XmlWriter) -> DownloadResult<()> {
    writer.write_event(Event::Text(BytesText::from_escaped("\n    ")))?;
    Ok(())
}

fn write_text_element(
    writer: &mut XmlWriter,
    name: &str,
    attrs: &[(&str, &str)],
    text: &str,
) -> DownloadResult<()> {
    write_indent(writer)?;
    let mut start = BytesStart::new(name);
    for attr in attrs {
        start.push_attribute(*attr);
    }
    writer.write_event(Event::Start(start))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn write_empty_element(writer: &mut XmlWriter, name: &str, attrs: &[(&str, &str)]) -> DownloadResult<()> {
    write_indent(writer)?;
    let mut start = BytesStart::new(name);
    for attr in attrs {
        start.push_attribute(*attr);
    }
    writer.write_event(Event::Empty(start))?;
    Ok(())
}

/// Write the tracked metadata elements for `book`
fn write_metadata(writer: &mut XmlWriter, info: &PackageInfo, book: &Book) -> DownloadResult<()> {
    let mut ids = IdAllocator::new(&info.ids);
    let subtitle = book.subtitle.as_deref().map(str::trim).filter(|s| !s.is_empty());

    if info.is_epub3() {
        let title_id = ids.issue("title-main");
        let title_ref = format!("#{}", title_id);
        write_text_element(writer, "dc:title", &[("id", title_id.as_str())], &book.title)?;
        if let Some(subtitle) = subtitle {
            write_text_element(
                writer,
                "meta",
                &[("refines", title_ref.as_str()), ("property", "title-type")],
                "main",
            )?;
            let subtitle_id = ids.issue("title-sub");
            let subtitle_ref = format!("#{}", subtitle_id);
            write_text_element(writer, "dc:title", &[("id", subtitle_id.as_str())], subtitle)?;
            write_text_element(
                writer,
                "meta",
                &[("refines", subtitle_ref.as_str()), ("property", "title-type")],
                "subtitle",
            )?;
        }

        for (index, author) in book.sorted_authors().into_iter().enumerate() {
            let creator_id = ids.issue(&format!("creator-{:02}", index + 1));
            let creator_ref = format!("#{}", creator_id);
            write_text_element(writer, "dc:creator", &[("id", creator_id.as_str())], &author.name)?;
            write_text_element(
                writer,
                "meta",
                &[
                    ("refines", creator_ref.as_str()),
                    ("property", "role"),
                    ("scheme", "marc:relators"),
                ],
                "aut",
            )?;
        }
    } else {
        write_text_element(writer, "dc:title", &[], &book.title)?;
        if let Some(subtitle) = subtitle {
            write_text_element(writer, "dc:title", &[], subtitle)?;
        }
        let role_attr = format!("{}:role", info.opf_prefix.as_deref().unwrap_or("opf"));
        for author in book.sorted_authors() {
            write_text_element(writer, "dc:creator", &[(role_attr.as_str(), "aut")], &author.name)?;
        }
    }

    if let Some(series) = book.primary_series() {
        write_empty_element(
            writer,
            "meta",
            &[("name", CALIBRE_SERIES), ("content", series.name.as_str())],
        )?;
        if let Some(number) = series.number {
            let index = format_series_number(number);
            write_empty_element(
                writer,
                "meta",
                &[("name", CALIBRE_SERIES_INDEX), ("content", index.as_str())],
            )?;
        }
    }

    writer.write_event(Event::Text(BytesText::from_escaped("\n  ")))?;
    Ok(())
}

/// Copy of `e` with one attribute replaced (or added)
fn with_attribute(e: &BytesStart<'_>, key: &str, value: &str) -> DownloadResult<BytesStart<'static>> {
    let name = std::str::from_utf8(e.name().as_ref())?.to_string();
    let mut out = BytesStart::new(name);
    let mut replaced = false;
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == key.as_bytes() {
            out.push_attribute((key, value));
            replaced = true;
        } else {
            out.push_attribute(attr);
        }
    }
    if !replaced {
        out.push_attribute((key, value));
    }
    Ok(out)
}

/// Copy of the `<metadata>` start tag with any missing namespace declarations
fn metadata_start(e: &BytesStart<'_>, info: &PackageInfo) -> DownloadResult<BytesStart<'static>> {
    let mut out = e.to_owned();
    if !info.dc_declared {
        out.push_attribute(("xmlns:dc", DC_NAMESPACE));
    }
    if !info.is_epub3() && info.opf_prefix.is_none() {
        out.push_attribute(("xmlns:opf", OPF_NAMESPACE));
    }
    Ok(out)
}

fn should_drop(name: &[u8], attrs: &Attrs, info: &PackageInfo) -> bool {
    match name {
        b"title" => true,
        b"creator" => info.creator_is_author(attrs.get("role"), attrs.get("id")),
        b"meta" => {
            matches!(attrs.get("name"), Some(CALIBRE_SERIES) | Some(CALIBRE_SERIES_INDEX))
                || attrs.get("property") == Some("belongs-to-collection")
                || refines_target(attrs)
                    .map(|target| info.removed_ids.contains(target))
                    .unwrap_or(false)
        }
        _ => false,
    }
}

/// Second pass: rewrite the package document for `book`
pub fn rewrite(
    xml: &str,
    info: &PackageInfo,
    book: &Book,
    cover: Option<&CoverUpdate>,
) -> DownloadResult<Vec<u8>> {
    let mut reader = Reader::from_str(strip_bom(xml));
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + 512));
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut skip_depth = 0usize;

    loop {
        let event = reader.read_event()?;

        if skip_depth > 0 {
            match event {
                Event::Start(_) => skip_depth += 1,
                Event::End(_) => skip_depth -= 1,
                Event::Eof => break,
                _ => {}
            }
            continue;
        }

        match event {
            Event::Eof => break,
            Event::Start(e) => {
                let name = local_name(&e);
                let in_metadata = stack.last().map(Vec::as_slice) == Some(b"metadata".as_slice());
                let in_manifest = stack.last().map(Vec::as_slice) == Some(b"manifest".as_slice());

                if name == b"metadata" {
                    writer.write_event(Event::Start(metadata_start(&e, info)?))?;
                    stack.push(name);
                    continue;
                }
                if in_metadata && should_drop(&name, &Attrs::read(&e)?, info) {
                    skip_depth = 1;
                    continue;
                }
                if in_manifest && name == b"item" {
                    let attrs = Attrs::read(&e)?;
                    if let Some(update) = cover.filter(|c| attrs.get("id") == Some(c.id.as_str())) {
                        writer.write_event(Event::Start(with_attribute(&e, "media-type", &update.media_type)?))?;
                        stack.push(name);
                        continue;
                    }
                }
                writer.write_event(Event::Start(e))?;
                stack.push(name);
            }
            Event::Empty(e) => {
                let name = local_name(&e);
                let in_metadata = stack.last().map(Vec::as_slice) == Some(b"metadata".as_slice());
                let in_manifest = stack.last().map(Vec::as_slice) == Some(b"manifest".as_slice());

                if name == b"metadata" {
                    writer.write_event(Event::Start(metadata_start(&e, info)?))?;
                    write_metadata(&mut writer, info, book)?;
                    writer.write_event(Event::End(BytesEnd::new(
                        std::str::from_utf8(e.name().as_ref())?.to_string(),
                    )))?;
                    continue;
                }
                if in_metadata && should_drop(&name, &Attrs::read(&e)?, info) {
                    continue;
                }
                if in_manifest && name == b"item" {
                    let attrs = Attrs::read(&e)?;
                    if let Some(update) = cover.filter(|c| attrs.get("id") == Some(c.id.as_str())) {
                        writer.write_event(Event::Empty(with_attribute(&e, "media-type", &update.media_type)?))?;
                        continue;
                    }
                }
                writer.write_event(Event::Empty(e))?;
            }
            Event::End(e) => {
                if e.local_name().as_ref() == b"metadata" {
                    write_metadata(&mut writer, info, book)?;
                }
                stack.pop();
                writer.write_event(Event::End(e))?;
            }
            other => writer.write_event(other)?,
        }
    }

    Ok(writer.into_inner())
}

/// Resolve a manifest href against the package document's directory
pub fn resolve_href(opf_path: &str, href: &str) -> String {
    let href = href.split('#').next().unwrap_or(href);
    let href = urlencoding::decode(href)
        .map(|h| h.into_owned())
        .unwrap_or_else(|_| href.to_string());

    let base = match opf_path.rfind('/') {
        Some(pos) => &opf_path[..pos],
        None => "",
    };

    let mut segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    for segment in href.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fixtures;

    fn rewrite_str(xml: &str, book: &Book, cover: Option<&CoverUpdate>) -> String {
        let info = scan(xml).unwrap();
        String::from_utf8(rewrite(xml, &info, book, cover).unwrap()).unwrap()
    }

    #[test]
    fn test_scan_finds_cover_and_version() {
        let info = scan(fixtures::OPF_V3).unwrap();
        assert!(info.is_epub3());
        assert_eq!(
            info.cover,
            Some(CoverItem {
                id: "cover-img".to_string(),
                href: "images/cover.jpg".to_string(),
            })
        );

        let info = scan(fixtures::OPF_V2).unwrap();
        assert!(!info.is_epub3());
        assert_eq!(info.cover.map(|c| c.href), Some("cover.jpg".to_string()));
    }

    #[test]
    fn test_scan_requires_metadata() {
        let xml = r#"<package xmlns="http://www.idpf.org/2007/opf" version="3.0"><manifest/></package>"#;
        assert!(matches!(scan(xml), Err(DownloadError::MissingPackageDocument(_))));
    }

    #[test]
    fn test_unparsable_package_is_an_error() {
        assert!(scan("<package><metadata></package>").is_err());
    }

    #[test]
    fn test_rewrite_epub3_metadata() {
        let out = rewrite_str(fixtures::OPF_V3, &fixtures::book(), None);

        assert!(out.contains(">The Way of Kings</dc:title>"));
        assert!(out.contains(">Book One</dc:title>"));
        assert!(out.contains(r#"property="title-type">subtitle</meta>"#));
        assert!(!out.contains("Old Title"));
        assert!(!out.contains("Old Author"));
        assert!(!out.contains("Old Series"));

        // Authors in sort order, each with an aut role refinement
        let first = out.find(">Brandon Sanderson</dc:creator>").unwrap();
        let second = out.find(">Second Author</dc:creator>").unwrap();
        assert!(first < second);
        assert_eq!(out.matches(r#"scheme="marc:relators">aut</meta>"#).count(), 2);

        assert!(out.contains(r#"<meta name="calibre:series" content="The Stormlight Archive"/>"#));
        assert!(out.contains(r#"<meta name="calibre:series_index" content="1"/>"#));

        // Untracked metadata survives
        assert!(out.contains(">Jane Illustrator</dc:creator>"));
        assert!(out.contains(r##"refines="#ill" property="role" scheme="marc:relators">ill</meta>"##));
        assert!(out.contains("<dc:language>en</dc:language>"));
        assert!(out.contains(r#"<meta name="cover" content="cover-img"/>"#));
        assert!(out.contains("<spine>"));
    }

    #[test]
    fn test_rewrite_epub2_uses_opf_role() {
        let mut book = fixtures::book();
        book.series[0].number = Some(2.5);
        let out = rewrite_str(fixtures::OPF_V2, &book, None);

        assert!(out.contains(r#"<dc:creator opf:role="aut">Brandon Sanderson</dc:creator>"#));
        assert!(out.contains(r#"content="2.5""#));
        assert!(!out.contains("Old Author"));
        assert!(!out.contains(r#"content="Old Series""#));
        assert!(out.contains("<dc:publisher>Tor</dc:publisher>"));
    }

    #[test]
    fn test_rewrite_updates_cover_media_type() {
        let update = CoverUpdate {
            id: "cover-img".to_string(),
            media_type: "image/png".to_string(),
        };
        let out = rewrite_str(fixtures::OPF_V3, &fixtures::book(), Some(&update));
        assert!(out.contains(r#"id="cover-img" href="images/cover.jpg" media-type="image/png""#));
    }

    #[test]
    fn test_new_ids_do_not_collide() {
        let xml = fixtures::OPF_V3.replace(r#"id="ncx""#, r#"id="title-main""#);
        let out = rewrite_str(&xml, &fixtures::book(), None);
        assert!(out.contains(r#"<dc:title id="title-main-2">"#));
    }

    #[test]
    fn test_resolve_href() {
        assert_eq!(resolve_href("OEBPS/content.opf", "images/cover.jpg"), "OEBPS/images/cover.jpg");
        assert_eq!(resolve_href("content.opf", "cover.jpg"), "cover.jpg");
        assert_eq!(resolve_href("OPS/xhtml/pkg.opf", "../img/My%20Cover.png"), "OPS/img/My Cover.png");
        assert_eq!(resolve_href("OEBPS/content.opf", "./cover.jpg#frag"), "OEBPS/cover.jpg");
    }
}
