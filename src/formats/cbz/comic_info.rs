//! ComicInfo.xml editing
//!
//! The document is split into its root element's children. Tracked
//! children are replaced, everything else is written back untouched, and
//! new children are slotted in at their ComicInfo schema position so
//! strict readers accept the result.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

use crate::error::{DownloadError, DownloadResult};
use crate::library::{format_series_number, sorted, AuthorRole, Book, File};

pub const ENTRY_NAME: &str = "ComicInfo.xml";

const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
const XSD_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";
const FRONT_COVER: &str = "FrontCover";

/// Element order of the ComicInfo v2 schema
const SCHEMA_ORDER: &[&str] = &[
    "Title",
    "Series",
    "Number",
    "Count",
    "Volume",
    "AlternateSeries",
    "AlternateNumber",
    "AlternateCount",
    "Summary",
    "Notes",
    "Year",
    "Month",
    "Day",
    "Writer",
    "Penciller",
    "Inker",
    "Colorist",
    "Letterer",
    "CoverArtist",
    "Editor",
    "Translator",
    "Publisher",
    "Imprint",
    "Genre",
    "Tags",
    "Web",
    "PageCount",
    "LanguageISO",
    "Format",
    "BlackAndWhite",
    "Manga",
    "Characters",
    "Teams",
    "Locations",
    "ScanInformation",
    "StoryArc",
    "StoryArcNumber",
    "SeriesGroup",
    "AgeRating",
    "Pages",
    "CommunityRating",
    "MainCharacterOrTeam",
    "Review",
    "GTIN",
];

fn schema_rank(name: &str) -> Option<usize> {
    SCHEMA_ORDER.iter().position(|n| *n == name)
}

fn is_tracked(name: &str) -> bool {
    matches!(name, "Title" | "Series" | "Number")
        || AuthorRole::ALL.iter().any(|role| role.comic_info_element() == name)
}

/// One top-level node under `<ComicInfo>`
///
/// `name` is `None` for comments and stray text, which keep their place.
#[derive(Debug, Clone)]
struct Child {
    name: Option<String>,
    events: Vec<Event<'static>>,
}

impl Child {
    fn text_element(name: &str, text: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            events: vec![
                Event::Start(BytesStart::new(name.to_string())),
                Event::Text(BytesText::new(text).into_owned()),
                Event::End(BytesEnd::new(name.to_string())),
            ],
        }
    }
}

/// Parsed ComicInfo.xml
#[derive(Debug, Clone)]
pub struct ComicInfo {
    prolog: Vec<Event<'static>>,
    root: BytesStart<'static>,
    children: Vec<Child>,
    epilog: Vec<Event<'static>>,
}

impl ComicInfo {
    /// A fresh document with the usual schema namespace declarations
    pub fn empty() -> Self {
        let mut root = BytesStart::new("ComicInfo");
        root.push_attribute(("xmlns:xsi", XSI_NAMESPACE));
        root.push_attribute(("xmlns:xsd", XSD_NAMESPACE));
        Self {
            prolog: vec![Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None))],
            root,
            children: Vec::new(),
            epilog: Vec::new(),
        }
    }

    pub fn parse(bytes: &[u8]) -> DownloadResult<Self> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF".as_slice()).unwrap_or(bytes);
        let mut reader = Reader::from_reader(bytes);
        let mut buf = Vec::new();

        let mut prolog = Vec::new();
        let mut root: Option<BytesStart<'static>> = None;
        let mut children: Vec<Child> = Vec::new();
        let mut epilog = Vec::new();
        let mut current: Option<Child> = None;
        let mut depth = 0usize;
        let mut closed = false;

        loop {
            let event = reader.read_event_into(&mut buf)?.into_owned();
            buf.clear();

            if matches!(event, Event::Eof) {
                break;
            }
            if closed {
                epilog.push(event);
                continue;
            }

            match (depth, event) {
                (0, Event::Start(e)) => {
                    root = Some(e);
                    depth = 1;
                }
                (0, Event::Empty(e)) => {
                    root = Some(e);
                    closed = true;
                }
                (0, other) => prolog.push(other),
                (1, Event::Start(e)) => {
                    let name = std::str::from_utf8(e.local_name().as_ref())?.to_string();
                    current = Some(Child {
                        name: Some(name),
                        events: vec![Event::Start(e)],
                    });
                    depth = 2;
                }
                (1, Event::Empty(e)) => {
                    let name = std::str::from_utf8(e.local_name().as_ref())?.to_string();
                    children.push(Child {
                        name: Some(name),
                        events: vec![Event::Empty(e)],
                    });
                }
                (1, Event::End(_)) => {
                    depth = 0;
                    closed = true;
                }
                (1, Event::Text(t)) => {
                    if !t.iter().all(u8::is_ascii_whitespace) {
                        children.push(Child {
                            name: None,
                            events: vec![Event::Text(t)],
                        });
                    }
                }
                (1, other) => children.push(Child {
                    name: None,
                    events: vec![other],
                }),
                (_, event) => {
                    let Some(child) = current.as_mut() else {
                        continue;
                    };
                    match &event {
                        Event::Start(_) => depth += 1,
                        Event::End(_) => depth -= 1,
                        _ => {}
                    }
                    child.events.push(event);
                    if depth == 1 {
                        if let Some(done) = current.take() {
                            children.push(done);
                        }
                    }
                }
            }
        }

        let root = root.ok_or_else(|| {
            DownloadError::MalformedContainer(format!("{} has no root element", ENTRY_NAME))
        })?;
        if !closed {
            return Err(DownloadError::MalformedContainer(format!(
                "{} ends before </{}>",
                ENTRY_NAME,
                String::from_utf8_lossy(root.name().as_ref())
            )));
        }

        Ok(Self {
            prolog,
            root,
            children,
            epilog,
        })
    }

    /// Names of the element children, in document order
    #[cfg(test)]
    pub fn element_names(&self) -> Vec<&str> {
        self.children.iter().filter_map(|c| c.name.as_deref()).collect()
    }

    /// Text of the first child element called `name`
    #[cfg(test)]
    pub fn text(&self, name: &str) -> Option<String> {
        let child = self.children.iter().find(|c| c.name.as_deref() == Some(name))?;
        let mut text = String::new();
        for event in &child.events {
            if let Event::Text(t) = event {
                text.push_str(&t.unescape().ok()?);
            }
        }
        Some(text)
    }

    /// Replace the tracked fields with the values from `book` and `file`
    pub fn apply(&mut self, book: &Book, file: &File) -> DownloadResult<()> {
        self.children
            .retain(|c| !c.name.as_deref().map(is_tracked).unwrap_or(false));

        if !book.title.trim().is_empty() {
            self.insert(Child::text_element("Title", &book.title));
        }
        if let Some(series) = book.primary_series() {
            self.insert(Child::text_element("Series", &series.name));
            if let Some(number) = series.number {
                self.insert(Child::text_element("Number", &format_series_number(number)));
            }
        }

        let authors = sorted(&book.authors);
        for role in AuthorRole::ALL {
            let names: Vec<&str> = authors
                .iter()
                .filter(|a| a.role.unwrap_or(AuthorRole::Writer) == role)
                .map(|a| a.name.as_str())
                .collect();
            if !names.is_empty() {
                self.insert(Child::text_element(role.comic_info_element(), &names.join(", ")));
            }
        }

        if let Some(page) = file.cover_page {
            self.mark_front_cover(page)?;
        }
        Ok(())
    }

    /// Insert `child` before the first known element that sorts after it
    fn insert(&mut self, child: Child) {
        let rank = child.name.as_deref().and_then(schema_rank);
        let position = rank.and_then(|rank| {
            self.children.iter().position(|c| {
                c.name
                    .as_deref()
                    .and_then(schema_rank)
                    .map(|r| r > rank)
                    .unwrap_or(false)
            })
        });
        match position {
            Some(index) => self.children.insert(index, child),
            None => self.children.push(child),
        }
    }

    /// Flag page `index` as the front cover and clear the flag elsewhere
    fn mark_front_cover(&mut self, index: u32) -> DownloadResult<()> {
        let image = index.to_string();
        let Some(position) = self
            .children
            .iter()
            .position(|c| c.name.as_deref() == Some("Pages"))
        else {
            let mut page = BytesStart::new("Page");
            page.push_attribute(("Image", image.as_str()));
            page.push_attribute(("Type", FRONT_COVER));
            self.insert(Child {
                name: Some("Pages".to_string()),
                events: vec![
                    Event::Start(BytesStart::new("Pages")),
                    Event::Empty(page),
                    Event::End(BytesEnd::new("Pages")),
                ],
            });
            return Ok(());
        };

        let pages = &mut self.children[position];
        // A self-closing <Pages/> has nowhere to put a page yet.
        if let Some(Event::Empty(e)) = pages.events.first().cloned() {
            pages.events = vec![Event::Start(e.clone()), Event::End(e.to_end().into_owned())];
        }

        let mut found = false;
        let mut events = Vec::with_capacity(pages.events.len() + 1);
        for event in pages.events.drain(..) {
            match event {
                Event::Empty(e) if e.local_name().as_ref() == b"Page" => {
                    let (page, is_cover) = retag_page(&e, &image)?;
                    found |= is_cover;
                    events.push(Event::Empty(page));
                }
                Event::Start(e) if e.local_name().as_ref() == b"Page" => {
                    let (page, is_cover) = retag_page(&e, &image)?;
                    found |= is_cover;
                    events.push(Event::Start(page));
                }
                other => events.push(other),
            }
        }

        if !found {
            let mut page = BytesStart::new("Page");
            page.push_attribute(("Image", image.as_str()));
            page.push_attribute(("Type", FRONT_COVER));
            let end = events.pop();
            events.push(Event::Empty(page));
            events.extend(end);
        }
        pages.events = events;
        Ok(())
    }

    pub fn to_bytes(&self) -> DownloadResult<Vec<u8>> {
        let mut writer = Writer::new(Vec::new());
        for event in &self.prolog {
            writer.write_event(event.clone())?;
        }
        if !self.prolog.is_empty() && !matches!(self.prolog.last(), Some(Event::Text(_))) {
            writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;
        }

        writer.write_event(Event::Start(self.root.clone()))?;
        for child in &self.children {
            writer.write_event(Event::Text(BytesText::from_escaped("\n  ")))?;
            for event in &child.events {
                writer.write_event(event.clone())?;
            }
        }
        writer.write_event(Event::Text(BytesText::from_escaped("\n")))?;
        writer.write_event(Event::End(self.root.to_end()))?;

        for event in &self.epilog {
            writer.write_event(event.clone())?;
        }
        Ok(writer.into_inner())
    }
}

/// Copy of a `<Page>` tag with its `Type` adjusted; returns whether it is
/// the cover page
fn retag_page(e: &BytesStart<'_>, image: &str) -> DownloadResult<(BytesStart<'static>, bool)> {
    let mut is_cover = false;
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == b"Image" && attr.unescape_value()?.trim() == image {
            is_cover = true;
        }
    }

    let mut page = BytesStart::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for attr in e.attributes() {
        let attr = attr?;
        if attr.key.as_ref() == b"Type" && (is_cover || attr.unescape_value()? == FRONT_COVER) {
            continue;
        }
        page.push_attribute(attr);
    }
    if is_cover {
        page.push_attribute(("Type", FRONT_COVER));
    }
    Ok((page, is_cover))
}
