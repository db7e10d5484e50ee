//! Download file names
//!
//! Builds a human-readable name such as
//! `[Brandon Sanderson] The Stormlight Archive #1 - The Way of Kings.epub`.

use std::sync::OnceLock;

use regex::{Captures, Regex};

use super::types::{Book, File};

/// Characters that are invalid in file names on at least one common platform
const INVALID_FILENAME_CHARS: [char; 9] = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// Matches volume indicators like `v1`, `V3`, `Vol. 2`, `vol 12`, `Volume 4`
fn volume_regex() -> &'static Regex {
    static VOLUME: OnceLock<Regex> = OnceLock::new();
    VOLUME.get_or_init(|| {
        Regex::new(r"(?i)\b(v|vol\.?\s*|volume\s*)(\d+)\b").expect("volume pattern is valid")
    })
}

/// Render a series number: `1` for whole numbers, `1.5` otherwise
pub fn format_series_number(number: f64) -> String {
    if number.is_finite() && number.fract() == 0.0 && number.abs() < i64::MAX as f64 {
        format!("{}", number as i64)
    } else {
        format!("{}", number)
    }
}

/// Zero-pad every volume indicator in `title` to three digits
///
/// Returns `None` when the title has no volume indicator.
fn pad_volume(title: &str) -> Option<String> {
    let regex = volume_regex();
    if !regex.is_match(title) {
        return None;
    }
    let padded = regex.replace_all(title, |caps: &Captures| {
        match caps[2].parse::<u64>() {
            Ok(number) => format!("{}{:03}", &caps[1], number),
            // Too many digits for u64; keep them as written
            Err(_) => caps[0].to_string(),
        }
    });
    Some(padded.into_owned())
}

fn strip_invalid(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !INVALID_FILENAME_CHARS.contains(c) && !c.is_control())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Format the download name for `file` of `book`
pub fn format_name(book: &Book, file: &File) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(author) = book.primary_author() {
        parts.push(format!("[{}]", author.name));
    }

    let title = book.title.trim();
    let title = if title.is_empty() { "Untitled" } else { title };
    let series = book.primary_series();

    match (series, pad_volume(title)) {
        (Some(_), Some(padded)) => parts.push(padded),
        (Some(series), None) => {
            let segment = match series.number {
                Some(number) => format!("{} #{}", series.name, format_series_number(number)),
                None => series.name.clone(),
            };
            parts.push(format!("{} - {}", segment, title));
        }
        (None, _) => parts.push(title.to_string()),
    }

    if file.file_type.is_audiobook() {
        if let Some(narrator) = file.primary_narrator() {
            parts.push(format!("{{{}}}", narrator.name));
        }
    }

    let stem = strip_invalid(&parts.join(" "));
    format!("{}.{}", stem, file.file_type.extension())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::types::{Author, FileType, Narrator, SeriesRef};
    use chrono::Utc;

    fn book(title: &str, author: Option<&str>, series: Option<(&str, Option<f64>)>) -> Book {
        Book {
            id: 1,
            title: title.to_string(),
            subtitle: None,
            description: None,
            authors: author
                .map(|name| {
                    vec![Author {
                        name: name.to_string(),
                        role: None,
                        sort_order: 0,
                    }]
                })
                .unwrap_or_default(),
            series: series
                .map(|(name, number)| {
                    vec![SeriesRef {
                        name: name.to_string(),
                        number,
                        sort_order: 0,
                    }]
                })
                .unwrap_or_default(),
            updated_at: Utc::now(),
        }
    }

    fn file(file_type: FileType) -> File {
        File {
            id: 1,
            book_id: 1,
            path: "/tmp/source".into(),
            file_type,
            narrators: Vec::new(),
            cover: None,
            cover_page: None,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_series_number_formatting() {
        assert_eq!(format_series_number(1.0), "1");
        assert_eq!(format_series_number(1.5), "1.5");
        assert_eq!(format_series_number(10.25), "10.25");
        assert_eq!(format_series_number(0.0), "0");
    }

    #[test]
    fn test_author_series_and_title() {
        let b = book(
            "The Way of Kings",
            Some("Brandon Sanderson"),
            Some(("The Stormlight Archive", Some(1.0))),
        );
        assert_eq!(
            format_name(&b, &file(FileType::Epub)),
            "[Brandon Sanderson] The Stormlight Archive #1 - The Way of Kings.epub"
        );
    }

    #[test]
    fn test_no_series() {
        let b = book("1984", Some("George Orwell"), None);
        assert_eq!(format_name(&b, &file(FileType::Epub)), "[George Orwell] 1984.epub");
    }

    #[test]
    fn test_no_author() {
        let b = book("Anonymous Work", None, None);
        assert_eq!(format_name(&b, &file(FileType::Epub)), "Anonymous Work.epub");
    }

    #[test]
    fn test_decimal_series_number() {
        let b = book("Edgedancer", Some("Brandon Sanderson"), Some(("Stormlight", Some(1.5))));
        let name = format_name(&b, &file(FileType::Epub));
        assert!(name.contains("#1.5 - "), "{}", name);
        assert!(!name.contains("#1.50"));
    }

    #[test]
    fn test_series_without_number() {
        let b = book("Side Story", None, Some(("Cosmere", None)));
        assert_eq!(format_name(&b, &file(FileType::Epub)), "Cosmere - Side Story.epub");
    }

    #[test]
    fn test_volume_in_title_replaces_series_segment() {
        let b = book("My Manga v1", None, Some(("X", Some(1.0))));
        assert_eq!(format_name(&b, &file(FileType::Cbz)), "My Manga v001.cbz");

        let b = book("My Manga Vol. 2", Some("Mangaka"), Some(("My Manga", Some(2.0))));
        assert_eq!(
            format_name(&b, &file(FileType::Cbz)),
            "[Mangaka] My Manga Vol. 002.cbz"
        );
    }

    #[test]
    fn test_overlong_volume_number_keeps_its_digits() {
        let b = book("My Manga v123456789012345678901234", None, Some(("My Manga", Some(1.0))));
        assert_eq!(
            format_name(&b, &file(FileType::Cbz)),
            "My Manga v123456789012345678901234.cbz"
        );

        let b = book("My Manga v7 and v99999999999999999999999", None, Some(("My Manga", None)));
        assert_eq!(
            format_name(&b, &file(FileType::Cbz)),
            "My Manga v007 and v99999999999999999999999.cbz"
        );
    }

    #[test]
    fn test_volume_in_title_without_series_is_untouched() {
        let b = book("Notes v1", None, None);
        assert_eq!(format_name(&b, &file(FileType::Cbz)), "Notes v1.cbz");
    }

    #[test]
    fn test_audiobook_narrator() {
        let b = book("Dune", Some("Frank Herbert"), None);
        let mut f = file(FileType::M4b);
        f.narrators = vec![
            Narrator {
                name: "Simon Vance".to_string(),
                sort_order: 1,
            },
            Narrator {
                name: "Scott Brick".to_string(),
                sort_order: 0,
            },
        ];
        assert_eq!(format_name(&b, &f), "[Frank Herbert] Dune {Scott Brick}.m4b");

        // Narrators on non-audio files are ignored
        f.file_type = FileType::Epub;
        assert_eq!(format_name(&b, &f), "[Frank Herbert] Dune.epub");
    }

    #[test]
    fn test_invalid_characters_are_stripped() {
        let b = book("What? A \"Title\": Part 1/2", Some("A<B>C|D"), None);
        assert_eq!(
            format_name(&b, &file(FileType::Epub)),
            "[ABCD] What A Title Part 12.epub"
        );
    }
}
