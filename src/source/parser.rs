//! Parser for Google Photos shared-album pages.
//!
//! The page embeds album data as JavaScript arrays inside
//! `AF_initDataCallback(...)` blocks. Each media entry starts with
//! `["AF1Qip…",["https://lh3.googleusercontent.com/pw/…",width,height,…`
//! followed by the capture time in epoch milliseconds. Video entries carry
//! the `76647426` metadata key somewhere before the next entry.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{TimeZone, Utc};
use regex::Regex;
use scraper::{Html, Selector};

use super::{ItemDescriptor, ResolvedAlbum, SourceError};

const DATA_MARKER: &str = "AF_initDataCallback";
const VIDEO_MARKER: &str = "76647426";
/// Upper bound on how far past an entry header we look for its timestamp.
const MAX_ENTRY_SPAN: usize = 4096;

static MEDIA_ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"\["(AF1Q[A-Za-z0-9_-]+)",\["(https://lh3\.googleusercontent\.com/[A-Za-z0-9_/-]+)",(\d+),(\d+)"#,
    )
    .expect("valid media entry regex")
});

static CAPTURE_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\],(\d{12,14}),").expect("valid timestamp regex"));

static OG_TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse(r#"meta[property="og:title"]"#).expect("valid selector"));

static TITLE: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid selector"));

/// Parse an album page into its title and ordered, de-duplicated items.
///
/// Returns `Format` when the page has no embedded data at all (the page
/// layout changed, or this is not an album page) and `Empty` when the data
/// is there but lists no media.
pub fn parse_album_page(url: &str, html: &str) -> Result<ResolvedAlbum, SourceError> {
    if !html.contains(DATA_MARKER) {
        return Err(SourceError::Format {
            url: url.to_string(),
            reason: format!("no {} block found", DATA_MARKER),
        });
    }

    let title = extract_title(html);
    let matches: Vec<_> = MEDIA_ENTRY.captures_iter(html).collect();
    let mut seen = HashSet::new();
    let mut items = Vec::new();

    for (idx, caps) in matches.iter().enumerate() {
        let media_key = &caps[1];
        if !seen.insert(media_key.to_string()) {
            continue;
        }
        let base_url = &caps[2];

        let whole = caps.get(0).map(|m| m.end()).unwrap_or(0);
        let next_start = matches
            .get(idx + 1)
            .and_then(|c| c.get(0))
            .map(|m| m.start())
            .unwrap_or(html.len());
        let span_end = next_start.min(whole.saturating_add(MAX_ENTRY_SPAN)).min(html.len());
        let segment = html.get(whole..span_end).unwrap_or("");

        let captured_at = CAPTURE_TIME
            .captures(segment)
            .and_then(|c| c[1].parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
        let is_video = segment.contains(VIDEO_MARKER);

        let (suffix, ext) = if is_video { ("=dv", "mp4") } else { ("=d", "jpg") };
        items.push(ItemDescriptor {
            media_key: media_key.to_string(),
            url: format!("{}{}", base_url, suffix),
            filename_hint: format!("{}.{}", media_key, ext),
            captured_at,
            is_video,
        });
    }

    if items.is_empty() {
        return Err(SourceError::Empty {
            url: url.to_string(),
        });
    }

    tracing::debug!(url, items = items.len(), title = ?title, "Parsed album page");
    Ok(ResolvedAlbum { title, items })
}

fn extract_title(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let raw = document
        .select(&OG_TITLE)
        .next()
        .and_then(|el| el.value().attr("content"))
        .map(str::to_string)
        .or_else(|| {
            document
                .select(&TITLE)
                .next()
                .map(|el| el.text().collect::<String>())
        })?;
    clean_title(&raw)
}

fn clean_title(raw: &str) -> Option<String> {
    let mut title = raw.trim();
    for suffix in [" - Google Photos", " – Google Photos", "Google Photos"] {
        if let Some(stripped) = title.strip_suffix(suffix) {
            title = stripped.trim();
        }
    }
    if title.is_empty() {
        None
    } else {
        Some(title.to_string())
    }
}

/// Extract the filename from a `Content-Disposition` header value.
pub fn content_disposition_filename(header: &str) -> Option<String> {
    header.split(';').map(str::trim).find_map(|part| {
        let value = part
            .strip_prefix("filename=")
            .or_else(|| part.strip_prefix("filename*=UTF-8''"))?;
        let name = value.trim_matches('"').trim();
        if name.is_empty() {
            None
        } else {
            Some(name.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALBUM_URL: &str = "https://photos.google.com/share/AF1QipTEST";

    fn album_page(entries: &str) -> String {
        format!(
            r#"<html><head><meta property="og:title" content="Summer Trip"><title>Summer Trip - Google Photos</title></head>
<body><script>AF_initDataCallback({{key: 'ds:1', hash: '2', data:[null,[{}]]}});</script></body></html>"#,
            entries
        )
    }

    const PHOTO: &str = r#"["AF1QipAAA",["https://lh3.googleusercontent.com/pw/abc",4032,3024,null,null,null,null,null,null,[1]],1690000000000,"x",-7200000,1690000001000]"#;
    const VIDEO: &str = r#"["AF1QipBBB",["https://lh3.googleusercontent.com/pw/def",1920,1080,null,null,null,null,null,null,[1]],1690000100000,"y",0,1690000101000,null,{"76647426":[null]}]"#;

    #[test]
    fn test_parses_photos_and_videos_in_order() {
        let html = album_page(&format!("{},{}", PHOTO, VIDEO));
        let album = parse_album_page(ALBUM_URL, &html).unwrap();
        assert_eq!(album.title.as_deref(), Some("Summer Trip"));
        assert_eq!(album.items.len(), 2);

        let photo = &album.items[0];
        assert_eq!(photo.media_key, "AF1QipAAA");
        assert_eq!(photo.url, "https://lh3.googleusercontent.com/pw/abc=d");
        assert_eq!(photo.filename_hint, "AF1QipAAA.jpg");
        assert!(!photo.is_video);
        assert_eq!(
            photo.captured_at.unwrap().timestamp_millis(),
            1_690_000_000_000
        );

        let video = &album.items[1];
        assert!(video.is_video);
        assert_eq!(video.url, "https://lh3.googleusercontent.com/pw/def=dv");
        assert_eq!(video.filename_hint, "AF1QipBBB.mp4");
    }

    #[test]
    fn test_duplicate_keys_collapsed() {
        let dup = r#"["AF1QipAAA",["https://lh3.googleusercontent.com/pw/abc",4032,3024]]"#;
        let html = album_page(&format!("{},{},{}", PHOTO, VIDEO, dup));
        let album = parse_album_page(ALBUM_URL, &html).unwrap();
        assert_eq!(album.items.len(), 2);
    }

    #[test]
    fn test_reparse_is_stable() {
        let html = album_page(&format!("{},{}", PHOTO, VIDEO));
        let a = parse_album_page(ALBUM_URL, &html).unwrap();
        let b = parse_album_page(ALBUM_URL, &html).unwrap();
        assert_eq!(a.items, b.items);
    }

    #[test]
    fn test_page_without_data_is_format_error() {
        let err = parse_album_page(ALBUM_URL, "<html><title>Sign in</title></html>").unwrap_err();
        assert!(matches!(err, SourceError::Format { .. }));
    }

    #[test]
    fn test_page_without_media_is_empty() {
        let err = parse_album_page(ALBUM_URL, &album_page("")).unwrap_err();
        assert!(matches!(err, SourceError::Empty { .. }));
    }

    #[test]
    fn test_title_falls_back_to_title_tag() {
        let html = r#"<html><head><title>Birthday - Google Photos</title></head><body>AF_initDataCallback</body></html>"#;
        assert_eq!(extract_title(html).as_deref(), Some("Birthday"));
    }

    #[test]
    fn test_missing_capture_time_is_none() {
        let entry = r#"["AF1QipCCC",["https://lh3.googleusercontent.com/pw/ghi",10,10]]"#;
        let album = parse_album_page(ALBUM_URL, &album_page(entry)).unwrap();
        assert!(album.items[0].captured_at.is_none());
    }

    #[test]
    fn test_content_disposition_filename() {
        assert_eq!(
            content_disposition_filename(r#"attachment; filename="IMG_0001.JPG""#).as_deref(),
            Some("IMG_0001.JPG")
        );
        assert_eq!(
            content_disposition_filename("inline;filename*=UTF-8''clip.mp4").as_deref(),
            Some("clip.mp4")
        );
        assert_eq!(content_disposition_filename("inline"), None);
    }
}
