//! Regex metadata extraction on raw markup.
//!
//! Used whenever the parse context cannot be reached. It only looks at `<title>` and
//! `<meta>` tags and makes no attempt to understand document structure.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::crawler::task::PageMeta;
use crate::parse::worker::{collapse_whitespace, resolve_url};

static TITLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<title\b[^>]*>(.*?)</title\s*>").expect("valid title pattern"));

static META_TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<meta\b[^>]*>").expect("valid meta pattern"));

static ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)([a-z_:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>/]+))"#)
        .expect("valid attribute pattern")
});

/// Extract page metadata from raw, possibly truncated, markup
pub fn extract_metadata(html: &str, page_url: &str) -> PageMeta {
    let mut meta = PageMeta {
        title: TITLE_RE
            .captures(html)
            .and_then(|caps| caps.get(1))
            .map(|m| clean(m.as_str()))
            .filter(|title| !title.is_empty()),
        ..PageMeta::default()
    };

    for tag in META_TAG_RE.find_iter(html) {
        let mut key = None;
        let mut content = None;

        for caps in ATTR_RE.captures_iter(tag.as_str()) {
            let name = caps[1].to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map_or("", |m| m.as_str());

            match name.as_str() {
                "property" => key = Some(value.to_ascii_lowercase()),
                "name" if key.is_none() => key = Some(value.to_ascii_lowercase()),
                "content" => content = Some(clean(value)),
                _ => {}
            }
        }

        let (Some(key), Some(content)) = (key, content) else {
            continue;
        };
        if content.is_empty() {
            continue;
        }

        let field = match key.trim() {
            "description" => &mut meta.description,
            "og:title" => &mut meta.og_title,
            "og:description" => &mut meta.og_description,
            "og:image" => &mut meta.og_image,
            "og:site_name" => &mut meta.og_site_name,
            _ => continue,
        };
        if field.is_none() {
            *field = Some(content);
        }
    }

    if let Some(image) = meta.og_image.take() {
        meta.og_image = Some(resolve_url(page_url, &image));
    }
    meta
}

fn clean(raw: &str) -> String {
    collapse_whitespace(&html_escape::decode_html_entities(raw))
}
