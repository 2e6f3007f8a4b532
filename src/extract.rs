//! Record extraction: derive title, snippet, language, content hash and
//! URL group from one HTML response.
//!
//! Extraction never fails outward. When the payload cannot be treated as
//! HTML the text-derived fields come back empty; the hash and URL group are
//! always computed, so the capture's URL, time and provenance are still
//! persisted.

use scraper::{ElementRef, Html, Selector};
use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

use crate::models::ArchiveRecord;

const MAX_TITLE_CHARS: usize = 512;

/// Query parameters that vary between captures of the same page.
const VOLATILE_PARAMS: &[&str] = &[
    "fbclid",
    "gclid",
    "msclkid",
    "dclid",
    "mc_cid",
    "mc_eid",
    "_ga",
    "_gl",
    "sessionid",
    "session_id",
    "jsessionid",
    "phpsessid",
    "sid",
    "cachebust",
    "_",
];

/// Fields derived from one response record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extraction {
    pub text: String,
    pub title: String,
    pub snippet: String,
    pub language: String,
    pub content_hash: String,
    pub normalized_url_group: String,
}

#[derive(Debug, thiserror::Error)]
enum ExtractError {
    #[error("payload looks binary")]
    Binary,
    #[error("payload is empty")]
    Empty,
}

pub fn extract(record: &ArchiveRecord, snippet_chars: usize) -> Extraction {
    let content_hash = content_hash(&record.body);
    let normalized_url_group = normalize_url_group(&record.target_uri);

    match extract_html(record, snippet_chars) {
        Ok(derived) => Extraction {
            content_hash,
            normalized_url_group,
            ..derived
        },
        Err(e) => {
            debug!(record_id = %record.record_id, url = %record.target_uri, error = %e, "no text extracted");
            Extraction {
                content_hash,
                normalized_url_group,
                ..Default::default()
            }
        }
    }
}

fn extract_html(record: &ArchiveRecord, snippet_chars: usize) -> Result<Extraction, ExtractError> {
    if record.body.is_empty() {
        return Err(ExtractError::Empty);
    }
    let sample = &record.body[..record.body.len().min(1024)];
    if sample.iter().filter(|&&b| b == 0).count() > 8 {
        return Err(ExtractError::Binary);
    }

    let source = decode_body(&record.body, record.header("content-type"));
    let document = Html::parse_document(&source);

    let text = visible_text(&document);
    let title = extract_title(&document)
        .map(|t| truncate_chars(&t, MAX_TITLE_CHARS))
        .unwrap_or_default();
    let description = meta_content(&document, "name", "description")
        .or_else(|| meta_content(&document, "property", "og:description"));
    let snippet = make_snippet(description.as_deref().unwrap_or(&text), snippet_chars);
    let language = declared_language(&document)
        .or_else(|| record.header("content-language").and_then(primary_subtag))
        .or_else(|| guess_language(&text))
        .unwrap_or_default();

    Ok(Extraction {
        text,
        title,
        snippet,
        language,
        ..Default::default()
    })
}

/// SHA-256 of the delivered body bytes, hex encoded.
pub fn content_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

/// Canonical key for "the same page at different times".
///
/// Drops the fragment, volatile query parameters and `;jsessionid=` path
/// parameters, sorts what is left of the query, lowercases the path, and
/// strips a trailing slash. Unparseable input falls back to trimmed,
/// lowercased text.
pub fn normalize_url_group(raw: &str) -> String {
    let raw = raw.trim();
    let Ok(mut url) = Url::parse(raw) else {
        return raw.to_ascii_lowercase();
    };

    url.set_fragment(None);

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_volatile(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(pairs.iter());
    }

    let mut path = url.path().to_lowercase();
    if let Some(pos) = path.find(";jsessionid=") {
        path.truncate(pos);
    }
    while path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    url.set_path(&path);

    url.to_string()
}

fn is_volatile(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || VOLATILE_PARAMS.contains(&key.as_str())
}

fn decode_body(body: &[u8], content_type: Option<&str>) -> String {
    let charset = content_type
        .and_then(|ct| {
            ct.split(';')
                .filter_map(|p| p.trim().split_once('='))
                .find(|(k, _)| k.trim().eq_ignore_ascii_case("charset"))
                .map(|(_, v)| v.trim().trim_matches('"').to_ascii_lowercase())
        })
        .unwrap_or_default();

    match charset.as_str() {
        // Single-byte Western encodings map byte-for-byte onto U+0000..U+00FF
        "iso-8859-1" | "latin1" | "latin-1" | "windows-1252" | "cp1252" => {
            body.iter().map(|&b| b as char).collect()
        }
        _ => String::from_utf8_lossy(body).into_owned(),
    }
}

fn selector(css: &str) -> Option<Selector> {
    Selector::parse(css).ok()
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().collect::<Vec<_>>().join(" "))
}

fn extract_title(document: &Html) -> Option<String> {
    for css in ["title", "h1"] {
        if let Some(sel) = selector(css) {
            if let Some(text) = document
                .select(&sel)
                .map(element_text)
                .find(|t| !t.is_empty())
            {
                return Some(text);
            }
        }
    }
    meta_content(document, "property", "og:title")
}

fn meta_content(document: &Html, attr: &str, value: &str) -> Option<String> {
    let sel = selector(&format!("meta[{}='{}']", attr, value))?;
    document
        .select(&sel)
        .filter_map(|el| el.value().attr("content"))
        .map(collapse_whitespace)
        .find(|s| !s.is_empty())
}

fn visible_text(document: &Html) -> String {
    let root = selector("body")
        .and_then(|sel| document.select(&sel).next())
        .unwrap_or_else(|| document.root_element());

    let mut parts: Vec<&str> = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|a| {
            a.value().as_element().is_some_and(|e| {
                matches!(e.name(), "script" | "style" | "noscript" | "template")
            })
        });
        let trimmed = text.trim();
        if !hidden && !trimmed.is_empty() {
            parts.push(trimmed);
        }
    }
    collapse_whitespace(&parts.join(" "))
}

fn declared_language(document: &Html) -> Option<String> {
    selector("html")
        .and_then(|sel| document.select(&sel).next())
        .and_then(|el| el.value().attr("lang").or_else(|| el.value().attr("xml:lang")))
        .and_then(primary_subtag)
        .or_else(|| {
            meta_content(document, "http-equiv", "content-language")
                .as_deref()
                .and_then(primary_subtag)
        })
}

/// `"en-CA"` → `"en"`; first entry of a list wins.
fn primary_subtag(tag: &str) -> Option<String> {
    let first = tag.split(',').next()?.trim();
    let primary = first.split(['-', '_']).next()?.trim().to_ascii_lowercase();
    if primary.len() >= 2 && primary.len() <= 3 && primary.chars().all(|c| c.is_ascii_alphabetic())
    {
        Some(primary)
    } else {
        None
    }
}

const STOPWORDS: &[(&str, &[&str])] = &[
    ("en", &["the", "and", "of", "to", "is", "in", "for", "with", "that", "on"]),
    ("fr", &["le", "la", "les", "et", "des", "du", "est", "pour", "dans", "une"]),
    ("es", &["el", "los", "las", "y", "del", "es", "para", "con", "una", "por"]),
    ("de", &["der", "die", "das", "und", "ist", "nicht", "mit", "für", "ein", "auf"]),
];

/// Stopword vote over the first few hundred words. Needs a clear winner.
fn guess_language(text: &str) -> Option<String> {
    let words: Vec<String> = text
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
        .take(500)
        .map(|w| w.to_lowercase())
        .collect();
    if words.len() < 5 {
        return None;
    }

    let mut scores: Vec<(&str, usize)> = STOPWORDS
        .iter()
        .map(|(lang, stops)| {
            let hits = words.iter().filter(|w| stops.contains(&w.as_str())).count();
            (*lang, hits)
        })
        .collect();
    scores.sort_by(|a, b| b.1.cmp(&a.1));

    let (best, best_hits) = scores[0];
    let runner_up = scores.get(1).map(|s| s.1).unwrap_or(0);
    if best_hits >= 2 && best_hits > runner_up {
        Some(best.to_string())
    } else {
        None
    }
}

fn make_snippet(text: &str, max_chars: usize) -> String {
    let text = collapse_whitespace(text);
    if text.chars().count() <= max_chars {
        return text;
    }
    let budget = max_chars.saturating_sub(1);
    let cut = truncate_chars(&text, budget);
    let cut = match cut.rfind(' ') {
        Some(pos) if pos > budget / 2 => cut[..pos].to_string(),
        _ => cut,
    };
    format!("{}…", cut.trim_end())
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
