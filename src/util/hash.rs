use md5::{Digest, Md5};
use sha2::Sha256;
use url::{form_urlencoded, Url};

/// Number of normalized characters that make up a content fingerprint.
pub const CONTENT_FINGERPRINT_CHARS: usize = 500;

/// Query parameters that never change the identity of a linked page.
fn is_tracking_param(key: &str) -> bool {
    key.starts_with("utm_") || key == "ref" || key == "source"
}

/// The three digests the deduplicator compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryHashes {
    pub link_hash: String,
    pub title_hash: String,
    pub content_hash: Option<String>,
}

/// Derives all entry hashes at once.
///
/// Returns `None` when the link is not a usable http(s) URL or the title is
/// blank, the two fields an entry cannot be identified without.
pub fn compute_hashes(title: &str, link: &str, body: Option<&str>) -> Option<EntryHashes> {
    Some(EntryHashes {
        link_hash: compute_link_hash(link)?,
        title_hash: compute_title_hash(title)?,
        content_hash: body.and_then(compute_content_hash),
    })
}

/// Canonical form of a link used for hashing.
///
/// Lowercases, drops the fragment, userinfo, default port and tracking
/// parameters (`utm_*`, `ref`, `source`), and removes a single trailing slash
/// from the path. Returns `None` unless the link is an `http://` or
/// `https://` URL with a host.
pub fn normalize_link(link: &str) -> Option<String> {
    let url = Url::parse(&link.trim().to_lowercase()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str().filter(|h| !h.is_empty())?;

    let mut normalized = format!("{}://{host}", url.scheme());
    if let Some(port) = url.port() {
        normalized.push_str(&format!(":{port}"));
    }
    let path = url.path();
    normalized.push_str(path.strip_suffix('/').unwrap_or(path));

    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if !kept.is_empty() {
        let query = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(kept)
            .finish();
        normalized.push('?');
        normalized.push_str(&query);
    }

    Some(normalized)
}

/// MD5 of the normalized link, or `None` for non-http(s) links.
pub fn compute_link_hash(link: &str) -> Option<String> {
    normalize_link(link).map(|normalized| md5_hex(&normalized))
}

/// MD5 of the trimmed, lowercased, whitespace-collapsed title.
pub fn compute_title_hash(title: &str) -> Option<String> {
    let normalized = normalize_text(title);
    (!normalized.is_empty()).then(|| md5_hex(&normalized))
}

/// SHA-256 fingerprint over the first [`CONTENT_FINGERPRINT_CHARS`] characters
/// of the normalized body.
///
/// Edits past the fingerprint window do not change the hash, so a post that
/// only gains a trailing update still matches its earlier copy.
pub fn compute_content_hash(body: &str) -> Option<String> {
    let normalized = normalize_text(body);
    let fingerprint: String = normalized.chars().take(CONTENT_FINGERPRINT_CHARS).collect();
    let fingerprint = fingerprint.trim_end();

    if fingerprint.is_empty() {
        return None;
    }

    Some(format!("{:x}", Sha256::digest(fingerprint.as_bytes())))
}

fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn md5_hex(s: &str) -> String {
    format!("{:x}", Md5::digest(s.as_bytes()))
}
