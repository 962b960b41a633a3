//! Content-addressed identities.
//!
//! Documents, segments and artifacts are all keyed by SHA-256 digests of
//! their content, so regenerating identical material always lands on the
//! same key and deduplication needs no mutable bookkeeping.

use sha2::{Digest, Sha256};

use crate::models::ArtifactBody;

const SEGMENT_ID_LEN: usize = 32;

fn hex_digest(hasher: Sha256) -> String {
    format!("{:x}", hasher.finalize())
}

/// Document id for uploaded bytes.
pub fn document_id_from_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"bytes\0");
    hasher.update(bytes);
    hex_digest(hasher)
}

/// Document id for a web page; `url` should already be canonical.
pub fn document_id_from_url(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"url\0");
    hasher.update(url.as_bytes());
    hex_digest(hasher)
}

/// Canonical form of a URL: trimmed, scheme and host lowercased, fragment
/// removed, and a lone trailing slash on the path dropped.
pub fn canonical_url(url: &str) -> String {
    let trimmed = url.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let (scheme, rest) = match without_fragment.split_once("://") {
        Some((s, r)) => (s.to_ascii_lowercase(), r),
        None => return without_fragment.to_string(),
    };
    let (authority, tail) = match rest.find(['/', '?']) {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let tail = if tail == "/" { "" } else { tail };
    format!("{}://{}{}", scheme, authority.to_ascii_lowercase(), tail)
}

pub fn segment_id(document_id: &str, ordinal: u32, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(document_id.as_bytes());
    hasher.update(ordinal.to_le_bytes());
    hasher.update(text.as_bytes());
    let mut id = hex_digest(hasher);
    id.truncate(SEGMENT_ID_LEN);
    id
}

const YOUTUBE_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtube-nocookie.com",
    "www.youtube-nocookie.com",
    "youtu.be",
];

/// Video id of a YouTube URL (`watch?v=`, `youtu.be/`, `/embed/`, `/v/`,
/// `/e/`, `/shorts/`, `/live/`), or `None` for any other URL.
pub fn youtube_video_id(url: &str) -> Option<String> {
    let trimmed = url.trim();
    let rest = trimmed.split_once("://").map(|(_, r)| r).unwrap_or(trimmed);
    let (host, tail) = match rest.find(['/', '?', '#']) {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };
    let host = host.to_ascii_lowercase();
    if !YOUTUBE_HOSTS.contains(&host.as_str()) {
        return None;
    }
    let tail = tail.split('#').next().unwrap_or("");
    let (path, query) = tail.split_once('?').unwrap_or((tail, ""));

    let candidate = if host == "youtu.be" {
        path.trim_start_matches('/').split('/').next()
    } else if path == "/watch" || path == "/watch/" {
        query
            .split('&')
            .find_map(|pair| pair.strip_prefix("v="))
    } else {
        ["/embed/", "/v/", "/e/", "/shorts/", "/live/", "/videos/"]
            .iter()
            .find_map(|prefix| path.strip_prefix(prefix))
            .and_then(|id| id.split('/').next())
    }?;

    let valid = !candidate.is_empty()
        && candidate
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then(|| candidate.to_string())
}

/// The canonical watch URL for a video id.
pub fn youtube_watch_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", video_id)
}

/// Normalize a content field for hashing: collapse whitespace and lowercase.
fn canonical_field(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Identity of an artifact: a pure function of its content and source document.
///
/// Fields are length-prefixed so that moving text between fields changes the
/// hash.
pub fn artifact_id(source_document_id: &str, body: &ArtifactBody) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_document_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(body.artifact_type().as_str().as_bytes());

    let mut field = |value: &str| {
        let canonical = canonical_field(value);
        hasher.update((canonical.len() as u64).to_le_bytes());
        hasher.update(canonical.as_bytes());
    };

    match body {
        ArtifactBody::Flashcard { front, back } => {
            field(front);
            field(back);
        }
        ArtifactBody::QuizItem {
            question,
            choices,
            correct_index,
            ..
        } => {
            field(question);
            for choice in choices {
                field(choice);
            }
            field(&correct_index.to_string());
        }
        ArtifactBody::SummaryBlock { heading, body } => {
            field(heading);
            field(body);
        }
    }

    hex_digest(hasher)
}
