//! Turning user input (a file upload or a URL) into a document and payload.

use study_harness_core::error::ExtractionError;
use study_harness_core::models::{SourceDocument, SourceKind, SourcePayload};

/// Register an upload. `kind` overrides detection from name and magic bytes.
pub fn from_upload(
    name: &str,
    bytes: Vec<u8>,
    kind: Option<SourceKind>,
) -> Result<(SourceDocument, SourcePayload), ExtractionError> {
    let kind = match kind.or_else(|| SourceKind::detect(name, &bytes)) {
        Some(kind) => kind,
        None => {
            return Err(ExtractionError::UnsupportedFormat(format!(
                "cannot tell what kind of source '{}' is; pass a kind explicitly",
                name
            )))
        }
    };
    if kind == SourceKind::YouTube {
        return Err(ExtractionError::UnsupportedFormat(
            "videos are read from their YouTube URL, not uploaded".to_string(),
        ));
    }
    let document = SourceDocument::from_bytes(kind, name, &bytes);
    Ok((document, SourcePayload::bytes(bytes)))
}

/// Register a web page or YouTube video by URL.
pub fn from_url(url: &str) -> Result<(SourceDocument, SourcePayload), ExtractionError> {
    let lower = url.to_ascii_lowercase();
    if !(lower.starts_with("http://") || lower.starts_with("https://")) {
        return Err(ExtractionError::UnsupportedFormat(format!(
            "only http(s) URLs can be fetched, got '{}'",
            url
        )));
    }
    let document = SourceDocument::from_url(url);
    let payload = SourcePayload::Url(document.payload_ref.clone());
    Ok((document, payload))
}

/// Whether a CLI argument names a URL rather than a file.
pub fn looks_like_url(arg: &str) -> bool {
    let lower = arg.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
