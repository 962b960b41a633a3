//! Web page extraction.
//!
//! The page is fetched through an [`HtmlFetcher`] and parsed with `scraper`.
//! Chrome (scripts, styles, navigation, headers, footers, asides, forms) is
//! skipped; every remaining block element becomes one segment, located by a
//! CSS-like path. Text sitting directly inside a container (`div`, `section`,
//! ...) becomes a segment located at the container. Each heading opens a new
//! section, and the normalizer never merges text across sections.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html};
use tracing::debug;

use study_harness_core::error::ExtractionError;
use study_harness_core::models::{Locator, Provenance, TextSegment};
use study_harness_core::services::{FetchedPage, HtmlFetcher};

use crate::config::ExtractionConfig;
use crate::extract::split_paragraphs;

const SKIPPED: &[&str] = &[
    "head", "script", "style", "nav", "header", "footer", "aside", "noscript", "form", "template",
    "svg",
];
const BLOCKS: &[&str] = &[
    "h1", "h2", "h3", "h4", "h5", "h6", "p", "li", "blockquote", "pre", "td",
];
const INLINE: &[&str] = &[
    "a", "abbr", "b", "cite", "code", "em", "i", "kbd", "mark", "q", "s", "small", "span",
    "strong", "sub", "sup", "time", "u", "var",
];

pub struct WebPageExtractor {
    fetcher: Arc<dyn HtmlFetcher>,
    timeout: Duration,
}

impl WebPageExtractor {
    pub fn new(fetcher: Arc<dyn HtmlFetcher>, timeout: Duration) -> Self {
        Self { fetcher, timeout }
    }

    pub async fn extract(&self, document_id: &str, url: &str) -> Result<Vec<TextSegment>, ExtractionError> {
        let page = self.fetcher.get(url, self.timeout).await?;
        let content_type = page
            .content_type
            .as_deref()
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim().to_ascii_lowercase());
        match content_type.as_deref() {
            None | Some("text/html") | Some("application/xhtml+xml") => {}
            Some("text/plain") => {
                return Ok(split_paragraphs(document_id, &String::from_utf8_lossy(&page.body)));
            }
            Some(other) => {
                return Err(ExtractionError::UnsupportedFormat(format!(
                    "{} served as {}",
                    url, other
                )))
            }
        }
        let html = String::from_utf8_lossy(&page.body);
        Ok(Self::extract_html(document_id, &page.final_url, &html))
    }

    /// Segment an HTML document. Pure; `scraper`'s DOM is not `Send`, so
    /// parsing stays out of any `.await`.
    pub fn extract_html(document_id: &str, url: &str, html: &str) -> Vec<TextSegment> {
        let document = Html::parse_document(html);
        let mut walker = BlockWalker::default();
        let root = document.root_element();
        walker.path.push(root.value().name().to_string());
        walker.walk(root);
        debug!(document_id, blocks = walker.blocks.len(), "parsed web page");

        walker
            .blocks
            .into_iter()
            .enumerate()
            .map(|(ordinal, block)| {
                let locator = Locator::Web {
                    url: url.to_string(),
                    section: block.section,
                    path: block.path,
                    blocks: 1,
                };
                TextSegment::new(document_id, ordinal as u32, Provenance::new(locator), block.text)
            })
            .collect()
    }
}

struct Block {
    path: String,
    section: u32,
    text: String,
}

#[derive(Default)]
struct BlockWalker {
    path: Vec<String>,
    section: u32,
    blocks: Vec<Block>,
}

impl BlockWalker {
    fn walk(&mut self, element: ElementRef<'_>) {
        // Loose text and inline elements between blocks.
        let mut run = String::new();
        for node in element.children() {
            if let Some(text) = node.value().as_text() {
                run.push_str(text);
                continue;
            }
            let Some(child) = ElementRef::wrap(node) else {
                continue;
            };
            let name = child.value().name();
            if SKIPPED.contains(&name) {
                continue;
            }
            if name == "br" {
                run.push(' ');
                continue;
            }
            if INLINE.contains(&name) {
                run.extend(child.text());
                continue;
            }
            self.flush(&mut run);
            self.path.push(path_step(child));
            if BLOCKS.contains(&name) {
                if name.len() == 2 && name.starts_with('h') {
                    self.section += 1;
                }
                let text = collapse(&child.text().collect::<String>());
                if !text.is_empty() {
                    self.blocks.push(Block {
                        path: self.path.join(" > "),
                        section: self.section,
                        text,
                    });
                }
            } else {
                self.walk(child);
            }
            self.path.pop();
        }
        self.flush(&mut run);
    }

    fn flush(&mut self, run: &mut String) {
        let text = collapse(run);
        run.clear();
        if !text.is_empty() {
            self.blocks.push(Block {
                path: self.path.join(" > "),
                section: self.section,
                text,
            });
        }
    }
}

/// `tag`, or `tag:nth-of-type(n)` when siblings share the tag.
fn path_step(element: ElementRef<'_>) -> String {
    let name = element.value().name();
    let same = |node| ElementRef::wrap(node).is_some_and(|e: ElementRef<'_>| e.value().name() == name);
    let before = element.prev_siblings().filter(|n| same(*n)).count();
    let after = element.next_siblings().filter(|n| same(*n)).count();
    if before + after == 0 {
        name.to_string()
    } else {
        format!("{}:nth-of-type({})", name, before + 1)
    }
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// [`HtmlFetcher`] over `reqwest` with redirect and size limits.
pub struct ReqwestFetcher {
    client: reqwest::Client,
    max_bytes: usize,
}

impl ReqwestFetcher {
    pub fn new(config: &ExtractionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            max_bytes: config.max_page_bytes,
        })
    }
}

#[async_trait]
impl HtmlFetcher for ReqwestFetcher {
    async fn get(&self, url: &str, timeout: Duration) -> Result<FetchedPage, ExtractionError> {
        let mut response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_redirect() {
                    ExtractionError::CorruptSource(format!("too many redirects fetching {}", url))
                } else if e.is_builder() {
                    ExtractionError::UnsupportedFormat(format!("invalid URL {}: {}", url, e))
                } else {
                    ExtractionError::ExternalServiceUnavailable(format!("fetching {}: {}", url, e))
                }
            })?;

        let status = response.status();
        if status.is_server_error() || status.as_u16() == 429 {
            return Err(ExtractionError::ExternalServiceUnavailable(format!(
                "HTTP {} fetching {}",
                status, url
            )));
        }
        if !status.is_success() {
            return Err(ExtractionError::CorruptSource(format!(
                "HTTP {} fetching {}",
                status, url
            )));
        }
        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(ExtractionError::TooLarge {
                    size: len as usize,
                    limit: self.max_bytes,
                });
            }
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| {
            ExtractionError::ExternalServiceUnavailable(format!("reading {}: {}", url, e))
        })? {
            if body.len() + chunk.len() > self.max_bytes {
                return Err(ExtractionError::TooLarge {
                    size: body.len() + chunk.len(),
                    limit: self.max_bytes,
                });
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedPage {
            final_url,
            content_type,
            body,
        })
    }
}
