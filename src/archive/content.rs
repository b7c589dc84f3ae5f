//! Site content extracted from a capture artifact
//!
//! `SiteContent` is the comparable view of one snapshot: visible text, DOM
//! skeleton, identified sections, and layout counts for every captured HTML
//! page, plus the digests of referenced resources.

use crate::archive::warc::{read_captures, CapturedResponse};
use crate::crawler::extract_resources;
use crate::storage::Fingerprints;
use crate::StrataError;
use scraper::{ElementRef, Html, Node};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use url::Url;

/// Elements that count as sections when they carry an id or class
const SECTION_TAGS: &[&str] = &[
    "section", "div", "article", "main", "aside", "header", "nav", "footer",
];

/// Landmark elements counted in the layout signature
const LAYOUT_TAGS: [&str; 5] = ["header", "nav", "main", "aside", "footer"];

/// Elements whose text is never visible
const HIDDEN_TEXT_TAGS: &[&str] = &["script", "style", "noscript", "template"];

/// Extracted content of one HTML page
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageContent {
    /// Visible text, one whitespace-collapsed line per text node
    pub text_lines: Vec<String>,
    /// `tag:id:class` for every element in document order
    pub skeleton: Vec<String>,
    /// `tag#id.class` signatures of top-level sections
    pub sections: BTreeSet<String>,
    /// Counts of header, nav, main, aside, and footer elements
    pub layout: [u32; 5],
}

impl PageContent {
    /// Parses an HTML document
    pub fn parse(html: &str) -> Self {
        Self::from_document(&Html::parse_document(html))
    }

    pub fn from_document(document: &Html) -> Self {
        let mut page = PageContent::default();

        for node in document.tree.root().descendants() {
            match node.value() {
                Node::Text(text) => {
                    let hidden = node.ancestors().any(|a| {
                        a.value()
                            .as_element()
                            .map_or(false, |e| HIDDEN_TEXT_TAGS.contains(&e.name()))
                    });
                    if hidden {
                        continue;
                    }
                    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
                    if !line.is_empty() {
                        page.text_lines.push(line);
                    }
                }
                Node::Element(element) => {
                    let name = element.name();
                    let id = element.id().unwrap_or("");
                    let class = element.classes().collect::<Vec<_>>().join(" ");
                    page.skeleton.push(format!("{}:{}:{}", name, id, class));

                    if let Some(i) = LAYOUT_TAGS.iter().position(|t| *t == name) {
                        page.layout[i] += 1;
                    }

                    if let Some(el) = ElementRef::wrap(node) {
                        let nested = el
                            .ancestors()
                            .filter_map(ElementRef::wrap)
                            .any(|a| is_section(&a));
                        if is_section(&el) && !nested {
                            page.sections.insert(section_signature(&el));
                        }
                    }
                }
                _ => {}
            }
        }

        page
    }

    /// Layout signature, e.g. `header:1|nav:1|main:1|aside:0|footer:1`
    pub fn layout_signature(&self) -> String {
        LAYOUT_TAGS
            .iter()
            .zip(self.layout.iter())
            .map(|(tag, count)| format!("{}:{}", tag, count))
            .collect::<Vec<_>>()
            .join("|")
    }
}

fn is_section(el: &ElementRef) -> bool {
    let value = el.value();
    SECTION_TAGS.contains(&value.name())
        && (value.id().map_or(false, |id| !id.is_empty()) || value.classes().next().is_some())
}

fn section_signature(el: &ElementRef) -> String {
    let value = el.value();
    let mut signature = value.name().to_string();
    if let Some(id) = value.id().filter(|id| !id.is_empty()) {
        signature.push('#');
        signature.push_str(id);
    }
    for class in value.classes() {
        signature.push('.');
        signature.push_str(class);
    }
    signature
}

/// Comparable content of a whole snapshot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SiteContent {
    /// Successfully captured HTML pages keyed by URL
    pub pages: BTreeMap<String, PageContent>,
    /// Resource URLs with the SHA-256 of their captured body, if captured
    pub resources: BTreeMap<String, Option<String>>,
}

impl SiteContent {
    /// Builds site content from captured responses
    ///
    /// Only successful responses contribute. HTML pages are parsed; every
    /// other response is a captured resource. Resources referenced by pages
    /// but not captured are kept with no digest.
    pub fn from_captures(captures: &[CapturedResponse]) -> Self {
        let mut content = SiteContent::default();

        for capture in captures.iter().filter(|c| c.is_success()) {
            if capture.is_html() {
                let document = Html::parse_document(&String::from_utf8_lossy(&capture.body));
                if let Ok(base) = Url::parse(&capture.url) {
                    for reference in extract_resources(&document, &base) {
                        content.resources.entry(reference).or_insert(None);
                    }
                }
                content
                    .pages
                    .insert(capture.url.clone(), PageContent::from_document(&document));
            }
        }

        for capture in captures.iter().filter(|c| c.is_success() && !c.is_html()) {
            content
                .resources
                .insert(capture.url.clone(), Some(sha256_hex(&capture.body)));
        }

        content
    }

    /// Reads and extracts the content of a capture file
    pub fn load(artifact_path: &Path) -> Result<Self, StrataError> {
        Ok(Self::from_captures(&read_captures(artifact_path)?))
    }

    /// Visible text of all pages in URL order, one line per text node
    pub fn text(&self) -> String {
        self.pages
            .values()
            .flat_map(|p| p.text_lines.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Section keys across all pages, prefixed with the page URL
    pub fn sections(&self) -> BTreeSet<String> {
        self.pages
            .iter()
            .flat_map(|(url, page)| page.sections.iter().map(move |s| format!("{} {}", url, s)))
            .collect()
    }

    /// Layout signatures of all pages, joined in URL order
    pub fn layout_signature(&self) -> String {
        self.pages
            .values()
            .map(PageContent::layout_signature)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Number of resources whose body was captured
    pub fn captured_resource_count(&self) -> usize {
        self.resources.values().filter(|d| d.is_some()).count()
    }

    /// Computes the snapshot fingerprints
    ///
    /// * content: SHA-256 of the page text in URL order
    /// * structure: SHA-256 of the skeleton tokens joined by `|`
    /// * resources: SHA-256 of the sorted resource URLs joined by `\n`
    /// * full site: SHA-256 of `content|structure|resources`
    pub fn fingerprints(&self) -> Fingerprints {
        let content_hash = sha256_hex(self.text().as_bytes());

        let skeleton = self
            .pages
            .values()
            .flat_map(|p| p.skeleton.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join("|");
        let structure_hash = sha256_hex(skeleton.as_bytes());

        let resource_urls = self
            .resources
            .keys()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        let resources_hash = sha256_hex(resource_urls.as_bytes());

        let full_site_hash = sha256_hex(
            format!("{}|{}|{}", content_hash, structure_hash, resources_hash).as_bytes(),
        );

        Fingerprints {
            content_hash,
            structure_hash,
            resources_hash,
            full_site_hash,
        }
    }

    /// Returns true if both captures hold the same content
    ///
    /// Equal fingerprints and equal per-resource digests.
    pub fn is_identical_to(&self, other: &SiteContent) -> bool {
        self.resources == other.resources && self.fingerprints() == other.fingerprints()
    }
}

/// Lowercase hex SHA-256 of a byte slice
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
