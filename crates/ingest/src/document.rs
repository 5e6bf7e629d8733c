use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use std::collections::BTreeSet;

use crate::reader::DocumentEntry;

pub const PDF_MEDIA_TYPE: &str = "application/pdf";
pub const TEXT_MEDIA_TYPE: &str = "text/plain";

/// Opaque page content ready to be attached to a model request.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentBlob {
    pub media_type: &'static str,
    pub data: Vec<u8>,
    pub page_count: u32,
}

enum Backend {
    Pdf(lopdf::Document),
    Text(Vec<String>),
}

/// A loaded document. Immutable once created; dropped when its study finishes.
pub struct SourceDocument {
    name: String,
    size_bytes: u64,
    total_pages: u32,
    backend: Backend,
}

impl SourceDocument {
    pub fn from_pdf_bytes(name: impl Into<String>, bytes: &[u8]) -> Result<Self> {
        let name = name.into();
        let document = lopdf::Document::load_mem(bytes)
            .map_err(|e| anyhow!("failed to parse PDF {}: {}", name, e))?;
        let total_pages = document.get_pages().len() as u32;

        Ok(Self {
            name,
            size_bytes: bytes.len() as u64,
            total_pages,
            backend: Backend::Pdf(document),
        })
    }

    /// Plain text split into pages on form-feed characters.
    pub fn from_text(name: impl Into<String>, text: &str) -> Self {
        let pages = text.split('\u{c}').map(str::to_string).collect();
        let mut document = Self::from_text_pages(name, pages);
        document.size_bytes = text.len() as u64;
        document
    }

    pub fn from_text_pages(name: impl Into<String>, pages: Vec<String>) -> Self {
        let size_bytes = pages.iter().map(|p| p.len() as u64).sum();
        Self {
            name: name.into(),
            size_bytes,
            total_pages: pages.len() as u32,
            backend: Backend::Text(pages),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn page_count(&self) -> u32 {
        self.total_pages
    }

    pub fn extract_page_range(&self, start: u32, end: u32) -> Result<DocumentBlob> {
        if start == 0 || start > end {
            bail!("invalid page range {}-{} for {}", start, end, self.name);
        }
        let pages: Vec<u32> = (start..=end).collect();
        self.extract_pages(&pages)
    }

    /// Plain text of every page in order. PDFs go through lopdf's text extraction.
    pub fn text(&self) -> Result<String> {
        match &self.backend {
            Backend::Pdf(document) => {
                let pages: Vec<u32> = (1..=self.total_pages).collect();
                document
                    .extract_text(&pages)
                    .map_err(|e| anyhow!("failed to extract text from {}: {}", self.name, e))
            }
            Backend::Text(pages) => Ok(pages.join("\n")),
        }
    }

    /// Extract an arbitrary, possibly non-contiguous, set of 1-based pages.
    pub fn extract_pages(&self, pages: &[u32]) -> Result<DocumentBlob> {
        let selected: BTreeSet<u32> = pages.iter().copied().collect();

        if selected.is_empty() {
            bail!("no pages selected from {}", self.name);
        }
        if let Some(bad) = selected.iter().find(|p| **p == 0 || **p > self.total_pages) {
            bail!("page {} out of range 1-{} for {}", bad, self.total_pages, self.name);
        }

        match &self.backend {
            Backend::Pdf(document) => {
                let data = pdf_subset(document, &selected)?;
                Ok(DocumentBlob {
                    media_type: PDF_MEDIA_TYPE,
                    data,
                    page_count: selected.len() as u32,
                })
            }
            Backend::Text(text_pages) => {
                let mut text = String::new();
                for page in &selected {
                    text.push_str(&format!("[page {}]\n", page));
                    text.push_str(&text_pages[(*page - 1) as usize]);
                    text.push_str("\n\n");
                }
                Ok(DocumentBlob {
                    media_type: TEXT_MEDIA_TYPE,
                    data: text.into_bytes(),
                    page_count: selected.len() as u32,
                })
            }
        }
    }
}

fn pdf_subset(document: &lopdf::Document, keep: &BTreeSet<u32>) -> Result<Vec<u8>> {
    let mut subset = document.clone();
    let to_delete: Vec<u32> = subset
        .get_pages()
        .keys()
        .copied()
        .filter(|page| !keep.contains(page))
        .collect();

    if !to_delete.is_empty() {
        subset.delete_pages(&to_delete);
        subset.prune_objects();
    }

    let mut buffer = Vec::new();
    subset
        .save_to(&mut buffer)
        .map_err(|e| anyhow!("failed to write page subset: {}", e))?;
    Ok(buffer)
}

/// Opens the documents enumerated for a run.
#[async_trait]
pub trait DocumentLoader: Send + Sync {
    async fn load(&self, entry: &DocumentEntry) -> Result<SourceDocument>;
}
