use serde::{Deserialize, Serialize};

/// A contiguous page range of a source document, 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub start: u32,
    pub end: u32,
    pub label: String,
}

impl Chunk {
    pub fn new(start: u32, end: u32, total_pages: u32) -> Self {
        let label = if start == 1 && end == total_pages {
            "full".to_string()
        } else {
            format!("pages_{}-{}", start, end)
        };

        Self { start, end, label }
    }

    pub fn page_count(&self) -> u32 {
        self.end - self.start + 1
    }

    pub fn pages(&self) -> impl Iterator<Item = u32> {
        self.start..=self.end
    }

    pub fn contains(&self, page: u32) -> bool {
        self.start <= page && page <= self.end
    }
}

/// The pages sent along with a single extraction request.
///
/// Unlike a [`Chunk`], a scope may be non-contiguous: triage narrows later
/// stages down to the positions it flagged as relevant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionScope {
    pub pages: Vec<u32>,
    pub label: String,
}

impl ExtractionScope {
    pub fn new(pages: Vec<u32>, label: impl Into<String>) -> Self {
        Self {
            pages,
            label: label.into(),
        }
    }

    pub fn page_count(&self) -> u32 {
        self.pages.len() as u32
    }

    pub fn is_contiguous(&self) -> bool {
        self.pages.windows(2).all(|w| w[1] == w[0] + 1)
    }
}

impl From<&Chunk> for ExtractionScope {
    fn from(chunk: &Chunk) -> Self {
        Self {
            pages: chunk.pages().collect(),
            label: chunk.label.clone(),
        }
    }
}
