use serde::{Deserialize, Serialize};

use crate::chunk::{Chunk, ExtractionScope};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkerConfig {
    /// Average tokens a single page costs when sent to the model.
    pub tokens_per_page: u32,
    /// Multiplier for prompt and response overhead on top of page content.
    pub overhead_factor: f64,
    /// Ceiling for the estimated input of one request.
    pub max_tokens_per_request: u32,
    pub min_chunk_pages: u32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            tokens_per_page: 3000,
            overhead_factor: 1.5,
            max_tokens_per_request: 30_000,
            min_chunk_pages: 5,
        }
    }
}

pub struct DocumentChunker {
    config: ChunkerConfig,
}

impl DocumentChunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Uncapped token estimate for sending `pages` pages, overhead included.
    pub fn estimated_tokens(&self, pages: u32) -> u64 {
        (pages as f64 * self.config.tokens_per_page as f64 * self.config.overhead_factor) as u64
    }

    pub fn pages_per_chunk(&self) -> u32 {
        if self.config.tokens_per_page == 0 {
            return u32::MAX;
        }
        let by_budget = self.config.max_tokens_per_request / self.config.tokens_per_page;
        by_budget.max(self.config.min_chunk_pages).max(1)
    }

    /// Split `[1, total_pages]` into consecutive ranges that each fit the
    /// per-request ceiling. A document that fits whole yields one chunk.
    pub fn chunk(&self, total_pages: u32) -> Vec<Chunk> {
        if total_pages == 0 {
            return Vec::new();
        }

        if self.estimated_tokens(total_pages) <= self.config.max_tokens_per_request as u64 {
            return vec![Chunk::new(1, total_pages, total_pages)];
        }

        let size = self.pages_per_chunk();
        let mut chunks = Vec::new();
        let mut start = 1u32;

        while start <= total_pages {
            let end = start.saturating_add(size - 1).min(total_pages);
            chunks.push(Chunk::new(start, end, total_pages));
            if end == total_pages {
                break;
            }
            start = end + 1;
        }

        tracing::debug!(total_pages, chunks = chunks.len(), pages_per_chunk = size, "Document split into chunks");
        chunks
    }

    /// Group an arbitrary page set into request-sized scopes, keeping page order.
    pub fn batch_pages(&self, pages: &[u32]) -> Vec<ExtractionScope> {
        let mut sorted: Vec<u32> = pages.iter().copied().filter(|p| *p > 0).collect();
        sorted.sort_unstable();
        sorted.dedup();

        if sorted.is_empty() {
            return Vec::new();
        }

        let fits_whole =
            self.estimated_tokens(sorted.len() as u32) <= self.config.max_tokens_per_request as u64;
        let size = if fits_whole {
            sorted.len()
        } else {
            self.pages_per_chunk() as usize
        };

        sorted
            .chunks(size)
            .map(|group| {
                let label = format!("positions_{}-{}", group[0], group[group.len() - 1]);
                ExtractionScope::new(group.to_vec(), label)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(tokens_per_page: u32, ceiling: u32) -> DocumentChunker {
        DocumentChunker::new(ChunkerConfig {
            tokens_per_page,
            overhead_factor: 1.5,
            max_tokens_per_request: ceiling,
            min_chunk_pages: 5,
        })
    }

    fn assert_exact_cover(chunks: &[Chunk], total_pages: u32) {
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].start, 1);
        assert_eq!(chunks[chunks.len() - 1].end, total_pages);
        for chunk in chunks {
            assert!(1 <= chunk.start && chunk.start <= chunk.end && chunk.end <= total_pages);
        }
        for pair in chunks.windows(2) {
            assert_eq!(pair[1].start, pair[0].end + 1, "chunks must be contiguous");
        }
    }

    #[test]
    fn test_small_document_is_single_chunk() {
        let chunks = chunker(3000, 30_000).chunk(5);

        assert_eq!(chunks, vec![Chunk::new(1, 5, 5)]);
        assert_eq!(chunks[0].label, "full");
    }

    #[test]
    fn test_large_document_is_split() {
        // 90k ceiling at 3000 tokens/page is a 30-page budget
        let chunks = chunker(3000, 90_000).chunk(200);

        assert_exact_cover(&chunks, 200);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.page_count() >= 5));
        assert_eq!(chunks[0].page_count(), 30);

        let union: Vec<u32> = chunks.iter().flat_map(|c| c.pages()).collect();
        assert_eq!(union, (1..=200).collect::<Vec<_>>());
    }

    #[test]
    fn test_min_chunk_size_applies() {
        // budget allows only one page per request, floor is five
        let chunks = chunker(3000, 3000).chunk(12);

        assert_exact_cover(&chunks, 12);
        assert_eq!(
            chunks.iter().map(|c| c.page_count()).collect::<Vec<_>>(),
            vec![5, 5, 2]
        );
    }

    #[test]
    fn test_chunk_coverage_over_parameter_grid() {
        for total_pages in 1..=60 {
            for per_page in [0, 500, 3000, 7000] {
                for ceiling in [1000, 9000, 30_000, 90_000] {
                    let chunks = chunker(per_page, ceiling).chunk(total_pages);
                    assert_exact_cover(&chunks, total_pages);
                }
            }
        }
    }

    #[test]
    fn test_empty_document_has_no_chunks() {
        assert!(chunker(3000, 30_000).chunk(0).is_empty());
    }

    #[test]
    fn test_batch_pages_sorts_and_splits() {
        let scopes = chunker(3000, 30_000).batch_pages(&[40, 3, 3, 12, 7, 8, 9, 10, 11, 13, 14, 15, 16]);

        let pages: Vec<u32> = scopes.iter().flat_map(|s| s.pages.clone()).collect();
        assert_eq!(pages, vec![3, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 40]);
        assert!(scopes.iter().all(|s| s.page_count() <= 10));
        assert_eq!(scopes[0].label, "positions_3-15");
        assert_eq!(scopes[1].pages, vec![16, 40]);
    }

    #[test]
    fn test_batch_pages_small_set_is_one_scope() {
        let scopes = chunker(3000, 30_000).batch_pages(&[2, 9]);

        assert_eq!(scopes.len(), 1);
        assert!(!scopes[0].is_contiguous());
    }
}
