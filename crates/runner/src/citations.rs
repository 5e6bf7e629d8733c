use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use extract::{Cell, Column, Dataset};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::CitationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CitationCount {
    Found(u64),
    NotFound,
}

/// Bibliographic lookup: citation count for one DOI.
#[async_trait]
pub trait CitationLookup: Send + Sync {
    async fn citation_count(&self, doi: &str) -> Result<CitationCount>;
}

/// Elsevier Scopus citation-count endpoint.
pub struct ScopusClient {
    api_key: String,
    config: CitationConfig,
    client: reqwest::Client,
}

impl ScopusClient {
    pub fn new(api_key: impl Into<String>, config: CitationConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build Scopus HTTP client")?;

        Ok(Self {
            api_key: api_key.into(),
            config,
            client,
        })
    }

    async fn request_once(&self, doi: &str) -> Result<CitationCount> {
        let response = self
            .client
            .get(&self.config.base_url)
            .query(&[("doi", doi)])
            .header("X-ELS-APIKey", self.api_key.trim())
            .header("Accept", "application/json")
            .send()
            .await
            .context("Scopus request failed")?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(CitationCount::NotFound);
        }
        if !status.is_success() {
            return Err(anyhow!("Scopus returned status {}", status));
        }

        let body: serde_json::Value = response.json().await.context("Failed to decode Scopus response")?;
        Ok(parse_count(&body).map_or(CitationCount::NotFound, CitationCount::Found))
    }
}

#[async_trait]
impl CitationLookup for ScopusClient {
    async fn citation_count(&self, doi: &str) -> Result<CitationCount> {
        let attempts = self.config.attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.request_once(doi).await {
                Ok(count) => return Ok(count),
                Err(e) if attempt >= attempts => return Err(e),
                Err(e) => {
                    warn!(doi, attempt, error = %e, "Citation lookup failed, retrying");
                    sleep(Duration::from_millis(self.config.retry_pause_ms)).await;
                }
            }
        }
    }
}

/// `citation-count-response.document.citation-count`, as a number or digit string.
fn parse_count(body: &serde_json::Value) -> Option<u64> {
    let count = body
        .get("citation-count-response")?
        .get("document")?
        .get("citation-count")?;

    match count {
        serde_json::Value::Number(n) => n.as_u64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichmentSummary {
    pub looked_up: usize,
    pub found: usize,
    pub not_found: usize,
    pub failed: usize,
}

/// Fill `Num_Citations` from the lookup for every distinct DOI in the dataset.
///
/// Rows keep their extracted value when the lookup finds nothing or fails.
pub async fn enrich_citations(
    dataset: &mut Dataset,
    lookup: &dyn CitationLookup,
    config: &CitationConfig,
) -> EnrichmentSummary {
    let mut dois: Vec<String> = Vec::new();
    for row in &dataset.rows {
        if let Some(doi) = row.value(Column::Doi) {
            if !dois.iter().any(|d| d == doi) {
                dois.push(doi.to_string());
            }
        }
    }

    let mut summary = EnrichmentSummary::default();
    let mut counts: BTreeMap<String, u64> = BTreeMap::new();

    for (index, doi) in dois.iter().enumerate() {
        if index > 0 {
            sleep(Duration::from_millis(config.lookup_pause_ms)).await;
        }
        summary.looked_up += 1;

        match lookup.citation_count(doi).await {
            Ok(CitationCount::Found(count)) => {
                debug!(doi = %doi, count, "Citation count found");
                summary.found += 1;
                counts.insert(doi.clone(), count);
            }
            Ok(CitationCount::NotFound) => {
                debug!(doi = %doi, "No citation record");
                summary.not_found += 1;
            }
            Err(e) => {
                warn!(doi = %doi, error = %e, "Citation lookup gave up");
                summary.failed += 1;
            }
        }
    }

    for row in &mut dataset.rows {
        let count = row.value(Column::Doi).and_then(|doi| counts.get(doi)).copied();
        if let Some(count) = count {
            row.set(Column::NumCitations, Cell::value(count.to_string()));
        }
    }

    info!(
        looked_up = summary.looked_up,
        found = summary.found,
        not_found = summary.not_found,
        failed = summary.failed,
        "Citation enrichment complete"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::{ExtractedRow, Missing};
    use std::sync::Mutex;

    struct FakeLookup {
        counts: BTreeMap<String, u64>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CitationLookup for FakeLookup {
        async fn citation_count(&self, doi: &str) -> Result<CitationCount> {
            self.calls.lock().unwrap().push(doi.to_string());
            if doi == "10.1/broken" {
                return Err(anyhow!("connection reset"));
            }
            Ok(self
                .counts
                .get(doi)
                .map_or(CitationCount::NotFound, |c| CitationCount::Found(*c)))
        }
    }

    fn row(study: u32, doi: Cell) -> ExtractedRow {
        let mut row = ExtractedRow::placeholder(study);
        row.set(Column::Doi, doi);
        row.set(Column::NumCitations, Cell::value("3"));
        row
    }

    #[test]
    fn test_parse_count_accepts_string_or_number() {
        let text = serde_json::json!({"citation-count-response": {"document": {"citation-count": "42"}}});
        let number = serde_json::json!({"citation-count-response": {"document": {"citation-count": 7}}});

        assert_eq!(parse_count(&text), Some(42));
        assert_eq!(parse_count(&number), Some(7));
        assert_eq!(parse_count(&serde_json::json!({})), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enrichment_updates_rows_per_doi() {
        let mut dataset = Dataset::new();
        dataset.extend_study(vec![
            row(1, Cell::value("10.1/a")),
            row(1, Cell::value("10.1/a")),
            row(2, Cell::value("10.1/missing")),
            row(3, Cell::value("10.1/broken")),
            row(4, Cell::Missing(Missing::NotFound)),
        ]);
        let lookup = FakeLookup {
            counts: BTreeMap::from([("10.1/a".to_string(), 120)]),
            calls: Mutex::new(Vec::new()),
        };

        let summary = enrich_citations(&mut dataset, &lookup, &CitationConfig::default()).await;

        assert_eq!(summary.looked_up, 3);
        assert_eq!(summary.found, 1);
        assert_eq!(summary.not_found, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(lookup.calls.lock().unwrap().len(), 3);
        assert_eq!(dataset.rows[0].value(Column::NumCitations), Some("120"));
        assert_eq!(dataset.rows[1].value(Column::NumCitations), Some("120"));
        assert_eq!(dataset.rows[2].value(Column::NumCitations), Some("3"));
        assert_eq!(dataset.rows[3].value(Column::NumCitations), Some("3"));
    }
}
