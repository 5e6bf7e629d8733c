pub mod accumulator;
pub mod cache;
pub mod citations;
pub mod config;
pub mod diagnostics;
pub mod export;
pub mod metrics;

pub use accumulator::{RunError, RunReport, StudyAccumulator};
pub use cache::{CachedStudy, StageCache};
pub use citations::{CitationCount, CitationLookup, EnrichmentSummary, ScopusClient, enrich_citations};
pub use config::{AppConfig, CitationConfig, OperationMode, RunConfig};
pub use diagnostics::DiagnosticsWriter;
pub use export::{ExportPaths, export_dataset, write_csv};
pub use metrics::{
    ProcessingLogEntry, RowCountCheck, RowCountStats, RowCountVerdict, RunStats, StageCounts, StudyStatus,
};
