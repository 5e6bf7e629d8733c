use chrono::Utc;
use extract::{StageKind, StageOutput, TriageOutcome};
use serde::Serialize;
use std::path::PathBuf;
use tracing::{debug, warn};

#[derive(Debug, Serialize)]
struct ErrorReport<'a> {
    document: &'a str,
    stage: Option<StageKind>,
    message: &'a str,
    errors: &'a [String],
    raw_responses: &'a [String],
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct DebugReport<'a> {
    document: &'a str,
    triage: &'a TriageOutcome,
    stages: &'a [StageOutput],
    timestamp: String,
}

/// Writes per-document JSON reports for failed or unparseable stages.
///
/// Diagnostics never abort a run: write failures are logged and dropped.
pub struct DiagnosticsWriter {
    dir: PathBuf,
}

impl DiagnosticsWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `error_<study>_<stem>_<ts>.json` for a document that failed outright.
    pub fn write_error(
        &self,
        study_id: u32,
        stem: &str,
        document: &str,
        stage: Option<&StageOutput>,
        message: &str,
    ) -> Option<PathBuf> {
        let report = ErrorReport {
            document,
            stage: stage.map(|s| s.kind),
            message,
            errors: stage.map(|s| s.errors.as_slice()).unwrap_or_default(),
            raw_responses: stage.map(|s| s.unstructured.as_slice()).unwrap_or_default(),
            timestamp: Utc::now().to_rfc3339(),
        };
        self.write("error", study_id, stem, &report)
    }

    /// `debug_<study>_<stem>_<ts>.json` when triage found nothing or some stage
    /// produced responses nothing could parse.
    pub fn write_debug(
        &self,
        study_id: u32,
        stem: &str,
        document: &str,
        triage: &TriageOutcome,
        stages: &[StageOutput],
    ) -> Option<PathBuf> {
        if !triage.found_nothing() && stages.iter().all(|s| s.unstructured.is_empty()) {
            return None;
        }
        let report = DebugReport {
            document,
            triage,
            stages,
            timestamp: Utc::now().to_rfc3339(),
        };
        self.write("debug", study_id, stem, &report)
    }

    /// Study ids are unique within a run, so same-stem documents never collide.
    fn write<T: Serialize>(&self, prefix: &str, study_id: u32, stem: &str, report: &T) -> Option<PathBuf> {
        let path = self.dir.join(format!(
            "{}_{}_{}_{}.json",
            prefix,
            study_id,
            stem,
            Utc::now().format("%Y%m%d_%H%M%S")
        ));

        let result = std::fs::create_dir_all(&self.dir)
            .map_err(anyhow::Error::from)
            .and_then(|_| serde_json::to_string_pretty(report).map_err(anyhow::Error::from))
            .and_then(|json| std::fs::write(&path, json).map_err(anyhow::Error::from));

        match result {
            Ok(()) => {
                debug!(path = ?path, "Diagnostics written");
                Some(path)
            }
            Err(e) => {
                warn!(path = ?path, error = %e, "Failed to write diagnostics");
                None
            }
        }
    }
}
