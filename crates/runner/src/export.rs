use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use extract::Dataset;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

use crate::accumulator::RunReport;
use crate::config::OperationMode;
use crate::metrics::{ProcessingLogEntry, RunStats};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPaths {
    pub csv: PathBuf,
    pub json: PathBuf,
}

#[derive(Serialize)]
struct JsonExport<'a> {
    run_id: Uuid,
    mode: OperationMode,
    started_at: DateTime<Utc>,
    exported_at: DateTime<Utc>,
    columns: Vec<&'static str>,
    rows: Vec<Vec<String>>,
    stats: &'a RunStats,
    log: &'a [ProcessingLogEntry],
}

/// Write `meta_analysis_<mode>_<ts>.csv` and the matching `.json` into `dir`.
pub fn export_dataset(report: &RunReport, dir: &Path) -> Result<ExportPaths> {
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create export directory: {:?}", dir))?;

    let now = Utc::now();
    let base = format!("meta_analysis_{}_{}", report.mode.name(), now.format("%Y%m%d_%H%M%S"));
    let csv_path = dir.join(format!("{}.csv", base));
    let json_path = dir.join(format!("{}.json", base));

    write_csv(&report.dataset, &csv_path)?;

    let export = JsonExport {
        run_id: report.run_id,
        mode: report.mode,
        started_at: report.started_at,
        exported_at: now,
        columns: Dataset::header(),
        rows: report.dataset.rows.iter().map(|row| row.render()).collect(),
        stats: &report.stats,
        log: &report.log,
    };
    let json = serde_json::to_string_pretty(&export)?;
    std::fs::write(&json_path, json).with_context(|| format!("Failed to write {:?}", json_path))?;

    info!(
        rows = report.dataset.len(),
        csv = ?csv_path,
        json = ?json_path,
        "Dataset exported"
    );
    Ok(ExportPaths {
        csv: csv_path,
        json: json_path,
    })
}

pub fn write_csv(dataset: &Dataset, path: &Path) -> Result<()> {
    let mut writer = csv::Writer::from_path(path).with_context(|| format!("Failed to create {:?}", path))?;
    writer.write_record(Dataset::header())?;
    for row in &dataset.rows {
        writer.write_record(row.render())?;
    }
    writer.flush().with_context(|| format!("Failed to write {:?}", path))?;
    Ok(())
}
