use anyhow::{Context, Result, bail};
use clap::Parser;
use extract::AnthropicClient;
use ingest::{FileLoader, FileReader};
use runner::{
    AppConfig, OperationMode, RunError, RunReport, ScopusClient, StudyAccumulator, enrich_citations,
    export_dataset,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "inflation-meta",
    about = "Extract optimal-inflation estimates from a folder of papers into a meta-analysis dataset"
)]
struct Cli {
    /// Folder containing the PDF or text papers
    folder: PathBuf,

    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Model tier preset
    #[arg(long, value_enum)]
    mode: Option<OperationMode>,

    /// Output directory for the CSV and JSON exports
    #[arg(long)]
    export_dir: Option<PathBuf>,

    /// Ignore and do not write the stage cache
    #[arg(long, default_value_t = false)]
    no_cache: bool,

    /// Look up citation counts for extracted DOIs
    #[arg(long, default_value_t = false)]
    citations: bool,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    log_json: bool,

    /// Anthropic API key
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    api_key: String,

    /// Scopus API key, required with --citations
    #[arg(long, env = "SCOPUS_API_KEY", hide_env_values = true)]
    scopus_key: Option<String>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut config = AppConfig::load(cli.config.as_deref(), cli.mode)?;
    if cli.no_cache {
        config.run.use_cache = false;
    }
    if let Some(dir) = &cli.export_dir {
        config.run.export_dir = dir.clone();
    }
    if cli.citations {
        config.citations.enabled = true;
    }

    let entries = FileReader::list_documents(&cli.folder)
        .with_context(|| format!("Failed to list documents in {:?}", cli.folder))?;
    if entries.is_empty() {
        bail!("No PDF or text files found in {:?}", cli.folder);
    }
    info!(folder = ?cli.folder, documents = entries.len(), mode = config.mode.name(), "Documents found");

    let client = Arc::new(AnthropicClient::new(&cli.api_key)?);
    let mut accumulator = StudyAccumulator::new(&config, client);

    let (mut report, aborted) = match accumulator.process_all(&entries, &FileLoader).await {
        Ok(report) => (report, false),
        Err(RunError::DailyBudgetExhausted { partial, source }) => {
            warn!(error = %source, "Run stopped early, exporting partial dataset");
            (*partial, true)
        }
    };

    if config.citations.enabled && !aborted {
        match &cli.scopus_key {
            Some(key) => {
                let scopus = ScopusClient::new(key, config.citations.clone())?;
                enrich_citations(&mut report.dataset, &scopus, &config.citations).await;
            }
            None => warn!("Citation lookup requested without a Scopus API key, skipping"),
        }
    }

    let paths = export_dataset(&report, &config.run.export_dir)?;
    print_summary(&report, &paths.csv, &paths.json);

    if aborted {
        println!("Run aborted: daily token budget exhausted.");
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

fn print_summary(report: &RunReport, csv: &Path, json: &Path) {
    println!();
    println!("=== Run {} ({}) ===", report.run_id, report.mode.name());
    print!("{}", report.stats.render_summary());
    println!("CSV:  {}", csv.display());
    println!("JSON: {}", json.display());
}
