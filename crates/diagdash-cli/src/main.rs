use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use diagdash_core::FilterSpec;
use diagdash_sync::export::{self, ExportFormat};
use diagdash_sync::{run_sync_once, SyncConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "diagdash")]
#[command(about = "Diagnostic lead dashboard command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one synchronization cycle and print its report.
    Sync,
    /// Print the dashboard summary JSON for a filter.
    Summary {
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Write the filtered records as CSV or Parquet.
    Export {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(long)]
        out: PathBuf,
        /// Defaults to the output file's extension, then csv.
        #[arg(long)]
        format: Option<ExportFormat>,
    },
    /// Start the dashboard web server.
    Serve,
}

#[derive(Debug, Clone, Default, Args)]
struct FilterArgs {
    /// First day included (YYYY-MM-DD).
    #[arg(long)]
    start: Option<NaiveDate>,
    /// Last day included (YYYY-MM-DD).
    #[arg(long)]
    end: Option<NaiveDate>,
    /// Exact campaign, or "all".
    #[arg(long)]
    campaign: Option<String>,
}

impl FilterArgs {
    fn to_spec(&self, config: &SyncConfig) -> FilterSpec {
        FilterSpec {
            start_date: self.start,
            end_date: self.end,
            campaign: self.campaign.clone(),
            utc_offset: config.utc_offset,
        }
    }
}

fn resolve_format(out: &std::path::Path, explicit: Option<ExportFormat>) -> ExportFormat {
    explicit
        .or_else(|| {
            out.extension()
                .and_then(|ext| ext.to_str())
                .and_then(|ext| ext.parse().ok())
        })
        .unwrap_or(ExportFormat::Csv)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let config = SyncConfig::from_env()?;
            let (_, report) = run_sync_once(&config).await?;
            println!(
                "sync complete: generation={} backend={} records={} windows={} duplicates_skipped={}",
                report.generation,
                report.backend,
                report.records,
                report.windows,
                report.duplicates_skipped
            );
        }
        Commands::Summary { filter } => {
            let config = SyncConfig::from_env()?;
            let (snapshot, _) = run_sync_once(&config).await?;
            let summary = diagdash_insights::summarize(&snapshot, &filter.to_spec(&config));
            let json = serde_json::to_string_pretty(&summary).context("serializing summary")?;
            println!("{json}");
        }
        Commands::Export {
            filter,
            out,
            format,
        } => {
            let config = SyncConfig::from_env()?;
            let (snapshot, _) = run_sync_once(&config).await?;
            let records = diagdash_insights::apply_filter(snapshot.records(), &filter.to_spec(&config));
            let format = resolve_format(&out, format);
            export::export_to_path(&out, format, &records)?;
            info!(path = %out.display(), %format, records = records.len(), "export written");
            println!("exported {} records to {}", records.len(), out.display());
        }
        Commands::Serve => {
            diagdash_web::serve_from_env().await?;
        }
    }

    Ok(())
}
