use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use ytlinks_core::ChannelQuery;
use ytlinks_sync::{
    categorize_column, load_column, pipeline_from_config, pivot_first, read_csv_table,
    write_csv, RunRequest, SyncConfig, Table, ViewsInput, ENGAGEMENT_COLUMN,
};

#[derive(Debug, Parser)]
#[command(name = "ytlinks-cli")]
#[command(about = "Find social links published on YouTube channel pages")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Commands,
}

/// Per-run overrides of the `YTLINKS_*` environment settings.
#[derive(Debug, Args)]
struct Overrides {
    /// Serve pages from a captured fixture site instead of Browserless.
    #[arg(long, global = true)]
    fixtures: Option<PathBuf>,
    #[arg(long, global = true)]
    workers: Option<usize>,
    #[arg(long, global = true)]
    retries: Option<usize>,
    /// Settle delay after each navigation, in milliseconds.
    #[arg(long, global = true)]
    delay_ms: Option<u64>,
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,
    /// Ask the rendering service for a visible browser.
    #[arg(long, global = true)]
    headed: bool,
}

impl Overrides {
    fn apply(self, mut config: SyncConfig) -> SyncConfig {
        if let Some(dir) = self.fixtures {
            config.fixtures_dir = Some(dir);
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if let Some(retries) = self.retries {
            config.max_retries = retries;
        }
        if let Some(ms) = self.delay_ms {
            config.request_delay = std::time::Duration::from_millis(ms);
        }
        if let Some(dir) = self.output_dir {
            config.output_dir = dir;
        }
        if self.headed {
            config.headless = false;
        }
        config
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve aliases, extract their links and write every run table.
    Run {
        input: PathBuf,
        #[arg(long, default_value = "alias")]
        column: String,
        /// CSV of per-channel average views to merge into the wide table.
        #[arg(long)]
        views: Option<PathBuf>,
        #[arg(long, default_value = "alias")]
        views_key: String,
        #[arg(long, default_value = "avg_views")]
        views_column: String,
    },
    /// Resolve aliases to channel URLs only.
    Resolve {
        input: PathBuf,
        #[arg(long, default_value = "alias")]
        column: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Extract links from a column of channel URLs.
    Extract {
        input: PathBuf,
        #[arg(long, default_value = "channel_url")]
        column: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Bin a view-count column into engagement categories.
    Categorize {
        views: PathBuf,
        #[arg(long, default_value = "avg_views")]
        column: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn categorized_path(output_dir: &Path, views: &Path) -> PathBuf {
    let stem = views
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "views".to_string());
    output_dir.join(format!("{stem}_categorized.csv"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("ytlinks=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = cli.overrides.apply(SyncConfig::from_env());

    match cli.command {
        Commands::Run {
            input,
            column,
            views,
            views_key,
            views_column,
        } => {
            let request = RunRequest {
                input,
                column,
                views: views.map(|path| ViewsInput {
                    path,
                    key_column: views_key,
                    views_column,
                }),
            };
            let summary = pipeline_from_config(config)?.run_once(&request).await?;
            println!(
                "run complete: run_id={} inputs={} found={} not_found={} errors={} links={} dir={}",
                summary.run_id,
                summary.input_rows,
                summary.channels_found,
                summary.not_found,
                summary.resolution_errors,
                summary.links_found,
                summary.run_dir
            );
        }
        Commands::Resolve { input, column, out } => {
            let out = out.unwrap_or_else(|| config.output_dir.join("channels.csv"));
            let queries = load_column(&input, &column)?
                .into_iter()
                .map(ChannelQuery::new)
                .collect();
            let resolutions = pipeline_from_config(config)?.resolve_channels(queries).await;
            write_csv(&Table::from_resolutions(&resolutions), &out)?;
            println!("resolved {} aliases into {}", resolutions.len(), out.display());
        }
        Commands::Extract { input, column, out } => {
            let out = out.unwrap_or_else(|| config.output_dir.join("social_links.csv"));
            let channel_urls = load_column(&input, &column)?;
            let report = pipeline_from_config(config)?.extract_links(channel_urls).await;
            let long = Table::from_links(&report.links);
            write_csv(&long, &out)?;
            let wide_path = out.with_file_name("social_links_wide.csv");
            write_csv(&pivot_first(&long, "channel_url", "platform", "url")?, &wide_path)?;
            println!(
                "extracted {} links from {} channels into {}",
                report.links.len(),
                report.status.len(),
                out.display()
            );
        }
        Commands::Categorize { views, column, out } => {
            let out = out.unwrap_or_else(|| categorized_path(&config.output_dir, &views));
            let mut table = read_csv_table(&views)?;
            categorize_column(&mut table, &column, ENGAGEMENT_COLUMN)
                .with_context(|| format!("categorizing {}", views.display()))?;
            write_csv(&table, &out)?;
            info!(rows = table.len(), "categorized view counts");
            println!("categorized {} rows into {}", table.len(), out.display());
        }
    }

    Ok(())
}
