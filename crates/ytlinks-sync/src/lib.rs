//! Batch orchestration: bounded worker pool, tabular I/O and run reports.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::fs::File;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{ArrayRef, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use ytlinks_core::{categorize_views, ChannelQuery, ChannelResolution, ResolvedChannel, SocialLink};
use ytlinks_render::{
    BackoffPolicy, BrowserlessConfig, BrowserlessSource, HtmlBackend, RenderBackend, StaticSite,
};
use ytlinks_scraper::{
    ChannelResolver, LinkExtractor, MarkerSignature, NotFoundSignature, ScraperSettings,
};

pub const CRATE_NAME: &str = "ytlinks-sync";

pub const EXTRACTION_STATUS_COLUMN: &str = "extraction_status";
pub const ENGAGEMENT_COLUMN: &str = "engagement_category";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub max_workers: usize,
    /// Resolver attempts per alias, including the first.
    pub max_retries: usize,
    pub retry_base_delay: Duration,
    /// Settle delay after a navigation.
    pub request_delay: Duration,
    pub headless: bool,
    pub page_load_timeout: Duration,
    pub platform_root: String,
    pub browserless_url: String,
    pub browserless_token: Option<String>,
    /// Serve pages from a captured fixture site instead of Browserless.
    pub fixtures_dir: Option<PathBuf>,
    pub output_dir: PathBuf,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_workers: 6,
            max_retries: 3,
            retry_base_delay: Duration::from_secs(1),
            request_delay: Duration::from_secs(1),
            headless: true,
            page_load_timeout: Duration::from_secs(15),
            platform_root: ytlinks_scraper::DEFAULT_PLATFORM_ROOT.to_string(),
            browserless_url: "http://localhost:3000".to_string(),
            browserless_token: None,
            fixtures_dir: None,
            output_dir: PathBuf::from("data/processed"),
            workspace_root: PathBuf::from("."),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_workers: env_parse("YTLINKS_MAX_WORKERS").unwrap_or(defaults.max_workers),
            max_retries: env_parse("YTLINKS_MAX_RETRIES").unwrap_or(defaults.max_retries),
            retry_base_delay: env_parse("YTLINKS_RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_base_delay),
            request_delay: env_parse("YTLINKS_REQUEST_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.request_delay),
            headless: std::env::var("YTLINKS_HEADLESS")
                .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(defaults.headless),
            page_load_timeout: env_parse("YTLINKS_PAGE_LOAD_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.page_load_timeout),
            platform_root: std::env::var("YTLINKS_PLATFORM_ROOT")
                .unwrap_or(defaults.platform_root),
            browserless_url: std::env::var("BROWSERLESS_URL").unwrap_or(defaults.browserless_url),
            browserless_token: std::env::var("BROWSERLESS_TOKEN")
                .ok()
                .filter(|token| !token.is_empty()),
            fixtures_dir: std::env::var("YTLINKS_FIXTURES_DIR").ok().map(PathBuf::from),
            output_dir: std::env::var("YTLINKS_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            workspace_root: std::env::var("YTLINKS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
        }
    }

    pub fn scraper_settings(&self) -> ScraperSettings {
        ScraperSettings {
            platform_root: self.platform_root.clone(),
            settle_delay: self.request_delay,
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                base_delay: self.retry_base_delay,
                ..BackoffPolicy::default()
            },
        }
    }

    pub fn browserless_config(&self) -> BrowserlessConfig {
        BrowserlessConfig {
            base_url: self.browserless_url.clone(),
            token: self.browserless_token.clone(),
            headless: self.headless,
            page_load_timeout: self.page_load_timeout,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NotFoundRulesFile {
    #[allow(dead_code)]
    version: u32,
    #[serde(flatten)]
    markers: MarkerSignature,
}

/// Read `rules/not_found.yaml` under the workspace root. A missing file
/// means the built-in markers; a malformed one is an error.
pub fn load_not_found_rules(workspace_root: &Path) -> Result<MarkerSignature> {
    let path = workspace_root.join("rules").join("not_found.yaml");
    if !path.exists() {
        info!(path = %path.display(), "no not-found rules file, using built-in markers");
        return Ok(MarkerSignature::default());
    }
    let text =
        std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let rules: NotFoundRulesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(rules.markers)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BatchItemError {
    #[error("worker failed: {0}")]
    Failed(String),
    #[error("worker panicked: {0}")]
    Panicked(String),
}

#[derive(Debug)]
pub struct BatchOutcome<I, O> {
    pub item: I,
    pub output: Result<O, BatchItemError>,
}

/// Apply `worker` to every item with at most `max_workers` in flight.
///
/// Returns exactly one outcome per item, in completion order. An error
/// return or a panic inside `worker` becomes that item's
/// [`BatchItemError`] and never disturbs the other items. A `max_workers`
/// of zero is treated as one. Items beyond the pool size stay queued in
/// the input iterator; a task is spawned only when a slot frees up.
pub async fn run_batch<I, O, F, Fut>(
    items: Vec<I>,
    max_workers: usize,
    worker: F,
) -> Vec<BatchOutcome<I, O>>
where
    I: Clone + fmt::Debug + Send + 'static,
    O: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    let total = items.len();
    let pool_size = max_workers.max(1);
    let worker = Arc::new(worker);
    let mut queue = items.into_iter().enumerate();
    let mut pending: Vec<Option<I>> = Vec::with_capacity(total);
    let mut tasks = JoinSet::new();
    let mut outcomes = Vec::with_capacity(total);
    let mut completed = 0usize;

    loop {
        while tasks.len() < pool_size {
            let Some((index, item)) = queue.next() else {
                break;
            };
            let worker = Arc::clone(&worker);
            let task_item = item.clone();
            pending.push(Some(item));
            tasks.spawn(async move {
                // The inner task isolates a panicking worker from the pool.
                let output = match tokio::spawn(async move { worker(task_item).await }).await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(err)) => Err(BatchItemError::Failed(format!("{err:#}"))),
                    Err(err) => Err(BatchItemError::Panicked(panic_message(err))),
                };
                (index, output)
            });
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        let (index, output) = match joined {
            Ok(done) => done,
            Err(err) => {
                error!(error = %err, "batch task aborted");
                continue;
            }
        };
        let Some(item) = pending.get_mut(index).and_then(Option::take) else {
            continue;
        };

        completed += 1;
        if let Err(err) = &output {
            error!(item = ?item, error = %err, "batch item failed");
        }
        info!(completed, total, "progress");
        outcomes.push(BatchOutcome { item, output });
    }

    for item in pending.into_iter().flatten() {
        error!(item = ?item, "batch item lost its task");
        outcomes.push(BatchOutcome {
            item,
            output: Err(BatchItemError::Panicked("task aborted".to_string())),
        });
    }
    outcomes
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "task cancelled".to_string();
    }
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
        Err(err) => err.to_string(),
    }
}

/// Column-ordered table of string cells. A missing cell reads as empty.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, String>>,
}

impl Table {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row<I, K, V>(&mut self, cells: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.rows
            .push(cells.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn get(&self, row: usize, column: &str) -> Option<&str> {
        self.rows.get(row)?.get(column).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn from_resolutions(resolutions: &[ChannelResolution]) -> Self {
        let mut table = Self::new(["alias", "channel_url"]);
        for r in resolutions {
            table.push_row([
                ("alias", r.alias.clone()),
                ("channel_url", r.channel_url.as_label().to_string()),
            ]);
        }
        table
    }

    pub fn from_links(links: &[SocialLink]) -> Self {
        let mut table = Self::new(["channel_url", "platform", "url"]);
        for link in links {
            table.push_row([
                ("channel_url", link.channel_url.clone()),
                ("platform", link.platform.as_str().to_string()),
                ("url", link.url.clone()),
            ]);
        }
        table
    }
}

pub fn read_csv_table(path: &Path) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::Headers)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let columns: Vec<String> = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .iter()
        .map(ToString::to_string)
        .collect();

    let mut table = Table::new(columns.iter().cloned());
    for (line, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("reading row {} of {}", line + 1, path.display()))?;
        table.push_row(
            columns
                .iter()
                .zip(record.iter())
                .filter(|(_, value)| !value.is_empty())
                .map(|(column, value)| (column.clone(), value.to_string())),
        );
    }
    Ok(table)
}

/// Values of one named column, in row order. Blank cells are skipped; a
/// missing column is an error.
pub fn load_column(path: &Path, column: &str) -> Result<Vec<String>> {
    let table = read_csv_table(path)?;
    if !table.has_column(column) {
        bail!(
            "column `{column}` not found in {} (columns: {})",
            path.display(),
            table.columns.join(", ")
        );
    }

    let mut values = Vec::with_capacity(table.len());
    let mut blank = 0usize;
    for row in &table.rows {
        match row.get(column).filter(|v| !v.trim().is_empty()) {
            Some(value) => values.push(value.clone()),
            None => blank += 1,
        }
    }
    if blank > 0 {
        warn!(column, blank, path = %path.display(), "skipped blank input cells");
    }
    info!(column, items = values.len(), path = %path.display(), "read input column");
    Ok(values)
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    Ok(())
}

pub fn write_csv(table: &Table, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let mut writer =
        csv::Writer::from_path(path).with_context(|| format!("creating {}", path.display()))?;
    writer
        .write_record(&table.columns)
        .with_context(|| format!("writing header to {}", path.display()))?;
    for row in &table.rows {
        writer
            .write_record(
                table
                    .columns
                    .iter()
                    .map(|c| row.get(c).map(String::as_str).unwrap_or_default()),
            )
            .with_context(|| format!("writing row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", path.display()))?;
    info!(path = %path.display(), rows = table.len(), "saved table");
    Ok(())
}

/// Long to wide: one row per `index` value (sorted), one column per
/// `columns` value (sorted), holding the first `values` cell seen.
pub fn pivot_first(table: &Table, index: &str, columns: &str, values: &str) -> Result<Table> {
    for column in [index, columns, values] {
        if !table.has_column(column) {
            bail!("cannot pivot: column `{column}` missing");
        }
    }

    let mut cells: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
    let mut headers = BTreeSet::new();
    for row in &table.rows {
        let (Some(key), Some(header), Some(value)) =
            (row.get(index), row.get(columns), row.get(values))
        else {
            continue;
        };
        headers.insert(header.clone());
        cells
            .entry(key.clone())
            .or_default()
            .entry(header.clone())
            .or_insert_with(|| value.clone());
    }

    let mut pivot = Table::new(std::iter::once(index.to_string()).chain(headers));
    for (key, mut row) in cells {
        row.insert(index.to_string(), key);
        pivot.rows.push(row);
    }
    info!(rows = pivot.len(), "pivoted table");
    Ok(pivot)
}

fn suffixed(column: &str, shared: &HashSet<String>, suffix: &str) -> String {
    if shared.contains(column) {
        format!("{column}{suffix}")
    } else {
        column.to_string()
    }
}

/// Left outer join on `on`. Each left row appears once per matching right
/// row, or once with empty right cells when nothing matches. Non-key
/// columns present on both sides get `_x` / `_y` suffixes.
pub fn merge_left(left: &Table, right: &Table, on: &str) -> Result<Table> {
    if !left.has_column(on) || !right.has_column(on) {
        bail!("cannot merge: key column `{on}` missing on one side");
    }

    let shared: HashSet<String> = left
        .columns
        .iter()
        .filter(|c| c.as_str() != on && right.has_column(c))
        .cloned()
        .collect();

    let mut merged = Table::new(
        left.columns
            .iter()
            .map(|c| suffixed(c, &shared, "_x"))
            .chain(
                right
                    .columns
                    .iter()
                    .filter(|c| c.as_str() != on)
                    .map(|c| suffixed(c, &shared, "_y")),
            ),
    );

    let mut by_key: HashMap<&str, Vec<&BTreeMap<String, String>>> = HashMap::new();
    for row in &right.rows {
        if let Some(key) = row.get(on) {
            by_key.entry(key.as_str()).or_default().push(row);
        }
    }

    for row in &left.rows {
        let base: BTreeMap<String, String> = row
            .iter()
            .map(|(c, v)| (suffixed(c, &shared, "_x"), v.clone()))
            .collect();
        match row.get(on).and_then(|key| by_key.get(key.as_str())) {
            Some(matches) => {
                for right_row in matches {
                    let mut out = base.clone();
                    for (c, v) in right_row.iter().filter(|(c, _)| c.as_str() != on) {
                        out.insert(suffixed(c, &shared, "_y"), v.clone());
                    }
                    merged.rows.push(out);
                }
            }
            None => merged.rows.push(base),
        }
    }
    info!(rows = merged.len(), on, "merged tables");
    Ok(merged)
}

fn parse_views(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ',' | '_'))
        .collect();
    cleaned.parse().ok()
}

/// Write the engagement bin of each row's `views_column` into `target`.
/// Empty or unparsable counts are `N/A`.
pub fn categorize_column(table: &mut Table, views_column: &str, target: &str) -> Result<()> {
    if !table.has_column(views_column) {
        bail!("cannot categorize: column `{views_column}` missing");
    }
    if !table.has_column(target) {
        table.columns.push(target.to_string());
    }

    let mut unparsed = 0usize;
    for row in &mut table.rows {
        let raw = row.get(views_column);
        let views = raw.and_then(|v| parse_views(v));
        if raw.is_some() && views.is_none() {
            unparsed += 1;
        }
        row.insert(target.to_string(), categorize_views(views).to_string());
    }
    if unparsed > 0 {
        warn!(
            column = views_column,
            unparsed,
            "view counts that are not numbers were binned as N/A"
        );
    }
    Ok(())
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

/// Snapshot a table as parquet with every column a nullable string.
pub fn write_table_parquet(table: &Table, path: &Path) -> Result<()> {
    ensure_parent(path)?;
    let schema = Arc::new(Schema::new(
        table
            .columns
            .iter()
            .map(|c| ArrowField::new(c.as_str(), DataType::Utf8, true))
            .collect::<Vec<_>>(),
    ));
    let arrays: Vec<ArrayRef> = table
        .columns
        .iter()
        .map(|c| {
            let cells = table
                .rows
                .iter()
                .map(|row| row.get(c).map(String::as_str))
                .collect::<Vec<_>>();
            Arc::new(StringArray::from(cells)) as ArrayRef
        })
        .collect();
    let batch = RecordBatch::try_new(schema, arrays)
        .with_context(|| format!("building record batch for {}", path.display()))?;
    write_parquet(path, batch)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

fn snapshot_entry(name: &str, run_dir: &Path, path: &Path) -> Result<SnapshotFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    Ok(SnapshotFile {
        name: name.to_string(),
        path: path
            .strip_prefix(run_dir)
            .unwrap_or(path)
            .display()
            .to_string(),
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Ok,
    /// The extraction worker itself failed.
    Error,
    /// The alias never resolved to a channel.
    Skipped,
}

impl ExtractionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractionReport {
    pub links: Vec<SocialLink>,
    pub status: BTreeMap<String, ExtractionStatus>,
}

/// Resolutions left-merged with the pivoted links on `channel_url`.
pub fn build_wide_table(
    resolutions: &[ChannelResolution],
    extraction: &ExtractionReport,
) -> Result<Table> {
    let mut left = Table::new(["alias", "channel_url", EXTRACTION_STATUS_COLUMN]);
    for r in resolutions {
        let status = match r.channel_url.channel_url() {
            Some(url) => extraction
                .status
                .get(url)
                .copied()
                .unwrap_or(ExtractionStatus::Error),
            None => ExtractionStatus::Skipped,
        };
        left.push_row([
            ("alias", r.alias.clone()),
            ("channel_url", r.channel_url.as_label().to_string()),
            (EXTRACTION_STATUS_COLUMN, status.as_str().to_string()),
        ]);
    }
    let pivot = pivot_first(
        &Table::from_links(&extraction.links),
        "channel_url",
        "platform",
        "url",
    )?;
    merge_left(&left, &pivot, "channel_url")
}

/// Optional per-channel view counts merged into the wide table.
#[derive(Debug, Clone)]
pub struct ViewsInput {
    pub path: PathBuf,
    pub key_column: String,
    pub views_column: String,
}

/// Load a views table and bin its view counts into `engagement_category`.
pub fn load_views_table(input: &ViewsInput) -> Result<Table> {
    let mut table = read_csv_table(&input.path)?;
    if !table.has_column(&input.key_column) {
        bail!(
            "views table {} has no key column `{}`",
            input.path.display(),
            input.key_column
        );
    }
    categorize_column(&mut table, &input.views_column, ENGAGEMENT_COLUMN)
        .with_context(|| format!("categorizing {}", input.path.display()))?;
    Ok(table)
}

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub input: PathBuf,
    pub column: String,
    pub views: Option<ViewsInput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub input_rows: usize,
    pub channels_found: usize,
    pub not_found: usize,
    pub resolution_errors: usize,
    pub extraction_errors: usize,
    pub links_found: usize,
    pub run_dir: String,
    pub parquet_manifest: String,
}

/// Render backend for a config: the fixture site when one is set,
/// Browserless otherwise.
pub fn render_backend(config: &SyncConfig) -> Result<Arc<dyn RenderBackend>> {
    match &config.fixtures_dir {
        Some(dir) => {
            let site = StaticSite::load_dir(dir)
                .with_context(|| format!("loading fixture site {}", dir.display()))?;
            info!(dir = %dir.display(), "serving pages from fixture site");
            Ok(Arc::new(HtmlBackend::new(site)))
        }
        None => {
            let source = BrowserlessSource::new(&config.browserless_config())
                .context("initializing browserless source")?;
            Ok(Arc::new(HtmlBackend::new(source)))
        }
    }
}

pub struct SyncPipeline {
    config: SyncConfig,
    backend: Arc<dyn RenderBackend>,
    signature: Arc<dyn NotFoundSignature>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let backend = render_backend(&config)?;
        Ok(Self::with_backend(config, backend))
    }

    pub fn with_backend(config: SyncConfig, backend: Arc<dyn RenderBackend>) -> Self {
        Self {
            config,
            backend,
            signature: Arc::new(MarkerSignature::default()),
        }
    }

    pub fn with_signature(mut self, signature: Arc<dyn NotFoundSignature>) -> Self {
        self.signature = signature;
        self
    }

    /// One resolution per query, in completion order.
    pub async fn resolve_channels(&self, queries: Vec<ChannelQuery>) -> Vec<ChannelResolution> {
        let resolver = Arc::new(
            ChannelResolver::new(Arc::clone(&self.backend), self.config.scraper_settings())
                .with_signature(Arc::clone(&self.signature)),
        );
        info!(
            workers = self.config.max_workers,
            aliases = queries.len(),
            "resolving channels"
        );

        let outcomes = run_batch(queries, self.config.max_workers, move |query: ChannelQuery| {
            let resolver = Arc::clone(&resolver);
            async move { Ok::<_, anyhow::Error>(resolver.resolve(&query.alias).await) }
        })
        .await;

        let resolutions: Vec<ChannelResolution> = outcomes
            .into_iter()
            .map(|outcome| ChannelResolution {
                alias: outcome.item.alias,
                channel_url: outcome.output.unwrap_or(ResolvedChannel::Error),
            })
            .collect();
        let found = resolutions
            .iter()
            .filter(|r| r.channel_url.channel_url().is_some())
            .count();
        info!(found, total = resolutions.len(), "channel resolution finished");
        resolutions
    }

    /// Extract links from each distinct channel URL.
    pub async fn extract_links(&self, channel_urls: Vec<String>) -> ExtractionReport {
        let mut seen = HashSet::new();
        let unique: Vec<String> = channel_urls
            .into_iter()
            .filter(|url| seen.insert(url.clone()))
            .collect();
        let extractor = Arc::new(LinkExtractor::new(
            Arc::clone(&self.backend),
            self.config.scraper_settings(),
        ));
        info!(
            workers = self.config.max_workers,
            channels = unique.len(),
            "extracting links"
        );

        let outcomes = run_batch(unique, self.config.max_workers, move |url: String| {
            let extractor = Arc::clone(&extractor);
            async move { Ok::<_, anyhow::Error>(extractor.extract(&url).await) }
        })
        .await;

        let mut report = ExtractionReport::default();
        for BatchOutcome { item, output } in outcomes {
            match output {
                Ok(links) => {
                    report
                        .links
                        .extend(links.into_iter().map(|link| SocialLink::new(item.clone(), link)));
                    report.status.insert(item, ExtractionStatus::Ok);
                }
                Err(_) => {
                    report.status.insert(item, ExtractionStatus::Error);
                }
            }
        }
        info!(
            channels = report.status.len(),
            links = report.links.len(),
            "link extraction finished"
        );
        report
    }

    pub async fn run_once(&self, request: &RunRequest) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        self.run_inner(run_id, request).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, request: &RunRequest) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let aliases = load_column(&request.input, &request.column)?;
        let views = request.views.as_ref().map(load_views_table).transpose()?;
        let input_rows = aliases.len();

        let resolutions = self
            .resolve_channels(aliases.into_iter().map(ChannelQuery::new).collect())
            .await;
        let channel_urls = resolutions
            .iter()
            .filter_map(|r| r.channel_url.channel_url().map(ToString::to_string))
            .collect();
        let extraction = self.extract_links(channel_urls).await;

        let mut wide = build_wide_table(&resolutions, &extraction)?;
        if let (Some(input), Some(views)) = (&request.views, &views) {
            wide = merge_left(&wide, views, &input.key_column)?;
        }
        let tables = [
            ("channels", Table::from_resolutions(&resolutions)),
            ("social_links", Table::from_links(&extraction.links)),
            ("social_links_wide", wide),
        ];

        let run_dir = self.config.output_dir.join(run_id.to_string());
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;
        for (name, table) in &tables {
            write_csv(table, &run_dir.join(format!("{name}.csv")))?;
        }
        let manifest_path = self.export_parquet_snapshots(&run_dir, &tables).await?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            input_rows,
            channels_found: resolutions
                .iter()
                .filter(|r| matches!(r.channel_url, ResolvedChannel::Found(_)))
                .count(),
            not_found: resolutions
                .iter()
                .filter(|r| r.channel_url == ResolvedChannel::NotFound)
                .count(),
            resolution_errors: resolutions
                .iter()
                .filter(|r| r.channel_url == ResolvedChannel::Error)
                .count(),
            extraction_errors: extraction
                .status
                .values()
                .filter(|s| **s == ExtractionStatus::Error)
                .count(),
            links_found: extraction.links.len(),
            run_dir: run_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };

        let bytes = serde_json::to_vec_pretty(&summary).context("serializing run summary")?;
        fs::write(run_dir.join("summary.json"), bytes)
            .await
            .context("writing summary.json")?;
        info!(
            found = summary.channels_found,
            links = summary.links_found,
            run_dir = %summary.run_dir,
            "run finished"
        );
        Ok(summary)
    }

    async fn export_parquet_snapshots(
        &self,
        run_dir: &Path,
        tables: &[(&str, Table)],
    ) -> Result<PathBuf> {
        let snapshot_dir = run_dir.join("snapshots");
        fs::create_dir_all(&snapshot_dir)
            .await
            .with_context(|| format!("creating {}", snapshot_dir.display()))?;

        let mut files = Vec::with_capacity(tables.len());
        for (name, table) in tables {
            let path = snapshot_dir.join(format!("{name}.parquet"));
            write_table_parquet(table, &path)?;
            files.push(snapshot_entry(name, run_dir, &path)?);
        }

        let manifest = SnapshotManifest {
            schema_version: 1,
            files,
        };
        let manifest_path = snapshot_dir.join("manifest.json");
        let bytes =
            serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
        fs::write(&manifest_path, bytes)
            .await
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        Ok(manifest_path)
    }
}

/// Pipeline for a config, with not-found rules from its workspace root.
pub fn pipeline_from_config(config: SyncConfig) -> Result<SyncPipeline> {
    let signature = load_not_found_rules(&config.workspace_root)?;
    Ok(SyncPipeline::new(config)?.with_signature(Arc::new(signature)))
}

pub async fn run_sync_once_from_env(request: &RunRequest) -> Result<SyncRunSummary> {
    pipeline_from_config(SyncConfig::from_env())?
        .run_once(request)
        .await
}
