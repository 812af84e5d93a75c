//! Dataset synchronization: paginated retrieval, field mapping and snapshot publishing.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset, Offset, Utc};
use diagdash_adapters::{load_fixture_rows, map_record, MappingError};
use diagdash_core::Snapshot;
use diagdash_storage::{
    MemoryStore, RecordStore, RestStore, RestStoreConfig, StoreError, WindowRequest,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};

pub mod export;

pub const CRATE_NAME: &str = "diagdash-sync";

pub const CONFIG_FILE_NAME: &str = "diagdash.yaml";
pub const DEFAULT_WINDOW_SIZE: usize = 1000;
pub const DEFAULT_MAX_WINDOWS: usize = 10_000;
pub const ORDER_FIELD: &str = "created_at";

/// Optional on-disk settings; every key can be overridden through the environment.
/// Keys owned by other components (web port, password) are ignored here.
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    store_url: Option<String>,
    store_key: Option<String>,
    table: Option<String>,
    window_size: Option<usize>,
    max_windows: Option<usize>,
    http_timeout_secs: Option<u64>,
    user_agent: Option<String>,
    utc_offset: Option<String>,
    fixture: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub store_url: String,
    pub store_key: Option<String>,
    pub table: String,
    pub window_size: usize,
    pub max_windows: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub utc_offset: FixedOffset,
    /// Serve rows from this JSON fixture instead of the remote store.
    pub fixture: Option<PathBuf>,
    pub workspace_root: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store_url: "http://localhost:54321".to_string(),
            store_key: None,
            table: "diagnostico_cnc".to_string(),
            window_size: DEFAULT_WINDOW_SIZE,
            max_windows: DEFAULT_MAX_WINDOWS,
            http_timeout_secs: 20,
            user_agent: "diagdash/0.1".to_string(),
            utc_offset: Utc.fix(),
            fixture: None,
            workspace_root: PathBuf::from("."),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        Self::load(".")
    }

    /// Defaults, then `diagdash.yaml` under `workspace_root` if present, then env vars.
    pub fn load(workspace_root: impl Into<PathBuf>) -> Result<Self> {
        let workspace_root = workspace_root.into();
        let path = workspace_root.join(CONFIG_FILE_NAME);
        let file = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_yaml::from_str::<ConfigFile>(&text)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            ConfigFile::default()
        };

        let defaults = Self::default();
        let env = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let env_parsed = |key: &str| -> Result<Option<u64>> {
            env(key)
                .map(|v| v.trim().parse::<u64>().with_context(|| format!("{key}={v} is not a number")))
                .transpose()
        };

        let utc_offset = match env("DIAGDASH_UTC_OFFSET").or(file.utc_offset) {
            Some(raw) => parse_utc_offset(&raw)?,
            None => defaults.utc_offset,
        };

        Ok(Self {
            store_url: env("DIAGDASH_STORE_URL")
                .or(file.store_url)
                .unwrap_or(defaults.store_url),
            store_key: env("DIAGDASH_STORE_KEY").or(file.store_key),
            table: env("DIAGDASH_TABLE").or(file.table).unwrap_or(defaults.table),
            window_size: env_parsed("DIAGDASH_WINDOW_SIZE")?
                .map(|v| v as usize)
                .or(file.window_size)
                .unwrap_or(defaults.window_size)
                .max(1),
            max_windows: env_parsed("DIAGDASH_MAX_WINDOWS")?
                .map(|v| v as usize)
                .or(file.max_windows)
                .unwrap_or(defaults.max_windows)
                .max(1),
            http_timeout_secs: env_parsed("DIAGDASH_HTTP_TIMEOUT_SECS")?
                .or(file.http_timeout_secs)
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: env("DIAGDASH_USER_AGENT")
                .or(file.user_agent)
                .unwrap_or(defaults.user_agent),
            utc_offset,
            fixture: env("DIAGDASH_FIXTURE")
                .map(PathBuf::from)
                .or(file.fixture)
                .map(|p| if p.is_relative() { workspace_root.join(p) } else { p }),
            workspace_root,
        })
    }

    pub fn window(&self) -> WindowConfig {
        WindowConfig {
            order_field: ORDER_FIELD.to_string(),
            window_size: self.window_size,
            max_windows: self.max_windows,
        }
    }
}

/// Parse `Z`, `UTC`, `+HH:MM`, `-HH:MM`, `+HHMM` or `+HH`.
pub fn parse_utc_offset(raw: &str) -> Result<FixedOffset> {
    let raw = raw.trim();
    if raw.eq_ignore_ascii_case("z") || raw.eq_ignore_ascii_case("utc") {
        return Ok(Utc.fix());
    }
    let (sign, rest) = if let Some(rest) = raw.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = raw.strip_prefix('-') {
        (-1, rest)
    } else {
        bail!("utc offset `{raw}` must start with + or -");
    };
    let digits: String = rest.chars().filter(|c| *c != ':').collect();
    if !digits.chars().all(|c| c.is_ascii_digit()) || !matches!(digits.len(), 2 | 4) {
        bail!("utc offset `{raw}` is not of the form +HH:MM");
    }
    let hours: i32 = digits[..2].parse()?;
    let minutes: i32 = if digits.len() == 4 { digits[2..].parse()? } else { 0 };
    if hours > 23 || minutes > 59 {
        bail!("utc offset `{raw}` is out of range");
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .with_context(|| format!("utc offset `{raw}` is out of range"))
}

#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub order_field: String,
    /// Rows per windowed read; should equal the store's per-request cap.
    pub window_size: usize,
    /// Safety valve against a store that never signals the end of data.
    pub max_windows: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            order_field: ORDER_FIELD.to_string(),
            window_size: DEFAULT_WINDOW_SIZE,
            max_windows: DEFAULT_MAX_WINDOWS,
        }
    }
}

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("windowed read at offset {offset} failed: {source}")]
    Window {
        offset: usize,
        #[source]
        source: StoreError,
    },
    #[error("store did not signal end of data within {max_windows} windowed reads")]
    IterationCeiling { max_windows: usize },
    #[error("row at offset {offset} violates the store contract: {source}")]
    Malformed {
        offset: usize,
        #[source]
        source: MappingError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub generation: u64,
    pub backend: String,
    pub records: usize,
    pub windows: usize,
    pub total_count: Option<usize>,
    pub duplicates_skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Retrieves the whole remote table through sequential windowed reads.
pub struct Synchronizer {
    store: Arc<dyn RecordStore>,
    window: WindowConfig,
}

impl Synchronizer {
    pub fn new(store: Arc<dyn RecordStore>, window: WindowConfig) -> Self {
        Self { store, window }
    }

    /// Full snapshot or nothing: any failed read discards everything read so far.
    pub async fn fetch_all(&self) -> Result<Snapshot, RetrievalError> {
        self.fetch_generation(0).await.map(|(snapshot, _)| snapshot)
    }

    pub async fn fetch_generation(
        &self,
        generation: u64,
    ) -> Result<(Snapshot, SyncReport), RetrievalError> {
        let span = info_span!(
            "snapshot_sync",
            generation,
            backend = self.store.backend_tag(),
            window_size = self.window.window_size
        );
        self.paginate(generation).instrument(span).await
    }

    async fn paginate(&self, generation: u64) -> Result<(Snapshot, SyncReport), RetrievalError> {
        let started_at = Utc::now();
        let window_size = self.window.window_size.max(1);

        let mut cursor = 0usize;
        let mut windows = 0usize;
        let mut total_count: Option<usize> = None;
        let mut duplicates_skipped = 0usize;
        let mut seen: HashSet<String> = HashSet::new();
        let mut records = Vec::new();

        loop {
            if windows >= self.window.max_windows {
                return Err(RetrievalError::IterationCeiling {
                    max_windows: self.window.max_windows,
                });
            }

            let mut request =
                WindowRequest::descending_by(&self.window.order_field, cursor, window_size);
            if windows == 0 {
                request = request.counted();
            }

            let page = self
                .store
                .read_window(&request)
                .instrument(info_span!("read_window", offset = cursor, limit = window_size))
                .await
                .map_err(|source| RetrievalError::Window {
                    offset: cursor,
                    source,
                })?;
            windows += 1;

            if total_count.is_none() {
                total_count = page.total_count;
            }
            let received = page.rows.len();
            debug!(offset = cursor, received, ?total_count, "window read");

            if received == 0 {
                break;
            }

            for (index, raw) in page.rows.iter().enumerate() {
                let record = map_record(raw).map_err(|source| RetrievalError::Malformed {
                    offset: cursor + index,
                    source,
                })?;
                if seen.insert(record.id.clone()) {
                    records.push(record);
                } else {
                    duplicates_skipped += 1;
                }
            }

            if total_count.is_some_and(|total| records.len() >= total) {
                break;
            }
            if received < window_size {
                break;
            }
            cursor += window_size;
        }

        if duplicates_skipped > 0 {
            warn!(
                duplicates_skipped,
                "store order shifted during pagination; duplicate ids were dropped"
            );
        }

        let finished_at = Utc::now();
        info!(records = records.len(), windows, "snapshot synchronized");

        let report = SyncReport {
            generation,
            backend: self.store.backend_tag().to_string(),
            records: records.len(),
            windows,
            total_count,
            duplicates_skipped,
            started_at,
            finished_at,
        };
        Ok((Snapshot::new(generation, finished_at, records), report))
    }
}

/// Publishes one snapshot generation at a time.
///
/// Cycles are serialized through `gate`; a snapshot is swapped in only once its cycle
/// has fully succeeded, and never replaces a newer generation.
pub struct SnapshotHub {
    synchronizer: Synchronizer,
    current: RwLock<Option<Arc<Snapshot>>>,
    last_report: RwLock<Option<SyncReport>>,
    gate: Mutex<()>,
    next_generation: AtomicU64,
}

impl SnapshotHub {
    pub fn new(synchronizer: Synchronizer) -> Self {
        Self {
            synchronizer,
            current: RwLock::new(None),
            last_report: RwLock::new(None),
            gate: Mutex::new(()),
            next_generation: AtomicU64::new(0),
        }
    }

    pub async fn current(&self) -> Option<Arc<Snapshot>> {
        self.current.read().await.clone()
    }

    pub async fn last_report(&self) -> Option<SyncReport> {
        self.last_report.read().await.clone()
    }

    /// Published snapshot, synchronizing first if there is none.
    pub async fn get_or_sync(&self) -> Result<Arc<Snapshot>, RetrievalError> {
        if let Some(snapshot) = self.current().await {
            return Ok(snapshot);
        }
        let _gate = self.gate.lock().await;
        if let Some(snapshot) = self.current().await {
            return Ok(snapshot);
        }
        self.run_cycle().await
    }

    /// Run a new cycle now. On failure the previously published snapshot stays.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, RetrievalError> {
        let _gate = self.gate.lock().await;
        self.run_cycle().await
    }

    /// Drop the published snapshot so the next access synchronizes again.
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }

    async fn run_cycle(&self) -> Result<Arc<Snapshot>, RetrievalError> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (snapshot, report) = match self.synchronizer.fetch_generation(generation).await {
            Ok(done) => done,
            Err(err) => {
                warn!(generation, error = %err, "synchronization cycle failed");
                return Err(err);
            }
        };
        let snapshot = Arc::new(snapshot);

        let mut current = self.current.write().await;
        if current
            .as_ref()
            .map_or(true, |published| published.generation() < generation)
        {
            *current = Some(Arc::clone(&snapshot));
        }
        drop(current);
        *self.last_report.write().await = Some(report);
        Ok(snapshot)
    }
}

/// Backend selected by the config: the fixture file when set, otherwise PostgREST.
pub fn build_store(config: &SyncConfig) -> Result<Arc<dyn RecordStore>> {
    if let Some(fixture) = &config.fixture {
        let rows = load_fixture_rows(fixture)?;
        info!(fixture = %fixture.display(), rows = rows.len(), "serving rows from fixture");
        return Ok(Arc::new(MemoryStore::new(rows)));
    }
    let store = RestStore::new(RestStoreConfig {
        base_url: config.store_url.clone(),
        table: config.table.clone(),
        api_key: config.store_key.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
        user_agent: Some(config.user_agent.clone()),
        ..Default::default()
    })?;
    Ok(Arc::new(store))
}

pub fn hub_from_config(config: &SyncConfig) -> Result<SnapshotHub> {
    let store = build_store(config)?;
    Ok(SnapshotHub::new(Synchronizer::new(store, config.window())))
}

pub async fn run_sync_once(config: &SyncConfig) -> Result<(Arc<Snapshot>, SyncReport)> {
    let hub = hub_from_config(config)?;
    let snapshot = hub.refresh().await.context("synchronizing snapshot")?;
    let report = hub
        .last_report()
        .await
        .context("synchronization finished without a report")?;
    Ok((snapshot, report))
}


#[cfg(test)]
mod tests {
    use super::*;
    use diagdash_core::RawRecord;
    use serde_json::{json, Value as JsonValue};

    fn raw(id: usize, minutes_ago: i64) -> RawRecord {
        let created_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        match json!({ "id": format!("row-{id}"), "created_at": created_at.to_rfc3339() }) {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        }
    }

    fn synchronizer(store: Arc<MemoryStore>, window_size: usize) -> Synchronizer {
        Synchronizer::new(
            store,
            WindowConfig {
                window_size,
                ..WindowConfig::default()
            },
        )
    }

    #[test]
    fn utc_offsets_parse() {
        assert_eq!(parse_utc_offset("Z").unwrap(), Utc.fix());
        assert_eq!(
            parse_utc_offset("-03:00").unwrap(),
            FixedOffset::west_opt(3 * 3600).unwrap()
        );
        assert_eq!(
            parse_utc_offset("+0530").unwrap(),
            FixedOffset::east_opt(5 * 3600 + 30 * 60).unwrap()
        );
        assert!(parse_utc_offset("03:00").is_err());
        assert!(parse_utc_offset("+25:00").is_err());
    }

    #[test]
    fn config_file_values_are_loaded_and_relative_fixture_resolved() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "table: leads\nwindow_size: 250\nutc_offset: \"-03:00\"\nfixture: fixtures/rows.json\n",
        )
        .expect("write config");

        let config = SyncConfig::load(dir.path()).expect("config");
        assert_eq!(config.table, "leads");
        assert_eq!(config.window_size, 250);
        assert_eq!(config.utc_offset, FixedOffset::west_opt(3 * 3600).unwrap());
        assert_eq!(config.fixture, Some(dir.path().join("fixtures/rows.json")));
    }

    #[test]
    fn malformed_config_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), "window_size: many\n").expect("write");
        assert!(SyncConfig::load(dir.path()).is_err());
    }

    #[tokio::test]
    async fn empty_store_yields_empty_snapshot() {
        let store = Arc::new(MemoryStore::new(Vec::new()));
        let snapshot = synchronizer(store.clone(), 1000)
            .fetch_all()
            .await
            .expect("empty sync");
        assert!(snapshot.is_empty());
        assert_eq!(store.requests().await.len(), 1);
    }

    #[tokio::test]
    async fn twenty_five_hundred_rows_take_three_windows() {
        let rows = (0..2500).map(|i| raw(i, i as i64)).collect();
        let store = Arc::new(MemoryStore::new(rows));
        let (snapshot, report) = synchronizer(store.clone(), 1000)
            .fetch_generation(7)
            .await
            .expect("sync");

        assert_eq!(snapshot.len(), 2500);
        assert_eq!(snapshot.generation(), 7);
        assert_eq!(report.windows, 3);
        assert_eq!(report.total_count, Some(2500));
        let offsets: Vec<_> = store.requests().await.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1000, 2000]);
        let ids: Vec<_> = snapshot.records().iter().map(|r| r.id.clone()).collect();
        let delivered: Vec<_> = (0..2500).map(|i| format!("row-{i}")).collect();
        assert_eq!(ids, delivered);
    }

    #[tokio::test]
    async fn short_page_ends_iteration_for_any_window_size() {
        for window_size in [1, 3, 7, 50] {
            let rows = (0..17).map(|i| raw(i, i as i64)).collect();
            let store = Arc::new(MemoryStore::new(rows).without_count());
            let snapshot = synchronizer(store.clone(), window_size)
                .fetch_all()
                .await
                .expect("sync");
            assert_eq!(snapshot.len(), 17, "window size {window_size}");
            let ids: HashSet<_> = snapshot.records().iter().map(|r| r.id.clone()).collect();
            assert_eq!(ids.len(), 17);
        }
    }

    #[tokio::test]
    async fn rows_inserted_mid_pagination_do_not_duplicate_ids() {
        let rows = (0..30).map(|i| raw(i, i as i64 + 100)).collect();
        let newer = (100..105).map(|i| raw(i, 0)).collect();
        let store = Arc::new(MemoryStore::new(rows).inserting_after(1, newer));
        let (snapshot, report) = synchronizer(store, 10)
            .fetch_generation(1)
            .await
            .expect("sync");

        let ids: HashSet<_> = snapshot.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids.len(), snapshot.len());
        assert_eq!(report.duplicates_skipped, 5);
        assert_eq!(snapshot.len(), 30);
    }

    #[tokio::test]
    async fn mixed_offset_timestamps_come_back_newest_first() {
        let stamped = |id: &str, created_at: &str| match json!({ "id": id, "created_at": created_at }) {
            JsonValue::Object(map) => map,
            _ => unreachable!(),
        };
        let store = Arc::new(MemoryStore::new(vec![
            stamped("a", "2026-02-20T03:00:00Z"),
            stamped("b", "2026-02-20T01:00:00-03:00"),
        ]));
        let snapshot = synchronizer(store, 1000).fetch_all().await.expect("sync");
        let ids: Vec<_> = snapshot.records().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(snapshot
            .records()
            .windows(2)
            .all(|pair| pair[0].created_at >= pair[1].created_at));
    }

    #[tokio::test]
    async fn count_is_requested_on_the_first_window_only() {
        let rows = (0..25).map(|i| raw(i, i as i64)).collect();
        let store = Arc::new(MemoryStore::new(rows));
        synchronizer(store.clone(), 10)
            .fetch_all()
            .await
            .expect("sync");
        let flags: Vec<_> = store
            .requests()
            .await
            .iter()
            .map(|r| (r.offset, r.with_count))
            .collect();
        assert_eq!(flags, vec![(0, true), (10, false), (20, false)]);
    }

    #[tokio::test]
    async fn known_total_stops_before_an_extra_empty_read() {
        let rows = (0..20).map(|i| raw(i, i as i64)).collect();
        let store = Arc::new(MemoryStore::new(rows));
        let snapshot = synchronizer(store.clone(), 10)
            .fetch_all()
            .await
            .expect("sync");
        assert_eq!(snapshot.len(), 20);
        assert_eq!(store.requests().await.len(), 2);
    }

    #[tokio::test]
    async fn without_count_a_full_last_window_needs_one_empty_read() {
        let rows = (0..20).map(|i| raw(i, i as i64)).collect();
        let store = Arc::new(MemoryStore::new(rows).without_count());
        let snapshot = synchronizer(store.clone(), 10)
            .fetch_all()
            .await
            .expect("sync");
        assert_eq!(snapshot.len(), 20);
        assert_eq!(store.requests().await.len(), 3);
    }

    #[tokio::test]
    async fn failing_window_discards_everything() {
        let rows = (0..30).map(|i| raw(i, i as i64)).collect();
        let store = Arc::new(MemoryStore::new(rows).failing_at_offset(20));
        let err = synchronizer(store, 10)
            .fetch_all()
            .await
            .expect_err("third window fails");
        assert!(matches!(err, RetrievalError::Window { offset: 20, .. }));
    }

    #[tokio::test]
    async fn store_that_never_ends_hits_the_ceiling() {
        let rows = (0..10).map(|i| raw(i, i as i64)).collect();
        let store = Arc::new(MemoryStore::new(rows).without_count());
        let looping = LoopingStore { inner: store };
        let sync = Synchronizer::new(
            Arc::new(looping),
            WindowConfig {
                window_size: 10,
                max_windows: 5,
                ..WindowConfig::default()
            },
        );
        let err = sync.fetch_all().await.expect_err("ceiling");
        assert!(matches!(err, RetrievalError::IterationCeiling { max_windows: 5 }));
    }

    #[tokio::test]
    async fn malformed_row_fails_the_cycle() {
        let mut rows: Vec<RawRecord> = (0..3).map(|i| raw(i, i as i64)).collect();
        rows[1].insert("created_at".into(), json!("not a date"));
        let store = Arc::new(MemoryStore::new(rows));
        let err = synchronizer(store, 10).fetch_all().await.expect_err("malformed");
        assert!(matches!(err, RetrievalError::Malformed { .. }));
    }

    #[tokio::test]
    async fn hub_generations_advance_per_cycle() {
        let rows: Vec<RawRecord> = (0..5).map(|i| raw(i, i as i64)).collect();
        let healthy = Arc::new(MemoryStore::new(rows));
        let hub = SnapshotHub::new(synchronizer(healthy, 10));
        let first = hub.get_or_sync().await.expect("first cycle");
        assert_eq!(first.generation(), 1);

        let again = hub.get_or_sync().await.expect("cached");
        assert!(Arc::ptr_eq(&first, &again));

        let refreshed = hub.refresh().await.expect("refresh");
        assert_eq!(refreshed.generation(), 2);
        assert_eq!(hub.current().await.map(|s| s.generation()), Some(2));

        hub.invalidate().await;
        assert!(hub.current().await.is_none());
        let third = hub.get_or_sync().await.expect("resync");
        assert_eq!(third.generation(), 3);
        assert_eq!(hub.last_report().await.map(|r| r.records), Some(5));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_published_snapshot() {
        let inner = Arc::new(MemoryStore::new((0..4).map(|i| raw(i, i as i64)).collect()));
        let store = Arc::new(SwitchableStore {
            inner,
            down: std::sync::atomic::AtomicBool::new(false),
        });
        let hub = SnapshotHub::new(Synchronizer::new(store.clone(), WindowConfig::default()));
        let first = hub.get_or_sync().await.expect("first cycle");

        store.down.store(true, Ordering::SeqCst);
        assert!(matches!(hub.refresh().await, Err(RetrievalError::Window { offset: 0, .. })));
        let still = hub.current().await.expect("previous snapshot");
        assert!(Arc::ptr_eq(&first, &still));
        assert_eq!(hub.last_report().await.map(|r| r.generation), Some(1));

        store.down.store(false, Ordering::SeqCst);
        assert_eq!(hub.refresh().await.expect("recovered").generation(), 3);
    }

    #[tokio::test]
    async fn hub_does_not_publish_a_failed_cycle() {
        let store = Arc::new(MemoryStore::new(vec![raw(1, 1)]).failing_at_offset(0));
        let hub = SnapshotHub::new(synchronizer(store, 10));
        assert!(hub.get_or_sync().await.is_err());
        assert!(hub.current().await.is_none());
        assert!(hub.last_report().await.is_none());
    }

    #[tokio::test]
    async fn concurrent_first_access_runs_a_single_cycle() {
        let rows: Vec<RawRecord> = (0..15).map(|i| raw(i, i as i64)).collect();
        let store = Arc::new(MemoryStore::new(rows));
        let hub = Arc::new(SnapshotHub::new(synchronizer(store.clone(), 10)));

        let (a, b) = tokio::join!(hub.get_or_sync(), hub.get_or_sync());
        let (a, b) = (a.expect("a"), b.expect("b"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.requests().await.len(), 2);
    }

    struct SwitchableStore {
        inner: Arc<MemoryStore>,
        down: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl RecordStore for SwitchableStore {
        fn backend_tag(&self) -> &'static str {
            "switchable"
        }

        async fn read_window(
            &self,
            request: &WindowRequest,
        ) -> Result<diagdash_storage::WindowPage, StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("store is down".into()));
            }
            self.inner.read_window(request).await
        }
    }

    /// Always serves a full page, whatever the offset.
    struct LoopingStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait::async_trait]
    impl RecordStore for LoopingStore {
        fn backend_tag(&self) -> &'static str {
            "looping"
        }

        async fn read_window(
            &self,
            request: &WindowRequest,
        ) -> Result<diagdash_storage::WindowPage, StoreError> {
            let mut rewound = request.clone();
            rewound.offset = 0;
            self.inner.read_window(&rewound).await
        }
    }
}
