//! HTTP fetch plumbing, raw payload archival, and snapshot persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDate, Utc};
use hrn_core::{Coordinates, ReviewStatus, SiteRecord};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin retrying wrapper around one `reqwest::Client`. The pipeline issues
/// requests strictly sequentially, so no concurrency limits live here.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn get(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retries(run_id, source_id, url, || self.client.get(url))
            .await
    }

    pub async fn post_form(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        form: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        self.send_with_retries(run_id, source_id, url, || self.client.post(url).form(form))
            .await
    }

    async fn send_with_retries(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        make_request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_request", %run_id, source_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match make_request().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("target path {} has no parent directory", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed archive of raw upstream payloads (record and
/// metadata exports), kept per run for audit and replay.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    fn payload_relative_path(
        fetched_at: DateTime<Utc>,
        kind: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(stamp)
            .join(kind)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Stores one payload under its content hash. A payload already present
    /// at its hash path is left untouched and reported as deduplicated.
    pub async fn store_payload(
        &self,
        fetched_at: DateTime<Utc>,
        kind: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            Self::payload_relative_path(fetched_at, kind, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking payload path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPayload {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        write_atomic(&absolute_path, bytes).await?;
        Ok(ArchivedPayload {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: false,
        })
    }
}

/// Coordinates recovered from the previous run's snapshot for one site.
#[derive(Debug, Clone, PartialEq)]
pub struct SeedCoordinate {
    pub record_id: u32,
    pub coords: Coordinates,
}

/// Immutable `record_id -> coordinates` lookup, built once per run from the
/// previous snapshot. A hit here means the paid geocoder is never called for
/// that site again.
#[derive(Debug, Default)]
pub struct GeocodeCache {
    coords: HashMap<u32, Coordinates>,
}

impl GeocodeCache {
    pub fn from_seeds(seeds: Vec<SeedCoordinate>) -> Self {
        Self {
            coords: seeds
                .into_iter()
                .map(|seed| (seed.record_id, seed.coords))
                .collect(),
        }
    }

    pub fn lookup(&self, record_id: u32) -> Option<Coordinates> {
        self.coords.get(&record_id).copied()
    }

    pub fn len(&self) -> usize {
        self.coords.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coords.is_empty()
    }
}

const LEADING_COLUMNS: &[&str] = &[
    "record_id",
    "organization_name",
    "site_name",
    "site_type",
    "contact_email",
    "address",
    "city",
    "state",
    "zip_code",
    "full_address",
    "latitude",
    "longitude",
    "geocoded",
    "same_hours_everyday",
    "opening_time",
    "closing_time",
    "days_open",
    "monday_hours",
    "tuesday_hours",
    "wednesday_hours",
    "thursday_hours",
    "friday_hours",
    "saturday_hours",
    "sunday_hours",
    "full_schedule",
];

const TRAILING_COLUMNS: &[&str] = &[
    "services_offered",
    "special_closure_dates",
    "review_status",
    "data_source",
    "last_updated",
];

/// Dynamic service-flag columns, first-seen order across the record set.
fn service_columns(records: &[SiteRecord]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for record in records {
        for flag in &record.services {
            if !columns.iter().any(|key| key == &flag.key) {
                columns.push(flag.key.clone());
            }
        }
    }
    columns
}

fn float_cell(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn encode_snapshot(records: &[SiteRecord]) -> anyhow::Result<Vec<u8>> {
    let service_keys = service_columns(records);

    let mut header: Vec<String> = LEADING_COLUMNS.iter().map(|c| c.to_string()).collect();
    header.extend(service_keys.iter().cloned());
    header.extend(TRAILING_COLUMNS.iter().map(|c| c.to_string()));

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(&header)
        .context("writing snapshot header")?;

    for record in records {
        let schedule = &record.schedule;
        let mut row: Vec<String> = vec![
            record.record_id.to_string(),
            record.organization_name.clone(),
            record.site_name.clone(),
            record.site_type.clone(),
            record.contact_email.clone(),
            record.address.clone(),
            record.city.clone(),
            record.state.clone(),
            record.zip_code.clone(),
            record.full_address.clone(),
            float_cell(record.latitude),
            float_cell(record.longitude),
            record.geocoded.to_string(),
            schedule.same_hours_everyday.to_string(),
            schedule.opening_time.clone(),
            schedule.closing_time.clone(),
            schedule.days_open_list(),
        ];
        row.extend(schedule.day_hours.iter().cloned());
        row.push(schedule.full_schedule.clone());
        for key in &service_keys {
            let enabled = record
                .services
                .iter()
                .find(|flag| &flag.key == key)
                .map(|flag| flag.enabled)
                .unwrap_or(false);
            row.push(enabled.to_string());
        }
        row.push(record.services_offered());
        row.push(record.special_closure_dates.clone());
        row.push(record.review_status.as_str().to_string());
        row.push(record.data_source.as_str().to_string());
        row.push(record.last_updated.format("%Y-%m-%d %H:%M").to_string());

        writer
            .write_record(&row)
            .with_context(|| format!("writing snapshot row for record {}", record.record_id))?;
    }

    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("finalizing snapshot csv: {err}"))
}

/// A snapshot read back as a generic table, for consumers that work across
/// the dynamic service columns (e.g. the map-layer publisher).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl SnapshotTable {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotPaths {
    pub snapshot: PathBuf,
    pub accepted: PathBuf,
    pub archive: PathBuf,
    pub summary: PathBuf,
}

/// Snapshot store contract: the previous snapshot is read once at run start
/// to seed the geocode cache, and a new snapshot set is written only after
/// the full in-memory table is complete, via atomic renames.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    public_dir: PathBuf,
    archive_dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            public_dir: data_dir.join("public"),
            archive_dir: data_dir.join("archives"),
        }
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.public_dir.join("sites.csv")
    }

    pub fn accepted_snapshot_path(&self) -> PathBuf {
        self.public_dir.join("sites_accepted.csv")
    }

    pub fn archive_path(&self, date: NaiveDate) -> PathBuf {
        self.archive_dir.join(format!("sites_{date}.csv"))
    }

    pub fn summary_path(&self) -> PathBuf {
        self.public_dir.join("summary.txt")
    }

    /// Coordinates from the previous snapshot, or `None` on a first run.
    /// A present-but-unreadable snapshot degrades to an empty seed with a
    /// warning; only upstream fetch failures may abort a run.
    pub async fn read_seed_coordinates(&self) -> Option<Vec<SeedCoordinate>> {
        let path = self.snapshot_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "previous snapshot unreadable; seeding empty cache");
                return Some(Vec::new());
            }
        };

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = match reader.headers() {
            Ok(headers) => headers.clone(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "previous snapshot has no parseable header");
                return Some(Vec::new());
            }
        };

        let column = |name: &str| headers.iter().position(|h| h == name);
        let (Some(id_col), Some(lat_col), Some(lon_col)) = (
            column("record_id"),
            column("latitude"),
            column("longitude"),
        ) else {
            warn!(path = %path.display(), "previous snapshot is missing identity or coordinate columns");
            return Some(Vec::new());
        };

        let mut seeds = Vec::new();
        for result in reader.records() {
            let row = match result {
                Ok(row) => row,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "stopping seed read on malformed snapshot row");
                    break;
                }
            };
            let Some(record_id) = row.get(id_col).and_then(|v| v.parse::<u32>().ok()) else {
                continue;
            };
            let latitude = row.get(lat_col).and_then(|v| v.parse::<f64>().ok());
            let longitude = row.get(lon_col).and_then(|v| v.parse::<f64>().ok());
            if let (Some(latitude), Some(longitude)) = (latitude, longitude) {
                seeds.push(SeedCoordinate {
                    record_id,
                    coords: Coordinates {
                        latitude,
                        longitude,
                    },
                });
            }
        }
        Some(seeds)
    }

    /// The accepted-only snapshot as a generic table, or `None` when no
    /// snapshot has been written yet.
    pub async fn read_accepted_table(&self) -> anyhow::Result<Option<SnapshotTable>> {
        let path = self.accepted_snapshot_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading accepted snapshot {}", path.display()))
            }
        };

        let mut reader = csv::Reader::from_reader(bytes.as_slice());
        let headers = reader
            .headers()
            .with_context(|| format!("reading header of {}", path.display()))?
            .iter()
            .map(str::to_string)
            .collect();
        let mut rows = Vec::new();
        for result in reader.records() {
            let row = result.with_context(|| format!("reading row of {}", path.display()))?;
            rows.push(row.iter().map(str::to_string).collect());
        }
        Ok(Some(SnapshotTable { headers, rows }))
    }

    /// Writes the full snapshot, the accepted-only publication variant, the
    /// dated archive copy (one per calendar day), and the summary text.
    pub async fn write(
        &self,
        records: &[SiteRecord],
        summary_text: &str,
        today: NaiveDate,
    ) -> anyhow::Result<SnapshotPaths> {
        let full = encode_snapshot(records)?;
        let accepted_records: Vec<SiteRecord> = records
            .iter()
            .filter(|r| r.review_status == ReviewStatus::Accepted)
            .cloned()
            .collect();
        let accepted = encode_snapshot(&accepted_records)?;

        let paths = SnapshotPaths {
            snapshot: self.snapshot_path(),
            accepted: self.accepted_snapshot_path(),
            archive: self.archive_path(today),
            summary: self.summary_path(),
        };

        write_atomic(&paths.snapshot, &full).await?;
        write_atomic(&paths.accepted, &accepted).await?;
        write_atomic(&paths.archive, &full).await?;
        write_atomic(&paths.summary, summary_text.as_bytes()).await?;

        Ok(paths)
    }
}
