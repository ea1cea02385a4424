//! Category tables, watermark state and the HTTP transport for the Oura sync engine.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use oura_core::{
    flatten_record, select_row_identity, uses_fallback_identity, FlatRow, Record, Scalar,
    IDENTITY_COLUMN,
};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "oura-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("reading {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("writing {}: {source}", .path.display())]
    Write { path: PathBuf, source: io::Error },
    #[error("parsing table {}: {source}", .path.display())]
    Table { path: PathBuf, source: csv::Error },
    #[error("encoding table {}: {source}", .path.display())]
    Encode { path: PathBuf, source: csv::Error },
    #[error("parsing state file {}: {source}", .path.display())]
    State { path: PathBuf, source: serde_json::Error },
    #[error("invalid watermark {value:?} for category {category} in {}", .path.display())]
    Watermark {
        path: PathBuf,
        category: String,
        value: String,
    },
}

/// Replaces `path` with `bytes` through a sibling temp file and a rename.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| StorageError::Write {
        path: parent.to_path_buf(),
        source,
    })?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    fs::write(&temp_path, bytes).map_err(|source| StorageError::Write {
        path: temp_path.clone(),
        source,
    })?;

    if let Err(source) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(StorageError::Write {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Deduplicated rows of one category, keyed by identity in first-seen order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryTable {
    order: Vec<String>,
    rows: HashMap<String, FlatRow>,
}

impl CategoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a table with a header row. Stored identities are kept as-is;
    /// rows without one get a freshly selected identity.
    pub fn from_csv_reader<R: io::Read>(reader: R) -> Result<Self, csv::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(reader);
        let headers = reader.headers()?.clone();

        let mut table = Self::new();
        for record in reader.records() {
            let record = record?;
            let row = headers
                .iter()
                .zip(record.iter())
                .map(|(column, cell)| (column.to_string(), Scalar::text(cell)))
                .collect::<FlatRow>();
            let identity = row
                .get(IDENTITY_COLUMN)
                .filter(|stored| !stored.is_blank())
                .map(Scalar::render)
                .unwrap_or_else(|| select_row_identity(&row));
            table.upsert(identity, row);
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, identity: &str) -> Option<&FlatRow> {
        self.rows.get(identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    /// Stores `row` under `identity`, replacing any previous row wholesale.
    /// Returns `true` when the identity was not present before.
    pub fn upsert(&mut self, identity: String, mut row: FlatRow) -> bool {
        row.insert(IDENTITY_COLUMN.to_string(), Scalar::Text(identity.clone()));
        match self.rows.insert(identity.clone(), row) {
            Some(_) => false,
            None => {
                self.order.push(identity);
                true
            }
        }
    }

    /// Merges incoming rows (last write wins) and returns how many identities are new.
    pub fn merge_rows(&mut self, rows: impl IntoIterator<Item = FlatRow>) -> usize {
        rows.into_iter()
            .map(|row| {
                let identity = select_row_identity(&row);
                self.upsert(identity, row)
            })
            .filter(|added| *added)
            .count()
    }

    /// Sorted union of every column across all rows.
    pub fn columns(&self) -> Vec<String> {
        self.rows
            .values()
            .flat_map(|row| row.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, csv::Error> {
        let columns = self.columns();
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer.write_record(&columns)?;
        for row in self.order.iter().filter_map(|id| self.rows.get(id)) {
            writer.write_record(
                columns
                    .iter()
                    .map(|column| row.get(column).map(Scalar::render).unwrap_or_default()),
            )?;
        }
        writer
            .into_inner()
            .map_err(|err| csv::Error::from(err.into_error()))
    }
}

/// One CSV table per category under a root directory.
#[derive(Debug, Clone)]
pub struct TableStore {
    root: PathBuf,
}

impl TableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn table_path(&self, category: &str) -> PathBuf {
        self.root.join(format!("{category}.csv"))
    }

    /// Loads a category table; a missing file is an empty table.
    pub fn load(&self, category: &str) -> Result<CategoryTable, StorageError> {
        let path = self.table_path(category);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(CategoryTable::new()),
            Err(source) => return Err(StorageError::Read { path, source }),
        };
        CategoryTable::from_csv_reader(file).map_err(|source| StorageError::Table { path, source })
    }

    /// Merges rows into the category table and rewrites it in full.
    ///
    /// An empty `rows` leaves the file untouched.
    pub fn merge_rows(&self, category: &str, rows: Vec<FlatRow>) -> Result<usize, StorageError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut table = self.load(category)?;
        let added = table.merge_rows(rows);

        let path = self.table_path(category);
        let bytes = table.to_csv_bytes().map_err(|source| StorageError::Encode {
            path: path.clone(),
            source,
        })?;
        write_atomically(&path, &bytes)?;
        debug!(
            category,
            added,
            total = table.len(),
            path = %path.display(),
            "rewrote category table"
        );
        Ok(added)
    }

    /// Flattens records and merges them into the category table.
    pub fn write_records(&self, category: &str, records: &[Record]) -> Result<usize, StorageError> {
        let rows = records.iter().map(flatten_record).collect::<Vec<_>>();
        let content_keyed = rows.iter().filter(|row| uses_fallback_identity(row)).count();
        if content_keyed > 0 {
            debug!(
                category,
                rows = content_keyed,
                "rows without identity fields are deduplicated by full content"
            );
        }
        self.merge_rows(category, rows)
    }
}

#[derive(Debug, Default, Deserialize)]
struct StateDocument {
    #[serde(default)]
    categories: BTreeMap<String, String>,
    #[serde(flatten)]
    extra: BTreeMap<String, JsonValue>,
}

/// Per-category fetch watermarks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncState {
    watermarks: BTreeMap<String, DateTime<Utc>>,
    extra: BTreeMap<String, JsonValue>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watermark(&self, category: &str) -> Option<DateTime<Utc>> {
        self.watermarks.get(category).copied()
    }

    /// Sets the watermark unconditionally and returns the previous value.
    pub fn set_watermark(
        &mut self,
        category: impl Into<String>,
        fetched_through: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.watermarks.insert(category.into(), fetched_through)
    }

    pub fn is_empty(&self) -> bool {
        self.watermarks.is_empty()
    }
}

/// JSON file holding `{"categories": {name: timestamp}}`.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<SyncState, StorageError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(SyncState::new()),
            Err(source) => {
                return Err(StorageError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let doc: StateDocument =
            serde_json::from_str(&text).map_err(|source| StorageError::State {
                path: self.path.clone(),
                source,
            })?;

        let mut watermarks = BTreeMap::new();
        for (category, value) in doc.categories {
            let ts = parse_watermark(&value).ok_or_else(|| StorageError::Watermark {
                path: self.path.clone(),
                category: category.clone(),
                value: value.clone(),
            })?;
            watermarks.insert(category, ts);
        }
        Ok(SyncState {
            watermarks,
            extra: doc.extra,
        })
    }

    /// Overwrites the state file with every watermark, keys sorted.
    pub fn save(&self, state: &SyncState) -> Result<(), StorageError> {
        let categories = state
            .watermarks
            .iter()
            .map(|(category, ts)| (category.clone(), JsonValue::String(ts.to_rfc3339())))
            .collect::<BTreeMap<_, _>>();

        let mut doc = state.extra.clone();
        doc.insert(
            "categories".to_string(),
            serde_json::to_value(categories).map_err(|source| StorageError::State {
                path: self.path.clone(),
                source,
            })?,
        );

        let mut bytes = serde_json::to_vec_pretty(&doc).map_err(|source| StorageError::State {
            path: self.path.clone(),
            source,
        })?;
        bytes.push(b'\n');
        write_atomically(&self.path, &bytes)
    }
}

const OFFSET_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f%:z"];

const NAIVE_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Permissive ISO-8601 parsing. A trailing `Z` means UTC and so does a
/// missing offset; a bare date is midnight UTC.
pub fn parse_watermark(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(ts) = DateTime::parse_from_str(value, format) {
            return Some(ts.with_timezone(&Utc));
        }
    }

    let naive = value.strip_suffix(['Z', 'z']).unwrap_or(value);
    for format in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(ts.and_utc());
        }
    }
    NaiveDate::parse_from_str(naive, "%Y-%m-%d")
        .ok()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|ts| ts.and_utc())
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid JSON body from {url}: {source}")]
    Decode {
        url: String,
        source: serde_json::Error,
    },
}

/// GET-with-query returning a JSON body. The seam the paginated fetcher talks through.
#[async_trait]
pub trait JsonTransport: Send + Sync {
    async fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub bearer_token: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            bearer_token: String::new(),
        }
    }
}

/// Retry-free reqwest client carrying the bearer credential on every request.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.bearer_token))
            .context("access token is not a valid header value")?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl JsonTransport for HttpFetcher {
    async fn get_json(&self, url: &str, query: &[(String, String)]) -> Result<JsonValue, FetchError> {
        let resp = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }

        let body = resp.bytes().await.map_err(|source| FetchError::Request {
            url: url.to_string(),
            source,
        })?;
        serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }
}
