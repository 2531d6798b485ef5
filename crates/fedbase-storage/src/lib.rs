//! HTTP fetch, raw-page archival and the Postgres store for fedbase.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fedbase_core::{
    profile_url, Athlete, AthleteCandidate, Club, ClubCandidate, ExternalId, Generation,
};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info_span;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fedbase-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx and 429 are transient; any other non-success status is a hard failure.
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
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Timeout-bounded GET with capped exponential-backoff retries. The crawl is
/// strictly sequential, so there is no concurrency limiting here.
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

    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("page_fetch", %run_id, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
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
            last_request_error.expect("retry loop always captures a request error"),
        ))
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed snapshots of raw pages, written atomically. The crawler
/// archives pages that fail to parse so the markup can be inspected offline.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
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

    pub fn page_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        label: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(label)
            .join(format!("{content_hash}.html"))
    }

    /// Store bytes immutably using a hash-addressed path and atomic
    /// temp-file rename.
    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        label: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.page_relative_path(fetched_at, label, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating archive directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking archive path {}", absolute_path.display()))?
        {
            return Ok(ArchivedPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("archive path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp archive file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp archive file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp archive file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(ArchivedPage {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedPage {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp archive {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A uniqueness constraint rejected an insert: the entity already exists
    /// and the caller should re-reconcile and update instead.
    #[error("uniqueness constraint {constraint} violated")]
    Constraint { constraint: String },
    #[error("stored row carries unknown generation tag {0:?}")]
    UnknownGeneration(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            if db.code().as_deref() == Some("23505") {
                return StoreError::Constraint {
                    constraint: db.constraint().unwrap_or("unknown").to_string(),
                };
            }
        }
        StoreError::Database(err)
    }
}

/// The store seam the crawler drives. Implemented by [`PgStore`] and by
/// in-memory fakes in the sync tests.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn clubs(&self) -> Result<Vec<Club>, StoreError>;
    async fn athletes(&self) -> Result<Vec<Athlete>, StoreError>;
    async fn clubs_active_in(&self, season: i32) -> Result<Vec<Club>, StoreError>;
    async fn find_club(&self, id: &ExternalId) -> Result<Option<Club>, StoreError>;
    async fn find_athlete(&self, id: &ExternalId) -> Result<Option<Athlete>, StoreError>;
    async fn find_athlete_by_license(&self, license: &str) -> Result<Option<Athlete>, StoreError>;
    async fn insert_club(&self, candidate: &ClubCandidate) -> Result<Club, StoreError>;
    async fn update_club(&self, id: i64, candidate: &ClubCandidate) -> Result<Club, StoreError>;
    async fn insert_athlete(&self, candidate: &AthleteCandidate) -> Result<Athlete, StoreError>;
    async fn update_athlete(
        &self,
        id: i64,
        candidate: &AthleteCandidate,
    ) -> Result<Athlete, StoreError>;
}

const CLUB_COLUMNS: &str =
    "id, external_id, generation, name, normalized_name, first_season, last_season, \
     created_at, updated_at";
const ATHLETE_COLUMNS: &str =
    "id, external_id, generation, license_id, name, normalized_name, url, birth_date, \
     sex, nationality, created_at, updated_at";

/// Postgres-backed entity store. Normalized names, update timestamps and the
/// immutability of id/created_at are enforced by the schema triggers; this
/// layer only ever writes display values.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn generation_from_row(row: &PgRow) -> Result<Generation, StoreError> {
    let tag: String = row.try_get("generation").map_err(StoreError::from)?;
    Generation::parse(&tag).ok_or(StoreError::UnknownGeneration(tag))
}

fn club_from_row(row: &PgRow) -> Result<Club, StoreError> {
    let generation = generation_from_row(row)?;
    Ok(Club {
        id: row.try_get("id")?,
        external_id: ExternalId {
            raw: row.try_get("external_id")?,
            generation,
        },
        name: row.try_get("name")?,
        normalized_name: row.try_get("normalized_name")?,
        first_season: row.try_get("first_season")?,
        last_season: row.try_get("last_season")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn athlete_from_row(row: &PgRow) -> Result<Athlete, StoreError> {
    let generation = generation_from_row(row)?;
    Ok(Athlete {
        id: row.try_get("id")?,
        external_id: ExternalId {
            raw: row.try_get("external_id")?,
            generation,
        },
        license_id: row.try_get("license_id")?,
        name: row.try_get("name")?,
        normalized_name: row.try_get("normalized_name")?,
        url: row.try_get("url")?,
        birth_date: row.try_get("birth_date")?,
        sex: row.try_get("sex")?,
        nationality: row.try_get("nationality")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl EntityStore for PgStore {
    async fn clubs(&self) -> Result<Vec<Club>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {CLUB_COLUMNS} FROM clubs ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(club_from_row).collect()
    }

    async fn athletes(&self) -> Result<Vec<Athlete>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {ATHLETE_COLUMNS} FROM athletes ORDER BY id"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(athlete_from_row).collect()
    }

    async fn clubs_active_in(&self, season: i32) -> Result<Vec<Club>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CLUB_COLUMNS} FROM clubs \
             WHERE first_season <= $1 AND last_season >= $1 ORDER BY id"
        ))
        .bind(season)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(club_from_row).collect()
    }

    async fn find_club(&self, id: &ExternalId) -> Result<Option<Club>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CLUB_COLUMNS} FROM clubs WHERE external_id = $1 AND generation = $2"
        ))
        .bind(&id.raw)
        .bind(id.generation.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(club_from_row).transpose()
    }

    async fn find_athlete(&self, id: &ExternalId) -> Result<Option<Athlete>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ATHLETE_COLUMNS} FROM athletes WHERE external_id = $1 AND generation = $2"
        ))
        .bind(&id.raw)
        .bind(id.generation.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(athlete_from_row).transpose()
    }

    async fn find_athlete_by_license(&self, license: &str) -> Result<Option<Athlete>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ATHLETE_COLUMNS} FROM athletes WHERE license_id = $1 LIMIT 1"
        ))
        .bind(license)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(athlete_from_row).transpose()
    }

    async fn insert_club(&self, candidate: &ClubCandidate) -> Result<Club, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO clubs (external_id, generation, name, first_season, last_season) \
             VALUES ($1, $2, $3, $4, $4) \
             RETURNING {CLUB_COLUMNS}"
        ))
        .bind(&candidate.external_id.raw)
        .bind(candidate.external_id.generation.as_str())
        .bind(&candidate.name)
        .bind(candidate.season)
        .fetch_one(&self.pool)
        .await?;
        club_from_row(&row)
    }

    async fn update_club(&self, id: i64, candidate: &ClubCandidate) -> Result<Club, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE clubs \
                SET name = $2, \
                    first_season = LEAST(first_season, $3), \
                    last_season = GREATEST(last_season, $3) \
              WHERE id = $1 \
             RETURNING {CLUB_COLUMNS}"
        ))
        .bind(id)
        .bind(&candidate.name)
        .bind(candidate.season)
        .fetch_one(&self.pool)
        .await?;
        club_from_row(&row)
    }

    async fn insert_athlete(&self, candidate: &AthleteCandidate) -> Result<Athlete, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO athletes \
                (external_id, generation, license_id, name, url, birth_date, sex, nationality) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {ATHLETE_COLUMNS}"
        ))
        .bind(&candidate.external_id.raw)
        .bind(candidate.external_id.generation.as_str())
        .bind(&candidate.license_id)
        .bind(&candidate.name)
        .bind(profile_url(&candidate.external_id))
        .bind(&candidate.birth_date)
        .bind(&candidate.sex)
        .bind(&candidate.nationality)
        .fetch_one(&self.pool)
        .await?;
        athlete_from_row(&row)
    }

    async fn update_athlete(
        &self,
        id: i64,
        candidate: &AthleteCandidate,
    ) -> Result<Athlete, StoreError> {
        // An absent candidate field is an unobserved one; COALESCE keeps the
        // previously observed value instead of erasing it.
        let row = sqlx::query(&format!(
            "UPDATE athletes \
                SET name = $2, \
                    license_id = COALESCE($3, license_id), \
                    birth_date = COALESCE($4, birth_date), \
                    sex = COALESCE($5, sex), \
                    nationality = COALESCE($6, nationality) \
              WHERE id = $1 \
             RETURNING {ATHLETE_COLUMNS}"
        ))
        .bind(id)
        .bind(&candidate.name)
        .bind(&candidate.license_id)
        .bind(&candidate.birth_date)
        .bind(&candidate.sex)
        .bind(&candidate.nationality)
        .fetch_one(&self.pool)
        .await?;
        athlete_from_row(&row)
    }
}
