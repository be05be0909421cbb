//! Bookmark/profile persistence gateway + HTTP fetch utilities for the news feed.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cyberfeed_core::{BookmarkRecord, CanonicalArticle, Profile, ProfileUpdate, Session};
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cyberfeed-storage";

/// Postgres SQLSTATE for a relation that does not exist.
const UNDEFINED_TABLE: &str = "42P01";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn json(&self) -> Result<JsonValue, FetchError> {
        serde_json::from_slice(&self.body).map_err(|source| FetchError::Decode {
            url: self.final_url.clone(),
            source,
        })
    }
}

/// Scheme, host and path only.
fn redacted_url(url: &reqwest::Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.to_string()
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("malformed payload from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
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
        Ok(Self { client })
    }

    /// Single GET, no retries. Non-2xx statuses come back as `FetchError::HttpStatus`.
    ///
    /// Query strings carry provider API keys, so no URL inside a returned error
    /// or response has one.
    pub async fn get(
        &self,
        source_id: &str,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        async move {
            let mut request = self.client.get(url).query(query);
            for (name, value) in headers {
                request = request.header(*name, value.as_str());
            }

            let resp = request.send().await.map_err(reqwest::Error::without_url)?;
            let status = resp.status();
            let final_url = redacted_url(resp.url());

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp
                .bytes()
                .await
                .map_err(reqwest::Error::without_url)?
                .to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database setup required. Contact administrator.")]
    SchemaMissing,
    #[error("bookmark backend unavailable: {0}")]
    Unavailable(String),
    #[error("profile not found for user {0}")]
    ProfileNotFound(Uuid),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("article snapshot could not be encoded: {0}")]
    Snapshot(#[from] serde_json::Error),
}

/// Per-user bookmark collection. Every backend error reaches the caller unchanged.
#[async_trait]
pub trait BookmarkStore: Send + Sync {
    /// `Ok(false)` for an unreachable backend or a failed session check,
    /// `Err(StoreError::SchemaMissing)` when the bookmarks table is not provisioned.
    async fn check_connection(&self, session: Option<&Session>) -> Result<bool, StoreError>;

    async fn add_bookmark(
        &self,
        article: &CanonicalArticle,
        user_id: Uuid,
    ) -> Result<BookmarkRecord, StoreError>;

    /// Deletes every bookmark of `user_id` whose snapshot carries `article_id`.
    async fn remove_bookmark(
        &self,
        article_id: &str,
        user_id: Uuid,
    ) -> Result<Vec<BookmarkRecord>, StoreError>;

    /// Snapshots for `user_id`, newest first.
    async fn get_bookmarks(&self, user_id: Uuid) -> Result<Vec<CanonicalArticle>, StoreError>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn find_user_profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError>;

    async fn create_user_profile(
        &self,
        user_id: Uuid,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Profile, StoreError>;

    /// Applies `update` and bumps `updated_at`.
    async fn update_user_profile(
        &self,
        user_id: Uuid,
        update: &ProfileUpdate,
        now: DateTime<Utc>,
    ) -> Result<Profile, StoreError>;

    async fn get_user_profile(&self, user_id: Uuid) -> Result<Profile, StoreError> {
        self.find_user_profile(user_id)
            .await?
            .ok_or(StoreError::ProfileNotFound(user_id))
    }
}

/// First sign-in creates the profile; later sign-ins bump `last_login`.
pub async fn handle_post_auth(
    store: &dyn ProfileStore,
    session: &Session,
) -> Result<Profile, StoreError> {
    let now = Utc::now();
    match store.find_user_profile(session.user_id).await? {
        None => {
            info!(user_id = %session.user_id, "creating profile on first sign-in");
            store
                .create_user_profile(session.user_id, session.email.as_deref(), now)
                .await
        }
        Some(_) => {
            let update = ProfileUpdate {
                last_login: Some(now),
                ..Default::default()
            };
            store.update_user_profile(session.user_id, &update, now).await
        }
    }
}

fn session_check_fails(session: Option<&Session>) -> bool {
    match session {
        Some(session) if session.is_expired_at(Utc::now()) => {
            warn!(user_id = %session.user_id, "auth session expired");
            true
        }
        _ => false,
    }
}

fn is_undefined_table(err: &sqlx::Error) -> bool {
    matches!(
        err.as_database_error().and_then(|db| db.code()).as_deref(),
        Some(UNDEFINED_TABLE)
    )
}

#[derive(Debug, Clone)]
pub struct PgBookmarkStore {
    pool: PgPool,
}

impl PgBookmarkStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    /// Pool that only dials the database on first use, so an offline backend
    /// surfaces through `check_connection` instead of at startup.
    pub fn connect_lazy(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn bookmark_from_row(row: &PgRow) -> Result<BookmarkRecord, sqlx::Error> {
    let Json(article_data): Json<CanonicalArticle> = row.try_get("article_data")?;
    Ok(BookmarkRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        article_data,
        created_at: row.try_get("created_at")?,
    })
}

fn profile_from_row(row: &PgRow) -> Result<Profile, sqlx::Error> {
    Ok(Profile {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        full_name: row.try_get("full_name")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        last_login: row.try_get("last_login")?,
    })
}

#[async_trait]
impl BookmarkStore for PgBookmarkStore {
    async fn check_connection(&self, session: Option<&Session>) -> Result<bool, StoreError> {
        if session_check_fails(session) {
            return Ok(false);
        }

        match sqlx::query("SELECT id FROM bookmarks LIMIT 1")
            .fetch_optional(&self.pool)
            .await
        {
            Ok(_) => {
                info!("bookmark store connection successful");
                Ok(true)
            }
            Err(err) if is_undefined_table(&err) => {
                error!("bookmarks table does not exist; run the migrations");
                Err(StoreError::SchemaMissing)
            }
            Err(err) => {
                error!(error = %err, "bookmark store unreachable");
                Ok(false)
            }
        }
    }

    async fn add_bookmark(
        &self,
        article: &CanonicalArticle,
        user_id: Uuid,
    ) -> Result<BookmarkRecord, StoreError> {
        info!(%user_id, article_id = %article.id, "adding bookmark");
        let row = sqlx::query(
            r#"
            INSERT INTO bookmarks (id, user_id, article_data, created_at)
            VALUES ($1, $2, $3, $4)
            RETURNING id, user_id, article_data, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(Json(article))
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .inspect_err(|err| error!(error = %err, "bookmark insert failed"))?;
        Ok(bookmark_from_row(&row)?)
    }

    async fn remove_bookmark(
        &self,
        article_id: &str,
        user_id: Uuid,
    ) -> Result<Vec<BookmarkRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            DELETE FROM bookmarks
             WHERE user_id = $1
               AND article_data->>'id' = $2
            RETURNING id, user_id, article_data, created_at
            "#,
        )
        .bind(user_id)
        .bind(article_id)
        .fetch_all(&self.pool)
        .await
        .inspect_err(|err| error!(error = %err, "bookmark delete failed"))?;
        Ok(rows
            .iter()
            .map(bookmark_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn get_bookmarks(&self, user_id: Uuid) -> Result<Vec<CanonicalArticle>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT article_data
              FROM bookmarks
             WHERE user_id = $1
             ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .inspect_err(|err| error!(error = %err, "bookmark listing failed"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let Json(article): Json<CanonicalArticle> = row.try_get("article_data")?;
            out.push(article.with_bookmarked(true));
        }
        Ok(out)
    }
}

#[async_trait]
impl ProfileStore for PgBookmarkStore {
    async fn find_user_profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, email, full_name, created_at, updated_at, last_login
              FROM profiles
             WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(profile_from_row).transpose()?)
    }

    async fn create_user_profile(
        &self,
        user_id: Uuid,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Profile, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO profiles (id, email, created_at, updated_at, last_login)
            VALUES ($1, $2, $3, $3, $3)
            RETURNING id, email, full_name, created_at, updated_at, last_login
            "#,
        )
        .bind(user_id)
        .bind(email)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .inspect_err(|err| error!(error = %err, "profile insert failed"))?;
        Ok(profile_from_row(&row)?)
    }

    async fn update_user_profile(
        &self,
        user_id: Uuid,
        update: &ProfileUpdate,
        now: DateTime<Utc>,
    ) -> Result<Profile, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE profiles
               SET email = COALESCE($2, email),
                   full_name = COALESCE($3, full_name),
                   last_login = COALESCE($4, last_login),
                   updated_at = $5
             WHERE id = $1
            RETURNING id, email, full_name, created_at, updated_at, last_login
            "#,
        )
        .bind(user_id)
        .bind(update.email.as_deref())
        .bind(update.full_name.as_deref())
        .bind(update.last_login)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(profile_from_row(&row)?),
            None => Err(StoreError::ProfileNotFound(user_id)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendState {
    #[default]
    Available,
    Unreachable,
    SchemaMissing,
}

#[derive(Debug, Default)]
struct MemoryInner {
    state: BackendState,
    bookmarks: Vec<BookmarkRecord>,
    profiles: HashMap<Uuid, Profile>,
}

impl MemoryInner {
    fn ensure_available(&self) -> Result<(), StoreError> {
        match self.state {
            BackendState::Available => Ok(()),
            BackendState::Unreachable => {
                Err(StoreError::Unavailable("backend unreachable".to_string()))
            }
            BackendState::SchemaMissing => Err(StoreError::SchemaMissing),
        }
    }
}

/// In-process store with the same contract as the Postgres gateway.
#[derive(Debug, Default)]
pub struct MemoryBookmarkStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryBookmarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_state(&self, state: BackendState) {
        self.inner.lock().await.state = state;
    }
}

#[async_trait]
impl BookmarkStore for MemoryBookmarkStore {
    async fn check_connection(&self, session: Option<&Session>) -> Result<bool, StoreError> {
        if session_check_fails(session) {
            return Ok(false);
        }
        match self.inner.lock().await.state {
            BackendState::Available => Ok(true),
            BackendState::Unreachable => Ok(false),
            BackendState::SchemaMissing => Err(StoreError::SchemaMissing),
        }
    }

    async fn add_bookmark(
        &self,
        article: &CanonicalArticle,
        user_id: Uuid,
    ) -> Result<BookmarkRecord, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_available()?;
        let record = BookmarkRecord {
            id: Uuid::new_v4(),
            user_id,
            article_data: article.clone(),
            created_at: Utc::now(),
        };
        inner.bookmarks.push(record.clone());
        Ok(record)
    }

    async fn remove_bookmark(
        &self,
        article_id: &str,
        user_id: Uuid,
    ) -> Result<Vec<BookmarkRecord>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_available()?;
        let (removed, kept): (Vec<_>, Vec<_>) = inner
            .bookmarks
            .drain(..)
            .partition(|b| b.user_id == user_id && b.article_data.id == article_id);
        inner.bookmarks = kept;
        Ok(removed)
    }

    async fn get_bookmarks(&self, user_id: Uuid) -> Result<Vec<CanonicalArticle>, StoreError> {
        let inner = self.inner.lock().await;
        inner.ensure_available()?;
        // Reverse first so equal timestamps still list the later insert first.
        let mut rows = inner
            .bookmarks
            .iter()
            .rev()
            .filter(|b| b.user_id == user_id)
            .collect::<Vec<_>>();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows
            .into_iter()
            .map(|b| b.article_data.clone().with_bookmarked(true))
            .collect())
    }
}

#[async_trait]
impl ProfileStore for MemoryBookmarkStore {
    async fn find_user_profile(&self, user_id: Uuid) -> Result<Option<Profile>, StoreError> {
        let inner = self.inner.lock().await;
        inner.ensure_available()?;
        Ok(inner.profiles.get(&user_id).cloned())
    }

    async fn create_user_profile(
        &self,
        user_id: Uuid,
        email: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Profile, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_available()?;
        let profile = Profile {
            id: user_id,
            email: email.map(str::to_string),
            full_name: None,
            created_at: now,
            updated_at: now,
            last_login: Some(now),
        };
        inner.profiles.insert(user_id, profile.clone());
        Ok(profile)
    }

    async fn update_user_profile(
        &self,
        user_id: Uuid,
        update: &ProfileUpdate,
        now: DateTime<Utc>,
    ) -> Result<Profile, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.ensure_available()?;
        let profile = inner
            .profiles
            .get_mut(&user_id)
            .ok_or(StoreError::ProfileNotFound(user_id))?;
        if let Some(email) = &update.email {
            profile.email = Some(email.clone());
        }
        if let Some(full_name) = &update.full_name {
            profile.full_name = Some(full_name.clone());
        }
        if let Some(last_login) = update.last_login {
            profile.last_login = Some(last_login);
        }
        profile.updated_at = now;
        Ok(profile.clone())
    }
}
