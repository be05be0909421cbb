//! Core domain model for the cybercrime news feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cyberfeed-core";

pub const NO_TITLE: &str = "No title available";
pub const NO_DESCRIPTION: &str = "No description available";
pub const MISSING_URL: &str = "#";

/// Unified article record shown by the feed regardless of originating provider.
///
/// `id` is only unique inside one fetch batch; use `stable_key` for anything that
/// has to survive a reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalArticle {
    pub id: String,
    pub title: String,
    pub summary: String,
    pub url: String,
    pub source: String,
    pub timestamp: String,
    #[serde(default)]
    pub liked: bool,
    #[serde(default)]
    pub bookmarked: bool,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub stable_key: String,
}

impl CanonicalArticle {
    pub fn with_bookmarked(mut self, bookmarked: bool) -> Self {
        self.bookmarked = bookmarked;
        self
    }
}

/// Content-derived key: identical for the same provider + link across fetches.
pub fn stable_article_key(source_label: &str, url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_label.as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hex::encode(hasher.finalize())
}

/// Persisted bookmark row; `article_data` is a wholesale snapshot of the article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub article_data: CanonicalArticle,
    pub created_at: DateTime<Utc>,
}

/// Authenticated user session, threaded explicitly through calls that need a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn for_user(user_id: Uuid) -> Self {
        Self {
            user_id,
            email: None,
            access_token: None,
            expires_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: Uuid,
    pub email: Option<String>,
    pub full_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Partial profile update; `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
}
