//! Caller-side feed state: page cursor, loading guard, and per-item like/bookmark flags.

use cyberfeed_core::{CanonicalArticle, Session};
use cyberfeed_storage::{BookmarkStore, StoreError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{AggregateError, Aggregator};

pub const NO_NEWS_MESSAGE: &str = "No news available at the moment. Please try again later.";
pub const LOGIN_REQUIRED_MESSAGE: &str = "Please log in to bookmark articles";
pub const BOOKMARK_FAILED_MESSAGE: &str = "Failed to update bookmark";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Append,
    Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookmarkNotice {
    Added,
    Removed,
}

impl BookmarkNotice {
    pub fn message(self) -> &'static str {
        match self {
            Self::Added => "Article bookmarked successfully",
            Self::Removed => "Bookmark removed successfully",
        }
    }
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Please log in to bookmark articles")]
    LoginRequired,
    #[error("article {0} is not in the feed")]
    UnknownArticle(String),
    #[error("Failed to update bookmark")]
    Bookmark(#[source] StoreError),
}

/// Accumulated feed for one viewer.
///
/// The web and CLI surfaces address pages directly through `load_page`; an
/// interactive client drives `load_initial`/`load_more`/`refresh`.
#[derive(Debug, Clone)]
pub struct FeedPager {
    articles: Vec<CanonicalArticle>,
    page: u32,
    has_more: bool,
    loading: bool,
    error: Option<String>,
}

impl Default for FeedPager {
    fn default() -> Self {
        Self {
            articles: Vec::new(),
            page: 0,
            has_more: true,
            loading: false,
            error: None,
        }
    }
}

impl FeedPager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn articles(&self) -> &[CanonicalArticle] {
        &self.articles
    }

    /// Last page successfully loaded; 0 before the first load.
    pub fn page(&self) -> u32 {
        self.page
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn is_loading(&self) -> bool {
        self.loading
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn into_articles(self) -> Vec<CanonicalArticle> {
        self.articles
    }

    pub fn next_page(&self) -> u32 {
        self.page.saturating_add(1)
    }

    /// Claims the loading flag. `None` while another load is in flight, or when
    /// appending past the end of the feed.
    pub fn begin_load(&mut self, mode: LoadMode) -> Option<u32> {
        if self.loading {
            debug!("load already in flight; ignoring request");
            return None;
        }
        let page = match mode {
            LoadMode::Replace => 1,
            LoadMode::Append if !self.has_more => return None,
            LoadMode::Append => self.next_page(),
        };
        self.loading = true;
        Some(page)
    }

    pub fn finish_load(
        &mut self,
        page: u32,
        mode: LoadMode,
        result: Result<Vec<CanonicalArticle>, AggregateError>,
    ) {
        self.loading = false;
        match result {
            Ok(articles) => {
                self.has_more = !articles.is_empty();
                match mode {
                    LoadMode::Replace => self.articles = articles,
                    LoadMode::Append => self.articles.extend(articles),
                }
                self.page = page;
                self.error = None;
            }
            Err(err) if page == 1 => {
                warn!(error = %err, "first page unavailable");
                self.has_more = false;
                self.error = Some(NO_NEWS_MESSAGE.to_string());
            }
            Err(err) => {
                debug!(page, error = %err, "end of feed");
                self.has_more = false;
            }
        }
    }

    async fn load(&mut self, aggregator: &Aggregator, mode: LoadMode) -> bool {
        let Some(page) = self.begin_load(mode) else {
            return false;
        };
        let result = aggregator.fetch_news(page).await;
        self.finish_load(page, mode, result);
        true
    }

    /// Returns whether a fetch was issued.
    pub async fn load_initial(&mut self, aggregator: &Aggregator) -> bool {
        self.load(aggregator, LoadMode::Replace).await
    }

    pub async fn refresh(&mut self, aggregator: &Aggregator) -> bool {
        self.has_more = true;
        self.load(aggregator, LoadMode::Replace).await
    }

    pub async fn load_more(&mut self, aggregator: &Aggregator) -> bool {
        self.load(aggregator, LoadMode::Append).await
    }

    /// Replaces the list with exactly `page`, applying the same message and
    /// end-of-feed policy as the incremental loads.
    pub async fn load_page(&mut self, aggregator: &Aggregator, page: u32) -> bool {
        if self.loading {
            debug!(page, "load already in flight; ignoring request");
            return false;
        }
        self.loading = true;
        let result = aggregator.fetch_news(page).await;
        self.finish_load(page, LoadMode::Replace, result);
        true
    }

    /// Local only; nothing is persisted. Returns the new flag.
    pub fn toggle_like(&mut self, article_id: &str) -> Option<bool> {
        let article = self.articles.iter_mut().find(|a| a.id == article_id)?;
        article.liked = !article.liked;
        Some(article.liked)
    }

    /// Adds or removes the bookmark depending on the item's current flag. The
    /// flag only flips once the store call succeeds.
    pub async fn toggle_bookmark(
        &mut self,
        article_id: &str,
        session: Option<&Session>,
        store: &dyn BookmarkStore,
    ) -> Result<BookmarkNotice, FeedError> {
        let session = session.ok_or(FeedError::LoginRequired)?;
        let article = self
            .articles
            .iter_mut()
            .find(|a| a.id == article_id)
            .ok_or_else(|| FeedError::UnknownArticle(article_id.to_string()))?;

        let notice = if article.bookmarked {
            store
                .remove_bookmark(&article.id, session.user_id)
                .await
                .map_err(FeedError::Bookmark)?;
            BookmarkNotice::Removed
        } else {
            store
                .add_bookmark(article, session.user_id)
                .await
                .map_err(FeedError::Bookmark)?;
            BookmarkNotice::Added
        };

        article.bookmarked = !article.bookmarked;
        info!(article_id, user_id = %session.user_id, bookmarked = article.bookmarked, "bookmark toggled");
        Ok(notice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cyberfeed_adapters::{AdapterError, NewsProvider};
    use cyberfeed_storage::{BackendState, HttpClientConfig, HttpFetcher, MemoryBookmarkStore};
    use serde_json::{json, Value as JsonValue};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    /// Serves `per_page` articles per page up to `last_page`, then nothing.
    struct PagedProvider {
        last_page: u32,
        per_page: usize,
        requested: Arc<AtomicU32>,
    }

    #[async_trait]
    impl NewsProvider for PagedProvider {
        fn source_id(&self) -> &str {
            "paged"
        }

        fn label(&self) -> &str {
            "Paged"
        }

        async fn fetch_raw(&self, _http: &HttpFetcher, page: u32) -> Result<Vec<JsonValue>, AdapterError> {
            self.requested.store(page, Ordering::SeqCst);
            if page > self.last_page {
                return Ok(Vec::new());
            }
            Ok((0..self.per_page)
                .map(|i| json!({"title": format!("p{page}-{i}"), "url": format!("https://x.test/{page}/{i}")}))
                .collect())
        }
    }

    fn aggregator(last_page: u32) -> (Aggregator, Arc<AtomicU32>) {
        let requested = Arc::new(AtomicU32::new(0));
        let provider = PagedProvider {
            last_page,
            per_page: 2,
            requested: requested.clone(),
        };
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        (Aggregator::new(http, vec![Box::new(provider)]), requested)
    }

    #[tokio::test]
    async fn pages_append_until_exhausted() {
        let (aggregator, requested) = aggregator(2);
        let mut pager = FeedPager::new();

        assert!(pager.load_initial(&aggregator).await);
        assert_eq!(pager.page(), 1);
        assert_eq!(pager.articles().len(), 2);

        assert!(pager.load_more(&aggregator).await);
        assert_eq!(requested.load(Ordering::SeqCst), 2);
        assert_eq!(pager.articles().len(), 4);
        assert_eq!(pager.articles()[2].title, "p2-0");

        assert!(pager.load_more(&aggregator).await);
        assert!(!pager.has_more());
        assert_eq!(pager.page(), 2);
        assert_eq!(pager.articles().len(), 4);
        assert!(pager.error().is_none());

        assert!(!pager.load_more(&aggregator).await);
    }

    #[tokio::test]
    async fn empty_first_page_shows_message() {
        let (aggregator, _) = aggregator(0);
        let mut pager = FeedPager::new();
        pager.load_initial(&aggregator).await;
        assert_eq!(pager.error(), Some(NO_NEWS_MESSAGE));
        assert!(!pager.has_more());
        assert!(pager.articles().is_empty());
        assert!(!pager.is_loading());
    }

    #[tokio::test]
    async fn refresh_replaces_list_with_page_one() {
        let (aggregator, requested) = aggregator(3);
        let mut pager = FeedPager::new();
        pager.load_initial(&aggregator).await;
        pager.load_more(&aggregator).await;
        assert_eq!(pager.articles().len(), 4);

        pager.refresh(&aggregator).await;
        assert_eq!(requested.load(Ordering::SeqCst), 1);
        assert_eq!(pager.page(), 1);
        assert_eq!(pager.articles().len(), 2);
        assert_eq!(pager.articles()[0].title, "p1-0");
    }

    #[test]
    fn loading_flag_rejects_overlapping_requests() {
        let mut pager = FeedPager::new();
        assert_eq!(pager.begin_load(LoadMode::Replace), Some(1));
        assert_eq!(pager.begin_load(LoadMode::Append), None);
        assert_eq!(pager.begin_load(LoadMode::Replace), None);

        pager.finish_load(1, LoadMode::Replace, Err(AggregateError::NoResults { page: 1 }));
        assert!(!pager.is_loading());
        assert_eq!(pager.begin_load(LoadMode::Append), None);
        assert_eq!(pager.begin_load(LoadMode::Replace), Some(1));
    }

    #[tokio::test]
    async fn direct_page_load_replaces_and_ends_feed() {
        let (aggregator, requested) = aggregator(2);
        let mut pager = FeedPager::new();

        assert!(pager.load_page(&aggregator, 2).await);
        assert_eq!(requested.load(Ordering::SeqCst), 2);
        assert_eq!(pager.page(), 2);
        assert!(pager.has_more());
        assert_eq!(pager.articles()[0].title, "p2-0");

        pager.load_page(&aggregator, 3).await;
        assert!(!pager.has_more());
        assert!(pager.error().is_none());

        let mut fresh = FeedPager::new();
        fresh.load_page(&aggregator, 3).await;
        assert!(fresh.into_articles().is_empty());
    }

    #[test]
    fn next_page_saturates_at_the_last_page_number() {
        let mut pager = FeedPager::new();
        pager.loading = true;
        pager.finish_load(u32::MAX, LoadMode::Replace, Ok(vec![article("z")]));
        assert_eq!(pager.next_page(), u32::MAX);
    }

    fn pager_with(article: CanonicalArticle) -> FeedPager {
        let mut pager = FeedPager::new();
        pager.begin_load(LoadMode::Replace);
        pager.finish_load(1, LoadMode::Replace, Ok(vec![article]));
        pager
    }

    fn article(id: &str) -> CanonicalArticle {
        CanonicalArticle {
            id: id.to_string(),
            title: "Botnet dismantled".into(),
            summary: "Takedown".into(),
            url: "https://news.test/botnet".into(),
            source: "Example".into(),
            timestamp: "2 hours ago".into(),
            liked: false,
            bookmarked: false,
            image_url: None,
            stable_key: "k".into(),
        }
    }

    #[test]
    fn like_toggles_locally() {
        let mut pager = pager_with(article("a"));
        assert_eq!(pager.toggle_like("a"), Some(true));
        assert_eq!(pager.toggle_like("a"), Some(false));
        assert_eq!(pager.toggle_like("missing"), None);
    }

    #[tokio::test]
    async fn bookmark_requires_session() {
        let store = MemoryBookmarkStore::new();
        let mut pager = pager_with(article("a"));
        let err = pager.toggle_bookmark("a", None, &store).await.unwrap_err();
        assert!(matches!(err, FeedError::LoginRequired));
        assert_eq!(err.to_string(), LOGIN_REQUIRED_MESSAGE);
        assert!(!pager.articles()[0].bookmarked);
    }

    #[tokio::test]
    async fn bookmark_round_trip_flips_flag_and_persists() {
        let store = MemoryBookmarkStore::new();
        let session = Session::for_user(Uuid::new_v4());
        let mut pager = pager_with(article("a"));

        let notice = pager.toggle_bookmark("a", Some(&session), &store).await.unwrap();
        assert_eq!(notice, BookmarkNotice::Added);
        assert_eq!(notice.message(), "Article bookmarked successfully");
        assert!(pager.articles()[0].bookmarked);
        assert_eq!(store.get_bookmarks(session.user_id).await.unwrap().len(), 1);

        let notice = pager.toggle_bookmark("a", Some(&session), &store).await.unwrap();
        assert_eq!(notice, BookmarkNotice::Removed);
        assert!(!pager.articles()[0].bookmarked);
        assert!(store.get_bookmarks(session.user_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_bookmark_keeps_prior_state() {
        let store = MemoryBookmarkStore::new();
        store.set_state(BackendState::Unreachable).await;
        let session = Session::for_user(Uuid::new_v4());
        let mut pager = pager_with(article("a"));

        let err = pager
            .toggle_bookmark("a", Some(&session), &store)
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Bookmark(_)));
        assert_eq!(err.to_string(), BOOKMARK_FAILED_MESSAGE);
        assert!(!pager.articles()[0].bookmarked);
    }
}
