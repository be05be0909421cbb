//! Axum + Askama surface for the news feed and per-user bookmarks.

use std::sync::Arc;

use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use cyberfeed_aggregate::{
    Aggregator, BookmarkNotice, FeedConfig, FeedPager, BOOKMARK_FAILED_MESSAGE,
    LOGIN_REQUIRED_MESSAGE,
};
use cyberfeed_core::{CanonicalArticle, ProfileUpdate, Session, MISSING_URL};
use cyberfeed_storage::{handle_post_auth, BookmarkStore, PgBookmarkStore, ProfileStore, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cyberfeed-web";

/// Header carrying the signed-in user's id.
pub const USER_HEADER: &str = "x-user-id";

/// Highest page number the surface will request.
pub const MAX_PAGE: u32 = 10_000;

#[derive(Clone)]
pub struct AppState {
    pub aggregator: Arc<Aggregator>,
    pub bookmarks: Arc<dyn BookmarkStore>,
    pub profiles: Arc<dyn ProfileStore>,
}

impl AppState {
    pub fn new<S>(aggregator: Aggregator, store: Arc<S>) -> Self
    where
        S: BookmarkStore + ProfileStore + 'static,
    {
        Self {
            aggregator: Arc::new(aggregator),
            bookmarks: store.clone(),
            profiles: store,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default = "first_page")]
    page: u32,
}

fn first_page() -> u32 {
    1
}

/// One page of the feed as served to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewsPage {
    pub page: u32,
    pub articles: Vec<CanonicalArticle>,
    pub has_more: bool,
    pub message: Option<String>,
}

impl NewsPage {
    async fn load(aggregator: &Aggregator, page: u32) -> Self {
        let mut pager = FeedPager::new();
        pager.load_page(aggregator, page).await;
        Self {
            page,
            has_more: pager.has_more() && page < MAX_PAGE,
            message: pager.error().map(str::to_string),
            articles: pager.into_articles(),
        }
    }
}

/// Provider links are rendered only for http(s); anything else (`javascript:`,
/// `data:`) is dropped.
fn http_link(url: String) -> Option<String> {
    let lower = url.trim_start().to_ascii_lowercase();
    (lower.starts_with("http://") || lower.starts_with("https://")).then_some(url)
}

#[derive(Debug, Clone)]
struct ArticleView {
    id: String,
    title: String,
    summary: String,
    url: String,
    source: String,
    timestamp: String,
    image_url: String,
}

impl From<CanonicalArticle> for ArticleView {
    fn from(a: CanonicalArticle) -> Self {
        Self {
            id: a.id,
            title: a.title,
            summary: a.summary,
            url: http_link(a.url).unwrap_or_else(|| MISSING_URL.to_string()),
            source: a.source,
            timestamp: a.timestamp,
            image_url: a.image_url.and_then(http_link).unwrap_or_default(),
        }
    }
}

#[derive(Template)]
#[template(path = "feed.html")]
struct FeedTemplate {
    articles: Vec<ArticleView>,
    page: u32,
    prev_page: u32,
    next_page: u32,
    has_more: bool,
    message: String,
}

#[derive(Template)]
#[template(path = "bookmarks.html")]
struct BookmarksTemplate {
    articles: Vec<ArticleView>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn login_required() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, LOGIN_REQUIRED_MESSAGE)
    }

    /// Missing schema keeps its own message; anything else gets `fallback`.
    fn from_store(err: StoreError, fallback: &str) -> Self {
        warn!(error = %err, "bookmark store call failed");
        match err {
            StoreError::SchemaMissing => Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string()),
            StoreError::ProfileNotFound(_) => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, fallback),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(feed_page_handler))
        .route("/bookmarks", get(bookmarks_page_handler))
        .route("/api/news", get(news_handler))
        .route("/api/health", get(health_handler))
        .route("/api/bookmarks", get(list_bookmarks_handler).post(add_bookmark_handler))
        .route("/api/bookmarks/{article_id}", delete(remove_bookmark_handler))
        .route("/api/session", post(session_handler))
        .route("/api/profile", get(get_profile_handler).put(update_profile_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(port: u16, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "web server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = FeedConfig::from_env();
    let aggregator = Aggregator::from_config(&config).await?;
    let store = Arc::new(PgBookmarkStore::connect_lazy(&config.database_url)?);
    serve(config.web_port, AppState::new(aggregator, store)).await
}

/// `Ok(None)` without the header; a header that is not a UUID is a bad request.
fn viewer(headers: &HeaderMap) -> Result<Option<Uuid>, ApiError> {
    let Some(value) = headers.get(USER_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|v| Uuid::parse_str(v.trim()).ok())
        .map(Some)
        .ok_or_else(|| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid {USER_HEADER} header")))
}

fn require_viewer(headers: &HeaderMap) -> Result<Uuid, ApiError> {
    viewer(headers)?.ok_or_else(ApiError::login_required)
}

fn validate_page(page: u32) -> Result<u32, ApiError> {
    if !(1..=MAX_PAGE).contains(&page) {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("page must be between 1 and {MAX_PAGE}"),
        ));
    }
    Ok(page)
}

async fn feed_page_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Response {
    let page = query.page.clamp(1, MAX_PAGE);
    let news = NewsPage::load(&state.aggregator, page).await;
    render_html(FeedTemplate {
        articles: news.articles.into_iter().map(ArticleView::from).collect(),
        page,
        prev_page: page - 1,
        next_page: page + 1,
        has_more: news.has_more,
        message: news.message.unwrap_or_default(),
    })
}

async fn bookmarks_page_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let user_id = match require_viewer(&headers) {
        Ok(user_id) => user_id,
        Err(err) => return (err.status, Html(err.message)).into_response(),
    };
    match state.bookmarks.get_bookmarks(user_id).await {
        Ok(articles) => render_html(BookmarksTemplate {
            articles: articles.into_iter().map(ArticleView::from).collect(),
        }),
        Err(err) => server_error(anyhow::Error::new(err)),
    }
}

async fn news_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageQuery>,
) -> Result<Json<NewsPage>, ApiError> {
    let page = validate_page(query.page)?;
    Ok(Json(NewsPage::load(&state.aggregator, page).await))
}

async fn health_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let session = match viewer(&headers) {
        Ok(user_id) => user_id.map(Session::for_user),
        Err(err) => return err.into_response(),
    };
    match state.bookmarks.check_connection(session.as_ref()).await {
        Ok(connected) => Json(json!({ "connected": connected })).into_response(),
        Err(err) => ApiError::from_store(err, "bookmark backend check failed").into_response(),
    }
}

async fn list_bookmarks_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<CanonicalArticle>>, ApiError> {
    let user_id = require_viewer(&headers)?;
    let articles = state
        .bookmarks
        .get_bookmarks(user_id)
        .await
        .map_err(|err| ApiError::from_store(err, "Failed to load bookmarks"))?;
    Ok(Json(articles))
}

async fn add_bookmark_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(article): Json<CanonicalArticle>,
) -> Result<Response, ApiError> {
    let user_id = require_viewer(&headers)?;
    let record = state
        .bookmarks
        .add_bookmark(&article, user_id)
        .await
        .map_err(|err| ApiError::from_store(err, BOOKMARK_FAILED_MESSAGE))?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": BookmarkNotice::Added.message(), "bookmark": record })),
    )
        .into_response())
}

async fn remove_bookmark_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    AxumPath(article_id): AxumPath<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let user_id = require_viewer(&headers)?;
    let removed = state
        .bookmarks
        .remove_bookmark(&article_id, user_id)
        .await
        .map_err(|err| ApiError::from_store(err, BOOKMARK_FAILED_MESSAGE))?;
    Ok(Json(json!({
        "message": BookmarkNotice::Removed.message(),
        "removed": removed.len(),
    })))
}

async fn session_handler(
    State(state): State<Arc<AppState>>,
    Json(session): Json<Session>,
) -> Result<Response, ApiError> {
    let profile = handle_post_auth(state.profiles.as_ref(), &session)
        .await
        .map_err(|err| ApiError::from_store(err, "Failed to record sign-in"))?;
    Ok(Json(profile).into_response())
}

async fn get_profile_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let user_id = require_viewer(&headers)?;
    let profile = state
        .profiles
        .get_user_profile(user_id)
        .await
        .map_err(|err| ApiError::from_store(err, "Failed to load profile"))?;
    Ok(Json(profile).into_response())
}

async fn update_profile_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(update): Json<ProfileUpdate>,
) -> Result<Response, ApiError> {
    let user_id = require_viewer(&headers)?;
    let profile = state
        .profiles
        .update_user_profile(user_id, &update, Utc::now())
        .await
        .map_err(|err| ApiError::from_store(err, "Failed to update profile"))?;
    Ok(Json(profile).into_response())
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {err}")),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use cyberfeed_adapters::{AdapterError, NewsProvider};
    use cyberfeed_storage::{BackendState, HttpClientConfig, HttpFetcher, MemoryBookmarkStore};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    /// Two articles on each page up to `last_page`; every later page is empty.
    struct PagedProvider {
        last_page: u32,
    }

    #[async_trait]
    impl NewsProvider for PagedProvider {
        fn source_id(&self) -> &str {
            "fake"
        }

        fn label(&self) -> &str {
            "Fakewire"
        }

        async fn fetch_raw(&self, _http: &HttpFetcher, page: u32) -> Result<Vec<JsonValue>, AdapterError> {
            if page > self.last_page {
                return Ok(Vec::new());
            }
            Ok(vec![
                json!({"title": "Ransomware crew arrested", "url": "https://news.test/1", "urlToImage": "https://img.test/1.png"}),
                json!({"title": "Phishing kit seized", "url": "https://news.test/2"}),
            ])
        }
    }

    fn test_app_with(last_page: u32, store: Arc<MemoryBookmarkStore>) -> Router {
        let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
        let aggregator = Aggregator::new(http, vec![Box::new(PagedProvider { last_page })]);
        app(AppState::new(aggregator, store))
    }

    fn test_app(store: Arc<MemoryBookmarkStore>) -> Router {
        test_app_with(1, store)
    }

    async fn body_json(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    async fn body_text(resp: Response) -> String {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(body.to_vec()).unwrap()
    }

    fn get_req(uri: &str, user: Option<Uuid>) -> Request<Body> {
        let mut req = Request::builder().uri(uri);
        if let Some(user) = user {
            req = req.header(USER_HEADER, user.to_string());
        }
        req.body(Body::empty()).unwrap()
    }

    fn send_json(method: &str, uri: &str, user: Option<Uuid>, body: &JsonValue) -> Request<Body> {
        let mut req = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(user) = user {
            req = req.header(USER_HEADER, user.to_string());
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_get_feed_page() {
        let app = test_app(Arc::new(MemoryBookmarkStore::new()));
        let resp = app.oneshot(get_req("/", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Ransomware crew arrested"));
        assert!(text.contains("Fakewire"));
        assert!(text.contains("https://img.test/1.png"));
    }

    #[tokio::test]
    async fn news_api_pages_and_end_of_feed() {
        let app = test_app(Arc::new(MemoryBookmarkStore::new()));

        let first = body_json(app.clone().oneshot(get_req("/api/news?page=1", None)).await.unwrap()).await;
        assert_eq!(first["articles"].as_array().unwrap().len(), 2);
        assert_eq!(first["hasMore"], true);
        assert_eq!(first["articles"][0]["source"], "Fakewire");

        let second = body_json(app.clone().oneshot(get_req("/api/news?page=2", None)).await.unwrap()).await;
        assert_eq!(second["hasMore"], false);
        assert!(second["message"].is_null());

        let bad = app.oneshot(get_req("/api/news?page=0", None)).await.unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn empty_first_page_carries_message() {
        let app = test_app_with(0, Arc::new(MemoryBookmarkStore::new()));
        let page = body_json(app.clone().oneshot(get_req("/api/news", None)).await.unwrap()).await;
        assert_eq!(page["message"], cyberfeed_aggregate::NO_NEWS_MESSAGE);
        assert_eq!(page["hasMore"], false);
        assert!(page["articles"].as_array().unwrap().is_empty());

        let html = body_text(app.oneshot(get_req("/", None)).await.unwrap()).await;
        assert!(html.contains(cyberfeed_aggregate::NO_NEWS_MESSAGE));
    }

    #[tokio::test]
    async fn page_numbers_are_capped() {
        let app = test_app_with(u32::MAX, Arc::new(MemoryBookmarkStore::new()));

        let resp = app
            .clone()
            .oneshot(get_req("/?page=4294967295", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let html = body_text(resp).await;
        assert!(html.contains("/?page=9999"));
        assert!(!html.contains("/?page=10001"));

        let last = body_json(
            app.clone()
                .oneshot(get_req(&format!("/api/news?page={MAX_PAGE}"), None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(last["hasMore"], false);

        let beyond = app
            .oneshot(get_req("/api/news?page=4294967295", None))
            .await
            .unwrap();
        assert_eq!(beyond.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn only_http_links_are_rendered() {
        let app = test_app(Arc::new(MemoryBookmarkStore::new()));
        let user = Uuid::new_v4();
        let article = json!({
            "id": "x-0-1", "title": "Lure", "summary": "s",
            "url": "javascript:alert(1)", "imageUrl": "data:image/png;base64,AAAA",
            "source": "x", "timestamp": "just now"
        });
        app.clone()
            .oneshot(send_json("POST", "/api/bookmarks", Some(user), &article))
            .await
            .unwrap();

        let html = body_text(app.oneshot(get_req("/bookmarks", Some(user))).await.unwrap()).await;
        assert!(html.contains("Lure"));
        assert!(!html.contains("javascript:"));
        assert!(html.contains(r##"href="#""##));
    }

    #[test]
    fn http_link_accepts_only_web_schemes() {
        assert_eq!(http_link("HTTPS://news.test/a".into()).as_deref(), Some("HTTPS://news.test/a"));
        assert_eq!(http_link("http://news.test/a".into()).as_deref(), Some("http://news.test/a"));
        assert_eq!(http_link(" javascript:alert(1)".into()), None);
        assert_eq!(http_link("#".into()), None);
    }

    #[tokio::test]
    async fn bookmark_endpoints_require_a_user() {
        let app = test_app(Arc::new(MemoryBookmarkStore::new()));
        let resp = app.clone().oneshot(get_req("/api/bookmarks", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(resp).await["error"], LOGIN_REQUIRED_MESSAGE);

        let resp = app
            .oneshot(
                Request::builder()
                    .uri("/api/bookmarks")
                    .header(USER_HEADER, "not-a-uuid")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn bookmark_add_list_remove() {
        let app = test_app(Arc::new(MemoryBookmarkStore::new()));
        let user = Uuid::new_v4();

        let news = body_json(app.clone().oneshot(get_req("/api/news", None)).await.unwrap()).await;
        let article = news["articles"][0].clone();
        let article_id = article["id"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(send_json("POST", "/api/bookmarks", Some(user), &article))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        assert_eq!(body_json(resp).await["message"], "Article bookmarked successfully");

        let listed = body_json(app.clone().oneshot(get_req("/api/bookmarks", Some(user))).await.unwrap()).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["bookmarked"], true);

        let page = body_text(app.clone().oneshot(get_req("/bookmarks", Some(user))).await.unwrap()).await;
        assert!(page.contains("Ransomware crew arrested"));

        let resp = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/api/bookmarks/{article_id}"))
                    .header(USER_HEADER, user.to_string())
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let removed = body_json(resp).await;
        assert_eq!(removed["removed"], 1);
        assert_eq!(removed["message"], "Bookmark removed successfully");

        let listed = body_json(app.oneshot(get_req("/api/bookmarks", Some(user))).await.unwrap()).await;
        assert!(listed.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_bookmark_write_reports_alert_text() {
        let store = Arc::new(MemoryBookmarkStore::new());
        store.set_state(BackendState::Unreachable).await;
        let app = test_app(store);
        let article = json!({
            "id": "x-0-1", "title": "t", "summary": "s", "url": "#",
            "source": "x", "timestamp": "just now"
        });
        let resp = app
            .oneshot(send_json("POST", "/api/bookmarks", Some(Uuid::new_v4()), &article))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["error"], BOOKMARK_FAILED_MESSAGE);
    }

    #[tokio::test]
    async fn health_reports_backend_state() {
        let store = Arc::new(MemoryBookmarkStore::new());
        let app = test_app(store.clone());

        let ok = body_json(app.clone().oneshot(get_req("/api/health", None)).await.unwrap()).await;
        assert_eq!(ok["connected"], true);

        store.set_state(BackendState::Unreachable).await;
        let down = body_json(app.clone().oneshot(get_req("/api/health", None)).await.unwrap()).await;
        assert_eq!(down["connected"], false);

        store.set_state(BackendState::SchemaMissing).await;
        let resp = app.oneshot(get_req("/api/health", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_json(resp).await["error"],
            "Database setup required. Contact administrator."
        );
    }

    #[tokio::test]
    async fn session_creates_profile_then_profile_updates() {
        let app = test_app(Arc::new(MemoryBookmarkStore::new()));
        let user = Uuid::new_v4();

        let missing = app.clone().oneshot(get_req("/api/profile", Some(user))).await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let session = json!({ "userId": user, "email": "analyst@example.test" });
        let resp = app
            .clone()
            .oneshot(send_json("POST", "/api/session", None, &session))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let profile = body_json(resp).await;
        assert_eq!(profile["email"], "analyst@example.test");

        let update = json!({ "fullName": "Dana Analyst" });
        let updated = body_json(
            app.clone()
                .oneshot(send_json("PUT", "/api/profile", Some(user), &update))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(updated["fullName"], "Dana Analyst");
        assert_eq!(updated["email"], "analyst@example.test");

        let fetched = body_json(app.oneshot(get_req("/api/profile", Some(user))).await.unwrap()).await;
        assert_eq!(fetched["fullName"], "Dana Analyst");
    }
}
