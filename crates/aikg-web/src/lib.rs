//! Axum admin API for AIKG: websites, articles and subscriptions.

use std::future::Future;
use std::sync::Arc;

use aikg_core::{
    ArticleId, ArticleStatus, NewSubscription, NewWebsite, SubscriptionId, WebsiteId,
};
use aikg_storage::{ArticleStore, Store, StoreError, WebsiteStore};
use aikg_sync::{
    AikgRuntime, ManualScrape, SubscriptionError, SubscriptionScheduler, SubscriptionService,
    WebsiteScrapeScheduler,
};
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "aikg-web";

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub scraper: Arc<WebsiteScrapeScheduler>,
    pub subscriptions: Arc<SubscriptionService>,
    pub sender: Arc<SubscriptionScheduler>,
}

impl AppState {
    pub fn from_runtime(runtime: &AikgRuntime) -> Self {
        Self {
            store: Arc::clone(&runtime.store),
            scraper: Arc::clone(&runtime.scraper),
            subscriptions: Arc::clone(&runtime.subscriptions),
            sender: Arc::clone(&runtime.sender),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ArticleQuery {
    status: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionQuery {
    reader_email: Option<String>,
    area: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScheduleBody {
    #[serde(default)]
    schedule_cron: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/websites", get(list_websites_handler).post(create_website_handler))
        .route(
            "/api/websites/reset-retry-count",
            post(reset_retry_count_handler),
        )
        .route(
            "/api/websites/{id}",
            get(get_website_handler).put(update_website_handler),
        )
        .route("/api/websites/{id}/toggle", patch(toggle_website_handler))
        .route("/api/websites/{id}/scrape", post(scrape_website_handler))
        .route("/api/articles", get(list_articles_handler))
        .route("/api/articles/{id}", get(get_article_handler))
        .route(
            "/api/subscriptions",
            get(list_subscriptions_handler).post(create_subscription_handler),
        )
        .route(
            "/api/subscriptions/{id}",
            get(get_subscription_handler)
                .put(update_subscription_handler)
                .delete(delete_subscription_handler),
        )
        .route(
            "/api/subscriptions/{id}/activate",
            put(activate_subscription_handler),
        )
        .route(
            "/api/subscriptions/{id}/deactivate",
            put(deactivate_subscription_handler),
        )
        .route(
            "/api/subscriptions/{id}/schedule",
            put(schedule_subscription_handler),
        )
        .route(
            "/api/subscriptions/{id}/test-send",
            post(test_send_handler),
        )
        .with_state(Arc::new(state))
}

/// Serves the admin API on `bind` until `shutdown` resolves.
pub async fn serve<F>(state: AppState, bind: &str, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "admin api listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({ "status": "ok" })).into_response()
}

async fn list_websites_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.list_websites().await {
        Ok(websites) => Json(websites).into_response(),
        Err(err) => store_error(err),
    }
}

async fn get_website_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<WebsiteId>,
) -> Response {
    match state.store.get_website(id).await {
        Ok(Some(website)) => Json(website).into_response(),
        Ok(None) => not_found(format!("website {id} not found")),
        Err(err) => store_error(err),
    }
}

async fn create_website_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewWebsite>,
) -> Response {
    let website = match validate_website(body) {
        Ok(website) => website,
        Err(message) => return bad_request(message),
    };
    match state.store.insert_website(website).await {
        Ok(created) => {
            info!(website_id = created.id, name = %created.name, "website created");
            (StatusCode::CREATED, Json(created)).into_response()
        }
        Err(err) => store_error(err),
    }
}

async fn update_website_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<WebsiteId>,
    Json(body): Json<NewWebsite>,
) -> Response {
    let website = match validate_website(body) {
        Ok(website) => website,
        Err(message) => return bad_request(message),
    };
    match state.store.update_website(id, website).await {
        Ok(Some(updated)) => Json(updated).into_response(),
        Ok(None) => not_found(format!("website {id} not found")),
        Err(err) => store_error(err),
    }
}

async fn toggle_website_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<WebsiteId>,
) -> Response {
    let current = match state.store.get_website(id).await {
        Ok(Some(website)) => website,
        Ok(None) => return not_found(format!("website {id} not found")),
        Err(err) => return store_error(err),
    };
    match state.store.set_website_enabled(id, !current.enabled).await {
        Ok(Some(updated)) => {
            info!(website_id = id, enabled = updated.enabled, "website toggled");
            Json(updated).into_response()
        }
        Ok(None) => not_found(format!("website {id} not found")),
        Err(err) => store_error(err),
    }
}

async fn scrape_website_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<WebsiteId>,
) -> Response {
    match state.scraper.manual_scrape(id).await {
        Ok(ManualScrape::Dispatched(_)) => (
            StatusCode::ACCEPTED,
            Json(json!({ "website_id": id, "status": "dispatched" })),
        )
            .into_response(),
        Ok(ManualScrape::NotFound) => not_found(format!("website {id} not found")),
        Ok(ManualScrape::AlreadyRunning) => json_error(
            StatusCode::CONFLICT,
            format!("website {id} is already being scraped"),
        ),
        Err(err) => server_error(err),
    }
}

async fn reset_retry_count_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.scraper.reset_trigger().await {
        Ok(reset) => Json(json!({ "reset": reset })).into_response(),
        Err(err) => server_error(err),
    }
}

async fn list_articles_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ArticleQuery>,
) -> Response {
    let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => match ArticleStatus::parse(raw) {
            Some(status) => Some(status),
            None => return bad_request(format!("unknown article status {raw:?}")),
        },
        None => None,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0);

    match state.store.list_articles(status, limit, offset).await {
        Ok(articles) => Json(articles).into_response(),
        Err(err) => store_error(err),
    }
}

async fn get_article_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<ArticleId>,
) -> Response {
    match state.store.get_article(id).await {
        Ok(Some(article)) => Json(article).into_response(),
        Ok(None) => not_found(format!("article {id} not found")),
        Err(err) => store_error(err),
    }
}

async fn list_subscriptions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SubscriptionQuery>,
) -> Response {
    let email = query.reader_email.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let area = query.area.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let result = match (email, area) {
        (Some(email), _) => state.subscriptions.find_by_email(email).await,
        (None, Some(area)) => state.subscriptions.find_by_area(area).await,
        (None, None) => state.subscriptions.list().await,
    };
    match result {
        Ok(subscriptions) => Json(subscriptions).into_response(),
        Err(err) => subscription_error(err),
    }
}

async fn get_subscription_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<SubscriptionId>,
) -> Response {
    match state.subscriptions.get(id).await {
        Ok(subscription) => Json(subscription).into_response(),
        Err(err) => subscription_error(err),
    }
}

async fn create_subscription_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<NewSubscription>,
) -> Response {
    match state.subscriptions.create(body).await {
        Ok(created) => (StatusCode::CREATED, Json(created)).into_response(),
        Err(err) => subscription_error(err),
    }
}

async fn update_subscription_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<SubscriptionId>,
    Json(body): Json<NewSubscription>,
) -> Response {
    match state.subscriptions.update(id, body).await {
        Ok(updated) => Json(updated).into_response(),
        Err(err) => subscription_error(err),
    }
}

async fn delete_subscription_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<SubscriptionId>,
) -> Response {
    match state.subscriptions.delete(id).await {
        Ok(removed) => Json(removed).into_response(),
        Err(err) => subscription_error(err),
    }
}

async fn activate_subscription_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<SubscriptionId>,
) -> Response {
    match state.subscriptions.activate(id).await {
        Ok(subscription) => Json(subscription).into_response(),
        Err(err) => subscription_error(err),
    }
}

async fn deactivate_subscription_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<SubscriptionId>,
) -> Response {
    match state.subscriptions.deactivate(id).await {
        Ok(subscription) => Json(subscription).into_response(),
        Err(err) => subscription_error(err),
    }
}

async fn schedule_subscription_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<SubscriptionId>,
    Json(body): Json<ScheduleBody>,
) -> Response {
    match state
        .subscriptions
        .update_schedule_cron(id, body.schedule_cron)
        .await
    {
        Ok(subscription) => Json(subscription).into_response(),
        Err(err) => subscription_error(err),
    }
}

/// Runs one send job for the subscription in the background.
async fn test_send_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<SubscriptionId>,
) -> Response {
    if let Err(err) = state.subscriptions.get(id).await {
        return subscription_error(err);
    }
    let sender = Arc::clone(&state.sender);
    tokio::spawn(async move {
        match sender.send_now(id).await {
            Ok(content) => info!(subscription_id = %id, title = %content.title, "test send delivered"),
            Err(err) => warn!(subscription_id = %id, error = ?err, "test send failed"),
        }
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({ "subscription_id": id, "status": "dispatched" })),
    )
        .into_response()
}

fn validate_website(website: NewWebsite) -> Result<NewWebsite, String> {
    let name = website.name.trim();
    let url = website.url.trim();
    let base_domain = website.base_domain.trim().trim_end_matches('/');
    if name.is_empty() {
        return Err("website name must not be empty".into());
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(format!("website url must be absolute http(s): {url:?}"));
    }
    if base_domain.is_empty() {
        return Err("website base_domain must not be empty".into());
    }
    Ok(NewWebsite {
        name: name.to_string(),
        url: url.to_string(),
        base_domain: base_domain.to_string(),
        enabled: website.enabled,
    })
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    json_error(StatusCode::BAD_REQUEST, message)
}

fn not_found(message: impl Into<String>) -> Response {
    json_error(StatusCode::NOT_FOUND, message)
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = ?err, "request failed");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, format!("Server error: {err:#}"))
}

fn store_error(err: StoreError) -> Response {
    match err {
        err @ StoreError::NotFound { .. } => not_found(err.to_string()),
        other => server_error(other.into()),
    }
}

fn subscription_error(err: SubscriptionError) -> Response {
    match err {
        SubscriptionError::Invalid(message) => bad_request(message),
        SubscriptionError::NotFound(id) => not_found(format!("subscription {id} not found")),
        SubscriptionError::Store(err) => store_error(err),
    }
}
