use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, patch, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tower_http::cors::CorsLayer;

use crate::{
    config::Settings,
    error::ImportError,
    fetcher::{parse_body, Fetcher},
    json_paths::{extract_paths, recommended_fields},
    live_channel::ChannelManager,
    paginate::TableState,
    poller::Poller,
    store::DashboardStore,
    utils::{now_ms, now_ts},
    views::widget_view,
    widget::{Position, Theme, Widget, WidgetConfig, WidgetKind, WidgetPatch},
};

#[derive(Clone)]
pub struct DashboardState {
    pub settings: Settings,
    pub store: DashboardStore,
    pub poller: Poller,
    pub channels: Arc<ChannelManager>,
}

pub fn router(state: DashboardState) -> Router {
    Router::new()
        .route("/api/health", get(api_health))
        .route("/api/state", get(api_state))
        .route("/api/export", get(api_export))
        .route("/api/import", post(api_import))
        .route(
            "/api/widgets",
            get(api_list_widgets)
                .post(api_add_widget)
                .put(api_set_widgets)
                .delete(api_clear_widgets),
        )
        .route("/api/widgets/{id}", patch(api_update_widget).delete(api_remove_widget))
        .route("/api/widgets/{id}/position", put(api_update_position))
        .route("/api/widgets/{id}/data", get(api_widget_data))
        .route("/api/widgets/{id}/refresh", post(api_refresh_widget))
        .route("/api/theme", get(api_theme).post(api_set_theme))
        .route("/api/theme/toggle", post(api_toggle_theme))
        .route("/api/sample", get(api_sample))
        .route("/api/proxy", get(api_proxy_get).post(api_proxy_post))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn serve_dashboard(state: DashboardState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.settings.dashboard_host, state.settings.dashboard_port)
        .parse()
        .context("dashboard addr parse")?;
    let app = router(state);

    log::info!("dashboard.start url=http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn error_response(status: StatusCode, msg: impl ToString) -> Response {
    (status, Json(json!({"ok": false, "error": msg.to_string()}))).into_response()
}

fn persist_error(e: anyhow::Error) -> Response {
    log::error!("dashboard.persist.error err={:#}", e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
}

fn not_found(id: &str) -> Response {
    error_response(StatusCode::NOT_FOUND, format!("widget {id} not found"))
}

async fn api_health(State(st): State<DashboardState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "ts": now_ts(),
        "widgets": st.store.widgets().len(),
        "feeds": st.poller.watched().len(),
        "live": {
            "url": st.settings.ws_url,
            "connections": st.channels.connection_count(),
            "connected": st.channels.is_connected(&st.settings.ws_url),
        },
    }))
}

async fn api_state(State(st): State<DashboardState>) -> impl IntoResponse {
    Json(st.store.snapshot())
}

async fn api_export(State(st): State<DashboardState>) -> Response {
    match st.store.export_config() {
        Ok(text) => (
            [
                (header::CONTENT_TYPE, "application/json".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"finboard-config-{}.json\"", now_ms()),
                ),
            ],
            text,
        )
            .into_response(),
        Err(e) => persist_error(e),
    }
}

#[derive(Deserialize)]
struct ImportQ {
    merge: Option<bool>,
}

async fn api_import(State(st): State<DashboardState>, Query(q): Query<ImportQ>, body: String) -> Response {
    match st.store.import_config(&body, q.merge.unwrap_or(false)) {
        Ok(state) => {
            st.poller.sync(&state.widgets);
            Json(state).into_response()
        }
        Err(ImportError::Parse(e)) => error_response(StatusCode::BAD_REQUEST, format!("invalid dashboard file: {e}")),
        Err(ImportError::Persist(e)) => persist_error(e),
    }
}

async fn api_list_widgets(State(st): State<DashboardState>) -> impl IntoResponse {
    Json(st.store.widgets())
}

#[derive(Deserialize)]
struct NewWidget {
    #[serde(rename = "type")]
    kind: WidgetKind,
    #[serde(default)]
    title: String,
    #[serde(default)]
    config: WidgetConfig,
    #[serde(default)]
    position: Option<Position>,
}

async fn api_add_widget(State(st): State<DashboardState>, Json(req): Json<NewWidget>) -> Response {
    let mut widget = Widget::new(req.kind, req.title, req.config);
    if let Some(position) = req.position {
        widget.position = position;
    }
    match st.store.add_widget(widget) {
        Ok(w) => {
            st.poller.start(&w);
            (StatusCode::CREATED, Json(w)).into_response()
        }
        Err(e) => persist_error(e),
    }
}

async fn api_update_widget(
    State(st): State<DashboardState>,
    Path(id): Path<String>,
    Json(patch): Json<WidgetPatch>,
) -> Response {
    match st.store.update_widget(&id, patch) {
        Ok(Some(w)) => {
            st.poller.sync(&st.store.widgets());
            Json(w).into_response()
        }
        Ok(None) => not_found(&id),
        Err(e) => persist_error(e),
    }
}

async fn api_remove_widget(State(st): State<DashboardState>, Path(id): Path<String>) -> Response {
    match st.store.remove_widget(&id) {
        Ok(true) => {
            st.poller.stop(&id);
            Json(json!({"ok": true})).into_response()
        }
        Ok(false) => not_found(&id),
        Err(e) => persist_error(e),
    }
}

async fn api_update_position(
    State(st): State<DashboardState>,
    Path(id): Path<String>,
    Json(position): Json<Position>,
) -> Response {
    match st.store.update_widget_position(&id, position) {
        Ok(true) => Json(json!({"ok": true})).into_response(),
        Ok(false) => not_found(&id),
        Err(e) => persist_error(e),
    }
}

/// Replaces the whole widget list, e.g. after a reorder.
async fn api_set_widgets(State(st): State<DashboardState>, Json(widgets): Json<Vec<Widget>>) -> Response {
    match st.store.set_widgets(widgets) {
        Ok(widgets) => {
            st.poller.sync(&widgets);
            Json(widgets).into_response()
        }
        Err(e) => persist_error(e),
    }
}

async fn api_clear_widgets(State(st): State<DashboardState>) -> Response {
    match st.store.clear_dashboard() {
        Ok(()) => {
            st.poller.sync(&[]);
            Json(json!({"ok": true})).into_response()
        }
        Err(e) => persist_error(e),
    }
}

#[derive(Deserialize)]
struct ThemeReq {
    theme: Theme,
}

async fn api_theme(State(st): State<DashboardState>) -> impl IntoResponse {
    Json(json!({"theme": st.store.theme()}))
}

async fn api_set_theme(State(st): State<DashboardState>, Json(req): Json<ThemeReq>) -> Response {
    match st.store.set_theme(req.theme) {
        Ok(()) => Json(json!({"theme": req.theme})).into_response(),
        Err(e) => persist_error(e),
    }
}

async fn api_toggle_theme(State(st): State<DashboardState>) -> Response {
    match st.store.toggle_theme() {
        Ok(theme) => Json(json!({"theme": theme})).into_response(),
        Err(e) => persist_error(e),
    }
}

#[derive(Deserialize)]
struct SampleQ {
    url: Option<String>,
    max_depth: Option<usize>,
}

/// Fetches a sample response and lists the field paths it offers.
async fn api_sample(State(st): State<DashboardState>, Query(q): Query<SampleQ>) -> Response {
    let Some(url) = q.url.filter(|u| !u.trim().is_empty()) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing url");
    };
    let max_depth = q.max_depth.unwrap_or(st.settings.sample_max_depth);
    match st.poller.fetcher().fetch_json(&url).await {
        Ok(sample) => {
            let fields = extract_paths(&sample, max_depth);
            let recommended = recommended_fields(&sample);
            Json(json!({
                "url": url,
                "max_depth": max_depth,
                "fields": fields,
                "recommended": recommended,
                "sample": sample,
            }))
            .into_response()
        }
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
    }
}

#[derive(Deserialize)]
struct DataQ {
    page: Option<usize>,
    page_size: Option<usize>,
    q: Option<String>,
}

/// Current view of a widget built from its latest snapshot.
async fn api_widget_data(
    State(st): State<DashboardState>,
    Path(id): Path<String>,
    Query(q): Query<DataQ>,
) -> Response {
    let Some(widget) = st.store.widget(&id) else {
        return not_found(&id);
    };
    let snapshot = st.poller.snapshot(&id).unwrap_or_default();
    let live = st.poller.live_series(&id);

    let page_size = q
        .page_size
        .or(widget.config.pagination.map(|p| p.page_size))
        .unwrap_or(st.settings.default_page_size);
    let mut table = TableState::new(page_size);
    table.set_filter(q.q.as_deref().unwrap_or(""));
    table.set_page(q.page.unwrap_or(1));

    let payload = snapshot.payload.clone().unwrap_or(JsonValue::Null);
    let view = widget_view(&widget, &payload, live.as_ref(), &mut table);
    Json(json!({
        "id": widget.id,
        "title": widget.title,
        "error": snapshot.error,
        "loading": snapshot.loading,
        "last_updated": snapshot.last_updated,
        "view": view,
    }))
    .into_response()
}

async fn api_refresh_widget(State(st): State<DashboardState>, Path(id): Path<String>) -> Response {
    if st.store.widget(&id).is_none() {
        return not_found(&id);
    }
    match st.poller.refresh(&id).await {
        Some(snapshot) => Json(snapshot).into_response(),
        None => error_response(StatusCode::CONFLICT, format!("widget {id} is not being polled")),
    }
}

#[derive(Deserialize)]
struct ProxyQ {
    url: Option<String>,
}

async fn api_proxy_get(State(st): State<DashboardState>, Query(q): Query<ProxyQ>) -> Response {
    proxy(st.poller.fetcher(), q.url).await
}

async fn api_proxy_post(State(st): State<DashboardState>, body: Bytes) -> Response {
    let url = serde_json::from_slice::<JsonValue>(&body)
        .ok()
        .and_then(|v| v.get("url").and_then(JsonValue::as_str).map(str::to_string));
    proxy(st.poller.fetcher(), url).await
}

/// Mirrors the upstream status; the body is relayed as JSON when it parses,
/// otherwise as text.
async fn proxy(fetcher: &Fetcher, url: Option<String>) -> Response {
    let Some(url) = url.filter(|u| !u.is_empty()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "Missing url"}))).into_response();
    };
    match fetcher.upstream(&url).await {
        Ok((status, text)) => match parse_body(&text) {
            JsonValue::String(_) => (status, text).into_response(),
            v => (status, Json(v)).into_response(),
        },
        Err(e) => {
            log::error!("proxy.error url={} err={}", url, e);
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response()
        }
    }
}
