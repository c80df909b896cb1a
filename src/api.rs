//! Control-plane HTTP API: status, config validation and apply, Lite route
//! management and the event stream.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use futures::stream::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::{Config, FallbackStatus, RouteConfig, ServerConfig};
use crate::error::ProxyError;
use crate::events::{Event, EventBus, EventFilter, EventKind};
use crate::lite::strategy::{parse_backend, Strategy, StrategyManager};
use crate::motd::MotdPassthrough;
use crate::reload::ConfigService;

#[derive(Clone)]
pub struct ApiState {
    pub config: Arc<ConfigService>,
    pub events: Arc<EventBus>,
    pub strategies: Arc<StrategyManager>,
    pub motd: Arc<MotdPassthrough>,
    pub active_players: Arc<AtomicU32>,
}

pub struct ApiServer {
    bind: String,
    state: ApiState,
}

/// API error with the wire error code and HTTP status it maps to.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_argument", message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }
}

impl From<ProxyError> for ApiError {
    fn from(err: ProxyError) -> Self {
        let message = err.to_string();
        match err {
            ProxyError::ConfigInvalid(_) => Self::invalid_argument(message),
            ProxyError::NotFound(_) => Self::not_found(message),
            ProxyError::AlreadyExists(_) => {
                Self::new(StatusCode::CONFLICT, "already_exists", message)
            }
            ProxyError::Transport { .. } | ProxyError::TransportTimeout { .. } => Self::new(
                StatusCode::PRECONDITION_FAILED,
                "failed_precondition",
                message,
            ),
            _ => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "code": self.code,
                "message": self.message,
                "status": self.status.as_u16(),
            }
        }));
        (self.status, body).into_response()
    }
}

impl ApiServer {
    pub fn new(bind: String, state: ApiState) -> Self {
        Self { bind, state }
    }

    /// Start the API server
    pub async fn start(&self) -> Result<(), ProxyError> {
        let app = router(self.state.clone());
        let listener = TcpListener::bind(&self.bind)
            .await
            .map_err(|err| ProxyError::Internal(format!("failed to bind api server: {err}")))?;
        info!("API server listening on {}", self.bind);
        axum::serve(listener, app)
            .await
            .map_err(|err| ProxyError::Internal(format!("api server error: {err}")))
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/config", get(get_config))
        .route("/api/config/validate", post(validate_config))
        .route("/api/config/apply", post(apply_config))
        .route("/api/servers", get(list_servers).post(register_server))
        .route("/api/servers/:name", axum::routing::delete(unregister_server))
        .route("/api/lite/routes", get(list_lite_routes))
        .route("/api/lite/routes/:host", get(get_lite_route))
        .route("/api/lite/routes/:host/strategy", put(update_lite_route_strategy))
        .route(
            "/api/lite/routes/:host/backends",
            post(add_lite_route_backend).delete(remove_lite_route_backend),
        )
        .route("/api/lite/routes/:host/options", put(update_lite_route_options))
        .route("/api/lite/routes/:host/fallback", put(update_lite_route_fallback))
        .route("/api/events", get(stream_events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// Status and config handlers

async fn get_status(State(state): State<ApiState>) -> Json<Value> {
    let config = state.config.current();
    let (hits, misses, entries) = state.motd.cache_stats();
    let stats = if config.lite.enabled {
        let mut connections = 0u32;
        for route in &config.lite.routes {
            for backend in &route.backends {
                connections += state.strategies.active_connections(parse_backend(backend).0);
            }
        }
        json!({"lite": {"connections": connections, "routes": config.lite.routes.len()}})
    } else {
        json!({"classic": {
            "servers": config.servers.len(),
            "players": state.active_players.load(Ordering::Relaxed),
        }})
    };
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "mode": if config.lite.enabled { "lite" } else { "classic" },
        "stats": stats,
        "motd_cache": {"hits": hits, "misses": misses, "entries": entries},
    }))
}

async fn get_config(State(state): State<ApiState>) -> Result<Json<Value>, ApiError> {
    let config = state.config.current();
    let payload = serde_yaml::to_string(&*config)
        .map_err(|err| ApiError::from(ProxyError::Internal(err.to_string())))?;
    Ok(Json(json!({"payload": payload})))
}

#[derive(Debug, Deserialize)]
struct ConfigRequest {
    config: String,
    #[serde(default)]
    persist: bool,
}

async fn validate_config(
    Json(request): Json<ConfigRequest>,
) -> Result<Json<Value>, ApiError> {
    let config: Config = serde_yaml::from_str(&request.config)
        .map_err(|err| ApiError::invalid_argument(format!("invalid YAML: {err}")))?;
    let (warnings, errors) = config.validate();
    if !errors.is_empty() {
        return Err(ApiError::invalid_argument(format!(
            "config validation failed: {}",
            errors.join("; ")
        )));
    }
    Ok(Json(json!({"warnings": warnings})))
}

async fn apply_config(
    State(state): State<ApiState>,
    Json(request): Json<ConfigRequest>,
) -> Result<Json<Value>, ApiError> {
    let warnings = state.config.apply_yaml(&request.config, request.persist)?;
    info!("applied config via api");
    Ok(Json(json!({"warnings": warnings})))
}

// Server registry handlers

#[derive(Debug, Deserialize)]
struct RegisterServerRequest {
    name: String,
    address: String,
    #[serde(default)]
    passthrough_motd: bool,
    #[serde(default)]
    cache_ping_ttl_ms: u64,
}

async fn list_servers(State(state): State<ApiState>) -> Json<Value> {
    let config = state.config.current();
    let servers: Vec<Value> = config
        .servers
        .iter()
        .map(|(name, server)| {
            json!({
                "name": name,
                "address": server.address,
                "passthrough_motd": server.passthrough_motd,
                "cache_ping_ttl_ms": server.cache_ping_ttl.as_millis() as u64,
            })
        })
        .collect();
    Json(json!({"servers": servers}))
}

async fn register_server(
    State(state): State<ApiState>,
    Json(request): Json<RegisterServerRequest>,
) -> Result<Json<Value>, ApiError> {
    let name = request.name.trim().to_string();
    if name.is_empty() || request.address.trim().is_empty() {
        return Err(ApiError::invalid_argument("name and address are required"));
    }
    let mut new_config = (*state.config.current()).clone();
    if new_config.servers.contains_key(&name) {
        return Err(ProxyError::AlreadyExists(format!("server '{name}'")).into());
    }
    new_config.servers.insert(
        name,
        ServerConfig {
            address: request.address.trim().to_string(),
            passthrough_motd: request.passthrough_motd,
            cache_ping_ttl: std::time::Duration::from_millis(request.cache_ping_ttl_ms),
        },
    );
    let warnings = state.config.apply(new_config, false)?;
    Ok(Json(json!({"warnings": warnings})))
}

async fn unregister_server(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let mut new_config = (*state.config.current()).clone();
    if new_config.servers.remove(&name).is_none() {
        return Err(ProxyError::NotFound(format!("server '{name}'")).into());
    }
    new_config.try_servers.retain(|try_name| try_name != &name);
    let warnings = state.config.apply(new_config, false)?;
    Ok(Json(json!({"warnings": warnings})))
}

// Lite route handlers

fn route_json(state: &ApiState, route: &RouteConfig) -> Value {
    let backends: Vec<Value> = route
        .backends
        .iter()
        .map(|backend| {
            let (address, weight) = parse_backend(backend);
            json!({
                "address": address,
                "weight": weight,
                "active_connections": state.strategies.active_connections(address),
            })
        })
        .collect();
    json!({
        "hosts": route.hosts,
        "strategy": route.strategy.as_str(),
        "backends": backends,
        "options": {
            "proxy_protocol": route.proxy_protocol,
            "real_ip_from_tcpshield": route.real_ip_from_tcpshield,
            "modify_virtual_host": route.modify_virtual_host,
            "cache_ping_ttl_ms": route.cache_ping_ttl.as_millis() as u64,
        },
        "fallback": route.fallback,
    })
}

fn find_route_index(config: &Config, host: &str) -> Option<usize> {
    config.lite.routes.iter().position(|route| {
        route
            .hosts
            .iter()
            .any(|pattern| pattern.eq_ignore_ascii_case(host))
    })
}

fn require_route(config: &Config, host: &str) -> Result<usize, ApiError> {
    if host.trim().is_empty() {
        return Err(ApiError::invalid_argument("host is required"));
    }
    find_route_index(config, host)
        .ok_or_else(|| ApiError::not_found(format!("route for host '{host}'")))
}

async fn list_lite_routes(State(state): State<ApiState>) -> Json<Value> {
    let config = state.config.current();
    let routes: Vec<Value> = config
        .lite
        .routes
        .iter()
        .map(|route| route_json(&state, route))
        .collect();
    Json(json!({"routes": routes}))
}

async fn get_lite_route(
    State(state): State<ApiState>,
    Path(host): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let config = state.config.current();
    let index = require_route(&config, &host)?;
    Ok(Json(json!({"route": route_json(&state, &config.lite.routes[index])})))
}

#[derive(Debug, Deserialize)]
struct UpdateStrategyRequest {
    strategy: Strategy,
}

async fn update_lite_route_strategy(
    State(state): State<ApiState>,
    Path(host): Path<String>,
    Json(request): Json<UpdateStrategyRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut new_config = (*state.config.current()).clone();
    let index = require_route(&new_config, &host)?;
    let old = new_config.lite.routes[index].strategy;
    new_config.lite.routes[index].strategy = request.strategy;
    let warnings = state.config.apply(new_config, false)?;
    info!(%host, old = %old, new = %request.strategy, "lite route strategy updated");
    Ok(Json(json!({"warnings": warnings})))
}

#[derive(Debug, Deserialize)]
struct BackendRequest {
    backend: String,
}

async fn add_lite_route_backend(
    State(state): State<ApiState>,
    Path(host): Path<String>,
    Json(request): Json<BackendRequest>,
) -> Result<Json<Value>, ApiError> {
    let backend = request.backend.trim().to_string();
    if backend.is_empty() {
        return Err(ApiError::invalid_argument("backend is required"));
    }
    let mut new_config = (*state.config.current()).clone();
    let index = require_route(&new_config, &host)?;
    let route = &mut new_config.lite.routes[index];
    let already_existed = route
        .backends
        .iter()
        .any(|existing| existing.eq_ignore_ascii_case(&backend));
    if !already_existed {
        route.backends.push(backend.clone());
    }
    let warnings = state.config.apply(new_config, false)?;
    info!(%host, %backend, already_existed, "lite route backend added");
    Ok(Json(json!({"warnings": warnings, "already_existed": already_existed})))
}

async fn remove_lite_route_backend(
    State(state): State<ApiState>,
    Path(host): Path<String>,
    Json(request): Json<BackendRequest>,
) -> Result<Json<Value>, ApiError> {
    let backend = request.backend.trim().to_string();
    if backend.is_empty() {
        return Err(ApiError::invalid_argument("backend is required"));
    }
    let mut new_config = (*state.config.current()).clone();
    let index = require_route(&new_config, &host)?;
    let route = &mut new_config.lite.routes[index];
    let before = route.backends.len();
    route
        .backends
        .retain(|existing| !existing.eq_ignore_ascii_case(&backend));
    let removed = route.backends.len() < before;
    let warnings = state.config.apply(new_config, false)?;
    info!(%host, %backend, removed, "lite route backend removed");
    Ok(Json(json!({"warnings": warnings, "removed": removed})))
}

#[derive(Debug, Default, Deserialize)]
struct RouteOptionsPatch {
    proxy_protocol: Option<bool>,
    real_ip_from_tcpshield: Option<bool>,
    modify_virtual_host: Option<bool>,
    cache_ping_ttl_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct UpdateOptionsRequest {
    options: RouteOptionsPatch,
    #[serde(default)]
    paths: Vec<String>,
}

async fn update_lite_route_options(
    State(state): State<ApiState>,
    Path(host): Path<String>,
    Json(request): Json<UpdateOptionsRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut new_config = (*state.config.current()).clone();
    let index = require_route(&new_config, &host)?;
    let route = &mut new_config.lite.routes[index];

    let paths = if request.paths.is_empty() {
        vec![
            "proxy_protocol".to_string(),
            "real_ip_from_tcpshield".to_string(),
            "modify_virtual_host".to_string(),
            "cache_ping_ttl_ms".to_string(),
        ]
    } else {
        request.paths
    };
    for path in &paths {
        match path.as_str() {
            "proxy_protocol" => {
                route.proxy_protocol = request.options.proxy_protocol.unwrap_or_default();
            }
            "real_ip_from_tcpshield" => {
                route.real_ip_from_tcpshield =
                    request.options.real_ip_from_tcpshield.unwrap_or_default();
            }
            "modify_virtual_host" => {
                route.modify_virtual_host = request.options.modify_virtual_host.unwrap_or_default();
            }
            "cache_ping_ttl_ms" => {
                route.cache_ping_ttl = std::time::Duration::from_millis(
                    request.options.cache_ping_ttl_ms.unwrap_or_default(),
                );
            }
            other => {
                return Err(ApiError::invalid_argument(format!(
                    "unsupported field mask path \"{other}\""
                )))
            }
        }
    }
    let warnings = state.config.apply(new_config, false)?;
    info!(%host, "lite route options updated");
    Ok(Json(json!({"warnings": warnings})))
}

#[derive(Debug, Deserialize)]
struct UpdateFallbackRequest {
    fallback: Option<FallbackStatus>,
    #[serde(default)]
    paths: Vec<String>,
}

async fn update_lite_route_fallback(
    State(state): State<ApiState>,
    Path(host): Path<String>,
    Json(request): Json<UpdateFallbackRequest>,
) -> Result<Json<Value>, ApiError> {
    let mut new_config = (*state.config.current()).clone();
    let index = require_route(&new_config, &host)?;
    let route = &mut new_config.lite.routes[index];
    let mut fallback = route.fallback.take().unwrap_or_default();

    let paths = if request.paths.is_empty() {
        vec![
            "motd".to_string(),
            "version".to_string(),
            "players".to_string(),
            "favicon".to_string(),
        ]
    } else {
        request.paths
    };
    let patch = request.fallback.unwrap_or_default();
    for path in &paths {
        match path.as_str() {
            "motd" => fallback.motd = patch.motd.clone(),
            "version" => fallback.version = patch.version.clone(),
            "players" => fallback.players = patch.players.clone(),
            "favicon" => fallback.favicon = patch.favicon.clone(),
            other => {
                return Err(ApiError::invalid_argument(format!(
                    "unsupported field mask path \"{other}\""
                )))
            }
        }
    }
    route.fallback = Some(fallback);
    let warnings = state.config.apply(new_config, false)?;
    info!(%host, "lite route fallback updated");
    Ok(Json(json!({"warnings": warnings})))
}

// Event streaming

#[derive(Debug, Default, Deserialize)]
struct StreamEventsQuery {
    /// Comma-separated event kind names; empty means all.
    kinds: Option<String>,
    include_player_events: Option<bool>,
    include_system_events: Option<bool>,
}

async fn stream_events(
    State(state): State<ApiState>,
    Query(query): Query<StreamEventsQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<SseEvent, Infallible>>>, ApiError> {
    let mut kinds = HashSet::new();
    if let Some(raw) = &query.kinds {
        for name in raw.split(',').filter(|name| !name.is_empty()) {
            let kind = EventKind::parse(name)
                .ok_or_else(|| ApiError::invalid_argument(format!("unknown event kind \"{name}\"")))?;
            kinds.insert(kind);
        }
    }
    let filter = EventFilter {
        kinds,
        include_player_events: query.include_player_events.unwrap_or(false),
        include_system_events: query.include_system_events.unwrap_or(false),
    };
    let subscription = state.events.subscribe(filter);
    info!("client connected to event stream");

    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        Some((Ok::<_, Infallible>(sse_event(&event)), subscription))
    });
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &Event) -> SseEvent {
    let (kind, data) = event_payload(event);
    SseEvent::default()
        .event(kind)
        .data(data.to_string())
}

/// Wire representation of an event, with a timestamp and a compact payload.
fn event_payload(event: &Event) -> (&'static str, Value) {
    let kind = event.kind().as_str();
    let data = match event {
        Event::PlayerConnect {
            username,
            remote_addr,
            protocol,
        } => json!({
            "username": username,
            "remote_address": remote_addr,
            "protocol": protocol,
        }),
        Event::PlayerDisconnect {
            username,
            login_status,
        } => json!({
            "username": username,
            "login_status": login_status,
        }),
        Event::PlayerServerSwitch {
            username,
            from_server,
            to_server,
        } => json!({
            "username": username,
            "from_server": from_server,
            "to_server": to_server,
        }),
        Event::ConfigUpdate { new, .. } => json!({
            "lite_enabled": new.lite.enabled,
            "route_count": new.lite.routes.len(),
        }),
        Event::Ready { bind_addr, lite } => json!({
            "bind_address": bind_addr,
            "mode": if *lite { "lite" } else { "classic" },
        }),
        Event::Shutdown { reason } => json!({"reason": reason}),
    };
    (
        kind,
        json!({
            "type": kind,
            "timestamp_ms": chrono::Utc::now().timestamp_millis(),
            "data": data,
        }),
    )
}
