//! HTTP and WebSocket handlers.
//!
//! Every socket endpoint wraps the upgraded socket in a
//! [`WebSocketConnection`] and hands it to the core; the handlers here only
//! parse requests, enforce capacity before upgrading and map errors to
//! status codes.

use crate::config::Config;
use crate::metrics::{self, ConnectionKind, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use spacecast_core::{
    serve_session, ChatError, ChatService, ChatStore, DomainEvent, EventBus, EventEmitter, Hub,
    HubHandle, ManagerError, MemoryChatStore, NotificationEventHandler, NotificationManager,
    PresenceManager, SessionIdentity,
};
use spacecast_protocol::{error_code, ChatPayload};
use spacecast_transport::{Connection, WebSocketConnection};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    pub hub: HubHandle,
    pub chat: ChatService,
    pub notifications: Arc<NotificationManager>,
    pub presence: Arc<PresenceManager>,
    pub events: EventBus,
    pub config: Config,
}

impl AppState {
    /// Start the hub and wire the managers together.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn ChatStore>) -> Self {
        let hub = Hub::spawn(config.hub_config());
        let chat = ChatService::new(hub.clone(), store, config.limits.max_content_length);

        let notifications = Arc::new(NotificationManager::new(
            config.manager_config(config.limits.max_notification_connections),
        ));
        let presence = Arc::new(PresenceManager::new(
            config.manager_config(config.limits.max_presence_connections),
        ));

        let events = EventBus::new(config.limits.event_buffer);
        events.subscribe(Arc::new(NotificationEventHandler::new(
            notifications.clone(),
        )));

        Self {
            hub,
            chat,
            notifications,
            presence,
            events,
            config,
        }
    }
}

/// Errors returned to HTTP clients.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error(transparent)]
    Manager(#[from] ManagerError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) | Self::Chat(ChatError::Validation(_)) => StatusCode::BAD_REQUEST,
            Self::Manager(ManagerError::AtCapacity { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Chat(_) | Self::Manager(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid_request",
            Self::Chat(ChatError::Validation(_)) => error_code::VALIDATION_FAILED,
            Self::Chat(ChatError::Persistence(_)) => error_code::PERSISTENCE_FAILED,
            Self::Manager(ManagerError::AtCapacity { .. }) => "at_capacity",
            Self::Chat(_) | Self::Manager(_) => "internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(code = self.code(), error = %self, "Request failed");
        }
        let body = json!({ "error": { "code": self.code(), "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let transport = state.config.transport.clone();

    Router::new()
        .route(&transport.space_path, get(space_ws_handler))
        .route(&transport.notifications_path, get(notifications_ws_handler))
        .route(&transport.presence_path, get(presence_ws_handler))
        .route("/api/spaces/:space_id/messages", post(post_message_handler))
        .route("/api/presence", get(presence_list_handler))
        .route("/api/events", post(event_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP/WebSocket server until interrupted.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(
        config.clone(),
        Arc::new(MemoryChatStore::new()),
    ));
    let app = router(state).into_make_service_with_connect_info::<SocketAddr>();

    let listener = TcpListener::bind(addr).await?;

    info!("spacecast listening on {}", addr);
    info!("Space endpoint: ws://{}{}", addr, config.transport.space_path);
    info!(
        "Notification endpoint: ws://{}{}",
        addr, config.transport.notifications_path
    );
    info!(
        "Presence endpoint: ws://{}{}",
        addr, config.transport.presence_path
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("spacecast stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}

fn require_user(user_id: &str) -> Result<String, ApiError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(ApiError::BadRequest("user_id is required".into()));
    }
    Ok(user_id.to_string())
}

#[derive(Debug, Deserialize)]
struct SpaceParams {
    #[serde(default)]
    user_id: String,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UserParams {
    #[serde(default)]
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct PostMessageRequest {
    #[serde(default)]
    user_id: String,
    username: Option<String>,
    #[serde(default)]
    content: String,
}

fn display_name(username: Option<String>, user_id: &str) -> String {
    username
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| user_id.to_string())
}

/// Space chat socket.
async fn space_ws_handler(
    ws: WebSocketUpgrade,
    Path(space_id): Path<String>,
    Query(params): Query<SpaceParams>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&params.user_id)?;
    let username = display_name(params.username, &user_id);
    let identity = SessionIdentity::new(user_id, username, space_id);
    let max_message_size = state.config.limits.max_message_size;

    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let _metrics_guard = ConnectionMetricsGuard::new(ConnectionKind::Space);

            let conn = wrap_socket(socket, max_message_size, connect_info);
            debug!(
                connection = %conn.id(),
                user = %identity.user_id,
                space = %identity.space_id,
                "Space socket upgraded"
            );

            let config = state.config.session_config();
            let result = serve_session(conn, identity, state.chat.clone(), config).await;
            if let Err(e) = result {
                error!(error = %e, "Space session failed");
                metrics::record_error("hub");
            }
        }))
}

/// Notification socket.
async fn notifications_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<UserParams>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&params.user_id)?;
    if let Err(e) = state.notifications.check_capacity(&user_id).await {
        metrics::record_rejection(ConnectionKind::Notification);
        return Err(e.into());
    }

    let max_message_size = state.config.limits.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let conn = wrap_socket(socket, max_message_size, connect_info);
            match state.notifications.handle_connection(user_id, conn).await {
                Ok(watcher) => {
                    let _metrics_guard =
                        ConnectionMetricsGuard::new(ConnectionKind::Notification);
                    let _ = watcher.await;
                }
                Err(e) => {
                    warn!(error = %e, "Notification connection refused");
                    metrics::record_handoff_failure(ConnectionKind::Notification, &e);
                }
            }
        }))
}

/// Presence socket.
async fn presence_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<UserParams>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let user_id = require_user(&params.user_id)?;
    if let Err(e) = state.presence.check_capacity(&user_id).await {
        metrics::record_rejection(ConnectionKind::Presence);
        return Err(e.into());
    }

    let max_message_size = state.config.limits.max_message_size;
    Ok(ws
        .max_message_size(max_message_size)
        .on_upgrade(move |socket| async move {
            let conn = wrap_socket(socket, max_message_size, connect_info);
            match state.presence.handle_connection(user_id, conn).await {
                Ok(watcher) => {
                    let _metrics_guard = ConnectionMetricsGuard::new(ConnectionKind::Presence);
                    let _ = watcher.await;
                }
                Err(e) => {
                    warn!(error = %e, "Presence connection refused");
                    metrics::record_handoff_failure(ConnectionKind::Presence, &e);
                }
            }
        }))
}

fn wrap_socket(
    socket: axum::extract::ws::WebSocket,
    max_message_size: usize,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Arc<dyn Connection> {
    let conn = WebSocketConnection::new(socket, max_message_size);
    match connect_info {
        Some(ConnectInfo(addr)) => Arc::new(conn.with_remote_addr(addr)),
        None => Arc::new(conn),
    }
}

/// Post a chat message on behalf of a user.
async fn post_message_handler(
    Path(space_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<PostMessageRequest>,
) -> Result<(StatusCode, Json<ChatPayload>), ApiError> {
    let user_id = require_user(&body.user_id)?;
    let username = display_name(body.username, &user_id);

    let message = state
        .chat
        .post(&user_id, &username, &space_id, &body.content)
        .await?;
    Ok((StatusCode::CREATED, Json(ChatPayload::from(&message))))
}

/// Ids of users with a live presence connection.
async fn presence_list_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({ "online": state.presence.online_users().await }))
}

/// Publish a domain event.
async fn event_handler(
    State(state): State<Arc<AppState>>,
    Json(event): Json<DomainEvent>,
) -> StatusCode {
    metrics::record_event(event.kind());
    state.events.emit(event);
    StatusCode::ACCEPTED
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let notifications = state.notifications.connection_count().await;
    let presence = state.presence.connection_count().await;

    match state.hub.stats().await {
        Ok(stats) => {
            metrics::set_hub_stats(stats.session_count, stats.space_count);
            Json(json!({
                "status": "ok",
                "version": env!("CARGO_PKG_VERSION"),
                "sessions": stats.session_count,
                "spaces": stats.space_count,
                "notification_connections": notifications,
                "presence_connections": presence,
            }))
            .into_response()
        }
        Err(e) => {
            error!(error = %e, "Hub unavailable");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "version": env!("CARGO_PKG_VERSION"),
                })),
            )
                .into_response()
        }
    }
}
