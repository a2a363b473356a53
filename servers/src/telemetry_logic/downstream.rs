use crate::telemetry_logic::model::{
    ClientMessage, HistoryPoint, HistoryQuery, HistoryResponse, NotificationLevel, SendRequest,
    SendResponse, ServerMessage, WsQuery,
};
use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use lib_telemetry::connections::{StoreError, TimeWindow};
use lib_telemetry::core::{BroadcastGateway, Cadence, EngineError, EngineStatus, ReadingBatch};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

const DEFAULT_TIME_RANGE: &str = "24h";

/// Shared state of the HTTP and WebSocket routes.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<BroadcastGateway>,
    pub default_cadence: Cadence,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/data", get(data_handler))
        .route("/send", post(send_handler))
        .route("/history", get(history_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

/// Errors surfaced to HTTP clients as `{"error": ...}`.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Store(StoreError),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        AppError::Store(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Store(err) => {
                let status = match &err {
                    StoreError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    StoreError::InvalidLimit(_) | StoreError::InvalidWindow(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    StoreError::Query(_) | StoreError::Config(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, err.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn status_handler(State(state): State<AppState>) -> Json<EngineStatus> {
    Json(state.gateway.status())
}

async fn data_handler(State(state): State<AppState>) -> Json<ReadingBatch> {
    Json(state.gateway.latest_batch().await)
}

async fn send_handler(
    State(state): State<AppState>,
    Json(request): Json<SendRequest>,
) -> Result<Json<SendResponse>, AppError> {
    let value = request
        .as_integer()
        .ok_or_else(|| AppError::BadRequest(format!("value must be an integer, got {}", request.value)))?;

    let receipt = state.gateway.store().insert(value).await?;
    debug!(id = receipt.id, value, "Reading stored");
    Ok(Json(SendResponse {
        status: "ok",
        id: receipt.id,
        timestamp: receipt.timestamp,
    }))
}

async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, AppError> {
    let window: TimeWindow = query
        .time_range
        .as_deref()
        .unwrap_or(DEFAULT_TIME_RANGE)
        .parse()?;

    let readings = state.gateway.store().fetch_range(window).await?;
    Ok(Json(HistoryResponse {
        time_range: window.to_string(),
        data: readings.into_iter().map(HistoryPoint::from).collect(),
    }))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Result<Response, AppError> {
    let cadence = match query.interval.as_deref() {
        Some(text) => Cadence::parse(text).map_err(|e| AppError::BadRequest(e.to_string()))?,
        None => state.default_cadence,
    };
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, addr, cadence, state)))
}

type WsSender = SplitSink<WebSocket, Message>;

async fn send_message(sender: &mut WsSender, message: &ServerMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode server message");
            true
        }
    }
}

/// Last message a client gets when it cannot be subscribed.
fn refusal_notice(error: &EngineError) -> ServerMessage {
    ServerMessage::notification(NotificationLevel::Error, error.to_string())
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, cadence: Cadence, state: AppState) {
    let consumer_id = format!("ws-{}", addr);
    let (mut sender, mut receiver) = socket.split();

    let mut stream = match state.gateway.subscribe_with(&consumer_id, cadence).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(consumer_id = %consumer_id, error = %e, "Subscription refused");
            send_message(&mut sender, &refusal_notice(&e)).await;
            return;
        }
    };
    info!(consumer_id = %consumer_id, cadence = %cadence, "Client connected");

    let started = ServerMessage::notification(
        NotificationLevel::Info,
        format!("Streaming every {}", cadence),
    );
    let mut open = send_message(&mut sender, &started).await;
    let mut last_ok: Option<bool> = None;

    while open {
        tokio::select! {
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(ClientMessage { interval: Some(ms) }) =
                            serde_json::from_str::<ClientMessage>(text.as_str())
                        else {
                            debug!(consumer_id = %consumer_id, "Ignoring client message");
                            continue;
                        };
                        let reply = match Cadence::from_millis(ms) {
                            Ok(next) => match state.gateway.subscribe_with(&consumer_id, next).await {
                                Ok(next_stream) => {
                                    stream = next_stream;
                                    info!(consumer_id = %consumer_id, cadence = %next, "Cadence changed");
                                    ServerMessage::notification(
                                        NotificationLevel::Success,
                                        format!("Interval set to {}", next),
                                    )
                                }
                                Err(e) => {
                                    open = false;
                                    ServerMessage::notification(NotificationLevel::Error, e.to_string())
                                }
                            },
                            Err(e) => ServerMessage::notification(NotificationLevel::Warning, e.to_string()),
                        };
                        open = send_message(&mut sender, &reply).await && open;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(consumer_id = %consumer_id, error = %e, "Socket error");
                        break;
                    }
                }
            }
            batch = stream.next_batch() => {
                let Some(batch) = batch else {
                    // Subscription ended on the engine side.
                    break;
                };
                let ok = batch.is_ok();
                if last_ok.is_some_and(|prev| prev != ok) || (last_ok.is_none() && !ok) {
                    let notice = if ok {
                        ServerMessage::notification(NotificationLevel::Success, "Readings store reachable again")
                    } else {
                        ServerMessage::notification(NotificationLevel::Error, "Readings store unavailable")
                    };
                    open = send_message(&mut sender, &notice).await;
                }
                last_ok = Some(ok);
                open = open && send_message(&mut sender, &ServerMessage::from(batch)).await;
            }
        }
    }

    state.gateway.on_disconnect(&consumer_id).await;
    info!(consumer_id = %consumer_id, "Client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_telemetry::configs::EngineConfig;
    use lib_telemetry::connections::{MemoryStore, ReadingsStore};
    use serde_json::Value;

    fn state_with(store: Arc<MemoryStore>) -> AppState {
        let gateway = BroadcastGateway::new(EngineConfig::default(), store);
        AppState {
            gateway: Arc::new(gateway),
            default_cadence: Cadence::from_millis(1000).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_refused_subscription_gets_error_notice() {
        let state = state_with(Arc::new(MemoryStore::new()));
        // Never started, so every subscription is refused.
        let Err(e) = state
            .gateway
            .subscribe_with("ws-127.0.0.1:9", state.default_cadence)
            .await
        else {
            panic!("a stopped gateway must refuse subscriptions");
        };

        let notice = serde_json::to_value(refusal_notice(&e)).unwrap();
        assert_eq!(notice["type"], "notification");
        assert_eq!(notice["level"], "error");
        assert_eq!(notice["message"], "Distribution engine is not running");
    }

    #[tokio::test]
    async fn test_send_stores_integer_values() {
        let store = Arc::new(MemoryStore::new());
        let state = state_with(store.clone());

        let request: SendRequest = serde_json::from_value(json!({"value": "42"})).unwrap();
        let Json(response) = send_handler(State(state), Json(request)).await.unwrap();
        assert_eq!(response.status, "ok");

        let latest = store.fetch_latest(1).await.unwrap();
        assert_eq!(latest[0].value, 42);
        assert_eq!(latest[0].id, response.id);
    }

    #[tokio::test]
    async fn test_send_rejects_non_integers() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let request: SendRequest = serde_json::from_value(json!({"value": "abc"})).unwrap();
        let err = send_handler(State(state), Json(request)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_send_reports_unavailable_store() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let state = state_with(store);
        let request: SendRequest = serde_json::from_value(json!({"value": 1})).unwrap();
        let err = send_handler(State(state), Json(request)).await.unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_history_defaults_and_validates_range() {
        let store = Arc::new(MemoryStore::from_history(&[3, 2, 1]));
        let state = state_with(store);

        let Json(history) = history_handler(State(state.clone()), Query(HistoryQuery { time_range: None }))
            .await
            .unwrap();
        assert_eq!(history.time_range, "24h");
        let values: Vec<i64> = history.data.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![1, 2, 3]);

        let err = history_handler(
            State(state),
            Query(HistoryQuery {
                time_range: Some("2w".to_string()),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_data_degrades_to_error_batch() {
        let store = Arc::new(MemoryStore::from_history(&[7, 6]));
        let state = state_with(store.clone());

        let Json(batch) = data_handler(State(state.clone())).await;
        assert_eq!(batch.values, vec![7, 6, 0, 0, 0]);

        store.set_available(false);
        let Json(batch) = data_handler(State(state)).await;
        assert!(!batch.is_ok());
    }

    #[tokio::test]
    async fn test_status_reports_idle_engine() {
        let state = state_with(Arc::new(MemoryStore::new()));
        let Json(status) = status_handler(State(state)).await;
        let json: Value = serde_json::to_value(status).unwrap();
        assert_eq!(json["activeSubscriptionCount"], 0);
        assert_eq!(json["upstreamLinkConfigured"], false);
    }
}
