use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{delete, get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info};

use crate::db::{self, SqliteStore};
use crate::models::{ConversationKey, Credential, InboundMessage, RelayConfig};
use crate::relay::Relay;
use crate::sink::{ChannelSink, SinkEvent};

type ApiError = (StatusCode, String);

/**
 * \brief HTTP 层共享状态。
 */
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    /** \brief 管理接口直接操作的存储，与 relay 持有的是同一个实例 */
    pub store: Arc<SqliteStore>,
}

impl AppState {
    pub fn new(relay: Arc<Relay>, store: Arc<SqliteStore>) -> Self {
        Self { relay, store }
    }
}

/**
 * \brief 组装全部路由。
 */
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/events", post(post_event))
        .route("/api/config", get(get_config).post(set_config))
        .route("/api/keys", get(get_keys).post(put_key))
        .route("/api/keys/{name}", delete(remove_key))
        .route("/api/histories/{name}", delete(clear_all_histories))
        .route("/api/histories/{name}/{uid}", delete(clear_histories))
        .route("/api/health", get(health_check))
        .with_state(state)
}

/**
 * \brief 启动本地 HTTP 服务。
 * \param addr 监听地址，如 "127.0.0.1:5180"
 */
pub async fn run(addr: &str, state: AppState) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state).await
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<()> {
    info!(addr = %listener.local_addr()?, "server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/**
 * \brief 投递一条入站消息，以 SSE 形式把中继的输出逐条推回。
 * \details 事件类型：text / reply / image（base64）/ delete，最后一条为 outcome。
 */
async fn post_event(
    State(state): State<AppState>,
    Json(event): Json<InboundMessage>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<Result<Event, Infallible>>();
    debug!(
        key = event.conversation_key(),
        to_me = event.to_me,
        "inbound event"
    );

    tokio::spawn(async move {
        let (sink, mut events) = ChannelSink::new();
        let work = state.relay.dispatch(&event, &sink);
        tokio::pin!(work);

        let outcome = loop {
            tokio::select! {
                outcome = &mut work => break outcome,
                Some(ev) = events.recv() => {
                    let _ = tx.send(Ok(to_sse(&ev)));
                }
            }
        };
        while let Ok(ev) = events.try_recv() {
            let _ = tx.send(Ok(to_sse(&ev)));
        }
        let _ = tx.send(Ok(Event::default()
            .event("outcome")
            .data(json!(outcome).to_string())));
    });

    Sse::new(UnboundedReceiverStream::new(rx)).keep_alive(KeepAlive::new())
}

fn to_sse(ev: &SinkEvent) -> Event {
    let (kind, data) = match ev {
        SinkEvent::Text { .. } => ("text", json!(ev)),
        SinkEvent::Reply { .. } => ("reply", json!(ev)),
        SinkEvent::Delete { .. } => ("delete", json!(ev)),
        SinkEvent::Image { reply_to, bytes } => (
            "image",
            json!({"kind": "image", "reply_to": reply_to, "base64": STANDARD.encode(bytes)}),
        ),
    };
    Event::default().event(kind).data(data.to_string())
}

async fn get_config(State(state): State<AppState>) -> Result<Json<RelayConfig>, ApiError> {
    let config = state.store.with_conn(db::get_config).map_err(internal_err)?;
    Ok(Json(config))
}

async fn set_config(
    State(state): State<AppState>,
    Json(input): Json<RelayConfig>,
) -> Result<Json<RelayConfig>, ApiError> {
    state
        .store
        .with_conn(|conn| db::update_config(conn, &input))
        .map_err(bad_request)?;
    info!(model = %input.model, imitate = input.imitate, freq = input.freq, "config updated");
    get_config(State(state)).await
}

#[derive(Serialize, Debug)]
struct KeysResponse {
    default_key: String,
    /** \brief 不含默认凭证 */
    keys: Vec<String>,
}

async fn get_keys(State(state): State<AppState>) -> Result<Json<KeysResponse>, ApiError> {
    let (config, keys) = state
        .store
        .with_conn(|conn| Ok((db::get_config(conn)?, db::list_keys(conn)?)))
        .map_err(internal_err)?;
    let keys = keys
        .into_iter()
        .map(|k| k.name)
        .filter(|name| *name != config.default_key)
        .collect();
    Ok(Json(KeysResponse {
        default_key: config.default_key,
        keys,
    }))
}

async fn put_key(
    State(state): State<AppState>,
    Json(key): Json<Credential>,
) -> Result<Json<KeysResponse>, ApiError> {
    if key.name.trim().is_empty() || key.content.trim().is_empty() {
        return Err(bad_request("name and content are required"));
    }
    state
        .store
        .with_conn(|conn| db::save_key(conn, &key))
        .map_err(internal_err)?;
    info!(name = %key.name, "key saved");
    get_keys(State(state)).await
}

async fn remove_key(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<KeysResponse>, ApiError> {
    state
        .store
        .with_conn(|conn| db::delete_key(conn, &name))
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
    info!(%name, "key deleted");
    get_keys(State(state)).await
}

async fn clear_all_histories(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state
        .store
        .with_conn(|conn| db::clean_all_histories(conn, &name))
        .map_err(internal_err)?;
    info!(%name, removed, "histories cleared");
    Ok(Json(json!({"removed": removed})))
}

async fn clear_histories(
    State(state): State<AppState>,
    Path((name, uid)): Path<(String, ConversationKey)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let removed = state
        .store
        .with_conn(|conn| db::clean_histories(conn, uid, &name))
        .map_err(internal_err)?;
    state.relay.memory().clear(uid);
    info!(%name, uid, removed, "histories cleared");
    Ok(Json(json!({"removed": removed})))
}

async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "cooling_down": state.relay.gate().cooling_down(),
    }))
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn bad_request<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::BAD_REQUEST, e.to_string())
}
