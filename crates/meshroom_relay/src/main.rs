/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod rooms;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use meshroom_protocol::{
    CreateRoomRequest, CreateRoomResponse, ErrorResponse, MembersResponse, RegisterRequest,
    RegisterResponse, SignalEnvelope,
};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, info_span, warn};

use crate::rooms::{JoinError, Rooms};

#[derive(Clone, Debug)]
struct RelayConfig {
    bind: SocketAddr,
    max_members: usize,
    outbox: usize,
    room_ttl: Duration,
}

#[derive(Clone)]
struct AppState {
    cfg: RelayConfig,
    rooms: Arc<RwLock<Rooms>>,
}

impl AppState {
    fn new(cfg: RelayConfig) -> Self {
        let rooms = Rooms::new(cfg.max_members);
        Self {
            cfg,
            rooms: Arc::new(RwLock::new(rooms)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JoinQuery {
    #[serde(rename = "userID")]
    user_id: Option<String>,
    name: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let cfg = load_config()?;
    let addr = cfg.bind;
    let state = AppState::new(cfg);

    let sweep_state = state.clone();
    tokio::spawn(async move {
        let ttl = sweep_state.cfg.room_ttl;
        let mut interval = tokio::time::interval((ttl / 4).max(Duration::from_secs(10)));
        loop {
            interval.tick().await;
            let mut rooms = sweep_state.rooms.write().await;
            let dropped = rooms.sweep_idle(Instant::now(), ttl);
            if dropped > 0 {
                info!(dropped, rooms = rooms.room_count(), "idle rooms swept");
            }
        }
    });

    let app = router(state);

    info!("meshroom_relay listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/create-room", post(create_room))
        .route("/join-room/:room_id", get(join_room))
        .route("/list-members/:room_id", get(list_members))
        .route("/healthz", get(healthz))
        .layer(
            TraceLayer::new_for_http().make_span_with(|req: &axum::http::Request<_>| {
                info_span!("http", method = %req.method(), uri = %req.uri())
            }),
        )
        .with_state(state)
}

fn load_config() -> anyhow::Result<RelayConfig> {
    let bind = std::env::var("MESHROOM_RELAY_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let bind: SocketAddr = bind
        .parse()
        .map_err(|e| anyhow::anyhow!("MESHROOM_RELAY_BIND invalid: {e}"))?;
    let max_members = std::env::var("MESHROOM_RELAY_MAX_MEMBERS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(16)
        .clamp(2, 64);
    let outbox = std::env::var("MESHROOM_RELAY_OUTBOX")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256)
        .max(8)
        .min(4096);
    let room_ttl_secs = std::env::var("MESHROOM_RELAY_ROOM_TTL_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(600)
        .max(30);
    Ok(RelayConfig {
        bind,
        max_members,
        outbox,
        room_ttl: Duration::from_secs(room_ttl_secs),
    })
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: msg.to_string(),
        }),
    )
        .into_response()
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Response {
    let name = match body {
        Ok(Json(req)) if !req.name.trim().is_empty() => req.name.trim().to_string(),
        _ => return error_response(StatusCode::BAD_REQUEST, "Invalid name provided"),
    };
    let user_id = state.rooms.write().await.register_user(&name);
    info!(user = %user_id, name = %name, "user registered");
    (
        StatusCode::OK,
        Json(RegisterResponse {
            message: "User registered successfully".to_string(),
            user_id,
            name,
        }),
    )
        .into_response()
}

async fn create_room(
    State(state): State<AppState>,
    body: Result<Json<CreateRoomRequest>, JsonRejection>,
) -> Response {
    let req = match body {
        Ok(Json(req)) if !req.user_id.trim().is_empty() && !req.name.trim().is_empty() => req,
        _ => return error_response(StatusCode::BAD_REQUEST, "Invalid user or name provided"),
    };
    let room_id = {
        let mut rooms = state.rooms.write().await;
        let id = rooms.create_room(req.user_id.trim(), req.name.trim());
        info!(room = %id, user = %req.user_id, rooms = rooms.room_count(), "room created");
        id
    };
    (
        StatusCode::OK,
        Json(CreateRoomResponse {
            message: "Room created successfully".to_string(),
            room_id,
        }),
    )
        .into_response()
}

async fn list_members(State(state): State<AppState>, Path(room_id): Path<String>) -> Response {
    match state.rooms.read().await.members(&room_id) {
        Some(members) => (StatusCode::OK, Json(MembersResponse { members })).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "Room not found"),
    }
}

async fn join_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(q): Query<JoinQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let (Some(user_id), Some(name)) = (non_empty(q.user_id), non_empty(q.name)) else {
        return error_response(StatusCode::BAD_REQUEST, "Missing room ID, user ID, or name");
    };
    match state.rooms.read().await.check_join(&room_id, &user_id) {
        Ok(()) => {}
        Err(JoinError::UnknownRoom) => return error_response(StatusCode::NOT_FOUND, "Room not found"),
        Err(JoinError::Full) => return error_response(StatusCode::CONFLICT, "Room is full"),
    }
    let Some(ws) = ws else {
        return error_response(StatusCode::UPGRADE_REQUIRED, "websocket upgrade required");
    };
    ws.on_upgrade(move |socket| handle_member(state, room_id, user_id, name, socket))
}

async fn handle_member(
    state: AppState,
    room_id: String,
    user_id: String,
    name: String,
    mut socket: WebSocket,
) {
    let (tx, mut rx) = mpsc::channel::<String>(state.cfg.outbox);
    // The room may have filled up between the check and the upgrade.
    let joined = state.rooms.write().await.join(&room_id, &user_id, &name, tx);
    let conn_id = match joined {
        Ok(id) => id,
        Err(e) => {
            warn!(room = %room_id, user = %user_id, "join rejected after upgrade: {e:?}");
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    info!(room = %room_id, user = %user_id, name = %name, "member joined");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_user = user_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        // Outbox dropped: replaced by a newer socket, or the room is gone.
        let _ = ws_tx.send(Message::Close(None)).await;
        debug!(user = %writer_user, "member writer done");
    });

    let reader_state = state.clone();
    let reader_room = room_id.clone();
    let reader_user = user_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                _ => continue,
            };
            let env: SignalEnvelope = match serde_json::from_str(&text) {
                Ok(v) => v,
                Err(e) => {
                    warn!(room = %reader_room, user = %reader_user, "dropping bad frame: {e}");
                    continue;
                }
            };
            let kind = env.kind();
            let delivered = reader_state
                .rooms
                .read()
                .await
                .route(&reader_room, &reader_user, env);
            debug!(room = %reader_room, from = %reader_user, kind, delivered, "routed");
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    let mut rooms = state.rooms.write().await;
    let shown = rooms.display_name(&room_id, &user_id).unwrap_or(name);
    if rooms.leave(&room_id, &user_id, conn_id) {
        let notified = rooms.broadcast_leave(&room_id, &user_id);
        info!(room = %room_id, user = %user_id, name = %shown, notified, "member left");
    } else {
        debug!(room = %room_id, user = %user_id, conn_id, "stale socket closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        AppState::new(RelayConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            max_members: 2,
            outbox: 16,
            room_ttl: Duration::from_secs(600),
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn register_then_create_room_then_list() {
        let st = state();
        let resp = register(
            State(st.clone()),
            Ok(Json(RegisterRequest {
                name: "Alice".into(),
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        let user_id = v["userID"].as_str().unwrap().to_string();
        assert_eq!(user_id.len(), 6);
        assert_eq!(v["name"], "Alice");

        let resp = create_room(
            State(st.clone()),
            Ok(Json(CreateRoomRequest {
                user_id,
                name: "standup".into(),
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let room_id = body_json(resp).await["roomID"].as_str().unwrap().to_string();

        let resp = list_members(State(st.clone()), Path(room_id)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["members"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn blank_fields_are_bad_requests() {
        let st = state();
        let resp = register(State(st.clone()), Ok(Json(RegisterRequest { name: "  ".into() }))).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"], "Invalid name provided");

        let resp = create_room(
            State(st),
            Ok(Json(CreateRoomRequest {
                user_id: String::new(),
                name: "x".into(),
            })),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn join_checks_run_before_upgrade() {
        let st = state();
        let q = |u: Option<&str>| JoinQuery {
            user_id: u.map(str::to_string),
            name: Some("Bob".into()),
        };
        let resp = join_room(State(st.clone()), Path("nope".into()), Query(q(Some("bob"))), None).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let room = st.rooms.write().await.create_room("owner", "r");
        let resp = join_room(State(st.clone()), Path(room.clone()), Query(q(None)), None).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = join_room(State(st.clone()), Path(room.clone()), Query(q(Some("bob"))), None).await;
        assert_eq!(resp.status(), StatusCode::UPGRADE_REQUIRED);

        {
            let mut rooms = st.rooms.write().await;
            for u in ["alice", "carol"] {
                let (tx, _rx) = mpsc::channel(1);
                rooms.join(&room, u, u, tx).unwrap();
            }
        }
        let resp = join_room(State(st.clone()), Path(room.clone()), Query(q(Some("bob"))), None).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = list_members(State(st), Path(room)).await;
        assert_eq!(body_json(resp).await["members"], serde_json::json!(["alice", "carol"]));
    }

    #[tokio::test]
    async fn unknown_room_members_is_not_found() {
        let resp = list_members(State(state()), Path("zzzzzz".into())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
