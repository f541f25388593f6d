use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use shared::{
    domain::{
        ConversationId, GroupId, GroupMember, GroupRole, Message, Presence, UserId, UserPresence,
    },
    error::{ApiError, ErrorCode},
    protocol::{AckPayload, ClientFrame, ServerEvent, ServerFrame, UnreadSnapshot},
};
use storage::Storage;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{error, info, warn};

mod config;
mod dispatch;

use config::{load_settings, prepare_database_url};
use dispatch::dispatch;

struct AppState {
    storage: Storage,
    /// Per-user push channels. A user may hold several connections; broadcast
    /// fans one event out to all of them.
    clients: RwLock<HashMap<UserId, broadcast::Sender<ServerEvent>>>,
}

impl AppState {
    fn new(storage: Storage) -> Self {
        Self {
            storage,
            clients: RwLock::new(HashMap::new()),
        }
    }

    async fn subscribe(&self, user: &UserId) -> broadcast::Receiver<ServerEvent> {
        let mut clients = self.clients.write().await;
        clients
            .entry(user.clone())
            .or_insert_with(|| broadcast::channel(256).0)
            .subscribe()
    }

    async fn push_to(&self, user: &UserId, event: ServerEvent) {
        if let Some(tx) = self.clients.read().await.get(user) {
            // No receivers means the user is offline; they reconcile over
            // HTTP on reconnect.
            let _ = tx.send(event);
        }
    }

    async fn deliver(&self, pushes: Vec<(UserId, ServerEvent)>) {
        for (user, event) in pushes {
            self.push_to(&user, event).await;
        }
    }

    async fn broadcast_all(&self, event: ServerEvent) {
        for tx in self.clients.read().await.values() {
            let _ = tx.send(event.clone());
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: String,
}

#[derive(Debug, Deserialize)]
struct MessagesQuery {
    user_id: String,
    conversation_kind: String,
    conversation_id: String,
}

#[derive(Debug, Deserialize)]
struct RegisterUserRequest {
    user_id: String,
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct CreateGroupRequest {
    group_id: String,
    name: String,
    admin: String,
    #[serde(default)]
    members: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|err| {
        error!(
            %database_url,
            %err,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        err
    })?;

    let state = Arc::new(AppState::new(storage));
    let app = build_router(state);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/requests", post(submit_request))
        .route("/messages", get(http_list_messages))
        .route("/unread", get(http_unread))
        .route("/presence", get(http_presence))
        .route("/users", post(http_register_user))
        .route("/groups", post(http_create_group))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// HTTP twin of the socket frame path. Domain rejections come back as an
/// `error` ack with status 200, exactly like they would over the socket, so
/// the caller cannot tell the channels apart.
async fn submit_request(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
    Json(request): Json<shared::protocol::ClientRequest>,
) -> Json<AckPayload> {
    let sender = UserId::new(q.user_id);
    match dispatch(&state.storage, &sender, request).await {
        Ok(outcome) => {
            state.deliver(outcome.pushes).await;
            Json(outcome.ack)
        }
        Err(err) => {
            warn!(user = %sender, "request rejected: {err}");
            Json(AckPayload::Error(err.into()))
        }
    }
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MessagesQuery>,
) -> Result<Json<Vec<Message>>, (StatusCode, Json<ApiError>)> {
    let conversation = match q.conversation_kind.as_str() {
        "direct" => ConversationId::Direct(UserId::new(q.conversation_id)),
        "group" => ConversationId::Group(GroupId::new(q.conversation_id)),
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ApiError::new(
                    ErrorCode::Validation,
                    format!("unknown conversation kind '{other}'"),
                )),
            ))
        }
    };
    let messages = state
        .storage
        .list_messages(&UserId::new(q.user_id), &conversation)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, e.to_string())),
            )
        })?;
    Ok(Json(messages))
}

async fn http_unread(
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> Result<Json<UnreadSnapshot>, (StatusCode, Json<ApiError>)> {
    let snapshot = state
        .storage
        .unread_snapshot(&UserId::new(q.user_id))
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, e.to_string())),
            )
        })?;
    Ok(Json(snapshot))
}

async fn http_presence(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<UserPresence>>, (StatusCode, Json<ApiError>)> {
    let statuses = state.storage.presence_snapshot().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    })?;
    Ok(Json(statuses))
}

async fn http_register_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterUserRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    state
        .storage
        .upsert_user(&UserId::new(req.user_id), &req.display_name)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, e.to_string())),
            )
        })?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_create_group(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<StatusCode, (StatusCode, Json<ApiError>)> {
    let internal = |e: anyhow::Error| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiError::new(ErrorCode::Internal, e.to_string())),
        )
    };

    let group = GroupId::new(req.group_id);
    state
        .storage
        .create_group(&group, &req.name)
        .await
        .map_err(internal)?;
    state
        .storage
        .add_group_member(
            &group,
            &GroupMember {
                user_id: UserId::new(req.admin.clone()),
                role: GroupRole::Admin,
            },
        )
        .await
        .map_err(internal)?;
    for member in &req.members {
        state
            .storage
            .add_group_member(
                &group,
                &GroupMember {
                    user_id: UserId::new(member.clone()),
                    role: GroupRole::Member,
                },
            )
            .await
            .map_err(internal)?;
    }

    for user in req.members.iter().chain(std::iter::once(&req.admin)) {
        state
            .push_to(&UserId::new(user.clone()), ServerEvent::RefreshChats)
            .await;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<UserQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket, UserId::new(q.user_id)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    user_id: UserId,
) {
    use axum::extract::ws::Message as WsMessage;
    use futures::{SinkExt, StreamExt};

    let (mut ws_tx, mut ws_rx) = socket.split();
    // Acks and pushes share one writer so frames never interleave mid-write.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(256);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(text) = serde_json::to_string(&frame) else {
                continue;
            };
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut events = state.subscribe(&user_id).await;
    let forward_out = out_tx.clone();
    let forwarder = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if forward_out.send(ServerFrame::Event(event)).await.is_err() {
                break;
            }
        }
    });

    if let Err(err) = state.storage.set_presence(&user_id, true, None).await {
        warn!(user = %user_id, "presence update failed: {err}");
    }
    state
        .broadcast_all(ServerEvent::UserStatusUpdate(UserPresence {
            user_id: user_id.clone(),
            presence: Presence {
                is_online: true,
                last_seen: None,
            },
        }))
        .await;
    info!(user = %user_id, "socket connected");

    while let Some(Ok(msg)) = ws_rx.next().await {
        let WsMessage::Text(text) = msg else {
            continue;
        };
        let frame: ClientFrame = match serde_json::from_str(&text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(user = %user_id, "invalid client frame: {err}");
                continue;
            }
        };
        let ack = match dispatch(&state.storage, &user_id, frame.request).await {
            Ok(outcome) => {
                state.deliver(outcome.pushes).await;
                outcome.ack
            }
            Err(err) => {
                warn!(user = %user_id, "request rejected: {err}");
                AckPayload::Error(err.into())
            }
        };
        if out_tx
            .send(ServerFrame::Ack {
                request_id: frame.request_id,
                ack,
            })
            .await
            .is_err()
        {
            break;
        }
    }

    forwarder.abort();
    writer.abort();

    let last_seen = Utc::now();
    if let Err(err) = state
        .storage
        .set_presence(&user_id, false, Some(last_seen))
        .await
    {
        warn!(user = %user_id, "presence update failed: {err}");
    }
    state
        .broadcast_all(ServerEvent::UserStatusUpdate(UserPresence {
            user_id: user_id.clone(),
            presence: Presence {
                is_online: false,
                last_seen: Some(last_seen),
            },
        }))
        .await;
    info!(user = %user_id, "socket disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use shared::protocol::{ClientRequest, SendMessagePayload};
    use tower::ServiceExt;

    async fn test_app() -> Router {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        build_router(Arc::new(AppState::new(storage)))
    }

    fn send_request_body(text: &str) -> String {
        serde_json::to_string(&ClientRequest::SendMessage(SendMessagePayload {
            temp_id: shared::domain::MessageId::new("tmp-1"),
            conversation: ConversationId::Direct(UserId::new("bob")),
            text: Some(text.to_string()),
            media: None,
            reply_to: None,
            mentions: Vec::new(),
        }))
        .expect("json")
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let app = test_app().await;
        let response = app
            .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn send_message_persists_and_counts_unread() {
        let app = test_app().await;

        let request = Request::post("/requests?user_id=alice")
            .header("content-type", "application/json")
            .body(Body::from(send_request_body("hello")))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let ack: AckPayload = read_json(response).await;
        let AckPayload::Message { message } = ack else {
            panic!("expected message ack, got {ack:?}");
        };
        assert_eq!(message.sender_id, UserId::new("alice"));

        // The recipient sees the message in the pair history.
        let request = Request::get(
            "/messages?user_id=bob&conversation_kind=direct&conversation_id=alice",
        )
        .body(Body::empty())
        .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let history: Vec<Message> = read_json(response).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, message.id);

        let request = Request::get("/unread?user_id=bob")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        let snapshot: UnreadSnapshot = read_json(response).await;
        assert_eq!(snapshot.personal.get(&UserId::new("alice")), Some(&1));
    }

    #[tokio::test]
    async fn domain_rejections_come_back_as_error_acks() {
        let app = test_app().await;

        let body = serde_json::to_string(&ClientRequest::MessageEdited {
            message_id: shared::domain::MessageId::new("missing"),
            text: "whatever".into(),
        })
        .expect("json");
        let request = Request::post("/requests?user_id=alice")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        // Same-status error acks keep the http channel indistinguishable
        // from the socket channel.
        assert_eq!(response.status(), StatusCode::OK);
        let ack: AckPayload = read_json(response).await;
        let AckPayload::Error(api_error) = ack else {
            panic!("expected error ack, got {ack:?}");
        };
        assert_eq!(api_error.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn invalid_conversation_kind_is_a_validation_error() {
        let app = test_app().await;
        let request = Request::get(
            "/messages?user_id=bob&conversation_kind=channel&conversation_id=x",
        )
        .body(Body::empty())
        .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
