//! HTTP and WebSocket surface.
//!
//! REST endpoints cover auth, friend management, and conversation history;
//! one WebSocket endpoint carries the realtime events. All JSON error
//! responses use a stable `{success, message}` envelope.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        FromRef, Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::auth::{hash_password, verify_password, AuthKeys, AuthUser};
use crate::events::{ClientEvent, EventRouter};
use crate::logging;
use crate::plog;
use crate::presence::ConnectionHandle;
use crate::storage::{new_id, now_secs, Storage, StorageError, UserRow};

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<Mutex<Storage>>,
    pub events: EventRouter,
    pub keys: AuthKeys,
}

impl AppState {
    pub fn new(storage: Storage, keys: AuthKeys) -> Self {
        let storage = Arc::new(Mutex::new(storage));
        let events = EventRouter::new(storage.clone(), Default::default());
        Self {
            storage,
            events,
            keys,
        }
    }
}

impl FromRef<AppState> for AuthKeys {
    fn from_ref(state: &AppState) -> AuthKeys {
        state.keys.clone()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/users/register", post(register_handler))
        .route("/api/users/login", post(login_handler))
        .route("/api/users/logout", post(logout_handler))
        .route("/api/users/search", get(search_handler))
        .route("/api/users/userId", get(current_user_handler))
        .route("/api/friend/friends", get(list_friends_handler))
        .route("/api/friend/friend-request", post(send_request_handler))
        .route(
            "/api/friend/friend-request/accept",
            post(accept_request_handler),
        )
        .route(
            "/api/friend/friend-request/pending",
            get(pending_requests_handler),
        )
        .route(
            "/api/friend/friend-request/friendship-status/:user_id",
            get(friendship_status_handler),
        )
        .route("/api/messages/allmessages/:friend_id", get(direct_history_handler))
        .route("/api/messages/group", post(create_group_handler))
        .route("/api/messages/groups", get(list_groups_handler))
        .route("/api/messages/group/:id", get(group_history_handler))
        .route(
            "/api/messages/group/:id/message",
            post(group_message_handler),
        )
        .route("/api/messages/group/:id/members", get(group_members_handler))
        .route("/api/ws", get(ws_handler))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// API error helpers
// ---------------------------------------------------------------------------

fn api_error(status: StatusCode, message: impl Into<String>) -> Response {
    let body = json!({ "success": false, "message": message.into() });
    (status, Json(body)).into_response()
}

fn storage_error(e: StorageError) -> Response {
    match e {
        StorageError::NotFound(msg) => api_error(StatusCode::NOT_FOUND, msg),
        StorageError::Conflict(msg) => api_error(StatusCode::BAD_REQUEST, msg),
        StorageError::Forbidden(msg) => api_error(StatusCode::FORBIDDEN, msg),
        StorageError::Sqlite(e) => api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = json!({
        "status": "ok",
        "connections": state.events.presence().online_count(),
    });
    (StatusCode::OK, Json(body))
}

// ---------------------------------------------------------------------------
// Users API
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
    full_name: String,
    #[serde(default)]
    avatar_url: Option<String>,
}

async fn register_handler(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Response {
    let RegisterRequest {
        username,
        email,
        password,
        full_name,
        avatar_url,
    } = req;
    let username = username.trim().to_string();
    let email = email.trim().to_string();
    let full_name = full_name.trim().to_string();
    if username.is_empty() || email.is_empty() || full_name.is_empty() {
        return api_error(
            StatusCode::BAD_REQUEST,
            "username, email and full name are required",
        );
    }
    if password.len() < 6 {
        return api_error(
            StatusCode::BAD_REQUEST,
            "password must be at least 6 characters",
        );
    }

    let password_hash = match tokio::task::spawn_blocking(move || hash_password(&password)).await {
        Ok(Ok(hash)) => hash,
        Ok(Err(e)) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };

    let user = UserRow {
        user_id: new_id(),
        username,
        email,
        password_hash,
        full_name,
        avatar_url,
        is_online: false,
        last_seen: None,
        is_active: true,
        created_at: now_secs(),
        deleted_at: None,
    };

    {
        let storage = state.storage.lock().await;
        match storage.username_or_email_taken(&user.username, &user.email) {
            Ok(true) => {
                return api_error(StatusCode::BAD_REQUEST, "username or email already in use")
            }
            Ok(false) => {}
            Err(e) => return storage_error(e),
        }
        if let Err(e) = storage.insert_user(&user) {
            return storage_error(e);
        }
    }

    let token = match state.keys.issue(&user.user_id, &user.username) {
        Ok(token) => token,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    plog!("api: registered {}", logging::user_id(&user.user_id));
    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "account created",
            "token": token,
            "user": public_user_json(&user),
        })),
    )
        .into_response()
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

async fn login_handler(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> Response {
    let user = {
        let storage = state.storage.lock().await;
        match storage.get_user_by_email(req.email.trim()) {
            Ok(Some(user)) => user,
            Ok(None) => return api_error(StatusCode::UNAUTHORIZED, "invalid credentials"),
            Err(e) => return storage_error(e),
        }
    };

    let hash = user.password_hash.clone();
    let ok = match tokio::task::spawn_blocking(move || verify_password(&req.password, &hash)).await
    {
        Ok(Ok(ok)) => ok,
        Ok(Err(e)) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    if !ok {
        return api_error(StatusCode::UNAUTHORIZED, "invalid credentials");
    }

    {
        let storage = state.storage.lock().await;
        if let Err(e) = storage.set_online(&user.user_id, true) {
            return storage_error(e);
        }
    }

    let token = match state.keys.issue(&user.user_id, &user.username) {
        Ok(token) => token,
        Err(e) => return api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    };
    plog!("api: login {}", logging::user_id(&user.user_id));
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "token": token,
            "user": public_user_json(&user),
        })),
    )
        .into_response()
}

async fn logout_handler(State(state): State<AppState>, caller: AuthUser) -> Response {
    let storage = state.storage.lock().await;
    match storage.set_online(&caller.user_id, false) {
        Ok(_) => (StatusCode::OK, Json(json!({ "success": true }))).into_response(),
        Err(e) => storage_error(e),
    }
}

#[derive(Deserialize)]
struct SearchQuery {
    #[serde(default)]
    query: String,
}

async fn search_handler(
    State(state): State<AppState>,
    caller: AuthUser,
    Query(params): Query<SearchQuery>,
) -> Response {
    let query = params.query.trim();
    if query.len() < 2 {
        return api_error(
            StatusCode::BAD_REQUEST,
            "search query must be at least 2 characters",
        );
    }
    let storage = state.storage.lock().await;
    match storage.search_users(&caller.user_id, query) {
        Ok(users) => (
            StatusCode::OK,
            Json(json!({ "success": true, "users": users })),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

async fn current_user_handler(caller: AuthUser) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "success": true,
            "current_user_id": caller.user_id,
            "username": caller.username,
        })),
    )
}

fn public_user_json(user: &UserRow) -> serde_json::Value {
    json!({
        "user_id": user.user_id,
        "username": user.username,
        "email": user.email,
        "full_name": user.full_name,
        "avatar_url": user.avatar_url,
        "is_online": user.is_online,
    })
}

// ---------------------------------------------------------------------------
// Friends API
// ---------------------------------------------------------------------------

async fn list_friends_handler(State(state): State<AppState>, caller: AuthUser) -> Response {
    let storage = state.storage.lock().await;
    match storage.list_friends(&caller.user_id) {
        Ok(friends) => (
            StatusCode::OK,
            Json(json!({ "success": true, "friends": friends })),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

#[derive(Deserialize)]
struct SendRequestBody {
    receiver_id: String,
}

async fn send_request_handler(
    State(state): State<AppState>,
    caller: AuthUser,
    Json(body): Json<SendRequestBody>,
) -> Response {
    if body.receiver_id == caller.user_id {
        return api_error(
            StatusCode::BAD_REQUEST,
            "cannot send a friend request to yourself",
        );
    }
    let storage = state.storage.lock().await;
    match storage.send_friend_request(&caller.user_id, &body.receiver_id) {
        Ok(request_id) => {
            plog!(
                "api: friend request {} -> {}",
                logging::user_id(&caller.user_id),
                logging::user_id(&body.receiver_id)
            );
            (
                StatusCode::CREATED,
                Json(json!({ "success": true, "request_id": request_id })),
            )
                .into_response()
        }
        Err(e) => storage_error(e),
    }
}

#[derive(Deserialize)]
struct AcceptRequestBody {
    request_id: String,
}

async fn accept_request_handler(
    State(state): State<AppState>,
    caller: AuthUser,
    Json(body): Json<AcceptRequestBody>,
) -> Response {
    let storage = state.storage.lock().await;
    match storage.accept_friend_request(&caller.user_id, &body.request_id) {
        Ok(friendship_id) => (
            StatusCode::OK,
            Json(json!({ "success": true, "friendship_id": friendship_id })),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

async fn pending_requests_handler(State(state): State<AppState>, caller: AuthUser) -> Response {
    let storage = state.storage.lock().await;
    match storage.list_pending_requests(&caller.user_id) {
        Ok(pending) => (
            StatusCode::OK,
            Json(json!({ "success": true, "pending_requests": pending })),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

async fn friendship_status_handler(
    State(state): State<AppState>,
    caller: AuthUser,
    Path(user_id): Path<String>,
) -> Response {
    let storage = state.storage.lock().await;
    match storage.friendship_status(&caller.user_id, &user_id) {
        Ok(status) => {
            let pending = status
                .pending_is_sender
                .map(|is_sender| json!({ "is_sender": is_sender }));
            (
                StatusCode::OK,
                Json(json!({
                    "success": true,
                    "is_friend": status.is_friend,
                    "pending_request": pending,
                })),
            )
                .into_response()
        }
        Err(e) => storage_error(e),
    }
}

// ---------------------------------------------------------------------------
// Messages API
// ---------------------------------------------------------------------------

async fn direct_history_handler(
    State(state): State<AppState>,
    caller: AuthUser,
    Path(friend_id): Path<String>,
) -> Response {
    let storage = state.storage.lock().await;
    match storage.direct_history(&caller.user_id, &friend_id) {
        Ok(messages) => (
            StatusCode::OK,
            Json(json!({ "success": true, "messages": messages })),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

#[derive(Deserialize)]
struct CreateGroupBody {
    name: String,
    #[serde(default)]
    member_ids: Vec<String>,
}

async fn create_group_handler(
    State(state): State<AppState>,
    caller: AuthUser,
    Json(body): Json<CreateGroupBody>,
) -> Response {
    let name = body.name.trim();
    if name.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "group name cannot be empty");
    }
    let storage = state.storage.lock().await;
    match storage.create_group(&caller.user_id, name, &body.member_ids) {
        Ok(group_id) => {
            plog!(
                "api: {} created group {}",
                logging::user_id(&caller.user_id),
                logging::conv_id(&group_id)
            );
            (
                StatusCode::CREATED,
                Json(json!({ "success": true, "group_id": group_id })),
            )
                .into_response()
        }
        Err(e) => storage_error(e),
    }
}

async fn list_groups_handler(State(state): State<AppState>, caller: AuthUser) -> Response {
    let storage = state.storage.lock().await;
    match storage.list_groups(&caller.user_id) {
        Ok(groups) => (
            StatusCode::OK,
            Json(json!({ "success": true, "groups": groups })),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

async fn group_history_handler(
    State(state): State<AppState>,
    caller: AuthUser,
    Path(group_id): Path<String>,
) -> Response {
    let storage = state.storage.lock().await;
    match storage.history(&group_id, &caller.user_id) {
        Ok(messages) => (
            StatusCode::OK,
            Json(json!({ "success": true, "messages": messages })),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

#[derive(Deserialize)]
struct GroupMessageBody {
    content: String,
}

async fn group_message_handler(
    State(state): State<AppState>,
    caller: AuthUser,
    Path(group_id): Path<String>,
    Json(body): Json<GroupMessageBody>,
) -> Response {
    if body.content.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "message content cannot be empty");
    }
    let storage = state.storage.lock().await;
    match storage.get_conversation(&group_id) {
        Ok(Some(conversation)) if conversation.is_group => {}
        Ok(_) => return api_error(StatusCode::NOT_FOUND, "group not found"),
        Err(e) => return storage_error(e),
    }
    match storage.is_active_participant(&group_id, &caller.user_id) {
        Ok(true) => {}
        Ok(false) => {
            return api_error(StatusCode::FORBIDDEN, "you are not a member of this group")
        }
        Err(e) => return storage_error(e),
    }
    match storage.append_message(&group_id, &caller.user_id, &body.content) {
        Ok((message_id, _)) => (
            StatusCode::CREATED,
            Json(json!({ "success": true, "message_id": message_id })),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

async fn group_members_handler(
    State(state): State<AppState>,
    caller: AuthUser,
    Path(group_id): Path<String>,
) -> Response {
    let storage = state.storage.lock().await;
    match storage.get_conversation(&group_id) {
        Ok(Some(conversation)) if conversation.is_group => {}
        Ok(_) => return api_error(StatusCode::NOT_FOUND, "group not found"),
        Err(e) => return storage_error(e),
    }
    match storage.is_active_participant(&group_id, &caller.user_id) {
        Ok(true) => {}
        Ok(false) => {
            return api_error(StatusCode::FORBIDDEN, "you are not a member of this group")
        }
        Err(e) => return storage_error(e),
    }
    match storage.group_members(&group_id) {
        Ok(members) => (
            StatusCode::OK,
            Json(json!({ "success": true, "members": members })),
        )
            .into_response(),
        Err(e) => storage_error(e),
    }
}

// ---------------------------------------------------------------------------
// WebSocket
// ---------------------------------------------------------------------------

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(socket, state))
}

async fn ws_connection(mut socket: WebSocket, state: AppState) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = ConnectionHandle::new(tx);
    let mut user: Option<String> = None;

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let text = match serde_json::to_string(&event) {
                            Ok(text) => text,
                            Err(_) => continue,
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(event) => state.events.dispatch(&conn, &mut user, event).await,
                            Err(e) => plog!("ws: unparseable event: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    state.events.disconnect(conn.conn_id).await;
}
