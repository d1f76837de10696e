use axum::Router;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use palaver::auth::AuthKeys;
use palaver::server::{app, AppState};
use palaver::storage::Storage;

async fn start_server() -> (String, oneshot::Sender<()>) {
    let storage = Storage::open_in_memory().expect("open storage");
    let state = AppState::new(storage, AuthKeys::new(b"test-secret"));
    let app: Router = app(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("http://{}", addr), shutdown_tx)
}

fn post_json(base_url: &str, path: &str, token: Option<&str>, body: Value) -> (u16, Value) {
    let mut request =
        ureq::post(&format!("{base_url}{path}")).set("Content-Type", "application/json");
    if let Some(token) = token {
        request = request.set("Authorization", &format!("Bearer {token}"));
    }
    into_status_and_body(request.send_string(&body.to_string()))
}

fn get_json(base_url: &str, path: &str, token: Option<&str>) -> (u16, Value) {
    let mut request = ureq::get(&format!("{base_url}{path}"));
    if let Some(token) = token {
        request = request.set("Authorization", &format!("Bearer {token}"));
    }
    into_status_and_body(request.call())
}

fn into_status_and_body(result: Result<ureq::Response, ureq::Error>) -> (u16, Value) {
    match result {
        Ok(response) => {
            let status = response.status();
            let body = response.into_string().expect("response body");
            (status, serde_json::from_str(&body).unwrap_or(Value::Null))
        }
        Err(ureq::Error::Status(status, response)) => {
            let body = response.into_string().unwrap_or_default();
            (status, serde_json::from_str(&body).unwrap_or(Value::Null))
        }
        Err(e) => panic!("transport error: {e}"),
    }
}

/// Register a user through the API and return (token, user_id).
fn register(base_url: &str, username: &str) -> (String, String) {
    let (status, body) = post_json(
        base_url,
        "/api/users/register",
        None,
        json!({
            "username": username,
            "email": format!("{username}@example.com"),
            "password": "password1",
            "full_name": format!("{username} surname"),
        }),
    );
    assert_eq!(status, 201, "register failed: {body}");
    let token = body["token"].as_str().expect("token").to_string();
    let user_id = body["user"]["user_id"].as_str().expect("user_id").to_string();
    (token, user_id)
}

#[tokio::test]
async fn health_endpoint_reports_ok() {
    let (base_url, shutdown_tx) = start_server().await;

    let (status, body) = tokio::task::spawn_blocking(move || {
        get_json(&base_url, "/api/health", None)
    })
    .await
    .expect("health task");

    shutdown_tx.send(()).ok();
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn register_login_logout_flow() {
    let (base_url, shutdown_tx) = start_server().await;

    tokio::task::spawn_blocking(move || {
        let (token, user_id) = register(&base_url, "alice");

        // The token resolves the caller's identity.
        let (status, body) = get_json(&base_url, "/api/users/userId", Some(&token));
        assert_eq!(status, 200);
        assert_eq!(body["current_user_id"], user_id.as_str());
        assert_eq!(body["username"], "alice");

        // Missing or bogus tokens are rejected.
        let (status, _) = get_json(&base_url, "/api/users/userId", None);
        assert_eq!(status, 401);
        let (status, _) = get_json(&base_url, "/api/users/userId", Some("not-a-token"));
        assert_eq!(status, 401);

        // Duplicate username or email is a validation failure.
        let (status, body) = post_json(
            &base_url,
            "/api/users/register",
            None,
            json!({
                "username": "alice",
                "email": "alice2@example.com",
                "password": "password1",
                "full_name": "Alice Again",
            }),
        );
        assert_eq!(status, 400);
        assert_eq!(body["success"], false);

        // Short passwords are rejected.
        let (status, _) = post_json(
            &base_url,
            "/api/users/register",
            None,
            json!({
                "username": "shorty",
                "email": "shorty@example.com",
                "password": "abc",
                "full_name": "Shorty",
            }),
        );
        assert_eq!(status, 400);

        // Wrong password fails, right one succeeds and marks online.
        let (status, _) = post_json(
            &base_url,
            "/api/users/login",
            None,
            json!({ "email": "alice@example.com", "password": "wrong" }),
        );
        assert_eq!(status, 401);

        let (status, body) = post_json(
            &base_url,
            "/api/users/login",
            None,
            json!({ "email": "alice@example.com", "password": "password1" }),
        );
        assert_eq!(status, 200);
        assert_eq!(body["user"]["is_online"], true);
        let token = body["token"].as_str().expect("login token").to_string();

        let (status, body) = post_json(&base_url, "/api/users/logout", Some(&token), json!({}));
        assert_eq!(status, 200);
        assert_eq!(body["success"], true);
    })
    .await
    .expect("rest task");

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn search_enforces_minimum_query_length() {
    let (base_url, shutdown_tx) = start_server().await;

    tokio::task::spawn_blocking(move || {
        let (alice_token, _) = register(&base_url, "alice");
        let (_, bob_id) = register(&base_url, "bob");

        let (status, _) = get_json(&base_url, "/api/users/search?query=b", Some(&alice_token));
        assert_eq!(status, 400);

        let (status, body) = get_json(&base_url, "/api/users/search?query=bo", Some(&alice_token));
        assert_eq!(status, 200);
        let users = body["users"].as_array().expect("users array");
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["user_id"], bob_id.as_str());
        assert_eq!(users[0]["is_friend"], false);
    })
    .await
    .expect("rest task");

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn friend_request_lifecycle_end_to_end() {
    let (base_url, shutdown_tx) = start_server().await;

    tokio::task::spawn_blocking(move || {
        let (alice_token, alice_id) = register(&base_url, "alice");
        let (bob_token, bob_id) = register(&base_url, "bob");

        // Self-request and unknown receiver are rejected up front.
        let (status, _) = post_json(
            &base_url,
            "/api/friend/friend-request",
            Some(&alice_token),
            json!({ "receiver_id": alice_id }),
        );
        assert_eq!(status, 400);
        let (status, _) = post_json(
            &base_url,
            "/api/friend/friend-request",
            Some(&alice_token),
            json!({ "receiver_id": "ghost" }),
        );
        assert_eq!(status, 404);

        // Alice sends to bob.
        let (status, body) = post_json(
            &base_url,
            "/api/friend/friend-request",
            Some(&alice_token),
            json!({ "receiver_id": bob_id }),
        );
        assert_eq!(status, 201);
        let request_id = body["request_id"].as_str().expect("request_id").to_string();

        // Duplicate in either direction conflicts while pending.
        let (status, _) = post_json(
            &base_url,
            "/api/friend/friend-request",
            Some(&bob_token),
            json!({ "receiver_id": alice_id }),
        );
        assert_eq!(status, 400);

        // Bob sees exactly one pending entry, from alice.
        let (status, body) = get_json(
            &base_url,
            "/api/friend/friend-request/pending",
            Some(&bob_token),
        );
        assert_eq!(status, 200);
        let pending = body["pending_requests"].as_array().expect("pending array");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0]["request_id"], request_id.as_str());
        assert_eq!(pending[0]["sender"]["username"], "alice");

        // Status before accept: pending, alice is the sender.
        let (status, body) = get_json(
            &base_url,
            &format!("/api/friend/friend-request/friendship-status/{bob_id}"),
            Some(&alice_token),
        );
        assert_eq!(status, 200);
        assert_eq!(body["is_friend"], false);
        assert_eq!(body["pending_request"]["is_sender"], true);

        // Bob accepts.
        let (status, body) = post_json(
            &base_url,
            "/api/friend/friend-request/accept",
            Some(&bob_token),
            json!({ "request_id": request_id }),
        );
        assert_eq!(status, 200);
        assert!(body["friendship_id"].as_str().is_some());

        // Accepting the same request twice fails.
        let (status, _) = post_json(
            &base_url,
            "/api/friend/friend-request/accept",
            Some(&bob_token),
            json!({ "request_id": request_id }),
        );
        assert_eq!(status, 404);

        // Both sides now report the friendship.
        let (status, body) = get_json(
            &base_url,
            &format!("/api/friend/friend-request/friendship-status/{bob_id}"),
            Some(&alice_token),
        );
        assert_eq!(status, 200);
        assert_eq!(body["is_friend"], true);
        assert!(body["pending_request"].is_null());

        let (status, body) = get_json(&base_url, "/api/friend/friends", Some(&bob_token));
        assert_eq!(status, 200);
        let friends = body["friends"].as_array().expect("friends array");
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0]["username"], "alice");
    })
    .await
    .expect("rest task");

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn group_endpoints_enforce_membership() {
    let (base_url, shutdown_tx) = start_server().await;

    tokio::task::spawn_blocking(move || {
        let (alice_token, _) = register(&base_url, "alice");
        let (bob_token, bob_id) = register(&base_url, "bob");
        let (carol_token, _) = register(&base_url, "carol");

        // Empty names and unknown members are rejected.
        let (status, _) = post_json(
            &base_url,
            "/api/messages/group",
            Some(&alice_token),
            json!({ "name": "   ", "member_ids": [bob_id] }),
        );
        assert_eq!(status, 400);
        let (status, _) = post_json(
            &base_url,
            "/api/messages/group",
            Some(&alice_token),
            json!({ "name": "ghosts", "member_ids": ["ghost"] }),
        );
        assert_eq!(status, 404);

        let (status, body) = post_json(
            &base_url,
            "/api/messages/group",
            Some(&alice_token),
            json!({ "name": "weekend plans", "member_ids": [bob_id] }),
        );
        assert_eq!(status, 201);
        let group_id = body["group_id"].as_str().expect("group_id").to_string();

        // Members see the group listed with its count and creator.
        let (status, body) = get_json(&base_url, "/api/messages/groups", Some(&bob_token));
        assert_eq!(status, 200);
        let groups = body["groups"].as_array().expect("groups array");
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["group_id"], group_id.as_str());
        assert_eq!(groups[0]["member_count"], 2);
        assert_eq!(groups[0]["creator"]["username"], "alice");

        // Alice posts, bob reads it back in order.
        let (status, body) = post_json(
            &base_url,
            &format!("/api/messages/group/{group_id}/message"),
            Some(&alice_token),
            json!({ "content": "saturday?" }),
        );
        assert_eq!(status, 201);
        let message_id = body["message_id"].as_str().expect("message_id").to_string();

        let (status, body) = get_json(
            &base_url,
            &format!("/api/messages/group/{group_id}"),
            Some(&bob_token),
        );
        assert_eq!(status, 200);
        let messages = body["messages"].as_array().expect("messages array");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["message_id"], message_id.as_str());
        assert_eq!(messages[0]["sender"]["username"], "alice");

        // The roster lists the admin first.
        let (status, body) = get_json(
            &base_url,
            &format!("/api/messages/group/{group_id}/members"),
            Some(&alice_token),
        );
        assert_eq!(status, 200);
        let members = body["members"].as_array().expect("members array");
        assert_eq!(members.len(), 2);
        assert_eq!(members[0]["username"], "alice");
        assert_eq!(members[0]["is_admin"], true);

        // Non-members are forbidden everywhere; missing groups are 404.
        let (status, _) = get_json(
            &base_url,
            &format!("/api/messages/group/{group_id}"),
            Some(&carol_token),
        );
        assert_eq!(status, 403);
        let (status, _) = post_json(
            &base_url,
            &format!("/api/messages/group/{group_id}/message"),
            Some(&carol_token),
            json!({ "content": "let me in" }),
        );
        assert_eq!(status, 403);
        let (status, _) = get_json(
            &base_url,
            &format!("/api/messages/group/{group_id}/members"),
            Some(&carol_token),
        );
        assert_eq!(status, 403);
        let (status, _) = get_json(&base_url, "/api/messages/group/missing", Some(&alice_token));
        assert_eq!(status, 404);
    })
    .await
    .expect("rest task");

    shutdown_tx.send(()).ok();
}

#[tokio::test]
async fn direct_history_starts_empty() {
    let (base_url, shutdown_tx) = start_server().await;

    tokio::task::spawn_blocking(move || {
        let (alice_token, _) = register(&base_url, "alice");
        let (_, bob_id) = register(&base_url, "bob");

        let (status, body) = get_json(
            &base_url,
            &format!("/api/messages/allmessages/{bob_id}"),
            Some(&alice_token),
        );
        assert_eq!(status, 200);
        assert!(body["messages"].as_array().expect("messages").is_empty());
    })
    .await
    .expect("rest task");

    shutdown_tx.send(()).ok();
}
