//! End-to-end scenarios driven through the dispatcher over an in-memory
//! database, plus one real socket round-trip.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use kstor::config::Config;
use kstor::server::{self, dispatcher, ServerState};
use kstor::state::Database;

async fn new_state() -> Arc<ServerState> {
    new_state_with(Config {
        database: ":memory:".to_string(),
        ..Config::default()
    })
    .await
}

async fn new_state_with(config: Config) -> Arc<ServerState> {
    let db = Database::connect(&config.database).await.unwrap();
    Arc::new(ServerState::new(db, &config))
}

async fn call(state: &ServerState, request: Value) -> Value {
    let raw = serde_json::to_vec(&request).unwrap();
    let response = dispatcher::handle(state, &raw).await;
    serde_json::from_str(&response).unwrap()
}

/// Authenticate by password; returns the session id.
async fn login(state: &ServerState, login: &str, password: &str) -> String {
    let response = call(
        state,
        json!({
            "type": "ping", "args": {},
            "login": login, "password": password,
        }),
    )
    .await;
    assert_eq!(response["type"], "pong", "login failed: {response}");
    response["session_id"].as_str().unwrap().to_string()
}

fn session_id(response: &Value) -> String {
    response["session_id"].as_str().unwrap().to_string()
}

fn error_code(response: &Value) -> String {
    assert_eq!(response["type"], "error", "expected error: {response}");
    response["args"]["code"].as_str().unwrap().to_string()
}

/// Create and activate a user; returns (user_id, session_id).
async fn create_active_user(
    state: &ServerState,
    admin_sid: &str,
    user_login: &str,
    password: &str,
) -> (i64, String) {
    let created = call(
        state,
        json!({
            "type": "user_create",
            "args": {"login": user_login, "name": user_login},
            "session_id": admin_sid,
        }),
    )
    .await;
    assert_eq!(created["type"], "user_created");
    let user_id = created["args"]["user"]["id"].as_i64().unwrap();
    let token = created["args"]["token"].as_str().unwrap();

    let activated = call(
        state,
        json!({
            "type": "user_activate",
            "args": {"token": token},
            "login": user_login, "password": password,
        }),
    )
    .await;
    assert_eq!(activated["type"], "user_updated");
    assert_eq!(activated["args"]["user"]["status"], "active");
    (user_id, session_id(&activated))
}

#[tokio::test]
async fn first_login_creates_admin() {
    let state = new_state().await;

    let response = call(
        &state,
        json!({
            "type": "ping", "args": {"payload": "x"},
            "login": "alice", "password": "hunter2",
        }),
    )
    .await;

    assert_eq!(response["type"], "pong");
    assert_eq!(response["args"]["payload"], "x");
    assert!(response["session_id"].is_string());

    // The store now holds one admin; a second login reuses it instead of
    // bootstrapping again.
    let sid = login(&state, "alice", "hunter2").await;
    let groups = call(
        &state,
        json!({"type": "group_search", "args": {"name": "*"}, "session_id": sid}),
    )
    .await;
    assert_eq!(groups["type"], "group_list");
}

#[tokio::test]
async fn share_unlock_search_and_revoke() {
    let state = new_state().await;
    let alice_sid = login(&state, "alice", "hunter2").await;

    // Group.
    let created = call(
        &state,
        json!({"type": "group_create", "args": {"name": "ops"}, "session_id": alice_sid}),
    )
    .await;
    assert_eq!(created["type"], "group_created");
    let group_id = created["args"]["group_id"].as_i64().unwrap();

    // Bob joins.
    let (bob_id, bob_sid) = create_active_user(&state, &alice_sid, "bob", "sw0rdfish").await;
    let added = call(
        &state,
        json!({
            "type": "group_add_user",
            "args": {"group_id": group_id, "user_id": bob_id},
            "session_id": alice_sid,
        }),
    )
    .await;
    assert_eq!(added["type"], "group_updated");

    let info = call(
        &state,
        json!({"type": "group_get", "args": {"group_id": group_id}, "session_id": alice_sid}),
    )
    .await;
    assert_eq!(info["type"], "group_info");
    assert_eq!(info["args"]["members"].as_array().unwrap().len(), 2);

    // Alice shares a secret with ops.
    let created = call(
        &state,
        json!({
            "type": "secret_create",
            "args": {
                "plaintext": "p@ss",
                "group_ids": [group_id],
                "meta": {"app": "db", "login": "root"},
            },
            "session_id": alice_sid,
        }),
    )
    .await;
    assert_eq!(created["type"], "secret_created");
    let secret_id = created["args"]["secret_id"].as_i64().unwrap();

    // Bob can read it, and sees who wrote it.
    let value = call(
        &state,
        json!({"type": "secret_unlock", "args": {"secret_id": secret_id}, "session_id": bob_sid}),
    )
    .await;
    assert_eq!(value["type"], "secret_value");
    assert_eq!(value["args"]["plaintext"], "p@ss");
    assert_eq!(value["args"]["metadata"]["app"], "db");
    assert_eq!(value["args"]["metadata"]["login"], "root");
    assert_eq!(value["args"]["value_author"]["login"], "alice");
    assert_eq!(value["args"]["groups"][0]["name"], "ops");

    // Glob search matches, a non-matching pattern does not.
    let hits = call(
        &state,
        json!({"type": "secret_search", "args": {"meta": {"app": "d*"}}, "session_id": bob_sid}),
    )
    .await;
    assert_eq!(hits["type"], "secret_list");
    assert_eq!(hits["args"]["secrets"].as_array().unwrap().len(), 1);
    assert_eq!(hits["args"]["secrets"][0]["secret_id"], secret_id);

    let misses = call(
        &state,
        json!({"type": "secret_search", "args": {"meta": {"app": "web"}}, "session_id": bob_sid}),
    )
    .await;
    assert!(misses["args"]["secrets"].as_array().unwrap().is_empty());

    // A user outside the group cannot even see the secret exists.
    let (_, charlie_sid) = create_active_user(&state, &alice_sid, "charlie", "pa55w0rd").await;
    let denied = call(
        &state,
        json!({"type": "secret_unlock", "args": {"secret_id": secret_id}, "session_id": charlie_sid}),
    )
    .await;
    assert_eq!(error_code(&denied), "SECRET/NOTFOUND");
    let empty = call(
        &state,
        json!({"type": "secret_search", "args": {"meta": {}}, "session_id": charlie_sid}),
    )
    .await;
    assert!(empty["args"]["secrets"].as_array().unwrap().is_empty());

    // Revoke bob: the secret disappears for him, in this session and in a
    // fresh login.
    let removed = call(
        &state,
        json!({
            "type": "group_remove_user",
            "args": {"group_id": group_id, "user_id": bob_id},
            "session_id": alice_sid,
        }),
    )
    .await;
    assert_eq!(removed["type"], "group_updated");

    let denied = call(
        &state,
        json!({"type": "secret_unlock", "args": {"secret_id": secret_id}, "session_id": bob_sid}),
    )
    .await;
    assert_eq!(error_code(&denied), "SECRET/NOTFOUND");

    let bob_sid = login(&state, "bob", "sw0rdfish").await;
    let denied = call(
        &state,
        json!({"type": "secret_unlock", "args": {"secret_id": secret_id}, "session_id": bob_sid}),
    )
    .await;
    assert_eq!(error_code(&denied), "SECRET/NOTFOUND");

    // Alice still reads it fine.
    let value = call(
        &state,
        json!({"type": "secret_unlock", "args": {"secret_id": secret_id}, "session_id": alice_sid}),
    )
    .await;
    assert_eq!(value["args"]["plaintext"], "p@ss");
}

#[tokio::test]
async fn secret_updates_fan_out_to_all_groups() {
    let state = new_state().await;
    let alice_sid = login(&state, "alice", "hunter2").await;

    let ops = call(
        &state,
        json!({"type": "group_create", "args": {"name": "ops"}, "session_id": alice_sid}),
    )
    .await["args"]["group_id"]
        .as_i64()
        .unwrap();
    let dba = call(
        &state,
        json!({"type": "group_create", "args": {"name": "dba"}, "session_id": alice_sid}),
    )
    .await["args"]["group_id"]
        .as_i64()
        .unwrap();

    let (bob_id, bob_sid) = create_active_user(&state, &alice_sid, "bob", "sw0rdfish").await;
    call(
        &state,
        json!({
            "type": "group_add_user",
            "args": {"group_id": dba, "user_id": bob_id},
            "session_id": alice_sid,
        }),
    )
    .await;

    let secret_id = call(
        &state,
        json!({
            "type": "secret_create",
            "args": {
                "plaintext": "old value",
                "group_ids": [ops, dba],
                "meta": {"app": "db"},
            },
            "session_id": alice_sid,
        }),
    )
    .await["args"]["secret_id"]
        .as_i64()
        .unwrap();

    // Bob (dba only) updates value and metadata.
    let updated = call(
        &state,
        json!({
            "type": "secret_update_value",
            "args": {"secret_id": secret_id, "plaintext": "new value"},
            "session_id": bob_sid,
        }),
    )
    .await;
    assert_eq!(updated["type"], "secret_updated");
    let updated = call(
        &state,
        json!({
            "type": "secret_update_meta",
            "args": {"secret_id": secret_id, "meta": {"login": "root"}},
            "session_id": bob_sid,
        }),
    )
    .await;
    assert_eq!(updated["type"], "secret_updated");

    // Alice reads through ops and sees bob's update with merged metadata.
    let value = call(
        &state,
        json!({"type": "secret_unlock", "args": {"secret_id": secret_id}, "session_id": alice_sid}),
    )
    .await;
    assert_eq!(value["args"]["plaintext"], "new value");
    assert_eq!(value["args"]["metadata"]["app"], "db");
    assert_eq!(value["args"]["metadata"]["login"], "root");
    assert_eq!(value["args"]["value_author"]["login"], "bob");
    assert_eq!(value["args"]["groups"].as_array().unwrap().len(), 2);

    // Delete, and it is gone for everyone.
    let deleted = call(
        &state,
        json!({"type": "secret_delete", "args": {"secret_id": secret_id}, "session_id": alice_sid}),
    )
    .await;
    assert_eq!(deleted["type"], "secret_deleted");
    let denied = call(
        &state,
        json!({"type": "secret_unlock", "args": {"secret_id": secret_id}, "session_id": bob_sid}),
    )
    .await;
    assert_eq!(error_code(&denied), "SECRET/NOTFOUND");
}

#[tokio::test]
async fn idle_session_expires() {
    let state = new_state_with(Config {
        database: ":memory:".to_string(),
        session_idle_timeout: 0,
        ..Config::default()
    })
    .await;

    let sid = login(&state, "alice", "hunter2").await;
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let response = call(&state, json!({"type": "ping", "args": {}, "session_id": sid})).await;
    assert_eq!(error_code(&response), "AUTH/BADSESSION");

    // Password authentication still works and issues a fresh session.
    login(&state, "alice", "hunter2").await;
}

#[tokio::test]
async fn password_change_rotates_session_and_keeps_secrets() {
    let state = new_state().await;
    let old_sid = login(&state, "alice", "hunter2").await;

    let group_id = call(
        &state,
        json!({"type": "group_create", "args": {"name": "ops"}, "session_id": old_sid}),
    )
    .await["args"]["group_id"]
        .as_i64()
        .unwrap();
    let secret_id = call(
        &state,
        json!({
            "type": "secret_create",
            "args": {"plaintext": "p@ss", "group_ids": [group_id], "meta": {"app": "db"}},
            "session_id": old_sid,
        }),
    )
    .await["args"]["secret_id"]
        .as_i64()
        .unwrap();

    let changed = call(
        &state,
        json!({
            "type": "user_change_password",
            "args": {"new_password": "newpw"},
            "session_id": old_sid,
        }),
    )
    .await;
    assert_eq!(changed["type"], "user_password_changed");
    let new_sid = session_id(&changed);
    assert_ne!(new_sid, old_sid);

    // The old session died with the old passphrase.
    let stale = call(&state, json!({"type": "ping", "args": {}, "session_id": old_sid})).await;
    assert_eq!(error_code(&stale), "AUTH/BADSESSION");

    // So did the old passphrase itself.
    let rejected = call(
        &state,
        json!({"type": "ping", "args": {}, "login": "alice", "password": "hunter2"}),
    )
    .await;
    assert_eq!(error_code(&rejected), "CRYPTO/RBNACL");

    // The rotated session and the new passphrase both still open the
    // secret.
    let value = call(
        &state,
        json!({"type": "secret_unlock", "args": {"secret_id": secret_id}, "session_id": new_sid}),
    )
    .await;
    assert_eq!(value["args"]["plaintext"], "p@ss");

    let fresh_sid = login(&state, "alice", "newpw").await;
    let value = call(
        &state,
        json!({"type": "secret_unlock", "args": {"secret_id": secret_id}, "session_id": fresh_sid}),
    )
    .await;
    assert_eq!(value["args"]["plaintext"], "p@ss");
}

#[tokio::test]
async fn request_validation_and_authorization() {
    let state = new_state().await;

    // Unparseable body.
    let raw = b"{not json";
    let response: Value =
        serde_json::from_str(&dispatcher::handle(&state, raw).await).unwrap();
    assert_eq!(error_code(&response), "MSG/INVALID");

    // No credentials and no session.
    let response = call(&state, json!({"type": "ping", "args": {}})).await;
    assert_eq!(error_code(&response), "MSG/INVALID");

    // Unknown request type.
    let response = call(
        &state,
        json!({"type": "frobnicate", "args": {}, "session_id": "whatever"}),
    )
    .await;
    assert_eq!(error_code(&response), "REQ/UNKNOWN");

    // Missing args.
    let response = call(
        &state,
        json!({"type": "group_create", "args": {}, "session_id": "whatever"}),
    )
    .await;
    assert_eq!(error_code(&response), "REQ/MISSINGARGS");

    let alice_sid = login(&state, "alice", "hunter2").await;

    // Bogus session id on a populated store.
    let response = call(
        &state,
        json!({"type": "ping", "args": {}, "session_id": "bogus"}),
    )
    .await;
    assert_eq!(error_code(&response), "AUTH/BADSESSION");

    // Plain users cannot administrate.
    let (_, bob_sid) = create_active_user(&state, &alice_sid, "bob", "sw0rdfish").await;
    let response = call(
        &state,
        json!({"type": "group_create", "args": {"name": "ops"}, "session_id": bob_sid}),
    )
    .await;
    assert_eq!(error_code(&response), "AUTH/FORBIDDEN");

    // Unknown login.
    let response = call(
        &state,
        json!({"type": "ping", "args": {}, "login": "nobody", "password": "x"}),
    )
    .await;
    assert_eq!(error_code(&response), "STORE/UNKNOWNUSER");

    // Unknown group on secret creation.
    let response = call(
        &state,
        json!({
            "type": "secret_create",
            "args": {"plaintext": "x", "group_ids": [999], "meta": {}},
            "session_id": alice_sid,
        }),
    )
    .await;
    assert_eq!(error_code(&response), "STORE/UNKNOWNGROUP");
}

#[tokio::test]
async fn group_lifecycle_rules() {
    let state = new_state().await;
    let alice_sid = login(&state, "alice", "hunter2").await;

    let group_id = call(
        &state,
        json!({"type": "group_create", "args": {"name": "ops"}, "session_id": alice_sid}),
    )
    .await["args"]["group_id"]
        .as_i64()
        .unwrap();

    let renamed = call(
        &state,
        json!({
            "type": "group_rename",
            "args": {"group_id": group_id, "name": "operations"},
            "session_id": alice_sid,
        }),
    )
    .await;
    assert_eq!(renamed["type"], "group_updated");

    let hits = call(
        &state,
        json!({"type": "group_search", "args": {"name": "oper*"}, "session_id": alice_sid}),
    )
    .await;
    assert_eq!(hits["args"]["groups"][0]["name"], "operations");

    // With another member present, deletion is refused.
    let (bob_id, _) = create_active_user(&state, &alice_sid, "bob", "sw0rdfish").await;
    call(
        &state,
        json!({
            "type": "group_add_user",
            "args": {"group_id": group_id, "user_id": bob_id},
            "session_id": alice_sid,
        }),
    )
    .await;
    let refused = call(
        &state,
        json!({"type": "group_delete", "args": {"group_id": group_id}, "session_id": alice_sid}),
    )
    .await;
    assert_eq!(error_code(&refused), "STORE/GROUPHASMEMBERS");

    call(
        &state,
        json!({
            "type": "group_remove_user",
            "args": {"group_id": group_id, "user_id": bob_id},
            "session_id": alice_sid,
        }),
    )
    .await;
    let deleted = call(
        &state,
        json!({"type": "group_delete", "args": {"group_id": group_id}, "session_id": alice_sid}),
    )
    .await;
    assert_eq!(deleted["type"], "group_deleted");
}

#[tokio::test]
async fn socket_roundtrip() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("kstor.socket");
    let config = Config {
        database: ":memory:".to_string(),
        socket: socket_path.to_str().unwrap().to_string(),
        nworkers: 2,
        ..Config::default()
    };

    let state = new_state_with(config.clone()).await;
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn({
        let config = config.clone();
        async move {
            server::serve(state, &config, async {
                let _ = stop_rx.await;
            })
            .await
        }
    });

    // Wait for the listener to come up.
    let mut stream = loop {
        match tokio::net::UnixStream::connect(&socket_path).await {
            Ok(stream) => break stream,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    };

    let request =
        serde_json::to_vec(&json!({
            "type": "ping", "args": {"payload": "over the wire"},
            "login": "alice", "password": "hunter2",
        }))
        .unwrap();
    stream.write_all(&request).await.unwrap();
    stream.shutdown().await.unwrap();

    let mut raw = String::new();
    stream.read_to_string(&mut raw).await.unwrap();
    let response: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(response["type"], "pong");
    assert_eq!(response["args"]["payload"], "over the wire");
    assert!(response["session_id"].is_string());

    stop_tx.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
