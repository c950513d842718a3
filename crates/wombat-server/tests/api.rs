use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt;
use wombat_config::{Config, Generation, Logging, Mediation, Server, Store};
use wombat_server::{
    build_app, build_app_with, verify_journal, GenerationError, Generator, BS_METER_FALLBACK,
    USER_HEADER,
};

struct Canned;

#[async_trait]
impl Generator for Canned {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let tag = if prompt.contains("**Wager:**") {
            "wager"
        } else if prompt.contains("**Begin Analysis:**") {
            "verdict"
        } else {
            "remark"
        };
        Ok(format!("wombat {tag}"))
    }
}

fn unique(prefix: &str, ext: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before unix epoch")
        .as_nanos();
    std::env::temp_dir()
        .join(format!("{prefix}-{nanos}.{ext}"))
        .to_string_lossy()
        .to_string()
}

fn test_config() -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        store: Store {
            kind: "memory".to_string(),
            sqlite_path: None,
        },
        generation: Generation {
            mode: "disabled".to_string(),
            endpoint: None,
            api_key_env: "WOMBAT_GENERATION_API_KEY".to_string(),
            timeout_ms: 1000,
            retry_max_attempts: 1,
            retry_backoff_ms: 0,
            circuit_breaker_failures: 5,
            circuit_breaker_open_ms: 30_000,
        },
        mediation: Mediation {
            max_write_attempts: 5,
            checkpoint_retry_attempts: 3,
            checkpoint_retry_backoff_ms: 10,
        },
        journal: wombat_config::Journal {
            jsonl_path: unique("wombat-api-journal", "jsonl"),
        },
        logging: Logging::default(),
    }
}

fn test_config_sqlite(db_path: &str) -> Config {
    let mut cfg = test_config();
    cfg.store.kind = "sqlite".to_string();
    cfg.store.sqlite_path = Some(db_path.to_string());
    cfg
}

async fn call(
    app: &Router,
    method: &str,
    uri: &str,
    user: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder.header(USER_HEADER, user);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

async fn act(app: &Router, user: &str, id: &str, action: Value) -> Value {
    let (status, body) = call(
        app,
        "POST",
        &format!("/v1/problems/{id}/actions"),
        Some(user),
        Some(action.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{action} by {user}: {body}");
    body
}

async fn open_problem(app: &Router) -> String {
    let (status, _) = call(
        app,
        "POST",
        "/v1/partners",
        Some("user2"),
        Some(json!({ "inviter_id": "user1" })),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = call(app, "POST", "/v1/problems", Some("user1"), None).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["problem"]["id"].as_str().unwrap().to_string()
}

async fn wait_for_field(app: &Router, id: &str, field: &str) -> Value {
    for _ in 0..200 {
        let (_, body) = call(app, "GET", &format!("/v1/problems/{id}"), Some("user1"), None).await;
        if body["problem"][field]
            .as_str()
            .map(|v| !v.is_empty())
            .unwrap_or(false)
        {
            return body;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("{field} never delivered for {id}");
}

#[tokio::test]
async fn healthz_ok() {
    let app = build_app(test_config()).await.unwrap();
    let (status, _) = call(&app, "GET", "/v1/healthz", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn requests_without_identity_are_unauthorized() {
    let app = build_app(test_config()).await.unwrap();
    let (status, body) = call(&app, "GET", "/v1/problems", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["code"], "unauthenticated");
}

#[tokio::test]
async fn full_negotiation_over_http() {
    let cfg = test_config();
    let journal_path = cfg.journal.jsonl_path.clone();
    let app = build_app_with(cfg, Arc::new(Canned)).await.unwrap();
    let id = open_problem(&app).await;

    act(&app, "user1", &id, json!({ "action": "edit_problem_statement", "text": "Chores" })).await;
    act(&app, "user2", &id, json!({ "action": "agree_problem" })).await;
    let body = act(&app, "user1", &id, json!({ "action": "agree_problem" })).await;
    assert_eq!(body["problem"]["status"], "private_versions");

    act(&app, "user1", &id, json!({ "action": "submit_private_version", "text": "I cook" })).await;
    act(&app, "user2", &id, json!({ "action": "submit_private_version", "text": "I clean" })).await;
    act(&app, "user2", &id, json!({ "action": "advance_to_steelman" })).await;
    act(&app, "user1", &id, json!({ "action": "submit_steelman", "text": "they clean" })).await;
    act(&app, "user2", &id, json!({ "action": "submit_steelman", "text": "they cook" })).await;
    act(&app, "user1", &id, json!({ "action": "approve_steelman" })).await;
    let body = act(&app, "user2", &id, json!({ "action": "approve_steelman" })).await;
    assert_eq!(body["problem"]["status"], "ai_review");

    let body = wait_for_field(&app, &id, "ai_analysis").await;
    assert_eq!(body["problem"]["ai_analysis"], "wombat verdict");
    act(&app, "user1", &id, json!({ "action": "advance_to_propose_solutions" })).await;
    act(&app, "user1", &id, json!({ "action": "propose_solution", "text": "rota" })).await;
    act(&app, "user2", &id, json!({ "action": "propose_solution", "text": "cleaner" })).await;
    act(&app, "user1", &id, json!({ "action": "submit_solution_steelman", "text": "pay" })).await;
    let turns = json!({ "action": "submit_solution_steelman", "text": "turns" });
    let body = act(&app, "user2", &id, turns).await;
    assert_eq!(body["problem"]["status"], "wager");

    let body = wait_for_field(&app, &id, "wombats_wager").await;
    assert_eq!(body["problem"]["wombats_wager"], "wombat wager");
    assert_eq!(body["problem"]["status"], "wager");
    act(&app, "user2", &id, json!({ "action": "advance_to_solution" })).await;
    let body = act(&app, "user1", &id, json!({ "action": "brainstorm" })).await;
    assert_eq!(body["problem"]["brainstormed_solutions"], "wombat remark");
    assert_eq!(body["problem"]["status"], "solution");
    act(&app, "user1", &id, json!({ "action": "agree_solution" })).await;
    let body = act(&app, "user2", &id, json!({ "action": "agree_solution" })).await;
    assert_eq!(body["outcome"], "applied");
    assert_eq!(body["problem"]["status"], "resolved");
    assert!(body["problem"]["solution_check_date"].is_string());

    let (status, body) = call(
        &app,
        "POST",
        &format!("/v1/problems/{id}/actions"),
        Some("user1"),
        Some(json!({ "action": "submit_post_mortem", "text": "too soon" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "out_of_sequence");

    let (_, body) = call(&app, "GET", &format!("/v1/problems/{id}"), Some("user2"), None).await;
    assert_eq!(body["view"]["state"], "loaded");
    assert_eq!(body["view"]["my_role"], "role_b");
    assert_eq!(body["view"]["agreed_solution"], json!({ "mine": true, "partner": true }));
    assert_eq!(body["view"]["post_mortem_open"], false);

    assert!(verify_journal(&journal_path).unwrap().contains("records"));
}

#[tokio::test]
async fn repeated_and_premature_actions() {
    let app = build_app(test_config()).await.unwrap();
    let id = open_problem(&app).await;

    act(&app, "user1", &id, json!({ "action": "agree_problem" })).await;
    let again = act(&app, "user1", &id, json!({ "action": "agree_problem" })).await;
    assert_eq!(again["outcome"], "already_handled");
    assert!(again["reason"].as_str().unwrap().contains("already agreed"));

    let (status, body) = call(
        &app,
        "POST",
        &format!("/v1/problems/{id}/actions"),
        Some("user2"),
        Some(json!({ "action": "advance_to_steelman" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "out_of_sequence");

    let (status, _) = call(
        &app,
        "POST",
        &format!("/v1/problems/{id}/actions"),
        Some("user1"),
        Some(json!({ "action": "set_ai_analysis", "text": "I win" })),
    )
    .await;
    assert!(status.is_client_error());

    let edit = json!({ "action": "edit_problem_statement", "text": "new" });
    let locked = act(&app, "user1", &id, edit).await;
    assert_eq!(locked["outcome"], "already_handled");
    assert_eq!(locked["problem"]["problem_statement"], "");

    let (status, body) = call(
        &app,
        "POST",
        &format!("/v1/problems/{id}/actions"),
        Some("user2"),
        Some(json!({ "action": "edit_problem_statement", "text": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "invalid_payload");
}

#[tokio::test]
async fn outsiders_and_unknown_problems() {
    let app = build_app(test_config()).await.unwrap();
    let id = open_problem(&app).await;

    let path = format!("/v1/problems/{id}");
    let (status, body) = call(&app, "GET", &path, Some("mallory"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["code"], "not_participant");

    let missing = "/v1/problems/does-not-exist";
    let (status, body) = call(&app, "GET", missing, Some("user1"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");

    let (status, body) = call(&app, "POST", "/v1/problems", Some("loner"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "not_paired");

    let (status, body) = call(
        &app,
        "POST",
        "/v1/partners",
        Some("user3"),
        Some(json!({ "inviter_id": "user1" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "linking_conflict");
}

#[tokio::test]
async fn partner_private_version_is_hidden_until_translation() {
    let app = build_app(test_config()).await.unwrap();
    let id = open_problem(&app).await;
    act(&app, "user1", &id, json!({ "action": "agree_problem" })).await;
    act(&app, "user2", &id, json!({ "action": "agree_problem" })).await;
    let secret = json!({ "action": "submit_private_version", "text": "my secret" });
    act(&app, "user2", &id, secret).await;

    let (_, body) = call(&app, "GET", &format!("/v1/problems/{id}"), Some("user1"), None).await;
    assert_eq!(body["problem"]["sides"]["role_b"]["private_version"], "");
    assert_eq!(body["problem"]["sides"]["role_b"]["translation"], "");
    assert_eq!(body["view"]["submitted_private"]["partner"], true);

    let (_, body) = call(&app, "GET", &format!("/v1/problems/{id}"), Some("user2"), None).await;
    assert_eq!(body["problem"]["sides"]["role_b"]["private_version"], "my secret");
    assert_eq!(
        body["problem"]["sides"]["role_b"]["translation"],
        "Translation failed."
    );

    let mine = json!({ "action": "submit_private_version", "text": "mine" });
    let body = act(&app, "user1", &id, mine).await;
    assert_eq!(body["problem"]["status"], "translation");
    assert_eq!(body["problem"]["sides"]["role_b"]["private_version"], "my secret");
}

#[tokio::test]
async fn wombat_remarks_fall_back_when_generation_is_disabled() {
    let app = build_app(test_config()).await.unwrap();
    let (status, body) = call(
        &app,
        "POST",
        "/v1/wombat/bs-meter",
        Some("user1"),
        Some(json!({ "text": "I totally see your point, as always" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["text"], BS_METER_FALLBACK);

    let (status, body) = call(&app, "POST", "/v1/wombat/emergency", Some("user1"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!body["text"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn sqlite_backend_lists_newest_first() {
    let db_path = unique("wombat-api", "db");
    let app = build_app(test_config_sqlite(&db_path)).await.unwrap();
    let first = open_problem(&app).await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let (status, body) = call(&app, "POST", "/v1/problems", Some("user2"), None).await;
    assert_eq!(status, StatusCode::CREATED);
    let second = body["problem"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["problem"]["participants"]["role_a"], "user2");

    let (status, body) = call(&app, "GET", "/v1/problems", Some("user1"), None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec![second.as_str(), first.as_str()]);
}
