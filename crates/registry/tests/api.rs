use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use envspot_auth::{IdentityClient, IdentityClientConfig};
use envspot_registry::http::{AppState, router_with_state};
use envspot_registry::service::RegistryService;
use envspot_store::InMemoryStore;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

#[derive(Default)]
struct MockIdentity {
    rights: BTreeMap<(String, String), u8>,
    added: BTreeMap<String, BTreeSet<String>>,
    fail_init_rights: bool,
}

type Shared = Arc<Mutex<MockIdentity>>;

fn rank(right: &str) -> u8 {
    match right {
        "READ" => 1,
        "WRITE" => 2,
        "DELETE" => 3,
        _ => u8::MAX,
    }
}

fn account(headers: &HeaderMap) -> Result<String, StatusCode> {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    match value {
        "Bearer alice" => Ok("alice".to_string()),
        "Bearer bob" => Ok("bob".to_string()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn validate(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    Ok(Json(json!({"account_id": account(&headers)?})))
}

async fn check(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let Ok(account) = account(&headers) else {
        return StatusCode::UNAUTHORIZED;
    };
    let app = body["application_id"].as_str().unwrap_or_default().to_string();
    let wanted = rank(body["access_right"].as_str().unwrap_or_default());
    let state = state.lock().unwrap();
    match state.rights.get(&(account, app)) {
        Some(granted) if *granted >= wanted => StatusCode::OK,
        _ => StatusCode::FORBIDDEN,
    }
}

async fn init(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    if account(&headers).is_err() {
        return StatusCode::UNAUTHORIZED;
    }
    let mut state = state.lock().unwrap();
    if state.fail_init_rights {
        return StatusCode::BAD_GATEWAY;
    }
    let key = (
        body["account_id"].as_str().unwrap_or_default().to_string(),
        body["application_id"].as_str().unwrap_or_default().to_string(),
    );
    state
        .rights
        .insert(key, rank(body["access_right"].as_str().unwrap_or_default()));
    StatusCode::OK
}

async fn available(
    State(state): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Result<String, StatusCode> {
    account(&headers)?;
    let account = query.get("account_id").cloned().unwrap_or_default();
    let state = state.lock().unwrap();
    Ok(state
        .rights
        .keys()
        .filter(|(owner, _)| *owner == account)
        .map(|(_, app)| format!("{{\"application_id\":\"{}\"}}\n", app))
        .collect())
}

async fn link(
    State(state): State<Shared>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let Ok(account) = account(&headers) else {
        return StatusCode::UNAUTHORIZED;
    };
    let app = body["application_id"].as_str().unwrap_or_default().to_string();
    state
        .lock()
        .unwrap()
        .added
        .entry(account)
        .or_default()
        .insert(app);
    StatusCode::OK
}

async fn account_apps(
    State(state): State<Shared>,
    Path(account_id): Path<String>,
) -> Json<Value> {
    let state = state.lock().unwrap();
    let apps: Vec<String> = state
        .added
        .get(&account_id)
        .map(|apps| apps.iter().cloned().collect())
        .unwrap_or_default();
    Json(json!({"apps": apps}))
}

fn mock_identity(state: Shared) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/v1/authorization/validate", post(validate))
        .route("/v1/authorization/account-id", post(validate))
        .route("/v1/rights/check", post(check))
        .route("/v1/rights/init", post(init))
        .route("/v1/rights/available-apps", get(available))
        .route("/v1/accounts/apps", post(link))
        .route("/v1/accounts/{account_id}/apps", get(account_apps))
        .with_state(state)
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

struct Harness {
    base: String,
    client: reqwest::Client,
    identity: Shared,
    shutdowns: Vec<oneshot::Sender<()>>,
}

impl Harness {
    async fn start() -> Self {
        let identity = Shared::default();
        let (identity_addr, identity_shutdown, _) =
            spawn_server(mock_identity(identity.clone())).await;

        let store = InMemoryStore::new();
        let client = IdentityClient::new(IdentityClientConfig {
            base_url: format!("http://{}", identity_addr),
            timeout: Duration::from_secs(2),
        })
        .expect("identity client should build");
        let service = RegistryService::new(
            Arc::new(store.clone()),
            Arc::new(store),
            Arc::new(client),
        );
        let (addr, registry_shutdown, _) =
            spawn_server(router_with_state(AppState::new(service))).await;

        Self {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            identity,
            shutdowns: vec![identity_shutdown, registry_shutdown],
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        user: &str,
        body: Option<Value>,
    ) -> reqwest::Response {
        let mut request = self
            .client
            .request(method, self.url(path))
            .bearer_auth(user);
        if let Some(body) = body {
            request = request.json(&body);
        }
        request.send().await.expect("request should reach registry")
    }

    async fn ndjson(&self, path: &str, user: &str) -> Vec<Value> {
        let response = self.send(reqwest::Method::GET, path, user, None).await;
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok()),
            Some("application/x-ndjson")
        );
        let text = response.text().await.expect("body should be text");
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).expect("line should be JSON"))
            .collect()
    }

    fn stop(self) {
        for tx in self.shutdowns {
            let _ = tx.send(());
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn application_and_contour_walkthrough() {
    let h = Harness::start().await;
    use reqwest::Method;

    let response = h
        .send(
            Method::POST,
            "/v1/applications",
            "alice",
            Some(json!({"name": "payments"})),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let app: Value = response.json().await.unwrap();
    let app_id = app["id"].as_str().unwrap().to_string();
    assert_eq!(app["name"], "payments");
    assert_eq!(app["description"], "");

    let response = h
        .send(
            Method::POST,
            &format!("/v1/applications/{app_id}/contours"),
            "alice",
            Some(json!({"name": "staging"})),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);
    let contour: Value = response.json().await.unwrap();
    let contour_id = contour["id"].as_str().unwrap().to_string();
    assert_eq!(contour["application_id"], app_id.as_str());

    let full: Value = h
        .send(Method::GET, &format!("/v1/applications/{app_id}"), "alice", None)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(full["contours"], json!([contour_id]));

    let response = h
        .send(
            Method::POST,
            &format!("/v1/contours/{contour_id}/services"),
            "alice",
            Some(json!({"services": [{"project": "api", "environment": "staging"}]})),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    let fetched: Value = h
        .send(Method::GET, &format!("/v1/contours/{contour_id}"), "alice", None)
        .await
        .json()
        .await
        .unwrap();
    let services = fetched["services"].as_array().unwrap();
    assert_eq!(services.len(), 1);
    let service_id = services[0]["id"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let response = h
            .send(
                Method::DELETE,
                &format!("/v1/contours/{contour_id}/services/{service_id}"),
                "alice",
                None,
            )
            .await;
        assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
    }
    let fetched: Value = h
        .send(Method::GET, &format!("/v1/contours/{contour_id}"), "alice", None)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["services"], json!([]));

    let listed = h
        .ndjson(&format!("/v1/applications/{app_id}/contours"), "alice")
        .await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["name"], "staging");

    let response = h
        .send(
            Method::DELETE,
            &format!("/v1/applications/{app_id}/contours/{contour_id}?name=staging"),
            "alice",
            None,
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);
    assert!(
        h.ndjson(&format!("/v1/applications/{app_id}/contours"), "alice")
            .await
            .is_empty()
    );

    let added = h.ndjson("/v1/applications?added=true", "alice").await;
    assert_eq!(added.len(), 1);
    assert_eq!(added[0]["id"], app_id.as_str());

    h.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn errors_use_the_shared_body_and_status_mapping() {
    let h = Harness::start().await;
    use reqwest::Method;

    let response = h
        .client
        .get(h.url("/v1/applications"))
        .header("x-envspot-request-id", "req-42")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    assert_eq!(
        response
            .headers()
            .get("x-envspot-request-id")
            .and_then(|v| v.to_str().ok()),
        Some("req-42")
    );
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "UNAUTHENTICATED");
    assert_eq!(body["retryable"], false);

    let app: Value = h
        .send(
            Method::POST,
            "/v1/applications",
            "alice",
            Some(json!({"name": "payments"})),
        )
        .await
        .json()
        .await
        .unwrap();
    let app_id = app["id"].as_str().unwrap().to_string();

    let response = h
        .send(
            Method::POST,
            "/v1/applications",
            "alice",
            Some(json!({"name": "payments"})),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "ALREADY_EXISTS");

    let response = h
        .send(
            Method::DELETE,
            &format!("/v1/applications/{app_id}?name=billing"),
            "alice",
            None,
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CONFLICT);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["code"], "ABORTED");

    let response = h
        .send(
            Method::POST,
            "/v1/applications",
            "alice",
            Some(json!({"name": "x", "owner": "me"})),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let response = h
        .send(Method::GET, "/v1/contours/missing", "alice", None)
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let response = h
        .send(Method::GET, &format!("/v1/applications/{app_id}"), "bob", None)
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    assert!(h.ndjson("/v1/applications", "bob").await.is_empty());

    let response = h
        .send(
            Method::DELETE,
            &format!("/v1/applications/{app_id}?name=payments"),
            "alice",
            None,
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::NO_CONTENT);

    h.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_rights_registration_rolls_back_create() {
    let h = Harness::start().await;
    h.identity.lock().unwrap().fail_init_rights = true;

    let response = h
        .send(
            reqwest::Method::POST,
            "/v1/applications",
            "alice",
            Some(json!({"name": "payments"})),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["retryable"], true);

    h.identity.lock().unwrap().fail_init_rights = false;
    let response = h
        .send(
            reqwest::Method::POST,
            "/v1/applications",
            "alice",
            Some(json!({"name": "payments"})),
        )
        .await;
    assert_eq!(response.status(), reqwest::StatusCode::CREATED);

    let metrics = h
        .client
        .get(h.url("/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("envspot_registry_compensations_total"));
    assert!(metrics.contains("envspot_registry_http_requests_total"));

    h.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readiness_reports_each_dependency() {
    let h = Harness::start().await;

    let response = h.client.get(h.url("/readyz")).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["checks"]["store"], true);
    assert_eq!(body["checks"]["identity"], true);

    let health = h.client.get(h.url("/healthz")).send().await.unwrap();
    assert_eq!(health.text().await.unwrap(), "ok");

    h.stop();
}
