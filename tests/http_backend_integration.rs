use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::routing::{patch, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use uar_core::config::{ExporterConfig, RuntimeConfig};
use uar_core::domain::{EntityKind, RunRecord, TimelineEvent};
use uar_core::export::{EventExport, RunExport};
use uar_core::runtime::{ScriptedModel, ScriptedTurn};
use uar_core::{Agent, ExportError, HttpTelemetryBackend, RunOptions, Runtime, TelemetryBackend};

#[derive(Debug, Clone)]
struct CapturedRequest {
    method: Method,
    path: String,
    public_key: Option<String>,
    secret_key: Option<String>,
    body: Value,
}

#[derive(Clone, Default)]
struct Captured {
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl Captured {
    fn all(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn capture(
    State(state): State<Captured>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    state.requests.lock().unwrap().push(CapturedRequest {
        method,
        path: uri.path().to_string(),
        public_key: header("x-public-key"),
        secret_key: header("x-secret-key"),
        body,
    });
    StatusCode::OK
}

async fn spawn_server(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn capturing_server() -> (SocketAddr, Captured) {
    let captured = Captured::default();
    let app = Router::new()
        .route("/api/history", post(capture))
        .route("/api/history-events", post(capture))
        .route("/api/history/{id}", patch(capture))
        .with_state(captured.clone());
    (spawn_server(app).await, captured)
}

fn exporter_config(addr: SocketAddr) -> ExporterConfig {
    ExporterConfig {
        base_url: Some(format!("http://{addr}/api")),
        public_key: Some("pk-test".into()),
        secret_key: Some("sk-test".into()),
        ..ExporterConfig::default()
    }
}

#[tokio::test]
async fn test_backend_posts_json_with_keys() {
    let (addr, captured) = capturing_server().await;
    let config = exporter_config(addr);
    let backend =
        HttpTelemetryBackend::new(config.base_url.as_deref().unwrap(), &config).unwrap();

    let record = RunRecord::new("run-1", "agent-a", json!("question"), json!({}));
    backend
        .export_run(&RunExport {
            agent_id: "agent-a".into(),
            record,
        })
        .await
        .unwrap();

    let event = TimelineEvent::start(EntityKind::Agent, "run-1", "alpha", None);
    backend
        .export_event(&EventExport {
            agent_id: "agent-a".into(),
            run_id: "run-1".into(),
            event: event.clone(),
        })
        .await
        .unwrap();

    let requests = captured.all();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].method, Method::POST);
    assert_eq!(requests[0].path, "/api/history");
    assert_eq!(requests[0].body["record"]["id"], "run-1");
    assert_eq!(requests[0].public_key.as_deref(), Some("pk-test"));
    assert_eq!(requests[0].secret_key.as_deref(), Some("sk-test"));
    assert_eq!(requests[1].path, "/api/history-events");
    assert_eq!(requests[1].body["event"]["id"], event.id.as_str());
    assert_eq!(requests[1].body["event"]["name"], "agent:start");
}

#[tokio::test]
async fn test_backend_reports_error_status() {
    let app = Router::new().route(
        "/history",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
    );
    let addr = spawn_server(app).await;
    let backend =
        HttpTelemetryBackend::new(&format!("http://{addr}"), &ExporterConfig::default()).unwrap();

    let result = backend
        .export_run(&RunExport {
            agent_id: "agent-a".into(),
            record: RunRecord::new("run-1", "agent-a", json!(null), json!({})),
        })
        .await;

    match result {
        Err(ExportError::Status { status, message }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "boom");
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_runtime_exports_a_finished_run() {
    let (addr, captured) = capturing_server().await;
    let mut config = RuntimeConfig::default();
    config.exporter = exporter_config(addr);
    config.stream.grace_window_ms = 0;
    let runtime = Runtime::new(config).unwrap();

    let model = Arc::new(ScriptedModel::new([ScriptedTurn::text("hello there")]));
    let agent = Agent::builder("greeter", model).build(&runtime);
    let result = agent.generate_text("hi", RunOptions::new()).await.unwrap();
    runtime.flush().await;

    let requests = captured.all();
    let creates: Vec<_> = requests.iter().filter(|r| r.path == "/api/history").collect();
    assert_eq!(creates.len(), 1);
    assert_eq!(creates[0].body["record"]["id"], result.run_id.as_str());

    let events: Vec<_> = requests
        .iter()
        .filter(|r| r.path == "/api/history-events")
        .collect();
    assert_eq!(events.len(), 2);

    let patch_path = format!("/api/history/{}", result.run_id);
    let patches: Vec<_> = requests
        .iter()
        .filter(|r| r.method == Method::PATCH && r.path == patch_path)
        .collect();
    assert!(!patches.is_empty());
    assert!(
        patches
            .iter()
            .any(|p| p.body["status"] == "completed" && p.body["output"] == "hello there")
    );
}
