use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agentstream::analytics::{
    AnalyticsSink, FeedbackRecord, GuardrailViolation, Sentiment, StreamUsage,
};
use agentstream::config::{AppConfig, AuthConfig, RuntimeConfig, ServerConfig};
use agentstream::routing::dispatch::dispatch_request;
use agentstream::state::AppState;
use agentstream::transport::HttpRuntimeClient;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};

const RUNTIME_ARN: &str = "arn:aws:bedrock-agentcore:us-east-1:123456789012:runtime/weather_agent";

const WEATHER_NDJSON: &str = concat!(
    r#"{"type":"tool_use","tool_name":"get_weather","tool_input":{"city":"Oslo"},"tool_use_id":"t1"}"#,
    "\n",
    r#"{"type":"tool_result","tool_name":"get_weather","tool_result":"Sunny, 22C","tool_use_id":"t1"}"#,
    "\n",
    r#"{"type":"TextStreamEvent","text":"<thinking>user wants weather</thinking>It is sunny."}"#,
    "\n",
    r#"{"usage":{"inputTokens":12,"outputTokens":30,"totalTokens":42},"metrics":{"latencyMs":850}}"#,
    "\n",
);

#[derive(Default)]
struct RecordingSink {
    usage: Mutex<Vec<StreamUsage>>,
    violations: Mutex<Vec<GuardrailViolation>>,
    feedback: Mutex<Vec<FeedbackRecord>>,
}

impl AnalyticsSink for RecordingSink {
    fn record_usage(&self, usage: StreamUsage) {
        self.usage.lock().push(usage);
    }

    fn record_violation(&self, violation: GuardrailViolation) {
        self.violations.lock().push(violation);
    }

    fn record_feedback(&self, feedback: FeedbackRecord) {
        self.feedback.lock().push(feedback);
    }
}

#[derive(Default)]
struct MockRuntime {
    calls: AtomicUsize,
    fail_first: usize,
    fail_status: u16,
    seen_bodies: Mutex<Vec<Value>>,
    seen_sessions: Mutex<Vec<String>>,
}

async fn mock_invoke(
    State(mock): State<Arc<MockRuntime>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let call = mock.calls.fetch_add(1, Ordering::SeqCst);
    if call < mock.fail_first {
        let status =
            StatusCode::from_u16(mock.fail_status).unwrap_or(StatusCode::SERVICE_UNAVAILABLE);
        return (status, [("retry-after", "0")], "runtime unavailable").into_response();
    }

    mock.seen_bodies
        .lock()
        .push(serde_json::from_slice(&body).unwrap_or(Value::Null));
    if let Some(session) = headers
        .get("x-amzn-bedrock-agentcore-runtime-session-id")
        .and_then(|value| value.to_str().ok())
    {
        mock.seen_sessions.lock().push(session.to_string());
    }
    (
        [("content-type", "application/x-ndjson")],
        WEATHER_NDJSON,
    )
        .into_response()
}

async fn spawn_runtime(mock: Arc<MockRuntime>) -> String {
    let app = Router::new()
        .route("/runtimes/{arn}/invocations", post(mock_invoke))
        .with_state(mock);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn build_state(endpoint: String, sink: Arc<RecordingSink>) -> Arc<AppState> {
    let config = AppConfig {
        server: ServerConfig {
            body_limit_bytes: 256,
            ..ServerConfig::default()
        },
        runtime: RuntimeConfig {
            arn: RUNTIME_ARN.to_string(),
            region: "us-east-1".to_string(),
            endpoint: Some(endpoint),
            qualifier: None,
            bearer_token: Some("runtime-token".to_string()),
            connect_timeout_secs: 2,
            pool_max_idle_per_host: 4,
            default_model_id: "default-model".to_string(),
        },
        guardrail: agentstream::config::GuardrailConfig {
            id: Some("gr-1".to_string()),
            version: Some("1".to_string()),
            enabled: true,
        },
        storage: agentstream::config::StorageConfig::default(),
        auth: AuthConfig::default(),
        features: agentstream::config::FeaturesConfig::default(),
    };
    let runtime = Arc::new(HttpRuntimeClient::new(&config.runtime).unwrap());
    Arc::new(AppState::new(config, runtime, sink).unwrap())
}

fn chat_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .header("x-user-id", "user-42")
        .header("x-user-email", "user42@example.com")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn send(state: &Arc<AppState>, request: Request<Body>) -> Response {
    dispatch_request(Arc::clone(state), Arc::<str>::from(""), request)
        .await
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn sse_frames(body: &str) -> Vec<Value> {
    body.split("\n\n")
        .filter(|frame| !frame.is_empty())
        .map(|frame| {
            let payload = frame.strip_prefix("data: ").expect("data frame");
            serde_json::from_str(payload).expect("json frame")
        })
        .collect()
}

#[tokio::test]
async fn test_chat_streams_normalized_events() {
    let mock = Arc::new(MockRuntime::default());
    let endpoint = spawn_runtime(Arc::clone(&mock)).await;
    let sink = Arc::new(RecordingSink::default());
    let state = build_state(endpoint, Arc::clone(&sink));

    let response = send(
        &state,
        chat_request(r#"{"prompt":"Weather in Oslo?","session_id":"session-abc"}"#),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");
    assert_eq!(response.headers()["x-accel-buffering"], "no");

    let frames = sse_frames(&body_text(response).await);
    let kinds: Vec<&str> = frames
        .iter()
        .map(|frame| frame["type"].as_str().unwrap())
        .collect();
    assert_eq!(
        kinds,
        vec!["tool_use", "tool_result", "message", "metadata", "done"]
    );
    assert_eq!(frames[0]["tool_use_id"], "t1");
    assert_eq!(frames[0]["tool_input"], json!({"city": "Oslo"}));
    assert_eq!(frames[1]["status"], "completed");
    assert_eq!(frames[2]["content"], "It is sunny.");
    assert_eq!(frames[3]["data"]["totalTokens"], 42);

    let bodies = mock.seen_bodies.lock();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0]["prompt"], "Weather in Oslo?");
    assert_eq!(bodies[0]["sessionId"], "session-abc");
    assert_eq!(bodies[0]["userId"], "user-42");
    assert_eq!(bodies[0]["modelId"], "default-model");
    assert_eq!(bodies[0]["guardrailId"], "gr-1");
    assert_eq!(bodies[0]["guardrailEnabled"], true);
    assert_eq!(*mock.seen_sessions.lock(), vec!["session-abc".to_string()]);

    let usage = sink.usage.lock();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].user_id, "user-42");
    assert_eq!(usage[0].user_email.as_deref(), Some("user42@example.com"));
    assert_eq!(usage[0].total_tokens, 42);
    assert_eq!(usage[0].tool_usage["get_weather"].success_count, 1);
}

#[tokio::test]
async fn test_chat_retries_unavailable_runtime() {
    let mock = Arc::new(MockRuntime {
        fail_first: 1,
        fail_status: 503,
        ..MockRuntime::default()
    });
    let endpoint = spawn_runtime(Arc::clone(&mock)).await;
    let state = build_state(endpoint, Arc::new(RecordingSink::default()));

    let response = send(
        &state,
        chat_request(r#"{"prompt":"hi","session_id":"s-1","model_id":"custom-model"}"#),
    )
    .await;
    let frames = sse_frames(&body_text(response).await);
    assert_eq!(frames.last().unwrap()["type"], "done");
    assert_eq!(mock.calls.load(Ordering::SeqCst), 2);
    assert_eq!(mock.seen_bodies.lock()[0]["modelId"], "custom-model");
}

#[tokio::test]
async fn test_chat_reports_runtime_rejection_in_stream() {
    let mock = Arc::new(MockRuntime {
        fail_first: usize::MAX,
        fail_status: 403,
        ..MockRuntime::default()
    });
    let endpoint = spawn_runtime(Arc::clone(&mock)).await;
    let sink = Arc::new(RecordingSink::default());
    let state = build_state(endpoint, Arc::clone(&sink));

    let response = send(&state, chat_request(r#"{"prompt":"hi","session_id":"s-1"}"#)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let frames = sse_frames(&body_text(response).await);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "error");
    assert_eq!(frames[0]["message"], "Failed to invoke agent runtime");
    assert!(frames[0]["details"]
        .as_str()
        .unwrap()
        .contains("status=403"));
    // 403 is not retriable.
    assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    assert_eq!(sink.usage.lock().len(), 1);
}

#[tokio::test]
async fn test_chat_rejections_before_streaming() {
    let mock = Arc::new(MockRuntime::default());
    let endpoint = spawn_runtime(Arc::clone(&mock)).await;
    let state = build_state(endpoint, Arc::new(RecordingSink::default()));

    let anonymous = Request::builder()
        .method("POST")
        .uri("/api/chat")
        .body(Body::from(r#"{"prompt":"hi","session_id":"s-1"}"#))
        .unwrap();
    let response = send(&state, anonymous).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let detail: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(detail["detail"], "Missing user identity");

    let response = send(&state, chat_request(r#"{"prompt":"   ","session_id":"s-1"}"#)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let oversized = format!(
        r#"{{"prompt":"{}","session_id":"s-1"}}"#,
        "x".repeat(1024)
    );
    let response = send(&state, chat_request(&oversized)).await;
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    assert_eq!(mock.calls.load(Ordering::SeqCst), 0);
}

fn feedback_request(body: &str, user_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/feedback")
        .header("content-type", "application/json");
    if let Some(user_id) = user_id {
        builder = builder.header("x-user-id", user_id);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

#[tokio::test]
async fn test_feedback_is_recorded() {
    let sink = Arc::new(RecordingSink::default());
    let state = build_state("http://127.0.0.1:9".to_string(), Arc::clone(&sink));

    let body = r#"{"session_id":"s-1","message_id":"m-7","user_message":"Oslo?","assistant_response":"Sunny","tools_used":["get_weather"],"sentiment":"positive","user_comment":"spot on"}"#;
    let response = send(&state, feedback_request(body, Some("user-42"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let reply: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(
        reply,
        json!({
            "status": "success",
            "message": "Feedback recorded",
            "message_id": "m-7",
            "sentiment": "positive"
        })
    );

    let recorded = sink.feedback.lock();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].user_id, "user-42");
    assert_eq!(recorded[0].session_id, "s-1");
    assert_eq!(recorded[0].tools_used, vec!["get_weather"]);
    assert_eq!(recorded[0].sentiment, Sentiment::Positive);
    assert_eq!(recorded[0].user_comment.as_deref(), Some("spot on"));
    assert!(recorded[0].timestamp.ends_with('Z'));
}

#[tokio::test]
async fn test_feedback_rejections() {
    let sink = Arc::new(RecordingSink::default());
    let state = build_state("http://127.0.0.1:9".to_string(), Arc::clone(&sink));

    let body = r#"{"session_id":"s-1","message_id":"m-7","user_message":"q","assistant_response":"a","sentiment":"meh"}"#;
    let response = send(&state, feedback_request(body, Some("user-42"))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let detail: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(detail["detail"], "sentiment must be 'positive' or 'negative'");

    let body = r#"{"session_id":"s-1","message_id":"m-7","user_message":"q","assistant_response":"a","sentiment":"negative"}"#;
    let response = send(&state, feedback_request(body, None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let request = Request::builder()
        .method("GET")
        .uri("/api/feedback")
        .body(Body::empty())
        .unwrap();
    let response = send(&state, request).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    assert!(sink.feedback.lock().is_empty());
}

#[tokio::test]
async fn test_routes_outside_chat() {
    let state = build_state("http://127.0.0.1:9".to_string(), Arc::new(RecordingSink::default()));

    let request = Request::builder()
        .method("OPTIONS")
        .uri("/api/chat")
        .body(Body::empty())
        .unwrap();
    let response = send(&state, request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let request = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let response = send(&state, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let health: Value = serde_json::from_str(&body_text(response).await).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["runtime"]["arn"], RUNTIME_ARN);
    assert_eq!(health["storage"], "memory");

    let request = Request::builder()
        .method("GET")
        .uri("/api/chat")
        .body(Body::empty())
        .unwrap();
    let response = send(&state, request).await;
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let request = Request::builder()
        .method("GET")
        .uri("/v1/models")
        .body(Body::empty())
        .unwrap();
    let response = send(&state, request).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
