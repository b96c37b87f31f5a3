//! Shared helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use fleetgate::fleet::{FleetError, Orchestrator};
use fleetgate::notifier::{AlertEvent, AlertNotifier};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

// ============================================================================
// Mock backends
// ============================================================================

/// How a mock backend answers
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// 200 with "METHOD /path?query", the X-Test header and the request body;
    /// the received X-Request-Id comes back as X-Seen-Request-Id
    Echo,
    /// Always answer with this status
    Status(u16),
    /// Sleep before answering 200
    Delay(Duration),
}

/// An HTTP server on 127.0.0.1 counting the requests it receives
pub struct MockBackend {
    pub port: u16,
    hits: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    /// Start on an ephemeral port
    pub async fn start(behavior: Behavior) -> Self {
        Self::start_on(0, behavior).await
    }

    /// Start on a specific port
    pub async fn start_on(port: u16, behavior: Behavior) -> Self {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind mock backend");
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        let handle = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        counter.fetch_add(1, Ordering::SeqCst);
                        respond(req, behavior)
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self { port, hits, handle }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn respond(
    req: Request<Incoming>,
    behavior: Behavior,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match behavior {
        Behavior::Echo => {
            let method = req.method().clone();
            let target = req
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str().to_string())
                .unwrap_or_default();
            let header = req
                .headers()
                .get("x-test")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let request_id = req
                .headers()
                .get("x-request-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            let body = req
                .into_body()
                .collect()
                .await
                .map(|b| b.to_bytes())
                .unwrap_or_default();
            let text = format!(
                "{} {}\nx-test: {}\n{}",
                method,
                target,
                header,
                String::from_utf8_lossy(&body)
            );
            Response::builder()
                .status(StatusCode::OK)
                .header("x-backend", "mock")
                .header("x-seen-request-id", request_id)
                .body(Full::new(Bytes::from(text)))
                .unwrap()
        }
        Behavior::Status(code) => Response::builder()
            .status(code)
            .body(Full::new(Bytes::from(format!("status {}", code))))
            .unwrap(),
        Behavior::Delay(delay) => {
            tokio::time::sleep(delay).await;
            Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::from("slow")))
                .unwrap()
        }
    };
    Ok(response)
}

/// A port with nothing listening on it
pub fn unused_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

// ============================================================================
// HTTP client helpers
// ============================================================================

pub struct TestResponse {
    pub status: StatusCode,
    pub headers: hyper::HeaderMap,
    pub body: String,
}

impl TestResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).expect("JSON body")
    }

    pub fn error_code(&self) -> Option<&str> {
        self.headers
            .get("x-gateway-error")
            .and_then(|v| v.to_str().ok())
    }
}

pub async fn send(port: u16, method: Method, path: &str, body: &str) -> TestResponse {
    let client: Client<_, Full<Bytes>> =
        Client::builder(TokioExecutor::new()).build_http();
    let req = Request::builder()
        .method(method)
        .uri(format!("http://127.0.0.1:{}{}", port, path))
        .header("x-test", "forwarded")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap();

    let response = client.request(req).await.expect("gateway request");
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.expect("response body").to_bytes();

    TestResponse {
        status: parts.status,
        headers: parts.headers,
        body: String::from_utf8_lossy(&bytes).into_owned(),
    }
}

pub async fn get(port: u16, path: &str) -> TestResponse {
    send(port, Method::GET, path, "").await
}

/// Wait for a port to accept connections
pub async fn wait_for_port(port: u16, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

// ============================================================================
// Fakes
// ============================================================================

/// Orchestrator recording every invocation instead of running docker-compose
#[derive(Default)]
pub struct FakeOrchestrator {
    calls: Mutex<Vec<Vec<String>>>,
    fail_on: Option<String>,
}

impl FakeOrchestrator {
    /// Fail every invocation whose arguments contain `arg`
    pub fn failing_on(arg: &str) -> Self {
        Self {
            fail_on: Some(arg.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    /// Invocations with the manifest flag stripped, e.g. `["restart", "billing"]`
    pub fn commands(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .map(|args| match args.first().map(String::as_str) {
                Some("-f") => args[2..].to_vec(),
                _ => args,
            })
            .collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.first().map(String::as_str) == Some(command))
            .count()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn invoke(&self, args: &[String]) -> Result<(), FleetError> {
        self.calls.lock().push(args.to_vec());
        match &self.fail_on {
            Some(arg) if args.contains(arg) => Err(FleetError::CommandFailed {
                command: args.join(" "),
                status: "exit status: 1".to_string(),
                stderr: "simulated failure".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Notifier counting alerts per backend
#[derive(Default)]
pub struct CountingNotifier {
    events: Mutex<Vec<AlertEvent>>,
}

impl CountingNotifier {
    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn backends(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.backend.clone()).collect()
    }
}

impl AlertNotifier for CountingNotifier {
    fn notify(&self, event: AlertEvent) {
        self.events.lock().push(event);
    }
}
