//! HTTP endpoint over a real loopback socket
//!
//! Starts `HttpServer` on an ephemeral port and speaks raw HTTP/1.1 to it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use draftwright::llm::{BreakerConfig, CircuitBreaker, MockLlmClient, ResilientClient};
use draftwright::orchestrator::{GenerationService, Pipeline};
use draftwright::protocol::{ErrorCode, Phase, StreamFrame, decode_all};
use draftwright::rules::RulePack;
use draftwright::server::http::dechunk;
use draftwright::server::{HttpServer, ServerConfig};
use draftwright::validation::SelfReviewer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

struct TestServer {
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    async fn start(service: GenerationService, config: ServerConfig) -> Self {
        let config = ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            ..config
        };
        let server = HttpServer::bind(config, Arc::new(service)).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop, stopped) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });
        Self {
            addr,
            stop: Some(stop),
            handle,
        }
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.handle.await.unwrap();
    }
}

struct Response {
    head: String,
    body: Vec<u8>,
}

impl Response {
    fn status(&self) -> u16 {
        self.head.split_whitespace().nth(1).unwrap().parse().unwrap()
    }

    fn has_header(&self, line: &str) -> bool {
        self.head.lines().any(|l| l.eq_ignore_ascii_case(line))
    }

    fn frames(&self) -> Vec<StreamFrame> {
        let body = dechunk(&self.body).expect("chunked body");
        decode_all(&body).unwrap()
    }
}

async fn send(addr: SocketAddr, raw: &[u8]) -> Response {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(raw).await.unwrap();
    read_response(&mut stream).await
}

async fn read_response(stream: &mut TcpStream) -> Response {
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await.unwrap();

    let split = bytes.windows(4).position(|w| w == b"\r\n\r\n").expect("response head");
    Response {
        head: String::from_utf8(bytes[..split].to_vec()).unwrap(),
        body: bytes[split + 4..].to_vec(),
    }
}

async fn post(addr: SocketAddr, path: &str, body: &str) -> Response {
    let raw = format!(
        "POST {} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        path,
        body.len(),
        body
    );
    send(addr, raw.as_bytes()).await
}

fn keyless_service() -> GenerationService {
    GenerationService::new(RulePack::builtin(), Err("ANTHROPIC_API_KEY".to_string()))
}

fn mock_service(draft: &str) -> GenerationService {
    let mock = Arc::new(MockLlmClient::repeating(draft));
    let breaker = Arc::new(CircuitBreaker::new(BreakerConfig::default()));
    let pipeline = Pipeline::new(ResilientClient::new(mock, breaker), SelfReviewer::disabled());
    GenerationService::new(RulePack::builtin(), Ok(pipeline))
}

#[tokio::test]
async fn test_missing_key_is_first_and_only_frame() {
    let server = TestServer::start(keyless_service(), ServerConfig::default()).await;

    let response = post(server.addr, "/api/generate", r#"{"specText": "A todo app"}"#).await;
    assert_eq!(response.status(), 200);
    assert!(response.has_header("Content-Type: application/x-ndjson"));
    assert!(response.has_header("Cache-Control: no-store"));
    assert!(response.has_header("Transfer-Encoding: chunked"));

    let frames = response.frames();
    assert_eq!(frames.len(), 1);
    match &frames[0] {
        StreamFrame::Error(e) => {
            assert_eq!(e.code, ErrorCode::MissingApiKey);
            assert!(!e.recoverable);
        }
        other => panic!("expected error frame, got {:?}", other),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_generate_streams_until_result() {
    let server = TestServer::start(mock_service("## Overview\nToo short."), ServerConfig::default()).await;

    let response = post(server.addr, "/api/generate", r#"{"specText": "A todo app", "maxAttempts": 1}"#).await;
    assert_eq!(response.status(), 200);

    let frames = response.frames();
    assert!(matches!(
        &frames[0],
        StreamFrame::Phase(p) if p.phase == Phase::LoadingKnowledge && p.max_attempts == 1
    ));
    assert_eq!(frames.iter().filter(|f| f.is_terminal()).count(), 1);
    match frames.last() {
        Some(StreamFrame::Result(r)) => {
            assert!(!r.success);
            assert_eq!(r.draft, "## Overview\nToo short.");
        }
        other => panic!("expected result frame, got {:?}", other),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_configured_generate_path() {
    let config = ServerConfig {
        generate_path: "/v2/draft".to_string(),
        ..ServerConfig::default()
    };
    let server = TestServer::start(keyless_service(), config).await;

    assert_eq!(post(server.addr, "/v2/draft", r#"{"specText": "x"}"#).await.status(), 200);
    assert_eq!(post(server.addr, "/api/generate", r#"{"specText": "x"}"#).await.status(), 404);

    server.shutdown().await;
}

#[tokio::test]
async fn test_health_reports_pack() {
    let server = TestServer::start(keyless_service(), ServerConfig::default()).await;

    let response = send(server.addr, b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
    assert_eq!(response.status(), 200);
    let health: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["pack"]["id"], "prd-core");

    server.shutdown().await;
}

#[tokio::test]
async fn test_plain_http_errors() {
    let config = ServerConfig {
        max_body_bytes: 16,
        ..ServerConfig::default()
    };
    let server = TestServer::start(keyless_service(), config).await;

    let wrong_method = send(server.addr, b"GET /api/generate HTTP/1.1\r\n\r\n").await;
    assert_eq!(wrong_method.status(), 405);
    assert!(wrong_method.has_header("Allow: POST"));

    assert_eq!(send(server.addr, b"GET /nowhere HTTP/1.1\r\n\r\n").await.status(), 404);
    assert_eq!(send(server.addr, b"POST /api/generate HTTP/1.1\r\n\r\n").await.status(), 411);
    assert_eq!(send(server.addr, b"garbage\r\n").await.status(), 400);
    let oversize = send(server.addr, b"POST /api/generate HTTP/1.1\r\nContent-Length: 4096\r\n\r\n").await;
    assert_eq!(oversize.status(), 413);

    server.shutdown().await;
}

#[tokio::test]
async fn test_expect_continue_gets_interim_response() {
    let server = TestServer::start(keyless_service(), ServerConfig::default()).await;
    let body = r#"{"specText": "A todo app"}"#;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let head = format!(
        "POST /api/generate HTTP/1.1\r\nHost: localhost\r\nExpect: 100-continue\r\nContent-Length: {}\r\n\r\n",
        body.len()
    );
    stream.write_all(head.as_bytes()).await.unwrap();

    let mut interim = Vec::new();
    let mut buf = [0u8; 64];
    while !interim.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before 100 Continue");
        interim.extend_from_slice(&buf[..n]);
    }
    assert_eq!(interim, b"HTTP/1.1 100 Continue\r\n\r\n");

    stream.write_all(body.as_bytes()).await.unwrap();
    let response = read_response(&mut stream).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.frames().len(), 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_silent_client_times_out() {
    let config = ServerConfig {
        head_timeout: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let server = TestServer::start(keyless_service(), config).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), read_response(&mut stream))
        .await
        .expect("server should close an idle connection");
    assert_eq!(response.status(), 408);

    server.shutdown().await;
}
