//! Shared fixtures: a plain-TCP connector, a scripted upstream and a sink that
//! remembers every event.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use neptune_proxy::config::Environment;
use neptune_proxy::credentials::{
    ChainProvider, CredentialContext, Credentials, StaticProvider,
};
use neptune_proxy::observe::{EventSink, ProxyEvent};
use neptune_proxy::proxy::Connector;
use neptune_proxy::proxy::connector::BoxedIo;

pub const ACCESS_KEY: &str = "AKIDEXAMPLE";
pub const SECRET_KEY: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";
pub const REGION: &str = "us-east-1";

pub fn static_context() -> Arc<CredentialContext> {
    Arc::new(CredentialContext::new(
        REGION,
        "neptune-db",
        Arc::new(StaticProvider::new(Credentials::new(ACCESS_KEY, SECRET_KEY))),
    ))
}

/// A context whose provider never finds credentials, so signing always fails.
pub fn empty_context() -> Arc<CredentialContext> {
    Arc::new(CredentialContext::new(
        REGION,
        "neptune-db",
        Arc::new(ChainProvider::new(Vec::new())),
    ))
}

pub fn environment(name: &str, listen_port: u16, upstream_host: &str) -> Environment {
    Environment {
        name: name.to_string(),
        listen_port,
        upstream_host: upstream_host.to_string(),
    }
}

pub fn http_response(status_line: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n{}",
        status_line,
        content_type,
        body.len(),
        body
    )
}

/// Dials plain TCP instead of TLS, sending each upstream host to a local
/// address. Hosts without a route are refused.
#[derive(Default)]
pub struct PlainConnector {
    routes: HashMap<String, SocketAddr>,
    dialed: Mutex<Vec<(String, u16)>>,
}

impl PlainConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, host: &str, addr: SocketAddr) -> Self {
        self.routes.insert(host.to_string(), addr);
        self
    }

    pub fn dialed(&self) -> Vec<(String, u16)> {
        self.dialed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Connector for PlainConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedIo> {
        self.dialed.lock().unwrap().push((host.to_string(), port));
        let addr = self.routes.get(host).copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, format!("no route to {}", host))
        })?;
        let stream = TcpStream::connect(addr).await?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub head: String,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn request_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim().to_string())
        })
    }

    pub fn header_count(&self, name: &str) -> usize {
        self.head
            .lines()
            .skip(1)
            .filter(|line| {
                line.split_once(':')
                    .is_some_and(|(k, _)| k.trim().eq_ignore_ascii_case(name))
            })
            .count()
    }
}

/// An upstream that records every request and answers each with the same
/// canned bytes, optionally after a delay.
pub struct MockUpstream {
    pub addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl MockUpstream {
    pub async fn start(response: impl Into<String>) -> Self {
        Self::start_with_delay(response, Duration::ZERO).await
    }

    pub async fn start_with_delay(response: impl Into<String>, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let response: Arc<str> = Arc::from(response.into());

        let captured = requests.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let captured = captured.clone();
                let response = response.clone();
                tokio::spawn(async move {
                    if let Some(request) = read_request(&mut socket).await {
                        captured.lock().unwrap().push(request);
                    }
                    tokio::time::sleep(delay).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(socket: &mut TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let head_end = loop {
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let mut captured = CapturedRequest {
        head,
        body: Vec::new(),
    };
    let len: usize = captured
        .header("Content-Length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let body_start = head_end + 4;
    while buf.len() < body_start + len {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    captured.body = buf[body_start..body_start + len].to_vec();
    Some(captured)
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProxyEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ProxyEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventSink for RecordingSink {
    fn record(&self, event: ProxyEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Sends one raw request to `addr` and reads until the proxy closes.
pub async fn send_raw(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut out = Vec::new();
    stream.read_to_end(&mut out).await.unwrap();
    String::from_utf8_lossy(&out).to_string()
}
