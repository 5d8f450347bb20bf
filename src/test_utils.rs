//! In-process HTTP server with canned responses, for exercising the
//! fetch pipeline in tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// A parsed incoming request: path plus lower-cased header pairs.
pub struct Request {
    pub path: String,
    pub headers: Vec<(String, String)>,
}

/// A canned response. Body chunks are written in order, each after its
/// delay, so tests can hold a stream open mid-body.
#[derive(Clone)]
pub struct Reply {
    pub status: u16,
    pub reason: &'static str,
    pub headers: Vec<(String, String)>,
    pub chunks: Vec<(Duration, Vec<u8>)>,
}

impl Reply {
    pub fn ok(body: &str) -> Self {
        Self::with_status(200, "OK", body)
    }

    pub fn with_status(status: u16, reason: &'static str, body: &str) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            chunks: vec![(Duration::ZERO, body.as_bytes().to_vec())],
        }
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        Self {
            status,
            reason: "Found",
            headers: vec![("location".to_string(), location.to_string())],
            chunks: Vec::new(),
        }
    }

    pub fn chunked(status: u16, reason: &'static str, chunks: Vec<(Duration, Vec<u8>)>) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            chunks,
        }
    }
}

type Router = Arc<dyn Fn(&Request) -> Reply + Send + Sync>;
type HitMap = Arc<Mutex<HashMap<String, usize>>>;

/// One-listener HTTP/1.1 server answering from a router function.
pub struct TestServer {
    addr: SocketAddr,
    hits: HitMap,
}

impl TestServer {
    pub async fn start(router: impl Fn(&Request) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test server");
        let addr = listener.local_addr().expect("test server address");
        let hits: HitMap = Arc::default();
        let router: Router = Arc::new(router);

        let accept_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let router = router.clone();
                let hits = accept_hits.clone();
                tokio::spawn(async move {
                    let _ = serve_one(stream, router, hits).await;
                });
            }
        });

        Self { addr, hits }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Directory this server's resources land under in the mirror (the
    /// host with the port stripped).
    pub fn host_key(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn hits(&self, path: &str) -> usize {
        *self.hits.lock().unwrap().get(path).unwrap_or(&0)
    }
}

async fn serve_one(mut stream: TcpStream, router: Router, hits: HitMap) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut tmp).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.len() > 64 * 1024 {
            break;
        }
    }

    let text = String::from_utf8_lossy(&buf);
    let mut lines = text.lines();
    let request_line = lines.next().unwrap_or_default();
    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();
    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| {
            line.split_once(':')
                .map(|(name, value)| (name.to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect();

    hits.lock()
        .unwrap()
        .entry(path.clone())
        .and_modify(|n| *n += 1)
        .or_insert(1);

    let reply = router(&Request { path, headers });
    let body_len: usize = reply.chunks.iter().map(|(_, chunk)| chunk.len()).sum();

    let mut head = format!("HTTP/1.1 {} {}\r\n", reply.status, reply.reason);
    for (name, value) in &reply.headers {
        head.push_str(&format!("{name}: {value}\r\n"));
    }
    head.push_str(&format!("content-length: {body_len}\r\nconnection: close\r\n\r\n"));
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;

    for (delay, chunk) in &reply.chunks {
        if !delay.is_zero() {
            tokio::time::sleep(*delay).await;
        }
        stream.write_all(chunk).await?;
        stream.flush().await?;
    }
    stream.shutdown().await?;
    Ok(())
}
