//! Minimal HTTP viewer server.
//!
//! One thread per connection; each stream route runs a full session on the
//! connection thread. Routes:
//! - `GET /health`
//! - `GET /stream` (configured default source)
//! - `GET /stream/ip/<host>` (IP Webcam style phone camera)
//! - `GET /webcam` (capture device 0)
//! - `GET /api/falls/recent` (newest first, at most 50)
//! - `GET /falls/<file>` (saved evidence image)

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::ingest::SourceDescriptor;
use crate::session::{SessionRequest, SessionRunner};
use crate::stream::CONTENT_TYPE as STREAM_CONTENT_TYPE;

const MAX_REQUEST_BYTES: usize = 8192;
const RECENT_FALLS_LIMIT: usize = 50;
const STREAM_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub addr: String,
    pub default_source: SourceDescriptor,
}

#[derive(Debug)]
pub struct ServerHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Stop accepting connections. Streams already running finish on their own.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("viewer server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct FallServer {
    cfg: ServerConfig,
    sessions: Arc<SessionRunner>,
}

impl FallServer {
    pub fn new(cfg: ServerConfig, sessions: Arc<SessionRunner>) -> Self {
        Self { cfg, sessions }
    }

    pub fn spawn(self) -> Result<ServerHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid server address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind viewer server on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        log::info!("viewer server listening on http://{}", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let ctx = Arc::new(ServerContext {
            default_source: self.cfg.default_source,
            sessions: self.sessions,
            active_streams: AtomicUsize::new(0),
        });
        let join = std::thread::spawn(move || {
            if let Err(err) = run_server(listener, ctx, shutdown_thread) {
                log::error!("viewer server stopped: {}", err);
            }
        });

        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct ServerContext {
    default_source: SourceDescriptor,
    sessions: Arc<SessionRunner>,
    active_streams: AtomicUsize,
}

fn run_server(
    listener: TcpListener,
    ctx: Arc<ServerContext>,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let ctx = Arc::clone(&ctx);
                let spawned = std::thread::Builder::new()
                    .name(format!("viewer-{}", peer))
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("viewer request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("cannot spawn connection thread: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// What a request asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
enum Route {
    Health,
    Stream(SessionRequest),
    RecentFalls,
    FallImage(String),
    BadRequest(&'static str),
    NotFound,
}

fn route(path: &str, default_source: &SourceDescriptor) -> Route {
    match path {
        "/health" => return Route::Health,
        "/stream" => {
            let id = default_source.to_string();
            return Route::Stream(SessionRequest::new(default_source.clone(), &id));
        }
        "/webcam" => {
            return Route::Stream(SessionRequest::new(SourceDescriptor::Device(0), "local"))
        }
        "/api/falls/recent" => return Route::RecentFalls,
        _ => {}
    }
    if let Some(host) = path.strip_prefix("/stream/ip/") {
        return match SourceDescriptor::ip_webcam(host) {
            Ok(descriptor) => Route::Stream(SessionRequest::new(descriptor, host)),
            Err(_) => Route::BadRequest("invalid_host"),
        };
    }
    if let Some(name) = path.strip_prefix("/falls/") {
        let safe = !name.is_empty()
            && name.ends_with(".jpg")
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            && !name.contains("..");
        return if safe {
            Route::FallImage(name.to_string())
        } else {
            Route::BadRequest("invalid_filename")
        };
    }
    Route::NotFound
}

fn handle_connection(mut stream: TcpStream, ctx: &ServerContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?;
        return Ok(());
    }

    match route(&request.path, &ctx.default_source) {
        Route::Health => {
            let body = serde_json::json!({
                "status": "ok",
                "active_streams": ctx.active_streams.load(Ordering::SeqCst),
            });
            write_response(&mut stream, 200, "application/json", &serde_json::to_vec(&body)?)
        }
        Route::RecentFalls => {
            let events = ctx.sessions.evidence().log().recent(RECENT_FALLS_LIMIT)?;
            write_response(&mut stream, 200, "application/json", &serde_json::to_vec(&events)?)
        }
        Route::FallImage(name) => {
            let path = ctx.sessions.evidence().dir().join(&name);
            match std::fs::read(&path) {
                Ok(bytes) => write_response(&mut stream, 200, "image/jpeg", &bytes),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)
                }
                Err(err) => {
                    Err(anyhow::Error::new(err).context(format!("read {}", path.display())))
                }
            }
        }
        Route::Stream(session) => {
            stream.set_write_timeout(Some(STREAM_WRITE_TIMEOUT))?;
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
                STREAM_CONTENT_TYPE
            );
            stream.write_all(header.as_bytes())?;
            ctx.active_streams.fetch_add(1, Ordering::SeqCst);
            let report = ctx.sessions.run(&session, &mut stream);
            ctx.active_streams.fetch_sub(1, Ordering::SeqCst);
            log::debug!("viewer {}: {:?}", peer, report);
            Ok(())
        }
        Route::BadRequest(reason) => {
            let body = format!(r#"{{"error":"{}"}}"#, reason);
            write_json_response(&mut stream, 400, &body)
        }
        Route::NotFound => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_source() -> SourceDescriptor {
        SourceDescriptor::Synthetic("stub://camera".into())
    }

    #[test]
    fn routes_stream_requests() {
        match route("/stream/ip/192.168.1.40", &default_source()) {
            Route::Stream(req) => {
                assert_eq!(req.source_id, "192.168.1.40");
                assert_eq!(
                    req.descriptor,
                    SourceDescriptor::Url("http://192.168.1.40:8080/video".into())
                );
            }
            other => panic!("unexpected route {:?}", other),
        }
        match route("/webcam", &default_source()) {
            Route::Stream(req) => assert_eq!(req.descriptor, SourceDescriptor::Device(0)),
            other => panic!("unexpected route {:?}", other),
        }
        match route("/stream", &default_source()) {
            Route::Stream(req) => assert_eq!(req.source_id, "stub://camera"),
            other => panic!("unexpected route {:?}", other),
        }
    }

    #[test]
    fn rejects_unsafe_paths() {
        assert_eq!(
            route("/stream/ip/a/../../etc", &default_source()),
            Route::BadRequest("invalid_host")
        );
        assert_eq!(
            route("/falls/../secret.jpg", &default_source()),
            Route::BadRequest("invalid_filename")
        );
        assert_eq!(
            route("/falls/FALL_2024-05-01_10-00-00_0.jpg", &default_source()),
            Route::FallImage("FALL_2024-05-01_10-00-00_0.jpg".into())
        );
        assert_eq!(route("/nope", &default_source()), Route::NotFound);
        assert_eq!(route("/health", &default_source()), Route::Health);
    }
}
