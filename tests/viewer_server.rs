use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;

use fallwatch::config::FallwatchConfig;
use fallwatch::{
    BackendRegistry, FallServer, LogNotifier, ServerConfig, SessionRunner, SourceDescriptor,
};

fn get(addr: SocketAddr, path: &str) -> Result<String> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(10)))?;
    write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path)?;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

#[test]
fn serves_health_falls_and_streams() -> Result<()> {
    let tmp = TempDir::new()?;
    let mut cfg = FallwatchConfig::load_from(None)?;
    cfg.evidence.dir = tmp.path().join("falls");
    cfg.evidence.log_path = tmp.path().join("falls_log.csv");
    cfg.source.target_fps = 0;

    let registry = BackendRegistry::from_settings(&cfg.detector)?;
    let sessions = Arc::new(SessionRunner::new(&cfg, registry, Arc::new(LogNotifier))?);
    let handle = FallServer::new(
        ServerConfig {
            addr: "127.0.0.1:0".into(),
            default_source: SourceDescriptor::parse(
                "stub://ward?frames=3&width=32&height=32&scene_every=1",
            )?,
        },
        sessions,
    )
    .spawn()?;
    let addr = handle.addr;

    let health = get(addr, "/health")?;
    assert!(health.starts_with("HTTP/1.1 200 OK"));
    assert!(health.contains(r#""status":"ok""#));

    let empty = get(addr, "/api/falls/recent")?;
    assert!(empty.starts_with("HTTP/1.1 200 OK"));
    assert!(empty.ends_with("[]"));

    let stream = get(addr, "/stream")?;
    assert!(stream.starts_with("HTTP/1.1 200 OK"));
    assert!(stream.contains("multipart/x-mixed-replace; boundary=frame"));
    assert_eq!(stream.matches("--frame\r\nContent-Type: image/jpeg").count(), 3);

    // The stub detector flags every scene change after the first frame.
    let recent = get(addr, "/api/falls/recent")?;
    let body = recent.split("\r\n\r\n").nth(1).unwrap_or_default();
    let rows: Vec<serde_json::Value> = serde_json::from_str(body)?;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["ip"], "stub://ward?frames=3&width=32&height=32&scene_every=1");

    let image = rows[0]["image_path"].as_str().unwrap_or_default();
    let name = image.rsplit('/').next().unwrap_or_default();
    let served = get(addr, &format!("/falls/{}", name))?;
    assert!(served.starts_with("HTTP/1.1 200 OK"));
    assert!(served.contains("Content-Type: image/jpeg"));

    assert!(get(addr, "/falls/../falls_log.csv")?.starts_with("HTTP/1.1 400"));
    assert!(get(addr, "/nope")?.starts_with("HTTP/1.1 404"));

    handle.stop()?;
    Ok(())
}
