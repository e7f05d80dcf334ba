//! Network camera frame source.
//!
//! - `http(s)://` multipart MJPEG streams (e.g. the IP Webcam app at
//!   `http://<phone>:8080/video`) are read continuously;
//! - `http(s)://` endpoints returning a single JPEG are polled as snapshots;
//! - `rtsp://` goes through FFmpeg (feature: ingest-file-ffmpeg).

use anyhow::{anyhow, Context, Result};
use std::io::Read;
use std::time::{Duration, Instant};
use url::Url;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::ffmpeg::FfmpegSource;
use super::mjpeg::MjpegReader;
use super::{frame_interval, health_grace, FrameSource, SourceStats};
use crate::frame::Frame;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct NetworkSource {
    url: String,
    backend: NetworkBackend,
}

enum NetworkBackend {
    Http(HttpSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Rtsp(FfmpegSource),
}

impl NetworkSource {
    pub fn new(url: &str, target_fps: u32) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("parse camera url {}", url))?;
        let backend = match parsed.scheme() {
            "http" | "https" => NetworkBackend::Http(HttpSource::new(url, target_fps)),
            #[cfg(feature = "ingest-file-ffmpeg")]
            "rtsp" => NetworkBackend::Rtsp(FfmpegSource::new(url)?),
            other => {
                return Err(anyhow!(
                    "unsupported camera scheme '{}'; expected http(s){}",
                    other,
                    if cfg!(feature = "ingest-file-ffmpeg") {
                        " or rtsp"
                    } else {
                        ""
                    }
                ))
            }
        };
        Ok(Self {
            url: url.to_string(),
            backend,
        })
    }
}

impl FrameSource for NetworkSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            NetworkBackend::Http(source) => source.connect(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            NetworkBackend::Rtsp(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            NetworkBackend::Http(source) => source.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            NetworkBackend::Rtsp(source) => source.next_frame(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            NetworkBackend::Http(source) => source.is_healthy(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            NetworkBackend::Rtsp(source) => source.is_healthy(),
        }
    }

    fn stats(&self) -> SourceStats {
        let frames_captured = match &self.backend {
            NetworkBackend::Http(source) => source.frame_count,
            #[cfg(feature = "ingest-file-ffmpeg")]
            NetworkBackend::Rtsp(source) => source.frame_count(),
        };
        SourceStats {
            frames_captured,
            source: self.url.clone(),
        }
    }
}

struct HttpSource {
    url: String,
    target_fps: u32,
    stream: Option<HttpStream>,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    frame_count: u64,
    last_error: Option<String>,
}

enum HttpStream {
    Mjpeg(MjpegReader),
    SingleJpeg,
}

impl HttpSource {
    fn new(url: &str, target_fps: u32) -> Self {
        Self {
            url: url.to_string(),
            target_fps,
            stream: None,
            last_frame_at: None,
            connected_at: None,
            frame_count: 0,
            last_error: None,
        }
    }

    fn connect(&mut self) -> Result<()> {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CONNECT_TIMEOUT)
            .build();
        let response = agent
            .get(&self.url)
            .call()
            .with_context(|| format!("connect to camera stream {}", self.url))?;
        let content_type = response.header("Content-Type").unwrap_or("");
        if content_type.to_lowercase().contains("multipart") {
            let reader = response.into_reader();
            self.stream = Some(HttpStream::Mjpeg(MjpegReader::new(reader)));
        } else {
            self.stream = Some(HttpStream::SingleJpeg);
        }
        self.connected_at = Some(Instant::now());
        log::info!("NetworkSource: connected to {}", self.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("camera source not connected; call connect() first"))?;
        let min_interval = frame_interval(self.target_fps);
        loop {
            let next = match stream {
                HttpStream::Mjpeg(reader) => reader.read_next_jpeg(),
                HttpStream::SingleJpeg => fetch_single_jpeg(&self.url).map(Some),
            };
            let jpeg_bytes = match next {
                Ok(Some(bytes)) => bytes,
                Ok(None) => return Ok(None),
                Err(err) => {
                    self.last_error = Some(err.to_string());
                    return Err(err);
                }
            };

            let now = Instant::now();
            if let Some(last) = self.last_frame_at {
                if now.duration_since(last) < min_interval {
                    if matches!(stream, HttpStream::SingleJpeg) {
                        std::thread::sleep(min_interval - now.duration_since(last));
                    }
                    continue;
                }
            }

            let frame = Frame::decode(&jpeg_bytes)?;
            self.frame_count += 1;
            self.last_frame_at = Some(now);
            return Ok(Some(frame));
        }
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        let Some(last_frame_at) = self.last_frame_at else {
            return connected_at.elapsed() <= Duration::from_secs(5);
        };
        last_frame_at.elapsed() <= health_grace(self.target_fps)
    }
}

fn fetch_single_jpeg(url: &str) -> Result<Vec<u8>> {
    let response = ureq::get(url)
        .call()
        .with_context(|| format!("fetch jpeg snapshot from {}", url))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .read_to_end(&mut bytes)
        .context("read jpeg snapshot")?;
    if bytes.is_empty() {
        return Err(anyhow!("empty jpeg snapshot"));
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_schemes() {
        assert!(NetworkSource::new("ftp://camera/video", 10).is_err());
        assert!(NetworkSource::new("not a url", 10).is_err());
    }

    #[test]
    fn http_source_is_unhealthy_before_connect() -> Result<()> {
        let source = NetworkSource::new("http://127.0.0.1:9/video", 10)?;
        assert!(!source.is_healthy());
        assert_eq!(source.stats().frames_captured, 0);
        Ok(())
    }
}
