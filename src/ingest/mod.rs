//! Frame ingestion sources.
//!
//! This module provides the sources a stream can read from:
//! - Local files (`.mjpeg` natively; other containers with feature: ingest-file-ffmpeg)
//! - Capture devices by index (feature: ingest-v4l2)
//! - Network cameras: HTTP MJPEG/JPEG (IP Webcam style), RTSP with ffmpeg
//! - Synthetic `stub://` source (testing and demos)
//!
//! Every source yields `Frame`s in capture order. `Ok(None)` means the source is
//! exhausted; an error means it can no longer continue. Either way the stream
//! reading from it ends.

#[cfg(feature = "ingest-v4l2")]
pub mod device;
#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod ffmpeg;
pub mod file;
pub(crate) mod mjpeg;
pub mod network;
#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod synthetic;

use anyhow::{anyhow, Result};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::frame::Frame;

pub use file::FileSource;
pub use network::NetworkSource;
pub use synthetic::SyntheticSource;

/// Counters reported by every source.
#[derive(Clone, Debug, Default)]
pub struct SourceStats {
    pub frames_captured: u64,
    pub source: String,
}

/// A producer of raw frames.
pub trait FrameSource: Send {
    /// Open the underlying device, file or connection.
    fn connect(&mut self) -> Result<()>;

    /// Capture the next frame. `Ok(None)` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// Check if the source is healthy.
    fn is_healthy(&self) -> bool;

    /// Get frame statistics.
    fn stats(&self) -> SourceStats;
}

/// Where a stream reads its frames from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceDescriptor {
    File(PathBuf),
    Device(u32),
    Url(String),
    Synthetic(String),
}

impl SourceDescriptor {
    /// Parse a user-supplied descriptor.
    ///
    /// - all digits: capture device index (`0` is the default webcam)
    /// - `stub://...`: synthetic source
    /// - any other `scheme://...`: network URL
    /// - anything else: local file path
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(anyhow!("source descriptor cannot be empty"));
        }
        if trimmed.chars().all(|c| c.is_ascii_digit()) {
            let index = trimmed
                .parse()
                .map_err(|_| anyhow!("device index out of range: {}", trimmed))?;
            return Ok(Self::Device(index));
        }
        if trimmed.starts_with("stub://") {
            return Ok(Self::Synthetic(trimmed.to_string()));
        }
        if trimmed.contains("://") {
            return Ok(Self::Url(trimmed.to_string()));
        }
        Ok(Self::File(PathBuf::from(trimmed)))
    }

    /// URL of an IP Webcam style phone camera at `host`.
    pub fn ip_webcam(host: &str) -> Result<Self> {
        let host = host.trim();
        if host.is_empty()
            || !host
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'))
        {
            return Err(anyhow!("invalid camera host '{}'", host));
        }
        Ok(Self::Url(format!("http://{}:8080/video", host)))
    }

    /// Build and connect the source.
    ///
    /// Any error here is a source-unavailable condition for the stream.
    pub fn open(&self, target_fps: u32) -> Result<Box<dyn FrameSource>> {
        let mut source: Box<dyn FrameSource> = match self {
            Self::Synthetic(url) => Box::new(SyntheticSource::new(url, target_fps)?),
            Self::File(path) => Box::new(FileSource::new(path.clone())?),
            Self::Url(url) => Box::new(NetworkSource::new(url, target_fps)?),
            Self::Device(index) => open_device(*index, target_fps)?,
        };
        source.connect()?;
        Ok(source)
    }
}

impl fmt::Display for SourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Device(index) => write!(f, "device:{}", index),
            Self::Url(url) | Self::Synthetic(url) => write!(f, "{}", url),
        }
    }
}

#[cfg(feature = "ingest-v4l2")]
fn open_device(index: u32, target_fps: u32) -> Result<Box<dyn FrameSource>> {
    let config = device::DeviceConfig {
        device: format!("/dev/video{}", index),
        target_fps,
        ..device::DeviceConfig::default()
    };
    Ok(Box::new(device::DeviceSource::new(config)))
}

#[cfg(not(feature = "ingest-v4l2"))]
fn open_device(index: u32, _target_fps: u32) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "capture device {} requires the ingest-v4l2 feature",
        index
    ))
}

/// Minimum spacing between delivered frames for a target rate.
pub(crate) fn frame_interval(target_fps: u32) -> Duration {
    if target_fps == 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis((1000 / target_fps).max(1) as u64)
    }
}

/// How long a source may go without a frame before reporting unhealthy.
pub(crate) fn health_grace(target_fps: u32) -> Duration {
    let base_ms = if target_fps == 0 {
        2_000
    } else {
        (1000 / target_fps).saturating_mul(6)
    };
    Duration::from_millis(base_ms.max(2_000) as u64)
}
