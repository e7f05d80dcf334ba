//! Local capture device source (V4L2).
//!
//! Opens `/dev/videoN`, asks for RGB24 at the configured size and accepts whatever
//! the driver settles on among RGB24, YUYV and MJPEG. Frames are converted to RGB
//! in memory.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::Instant;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{health_grace, FrameSource, SourceStats};
use crate::frame::Frame;

/// Configuration for a capture device.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Requested frame rate; 0 leaves the driver default.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CaptureFormat {
    Raw(PixelFormat),
    Mjpeg,
}

pub struct DeviceSource {
    config: DeviceConfig,
    state: Option<DeviceState>,
    format: CaptureFormat,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl DeviceSource {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            format: CaptureFormat::Raw(PixelFormat::Rgb24),
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }
}

impl FrameSource for DeviceSource {
    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open capture device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "DeviceSource: failed to set format on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };

        self.format = match &format.fourcc.repr {
            b"MJPG" => CaptureFormat::Mjpeg,
            fourcc => CaptureFormat::Raw(PixelFormat::from_fourcc(fourcc).ok_or_else(|| {
                anyhow!(
                    "{}: unsupported capture format {}",
                    self.config.device,
                    format.fourcc
                )
            })?),
        };

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "DeviceSource: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.last_error = None;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "DeviceSource: connected to {} ({}x{}, {:?})",
            self.config.device,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("capture device not connected")?;
        let (width, height, format) = (self.active_width, self.active_height, self.format);
        let captured = state.with_mut(|fields| {
            let (buf, meta) = fields
                .stream
                .next()
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;
            let used = (meta.bytesused as usize).min(buf.len());
            let bytes = if used == 0 { buf } else { &buf[..used] };
            match format {
                CaptureFormat::Mjpeg => Frame::decode(bytes),
                CaptureFormat::Raw(pixel_format) => {
                    let rgb = normalize_to_rgb(bytes, width, height, pixel_format)?;
                    Frame::new(rgb, width, height)
                }
            }
        });
        let frame = captured.map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(frame))
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() || self.state.is_none() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return true;
        };
        last_frame_at.elapsed() <= health_grace(self.config.target_fps)
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.config.device.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_fails_to_connect() {
        let mut source = DeviceSource::new(DeviceConfig {
            device: "/dev/video-does-not-exist".to_string(),
            ..DeviceConfig::default()
        });
        assert!(source.connect().is_err());
        assert!(!source.is_healthy());
        assert!(source.next_frame().is_err());
    }
}
