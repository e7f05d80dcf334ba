//! Synthetic `stub://` frame source.
//!
//! Generates a static pattern that changes every `scene_every` frames, so the stub
//! detector sees periodic scene changes. Query parameters:
//! `frames` (stop after N frames, default unbounded), `width`, `height`,
//! `scene_every` (default 50).

use anyhow::{anyhow, Context, Result};
use std::time::Instant;
use url::Url;

use super::{frame_interval, FrameSource, SourceStats};
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_SCENE_EVERY: u64 = 50;

pub struct SyntheticSource {
    url: String,
    width: u32,
    height: u32,
    max_frames: Option<u64>,
    scene_every: u64,
    target_fps: u32,
    frame_count: u64,
    /// Simulated "scene" state; bumps every `scene_every` frames.
    scene_state: u8,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(url: &str, target_fps: u32) -> Result<Self> {
        let parsed = Url::parse(url).with_context(|| format!("parse stub url {}", url))?;
        if parsed.scheme() != "stub" {
            return Err(anyhow!("synthetic source requires a stub:// url"));
        }
        let mut source = Self {
            url: url.to_string(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            max_frames: None,
            scene_every: DEFAULT_SCENE_EVERY,
            target_fps,
            frame_count: 0,
            scene_state: 0,
            last_frame_at: None,
        };
        for (key, value) in parsed.query_pairs() {
            let number: u64 = value
                .parse()
                .with_context(|| format!("stub parameter {} must be an integer", key))?;
            match key.as_ref() {
                "frames" => source.max_frames = Some(number),
                "width" => source.width = number.clamp(1, 4096) as u32,
                "height" => source.height = number.clamp(1, 4096) as u32,
                "scene_every" => source.scene_every = number.max(1),
                other => return Err(anyhow!("unknown stub parameter '{}'", other)),
            }
        }
        Ok(source)
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (self.width * self.height * 3) as usize;
        if self.frame_count % self.scene_every == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 / 3 + self.scene_state as u64 * 37) % 256) as u8;
        }
        pixels
    }

    fn pace(&self) {
        let interval = frame_interval(self.target_fps);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        log::info!("SyntheticSource: connected to {}", self.url);
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.max_frames.is_some_and(|max| self.frame_count >= max) {
            return Ok(None);
        }
        self.pace();
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        let pixels = self.generate_pixels();
        Ok(Some(Frame::from_raw_parts(pixels, self.width, self.height)))
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: self.url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_after_requested_frames() -> Result<()> {
        let mut source = SyntheticSource::new("stub://test?frames=2&width=8&height=4", 0)?;
        source.connect()?;
        let frame = source.next_frame()?.expect("first frame");
        assert_eq!((frame.width, frame.height), (8, 4));
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().frames_captured, 2);
        Ok(())
    }

    #[test]
    fn scene_changes_on_schedule() -> Result<()> {
        let mut source = SyntheticSource::new("stub://test?width=4&height=4&scene_every=2", 0)?;
        let a = source.next_frame()?.expect("frame");
        let b = source.next_frame()?.expect("frame");
        let c = source.next_frame()?.expect("frame");
        // The scene bumps on frame 2, then holds.
        assert_ne!(a.pixels(), b.pixels());
        assert_eq!(b.pixels(), c.pixels());
        Ok(())
    }

    #[test]
    fn rejects_unknown_parameters() {
        assert!(SyntheticSource::new("stub://test?colour=red", 0).is_err());
        assert!(SyntheticSource::new("stub://test?frames=many", 0).is_err());
    }
}
