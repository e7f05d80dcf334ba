//! FFmpeg-backed decoder for container files and RTSP streams.
//!
//! Frames are converted to packed RGB24 in memory. At end of input the decoder is
//! drained, then the source reports exhaustion.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use std::time::{Duration, Instant};

use crate::frame::Frame;

pub(crate) struct FfmpegSource {
    input_name: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    connected_at: Option<Instant>,
    flushed: bool,
    last_error: Option<String>,
}

impl FfmpegSource {
    pub(crate) fn new(input_name: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&input_name)
            .with_context(|| format!("failed to open '{}' with ffmpeg", input_name))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video track", input_name))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        Ok(Self {
            input_name: input_name.to_string(),
            input,
            stream_index,
            decoder,
            scaler,
            frame_count: 0,
            last_frame_at: None,
            connected_at: None,
            flushed: false,
            last_error: None,
        })
    }

    pub(crate) fn connect(&mut self) -> Result<()> {
        self.connected_at = Some(Instant::now());
        log::info!("ffmpeg: opened {}", self.input_name);
        Ok(())
    }

    pub(crate) fn next_frame(&mut self) -> Result<Option<Frame>> {
        if let Some(frame) = self.receive_decoded()? {
            return Ok(Some(frame));
        }
        if self.flushed {
            return Ok(None);
        }

        loop {
            let Some((stream, packet)) = self.input.packets().next() else {
                break;
            };
            if stream.index() != self.stream_index {
                continue;
            }
            if let Err(err) = self.decoder.send_packet(&packet) {
                self.last_error = Some(err.to_string());
                return Err(anyhow!("send packet to ffmpeg decoder: {}", err));
            }
            if let Some(frame) = self.receive_decoded()? {
                return Ok(Some(frame));
            }
        }

        self.flushed = true;
        self.decoder.send_eof().context("flush ffmpeg decoder")?;
        self.receive_decoded()
    }

    pub(crate) fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(connected_at) = self.connected_at else {
            return false;
        };
        match self.last_frame_at {
            Some(last) => last.elapsed() <= Duration::from_secs(5),
            None => connected_at.elapsed() <= Duration::from_secs(5),
        }
    }

    pub(crate) fn frame_count(&self) -> u64 {
        self.frame_count
    }

    fn receive_decoded(&mut self) -> Result<Option<Frame>> {
        let mut decoded = ffmpeg::frame::Video::empty();
        if self.decoder.receive_frame(&mut decoded).is_err() {
            return Ok(None);
        }
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(&decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(Frame::new(pixels, width, height)?))
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}
