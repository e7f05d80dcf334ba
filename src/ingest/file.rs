//! Local file frame source.
//!
//! `.mjpeg`/`.mjpg` files (concatenated JPEGs) are decoded natively. Other containers
//! (mp4, avi, ...) go through FFmpeg when the ingest-file-ffmpeg feature is enabled.
//! The file is read forward once; the source is exhausted at end of file.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[cfg(feature = "ingest-file-ffmpeg")]
use super::ffmpeg::FfmpegSource;
use super::mjpeg::MjpegReader;
use super::{FrameSource, SourceStats};
use crate::frame::Frame;

/// Local file frame source.
pub struct FileSource {
    path: PathBuf,
    backend: FileBackend,
}

enum FileBackend {
    Mjpeg(MjpegFileSource),
    #[cfg(feature = "ingest-file-ffmpeg")]
    Ffmpeg(FfmpegSource),
}

impl FileSource {
    pub fn new(path: PathBuf) -> Result<Self> {
        if !path.is_file() {
            return Err(anyhow!("video file not found: {}", path.display()));
        }
        let is_mjpeg = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| matches!(ext.to_ascii_lowercase().as_str(), "mjpeg" | "mjpg"));
        let backend = if is_mjpeg {
            FileBackend::Mjpeg(MjpegFileSource::new(path.clone()))
        } else {
            open_container(&path)?
        };
        Ok(Self { path, backend })
    }
}

#[cfg(feature = "ingest-file-ffmpeg")]
fn open_container(path: &std::path::Path) -> Result<FileBackend> {
    let input = path
        .to_str()
        .ok_or_else(|| anyhow!("video path is not valid UTF-8"))?;
    Ok(FileBackend::Ffmpeg(FfmpegSource::new(input)?))
}

#[cfg(not(feature = "ingest-file-ffmpeg"))]
fn open_container(path: &std::path::Path) -> Result<FileBackend> {
    Err(anyhow!(
        "{}: container files require the ingest-file-ffmpeg feature (only .mjpeg is built in)",
        path.display()
    ))
}

impl FrameSource for FileSource {
    fn connect(&mut self) -> Result<()> {
        match &mut self.backend {
            FileBackend::Mjpeg(source) => source.connect(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.connect(),
        }
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        match &mut self.backend {
            FileBackend::Mjpeg(source) => source.next_frame(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.next_frame(),
        }
    }

    fn is_healthy(&self) -> bool {
        match &self.backend {
            FileBackend::Mjpeg(source) => source.reader.is_some(),
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.is_healthy(),
        }
    }

    fn stats(&self) -> SourceStats {
        let frames_captured = match &self.backend {
            FileBackend::Mjpeg(source) => source.frame_count,
            #[cfg(feature = "ingest-file-ffmpeg")]
            FileBackend::Ffmpeg(source) => source.frame_count(),
        };
        SourceStats {
            frames_captured,
            source: self.path.display().to_string(),
        }
    }
}

struct MjpegFileSource {
    path: PathBuf,
    reader: Option<MjpegReader>,
    frame_count: u64,
}

impl MjpegFileSource {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            reader: None,
            frame_count: 0,
        }
    }

    fn connect(&mut self) -> Result<()> {
        let file = File::open(&self.path)
            .with_context(|| format!("open video file {}", self.path.display()))?;
        self.reader = Some(MjpegReader::new(Box::new(BufReader::new(file))));
        log::info!("FileSource: opened {} (mjpeg)", self.path.display());
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| anyhow!("file source not connected; call connect() first"))?;
        let Some(jpeg) = reader.read_next_jpeg()? else {
            return Ok(None);
        };
        let frame = Frame::decode(&jpeg)?;
        self.frame_count += 1;
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_mjpeg_file_until_exhausted() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.mjpeg");
        let mut file = File::create(&path)?;
        for shade in [10u8, 200u8] {
            let jpeg = Frame::filled(16, 8, [shade, shade, shade])?.encode_jpeg(90)?;
            file.write_all(&jpeg)?;
        }
        drop(file);

        let mut source = FileSource::new(path)?;
        source.connect()?;
        assert!(source.next_frame()?.is_some());
        let second = source.next_frame()?.expect("second frame");
        assert_eq!((second.width, second.height), (16, 8));
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().frames_captured, 2);
        Ok(())
    }

    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    #[test]
    fn container_files_need_ffmpeg() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip.mp4");
        File::create(&path)?;
        assert!(FileSource::new(path).is_err());
        Ok(())
    }
}
