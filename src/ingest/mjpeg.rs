//! Splits a byte stream of concatenated JPEGs (multipart MJPEG or a raw `.mjpeg`
//! file) into individual images by scanning for SOI/EOI markers.

use anyhow::{anyhow, Context, Result};
use std::io::Read;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;

pub(crate) struct MjpegReader {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegReader {
    pub(crate) fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    /// Next complete JPEG, or `None` at a clean end of stream.
    pub(crate) fn read_next_jpeg(&mut self) -> Result<Option<Vec<u8>>> {
        let mut chunk = vec![0u8; 8192];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let frame = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(Some(frame));
            }

            let read = self.reader.read(&mut chunk).context("read mjpeg chunk")?;
            if read == 0 {
                if find_soi(&self.buffer).is_some() {
                    return Err(anyhow!("mjpeg stream ended mid-frame"));
                }
                return Ok(None);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn find_soi(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == [0xFF, 0xD8])
}

fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = find_soi(buffer)?;
    let mut j = start + 2;
    while j + 1 < buffer.len() {
        if buffer[j] == 0xFF && buffer[j + 1] == 0xD9 {
            return Some((start, j + 2));
        }
        j += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn splits_concatenated_jpegs_across_boundaries() -> Result<()> {
        let mut data = b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
        data.extend_from_slice(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        data.extend_from_slice(b"\r\n--frame\r\n\r\n");
        data.extend_from_slice(&[0xFF, 0xD8, 4, 0xFF, 0xD9]);

        let mut reader = MjpegReader::new(Box::new(Cursor::new(data)));
        assert_eq!(
            reader.read_next_jpeg()?,
            Some(vec![0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9])
        );
        assert_eq!(reader.read_next_jpeg()?, Some(vec![0xFF, 0xD8, 4, 0xFF, 0xD9]));
        assert_eq!(reader.read_next_jpeg()?, None);
        Ok(())
    }

    #[test]
    fn truncated_frame_is_an_error() {
        let data = vec![0xFF, 0xD8, 1, 2];
        let mut reader = MjpegReader::new(Box::new(Cursor::new(data)));
        assert!(reader.read_next_jpeg().is_err());
    }
}
