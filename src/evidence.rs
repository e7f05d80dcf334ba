//! Evidence persistence: JPEG snapshots plus an append-only CSV audit log.
//!
//! Every log row names exactly one image file, and image names are never reused:
//! files are created with exclusive-create and a per-second sequence suffix, so
//! two events in the same second (or a restart within it) get distinct files.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::config::EvidenceSettings;
use crate::frame::Frame;

pub const EVIDENCE_JPEG_QUALITY: u8 = 85;
pub const LOG_HEADER: &str = "timestamp,ip,location,confidence,image_path";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const FILE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
const MAX_SEQ_PER_SECOND: u32 = 10_000;

/// One detected fall, as logged and as handed to the alert path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FallEvent {
    pub timestamp: String,
    #[serde(rename = "ip")]
    pub source: String,
    pub location: String,
    pub confidence: f32,
    pub image_path: String,
}

impl FallEvent {
    pub const UNKNOWN: &'static str = "UNKNOWN";

    /// Stand-in used when metadata never arrives for a pending alert.
    pub fn placeholder(source: &str) -> Self {
        Self {
            timestamp: Self::UNKNOWN.to_string(),
            source: source.to_string(),
            location: Self::UNKNOWN.to_string(),
            confidence: 0.0,
            image_path: Self::UNKNOWN.to_string(),
        }
    }
}

/// Writes snapshots into the evidence directory and records them in the log.
pub struct EvidenceWriter {
    dir: PathBuf,
    location: String,
    log: EvidenceLog,
}

impl EvidenceWriter {
    pub fn new(settings: &EvidenceSettings) -> Result<Self> {
        fs::create_dir_all(&settings.dir)
            .with_context(|| format!("create evidence dir {}", settings.dir.display()))?;
        Ok(Self {
            dir: settings.dir.clone(),
            location: settings.location.clone(),
            log: EvidenceLog::new(&settings.log_path),
        })
    }

    pub fn log(&self) -> &EvidenceLog {
        &self.log
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn persist(&self, frame: &Frame, source: &str, confidence: f32) -> Result<FallEvent> {
        self.persist_at(frame, source, confidence, Local::now())
    }

    /// Save the frame and append its log row, stamped with `now`.
    pub fn persist_at(
        &self,
        frame: &Frame,
        source: &str,
        confidence: f32,
        now: DateTime<Local>,
    ) -> Result<FallEvent> {
        let jpeg = frame
            .encode_jpeg(EVIDENCE_JPEG_QUALITY)
            .context("encode evidence snapshot")?;
        let (image_path, file) = self.create_unique(&now)?;
        let event = FallEvent {
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
            source: source.to_string(),
            location: self.location.clone(),
            confidence,
            image_path: image_path.display().to_string(),
        };
        // An image without its log row (or a partial image) must not survive.
        if let Err(err) = self.write_and_record(file, &image_path, &jpeg, &event) {
            if let Err(remove_err) = fs::remove_file(&image_path) {
                log::error!(
                    "evidence: cannot remove orphan image {}: {}",
                    image_path.display(),
                    remove_err
                );
            }
            return Err(err);
        }
        log::info!(
            "evidence: saved {} (confidence {:.3})",
            event.image_path,
            confidence
        );
        Ok(event)
    }

    fn write_and_record(
        &self,
        mut file: File,
        image_path: &Path,
        jpeg: &[u8],
        event: &FallEvent,
    ) -> Result<()> {
        file.write_all(jpeg)
            .with_context(|| format!("write evidence image {}", image_path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync evidence image {}", image_path.display()))?;
        self.log.append(event)
    }

    fn create_unique(&self, now: &DateTime<Local>) -> Result<(PathBuf, File)> {
        let stamp = now.format(FILE_TIMESTAMP_FORMAT);
        for seq in 0..MAX_SEQ_PER_SECOND {
            let path = self.dir.join(format!("FALL_{}_{}.jpg", stamp, seq));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(anyhow::Error::new(err)
                        .context(format!("create evidence image {}", path.display())))
                }
            }
        }
        Err(anyhow!(
            "evidence names exhausted for {} in {}",
            stamp,
            self.dir.display()
        ))
    }
}

/// Append-only CSV log of fall events.
pub struct EvidenceLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl EvidenceLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one row, writing the header first if the log is new or empty.
    pub fn append(&self, event: &FallEvent) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow!("evidence log lock poisoned"))?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("create log dir {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open evidence log {}", self.path.display()))?;
        let is_empty = file
            .metadata()
            .with_context(|| format!("stat evidence log {}", self.path.display()))?
            .len()
            == 0;

        let mut out = String::new();
        if is_empty {
            out.push_str(LOG_HEADER);
            out.push('\n');
        }
        let confidence = format!("{:.3}", event.confidence);
        let fields = [
            event.timestamp.as_str(),
            event.source.as_str(),
            event.location.as_str(),
            confidence.as_str(),
            event.image_path.as_str(),
        ];
        let row: Vec<String> = fields.iter().map(|f| quote_field(f)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
        file.write_all(out.as_bytes())
            .with_context(|| format!("append evidence log {}", self.path.display()))?;
        file.flush()?;
        Ok(())
    }

    /// Up to `limit` rows, newest first. A missing log yields no rows.
    pub fn recent(&self, limit: usize) -> Result<Vec<FallEvent>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::new(err)
                    .context(format!("open evidence log {}", self.path.display())))
            }
        };
        let mut events = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.context("read evidence log")?;
            if index == 0 || line.trim().is_empty() {
                continue;
            }
            match parse_row(&line) {
                Some(event) => events.push(event),
                None => log::warn!("evidence log: skipping malformed row {}", index + 1),
            }
        }
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }
}

fn quote_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn split_row(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match (c, in_quotes) {
            ('"', true) if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            ('"', _) => in_quotes = !in_quotes,
            (',', false) => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn parse_row(line: &str) -> Option<FallEvent> {
    let mut fields = split_row(line).into_iter();
    let timestamp = fields.next()?;
    let source = fields.next()?;
    let location = fields.next()?;
    let confidence = fields.next()?.trim().parse().ok()?;
    let image_path = fields.next()?;
    if fields.next().is_some() {
        return None;
    }
    Some(FallEvent {
        timestamp,
        source,
        location,
        confidence,
        image_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings(root: &Path) -> EvidenceSettings {
        EvidenceSettings {
            dir: root.join("falls"),
            log_path: root.join("falls_log.csv"),
            location: "Ward 3, bed 2".to_string(),
        }
    }

    #[test]
    fn same_second_events_get_distinct_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = EvidenceWriter::new(&settings(dir.path()))?;
        let frame = Frame::filled(32, 24, [90, 90, 90])?;
        let now = Local
            .with_ymd_and_hms(2024, 5, 1, 10, 0, 0)
            .single()
            .expect("valid time");

        let a = writer.persist_at(&frame, "10.0.0.2", 0.8, now)?;
        let b = writer.persist_at(&frame, "10.0.0.2", 0.9, now)?;
        assert_ne!(a.image_path, b.image_path);
        assert!(a.image_path.ends_with("FALL_2024-05-01_10-00-00_0.jpg"));
        assert!(Path::new(&b.image_path).is_file());
        assert_eq!(a.timestamp, "2024-05-01 10:00:00");
        Ok(())
    }

    #[test]
    fn log_quotes_and_reads_back_newest_first() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let writer = EvidenceWriter::new(&settings(dir.path()))?;
        let frame = Frame::filled(8, 8, [0, 0, 0])?;
        writer.persist(&frame, "cam-a", 0.61234)?;
        writer.persist(&frame, "cam-b", 0.9)?;

        let text = fs::read_to_string(dir.path().join("falls_log.csv"))?;
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(LOG_HEADER));
        let first = lines.next().expect("first row");
        assert!(first.contains(",\"Ward 3, bed 2\",0.612,"));

        let recent = writer.log().recent(50)?;
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].source, "cam-b");
        assert_eq!(recent[1].location, "Ward 3, bed 2");
        assert_eq!(writer.log().recent(1)?.len(), 1);
        Ok(())
    }

    #[test]
    fn failed_log_append_leaves_no_image() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut settings = settings(dir.path());
        settings.log_path = dir.path().join("log_is_a_dir");
        fs::create_dir_all(&settings.log_path)?;
        let writer = EvidenceWriter::new(&settings)?;
        let frame = Frame::filled(8, 8, [0, 0, 0])?;

        assert!(writer.persist(&frame, "cam-a", 0.9).is_err());
        assert_eq!(fs::read_dir(writer.dir())?.count(), 0);
        Ok(())
    }

    #[test]
    fn missing_log_has_no_recent_rows() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = EvidenceLog::new(&dir.path().join("absent.csv"));
        assert!(log.recent(50)?.is_empty());
        Ok(())
    }

    #[test]
    fn placeholder_uses_stream_source() {
        let event = FallEvent::placeholder("192.168.1.9");
        assert_eq!(event.source, "192.168.1.9");
        assert_eq!(event.timestamp, FallEvent::UNKNOWN);
        assert_eq!(event.image_path, FallEvent::UNKNOWN);
        assert_eq!(event.confidence, 0.0);
    }

    #[test]
    fn event_json_uses_log_column_names() -> Result<()> {
        let json = serde_json::to_value(FallEvent::placeholder("x"))?;
        assert_eq!(json["ip"], "x");
        assert!(json.get("source").is_none());
        Ok(())
    }
}
