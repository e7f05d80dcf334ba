use anyhow::Result;
use chrono::{Local, TimeZone};
use tempfile::TempDir;

use fallwatch::config::EvidenceSettings;
use fallwatch::evidence::LOG_HEADER;
use fallwatch::{EvidenceWriter, Frame};

fn settings(tmp: &TempDir) -> EvidenceSettings {
    EvidenceSettings {
        dir: tmp.path().join("falls"),
        log_path: tmp.path().join("logs").join("falls_log.csv"),
        location: "Hall, ground floor".into(),
    }
}

#[test]
fn restart_appends_to_existing_log() -> Result<()> {
    let tmp = TempDir::new()?;
    let frame = Frame::filled(32, 24, [90, 90, 90])?;
    let at = Local.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();

    let first = EvidenceWriter::new(&settings(&tmp))?;
    let a = first.persist_at(&frame, "local", 0.72, at)?;
    drop(first);

    // Same second after a restart: the image name must not be reused.
    let second = EvidenceWriter::new(&settings(&tmp))?;
    let b = second.persist_at(&frame, "uploaded", 0.91, at)?;
    assert_ne!(a.image_path, b.image_path);
    assert!(a.image_path.ends_with("FALL_2024-05-01_10-00-00_0.jpg"));
    assert!(b.image_path.ends_with("FALL_2024-05-01_10-00-00_1.jpg"));

    let raw = std::fs::read_to_string(second.log().path())?;
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], LOG_HEADER);
    assert_eq!(raw.matches(LOG_HEADER).count(), 1);
    assert!(lines[1].starts_with("2024-05-01 10:00:00,local,\"Hall, ground floor\",0.720,"));

    let recent = second.log().recent(50)?;
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0], b);
    assert_eq!(recent[1].source, "local");
    assert_eq!(recent[1].location, "Hall, ground floor");
    Ok(())
}

#[test]
fn recent_is_capped_and_newest_first() -> Result<()> {
    let tmp = TempDir::new()?;
    let writer = EvidenceWriter::new(&settings(&tmp))?;
    let frame = Frame::filled(8, 8, [0, 0, 0])?;
    let at = Local.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
    for i in 0..55 {
        writer.persist_at(&frame, &format!("cam-{}", i), 0.8, at)?;
    }

    let recent = writer.log().recent(50)?;
    assert_eq!(recent.len(), 50);
    assert_eq!(recent[0].source, "cam-54");
    assert_eq!(recent[49].source, "cam-5");
    Ok(())
}

#[test]
fn missing_log_reads_as_empty() -> Result<()> {
    let tmp = TempDir::new()?;
    let writer = EvidenceWriter::new(&settings(&tmp))?;
    assert!(writer.log().recent(50)?.is_empty());
    Ok(())
}
