//! Tabular and document sink.
//!
//! All writes go to a temporary file in the destination directory and are
//! renamed into place, so a reader never observes a partially written file.

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use refkb_core::{Error, Result};

/// Atomically replace `path` with `data`, creating parent directories.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = parent_dir(path);
    std::fs::create_dir_all(parent)?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| {
        warn!(
            subsystem = "sink",
            op = "persist",
            path = %path.display(),
            error = %e.error,
            "Atomic rename failed"
        );
        Error::Io(e.error)
    })?;

    debug!(
        subsystem = "sink",
        op = "write",
        path = %path.display(),
        size = data.len(),
        "Wrote file"
    );
    Ok(())
}

/// Write records as CSV with a header row. Returns the record count.
pub fn write_csv<T: Serialize>(path: &Path, records: &[T]) -> Result<usize> {
    let parent = parent_dir(path);
    std::fs::create_dir_all(parent)?;

    let tmp = NamedTempFile::new_in(parent)?;
    let mut writer = csv::Writer::from_writer(tmp);
    for record in records {
        writer.serialize(record)?;
    }
    let tmp = writer.into_inner().map_err(|e| {
        Error::Io(std::io::Error::new(e.error().kind(), e.error().to_string()))
    })?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;

    debug!(
        subsystem = "sink",
        op = "write_csv",
        path = %path.display(),
        record_count = records.len(),
        "Wrote CSV"
    );
    Ok(records.len())
}

/// Read all records from a CSV file with a header row.
///
/// A missing file is reported as [`Error::NotFound`] so callers can tell
/// "not extracted yet" apart from a malformed file.
pub fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Err(Error::NotFound(format!("{} does not exist", path.display())));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let records = reader
        .deserialize()
        .collect::<std::result::Result<Vec<T>, csv::Error>>()?;
    Ok(records)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use refkb_core::{AnnotationRecord, MetadataRecord};

    fn metadata() -> MetadataRecord {
        MetadataRecord {
            paper_id: 7,
            paper_key: "KEY7".into(),
            paper_title: "Title, with comma".into(),
            authors: "Adams, Alice; Baker".into(),
            collection_names: "A; B".into(),
            paper_date_added: "2024-01-01 00:00:00".into(),
            paper_date_modified: "2024-01-02 00:00:00".into(),
            attachment_id: None,
            attachment_key: None,
            attachment_path: None,
            attachment_fullpath: None,
            content_type: None,
            link_mode: None,
            attachment_date_added: None,
        }
    }

    #[test]
    fn test_write_atomic_creates_parents_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.md");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1, "no temp files left behind");
    }

    #[test]
    fn test_csv_keeps_empty_attachment_fields_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.csv");

        let count = write_csv(&path, &[metadata()]).unwrap();
        assert_eq!(count, 1);

        let back: Vec<MetadataRecord> = read_csv(&path).unwrap();
        assert_eq!(back, vec![metadata()]);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"Title, with comma\""));
    }

    #[test]
    fn test_read_csv_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_csv::<AnnotationRecord>(&dir.path().join("nope.csv")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_read_csv_malformed_is_serialization_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "annotation_id,attachment_id\nnot-a-number,1\n").unwrap();
        let err = read_csv::<AnnotationRecord>(&path).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
