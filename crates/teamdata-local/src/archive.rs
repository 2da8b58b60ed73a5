use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{Datelike, Local, NaiveDate, TimeZone, Timelike};
use teamdata_core::{Result, SyncError};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipArchive, ZipWriter};

/// Milliseconds since the Unix epoch.
pub fn system_time_ms(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

pub fn ms_to_system_time(ms: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Modification time of a file in ms, or 0 if it cannot be read.
pub fn file_modified_ms(path: &Path) -> i64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(system_time_ms)
        .unwrap_or(0)
}

/// Stamp a file's modification time.
pub fn set_file_modified(path: &Path, ms: i64) -> std::io::Result<()> {
    fs::File::options()
        .write(true)
        .open(path)?
        .set_modified(ms_to_system_time(ms))
}

/// Convert to a zip timestamp (local time, two-second resolution).
pub fn to_zip_time(ms: i64) -> DateTime {
    Local
        .timestamp_millis_opt(ms)
        .single()
        .and_then(|t| {
            DateTime::from_date_and_time(
                u16::try_from(t.year()).ok()?,
                t.month() as u8,
                t.day() as u8,
                t.hour() as u8,
                t.minute() as u8,
                t.second() as u8,
            )
            .ok()
        })
        .unwrap_or_default()
}

pub fn from_zip_time(time: DateTime) -> i64 {
    NaiveDate::from_ymd_opt(time.year() as i32, time.month() as u32, time.day() as u32)
        .and_then(|d| {
            d.and_hms_opt(
                time.hour() as u32,
                time.minute() as u32,
                time.second() as u32,
            )
        })
        .and_then(|naive| Local.from_local_datetime(&naive).earliest())
        .map(|t| t.timestamp_millis())
        .unwrap_or(0)
}

/// Reversible single-byte XOR over a whole buffer.
pub fn xor_in_place(bytes: &mut [u8], mask: u8) {
    for b in bytes.iter_mut() {
        *b ^= mask;
    }
}

pub fn zip_error(e: zip::result::ZipError) -> SyncError {
    match e {
        zip::result::ZipError::Io(io) => SyncError::Io(io.to_string()),
        other => SyncError::InvalidArchive(other.to_string()),
    }
}

/// A file read out of an archive.
#[derive(Debug, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub modified: i64,
    pub data: Vec<u8>,
}

/// Read every file entry of an in-memory zip archive.
pub fn read_archive(bytes: &[u8]) -> Result<Vec<ArchiveEntry>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(zip_error)?;
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut file = archive.by_index(i).map_err(zip_error)?;
        if file.is_dir() {
            continue;
        }
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        entries.push(ArchiveEntry {
            name: file.name().to_string(),
            modified: from_zip_time(file.last_modified()),
            data,
        });
    }
    Ok(entries)
}

/// Number of entries (files and directories) in an in-memory archive.
pub fn archive_entry_count(bytes: &[u8]) -> Result<usize> {
    Ok(ZipArchive::new(Cursor::new(bytes)).map_err(zip_error)?.len())
}

/// Builds a zip archive in memory.
pub struct ArchiveBuilder {
    writer: ZipWriter<Cursor<Vec<u8>>>,
}

impl Default for ArchiveBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self {
            writer: ZipWriter::new(Cursor::new(Vec::new())),
        }
    }

    pub fn add(&mut self, name: &str, modified: i64, data: &[u8]) -> Result<()> {
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(to_zip_time(modified));
        self.writer.start_file(name, options).map_err(zip_error)?;
        self.writer.write_all(data)?;
        Ok(())
    }

    /// Add a file from disk, keeping its modification time.
    pub fn add_file(&mut self, name: &str, path: &Path) -> Result<()> {
        let data = fs::read(path)?;
        self.add(name, file_modified_ms(path), &data)
    }

    pub fn finish(mut self) -> Result<Vec<u8>> {
        Ok(self.writer.finish().map_err(zip_error)?.into_inner())
    }
}

/// Write `data` to `dest` through a temp file in the same directory.
///
/// On failure the temp file is removed and `dest` is left untouched.
pub fn replace_file(dest: &Path, data: &[u8]) -> Result<()> {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp = dest.with_file_name(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let written = fs::write(&temp, data).and_then(|_| fs::rename(&temp, dest));
    if let Err(e) = written {
        let _ = fs::remove_file(&temp);
        return Err(SyncError::Io(format!(
            "Failed to write {}: {}",
            dest.display(),
            e
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_time_round_trip() {
        // 2023-11-14, even second
        let ms = Local
            .with_ymd_and_hms(2023, 11, 14, 10, 30, 42)
            .single()
            .unwrap()
            .timestamp_millis();
        assert_eq!(from_zip_time(to_zip_time(ms)), ms);
    }

    #[test]
    fn test_zip_time_truncates_to_two_seconds() {
        let ms = Local
            .with_ymd_and_hms(2023, 11, 14, 10, 30, 43)
            .single()
            .unwrap()
            .timestamp_millis();
        let mut builder = ArchiveBuilder::new();
        builder.add("state", ms, b"").unwrap();
        let entries = read_archive(&builder.finish().unwrap()).unwrap();
        assert_eq!(entries[0].modified, ms - 1000);
    }

    #[test]
    fn test_xor_is_reversible() {
        let original = b"PK\x03\x04hello".to_vec();
        let mut bytes = original.clone();
        xor_in_place(&mut bytes, 0x55);
        assert_ne!(bytes, original);
        xor_in_place(&mut bytes, 0x55);
        assert_eq!(bytes, original);
    }

    #[test]
    fn test_archive_builder_and_reader() {
        let ms = Local
            .with_ymd_and_hms(2024, 2, 29, 8, 0, 0)
            .single()
            .unwrap()
            .timestamp_millis();
        let mut builder = ArchiveBuilder::new();
        builder.add("state", ms, b"a=1").unwrap();
        builder.add("cms/page.xml", ms, b"<p/>").unwrap();
        let bytes = builder.finish().unwrap();

        let entries = read_archive(&bytes).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "state");
        assert_eq!(entries[0].data, b"a=1");
        assert_eq!(entries[1].modified, ms);
    }

    #[test]
    fn test_not_an_archive() {
        assert!(matches!(
            read_archive(b"this is plain text"),
            Err(SyncError::InvalidArchive(_))
        ));
    }
}
