//! JSON document persistence shared by the conversation log and the long-term state file.
//!
//! Documents are rewritten whole on every mutation. A file that fails to parse is
//! copied aside to `<name>.backup` and replaced by the default document so startup
//! never stalls on corrupted state.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime, Timelike};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Local wall-clock time at second precision, matching the on-disk format.
pub fn now_timestamp() -> NaiveDateTime {
    let now = Local::now().naive_local();
    now.with_nanosecond(0).unwrap_or(now)
}

/// serde codec for `"YYYY-MM-DD HH:MM:SS"` timestamps.
pub mod timestamp_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format(TIMESTAMP_FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT)
            .map_err(serde::de::Error::custom)
    }
}

/// Load a JSON document, creating or resetting it to `T::default()` when missing,
/// empty, or malformed.
pub fn load_document<T>(path: &Path, description: &str) -> T
where
    T: DeserializeOwned + Serialize + Default,
{
    if !path.exists() {
        tracing::info!("{} not found, creating default at {:?}", description, path);
        return reset_document(path, description);
    }

    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            tracing::error!("Failed to read {} {:?}: {}", description, path, e);
            return T::default();
        }
    };

    if contents.trim().is_empty() {
        tracing::warn!("{} {:?} is empty, reinitializing", description, path);
        return reset_document(path, description);
    }

    match serde_json::from_str::<T>(&contents) {
        Ok(document) => document,
        Err(e) => {
            tracing::error!("{} {:?} is corrupted ({}), backing up", description, path, e);
            let backup = backup_path(path);
            match fs::copy(path, &backup) {
                Ok(_) => tracing::warn!("Backed up corrupted {} to {:?}", description, backup),
                Err(copy_err) => tracing::error!("Backup of {:?} failed: {}", path, copy_err),
            }
            reset_document(path, description)
        }
    }
}

/// Read a document without repairing it. A missing or empty file is `None`; a read
/// or parse failure is an error and the file is left as it is.
pub fn read_document<T>(path: &Path) -> Result<Option<T>>
where
    T: DeserializeOwned,
{
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {:?}", path)),
    };
    if contents.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(&contents)
        .map(Some)
        .with_context(|| format!("Failed to parse {:?}", path))
}

fn reset_document<T>(path: &Path, description: &str) -> T
where
    T: Serialize + Default,
{
    let document = T::default();
    if let Err(e) = write_document(path, &document) {
        tracing::warn!("Failed to write default {}: {:#}", description, e);
    }
    document
}

/// Serialize `document` pretty-printed and replace `path` via a sibling temp file.
pub fn write_document<T>(path: &Path, document: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {:?}", parent))?;
        }
    }

    let json = serde_json::to_string_pretty(document).context("Failed to serialize document")?;
    let tmp = temp_path(path);
    fs::write(&tmp, json).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".backup");
    PathBuf::from(name)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        #[serde(default)]
        count: u32,
        #[serde(default)]
        note: String,
    }

    #[test]
    fn missing_file_is_created_with_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sample.json");

        let sample: Sample = load_document(&path, "sample file");
        assert_eq!(sample, Sample::default());
        assert!(path.exists());
    }

    #[test]
    fn corrupted_file_is_backed_up_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        fs::write(&path, "{ not json").unwrap();

        let sample: Sample = load_document(&path, "sample file");
        assert_eq!(sample, Sample::default());

        let backup = fs::read_to_string(backup_path(&path)).unwrap();
        assert_eq!(backup, "{ not json");
        let rewritten: Sample = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(rewritten, Sample::default());
    }

    #[test]
    fn write_then_load_keeps_non_ascii_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        let original = Sample {
            count: 3,
            note: "主人戳了戳桌宠".to_string(),
        };
        write_document(&path, &original).unwrap();

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("主人戳了戳桌宠"));
        let loaded: Sample = load_document(&path, "sample file");
        assert_eq!(loaded, original);
    }

    #[test]
    fn strict_read_leaves_bad_files_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.json");
        assert_eq!(read_document::<Sample>(&path).unwrap(), None);

        fs::write(&path, "{ not json").unwrap();
        assert!(read_document::<Sample>(&path).is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{ not json");
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn timestamp_codec_uses_wall_clock_format() {
        #[derive(Serialize, Deserialize)]
        struct Stamped {
            #[serde(with = "timestamp_format")]
            at: NaiveDateTime,
        }

        let parsed: Stamped = serde_json::from_str(r#"{"at":"2024-05-01 09:30:15"}"#).unwrap();
        assert_eq!(
            serde_json::to_string(&parsed).unwrap(),
            r#"{"at":"2024-05-01 09:30:15"}"#
        );
        assert!(serde_json::from_str::<Stamped>(r#"{"at":"2024-05-01T09:30:15Z"}"#).is_err());
    }
}
