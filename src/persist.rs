//! JSON array files under the data directory.
//!
//! Every file is a JSON array of flat records. Reads never fail: a missing
//! file is empty and a corrupt one is logged and treated as empty. Writes go
//! to `<name>.json.tmp` first and are renamed over the target, so readers see
//! either the old or the new array.

use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

pub const FEEDBACK_FILE: &str = "feedback.json";
pub const ADJUSTMENTS_FILE: &str = "adjustments.json";
pub const TUNING_FILE: &str = "tuning.json";
pub const HEALTH_FILE: &str = "health.json";

/// Records in `path`, or an empty list when the file is missing or unreadable.
pub fn read_array<T: DeserializeOwned>(path: &Path) -> Vec<T> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Could not read state file, using defaults");
            return Vec::new();
        }
    };
    match serde_json::from_str(&content) {
        Ok(records) => records,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt state file, using defaults");
            Vec::new()
        }
    }
}

/// Replace `path` with `records` via write-to-temp + rename.
pub fn write_array<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let data = serde_json::to_string_pretty(records)?;
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, data)
        .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let records: Vec<u32> = read_array(&dir.path().join("absent.json"));
        assert!(records.is_empty());
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(FEEDBACK_FILE);
        write_array(&path, &[1u32, 2, 3]).unwrap();
        assert_eq!(read_array::<u32>(&path), vec![1, 2, 3]);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(TUNING_FILE);
        std::fs::write(&path, "{ not json").unwrap();
        assert!(read_array::<u32>(&path).is_empty());
    }
}
