//! Durable queue snapshot.
//!
//! The pending-job list is mirrored to disk as a flat JSON array of string
//! ids. Every save writes a temp file in the target directory and renames it
//! over the old snapshot, so a crash mid-write can never leave a truncated
//! file behind. A missing snapshot at startup means an empty queue.

use std::path::Path;

use tempfile::NamedTempFile;
use uuid::Uuid;

use crate::Result;

/// Load the pending-job list, treating an absent file as empty.
pub fn load(path: &Path) -> Result<Vec<Uuid>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };

    let encoded: Vec<String> = serde_json::from_str(&raw)?;
    encoded
        .iter()
        .map(|id| Uuid::parse_str(id).map_err(Into::into))
        .collect()
}

/// Atomically replace the snapshot with the given id list.
pub fn save(path: &Path, ids: &[Uuid]) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let encoded: Vec<String> = ids.iter().map(Uuid::to_string).collect();
    let mut tmp = NamedTempFile::new_in(parent)?;
    serde_json::to_writer(tmp.as_file_mut(), &encoded)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_snapshot_is_empty() {
        let dir = TempDir::new().unwrap();
        let ids = load(&dir.path().join("queue.json")).unwrap();
        assert!(ids.is_empty());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        let ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];

        save(&path, &ids).unwrap();
        assert_eq!(load(&path).unwrap(), ids);
    }

    #[test]
    fn test_save_replaces_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        let first = vec![Uuid::new_v4(), Uuid::new_v4()];
        let second = vec![first[1]];

        save(&path, &first).unwrap();
        save(&path, &second).unwrap();
        assert_eq!(load(&path).unwrap(), second);
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, b"not json at all").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_save_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/state/queue.json");
        save(&path, &[Uuid::new_v4()]).unwrap();
        assert_eq!(load(&path).unwrap().len(), 1);
    }
}
