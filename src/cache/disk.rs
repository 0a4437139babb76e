//! Tier 2: one file per entry under a cache directory, with a single
//! atomically-written metadata record tracking aggregate size.

use crate::cache::entry::CacheEntry;
use crate::error::CoreError;
use chrono::{DateTime, Duration, Utc};
use ring::digest::{Context, SHA256};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const CURRENT_METADATA_VERSION: u32 = 1;
const METADATA_FILE: &str = "cache_metadata.plist";

/// Scaffolded incremental migration steps, keyed by the version they
/// migrate *from*. Empty today; the "clear and bump" path below is what
/// actually runs until a step is registered here.
type MigrationStep = fn(&Path) -> Result<(), CoreError>;
const MIGRATIONS: &[(u32, MigrationStep)] = &[];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DiskMetadata {
    version: u32,
    created_at: DateTime<Utc>,
    last_maintenance: DateTime<Utc>,
    total_size: u64,
    entry_count: u64,
}

impl Default for DiskMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: CURRENT_METADATA_VERSION,
            created_at: now,
            last_maintenance: now,
            total_size: 0,
            entry_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedEntry {
    key: String,
    rule_set: crate::rules::model::RuleSet,
    created_at: DateTime<Utc>,
}

pub struct DiskTier {
    dir: PathBuf,
    byte_budget: u64,
}

impl DiskTier {
    pub fn open(dir: impl Into<PathBuf>, byte_budget: u64) -> Result<Self, CoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let tier = Self { dir, byte_budget };
        tier.run_migration_if_needed()?;
        Ok(tier)
    }

    fn metadata_path(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    fn read_metadata(&self) -> DiskMetadata {
        fs::read(self.metadata_path())
            .ok()
            .and_then(|bytes| plist::from_bytes(&bytes).ok())
            .unwrap_or_default()
    }

    fn write_metadata(&self, metadata: &DiskMetadata) -> Result<(), CoreError> {
        let tmp_path = self.metadata_path().with_extension("tmp");
        let mut bytes = Vec::new();
        plist::to_writer_xml(&mut bytes, metadata).map_err(|e| CoreError::CacheIoError(e.to_string()))?;
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, self.metadata_path())?;
        Ok(())
    }

    fn run_migration_if_needed(&self) -> Result<(), CoreError> {
        let metadata = self.read_metadata();
        if metadata.version == CURRENT_METADATA_VERSION {
            return Ok(());
        }

        let backup_path = self.dir.with_extension("backup");
        copy_dir(&self.dir, &backup_path)?;

        let outcome = self.run_migration_steps(metadata.version);
        match outcome {
            Ok(()) => {
                let _ = fs::remove_dir_all(&backup_path);
                self.write_metadata(&DiskMetadata {
                    version: CURRENT_METADATA_VERSION,
                    ..DiskMetadata::default()
                })
            }
            Err(err) => {
                let _ = fs::remove_dir_all(&self.dir);
                let _ = fs::rename(&backup_path, &self.dir);
                Err(err)
            }
        }
    }

    fn run_migration_steps(&self, from_version: u32) -> Result<(), CoreError> {
        let mut applicable: Vec<&MigrationStep> = MIGRATIONS
            .iter()
            .filter(|(v, _)| *v >= from_version)
            .map(|(_, step)| step)
            .collect();
        applicable.sort_by_key(|_| 0); // stable order as registered

        if applicable.is_empty() {
            // No stepped migration registered for this version jump: the
            // only implemented path is clear-and-bump.
            self.clear()?;
            return Ok(());
        }

        for step in applicable {
            step(&self.dir)?;
        }
        Ok(())
    }

    fn file_name_for(&self, key: &str) -> PathBuf {
        let mut ctx = Context::new(&SHA256);
        ctx.update(key.as_bytes());
        let digest = ctx.finish();
        self.dir.join(format!("{}.cache", hex::encode(digest.as_ref())))
    }

    pub fn get(&self, key: &str, max_age: Duration) -> Result<Option<CacheEntry>, CoreError> {
        let path = self.file_name_for(key);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let persisted: PersistedEntry =
            serde_json::from_slice(&bytes).map_err(|e| CoreError::CacheIoError(e.to_string()))?;

        if Utc::now() - persisted.created_at > max_age {
            let _ = fs::remove_file(&path);
            return Ok(None);
        }

        // Touch mtime to mark access for the LRU-by-modification-time
        // eviction policy below.
        let now = SystemTime::now();
        let _ = filetime_touch(&path, now);

        Ok(Some(CacheEntry {
            key: persisted.key,
            rule_set: persisted.rule_set,
            created_at: persisted.created_at,
            last_accessed: Utc::now(),
            size_bytes: bytes.len() as u64,
        }))
    }

    pub fn store(&self, entry: &CacheEntry) -> Result<(), CoreError> {
        let persisted = PersistedEntry {
            key: entry.key.clone(),
            rule_set: entry.rule_set.clone(),
            created_at: entry.created_at,
        };
        let bytes =
            serde_json::to_vec(&persisted).map_err(|e| CoreError::CacheIoError(e.to_string()))?;

        self.make_room_for(bytes.len() as u64)?;

        let path = self.file_name_for(&entry.key);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &path)?;

        self.recompute_metadata()
    }

    fn make_room_for(&self, incoming_size: u64) -> Result<(), CoreError> {
        let mut files = self.cache_files_by_mtime()?;
        let mut total: u64 = files.iter().map(|(_, size, _)| *size).sum();

        while total + incoming_size > self.byte_budget && !files.is_empty() {
            let (path, size, _) = files.remove(0);
            let _ = fs::remove_file(&path);
            total = total.saturating_sub(size);
        }
        Ok(())
    }

    fn cache_files_by_mtime(&self) -> Result<Vec<(PathBuf, u64, SystemTime)>, CoreError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("cache") {
                continue;
            }
            let meta = entry.metadata()?;
            files.push((path, meta.len(), meta.modified()?));
        }
        files.sort_by_key(|(_, _, mtime)| *mtime);
        Ok(files)
    }

    pub fn invalidate(&self, key: &str) -> Result<(), CoreError> {
        let path = self.file_name_for(key);
        match fs::remove_file(&path) {
            Ok(()) => self.recompute_metadata(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear(&self) -> Result<(), CoreError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("cache") {
                let _ = fs::remove_file(path);
            }
        }
        self.recompute_metadata()
    }

    fn recompute_metadata(&self) -> Result<(), CoreError> {
        let files = self.cache_files_by_mtime()?;
        let total_size = files.iter().map(|(_, size, _)| size).sum();
        let entry_count = files.len() as u64;
        let mut metadata = self.read_metadata();
        metadata.total_size = total_size;
        metadata.entry_count = entry_count;
        metadata.last_maintenance = Utc::now();
        self.write_metadata(&metadata)
    }
}

fn filetime_touch(path: &Path, _now: SystemTime) -> Result<(), CoreError> {
    // Re-writing the file's own bytes back bumps its modification time
    // without pulling in a dedicated filetime dependency.
    let bytes = fs::read(path)?;
    fs::write(path, bytes)?;
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> Result<(), CoreError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let dst_path = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dst_path)?;
        } else {
            fs::copy(entry.path(), dst_path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::RuleSet;
    use tempfile::tempdir;

    fn entry(key: &str) -> CacheEntry {
        CacheEntry::new(key, RuleSet::new(key))
    }

    #[test]
    fn stores_and_retrieves_by_key() {
        let dir = tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), 1_000_000).unwrap();
        tier.store(&entry("source-a")).unwrap();

        let hit = tier.get("source-a", Duration::hours(1)).unwrap();
        assert!(hit.is_some());
        assert_eq!(hit.unwrap().key, "source-a");
    }

    #[test]
    fn missing_key_is_none() {
        let dir = tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), 1_000_000).unwrap();
        assert!(tier.get("missing", Duration::hours(1)).unwrap().is_none());
    }

    #[test]
    fn expired_entry_is_evicted_on_get() {
        let dir = tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), 1_000_000).unwrap();
        tier.store(&entry("source-a")).unwrap();
        assert!(tier.get("source-a", Duration::seconds(-1)).unwrap().is_none());
    }

    #[test]
    fn invalidate_removes_the_file() {
        let dir = tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), 1_000_000).unwrap();
        tier.store(&entry("source-a")).unwrap();
        tier.invalidate("source-a").unwrap();
        assert!(tier.get("source-a", Duration::hours(1)).unwrap().is_none());
    }

    #[test]
    fn metadata_is_written_atomically_and_readable() {
        let dir = tempdir().unwrap();
        let tier = DiskTier::open(dir.path(), 1_000_000).unwrap();
        tier.store(&entry("source-a")).unwrap();
        let metadata_path = dir.path().join(METADATA_FILE);
        assert!(metadata_path.exists());
        assert!(!dir.path().join("cache_metadata.tmp").exists());
    }
}
