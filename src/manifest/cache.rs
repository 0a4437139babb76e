//! Local manifest cache: an on-disk property-list tree plus an in-memory
//! negative URL cache so a 404 during a session isn't retried.

use crate::error::CoreError;
use crate::manifest::model::Manifest;
use dashmap::DashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const NEGATIVE_CACHE_TTL: Duration = Duration::from_secs(300);

pub struct ManifestCache {
    dir: PathBuf,
    negative_urls: DashMap<String, Instant>,
}

impl ManifestCache {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            negative_urls: DashMap::new(),
        })
    }

    pub fn mark_negative(&self, url: &str) {
        self.negative_urls.insert(url.to_string(), Instant::now());
    }

    pub fn is_negative(&self, url: &str) -> bool {
        match self.negative_urls.get(url) {
            Some(seen) if seen.elapsed() < NEGATIVE_CACHE_TTL => true,
            Some(_) => {
                drop(self.negative_urls.remove(url));
                false
            }
            None => false,
        }
    }

    fn path_for(&self, identifier: &str) -> PathBuf {
        let safe: String = identifier
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.plist"))
    }

    /// Returns `(manifest, was_expired)`. `max_age` of `None` means the
    /// entry never expires on disk (the resolver decides staleness).
    pub fn get(&self, identifier: &str, max_age: Option<Duration>) -> Option<(Manifest, bool)> {
        let path = self.path_for(identifier);
        let bytes = fs::read(&path).ok()?;
        let manifest: Manifest = plist::from_bytes(&bytes).ok()?;
        let expired = match max_age {
            Some(max_age) => {
                let modified = fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                modified.elapsed().map(|age| age > max_age).unwrap_or(false)
            }
            None => false,
        };
        Some((manifest, expired))
    }

    pub fn store(&self, identifier: &str, manifest: &Manifest) -> Result<(), CoreError> {
        let path = self.path_for(identifier);
        let tmp_path = path.with_extension("plist.tmp");
        let mut bytes = Vec::new();
        plist::to_writer_xml(&mut bytes, manifest)
            .map_err(|e| CoreError::CacheIoError(format!("manifest plist encode failed: {e}")))?;
        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::model::Manifest;

    #[test]
    fn round_trips_a_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ManifestCache::open(dir.path()).unwrap();
        let manifest = Manifest {
            identifier: "base".into(),
            ..Default::default()
        };
        cache.store("base", &manifest).unwrap();
        let (loaded, expired) = cache.get("base", None).unwrap();
        assert_eq!(loaded.identifier, "base");
        assert!(!expired);
    }

    #[test]
    fn missing_entry_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ManifestCache::open(dir.path()).unwrap();
        assert!(cache.get("missing", None).is_none());
    }

    #[test]
    fn negative_cache_remembers_and_expires_a_url() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ManifestCache::open(dir.path()).unwrap();
        assert!(!cache.is_negative("https://example.com/a"));
        cache.mark_negative("https://example.com/a");
        assert!(cache.is_negative("https://example.com/a"));
    }
}
