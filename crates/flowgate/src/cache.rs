//! Persistent result cache keyed by fingerprint.
//!
//! Layout: `<dir>/<first two hex chars>/<fingerprint>.json`. Writes go through a
//! temp file and a rename, so a reader sees either the old entry or the new one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::result::EvalResult;

#[derive(Debug, Clone)]
pub struct ResultCache {
    enabled: bool,
    dir: PathBuf,
}

impl ResultCache {
    pub fn new(enabled: bool, dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled,
            dir: dir.into(),
        }
    }

    pub fn from_config(cfg: &CacheConfig) -> Self {
        Self::new(cfg.enabled, &cfg.dir)
    }

    pub fn disabled() -> Self {
        Self::new(false, PathBuf::new())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &Fingerprint) -> PathBuf {
        let k = key.as_str();
        self.dir.join(&k[..2]).join(format!("{k}.json"))
    }

    /// Empty results are reported as a miss so they get recomputed.
    pub fn get(&self, key: &Fingerprint) -> Result<Option<EvalResult>> {
        if !self.enabled {
            return Ok(None);
        }
        let path = self.entry_path(key);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::io(format!("failed to read {}: {e}", path.display())));
            }
        };
        let result = match serde_json::from_str::<EvalResult>(&raw) {
            Ok(r) => r,
            Err(e) => {
                warn!(key = %key, path = %path.display(), "ignoring unreadable cache entry: {e}");
                return Ok(None);
            }
        };
        if result.output_is_empty() && result.exceptions.is_empty() {
            debug!(key = %key, "cached result is empty, treating as miss");
            return Ok(None);
        }
        debug!(key = %key, "cache hit");
        Ok(Some(result))
    }

    pub fn put(&self, key: &Fingerprint, result: &EvalResult) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let body = serde_json::to_string_pretty(result)?;
        self.write_entry(key, body.as_bytes())?;
        debug!(key = %key, "cached result");
        Ok(())
    }

    /// Stage the body in the entry's shard, then rename it over the entry.
    fn write_entry(&self, key: &Fingerprint, body: &[u8]) -> Result<()> {
        let path = self.entry_path(key);
        let shard = path
            .parent()
            .ok_or_else(|| Error::io(format!("cache entry {key} has no shard directory")))?;
        fs::create_dir_all(shard).map_err(|e| {
            Error::io(format!(
                "cache entry {key}: cannot create shard {}: {e}",
                shard.display()
            ))
        })?;
        let mut staged = tempfile::NamedTempFile::new_in(shard).map_err(|e| {
            Error::io(format!("cache entry {key}: cannot stage in {}: {e}", shard.display()))
        })?;
        staged
            .write_all(body)
            .map_err(|e| Error::io(format!("cache entry {key}: write failed: {e}")))?;
        staged.persist(&path).map_err(|e| {
            Error::io(format!(
                "cache entry {key}: cannot move into {}: {}",
                path.display(),
                e.error
            ))
        })?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<PathBuf>> {
        let mut out = Vec::new();
        let shards = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(Error::io(format!(
                    "failed to list {}: {e}",
                    self.dir.display()
                )));
            }
        };
        for shard in shards {
            let shard = shard?.path();
            if !shard.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&shard)? {
                let p = entry?.path();
                if p.extension().and_then(|s| s.to_str()) == Some("json") {
                    out.push(p);
                }
            }
        }
        Ok(out)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Removes every entry; returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let entries = self.entries()?;
        for p in &entries {
            fs::remove_file(p)
                .map_err(|e| Error::io(format!("failed to remove {}: {e}", p.display())))?;
        }
        info!(dir = %self.dir.display(), removed = entries.len(), "cache cleared");
        Ok(entries.len())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::fingerprint::{Params, fingerprint};
    use crate::result::WorkflowException;

    fn key(target: &str) -> Fingerprint {
        fingerprint(target, &Params::from([("x".to_string(), json!(1))])).expect("key")
    }

    fn filled() -> EvalResult {
        EvalResult {
            output: json!({"y": 2}),
            exceptions: Vec::new(),
            jobdir: Some("/tmp/job".into()),
        }
    }

    #[test]
    fn put_then_get_survives_a_new_instance() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let k = key("t1");
        ResultCache::new(true, tmp.path()).put(&k, &filled()).expect("put");

        let reopened = ResultCache::new(true, tmp.path());
        assert_eq!(reopened.get(&k).expect("get"), Some(filled()));
        assert_eq!(reopened.len().expect("len"), 1);
        assert!(tmp.path().join(&k.as_str()[..2]).is_dir());
    }

    #[test]
    fn empty_result_reads_as_miss() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = ResultCache::new(true, tmp.path());
        let k = key("t1");
        cache.put(&k, &EvalResult::empty()).expect("put");
        assert_eq!(cache.get(&k).expect("get"), None);
    }

    #[test]
    fn failures_with_exceptions_are_kept() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = ResultCache::new(true, tmp.path());
        let k = key("t1");
        let failed = EvalResult::new(
            serde_json::Map::new(),
            vec![WorkflowException::new("ValueError", "bad")],
        );
        cache.put(&k, &failed).expect("put");
        assert_eq!(cache.get(&k).expect("get"), Some(failed));
    }

    #[test]
    fn disabled_cache_never_touches_disk() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = ResultCache::new(false, tmp.path().join("c"));
        let k = key("t1");
        cache.put(&k, &filled()).expect("put");
        assert_eq!(cache.get(&k).expect("get"), None);
        assert!(!tmp.path().join("c").exists());
    }

    #[test]
    fn corrupt_entry_is_a_miss_and_clear_counts_entries() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = ResultCache::new(true, tmp.path());
        let (a, b) = (key("a"), key("b"));
        cache.put(&a, &filled()).expect("put a");
        cache.put(&b, &filled()).expect("put b");
        fs::write(cache.entry_path(&b), "{not json").expect("corrupt");
        assert_eq!(cache.get(&b).expect("get"), None);

        assert_eq!(cache.clear().expect("clear"), 2);
        assert!(cache.is_empty().expect("empty"));
        assert_eq!(cache.get(&a).expect("get"), None);
    }

    #[test]
    fn missing_dir_is_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = ResultCache::new(true, tmp.path().join("nope"));
        assert_eq!(cache.len().expect("len"), 0);
        assert_eq!(cache.clear().expect("clear"), 0);
    }

    #[test]
    fn unwritable_shard_names_the_entry() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let cache = ResultCache::new(true, tmp.path());
        let k = key("t1");
        fs::write(tmp.path().join(&k.as_str()[..2]), "not a directory").expect("blocker");

        let err = cache.put(&k, &filled()).expect_err("shard is a file");
        assert!(err.to_string().contains("cache entry"), "{err}");
        assert!(err.to_string().contains(k.as_str()), "{err}");
        assert_eq!(cache.len().expect("len"), 0);
    }
}
