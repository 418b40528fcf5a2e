use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use toml::Value;

use crate::error::{Error, Result};

mod settings;

pub use settings::{
    CacheConfig, Credential, EngineConfig, ExtractionConfig, JobsConfig, OrchestratorConfig,
    PoolConfig, RemoteConfig, RouterConfig,
};

#[derive(Debug, Clone)]
pub struct ConfigDoc {
    pub path: PathBuf,
    pub value: Value,
}

impl ConfigDoc {
    /// Parse an in-memory document; relative paths resolve against `path`'s parent.
    pub fn parse(path: impl Into<PathBuf>, raw: &str) -> Result<Self> {
        let path = path.into();
        let value: Value = toml::from_str(raw)
            .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;
        Ok(Self { path, value })
    }

    pub fn value_path(&self, path: &str) -> Option<&Value> {
        let path = path.trim();
        if path.is_empty() {
            return Some(&self.value);
        }

        let mut cur = &self.value;
        for seg in path.split('.') {
            let tbl = cur.as_table()?;
            cur = tbl.get(seg)?;
        }
        Some(cur)
    }

    pub fn deserialize_path<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let Some(v) = self.value_path(path) else {
            return Ok(None);
        };
        let parsed = v
            .clone()
            .try_into()
            .map_err(|e| Error::config(format!("invalid config at '{}': {e}", path)))?;
        Ok(Some(parsed))
    }

    // Relative paths in the document are relative to the file that declared them.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        resolve_ref_path(&self.path, raw)
    }
}

fn merge_values(base: &mut Value, child: Value) {
    match (base, child) {
        (Value::Table(base_tbl), Value::Table(child_tbl)) => {
            for (k, v) in child_tbl {
                match base_tbl.get_mut(&k) {
                    Some(existing) => merge_values(existing, v),
                    None => {
                        base_tbl.insert(k, v);
                    }
                }
            }
        }
        (base_slot, child_val) => {
            *base_slot = child_val;
        }
    }
}

fn resolve_ref_path(from_file: &Path, reference: &str) -> PathBuf {
    let p = PathBuf::from(reference);
    if p.is_absolute() {
        p
    } else {
        from_file.parent().unwrap_or_else(|| Path::new(".")).join(p)
    }
}

fn parse_imports(path: &Path, value: &Value) -> Result<Vec<String>> {
    let Some(arr) = value.get("imports").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };
    arr.iter()
        .map(|v| {
            v.as_str().map(|s| s.trim().to_string()).ok_or_else(|| {
                Error::config(format!(
                    "invalid imports entry in {} (expected string)",
                    path.display()
                ))
            })
        })
        .filter(|r| r.as_ref().map(|s| !s.is_empty()).unwrap_or(true))
        .collect()
}

fn load_value_inner(path: &Path, stack: &mut HashSet<PathBuf>) -> Result<Value> {
    let canonical = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    if !stack.insert(canonical.clone()) {
        return Err(Error::config(format!(
            "config import cycle detected at {}",
            canonical.display()
        )));
    }

    let data = fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read config {}: {e}", path.display())))?;
    let mut value: Value = toml::from_str(&data)
        .map_err(|e| Error::config(format!("TOML parse error in {}: {e}", path.display())))?;

    // extends < imports < the file itself
    let mut out = Value::Table(Default::default());
    if let Some(ext) = value.get("extends").and_then(Value::as_str) {
        out = load_value_inner(&resolve_ref_path(path, ext), stack)?;
    }
    for imp in parse_imports(path, &value)? {
        let loaded = load_value_inner(&resolve_ref_path(path, &imp), stack)?;
        merge_values(&mut out, loaded);
    }
    if let Some(tbl) = value.as_table_mut() {
        tbl.remove("extends");
        tbl.remove("imports");
    }
    merge_values(&mut out, value);

    stack.remove(&canonical);
    Ok(out)
}

pub fn load(path: &Path) -> Result<ConfigDoc> {
    let mut stack = HashSet::<PathBuf>::new();
    let value = load_value_inner(path, &mut stack)?;
    Ok(ConfigDoc {
        path: path.to_path_buf(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_and_imports_merge_in_order() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("base.toml"),
            "[cache]\nenabled = false\ndir = \"base-cache\"\n",
        )
        .expect("write base");
        fs::write(
            tmp.path().join("routes.toml"),
            "[router.routes]\nt1 = \"host:http://x\"\n",
        )
        .expect("write routes");
        fs::write(
            tmp.path().join("main.toml"),
            "extends = \"base.toml\"\nimports = [\"routes.toml\"]\n[cache]\nenabled = true\n",
        )
        .expect("write main");

        let doc = load(&tmp.path().join("main.toml")).expect("load");
        assert_eq!(
            doc.value_path("cache.enabled").and_then(Value::as_bool),
            Some(true)
        );
        assert_eq!(
            doc.value_path("cache.dir").and_then(Value::as_str),
            Some("base-cache")
        );
        assert_eq!(
            doc.value_path("router.routes.t1").and_then(Value::as_str),
            Some("host:http://x")
        );
        assert!(doc.value_path("extends").is_none());
    }

    #[test]
    fn import_cycle_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("a.toml"), "imports = [\"b.toml\"]\n").expect("write a");
        fs::write(tmp.path().join("b.toml"), "imports = [\"a.toml\"]\n").expect("write b");

        let err = load(&tmp.path().join("a.toml")).expect_err("cycle");
        assert!(err.to_string().contains("cycle"));
    }
}
