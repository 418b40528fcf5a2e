use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use super::ConfigDoc;
use crate::error::{Error, Result};

pub const ROUTES_ENV: &str = "WORKFLOW_ROUTES";
pub const STAGING_ENV: &str = "STAGING_WORKFLOWS";

fn default_api_path() -> String {
    "/api/v1.0/get".into()
}

fn default_templates() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "odahub".to_string(),
        "https://oda-workflows-{target}{suffix}.odahub.io".to_string(),
    )])
}

fn default_cache_dir() -> String {
    "data/default-cache".into()
}

fn default_remote_attempts() -> u32 {
    30
}

fn default_remote_backoff_ms() -> u64 {
    5_000
}

fn default_remote_timeout_secs() -> u64 {
    60
}

fn default_username() -> String {
    "cdci".into()
}

fn default_extraction_attempts() -> u32 {
    10
}

fn default_extraction_backoff_ms() -> u64 {
    1_000
}

fn default_output_file() -> String {
    "output.json".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// target -> "backend:destination"
    pub routes: BTreeMap<String, String>,
    pub staging: BTreeSet<String>,
    /// Public URL templates keyed by backend name. `{target}` and `{suffix}` are substituted.
    #[serde(default = "default_templates")]
    pub templates: BTreeMap<String, String>,
    #[serde(default = "default_api_path")]
    pub api_path: String,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            routes: BTreeMap::new(),
            staging: BTreeSet::new(),
            templates: default_templates(),
            api_path: default_api_path(),
        }
    }
}

impl RouterConfig {
    /// Overlay `WORKFLOW_ROUTES` and `STAGING_WORKFLOWS` onto the file config.
    ///
    /// `WORKFLOW_ROUTES` is a comma separated list of `target=backend:destination`;
    /// pieces that do not split into exactly two halves on `=` are skipped.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ROUTES_ENV) {
            for entry in raw.split(',') {
                let parts = entry.split('=').collect::<Vec<_>>();
                if parts.len() != 2 {
                    continue;
                }
                let (target, route) = (parts[0].trim(), parts[1].trim());
                if target.is_empty() {
                    continue;
                }
                self.routes.insert(target.to_string(), route.to_string());
            }
        }
        if let Some(raw) = lookup(STAGING_ENV) {
            self.staging.extend(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToOwned::to_owned),
            );
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    #[serde(default = "default_cache_dir")]
    pub dir: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_cache_dir(),
        }
    }
}

#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_attempts")]
    pub attempts: u32,
    #[serde(default = "default_remote_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_username")]
    pub username: String,
    pub password: Option<String>,
    pub password_env: Option<String>,
    pub password_file: Option<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            attempts: default_remote_attempts(),
            backoff_ms: default_remote_backoff_ms(),
            timeout_secs: default_remote_timeout_secs(),
            username: default_username(),
            password: None,
            password_env: None,
            password_file: None,
        }
    }
}

fn non_empty(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
}

impl RemoteConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    // literal, then env var, then file
    pub fn credential(&self) -> Result<Option<Credential>> {
        let from_env = non_empty(self.password_env.as_deref())
            .and_then(|k| std::env::var(k).ok())
            .and_then(|v| non_empty(Some(&v)));
        let password = match non_empty(self.password.as_deref()).or(from_env) {
            Some(p) => Some(p),
            None => match non_empty(self.password_file.as_deref()) {
                Some(path) => {
                    let raw = fs::read_to_string(&path).map_err(|e| {
                        Error::config(format!("failed to read remote password file {path}: {e}"))
                    })?;
                    non_empty(Some(&raw))
                }
                None => None,
            },
        };
        Ok(password.map(|password| Credential {
            username: self.username.clone(),
            password,
        }))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    #[serde(default = "default_extraction_attempts")]
    pub attempts: u32,
    #[serde(default = "default_extraction_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            attempts: default_extraction_attempts(),
            backoff_ms: default_extraction_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PoolConfig {
    /// 0 = one worker per CPU.
    pub max_parallel: usize,
}

impl PoolConfig {
    pub fn workers(&self) -> usize {
        if self.max_parallel == 0 {
            num_cpus::get().max(1)
        } else {
            self.max_parallel
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct JobsConfig {
    /// Started jobs older than this are reclaimable by the next identical request. 0 disables.
    pub stale_after_secs: u64,
}

impl JobsConfig {
    pub fn stale_after(&self) -> Option<Duration> {
        (self.stale_after_secs > 0).then(|| Duration::from_secs(self.stale_after_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub notebook_dir: Option<String>,
    /// Program used to run one notebook, e.g. `papermill`.
    pub program: String,
    /// Argument template; `{notebook}`, `{jobdir}` and `{params}` are substituted.
    pub args: Vec<String>,
    #[serde(default = "default_output_file")]
    pub output_file: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            notebook_dir: None,
            program: "papermill".into(),
            args: vec![
                "{notebook}".into(),
                "{jobdir}/output.ipynb".into(),
                "-y".into(),
                "{params}".into(),
            ],
            output_file: default_output_file(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub router: RouterConfig,
    pub cache: CacheConfig,
    pub remote: RemoteConfig,
    pub extraction: ExtractionConfig,
    pub pool: PoolConfig,
    pub jobs: JobsConfig,
    pub engine: EngineConfig,
}

impl OrchestratorConfig {
    pub fn from_doc(doc: &ConfigDoc) -> Result<Self> {
        let mut cache: CacheConfig = doc.deserialize_path("cache")?.unwrap_or_default();
        cache.dir = doc.resolve_path(&cache.dir).display().to_string();

        let mut engine: EngineConfig = doc.deserialize_path("engine")?.unwrap_or_default();
        engine.notebook_dir = engine
            .notebook_dir
            .as_deref()
            .map(|d| doc.resolve_path(d).display().to_string());

        Ok(Self {
            router: doc.deserialize_path("router")?.unwrap_or_default(),
            cache,
            remote: doc.deserialize_path("remote")?.unwrap_or_default(),
            extraction: doc.deserialize_path("extraction")?.unwrap_or_default(),
            pool: doc.deserialize_path("pool")?.unwrap_or_default(),
            jobs: doc.deserialize_path("jobs")?.unwrap_or_default(),
            engine,
        })
    }

    pub fn cache_dir(&self) -> PathBuf {
        PathBuf::from(&self.cache.dir)
    }
}
