//! Resolves a logical backend hint plus target name into a concrete destination.
//!
//! Resolution order:
//! 1. a `routes` entry for the target replaces the hint with its `backend:destination`
//!    pair, the destination being prepended to the positional args;
//! 2. otherwise a target listed in `staging` gets `-staging` appended to the hint;
//! 3. otherwise the hint and args pass through.
//!
//! The resulting backend name is then interpreted: `localfile` and `host` take their
//! destination from the first positional arg, any other name must match a URL template
//! (optionally with a `-staging` suffix). Anything else is a configuration error.

use std::fmt;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::config::RouterConfig;
use crate::error::{Error, Result};

const STAGING_SUFFIX: &str = "-staging";

static TARGET_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").expect("target name pattern")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendKind {
    /// Run through the local engine against a directory of notebooks.
    LocalFile,
    /// Remote service at a caller-supplied base URL.
    Host,
    /// Remote service at a URL built from a named template.
    Public { name: String, staging: bool },
}

impl BackendKind {
    pub fn is_remote(&self) -> bool {
        !matches!(self, BackendKind::LocalFile)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::LocalFile => f.write_str("localfile"),
            BackendKind::Host => f.write_str("host"),
            BackendKind::Public { name, staging } => {
                write!(f, "{name}{}", if *staging { STAGING_SUFFIX } else { "" })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub backend: BackendKind,
    /// Notebook directory for `localfile`, base URL otherwise.
    pub destination: String,
    pub args: Vec<String>,
}

impl RouteDecision {
    pub fn endpoint_url(&self, api_path: &str, target: &str) -> Option<String> {
        if !self.backend.is_remote() {
            return None;
        }
        Some(format!(
            "{}/{}/{}",
            self.destination.trim_end_matches('/'),
            api_path.trim_matches('/'),
            target
        ))
    }

    pub fn notebook_path(&self, target: &str) -> Option<PathBuf> {
        match self.backend {
            BackendKind::LocalFile => {
                Some(PathBuf::from(&self.destination).join(format!("{target}.ipynb")))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Router {
    cfg: RouterConfig,
}

impl Router {
    pub fn new(cfg: RouterConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.cfg
    }

    pub fn resolve(&self, backend: &str, target: &str, args: &[String]) -> Result<RouteDecision> {
        let target = target.trim();
        if !TARGET_NAME.is_match(target) {
            return Err(Error::config(format!("invalid target name '{target}'")));
        }

        let (backend, mut args) = if let Some(route) = self.cfg.routes.get(target) {
            let (kind, destination) = route.split_once(':').ok_or_else(|| {
                Error::config(format!(
                    "route for '{target}' must look like backend:destination, got '{route}'"
                ))
            })?;
            let mut routed = Vec::with_capacity(args.len() + 1);
            routed.push(destination.trim().to_string());
            routed.extend_from_slice(args);
            (kind.trim().to_string(), routed)
        } else if self.cfg.staging.contains(target) {
            (format!("{}{STAGING_SUFFIX}", backend.trim()), args.to_vec())
        } else {
            (backend.trim().to_string(), args.to_vec())
        };

        let decision = match backend.as_str() {
            "localfile" | "host" => {
                if args.is_empty() || args[0].trim().is_empty() {
                    return Err(Error::config(format!(
                        "backend '{backend}' for '{target}' needs a destination"
                    )));
                }
                let destination = args.remove(0).trim().to_string();
                RouteDecision {
                    backend: if backend == "host" {
                        BackendKind::Host
                    } else {
                        BackendKind::LocalFile
                    },
                    destination,
                    args,
                }
            }
            other => {
                let (name, staging) = match other.strip_suffix(STAGING_SUFFIX) {
                    Some(base) => (base, true),
                    None => (other, false),
                };
                let Some(template) = self.cfg.templates.get(name) else {
                    return Err(Error::config(format!(
                        "unknown backend kind '{other}'; expected localfile, host or one of: {}",
                        self.cfg
                            .templates
                            .keys()
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(", ")
                    )));
                };
                let destination = template
                    .replace("{target}", target)
                    .replace("{suffix}", if staging { STAGING_SUFFIX } else { "" });
                RouteDecision {
                    backend: BackendKind::Public {
                        name: name.to_string(),
                        staging,
                    },
                    destination,
                    args,
                }
            }
        };
        debug!(
            workflow = target,
            backend = %decision.backend,
            destination = %decision.destination,
            "resolved route"
        );
        Ok(decision)
    }
}
