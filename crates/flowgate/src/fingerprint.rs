//! Request fingerprints used as both the dedup key for async jobs and the
//! result cache key.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha224};

use crate::error::{Error, Result};

/// Request parameters, keyed by name. `BTreeMap` keeps them in key order.
pub type Params = BTreeMap<String, Value>;

pub const ASYNC_REQUEST_PARAM: &str = "_async_request";
pub const NTRIES_PARAM: &str = "_ntries";

/// Parameters that steer how a request is served but never what it computes.
pub const CONTROL_PARAMS: &[&str] = &[ASYNC_REQUEST_PARAM, NTRIES_PARAM];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accepts a previously rendered fingerprint (e.g. from a job listing).
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.len() != 56 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::config(format!("'{raw}' is not a request fingerprint")));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns a copy of `params` without control parameters.
pub fn strip_control(params: &Params) -> Params {
    params
        .iter()
        .filter(|(k, _)| !CONTROL_PARAMS.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

pub fn fingerprint(target: &str, params: &Params) -> Result<Fingerprint> {
    let payload = serde_json::json!({
        "target": target,
        "params": strip_control(params),
    });
    let encoded = serde_json::to_vec(&payload)
        .map_err(|e| Error::decode(format!("fingerprint encode failed: {e}")))?;
    let mut hasher = Sha224::new();
    hasher.update(&encoded);
    Ok(Fingerprint(hex::encode(hasher.finalize())))
}
