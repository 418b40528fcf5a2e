//! Client side of the remote evaluation protocol.
//!
//! `GET <base>/<api>/<target>?<params>` answers either with a finished result
//! (`{output, exceptions}`) or, for async requests, with
//! `{output: {workflow_status, data?}}`. Anything not yet `done` is polled again
//! under the same attempt budget as transport and decode failures. A budget that
//! runs out while the remote is still pending returns that pending body.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use crate::config::Credential;
use crate::error::{Error, Result};
use crate::fingerprint::Params;
use crate::result::{EvalResult, WorkflowException};
use crate::retry::{CancelToken, RetryPolicy, Sleeper, ThreadSleeper};

const RAW_BODY_LOG_CHARS: usize = 512;

/// Receives errors that exhausted the retry budget.
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, url: &str, err: &Error);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogReporter;

impl ErrorReporter for LogReporter {
    fn capture(&self, url: &str, err: &Error) {
        error!(url, kind = err.kind().as_str(), %err, "remote evaluation failed");
    }
}

enum Poll {
    Done(Value),
    Pending(String, Value),
}

#[derive(Clone)]
pub struct RemoteClient {
    client: reqwest::blocking::Client,
    sleeper: Arc<dyn Sleeper>,
    reporter: Arc<dyn ErrorReporter>,
}

impl RemoteClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            sleeper: Arc::new(ThreadSleeper),
            reporter: Arc::new(LogReporter),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn evaluate_remote(
        &self,
        url: &str,
        params: &Params,
        credential: Option<&Credential>,
        policy: RetryPolicy,
        cancel: &CancelToken,
    ) -> Result<EvalResult> {
        let url = request_url(url, params)?;
        let mut left = policy.attempts;
        loop {
            cancel.check()?;
            debug!(url = %url, left, "polling remote");
            left = left.saturating_sub(1);
            match self.poll_once(&url, credential) {
                Ok(Poll::Done(body)) => return normalize_body(body),
                Ok(Poll::Pending(status, body)) => {
                    info!(url = %url, status, left, "waiting for remote async workflow");
                    // Pending is a state, not a failure: the last answer is the result.
                    if left == 0 {
                        return normalize_body(body);
                    }
                }
                Err(e) => {
                    warn!(url = %url, left, %e, "problem from remote service");
                    if left == 0 {
                        self.reporter.capture(url.as_str(), &e);
                        return Err(e);
                    }
                }
            }
            self.sleeper.sleep(policy.backoff, cancel)?;
        }
    }

    fn poll_once(&self, url: &Url, credential: Option<&Credential>) -> Result<Poll> {
        let mut req = self.client.get(url.clone());
        if let Some(c) = credential {
            req = req.basic_auth(&c.username, Some(&c.password));
        }
        let res = req
            .send()
            .map_err(|e| Error::transport(format!("request to {url} failed: {e}")))?;
        let status = res.status();
        let text = res
            .text()
            .map_err(|e| Error::transport(format!("reading body from {url} failed: {e}")))?;
        let body: Value = serde_json::from_str(&text).map_err(|e| {
            let raw = text.chars().take(RAW_BODY_LOG_CHARS).collect::<String>();
            warn!(url = %url, %status, raw, "failed to decode remote body");
            Error::decode(format!("undecodable body from {url} ({status}): {e}"))
        })?;

        let workflow_status = body
            .get("output")
            .and_then(|o| o.get("workflow_status"))
            .map(|s| s.as_str().map(ToOwned::to_owned).unwrap_or_else(|| s.to_string()));
        match workflow_status {
            Some(s) if s != "done" => Ok(Poll::Pending(s, body)),
            _ => Ok(Poll::Done(body)),
        }
    }
}

fn query_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn request_url(base: &str, params: &Params) -> Result<Url> {
    Url::parse_with_params(base, params.iter().map(|(k, v)| (k.as_str(), query_value(v))))
        .map_err(|e| Error::config(format!("invalid remote URL '{base}': {e}")))
}

fn parse_exceptions(raw: Option<&Value>) -> Vec<WorkflowException> {
    let Some(Value::Array(items)) = raw else {
        return Vec::new();
    };
    items
        .iter()
        .map(|item| match item {
            Value::Object(_) => serde_json::from_value::<WorkflowException>(item.clone())
                .unwrap_or_else(|_| WorkflowException::new("RemoteException", item.to_string())),
            // plain services report `repr(e)` strings
            Value::String(s) => WorkflowException::new("RemoteException", s.clone()),
            other => WorkflowException::new("RemoteException", other.to_string()),
        })
        .collect()
}

fn from_result_body(mut body: Map<String, Value>) -> EvalResult {
    let output = body.remove("output").unwrap_or(Value::Null);
    EvalResult {
        output,
        exceptions: parse_exceptions(body.get("exceptions")),
        jobdir: body
            .get("jobdir")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
    }
}

/// Bring any accepted body into `{output, exceptions}` shape.
pub fn normalize_body(body: Value) -> Result<EvalResult> {
    let Value::Object(mut map) = body else {
        return Ok(EvalResult {
            output: body,
            exceptions: Vec::new(),
            jobdir: None,
        });
    };
    if !map.contains_key("output") {
        return Ok(EvalResult {
            output: Value::Object(map),
            exceptions: Vec::new(),
            jobdir: None,
        });
    }

    // A finished async job carries the real result under output.data.
    let finished_async = map
        .get("output")
        .and_then(Value::as_object)
        .filter(|o| o.get("workflow_status").and_then(Value::as_str) == Some("done"))
        .and_then(|o| o.get("data"))
        .and_then(Value::as_object)
        .cloned();
    if let Some(data) = finished_async {
        if data.contains_key("output") {
            return Ok(from_result_body(data));
        }
        map.insert("output".into(), Value::Object(data));
    }
    Ok(from_result_body(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn body_without_output_is_wrapped() {
        let r = normalize_body(json!({"spectrum": [1, 2]})).expect("normalize");
        assert_eq!(r.output, json!({"spectrum": [1, 2]}));
        assert!(r.exceptions.is_empty());
    }

    #[test]
    fn sync_body_keeps_exceptions() {
        let r = normalize_body(json!({
            "output": {},
            "exceptions": ["ValueError('bad scwid')", {"ename": "E", "evalue": "v", "edump": "d"}],
            "jobdir": "/tmp/tmpx"
        }))
        .expect("normalize");
        assert_eq!(r.output, json!({}));
        assert_eq!(r.exceptions.len(), 2);
        assert_eq!(r.exceptions[0].evalue, "ValueError('bad scwid')");
        assert_eq!(r.exceptions[1].edump, "d");
        assert_eq!(r.jobdir.as_deref(), Some("/tmp/tmpx"));
    }

    #[test]
    fn finished_async_body_is_unwrapped() {
        let r = normalize_body(json!({
            "output": {
                "workflow_status": "done",
                "data": {"output": {"y": 2}, "exceptions": []}
            }
        }))
        .expect("normalize");
        assert_eq!(r.output, json!({"y": 2}));
        assert!(r.is_success());
    }

    #[test]
    fn query_carries_scalar_params() {
        let params = Params::from([
            ("x".to_string(), json!(1)),
            ("name".to_string(), json!("crab nebula")),
            ("_async_request".to_string(), json!(true)),
        ]);
        let url = request_url("http://x/api/v1.0/get/t1", &params).expect("url");
        assert_eq!(
            url.as_str(),
            "http://x/api/v1.0/get/t1?_async_request=true&name=crab+nebula&x=1"
        );
        assert!(request_url("not a url", &params).is_err());
    }
}
