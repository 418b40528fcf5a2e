use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Output placeholder for async jobs whose execution raised exceptions.
pub const INCOMPLETE_OUTPUT: &str = "incomplete";

/// One exception captured by the engine while running a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowException {
    pub ename: String,
    pub evalue: String,
    #[serde(default)]
    pub edump: String,
}

impl WorkflowException {
    pub fn new(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Self {
            ename: ename.into(),
            evalue: evalue.into(),
            edump: String::new(),
        }
    }

    pub fn with_dump(mut self, edump: impl Into<String>) -> Self {
        self.edump = edump.into();
        self
    }
}

/// Terminal result of one evaluation: `{output, exceptions, jobdir?}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub output: Value,
    #[serde(default)]
    pub exceptions: Vec<WorkflowException>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jobdir: Option<String>,
}

/// How an evaluation went, as seen by the caller. Fatal failures are `Err(Error)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome<'a> {
    Success(&'a Value),
    PartialFailure(&'a Value, &'a [WorkflowException]),
}

impl EvalResult {
    pub fn new(output: Map<String, Value>, exceptions: Vec<WorkflowException>) -> Self {
        Self {
            output: Value::Object(output),
            exceptions,
            jobdir: None,
        }
    }

    pub fn empty() -> Self {
        Self::new(Map::new(), Vec::new())
    }

    pub fn with_jobdir(mut self, jobdir: Option<String>) -> Self {
        self.jobdir = jobdir;
        self
    }

    pub fn outcome(&self) -> Outcome<'_> {
        if self.exceptions.is_empty() {
            Outcome::Success(&self.output)
        } else {
            Outcome::PartialFailure(&self.output, &self.exceptions)
        }
    }

    pub fn is_success(&self) -> bool {
        self.exceptions.is_empty()
    }

    /// True when the output carries nothing worth keeping.
    pub fn output_is_empty(&self) -> bool {
        match &self.output {
            Value::Null => true,
            Value::Object(m) => m.is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::String(s) => s.is_empty(),
            _ => false,
        }
    }

    /// A remote async job that had not finished when polling stopped.
    pub fn is_pending(&self) -> bool {
        self.output
            .get("workflow_status")
            .is_some_and(|s| s.as_str() != Some("done"))
    }

    pub fn output_map(&self) -> Option<&Map<String, Value>> {
        self.output.as_object()
    }

    /// Decodes the `<name>_content` output entry, which notebooks publish base64 encoded twice.
    pub fn output_file(&self, name: &str) -> Result<Vec<u8>> {
        let key = format!("{name}_content");
        let output = self
            .output_map()
            .ok_or_else(|| Error::decode("output is not a mapping"))?;
        let Some(raw) = output.get(&key) else {
            let available = output.keys().cloned().collect::<Vec<_>>().join(", ");
            return Err(Error::decode(format!(
                "output has no '{key}'; available: {available}"
            )));
        };
        let raw = raw
            .as_str()
            .ok_or_else(|| Error::decode(format!("output '{key}' is not a string")))?;
        let once = STANDARD
            .decode(raw.trim())
            .map_err(|e| Error::decode(format!("output '{key}' is not base64: {e}")))?;
        STANDARD
            .decode(once.trim_ascii())
            .map_err(|e| Error::decode(format!("output '{key}' inner payload is not base64: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outcome_follows_exceptions_not_output() {
        let ok = EvalResult::new(Map::new(), Vec::new());
        assert!(matches!(ok.outcome(), Outcome::Success(_)));

        let mut out = Map::new();
        out.insert("y".into(), json!(2));
        let failed = EvalResult::new(out, vec![WorkflowException::new("ValueError", "bad")]);
        match failed.outcome() {
            Outcome::PartialFailure(output, exceptions) => {
                assert_eq!(output["y"], json!(2));
                assert_eq!(exceptions.len(), 1);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn wire_shape_matches_service_body() {
        let mut out = Map::new();
        out.insert("y".into(), json!(2));
        let r = EvalResult::new(out, Vec::new());
        assert_eq!(
            serde_json::to_value(&r).expect("encode"),
            json!({"output": {"y": 2}, "exceptions": []})
        );

        let parsed: EvalResult = serde_json::from_value(json!({
            "output": "incomplete",
            "exceptions": [{"ename": "E", "evalue": "v", "edump": "trace"}],
            "jobdir": "/tmp/tmpabc"
        }))
        .expect("decode");
        assert_eq!(parsed.output, json!(INCOMPLETE_OUTPUT));
        assert_eq!(parsed.exceptions[0].edump, "trace");
        assert_eq!(parsed.jobdir.as_deref(), Some("/tmp/tmpabc"));
    }

    #[test]
    fn output_file_decodes_twice() {
        let inner = STANDARD.encode(b"\x89PNG");
        let outer = STANDARD.encode(inner.as_bytes());
        let mut out = Map::new();
        out.insert("spectrum_content".into(), json!(outer));
        let r = EvalResult::new(out, Vec::new());
        assert_eq!(r.output_file("spectrum").expect("decode"), b"\x89PNG".to_vec());

        let err = r.output_file("lightcurve").expect_err("missing");
        assert!(err.to_string().contains("spectrum_content"));
    }

    #[test]
    fn emptiness() {
        assert!(EvalResult::empty().output_is_empty());
        let mut r = EvalResult::empty();
        r.output = json!(INCOMPLETE_OUTPUT);
        assert!(!r.output_is_empty());
    }
}
