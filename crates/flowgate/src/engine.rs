//! The execution engine seam.
//!
//! An [`Engine`] hands out a fresh [`ExecutionContext`] per evaluation; contexts are
//! never shared between jobs. [`CommandEngine`] is the local implementation: it runs a
//! configured program (papermill by default) against a notebook inside a private job
//! directory and reads the published output back as JSON.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fingerprint::{Params, strip_control};
use crate::result::WorkflowException;

/// Transient extraction failures; both are retried by the extraction loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    /// Output has not been written yet.
    NotReady(String),
    /// Output exists but is not (yet) a complete JSON mapping.
    Malformed(String),
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::NotReady(m) => write!(f, "output not ready: {m}"),
            ExtractError::Malformed(m) => write!(f, "output malformed: {m}"),
        }
    }
}

pub trait ExecutionContext: Send {
    /// Run the target; exceptions raised by the computation come back as data.
    fn execute(&mut self, params: &Params) -> Vec<WorkflowException>;

    fn extract_output(&mut self) -> std::result::Result<Map<String, Value>, ExtractError>;

    /// Where execution artifacts live, for tracing.
    fn jobdir(&self) -> Option<&Path>;
}

pub trait Engine: Send + Sync {
    fn context(&self, target: &str, notebook: &Path) -> Result<Box<dyn ExecutionContext>>;
}

const MAX_LINE_CHARS: usize = 4096;
const DUMP_TAIL_LINES: usize = 200;

// Strip terminal escapes and control characters from one line of engine output.
fn clean_line(input: &str) -> String {
    let mut out = String::with_capacity(input.len().min(MAX_LINE_CHARS));
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            match chars.next() {
                // CSI: parameters until a final byte in @..~
                Some('[') => {
                    for n in chars.by_ref() {
                        if ('@'..='~').contains(&n) {
                            break;
                        }
                    }
                }
                // OSC: until BEL or ESC \
                Some(']') => {
                    while let Some(n) = chars.next() {
                        if n == '\x07' {
                            break;
                        }
                        if n == '\x1b' && chars.peek() == Some(&'\\') {
                            chars.next();
                            break;
                        }
                    }
                }
                _ => {}
            }
            continue;
        }
        if c == '\t' {
            out.push(' ');
        } else if !c.is_control() {
            out.push(c);
        }
        if out.len() >= MAX_LINE_CHARS {
            out.push_str(" ...[truncated]");
            break;
        }
    }
    out
}

fn forward_lines<R: Read>(reader: R, tx: mpsc::Sender<String>) {
    for line in BufReader::new(reader).lines() {
        let Ok(line) = line else {
            break;
        };
        if tx.send(line).is_err() {
            break;
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommandEngine {
    cfg: EngineConfig,
}

impl CommandEngine {
    pub fn new(cfg: EngineConfig) -> Self {
        Self { cfg }
    }
}

impl Engine for CommandEngine {
    fn context(&self, target: &str, notebook: &Path) -> Result<Box<dyn ExecutionContext>> {
        if !notebook.is_file() {
            return Err(Error::engine(format!(
                "notebook for '{target}' not found at {}",
                notebook.display()
            )));
        }
        let jobdir = tempfile::Builder::new()
            .prefix(&format!("flowgate-{target}-"))
            .tempdir()
            .map_err(|e| Error::engine(format!("failed to create job dir: {e}")))?
            .keep();
        debug!(workflow = target, jobdir = %jobdir.display(), "created execution context");
        Ok(Box::new(CommandContext {
            cfg: self.cfg.clone(),
            notebook: notebook.to_path_buf(),
            jobdir,
        }))
    }
}

struct CommandContext {
    cfg: EngineConfig,
    notebook: PathBuf,
    jobdir: PathBuf,
}

impl CommandContext {
    fn build_command(&self, params_json: &str) -> Command {
        let mut cmd = Command::new(&self.cfg.program);
        for arg in &self.cfg.args {
            cmd.arg(
                arg.replace("{notebook}", &self.notebook.display().to_string())
                    .replace("{jobdir}", &self.jobdir.display().to_string())
                    .replace("{params}", params_json),
            );
        }
        cmd.current_dir(&self.jobdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn run(&self, params: &Params) -> std::result::Result<(), WorkflowException> {
        let params_json = serde_json::to_string(&strip_control(params))
            .map_err(|e| WorkflowException::new("ParameterError", e.to_string()))?;
        fs::write(self.jobdir.join("params.json"), &params_json)
            .map_err(|e| WorkflowException::new("IOError", e.to_string()))?;

        let mut child = self.build_command(&params_json).spawn().map_err(|e| {
            WorkflowException::new(
                "SpawnError",
                format!("failed to start {}: {e}", self.cfg.program),
            )
        })?;

        let (tx, rx) = mpsc::channel::<String>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || forward_lines(out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || forward_lines(err, tx));
        }
        drop(tx);

        let mut tail = VecDeque::with_capacity(DUMP_TAIL_LINES);
        for line in rx {
            let line = clean_line(&line);
            if line.is_empty() {
                continue;
            }
            debug!(notebook = %self.notebook.display(), "{line}");
            if tail.len() == DUMP_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child
            .wait()
            .map_err(|e| WorkflowException::new("SpawnError", format!("wait failed: {e}")))?;
        if status.success() {
            return Ok(());
        }
        Err(WorkflowException::new(
            "ExecutionError",
            format!("{} exited with {status}", self.cfg.program),
        )
        .with_dump(tail.into_iter().collect::<Vec<_>>().join("\n")))
    }
}

impl ExecutionContext for CommandContext {
    fn execute(&mut self, params: &Params) -> Vec<WorkflowException> {
        match self.run(params) {
            Ok(()) => Vec::new(),
            Err(e) => {
                warn!(notebook = %self.notebook.display(), ename = %e.ename, evalue = %e.evalue, "execution raised");
                vec![e]
            }
        }
    }

    fn extract_output(&mut self) -> std::result::Result<Map<String, Value>, ExtractError> {
        let path = self.jobdir.join(&self.cfg.output_file);
        let raw = fs::read_to_string(&path)
            .map_err(|e| ExtractError::NotReady(format!("{}: {e}", path.display())))?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(m)) => Ok(m),
            Ok(other) => Err(ExtractError::Malformed(format!(
                "{} holds {} instead of a mapping",
                path.display(),
                json_kind(&other)
            ))),
            Err(e) => Err(ExtractError::Malformed(format!("{}: {e}", path.display()))),
        }
    }

    fn jobdir(&self) -> Option<&Path> {
        Some(&self.jobdir)
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_line_strips_escapes_and_controls() {
        assert_eq!(
            clean_line("ok \u{1b}[31mred\u{1b}[0m \u{1b}]0;title\u{7} done"),
            "ok red  done"
        );
        assert_eq!(clean_line("a\tb\rc\u{0}"), "a bc");
        assert!(clean_line(&"x".repeat(MAX_LINE_CHARS * 2)).ends_with("...[truncated]"));
    }

    fn shell_engine(script: &str) -> CommandEngine {
        CommandEngine::new(EngineConfig {
            notebook_dir: None,
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            output_file: "output.json".into(),
        })
    }

    #[cfg(unix)]
    #[test]
    fn command_context_runs_and_extracts() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nb = tmp.path().join("t1.ipynb");
        fs::write(&nb, "{}").expect("notebook");

        let engine = shell_engine("cat params.json > seen.json; echo '{\"y\": 2}' > output.json");
        let mut ctx = engine.context("t1", &nb).expect("context");
        let mut params = Params::new();
        params.insert("x".into(), json!(1));
        params.insert("_async_request".into(), json!(true));

        assert!(ctx.execute(&params).is_empty());
        let out = ctx.extract_output().expect("output");
        assert_eq!(out.get("y"), Some(&json!(2)));

        let jobdir = ctx.jobdir().expect("jobdir").to_path_buf();
        let seen = fs::read_to_string(jobdir.join("seen.json")).expect("seen");
        assert_eq!(seen.trim(), r#"{"x":1}"#);
        let _ = fs::remove_dir_all(jobdir);
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_becomes_exception_with_dump() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nb = tmp.path().join("t1.ipynb");
        fs::write(&nb, "{}").expect("notebook");

        let engine = shell_engine("echo 'Traceback: boom' >&2; exit 3");
        let mut ctx = engine.context("t1", &nb).expect("context");
        let exceptions = ctx.execute(&Params::new());
        assert_eq!(exceptions.len(), 1);
        assert_eq!(exceptions[0].ename, "ExecutionError");
        assert!(exceptions[0].edump.contains("Traceback: boom"));
        assert!(matches!(
            ctx.extract_output(),
            Err(ExtractError::NotReady(_))
        ));
        if let Some(dir) = ctx.jobdir() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn missing_notebook_is_engine_error() {
        let err = shell_engine("true")
            .context("t1", Path::new("/definitely/not/here.ipynb"))
            .err()
            .expect("missing notebook");
        assert_eq!(err.kind(), crate::error::ErrorKind::Engine);
    }
}
