//! The evaluation entry point and the async submission surface built on it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::cache::ResultCache;
use crate::config::OrchestratorConfig;
use crate::engine::{CommandEngine, Engine};
use crate::error::{Error, ErrorKind, Result};
use crate::evaluator::SyncEvaluator;
use crate::fingerprint::{
    ASYNC_REQUEST_PARAM, Fingerprint, NTRIES_PARAM, Params, fingerprint, strip_control,
};
use crate::jobs::{Job, JobRegistry, TryStart};
use crate::remote::RemoteClient;
use crate::result::{EvalResult, INCOMPLETE_OUTPUT};
use crate::retry::{CancelToken, RetryPolicy, Sleeper, ThreadSleeper};
use crate::router::{BackendKind, RouteDecision, Router};
use crate::runner::{AsyncJobRunner, JobSink, TracingSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    Submitted,
    Started,
    Done,
}

/// Answer to an async submission, shaped like the job-submission HTTP body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub workflow_status: WorkflowStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<EvalResult>,
    pub comment: String,
    #[serde(skip)]
    pub key: Option<Fingerprint>,
}

impl Submission {
    fn submitted(key: Fingerprint) -> Self {
        Self {
            workflow_status: WorkflowStatus::Submitted,
            data: None,
            comment: "task created".into(),
            key: Some(key),
        }
    }

    fn started(key: Fingerprint) -> Self {
        Self {
            workflow_status: WorkflowStatus::Started,
            data: None,
            comment: "task created before".into(),
            key: Some(key),
        }
    }

    fn done(key: Fingerprint, result: EvalResult) -> Self {
        Self {
            workflow_status: WorkflowStatus::Done,
            data: Some(result),
            comment: String::new(),
            key: Some(key),
        }
    }

    pub fn http_status(&self) -> u16 {
        match self.workflow_status {
            WorkflowStatus::Done => 200,
            WorkflowStatus::Submitted | WorkflowStatus::Started => 201,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub stored_jobs: usize,
    pub background_jobs: usize,
    pub queued_jobs: usize,
    pub workers: usize,
    pub version: &'static str,
}

fn flag_is_set(v: Option<&Value>) -> bool {
    match v {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !matches!(
            s.trim().to_ascii_lowercase().as_str(),
            "" | "0" | "no" | "false" | "off"
        ),
        Some(_) => true,
    }
}

fn parse_ntries(v: Option<&Value>) -> Result<Option<u32>> {
    let Some(v) = v else {
        return Ok(None);
    };
    let parsed = match v {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u32>().ok(),
        _ => None,
    };
    parsed.map(Some).ok_or_else(|| {
        Error::config(format!(
            "{NTRIES_PARAM} must be a non-negative integer, got {v}"
        ))
    })
}

pub struct OrchestratorBuilder {
    cfg: OrchestratorConfig,
    engine: Option<Arc<dyn Engine>>,
    registry: Option<Arc<JobRegistry>>,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn JobSink>,
}

impl OrchestratorBuilder {
    pub fn engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn registry(mut self, registry: Arc<JobRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn JobSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let cfg = self.cfg;
        let engine: Arc<dyn Engine> = match self.engine {
            Some(engine) => engine,
            None => Arc::new(CommandEngine::new(cfg.engine.clone())),
        };
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(JobRegistry::with_stale_after(cfg.jobs.stale_after())));
        let extraction = RetryPolicy::extraction(&cfg.extraction);

        let runner = AsyncJobRunner::with_parts(
            Arc::clone(&registry),
            Arc::clone(&engine),
            extraction,
            cfg.pool.workers(),
            Arc::clone(&self.sleeper),
            self.sink,
        )?;
        let evaluator =
            SyncEvaluator::new(engine, extraction).with_sleeper(Arc::clone(&self.sleeper));
        let remote =
            RemoteClient::new(cfg.remote.timeout())?.with_sleeper(Arc::clone(&self.sleeper));
        info!(
            workers = runner.pool().size(),
            cache = cfg.cache.enabled,
            routes = cfg.router.routes.len(),
            "orchestrator ready"
        );

        Ok(Orchestrator {
            router: Router::new(cfg.router.clone()),
            cache: ResultCache::from_config(&cfg.cache),
            registry,
            runner,
            evaluator,
            remote,
            sleeper: self.sleeper,
            started_at: Utc::now(),
            started: Instant::now(),
            cfg,
        })
    }
}

pub struct Orchestrator {
    cfg: OrchestratorConfig,
    router: Router,
    cache: ResultCache,
    registry: Arc<JobRegistry>,
    runner: AsyncJobRunner,
    evaluator: SyncEvaluator,
    remote: RemoteClient,
    sleeper: Arc<dyn Sleeper>,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl Orchestrator {
    pub fn builder(cfg: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            cfg,
            engine: None,
            registry: None,
            sleeper: Arc::new(ThreadSleeper),
            sink: Arc::new(TracingSink),
        }
    }

    pub fn new(cfg: OrchestratorConfig) -> Result<Self> {
        Self::builder(cfg).build()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.cfg
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Route resolution, with `engine.notebook_dir` standing in for a missing
    /// `localfile` destination.
    pub fn resolve(&self, hint: &str, target: &str, args: &[String]) -> Result<RouteDecision> {
        if hint.trim() == "localfile"
            && args.is_empty()
            && let Some(dir) = &self.cfg.engine.notebook_dir
        {
            return self.router.resolve(hint, target, std::slice::from_ref(dir));
        }
        self.router.resolve(hint, target, args)
    }

    pub fn evaluate(
        &self,
        hint: &str,
        target: &str,
        args: &[String],
        params: &Params,
    ) -> Result<EvalResult> {
        self.evaluate_with(hint, target, args, params, &CancelToken::new())
    }

    /// The blocking entry point: cache, route, run, cache again.
    pub fn evaluate_with(
        &self,
        hint: &str,
        target: &str,
        args: &[String],
        params: &Params,
        cancel: &CancelToken,
    ) -> Result<EvalResult> {
        let async_request = flag_is_set(params.get(ASYNC_REQUEST_PARAM));
        let ntries = parse_ntries(params.get(NTRIES_PARAM))?;
        let key = fingerprint(target, params)?;

        if let Some(hit) = self.cache.get(&key)? {
            info!(workflow = target, key = %key, "served from cache");
            return Ok(hit);
        }

        let route = self.resolve(hint, target, args)?;
        let clean = strip_control(params);
        let result = match &route.backend {
            BackendKind::LocalFile => {
                let notebook = notebook_for(&route, target)?;
                if async_request {
                    self.await_local(&key, target, notebook, clean, ntries, cancel)?
                } else {
                    self.evaluator.evaluate(target, &notebook, &clean, cancel)?
                }
            }
            BackendKind::Host | BackendKind::Public { .. } => {
                let url = route
                    .endpoint_url(&self.cfg.router.api_path, target)
                    .ok_or_else(|| Error::config(format!("no endpoint for '{target}'")))?;
                let mut forwarded = clean;
                if async_request {
                    forwarded.insert(ASYNC_REQUEST_PARAM.to_string(), Value::Bool(true));
                }
                let credential = self.cfg.remote.credential()?;
                self.remote.evaluate_remote(
                    &url,
                    &forwarded,
                    credential.as_ref(),
                    RetryPolicy::remote(&self.cfg.remote, ntries),
                    cancel,
                )?
            }
        };

        if result.is_success() && !result.is_pending() {
            self.cache.put(&key, &result)?;
        }
        info!(
            workflow = target,
            backend = %route.backend,
            exceptions = result.exceptions.len(),
            "evaluation finished"
        );
        Ok(result)
    }

    /// Submit to the local job registry and poll it until the job is done.
    fn await_local(
        &self,
        key: &Fingerprint,
        target: &str,
        notebook: PathBuf,
        params: Params,
        ntries: Option<u32>,
        cancel: &CancelToken,
    ) -> Result<EvalResult> {
        let policy = RetryPolicy::remote(&self.cfg.remote, ntries);
        for attempt in 1..=policy.attempts {
            cancel.check()?;
            match self.start_or_observe(key, target, notebook.clone(), params.clone())? {
                Submission {
                    data: Some(mut result),
                    ..
                } => {
                    // A job that raised is stored as incomplete; callers get `{}`.
                    if result.output.as_str() == Some(INCOMPLETE_OUTPUT) {
                        result.output = Value::Object(Map::new());
                    }
                    return Ok(result);
                }
                s => info!(
                    workflow = target,
                    key = %key,
                    attempt,
                    status = ?s.workflow_status,
                    "waiting for job"
                ),
            }
            if attempt < policy.attempts {
                self.sleeper.sleep(policy.backoff, cancel)?;
            }
        }
        Err(Error::new(
            ErrorKind::Timeout,
            format!("job {key} for '{target}' not done after {} polls", policy.attempts),
        ))
    }

    fn start_or_observe(
        &self,
        key: &Fingerprint,
        target: &str,
        notebook: PathBuf,
        params: Params,
    ) -> Result<Submission> {
        match self.registry.try_start(key, target) {
            TryStart::Created(ticket) => {
                self.runner.launch(ticket, target, notebook, params)?;
                Ok(Submission::submitted(key.clone()))
            }
            TryStart::AlreadyStarted => Ok(Submission::started(key.clone())),
            TryStart::AlreadyDone(result) => Ok(Submission::done(key.clone(), result)),
        }
    }

    /// Async submission: creates the job on first sight, otherwise reports its state.
    pub fn submit(
        &self,
        hint: &str,
        target: &str,
        args: &[String],
        params: &Params,
    ) -> Result<Submission> {
        let route = self.resolve(hint, target, args)?;
        let notebook = notebook_for(&route, target)?;
        let key = fingerprint(target, params)?;
        if let Some(hit) = self.cache.get(&key)? {
            info!(workflow = target, key = %key, "submission served from cache");
            return Ok(Submission::done(key, hit));
        }
        let submission = self.start_or_observe(&key, target, notebook, strip_control(params))?;
        info!(
            workflow = target,
            key = %key,
            status = ?submission.workflow_status,
            "async submission"
        );
        Ok(submission)
    }

    pub fn job(&self, key: &Fingerprint) -> Option<Job> {
        self.registry.get(key)
    }

    pub fn list_jobs(&self) -> Vec<(Fingerprint, Job)> {
        self.registry.list_all()
    }

    pub fn clear_jobs(&self) -> Vec<(Fingerprint, Job)> {
        let previous = self.registry.clear_all();
        let running = previous.iter().filter(|(_, j)| !j.is_done()).count();
        if running > 0 {
            warn!(running, "cleared jobs that are still running; their results will be dropped");
        }
        previous
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            started_at: self.started_at,
            uptime_secs: self.started.elapsed().as_secs(),
            stored_jobs: self.registry.len(),
            background_jobs: self.registry.started_count(),
            queued_jobs: self.runner.pool().queued(),
            workers: self.runner.pool().size(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn shutdown(&self) {
        self.runner.shutdown();
    }
}

fn notebook_for(route: &RouteDecision, target: &str) -> Result<PathBuf> {
    route.notebook_path(target).ok_or_else(|| {
        Error::config(format!(
            "'{target}' routes to {} which cannot run local jobs",
            route.backend
        ))
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::evaluator::testing::ScriptedEngine;
    use crate::result::WorkflowException;
    use crate::retry::testing::CountingSleeper;

    fn local_cfg(cache_dir: Option<&std::path::Path>) -> OrchestratorConfig {
        let mut cfg = OrchestratorConfig::default();
        cfg.engine.notebook_dir = Some("/notebooks".into());
        cfg.pool.max_parallel = 2;
        cfg.remote.attempts = 200;
        cfg.remote.backoff_ms = 10;
        if let Some(dir) = cache_dir {
            cfg.cache.enabled = true;
            cfg.cache.dir = dir.display().to_string();
        }
        cfg
    }

    fn orchestrator(cfg: OrchestratorConfig, engine: Arc<ScriptedEngine>) -> Orchestrator {
        Orchestrator::builder(cfg)
            .engine(engine)
            .sleeper(Arc::new(CountingSleeper::default()))
            .build()
            .expect("orchestrator")
    }

    fn x1() -> Params {
        Params::from([("x".to_string(), json!(1))])
    }

    #[test]
    fn flags_and_ntries_parse() {
        assert!(flag_is_set(Some(&json!(true))));
        assert!(flag_is_set(Some(&json!("yes"))));
        assert!(!flag_is_set(Some(&json!("no"))));
        assert!(!flag_is_set(Some(&json!(0))));
        assert!(!flag_is_set(None));
        assert_eq!(parse_ntries(Some(&json!(3))).expect("n"), Some(3));
        assert_eq!(parse_ntries(Some(&json!("4"))).expect("n"), Some(4));
        assert!(parse_ntries(Some(&json!("many"))).is_err());
    }

    #[test]
    fn sync_local_success_is_cached() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(ScriptedEngine::returning(json!({"y": 2})));
        let orch = orchestrator(local_cfg(Some(tmp.path())), Arc::clone(&engine));

        let first = orch.evaluate("localfile", "t1", &[], &x1()).expect("first");
        assert_eq!(first.output, json!({"y": 2}));
        let second = orch.evaluate("localfile", "t1", &[], &x1()).expect("second");
        assert_eq!(second, first);
        assert_eq!(engine.contexts.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(orch.cache().len().expect("len"), 1);
    }

    #[test]
    fn failed_evaluation_is_not_cached() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(ScriptedEngine {
            exceptions: vec![WorkflowException::new("ValueError", "bad")],
            ..ScriptedEngine::default()
        });
        let orch = orchestrator(local_cfg(Some(tmp.path())), engine);
        let r = orch.evaluate("localfile", "t1", &[], &x1()).expect("evaluate");
        assert_eq!(r.output, json!({}));
        assert_eq!(r.exceptions.len(), 1);
        assert_eq!(orch.cache().len().expect("len"), 0);
    }

    #[test]
    fn async_first_call_lifecycle() {
        let engine = Arc::new(ScriptedEngine::returning(json!({"y": 2})));
        let orch = orchestrator(local_cfg(None), engine);
        let registry = Arc::clone(orch.registry());

        // Hold the job slot so the second call deterministically observes `started`.
        let key = fingerprint("t1", &x1()).expect("key");
        let TryStart::Created(ticket) = registry.try_start(&key, "t1") else {
            panic!("expected Created");
        };
        let s = orch.submit("localfile", "t1", &[], &x1()).expect("submit");
        assert_eq!(s.workflow_status, WorkflowStatus::Started);
        assert_eq!(s.http_status(), 201);

        let mut result = EvalResult::empty();
        result.output = json!({"y": 2});
        registry.complete(&ticket, result.clone()).expect("complete");
        let s = orch.submit("localfile", "t1", &[], &x1()).expect("submit");
        assert_eq!(s.workflow_status, WorkflowStatus::Done);
        assert_eq!(s.data, Some(result));
        assert_eq!(s.http_status(), 200);
    }

    #[test]
    fn async_submit_runs_on_the_pool() {
        let engine = Arc::new(ScriptedEngine::returning(json!({"y": 2})));
        let orch = orchestrator(local_cfg(None), engine);
        let s = orch.submit("localfile", "t2", &[], &x1()).expect("submit");
        assert_eq!(s.workflow_status, WorkflowStatus::Submitted);
        let key = s.key.expect("key");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !orch.job(&key).is_some_and(|j| j.is_done()) {
            assert!(Instant::now() < deadline, "job did not finish");
            std::thread::sleep(Duration::from_millis(10));
        }
        let s = orch.submit("localfile", "t2", &[], &x1()).expect("submit");
        assert_eq!(s.data.map(|r| r.output), Some(json!({"y": 2})));
        assert_eq!(orch.status().stored_jobs, 1);
        assert_eq!(orch.status().background_jobs, 0);
    }

    #[test]
    fn async_evaluate_waits_for_local_job() {
        let engine = Arc::new(ScriptedEngine::returning(json!({"y": 2})));
        let orch = Orchestrator::builder(local_cfg(None))
            .engine(engine)
            .build()
            .expect("orchestrator");
        let mut params = x1();
        params.insert(ASYNC_REQUEST_PARAM.into(), json!(true));
        let r = orch.evaluate("localfile", "t3", &[], &params).expect("evaluate");
        assert_eq!(r.output, json!({"y": 2}));
        assert_eq!(orch.list_jobs().len(), 1);
        assert_eq!(orch.clear_jobs().len(), 1);
        assert!(orch.list_jobs().is_empty());
    }

    #[test]
    fn remote_route_cannot_take_local_submission() {
        let engine = Arc::new(ScriptedEngine::returning(json!({"y": 2})));
        let orch = orchestrator(local_cfg(None), engine);
        let err = orch
            .submit("host", "t1", &["http://x".to_string()], &x1())
            .expect_err("remote submit");
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = orch.evaluate("nowhere", "t1", &[], &x1()).expect_err("unknown");
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn submit_is_answered_from_cache() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let engine = Arc::new(ScriptedEngine::returning(json!({"y": 2})));
        let orch = orchestrator(local_cfg(Some(tmp.path())), Arc::clone(&engine));

        let r = orch.evaluate("localfile", "t1", &[], &x1()).expect("evaluate");
        let s = orch.submit("localfile", "t1", &[], &x1()).expect("submit");
        assert_eq!(s.workflow_status, WorkflowStatus::Done);
        assert_eq!(s.data, Some(r));
        assert_eq!(engine.contexts.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(orch.list_jobs().is_empty());
    }

    #[test]
    fn submit_after_shutdown_leaves_no_started_job() {
        let engine = Arc::new(ScriptedEngine::returning(json!({"y": 2})));
        let orch = orchestrator(local_cfg(None), engine);
        orch.shutdown();

        for _ in 0..2 {
            let err = orch
                .submit("localfile", "t1", &[], &x1())
                .expect_err("pool is shut down");
            assert_eq!(err.kind(), ErrorKind::Io);
        }
        let key = fingerprint("t1", &x1()).expect("key");
        assert!(orch.job(&key).is_none());
        assert_eq!(orch.status().background_jobs, 0);
    }

    #[test]
    fn async_evaluate_of_failed_job_returns_empty_output() {
        let engine = Arc::new(ScriptedEngine {
            exceptions: vec![WorkflowException::new("ValueError", "bad")],
            ..ScriptedEngine::returning(json!({"y": 2}))
        });
        let orch = Orchestrator::builder(local_cfg(None))
            .engine(engine)
            .build()
            .expect("orchestrator");
        let mut params = x1();
        params.insert(ASYNC_REQUEST_PARAM.into(), json!(true));
        let r = orch.evaluate("localfile", "t4", &[], &params).expect("evaluate");
        assert_eq!(r.output, json!({}));
        assert_eq!(r.exceptions.len(), 1);

        let key = fingerprint("t4", &params).expect("key");
        let stored = orch.job(&key).and_then(|j| j.result).expect("stored");
        assert_eq!(stored.output, json!(INCOMPLETE_OUTPUT));
    }
}
