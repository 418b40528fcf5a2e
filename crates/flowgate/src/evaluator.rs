use std::path::Path;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::engine::{Engine, ExecutionContext};
use crate::error::Result;
use crate::fingerprint::Params;
use crate::result::EvalResult;
use crate::retry::{CancelToken, RetryPolicy, Sleeper, ThreadSleeper};

/// Poll the engine for output until it is non-empty or the policy is exhausted.
///
/// Not-ready and malformed output both consume an attempt. Exhaustion is not an
/// error: the caller gets an empty mapping.
pub fn extract_with_retry(
    ctx: &mut dyn ExecutionContext,
    policy: RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancelToken,
) -> Result<Map<String, Value>> {
    for attempt in 1..=policy.attempts {
        match ctx.extract_output() {
            Ok(output) if !output.is_empty() => {
                debug!(attempt, keys = output.len(), "output extracted");
                return Ok(output);
            }
            Ok(_) => {
                debug!(attempt, left = policy.attempts - attempt, "output is empty");
            }
            Err(e) => {
                debug!(attempt, left = policy.attempts - attempt, "{e}");
            }
        }
        if attempt < policy.attempts {
            sleeper.sleep(policy.backoff, cancel)?;
        }
    }
    warn!(attempts = policy.attempts, "no output after retries");
    Ok(Map::new())
}

pub(crate) fn jobdir_string(ctx: &dyn ExecutionContext) -> Option<String> {
    ctx.jobdir().map(|p| p.display().to_string())
}

/// Blocking evaluation on the caller's thread.
#[derive(Clone)]
pub struct SyncEvaluator {
    engine: Arc<dyn Engine>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl SyncEvaluator {
    pub fn new(engine: Arc<dyn Engine>, policy: RetryPolicy) -> Self {
        Self {
            engine,
            policy,
            sleeper: Arc::new(ThreadSleeper),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn evaluate(
        &self,
        target: &str,
        notebook: &Path,
        params: &Params,
        cancel: &CancelToken,
    ) -> Result<EvalResult> {
        cancel.check()?;
        let mut ctx = self.engine.context(target, notebook)?;
        let exceptions = ctx.execute(params);
        let output = if exceptions.is_empty() {
            extract_with_retry(ctx.as_mut(), self.policy, self.sleeper.as_ref(), cancel)?
        } else {
            Map::new()
        };
        info!(
            workflow = target,
            exceptions = exceptions.len(),
            keys = output.len(),
            "evaluated"
        );
        Ok(EvalResult::new(output, exceptions).with_jobdir(jobdir_string(ctx.as_ref())))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::engine::ExtractError;
    use crate::result::WorkflowException;

    /// Scripted engine: every context replays the same exceptions and extraction answers.
    #[derive(Default)]
    pub struct ScriptedEngine {
        pub exceptions: Vec<WorkflowException>,
        pub answers: Vec<std::result::Result<Map<String, Value>, ExtractError>>,
        pub contexts: AtomicUsize,
        pub extract_calls: Arc<AtomicUsize>,
        pub seen_params: Arc<Mutex<Vec<Params>>>,
    }

    impl ScriptedEngine {
        pub fn returning(output: Value) -> Self {
            let map = output.as_object().cloned().unwrap_or_default();
            Self {
                answers: vec![Ok(map)],
                ..Self::default()
            }
        }

        pub fn extract_calls(&self) -> usize {
            self.extract_calls.load(Ordering::SeqCst)
        }
    }

    struct ScriptedContext {
        exceptions: Vec<WorkflowException>,
        answers: VecDeque<std::result::Result<Map<String, Value>, ExtractError>>,
        extract_calls: Arc<AtomicUsize>,
        seen_params: Arc<Mutex<Vec<Params>>>,
    }

    impl ExecutionContext for ScriptedContext {
        fn execute(&mut self, params: &Params) -> Vec<WorkflowException> {
            self.seen_params.lock().expect("params").push(params.clone());
            self.exceptions.clone()
        }

        fn extract_output(&mut self) -> std::result::Result<Map<String, Value>, ExtractError> {
            self.extract_calls.fetch_add(1, Ordering::SeqCst);
            // The last scripted answer repeats forever.
            if self.answers.len() > 1 {
                self.answers.pop_front().expect("answer")
            } else {
                self.answers
                    .front()
                    .cloned()
                    .unwrap_or_else(|| Err(ExtractError::NotReady("no script".into())))
            }
        }

        fn jobdir(&self) -> Option<&Path> {
            None
        }
    }

    impl Engine for ScriptedEngine {
        fn context(&self, _target: &str, _notebook: &Path) -> Result<Box<dyn ExecutionContext>> {
            self.contexts.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ScriptedContext {
                exceptions: self.exceptions.clone(),
                answers: self.answers.iter().cloned().collect(),
                extract_calls: Arc::clone(&self.extract_calls),
                seen_params: Arc::clone(&self.seen_params),
            }))
        }
    }
}
