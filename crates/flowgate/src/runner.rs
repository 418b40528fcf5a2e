use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread::JoinHandle;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::evaluator::{extract_with_retry, jobdir_string};
use crate::fingerprint::{Fingerprint, Params};
use crate::jobs::{JobRegistry, JobTicket};
use crate::result::{EvalResult, INCOMPLETE_OUTPUT};
use crate::retry::{CancelToken, RetryPolicy, Sleeper, ThreadSleeper};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Queued {
        key: Fingerprint,
        target: String,
    },
    Started {
        key: Fingerprint,
        target: String,
    },
    Finished {
        key: Fingerprint,
        target: String,
        exceptions: usize,
        elapsed_ms: u64,
    },
    /// The runner gave up before completing; the job stays `started`.
    Abandoned {
        key: Fingerprint,
        target: String,
        error: String,
    },
    /// The pool refused the job; its registry entry was withdrawn.
    Rejected {
        key: Fingerprint,
        target: String,
        error: String,
    },
}

pub trait JobSink: Send + Sync {
    fn emit(&self, ev: JobEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl JobSink for TracingSink {
    fn emit(&self, ev: JobEvent) {
        match ev {
            JobEvent::Queued { key, target } => debug!(%key, workflow = %target, "job queued"),
            JobEvent::Started { key, target } => info!(%key, workflow = %target, "job running"),
            JobEvent::Finished {
                key,
                target,
                exceptions,
                elapsed_ms,
            } => {
                if exceptions == 0 {
                    info!(%key, workflow = %target, elapsed_ms, "job finished");
                } else {
                    warn!(
                        %key,
                        workflow = %target,
                        exceptions,
                        elapsed_ms,
                        "job finished with exceptions"
                    );
                }
            }
            JobEvent::Abandoned { key, target, error } => {
                error!(%key, workflow = %target, %error, "job abandoned in started state")
            }
            JobEvent::Rejected { key, target, error } => {
                warn!(%key, workflow = %target, %error, "job rejected by worker pool")
            }
        }
    }
}

#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<JobEvent>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<JobEvent>) -> Self {
        Self { tx }
    }
}

impl JobSink for ChannelSink {
    fn emit(&self, ev: JobEvent) {
        let _ = self.tx.send(ev);
    }
}

type Work = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of worker threads draining a FIFO queue.
pub struct WorkerPool {
    tx: Mutex<Option<mpsc::Sender<Work>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    queued: Arc<AtomicUsize>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Result<Self> {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Work>();
        let rx = Arc::new(Mutex::new(rx));
        let queued = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(size);
        for i in 0..size {
            let rx = Arc::clone(&rx);
            let queued = Arc::clone(&queued);
            let handle = std::thread::Builder::new()
                .name(format!("flowgate-worker-{i}"))
                .spawn(move || worker_loop(rx, queued))
                .map_err(|e| Error::io(format!("failed to spawn worker thread: {e}")))?;
            workers.push(handle);
        }
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            queued,
            size,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs accepted but not yet picked up by a worker.
    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn submit<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(Error::io("worker pool is shut down"));
        };
        self.queued.fetch_add(1, Ordering::SeqCst);
        tx.send(Box::new(work)).map_err(|_| {
            self.queued.fetch_sub(1, Ordering::SeqCst);
            Error::io("worker pool is shut down")
        })
    }

    /// Stop accepting work, let queued jobs drain, and join the workers.
    pub fn shutdown(&self) {
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for h in workers {
            let _ = h.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Arc<Mutex<mpsc::Receiver<Work>>>, queued: Arc<AtomicUsize>) {
    loop {
        let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
        let Ok(work) = next else {
            break;
        };
        queued.fetch_sub(1, Ordering::SeqCst);
        if catch_unwind(AssertUnwindSafe(work)).is_err() {
            error!("worker job panicked");
        }
    }
}

struct RunnerShared {
    registry: Arc<JobRegistry>,
    engine: Arc<dyn Engine>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    sink: Arc<dyn JobSink>,
}

/// Runs asynchronous jobs created through [`JobRegistry::try_start`].
pub struct AsyncJobRunner {
    shared: Arc<RunnerShared>,
    pool: WorkerPool,
}

impl AsyncJobRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        engine: Arc<dyn Engine>,
        policy: RetryPolicy,
        workers: usize,
    ) -> Result<Self> {
        Self::with_parts(
            registry,
            engine,
            policy,
            workers,
            Arc::new(ThreadSleeper),
            Arc::new(TracingSink),
        )
    }

    pub fn with_parts(
        registry: Arc<JobRegistry>,
        engine: Arc<dyn Engine>,
        policy: RetryPolicy,
        workers: usize,
        sleeper: Arc<dyn Sleeper>,
        sink: Arc<dyn JobSink>,
    ) -> Result<Self> {
        Ok(Self {
            shared: Arc::new(RunnerShared {
                registry,
                engine,
                policy,
                sleeper,
                sink,
            }),
            pool: WorkerPool::new(workers)?,
        })
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.shared.registry
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Queue the job behind `ticket`. The ticket moves into the worker, which is the
    /// only place that can complete it.
    pub fn launch(
        &self,
        ticket: JobTicket,
        target: &str,
        notebook: PathBuf,
        params: Params,
    ) -> Result<()> {
        let key = ticket.key().clone();
        self.shared.sink.emit(JobEvent::Queued {
            key,
            target: target.to_string(),
        });
        // The ticket comes back out of the slot if the pool refuses the work.
        let slot = Arc::new(Mutex::new(Some(ticket)));
        let queued = Arc::clone(&slot);
        let shared = Arc::clone(&self.shared);
        let job_target = target.to_string();
        let submitted = self.pool.submit(move || {
            let ticket = queued.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(ticket) = ticket {
                run_job(&shared, ticket, &job_target, &notebook, &params);
            }
        });
        if let Err(e) = submitted {
            let ticket = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(ticket) = ticket {
                let key = ticket.key().clone();
                self.shared.registry.abandon(ticket);
                self.shared.sink.emit(JobEvent::Rejected {
                    key,
                    target: target.to_string(),
                    error: e.to_string(),
                });
            }
            return Err(e);
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

fn run_job(
    shared: &RunnerShared,
    ticket: JobTicket,
    target: &str,
    notebook: &Path,
    params: &Params,
) {
    let key = ticket.key().clone();
    shared.sink.emit(JobEvent::Started {
        key: key.clone(),
        target: target.to_string(),
    });
    let start = Instant::now();

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        execute_job(shared, target, notebook, params)
    }))
    .unwrap_or_else(|_| Err(Error::engine("engine panicked")));

    let abandon = |error: String| {
        shared.sink.emit(JobEvent::Abandoned {
            key: key.clone(),
            target: target.to_string(),
            error,
        })
    };

    let result = match outcome {
        Ok(r) => r,
        Err(e) => return abandon(e.to_string()),
    };
    let exceptions = result.exceptions.len();
    match shared.registry.complete(&ticket, result) {
        Ok(()) => shared.sink.emit(JobEvent::Finished {
            key: key.clone(),
            target: target.to_string(),
            exceptions,
            elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        }),
        Err(e) => abandon(e.to_string()),
    }
}

fn execute_job(
    shared: &RunnerShared,
    target: &str,
    notebook: &Path,
    params: &Params,
) -> Result<EvalResult> {
    // A fresh context per job; engine state is never shared between runs.
    let mut ctx = shared.engine.context(target, notebook)?;
    let exceptions = ctx.execute(params);
    let output = if exceptions.is_empty() {
        Value::Object(extract_with_retry(
            ctx.as_mut(),
            shared.policy,
            shared.sleeper.as_ref(),
            &CancelToken::new(),
        )?)
    } else {
        debug!(workflow = target, exceptions = exceptions.len(), "execution raised");
        Value::String(INCOMPLETE_OUTPUT.to_string())
    };
    Ok(EvalResult {
        output,
        exceptions,
        jobdir: jobdir_string(ctx.as_ref()),
    })
}
