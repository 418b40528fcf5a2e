//! In-memory registry of asynchronous jobs, keyed by request fingerprint.
//!
//! `try_start` is the only synchronization point between identical requests: the
//! first caller gets a [`JobTicket`] and becomes the single writer allowed to
//! `complete` that job. Everyone else observes `started` or the stored result.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::result::EvalResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Started,
    Done,
}

#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub key: Fingerprint,
    pub target: String,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<EvalResult>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    generation: u64,
    #[serde(skip)]
    since: Instant,
}

impl Job {
    pub fn is_done(&self) -> bool {
        self.state == JobState::Done
    }
}

/// Proof of having created a job; required to complete it.
#[derive(Debug)]
pub struct JobTicket {
    key: Fingerprint,
    generation: u64,
}

impl JobTicket {
    pub fn key(&self) -> &Fingerprint {
        &self.key
    }
}

#[derive(Debug)]
pub enum TryStart {
    Created(JobTicket),
    AlreadyStarted,
    AlreadyDone(EvalResult),
}

#[derive(Debug, Default)]
struct Inner {
    jobs: BTreeMap<Fingerprint, Job>,
    next_generation: u64,
}

#[derive(Debug, Default)]
pub struct JobRegistry {
    inner: Mutex<Inner>,
    stale_after: Option<Duration>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Started jobs older than `stale_after` are handed to the next identical request.
    pub fn with_stale_after(stale_after: Option<Duration>) -> Self {
        Self {
            inner: Mutex::default(),
            stale_after,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn try_start(&self, key: &Fingerprint, target: &str) -> TryStart {
        let mut inner = self.lock();
        if let Some(job) = inner.jobs.get(key) {
            match job.state {
                JobState::Done => {
                    let result = job.result.clone().unwrap_or_else(EvalResult::empty);
                    return TryStart::AlreadyDone(result);
                }
                JobState::Started => {
                    let stale = self
                        .stale_after
                        .is_some_and(|limit| job.since.elapsed() >= limit);
                    if !stale {
                        return TryStart::AlreadyStarted;
                    }
                    warn!(key = %key, workflow = %job.target, "reclaiming stale job");
                }
            }
        }

        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.jobs.insert(
            key.clone(),
            Job {
                key: key.clone(),
                target: target.to_string(),
                state: JobState::Started,
                result: None,
                started_at: Utc::now(),
                finished_at: None,
                generation,
                since: Instant::now(),
            },
        );
        TryStart::Created(JobTicket {
            key: key.clone(),
            generation,
        })
    }

    /// Transition `started -> done`. Anything else is a caller bug and is rejected.
    pub fn complete(&self, ticket: &JobTicket, result: EvalResult) -> Result<()> {
        let mut inner = self.lock();
        let Some(job) = inner.jobs.get_mut(&ticket.key) else {
            return Err(Error::registry(format!(
                "job {} is no longer registered",
                ticket.key
            )));
        };
        if job.generation != ticket.generation {
            return Err(Error::registry(format!(
                "job {} was reclaimed by a newer run",
                ticket.key
            )));
        }
        if job.state == JobState::Done {
            return Err(Error::registry(format!(
                "job {} is already done",
                ticket.key
            )));
        }
        job.state = JobState::Done;
        job.result = Some(result);
        job.finished_at = Some(Utc::now());
        info!(key = %ticket.key, workflow = %job.target, "job done");
        Ok(())
    }

    /// Withdraw a `started` entry whose run never began. A ticket from a
    /// superseded generation leaves the newer entry alone.
    pub fn abandon(&self, ticket: JobTicket) -> bool {
        let mut inner = self.lock();
        let matches = inner.jobs.get(&ticket.key).is_some_and(|job| {
            job.generation == ticket.generation && job.state == JobState::Started
        });
        if matches {
            inner.jobs.remove(&ticket.key);
            info!(key = %ticket.key, "job withdrawn before running");
        }
        matches
    }

    pub fn get(&self, key: &Fingerprint) -> Option<Job> {
        self.lock().jobs.get(key).cloned()
    }

    pub fn list_all(&self) -> Vec<(Fingerprint, Job)> {
        self.lock()
            .jobs
            .iter()
            .map(|(k, j)| (k.clone(), j.clone()))
            .collect()
    }

    /// Drops every entry and returns what was there.
    pub fn clear_all(&self) -> Vec<(Fingerprint, Job)> {
        let previous = std::mem::take(&mut self.lock().jobs);
        previous.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn started_count(&self) -> usize {
        self.lock()
            .jobs
            .values()
            .filter(|j| j.state == JobState::Started)
            .count()
    }
}
