//! Tagged job scheduler
//!
//! Runs callbacks once after a delay, periodically, or at a wall-clock time.
//! Every job carries one or more string tags so related jobs (for example
//! everything belonging to one EVSE) can be cancelled together.
//!
//! Cancellation is cooperative: a cancelled job never starts another run, but
//! a run already in progress completes. This lets a callback cancel its own
//! tag (a timer that stops the session it guards) without tearing itself down
//! halfway through.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{interval_at, sleep, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Handle to a scheduled job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Once,
    Every(Duration),
}

/// Run bookkeeping for a job
#[derive(Debug, Clone, Default)]
pub struct JobStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u64,
}

struct Job {
    tags: Vec<String>,
    kind: JobKind,
    token: CancellationToken,
    status: Arc<Mutex<JobStatus>>,
}

struct Inner {
    jobs: Mutex<HashMap<JobId, Job>>,
    next_id: AtomicU64,
    root: CancellationToken,
}

/// Cloneable handle; all clones share the same job table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Run `task` once after `delay`.
    pub fn once<F, Fut>(&self, delay: Duration, tags: &[&str], task: F) -> JobId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (id, token, status) = self.register(tags, JobKind::Once);
        let inner = self.inner.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = sleep(delay) => {}
            }

            // Deregister before running so the callback may reschedule under the same tag.
            if inner.jobs.lock().remove(&id).is_none() || token.is_cancelled() {
                return;
            }
            record_run(&status);
            task().await;
        });

        id
    }

    /// Run `task` at a wall-clock time. Times in the past fire immediately.
    pub fn at<F, Fut>(&self, when: DateTime<Utc>, tags: &[&str], task: F) -> JobId
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = (when - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(%when, delay_secs = delay.as_secs(), "scheduling job at wall-clock time");
        self.once(delay, tags, task)
    }

    /// Run `task` every `period`, first run one period from now.
    pub fn every<F, Fut>(&self, period: Duration, tags: &[&str], mut task: F) -> JobId
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let (id, token, status) = self.register(tags, JobKind::Every(period));
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if token.is_cancelled() {
                    break;
                }
                record_run(&status);
                task().await;
            }

            inner.jobs.lock().remove(&id);
        });

        id
    }

    /// Cancel every job carrying `tag`. Returns how many were cancelled.
    pub fn remove_by_tag(&self, tag: &str) -> usize {
        let mut jobs = self.inner.jobs.lock();
        let ids: Vec<JobId> = jobs
            .iter()
            .filter(|(_, job)| job.tags.iter().any(|t| t == tag))
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(job) = jobs.remove(id) {
                job.token.cancel();
            }
        }

        if !ids.is_empty() {
            debug!(tag, count = ids.len(), "cancelled scheduled jobs");
        }
        ids.len()
    }

    pub fn remove(&self, id: JobId) -> bool {
        match self.inner.jobs.lock().remove(&id) {
            Some(job) => {
                job.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel all jobs but keep accepting new ones.
    pub fn clear(&self) {
        let mut jobs = self.inner.jobs.lock();
        for (_, job) in jobs.drain() {
            job.token.cancel();
        }
    }

    /// Cancel all jobs and refuse new ones.
    pub fn stop(&self) {
        self.inner.root.cancel();
        self.clear();
        info!("scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.root.is_cancelled()
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.count_by_tag(tag) > 0
    }

    pub fn count_by_tag(&self, tag: &str) -> usize {
        self.inner
            .jobs
            .lock()
            .values()
            .filter(|job| job.tags.iter().any(|t| t == tag))
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self, id: JobId) -> Option<JobKind> {
        self.inner.jobs.lock().get(&id).map(|job| job.kind)
    }

    pub fn status(&self, id: JobId) -> Option<JobStatus> {
        self.inner
            .jobs
            .lock()
            .get(&id)
            .map(|job| job.status.lock().clone())
    }

    fn register(&self, tags: &[&str], kind: JobKind) -> (JobId, CancellationToken, Arc<Mutex<JobStatus>>) {
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let token = self.inner.root.child_token();
        let status = Arc::new(Mutex::new(JobStatus::default()));

        // A stopped scheduler hands out tokens that are already cancelled.
        if !token.is_cancelled() {
            self.inner.jobs.lock().insert(
                id,
                Job {
                    tags: tags.iter().map(|t| t.to_string()).collect(),
                    kind,
                    token: token.clone(),
                    status: status.clone(),
                },
            );
        }

        (id, token, status)
    }
}

fn record_run(status: &Mutex<JobStatus>) {
    let mut status = status.lock();
    status.last_run = Some(Utc::now());
    status.run_count += 1;
}
