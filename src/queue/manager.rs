// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job queue: owns the active job set and every job transition.
//!
//! All transitions happen under one mutex, and progress is published to the
//! streamer before it is released. That gives per-job event ordering and
//! makes the race between a cancellation and a late tick or completion
//! trivially resolved: whichever takes the lock second finds the job gone.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::types::{Enqueued, Job, JobPhase, JobTask, PullRequest, QueueProgressStatus};
use crate::error::{FleetError, FleetResult};
use crate::locks::resilient_lock;
use crate::stream::{ProgressEvent, ProgressStreamer, Subscription};
use crate::types::new_id;

/// Source of "now" for scheduling and expiry decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = resilient_lock(&self.now);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *resilient_lock(&self.now)
    }
}

/// A job handed to an executor, with the token that aborts it.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub job: Job,
    pub cancel: CancellationToken,
}

/// How many expired job ids are remembered for `Expired` answers.
const EXPIRED_MEMORY: usize = 256;

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    cancels: HashMap<String, CancellationToken>,
    expired: VecDeque<String>,
    next_seq: u64,
}

impl QueueState {
    /// Error for an id that is not in the active set.
    fn missing(&self, id: &str) -> FleetError {
        if self.expired.iter().any(|e| e == id) {
            FleetError::Expired(id.to_string())
        } else {
            FleetError::not_found("job", id)
        }
    }
}

pub struct JobQueue {
    state: Mutex<QueueState>,
    streamer: Arc<ProgressStreamer>,
    clock: Arc<dyn Clock>,
    default_validity: Duration,
    wake: Notify,
}

impl JobQueue {
    pub fn new(streamer: Arc<ProgressStreamer>, default_validity: Duration) -> Self {
        Self::with_clock(streamer, default_validity, Arc::new(SystemClock))
    }

    pub fn with_clock(
        streamer: Arc<ProgressStreamer>,
        default_validity: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            streamer,
            clock,
            default_validity,
            wake: Notify::new(),
        }
    }

    pub fn streamer(&self) -> &Arc<ProgressStreamer> {
        &self.streamer
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Resolves when new work may have become available.
    pub async fn notified(&self) {
        self.wake.notified().await
    }

    /// Admit a pull request, or return the active job that already covers
    /// the same `(model, source_url)`.
    pub fn enqueue(&self, request: PullRequest) -> FleetResult<Enqueued> {
        let model = request.model.trim();
        let source_url = request.base_url.trim().trim_end_matches('/');
        if model.is_empty() {
            return Err(FleetError::validation("model must not be empty"));
        }
        if source_url.is_empty() {
            return Err(FleetError::validation("source url must not be empty"));
        }

        let now = self.clock.now();
        let scheduled_for = request.scheduled_for.unwrap_or(now);
        let valid_until = request
            .valid_until
            .unwrap_or_else(|| scheduled_for.max(now) + self.default_validity);
        if scheduled_for > valid_until {
            return Err(FleetError::validation(format!(
                "scheduledFor ({}) is after validUntil ({})",
                scheduled_for.timestamp(),
                valid_until.timestamp()
            )));
        }

        let task = JobTask::ModelPull {
            source_url: source_url.to_string(),
            model: model.to_string(),
        };
        let key = task.dedup_key();

        let mut state = resilient_lock(&self.state);
        self.expire_lapsed(&mut state, now);

        if let Some(existing) = state
            .jobs
            .values()
            .find(|job| job.phase.is_active() && job.task.dedup_key() == key)
        {
            tracing::debug!(
                target: "queue",
                job_id = %existing.id,
                model = %model,
                "Duplicate pull request collapsed into active job"
            );
            return Ok(Enqueued::Existing(existing.clone()));
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let job = Job {
            id: new_id(),
            task,
            phase: JobPhase::Queued,
            progress: QueueProgressStatus::new(0, 0, JobPhase::Queued.token()),
            scheduled_for,
            valid_until,
            created_at: now,
            seq,
        };
        state.jobs.insert(job.id.clone(), job.clone());
        drop(state);

        tracing::info!(
            target: "queue",
            job_id = %job.id,
            model = %job.model(),
            source_url = %job.source_url(),
            scheduled_for = job.scheduled_for.timestamp(),
            valid_until = job.valid_until.timestamp(),
            "Job queued"
        );
        self.wake.notify_one();
        Ok(Enqueued::Created(job))
    }

    /// Active jobs ordered by `scheduled_for`, then creation order.
    pub fn list(&self) -> Vec<Job> {
        let now = self.clock.now();
        let mut state = resilient_lock(&self.state);
        self.expire_lapsed(&mut state, now);
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(Job::order_key);
        jobs
    }

    pub fn get(&self, id: &str) -> FleetResult<Job> {
        let now = self.clock.now();
        let mut state = resilient_lock(&self.state);
        self.expire_lapsed(&mut state, now);
        match state.jobs.get(id) {
            Some(job) => Ok(job.clone()),
            None => Err(state.missing(id)),
        }
    }

    pub fn active_count(&self) -> usize {
        resilient_lock(&self.state).jobs.len()
    }

    /// Move up to `limit` due jobs to `InProgress`, earliest first. Each gets
    /// a cancellation token derived from `parent`.
    pub fn claim_due(&self, limit: usize, parent: &CancellationToken) -> Vec<ClaimedJob> {
        if limit == 0 {
            return Vec::new();
        }
        let now = self.clock.now();
        let mut state = resilient_lock(&self.state);
        self.expire_lapsed(&mut state, now);

        let mut due: Vec<(DateTime<Utc>, u64, String)> = state
            .jobs
            .values()
            .filter(|job| job.is_due_at(now))
            .map(|job| {
                let (at, seq) = job.order_key();
                (at, seq, job.id.clone())
            })
            .collect();
        due.sort();

        let mut claimed = Vec::new();
        for (_, _, id) in due.into_iter().take(limit) {
            let token = parent.child_token();
            if let Some(job) = state.jobs.get_mut(&id) {
                job.phase = JobPhase::InProgress;
                job.progress = job.progress.with_status(JobPhase::InProgress.token());
                tracing::info!(target: "queue", job_id = %id, model = %job.model(), "Job dispatched");
                claimed.push(ClaimedJob {
                    job: job.clone(),
                    cancel: token.clone(),
                });
            }
            state.cancels.insert(id, token);
        }
        claimed
    }

    /// Record an executor progress tick. Returns `false` when the tick was
    /// discarded because the job is no longer running.
    pub fn report_progress(&self, id: &str, completed: u64, total: u64, status: &str) -> bool {
        let now = self.clock.now();
        let mut state = resilient_lock(&self.state);
        self.expire_lapsed(&mut state, now);

        let Some(job) = state.jobs.get_mut(id) else {
            tracing::debug!(target: "queue", job_id = %id, "Discarding tick for inactive job");
            return false;
        };
        if job.phase != JobPhase::InProgress {
            return false;
        }

        job.progress = QueueProgressStatus::new(completed, total, status);
        let event = progress_event(job);
        self.streamer.publish(event);
        true
    }

    /// Mark a running job completed and evict it. `record` runs before the
    /// eviction, under the queue lock, so a cancellation cannot interleave.
    /// Returns `None` if the job was no longer running.
    pub fn complete(&self, id: &str, record: impl FnOnce(&Job)) -> Option<Job> {
        let now = self.clock.now();
        let mut state = resilient_lock(&self.state);
        self.expire_lapsed(&mut state, now);

        let running = state
            .jobs
            .get(id)
            .map_or(false, |job| job.phase == JobPhase::InProgress);
        if !running {
            tracing::debug!(target: "queue", job_id = %id, "Discarding completion for inactive job");
            return None;
        }

        let job = self.finish(&mut state, id, JobPhase::Completed)?;
        record(&job);
        tracing::info!(target: "queue", job_id = %id, model = %job.model(), "Job completed");
        Some(job)
    }

    /// Mark a running job failed and evict it.
    pub fn fail(&self, id: &str, error: &str) -> Option<Job> {
        let now = self.clock.now();
        let mut state = resilient_lock(&self.state);
        self.expire_lapsed(&mut state, now);

        let running = state
            .jobs
            .get(id)
            .map_or(false, |job| job.phase == JobPhase::InProgress);
        if !running {
            return None;
        }

        let job = self.finish(&mut state, id, JobPhase::Failed)?;
        tracing::warn!(target: "queue", job_id = %id, model = %job.model(), error = %error, "Job failed");
        Some(job)
    }

    /// Cancel an active job. A running job's executor is signalled and the
    /// job leaves the queue immediately. A recently expired id answers
    /// `Expired`, anything else unknown `NotFound`.
    pub fn cancel(&self, id: &str) -> FleetResult<Job> {
        let now = self.clock.now();
        let mut state = resilient_lock(&self.state);
        self.expire_lapsed(&mut state, now);

        let Some(job) = self.finish(&mut state, id, JobPhase::Removed) else {
            return Err(state.missing(id));
        };
        tracing::info!(target: "queue", job_id = %id, model = %job.model(), "Job removed");
        Ok(job)
    }

    /// Cancel every active job for `model`. `NotFound` when there were none.
    pub fn cancel_model(&self, model: &str) -> FleetResult<Vec<Job>> {
        let now = self.clock.now();
        let mut state = resilient_lock(&self.state);
        self.expire_lapsed(&mut state, now);

        let ids: Vec<String> = state
            .jobs
            .values()
            .filter(|job| job.model() == model)
            .map(|job| job.id.clone())
            .collect();
        if ids.is_empty() {
            return Err(FleetError::not_found("queued model", model));
        }

        let removed: Vec<Job> = ids
            .iter()
            .filter_map(|id| self.finish(&mut state, id, JobPhase::Removed))
            .collect();
        tracing::info!(target: "queue", model = %model, count = removed.len(), "Jobs removed for model");
        Ok(removed)
    }

    /// Expire every lapsed job now. Returns how many were expired.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut state = resilient_lock(&self.state);
        self.expire_lapsed(&mut state, now)
    }

    /// Subscribe to one active job's progress.
    pub fn subscribe_job(&self, id: &str) -> FleetResult<Subscription> {
        let now = self.clock.now();
        let mut state = resilient_lock(&self.state);
        self.expire_lapsed(&mut state, now);
        if !state.jobs.contains_key(id) {
            return Err(state.missing(id));
        }
        Ok(self.streamer.subscribe_job(id))
    }

    pub fn subscribe_all(&self) -> Subscription {
        self.streamer.subscribe_all()
    }

    fn expire_lapsed(&self, state: &mut QueueState, now: DateTime<Utc>) -> usize {
        let lapsed: Vec<String> = state
            .jobs
            .values()
            .filter(|job| job.phase.is_active() && job.is_expired_at(now))
            .map(|job| job.id.clone())
            .collect();

        for id in &lapsed {
            if let Some(job) = self.finish(state, id, JobPhase::Expired) {
                if state.expired.len() == EXPIRED_MEMORY {
                    state.expired.pop_front();
                }
                state.expired.push_back(id.clone());
                tracing::info!(
                    target: "queue",
                    job_id = %id,
                    model = %job.model(),
                    valid_until = job.valid_until.timestamp(),
                    "Job expired"
                );
            }
        }
        lapsed.len()
    }

    /// Apply a terminal phase: publish it, signal the executor and evict.
    fn finish(&self, state: &mut QueueState, id: &str, phase: JobPhase) -> Option<Job> {
        let mut job = state.jobs.remove(id)?;
        job.phase = phase;
        job.progress = job.progress.with_status(phase.token());
        if phase == JobPhase::Completed && job.progress.total > 0 {
            job.progress.completed = job.progress.total;
        }

        if let Some(token) = state.cancels.remove(id) {
            if phase != JobPhase::Completed {
                token.cancel();
            }
        }

        self.streamer.publish(progress_event(&job));
        self.streamer.close_job(id);
        Some(job)
    }
}

fn progress_event(job: &Job) -> ProgressEvent {
    ProgressEvent {
        job_id: job.id.clone(),
        model: job.model().to_string(),
        base_url: job.source_url().to_string(),
        progress: job.progress.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn queue_at(start: DateTime<Utc>) -> (JobQueue, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let queue = JobQueue::with_clock(
            Arc::new(ProgressStreamer::new(16)),
            Duration::hours(1),
            clock.clone(),
        );
        (queue, clock)
    }

    fn pull(model: &str) -> PullRequest {
        PullRequest::new(model, "http://gpu:11434")
    }

    #[test]
    fn test_duplicate_enqueue_returns_existing() {
        let (queue, _) = queue_at(t0());
        let first = queue.enqueue(pull("llama")).unwrap();
        let second = queue.enqueue(pull("llama")).unwrap();
        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(first.job().id, second.job().id);
        assert_eq!(queue.list().len(), 1);

        let other_backend = queue
            .enqueue(PullRequest::new("llama", "http://cpu:11434"))
            .unwrap();
        assert!(other_backend.is_new());
        assert_eq!(queue.list().len(), 2);
    }

    #[test]
    fn test_trailing_slash_source_collapses_into_same_job() {
        let (queue, _) = queue_at(t0());
        let first = queue.enqueue(pull("llama")).unwrap();
        let second = queue
            .enqueue(PullRequest::new("llama", "http://gpu:11434/"))
            .unwrap();
        assert!(first.is_new());
        assert!(!second.is_new());
        assert_eq!(second.job().source_url(), "http://gpu:11434");
        assert_eq!(queue.list().len(), 1);
    }

    #[test]
    fn test_inverted_window_is_rejected() {
        let (queue, _) = queue_at(t0());
        let err = queue
            .enqueue(pull("llama").window(t0() + Duration::seconds(10), t0()))
            .unwrap_err();
        assert!(matches!(err, FleetError::Validation(_)));
        assert!(queue.list().is_empty());
    }

    #[test]
    fn test_empty_fields_are_rejected() {
        let (queue, _) = queue_at(t0());
        assert!(queue.enqueue(pull(" ")).is_err());
        assert!(queue.enqueue(PullRequest::new("llama", "")).is_err());
    }

    #[test]
    fn test_dispatch_order_is_scheduled_then_fifo() {
        let (queue, clock) = queue_at(t0());
        let late = queue
            .enqueue(pull("late").window(t0() + Duration::seconds(5), t0() + Duration::hours(1)))
            .unwrap()
            .into_job();
        let a = queue.enqueue(pull("a")).unwrap().into_job();
        let b = queue.enqueue(pull("b")).unwrap().into_job();

        let listed: Vec<String> = queue.list().into_iter().map(|j| j.id).collect();
        assert_eq!(listed, vec![a.id.clone(), b.id.clone(), late.id.clone()]);

        let parent = CancellationToken::new();
        let claimed: Vec<String> = queue
            .claim_due(10, &parent)
            .into_iter()
            .map(|c| c.job.id)
            .collect();
        assert_eq!(claimed, vec![a.id, b.id]);

        clock.advance(Duration::seconds(5));
        let claimed = queue.claim_due(10, &parent);
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job.id, late.id);
    }

    #[test]
    fn test_claim_respects_limit() {
        let (queue, _) = queue_at(t0());
        queue.enqueue(pull("a")).unwrap();
        queue.enqueue(pull("b")).unwrap();
        let parent = CancellationToken::new();
        assert_eq!(queue.claim_due(1, &parent).len(), 1);
        assert_eq!(queue.claim_due(0, &parent).len(), 0);
        assert_eq!(queue.claim_due(5, &parent).len(), 1);
    }

    #[test]
    fn test_queued_job_expires_without_running() {
        let (queue, clock) = queue_at(t0());
        let mut sub = queue.subscribe_all();
        let job = queue
            .enqueue(pull("llama").window(t0() + Duration::seconds(30), t0() + Duration::seconds(60)))
            .unwrap()
            .into_job();

        clock.advance(Duration::seconds(61));
        assert!(queue.claim_due(10, &CancellationToken::new()).is_empty());
        assert!(queue.list().is_empty());

        let event = sub.try_next().unwrap();
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.progress.status, "expired");
    }

    #[test]
    fn test_expired_job_lookups_report_expiry() {
        let (queue, clock) = queue_at(t0());
        let job = queue
            .enqueue(pull("llama").window(t0(), t0() + Duration::seconds(10)))
            .unwrap()
            .into_job();
        clock.advance(Duration::seconds(11));

        assert!(matches!(queue.get(&job.id), Err(FleetError::Expired(id)) if id == job.id));
        assert!(matches!(queue.cancel(&job.id), Err(FleetError::Expired(_))));
        assert!(matches!(queue.subscribe_job(&job.id), Err(FleetError::Expired(_))));
        assert!(matches!(queue.cancel("ghost"), Err(FleetError::NotFound { .. })));
    }

    #[test]
    fn test_running_job_expiry_cancels_executor() {
        let (queue, clock) = queue_at(t0());
        queue
            .enqueue(pull("llama").window(t0(), t0() + Duration::seconds(10)))
            .unwrap();
        let claimed = queue.claim_due(1, &CancellationToken::new()).remove(0);

        clock.advance(Duration::seconds(11));
        assert_eq!(queue.sweep(), 1);
        assert!(claimed.cancel.is_cancelled());
        assert!(!queue.report_progress(&claimed.job.id, 1, 2, "downloading"));
    }

    #[test]
    fn test_progress_then_completion() {
        let (queue, _) = queue_at(t0());
        let job = queue.enqueue(pull("llama")).unwrap().into_job();
        let mut sub = queue.subscribe_all();
        let claimed = queue.claim_due(1, &CancellationToken::new()).remove(0);

        assert!(queue.report_progress(&job.id, 50, 100, "downloading"));
        let event = sub.try_next().unwrap();
        assert_eq!(event.job_id, job.id);
        assert_eq!(event.progress, QueueProgressStatus::new(50, 100, "downloading"));
        assert_eq!(queue.get(&job.id).unwrap().progress.completed, 50);

        let mut recorded = None;
        let done = queue
            .complete(&job.id, |j| recorded = Some(j.model().to_string()))
            .unwrap();
        assert_eq!(done.phase, JobPhase::Completed);
        assert_eq!(recorded.as_deref(), Some("llama"));
        assert!(queue.list().is_empty());
        assert!(!claimed.cancel.is_cancelled());
        assert_eq!(sub.try_next().unwrap().progress.status, "completed");
    }

    #[test]
    fn test_cancel_wins_over_late_tick_and_completion() {
        let (queue, _) = queue_at(t0());
        let job = queue.enqueue(pull("llama")).unwrap().into_job();
        let claimed = queue.claim_due(1, &CancellationToken::new()).remove(0);
        let mut sub = queue.subscribe_all();

        let removed = queue.cancel(&job.id).unwrap();
        assert_eq!(removed.phase, JobPhase::Removed);
        assert!(claimed.cancel.is_cancelled());
        assert!(queue.list().is_empty());
        assert_eq!(sub.try_next().unwrap().progress.status, "removed");

        assert!(!queue.report_progress(&job.id, 90, 100, "downloading"));
        assert!(queue.complete(&job.id, |_| panic!("must not record")).is_none());
        assert!(sub.try_next().is_none());
    }

    #[test]
    fn test_cancel_unknown_is_not_found() {
        let (queue, _) = queue_at(t0());
        assert!(matches!(queue.cancel("nope"), Err(FleetError::NotFound { .. })));
        assert!(matches!(queue.cancel_model("nope"), Err(FleetError::NotFound { .. })));
    }

    #[test]
    fn test_cancel_model_removes_all_targets() {
        let (queue, _) = queue_at(t0());
        queue.enqueue(pull("llama")).unwrap();
        queue
            .enqueue(PullRequest::new("llama", "http://cpu:11434"))
            .unwrap();
        queue.enqueue(pull("mistral")).unwrap();

        assert_eq!(queue.cancel_model("llama").unwrap().len(), 2);
        let remaining: Vec<_> = queue.list().into_iter().map(|j| j.model().to_string()).collect();
        assert_eq!(remaining, vec!["mistral"]);
    }

    #[test]
    fn test_failure_evicts_and_allows_resubmission() {
        let (queue, _) = queue_at(t0());
        let job = queue.enqueue(pull("llama")).unwrap().into_job();
        queue.claim_due(1, &CancellationToken::new());
        assert_eq!(queue.fail(&job.id, "boom").unwrap().phase, JobPhase::Failed);
        assert!(queue.list().is_empty());
        assert!(queue.enqueue(pull("llama")).unwrap().is_new());
    }

    #[test]
    fn test_job_subscription_requires_active_job() {
        let (queue, _) = queue_at(t0());
        assert!(queue.subscribe_job("nope").is_err());
        let job = queue.enqueue(pull("llama")).unwrap().into_job();
        let mut sub = queue.subscribe_job(&job.id).unwrap();
        queue.cancel(&job.id).unwrap();
        assert_eq!(sub.try_next().unwrap().progress.status, "removed");
    }
}
