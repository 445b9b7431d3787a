//! Delayed re-enqueue of steps that failed transiently.

use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::warn;
use uuid::Uuid;

use crate::{
    config::{Backoff, SchedulerConfig},
    job::{Job, JobQueue, StepKind},
    types::RequestKey,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    /// `None` retries until the step succeeds or the round moves on.
    pub max_retries: Option<u32>,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            base_delay: config.retry_timeout,
            max_retries: config.retry_count,
            backoff: config.retry_backoff,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = match self.backoff {
            Backoff::Linear => attempt,
            Backoff::Quadratic => attempt.saturating_mul(attempt),
        };
        self.base_delay.saturating_mul(factor)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_retries.is_none_or(|max| attempt <= max)
    }
}

/// One message's budget: a retried job keeps its id, so two followers' observations for
/// the same round never share attempts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RetryScope {
    request: RequestKey,
    epoch: u64,
    round_id: u64,
    step: StepKind,
    job: Uuid,
}

impl RetryScope {
    fn of(job: &Job) -> Self {
        Self {
            request: job.ctx.request_key(),
            epoch: job.ctx.epoch,
            round_id: job.ctx.round_id,
            step: job.kind(),
            job: job.id,
        }
    }
}

pub struct RetryProvider {
    policy: RetryPolicy,
    queue: Arc<JobQueue>,
    attempts: Mutex<HashMap<RetryScope, u32>>,
}

impl RetryProvider {
    pub fn new(policy: RetryPolicy, queue: Arc<JobQueue>) -> Self {
        Self {
            policy,
            queue,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Schedules `job` again after the backoff delay. Returns `false` once the attempts of
    /// its scope are used up. Must be called from within a tokio runtime.
    pub fn retry(&self, mut job: Job, reason: &str) -> bool {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let counter = attempts.entry(RetryScope::of(&job)).or_insert(0);
            *counter += 1;
            *counter
        };

        if !self.policy.allows(attempt) {
            warn!(
                chain_id = %job.ctx.chain_id,
                request_id = %job.ctx.request_id,
                epoch = job.ctx.epoch,
                round = job.ctx.round_id,
                step = %job.kind(),
                attempt,
                reason,
                "Retries exhausted, leaving the step to the round timeout"
            );
            return false;
        }

        let delay = self.policy.delay_for(attempt);
        warn!(
            chain_id = %job.ctx.chain_id,
            request_id = %job.ctx.request_id,
            epoch = job.ctx.epoch,
            round = job.ctx.round_id,
            step = %job.kind(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            reason,
            "Step not ready, retrying..."
        );

        job.attempt = attempt;
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(job);
        });
        true
    }

    /// Forgets the attempts of the job's scope after it succeeded.
    pub fn reset(&self, job: &Job) {
        self.attempts.lock().remove(&RetryScope::of(job));
    }

    pub fn clear_request(&self, request: &RequestKey) {
        self.attempts
            .lock()
            .retain(|scope, _| &scope.request != request);
    }

    pub fn attempts(&self, job: &Job) -> u32 {
        self.attempts
            .lock()
            .get(&RetryScope::of(job))
            .copied()
            .unwrap_or(0)
    }
}
