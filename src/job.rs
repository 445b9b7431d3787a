//! Units of work dispatched by the node.
//!
//! Every lifecycle step is a [`Job`] on a two-level [`JobQueue`]. Handlers never call each
//! other directly; they enqueue the next step, so a step for one request never blocks a
//! step for another.

use parking_lot::Mutex;
use std::{collections::VecDeque, fmt};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    protos::oracle::v1::{Observation, PartialSignature, Report},
    scheduler::SchedulerType,
    types::RoundContext,
    utils::generate_job_id,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Normal,
    /// Round restarts and timeouts jump the queue.
    High,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The chain watcher saw the request start.
    Start {
        transaction_id: String,
        payload: Vec<u8>,
    },
    /// A timeout advanced the round; begin it.
    StartRound,
    /// Measure locally. `from` is the leader when triggered by its `RequestJob`.
    Observe { from: Option<u32>, payload: Vec<u8> },
    /// Leader intake of an observation (its own or a follower's).
    Report { from: u32, observation: Observation },
    /// Sign a report distributed by the round's leader.
    Sign { from: u32, report: Report },
    /// Leader intake of a partial signature.
    Transmit { from: u32, partial: PartialSignature },
    /// Confirm on-chain inclusion of the transmit transaction.
    Finish {
        from: Option<u32>,
        transaction_id: String,
    },
    Timeout { kind: SchedulerType },
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    Start,
    StartRound,
    Observe,
    Report,
    Sign,
    Transmit,
    Finish,
    Timeout,
    Cancel,
}

impl Step {
    pub fn kind(&self) -> StepKind {
        match self {
            Step::Start { .. } => StepKind::Start,
            Step::StartRound => StepKind::StartRound,
            Step::Observe { .. } => StepKind::Observe,
            Step::Report { .. } => StepKind::Report,
            Step::Sign { .. } => StepKind::Sign,
            Step::Transmit { .. } => StepKind::Transmit,
            Step::Finish { .. } => StepKind::Finish,
            Step::Timeout { .. } => StepKind::Timeout,
            Step::Cancel => StepKind::Cancel,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StepKind::Start => "start",
            StepKind::StartRound => "start_round",
            StepKind::Observe => "observe",
            StepKind::Report => "report",
            StepKind::Sign => "sign",
            StepKind::Transmit => "transmit",
            StepKind::Finish => "finish",
            StepKind::Timeout => "timeout",
            StepKind::Cancel => "cancel",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    /// Correlates the log lines of one execution.
    pub id: Uuid,
    pub ctx: RoundContext,
    pub step: Step,
    pub priority: Priority,
    /// Retries already spent on this job.
    pub attempt: u32,
}

impl Job {
    pub fn new(ctx: RoundContext, step: Step) -> Self {
        Self {
            id: generate_job_id(),
            ctx,
            step,
            priority: Priority::Normal,
            attempt: 0,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn kind(&self) -> StepKind {
        self.step.kind()
    }
}

#[derive(Default)]
pub struct JobQueue {
    high: Mutex<VecDeque<Job>>,
    normal: Mutex<VecDeque<Job>>,
    notify: Notify,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: Job) {
        match job.priority {
            Priority::High => self.high.lock().push_back(job),
            Priority::Normal => self.normal.lock().push_back(job),
        }
        self.notify.notify_one();
    }

    /// Next job without waiting, high priority first.
    pub fn pop(&self) -> Option<Job> {
        if let Some(job) = self.high.lock().pop_front() {
            return Some(job);
        }
        self.normal.lock().pop_front()
    }

    pub async fn next(&self) -> Job {
        loop {
            if let Some(job) = self.pop() {
                return job;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.high.lock().len() + self.normal.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
