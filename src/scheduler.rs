//! Named per-request timeout timers.
//!
//! [`TimerTable`] is the pure `name -> fire time` structure. [`Scheduler`] drives it with
//! tokio timers and turns each expiry into a high-priority timeout job. A table can also be
//! driven by an external clock through [`Scheduler::fire_due`].

use parking_lot::Mutex;
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::{
    error::OracleError,
    job::{Job, JobQueue, Priority, Step},
    types::{RequestKey, RoundContext},
    utils::{current_timestamp, duration_millis},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SchedulerType {
    /// Leader waiting for enough observations.
    ObservationCollectWaiting,
    /// Follower waiting for the leader's report.
    CheckReportReceive,
    /// Waiting for the signed report to be transmitted.
    CheckTransmit,
    /// Waiting for the transmit transaction to be mined.
    CheckRequestEnd,
}

impl SchedulerType {
    pub const ALL: [SchedulerType; 4] = [
        SchedulerType::ObservationCollectWaiting,
        SchedulerType::CheckReportReceive,
        SchedulerType::CheckTransmit,
        SchedulerType::CheckRequestEnd,
    ];
}

impl fmt::Display for SchedulerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub request: RequestKey,
    pub kind: SchedulerType,
}

impl TimerKey {
    pub fn new(request: RequestKey, kind: SchedulerType) -> Self {
        Self { request, kind }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEntry {
    /// Unix milliseconds.
    pub fire_at: u64,
    /// Round the timer guards; a fire for another round is ignored by the handler.
    pub epoch: u64,
    pub round_id: u64,
    /// Bumped on every arm so a superseded expiry can be recognised.
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct TimerTable {
    entries: HashMap<TimerKey, TimerEntry>,
    next_generation: u64,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arms `key`, replacing any live timer of the same name.
    pub fn arm(&mut self, key: TimerKey, fire_at: u64, epoch: u64, round_id: u64) -> TimerEntry {
        self.next_generation += 1;
        let entry = TimerEntry {
            fire_at,
            epoch,
            round_id,
            generation: self.next_generation,
        };
        self.entries.insert(key, entry);
        entry
    }

    /// Removes `key`. Cancelling a fired or unknown timer returns `None`.
    pub fn cancel(&mut self, key: &TimerKey) -> Option<TimerEntry> {
        self.entries.remove(key)
    }

    pub fn cancel_request(&mut self, request: &RequestKey) -> Vec<TimerKey> {
        let keys: Vec<TimerKey> = self
            .entries
            .keys()
            .filter(|key| &key.request == request)
            .cloned()
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }
        keys
    }

    /// Removes and returns the entry only if it is still the `generation` that was armed.
    pub fn take_if_current(&mut self, key: &TimerKey, generation: u64) -> Option<TimerEntry> {
        match self.entries.get(key) {
            Some(entry) if entry.generation == generation => self.entries.remove(key),
            _ => None,
        }
    }

    /// Removes every entry due at `now`, earliest first.
    pub fn take_due(&mut self, now: u64) -> Vec<(TimerKey, TimerEntry)> {
        let mut due: Vec<(TimerKey, TimerEntry)> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.fire_at <= now)
            .map(|(key, entry)| (key.clone(), *entry))
            .collect();
        for (key, _) in &due {
            self.entries.remove(key);
        }
        due.sort_by_key(|(_, entry)| (entry.fire_at, entry.generation));
        due
    }

    pub fn next_fire_at(&self) -> Option<u64> {
        self.entries.values().map(|entry| entry.fire_at).min()
    }

    pub fn get(&self, key: &TimerKey) -> Option<&TimerEntry> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn timeout_job(key: &TimerKey, entry: &TimerEntry) -> Job {
    let ctx = RoundContext::new(
        key.request.chain_id.clone(),
        key.request.request_id.clone(),
        entry.epoch,
        entry.round_id,
    );
    Job::new(ctx, Step::Timeout { kind: key.kind }).with_priority(Priority::High)
}

/// Armed timers and the tasks that wait on them. Kept under one lock so a table entry and
/// its task are always replaced or removed together.
#[derive(Default)]
struct Timers {
    table: TimerTable,
    tasks: HashMap<TimerKey, (u64, JoinHandle<()>)>,
}

impl Timers {
    fn abort_task(&mut self, key: &TimerKey) {
        if let Some((_, handle)) = self.tasks.remove(key) {
            handle.abort();
        }
    }
}

pub struct Scheduler {
    timers: Arc<Mutex<Timers>>,
    queue: Arc<JobQueue>,
}

impl Scheduler {
    pub fn new(queue: Arc<JobQueue>) -> Self {
        Self {
            timers: Arc::new(Mutex::new(Timers::default())),
            queue,
        }
    }

    /// Arms `kind` for the request at `reference + window`, replacing a live timer of the
    /// same name. Must be called from within a tokio runtime.
    pub fn arm(
        &self,
        ctx: &RoundContext,
        kind: SchedulerType,
        reference: u64,
        window: Duration,
    ) -> Result<TimerEntry, OracleError> {
        let key = TimerKey::new(ctx.request_key(), kind);
        let fire_at = reference.saturating_add(duration_millis(window));
        let delay = Duration::from_millis(fire_at.saturating_sub(current_timestamp()?));

        let mut timers = self.timers.lock();
        let entry = timers
            .table
            .arm(key.clone(), fire_at, ctx.epoch, ctx.round_id);

        let shared = Arc::clone(&self.timers);
        let queue = Arc::clone(&self.queue);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let fired = {
                let mut timers = shared.lock();
                let fired = timers.table.take_if_current(&task_key, entry.generation);
                if fired.is_some() {
                    timers.tasks.remove(&task_key);
                }
                fired
            };
            if let Some(entry) = fired {
                debug!(
                    request = %task_key.request,
                    kind = %task_key.kind,
                    epoch = entry.epoch,
                    round = entry.round_id,
                    "Timer fired"
                );
                queue.push(timeout_job(&task_key, &entry));
            }
        });

        if let Some((_, previous)) = timers.tasks.insert(key, (entry.generation, handle)) {
            previous.abort();
        }
        Ok(entry)
    }

    /// Cancels one timer; unknown or already fired timers are a no-op.
    pub fn cancel(&self, request: &RequestKey, kind: SchedulerType) -> bool {
        let key = TimerKey::new(request.clone(), kind);
        let mut timers = self.timers.lock();
        let removed = timers.table.cancel(&key).is_some();
        timers.abort_task(&key);
        removed
    }

    pub fn cancel_all(&self, request: &RequestKey) -> usize {
        let mut timers = self.timers.lock();
        let removed = timers.table.cancel_request(request).len();
        for kind in SchedulerType::ALL {
            timers.abort_task(&TimerKey::new(request.clone(), kind));
        }
        removed
    }

    /// Fires every timer due at `now` (unix milliseconds) through the job queue.
    pub fn fire_due(&self, now: u64) -> usize {
        let mut timers = self.timers.lock();
        let due = timers.table.take_due(now);
        for (key, entry) in &due {
            timers.abort_task(key);
            self.queue.push(timeout_job(key, entry));
        }
        due.len()
    }

    pub fn pending(&self, request: &RequestKey, kind: SchedulerType) -> Option<TimerEntry> {
        self.timers
            .lock()
            .table
            .get(&TimerKey::new(request.clone(), kind))
            .copied()
    }

    pub fn pending_count(&self) -> usize {
        self.timers.lock().table.len()
    }
}
