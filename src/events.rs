use tokio::sync::broadcast;

use crate::{scheduler::SchedulerType, types::RequestKey};

/// Lifecycle milestones announced by a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OracleEvent {
    RequestStarted { epoch: u64 },
    /// The local observation was committed (sent to the leader or kept by it).
    ObservationCommitted { epoch: u64, round_id: u64 },
    /// The leader persisted the epoch's report.
    ReportGenerated { epoch: u64, round_id: u64 },
    /// The leader's accumulator crossed the signature threshold.
    ReportSigned { epoch: u64, round_id: u64 },
    Transmitted {
        epoch: u64,
        round_id: u64,
        transaction_id: String,
    },
    RoundAdvanced {
        epoch: u64,
        round_id: u64,
        cause: SchedulerType,
    },
    RequestEnded { epoch: u64 },
    RequestCanceled { epoch: u64 },
}

pub trait OracleEventBus: Clone + Send + Sync + 'static {
    /// Type returned to consumers that subscribe to lifecycle events.
    type Receiver;

    fn subscribe(&self) -> Self::Receiver;
    fn publish(&self, key: RequestKey, event: OracleEvent);
}

#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<(RequestKey, OracleEvent)>,
}

impl BroadcastEventBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl OracleEventBus for BroadcastEventBus {
    type Receiver = broadcast::Receiver<(RequestKey, OracleEvent)>;

    fn subscribe(&self) -> Self::Receiver {
        self.sender.subscribe()
    }

    fn publish(&self, key: RequestKey, event: OracleEvent) {
        let _ = self.sender.send((key, event));
    }
}
