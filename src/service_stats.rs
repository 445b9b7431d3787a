use crate::{
    events::OracleEventBus, protos::oracle::v1::RequestState, service::OracleNode,
    storage::DurableStore,
};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestStats {
    /// Total number of requests recorded for this chain.
    pub total_requests: usize,
    /// Requests still moving through the lifecycle.
    pub in_progress: usize,
    /// Requests whose report was confirmed on-chain.
    pub ended: usize,
    pub canceled: usize,
    /// In-progress requests that needed more than one round.
    pub retrying: usize,
}

impl<S, E> OracleNode<S, E>
where
    S: DurableStore,
    E: OracleEventBus,
{
    /// Get request counts by lifecycle state for a chain.
    ///
    /// Counts what the durable store holds; a store failure yields empty stats.
    pub async fn get_chain_stats(&self, chain_id: &str) -> RequestStats {
        self.records
            .list_requests(chain_id)
            .await
            .map(|requests| {
                let total_requests = requests.len();
                let in_progress = requests.iter().filter(|r| !r.is_terminal()).count();
                let ended = requests
                    .iter()
                    .filter(|r| r.state() == RequestState::RequestEnd)
                    .count();
                let canceled = requests
                    .iter()
                    .filter(|r| r.state() == RequestState::RequestCanceled)
                    .count();
                let retrying = requests
                    .iter()
                    .filter(|r| !r.is_terminal() && r.retrying)
                    .count();

                RequestStats {
                    total_requests,
                    in_progress,
                    ended,
                    canceled,
                    retrying,
                }
            })
            .unwrap_or_default()
    }
}
