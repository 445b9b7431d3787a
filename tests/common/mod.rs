#![allow(dead_code)]

use alloy::{primitives::Address, signers::local::PrivateKeySigner};
use parking_lot::Mutex;
use prost::Message;
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, mpsc::UnboundedReceiver},
    task::JoinHandle,
};

use oracle_round_consensus::{
    api::OracleNodeAPI,
    chain::{ChainClient, ObservationSource, TransactionResult, TransactionStatus},
    config::{ChainConfig, OracleConfig, SchedulerConfig},
    error::OracleError,
    events::OracleEvent,
    peer::{Envelope, LocalNetwork},
    protos::oracle::v1::{PeerMessage, Request, RequestState, TransmitPayload},
    service::DefaultOracleNode,
    types::{RequestKey, RequestStartEvent},
};

pub const CHAIN: &str = "tdvv";
pub const REQUEST: &str = "request-1";
pub const PAYLOAD: &[u8] = b"price:ELF-USDT";
pub const DISTRIBUTED_PUBLIC_KEY: &[u8] = b"group-key";

pub fn secret(index: u32) -> String {
    format!("{:064x}", index as u64 + 1)
}

pub fn signer_addresses(peer_count: usize) -> Vec<Address> {
    (0..peer_count as u32)
        .map(|i| {
            secret(i)
                .parse::<PrivateKeySigner>()
                .expect("valid secret")
                .address()
        })
        .collect()
}

pub fn request_key() -> RequestKey {
    RequestKey::new(CHAIN, REQUEST)
}

/// Long windows so timers only fire when a test fires them.
pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_observation_collect_timeout_window(Duration::from_secs(3600))
        .with_check_request_end_timeout_window(Duration::from_secs(3600))
        .with_retry_timeout(Duration::from_millis(10))
        .with_retry_count(Some(20))
}

pub fn oracle_config(
    local: u32,
    peer_count: usize,
    observations_threshold: usize,
    partial_signatures_threshold: usize,
) -> OracleConfig {
    oracle_config_with_scheduler(
        local,
        peer_count,
        observations_threshold,
        partial_signatures_threshold,
        scheduler_config(),
    )
}

pub fn oracle_config_with_scheduler(
    local: u32,
    peer_count: usize,
    observations_threshold: usize,
    partial_signatures_threshold: usize,
    scheduler: SchedulerConfig,
) -> OracleConfig {
    let chain = ChainConfig::builder(CHAIN)
        .with_observations_threshold(observations_threshold)
        .with_partial_signatures_threshold(partial_signatures_threshold)
        .with_signer_secret(secret(local))
        .with_distributed_public_key(DISTRIBUTED_PUBLIC_KEY.to_vec())
        .with_signers(signer_addresses(peer_count))
        .build()
        .expect("valid chain config");
    OracleConfig::builder()
        .with_chain(chain)
        .with_scheduler(scheduler)
        .build()
        .expect("valid oracle config")
}

pub struct MockChain {
    latest_round: AtomicU64,
    status: Mutex<TransactionStatus>,
    submissions: Mutex<Vec<TransmitPayload>>,
    commitment_calls: AtomicUsize,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            latest_round: AtomicU64::new(0),
            status: Mutex::new(TransactionStatus::Mined),
            submissions: Mutex::new(Vec::new()),
            commitment_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_latest_round(&self, epoch: u64) {
        self.latest_round.store(epoch, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: TransactionStatus) {
        *self.status.lock() = status;
    }

    pub fn submissions(&self) -> Vec<TransmitPayload> {
        self.submissions.lock().clone()
    }

    pub fn commitment_calls(&self) -> usize {
        self.commitment_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ChainClient for MockChain {
    async fn get_latest_round(&self, _chain_id: &str) -> Result<u64, OracleError> {
        Ok(self.latest_round.load(Ordering::SeqCst))
    }

    async fn get_commitment(
        &self,
        _chain_id: &str,
        _transaction_id: &str,
        _request_id: &str,
    ) -> Result<Vec<u8>, OracleError> {
        self.commitment_calls.fetch_add(1, Ordering::SeqCst);
        Ok(PAYLOAD.to_vec())
    }

    async fn submit_transmit(
        &self,
        _chain_id: &str,
        payload: TransmitPayload,
    ) -> Result<String, OracleError> {
        let mut submissions = self.submissions.lock();
        submissions.push(payload);
        Ok(format!("tx-{}", submissions.len()))
    }

    async fn get_transaction_result(
        &self,
        _chain_id: &str,
        _transaction_id: &str,
    ) -> Result<TransactionResult, OracleError> {
        Ok(match *self.status.lock() {
            TransactionStatus::Mined => TransactionResult::mined(),
            TransactionStatus::Pending => TransactionResult::pending(),
            TransactionStatus::Failed => TransactionResult::failed("reverted"),
        })
    }
}

/// Always reports the same reading; counts how often it was asked.
pub struct FixedSource {
    value: Option<i64>,
    calls: AtomicUsize,
}

impl FixedSource {
    pub fn new(value: Option<i64>) -> Self {
        Self {
            value,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ObservationSource for FixedSource {
    async fn observe(&self, _request: &Request) -> Result<Option<i64>, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.value)
    }
}

/// A whole peer set wired through a [`LocalNetwork`] and pumped by hand.
pub struct Cluster {
    pub nodes: Vec<DefaultOracleNode>,
    pub network: Arc<LocalNetwork>,
    pub chain: Arc<MockChain>,
    pub sources: Vec<Arc<FixedSource>>,
    /// Deliver every message twice.
    pub duplicate_delivery: bool,
    inboxes: Vec<UnboundedReceiver<Envelope>>,
}

impl Cluster {
    pub fn new(
        values: &[Option<i64>],
        observations_threshold: usize,
        partial_signatures_threshold: usize,
    ) -> Self {
        Self::with_scheduler(
            values,
            observations_threshold,
            partial_signatures_threshold,
            scheduler_config(),
        )
    }

    pub fn with_scheduler(
        values: &[Option<i64>],
        observations_threshold: usize,
        partial_signatures_threshold: usize,
        scheduler: SchedulerConfig,
    ) -> Self {
        let peer_count = values.len();
        let (network, inboxes) = LocalNetwork::new(peer_count);
        let chain = Arc::new(MockChain::new());
        let sources: Vec<Arc<FixedSource>> = values
            .iter()
            .map(|value| Arc::new(FixedSource::new(*value)))
            .collect();

        let nodes = (0..peer_count as u32)
            .map(|i| {
                DefaultOracleNode::builder(
                    oracle_config_with_scheduler(
                        i,
                        peer_count,
                        observations_threshold,
                        partial_signatures_threshold,
                        scheduler.clone(),
                    ),
                    i,
                    peer_count,
                )
                .with_transport(network.clone())
                .with_chain_client(chain.clone())
                .with_observation_source(sources[i as usize].clone())
                .build()
                .expect("node should build")
            })
            .collect();

        Self {
            nodes,
            network,
            chain,
            sources,
            duplicate_delivery: false,
            inboxes,
        }
    }

    pub fn subscribe(&self, index: usize) -> broadcast::Receiver<(RequestKey, OracleEvent)> {
        self.nodes[index].subscribe_to_events()
    }

    pub async fn start(&self, epoch: u64) {
        for node in &self.nodes {
            node.start_request(
                RequestStartEvent::new(CHAIN, REQUEST, epoch).with_payload(PAYLOAD.to_vec()),
            )
            .await
            .expect("start accepted");
        }
    }

    /// Runs node `index`'s queued jobs and delivers its inbox once.
    pub async fn step_node(&mut self, index: usize) -> usize {
        let node = &self.nodes[index];
        let mut progressed = node.run_pending().await;
        while let Ok((from, bytes)) = self.inboxes[index].try_recv() {
            let deliveries = if self.duplicate_delivery { 2 } else { 1 };
            for _ in 0..deliveries {
                let _ = node.handle_peer_bytes(from, &bytes).await;
            }
            progressed += 1;
        }
        progressed
    }

    /// Pumps every node until no jobs or messages are left.
    pub async fn settle(&mut self) {
        for _ in 0..1000 {
            let mut progressed = 0;
            for index in 0..self.nodes.len() {
                progressed += self.step_node(index).await;
            }
            if progressed == 0 {
                return;
            }
        }
        panic!("cluster did not settle");
    }

    /// Runs every node with [`DefaultOracleNode::run`] and delivers inboxes from background
    /// tasks, so steps for one request interleave freely. Abort the handles to stop.
    pub fn run_concurrently(&mut self) -> Vec<JoinHandle<()>> {
        let deliveries = if self.duplicate_delivery { 2 } else { 1 };
        let inboxes = std::mem::take(&mut self.inboxes);
        let mut handles = Vec::new();
        for (node, mut inbox) in self.nodes.iter().cloned().zip(inboxes) {
            let runner = node.clone();
            handles.push(tokio::spawn(async move { runner.run().await }));
            handles.push(tokio::spawn(async move {
                while let Some((from, bytes)) = inbox.recv().await {
                    for _ in 0..deliveries {
                        let _ = node.handle_peer_bytes(from, &bytes).await;
                    }
                }
            }));
        }
        handles
    }

    /// Fires every armed timer of node `index`.
    pub fn fire_timers(&self, index: usize) -> usize {
        self.nodes[index].scheduler().fire_due(u64::MAX)
    }

    /// Removes and decodes whatever is waiting in node `index`'s inbox.
    pub fn drain(&mut self, index: usize) -> Vec<(u32, PeerMessage)> {
        let mut messages = Vec::new();
        while let Ok((from, bytes)) = self.inboxes[index].try_recv() {
            messages.push((from, PeerMessage::decode(bytes.as_slice()).expect("decodes")));
        }
        messages
    }

    /// State of node `index`'s record, if it has one yet.
    pub async fn request_state(&self, index: usize) -> Option<RequestState> {
        self.nodes[index]
            .get_request(&request_key())
            .await
            .expect("store readable")
            .map(|request| request.state())
    }

    pub async fn request(&self, index: usize) -> Request {
        self.nodes[index]
            .get_request(&request_key())
            .await
            .expect("store readable")
            .expect("request recorded")
    }
}

pub fn drain_events(
    receiver: &mut broadcast::Receiver<(RequestKey, OracleEvent)>,
) -> Vec<OracleEvent> {
    let mut events = Vec::new();
    while let Ok((_, event)) = receiver.try_recv() {
        events.push(event);
    }
    events
}
