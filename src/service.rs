use std::{collections::HashMap, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

use crate::{
    chain::{ChainClient, ObservationSource},
    config::{ChainConfig, OracleConfig},
    error::OracleError,
    events::{BroadcastEventBus, OracleEvent, OracleEventBus},
    job::{Job, JobQueue, Step},
    multisig::{EcdsaReportSigner, ReportSigner},
    peer::{PeerManager, PeerTransport},
    protos::oracle::v1::Request,
    retry::{RetryPolicy, RetryProvider},
    scheduler::Scheduler,
    state::StateProvider,
    storage::{DurableStore, InMemoryDurableStore, RecordStore},
    types::{RequestKey, RoundContext, StepOutcome},
};

/// One oracle peer running the round-based reporting protocol.
///
/// Every lifecycle step is a [`Job`] on the node's queue. [`OracleNode::run`] drains the queue
/// forever, [`OracleNode::run_pending`] drains it once inline.
pub struct OracleNode<S, E>
where
    S: DurableStore,
    E: OracleEventBus,
{
    pub(crate) config: Arc<OracleConfig>,
    pub(crate) peers: Arc<PeerManager>,
    pub(crate) records: RecordStore<S>,
    pub(crate) state: Arc<StateProvider>,
    pub(crate) scheduler: Arc<Scheduler>,
    pub(crate) retry: Arc<RetryProvider>,
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) chain: Arc<dyn ChainClient>,
    pub(crate) source: Arc<dyn ObservationSource>,
    pub(crate) signers: Arc<HashMap<String, Arc<dyn ReportSigner>>>,
    event_bus: E,
}

impl<S, E> Clone for OracleNode<S, E>
where
    S: DurableStore,
    E: OracleEventBus,
{
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            peers: Arc::clone(&self.peers),
            records: self.records.clone(),
            state: Arc::clone(&self.state),
            scheduler: Arc::clone(&self.scheduler),
            retry: Arc::clone(&self.retry),
            queue: Arc::clone(&self.queue),
            chain: Arc::clone(&self.chain),
            source: Arc::clone(&self.source),
            signers: Arc::clone(&self.signers),
            event_bus: self.event_bus.clone(),
        }
    }
}

pub type DefaultOracleNode = OracleNode<InMemoryDurableStore, BroadcastEventBus>;

impl DefaultOracleNode {
    pub fn builder(
        config: OracleConfig,
        local_index: u32,
        peer_count: usize,
    ) -> OracleNodeBuilder<InMemoryDurableStore, BroadcastEventBus> {
        OracleNodeBuilder::new(config, local_index, peer_count)
    }
}

pub struct OracleNodeBuilder<S, E>
where
    S: DurableStore,
    E: OracleEventBus,
{
    config: OracleConfig,
    local_index: u32,
    peer_count: usize,
    store: Arc<S>,
    event_bus: E,
    transport: Option<Arc<dyn PeerTransport>>,
    chain: Option<Arc<dyn ChainClient>>,
    source: Option<Arc<dyn ObservationSource>>,
    signers: HashMap<String, Arc<dyn ReportSigner>>,
}

impl OracleNodeBuilder<InMemoryDurableStore, BroadcastEventBus> {
    pub fn new(config: OracleConfig, local_index: u32, peer_count: usize) -> Self {
        Self {
            config,
            local_index,
            peer_count,
            store: Arc::new(InMemoryDurableStore::new()),
            event_bus: BroadcastEventBus::default(),
            transport: None,
            chain: None,
            source: None,
            signers: HashMap::new(),
        }
    }
}

impl<S, E> OracleNodeBuilder<S, E>
where
    S: DurableStore,
    E: OracleEventBus,
{
    pub fn with_store<S2: DurableStore>(self, store: Arc<S2>) -> OracleNodeBuilder<S2, E> {
        OracleNodeBuilder {
            config: self.config,
            local_index: self.local_index,
            peer_count: self.peer_count,
            store,
            event_bus: self.event_bus,
            transport: self.transport,
            chain: self.chain,
            source: self.source,
            signers: self.signers,
        }
    }

    pub fn with_event_bus<E2: OracleEventBus>(self, event_bus: E2) -> OracleNodeBuilder<S, E2> {
        OracleNodeBuilder {
            config: self.config,
            local_index: self.local_index,
            peer_count: self.peer_count,
            store: self.store,
            event_bus,
            transport: self.transport,
            chain: self.chain,
            source: self.source,
            signers: self.signers,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn PeerTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_chain_client(mut self, chain: Arc<dyn ChainClient>) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_observation_source(mut self, source: Arc<dyn ObservationSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Replaces the ECDSA signer derived from the chain's `signer_secret`.
    pub fn with_report_signer(
        mut self,
        chain_id: impl Into<String>,
        signer: Arc<dyn ReportSigner>,
    ) -> Self {
        self.signers.insert(chain_id.into(), signer);
        self
    }

    pub fn build(self) -> Result<OracleNode<S, E>, OracleError> {
        let missing =
            |what: &str| OracleError::InvalidConfiguration(format!("{what} is required"));
        let transport = self.transport.ok_or_else(|| missing("peer transport"))?;
        let chain = self.chain.ok_or_else(|| missing("chain client"))?;
        let source = self.source.ok_or_else(|| missing("observation source"))?;

        let peers = PeerManager::new(self.local_index, self.peer_count, transport)?;
        self.config.validate(self.peer_count, self.local_index)?;

        let mut signers = self.signers;
        for chain_config in self.config.chains.values() {
            if !signers.contains_key(&chain_config.chain_id) {
                let signer: Arc<dyn ReportSigner> =
                    Arc::new(EcdsaReportSigner::new(chain_config.signer()?));
                signers.insert(chain_config.chain_id.clone(), signer);
            }
        }

        let queue = Arc::new(JobQueue::new());
        let retry = RetryProvider::new(
            RetryPolicy::from_config(&self.config.scheduler),
            Arc::clone(&queue),
        );
        let records = RecordStore::new(self.store, self.config.record_ttl);

        info!(
            local_index = self.local_index,
            peer_count = self.peer_count,
            chains = self.config.chains.len(),
            "Oracle node configured"
        );

        Ok(OracleNode {
            config: Arc::new(self.config),
            peers: Arc::new(peers),
            records,
            state: Arc::new(StateProvider::new()),
            scheduler: Arc::new(Scheduler::new(Arc::clone(&queue))),
            retry: Arc::new(retry),
            queue,
            chain,
            source,
            signers: Arc::new(signers),
            event_bus: self.event_bus,
        })
    }
}

impl<S, E> OracleNode<S, E>
where
    S: DurableStore,
    E: OracleEventBus,
{
    pub fn subscribe_to_events(&self) -> E::Receiver {
        self.event_bus.subscribe()
    }

    pub(crate) fn emit_event(&self, key: RequestKey, event: OracleEvent) {
        self.event_bus.publish(key, event);
    }

    pub fn local_index(&self) -> u32 {
        self.peers.local_index()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.peer_count()
    }

    pub fn is_leader(&self, epoch: u64, round_id: u64) -> bool {
        self.peers.is_leader(epoch, round_id)
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn records(&self) -> &RecordStore<S> {
        &self.records
    }

    pub fn pending_jobs(&self) -> usize {
        self.queue.len()
    }

    pub(crate) fn enqueue(&self, job: Job) {
        self.queue.push(job);
    }

    pub(crate) fn chain_config(&self, chain_id: &str) -> Result<&ChainConfig, OracleError> {
        self.config.chain(chain_id)
    }

    pub(crate) fn report_signer(
        &self,
        chain_id: &str,
    ) -> Result<Arc<dyn ReportSigner>, OracleError> {
        self.signers
            .get(chain_id)
            .cloned()
            .ok_or_else(|| OracleError::UnknownChain(chain_id.to_string()))
    }

    pub(crate) fn round_window(&self) -> Duration {
        self.config.scheduler.observation_collect_timeout_window
    }

    pub(crate) fn request_end_window(&self) -> Duration {
        self.config.scheduler.check_request_end_timeout_window
    }

    pub(crate) async fn load_request(
        &self,
        ctx: &RoundContext,
    ) -> Result<Option<Request>, OracleError> {
        self.records.get_request(&ctx.request_key()).await
    }

    /// Runs one step and reports what happened.
    pub async fn execute(&self, job: &Job) -> Result<StepOutcome, OracleError> {
        let ctx = &job.ctx;
        match &job.step {
            Step::Start {
                transaction_id,
                payload,
            } => self.start(ctx, transaction_id, payload.clone()).await,
            Step::StartRound => self.start_round(ctx).await,
            Step::Observe { from, payload } => self.observe(ctx, *from, payload).await,
            Step::Report { from, observation } => self.report(ctx, *from, *observation).await,
            Step::Sign { from, report } => self.sign(ctx, *from, report).await,
            Step::Transmit { from, partial } => self.transmit(ctx, *from, partial.clone()).await,
            Step::Finish {
                from,
                transaction_id,
            } => self.finish(ctx, *from, transaction_id).await,
            Step::Timeout { kind } => self.timeout(ctx, *kind).await,
            Step::Cancel => self.cancel(ctx).await,
        }
    }

    /// Runs one step and routes its outcome. Never fails: errors are logged and the round
    /// timeout takes over.
    pub async fn dispatch(&self, job: Job) {
        match self.execute(&job).await {
            Ok(StepOutcome::Applied) => {
                self.retry.reset(&job);
                debug!(
                    job_id = %job.id,
                    ctx = %job.ctx,
                    step = %job.kind(),
                    "Step applied"
                );
            }
            Ok(StepOutcome::Stale) => {
                debug!(
                    job_id = %job.id,
                    ctx = %job.ctx,
                    step = %job.kind(),
                    "Stale step dropped"
                );
            }
            Ok(StepOutcome::TransientFailure(reason)) => {
                self.retry.retry(job, &reason);
            }
            Err(e) => {
                warn!(
                    job_id = %job.id,
                    chain_id = %job.ctx.chain_id,
                    request_id = %job.ctx.request_id,
                    epoch = job.ctx.epoch,
                    round = job.ctx.round_id,
                    step = %job.kind(),
                    error = %e,
                    "Step failed"
                );
            }
        }
    }

    /// Drains the queue forever, each job on its own task.
    pub async fn run(&self) {
        loop {
            let job = self.queue.next().await;
            let node = self.clone();
            tokio::spawn(async move { node.dispatch(job).await });
        }
    }

    /// Runs queued jobs inline until the queue is empty; returns how many ran.
    pub async fn run_pending(&self) -> usize {
        let mut executed = 0;
        while let Some(job) = self.queue.pop() {
            self.dispatch(job).await;
            executed += 1;
        }
        executed
    }
}
