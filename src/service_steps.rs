//! Step handlers of the request lifecycle.
//!
//! Each handler checks its preconditions against the persisted [`Request`], does its work and
//! hands the next step to the job queue. A failed precondition is [`StepOutcome::Stale`].

use std::cmp::Ordering;
use tracing::{debug, info, warn};

use crate::{
    chain::TransactionStatus,
    error::OracleError,
    events::{OracleEvent, OracleEventBus},
    job::{Job, Priority, Step},
    multisig::AggregateSignature,
    protos::oracle::v1::{
        DataMessage, Observation, PartialSignature, Report, Request, RequestData, RequestJob,
        RequestReport, RequestReportSignature, RequestState, TransmitPayload, TransmittedResult,
        peer_message::Body,
    },
    scheduler::SchedulerType,
    service::OracleNode,
    state::{Flag, ObservationTransition, SignatureTransition},
    storage::DurableStore,
    types::{RoundContext, StepOutcome},
    utils::{
        advance_reference, compute_report_digest, current_timestamp, duration_millis,
        verify_partial_signature,
    },
};

/// Timers tied to a single round; cancelled together when the round is left.
const ROUND_TIMERS: [SchedulerType; 3] = [
    SchedulerType::ObservationCollectWaiting,
    SchedulerType::CheckReportReceive,
    SchedulerType::CheckTransmit,
];

/// How a message's epoch relates to the local request.
fn epoch_gate(ctx: &RoundContext, request: &Request) -> Option<StepOutcome> {
    match ctx.epoch.cmp(&request.epoch) {
        Ordering::Less => Some(StepOutcome::Stale),
        // Our own start event for that epoch has not been processed yet.
        Ordering::Greater => Some(StepOutcome::not_ready("request epoch not started locally")),
        Ordering::Equal => None,
    }
}

impl<S, E> OracleNode<S, E>
where
    S: DurableStore,
    E: OracleEventBus,
{
    pub(crate) async fn start(
        &self,
        ctx: &RoundContext,
        transaction_id: &str,
        payload: Vec<u8>,
    ) -> Result<StepOutcome, OracleError> {
        let key = ctx.request_key();
        let latest = self.chain.get_latest_round(&ctx.chain_id).await?;
        if ctx.epoch < latest {
            debug!(ctx = %ctx, latest, "Start event behind the chain's latest round");
            return Ok(StepOutcome::Stale);
        }

        let request = {
            let _guard = self.records.lock_request(&key).await;
            if let Some(existing) = self.records.get_request(&key).await?
                && ctx.epoch <= existing.epoch
            {
                debug!(
                    ctx = %ctx,
                    current = existing.epoch,
                    "Start event not newer than local record"
                );
                return Ok(StepOutcome::Stale);
            }

            let payload = if payload.is_empty() && !transaction_id.is_empty() {
                self.chain
                    .get_commitment(&ctx.chain_id, transaction_id, &ctx.request_id)
                    .await?
            } else {
                payload
            };

            // The previous epoch is over for this node, whatever state it reached.
            self.scheduler.cancel_all(&key);
            self.retry.clear_request(&key);
            self.state.retain_from_epoch(&key, ctx.epoch);

            let request = Request::start(ctx, payload, current_timestamp()?);
            self.records.save_request(&request).await?;
            request
        };

        info!(ctx = %ctx, leader = self.peers.leader_index(ctx.epoch, 0), "Request started");
        self.emit_event(key, OracleEvent::RequestStarted { epoch: ctx.epoch });
        self.begin_round(&request).await
    }

    pub(crate) async fn start_round(&self, ctx: &RoundContext) -> Result<StepOutcome, OracleError> {
        let Some(request) = self.load_request(ctx).await? else {
            return Ok(StepOutcome::Stale);
        };
        if request.is_terminal() || request.epoch != ctx.epoch || request.round_id != ctx.round_id
        {
            return Ok(StepOutcome::Stale);
        }
        self.begin_round(&request).await
    }

    async fn begin_round(&self, request: &Request) -> Result<StepOutcome, OracleError> {
        let ctx = RoundContext::of_request(request);
        let window = self.round_window();

        if !self.peers.is_leader(ctx.epoch, ctx.round_id) {
            self.scheduler.arm(
                &ctx,
                SchedulerType::CheckReportReceive,
                request.receive_time,
                window,
            )?;
            return Ok(StepOutcome::Applied);
        }

        if let Some(report) = self.records.get_report(&ctx.epoch_key()).await? {
            debug!(ctx = %ctx, "Redistributing the epoch's report");
            self.scheduler
                .arm(&ctx, SchedulerType::CheckTransmit, request.receive_time, window)?;
            self.peers
                .broadcast(ctx.message(Body::RequestReport(RequestReport {
                    report: Some(report.clone()),
                })))
                .await;
            self.enqueue(Job::new(
                ctx,
                Step::Sign {
                    from: self.peers.local_index(),
                    report,
                },
            ));
            return Ok(StepOutcome::Applied);
        }

        self.peers
            .broadcast(ctx.message(Body::RequestJob(RequestJob {
                payload: request.payload.clone(),
            })))
            .await;
        self.scheduler.arm(
            &ctx,
            SchedulerType::ObservationCollectWaiting,
            request.receive_time,
            window,
        )?;
        self.enqueue(Job::new(
            ctx,
            Step::Observe {
                from: None,
                payload: request.payload.clone(),
            },
        ));
        Ok(StepOutcome::Applied)
    }

    /// Moves a lagging request to the later round `ctx` a legitimate leader is already in.
    async fn fast_forward(&self, ctx: &RoundContext) -> Result<Request, OracleError> {
        let key = ctx.request_key();
        let window = duration_millis(self.round_window());
        let now = current_timestamp()?;
        let target = ctx.clone();
        let request = self
            .records
            .update_request(&key, move |r| {
                if !r.is_terminal() && r.epoch == target.epoch && r.round_id < target.round_id {
                    r.round_id = target.round_id;
                    r.set_state(RequestState::RequestStart);
                    r.transaction_id.clear();
                    r.retrying = true;
                    r.receive_time = advance_reference(r.receive_time, window, now);
                }
                r.clone()
            })
            .await?;
        for kind in ROUND_TIMERS {
            self.scheduler.cancel(&key, kind);
        }
        info!(ctx = %ctx, "Fast-forwarded to the leader's round");
        Ok(request)
    }

    pub(crate) async fn observe(
        &self,
        ctx: &RoundContext,
        from: Option<u32>,
        payload: &[u8],
    ) -> Result<StepOutcome, OracleError> {
        let Some(mut request) = self.load_request(ctx).await? else {
            return Ok(StepOutcome::not_ready("request not persisted yet"));
        };
        if request.is_terminal() {
            return Ok(StepOutcome::Stale);
        }
        if let Some(outcome) = epoch_gate(ctx, &request) {
            return Ok(outcome);
        }

        let leader = self.peers.leader_index(ctx.epoch, ctx.round_id);
        match from {
            None => {
                if leader != self.peers.local_index() || ctx.round_id != request.round_id {
                    return Ok(StepOutcome::Stale);
                }
            }
            Some(sender) => {
                if sender != leader {
                    warn!(
                        ctx = %ctx,
                        sender,
                        leader,
                        "RequestJob from a peer that is not the round leader"
                    );
                    return Ok(StepOutcome::Stale);
                }
                if ctx.round_id < request.round_id {
                    return Ok(StepOutcome::Stale);
                }
                if ctx.round_id > request.round_id {
                    request = self.fast_forward(ctx).await?;
                }
                if payload != request.payload.as_slice() {
                    debug!(ctx = %ctx, "Leader job payload differs from the local commitment");
                }
                self.scheduler.arm(
                    ctx,
                    SchedulerType::CheckReportReceive,
                    request.receive_time,
                    self.round_window(),
                )?;
            }
        }

        // One measurement per epoch; later rounds resend the same value.
        let epoch_key = ctx.epoch_key();
        let stored = self
            .records
            .get_data_message(&epoch_key)
            .await?
            .and_then(|message| message.observation);
        let value = match stored {
            Some(observation) => observation.value,
            None => match self.source.observe(&request).await? {
                Some(value) => value,
                None => {
                    debug!(ctx = %ctx, "Nothing to contribute this round");
                    return Ok(StepOutcome::Applied);
                }
            },
        };

        let now = current_timestamp()?;
        let observation = Observation {
            index: self.peers.local_index(),
            value,
        };
        self.records
            .save_data_message(&DataMessage {
                chain_id: ctx.chain_id.clone(),
                request_id: ctx.request_id.clone(),
                epoch: ctx.epoch,
                round_id: ctx.round_id,
                observation: Some(observation),
                sent_time: now,
            })
            .await?;

        let round = ctx.round_id;
        self.records
            .update_request(&ctx.request_key(), move |r| {
                if r.round_id == round {
                    r.advance_state(RequestState::ObservationResultCommitted);
                    r.observation_committed_time = now;
                    r.send_time = now;
                }
            })
            .await?;
        self.emit_event(
            ctx.request_key(),
            OracleEvent::ObservationCommitted {
                epoch: ctx.epoch,
                round_id: ctx.round_id,
            },
        );

        if from.is_none() {
            self.enqueue(Job::new(
                ctx.clone(),
                Step::Report {
                    from: observation.index,
                    observation,
                },
            ));
        } else {
            self.peers
                .send_to_leader(ctx.message(Body::RequestData(RequestData {
                    observation: Some(observation),
                })))
                .await;
        }
        Ok(StepOutcome::Applied)
    }

    pub(crate) async fn report(
        &self,
        ctx: &RoundContext,
        from: u32,
        observation: Observation,
    ) -> Result<StepOutcome, OracleError> {
        if from != observation.index {
            warn!(
                ctx = %ctx,
                from,
                index = observation.index,
                "Observation index does not match its sender"
            );
            return Ok(StepOutcome::Stale);
        }
        if observation.index as usize >= self.peers.peer_count()
            || !self.peers.is_leader(ctx.epoch, ctx.round_id)
        {
            return Ok(StepOutcome::Stale);
        }

        let Some(request) = self.load_request(ctx).await? else {
            return Ok(StepOutcome::not_ready("request not persisted yet"));
        };
        if request.is_terminal() {
            return Ok(StepOutcome::Stale);
        }
        if let Some(outcome) = epoch_gate(ctx, &request) {
            return Ok(outcome);
        }
        match ctx.round_id.cmp(&request.round_id) {
            Ordering::Less => return Ok(StepOutcome::Stale),
            Ordering::Greater => return Ok(StepOutcome::not_ready("round not started locally")),
            Ordering::Equal => {}
        }

        let threshold = self.chain_config(&ctx.chain_id)?.observations_threshold;
        match self
            .state
            .submit_observation(&ctx.epoch_key(), observation, threshold)
        {
            ObservationTransition::Duplicate => Ok(StepOutcome::Stale),
            ObservationTransition::Collected { count } => {
                debug!(ctx = %ctx, count, threshold, "Observation collected");
                Ok(StepOutcome::Applied)
            }
            ObservationTransition::ThresholdReached(observations) => {
                let generated = self.generate_report(ctx, &request, &observations).await;
                if generated.is_err() {
                    // Let the next round's resend of the local observation try again.
                    self.state.clear_flag(
                        &ctx.request_key(),
                        Flag::ReportGenerated { epoch: ctx.epoch },
                    );
                }
                generated
            }
        }
    }

    async fn generate_report(
        &self,
        ctx: &RoundContext,
        request: &Request,
        observations: &[Observation],
    ) -> Result<StepOutcome, OracleError> {
        let key = ctx.request_key();
        let now = current_timestamp()?;

        let report = match self.records.get_report(&ctx.epoch_key()).await? {
            Some(existing) => existing,
            None => {
                let report =
                    Report::from_observations(ctx, self.peers.peer_count(), observations, now);
                self.records.save_report(&report).await?;
                report
            }
        };

        self.scheduler
            .cancel(&key, SchedulerType::ObservationCollectWaiting);
        self.scheduler.arm(
            ctx,
            SchedulerType::CheckTransmit,
            request.receive_time,
            self.round_window(),
        )?;

        let round = ctx.round_id;
        self.records
            .update_request(&key, move |r| {
                if r.round_id == round {
                    r.advance_state(RequestState::ReportGenerated);
                    r.report_generated_time = now;
                }
            })
            .await?;

        info!(ctx = %ctx, observers = ?report.observers, "Report generated");
        self.emit_event(
            key,
            OracleEvent::ReportGenerated {
                epoch: ctx.epoch,
                round_id: ctx.round_id,
            },
        );

        self.peers
            .broadcast(ctx.message(Body::RequestReport(RequestReport {
                report: Some(report.clone()),
            })))
            .await;
        self.enqueue(Job::new(
            ctx.clone(),
            Step::Sign {
                from: self.peers.local_index(),
                report,
            },
        ));
        Ok(StepOutcome::Applied)
    }

    /// Shape and content checks of a report distributed for `ctx`.
    fn is_well_formed(&self, ctx: &RoundContext, report: &Report, threshold: usize) -> bool {
        let peer_count = self.peers.peer_count();
        report.chain_id == ctx.chain_id
            && report.request_id == ctx.request_id
            && report.epoch == ctx.epoch
            && report.values.len() == peer_count
            && report.observers.len() >= threshold
            && report.observers.windows(2).all(|pair| pair[0] < pair[1])
            && report
                .observers
                .last()
                .is_none_or(|index| (*index as usize) < peer_count)
    }

    pub(crate) async fn sign(
        &self,
        ctx: &RoundContext,
        from: u32,
        report: &Report,
    ) -> Result<StepOutcome, OracleError> {
        let leader = self.peers.leader_index(ctx.epoch, ctx.round_id);
        if from != leader {
            warn!(ctx = %ctx, from, leader, "Report from a peer that is not the round leader");
            return Ok(StepOutcome::Stale);
        }

        let Some(mut request) = self.load_request(ctx).await? else {
            return Ok(StepOutcome::not_ready("request not persisted yet"));
        };
        if request.is_terminal() {
            return Ok(StepOutcome::Stale);
        }
        if let Some(outcome) = epoch_gate(ctx, &request) {
            return Ok(outcome);
        }
        if ctx.round_id < request.round_id {
            debug!(ctx = %ctx, current = request.round_id, "Report from an earlier round");
            return Ok(StepOutcome::Stale);
        }

        let chain = self.chain_config(&ctx.chain_id)?;
        if !self.is_well_formed(ctx, report, chain.observations_threshold) {
            warn!(ctx = %ctx, "Malformed report refused");
            return Ok(StepOutcome::Stale);
        }

        let digest = compute_report_digest(report, &chain.distributed_public_key);
        let epoch_key = ctx.epoch_key();
        let stored = self.records.get_report(&epoch_key).await?;
        if let Some(stored) = &stored
            && compute_report_digest(stored, &chain.distributed_public_key) != digest
        {
            warn!(ctx = %ctx, "Report conflicts with the one already stored for the epoch");
            return Ok(StepOutcome::Stale);
        }

        let local = self.peers.local_index();
        if report.has_observer(local) {
            let own = self
                .records
                .get_data_message(&epoch_key)
                .await?
                .and_then(|message| message.observation)
                .map(|observation| observation.value);
            if own.is_none() || own != report.value_of(local) {
                warn!(
                    ctx = %ctx,
                    own = ?own,
                    reported = ?report.value_of(local),
                    "Report misrepresents the local observation"
                );
                return Ok(StepOutcome::Stale);
            }
        }

        if ctx.round_id > request.round_id {
            request = self.fast_forward(ctx).await?;
        }

        if !self.state.try_set_flag(
            &ctx.request_key(),
            Flag::PartialSigned {
                epoch: ctx.epoch,
                round_id: ctx.round_id,
            },
        ) {
            return Ok(StepOutcome::Stale);
        }

        if stored.is_none() {
            self.records.save_report(report).await?;
        }

        let signature = self
            .report_signer(&ctx.chain_id)?
            .sign_digest(&digest)
            .await?;
        let partial = PartialSignature {
            index: local,
            signature,
        };

        let now = current_timestamp()?;
        let round = ctx.round_id;
        self.records
            .update_request(&ctx.request_key(), move |r| {
                if r.round_id == round && r.report_generated_time == 0 {
                    r.report_generated_time = now;
                }
                if r.round_id == round {
                    r.advance_state(RequestState::ReportGenerated);
                }
            })
            .await?;

        if from == local {
            self.enqueue(Job::new(ctx.clone(), Step::Transmit { from, partial }));
        } else {
            self.peers
                .send(
                    leader,
                    ctx.message(Body::RequestReportSignature(RequestReportSignature {
                        partial: Some(partial),
                    })),
                )
                .await;
            let key = ctx.request_key();
            self.scheduler
                .cancel(&key, SchedulerType::CheckReportReceive);
            self.scheduler.arm(
                ctx,
                SchedulerType::CheckTransmit,
                request.receive_time,
                self.round_window(),
            )?;
        }
        debug!(ctx = %ctx, digest = %digest, "Report signed");
        Ok(StepOutcome::Applied)
    }

    pub(crate) async fn transmit(
        &self,
        ctx: &RoundContext,
        from: u32,
        partial: PartialSignature,
    ) -> Result<StepOutcome, OracleError> {
        if partial.index != from || !self.peers.is_leader(ctx.epoch, ctx.round_id) {
            return Ok(StepOutcome::Stale);
        }

        let Some(request) = self.load_request(ctx).await? else {
            return Ok(StepOutcome::not_ready("request not persisted yet"));
        };
        if request.is_terminal() {
            return Ok(StepOutcome::Stale);
        }
        if let Some(outcome) = epoch_gate(ctx, &request) {
            return Ok(outcome);
        }
        match ctx.round_id.cmp(&request.round_id) {
            Ordering::Less => return Ok(StepOutcome::Stale),
            Ordering::Greater => return Ok(StepOutcome::not_ready("round not started locally")),
            Ordering::Equal => {}
        }

        let Some(report) = self.records.get_report(&ctx.epoch_key()).await? else {
            return Ok(StepOutcome::not_ready("report not stored yet"));
        };
        let chain = self.chain_config(&ctx.chain_id)?;
        let digest = compute_report_digest(&report, &chain.distributed_public_key);

        match verify_partial_signature(&partial, &digest, &chain.signers) {
            Ok(true) => {}
            Ok(false) => {
                warn!(ctx = %ctx, from, "Partial signature does not match the signer");
                return Ok(StepOutcome::Stale);
            }
            Err(e) => {
                warn!(ctx = %ctx, from, error = %e, "Malformed partial signature");
                return Ok(StepOutcome::Stale);
            }
        }

        match self.state.add_partial_signature(
            &ctx.round_key(),
            digest,
            partial,
            chain.partial_signatures_threshold,
        ) {
            SignatureTransition::Duplicate => Ok(StepOutcome::Stale),
            SignatureTransition::DigestMismatch => {
                warn!(ctx = %ctx, from, "Partial signature for another report digest");
                Ok(StepOutcome::Stale)
            }
            SignatureTransition::Collected { count } => {
                debug!(
                    ctx = %ctx,
                    count,
                    threshold = chain.partial_signatures_threshold,
                    "Partial signature collected"
                );
                Ok(StepOutcome::Applied)
            }
            SignatureTransition::Signed(aggregate) => {
                self.submit_report(ctx, report, aggregate).await
            }
        }
    }

    async fn submit_report(
        &self,
        ctx: &RoundContext,
        report: Report,
        aggregate: AggregateSignature,
    ) -> Result<StepOutcome, OracleError> {
        let key = ctx.request_key();
        let round = ctx.round_id;

        let signed_at = current_timestamp()?;
        self.records
            .update_request(&key, move |r| {
                if r.round_id == round {
                    r.advance_state(RequestState::ReportSigned);
                    r.report_signed_time = signed_at;
                }
            })
            .await?;
        self.emit_event(
            key.clone(),
            OracleEvent::ReportSigned {
                epoch: ctx.epoch,
                round_id: ctx.round_id,
            },
        );

        let chain = self.chain_config(&ctx.chain_id)?;
        let payload = TransmitPayload {
            chain_id: ctx.chain_id.clone(),
            request_id: ctx.request_id.clone(),
            epoch: ctx.epoch,
            round_id: ctx.round_id,
            report: Some(report),
            signatures: aggregate.signatures,
            distributed_public_key: chain.distributed_public_key.clone(),
        };
        let transaction_id = self.chain.submit_transmit(&ctx.chain_id, payload).await?;

        let now = current_timestamp()?;
        let tx = transaction_id.clone();
        self.records
            .update_request(&key, move |r| {
                if r.round_id == round {
                    r.advance_state(RequestState::RequestTransmitted);
                    r.transmitted_time = now;
                    r.transaction_id = tx;
                }
            })
            .await?;

        info!(ctx = %ctx, transaction_id = %transaction_id, "Report transmitted");
        self.emit_event(
            key.clone(),
            OracleEvent::Transmitted {
                epoch: ctx.epoch,
                round_id: ctx.round_id,
                transaction_id: transaction_id.clone(),
            },
        );
        self.peers
            .broadcast(ctx.message(Body::TransmittedResult(TransmittedResult {
                transaction_id: transaction_id.clone(),
            })))
            .await;

        for kind in ROUND_TIMERS {
            self.scheduler.cancel(&key, kind);
        }
        self.scheduler.arm(
            ctx,
            SchedulerType::CheckRequestEnd,
            now,
            self.request_end_window(),
        )?;
        self.enqueue(Job::new(
            ctx.clone(),
            Step::Finish {
                from: None,
                transaction_id,
            },
        ));
        Ok(StepOutcome::Applied)
    }

    pub(crate) async fn finish(
        &self,
        ctx: &RoundContext,
        from: Option<u32>,
        transaction_id: &str,
    ) -> Result<StepOutcome, OracleError> {
        if transaction_id.is_empty() {
            return Ok(StepOutcome::Stale);
        }
        let Some(request) = self.load_request(ctx).await? else {
            return Ok(StepOutcome::not_ready("request not persisted yet"));
        };
        if request.is_terminal() {
            return Ok(StepOutcome::Stale);
        }
        if let Some(outcome) = epoch_gate(ctx, &request) {
            return Ok(outcome);
        }

        let key = ctx.request_key();
        if let Some(sender) = from {
            // Inclusion is what matters, so any round of the epoch is accepted.
            if sender != self.peers.leader_index(ctx.epoch, ctx.round_id) {
                warn!(
                    ctx = %ctx,
                    sender,
                    "TransmittedResult from a peer that is not the round leader"
                );
                return Ok(StepOutcome::Stale);
            }
            if request.transaction_id != transaction_id {
                let now = current_timestamp()?;
                let tx = transaction_id.to_string();
                self.records
                    .update_request(&key, move |r| {
                        r.advance_state(RequestState::RequestTransmitted);
                        r.transmitted_time = now;
                        r.transaction_id = tx;
                    })
                    .await?;
                for kind in ROUND_TIMERS {
                    self.scheduler.cancel(&key, kind);
                }
                let current = ctx.with_round(request.round_id);
                self.scheduler.arm(
                    &current,
                    SchedulerType::CheckRequestEnd,
                    now,
                    self.request_end_window(),
                )?;
            }
        }

        let result = self
            .chain
            .get_transaction_result(&ctx.chain_id, transaction_id)
            .await?;
        match result.status {
            TransactionStatus::Mined => self.end_request(ctx).await,
            TransactionStatus::Pending => Ok(StepOutcome::not_ready("transaction pending")),
            TransactionStatus::Failed => {
                warn!(
                    ctx = %ctx,
                    transaction_id,
                    error = result.error.as_deref().unwrap_or("unknown"),
                    "Transmit transaction failed"
                );
                Ok(StepOutcome::Applied)
            }
        }
    }

    async fn end_request(&self, ctx: &RoundContext) -> Result<StepOutcome, OracleError> {
        let key = ctx.request_key();
        if !self
            .state
            .try_set_flag(&key, Flag::Finished { epoch: ctx.epoch })
        {
            return Ok(StepOutcome::Stale);
        }

        let epoch = ctx.epoch;
        let ended: Result<bool, OracleError> = async {
            let now = current_timestamp()?;
            self.records
                .update_request(&key, move |r| {
                    if r.is_terminal() || r.epoch != epoch {
                        return false;
                    }
                    r.advance_state(RequestState::RequestEnd);
                    r.end_time = now;
                    true
                })
                .await
        }
        .await;
        let ended = match ended {
            Ok(ended) => ended,
            Err(e) => {
                self.state.clear_flag(&key, Flag::Finished { epoch });
                return Err(e);
            }
        };
        if !ended {
            return Ok(StepOutcome::Stale);
        }

        self.scheduler.cancel_all(&key);
        self.retry.clear_request(&key);
        self.state.clear_request(&key);
        info!(ctx = %ctx, "Request ended");
        self.emit_event(key, OracleEvent::RequestEnded { epoch });
        Ok(StepOutcome::Applied)
    }

    pub(crate) async fn timeout(
        &self,
        ctx: &RoundContext,
        kind: SchedulerType,
    ) -> Result<StepOutcome, OracleError> {
        let Some(request) = self.load_request(ctx).await? else {
            return Ok(StepOutcome::Stale);
        };
        if request.is_terminal() || request.epoch != ctx.epoch || request.round_id != ctx.round_id
        {
            return Ok(StepOutcome::Stale);
        }

        if kind == SchedulerType::CheckRequestEnd && !request.transaction_id.is_empty() {
            match self
                .chain
                .get_transaction_result(&ctx.chain_id, &request.transaction_id)
                .await
            {
                Ok(result) if result.status == TransactionStatus::Mined => {
                    return self.end_request(ctx).await;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(ctx = %ctx, error = %e, "Failed to re-check the transmit transaction");
                }
            }
        }

        self.advance_round(ctx, kind).await
    }

    async fn advance_round(
        &self,
        ctx: &RoundContext,
        cause: SchedulerType,
    ) -> Result<StepOutcome, OracleError> {
        let key = ctx.request_key();
        let window = duration_millis(self.round_window());
        let now = current_timestamp()?;
        let expected = ctx.clone();
        let next_round = self
            .records
            .update_request(&key, move |r| {
                if r.is_terminal() || r.epoch != expected.epoch || r.round_id != expected.round_id
                {
                    return None;
                }
                r.round_id += 1;
                r.receive_time = advance_reference(r.receive_time, window, now);
                r.send_time = advance_reference(r.send_time, window, now);
                r.set_state(RequestState::RequestStart);
                r.transaction_id.clear();
                r.retrying = true;
                Some(r.round_id)
            })
            .await?;
        let Some(round_id) = next_round else {
            return Ok(StepOutcome::Stale);
        };

        self.scheduler.cancel_all(&key);
        info!(
            ctx = %ctx,
            cause = %cause,
            round = round_id,
            leader = self.peers.leader_index(ctx.epoch, round_id),
            "Round advanced"
        );
        self.emit_event(
            key,
            OracleEvent::RoundAdvanced {
                epoch: ctx.epoch,
                round_id,
                cause,
            },
        );
        self.enqueue(
            Job::new(ctx.with_round(round_id), Step::StartRound).with_priority(Priority::High),
        );
        Ok(StepOutcome::Applied)
    }

    pub(crate) async fn cancel(&self, ctx: &RoundContext) -> Result<StepOutcome, OracleError> {
        let key = ctx.request_key();
        let now = current_timestamp()?;
        let epoch = ctx.epoch;
        let canceled = self
            .records
            .update_request(&key, move |r| {
                if r.is_terminal() || r.epoch != epoch {
                    return false;
                }
                r.set_state(RequestState::RequestCanceled);
                r.end_time = now;
                true
            })
            .await;
        match canceled {
            Ok(true) => {}
            Ok(false) | Err(OracleError::RequestNotFound) => return Ok(StepOutcome::Stale),
            Err(e) => return Err(e),
        }

        self.scheduler.cancel_all(&key);
        self.retry.clear_request(&key);
        self.state.clear_request(&key);
        info!(ctx = %ctx, "Request canceled");
        self.emit_event(key, OracleEvent::RequestCanceled { epoch });
        Ok(StepOutcome::Applied)
    }
}
