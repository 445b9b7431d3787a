use std::fmt;

use crate::protos::oracle::v1::{
    Observation, PeerMessage, Report, Request, RequestState, peer_message::Body,
};

/// Identity of a request on a chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey {
    pub chain_id: String,
    pub request_id: String,
}

impl RequestKey {
    pub fn new(chain_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            request_id: request_id.into(),
        }
    }

    pub fn at_epoch(&self, epoch: u64) -> EpochKey {
        EpochKey {
            request: self.clone(),
            epoch,
        }
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.chain_id, self.request_id)
    }
}

/// Scope of observation sets, reports and the one-per-epoch flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EpochKey {
    pub request: RequestKey,
    pub epoch: u64,
}

impl EpochKey {
    pub fn at_round(&self, round_id: u64) -> RoundKey {
        RoundKey {
            request: self.request.clone(),
            epoch: self.epoch,
            round_id,
        }
    }
}

/// Scope of signature accumulators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundKey {
    pub request: RequestKey,
    pub epoch: u64,
    pub round_id: u64,
}

/// The `(chainId, requestId, epoch, roundId)` tuple every step and peer message carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoundContext {
    pub chain_id: String,
    pub request_id: String,
    pub epoch: u64,
    pub round_id: u64,
}

impl RoundContext {
    pub fn new(
        chain_id: impl Into<String>,
        request_id: impl Into<String>,
        epoch: u64,
        round_id: u64,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            request_id: request_id.into(),
            epoch,
            round_id,
        }
    }

    pub fn of_request(request: &Request) -> Self {
        Self::new(
            request.chain_id.clone(),
            request.request_id.clone(),
            request.epoch,
            request.round_id,
        )
    }

    pub fn of_message(message: &PeerMessage) -> Self {
        Self::new(
            message.chain_id.clone(),
            message.request_id.clone(),
            message.epoch,
            message.round_id,
        )
    }

    pub fn request_key(&self) -> RequestKey {
        RequestKey::new(self.chain_id.clone(), self.request_id.clone())
    }

    pub fn epoch_key(&self) -> EpochKey {
        self.request_key().at_epoch(self.epoch)
    }

    pub fn round_key(&self) -> RoundKey {
        self.epoch_key().at_round(self.round_id)
    }

    pub fn with_round(&self, round_id: u64) -> Self {
        Self {
            round_id,
            ..self.clone()
        }
    }

    pub fn message(&self, body: Body) -> PeerMessage {
        PeerMessage {
            chain_id: self.chain_id.clone(),
            request_id: self.request_id.clone(),
            epoch: self.epoch,
            round_id: self.round_id,
            body: Some(body),
        }
    }
}

impl fmt::Display for RoundContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}.{}",
            self.chain_id, self.request_id, self.epoch, self.round_id
        )
    }
}

/// Result of running one step.
///
/// Infrastructure failures are reported through `Err` instead and are left to the round
/// timeout; only `TransientFailure` is re-enqueued by the retry provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step changed state or emitted work.
    Applied,
    /// Duplicate, late or otherwise superseded input. Dropped silently.
    Stale,
    /// A dependency is not there yet (e.g. the request has not been persisted).
    TransientFailure(String),
}

impl StepOutcome {
    pub fn not_ready(reason: impl Into<String>) -> Self {
        StepOutcome::TransientFailure(reason.into())
    }
}

/// Emitted by the chain watcher when a request is started on-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestStartEvent {
    pub chain_id: String,
    pub request_id: String,
    pub epoch: u64,
    /// Transaction that started the request; used to fetch the commitment when the
    /// payload is not delivered with the event.
    pub transaction_id: String,
    pub payload: Vec<u8>,
}

impl RequestStartEvent {
    pub fn new(chain_id: impl Into<String>, request_id: impl Into<String>, epoch: u64) -> Self {
        Self {
            chain_id: chain_id.into(),
            request_id: request_id.into(),
            epoch,
            transaction_id: String::new(),
            payload: Vec::new(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = transaction_id.into();
        self
    }

    pub fn context(&self) -> RoundContext {
        RoundContext::new(self.chain_id.clone(), self.request_id.clone(), self.epoch, 0)
    }
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestState::RequestEnd | RequestState::RequestCanceled)
    }
}

impl Request {
    /// Fresh record for round 0 of `ctx.epoch`.
    pub fn start(ctx: &RoundContext, payload: Vec<u8>, now: u64) -> Self {
        Self {
            chain_id: ctx.chain_id.clone(),
            request_id: ctx.request_id.clone(),
            epoch: ctx.epoch,
            round_id: 0,
            state: RequestState::RequestStart as i32,
            payload,
            start_time: now,
            receive_time: now,
            ..Default::default()
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey::new(self.chain_id.clone(), self.request_id.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Moves the state forward; never moves it backwards.
    pub fn advance_state(&mut self, state: RequestState) {
        if state > self.state() {
            self.set_state(state);
        }
    }
}

impl Report {
    /// Builds the epoch report from the collected observations. Slots of peers that did not
    /// contribute are zero-filled and left out of `observers`.
    pub fn from_observations(
        ctx: &RoundContext,
        peer_count: usize,
        observations: &[Observation],
        now: u64,
    ) -> Self {
        let mut values = vec![0i64; peer_count];
        let mut observers = Vec::with_capacity(observations.len());
        for observation in observations {
            let slot = observation.index as usize;
            if slot < peer_count {
                values[slot] = observation.value;
                observers.push(observation.index);
            }
        }
        observers.sort_unstable();
        observers.dedup();

        Self {
            chain_id: ctx.chain_id.clone(),
            request_id: ctx.request_id.clone(),
            epoch: ctx.epoch,
            values,
            observers,
            created_time: now,
        }
    }

    pub fn has_observer(&self, index: u32) -> bool {
        self.observers.binary_search(&index).is_ok()
    }

    /// Value contributed by `index`, or `None` when that slot is only zero-fill.
    pub fn value_of(&self, index: u32) -> Option<i64> {
        if self.has_observer(index) {
            self.values.get(index as usize).copied()
        } else {
            None
        }
    }
}

impl PeerMessage {
    pub fn kind(&self) -> &'static str {
        match &self.body {
            Some(Body::RequestJob(_)) => "RequestJob",
            Some(Body::RequestData(_)) => "RequestData",
            Some(Body::RequestReport(_)) => "RequestReport",
            Some(Body::RequestReportSignature(_)) => "RequestReportSignature",
            Some(Body::TransmittedResult(_)) => "TransmittedResult",
            None => "Empty",
        }
    }
}
