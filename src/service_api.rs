//! Implementation of [`OracleNodeAPI`] for [`OracleNode`].

use prost::Message;
use tracing::debug;

use crate::{
    api::OracleNodeAPI,
    error::OracleError,
    events::OracleEventBus,
    job::{Job, Step},
    protos::oracle::v1::{PeerMessage, Report, Request, peer_message::Body},
    service::OracleNode,
    storage::DurableStore,
    types::{EpochKey, RequestKey, RequestStartEvent, RoundContext},
};

impl<S, E> OracleNodeAPI<S, E> for OracleNode<S, E>
where
    S: DurableStore,
    E: OracleEventBus,
{
    /// Feed a request-started event from the chain watcher.
    ///
    /// The event is queued as a start step; staleness against the chain's latest round and
    /// the local record is checked when the step runs.
    async fn start_request(&self, event: RequestStartEvent) -> Result<(), OracleError> {
        self.chain_config(&event.chain_id)?;
        let ctx = event.context();
        self.enqueue(Job::new(
            ctx,
            Step::Start {
                transaction_id: event.transaction_id,
                payload: event.payload,
            },
        ));
        Ok(())
    }

    /// Process a message received from peer `from`.
    ///
    /// Messages from unknown indices, from this node itself, for unconfigured chains or
    /// without a body are refused. Everything else becomes the matching step.
    async fn handle_peer_message(
        &self,
        from: u32,
        message: PeerMessage,
    ) -> Result<(), OracleError> {
        self.peers.validate_sender(from)?;
        self.chain_config(&message.chain_id)?;

        let ctx = RoundContext::of_message(&message);
        let kind = message.kind();
        let step = match message.body.ok_or(OracleError::EmptyMessageBody)? {
            Body::RequestJob(job) => Step::Observe {
                from: Some(from),
                payload: job.payload,
            },
            Body::RequestData(data) => Step::Report {
                from,
                observation: data.observation.ok_or(OracleError::EmptyMessageBody)?,
            },
            Body::RequestReport(report) => Step::Sign {
                from,
                report: report.report.ok_or(OracleError::EmptyMessageBody)?,
            },
            Body::RequestReportSignature(signature) => Step::Transmit {
                from,
                partial: signature.partial.ok_or(OracleError::EmptyMessageBody)?,
            },
            Body::TransmittedResult(result) => Step::Finish {
                from: Some(from),
                transaction_id: result.transaction_id,
            },
        };
        debug!(ctx = %ctx, from, kind, "Peer message received");
        self.enqueue(Job::new(ctx, step));
        Ok(())
    }

    /// Decode a prost-encoded [`PeerMessage`] and process it.
    async fn handle_peer_bytes(&self, from: u32, bytes: &[u8]) -> Result<(), OracleError> {
        let message = PeerMessage::decode(bytes)?;
        self.handle_peer_message(from, message).await
    }

    /// Cancel a request at its current epoch. Its timers stop and it becomes terminal.
    async fn cancel_request(&self, key: &RequestKey) -> Result<(), OracleError> {
        let request = self
            .records
            .get_request(key)
            .await?
            .ok_or(OracleError::RequestNotFound)?;
        self.enqueue(Job::new(RoundContext::of_request(&request), Step::Cancel));
        Ok(())
    }

    async fn get_request(&self, key: &RequestKey) -> Result<Option<Request>, OracleError> {
        self.records.get_request(key).await
    }

    async fn get_report(&self, key: &EpochKey) -> Result<Option<Report>, OracleError> {
        self.records.get_report(key).await
    }
}
