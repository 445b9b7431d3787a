use crate::{
    error::OracleError,
    events::OracleEventBus,
    protos::oracle::v1::{PeerMessage, Report, Request},
    storage::DurableStore,
    types::{EpochKey, RequestKey, RequestStartEvent},
};

pub trait OracleNodeAPI<S, E>
where
    S: DurableStore,
    E: OracleEventBus,
{
    fn start_request(
        &self,
        event: RequestStartEvent,
    ) -> impl Future<Output = Result<(), OracleError>> + Send;

    fn handle_peer_message(
        &self,
        from: u32,
        message: PeerMessage,
    ) -> impl Future<Output = Result<(), OracleError>> + Send;
    fn handle_peer_bytes(
        &self,
        from: u32,
        bytes: &[u8],
    ) -> impl Future<Output = Result<(), OracleError>> + Send;

    fn cancel_request(
        &self,
        key: &RequestKey,
    ) -> impl Future<Output = Result<(), OracleError>> + Send;

    fn get_request(
        &self,
        key: &RequestKey,
    ) -> impl Future<Output = Result<Option<Request>, OracleError>> + Send;
    fn get_report(
        &self,
        key: &EpochKey,
    ) -> impl Future<Output = Result<Option<Report>, OracleError>> + Send;
}
