mod common;

use oracle_round_consensus::{
    api::OracleNodeAPI,
    events::OracleEvent,
    protos::oracle::v1::{
        RequestJob, RequestReport, RequestState, peer_message::Body,
    },
    scheduler::SchedulerType,
    types::{RequestStartEvent, RoundContext},
    utils::current_timestamp,
};

use common::{CHAIN, Cluster, PAYLOAD, REQUEST, drain_events, request_key};

const VALUE: i64 = 42;
// Peer 0 leads round 0 and peer 1 leads round 1.
const EPOCH: u64 = 4;

#[tokio::test]
async fn test_follower_timeout_makes_late_report_stale() {
    let mut cluster = Cluster::new(&[Some(VALUE); 4], 3, 3);
    cluster.network.set_link(0, 2, false);
    let mut follower_events = cluster.subscribe(2);

    cluster.start(EPOCH).await;
    cluster.settle().await;

    // The leader finished without peer 2 ever hearing from it.
    assert_eq!(cluster.chain.submissions().len(), 1);
    let follower = cluster.request(2).await;
    assert_eq!(follower.round_id, 0);
    assert_eq!(follower.state(), RequestState::RequestStart);
    let report = cluster.nodes[0]
        .get_report(&request_key().at_epoch(EPOCH))
        .await
        .unwrap()
        .expect("leader stored the report");

    let before = current_timestamp().unwrap();
    assert_eq!(cluster.fire_timers(2), 1);
    cluster.nodes[2].run_pending().await;

    let follower = cluster.request(2).await;
    assert_eq!(follower.round_id, 1);
    assert_eq!(follower.state(), RequestState::RequestStart);
    assert!(follower.retrying);
    assert!(follower.receive_time > before);
    assert!(
        cluster.nodes[2]
            .scheduler()
            .pending(&request_key(), SchedulerType::CheckReportReceive)
            .is_some()
    );

    let events = drain_events(&mut follower_events);
    assert!(events.contains(&OracleEvent::RoundAdvanced {
        epoch: EPOCH,
        round_id: 1,
        cause: SchedulerType::CheckReportReceive,
    }));

    // The round-0 report finally arrives.
    let late = RoundContext::new(CHAIN, REQUEST, EPOCH, 0).message(Body::RequestReport(
        RequestReport {
            report: Some(report),
        },
    ));
    cluster.nodes[2].handle_peer_message(0, late).await.unwrap();
    cluster.nodes[2].run_pending().await;

    assert!(cluster.drain(0).is_empty(), "no signature for a stale report");
    assert!(
        cluster.nodes[2]
            .get_report(&request_key().at_epoch(EPOCH))
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(cluster.request(2).await.round_id, 1);
}

#[tokio::test]
async fn test_next_leader_redistributes_the_epoch_report() {
    // Peer 3's messages never reach peer 0, so round 0 stays one signature short.
    let mut cluster = Cluster::new(&[Some(VALUE); 4], 3, 4);
    cluster.network.set_link(3, 0, false);
    let mut next_leader_events = cluster.subscribe(1);

    cluster.start(EPOCH).await;
    cluster.settle().await;
    assert!(cluster.chain.submissions().is_empty());
    let first_report = cluster.nodes[0]
        .get_report(&request_key().at_epoch(EPOCH))
        .await
        .unwrap()
        .expect("round 0 report");

    for index in 0..4 {
        assert_eq!(cluster.fire_timers(index), 1, "peer {index}");
    }
    cluster.settle().await;

    let submissions = cluster.chain.submissions();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0].round_id, 1);
    assert_eq!(submissions[0].signatures.len(), 4);
    // Same report as round 0: the report is fixed per epoch.
    assert_eq!(submissions[0].report.as_ref(), Some(&first_report));

    for index in 0..4 {
        let request = cluster.request(index).await;
        assert_eq!(request.state(), RequestState::RequestEnd, "peer {index}");
        assert_eq!(request.round_id, 1);
    }

    let events = drain_events(&mut next_leader_events);
    assert!(events.contains(&OracleEvent::RoundAdvanced {
        epoch: EPOCH,
        round_id: 1,
        cause: SchedulerType::CheckTransmit,
    }));
    assert!(
        !events
            .iter()
            .any(|e| matches!(e, OracleEvent::ReportGenerated { .. })),
        "the report is redistributed, not regenerated"
    );
}

#[tokio::test]
async fn test_follower_fast_forwards_to_leader_round() {
    let mut cluster = Cluster::new(&[Some(VALUE); 4], 3, 3);
    let node = &cluster.nodes[3];
    node.start_request(RequestStartEvent::new(CHAIN, REQUEST, EPOCH).with_payload(PAYLOAD.to_vec()))
        .await
        .unwrap();
    node.run_pending().await;

    // Peer 2 is not the leader of round 1: ignored.
    let round_one = RoundContext::new(CHAIN, REQUEST, EPOCH, 1);
    let job = round_one.message(Body::RequestJob(RequestJob {
        payload: PAYLOAD.to_vec(),
    }));
    node.handle_peer_message(2, job.clone()).await.unwrap();
    node.run_pending().await;
    assert_eq!(cluster.request(3).await.round_id, 0);

    let node = &cluster.nodes[3];
    node.handle_peer_message(1, job).await.unwrap();
    node.run_pending().await;

    let request = cluster.request(3).await;
    assert_eq!(request.round_id, 1);
    assert_eq!(request.state(), RequestState::ObservationResultCommitted);

    let delivered = cluster.drain(1);
    assert_eq!(delivered.len(), 1);
    let (from, message) = &delivered[0];
    assert_eq!(*from, 3);
    assert_eq!(message.round_id, 1);
    assert!(matches!(message.body, Some(Body::RequestData(_))));
}

#[tokio::test]
async fn test_timeout_for_an_old_round_is_ignored() {
    let mut cluster = Cluster::new(&[Some(VALUE); 4], 3, 3);
    cluster.network.set_link(0, 2, false);
    cluster.start(EPOCH).await;
    cluster.settle().await;

    // Fire once to move to round 1, then replay the round-0 timeout by hand.
    cluster.fire_timers(2);
    cluster.nodes[2].run_pending().await;
    assert_eq!(cluster.request(2).await.round_id, 1);

    let stale = oracle_round_consensus::job::Job::new(
        RoundContext::new(CHAIN, REQUEST, EPOCH, 0),
        oracle_round_consensus::job::Step::Timeout {
            kind: SchedulerType::CheckReportReceive,
        },
    );
    let outcome = cluster.nodes[2].execute(&stale).await.unwrap();
    assert_eq!(outcome, oracle_round_consensus::types::StepOutcome::Stale);
    assert_eq!(cluster.request(2).await.round_id, 1);
}
