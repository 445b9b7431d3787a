//! Ephemeral per-request consensus state.
//!
//! Everything here lives in memory only. After a restart a node recovers by collecting
//! again, driven by the round timeouts. Each request has its own lock, and every
//! check-then-set sequence runs under that lock.

use alloy::primitives::B256;
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use crate::{
    multisig::{AggregateSignature, MultiSignature, MultiSignatureProgress},
    protos::oracle::v1::{Observation, PartialSignature},
    types::{EpochKey, RequestKey, RoundKey},
};

/// One-shot markers. Setting one that is already set fails, which is what makes the
/// guarded transitions happen once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flag {
    ReportGenerated { epoch: u64 },
    PartialSigned { epoch: u64, round_id: u64 },
    MultiSignatureSigned { epoch: u64, round_id: u64 },
    Finished { epoch: u64 },
}

impl Flag {
    fn epoch(&self) -> u64 {
        match self {
            Flag::ReportGenerated { epoch }
            | Flag::PartialSigned { epoch, .. }
            | Flag::MultiSignatureSigned { epoch, .. }
            | Flag::Finished { epoch } => *epoch,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservationTransition {
    /// An observation for this index is already in the set.
    Duplicate,
    /// Appended; the report is not due (yet, or any more).
    Collected { count: usize },
    /// Appended and the threshold was crossed for the first time this epoch. Carries the
    /// set in index order.
    ThresholdReached(Vec<Observation>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureTransition {
    Duplicate,
    /// The round's accumulator was opened over another digest.
    DigestMismatch,
    Collected { count: usize },
    /// Threshold crossed and the `MultiSignatureSigned` flag was free.
    Signed(AggregateSignature),
}

#[derive(Debug, Default)]
struct RequestEntry {
    observations: BTreeMap<u64, BTreeMap<u32, i64>>,
    accumulators: HashMap<(u64, u64), MultiSignature>,
    flags: HashSet<Flag>,
}

impl RequestEntry {
    fn retain_from_epoch(&mut self, epoch: u64) {
        self.observations.retain(|e, _| *e >= epoch);
        self.accumulators.retain(|(e, _), _| *e >= epoch);
        self.flags.retain(|flag| flag.epoch() >= epoch);
    }
}

#[derive(Debug, Default)]
pub struct StateProvider {
    requests: Mutex<HashMap<RequestKey, Arc<Mutex<RequestEntry>>>>,
}

impl StateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &RequestKey) -> Arc<Mutex<RequestEntry>> {
        let mut requests = self.requests.lock();
        Arc::clone(requests.entry(key.clone()).or_default())
    }

    fn existing(&self, key: &RequestKey) -> Option<Arc<Mutex<RequestEntry>>> {
        self.requests.lock().get(key).cloned()
    }

    /// Appends `observation` to the epoch's set and decides, atomically with the append,
    /// whether the report is due.
    ///
    /// A duplicate still reaches the threshold when the set is complete but the
    /// `ReportGenerated` flag is free again, which is how a failed report write is retried
    /// by the next round's own observation.
    pub fn submit_observation(
        &self,
        key: &EpochKey,
        observation: Observation,
        threshold: usize,
    ) -> ObservationTransition {
        let entry = self.entry(&key.request);
        let mut entry = entry.lock();

        let set = entry.observations.entry(key.epoch).or_default();
        let duplicate = set.contains_key(&observation.index);
        if !duplicate {
            set.insert(observation.index, observation.value);
        }
        let count = set.len();
        if count < threshold {
            return if duplicate {
                ObservationTransition::Duplicate
            } else {
                ObservationTransition::Collected { count }
            };
        }

        let snapshot: Vec<Observation> = set
            .iter()
            .map(|(index, value)| Observation {
                index: *index,
                value: *value,
            })
            .collect();
        if entry.flags.insert(Flag::ReportGenerated { epoch: key.epoch }) {
            ObservationTransition::ThresholdReached(snapshot)
        } else if duplicate {
            ObservationTransition::Duplicate
        } else {
            ObservationTransition::Collected { count }
        }
    }

    pub fn observation_count(&self, key: &EpochKey) -> usize {
        self.existing(&key.request)
            .map(|entry| {
                entry
                    .lock()
                    .observations
                    .get(&key.epoch)
                    .map_or(0, BTreeMap::len)
            })
            .unwrap_or(0)
    }

    /// Feeds a partial signature into the round's accumulator, creating it over `digest` on
    /// first use.
    pub fn add_partial_signature(
        &self,
        key: &RoundKey,
        digest: B256,
        partial: PartialSignature,
        threshold: usize,
    ) -> SignatureTransition {
        let entry = self.entry(&key.request);
        let mut entry = entry.lock();

        let accumulator = entry
            .accumulators
            .entry((key.epoch, key.round_id))
            .or_insert_with(|| MultiSignature::new(digest, threshold));

        if accumulator.digest() != &digest {
            return SignatureTransition::DigestMismatch;
        }
        match accumulator.process(partial) {
            MultiSignatureProgress::Duplicate => return SignatureTransition::Duplicate,
            MultiSignatureProgress::Pending { count } => {
                return SignatureTransition::Collected { count };
            }
            MultiSignatureProgress::Enough | MultiSignatureProgress::AlreadyEnough => {}
        }

        let count = accumulator.count();
        let aggregate = accumulator.aggregate();
        let flag = Flag::MultiSignatureSigned {
            epoch: key.epoch,
            round_id: key.round_id,
        };
        match aggregate {
            Some(aggregate) if entry.flags.insert(flag) => SignatureTransition::Signed(aggregate),
            _ => SignatureTransition::Collected { count },
        }
    }

    pub fn signature_count(&self, key: &RoundKey) -> usize {
        self.existing(&key.request)
            .and_then(|entry| {
                entry
                    .lock()
                    .accumulators
                    .get(&(key.epoch, key.round_id))
                    .map(MultiSignature::count)
            })
            .unwrap_or(0)
    }

    /// Compare-and-set; `true` when this call set the flag.
    pub fn try_set_flag(&self, key: &RequestKey, flag: Flag) -> bool {
        self.entry(key).lock().flags.insert(flag)
    }

    /// Releases `flag` after the write it guarded failed, so the transition can run again.
    pub fn clear_flag(&self, key: &RequestKey, flag: Flag) {
        if let Some(entry) = self.existing(key) {
            entry.lock().flags.remove(&flag);
        }
    }

    pub fn is_flag_set(&self, key: &RequestKey, flag: Flag) -> bool {
        self.existing(key)
            .is_some_and(|entry| entry.lock().flags.contains(&flag))
    }

    /// Drops everything recorded for epochs older than `epoch`.
    pub fn retain_from_epoch(&self, key: &RequestKey, epoch: u64) {
        if let Some(entry) = self.existing(key) {
            entry.lock().retain_from_epoch(epoch);
        }
    }

    pub fn clear_request(&self, key: &RequestKey) {
        self.requests.lock().remove(key);
    }

    pub fn tracked_requests(&self) -> usize {
        self.requests.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn epoch_key() -> EpochKey {
        RequestKey::new("aelf", "r1").at_epoch(5)
    }

    fn obs(index: u32, value: i64) -> Observation {
        Observation { index, value }
    }

    #[test]
    fn duplicate_index_is_dropped_not_overwritten() {
        let state = StateProvider::new();
        let key = epoch_key();

        assert_eq!(
            state.submit_observation(&key, obs(1, 42), 3),
            ObservationTransition::Collected { count: 1 }
        );
        assert_eq!(
            state.submit_observation(&key, obs(1, 7), 3),
            ObservationTransition::Duplicate
        );
        assert_eq!(state.observation_count(&key), 1);
    }

    #[test]
    fn threshold_fires_once_per_epoch() {
        let state = StateProvider::new();
        let key = epoch_key();

        state.submit_observation(&key, obs(3, 42), 3);
        state.submit_observation(&key, obs(1, 42), 3);
        match state.submit_observation(&key, obs(2, 42), 3) {
            ObservationTransition::ThresholdReached(set) => {
                let indices: Vec<u32> = set.iter().map(|o| o.index).collect();
                assert_eq!(indices, vec![1, 2, 3]);
            }
            other => panic!("expected threshold, got {other:?}"),
        }
        assert_eq!(
            state.submit_observation(&key, obs(0, 42), 3),
            ObservationTransition::Collected { count: 4 }
        );

        // A new epoch has its own set and its own flag.
        let next = RequestKey::new("aelf", "r1").at_epoch(6);
        assert_eq!(
            state.submit_observation(&next, obs(0, 1), 1),
            ObservationTransition::ThresholdReached(vec![obs(0, 1)])
        );
    }

    #[test]
    fn concurrent_submissions_generate_one_report() {
        let state = Arc::new(StateProvider::new());
        let key = epoch_key();

        let handles: Vec<_> = (0..16u32)
            .map(|i| {
                let state = Arc::clone(&state);
                let key = key.clone();
                thread::spawn(move || {
                    // Every index delivered twice.
                    let a = state.submit_observation(&key, obs(i % 8, 42), 3);
                    let b = state.submit_observation(&key, obs(i % 8, 42), 3);
                    [a, b]
                })
            })
            .collect();

        let reached = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .filter(|t| matches!(t, ObservationTransition::ThresholdReached(_)))
            .count();
        assert_eq!(reached, 1);
        assert_eq!(state.observation_count(&key), 8);
    }

    #[test]
    fn signatures_sign_once_per_round() {
        let state = StateProvider::new();
        let round = epoch_key().at_round(0);
        let partial = |index| PartialSignature {
            index,
            signature: vec![index as u8; 65],
        };

        assert_eq!(
            state.add_partial_signature(&round, B256::ZERO, partial(0), 2),
            SignatureTransition::Collected { count: 1 }
        );
        assert_eq!(
            state.add_partial_signature(&round, B256::ZERO, partial(0), 2),
            SignatureTransition::Duplicate
        );
        assert!(matches!(
            state.add_partial_signature(&round, B256::ZERO, partial(2), 2),
            SignatureTransition::Signed(_)
        ));
        assert_eq!(
            state.add_partial_signature(&round, B256::ZERO, partial(1), 2),
            SignatureTransition::Collected { count: 3 }
        );

        let next_round = epoch_key().at_round(1);
        assert_eq!(state.signature_count(&next_round), 0);
    }

    #[test]
    fn released_report_flag_lets_a_resend_reach_the_threshold() {
        let state = StateProvider::new();
        let key = epoch_key();

        assert!(matches!(
            state.submit_observation(&key, obs(0, 42), 1),
            ObservationTransition::ThresholdReached(_)
        ));
        assert_eq!(
            state.submit_observation(&key, obs(0, 42), 1),
            ObservationTransition::Duplicate
        );

        state.clear_flag(&key.request, Flag::ReportGenerated { epoch: key.epoch });
        assert_eq!(
            state.submit_observation(&key, obs(0, 7), 1),
            ObservationTransition::ThresholdReached(vec![obs(0, 42)])
        );
        assert_eq!(state.observation_count(&key), 1);
    }

    #[test]
    fn partial_over_another_digest_is_refused() {
        let state = StateProvider::new();
        let round = epoch_key().at_round(0);
        let partial = PartialSignature {
            index: 0,
            signature: vec![0; 65],
        };

        assert_eq!(
            state.add_partial_signature(&round, B256::ZERO, partial.clone(), 2),
            SignatureTransition::Collected { count: 1 }
        );
        assert_eq!(
            state.add_partial_signature(&round, B256::repeat_byte(1), partial, 2),
            SignatureTransition::DigestMismatch
        );
        assert_eq!(state.signature_count(&round), 1);
    }

    #[test]
    fn flags_and_epoch_pruning() {
        let state = StateProvider::new();
        let key = RequestKey::new("aelf", "r1");
        let flag = Flag::Finished { epoch: 5 };

        assert!(state.try_set_flag(&key, flag));
        assert!(!state.try_set_flag(&key, flag));
        assert!(state.is_flag_set(&key, flag));

        state.submit_observation(&key.at_epoch(5), obs(0, 1), 9);
        state.retain_from_epoch(&key, 6);
        assert!(!state.is_flag_set(&key, flag));
        assert_eq!(state.observation_count(&key.at_epoch(5)), 0);

        state.clear_request(&key);
        assert_eq!(state.tracked_requests(), 0);
    }
}
