//! Result collectors for fan-out reads.
//!
//! Every service answering a read folds its partial results into one shared
//! collector. Merging is monotonic: a slot only changes when the incoming
//! status dominates what is already there, so late answers can never make
//! the result worse, whatever order the RPCs complete in.
//!
//! The collector also tracks, per service, which slots that service has
//! answered. The first service to cover every slot flips the "one complete"
//! signal, which the read path uses to arm its grace timer.

use log::{error, warn};
use std::sync::Mutex;

use crate::error::ClientError;
use crate::model::{
    GetDataResult, Key, KeySeries, ReadResult, ScanShardResult, StatusCode, TimeSeriesBlock,
};

/// Position of a status in the dominance ladder. Higher wins.
fn status_rank(status: StatusCode, has_data: bool) -> u8 {
    match status {
        StatusCode::Ok => 6,
        _ if has_data => 5,
        StatusCode::ShardInProgress => 4,
        StatusCode::MissingTooMuchData => 3,
        StatusCode::RpcFail | StatusCode::StorageFail | StatusCode::DontOwnShard => 2,
        StatusCode::KeyMissing => 1,
        StatusCode::BucketNotFinalized => 0,
    }
}

/// Ranks at or above this carry usable data.
const RANK_HAS_DATA: u8 = 5;
const RANK_UNFILLED: u8 = 0;

#[derive(Clone)]
struct Slot {
    rank: u8,
    status: Option<StatusCode>,
    blocks: Vec<TimeSeriesBlock>,
}

struct CollectorState {
    slots: Vec<Slot>,

    /// `received[service][slot]`: has that service answered for that slot,
    /// with any status at all.
    received: Vec<Vec<bool>>,

    /// Unanswered slots per service. Zero means a full copy.
    remaining: Vec<usize>,

    any_complete: bool,

    /// Payloads kept around for compare-reads mode: `(slot, service,
    /// blocks)` of every OK answer.
    ok_payloads: Vec<(usize, usize, Vec<TimeSeriesBlock>)>,

    /// Set when a server returned a non-finalized bucket.
    protocol_violation: bool,
}

pub struct GetResultCollector {
    state: Mutex<CollectorState>,
    num_keys: usize,
    compare_reads: bool,
}

impl GetResultCollector {
    pub fn new(num_keys: usize, num_services: usize, compare_reads: bool) -> Self {
        let state = CollectorState {
            slots: vec![
                Slot {
                    rank: RANK_UNFILLED,
                    status: None,
                    blocks: Vec::new(),
                };
                num_keys
            ],
            received: vec![vec![false; num_keys]; num_services],
            remaining: vec![num_keys; num_services],
            any_complete: false,
            ok_payloads: Vec::new(),
            protocol_violation: false,
        };

        Self {
            state: Mutex::new(state),
            num_keys,
            compare_reads,
        }
    }

    /// Fold one per-host answer from `service` into the shared slots.
    /// `indices[i]` is the request-level slot of `result.results[i]`.
    ///
    /// Returns `true` the first time any service has answered every slot.
    pub fn add_results(&self, result: GetDataResult, indices: &[usize], service: usize) -> bool {
        if result.results.len() != indices.len() {
            error!(
                "mismatch between result size: {} and requested keys: {}, service index: {}",
                result.results.len(),
                indices.len(),
                service
            );
        }

        let mut state = self.state.lock().unwrap();

        for (i, res) in result.results.into_iter().enumerate() {
            if i >= indices.len() {
                break;
            }
            let slot_index = indices[i];
            if slot_index >= state.slots.len() {
                error!(
                    "slot index {} out of range, request has {} keys",
                    slot_index,
                    state.slots.len()
                );
                continue;
            }

            if res.status == StatusCode::BucketNotFinalized {
                state.protocol_violation = true;
            }

            if self.compare_reads && res.status == StatusCode::Ok {
                state
                    .ok_payloads
                    .push((slot_index, service, res.data.clone()));
            }

            let rank = status_rank(res.status, !res.data.is_empty());
            let slot = &mut state.slots[slot_index];
            if rank > slot.rank {
                slot.rank = rank;
                slot.status = Some(res.status);
                slot.blocks = res.data;
            }

            if !state.received[service][slot_index] {
                state.received[service][slot_index] = true;
                state.remaining[service] -= 1;
            }
        }

        if state.remaining[service] == 0 && !state.any_complete {
            state.any_complete = true;
            return true;
        }

        false
    }

    /// Assemble the final per-key result in request order.
    ///
    /// With `should_throw`, a slot whose best answer is transient fails the
    /// whole call; a key missing from every service stays an empty series
    /// either way.
    pub fn finalize(
        &self,
        should_throw: bool,
        service_names: &[String],
        keys: Vec<Key>,
    ) -> anyhow::Result<ReadResult> {
        let state = self.state.lock().unwrap();

        if state.protocol_violation {
            return Err(ClientError::ProtocolViolation.into());
        }

        if keys.len() != self.num_keys {
            error!(
                "finalize called with {} keys, collector sized for {}",
                keys.len(),
                self.num_keys
            );
        }

        if should_throw {
            let unresolved = state
                .slots
                .iter()
                .filter(|slot| {
                    slot.rank < RANK_HAS_DATA && !matches!(slot.status, Some(StatusCode::KeyMissing))
                })
                .count();
            if unresolved > 0 {
                return Err(ClientError::TransientFailure {
                    services: service_names.to_vec(),
                }
                .into());
            }
        }

        if self.compare_reads {
            self.log_mismatches(&state);
        }

        let results = keys
            .into_iter()
            .zip(state.slots.iter())
            .map(|(key, slot)| {
                let blocks = if slot.rank >= RANK_HAS_DATA {
                    slot.blocks.clone()
                } else {
                    Vec::new()
                };
                KeySeries {
                    key,
                    status: slot.status,
                    blocks,
                }
            })
            .collect();

        Ok(ReadResult { results })
    }

    /// OK answers that disagree across services, counted for tests and
    /// logged for operators. Only populated in compare-reads mode.
    pub fn compare_mismatches(&self) -> u64 {
        let state = self.state.lock().unwrap();
        self.count_mismatches(&state)
    }

    fn count_mismatches(&self, state: &CollectorState) -> u64 {
        let mut mismatches = 0;
        for slot_index in 0..self.num_keys {
            let mut payloads = state
                .ok_payloads
                .iter()
                .filter(|(slot, _, _)| *slot == slot_index);
            if let Some((_, _, first)) = payloads.next() {
                if payloads.any(|(_, _, other)| other != first) {
                    mismatches += 1;
                }
            }
        }
        mismatches
    }

    fn log_mismatches(&self, state: &CollectorState) {
        let mismatches = self.count_mismatches(state);
        if mismatches > 0 {
            warn!(
                "data mismatch between services on {} of {} keys",
                mismatches, self.num_keys
            );
        }
    }
}

/// Race-and-merge for whole-shard scans. Each service contributes at most
/// one result; the best one under the status ladder wins.
pub struct ScanShardResultCollector {
    state: Mutex<ScanState>,
}

struct ScanState {
    best: Option<ScanShardResult>,
    best_rank: u8,
    any_complete: bool,
    protocol_violation: bool,
}

impl ScanShardResultCollector {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ScanState {
                best: None,
                best_rank: RANK_UNFILLED,
                any_complete: false,
                protocol_violation: false,
            }),
        }
    }

    /// Fold one service's scan answer. Returns `true` the first time a full
    /// copy (status `Ok`) arrives.
    pub fn add_result(&self, result: ScanShardResult, _service: usize) -> bool {
        let mut state = self.state.lock().unwrap();

        if result.status == StatusCode::BucketNotFinalized {
            state.protocol_violation = true;
            return false;
        }

        let rank = status_rank(result.status, !result.keys.is_empty());
        let complete = result.status == StatusCode::Ok;
        if rank > state.best_rank || state.best.is_none() {
            state.best_rank = rank;
            state.best = Some(result);
        }

        if complete && !state.any_complete {
            state.any_complete = true;
            return true;
        }

        false
    }

    pub fn finalize(
        &self,
        should_throw: bool,
        service_names: &[String],
    ) -> anyhow::Result<ScanShardResult> {
        let mut state = self.state.lock().unwrap();

        if state.protocol_violation {
            return Err(ClientError::ProtocolViolation.into());
        }

        match state.best.take() {
            Some(result) => {
                if should_throw && state.best_rank < RANK_HAS_DATA {
                    return Err(ClientError::TransientFailure {
                        services: service_names.to_vec(),
                    }
                    .into());
                }
                Ok(result)
            }
            None => {
                if should_throw {
                    return Err(ClientError::TransientFailure {
                        services: service_names.to_vec(),
                    }
                    .into());
                }
                Ok(ScanShardResult::empty(StatusCode::RpcFail))
            }
        }
    }
}

impl Default for ScanShardResultCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Key, TimeSeriesResult};
    use crate::tool::setup_log;

    fn keys(names: &[&str]) -> Vec<Key> {
        names.iter().map(|n| Key::new(*n, 1)).collect()
    }

    fn block(tag: u8) -> TimeSeriesBlock {
        TimeSeriesBlock {
            count: 4,
            data: vec![tag; 8],
        }
    }

    fn ok_with_data(tag: u8) -> TimeSeriesResult {
        TimeSeriesResult::with_data(StatusCode::Ok, vec![block(tag)])
    }

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("service{}", i)).collect()
    }

    #[test]
    fn test_merge_across_services() {
        setup_log();

        // Service 0: [OK, KEY_MISSING, RPC_FAIL]; service 1 answers the
        // complement. Everything should resolve, even in strict mode.
        let collector = GetResultCollector::new(3, 2, false);

        let complete = collector.add_results(
            GetDataResult {
                results: vec![
                    ok_with_data(1),
                    TimeSeriesResult::new(StatusCode::KeyMissing),
                    TimeSeriesResult::new(StatusCode::RpcFail),
                ],
            },
            &[0, 1, 2],
            0,
        );
        assert!(complete);

        let complete = collector.add_results(
            GetDataResult {
                results: vec![
                    TimeSeriesResult::new(StatusCode::KeyMissing),
                    ok_with_data(2),
                    ok_with_data(3),
                ],
            },
            &[0, 1, 2],
            1,
        );
        assert!(!complete);

        let result = collector
            .finalize(true, &names(2), keys(&["a", "b", "c"]))
            .unwrap();

        assert_eq!(result.results.len(), 3);
        assert_eq!(result.results[0].status, Some(StatusCode::Ok));
        assert_eq!(result.results[0].blocks, vec![block(1)]);
        assert_eq!(result.results[1].blocks, vec![block(2)]);
        assert_eq!(result.results[2].blocks, vec![block(3)]);
    }

    #[test]
    fn test_key_order_preserved() {
        setup_log();

        let collector = GetResultCollector::new(3, 1, false);

        // Deliver out of order via the index mapping.
        collector.add_results(
            GetDataResult {
                results: vec![ok_with_data(9), ok_with_data(7)],
            },
            &[2, 0],
            0,
        );
        collector.add_results(
            GetDataResult {
                results: vec![ok_with_data(8)],
            },
            &[1],
            0,
        );

        let result = collector
            .finalize(false, &names(1), keys(&["a", "b", "c"]))
            .unwrap();

        let got: Vec<String> = result.results.iter().map(|r| r.key.name.clone()).collect();
        assert_eq!(got, vec!["a", "b", "c"]);
        assert_eq!(result.results[0].blocks, vec![block(7)]);
        assert_eq!(result.results[1].blocks, vec![block(8)]);
        assert_eq!(result.results[2].blocks, vec![block(9)]);
    }

    #[test]
    fn test_merge_is_monotonic() {
        setup_log();

        // Whatever the delivery order, the surviving status is the ladder
        // maximum.
        let statuses = [
            TimeSeriesResult::new(StatusCode::RpcFail),
            TimeSeriesResult::with_data(StatusCode::ShardInProgress, vec![block(5)]),
            TimeSeriesResult::new(StatusCode::KeyMissing),
        ];

        let orders: Vec<Vec<usize>> = vec![
            vec![0, 1, 2],
            vec![0, 2, 1],
            vec![1, 0, 2],
            vec![1, 2, 0],
            vec![2, 0, 1],
            vec![2, 1, 0],
        ];

        for order in orders {
            let collector = GetResultCollector::new(1, 3, false);
            for (service, idx) in order.iter().enumerate() {
                collector.add_results(
                    GetDataResult {
                        results: vec![statuses[*idx].clone()],
                    },
                    &[0],
                    service,
                );
            }

            let result = collector.finalize(false, &names(3), keys(&["a"])).unwrap();
            assert_eq!(result.results[0].status, Some(StatusCode::ShardInProgress));
            assert_eq!(result.results[0].blocks, vec![block(5)]);
        }
    }

    #[test]
    fn test_one_complete_fires_once_per_full_copy() {
        setup_log();

        let collector = GetResultCollector::new(2, 2, false);

        // Half an answer does not complete anything.
        assert!(!collector.add_results(
            GetDataResult {
                results: vec![ok_with_data(1)],
            },
            &[0],
            0,
        ));

        // Slow service finishing second must not re-fire.
        assert!(collector.add_results(
            GetDataResult {
                results: vec![TimeSeriesResult::new(StatusCode::RpcFail)],
            },
            &[1],
            0,
        ));
        assert!(!collector.add_results(
            GetDataResult {
                results: vec![ok_with_data(1), ok_with_data(2)],
            },
            &[0, 1],
            1,
        ));
    }

    #[test]
    fn test_strict_mode_transient_failure() {
        setup_log();

        let collector = GetResultCollector::new(1, 3, false);
        for service in 0..3 {
            collector.add_results(
                GetDataResult {
                    results: vec![TimeSeriesResult::new(StatusCode::RpcFail)],
                },
                &[0],
                service,
            );
        }

        let err = collector
            .finalize(true, &names(3), keys(&["a"]))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::TransientFailure { .. })
        ));

        // Non-strict: the slot comes back as an empty series.
        let result = collector.finalize(false, &names(3), keys(&["a"])).unwrap();
        assert_eq!(result.results[0].status, Some(StatusCode::RpcFail));
        assert!(result.results[0].blocks.is_empty());
    }

    #[test]
    fn test_missing_key_is_not_an_error() {
        setup_log();

        let collector = GetResultCollector::new(1, 1, false);
        collector.add_results(
            GetDataResult {
                results: vec![TimeSeriesResult::new(StatusCode::KeyMissing)],
            },
            &[0],
            0,
        );

        let result = collector.finalize(true, &names(1), keys(&["a"])).unwrap();
        assert_eq!(result.results[0].status, Some(StatusCode::KeyMissing));
        assert!(result.results[0].blocks.is_empty());
    }

    #[test]
    fn test_bucket_not_finalized_is_a_protocol_violation() {
        setup_log();

        let collector = GetResultCollector::new(1, 1, false);
        collector.add_results(
            GetDataResult {
                results: vec![TimeSeriesResult::new(StatusCode::BucketNotFinalized)],
            },
            &[0],
            0,
        );

        let err = collector
            .finalize(false, &names(1), keys(&["a"]))
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ClientError>(),
            Some(ClientError::ProtocolViolation)
        ));
    }

    #[test]
    fn test_compare_reads_counts_mismatches() {
        setup_log();

        let collector = GetResultCollector::new(2, 2, true);
        collector.add_results(
            GetDataResult {
                results: vec![ok_with_data(1), ok_with_data(2)],
            },
            &[0, 1],
            0,
        );
        collector.add_results(
            GetDataResult {
                results: vec![ok_with_data(1), ok_with_data(9)],
            },
            &[0, 1],
            1,
        );

        assert_eq!(collector.compare_mismatches(), 1);
    }

    #[test]
    fn test_scan_collector_keeps_best() {
        setup_log();

        let collector = ScanShardResultCollector::new();

        assert!(!collector.add_result(ScanShardResult::empty(StatusCode::RpcFail), 0));

        let full = ScanShardResult {
            status: StatusCode::Ok,
            keys: vec!["a".to_string(), "b".to_string()],
            data: vec![vec![block(1)], vec![block(2)]],
        };
        assert!(collector.add_result(full.clone(), 1));

        let result = collector.finalize(true, &names(2)).unwrap();
        assert_eq!(result, full);
    }

    #[test]
    fn test_scan_collector_strict_failure() {
        setup_log();

        let collector = ScanShardResultCollector::new();
        collector.add_result(ScanShardResult::empty(StatusCode::StorageFail), 0);

        assert!(collector.finalize(true, &names(1)).is_err());
    }
}
