//! Read fan-out across services.
//!
//! Two read modes share the same per-host splitting:
//!
//! * `get` walks the services one at a time, retrying failed keys within a
//!   service after a shard-cache invalidation before failing over to the
//!   next one. Cheap when the first service is healthy.
//! * `future_get` asks every service at once and merges answers through a
//!   shared collector. The call resolves when every RPC has terminated, or
//!   earlier: once one service has delivered a full copy, the remaining
//!   services get one grace window to improve the answer and then the
//!   result is sealed.

use log::{error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use eddy_core::collector::{GetResultCollector, ScanShardResultCollector};
use eddy_core::error::ClientError;
use eddy_core::model::{
    GetDataRequest, GetDataResult, GetOutcome, Key, KeyUpdateTime, ReadResult, ScanShardRequest,
    ScanShardResult, ShardId, StatusCode,
};
use eddy_core::network::{
    ConfigurationAdapter, GetRequestMap, NetworkClient, NetworkClientFactory,
    DEFAULT_NETWORK_TIMEOUT_MS,
};
use eddy_core::stats::Stats;

use crate::config::ClientOptions;
use crate::registry::ReadRegistry;

pub struct ReadFanout {
    registry: Arc<ReadRegistry>,
    adapter: Arc<dyn ConfigurationAdapter>,
    factory: Arc<dyn NetworkClientFactory>,
    stats: Arc<Stats>,
    throw_on_transient_failure: bool,
    compare_reads: bool,
    parallel_scan_shard: bool,
}

impl ReadFanout {
    pub fn new(
        registry: Arc<ReadRegistry>,
        adapter: Arc<dyn ConfigurationAdapter>,
        factory: Arc<dyn NetworkClientFactory>,
        stats: Arc<Stats>,
        options: &ClientOptions,
        throw_on_transient_failure: bool,
    ) -> Self {
        Self {
            registry,
            adapter,
            factory,
            stats,
            throw_on_transient_failure,
            compare_reads: options.compare_reads,
            parallel_scan_shard: options.parallel_scan_shard,
        }
    }

    /// The services this read should talk to.
    ///
    /// An override narrows the snapshot to the named service. A valid
    /// service missing from the snapshot gets a temporary client that is
    /// never cached; an invalid one is counted and the full snapshot is
    /// used.
    fn all_read_clients(&self, service_override: Option<&str>) -> Vec<Arc<dyn NetworkClient>> {
        let snapshot = self.registry.snapshot();
        let clients: Vec<Arc<dyn NetworkClient>> = snapshot.as_ref().clone();

        if let Some(name) = service_override {
            if let Some(client) = clients.iter().find(|c| c.is_corresponding_service(name)) {
                return vec![client.clone()];
            }

            if !self.adapter.is_valid_read_service(name) {
                self.stats.bad_read_services.fetch_add(1, Ordering::Relaxed);
            } else {
                match self.factory.create(name, false) {
                    Ok(client) => return vec![client],
                    Err(e) => {
                        error!(
                            "failed to build override read client, service: {}, error: {}",
                            name, e
                        );
                    }
                }
            }
        }

        clients
    }

    /// Sequential read with per-service retry and failover.
    pub async fn get(
        &self,
        request: &GetDataRequest,
        service_override: Option<&str>,
    ) -> Result<GetOutcome> {
        let clients = self.all_read_clients(service_override);
        if clients.is_empty() {
            return Err(ClientError::NoReadServices.into());
        }

        // The network client rewrites shard ids as it learns ownership, so
        // remember the caller's ids for the next service.
        let key_shards: HashMap<String, ShardId> = request
            .keys
            .iter()
            .map(|key| (key.name.clone(), key.shard_id))
            .collect();

        let mut client_request = request.clone();
        let mut outcome = GetOutcome::default();
        let num_clients = clients.len();

        for (i, client) in clients.iter().enumerate() {
            let last = i + 1 == num_clients;
            if i > 0 {
                self.stats.read_failover.fetch_add(1, Ordering::Relaxed);
                info!("retrying with failover service: {}", client.service_name());
            }

            // On the last service, keys with partial data count as success.
            // Strict mode keeps collecting in-progress shards to the end so
            // they can fail the call.
            let collect_in_progress = self.throw_on_transient_failure || !last;
            let collect_missing_data = !last;

            let mut failed = Vec::new();
            let mut partial = Vec::new();

            self.get_with_client(
                client,
                &client_request,
                &mut outcome,
                &mut failed,
                &mut partial,
                collect_in_progress,
                collect_missing_data,
            )
            .await?;

            if !failed.is_empty() {
                // One retry within the service after re-resolving shard
                // owners. In-progress shards are left alone, the next
                // service will answer for them.
                let shard_ids: HashSet<ShardId> = failed.iter().map(|k| k.shard_id).collect();
                client.invalidate_cache(&shard_ids);

                client_request.keys = std::mem::take(&mut failed);
                self.get_with_client(
                    client,
                    &client_request,
                    &mut outcome,
                    &mut failed,
                    &mut partial,
                    collect_in_progress,
                    collect_missing_data,
                )
                .await?;
            }

            if failed.is_empty() && partial.is_empty() {
                return Ok(outcome);
            }

            if last {
                if self.throw_on_transient_failure {
                    return Err(ClientError::TransientFailure {
                        services: clients
                            .iter()
                            .map(|c| c.service_name().to_string())
                            .collect(),
                    }
                    .into());
                }
                break;
            }

            // Carry everything unresolved to the next service, with the
            // original shard ids restored.
            failed.append(&mut partial);
            for key in failed.iter_mut() {
                if let Some(shard_id) = key_shards.get(&key.name) {
                    key.shard_id = *shard_id;
                }
            }
            client_request.keys = std::mem::take(&mut failed);
        }

        Ok(outcome)
    }

    /// One round against one service: split per host, fetch hosts in
    /// parallel, classify every key.
    #[allow(clippy::too_many_arguments)]
    async fn get_with_client(
        &self,
        client: &Arc<dyn NetworkClient>,
        request: &GetDataRequest,
        outcome: &mut GetOutcome,
        failed: &mut Vec<Key>,
        partial: &mut Vec<Key>,
        collect_in_progress: bool,
        collect_missing_data: bool,
    ) -> Result<()> {
        let mut requests = GetRequestMap::new();
        for (index, key) in request.keys.iter().enumerate() {
            client.add_key_to_get_request(index, key, &mut requests);
        }
        for host_request in requests.values_mut() {
            host_request.request.begin = request.begin;
            host_request.request.end = request.end;
        }

        let mut join_set = JoinSet::new();
        for (host, host_request) in requests {
            let client = client.clone();
            join_set.spawn(async move {
                let result = client.perform_get(&host, &host_request.request).await;
                (host, host_request.request, result)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (host, host_request, result) = match joined {
                Ok(v) => v,
                Err(e) => {
                    error!("host read task failed, error: {}", e);
                    continue;
                }
            };

            match result {
                Ok(result) => self.classify_host_results(
                    &host_request,
                    result,
                    outcome,
                    failed,
                    partial,
                    collect_in_progress,
                    collect_missing_data,
                )?,
                Err(e) => {
                    warn!("read from host failed, host: {}, error: {}", host, e);
                    failed.extend(host_request.keys.iter().cloned());
                }
            }
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn classify_host_results(
        &self,
        request: &GetDataRequest,
        result: GetDataResult,
        outcome: &mut GetOutcome,
        failed: &mut Vec<Key>,
        partial: &mut Vec<Key>,
        collect_in_progress: bool,
        collect_missing_data: bool,
    ) -> Result<()> {
        // A server answering fewer keys than asked is not retried. It
        // should not happen.
        if request.keys.len() != result.results.len() {
            error!(
                "mismatch between number of request keys: {} and result size: {}",
                request.keys.len(),
                result.results.len()
            );
        }

        for (key, res) in request.keys.iter().zip(result.results) {
            match res.status {
                StatusCode::Ok => {
                    outcome.keys.push(key.clone());
                    outcome.results.push(res);
                }
                StatusCode::KeyMissing => {
                    // Don't retry on a missing key.
                }
                StatusCode::RpcFail | StatusCode::StorageFail | StatusCode::DontOwnShard => {
                    failed.push(key.clone());
                }
                StatusCode::ShardInProgress => {
                    if collect_in_progress {
                        partial.push(key.clone());
                    } else if !res.data.is_empty() {
                        outcome.keys.push(key.clone());
                        outcome.results.push(res);
                    }
                }
                StatusCode::MissingTooMuchData => {
                    self.stats
                        .redirect_for_missing_data
                        .fetch_add(1, Ordering::Relaxed);
                    if collect_missing_data {
                        info!(
                            "service reported gaps, will retry elsewhere, key: {}",
                            key.name
                        );
                        partial.push(key.clone());
                    } else if !res.data.is_empty() {
                        outcome.keys.push(key.clone());
                        outcome.results.push(res);
                    }
                }
                StatusCode::BucketNotFinalized => {
                    return Err(ClientError::ProtocolViolation.into());
                }
            }
        }

        Ok(())
    }

    /// Parallel read racing every service, merged through the collector.
    pub async fn future_get(
        &self,
        request: &GetDataRequest,
        service_override: Option<&str>,
    ) -> Result<ReadResult> {
        let clients = self.all_read_clients(service_override);
        if clients.is_empty() {
            return Err(ClientError::NoReadServices.into());
        }

        let service_names: Vec<String> = clients
            .iter()
            .map(|c| c.service_name().to_string())
            .collect();
        let grace_ms = clients
            .iter()
            .map(|c| c.network_timeout_ms())
            .max()
            .unwrap_or(DEFAULT_NETWORK_TIMEOUT_MS);

        let collector = Arc::new(GetResultCollector::new(
            request.keys.len(),
            clients.len(),
            self.compare_reads,
        ));

        let (complete_tx, complete_rx) = oneshot::channel::<()>();
        let complete_tx = Arc::new(Mutex::new(Some(complete_tx)));

        let mut join_set = JoinSet::new();
        for (service, client) in clients.iter().enumerate() {
            let mut requests = GetRequestMap::new();
            for (index, key) in request.keys.iter().enumerate() {
                client.add_key_to_get_request(index, key, &mut requests);
            }
            for host_request in requests.values_mut() {
                host_request.request.begin = request.begin;
                host_request.request.end = request.end;
            }

            for (host, host_request) in requests {
                let client = client.clone();
                let collector = collector.clone();
                let complete_tx = complete_tx.clone();
                join_set.spawn(async move {
                    match client.perform_get(&host, &host_request.request).await {
                        Ok(result) => {
                            if collector.add_results(result, &host_request.indices, service) {
                                if let Some(tx) = complete_tx.lock().unwrap().take() {
                                    let _ = tx.send(());
                                }
                            }
                        }
                        Err(e) => {
                            warn!(
                                "read from service {} host {} failed, error: {}",
                                client.service_name(),
                                host,
                                e
                            );
                        }
                    }
                });
            }
        }

        race_to_completion(join_set, complete_rx, grace_ms).await;

        collector.finalize(
            self.throw_on_transient_failure,
            &service_names,
            request.keys.clone(),
        )
    }

    /// Whole-shard read from the first service.
    pub async fn scan_shard(&self, request: &ScanShardRequest) -> Result<ScanShardResult> {
        let client = match self.registry.first_client() {
            Some(client) => client,
            None => {
                error!("no read services enabled");
                return Ok(ScanShardResult::empty(StatusCode::RpcFail));
            }
        };

        let host = match client.get_host_for_scan_shard(request) {
            Some(host) => host,
            None => {
                warn!(
                    "no host owns shard {} in service {}",
                    request.shard_id,
                    client.service_name()
                );
                return Ok(ScanShardResult::empty(StatusCode::RpcFail));
            }
        };

        match client.perform_scan_shard(&host, request).await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(
                    "scan shard failed, shard: {}, service: {}, error: {}",
                    request.shard_id,
                    client.service_name(),
                    e
                );
                Ok(ScanShardResult::empty(StatusCode::RpcFail))
            }
        }
    }

    /// Whole-shard read racing services when fan-out is enabled, otherwise
    /// asking just the first one.
    pub async fn future_scan_shard(
        &self,
        request: &ScanShardRequest,
        service_override: Option<&str>,
    ) -> Result<ScanShardResult> {
        let mut clients = self.all_read_clients(service_override);
        if clients.is_empty() {
            return Err(ClientError::NoReadServices.into());
        }
        if !self.parallel_scan_shard {
            clients.truncate(1);
        }

        let service_names: Vec<String> = clients
            .iter()
            .map(|c| c.service_name().to_string())
            .collect();
        let grace_ms = clients
            .iter()
            .map(|c| c.network_timeout_ms())
            .max()
            .unwrap_or(DEFAULT_NETWORK_TIMEOUT_MS);

        let collector = Arc::new(ScanShardResultCollector::new());
        let (complete_tx, complete_rx) = oneshot::channel::<()>();
        let complete_tx = Arc::new(Mutex::new(Some(complete_tx)));

        let mut join_set = JoinSet::new();
        for (service, client) in clients.iter().enumerate() {
            let host = match client.get_host_for_scan_shard(request) {
                Some(host) => host,
                None => continue,
            };

            let client = client.clone();
            let collector = collector.clone();
            let complete_tx = complete_tx.clone();
            let request = request.clone();
            join_set.spawn(async move {
                match client.perform_scan_shard(&host, &request).await {
                    Ok(result) => {
                        if collector.add_result(result, service) {
                            if let Some(tx) = complete_tx.lock().unwrap().take() {
                                let _ = tx.send(());
                            }
                        }
                    }
                    Err(e) => {
                        warn!(
                            "scan shard from service {} failed, shard: {}, error: {}",
                            client.service_name(),
                            request.shard_id,
                            e
                        );
                    }
                }
            });
        }

        race_to_completion(join_set, complete_rx, grace_ms).await;

        collector.finalize(self.throw_on_transient_failure, &service_names)
    }

    /// Stream key freshness from the first service.
    pub async fn get_last_update_times(
        &self,
        min_last_update_time: i64,
        max_keys_per_request: usize,
        timeout_secs: u64,
        callback: &mut (dyn FnMut(&[KeyUpdateTime]) -> bool + Send),
    ) -> Result<()> {
        let client = match self.registry.first_client() {
            Some(client) => client,
            None => {
                error!("no read services enabled");
                return Ok(());
            }
        };

        client
            .get_last_update_times(
                min_last_update_time,
                max_keys_per_request,
                timeout_secs,
                callback,
            )
            .await
    }

    /// Cancel outstanding calls on the first service.
    pub fn stop_requests(&self) {
        match self.registry.first_client() {
            Some(client) => client.stop_requests(),
            None => error!("no read services enabled"),
        }
    }
}

/// Block until either every RPC has terminated, or one service delivered a
/// full copy and the grace window for the rest has elapsed. Unfinished RPCs
/// are abandoned when this returns.
async fn race_to_completion(
    mut join_set: JoinSet<()>,
    one_complete: oneshot::Receiver<()>,
    grace_ms: u64,
) {
    let grace = async move {
        if one_complete.await.is_ok() {
            tokio::time::sleep(Duration::from_millis(grace_ms)).await;
        } else {
            // No full copy ever arrived; only the all-done arm can fire.
            std::future::pending::<()>().await;
        }
    };

    let all_done = async move {
        while join_set.join_next().await.is_some() {}
    };

    tokio::select! {
        _ = grace => {}
        _ = all_done => {}
    }
}
