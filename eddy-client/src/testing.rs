//! Deterministic fakes for driving the client without a wire.
//!
//! `MockNetworkClient` answers reads from a per-key script: each call takes
//! the next scripted response and the last one is sticky, so "fail once then
//! recover" and "always fail" are both one line in a test. Writes land in an
//! inspectable buffer unless a scripted failure bounces them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use eddy_core::model::{
    DataPoint, GetDataRequest, GetDataResult, Key, KeyUpdateTime, ScanShardRequest,
    ScanShardResult, ShardId, StatusCode, TimeSeriesBlock, TimeSeriesResult,
};
use eddy_core::network::{
    ConfigurationAdapter, Endpoint, GetRequestMap, NetworkClient, NetworkClientFactory,
    PutRequestMap,
};

/// A result with one recognizable encoded block.
pub fn ok_result(tag: u8) -> TimeSeriesResult {
    TimeSeriesResult::with_data(
        StatusCode::Ok,
        vec![TimeSeriesBlock {
            count: 1,
            data: vec![tag; 4],
        }],
    )
}

/// A data-less result with the given status.
pub fn status_result(status: StatusCode) -> TimeSeriesResult {
    TimeSeriesResult::new(status)
}

struct Script {
    responses: Vec<TimeSeriesResult>,
    next: usize,
}

impl Script {
    fn advance(&mut self) -> TimeSeriesResult {
        let index = self.next.min(self.responses.len() - 1);
        self.next += 1;
        self.responses[index].clone()
    }
}

pub struct MockNetworkClient {
    service: String,
    shadow: bool,
    num_shards: i64,
    num_hosts: usize,
    timeout_ms: u64,
    rpc_delay_ms: u64,

    /// Total points a request map takes before `add_data_point_to_request`
    /// reports saturation.
    request_point_limit: usize,

    get_script: Mutex<HashMap<String, Script>>,
    unroutable: Mutex<HashSet<String>>,
    reject_names: Mutex<HashSet<String>>,
    put_failures: AtomicUsize,

    accepted: Mutex<Vec<DataPoint>>,
    invalidations: Mutex<Vec<HashSet<ShardId>>>,
    scan_result: Mutex<Option<ScanShardResult>>,
    update_times: Mutex<Vec<KeyUpdateTime>>,

    get_calls: AtomicUsize,
    put_calls: AtomicUsize,
    stopped: AtomicBool,
}

impl MockNetworkClient {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            shadow: false,
            num_shards: 4,
            num_hosts: 1,
            timeout_ms: 100,
            rpc_delay_ms: 0,
            request_point_limit: usize::MAX,
            get_script: Mutex::new(HashMap::new()),
            unroutable: Mutex::new(HashSet::new()),
            reject_names: Mutex::new(HashSet::new()),
            put_failures: AtomicUsize::new(0),
            accepted: Mutex::new(Vec::new()),
            invalidations: Mutex::new(Vec::new()),
            scan_result: Mutex::new(None),
            update_times: Mutex::new(Vec::new()),
            get_calls: AtomicUsize::new(0),
            put_calls: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_shadow(mut self) -> Self {
        self.shadow = true;
        self
    }

    pub fn with_num_shards(mut self, num_shards: i64) -> Self {
        self.num_shards = num_shards;
        self
    }

    pub fn with_hosts(mut self, num_hosts: usize) -> Self {
        self.num_hosts = num_hosts;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_rpc_delay_ms(mut self, rpc_delay_ms: u64) -> Self {
        self.rpc_delay_ms = rpc_delay_ms;
        self
    }

    pub fn with_request_point_limit(mut self, limit: usize) -> Self {
        self.request_point_limit = limit;
        self
    }

    /// Script the per-call answers for one key. The last entry repeats
    /// forever.
    pub fn script_get(&self, key: &str, responses: Vec<TimeSeriesResult>) {
        assert!(!responses.is_empty());
        self.get_script
            .lock()
            .unwrap()
            .insert(key.to_string(), Script { responses, next: 0 });
    }

    /// Reject every point of the next `n` put calls.
    pub fn fail_next_puts(&self, n: usize) {
        self.put_failures.store(n, Ordering::SeqCst);
    }

    /// Always reject points for this key server-side.
    pub fn reject_puts_for(&self, key: &str) {
        self.reject_names.lock().unwrap().insert(key.to_string());
    }

    /// Make this key unroutable at request-build time.
    pub fn set_unroutable(&self, key: &str) {
        self.unroutable.lock().unwrap().insert(key.to_string());
    }

    pub fn set_scan_result(&self, result: ScanShardResult) {
        *self.scan_result.lock().unwrap() = Some(result);
    }

    pub fn set_update_times(&self, times: Vec<KeyUpdateTime>) {
        *self.update_times.lock().unwrap() = times;
    }

    pub fn accepted_points(&self) -> Vec<DataPoint> {
        self.accepted.lock().unwrap().clone()
    }

    pub fn invalidations(&self) -> Vec<HashSet<ShardId>> {
        self.invalidations.lock().unwrap().clone()
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn host_for_shard(&self, shard_id: ShardId) -> Endpoint {
        format!(
            "{}-host{}",
            self.service,
            shard_id.rem_euclid(self.num_hosts as i64)
        )
    }
}

#[async_trait]
impl NetworkClient for MockNetworkClient {
    fn service_name(&self) -> &str {
        &self.service
    }

    fn is_shadow(&self) -> bool {
        self.shadow
    }

    fn num_shards(&self) -> i64 {
        self.num_shards
    }

    fn network_timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    fn add_key_to_get_request(&self, index: usize, key: &Key, requests: &mut GetRequestMap) {
        let host = self.host_for_shard(key.shard_id);
        let entry = requests.entry(host).or_default();
        entry.request.keys.push(key.clone());
        entry.indices.push(index);
    }

    fn add_data_point_to_request(
        &self,
        dp: DataPoint,
        requests: &mut PutRequestMap,
        dropped: &mut Vec<DataPoint>,
    ) -> bool {
        if self.unroutable.lock().unwrap().contains(&dp.key.name) {
            dropped.push(dp);
        } else {
            let host = self.host_for_shard(dp.key.shard_id);
            requests.entry(host).or_default().push(dp);
        }

        let total: usize = requests.values().map(|points| points.len()).sum();
        total < self.request_point_limit
    }

    async fn perform_get(&self, _host: &str, request: &GetDataRequest) -> Result<GetDataResult> {
        if self.rpc_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.rpc_delay_ms)).await;
        }
        self.get_calls.fetch_add(1, Ordering::SeqCst);

        let mut script = self.get_script.lock().unwrap();
        let results = request
            .keys
            .iter()
            .map(|key| match script.get_mut(&key.name) {
                Some(script) => script.advance(),
                None => ok_result(0),
            })
            .collect();

        Ok(GetDataResult { results })
    }

    async fn perform_put(&self, requests: PutRequestMap) -> Result<Vec<DataPoint>> {
        if self.rpc_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.rpc_delay_ms)).await;
        }
        self.put_calls.fetch_add(1, Ordering::SeqCst);

        let points: Vec<DataPoint> = requests.into_values().flatten().collect();

        if self.put_failures.load(Ordering::SeqCst) > 0 {
            self.put_failures.fetch_sub(1, Ordering::SeqCst);
            return Ok(points);
        }

        let reject_names = self.reject_names.lock().unwrap();
        let mut accepted = self.accepted.lock().unwrap();
        let mut rejected = Vec::new();
        for dp in points {
            if reject_names.contains(&dp.key.name) {
                rejected.push(dp);
            } else {
                accepted.push(dp);
            }
        }

        Ok(rejected)
    }

    fn get_host_for_scan_shard(&self, request: &ScanShardRequest) -> Option<Endpoint> {
        Some(self.host_for_shard(request.shard_id))
    }

    async fn perform_scan_shard(
        &self,
        _host: &str,
        _request: &ScanShardRequest,
    ) -> Result<ScanShardResult> {
        if self.rpc_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.rpc_delay_ms)).await;
        }

        match self.scan_result.lock().unwrap().clone() {
            Some(result) => Ok(result),
            None => Ok(ScanShardResult::empty(StatusCode::Ok)),
        }
    }

    fn invalidate_cache(&self, shard_ids: &HashSet<ShardId>) {
        self.invalidations.lock().unwrap().push(shard_ids.clone());
    }

    async fn get_last_update_times(
        &self,
        min_last_update_time: i64,
        max_keys_per_request: usize,
        _timeout_secs: u64,
        callback: &mut (dyn for<'a> FnMut(&'a [KeyUpdateTime]) -> bool + Send),
    ) -> Result<()> {
        let times: Vec<KeyUpdateTime> = self
            .update_times
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.update_time >= min_last_update_time)
            .cloned()
            .collect();

        for page in times.chunks(max_keys_per_request.max(1)) {
            if !callback(page) {
                break;
            }
        }

        Ok(())
    }

    fn stop_requests(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub struct MockConfigurationAdapter {
    read: Mutex<Vec<String>>,
    write: Mutex<Vec<String>>,
    shadow: Mutex<Vec<String>>,
    invalid: Mutex<HashSet<String>>,
    nearest: Mutex<String>,
}

impl MockConfigurationAdapter {
    pub fn new(read_services: &[&str]) -> Self {
        Self {
            read: Mutex::new(read_services.iter().map(|s| s.to_string()).collect()),
            write: Mutex::new(Vec::new()),
            shadow: Mutex::new(Vec::new()),
            invalid: Mutex::new(HashSet::new()),
            nearest: Mutex::new("nearest".to_string()),
        }
    }

    pub fn set_read_services(&self, services: &[&str]) {
        *self.read.lock().unwrap() = services.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_write_services(&self, services: &[&str]) {
        *self.write.lock().unwrap() = services.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_shadow_services(&self, services: &[&str]) {
        *self.shadow.lock().unwrap() = services.iter().map(|s| s.to_string()).collect();
    }

    pub fn set_invalid(&self, service: &str) {
        self.invalid.lock().unwrap().insert(service.to_string());
    }

    pub fn set_nearest(&self, service: &str) {
        *self.nearest.lock().unwrap() = service.to_string();
    }
}

impl ConfigurationAdapter for MockConfigurationAdapter {
    fn get_read_services(&self) -> Vec<String> {
        self.read.lock().unwrap().clone()
    }

    fn get_write_services(&self) -> Vec<String> {
        self.write.lock().unwrap().clone()
    }

    fn get_shadow_services(&self) -> Vec<String> {
        self.shadow.lock().unwrap().clone()
    }

    fn get_nearest_read_service(&self) -> String {
        self.nearest.lock().unwrap().clone()
    }

    fn is_valid_read_service(&self, name: &str) -> bool {
        !self.invalid.lock().unwrap().contains(name)
    }
}

/// Hands out pre-registered mock clients by service name, or fresh default
/// mocks for anything unregistered, and records every request.
pub struct MockClientFactory {
    clients: Mutex<HashMap<String, Arc<MockNetworkClient>>>,
    created: Mutex<Vec<String>>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, client: Arc<MockNetworkClient>) {
        self.clients
            .lock()
            .unwrap()
            .insert(client.service_name().to_string(), client);
    }

    /// Service names in the order construction was requested.
    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

impl Default for MockClientFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkClientFactory for MockClientFactory {
    fn create(&self, service: &str, shadow: bool) -> Result<Arc<dyn NetworkClient>> {
        self.created.lock().unwrap().push(service.to_string());

        if let Some(client) = self.clients.lock().unwrap().get(service) {
            return Ok(client.clone());
        }

        let mut client = MockNetworkClient::new(service);
        if shadow {
            client = client.with_shadow();
        }
        Ok(Arc::new(client))
    }
}
