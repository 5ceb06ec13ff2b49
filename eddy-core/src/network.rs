//! Contracts between the client core and its collaborators.
//!
//! The core never talks to the wire itself. Each service is reached through a
//! [`NetworkClient`], which owns the shard-to-host cache and the per-host
//! request grouping for that service. Service discovery goes through a
//! [`ConfigurationAdapter`], and client construction through a
//! [`NetworkClientFactory`] so reads can build temporary clients for
//! overridden services without touching the shared registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{
    DataPoint, GetDataRequest, GetDataResult, Key, KeyUpdateTime, ScanShardRequest,
    ScanShardResult, ShardId,
};

/// `host:port` of one storage host inside a service.
pub type Endpoint = String;

/// Grace window granted to slower services once one service has delivered a
/// full copy of the data, when the client itself does not override it.
pub const DEFAULT_NETWORK_TIMEOUT_MS: u64 = 500;

/// Points grouped by the host that owns their shard.
pub type PutRequestMap = HashMap<Endpoint, Vec<DataPoint>>;

/// One host's slice of a batched read, with the request-level slot index of
/// every key so answers can be folded back in order.
#[derive(Debug, Clone, Default)]
pub struct HostGetRequest {
    pub request: GetDataRequest,
    pub indices: Vec<usize>,
}

/// A batched read split by owning host.
pub type GetRequestMap = HashMap<Endpoint, HostGetRequest>;

/// Transport adapter for a single service.
///
/// `perform_put` and `perform_get` report per-point and per-key failures
/// inside their return values; `Err` is reserved for failures outside the
/// protocol, and callers treat it like losing the whole request.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Logical name of the service this client talks to.
    fn service_name(&self) -> &str;

    /// Shadow services take the same writes but their failures are invisible
    /// to the application.
    fn is_shadow(&self) -> bool {
        false
    }

    fn num_shards(&self) -> i64;

    fn is_corresponding_service(&self, name: &str) -> bool {
        self.service_name() == name
    }

    fn network_timeout_ms(&self) -> u64 {
        DEFAULT_NETWORK_TIMEOUT_MS
    }

    /// Route `key` to its owning host and append it to that host's request.
    /// `index` is the key's slot in the original request.
    fn add_key_to_get_request(&self, index: usize, key: &Key, requests: &mut GetRequestMap);

    /// Route one point into the per-host put map. The point is always
    /// consumed: either appended to `requests` or, when the shard owner is
    /// unknown or the host bucket is saturated, pushed onto `dropped`.
    /// Returns `false` once the map should not take further points.
    fn add_data_point_to_request(
        &self,
        dp: DataPoint,
        requests: &mut PutRequestMap,
        dropped: &mut Vec<DataPoint>,
    ) -> bool;

    /// Fetch one host's slice of a read.
    async fn perform_get(&self, host: &str, request: &GetDataRequest) -> Result<GetDataResult>;

    /// Send every host bucket of a put. Returns the points the service
    /// rejected; per-host transport failures come back as rejected points.
    async fn perform_put(&self, requests: PutRequestMap) -> Result<Vec<DataPoint>>;

    /// Host currently owning the scanned shard, if the client knows one.
    fn get_host_for_scan_shard(&self, request: &ScanShardRequest) -> Option<Endpoint>;

    async fn perform_scan_shard(
        &self,
        host: &str,
        request: &ScanShardRequest,
    ) -> Result<ScanShardResult>;

    /// Drop cached shard-to-host mappings so the next request re-resolves
    /// ownership.
    fn invalidate_cache(&self, shard_ids: &HashSet<ShardId>);

    /// Stream keys updated since `min_last_update_time` in pages of at most
    /// `max_keys_per_request`. The callback returns `false` to stop.
    async fn get_last_update_times(
        &self,
        min_last_update_time: i64,
        max_keys_per_request: usize,
        timeout_secs: u64,
        callback: &mut (dyn for<'a> FnMut(&'a [KeyUpdateTime]) -> bool + Send),
    ) -> Result<()>;

    /// Cancel outstanding calls.
    fn stop_requests(&self);
}

/// Names the services the client should talk to.
pub trait ConfigurationAdapter: Send + Sync {
    fn get_read_services(&self) -> Vec<String>;
    fn get_write_services(&self) -> Vec<String>;
    fn get_shadow_services(&self) -> Vec<String>;
    fn get_nearest_read_service(&self) -> String;
    fn is_valid_read_service(&self, name: &str) -> bool;
}

/// Builds a network client for a named service.
pub trait NetworkClientFactory: Send + Sync {
    fn create(&self, service: &str, shadow: bool) -> Result<Arc<dyn NetworkClient>>;
}
