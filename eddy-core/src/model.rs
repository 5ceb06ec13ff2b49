//! Data model shared by the write and read paths.
//!
//! A `Key` names one time series and carries the shard it is believed to live
//! in. The shard id is advisory on the client side: servers may move shards
//! around, so every network client keeps its own shard-to-host cache and the
//! read path invalidates that cache when a host disowns a shard.

/// Routing partition id within a service.
pub type ShardId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    /// Time series name. Unique within a service.
    pub name: String,

    /// Shard the client currently believes owns this key.
    pub shard_id: ShardId,
}

impl Key {
    pub fn new(name: impl Into<String>, shard_id: ShardId) -> Self {
        Self {
            name: name.into(),
            shard_id,
        }
    }
}

/// One sample of one time series. Immutable once produced.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    pub key: Key,
    pub timestamp: i64,
    pub value: f64,
}

impl DataPoint {
    pub fn new(key: Key, timestamp: i64, value: f64) -> Self {
        Self {
            key,
            timestamp,
            value,
        }
    }
}

/// Per-key status a server attaches to its answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Authoritative data returned.
    Ok,

    /// Key unknown to the service. Never retried.
    KeyMissing,

    /// The RPC to the owning host failed.
    RpcFail,

    /// The host reached its storage but the storage failed.
    StorageFail,

    /// The host no longer owns the shard the client routed to.
    DontOwnShard,

    /// The shard is still being loaded. May carry partial data.
    ShardInProgress,

    /// The shard is loaded but has known gaps. May carry partial data.
    MissingTooMuchData,

    /// The server returned a bucket it has not finalized. Protocol bug.
    BucketNotFinalized,
}

/// One compressed block of `(timestamp, value)` pairs. Decoding is the
/// caller's concern.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TimeSeriesBlock {
    /// Number of data points encoded in `data`.
    pub count: u32,

    /// Encoded payload.
    pub data: Vec<u8>,
}

/// Status and blocks for a single key, as returned by one service.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesResult {
    pub status: StatusCode,
    pub data: Vec<TimeSeriesBlock>,
}

impl TimeSeriesResult {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            data: Vec::new(),
        }
    }

    pub fn with_data(status: StatusCode, data: Vec<TimeSeriesBlock>) -> Self {
        Self { status, data }
    }
}

/// A batched read. The order of `keys` defines the index space every
/// result and collector slot aligns to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetDataRequest {
    pub keys: Vec<Key>,
    pub begin: i64,
    pub end: i64,
}

/// Raw per-host or per-service answer, aligned 1:1 with the request keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetDataResult {
    pub results: Vec<TimeSeriesResult>,
}

/// Outcome of a sequential read. `keys[i]` succeeded with `results[i]`;
/// keys absent from `keys` could not be resolved anywhere.
#[derive(Debug, Clone, Default)]
pub struct GetOutcome {
    pub keys: Vec<Key>,
    pub results: Vec<TimeSeriesResult>,
}

/// Merged answer of a fan-out read. Entries align with the request keys.
#[derive(Debug, Clone)]
pub struct ReadResult {
    pub results: Vec<KeySeries>,
}

/// Best-known answer for one key after merging every service's response.
/// `status` is `None` when no service answered for this key at all.
#[derive(Debug, Clone)]
pub struct KeySeries {
    pub key: Key,
    pub status: Option<StatusCode>,
    pub blocks: Vec<TimeSeriesBlock>,
}

impl KeySeries {
    /// True when this slot carries usable data.
    pub fn has_data(&self) -> bool {
        !self.blocks.is_empty()
    }
}

/// A whole-shard read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanShardRequest {
    pub shard_id: ShardId,
    pub begin: i64,
    pub end: i64,
}

/// Every key of a shard with its blocks. `data` aligns with `keys`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanShardResult {
    pub status: StatusCode,
    pub keys: Vec<String>,
    pub data: Vec<Vec<TimeSeriesBlock>>,
}

impl ScanShardResult {
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            keys: Vec::new(),
            data: Vec::new(),
        }
    }
}

/// Key freshness record streamed by `get_last_update_times`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyUpdateTime {
    pub key: String,
    pub shard_id: ShardId,
    pub update_time: i64,
}
