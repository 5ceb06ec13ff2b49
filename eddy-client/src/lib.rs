//! Client for a sharded, replicated time-series database.
//!
//! The database runs as independent *services*, each a full replica of the
//! data, each made of hosts that own a subset of shards. This crate is the
//! hot-path adapter applications use against it:
//!
//! * Writes go through one pipeline per write service. Producers enqueue
//!   batches and return; writer workers re-group points per destination
//!   host, send them, and push everything that failed onto a shared retry
//!   queue that resends after a delay.
//! * Reads race the services. The sequential form walks them one at a time
//!   with in-service retry; the parallel form asks everyone at once and
//!   merges per-key answers, sealing the result once a full copy has
//!   arrived and a short grace window has passed.
//!
//! Why race replicas instead of picking the healthy one up front? Health is
//! stale the moment it is measured. Racing needs no health signal at all: a
//! slow or failing service simply loses, and its partial answers still fill
//! holes the winner could not answer.
//!
//! The transport is pluggable through [`eddy_core::network::NetworkClient`];
//! the [`testing`] module drives the whole client against scripted in-memory
//! services.

pub mod client;
pub mod config;
pub mod fanout;
pub mod registry;
pub mod retry_pump;
pub mod testing;
pub mod write_pipeline;

pub use client::EddyClient;
pub use config::ClientOptions;
pub use eddy_core::error::ClientError;
pub use eddy_core::model::{
    DataPoint, GetDataRequest, GetOutcome, Key, KeySeries, KeyUpdateTime, ReadResult,
    ScanShardRequest, ScanShardResult, StatusCode, TimeSeriesBlock, TimeSeriesResult,
};
pub use eddy_core::network::{ConfigurationAdapter, NetworkClient, NetworkClientFactory};
pub use eddy_core::stats::{Stats, StatsSnapshot};
