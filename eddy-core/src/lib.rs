//! Core building blocks of the eddy client: the data model, the bounded
//! queues feeding the write path, the result collectors backing the read
//! path, statistics counters, and the traits the transport layer plugs into.
//!
//! Everything here is transport-agnostic. The wire protocol lives behind the
//! [`network::NetworkClient`] trait, so the queues and collectors can be
//! exercised in tests with scripted clients.

pub mod collector;
pub mod error;
pub mod model;
pub mod network;
pub mod queue;
pub mod retry;
pub mod stats;
pub mod tool;
