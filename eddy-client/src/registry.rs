//! Registry of the services reads fan out to.
//!
//! The active set is an `Arc`'d vector swapped wholesale under a writer
//! lock. Readers clone the `Arc` and release the lock immediately, so every
//! read works against exactly one generation of the set, never a mixture.

use log::{error, info};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use eddy_core::network::{ConfigurationAdapter, NetworkClient, NetworkClientFactory};
use eddy_core::stats::Stats;

#[derive(Default)]
struct RegistryState {
    clients: Arc<Vec<Arc<dyn NetworkClient>>>,
    services: Vec<String>,
}

#[derive(Default)]
pub struct ReadRegistry {
    state: RwLock<RegistryState>,
    max_num_shards: AtomicI64,
}

impl ReadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current client set. O(1); the snapshot stays valid across later
    /// swaps.
    pub fn snapshot(&self) -> Arc<Vec<Arc<dyn NetworkClient>>> {
        self.state.read().unwrap().clients.clone()
    }

    pub fn first_client(&self) -> Option<Arc<dyn NetworkClient>> {
        self.state.read().unwrap().clients.first().cloned()
    }

    pub fn max_num_shards(&self) -> i64 {
        self.max_num_shards.load(Ordering::Acquire)
    }

    /// Re-resolve the service list and swap in a fresh client set.
    ///
    /// An empty or unchanged list is a no-op. Invalid services are counted
    /// and skipped; when nothing valid remains the nearest service is used
    /// so reads keep working.
    pub fn update(
        &self,
        adapter: &dyn ConfigurationAdapter,
        factory: &dyn NetworkClientFactory,
        stats: &Stats,
    ) {
        let services = adapter.get_read_services();
        if services.is_empty() {
            return;
        }

        {
            let state = self.state.read().unwrap();
            if state.services == services {
                return;
            }
        }

        let mut clients: Vec<Arc<dyn NetworkClient>> = Vec::with_capacity(services.len());
        for service in &services {
            if !adapter.is_valid_read_service(service) {
                stats.bad_read_services.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            match factory.create(service, false) {
                Ok(client) => clients.push(client),
                Err(e) => {
                    error!("failed to build read client, service: {}, error: {}", service, e);
                    stats.bad_read_services.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if clients.is_empty() {
            let nearest = adapter.get_nearest_read_service();
            info!("no valid read services, falling back to nearest: {}", nearest);
            match factory.create(&nearest, false) {
                Ok(client) => clients.push(client),
                Err(e) => {
                    error!(
                        "failed to build nearest read client, service: {}, error: {}",
                        nearest, e
                    );
                    return;
                }
            }
        }

        let max_num_shards = clients.iter().map(|c| c.num_shards()).max().unwrap_or(0);
        self.max_num_shards.store(max_num_shards, Ordering::Release);

        let mut state = self.state.write().unwrap();
        state.services = services;
        state.clients = Arc::new(clients);
    }
}
