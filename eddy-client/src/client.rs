//! Public client facade.
//!
//! One `EddyClient` is either a reader or a writer, decided at construction
//! by `writer_threads`. Readers keep a registry of service clients fresh on
//! a refresh loop and fan reads out across it. Writers own one pipeline per
//! write service (shadow services included), a shared retry queue, and the
//! worker tasks that drain both.

use log::{error, info};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

use anyhow::{bail, Result};

use eddy_core::error_bail;
use eddy_core::model::{
    DataPoint, GetDataRequest, GetOutcome, KeyUpdateTime, ReadResult, ScanShardRequest,
    ScanShardResult,
};
use eddy_core::network::{ConfigurationAdapter, NetworkClientFactory};
use eddy_core::retry::RetryQueue;
use eddy_core::stats::Stats;

use crate::config::ClientOptions;
use crate::fanout::ReadFanout;
use crate::registry::ReadRegistry;
use crate::retry_pump;
use crate::write_pipeline::WritePipeline;

pub struct EddyClient {
    options: ClientOptions,
    stats: Arc<Stats>,
    registry: Arc<ReadRegistry>,
    fanout: ReadFanout,

    adapter: Arc<dyn ConfigurationAdapter>,
    factory: Arc<dyn NetworkClientFactory>,

    pipelines: Vec<Arc<WritePipeline>>,
    retry_queue: Arc<RetryQueue>,

    /// Highest shard count across the write services. Readers get this
    /// number from the registry instead.
    write_max_num_shards: i64,

    writer_tasks: Mutex<Vec<JoinHandle<()>>>,
    retry_tasks: Mutex<Vec<JoinHandle<()>>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    refresh_stop: watch::Sender<bool>,
}

impl EddyClient {
    /// Build a client and start its worker tasks. Must run inside a tokio
    /// runtime.
    pub fn new(
        adapter: Arc<dyn ConfigurationAdapter>,
        factory: Arc<dyn NetworkClientFactory>,
        options: ClientOptions,
        throw_on_transient_failure: bool,
    ) -> Result<Self> {
        let stats = Arc::new(Stats::new());
        let registry = Arc::new(ReadRegistry::new());
        let retry_queue = Arc::new(RetryQueue::new(options.retry_queue_capacity));
        let (refresh_stop, _) = watch::channel(false);

        let fanout = ReadFanout::new(
            registry.clone(),
            adapter.clone(),
            factory.clone(),
            stats.clone(),
            &options,
            throw_on_transient_failure,
        );

        let mut client = Self {
            options,
            stats,
            registry,
            fanout,
            adapter,
            factory,
            pipelines: Vec::new(),
            retry_queue,
            write_max_num_shards: 0,
            writer_tasks: Mutex::new(Vec::new()),
            retry_tasks: Mutex::new(Vec::new()),
            refresh_task: Mutex::new(None),
            refresh_stop,
        };

        // In production clients are either readers or writers, never both.
        if client.options.writer_threads == 0 {
            client.registry.update(
                client.adapter.as_ref(),
                client.factory.as_ref(),
                &client.stats,
            );
            client.spawn_refresh_loop();
        } else {
            client.build_pipelines()?;
            client.start_writers();
        }

        Ok(client)
    }

    fn build_pipelines(&mut self) -> Result<()> {
        for service in self.adapter.get_write_services() {
            let network_client = self.factory.create(&service, false)?;
            let stats = self.stats.service(&service);
            self.pipelines
                .push(Arc::new(WritePipeline::new(network_client, &self.options, stats)));
        }

        self.write_max_num_shards = self
            .pipelines
            .iter()
            .map(|p| p.client().num_shards())
            .max()
            .unwrap_or(0);

        for service in self.adapter.get_shadow_services() {
            let network_client = self.factory.create(&service, true)?;
            let stats = self.stats.service(&service);
            self.pipelines
                .push(Arc::new(WritePipeline::new(network_client, &self.options, stats)));
        }

        if self.pipelines.is_empty() {
            error_bail!(
                "writer threads configured but no write or shadow services found: {}",
                self.options.writer_threads
            );
        }

        Ok(())
    }

    fn start_writers(&self) {
        if self.options.writer_threads == 0 || self.pipelines.is_empty() {
            return;
        }

        let mut writer_tasks = self.writer_tasks.lock().unwrap();
        for pipeline in &self.pipelines {
            for _ in 0..self.options.writer_threads {
                writer_tasks.push(tokio::spawn(pipeline.clone().run(
                    self.retry_queue.clone(),
                    self.stats.clone(),
                    self.options.clone(),
                )));
            }
        }

        let mut retry_tasks = self.retry_tasks.lock().unwrap();
        for _ in 0..self.options.write_retry_threads {
            retry_tasks.push(tokio::spawn(retry_pump::run(
                self.retry_queue.clone(),
                self.stats.clone(),
                self.options.retry_threshold_secs,
            )));
        }
    }

    /// Drain every pipeline with one sentinel per worker, join the workers,
    /// then stop the retry pump the same way.
    async fn stop_writers(&self) {
        let writer_tasks: Vec<_> = self.writer_tasks.lock().unwrap().drain(..).collect();
        if !writer_tasks.is_empty() {
            for pipeline in &self.pipelines {
                pipeline.queue().flush(self.options.writer_threads).await;
            }
            for task in writer_tasks {
                let _ = task.await;
            }
        }

        let retry_tasks: Vec<_> = self.retry_tasks.lock().unwrap().drain(..).collect();
        for _ in 0..retry_tasks.len() {
            self.retry_queue.push_shutdown().await;
        }
        for task in retry_tasks {
            let _ = task.await;
        }
    }

    fn spawn_refresh_loop(&self) {
        let interval_secs = self.options.read_services_update_interval_secs;
        if interval_secs < 0 {
            return;
        }

        let registry = self.registry.clone();
        let adapter = self.adapter.clone();
        let factory = self.factory.clone();
        let stats = self.stats.clone();
        let mut stop = self.refresh_stop.subscribe();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1) as u64));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.update(adapter.as_ref(), factory.as_ref(), &stats);
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            info!("stopping read services refresh");
                            break;
                        }
                    }
                }
            }
        });

        *self.refresh_task.lock().unwrap() = Some(task);
    }

    /// Queue a batch of points to every write service.
    ///
    /// Returns `true` when at least one non-shadow service accepted the
    /// batch; shadow acceptance never counts toward availability.
    pub fn put_data_points(&self, points: Vec<DataPoint>) -> bool {
        if points.is_empty() {
            error!("empty request");
            return true;
        }

        let mut accepted = false;
        let mut points = Some(points);
        let num_pipelines = self.pipelines.len();

        for (i, pipeline) in self.pipelines.iter().enumerate() {
            // All but the last pipeline get a copy; the last takes the
            // original.
            let batch = if i + 1 == num_pipelines {
                points.take().unwrap_or_default()
            } else {
                points.clone().unwrap_or_default()
            };

            let pushed = pipeline.push(batch);
            if pushed && !pipeline.client().is_shadow() {
                accepted = true;
            }
        }

        accepted
    }

    /// Sequential read. The returned outcome lists the keys that resolved,
    /// in acceptance order, with their results aligned.
    pub async fn get(
        &self,
        request: &GetDataRequest,
        service_override: Option<&str>,
    ) -> Result<GetOutcome> {
        self.fanout.get(request, service_override).await
    }

    /// Parallel read racing every read service. Results align with the
    /// request keys.
    pub async fn future_get(
        &self,
        request: &GetDataRequest,
        service_override: Option<&str>,
    ) -> Result<ReadResult> {
        self.fanout.future_get(request, service_override).await
    }

    /// Whole-shard read from the first read service.
    pub async fn scan_shard(&self, request: &ScanShardRequest) -> Result<ScanShardResult> {
        self.fanout.scan_shard(request).await
    }

    /// Whole-shard read, fanned out when `parallel_scan_shard` is set.
    pub async fn future_scan_shard(
        &self,
        request: &ScanShardRequest,
        service_override: Option<&str>,
    ) -> Result<ScanShardResult> {
        self.fanout.future_scan_shard(request, service_override).await
    }

    /// Stream keys updated since `min_last_update_time`. The callback
    /// returns `false` to stop early.
    pub async fn get_last_update_times(
        &self,
        min_last_update_time: i64,
        max_keys_per_request: usize,
        timeout_secs: u64,
        callback: &mut (dyn for<'a> FnMut(&'a [KeyUpdateTime]) -> bool + Send),
    ) -> Result<()> {
        self.fanout
            .get_last_update_times(
                min_last_update_time,
                max_keys_per_request,
                timeout_secs,
                callback,
            )
            .await
    }

    /// Cancel outstanding read calls.
    pub fn stop_requests(&self) {
        self.fanout.stop_requests();
    }

    /// Drain every queued point through the workers, then restart them with
    /// the configured worker count.
    pub async fn flush_queue(&self) {
        self.stop_writers().await;
        self.start_writers();
    }

    /// Re-resolve the read service list immediately, outside the refresh
    /// loop.
    pub fn update_read_services(&self) {
        self.registry
            .update(self.adapter.as_ref(), self.factory.as_ref(), &self.stats);
    }

    pub fn get_max_num_shards(&self) -> i64 {
        if self.pipelines.is_empty() {
            self.registry.max_num_shards()
        } else {
            self.write_max_num_shards
        }
    }

    pub fn get_num_shards_from_write_client(&self) -> i64 {
        self.pipelines
            .first()
            .map(|p| p.client().num_shards())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn registry(&self) -> &Arc<ReadRegistry> {
        &self.registry
    }

    /// Graceful teardown: drain the writers and stop the refresh loop.
    pub async fn shutdown(&self) {
        self.stop_writers().await;

        let refresh_task = self.refresh_task.lock().unwrap().take();
        if let Some(task) = refresh_task {
            let _ = self.refresh_stop.send(true);
            let _ = task.await;
        }
    }
}

impl Drop for EddyClient {
    fn drop(&mut self) {
        // Best effort only; call `shutdown` for a graceful stop.
        for task in self.writer_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        for task in self.retry_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        if let Some(task) = self.refresh_task.lock().unwrap().take() {
            task.abort();
        }
    }
}
