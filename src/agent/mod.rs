use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcast::{
    Broadcaster, DeliveryError, Event, Subscriber, SubscriberId, WriterSubscriber,
};
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::source::procfs::ProcfsSource;
use crate::source::SampleSource;
use crate::store::worker::{self, IngestHandle, StoreView};
use crate::store::Store;

/// Agent wires the sample source, the ingestion worker, and the broadcaster.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    broadcaster: Arc<Broadcaster>,
    ingest: Option<IngestHandle>,
    view: Option<StoreView>,
    worker_task: Option<JoinHandle<Store>>,
    sampler_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let broadcaster = Arc::new(Broadcaster::new(Some(Arc::clone(&health))));

        Ok(Self {
            cfg,
            health,
            broadcaster,
            ingest: None,
            view: None,
            worker_task: None,
            sampler_task: None,
            cancel: CancellationToken::new(),
        })
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Handle for feeding logs and exceptions; `None` before `start`.
    pub fn ingest_handle(&self) -> Option<IngestHandle> {
        self.ingest.clone()
    }

    pub fn view(&self) -> Option<&StoreView> {
        self.view.as_ref()
    }

    /// Events a new subscriber receives before any batch: the client
    /// configuration and every host's retained history.
    pub fn greeting(&self) -> Vec<Event> {
        let hosts = self.view.as_ref().map(StoreView::load).unwrap_or_default();
        vec![
            Event::config(&self.cfg.client_config()),
            Event::hosts(&hosts),
        ]
    }

    /// Greets and registers a subscriber.
    pub fn connect(&self, subscriber: Box<dyn Subscriber>) -> Result<SubscriberId, DeliveryError> {
        self.broadcaster
            .subscribe_with_greeting(subscriber, self.greeting())
    }

    /// Starts all components sampling the local host through procfs.
    pub async fn start(&mut self) -> Result<()> {
        let source = ProcfsSource::new(&self.cfg.source);
        self.start_with_source(Box::new(source)).await
    }

    /// Starts all components with the given sample source.
    pub async fn start_with_source(&mut self, source: Box<dyn SampleSource>) -> Result<()> {
        // 1. Health server first so probes respond during startup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 2. Ingestion worker owning the store.
        let store = Store::new(self.cfg.graph.retention_policy(), self.cfg.logs.max);
        let (ingest, view, worker_task) = worker::spawn(
            store,
            Arc::clone(&self.broadcaster),
            Some(Arc::clone(&self.health)),
            self.cancel.child_token(),
        );
        self.view = Some(view);
        self.worker_task = Some(worker_task);

        // 3. Broadcast timer.
        self.broadcaster
            .start(self.cfg.ws.frequency, self.cancel.child_token())
            .await;

        // 4. Built-in subscribers.
        if self.cfg.subscribers.stdout {
            let stdout = WriterSubscriber::new("stdout", std::io::stdout());
            self.connect(Box::new(stdout))
                .context("greeting stdout subscriber")?;
        }

        // 5. Sampling timer.
        self.sampler_task = Some(self.spawn_sampler(source, ingest.clone()));
        self.ingest = Some(ingest);

        info!(
            update_frequency = ?self.cfg.update_frequency,
            ws_frequency = ?self.cfg.ws.frequency,
            datapoints = self.cfg.graph.datapoints,
            days = self.cfg.graph.distribution.len(),
            "agent fully started"
        );

        Ok(())
    }

    /// Gracefully stop all components. Events still queued may be lost.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(task) = self.sampler_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "sampler task join failed");
            }
        }

        self.ingest = None;
        if let Some(task) = self.worker_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "ingestion worker join failed");
            }
        }

        self.broadcaster.wait_for_shutdown().await;

        self.health.stop().await?;

        Ok(())
    }

    /// Spawn the sampling timer feeding snapshots to the worker.
    fn spawn_sampler(
        &self,
        mut source: Box<dyn SampleSource>,
        ingest: IngestHandle,
    ) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        let health = Arc::clone(&self.health);
        let interval = self.cfg.update_frequency;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = match source.sample() {
                            Ok(snapshot) => snapshot,
                            Err(e) => {
                                health.sample_errors.inc();
                                warn!(source = source.name(), error = %e, "sampling round failed");
                                continue;
                            }
                        };

                        if let Err(e) = ingest.submit_sample(snapshot).await {
                            warn!(error = %e, "dropping sample");
                            return;
                        }
                    }
                }
            }
        })
    }
}
