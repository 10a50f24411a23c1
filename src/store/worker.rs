use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{HostHistory, LogKind, ProcessException, Store};
use crate::broadcast::{Broadcaster, Event};
use crate::export::health::HealthMetrics;
use crate::source::HostSnapshot;

/// Pending commands before submitters wait.
const COMMAND_CAPACITY: usize = 1024;

/// Mutations applied by the worker, one at a time.
#[derive(Debug)]
pub enum Command {
    Sample(HostSnapshot),
    Log {
        host: String,
        id: u32,
        kind: LogKind,
        line: String,
    },
    Exception {
        host: String,
        id: u32,
        exception: ProcessException,
    },
}

/// Submits commands to the ingestion worker.
#[derive(Debug, Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<Command>,
}

impl IngestHandle {
    pub async fn submit(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("ingestion worker stopped"))
    }

    pub async fn submit_sample(&self, snapshot: HostSnapshot) -> Result<()> {
        self.submit(Command::Sample(snapshot)).await
    }

    pub async fn record_log(&self, host: &str, id: u32, kind: LogKind, line: &str) -> Result<()> {
        self.submit(Command::Log {
            host: host.to_string(),
            id,
            kind,
            line: line.to_string(),
        })
        .await
    }

    pub async fn record_exception(
        &self,
        host: &str,
        id: u32,
        exception: ProcessException,
    ) -> Result<()> {
        self.submit(Command::Exception {
            host: host.to_string(),
            id,
            exception,
        })
        .await
    }
}

/// Read-only snapshot of every host, republished after each mutation.
///
/// Readers never observe a series mid-compaction: the worker swaps in a
/// complete copy of a host once a command has been fully applied. Hosts a
/// command did not touch keep sharing their previous copy.
#[derive(Debug, Clone)]
pub struct StoreView {
    hosts: Arc<ArcSwap<Vec<Arc<HostHistory>>>>,
}

impl StoreView {
    fn new() -> Self {
        Self {
            hosts: Arc::new(ArcSwap::from_pointee(Vec::new())),
        }
    }

    /// Every host, ordered by name.
    pub fn load(&self) -> Arc<Vec<Arc<HostHistory>>> {
        self.hosts.load_full()
    }

    pub fn host(&self, name: &str) -> Option<Arc<HostHistory>> {
        self.hosts.load().iter().find(|h| h.name == name).cloned()
    }

    fn publish_all(&self, store: &Store) {
        self.hosts
            .store(Arc::new(store.hosts().cloned().map(Arc::new).collect()));
    }

    /// Replaces one host's copy, leaving the others shared.
    fn publish_host(&self, host: &HostHistory) {
        let current = self.hosts.load();
        let fresh = Arc::new(host.clone());

        let mut next = Vec::with_capacity(current.len() + 1);
        next.extend(current.iter().map(|h| {
            if h.name == host.name {
                Arc::clone(&fresh)
            } else {
                Arc::clone(h)
            }
        }));
        if !current.iter().any(|h| h.name == host.name) {
            let pos = next.partition_point(|h| h.name < host.name);
            next.insert(pos, fresh);
        }

        self.hosts.store(Arc::new(next));
    }
}

struct IngestWorker {
    store: Store,
    view: StoreView,
    broadcaster: Arc<Broadcaster>,
    health: Option<Arc<HealthMetrics>>,
}

/// Starts the worker that exclusively owns `store`.
///
/// The task ends on cancellation or once every [`IngestHandle`] is
/// dropped, and yields the store back.
pub fn spawn(
    store: Store,
    broadcaster: Arc<Broadcaster>,
    health: Option<Arc<HealthMetrics>>,
    ctx: CancellationToken,
) -> (IngestHandle, StoreView, JoinHandle<Store>) {
    let (tx, mut rx) = mpsc::channel(COMMAND_CAPACITY);
    let view = StoreView::new();

    let mut worker = IngestWorker {
        store,
        view: view.clone(),
        broadcaster,
        health,
    };
    worker.view.publish_all(&worker.store);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => worker.apply(command),
                    None => break,
                },
            }
        }

        info!(
            hosts = worker.store.host_count(),
            processes = worker.store.process_count(),
            "ingestion worker stopped"
        );
        worker.store
    });

    (IngestHandle { tx }, view, task)
}

impl IngestWorker {
    fn apply(&mut self, command: Command) {
        match command {
            Command::Sample(snapshot) => self.ingest(snapshot),
            Command::Log {
                host,
                id,
                kind,
                line,
            } => {
                if self.store.add_log(&host, id, kind, &line) {
                    self.publish_host(&host);
                }
                self.broadcaster.push(Event::log(&host, id, kind, &line));
            }
            Command::Exception {
                host,
                id,
                exception,
            } => {
                if self.store.add_exception(&host, id, &exception) {
                    self.publish_host(&host);
                }
                self.broadcaster
                    .push(Event::process_exception(&host, id, &exception));
            }
        }
    }

    fn publish_host(&self, name: &str) {
        if let Some(host) = self.store.host(name) {
            self.view.publish_host(host);
        }
    }

    fn ingest(&mut self, snapshot: HostSnapshot) {
        let started = Instant::now();
        let report = self.store.ingest(&snapshot);
        self.publish_host(&snapshot.name);
        self.broadcaster.push(Event::system_data(&snapshot));

        if let Some(h) = &self.health {
            h.samples_ingested.inc();
            h.compactions.inc_by(report.compacted as f64);
            h.hosts_tracked.set(self.store.host_count() as f64);
            h.processes_tracked.set(self.store.process_count() as f64);
            h.series_points.set(self.store.point_count() as f64);
            h.ingest_round_duration
                .observe(started.elapsed().as_secs_f64());
        }

        debug!(
            host = %snapshot.name,
            processes = snapshot.processes.len(),
            created = report.created,
            removed = report.removed,
            compacted = report.compacted,
            "sample ingested"
        );
    }
}
