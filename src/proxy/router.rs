//! Hostname routing and backend lifecycle management.
//!
//! The routing table is an immutable hostname map behind an atomic
//! pointer: frontends load a consistent snapshot per request with no lock
//! on the hot path, the manager builds a replacement map and swaps it in.
//! Reloads diff the incoming config set against the running workers:
//! removed workers are closed (and drain), added workers are spawned,
//! changed workers receive a sparse update in place so sessions in flight
//! keep their event channel.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use arc_swap::ArcSwap;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::ServerConfig;

use super::answer::BackendRequest;
use super::backend::{backend_channels, BackendSenders, BackendWorker, BackendWorkerUpdate};

/// Clonable address of one backend worker.
#[derive(Clone)]
pub struct BackendHandle {
    pub name: String,
    senders: BackendSenders,
}

impl BackendHandle {
    /// Forward a request; an error means the worker has closed.
    pub async fn send_request(&self, req: BackendRequest) -> Result<(), BackendRequest> {
        self.senders
            .request_tx
            .send(req)
            .await
            .map_err(|err| err.0)
    }

    /// Ask the worker whether it has sessions in flight.
    pub async fn has_active_conns(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.senders.conn_check_tx.send(tx).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    async fn send_update(&self, update: BackendWorkerUpdate) -> bool {
        self.senders.update_tx.send(update).await.is_ok()
    }

    #[cfg(test)]
    pub(crate) fn senders(&self) -> &BackendSenders {
        &self.senders
    }
}

/// Atomic snapshot of hostname -> backend worker.
pub struct RoutingTable {
    snapshot: ArcSwap<HashMap<String, BackendHandle>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    /// Lock-free lookup by normalized hostname.
    pub fn lookup(&self, hostname: &str) -> Option<BackendHandle> {
        self.snapshot.load().get(hostname).cloned()
    }

    /// Replace the table wholesale. Readers see either the old or the new
    /// map, never a mix.
    pub fn publish(&self, map: HashMap<String, BackendHandle>) {
        let hostnames = map.len();
        self.snapshot.store(Arc::new(map));
        info!(hostnames, "routing table swapped");
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

struct WorkerEntry {
    cfg: ServerConfig,
    handle: BackendHandle,
    close_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Outcome of one reload, reported in the HTTP response body.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub added: usize,
    pub removed: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: Vec<String>,
}

impl std::fmt::Display for ReloadSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} added, {} removed, {} updated, {} unchanged",
            self.added, self.removed, self.updated, self.unchanged
        )?;
        for skipped in &self.skipped {
            write!(f, "\nskipped: {skipped}")?;
        }
        Ok(())
    }
}

/// Owns the backend workers and the routing table. Reloads are serialized
/// by callers holding the manager behind a mutex.
pub struct BackendManager {
    table: Arc<RoutingTable>,
    /// Running workers keyed by config identity (file path). Ordered so
    /// duplicate-domain resolution is deterministic.
    workers: BTreeMap<PathBuf, WorkerEntry>,
    /// Closed workers kept alive until their sessions drain.
    retired: Vec<WorkerEntry>,
}

impl BackendManager {
    pub fn new(table: Arc<RoutingTable>) -> Self {
        Self {
            table,
            workers: BTreeMap::new(),
            retired: Vec::new(),
        }
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.table)
    }

    /// Reconcile the worker set against a config snapshot and swap in the
    /// rebuilt routing table.
    pub async fn load_all(&mut self, cfgs: Vec<ServerConfig>) -> ReloadSummary {
        let mut summary = ReloadSummary::default();

        let incoming: BTreeMap<PathBuf, ServerConfig> = cfgs
            .into_iter()
            .map(|cfg| (cfg.file_path.clone(), cfg))
            .collect();

        let removed: Vec<PathBuf> = self
            .workers
            .keys()
            .filter(|id| !incoming.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(entry) = self.workers.remove(&id) {
                info!(config = %id.display(), host = %entry.handle.name, "backend removed");
                let _ = entry.close_tx.send(true);
                self.retired.push(entry);
                summary.removed += 1;
            }
        }

        for (id, cfg) in incoming {
            match self.workers.get_mut(&id) {
                None => match cfg.resolve() {
                    Ok(resolved) => {
                        let name = resolved.name.clone();
                        let (senders, close_tx, channels) = backend_channels();
                        let worker =
                            BackendWorker::from_config(resolved, senders.proxy_event_tx.clone());
                        let task = tokio::spawn(worker.run(channels));
                        info!(config = %id.display(), host = %name, "backend added");
                        self.workers.insert(
                            id,
                            WorkerEntry {
                                cfg,
                                handle: BackendHandle { name, senders },
                                close_tx,
                                task,
                            },
                        );
                        summary.added += 1;
                    }
                    Err(err) => {
                        warn!(config = %id.display(), error = %err, "backend config skipped");
                        summary.skipped.push(format!("{}: {err}", id.display()));
                    }
                },
                Some(entry) => {
                    if entry.cfg == cfg {
                        summary.unchanged += 1;
                        continue;
                    }
                    match cfg.resolve() {
                        Ok(resolved) => {
                            let name = resolved.name.clone();
                            let update = BackendWorker::update_from_config(resolved);
                            if entry.handle.send_update(update).await {
                                info!(config = %id.display(), host = %name, "backend updated");
                                entry.handle.name = name;
                                entry.cfg = cfg;
                                summary.updated += 1;
                            } else {
                                warn!(config = %id.display(), "backend worker gone, skipping update");
                                summary.skipped.push(format!("{}: worker closed", id.display()));
                            }
                        }
                        Err(err) => {
                            warn!(config = %id.display(), error = %err, "backend update skipped");
                            summary.skipped.push(format!("{}: {err}", id.display()));
                        }
                    }
                }
            }
        }

        self.publish_table();
        summary
    }

    fn publish_table(&self) {
        let mut map: HashMap<String, BackendHandle> = HashMap::new();
        let mut owners: HashMap<String, PathBuf> = HashMap::new();
        for (id, entry) in &self.workers {
            for domain in &entry.cfg.domains {
                let hostname = domain.trim_end_matches('.').to_lowercase();
                if let Some(previous) = owners.insert(hostname.clone(), id.clone()) {
                    warn!(
                        host = %hostname,
                        previous = %previous.display(),
                        winner = %id.display(),
                        "duplicate domain, last config wins"
                    );
                }
                map.insert(hostname, entry.handle.clone());
            }
        }
        self.table.publish(map);
    }

    /// True when at least one worker, running or draining, still has an
    /// open session. Used by graceful shutdown to poll until idle.
    pub async fn active_connections(&mut self) -> bool {
        self.retired.retain(|entry| !entry.task.is_finished());

        for entry in self.workers.values().chain(self.retired.iter()) {
            if entry.handle.has_active_conns().await {
                return true;
            }
        }
        false
    }

    /// Close every worker; used on shutdown after the listener stops.
    pub fn close_all(&mut self) {
        for (_, entry) in std::mem::take(&mut self.workers) {
            let _ = entry.close_tx.send(true);
            self.retired.push(entry);
        }
        self.table.publish(HashMap::new());
    }
}
