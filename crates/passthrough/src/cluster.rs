//! Stripe control: which simulated server is active, fail-over, and the
//! restart of crashed servers.
//!
//! Every server keeps a [`MemoryPersistence`] that survives its process
//! incarnations, or a [`NullPersistence`] when the stripe is not durable.
//! Clients are owned by the stripe rather than by a server: they follow the
//! active through fail-overs and are parked when no server is left to take
//! over, until one is started again.

use crate::config::StripeConfig;
use crate::connection::Connection;
use crate::error::PassthroughError;
use crate::metrics::StripeMetrics;
use crate::server_process::{self, ProcessRole, ProcessSettings, ProcessSnapshot, ServerProcessHandle};
use crate::services::ServiceCatalog;
use crate::storage::memory_persistence::MemoryPersistence;
use crate::storage::null_persistence::NullPersistence;
use crate::storage::PlatformPersistence;
use crate::types::{ConnectionId, ProcessId};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Reports sent to the stripe controller by processes and connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClusterEvent {
    /// A process must be terminated and restarted.
    Crash(ProcessId),
    ConnectionClosed(ConnectionId),
}

struct PassthroughServer {
    name: String,
    /// `None` when the stripe keeps nothing across restarts.
    persistence: Option<MemoryPersistence>,
    process: Option<ServerProcessHandle>,
}

struct ClusterState {
    servers: Vec<PassthroughServer>,
    active: Option<usize>,
    /// Attached to the active, or parked while there is none.
    clients: Vec<Connection>,
    rng: StdRng,
    next_connection_id: u64,
    next_process_id: u64,
}

impl ClusterState {
    fn active_process(&self) -> Option<ServerProcessHandle> {
        self.active
            .and_then(|index| self.servers[index].process.clone())
    }

    fn running_passives(&self) -> Vec<usize> {
        (0..self.servers.len())
            .filter(|index| Some(*index) != self.active && self.servers[*index].process.is_some())
            .collect()
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.servers.iter().position(|server| server.name == name)
    }
}

struct ClusterInner {
    state: Mutex<ClusterState>,
    catalog: Arc<ServiceCatalog>,
    metrics: Arc<StripeMetrics>,
    events: mpsc::UnboundedSender<ClusterEvent>,
}

/// Controls a simulated stripe of one active and any number of passives.
pub struct ClusterControl {
    inner: Arc<ClusterInner>,
    cancel: CancellationToken,
    events_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ClusterControl {
    /// Starts every configured server with unregistered metrics.
    pub async fn start(config: StripeConfig, catalog: ServiceCatalog) -> Result<Self, PassthroughError> {
        Self::start_with_metrics(config, catalog, Arc::new(StripeMetrics::unregistered())).await
    }

    /// Starts every configured server: one elected at random becomes the
    /// active, the rest attach to it as passives.
    #[instrument(skip_all, fields(servers = config.server_names.len()))]
    pub async fn start_with_metrics(
        config: StripeConfig,
        catalog: ServiceCatalog,
        metrics: Arc<StripeMetrics>,
    ) -> Result<Self, PassthroughError> {
        config.validate()?;
        let (events, events_rx) = mpsc::unbounded_channel();
        let rng = match config.election_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let servers = config
            .server_names
            .iter()
            .map(|name| PassthroughServer {
                name: name.clone(),
                persistence: config.durable_storage.then(MemoryPersistence::new),
                process: None,
            })
            .collect();
        let inner = Arc::new(ClusterInner {
            state: Mutex::new(ClusterState {
                servers,
                active: None,
                clients: Vec::new(),
                rng,
                next_connection_id: 1,
                next_process_id: 1,
            }),
            catalog: Arc::new(catalog),
            metrics,
            events,
        });

        {
            let mut guard = inner.state.lock().await;
            let state = &mut *guard;
            let indices: Vec<usize> = (0..state.servers.len()).collect();
            let Some(&first) = indices.choose(&mut state.rng) else {
                return Err(PassthroughError::InvalidConfig {
                    reason: "server_names must name at least one server".to_string(),
                });
            };
            inner.start_process(state, first, ProcessRole::Active, config.load_storage_on_start)?;
            state.active = Some(first);
            info!(active = %state.servers[first].name, "initial active elected");
            for index in indices.into_iter().filter(|index| *index != first) {
                inner.start_passive(state, index).await?;
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_events(Arc::clone(&inner), events_rx, cancel.clone()));
        Ok(Self {
            inner,
            cancel,
            events_task: parking_lot::Mutex::new(Some(task)),
        })
    }

    pub fn metrics(&self) -> &StripeMetrics {
        &self.inner.metrics
    }

    /// Opens a client connection to the current active.
    pub async fn connect_client(&self, name: impl Into<String>) -> Result<Connection, PassthroughError> {
        let mut state = self.inner.state.lock().await;
        let active = state.active_process().ok_or(PassthroughError::NoActiveServer)?;
        let id = ConnectionId(state.next_connection_id);
        state.next_connection_id += 1;
        let connection = Connection::new(id, name, self.inner.events.clone());
        connection.attach(active);
        state.clients.push(connection.clone());
        self.inner.metrics.connections.inc();
        debug!(connection = %id, "client connected");
        Ok(connection)
    }

    /// Stops the active and fails over to a randomly elected passive.
    pub async fn terminate_active(&self) -> Result<(), PassthroughError> {
        let mut state = self.inner.state.lock().await;
        self.inner.terminate_active(&mut state).await
    }

    /// Stops one running passive. Returns `false` when there is none.
    pub async fn terminate_one_passive(&self) -> Result<bool, PassthroughError> {
        let mut state = self.inner.state.lock().await;
        let Some(index) = state.running_passives().into_iter().next() else {
            return Ok(false);
        };
        self.inner.terminate_passive(&mut state, index).await;
        Ok(true)
    }

    /// Starts the first stopped server. Returns `false` when all are running.
    pub async fn start_one_server(&self) -> Result<bool, PassthroughError> {
        let mut state = self.inner.state.lock().await;
        self.inner.start_one_server(&mut state).await
    }

    pub async fn start_all_servers(&self) -> Result<(), PassthroughError> {
        let mut state = self.inner.state.lock().await;
        while self.inner.start_one_server(&mut state).await? {}
        Ok(())
    }

    pub async fn active_server_name(&self) -> Option<String> {
        let state = self.inner.state.lock().await;
        state.active.map(|index| state.servers[index].name.clone())
    }

    /// Names of the servers that are currently running.
    pub async fn running_server_names(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        state
            .servers
            .iter()
            .filter(|server| server.process.is_some())
            .map(|server| server.name.clone())
            .collect()
    }

    /// Snapshot of the named server's process.
    pub async fn snapshot(&self, name: &str) -> Result<ProcessSnapshot, PassthroughError> {
        let process = {
            let state = self.inner.state.lock().await;
            state
                .index_of(name)
                .and_then(|index| state.servers[index].process.clone())
        };
        let process = process.ok_or_else(|| PassthroughError::ServerNotRunning {
            server: name.to_string(),
        })?;
        process.snapshot().await
    }

    /// Stops every server and drops every client without notifying servers.
    #[instrument(skip_all)]
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.events_task.lock().take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                warn!(%error, "event task ended abnormally");
            }
        }
        let mut guard = self.inner.state.lock().await;
        let state = &mut *guard;
        for client in state.clients.drain(..) {
            client.abandon();
        }
        self.inner.metrics.connections.set(0);
        state.active = None;
        for index in 0..state.servers.len() {
            self.inner.stop_server(state, index).await;
        }
        info!("stripe shut down");
    }
}

impl ClusterInner {
    fn start_process(
        &self,
        state: &mut ClusterState,
        index: usize,
        role: ProcessRole,
        load_storage: bool,
    ) -> Result<ServerProcessHandle, PassthroughError> {
        let id = ProcessId(state.next_process_id);
        state.next_process_id += 1;
        let server = &mut state.servers[index];
        let persistence: Arc<dyn PlatformPersistence> = match &server.persistence {
            Some(memory) => {
                if !load_storage {
                    memory.clear();
                }
                Arc::new(memory.clone())
            }
            None => Arc::new(NullPersistence),
        };
        let process = server_process::start(ProcessSettings {
            id,
            name: server.name.clone(),
            role,
            load_storage,
            persistence,
            catalog: Arc::clone(&self.catalog),
            events: self.events.clone(),
            metrics: Arc::clone(&self.metrics),
        })?;
        server.process = Some(process.clone());
        self.metrics.servers_running.inc();
        Ok(process)
    }

    /// Starts a fresh passive and synchronizes it from the active.
    async fn start_passive(&self, state: &mut ClusterState, index: usize) -> Result<(), PassthroughError> {
        let active = state.active_process().ok_or(PassthroughError::NoActiveServer)?;
        let passive = self.start_process(state, index, ProcessRole::Passive, false)?;
        active.attach_passive(passive).await
    }

    async fn stop_server(&self, state: &mut ClusterState, index: usize) {
        if let Some(process) = state.servers[index].process.take() {
            process.stop().await;
            self.metrics.servers_running.dec();
        }
    }

    #[instrument(skip_all, fields(passive = %state.servers[index].name))]
    async fn terminate_passive(&self, state: &mut ClusterState, index: usize) {
        let Some(process) = state.servers[index].process.clone() else {
            return;
        };
        if let Some(active) = state.active_process() {
            if let Err(error) = active.detach_passive(process.id()) {
                debug!(%error, "active gone before detach");
            }
        }
        self.stop_server(state, index).await;
        info!("passive terminated");
    }

    #[instrument(skip_all)]
    async fn terminate_active(&self, state: &mut ClusterState) -> Result<(), PassthroughError> {
        let old = state.active.take().ok_or(PassthroughError::NoActiveServer)?;
        for client in &state.clients {
            client.disconnect();
        }
        self.stop_server(state, old).await;
        self.metrics.failovers.inc();
        self.metrics.entities.set(0);
        info!(server = %state.servers[old].name, "active terminated");

        let candidates = state.running_passives();
        let Some(&winner) = candidates.choose(&mut state.rng) else {
            info!(clients = state.clients.len(), "no server left to promote, clients parked");
            return Ok(());
        };
        let Some(promoted) = state.servers[winner].process.clone() else {
            return Err(PassthroughError::IllegalState {
                reason: "elected server has no process".to_string(),
            });
        };
        promoted.promote_to_active().await?;
        state.active = Some(winner);
        info!(server = %promoted.name(), "passive promoted");

        for index in candidates.into_iter().filter(|index| *index != winner) {
            let Some(passive) = state.servers[index].process.clone() else {
                continue;
            };
            if let Err(error) = promoted.attach_passive(passive).await {
                warn!(passive = %state.servers[index].name, %error, "survivor not re-attached");
            }
        }
        self.reconnect_clients(state, &promoted).await
    }

    /// Moves every client to `process` through the two-phase reconnect, with
    /// resends replayed in their recorded order.
    #[instrument(skip_all, fields(server = %process.name(), clients = state.clients.len()))]
    async fn reconnect_clients(&self, state: &mut ClusterState, process: &ServerProcessHandle) -> Result<(), PassthroughError> {
        let clients = state.clients.clone();
        for client in &clients {
            client.start_reconnect(process).await;
        }
        process.begin_resends()?;
        for client in &clients {
            client.finish_reconnect(process);
        }
        process.end_resends()?;
        info!("clients reconnected");
        Ok(())
    }

    /// Restarts the first stopped server: as a passive when there is an
    /// active, otherwise as the active, loading storage and taking over any
    /// parked clients.
    #[instrument(skip_all)]
    async fn start_one_server(&self, state: &mut ClusterState) -> Result<bool, PassthroughError> {
        let Some(index) = state.servers.iter().position(|server| server.process.is_none()) else {
            return Ok(false);
        };
        self.start_server(state, index).await?;
        Ok(true)
    }

    async fn start_server(&self, state: &mut ClusterState, index: usize) -> Result<(), PassthroughError> {
        if state.active.is_some() {
            info!(server = %state.servers[index].name, "starting as passive");
            return self.start_passive(state, index).await;
        }
        info!(server = %state.servers[index].name, "starting as active");
        let process = self.start_process(state, index, ProcessRole::Active, true)?;
        state.active = Some(index);
        self.reconnect_clients(state, &process).await
    }

    /// Terminates a crashed process, failing over when it was the active,
    /// then starts it again.
    async fn handle_crash(&self, process: ProcessId) -> Result<(), PassthroughError> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let Some(index) = state
            .servers
            .iter()
            .position(|server| server.process.as_ref().is_some_and(|p| p.id() == process))
        else {
            debug!(%process, "crash report for a process already gone");
            return Ok(());
        };
        warn!(server = %state.servers[index].name, %process, "server crashed, restarting");
        if state.active == Some(index) {
            self.terminate_active(state).await?;
        } else {
            self.terminate_passive(state, index).await;
        }
        self.start_server(state, index).await
    }

    async fn connection_closed(&self, connection: ConnectionId) {
        let mut state = self.state.lock().await;
        let before = state.clients.len();
        state.clients.retain(|client| client.id() != connection);
        if state.clients.len() < before {
            self.metrics.connections.dec();
        }
    }
}

async fn run_events(inner: Arc<ClusterInner>, mut events: mpsc::UnboundedReceiver<ClusterEvent>, cancel: CancellationToken) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        match event {
            ClusterEvent::Crash(process) => {
                if let Err(error) = inner.handle_crash(process).await {
                    error!(%process, %error, "crash recovery failed");
                }
            }
            ClusterEvent::ConnectionClosed(connection) => inner.connection_closed(connection).await,
        }
    }
    debug!("cluster event task stopped");
}

impl Drop for ClusterControl {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
