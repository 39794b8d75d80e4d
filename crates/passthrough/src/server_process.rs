//! One simulated server: a single tokio task draining an inbound queue.
//!
//! Everything a server does (entity invocation, replication to passives,
//! lock grants, synchronization of a new passive) happens on that task, one
//! queue entry at a time. Other parties talk to it only through a
//! [`ServerProcessHandle`], which enqueues messages and control requests.

use crate::cluster::ClusterEvent;
use crate::entity_adapter::{ActiveInstance, ErasedEntityService, PassiveInstance};
use crate::envelope::PassthroughMessage;
use crate::error::PassthroughError;
use crate::lifecycle::LifeCycleMessageHandler;
use crate::lock_manager::LockManager;
use crate::message::{ClientSink, Control, Inbound, MessageSender, PendingRetire};
use crate::message_handler::{LockOwner, LockWaiter};
use crate::metrics::StripeMetrics;
use crate::retirement::RetirementManager;
use crate::services::{BuiltinServiceProvider, ServiceCatalog, ServiceConsumer, ServiceProvider, ServiceRegistry};
use crate::storage::{load_element, store_element, PlatformPersistence};
use crate::transaction_order::TransactionOrderManager;
use crate::types::{ClientDescriptor, ConnectionId, EntityTuple, MessageKey, ProcessId};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Persistence element holding the entity registry.
pub const ENTITIES_ELEMENT: &str = "entities.map";

/// Role of a server process within the stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessRole {
    Active,
    Passive,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Active => f.write_str("active"),
            ProcessRole::Passive => f.write_str("passive"),
        }
    }
}

/// Point-in-time view of a process, taken on its message loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub name: String,
    pub process: ProcessId,
    pub role: ProcessRole,
    /// Entities in the process's registry, sorted.
    pub entities: Vec<EntityTuple>,
    /// Passives attached downstream. Always 0 on a passive.
    pub passives: usize,
}

/// How a passive answered a forwarded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassiveOutcome {
    Success,
    Failure,
    /// The passive stopped before answering.
    Gone,
}

/// State of a process that is shared with its handles and with the
/// built-in services handed to entities.
pub(crate) struct ProcessContext {
    pub(crate) id: ProcessId,
    pub(crate) name: String,
    active: AtomicBool,
    running: AtomicBool,
    inbox: mpsc::UnboundedSender<Inbound>,
    /// Sinks of every client that has sent this process a message.
    pub(crate) clients: DashMap<ConnectionId, ClientSink>,
    pub(crate) retirement: Mutex<RetirementManager<MessageKey, Option<PendingRetire>>>,
    next_message_key: AtomicU64,
    pub(crate) persistence: Arc<dyn PlatformPersistence>,
    pub(crate) cancel: CancellationToken,
}

impl ProcessContext {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn next_message_key(&self) -> MessageKey {
        MessageKey(self.next_message_key.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn enqueue(&self, inbound: Inbound) -> Result<(), PassthroughError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(self.not_running());
        }
        self.inbox.send(inbound).map_err(|_| self.not_running())
    }

    fn not_running(&self) -> PassthroughError {
        PassthroughError::ServerNotRunning {
            server: self.name.clone(),
        }
    }
}

/// Handle to a running server process.
#[derive(Clone)]
pub struct ServerProcessHandle {
    ctx: Arc<ProcessContext>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl fmt::Debug for ServerProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerProcessHandle")
            .field("name", &self.ctx.name)
            .field("id", &self.ctx.id)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ServerProcessHandle {
    pub fn id(&self) -> ProcessId {
        self.ctx.id
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn is_running(&self) -> bool {
        self.ctx.running.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.ctx.is_active()
    }

    pub(crate) fn send_from_client(&self, sink: ClientSink, bytes: Vec<u8>) -> Result<(), PassthroughError> {
        self.ctx.enqueue(Inbound::Message {
            sender: MessageSender::Client(sink),
            bytes,
        })
    }

    /// Forwards a message from the active and waits for this process to
    /// finish running it.
    pub(crate) async fn send_interserver(&self, origin: Option<ConnectionId>, bytes: Vec<u8>) -> PassiveOutcome {
        let (complete, done) = oneshot::channel();
        let enqueued = self.ctx.enqueue(Inbound::Message {
            sender: MessageSender::Interserver {
                origin,
                complete: Some(complete),
            },
            bytes,
        });
        if enqueued.is_err() {
            return PassiveOutcome::Gone;
        }
        match done.await {
            Ok(true) => PassiveOutcome::Success,
            Ok(false) => PassiveOutcome::Failure,
            Err(_) => PassiveOutcome::Gone,
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Control,
    ) -> Result<T, PassthroughError> {
        let (tx, rx) = oneshot::channel();
        self.ctx.enqueue(Inbound::Control(build(tx)))?;
        rx.await.map_err(|_| self.ctx.not_running())
    }

    /// Streams every entity to `passive` and adds it to the replication set.
    #[instrument(skip_all, fields(server = %self.ctx.name, passive = %passive.name()))]
    pub(crate) async fn attach_passive(&self, passive: ServerProcessHandle) -> Result<(), PassthroughError> {
        self.request(|done| Control::AttachPassive { passive, done })
            .await?
    }

    pub(crate) fn detach_passive(&self, process: ProcessId) -> Result<(), PassthroughError> {
        self.ctx
            .enqueue(Inbound::Control(Control::DetachPassive { process }))
    }

    #[instrument(skip_all, fields(server = %self.ctx.name))]
    pub(crate) async fn promote_to_active(&self) -> Result<(), PassthroughError> {
        self.request(|done| Control::Promote { done }).await?
    }

    /// Tells the process that `connection` closed.
    pub(crate) fn client_disconnected(&self, connection: ConnectionId) -> Result<(), PassthroughError> {
        self.ctx
            .enqueue(Inbound::Control(Control::ClientDisconnected { connection }))
    }

    /// Client messages arriving from now on are buffered until
    /// [`Self::end_resends`].
    pub(crate) fn begin_resends(&self) -> Result<(), PassthroughError> {
        self.ctx.enqueue(Inbound::Control(Control::BeginResends))
    }

    /// Runs the buffered messages in their original order.
    pub(crate) fn end_resends(&self) -> Result<(), PassthroughError> {
        self.ctx.enqueue(Inbound::Control(Control::EndResends))
    }

    pub async fn snapshot(&self) -> Result<ProcessSnapshot, PassthroughError> {
        self.request(|reply| Control::Snapshot { reply }).await
    }

    /// Resolves once the message loop has stopped or is stopping.
    pub(crate) async fn stopped(&self) {
        self.ctx.cancel.cancelled().await;
    }

    /// Stops the message loop. Queued messages are dropped without answers.
    #[instrument(skip_all, fields(server = %self.ctx.name, process = %self.ctx.id))]
    pub(crate) async fn stop(&self) {
        self.ctx.running.store(false, Ordering::SeqCst);
        self.ctx.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                warn!(%error, "message loop ended abnormally");
            }
        }
        info!("server process stopped");
    }
}

/// Parameters for starting one process incarnation.
pub(crate) struct ProcessSettings {
    pub(crate) id: ProcessId,
    pub(crate) name: String,
    pub(crate) role: ProcessRole,
    pub(crate) load_storage: bool,
    pub(crate) persistence: Arc<dyn PlatformPersistence>,
    pub(crate) catalog: Arc<ServiceCatalog>,
    pub(crate) events: mpsc::UnboundedSender<ClusterEvent>,
    pub(crate) metrics: Arc<StripeMetrics>,
}

/// Entity registry entry as persisted, keyed by consumer id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredEntity {
    class_name: String,
    entity_name: String,
    version: u64,
    configuration: Vec<u8>,
}

/// Registry data shared by active and passive entries.
pub(crate) struct RecordCommon {
    pub(crate) version: u64,
    pub(crate) configuration: Vec<u8>,
    pub(crate) consumer_id: u64,
    pub(crate) service: Arc<dyn ErasedEntityService>,
    pub(crate) registry: ServiceRegistry,
}

pub(crate) struct ActiveRecord {
    pub(crate) common: RecordCommon,
    pub(crate) instance: Box<dyn ActiveInstance>,
    /// Fetches currently holding this entity.
    pub(crate) references: HashSet<ClientDescriptor>,
}

pub(crate) struct PassiveRecord {
    pub(crate) common: RecordCommon,
    pub(crate) instance: Box<dyn PassiveInstance>,
}

pub(crate) enum Role {
    Active {
        entities: HashMap<EntityTuple, ActiveRecord>,
        passives: Vec<ServerProcessHandle>,
    },
    Passive {
        entities: HashMap<EntityTuple, PassiveRecord>,
    },
}

impl Role {
    fn empty(role: ProcessRole) -> Self {
        match role {
            ProcessRole::Active => Role::Active {
                entities: HashMap::new(),
                passives: Vec::new(),
            },
            ProcessRole::Passive => Role::Passive {
                entities: HashMap::new(),
            },
        }
    }

    pub(crate) fn kind(&self) -> ProcessRole {
        match self {
            Role::Active { .. } => ProcessRole::Active,
            Role::Passive { .. } => ProcessRole::Passive,
        }
    }

    pub(crate) fn contains(&self, tuple: &EntityTuple) -> bool {
        match self {
            Role::Active { entities, .. } => entities.contains_key(tuple),
            Role::Passive { entities } => entities.contains_key(tuple),
        }
    }

    fn len(&self) -> usize {
        match self {
            Role::Active { entities, .. } => entities.len(),
            Role::Passive { entities } => entities.len(),
        }
    }

    fn stored_entities(&self) -> BTreeMap<u64, StoredEntity> {
        fn stored(tuple: &EntityTuple, common: &RecordCommon) -> (u64, StoredEntity) {
            (
                common.consumer_id,
                StoredEntity {
                    class_name: tuple.class_name.clone(),
                    entity_name: tuple.entity_name.clone(),
                    version: common.version,
                    configuration: common.configuration.clone(),
                },
            )
        }
        match self {
            Role::Active { entities, .. } => entities
                .iter()
                .map(|(tuple, record)| stored(tuple, &record.common))
                .collect(),
            Role::Passive { entities } => entities
                .iter()
                .map(|(tuple, record)| stored(tuple, &record.common))
                .collect(),
        }
    }
}

/// The state owned by a process's message loop.
pub(crate) struct ServerProcess {
    pub(crate) ctx: Arc<ProcessContext>,
    pub(crate) catalog: Arc<ServiceCatalog>,
    builtin: Arc<dyn ServiceProvider>,
    pub(crate) events: mpsc::UnboundedSender<ClusterEvent>,
    pub(crate) metrics: Arc<StripeMetrics>,
    pub(crate) order: TransactionOrderManager<(MessageSender, Vec<u8>)>,
    pub(crate) lifecycle: LifeCycleMessageHandler,
    pub(crate) locks: LockManager<EntityTuple, LockOwner, LockWaiter>,
    pub(crate) role: Role,
    next_consumer_id: u64,
}

/// Starts a process and spawns its message loop.
#[instrument(skip_all, fields(server = %settings.name, process = %settings.id, role = %settings.role))]
pub(crate) fn start(settings: ProcessSettings) -> Result<ServerProcessHandle, PassthroughError> {
    let (process, inbox) = ServerProcess::new(settings)?;
    let ctx = Arc::clone(&process.ctx);
    let task = tokio::spawn(process.run(inbox));
    info!("server process started");
    Ok(ServerProcessHandle {
        ctx,
        task: Arc::new(Mutex::new(Some(task))),
    })
}

impl ServerProcess {
    /// Builds the process state, loading the entity registry when asked.
    /// Nothing runs until the returned inbox is drained.
    fn new(settings: ProcessSettings) -> Result<(Self, mpsc::UnboundedReceiver<Inbound>), PassthroughError> {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(ProcessContext {
            id: settings.id,
            name: settings.name,
            active: AtomicBool::new(settings.role == ProcessRole::Active),
            running: AtomicBool::new(true),
            inbox,
            clients: DashMap::new(),
            retirement: Mutex::new(RetirementManager::new()),
            next_message_key: AtomicU64::new(1),
            persistence: Arc::clone(&settings.persistence),
            cancel: CancellationToken::new(),
        });
        let builtin: Arc<dyn ServiceProvider> = Arc::new(BuiltinServiceProvider::new(Arc::clone(&ctx)));
        let mut process = ServerProcess {
            ctx,
            catalog: settings.catalog,
            builtin,
            events: settings.events,
            metrics: settings.metrics,
            order: TransactionOrderManager::new(Arc::clone(&settings.persistence), settings.load_storage)?,
            lifecycle: LifeCycleMessageHandler::new(settings.persistence, settings.load_storage)?,
            locks: LockManager::new(),
            role: Role::empty(settings.role),
            next_consumer_id: 1,
        };
        if settings.load_storage {
            process.load_entities()?;
        }
        if settings.role == ProcessRole::Active {
            process.metrics.entities.set(process.role.len() as i64);
        }
        Ok((process, inbox_rx))
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
        let cancel = self.ctx.cancel.clone();
        loop {
            let inbound = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = inbox.recv() => match next {
                    Some(inbound) => inbound,
                    None => break,
                },
            };
            let result = match inbound {
                Inbound::Message { sender, bytes } => self.receive(sender, bytes).await,
                Inbound::Control(control) => self.control(control).await,
            };
            if let Err(error) = result {
                error!(server = %self.ctx.name, %error, "fatal error in message loop");
                self.report_crash(self.ctx.id);
                break;
            }
        }
        self.ctx.running.store(false, Ordering::SeqCst);
        self.ctx.cancel.cancel();
        debug!(server = %self.ctx.name, "message loop finished");
    }

    async fn control(&mut self, control: Control) -> Result<(), PassthroughError> {
        match control {
            Control::AttachPassive { passive, done } => {
                let result = self.attach_passive(passive).await;
                let _ = done.send(result);
            }
            Control::DetachPassive { process } => {
                if let Role::Active { passives, .. } = &mut self.role {
                    passives.retain(|passive| passive.id() != process);
                }
            }
            Control::Promote { done } => {
                let result = self.promote();
                let _ = done.send(result);
            }
            Control::ClientDisconnected { connection } => self.client_disconnected(connection)?,
            Control::BeginResends => {
                debug!(server = %self.ctx.name, "buffering resends");
                self.order.start_handling_resends();
            }
            Control::EndResends => {
                let resends = self.order.stop_handling_resends();
                debug!(server = %self.ctx.name, count = resends.len(), "replaying resends");
                for (sender, bytes) in resends {
                    self.execute(sender, bytes).await?;
                }
            }
            Control::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
        Ok(())
    }

    pub(crate) fn report_crash(&self, process: ProcessId) {
        if self.events.send(ClusterEvent::Crash(process)).is_err() {
            debug!(%process, "no cluster controller to report crash to");
        }
    }

    fn snapshot(&self) -> ProcessSnapshot {
        let (mut entities, passives): (Vec<EntityTuple>, usize) = match &self.role {
            Role::Active { entities, passives } => (entities.keys().cloned().collect(), passives.len()),
            Role::Passive { entities } => (entities.keys().cloned().collect(), 0),
        };
        entities.sort();
        ProcessSnapshot {
            name: self.ctx.name.clone(),
            process: self.ctx.id,
            role: self.role.kind(),
            entities,
            passives,
        }
    }

    pub(crate) fn allocate_consumer_id(&mut self) -> u64 {
        let id = self.next_consumer_id;
        self.next_consumer_id += 1;
        id
    }

    pub(crate) fn registry_for(&self, consumer_id: u64, tuple: &EntityTuple) -> ServiceRegistry {
        ServiceRegistry::new(
            ServiceConsumer {
                consumer_id,
                entity: Some(tuple.clone()),
            },
            Arc::clone(&self.builtin),
            self.catalog.providers(),
        )
    }

    /// Persists the registry and refreshes the entity gauge.
    pub(crate) fn entities_changed(&self) -> Result<(), PassthroughError> {
        if self.role.kind() == ProcessRole::Active {
            self.metrics.entities.set(self.role.len() as i64);
        }
        store_element(
            self.ctx.persistence.as_ref(),
            ENTITIES_ELEMENT,
            &self.role.stored_entities(),
        )
    }

    /// Rebuilds entities from the persisted registry.
    fn load_entities(&mut self) -> Result<(), PassthroughError> {
        let stored: BTreeMap<u64, StoredEntity> =
            load_element(self.ctx.persistence.as_ref(), ENTITIES_ELEMENT)?.unwrap_or_default();
        for (consumer_id, entry) in stored {
            self.next_consumer_id = self.next_consumer_id.max(consumer_id + 1);
            let tuple = EntityTuple::new(entry.class_name, entry.entity_name);
            let service = match self.catalog.for_version(&tuple, entry.version) {
                Ok(service) => service,
                Err(error) => {
                    warn!(entity = %tuple, %error, "skipping stored entity");
                    continue;
                }
            };
            let common = RecordCommon {
                version: entry.version,
                configuration: entry.configuration,
                consumer_id,
                service: Arc::clone(&service),
                registry: self.registry_for(consumer_id, &tuple),
            };
            match &mut self.role {
                Role::Active { entities, .. } => {
                    match service.create_active(&tuple, &common.registry, &common.configuration) {
                        Ok(mut instance) => {
                            instance.load_existing();
                            entities.insert(
                                tuple,
                                ActiveRecord {
                                    common,
                                    instance,
                                    references: HashSet::new(),
                                },
                            );
                        }
                        Err(error) => warn!(entity = %tuple, %error, "stored entity failed to load"),
                    }
                }
                Role::Passive { entities } => {
                    match service.create_passive(&tuple, &common.registry, &common.configuration) {
                        Ok(mut instance) => {
                            instance.load_existing();
                            entities.insert(tuple, PassiveRecord { common, instance });
                        }
                        Err(error) => warn!(entity = %tuple, %error, "stored entity failed to load"),
                    }
                }
            }
        }
        info!(server = %self.ctx.name, entities = self.role.len(), "loaded entities from storage");
        Ok(())
    }

    /// Encodes the full synchronization stream for a new passive: per
    /// entity in creation order, start, then each key's payloads, then end.
    fn synchronization_stream(&self) -> Result<Vec<Vec<u8>>, PassthroughError> {
        let Role::Active { entities, .. } = &self.role else {
            return Err(PassthroughError::IllegalState {
                reason: format!("{} is not active and cannot attach passives", self.ctx.name),
            });
        };
        let mut ordered: Vec<(&EntityTuple, &ActiveRecord)> = entities.iter().collect();
        ordered.sort_by_key(|(_, record)| record.common.consumer_id);

        let mut stream = Vec::new();
        for (tuple, record) in ordered {
            let (class_name, entity_name) = (&tuple.class_name, &tuple.entity_name);
            stream.push(
                PassthroughMessage::sync_entity_start(
                    class_name,
                    entity_name,
                    record.common.version,
                    record.common.configuration.clone(),
                )
                .encode()?,
            );
            for key in record.instance.keys_for_synchronization() {
                stream.push(PassthroughMessage::sync_entity_key_start(class_name, entity_name, key).encode()?);
                match record.instance.synchronization_payloads(key) {
                    Ok(payloads) => {
                        for payload in payloads {
                            stream.push(
                                PassthroughMessage::sync_entity_payload(class_name, entity_name, key, payload)
                                    .encode()?,
                            );
                        }
                    }
                    Err(error) => warn!(entity = %tuple, concurrency_key = key, %error, "synchronization skipped"),
                }
                stream.push(PassthroughMessage::sync_entity_key_end(class_name, entity_name, key).encode()?);
            }
            stream.push(PassthroughMessage::sync_entity_end(class_name, entity_name).encode()?);
        }
        Ok(stream)
    }

    async fn attach_passive(&mut self, passive: ServerProcessHandle) -> Result<(), PassthroughError> {
        let stream = self.synchronization_stream()?;
        let cancel = self.ctx.cancel.clone();
        for bytes in stream {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => PassiveOutcome::Gone,
                outcome = passive.send_interserver(None, bytes) => outcome,
            };
            match outcome {
                PassiveOutcome::Success => {}
                PassiveOutcome::Failure => {
                    warn!(server = %self.ctx.name, passive = %passive.name(), "passive rejected a synchronization message");
                }
                PassiveOutcome::Gone => {
                    return Err(PassthroughError::ServerNotRunning {
                        server: passive.name().to_string(),
                    })
                }
            }
        }
        info!(server = %self.ctx.name, passive = %passive.name(), "passive attached");
        if let Role::Active { passives, .. } = &mut self.role {
            passives.push(passive);
        }
        Ok(())
    }

    /// Turns this passive into the active, rebuilding every entity as an
    /// active instance that loads its existing state.
    fn promote(&mut self) -> Result<(), PassthroughError> {
        let passive_entities = match &mut self.role {
            Role::Passive { entities } => std::mem::take(entities),
            Role::Active { .. } => {
                return Err(PassthroughError::IllegalState {
                    reason: format!("{} is already active", self.ctx.name),
                })
            }
        };
        let mut promoted = HashMap::with_capacity(passive_entities.len());
        for (tuple, record) in passive_entities {
            let common = record.common;
            match common
                .service
                .create_active(&tuple, &common.registry, &common.configuration)
            {
                Ok(mut instance) => {
                    instance.load_existing();
                    promoted.insert(
                        tuple,
                        ActiveRecord {
                            common,
                            instance,
                            references: HashSet::new(),
                        },
                    );
                }
                Err(error) => error!(entity = %tuple, %error, "entity could not be promoted"),
            }
        }
        self.role = Role::Active {
            entities: promoted,
            passives: Vec::new(),
        };
        self.ctx.active.store(true, Ordering::SeqCst);
        self.metrics.entities.set(self.role.len() as i64);
        info!(server = %self.ctx.name, entities = self.role.len(), "promoted to active");
        Ok(())
    }
}
