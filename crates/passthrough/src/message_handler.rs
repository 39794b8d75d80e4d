//! Execution of inbound messages on a server process.
//!
//! A message is acknowledged, replicated to passives when asked, run, and
//! completed. Retirement of the sender's transaction may be held back by
//! self-messages it triggered. Fetches and write-lock acquisitions may park
//! behind a lock; they complete later, when a release grants them.

use crate::envelope::{decode_body, decode_header, MessageBody, MessageHeader, MessageType};
use crate::error::{EntityError, PassthroughError};
use crate::lifecycle::LifeCycleOutcome;
use crate::message::MessageSender;
use crate::services::release_consumer_storage;
use crate::server_process::{ActiveRecord, PassiveOutcome, PassiveRecord, RecordCommon, Role, ServerProcess};
use crate::types::{ClientDescriptor, ConnectionId, EntityTuple, ProcessId};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

type Outcome = Result<Vec<u8>, EntityError>;

/// Who holds or waits for a lock on an entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum LockOwner {
    /// A fetched endpoint holds a read lock.
    Fetch(ClientDescriptor),
    /// A connection holds the write lock.
    Connection(ConnectionId),
}

/// A request parked until its lock is granted.
#[derive(Debug)]
pub(crate) enum LockWaiter {
    Fetch(PendingFetch),
    Write {
        sender: MessageSender,
        transaction_id: u64,
    },
}

#[derive(Debug)]
pub(crate) struct PendingFetch {
    sender: MessageSender,
    transaction_id: u64,
    tuple: EntityTuple,
    descriptor: ClientDescriptor,
}

fn tuple(class_name: String, entity_name: String) -> EntityTuple {
    EntityTuple::new(class_name, entity_name)
}

fn not_on_passive(tuple: &EntityTuple) -> EntityError {
    EntityError::server(tuple, "operation is only valid on the active server")
}

fn not_on_active(tuple: &EntityTuple) -> EntityError {
    EntityError::server(tuple, "operation is only valid on a passive server")
}

fn no_client(tuple: &EntityTuple) -> EntityError {
    EntityError::server(tuple, "operation requires a client connection")
}

fn check_version(tuple: &EntityTuple, common: &RecordCommon, version: u64) -> Result<(), EntityError> {
    if common.version != version {
        return Err(EntityError::version_mismatch(tuple, common.version, version));
    }
    Ok(())
}

impl ServerProcess {
    /// Entry point for every inbound message. Client messages are buffered
    /// while the process is collecting resends.
    pub(crate) async fn receive(&mut self, sender: MessageSender, bytes: Vec<u8>) -> Result<(), PassthroughError> {
        if let MessageSender::Client(sink) = &sender {
            let connection_id = sink.connection_id;
            self.ctx.clients.insert(connection_id, sink.clone());
            let header = decode_header(&bytes)?;
            return match self
                .order
                .handle_resend(connection_id, header.transaction_id, (sender, bytes))
            {
                Some((sender, bytes)) => self.execute(sender, bytes).await,
                None => {
                    debug!(
                        server = %self.ctx.name,
                        connection = %connection_id,
                        transaction_id = header.transaction_id,
                        "buffered resend"
                    );
                    Ok(())
                }
            };
        }
        self.execute(sender, bytes).await
    }

    pub(crate) async fn execute(&mut self, mut sender: MessageSender, bytes: Vec<u8>) -> Result<(), PassthroughError> {
        let header = decode_header(&bytes)?;
        self.metrics.messages_processed.inc();
        let origin = sender.client_origin();
        if let Some(origin) = origin {
            self.order
                .update_tracking(origin, header.transaction_id, header.oldest_transaction_id)?;
        }
        sender.send_ack(self.ctx.id, header.transaction_id)?;
        let body = decode_body(&header, &bytes)?;
        trace!(
            server = %self.ctx.name,
            message_type = ?header.message_type,
            transaction_id = header.transaction_id,
            "executing message"
        );

        if let Some(result) = self.replay_lifecycle(origin, &header) {
            debug!(
                server = %self.ctx.name,
                message_type = ?header.message_type,
                transaction_id = header.transaction_id,
                "replaying recorded lifecycle outcome"
            );
            return self.finish(sender, header.transaction_id, result);
        }

        let outcomes = if header.should_replicate && self.should_replicate(&body) {
            match self.replicate(origin, &bytes).await {
                Some(outcomes) => outcomes,
                None => {
                    // Left unanswered: the client resends it to the next active.
                    debug!(
                        server = %self.ctx.name,
                        message_type = ?header.message_type,
                        transaction_id = header.transaction_id,
                        "stopped during replication, message dropped"
                    );
                    return Ok(());
                }
            }
        } else {
            Vec::new()
        };

        match body {
            MessageBody::FetchEntity {
                class_name,
                entity_name,
                client_instance_id,
                version,
            } => self.fetch(
                sender,
                header.transaction_id,
                tuple(class_name, entity_name),
                client_instance_id,
                version,
            ),
            MessageBody::LockAcquire {
                class_name,
                entity_name,
            } => self.lock_acquire(sender, header.transaction_id, tuple(class_name, entity_name)),
            body => {
                let result = self.dispatch(origin, header, body).await?;
                if self.resolve_consensus(header.message_type, result.is_ok(), &outcomes) {
                    return Ok(());
                }
                self.finish(sender, header.transaction_id, result)
            }
        }
    }

    async fn dispatch(
        &mut self,
        origin: Option<ConnectionId>,
        header: MessageHeader,
        body: MessageBody,
    ) -> Result<Outcome, PassthroughError> {
        match body {
            MessageBody::CreateEntity {
                class_name,
                entity_name,
                version,
                configuration,
            } => {
                let tuple = tuple(class_name, entity_name);
                let result = self.create_entity(&tuple, version, configuration);
                self.lifecycle_done(origin, header, &tuple, "created", result)
            }
            MessageBody::ReconfigureEntity {
                class_name,
                entity_name,
                version,
                configuration,
            } => {
                let tuple = tuple(class_name, entity_name);
                let result = self.reconfigure_entity(&tuple, version, configuration);
                self.lifecycle_done(origin, header, &tuple, "reconfigured", result)
            }
            MessageBody::DestroyEntity {
                class_name,
                entity_name,
            } => {
                let tuple = tuple(class_name, entity_name);
                let result = self.destroy_entity(&tuple);
                self.lifecycle_done(origin, header, &tuple, "destroyed", result)
            }
            MessageBody::DoesEntityExist {
                class_name,
                entity_name,
            } => Ok(Ok(vec![u8::from(self.role.contains(&tuple(class_name, entity_name)))])),
            MessageBody::ReleaseEntity {
                class_name,
                entity_name,
                client_instance_id,
            } => self.release(origin, tuple(class_name, entity_name), client_instance_id, true),
            MessageBody::UnexpectedRelease {
                class_name,
                entity_name,
                client_instance_id,
            } => self.release(origin, tuple(class_name, entity_name), client_instance_id, false),
            MessageBody::InvokeOnServer {
                class_name,
                entity_name,
                client_instance_id,
                payload,
            } => Ok(self
                .invoke(origin, header, tuple(class_name, entity_name), client_instance_id, &payload)
                .await),
            MessageBody::Reconnect {
                class_name,
                entity_name,
                client_instance_id,
                extended_data,
            } => Ok(self.reconnect(origin, tuple(class_name, entity_name), client_instance_id, &extended_data)),
            MessageBody::LockTryAcquire {
                class_name,
                entity_name,
            } => Ok(self.lock_try_acquire(origin, tuple(class_name, entity_name))),
            MessageBody::LockRelease {
                class_name,
                entity_name,
            } => self.lock_release(origin, tuple(class_name, entity_name)),
            MessageBody::LockRestore {
                class_name,
                entity_name,
            } => Ok(self.lock_restore(origin, tuple(class_name, entity_name))),
            MessageBody::SyncEntityStart {
                class_name,
                entity_name,
                version,
                configuration,
            } => {
                let tuple = tuple(class_name, entity_name);
                let result = self.synchronize_entity(&tuple, version, configuration);
                if result.is_ok() {
                    self.entities_changed()?;
                }
                Ok(result)
            }
            MessageBody::SyncEntityEnd {
                class_name,
                entity_name,
            } => Ok(self.with_passive(&tuple(class_name, entity_name), |record| {
                record.instance.end_sync_entity();
            })),
            MessageBody::SyncEntityKeyStart {
                class_name,
                entity_name,
                concurrency_key,
            } => Ok(self.with_passive(&tuple(class_name, entity_name), |record| {
                record.instance.start_sync_concurrency_key(concurrency_key);
            })),
            MessageBody::SyncEntityKeyEnd {
                class_name,
                entity_name,
                concurrency_key,
            } => Ok(self.with_passive(&tuple(class_name, entity_name), |record| {
                record.instance.end_sync_concurrency_key(concurrency_key);
            })),
            MessageBody::SyncEntityPayload {
                class_name,
                entity_name,
                concurrency_key,
                payload,
            } => Ok(self
                .sync_payload(tuple(class_name, entity_name), concurrency_key, &payload)
                .await),
            body @ (MessageBody::FetchEntity { .. }
            | MessageBody::LockAcquire { .. }
            | MessageBody::AckFromServer
            | MessageBody::CompleteFromServer { .. }
            | MessageBody::ExceptionFromServer { .. }
            | MessageBody::RetireFromServer
            | MessageBody::InvokeOnClient { .. }
            | MessageBody::MonitorMessage { .. }
            | MessageBody::MonitorException { .. }) => Err(PassthroughError::MalformedMessage {
                reason: format!("{:?} cannot be dispatched by a server", body.message_type()),
                source: None,
            }),
        }
    }

    /// Completes the sender's transaction and retires whatever became
    /// retirable.
    pub(crate) fn finish(&self, mut sender: MessageSender, transaction_id: u64, result: Outcome) -> Result<(), PassthroughError> {
        sender.send_complete(self.ctx.id, transaction_id, result)?;
        let completed = sender.internal_key();
        let pending = sender.pending_retire(transaction_id);
        let ready = {
            let mut retirement = self.ctx.retirement.lock();
            let mut ready = retirement.retire_ready_after(completed.as_ref());
            if let Some(now) = retirement.add_retirement_tuple(pending) {
                ready.push(now);
            }
            ready
        };
        for retire in ready.into_iter().flatten() {
            retire.send(self.ctx.id)?;
        }
        Ok(())
    }

    /// The recorded result of a lifecycle message that already ran.
    fn replay_lifecycle(&self, origin: Option<ConnectionId>, header: &MessageHeader) -> Option<Outcome> {
        if !matches!(
            header.message_type,
            MessageType::CreateEntity | MessageType::ReconfigureEntity | MessageType::DestroyEntity
        ) {
            return None;
        }
        self.lifecycle
            .did_already_handle(origin?, header.transaction_id)
            .map(LifeCycleOutcome::into_result)
    }

    fn lifecycle_done(
        &mut self,
        origin: Option<ConnectionId>,
        header: MessageHeader,
        tuple: &EntityTuple,
        verb: &'static str,
        result: Outcome,
    ) -> Result<Outcome, PassthroughError> {
        if let Some(origin) = origin {
            self.lifecycle.record(
                origin,
                header.transaction_id,
                header.oldest_transaction_id,
                result.clone().into(),
            )?;
        }
        match &result {
            Ok(_) => {
                info!(server = %self.ctx.name, entity = %tuple, "entity {verb}");
                self.entities_changed()?;
            }
            Err(error) => debug!(server = %self.ctx.name, entity = %tuple, %error, "lifecycle operation failed"),
        }
        Ok(result)
    }

    /// A destroy the active is going to refuse is not forwarded, so passives
    /// never drop an entity the active keeps.
    fn should_replicate(&self, body: &MessageBody) -> bool {
        match (body, &self.role) {
            (
                MessageBody::DestroyEntity {
                    class_name,
                    entity_name,
                },
                Role::Active { entities, .. },
            ) => entities
                .get(&EntityTuple::new(class_name.clone(), entity_name.clone()))
                .is_some_and(|record| record.references.is_empty()),
            _ => true,
        }
    }

    /// Forwards a message to every passive, one at a time, and waits for each
    /// to run it. `None` when this process is stopped before every passive
    /// answered.
    async fn replicate(&mut self, origin: Option<ConnectionId>, bytes: &[u8]) -> Option<Vec<(ProcessId, PassiveOutcome)>> {
        let passives = match &self.role {
            Role::Active { passives, .. } => passives.clone(),
            Role::Passive { .. } => return Some(Vec::new()),
        };
        let cancel = self.ctx.cancel.clone();
        let mut outcomes = Vec::with_capacity(passives.len());
        for passive in passives {
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                outcome = passive.send_interserver(origin, bytes.to_vec()) => outcome,
            };
            if outcome == PassiveOutcome::Gone {
                debug!(server = %self.ctx.name, passive = %passive.name(), "passive went away during replication");
            }
            outcomes.push((passive.id(), outcome));
        }
        Some(outcomes)
    }

    /// Reconciles active and passive results of a replicated lifecycle
    /// message. Returns true when the response must be withheld because this
    /// process is about to be restarted.
    fn resolve_consensus(
        &self,
        message_type: MessageType,
        active_ok: bool,
        outcomes: &[(ProcessId, PassiveOutcome)],
    ) -> bool {
        let failed: Vec<ProcessId> = outcomes
            .iter()
            .filter(|(_, outcome)| *outcome == PassiveOutcome::Failure)
            .map(|(process, _)| *process)
            .collect();
        if !matches!(message_type, MessageType::CreateEntity | MessageType::ReconfigureEntity) {
            if !failed.is_empty() {
                warn!(server = %self.ctx.name, ?message_type, passives = failed.len(), "passives failed a replicated message");
            }
            return false;
        }
        let any_passive_ok = outcomes
            .iter()
            .any(|(_, outcome)| *outcome == PassiveOutcome::Success);
        if active_ok {
            for process in failed {
                warn!(server = %self.ctx.name, passive = %process, ?message_type, "passive disagreed with active, restarting it");
                self.report_crash(process);
            }
            false
        } else if any_passive_ok {
            for process in failed {
                self.report_crash(process);
            }
            warn!(server = %self.ctx.name, ?message_type, "active disagreed with passives, restarting active");
            self.report_crash(self.ctx.id);
            true
        } else {
            false
        }
    }

    fn create_entity(&mut self, tuple: &EntityTuple, version: u64, configuration: Vec<u8>) -> Outcome {
        if self.role.contains(tuple) {
            return Err(EntityError::already_exists(tuple));
        }
        let service = self.catalog.for_version(tuple, version)?;
        let consumer_id = self.allocate_consumer_id();
        let common = RecordCommon {
            version,
            configuration,
            consumer_id,
            service: Arc::clone(&service),
            registry: self.registry_for(consumer_id, tuple),
        };
        match &mut self.role {
            Role::Active { entities, .. } => {
                let mut instance = service.create_active(tuple, &common.registry, &common.configuration)?;
                instance.create_new()?;
                entities.insert(
                    tuple.clone(),
                    ActiveRecord {
                        common,
                        instance,
                        references: HashSet::new(),
                    },
                );
            }
            Role::Passive { entities } => {
                let mut instance = service.create_passive(tuple, &common.registry, &common.configuration)?;
                instance.create_new()?;
                entities.insert(tuple.clone(), PassiveRecord { common, instance });
            }
        }
        Ok(Vec::new())
    }

    /// Applies a new configuration and answers with the previous one.
    fn reconfigure_entity(&mut self, tuple: &EntityTuple, version: u64, configuration: Vec<u8>) -> Outcome {
        match &mut self.role {
            Role::Active { entities, .. } => {
                let record = entities.get_mut(tuple).ok_or_else(|| EntityError::not_found(tuple))?;
                check_version(tuple, &record.common, version)?;
                record.instance.reconfigure(&record.common.registry, &configuration)?;
                Ok(std::mem::replace(&mut record.common.configuration, configuration))
            }
            Role::Passive { entities } => {
                let record = entities.get_mut(tuple).ok_or_else(|| EntityError::not_found(tuple))?;
                check_version(tuple, &record.common, version)?;
                record.instance.reconfigure(&record.common.registry, &configuration)?;
                Ok(std::mem::replace(&mut record.common.configuration, configuration))
            }
        }
    }

    /// Answers `[1]` when the entity was destroyed and `[0]` when fetches
    /// still hold it.
    fn destroy_entity(&mut self, tuple: &EntityTuple) -> Outcome {
        let consumer_id = match &mut self.role {
            Role::Active { entities, .. } => {
                let record = entities.get(tuple).ok_or_else(|| EntityError::not_found(tuple))?;
                if !record.references.is_empty() {
                    return Ok(vec![0]);
                }
                let mut record = entities.remove(tuple).ok_or_else(|| EntityError::not_found(tuple))?;
                record.instance.destroy();
                record.common.consumer_id
            }
            Role::Passive { entities } => {
                let mut record = entities.remove(tuple).ok_or_else(|| EntityError::not_found(tuple))?;
                record.instance.destroy();
                record.common.consumer_id
            }
        };
        if let Err(error) = release_consumer_storage(self.ctx.persistence.as_ref(), consumer_id) {
            warn!(server = %self.ctx.name, entity = %tuple, %error, "storage of destroyed entity not released");
        }
        Ok(vec![1])
    }

    async fn invoke(
        &mut self,
        origin: Option<ConnectionId>,
        header: MessageHeader,
        tuple: EntityTuple,
        client_instance_id: u64,
        payload: &[u8],
    ) -> Outcome {
        match &mut self.role {
            Role::Active { entities, .. } => {
                let record = entities.get_mut(&tuple).ok_or_else(|| EntityError::not_found(&tuple))?;
                let context = crate::entity::InvokeContext {
                    client: origin.map(|connection| ClientDescriptor::new(connection, client_instance_id)),
                    entity: tuple,
                    transaction_id: header.transaction_id,
                    oldest_transaction_id: header.oldest_transaction_id,
                    concurrency_key: crate::entity::MANAGEMENT_KEY,
                };
                record.instance.invoke(context, payload).await
            }
            Role::Passive { entities } => {
                let record = entities.get_mut(&tuple).ok_or_else(|| EntityError::not_found(&tuple))?;
                record.instance.invoke(payload).await.map(|()| Vec::new())
            }
        }
    }

    /// Drops a fetch's reference and read lock. An unexpected release for an
    /// entity that is already gone is not an error.
    fn release(
        &mut self,
        origin: Option<ConnectionId>,
        tuple: EntityTuple,
        client_instance_id: u64,
        strict: bool,
    ) -> Result<Outcome, PassthroughError> {
        let Some(descriptor) = origin.map(|connection| ClientDescriptor::new(connection, client_instance_id)) else {
            return Ok(Err(no_client(&tuple)));
        };
        let Role::Active { entities, .. } = &mut self.role else {
            return Ok(Err(not_on_passive(&tuple)));
        };
        match entities.get_mut(&tuple) {
            Some(record) => {
                if record.references.remove(&descriptor) {
                    record.instance.disconnected(descriptor);
                }
            }
            None if strict => return Ok(Err(EntityError::not_found(&tuple))),
            None => {}
        }
        let granted = self.locks.release_read(&tuple, &LockOwner::Fetch(descriptor));
        self.run_granted(granted)?;
        Ok(Ok(Vec::new()))
    }

    fn reconnect(
        &mut self,
        origin: Option<ConnectionId>,
        tuple: EntityTuple,
        client_instance_id: u64,
        extended_data: &[u8],
    ) -> Outcome {
        let descriptor = origin
            .map(|connection| ClientDescriptor::new(connection, client_instance_id))
            .ok_or_else(|| no_client(&tuple))?;
        let Role::Active { entities, .. } = &mut self.role else {
            return Err(not_on_passive(&tuple));
        };
        let record = entities.get_mut(&tuple).ok_or_else(|| EntityError::not_found(&tuple))?;
        if let Err(conflict) = self.locks.restore_read(tuple.clone(), LockOwner::Fetch(descriptor)) {
            warn!(server = %self.ctx.name, entity = %tuple, client = %descriptor, %conflict, "read lock not restored");
        }
        if record.references.insert(descriptor) {
            record.instance.connected(descriptor);
        }
        record.instance.handle_reconnect(descriptor, extended_data);
        debug!(server = %self.ctx.name, entity = %tuple, client = %descriptor, "fetch reconnected");
        Ok(Vec::new())
    }

    fn fetch(
        &mut self,
        sender: MessageSender,
        transaction_id: u64,
        tuple: EntityTuple,
        client_instance_id: u64,
        version: u64,
    ) -> Result<(), PassthroughError> {
        let Some(descriptor) = sender.client_descriptor(client_instance_id) else {
            return self.finish(sender, transaction_id, Err(no_client(&tuple)));
        };
        let checked = match &self.role {
            Role::Active { entities, .. } => entities
                .get(&tuple)
                .ok_or_else(|| EntityError::not_found(&tuple))
                .and_then(|record| check_version(&tuple, &record.common, version)),
            Role::Passive { .. } => Err(not_on_passive(&tuple)),
        };
        if let Err(error) = checked {
            return self.finish(sender, transaction_id, Err(error));
        }
        let waiter = LockWaiter::Fetch(PendingFetch {
            sender,
            transaction_id,
            tuple: tuple.clone(),
            descriptor,
        });
        let granted = self.locks.acquire_read(tuple.clone(), LockOwner::Fetch(descriptor), waiter);
        if granted.is_empty() {
            debug!(server = %self.ctx.name, entity = %tuple, client = %descriptor, "fetch waiting for write lock");
        }
        self.run_granted(granted)
    }

    fn lock_acquire(&mut self, sender: MessageSender, transaction_id: u64, tuple: EntityTuple) -> Result<(), PassthroughError> {
        let Some(connection) = sender.client_origin() else {
            return self.finish(sender, transaction_id, Err(no_client(&tuple)));
        };
        if !matches!(self.role, Role::Active { .. }) {
            return self.finish(sender, transaction_id, Err(not_on_passive(&tuple)));
        }
        let granted = self.locks.acquire_write(
            tuple.clone(),
            LockOwner::Connection(connection),
            LockWaiter::Write {
                sender,
                transaction_id,
            },
        );
        if granted.is_empty() {
            debug!(server = %self.ctx.name, entity = %tuple, %connection, "write lock queued");
        }
        self.run_granted(granted)
    }

    fn lock_try_acquire(&mut self, origin: Option<ConnectionId>, tuple: EntityTuple) -> Outcome {
        let connection = origin.ok_or_else(|| no_client(&tuple))?;
        if !matches!(self.role, Role::Active { .. }) {
            return Err(not_on_passive(&tuple));
        }
        let acquired = self.locks.try_acquire_write(tuple, LockOwner::Connection(connection));
        Ok(vec![u8::from(acquired)])
    }

    fn lock_release(&mut self, origin: Option<ConnectionId>, tuple: EntityTuple) -> Result<Outcome, PassthroughError> {
        let Some(connection) = origin else {
            return Ok(Err(no_client(&tuple)));
        };
        let granted = self.locks.release_write(&tuple, &LockOwner::Connection(connection));
        self.run_granted(granted)?;
        Ok(Ok(Vec::new()))
    }

    fn lock_restore(&mut self, origin: Option<ConnectionId>, tuple: EntityTuple) -> Outcome {
        let connection = origin.ok_or_else(|| no_client(&tuple))?;
        self.locks
            .restore_write(tuple.clone(), LockOwner::Connection(connection))
            .map(|()| Vec::new())
            .map_err(|conflict| EntityError::server(&tuple, conflict.to_string()))
    }

    /// Forgets a closed connection: its queued fetches and lock requests are
    /// dropped unanswered and anything it still holds is released.
    pub(crate) fn client_disconnected(&mut self, connection: ConnectionId) -> Result<(), PassthroughError> {
        self.ctx.clients.remove(&connection);
        if let Role::Active { entities, .. } = &mut self.role {
            for record in entities.values_mut() {
                let gone: Vec<ClientDescriptor> = record
                    .references
                    .iter()
                    .filter(|descriptor| descriptor.connection_id == connection)
                    .copied()
                    .collect();
                for descriptor in gone {
                    record.references.remove(&descriptor);
                    record.instance.disconnected(descriptor);
                }
            }
        }
        let granted = self.locks.forget_owners(|owner| match owner {
            LockOwner::Fetch(descriptor) => descriptor.connection_id == connection,
            LockOwner::Connection(owner) => *owner == connection,
        });
        debug!(server = %self.ctx.name, %connection, granted = granted.len(), "client disconnected");
        self.run_granted(granted)
    }

    /// Completes every granted waiter. A fetch whose entity vanished while it
    /// waited fails and hands its read lock on.
    fn run_granted(&mut self, granted: Vec<LockWaiter>) -> Result<(), PassthroughError> {
        let mut queue: VecDeque<LockWaiter> = granted.into();
        while let Some(waiter) = queue.pop_front() {
            match waiter {
                LockWaiter::Fetch(fetch) => {
                    let result = self.complete_fetch(&fetch.tuple, fetch.descriptor);
                    if result.is_err() {
                        queue.extend(
                            self.locks
                                .release_read(&fetch.tuple, &LockOwner::Fetch(fetch.descriptor)),
                        );
                    }
                    self.finish(fetch.sender, fetch.transaction_id, result)?;
                }
                LockWaiter::Write {
                    sender,
                    transaction_id,
                } => self.finish(sender, transaction_id, Ok(Vec::new()))?,
            }
        }
        Ok(())
    }

    /// Attaches a granted fetch and answers with the entity configuration.
    fn complete_fetch(&mut self, tuple: &EntityTuple, descriptor: ClientDescriptor) -> Outcome {
        let Role::Active { entities, .. } = &mut self.role else {
            return Err(not_on_passive(tuple));
        };
        let record = entities.get_mut(tuple).ok_or_else(|| EntityError::not_found(tuple))?;
        if record.references.insert(descriptor) {
            record.instance.connected(descriptor);
        }
        Ok(record.common.configuration.clone())
    }

    /// Creates, or rebuilds, a passive entity from the start of its
    /// synchronization stream.
    fn synchronize_entity(&mut self, tuple: &EntityTuple, version: u64, configuration: Vec<u8>) -> Outcome {
        let existing = match &self.role {
            Role::Passive { entities } => entities.get(tuple).map(|record| record.common.consumer_id),
            Role::Active { .. } => return Err(not_on_active(tuple)),
        };
        let service = self.catalog.for_version(tuple, version)?;
        let consumer_id = match existing {
            Some(consumer_id) => consumer_id,
            None => self.allocate_consumer_id(),
        };
        let common = RecordCommon {
            version,
            configuration,
            consumer_id,
            service: Arc::clone(&service),
            registry: self.registry_for(consumer_id, tuple),
        };
        let mut instance = service.create_passive(tuple, &common.registry, &common.configuration)?;
        instance.start_sync_entity();
        if let Role::Passive { entities } = &mut self.role {
            if entities
                .insert(tuple.clone(), PassiveRecord { common, instance })
                .is_some()
            {
                debug!(server = %self.ctx.name, entity = %tuple, "rebuilt passive entity from synchronization");
            }
        }
        Ok(Vec::new())
    }

    fn with_passive(&mut self, tuple: &EntityTuple, apply: impl FnOnce(&mut PassiveRecord)) -> Outcome {
        let Role::Passive { entities } = &mut self.role else {
            return Err(not_on_active(tuple));
        };
        let record = entities.get_mut(tuple).ok_or_else(|| EntityError::not_found(tuple))?;
        apply(record);
        Ok(Vec::new())
    }

    async fn sync_payload(&mut self, tuple: EntityTuple, concurrency_key: i32, payload: &[u8]) -> Outcome {
        let Role::Passive { entities } = &mut self.role else {
            return Err(not_on_active(&tuple));
        };
        let record = entities.get_mut(&tuple).ok_or_else(|| EntityError::not_found(&tuple))?;
        record
            .instance
            .sync_payload(concurrency_key, payload)
            .await
            .map(|()| Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterEvent;
    use crate::entity::MessageCodec;
    use crate::envelope::PassthroughMessage;
    use crate::server_process::test_support::{client, completions, delivered, Harness};
    use crate::server_process::ProcessRole;
    use crate::storage::memory_persistence::MemoryPersistence;
    use crate::storage::PlatformPersistence;
    use crate::testing::{CounterCodec, CounterMessage, CounterService, COUNTER_CLASS, COUNTER_VERSION};

    fn counter() -> EntityTuple {
        EntityTuple::new(COUNTER_CLASS, "a")
    }

    fn create() -> PassthroughMessage {
        PassthroughMessage::create_entity(COUNTER_CLASS, "a", COUNTER_VERSION, Vec::new())
    }

    fn active(storage: &MemoryPersistence) -> Harness {
        Harness::new(1, ProcessRole::Active, &CounterService::new(), storage, false)
    }

    fn crashes(harness: &mut Harness) -> Vec<ProcessId> {
        std::iter::from_fn(|| harness.events.try_recv().ok())
            .filter_map(|event| match event {
                ClusterEvent::Crash(process) => Some(process),
                ClusterEvent::ConnectionClosed(_) => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn failed_passive_is_restarted_when_active_succeeds() {
        let mut active = active(&MemoryPersistence::new());
        let outcomes = [
            (ProcessId(2), PassiveOutcome::Failure),
            (ProcessId(3), PassiveOutcome::Success),
        ];
        assert!(!active.process.resolve_consensus(MessageType::CreateEntity, true, &outcomes));
        assert_eq!(crashes(&mut active), vec![ProcessId(2)]);
    }

    #[tokio::test]
    async fn active_is_restarted_when_a_passive_alone_succeeds() {
        let mut active = active(&MemoryPersistence::new());
        let outcomes = [
            (ProcessId(2), PassiveOutcome::Success),
            (ProcessId(3), PassiveOutcome::Failure),
        ];
        assert!(active.process.resolve_consensus(MessageType::ReconfigureEntity, false, &outcomes));
        assert_eq!(crashes(&mut active), vec![ProcessId(3), ProcessId(1)]);
    }

    #[tokio::test]
    async fn unanimous_failure_and_other_messages_restart_nothing() {
        let mut active = active(&MemoryPersistence::new());
        let failed = [(ProcessId(2), PassiveOutcome::Failure)];
        assert!(!active.process.resolve_consensus(MessageType::CreateEntity, false, &failed));
        assert!(!active.process.resolve_consensus(MessageType::InvokeOnServer, true, &failed));
        assert!(!active.process.resolve_consensus(MessageType::DestroyEntity, false, &[(ProcessId(2), PassiveOutcome::Success)]));
        assert!(!active.process.resolve_consensus(MessageType::CreateEntity, true, &[(ProcessId(2), PassiveOutcome::Gone)]));
        assert!(crashes(&mut active).is_empty());
    }

    /// A process stopped while a passive still runs the message neither
    /// applies nor answers it.
    #[tokio::test]
    async fn stop_during_replication_leaves_message_unanswered() {
        let storage = MemoryPersistence::new();
        let mut active = active(&storage);
        let passive = Harness::new(2, ProcessRole::Passive, &CounterService::new(), &MemoryPersistence::new(), false);
        let (sink, mut rx) = client(1);
        active.from_client(&sink, create(), 1).await;
        assert_eq!(completions(&mut rx).len(), 1);

        if let Role::Active { passives, .. } = &mut active.process.role {
            passives.push(passive.idle_handle());
        }
        active.process.ctx.cancel.cancel();
        let payload = CounterCodec.encode_message(&CounterMessage::Increment(3)).unwrap();
        active
            .from_client(&sink, PassthroughMessage::invoke_on_server(COUNTER_CLASS, "a", 1, payload, true), 2)
            .await;

        let kinds: Vec<MessageType> = delivered(&mut rx).iter().map(PassthroughMessage::message_type).collect();
        assert_eq!(kinds, vec![MessageType::AckFromServer]);
        let stored = storage.load_data_element("consumer-1/value").unwrap();
        assert_eq!(stored, Some(0i64.to_be_bytes().to_vec()));
    }

    #[tokio::test]
    async fn closed_connection_gives_up_its_queued_lock_requests() {
        let mut active = active(&MemoryPersistence::new());
        let (holder, mut holder_rx) = client(1);
        let (waiter, mut waiter_rx) = client(2);
        active.from_client(&holder, create(), 1).await;
        active
            .from_client(&holder, PassthroughMessage::lock_acquire(COUNTER_CLASS, "a"), 2)
            .await;
        assert_eq!(completions(&mut holder_rx).len(), 2);

        active
            .from_client(&waiter, PassthroughMessage::lock_acquire(COUNTER_CLASS, "a"), 1)
            .await;
        active
            .from_client(&waiter, PassthroughMessage::fetch_entity(COUNTER_CLASS, "a", 1, COUNTER_VERSION), 2)
            .await;
        assert_eq!(active.process.locks.waiting_count(&counter()), 2);

        active.process.client_disconnected(ConnectionId(2)).unwrap();
        assert_eq!(active.process.locks.waiting_count(&counter()), 0);
        assert!(!active.process.ctx.clients.contains_key(&ConnectionId(2)));

        active
            .from_client(&holder, PassthroughMessage::lock_release(COUNTER_CLASS, "a"), 3)
            .await;
        assert_eq!(active.process.locks.write_owner(&counter()), None);
        assert!(completions(&mut waiter_rx).is_empty());
    }

    #[tokio::test]
    async fn closed_connection_releases_its_fetches() {
        let mut active = active(&MemoryPersistence::new());
        let (sink, mut rx) = client(1);
        active.from_client(&sink, create(), 1).await;
        active
            .from_client(&sink, PassthroughMessage::fetch_entity(COUNTER_CLASS, "a", 7, COUNTER_VERSION), 2)
            .await;
        assert_eq!(active.process.locks.read_owner_count(&counter()), 1);

        active.process.client_disconnected(ConnectionId(1)).unwrap();
        assert_eq!(active.process.locks.read_owner_count(&counter()), 0);

        let (other, mut other_rx) = client(2);
        active
            .from_client(&other, PassthroughMessage::destroy_entity(COUNTER_CLASS, "a"), 1)
            .await;
        assert_eq!(completions(&mut other_rx), vec![(1, Ok(vec![1]))]);
        assert_eq!(completions(&mut rx).len(), 2);
    }

    #[tokio::test]
    async fn destroy_releases_entity_storage() {
        let storage = MemoryPersistence::new();
        let mut active = active(&storage);
        let (sink, mut rx) = client(1);
        active.from_client(&sink, create(), 1).await;
        assert!(storage.element_names().iter().any(|name| name.starts_with("consumer-1/")));

        active
            .from_client(&sink, PassthroughMessage::destroy_entity(COUNTER_CLASS, "a"), 2)
            .await;
        assert_eq!(completions(&mut rx)[1], (2, Ok(vec![1])));
        assert!(!storage.element_names().iter().any(|name| name.starts_with("consumer-")));
    }
}
