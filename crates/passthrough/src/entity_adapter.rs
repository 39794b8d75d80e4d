//! Erases typed entity services into the byte-level instances the server
//! process stores and dispatches to.

use crate::entity::{
    ActiveEntityBox, ConcurrencyStrategy, EntityServerService, ExecutionStrategy, InvokeContext,
    MessageCodec, PassiveEntityBox, PassiveSynchronizationChannel, SyncMessageCodec,
};
use crate::error::EntityError;
use crate::services::ServiceRegistry;
use crate::types::{ClientDescriptor, EntityTuple};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

pub(crate) trait ErasedEntityService: Send + Sync {
    fn version(&self) -> u64;

    fn handles_entity_type(&self, class_name: &str) -> bool;

    fn create_active(
        &self,
        tuple: &EntityTuple,
        registry: &ServiceRegistry,
        configuration: &[u8],
    ) -> Result<Box<dyn ActiveInstance>, EntityError>;

    fn create_passive(
        &self,
        tuple: &EntityTuple,
        registry: &ServiceRegistry,
        configuration: &[u8],
    ) -> Result<Box<dyn PassiveInstance>, EntityError>;
}

#[async_trait]
pub(crate) trait ActiveInstance: Send {
    async fn invoke(&mut self, context: InvokeContext, payload: &[u8]) -> Result<Vec<u8>, EntityError>;
    fn connected(&mut self, client: ClientDescriptor);
    fn disconnected(&mut self, client: ClientDescriptor);
    fn handle_reconnect(&mut self, client: ClientDescriptor, extended_data: &[u8]);
    fn create_new(&mut self) -> Result<(), EntityError>;
    fn load_existing(&mut self);
    fn destroy(&mut self);
    fn reconfigure(&mut self, registry: &ServiceRegistry, configuration: &[u8]) -> Result<(), EntityError>;
    fn keys_for_synchronization(&self) -> BTreeSet<i32>;
    /// Encoded synchronization messages for one concurrency key.
    fn synchronization_payloads(&self, concurrency_key: i32) -> Result<Vec<Vec<u8>>, EntityError>;
}

#[async_trait]
pub(crate) trait PassiveInstance: Send {
    async fn invoke(&mut self, payload: &[u8]) -> Result<(), EntityError>;
    async fn sync_payload(&mut self, concurrency_key: i32, payload: &[u8]) -> Result<(), EntityError>;
    fn start_sync_entity(&mut self);
    fn end_sync_entity(&mut self);
    fn start_sync_concurrency_key(&mut self, concurrency_key: i32);
    fn end_sync_concurrency_key(&mut self, concurrency_key: i32);
    fn create_new(&mut self) -> Result<(), EntityError>;
    fn load_existing(&mut self);
    fn destroy(&mut self);
    fn reconfigure(&mut self, registry: &ServiceRegistry, configuration: &[u8]) -> Result<(), EntityError>;
}

/// Collaborators a service hands out per configuration.
struct Strategies<S: EntityServerService> {
    codec: Arc<dyn MessageCodec<S::Message, S::Response>>,
    sync_codec: Option<Arc<dyn SyncMessageCodec<S::Message>>>,
    concurrency: Arc<dyn ConcurrencyStrategy<S::Message>>,
    execution: Arc<dyn ExecutionStrategy<S::Message>>,
}

impl<S: EntityServerService> Strategies<S> {
    fn from_service(service: &S, configuration: &[u8]) -> Self {
        Self {
            codec: service.message_codec(),
            sync_codec: service.sync_message_codec(),
            concurrency: service.concurrency_strategy(configuration),
            execution: service.execution_strategy(configuration),
        }
    }
}

pub(crate) struct ServiceAdapter<S> {
    service: Arc<S>,
}

impl<S: EntityServerService> ServiceAdapter<S> {
    pub(crate) fn new(service: S) -> Self {
        Self {
            service: Arc::new(service),
        }
    }
}

impl<S: EntityServerService> ErasedEntityService for ServiceAdapter<S> {
    fn version(&self) -> u64 {
        self.service.version()
    }

    fn handles_entity_type(&self, class_name: &str) -> bool {
        self.service.handles_entity_type(class_name)
    }

    fn create_active(
        &self,
        tuple: &EntityTuple,
        registry: &ServiceRegistry,
        configuration: &[u8],
    ) -> Result<Box<dyn ActiveInstance>, EntityError> {
        let entity = self
            .service
            .create_active_entity(registry, configuration)
            .map_err(|e| EntityError::configuration(tuple, e.reason))?;
        Ok(Box::new(ActiveAdapter {
            service: Arc::clone(&self.service),
            tuple: tuple.clone(),
            strategies: Strategies::from_service(self.service.as_ref(), configuration),
            entity,
        }))
    }

    fn create_passive(
        &self,
        tuple: &EntityTuple,
        registry: &ServiceRegistry,
        configuration: &[u8],
    ) -> Result<Box<dyn PassiveInstance>, EntityError> {
        let entity = self
            .service
            .create_passive_entity(registry, configuration)
            .map_err(|e| EntityError::configuration(tuple, e.reason))?;
        Ok(Box::new(PassiveAdapter {
            service: Arc::clone(&self.service),
            tuple: tuple.clone(),
            strategies: Strategies::from_service(self.service.as_ref(), configuration),
            entity,
        }))
    }
}

struct ActiveAdapter<S: EntityServerService> {
    service: Arc<S>,
    tuple: EntityTuple,
    strategies: Strategies<S>,
    entity: ActiveEntityBox<S>,
}

#[async_trait]
impl<S: EntityServerService> ActiveInstance for ActiveAdapter<S> {
    async fn invoke(&mut self, mut context: InvokeContext, payload: &[u8]) -> Result<Vec<u8>, EntityError> {
        let message = self
            .strategies
            .codec
            .decode_message(payload)
            .map_err(|e| EntityError::server(&self.tuple, e.to_string()))?;
        if !self.strategies.execution.location(&message).run_on_active() {
            return Ok(Vec::new());
        }
        context.concurrency_key = self.strategies.concurrency.concurrency_key(&message);
        trace!(entity = %self.tuple, concurrency_key = context.concurrency_key, "invoking active entity");
        let response = self
            .entity
            .invoke(&context, message)
            .await
            .map_err(|e| EntityError::server(&self.tuple, e.description))?;
        self.strategies
            .codec
            .encode_response(&response)
            .map_err(|e| EntityError::server(&self.tuple, e.to_string()))
    }

    fn connected(&mut self, client: ClientDescriptor) {
        self.entity.connected(client);
    }

    fn disconnected(&mut self, client: ClientDescriptor) {
        self.entity.disconnected(client);
    }

    fn handle_reconnect(&mut self, client: ClientDescriptor, extended_data: &[u8]) {
        self.entity.handle_reconnect(client, extended_data);
    }

    fn create_new(&mut self) -> Result<(), EntityError> {
        self.entity
            .create_new()
            .map_err(|e| EntityError::configuration(&self.tuple, e.reason))
    }

    fn load_existing(&mut self) {
        self.entity.load_existing();
    }

    fn destroy(&mut self) {
        self.entity.destroy();
    }

    fn reconfigure(&mut self, registry: &ServiceRegistry, configuration: &[u8]) -> Result<(), EntityError> {
        self.service
            .reconfigure_active_entity(registry, &mut self.entity, configuration)
            .map_err(|e| EntityError::configuration(&self.tuple, e.reason))?;
        self.strategies = Strategies::from_service(self.service.as_ref(), configuration);
        Ok(())
    }

    fn keys_for_synchronization(&self) -> BTreeSet<i32> {
        self.strategies.concurrency.keys_for_synchronization()
    }

    fn synchronization_payloads(&self, concurrency_key: i32) -> Result<Vec<Vec<u8>>, EntityError> {
        let mut channel = PassiveSynchronizationChannel::new();
        self.entity
            .synchronize_key_to_passive(&mut channel, concurrency_key);
        let messages = channel.into_messages();
        if messages.is_empty() {
            return Ok(Vec::new());
        }
        let codec = self
            .strategies
            .sync_codec
            .as_ref()
            .ok_or_else(|| EntityError::server(&self.tuple, "entity has no synchronization codec"))?;
        messages
            .iter()
            .map(|message| {
                codec
                    .encode(concurrency_key, message)
                    .map_err(|e| EntityError::server(&self.tuple, e.to_string()))
            })
            .collect()
    }
}

struct PassiveAdapter<S: EntityServerService> {
    service: Arc<S>,
    tuple: EntityTuple,
    strategies: Strategies<S>,
    entity: PassiveEntityBox<S>,
}

#[async_trait]
impl<S: EntityServerService> PassiveInstance for PassiveAdapter<S> {
    async fn invoke(&mut self, payload: &[u8]) -> Result<(), EntityError> {
        let message = self
            .strategies
            .codec
            .decode_message(payload)
            .map_err(|e| EntityError::server(&self.tuple, e.to_string()))?;
        if !self.strategies.execution.location(&message).run_on_passive() {
            return Ok(());
        }
        self.entity
            .invoke(message)
            .await
            .map_err(|e| EntityError::server(&self.tuple, e.description))
    }

    async fn sync_payload(&mut self, concurrency_key: i32, payload: &[u8]) -> Result<(), EntityError> {
        let codec = self
            .strategies
            .sync_codec
            .clone()
            .ok_or_else(|| EntityError::server(&self.tuple, "entity has no synchronization codec"))?;
        let message = codec
            .decode(concurrency_key, payload)
            .map_err(|e| EntityError::server(&self.tuple, e.to_string()))?;
        self.entity
            .invoke(message)
            .await
            .map_err(|e| EntityError::server(&self.tuple, e.description))
    }

    fn start_sync_entity(&mut self) {
        self.entity.start_sync_entity();
    }

    fn end_sync_entity(&mut self) {
        self.entity.end_sync_entity();
    }

    fn start_sync_concurrency_key(&mut self, concurrency_key: i32) {
        self.entity.start_sync_concurrency_key(concurrency_key);
    }

    fn end_sync_concurrency_key(&mut self, concurrency_key: i32) {
        self.entity.end_sync_concurrency_key(concurrency_key);
    }

    fn create_new(&mut self) -> Result<(), EntityError> {
        self.entity
            .create_new()
            .map_err(|e| EntityError::configuration(&self.tuple, e.reason))
    }

    fn load_existing(&mut self) {
        self.entity.load_existing();
    }

    fn destroy(&mut self) {
        self.entity.destroy();
    }

    fn reconfigure(&mut self, registry: &ServiceRegistry, configuration: &[u8]) -> Result<(), EntityError> {
        self.service
            .reconfigure_passive_entity(registry, &mut self.entity, configuration)
            .map_err(|e| EntityError::configuration(&self.tuple, e.reason))?;
        self.strategies = Strategies::from_service(self.service.as_ref(), configuration);
        Ok(())
    }
}
