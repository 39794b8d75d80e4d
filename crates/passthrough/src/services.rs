//! Services available to entities through their [`ServiceRegistry`].
//!
//! Every entity gets a registry scoped to its consumer id. Lookups are by
//! service type and consult the platform's built-in provider first, then any
//! providers registered on the [`ServiceCatalog`]. More than one provider for
//! the same type is an error rather than a silent pick.

use crate::entity::EntityServerService;
use crate::entity_adapter::{ErasedEntityService, ServiceAdapter};
use crate::envelope::PassthroughMessage;
use crate::error::{EntityError, PassthroughError};
use crate::message::{Inbound, MessageSender};
use crate::server_process::ProcessContext;
use crate::storage::PlatformPersistence;
use crate::types::{ClientDescriptor, EntityTuple};
use std::any::{Any, TypeId};
use std::sync::Arc;
use tracing::debug;

/// Consumer id of the platform itself. Entity consumer ids start at 1.
pub const PLATFORM_CONSUMER_ID: u64 = 0;

/// The party a service instance is handed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConsumer {
    pub consumer_id: u64,
    pub entity: Option<EntityTuple>,
}

/// Supplies service instances by type.
pub trait ServiceProvider: Send + Sync {
    fn provided_service_types(&self) -> Vec<TypeId>;

    fn get_service(
        &self,
        consumer: &ServiceConsumer,
        service_type: TypeId,
    ) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Per-consumer view over all service providers.
#[derive(Clone)]
pub struct ServiceRegistry {
    consumer: Arc<ServiceConsumer>,
    providers: Arc<[Arc<dyn ServiceProvider>]>,
}

impl ServiceRegistry {
    pub(crate) fn new(
        consumer: ServiceConsumer,
        builtin: Arc<dyn ServiceProvider>,
        external: &[Arc<dyn ServiceProvider>],
    ) -> Self {
        let providers: Vec<Arc<dyn ServiceProvider>> = std::iter::once(builtin)
            .chain(external.iter().cloned())
            .collect();
        Self {
            consumer: Arc::new(consumer),
            providers: providers.into(),
        }
    }

    pub fn consumer_id(&self) -> u64 {
        self.consumer.consumer_id
    }

    /// Looks up the single provider of `T`.
    ///
    /// Returns `Ok(None)` when nobody provides it and `AmbiguousService` when
    /// more than one provider claims the type.
    pub fn get_service<T: Any + Send + Sync>(&self) -> Result<Option<Arc<T>>, PassthroughError> {
        let service_type = TypeId::of::<T>();
        let matching: Vec<&Arc<dyn ServiceProvider>> = self
            .providers
            .iter()
            .filter(|provider| provider.provided_service_types().contains(&service_type))
            .collect();
        match matching.as_slice() {
            [] => Ok(None),
            [provider] => Ok(provider
                .get_service(&self.consumer, service_type)
                .and_then(|service| service.downcast::<T>().ok())),
            many => Err(PassthroughError::AmbiguousService {
                service: std::any::type_name::<T>(),
                providers: many.len(),
            }),
        }
    }
}

/// The entity services and external service providers a stripe runs with.
/// Shared by every server of the stripe.
#[derive(Default)]
pub struct ServiceCatalog {
    services: Vec<Arc<dyn ErasedEntityService>>,
    providers: Vec<Arc<dyn ServiceProvider>>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity_service<S: EntityServerService>(mut self, service: S) -> Self {
        self.services.push(Arc::new(ServiceAdapter::new(service)));
        self
    }

    pub fn with_service_provider(mut self, provider: Arc<dyn ServiceProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    pub(crate) fn providers(&self) -> &[Arc<dyn ServiceProvider>] {
        &self.providers
    }

    /// Finds the service for the entity's class and checks the version the
    /// caller asked for.
    pub(crate) fn for_version(
        &self,
        tuple: &EntityTuple,
        version: u64,
    ) -> Result<Arc<dyn ErasedEntityService>, EntityError> {
        let service = self
            .services
            .iter()
            .find(|service| service.handles_entity_type(&tuple.class_name))
            .ok_or_else(|| EntityError::not_provided(tuple))?;
        if service.version() != version {
            return Err(EntityError::version_mismatch(tuple, service.version(), version));
        }
        Ok(Arc::clone(service))
    }
}

/// Lets an entity send messages to itself.
///
/// A self-message runs after the current one on the active, is replicated to
/// passives, and holds back retirement of the message that sent it until it
/// completes. On a passive this does nothing: the active's copy is
/// replicated instead.
pub struct EntityMessenger {
    process: Arc<ProcessContext>,
    entity: EntityTuple,
}

impl EntityMessenger {
    pub fn message_self(&self, payload: Vec<u8>) -> Result<(), PassthroughError> {
        if !self.process.is_active() {
            debug!(entity = %self.entity, "ignoring self-message on passive");
            return Ok(());
        }
        let key = self.process.next_message_key();
        let bytes = PassthroughMessage::invoke_on_server(
            &self.entity.class_name,
            &self.entity.entity_name,
            0,
            payload,
            true,
        )
        .encode()?;
        self.process.retirement.lock().defer_current(key);
        self.process.enqueue(Inbound::Message {
            sender: MessageSender::Internal { key },
            bytes,
        })
    }
}

/// Lets an entity push messages to fetched client endpoints.
pub struct ClientCommunicator {
    process: Arc<ProcessContext>,
}

impl ClientCommunicator {
    /// Sends `payload` to the endpoint behind `client` without waiting for
    /// any answer.
    pub fn send_no_response(&self, client: &ClientDescriptor, payload: Vec<u8>) -> Result<(), PassthroughError> {
        if self.process.cancel.is_cancelled() {
            debug!(client = %client, "server stopping, push dropped");
            return Ok(());
        }
        let sink = self
            .process
            .clients
            .get(&client.connection_id)
            .map(|entry| entry.value().clone())
            .ok_or(PassthroughError::ConnectionClosed {
                connection: client.connection_id,
            })?;
        sink.send(
            self.process.id,
            &PassthroughMessage::invoke_on_client(client.instance_id, payload),
        )
    }
}

/// Private key-value space of one consumer inside the server's persistence.
pub struct EntityStorage {
    persistence: Arc<dyn PlatformPersistence>,
    prefix: String,
}

impl EntityStorage {
    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub fn load(&self, name: &str) -> Result<Option<Vec<u8>>, PassthroughError> {
        self.persistence.load_data_element(&self.key(name))
    }

    pub fn store(&self, name: &str, data: &[u8]) -> Result<(), PassthroughError> {
        self.persistence.store_data_element(&self.key(name), data)
    }
}

fn consumer_prefix(consumer_id: u64) -> String {
    format!("consumer-{consumer_id}/")
}

/// Drops everything a consumer kept through [`EntityStorage`].
pub(crate) fn release_consumer_storage(
    persistence: &dyn PlatformPersistence,
    consumer_id: u64,
) -> Result<(), PassthroughError> {
    persistence.remove_data_elements(&consumer_prefix(consumer_id))
}

/// Provides the platform services of one server process.
pub(crate) struct BuiltinServiceProvider {
    process: Arc<ProcessContext>,
}

impl BuiltinServiceProvider {
    pub(crate) fn new(process: Arc<ProcessContext>) -> Self {
        Self { process }
    }
}

impl ServiceProvider for BuiltinServiceProvider {
    fn provided_service_types(&self) -> Vec<TypeId> {
        vec![
            TypeId::of::<EntityMessenger>(),
            TypeId::of::<ClientCommunicator>(),
            TypeId::of::<EntityStorage>(),
        ]
    }

    fn get_service(
        &self,
        consumer: &ServiceConsumer,
        service_type: TypeId,
    ) -> Option<Arc<dyn Any + Send + Sync>> {
        if service_type == TypeId::of::<EntityMessenger>() {
            let entity = consumer.entity.clone()?;
            return Some(Arc::new(EntityMessenger {
                process: Arc::clone(&self.process),
                entity,
            }));
        }
        if service_type == TypeId::of::<ClientCommunicator>() {
            return Some(Arc::new(ClientCommunicator {
                process: Arc::clone(&self.process),
            }));
        }
        if service_type == TypeId::of::<EntityStorage>() {
            return Some(Arc::new(EntityStorage {
                persistence: Arc::clone(&self.process.persistence),
                prefix: consumer_prefix(consumer.consumer_id),
            }));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Clock(u64);

    struct ClockProvider(u64);

    impl ServiceProvider for ClockProvider {
        fn provided_service_types(&self) -> Vec<TypeId> {
            vec![TypeId::of::<Clock>()]
        }

        fn get_service(
            &self,
            _consumer: &ServiceConsumer,
            service_type: TypeId,
        ) -> Option<Arc<dyn Any + Send + Sync>> {
            (service_type == TypeId::of::<Clock>()).then(|| Arc::new(Clock(self.0)) as Arc<dyn Any + Send + Sync>)
        }
    }

    struct NothingProvider;

    impl ServiceProvider for NothingProvider {
        fn provided_service_types(&self) -> Vec<TypeId> {
            Vec::new()
        }

        fn get_service(&self, _: &ServiceConsumer, _: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
            None
        }
    }

    fn consumer() -> ServiceConsumer {
        ServiceConsumer {
            consumer_id: 3,
            entity: Some(EntityTuple::new("counter", "a")),
        }
    }

    #[test]
    fn single_provider_resolves() {
        let registry = ServiceRegistry::new(
            consumer(),
            Arc::new(NothingProvider),
            &[Arc::new(ClockProvider(42)) as Arc<dyn ServiceProvider>],
        );
        assert_eq!(registry.consumer_id(), 3);
        let clock = registry.get_service::<Clock>().unwrap().unwrap();
        assert_eq!(clock.0, 42);
        assert!(registry.get_service::<String>().unwrap().is_none());
    }

    #[test]
    fn two_providers_are_ambiguous() {
        let registry = ServiceRegistry::new(
            consumer(),
            Arc::new(ClockProvider(1)),
            &[Arc::new(ClockProvider(2)) as Arc<dyn ServiceProvider>],
        );
        let err = registry.get_service::<Clock>().err().unwrap();
        assert!(matches!(
            err,
            PassthroughError::AmbiguousService { providers: 2, .. }
        ));
    }

    #[test]
    fn catalog_checks_class_and_version() {
        let catalog = ServiceCatalog::new().with_entity_service(crate::testing::CounterService::new());
        let tuple = EntityTuple::new("counter", "a");
        assert!(catalog.for_version(&tuple, 1).is_ok());
        assert_eq!(
            catalog.for_version(&tuple, 2).err(),
            Some(EntityError::version_mismatch(&tuple, 1, 2))
        );
        let unknown = EntityTuple::new("map", "a");
        assert_eq!(
            catalog.for_version(&unknown, 1).err(),
            Some(EntityError::not_provided(&unknown))
        );
    }
}
