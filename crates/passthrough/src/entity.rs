//! Traits implemented by entity authors.
//!
//! An entity class is described by an [`EntityServerService`], which builds
//! active and passive instances of the entity and supplies the collaborators
//! the server needs to run them: a message codec, a concurrency strategy and
//! an execution strategy. The server only ever sees bytes; the typed message
//! and response live entirely on the author's side of these traits.

use crate::services::ServiceRegistry;
use crate::types::{ClientDescriptor, EntityTuple};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Concurrency key for messages that must run alone with respect to every
/// other key.
pub const MANAGEMENT_KEY: i32 = 0;

/// Concurrency key for messages that run ahead of all keyed traffic.
pub const UNIVERSAL_KEY: i32 = i32::MIN;

/// Where a message is executed within the stripe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionLocation {
    Active,
    Passive,
    Both,
    /// The message is acknowledged but runs nowhere.
    Ignore,
}

impl ExecutionLocation {
    pub fn run_on_active(self) -> bool {
        matches!(self, ExecutionLocation::Active | ExecutionLocation::Both)
    }

    pub fn run_on_passive(self) -> bool {
        matches!(self, ExecutionLocation::Passive | ExecutionLocation::Both)
    }
}

/// Decides where each message of an entity runs.
pub trait ExecutionStrategy<M>: Send + Sync {
    fn location(&self, message: &M) -> ExecutionLocation;
}

/// Assigns messages to concurrency keys.
pub trait ConcurrencyStrategy<M>: Send + Sync {
    fn concurrency_key(&self, message: &M) -> i32;

    /// Keys whose state is streamed to a newly attached passive, in order.
    fn keys_for_synchronization(&self) -> BTreeSet<i32>;
}

/// Failure to encode or decode an entity payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("codec error: {reason}")]
pub struct CodecError {
    pub reason: String,
}

impl CodecError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Raised by an entity service that cannot build an entity from a
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct ConfigurationRejected {
    pub reason: String,
}

impl ConfigurationRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Raised by entity code while handling a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{description}")]
pub struct EntityUserError {
    pub description: String,
}

impl EntityUserError {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }
}

/// Translates messages and responses to and from bytes.
pub trait MessageCodec<M, R>: Send + Sync {
    fn encode_message(&self, message: &M) -> Result<Vec<u8>, CodecError>;
    fn decode_message(&self, bytes: &[u8]) -> Result<M, CodecError>;
    fn encode_response(&self, response: &R) -> Result<Vec<u8>, CodecError>;
    fn decode_response(&self, bytes: &[u8]) -> Result<R, CodecError>;
}

/// Translates synchronization messages, which are scoped to a concurrency
/// key.
pub trait SyncMessageCodec<M>: Send + Sync {
    fn encode(&self, concurrency_key: i32, message: &M) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, concurrency_key: i32, bytes: &[u8]) -> Result<M, CodecError>;
}

/// Per-invocation context handed to an active entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeContext {
    pub entity: EntityTuple,
    /// The fetch that sent the message. `None` for server-internal messages.
    pub client: Option<ClientDescriptor>,
    pub transaction_id: u64,
    pub oldest_transaction_id: u64,
    /// Key the entity's concurrency strategy assigned to this message.
    pub concurrency_key: i32,
}

/// Collects the messages an active entity streams to a new passive for one
/// concurrency key.
pub struct PassiveSynchronizationChannel<M> {
    messages: Vec<M>,
}

impl<M> PassiveSynchronizationChannel<M> {
    pub(crate) fn new() -> Self {
        Self {
            messages: Vec::new(),
        }
    }

    pub fn synchronize_to_passive(&mut self, message: M) {
        self.messages.push(message);
    }

    pub(crate) fn into_messages(self) -> Vec<M> {
        self.messages
    }
}

/// The active side of an entity. All calls happen on the owning server's
/// message loop, one at a time.
#[async_trait]
pub trait ActiveServerEntity<M: Send + 'static, R: Send + 'static>: Send {
    async fn invoke(&mut self, context: &InvokeContext, message: M) -> Result<R, EntityUserError>;

    fn connected(&mut self, _client: ClientDescriptor) {}

    fn disconnected(&mut self, _client: ClientDescriptor) {}

    /// A fetch that survived a fail-over is re-attaching, with whatever data
    /// its client-side delegate supplied.
    fn handle_reconnect(&mut self, _client: ClientDescriptor, _extended_data: &[u8]) {}

    /// Called once when the entity is created by a client.
    fn create_new(&mut self) -> Result<(), ConfigurationRejected> {
        Ok(())
    }

    /// Called when the entity is rebuilt from storage or promoted.
    fn load_existing(&mut self) {}

    fn synchronize_key_to_passive(
        &self,
        _channel: &mut PassiveSynchronizationChannel<M>,
        _concurrency_key: i32,
    ) {
    }

    fn destroy(&mut self) {}
}

/// The passive side of an entity, fed replicated messages and
/// synchronization payloads.
#[async_trait]
pub trait PassiveServerEntity<M: Send + 'static>: Send {
    async fn invoke(&mut self, message: M) -> Result<(), EntityUserError>;

    fn start_sync_entity(&mut self) {}

    fn end_sync_entity(&mut self) {}

    fn start_sync_concurrency_key(&mut self, _concurrency_key: i32) {}

    fn end_sync_concurrency_key(&mut self, _concurrency_key: i32) {}

    fn create_new(&mut self) -> Result<(), ConfigurationRejected> {
        Ok(())
    }

    fn load_existing(&mut self) {}

    fn destroy(&mut self) {}
}

pub type ActiveEntityBox<S> = Box<
    dyn ActiveServerEntity<<S as EntityServerService>::Message, <S as EntityServerService>::Response>,
>;

pub type PassiveEntityBox<S> =
    Box<dyn PassiveServerEntity<<S as EntityServerService>::Message>>;

/// Factory and collaborator source for one entity class.
pub trait EntityServerService: Send + Sync + 'static {
    type Message: Send + 'static;
    type Response: Send + 'static;

    /// API version clients must ask for.
    fn version(&self) -> u64;

    fn handles_entity_type(&self, class_name: &str) -> bool;

    fn create_active_entity(
        &self,
        registry: &ServiceRegistry,
        configuration: &[u8],
    ) -> Result<ActiveEntityBox<Self>, ConfigurationRejected>;

    fn create_passive_entity(
        &self,
        registry: &ServiceRegistry,
        configuration: &[u8],
    ) -> Result<PassiveEntityBox<Self>, ConfigurationRejected>;

    /// Applies a new configuration. The default builds a fresh instance.
    fn reconfigure_active_entity(
        &self,
        registry: &ServiceRegistry,
        entity: &mut ActiveEntityBox<Self>,
        configuration: &[u8],
    ) -> Result<(), ConfigurationRejected> {
        *entity = self.create_active_entity(registry, configuration)?;
        Ok(())
    }

    fn reconfigure_passive_entity(
        &self,
        registry: &ServiceRegistry,
        entity: &mut PassiveEntityBox<Self>,
        configuration: &[u8],
    ) -> Result<(), ConfigurationRejected> {
        *entity = self.create_passive_entity(registry, configuration)?;
        Ok(())
    }

    fn concurrency_strategy(&self, configuration: &[u8]) -> Arc<dyn ConcurrencyStrategy<Self::Message>>;

    fn execution_strategy(&self, configuration: &[u8]) -> Arc<dyn ExecutionStrategy<Self::Message>>;

    fn message_codec(&self) -> Arc<dyn MessageCodec<Self::Message, Self::Response>>;

    /// `None` when the entity never synchronizes state to passives.
    fn sync_message_codec(&self) -> Option<Arc<dyn SyncMessageCodec<Self::Message>>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_locations() {
        assert!(ExecutionLocation::Active.run_on_active());
        assert!(!ExecutionLocation::Active.run_on_passive());
        assert!(ExecutionLocation::Both.run_on_active());
        assert!(ExecutionLocation::Both.run_on_passive());
        assert!(ExecutionLocation::Passive.run_on_passive());
        assert!(!ExecutionLocation::Ignore.run_on_active());
        assert!(!ExecutionLocation::Ignore.run_on_passive());
    }

    #[test]
    fn synchronization_channel_keeps_order() {
        let mut channel = PassiveSynchronizationChannel::new();
        channel.synchronize_to_passive(3);
        channel.synchronize_to_passive(1);
        assert_eq!(channel.into_messages(), vec![3, 1]);
    }

    #[test]
    fn user_errors_display_their_description() {
        assert_eq!(EntityUserError::new("boom").to_string(), "boom");
        assert_eq!(
            CodecError::new("truncated").to_string(),
            "codec error: truncated"
        );
    }
}
