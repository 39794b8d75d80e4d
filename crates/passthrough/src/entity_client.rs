use crate::connection::{Connection, EndpointDelegate, EndpointShared};
use crate::entity::MessageCodec;
use crate::envelope::PassthroughMessage;
use crate::error::PassthroughError;
use crate::invocation::{InvocationCallback, InvocationTask, Signal};
use crate::types::EntityTuple;
use enumset::EnumSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, instrument};

/// Client-side handle naming one entity at one API version.
///
/// Created via [`Connection::entity_ref`]. Holds no server-side resources;
/// [`EntityRef::fetch`] produces an endpoint that does.
#[derive(Debug, Clone)]
pub struct EntityRef {
    connection: Connection,
    tuple: EntityTuple,
    version: u64,
}

impl Connection {
    pub fn entity_ref(&self, class_name: impl Into<String>, entity_name: impl Into<String>, version: u64) -> EntityRef {
        EntityRef {
            connection: self.clone(),
            tuple: EntityTuple::new(class_name, entity_name),
            version,
        }
    }
}

impl EntityRef {
    pub fn tuple(&self) -> &EntityTuple {
        &self.tuple
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    fn class_name(&self) -> &str {
        &self.tuple.class_name
    }

    fn entity_name(&self) -> &str {
        &self.tuple.entity_name
    }

    /// Create the entity with the given configuration.
    #[instrument(skip(self, configuration), fields(entity = %self.tuple))]
    pub async fn create(&self, configuration: Vec<u8>) -> Result<(), PassthroughError> {
        self.connection
            .send_and_retire(PassthroughMessage::create_entity(
                self.class_name(),
                self.entity_name(),
                self.version,
                configuration,
            ))
            .await
            .map(|_| ())
    }

    /// Replace the entity's configuration, returning the previous one.
    #[instrument(skip(self, configuration), fields(entity = %self.tuple))]
    pub async fn reconfigure(&self, configuration: Vec<u8>) -> Result<Vec<u8>, PassthroughError> {
        self.connection
            .send_and_retire(PassthroughMessage::reconfigure_entity(
                self.class_name(),
                self.entity_name(),
                self.version,
                configuration,
            ))
            .await
    }

    /// Destroy the entity. Returns `false` when fetches still hold it.
    #[instrument(skip(self), fields(entity = %self.tuple))]
    pub async fn destroy(&self) -> Result<bool, PassthroughError> {
        let response = self
            .connection
            .send_and_retire(PassthroughMessage::destroy_entity(self.class_name(), self.entity_name()))
            .await?;
        Ok(response == [1])
    }

    pub async fn exists(&self) -> Result<bool, PassthroughError> {
        let response = self
            .connection
            .send_and_retire(PassthroughMessage::does_entity_exist(self.class_name(), self.entity_name()))
            .await?;
        Ok(response == [1])
    }

    /// Fetch the entity, attaching a new client endpoint to it. Waits while
    /// another connection holds the entity's write lock.
    #[instrument(skip(self), fields(entity = %self.tuple))]
    pub async fn fetch(&self) -> Result<EntityClientEndpoint, PassthroughError> {
        let shared = self.connection.register_endpoint(self.tuple.clone());
        let message = PassthroughMessage::fetch_entity(
            self.class_name(),
            self.entity_name(),
            shared.instance_id,
            self.version,
        );
        match self.connection.send_and_retire(message).await {
            Ok(configuration) => {
                *shared.configuration.lock() = configuration;
                shared.fetched.store(true, Ordering::SeqCst);
                debug!(instance = shared.instance_id, "endpoint fetched");
                Ok(EntityClientEndpoint {
                    connection: self.connection.clone(),
                    shared,
                })
            }
            Err(error) => {
                self.connection.remove_endpoint(shared.instance_id);
                Err(error)
            }
        }
    }

    /// Take the entity's write lock, waiting behind other holders.
    #[instrument(skip(self), fields(entity = %self.tuple))]
    pub async fn acquire_write_lock(&self) -> Result<(), PassthroughError> {
        self.connection
            .send_and_retire(PassthroughMessage::lock_acquire(self.class_name(), self.entity_name()))
            .await?;
        self.connection.lock_acquired(self.tuple.clone());
        Ok(())
    }

    /// Take the write lock only if it is free right now.
    pub async fn try_acquire_write_lock(&self) -> Result<bool, PassthroughError> {
        let response = self
            .connection
            .send_and_retire(PassthroughMessage::lock_try_acquire(self.class_name(), self.entity_name()))
            .await?;
        let acquired = response == [1];
        if acquired {
            self.connection.lock_acquired(self.tuple.clone());
        }
        Ok(acquired)
    }

    #[instrument(skip(self), fields(entity = %self.tuple))]
    pub async fn release_write_lock(&self) -> Result<(), PassthroughError> {
        self.connection
            .send_and_retire(PassthroughMessage::lock_release(self.class_name(), self.entity_name()))
            .await?;
        self.connection.lock_released(&self.tuple);
        Ok(())
    }
}

/// A fetched entity: the client end of the entity's message channel.
pub struct EntityClientEndpoint {
    connection: Connection,
    shared: Arc<EndpointShared>,
}

impl std::fmt::Debug for EntityClientEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityClientEndpoint")
            .field("entity", &self.shared.tuple)
            .field("instance_id", &self.shared.instance_id)
            .finish()
    }
}

impl EntityClientEndpoint {
    pub fn tuple(&self) -> &EntityTuple {
        &self.shared.tuple
    }

    pub fn instance_id(&self) -> u64 {
        self.shared.instance_id
    }

    /// The entity configuration returned by the fetch.
    pub fn configuration(&self) -> Vec<u8> {
        self.shared.configuration.lock().clone()
    }

    pub fn set_delegate(&self, delegate: Box<dyn EndpointDelegate>) {
        *self.shared.delegate.lock() = delegate;
    }

    fn ensure_fetched(&self) -> Result<(), PassthroughError> {
        if !self.shared.fetched.load(Ordering::SeqCst) {
            return Err(PassthroughError::IllegalState {
                reason: format!("endpoint {} of {} was released", self.shared.instance_id, self.shared.tuple),
            });
        }
        Ok(())
    }

    /// Sends `payload` to the entity. `callback` hears about the stages in
    /// `signals`; the returned task is only an identifier.
    pub async fn invoke(
        &self,
        payload: Vec<u8>,
        should_replicate: bool,
        callback: Box<dyn InvocationCallback>,
        signals: EnumSet<Signal>,
    ) -> Result<InvocationTask, PassthroughError> {
        self.ensure_fetched()?;
        let transaction_id = self
            .connection
            .send(self.invoke_message(payload, should_replicate), callback, signals)
            .await?;
        Ok(InvocationTask::new(transaction_id))
    }

    /// Sends `payload` and waits for the invocation to retire.
    pub async fn invoke_and_retire(&self, payload: Vec<u8>, should_replicate: bool) -> Result<Vec<u8>, PassthroughError> {
        self.ensure_fetched()?;
        self.connection
            .send_and_retire(self.invoke_message(payload, should_replicate))
            .await
    }

    /// Typed form of [`Self::invoke_and_retire`], using the entity's codec.
    pub async fn invoke_with_codec<M, R>(
        &self,
        codec: &dyn MessageCodec<M, R>,
        message: &M,
        should_replicate: bool,
    ) -> Result<R, PassthroughError> {
        let payload = codec.encode_message(message).map_err(|e| PassthroughError::MalformedMessage {
            reason: "failed to encode entity message".to_string(),
            source: Some(Box::new(e)),
        })?;
        let response = self.invoke_and_retire(payload, should_replicate).await?;
        codec
            .decode_response(&response)
            .map_err(|e| PassthroughError::MalformedMessage {
                reason: "failed to decode entity response".to_string(),
                source: Some(Box::new(e)),
            })
    }

    fn invoke_message(&self, payload: Vec<u8>, should_replicate: bool) -> PassthroughMessage {
        PassthroughMessage::invoke_on_server(
            &self.shared.tuple.class_name,
            &self.shared.tuple.entity_name,
            self.shared.instance_id,
            payload,
            should_replicate,
        )
    }

    /// Detaches this endpoint from the entity.
    #[instrument(skip(self), fields(entity = %self.shared.tuple, instance = self.shared.instance_id))]
    pub async fn release(&self) -> Result<(), PassthroughError> {
        self.ensure_fetched()?;
        self.connection
            .send_and_retire(PassthroughMessage::release_entity(
                &self.shared.tuple.class_name,
                &self.shared.tuple.entity_name,
                self.shared.instance_id,
            ))
            .await?;
        self.shared.fetched.store(false, Ordering::SeqCst);
        self.connection.remove_endpoint(self.shared.instance_id);
        Ok(())
    }
}
