//! A small counter entity for unit and integration testing.
//!
//! Exercises every platform service: [`EntityStorage`] keeps the value,
//! [`EntityMessenger`] defers increments and [`ClientCommunicator`] pushes
//! payloads back to the invoking endpoint. Synchronization streams the value
//! on concurrency key 1.
//!
//! # Example
//!
//! ```ignore
//! let service = CounterService::new();
//! let stripe = ClusterControl::start(
//!     StripeConfig::with_servers(["a", "b"]),
//!     ServiceCatalog::new().with_entity_service(service.clone()),
//! ).await?;
//! let connection = stripe.connect_client("client").await?;
//! let counter = connection.entity_ref(COUNTER_CLASS, "c", COUNTER_VERSION);
//! counter.create(Vec::new()).await?;
//! ```

use crate::entity::{
    ActiveEntityBox, ActiveServerEntity, CodecError, ConcurrencyStrategy, ConfigurationRejected,
    EntityServerService, EntityUserError, ExecutionLocation, ExecutionStrategy, InvokeContext,
    MessageCodec, PassiveEntityBox, PassiveServerEntity, PassiveSynchronizationChannel,
    SyncMessageCodec,
};
use crate::services::{ClientCommunicator, EntityMessenger, EntityStorage, ServiceRegistry};
use crate::types::ClientDescriptor;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const COUNTER_CLASS: &str = "counter";
pub const COUNTER_VERSION: u64 = 1;

/// Configuration the counter refuses to be built or reconfigured with.
pub const REJECTED_CONFIGURATION: &[u8] = b"reject";

const VALUE_KEY: i32 = 1;
const STORAGE_NAME: &str = "value";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterMessage {
    Increment(i64),
    Get,
    /// Schedules an `Increment` through the entity messenger.
    IncrementLater(i64),
    /// Pushes the bytes back to the invoking endpoint.
    Broadcast(Vec<u8>),
    Fail,
    /// Synchronization payload carrying the whole value.
    Sync(i64),
    /// Answers with the concurrency key the message ran under.
    ConcurrencyKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterResponse {
    Value(i64),
}

/// Counts what the service has been asked to do, across every server.
#[derive(Debug, Default)]
pub struct CounterStats {
    constructions: AtomicUsize,
    reconnects: AtomicUsize,
}

impl CounterStats {
    pub fn constructions(&self) -> usize {
        self.constructions.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct CounterService {
    stats: Arc<CounterStats>,
    fail_on: Option<usize>,
    passive_delay: Option<Duration>,
}

impl CounterService {
    pub fn new() -> Self {
        Self::default()
    }

    /// A service whose `n`th instance construction (1-based, active and
    /// passive alike) is rejected.
    pub fn failing_on(n: usize) -> Self {
        Self {
            fail_on: Some(n),
            ..Self::default()
        }
    }

    /// Passive instances sleep for `delay` before applying an increment,
    /// which holds the active in replication for that long.
    pub fn with_passive_delay(mut self, delay: Duration) -> Self {
        self.passive_delay = Some(delay);
        self
    }

    pub fn stats(&self) -> Arc<CounterStats> {
        Arc::clone(&self.stats)
    }

    pub fn codec(&self) -> CounterCodec {
        CounterCodec
    }

    fn construct(&self, configuration: &[u8]) -> Result<CounterState, ConfigurationRejected> {
        let n = self.stats.constructions.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on == Some(n) {
            return Err(ConfigurationRejected::new(format!("construction {n} refused")));
        }
        check_configuration(configuration)?;
        Ok(CounterState::default())
    }
}

fn check_configuration(configuration: &[u8]) -> Result<(), ConfigurationRejected> {
    if configuration == REJECTED_CONFIGURATION {
        return Err(ConfigurationRejected::new("counter configuration rejected"));
    }
    Ok(())
}

#[derive(Default)]
struct CounterState {
    value: i64,
    storage: Option<Arc<EntityStorage>>,
}

impl CounterState {
    fn attach(mut self, registry: &ServiceRegistry) -> Self {
        self.storage = registry.get_service::<EntityStorage>().ok().flatten();
        self
    }

    fn add(&mut self, amount: i64) -> Result<i64, EntityUserError> {
        self.set(self.value + amount)?;
        Ok(self.value)
    }

    fn set(&mut self, value: i64) -> Result<(), EntityUserError> {
        self.value = value;
        if let Some(storage) = &self.storage {
            storage
                .store(STORAGE_NAME, &value.to_be_bytes())
                .map_err(|e| EntityUserError::new(e.to_string()))?;
        }
        Ok(())
    }

    fn load(&mut self) {
        let stored = self
            .storage
            .as_ref()
            .and_then(|storage| storage.load(STORAGE_NAME).ok().flatten());
        if let Some(bytes) = stored.and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok()) {
            self.value = i64::from_be_bytes(bytes);
        }
    }
}

struct ActiveCounter {
    state: CounterState,
    stats: Arc<CounterStats>,
    messenger: Option<Arc<EntityMessenger>>,
    communicator: Option<Arc<ClientCommunicator>>,
}

#[async_trait]
impl ActiveServerEntity<CounterMessage, CounterResponse> for ActiveCounter {
    async fn invoke(&mut self, context: &InvokeContext, message: CounterMessage) -> Result<CounterResponse, EntityUserError> {
        match message {
            CounterMessage::Increment(amount) => Ok(CounterResponse::Value(self.state.add(amount)?)),
            CounterMessage::Get => Ok(CounterResponse::Value(self.state.value)),
            CounterMessage::IncrementLater(amount) => {
                let messenger = self
                    .messenger
                    .as_ref()
                    .ok_or_else(|| EntityUserError::new("no entity messenger"))?;
                let payload = CounterCodec
                    .encode_message(&CounterMessage::Increment(amount))
                    .map_err(|e| EntityUserError::new(e.to_string()))?;
                messenger
                    .message_self(payload)
                    .map_err(|e| EntityUserError::new(e.to_string()))?;
                Ok(CounterResponse::Value(self.state.value))
            }
            CounterMessage::Broadcast(bytes) => {
                let client = context
                    .client
                    .ok_or_else(|| EntityUserError::new("broadcast needs a client"))?;
                let communicator = self
                    .communicator
                    .as_ref()
                    .ok_or_else(|| EntityUserError::new("no client communicator"))?;
                communicator
                    .send_no_response(&client, bytes)
                    .map_err(|e| EntityUserError::new(e.to_string()))?;
                Ok(CounterResponse::Value(self.state.value))
            }
            CounterMessage::Fail => Err(EntityUserError::new("requested failure")),
            CounterMessage::ConcurrencyKey => Ok(CounterResponse::Value(i64::from(context.concurrency_key))),
            CounterMessage::Sync(_) => Err(EntityUserError::new("sync payload sent to active")),
        }
    }

    fn handle_reconnect(&mut self, _client: ClientDescriptor, _extended_data: &[u8]) {
        self.stats.reconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn create_new(&mut self) -> Result<(), ConfigurationRejected> {
        self.state
            .set(0)
            .map_err(|e| ConfigurationRejected::new(e.description))
    }

    fn load_existing(&mut self) {
        self.state.load();
    }

    fn synchronize_key_to_passive(&self, channel: &mut PassiveSynchronizationChannel<CounterMessage>, concurrency_key: i32) {
        if concurrency_key == VALUE_KEY {
            channel.synchronize_to_passive(CounterMessage::Sync(self.state.value));
        }
    }
}

struct PassiveCounter {
    state: CounterState,
    delay: Option<Duration>,
}

#[async_trait]
impl PassiveServerEntity<CounterMessage> for PassiveCounter {
    async fn invoke(&mut self, message: CounterMessage) -> Result<(), EntityUserError> {
        match message {
            CounterMessage::Increment(amount) => {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                self.state.add(amount).map(|_| ())
            }
            CounterMessage::Sync(value) => self.state.set(value),
            _ => Ok(()),
        }
    }

    fn create_new(&mut self) -> Result<(), ConfigurationRejected> {
        self.state
            .set(0)
            .map_err(|e| ConfigurationRejected::new(e.description))
    }

    fn load_existing(&mut self) {
        self.state.load();
    }
}

impl EntityServerService for CounterService {
    type Message = CounterMessage;
    type Response = CounterResponse;

    fn version(&self) -> u64 {
        COUNTER_VERSION
    }

    fn handles_entity_type(&self, class_name: &str) -> bool {
        class_name == COUNTER_CLASS
    }

    fn create_active_entity(
        &self,
        registry: &ServiceRegistry,
        configuration: &[u8],
    ) -> Result<ActiveEntityBox<Self>, ConfigurationRejected> {
        let state = self.construct(configuration)?.attach(registry);
        Ok(Box::new(ActiveCounter {
            state,
            stats: Arc::clone(&self.stats),
            messenger: registry.get_service::<EntityMessenger>().ok().flatten(),
            communicator: registry.get_service::<ClientCommunicator>().ok().flatten(),
        }))
    }

    fn create_passive_entity(
        &self,
        registry: &ServiceRegistry,
        configuration: &[u8],
    ) -> Result<PassiveEntityBox<Self>, ConfigurationRejected> {
        let state = self.construct(configuration)?.attach(registry);
        Ok(Box::new(PassiveCounter {
            state,
            delay: self.passive_delay,
        }))
    }

    // Reconfiguring keeps the running instance and its value.
    fn reconfigure_active_entity(
        &self,
        _registry: &ServiceRegistry,
        _entity: &mut ActiveEntityBox<Self>,
        configuration: &[u8],
    ) -> Result<(), ConfigurationRejected> {
        check_configuration(configuration)
    }

    fn reconfigure_passive_entity(
        &self,
        _registry: &ServiceRegistry,
        _entity: &mut PassiveEntityBox<Self>,
        configuration: &[u8],
    ) -> Result<(), ConfigurationRejected> {
        check_configuration(configuration)
    }

    fn concurrency_strategy(&self, _configuration: &[u8]) -> Arc<dyn ConcurrencyStrategy<CounterMessage>> {
        Arc::new(CounterStrategy)
    }

    fn execution_strategy(&self, _configuration: &[u8]) -> Arc<dyn ExecutionStrategy<CounterMessage>> {
        Arc::new(CounterStrategy)
    }

    fn message_codec(&self) -> Arc<dyn MessageCodec<CounterMessage, CounterResponse>> {
        Arc::new(CounterCodec)
    }

    fn sync_message_codec(&self) -> Option<Arc<dyn SyncMessageCodec<CounterMessage>>> {
        Some(Arc::new(CounterCodec))
    }
}

struct CounterStrategy;

impl ConcurrencyStrategy<CounterMessage> for CounterStrategy {
    fn concurrency_key(&self, _message: &CounterMessage) -> i32 {
        VALUE_KEY
    }

    fn keys_for_synchronization(&self) -> BTreeSet<i32> {
        BTreeSet::from([VALUE_KEY])
    }
}

impl ExecutionStrategy<CounterMessage> for CounterStrategy {
    fn location(&self, message: &CounterMessage) -> ExecutionLocation {
        match message {
            CounterMessage::Increment(_) => ExecutionLocation::Both,
            CounterMessage::Sync(_) => ExecutionLocation::Passive,
            _ => ExecutionLocation::Active,
        }
    }
}

/// MessagePack codec for counter messages and responses.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterCodec;

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    rmp_serde::to_vec(value).map_err(|e| CodecError::new(e.to_string()))
}

fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T, CodecError> {
    rmp_serde::from_slice(bytes).map_err(|e| CodecError::new(e.to_string()))
}

impl MessageCodec<CounterMessage, CounterResponse> for CounterCodec {
    fn encode_message(&self, message: &CounterMessage) -> Result<Vec<u8>, CodecError> {
        encode(message)
    }

    fn decode_message(&self, bytes: &[u8]) -> Result<CounterMessage, CodecError> {
        decode(bytes)
    }

    fn encode_response(&self, response: &CounterResponse) -> Result<Vec<u8>, CodecError> {
        encode(response)
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<CounterResponse, CodecError> {
        decode(bytes)
    }
}

impl SyncMessageCodec<CounterMessage> for CounterCodec {
    fn encode(&self, _concurrency_key: i32, message: &CounterMessage) -> Result<Vec<u8>, CodecError> {
        encode(message)
    }

    fn decode(&self, _concurrency_key: i32, bytes: &[u8]) -> Result<CounterMessage, CodecError> {
        decode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_on_counts_every_construction() {
        let service = CounterService::failing_on(2);
        assert!(service.construct(b"").is_ok());
        assert!(service.construct(b"").is_err());
        assert!(service.construct(b"").is_ok());
        assert_eq!(service.stats().constructions(), 3);
    }

    #[test]
    fn rejected_configuration_is_refused() {
        let service = CounterService::new();
        let err = service.construct(REJECTED_CONFIGURATION).err().unwrap();
        assert_eq!(err.reason, "counter configuration rejected");
    }

    #[test]
    fn increments_run_everywhere_queries_only_on_active() {
        let strategy = CounterStrategy;
        assert_eq!(strategy.location(&CounterMessage::Increment(1)), ExecutionLocation::Both);
        assert_eq!(strategy.location(&CounterMessage::Get), ExecutionLocation::Active);
        assert_eq!(strategy.location(&CounterMessage::Sync(4)), ExecutionLocation::Passive);
        assert_eq!(strategy.keys_for_synchronization(), BTreeSet::from([1]));
    }

    #[test]
    fn codec_rejects_garbage() {
        assert!(CounterCodec.decode_message(&[0xc1]).is_err());
        let bytes = CounterCodec.encode_response(&CounterResponse::Value(9)).unwrap();
        assert_eq!(CounterCodec.decode_response(&bytes).unwrap(), CounterResponse::Value(9));
    }
}
