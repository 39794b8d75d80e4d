//! Wire messages exchanged between simulated clients and server processes.
//!
//! Every message is a fixed 18-byte header followed by a MessagePack body:
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 1 | type tag |
//! | 1 | 1 | replicate-to-passives flag (0 or 1) |
//! | 2 | 8 | transaction id, big endian |
//! | 10 | 8 | oldest in-flight transaction id, big endian |
//!
//! Decoding is split in two: [`decode_header`] is enough to route and order a
//! message, while [`decode_body`] is only run once the message is about to
//! execute.

use crate::error::{EntityError, PassthroughError};
use serde::{Deserialize, Serialize};

/// Size of the fixed message header in bytes.
pub const HEADER_LEN: usize = 18;

/// Transaction id used on messages that are not part of a client's sequence,
/// such as synchronization traffic between servers.
pub const NO_TRANSACTION: u64 = 0;

/// Type tag carried in the first header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    FetchEntity = 1,
    ReleaseEntity = 2,
    DoesEntityExist = 3,
    CreateEntity = 4,
    ReconfigureEntity = 5,
    DestroyEntity = 6,
    InvokeOnServer = 7,
    AckFromServer = 8,
    CompleteFromServer = 9,
    ExceptionFromServer = 10,
    RetireFromServer = 11,
    InvokeOnClient = 12,
    Reconnect = 13,
    SyncEntityStart = 14,
    SyncEntityEnd = 15,
    SyncEntityKeyStart = 16,
    SyncEntityKeyEnd = 17,
    SyncEntityPayload = 18,
    UnexpectedRelease = 19,
    MonitorMessage = 20,
    MonitorException = 21,
    LockAcquire = 22,
    LockTryAcquire = 23,
    LockRelease = 24,
    LockRestore = 25,
}

impl MessageType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        use MessageType::*;
        let message_type = match tag {
            1 => FetchEntity,
            2 => ReleaseEntity,
            3 => DoesEntityExist,
            4 => CreateEntity,
            5 => ReconfigureEntity,
            6 => DestroyEntity,
            7 => InvokeOnServer,
            8 => AckFromServer,
            9 => CompleteFromServer,
            10 => ExceptionFromServer,
            11 => RetireFromServer,
            12 => InvokeOnClient,
            13 => Reconnect,
            14 => SyncEntityStart,
            15 => SyncEntityEnd,
            16 => SyncEntityKeyStart,
            17 => SyncEntityKeyEnd,
            18 => SyncEntityPayload,
            19 => UnexpectedRelease,
            20 => MonitorMessage,
            21 => MonitorException,
            22 => LockAcquire,
            23 => LockTryAcquire,
            24 => LockRelease,
            25 => LockRestore,
            _ => return None,
        };
        Some(message_type)
    }

    /// Whether this message travels from a server to a client.
    pub fn is_server_to_client(self) -> bool {
        matches!(
            self,
            MessageType::AckFromServer
                | MessageType::CompleteFromServer
                | MessageType::ExceptionFromServer
                | MessageType::RetireFromServer
                | MessageType::InvokeOnClient
                | MessageType::MonitorMessage
                | MessageType::MonitorException
        )
    }
}

/// The routing and ordering part of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub should_replicate: bool,
    pub transaction_id: u64,
    pub oldest_transaction_id: u64,
}

/// Type-specific message payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageBody {
    FetchEntity {
        class_name: String,
        entity_name: String,
        client_instance_id: u64,
        version: u64,
    },
    ReleaseEntity {
        class_name: String,
        entity_name: String,
        client_instance_id: u64,
    },
    DoesEntityExist {
        class_name: String,
        entity_name: String,
    },
    CreateEntity {
        class_name: String,
        entity_name: String,
        version: u64,
        configuration: Vec<u8>,
    },
    ReconfigureEntity {
        class_name: String,
        entity_name: String,
        version: u64,
        configuration: Vec<u8>,
    },
    DestroyEntity {
        class_name: String,
        entity_name: String,
    },
    InvokeOnServer {
        class_name: String,
        entity_name: String,
        client_instance_id: u64,
        payload: Vec<u8>,
    },
    AckFromServer,
    CompleteFromServer {
        response: Vec<u8>,
    },
    ExceptionFromServer {
        error: EntityError,
    },
    RetireFromServer,
    InvokeOnClient {
        client_instance_id: u64,
        payload: Vec<u8>,
    },
    Reconnect {
        class_name: String,
        entity_name: String,
        client_instance_id: u64,
        extended_data: Vec<u8>,
    },
    SyncEntityStart {
        class_name: String,
        entity_name: String,
        version: u64,
        configuration: Vec<u8>,
    },
    SyncEntityEnd {
        class_name: String,
        entity_name: String,
    },
    SyncEntityKeyStart {
        class_name: String,
        entity_name: String,
        concurrency_key: i32,
    },
    SyncEntityKeyEnd {
        class_name: String,
        entity_name: String,
        concurrency_key: i32,
    },
    SyncEntityPayload {
        class_name: String,
        entity_name: String,
        concurrency_key: i32,
        payload: Vec<u8>,
    },
    UnexpectedRelease {
        class_name: String,
        entity_name: String,
        client_instance_id: u64,
    },
    MonitorMessage {
        response: Vec<u8>,
    },
    MonitorException {
        error: EntityError,
    },
    LockAcquire {
        class_name: String,
        entity_name: String,
    },
    LockTryAcquire {
        class_name: String,
        entity_name: String,
    },
    LockRelease {
        class_name: String,
        entity_name: String,
    },
    LockRestore {
        class_name: String,
        entity_name: String,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::FetchEntity { .. } => MessageType::FetchEntity,
            MessageBody::ReleaseEntity { .. } => MessageType::ReleaseEntity,
            MessageBody::DoesEntityExist { .. } => MessageType::DoesEntityExist,
            MessageBody::CreateEntity { .. } => MessageType::CreateEntity,
            MessageBody::ReconfigureEntity { .. } => MessageType::ReconfigureEntity,
            MessageBody::DestroyEntity { .. } => MessageType::DestroyEntity,
            MessageBody::InvokeOnServer { .. } => MessageType::InvokeOnServer,
            MessageBody::AckFromServer => MessageType::AckFromServer,
            MessageBody::CompleteFromServer { .. } => MessageType::CompleteFromServer,
            MessageBody::ExceptionFromServer { .. } => MessageType::ExceptionFromServer,
            MessageBody::RetireFromServer => MessageType::RetireFromServer,
            MessageBody::InvokeOnClient { .. } => MessageType::InvokeOnClient,
            MessageBody::Reconnect { .. } => MessageType::Reconnect,
            MessageBody::SyncEntityStart { .. } => MessageType::SyncEntityStart,
            MessageBody::SyncEntityEnd { .. } => MessageType::SyncEntityEnd,
            MessageBody::SyncEntityKeyStart { .. } => MessageType::SyncEntityKeyStart,
            MessageBody::SyncEntityKeyEnd { .. } => MessageType::SyncEntityKeyEnd,
            MessageBody::SyncEntityPayload { .. } => MessageType::SyncEntityPayload,
            MessageBody::UnexpectedRelease { .. } => MessageType::UnexpectedRelease,
            MessageBody::MonitorMessage { .. } => MessageType::MonitorMessage,
            MessageBody::MonitorException { .. } => MessageType::MonitorException,
            MessageBody::LockAcquire { .. } => MessageType::LockAcquire,
            MessageBody::LockTryAcquire { .. } => MessageType::LockTryAcquire,
            MessageBody::LockRelease { .. } => MessageType::LockRelease,
            MessageBody::LockRestore { .. } => MessageType::LockRestore,
        }
    }
}

/// A complete message: header fields plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct PassthroughMessage {
    pub should_replicate: bool,
    pub transaction_id: u64,
    pub oldest_transaction_id: u64,
    pub body: MessageBody,
}

impl PassthroughMessage {
    fn new(should_replicate: bool, body: MessageBody) -> Self {
        Self {
            should_replicate,
            transaction_id: NO_TRANSACTION,
            oldest_transaction_id: NO_TRANSACTION,
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            message_type: self.message_type(),
            should_replicate: self.should_replicate,
            transaction_id: self.transaction_id,
            oldest_transaction_id: self.oldest_transaction_id,
        }
    }

    pub fn set_transaction_tracking(&mut self, transaction_id: u64, oldest_transaction_id: u64) {
        self.transaction_id = transaction_id;
        self.oldest_transaction_id = oldest_transaction_id;
    }

    pub fn with_transaction_tracking(mut self, transaction_id: u64, oldest: u64) -> Self {
        self.set_transaction_tracking(transaction_id, oldest);
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, PassthroughError> {
        let body = rmp_serde::to_vec(&self.body).map_err(|e| PassthroughError::MalformedMessage {
            reason: format!("failed to encode {:?} body", self.message_type()),
            source: Some(Box::new(e)),
        })?;
        let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
        bytes.push(self.message_type().tag());
        bytes.push(u8::from(self.should_replicate));
        bytes.extend_from_slice(&self.transaction_id.to_be_bytes());
        bytes.extend_from_slice(&self.oldest_transaction_id.to_be_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PassthroughError> {
        let header = decode_header(bytes)?;
        let body = decode_body(&header, bytes)?;
        Ok(Self {
            should_replicate: header.should_replicate,
            transaction_id: header.transaction_id,
            oldest_transaction_id: header.oldest_transaction_id,
            body,
        })
    }

    // Client to server.

    pub fn fetch_entity(class_name: &str, entity_name: &str, client_instance_id: u64, version: u64) -> Self {
        Self::new(
            false,
            MessageBody::FetchEntity {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
                client_instance_id,
                version,
            },
        )
    }

    pub fn release_entity(class_name: &str, entity_name: &str, client_instance_id: u64) -> Self {
        Self::new(
            false,
            MessageBody::ReleaseEntity {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
                client_instance_id,
            },
        )
    }

    pub fn does_entity_exist(class_name: &str, entity_name: &str) -> Self {
        Self::new(
            false,
            MessageBody::DoesEntityExist {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
            },
        )
    }

    pub fn create_entity(class_name: &str, entity_name: &str, version: u64, configuration: Vec<u8>) -> Self {
        Self::new(
            true,
            MessageBody::CreateEntity {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
                version,
                configuration,
            },
        )
    }

    pub fn reconfigure_entity(class_name: &str, entity_name: &str, version: u64, configuration: Vec<u8>) -> Self {
        Self::new(
            true,
            MessageBody::ReconfigureEntity {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
                version,
                configuration,
            },
        )
    }

    pub fn destroy_entity(class_name: &str, entity_name: &str) -> Self {
        Self::new(
            true,
            MessageBody::DestroyEntity {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
            },
        )
    }

    pub fn invoke_on_server(
        class_name: &str,
        entity_name: &str,
        client_instance_id: u64,
        payload: Vec<u8>,
        should_replicate: bool,
    ) -> Self {
        Self::new(
            should_replicate,
            MessageBody::InvokeOnServer {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
                client_instance_id,
                payload,
            },
        )
    }

    pub fn reconnect(class_name: &str, entity_name: &str, client_instance_id: u64, extended_data: Vec<u8>) -> Self {
        Self::new(
            false,
            MessageBody::Reconnect {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
                client_instance_id,
                extended_data,
            },
        )
    }

    pub fn unexpected_release(class_name: &str, entity_name: &str, client_instance_id: u64) -> Self {
        Self::new(
            false,
            MessageBody::UnexpectedRelease {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
                client_instance_id,
            },
        )
    }

    pub fn lock_acquire(class_name: &str, entity_name: &str) -> Self {
        Self::new(
            false,
            MessageBody::LockAcquire {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
            },
        )
    }

    pub fn lock_try_acquire(class_name: &str, entity_name: &str) -> Self {
        Self::new(
            false,
            MessageBody::LockTryAcquire {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
            },
        )
    }

    pub fn lock_release(class_name: &str, entity_name: &str) -> Self {
        Self::new(
            false,
            MessageBody::LockRelease {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
            },
        )
    }

    pub fn lock_restore(class_name: &str, entity_name: &str) -> Self {
        Self::new(
            false,
            MessageBody::LockRestore {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
            },
        )
    }

    // Server to client.

    pub fn ack() -> Self {
        Self::new(false, MessageBody::AckFromServer)
    }

    pub fn complete(response: Vec<u8>) -> Self {
        Self::new(false, MessageBody::CompleteFromServer { response })
    }

    pub fn exception(error: EntityError) -> Self {
        Self::new(false, MessageBody::ExceptionFromServer { error })
    }

    /// Builds either a complete or an exception message from an outcome.
    pub fn completion(result: Result<Vec<u8>, EntityError>) -> Self {
        match result {
            Ok(response) => Self::complete(response),
            Err(error) => Self::exception(error),
        }
    }

    pub fn retire() -> Self {
        Self::new(false, MessageBody::RetireFromServer)
    }

    pub fn invoke_on_client(client_instance_id: u64, payload: Vec<u8>) -> Self {
        Self::new(
            false,
            MessageBody::InvokeOnClient {
                client_instance_id,
                payload,
            },
        )
    }

    pub fn monitor_message(response: Vec<u8>) -> Self {
        Self::new(false, MessageBody::MonitorMessage { response })
    }

    pub fn monitor_exception(error: EntityError) -> Self {
        Self::new(false, MessageBody::MonitorException { error })
    }

    // Active to passive synchronization.

    pub fn sync_entity_start(class_name: &str, entity_name: &str, version: u64, configuration: Vec<u8>) -> Self {
        Self::new(
            false,
            MessageBody::SyncEntityStart {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
                version,
                configuration,
            },
        )
    }

    pub fn sync_entity_end(class_name: &str, entity_name: &str) -> Self {
        Self::new(
            false,
            MessageBody::SyncEntityEnd {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
            },
        )
    }

    pub fn sync_entity_key_start(class_name: &str, entity_name: &str, concurrency_key: i32) -> Self {
        Self::new(
            false,
            MessageBody::SyncEntityKeyStart {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
                concurrency_key,
            },
        )
    }

    pub fn sync_entity_key_end(class_name: &str, entity_name: &str, concurrency_key: i32) -> Self {
        Self::new(
            false,
            MessageBody::SyncEntityKeyEnd {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
                concurrency_key,
            },
        )
    }

    pub fn sync_entity_payload(class_name: &str, entity_name: &str, concurrency_key: i32, payload: Vec<u8>) -> Self {
        Self::new(
            false,
            MessageBody::SyncEntityPayload {
                class_name: class_name.to_string(),
                entity_name: entity_name.to_string(),
                concurrency_key,
                payload,
            },
        )
    }
}

/// Reads the fixed header without touching the body.
pub fn decode_header(bytes: &[u8]) -> Result<MessageHeader, PassthroughError> {
    if bytes.len() < HEADER_LEN {
        return Err(PassthroughError::MalformedMessage {
            reason: format!("message of {} bytes is shorter than the header", bytes.len()),
            source: None,
        });
    }
    let message_type = MessageType::from_tag(bytes[0]).ok_or_else(|| PassthroughError::MalformedMessage {
        reason: format!("unknown message type tag {}", bytes[0]),
        source: None,
    })?;
    let should_replicate = match bytes[1] {
        0 => false,
        1 => true,
        other => {
            return Err(PassthroughError::MalformedMessage {
                reason: format!("invalid replicate flag {other}"),
                source: None,
            })
        }
    };
    Ok(MessageHeader {
        message_type,
        should_replicate,
        transaction_id: read_u64(&bytes[2..10]),
        oldest_transaction_id: read_u64(&bytes[10..18]),
    })
}

/// Decodes the body of a message whose header was already read.
pub fn decode_body(header: &MessageHeader, bytes: &[u8]) -> Result<MessageBody, PassthroughError> {
    let payload = bytes.get(HEADER_LEN..).unwrap_or_default();
    let body: MessageBody = rmp_serde::from_slice(payload).map_err(|e| PassthroughError::MalformedMessage {
        reason: format!("failed to decode {:?} body", header.message_type),
        source: Some(Box::new(e)),
    })?;
    if body.message_type() != header.message_type {
        return Err(PassthroughError::MalformedMessage {
            reason: format!(
                "header says {:?} but body is {:?}",
                header.message_type,
                body.message_type()
            ),
            source: None,
        });
    }
    Ok(body)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntityTuple;
    use proptest::prelude::*;

    fn every_builder() -> Vec<PassthroughMessage> {
        let tuple = EntityTuple::new("counter", "a");
        vec![
            PassthroughMessage::fetch_entity("counter", "a", 1, 1),
            PassthroughMessage::release_entity("counter", "a", 1),
            PassthroughMessage::does_entity_exist("counter", "a"),
            PassthroughMessage::create_entity("counter", "a", 1, vec![1, 2]),
            PassthroughMessage::reconfigure_entity("counter", "a", 1, vec![3]),
            PassthroughMessage::destroy_entity("counter", "a"),
            PassthroughMessage::invoke_on_server("counter", "a", 1, vec![9], true),
            PassthroughMessage::ack(),
            PassthroughMessage::complete(vec![4]),
            PassthroughMessage::exception(EntityError::not_found(&tuple)),
            PassthroughMessage::retire(),
            PassthroughMessage::invoke_on_client(1, vec![5]),
            PassthroughMessage::reconnect("counter", "a", 1, vec![6]),
            PassthroughMessage::sync_entity_start("counter", "a", 1, vec![]),
            PassthroughMessage::sync_entity_end("counter", "a"),
            PassthroughMessage::sync_entity_key_start("counter", "a", 3),
            PassthroughMessage::sync_entity_key_end("counter", "a", 3),
            PassthroughMessage::sync_entity_payload("counter", "a", 3, vec![7]),
            PassthroughMessage::unexpected_release("counter", "a", 1),
            PassthroughMessage::monitor_message(vec![8]),
            PassthroughMessage::monitor_exception(EntityError::server(&tuple, "x")),
            PassthroughMessage::lock_acquire("counter", "a"),
            PassthroughMessage::lock_try_acquire("counter", "a"),
            PassthroughMessage::lock_release("counter", "a"),
            PassthroughMessage::lock_restore("counter", "a"),
        ]
    }

    #[test]
    fn tags_are_stable_and_unique() {
        let messages = every_builder();
        let mut tags: Vec<u8> = messages.iter().map(|m| m.message_type().tag()).collect();
        tags.sort_unstable();
        tags.dedup();
        assert_eq!(tags.len(), messages.len());
        for tag in tags {
            assert_eq!(MessageType::from_tag(tag).unwrap().tag(), tag);
        }
        assert_eq!(MessageType::from_tag(0), None);
        assert_eq!(MessageType::from_tag(200), None);
    }

    #[test]
    fn lifecycle_builders_replicate() {
        assert!(PassthroughMessage::create_entity("c", "n", 1, vec![]).should_replicate);
        assert!(PassthroughMessage::reconfigure_entity("c", "n", 1, vec![]).should_replicate);
        assert!(PassthroughMessage::destroy_entity("c", "n").should_replicate);
        assert!(!PassthroughMessage::fetch_entity("c", "n", 1, 1).should_replicate);
        assert!(!PassthroughMessage::reconnect("c", "n", 1, vec![]).should_replicate);
    }

    #[test]
    fn reencoding_a_decoded_message_is_byte_identical() {
        for (i, message) in every_builder().into_iter().enumerate() {
            let message = message.with_transaction_tracking(i as u64 + 10, 3);
            let bytes = message.encode().unwrap();
            let decoded = PassthroughMessage::decode(&bytes).unwrap();
            assert_eq!(decoded, message);
            assert_eq!(decoded.encode().unwrap(), bytes);
        }
    }

    #[test]
    fn header_decodes_without_body() {
        let bytes = PassthroughMessage::invoke_on_server("c", "n", 2, vec![1; 64], true)
            .with_transaction_tracking(42, 40)
            .encode()
            .unwrap();
        let header = decode_header(&bytes[..HEADER_LEN]).unwrap();
        assert_eq!(header.message_type, MessageType::InvokeOnServer);
        assert!(header.should_replicate);
        assert_eq!(header.transaction_id, 42);
        assert_eq!(header.oldest_transaction_id, 40);
        assert!(decode_body(&header, &bytes[..HEADER_LEN]).is_err());
    }

    #[test]
    fn short_header_is_malformed() {
        let err = decode_header(&[7, 0, 1]).unwrap_err();
        assert!(err.to_string().contains("shorter than the header"), "got: {err}");
    }

    #[test]
    fn mismatched_body_is_rejected() {
        let mut bytes = PassthroughMessage::ack().encode().unwrap();
        bytes[0] = MessageType::RetireFromServer.tag();
        let header = decode_header(&bytes).unwrap();
        let err = decode_body(&header, &bytes).unwrap_err();
        assert!(err.to_string().contains("body is AckFromServer"), "got: {err}");
    }

    #[test]
    fn invalid_replicate_flag_is_rejected() {
        let mut bytes = PassthroughMessage::ack().encode().unwrap();
        bytes[1] = 7;
        assert!(decode_header(&bytes).is_err());
    }

    proptest! {
        #[test]
        fn header_fields_survive_round_trip(
            index in 0usize..25,
            transaction_id in any::<u64>(),
            oldest in any::<u64>(),
        ) {
            let message = every_builder().swap_remove(index)
                .with_transaction_tracking(transaction_id, oldest);
            let bytes = message.encode().unwrap();
            let header = decode_header(&bytes).unwrap();
            prop_assert_eq!(header, message.header());
        }
    }
}
