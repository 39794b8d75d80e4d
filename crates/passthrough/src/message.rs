use crate::envelope::PassthroughMessage;
use crate::error::{EntityError, PassthroughError};
use crate::server_process::ServerProcessHandle;
use crate::types::{ClientDescriptor, ConnectionId, MessageKey, ProcessId};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// A server-to-client message, tagged with the process incarnation that
/// sent it.
#[derive(Debug)]
pub struct ServerToClient {
    pub from: ProcessId,
    pub bytes: Vec<u8>,
}

/// The channel a server process uses to reach one client connection.
#[derive(Debug, Clone)]
pub struct ClientSink {
    pub connection_id: ConnectionId,
    tx: mpsc::UnboundedSender<ServerToClient>,
}

impl ClientSink {
    pub(crate) fn new(connection_id: ConnectionId, tx: mpsc::UnboundedSender<ServerToClient>) -> Self {
        Self { connection_id, tx }
    }

    /// Delivers a message. A connection that already went away is not an
    /// error for the server.
    pub(crate) fn send(&self, from: ProcessId, message: &PassthroughMessage) -> Result<(), PassthroughError> {
        let bytes = message.encode()?;
        if self.tx.send(ServerToClient { from, bytes }).is_err() {
            debug!(connection = %self.connection_id, "client sink closed, message dropped");
        }
        Ok(())
    }
}

/// Who sent an inbound message and how to answer it.
#[derive(Debug)]
pub(crate) enum MessageSender {
    /// A client connection.
    Client(ClientSink),
    /// The active forwarding a replicated or synchronization message.
    /// `origin` is the client the message came from, if any.
    Interserver {
        origin: Option<ConnectionId>,
        complete: Option<oneshot::Sender<bool>>,
    },
    /// A message the server sent itself, whose completion may unblock
    /// retirement of others.
    Internal { key: MessageKey },
}

impl MessageSender {
    pub(crate) fn client_origin(&self) -> Option<ConnectionId> {
        match self {
            MessageSender::Client(sink) => Some(sink.connection_id),
            MessageSender::Interserver { origin, .. } => *origin,
            MessageSender::Internal { .. } => None,
        }
    }

    pub(crate) fn client_descriptor(&self, instance_id: u64) -> Option<ClientDescriptor> {
        self.client_origin()
            .map(|connection_id| ClientDescriptor::new(connection_id, instance_id))
    }

    pub(crate) fn internal_key(&self) -> Option<MessageKey> {
        match self {
            MessageSender::Internal { key } => Some(*key),
            _ => None,
        }
    }

    pub(crate) fn send_ack(&self, from: ProcessId, transaction_id: u64) -> Result<(), PassthroughError> {
        match self {
            MessageSender::Client(sink) => sink.send(
                from,
                &PassthroughMessage::ack().with_transaction_tracking(transaction_id, 0),
            ),
            _ => Ok(()),
        }
    }

    pub(crate) fn send_complete(
        &mut self,
        from: ProcessId,
        transaction_id: u64,
        result: Result<Vec<u8>, EntityError>,
    ) -> Result<(), PassthroughError> {
        match self {
            MessageSender::Client(sink) => sink.send(
                from,
                &PassthroughMessage::completion(result).with_transaction_tracking(transaction_id, 0),
            ),
            MessageSender::Interserver { complete, .. } => {
                if let Some(complete) = complete.take() {
                    // The active may have stopped waiting.
                    let _ = complete.send(result.is_ok());
                }
                Ok(())
            }
            MessageSender::Internal { key } => {
                if let Err(error) = result {
                    warn!(message = %key, %error, "internal message failed");
                }
                Ok(())
            }
        }
    }

    /// What to retire once this message may retire.
    pub(crate) fn pending_retire(&self, transaction_id: u64) -> Option<PendingRetire> {
        match self {
            MessageSender::Client(sink) => Some(PendingRetire {
                sink: sink.clone(),
                transaction_id,
            }),
            _ => None,
        }
    }
}

/// A retire that has been decided but possibly not yet sent.
#[derive(Debug)]
pub(crate) struct PendingRetire {
    sink: ClientSink,
    transaction_id: u64,
}

impl PendingRetire {
    pub(crate) fn send(&self, from: ProcessId) -> Result<(), PassthroughError> {
        self.sink.send(
            from,
            &PassthroughMessage::retire().with_transaction_tracking(self.transaction_id, 0),
        )
    }
}

/// Control requests handled on a process's message loop, in queue order with
/// regular messages.
pub(crate) enum Control {
    AttachPassive {
        passive: ServerProcessHandle,
        done: oneshot::Sender<Result<(), PassthroughError>>,
    },
    DetachPassive {
        process: ProcessId,
    },
    Promote {
        done: oneshot::Sender<Result<(), PassthroughError>>,
    },
    /// The connection closed. Anything it still waits for is forgotten.
    ClientDisconnected {
        connection: ConnectionId,
    },
    BeginResends,
    EndResends,
    Snapshot {
        reply: oneshot::Sender<crate::server_process::ProcessSnapshot>,
    },
}

/// One entry of a process's inbound queue.
pub(crate) enum Inbound {
    Message { sender: MessageSender, bytes: Vec<u8> },
    Control(Control),
}
