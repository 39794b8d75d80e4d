//! A simulated client connection.
//!
//! Sends go straight onto the current server process's queue. Everything the
//! server sends back arrives on the connection's own delivery task, so
//! invocation callbacks and endpoint delegates never run on a server's
//! message loop.
//!
//! Fail-over uses a two-phase reconnect. [`Connection::start_reconnect`]
//! parks new sends, restores held write locks and re-attaches every fetched
//! endpoint through the new process, waiting for each handshake to retire.
//! [`Connection::finish_reconnect`] then resends every invocation still in
//! flight and makes the new process current, which releases parked sends.

use crate::cluster::ClusterEvent;
use crate::envelope::{MessageBody, PassthroughMessage};
use crate::error::PassthroughError;
use crate::invocation::{InvocationCallback, InvocationRecord, RetireWaiter, Signal};
use crate::message::{ClientSink, ServerToClient};
use crate::server_process::ServerProcessHandle;
use crate::types::{ConnectionId, EntityTuple, ProcessId};
use dashmap::DashMap;
use enumset::EnumSet;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Client-side hooks of a fetched endpoint.
pub trait EndpointDelegate: Send {
    /// A message the entity pushed to this endpoint.
    fn handle_message(&mut self, _payload: &[u8]) {}

    /// Data handed to the entity when this endpoint re-attaches after a
    /// fail-over.
    fn reconnect_data(&mut self) -> Vec<u8> {
        Vec::new()
    }

    /// The connection closed while the endpoint was still fetched.
    fn did_disconnect_unexpectedly(&mut self) {}
}

struct NoopDelegate;

impl EndpointDelegate for NoopDelegate {}

/// Connection-side state of one endpoint.
pub(crate) struct EndpointShared {
    pub(crate) tuple: EntityTuple,
    pub(crate) instance_id: u64,
    pub(crate) fetched: AtomicBool,
    pub(crate) configuration: Mutex<Vec<u8>>,
    pub(crate) delegate: Mutex<Box<dyn EndpointDelegate>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Init,
    Running,
    Closed,
}

struct ConnectionState {
    lifecycle: Lifecycle,
    current: Option<ServerProcessHandle>,
    pending: Option<ServerProcessHandle>,
    /// The process the connection was detached from. Its last answers are
    /// still accepted.
    previous: Option<ProcessId>,
    reconnecting: bool,
    next_transaction_id: u64,
    in_flight: BTreeMap<u64, Arc<InvocationRecord>>,
    resend_snapshot: Vec<u64>,
}

impl ConnectionState {
    fn accepts(&self, from: ProcessId) -> bool {
        self.current.as_ref().is_some_and(|p| p.id() == from)
            || self.pending.as_ref().is_some_and(|p| p.id() == from)
            || self.previous == Some(from)
    }

    /// Registers an invocation and pushes it onto `process`'s queue while the
    /// state is locked, so queue order matches transaction order.
    fn dispatch(
        &mut self,
        process: &ServerProcessHandle,
        sink: &ClientSink,
        message: PassthroughMessage,
        callback: Box<dyn InvocationCallback>,
        signals: EnumSet<Signal>,
    ) -> Result<(u64, Arc<InvocationRecord>), PassthroughError> {
        let transaction_id = self.next_transaction_id;
        let oldest = self
            .in_flight
            .keys()
            .next()
            .copied()
            .unwrap_or(transaction_id);
        let bytes = message
            .with_transaction_tracking(transaction_id, oldest)
            .encode()?;
        self.next_transaction_id += 1;
        let record = Arc::new(InvocationRecord::new(bytes.clone(), callback, signals));
        self.in_flight.insert(transaction_id, Arc::clone(&record));
        if let Err(error) = process.send_from_client(sink.clone(), bytes) {
            // Stays in flight: the reconnect after fail-over resends it.
            debug!(connection = %sink.connection_id, transaction_id, %error, "send to stopped server");
        }
        Ok((transaction_id, record))
    }
}

pub(crate) struct ConnectionInner {
    id: ConnectionId,
    name: String,
    state: Mutex<ConnectionState>,
    attached: Notify,
    endpoints: DashMap<u64, Arc<EndpointShared>>,
    next_instance_id: AtomicU64,
    write_locks: Mutex<HashSet<EntityTuple>>,
    sink: ClientSink,
    events: mpsc::UnboundedSender<ClusterEvent>,
    delivery: CancellationToken,
}

/// A client connection to the stripe.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl Connection {
    /// Creates a connection in the `Init` state and spawns its delivery task.
    pub(crate) fn new(id: ConnectionId, name: impl Into<String>, events: mpsc::UnboundedSender<ClusterEvent>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ConnectionInner {
            id,
            name: name.into(),
            state: Mutex::new(ConnectionState {
                lifecycle: Lifecycle::Init,
                current: None,
                pending: None,
                previous: None,
                reconnecting: false,
                next_transaction_id: 1,
                in_flight: BTreeMap::new(),
                resend_snapshot: Vec::new(),
            }),
            attached: Notify::new(),
            endpoints: DashMap::new(),
            next_instance_id: AtomicU64::new(1),
            write_locks: Mutex::new(HashSet::new()),
            sink: ClientSink::new(id, tx),
            events,
            delivery: CancellationToken::new(),
        });
        tokio::spawn(deliver(Arc::clone(&inner), rx));
        Self { inner }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().lifecycle == Lifecycle::Closed
    }

    /// Number of invocations sent but not yet retired.
    pub fn in_flight(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    /// Attaches the connection to its first server process.
    pub(crate) fn attach(&self, process: ServerProcessHandle) {
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            state.lifecycle = Lifecycle::Running;
            state.current = Some(process);
        }
        self.inner.attached.notify_waiters();
    }

    /// Detaches from the current process. Sends park until a reconnect.
    pub(crate) fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        if let Some(process) = state.current.take() {
            debug!(connection = %self.inner.id, server = %process.name(), "disconnected");
            state.previous = Some(process.id());
        }
    }

    /// Sends a message, waiting for an attached process first.
    pub(crate) async fn send(
        &self,
        message: PassthroughMessage,
        callback: Box<dyn InvocationCallback>,
        signals: EnumSet<Signal>,
    ) -> Result<u64, PassthroughError> {
        loop {
            // Created before the check so a wake-up in between is not lost.
            let attached = self.inner.attached.notified();
            {
                let mut state = self.inner.state.lock();
                if state.lifecycle == Lifecycle::Closed {
                    return Err(self.closed());
                }
                if let (Some(process), false) = (state.current.clone(), state.reconnecting) {
                    let (transaction_id, record) =
                        state.dispatch(&process, &self.inner.sink, message, callback, signals)?;
                    drop(state);
                    record.sent();
                    return Ok(transaction_id);
                }
            }
            attached.await;
        }
    }

    /// Sends a message and waits for it to retire, returning its result.
    pub(crate) async fn send_and_retire(&self, message: PassthroughMessage) -> Result<Vec<u8>, PassthroughError> {
        let (waiter, done) = RetireWaiter::new();
        self.send(message, Box::new(waiter), RetireWaiter::signals())
            .await?;
        done.await.map_err(|_| self.closed())?
    }

    /// Sends a reconnect handshake directly to `process`, bypassing the
    /// parked-send gate, and waits for it to retire.
    async fn handshake(&self, process: &ServerProcessHandle, message: PassthroughMessage) -> Result<Vec<u8>, PassthroughError> {
        let (waiter, done) = RetireWaiter::new();
        let record = {
            let mut state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Closed {
                return Err(self.closed());
            }
            let (_, record) = state.dispatch(
                process,
                &self.inner.sink,
                message,
                Box::new(waiter),
                RetireWaiter::signals(),
            )?;
            record
        };
        record.sent();
        tokio::select! {
            outcome = done => outcome.map_err(|_| self.closed())?,
            _ = process.stopped() => Err(PassthroughError::ServerNotRunning {
                server: process.name().to_string(),
            }),
        }
    }

    /// First reconnect phase: park sends, then restore write locks and
    /// re-attach fetched endpoints through `process`.
    #[instrument(skip_all, fields(connection = %self.inner.id, server = %process.name()))]
    pub(crate) async fn start_reconnect(&self, process: &ServerProcessHandle) {
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            state.reconnecting = true;
            state.pending = Some(process.clone());
            state.resend_snapshot = state.in_flight.keys().copied().collect();
        }

        let locks: Vec<EntityTuple> = self.inner.write_locks.lock().iter().cloned().collect();
        for tuple in locks {
            let message = PassthroughMessage::lock_restore(&tuple.class_name, &tuple.entity_name);
            if let Err(error) = self.handshake(process, message).await {
                warn!(entity = %tuple, %error, "write lock not restored");
            }
        }

        let endpoints: Vec<Arc<EndpointShared>> = self
            .inner
            .endpoints
            .iter()
            .filter(|entry| entry.fetched.load(Ordering::SeqCst))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for endpoint in endpoints {
            let extended_data = endpoint.delegate.lock().reconnect_data();
            let message = PassthroughMessage::reconnect(
                &endpoint.tuple.class_name,
                &endpoint.tuple.entity_name,
                endpoint.instance_id,
                extended_data,
            );
            if let Err(error) = self.handshake(process, message).await {
                warn!(entity = %endpoint.tuple, instance = endpoint.instance_id, %error, "endpoint not re-attached");
            }
        }
        debug!("reconnect handshakes done");
    }

    /// Second reconnect phase: resend what is still in flight and make
    /// `process` current.
    #[instrument(skip_all, fields(connection = %self.inner.id, server = %process.name()))]
    pub(crate) fn finish_reconnect(&self, process: &ServerProcessHandle) {
        {
            let mut state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            let snapshot = std::mem::take(&mut state.resend_snapshot);
            let mut resent = 0usize;
            for transaction_id in snapshot {
                let Some(record) = state.in_flight.get(&transaction_id) else {
                    continue;
                };
                match process.send_from_client(self.inner.sink.clone(), record.bytes().to_vec()) {
                    Ok(()) => resent += 1,
                    Err(error) => debug!(transaction_id, %error, "resend to stopped server"),
                }
            }
            state.current = Some(process.clone());
            state.pending = None;
            state.reconnecting = false;
            state.lifecycle = Lifecycle::Running;
            info!(resent, "reconnected");
        }
        self.inner.attached.notify_waiters();
    }

    /// Fails every in-flight invocation without a server answer.
    fn force_close(&self) {
        let records: Vec<Arc<InvocationRecord>> = {
            let mut state = self.inner.state.lock();
            state.lifecycle = Lifecycle::Closed;
            state.current = None;
            state.pending = None;
            std::mem::take(&mut state.in_flight).into_values().collect()
        };
        for record in records {
            record.failure(self.closed());
            record.complete();
            record.retired();
        }
    }

    /// Closes the connection. When attached, fetched endpoints are released
    /// and held write locks dropped on the server first. The server is then
    /// told to forget whatever the connection still has queued.
    #[instrument(skip_all, fields(connection = %self.inner.id))]
    pub async fn close(&self) {
        let (attached, process) = {
            let state = self.inner.state.lock();
            if state.lifecycle == Lifecycle::Closed {
                return;
            }
            (
                state.current.is_some() && !state.reconnecting,
                state.current.clone().or_else(|| state.pending.clone()),
            )
        };
        let endpoints: Vec<Arc<EndpointShared>> = self
            .inner
            .endpoints
            .iter()
            .filter(|entry| entry.fetched.swap(false, Ordering::SeqCst))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let locks: Vec<EntityTuple> = self.inner.write_locks.lock().drain().collect();
        if attached {
            for endpoint in &endpoints {
                let message = PassthroughMessage::unexpected_release(
                    &endpoint.tuple.class_name,
                    &endpoint.tuple.entity_name,
                    endpoint.instance_id,
                );
                if let Err(error) = self.send_and_retire(message).await {
                    debug!(entity = %endpoint.tuple, %error, "release on close failed");
                }
            }
            for tuple in &locks {
                let message = PassthroughMessage::lock_release(&tuple.class_name, &tuple.entity_name);
                if let Err(error) = self.send_and_retire(message).await {
                    debug!(entity = %tuple, %error, "lock release on close failed");
                }
            }
        }
        if let Some(process) = process {
            if let Err(error) = process.client_disconnected(self.inner.id) {
                debug!(server = %process.name(), %error, "server gone before disconnect notice");
            }
        }
        for endpoint in &endpoints {
            endpoint.delegate.lock().did_disconnect_unexpectedly();
        }
        self.inner.endpoints.clear();
        self.force_close();
        self.inner.delivery.cancel();
        self.inner.attached.notify_waiters();
        if self
            .inner
            .events
            .send(ClusterEvent::ConnectionClosed(self.inner.id))
            .is_err()
        {
            debug!("cluster controller already gone");
        }
        info!("connection closed");
    }

    /// Drops the connection without telling any server, as on shutdown.
    pub(crate) fn abandon(&self) {
        self.force_close();
        self.inner.delivery.cancel();
        self.inner.attached.notify_waiters();
    }

    pub(crate) fn register_endpoint(&self, tuple: EntityTuple) -> Arc<EndpointShared> {
        let instance_id = self.inner.next_instance_id.fetch_add(1, Ordering::SeqCst);
        let endpoint = Arc::new(EndpointShared {
            tuple,
            instance_id,
            fetched: AtomicBool::new(false),
            configuration: Mutex::new(Vec::new()),
            delegate: Mutex::new(Box::new(NoopDelegate)),
        });
        self.inner.endpoints.insert(instance_id, Arc::clone(&endpoint));
        endpoint
    }

    pub(crate) fn remove_endpoint(&self, instance_id: u64) {
        self.inner.endpoints.remove(&instance_id);
    }

    pub(crate) fn lock_acquired(&self, tuple: EntityTuple) {
        self.inner.write_locks.lock().insert(tuple);
    }

    pub(crate) fn lock_released(&self, tuple: &EntityTuple) {
        self.inner.write_locks.lock().remove(tuple);
    }

    fn closed(&self) -> PassthroughError {
        PassthroughError::ConnectionClosed {
            connection: self.inner.id,
        }
    }
}

async fn deliver(inner: Arc<ConnectionInner>, mut rx: mpsc::UnboundedReceiver<ServerToClient>) {
    loop {
        let next = tokio::select! {
            biased;
            _ = inner.delivery.cancelled() => break,
            next = rx.recv() => next,
        };
        let Some(ServerToClient { from, bytes }) = next else {
            break;
        };
        inner.deliver(from, &bytes);
    }
    debug!(connection = %inner.id, "delivery task stopped");
}

impl ConnectionInner {
    fn record(&self, transaction_id: u64) -> Option<Arc<InvocationRecord>> {
        self.state.lock().in_flight.get(&transaction_id).cloned()
    }

    fn deliver(&self, from: ProcessId, bytes: &[u8]) {
        if !self.state.lock().accepts(from) {
            warn!(connection = %self.id, process = %from, "dropping message from stale server");
            return;
        }
        let message = match PassthroughMessage::decode(bytes) {
            Ok(message) => message,
            Err(error) => {
                warn!(connection = %self.id, %error, "undecodable server message");
                return;
            }
        };
        let transaction_id = message.transaction_id;
        match message.body {
            MessageBody::AckFromServer => {
                if let Some(record) = self.record(transaction_id) {
                    record.received();
                }
            }
            MessageBody::CompleteFromServer { response } => {
                if let Some(record) = self.record(transaction_id) {
                    record.result(response);
                    record.complete();
                }
            }
            MessageBody::ExceptionFromServer { error } => {
                if let Some(record) = self.record(transaction_id) {
                    record.failure(PassthroughError::Entity(error));
                    record.complete();
                }
            }
            MessageBody::RetireFromServer => {
                let record = self.state.lock().in_flight.remove(&transaction_id);
                if let Some(record) = record {
                    record.retired();
                }
            }
            MessageBody::InvokeOnClient {
                client_instance_id,
                payload,
            } => {
                let endpoint = self
                    .endpoints
                    .get(&client_instance_id)
                    .map(|entry| Arc::clone(entry.value()));
                match endpoint {
                    Some(endpoint) => endpoint.delegate.lock().handle_message(&payload),
                    None => debug!(connection = %self.id, instance = client_instance_id, "message for released endpoint"),
                }
            }
            MessageBody::MonitorMessage { .. } | MessageBody::MonitorException { .. } => {
                debug!(connection = %self.id, "ignoring monitor message");
            }
            other => {
                warn!(connection = %self.id, message_type = ?other.message_type(), "unexpected message for a client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn connection() -> (Connection, mpsc::UnboundedReceiver<ClusterEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Connection::new(ConnectionId(1), "client", events), rx)
    }

    #[tokio::test]
    async fn send_waits_until_closed_when_never_attached() {
        let (connection, mut events) = connection();
        let sender = connection.clone();
        let pending = tokio::spawn(async move {
            sender
                .send_and_retire(PassthroughMessage::does_entity_exist("counter", "a"))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        connection.close().await;
        let result = pending.await.unwrap();
        assert!(matches!(
            result,
            Err(PassthroughError::ConnectionClosed { connection }) if connection == ConnectionId(1)
        ));
        assert!(connection.is_closed());
        assert!(matches!(
            events.recv().await,
            Some(ClusterEvent::ConnectionClosed(ConnectionId(1)))
        ));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (connection, mut events) = connection();
        connection.close().await;
        connection.close().await;
        assert!(events.recv().await.is_some());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn stale_messages_are_not_accepted() {
        let state = ConnectionState {
            lifecycle: Lifecycle::Running,
            current: None,
            pending: None,
            previous: Some(ProcessId(4)),
            reconnecting: false,
            next_transaction_id: 1,
            in_flight: BTreeMap::new(),
            resend_snapshot: Vec::new(),
        };
        assert!(state.accepts(ProcessId(4)));
        assert!(!state.accepts(ProcessId(5)));
    }
}
