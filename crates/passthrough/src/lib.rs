//! In-process emulation of an active/passive server stripe.
//!
//! A stripe is a set of simulated servers that all run inside one process.
//! One server is active and executes client messages against server-side
//! entities; the others are passives that receive replicated messages and
//! stay ready to take over. The [`cluster::ClusterControl`] starts and stops
//! servers, and clients follow the active across fail-overs, resending
//! whatever was still in flight.
//!
//! Entities are authored against the traits in [`entity`] and registered on
//! a [`services::ServiceCatalog`]. Clients reach them through
//! [`connection::Connection::entity_ref`].

pub mod cluster;
pub mod config;
pub mod connection;
pub mod entity;
mod entity_adapter;
pub mod entity_client;
pub mod envelope;
pub mod error;
pub mod invocation;
pub mod lifecycle;
pub mod lock_manager;
pub mod message;
mod message_handler;
pub mod metrics;
pub mod retirement;
pub mod server_process;
pub mod services;
pub mod storage;
pub mod testing;
pub mod transaction_order;
pub mod types;

pub use cluster::ClusterControl;
pub use config::StripeConfig;
pub use connection::{Connection, EndpointDelegate};
pub use entity_client::{EntityClientEndpoint, EntityRef};
pub use error::{EntityError, PassthroughError};
pub use invocation::{InvocationCallback, InvocationTask, Signal};
pub use metrics::StripeMetrics;
pub use server_process::{ProcessRole, ProcessSnapshot};
pub use services::ServiceCatalog;

/// Prelude module for convenient glob imports.
///
/// Use `use passthrough::prelude::*;` to import what an entity author and a
/// client need.
pub mod prelude {
    pub use crate::cluster::ClusterControl;
    pub use crate::config::StripeConfig;
    pub use crate::connection::{Connection, EndpointDelegate};
    pub use crate::entity::{
        ActiveEntityBox, ActiveServerEntity, CodecError, ConcurrencyStrategy, ConfigurationRejected,
        EntityServerService, EntityUserError, ExecutionLocation, ExecutionStrategy, InvokeContext,
        MessageCodec, PassiveEntityBox, PassiveServerEntity, PassiveSynchronizationChannel,
        SyncMessageCodec, MANAGEMENT_KEY, UNIVERSAL_KEY,
    };
    pub use crate::entity_client::{EntityClientEndpoint, EntityRef};
    pub use crate::error::{EntityError, PassthroughError};
    pub use crate::invocation::{InvocationCallback, InvocationTask, Signal};
    pub use crate::services::{
        ClientCommunicator, EntityMessenger, EntityStorage, ServiceCatalog, ServiceProvider,
        ServiceRegistry,
    };
    pub use crate::types::{ClientDescriptor, EntityTuple};
}
