//! Tenant channel connections for courier-rs.
//!
//! This crate owns a tenant's persistent session with the external chat
//! network:
//!
//! - **Instances**: Persisted [`ChannelInstance`] records and their lifecycle
//! - **Gateway**: [`ChannelGateway`] client for the provider API
//! - **Registry**: In-process [`LiveRegistry`] of live connections
//! - **Supervisor**: [`HealthSupervisor`] reconciling store against registry
//!
//! The supervisor runs as a singleton periodic pass that detects zombie
//! instances (recorded as connected but not live), performs bounded
//! reconnects and expires stale sessions.

pub mod gateway;
pub mod instance;
pub mod registry;
pub mod store;
pub mod supervisor;

pub use gateway::{ChannelGateway, GatewayError, HttpGateway, OutboundMessage, SendReceipt};
pub use instance::{ChannelInstance, ChannelStatus};
pub use registry::{ConnectionHealth, ConnectionRegistry, LiveRegistry};
pub use store::{InstanceStore, MemoryInstanceStore};
pub use supervisor::{CheckKind, HealthReport, HealthSupervisor, run_supervisor};
