//! mysql-sync - Multi-Master Table Replication Daemon
//!
//! A per-node daemon that replicates row-level changes of selected MySQL
//! tables to peer daemons over an MQTT bus and applies incoming peer changes
//! to its own database. Every node runs the same software under a distinct
//! name; together they form an eventually-consistent multi-master mesh.
//!
//! # Architecture
//!
//! Capture is trigger-based: each table in the sync set gets three triggers
//! that record mutations in a change-log table, which is polled in date
//! order. A typed event hub wires the pipeline stages together:
//!
//! - the database gateway polls captured changes and applies peer changes
//! - the transformer stage rewrites entities per table and direction
//! - the bus gateway publishes to `/change/<peer>`, tracks peer presence and
//!   buffers messages for offline peers in durable per-peer queues
//!
//! Transient failures are absorbed by file-backed queues: peer outages by the
//! per-peer queues, database outages by the local apply queue. Replication
//! outcomes are recorded per (table, id, peer) in a `sync_status` table.

pub mod bus;
pub mod config;
pub mod database;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod queue;
pub mod transform;

pub use config::SyncConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::bus::{BusGateway, BusNotice};
    pub use crate::config::SyncConfig;
    pub use crate::database::DatabaseGateway;
    pub use crate::error::{Error, Result};
    pub use crate::hub::{Event, EventHub};
    pub use crate::protocol::{Change, Row, StatusChange, SyncOutcome};
    pub use crate::queue::DurableQueue;
    pub use crate::transform::{TransformContext, Transformer, TransformerRegistry, TransformerStage};
}
