//! Database gateway: trigger installation, change-log polling, row apply and
//! `sync_status` bookkeeping.

mod gateway;
pub mod sql;

pub use gateway::{DatabaseGateway, QueuedWrite};
