#![deny(missing_docs)]
//! Library form of the vDPA HA context custodian.
//!
//! The custodian outlives the vDPA worker daemon: it holds VFIO and
//! vhost descriptors (and the metadata to use them) across worker
//! restarts, hands them back on reconnect, and quiesces the hardware
//! when the worker is gone for good.

/// Framed control messages and their wire records.
pub mod message;
/// In-memory catalog of held device contexts.
pub mod registry;
/// Control-socket reactor, opcode dispatch and the recovery path.
pub mod server;

pub use crate::server::{Server, UDS_PATH};

mod monitor;
mod reset;
mod vfio;
