//! Alarm engine for flexmon.
//!
//! The engine ingests asset announcements and metric publications from a
//! message bus, keeps a TTL-bounded cache of the freshest value per
//! `(quantity, asset)`, maintains the asset↔rule binding index, and
//! periodically evaluates every rule whose declared metrics are all
//! present — publishing alert transitions with routed actions.
//!
//! All engine state is owned by a single task; the periodic ticker is a
//! separate task that communicates over an in-process channel and shares
//! nothing. Rule management (LIST/LIST2/GET/ADD/DELETE) arrives as
//! mailbox requests on the same bus.

pub mod bus;
pub mod cache;
pub mod categories;
pub mod engine;
pub mod mailbox;
pub mod registry;
pub mod shm;

#[cfg(test)]
mod tests;

pub use bus::{BusClient, BusError, BusEvent, MemoryBus};
pub use engine::{Command, Engine, EngineConfig};
pub use shm::SharedMetricStore;
