//! Ingestion: moving inbound messages into the store
//!
//! ```text
//! [Transport] → mpsc<Delivery> → [IngestWorker] → DataStore::persist
//!                                      ▲
//!                                WatchDog (pause / resume)
//! ```
//!
//! The transport is whatever feeds the channel; each delivery carries its
//! own acknowledgement channel so the transport can ack or redeliver.

pub mod consumer;

pub use consumer::{Delivery, IngestConfig, IngestMessage, IngestWorker, Outcome, WireTimestamp};
