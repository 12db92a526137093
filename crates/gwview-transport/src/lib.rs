//! # Gateway View Transport
//!
//! Broker adapters implementing the `MessageSource` / `MessageSink`
//! strategies from `gwview-core`.
//!
//! - `JetStreamSource` / `JetStreamSink`: NATS JetStream, offset = stream sequence
//! - `MemoryBroker`: in-process log for tests and local runs

pub mod jetstream;
pub mod memory;
pub mod subject;

pub use jetstream::*;
pub use memory::*;
pub use subject::*;
