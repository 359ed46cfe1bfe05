//! In-process transports for the cardlink remote-reader transport.
//!
//! Routes messages between nodes within the same process, for testing and
//! single-process deployments. Wire bindings over real channels (HTTP,
//! WebSocket, ...) are supplied by the embedding application against the
//! endpoint contracts in `cardlink-core`.

pub mod memory;

pub use memory::{MemoryAsyncLink, MemorySyncEndpoint};
