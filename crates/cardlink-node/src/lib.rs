//! Node roles for the cardlink remote-reader transport.
//!
//! One node is one endpoint's implementation of the transport protocol. Four
//! roles cover the client/server × async/sync matrix:
//! - [`AsyncClientNode`] / [`AsyncServerNode`] - full-duplex transports that
//!   push in both directions
//! - [`SyncClientNode`] / [`SyncServerNode`] - request/response transports
//!   where push is emulated with polling or long polling
//!
//! Every role keeps a per-session state machine that correlates outbound
//! calls with inbound replies; independent sessions make independent
//! progress.

mod backoff;
mod events;
mod session;

pub mod async_client;
pub mod async_server;
pub mod options;
pub mod sync_client;
pub mod sync_server;

pub use async_client::AsyncClientNode;
pub use async_server::AsyncServerNode;
pub use options::{NodeOptions, SyncClientOptions};
pub use sync_client::SyncClientNode;
pub use sync_server::SyncServerNode;
