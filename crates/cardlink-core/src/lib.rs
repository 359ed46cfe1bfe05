//! Core abstractions for the cardlink remote-reader transport.
//!
//! This crate provides the fundamental building blocks:
//! - `Message` - Wire envelope exchanged between two nodes
//! - `Action` - Closed action enumeration with opaque domain extensions
//! - Handler and transport-endpoint contracts
//! - Error taxonomy shared by every node role

pub mod error;
pub mod handler;
pub mod id;
pub mod message;
pub mod strategy;

pub use error::{NodeError, TransportError};
pub use handler::{AsyncClientEndpoint, AsyncServerEndpoint, MessageHandler, Node, SyncClientEndpoint};
pub use id::{IdGenerator, UuidIdGenerator};
pub use message::{Action, Message};
pub use strategy::EventPollStrategy;
