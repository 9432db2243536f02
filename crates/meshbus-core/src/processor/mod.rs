//! Application-facing processors.
//!
//! Provides:
//! - [`SinglePeerProcessor`]: one logical outbound connection that is kept alive
//! - [`MultiPeerProcessor`]: listeners plus a name registry with multicast and
//!   broadcast clients
//! - [`Client`]: typed and raw calls to one peer or a set of peers
//!
//! Both processors announce a [`crate::protocol::Hello`] built from
//! [`ProcessorConfig`] on every connection and serve inbound requests with the
//! handler they were given, usually a [`crate::protocol::Service`].

mod base;
mod client;
mod config;
mod multi;
mod single;

pub use client::{Client, OutgoingRequest, RequestArgs};
pub use config::{NewClientCallback, ProcessorConfig, ReconnectCallback, RemovedClientCallback};
pub use multi::MultiPeerProcessor;
pub use single::SinglePeerProcessor;
