//! The `client` module covers both sides of a client relationship.
//!
//! `Client`/`ClientId` identify a peer inside the broker (one per stream
//! connection or datagram source address), and `StreamClient` is a small
//! async client for the stream transport used by the CLI and the tests.

pub mod pubsub_client;
pub mod stream_client;

pub use pubsub_client::{Client, ClientId};
pub use stream_client::StreamClient;

#[cfg(test)]
mod tests;
