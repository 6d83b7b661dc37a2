//! # msgbroker
//!
//! `msgbroker` is a small in-memory publish/subscribe broker reachable over two
//! transports: newline-delimited requests on a TCP stream, and one request per
//! UDP datagram. Each topic keeps its latest value and pushes every new
//! publish to its live subscribers.
//!
//! ## Core Modules
//!
//! - `broker`: the processor task that owns topics and subscriptions, and the
//!   `Broker` handle used to talk to it.
//! - `client`: client identities and a small async client for the stream
//!   transport.
//! - `config`: loading settings from a file, the environment and defaults.
//! - `transport`: the stream and datagram servers and the request grammar they
//!   share.
//! - `utils`: error types and the buffered log sink.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;
