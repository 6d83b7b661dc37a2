//! The `utils` module collects the pieces shared by every layer of `msgbroker`:
//! the error types and the asynchronous log sink.

pub mod error;
pub mod logging;

pub use error::{BrokerError, ProtocolError, TransportError};

#[cfg(test)]
mod tests;
