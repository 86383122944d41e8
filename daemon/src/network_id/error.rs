//! Error types for the network-id manager.

use thiserror::Error;
use veil_common::serializer::ReaderError;
use veil_common::tokio::time::error::Elapsed;

/// Error type for network-id operations.
///
/// Most of these are samples rather than faults: a failed probe is
/// recorded against the relevant ping record and the next volley moves on.
#[derive(Error, Debug)]
pub enum NetworkIdError {
    /// The peer went away mid-transaction.
    #[error("Peer disconnected")]
    Disconnected,

    /// A wait ran past its deadline.
    #[error("Request timed out: {0}")]
    AsyncTimeOut(#[from] Elapsed),

    /// The outbound channel refused the packet.
    #[error("Error while sending packet: {0}")]
    SendError(String),

    /// Malformed packet on the wire.
    #[error("Serialization error: {0}")]
    Serialization(#[from] ReaderError),

    /// The probe came back as a loop, a short path or no-route.
    /// This is a normal outcome, not a fault.
    #[error("Probe {0:#018x} was rejected")]
    ProbeRejected(u64),

    /// A pong arrived carrying the wrong secret.
    #[error("Secret mismatch on pong for probe {0:#018x}")]
    SecretMismatch(u64),
}

/// Result type alias for network-id operations.
pub type NetworkIdResult<T> = Result<T, NetworkIdError>;
