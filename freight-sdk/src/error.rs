//! Error taxonomy shared across the fabric.

use uuid::Uuid;

/// Errors surfaced by the fabric and its clients.
///
/// `NOT_FOUND` is deliberately absent: a missing object is an ordinary
/// `None`/`false` result, not an error.
#[derive(Debug, thiserror::Error)]
pub enum FabricError {
    /// The signaling relay refused the registration, replied with an
    /// error, or did not reply within the timeout. Fatal to the
    /// signaling-client handle; retry by constructing a new one.
    #[error("peer registration failed: {0}")]
    Registration(String),

    /// The named peer is not registered with the signaling relay.
    #[error("peer {0} is unknown")]
    PeerUnknown(Uuid),

    /// A handshake or request deadline expired.
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    /// The outbound queue to a peer is saturated. The request was not
    /// transmitted; the channel itself is unaffected.
    #[error("outbound queue to peer {0} is full")]
    Backpressure(Uuid),

    /// A peer channel failed mid-request, or could not be established.
    #[error("peer channel failed: {0}")]
    Channel(String),

    /// A frame could not be decoded. Recovered locally on both the
    /// signaling and data paths: the frame is dropped and the session
    /// continues.
    #[error("undecodable frame: {0}")]
    Serialization(String),

    /// An object exceeds the store's per-object size bound.
    #[error("object of {size} bytes exceeds the {limit} byte limit")]
    ObjectTooLarge { size: usize, limit: usize },

    /// Persisted endpoint configuration is missing or invalid. Reported
    /// at startup; prevents the endpoint from coming up.
    #[error("invalid endpoint configuration: {0}")]
    Config(String),
}
