//! Signaling relay for the freight fabric.
//!
//! Endpoints register here under their identity; the relay then ferries
//! connection-establishment messages between them so pairs of endpoints
//! can bring up direct data channels. The relay never carries object
//! payloads.

pub mod server;
