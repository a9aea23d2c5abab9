//! Client SDK for the freight object fabric.
//!
//! This crate owns everything both sides of the wire agree on: the
//! signaling and data-plane protocol ([`proto`]), the error taxonomy
//! ([`error`]), and endpoint configuration files ([`config`]). On top of
//! that it provides the client-facing pieces: the signaling client
//! ([`relay_client`]), the HTTP client for endpoint gateways
//! ([`client`]), the [`connector::EndpointConnector`] that resolves keys
//! against a fleet of endpoints, and the [`cache::CachedStore`] that
//! layers an LRU cache with freshness checks over any remote byte store.

pub mod cache;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod proto;
pub mod relay_client;
