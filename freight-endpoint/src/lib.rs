//! Freight endpoint: a long-lived process hosting a local object store
//! and participating in the peer fabric.
//!
//! The pieces, bottom up: [`store`] holds objects in memory, [`peers`]
//! maintains data channels to other endpoints, [`service`] routes
//! operations between the two, [`web`] exposes the service over HTTP,
//! [`server`] wires everything together, and [`commands`] manages the
//! endpoint's on-disk lifecycle.

pub mod commands;
pub mod peers;
pub mod server;
pub mod service;
pub mod store;
pub mod web;
