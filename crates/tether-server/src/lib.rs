//! # tether-server
//!
//! HTTP front end for a [`tether_core::Channel`]:
//!
//! - WebSocket route (default `/ws`) that upgrades and hands sockets to the channel
//! - `/health` with connection, user, and topic counts
//! - `/metrics` in Prometheus text format when a recorder is installed
//!
//! Handshake context (headers and upstream middleware values such as the
//! authenticated `UserID`) is captured into [`context::HttpContext`].

#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod errors;
pub mod health;
pub mod metrics;
pub mod server;
pub mod transport;

pub use config::ServerConfig;
pub use context::{ContextValues, HttpContext};
pub use errors::{Result, ServerError};
pub use server::ChannelServer;
pub use transport::AxumTransport;
