//! # tether-core
//!
//! Messaging layer over full-duplex streams: connection registry, compact
//! wire framing, request/answer correlation, and topic pub/sub.
//!
//! - **Channel**: the broker. Accepts streams, dispatches frames to handlers,
//!   owns the connection, user, topic and pending-request registries
//! - **Connection / User / Connections**: send targets, single or fanned out
//! - **Adapter**: what a handler sees of one inbound frame
//! - **Client**: reconnecting counterpart that replays subscriptions
//! - **Transport / PeerContext**: the two capabilities a handshake adapter
//!   supplies (see `tether-server` for the axum one)
//! - **Frame**: `id:command:payload`, with an envelope form for peers that do
//!   not speak it

#![deny(unsafe_code)]

pub mod adapter;
pub mod channel;
pub mod client;
pub mod config;
pub mod connection;
pub mod connections;
pub mod context;
pub mod correlator;
pub mod errors;
pub mod frame;
pub mod handler;
pub mod logging;
pub mod message;
pub mod metrics;
pub mod policy;
pub mod registry;
pub mod transport;
pub mod user;

pub use adapter::{Adapter, Peer};
pub use channel::Channel;
pub use client::{Client, ClientState};
pub use config::{ChannelConfig, ClientConfig};
pub use connection::{Connection, ConnectionId};
pub use connections::Connections;
pub use context::{PeerContext, StaticContext};
pub use errors::{BroadcastError, Error, ProtocolError, Result, TransportError};
pub use frame::{Envelope, Frame, Origin, RequestId};
pub use handler::{Handler, SUBSCRIBE};
pub use message::Message;
pub use policy::{MalformedFramePolicy, Policies};
pub use transport::{Dialer, MessageKind, Transport};
pub use user::{User, UserId};
