//! pva-server: a PVAccess-style channel and RPC server.
//!
//! The [`Server`] owns an ordered registry of [`ChannelProvider`]s; a
//! built-in provider serves the "server" introspection channel. Clients
//! discover channels through UDP or in-connection search, create them over
//! a framed TCP connection, and run RPCs against them.

pub mod config;
mod connection;
mod introspect;
pub mod provider;
mod search;
pub mod server;
mod state;

pub use config::ServerConfig;
pub use introspect::SERVER_CHANNEL;
pub use provider::{Channel, ChannelProvider, ChannelRpc, RpcFactory, RpcSupport};
pub use server::Server;
