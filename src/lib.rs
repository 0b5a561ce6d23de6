//! # Map Router
//!
//! Server side of the real-time map transport used by game clients.
//!
//! Each UDP datagram from a client is decrypted with that client's rolling
//! Blowfish key, checksum-verified, decompressed with the static bit codec and
//! split into sub-packets. Accepted sub-packets are published on a message bus
//! for game-logic workers. Replies travel the reverse path: batched, compressed,
//! checksummed, encrypted and sent.
//!
//! ## Architecture
//! ```text
//!             ┌──────────────────────── Router ────────────────────────┐
//! UDP ──recv──▶ LoginRequest ─▶ SessionTable ─▶ InboundPipeline ─────────┼──▶ PacketBus ──▶ workers
//!             │                      │                                 │
//! UDP ◀─send──┤               OutboundPipeline ◀── per-client queues ◀──┼─── ReplyReceiver ◀── workers
//!             └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//! - [`core`]: bit codec, Blowfish cipher and datagram framing
//! - [`protocol`]: sessions, login handling and both pipelines
//! - [`transport`]: the UDP socket and the session table
//! - [`bus`]: hand-off to workers in bincode or JSON
//! - [`router`]: the receive loop, flush timer and idle sweep
//! - [`config`], [`error`], [`utils`]: ambient pieces
//!
//! ## Quick Start
//! ```rust,no_run
//! use std::sync::Arc;
//! use map_router::bus::channel_bus;
//! use map_router::config::RouterConfig;
//! use map_router::core::codec::BitCodec;
//! use map_router::protocol::StaticKeyProvider;
//! use map_router::router::Router;
//! use map_router::transport::shutdown_channel;
//! use map_router::utils::global_metrics_handle;
//!
//! # async fn demo() -> map_router::error::Result<()> {
//! let config = RouterConfig::default();
//! let codec = BitCodec::load_dir(&config.codec.resource_path)?;
//! let (bus, _worker, replies) = channel_bus(config.bus.channel_capacity, config.bus.format);
//!
//! let router = Router::bind(
//!     config,
//!     codec,
//!     Arc::new(StaticKeyProvider::new()),
//!     Arc::new(bus),
//!     global_metrics_handle(),
//! )
//! .await?;
//!
//! let (_shutdown_tx, shutdown_rx) = shutdown_channel();
//! Arc::new(router).run(Some(replies), shutdown_rx).await
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod router;
pub mod transport;
pub mod utils;

pub use crate::config::RouterConfig;
pub use crate::error::{ProtocolError, Result};
pub use crate::router::Router;
