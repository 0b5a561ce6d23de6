//! # Transport Layer
//!
//! Socket and session bookkeeping around the protocol pipelines.
//!
//! ## Components
//! - **UDP**: The shared listening socket plus shutdown wiring
//! - **Session Table**: Address-keyed sessions with idle and capacity eviction

pub mod session_table;
pub mod udp;

pub use session_table::{SessionTable, SessionTableStats, SharedSession};
pub use udp::{shutdown_channel, UdpEndpoint};
