//! # Utility Modules
//!
//! Supporting pieces shared by the pipelines and the router.
//!
//! ## Components
//! - **Buffer Pool**: Fixed-size datagram buffers reused across receives
//! - **Logging**: `tracing-subscriber` setup driven by [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Metrics**: Atomic counters with snapshots and periodic log output
//! - **Time**: Unix timestamps for datagram headers

pub mod buffer_pool;
pub mod logging;
pub mod metrics;
pub mod time;

pub use buffer_pool::BufferPool;
pub use metrics::{global_metrics, global_metrics_handle, Metrics, MetricsSnapshot};
