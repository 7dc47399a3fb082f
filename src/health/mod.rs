//! Store connectivity tracking
//!
//! `ConnectionHealthMonitor` owns the process-local view of whether the shared
//! store is reachable; `RetryPolicy` turns consecutive failures into backoff
//! delays for the probe task and the poll loop.

pub mod backoff;
pub mod monitor;

pub use backoff::RetryPolicy;
pub use monitor::{ConnectionHealthMonitor, ConnectionListener, ListenerId, HEALTH_COLLECTION};
