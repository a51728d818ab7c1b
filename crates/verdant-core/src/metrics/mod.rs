//! Prometheus metrics for the verdant pipeline.
//!
//! Components describe what happened with [`events::InternalEvent`] structs
//! and emit them through [`emit!`](crate::emit); the recorder installed by
//! [`server::init_global`] turns them into Prometheus series.

pub mod events;
mod server;

pub use server::{DEFAULT_METRICS_ADDR, MetricsController, init_global, init_test};

/// Emit an internal event.
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
