//! Prometheus metrics for the ingestion engine.

pub mod events;
