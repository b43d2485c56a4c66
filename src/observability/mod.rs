//! # Observability
//!
//! Prometheus metrics for monitoring the control plane.

pub mod metrics;
