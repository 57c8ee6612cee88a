//! Dockname - a reverse proxy that routes by Docker container labels
//!
//! This library provides a Host-header reverse proxy that:
//! - Discovers running containers labeled with `dockname.domain`
//! - Routes HTTP traffic for that hostname to the container's network address
//! - Follows container start/stop events to keep the route table current
//! - Reconnects to the event stream with backoff and resyncs periodically
//! - Uses connection pooling for efficient backend communication

pub mod config;
pub mod container;
pub mod discovery;
pub mod docker;
pub mod error;
pub mod events;
pub mod pool;
pub mod proxy;
pub mod registrar;
pub mod routes;
