//! HTTP boundary of the relay: the ingest facade, the application root that
//! wires queue, dispatchers, DLO, health monitor, and CTO-Agent together,
//! and the background maintenance timers.

pub mod app;
pub mod server;

pub use app::RelayApp;
pub use server::{router, serve};
