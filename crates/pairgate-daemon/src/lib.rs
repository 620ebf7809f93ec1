//! pairgate-daemon: local pairing approval daemon
//!
//! Serves the polling endpoints a desktop UI uses to list pending pairing
//! requests and to approve or dismiss them.

pub mod api;
pub mod config;
pub mod server;

pub use config::DaemonConfig;
pub use server::{build_app, PairingDaemon};
