//! Hutao Instance -- single-instance activation redirection.
//!
//! The first process to bind the well-known endpoint becomes the primary
//! instance and listens for redirected activations. Later launches connect,
//! compare elevation, and either forward their activation and exit, or (when
//! they are elevated and the primary is not) tell the primary to exit and
//! take its place.

pub mod client;
pub mod config;
pub mod elevation;
pub mod server;
pub mod startup;
pub mod transport;

pub use client::{PipeClient, RedirectOutcome};
pub use config::{InstanceConfig, Timeouts};
pub use server::{InstanceHost, ListenerExit, PipeServer, ServerHandle, SessionEnd};
pub use startup::{SingleInstance, Startup, StartupDecision};
pub use transport::{try_connect_once, Channel, PipeListener, SessionSource};

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
