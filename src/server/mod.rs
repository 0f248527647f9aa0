//! Listeners.
//!
//! An [`EnvironmentServer`] accepts connections for one environment; the
//! [`ServerGroup`] runs all of them at once and supervises each one.

pub mod group;
pub mod listener;

pub use group::{EnvironmentExit, RestartableListener, ServerGroup, Service, Supervision, supervise};
pub use listener::EnvironmentServer;
