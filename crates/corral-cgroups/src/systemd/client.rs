//! Interface to the systemd service manager.
//!
//! The D-Bus transport is provided by the embedding application. The manager only needs the
//! handful of calls below. See https://www.freedesktop.org/wiki/Software/systemd/dbus/
use crate::config::SystemdProperty;

#[derive(thiserror::Error, Debug)]
pub enum SystemdClientError {
    #[error("failed to start transient unit {unit_name}: {reason}")]
    StartUnit { unit_name: String, reason: String },
    #[error("failed to stop transient unit {unit_name}: {reason}")]
    StopUnit { unit_name: String, reason: String },
}

pub trait SystemdClient: Send + Sync {
    /// Whether this client talks to the system instance rather than a user session
    fn is_system(&self) -> bool;

    /// Starts a transient unit containing `pid`. Implementations are expected to always enable
    /// CPU, IO, memory and tasks accounting and to add `properties` verbatim.
    fn start_transient_unit(
        &self,
        container_name: &str,
        pid: u32,
        parent: &str,
        unit_name: &str,
        properties: &[SystemdProperty],
    ) -> Result<(), SystemdClientError>;

    fn stop_transient_unit(&self, unit_name: &str) -> Result<(), SystemdClientError>;
}
