//! Process supervisor contract
//!
//! The switcher never spawns backends itself. It asks an external supervisor to start, stop and
//! report on named units; [`ProcessSupervisor`] is that seam.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors from supervisor calls
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The supervisor ran but rejected the action
    #[error("{action} of unit '{unit}' failed: {reason}")]
    CommandFailed {
        action: &'static str,
        unit: String,
        reason: String,
    },

    /// The supervisor could not be invoked at all
    #[error("could not run supervisor for {action} of '{unit}': {source}")]
    Spawn {
        action: &'static str,
        unit: String,
        #[source]
        source: std::io::Error,
    },

    /// The call did not return within its bound
    #[error("{action} of unit '{unit}' timed out after {after:?}")]
    Timeout {
        action: &'static str,
        unit: String,
        after: Duration,
    },
}

/// Start, stop and query named backend units.
///
/// # Implementation Notes
///
/// - Calls are made one at a time by the switcher, always under its switch lock
/// - The switcher bounds every call with its own timeout and drops the future on expiry, so
///   implementations must release any child process when dropped
/// - `stop` of a unit that is already stopped should succeed
#[async_trait]
pub trait ProcessSupervisor: Send + Sync + std::fmt::Debug {
    /// Start the unit. Returning does not imply the backend is ready to serve.
    async fn start(&self, unit: &str) -> Result<(), SupervisorError>;

    /// Stop the unit and release whatever it holds.
    async fn stop(&self, unit: &str) -> Result<(), SupervisorError>;

    /// Whether the supervisor currently reports the unit as running.
    async fn is_active(&self, unit: &str) -> Result<bool, SupervisorError>;
}
