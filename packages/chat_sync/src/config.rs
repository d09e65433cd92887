use std::time::Duration;

/// Largest attachment accepted by the composer (5 MiB, inclusive).
pub const MAX_ATTACHMENT_BYTES: usize = 5 * 1024 * 1024;

/// Runtime tunables for the sync core.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    /// Quiet period after the last keystroke before "stop typing" is sent
    pub typing_inactivity: Duration,
    /// Upper bound on how long a remote typer is shown without a "stop"
    pub remote_typing_ceiling: Duration,
    pub max_attachment_bytes: usize,
    /// Capacity of the command queue between handles and the sync task
    pub command_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            typing_inactivity: Duration::from_secs(3),
            remote_typing_ceiling: Duration::from_secs(10),
            max_attachment_bytes: MAX_ATTACHMENT_BYTES,
            command_capacity: 64,
        }
    }
}
