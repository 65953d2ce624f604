//! Centralized timing policy for the discovery engine.
//!
//! Keeping these values in one place makes it clear which parts of the
//! system share behaviour and gives us a single knob to turn if a limit
//! needs tightening.

use std::time::Duration;

/// How long past power-on discovery is still allowed to start.
pub const UPTIME_GATE: Duration = Duration::from_secs(60);

/// Worker sleep between queue checks when no devices are pending.
pub const WORKER_WAIT: Duration = Duration::from_secs(1);

/// Interval between checks for the published boot media.
pub const PUBLISH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Bound on boot-media polling before publication is abandoned.
pub const PUBLISH_POLL_ATTEMPTS: u32 = 120;
