//! Live-data poller for OBD-II PIDs
//!
//! Queries a set of PIDs at their own rates on a shared `ObdClient` and
//! streams the decoded readings over a channel until told to stop.

mod scheduler;

pub use scheduler::{PidPoller, PollStats, PollTarget, PollerConfig};
