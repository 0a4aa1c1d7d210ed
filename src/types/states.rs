use std::fmt;

use tokio::time::Instant;

/// Where a job currently sits in its tube. Deleted jobs have no state: they
/// are dropped from the engine entirely.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum JobState {
    Ready,
    Delayed { until: Instant },
    Reserved { until: Instant },
    Buried,
}

// Used in log fields.
impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use JobState::*;

        f.write_str(match self {
            Ready => "ready",
            Delayed { until: _ } => "delayed",
            Reserved { until: _ } => "reserved",
            Buried => "buried",
        })
    }
}
