use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use super::states::JobState;

#[derive(Debug)]
pub(crate) struct Job {
    pub(crate) id: u64,
    pub(crate) tube: Arc<str>,
    pub(crate) pri: u32,
    pub(crate) data: Bytes,
    pub(crate) state: JobState, // also contains state-specific data
    pub(crate) ttr: u32,
}

impl Job {
    /// How long a reservation of this job may stay outstanding.
    pub(crate) fn ttr(&self) -> Duration {
        Duration::from_secs(self.ttr.into())
    }
}
