//! The storage interface sessions dispatch to. [`memory::MemoryBackend`] is
//! the in-process implementation; any other store honouring the same method
//! contracts and [`Error`](crate::error::Error) kinds can replace it.
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

pub mod memory;

/// A handle on a named tube, as handed out by [`Backend::resolve_tube`].
pub trait Tube: Clone + fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Drops the holder's interest in the tube. Called once for every handle
    /// a session stops using.
    fn release(&self);
}

/// What happened to a job given to [`Backend::put`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PutOutcome {
    Inserted(u64),
    /// The backend couldn't schedule the job and buried it instead.
    Buried(u64),
}

/// A job handed to a client by one of the reserve operations.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReservedJob {
    pub id: u64,
    pub data: Bytes,
}

#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Tube: Tube;

    /// Returns a handle on the named tube, creating the tube if needed.
    /// Idempotent: the same name always refers to the same tube.
    fn resolve_tube(&self, name: &str) -> Result<Self::Tube>;

    /// Creates a job on `tube`. A non-zero `delay` (seconds) holds it back
    /// from reservation until it elapses.
    async fn put(
        &self,
        tube: &Self::Tube,
        pri: u32,
        delay: u32,
        ttr: u32,
        data: Bytes,
    ) -> Result<PutOutcome>;

    /// Reserves the most urgent ready job from the first of `tubes` that has
    /// one, waiting up to `timeout` (forever if `None`) for one to appear.
    /// Fails with `ReserveTimeout` once the timeout elapses.
    async fn reserve(
        &self,
        tubes: &[Self::Tube],
        timeout: Option<Duration>,
    ) -> Result<ReservedJob>;

    /// Reserves a specific job, which must be ready.
    async fn reserve_by_id(&self, id: u64) -> Result<ReservedJob>;

    /// Removes a job in any state.
    async fn delete(&self, id: u64) -> Result<()>;

    /// Returns a reserved job to the ready queue, or to the delayed queue if
    /// `delay` is non-zero, with a new priority.
    async fn release(&self, id: u64, pri: u32, delay: u32) -> Result<()>;

    /// Moves a reserved job out of scheduling with a new priority.
    async fn bury(&self, id: u64, pri: u32) -> Result<()>;

    /// Restarts the TTR countdown of a reserved job.
    async fn touch(&self, id: u64) -> Result<()>;
}
