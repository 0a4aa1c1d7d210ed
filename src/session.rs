use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::trace;

use crate::backend::{Backend, PutOutcome, ReservedJob, Tube};
use crate::error::{Error, Result};

/// The tube every session starts out using and watching.
pub const DEFAULT_TUBE: &str = "default";

/// Per-connection protocol state: the tube `put` inserts into, and the
/// ordered, duplicate-free watch-list `reserve` takes jobs from.
///
/// Tube handles are released when they're dropped from the session, and all
/// remaining ones when the session itself is dropped.
#[derive(Debug)]
pub struct Session<B: Backend> {
    backend: Arc<B>,
    used: B::Tube,
    /// Never empty.
    watching: Vec<B::Tube>,
}

impl<B: Backend> Session<B> {
    pub fn new(backend: Arc<B>) -> Result<Self> {
        let used = backend.resolve_tube(DEFAULT_TUBE)?;
        let watching = vec![backend.resolve_tube(DEFAULT_TUBE)?];

        Ok(Self {
            backend,
            used,
            watching,
        })
    }

    pub fn used_tube(&self) -> &str {
        self.used.name()
    }

    pub fn watched_tubes(&self) -> impl Iterator<Item = &str> {
        self.watching.iter().map(|tube| tube.name())
    }

    /// Switches the tube `put` inserts into. Any name is accepted.
    pub fn use_tube(&mut self, name: &str) -> Result<String> {
        if self.used.name() != name {
            let tube = self.backend.resolve_tube(name)?;
            std::mem::replace(&mut self.used, tube).release();
        }

        trace!(tube = name, "using tube");

        Ok(name.to_owned())
    }

    pub async fn put(
        &self,
        pri: u32,
        delay: u32,
        ttr: u32,
        data: Bytes,
    ) -> Result<PutOutcome> {
        self.backend.put(&self.used, pri, delay, ttr, data).await
    }

    /// Adds `name` to the watch-list if it isn't already there, returning the
    /// number of tubes watched.
    pub fn watch(&mut self, name: &str) -> Result<usize> {
        if !self.watching.iter().any(|tube| tube.name() == name) {
            self.watching.push(self.backend.resolve_tube(name)?);
        }

        Ok(self.watching.len())
    }

    /// Removes `name` from the watch-list, returning the number of tubes still
    /// watched. A session watching a single tube can't ignore anything, even a
    /// tube it doesn't watch. Otherwise ignoring an unwatched tube does nothing.
    pub fn ignore(&mut self, name: &str) -> Result<usize> {
        if self.watching.len() == 1 {
            return Err(Error::NotIgnored);
        }

        let Some(idx) = self.watching.iter().position(|tube| tube.name() == name)
        else {
            return Ok(self.watching.len());
        };

        self.watching.remove(idx).release();

        Ok(self.watching.len())
    }

    /// Reserves a job from the watched tubes. A negative `timeout` (seconds)
    /// waits forever.
    pub async fn reserve(&self, timeout: i64) -> Result<ReservedJob> {
        let timeout = u64::try_from(timeout).ok().map(Duration::from_secs);

        self.backend.reserve(&self.watching, timeout).await
    }

    pub async fn reserve_by_id(&self, id: u64) -> Result<ReservedJob> {
        self.backend.reserve_by_id(id).await
    }

    pub async fn delete(&self, id: u64) -> Result<()> {
        self.backend.delete(id).await
    }

    pub async fn release(&self, id: u64, pri: u32, delay: u32) -> Result<()> {
        self.backend.release(id, pri, delay).await
    }

    pub async fn bury(&self, id: u64, pri: u32) -> Result<()> {
        self.backend.bury(id, pri).await
    }

    pub async fn touch(&self, id: u64) -> Result<()> {
        self.backend.touch(id).await
    }
}

impl<B: Backend> Drop for Session<B> {
    fn drop(&mut self) {
        self.used.release();
        for tube in &self.watching {
            tube.release();
        }
    }
}
