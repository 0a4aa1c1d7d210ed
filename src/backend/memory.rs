//! An in-memory scheduling engine.
//!
//! All tubes and jobs live behind a single mutex. Jobs are owned by the
//! `jobs` registry; a tube's collections only hold sort keys pointing back
//! into it, so moving a job between states is one unlink and one link under
//! the same lock.
use std::collections::{BTreeSet, HashMap};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use tokio::select;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use super::{Backend, PutOutcome, ReservedJob, Tube};
use crate::error::{Error, Result};
use crate::types::job::Job;
use crate::types::states::JobState;

/// Handle on a tube of a [`MemoryBackend`].
#[derive(Clone, Debug)]
pub struct MemoryTube {
    name: Arc<str>,
    /// Woken whenever a job enters this tube's ready queue.
    ready_signal: Arc<Notify>,
}

impl Tube for MemoryTube {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&self) {
        trace!(tube = %self.name, "released tube handle");
    }
}

/// The per-tube collections. Every live job of the tube is in exactly one of
/// them, matching its `JobState`.
#[derive(Debug, Default)]
struct TubeQueues {
    /// Ordered by priority, then by id so equal priorities are served FIFO.
    ready: BTreeSet<(u32, u64)>,
    /// Ordered by the time each job becomes ready.
    delayed: BTreeSet<(Instant, u64)>,
    /// Ordered by the time each reservation expires.
    reserved: BTreeSet<(Instant, u64)>,
    buried: BTreeSet<u64>,
    ready_signal: Arc<Notify>,
}

impl TubeQueues {
    fn link(&mut self, job: &Job) {
        match job.state {
            JobState::Ready => self.ready.insert((job.pri, job.id)),
            JobState::Delayed { until } => self.delayed.insert((until, job.id)),
            JobState::Reserved { until } => {
                self.reserved.insert((until, job.id))
            },
            JobState::Buried => self.buried.insert(job.id),
        };
    }

    fn unlink(&mut self, job: &Job) {
        match job.state {
            JobState::Ready => self.ready.remove(&(job.pri, job.id)),
            JobState::Delayed { until } => {
                self.delayed.remove(&(until, job.id))
            },
            JobState::Reserved { until } => {
                self.reserved.remove(&(until, job.id))
            },
            JobState::Buried => self.buried.remove(&job.id),
        };
    }
}

#[derive(Debug, Default)]
struct State {
    tubes: HashMap<Arc<str>, TubeQueues>,
    jobs: HashMap<u64, Job>,
    last_id: u64,
}

impl State {
    fn resolve_tube(&mut self, name: &str) -> MemoryTube {
        if let Some((name, queues)) = self.tubes.get_key_value(name) {
            return MemoryTube {
                name: Arc::clone(name),
                ready_signal: Arc::clone(&queues.ready_signal),
            };
        }

        let name: Arc<str> = name.into();
        let queues = TubeQueues::default();
        let tube = MemoryTube {
            name: Arc::clone(&name),
            ready_signal: Arc::clone(&queues.ready_signal),
        };

        debug!(tube = %name, "created tube");
        self.tubes.insert(name, queues);

        tube
    }

    /// Fails with `NotFound` unless job `id` exists and `accept`s its state.
    fn expect_state(
        &self,
        id: u64,
        accept: fn(&JobState) -> bool,
    ) -> Result<()> {
        match self.jobs.get(&id) {
            Some(job) if accept(&job.state) => Ok(()),
            _ => Err(Error::NotFound),
        }
    }

    /// Moves job `id` between collections: unlinks it, lets `update` change
    /// its priority and state, then links it back in where the new state
    /// says. Waiters on the tube are woken if the job became ready.
    fn relink<F>(&mut self, id: u64, update: F) -> Result<&Job>
    where
        F: FnOnce(&mut Job),
    {
        let job = self.jobs.get_mut(&id).ok_or(Error::NotFound)?;
        let queues = self
            .tubes
            .get_mut(&job.tube)
            .ok_or_else(|| missing_tube(&job.tube))?;

        queues.unlink(job);
        update(job);
        queues.link(job);

        if job.state == JobState::Ready {
            queues.ready_signal.notify_waiters();
        }

        trace!(id, tube = %job.tube, state = %job.state, pri = job.pri, "moved job");

        Ok(job)
    }

    fn reserve_job(&mut self, id: u64) -> Result<ReservedJob> {
        let job = self.relink(id, |job| {
            job.state = JobState::Reserved {
                until: Instant::now() + job.ttr(),
            }
        })?;

        Ok(ReservedJob {
            id,
            data: job.data.clone(),
        })
    }

    /// Reserves from the first tube, in watch order, with a ready job.
    fn try_reserve(&mut self, tubes: &[MemoryTube]) -> Result<Option<ReservedJob>> {
        for tube in tubes {
            let next = self
                .tubes
                .get(&tube.name)
                .and_then(|queues| queues.ready.first())
                .map(|&(_, id)| id);

            if let Some(id) = next {
                return self.reserve_job(id).map(Some);
            }
        }

        Ok(None)
    }

    /// Promotes delayed jobs whose delay has passed, and expires reservations
    /// whose TTR has passed, to ready. Only the expired prefix of each ordered
    /// collection is visited. Returns the number of jobs moved.
    fn sweep(&mut self, now: Instant) -> usize {
        let State { tubes, jobs, .. } = self;
        let mut moved = 0;

        for (name, queues) in tubes.iter_mut() {
            let mut ready = Vec::new();

            while let Some(&(until, id)) = queues.delayed.first() {
                if until > now {
                    break;
                }
                queues.delayed.pop_first();
                ready.push(id);
            }

            while let Some(&(until, id)) = queues.reserved.first() {
                if until > now {
                    break;
                }
                queues.reserved.pop_first();
                debug!(id, tube = %name, "reservation timed out");
                ready.push(id);
            }

            if ready.is_empty() {
                continue;
            }

            for id in &ready {
                if let Some(job) = jobs.get_mut(id) {
                    job.state = JobState::Ready;
                    queues.ready.insert((job.pri, job.id));
                }
            }

            moved += ready.len();
            queues.ready_signal.notify_waiters();
        }

        moved
    }
}

fn missing_tube(name: &str) -> Error {
    Error::Internal(format!("job refers to unknown tube {name:?}"))
}

/// Stores everything in process memory. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Internal("engine lock poisoned".into()))
    }

    /// Runs one sweep pass immediately. Returns the number of jobs moved to
    /// the ready state.
    pub fn sweep(&self) -> Result<usize> {
        Ok(self.lock()?.sweep(Instant::now()))
    }

    /// Spawns the background task that sweeps every `interval` until `cancel`
    /// fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let backend = Arc::clone(self);

        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                select! {
                    _ = ticker.tick() => {},
                    _ = cancel.cancelled() => break,
                }

                match backend.sweep() {
                    Ok(0) => {},
                    Ok(moved) => trace!(moved, "sweep moved jobs to ready"),
                    Err(error) => {
                        error!(%error, "sweep failed, stopping sweeper");
                        break;
                    },
                }
            }

            debug!("sweeper stopped");
        })
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Tube = MemoryTube;

    fn resolve_tube(&self, name: &str) -> Result<MemoryTube> {
        Ok(self.lock()?.resolve_tube(name))
    }

    async fn put(
        &self,
        tube: &MemoryTube,
        pri: u32,
        delay: u32,
        ttr: u32,
        data: Bytes,
    ) -> Result<PutOutcome> {
        let mut state = self.lock()?;

        state.last_id += 1;
        let id = state.last_id;

        let job = Job {
            id,
            tube: Arc::clone(&tube.name),
            pri,
            data,
            state: match delay {
                0 => JobState::Ready,
                delay => JobState::Delayed {
                    until: Instant::now()
                        + Duration::from_secs(delay.into()),
                },
            },
            // A TTR of 0 would expire the moment the job is reserved.
            ttr: ttr.max(1),
        };

        let queues = state.tubes.entry(Arc::clone(&tube.name)).or_default();
        queues.link(&job);
        if job.state == JobState::Ready {
            queues.ready_signal.notify_waiters();
        }

        debug!(id, tube = %tube.name, pri, delay, ttr, bytes = job.data.len(), "put job");
        state.jobs.insert(id, job);

        Ok(PutOutcome::Inserted(id))
    }

    async fn reserve(
        &self,
        tubes: &[MemoryTube],
        timeout: Option<Duration>,
    ) -> Result<ReservedJob> {
        if tubes.is_empty() {
            return Err(Error::Internal("reserve without any tubes".into()));
        }

        // A deadline past the end of the clock's range is no deadline at all.
        let deadline =
            timeout.and_then(|timeout| Instant::now().checked_add(timeout));

        loop {
            // Register interest before looking, so a job that turns up
            // between the look and the wait still wakes us.
            let mut signals: Vec<Pin<Box<Notified<'_>>>> = tubes
                .iter()
                .map(|tube| Box::pin(tube.ready_signal.notified()))
                .collect();
            for signal in &mut signals {
                signal.as_mut().enable();
            }

            let reserved = self.lock()?.try_reserve(tubes)?;
            if let Some(job) = reserved {
                debug!(id = job.id, "reserved job");
                return Ok(job);
            }

            let woken = future::select_all(signals);
            match deadline {
                Some(deadline) => {
                    if time::timeout_at(deadline, woken).await.is_err() {
                        return Err(Error::ReserveTimeout);
                    }
                },
                None => {
                    woken.await;
                },
            }
        }
    }

    async fn reserve_by_id(&self, id: u64) -> Result<ReservedJob> {
        let mut state = self.lock()?;

        state.expect_state(id, |state| *state == JobState::Ready)?;
        let job = state.reserve_job(id)?;

        debug!(id, "reserved job by id");

        Ok(job)
    }

    async fn delete(&self, id: u64) -> Result<()> {
        let mut state = self.lock()?;

        let job = state.jobs.remove(&id).ok_or(Error::NotFound)?;
        state
            .tubes
            .get_mut(&job.tube)
            .ok_or_else(|| missing_tube(&job.tube))?
            .unlink(&job);

        debug!(id, tube = %job.tube, state = %job.state, "deleted job");

        Ok(())
    }

    async fn release(&self, id: u64, pri: u32, delay: u32) -> Result<()> {
        let mut state = self.lock()?;

        state.expect_state(id, |state| {
            matches!(state, JobState::Reserved { .. })
        })?;
        state.relink(id, |job| {
            job.pri = pri;
            job.state = match delay {
                0 => JobState::Ready,
                delay => JobState::Delayed {
                    until: Instant::now()
                        + Duration::from_secs(delay.into()),
                },
            };
        })?;

        debug!(id, pri, delay, "released job");

        Ok(())
    }

    async fn bury(&self, id: u64, pri: u32) -> Result<()> {
        let mut state = self.lock()?;

        state.expect_state(id, |state| {
            matches!(state, JobState::Reserved { .. })
        })?;
        state.relink(id, |job| {
            job.pri = pri;
            job.state = JobState::Buried;
        })?;

        debug!(id, pri, "buried job");

        Ok(())
    }

    async fn touch(&self, id: u64) -> Result<()> {
        let mut state = self.lock()?;

        state.expect_state(id, |state| {
            matches!(state, JobState::Reserved { .. })
        })?;
        state.relink(id, |job| {
            job.state = JobState::Reserved {
                until: Instant::now() + job.ttr(),
            };
        })?;

        debug!(id, "touched job");

        Ok(())
    }
}
