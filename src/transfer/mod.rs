//! Chunked transfers over lossy datagrams
//!
//! Catalog listings, torrent descriptors and file contents are all moved the
//! same way: the resource is cut into numbered units, the receiver requests
//! units, buffers whatever arrives and, once per reaper tick, drains the
//! buffer. A job that sees nothing for `max_idle_periods` ticks asks again;
//! one that sees nothing for twice that long gives up.
//!
//! ```text
//! Idle -> Requesting <-> Receiving -> Done | Abandoned
//! ```
//!
//! [`UnitTracker`] holds the per-job bookkeeping, [`JobTable`] the live jobs
//! of one kind, and [`run_reaper`] drives a table tick by tick.

pub mod catalog_sync;
pub mod descriptor_fetch;
pub mod download;
pub mod upload;

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use bitvec::prelude::*;
use bytes::Bytes;

use crate::context::SwarmContext;

/// Lifecycle of a transfer job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    /// Created, nothing requested yet
    Idle,
    /// Requests out, waiting for units
    Requesting,
    /// Units arrived during the last tick
    Receiving,
    /// Every unit acquired and the completion action ran
    Done,
    /// Gave up; partial state discarded
    Abandoned,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Abandoned)
    }
}

/// What a job should do at the end of a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleVerdict {
    /// Something arrived this tick
    Active,
    /// Quiet, but not for long
    Wait,
    /// Quiet long enough to ask again
    Rerequest,
    /// Quiet for too long
    Abandon,
}

/// Number of `unit_size` chunks needed for `len` bytes (at least one)
pub fn chunk_count(len: usize, unit_size: usize) -> u32 {
    len.div_ceil(unit_size).max(1) as u32
}

/// Chunk `index` of `data`
pub fn chunk(data: &Bytes, index: u32, unit_size: usize) -> Option<Bytes> {
    let start = index as usize * unit_size;
    if start >= data.len() && !(start == 0 && data.is_empty()) {
        return None;
    }
    let end = (start + unit_size).min(data.len());
    Some(data.slice(start..end))
}

/// Per-job unit bookkeeping: acquired bitmap, reorder buffer and idle count.
#[derive(Debug)]
pub struct UnitTracker {
    acquired: BitVec<u8, Msb0>,
    inbox: BTreeMap<u32, Bytes>,
    idle_periods: u32,
    recently_updated: bool,
    max_idle_periods: u32,
}

impl UnitTracker {
    pub fn new(total: u32, max_idle_periods: u32) -> Self {
        Self {
            acquired: bitvec![u8, Msb0; 0; total as usize],
            inbox: BTreeMap::new(),
            idle_periods: 0,
            recently_updated: false,
            max_idle_periods,
        }
    }

    pub fn total(&self) -> u32 {
        self.acquired.len() as u32
    }

    /// Start over with a different unit count
    pub fn reset(&mut self, total: u32) {
        self.acquired = bitvec![u8, Msb0; 0; total as usize];
        self.inbox.clear();
        self.idle_periods = 0;
        self.recently_updated = false;
    }

    /// Buffer an arriving unit. Units out of range or already acquired are
    /// dropped; the buffer therefore never exceeds the unit count.
    pub fn offer(&mut self, index: u32, data: Bytes) -> bool {
        if index >= self.total() || self.acquired[index as usize] {
            return false;
        }
        self.inbox.insert(index, data);
        true
    }

    /// Take every buffered unit, lowest index first
    pub fn take_pending(&mut self) -> Vec<(u32, Bytes)> {
        std::mem::take(&mut self.inbox).into_iter().collect()
    }

    /// Record a unit as stored. Returns false if it already was.
    pub fn mark_acquired(&mut self, index: u32) -> bool {
        if index >= self.total() || self.acquired[index as usize] {
            return false;
        }
        self.acquired.set(index as usize, true);
        self.recently_updated = true;
        true
    }

    pub fn is_acquired(&self, index: u32) -> bool {
        self.acquired.get(index as usize).map_or(false, |bit| *bit)
    }

    pub fn have_all(&self) -> bool {
        self.acquired.all()
    }

    pub fn acquired_count(&self) -> u32 {
        self.acquired.count_ones() as u32
    }

    /// Indices not yet acquired, ascending
    pub fn missing(&self) -> impl Iterator<Item = u32> + '_ {
        self.acquired.iter_zeros().map(|i| i as u32)
    }

    pub fn first_missing(&self) -> Option<u32> {
        self.acquired.first_zero().map(|i| i as u32)
    }

    pub fn idle_periods(&self) -> u32 {
        self.idle_periods
    }

    /// Close the tick and classify how long the job has been quiet.
    pub fn end_tick(&mut self) -> IdleVerdict {
        if self.recently_updated {
            self.recently_updated = false;
            self.idle_periods = 0;
            return IdleVerdict::Active;
        }

        self.idle_periods += 1;
        if self.idle_periods >= 2 * self.max_idle_periods {
            IdleVerdict::Abandon
        } else if self.idle_periods >= self.max_idle_periods {
            IdleVerdict::Rerequest
        } else {
            IdleVerdict::Wait
        }
    }
}

/// One transfer, ticked by a reaper
#[async_trait]
pub trait Job: Send {
    /// Drain buffered units and act on the idle verdict
    async fn tick(&mut self, ctx: &Arc<SwarmContext>) -> TransferState;
}

pub type SharedJob<J> = Arc<tokio::sync::Mutex<J>>;

/// Live jobs of one kind, at most one per key
pub struct JobTable<K, J> {
    jobs: parking_lot::Mutex<HashMap<K, SharedJob<J>>>,
}

impl<K, J> Default for JobTable<K, J> {
    fn default() -> Self {
        Self {
            jobs: parking_lot::Mutex::new(HashMap::new()),
        }
    }
}

impl<K, J> JobTable<K, J>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &K) -> Option<SharedJob<J>> {
        self.jobs.lock().get(key).cloned()
    }

    /// The job for `key`, creating it if absent. The flag tells whether it
    /// was created by this call.
    pub fn get_or_insert_with(&self, key: K, create: impl FnOnce() -> J) -> (SharedJob<J>, bool) {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get(&key) {
            return (job.clone(), false);
        }
        let job = Arc::new(tokio::sync::Mutex::new(create()));
        jobs.insert(key, job.clone());
        (job, true)
    }

    pub fn remove(&self, key: &K) -> Option<SharedJob<J>> {
        self.jobs.lock().remove(key)
    }

    /// Remove `key` only if it still maps to `job`
    pub fn remove_if_same(&self, key: &K, job: &SharedJob<J>) -> bool {
        let mut jobs = self.jobs.lock();
        match jobs.get(key) {
            Some(current) if Arc::ptr_eq(current, job) => {
                jobs.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.jobs.lock().contains_key(key)
    }

    pub fn keys(&self) -> Vec<K> {
        self.jobs.lock().keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<(K, SharedJob<J>)> {
        self.jobs
            .lock()
            .iter()
            .map(|(k, j)| (k.clone(), j.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

/// Tick every job of `table` once and retire finished ones.
///
/// Returns the keys and final states of the jobs retired this round.
pub async fn tick_once<K, J>(
    ctx: &Arc<SwarmContext>,
    table: &JobTable<K, J>,
) -> Vec<(K, TransferState)>
where
    K: Eq + Hash + Clone + Send,
    J: Job,
{
    let mut retired = Vec::new();
    for (key, job) in table.snapshot() {
        let state = job.lock().await.tick(ctx).await;
        if state.is_terminal() && table.remove_if_same(&key, &job) {
            retired.push((key, state));
        }
    }
    retired
}

/// Drive one job table every `tick_interval` until shutdown.
pub async fn run_reaper<K, J>(
    ctx: Arc<SwarmContext>,
    name: &'static str,
    table: fn(&SwarmContext) -> &JobTable<K, J>,
) where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    J: Job + 'static,
{
    let mut ticker = tokio::time::interval(ctx.config.tick_interval_duration());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let retired = tick_once(&ctx, table(&ctx)).await;
        if !retired.is_empty() {
            tracing::debug!("{} reaper retired {} jobs", name, retired.len());
        }
    }

    tracing::debug!("{} reaper stopped", name);
}
