use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::error::{CacheError, Result};
use crate::types::{PartitionId, SequenceNumber};

/// Cooperative mutual-exclusion lock with a FIFO queue of suspended acquirers.
///
/// The lock is identified by holder id rather than by guard: a transaction
/// may release it while waiting on storage and reacquire it later under the
/// same id. Release hands the lock directly to the oldest waiter, so a later
/// arrival can never overtake a queued one.
pub struct FifoLock {
    owner: PartitionId,
    slow_wait: Duration,
    state: Mutex<LockState>,
}

#[derive(Default)]
struct LockState {
    holder: Option<SequenceNumber>,
    waiters: VecDeque<Waiter>,
    grants: u64,
    contended: u64,
}

struct Waiter {
    holder: SequenceNumber,
    wake: oneshot::Sender<()>,
}

/// Snapshot of lock state for observability.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    /// Current holder, if any.
    pub holder: Option<SequenceNumber>,
    /// Number of queued acquirers.
    pub waiters: usize,
    /// Total grants since creation.
    pub grants: u64,
    /// Grants that had to wait in the queue.
    pub contended: u64,
}

/// How an acquisition was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grant {
    /// The lock was free.
    Immediate,
    /// The acquirer waited in the queue.
    Queued,
}

impl FifoLock {
    /// Creates an unheld lock for `owner`. Waits longer than `slow_wait` are logged.
    pub fn new(owner: PartitionId, slow_wait: Duration) -> Self {
        Self {
            owner,
            slow_wait,
            state: Mutex::new(LockState::default()),
        }
    }

    /// Acquires the lock for `holder`, suspending until every earlier acquirer released it.
    ///
    /// Dropping the returned future while queued is safe: a grant that arrives
    /// after cancellation is passed on to the next waiter.
    pub async fn acquire(&self, holder: SequenceNumber) -> Result<Grant> {
        let rx = {
            let mut state = self.state.lock();
            match self.enqueue(&mut state, holder) {
                Some(rx) => rx,
                None => return Ok(Grant::Immediate),
            }
        };
        self.wait(holder, rx).await
    }

    /// Allocates a holder id with `allocate` and acquires the lock for it.
    ///
    /// Allocation and queueing happen under one guard, so fresh acquisitions
    /// are granted in allocation order.
    pub async fn acquire_next<F>(&self, allocate: F) -> Result<(SequenceNumber, Grant)>
    where
        F: FnOnce() -> SequenceNumber,
    {
        let (holder, rx) = {
            let mut state = self.state.lock();
            let holder = allocate();
            match self.enqueue(&mut state, holder) {
                Some(rx) => (holder, rx),
                None => return Ok((holder, Grant::Immediate)),
            }
        };
        let grant = self.wait(holder, rx).await?;
        Ok((holder, grant))
    }

    /// Takes the lock if it is free, otherwise queues `holder`.
    fn enqueue(
        &self,
        state: &mut LockState,
        holder: SequenceNumber,
    ) -> Option<oneshot::Receiver<()>> {
        if state.holder.is_none() {
            state.holder = Some(holder);
            state.grants += 1;
            trace!(partition = %self.owner, holder = %holder, "lock granted");
            return None;
        }
        let (wake, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { holder, wake });
        Some(rx)
    }

    async fn wait(&self, holder: SequenceNumber, rx: oneshot::Receiver<()>) -> Result<Grant> {
        let started = Instant::now();
        let mut pending = PendingGrant {
            lock: self,
            holder,
            rx,
            settled: false,
        };
        let outcome = (&mut pending.rx).await;
        pending.settled = true;
        outcome.map_err(|_| CacheError::LockAbandoned)?;

        let waited = started.elapsed();
        if waited >= self.slow_wait {
            warn!(
                partition = %self.owner,
                holder = %holder,
                waited_ms = waited.as_millis() as u64,
                "slow partition lock wait"
            );
        }
        Ok(Grant::Queued)
    }

    /// Releases the lock held by `holder` and wakes the next waiter, if any.
    ///
    /// The wake happens after the internal guard is dropped.
    pub fn release(&self, holder: SequenceNumber) -> Result<()> {
        let mut state = self.state.lock();
        if state.holder != Some(holder) {
            return Err(CacheError::NotLockHolder {
                partition: self.owner,
                holder,
            });
        }
        state.holder = None;
        loop {
            let Some(waiter) = state.waiters.pop_front() else {
                return Ok(());
            };
            state.holder = Some(waiter.holder);
            state.grants += 1;
            state.contended += 1;
            drop(state);
            if waiter.wake.send(()).is_ok() {
                trace!(partition = %self.owner, holder = %waiter.holder, "lock handed off");
                return Ok(());
            }
            // the waiter gave up before its grant arrived
            state = self.state.lock();
            state.holder = None;
        }
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<SequenceNumber> {
        self.state.lock().holder
    }

    /// Returns a snapshot of the current lock state.
    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.lock();
        LockSnapshot {
            holder: state.holder,
            waiters: state.waiters.len(),
            grants: state.grants,
            contended: state.contended,
        }
    }
}

struct PendingGrant<'a> {
    lock: &'a FifoLock,
    holder: SequenceNumber,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for PendingGrant<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.rx.close();
        if self.rx.try_recv().is_ok() {
            let _ = self.lock.release(self.holder);
        }
    }
}
