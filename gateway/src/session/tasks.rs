//! Background work owned by one connection.
//!
//! Everything spawned here lives in a single [`JoinSet`], so dropping the
//! [`ConnectionTasks`] (or calling [`ConnectionTasks::abort_all`]) cancels
//! pending timers, tool calls and fallback requests together.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};

use super::InternalEvent;

/// A pending timer. Dropping the handle cancels it.
#[derive(Debug)]
pub struct TimerHandle {
    generation: u64,
    abort: AbortHandle,
}

impl TimerHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.abort.abort();
    }
}

/// Spawner bound to one connection's internal event channel.
#[derive(Debug)]
pub struct ConnectionTasks {
    set: JoinSet<()>,
    events: mpsc::Sender<InternalEvent>,
    next_generation: u64,
}

impl ConnectionTasks {
    pub fn new(events: mpsc::Sender<InternalEvent>) -> Self {
        Self {
            set: JoinSet::new(),
            events,
            next_generation: 0,
        }
    }

    /// Sender for posting completions back to the connection.
    pub fn events(&self) -> mpsc::Sender<InternalEvent> {
        self.events.clone()
    }

    /// Run `fut` in the background until it finishes or the connection ends.
    pub fn spawn<F>(&mut self, fut: F) -> AbortHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.reap();
        self.set.spawn(fut)
    }

    /// Post the event built by `make` after `delay`, unless cancelled first.
    ///
    /// The generation passed to `make` lets the receiver ignore a timer that
    /// fired after it was superseded.
    pub fn schedule<F>(&mut self, delay: Duration, make: F) -> TimerHandle
    where
        F: FnOnce(u64) -> InternalEvent,
    {
        self.next_generation += 1;
        let generation = self.next_generation;
        let event = make(generation);
        let events = self.events.clone();
        let abort = self.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event).await;
        });
        TimerHandle { generation, abort }
    }

    /// Number of tasks not yet reaped.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Abort every task and forget them. Safe to call repeatedly.
    pub fn abort_all(&mut self) {
        self.set.abort_all();
        self.set.detach_all();
    }

    fn reap(&mut self) {
        while self.set.try_join_next().is_some() {}
    }
}
