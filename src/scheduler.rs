// SPDX-License-Identifier: MPL-2.0

//! Timers for the control thread.
//!
//! Every delayed action of the session (debounced recreation, stall grace
//! windows, the periodic health check) is a [`Job`] armed on a [`Scheduler`].
//! Jobs fire on the same thread that owns the session, so handlers mutate
//! session state without locks.

use std::{collections::HashMap, time::Duration};

use calloop::{
    LoopHandle, RegistrationToken,
    timer::{TimeoutAction, Timer},
};

use crate::surface::SurfaceId;

/// Identifies one armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Work executed when a timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Job {
    /// Rebuild every surface once the output topology settled.
    Recreate,
    /// A stalled engine did not recover within the grace window.
    StallGrace(SurfaceId),
    /// Periodic frozen playback check.
    HealthCheck,
}

pub trait Scheduler {
    /// Arm `job` to run once after `delay`.
    fn arm(&mut self, delay: Duration, job: Job) -> TimerId;

    /// Cancel an armed timer. Cancelling a fired or unknown timer is a no-op.
    fn cancel(&mut self, timer: TimerId);

    /// Called when `timer` fired so its bookkeeping can be released.
    fn fired(&mut self, timer: TimerId);
}

/// A single-slot timer handle: arming always cancels the previous timer.
#[derive(Debug, Default)]
pub struct TimerSlot(Option<TimerId>);

impl TimerSlot {
    pub fn arm(&mut self, scheduler: &mut impl Scheduler, delay: Duration, job: Job) -> TimerId {
        self.cancel(scheduler);
        let timer = scheduler.arm(delay, job);
        self.0 = Some(timer);
        timer
    }

    pub fn cancel(&mut self, scheduler: &mut impl Scheduler) {
        if let Some(timer) = self.0.take() {
            scheduler.cancel(timer);
        }
    }

    /// Clears the slot if `timer` is the one it holds.
    ///
    /// Returns `false` for a timer that was superseded before it fired.
    pub fn take_if(&mut self, timer: TimerId) -> bool {
        if self.0 == Some(timer) {
            self.0 = None;
            true
        } else {
            false
        }
    }
}

/// [`Scheduler`] backed by calloop timers on the main event loop.
pub struct CalloopScheduler<D: 'static> {
    handle: LoopHandle<'static, D>,
    tokens: HashMap<TimerId, RegistrationToken>,
    next_id: u64,
    on_fire: fn(&mut D, TimerId, Job),
}

impl<D: 'static> CalloopScheduler<D> {
    pub fn new(handle: LoopHandle<'static, D>, on_fire: fn(&mut D, TimerId, Job)) -> Self {
        Self {
            handle,
            tokens: HashMap::new(),
            next_id: 0,
            on_fire,
        }
    }
}

impl<D: 'static> Scheduler for CalloopScheduler<D> {
    fn arm(&mut self, delay: Duration, job: Job) -> TimerId {
        self.next_id += 1;
        let timer = TimerId(self.next_id);
        let on_fire = self.on_fire;

        let inserted = self.handle.insert_source(
            Timer::from_duration(delay),
            move |_, _, state: &mut D| {
                let span = tracing::debug_span!("Scheduler::timer", ?job);
                let _handle = span.enter();
                on_fire(state, timer, job);
                TimeoutAction::Drop
            },
        );

        match inserted {
            Ok(token) => {
                self.tokens.insert(timer, token);
            }
            Err(why) => {
                tracing::error!(?job, %why, "failed to arm timer");
            }
        }

        timer
    }

    fn cancel(&mut self, timer: TimerId) {
        if let Some(token) = self.tokens.remove(&timer) {
            self.handle.remove(token);
        }
    }

    fn fired(&mut self, timer: TimerId) {
        self.tokens.remove(&timer);
    }
}

impl<D: 'static> Drop for CalloopScheduler<D> {
    fn drop(&mut self) {
        for (_, token) in self.tokens.drain() {
            self.handle.remove(token);
        }
    }
}
