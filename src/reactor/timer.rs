use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use super::EventLoop;
use crate::AppResult;

pub type TimerCallback = Box<dyn FnMut(&mut EventLoop) -> AppResult<()>>;

/// Something the loop should run after `delay`, and then every `interval` if set.
pub struct TimerSource {
    pub delay: Duration,
    pub interval: Option<Duration>,
    callback: TimerCallback,
}

impl TimerSource {
    pub fn once<F>(delay: Duration, callback: F) -> Self
    where
        F: FnMut(&mut EventLoop) -> AppResult<()> + 'static,
    {
        TimerSource {
            delay,
            interval: None,
            callback: Box::new(callback),
        }
    }

    pub fn repeating<F>(interval: Duration, callback: F) -> Self
    where
        F: FnMut(&mut EventLoop) -> AppResult<()> + 'static,
    {
        TimerSource {
            delay: interval,
            interval: Some(interval),
            callback: Box::new(callback),
        }
    }
}

impl fmt::Debug for TimerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerSource")
            .field("delay", &self.delay)
            .field("interval", &self.interval)
            .finish()
    }
}

/// Cancels a scheduled timer. Dropping the handle does not cancel.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Rc<Cell<bool>>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }
}

pub(super) struct ScheduledTimer {
    pub(super) source: TimerSource,
    pub(super) cancelled: Rc<Cell<bool>>,
}

impl ScheduledTimer {
    pub(super) fn run(&mut self, event_loop: &mut EventLoop) -> AppResult<()> {
        (self.source.callback)(event_loop)
    }
}

/// Deadline-ordered timers; the sequence number keeps equal deadlines in
/// scheduling order.
#[derive(Default)]
pub(super) struct TimerQueue {
    timers: BTreeMap<(Instant, u64), ScheduledTimer>,
    sequence: u64,
}

impl TimerQueue {
    pub(super) fn schedule(&mut self, source: TimerSource) -> TimerHandle {
        let cancelled = Rc::new(Cell::new(false));
        let deadline = Instant::now() + source.delay;
        self.insert(
            deadline,
            ScheduledTimer {
                source,
                cancelled: cancelled.clone(),
            },
        );
        TimerHandle { cancelled }
    }

    pub(super) fn insert(&mut self, deadline: Instant, timer: ScheduledTimer) {
        self.sequence += 1;
        self.timers.insert((deadline, self.sequence), timer);
    }

    /// Time until the earliest live deadline; cancelled timers are dropped here.
    pub(super) fn next_timeout(&mut self, now: Instant) -> Option<Duration> {
        while let Some(entry) = self.timers.first_entry() {
            if entry.get().cancelled.get() {
                entry.remove();
                continue;
            }
            return Some(entry.key().0.saturating_duration_since(now));
        }
        None
    }

    /// Removes and returns every live timer whose deadline has passed.
    pub(super) fn take_due(&mut self, now: Instant) -> Vec<ScheduledTimer> {
        let mut due = Vec::new();
        while let Some(entry) = self.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let timer = entry.remove();
            if !timer.cancelled.get() {
                due.push(timer);
            }
        }
        due
    }

    pub(super) fn len(&self) -> usize {
        self.timers.len()
    }
}
