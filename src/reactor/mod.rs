// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Reactor Module Implementation
//!
//! A single-threaded event loop that multiplexes readiness for many raw
//! descriptors and hands each notification to the object that owns it.
//!
//! # Architecture
//!
//! - `EventLoop` wraps a `mio::Poll`; descriptors are registered through
//!   `SourceFd` and keyed by their raw fd, so registration is edge triggered.
//! - `Monitor` is implemented by anything that owns a descriptor: listening
//!   sockets, message connections, test doubles.
//! - Timers run on the loop thread between readiness batches.
//! - `LoopHandle` is the only piece that may cross threads; it stops the loop
//!   through a `mio::Waker`.
//!
//! # Failure isolation
//!
//! An error returned from `process_events` tears down only the object that
//! returned it. The object is deregistered and dropped, which closes its
//! descriptor; every other monitored object keeps running.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, trace, warn};

use crate::{AppError, AppResult};

pub use timer::{TimerCallback, TimerHandle, TimerSource};
use timer::TimerQueue;

mod timer;

const WAKER_TOKEN: Token = Token(usize::MAX);
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Readiness reported to a monitored object.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready(u8);

impl Ready {
    pub const READ_READY: Ready = Ready(1);
    pub const WRITE_READY: Ready = Ready(2);

    pub fn empty() -> Self {
        Ready(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Ready::READ_READY)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Ready::WRITE_READY)
    }

    pub fn contains(self, other: Ready) -> bool {
        self.0 & other.0 == other.0
    }

    /// Hang-up and error conditions are folded into both directions, so the
    /// owner sees the failure from its own read or write.
    fn from_event(event: &Event) -> Self {
        let mut ready = Ready::empty();
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            ready = ready | Ready::READ_READY;
        }
        if event.is_writable() || event.is_write_closed() || event.is_error() {
            ready = ready | Ready::WRITE_READY;
        }
        ready
    }
}

impl BitOr for Ready {
    type Output = Ready;

    fn bitor(self, rhs: Ready) -> Ready {
        Ready(self.0 | rhs.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => f.write_str("READ_READY | WRITE_READY"),
            (true, false) => f.write_str("READ_READY"),
            (false, true) => f.write_str("WRITE_READY"),
            (false, false) => f.write_str("(empty)"),
        }
    }
}

/// An object that owns a descriptor and reacts to its readiness.
pub trait Monitor {
    fn descriptor(&self) -> RawFd;

    fn interest(&self) -> Interest {
        Interest::READABLE | Interest::WRITABLE
    }

    /// Handles one readiness notification. Returning an error removes this
    /// object from the loop and drops it.
    fn process_events(&mut self, event_loop: &mut EventLoop, events: Ready) -> AppResult<()>;
}

/// Cross-thread control of an event loop.
#[derive(Clone)]
pub struct LoopHandle {
    stopped: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl LoopHandle {
    /// Asks the loop to return from `run_forever` and wakes it if it is polling.
    pub fn stop(&self) -> AppResult<()> {
        self.stopped.store(true, Ordering::Release);
        self.waker
            .wake()
            .map_err(|e| AppError::from_io("eventfd write", e))
    }
}

impl fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopHandle")
            .field("stopped", &self.stopped.load(Ordering::Acquire))
            .finish()
    }
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    monitors: HashMap<RawFd, Box<dyn Monitor>>,
    // descriptor whose monitor is currently out of the map for dispatch
    dispatching: Option<RawFd>,
    dispatch_released: bool,
    timers: TimerQueue,
    stopped: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("monitors", &self.monitors.len())
            .field("timers", &self.timers.len())
            .field("dispatching", &self.dispatching)
            .finish()
    }
}

impl EventLoop {
    pub fn new() -> AppResult<Self> {
        let poll = Poll::new().map_err(|e| AppError::from_io("epoll_create", e))?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)
            .map_err(|e| AppError::from_io("eventfd", e))?;
        Ok(EventLoop {
            poll,
            events: Events::with_capacity(DEFAULT_EVENT_CAPACITY),
            monitors: HashMap::new(),
            dispatching: None,
            dispatch_released: false,
            timers: TimerQueue::default(),
            stopped: Arc::new(AtomicBool::new(false)),
            waker: Arc::new(waker),
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            stopped: self.stopped.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Registers `monitor` for its interest and takes ownership of it.
    pub fn monitor(&mut self, monitor: Box<dyn Monitor>) -> AppResult<()> {
        let fd = monitor.descriptor();
        if fd < 0 {
            return Err(AppError::IllegalState(
                "cannot monitor an invalid descriptor".into(),
            ));
        }
        if self.monitors.contains_key(&fd) || self.dispatching == Some(fd) {
            return Err(AppError::IllegalState(format!(
                "descriptor {} is already monitored",
                fd
            )));
        }
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(fd as usize), monitor.interest())
            .map_err(|e| AppError::from_io("epoll_ctl", e))?;
        trace!(fd, "monitoring descriptor");
        self.monitors.insert(fd, monitor);
        Ok(())
    }

    /// Deregisters `fd` and gives the monitored object back.
    ///
    /// Called by an object on its own descriptor from inside `process_events`,
    /// this returns `None`; the object is dropped once its dispatch returns.
    pub fn stop_monitoring(&mut self, fd: RawFd) -> AppResult<Option<Box<dyn Monitor>>> {
        if self.dispatching == Some(fd) {
            if !self.dispatch_released {
                self.deregister(fd);
                self.dispatch_released = true;
            }
            return Ok(None);
        }
        match self.monitors.remove(&fd) {
            Some(monitor) => {
                self.deregister(fd);
                Ok(Some(monitor))
            }
            None => Err(AppError::IllegalState(format!(
                "descriptor {} is not monitored",
                fd
            ))),
        }
    }

    pub fn is_monitoring(&self, fd: RawFd) -> bool {
        self.monitors.contains_key(&fd) || (self.dispatching == Some(fd) && !self.dispatch_released)
    }

    pub fn monitored_count(&self) -> usize {
        let in_dispatch = usize::from(self.dispatching.is_some() && !self.dispatch_released);
        self.monitors.len() + in_dispatch
    }

    pub fn schedule_timer(&mut self, source: TimerSource) -> TimerHandle {
        self.timers.schedule(source)
    }

    /// Asks `run_forever` to return after the current iteration.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Polls once, waiting at most `timeout` (or until the next timer), then
    /// dispatches readiness and due timers. Returns how many were dispatched.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> AppResult<usize> {
        let timer_timeout = self.timers.next_timeout(Instant::now());
        let timeout = match (timeout, timer_timeout) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(0);
            }
            return Err(AppError::from_io("epoll_wait", err));
        }

        let ready: Vec<(Token, Ready)> = self
            .events
            .iter()
            .map(|event| (event.token(), Ready::from_event(event)))
            .collect();

        let mut dispatched = 0;
        for (token, events) in ready {
            if token == WAKER_TOKEN {
                trace!("event loop woken");
                continue;
            }
            if self.dispatch(token.0 as RawFd, events) {
                dispatched += 1;
            }
        }
        dispatched += self.run_due_timers();
        Ok(dispatched)
    }

    /// Runs until `stop` is called, either on this loop or through a `LoopHandle`.
    pub fn run_forever(&mut self) -> AppResult<()> {
        debug!("event loop started");
        while !self.is_stopped() {
            self.run_once(None)?;
        }
        self.stopped.store(false, Ordering::Release);
        debug!("event loop stopped");
        Ok(())
    }

    fn dispatch(&mut self, fd: RawFd, events: Ready) -> bool {
        // a monitor earlier in this batch may already have removed it
        let Some(mut monitor) = self.monitors.remove(&fd) else {
            return false;
        };
        self.dispatching = Some(fd);
        self.dispatch_released = false;

        let result = monitor.process_events(self, events);

        let released = self.dispatch_released;
        self.dispatching = None;
        self.dispatch_released = false;

        match result {
            Ok(()) if !released => {
                self.monitors.insert(fd, monitor);
            }
            Ok(()) => trace!(fd, "monitor released itself"),
            Err(err) => {
                if !released {
                    self.deregister(fd);
                }
                if err.is_disconnect() {
                    debug!(fd, "connection closed: {}", err);
                } else {
                    warn!(fd, "closing monitored descriptor after error: {}", err);
                }
            }
        }
        true
    }

    fn run_due_timers(&mut self) -> usize {
        let due = self.timers.take_due(Instant::now());
        let count = due.len();
        for mut timer in due {
            if let Err(err) = timer.run(self) {
                warn!("timer callback failed, timer cancelled: {}", err);
                continue;
            }
            if let Some(interval) = timer.source.interval {
                if !timer.cancelled.get() {
                    self.timers.insert(Instant::now() + interval, timer);
                }
            }
        }
        count
    }

    fn deregister(&mut self, fd: RawFd) {
        // a descriptor closed before deregistration is already gone from epoll
        if let Err(err) = self.poll.registry().deregister(&mut SourceFd(&fd)) {
            debug!(fd, "deregister failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    use super::*;

    struct Probe {
        stream: UnixStream,
        seen: Rc<RefCell<Vec<Ready>>>,
        fail: bool,
        release: bool,
    }

    impl Probe {
        fn new(stream: UnixStream, seen: Rc<RefCell<Vec<Ready>>>) -> Self {
            stream.set_nonblocking(true).expect("non-blocking");
            Probe {
                stream,
                seen,
                fail: false,
                release: false,
            }
        }
    }

    impl Monitor for Probe {
        fn descriptor(&self) -> RawFd {
            self.stream.as_raw_fd()
        }

        fn interest(&self) -> Interest {
            Interest::READABLE
        }

        fn process_events(&mut self, event_loop: &mut EventLoop, events: Ready) -> AppResult<()> {
            self.seen.borrow_mut().push(events);
            if self.release {
                assert!(event_loop.stop_monitoring(self.descriptor())?.is_none());
            }
            if self.fail {
                return Err(AppError::ConnectionShutdown("probe".into()));
            }
            Ok(())
        }
    }

    #[test]
    fn test_ready_mask() {
        let both = Ready::READ_READY | Ready::WRITE_READY;
        assert!(both.is_readable() && both.is_writable());
        assert!(!Ready::READ_READY.is_writable());
        assert!(Ready::empty().is_empty());
        assert_eq!(format!("{:?}", Ready::WRITE_READY), "WRITE_READY");
    }

    #[test]
    fn test_dispatches_readable_descriptor() -> AppResult<()> {
        let mut event_loop = EventLoop::new()?;
        let (local, mut remote) = UnixStream::pair()?;
        let seen = Rc::new(RefCell::new(Vec::new()));
        let fd = local.as_raw_fd();
        event_loop.monitor(Box::new(Probe::new(local, seen.clone())))?;
        assert!(event_loop.is_monitoring(fd));

        remote.write_all(b"ping")?;
        let dispatched = event_loop.run_once(Some(Duration::from_secs(1)))?;
        assert_eq!(dispatched, 1);
        assert!(seen.borrow()[0].is_readable());
        assert!(event_loop.is_monitoring(fd));
        Ok(())
    }

    #[test]
    fn test_failing_monitor_is_removed_alone() -> AppResult<()> {
        let mut event_loop = EventLoop::new()?;
        let (failing, mut failing_peer) = UnixStream::pair()?;
        let (healthy, _healthy_peer) = UnixStream::pair()?;
        let seen = Rc::new(RefCell::new(Vec::new()));
        let failing_fd = failing.as_raw_fd();
        let healthy_fd = healthy.as_raw_fd();

        let mut probe = Probe::new(failing, seen.clone());
        probe.fail = true;
        event_loop.monitor(Box::new(probe))?;
        event_loop.monitor(Box::new(Probe::new(healthy, seen.clone())))?;

        failing_peer.write_all(b"x")?;
        event_loop.run_once(Some(Duration::from_secs(1)))?;
        assert!(!event_loop.is_monitoring(failing_fd));
        assert!(event_loop.is_monitoring(healthy_fd));
        assert_eq!(event_loop.monitored_count(), 1);
        Ok(())
    }

    #[test]
    fn test_monitor_can_release_itself_during_dispatch() -> AppResult<()> {
        let mut event_loop = EventLoop::new()?;
        let (local, mut remote) = UnixStream::pair()?;
        let seen = Rc::new(RefCell::new(Vec::new()));
        let fd = local.as_raw_fd();
        let mut probe = Probe::new(local, seen.clone());
        probe.release = true;
        event_loop.monitor(Box::new(probe))?;

        remote.write_all(b"bye")?;
        event_loop.run_once(Some(Duration::from_secs(1)))?;
        assert!(!event_loop.is_monitoring(fd));
        assert_eq!(seen.borrow().len(), 1);
        Ok(())
    }

    #[test]
    fn test_stop_monitoring_returns_object() -> AppResult<()> {
        let mut event_loop = EventLoop::new()?;
        let (local, _remote) = UnixStream::pair()?;
        let fd = local.as_raw_fd();
        event_loop.monitor(Box::new(Probe::new(local, Rc::default())))?;
        assert!(event_loop.stop_monitoring(fd)?.is_some());
        assert!(event_loop.stop_monitoring(fd).is_err());
        Ok(())
    }

    #[test]
    fn test_timers_fire_and_repeat_until_cancelled() -> AppResult<()> {
        let mut event_loop = EventLoop::new()?;
        let fired = Rc::new(Cell::new(0));

        let counter = fired.clone();
        let handle = Rc::new(RefCell::new(None::<TimerHandle>));
        let own_handle = handle.clone();
        let timer = event_loop.schedule_timer(TimerSource::repeating(
            Duration::from_millis(1),
            move |event_loop| {
                counter.set(counter.get() + 1);
                if counter.get() == 3 {
                    if let Some(handle) = own_handle.borrow().as_ref() {
                        handle.cancel();
                    }
                    event_loop.stop();
                }
                Ok(())
            },
        ));
        *handle.borrow_mut() = Some(timer);

        event_loop.run_forever()?;
        assert_eq!(fired.get(), 3);
        assert!(!event_loop.is_stopped());
        assert_eq!(event_loop.run_once(Some(Duration::from_millis(5)))?, 0);
        Ok(())
    }

    #[test]
    fn test_handle_stops_loop_from_another_thread() -> AppResult<()> {
        let mut event_loop = EventLoop::new()?;
        let handle = event_loop.handle();
        let stopper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.stop()
        });
        event_loop.run_forever()?;
        stopper.join().expect("stopper thread")?;
        Ok(())
    }
}
