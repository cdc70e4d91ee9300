//! Single-threaded event loop.
//!
//! The `Reactor` multiplexes three event sources: readable sockets, timers,
//! and immediate (next-tick) events.  Every component of the runtime is
//! driven by exactly one reactor per process; no callback ever runs
//! concurrently with another callback on the same reactor.
//!
//! Dispatch order within one tick: first all queued immediate events, then
//! expired timers in non-decreasing fire-time order, then ready sockets.
//! Handlers may freely register and remove sockets and timers during
//! dispatch; mutations take effect no earlier than the next tick.  This is
//! achieved by dispatching over snapshots: the handler containers are taken
//! out of the shared state while their callbacks run, and additions land in
//! pending lists that are merged in at the top of the next tick.
//!
//! Errors returned by handlers are not swallowed; the first one aborts the
//! loop and propagates out of [`Reactor::run`].

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Callback invoked when a registered socket becomes readable.
pub type SocketHandler = Box<dyn FnMut(&Reactor, &zmq::Socket) -> Result<()>>;

/// Callback invoked when a timer fires.
pub type TimerHandler = Box<dyn FnMut(&Reactor, TimerId) -> Result<()>>;

type ImmediateHandler = Box<dyn FnOnce(&Reactor) -> Result<()>>;

/// Identifies a timer registration.
pub type TimerId = u64;

struct SocketEntry {
    socket: Rc<zmq::Socket>,
    handler: SocketHandler,
}

struct Timer {
    id: TimerId,
    next_fire: Instant,
    interval: Duration,
    /// Remaining fire count; any negative value means "fire forever".
    remaining: i64,
    handler: Option<TimerHandler>,
}

#[derive(Default)]
struct Inner {
    sockets: Vec<SocketEntry>,
    pending_sockets: Vec<SocketEntry>,
    removed_sockets: Vec<Rc<zmq::Socket>>,
    timers: Vec<Timer>,
    pending_timers: Vec<Timer>,
    removed_timers: Vec<TimerId>,
    immediates: VecDeque<ImmediateHandler>,
    next_timer_id: TimerId,
    /// The timer currently being dispatched, if any.  Such a timer is
    /// temporarily absent from `timers`, so removal and interval-restart
    /// requests for it must be intercepted here.
    active_timer: Option<TimerId>,
    restart_active: bool,
    running: bool,
}

/// A cheap, clonable handle to a single-threaded event loop.
///
/// All clones refer to the same loop.  The handle is deliberately not
/// `Send`: the reactor and everything registered with it belong to one
/// thread.
#[derive(Clone, Default)]
pub struct Reactor {
    inner: Rc<RefCell<Inner>>,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback invoked whenever `socket` is readable.
    ///
    /// Multiple handlers may be registered for the same socket; they are
    /// invoked in registration order on each ready event.  Registration
    /// takes effect at the next tick.
    pub fn add_socket<H>(&self, socket: Rc<zmq::Socket>, handler: H)
    where
        H: FnMut(&Reactor, &zmq::Socket) -> Result<()> + 'static,
    {
        self.inner.borrow_mut().pending_sockets.push(SocketEntry {
            socket,
            handler: Box::new(handler),
        });
    }

    /// Removes all handlers registered for `socket`.
    ///
    /// Safe to call from inside a handler for that socket; the removal is
    /// effective before the next dispatch cycle, and remaining handlers for
    /// the socket in the current cycle are skipped.
    pub fn remove_socket(&self, socket: &Rc<zmq::Socket>) {
        self.inner.borrow_mut().removed_sockets.push(Rc::clone(socket));
    }

    /// Registers a timer that fires every `interval`, `count` times in
    /// total.  A negative `count` means the timer fires until removed.
    ///
    /// Fails with [`Error::InvalidArgument`] if `count` is zero.
    pub fn add_timer<H>(&self, interval: Duration, count: i64, handler: H) -> Result<TimerId>
    where
        H: FnMut(&Reactor, TimerId) -> Result<()> + 'static,
    {
        if count == 0 {
            return Err(Error::InvalidArgument("invalid timer count".into()));
        }
        let mut inner = self.inner.borrow_mut();
        inner.next_timer_id += 1;
        let id = inner.next_timer_id;
        inner.pending_timers.push(Timer {
            id,
            next_fire: Instant::now() + interval,
            interval,
            remaining: count,
            handler: Some(Box::new(handler)),
        });
        Ok(id)
    }

    /// Resets the timer's next fire time to now + interval.
    pub fn restart_timer_interval(&self, id: TimerId) -> Result<()> {
        let mut inner_ref = self.inner.borrow_mut();
        let inner = &mut *inner_ref;
        let now = Instant::now();
        if inner.active_timer == Some(id) {
            inner.restart_active = true;
            return Ok(());
        }
        for t in inner.timers.iter_mut().chain(inner.pending_timers.iter_mut()) {
            if t.id == id {
                t.next_fire = now + t.interval;
                return Ok(());
            }
        }
        Err(Error::InvalidArgument(format!("invalid timer ID {id}")))
    }

    /// Cancels a timer.  Safe to call from the timer's own handler.
    pub fn remove_timer(&self, id: TimerId) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let known = inner.active_timer == Some(id)
            || inner.timers.iter().any(|t| t.id == id)
            || inner.pending_timers.iter().any(|t| t.id == id);
        if !known || inner.removed_timers.contains(&id) {
            return Err(Error::InvalidArgument(format!("invalid timer ID {id}")));
        }
        inner.removed_timers.push(id);
        Ok(())
    }

    /// Queues a one-shot callback that runs before the next poll, in FIFO
    /// order with other immediates from the same or an earlier tick.
    pub fn add_immediate_event<H>(&self, handler: H)
    where
        H: FnOnce(&Reactor) -> Result<()> + 'static,
    {
        self.inner.borrow_mut().immediates.push_back(Box::new(handler));
    }

    /// Runs the dispatch loop until [`Reactor::stop`] is called or no event
    /// sources remain.
    ///
    /// The loop auto-stops once the timer set and socket set are both empty;
    /// queued immediate events are drained first but do not keep the loop
    /// alive beyond their queue.  All timer intervals are restarted relative
    /// to the moment `run` is entered.
    pub fn run(&self) -> Result<()> {
        {
            let mut inner = self.inner.borrow_mut();
            inner.running = true;
            let now = Instant::now();
            for t in inner.timers.iter_mut() {
                t.next_fire = now + t.interval;
            }
            for t in inner.pending_timers.iter_mut() {
                t.next_fire = now + t.interval;
            }
        }
        let result = self.dispatch_loop();
        self.inner.borrow_mut().running = false;
        result
    }

    /// Requests the dispatch loop to exit after the current handler returns.
    pub fn stop(&self) {
        self.inner.borrow_mut().running = false;
    }

    fn running(&self) -> bool {
        self.inner.borrow().running
    }

    fn dispatch_loop(&self) -> Result<()> {
        loop {
            self.merge_registrations();
            {
                let inner = self.inner.borrow();
                if !inner.running {
                    return Ok(());
                }
                if inner.sockets.is_empty()
                    && inner.timers.is_empty()
                    && inner.immediates.is_empty()
                {
                    tracing::trace!("reactor has no remaining event sources, stopping");
                    return Ok(());
                }
            }

            // Phase 1: immediate events.  Snapshot the queue; immediates
            // registered by these handlers run next tick.
            let batch: Vec<ImmediateHandler> =
                self.inner.borrow_mut().immediates.drain(..).collect();
            for handler in batch {
                handler(self)?;
                if !self.running() {
                    return Ok(());
                }
            }

            // Phases 2 and 3: poll, then expired timers, then ready sockets.
            let timeout = self.poll_timeout();
            let mut sockets = std::mem::take(&mut self.inner.borrow_mut().sockets);
            let result = self.poll_and_dispatch(&mut sockets, timeout);
            {
                let mut inner = self.inner.borrow_mut();
                debug_assert!(inner.sockets.is_empty());
                inner.sockets = sockets;
            }
            result?;
        }
    }

    /// Milliseconds until the next timer fires; `Some(0)` if immediates are
    /// already queued for the next tick, `None` for "wait indefinitely".
    /// Pending timers count too; they may have been registered by an
    /// immediate event in this very tick.
    fn poll_timeout(&self) -> Option<i64> {
        let inner = self.inner.borrow();
        if !inner.immediates.is_empty() {
            return Some(0);
        }
        inner
            .timers
            .iter()
            .chain(inner.pending_timers.iter())
            .map(|t| t.next_fire)
            .min()
            .map(|next| next.saturating_duration_since(Instant::now()).as_millis() as i64)
    }

    fn poll_and_dispatch(&self, sockets: &mut [SocketEntry], timeout: Option<i64>) -> Result<()> {
        let ready = if sockets.is_empty() {
            match timeout {
                Some(ms) if ms > 0 => thread::sleep(Duration::from_millis(ms as u64)),
                _ => {}
            }
            Vec::new()
        } else {
            let mut items: Vec<zmq::PollItem> = sockets
                .iter()
                .map(|e| e.socket.as_poll_item(zmq::POLLIN))
                .collect();
            zmq::poll(&mut items, timeout.unwrap_or(-1))?;
            items.iter().map(|item| item.is_readable()).collect()
        };

        self.dispatch_timers()?;
        if !self.running() {
            return Ok(());
        }

        for (i, entry) in sockets.iter_mut().enumerate() {
            if !ready.get(i).copied().unwrap_or(false) {
                continue;
            }
            let removed = {
                let inner = self.inner.borrow();
                inner
                    .removed_sockets
                    .iter()
                    .any(|r| Rc::ptr_eq(r, &entry.socket))
            };
            if removed {
                continue;
            }
            (entry.handler)(self, &entry.socket)?;
            if !self.running() {
                return Ok(());
            }
        }
        Ok(())
    }

    fn dispatch_timers(&self) -> Result<()> {
        loop {
            if !self.running() {
                return Ok(());
            }
            let now = Instant::now();
            let idx = {
                let inner = self.inner.borrow();
                let mut best: Option<usize> = None;
                for (i, t) in inner.timers.iter().enumerate() {
                    if t.next_fire > now || inner.removed_timers.contains(&t.id) {
                        continue;
                    }
                    best = match best {
                        None => Some(i),
                        Some(b) => {
                            let cur = &inner.timers[b];
                            // Earliest fire time wins; ties go to the timer
                            // registered first (lower id).
                            if t.next_fire < cur.next_fire
                                || (t.next_fire == cur.next_fire && t.id < cur.id)
                            {
                                Some(i)
                            } else {
                                Some(b)
                            }
                        }
                    };
                }
                best
            };
            let Some(idx) = idx else {
                return Ok(());
            };

            // Take the timer out so its handler can mutate the timer set
            // without aliasing, then put it back afterwards (unless it was
            // removed or has no fires left), mirroring a scope guard.
            let mut timer = self.inner.borrow_mut().timers.remove(idx);
            let Some(mut handler) = timer.handler.take() else {
                continue;
            };
            {
                let mut inner = self.inner.borrow_mut();
                inner.active_timer = Some(timer.id);
                inner.restart_active = false;
            }
            let result = handler(self, timer.id);
            {
                let mut inner = self.inner.borrow_mut();
                inner.active_timer = None;
                let removed = match inner.removed_timers.iter().position(|&id| id == timer.id) {
                    Some(pos) => {
                        inner.removed_timers.remove(pos);
                        true
                    }
                    None => false,
                };
                if !removed {
                    if timer.remaining > 0 {
                        timer.remaining -= 1;
                    }
                    if timer.remaining != 0 {
                        timer.next_fire = if inner.restart_active {
                            Instant::now() + timer.interval
                        } else {
                            timer.next_fire + timer.interval
                        };
                        timer.handler = Some(handler);
                        inner.timers.push(timer);
                    }
                }
                inner.restart_active = false;
            }
            result?;
        }
    }

    /// Merges pending registrations and applies deferred removals.
    fn merge_registrations(&self) {
        let mut inner = self.inner.borrow_mut();
        let inner = &mut *inner;
        if !inner.pending_sockets.is_empty() {
            inner.sockets.append(&mut inner.pending_sockets);
        }
        if !inner.removed_sockets.is_empty() {
            let removed = std::mem::take(&mut inner.removed_sockets);
            inner
                .sockets
                .retain(|e| !removed.iter().any(|r| Rc::ptr_eq(r, &e.socket)));
        }
        if !inner.pending_timers.is_empty() {
            inner.timers.append(&mut inner.pending_timers);
        }
        if !inner.removed_timers.is_empty() {
            let removed = std::mem::take(&mut inner.removed_timers);
            inner.timers.retain(|t| !removed.contains(&t.id));
        }
    }
}
