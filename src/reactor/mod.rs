//! Single-threaded, `mio`-backed event loop: readiness dispatch, a
//! posted-callback queue, and the timer wheel that drives idle-eviction and
//! connect-timeout scheduling.
//!
//! The loop itself is owned by one thread and run with `&mut self`; the only
//! two operations safe to call from other threads are [`Reactor::handle`]'s
//! [`Handle::post`] and [`Handle::stop`], both of which only touch data
//! behind an `Arc` and a never-poisoning [`crate::sync::Mutex`].

pub mod timer;

use std::cell::RefCell;
use std::io;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

use crate::error::{Error, Kind, Result};
use crate::hash::HashMap;
use timer::{TimerId, TimerWheel};

/// Default descriptor table capacity, matching the original reactor's
/// fixed-size fd table.
pub const DEFAULT_MAX_DESCRIPTORS: usize = 65536;

/// A registered descriptor's identity, handed back by [`Reactor::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Descriptor(usize);

impl Descriptor {
    fn token(self) -> Token {
        Token(self.0)
    }
}

macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $repr:ty {
            $(const $variant:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($repr);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            /// An empty mask.
            pub const NONE: $name = $name(0);

            /// True if every bit set in `other` is also set in `self`.
            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                self.0 |= rhs.0;
            }
        }
    };
}

bitflags_like! {
    /// Readiness interests a handler can be registered for.
    pub struct EventMask: u8 {
        const READABLE = 0b0001;
        const WRITABLE = 0b0010;
        const DISCONNECT = 0b0100;
        const PRIORITIZED = 0b1000;
    }
}

/// Events a [`Handler`] can react to. Implementors are owned elsewhere
/// (typically by a [`crate::pool::host::HostPool`]); the reactor only ever
/// holds a [`Weak`] reference, never keeping a handler alive past its
/// owner's lifetime.
pub trait Handler {
    /// The descriptor became readable.
    fn on_readable(&mut self);
    /// The descriptor became writable.
    fn on_writable(&mut self);
    /// An error was observed on the descriptor; it has already been removed
    /// from the reactor.
    fn on_error(&mut self, err: io::Error);
    /// The peer closed its end, or the reactor is discarding a handler whose
    /// `Weak` reference no longer upgrades.
    fn on_close(&mut self);
}

/// Shared, thread-safe handle to a running reactor. Cloning is cheap; every
/// clone refers to the same underlying loop.
#[derive(Clone)]
pub struct Handle(Arc<Shared>);

struct Shared {
    running: AtomicBool,
    waker: mio::Waker,
    posted: crate::sync::Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Handle {
    /// Schedules `callback` to run on the reactor's own thread during its
    /// next loop turn, then wakes the loop if it is currently blocked in
    /// `poll`.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) {
        self.0.posted.lock().push(Box::new(callback));
        let _ = self.0.waker.wake();
    }

    /// Requests the loop stop at the end of its current turn. Safe to call
    /// from any thread, including the loop's own.
    pub fn stop(&self) {
        self.0.running.store(false, Ordering::Release);
        let _ = self.0.waker.wake();
    }

    /// True if the loop has not yet been asked to stop.
    pub fn is_running(&self) -> bool {
        self.0.running.load(Ordering::Acquire)
    }
}

struct Registration {
    handler: Weak<RefCell<dyn Handler>>,
}

/// Configuration for [`Reactor::new`].
pub struct ReactorConfig {
    /// Maximum concurrently registered descriptors.
    pub max_descriptors: usize,
    /// Hint for `mio::Events` capacity per `poll` call.
    pub max_events: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        ReactorConfig {
            max_descriptors: DEFAULT_MAX_DESCRIPTORS,
            max_events: 1024,
        }
    }
}

impl From<&crate::config::Config> for ReactorConfig {
    fn from(config: &crate::config::Config) -> Self {
        ReactorConfig {
            max_descriptors: DEFAULT_MAX_DESCRIPTORS,
            max_events: config.reactor_max_events,
        }
    }
}

/// The event loop itself. Owned and run from a single thread; see
/// [`Reactor::handle`] for the cross-thread-safe half.
pub struct Reactor {
    poll: Poll,
    events: Events,
    table: crate::arena::DescriptorTable<Registration>,
    next_token: usize,
    timers: TimerWheel,
    timer_callbacks: HashMap<TimerId, Box<dyn FnOnce()>>,
    now_ms: u64,
    start: std::time::Instant,
    shared: Arc<Shared>,
    stop_timer: Option<TimerId>,
}

impl Reactor {
    /// Builds the `mio::Poll`/`Waker` pair and the descriptor table. Returns
    /// a [`Kind::Overloaded`]-tagged error if the OS refuses to create the
    /// poll instance (fd exhaustion, sandboxing, etc.) rather than panicking.
    pub fn new(config: ReactorConfig) -> Result<Self> {
        let poll = Poll::new().map_err(Error::connect)?;
        let waker =
            mio::Waker::new(poll.registry(), Token(usize::MAX)).map_err(Error::connect)?;

        Ok(Reactor {
            events: Events::with_capacity(config.max_events),
            poll,
            table: crate::arena::DescriptorTable::with_capacity(config.max_descriptors),
            next_token: 0,
            timers: TimerWheel::new(),
            timer_callbacks: HashMap::default(),
            now_ms: 0,
            start: std::time::Instant::now(),
            shared: Arc::new(Shared {
                running: AtomicBool::new(true),
                waker,
                posted: crate::sync::Mutex::new(Vec::new()),
            }),
            stop_timer: None,
        })
    }

    /// Returns a cloneable, `Send + Sync` handle for posting work or
    /// stopping the loop from another thread.
    pub fn handle(&self) -> Handle {
        Handle(self.shared.clone())
    }

    /// Monotonic milliseconds since the reactor was created, cached once per
    /// loop turn rather than read fresh per call.
    pub fn now_ms(&self) -> u64 {
        self.now_ms
    }

    /// Number of descriptors currently registered.
    pub fn handler_count(&self) -> usize {
        self.table.count()
    }

    /// True if `descriptor` is currently registered.
    pub fn contains(&self, descriptor: Descriptor) -> bool {
        self.table.contains(descriptor.0)
    }

    /// Registers `source` for the given interests, associating it with
    /// `handler`. The reactor keeps only a [`Weak`] reference: once every
    /// `Rc` to `handler` is dropped, the next dispatch to this descriptor
    /// silently deregisters it instead of panicking.
    pub fn add<S: Source>(
        &mut self,
        source: &mut S,
        mask: EventMask,
        handler: Weak<RefCell<dyn Handler>>,
    ) -> Result<Descriptor> {
        let token = self.allocate_token()?;
        self.poll
            .registry()
            .register(source, Token(token), interests_for(mask))
            .map_err(Error::connect)?;
        self.table.set(token, Registration { handler });
        Ok(Descriptor(token))
    }

    /// Changes the registered interest mask for an existing descriptor.
    pub fn modify<S: Source>(
        &mut self,
        source: &mut S,
        descriptor: Descriptor,
        mask: EventMask,
    ) -> Result<()> {
        self.poll
            .registry()
            .reregister(source, descriptor.token(), interests_for(mask))
            .map_err(Error::connect)
    }

    /// Deregisters a descriptor. The handler itself is not notified; callers
    /// that want an `on_close` should invoke it themselves before removing.
    pub fn remove<S: Source>(&mut self, source: &mut S, descriptor: Descriptor) -> Result<()> {
        self.poll.registry().deregister(source).map_err(Error::connect)?;
        self.table.remove(descriptor.0);
        Ok(())
    }

    fn allocate_token(&mut self) -> Result<usize> {
        let capacity = self.table.capacity();
        for _ in 0..capacity {
            let candidate = self.next_token % capacity;
            self.next_token = self.next_token.wrapping_add(1);
            if !self.table.contains(candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::overloaded("descriptor table exhausted"))
    }

    /// Schedules `callback` to run once `delay_ms` has elapsed, measured
    /// from the reactor's cached clock.
    pub fn schedule_timer(&mut self, delay_ms: u64, callback: impl FnOnce() + 'static) -> TimerId {
        let id = self.timers.schedule(self.now_ms, delay_ms);
        self.timer_callbacks.insert(id, Box::new(callback));
        id
    }

    /// Cancels a pending timer. Returns `true` if it had not already fired.
    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        let cancelled = self.timers.cancel(id);
        self.timer_callbacks.remove(&id);
        cancelled
    }

    fn refresh_clock(&mut self) {
        self.now_ms = self.start.elapsed().as_millis() as u64;
    }

    fn drain_posted(&mut self) {
        let mut pending = {
            let mut locked = self.shared.posted.lock();
            std::mem::take(&mut *locked)
        };
        for callback in pending.drain(..) {
            callback();
        }
    }

    fn fire_timers(&mut self) {
        for id in self.timers.process_expired(self.now_ms) {
            if let Some(callback) = self.timer_callbacks.remove(&id) {
                callback();
            }
        }
    }

    /// Runs one loop turn: blocks in `poll` for at most `timeout`,
    /// dispatches readiness events in `error -> readable -> writable ->
    /// disconnect` order per descriptor, fires expired timers, then drains
    /// the posted-callback queue.
    pub fn run_once(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.refresh_clock();
        let poll_timeout = match self.timers.next_deadline_ms(self.now_ms) {
            Some(ms) => match timeout {
                Some(t) => Some(t.min(Duration::from_millis(ms))),
                None => Some(Duration::from_millis(ms)),
            },
            None => timeout,
        };

        match self.poll.poll(&mut self.events, poll_timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(Error::connect(e)),
        }

        let mut dead = Vec::new();
        for event in self.events.iter() {
            let token = event.token();
            if token.0 == usize::MAX {
                continue; // waker token, not a real descriptor
            }

            let Some(registration) = self.table.get(token.0) else {
                continue;
            };

            let Some(handler) = registration.handler.upgrade() else {
                dead.push(token.0);
                continue;
            };

            if event.is_error() {
                let err = io::Error::other("readiness error");
                handler.borrow_mut().on_error(err);
                continue;
            }
            if event.is_readable() {
                handler.borrow_mut().on_readable();
            }
            if event.is_writable() {
                handler.borrow_mut().on_writable();
            }
            if event.is_read_closed() || event.is_write_closed() {
                handler.borrow_mut().on_close();
            }
        }

        for token in dead {
            self.table.remove(token);
        }

        self.refresh_clock();
        self.fire_timers();
        self.drain_posted();
        Ok(())
    }

    /// Runs loop turns until [`Handle::stop`] is called.
    pub fn run(&mut self) -> Result<()> {
        while self.shared.running.load(Ordering::Acquire) {
            self.run_once(Some(Duration::from_millis(100)))?;
        }
        Ok(())
    }

    /// Runs loop turns for at most `duration`, then returns even if nobody
    /// called `stop`.
    pub fn run_for(&mut self, duration: Duration) -> Result<()> {
        self.refresh_clock();
        let deadline = self.now_ms + duration.as_millis() as u64;
        let stop_timer = self.schedule_timer(duration.as_millis() as u64, || {});
        self.stop_timer = Some(stop_timer);

        while self.shared.running.load(Ordering::Acquire) {
            self.refresh_clock();
            if self.now_ms >= deadline {
                break;
            }
            self.run_once(Some(Duration::from_millis(
                deadline.saturating_sub(self.now_ms),
            )))?;
        }

        if let Some(id) = self.stop_timer.take() {
            self.cancel_timer(id);
        }
        Ok(())
    }
}

fn interests_for(mask: EventMask) -> Interest {
    match (
        mask.contains(EventMask::READABLE),
        mask.contains(EventMask::WRITABLE),
    ) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (true, false) => Interest::READABLE,
        (false, true) => Interest::WRITABLE,
        (false, false) => Interest::READABLE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn post_runs_on_next_turn() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let handle = reactor.handle();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        handle.post(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_ends_run() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let handle = reactor.handle();
        handle.stop();
        reactor.run().unwrap();
        assert!(!handle.is_running());
    }

    #[test]
    fn run_for_returns_without_stop() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        reactor.run_for(Duration::from_millis(20)).unwrap();
    }

    #[test]
    fn timer_fires_after_run_once() {
        let mut reactor = Reactor::new(ReactorConfig::default()).unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        reactor.schedule_timer(0, move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        reactor.run_once(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn descriptor_table_reports_empty_count() {
        let reactor = Reactor::new(ReactorConfig::default()).unwrap();
        assert_eq!(reactor.handler_count(), 0);
    }
}
