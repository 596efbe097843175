//! Event Scheduler
//!
//! Deferred callbacks ordered by absolute simulation time.
//!
//! ```text
//!   schedule_event(ptr, +50ms, E)           trigger(now)
//!          │                                     │
//!          ▼                                     ▼
//!   ┌──────────────┐   (fire_time, seq)   ┌──────────────┐
//!   │   entries    │ ───────────────────► │ fire ≤ now,  │──► on_triggered(ctx, sched)
//!   │ id → event   │      queue           │ seq < start  │
//!   └──────────────┘                      └──────────────┘
//!          ▲
//!          │ Weak<EventLink>
//!     EventPointer<E>  (invalid once the Arc is dropped)
//! ```
//!
//! The scheduler owns each event until it fires or is cancelled. External
//! code only ever holds an [`EventPointer`], a weak handle that reports
//! invalid as soon as its event leaves the active set.
//!
//! Single-threaded: the scheduler lives on its game thread and callbacks
//! run sequentially on that thread.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::TimeDelta;
use tracing::{debug, warn};

use crate::core::time::GameTime;

/// Internal identity of a scheduled event.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

/// Object-safe access to the concrete event type.
pub trait AsAnyMut {
    /// Upcast to [`Any`] for downcasting.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAnyMut for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A deferred callback.
///
/// `C` is the world context the event acts on. Callbacks receive the
/// scheduler separately so they can schedule or cancel follow-up events.
pub trait ScheduledEvent<C>: AsAnyMut + Send + 'static {
    /// Called once when the fire time is reached.
    fn on_triggered(self: Box<Self>, ctx: &mut C, scheduler: &mut EventScheduler<C>);

    /// Called once if the event is cancelled before firing.
    fn on_cancelled(self: Box<Self>, _scheduler: &mut EventScheduler<C>) {}
}

struct EventLink {
    id: EventId,
}

/// Weak typed handle to a scheduled event.
///
/// Clones share the same link, so every clone is invalidated together.
pub struct EventPointer<E> {
    link: Weak<EventLink>,
    _marker: PhantomData<fn() -> E>,
}

impl<E> EventPointer<E> {
    /// Unbound pointer.
    pub fn new() -> Self {
        Self { link: Weak::new(), _marker: PhantomData }
    }

    /// True while the referenced event is scheduled.
    pub fn is_valid(&self) -> bool {
        self.link.strong_count() > 0
    }

    fn id(&self) -> Option<EventId> {
        self.link.upgrade().map(|link| link.id)
    }
}

impl<E> Default for EventPointer<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventPointer<E> {
    fn clone(&self) -> Self {
        Self { link: self.link.clone(), _marker: PhantomData }
    }
}

impl<E> fmt::Debug for EventPointer<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id() {
            Some(id) => write!(f, "EventPointer({:?})", id),
            None => write!(f, "EventPointer(invalid)"),
        }
    }
}

struct Entry<C> {
    link: Arc<EventLink>,
    fire_time: GameTime,
    seq: u64,
    type_name: &'static str,
    event: Box<dyn ScheduledEvent<C>>,
}

/// Time-ordered registry of pending events.
pub struct EventScheduler<C> {
    entries: BTreeMap<EventId, Entry<C>>,
    queue: BTreeSet<(GameTime, u64, EventId)>,
    current_time: GameTime,
    next_id: u64,
    next_seq: u64,
    cancelling_all: bool,
}

impl<C: 'static> EventScheduler<C> {
    /// Create a scheduler whose clock starts at `start`.
    pub fn new(start: GameTime) -> Self {
        Self {
            entries: BTreeMap::new(),
            queue: BTreeSet::new(),
            current_time: start,
            next_id: 1,
            next_seq: 0,
            cancelling_all: false,
        }
    }

    /// Time of the last trigger pass.
    pub fn current_time(&self) -> GameTime {
        self.current_time
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Fire time of the earliest pending event.
    pub fn next_fire_time(&self) -> Option<GameTime> {
        self.queue.first().map(|(time, _, _)| *time)
    }

    /// True while `cancel_all` is draining the active set.
    pub fn is_cancelling_all(&self) -> bool {
        self.cancelling_all
    }

    /// Schedule `event` to fire `delay` after the current time and bind `pointer` to it.
    ///
    /// Negative delays are clamped to zero. Ignored while `cancel_all` runs.
    /// A pointer that is already bound is rebound to the new event; the
    /// old event stays scheduled.
    pub fn schedule_event<E>(&mut self, pointer: &mut EventPointer<E>, delay: TimeDelta, event: E)
    where
        E: ScheduledEvent<C>,
    {
        if self.cancelling_all {
            debug!("schedule_event<{}>(): rejected while cancelling all events", short_type_name::<E>());
            return;
        }

        let delay = clamp_delay::<E>(delay);

        if pointer.is_valid() {
            debug!("schedule_event<{}>(): rebinding pointer {:?}", short_type_name::<E>(), pointer);
        }

        let id = EventId(self.next_id);
        self.next_id += 1;
        let seq = self.take_seq();
        let fire_time = self.current_time + delay;

        let link = Arc::new(EventLink { id });
        pointer.link = Arc::downgrade(&link);

        self.queue.insert((fire_time, seq, id));
        self.entries.insert(id, Entry {
            link,
            fire_time,
            seq,
            type_name: short_type_name::<E>(),
            event: Box::new(event),
        });
    }

    /// Move a pending event to `delay` after the current time.
    ///
    /// The event keeps its identity and every pointer to it stays valid.
    /// No-op for an invalid pointer.
    pub fn reschedule_event<E>(&mut self, pointer: &EventPointer<E>, delay: TimeDelta)
    where
        E: ScheduledEvent<C>,
    {
        let Some(id) = pointer.id() else { return };
        let delay = clamp_delay::<E>(delay);
        let seq = self.take_seq();
        let fire_time = self.current_time + delay;

        let Some(entry) = self.entries.get_mut(&id) else { return };
        self.queue.remove(&(entry.fire_time, entry.seq, id));
        entry.fire_time = fire_time;
        entry.seq = seq;
        self.queue.insert((fire_time, seq, id));
    }

    /// Cancel a pending event. No-op if it already fired or was cancelled.
    pub fn cancel_event<E>(&mut self, pointer: &EventPointer<E>)
    where
        E: ScheduledEvent<C>,
    {
        if let Some(id) = pointer.id() {
            self.cancel_by_id(id);
        }
    }

    /// Cancel every pending event. Scheduling is rejected until this returns.
    pub fn cancel_all_events(&mut self) {
        if self.cancelling_all {
            return;
        }
        self.cancelling_all = true;

        let count = self.entries.len();
        while let Some((_, _, id)) = self.queue.first().copied() {
            self.cancel_by_id(id);
        }

        self.cancelling_all = false;
        if count > 0 {
            debug!("Cancelled {} event(s)", count);
        }
    }

    /// Fire every event due at `now`, in (fire time, scheduling order).
    ///
    /// Events scheduled or rescheduled by callbacks during this pass wait
    /// for the next one. Returns the number of events fired.
    pub fn trigger_events(&mut self, now: GameTime, ctx: &mut C) -> usize {
        if now > self.current_time {
            self.current_time = now;
        }
        let boundary = self.next_seq;
        let mut fired = 0;

        loop {
            let due = self
                .queue
                .iter()
                .take_while(|(time, _, _)| *time <= now)
                .find(|(_, seq, _)| *seq < boundary)
                .copied();
            let Some(key) = due else { break };

            self.queue.remove(&key);
            let Some(entry) = self.entries.remove(&key.2) else { continue };
            drop(entry.link);
            entry.event.on_triggered(ctx, self);
            fired += 1;
        }

        if fired > 0 {
            debug!("Triggered {} event(s) ({} more scheduled)", fired, self.entries.len());
        }
        fired
    }

    /// Typed access to a pending event.
    pub fn get_mut<E>(&mut self, pointer: &EventPointer<E>) -> Option<&mut E>
    where
        E: ScheduledEvent<C>,
    {
        let id = pointer.id()?;
        let entry = self.entries.get_mut(&id)?;
        AsAnyMut::as_any_mut(entry.event.as_mut()).downcast_mut::<E>()
    }

    /// Fire time of a pending event.
    pub fn fire_time<E>(&self, pointer: &EventPointer<E>) -> Option<GameTime> {
        let id = pointer.id()?;
        self.entries.get(&id).map(|entry| entry.fire_time)
    }

    /// Pending event counts per event type.
    pub fn scheduled_event_counts(&self) -> BTreeMap<&'static str, usize> {
        let mut counts = BTreeMap::new();
        for entry in self.entries.values() {
            *counts.entry(entry.type_name).or_insert(0) += 1;
        }
        counts
    }

    fn cancel_by_id(&mut self, id: EventId) {
        let Some(entry) = self.entries.remove(&id) else { return };
        self.queue.remove(&(entry.fire_time, entry.seq, id));
        drop(entry.link);
        entry.event.on_cancelled(self);
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

impl<C> fmt::Debug for EventScheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventScheduler")
            .field("current_time", &self.current_time)
            .field("pending", &self.entries.len())
            .field("cancelling_all", &self.cancelling_all)
            .finish()
    }
}

fn clamp_delay<E>(delay: TimeDelta) -> Duration {
    match delay.to_std() {
        Ok(delay) => delay,
        Err(_) => {
            warn!("schedule<{}>(): negative delay {} clamped to zero", short_type_name::<E>(), delay);
            Duration::ZERO
        }
    }
}

/// Type name without its module path.
fn short_type_name<E>() -> &'static str {
    let full = std::any::type_name::<E>();
    let head = full.split('<').next().unwrap_or(full);
    match head.rfind("::") {
        Some(pos) => &full[pos + 2..],
        None => full,
    }
}
