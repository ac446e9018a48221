use netlab_abstract::SimTime;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use tracing::trace;

/// Deferred work executed against the owning simulation context.
pub type Callback<C> = Box<dyn FnOnce(&mut C)>;

/// Identifies a scheduled event so it can be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

struct Event<C> {
    time: SimTime,
    id: u64, // Insertion order, breaks ties between events at the same time
    callback: Callback<C>,
}

// Custom Ord for Min-Heap (smallest time pops first)
impl<C> PartialEq for Event<C> {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.id == other.id
    }
}

impl<C> Eq for Event<C> {}

impl<C> PartialOrd for Event<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Event<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse comparison: the earliest (time, id) is the greatest in BinaryHeap
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Time-ordered event queue and virtual clock.
pub struct Scheduler<C> {
    now: SimTime,
    queue: BinaryHeap<Event<C>>,
    next_id: u64,
    /// Ids scheduled but neither fired nor cancelled.
    live: HashSet<u64>,
}

impl<C> Default for Scheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Scheduler<C> {
    pub fn new() -> Self {
        Self {
            now: SimTime::ZERO,
            queue: BinaryHeap::new(),
            next_id: 0,
            live: HashSet::new(),
        }
    }

    pub fn now(&self) -> SimTime {
        self.now
    }

    /// Schedule `callback` to run `delay` after the current time.
    pub fn schedule(
        &mut self,
        delay: SimTime,
        callback: impl FnOnce(&mut C) + 'static,
    ) -> EventHandle {
        self.schedule_at(self.now + delay, callback)
    }

    /// Schedule `callback` at an absolute time, which must not lie in the past.
    pub fn schedule_at(
        &mut self,
        time: SimTime,
        callback: impl FnOnce(&mut C) + 'static,
    ) -> EventHandle {
        assert!(
            time >= self.now,
            "event scheduled in the past: {} < now {}",
            time,
            self.now
        );
        let id = self.next_id;
        self.next_id += 1;
        self.live.insert(id);
        self.queue.push(Event {
            time,
            id,
            callback: Box::new(callback),
        });
        EventHandle(id)
    }

    /// Make a pending event inert. Returns `false` if it already fired or was cancelled.
    pub fn cancel(&mut self, handle: EventHandle) -> bool {
        self.live.remove(&handle.0)
    }

    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.live.contains(&handle.0)
    }

    /// Number of events that will still fire.
    pub fn pending(&self) -> usize {
        self.live.len()
    }

    /// Time of the next event that will fire, if any.
    pub fn peek_next_time(&mut self) -> Option<SimTime> {
        self.drop_cancelled_head();
        self.queue.peek().map(|e| e.time)
    }

    fn drop_cancelled_head(&mut self) {
        while let Some(head) = self.queue.peek() {
            if self.live.contains(&head.id) {
                break;
            }
            self.queue.pop();
        }
    }

    /// Pop the next live event due at or before `stop`, advancing the clock to it.
    fn pop_due(&mut self, stop: SimTime) -> Option<Event<C>> {
        self.drop_cancelled_head();
        if self.queue.peek()?.time > stop {
            return None;
        }
        let event = self.queue.pop()?;
        self.live.remove(&event.id);
        assert!(
            event.time >= self.now,
            "simulation clock moved backwards: {} < {}",
            event.time,
            self.now
        );
        self.now = event.time;
        Some(event)
    }

    /// Discard every remaining event. Returns how many live events were dropped.
    pub fn clear(&mut self) -> usize {
        let discarded = self.live.len();
        self.queue.clear();
        self.live.clear();
        discarded
    }
}

/// A simulation context that owns its scheduler.
///
/// The run loop pops an owned event out of the scheduler and then hands the
/// whole context to the callback, so callbacks can freely schedule more work.
pub trait SchedulerHost: Sized {
    fn scheduler(&mut self) -> &mut Scheduler<Self>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub executed: u64,
    /// Events still queued past the stop time and thrown away.
    pub discarded: usize,
    pub end_time: SimTime,
}

/// Execute the next event due at or before `stop`. Returns false if there is none.
pub fn step<H: SchedulerHost>(host: &mut H, stop: SimTime) -> bool {
    let Some(event) = host.scheduler().pop_due(stop) else {
        return false;
    };
    trace!(time = %event.time, id = event.id, "firing event");
    (event.callback)(host);
    true
}

/// Drain events up to and including `stop`, then discard whatever is left.
pub fn run_until<H: SchedulerHost>(host: &mut H, stop: SimTime) -> RunSummary {
    let mut executed = 0;
    while step(host, stop) {
        executed += 1;
    }
    let scheduler = host.scheduler();
    let discarded = scheduler.clear();
    RunSummary {
        executed,
        discarded,
        end_time: scheduler.now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct World {
        scheduler: Scheduler<World>,
        fired: Vec<(u32, SimTime)>,
    }

    impl SchedulerHost for World {
        fn scheduler(&mut self) -> &mut Scheduler<Self> {
            &mut self.scheduler
        }
    }

    fn record(tag: u32) -> impl FnOnce(&mut World) + 'static {
        move |w: &mut World| {
            let now = w.scheduler.now();
            w.fired.push((tag, now));
        }
    }

    fn tags(world: &World) -> Vec<u32> {
        world.fired.iter().map(|(tag, _)| *tag).collect()
    }

    #[test]
    fn equal_times_fire_in_insertion_order() {
        let mut world = World::default();
        for tag in 0..5 {
            world.scheduler.schedule(SimTime::from_millis(3), record(tag));
        }
        world.scheduler.schedule(SimTime::from_millis(1), record(99));

        let summary = run_until(&mut world, SimTime::MAX);
        assert_eq!(tags(&world), vec![99, 0, 1, 2, 3, 4]);
        assert_eq!(summary.executed, 6);
        assert_eq!(summary.end_time, SimTime::from_millis(3));
    }

    #[test]
    fn cancelled_event_never_runs() {
        let mut world = World::default();
        let doomed = world.scheduler.schedule(SimTime::from_millis(10), record(0));
        world.scheduler.schedule(SimTime::from_millis(5), move |w: &mut World| {
            assert!(w.scheduler.cancel(doomed));
        });
        world.scheduler.schedule(SimTime::from_millis(10), record(1));

        run_until(&mut world, SimTime::MAX);
        assert_eq!(tags(&world), vec![1]);
        assert!(!world.scheduler.cancel(doomed));
    }

    #[test]
    fn cancelling_a_due_event_at_the_same_instant() {
        let mut world = World::default();
        let handle = world.scheduler.schedule(SimTime::ZERO, record(7));
        assert!(world.scheduler.is_pending(handle));
        assert!(world.scheduler.cancel(handle));
        assert_eq!(world.scheduler.pending(), 0);
        assert!(!step(&mut world, SimTime::MAX));
        assert!(world.fired.is_empty());
    }

    #[test]
    fn peek_skips_cancelled_events() {
        let mut world = World::default();
        let first = world.scheduler.schedule(SimTime::from_millis(1), record(0));
        world.scheduler.schedule(SimTime::from_millis(4), record(1));
        assert_eq!(world.scheduler.peek_next_time(), Some(SimTime::from_millis(1)));

        world.scheduler.cancel(first);
        assert_eq!(world.scheduler.peek_next_time(), Some(SimTime::from_millis(4)));
        assert_eq!(world.scheduler.pending(), 1);
    }

    #[test]
    fn run_until_keeps_events_at_stop_and_discards_later_ones() {
        let mut world = World::default();
        world.scheduler.schedule(SimTime::from_secs(1), record(1));
        world.scheduler.schedule(SimTime::from_secs(2), record(2));
        world.scheduler.schedule(SimTime::from_secs(3), record(3));

        let summary = run_until(&mut world, SimTime::from_secs(2));
        assert_eq!(tags(&world), vec![1, 2]);
        assert_eq!(summary.discarded, 1);
        assert_eq!(world.scheduler.pending(), 0);
        assert_eq!(world.scheduler.now(), SimTime::from_secs(2));
    }

    #[test]
    fn callbacks_can_schedule_follow_up_events() {
        let mut world = World::default();
        world.scheduler.schedule(SimTime::from_millis(1), |w: &mut World| {
            w.fired.push((0, w.scheduler.now()));
            // Same instant: runs after everything already queued for t=1ms
            w.scheduler.schedule(SimTime::ZERO, record(2));
            w.scheduler.schedule(SimTime::from_millis(1), record(3));
        });
        world.scheduler.schedule(SimTime::from_millis(1), record(1));

        run_until(&mut world, SimTime::MAX);
        assert_eq!(tags(&world), vec![0, 1, 2, 3]);
        assert_eq!(world.fired[3].1, SimTime::from_millis(2));
    }

    #[test]
    #[should_panic(expected = "event scheduled in the past")]
    fn scheduling_in_the_past_is_fatal() {
        let mut world = World::default();
        world.scheduler.schedule(SimTime::from_secs(2), |w: &mut World| {
            w.scheduler.schedule_at(SimTime::from_secs(1), |_| {});
        });
        run_until(&mut world, SimTime::MAX);
    }

    proptest! {
        #[test]
        fn fires_in_non_decreasing_time_order(delays in proptest::collection::vec(0u64..50, 1..64)) {
            let mut world = World::default();
            for (tag, delay) in delays.iter().enumerate() {
                world.scheduler.schedule(SimTime::from_micros(*delay), record(tag as u32));
            }
            run_until(&mut world, SimTime::MAX);

            prop_assert_eq!(world.fired.len(), delays.len());
            for pair in world.fired.windows(2) {
                let (a, ta) = pair[0];
                let (b, tb) = pair[1];
                prop_assert!(ta <= tb);
                if ta == tb {
                    prop_assert!(a < b);
                }
                // d1 <= d2 implies fired no later
                prop_assert!(delays[a as usize] <= delays[b as usize]);
            }
        }
    }
}
