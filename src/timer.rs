//! Timer manager grounded on the donor source's `Timer`/`TimerManager`
//! (`core/io/timer.cpp`): a manager holds a set of timers ordered by
//! `(deadline, insertion order)`, callers pull due callbacks out with
//! [`TimerManager::list_expired_cb`] on every reactor tick, and the manager reports
//! how long until the next deadline so the tick loop knows how long it may sleep.
//!
//! The original stores timers in a `std::set` with `shared_ptr` and relies on pointer
//! identity to break deadline ties; a `BinaryHeap` has no decrease-key, so refreshing
//! or resetting a timer here pushes a fresh heap entry and leaves the stale one in
//! place, discarded lazily (`stale` check in `list_expired_cb`) the way the original's
//! `listExpiredCb` re-checks validity under the lock before firing.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering},
        Arc, Mutex, Weak,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Milliseconds since the Unix epoch, matching the donor's `ms` timestamps.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

type Callback = Box<dyn FnMut() + Send + 'static>;

struct TimerInner {
    id: u64,
    recurring: AtomicBool,
    period_ms: AtomicU64,
    /// Source of truth for this timer's current deadline. A heap [`Entry`] only
    /// holds a snapshot taken at push time; if it no longer matches this value,
    /// the entry is stale and must be discarded rather than fired.
    next_ms: AtomicU64,
    cancelled: AtomicBool,
    callback: Mutex<Option<Callback>>,
}

/// A handle to a scheduled timer. Dropping it does not cancel the timer; call
/// [`TimerManager::cancel`] explicitly, mirroring the donor's explicit `cancel()`.
#[derive(Clone)]
pub struct TimerHandle(Arc<TimerInner>);

impl TimerHandle {
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.cancelled.load(AtomicOrdering::Acquire)
    }
}

/// A timer found due by [`TimerManager::list_expired_cb`]. Firing is deferred to
/// this handle (rather than returning the raw callback) so a one-shot timer's
/// callback slot is only emptied once [`fire`](Self::fire) actually runs it.
pub struct DueTimer(Arc<TimerInner>);

impl DueTimer {
    /// Runs the timer's callback, consuming it if the timer was one-shot.
    pub fn fire(&self) {
        let mut slot = self.0.callback.lock().expect("timer callback poisoned");
        if let Some(cb) = slot.as_mut() {
            cb();
        }
        if !self.0.recurring.load(AtomicOrdering::Relaxed) {
            *slot = None;
        }
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }
}

struct Entry {
    next_ms: u64,
    id: u64,
    inner: Arc<TimerInner>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.next_ms == other.next_ms && self.id == other.id
    }
}
impl Eq for Entry {}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline first.
        (other.next_ms, other.id).cmp(&(self.next_ms, self.id))
    }
}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A single-threaded-logic, lock-protected timer heap. One manager typically backs
/// one reactor; the gateway runs one per worker to avoid cross-worker contention.
pub struct TimerManager {
    entries: Mutex<BinaryHeap<Entry>>,
    next_id: AtomicU64,
    /// `u64::MAX` means "no call to `list_expired_cb` has happened yet" — seeded
    /// lazily from the first observed `now` rather than real wall-clock time at
    /// construction, so a manager driven entirely by test-scale timestamps never
    /// sees its first tick as a clock rollover.
    previous_time_ms: AtomicU64,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BinaryHeap::new()),
            next_id: AtomicU64::new(1),
            previous_time_ms: AtomicU64::new(u64::MAX),
        }
    }

    fn push(&self, next_ms: u64, recurring: bool, period_ms: u64, callback: Callback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let inner = Arc::new(TimerInner {
            id,
            recurring: AtomicBool::new(recurring),
            period_ms: AtomicU64::new(period_ms),
            next_ms: AtomicU64::new(next_ms),
            cancelled: AtomicBool::new(false),
            callback: Mutex::new(Some(callback)),
        });
        let mut entries = self.entries.lock().expect("timer heap poisoned");
        let at_front = entries
            .peek()
            .map(|top| (next_ms, id) < (top.next_ms, top.id))
            .unwrap_or(true);
        entries.push(Entry {
            next_ms,
            id,
            inner: inner.clone(),
        });
        drop(entries);
        if at_front {
            self.on_timer_inserted_at_front();
        }
        TimerHandle(inner)
    }

    /// Schedules `cb` to run `period_ms` from now, once or repeatedly.
    pub fn add_timer(&self, period_ms: u64, recurring: bool, cb: Callback) -> TimerHandle {
        self.push(now_ms() + period_ms, recurring, period_ms, cb)
    }

    /// Like [`add_timer`](Self::add_timer), but skips firing `cb` if `weak` can no
    /// longer be upgraded — the donor's pattern for timers bound to a connection's
    /// lifetime without keeping that connection alive artificially.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        period_ms: u64,
        recurring: bool,
        weak: Weak<T>,
        mut cb: impl FnMut(Arc<T>) + Send + 'static,
    ) -> TimerHandle {
        self.add_timer(
            period_ms,
            recurring,
            Box::new(move || {
                if let Some(strong) = weak.upgrade() {
                    cb(strong);
                }
            }),
        )
    }

    /// Marks a timer as cancelled. A cancelled timer's stale heap entry is dropped
    /// the next time it would otherwise fire.
    pub fn cancel(&self, handle: &TimerHandle) {
        handle.0.cancelled.store(true, AtomicOrdering::Release);
        *handle.0.callback.lock().expect("timer callback poisoned") = None;
    }

    /// Postpones the deadline to `period_ms` from now, keeping the timer's period.
    pub fn refresh(&self, handle: &TimerHandle) {
        let period = handle.0.period_ms.load(AtomicOrdering::Relaxed);
        self.reset(handle, period, true);
    }

    /// Rewrites the timer's period and deadline. `from_now` mirrors the donor's
    /// `reset(ms, from_now)`: when true, the new deadline is `now + ms`; when false,
    /// it is the timer's *original* base deadline plus `ms`, for callers that want
    /// to keep a stable phase rather than restart the count from the call site.
    pub fn reset(&self, handle: &TimerHandle, period_ms: u64, from_now: bool) {
        if handle.is_cancelled() {
            return;
        }
        let base = if from_now {
            now_ms()
        } else {
            handle.0.next_ms.load(AtomicOrdering::Relaxed) - handle.0.period_ms.load(AtomicOrdering::Relaxed)
        };
        let next = base + period_ms;
        handle.0.period_ms.store(period_ms, AtomicOrdering::Relaxed);
        handle.0.next_ms.store(next, AtomicOrdering::Relaxed);

        let mut entries = self.entries.lock().expect("timer heap poisoned");
        let at_front = entries
            .peek()
            .map(|top| (next, handle.0.id) < (top.next_ms, top.id))
            .unwrap_or(true);
        entries.push(Entry {
            next_ms: next,
            id: handle.0.id,
            inner: handle.0.clone(),
        });
        drop(entries);
        if at_front {
            self.on_timer_inserted_at_front();
        }
    }

    /// Milliseconds until the next deadline, or `None` if no timer is scheduled.
    /// Returns `Some(0)` if a timer is already due.
    pub fn get_next_timer(&self) -> Option<Duration> {
        let entries = self.entries.lock().expect("timer heap poisoned");
        let top = entries.peek()?;
        let now = now_ms();
        Some(Duration::from_millis(top.next_ms.saturating_sub(now)))
    }

    /// Pops every timer due at or before `now`, reschedules recurring ones, and
    /// returns handles to fire. Each [`DueTimer::fire`] locks only that timer's own
    /// callback slot, not the heap, so firing one timer's callback is free to
    /// schedule another timer without deadlocking. Detects and handles clock
    /// rollover the way the donor does: if the wall clock has jumped backward by
    /// more than an hour, every timer is treated as expired rather than silently
    /// stalling until the clock catches back up.
    pub fn list_expired_cb(&self, now: u64) -> Vec<DueTimer> {
        let prev = self.previous_time_ms.swap(now, AtomicOrdering::AcqRel);
        let rollover = prev != u64::MAX && now < prev && prev.saturating_sub(now) > 3_600_000;

        let mut due = Vec::new();
        let mut entries = self.entries.lock().expect("timer heap poisoned");
        loop {
            let Some(top) = entries.peek() else { break };
            if !rollover && top.next_ms > now {
                break;
            }
            let entry = entries.pop().expect("peek just succeeded");
            if entry.inner.cancelled.load(AtomicOrdering::Acquire) {
                continue;
            }
            if entry.next_ms != entry.inner.next_ms.load(AtomicOrdering::Relaxed) {
                continue; // stale: superseded by a refresh/reset
            }
            if entry.inner.recurring.load(AtomicOrdering::Relaxed) {
                let period = entry.inner.period_ms.load(AtomicOrdering::Relaxed);
                let next = now + period;
                entry.inner.next_ms.store(next, AtomicOrdering::Relaxed);
                entries.push(Entry {
                    next_ms: next,
                    id: entry.id,
                    inner: entry.inner.clone(),
                });
            }
            due.push(DueTimer(entry.inner.clone()));
        }
        due
    }

    /// Hook for the reactor loop: called when a new timer becomes the earliest
    /// deadline, so a blocked poll can be woken to recompute its wait duration.
    /// The donor exposes this as a virtual method on the event loop; here it is a
    /// no-op default that callers can observe via [`get_next_timer`](Self::get_next_timer)
    /// after scheduling instead, which is the idiomatic polling-loop equivalent.
    fn on_timer_inserted_at_front(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_in_deadline_order() {
        let mgr = TimerManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o1 = order.clone();
        mgr.push(100, false, 0, Box::new(move || o1.lock().unwrap().push(1)));
        let o2 = order.clone();
        mgr.push(50, false, 0, Box::new(move || o2.lock().unwrap().push(2)));
        let o3 = order.clone();
        mgr.push(75, false, 0, Box::new(move || o3.lock().unwrap().push(3)));

        for due in mgr.list_expired_cb(1000) {
            due.fire();
        }
        assert_eq!(*order.lock().unwrap(), vec![2, 3, 1]);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        let handle = mgr.push(10, false, 0, Box::new(move || f.store(true, AtomicOrdering::SeqCst)));
        mgr.cancel(&handle);
        for due in mgr.list_expired_cb(1000) {
            due.fire();
        }
        assert!(!fired.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn recurring_timer_reschedules_itself() {
        let mgr = TimerManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        mgr.push(10, true, 10, Box::new(move || { c.fetch_add(1, AtomicOrdering::SeqCst); }));

        for due in mgr.list_expired_cb(1000) {
            due.fire();
        }
        assert_eq!(count.load(AtomicOrdering::SeqCst), 1);

        for due in mgr.list_expired_cb(2000) {
            due.fire();
        }
        assert_eq!(count.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn refresh_postpones_without_duplicate_fire() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let handle = mgr.push(1000, false, 1000, Box::new(move || { f.fetch_add(1, AtomicOrdering::SeqCst); }));

        mgr.refresh(&handle);
        // The original entry (deadline ~1000) is now stale; nothing should fire yet
        // at the old deadline.
        for due in mgr.list_expired_cb(1500) {
            due.fire();
        }
        assert_eq!(fired.load(AtomicOrdering::SeqCst), 0);
    }

    #[test]
    fn get_next_timer_reports_soonest_deadline() {
        let mgr = TimerManager::new();
        assert!(mgr.get_next_timer().is_none());
        mgr.push(now_ms() + 10_000, false, 0, Box::new(|| {}));
        let remaining = mgr.get_next_timer().unwrap();
        assert!(remaining.as_millis() > 0 && remaining.as_millis() <= 10_000);
    }

    #[test]
    fn first_tick_at_a_small_timestamp_is_not_mistaken_for_rollover() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        mgr.push(10_000, false, 0, Box::new(move || f.store(true, AtomicOrdering::SeqCst)));

        // First call ever, with a tiny test-scale timestamp far below wall-clock
        // time: must not be treated as a backward clock jump.
        for due in mgr.list_expired_cb(1_000) {
            due.fire();
        }
        assert!(!fired.load(AtomicOrdering::SeqCst));

        for due in mgr.list_expired_cb(10_000) {
            due.fire();
        }
        assert!(fired.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn real_backward_clock_jump_expires_everything() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        mgr.push(10_000_000, false, 0, Box::new(move || f.store(true, AtomicOrdering::SeqCst)));

        // Establish a baseline tick, then jump the clock back by more than an hour.
        for due in mgr.list_expired_cb(5_000_000) {
            due.fire();
        }
        assert!(!fired.load(AtomicOrdering::SeqCst));

        for due in mgr.list_expired_cb(1_000) {
            due.fire();
        }
        assert!(fired.load(AtomicOrdering::SeqCst));
    }

    #[test]
    fn condition_timer_skips_when_target_dropped() {
        let mgr = TimerManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let target = Arc::new(42u32);
        let weak = Arc::downgrade(&target);
        drop(target);

        let f = fired.clone();
        mgr.add_condition_timer(10, false, weak, move |_| f.store(true, AtomicOrdering::SeqCst));
        for due in mgr.list_expired_cb(now_ms() + 10) {
            due.fire();
        }
        assert!(!fired.load(AtomicOrdering::SeqCst));
    }
}
