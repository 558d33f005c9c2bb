//! Fixed-size timing wheel for idle-connection timers.
//!
//! One slot per tick, `SLOTS` slots per revolution. A timer scheduled `d`
//! ticks out lands `d % SLOTS` slots ahead of the hand with a rotation count
//! of `d / SLOTS`; each pass of the hand decrements the rotation and fires
//! the entry once it reaches zero. Insert, re-arm and cancel are all O(1).
//!
//! Entries live in an arena and slot membership is expressed as index links
//! inside it, so handles stay valid however the wheel is mutated. Handles
//! carry a generation so a stale handle for a freed entry is simply ignored.

/// Number of slots on the wheel.
pub const SLOTS: usize = 60;

/// Stable reference to a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    index: usize,
    gen: u64,
}

struct Entry<T> {
    gen: u64,
    rotation: usize,
    slot: usize,
    prev: Option<usize>,
    next: Option<usize>,
    payload: Option<T>,
}

pub struct Wheel<T> {
    slots: Vec<Option<usize>>,
    arena: Vec<Entry<T>>,
    free: Vec<usize>,
    hand: usize,
    live: usize,
}

impl<T> Wheel<T> {
    pub fn new() -> Wheel<T> {
        Wheel {
            slots: vec![None; SLOTS],
            arena: Vec::new(),
            free: Vec::new(),
            hand: 0,
            live: 0,
        }
    }

    /// Number of scheduled timers.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Schedule a timer `ticks` ticks from now. A zero duration rounds up to
    /// one tick.
    pub fn schedule(&mut self, ticks: usize, payload: T) -> TimerHandle {
        let ticks = ticks.max(1);
        let rotation = ticks / SLOTS;
        let slot = (self.hand + ticks % SLOTS) % SLOTS;

        let index = match self.free.pop() {
            Some(index) => {
                let entry = &mut self.arena[index];
                entry.rotation = rotation;
                entry.slot = slot;
                entry.payload = Some(payload);
                index
            }
            None => {
                self.arena.push(Entry {
                    gen: 0,
                    rotation,
                    slot,
                    prev: None,
                    next: None,
                    payload: Some(payload),
                });
                self.arena.len() - 1
            }
        };
        self.link(index, slot);
        self.live += 1;
        TimerHandle { index, gen: self.arena[index].gen }
    }

    /// Re-arm a live timer with a fresh duration measured from now. Returns
    /// false if the handle is stale.
    pub fn reschedule(&mut self, handle: TimerHandle, ticks: usize) -> bool {
        if !self.is_live(handle) {
            return false;
        }
        let ticks = ticks.max(1);
        self.unlink(handle.index);
        let entry = &mut self.arena[handle.index];
        entry.rotation = ticks / SLOTS;
        entry.slot = (self.hand + ticks % SLOTS) % SLOTS;
        let slot = entry.slot;
        self.link(handle.index, slot);
        true
    }

    /// Remove a timer without firing it, returning its payload.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        if !self.is_live(handle) {
            return None;
        }
        self.unlink(handle.index);
        Some(self.release(handle.index))
    }

    /// Advance the hand by one slot, returning the payloads of every timer
    /// that expired on this tick.
    pub fn tick(&mut self) -> Vec<T> {
        let mut fired = Vec::new();
        let mut cursor = self.slots[self.hand];
        while let Some(index) = cursor {
            cursor = self.arena[index].next;
            if self.arena[index].rotation > 0 {
                self.arena[index].rotation -= 1;
            } else {
                self.unlink(index);
                fired.push(self.release(index));
            }
        }
        self.hand = (self.hand + 1) % SLOTS;
        fired
    }

    fn is_live(&self, handle: TimerHandle) -> bool {
        self.arena
            .get(handle.index)
            .map(|e| e.gen == handle.gen && e.payload.is_some())
            .unwrap_or(false)
    }

    /// Insert at the head of a slot list.
    fn link(&mut self, index: usize, slot: usize) {
        let head = self.slots[slot];
        self.arena[index].prev = None;
        self.arena[index].next = head;
        if let Some(head) = head {
            self.arena[head].prev = Some(index);
        }
        self.slots[slot] = Some(index);
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next, slot) = {
            let entry = &self.arena[index];
            (entry.prev, entry.next, entry.slot)
        };
        match prev {
            Some(prev) => self.arena[prev].next = next,
            None => self.slots[slot] = next,
        }
        if let Some(next) = next {
            self.arena[next].prev = prev;
        }
        self.arena[index].prev = None;
        self.arena[index].next = None;
    }

    /// Free an unlinked entry and hand back its payload.
    fn release(&mut self, index: usize) -> T {
        let entry = &mut self.arena[index];
        entry.gen += 1;
        let payload = entry.payload.take().expect("releasing an empty timer entry");
        self.free.push(index);
        self.live -= 1;
        payload
    }
}

impl<T> Default for Wheel<T> {
    fn default() -> Self {
        Wheel::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Run `n` ticks, recording (tick number, payload) for everything fired.
    fn run_ticks(wheel: &mut Wheel<u32>, n: usize) -> Vec<(usize, u32)> {
        let mut fired = Vec::new();
        for tick in 1..=n {
            for payload in wheel.tick() {
                fired.push((tick, payload));
            }
        }
        fired
    }

    #[test]
    fn fires_in_duration_order_exactly_once() {
        let mut wheel = Wheel::new();
        wheel.schedule(7, 7);
        wheel.schedule(2, 2);
        wheel.schedule(40, 40);
        wheel.schedule(15, 15);

        let fired = run_ticks(&mut wheel, SLOTS);
        let order: Vec<u32> = fired.iter().map(|&(_, p)| p).collect();
        assert_eq!(order, vec![2, 7, 15, 40]);
        // Never early: a duration of d ticks must see at least d ticks pass.
        for (tick, payload) in fired {
            assert!(tick >= payload as usize);
        }
        assert!(wheel.is_empty());
    }

    #[test]
    fn multi_revolution_timers_wait_their_laps() {
        let mut wheel = Wheel::new();
        wheel.schedule(SLOTS + 5, 1);

        assert!(run_ticks(&mut wheel, SLOTS).is_empty());
        let fired = run_ticks(&mut wheel, 10);
        assert_eq!(fired.len(), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn reschedule_supersedes_the_old_expiry() {
        let mut wheel = Wheel::new();
        let handle = wheel.schedule(3, 9);

        // Re-arm before expiry; the old deadline must never fire.
        assert!(run_ticks(&mut wheel, 2).is_empty());
        assert!(wheel.reschedule(handle, 10));
        assert!(run_ticks(&mut wheel, 8).is_empty());
        let fired = run_ticks(&mut wheel, 4);
        assert_eq!(fired.iter().map(|&(_, p)| p).collect::<Vec<_>>(), vec![9]);
    }

    #[test]
    fn repeated_rearms_always_push_the_deadline_out() {
        let mut wheel = Wheel::new();
        let handle = wheel.schedule(3, 1);
        for _ in 0..20 {
            assert!(wheel.tick().is_empty());
            assert!(wheel.reschedule(handle, 3));
        }
        // Stop re-arming; it fires within the last requested duration + 1.
        let fired = run_ticks(&mut wheel, 4);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn cancel_returns_payload_and_stales_the_handle() {
        let mut wheel = Wheel::new();
        let handle = wheel.schedule(5, 42);
        assert_eq!(wheel.cancel(handle), Some(42));
        assert_eq!(wheel.cancel(handle), None);
        assert!(!wheel.reschedule(handle, 5));
        assert!(run_ticks(&mut wheel, SLOTS).is_empty());
    }

    #[test]
    fn freed_entries_are_reused_without_confusing_handles() {
        let mut wheel = Wheel::new();
        let first = wheel.schedule(2, 1);
        wheel.cancel(first);
        let second = wheel.schedule(2, 2);
        // The recycled arena slot must not honor the stale handle.
        assert!(!wheel.reschedule(first, 50));
        let fired = run_ticks(&mut wheel, 3);
        assert_eq!(fired.iter().map(|&(_, p)| p).collect::<Vec<_>>(), vec![2]);
        assert!(wheel.cancel(second).is_none());
    }
}
